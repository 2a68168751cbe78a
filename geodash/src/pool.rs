//! Bounded connection pool with acquisition timeout.
//!
//! Thin layer over r2d2: connections are validated on checkout, checked with
//! `has_broken` when a lease is returned, and replaced when found broken. What
//! this adds is the split between "every connection is leased" (backpressure,
//! [`PoolError::Timeout`]) and "the backend is failing" ([`PoolError::Unavailable`]),
//! plus tracing for pool events.

use r2d2::{HandleError, HandleEvent, ManageConnection, Pool, PooledConnection};
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::PoolConfig;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("all {max_size} connections leased; gave up after {waited:?}")]
    Timeout { waited: Duration, max_size: u32 },
    #[error("connection pool unavailable: {0}")]
    Unavailable(String),
}

pub type PoolResult<T> = Result<T, PoolError>;

/// A leased connection. Dropping it returns it to the pool.
pub type Lease<M> = PooledConnection<M>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub total: u32,
    pub idle: u32,
    pub leased: u32,
    pub max_size: u32,
}

pub struct ConnectionPool<M: ManageConnection> {
    pool: Pool<M>,
    acquire_timeout: Duration,
    label: &'static str,
}

impl<M: ManageConnection> ConnectionPool<M> {
    /// Build the pool and open `min_size` connections up front.
    pub fn new(manager: M, config: &PoolConfig, label: &'static str) -> PoolResult<Self> {
        let max_size = config.max_size.max(1);
        let pool = Pool::builder()
            .max_size(max_size)
            .min_idle(Some(config.min_size.min(max_size)))
            .connection_timeout(config.acquire_timeout())
            .test_on_check_out(true)
            .error_handler(Box::new(TracingErrorHandler { label }))
            .event_handler(Box::new(TracingEventHandler { label }))
            .build(manager)
            .map_err(|e| PoolError::Unavailable(e.to_string()))?;

        debug!(pool = label, max_size, "Connection pool ready");
        Ok(Self {
            pool,
            acquire_timeout: config.acquire_timeout(),
            label,
        })
    }

    /// Lease a connection, waiting up to the configured timeout.
    pub fn acquire(&self) -> PoolResult<Lease<M>> {
        self.acquire_timeout(self.acquire_timeout)
    }

    /// Lease a connection, waiting up to `timeout`.
    pub fn acquire_timeout(&self, timeout: Duration) -> PoolResult<Lease<M>> {
        let started = Instant::now();
        self.pool.get_timeout(timeout).map_err(|e| {
            let waited = started.elapsed();
            let state = self.pool.state();
            let max_size = self.pool.max_size();
            if state.connections >= max_size && state.idle_connections == 0 {
                warn!(pool = self.label, ?waited, max_size, "Connection pool exhausted");
                PoolError::Timeout { waited, max_size }
            } else {
                warn!(pool = self.label, "Failed to acquire connection: {}", e);
                PoolError::Unavailable(e.to_string())
            }
        })
    }

    /// Return a lease early. Equivalent to dropping it.
    pub fn release(&self, lease: Lease<M>) {
        drop(lease);
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.pool.state();
        PoolStatus {
            total: state.connections,
            idle: state.idle_connections,
            leased: state.connections.saturating_sub(state.idle_connections),
            max_size: self.pool.max_size(),
        }
    }
}

impl<M: ManageConnection> fmt::Debug for ConnectionPool<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("label", &self.label)
            .field("status", &self.status())
            .field("acquire_timeout", &self.acquire_timeout)
            .finish()
    }
}

#[derive(Debug)]
struct TracingErrorHandler {
    label: &'static str,
}

impl<E: fmt::Display> HandleError<E> for TracingErrorHandler {
    fn handle_error(&self, error: E) {
        warn!(pool = self.label, "Connection error: {}", error);
    }
}

#[derive(Debug)]
struct TracingEventHandler {
    label: &'static str,
}

impl HandleEvent for TracingEventHandler {
    fn handle_acquire(&self, event: r2d2::event::AcquireEvent) {
        debug!(pool = self.label, connection = event.connection_id(), "Opened connection");
    }

    fn handle_release(&self, event: r2d2::event::ReleaseEvent) {
        debug!(
            pool = self.label,
            connection = event.connection_id(),
            age = ?event.age(),
            "Closed connection"
        );
    }

    fn handle_timeout(&self, event: r2d2::event::TimeoutEvent) {
        debug!(pool = self.label, timeout = ?event.timeout(), "Checkout timed out");
    }
}
