//! Networked PostgreSQL record store
//!
//! PostGIS `geography` points behind a GiST index serve radius queries;
//! `pg_trgm` GIN indexes on the folded names serve coarse text retrieval.
//! Every call leases a client from the shared [`ConnectionPool`].

use postgres::{NoTls, Row};
use r2d2_postgres::PostgresConnectionManager;
use tracing::{debug, info, instrument, warn};

use super::{check_row, CandidateQuery, LoadOutcome, RecordStore, StoreError, StoreResult};
use crate::config::{DatabaseConfig, GeoDashConfig};
use crate::models::{
    CountrySummary, GeoPoint, NearbyPlace, PlaceId, PlaceRecord, StateSummary, StoreStats,
};
use crate::pool::{ConnectionPool, Lease};
use crate::ranking::by_distance;
use crate::text;

const BACKEND: &str = "postgres";

const PLACE_COLUMNS: &str = "id, name, ascii_name, country_code, country_name, state_code, \
     state_name, latitude, longitude, population, search_rank";

type Manager = PostgresConnectionManager<NoTls>;

pub struct PostgresStore {
    pool: ConnectionPool<Manager>,
    spatial: bool,
}

impl PostgresStore {
    pub fn open(config: &GeoDashConfig) -> StoreResult<Self> {
        let DatabaseConfig::Postgres { url } = &config.database else {
            return Err(StoreError::Backend(format!(
                "expected the postgres backend, got {}",
                config.database.backend_name()
            )));
        };
        let pg_config: postgres::Config = url
            .parse()
            .map_err(|e: postgres::Error| StoreError::Backend(format!("bad database url: {e}")))?;

        let pool = ConnectionPool::new(
            PostgresConnectionManager::new(pg_config, NoTls),
            &config.pool,
            BACKEND,
        )?;
        let store = Self {
            pool,
            spatial: config.features.advanced_indexing,
        };
        store.setup_schema()?;
        info!(spatial = store.spatial, "Opened PostgreSQL store");
        Ok(store)
    }

    fn conn(&self) -> StoreResult<Lease<Manager>> {
        Ok(self.pool.acquire()?)
    }

    pub fn pool(&self) -> &ConnectionPool<Manager> {
        &self.pool
    }

    fn setup_schema(&self) -> StoreResult<()> {
        let mut client = self.conn()?;
        client.batch_execute(
            r#"
            CREATE EXTENSION IF NOT EXISTS postgis;
            CREATE EXTENSION IF NOT EXISTS pg_trgm;

            CREATE TABLE IF NOT EXISTS places (
                id BIGINT PRIMARY KEY,
                name TEXT NOT NULL,
                ascii_name TEXT NOT NULL,
                folded_name TEXT NOT NULL,
                folded_ascii TEXT NOT NULL,
                country_code TEXT NOT NULL,
                country_name TEXT,
                state_code TEXT,
                state_name TEXT,
                latitude DOUBLE PRECISION NOT NULL,
                longitude DOUBLE PRECISION NOT NULL,
                population BIGINT,
                search_rank DOUBLE PRECISION,
                geog geography(Point, 4326) NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_places_geog ON places USING GIST (geog);
            CREATE INDEX IF NOT EXISTS idx_places_folded_trgm
                ON places USING GIN (folded_name gin_trgm_ops);
            CREATE INDEX IF NOT EXISTS idx_places_folded_ascii_trgm
                ON places USING GIN (folded_ascii gin_trgm_ops);
            CREATE INDEX IF NOT EXISTS idx_places_folded_prefix
                ON places (folded_name text_pattern_ops);
            CREATE INDEX IF NOT EXISTS idx_places_region ON places (country_code, state_code);
            "#,
        )?;
        Ok(())
    }
}

impl RecordStore for PostgresStore {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    #[instrument(skip(self), fields(text = %query.text, country = ?query.country))]
    fn candidates(&self, query: &CandidateQuery) -> StoreResult<Vec<PlaceRecord>> {
        let mut client = self.conn()?;
        let limit = query.limit as i64;
        let country = query.country.as_deref();

        let rows = if query.fuzzy {
            let pattern = format!("{}%", escape_like(text::prefix(&query.text, 2)));
            client.query(
                &format!(
                    "SELECT {PLACE_COLUMNS} FROM places
                     WHERE ($2::text IS NULL OR country_code = $2)
                       AND (folded_name % $1 OR folded_ascii % $1
                            OR folded_name LIKE $3 OR folded_ascii LIKE $3)
                     ORDER BY GREATEST(similarity(folded_name, $1), similarity(folded_ascii, $1)) DESC,
                              population DESC NULLS LAST, id
                     LIMIT $4"
                ),
                &[&query.text, &country, &pattern, &limit],
            )?
        } else {
            let pattern = format!("{}%", escape_like(&query.text));
            client.query(
                &format!(
                    "SELECT {PLACE_COLUMNS} FROM places
                     WHERE ($1::text IS NULL OR country_code = $1)
                       AND (folded_name LIKE $2 OR folded_ascii LIKE $2)
                     ORDER BY population DESC NULLS LAST, id
                     LIMIT $3"
                ),
                &[&country, &pattern, &limit],
            )?
        };

        let places = rows.iter().map(place_from_row).collect::<Result<Vec<_>, _>>()?;
        debug!(count = places.len(), "Retrieved candidates");
        Ok(places)
    }

    fn nearby(&self, center: GeoPoint, radius_km: f64, limit: usize) -> StoreResult<Vec<NearbyPlace>> {
        if !self.spatial {
            return Err(StoreError::Unsupported(BACKEND, "nearby"));
        }
        let mut client = self.conn()?;
        let rows = client.query(
            &format!(
                "SELECT {PLACE_COLUMNS},
                        ST_Distance(geog, ST_SetSRID(ST_MakePoint($2, $1), 4326)::geography) / 1000.0
                 FROM places
                 WHERE ST_DWithin(geog, ST_SetSRID(ST_MakePoint($2, $1), 4326)::geography, $3)
                 ORDER BY geog <-> ST_SetSRID(ST_MakePoint($2, $1), 4326)::geography, id
                 LIMIT $4"
            ),
            &[&center.lat, &center.lon, &(radius_km * 1000.0), &(limit as i64)],
        )?;

        let mut found = Vec::with_capacity(rows.len());
        for row in &rows {
            found.push(NearbyPlace {
                place: place_from_row(row)?,
                distance_km: row.try_get(11)?,
            });
        }
        found.sort_by(by_distance);
        Ok(found)
    }

    fn get(&self, id: PlaceId) -> StoreResult<Option<PlaceRecord>> {
        let mut client = self.conn()?;
        let row = client.query_opt(
            &format!("SELECT {PLACE_COLUMNS} FROM places WHERE id = $1"),
            &[&id.0],
        )?;
        Ok(row.as_ref().map(place_from_row).transpose()?)
    }

    fn countries(&self) -> StoreResult<Vec<CountrySummary>> {
        let mut client = self.conn()?;
        let rows = client.query(
            "SELECT country_code, MAX(country_name), COUNT(*) FROM places
             GROUP BY country_code
             ORDER BY COALESCE(MAX(country_name), country_code)",
            &[],
        )?;
        let mut countries = Vec::with_capacity(rows.len());
        for row in &rows {
            countries.push(CountrySummary {
                code: row.try_get(0)?,
                name: row.try_get(1)?,
                places: row.try_get::<_, i64>(2)? as u64,
            });
        }
        Ok(countries)
    }

    fn states(&self, country: &str) -> StoreResult<Vec<StateSummary>> {
        let mut client = self.conn()?;
        let rows = client.query(
            "SELECT state_code, MAX(state_name), COUNT(*) FROM places
             WHERE lower(country_code) = lower($1) OR lower(country_name) = lower($1)
             GROUP BY state_code
             ORDER BY COALESCE(MAX(state_name), state_code)",
            &[&country.trim()],
        )?;
        let mut states = Vec::with_capacity(rows.len());
        for row in &rows {
            states.push(StateSummary {
                code: row.try_get(0)?,
                name: row.try_get(1)?,
                places: row.try_get::<_, i64>(2)? as u64,
            });
        }
        Ok(states)
    }

    fn cities_in_state(&self, state: &str, country: &str) -> StoreResult<Vec<PlaceRecord>> {
        let mut client = self.conn()?;
        let rows = client.query(
            &format!(
                "SELECT {PLACE_COLUMNS} FROM places
                 WHERE (lower(country_code) = lower($2) OR lower(country_name) = lower($2))
                   AND (lower(state_code) = lower($1) OR lower(state_name) = lower($1))
                 ORDER BY name, id"
            ),
            &[&state.trim(), &country.trim()],
        )?;
        Ok(rows.iter().map(place_from_row).collect::<Result<Vec<_>, _>>()?)
    }

    fn stats(&self) -> StoreResult<StoreStats> {
        let mut client = self.conn()?;
        let row = client.query_one(
            "SELECT COUNT(*), COUNT(DISTINCT country_code) FROM places",
            &[],
        )?;
        Ok(StoreStats {
            backend: BACKEND.to_string(),
            places: row.try_get::<_, i64>(0)? as u64,
            countries: row.try_get::<_, i64>(1)? as u64,
            spatial_index: self.spatial,
            text_index: true,
        })
    }

    #[instrument(skip_all, fields(rows = rows.len()))]
    fn bulk_load(&self, rows: &[PlaceRecord]) -> StoreResult<LoadOutcome> {
        let mut outcome = LoadOutcome::default();
        let mut client = self.conn()?;
        let mut tx = client.transaction()?;
        let upsert = tx.prepare(
            "INSERT INTO places (
                 id, name, ascii_name, folded_name, folded_ascii, country_code, country_name,
                 state_code, state_name, latitude, longitude, population, search_rank, geog
             ) VALUES (
                 $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                 ST_SetSRID(ST_MakePoint($11, $10), 4326)::geography
             )
             ON CONFLICT (id) DO UPDATE SET
                 name = EXCLUDED.name,
                 ascii_name = EXCLUDED.ascii_name,
                 folded_name = EXCLUDED.folded_name,
                 folded_ascii = EXCLUDED.folded_ascii,
                 country_code = EXCLUDED.country_code,
                 country_name = EXCLUDED.country_name,
                 state_code = EXCLUDED.state_code,
                 state_name = EXCLUDED.state_name,
                 latitude = EXCLUDED.latitude,
                 longitude = EXCLUDED.longitude,
                 population = EXCLUDED.population,
                 search_rank = EXCLUDED.search_rank,
                 geog = EXCLUDED.geog",
        )?;

        for row in rows {
            if let Err(reason) = check_row(row) {
                outcome.failed.push((row.id, reason));
                continue;
            }
            let mut sp = tx.savepoint("place_row")?;
            let result = sp.execute(
                &upsert,
                &[
                    &row.id.0,
                    &row.name,
                    &row.ascii_name,
                    &text::fold(&row.name),
                    &text::fold(&row.ascii_name),
                    &text::normalize_country(&row.country_code),
                    &row.country_name,
                    &row.state_code,
                    &row.state_name,
                    &row.latitude,
                    &row.longitude,
                    &row.population,
                    &row.search_rank,
                ],
            );
            match result {
                Ok(_) => {
                    sp.commit()?;
                    outcome.loaded += 1;
                }
                Err(e) => {
                    warn!(id = %row.id, "Failed to load row: {}", e);
                    outcome.failed.push((row.id, e.to_string()));
                }
            }
        }
        tx.commit()?;

        debug!(loaded = outcome.loaded, failed = outcome.failed.len(), "Bulk load finished");
        Ok(outcome)
    }

    fn supports_spatial(&self) -> bool {
        self.spatial
    }
}

/// Escape LIKE metacharacters so folded text matches literally.
fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn place_from_row(row: &Row) -> Result<PlaceRecord, postgres::Error> {
    Ok(PlaceRecord {
        id: PlaceId(row.try_get(0)?),
        name: row.try_get(1)?,
        ascii_name: row.try_get(2)?,
        country_code: row.try_get(3)?,
        country_name: row.try_get(4)?,
        state_code: row.try_get(5)?,
        state_name: row.try_get(6)?,
        latitude: row.try_get(7)?,
        longitude: row.try_get(8)?,
        population: row.try_get(9)?,
        search_rank: row.try_get(10)?,
    })
}
