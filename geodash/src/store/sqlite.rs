//! Embedded SQLite record store
//!
//! Readers share an r2d2 pool under WAL. With advanced indexing the store
//! also keeps an R*Tree over coordinates and a tantivy name index; both are
//! rebuilt on open when they disagree with the table.

use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

use super::indexer::PlaceIndex;
use super::{check_row, CandidateQuery, LoadOutcome, RecordStore, StoreError, StoreResult};
use crate::config::{DatabaseConfig, GeoDashConfig, PoolConfig};
use crate::models::{
    CountrySummary, GeoPoint, NearbyPlace, PlaceId, PlaceRecord, StateSummary, StoreStats,
};
use crate::pool::{ConnectionPool, Lease};
use crate::proximity::{haversine_km, BoundingBox};
use crate::ranking::by_distance;
use crate::text;

const BACKEND: &str = "sqlite";

const PLACE_COLUMNS: &str = "id, name, ascii_name, country_code, country_name, state_code, \
     state_name, latitude, longitude, population, search_rank";

const JOINED_PLACE_COLUMNS: &str = "p.id, p.name, p.ascii_name, p.country_code, p.country_name, \
     p.state_code, p.state_name, p.latitude, p.longitude, p.population, p.search_rank";

/// Upper bound of the folded alphabet; `prefix || '\x7f'` sorts after every
/// folded string starting with `prefix`.
const PREFIX_CEILING: char = '\x7f';

/// Ids bound per `IN (...)` lookup
const ID_CHUNK: usize = 500;

pub struct SqliteStore {
    pool: ConnectionPool<SqliteConnectionManager>,
    index: Option<PlaceIndex>,
    spatial: bool,
}

impl SqliteStore {
    /// Open or create the store described by `config.database`, which must
    /// name the SQLite backend.
    pub fn open(config: &GeoDashConfig) -> StoreResult<Self> {
        let DatabaseConfig::Sqlite { path, index_dir } = &config.database else {
            return Err(StoreError::Backend(format!(
                "expected the sqlite backend, got {}",
                config.database.backend_name()
            )));
        };
        let advanced = config.features.advanced_indexing;
        let shared_memory = config.features.shared_memory;

        let (manager, pool_config, index) = match path {
            Some(path) => {
                let manager = SqliteConnectionManager::file(path)
                    .with_init(move |conn| init_connection(conn, shared_memory));
                let index = if advanced {
                    let dir = index_dir.clone().unwrap_or_else(|| default_index_dir(path));
                    Some(PlaceIndex::open(&dir)?)
                } else {
                    None
                };
                (manager, config.pool, index)
            }
            None => {
                let manager = SqliteConnectionManager::memory()
                    .with_init(move |conn| init_connection(conn, false));
                // In-memory needs single connection to maintain state
                let pool_config = PoolConfig {
                    min_size: 1,
                    max_size: 1,
                    ..config.pool
                };
                let index = if advanced {
                    Some(PlaceIndex::in_memory()?)
                } else {
                    None
                };
                (manager, pool_config, index)
            }
        };

        let pool = ConnectionPool::new(manager, &pool_config, BACKEND)?;
        let store = Self {
            pool,
            index,
            spatial: advanced,
        };
        store.setup_schema()?;
        store.rebuild_indexes_if_needed()?;

        info!(
            path = ?path,
            spatial = store.spatial,
            text_index = store.index.is_some(),
            "Opened SQLite store"
        );
        Ok(store)
    }

    /// In-memory store with default settings
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::open(&GeoDashConfig::default())
    }

    fn conn(&self) -> StoreResult<Lease<SqliteConnectionManager>> {
        Ok(self.pool.acquire()?)
    }

    pub fn pool(&self) -> &ConnectionPool<SqliteConnectionManager> {
        &self.pool
    }

    fn setup_schema(&self) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS places (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                ascii_name TEXT NOT NULL,
                folded_name TEXT NOT NULL,
                folded_ascii TEXT NOT NULL,
                country_code TEXT NOT NULL,
                country_name TEXT,
                state_code TEXT,
                state_name TEXT,
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                population INTEGER,
                search_rank REAL
            );

            CREATE INDEX IF NOT EXISTS idx_places_folded ON places(folded_name);
            CREATE INDEX IF NOT EXISTS idx_places_folded_ascii ON places(folded_ascii);
            CREATE INDEX IF NOT EXISTS idx_places_region ON places(country_code, state_code);
            "#,
        )?;
        if self.spatial {
            conn.execute_batch(
                "CREATE VIRTUAL TABLE IF NOT EXISTS places_rtree \
                 USING rtree(id, min_lat, max_lat, min_lon, max_lon);",
            )?;
        }
        Ok(())
    }

    fn rebuild_indexes_if_needed(&self) -> StoreResult<()> {
        let conn = self.conn()?;
        let places = count(&conn, "SELECT COUNT(*) FROM places")?;

        if self.spatial {
            let indexed = count(&conn, "SELECT COUNT(*) FROM places_rtree")?;
            if indexed != places {
                info!(places, indexed, "Rebuilding spatial index");
                conn.execute_batch(
                    "DELETE FROM places_rtree;
                     INSERT INTO places_rtree
                         SELECT id, latitude, latitude, longitude, longitude FROM places;",
                )?;
            }
        }

        if let Some(index) = &self.index {
            let indexed = index.num_docs();
            if indexed != places {
                info!(places, indexed, "Rebuilding name index");
                index.clear()?;
                let mut stmt = conn.prepare(&format!("SELECT {PLACE_COLUMNS} FROM places"))?;
                let rows = stmt.query_map([], place_from_row)?;
                for row in rows {
                    index.add_place(&row?)?;
                }
                index.commit()?;
            }
        }
        Ok(())
    }

    fn prefix_scan(&self, conn: &Connection, query: &CandidateQuery) -> StoreResult<Vec<PlaceRecord>> {
        let prefix = if query.fuzzy {
            text::prefix(&query.text, 2)
        } else {
            query.text.as_str()
        };
        let ceiling = format!("{prefix}{PREFIX_CEILING}");

        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {PLACE_COLUMNS} FROM places
             WHERE ((folded_name >= ?1 AND folded_name < ?2)
                 OR (folded_ascii >= ?1 AND folded_ascii < ?2))
               AND (?3 IS NULL OR country_code = ?3)
             ORDER BY population DESC, id
             LIMIT ?4"
        ))?;
        let rows = stmt
            .query_map(
                params![prefix, ceiling, query.country, query.limit as i64],
                place_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn fetch_by_ids(&self, conn: &Connection, ids: &[PlaceId]) -> StoreResult<Vec<PlaceRecord>> {
        let mut places = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(ID_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            let mut stmt = conn.prepare(&format!(
                "SELECT {PLACE_COLUMNS} FROM places WHERE id IN ({placeholders})"
            ))?;
            let rows = stmt.query_map(params_from_iter(chunk.iter().map(|id| id.0)), place_from_row)?;
            for row in rows {
                places.push(row?);
            }
        }
        Ok(places)
    }
}

impl RecordStore for SqliteStore {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    #[instrument(skip(self), fields(text = %query.text, country = ?query.country))]
    fn candidates(&self, query: &CandidateQuery) -> StoreResult<Vec<PlaceRecord>> {
        let conn = self.conn()?;
        let places = match &self.index {
            Some(index) if query.fuzzy && PlaceIndex::can_serve(&query.text) => {
                let ids = index.search(&query.text, query.country.as_deref(), query.limit)?;
                self.fetch_by_ids(&conn, &ids)?
            }
            _ => self.prefix_scan(&conn, query)?,
        };
        debug!(count = places.len(), "Retrieved candidates");
        Ok(places)
    }

    fn nearby(&self, center: GeoPoint, radius_km: f64, limit: usize) -> StoreResult<Vec<NearbyPlace>> {
        if !self.spatial {
            return Err(StoreError::Unsupported(BACKEND, "nearby"));
        }
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {JOINED_PLACE_COLUMNS} FROM places_rtree r
             JOIN places p ON p.id = r.id
             WHERE r.max_lat >= ?1 AND r.min_lat <= ?2
               AND r.max_lon >= ?3 AND r.min_lon <= ?4"
        ))?;

        let mut seen = HashSet::new();
        let mut found = Vec::new();
        for bbox in BoundingBox::around(center, radius_km) {
            let rows = stmt.query_map(
                params![bbox.min_lat, bbox.max_lat, bbox.min_lon, bbox.max_lon],
                place_from_row,
            )?;
            for row in rows {
                let place = row?;
                let distance_km = haversine_km(center, place.location());
                if distance_km <= radius_km && seen.insert(place.id) {
                    found.push(NearbyPlace { place, distance_km });
                }
            }
        }

        found.sort_by(by_distance);
        found.truncate(limit);
        Ok(found)
    }

    fn get(&self, id: PlaceId) -> StoreResult<Option<PlaceRecord>> {
        let conn = self.conn()?;
        let place = conn
            .query_row(
                &format!("SELECT {PLACE_COLUMNS} FROM places WHERE id = ?1"),
                [id.0],
                place_from_row,
            )
            .optional()?;
        Ok(place)
    }

    fn countries(&self) -> StoreResult<Vec<CountrySummary>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT country_code, MAX(country_name), COUNT(*) FROM places
             GROUP BY country_code
             ORDER BY COALESCE(MAX(country_name), country_code)",
        )?;
        let countries = stmt
            .query_map([], |row| {
                Ok(CountrySummary {
                    code: row.get(0)?,
                    name: row.get(1)?,
                    places: row.get::<_, i64>(2)? as u64,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(countries)
    }

    fn states(&self, country: &str) -> StoreResult<Vec<StateSummary>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT state_code, MAX(state_name), COUNT(*) FROM places
             WHERE country_code = ?1 COLLATE NOCASE OR country_name = ?1 COLLATE NOCASE
             GROUP BY state_code
             ORDER BY COALESCE(MAX(state_name), state_code)",
        )?;
        let states = stmt
            .query_map([country.trim()], |row| {
                Ok(StateSummary {
                    code: row.get(0)?,
                    name: row.get(1)?,
                    places: row.get::<_, i64>(2)? as u64,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(states)
    }

    fn cities_in_state(&self, state: &str, country: &str) -> StoreResult<Vec<PlaceRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {PLACE_COLUMNS} FROM places
             WHERE (country_code = ?2 COLLATE NOCASE OR country_name = ?2 COLLATE NOCASE)
               AND (state_code = ?1 COLLATE NOCASE OR state_name = ?1 COLLATE NOCASE)
             ORDER BY name, id"
        ))?;
        let places = stmt
            .query_map([state.trim(), country.trim()], place_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(places)
    }

    fn stats(&self) -> StoreResult<StoreStats> {
        let conn = self.conn()?;
        Ok(StoreStats {
            backend: BACKEND.to_string(),
            places: count(&conn, "SELECT COUNT(*) FROM places")?,
            countries: count(&conn, "SELECT COUNT(DISTINCT country_code) FROM places")?,
            spatial_index: self.spatial,
            text_index: self.index.is_some(),
        })
    }

    #[instrument(skip_all, fields(rows = rows.len()))]
    fn bulk_load(&self, rows: &[PlaceRecord]) -> StoreResult<LoadOutcome> {
        let mut outcome = LoadOutcome::default();
        let mut loaded = Vec::with_capacity(rows.len());

        let mut conn = self.conn()?;
        let mut tx = conn.transaction()?;
        for row in rows {
            if let Err(reason) = check_row(row) {
                outcome.failed.push((row.id, reason));
                continue;
            }
            let sp = tx.savepoint()?;
            match upsert_row(&sp, row, self.spatial) {
                Ok(()) => {
                    sp.commit()?;
                    loaded.push(row);
                }
                Err(e) => {
                    warn!(id = %row.id, "Failed to load row: {}", e);
                    outcome.failed.push((row.id, e.to_string()));
                }
            }
        }
        tx.commit()?;
        drop(conn);

        if let Some(index) = &self.index {
            for row in &loaded {
                index.add_place(row)?;
            }
            index.commit()?;
        }

        outcome.loaded = loaded.len();
        debug!(loaded = outcome.loaded, failed = outcome.failed.len(), "Bulk load finished");
        Ok(outcome)
    }

    fn supports_spatial(&self) -> bool {
        self.spatial
    }
}

fn init_connection(conn: &mut Connection, shared_memory: bool) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        PRAGMA cache_size=-32000;
        PRAGMA busy_timeout=5000;
    ",
    )?;
    if shared_memory {
        conn.execute_batch("PRAGMA mmap_size=268435456;")?;
    }
    Ok(())
}

fn default_index_dir(db_path: &Path) -> PathBuf {
    let mut dir = db_path.as_os_str().to_owned();
    dir.push(".index");
    PathBuf::from(dir)
}

fn count(conn: &Connection, sql: &str) -> StoreResult<u64> {
    let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
    Ok(n as u64)
}

fn upsert_row(conn: &Connection, row: &PlaceRecord, spatial: bool) -> rusqlite::Result<()> {
    conn.prepare_cached(
        "INSERT OR REPLACE INTO places (
             id, name, ascii_name, folded_name, folded_ascii, country_code, country_name,
             state_code, state_name, latitude, longitude, population, search_rank
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
    )?
    .execute(params![
        row.id.0,
        row.name,
        row.ascii_name,
        text::fold(&row.name),
        text::fold(&row.ascii_name),
        text::normalize_country(&row.country_code),
        row.country_name,
        row.state_code,
        row.state_name,
        row.latitude,
        row.longitude,
        row.population,
        row.search_rank,
    ])?;

    if spatial {
        conn.prepare_cached("DELETE FROM places_rtree WHERE id = ?1")?
            .execute([row.id.0])?;
        conn.prepare_cached("INSERT INTO places_rtree VALUES (?1, ?2, ?2, ?3, ?3)")?
            .execute(params![row.id.0, row.latitude, row.longitude])?;
    }
    Ok(())
}

fn place_from_row(row: &Row<'_>) -> rusqlite::Result<PlaceRecord> {
    Ok(PlaceRecord {
        id: PlaceId(row.get(0)?),
        name: row.get(1)?,
        ascii_name: row.get(2)?,
        country_code: row.get(3)?,
        country_name: row.get(4)?,
        state_code: row.get(5)?,
        state_name: row.get(6)?,
        latitude: row.get(7)?,
        longitude: row.get(8)?,
        population: row.get(9)?,
        search_rank: row.get(10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn place(id: i64, name: &str, country: &str, state: &str, lat: f64, lon: f64, pop: i64) -> PlaceRecord {
        PlaceRecord {
            id: PlaceId(id),
            name: name.into(),
            ascii_name: deunicode::deunicode(name),
            country_code: country.into(),
            country_name: Some(format!("Country {country}")),
            state_code: Some(state.into()),
            state_name: Some(format!("State {state}")),
            latitude: lat,
            longitude: lon,
            population: Some(pop),
            search_rank: None,
        }
    }

    fn seeded(config: &GeoDashConfig) -> SqliteStore {
        let store = SqliteStore::open(config).unwrap();
        store
            .bulk_load(&[
                place(1, "London", "GB", "ENG", 51.5074, -0.1278, 8_900_000),
                place(2, "London", "CA", "ON", 42.9849, -81.2453, 400_000),
                place(3, "Paris", "FR", "IDF", 48.8566, 2.3522, 2_100_000),
                place(4, "Versailles", "FR", "IDF", 48.8049, 2.1204, 85_000),
                place(5, "Lomé", "TG", "M", 6.1319, 1.2228, 837_000),
            ])
            .unwrap();
        store
    }

    fn query(text: &str, fuzzy: bool) -> CandidateQuery {
        CandidateQuery {
            text: text.into(),
            country: None,
            limit: 100,
            fuzzy,
        }
    }

    fn ids(places: &[PlaceRecord]) -> Vec<i64> {
        let mut ids: Vec<i64> = places.iter().map(|p| p.id.0).collect();
        ids.sort();
        ids
    }

    #[test]
    fn test_indexed_candidates_tolerate_typos() {
        let store = seeded(&GeoDashConfig::default());
        let found = store.candidates(&query("londn", true)).unwrap();
        assert_eq!(ids(&found), vec![1, 2]);
    }

    #[test]
    fn test_short_query_uses_prefix_scan() {
        let store = seeded(&GeoDashConfig::default());
        let found = store.candidates(&query("lo", true)).unwrap();
        assert_eq!(ids(&found), vec![1, 2, 5]);
    }

    #[test]
    fn test_candidates_respect_country_and_limit() {
        let store = seeded(&GeoDashConfig::default());
        let mut q = query("london", true);
        q.country = Some("CA".into());
        assert_eq!(ids(&store.candidates(&q).unwrap()), vec![2]);

        let mut q = query("lo", true);
        q.limit = 1;
        let found = store.candidates(&q).unwrap();
        assert_eq!(ids(&found), vec![1], "highest population first");
    }

    #[test]
    fn test_simple_mode_falls_back_to_prefix_scan() {
        let mut config = GeoDashConfig::default();
        config.mode = crate::config::Mode::Simple;
        let store = seeded(&config.resolve().unwrap());

        assert!(!store.supports_spatial());
        assert_eq!(ids(&store.candidates(&query("lond", false)).unwrap()), vec![1, 2]);
        assert!(store.candidates(&query("londn", false)).unwrap().is_empty());
        assert!(matches!(
            store.nearby(GeoPoint { lat: 0.0, lon: 0.0 }, 10.0, 5),
            Err(StoreError::Unsupported("sqlite", "nearby"))
        ));
        let stats = store.stats().unwrap();
        assert!(!stats.text_index);
        assert!(!stats.spatial_index);
    }

    #[test]
    fn test_nearby_sorted_by_distance() {
        let store = seeded(&GeoDashConfig::default());
        let found = store
            .nearby(GeoPoint { lat: 48.85, lon: 2.35 }, 50.0, 10)
            .unwrap();
        let ids: Vec<i64> = found.iter().map(|n| n.place.id.0).collect();
        assert_eq!(ids, vec![3, 4]);
        assert!(found[0].distance_km < found[1].distance_km);

        let found = store
            .nearby(GeoPoint { lat: 48.85, lon: 2.35 }, 50.0, 1)
            .unwrap();
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn test_bulk_load_is_idempotent_and_reports_bad_rows() {
        let store = seeded(&GeoDashConfig::default());
        let bad = place(9, "Nowhere", "XX", "X", 95.0, 0.0, 1);
        let outcome = store
            .bulk_load(&[place(3, "Paris", "FR", "IDF", 48.8566, 2.3522, 2_100_000), bad])
            .unwrap();

        assert_eq!(outcome.loaded, 1);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].0, PlaceId(9));
        assert_eq!(store.stats().unwrap().places, 5);
    }

    #[test]
    fn test_listings() {
        let store = seeded(&GeoDashConfig::default());

        let countries = store.countries().unwrap();
        assert_eq!(countries.len(), 4);
        let fr = countries.iter().find(|c| c.code == "FR").unwrap();
        assert_eq!(fr.places, 2);

        let states = store.states("fr").unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].code.as_deref(), Some("IDF"));
        assert_eq!(store.states("Country FR").unwrap(), states);

        let cities = store.cities_in_state("IDF", "FR").unwrap();
        let names: Vec<&str> = cities.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Paris", "Versailles"]);

        assert_eq!(store.get(PlaceId(5)).unwrap().unwrap().name, "Lomé");
        assert!(store.get(PlaceId(42)).unwrap().is_none());
    }

    #[test]
    fn test_indexes_rebuilt_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("cities.db");
        let config = GeoDashConfig::default().with_sqlite_path(&db);
        drop(seeded(&config));

        // losing the name index forces a rebuild from the table
        std::fs::remove_dir_all(default_index_dir(&db)).unwrap();
        let store = SqliteStore::open(&config).unwrap();
        assert_eq!(ids(&store.candidates(&query("paris", true)).unwrap()), vec![3]);
        assert_eq!(store.stats().unwrap().places, 5);
    }
}
