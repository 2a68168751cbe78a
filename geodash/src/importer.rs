//! CSV gazetteer import
//!
//! Reads the countries-states-cities `cities.csv` layout:
//!
//! ```text
//! id,name,state_id,state_code,state_name,country_id,country_code,country_name,latitude,longitude,wikiDataId
//! ```
//!
//! Optional `ascii_name`, `population` and `search_rank` columns are picked up
//! when present. Bad rows are reported with their line number and never abort
//! the import; loading is an upsert by id, so re-running is harmless.

use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::models::{PlaceId, PlaceRecord};
use crate::store::{RecordStore, StoreError};
use crate::text;

pub const DEFAULT_BATCH_SIZE: usize = 5_000;

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct ImportOptions {
    /// Only import these countries (ISO2); empty imports everything
    pub countries: Vec<String>,
    pub batch_size: usize,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            countries: Vec::new(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowFailure {
    /// 1-based line in the source file
    pub line: u64,
    pub id: Option<PlaceId>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    /// Data rows read
    pub read: usize,
    pub loaded: usize,
    /// Rows outside the country filter
    pub skipped: usize,
    pub failures: Vec<RowFailure>,
}

#[derive(Debug, Deserialize)]
struct CityRow {
    id: i64,
    name: String,
    #[serde(default)]
    state_code: Option<String>,
    #[serde(default)]
    state_name: Option<String>,
    country_code: String,
    #[serde(default)]
    country_name: Option<String>,
    latitude: f64,
    longitude: f64,
    #[serde(default)]
    ascii_name: Option<String>,
    #[serde(default)]
    population: Option<i64>,
    #[serde(default)]
    search_rank: Option<f64>,
}

impl CityRow {
    fn into_record(self) -> Result<PlaceRecord, String> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err("empty name".into());
        }
        let country_code = text::normalize_country(&self.country_code);
        if country_code.len() != 2 || !country_code.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(format!("bad country code {:?}", self.country_code));
        }
        let record = PlaceRecord {
            id: PlaceId(self.id),
            ascii_name: self
                .ascii_name
                .filter(|a| !a.trim().is_empty())
                .unwrap_or_else(|| deunicode::deunicode(&name)),
            name,
            country_code,
            country_name: self.country_name,
            state_code: self.state_code,
            state_name: self.state_name,
            latitude: self.latitude,
            longitude: self.longitude,
            population: self.population,
            search_rank: self.search_rank,
        };
        if !record.location().is_valid() {
            return Err(format!(
                "invalid coordinates ({}, {})",
                record.latitude, record.longitude
            ));
        }
        Ok(record)
    }
}

pub struct CsvImporter {
    countries: HashSet<String>,
    batch_size: usize,
}

impl CsvImporter {
    pub fn new(options: ImportOptions) -> Self {
        Self {
            countries: options
                .countries
                .iter()
                .map(|c| text::normalize_country(c))
                .filter(|c| !c.is_empty())
                .collect(),
            batch_size: options.batch_size.max(1),
        }
    }

    pub fn import_path(&self, path: &Path, store: &dyn RecordStore) -> Result<ImportReport, ImportError> {
        self.import_path_with_progress(path, store, |_| {})
    }

    /// Import `path`, calling `on_batch` with the running report after each batch.
    #[instrument(skip(self, store, on_batch), fields(path = %path.display()))]
    pub fn import_path_with_progress<F>(
        &self,
        path: &Path,
        store: &dyn RecordStore,
        on_batch: F,
    ) -> Result<ImportReport, ImportError>
    where
        F: FnMut(&ImportReport),
    {
        let file = std::fs::File::open(path)?;
        let report = self.import_reader(file, store, on_batch)?;
        info!(
            read = report.read,
            loaded = report.loaded,
            skipped = report.skipped,
            failed = report.failures.len(),
            "Import finished"
        );
        Ok(report)
    }

    pub fn import_reader<R, F>(
        &self,
        reader: R,
        store: &dyn RecordStore,
        mut on_batch: F,
    ) -> Result<ImportReport, ImportError>
    where
        R: io::Read,
        F: FnMut(&ImportReport),
    {
        let mut csv = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(reader);
        let headers = csv.headers()?.clone();

        let mut report = ImportReport::default();
        let mut batch: Vec<PlaceRecord> = Vec::with_capacity(self.batch_size);
        let mut lines: HashMap<PlaceId, u64> = HashMap::new();

        for result in csv.records() {
            let row = match result {
                Ok(row) => row,
                Err(e) => {
                    report.read += 1;
                    report.failures.push(RowFailure {
                        line: e.position().map_or(0, |p| p.line()),
                        id: None,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            report.read += 1;
            let line = row.position().map_or(0, |p| p.line());

            let parsed = row
                .deserialize::<CityRow>(Some(&headers))
                .map_err(|e| e.to_string())
                .and_then(CityRow::into_record);
            let record = match parsed {
                Ok(record) => record,
                Err(reason) => {
                    debug!(line, "Rejected row: {}", reason);
                    report.failures.push(RowFailure {
                        line,
                        id: row.get(0).and_then(|id| id.parse().ok()).map(PlaceId),
                        reason,
                    });
                    continue;
                }
            };

            if !self.countries.is_empty() && !self.countries.contains(&record.country_code) {
                report.skipped += 1;
                continue;
            }

            lines.insert(record.id, line);
            batch.push(record);
            if batch.len() >= self.batch_size {
                self.flush(&mut batch, &mut lines, store, &mut report)?;
                on_batch(&report);
            }
        }

        if !batch.is_empty() {
            self.flush(&mut batch, &mut lines, store, &mut report)?;
            on_batch(&report);
        }
        Ok(report)
    }

    fn flush(
        &self,
        batch: &mut Vec<PlaceRecord>,
        lines: &mut HashMap<PlaceId, u64>,
        store: &dyn RecordStore,
        report: &mut ImportReport,
    ) -> Result<(), ImportError> {
        let outcome = store.bulk_load(batch)?;
        report.loaded += outcome.loaded;
        for (id, reason) in outcome.failed {
            report.failures.push(RowFailure {
                line: lines.get(&id).copied().unwrap_or(0),
                id: Some(id),
                reason,
            });
        }
        debug!(loaded = report.loaded, "Flushed import batch");
        batch.clear();
        lines.clear();
        Ok(())
    }
}
