// 📥 Registration Importer - text CSV rows → enumerated registrations
//
// Expected header: year,make,model,model_year,fuel_type,vehicle_type
// fuel_type and vehicle_type may be empty (uncurated years often lack them).

use crate::db::{insert_registrations, RegistrationRecord};
use crate::enumeration::{Dimension, EnumerationCache, EnumerationStore};
use crate::error::Result;
use csv::{ReaderBuilder, Trim};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::{info, warn};

const DEFAULT_BATCH_SIZE: usize = 10_000;

#[derive(Debug, Clone, Deserialize)]
struct RegistrationRow {
    year: i64,
    make: String,
    model: String,
    model_year: String,
    #[serde(default)]
    fuel_type: Option<String>,
    #[serde(default)]
    vehicle_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportReport {
    pub rows_read: usize,
    pub rows_inserted: usize,
    /// (line number, reason)
    pub skipped: Vec<(usize, String)>,
}

pub struct RegistrationImporter {
    cache: EnumerationCache,
    batch_size: usize,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl RegistrationImporter {
    pub fn new() -> Self {
        RegistrationImporter {
            cache: EnumerationCache::new(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn import_file(&self, conn: &Connection, path: &Path) -> Result<ImportReport> {
        let file = File::open(path)?;
        let report = self.import_reader(conn, file)?;
        info!(
            "Imported {}: {} rows inserted, {} skipped",
            path.display(),
            report.rows_inserted,
            report.skipped.len()
        );
        Ok(report)
    }

    pub fn import_reader<R: Read>(&self, conn: &Connection, reader: R) -> Result<ImportReport> {
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .trim(Trim::All)
            .from_reader(reader);

        let store = EnumerationStore::new(conn);
        let mut report = ImportReport::default();
        let mut batch = Vec::with_capacity(self.batch_size);

        for (index, result) in reader.deserialize::<RegistrationRow>().enumerate() {
            // 1-indexed + header row
            let line = index + 2;
            report.rows_read += 1;

            let row = match result {
                Ok(row) => row,
                Err(e) => {
                    warn!("Skipping line {}: {}", line, e);
                    report.skipped.push((line, e.to_string()));
                    continue;
                }
            };

            match self.enumerate(&store, row) {
                Ok(record) => batch.push(record),
                Err(e) if e.is_rejection() => {
                    warn!("Skipping line {}: {}", line, e);
                    report.skipped.push((line, e.to_string()));
                    continue;
                }
                Err(e) => return Err(e),
            }

            if batch.len() >= self.batch_size {
                report.rows_inserted += insert_registrations(conn, &batch)?;
                batch.clear();
            }
        }

        if !batch.is_empty() {
            report.rows_inserted += insert_registrations(conn, &batch)?;
        }

        Ok(report)
    }

    fn enumerate(&self, store: &EnumerationStore<'_>, row: RegistrationRow) -> Result<RegistrationRecord> {
        let optional = |dimension, value: Option<String>| -> Result<Option<i64>> {
            non_empty(value)
                .map(|code| self.cache.resolve(store, dimension, &code))
                .transpose()
        };

        Ok(RegistrationRecord {
            year: row.year,
            make_id: self.cache.resolve(store, Dimension::Make, &row.make)?,
            model_id: self.cache.resolve(store, Dimension::Model, &row.model)?,
            model_year_id: self.cache.resolve(store, Dimension::ModelYear, &row.model_year)?,
            fuel_type_id: optional(Dimension::FuelType, row.fuel_type)?,
            vehicle_type_id: optional(Dimension::VehicleType, row.vehicle_type)?,
        })
    }
}

impl Default for RegistrationImporter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{registration_year_counts, setup_database, verify_count};

    const SAMPLE: &str = "\
year,make,model,model_year,fuel_type,vehicle_type
2021,JOHND,6300,2008,E,AU
2021, JOHND ,6300,2009,,AU
2023,JHOND,6330,2008,,
2023,,6330,2008,,
not-a-year,JHOND,6330,2008,,
";

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn
    }

    #[test]
    fn test_import_enumerates_and_inserts() {
        let conn = conn();
        let report = RegistrationImporter::new().import_reader(&conn, SAMPLE.as_bytes()).unwrap();

        assert_eq!(report.rows_read, 5);
        assert_eq!(report.rows_inserted, 3);
        assert_eq!(report.skipped.len(), 2);
        assert_eq!(report.skipped[0].0, 5);
        assert_eq!(verify_count(&conn).unwrap(), 3);
        assert_eq!(registration_year_counts(&conn).unwrap(), vec![(2021, 2), (2023, 1)]);

        let store = EnumerationStore::new(&conn);
        assert_eq!(store.all(Dimension::Make).unwrap().len(), 2);
        assert_eq!(store.all(Dimension::FuelType).unwrap().len(), 1);
    }

    #[test]
    fn test_missing_optional_fields_are_null() {
        let conn = conn();
        RegistrationImporter::new().import_reader(&conn, SAMPLE.as_bytes()).unwrap();

        let nulls: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM registrations WHERE fuel_type_id IS NULL AND vehicle_type_id IS NULL",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(nulls, 1);
    }

    #[test]
    fn test_small_batches_insert_everything() {
        let conn = conn();
        let report = RegistrationImporter::new()
            .with_batch_size(1)
            .import_reader(&conn, SAMPLE.as_bytes())
            .unwrap();

        assert_eq!(report.rows_inserted, 3);
        assert_eq!(verify_count(&conn).unwrap(), 3);
    }

    #[test]
    fn test_import_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registrations.csv");
        std::fs::write(&path, SAMPLE).unwrap();

        let conn = conn();
        let report = RegistrationImporter::new().import_file(&conn, &path).unwrap();
        assert_eq!(report.rows_inserted, 3);
    }
}
