use crate::error::{RegularizationError, Result};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Busy timeout applied to every connection (population can hold the write lock for a while)
const BUSY_TIMEOUT_MS: u64 = 5000;

pub const CANONICAL_HIERARCHY_CACHE: &str = "canonical_hierarchy_cache";
pub const UNCURATED_PAIRS_CACHE: &str = "uncurated_pairs_cache";

/// Bumped whenever a cache table's shape changes
pub const CACHE_SCHEMA_VERSION: i64 = 2;

/// One raw registration row, already enumerated by ingestion.
/// The engine only ever reads these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationRecord {
    pub year: i64,
    pub make_id: i64,
    pub model_id: i64,
    pub model_year_id: i64,
    pub fuel_type_id: Option<i64>,
    pub vehicle_type_id: Option<i64>,
}

// ============================================================================
// DATABASE HANDLE
// ============================================================================

/// Handle to the single embedded store.
///
/// Connections are opened per operation so that readers, writers and cache
/// population can run on different threads (SQLite WAL allows concurrent readers).
#[derive(Debug, Clone)]
pub struct Database {
    path: PathBuf,
}

impl Database {
    /// Open (creating if needed) the database at `path` and make sure the schema exists
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let newly_created = !path.exists();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db = Database { path };
        let conn = db.connect()?;
        setup_database(&conn)?;

        if newly_created {
            info!("Initialized new database: {}", db.path.display());
        } else {
            info!("Opened existing database: {}", db.path.display());
        }

        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fresh connection with the engine's pragmas applied
    pub fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))?;
        Ok(conn)
    }
}

// ============================================================================
// SCHEMA
// ============================================================================

pub fn setup_database(conn: &Connection) -> Result<()> {
    // WAL for crash recovery and concurrent readers ("memory" for in-memory databases)
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    debug!("journal_mode = {}", mode);

    // ==========================================================================
    // Enumeration tables (one per categorical dimension)
    // ==========================================================================
    for table in crate::enumeration::Dimension::ALL.iter().map(|d| d.table()) {
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    code TEXT UNIQUE NOT NULL,
                    description TEXT
                )",
                table
            ),
            [],
        )?;
    }

    // ==========================================================================
    // Raw registrations (written by ingestion, read-only to the engine)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS registrations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            year INTEGER NOT NULL,
            make_id INTEGER NOT NULL,
            model_id INTEGER NOT NULL,
            model_year_id INTEGER NOT NULL,
            fuel_type_id INTEGER,
            vehicle_type_id INTEGER
        )",
        [],
    )?;

    // ==========================================================================
    // Regularization mappings (additive corrections, never touch raw rows)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS regularization_mapping (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            uncurated_make_id INTEGER NOT NULL,
            uncurated_model_id INTEGER NOT NULL,
            model_year_id INTEGER,
            canonical_make_id INTEGER NOT NULL,
            canonical_model_id INTEGER NOT NULL,
            fuel_type_id INTEGER,
            vehicle_type_id INTEGER,
            source TEXT NOT NULL DEFAULT 'manual',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    // NULL model years are distinct under a plain UNIQUE, so key on IFNULL
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_mapping_key
         ON regularization_mapping(uncurated_make_id, uncurated_model_id, IFNULL(model_year_id, -1))",
        [],
    )?;

    // ==========================================================================
    // Cache bookkeeping
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS cache_metadata (
            cache_name TEXT PRIMARY KEY,
            generation INTEGER NOT NULL DEFAULT 0,
            partition_key TEXT,
            schema_version INTEGER NOT NULL,
            stale INTEGER NOT NULL DEFAULT 1,
            populated_at TEXT
        )",
        [],
    )?;

    // Verified before any index is created on them
    ensure_cache_table(conn, CANONICAL_HIERARCHY_CACHE)?;
    ensure_cache_table(conn, UNCURATED_PAIRS_CACHE)?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_registrations_year ON registrations(year)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_registrations_pair ON registrations(make_id, model_id, model_year_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_mapping_canonical ON regularization_mapping(canonical_make_id, canonical_model_id)",
        [],
    )?;

    Ok(())
}

/// Expected columns of each cache table, in order
pub fn cache_table_columns(table: &str) -> &'static [&'static str] {
    match table {
        CANONICAL_HIERARCHY_CACHE => &[
            "make_id",
            "model_id",
            "model_year_id",
            "fuel_type_id",
            "vehicle_type_id",
            "record_count",
        ],
        UNCURATED_PAIRS_CACHE => &[
            "make_id",
            "model_id",
            "record_count",
            "earliest_year",
            "latest_year",
            "exact_match",
        ],
        _ => &[],
    }
}

fn create_cache_table(conn: &Connection, table: &str) -> Result<()> {
    let ddl = match table {
        CANONICAL_HIERARCHY_CACHE => format!(
            "CREATE TABLE IF NOT EXISTS {} (
                make_id INTEGER NOT NULL,
                model_id INTEGER NOT NULL,
                model_year_id INTEGER NOT NULL,
                fuel_type_id INTEGER,
                vehicle_type_id INTEGER,
                record_count INTEGER NOT NULL
            )",
            table
        ),
        UNCURATED_PAIRS_CACHE => format!(
            "CREATE TABLE IF NOT EXISTS {} (
                make_id INTEGER NOT NULL,
                model_id INTEGER NOT NULL,
                record_count INTEGER NOT NULL,
                earliest_year INTEGER NOT NULL,
                latest_year INTEGER NOT NULL,
                exact_match INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (make_id, model_id)
            )",
            table
        ),
        other => {
            return Err(RegularizationError::InvalidInput(format!(
                "unknown cache table '{}'",
                other
            )))
        }
    };

    conn.execute(&ddl, [])?;

    if table == CANONICAL_HIERARCHY_CACHE {
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_hierarchy_cache_pair
             ON canonical_hierarchy_cache(make_id, model_id)",
            [],
        )?;
    }

    Ok(())
}

/// Check a cache table's columns against what this build writes
pub fn verify_cache_table(conn: &Connection, table: &str) -> Result<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let actual: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let expected = cache_table_columns(table);
    if actual.len() != expected.len() || actual.iter().zip(expected).any(|(a, e)| a != e) {
        return Err(RegularizationError::SchemaMismatch {
            table: table.to_string(),
        });
    }

    Ok(())
}

/// Verify a cache table; drop and recreate it when its shape is stale
pub fn ensure_cache_table(conn: &Connection, table: &str) -> Result<()> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
        params![table],
        |row| row.get(0),
    )?;
    if !exists {
        return create_cache_table(conn, table);
    }

    match verify_cache_table(conn, table) {
        Ok(()) => Ok(()),
        Err(RegularizationError::SchemaMismatch { table }) => {
            warn!("Cache table '{}' has a stale shape, recreating", table);
            conn.execute(&format!("DROP TABLE IF EXISTS {}", table), [])?;
            create_cache_table(conn, &table)?;
            conn.execute(
                "DELETE FROM cache_metadata WHERE cache_name = ?1",
                params![table],
            )?;
            Ok(())
        }
        Err(e) => Err(e),
    }
}

// ============================================================================
// REGISTRATIONS
// ============================================================================

/// Insert enumerated registration rows in one transaction
pub fn insert_registrations(conn: &Connection, records: &[RegistrationRecord]) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO registrations (
                year, make_id, model_id, model_year_id, fuel_type_id, vehicle_type_id
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;

        for record in records {
            stmt.execute(params![
                record.year,
                record.make_id,
                record.model_id,
                record.model_year_id,
                record.fuel_type_id,
                record.vehicle_type_id,
            ])?;
        }
    }
    tx.commit()?;

    info!("Inserted {} registration rows", records.len());
    Ok(records.len())
}

pub fn verify_count(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM registrations", [], |row| row.get(0))?;

    Ok(count)
}

/// Row counts per registration year
pub fn registration_year_counts(conn: &Connection) -> Result<Vec<(i64, i64)>> {
    let mut stmt = conn.prepare(
        "SELECT year, COUNT(*) FROM registrations GROUP BY year ORDER BY year",
    )?;

    let counts = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(counts)
}

/// `?,?,?` placeholder list for an IN clause
pub(crate) fn placeholders(count: usize) -> String {
    vec!["?"; count].join(",")
}
