// 🔢 Enumeration Store - stable integer IDs for every categorical dimension
//
// "JOHND" is a VALUE, 27 is its IDENTITY.
// IDs are created lazily on first sight of a code and never change afterwards.

use crate::error::{RegularizationError, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

// ============================================================================
// DIMENSION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Make,
    Model,
    ModelYear,
    FuelType,
    VehicleType,
}

impl Dimension {
    pub const ALL: [Dimension; 5] = [
        Dimension::Make,
        Dimension::Model,
        Dimension::ModelYear,
        Dimension::FuelType,
        Dimension::VehicleType,
    ];

    pub fn table(&self) -> &'static str {
        match self {
            Dimension::Make => "make_enum",
            Dimension::Model => "model_enum",
            Dimension::ModelYear => "model_year_enum",
            Dimension::FuelType => "fuel_type_enum",
            Dimension::VehicleType => "vehicle_type_enum",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::Make => "make",
            Dimension::Model => "model",
            Dimension::ModelYear => "model_year",
            Dimension::FuelType => "fuel_type",
            Dimension::VehicleType => "vehicle_type",
        }
    }

    pub fn parse(s: &str) -> Option<Dimension> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "make" => Some(Dimension::Make),
            "model" => Some(Dimension::Model),
            "model_year" | "modelyear" => Some(Dimension::ModelYear),
            "fuel_type" | "fueltype" | "fuel" => Some(Dimension::FuelType),
            "vehicle_type" | "vehicletype" => Some(Dimension::VehicleType),
            _ => None,
        }
    }
}

// ============================================================================
// ENUM ENTRY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumEntry {
    pub id: i64,
    pub code: String,
    pub description: Option<String>,
}

/// Numeric value of a model-year code ("2008" → 2008)
pub fn model_year_value(code: &str) -> Option<i64> {
    code.trim().parse().ok()
}

fn normalize_code(code: &str) -> Result<String> {
    let trimmed = code.trim();
    if trimmed.is_empty() {
        return Err(RegularizationError::InvalidInput(
            "enumeration code cannot be empty".to_string(),
        ));
    }
    Ok(trimmed.to_string())
}

// ============================================================================
// ENUMERATION STORE
// ============================================================================

pub struct EnumerationStore<'c> {
    conn: &'c Connection,
}

impl<'c> EnumerationStore<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        EnumerationStore { conn }
    }

    /// Return the ID for `code`, creating it on first sight
    pub fn get_or_create(
        &self,
        dimension: Dimension,
        code: &str,
        description: Option<&str>,
    ) -> Result<i64> {
        let code = normalize_code(code)?;

        self.conn.execute(
            &format!(
                "INSERT OR IGNORE INTO {} (code, description) VALUES (?1, ?2)",
                dimension.table()
            ),
            params![code, description],
        )?;

        let id = self.conn.query_row(
            &format!("SELECT id FROM {} WHERE code = ?1", dimension.table()),
            params![code],
            |row| row.get(0),
        )?;

        Ok(id)
    }

    pub fn id_for(&self, dimension: Dimension, code: &str) -> Result<Option<i64>> {
        let code = normalize_code(code)?;
        let id = self
            .conn
            .query_row(
                &format!("SELECT id FROM {} WHERE code = ?1", dimension.table()),
                params![code],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    pub fn entry(&self, dimension: Dimension, id: i64) -> Result<Option<EnumEntry>> {
        let entry = self
            .conn
            .query_row(
                &format!(
                    "SELECT id, code, description FROM {} WHERE id = ?1",
                    dimension.table()
                ),
                params![id],
                |row| {
                    Ok(EnumEntry {
                        id: row.get(0)?,
                        code: row.get(1)?,
                        description: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(entry)
    }

    pub fn code_for(&self, dimension: Dimension, id: i64) -> Result<Option<String>> {
        Ok(self.entry(dimension, id)?.map(|e| e.code))
    }

    /// Like `code_for`, but a missing ID is an error
    pub fn require_code(&self, dimension: Dimension, id: i64) -> Result<String> {
        self.code_for(dimension, id)?.ok_or_else(|| {
            RegularizationError::NotFound(format!("{} id {}", dimension.as_str(), id))
        })
    }

    pub fn all(&self, dimension: Dimension) -> Result<Vec<EnumEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT id, code, description FROM {} ORDER BY code",
            dimension.table()
        ))?;

        let entries = stmt
            .query_map([], |row| {
                Ok(EnumEntry {
                    id: row.get(0)?,
                    code: row.get(1)?,
                    description: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(entries)
    }

    /// id → code for a whole dimension
    pub fn code_map(&self, dimension: Dimension) -> Result<HashMap<i64, String>> {
        Ok(self
            .all(dimension)?
            .into_iter()
            .map(|e| (e.id, e.code))
            .collect())
    }
}

// ============================================================================
// ENUMERATION CACHE
// ============================================================================

/// In-memory code → ID lookups for bulk ingestion.
/// Safe to share: IDs never change once created.
#[derive(Clone, Default)]
pub struct EnumerationCache {
    ids: Arc<RwLock<HashMap<(Dimension, String), i64>>>,
}

impl EnumerationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached `get_or_create`
    pub fn resolve(&self, store: &EnumerationStore<'_>, dimension: Dimension, code: &str) -> Result<i64> {
        let key = (dimension, normalize_code(code)?);

        if let Ok(ids) = self.ids.read() {
            if let Some(id) = ids.get(&key) {
                return Ok(*id);
            }
        }

        let id = store.get_or_create(dimension, &key.1, None)?;
        if let Ok(mut ids) = self.ids.write() {
            ids.insert(key, id);
        }
        Ok(id)
    }

    pub fn len(&self) -> usize {
        self.ids.read().map(|ids| ids.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
