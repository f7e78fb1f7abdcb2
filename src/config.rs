// ⚙️ Engine configuration - TOML file + explicit year partition
//
// Toggles (regularization on/off, coupling) are carried here only as defaults.
// They are always passed into expansion and query building as parameters.

use crate::error::{RegularizationError, Result};
use crate::expansion::Coupling;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

// ============================================================================
// YEAR PARTITION
// ============================================================================

/// Which registration years are curated (canonical truth) and which are not
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct YearPartition {
    pub curated: BTreeSet<i64>,
    pub uncurated: BTreeSet<i64>,
}

impl YearPartition {
    pub fn new<C, U>(curated: C, uncurated: U) -> Result<Self>
    where
        C: IntoIterator<Item = i64>,
        U: IntoIterator<Item = i64>,
    {
        let partition = YearPartition {
            curated: curated.into_iter().collect(),
            uncurated: uncurated.into_iter().collect(),
        };
        partition.validate()?;
        Ok(partition)
    }

    pub fn validate(&self) -> Result<()> {
        if self.curated.is_empty() {
            return Err(RegularizationError::Config(
                "at least one curated year is required".to_string(),
            ));
        }

        if let Some(year) = self.curated.intersection(&self.uncurated).next() {
            return Err(RegularizationError::Config(format!(
                "year {} is listed as both curated and uncurated",
                year
            )));
        }

        Ok(())
    }

    /// Stable key stored next to cache tables; a different key means the cache is stale
    pub fn key(&self) -> String {
        let join = |years: &BTreeSet<i64>| {
            years
                .iter()
                .map(|y| y.to_string())
                .collect::<Vec<_>>()
                .join(",")
        };
        format!("c:{}|u:{}", join(&self.curated), join(&self.uncurated))
    }

    pub fn curated_years(&self) -> Vec<i64> {
        self.curated.iter().copied().collect()
    }

    pub fn uncurated_years(&self) -> Vec<i64> {
        self.uncurated.iter().copied().collect()
    }
}

impl Default for YearPartition {
    fn default() -> Self {
        YearPartition {
            curated: (2011..=2022).collect(),
            uncurated: (2023..=2024).collect(),
        }
    }
}

// ============================================================================
// ENGINE CONFIG
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// SQLite database file
    pub database_path: PathBuf,

    pub curated_years: Vec<i64>,

    pub uncurated_years: Vec<i64>,

    /// Vehicle type codes consulted in order when a canonical pair has several types
    pub cardinal_vehicle_types: Vec<String>,

    /// First registration year whose raw rows carry a fuel type
    pub fuel_type_first_year: i64,

    /// Default for letting fuel-type mappings match model years before `fuel_type_first_year`
    pub expand_fuel_before_field_exists: bool,

    /// Default for query-time regularization
    pub regularization_enabled: bool,

    /// Default coupling between Make and Model filters
    pub coupling: Coupling,

    /// Rows per committed batch when importing CSV
    pub import_batch_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let partition = YearPartition::default();
        EngineConfig {
            database_path: PathBuf::from("registry.db"),
            curated_years: partition.curated_years(),
            uncurated_years: partition.uncurated_years(),
            cardinal_vehicle_types: vec!["AU".to_string(), "MC".to_string()],
            fuel_type_first_year: 2017,
            expand_fuel_before_field_exists: true,
            regularization_enabled: true,
            coupling: Coupling::Coupled,
            import_batch_size: 10_000,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            RegularizationError::Config(format!(
                "failed to read config file {:?}: {}",
                path.as_ref(),
                e
            ))
        })?;

        let config = Self::from_toml_str(&content)?;
        info!("Loaded engine config from {}", path.as_ref().display());
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(content)
            .map_err(|e| RegularizationError::Config(format!("invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.year_partition()?;

        if self.import_batch_size == 0 {
            return Err(RegularizationError::Config(
                "import_batch_size must be at least 1".to_string(),
            ));
        }

        if self.cardinal_vehicle_types.iter().any(|c| c.trim().is_empty()) {
            return Err(RegularizationError::Config(
                "cardinal_vehicle_types contains an empty code".to_string(),
            ));
        }

        Ok(())
    }

    pub fn year_partition(&self) -> Result<YearPartition> {
        YearPartition::new(
            self.curated_years.iter().copied(),
            self.uncurated_years.iter().copied(),
        )
    }
}
