// 🔍 Query Builder - filter selections → parameterized SQL over raw registrations
//
// Raw rows are never rewritten; regularization happens entirely in the predicate:
//   make/model     → ID expansion (coupled or decoupled)
//   vehicle type   → stored value, or NULL + wildcard mapping of the row's pair
//   fuel type      → stored value, or NULL + triplet mapping of the row's pair AND model year

use crate::config::EngineConfig;
use crate::db::{placeholders, RegistrationRecord};
use crate::error::Result;
use crate::expansion::{expand_selection, Coupling, ExpandedSelection, ExpansionOptions, MappingIndex};
use crate::mapping::MappingStore;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

/// User selection; an empty set means "any value"
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationFilter {
    pub years: BTreeSet<i64>,
    pub makes: BTreeSet<i64>,
    pub models: BTreeSet<i64>,
    pub model_years: BTreeSet<i64>,
    pub fuel_types: BTreeSet<i64>,
    pub vehicle_types: BTreeSet<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryOptions {
    pub regularization_enabled: bool,
    pub coupling: Coupling,
    pub expand_fuel_before_field_exists: bool,
    pub fuel_type_first_year: i64,
}

impl QueryOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        QueryOptions {
            regularization_enabled: config.regularization_enabled,
            coupling: config.coupling,
            expand_fuel_before_field_exists: config.expand_fuel_before_field_exists,
            fuel_type_first_year: config.fuel_type_first_year,
        }
    }

    pub fn expansion(&self) -> ExpansionOptions {
        ExpansionOptions {
            enabled: self.regularization_enabled,
            coupling: self.coupling,
        }
    }
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// WHERE clause over `registrations r` and its positional parameters
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub sql: String,
    pub params: Vec<Value>,
}

#[derive(Default)]
struct PredicateBuilder {
    clauses: Vec<String>,
    params: Vec<Value>,
}

impl PredicateBuilder {
    /// Push `ids` as parameters and return the matching placeholder list
    fn bind(&mut self, ids: &BTreeSet<i64>) -> String {
        self.params.extend(ids.iter().map(|&id| Value::Integer(id)));
        placeholders(ids.len())
    }

    fn column_in(&mut self, column: &str, ids: &BTreeSet<i64>) {
        if !ids.is_empty() {
            let list = self.bind(ids);
            self.clauses.push(format!("{} IN ({})", column, list));
        }
    }

    fn make_model(&mut self, selection: &ExpandedSelection) {
        if selection.is_unconstrained() {
            return;
        }

        let mut base = Vec::new();
        if !selection.makes.is_empty() {
            base.push(format!("r.make_id IN ({})", self.bind(&selection.makes)));
        }
        if !selection.models.is_empty() {
            base.push(format!("r.model_id IN ({})", self.bind(&selection.models)));
        }
        let base = base.join(" AND ");

        if selection.pairs.is_empty() {
            self.clauses.push(base);
            return;
        }

        let rows = vec!["(?, ?)"; selection.pairs.len()].join(", ");
        for &(make, model) in &selection.pairs {
            self.params.push(Value::Integer(make));
            self.params.push(Value::Integer(model));
        }
        self.clauses.push(format!(
            "(({}) OR (r.make_id, r.model_id) IN (VALUES {}))",
            base, rows
        ));
    }

    fn vehicle_type(&mut self, ids: &BTreeSet<i64>, options: &QueryOptions) {
        if ids.is_empty() {
            return;
        }
        if !options.regularization_enabled {
            self.column_in("r.vehicle_type_id", ids);
            return;
        }

        let stored = self.bind(ids);
        let mapped = self.bind(ids);
        self.clauses.push(format!(
            "(r.vehicle_type_id IN ({stored})
              OR (r.vehicle_type_id IS NULL AND EXISTS (
                  SELECT 1 FROM regularization_mapping m
                  WHERE m.uncurated_make_id = r.make_id
                    AND m.uncurated_model_id = r.model_id
                    AND m.model_year_id IS NULL
                    AND m.vehicle_type_id IN ({mapped}))))"
        ));
    }

    fn fuel_type(&mut self, ids: &BTreeSet<i64>, options: &QueryOptions) {
        if ids.is_empty() {
            return;
        }
        if !options.regularization_enabled {
            self.column_in("r.fuel_type_id", ids);
            return;
        }

        let stored = self.bind(ids);
        let lower_bound = if options.expand_fuel_before_field_exists {
            String::new()
        } else {
            self.params.push(Value::Integer(options.fuel_type_first_year));
            " AND r.model_year_id IN (
                  SELECT id FROM model_year_enum WHERE CAST(code AS INTEGER) >= ?)"
                .to_string()
        };
        let mapped = self.bind(ids);

        self.clauses.push(format!(
            "(r.fuel_type_id IN ({stored})
              OR (r.fuel_type_id IS NULL{lower_bound} AND EXISTS (
                  SELECT 1 FROM regularization_mapping m
                  WHERE m.uncurated_make_id = r.make_id
                    AND m.uncurated_model_id = r.model_id
                    AND m.model_year_id = r.model_year_id
                    AND m.fuel_type_id IN ({mapped}))))"
        ));
    }

    fn finish(self) -> Predicate {
        let sql = if self.clauses.is_empty() {
            "1 = 1".to_string()
        } else {
            self.clauses.join("\n  AND ")
        };
        Predicate {
            sql,
            params: self.params,
        }
    }
}

/// Build the WHERE clause for `filter` (parameter order matches placeholder order)
pub fn build_predicate(filter: &RegistrationFilter, index: &MappingIndex, options: &QueryOptions) -> Predicate {
    let mut builder = PredicateBuilder::default();

    builder.column_in("r.year", &filter.years);

    let selection = expand_selection(index, &filter.makes, &filter.models, options.expansion());
    builder.make_model(&selection);

    builder.column_in("r.model_year_id", &filter.model_years);
    builder.vehicle_type(&filter.vehicle_types, options);
    builder.fuel_type(&filter.fuel_types, options);

    builder.finish()
}

fn load_index(conn: &Connection, options: &QueryOptions) -> Result<MappingIndex> {
    if options.regularization_enabled {
        Ok(MappingIndex::from_mappings(&MappingStore::new(conn).all()?))
    } else {
        Ok(MappingIndex::default())
    }
}

// ============================================================================
// QUERIES
// ============================================================================

pub fn count_matching(conn: &Connection, filter: &RegistrationFilter, options: &QueryOptions) -> Result<i64> {
    let predicate = build_predicate(filter, &load_index(conn, options)?, options);
    let sql = format!("SELECT COUNT(*) FROM registrations r WHERE {}", predicate.sql);
    debug!("count_matching: {}", sql);

    let count = conn.query_row(&sql, params_from_iter(predicate.params.iter()), |row| row.get(0))?;
    Ok(count)
}

/// Matching raw rows (unchanged), oldest first
pub fn matching_rows(
    conn: &Connection,
    filter: &RegistrationFilter,
    options: &QueryOptions,
    limit: Option<usize>,
) -> Result<Vec<RegistrationRecord>> {
    let predicate = build_predicate(filter, &load_index(conn, options)?, options);
    let limit_clause = limit.map(|n| format!(" LIMIT {}", n)).unwrap_or_default();
    let sql = format!(
        "SELECT r.year, r.make_id, r.model_id, r.model_year_id, r.fuel_type_id, r.vehicle_type_id
         FROM registrations r
         WHERE {}
         ORDER BY r.id{}",
        predicate.sql, limit_clause
    );

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(predicate.params.iter()), |row| {
            Ok(RegistrationRecord {
                year: row.get(0)?,
                make_id: row.get(1)?,
                model_id: row.get(2)?,
                model_year_id: row.get(3)?,
                fuel_type_id: row.get(4)?,
                vehicle_type_id: row.get(5)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}

/// (registration year, matching rows) for every year with at least one match
pub fn count_by_year(conn: &Connection, filter: &RegistrationFilter, options: &QueryOptions) -> Result<Vec<(i64, i64)>> {
    let predicate = build_predicate(filter, &load_index(conn, options)?, options);
    let sql = format!(
        "SELECT r.year, COUNT(*) FROM registrations r WHERE {} GROUP BY r.year ORDER BY r.year",
        predicate.sql
    );

    let mut stmt = conn.prepare(&sql)?;
    let counts = stmt
        .query_map(params_from_iter(predicate.params.iter()), |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(counts)
}
