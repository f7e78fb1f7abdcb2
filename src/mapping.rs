// 🔗 Mapping Store - additive corrections from uncurated to canonical entities
//
// Raw registrations are never rewritten. Every correction is a row in
// regularization_mapping, keyed by (uncurated make, uncurated model, model year?):
//   - model year NULL  → wildcard mapping (applies to every model year of the pair)
//   - model year set   → triplet mapping (year-scoped fields such as fuel type)
//
// Invariant: all mappings sharing an uncurated make resolve to ONE canonical make.

use crate::cache::CacheController;
use crate::enumeration::{Dimension, EnumerationStore};
use crate::error::{RegularizationError, Result};
use crate::hierarchy::Hierarchy;
use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlResult, Null, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::{info, warn};

/// Stored in a payload column when a reviewer decided the value is genuinely unknown
pub const UNKNOWN_SENTINEL_ID: i64 = -1;

// ============================================================================
// ASSIGNMENT (three-state payload field)
// ============================================================================

/// Reviewer decision for an optional payload field.
///
/// `Unassigned` and `Unknown` are different answers: the first means nobody has
/// decided yet, the second means somebody looked and the value is ambiguous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "id", rename_all = "snake_case")]
pub enum Assignment {
    #[default]
    Unassigned,
    Unknown,
    Assigned(i64),
}

impl Assignment {
    /// Unknown counts as decided; Unassigned does not
    pub fn is_decided(&self) -> bool {
        !matches!(self, Assignment::Unassigned)
    }

    pub fn id(&self) -> Option<i64> {
        match self {
            Assignment::Assigned(id) => Some(*id),
            _ => None,
        }
    }

    pub fn matches_any(&self, ids: &BTreeSet<i64>) -> bool {
        self.id().map(|id| ids.contains(&id)).unwrap_or(false)
    }

    /// Parse CLI/API text: "unassigned", "unknown", or a numeric ID
    pub fn parse(s: &str) -> Option<Assignment> {
        match s.trim().to_lowercase().as_str() {
            "" | "unassigned" | "none" => Some(Assignment::Unassigned),
            "unknown" => Some(Assignment::Unknown),
            other => other.parse::<i64>().ok().filter(|id| *id > 0).map(Assignment::Assigned),
        }
    }
}

impl ToSql for Assignment {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Assignment::Unassigned => ToSqlOutput::from(Null),
            Assignment::Unknown => ToSqlOutput::from(UNKNOWN_SENTINEL_ID),
            Assignment::Assigned(id) => ToSqlOutput::from(*id),
        })
    }
}

impl FromSql for Assignment {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value {
            ValueRef::Null => Ok(Assignment::Unassigned),
            other => i64::column_result(other).map(|id| {
                if id == UNKNOWN_SENTINEL_ID {
                    Assignment::Unknown
                } else {
                    Assignment::Assigned(id)
                }
            }),
        }
    }
}

// ============================================================================
// MAPPING
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingSource {
    /// Proposed by exact-match auto-regularization
    Auto,
    /// Entered by a reviewer
    Manual,
}

impl MappingSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            MappingSource::Auto => "auto",
            MappingSource::Manual => "manual",
        }
    }

    fn from_column(s: &str) -> Self {
        match s {
            "auto" => MappingSource::Auto,
            _ => MappingSource::Manual,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MappingKey {
    pub uncurated_make_id: i64,
    pub uncurated_model_id: i64,
    /// None = wildcard
    pub model_year_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegularizationMapping {
    pub uncurated_make_id: i64,
    pub uncurated_model_id: i64,
    pub model_year_id: Option<i64>,

    pub canonical_make_id: i64,
    pub canonical_model_id: i64,

    #[serde(default)]
    pub fuel_type: Assignment,
    #[serde(default)]
    pub vehicle_type: Assignment,

    #[serde(default = "default_source")]
    pub source: MappingSource,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

fn default_source() -> MappingSource {
    MappingSource::Manual
}

impl RegularizationMapping {
    /// Pair-level mapping applying to every model year
    pub fn wildcard(uncurated: (i64, i64), canonical: (i64, i64)) -> Self {
        RegularizationMapping {
            uncurated_make_id: uncurated.0,
            uncurated_model_id: uncurated.1,
            model_year_id: None,
            canonical_make_id: canonical.0,
            canonical_model_id: canonical.1,
            fuel_type: Assignment::Unassigned,
            vehicle_type: Assignment::Unassigned,
            source: MappingSource::Manual,
            created_at: None,
            updated_at: None,
        }
    }

    /// Mapping for one model year of a pair
    pub fn triplet(uncurated: (i64, i64), model_year_id: i64, canonical: (i64, i64)) -> Self {
        RegularizationMapping {
            model_year_id: Some(model_year_id),
            ..Self::wildcard(uncurated, canonical)
        }
    }

    pub fn with_vehicle_type(mut self, vehicle_type: Assignment) -> Self {
        self.vehicle_type = vehicle_type;
        self
    }

    pub fn with_fuel_type(mut self, fuel_type: Assignment) -> Self {
        self.fuel_type = fuel_type;
        self
    }

    pub fn with_source(mut self, source: MappingSource) -> Self {
        self.source = source;
        self
    }

    pub fn key(&self) -> MappingKey {
        MappingKey {
            uncurated_make_id: self.uncurated_make_id,
            uncurated_model_id: self.uncurated_model_id,
            model_year_id: self.model_year_id,
        }
    }

    pub fn uncurated_pair(&self) -> (i64, i64) {
        (self.uncurated_make_id, self.uncurated_model_id)
    }

    pub fn canonical_pair(&self) -> (i64, i64) {
        (self.canonical_make_id, self.canonical_model_id)
    }

    pub fn is_wildcard(&self) -> bool {
        self.model_year_id.is_none()
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let source: String = row.get(7)?;
        let created_at: String = row.get(8)?;
        let updated_at: String = row.get(9)?;

        Ok(RegularizationMapping {
            uncurated_make_id: row.get(0)?,
            uncurated_model_id: row.get(1)?,
            model_year_id: row.get(2)?,
            canonical_make_id: row.get(3)?,
            canonical_model_id: row.get(4)?,
            fuel_type: row.get(5)?,
            vehicle_type: row.get(6)?,
            source: MappingSource::from_column(&source),
            created_at: parse_timestamp(&created_at),
            updated_at: parse_timestamp(&updated_at),
        })
    }
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

const SELECT_MAPPING: &str = "SELECT uncurated_make_id, uncurated_model_id, model_year_id,
        canonical_make_id, canonical_model_id, fuel_type_id, vehicle_type_id,
        source, created_at, updated_at
 FROM regularization_mapping";

fn validate(mapping: &RegularizationMapping) -> Result<()> {
    let ids = [
        ("uncurated make", mapping.uncurated_make_id),
        ("uncurated model", mapping.uncurated_model_id),
        ("canonical make", mapping.canonical_make_id),
        ("canonical model", mapping.canonical_model_id),
    ];
    for (name, id) in ids {
        if id <= 0 {
            return Err(RegularizationError::InvalidInput(format!(
                "{} must be a real entity id, got {}",
                name, id
            )));
        }
    }

    if let Some(model_year) = mapping.model_year_id {
        if model_year <= 0 {
            return Err(RegularizationError::InvalidInput(format!(
                "model year must be a real entity id, got {}",
                model_year
            )));
        }
    }

    for (name, field) in [("fuel type", mapping.fuel_type), ("vehicle type", mapping.vehicle_type)] {
        if let Assignment::Assigned(id) = field {
            if id <= 0 {
                return Err(RegularizationError::InvalidInput(format!(
                    "{} id {} is reserved; use Unknown instead",
                    name, id
                )));
            }
        }
    }

    Ok(())
}

// ============================================================================
// COMPLETENESS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Completeness {
    /// No mapping rows at all
    Unmapped,
    Incomplete {
        /// Wildcard row missing or its vehicle type still Unassigned
        vehicle_type_pending: bool,
        /// Curated model years without a triplet row
        missing_model_years: Vec<i64>,
        /// Triplet rows whose required fuel type is still Unassigned
        unassigned_model_years: Vec<i64>,
    },
    Complete,
}

impl Completeness {
    pub fn is_complete(&self) -> bool {
        matches!(self, Completeness::Complete)
    }
}

/// Completeness of one uncurated pair given all of its mapping rows.
///
/// Complete iff the wildcard row's vehicle type is decided and there is a
/// triplet row for every curated model year of the canonical pair whose fuel type is decided wherever curated data has a fuel type.
/// Unknown counts as decided; Unassigned never does.
pub fn assess_completeness(pair_mappings: &[RegularizationMapping], hierarchy: &Hierarchy) -> Completeness {
    let wildcard = pair_mappings.iter().find(|m| m.is_wildcard());
    let canonical = match wildcard.or_else(|| pair_mappings.first()) {
        Some(m) => m.canonical_pair(),
        None => return Completeness::Unmapped,
    };

    let vehicle_type_pending = !wildcard.map(|w| w.vehicle_type.is_decided()).unwrap_or(false);

    let triplets: BTreeMap<i64, Assignment> = pair_mappings
        .iter()
        .filter_map(|m| m.model_year_id.map(|year| (year, m.fuel_type)))
        .collect();

    let mut missing_model_years = Vec::new();
    let mut unassigned_model_years = Vec::new();

    for year in hierarchy.model_years_for_pair(canonical.0, canonical.1) {
        match triplets.get(&year) {
            None => missing_model_years.push(year),
            Some(fuel) => {
                let fuel_required = !hierarchy.fuel_types_for(canonical.0, canonical.1, year).is_empty();
                if fuel_required && !fuel.is_decided() {
                    unassigned_model_years.push(year);
                }
            }
        }
    }

    if !vehicle_type_pending && missing_model_years.is_empty() && unassigned_model_years.is_empty() {
        Completeness::Complete
    } else {
        Completeness::Incomplete {
            vehicle_type_pending,
            missing_model_years,
            unassigned_model_years,
        }
    }
}

// ============================================================================
// STATISTICS
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentCounts {
    pub unassigned: usize,
    pub unknown: usize,
    pub assigned: usize,
}

impl AssignmentCounts {
    fn add(&mut self, assignment: Assignment) {
        match assignment {
            Assignment::Unassigned => self.unassigned += 1,
            Assignment::Unknown => self.unknown += 1,
            Assignment::Assigned(_) => self.assigned += 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingStatistics {
    pub total: usize,
    pub wildcard: usize,
    pub triplet: usize,
    pub auto: usize,
    pub manual: usize,
    pub uncurated_pairs: usize,
    pub uncurated_makes: usize,
    /// Over wildcard rows
    pub vehicle_types: AssignmentCounts,
    /// Over triplet rows
    pub fuel_types: AssignmentCounts,
}

impl MappingStatistics {
    pub fn from_mappings(mappings: &[RegularizationMapping]) -> Self {
        let mut stats = MappingStatistics {
            total: mappings.len(),
            ..Default::default()
        };
        let mut pairs = HashSet::new();
        let mut makes = HashSet::new();

        for m in mappings {
            pairs.insert(m.uncurated_pair());
            makes.insert(m.uncurated_make_id);

            match m.source {
                MappingSource::Auto => stats.auto += 1,
                MappingSource::Manual => stats.manual += 1,
            }

            if m.is_wildcard() {
                stats.wildcard += 1;
                stats.vehicle_types.add(m.vehicle_type);
            } else {
                stats.triplet += 1;
                stats.fuel_types.add(m.fuel_type);
            }
        }

        stats.uncurated_pairs = pairs.len();
        stats.uncurated_makes = makes.len();
        stats
    }
}

// ============================================================================
// MAPPING STORE
// ============================================================================

pub struct MappingStore<'c> {
    conn: &'c Connection,
    caches: Option<&'c CacheController>,
}

impl<'c> MappingStore<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        MappingStore { conn, caches: None }
    }

    /// Store that invalidates `caches` after every successful mutation
    pub fn with_cache_invalidation(conn: &'c Connection, caches: &'c CacheController) -> Self {
        MappingStore {
            conn,
            caches: Some(caches),
        }
    }

    fn invalidate(&self) -> Result<()> {
        if let Some(caches) = self.caches {
            caches.invalidate(self.conn)?;
        }
        Ok(())
    }

    /// Validate Make-level consistency and upsert by key
    pub fn save(&self, mapping: &RegularizationMapping) -> Result<()> {
        validate(mapping)?;

        let tx = self.conn.unchecked_transaction()?;
        check_make_consistency(
            &tx,
            mapping.uncurated_make_id,
            mapping.canonical_make_id,
            &[mapping.key()],
        )?;
        check_pair_target(&tx, mapping.uncurated_pair(), mapping.canonical_pair(), &[mapping.key()])?;
        upsert(&tx, mapping)?;
        tx.commit()?;

        info!(
            "Saved mapping ({}, {}, {:?}) → ({}, {})",
            mapping.uncurated_make_id,
            mapping.uncurated_model_id,
            mapping.model_year_id,
            mapping.canonical_make_id,
            mapping.canonical_model_id
        );

        self.invalidate()
    }

    /// Write one triplet row per model year of the pair, in one transaction.
    ///
    /// Years passed as `Assignment::Unassigned` still get a row: every model year
    /// of a regularized pair has a row even when its fuel type is deferred.
    pub fn save_year_triplets(
        &self,
        uncurated: (i64, i64),
        canonical: (i64, i64),
        fuel_types: &BTreeMap<i64, Assignment>,
        source: MappingSource,
    ) -> Result<usize> {
        let rows: Vec<RegularizationMapping> = fuel_types
            .iter()
            .map(|(&model_year_id, &fuel_type)| {
                RegularizationMapping::triplet(uncurated, model_year_id, canonical)
                    .with_fuel_type(fuel_type)
                    .with_source(source)
            })
            .collect();

        for row in &rows {
            validate(row)?;
        }
        if rows.is_empty() {
            return Ok(0);
        }

        let keys: Vec<MappingKey> = rows.iter().map(|r| r.key()).collect();

        let tx = self.conn.unchecked_transaction()?;
        check_make_consistency(&tx, uncurated.0, canonical.0, &keys)?;
        check_pair_target(&tx, uncurated, canonical, &keys)?;
        for row in &rows {
            upsert(&tx, row)?;
        }
        tx.commit()?;

        info!(
            "Saved {} year triplets for pair ({}, {})",
            rows.len(),
            uncurated.0,
            uncurated.1
        );

        self.invalidate()?;
        Ok(rows.len())
    }

    /// Manual deletion of one mapping row
    pub fn delete(&self, key: &MappingKey) -> Result<bool> {
        let deleted = self.conn.execute(
            "DELETE FROM regularization_mapping
             WHERE uncurated_make_id = ?1 AND uncurated_model_id = ?2 AND model_year_id IS ?3",
            params![key.uncurated_make_id, key.uncurated_model_id, key.model_year_id],
        )?;

        if deleted > 0 {
            info!("Deleted mapping {:?}", key);
            self.invalidate()?;
        }
        Ok(deleted > 0)
    }

    /// Manual deletion of the wildcard and every triplet of a pair
    pub fn delete_pair(&self, uncurated_make_id: i64, uncurated_model_id: i64) -> Result<usize> {
        let deleted = self.conn.execute(
            "DELETE FROM regularization_mapping
             WHERE uncurated_make_id = ?1 AND uncurated_model_id = ?2",
            params![uncurated_make_id, uncurated_model_id],
        )?;

        if deleted > 0 {
            info!(
                "Deleted {} mappings for pair ({}, {})",
                deleted, uncurated_make_id, uncurated_model_id
            );
            self.invalidate()?;
        }
        Ok(deleted)
    }

    pub fn get(&self, key: &MappingKey) -> Result<Option<RegularizationMapping>> {
        let mapping = self
            .conn
            .query_row(
                &format!(
                    "{} WHERE uncurated_make_id = ?1 AND uncurated_model_id = ?2 AND model_year_id IS ?3",
                    SELECT_MAPPING
                ),
                params![key.uncurated_make_id, key.uncurated_model_id, key.model_year_id],
                RegularizationMapping::from_row,
            )
            .optional()?;
        Ok(mapping)
    }

    pub fn wildcard_for(&self, uncurated_make_id: i64, uncurated_model_id: i64) -> Result<Option<RegularizationMapping>> {
        self.get(&MappingKey {
            uncurated_make_id,
            uncurated_model_id,
            model_year_id: None,
        })
    }

    pub fn all(&self) -> Result<Vec<RegularizationMapping>> {
        self.query(
            &format!(
                "{} ORDER BY uncurated_make_id, uncurated_model_id, model_year_id",
                SELECT_MAPPING
            ),
            &[],
        )
    }

    /// Wildcard first, then triplets by model year
    pub fn for_pair(&self, uncurated_make_id: i64, uncurated_model_id: i64) -> Result<Vec<RegularizationMapping>> {
        self.query(
            &format!(
                "{} WHERE uncurated_make_id = ?1 AND uncurated_model_id = ?2 ORDER BY model_year_id",
                SELECT_MAPPING
            ),
            &[&uncurated_make_id, &uncurated_model_id],
        )
    }

    pub fn for_uncurated_make(&self, uncurated_make_id: i64) -> Result<Vec<RegularizationMapping>> {
        self.query(
            &format!(
                "{} WHERE uncurated_make_id = ?1 ORDER BY uncurated_model_id, model_year_id",
                SELECT_MAPPING
            ),
            &[&uncurated_make_id],
        )
    }

    pub fn statistics(&self) -> Result<MappingStatistics> {
        Ok(MappingStatistics::from_mappings(&self.all()?))
    }

    pub fn completeness(&self, uncurated_make_id: i64, uncurated_model_id: i64, hierarchy: &Hierarchy) -> Result<Completeness> {
        let rows = self.for_pair(uncurated_make_id, uncurated_model_id)?;
        Ok(assess_completeness(&rows, hierarchy))
    }

    fn query(&self, sql: &str, args: &[&dyn ToSql]) -> Result<Vec<RegularizationMapping>> {
        let mut stmt = self.conn.prepare(sql)?;
        let mappings = stmt
            .query_map(args, RegularizationMapping::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(mappings)
    }
}

/// Reject when another mapping for the same uncurated make points at a different
/// canonical make. Rows about to be overwritten (`replacing`) are ignored.
fn check_make_consistency(
    conn: &Connection,
    uncurated_make_id: i64,
    canonical_make_id: i64,
    replacing: &[MappingKey],
) -> Result<()> {
    let mut stmt = conn.prepare(
        "SELECT canonical_make_id, uncurated_model_id, model_year_id
         FROM regularization_mapping
         WHERE uncurated_make_id = ?1 AND canonical_make_id != ?2",
    )?;

    let others: Vec<(i64, MappingKey)> = stmt
        .query_map(params![uncurated_make_id, canonical_make_id], |row| {
            Ok((
                row.get(0)?,
                MappingKey {
                    uncurated_make_id,
                    uncurated_model_id: row.get(1)?,
                    model_year_id: row.get(2)?,
                },
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let conflict = others
        .into_iter()
        .find(|(_, key)| !replacing.contains(key))
        .map(|(canonical, _)| canonical);

    if let Some(conflicting_canonical_make_id) = conflict {
        let conflicting_canonical_make = EnumerationStore::new(conn)
            .code_for(Dimension::Make, conflicting_canonical_make_id)?
            .unwrap_or_else(|| format!("#{}", conflicting_canonical_make_id));

        warn!(
            "Rejected mapping: uncurated make {} already maps to {}",
            uncurated_make_id, conflicting_canonical_make
        );

        return Err(RegularizationError::ConflictingMapping {
            uncurated_make_id,
            requested_canonical_make_id: canonical_make_id,
            conflicting_canonical_make_id,
            conflicting_canonical_make,
        });
    }

    Ok(())
}

/// Reject when rows of the same uncurated pair already point at a different
/// canonical pair. Rows about to be overwritten (`replacing`) are ignored.
fn check_pair_target(
    conn: &Connection,
    uncurated: (i64, i64),
    canonical: (i64, i64),
    replacing: &[MappingKey],
) -> Result<()> {
    let mut stmt = conn.prepare(
        "SELECT canonical_make_id, canonical_model_id, model_year_id
         FROM regularization_mapping
         WHERE uncurated_make_id = ?1 AND uncurated_model_id = ?2
           AND (canonical_make_id != ?3 OR canonical_model_id != ?4)",
    )?;

    let others: Vec<((i64, i64), MappingKey)> = stmt
        .query_map(params![uncurated.0, uncurated.1, canonical.0, canonical.1], |row| {
            Ok((
                (row.get(0)?, row.get(1)?),
                MappingKey {
                    uncurated_make_id: uncurated.0,
                    uncurated_model_id: uncurated.1,
                    model_year_id: row.get(2)?,
                },
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    if let Some((existing_canonical, _)) = others.into_iter().find(|(_, key)| !replacing.contains(key)) {
        warn!(
            "Rejected mapping: uncurated pair {:?} already maps to {:?}",
            uncurated, existing_canonical
        );
        return Err(RegularizationError::ConflictingPairTarget {
            uncurated,
            existing_canonical,
            requested_canonical: canonical,
        });
    }

    Ok(())
}

fn upsert(conn: &Connection, mapping: &RegularizationMapping) -> Result<()> {
    let now = Utc::now().to_rfc3339();

    let existing: Option<i64> = conn
        .query_row(
            "SELECT id FROM regularization_mapping
             WHERE uncurated_make_id = ?1 AND uncurated_model_id = ?2 AND model_year_id IS ?3",
            params![
                mapping.uncurated_make_id,
                mapping.uncurated_model_id,
                mapping.model_year_id
            ],
            |row| row.get(0),
        )
        .optional()?;

    match existing {
        Some(id) => {
            conn.execute(
                "UPDATE regularization_mapping
                 SET canonical_make_id = ?1, canonical_model_id = ?2,
                     fuel_type_id = ?3, vehicle_type_id = ?4,
                     source = ?5, updated_at = ?6
                 WHERE id = ?7",
                params![
                    mapping.canonical_make_id,
                    mapping.canonical_model_id,
                    mapping.fuel_type,
                    mapping.vehicle_type,
                    mapping.source.as_str(),
                    now,
                    id,
                ],
            )?;
        }
        None => {
            conn.execute(
                "INSERT INTO regularization_mapping (
                    uncurated_make_id, uncurated_model_id, model_year_id,
                    canonical_make_id, canonical_model_id, fuel_type_id, vehicle_type_id,
                    source, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
                params![
                    mapping.uncurated_make_id,
                    mapping.uncurated_model_id,
                    mapping.model_year_id,
                    mapping.canonical_make_id,
                    mapping.canonical_model_id,
                    mapping.fuel_type,
                    mapping.vehicle_type,
                    mapping.source.as_str(),
                    now,
                ],
            )?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CachePhase;
    use crate::db::setup_database;
    use crate::hierarchy::{CanonicalHierarchyEntry, HierarchyCodes};

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn
    }

    fn make(conn: &Connection, code: &str) -> i64 {
        EnumerationStore::new(conn)
            .get_or_create(Dimension::Make, code, None)
            .unwrap()
    }

    #[test]
    fn test_assignment_states_survive_storage() {
        let conn = conn();
        let store = MappingStore::new(&conn);

        store
            .save(&RegularizationMapping::wildcard((1, 2), (3, 4)).with_vehicle_type(Assignment::Unknown))
            .unwrap();
        store
            .save(&RegularizationMapping::wildcard((1, 5), (3, 6)).with_vehicle_type(Assignment::Assigned(9)))
            .unwrap();
        store.save(&RegularizationMapping::wildcard((1, 7), (3, 8))).unwrap();

        let unknown = store.wildcard_for(1, 2).unwrap().unwrap();
        let assigned = store.wildcard_for(1, 5).unwrap().unwrap();
        let unassigned = store.wildcard_for(1, 7).unwrap().unwrap();

        assert_eq!(unknown.vehicle_type, Assignment::Unknown);
        assert_eq!(assigned.vehicle_type, Assignment::Assigned(9));
        assert_eq!(unassigned.vehicle_type, Assignment::Unassigned);
        assert!(unknown.vehicle_type.is_decided());
        assert!(!unassigned.vehicle_type.is_decided());

        // The sentinel lives in the column, never in Rust values
        let raw: i64 = conn
            .query_row(
                "SELECT vehicle_type_id FROM regularization_mapping WHERE uncurated_model_id = 2",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(raw, UNKNOWN_SENTINEL_ID);
    }

    #[test]
    fn test_save_upserts_by_key() {
        let conn = conn();
        let store = MappingStore::new(&conn);

        store.save(&RegularizationMapping::wildcard((1, 2), (3, 4))).unwrap();
        store
            .save(&RegularizationMapping::wildcard((1, 2), (3, 5)).with_vehicle_type(Assignment::Assigned(7)))
            .unwrap();

        let all = store.all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].canonical_model_id, 5);
        assert_eq!(all[0].vehicle_type, Assignment::Assigned(7));
        assert!(all[0].created_at.is_some());
    }

    #[test]
    fn test_make_level_conflict_rejected_and_store_unchanged() {
        let conn = conn();
        let johnd = make(&conn, "JOHND");
        let jhond = make(&conn, "JHOND");
        let kubota = make(&conn, "KUBOT");
        let store = MappingStore::new(&conn);

        store.save(&RegularizationMapping::wildcard((jhond, 10), (johnd, 11))).unwrap();
        let before = store.all().unwrap();

        let err = store
            .save(&RegularizationMapping::wildcard((jhond, 12), (kubota, 13)))
            .unwrap_err();

        match err {
            RegularizationError::ConflictingMapping {
                uncurated_make_id,
                conflicting_canonical_make_id,
                conflicting_canonical_make,
                ..
            } => {
                assert_eq!(uncurated_make_id, jhond);
                assert_eq!(conflicting_canonical_make_id, johnd);
                assert_eq!(conflicting_canonical_make, "JOHND");
            }
            other => panic!("expected ConflictingMapping, got {:?}", other),
        }

        assert_eq!(store.all().unwrap(), before);

        // Same canonical make for a new model is fine
        store.save(&RegularizationMapping::wildcard((jhond, 12), (johnd, 13))).unwrap();
        assert_eq!(store.for_uncurated_make(jhond).unwrap().len(), 2);
    }

    #[test]
    fn test_replacing_the_only_mapping_may_change_make() {
        let conn = conn();
        let store = MappingStore::new(&conn);

        store.save(&RegularizationMapping::wildcard((1, 2), (3, 4))).unwrap();
        store.save(&RegularizationMapping::wildcard((1, 2), (5, 6))).unwrap();

        assert_eq!(store.wildcard_for(1, 2).unwrap().unwrap().canonical_make_id, 5);
    }

    #[test]
    fn test_triplets_conflict_with_wildcard_make() {
        let conn = conn();
        let store = MappingStore::new(&conn);
        store.save(&RegularizationMapping::wildcard((1, 2), (3, 4))).unwrap();

        let years: BTreeMap<i64, Assignment> = [(20, Assignment::Assigned(30))].into_iter().collect();
        let result = store.save_year_triplets((1, 2), (5, 4), &years, MappingSource::Manual);

        assert!(matches!(result, Err(RegularizationError::ConflictingMapping { .. })));
        assert_eq!(store.all().unwrap().len(), 1);
    }

    #[test]
    fn test_pair_rows_must_share_one_canonical_pair() {
        let conn = conn();
        let store = MappingStore::new(&conn);
        store.save(&RegularizationMapping::wildcard((1, 2), (3, 4))).unwrap();
        let before = store.all().unwrap();

        // Same canonical make, different canonical model
        let years: BTreeMap<i64, Assignment> = [(20, Assignment::Assigned(30))].into_iter().collect();
        let err = store
            .save_year_triplets((1, 2), (3, 7), &years, MappingSource::Manual)
            .unwrap_err();
        match err {
            RegularizationError::ConflictingPairTarget {
                uncurated,
                existing_canonical,
                requested_canonical,
            } => {
                assert_eq!(uncurated, (1, 2));
                assert_eq!(existing_canonical, (3, 4));
                assert_eq!(requested_canonical, (3, 7));
            }
            other => panic!("expected ConflictingPairTarget, got {:?}", other),
        }
        assert!(store
            .save(&RegularizationMapping::triplet((1, 2), 21, (3, 7)))
            .unwrap_err()
            .is_rejection());
        assert_eq!(store.all().unwrap(), before);

        // Another model of the same make may still map elsewhere
        store.save(&RegularizationMapping::wildcard((1, 5), (3, 7))).unwrap();

        // Re-pointing requires removing the pair's rows first
        store.delete_pair(1, 2).unwrap();
        assert_eq!(store.save_year_triplets((1, 2), (3, 7), &years, MappingSource::Manual).unwrap(), 1);
    }

    #[test]
    fn test_save_year_triplets_writes_unassigned_rows() {
        let conn = conn();
        let store = MappingStore::new(&conn);

        let years: BTreeMap<i64, Assignment> = [
            (20, Assignment::Assigned(30)),
            (21, Assignment::Unassigned),
            (22, Assignment::Unknown),
        ]
        .into_iter()
        .collect();

        let written = store
            .save_year_triplets((1, 2), (3, 4), &years, MappingSource::Manual)
            .unwrap();
        assert_eq!(written, 3);

        let rows = store.for_pair(1, 2).unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.model_year_id.is_some()));
        assert_eq!(rows[1].fuel_type, Assignment::Unassigned);
        assert_eq!(rows[2].fuel_type, Assignment::Unknown);

        // Re-saving updates in place
        let years: BTreeMap<i64, Assignment> = [(21, Assignment::Assigned(31))].into_iter().collect();
        store
            .save_year_triplets((1, 2), (3, 4), &years, MappingSource::Manual)
            .unwrap();
        let rows = store.for_pair(1, 2).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1].fuel_type, Assignment::Assigned(31));
    }

    #[test]
    fn test_delete_is_manual_and_scoped() {
        let conn = conn();
        let store = MappingStore::new(&conn);

        store.save(&RegularizationMapping::wildcard((1, 2), (3, 4))).unwrap();
        store.save(&RegularizationMapping::triplet((1, 2), 20, (3, 4))).unwrap();
        store.save(&RegularizationMapping::wildcard((1, 5), (3, 6))).unwrap();

        let wildcard_key = MappingKey {
            uncurated_make_id: 1,
            uncurated_model_id: 2,
            model_year_id: None,
        };
        assert!(store.delete(&wildcard_key).unwrap());
        assert!(!store.delete(&wildcard_key).unwrap());
        assert_eq!(store.for_pair(1, 2).unwrap().len(), 1);

        assert_eq!(store.delete_pair(1, 2).unwrap(), 1);
        assert_eq!(store.all().unwrap().len(), 1);
    }

    #[test]
    fn test_invalid_ids_rejected() {
        let conn = conn();
        let store = MappingStore::new(&conn);

        let bad_canonical = RegularizationMapping::wildcard((1, 2), (UNKNOWN_SENTINEL_ID, 4));
        assert!(matches!(store.save(&bad_canonical), Err(RegularizationError::InvalidInput(_))));

        let bad_payload = RegularizationMapping::wildcard((1, 2), (3, 4))
            .with_vehicle_type(Assignment::Assigned(UNKNOWN_SENTINEL_ID));
        assert!(matches!(store.save(&bad_payload), Err(RegularizationError::InvalidInput(_))));
        assert!(store.all().unwrap().is_empty());
    }

    #[test]
    fn test_mutations_invalidate_caches() {
        let conn = conn();
        let caches = CacheController::new();
        caches.hierarchy.get_or_populate(false, || Ok(Hierarchy::assemble(vec![], &HierarchyCodes::default()))).unwrap();
        caches.uncurated_pairs.get_or_populate(false, || Ok(vec![])).unwrap();

        let store = MappingStore::with_cache_invalidation(&conn, &caches);
        store.save(&RegularizationMapping::wildcard((1, 2), (3, 4))).unwrap();

        assert_eq!(caches.hierarchy.phase(), CachePhase::Stale);
        assert_eq!(caches.uncurated_pairs.phase(), CachePhase::Stale);

        // A rejected save must not invalidate anything
        caches.hierarchy.get_or_populate(false, || Ok(Hierarchy::assemble(vec![], &HierarchyCodes::default()))).unwrap();
        store.save(&RegularizationMapping::wildcard((1, 9), (5, 4))).unwrap_err();
        assert_eq!(caches.hierarchy.phase(), CachePhase::Populated);
    }

    #[test]
    fn test_statistics() {
        let conn = conn();
        let store = MappingStore::new(&conn);

        store
            .save(
                &RegularizationMapping::wildcard((1, 2), (3, 4))
                    .with_vehicle_type(Assignment::Assigned(5))
                    .with_source(MappingSource::Auto),
            )
            .unwrap();
        store.save(&RegularizationMapping::wildcard((6, 7), (8, 9))).unwrap();
        store
            .save(&RegularizationMapping::triplet((1, 2), 20, (3, 4)).with_fuel_type(Assignment::Unknown))
            .unwrap();

        let stats = store.statistics().unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.wildcard, 2);
        assert_eq!(stats.triplet, 1);
        assert_eq!(stats.auto, 1);
        assert_eq!(stats.uncurated_pairs, 2);
        assert_eq!(stats.uncurated_makes, 2);
        assert_eq!(stats.vehicle_types.assigned, 1);
        assert_eq!(stats.vehicle_types.unassigned, 1);
        assert_eq!(stats.fuel_types.unknown, 1);
    }

    // ========================================================================
    // COMPLETENESS
    // ========================================================================

    /// Canonical pair (3, 4): model year 20 has fuel 30, model year 21 has no fuel data
    fn completeness_hierarchy() -> Hierarchy {
        let entry = |model_year_id, fuel_type_id| CanonicalHierarchyEntry {
            make_id: 3,
            model_id: 4,
            model_year_id,
            fuel_type_id,
            vehicle_type_id: Some(50),
            record_count: 1,
        };
        Hierarchy::assemble(vec![entry(20, Some(30)), entry(21, None)], &HierarchyCodes::default())
    }

    #[test]
    fn test_completeness_unmapped() {
        assert_eq!(assess_completeness(&[], &completeness_hierarchy()), Completeness::Unmapped);
    }

    #[test]
    fn test_completeness_complete_with_unknown() {
        let hierarchy = completeness_hierarchy();
        let rows = vec![
            RegularizationMapping::wildcard((1, 2), (3, 4)).with_vehicle_type(Assignment::Unknown),
            RegularizationMapping::triplet((1, 2), 20, (3, 4)).with_fuel_type(Assignment::Unknown),
            // No curated fuel data for model year 21, so Unassigned is acceptable
            RegularizationMapping::triplet((1, 2), 21, (3, 4)),
        ];

        assert!(assess_completeness(&rows, &hierarchy).is_complete());
    }

    #[test]
    fn test_completeness_unassigned_triplet_is_not_complete() {
        let hierarchy = completeness_hierarchy();
        let rows = vec![
            RegularizationMapping::wildcard((1, 2), (3, 4)).with_vehicle_type(Assignment::Assigned(50)),
            RegularizationMapping::triplet((1, 2), 20, (3, 4)),
            RegularizationMapping::triplet((1, 2), 21, (3, 4)),
        ];

        assert_eq!(
            assess_completeness(&rows, &hierarchy),
            Completeness::Incomplete {
                vehicle_type_pending: false,
                missing_model_years: vec![],
                unassigned_model_years: vec![20],
            }
        );
    }

    #[test]
    fn test_completeness_missing_rows_and_pending_vehicle_type() {
        let hierarchy = completeness_hierarchy();
        let rows = vec![
            RegularizationMapping::wildcard((1, 2), (3, 4)),
            RegularizationMapping::triplet((1, 2), 20, (3, 4)).with_fuel_type(Assignment::Assigned(30)),
        ];

        assert_eq!(
            assess_completeness(&rows, &hierarchy),
            Completeness::Incomplete {
                vehicle_type_pending: true,
                missing_model_years: vec![21],
                unassigned_model_years: vec![],
            }
        );
    }

    #[test]
    fn test_assignment_parse() {
        assert_eq!(Assignment::parse("unknown"), Some(Assignment::Unknown));
        assert_eq!(Assignment::parse(""), Some(Assignment::Unassigned));
        assert_eq!(Assignment::parse("12"), Some(Assignment::Assigned(12)));
        assert_eq!(Assignment::parse("-1"), None);
        assert_eq!(Assignment::parse("diesel"), None);
    }

    #[test]
    fn test_assignment_serde_is_tagged() {
        let json = serde_json::to_string(&Assignment::Assigned(4)).unwrap();
        assert_eq!(json, r#"{"state":"assigned","id":4}"#);
        let unknown: Assignment = serde_json::from_str(r#"{"state":"unknown"}"#).unwrap();
        assert_eq!(unknown, Assignment::Unknown);
    }
}
