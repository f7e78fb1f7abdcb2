// 🔎 Uncurated Pair Detector
//
// Anti-join of uncurated-year (make, model) pairs against the canonical
// hierarchy's (make, model) projection. Spelling-level novelty only: a pair
// seen in curated years is never "novel", whatever its model years or fuel types.

use crate::cache::{self, CacheMetadata};
use crate::config::YearPartition;
use crate::db::{self, placeholders, UNCURATED_PAIRS_CACHE};
use crate::enumeration::{Dimension, EnumerationStore};
use crate::error::Result;
use crate::hierarchy::Hierarchy;
use rusqlite::{params, params_from_iter, Connection};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UncuratedPair {
    pub make_id: i64,
    pub model_id: i64,
    pub make_code: String,
    pub model_code: String,
    pub record_count: i64,
    /// First and last registration year the pair appears in (uncurated years only)
    pub earliest_year: i64,
    pub latest_year: i64,
    /// Text equals a canonical pair; still listed until its mappings are complete
    pub exact_match: bool,
}

impl UncuratedPair {
    pub fn key(&self) -> (i64, i64) {
        (self.make_id, self.model_id)
    }
}

fn sort_pairs(pairs: &mut [UncuratedPair]) {
    pairs.sort_by(|a, b| {
        a.make_code
            .cmp(&b.make_code)
            .then_with(|| a.model_code.cmp(&b.model_code))
            .then_with(|| a.key().cmp(&b.key()))
    });
}

fn label(codes: &HashMap<i64, String>, id: i64) -> String {
    codes.get(&id).cloned().unwrap_or_else(|| format!("#{}", id))
}

// ============================================================================
// LIVE COMPUTATION + CACHE TABLE
// ============================================================================

/// Every uncurated-year pair, flagged with whether it exists in the hierarchy
pub fn compute_pairs(
    conn: &Connection,
    partition: &YearPartition,
    hierarchy: &Hierarchy,
) -> Result<Vec<UncuratedPair>> {
    let uncurated = partition.uncurated_years();
    if uncurated.is_empty() {
        return Ok(Vec::new());
    }

    let sql = format!(
        "SELECT make_id, model_id, COUNT(*), MIN(year), MAX(year)
         FROM registrations
         WHERE year IN ({})
         GROUP BY make_id, model_id",
        placeholders(uncurated.len())
    );

    let store = EnumerationStore::new(conn);
    let makes = store.code_map(Dimension::Make)?;
    let models = store.code_map(Dimension::Model)?;

    let mut stmt = conn.prepare(&sql)?;
    let mut pairs = stmt
        .query_map(params_from_iter(uncurated.iter()), |row| {
            let make_id: i64 = row.get(0)?;
            let model_id: i64 = row.get(1)?;
            Ok(UncuratedPair {
                make_id,
                model_id,
                make_code: label(&makes, make_id),
                model_code: label(&models, model_id),
                record_count: row.get(2)?,
                earliest_year: row.get(3)?,
                latest_year: row.get(4)?,
                exact_match: hierarchy.contains_pair(make_id, model_id),
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    sort_pairs(&mut pairs);
    Ok(pairs)
}

pub fn read_cache(conn: &Connection) -> Result<Vec<UncuratedPair>> {
    let mut stmt = conn.prepare(
        "SELECT c.make_id, c.model_id, mk.code, md.code,
                c.record_count, c.earliest_year, c.latest_year, c.exact_match
         FROM uncurated_pairs_cache c
         LEFT JOIN make_enum mk ON mk.id = c.make_id
         LEFT JOIN model_enum md ON md.id = c.model_id",
    )?;

    let mut pairs = stmt
        .query_map([], |row| {
            let make_id: i64 = row.get(0)?;
            let model_id: i64 = row.get(1)?;
            let make_code: Option<String> = row.get(2)?;
            let model_code: Option<String> = row.get(3)?;
            Ok(UncuratedPair {
                make_id,
                model_id,
                make_code: make_code.unwrap_or_else(|| format!("#{}", make_id)),
                model_code: model_code.unwrap_or_else(|| format!("#{}", model_id)),
                record_count: row.get(4)?,
                earliest_year: row.get(5)?,
                latest_year: row.get(6)?,
                exact_match: row.get::<_, i64>(7)? != 0,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    sort_pairs(&mut pairs);
    Ok(pairs)
}

/// Replace the cache table contents in one transaction
pub fn write_cache(conn: &Connection, pairs: &[UncuratedPair], partition: &YearPartition) -> Result<()> {
    let tx = conn.unchecked_transaction()?;

    tx.execute("DELETE FROM uncurated_pairs_cache", [])?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO uncurated_pairs_cache (
                make_id, model_id, record_count, earliest_year, latest_year, exact_match
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        for p in pairs {
            stmt.execute(params![
                p.make_id,
                p.model_id,
                p.record_count,
                p.earliest_year,
                p.latest_year,
                p.exact_match as i64,
            ])?;
        }
    }
    cache::mark_populated(&tx, UNCURATED_PAIRS_CACHE, &partition.key())?;

    tx.commit()?;
    Ok(())
}

/// Keep novel pairs; keep exact matches only when asked for and not yet fully regularized
/// (vehicle type or any per-year fuel type still pending)
pub fn select_pairs<F>(pairs: &[UncuratedPair], include_exact_matches: bool, fully_regularized: F) -> Vec<UncuratedPair>
where
    F: Fn(i64, i64) -> bool,
{
    pairs
        .iter()
        .filter(|p| {
            !p.exact_match
                || (include_exact_matches && !fully_regularized(p.make_id, p.model_id))
        })
        .cloned()
        .collect()
}

// ============================================================================
// DETECTOR
// ============================================================================

pub struct UncuratedPairDetector<'p> {
    partition: &'p YearPartition,
}

impl<'p> UncuratedPairDetector<'p> {
    pub fn new(partition: &'p YearPartition) -> Self {
        UncuratedPairDetector { partition }
    }

    /// All uncurated pairs (novel + exact), from the cache table when it is fresh
    pub fn detect(&self, conn: &Connection, hierarchy: &Hierarchy, force_refresh: bool) -> Result<Vec<UncuratedPair>> {
        db::ensure_cache_table(conn, UNCURATED_PAIRS_CACHE)?;

        let fresh = CacheMetadata::load(conn, UNCURATED_PAIRS_CACHE)?
            .map(|m| m.is_fresh_for(&self.partition.key()))
            .unwrap_or(false);

        if fresh && !force_refresh {
            debug!("Uncurated pairs served from cache table");
            return read_cache(conn);
        }

        let pairs = compute_pairs(conn, self.partition, hierarchy)?;
        write_cache(conn, &pairs, self.partition)?;
        info!(
            "Uncurated pairs rebuilt: {} pairs ({} novel)",
            pairs.len(),
            pairs.iter().filter(|p| !p.exact_match).count()
        );
        Ok(pairs)
    }

    pub fn detect_live(&self, conn: &Connection, hierarchy: &Hierarchy) -> Result<Vec<UncuratedPair>> {
        compute_pairs(conn, self.partition, hierarchy)
    }
}
