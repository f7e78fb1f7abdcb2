// 🌳 Canonical Hierarchy Builder - the authoritative taxonomy from curated years
//
// Make → Model → ModelYear → {FuelType, VehicleType}, with record counts.
// Only curated-year rows contribute. The flat entry list is memoized in
// canonical_hierarchy_cache; the tree is assembled in memory on top of it.

use crate::cache::{self, CacheMetadata};
use crate::config::YearPartition;
use crate::db::{self, placeholders, CANONICAL_HIERARCHY_CACHE};
use crate::enumeration::{Dimension, EnumerationStore};
use crate::error::Result;
use rusqlite::{params, params_from_iter, Connection};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info};

// ============================================================================
// FLAT ENTRY
// ============================================================================

/// One distinct (make, model, model year, fuel type, vehicle type) tuple seen in curated years
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CanonicalHierarchyEntry {
    pub make_id: i64,
    pub model_id: i64,
    pub model_year_id: i64,
    pub fuel_type_id: Option<i64>,
    pub vehicle_type_id: Option<i64>,
    pub record_count: i64,
}

// ============================================================================
// TREE NODES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountedValue {
    /// None = the curated rows had no value for this field
    pub id: Option<i64>,
    pub code: Option<String>,
    pub record_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelYearNode {
    pub model_year_id: i64,
    pub code: String,
    pub record_count: i64,
    pub fuel_types: Vec<CountedValue>,
    pub vehicle_types: Vec<CountedValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelNode {
    pub model_id: i64,
    pub code: String,
    pub record_count: i64,
    pub model_years: Vec<ModelYearNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MakeNode {
    pub make_id: i64,
    pub code: String,
    pub record_count: i64,
    pub models: Vec<ModelNode>,
}

/// Per-pair facts used by auto-regularization, completeness and suggestions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PairSummary {
    pub record_count: i64,
    pub model_years: BTreeSet<i64>,
    pub vehicle_types: BTreeSet<i64>,
    pub fuel_types_by_model_year: BTreeMap<i64, BTreeSet<i64>>,
}

// ============================================================================
// HIERARCHY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hierarchy {
    pub entries: Vec<CanonicalHierarchyEntry>,
    pub makes: Vec<MakeNode>,

    #[serde(skip)]
    pairs: HashMap<(i64, i64), PairSummary>,

    #[serde(skip)]
    pairs_by_text: HashMap<(String, String), (i64, i64)>,
}

/// Code lookups needed to label the tree
#[derive(Debug, Clone, Default)]
pub struct HierarchyCodes {
    pub makes: HashMap<i64, String>,
    pub models: HashMap<i64, String>,
    pub model_years: HashMap<i64, String>,
    pub fuel_types: HashMap<i64, String>,
    pub vehicle_types: HashMap<i64, String>,
}

impl HierarchyCodes {
    pub fn load(conn: &Connection) -> Result<Self> {
        let store = EnumerationStore::new(conn);
        Ok(HierarchyCodes {
            makes: store.code_map(Dimension::Make)?,
            models: store.code_map(Dimension::Model)?,
            model_years: store.code_map(Dimension::ModelYear)?,
            fuel_types: store.code_map(Dimension::FuelType)?,
            vehicle_types: store.code_map(Dimension::VehicleType)?,
        })
    }
}

fn code_or_id(codes: &HashMap<i64, String>, id: i64) -> String {
    codes.get(&id).cloned().unwrap_or_else(|| format!("#{}", id))
}

impl Hierarchy {
    /// Assemble the tree and lookup indexes from flat entries
    pub fn assemble(mut entries: Vec<CanonicalHierarchyEntry>, codes: &HierarchyCodes) -> Self {
        entries.sort();

        // make → model → model year → (count, fuel counts, vehicle type counts)
        type YearAgg = (i64, BTreeMap<Option<i64>, i64>, BTreeMap<Option<i64>, i64>);
        let mut tree: BTreeMap<i64, BTreeMap<i64, BTreeMap<i64, YearAgg>>> = BTreeMap::new();
        let mut pairs: HashMap<(i64, i64), PairSummary> = HashMap::new();

        for e in &entries {
            let year = tree
                .entry(e.make_id)
                .or_default()
                .entry(e.model_id)
                .or_default()
                .entry(e.model_year_id)
                .or_default();
            year.0 += e.record_count;
            *year.1.entry(e.fuel_type_id).or_default() += e.record_count;
            *year.2.entry(e.vehicle_type_id).or_default() += e.record_count;

            let summary = pairs.entry((e.make_id, e.model_id)).or_default();
            summary.record_count += e.record_count;
            summary.model_years.insert(e.model_year_id);
            if let Some(vt) = e.vehicle_type_id {
                summary.vehicle_types.insert(vt);
            }
            let fuels = summary
                .fuel_types_by_model_year
                .entry(e.model_year_id)
                .or_default();
            if let Some(ft) = e.fuel_type_id {
                fuels.insert(ft);
            }
        }

        let counted = |values: BTreeMap<Option<i64>, i64>, lookup: &HashMap<i64, String>| {
            values
                .into_iter()
                .map(|(id, record_count)| CountedValue {
                    id,
                    code: id.map(|id| code_or_id(lookup, id)),
                    record_count,
                })
                .collect::<Vec<_>>()
        };

        let mut makes: Vec<MakeNode> = tree
            .into_iter()
            .map(|(make_id, models)| {
                let mut models: Vec<ModelNode> = models
                    .into_iter()
                    .map(|(model_id, years)| {
                        let model_years: Vec<ModelYearNode> = years
                            .into_iter()
                            .map(|(model_year_id, (count, fuels, types))| ModelYearNode {
                                model_year_id,
                                code: code_or_id(&codes.model_years, model_year_id),
                                record_count: count,
                                fuel_types: counted(fuels, &codes.fuel_types),
                                vehicle_types: counted(types, &codes.vehicle_types),
                            })
                            .collect();
                        ModelNode {
                            model_id,
                            code: code_or_id(&codes.models, model_id),
                            record_count: model_years.iter().map(|y| y.record_count).sum(),
                            model_years,
                        }
                    })
                    .collect();
                models.sort_by(|a, b| a.code.cmp(&b.code).then(a.model_id.cmp(&b.model_id)));

                MakeNode {
                    make_id,
                    code: code_or_id(&codes.makes, make_id),
                    record_count: models.iter().map(|m| m.record_count).sum(),
                    models,
                }
            })
            .collect();
        makes.sort_by(|a, b| a.code.cmp(&b.code).then(a.make_id.cmp(&b.make_id)));

        let pairs_by_text = pairs
            .keys()
            .filter_map(|&(make_id, model_id)| {
                let make = codes.makes.get(&make_id)?;
                let model = codes.models.get(&model_id)?;
                Some(((make.clone(), model.clone()), (make_id, model_id)))
            })
            .collect();

        Hierarchy {
            entries,
            makes,
            pairs,
            pairs_by_text,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_records(&self) -> i64 {
        self.entries.iter().map(|e| e.record_count).sum()
    }

    pub fn pair_count(&self) -> usize {
        self.pairs.len()
    }

    pub fn contains_pair(&self, make_id: i64, model_id: i64) -> bool {
        self.pairs.contains_key(&(make_id, model_id))
    }

    pub fn pair(&self, make_id: i64, model_id: i64) -> Option<&PairSummary> {
        self.pairs.get(&(make_id, model_id))
    }

    /// Every canonical (make, model) pair
    pub fn pairs(&self) -> impl Iterator<Item = (i64, i64)> + '_ {
        self.pairs.keys().copied()
    }

    /// Canonical pair whose codes equal the given text exactly
    pub fn pair_by_text(&self, make_code: &str, model_code: &str) -> Option<(i64, i64)> {
        self.pairs_by_text
            .get(&(make_code.to_string(), model_code.to_string()))
            .copied()
    }

    /// Codes of a canonical pair, if both are known
    pub fn pair_codes(&self, make_id: i64, model_id: i64) -> Option<(&str, &str)> {
        let make = self.makes.iter().find(|m| m.make_id == make_id)?;
        let model = make.models.iter().find(|m| m.model_id == model_id)?;
        Some((make.code.as_str(), model.code.as_str()))
    }

    pub fn vehicle_types_for_pair(&self, make_id: i64, model_id: i64) -> BTreeSet<i64> {
        self.pair(make_id, model_id)
            .map(|p| p.vehicle_types.clone())
            .unwrap_or_default()
    }

    pub fn model_years_for_pair(&self, make_id: i64, model_id: i64) -> BTreeSet<i64> {
        self.pair(make_id, model_id)
            .map(|p| p.model_years.clone())
            .unwrap_or_default()
    }

    /// Fuel types recorded for a pair in one model year (empty when the curated rows had none)
    pub fn fuel_types_for(&self, make_id: i64, model_id: i64, model_year_id: i64) -> BTreeSet<i64> {
        self.pair(make_id, model_id)
            .and_then(|p| p.fuel_types_by_model_year.get(&model_year_id).cloned())
            .unwrap_or_default()
    }
}

// ============================================================================
// LIVE COMPUTATION + CACHE TABLE
// ============================================================================

/// Group-by over curated-year registrations (no cache involved)
pub fn compute_entries(conn: &Connection, partition: &YearPartition) -> Result<Vec<CanonicalHierarchyEntry>> {
    let curated = partition.curated_years();
    let sql = format!(
        "SELECT make_id, model_id, model_year_id, fuel_type_id, vehicle_type_id, COUNT(*)
         FROM registrations
         WHERE year IN ({})
         GROUP BY make_id, model_id, model_year_id, fuel_type_id, vehicle_type_id
         ORDER BY make_id, model_id, model_year_id, fuel_type_id, vehicle_type_id",
        placeholders(curated.len())
    );

    let mut stmt = conn.prepare(&sql)?;
    let entries = stmt
        .query_map(params_from_iter(curated.iter()), |row| {
            Ok(CanonicalHierarchyEntry {
                make_id: row.get(0)?,
                model_id: row.get(1)?,
                model_year_id: row.get(2)?,
                fuel_type_id: row.get(3)?,
                vehicle_type_id: row.get(4)?,
                record_count: row.get(5)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(entries)
}

pub fn read_cache(conn: &Connection) -> Result<Vec<CanonicalHierarchyEntry>> {
    let mut stmt = conn.prepare(
        "SELECT make_id, model_id, model_year_id, fuel_type_id, vehicle_type_id, record_count
         FROM canonical_hierarchy_cache
         ORDER BY make_id, model_id, model_year_id, fuel_type_id, vehicle_type_id",
    )?;

    let entries = stmt
        .query_map([], |row| {
            Ok(CanonicalHierarchyEntry {
                make_id: row.get(0)?,
                model_id: row.get(1)?,
                model_year_id: row.get(2)?,
                fuel_type_id: row.get(3)?,
                vehicle_type_id: row.get(4)?,
                record_count: row.get(5)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(entries)
}

/// Replace the cache table contents in one transaction
pub fn write_cache(
    conn: &Connection,
    entries: &[CanonicalHierarchyEntry],
    partition: &YearPartition,
) -> Result<()> {
    let tx = conn.unchecked_transaction()?;

    tx.execute("DELETE FROM canonical_hierarchy_cache", [])?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO canonical_hierarchy_cache (
                make_id, model_id, model_year_id, fuel_type_id, vehicle_type_id, record_count
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        for e in entries {
            stmt.execute(params![
                e.make_id,
                e.model_id,
                e.model_year_id,
                e.fuel_type_id,
                e.vehicle_type_id,
                e.record_count,
            ])?;
        }
    }
    cache::mark_populated(&tx, CANONICAL_HIERARCHY_CACHE, &partition.key())?;

    tx.commit()?;
    Ok(())
}

// ============================================================================
// BUILDER
// ============================================================================

pub struct CanonicalHierarchyBuilder<'p> {
    partition: &'p YearPartition,
}

impl<'p> CanonicalHierarchyBuilder<'p> {
    pub fn new(partition: &'p YearPartition) -> Self {
        CanonicalHierarchyBuilder { partition }
    }

    /// Hierarchy from the cache table, recomputing it when empty, stale, or forced
    pub fn build(&self, conn: &Connection, force_refresh: bool) -> Result<Hierarchy> {
        db::ensure_cache_table(conn, CANONICAL_HIERARCHY_CACHE)?;

        let metadata = CacheMetadata::load(conn, CANONICAL_HIERARCHY_CACHE)?;
        let fresh = metadata
            .as_ref()
            .map(|m| m.is_fresh_for(&self.partition.key()))
            .unwrap_or(false);

        let entries = if fresh && !force_refresh {
            debug!("Canonical hierarchy served from cache table");
            read_cache(conn)?
        } else {
            let entries = compute_entries(conn, self.partition)?;
            write_cache(conn, &entries, self.partition)?;
            info!(
                "Canonical hierarchy rebuilt: {} entries from {} curated years",
                entries.len(),
                self.partition.curated.len()
            );
            entries
        };

        Ok(Hierarchy::assemble(entries, &HierarchyCodes::load(conn)?))
    }

    /// Hierarchy computed straight from registrations, leaving the cache alone
    pub fn build_live(&self, conn: &Connection) -> Result<Hierarchy> {
        let entries = compute_entries(conn, self.partition)?;
        Ok(Hierarchy::assemble(entries, &HierarchyCodes::load(conn)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{insert_registrations, setup_database, RegistrationRecord};

    struct Fixture {
        conn: Connection,
        johnd: i64,
        m6300: i64,
        m7200: i64,
        y2008: i64,
        y2009: i64,
        gas: i64,
        au: i64,
        ca: i64,
    }

    fn fixture() -> Fixture {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        let store = EnumerationStore::new(&conn);

        let f = Fixture {
            johnd: store.get_or_create(Dimension::Make, "JOHND", None).unwrap(),
            m6300: store.get_or_create(Dimension::Model, "6300", None).unwrap(),
            m7200: store.get_or_create(Dimension::Model, "7200", None).unwrap(),
            y2008: store.get_or_create(Dimension::ModelYear, "2008", None).unwrap(),
            y2009: store.get_or_create(Dimension::ModelYear, "2009", None).unwrap(),
            gas: store.get_or_create(Dimension::FuelType, "E", Some("Gasoline")).unwrap(),
            au: store.get_or_create(Dimension::VehicleType, "AU", None).unwrap(),
            ca: store.get_or_create(Dimension::VehicleType, "CA", None).unwrap(),
            conn,
        };

        let row = |year, model_id, model_year_id, fuel, vt| RegistrationRecord {
            year,
            make_id: f.johnd,
            model_id,
            model_year_id,
            fuel_type_id: fuel,
            vehicle_type_id: vt,
        };

        insert_registrations(
            &f.conn,
            &[
                row(2020, f.m6300, f.y2008, Some(f.gas), Some(f.au)),
                row(2021, f.m6300, f.y2008, Some(f.gas), Some(f.au)),
                row(2021, f.m6300, f.y2009, None, Some(f.ca)),
                row(2021, f.m7200, f.y2009, Some(f.gas), Some(f.ca)),
                // Uncurated year - must not appear in the hierarchy
                row(2023, f.m7200, f.y2008, None, None),
            ],
        )
        .unwrap();

        f
    }

    fn partition() -> YearPartition {
        YearPartition::new(vec![2020, 2021], vec![2023]).unwrap()
    }

    #[test]
    fn test_entries_only_from_curated_years() {
        let f = fixture();
        let entries = compute_entries(&f.conn, &partition()).unwrap();

        assert_eq!(entries.len(), 3);
        assert_eq!(entries.iter().map(|e| e.record_count).sum::<i64>(), 4);
        assert!(entries
            .iter()
            .all(|e| !(e.model_id == f.m7200 && e.model_year_id == f.y2008)));
    }

    #[test]
    fn test_tree_shape_and_counts() {
        let f = fixture();
        let hierarchy = CanonicalHierarchyBuilder::new(&partition())
            .build(&f.conn, false)
            .unwrap();

        assert_eq!(hierarchy.makes.len(), 1);
        let make = &hierarchy.makes[0];
        assert_eq!(make.code, "JOHND");
        assert_eq!(make.record_count, 4);
        assert_eq!(make.models.len(), 2);

        let m6300 = make.models.iter().find(|m| m.code == "6300").unwrap();
        assert_eq!(m6300.record_count, 3);
        assert_eq!(m6300.model_years.len(), 2);

        let y2008 = &m6300.model_years[0];
        assert_eq!(y2008.code, "2008");
        assert_eq!(y2008.fuel_types.len(), 1);
        assert_eq!(y2008.fuel_types[0].code.as_deref(), Some("E"));
        assert_eq!(y2008.fuel_types[0].record_count, 2);
    }

    #[test]
    fn test_pair_lookups() {
        let f = fixture();
        let hierarchy = CanonicalHierarchyBuilder::new(&partition())
            .build_live(&f.conn)
            .unwrap();

        assert!(hierarchy.contains_pair(f.johnd, f.m6300));
        assert_eq!(hierarchy.pair_by_text("JOHND", "6300"), Some((f.johnd, f.m6300)));
        assert_eq!(hierarchy.pair_by_text("JHOND", "6300"), None);
        assert_eq!(hierarchy.pair_codes(f.johnd, f.m7200), Some(("JOHND", "7200")));

        let types = hierarchy.vehicle_types_for_pair(f.johnd, f.m6300);
        assert_eq!(types, [f.au, f.ca].into_iter().collect());

        assert_eq!(
            hierarchy.fuel_types_for(f.johnd, f.m6300, f.y2008),
            [f.gas].into_iter().collect()
        );
        assert!(hierarchy.fuel_types_for(f.johnd, f.m6300, f.y2009).is_empty());
        assert_eq!(
            hierarchy.model_years_for_pair(f.johnd, f.m6300),
            [f.y2008, f.y2009].into_iter().collect()
        );
    }

    #[test]
    fn test_cached_equals_live() {
        let f = fixture();
        let builder_partition = partition();
        let builder = CanonicalHierarchyBuilder::new(&builder_partition);

        let first = builder.build(&f.conn, false).unwrap();
        let from_cache = builder.build(&f.conn, false).unwrap();
        let live = builder.build_live(&f.conn).unwrap();

        assert_eq!(first, from_cache);
        assert_eq!(from_cache, live);
        assert_eq!(read_cache(&f.conn).unwrap(), live.entries);
    }

    #[test]
    fn test_partition_change_rebuilds_cache() {
        let f = fixture();
        CanonicalHierarchyBuilder::new(&partition())
            .build(&f.conn, false)
            .unwrap();

        let wider = YearPartition::new(vec![2020, 2021, 2023], Vec::<i64>::new()).unwrap();
        let hierarchy = CanonicalHierarchyBuilder::new(&wider)
            .build(&f.conn, false)
            .unwrap();

        assert_eq!(hierarchy.total_records(), 5);
        assert!(hierarchy.contains_pair(f.johnd, f.m7200));
        assert_eq!(
            hierarchy.model_years_for_pair(f.johnd, f.m7200),
            [f.y2008, f.y2009].into_iter().collect()
        );
    }
}
