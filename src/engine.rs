// 🧭 Regularization Engine - the surface the UI layer talks to
//
// Owns the database handle, the active year partition and both derived-view
// caches. Every method opens its own connection, so the engine can be shared
// across threads behind an Arc.
//
// Cache failures never surface as errors: the engine computes live instead,
// and serves the last snapshot if even that fails.

use crate::auto_regularize::{propose_year_triplets, AutoRegularizationReport, AutoRegularizer};
use crate::cache::{CacheController, CacheStatus};
use crate::config::{EngineConfig, YearPartition};
use crate::db::{Database, RegistrationRecord};
use crate::enumeration::{Dimension, EnumEntry, EnumerationStore};
use crate::error::{RegularizationError, Result};
use crate::expansion::{self, ExpandedSelection, ExpansionOptions, MappingIndex};
use crate::hierarchy::{CanonicalHierarchyBuilder, Hierarchy};
use crate::import::{ImportReport, RegistrationImporter};
use crate::mapping::{
    assess_completeness, Assignment, Completeness, MappingKey, MappingSource, MappingStatistics,
    MappingStore, RegularizationMapping,
};
use crate::query::{self, QueryOptions, RegistrationFilter};
use crate::suggest::{CanonicalSuggestion, PairSuggester};
use crate::uncurated::{select_pairs, UncuratedPair, UncuratedPairDetector};
use rusqlite::Connection;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

/// Live result if there is one, else the last cached snapshot
fn fail_soft<T>(live: Result<T>, snapshot: Option<Arc<T>>) -> Result<Arc<T>> {
    match (live, snapshot) {
        (Ok(value), _) => Ok(Arc::new(value)),
        (Err(e), Some(snapshot)) => {
            warn!("Live computation failed ({}), serving last snapshot", e);
            Ok(snapshot)
        }
        (Err(e), None) => Err(e),
    }
}

pub struct RegularizationEngine {
    db: Database,
    config: EngineConfig,
    partition: RwLock<YearPartition>,
    caches: CacheController,
}

impl RegularizationEngine {
    /// Open the configured database (creating the schema if needed)
    pub fn open(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let db = Database::open(&config.database_path)?;
        Self::with_database(db, config)
    }

    pub fn with_database(db: Database, config: EngineConfig) -> Result<Self> {
        let partition = config.year_partition()?;
        info!("Regularization engine ready (partition {})", partition.key());

        Ok(RegularizationEngine {
            db,
            config,
            partition: RwLock::new(partition),
            caches: CacheController::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn caches(&self) -> &CacheController {
        &self.caches
    }

    pub fn cache_status(&self) -> CacheStatus {
        self.caches.status()
    }

    fn connect(&self) -> Result<Connection> {
        self.db.connect()
    }

    // ========================================================================
    // PARTITION + OPTIONS
    // ========================================================================

    pub fn year_partition(&self) -> YearPartition {
        self.partition
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Replace the curated/uncurated split; both caches become Stale
    pub fn set_year_partition(&self, partition: YearPartition) -> Result<()> {
        partition.validate()?;
        {
            let mut current = self
                .partition
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if *current == partition {
                return Ok(());
            }
            *current = partition;
        }

        info!("Year partition changed to {}", self.year_partition().key());
        self.invalidate_caches()
    }

    /// Query options seeded from configuration defaults
    pub fn query_options(&self) -> QueryOptions {
        QueryOptions::from_config(&self.config)
    }

    pub fn expansion_options(&self) -> ExpansionOptions {
        self.query_options().expansion()
    }

    // ========================================================================
    // DERIVED VIEWS
    // ========================================================================

    pub fn build_canonical_hierarchy(&self, force_refresh: bool) -> Result<Arc<Hierarchy>> {
        let partition = self.year_partition();
        let builder = CanonicalHierarchyBuilder::new(&partition);

        let cached = self.caches.hierarchy.get_or_populate(force_refresh, || {
            let conn = self.connect()?;
            builder.build(&conn, force_refresh)
        });

        match cached {
            Ok(hierarchy) => Ok(hierarchy),
            Err(RegularizationError::CachePopulationFailure { reason, .. }) => {
                warn!("Hierarchy cache unavailable ({}), computing live", reason);
                let live = self.connect().and_then(|conn| builder.build_live(&conn));
                fail_soft(live, self.caches.hierarchy.snapshot())
            }
            Err(e) => Err(e),
        }
    }

    /// Every uncurated pair (novel and exact), cached
    fn uncurated_pairs(&self, hierarchy: &Hierarchy, force_refresh: bool) -> Result<Arc<Vec<UncuratedPair>>> {
        let partition = self.year_partition();
        let detector = UncuratedPairDetector::new(&partition);

        let cached = self.caches.uncurated_pairs.get_or_populate(force_refresh, || {
            let conn = self.connect()?;
            detector.detect(&conn, hierarchy, force_refresh)
        });

        match cached {
            Ok(pairs) => Ok(pairs),
            Err(RegularizationError::CachePopulationFailure { reason, .. }) => {
                warn!("Uncurated pair cache unavailable ({}), computing live", reason);
                let live = self
                    .connect()
                    .and_then(|conn| detector.detect_live(&conn, hierarchy));
                fail_soft(live, self.caches.uncurated_pairs.snapshot())
            }
            Err(e) => Err(e),
        }
    }

    /// Novel pairs, plus exact matches still lacking fuel/vehicle-type assignment when asked
    pub fn find_uncurated_pairs(&self, include_exact_matches: bool) -> Result<Vec<UncuratedPair>> {
        let hierarchy = self.build_canonical_hierarchy(false)?;
        let pairs = self.uncurated_pairs(&hierarchy, false)?;

        let mut by_pair: HashMap<(i64, i64), Vec<RegularizationMapping>> = HashMap::new();
        if include_exact_matches {
            let conn = self.connect()?;
            for mapping in MappingStore::new(&conn).all()? {
                by_pair.entry(mapping.uncurated_pair()).or_default().push(mapping);
            }
        }

        Ok(select_pairs(&pairs, include_exact_matches, |make, model| {
            by_pair
                .get(&(make, model))
                .map(|rows| assess_completeness(rows, &hierarchy).is_complete())
                .unwrap_or(false)
        }))
    }

    /// Drop both caches (memory and persisted) so the next read recomputes
    pub fn invalidate_caches(&self) -> Result<()> {
        let conn = self.connect()?;
        self.caches.invalidate(&conn)
    }

    // ========================================================================
    // MAPPINGS
    // ========================================================================

    pub fn save_mapping(&self, mapping: &RegularizationMapping) -> Result<()> {
        let conn = self.connect()?;
        MappingStore::with_cache_invalidation(&conn, &self.caches).save(mapping)
    }

    pub fn save_year_triplets(
        &self,
        uncurated: (i64, i64),
        canonical: (i64, i64),
        fuel_types: &BTreeMap<i64, Assignment>,
    ) -> Result<usize> {
        let conn = self.connect()?;
        MappingStore::with_cache_invalidation(&conn, &self.caches).save_year_triplets(
            uncurated,
            canonical,
            fuel_types,
            MappingSource::Manual,
        )
    }

    pub fn delete_mapping(&self, key: &MappingKey) -> Result<bool> {
        let conn = self.connect()?;
        MappingStore::with_cache_invalidation(&conn, &self.caches).delete(key)
    }

    pub fn delete_pair_mappings(&self, uncurated_make_id: i64, uncurated_model_id: i64) -> Result<usize> {
        let conn = self.connect()?;
        MappingStore::with_cache_invalidation(&conn, &self.caches).delete_pair(uncurated_make_id, uncurated_model_id)
    }

    pub fn mappings(&self) -> Result<Vec<RegularizationMapping>> {
        let conn = self.connect()?;
        MappingStore::new(&conn).all()
    }

    pub fn mappings_for_pair(&self, uncurated_make_id: i64, uncurated_model_id: i64) -> Result<Vec<RegularizationMapping>> {
        let conn = self.connect()?;
        MappingStore::new(&conn).for_pair(uncurated_make_id, uncurated_model_id)
    }

    pub fn mapping_statistics(&self) -> Result<MappingStatistics> {
        let conn = self.connect()?;
        MappingStore::new(&conn).statistics()
    }

    pub fn auto_regularize(&self) -> Result<AutoRegularizationReport> {
        let hierarchy = self.build_canonical_hierarchy(false)?;
        let pairs = self.uncurated_pairs(&hierarchy, false)?;

        let conn = self.connect()?;
        let regularizer = AutoRegularizer::from_codes(&conn, &self.config.cardinal_vehicle_types)?;

        match regularizer.run(&MappingStore::new(&conn), &pairs, &hierarchy) {
            Ok(report) => {
                if report.changed() {
                    self.caches.invalidate(&conn)?;
                }
                Ok(report)
            }
            // Mappings saved before the failure are already committed
            Err(e) => Err(self.invalidate_after_failure(&conn, e)),
        }
    }

    /// Suggested per-model-year fuel types for a canonical pair (nothing is written)
    pub fn propose_year_triplets(&self, canonical: (i64, i64)) -> Result<BTreeMap<i64, Assignment>> {
        let hierarchy = self.build_canonical_hierarchy(false)?;
        Ok(propose_year_triplets(&hierarchy, canonical))
    }

    pub fn pair_completeness(&self, uncurated_make_id: i64, uncurated_model_id: i64) -> Result<Completeness> {
        let hierarchy = self.build_canonical_hierarchy(false)?;
        let conn = self.connect()?;
        MappingStore::new(&conn).completeness(uncurated_make_id, uncurated_model_id, &hierarchy)
    }

    pub fn suggest_canonical_pairs(
        &self,
        uncurated_make_id: i64,
        uncurated_model_id: i64,
        limit: usize,
    ) -> Result<Vec<CanonicalSuggestion>> {
        let (make_code, model_code) = {
            let conn = self.connect()?;
            let store = EnumerationStore::new(&conn);
            (
                store.require_code(Dimension::Make, uncurated_make_id)?,
                store.require_code(Dimension::Model, uncurated_model_id)?,
            )
        };

        let hierarchy = self.build_canonical_hierarchy(false)?;
        Ok(PairSuggester::new()
            .with_limit(limit)
            .suggest(&make_code, &model_code, &hierarchy))
    }

    // ========================================================================
    // EXPANSION + QUERIES
    // ========================================================================

    fn mapping_index(&self) -> Result<MappingIndex> {
        Ok(MappingIndex::from_mappings(&self.mappings()?))
    }

    pub fn expand_ids(&self, dimension: Dimension, ids: &BTreeSet<i64>, options: ExpansionOptions) -> Result<BTreeSet<i64>> {
        if !options.enabled {
            return Ok(ids.clone());
        }
        Ok(expansion::expand_ids(&self.mapping_index()?, dimension, ids, options))
    }

    pub fn expand_selection(
        &self,
        makes: &BTreeSet<i64>,
        models: &BTreeSet<i64>,
        options: ExpansionOptions,
    ) -> Result<ExpandedSelection> {
        let index = if options.enabled {
            self.mapping_index()?
        } else {
            MappingIndex::default()
        };
        Ok(expansion::expand_selection(&index, makes, models, options))
    }

    pub fn count_registrations(&self, filter: &RegistrationFilter, options: &QueryOptions) -> Result<i64> {
        let conn = self.connect()?;
        query::count_matching(&conn, filter, options)
    }

    pub fn count_registrations_by_year(&self, filter: &RegistrationFilter, options: &QueryOptions) -> Result<Vec<(i64, i64)>> {
        let conn = self.connect()?;
        query::count_by_year(&conn, filter, options)
    }

    pub fn matching_registrations(
        &self,
        filter: &RegistrationFilter,
        options: &QueryOptions,
        limit: Option<usize>,
    ) -> Result<Vec<RegistrationRecord>> {
        let conn = self.connect()?;
        query::matching_rows(&conn, filter, options, limit)
    }

    // ========================================================================
    // ENUMERATIONS + INGESTION
    // ========================================================================

    /// ID of an existing code
    pub fn resolve_code(&self, dimension: Dimension, code: &str) -> Result<i64> {
        let conn = self.connect()?;
        EnumerationStore::new(&conn)
            .id_for(dimension, code)?
            .ok_or_else(|| RegularizationError::NotFound(format!("{} '{}'", dimension.as_str(), code.trim())))
    }

    pub fn enum_entries(&self, dimension: Dimension) -> Result<Vec<EnumEntry>> {
        let conn = self.connect()?;
        EnumerationStore::new(&conn).all(dimension)
    }

    /// Load a registrations CSV; derived views become Stale
    pub fn import_csv(&self, path: &Path) -> Result<ImportReport> {
        let conn = self.connect()?;
        let importer = RegistrationImporter::new().with_batch_size(self.config.import_batch_size);

        match importer.import_file(&conn, path) {
            Ok(report) => {
                if report.rows_inserted > 0 {
                    self.caches.invalidate(&conn)?;
                }
                Ok(report)
            }
            // Earlier batches may have been committed
            Err(e) => Err(self.invalidate_after_failure(&conn, e)),
        }
    }

    /// Invalidate after a partially applied mutation, returning the original error
    fn invalidate_after_failure(&self, conn: &Connection, error: RegularizationError) -> RegularizationError {
        if let Err(invalidation) = self.caches.invalidate(conn) {
            warn!("Cache invalidation after failed mutation also failed: {}", invalidation);
        }
        error
    }
}
