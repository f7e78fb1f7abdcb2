// End-to-end behaviour of RegularizationEngine against an on-disk database

use registry_regularizer::db::CANONICAL_HIERARCHY_CACHE;
use registry_regularizer::{
    Assignment, CacheMetadata, CachePhase, CanonicalHierarchyBuilder, Completeness, Coupling,
    Dimension, EngineConfig, QueryOptions, RegistrationFilter, RegularizationEngine,
    RegularizationError, RegularizationMapping, UncuratedPairDetector, YearPartition,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Barrier};
use std::thread;
use tempfile::TempDir;

const REGISTRATIONS: &str = "\
year,make,model,model_year,fuel_type,vehicle_type
2020,JOHND,6300,2008,E,AU
2020,JOHND,6300,2009,D,AU
2021,JOHND,6300,2008,E,AU
2021,JOHND,7200,2010,D,CA
2021,HONDA,CIVIC,2020,E,AU
2021,HONDA,CIVIC,2021,H,AU
2022,HONDA,CIVIC,2021,,
2022,JHOND,6330,2008,,
2022,JHOND,6330,2009,,
2023,JHOND,6330,2008,,
2023,HONDA,CIVI,2021,,
2023,HONDA,CIVIC,2021,,
";

fn config(dir: &TempDir) -> EngineConfig {
    EngineConfig {
        database_path: dir.path().join("registry.db"),
        curated_years: vec![2020, 2021],
        uncurated_years: vec![2022, 2023],
        ..Default::default()
    }
}

fn seeded() -> (TempDir, RegularizationEngine) {
    let dir = tempfile::tempdir().unwrap();
    let csv = dir.path().join("registrations.csv");
    std::fs::write(&csv, REGISTRATIONS).unwrap();

    let engine = RegularizationEngine::open(config(&dir)).unwrap();
    let report = engine.import_csv(&csv).unwrap();
    assert_eq!(report.rows_inserted, 12);
    (dir, engine)
}

fn id(engine: &RegularizationEngine, dimension: Dimension, code: &str) -> i64 {
    engine.resolve_code(dimension, code).unwrap()
}

fn set(ids: &[i64]) -> BTreeSet<i64> {
    ids.iter().copied().collect()
}

#[test]
fn concurrent_cold_reads_populate_hierarchy_once() {
    let (_dir, engine) = seeded();
    let engine = Arc::new(engine);
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let engine = Arc::clone(&engine);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                engine.build_canonical_hierarchy(false).unwrap()
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(engine.caches().hierarchy.population_count(), 1);
    assert!(results.iter().all(|h| Arc::ptr_eq(h, &results[0])));
    assert_eq!(engine.cache_status().hierarchy, CachePhase::Populated);
}

#[test]
fn concurrent_pair_listing_shares_one_population() {
    let (_dir, engine) = seeded();
    let engine = Arc::new(engine);
    let barrier = Arc::new(Barrier::new(6));

    let handles: Vec<_> = (0..6)
        .map(|_| {
            let engine = Arc::clone(&engine);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                engine.find_uncurated_pairs(false).unwrap()
            })
        })
        .collect();

    for handle in handles {
        let pairs = handle.join().unwrap();
        let codes: Vec<_> = pairs.iter().map(|p| (p.make_code.as_str(), p.model_code.as_str())).collect();
        assert_eq!(codes.len(), 2);
        assert!(codes.contains(&("JHOND", "6330")));
        assert!(codes.contains(&("HONDA", "CIVI")));
    }
    assert_eq!(engine.caches().uncurated_pairs.population_count(), 1);
}

#[test]
fn cached_views_match_live_computation() {
    let (dir, engine) = seeded();

    let cached = engine.build_canonical_hierarchy(false).unwrap();
    let pairs = engine.find_uncurated_pairs(true).unwrap();

    let conn = engine.database().connect().unwrap();
    let partition = YearPartition::new(vec![2020, 2021], vec![2022, 2023]).unwrap();
    let live = CanonicalHierarchyBuilder::new(&partition).build_live(&conn).unwrap();
    assert_eq!(*cached, live);

    let mut live_pairs = UncuratedPairDetector::new(&partition).detect_live(&conn, &live).unwrap();
    let mut cached_pairs = pairs.clone();
    live_pairs.sort_by_key(|p| p.key());
    cached_pairs.sort_by_key(|p| p.key());
    assert_eq!(cached_pairs, live_pairs);

    // A second engine reading the persisted tables sees the same views
    drop(engine);
    let reopened = RegularizationEngine::open(config(&dir)).unwrap();
    assert_eq!(*reopened.build_canonical_hierarchy(false).unwrap(), live);
}

#[test]
fn persisted_cache_is_reused_across_instances() {
    let (dir, engine) = seeded();
    engine.build_canonical_hierarchy(false).unwrap();

    let conn = engine.database().connect().unwrap();
    let before = CacheMetadata::load(&conn, CANONICAL_HIERARCHY_CACHE).unwrap().unwrap();
    assert!(!before.stale);
    drop(engine);

    let reopened = RegularizationEngine::open(config(&dir)).unwrap();
    reopened.build_canonical_hierarchy(false).unwrap();

    let after = CacheMetadata::load(&conn, CANONICAL_HIERARCHY_CACHE).unwrap().unwrap();
    assert_eq!(after.generation, before.generation);
    assert_eq!(after.populated_at, before.populated_at);

    // A forced refresh rewrites the table
    reopened.build_canonical_hierarchy(true).unwrap();
    let forced = CacheMetadata::load(&conn, CANONICAL_HIERARCHY_CACHE).unwrap().unwrap();
    assert_eq!(forced.generation, before.generation + 1);
}

#[test]
fn partition_change_rebuilds_views() {
    let (_dir, engine) = seeded();
    let before = engine.build_canonical_hierarchy(false).unwrap();
    assert!(before.pair_by_text("JHOND", "6330").is_none());

    engine
        .set_year_partition(YearPartition::new(vec![2020, 2021, 2022], vec![2023]).unwrap())
        .unwrap();
    assert_eq!(engine.cache_status().hierarchy, CachePhase::Stale);

    let after = engine.build_canonical_hierarchy(false).unwrap();
    assert!(after.pair_by_text("JHOND", "6330").is_some());
}

#[test]
fn regularized_queries_follow_mappings() {
    let (_dir, engine) = seeded();
    let johnd = id(&engine, Dimension::Make, "JOHND");
    let jhond = id(&engine, Dimension::Make, "JHOND");
    let m6300 = id(&engine, Dimension::Model, "6300");
    let m6330 = id(&engine, Dimension::Model, "6330");
    let m7200 = id(&engine, Dimension::Model, "7200");
    let au = id(&engine, Dimension::VehicleType, "AU");
    let diesel = id(&engine, Dimension::FuelType, "D");

    let proposal = engine.propose_year_triplets((johnd, m6300)).unwrap();
    assert_eq!(proposal.len(), 2);

    engine
        .save_mapping(
            &RegularizationMapping::wildcard((jhond, m6330), (johnd, m6300))
                .with_vehicle_type(Assignment::Assigned(au)),
        )
        .unwrap();
    engine.save_year_triplets((jhond, m6330), (johnd, m6300), &proposal).unwrap();
    assert_eq!(engine.pair_completeness(jhond, m6330).unwrap(), Completeness::Complete);

    let options = engine.query_options();
    let johnd_only = RegistrationFilter {
        makes: set(&[johnd]),
        years: set(&[2022, 2023]),
        ..Default::default()
    };
    assert_eq!(engine.count_registrations(&johnd_only, &options).unwrap(), 3);

    let off = QueryOptions {
        regularization_enabled: false,
        ..options
    };
    assert_eq!(engine.count_registrations(&johnd_only, &off).unwrap(), 0);

    // Coupled: JOHND + 7200 does not pull in JHOND/6330
    let johnd_7200 = RegistrationFilter {
        makes: set(&[johnd]),
        models: set(&[m7200]),
        ..Default::default()
    };
    assert_eq!(engine.count_registrations(&johnd_7200, &options).unwrap(), 1);

    let decoupled = QueryOptions {
        coupling: Coupling::Decoupled,
        ..options
    };
    assert_eq!(engine.count_registrations(&johnd_7200, &decoupled).unwrap(), 1);

    // Diesel reaches the mapped 2009 uncurated row
    let by_fuel = RegistrationFilter {
        fuel_types: set(&[diesel]),
        years: set(&[2022]),
        ..Default::default()
    };
    assert_eq!(engine.count_registrations(&by_fuel, &options).unwrap(), 1);

    let by_year = engine.count_registrations_by_year(&johnd_only, &options).unwrap();
    assert_eq!(by_year, vec![(2022, 2), (2023, 1)]);
}

#[test]
fn conflicting_make_mapping_is_rejected() {
    let (_dir, engine) = seeded();
    let johnd = id(&engine, Dimension::Make, "JOHND");
    let jhond = id(&engine, Dimension::Make, "JHOND");
    let honda = id(&engine, Dimension::Make, "HONDA");
    let m6300 = id(&engine, Dimension::Model, "6300");
    let m6330 = id(&engine, Dimension::Model, "6330");
    let civic = id(&engine, Dimension::Model, "CIVIC");

    engine
        .save_mapping(&RegularizationMapping::wildcard((jhond, m6330), (johnd, m6300)))
        .unwrap();

    let err = engine
        .save_mapping(&RegularizationMapping::wildcard((jhond, civic), (honda, civic)))
        .unwrap_err();
    assert!(err.is_rejection());
    match err {
        RegularizationError::ConflictingMapping { conflicting_canonical_make, .. } => {
            assert_eq!(conflicting_canonical_make, "JOHND");
        }
        other => panic!("unexpected error: {}", other),
    }

    // Removing the first mapping frees the uncurated make
    assert_eq!(engine.delete_pair_mappings(jhond, m6330).unwrap(), 1);
    engine
        .save_mapping(&RegularizationMapping::wildcard((jhond, civic), (honda, civic)))
        .unwrap();
}

#[test]
fn auto_regularization_then_suggestions() {
    let (_dir, engine) = seeded();
    let honda = id(&engine, Dimension::Make, "HONDA");
    let civi = id(&engine, Dimension::Model, "CIVI");
    let civic = id(&engine, Dimension::Model, "CIVIC");

    let report = engine.auto_regularize().unwrap();
    assert_eq!(report.created, 1);
    assert!(report.needs_review.is_empty());

    // Wildcard only: the vehicle type is decided, model years still need triplets
    match engine.pair_completeness(honda, civic).unwrap() {
        Completeness::Incomplete { vehicle_type_pending, missing_model_years, .. } => {
            assert!(!vehicle_type_pending);
            assert_eq!(missing_model_years.len(), 2);
        }
        other => panic!("unexpected completeness: {:?}", other),
    }

    // Second run finds nothing new
    assert!(!engine.auto_regularize().unwrap().changed());

    let suggestions = engine.suggest_canonical_pairs(honda, civi, 3).unwrap();
    assert_eq!((suggestions[0].make_id, suggestions[0].model_id), (honda, civic));

    let triplets: BTreeMap<i64, Assignment> = BTreeMap::new();
    assert_eq!(engine.save_year_triplets((honda, civi), (honda, civic), &triplets).unwrap(), 0);
    assert!(matches!(
        engine.pair_completeness(honda, civi).unwrap(),
        Completeness::Unmapped
    ));
}

#[test]
fn exact_matches_stay_listed_until_complete() {
    let (_dir, engine) = seeded();
    let honda = id(&engine, Dimension::Make, "HONDA");
    let civic = id(&engine, Dimension::Model, "CIVIC");
    let listed = |engine: &RegularizationEngine| {
        engine
            .find_uncurated_pairs(true)
            .unwrap()
            .iter()
            .any(|p| p.exact_match && p.key() == (honda, civic))
    };

    assert!(listed(&engine));

    // The wildcard alone leaves fuel types to decide
    engine.auto_regularize().unwrap();
    assert!(listed(&engine));

    let proposal = engine.propose_year_triplets((honda, civic)).unwrap();
    engine.save_year_triplets((honda, civic), (honda, civic), &proposal).unwrap();
    assert_eq!(engine.pair_completeness(honda, civic).unwrap(), Completeness::Complete);
    assert!(!listed(&engine));

    // Novel pairs are unaffected
    assert_eq!(engine.find_uncurated_pairs(false).unwrap().len(), 2);
}
