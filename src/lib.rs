// Registry Regularization Engine - Core Library
// Exposes all modules for use in CLI, API server, and tests

pub mod error;
pub mod config;
pub mod db;
pub mod enumeration;     // Stable IDs per categorical dimension
pub mod hierarchy;       // Canonical taxonomy from curated years
pub mod uncurated;       // Uncurated pair detection
pub mod cache;           // Cache consistency controller
pub mod mapping;         // Mapping store + Make-level validation
pub mod auto_regularize; // Exact-match auto-regularization
pub mod expansion;       // Query-time ID expansion
pub mod query;           // Filter → SQL predicate
pub mod suggest;         // Canonical pair suggestions
pub mod import;          // CSV ingestion
pub mod engine;          // UI-facing surface

// Re-export commonly used types
pub use error::{RegularizationError, Result};
pub use config::{EngineConfig, YearPartition};
pub use db::{
    Database, RegistrationRecord,
    setup_database, insert_registrations, verify_count, registration_year_counts,
};
pub use enumeration::{
    Dimension, EnumEntry, EnumerationStore, EnumerationCache,
};
pub use hierarchy::{
    CanonicalHierarchyBuilder, CanonicalHierarchyEntry, Hierarchy, HierarchyCodes,
    MakeNode, ModelNode, ModelYearNode, CountedValue, PairSummary,
};
pub use uncurated::{UncuratedPair, UncuratedPairDetector};
pub use cache::{CacheController, CacheMetadata, CachePhase, CacheSlot, CacheStatus};
pub use mapping::{
    Assignment, Completeness, MappingKey, MappingSource, MappingStatistics,
    MappingStore, RegularizationMapping, assess_completeness, UNKNOWN_SENTINEL_ID,
};
pub use auto_regularize::{AutoRegularizationReport, AutoRegularizer, propose_year_triplets};
pub use expansion::{
    Coupling, ExpandedSelection, ExpansionOptions, MappingIndex,
    expand_ids, expand_selection,
};
pub use query::{QueryOptions, RegistrationFilter, Predicate, build_predicate};
pub use suggest::{CanonicalSuggestion, PairSuggester, SuggestionStrategy};
pub use import::{ImportReport, RegistrationImporter};
pub use engine::RegularizationEngine;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
