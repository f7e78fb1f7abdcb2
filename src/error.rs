// ⚠️ Error taxonomy for the regularization engine
//
// Every failure degrades to "slower but correct" or "visible warning".
// Nothing in here is allowed to abort the hosting process.

use thiserror::Error;

/// Result type for regularization operations
pub type Result<T> = std::result::Result<T, RegularizationError>;

#[derive(Error, Debug)]
pub enum RegularizationError {
    /// Store unreachable or query failed (stale caches are retained)
    #[error("Data access error: {0}")]
    DataAccess(#[from] rusqlite::Error),

    /// Make-level consistency would be violated; nothing was persisted
    #[error(
        "Conflicting mapping: uncurated make {uncurated_make_id} already maps to canonical make \
         '{conflicting_canonical_make}' (id {conflicting_canonical_make_id}), \
         cannot also map to id {requested_canonical_make_id}"
    )]
    ConflictingMapping {
        uncurated_make_id: i64,
        requested_canonical_make_id: i64,
        conflicting_canonical_make_id: i64,
        conflicting_canonical_make: String,
    },

    /// The uncurated pair already has rows pointing at another canonical pair
    #[error(
        "Conflicting pair target: uncurated pair {uncurated:?} already maps to canonical pair \
         {existing_canonical:?}, cannot also map to {requested_canonical:?}"
    )]
    ConflictingPairTarget {
        uncurated: (i64, i64),
        existing_canonical: (i64, i64),
        requested_canonical: (i64, i64),
    },

    /// Cache table shape does not match what this build expects
    #[error("Schema mismatch in table '{table}'")]
    SchemaMismatch { table: String },

    /// Cache could not be populated; callers fall back to live computation
    #[error("Cache population failed for '{cache}': {reason}")]
    CachePopulationFailure { cache: String, reason: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl RegularizationError {
    /// True for errors the UI should present as a rejected edit rather than a failure
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            RegularizationError::ConflictingMapping { .. }
                | RegularizationError::ConflictingPairTarget { .. }
                | RegularizationError::InvalidInput(_)
        )
    }
}
