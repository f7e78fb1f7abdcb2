// 🧊 Cache Consistency Controller
//
// Per-cache state machine:
//   Empty → Populating → Populated → Stale → Populating → Populated …
//
// Each cache has its own Mutex + Condvar. Only one population runs at a time;
// callers arriving during Populating wait for the in-flight result.
// Mapping mutations call `invalidate` explicitly - nothing propagates implicitly.

use crate::db::{CACHE_SCHEMA_VERSION, CANONICAL_HIERARCHY_CACHE, UNCURATED_PAIRS_CACHE};
use crate::error::{RegularizationError, Result};
use crate::hierarchy::Hierarchy;
use crate::uncurated::UncuratedPair;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use tracing::{debug, error, info};

// ============================================================================
// PERSISTED METADATA
// ============================================================================

/// Row of cache_metadata describing one cache table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub cache_name: String,
    pub generation: i64,
    pub partition_key: Option<String>,
    pub schema_version: i64,
    pub stale: bool,
    pub populated_at: Option<DateTime<Utc>>,
}

impl CacheMetadata {
    pub fn load(conn: &Connection, cache_name: &str) -> Result<Option<Self>> {
        let metadata = conn
            .query_row(
                "SELECT cache_name, generation, partition_key, schema_version, stale, populated_at
                 FROM cache_metadata WHERE cache_name = ?1",
                params![cache_name],
                |row| {
                    let populated_at: Option<String> = row.get(5)?;
                    Ok(CacheMetadata {
                        cache_name: row.get(0)?,
                        generation: row.get(1)?,
                        partition_key: row.get(2)?,
                        schema_version: row.get(3)?,
                        stale: row.get::<_, i64>(4)? != 0,
                        populated_at: populated_at
                            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                            .map(|dt| dt.with_timezone(&Utc)),
                    })
                },
            )
            .optional()?;
        Ok(metadata)
    }

    /// Usable as-is for this partition
    pub fn is_fresh_for(&self, partition_key: &str) -> bool {
        !self.stale
            && self.schema_version == CACHE_SCHEMA_VERSION
            && self.partition_key.as_deref() == Some(partition_key)
    }
}

/// Record a successful population (call inside the transaction that wrote the rows)
pub fn mark_populated(conn: &Connection, cache_name: &str, partition_key: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO cache_metadata (
            cache_name, generation, partition_key, schema_version, stale, populated_at
        ) VALUES (?1, 1, ?2, ?3, 0, ?4)
        ON CONFLICT(cache_name) DO UPDATE SET
            generation = generation + 1,
            partition_key = excluded.partition_key,
            schema_version = excluded.schema_version,
            stale = 0,
            populated_at = excluded.populated_at",
        params![
            cache_name,
            partition_key,
            CACHE_SCHEMA_VERSION,
            Utc::now().to_rfc3339()
        ],
    )?;
    Ok(())
}

/// Flag persisted caches as stale so the next reader rebuilds them
pub fn mark_stale(conn: &Connection, cache_names: &[&str]) -> Result<()> {
    for name in cache_names {
        conn.execute(
            "UPDATE cache_metadata SET stale = 1 WHERE cache_name = ?1",
            params![name],
        )?;
    }
    Ok(())
}

// ============================================================================
// IN-MEMORY SLOT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CachePhase {
    Empty,
    Populating,
    Populated,
    Stale,
}

struct SlotState<T> {
    phase: CachePhase,
    /// Last successfully populated value, kept while Stale for fail-soft readers
    value: Option<Arc<T>>,
    /// Bumped by every invalidation
    generation: u64,
    failures: u64,
    populations: u64,
}

pub struct CacheSlot<T> {
    name: &'static str,
    state: Mutex<SlotState<T>>,
    ready: Condvar,
}

impl<T> CacheSlot<T> {
    pub fn new(name: &'static str) -> Self {
        CacheSlot {
            name,
            state: Mutex::new(SlotState {
                phase: CachePhase::Empty,
                value: None,
                generation: 0,
                failures: 0,
                populations: 0,
            }),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotState<T>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn phase(&self) -> CachePhase {
        self.lock().phase
    }

    /// Number of population attempts that ran to completion (success or failure)
    pub fn population_count(&self) -> u64 {
        self.lock().populations
    }

    /// Last known value, even when Stale
    pub fn snapshot(&self) -> Option<Arc<T>> {
        self.lock().value.clone()
    }

    pub fn invalidate(&self) {
        let mut state = self.lock();
        state.generation += 1;
        if state.phase == CachePhase::Populated {
            state.phase = CachePhase::Stale;
        }
        debug!("Cache '{}' invalidated (generation {})", self.name, state.generation);
    }

    /// Return the cached value, running `populate` when Empty, Stale, or forced.
    ///
    /// Concurrent callers wait for an in-flight population instead of starting
    /// another one. On failure the slot returns to Empty/Stale and
    /// `CachePopulationFailure` is returned so the caller can compute live.
    pub fn get_or_populate<F>(&self, force: bool, populate: F) -> Result<Arc<T>>
    where
        F: FnOnce() -> Result<T>,
    {
        let mut state = self.lock();
        let failures_seen = state.failures;
        let mut waited = false;

        loop {
            let phase = state.phase;
            match phase {
                CachePhase::Populated if !force || waited => match &state.value {
                    Some(value) => return Ok(Arc::clone(value)),
                    None => break,
                },
                CachePhase::Populating => {
                    state = self
                        .ready
                        .wait(state)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    waited = true;

                    if state.failures != failures_seen {
                        return Err(RegularizationError::CachePopulationFailure {
                            cache: self.name.to_string(),
                            reason: "in-flight population failed".to_string(),
                        });
                    }
                }
                _ => break,
            }
        }

        let fallback_phase = if state.value.is_some() {
            CachePhase::Stale
        } else {
            CachePhase::Empty
        };
        let started_generation = state.generation;
        state.phase = CachePhase::Populating;
        drop(state);

        let outcome = match panic::catch_unwind(AssertUnwindSafe(populate)) {
            Ok(result) => result,
            Err(_) => Err(RegularizationError::CachePopulationFailure {
                cache: self.name.to_string(),
                reason: "population panicked".to_string(),
            }),
        };

        let mut state = self.lock();
        state.populations += 1;

        let result = match outcome {
            Ok(value) => {
                let value = Arc::new(value);
                state.value = Some(Arc::clone(&value));
                if state.generation == started_generation {
                    state.phase = CachePhase::Populated;
                    info!("Cache '{}' populated", self.name);
                } else {
                    state.phase = CachePhase::Stale;
                    debug!("Cache '{}' invalidated during population, left Stale", self.name);
                }
                Ok(value)
            }
            Err(e) => {
                state.failures += 1;
                state.phase = fallback_phase;
                error!("Cache '{}' population failed: {}", self.name, e);
                Err(match e {
                    RegularizationError::CachePopulationFailure { .. } => e,
                    other => RegularizationError::CachePopulationFailure {
                        cache: self.name.to_string(),
                        reason: other.to_string(),
                    },
                })
            }
        };

        drop(state);
        self.ready.notify_all();
        result
    }
}

// ============================================================================
// CONTROLLER
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStatus {
    pub hierarchy: CachePhase,
    pub uncurated_pairs: CachePhase,
}

/// Both derived-view caches, each guarded independently
pub struct CacheController {
    pub hierarchy: CacheSlot<Hierarchy>,
    pub uncurated_pairs: CacheSlot<Vec<UncuratedPair>>,
}

impl CacheController {
    pub fn new() -> Self {
        CacheController {
            hierarchy: CacheSlot::new(CANONICAL_HIERARCHY_CACHE),
            uncurated_pairs: CacheSlot::new(UNCURATED_PAIRS_CACHE),
        }
    }

    /// Mark both caches Stale in memory and in the store
    pub fn invalidate(&self, conn: &Connection) -> Result<()> {
        self.invalidate_memory();
        mark_stale(conn, &[CANONICAL_HIERARCHY_CACHE, UNCURATED_PAIRS_CACHE])
    }

    pub fn invalidate_memory(&self) {
        self.hierarchy.invalidate();
        self.uncurated_pairs.invalidate();
    }

    pub fn status(&self) -> CacheStatus {
        CacheStatus {
            hierarchy: self.hierarchy.phase(),
            uncurated_pairs: self.uncurated_pairs.phase(),
        }
    }
}

impl Default for CacheController {
    fn default() -> Self {
        Self::new()
    }
}
