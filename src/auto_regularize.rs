// 🤖 Auto-Regularization - exact-text matches become wildcard mappings
//
// An uncurated pair whose text equals a canonical pair is mapped to it.
// Vehicle type comes from the canonical pair's curated rows:
//   one candidate        → assign it
//   several candidates   → first cardinal type among them
//   otherwise            → leave Unassigned (needs review)
//
// Never overwrites a decided field. Never breaks Make-level consistency.

use crate::enumeration::{Dimension, EnumerationStore};
use crate::error::{RegularizationError, Result};
use crate::hierarchy::Hierarchy;
use crate::mapping::{Assignment, MappingSource, MappingStore, RegularizationMapping};
use crate::uncurated::UncuratedPair;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoRegularizationReport {
    /// New wildcard mappings written
    pub created: usize,
    /// Existing mappings whose Unassigned vehicle type was filled
    pub filled: usize,
    /// Exact matches left as they were
    pub unchanged: usize,
    /// Proposals dropped because they would break Make-level or pair-level consistency
    pub conflicts_skipped: usize,
    /// Exact-match pairs whose vehicle type is still Unassigned
    pub needs_review: Vec<(i64, i64)>,
}

impl AutoRegularizationReport {
    pub fn changed(&self) -> bool {
        self.created > 0 || self.filled > 0
    }
}

pub struct AutoRegularizer {
    /// Vehicle type IDs in priority order
    cardinal_vehicle_types: Vec<i64>,
}

impl AutoRegularizer {
    pub fn new(cardinal_vehicle_types: Vec<i64>) -> Self {
        AutoRegularizer {
            cardinal_vehicle_types,
        }
    }

    /// Resolve configured cardinal codes; codes never seen in the data are skipped
    pub fn from_codes(conn: &Connection, codes: &[String]) -> Result<Self> {
        let store = EnumerationStore::new(conn);
        let mut ids = Vec::with_capacity(codes.len());

        for code in codes {
            match store.id_for(Dimension::VehicleType, code)? {
                Some(id) => ids.push(id),
                None => debug!("Cardinal vehicle type '{}' not present in data", code),
            }
        }

        Ok(Self::new(ids))
    }

    pub fn choose_vehicle_type(&self, candidates: &BTreeSet<i64>) -> Assignment {
        if candidates.len() == 1 {
            return candidates
                .iter()
                .next()
                .map(|&id| Assignment::Assigned(id))
                .unwrap_or_default();
        }

        self.cardinal_vehicle_types
            .iter()
            .find(|&&id| candidates.contains(&id))
            .map(|&id| Assignment::Assigned(id))
            .unwrap_or(Assignment::Unassigned)
    }

    /// Map every exact-text pair in `pairs` to its canonical twin.
    ///
    /// `store` should not invalidate caches per row; callers invalidate once
    /// when `report.changed()`.
    pub fn run(
        &self,
        store: &MappingStore<'_>,
        pairs: &[UncuratedPair],
        hierarchy: &Hierarchy,
    ) -> Result<AutoRegularizationReport> {
        let mut report = AutoRegularizationReport::default();

        for pair in pairs {
            let canonical = match hierarchy.pair_by_text(&pair.make_code, &pair.model_code) {
                Some(canonical) => canonical,
                None => continue,
            };

            let proposed = self.choose_vehicle_type(&hierarchy.vehicle_types_for_pair(canonical.0, canonical.1));
            let existing = store.wildcard_for(pair.make_id, pair.model_id)?;

            let outcome = match existing {
                None => {
                    let mapping = RegularizationMapping::wildcard(pair.key(), canonical)
                        .with_vehicle_type(proposed)
                        .with_source(MappingSource::Auto);
                    store.save(&mapping).map(|_| {
                        report.created += 1;
                        proposed
                    })
                }
                Some(mapping)
                    if !mapping.vehicle_type.is_decided()
                        && proposed.is_decided()
                        && mapping.canonical_pair() == canonical =>
                {
                    store.save(&mapping.with_vehicle_type(proposed)).map(|_| {
                        report.filled += 1;
                        proposed
                    })
                }
                Some(mapping) => {
                    report.unchanged += 1;
                    Ok(mapping.vehicle_type)
                }
            };

            match outcome {
                Ok(vehicle_type) if !vehicle_type.is_decided() => report.needs_review.push(pair.key()),
                Ok(_) => {}
                Err(RegularizationError::ConflictingMapping {
                    conflicting_canonical_make,
                    ..
                }) => {
                    warn!(
                        "Skipped auto-mapping {}/{}: make already mapped to {}",
                        pair.make_code, pair.model_code, conflicting_canonical_make
                    );
                    report.conflicts_skipped += 1;
                }
                Err(RegularizationError::ConflictingPairTarget { existing_canonical, .. }) => {
                    warn!(
                        "Skipped auto-mapping {}/{}: pair already mapped to {:?}",
                        pair.make_code, pair.model_code, existing_canonical
                    );
                    report.conflicts_skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            "Auto-regularization: {} created, {} filled, {} unchanged, {} conflicts, {} need review",
            report.created,
            report.filled,
            report.unchanged,
            report.conflicts_skipped,
            report.needs_review.len()
        );

        Ok(report)
    }
}

/// Per-model-year fuel types for a canonical pair: the single curated fuel type
/// of each model year, or Unassigned when curated data has none or several.
/// Nothing is written.
pub fn propose_year_triplets(hierarchy: &Hierarchy, canonical: (i64, i64)) -> BTreeMap<i64, Assignment> {
    hierarchy
        .model_years_for_pair(canonical.0, canonical.1)
        .into_iter()
        .map(|model_year| {
            let fuels = hierarchy.fuel_types_for(canonical.0, canonical.1, model_year);
            let proposal = match fuels.len() {
                1 => fuels
                    .iter()
                    .next()
                    .map(|&id| Assignment::Assigned(id))
                    .unwrap_or_default(),
                _ => Assignment::Unassigned,
            };
            (model_year, proposal)
        })
        .collect()
}
