// 🔀 Query ID Expansion
//
// A filter value selected by the user is widened to every ID connected to it
// through mappings (uncurated ↔ canonical), iterated to a fixpoint.
//
//   Coupled:   base OR (make, model) ∈ P
//              P = pair closure of every mapping side that satisfies base
//   Decoupled: make ∈ expand(makes) AND model ∈ expand(models)
//
// Toggles arrive as ExpansionOptions on every call; nothing here reads global state.

use crate::enumeration::Dimension;
use crate::mapping::RegularizationMapping;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::hash::Hash;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Coupling {
    /// Make and Model constrain each other through mapped pairs
    #[default]
    Coupled,
    /// Make and Model expand independently
    Decoupled,
}

impl Coupling {
    pub fn parse(s: &str) -> Option<Coupling> {
        match s.trim().to_lowercase().as_str() {
            "coupled" => Some(Coupling::Coupled),
            "decoupled" => Some(Coupling::Decoupled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpansionOptions {
    pub enabled: bool,
    pub coupling: Coupling,
}

impl Default for ExpansionOptions {
    fn default() -> Self {
        ExpansionOptions {
            enabled: true,
            coupling: Coupling::Coupled,
        }
    }
}

// ============================================================================
// MAPPING INDEX
// ============================================================================

/// Undirected adjacency over both sides of every mapping row
#[derive(Debug, Clone, Default)]
pub struct MappingIndex {
    makes: HashMap<i64, BTreeSet<i64>>,
    models: HashMap<i64, BTreeSet<i64>>,
    pairs: HashMap<(i64, i64), BTreeSet<(i64, i64)>>,
}

fn link<T: Copy + Eq + Hash + Ord>(adjacency: &mut HashMap<T, BTreeSet<T>>, a: T, b: T) {
    adjacency.entry(a).or_default().insert(b);
    adjacency.entry(b).or_default().insert(a);
}

/// Everything reachable from `seeds` (seeds included)
fn closure<T: Copy + Eq + Hash + Ord>(adjacency: &HashMap<T, BTreeSet<T>>, seeds: &BTreeSet<T>) -> BTreeSet<T> {
    let mut reached = seeds.clone();
    let mut frontier: Vec<T> = seeds.iter().copied().collect();

    while let Some(node) = frontier.pop() {
        if let Some(neighbours) = adjacency.get(&node) {
            for &next in neighbours {
                if reached.insert(next) {
                    frontier.push(next);
                }
            }
        }
    }

    reached
}

impl MappingIndex {
    pub fn from_mappings(mappings: &[RegularizationMapping]) -> Self {
        let mut index = MappingIndex::default();

        for m in mappings {
            link(&mut index.makes, m.uncurated_make_id, m.canonical_make_id);
            link(&mut index.models, m.uncurated_model_id, m.canonical_model_id);
            link(&mut index.pairs, m.uncurated_pair(), m.canonical_pair());
        }

        index
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Pair closure seeded by every mapping side accepted by `base`
    fn pair_closure<F>(&self, base: F) -> BTreeSet<(i64, i64)>
    where
        F: Fn((i64, i64)) -> bool,
    {
        let seeds: BTreeSet<(i64, i64)> = self.pairs.keys().copied().filter(|&p| base(p)).collect();
        closure(&self.pairs, &seeds)
    }
}

// ============================================================================
// SINGLE DIMENSION
// ============================================================================

/// Widen `ids` of one dimension through the mapping graph.
///
/// Only Make and Model are ID-expanded. Model year, fuel type and vehicle type
/// are matched row by row in the query predicate instead, so they come back as given.
pub fn expand_ids(index: &MappingIndex, dimension: Dimension, ids: &BTreeSet<i64>, options: ExpansionOptions) -> BTreeSet<i64> {
    if !options.enabled {
        return ids.clone();
    }

    match dimension {
        Dimension::Make => closure(&index.makes, ids),
        Dimension::Model => closure(&index.models, ids),
        Dimension::ModelYear | Dimension::FuelType | Dimension::VehicleType => ids.clone(),
    }
}

// ============================================================================
// MAKE × MODEL SELECTION
// ============================================================================

/// Expanded Make/Model filter. Empty `makes` or `models` means "no constraint".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpandedSelection {
    pub makes: BTreeSet<i64>,
    pub models: BTreeSet<i64>,
    /// Coupled only: pairs that match in addition to `makes × models`
    pub pairs: BTreeSet<(i64, i64)>,
    pub coupling: Coupling,
}

impl ExpandedSelection {
    pub fn is_unconstrained(&self) -> bool {
        self.makes.is_empty() && self.models.is_empty()
    }

    fn base_matches(&self, make_id: i64, model_id: i64) -> bool {
        (self.makes.is_empty() || self.makes.contains(&make_id))
            && (self.models.is_empty() || self.models.contains(&model_id))
    }

    /// Whether a registration with this (make, model) passes the filter
    pub fn matches(&self, make_id: i64, model_id: i64) -> bool {
        self.base_matches(make_id, model_id) || self.pairs.contains(&(make_id, model_id))
    }
}

pub fn expand_selection(
    index: &MappingIndex,
    makes: &BTreeSet<i64>,
    models: &BTreeSet<i64>,
    options: ExpansionOptions,
) -> ExpandedSelection {
    let literal = ExpandedSelection {
        makes: makes.clone(),
        models: models.clone(),
        pairs: BTreeSet::new(),
        coupling: options.coupling,
    };

    if !options.enabled || literal.is_unconstrained() {
        return literal;
    }

    match options.coupling {
        Coupling::Decoupled => ExpandedSelection {
            makes: expand_ids(index, Dimension::Make, makes, options),
            models: expand_ids(index, Dimension::Model, models, options),
            ..literal
        },
        Coupling::Coupled => {
            let pairs = index.pair_closure(|(make, model)| literal.base_matches(make, model));
            ExpandedSelection { pairs, ..literal }
        }
    }
}
