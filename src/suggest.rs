// 💡 Canonical Pair Suggestions - rank likely targets for an uncurated pair
//
// Thin pre-filter for the reviewer, never applied automatically.
// Strategies:
// 1. Exact text (already canonical)
// 2. Truncation: canonical code starts with the uncurated code
// 3. Edit similarity (normalized Levenshtein) on make and model codes

use crate::hierarchy::Hierarchy;
use serde::{Deserialize, Serialize};
use strsim::normalized_levenshtein;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionStrategy {
    ExactText,
    Truncation,
    Similarity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalSuggestion {
    pub make_id: i64,
    pub model_id: i64,
    pub make_code: String,
    pub model_code: String,
    /// Weighted score in 0.0..=1.0
    pub score: f64,
    pub strategy: SuggestionStrategy,
    /// Curated rows behind the canonical pair
    pub record_count: i64,
    pub reason: String,
}

pub struct PairSuggester {
    pub make_weight: f64,
    pub model_weight: f64,
    pub min_score: f64,
    pub limit: usize,
    /// Score given to a model code that is a prefix of the canonical one
    pub truncation_score: f64,
}

impl PairSuggester {
    pub fn new() -> Self {
        PairSuggester {
            make_weight: 0.4,
            model_weight: 0.6,
            min_score: 0.5,
            limit: 5,
            truncation_score: 0.9,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    fn code_score(&self, uncurated: &str, canonical: &str) -> (f64, bool) {
        if uncurated == canonical {
            return (1.0, false);
        }
        let truncated = !uncurated.is_empty() && canonical.starts_with(uncurated);
        let similarity = normalized_levenshtein(uncurated, canonical);
        if truncated {
            (similarity.max(self.truncation_score), true)
        } else {
            (similarity, false)
        }
    }

    /// Best canonical pairs for (make_code, model_code), highest score first
    pub fn suggest(&self, make_code: &str, model_code: &str, hierarchy: &Hierarchy) -> Vec<CanonicalSuggestion> {
        let make_code = make_code.trim().to_uppercase();
        let model_code = model_code.trim().to_uppercase();

        let mut suggestions = Vec::new();

        for make in &hierarchy.makes {
            let (make_score, make_truncated) = self.code_score(&make_code, &make.code.to_uppercase());

            // No model can lift a hopeless make above the threshold
            if make_score * self.make_weight + self.model_weight < self.min_score {
                continue;
            }

            for model in &make.models {
                let (model_score, model_truncated) = self.code_score(&model_code, &model.code.to_uppercase());
                let score = make_score * self.make_weight + model_score * self.model_weight;
                if score < self.min_score {
                    continue;
                }

                let strategy = if make_score == 1.0 && model_score == 1.0 {
                    SuggestionStrategy::ExactText
                } else if make_truncated || model_truncated {
                    SuggestionStrategy::Truncation
                } else {
                    SuggestionStrategy::Similarity
                };

                suggestions.push(CanonicalSuggestion {
                    make_id: make.make_id,
                    model_id: model.model_id,
                    make_code: make.code.clone(),
                    model_code: model.code.clone(),
                    score,
                    strategy,
                    record_count: model.record_count,
                    reason: format!(
                        "{} ≈ {} ({:.2}) | {} ≈ {} ({:.2})",
                        make_code, make.code, make_score, model_code, model.code, model_score
                    ),
                });
            }
        }

        suggestions.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.record_count.cmp(&a.record_count))
                .then_with(|| a.make_code.cmp(&b.make_code))
                .then_with(|| a.model_code.cmp(&b.model_code))
        });
        suggestions.truncate(self.limit);
        suggestions
    }
}

impl Default for PairSuggester {
    fn default() -> Self {
        Self::new()
    }
}
