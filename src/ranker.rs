//! Objective selection.
//!
//! The collaborator picks the most valuable objectives by id. Its answer is
//! only advisory: unknown and repeated ids are dropped, and the selection is
//! filled up in ascending id order when it comes back short. An empty or
//! unusable answer falls back to ascending id order entirely.

use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::llm::{GenerationRequest, LlmError, LlmResult, TextGenerator, extract_json};
use crate::objective::TestObjective;

/// How a ranked set was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankStrategy {
    /// The collaborator chose at least one objective
    Collaborator,
    /// Ascending ids, no collaborator input
    Fallback,
}

/// The objectives selected for one cycle, in execution order
#[derive(Debug, Clone)]
pub struct RankedSet {
    pub objectives: Vec<TestObjective>,
    pub strategy: RankStrategy,
}

impl RankedSet {
    pub fn ids(&self) -> Vec<u64> {
        self.objectives.iter().map(|o| o.id).collect()
    }

    pub fn len(&self) -> usize {
        self.objectives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objectives.is_empty()
    }
}

/// Selects the top objectives from a pool.
pub struct Ranker {
    generator: Option<Arc<dyn TextGenerator>>,
}

impl Ranker {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self {
            generator: Some(generator),
        }
    }

    /// A ranker that always uses ascending id order
    pub fn deterministic() -> Self {
        Self { generator: None }
    }

    /// Choose at most `limit` objectives from `all`. Never fails.
    #[instrument(skip_all, fields(pool = all.len(), limit = limit))]
    pub fn select(&self, all: &[TestObjective], limit: usize) -> RankedSet {
        let pool = unique_by_id(all);
        if pool.is_empty() || limit == 0 {
            return RankedSet {
                objectives: Vec::new(),
                strategy: RankStrategy::Fallback,
            };
        }

        let chosen = match &self.generator {
            Some(generator) => match self.ask(generator.as_ref(), &pool, limit) {
                Ok(ids) => validate(&ids, &pool, limit),
                Err(e) => {
                    warn!(error = %e, "ranker collaborator failed, using ascending id order");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        if chosen.is_empty() {
            return RankedSet {
                objectives: fallback(&pool, limit),
                strategy: RankStrategy::Fallback,
            };
        }

        let picked = chosen.len();
        let mut objectives = chosen;
        let taken: HashSet<u64> = objectives.iter().map(|o| o.id).collect();
        let mut rest: Vec<&TestObjective> = pool.iter().filter(|o| !taken.contains(&o.id)).collect();
        rest.sort_by_key(|o| o.id);
        objectives.extend(rest.into_iter().take(limit - picked).cloned());

        info!(picked, total = objectives.len(), "ranker selected objectives");
        RankedSet {
            objectives,
            strategy: RankStrategy::Collaborator,
        }
    }

    fn ask(&self, generator: &dyn TextGenerator, pool: &[TestObjective], limit: usize) -> LlmResult<Vec<u64>> {
        let raw = generator.generate(&GenerationRequest::text(build_prompt(pool, limit)))?;
        parse_ids(&extract_json(&raw)?)
            .ok_or_else(|| LlmError::InvalidResponse("expected a list of objective ids".to_string()))
    }
}

/// Ascending id order, truncated to `limit`
pub fn fallback(all: &[TestObjective], limit: usize) -> Vec<TestObjective> {
    let mut sorted = unique_by_id(all);
    sorted.sort_by_key(|o| o.id);
    sorted.truncate(limit);
    sorted
}

fn unique_by_id(all: &[TestObjective]) -> Vec<TestObjective> {
    let mut seen = HashSet::new();
    all.iter().filter(|o| seen.insert(o.id)).cloned().collect()
}

fn validate(ids: &[u64], pool: &[TestObjective], limit: usize) -> Vec<TestObjective> {
    let mut seen = HashSet::new();
    let mut chosen = Vec::new();
    for id in ids {
        if chosen.len() == limit {
            break;
        }
        if !seen.insert(*id) {
            continue;
        }
        match pool.iter().find(|o| o.id == *id) {
            Some(o) => chosen.push(o.clone()),
            None => warn!(id, "ranker returned an unknown objective id"),
        }
    }
    chosen
}

/// Accepts `[3, 1]`, `["3", "1"]`, `[{"id": 3}]` or `{"ids": [...]}`
fn parse_ids(value: &Value) -> Option<Vec<u64>> {
    let items = match value {
        Value::Array(items) => items,
        Value::Object(map) => ["ids", "selected", "top", "test_case_ids"]
            .iter()
            .find_map(|k| map.get(*k).and_then(Value::as_array))?,
        _ => return None,
    };

    Some(
        items
            .iter()
            .filter_map(|item| match item {
                Value::Number(n) => n.as_u64(),
                Value::String(s) => s.trim().parse().ok(),
                Value::Object(o) => o.get("id").and_then(|id| match id {
                    Value::Number(n) => n.as_u64(),
                    Value::String(s) => s.trim().parse().ok(),
                    _ => None,
                }),
                _ => None,
            })
            .collect(),
    )
}

fn build_prompt(pool: &[TestObjective], limit: usize) -> String {
    let listing: Vec<String> = pool
        .iter()
        .map(|o| format!("{}: {} (expected: {})", o.id, o.objective, o.expected_results))
        .collect();
    format!(
        "Select the {limit} test objectives below that are most likely to reveal defects in a \
         number-matching puzzle, most valuable first.\n\n{}\n\n\
         Respond with only a JSON array of the selected ids.",
        listing.join("\n")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedGenerator;
    use pretty_assertions::assert_eq;

    fn pool(ids: &[u64]) -> Vec<TestObjective> {
        ids.iter()
            .map(|id| TestObjective::generated(*id, format!("objective {}", id), "expected"))
            .collect()
    }

    fn ranker(response: &str) -> Ranker {
        Ranker::new(Arc::new(ScriptedGenerator::with_responses([response])))
    }

    #[test]
    fn test_collaborator_order_is_kept() {
        let set = ranker("[1003, 1001]").select(&pool(&[1001, 1002, 1003]), 2);
        assert_eq!(set.ids(), vec![1003, 1001]);
        assert_eq!(set.strategy, RankStrategy::Collaborator);
    }

    #[test]
    fn test_unknown_ids_are_discarded_and_short_answers_topped_up() {
        let set = ranker(r#"{"ids": [99, "1003", 1003]}"#).select(&pool(&[1003, 1001, 1002]), 3);
        assert_eq!(set.ids(), vec![1003, 1001, 1002]);
    }

    #[test]
    fn test_all_unknown_ids_fall_back() {
        let set = ranker("[7, 8, 9]").select(&pool(&[1005, 1001, 1003]), 2);
        assert_eq!(set.ids(), vec![1001, 1003]);
        assert_eq!(set.strategy, RankStrategy::Fallback);
    }

    #[test]
    fn test_malformed_response_falls_back() {
        let set = ranker("I would pick the first ones").select(&pool(&[3, 1, 2]), 10);
        assert_eq!(set.ids(), vec![1, 2, 3]);
        assert_eq!(set.strategy, RankStrategy::Fallback);
    }

    #[test]
    fn test_collaborator_error_falls_back() {
        let generator = ScriptedGenerator::new();
        generator.push_err("timeout");
        let set = Ranker::new(Arc::new(generator)).select(&pool(&[2, 1]), 10);
        assert_eq!(set.ids(), vec![1, 2]);
    }

    #[test]
    fn test_output_never_exceeds_limit() {
        let set = ranker("[1, 2, 3, 4, 5]").select(&pool(&[1, 2, 3, 4, 5]), 3);
        assert_eq!(set.len(), 3);

        let set = Ranker::deterministic().select(&pool(&[5, 4, 3, 2, 1, 6, 7, 8, 9, 10, 11, 12]), 10);
        assert_eq!(set.ids(), (1..=10).collect::<Vec<_>>());
    }

    #[test]
    fn test_empty_pool() {
        let set = ranker("[1]").select(&[], 10);
        assert!(set.is_empty());
    }

    #[test]
    fn test_parse_ids_shapes() {
        assert_eq!(parse_ids(&serde_json::json!([{"id": 4}, {"id": "5"}])), Some(vec![4, 5]));
        assert_eq!(parse_ids(&serde_json::json!({"selected": [1]})), Some(vec![1]));
        assert_eq!(parse_ids(&serde_json::json!("nope")), None);
    }
}
