//! Objective generation.
//!
//! The collaborator phrases candidate objectives; the planner owns everything
//! that has to be reliable about them: id assignment, field normalization,
//! per-item validation and de-duplication.

use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, instrument, warn};

use crate::llm::{GenerationRequest, LlmError, LlmResult, TextGenerator, extract_json};
use crate::objective::{GENERATED_ID_BASE, TestObjective, foundational_objectives};

/// Guidance used when the operator supplied none
pub const NO_GUIDANCE: &str = "No specific guidance provided.";

const OBJECTIVE_KEYS: &[&str] = &["objective", "test_objective", "title", "goal", "description"];
const EXPECTED_KEYS: &[&str] = &["expected_results", "expected_result", "expected_outcome", "expected"];
const LIST_KEYS: &[&str] = &["test_cases", "objectives", "tests"];

/// Planner tuning
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    /// Objectives requested per call
    pub batch_size: usize,
    pub temperature: f32,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            temperature: 0.7,
        }
    }
}

/// Proposes generated objectives.
pub struct Planner {
    generator: Arc<dyn TextGenerator>,
    config: PlannerConfig,
    next_id: AtomicU64,
}

impl Planner {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self::with_config(generator, PlannerConfig::default())
    }

    pub fn with_config(generator: Arc<dyn TextGenerator>, config: PlannerConfig) -> Self {
        Self {
            generator,
            config,
            next_id: AtomicU64::new(GENERATED_ID_BASE),
        }
    }

    /// Continue numbering at `id` (clamped into the generated band)
    pub fn starting_at(self, id: u64) -> Self {
        self.next_id.store(id.max(GENERATED_ID_BASE), Ordering::SeqCst);
        self
    }

    /// Skip every id up to and including `last`. Never moves numbering back.
    pub fn resume_after(&self, last: u64) {
        self.next_id
            .fetch_max(last.saturating_add(1).max(GENERATED_ID_BASE), Ordering::SeqCst);
    }

    /// Ask for new objectives given memory `context` and operator `guidance`.
    ///
    /// Never fails: a collaborator error or unusable output yields an empty
    /// list.
    #[instrument(skip_all, fields(batch = self.config.batch_size))]
    pub fn propose(&self, context: &str, guidance: &str) -> Vec<TestObjective> {
        let prompt = build_prompt(self.config.batch_size, context, guidance);
        let request = GenerationRequest::text(prompt).with_temperature(self.config.temperature);

        let result = self
            .generator
            .generate(&request)
            .and_then(|raw| self.parse(&raw));

        match result {
            Ok(objectives) => {
                info!(count = objectives.len(), "planner proposed objectives");
                objectives
            }
            Err(e) => {
                warn!(error = %e, "planner collaborator failed, continuing without generated objectives");
                Vec::new()
            }
        }
    }

    fn parse(&self, raw: &str) -> LlmResult<Vec<TestObjective>> {
        let value = extract_json(raw)?;
        let items = candidate_list(value)
            .ok_or_else(|| LlmError::InvalidResponse("expected a list of objectives".to_string()))?;

        let mut seen: HashSet<String> = foundational_objectives().iter().map(|o| o.dedup_key()).collect();
        let mut objectives = Vec::new();

        for (index, item) in items.into_iter().enumerate() {
            let Some((objective, expected)) = canonical_fields(&item) else {
                debug!(index, "skipping objective with missing fields");
                continue;
            };
            let candidate = TestObjective::generated(0, objective, expected);
            if !seen.insert(candidate.dedup_key()) {
                debug!(index, "skipping duplicate objective");
                continue;
            }
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            objectives.push(TestObjective { id, ..candidate });
        }

        Ok(objectives)
    }
}

/// Normalize a collaborator field name: trimmed, lowercase, `_`-separated.
pub fn normalize_key(key: &str) -> String {
    key.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c == ' ' || c == '-' { '_' } else { c })
        .collect()
}

fn candidate_list(value: Value) -> Option<Vec<Value>> {
    match value {
        Value::Array(items) => Some(items),
        Value::Object(map) => {
            let normalized = normalize_map(&map);
            LIST_KEYS
                .iter()
                .find_map(|k| normalized.get(*k).and_then(Value::as_array).cloned())
        }
        _ => None,
    }
}

fn normalize_map(map: &Map<String, Value>) -> Map<String, Value> {
    map.iter().map(|(k, v)| (normalize_key(k), v.clone())).collect()
}

/// The canonical (objective, expected_results) pair, if both are present
fn canonical_fields(item: &Value) -> Option<(String, String)> {
    let map = normalize_map(item.as_object()?);
    let pick = |keys: &[&str]| {
        keys.iter()
            .find_map(|k| map.get(*k).and_then(text_of))
            .filter(|s| !s.is_empty())
    };
    Some((pick(OBJECTIVE_KEYS)?, pick(EXPECTED_KEYS)?))
}

fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Array(parts) => {
            let joined: Vec<String> = parts.iter().filter_map(|p| p.as_str()).map(str::trim).map(String::from).collect();
            if joined.is_empty() { None } else { Some(joined.join("; ")) }
        }
        _ => None,
    }
}

fn build_prompt(count: usize, context: &str, guidance: &str) -> String {
    format!(
        "You are designing exploratory tests for a number-matching puzzle. Two cells can be \
         removed together when they hold the same number or when their numbers add up to 10.\n\n\
         Failures observed in earlier runs:\n{context}\n\n\
         Operator guidance:\n{guidance}\n\n\
         Propose {count} new test objectives that probe the game's rules and edge cases, \
         favouring areas related to the failures above. Respond with only a JSON array of \
         objects, each with the fields \"objective\" and \"expected_results\"."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedGenerator;
    use crate::objective::{FOUNDATIONAL_ID_MAX, Origin};
    use pretty_assertions::assert_eq;

    fn planner(responses: &[&str]) -> (Planner, Arc<ScriptedGenerator>) {
        let generator = Arc::new(ScriptedGenerator::with_responses(responses.iter().copied()));
        (Planner::new(generator.clone()), generator)
    }

    #[test]
    fn test_normalize_key() {
        assert_eq!(normalize_key(" Expected Results "), "expected_results");
        assert_eq!(normalize_key("Test-Objective"), "test_objective");
    }

    #[test]
    fn test_propose_normalizes_and_assigns_ids() {
        let (planner, generator) = planner(&[r#"[
            {"Test Objective": "Clear a 3 and a 7", "Expected Results": "Both cells vanish", "Initial Game State": "new"},
            {"objective": "Try matching 4 and 5", "expected_result": "Nothing is removed"}
        ]"#]);

        let objectives = planner.propose("No past failures recorded.", NO_GUIDANCE);

        assert_eq!(objectives.len(), 2);
        assert_eq!(objectives[0].id, GENERATED_ID_BASE);
        assert_eq!(objectives[1].id, GENERATED_ID_BASE + 1);
        assert_eq!(objectives[0].objective, "Clear a 3 and a 7");
        assert_eq!(objectives[1].expected_results, "Nothing is removed");
        assert!(objectives.iter().all(|o| o.origin == Origin::Generated && o.id > FOUNDATIONAL_ID_MAX));
        assert!(generator.prompts()[0].contains(NO_GUIDANCE));
    }

    #[test]
    fn test_invalid_items_are_skipped_individually() {
        let (planner, _) = planner(&[r#"{"test_cases": [
            {"objective": "Missing expectation"},
            {"objective": "", "expected_results": "x"},
            42,
            {"goal": "Match two 5s", "expected": "Both removed"}
        ]}"#]);

        let objectives = planner.propose("", NO_GUIDANCE);
        assert_eq!(objectives.len(), 1);
        assert_eq!(objectives[0].objective, "Match two 5s");
    }

    #[test]
    fn test_duplicates_are_dropped() {
        let (planner, _) = planner(&[r#"[
            {"objective": "Verify removal of an identical pair", "expected_results": "dup of seed"},
            {"objective": "Match two 9s", "expected_results": "removed"},
            {"objective": "match  two 9s.", "expected_results": "removed again"}
        ]"#]);

        let objectives = planner.propose("", NO_GUIDANCE);
        assert_eq!(objectives.len(), 1);
        assert_eq!(objectives[0].objective, "Match two 9s");
    }

    #[test]
    fn test_collaborator_failure_yields_empty() {
        let (planner, _) = planner(&["this is not json"]);
        assert!(planner.propose("", NO_GUIDANCE).is_empty());

        // Queue exhausted: the generator reports itself unavailable
        assert!(planner.propose("", NO_GUIDANCE).is_empty());
    }

    #[test]
    fn test_ids_keep_increasing_across_calls() {
        let (planner, _) = planner(&[
            r#"[{"objective": "A", "expected_results": "a"}]"#,
            r#"[{"objective": "B", "expected_results": "b"}]"#,
        ]);
        let planner = planner.starting_at(2000);
        assert_eq!(planner.propose("", NO_GUIDANCE)[0].id, 2000);
        assert_eq!(planner.propose("", NO_GUIDANCE)[0].id, 2001);
    }

    #[test]
    fn test_resume_after_only_moves_forward() {
        let (planner, _) = planner(&[
            r#"[{"objective": "A", "expected_results": "a"}]"#,
            r#"[{"objective": "B", "expected_results": "b"}]"#,
        ]);
        planner.resume_after(1041);
        assert_eq!(planner.propose("", NO_GUIDANCE)[0].id, 1042);
        planner.resume_after(3);
        assert_eq!(planner.propose("", NO_GUIDANCE)[0].id, 1043);
    }

    #[test]
    fn test_starting_at_stays_out_of_foundational_band() {
        let (planner, _) = planner(&[r#"[{"objective": "A", "expected_results": "a"}]"#]);
        let planner = planner.starting_at(5);
        assert_eq!(planner.propose("", NO_GUIDANCE)[0].id, GENERATED_ID_BASE);
    }
}
