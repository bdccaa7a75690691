//! Test objectives and the fixed foundational set.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Highest id reserved for foundational objectives.
pub const FOUNDATIONAL_ID_MAX: u64 = 999;

/// First id handed out to generated objectives. Generated ids never fall in
/// the foundational band.
pub const GENERATED_ID_BASE: u64 = 1000;

/// Where an objective came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Part of the fixed seed set
    Foundational,
    /// Proposed by the planner
    Generated,
}

/// A natural-language statement of behavior to verify. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestObjective {
    pub id: u64,
    pub objective: String,
    pub expected_results: String,
    pub origin: Origin,
}

impl TestObjective {
    pub fn foundational(id: u64, objective: &str, expected_results: &str) -> Self {
        Self {
            id,
            objective: objective.to_string(),
            expected_results: expected_results.to_string(),
            origin: Origin::Foundational,
        }
    }

    pub fn generated(id: u64, objective: impl Into<String>, expected_results: impl Into<String>) -> Self {
        Self {
            id,
            objective: objective.into(),
            expected_results: expected_results.into(),
            origin: Origin::Generated,
        }
    }

    /// Lowercased, whitespace-collapsed objective text used for de-duplication.
    pub fn dedup_key(&self) -> String {
        normalize_text(&self.objective)
    }
}

/// Collapse whitespace and lowercase, dropping trailing punctuation.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
        .trim_end_matches(['.', '!', '?'])
        .to_string()
}

/// The fixed seed set every cycle starts from.
pub fn foundational_objectives() -> Vec<TestObjective> {
    vec![
        TestObjective::foundational(
            1,
            "Verify removal of an identical pair.",
            "Both selected cells holding the same number are cleared from the board.",
        ),
        TestObjective::foundational(
            2,
            "Verify removal of a pair that sums to 10.",
            "Both selected cells whose numbers add up to 10 are cleared from the board.",
        ),
        TestObjective::foundational(
            3,
            "Verify an invalid pair cannot be matched.",
            "No pair should be removed; the board stays unchanged after selecting two non-matching numbers.",
        ),
        TestObjective::foundational(
            4,
            "Find any valid pair and remove it.",
            "Exactly two cells are cleared and the remaining numbers keep their order.",
        ),
        TestObjective::foundational(
            5,
            "Verify the board stays consistent after removing a matching pair.",
            "Only the two selected cells disappear; every other number is still present.",
        ),
    ]
}

/// A persisted batch of objectives.
///
/// Passed explicitly between `plan` and `execute` instead of living in
/// process-wide state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanHandle {
    pub created: String,
    pub objectives: Vec<TestObjective>,
}

impl PlanHandle {
    pub fn new(objectives: Vec<TestObjective>) -> Self {
        Self {
            created: chrono::Utc::now().to_rfc3339(),
            objectives,
        }
    }

    pub fn find(&self, id: u64) -> Option<&TestObjective> {
        self.objectives.iter().find(|o| o.id == id)
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)
    }

    pub fn load(path: &Path) -> std::io::Result<Self> {
        let data = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }
}
