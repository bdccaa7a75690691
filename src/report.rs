//! Execution reports: what one attempt did and how it was judged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::driver::EnvironmentProfile;
use crate::matcher::ActionPlan;
use crate::objective::TestObjective;

/// Outcome of one attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Passed,
    Failed,
    /// Executed, waiting for a verdict
    #[serde(rename = "Pending Analysis")]
    PendingAnalysis,
    /// A positive objective found nothing to act on
    Blocked,
}

impl Status {
    /// Whether no further analysis is needed
    pub fn is_final(self) -> bool {
        !matches!(self, Status::PendingAnalysis)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Status::Passed => "Passed",
            Status::Failed => "Failed",
            Status::PendingAnalysis => "Pending Analysis",
            Status::Blocked => "Blocked",
        };
        f.write_str(label)
    }
}

/// The judgement attached to a report. Set exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Analysis {
    pub verdict: Status,
    pub reason: String,
    pub analyzed: DateTime<Utc>,
}

/// Files captured during the attempt
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifacts {
    /// Screenshot references in capture order, relative to the run directory
    pub screenshots: Vec<String>,
}

/// Structured record of one objective attempted in one environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub test_case_id: u64,
    pub objective: String,
    pub environment: String,
    /// Names this attempt's screenshots apart from earlier attempts
    #[serde(default)]
    pub attempt: String,
    pub status: Status,
    pub expected_results: String,
    pub actual_log: String,
    pub actual_results: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<ActionPlan>,
    #[serde(default)]
    pub artifacts: Artifacts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<Analysis>,
    pub started: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished: Option<DateTime<Utc>>,
}

impl ExecutionReport {
    /// An empty report awaiting execution
    pub fn new(objective: &TestObjective, environment: &EnvironmentProfile) -> Self {
        let started = Utc::now();
        Self {
            test_case_id: objective.id,
            objective: objective.objective.clone(),
            environment: environment.name.clone(),
            attempt: started.format("%Y%m%dT%H%M%S%6f").to_string(),
            status: Status::PendingAnalysis,
            expected_results: objective.expected_results.clone(),
            actual_log: String::new(),
            actual_results: String::new(),
            plan: None,
            artifacts: Artifacts::default(),
            analysis: None,
            started,
            finished: None,
        }
    }

    /// Append a line to the execution log
    pub fn log(&mut self, line: impl AsRef<str>) {
        if !self.actual_log.is_empty() {
            self.actual_log.push('\n');
        }
        self.actual_log.push_str(line.as_ref());
    }

    /// Set the final verdict. No-op if the report was already analyzed.
    pub fn finalize(&mut self, verdict: Status, reason: impl Into<String>) {
        if self.analysis.is_some() {
            return;
        }
        self.status = verdict;
        self.analysis = Some(Analysis {
            verdict,
            reason: reason.into(),
            analyzed: Utc::now(),
        });
    }

    pub fn is_analyzed(&self) -> bool {
        self.analysis.is_some()
    }

    pub fn reason(&self) -> Option<&str> {
        self.analysis.as_ref().map(|a| a.reason.as_str())
    }

    /// Narrative stored in memory when this attempt failed
    pub fn failure_narrative(&self) -> String {
        let mut text = format!(
            "Objective {} failed on {}: {}\nExpected: {}\nObserved: {}",
            self.test_case_id, self.environment, self.objective, self.expected_results, self.actual_results
        );
        if let Some(reason) = self.reason() {
            text.push_str("\nReason: ");
            text.push_str(reason);
        }
        text
    }
}
