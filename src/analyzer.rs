//! Verdicts for executed attempts.
//!
//! Reports the executor already finalized keep their verdict. Pending reports
//! go to the collaborator, which compares expected and observed behaviour and
//! answers with `{"verdict": ..., "reason": ...}`. Every judged report is
//! persisted before it is returned.

use serde_json::Value;
use std::fs;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::artifacts::ArtifactStore;
use crate::llm::{GenerationRequest, LlmError, LlmResult, TextGenerator, extract_json};
use crate::report::{ExecutionReport, Status};

/// Reason used when the collaborator omits one
pub const UNCLEAR_REASON: &str = "Analysis could not determine a clear outcome.";

/// Analyzer tuning
#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    /// Send the last screenshot along with the prompt
    pub attach_screenshot: bool,
    pub temperature: f32,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            attach_screenshot: true,
            temperature: 0.0,
        }
    }
}

pub struct Analyzer {
    generator: Arc<dyn TextGenerator>,
    artifacts: ArtifactStore,
    config: AnalyzerConfig,
}

impl Analyzer {
    pub fn new(generator: Arc<dyn TextGenerator>, artifacts: ArtifactStore) -> Self {
        Self {
            generator,
            artifacts,
            config: AnalyzerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: AnalyzerConfig) -> Self {
        self.config = config;
        self
    }

    /// Give `report` its final verdict and persist it.
    ///
    /// Judging an already analyzed report changes nothing.
    #[instrument(skip_all, fields(id = report.test_case_id, env = %report.environment))]
    pub fn judge(&self, mut report: ExecutionReport) -> ExecutionReport {
        if !report.is_analyzed() {
            if report.status.is_final() {
                let status = report.status;
                report.finalize(status, "Outcome was determined during execution.");
            } else {
                match self.ask(&report) {
                    Ok((verdict, reason)) => report.finalize(verdict, reason),
                    Err(e) => {
                        warn!(error = %e, "analysis failed");
                        report.finalize(Status::Failed, format!("Analysis failed due to an internal error: {}", e));
                    }
                }
            }
        }

        if let Err(e) = self.artifacts.save_report(&report) {
            warn!(error = %e, "could not persist report");
            report.log(format!("Report could not be saved: {}", e));
        }
        info!(status = %report.status, "report judged");
        report
    }

    fn ask(&self, report: &ExecutionReport) -> LlmResult<(Status, String)> {
        let mut request = GenerationRequest::text(build_prompt(report)).with_temperature(self.config.temperature);
        if self.config.attach_screenshot {
            if let Some(png) = self.evidence(report) {
                request = request.with_image(png);
            }
        }

        let value = extract_json(&self.generator.generate(&request)?)?;
        parse_verdict(&value)
    }

    /// The most informative screenshot on disk: after the move, else the last one
    fn evidence(&self, report: &ExecutionReport) -> Option<Vec<u8>> {
        let shots = &report.artifacts.screenshots;
        let reference = shots
            .iter()
            .find(|s| s.ends_with("_after.png"))
            .or_else(|| shots.last())?;
        fs::read(self.artifacts.resolve(reference)).ok()
    }
}

fn parse_verdict(value: &Value) -> LlmResult<(Status, String)> {
    let map = value
        .as_object()
        .ok_or_else(|| LlmError::InvalidResponse("expected an object with a verdict".to_string()))?;

    let verdict = map
        .get("verdict")
        .or_else(|| map.get("status"))
        .and_then(Value::as_str)
        .ok_or_else(|| LlmError::InvalidResponse("missing verdict".to_string()))?;

    let status = match verdict.trim().to_lowercase().as_str() {
        "passed" | "pass" => Status::Passed,
        "failed" | "fail" => Status::Failed,
        other => return Err(LlmError::InvalidResponse(format!("unknown verdict '{}'", other))),
    };

    let reason = map
        .get("reason")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(UNCLEAR_REASON)
        .to_string();

    Ok((status, reason))
}

fn build_prompt(report: &ExecutionReport) -> String {
    format!(
        "You are judging one attempt at a test of a number-matching puzzle, where two cells are \
         removed together when they hold the same number or add up to 10.\n\n\
         Objective: {}\n\
         Environment: {}\n\
         Expected results: {}\n\
         Execution log:\n{}\n\
         Observed results: {}\n\n\
         Decide whether the observed behaviour matches the expected results. Respond with only a \
         JSON object: {{\"verdict\": \"Passed\" or \"Failed\", \"reason\": \"one sentence\"}}.",
        report.objective,
        report.environment,
        report.expected_results,
        if report.actual_log.is_empty() { "(empty)" } else { report.actual_log.as_str() },
        report.actual_results,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::EnvironmentProfile;
    use crate::llm::ScriptedGenerator;
    use crate::objective::TestObjective;
    use pretty_assertions::assert_eq;

    fn pending() -> ExecutionReport {
        let objective = TestObjective::generated(1001, "Match two 9s", "Both cells vanish");
        let mut report = ExecutionReport::new(&objective, &EnvironmentProfile::new("Desktop", 320, 180));
        report.log("Clicked '9' at position 2");
        report.actual_results = "Board before: [1, 9, 9] Board after: [1]".to_string();
        report
    }

    fn analyzer(generator: Arc<ScriptedGenerator>, dir: &std::path::Path) -> Analyzer {
        Analyzer::new(generator, ArtifactStore::new(dir))
    }

    #[test]
    fn test_collaborator_verdict_is_recorded_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let generator = Arc::new(ScriptedGenerator::with_responses([
            r#"```json
{"verdict": "Passed", "reason": "Both nines were removed."}
```"#,
        ]));
        let analyzer = analyzer(generator.clone(), dir.path());

        let report = analyzer.judge(pending());
        assert_eq!(report.status, Status::Passed);
        assert_eq!(report.reason(), Some("Both nines were removed."));
        assert!(generator.prompts()[0].contains("Both cells vanish"));

        let stored = ArtifactStore::new(dir.path()).load_report(1001, "Desktop").unwrap().unwrap();
        assert_eq!(stored.status, Status::Passed);
    }

    #[test]
    fn test_collaborator_failure_is_a_failed_verdict() {
        let dir = tempfile::tempdir().unwrap();
        let generator = Arc::new(ScriptedGenerator::new());
        generator.push_err("refused");

        let report = analyzer(generator, dir.path()).judge(pending());
        assert_eq!(report.status, Status::Failed);
        assert!(report.reason().unwrap().starts_with("Analysis failed due to an internal error:"));
    }

    #[test]
    fn test_unknown_verdict_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let generator = Arc::new(ScriptedGenerator::with_responses([r#"{"verdict": "maybe"}"#]));
        let report = analyzer(generator, dir.path()).judge(pending());
        assert_eq!(report.status, Status::Failed);
    }

    #[test]
    fn test_missing_reason_uses_placeholder() {
        let (status, reason) = parse_verdict(&serde_json::json!({"status": "fail"})).unwrap();
        assert_eq!(status, Status::Failed);
        assert_eq!(reason, UNCLEAR_REASON);
    }

    #[test]
    fn test_judging_twice_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let generator = Arc::new(ScriptedGenerator::with_responses([r#"{"verdict": "Failed", "reason": "x"}"#]));
        let analyzer = analyzer(generator.clone(), dir.path());

        let first = analyzer.judge(pending());
        let second = analyzer.judge(first.clone());

        assert_eq!(generator.prompts().len(), 1);
        assert_eq!(second.status, first.status);
        assert_eq!(second.analysis, first.analysis);
    }

    #[test]
    fn test_final_status_skips_collaborator() {
        let dir = tempfile::tempdir().unwrap();
        let generator = Arc::new(ScriptedGenerator::new());
        let mut report = pending();
        report.status = Status::Blocked;

        let report = analyzer(generator.clone(), dir.path()).judge(report);
        assert_eq!(report.status, Status::Blocked);
        assert!(generator.prompts().is_empty());
    }

    #[test]
    fn test_screenshot_is_attached_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let mut report = pending();
        let reference = store
            .save_screenshot(&report, crate::artifacts::Phase::After, b"png")
            .unwrap();
        report.artifacts.screenshots.push(reference);

        let generator = Arc::new(ScriptedGenerator::with_responses([r#"{"verdict": "Passed", "reason": "ok"}"#]));
        analyzer(generator.clone(), dir.path()).judge(report);
        assert_eq!(generator.image_requests(), 1);
    }
}
