//! Runs one objective against one environment.
//!
//! Each run walks the same path:
//!
//! ```text
//! Start -> SessionEstablished -> SnapshotCaptured -> PlanObtained
//!       -> ActionApplied | NoActionNeeded -> OutcomeRecorded -> SessionClosed
//! ```
//!
//! A run never retries and never propagates a fault: whatever happens, the
//! session is closed and a report comes back. Driver faults become `Failed`
//! reports carrying the error in their log.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::artifacts::{ArtifactStore, Phase};
use crate::driver::{AutomationDriver, DriverError, ElementSnapshot, EnvironmentProfile, SessionFactory};
use crate::matcher::{ActionPlan, ObjectiveMatcher};
use crate::objective::{Origin, TestObjective};
use crate::report::{ExecutionReport, Status};

/// Reason recorded when a planned click no longer finds its element
pub const STALE_TARGET_REASON: &str = "target element not found, board state may have changed";

/// What to do when a positive objective finds no pair to act on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NoMovePolicy {
    /// Leave the report pending and let the analyzer decide
    #[default]
    Analyze,
    /// Finalize the report as `Blocked`
    Blocked,
}

impl std::str::FromStr for NoMovePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "analyze" => Ok(NoMovePolicy::Analyze),
            "blocked" => Ok(NoMovePolicy::Blocked),
            other => Err(format!("unknown no-move policy '{}'", other)),
        }
    }
}

/// Executor tuning
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Pause after each click for the application to react
    pub settle: Duration,
    pub no_move: NoMovePolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            settle: Duration::from_millis(crate::config::DEFAULT_SETTLE_MS),
            no_move: NoMovePolicy::Analyze,
        }
    }
}

/// Progress through one run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Start,
    SessionEstablished,
    SnapshotCaptured,
    PlanObtained,
    ActionApplied,
    NoActionNeeded,
    OutcomeRecorded,
    SessionClosed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Why an attempt stopped early
#[derive(Debug)]
enum AttemptError {
    Driver { stage: Stage, source: DriverError },
    PlanMismatch,
}

/// Drives single attempts through fresh sessions.
pub struct Executor {
    sessions: Arc<dyn SessionFactory>,
    matcher: ObjectiveMatcher,
    artifacts: ArtifactStore,
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(sessions: Arc<dyn SessionFactory>, matcher: ObjectiveMatcher, artifacts: ArtifactStore) -> Self {
        Self {
            sessions,
            matcher,
            artifacts,
            config: ExecutorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    /// Attempt `objective` in `environment`. Always returns a report.
    #[instrument(skip_all, fields(id = objective.id, env = %environment.name))]
    pub fn run(&self, objective: &TestObjective, environment: &EnvironmentProfile) -> ExecutionReport {
        let mut report = ExecutionReport::new(objective, environment);
        debug!(stage = %Stage::Start);

        let opened = panic::catch_unwind(AssertUnwindSafe(|| self.sessions.open_session(environment)))
            .unwrap_or_else(|payload| {
                Err(DriverError::SessionSetup(format!(
                    "session setup aborted: {}",
                    panic_message(payload.as_ref())
                )))
            });
        let mut driver = match opened {
            Ok(driver) => driver,
            Err(e) => {
                warn!(error = %e, "session setup failed");
                report.log(format!("Session setup failed at {}: {}", environment.resolution(), e));
                report.actual_results = "Nothing was executed.".to_string();
                report.finalize(Status::Failed, e.to_string());
                report.finished = Some(chrono::Utc::now());
                return report;
            }
        };
        debug!(stage = %Stage::SessionEstablished);

        let attempt = panic::catch_unwind(AssertUnwindSafe(|| {
            self.attempt(driver.as_mut(), objective, &mut report)
        }));

        match attempt {
            Ok(Ok(())) => {}
            Ok(Err(AttemptError::Driver {
                source: DriverError::ElementNotFound { text, position },
                ..
            })) => {
                report.log(format!("Could not find '{}' at position {}", text, position));
                report.finalize(Status::Failed, STALE_TARGET_REASON);
            }
            Ok(Err(AttemptError::Driver { stage, source })) => {
                report.log(format!("Driver error after {}: {}", stage, source));
                report.finalize(Status::Failed, format!("driver error after {}: {}", stage, source));
            }
            Ok(Err(AttemptError::PlanMismatch)) => {
                report.log("Action plan does not belong to the captured snapshot");
                report.finalize(Status::Failed, "action plan was derived from a different snapshot");
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(panic = %message, "attempt panicked");
                report.log(format!("Attempt aborted: {}", message));
                report.finalize(Status::Failed, format!("attempt aborted: {}", message));
            }
        }

        let wrap_up = panic::catch_unwind(AssertUnwindSafe(|| {
            self.capture(driver.as_mut(), &mut report, Phase::Final)
        }));
        if let Err(payload) = wrap_up {
            report.log(format!("Final screenshot aborted: {}", panic_message(payload.as_ref())));
        }
        debug!(stage = %Stage::OutcomeRecorded, status = %report.status);

        match panic::catch_unwind(AssertUnwindSafe(|| driver.close())) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => report.log(format!("Closing the session failed: {}", e)),
            Err(payload) => report.log(format!("Closing the session aborted: {}", panic_message(payload.as_ref()))),
        }
        debug!(stage = %Stage::SessionClosed);

        report.finished = Some(chrono::Utc::now());
        info!(status = %report.status, "attempt finished");
        report
    }

    fn attempt(
        &self,
        driver: &mut dyn AutomationDriver,
        objective: &TestObjective,
        report: &mut ExecutionReport,
    ) -> Result<(), AttemptError> {
        let before = driver.capture_snapshot().map_err(|source| AttemptError::Driver {
            stage: Stage::SessionEstablished,
            source,
        })?;
        debug!(stage = %Stage::SnapshotCaptured, snapshot = %before.id, elements = before.len());
        self.capture(driver, report, Phase::Before);
        report.actual_results = format!("Board before: {}", before);

        let plan = self.matcher.match_objective(&before, &objective.objective);
        report.plan = Some(plan.clone());
        debug!(stage = %Stage::PlanObtained, actionable = plan.is_actionable());

        match &plan {
            ActionPlan::NotActionable { reason, .. } => {
                debug!(stage = %Stage::NoActionNeeded);
                self.record_no_move(objective, &plan, reason, &before, report);
                Ok(())
            }
            ActionPlan::Actionable {
                snapshot, first, second, ..
            } => {
                if *snapshot != before.id {
                    return Err(AttemptError::PlanMismatch);
                }

                for element in [first, second] {
                    driver.click(element).map_err(|source| AttemptError::Driver {
                        stage: Stage::PlanObtained,
                        source,
                    })?;
                    report.log(format!("Clicked '{}' at position {}", element.text, element.position));
                    if !self.config.settle.is_zero() {
                        thread::sleep(self.config.settle);
                    }
                }
                debug!(stage = %Stage::ActionApplied);

                let after = driver.capture_snapshot().map_err(|source| AttemptError::Driver {
                    stage: Stage::ActionApplied,
                    source,
                })?;
                self.capture(driver, report, Phase::After);

                let removed = before.len().saturating_sub(after.len());
                report.log(if removed == 0 {
                    "Board unchanged after the move".to_string()
                } else {
                    format!("{} cells left the board", removed)
                });
                report.actual_results = format!("Board before: {} Board after: {}", before, after);
                Ok(())
            }
        }
    }

    fn record_no_move(
        &self,
        objective: &TestObjective,
        plan: &ActionPlan,
        reason: &str,
        before: &ElementSnapshot,
        report: &mut ExecutionReport,
    ) {
        report.log(reason);
        report.actual_results = format!("Board before: {} No move was made.", before);

        let negative = !plan.intent().is_positive();
        if negative && objective.origin == Origin::Foundational {
            report.finalize(Status::Passed, format!("No pair was removed: {}", reason));
        } else if !negative && self.config.no_move == NoMovePolicy::Blocked {
            report.finalize(Status::Blocked, format!("Nothing to act on: {}", reason));
        }
    }

    /// Save a screenshot; failures are logged on the report, never fatal
    fn capture(&self, driver: &mut dyn AutomationDriver, report: &mut ExecutionReport, phase: Phase) {
        let saved = driver
            .screenshot()
            .map_err(|e| e.to_string())
            .and_then(|shot| {
                self.artifacts
                    .save_screenshot(report, phase, &shot.png)
                    .map_err(|e| e.to_string())
            });
        match saved {
            Ok(reference) => report.artifacts.screenshots.push(reference),
            Err(e) => report.log(format!("Screenshot ({}) failed: {}", phase.as_str(), e)),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
