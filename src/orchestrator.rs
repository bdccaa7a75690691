//! The exploration cycle.
//!
//! One cycle recalls past failures, plans new objectives, ranks the pool,
//! executes and judges every ranked objective in every environment, and
//! learns from the failures. Environments are the outer loop: every objective
//! runs once per environment before the next environment starts, and results
//! keep that order.

use std::fmt::Write as _;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use crate::analyzer::Analyzer;
use crate::driver::EnvironmentProfile;
use crate::executor::Executor;
use crate::memory::{MemoryError, MemoryRecord, MemoryStore, PLACEHOLDER_CONTENT, RecordMetadata};
use crate::objective::{TestObjective, foundational_objectives};
use crate::planner::{NO_GUIDANCE, Planner};
use crate::ranker::{RankStrategy, Ranker};
use crate::report::{ExecutionReport, Status};

/// Query used to recall context for planning
pub const MEMORY_QUERY: &str = "past failures";

/// Faults that end a cycle early
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("cycle aborted: {0}")]
    Panicked(String),
}

/// Result type for cycle steps
pub type CycleResult<T> = Result<T, CycleError>;

/// Operator guidance, read at the start of every cycle
#[derive(Debug, Clone, Default)]
pub enum Guidance {
    #[default]
    None,
    Inline(String),
    File(PathBuf),
}

impl Guidance {
    /// Current guidance text. A missing or empty source reads as no guidance.
    pub fn read(&self) -> String {
        let text = match self {
            Guidance::None => None,
            Guidance::Inline(text) => Some(text.clone()),
            Guidance::File(path) => match fs::read_to_string(path) {
                Ok(text) => Some(text),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "guidance file unreadable");
                    None
                }
            },
        };
        text.map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| NO_GUIDANCE.to_string())
    }
}

/// Cycle tuning
#[derive(Debug, Clone)]
pub struct CycleConfig {
    pub rank_limit: usize,
    pub memory_query: String,
    pub memory_k: usize,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            rank_limit: crate::config::DEFAULT_RANK_LIMIT,
            memory_query: MEMORY_QUERY.to_string(),
            memory_k: crate::config::DEFAULT_MEMORY_K,
        }
    }
}

/// Everything one cycle produced
#[derive(Debug, Clone, Default)]
pub struct CycleOutcome {
    /// Judged reports, environment-major
    pub results: Vec<ExecutionReport>,
    /// Ranked objective ids, in execution order
    pub ranked: Vec<u64>,
    pub strategy: Option<RankStrategy>,
    /// Objectives the planner contributed
    pub generated: usize,
    /// Failures newly added to memory
    pub learned: usize,
    /// The cycle stopped early on request
    pub cancelled: bool,
    /// Set when the cycle hit a fault; `results` holds what was done before it
    pub error: Option<String>,
}

impl CycleOutcome {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn count(&self, status: Status) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }
}

/// Runs exploration cycles.
pub struct Orchestrator {
    memory: MemoryStore,
    planner: Planner,
    ranker: Ranker,
    executor: Executor,
    analyzer: Analyzer,
    environments: Vec<EnvironmentProfile>,
    guidance: Guidance,
    config: CycleConfig,
    cancel: Arc<AtomicBool>,
}

impl Orchestrator {
    pub fn new(memory: MemoryStore, planner: Planner, ranker: Ranker, executor: Executor, analyzer: Analyzer) -> Self {
        Self {
            memory,
            planner,
            ranker,
            executor,
            analyzer,
            environments: crate::config::default_environments(),
            guidance: Guidance::None,
            config: CycleConfig::default(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_environments(mut self, environments: Vec<EnvironmentProfile>) -> Self {
        self.environments = environments;
        self
    }

    pub fn with_guidance(mut self, guidance: Guidance) -> Self {
        self.guidance = guidance;
        self
    }

    pub fn with_config(mut self, config: CycleConfig) -> Self {
        self.config = config;
        self
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    pub fn environments(&self) -> &[EnvironmentProfile] {
        &self.environments
    }

    /// Shared flag; once set, cycles stop before their next objective.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Run one full cycle. Faults end up in [`CycleOutcome::error`].
    #[instrument(skip_all, fields(environments = self.environments.len()))]
    pub fn run_cycle(&mut self) -> CycleOutcome {
        let mut outcome = CycleOutcome::default();

        let result = panic::catch_unwind(AssertUnwindSafe(|| self.cycle(&mut outcome)))
            .unwrap_or_else(|payload| Err(CycleError::Panicked(panic_message(payload.as_ref()))));

        if let Err(e) = result {
            error!(error = %e, completed = outcome.results.len(), "cycle failed");
            outcome.error = Some(e.to_string());
        }

        info!(
            results = outcome.results.len(),
            passed = outcome.count(Status::Passed),
            failed = outcome.count(Status::Failed),
            blocked = outcome.count(Status::Blocked),
            learned = outcome.learned,
            "cycle complete"
        );
        outcome
    }

    fn cycle(&mut self, outcome: &mut CycleOutcome) -> CycleResult<()> {
        let context = self.recall();
        let guidance = self.guidance.read();

        self.planner.resume_after(self.memory.last_objective_id());
        let generated = self.planner.propose(&context, &guidance);
        if let Some(last) = generated.iter().map(|o| o.id).max() {
            self.memory.reserve_objective_ids(last)?;
        }
        outcome.generated = generated.len();
        let mut pool = foundational_objectives();
        pool.extend(generated);

        let ranked = self.ranker.select(&pool, self.config.rank_limit);
        outcome.ranked = ranked.ids();
        outcome.strategy = Some(ranked.strategy);
        if ranked.is_empty() {
            warn!("nothing to run this cycle");
            return Ok(());
        }

        'environments: for environment in &self.environments {
            for objective in &ranked.objectives {
                if self.cancel.load(Ordering::SeqCst) {
                    info!("cycle cancelled");
                    outcome.cancelled = true;
                    break 'environments;
                }
                let report = self.executor.run(objective, environment);
                outcome.results.push(self.analyzer.judge(report));
            }
        }

        outcome.learned = self.learn(&outcome.results)?;
        Ok(())
    }

    /// Execute and judge one objective in every environment. Nothing is learned.
    #[instrument(skip_all, fields(id = objective.id))]
    pub fn run_objective(&self, objective: &TestObjective) -> Vec<ExecutionReport> {
        self.environments
            .iter()
            .map(|environment| self.analyzer.judge(self.executor.run(objective, environment)))
            .collect()
    }

    /// Planning context from recalled failures
    fn recall(&self) -> String {
        let hits = self.memory.retrieve(&self.config.memory_query, self.config.memory_k);
        let mut context = String::new();
        for hit in hits.iter().filter(|h| !h.record.is_placeholder()) {
            let _ = writeln!(context, "- {}", hit.record.content.replace('\n', " | "));
        }
        if context.is_empty() {
            PLACEHOLDER_CONTENT.to_string()
        } else {
            context
        }
    }

    /// Ingest every failed report, then flush once
    fn learn(&mut self, results: &[ExecutionReport]) -> CycleResult<usize> {
        let mut learned = 0;
        for report in results.iter().filter(|r| r.status == Status::Failed) {
            let record = MemoryRecord::failure(
                report.failure_narrative(),
                RecordMetadata {
                    test_case_id: report.test_case_id,
                    environment: report.environment.clone(),
                    screenshots: report.artifacts.screenshots.clone(),
                },
            );
            if self.memory.ingest(record)? {
                learned += 1;
            }
        }
        self.memory.flush()?;
        Ok(learned)
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
