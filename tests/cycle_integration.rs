//! End-to-end cycles against the simulated board

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use board_explorer::artifacts::ArtifactStore;
use board_explorer::driver::{EnvironmentProfile, Faults, SimulatedSessionFactory};
use board_explorer::executor::{Executor, ExecutorConfig, NoMovePolicy};
use board_explorer::llm::{GenerationRequest, LlmResult, ScriptedGenerator, TextGenerator};
use board_explorer::memory::{HashingEmbedder, MemoryStore};
use board_explorer::orchestrator::{CycleConfig, Orchestrator};
use board_explorer::ranker::RankStrategy;
use board_explorer::{Analyzer, ObjectiveMatcher, Planner, Ranker, Status};

const PASS: &str = r#"{"verdict": "Passed", "reason": "Board behaved as expected."}"#;
const FAIL: &str = r#"{"verdict": "Failed", "reason": "Board did not change."}"#;

/// Answers the first `limit` requests, then panics
struct FragileGenerator {
    calls: AtomicUsize,
    limit: usize,
}

impl TextGenerator for FragileGenerator {
    fn generate(&self, _request: &GenerationRequest) -> LlmResult<String> {
        if self.calls.fetch_add(1, Ordering::SeqCst) >= self.limit {
            panic!("collaborator connection reset");
        }
        Ok(PASS.to_string())
    }
}

struct Parts {
    planner: Arc<dyn TextGenerator>,
    ranker: Ranker,
    verdicts: Arc<dyn TextGenerator>,
    sessions: SimulatedSessionFactory,
    no_move: NoMovePolicy,
    environments: &'static str,
}

impl Default for Parts {
    fn default() -> Self {
        Self {
            planner: Arc::new(ScriptedGenerator::new()),
            ranker: Ranker::deterministic(),
            verdicts: Arc::new(ScriptedGenerator::new().with_default(PASS)),
            sessions: SimulatedSessionFactory::new(&[8, 1, 9, 8], 4),
            no_move: NoMovePolicy::Analyze,
            environments: "Desktop:160x90",
        }
    }
}

fn open_memory(dir: &Path) -> MemoryStore {
    MemoryStore::open(dir.join("memory/index.json"), Arc::new(HashingEmbedder::default())).unwrap()
}

fn build(dir: &Path, parts: Parts) -> Orchestrator {
    let store = ArtifactStore::new(dir.join("run"));
    store.init().unwrap();

    let executor = Executor::new(Arc::new(parts.sessions), ObjectiveMatcher::default(), store.clone()).with_config(
        ExecutorConfig {
            settle: Duration::ZERO,
            no_move: parts.no_move,
        },
    );

    Orchestrator::new(
        open_memory(dir),
        Planner::new(parts.planner),
        parts.ranker,
        executor,
        Analyzer::new(parts.verdicts, store),
    )
    .with_environments(EnvironmentProfile::parse_list(parts.environments).unwrap())
}

#[test]
fn test_planner_failure_still_covers_foundational_objectives_everywhere() {
    let dir = tempfile::tempdir().unwrap();
    let mut orchestrator = build(
        dir.path(),
        Parts {
            ranker: Ranker::new(Arc::new(ScriptedGenerator::with_responses(["I cannot rank these."]))),
            environments: "Desktop:160x90,Mobile:90x160",
            ..Parts::default()
        },
    );

    let outcome = orchestrator.run_cycle();

    assert!(outcome.is_ok(), "cycle failed: {:?}", outcome.error);
    assert_eq!(outcome.generated, 0);
    assert_eq!(outcome.strategy, Some(RankStrategy::Fallback));
    assert_eq!(outcome.ranked, vec![1, 2, 3, 4, 5]);
    assert_eq!(outcome.results.len(), 10);
    assert!(outcome.results[..5].iter().all(|r| r.environment == "Desktop"));
    assert!(outcome.results[5..].iter().all(|r| r.environment == "Mobile"));

    let store = ArtifactStore::new(dir.path().join("run"));
    for report in &outcome.results {
        assert!(report.status.is_final());
        let stored = store.load_report(report.test_case_id, &report.environment).unwrap();
        assert_eq!(stored.map(|r| r.status), Some(report.status));
    }
}

#[test]
fn test_generated_objectives_are_ranked_and_executed_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let planner = Arc::new(ScriptedGenerator::with_responses([r#"[
        {"objective": "Remove a 1 and a 9 that add up to ten", "expected_results": "Both cells disappear"},
        {"objective": "Select the same cell twice", "expected_results": "Nothing is removed"}
    ]"#]));
    let mut orchestrator = build(
        dir.path(),
        Parts {
            planner: planner.clone(),
            ranker: Ranker::new(Arc::new(ScriptedGenerator::with_responses(["[1000, 3]"]))),
            ..Parts::default()
        },
    )
    .with_config(CycleConfig {
        rank_limit: 3,
        ..CycleConfig::default()
    });

    let outcome = orchestrator.run_cycle();

    assert_eq!(outcome.generated, 2);
    assert_eq!(outcome.strategy, Some(RankStrategy::Collaborator));
    assert_eq!(outcome.ranked, vec![1000, 3, 1]);
    let ids: Vec<u64> = outcome.results.iter().map(|r| r.test_case_id).collect();
    assert_eq!(ids, vec![1000, 3, 1]);
    assert!(planner.prompts()[0].contains("No past failures recorded."));

    let generated = &outcome.results[0];
    assert_eq!(generated.actual_results, "Board before: [8, 1, 9, 8] Board after: [8, 8]");
}

#[test]
fn test_failures_persist_and_feed_the_next_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let broken = SimulatedSessionFactory::default().with_faults(Faults {
        setup_failure: true,
        ..Faults::default()
    });

    let first = {
        let mut orchestrator = build(
            dir.path(),
            Parts {
                sessions: broken,
                ..Parts::default()
            },
        );
        orchestrator.run_cycle()
    };
    assert_eq!(first.count(Status::Failed), 5);
    assert_eq!(first.learned, 5);

    // A new process sees the same memory
    assert_eq!(open_memory(dir.path()).failure_count(), 5);

    let planner = Arc::new(ScriptedGenerator::new());
    let mut orchestrator = build(
        dir.path(),
        Parts {
            planner: planner.clone(),
            ..Parts::default()
        },
    );
    let second = orchestrator.run_cycle();

    assert!(second.is_ok());
    let prompt = &planner.prompts()[0];
    assert!(prompt.contains("failed on Desktop"));
    assert!(prompt.contains("session setup failed"));
    // Already-known failures are not stored twice
    assert_eq!(orchestrator.memory().failure_count(), 5 + second.learned);
}

#[test]
fn test_blocked_outcomes_are_not_learned() {
    let dir = tempfile::tempdir().unwrap();
    let mut orchestrator = build(
        dir.path(),
        Parts {
            verdicts: Arc::new(ScriptedGenerator::new().with_default(FAIL)),
            sessions: SimulatedSessionFactory::new(&[1, 2, 3], 3),
            no_move: NoMovePolicy::Blocked,
            ..Parts::default()
        },
    );

    let outcome = orchestrator.run_cycle();

    assert!(outcome.count(Status::Blocked) >= 3);
    assert_eq!(outcome.learned, outcome.count(Status::Failed));
    let failed: Vec<u64> = outcome
        .results
        .iter()
        .filter(|r| r.status == Status::Failed)
        .map(|r| r.test_case_id)
        .collect();
    for record in orchestrator.memory().records().iter().filter(|r| !r.is_placeholder()) {
        assert!(failed.contains(&record.metadata.test_case_id));
    }
}

#[test]
fn test_sessions_are_exclusive_and_always_closed() {
    let dir = tempfile::tempdir().unwrap();
    let sessions = SimulatedSessionFactory::default().with_faults(Faults {
        disturb_after_capture: true,
        ..Faults::default()
    });
    let mut orchestrator = build(
        dir.path(),
        Parts {
            sessions: sessions.clone(),
            environments: "Desktop:160x90,Mobile:90x160",
            ..Parts::default()
        },
    );

    let outcome = orchestrator.run_cycle();

    assert_eq!(sessions.opened(), outcome.results.len());
    assert_eq!(sessions.peak(), 1);
    assert_eq!(sessions.active(), 0);
    let stale: Vec<_> = outcome
        .results
        .iter()
        .filter(|r| r.reason() == Some("target element not found, board state may have changed"))
        .collect();
    assert!(!stale.is_empty());
    assert!(stale.iter().all(|r| r.status == Status::Failed));
}

#[test]
fn test_fault_mid_cycle_keeps_partial_results() {
    let dir = tempfile::tempdir().unwrap();
    let sessions = SimulatedSessionFactory::new(&[8, 1, 9, 8], 4);
    let mut orchestrator = build(
        dir.path(),
        Parts {
            verdicts: Arc::new(FragileGenerator {
                calls: AtomicUsize::new(0),
                limit: 2,
            }),
            sessions: sessions.clone(),
            ..Parts::default()
        },
    );

    let outcome = orchestrator.run_cycle();

    let error = outcome.error.as_deref().unwrap_or_default();
    assert!(error.contains("collaborator connection reset"), "unexpected error: {}", error);
    assert_eq!(outcome.results.len(), 2);
    assert!(outcome.results.iter().all(|r| r.status == Status::Passed));
    assert_eq!(sessions.active(), 0);
}
