//! Board Explorer - autonomous exploratory testing for number-matching puzzles.
//!
//! This crate provides:
//! - Deterministic pair selection against a captured board ([`ObjectiveMatcher`])
//! - A durable, similarity-searchable memory of past failures ([`MemoryStore`])
//! - Collaborator-driven objective planning, ranking and verdicts
//! - Session-per-attempt execution against a simulated board or a real
//!   terminal application running in a PTY
//! - The cycle that ties them together ([`Orchestrator`])
//!
//! # Example
//!
//! ```rust,no_run
//! use board_explorer::driver::{EnvironmentProfile, SimulatedSessionFactory};
//! use board_explorer::{ArtifactStore, Executor, ObjectiveMatcher, foundational_objectives};
//! use std::sync::Arc;
//!
//! let executor = Executor::new(
//!     Arc::new(SimulatedSessionFactory::default()),
//!     ObjectiveMatcher::default(),
//!     ArtifactStore::new("/tmp/board-explorer"),
//! );
//! let report = executor.run(&foundational_objectives()[0], &EnvironmentProfile::desktop());
//! println!("{}: {}", report.test_case_id, report.actual_results);
//! ```

pub mod analyzer;
pub mod artifacts;
pub mod config;
pub mod driver;
pub mod executor;
pub mod llm;
pub mod logging;
pub mod matcher;
pub mod memory;
pub mod objective;
pub mod orchestrator;
pub mod planner;
pub mod ranker;
pub mod report;

// Pipeline components
pub use analyzer::{Analyzer, AnalyzerConfig};
pub use executor::{Executor, ExecutorConfig, NoMovePolicy};
pub use matcher::{ActionPlan, Intent, MatchPredicate, ObjectiveMatcher, SumOrIdentical};
pub use orchestrator::{CycleError, CycleOutcome, Guidance, Orchestrator};
pub use planner::Planner;
pub use ranker::{RankStrategy, RankedSet, Ranker};

// Data model
pub use objective::{PlanHandle, TestObjective, foundational_objectives};
pub use report::{ExecutionReport, Status};

// Storage
pub use artifacts::{ArtifactError, ArtifactStore};
pub use memory::{HashingEmbedder, MemoryError, MemoryRecord, MemoryStore};

// Collaborator client
pub use llm::{HttpGenerator, LlmConfig, LlmError, ScriptedGenerator, TextGenerator, check_health};
