use anyhow::{Context, bail};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use board_explorer::artifacts::ArtifactStore;
use board_explorer::config;
use board_explorer::driver::{
    DEFAULT_BOARD, DEFAULT_COLUMNS, ElementSnapshot, EnvironmentProfile, Faults, PtySessionFactory, SessionFactory,
    SimulatedSessionFactory,
};
use board_explorer::executor::{Executor, ExecutorConfig, NoMovePolicy};
use board_explorer::llm::{HttpGenerator, LlmConfig, TextGenerator, check_health};
use board_explorer::memory::{HashingEmbedder, MemoryStore};
use board_explorer::orchestrator::{CycleConfig, Guidance, MEMORY_QUERY, Orchestrator};
use board_explorer::{
    Analyzer, AnalyzerConfig, ExecutionReport, ObjectiveMatcher, PlanHandle, Planner, Ranker, foundational_objectives,
    logging,
};

/// Board Explorer - autonomous exploratory testing for number-matching puzzles
#[derive(Parser, Debug)]
#[command(
    name = "board-explorer",
    about = "Plan, run and judge exploratory tests against a number-matching board",
    after_help = "ENVIRONMENT VARIABLES:\n\
        BOARD_EXPLORER_LLM_ENDPOINT     Collaborator API endpoint URL\n\
        BOARD_EXPLORER_LLM_MODEL        Collaborator model name\n\
        BOARD_EXPLORER_LLM_TIMEOUT      Collaborator activity timeout (s)\n\
        BOARD_EXPLORER_LLM_REQUEST_TIMEOUT  Ceiling on one collaborator request (s)\n\
        BOARD_EXPLORER_ARTIFACT_DIR     Base directory for reports and screenshots\n\
        BOARD_EXPLORER_MEMORY_PATH      Memory index file\n\
        BOARD_EXPLORER_ENVIRONMENTS     Environment profiles, e.g. Desktop:1920x1080,Mobile:375x812\n\
        BOARD_EXPLORER_GUIDANCE_FILE    Operator guidance file\n\
        RUST_LOG                        Log filter (default: board_explorer=info)"
)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one full cycle: recall, plan, rank, execute, judge, learn
    Cycle {
        #[command(flatten)]
        target: TargetArgs,

        #[command(flatten)]
        llm: LlmArgs,

        /// Operator guidance file, re-read every cycle
        #[arg(short, long, env = "BOARD_EXPLORER_GUIDANCE_FILE")]
        guidance: Option<PathBuf>,

        /// Inline operator guidance (overrides --guidance)
        #[arg(long)]
        focus: Option<String>,

        /// Number of objectives to run per environment
        #[arg(short = 'n', long, env = "BOARD_EXPLORER_RANK_LIMIT")]
        rank_limit: Option<usize>,

        /// Number of cycles to run
        #[arg(long, default_value = "1")]
        cycles: usize,

        /// Output results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Ask the collaborator for new objectives and save them as a plan
    Plan {
        #[command(flatten)]
        llm: LlmArgs,

        /// Operator guidance file
        #[arg(short, long, env = "BOARD_EXPLORER_GUIDANCE_FILE")]
        guidance: Option<PathBuf>,

        /// Where to write the plan
        #[arg(short, long, default_value = "./plan.json")]
        out: PathBuf,
    },

    /// Execute and judge one objective from a plan in every environment
    Execute {
        #[command(flatten)]
        target: TargetArgs,

        #[command(flatten)]
        llm: LlmArgs,

        /// Plan file written by `plan` (foundational objectives are always available)
        #[arg(short, long)]
        plan: Option<PathBuf>,

        /// Objective id
        #[arg(long)]
        id: u64,

        /// Output results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print stored reports for an objective
    Report {
        /// Objective id
        #[arg(long)]
        id: u64,

        /// Only this environment
        #[arg(short, long)]
        env: Option<String>,

        /// Artifact directory
        #[arg(long, env = "BOARD_EXPLORER_ARTIFACT_DIR")]
        artifacts: Option<PathBuf>,
    },

    /// Search the failure memory
    Recall {
        /// Free-text query
        #[arg(default_value = MEMORY_QUERY)]
        query: String,

        /// Number of records to show
        #[arg(short, default_value = "5")]
        k: usize,

        /// Memory index file
        #[arg(long, env = "BOARD_EXPLORER_MEMORY_PATH")]
        memory: Option<PathBuf>,
    },

    /// Render a simulated board to PNG
    Board {
        /// Width in pixels
        #[arg(short = 'W', long, default_value = "800")]
        width: u32,

        /// Height in pixels
        #[arg(short = 'H', long, default_value = "600")]
        height: u32,

        /// Comma-separated cell values (default: built-in board)
        #[arg(short, long)]
        board: Option<String>,

        /// Cells per row
        #[arg(short, long, default_value_t = DEFAULT_COLUMNS)]
        columns: usize,

        /// Output file path
        #[arg(short, long, default_value = "./board.png")]
        output: PathBuf,
    },

    /// Show the pair the matcher would pick for an objective
    Match {
        /// Comma-separated cell values
        #[arg(short, long)]
        board: String,

        /// Objective text
        objective: String,
    },
}

/// Where attempts run
#[derive(ClapArgs, Debug)]
struct TargetArgs {
    /// Terminal board application to drive (default: in-process simulated board)
    #[arg(short, long)]
    target: Option<PathBuf>,

    /// Arguments passed to the target (comma-separated)
    #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
    target_args: Vec<String>,

    /// Comma-separated starting board for the simulated target
    #[arg(short, long)]
    board: Option<String>,

    /// Cells per row for the simulated target
    #[arg(short, long, default_value_t = DEFAULT_COLUMNS)]
    columns: usize,

    /// Environment profiles, e.g. "Desktop:1920x1080,Mobile:375x812"
    #[arg(short, long, env = "BOARD_EXPLORER_ENVIRONMENTS")]
    environments: Option<String>,

    /// What a positive objective with no eligible pair becomes: analyze or blocked
    #[arg(long, default_value = "analyze")]
    no_move: NoMovePolicy,

    /// Delay after each click in milliseconds
    #[arg(long, env = "BOARD_EXPLORER_SETTLE_MS")]
    settle_ms: Option<u64>,

    /// Artifact directory
    #[arg(long, env = "BOARD_EXPLORER_ARTIFACT_DIR")]
    artifacts: Option<PathBuf>,

    /// Simulated target: refuse every session
    #[arg(long)]
    fault_setup: bool,

    /// Simulated target: change the board right after the first capture
    #[arg(long)]
    fault_disturb: bool,

    /// Simulated target: never remove matching pairs
    #[arg(long)]
    fault_ignore_matches: bool,
}

/// Collaborator overrides
#[derive(ClapArgs, Debug)]
struct LlmArgs {
    /// Collaborator endpoint URL
    #[arg(long, env = "BOARD_EXPLORER_LLM_ENDPOINT")]
    endpoint: Option<String>,

    /// Collaborator model name
    #[arg(long, env = "BOARD_EXPLORER_LLM_MODEL")]
    model: Option<String>,

    /// Do not attach screenshots to verdict requests
    #[arg(long)]
    text_only: bool,
}

impl LlmArgs {
    fn generator(&self) -> Arc<dyn TextGenerator> {
        let mut llm = LlmConfig::default();
        if let Some(endpoint) = &self.endpoint {
            llm.endpoint = endpoint.clone();
        }
        if let Some(model) = &self.model {
            llm = llm.model(model.clone());
        }

        match check_health(&llm.endpoint, 5) {
            Ok(true) => {}
            _ => warn!(endpoint = %llm.endpoint, "collaborator unreachable, planning and ranking will fall back"),
        }
        Arc::new(HttpGenerator::new(llm))
    }
}

impl TargetArgs {
    fn artifact_store(&self) -> anyhow::Result<ArtifactStore> {
        let store = ArtifactStore::new(self.artifacts.clone().unwrap_or_else(config::artifact_dir));
        store.init().context("Failed to prepare the artifact directory")?;
        Ok(store)
    }

    fn environments(&self) -> anyhow::Result<Vec<EnvironmentProfile>> {
        match &self.environments {
            Some(spec) => EnvironmentProfile::parse_list(spec)
                .with_context(|| format!("Invalid environment list '{}'. Use Name:WxH,...", spec)),
            None => Ok(config::get().cycle.environments.clone()),
        }
    }

    fn sessions(&self) -> anyhow::Result<Arc<dyn SessionFactory>> {
        if let Some(binary) = &self.target {
            return Ok(Arc::new(PtySessionFactory::new(binary).args(self.target_args.clone())));
        }
        let values = match &self.board {
            Some(board) => parse_board(board)?,
            None => DEFAULT_BOARD.to_vec(),
        };
        let faults = Faults {
            setup_failure: self.fault_setup,
            disturb_after_capture: self.fault_disturb,
            ignore_matches: self.fault_ignore_matches,
        };
        Ok(Arc::new(SimulatedSessionFactory::new(&values, self.columns).with_faults(faults)))
    }

    fn executor(&self, store: &ArtifactStore) -> anyhow::Result<Executor> {
        let settle = self.settle_ms.unwrap_or(config::get().cycle.settle_ms);
        Ok(Executor::new(self.sessions()?, ObjectiveMatcher::default(), store.clone()).with_config(
            ExecutorConfig {
                settle: Duration::from_millis(settle),
                no_move: self.no_move,
            },
        ))
    }
}

fn main() -> anyhow::Result<()> {
    logging::init();
    let args = Args::parse();

    match args.command {
        Commands::Cycle {
            target,
            llm,
            guidance,
            focus,
            rank_limit,
            cycles,
            json,
        } => {
            let store = target.artifact_store()?;
            let generator = llm.generator();
            let memory = MemoryStore::open(config::memory_path(), Arc::new(HashingEmbedder::default()))
                .context("Failed to open the failure memory")?;

            let guidance = match (focus, guidance.or_else(|| config::get().cycle.guidance_file.clone())) {
                (Some(text), _) => Guidance::Inline(text),
                (None, Some(path)) => Guidance::File(path),
                (None, None) => Guidance::None,
            };

            let first_id = next_generated_id(&store, &memory);
            let mut orchestrator = Orchestrator::new(
                memory,
                Planner::new(generator.clone()).starting_at(first_id),
                Ranker::new(generator.clone()),
                target.executor(&store)?,
                analyzer(generator, &store, &llm),
            )
            .with_environments(target.environments()?)
            .with_guidance(guidance)
            .with_config(CycleConfig {
                rank_limit: rank_limit.unwrap_or(config::get().cycle.rank_limit),
                memory_k: config::get().cycle.memory_k,
                ..CycleConfig::default()
            });

            for cycle in 1..=cycles.max(1) {
                let outcome = orchestrator.run_cycle();
                if json {
                    println!("{}", serde_json::to_string_pretty(&outcome.results)?);
                } else {
                    println!("Cycle {}: ran {:?} ({} generated)", cycle, outcome.ranked, outcome.generated);
                    print_results(&outcome.results);
                    println!("  Learned {} new failure(s)", outcome.learned);
                }
                if let Some(error) = outcome.error {
                    bail!("Cycle {} failed: {}", cycle, error);
                }
            }
            println!("Artifacts: {}", store.dir().display());
        }

        Commands::Plan { llm, guidance, out } => {
            let store = ArtifactStore::new(config::artifact_dir());
            let generator = llm.generator();
            let mut memory = MemoryStore::open(config::memory_path(), Arc::new(HashingEmbedder::default()))
                .context("Failed to open the failure memory")?;

            let context: Vec<String> = memory
                .retrieve(MEMORY_QUERY, config::get().cycle.memory_k)
                .into_iter()
                .map(|hit| hit.record.content)
                .collect();
            let guidance = guidance.map(Guidance::File).unwrap_or_default().read();

            let planner = Planner::new(generator).starting_at(next_generated_id(&store, &memory));
            let generated = planner.propose(&context.join("\n"), &guidance);
            if let Some(last) = generated.iter().map(|o| o.id).max() {
                memory
                    .reserve_objective_ids(last)
                    .context("Failed to record the generated objective ids")?;
            }
            let mut objectives = foundational_objectives();
            objectives.extend(generated);

            let handle = PlanHandle::new(objectives);
            handle
                .save(&out)
                .with_context(|| format!("Failed to write plan to {}", out.display()))?;
            for objective in &handle.objectives {
                println!("{:>5}  {}", objective.id, objective.objective);
            }
            println!("Saved plan: {}", out.display());
        }

        Commands::Execute {
            target,
            llm,
            plan,
            id,
            json,
        } => {
            let handle = match &plan {
                Some(path) => PlanHandle::load(path).with_context(|| format!("Failed to read plan {}", path.display()))?,
                None => PlanHandle::new(foundational_objectives()),
            };
            let Some(objective) = handle.find(id).cloned() else {
                bail!("Objective {} is not in the plan", id);
            };

            let store = target.artifact_store()?;
            let generator = llm.generator();
            let orchestrator = Orchestrator::new(
                MemoryStore::in_memory(Arc::new(HashingEmbedder::default())),
                Planner::new(generator.clone()),
                Ranker::deterministic(),
                target.executor(&store)?,
                analyzer(generator, &store, &llm),
            )
            .with_environments(target.environments()?);

            let reports = orchestrator.run_objective(&objective);
            if json {
                println!("{}", serde_json::to_string_pretty(&reports)?);
            } else {
                print_results(&reports);
            }
        }

        Commands::Report { id, env, artifacts } => {
            let store = ArtifactStore::new(artifacts.unwrap_or_else(config::artifact_dir));
            let reports: Vec<ExecutionReport> = match env {
                Some(env) => store.load_report(id, &env)?.into_iter().collect(),
                None => store.reports_for(id)?,
            };
            if reports.is_empty() {
                bail!("No reports stored for objective {}", id);
            }
            println!("{}", serde_json::to_string_pretty(&reports)?);
        }

        Commands::Recall { query, k, memory } => {
            let path = memory.unwrap_or_else(config::memory_path);
            let store = MemoryStore::open(&path, Arc::new(HashingEmbedder::default()))
                .with_context(|| format!("Failed to open memory at {}", path.display()))?;
            for hit in store.retrieve(&query, k) {
                println!("[{:.3}] {}", hit.score, hit.record.content);
            }
        }

        Commands::Board {
            width,
            height,
            board,
            columns,
            output,
        } => {
            let values = match board {
                Some(board) => parse_board(&board)?,
                None => DEFAULT_BOARD.to_vec(),
            };
            let shot = SimulatedSessionFactory::new(&values, columns).board().render(width, height)?;
            std::fs::write(&output, &shot.png)?;
            println!("Created board screenshot: {}", output.display());
            println!("  Size: {}x{}, {} cells", width, height, values.len());
        }

        Commands::Match { board, objective } => {
            let snapshot = ElementSnapshot::from_values(parse_board(&board)?.iter().map(u8::to_string));
            let plan = ObjectiveMatcher::default().match_objective(&snapshot, &objective);
            println!("{}", serde_json::to_string_pretty(&plan)?);
        }
    }

    Ok(())
}

fn analyzer(generator: Arc<dyn TextGenerator>, store: &ArtifactStore, llm: &LlmArgs) -> Analyzer {
    Analyzer::new(generator, store.clone()).with_config(AnalyzerConfig {
        attach_screenshot: !llm.text_only,
        ..AnalyzerConfig::default()
    })
}

/// First id not used by a stored report, a remembered failure or an earlier plan
fn next_generated_id(store: &ArtifactStore, memory: &MemoryStore) -> u64 {
    store
        .list_reports()
        .unwrap_or_default()
        .iter()
        .map(|r| r.test_case_id)
        .chain([memory.last_objective_id()])
        .max()
        .unwrap_or(0)
        + 1
}

fn parse_board(spec: &str) -> anyhow::Result<Vec<u8>> {
    spec.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| match s.parse::<u8>() {
            Ok(v) if (1..=9).contains(&v) => Ok(v),
            _ => bail!("Invalid cell '{}'. Cells are digits 1-9", s),
        })
        .collect()
}

fn print_results(reports: &[ExecutionReport]) {
    for report in reports {
        println!(
            "  tc{:04} {:<10} {:<16} {}",
            report.test_case_id,
            report.environment,
            report.status.to_string(),
            report.reason().unwrap_or("")
        );
    }
}
