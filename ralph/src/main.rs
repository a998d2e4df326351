//! `ralph`: drive an autonomous coding agent against a local model endpoint.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand};

use ralph::core::types::Termination;
use ralph::error::ConfigError;
use ralph::exit_codes;
use ralph::io::config::{CritiqueMode, EngineConfig, load_config};
use ralph::io::hitl::{HitlSource, NoHitl, StdinHitl};
use ralph::io::init::{InitOptions, RalphPaths, init_state_dir};
use ralph::io::model::OpenAiCompatClient;
use ralph::logging;
use ralph::looping::{LoopStop, init_run, run_loop};
use ralph::status::{StatusQuery, StatusReport, find_run};
use ralph::step::{Engine, StepOutcome};

#[derive(Parser)]
#[command(
    name = "ralph",
    version,
    about = "Iteration-control engine for an autonomous coding agent"
)]
struct Cli {
    /// Project root holding `.ralph/`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    /// Log progress at info level (`RUST_LOG` takes precedence).
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.ralph/` with a default config.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Run (or resume) the agent loop for a goal.
    Run(RunArgs),
    /// Print the persisted state of a run.
    Status {
        #[arg(long, conflicts_with = "run_id")]
        goal: Option<String>,
        #[arg(long)]
        run_id: Option<String>,
    },
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Goal text.
    #[arg(long, conflicts_with = "prompt_file")]
    goal: Option<String>,
    /// Read the goal from a file (for long spec documents).
    #[arg(long)]
    prompt_file: Option<PathBuf>,
    /// One pre-seeded task per non-empty line.
    #[arg(long)]
    tasks_file: Option<PathBuf>,
    #[arg(long)]
    workspace: Option<PathBuf>,
    /// Iteration budget.
    #[arg(long)]
    iterations: Option<u32>,
    /// Model endpoint base URL.
    #[arg(long)]
    url: Option<String>,
    #[arg(long)]
    model: Option<String>,
    /// Run the draft/critique/refine pass every iteration.
    #[arg(long, conflicts_with = "critique_on_confusion")]
    deep_thought: bool,
    /// Run the critique pass only when the agent looks stuck.
    #[arg(long)]
    critique_on_confusion: bool,
    /// Prompt for an operator directive between iterations.
    #[arg(long)]
    hitl: bool,
    /// Stream model replies over SSE.
    #[arg(long)]
    stream: bool,
}

impl RunArgs {
    fn apply(&self, cfg: &mut EngineConfig) {
        if let Some(workspace) = &self.workspace {
            cfg.workspace = workspace.clone();
        }
        if let Some(iterations) = self.iterations {
            cfg.max_iterations = iterations;
        }
        if let Some(url) = &self.url {
            cfg.model.base_url = url.clone();
        }
        if let Some(model) = &self.model {
            cfg.model.model = model.clone();
        }
        if self.deep_thought {
            cfg.critique.mode = CritiqueMode::Always;
        } else if self.critique_on_confusion {
            cfg.critique.mode = CritiqueMode::OnConfusion;
        }
        if self.stream {
            cfg.model.stream = true;
        }
    }

    fn goal(&self) -> Result<String> {
        let goal = match (&self.goal, &self.prompt_file) {
            (Some(goal), _) => goal.clone(),
            (None, Some(path)) => fs::read_to_string(path)
                .with_context(|| format!("read prompt file {}", path.display()))?,
            (None, None) => return Err(anyhow!("a goal is required (--goal or --prompt-file)")),
        };
        if goal.trim().is_empty() {
            return Err(anyhow!("goal must not be empty"));
        }
        Ok(goal)
    }

    fn tasks(&self) -> Result<Vec<String>> {
        let Some(path) = &self.tasks_file else {
            return Ok(Vec::new());
        };
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read tasks file {}", path.display()))?;
        Ok(parse_tasks(&raw))
    }
}

/// One task per non-empty line; list bullets are stripped.
fn parse_tasks(raw: &str) -> Vec<String> {
    raw.lines()
        .map(|line| line.trim().trim_start_matches(['-', '*']).trim())
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    let code = match dispatch(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            if err.downcast_ref::<ConfigError>().is_some() {
                exit_codes::INVALID
            } else {
                exit_codes::ERROR
            }
        }
    };
    std::process::exit(code);
}

fn dispatch(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Init { force } => {
            let paths = init_state_dir(&cli.root, &InitOptions { force })?;
            println!("initialized {}", paths.ralph_dir.display());
            Ok(exit_codes::DONE)
        }
        Command::Run(args) => cmd_run(cli.root, &args),
        Command::Status { goal, run_id } => {
            let query = match (goal, run_id) {
                (Some(goal), _) => StatusQuery::Goal(goal),
                (None, Some(id)) => StatusQuery::RunId(id),
                (None, None) => StatusQuery::Latest,
            };
            let paths = RalphPaths::new(&cli.root);
            match find_run(&paths, &query) {
                Ok(state) => {
                    print!("{}", StatusReport::from_state(&state));
                    Ok(exit_codes::DONE)
                }
                Err(err) => {
                    eprintln!("{err:#}");
                    Ok(exit_codes::INVALID)
                }
            }
        }
    }
}

fn cmd_run(root: PathBuf, args: &RunArgs) -> Result<i32> {
    let (goal, tasks) = match args.goal().and_then(|goal| Ok((goal, args.tasks()?))) {
        Ok(input) => input,
        Err(err) => {
            eprintln!("{err:#}");
            return Ok(exit_codes::INVALID);
        }
    };

    let paths = RalphPaths::new(root);
    let mut cfg = load_config(&paths.config_path)?;
    args.apply(&mut cfg);
    let engine = Engine::new(paths, cfg)?;
    let model = OpenAiCompatClient::new(&engine.config.model)?;
    let mut hitl: Box<dyn HitlSource> = if args.hitl {
        Box::new(StdinHitl::stdio())
    } else {
        Box::new(NoHitl)
    };

    let mut state = init_run(&engine, &goal, &tasks)?;
    println!(
        "run {} · workspace {}",
        state.run_id,
        engine.sandbox.root().display()
    );
    let outcome = run_loop(&engine, &mut state, &model, hitl.as_mut(), print_step)?;

    let code = match &outcome.stop {
        LoopStop::Done => {
            println!("done after {} iterations", state.iteration);
            exit_codes::DONE
        }
        LoopStop::Killed { reason } => {
            println!("killed: {reason}");
            exit_codes::KILLED
        }
        LoopStop::BudgetExhausted { max_iterations } => {
            println!("iteration budget of {max_iterations} exhausted; rerun to resume");
            exit_codes::BUDGET_EXHAUSTED
        }
        LoopStop::Quit => {
            println!("stopped by operator; rerun to resume");
            exit_codes::QUIT
        }
    };
    Ok(code)
}

fn print_step(step: &StepOutcome) {
    let task = step.task_id.as_deref().unwrap_or("-");
    match &step.observation {
        Some(obs) => {
            let mark = if obs.success { "ok" } else { "failed" };
            let first = obs.outcome.lines().next().unwrap_or_default();
            println!("[{}] {task} {} [{mark}] {first}", step.iter, obs.action);
        }
        None => {
            let state = step.termination.map_or("stopped", Termination::as_str);
            println!("[{}] {task} {state}", step.iter);
        }
    }
}
