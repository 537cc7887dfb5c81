use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::{json, Value};
use squircle_core::{assign_context, interleaved_plan, permutation_blocks, UsageCounters};
use squircle_runner::{
    run_simulated, tracking_file_name, SessionConfig, SessionMode, SessionSummary,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "squircle",
    version = "0.3.0",
    about = "Squircle contextual memory task control"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeArg {
    #[value(name = "free")]
    Free,
    #[value(name = "train")]
    Train,
    #[value(name = "test")]
    Test,
}

impl From<ModeArg> for SessionMode {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::Free => SessionMode::Free,
            ModeArg::Train => SessionMode::Train,
            ModeArg::Test => SessionMode::Test,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Show the resolved session configuration and tracking file layout
    Describe {
        #[arg(value_enum)]
        mode: ModeArg,
        #[arg(long)]
        subject: u32,
        #[arg(long)]
        run: Option<u32>,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Generate and print a balanced trial plan
    Plan {
        #[arg(value_enum)]
        mode: ModeArg,
        #[arg(long)]
        subject: u32,
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Run a whole session headlessly against the simulated participant
    Simulate {
        #[arg(value_enum)]
        mode: ModeArg,
        #[arg(long)]
        subject: u32,
        #[arg(long)]
        run: Option<u32>,
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        data_dir: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command) {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json!({
                    "ok": false,
                    "error": "command_failed",
                    "message": err.to_string(),
                }));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Describe { json, .. } => *json,
        Commands::Plan { json, .. } => *json,
        Commands::Simulate { json, .. } => *json,
    }
}

fn emit_json(payload: &Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(payload).unwrap_or_else(|_| "{}".to_string())
    );
}

fn require_positive_subject(subject: u32) -> Result<()> {
    if subject == 0 {
        return Err(anyhow!("subject id must be a positive integer"));
    }
    Ok(())
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Describe {
            mode,
            subject,
            run,
            config,
            json,
        } => {
            require_positive_subject(subject)?;
            let mode = SessionMode::from(mode);
            let config = SessionConfig::load(mode, config.as_deref())?;
            let files = tracking_files(mode, subject, run, &config)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "mode": mode.as_str(),
                    "subject": subject,
                    "data_dir": config.data_dir.display().to_string(),
                    "arena_radius": config.arena_radius,
                    "iti_seconds": config.iti_seconds,
                    "runs": config.runs,
                    "run_length_seconds": config.run_length_seconds,
                    "sample_interval_seconds": config.sample_interval_seconds,
                    "objects": config.catalog.objects.iter().map(|o| o.name.clone()).collect::<Vec<_>>(),
                    "tracking_files": files,
                })));
            }
            println!("mode: {}", mode.as_str());
            println!("subject: {}", subject);
            println!("data_dir: {}", config.data_dir.display());
            println!("arena_radius: {}", config.arena_radius);
            println!("iti_seconds: {}", config.iti_seconds);
            println!("runs: {}", config.runs);
            println!(
                "objects: {}",
                config
                    .catalog
                    .objects
                    .iter()
                    .map(|o| o.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            if files.is_empty() {
                println!("tracking_files: none");
            } else {
                for file in files {
                    println!("tracking_file: {}", file);
                }
            }
        }
        Commands::Plan {
            mode,
            subject,
            seed,
            config,
            json,
        } => {
            require_positive_subject(subject)?;
            let mode = SessionMode::from(mode);
            let config = SessionConfig::load(mode, config.as_deref())?;
            let mut rng = match seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            };
            let plan = build_plan(mode, subject, &config, &mut rng)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "plan",
                    "mode": mode.as_str(),
                    "subject": subject,
                    "trials": plan
                        .iter()
                        .map(|(run, context, object)| {
                            json!({"run": run, "context": context, "object": object})
                        })
                        .collect::<Vec<_>>(),
                })));
            }
            for (run, context, object) in plan {
                match object {
                    Some(object) => println!("run {}: {} {}", run, context, object),
                    None => println!("run {}: {}", run, context),
                }
            }
        }
        Commands::Simulate {
            mode,
            subject,
            run,
            seed,
            config,
            data_dir,
            json,
        } => {
            require_positive_subject(subject)?;
            let mode = SessionMode::from(mode);
            let mut config = SessionConfig::load(mode, config.as_deref())?;
            if let Some(data_dir) = data_dir {
                config.data_dir = data_dir;
            }
            let summary = run_simulated(mode, subject, run, config, seed)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "simulate",
                    "summary": serde_json::to_value(&summary)?,
                })));
            }
            print_summary(&summary);
        }
    }
    Ok(None)
}

fn tracking_files(
    mode: SessionMode,
    subject: u32,
    run: Option<u32>,
    config: &SessionConfig,
) -> Result<Vec<String>> {
    match mode {
        SessionMode::Free => Ok(Vec::new()),
        SessionMode::Train => Ok((1..=config.runs)
            .map(|run| {
                let context = assign_context(run, subject);
                tracking_file_name(mode, subject, Some(context), run)
            })
            .collect()),
        SessionMode::Test => {
            let run = run.ok_or_else(|| anyhow!("test mode requires --run"))?;
            if run == 0 {
                return Err(anyhow!("run number must be a positive integer"));
            }
            Ok(vec![tracking_file_name(mode, subject, None, run)])
        }
    }
}

type PlanLine = (u32, String, Option<String>);

fn build_plan(
    mode: SessionMode,
    subject: u32,
    config: &SessionConfig,
    rng: &mut StdRng,
) -> Result<Vec<PlanLine>> {
    let catalog = &config.catalog;
    let mut lines = Vec::new();
    match mode {
        SessionMode::Free => {
            for run in 1..=config.runs {
                let context = assign_context(run, subject);
                lines.push((run, context.name().to_string(), None));
            }
        }
        SessionMode::Train => {
            for run in 1..=config.runs {
                let context = assign_context(run, subject);
                if run <= config.warmup_runs {
                    for object in
                        permutation_blocks(catalog.len(), config.initial_collect_per_object, rng)?
                    {
                        lines.push((
                            run,
                            format!("{} collect", context),
                            catalog.get(object).map(|o| o.name.clone()),
                        ));
                    }
                }
                for object in permutation_blocks(catalog.len(), config.trials_per_object, rng)? {
                    lines.push((
                        run,
                        format!("{} replace", context),
                        catalog.get(object).map(|o| o.name.clone()),
                    ));
                }
            }
        }
        SessionMode::Test => {
            let mut counters = UsageCounters::new(catalog.len());
            let plan =
                interleaved_plan(catalog.len(), config.trials_per_context, &mut counters, rng)?;
            for trial in plan {
                lines.push((
                    1,
                    trial.context.name().to_string(),
                    catalog.get(trial.object).map(|o| o.name.clone()),
                ));
            }
        }
    }
    Ok(lines)
}

fn print_summary(summary: &SessionSummary) {
    println!("mode: {}", summary.mode.as_str());
    println!("subject: {}", summary.subject);
    println!("runs_completed: {}", summary.runs_completed);
    println!("trials_completed: {}", summary.trials_completed);
    println!("scored_trials: {}", summary.scored_trials);
    match summary.mean_replace_error {
        Some(mean) => println!("mean_replace_error: {:.3}", mean),
        None => println!("mean_replace_error: none"),
    }
    if summary.log_paths.is_empty() {
        println!("tracking_files: none");
    } else {
        for path in &summary.log_paths {
            println!("tracking_file: {}", path.display());
        }
    }
}
