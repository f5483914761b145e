use anyhow::{Result, bail};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;

use crate::commands::{self, CommandReport};

#[derive(Parser)]
#[command(name = "prebake")]
#[command(version)]
#[command(about = "Distill long agent session logs into compact, integrity-checked artifacts")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Session log to ingest (not needed with --skip-ingest)
    #[arg(required_unless_present = "skip_ingest")]
    pub source: Option<PathBuf>,

    #[arg(long)]
    pub skip_ingest: bool,

    #[arg(long)]
    pub skip_retention: bool,

    #[arg(long)]
    pub skip_condense: bool,

    /// Existing artifact to start from when ingest is skipped
    #[arg(long, value_name = "ID")]
    pub input_session: Option<String>,

    #[arg(long, value_name = "TEXT")]
    pub instruction_a: Option<String>,

    #[arg(long, value_name = "TEXT")]
    pub instruction_b: Option<String>,

    #[arg(long, value_name = "TEXT")]
    pub instruction_c: Option<String>,

    #[arg(long, value_name = "N")]
    pub max_retries: Option<u32>,

    /// Per-stage timeout applied to all stages
    #[arg(long, value_name = "N")]
    pub timeout_secs: Option<u64>,

    /// Skip checkpoints between stages
    #[arg(long)]
    pub no_validate: bool,

    #[arg(long)]
    pub no_recovery: bool,

    #[arg(long)]
    pub no_progress: bool,

    /// Print the full result as JSON
    #[arg(long)]
    pub json: bool,
}

impl From<&RunArgs> for commands::run::RunOptions {
    fn from(args: &RunArgs) -> Self {
        Self {
            source: args.source.clone(),
            skip_ingest: args.skip_ingest,
            skip_retention: args.skip_retention,
            skip_condense: args.skip_condense,
            input_session: args.input_session.clone(),
            instruction_a: args.instruction_a.clone(),
            instruction_b: args.instruction_b.clone(),
            instruction_c: args.instruction_c.clone(),
            max_retries: args.max_retries,
            timeout_secs: args.timeout_secs,
            no_validate: args.no_validate,
            no_recovery: args.no_recovery,
            no_progress: args.no_progress,
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the pipeline over a session log
    Run(RunArgs),

    /// Read a log and report parse health, content mix and integrity
    Inspect {
        log: PathBuf,

        /// Skip brace pre-validation
        #[arg(long)]
        lenient: bool,

        #[arg(long)]
        json: bool,
    },

    /// Show resolved paths, configuration and oracle
    Status {
        #[arg(long)]
        json: bool,
    },
}

fn emit<T: Serialize>(report: &CommandReport, payload: &T, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(payload)?);
    } else {
        print!("{}", report.render());
    }
    if !report.ok {
        bail!("{} reported {} issue(s)", report.command, report.issues.len());
    }
    Ok(())
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => {
            let result = commands::run::run(&(&args).into())?;
            let report = commands::run::to_command_report(&result);
            emit(&report, &result, args.json)
        }
        Commands::Inspect { log, lenient, json } => {
            let inspect = commands::inspect::run(&commands::inspect::InspectOptions { log, lenient })?;
            let report = commands::inspect::to_command_report(&inspect);
            emit(&report, &inspect, json)
        }
        Commands::Status { json } => {
            let report = commands::status::run()?;
            emit(&report, &report, json)
        }
    }
}
