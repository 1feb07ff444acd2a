pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use ladder_core::config::LoadOptions;

use crate::commands::doctor::CheckStatus;
use crate::commands::seed::SeedAction;

#[derive(Debug, Parser)]
#[command(
    name = "ladder",
    about = "Ladder approval workflow operator CLI",
    long_about = "Operate the Ladder approval engine: schema migrations, demo data, reminder scans, config inspection and readiness checks.",
    after_help = "Examples:\n  ladder migrate\n  ladder seed\n  ladder remind --stale-after-hours 24\n  ladder doctor --json"
)]
pub struct Cli {
    #[arg(long, global = true, help = "Path to a ladder.toml config file (must exist)")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Load the demo institution, users, groups and approval documents")]
    Seed {
        #[arg(long, help = "Only verify a previous load", conflicts_with = "clean")]
        verify: bool,
        #[arg(long, help = "Remove the demo institution and its workflows")]
        clean: bool,
    },
    #[command(about = "Run one reminder scan over stale pending tasks")]
    Remind {
        #[arg(long, help = "Override reminders.stale_after_hours for this scan")]
        stale_after_hours: Option<u64>,
    },
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, database reachability, schema and approval documents")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
}

impl Cli {
    fn load_options(&self) -> LoadOptions {
        LoadOptions {
            config_path: self.config.clone(),
            require_file: self.config.is_some(),
            ..LoadOptions::default()
        }
    }
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    let options = cli.load_options();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(options),
        Command::Seed { verify, clean } => {
            let action = match (verify, clean) {
                (_, true) => SeedAction::Clean,
                (true, false) => SeedAction::Verify,
                (false, false) => SeedAction::Load,
            };
            commands::seed::run(options, action)
        }
        Command::Remind { stale_after_hours } => commands::remind::run(options, stale_after_hours),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run(options) }
        }
        Command::Doctor { json } => {
            let (status, output) = commands::doctor::run(options, json);
            let exit_code = if status == CheckStatus::Pass { 0 } else { 1 };
            commands::CommandResult { exit_code, output }
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
