pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "signoff",
    about = "Signoff operator CLI",
    long_about = "Operate the approval engine: migrations, readiness checks, config inspection, SLA sweeps and ledger verification.",
    after_help = "Examples:\n  signoff doctor --json\n  signoff sweep\n  signoff verify-ledger REQ-1234"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, identity directory settings, DB connectivity and schema")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Fire every overdue SLA timer once and report the outcome")]
    Sweep,
    #[command(about = "Recompute the hash chain of one request's action ledger")]
    VerifyLedger {
        #[arg(help = "Approval request id")]
        request_id: String,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => {
            let (healthy, output) = commands::doctor::run(json);
            commands::CommandResult { exit_code: if healthy { 0 } else { 1 }, output }
        }
        Command::Sweep => commands::sweep::run(),
        Command::VerifyLedger { request_id } => commands::verify_ledger::run(&request_id),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
