// Unitpanel - single-flight control and log tailing for game server units
// Main entry point

use anyhow::Result;
use byte_unit::{Byte, UnitType};
use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use unitpanel::config::Config;
use unitpanel::control::{ActionReport, UnitAction, UnitController, UnitStatus};
use unitpanel::version::build_info;

#[derive(Parser, Debug)]
#[command(name = "unitpanel")]
#[command(author, about, long_about = None)]
#[command(disable_version_flag = true)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Show version information
    #[arg(short = 'V', long)]
    version: bool,

    /// Show detailed build information
    #[arg(long)]
    build_info: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List configured units and their commands
    Units,
    /// Show the state of one unit, or all of them
    Status { unit: Option<String> },
    /// Start a unit
    Start { unit: String },
    /// Stop a unit
    Stop { unit: String },
    /// Restart a unit
    Restart { unit: String },
    /// Run a unit's update command
    Update { unit: String },
    /// Re-read a unit's state from systemd
    Refresh { unit: String },
    /// Print the newest log lines of a unit
    Logs {
        unit: String,
        /// Number of lines (defaults to the configured default_log_lines)
        #[arg(short = 'n', long)]
        lines: Option<usize>,
        /// Byte ceiling, e.g. "64 KiB" (defaults to the configured max_log_bytes)
        #[arg(long)]
        max_bytes: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.version {
        println!("{}", build_info().format_display());
        return Ok(());
    }

    if cli.build_info {
        println!("{}", build_info().format_display());
        println!("\n{}", build_info().format_build_info());
        return Ok(());
    }

    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        return Ok(());
    };

    let config = Config::load(cli.config)?;
    init_logging(&config, cli.debug)?;

    let controller = config.controller().await?;
    run(command, &controller, &config).await
}

fn init_logging(config: &Config, debug: bool) -> Result<()> {
    let level = if debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    match &config.log_file {
        Some(path) => {
            let log_file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            let subscriber = tracing_subscriber::fmt()
                .with_max_level(level)
                .with_writer(std::sync::Mutex::new(log_file))
                .with_ansi(false)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        None => {
            let subscriber = tracing_subscriber::fmt()
                .with_max_level(level)
                .with_writer(std::io::stderr)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }
    Ok(())
}

async fn run(command: Command, controller: &UnitController, config: &Config) -> Result<()> {
    match command {
        Command::Units => {
            for name in controller.units() {
                let unit = controller.unit(name)?;
                println!("{} ({})", unit.name, unit.systemd_unit);
                for action in UnitAction::ALL {
                    println!("  {:<8} {}", action, unit.commands.argv(action).join(" "));
                }
            }
        }
        Command::Status { unit: Some(unit) } => {
            let status = controller.refresh_status(&unit).await?;
            print_status(&status);
        }
        Command::Status { unit: None } => {
            for name in controller.units() {
                let status = controller.refresh_status(name).await?;
                print_status(&status);
            }
        }
        Command::Start { unit } => act(controller, &unit, UnitAction::Start).await?,
        Command::Stop { unit } => act(controller, &unit, UnitAction::Stop).await?,
        Command::Restart { unit } => act(controller, &unit, UnitAction::Restart).await?,
        Command::Update { unit } => act(controller, &unit, UnitAction::Update).await?,
        Command::Refresh { unit } => {
            let status = controller.refresh_status(&unit).await?;
            print_status(&status);
        }
        Command::Logs {
            unit,
            lines,
            max_bytes,
        } => {
            let max_lines = lines.unwrap_or(config.default_log_lines);
            let max_bytes = match max_bytes {
                Some(size) => Byte::parse_str(&size, true)
                    .map_err(|e| anyhow::anyhow!("Invalid size '{}': {}", size, e))?
                    .as_u64(),
                None => config.max_log_bytes()?,
            };
            let max_bytes = usize::try_from(max_bytes).unwrap_or(usize::MAX);

            let tail = controller.tail_log(&unit, max_lines, max_bytes).await?;
            print!("{}", tail.text);
            if tail.truncated {
                eprintln!(
                    "-- showing last {} lines (limits: {} lines, {}) --",
                    tail.lines,
                    max_lines,
                    format_bytes(max_bytes as u64)
                );
            }
        }
    }
    Ok(())
}

async fn act(controller: &UnitController, unit: &str, action: UnitAction) -> Result<()> {
    let report = controller.request_action(unit, action).await?;
    print_report(&report);
    report.into_result()?;
    Ok(())
}

fn print_report(report: &ActionReport) {
    let code = report
        .exit_code()
        .map(|code| code.to_string())
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{} {}: {:?} (exit {}, {:.1}s) -> {}",
        report.action,
        report.unit,
        report.outcome,
        code,
        report.elapsed.as_secs_f64(),
        report.state
    );
    if !report.result.stdout_tail.is_empty() {
        println!("{}", report.result.stdout_tail.trim_end());
    }
}

fn print_status(status: &UnitStatus) {
    let mut flags = Vec::new();
    if status.busy {
        flags.push("busy");
    }
    if status.stuck {
        flags.push("STUCK");
    }
    let flags = if flags.is_empty() {
        String::new()
    } else {
        format!(" [{}]", flags.join(", "))
    };

    println!("{}: {}{}", status.name, status.state, flags);
    if let Some(last) = &status.last_result {
        println!(
            "  last: {} at {} (exit {})",
            last.action,
            last.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
            last.exit_code
                .map(|code| code.to_string())
                .unwrap_or_else(|| "-".to_string())
        );
    }
}

/// Format bytes as human-readable string (e.g., "256 KiB")
fn format_bytes(bytes: u64) -> String {
    let byte = Byte::from_u64(bytes);
    byte.get_appropriate_unit(UnitType::Binary).to_string()
}
