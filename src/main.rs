use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use gateway_sentinel::backup::BackupKeeper;
use gateway_sentinel::config::Settings;
use gateway_sentinel::escalate::CascadeOutcome;
use gateway_sentinel::eventlog::EventLog;
use gateway_sentinel::exec::SystemRunner;
use gateway_sentinel::health;
use gateway_sentinel::observability;
use gateway_sentinel::supervisor::{Supervisor, TickOutcome};

#[derive(Parser, Debug)]
#[command(name = "gateway-sentinel")]
#[command(about = "Self-healing supervisor for the gateway service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the supervision loop.
    Run {
        /// Perform a single tick and print its outcome instead of looping.
        #[arg(long, default_value_t = false)]
        once: bool,
    },
    /// Validate runtime configuration and print effective paths.
    Doctor,
    /// Run one health probe; the exit status reflects the verdict.
    Check,
    /// List rollback candidates, best first.
    Backups,
}

fn main() -> Result<()> {
    observability::init();
    let cli = Cli::parse();
    let settings = Settings::load()?;

    match cli.command.unwrap_or(Commands::Run { once: false }) {
        Commands::Run { once } => {
            let log = EventLog::open(&settings.log_path, settings.log_to_stdout)?;
            let mut supervisor = Supervisor::new(settings, log);
            if once {
                println!("{}", describe_tick(supervisor.tick()));
            } else {
                let shutdown = Arc::new(AtomicBool::new(false));
                let signal_flag = Arc::clone(&shutdown);
                ctrlc::set_handler(move || {
                    signal_flag.store(true, Ordering::SeqCst);
                })?;
                supervisor.run(shutdown)?;
            }
        }
        Commands::Doctor => {
            let report = settings.doctor_report();
            println!("Gateway Sentinel Doctor");
            println!("interval_secs: {}", report.interval_secs);
            println!("service_bin: {}", report.service_bin);
            println!("config_path: {}", report.config_path.display());
            println!("backup_dir: {}", report.backup_dir.display());
            println!("state_path: {}", report.state_path.display());
            println!("log_path: {}", report.log_path.display());
            println!(
                "service_unit_path: {}",
                report
                    .service_unit_path
                    .map(|path| path.display().to_string())
                    .unwrap_or_else(|| "<unset>".to_string())
            );
            println!("auto_rollback: {}", report.auto_rollback);
            println!("max_restart_attempts: {}", report.max_restart_attempts);
            if report.warnings.is_empty() {
                println!("status: ok");
            } else {
                println!("status: warning");
                for warning in report.warnings {
                    println!("- {}", warning);
                }
            }
        }
        Commands::Check => {
            let report = health::probe(&SystemRunner, &settings);
            if report.healthy {
                println!("healthy");
            } else {
                let detail = report
                    .outcome
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("exit code {:?}", report.outcome.exit_code));
                println!("unhealthy: {}", detail);
                if !report.outcome.stderr.trim().is_empty() {
                    eprintln!("{}", report.outcome.stderr.trim());
                }
                std::process::exit(1);
            }
        }
        Commands::Backups => {
            let keeper =
                BackupKeeper::new(settings.config_path.clone(), settings.backup_dir.clone());
            let candidates = keeper.candidates();
            if candidates.is_empty() {
                println!("no rollback candidates");
            } else {
                for path in candidates {
                    println!("{}", path.display());
                }
            }
        }
    }

    Ok(())
}

fn describe_tick(outcome: TickOutcome) -> &'static str {
    match outcome {
        TickOutcome::Healthy => "healthy",
        TickOutcome::Recovered(CascadeOutcome::RecoveredAfterStart) => "recovered after start",
        TickOutcome::Recovered(CascadeOutcome::RecoveredAfterRestart) => "recovered after restart",
        TickOutcome::Recovered(CascadeOutcome::RecoveredAfterRollback) => {
            "recovered after rollback"
        }
        TickOutcome::Recovered(CascadeOutcome::StillUnhealthy) | TickOutcome::StillUnhealthy => {
            "still unhealthy"
        }
    }
}
