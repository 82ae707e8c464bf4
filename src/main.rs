//! Mender - autonomous patch-and-verify debugging
//!
//! Thin command-line front-end over the `mender` library.

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing_subscriber::EnvFilter;

use mender::config::BackendConfig;
use mender::{
    ConfigValidator, ErrorSignature, LearningStore, MenderError, Orchestrator, PatchOutcome,
    ProjectConfig, SessionReport, SessionStatus, ValidationReport,
};

#[derive(Parser)]
#[command(name = "mender")]
#[command(version)]
#[command(about = "Autonomous test-failure repair with verified, reversible patches", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Project directory (defaults to current directory)
    #[arg(short, long, global = true, default_value = ".")]
    project: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one debugging session
    Run {
        /// Test command (overrides settings)
        #[arg(long, env = "MENDER_TEST_COMMAND")]
        test_command: Option<String>,

        /// Maximum retry cycles (overrides settings)
        #[arg(long)]
        max_cycles: Option<u32>,

        /// Additional fix backend command, tried after configured ones (repeatable)
        #[arg(long = "backend-command", value_name = "CMD")]
        backend_commands: Vec<String>,
    },

    /// Show the stored history for a signature
    History {
        /// Error signature (64 hex characters)
        signature: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show daily fix analytics
    Stats {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Remove the most recent successful patch for a signature
    Undo {
        /// Error signature (64 hex characters)
        signature: String,
    },

    /// Configuration commands
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Validate settings and report problems
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let default_filter = if cli.verbose {
        "mender=debug,info"
    } else {
        "mender=info,warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }

    // Resolve project path
    let project_path = cli.project.canonicalize().unwrap_or(cli.project.clone());
    if !project_path.is_dir() {
        let err = MenderError::MissingProject {
            path: project_path.clone(),
        };
        eprintln!("{} {}", "Error:".red().bold(), err);
        std::process::exit(err.exit_code());
    }

    match cli.command {
        Commands::Run {
            test_command,
            max_cycles,
            backend_commands,
        } => {
            let config = load_config(&project_path);
            let config = apply_overrides(config, test_command, max_cycles, backend_commands);

            let mut validation = ValidationReport::new();
            ConfigValidator::check_values(&config, &mut validation);
            print_warnings(&validation);
            if !validation.is_valid() {
                for error in &validation.errors {
                    eprintln!("{} {}", "Error:".red().bold(), error);
                }
                std::process::exit(MenderError::invalid_config("settings", validation.summary()).exit_code());
            }

            let report = Orchestrator::from_config(&project_path, config)
                .run_until(async {
                    let _ = tokio::signal::ctrl_c().await;
                })
                .await;

            match report {
                Ok(report) => {
                    print_report(&report);
                    if report.status != SessionStatus::Success {
                        std::process::exit(1);
                    }
                }
                Err(e) => {
                    eprintln!("{} {}", "Error:".red().bold(), e);
                    std::process::exit(e.exit_code());
                }
            }
        }

        Commands::History { signature, json } => {
            let signature = parse_signature(&signature);
            let store = open_store(&project_path);
            let history = store.history(&signature);

            if json {
                println!("{}", serde_json::to_string_pretty(&history)?);
            } else if history.is_empty() {
                println!("No history for {}", signature.short());
            } else {
                println!(
                    "{} {} attempt(s), {} verified",
                    signature.short().bold(),
                    history.len(),
                    history.verified_count()
                );
                for attempt in &history.attempts {
                    let outcome = match attempt.outcome {
                        PatchOutcome::Verified => attempt.outcome.to_string().green(),
                        PatchOutcome::Failed => attempt.outcome.to_string().red(),
                        _ => attempt.outcome.to_string().yellow(),
                    };
                    println!(
                        "  {} {:<8} conf {:.2} via {}  {}",
                        attempt.timestamp.format("%Y-%m-%d %H:%M:%S"),
                        outcome,
                        attempt.confidence,
                        attempt.backend,
                        attempt.reason
                    );
                }
            }
            report_store_anomalies(&store);
        }

        Commands::Stats { json } => {
            let store = open_store(&project_path);
            let stats = store.daily_stats();

            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else if stats.is_empty() {
                println!("No fixes recorded yet.");
            } else {
                println!("{}", "Daily analytics".bold());
                for (day, day_stats) in &stats {
                    println!(
                        "  {}  {:>4} fix(es)  {:>4} verified  {:>5.1}%",
                        day,
                        day_stats.total_fixes,
                        day_stats.successes,
                        day_stats.success_rate * 100.0
                    );
                }
            }
            report_store_anomalies(&store);
        }

        Commands::Undo { signature } => {
            let signature = parse_signature(&signature);
            let store = open_store(&project_path);
            match store.undo_last_success(&signature) {
                Ok(Some(attempt)) => {
                    println!(
                        "{} Removed successful patch {} for {}",
                        "OK".green().bold(),
                        attempt.id,
                        signature.short()
                    );
                    println!("{}", attempt.patch_text);
                }
                Ok(None) => {
                    println!(
                        "{} No successful patch stored for {}",
                        "Info:".blue(),
                        signature.short()
                    );
                }
                Err(e) => {
                    eprintln!("{} {}", "Error:".red().bold(), e);
                    std::process::exit(e.exit_code());
                }
            }
        }

        Commands::Config { action } => match action {
            ConfigAction::Check => {
                let report = ConfigValidator::new(&project_path).validate();
                for file in &report.files_checked {
                    println!("   Checked: {}", file.display());
                }
                print_warnings(&report);
                for error in &report.errors {
                    println!("{} {}", "Error:".red().bold(), error);
                }
                if report.is_valid() {
                    println!("{} {}", "OK".green().bold(), report.summary());
                } else {
                    println!("{} {}", "FAILED".red().bold(), report.summary());
                }
                std::process::exit(report.exit_code());
            }
        },
    }

    Ok(())
}

fn load_config(project_path: &Path) -> ProjectConfig {
    match ProjectConfig::load(project_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);
            std::process::exit(e.exit_code());
        }
    }
}

fn apply_overrides(
    mut config: ProjectConfig,
    test_command: Option<String>,
    max_cycles: Option<u32>,
    backend_commands: Vec<String>,
) -> ProjectConfig {
    if let Some(command) = test_command {
        config.test.command = command;
    }
    if let Some(cycles) = max_cycles {
        config.limits.max_retry_cycles = cycles;
    }
    for (i, command) in backend_commands.into_iter().enumerate() {
        config
            .backends
            .push(BackendConfig::new(format!("cli-{}", i + 1), command));
    }
    config
}

fn open_store(project_path: &Path) -> LearningStore {
    let config = load_config(project_path);
    LearningStore::open(config.learning_dir(project_path))
}

fn parse_signature(raw: &str) -> ErrorSignature {
    match ErrorSignature::from_str(raw) {
        Ok(signature) => signature,
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);
            std::process::exit(e.exit_code());
        }
    }
}

fn print_warnings(report: &ValidationReport) {
    for warning in &report.warnings {
        eprintln!("{} {}", "Warning:".yellow().bold(), warning);
    }
}

fn report_store_anomalies(store: &LearningStore) {
    for anomaly in store.take_anomalies() {
        eprintln!("{} {}", "Warning:".yellow().bold(), anomaly);
    }
}

fn print_report(report: &SessionReport) {
    let status = match report.status {
        SessionStatus::Success => "SUCCESS".green().bold(),
        SessionStatus::PartialFailure => "PARTIAL FAILURE".red().bold(),
        SessionStatus::Running => "RUNNING".yellow().bold(),
    };
    println!("{} {}", status, report.summary());

    if !report.manual_review.is_empty() {
        println!("\n{}", "Needs manual review:".yellow().bold());
        for escalation in &report.manual_review {
            let what = match (&escalation.test_name, &escalation.source_file) {
                (Some(test), Some(file)) => format!("{} ({})", test, file.display()),
                (Some(test), None) => test.clone(),
                _ => "test output could not be parsed".to_string(),
            };
            let sig = escalation
                .signature
                .as_ref()
                .map(|s| s.short().to_string())
                .unwrap_or_else(|| "-".to_string());
            println!("  {} {}  [{}]", sig, what, escalation.reason);
        }
    }

    for anomaly in &report.anomalies {
        eprintln!("{} {}", "Anomaly:".yellow(), anomaly);
    }
}
