//! intake CLI: inspect surveys and administer the abuse guard.
//!
//! The admin commands open the store directly and need it to themselves.
//! While `intaked` is running, use its `/admin` routes instead.

use std::path::PathBuf;

use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};

use intake_gateway::config::GatewayConfig;
use intake_gateway::gateway::SubmissionGateway;
use intake_gateway::guard::AbuseMonitor;
use intake_gateway::paths::IntakePaths;
use intake_gateway::resolver::applicable_questions;
use intake_gateway::risk::RiskScanner;
use intake_gateway::sanitize::sanitize_form;
use intake_gateway::schema::Schema;
use intake_gateway::store;
use intake_gateway::survey::{RawForm, Survey};

#[derive(Parser)]
#[command(name = "intake", version, about = "Evidence-intake submission gateway")]
struct Cli {
    /// Data directory for the durable store.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Deployment config file (defaults to the XDG config directory).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the config and data directories and a default intake.toml.
    Init,

    /// Print the compiled validation schema of a survey as JSON.
    Schema {
        /// Survey definition (defaults to the configured survey).
        #[arg(long)]
        survey: Option<PathBuf>,
    },

    /// Sanitize and validate a JSON answer file without storing it.
    Check {
        /// JSON object of answers, as a client would post it.
        #[arg(long)]
        answers: PathBuf,

        /// Survey definition (defaults to the configured survey).
        #[arg(long)]
        survey: Option<PathBuf>,

        /// Validate only this zero-based section.
        #[arg(long)]
        step: Option<usize>,
    },

    /// List recent rate-limit violations.
    Violations {
        /// Only violations from the last N hours.
        #[arg(long)]
        since_hours: Option<i64>,

        /// Maximum number of violations to list.
        #[arg(long, default_value = "50")]
        limit: usize,

        /// Print an aggregate summary instead of individual records.
        #[arg(long)]
        summary: bool,
    },

    /// List active blocks.
    Blocks,

    /// Lift the block on a client.
    Unblock {
        /// Client identifier (IP address).
        identifier: String,
        /// User agent the block was recorded with.
        user_agent: String,
    },

    /// Drop rate-limit attempts older than the window and expired blocks.
    Purge {
        /// Window length in minutes.
        #[arg(long, default_value = "4320")]
        window_minutes: i64,
    },
}

struct Context {
    config: GatewayConfig,
    paths: IntakePaths,
}

impl Context {
    fn load(cli: &Cli) -> Result<Self> {
        let resolved = match &cli.data_dir {
            Some(dir) => IntakePaths::with_data_dir(dir.clone()),
            None => IntakePaths::resolve()?,
        };
        let config_file = cli.config.clone().unwrap_or_else(|| resolved.config_file());
        let mut config = GatewayConfig::load_or_default(&config_file)?.with_env()?;
        if let Some(dir) = &cli.data_dir {
            config.data_dir = Some(dir.clone());
        }
        let paths = config.paths(resolved);
        Ok(Self { config, paths })
    }

    fn survey(&self, explicit: Option<PathBuf>) -> Result<Survey> {
        let path = explicit.unwrap_or_else(|| self.config.survey_file(&self.paths));
        Ok(Survey::load(&path)?)
    }

    fn monitor(&self) -> Result<AbuseMonitor> {
        Ok(AbuseMonitor::new(self.config.open_store(&self.paths)?))
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).into_diagnostic()?);
    Ok(())
}

fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(3)
                .build(),
        )
    }))
    .ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let ctx = Context::load(&cli)?;

    match cli.command {
        Commands::Init => {
            ctx.paths.ensure_dirs()?;
            let config_file = cli.config.unwrap_or_else(|| ctx.paths.config_file());
            if config_file.exists() {
                println!("Config already present at {}", config_file.display());
            } else {
                let body = toml::to_string_pretty(&GatewayConfig::default()).into_diagnostic()?;
                std::fs::write(&config_file, body).into_diagnostic()?;
                println!("Wrote default config to {}", config_file.display());
            }
            println!("Data directory: {}", ctx.paths.data_dir.display());
            println!(
                "Survey definition expected at {}",
                ctx.config.survey_file(&ctx.paths).display()
            );
        }

        Commands::Schema { survey } => {
            let survey = ctx.survey(survey)?;
            print_json(&Schema::compile(&survey))?;
        }

        Commands::Check {
            answers,
            survey,
            step,
        } => {
            let survey = ctx.survey(survey)?;
            let content = std::fs::read_to_string(&answers).into_diagnostic()?;
            let body: serde_json::Value = serde_json::from_str(&content).into_diagnostic()?;
            let form = RawForm::from_json(&body)
                .ok_or_else(|| miette::miette!("answer file must contain a JSON object"))?;

            match step {
                Some(index) => {
                    let gateway = SubmissionGateway::new(survey, store::memory_only());
                    print_json(&gateway.validate_step(&form, index)?)?;
                }
                None => {
                    let schema = Schema::compile(&survey);
                    let sanitized = sanitize_form(&form, &survey);
                    let applicable = applicable_questions(&survey, &sanitized);
                    let errors = schema.validate(&sanitized, &applicable).err().unwrap_or_default();
                    let warnings = RiskScanner::from_settings(survey.risk()).scan(&sanitized, &applicable);
                    print_json(&serde_json::json!({
                        "valid": errors.is_empty(),
                        "answers": sanitized,
                        "applicable": applicable.ids().collect::<Vec<_>>(),
                        "field_errors": errors,
                        "warnings": warnings,
                    }))?;
                }
            }
        }

        Commands::Violations {
            since_hours,
            limit,
            summary,
        } => {
            let monitor = ctx.monitor()?;
            let since = since_hours.map(|h| Utc::now() - Duration::hours(h));
            if summary {
                print_json(&monitor.summary(since, limit)?)?;
            } else {
                print_json(&monitor.recent_violations(since, limit)?)?;
            }
        }

        Commands::Blocks => {
            let blocks = ctx.monitor()?.active_blocks(Utc::now())?;
            if blocks.is_empty() {
                println!("No active blocks.");
            } else {
                print_json(&blocks)?;
            }
        }

        Commands::Unblock {
            identifier,
            user_agent,
        } => {
            if ctx.monitor()?.unblock(&identifier, &user_agent)? {
                println!("Block lifted for {identifier}.");
            } else {
                println!("No block found for {identifier} with that user agent.");
            }
        }

        Commands::Purge { window_minutes } => {
            let report = ctx
                .monitor()?
                .purge_expired(Utc::now(), Duration::minutes(window_minutes))?;
            println!(
                "Purged {} expired attempts and {} expired blocks.",
                report.attempts, report.blocks
            );
        }
    }

    Ok(())
}
