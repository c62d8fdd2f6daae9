mod check_cmd;
mod config;
mod display;
mod pipeline_cmd;
mod results_cmd;
mod workers_cmd;

#[cfg(test)]
mod test_util;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use lumen_core::process::census::WorkerCensus;
use lumen_db::config::DbConfig;
use lumen_db::pool::{self, Provision};

use config::{LumenConfig, Overrides};
use pipeline_cmd::{PredictRequest, RunOptions, TrainRequest};

/// Environment variable consulted when `--password` is not given.
const PASSWORD_ENV_VAR: &str = "LUMEN_HOST_PASSWORD";

#[derive(Parser)]
#[command(name = "lumen", about = "Collection, training and prediction worker orchestrator")]
struct Cli {
    /// Database URL (overrides LUMEN_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Worker interpreter (overrides LUMEN_PYTHON env var)
    #[arg(long, global = true)]
    interpreter: Option<PathBuf>,

    /// Directory holding the worker scripts (overrides LUMEN_SCRIPT_DIR)
    #[arg(long, global = true)]
    script_dir: Option<PathBuf>,

    /// Directory for collected samples (overrides LUMEN_DATA_DIR)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a lumen config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = DbConfig::DEFAULT_URL)]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Create the lumen database if needed and migrate it
    DbInit,
    /// Check that the worker runtime has every module it imports
    Check {
        /// Seconds before the check is abandoned
        #[arg(long, default_value_t = 60)]
        timeout: u64,
        /// Seconds to wait after SIGTERM before SIGKILL
        #[arg(long, default_value_t = 5)]
        grace: u64,
    },
    /// Collect samples from a host, then train a model on them
    Train {
        /// Form identifier the results are stored under
        #[arg(long)]
        form_id: String,
        /// Host to collect from
        #[arg(long)]
        host: String,
        /// Login user on the host
        #[arg(long)]
        user: String,
        /// Login password (falls back to LUMEN_HOST_PASSWORD)
        #[arg(long)]
        password: Option<String>,
        /// Superuser password; may be empty
        #[arg(long, default_value = "")]
        su_password: String,
        /// Minimum duty cycle
        #[arg(long, default_value_t = 0)]
        min_duty: u32,
        /// Maximum duty cycle
        #[arg(long, default_value_t = 100)]
        max_duty: u32,
        /// Number of samples to collect
        #[arg(long, default_value_t = 10)]
        samples: u32,
        /// Serial device of the measurement rig (platform default if omitted)
        #[arg(long)]
        tty: Option<String>,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Score a sample against a trained model
    Predict {
        /// Form identifier the results are stored under
        #[arg(long)]
        form_id: String,
        /// Trained model identifier
        model_id: String,
        /// Sample identifier
        sample_id: String,
        /// Operator identifier
        operator_id: String,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Show the stored result for a form
    Show {
        /// Form identifier
        form_id: String,
    },
    /// List stored results
    Results,
    /// List live worker processes
    Workers {
        /// Terminate every listed worker and its descendants
        #[arg(long)]
        kill: bool,
        /// Seconds to wait after SIGTERM before SIGKILL
        #[arg(long, default_value_t = 5)]
        grace: u64,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Keep results in memory instead of writing them to the database
    #[arg(long)]
    no_persist: bool,
    /// Per-stage timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,
    /// Seconds to wait after SIGTERM before SIGKILL
    #[arg(long, default_value_t = 5)]
    grace: u64,
    /// Treat a nonzero worker exit as a failure even when it produced a result
    #[arg(long)]
    strict_exit: bool,
}

impl RunArgs {
    fn options(&self) -> RunOptions {
        RunOptions {
            no_persist: self.no_persist,
            timeout: self.timeout.map(Duration::from_secs),
            grace: Duration::from_secs(self.grace),
            strict_exit: self.strict_exit,
        }
    }
}

/// Execute the `lumen init` command: write config file.
fn cmd_init(db_url: &str, overrides: &Overrides, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile {
        database: config::DatabaseSection {
            url: db_url.to_string(),
        },
        worker: config::WorkerSection {
            interpreter: overrides.interpreter.clone(),
            script_dir: overrides.script_dir.clone(),
            data_dir: overrides.data_dir.clone(),
            ..Default::default()
        },
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    if let Some(dir) = &cfg.worker.script_dir {
        println!("  worker.script_dir = {}", dir.display());
    }
    println!();
    println!("Next: run `lumen db-init` to create and migrate the database.");

    Ok(())
}

/// Execute the `lumen db-init` command: provision and migrate the store.
async fn cmd_db_init(resolved: &LumenConfig) -> anyhow::Result<()> {
    let db_pool = pool::open(&resolved.db_config, Provision::CreateMissing).await?;
    let status = pool::status(&db_pool).await;
    db_pool.close().await;
    let status = status?;

    match status.schema_version {
        Some(version) => println!("Result store ready (schema {version})."),
        None => println!("Result store ready (no migrations applied)."),
    }
    println!("  stored results: {}", status.stored_results);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let overrides = Overrides {
        database_url: cli.database_url,
        interpreter: cli.interpreter,
        script_dir: cli.script_dir,
        data_dir: cli.data_dir,
    };

    match cli.command {
        Commands::Init { db_url, force } => {
            cmd_init(&db_url, &overrides, force)?;
        }
        Commands::DbInit => {
            let resolved = LumenConfig::resolve(&overrides)?;
            cmd_db_init(&resolved).await?;
        }
        Commands::Check { timeout, grace } => {
            let resolved = LumenConfig::resolve(&overrides)?;
            check_cmd::run_check(
                &resolved,
                Duration::from_secs(timeout),
                Duration::from_secs(grace),
            )
            .await?;
        }
        Commands::Train {
            form_id,
            host,
            user,
            password,
            su_password,
            min_duty,
            max_duty,
            samples,
            tty,
            run,
        } => {
            let resolved = LumenConfig::resolve(&overrides)?;
            let password = password
                .or_else(|| std::env::var(PASSWORD_ENV_VAR).ok())
                .unwrap_or_default();
            let request = TrainRequest {
                form_id,
                host,
                user,
                password,
                su_password,
                min_duty,
                max_duty,
                samples,
                tty,
            };
            pipeline_cmd::run_train(&resolved, request, &run.options()).await?;
        }
        Commands::Predict {
            form_id,
            model_id,
            sample_id,
            operator_id,
            run,
        } => {
            let resolved = LumenConfig::resolve(&overrides)?;
            let request = PredictRequest {
                form_id,
                model_id,
                sample_id,
                operator_id,
            };
            pipeline_cmd::run_predict(&resolved, request, &run.options()).await?;
        }
        Commands::Show { form_id } => {
            let resolved = LumenConfig::resolve(&overrides)?;
            let db_pool = pool::open(&resolved.db_config, Provision::Existing).await?;
            let result = results_cmd::run_show(&db_pool, &form_id).await;
            db_pool.close().await;
            result?;
        }
        Commands::Results => {
            let resolved = LumenConfig::resolve(&overrides)?;
            let db_pool = pool::open(&resolved.db_config, Provision::Existing).await?;
            let result = results_cmd::run_results(&db_pool).await;
            db_pool.close().await;
            result?;
        }
        Commands::Workers { kill, grace } => {
            let resolved = LumenConfig::resolve(&overrides)?;
            let census = WorkerCensus::from_script_dir(&resolved.worker.working_directory);
            workers_cmd::run_workers(&census, kill, Duration::from_secs(grace)).await?;
        }
    }

    Ok(())
}
