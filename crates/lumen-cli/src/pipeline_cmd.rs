//! `lumen train` and `lumen predict`: run worker stages in the foreground,
//! streaming their output to the terminal.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use serde_json::{Map, Value, json};
use sqlx::PgPool;
use tokio::task::JoinHandle;

use lumen_core::launch::{CollectionArgs, default_tty};
use lumen_core::pipeline::{
    PipelineController, PipelineHandle, PipelineReport, PredictionParams, TrainingParams,
};
use lumen_core::process::census::WorkerCensus;
use lumen_core::sink::{MemorySink, PgResultSink, ResultSink};
use lumen_core::stage::StageConfig;
use lumen_core::{PipelineError, StageError};
use lumen_db::pool::{self, Provision};

use crate::config::LumenConfig;
use crate::display::{self, TerminalDisplay};

/// Lines of worker output shown when a stage fails.
const FAILURE_TAIL_LINES: usize = 20;

/// Execution options shared by `train` and `predict`.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Keep results in memory instead of writing them to the database.
    pub no_persist: bool,
    pub timeout: Option<Duration>,
    pub grace: Duration,
    pub strict_exit: bool,
}

#[derive(Clone)]
pub struct TrainRequest {
    pub form_id: String,
    pub host: String,
    pub user: String,
    pub password: String,
    pub su_password: String,
    pub min_duty: u32,
    pub max_duty: u32,
    pub samples: u32,
    pub tty: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PredictRequest {
    pub form_id: String,
    pub model_id: String,
    pub sample_id: String,
    pub operator_id: String,
}

/// Run collection then training for one form.
pub async fn run_train(config: &LumenConfig, request: TrainRequest, options: &RunOptions) -> Result<()> {
    if request.min_duty > request.max_duty {
        bail!(
            "--min-duty ({}) must not exceed --max-duty ({})",
            request.min_duty,
            request.max_duty
        );
    }

    let mut initial_fields = Map::new();
    initial_fields.insert("host".to_string(), json!(request.host));
    initial_fields.insert("user".to_string(), json!(request.user));
    initial_fields.insert("min-duty".to_string(), json!(request.min_duty));
    initial_fields.insert("max-duty".to_string(), json!(request.max_duty));
    initial_fields.insert("num-samples".to_string(), json!(request.samples));

    let collection = CollectionArgs {
        host: request.host,
        user: request.user,
        password: request.password,
        su_password: request.su_password,
        data_dir: config.data_dir.clone(),
        min_duty: request.min_duty,
        max_duty: request.max_duty,
        samples: request.samples,
        tty: request.tty.unwrap_or_else(|| default_tty().to_string()),
    };

    let session = Session::open(config, options).await?;
    let handle = session.controller.start_training(TrainingParams {
        form_id: request.form_id,
        collection,
        initial_fields,
    })?;
    session.drive(handle).await
}

/// Score one sample against a trained model.
pub async fn run_predict(
    config: &LumenConfig,
    request: PredictRequest,
    options: &RunOptions,
) -> Result<()> {
    let session = Session::open(config, options).await?;
    let handle = session.controller.start_prediction(PredictionParams {
        form_id: request.form_id,
        model_id: request.model_id,
        sample_id: request.sample_id,
        operator_id: request.operator_id,
        data_dir: config.data_dir.clone(),
        initial_fields: Map::<String, Value>::new(),
    })?;
    session.drive(handle).await
}

struct Session {
    controller: PipelineController,
    census: Arc<WorkerCensus>,
    pool: Option<PgPool>,
    grace: Duration,
}

impl Session {
    async fn open(config: &LumenConfig, options: &RunOptions) -> Result<Self> {
        let (sink, pool): (Arc<dyn ResultSink>, Option<PgPool>) = if options.no_persist {
            (Arc::new(MemorySink::new()), None)
        } else {
            let db_pool = pool::open(&config.db_config, Provision::Existing).await?;
            (Arc::new(PgResultSink::new(db_pool.clone())), Some(db_pool))
        };

        let stage_config = StageConfig {
            timeout: options.timeout,
            terminate_grace: options.grace,
            fail_on_nonzero_exit: options.strict_exit,
        };
        let controller =
            PipelineController::new(config.worker.clone(), sink, Arc::new(TerminalDisplay))
                .with_stage_config(stage_config);
        let census = Arc::new(WorkerCensus::from_script_dir(
            &config.worker.working_directory,
        ));

        Ok(Self {
            controller,
            census,
            pool,
            grace: options.grace,
        })
    }

    async fn drive(self, mut handle: PipelineHandle) -> Result<()> {
        let ctrl_c = install_ctrl_c(self.controller.clone(), self.census.clone(), self.grace);

        while let Some(event) = handle.events.recv().await {
            if let Some(line) = display::render_event(&event) {
                println!("{line}");
            }
        }
        let result = handle.wait().await;

        ctrl_c.abort();
        if let Some(db_pool) = self.pool {
            db_pool.close().await;
        }
        finish(result)
    }
}

/// First Ctrl-C stops the workers, a second one force-exits.
fn install_ctrl_c(
    controller: PipelineController,
    census: Arc<WorkerCensus>,
    grace: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interrupted = false;
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            if interrupted {
                eprintln!("\nForce exit.");
                std::process::exit(130);
            }
            interrupted = true;
            eprintln!("\nStopping workers (Ctrl+C again to force)...");
            let report = controller.shutdown(&census, grace).await;
            match report.cancelled_stage {
                Some(stage) => tracing::info!(%stage, "cancelled active stage"),
                None => tracing::info!(
                    orphans = report.orphan_pids.len(),
                    "no active stage; terminated orphaned workers"
                ),
            }
        }
    })
}

fn finish(result: Result<PipelineReport, PipelineError>) -> Result<()> {
    match result {
        Ok(report) => {
            println!(
                "\nRun {} complete for form {}.",
                report.run.run_id, report.run.form_id
            );
            print!("{}", display::render_fields(&report.run.persistable_fields()));
            if let Some(err) = report.storage_error {
                bail!("results were not stored: {err}");
            }
            Ok(())
        }
        Err(PipelineError::Stage(StageError::Cancelled { stage, .. })) => {
            println!("\nRun interrupted during {stage}. Worker processes terminated.");
            std::process::exit(130);
        }
        Err(PipelineError::Stage(err)) => {
            if let Some(transcript) = err.transcript().filter(|t| !t.is_empty()) {
                eprintln!("Last worker output:");
                eprint!("{}", display::transcript_tail(transcript, FAILURE_TAIL_LINES));
            }
            Err(err.into())
        }
        Err(err) => Err(err.into()),
    }
}
