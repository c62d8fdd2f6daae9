//! `lumen check`: run the dependency check worker and report what it says.

use std::time::Duration;

use anyhow::{Result, bail};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use lumen_core::classify::HandoffPolicy;
use lumen_core::launch::{StageKind, StageParams};
use lumen_core::pipeline::PipelineEvent;
use lumen_core::stage::{StageConfig, StageRunner, StreamKind};

use crate::config::LumenConfig;
use crate::display;

pub async fn run_check(config: &LumenConfig, timeout: Duration, grace: Duration) -> Result<()> {
    let stage_config = StageConfig {
        timeout: Some(timeout),
        terminate_grace: grace,
        fail_on_nonzero_exit: false,
    };
    let runner = StageRunner::new(&config.worker, &StageParams::DependencyCheck, stage_config)
        .with_handoff_policy(HandoffPolicy::Disabled);

    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(runner.run(Some(tx), cancel.clone()));

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                let event = PipelineEvent::Stage { stage: StageKind::DependencyCheck, event };
                if let Some(line) = display::render_event(&event) {
                    println!("{line}");
                }
            }
            _ = tokio::signal::ctrl_c(), if !cancel.is_cancelled() => {
                eprintln!("\nStopping dependency check...");
                cancel.cancel();
            }
        }
    }

    let outcome = task.await??;
    let problems: Vec<&str> = outcome.transcript.lines(StreamKind::Stderr).collect();
    if !problems.is_empty() {
        eprintln!("Worker dependency problems:");
        for line in &problems {
            eprintln!("  {line}");
        }
        bail!("dependency check reported {} problem line(s)", problems.len());
    }
    if !outcome.exit.success() {
        bail!("dependency check failed ({})", outcome.exit);
    }
    println!("All worker dependencies are available.");
    Ok(())
}
