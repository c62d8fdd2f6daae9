//! `lumen workers`: list (and optionally kill) live worker processes.

use std::time::Duration;

use anyhow::Result;

use lumen_core::process::census::WorkerCensus;

pub async fn run_workers(census: &WorkerCensus, kill: bool, grace: Duration) -> Result<()> {
    let pids = census.list_worker_pids();
    if pids.is_empty() {
        println!("No worker processes running.");
        return Ok(());
    }

    println!("Worker processes:");
    for &pid in &pids {
        let descendants = census.descendants_of(pid);
        if descendants.is_empty() {
            println!("  {pid}");
        } else {
            println!("  {pid} (+{} descendants)", descendants.len());
        }
    }

    if !kill {
        return Ok(());
    }

    let targets: Vec<_> = pids.iter().map(|&pid| census.cancel_target(pid)).collect();
    for target in &targets {
        target.terminate(grace).await;
    }
    let survivors = targets.iter().filter(|t| t.any_alive()).count();
    if survivors == 0 {
        println!("Terminated {} worker(s).", targets.len());
    } else {
        tracing::warn!(survivors, "some workers survived termination");
        anyhow::bail!("{survivors} worker(s) could not be terminated");
    }
    Ok(())
}
