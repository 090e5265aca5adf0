pub mod connectors;
pub mod context;
pub mod db;
pub mod delivery;
pub mod embeddings;
pub mod entity;
pub mod error;
mod migrations;
pub mod memory;
pub mod normalizer;
pub mod pipeline;
pub mod proactive;
pub mod signals;
pub mod state;
pub mod triage;
pub mod types;

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinSet;

use error::PipelineError;
use state::AppState;

/// Run the daemon until ctrl-c or a fatal store error.
///
/// One task per configured source plus the maintenance loop. On shutdown
/// every loop finishes the batch it is in, then exits.
pub async fn run(state: AppState) -> Result<(), PipelineError> {
    let schedule = pipeline::parse_schedule(&state.config.maintenance_cron)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: JoinSet<Result<(), PipelineError>> = JoinSet::new();

    let connectors = state.connectors();
    if connectors.is_empty() {
        log::warn!("No sources configured; only maintenance will run");
    }
    for (source, connector) in connectors {
        tasks.spawn(pipeline::run_source_loop(
            Arc::clone(&state.pipeline),
            connector,
            source,
            shutdown_rx.clone(),
        ));
    }
    tasks.spawn(pipeline::run_maintenance_loop(
        Arc::clone(&state.pipeline),
        schedule,
        shutdown_rx,
    ));
    log::info!("Foresight running with {} tasks", tasks.len());

    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::warn!("Could not listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
        log::info!("Shutdown requested");
    };
    let mut result = supervise(&mut tasks, ctrl_c).await;

    let _ = shutdown_tx.send(true);
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = flatten(joined) {
            if result.is_ok() {
                result = Err(e);
            }
        }
    }
    log::info!("All tasks stopped");
    result
}

/// Wait until `shutdown_signal` resolves or a task fails. Tasks that end
/// cleanly or panic are logged and the rest keep running.
async fn supervise<F>(
    tasks: &mut JoinSet<Result<(), PipelineError>>,
    shutdown_signal: F,
) -> Result<(), PipelineError>
where
    F: std::future::Future<Output = ()>,
{
    tokio::pin!(shutdown_signal);
    loop {
        tokio::select! {
            _ = &mut shutdown_signal => return Ok(()),
            joined = tasks.join_next() => match joined {
                None => {
                    log::warn!("Every task has exited");
                    return Ok(());
                }
                Some(joined) => {
                    flatten(joined)?;
                    log::info!("A task finished; {} still running", tasks.len());
                }
            },
        }
    }
}

fn flatten(
    joined: Result<Result<(), PipelineError>, tokio::task::JoinError>,
) -> Result<(), PipelineError> {
    match joined {
        Ok(inner) => inner,
        Err(e) => {
            log::error!("Task panicked: {}", e);
            Ok(())
        }
    }
}
