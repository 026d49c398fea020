//! Worker supervision: start/stop driven by the persisted control row, heartbeats,
//! and cooperative cancellation of a worker's loops.
//!
//! ```text
//! supervise(worker)
//!     ├─► control watcher: worker_control.should_run ─► watch channel
//!     └─► session (while should_run)
//!             ├─► worker.initialize()        (failure: backoff, retry)
//!             ├─► worker.spawn_loops(..)     (functional loops)
//!             └─► heartbeat loop
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use relay_core::WorkerKind;
use relay_storage::Store;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::RuntimeConfig;

#[async_trait]
pub trait Worker: Send + Sync + 'static {
    fn kind(&self) -> WorkerKind;

    /// Prepare adapters. Errors here mark the worker not-running and are retried after a backoff.
    async fn initialize(&self) -> anyhow::Result<()>;

    /// Spawn the worker's functional loops. Each loop must return once `cancel` fires.
    fn spawn_loops(self: Arc<Self>, tasks: &mut JoinSet<()>, cancel: CancellationToken);
}

/// Run a ticking loop until cancelled. The first tick fires immediately.
pub(crate) async fn every<F, Fut>(period: Duration, cancel: CancellationToken, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick() => {}
                }
            }
        }
    }
}

/// Mirror the persisted should-run flag into a watch channel.
async fn watch_control(
    store: Store,
    kind: WorkerKind,
    period: Duration,
    tx: watch::Sender<bool>,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                match store.worker_control(kind).await {
                    Ok(control) => {
                        tx.send_if_modified(|current| {
                            let changed = *current != control.should_run;
                            *current = control.should_run;
                            changed
                        });
                    }
                    Err(err) => warn!(worker = %kind, error = %err, "reading worker control failed"),
                }
            }
        }
    }
}

/// Resolves once the flag equals `wanted`; false if the watcher is gone.
async fn wait_for_flag(rx: &mut watch::Receiver<bool>, wanted: bool) -> bool {
    rx.wait_for(|run| *run == wanted).await.is_ok()
}

async fn heartbeat(store: Store, kind: WorkerKind, period: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                if let Err(err) = store.heartbeat(kind).await {
                    warn!(worker = %kind, error = %err, "heartbeat failed");
                }
            }
        }
    }
}

async fn set_running(store: &Store, kind: WorkerKind, running: bool) {
    if let Err(err) = store.set_running(kind, running).await {
        error!(worker = %kind, running, error = %err, "recording worker state failed");
    }
}

/// Sleep for `period` unless shutdown or a stop request arrives first.
/// Returns false when the caller should stop waiting to run.
async fn backoff(
    period: Duration,
    rx: &mut watch::Receiver<bool>,
    shutdown: &CancellationToken,
) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = wait_for_flag(rx, false) => true,
        _ = tokio::time::sleep(period) => true,
    }
}

/// Supervise one worker until `shutdown` fires.
///
/// While the control row says should-run, the worker's loops run inside a
/// session; when the flag flips false every loop is cancelled and awaited
/// before is-running is cleared.
pub async fn supervise(
    worker: Arc<dyn Worker>,
    store: Store,
    config: RuntimeConfig,
    shutdown: CancellationToken,
) {
    let kind = worker.kind();
    let (tx, mut rx) = watch::channel(false);
    let watcher_cancel = shutdown.child_token();
    let watcher = tokio::spawn(watch_control(
        store.clone(),
        kind,
        config.control_poll,
        tx,
        watcher_cancel.clone(),
    ));

    // A previous process may have died with the flag set.
    set_running(&store, kind, false).await;
    info!(worker = %kind, "supervisor started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            alive = wait_for_flag(&mut rx, true) => {
                if !alive {
                    break;
                }
            }
        }

        let session_id = Uuid::new_v4();
        let span = info_span!("worker_session", worker = %kind, %session_id);

        let init = worker.initialize().instrument(span.clone()).await;
        if let Err(err) = init {
            error!(worker = %kind, %session_id, error = %err, "worker initialization failed; backing off");
            set_running(&store, kind, false).await;
            if !backoff(config.init_backoff, &mut rx, &shutdown).await {
                break;
            }
            continue;
        }

        set_running(&store, kind, true).await;
        info!(worker = %kind, %session_id, "worker running");

        let cancel = shutdown.child_token();
        let mut tasks = JoinSet::new();
        worker.clone().spawn_loops(&mut tasks, cancel.clone());
        tasks.spawn(
            heartbeat(store.clone(), kind, config.heartbeat, cancel.clone()).instrument(span.clone()),
        );

        let mut crashed = false;
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = wait_for_flag(&mut rx, false) => {
                info!(worker = %kind, %session_id, "stop requested");
            }
            exited = tasks.join_next() => {
                crashed = true;
                match exited {
                    Some(Err(err)) if err.is_panic() => {
                        error!(worker = %kind, %session_id, "worker loop panicked");
                    }
                    _ => warn!(worker = %kind, %session_id, "worker loop exited unexpectedly"),
                }
            }
        }

        cancel.cancel();
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                if err.is_panic() {
                    error!(worker = %kind, %session_id, "worker loop panicked during shutdown");
                }
            }
        }
        set_running(&store, kind, false).await;
        info!(worker = %kind, %session_id, "worker stopped");

        if shutdown.is_cancelled() {
            break;
        }
        if crashed && !backoff(config.init_backoff, &mut rx, &shutdown).await {
            break;
        }
    }

    watcher_cancel.cancel();
    let _ = watcher.await;
    debug!(worker = %kind, "supervisor exited");
}

/// Supervise a set of workers until `shutdown` fires.
pub async fn run_workers(
    workers: Vec<Arc<dyn Worker>>,
    store: Store,
    config: RuntimeConfig,
    shutdown: CancellationToken,
) {
    let mut set = JoinSet::new();
    for worker in workers {
        set.spawn(supervise(worker, store.clone(), config, shutdown.clone()));
    }
    while let Some(joined) = set.join_next().await {
        if let Err(err) = joined {
            error!(error = %err, "supervisor task failed");
        }
    }
}
