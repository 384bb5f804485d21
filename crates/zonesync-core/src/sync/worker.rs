//! Background sync worker
//!
//! A single tokio task owns the cycle. It checks the trigger gate on a short
//! cadence and reacts to commands from the repository and the CLI. Status
//! is published through a `watch` channel.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::client::RemoteZones;
use super::engine::{CycleOutcome, CycleReport, SkipReason, SyncEngine};
use super::error::SyncError;

/// How often the worker re-checks the trigger gate
pub const CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Commands accepted by the worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncCommand {
    /// Run a cycle now, ignoring spacing and interval
    TriggerNow,
    /// A zone was saved locally
    LocalChange { id: i64 },
    /// A zone was deleted locally and should be deleted on the server
    DeleteRemote { uuid: String, group: Option<String> },
    Shutdown,
}

/// Worker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Syncing,
    Disabled,
    Unreachable,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatus {
    pub state: SyncState,
    /// Local millis of the last completed cycle
    pub last_success: Option<i64>,
    pub last_report: Option<CycleReport>,
    pub last_error: Option<String>,
    /// Local changes seen since the last completed cycle
    pub pending_changes: usize,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            state: SyncState::Idle,
            last_success: None,
            last_report: None,
            last_error: None,
            pending_changes: 0,
        }
    }
}

/// Sender half handed to the repository
#[derive(Debug, Clone)]
pub struct SyncNotifier {
    commands: mpsc::UnboundedSender<SyncCommand>,
}

impl SyncNotifier {
    pub fn new(commands: mpsc::UnboundedSender<SyncCommand>) -> Self {
        Self { commands }
    }

    pub fn local_change(&self, id: i64) {
        self.send(SyncCommand::LocalChange { id });
    }

    pub fn delete_remote(&self, uuid: &str, group: Option<String>) {
        self.send(SyncCommand::DeleteRemote {
            uuid: uuid.to_string(),
            group,
        });
    }

    fn send(&self, command: SyncCommand) {
        if self.commands.send(command).is_err() {
            debug!("Sync worker is gone; dropping command");
        }
    }
}

/// Handle to a running worker
#[derive(Debug)]
pub struct SyncHandle {
    commands: mpsc::UnboundedSender<SyncCommand>,
    status: watch::Receiver<SyncStatus>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    pub fn notifier(&self) -> SyncNotifier {
        SyncNotifier::new(self.commands.clone())
    }

    pub fn trigger(&self) {
        let _ = self.commands.send(SyncCommand::TriggerNow);
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    /// Subscribe to status changes
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    /// Stop the worker after the current cycle
    pub async fn shutdown(self) {
        let _ = self.commands.send(SyncCommand::Shutdown);
        if let Err(e) = self.task.await {
            warn!("Sync worker ended abnormally: {}", e);
        }
    }
}

/// Start the worker on the current tokio runtime
pub fn spawn_sync_worker<R>(engine: Arc<SyncEngine<R>>, check_interval: Duration) -> SyncHandle
where
    R: RemoteZones + 'static,
{
    let (commands, rx) = mpsc::unbounded_channel();
    let (status_tx, status) = watch::channel(SyncStatus::default());
    let task = tokio::spawn(run_worker(engine, rx, status_tx, check_interval));
    SyncHandle {
        commands,
        status,
        task,
    }
}

async fn run_worker<R: RemoteZones>(
    engine: Arc<SyncEngine<R>>,
    mut commands: mpsc::UnboundedReceiver<SyncCommand>,
    status: watch::Sender<SyncStatus>,
    check_interval: Duration,
) {
    let mut ticker = tokio::time::interval(check_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    info!("Sync worker started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let result = engine.maybe_sync().await;
                publish(&status, result, engine.last_success());
            }
            command = commands.recv() => match command {
                None | Some(SyncCommand::Shutdown) => break,
                Some(SyncCommand::TriggerNow) => {
                    status.send_modify(|s| s.state = SyncState::Syncing);
                    let result = engine.sync_now().await;
                    publish(&status, result, engine.last_success());
                }
                Some(SyncCommand::LocalChange { id }) => {
                    debug!("Local change to zone {}", id);
                    status.send_modify(|s| s.pending_changes += 1);
                }
                Some(SyncCommand::DeleteRemote { uuid, group }) => {
                    if let Err(e) = engine.delete_remote(&uuid, group).await {
                        warn!("Remote delete of {} failed: {}", uuid, e);
                        status.send_modify(|s| s.last_error = Some(e.to_string()));
                    }
                }
            }
        }
    }
    info!("Sync worker stopped");
}

fn publish(
    status: &watch::Sender<SyncStatus>,
    result: Result<CycleOutcome, SyncError>,
    last_success: Option<i64>,
) {
    status.send_modify(|s| match result {
        Ok(CycleOutcome::Completed(report)) => {
            s.state = SyncState::Idle;
            s.last_success = last_success;
            s.last_report = Some(report);
            s.last_error = None;
            s.pending_changes = 0;
        }
        Ok(CycleOutcome::Skipped(SkipReason::Disabled)) | Err(SyncError::Disabled) => {
            s.state = SyncState::Disabled;
        }
        Ok(CycleOutcome::Skipped(SkipReason::Unhealthy)) => {
            s.state = SyncState::Unreachable;
        }
        Ok(CycleOutcome::Skipped(_)) => {
            if s.state == SyncState::Syncing {
                s.state = SyncState::Idle;
            }
        }
        Err(e) => {
            s.state = SyncState::Error;
            s.last_error = Some(e.to_string());
        }
    });
}
