use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio::time::timeout;

use super::messages::{validate_flow, ControlMessage, FlowDefinition, LogLevel, ProgressMessage};
use super::{FlowError, Result};
use crate::config::FlowSettings;

/// Upper bound on waiting for buffered worker output after it exited
const READER_DRAIN: Duration = Duration::from_secs(1);

/// How a `stop` request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopOutcome {
    /// Worker exited on its own within the grace period
    Exited,
    /// Grace period elapsed and the worker was killed
    Killed,
    NotRunning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowLogEntry {
    pub timestamp: DateTime<Utc>,
    pub node_id: Option<String>,
    pub message: String,
    pub level: LogLevel,
}

/// Snapshot of the current (or last) run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowExecutionState {
    pub flow_id: Option<String>,
    pub running: bool,
    pub paused: bool,
    pub current_node_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub elapsed_ms: u64,
    pub logs: Vec<FlowLogEntry>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FlowEvent {
    Started { flow_id: String },
    Paused,
    Resumed,
    NodeStarted { node_id: String },
    NodeCompleted { node_id: String, result: Option<Value> },
    NodeFailed { node_id: String, error: String },
    Completed { result: Option<Value> },
    Failed { error: String },
    Log(FlowLogEntry),
    Stopped(StopOutcome),
}

#[derive(Debug, Default)]
struct RunTracker {
    state: FlowExecutionState,
    /// Set once the run ended through stop, flow-complete or flow-error
    settled: bool,
}

impl RunTracker {
    fn finish(&mut self) {
        self.state.running = false;
        self.state.paused = false;
        if let Some(started) = self.state.started_at {
            self.state.elapsed_ms = (Utc::now() - started).num_milliseconds().max(0) as u64;
        }
    }

    fn log(&mut self, node_id: Option<String>, message: String, level: LogLevel) -> FlowLogEntry {
        let entry = FlowLogEntry { timestamp: Utc::now(), node_id, message, level };
        self.state.logs.push(entry.clone());
        entry
    }
}

struct Worker {
    stdin: ChildStdin,
    exited_rx: watch::Receiver<bool>,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl Worker {
    fn has_exited(&self) -> bool {
        *self.exited_rx.borrow()
    }

    async fn send(&mut self, message: &ControlMessage) -> Result<()> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');
        self.stdin.write_all(&line).await?;
        self.stdin.flush().await?;
        Ok(())
    }
}

/// Runs flows in a separate worker process and keeps it on a leash.
///
/// The worker speaks newline-delimited JSON on stdin/stdout. Progress is
/// tracked in a [`FlowExecutionState`] and reported as [`FlowEvent`]s to a
/// single consumer.
pub struct FlowSupervisor {
    settings: FlowSettings,
    events_tx: mpsc::UnboundedSender<FlowEvent>,
    tracker: Arc<RwLock<RunTracker>>,
    worker: Mutex<Option<Worker>>,
}

impl FlowSupervisor {
    pub fn new(settings: FlowSettings) -> (Self, mpsc::UnboundedReceiver<FlowEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let supervisor = Self {
            settings,
            events_tx,
            tracker: Arc::new(RwLock::new(RunTracker::default())),
            worker: Mutex::new(None),
        };
        (supervisor, events_rx)
    }

    pub async fn execution_state(&self) -> FlowExecutionState {
        let tracker = self.tracker.read().await;
        let mut state = tracker.state.clone();
        if state.running {
            if let Some(started) = state.started_at {
                state.elapsed_ms = (Utc::now() - started).num_milliseconds().max(0) as u64;
            }
        }
        state
    }

    pub async fn is_running(&self) -> bool {
        self.tracker.read().await.state.running
    }

    /// Validate `flow`, spawn a worker and hand it the flow.
    pub async fn start(&self, flow: FlowDefinition) -> Result<()> {
        validate_flow(&flow)?;

        let mut slot = self.worker.lock().await;
        if slot.as_ref().is_some_and(|w| !w.has_exited()) {
            return Err(FlowError::AlreadyRunning);
        }

        let program = self.settings.worker_program.display().to_string();
        let mut child = Command::new(&self.settings.worker_program)
            .args(&self.settings.worker_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| FlowError::Spawn { program: program.clone(), source })?;

        let stdin = child.stdin.take().ok_or_else(|| FlowError::WorkerUnavailable("stdin not captured".into()))?;
        let stdout = child.stdout.take().ok_or_else(|| FlowError::WorkerUnavailable("stdout not captured".into()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    log::debug!("flow worker stderr: {}", line);
                }
            });
        }

        {
            let mut tracker = self.tracker.write().await;
            *tracker = RunTracker {
                state: FlowExecutionState {
                    flow_id: Some(flow.id.clone()),
                    running: true,
                    started_at: Some(Utc::now()),
                    ..FlowExecutionState::default()
                },
                settled: false,
            };
        }

        let (exited_tx, exited_rx) = watch::channel(false);
        let (kill_tx, kill_rx) = oneshot::channel();
        let reader = tokio::spawn(read_progress(stdout, self.tracker.clone(), self.events_tx.clone()));
        tokio::spawn(monitor_worker(child, kill_rx, exited_tx, reader, self.tracker.clone(), self.events_tx.clone()));

        let mut worker = Worker { stdin, exited_rx, kill_tx: Some(kill_tx) };
        let flow_id = flow.id.clone();
        let _ = self.events_tx.send(FlowEvent::Started { flow_id: flow_id.clone() });
        if let Err(e) = worker.send(&ControlMessage::Start(flow)).await {
            log::error!("Could not hand flow {} to worker {}: {}", flow_id, program, e);
            if let Some(kill) = worker.kill_tx.take() {
                let _ = kill.send(());
            }
            let mut tracker = self.tracker.write().await;
            tracker.settled = true;
            tracker.finish();
            let _ = self.events_tx.send(FlowEvent::Failed { error: e.to_string() });
            return Err(e);
        }

        log::info!("Flow {} started in worker {}", flow_id, program);
        *slot = Some(worker);
        Ok(())
    }

    /// No-op unless a run is active and not already paused.
    pub async fn pause(&self) -> Result<()> {
        self.toggle_pause(true).await
    }

    /// No-op unless a run is paused.
    pub async fn resume(&self) -> Result<()> {
        self.toggle_pause(false).await
    }

    async fn toggle_pause(&self, pause: bool) -> Result<()> {
        {
            let tracker = self.tracker.read().await;
            if !tracker.state.running || tracker.state.paused == pause {
                return Ok(());
            }
        }

        let mut slot = self.worker.lock().await;
        let Some(worker) = slot.as_mut() else { return Ok(()) };
        let (message, event) = if pause {
            (ControlMessage::Pause, FlowEvent::Paused)
        } else {
            (ControlMessage::Resume, FlowEvent::Resumed)
        };
        worker.send(&message).await?;
        self.tracker.write().await.state.paused = pause;
        let _ = self.events_tx.send(event);
        Ok(())
    }

    /// Ask the worker to stop and kill it if it is still alive after the grace
    /// period.
    pub async fn stop(&self) -> Result<StopOutcome> {
        let mut slot = self.worker.lock().await;
        let Some(mut worker) = slot.take() else { return Ok(StopOutcome::NotRunning) };
        if worker.has_exited() {
            return Ok(StopOutcome::NotRunning);
        }

        self.tracker.write().await.settled = true;
        if let Err(e) = worker.send(&ControlMessage::Stop).await {
            log::debug!("Stop message not delivered: {}", e);
        }

        let grace = self.settings.stop_grace();
        let mut exited_rx = worker.exited_rx.clone();
        let exited_in_time = timeout(grace, exited_rx.wait_for(|exited| *exited)).await.is_ok();
        let outcome = if exited_in_time {
            StopOutcome::Exited
        } else {
            log::warn!("Flow worker ignored stop for {:?}, killing it", grace);
            if let Some(kill) = worker.kill_tx.take() {
                let _ = kill.send(());
            }
            let _ = exited_rx.wait_for(|exited| *exited).await;
            StopOutcome::Killed
        };

        self.tracker.write().await.finish();
        log::info!("Flow stopped ({:?})", outcome);
        let _ = self.events_tx.send(FlowEvent::Stopped(outcome));
        Ok(outcome)
    }
}

async fn read_progress(
    stdout: ChildStdout,
    tracker: Arc<RwLock<RunTracker>>,
    events_tx: mpsc::UnboundedSender<FlowEvent>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                log::warn!("Reading flow worker output failed: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let message = match serde_json::from_str::<ProgressMessage>(&line) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Unrecognised flow worker message '{}': {}", line, e);
                continue;
            }
        };

        let mut tracker = tracker.write().await;
        let event = match message {
            ProgressMessage::NodeStart(progress) => {
                tracker.state.current_node_id = Some(progress.node_id.clone());
                FlowEvent::NodeStarted { node_id: progress.node_id }
            }
            ProgressMessage::NodeComplete(progress) => {
                tracker.log(Some(progress.node_id.clone()), "Node completed".into(), LogLevel::Info);
                FlowEvent::NodeCompleted { node_id: progress.node_id, result: progress.result }
            }
            ProgressMessage::NodeError(failure) => {
                tracker.log(
                    Some(failure.node_id.clone()),
                    format!("Node failed: {}", failure.error),
                    LogLevel::Error,
                );
                FlowEvent::NodeFailed { node_id: failure.node_id, error: failure.error }
            }
            ProgressMessage::FlowComplete(outcome) => {
                tracker.settled = true;
                tracker.finish();
                log::info!("Flow completed");
                FlowEvent::Completed { result: outcome.result }
            }
            ProgressMessage::FlowError(failure) => {
                tracker.settled = true;
                tracker.finish();
                log::error!("Flow failed: {}", failure.error);
                FlowEvent::Failed { error: failure.error }
            }
            ProgressMessage::Log(entry) => FlowEvent::Log(tracker.log(entry.node_id, entry.message, entry.level)),
        };
        let _ = events_tx.send(event);
    }
}

async fn monitor_worker(
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    exited_tx: watch::Sender<bool>,
    reader: tokio::task::JoinHandle<()>,
    tracker: Arc<RwLock<RunTracker>>,
    events_tx: mpsc::UnboundedSender<FlowEvent>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        // a dropped sender (supervisor gone) also kills the worker
        _ = kill_rx => {
            let _ = child.start_kill();
            child.wait().await
        }
    };
    // progress written before exit must be processed before the exit is judged
    if timeout(READER_DRAIN, reader).await.is_err() {
        log::debug!("Flow worker output still open after exit");
    }

    settle_exit(&tracker, &events_tx, status).await;
    exited_tx.send_replace(true);
}

/// Close out a run whose worker is gone. Runs already settled by stop or a
/// final progress message are left alone; otherwise an abnormal exit or a lost
/// child fails the run.
async fn settle_exit(
    tracker: &RwLock<RunTracker>,
    events_tx: &mpsc::UnboundedSender<FlowEvent>,
    status: std::io::Result<ExitStatus>,
) {
    let failure = match status {
        Ok(status) if status.success() => {
            log::debug!("Flow worker exited with {}", status);
            None
        }
        Ok(status) => Some(format!("Flow worker exited abnormally: {}", status)),
        Err(e) => Some(format!("Waiting for flow worker failed: {}", e)),
    };

    let mut tracker = tracker.write().await;
    if tracker.settled {
        return;
    }
    tracker.settled = true;
    tracker.finish();
    if let Some(error) = failure {
        log::error!("{}", error);
        let _ = events_tx.send(FlowEvent::Failed { error });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running_tracker() -> RwLock<RunTracker> {
        let state = FlowExecutionState {
            flow_id: Some("flow-1".into()),
            running: true,
            started_at: Some(Utc::now()),
            ..FlowExecutionState::default()
        };
        RwLock::new(RunTracker { state, settled: false })
    }

    #[tokio::test]
    async fn lost_child_still_ends_the_run() {
        let tracker = running_tracker();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        settle_exit(&tracker, &events_tx, Err(std::io::Error::other("no child process"))).await;

        let tracker = tracker.read().await;
        assert!(tracker.settled);
        assert!(!tracker.state.running);
        match events_rx.try_recv() {
            Ok(FlowEvent::Failed { error }) => assert!(error.contains("no child process"), "{}", error),
            other => panic!("Expected a failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn settled_run_is_not_reported_again() {
        let tracker = running_tracker();
        tracker.write().await.settled = true;
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        settle_exit(&tracker, &events_tx, Err(std::io::Error::other("no child process"))).await;

        assert!(events_rx.try_recv().is_err());
    }
}
