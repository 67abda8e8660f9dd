//! Pipeline worker - owns the running pipeline on a dedicated thread
//!
//! The pipeline handle is created, queried and torn down on the worker thread
//! only. Everything else talks to it through a command channel:
//! - `PollStats` asks the thread for per-stream bitrate
//! - `Shutdown` (together with the cancellation token) asks it to tear down
//!
//! Stopping is cooperative. `stop()` waits a bounded grace period for the
//! thread to finish; if it does not, the thread is detached and the pipeline
//! is treated as leaked. Nothing outside the worker thread ever touches the
//! engine's native state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::devices::SignalReading;

use super::reporter::StatsSource;
use super::{PipelineEngine, PipelineEvent, PipelineSpec, StreamStats};

/// How often the worker thread drains engine events between commands
const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Error type for worker operations
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum WorkerError {
    #[error("A pipeline worker is already running")]
    AlreadyRunning,

    #[error("No pipeline is running")]
    NotRunning,

    #[error("Failed to spawn pipeline worker: {0}")]
    Spawn(String),

    #[error("Pipeline worker did not answer within {0:?}")]
    StatsTimeout(Duration),
}

/// Lifecycle of one worker instance
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerStatus {
    /// Building and activating the pipeline
    Starting,
    Running,
    /// Build/activation failed or the pipeline died
    Failed(String),
    /// Torn down on request
    Stopped,
}

/// How a stop request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// There was no worker to stop
    NotRunning,
    /// The worker thread finished within the grace period
    Graceful,
    /// The worker thread missed the grace period and was detached.
    /// Its pipeline resources are in an unknown state.
    Abandoned,
}

/// What the lifecycle controller needs from a pipeline owner
pub trait PipelineControl {
    /// Begin starting a pipeline without waiting for it to come up
    fn start(&mut self, reading: &SignalReading) -> Result<(), WorkerError>;

    /// Stop the pipeline, waiting at most the grace period. Always releases
    /// the current worker so the next `start` creates a fresh one.
    fn stop(&mut self) -> StopOutcome;

    /// If the current worker failed to start or died, release it and return
    /// the reason
    fn take_failure(&mut self) -> Option<String>;

    /// Telemetry access to the current worker
    fn stats_source(&self) -> Option<Box<dyn StatsSource>>;
}

enum WorkerCommand {
    PollStats(Sender<Vec<StreamStats>>),
    Shutdown,
}

struct WorkerInstance {
    session_id: Uuid,
    streams: Arc<[String]>,
    commands: Sender<WorkerCommand>,
    status: Arc<Mutex<WorkerStatus>>,
    cancel: Arc<AtomicBool>,
    done: Receiver<()>,
    thread: Option<JoinHandle<()>>,
}

/// Cloneable handle for asking the worker thread for statistics
#[derive(Clone)]
pub struct StatsProbe {
    streams: Arc<[String]>,
    commands: Sender<WorkerCommand>,
    status: Arc<Mutex<WorkerStatus>>,
    timeout: Duration,
}

impl StatsProbe {
    /// Per-stream readings. While the pipeline is still starting every
    /// expected stream reads as `NoSession`.
    pub fn poll(&self) -> Result<Vec<StreamStats>, WorkerError> {
        match &*self.status.lock() {
            WorkerStatus::Running => {}
            WorkerStatus::Starting => {
                return Ok(self.streams.iter().map(StreamStats::no_session).collect());
            }
            WorkerStatus::Failed(_) | WorkerStatus::Stopped => return Err(WorkerError::NotRunning),
        }

        let (reply_tx, reply_rx) = bounded(1);
        self.commands
            .send(WorkerCommand::PollStats(reply_tx))
            .map_err(|_| WorkerError::NotRunning)?;

        reply_rx.recv_timeout(self.timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => WorkerError::StatsTimeout(self.timeout),
            RecvTimeoutError::Disconnected => WorkerError::NotRunning,
        })
    }
}

impl StatsSource for StatsProbe {
    fn poll_stats(&self) -> Result<Vec<StreamStats>, WorkerError> {
        self.poll()
    }
}

/// Runs at most one pipeline at a time on its own thread
pub struct PipelineWorker<E: PipelineEngine> {
    engine: Arc<E>,
    base_spec: PipelineSpec,
    follow_signal: bool,
    grace: Duration,
    stats_timeout: Duration,
    instance: Option<WorkerInstance>,
    abandoned: u64,
}

impl<E: PipelineEngine> PipelineWorker<E> {
    pub fn new(engine: E, base_spec: PipelineSpec, grace: Duration) -> Self {
        Self {
            engine: Arc::new(engine),
            base_spec,
            follow_signal: false,
            grace,
            stats_timeout: Duration::from_millis(500),
            instance: None,
            abandoned: 0,
        }
    }

    /// Build each pipeline for the resolution/frame rate of the reading that
    /// triggered it
    pub fn with_follow_signal(mut self, follow_signal: bool) -> Self {
        self.follow_signal = follow_signal;
        self
    }

    pub fn with_stats_timeout(mut self, timeout: Duration) -> Self {
        self.stats_timeout = timeout;
        self
    }

    pub fn is_active(&self) -> bool {
        self.instance.is_some()
    }

    pub fn status(&self) -> Option<WorkerStatus> {
        self.instance.as_ref().map(|i| i.status.lock().clone())
    }

    /// Number of workers detached after missing the grace period
    pub fn abandoned_workers(&self) -> u64 {
        self.abandoned
    }

    /// Spawn a worker thread that builds and activates a new pipeline.
    ///
    /// Returns once the thread is running; build errors surface later as
    /// `WorkerStatus::Failed`.
    pub fn start_pipeline(&mut self, reading: &SignalReading) -> Result<Uuid, WorkerError> {
        if self.instance.is_some() {
            return Err(WorkerError::AlreadyRunning);
        }

        let spec = if self.follow_signal {
            self.base_spec.clone().with_signal(reading)
        } else {
            self.base_spec.clone()
        };

        let streams: Arc<[String]> = spec.stream_names().into_iter().map(String::from).collect();
        let session_id = Uuid::new_v4();
        let (command_tx, command_rx) = unbounded();
        let (done_tx, done_rx) = bounded(1);
        let status = Arc::new(Mutex::new(WorkerStatus::Starting));
        let cancel = Arc::new(AtomicBool::new(false));

        let engine = self.engine.clone();
        let thread_status = status.clone();
        let thread_cancel = cancel.clone();

        let thread = std::thread::Builder::new()
            .name("signalcast-pipeline".into())
            .spawn(move || {
                worker_main(
                    engine.as_ref(),
                    &spec,
                    session_id,
                    &command_rx,
                    &thread_cancel,
                    &thread_status,
                );
                let _ = done_tx.send(());
            })
            .map_err(|e| WorkerError::Spawn(e.to_string()))?;

        log::info!("Pipeline worker {} starting", session_id);

        self.instance = Some(WorkerInstance {
            session_id,
            streams,
            commands: command_tx,
            status,
            cancel,
            done: done_rx,
            thread: Some(thread),
        });

        Ok(session_id)
    }

    /// Ask the current worker for per-stream bitrate
    pub fn poll_stats(&self) -> Result<Vec<StreamStats>, WorkerError> {
        self.stats_probe().ok_or(WorkerError::NotRunning)?.poll()
    }

    pub fn stats_probe(&self) -> Option<StatsProbe> {
        self.instance.as_ref().map(|i| StatsProbe {
            streams: i.streams.clone(),
            commands: i.commands.clone(),
            status: i.status.clone(),
            timeout: self.stats_timeout,
        })
    }

    /// Request shutdown and wait up to the grace period
    pub fn stop_pipeline(&mut self) -> StopOutcome {
        let Some(instance) = self.instance.take() else {
            return StopOutcome::NotRunning;
        };

        log::info!("Stopping pipeline worker {}", instance.session_id);
        instance.cancel.store(true, Ordering::SeqCst);
        let _ = instance.commands.send(WorkerCommand::Shutdown);

        self.retire(instance)
    }

    /// Wait for a signalled worker to finish, detaching it if it overruns
    fn retire(&mut self, mut instance: WorkerInstance) -> StopOutcome {
        match instance.done.recv_timeout(self.grace) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(handle) = instance.thread.take() {
                    if handle.join().is_err() {
                        log::error!("Pipeline worker {} panicked", instance.session_id);
                    }
                }
                log::info!("Pipeline worker {} stopped", instance.session_id);
                StopOutcome::Graceful
            }
            Err(RecvTimeoutError::Timeout) => {
                log::warn!(
                    "Pipeline worker {} did not stop within {:?}",
                    instance.session_id,
                    self.grace
                );
                self.abandon(instance);
                StopOutcome::Abandoned
            }
        }
    }

    /// Last resort for a worker stuck in teardown. The cancellation token is
    /// already set; the thread is detached and may still hold the pipeline.
    fn abandon(&mut self, mut instance: WorkerInstance) {
        self.abandoned += 1;
        // Dropping the JoinHandle detaches the thread
        drop(instance.thread.take());
        log::error!(
            "Abandoned pipeline worker {}: its pipeline may still be attached to the sink and its resources are leaked ({} abandoned so far)",
            instance.session_id,
            self.abandoned
        );
    }
}

impl<E: PipelineEngine> PipelineControl for PipelineWorker<E> {
    fn start(&mut self, reading: &SignalReading) -> Result<(), WorkerError> {
        self.start_pipeline(reading).map(|_| ())
    }

    fn stop(&mut self) -> StopOutcome {
        self.stop_pipeline()
    }

    fn take_failure(&mut self) -> Option<String> {
        let reason = match &*self.instance.as_ref()?.status.lock() {
            WorkerStatus::Failed(reason) => reason.clone(),
            _ => return None,
        };

        // The thread has given up on its own; only its exit is left to collect
        if let Some(instance) = self.instance.take() {
            self.retire(instance);
        }
        Some(reason)
    }

    fn stats_source(&self) -> Option<Box<dyn StatsSource>> {
        self.stats_probe().map(|probe| Box::new(probe) as Box<dyn StatsSource>)
    }
}

impl<E: PipelineEngine> Drop for PipelineWorker<E> {
    fn drop(&mut self) {
        self.stop_pipeline();
    }
}

/// Worker thread body: build, activate, serve commands, tear down
fn worker_main<E: PipelineEngine>(
    engine: &E,
    spec: &PipelineSpec,
    session_id: Uuid,
    commands: &Receiver<WorkerCommand>,
    cancel: &AtomicBool,
    status: &Mutex<WorkerStatus>,
) {
    let handle = match engine.build(spec) {
        Ok(handle) => handle,
        Err(e) => {
            log::error!("Pipeline worker {}: {}", session_id, e);
            *status.lock() = WorkerStatus::Failed(e.to_string());
            return;
        }
    };

    if cancel.load(Ordering::SeqCst) {
        log::info!("Pipeline worker {} cancelled before activation", session_id);
        *status.lock() = WorkerStatus::Stopped;
        return;
    }

    if let Err(e) = engine.activate(&handle) {
        log::error!("Pipeline worker {}: {}", session_id, e);
        let _ = engine.deactivate(&handle);
        *status.lock() = WorkerStatus::Failed(e.to_string());
        return;
    }

    *status.lock() = WorkerStatus::Running;
    log::info!("Pipeline worker {} running", session_id);

    let mut failure: Option<String> = None;

    while !cancel.load(Ordering::SeqCst) {
        crossbeam_channel::select! {
            recv(commands) -> msg => match msg {
                Ok(WorkerCommand::PollStats(reply)) => {
                    let _ = reply.send(engine.query_stats(&handle));
                }
                Ok(WorkerCommand::Shutdown) | Err(_) => break,
            },
            default(EVENT_POLL_INTERVAL) => {}
        }

        while let Some(event) = engine.poll_event(&handle) {
            match event {
                PipelineEvent::Warning(msg) => {
                    log::warn!("Pipeline worker {}: {}", session_id, msg);
                }
                PipelineEvent::Error(msg) => {
                    log::error!("Pipeline worker {}: {}", session_id, msg);
                    failure.get_or_insert(msg);
                }
                PipelineEvent::EndOfStream => {
                    failure.get_or_insert_with(|| "end of stream".to_string());
                }
            }
        }

        if failure.is_some() {
            break;
        }
    }

    if let Err(e) = engine.deactivate(&handle) {
        log::warn!("Pipeline worker {}: {}", session_id, e);
    }
    drop(handle);

    *status.lock() = match failure {
        Some(reason) => WorkerStatus::Failed(reason),
        None => WorkerStatus::Stopped,
    };
}
