//! Single-flight control of runs.
//!
//! The orchestrator is the only part that talks to the presentation layer. It owns
//! the editable node table and the selected input, and turns a start command into
//! a job running on its own thread. Everything a run reports flows back as
//! [`RunEvent`]s, always ending with exactly one [`RunEvent::Finished`].

use crate::{
    config::RunnerConfig,
    executors::{CancellationToken, JobOutcome, MpiExecutor},
    job::{JobSpec, KernelSize},
    machinefile::{self, DecodeMode, MachineFileError},
    metrics::{MetricsReader, MetricsSnapshot},
    nodes::{NodeEntry, NodeError, NodeSet},
    progress::{Anomaly, MarkerClassifier, ProgressEvent, ProgressTracker},
};
use parking_lot::Mutex;
use std::{
    io,
    path::{Path, PathBuf},
    sync::{
        mpsc::{self, RecvTimeoutError, Sender},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use tracing_unwrap::ResultExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Configuring,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl State {
    fn terminal(outcome: &JobOutcome) -> Self {
        match outcome {
            JobOutcome::Completed => Self::Completed,
            JobOutcome::Cancelled => Self::Cancelled,
            _ => Self::Failed,
        }
    }
}

/// Everything the presentation layer gets to see of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    Started { items: usize, slots: u32 },
    Progress(u8),
    Log(String),
    Metrics(MetricsSnapshot),
    Anomaly(Anomaly),
    Finished(JobOutcome),
}

#[derive(Error, Debug)]
pub enum StartError {
    #[error("No input directory selected")]
    NoDirectory,
    #[error("Node set is not launchable: {0}")]
    Nodes(#[from] NodeError),
    #[error("A run is already in progress")]
    Busy,
    #[error("Failed to start run thread: {0}")]
    Thread(#[from] io::Error),
}

struct ActiveRun {
    cancel: CancellationToken,
    thread: JoinHandle<JobOutcome>,
}

pub struct Orchestrator {
    config: RunnerConfig,
    executor: MpiExecutor,
    nodes: NodeSet,
    input: Option<PathBuf>,
    kernel_size: KernelSize,
    state: Arc<Mutex<State>>,
    active: Option<ActiveRun>,
    events: Sender<RunEvent>,
}

impl Orchestrator {
    /// Create an idle orchestrator, loading the configured machine-file if enabled
    pub fn new(config: RunnerConfig, events: Sender<RunEvent>) -> Self {
        let nodes = if config.machinefile.autoload {
            match machinefile::load(&config.machinefile.path, DecodeMode::Lenient) {
                Ok(nodes) => {
                    debug!(path = ?config.machinefile.path, nodes = nodes.len(), "Loaded machine-file");
                    nodes
                }
                Err(error) => {
                    warn!(path = ?config.machinefile.path, error = %error, "Ignoring unusable machine-file");
                    NodeSet::new()
                }
            }
        } else {
            NodeSet::new()
        };

        Self {
            executor: MpiExecutor::load(&config),
            kernel_size: config.kernel_size,
            config,
            nodes,
            input: None,
            state: Arc::new(Mutex::new(State::Idle)),
            active: None,
            events,
        }
    }

    pub fn state(&self) -> State {
        *self.state.lock()
    }

    pub fn nodes(&self) -> &NodeSet {
        &self.nodes
    }

    /// edits move an idle orchestrator into configuring, a running job is unaffected
    fn configure(&self) {
        let mut state = self.state.lock();

        if *state == State::Idle {
            *state = State::Configuring;
        }
    }

    pub fn select_directory(&mut self, directory: impl Into<PathBuf>) {
        self.input = Some(directory.into());
        self.configure();
    }

    pub fn set_kernel_size(&mut self, kernel_size: KernelSize) {
        self.kernel_size = kernel_size;
        self.configure();
    }

    pub fn add_node(&mut self, host: &str, slots: u32) -> Result<(), NodeError> {
        self.nodes.push(NodeEntry::new(host, slots)?);
        self.configure();

        Ok(())
    }

    pub fn remove_node(&mut self, index: usize) -> Result<NodeEntry, NodeError> {
        let entry = self.nodes.remove(index)?;
        self.configure();

        Ok(entry)
    }

    /// Replace the node table with the content of a user selected machine-file
    pub fn load_machinefile(&mut self, path: &Path) -> Result<(), MachineFileError> {
        self.nodes = machinefile::load(path, DecodeMode::Strict)?;
        self.configure();

        info!(path = ?path, nodes = self.nodes.len(), "Loaded machine-file");

        Ok(())
    }

    /// Start a run on a snapshot of the current configuration
    ///
    /// Rejected while another run is active. A start always passes through
    /// `Configuring`, where it stays when a precondition fails. Nothing is written
    /// and no process is started in that case.
    pub fn start(&mut self) -> Result<(), StartError> {
        if self.is_running() {
            warn!("Start requested while a run is active, ignoring");

            return Err(StartError::Busy);
        }
        // reap the thread of a previous run, its outcome was already delivered
        if let Some(run) = self.active.take() {
            if run.thread.join().is_err() {
                warn!("Previous run thread panicked");
            }
        }

        *self.state.lock() = State::Configuring;

        let input = self.input.clone().ok_or(StartError::NoDirectory)?;
        let spec = JobSpec::new(
            input,
            self.kernel_size,
            self.config.machinefile.path.clone(),
            self.nodes.clone(),
        )?;

        let cancel = CancellationToken::new();
        let run = Run {
            executor: self.executor.clone(),
            spec,
            marker: self.config.marker.clone(),
            metrics_path: self.config.metrics.path.clone(),
            interval: self.config.metrics.interval(),
            cancel: cancel.clone(),
            state: self.state.clone(),
            events: self.events.clone(),
        };

        *self.state.lock() = State::Running;

        let thread = match thread::Builder::new()
            .name("job-runner".into())
            .spawn(move || run.execute())
        {
            Ok(thread) => thread,
            Err(error) => {
                *self.state.lock() = State::Configuring;

                return Err(error.into());
            }
        };

        self.active = Some(ActiveRun { cancel, thread });

        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.active
            .as_ref()
            .map_or(false, |run| !run.thread.is_finished())
    }

    /// Request cooperative cancellation, returns false when nothing is running
    pub fn cancel(&self) -> bool {
        match &self.active {
            Some(run) if !run.thread.is_finished() => {
                info!("Cancelling active run");
                run.cancel.cancel();

                true
            }
            _ => false,
        }
    }

    /// Block until the active run is over and return its outcome
    pub fn wait(&mut self) -> Option<JobOutcome> {
        self.active
            .take()
            .map(|run| run.thread.join().unwrap_or_log())
    }
}

/// Everything a run thread needs, captured when the run is started
struct Run {
    executor: MpiExecutor,
    spec: JobSpec,
    marker: String,
    metrics_path: PathBuf,
    interval: Duration,
    cancel: CancellationToken,
    state: Arc<Mutex<State>>,
    events: Sender<RunEvent>,
}

impl Run {
    fn emit(&self, event: RunEvent) {
        // a presentation layer that went away does not stop the run
        if self.events.send(event).is_err() {
            debug!("Event receiver dropped");
        }
    }

    fn execute(self) -> JobOutcome {
        let outcome = self.supervise();

        match &outcome {
            JobOutcome::Completed | JobOutcome::Cancelled => info!(outcome = %outcome, "Run finished"),
            outcome => error!(outcome = %outcome, "Run failed"),
        }

        *self.state.lock() = State::terminal(&outcome);
        self.emit(RunEvent::Finished(outcome.clone()));
        *self.state.lock() = State::Idle;

        outcome
    }

    fn supervise(&self) -> JobOutcome {
        if self.cancel.is_cancelled() {
            return JobOutcome::Cancelled;
        }

        let handle = match self.executor.start(&self.spec, self.cancel.clone()) {
            Ok(handle) => handle,
            Err(error) => {
                warn!(error = %error, "Run did not start");

                return error.into();
            }
        };

        debug!(pid = handle.pid(), "Supervising launcher");
        self.emit(RunEvent::Started {
            items: handle.items_total(),
            slots: self.spec.total_slots(),
        });

        let reader = MetricsReader::new(&self.metrics_path);
        let poller = MetricsPoller::spawn(reader, self.interval, self.events.clone());

        let mut tracker = ProgressTracker::new(
            MarkerClassifier::new(self.marker.as_str()),
            handle.items_total(),
        );

        let outcome = handle.supervise(|line| match tracker.observe(line) {
            ProgressEvent::Progress(percent) => self.emit(RunEvent::Progress(percent)),
            ProgressEvent::Log(line) => self.emit(RunEvent::Log(line)),
        });

        debug!(
            completed = tracker.state().items_completed,
            total = tracker.state().items_total,
            "Launcher output drained"
        );

        if outcome.is_completed() {
            if let Some(anomaly) = tracker.complete() {
                self.emit(RunEvent::Anomaly(anomaly));
            }

            self.emit(RunEvent::Progress(100));
        }

        // one last look at the report once the poller is gone
        let mut reader = poller
            .and_then(MetricsPoller::stop)
            .unwrap_or_else(|| MetricsReader::new(&self.metrics_path));
        self.emit(RunEvent::Metrics(reader.read().clone()));

        outcome
    }
}

/// Background thread re-reading the metrics report on a fixed interval
struct MetricsPoller {
    stop: Sender<()>,
    thread: JoinHandle<MetricsReader>,
}

impl MetricsPoller {
    /// metrics are best effort, a poller that cannot be started is only logged
    fn spawn(
        mut reader: MetricsReader,
        interval: Duration,
        events: Sender<RunEvent>,
    ) -> Option<Self> {
        let (stop, stopped) = mpsc::channel::<()>();

        let spawned = thread::Builder::new()
            .name("metrics-poll".into())
            .spawn(move || {
                let mut last = MetricsSnapshot::default();

                loop {
                    let snapshot = reader.read();

                    if *snapshot != last {
                        last = snapshot.clone();

                        if events.send(RunEvent::Metrics(last.clone())).is_err() {
                            debug!("Event receiver dropped");
                        }
                    }

                    match stopped.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }

                reader
            });

        match spawned {
            Ok(thread) => Some(Self { stop, thread }),
            Err(error) => {
                warn!(error = %error, "Failed to start metrics polling");
                None
            }
        }
    }

    fn stop(self) -> Option<MetricsReader> {
        drop(self.stop);

        match self.thread.join() {
            Ok(reader) => Some(reader),
            Err(_) => {
                warn!("Metrics poller panicked");
                None
            }
        }
    }
}
