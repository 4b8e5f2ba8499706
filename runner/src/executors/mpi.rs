use super::{CancellationToken, ExecutorError, JobOutcome};
use crate::{
    collector::WorkItems,
    config::{
        LauncherConfig, RunnerConfig, PLACEHOLDER_INPUT, PLACEHOLDER_KERNEL,
        PLACEHOLDER_MACHINEFILE, PLACEHOLDER_SLOTS, PLACEHOLDER_WORKER,
    },
    job::JobSpec,
    machinefile,
};
use nix::{
    errno::Errno,
    sys::signal::{killpg, Signal},
    unistd::Pid,
};
use std::{
    ffi::OsString,
    fs,
    io::{self, BufRead, BufReader, Read},
    os::unix::process::{CommandExt, ExitStatusExt},
    path::PathBuf,
    process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio},
    sync::mpsc::{self, Receiver, RecvTimeoutError, Sender},
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, error, info, instrument, trace, warn};
use wait_timeout::ChildExt;

/// how often the supervision loop looks at the cancellation token
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Runs a job through an MPI style launcher (`mpirun`, `mpiexec`, ...)
#[derive(Debug, Clone)]
pub struct MpiExecutor {
    launcher: LauncherConfig,
    worker: PathBuf,
    output_dir: PathBuf,
}

impl MpiExecutor {
    pub fn load(config: &RunnerConfig) -> Self {
        Self {
            launcher: config.launcher.clone(),
            worker: config.worker.clone(),
            output_dir: config.output_dir.clone(),
        }
    }

    /// Render the launcher argument template for `spec`
    ///
    /// Arguments that are exactly a placeholder are replaced without going through a
    /// string, so non UTF-8 paths survive. Placeholders embedded in a larger argument
    /// (`--hostfile={machinefile}`) are substituted textually.
    pub fn args(&self, spec: &JobSpec) -> Vec<OsString> {
        let values: [(&str, OsString); 5] = [
            (PLACEHOLDER_SLOTS, spec.total_slots().to_string().into()),
            (
                PLACEHOLDER_MACHINEFILE,
                spec.machine_file_path().as_os_str().to_owned(),
            ),
            (PLACEHOLDER_WORKER, self.worker.as_os_str().to_owned()),
            (PLACEHOLDER_KERNEL, spec.kernel_size().to_string().into()),
            (
                PLACEHOLDER_INPUT,
                spec.input_directory().as_os_str().to_owned(),
            ),
        ];

        self.launcher
            .args
            .iter()
            .map(|arg| {
                if let Some((_, value)) = values.iter().find(|(name, _)| *name == arg.as_str()) {
                    return value.clone();
                }

                values
                    .iter()
                    .fold(arg.clone(), |arg, (name, value)| {
                        arg.replace(name, &value.to_string_lossy())
                    })
                    .into()
            })
            .collect()
    }

    pub fn command(&self, spec: &JobSpec) -> Command {
        let mut command = Command::new(&self.launcher.exec);
        command
            .args(self.args(spec))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // own process group, so cancellation reaches every local helper of the launcher
            .process_group(0);

        command
    }

    /// Validate the input, write the machine-file and spawn the launcher
    ///
    /// Nothing is written when the input directory is unusable and no process exists
    /// when an error is returned. `cancel` is observed by the returned handle.
    #[instrument(skip(self, spec, cancel), level = "info", fields(input = ?spec.input_directory()))]
    pub fn start(
        &self,
        spec: &JobSpec,
        cancel: CancellationToken,
    ) -> Result<RunHandle, ExecutorError> {
        let items = WorkItems::collect(spec.input_directory())?;

        machinefile::save(spec.machine_file_path(), spec.nodes())?;

        fs::create_dir_all(&self.output_dir).map_err(|source| {
            ExecutorError::OutputDirectory {
                path: self.output_dir.clone(),
                source,
            }
        })?;

        let mut command = self.command(spec);
        debug!(command = ?command, "Spawning launcher");

        let mut child = command.spawn().map_err(|source| {
            error!(exec = ?self.launcher.exec, error = %source, "Failed to spawn launcher");

            ExecutorError::Spawn {
                exec: self.launcher.exec.clone(),
                source,
            }
        })?;

        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        // from here on the guard makes sure the process does not outlive an error
        let child = SupervisedChild::new(child, self.launcher.grace());

        let (Some(stdout), Some(stderr)) = (stdout, stderr) else {
            return Err(ExecutorError::Attach(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "launcher pipes are not available",
            )));
        };

        let (sender, lines) = mpsc::channel();
        thread::Builder::new()
            .name(format!("stdout-{pid}"))
            .spawn(move || forward_lines(stdout, sender))
            .map_err(ExecutorError::Attach)?;

        let (sender, stderr_output) = mpsc::channel();
        thread::Builder::new()
            .name(format!("stderr-{pid}"))
            .spawn(move || {
                if sender.send(collect_stderr(stderr)).is_err() {
                    trace!("Supervision gone before stderr was closed");
                }
            })
            .map_err(ExecutorError::Attach)?;

        info!(
            pid,
            items = items.len(),
            slots = spec.total_slots(),
            hosts = %spec.nodes().hosts(),
            "Launcher started"
        );

        Ok(RunHandle {
            items_total: items.len(),
            cancel,
            child,
            lines,
            stderr: stderr_output,
        })
    }
}

/// A running job, exclusively owning the launcher process and its output
#[derive(Debug)]
pub struct RunHandle {
    items_total: usize,
    cancel: CancellationToken,
    child: SupervisedChild,
    lines: Receiver<String>,
    stderr: Receiver<String>,
}

impl RunHandle {
    /// number of work items found when the run was started
    pub fn items_total(&self) -> usize {
        self.items_total
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Drain the output until the launcher exits or the run is cancelled
    ///
    /// `on_line` sees every stdout line in order. Once cancellation is observed no
    /// further line is handed out and the process group is terminated before the
    /// outcome is returned. Whatever the outcome, nothing started in the launcher's
    /// process group outlives this call.
    #[instrument(skip_all, level = "debug")]
    pub fn supervise<F: FnMut(String)>(mut self, mut on_line: F) -> JobOutcome {
        let mut status = None;
        let mut drain_deadline = None;

        loop {
            if self.cancel.is_cancelled() {
                return self.cancelled();
            }

            match self.lines.recv_timeout(POLL_INTERVAL) {
                Ok(line) if !self.cancel.is_cancelled() => {
                    trace!(line = %line, "Launcher output");
                    on_line(line);
                }
                Ok(_) => {}
                Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => match (status, drain_deadline) {
                    (None, _) => match self.child.try_wait() {
                        Ok(Some(exit)) => {
                            // the launcher is gone but something it left behind holds stdout
                            debug!(status = ?exit, "Launcher exited with its output still open");
                            self.child.terminate();
                            status = Some(exit);
                            drain_deadline = Some(Instant::now() + self.child.grace);
                        }
                        Ok(None) => {}
                        Err(error) => return self.wait_failed(error),
                    },
                    (Some(_), Some(deadline)) if Instant::now() >= deadline => {
                        warn!("Launcher output is held open outside of its process group");
                        break;
                    }
                    _ => {}
                },
            }
        }

        let status = match status {
            Some(status) => status,
            // stdout is closed, keep honouring cancellation while waiting for the exit status
            None => loop {
                if self.cancel.is_cancelled() {
                    return self.cancelled();
                }

                match self.child.wait_timeout(POLL_INTERVAL) {
                    Ok(Some(status)) => break status,
                    Ok(None) => {}
                    Err(error) => return self.wait_failed(error),
                }
            },
        };

        // background processes of the launcher would be orphaned otherwise
        self.child.terminate();

        let Some(diagnostics) = self.diagnostics() else {
            return self.cancelled();
        };

        if status.success() {
            info!("Launcher finished successfully");

            JobOutcome::Completed
        } else {
            let detail = describe_failure(status, &diagnostics);
            error!(status = ?status, "Launcher failed");

            JobOutcome::ExecutionFailed(detail)
        }
    }

    /// Wait for the collected stderr, `None` when the run is cancelled meanwhile
    ///
    /// The process group is already gone at this point. A process that escaped it
    /// can still hold the pipe, so the wait is bounded by the grace period.
    fn diagnostics(&self) -> Option<String> {
        let deadline = Instant::now() + self.child.grace;

        loop {
            if self.cancel.is_cancelled() {
                return None;
            }

            match self.stderr.recv_timeout(POLL_INTERVAL) {
                Ok(diagnostics) => return Some(diagnostics),
                Err(RecvTimeoutError::Disconnected) => {
                    warn!("stderr reader panicked, diagnostics are lost");
                    return Some(String::new());
                }
                Err(RecvTimeoutError::Timeout) if Instant::now() >= deadline => {
                    warn!("Launcher stderr is held open outside of its process group, diagnostics are lost");
                    return Some(String::new());
                }
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
    }

    fn wait_failed(mut self, error: io::Error) -> JobOutcome {
        error!(error = %error, "Failed to wait for launcher");
        self.child.terminate();

        JobOutcome::ExecutionFailed(format!("Failed to wait for launcher: {error}"))
    }

    fn cancelled(mut self) -> JobOutcome {
        info!("Run cancelled, terminating launcher");
        self.child.terminate();

        // the readers exit on their own once the pipes close, processes that escaped
        // the group and kept a copy of a pipe must not block the cancel path
        JobOutcome::Cancelled
    }
}

/// exit status plus the collected stderr, never empty
fn describe_failure(status: ExitStatus, diagnostics: &str) -> String {
    let status = match (status.code(), status.signal()) {
        (Some(code), _) => format!("launcher exited with status {code}"),
        (None, Some(signal)) => format!("launcher was killed by signal {signal}"),
        (None, None) => String::from("launcher exited abnormally"),
    };

    match diagnostics.trim() {
        "" => status,
        diagnostics => format!("{status}\n{diagnostics}"),
    }
}

fn forward_lines(stdout: ChildStdout, sender: Sender<String>) {
    let mut reader = BufReader::new(stdout);
    let mut buffer = Vec::new();

    loop {
        buffer.clear();

        match reader.read_until(b'\n', &mut buffer) {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buffer)
                    .trim_end_matches(|c: char| c == '\n' || c == '\r')
                    .to_owned();

                if sender.send(line).is_err() {
                    // supervision is gone, nobody is interested anymore
                    break;
                }
            }
            Err(error) => {
                warn!(error = %error, "Failed to read launcher output");
                break;
            }
        }
    }
}

fn collect_stderr(mut stderr: ChildStderr) -> String {
    let mut buffer = Vec::new();

    if let Err(error) = stderr.read_to_end(&mut buffer) {
        warn!(error = %error, "Failed to read launcher stderr");
    }

    String::from_utf8_lossy(&buffer).into_owned()
}

/// Launcher process together with the process group it leads
///
/// The group outlives the launcher when it started background processes, so
/// reaping the launcher alone does not release it. Dropping an unreleased child
/// terminates the whole group.
#[derive(Debug)]
struct SupervisedChild {
    child: Child,
    group: Pid,
    grace: Duration,
    reaped: bool,
    released: bool,
}

impl SupervisedChild {
    fn new(child: Child, grace: Duration) -> Self {
        Self {
            group: Pid::from_raw(child.id() as i32),
            child,
            grace,
            reaped: false,
            released: false,
        }
    }

    fn id(&self) -> u32 {
        self.child.id()
    }

    fn wait_timeout(&mut self, timeout: Duration) -> io::Result<Option<ExitStatus>> {
        let status = self.child.wait_timeout(timeout)?;
        self.reaped |= status.is_some();

        Ok(status)
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        let status = self.child.try_wait()?;
        self.reaped |= status.is_some();

        Ok(status)
    }

    /// whether any process is left in the group, exited ones not yet reaped included
    fn group_alive(&self) -> bool {
        !matches!(killpg(self.group, None), Err(Errno::ESRCH))
    }

    /// returns false once the group is gone
    fn signal_group(&self, signal: Signal) -> bool {
        match killpg(self.group, signal) {
            Ok(()) => true,
            Err(Errno::ESRCH) => false,
            Err(errno) => {
                warn!(errno = ?errno, signal = ?signal, "Failed to signal launcher process group");
                true
            }
        }
    }

    /// SIGTERM the process group, SIGKILL it after the grace period and reap the launcher
    ///
    /// Safe to call after the launcher exited on its own, anything it left in the
    /// group is stopped the same way. Group members other than the launcher are
    /// reaped by whoever adopted them.
    fn terminate(&mut self) {
        if self.released {
            return;
        }

        if self.signal_group(Signal::SIGTERM) {
            let deadline = Instant::now() + self.grace;

            loop {
                if self.reaped && !self.group_alive() {
                    debug!("Launcher process group stopped after SIGTERM");
                    break;
                }

                if Instant::now() >= deadline {
                    warn!(grace = ?self.grace, "Launcher process group ignored SIGTERM, killing it");
                    self.signal_group(Signal::SIGKILL);
                    break;
                }

                if self.reaped {
                    thread::sleep(POLL_INTERVAL);
                } else if let Err(error) = self.wait_timeout(POLL_INTERVAL) {
                    warn!(error = %error, "Failed to wait for launcher after SIGTERM, killing it");
                    self.signal_group(Signal::SIGKILL);
                    break;
                }
            }
        }

        if !self.reaped {
            match self.child.wait() {
                Ok(status) => {
                    self.reaped = true;
                    debug!(status = ?status, "Launcher killed");
                }
                Err(error) => error!(error = %error, "Failed to reap launcher"),
            }
        }

        self.released = true;
    }
}

impl Drop for SupervisedChild {
    fn drop(&mut self) {
        if !self.released {
            if !self.reaped {
                warn!(pid = self.child.id(), "Launcher still running while its handle is dropped");
            }

            self.terminate();
        }
    }
}
