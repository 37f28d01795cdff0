//! Starts, stops and pauses a crawl worker from outside.
//!
//! The plane never signals the worker directly except as a last resort: stop and
//! pause are expressed through flag files the worker polls between steps. Worker
//! stdout is the protocol stream, read on one thread and dispatched line by line;
//! stderr is drained separately and only ever surfaces as log text.

use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use super::flags::CrawlFlags;
use super::output::{parse_line, LineSink, OutputCallbacks, OutputEvent};
use super::pid::{cleanup_pid_file_if_matches, create_pid_file, running_pid};
use crate::app::error::AppError;

pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Something that can run the crawl and stream its output lines into a sink.
pub trait WorkerBackend: Send {
    /// Starts the worker. Protocol lines go to `output`, free-form diagnostics to
    /// `diagnostics`. Returns the OS pid when it runs as a separate process.
    fn launch(&mut self, output: LineSink, diagnostics: LineSink, trace_id: &str) -> Result<Option<u32>, AppError>;
    fn is_running(&mut self) -> bool;
    fn kill(&mut self, trace_id: &str) -> Result<(), AppError>;
}

fn spawn_line_reader<R: Read + Send + 'static>(stream: R, sink: LineSink, name: &'static str, trace_id: String) {
    thread::spawn(move || {
        let reader = BufReader::new(stream);
        for line in reader.lines() {
            match line {
                Ok(line) => sink(line),
                Err(err) => {
                    warn!(trace_id = %trace_id, stream = name, error = %err, "failed to read worker output");
                    break;
                }
            }
        }
    });
}

/// Runs the worker binary as a child process with piped stdout/stderr.
pub struct ChildProcessBackend {
    program: PathBuf,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    child: Option<Arc<Mutex<Child>>>,
}

impl ChildProcessBackend {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            envs: Vec::new(),
            child: None,
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

impl WorkerBackend for ChildProcessBackend {
    fn launch(&mut self, output: LineSink, diagnostics: LineSink, trace_id: &str) -> Result<Option<u32>, AppError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.envs.iter().map(|(key, value)| (key.as_str(), value.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|err| {
            AppError::dependency(
                format!("Failed to spawn worker {}: {err}", self.program.display()),
                trace_id,
            )
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::system("Failed to capture worker stdout", trace_id))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AppError::system("Failed to capture worker stderr", trace_id))?;

        spawn_line_reader(stdout, output, "stdout", trace_id.to_string());
        spawn_line_reader(stderr, diagnostics, "stderr", trace_id.to_string());

        let pid = child.id();
        self.child = Some(Arc::new(Mutex::new(child)));
        Ok(Some(pid))
    }

    fn is_running(&mut self) -> bool {
        let Some(child) = &self.child else {
            return false;
        };
        let mut guard = match child.lock() {
            Ok(guard) => guard,
            Err(_) => return false,
        };
        matches!(guard.try_wait(), Ok(None))
    }

    fn kill(&mut self, trace_id: &str) -> Result<(), AppError> {
        let Some(child) = &self.child else {
            return Ok(());
        };
        let mut guard = child
            .lock()
            .map_err(|_| AppError::system("Worker handle lock poisoned", trace_id))?;
        if let Err(err) = guard.kill() {
            warn!(trace_id = %trace_id, error = %err, "failed to kill worker");
        }
        guard
            .wait()
            .map_err(|err| AppError::system(format!("Failed to reap worker: {err}"), trace_id))?;
        Ok(())
    }
}

pub type WorkerJob = Arc<dyn Fn(LineSink) + Send + Sync>;

/// Runs the crawl on a thread of this process; output goes through the same sink.
pub struct InProcessBackend {
    job: WorkerJob,
    handle: Option<JoinHandle<()>>,
}

impl InProcessBackend {
    pub fn new(job: impl Fn(LineSink) + Send + Sync + 'static) -> Self {
        Self {
            job: Arc::new(job),
            handle: None,
        }
    }
}

impl WorkerBackend for InProcessBackend {
    fn launch(&mut self, output: LineSink, _diagnostics: LineSink, trace_id: &str) -> Result<Option<u32>, AppError> {
        let job = Arc::clone(&self.job);
        let handle = thread::Builder::new()
            .name("crawl-worker".to_string())
            .spawn(move || job(output))
            .map_err(|err| AppError::system(format!("Failed to start worker thread: {err}"), trace_id))?;
        self.handle = Some(handle);
        Ok(None)
    }

    fn is_running(&mut self) -> bool {
        self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    fn kill(&mut self, trace_id: &str) -> Result<(), AppError> {
        if self.is_running() {
            // Threads cannot be cancelled; the worker is left to observe the shutdown flag.
            warn!(trace_id = %trace_id, "in-process worker ignored shutdown; detaching");
            self.handle = None;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlStatus {
    pub running: bool,
    pub paused: bool,
    pub pid: Option<u32>,
    pub app_package: Option<String>,
    pub app_activity: Option<String>,
    pub last_status: Option<String>,
    pub end_status: Option<String>,
    pub output_dir: PathBuf,
}

#[derive(Debug, Default)]
struct Observed {
    app_package: Option<String>,
    app_activity: Option<String>,
    last_status: Option<String>,
    end_status: Option<String>,
}

pub struct ControlPlane {
    backend: Box<dyn WorkerBackend>,
    flags: CrawlFlags,
    pid_file: PathBuf,
    output_dir: PathBuf,
    callbacks: Arc<OutputCallbacks>,
    observed: Arc<Mutex<Observed>>,
    pid: Option<u32>,
    trace_id: String,
}

impl ControlPlane {
    pub fn new(
        backend: Box<dyn WorkerBackend>,
        flags: CrawlFlags,
        pid_file: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        callbacks: OutputCallbacks,
        trace_id: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            flags,
            pid_file: pid_file.into(),
            output_dir: output_dir.into(),
            callbacks: Arc::new(callbacks),
            observed: Arc::new(Mutex::new(Observed::default())),
            pid: None,
            trace_id: trace_id.into(),
        }
    }

    pub fn flags(&self) -> &CrawlFlags {
        &self.flags
    }

    fn line_sink(&self) -> LineSink {
        let callbacks = Arc::clone(&self.callbacks);
        let observed = Arc::clone(&self.observed);
        Arc::new(move |line: String| {
            let event = parse_line(&line);
            if let Ok(mut observed) = observed.lock() {
                match &event {
                    OutputEvent::Focus { package, activity } => {
                        observed.app_package = Some(package.clone());
                        observed.app_activity = activity.clone();
                    }
                    OutputEvent::Status(status) => observed.last_status = Some(status.clone()),
                    OutputEvent::End(status) => observed.end_status = Some(status.clone()),
                    _ => {}
                }
            }
            callbacks.dispatch(event);
        })
    }

    fn log_sink(&self) -> LineSink {
        let callbacks = Arc::clone(&self.callbacks);
        Arc::new(move |line: String| callbacks.dispatch(OutputEvent::Log(line)))
    }

    /// Polls the worker; a worker found exited releases its PID file.
    fn worker_running(&mut self) -> bool {
        let running = self.backend.is_running();
        if !running {
            self.release_pid_file();
        }
        running
    }

    pub fn is_running(&mut self) -> bool {
        self.worker_running()
    }

    /// Clears a stale shutdown flag and launches the worker.
    pub fn start(&mut self) -> Result<Option<u32>, AppError> {
        if self.worker_running() {
            return Err(AppError::validation("Crawler is already running", &self.trace_id));
        }
        if let Some(pid) = running_pid(&self.pid_file) {
            return Err(AppError::validation(
                format!("Crawler already running with pid {pid}"),
                &self.trace_id,
            ));
        }
        self.flags
            .shutdown
            .clear()
            .map_err(|err| AppError::system(format!("Failed to clear shutdown flag: {err}"), &self.trace_id))?;
        if let Ok(mut observed) = self.observed.lock() {
            *observed = Observed::default();
        }

        let pid = self
            .backend
            .launch(self.line_sink(), self.log_sink(), &self.trace_id)?;
        if let Some(pid) = pid {
            if let Err(err) = create_pid_file(&self.pid_file, pid) {
                warn!(trace_id = %self.trace_id, error = %err, "failed to write pid file");
            }
        }
        self.pid = pid;
        info!(trace_id = %self.trace_id, pid = ?pid, "crawler started");
        Ok(pid)
    }

    /// Requests shutdown through the flag, then force-terminates after `grace`.
    /// Returns whether a running worker was stopped.
    pub fn stop(&mut self, grace: Duration) -> Result<bool, AppError> {
        if !self.worker_running() {
            return Ok(false);
        }
        self.flags
            .shutdown
            .raise("stop requested")
            .map_err(|err| AppError::system(format!("Failed to write shutdown flag: {err}"), &self.trace_id))?;

        let deadline = Instant::now() + grace;
        while self.backend.is_running() && Instant::now() < deadline {
            thread::sleep(STOP_POLL_INTERVAL);
        }
        if self.backend.is_running() {
            warn!(trace_id = %self.trace_id, "worker did not exit within grace period; terminating");
            self.backend.kill(&self.trace_id)?;
        }
        self.release_pid_file();
        info!(trace_id = %self.trace_id, "crawler stopped");
        Ok(true)
    }

    fn release_pid_file(&mut self) {
        if let Some(pid) = self.pid.take() {
            cleanup_pid_file_if_matches(&self.pid_file, pid);
        }
    }

    pub fn pause(&mut self) -> Result<bool, AppError> {
        if !self.worker_running() {
            return Ok(false);
        }
        self.flags
            .pause
            .raise("paused")
            .map_err(|err| AppError::system(format!("Failed to write pause flag: {err}"), &self.trace_id))?;
        Ok(true)
    }

    pub fn resume(&mut self) -> Result<bool, AppError> {
        if !self.worker_running() {
            return Ok(false);
        }
        self.flags
            .pause
            .clear()
            .map_err(|err| AppError::system(format!("Failed to remove pause flag: {err}"), &self.trace_id))?;
        Ok(true)
    }

    pub fn status(&mut self) -> ControlStatus {
        let running = self.worker_running();
        let observed = self
            .observed
            .lock()
            .map(|observed| Observed {
                app_package: observed.app_package.clone(),
                app_activity: observed.app_activity.clone(),
                last_status: observed.last_status.clone(),
                end_status: observed.end_status.clone(),
            })
            .unwrap_or_default();
        ControlStatus {
            running,
            paused: running && self.flags.paused(),
            pid: self.pid.filter(|_| running),
            app_package: observed.app_package,
            app_activity: observed.app_activity,
            last_status: observed.last_status,
            end_status: observed.end_status,
            output_dir: self.output_dir.clone(),
        }
    }
}
