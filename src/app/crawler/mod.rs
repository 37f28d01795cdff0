//! The step machine that drives one crawl.
//!
//! Each step enforces the app context, captures the screen, resolves it against the
//! screen graph, asks the oracle for an action, maps it onto the live UI and executes
//! it. Capture, hashing, oracle and mapping failures degrade to a `back` gesture. Every
//! step counts, whatever its outcome, so the run always ends through a termination check.
//! A step that finds the app out of context is retried without counting; the session's
//! context-failure counter bounds those retries.

pub mod mapper;
pub mod oracle;

#[cfg(test)]
mod tests;

use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app::config::{CrawlSettings, OutputSettings};
use crate::app::control::flags::PAUSE_POLL_INTERVAL;
use crate::app::control::{CrawlFlags, Reporter};
use crate::app::error::AppError;
use crate::app::models::{ActionKind, ActionSuggestion, RunReport, RunStatus, StepOutcome, StepReason};
use crate::app::screen::annotate::annotate_screenshot;
use crate::app::screen::hashing::{structural_hash, visual_hash};
use crate::app::screen::tracker::annotated_file_name;
use crate::app::screen::{Screen, ScreenTracker, Transition};
use crate::app::session::recording::video_file_name;
use crate::app::session::{settle, SessionClient};
use crate::app::store::CrawlStore;
use crate::app::ui_xml::{filter_by_allowed_packages, parse_ui_tree, simplify_for_oracle, UiTree};

use mapper::{execute, map_action};
use oracle::{DecisionOracle, OracleRequest};

/// Consecutive-failure counters, reset by the first success of their kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrawlCounters {
    pub steps: u32,
    pub ai_failures: u32,
    pub map_failures: u32,
    pub exec_failures: u32,
}

impl CrawlCounters {
    fn track(counter: &mut u32, ok: bool) {
        if ok {
            *counter = 0;
        } else {
            *counter += 1;
        }
    }

    pub fn record_oracle(&mut self, ok: bool) {
        Self::track(&mut self.ai_failures, ok);
    }

    pub fn record_mapping(&mut self, ok: bool) {
        Self::track(&mut self.map_failures, ok);
    }

    pub fn record_execution(&mut self, ok: bool) {
        Self::track(&mut self.exec_failures, ok);
    }
}

/// Failure ceilings win over the step and time limits when both hold.
pub fn termination_status(
    counters: &CrawlCounters,
    settings: &CrawlSettings,
    elapsed: Duration,
) -> Option<RunStatus> {
    if counters.ai_failures >= settings.max_consecutive_ai_failures {
        return Some(RunStatus::FailureMaxAiFail);
    }
    if counters.map_failures >= settings.max_consecutive_map_failures {
        return Some(RunStatus::FailureMaxMapFail);
    }
    if counters.exec_failures >= settings.max_consecutive_exec_failures {
        return Some(RunStatus::FailureMaxExecFail);
    }
    match settings.max_duration() {
        Some(limit) if elapsed >= limit => Some(RunStatus::CompletedMaxDuration),
        Some(_) => None,
        None if counters.steps >= settings.max_steps => Some(RunStatus::CompletedMaxSteps),
        None => None,
    }
}

struct Capture {
    screenshot: Vec<u8>,
    xml: String,
}

/// What the previous step left behind for this one.
#[derive(Default)]
struct Previous {
    fingerprint: Option<String>,
    action: Option<String>,
    feedback: Option<String>,
}

enum StepFlow {
    Continue,
    Stop(RunStatus),
}

pub struct Crawler {
    session: SessionClient,
    oracle: Box<dyn DecisionOracle>,
    tracker: ScreenTracker,
    store: Option<CrawlStore>,
    flags: CrawlFlags,
    reporter: Reporter,
    settings: CrawlSettings,
    annotated_dir: Option<PathBuf>,
    video_dir: Option<PathBuf>,
    pause_poll: Duration,
    run_id: String,
    counters: CrawlCounters,
    previous: Previous,
    outcomes: Vec<StepOutcome>,
    last_focus: Option<(String, Option<String>)>,
}

impl Crawler {
    pub fn new(
        session: SessionClient,
        oracle: Box<dyn DecisionOracle>,
        settings: CrawlSettings,
        flags: CrawlFlags,
        reporter: Reporter,
    ) -> Self {
        Self {
            session,
            oracle,
            tracker: ScreenTracker::new(settings.visual_similarity_threshold, None),
            store: None,
            flags,
            reporter,
            settings,
            annotated_dir: None,
            video_dir: None,
            pause_poll: PAUSE_POLL_INTERVAL,
            run_id: Uuid::new_v4().to_string(),
            counters: CrawlCounters::default(),
            previous: Previous::default(),
            outcomes: Vec::new(),
            last_focus: None,
        }
    }

    /// Saves screenshots, annotated copies and the optional screen recording under the
    /// output directory.
    pub fn with_output(mut self, output: &OutputSettings) -> Self {
        self.tracker = ScreenTracker::new(
            self.settings.visual_similarity_threshold,
            Some(output.screenshots_dir()),
        );
        self.annotated_dir = Some(output.annotated_dir());
        self.video_dir = Some(output.videos_dir());
        self
    }

    pub fn with_store(mut self, store: CrawlStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_pause_poll(mut self, poll: Duration) -> Self {
        self.pause_poll = poll;
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn tracker(&self) -> &ScreenTracker {
        &self.tracker
    }

    pub fn counters(&self) -> CrawlCounters {
        self.counters
    }

    pub fn session_mut(&mut self) -> &mut SessionClient {
        &mut self.session
    }

    pub fn into_session(self) -> SessionClient {
        self.session
    }

    fn trace_id(&self) -> String {
        self.session.trace_id().to_string()
    }

    /// Runs steps until a termination condition holds and reports the outcome.
    pub fn run(&mut self) -> RunReport {
        let started = Instant::now();
        let trace_id = self.trace_id();
        let package = self.session.context().target_package.clone();
        info!(trace_id = %trace_id, run_id = %self.run_id, package = %package, "crawl started");
        self.reporter.status("Crawl started");
        self.persist(|store, run_id| store.begin_run(run_id, &package));
        self.start_recording();

        let status = loop {
            if self.flags.wait_while_paused(self.pause_poll) {
                break RunStatus::ShutdownFlagDetected;
            }
            match self.step(started) {
                StepFlow::Continue => {}
                StepFlow::Stop(status) => break status,
            }
        };
        self.finish_recording(&package);

        let steps = self.counters.steps;
        let tracker = &self.tracker;
        let run_id = self.run_id.clone();
        if let Some(store) = self.store.as_mut() {
            let saved = store
                .save_screens(&run_id, tracker)
                .and_then(|_| store.finish_run(&run_id, status, steps));
            if let Err(err) = saved {
                warn!(trace_id = %trace_id, error = %err, "failed to persist crawl summary");
            }
        }

        let report = RunReport {
            run_id: self.run_id.clone(),
            status,
            steps,
            screens: self.tracker.total_screens(),
            transitions: self.tracker.total_transitions(),
            duration_ms: started.elapsed().as_millis(),
            outcomes: std::mem::take(&mut self.outcomes),
        };
        if status.is_success() {
            info!(trace_id = %trace_id, status = %status, steps, screens = report.screens, "crawl finished");
        } else {
            error!(trace_id = %trace_id, status = %status, steps, screens = report.screens, "crawl stopped abnormally");
        }
        self.reporter.status(&format!("Crawl finished: {status}"));
        self.reporter.end(status);
        report
    }

    fn step(&mut self, started: Instant) -> StepFlow {
        let step = self.counters.steps + 1;
        let trace_id = self.trace_id();
        self.reporter.step(step);

        if let Err(err) = self.session.ensure_session() {
            error!(trace_id = %trace_id, step, error = %err, "automation session lost");
            return StepFlow::Stop(RunStatus::FailureSessionLost);
        }
        if !self.session.ensure_in_app() {
            let failures = self.session.context_failures();
            if failures >= self.settings.max_consecutive_context_failures {
                error!(trace_id = %trace_id, step, failures, "app context could not be restored");
                return StepFlow::Stop(RunStatus::FailureMaxContextFail);
            }
            warn!(trace_id = %trace_id, step, failures, "outside the app; retrying the step");
            settle(self.settings.wait_after_action());
            return StepFlow::Continue;
        }
        self.report_focus();

        settle(self.settings.stability_wait());
        let capture = match self.capture() {
            Ok(capture) => capture,
            Err(err) => {
                warn!(trace_id = %trace_id, step, error = %err, "state capture failed");
                return self.abandon_step(step, StepReason::CaptureFailed, started);
            }
        };
        let image_hash = match visual_hash(&capture.screenshot) {
            Ok(hash) => hash,
            Err(err) => {
                warn!(trace_id = %trace_id, step, error = %err, "hashing failed");
                return self.abandon_step(step, StepReason::HashFailed, started);
            }
        };

        let screen = self
            .tracker
            .add_or_get_screen(&structural_hash(&capture.xml), &image_hash, &capture.screenshot);
        self.persist(|store, run_id| store.upsert_screen(run_id, &screen));
        if let Some(path) = screen.screenshot_path.as_deref() {
            self.reporter.screenshot(path);
        }
        self.record_transition(step, &screen);

        if let Some(status) = termination_status(&self.counters, &self.settings, started.elapsed()) {
            return StepFlow::Stop(status);
        }
        if self.flags.wait_while_paused(self.pause_poll) {
            return StepFlow::Stop(RunStatus::ShutdownFlagDetected);
        }

        let (snippet, tree) = self.prepare_snippet(&capture.xml);
        let suggestion = {
            let request = OracleRequest {
                screenshot: &capture.screenshot,
                xml_snippet: &snippet,
                action_history: self.tracker.action_history(&screen.fingerprint),
                available_actions: &ActionKind::ALL,
                visit_count: screen.visit_count,
                screen_id: &screen.fingerprint,
                last_action_feedback: self.previous.feedback.as_deref(),
            };
            self.oracle.suggest_action(&request)
        };
        let suggestion = match suggestion {
            Ok(suggestion) => {
                self.counters.record_oracle(true);
                suggestion
            }
            Err(err) => {
                self.counters.record_oracle(false);
                warn!(trace_id = %trace_id, step, failures = self.counters.ai_failures, error = %err, "oracle failed");
                return self.fall_back(step, &screen, StepReason::OracleFailed);
            }
        };

        let description = suggestion.describe();
        info!(
            trace_id = %trace_id,
            step,
            action = %description,
            reasoning = suggestion.reasoning.as_deref().unwrap_or(""),
            "oracle suggestion"
        );
        let mapped = match map_action(&mut self.session, &suggestion, tree.as_ref()) {
            Ok(mapped) => {
                self.counters.record_mapping(true);
                mapped
            }
            Err(err) => {
                self.counters.record_mapping(false);
                warn!(trace_id = %trace_id, step, failures = self.counters.map_failures, error = %err, "mapping failed");
                return self.fall_back(step, &screen, StepReason::MappingFailed);
            }
        };

        self.annotate(step, &screen, &suggestion, &capture.screenshot);

        self.reporter.action(&description);
        let result = execute(&mut self.session, &mapped);
        let success = result.is_ok();
        self.counters.record_execution(success);
        self.previous.feedback = Some(match &result {
            Ok(()) => format!("{description} succeeded"),
            Err(err) => format!("{description} failed: {}", err.error),
        });
        if let Err(err) = &result {
            warn!(trace_id = %trace_id, step, failures = self.counters.exec_failures, error = %err, "execution failed");
        }
        self.finish_step(
            step,
            &screen,
            description,
            success,
            if success { StepReason::Executed } else { StepReason::ExecutionFailed },
        );
        settle(self.settings.wait_after_action());
        StepFlow::Continue
    }

    fn start_recording(&mut self) {
        if !self.settings.enable_video_recording || self.video_dir.is_none() {
            return;
        }
        if let Err(err) = self.session.start_screen_recording() {
            warn!(trace_id = %self.session.trace_id(), error = %err, "screen recording disabled for this run");
        }
    }

    fn finish_recording(&mut self, package: &str) {
        let Some(dir) = self.video_dir.as_ref() else {
            return;
        };
        if !self.session.is_recording() {
            return;
        }
        let path = dir.join(video_file_name(package, &self.run_id));
        match self.session.stop_screen_recording(&path) {
            Ok(_) => self.reporter.status(&format!("Video saved: {}", path.display())),
            Err(err) => warn!(trace_id = %self.session.trace_id(), error = %err, "screen recording not saved"),
        }
    }

    fn capture(&mut self) -> Result<Capture, AppError> {
        let screenshot = self.session.screenshot()?;
        let xml = self.session.page_source()?;
        Ok(Capture { screenshot, xml })
    }

    fn prepare_snippet(&self, xml: &str) -> (String, Option<UiTree>) {
        let context = self.session.context();
        let mut allowed = vec![context.target_package.clone()];
        allowed.extend(context.allowed_external_packages.iter().cloned());

        let filtered = filter_by_allowed_packages(xml, &allowed).unwrap_or_else(|err| {
            debug!(trace_id = %self.session.trace_id(), error = %err, "package filter skipped");
            xml.to_string()
        });
        let snippet = simplify_for_oracle(&filtered, self.settings.xml_snippet_max_len)
            .unwrap_or_else(|_| truncate_chars(&filtered, self.settings.xml_snippet_max_len));
        (snippet, parse_ui_tree(xml).ok())
    }

    fn record_transition(&mut self, step: u32, screen: &Screen) {
        let (Some(from), Some(action)) = (self.previous.fingerprint.take(), self.previous.action.take()) else {
            return;
        };
        self.tracker.record_transition(&from, &action, &screen.fingerprint);
        let transition = Transition {
            from,
            action,
            to: screen.fingerprint.clone(),
        };
        self.persist(|store, run_id| store.insert_transition(run_id, step, &transition));
    }

    fn report_focus(&mut self) {
        let package = match self.session.current_package() {
            Ok(Some(package)) => package,
            _ => return,
        };
        let activity = self.session.current_activity().ok().flatten();
        let focus = (package, activity);
        if self.last_focus.as_ref() != Some(&focus) {
            self.reporter.focus(&focus.0, focus.1.as_deref());
            self.last_focus = Some(focus);
        }
    }

    fn annotate(&self, step: u32, screen: &Screen, suggestion: &ActionSuggestion, png: &[u8]) {
        if !self.settings.enable_annotations {
            return;
        }
        let (Some(dir), Some(bbox)) = (self.annotated_dir.as_ref(), suggestion.target_bounding_box.as_ref()) else {
            return;
        };
        let source = screen
            .screenshot_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("screen_{}.png", screen.id)));
        let path = dir.join(annotated_file_name(step, &source));
        match annotate_screenshot(png, bbox, &path) {
            Ok(_) => self.reporter.annotated_screenshot(&path),
            Err(err) => debug!(trace_id = %self.session.trace_id(), step, error = %err, "annotation skipped"),
        }
    }

    fn send_back(&mut self) -> bool {
        self.reporter.action("BACK");
        match self.session.back() {
            Ok(()) => true,
            Err(err) => {
                warn!(trace_id = %self.session.trace_id(), error = %err, "fallback back failed");
                false
            }
        }
    }

    /// Back-and-continue for failures after the screen is known.
    fn fall_back(&mut self, step: u32, screen: &Screen, reason: StepReason) -> StepFlow {
        let sent = self.send_back();
        self.previous.feedback = Some(format!("BACK fallback after {reason:?}"));
        self.finish_step(step, screen, ActionSuggestion::back().describe(), sent, reason);
        settle(self.settings.wait_after_action());
        StepFlow::Continue
    }

    /// Back-and-continue before the screen is known; history stays untouched.
    fn abandon_step(&mut self, step: u32, reason: StepReason, started: Instant) -> StepFlow {
        let sent = self.send_back();
        self.counters.steps = step;
        self.outcomes.push(StepOutcome {
            step,
            fingerprint: None,
            action: ActionSuggestion::back().describe(),
            success: sent,
            reason,
        });
        settle(self.settings.wait_after_action());
        match termination_status(&self.counters, &self.settings, started.elapsed()) {
            Some(status) => StepFlow::Stop(status),
            None => StepFlow::Continue,
        }
    }

    fn finish_step(&mut self, step: u32, screen: &Screen, description: String, success: bool, reason: StepReason) {
        self.counters.steps = step;
        self.previous.fingerprint = Some(screen.fingerprint.clone());
        self.previous.action = Some(description.clone());
        self.outcomes.push(StepOutcome {
            step,
            fingerprint: Some(screen.fingerprint.clone()),
            action: description,
            success,
            reason,
        });
    }

    fn persist(&mut self, write: impl FnOnce(&CrawlStore, &str) -> Result<(), AppError>) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        if let Err(err) = write(store, &self.run_id) {
            warn!(trace_id = %self.session.trace_id(), error = %err, "failed to persist crawl state");
        }
    }
}

fn truncate_chars(value: &str, max_len: usize) -> String {
    match value.char_indices().nth(max_len) {
        Some((index, _)) => format!("{}... (truncated)", &value[..index]),
        None => value.to_string(),
    }
}
