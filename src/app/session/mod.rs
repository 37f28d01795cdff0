//! Single automation-server session with self-healing behaviour.
//!
//! Every public operation first checks that the session is alive. A dead session is
//! recreated with the capabilities and server URL it was opened with, a bounded number
//! of times, before the operation is reported as failed.

pub mod app_context;
pub mod history;
pub mod recording;


use std::thread;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::app::adb::parse::{parse_focused_activity, parse_focused_package};
use crate::app::capabilities::{performance_settings, validate_capabilities, Capabilities};
use crate::app::config::SessionSettings;
use crate::app::device::ANDROID_PLATFORM;
use crate::app::error::AppError;
use crate::app::fallback::{FallbackError, OrderedFallback};
use crate::app::ui_capture::ensure_png;
use crate::app::webdriver::locator::package_qualified_id;
use crate::app::webdriver::{
    ElementRef, Locator, Rect, Strategy, WebDriverError, WebDriverResult, WebDriverTransport,
};

pub use app_context::AppContext;
pub use history::ActionHistory;

const EDGE_MARGIN_RATIO: f64 = 0.03;
const SWIPE_DURATION_MS: u64 = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollDirection {
    Up,
    Down,
    Left,
    Right,
}

impl ScrollDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScrollDirection::Up => "up",
            ScrollDirection::Down => "down",
            ScrollDirection::Left => "left",
            ScrollDirection::Right => "right",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "up" => Some(ScrollDirection::Up),
            "down" => Some(ScrollDirection::Down),
            "left" => Some(ScrollDirection::Left),
            "right" => Some(ScrollDirection::Right),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionTimings {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub element_wait: Duration,
    pub id_wait: Duration,
    pub poll_interval: Duration,
    pub package_retry_delay: Duration,
    pub back_settle: Duration,
    pub relaunch_settle: Duration,
    pub action_history_len: usize,
}

impl SessionTimings {
    pub fn from_settings(settings: &SessionSettings) -> Self {
        Self {
            max_retries: settings.max_retries.max(1),
            retry_delay: Duration::from_millis(settings.retry_delay_ms),
            element_wait: Duration::from_secs(settings.element_wait_secs),
            id_wait: Duration::from_secs(settings.id_wait_secs),
            poll_interval: Duration::from_millis(250),
            package_retry_delay: Duration::from_secs(1),
            back_settle: Duration::from_secs(1),
            relaunch_settle: Duration::from_secs(2),
            action_history_len: settings.action_history_len,
        }
    }

    #[cfg(test)]
    pub fn immediate() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::ZERO,
            element_wait: Duration::ZERO,
            id_wait: Duration::ZERO,
            poll_interval: Duration::ZERO,
            package_retry_delay: Duration::ZERO,
            back_settle: Duration::ZERO,
            relaunch_settle: Duration::ZERO,
            action_history_len: 100,
        }
    }
}

pub(crate) fn settle(duration: Duration) {
    if !duration.is_zero() {
        thread::sleep(duration);
    }
}

/// Pause before recovery attempt `attempt`: none before the first, then growing linearly
/// with the number of attempts already failed.
pub(crate) fn recovery_backoff(retry_delay: Duration, attempt: u32) -> Duration {
    retry_delay * attempt.saturating_sub(1)
}

fn capped(requested: Option<Duration>, ceiling: Duration) -> Duration {
    requested.map_or(ceiling, |value| value.min(ceiling))
}

pub struct SessionClient {
    transport: Box<dyn WebDriverTransport>,
    timings: SessionTimings,
    adb_program: String,
    trace_id: String,
    session_id: Option<String>,
    capabilities: Option<Capabilities>,
    server_url: Option<String>,
    context: AppContext,
    context_failures: u32,
    history: ActionHistory,
    recording: bool,
}

impl SessionClient {
    pub fn new(
        transport: Box<dyn WebDriverTransport>,
        timings: SessionTimings,
        adb_program: impl Into<String>,
        trace_id: impl Into<String>,
    ) -> Self {
        let history = ActionHistory::new(timings.action_history_len);
        Self {
            transport,
            timings,
            adb_program: adb_program.into(),
            trace_id: trace_id.into(),
            session_id: None,
            capabilities: None,
            server_url: None,
            context: AppContext::default(),
            context_failures: 0,
            history,
            recording: false,
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn is_connected(&self) -> bool {
        self.session_id.is_some()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn context(&self) -> &AppContext {
        &self.context
    }

    pub fn context_failures(&self) -> u32 {
        self.context_failures
    }

    pub fn recent_actions(&self) -> &ActionHistory {
        &self.history
    }

    fn platform_is_android(&self) -> bool {
        self.capabilities
            .as_ref()
            .and_then(|caps| caps.get_str("platformName"))
            .map_or(true, |platform| platform.eq_ignore_ascii_case(ANDROID_PLATFORM))
    }

    fn target_package(&self) -> Option<&str> {
        Some(self.context.target_package.as_str()).filter(|value| !value.is_empty())
    }

    /// Opens the session. Capabilities and URL are kept for later recovery.
    pub fn connect(
        &mut self,
        capabilities: Capabilities,
        server_url: &str,
        context: AppContext,
    ) -> Result<(), AppError> {
        validate_capabilities(&capabilities, &self.trace_id)?;
        if self.session_id.is_some() {
            self.close();
        }
        self.capabilities = Some(capabilities);
        self.server_url = Some(server_url.trim().to_string());
        self.context = context;
        self.context_failures = 0;
        self.history.clear();

        let session_id = self.open_session().map_err(|err| {
            AppError::session_init(
                format!("Failed to create session at {server_url}: {err}"),
                &self.trace_id,
            )
        })?;
        info!(trace_id = %self.trace_id, session_id = %session_id, "automation session started");
        Ok(())
    }

    fn open_session(&mut self) -> WebDriverResult<String> {
        let (Some(capabilities), Some(server_url)) = (&self.capabilities, &self.server_url) else {
            return Err(WebDriverError::SessionNotCreated(
                "no capabilities recorded".to_string(),
            ));
        };
        let session_id = self.transport.create_session(server_url, capabilities)?;
        if let Err(err) = self.transport.update_settings(&session_id, &performance_settings()) {
            warn!(trace_id = %self.trace_id, error = %err, "failed to apply driver settings");
        }
        self.session_id = Some(session_id.clone());
        Ok(session_id)
    }

    /// Live session id. A session lost to an earlier failed recovery is reopened from the
    /// recorded capabilities before giving up.
    pub fn ensure_session(&mut self) -> Result<String, AppError> {
        if let Some(session_id) = &self.session_id {
            return Ok(session_id.clone());
        }
        if self.capabilities.is_none() || self.server_url.is_none() {
            return Err(AppError::session("No active session", &self.trace_id));
        }
        warn!(trace_id = %self.trace_id, "no live session; reopening from recorded capabilities");
        self.recover_session()
    }

    /// Probes the session, recovering it when the failure looks like termination.
    pub fn validate_session(&mut self) -> Result<String, AppError> {
        self.page_source()?;
        self.ensure_session()
    }

    fn recover_session(&mut self) -> Result<String, AppError> {
        if self.capabilities.is_none() || self.server_url.is_none() {
            return Err(AppError::session(
                "Cannot recover session: no capabilities or server URL recorded",
                &self.trace_id,
            ));
        }
        if let Some(old) = self.session_id.take() {
            if let Err(err) = self.transport.delete_session(&old) {
                debug!(trace_id = %self.trace_id, error = %err, "ignoring cleanup failure of dead session");
            }
        }

        let retry_delay = self.timings.retry_delay;
        let mut chain = OrderedFallback::<SessionClient, String, WebDriverError>::new("recover_session");
        for attempt in 1..=self.timings.max_retries {
            chain = chain.then("recreate_session", move |client: &mut SessionClient| {
                settle(recovery_backoff(retry_delay, attempt));
                info!(trace_id = %client.trace_id, attempt, "session recovery attempt");
                client.open_session()
            });
        }
        match chain.run(self, |_| true) {
            Ok(resolved) => {
                info!(trace_id = %self.trace_id, attempt = resolved.attempt, "session recovered");
                Ok(resolved.value)
            }
            Err(err) => {
                let detail = err
                    .into_last_error()
                    .map(|err| err.to_string())
                    .unwrap_or_default();
                Err(AppError::session(
                    format!("Session recovery failed: {detail}"),
                    &self.trace_id,
                ))
            }
        }
    }

    /// Deletes the session and forgets everything tied to it.
    pub fn close(&mut self) {
        if let Some(session_id) = self.session_id.take() {
            if let Err(err) = self.transport.delete_session(&session_id) {
                warn!(trace_id = %self.trace_id, error = %err, "failed to delete session");
            }
        }
        self.capabilities = None;
        self.server_url = None;
        self.context = AppContext::default();
        self.context_failures = 0;
        self.history.clear();
        self.recording = false;
    }

    fn wait_for_visible(
        &mut self,
        session_id: &str,
        locator: &Locator,
        wait: Duration,
    ) -> WebDriverResult<ElementRef> {
        let deadline = Instant::now() + wait;
        loop {
            match self.transport.find_element(session_id, locator) {
                Ok(element) => match self.transport.is_displayed(session_id, &element) {
                    Ok(true) => return Ok(element),
                    Ok(false) => {}
                    Err(err) if err.is_stale() || err.is_not_found() => {}
                    Err(err) => return Err(err),
                },
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
            if Instant::now() >= deadline {
                return Err(WebDriverError::Timeout(format!(
                    "{locator} not visible within {}ms",
                    wait.as_millis()
                )));
            }
            settle(self.timings.poll_interval);
        }
    }

    fn resolve_element(
        &mut self,
        session_id: &str,
        selector: &str,
        strategy: Strategy,
        timeout: Option<Duration>,
    ) -> Result<ElementRef, AppError> {
        if strategy != Strategy::Id || !self.platform_is_android() {
            let wait = capped(timeout, self.timings.element_wait);
            let locator = Locator::new(strategy, selector);
            return self
                .wait_for_visible(session_id, &locator, wait)
                .map_err(|err| self.lookup_error(selector, err));
        }

        let id_wait = capped(timeout, self.timings.id_wait);
        let qualified = package_qualified_id(self.target_package(), selector);
        let qualified_value = qualified.clone().unwrap_or_default();

        let ui_selector = Locator::ui_selector_resource_id(selector);
        let plain_id = Locator::id(selector);
        let accessibility = Locator::accessibility(selector);
        let prefixed_id = Locator::id(qualified_value.as_str());
        let xpath_id = Locator::xpath_resource_id(selector);
        let xpath_prefixed = Locator::xpath_resource_id(&qualified_value);

        let result = OrderedFallback::<SessionClient, ElementRef, WebDriverError>::new("find_element")
            .then("ui_selector", |client: &mut SessionClient| {
                client.transport.find_element(session_id, &ui_selector)
            })
            .then("id_wait", |client: &mut SessionClient| {
                client.wait_for_visible(session_id, &plain_id, id_wait)
            })
            .then("accessibility_id", |client: &mut SessionClient| {
                client.transport.find_element(session_id, &accessibility)
            })
            .then_if(qualified.is_some(), "package_id", |client: &mut SessionClient| {
                client.transport.find_element(session_id, &prefixed_id)
            })
            .then("xpath_id", |client: &mut SessionClient| {
                client.transport.find_element(session_id, &xpath_id)
            })
            .then_if(qualified.is_some(), "xpath_package_id", |client: &mut SessionClient| {
                client.transport.find_element(session_id, &xpath_prefixed)
            })
            .run(self, |err| err.is_not_found() || err.is_timeout());

        match result {
            Ok(resolved) => {
                debug!(
                    trace_id = %self.trace_id,
                    selector,
                    strategy = resolved.strategy,
                    "element resolved"
                );
                Ok(resolved.value)
            }
            Err(FallbackError::Exhausted { .. }) => {
                Err(AppError::element_not_found(selector, &self.trace_id))
            }
            Err(FallbackError::Aborted { error, .. }) => Err(error.into_app_error(&self.trace_id)),
        }
    }

    fn lookup_error(&self, selector: &str, err: WebDriverError) -> AppError {
        if err.is_not_found() || err.is_timeout() {
            AppError::element_not_found(selector, &self.trace_id)
        } else {
            err.into_app_error(&self.trace_id)
        }
    }

    fn gesture_error(&self, what: &str, err: WebDriverError) -> AppError {
        if err.is_session_terminated() {
            err.into_app_error(&self.trace_id)
        } else {
            AppError::gesture(format!("{what}: {err}"), &self.trace_id)
        }
    }

    /// Multi-strategy lookup. `timeout` is capped per strategy.
    pub fn find_element(
        &mut self,
        selector: &str,
        strategy: Strategy,
        timeout: Option<Duration>,
    ) -> Result<ElementRef, AppError> {
        let session_id = self.validate_session()?;
        self.resolve_element(&session_id, selector, strategy, timeout)
    }

    pub fn tap(&mut self, selector: &str, strategy: Strategy) -> Result<(), AppError> {
        let session_id = self.validate_session()?;
        let started = Instant::now();
        let element = match self.resolve_element(&session_id, selector, strategy, None) {
            Ok(element) => element,
            Err(err) => {
                self.history
                    .record("tap", Some(selector), started, Some(err.to_string()));
                return Err(err);
            }
        };
        self.tap_element(&session_id, selector, &element, started)
    }

    /// Taps an element that was resolved earlier in the same step.
    pub fn tap_resolved(&mut self, label: &str, element: &ElementRef) -> Result<(), AppError> {
        let session_id = self.validate_session()?;
        self.tap_element(&session_id, label, element, Instant::now())
    }

    fn tap_element(
        &mut self,
        session_id: &str,
        label: &str,
        element: &ElementRef,
        started: Instant,
    ) -> Result<(), AppError> {
        let result = OrderedFallback::<SessionClient, (), WebDriverError>::new("tap")
            .then("click", |client: &mut SessionClient| {
                client.transport.click(session_id, element)
            })
            .then("pointer_actions", |client: &mut SessionClient| {
                let (x, y) = client.element_center(session_id, element)?;
                client.transport.perform_actions(session_id, &pointer_tap(x, y))
            })
            .then("mobile_tap", |client: &mut SessionClient| {
                let (x, y) = client.element_center(session_id, element)?;
                client
                    .transport
                    .execute(session_id, "mobile: tap", &json!({ "x": x, "y": y }))
                    .map(|_| ())
            })
            .run(self, |_| true);

        match result {
            Ok(_) => {
                self.history.record("tap", Some(label), started, None);
                Ok(())
            }
            Err(err) => {
                let last = err.into_last_error().unwrap_or_else(|| {
                    WebDriverError::Protocol {
                        error: "unknown error".to_string(),
                        message: "no tap mechanism available".to_string(),
                    }
                });
                let app_err = self.gesture_error(&format!("Tap failed on {label}"), last);
                self.history
                    .record("tap", Some(label), started, Some(app_err.to_string()));
                Err(app_err)
            }
        }
    }

    fn element_center(&mut self, session_id: &str, element: &ElementRef) -> WebDriverResult<(i64, i64)> {
        let rect = self.transport.element_rect(session_id, element)?;
        let window = self.transport.window_rect(session_id).ok();
        let (x, y) = rect.center();
        Ok(match window {
            Some(window) => validate_coordinates(x, y, &window, &self.trace_id),
            None => (x, y),
        })
    }

    /// Types into the element, re-resolving it before every sub-step so a stale handle
    /// from the previous sub-step is never reused.
    pub fn send_keys(
        &mut self,
        selector: &str,
        text: &str,
        strategy: Strategy,
        clear_first: bool,
    ) -> Result<(), AppError> {
        let session_id = self.validate_session()?;
        let started = Instant::now();
        let result = self.type_text(&session_id, selector, text, strategy, clear_first);
        let error = result.as_ref().err().map(|err| err.to_string());
        self.history.record("send_keys", Some(selector), started, error);
        result
    }

    fn type_text(
        &mut self,
        session_id: &str,
        selector: &str,
        text: &str,
        strategy: Strategy,
        clear_first: bool,
    ) -> Result<(), AppError> {
        let element = self.resolve_element(session_id, selector, strategy, None)?;
        if let Err(err) = self.transport.click(session_id, &element) {
            if err.is_session_terminated() {
                return Err(err.into_app_error(&self.trace_id));
            }
            debug!(trace_id = %self.trace_id, selector, error = %err, "focus click failed; typing anyway");
        }

        if clear_first {
            let element = self.resolve_element(session_id, selector, strategy, None)?;
            self.transport
                .clear(session_id, &element)
                .map_err(|err| self.gesture_error(&format!("Clear failed on {selector}"), err))?;
        }

        let element = self.resolve_element(session_id, selector, strategy, None)?;
        self.transport
            .send_keys(session_id, &element, text)
            .map_err(|err| self.gesture_error(&format!("Text entry failed on {selector}"), err))?;

        if let Err(err) = self.transport.hide_keyboard(session_id) {
            debug!(trace_id = %self.trace_id, error = %err, "hide keyboard failed");
        }
        Ok(())
    }

    pub fn scroll(&mut self, direction: ScrollDirection) -> Result<(), AppError> {
        let session_id = self.validate_session()?;
        let started = Instant::now();
        let result = self
            .transport
            .window_rect(&session_id)
            .and_then(|window| {
                let (from, to) = swipe_path(&window, direction);
                self.transport
                    .perform_actions(&session_id, &pointer_swipe(from, to, SWIPE_DURATION_MS))
            })
            .map_err(|err| self.gesture_error(&format!("Scroll {} failed", direction.as_str()), err));
        let error = result.as_ref().err().map(|err| err.to_string());
        self.history
            .record("scroll", Some(direction.as_str()), started, error);
        result
    }

    pub fn back(&mut self) -> Result<(), AppError> {
        let session_id = self.validate_session()?;
        let started = Instant::now();
        let result = self
            .transport
            .back(&session_id)
            .map_err(|err| self.gesture_error("Back navigation failed", err));
        let error = result.as_ref().err().map(|err| err.to_string());
        self.history.record("back", None, started, error);
        result
    }

    pub fn screenshot(&mut self) -> Result<Vec<u8>, AppError> {
        let session_id = self.validate_session()?;
        let bytes = self
            .transport
            .screenshot(&session_id)
            .map_err(|err| err.into_app_error(&self.trace_id))?;
        ensure_png(&bytes).map_err(|msg| AppError::dependency(msg, &self.trace_id))?;
        Ok(bytes)
    }

    /// Fetches the UI tree. This is also the liveness probe used by every other operation.
    pub fn page_source(&mut self) -> Result<String, AppError> {
        let session_id = self.ensure_session()?;
        match self.transport.page_source(&session_id) {
            Ok(xml) => Ok(xml),
            Err(err) if err.is_session_terminated() => {
                warn!(trace_id = %self.trace_id, error = %err, "session terminated; recovering");
                let session_id = self.recover_session()?;
                self.transport
                    .page_source(&session_id)
                    .map_err(|err| err.into_app_error(&self.trace_id))
            }
            Err(err) => Err(AppError::session(
                format!("Session probe failed: {err}"),
                &self.trace_id,
            )),
        }
    }

    pub fn window_size(&mut self) -> Result<(u32, u32), AppError> {
        let session_id = self.validate_session()?;
        let rect = self
            .transport
            .window_rect(&session_id)
            .map_err(|err| err.into_app_error(&self.trace_id))?;
        Ok((rect.width.max(0.0) as u32, rect.height.max(0.0) as u32))
    }

    /// Foreground package, falling back to `dumpsys window` when the driver call fails.
    pub fn current_package(&mut self) -> Result<Option<String>, AppError> {
        let session_id = self.ensure_session()?;
        match self.transport.current_package(&session_id) {
            Ok(package) if !package.trim().is_empty() => return Ok(Some(package.trim().to_string())),
            Ok(_) => {}
            Err(err) if err.is_session_terminated() => {
                return Err(err.into_app_error(&self.trace_id));
            }
            Err(err) => {
                debug!(trace_id = %self.trace_id, error = %err, "current package query failed");
            }
        }
        Ok(self
            .dumpsys_windows(&session_id)
            .as_deref()
            .and_then(parse_focused_package))
    }

    pub fn current_activity(&mut self) -> Result<Option<String>, AppError> {
        let session_id = self.ensure_session()?;
        match self.transport.current_activity(&session_id) {
            Ok(activity) if !activity.trim().is_empty() => return Ok(Some(activity.trim().to_string())),
            Ok(_) => {}
            Err(err) if err.is_session_terminated() => {
                return Err(err.into_app_error(&self.trace_id));
            }
            Err(err) => {
                debug!(trace_id = %self.trace_id, error = %err, "current activity query failed");
            }
        }
        Ok(self
            .dumpsys_windows(&session_id)
            .as_deref()
            .and_then(parse_focused_activity)
            .map(|(_, activity)| activity))
    }

    fn dumpsys_windows(&mut self, session_id: &str) -> Option<String> {
        let dumpsys = self.transport.execute(
            session_id,
            "mobile: shell",
            &json!({ "command": "dumpsys", "args": ["window", "windows"] }),
        );
        match dumpsys {
            Ok(Value::String(output)) => Some(output),
            Ok(_) => None,
            Err(err) => {
                debug!(trace_id = %self.trace_id, error = %err, "dumpsys focus query failed");
                None
            }
        }
    }
}

/// Clamps into the window; points inside the edge margin are kept but logged.
pub fn validate_coordinates(x: i64, y: i64, window: &Rect, trace_id: &str) -> (i64, i64) {
    let min_x = window.x.round() as i64;
    let min_y = window.y.round() as i64;
    let max_x = (window.x + window.width).round() as i64 - 1;
    let max_y = (window.y + window.height).round() as i64 - 1;
    let clamped = (x.clamp(min_x, max_x.max(min_x)), y.clamp(min_y, max_y.max(min_y)));

    let margin_x = (window.width * EDGE_MARGIN_RATIO).round() as i64;
    let margin_y = (window.height * EDGE_MARGIN_RATIO).round() as i64;
    if clamped.0 < min_x + margin_x
        || clamped.0 > max_x - margin_x
        || clamped.1 < min_y + margin_y
        || clamped.1 > max_y - margin_y
    {
        warn!(trace_id = %trace_id, x = clamped.0, y = clamped.1, "tap point near screen edge");
    }
    clamped
}

fn swipe_path(window: &Rect, direction: ScrollDirection) -> ((i64, i64), (i64, i64)) {
    let at = |fx: f64, fy: f64| {
        (
            (window.x + window.width * fx).round() as i64,
            (window.y + window.height * fy).round() as i64,
        )
    };
    match direction {
        ScrollDirection::Down => (at(0.5, 0.8), at(0.5, 0.2)),
        ScrollDirection::Up => (at(0.5, 0.2), at(0.5, 0.8)),
        ScrollDirection::Left => (at(0.2, 0.5), at(0.8, 0.5)),
        ScrollDirection::Right => (at(0.8, 0.5), at(0.2, 0.5)),
    }
}

fn touch_pointer(actions: Vec<Value>) -> Value {
    json!([{
        "type": "pointer",
        "id": "finger1",
        "parameters": { "pointerType": "touch" },
        "actions": actions,
    }])
}

fn pointer_tap(x: i64, y: i64) -> Value {
    touch_pointer(vec![
        json!({ "type": "pointerMove", "duration": 0, "x": x, "y": y }),
        json!({ "type": "pointerDown", "button": 0 }),
        json!({ "type": "pause", "duration": 100 }),
        json!({ "type": "pointerUp", "button": 0 }),
    ])
}

fn pointer_swipe(from: (i64, i64), to: (i64, i64), duration_ms: u64) -> Value {
    touch_pointer(vec![
        json!({ "type": "pointerMove", "duration": 0, "x": from.0, "y": from.1 }),
        json!({ "type": "pointerDown", "button": 0 }),
        json!({ "type": "pointerMove", "duration": duration_ms, "x": to.0, "y": to.1 }),
        json!({ "type": "pointerUp", "button": 0 }),
    ])
}
