//! Scriptable in-memory automation server for tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;

use super::{ElementRef, Locator, Rect, Strategy, WebDriverError, WebDriverResult, WebDriverTransport};
use crate::app::capabilities::Capabilities;

#[derive(Debug, Default)]
pub struct FakeState {
    pub calls: Vec<String>,
    pub sessions_created: u32,
    pub create_failures: VecDeque<WebDriverError>,
    pub elements: HashMap<(Strategy, String), ElementRef>,
    pub find_errors: HashMap<(Strategy, String), WebDriverError>,
    pub rects: HashMap<String, Rect>,
    pub failing_clicks: HashSet<String>,
    pub fail_pointer_actions: bool,
    pub fail_mobile_tap: bool,
    pub page_sources: VecDeque<WebDriverResult<String>>,
    pub default_source: String,
    pub screenshots: VecDeque<WebDriverResult<Vec<u8>>>,
    pub default_screenshot: Vec<u8>,
    pub packages: VecDeque<WebDriverResult<String>>,
    pub default_package: String,
    pub activity: String,
    pub typed: Vec<(String, String)>,
    pub fail_start_activity: bool,
    pub window: Option<Rect>,
    pub recording: bool,
    pub recorded_video: String,
    pub fail_recording: bool,
}

#[derive(Clone, Default)]
pub struct FakeDriver {
    state: Arc<Mutex<FakeState>>,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake state")
    }

    pub fn add_element(&self, locator: Locator, id: &str) {
        self.state()
            .elements
            .insert((locator.strategy, locator.value), ElementRef(id.to_string()));
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    fn record(&self, call: String) {
        self.state().calls.push(call);
    }
}

impl WebDriverTransport for FakeDriver {
    fn create_session(&mut self, _server_url: &str, _caps: &Capabilities) -> WebDriverResult<String> {
        self.record("create_session".to_string());
        let mut state = self.state();
        if let Some(err) = state.create_failures.pop_front() {
            return Err(err);
        }
        state.sessions_created += 1;
        Ok(format!("session-{}", state.sessions_created))
    }

    fn delete_session(&mut self, session_id: &str) -> WebDriverResult<()> {
        self.record(format!("delete_session {session_id}"));
        Ok(())
    }

    fn find_element(&mut self, _session_id: &str, locator: &Locator) -> WebDriverResult<ElementRef> {
        self.record(format!("find {locator}"));
        let state = self.state();
        let key = (locator.strategy, locator.value.clone());
        if let Some(err) = state.find_errors.get(&key) {
            return Err(err.clone());
        }
        state
            .elements
            .get(&key)
            .cloned()
            .ok_or_else(|| WebDriverError::NoSuchElement(locator.to_string()))
    }

    fn is_displayed(&mut self, _session_id: &str, _element: &ElementRef) -> WebDriverResult<bool> {
        Ok(true)
    }

    fn element_rect(&mut self, _session_id: &str, element: &ElementRef) -> WebDriverResult<Rect> {
        Ok(self.state().rects.get(&element.0).copied().unwrap_or(Rect {
            x: 100.0,
            y: 200.0,
            width: 50.0,
            height: 20.0,
        }))
    }

    fn click(&mut self, _session_id: &str, element: &ElementRef) -> WebDriverResult<()> {
        self.record(format!("click {}", element.0));
        if self.state().failing_clicks.contains(&element.0) {
            return Err(WebDriverError::Protocol {
                error: "element not interactable".to_string(),
                message: element.0.clone(),
            });
        }
        Ok(())
    }

    fn clear(&mut self, _session_id: &str, element: &ElementRef) -> WebDriverResult<()> {
        self.record(format!("clear {}", element.0));
        Ok(())
    }

    fn send_keys(&mut self, _session_id: &str, element: &ElementRef, text: &str) -> WebDriverResult<()> {
        self.record(format!("send_keys {}", element.0));
        self.state().typed.push((element.0.clone(), text.to_string()));
        Ok(())
    }

    fn perform_actions(&mut self, _session_id: &str, _actions: &Value) -> WebDriverResult<()> {
        self.record("perform_actions".to_string());
        if self.state().fail_pointer_actions {
            return Err(WebDriverError::Protocol {
                error: "unknown error".to_string(),
                message: "pointer actions rejected".to_string(),
            });
        }
        Ok(())
    }

    fn execute(&mut self, _session_id: &str, script: &str, _args: &Value) -> WebDriverResult<Value> {
        self.record(format!("execute {script}"));
        let state = self.state();
        match script {
            "mobile: tap" if state.fail_mobile_tap => Err(WebDriverError::Protocol {
                error: "unknown error".to_string(),
                message: "mobile tap rejected".to_string(),
            }),
            "mobile: startActivity" if state.fail_start_activity => Err(WebDriverError::Protocol {
                error: "unknown error".to_string(),
                message: "cannot start".to_string(),
            }),
            _ => Ok(Value::Null),
        }
    }

    fn back(&mut self, _session_id: &str) -> WebDriverResult<()> {
        self.record("back".to_string());
        Ok(())
    }

    fn screenshot(&mut self, _session_id: &str) -> WebDriverResult<Vec<u8>> {
        self.record("screenshot".to_string());
        let mut state = self.state();
        match state.screenshots.pop_front() {
            Some(result) => result,
            None => Ok(state.default_screenshot.clone()),
        }
    }

    fn page_source(&mut self, _session_id: &str) -> WebDriverResult<String> {
        self.record("page_source".to_string());
        let mut state = self.state();
        match state.page_sources.pop_front() {
            Some(result) => result,
            None => Ok(state.default_source.clone()),
        }
    }

    fn window_rect(&mut self, _session_id: &str) -> WebDriverResult<Rect> {
        Ok(self.state().window.unwrap_or(Rect {
            x: 0.0,
            y: 0.0,
            width: 1080.0,
            height: 2400.0,
        }))
    }

    fn current_package(&mut self, _session_id: &str) -> WebDriverResult<String> {
        self.record("current_package".to_string());
        let mut state = self.state();
        match state.packages.pop_front() {
            Some(result) => result,
            None => Ok(state.default_package.clone()),
        }
    }

    fn current_activity(&mut self, _session_id: &str) -> WebDriverResult<String> {
        Ok(self.state().activity.clone())
    }

    fn activate_app(&mut self, _session_id: &str, package: &str) -> WebDriverResult<()> {
        self.record(format!("activate_app {package}"));
        Ok(())
    }

    fn hide_keyboard(&mut self, _session_id: &str) -> WebDriverResult<()> {
        self.record("hide_keyboard".to_string());
        Ok(())
    }

    fn update_settings(&mut self, _session_id: &str, _settings: &Value) -> WebDriverResult<()> {
        self.record("update_settings".to_string());
        Ok(())
    }

    fn start_recording_screen(&mut self, _session_id: &str) -> WebDriverResult<()> {
        self.record("start_recording_screen".to_string());
        let mut state = self.state();
        if state.fail_recording {
            return Err(WebDriverError::Protocol {
                error: "unknown error".to_string(),
                message: "screenrecord unavailable".to_string(),
            });
        }
        state.recording = true;
        Ok(())
    }

    fn stop_recording_screen(&mut self, _session_id: &str) -> WebDriverResult<String> {
        self.record("stop_recording_screen".to_string());
        let mut state = self.state();
        state.recording = false;
        Ok(state.recorded_video.clone())
    }
}
