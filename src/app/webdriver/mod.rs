pub mod client;
pub mod error;
pub mod locator;

#[cfg(test)]
pub mod fake;

use serde_json::Value;

use crate::app::capabilities::Capabilities;
pub use error::{WebDriverError, WebDriverResult};
pub use locator::{Locator, Strategy};

/// Opaque element id returned by the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ElementRef(pub String);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn center(&self) -> (i64, i64) {
        (
            (self.x + self.width / 2.0).round() as i64,
            (self.y + self.height / 2.0).round() as i64,
        )
    }
}

/// The automation-server commands the session client needs. One implementation speaks
/// HTTP; tests script an in-memory one.
pub trait WebDriverTransport: Send {
    fn create_session(&mut self, server_url: &str, capabilities: &Capabilities)
        -> WebDriverResult<String>;
    fn delete_session(&mut self, session_id: &str) -> WebDriverResult<()>;

    fn find_element(&mut self, session_id: &str, locator: &Locator) -> WebDriverResult<ElementRef>;
    fn is_displayed(&mut self, session_id: &str, element: &ElementRef) -> WebDriverResult<bool>;
    fn element_rect(&mut self, session_id: &str, element: &ElementRef) -> WebDriverResult<Rect>;
    fn click(&mut self, session_id: &str, element: &ElementRef) -> WebDriverResult<()>;
    fn clear(&mut self, session_id: &str, element: &ElementRef) -> WebDriverResult<()>;
    fn send_keys(&mut self, session_id: &str, element: &ElementRef, text: &str)
        -> WebDriverResult<()>;

    fn perform_actions(&mut self, session_id: &str, actions: &Value) -> WebDriverResult<()>;
    fn execute(&mut self, session_id: &str, script: &str, args: &Value) -> WebDriverResult<Value>;
    fn back(&mut self, session_id: &str) -> WebDriverResult<()>;

    /// Decoded PNG bytes.
    fn screenshot(&mut self, session_id: &str) -> WebDriverResult<Vec<u8>>;
    fn page_source(&mut self, session_id: &str) -> WebDriverResult<String>;
    fn window_rect(&mut self, session_id: &str) -> WebDriverResult<Rect>;

    fn current_package(&mut self, session_id: &str) -> WebDriverResult<String>;
    fn current_activity(&mut self, session_id: &str) -> WebDriverResult<String>;
    fn activate_app(&mut self, session_id: &str, package: &str) -> WebDriverResult<()>;
    fn hide_keyboard(&mut self, session_id: &str) -> WebDriverResult<()>;
    fn update_settings(&mut self, session_id: &str, settings: &Value) -> WebDriverResult<()>;

    fn start_recording_screen(&mut self, session_id: &str) -> WebDriverResult<()>;
    /// Base64-encoded video of everything recorded since the start call.
    fn stop_recording_screen(&mut self, session_id: &str) -> WebDriverResult<String>;
}
