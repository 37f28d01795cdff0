use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::blocking::Client;
use reqwest::Method;
use serde_json::{json, Value};
use tracing::debug;

use super::{ElementRef, Locator, Rect, WebDriverError, WebDriverResult, WebDriverTransport};
use crate::app::capabilities::Capabilities;

const W3C_ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";
const LEGACY_ELEMENT_KEY: &str = "ELEMENT";

/// Blocking W3C/Appium client over HTTP.
pub struct HttpWebDriver {
    client: Client,
    base_url: String,
}

impl HttpWebDriver {
    pub fn new(request_timeout: Duration) -> WebDriverResult<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|err| WebDriverError::Transport(err.to_string()))?;
        Ok(Self {
            client,
            base_url: String::new(),
        })
    }

    fn send(&self, method: Method, path: &str, body: Option<Value>) -> WebDriverResult<Value> {
        if self.base_url.is_empty() {
            return Err(WebDriverError::InvalidSession("no server url".to_string()));
        }
        let url = format!("{}{}", self.base_url, path);
        debug!(method = %method, url = %url, "webdriver request");
        let mut request = self.client.request(method, &url);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send()?;
        let status = response.status();
        let payload: Value = response.json()?;
        let value = payload.get("value").cloned().unwrap_or(Value::Null);

        if status.is_success() {
            return Ok(value);
        }
        let error = value
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        let message = value
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default();
        Err(WebDriverError::from_w3c(error, message))
    }

    fn session_path(session_id: &str, tail: &str) -> String {
        format!("/session/{session_id}{tail}")
    }

    fn element_path(session_id: &str, element: &ElementRef, tail: &str) -> String {
        format!("/session/{session_id}/element/{}{tail}", element.0)
    }
}

fn parse_rect(value: &Value) -> WebDriverResult<Rect> {
    let field = |name: &str| {
        value
            .get(name)
            .and_then(Value::as_f64)
            .ok_or_else(|| WebDriverError::Decode(format!("rect missing {name}")))
    };
    Ok(Rect {
        x: field("x")?,
        y: field("y")?,
        width: field("width")?,
        height: field("height")?,
    })
}

fn parse_string(value: Value, what: &str) -> WebDriverResult<String> {
    match value {
        Value::String(text) => Ok(text),
        other => Err(WebDriverError::Decode(format!("{what}: expected string, got {other}"))),
    }
}

impl WebDriverTransport for HttpWebDriver {
    fn create_session(
        &mut self,
        server_url: &str,
        capabilities: &Capabilities,
    ) -> WebDriverResult<String> {
        self.base_url = server_url.trim_end_matches('/').to_string();
        let value = self.send(Method::POST, "/session", Some(capabilities.to_w3c()))?;
        value
            .get("sessionId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| WebDriverError::SessionNotCreated("response missing sessionId".into()))
    }

    fn delete_session(&mut self, session_id: &str) -> WebDriverResult<()> {
        self.send(Method::DELETE, &Self::session_path(session_id, ""), None)?;
        Ok(())
    }

    fn find_element(&mut self, session_id: &str, locator: &Locator) -> WebDriverResult<ElementRef> {
        let value = self.send(
            Method::POST,
            &Self::session_path(session_id, "/element"),
            Some(json!({ "using": locator.strategy.using(), "value": locator.value })),
        )?;
        value
            .get(W3C_ELEMENT_KEY)
            .or_else(|| value.get(LEGACY_ELEMENT_KEY))
            .and_then(Value::as_str)
            .map(|id| ElementRef(id.to_string()))
            .ok_or_else(|| WebDriverError::Decode("element reference missing".to_string()))
    }

    fn is_displayed(&mut self, session_id: &str, element: &ElementRef) -> WebDriverResult<bool> {
        let value = self.send(
            Method::GET,
            &Self::element_path(session_id, element, "/displayed"),
            None,
        )?;
        Ok(value.as_bool().unwrap_or(false))
    }

    fn element_rect(&mut self, session_id: &str, element: &ElementRef) -> WebDriverResult<Rect> {
        let value = self.send(Method::GET, &Self::element_path(session_id, element, "/rect"), None)?;
        parse_rect(&value)
    }

    fn click(&mut self, session_id: &str, element: &ElementRef) -> WebDriverResult<()> {
        self.send(
            Method::POST,
            &Self::element_path(session_id, element, "/click"),
            Some(json!({})),
        )?;
        Ok(())
    }

    fn clear(&mut self, session_id: &str, element: &ElementRef) -> WebDriverResult<()> {
        self.send(
            Method::POST,
            &Self::element_path(session_id, element, "/clear"),
            Some(json!({})),
        )?;
        Ok(())
    }

    fn send_keys(
        &mut self,
        session_id: &str,
        element: &ElementRef,
        text: &str,
    ) -> WebDriverResult<()> {
        self.send(
            Method::POST,
            &Self::element_path(session_id, element, "/value"),
            Some(json!({ "text": text })),
        )?;
        Ok(())
    }

    fn perform_actions(&mut self, session_id: &str, actions: &Value) -> WebDriverResult<()> {
        self.send(
            Method::POST,
            &Self::session_path(session_id, "/actions"),
            Some(json!({ "actions": actions })),
        )?;
        Ok(())
    }

    fn execute(&mut self, session_id: &str, script: &str, args: &Value) -> WebDriverResult<Value> {
        let args = match args {
            Value::Array(_) => args.clone(),
            Value::Null => json!([]),
            other => json!([other]),
        };
        self.send(
            Method::POST,
            &Self::session_path(session_id, "/execute/sync"),
            Some(json!({ "script": script, "args": args })),
        )
    }

    fn back(&mut self, session_id: &str) -> WebDriverResult<()> {
        self.send(Method::POST, &Self::session_path(session_id, "/back"), Some(json!({})))?;
        Ok(())
    }

    fn screenshot(&mut self, session_id: &str) -> WebDriverResult<Vec<u8>> {
        let value = self.send(Method::GET, &Self::session_path(session_id, "/screenshot"), None)?;
        let encoded = parse_string(value, "screenshot")?;
        STANDARD
            .decode(encoded.trim())
            .map_err(|err| WebDriverError::Decode(format!("screenshot base64: {err}")))
    }

    fn page_source(&mut self, session_id: &str) -> WebDriverResult<String> {
        let value = self.send(Method::GET, &Self::session_path(session_id, "/source"), None)?;
        parse_string(value, "page source")
    }

    fn window_rect(&mut self, session_id: &str) -> WebDriverResult<Rect> {
        let value = self.send(Method::GET, &Self::session_path(session_id, "/window/rect"), None)?;
        parse_rect(&value)
    }

    fn current_package(&mut self, session_id: &str) -> WebDriverResult<String> {
        let value = self.send(
            Method::GET,
            &Self::session_path(session_id, "/appium/device/current_package"),
            None,
        )?;
        parse_string(value, "current package")
    }

    fn current_activity(&mut self, session_id: &str) -> WebDriverResult<String> {
        let value = self.send(
            Method::GET,
            &Self::session_path(session_id, "/appium/device/current_activity"),
            None,
        )?;
        parse_string(value, "current activity")
    }

    fn activate_app(&mut self, session_id: &str, package: &str) -> WebDriverResult<()> {
        self.send(
            Method::POST,
            &Self::session_path(session_id, "/appium/device/activate_app"),
            Some(json!({ "appId": package })),
        )?;
        Ok(())
    }

    fn hide_keyboard(&mut self, session_id: &str) -> WebDriverResult<()> {
        self.send(
            Method::POST,
            &Self::session_path(session_id, "/appium/device/hide_keyboard"),
            Some(json!({})),
        )?;
        Ok(())
    }

    fn update_settings(&mut self, session_id: &str, settings: &Value) -> WebDriverResult<()> {
        self.send(
            Method::POST,
            &Self::session_path(session_id, "/appium/settings"),
            Some(json!({ "settings": settings })),
        )?;
        Ok(())
    }

    fn start_recording_screen(&mut self, session_id: &str) -> WebDriverResult<()> {
        self.send(
            Method::POST,
            &Self::session_path(session_id, "/appium/start_recording_screen"),
            Some(json!({ "options": {} })),
        )?;
        Ok(())
    }

    fn stop_recording_screen(&mut self, session_id: &str) -> WebDriverResult<String> {
        let value = self.send(
            Method::POST,
            &Self::session_path(session_id, "/appium/stop_recording_screen"),
            Some(json!({ "options": {} })),
        )?;
        parse_string(value, "screen recording")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rects_and_rejects_partial_ones() {
        let rect = parse_rect(&json!({"x": 10, "y": 20, "width": 100, "height": 50})).expect("rect");
        assert_eq!(rect.center(), (60, 45));
        let err = parse_rect(&json!({"x": 1, "y": 2})).expect_err("partial");
        assert!(matches!(err, WebDriverError::Decode(_)));
    }

    #[test]
    fn requests_without_session_url_fail_fast() {
        let driver = HttpWebDriver::new(Duration::from_secs(1)).expect("client");
        let err = driver.send(Method::GET, "/status", None).expect_err("no url");
        assert!(err.is_session_terminated());
    }
}
