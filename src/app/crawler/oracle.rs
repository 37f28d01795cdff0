use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::app::config::OracleSettings;
use crate::app::error::AppError;
use crate::app::models::{ActionKind, ActionSuggestion, BoundingBox};
use crate::app::ui_capture::png_to_base64;

const MAX_SEND_RETRIES: usize = 2;
const RETRY_BASE_DELAY_MS: u64 = 500;

/// Everything the oracle sees for one step.
#[derive(Debug, Clone, Copy)]
pub struct OracleRequest<'a> {
    pub screenshot: &'a [u8],
    pub xml_snippet: &'a str,
    pub action_history: &'a [String],
    pub available_actions: &'a [ActionKind],
    pub visit_count: u32,
    pub screen_id: &'a str,
    pub last_action_feedback: Option<&'a str>,
}

pub trait DecisionOracle {
    fn suggest_action(&mut self, request: &OracleRequest<'_>) -> Result<ActionSuggestion, AppError>;
}

#[derive(Serialize)]
struct SuggestPayload<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    screenshot_base64: String,
    xml_snippet: &'a str,
    action_history: &'a [String],
    available_actions: Vec<&'static str>,
    visit_count: u32,
    screen_id: &'a str,
    last_action_feedback: Option<&'a str>,
}

#[derive(Deserialize)]
struct WireSuggestion {
    action: String,
    #[serde(default)]
    target_identifier: Option<String>,
    #[serde(default)]
    input_text: Option<String>,
    #[serde(default)]
    target_bounding_box: Option<BoundingBox>,
    #[serde(default)]
    reasoning: Option<String>,
}

fn blank_to_none(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

/// Accepts the suggestion at the top level or under `suggestion`/`action_to_perform`.
pub fn parse_suggestion(body: &Value) -> Result<ActionSuggestion, String> {
    let candidate = ["suggestion", "action_to_perform"]
        .iter()
        .find_map(|key| body.get(*key).filter(|value| value.is_object()))
        .unwrap_or(body);
    let wire: WireSuggestion = serde_json::from_value(candidate.clone())
        .map_err(|err| format!("Malformed oracle suggestion: {err}"))?;
    let action = ActionKind::parse(&wire.action)
        .ok_or_else(|| format!("Unknown action kind: {}", wire.action))?;
    Ok(ActionSuggestion {
        action,
        target_identifier: blank_to_none(wire.target_identifier),
        input_text: wire.input_text,
        target_bounding_box: wire.target_bounding_box,
        reasoning: blank_to_none(wire.reasoning),
    })
}

/// Posts each step to an HTTP decision service.
pub struct HttpOracle {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    model: Option<String>,
    trace_id: String,
}

impl HttpOracle {
    pub fn from_settings(settings: &OracleSettings, trace_id: &str) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs.max(1)))
            .build()
            .map_err(|err| AppError::dependency(format!("Failed to build oracle client: {err}"), trace_id))?;
        let api_key = Some(settings.api_key_env.trim())
            .filter(|name| !name.is_empty())
            .and_then(|name| std::env::var(name).ok())
            .filter(|key| !key.trim().is_empty());
        Ok(Self {
            client,
            endpoint: settings.endpoint.trim().to_string(),
            api_key,
            model: Some(settings.model.trim().to_string()).filter(|model| !model.is_empty()),
            trace_id: trace_id.to_string(),
        })
    }

    fn post(&self, payload: &SuggestPayload<'_>) -> Result<Value, String> {
        let mut last_error = String::new();
        for attempt in 0..MAX_SEND_RETRIES {
            let mut request = self.client.post(&self.endpoint).json(payload);
            if let Some(key) = &self.api_key {
                request = request.bearer_auth(key);
            }
            match request.send() {
                Ok(response) if response.status().is_success() => {
                    return response
                        .json::<Value>()
                        .map_err(|err| format!("Oracle returned invalid JSON: {err}"));
                }
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().unwrap_or_default();
                    // Client errors will not improve on retry.
                    if status.is_client_error() {
                        return Err(format!("Oracle rejected request ({status}): {body}"));
                    }
                    last_error = format!("Oracle error ({status}): {body}");
                }
                Err(err) => last_error = format!("Oracle request failed: {err}"),
            }
            if attempt + 1 < MAX_SEND_RETRIES {
                warn!(trace_id = %self.trace_id, attempt, error = %last_error, "retrying oracle request");
                thread::sleep(Duration::from_millis(RETRY_BASE_DELAY_MS * (attempt as u64 + 1)));
            }
        }
        Err(last_error)
    }
}

impl DecisionOracle for HttpOracle {
    fn suggest_action(&mut self, request: &OracleRequest<'_>) -> Result<ActionSuggestion, AppError> {
        let screenshot_base64 =
            png_to_base64(request.screenshot).map_err(|msg| AppError::oracle(msg, &self.trace_id))?;
        let payload = SuggestPayload {
            model: self.model.as_deref(),
            screenshot_base64,
            xml_snippet: request.xml_snippet,
            action_history: request.action_history,
            available_actions: request.available_actions.iter().map(ActionKind::as_str).collect(),
            visit_count: request.visit_count,
            screen_id: request.screen_id,
            last_action_feedback: request.last_action_feedback,
        };
        let body = self
            .post(&payload)
            .map_err(|msg| AppError::oracle(msg, &self.trace_id))?;
        let suggestion = parse_suggestion(&body).map_err(|msg| AppError::oracle(msg, &self.trace_id))?;
        debug!(
            trace_id = %self.trace_id,
            action = %suggestion.action,
            target = ?suggestion.target_identifier,
            "oracle suggestion"
        );
        Ok(suggestion)
    }
}
