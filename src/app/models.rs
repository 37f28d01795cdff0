use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Emulator,
    Device,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Device {
    pub platform: String,
    pub id: String,
    pub name: String,
    pub os_version: Option<String>,
    pub api_level: Option<u32>,
    pub device_type: DeviceType,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Click,
    Input,
    ScrollDown,
    ScrollUp,
    Back,
}

impl ActionKind {
    pub const ALL: [ActionKind; 5] = [
        ActionKind::Click,
        ActionKind::Input,
        ActionKind::ScrollDown,
        ActionKind::ScrollUp,
        ActionKind::Back,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Click => "click",
            ActionKind::Input => "input",
            ActionKind::ScrollDown => "scroll_down",
            ActionKind::ScrollUp => "scroll_up",
            ActionKind::Back => "back",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "click" | "tap" => Some(ActionKind::Click),
            "input" | "type" => Some(ActionKind::Input),
            "scroll_down" => Some(ActionKind::ScrollDown),
            "scroll_up" => Some(ActionKind::ScrollUp),
            "back" => Some(ActionKind::Back),
            _ => None,
        }
    }

    pub fn requires_target(&self) -> bool {
        matches!(self, ActionKind::Click | ActionKind::Input)
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Box in either normalized (0..=1) or absolute pixel coordinates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BoundingBox {
    pub top_left: (f64, f64),
    pub bottom_right: (f64, f64),
}

impl BoundingBox {
    pub fn is_normalized(&self) -> bool {
        [self.top_left.0, self.top_left.1, self.bottom_right.0, self.bottom_right.1]
            .iter()
            .all(|value| (0.0..=1.0).contains(value))
    }

    pub fn center(&self) -> (f64, f64) {
        (
            (self.top_left.0 + self.bottom_right.0) / 2.0,
            (self.top_left.1 + self.bottom_right.1) / 2.0,
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionSuggestion {
    pub action: ActionKind,
    #[serde(default)]
    pub target_identifier: Option<String>,
    #[serde(default)]
    pub input_text: Option<String>,
    #[serde(default)]
    pub target_bounding_box: Option<BoundingBox>,
    #[serde(default)]
    pub reasoning: Option<String>,
}

impl ActionSuggestion {
    pub fn back() -> Self {
        Self {
            action: ActionKind::Back,
            target_identifier: None,
            input_text: None,
            target_bounding_box: None,
            reasoning: None,
        }
    }

    /// `CLICK on 'login_button'`, `INPUT on 'email' with text 'a@b.c'`, `SCROLL_DOWN`.
    pub fn describe(&self) -> String {
        let kind = self.action.as_str().to_ascii_uppercase();
        let mut description = match self.target_identifier.as_deref() {
            Some(target) if !target.is_empty() => format!("{kind} on '{target}'"),
            _ => kind,
        };
        if self.action == ActionKind::Input {
            if let Some(text) = self.input_text.as_deref() {
                description.push_str(&format!(" with text '{text}'"));
            }
        }
        description
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionRecord {
    pub action: String,
    pub target: Option<String>,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u128,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    CompletedMaxSteps,
    CompletedMaxDuration,
    ShutdownFlagDetected,
    FailureMaxAiFail,
    FailureMaxMapFail,
    FailureMaxExecFail,
    FailureMaxContextFail,
    FailureSessionLost,
    FailedAppiumConnect,
    FailedNoDevice,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::CompletedMaxSteps => "COMPLETED_MAX_STEPS",
            RunStatus::CompletedMaxDuration => "COMPLETED_MAX_DURATION",
            RunStatus::ShutdownFlagDetected => "SHUTDOWN_FLAG_DETECTED",
            RunStatus::FailureMaxAiFail => "FAILURE_MAX_AI_FAIL",
            RunStatus::FailureMaxMapFail => "FAILURE_MAX_MAP_FAIL",
            RunStatus::FailureMaxExecFail => "FAILURE_MAX_EXEC_FAIL",
            RunStatus::FailureMaxContextFail => "FAILURE_MAX_CONTEXT_FAIL",
            RunStatus::FailureSessionLost => "FAILURE_SESSION_LOST",
            RunStatus::FailedAppiumConnect => "FAILED_APPIUM_CONNECT",
            RunStatus::FailedNoDevice => "FAILED_NO_DEVICE",
        }
    }

    /// Normal endings; everything else is reported as abnormal.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            RunStatus::CompletedMaxSteps
                | RunStatus::CompletedMaxDuration
                | RunStatus::ShutdownFlagDetected
        )
    }

    /// Setup failures that happen before the first step.
    pub fn is_setup_failure(&self) -> bool {
        matches!(self, RunStatus::FailedAppiumConnect | RunStatus::FailedNoDevice)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepReason {
    Executed,
    ExecutionFailed,
    CaptureFailed,
    HashFailed,
    OracleFailed,
    MappingFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepOutcome {
    pub step: u32,
    pub fingerprint: Option<String>,
    pub action: String,
    pub success: bool,
    pub reason: StepReason,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunReport {
    pub run_id: String,
    pub status: RunStatus,
    pub steps: u32,
    pub screens: usize,
    pub transitions: usize,
    pub duration_ms: u128,
    pub outcomes: Vec<StepOutcome>,
}

impl RunReport {
    pub fn success(&self) -> bool {
        self.status.is_success()
    }
}
