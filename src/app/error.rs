use serde::Serialize;
use std::fmt;

pub const ERR_VALIDATION: &str = "ERR_VALIDATION";
pub const ERR_DEPENDENCY: &str = "ERR_DEPENDENCY";
pub const ERR_SYSTEM: &str = "ERR_SYSTEM";
pub const ERR_ELEMENT_NOT_FOUND: &str = "ERR_ELEMENT_NOT_FOUND";
pub const ERR_SESSION: &str = "ERR_SESSION";
pub const ERR_SESSION_INIT: &str = "ERR_SESSION_INIT";
pub const ERR_GESTURE: &str = "ERR_GESTURE";
pub const ERR_DEVICE_NOT_FOUND: &str = "ERR_DEVICE_NOT_FOUND";
pub const ERR_ORACLE: &str = "ERR_ORACLE";
pub const ERR_APP_CONTEXT: &str = "ERR_APP_CONTEXT";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AppError {
    pub error: String,
    pub code: String,
    pub trace_id: String,
}

impl AppError {
    pub fn new(code: impl Into<String>, message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            code: code.into(),
            trace_id: trace_id.into(),
        }
    }

    pub fn validation(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_VALIDATION, message, trace_id)
    }

    pub fn dependency(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_DEPENDENCY, message, trace_id)
    }

    pub fn system(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_SYSTEM, message, trace_id)
    }

    pub fn element_not_found(selector: &str, trace_id: impl Into<String>) -> Self {
        Self::new(
            ERR_ELEMENT_NOT_FOUND,
            format!("Element not found: {selector}"),
            trace_id,
        )
    }

    pub fn session(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_SESSION, message, trace_id)
    }

    pub fn session_init(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_SESSION_INIT, message, trace_id)
    }

    pub fn gesture(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_GESTURE, message, trace_id)
    }

    pub fn device_not_found(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_DEVICE_NOT_FOUND, message, trace_id)
    }

    pub fn oracle(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_ORACLE, message, trace_id)
    }

    pub fn app_context(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_APP_CONTEXT, message, trace_id)
    }

    pub fn is(&self, code: &str) -> bool {
        self.code == code
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.error, self.code)
    }
}

impl std::error::Error for AppError {}
