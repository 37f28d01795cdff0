use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::app::config::CrawlConfig;
use crate::app::device::ANDROID_PLATFORM;
use crate::app::error::AppError;
use crate::app::models::Device;

pub const AUTOMATION_ENGINE: &str = "UiAutomator2";
const APPIUM_PREFIX: &str = "appium:";

/// Session capabilities. Built once per session attempt and kept verbatim for recovery.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capabilities(Map<String, Value>);

impl Capabilities {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `key`, adding the `appium:` vendor prefix to non-standard names.
    pub fn set(&mut self, key: &str, value: impl Into<Value>) -> &mut Self {
        self.0.insert(qualify(key), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(&qualify(key))
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn udid(&self) -> Option<&str> {
        self.get_str("udid")
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `{"capabilities": {"alwaysMatch": {...}, "firstMatch": [{}]}}`
    pub fn to_w3c(&self) -> Value {
        json!({
            "capabilities": {
                "alwaysMatch": Value::Object(self.0.clone()),
                "firstMatch": [{}],
            }
        })
    }
}

fn qualify(key: &str) -> String {
    const STANDARD: [&str; 4] = ["platformName", "browserName", "browserVersion", "acceptInsecureCerts"];
    if STANDARD.contains(&key) || key.contains(':') {
        key.to_string()
    } else {
        format!("{APPIUM_PREFIX}{key}")
    }
}

pub fn build_capabilities(device: &Device, config: &CrawlConfig) -> Capabilities {
    let mut caps = Capabilities::new();
    caps.set("platformName", ANDROID_PLATFORM)
        .set("automationName", AUTOMATION_ENGINE)
        .set("deviceName", device.name.clone())
        .set("udid", device.id.clone())
        .set("newCommandTimeout", config.server.new_command_timeout_secs)
        .set("noReset", true)
        .set("autoGrantPermissions", true)
        .set("ignoreHiddenApiPolicyError", true)
        .set("allowTestPackages", true)
        .set("allowInsecure", json!(["adb_shell"]))
        .set("systemPort", config.server.system_port);
    if let Some(version) = device.os_version.as_deref() {
        caps.set("platformVersion", version);
    }
    if !config.target.app_package.is_empty() {
        caps.set("appPackage", config.target.app_package.clone());
    }
    if !config.target.app_activity.is_empty() {
        caps.set("appActivity", config.target.app_activity.clone());
    }
    caps
}

pub fn validate_capabilities(caps: &Capabilities, trace_id: &str) -> Result<(), AppError> {
    let platform = caps
        .get_str("platformName")
        .ok_or_else(|| AppError::validation("Missing capability: platformName", trace_id))?;
    if caps.get_str("automationName").is_none() {
        return Err(AppError::validation("Missing capability: automationName", trace_id));
    }
    if !platform.eq_ignore_ascii_case(ANDROID_PLATFORM) {
        return Err(AppError::validation(
            format!("Unsupported platform: {platform}"),
            trace_id,
        ));
    }
    Ok(())
}

/// Driver settings pushed right after the session is created.
pub fn performance_settings() -> Value {
    json!({
        "waitForIdleTimeout": 0,
        "snapshotMaxDepth": 25,
        "ignoreUnimportantViews": true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::models::DeviceType;

    fn device() -> Device {
        Device {
            platform: "Android".to_string(),
            id: "emulator-5554".to_string(),
            name: "Pixel 7".to_string(),
            os_version: Some("14".to_string()),
            api_level: Some(34),
            device_type: DeviceType::Emulator,
        }
    }

    #[test]
    fn builds_prefixed_android_capabilities() {
        let mut config = CrawlConfig::default();
        config.target.app_package = "com.example.shop".to_string();
        let caps = build_capabilities(&device(), &config);
        assert_eq!(caps.get_str("platformName"), Some("Android"));
        assert_eq!(caps.get_str("appium:automationName"), Some("UiAutomator2"));
        assert_eq!(caps.udid(), Some("emulator-5554"));
        assert_eq!(caps.get_str("appPackage"), Some("com.example.shop"));
        assert!(caps.get("appActivity").is_none());
        assert_eq!(caps.get_str("platformVersion"), Some("14"));
        assert!(validate_capabilities(&caps, "t").is_ok());

        let w3c = caps.to_w3c();
        assert_eq!(w3c["capabilities"]["alwaysMatch"]["appium:noReset"], json!(true));
        assert_eq!(w3c["capabilities"]["firstMatch"], json!([{}]));
    }

    #[test]
    fn rejects_missing_or_foreign_platform() {
        let mut caps = Capabilities::new();
        caps.set("automationName", AUTOMATION_ENGINE);
        let err = validate_capabilities(&caps, "t").expect_err("missing platform");
        assert!(err.error.contains("platformName"));

        caps.set("platformName", "iOS");
        let err = validate_capabilities(&caps, "t").expect_err("foreign platform");
        assert_eq!(err.code, "ERR_VALIDATION");
    }
}
