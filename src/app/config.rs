use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::app::error::AppError;

pub const CONFIG_PATH_ENV: &str = "APP_TRAVERSER_CONFIG";
pub const MIN_XML_SNIPPET_LEN: usize = 5000;
pub const SHUTDOWN_FLAG_NAME: &str = "crawler_shutdown.flag";
pub const PAUSE_FLAG_NAME: &str = "crawler_pause.flag";
pub const PID_FILE_NAME: &str = "crawler.pid";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TargetSettings {
    pub app_package: String,
    pub app_activity: String,
    pub allowed_external_packages: Vec<String>,
}

impl Default for TargetSettings {
    fn default() -> Self {
        Self {
            app_package: String::new(),
            app_activity: String::new(),
            allowed_external_packages: vec![
                "com.android.systemui".to_string(),
                "com.google.android.permissioncontroller".to_string(),
                "com.android.permissioncontroller".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerSettings {
    pub url: String,
    pub new_command_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub system_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:4723".to_string(),
            new_command_timeout_secs: 300,
            request_timeout_secs: 30,
            system_port: 8200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeviceSettings {
    pub adb_path: String,
    pub udid: String,
    pub name_hint: String,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            adb_path: "adb".to_string(),
            udid: String::new(),
            name_hint: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CrawlSettings {
    pub max_steps: u32,
    pub max_duration_secs: u64,
    pub max_consecutive_ai_failures: u32,
    pub max_consecutive_map_failures: u32,
    pub max_consecutive_exec_failures: u32,
    pub max_consecutive_context_failures: u32,
    pub wait_after_action_ms: u64,
    pub stability_wait_ms: u64,
    pub visual_similarity_threshold: i64,
    pub xml_snippet_max_len: usize,
    pub enable_annotations: bool,
    pub enable_video_recording: bool,
}

impl Default for CrawlSettings {
    fn default() -> Self {
        Self {
            max_steps: 50,
            max_duration_secs: 0,
            max_consecutive_ai_failures: 5,
            max_consecutive_map_failures: 5,
            max_consecutive_exec_failures: 5,
            max_consecutive_context_failures: 3,
            wait_after_action_ms: 2500,
            stability_wait_ms: 1000,
            visual_similarity_threshold: 5,
            xml_snippet_max_len: 20_000,
            enable_annotations: true,
            enable_video_recording: false,
        }
    }
}

impl CrawlSettings {
    pub fn wait_after_action(&self) -> Duration {
        Duration::from_millis(self.wait_after_action_ms)
    }

    pub fn stability_wait(&self) -> Duration {
        Duration::from_millis(self.stability_wait_ms)
    }

    pub fn max_duration(&self) -> Option<Duration> {
        (self.max_duration_secs > 0).then(|| Duration::from_secs(self.max_duration_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionSettings {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub action_history_len: usize,
    pub element_wait_secs: u64,
    pub id_wait_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1000,
            action_history_len: 100,
            element_wait_secs: 5,
            id_wait_secs: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OracleSettings {
    pub endpoint: String,
    pub api_key_env: String,
    pub model: String,
    pub request_timeout_secs: u64,
}

impl Default for OracleSettings {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8765/suggest".to_string(),
            api_key_env: "TRAVERSER_ORACLE_API_KEY".to_string(),
            model: String::new(),
            request_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct OutputSettings {
    pub output_dir: String,
    pub shutdown_flag_path: String,
    pub pause_flag_path: String,
    pub pid_file_path: String,
}

impl OutputSettings {
    pub fn output_dir(&self) -> PathBuf {
        if self.output_dir.trim().is_empty() {
            PathBuf::from("output_data")
        } else {
            PathBuf::from(self.output_dir.trim())
        }
    }

    fn under_output(&self, explicit: &str, default_name: &str) -> PathBuf {
        if explicit.trim().is_empty() {
            self.output_dir().join(default_name)
        } else {
            PathBuf::from(explicit.trim())
        }
    }

    pub fn shutdown_flag(&self) -> PathBuf {
        self.under_output(&self.shutdown_flag_path, SHUTDOWN_FLAG_NAME)
    }

    pub fn pause_flag(&self) -> PathBuf {
        self.under_output(&self.pause_flag_path, PAUSE_FLAG_NAME)
    }

    pub fn pid_file(&self) -> PathBuf {
        self.under_output(&self.pid_file_path, PID_FILE_NAME)
    }

    pub fn screenshots_dir(&self) -> PathBuf {
        self.output_dir().join("screenshots")
    }

    pub fn annotated_dir(&self) -> PathBuf {
        self.output_dir().join("annotated")
    }

    pub fn videos_dir(&self) -> PathBuf {
        self.output_dir().join("videos")
    }

    pub fn database_path(&self) -> PathBuf {
        self.output_dir().join("crawl.db")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct CrawlConfig {
    pub target: TargetSettings,
    pub server: ServerSettings,
    pub device: DeviceSettings,
    pub crawl: CrawlSettings,
    pub session: SessionSettings,
    pub oracle: OracleSettings,
    pub output: OutputSettings,
}

pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    home.join(".app_traverser").join("config.json")
}

fn backup_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|value| value.to_os_string())
        .unwrap_or_default();
    name.push(".bak");
    path.with_file_name(name)
}

pub fn load_config(trace_id: &str) -> Result<CrawlConfig, AppError> {
    load_config_from_path(&config_path(), trace_id)
}

pub fn load_config_from_path(path: &Path, trace_id: &str) -> Result<CrawlConfig, AppError> {
    if !path.exists() {
        return Ok(CrawlConfig::default());
    }
    let raw = fs::read_to_string(path)
        .map_err(|err| AppError::system(format!("Failed to read config: {err}"), trace_id))?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|err| AppError::validation(format!("Failed to parse config: {err}"), trace_id))?;
    let config: CrawlConfig = serde_json::from_value(value.clone())
        .map_err(|err| AppError::validation(format!("Invalid config shape: {err}"), trace_id))?;
    Ok(validate_config(apply_flat_overrides(config, &value)))
}

pub fn save_config_to_path(
    config: &CrawlConfig,
    path: &Path,
    trace_id: &str,
) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| {
            AppError::system(format!("Failed to create config dir: {err}"), trace_id)
        })?;
    }
    if path.exists() {
        let _ = fs::copy(path, backup_path_for(path));
    }
    let payload = serde_json::to_string_pretty(config)
        .map_err(|err| AppError::system(format!("Failed to serialize config: {err}"), trace_id))?;
    fs::write(path, payload)
        .map_err(|err| AppError::system(format!("Failed to write config: {err}"), trace_id))?;
    Ok(())
}

/// Accepts the flat upper-case keys older crawler configs used (`MAX_CRAWL_STEPS`, `APP_PACKAGE`, ...).
fn apply_flat_overrides(mut config: CrawlConfig, value: &serde_json::Value) -> CrawlConfig {
    let text = |key: &str| value.get(key).and_then(|v| v.as_str()).map(str::to_string);
    let number = |key: &str| value.get(key).and_then(|v| v.as_i64());
    let float = |key: &str| value.get(key).and_then(|v| v.as_f64());
    let flag = |key: &str| value.get(key).and_then(|v| v.as_bool());

    if let Some(package) = text("APP_PACKAGE") {
        config.target.app_package = package;
    }
    if let Some(activity) = text("APP_ACTIVITY") {
        config.target.app_activity = activity;
    }
    if let Some(items) = value.get("ALLOWED_EXTERNAL_PACKAGES").and_then(|v| v.as_array()) {
        config.target.allowed_external_packages = items
            .iter()
            .filter_map(|item| item.as_str().map(|s| s.trim().to_string()))
            .filter(|item| !item.is_empty())
            .collect();
    }
    if let Some(url) = text("APPIUM_SERVER_URL") {
        config.server.url = url;
    }
    if let Some(timeout) = number("NEW_COMMAND_TIMEOUT") {
        config.server.new_command_timeout_secs = timeout.max(0) as u64;
    }
    if let Some(steps) = number("MAX_CRAWL_STEPS") {
        config.crawl.max_steps = steps.max(0) as u32;
    }
    if let Some(secs) = number("MAX_CRAWL_DURATION_SECONDS") {
        config.crawl.max_duration_secs = secs.max(0) as u64;
    }
    if let Some(limit) = number("MAX_CONSECUTIVE_AI_FAILURES") {
        config.crawl.max_consecutive_ai_failures = limit.max(0) as u32;
    }
    if let Some(limit) = number("MAX_CONSECUTIVE_MAP_FAILURES") {
        config.crawl.max_consecutive_map_failures = limit.max(0) as u32;
    }
    if let Some(limit) = number("MAX_CONSECUTIVE_EXEC_FAILURES") {
        config.crawl.max_consecutive_exec_failures = limit.max(0) as u32;
    }
    if let Some(limit) = number("MAX_CONSECUTIVE_CONTEXT_FAILURES") {
        config.crawl.max_consecutive_context_failures = limit.max(0) as u32;
    }
    if let Some(secs) = float("WAIT_AFTER_ACTION") {
        config.crawl.wait_after_action_ms = (secs.max(0.0) * 1000.0) as u64;
    }
    if let Some(secs) = float("STABILITY_WAIT") {
        config.crawl.stability_wait_ms = (secs.max(0.0) * 1000.0) as u64;
    }
    if let Some(threshold) = number("VISUAL_SIMILARITY_THRESHOLD") {
        config.crawl.visual_similarity_threshold = threshold;
    }
    if let Some(len) = number("XML_SNIPPET_MAX_LEN") {
        config.crawl.xml_snippet_max_len = len.max(0) as usize;
    }
    if let Some(enabled) = flag("ENABLE_VIDEO_RECORDING") {
        config.crawl.enable_video_recording = enabled;
    }
    if let Some(dir) = text("OUTPUT_DATA_DIR") {
        config.output.output_dir = dir;
    }
    config
}

pub fn validate_config(mut config: CrawlConfig) -> CrawlConfig {
    let defaults = CrawlConfig::default();
    config.target.app_package = config.target.app_package.trim().to_string();
    config.target.app_activity = config.target.app_activity.trim().to_string();
    if config.server.url.trim().is_empty() {
        config.server.url = defaults.server.url.clone();
    }
    if config.server.request_timeout_secs == 0 {
        config.server.request_timeout_secs = defaults.server.request_timeout_secs;
    }
    if config.crawl.max_steps == 0 {
        config.crawl.max_steps = defaults.crawl.max_steps;
    }
    if config.crawl.max_consecutive_ai_failures == 0 {
        config.crawl.max_consecutive_ai_failures = defaults.crawl.max_consecutive_ai_failures;
    }
    if config.crawl.max_consecutive_map_failures == 0 {
        config.crawl.max_consecutive_map_failures = defaults.crawl.max_consecutive_map_failures;
    }
    if config.crawl.max_consecutive_exec_failures == 0 {
        config.crawl.max_consecutive_exec_failures = defaults.crawl.max_consecutive_exec_failures;
    }
    if config.crawl.max_consecutive_context_failures == 0 {
        config.crawl.max_consecutive_context_failures =
            defaults.crawl.max_consecutive_context_failures;
    }
    if config.crawl.xml_snippet_max_len < MIN_XML_SNIPPET_LEN {
        config.crawl.xml_snippet_max_len = defaults.crawl.xml_snippet_max_len;
    }
    if config.session.max_retries == 0 {
        config.session.max_retries = defaults.session.max_retries;
    }
    if config.session.action_history_len == 0 {
        config.session.action_history_len = defaults.session.action_history_len;
    }
    if config.oracle.request_timeout_secs == 0 {
        config.oracle.request_timeout_secs = defaults.oracle.request_timeout_secs;
    }
    if config.device.adb_path.trim().is_empty() {
        config.device.adb_path = defaults.device.adb_path;
    }
    config
}

/// A crawl cannot start without a target package.
pub fn ensure_runnable(config: &CrawlConfig, trace_id: &str) -> Result<(), AppError> {
    if config.target.app_package.is_empty() {
        return Err(AppError::validation("Target app package is required", trace_id));
    }
    if config.oracle.endpoint.trim().is_empty() {
        return Err(AppError::validation("Oracle endpoint is required", trace_id));
    }
    Ok(())
}
