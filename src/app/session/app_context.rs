use serde_json::json;
use tracing::{debug, error, info, warn};

use super::{settle, SessionClient};
use crate::app::adb::runner::run_adb;
use crate::app::error::AppError;
use crate::app::fallback::OrderedFallback;
use crate::app::webdriver::WebDriverError;

const PACKAGE_LOOKUP_RETRIES: u32 = 2;
const ALWAYS_ALLOWED_PACKAGE: &str = "com.android.systemui";

/// Which foreground apps a crawl may be in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppContext {
    pub target_package: String,
    pub target_activity: Option<String>,
    pub allowed_external_packages: Vec<String>,
    pub max_context_failures: u32,
}

impl Default for AppContext {
    fn default() -> Self {
        Self {
            target_package: String::new(),
            target_activity: None,
            allowed_external_packages: Vec::new(),
            max_context_failures: 3,
        }
    }
}

impl AppContext {
    pub fn new(
        target_package: impl Into<String>,
        target_activity: Option<String>,
        allowed_external_packages: Vec<String>,
        max_context_failures: u32,
    ) -> Self {
        Self {
            target_package: target_package.into(),
            target_activity: target_activity.filter(|value| !value.trim().is_empty()),
            allowed_external_packages,
            max_context_failures: max_context_failures.max(1),
        }
    }

    pub fn allows(&self, package: &str) -> bool {
        package == self.target_package
            || self
                .allowed_external_packages
                .iter()
                .any(|allowed| allowed == package)
    }
}

/// Builds the `package/activity` component for `am start`.
pub fn normalize_component(package: &str, activity: &str) -> String {
    let activity = activity.trim();
    if activity.contains('/') {
        activity.to_string()
    } else if activity.starts_with('.') || activity.contains('.') {
        format!("{package}/{activity}")
    } else {
        format!("{package}/{package}.{activity}")
    }
}

fn am_start_succeeded(stdout: &str) -> bool {
    !stdout.lines().any(|line| line.trim_start().starts_with("Error"))
}

impl SessionClient {
    /// Launches `package/activity`: driver intent, then `adb am start`, then a driver shell.
    pub fn start_activity(&mut self, package: &str, activity: &str) -> Result<(), AppError> {
        let session_id = self.validate_session()?;
        let component = normalize_component(package, activity);
        let udid = self
            .capabilities
            .as_ref()
            .and_then(|caps| caps.udid())
            .map(str::to_string);
        let adb_program = self.adb_program.clone();
        let trace_id = self.trace_id.clone();

        let result = OrderedFallback::<SessionClient, (), WebDriverError>::new("start_activity")
            .then("mobile_start_activity", |client: &mut SessionClient| {
                client
                    .transport
                    .execute(
                        &session_id,
                        "mobile: startActivity",
                        &json!({ "intent": component, "wait": true }),
                    )
                    .map(|_| ())
            })
            .then_if(udid.is_some(), "adb_am_start", |_client: &mut SessionClient| {
                let output = run_adb(
                    &adb_program,
                    udid.as_deref(),
                    &["shell", "am", "start", "-W", "-n", component.as_str()],
                    &trace_id,
                )
                .and_then(|output| output.into_stdout("am start", &trace_id))
                .map_err(|err| WebDriverError::Transport(err.to_string()))?;
                if am_start_succeeded(&output) {
                    Ok(())
                } else {
                    Err(WebDriverError::Transport(output.trim().to_string()))
                }
            })
            .then("shell_am_start", |client: &mut SessionClient| {
                client
                    .transport
                    .execute(
                        &session_id,
                        "mobile: shell",
                        &json!({ "command": "am", "args": ["start", "-W", "-n", component] }),
                    )
                    .map(|_| ())
            })
            .run(self, |_| true);

        match result {
            Ok(resolved) => {
                info!(trace_id = %self.trace_id, component = %component, via = resolved.strategy, "activity started");
                Ok(())
            }
            Err(err) => {
                let detail = err
                    .into_last_error()
                    .map(|err| err.to_string())
                    .unwrap_or_default();
                Err(AppError::app_context(
                    format!("Failed to start {component}: {detail}"),
                    &self.trace_id,
                ))
            }
        }
    }

    pub fn activate_app(&mut self, package: &str) -> Result<(), AppError> {
        let session_id = self.validate_session()?;
        self.transport
            .activate_app(&session_id, package)
            .map_err(|err| AppError::app_context(format!("Failed to activate {package}: {err}"), &self.trace_id))
    }

    fn observe_package(&mut self) -> Option<String> {
        for attempt in 0..=PACKAGE_LOOKUP_RETRIES {
            match self.current_package() {
                Ok(Some(package)) => return Some(package),
                Ok(None) => {}
                Err(err) => {
                    warn!(trace_id = %self.trace_id, attempt, error = %err, "failed to read foreground package");
                }
            }
            if attempt < PACKAGE_LOOKUP_RETRIES {
                settle(self.timings.package_retry_delay);
            }
        }
        None
    }

    fn is_allowed(&self, package: Option<&str>) -> bool {
        package.is_some_and(|package| {
            self.context.allows(package) || package == ALWAYS_ALLOWED_PACKAGE
        })
    }

    fn relaunch_target(&mut self) -> bool {
        let package = self.context.target_package.clone();
        let launched = match self.context.target_activity.clone() {
            Some(activity) => self.start_activity(&package, &activity),
            None => self.activate_app(&package),
        };
        match launched {
            Ok(()) => {
                settle(self.timings.relaunch_settle);
                true
            }
            Err(err) => {
                warn!(trace_id = %self.trace_id, error = %err, "relaunch failed");
                false
            }
        }
    }

    fn recheck(&mut self) -> bool {
        let package = self.current_package().ok().flatten();
        if self.is_allowed(package.as_deref()) {
            self.context_failures = 0;
            true
        } else {
            false
        }
    }

    /// Confirms the foreground app is the target or an allowed external package,
    /// attempting back-navigation and relaunch while the consecutive-failure counter
    /// is below the ceiling. Once the ceiling is reached no recovery is attempted.
    pub fn ensure_in_app(&mut self) -> bool {
        if let Err(err) = self.ensure_session() {
            error!(trace_id = %self.trace_id, error = %err, "no session; cannot check app context");
            self.context_failures += 1;
            return false;
        }
        if self.context.target_package.is_empty() || !self.platform_is_android() {
            return true;
        }

        let Some(current) = self.observe_package() else {
            warn!(trace_id = %self.trace_id, "foreground package unknown; relaunching target");
            if self.context.target_activity.is_some() && self.relaunch_target() {
                let after = self.current_package().ok().flatten();
                if after.as_deref() == Some(self.context.target_package.as_str()) {
                    self.context_failures = 0;
                    return true;
                }
            }
            self.context_failures += 1;
            return false;
        };

        if self.is_allowed(Some(&current)) {
            debug!(trace_id = %self.trace_id, package = %current, "app context ok");
            self.context_failures = 0;
            return true;
        }

        self.context_failures += 1;
        warn!(
            trace_id = %self.trace_id,
            package = %current,
            failures = self.context_failures,
            "foreground app outside the allowed set"
        );
        if self.context_failures >= self.context.max_context_failures {
            error!(trace_id = %self.trace_id, "context failure ceiling reached; skipping recovery");
            return false;
        }

        match self.back() {
            Ok(()) => settle(self.timings.back_settle),
            Err(err) => debug!(trace_id = %self.trace_id, error = %err, "back during recovery failed"),
        }
        if self.recheck() {
            info!(trace_id = %self.trace_id, "returned to app with back");
            return true;
        }

        if self.relaunch_target() && self.recheck() {
            info!(trace_id = %self.trace_id, "returned to app by relaunch");
            return true;
        }

        error!(trace_id = %self.trace_id, "could not return to the target app");
        false
    }
}
