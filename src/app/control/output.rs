//! Line-oriented worker output. Tagged lines (`UI_STEP:3`) carry progress events;
//! anything else, including malformed tagged lines, is a plain log line.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::app::models::RunStatus;

pub const STEP_TAG: &str = "UI_STEP:";
pub const ACTION_TAG: &str = "UI_ACTION:";
pub const SCREENSHOT_TAG: &str = "UI_SCREENSHOT:";
pub const ANNOTATED_SCREENSHOT_TAG: &str = "UI_ANNOTATED_SCREENSHOT:";
pub const STATUS_TAG: &str = "UI_STATUS:";
pub const FOCUS_TAG: &str = "UI_FOCUS:";
pub const END_TAG: &str = "UI_END:";

pub type LineSink = Arc<dyn Fn(String) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    Step(u32),
    Action(String),
    Screenshot(PathBuf),
    AnnotatedScreenshot(PathBuf),
    Status(String),
    /// Foreground `package` with an optional activity.
    Focus {
        package: String,
        activity: Option<String>,
    },
    End(String),
    Log(String),
}

impl OutputEvent {
    pub fn to_line(&self) -> String {
        match self {
            OutputEvent::Step(step) => format!("{STEP_TAG}{step}"),
            OutputEvent::Action(action) => format!("{ACTION_TAG}{action}"),
            OutputEvent::Screenshot(path) => format!("{SCREENSHOT_TAG}{}", path.display()),
            OutputEvent::AnnotatedScreenshot(path) => {
                format!("{ANNOTATED_SCREENSHOT_TAG}{}", path.display())
            }
            OutputEvent::Status(status) => format!("{STATUS_TAG}{status}"),
            OutputEvent::Focus { package, activity } => match activity {
                Some(activity) => format!("{FOCUS_TAG}{package}/{activity}"),
                None => format!("{FOCUS_TAG}{package}"),
            },
            OutputEvent::End(status) => format!("{END_TAG}{status}"),
            OutputEvent::Log(line) => line.clone(),
        }
    }
}

fn non_empty(payload: &str) -> Option<String> {
    let payload = payload.trim();
    (!payload.is_empty()).then(|| payload.to_string())
}

pub fn parse_line(line: &str) -> OutputEvent {
    let raw = line.trim_end_matches(['\r', '\n']);
    let trimmed = raw.trim_start();
    let parsed = if let Some(payload) = trimmed.strip_prefix(STEP_TAG) {
        payload.trim().parse::<u32>().ok().map(OutputEvent::Step)
    } else if let Some(payload) = trimmed.strip_prefix(ACTION_TAG) {
        non_empty(payload).map(OutputEvent::Action)
    } else if let Some(payload) = trimmed.strip_prefix(ANNOTATED_SCREENSHOT_TAG) {
        non_empty(payload).map(|path| OutputEvent::AnnotatedScreenshot(PathBuf::from(path)))
    } else if let Some(payload) = trimmed.strip_prefix(SCREENSHOT_TAG) {
        non_empty(payload).map(|path| OutputEvent::Screenshot(PathBuf::from(path)))
    } else if let Some(payload) = trimmed.strip_prefix(STATUS_TAG) {
        non_empty(payload).map(OutputEvent::Status)
    } else if let Some(payload) = trimmed.strip_prefix(FOCUS_TAG) {
        non_empty(payload).map(|focus| match focus.split_once('/') {
            Some((package, activity)) if !activity.is_empty() => OutputEvent::Focus {
                package: package.to_string(),
                activity: Some(activity.to_string()),
            },
            _ => OutputEvent::Focus {
                package: focus.trim_end_matches('/').to_string(),
                activity: None,
            },
        })
    } else if let Some(payload) = trimmed.strip_prefix(END_TAG) {
        non_empty(payload).map(OutputEvent::End)
    } else {
        None
    };
    parsed.unwrap_or_else(|| OutputEvent::Log(raw.to_string()))
}

type Callback<T> = Box<dyn Fn(T) + Send + Sync>;

/// Per-tag handlers. Unset handlers drop their events; logs go to `on_log`.
#[derive(Default)]
pub struct OutputCallbacks {
    on_step: Option<Callback<u32>>,
    on_action: Option<Callback<String>>,
    on_screenshot: Option<Callback<PathBuf>>,
    on_annotated: Option<Callback<PathBuf>>,
    on_status: Option<Callback<String>>,
    on_focus: Option<Callback<(String, Option<String>)>>,
    on_end: Option<Callback<String>>,
    on_log: Option<Callback<String>>,
}

impl OutputCallbacks {
    pub fn on_step(mut self, f: impl Fn(u32) + Send + Sync + 'static) -> Self {
        self.on_step = Some(Box::new(f));
        self
    }

    pub fn on_action(mut self, f: impl Fn(String) + Send + Sync + 'static) -> Self {
        self.on_action = Some(Box::new(f));
        self
    }

    pub fn on_screenshot(mut self, f: impl Fn(PathBuf) + Send + Sync + 'static) -> Self {
        self.on_screenshot = Some(Box::new(f));
        self
    }

    pub fn on_annotated_screenshot(mut self, f: impl Fn(PathBuf) + Send + Sync + 'static) -> Self {
        self.on_annotated = Some(Box::new(f));
        self
    }

    pub fn on_status(mut self, f: impl Fn(String) + Send + Sync + 'static) -> Self {
        self.on_status = Some(Box::new(f));
        self
    }

    pub fn on_focus(mut self, f: impl Fn((String, Option<String>)) + Send + Sync + 'static) -> Self {
        self.on_focus = Some(Box::new(f));
        self
    }

    pub fn on_end(mut self, f: impl Fn(String) + Send + Sync + 'static) -> Self {
        self.on_end = Some(Box::new(f));
        self
    }

    pub fn on_log(mut self, f: impl Fn(String) + Send + Sync + 'static) -> Self {
        self.on_log = Some(Box::new(f));
        self
    }

    pub fn dispatch(&self, event: OutputEvent) {
        fn call<T>(callback: &Option<Callback<T>>, value: T) {
            if let Some(callback) = callback {
                callback(value);
            }
        }
        match event {
            OutputEvent::Step(step) => call(&self.on_step, step),
            OutputEvent::Action(action) => call(&self.on_action, action),
            OutputEvent::Screenshot(path) => call(&self.on_screenshot, path),
            OutputEvent::AnnotatedScreenshot(path) => call(&self.on_annotated, path),
            OutputEvent::Status(status) => call(&self.on_status, status),
            OutputEvent::Focus { package, activity } => call(&self.on_focus, (package, activity)),
            OutputEvent::End(status) => call(&self.on_end, status),
            OutputEvent::Log(line) => call(&self.on_log, line),
        }
    }

    pub fn dispatch_line(&self, line: &str) {
        self.dispatch(parse_line(line));
    }
}

/// Writes each line to stdout and flushes so a piped reader sees it immediately.
pub fn stdout_sink() -> LineSink {
    Arc::new(|line: String| {
        let stdout = std::io::stdout();
        let mut lock = stdout.lock();
        let _ = writeln!(lock, "{line}");
        let _ = lock.flush();
    })
}

/// Typed front for emitting worker progress lines.
#[derive(Clone)]
pub struct Reporter {
    sink: LineSink,
}

impl Reporter {
    pub fn new(sink: LineSink) -> Self {
        Self { sink }
    }

    pub fn stdout() -> Self {
        Self::new(stdout_sink())
    }

    pub fn emit(&self, event: OutputEvent) {
        (self.sink)(event.to_line());
    }

    pub fn step(&self, step: u32) {
        self.emit(OutputEvent::Step(step));
    }

    pub fn action(&self, description: &str) {
        self.emit(OutputEvent::Action(description.to_string()));
    }

    pub fn screenshot(&self, path: &Path) {
        self.emit(OutputEvent::Screenshot(path.to_path_buf()));
    }

    pub fn annotated_screenshot(&self, path: &Path) {
        self.emit(OutputEvent::AnnotatedScreenshot(path.to_path_buf()));
    }

    pub fn status(&self, status: &str) {
        self.emit(OutputEvent::Status(status.to_string()));
    }

    pub fn focus(&self, package: &str, activity: Option<&str>) {
        self.emit(OutputEvent::Focus {
            package: package.to_string(),
            activity: activity.map(str::to_string),
        });
    }

    pub fn end(&self, status: RunStatus) {
        self.emit(OutputEvent::End(status.as_str().to_string()));
    }
}
