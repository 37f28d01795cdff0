use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use super::*;
use crate::app::capabilities::Capabilities;
use crate::app::control::output::LineSink;
use crate::app::models::BoundingBox;
use crate::app::screen::hashing::png_fixture;
use crate::app::session::{AppContext, SessionTimings};
use crate::app::webdriver::fake::FakeDriver;
use crate::app::webdriver::{Locator, WebDriverError};

const TARGET: &str = "com.example.shop";
const HOME_XML: &str = r#"<hierarchy><node class="android.widget.FrameLayout" package="com.example.shop"><node class="android.widget.Button" resource-id="com.example.shop:id/login" text="Log in" clickable="true" bounds="[10,20][110,60]" package="com.example.shop" /></node></hierarchy>"#;

struct ScriptedOracle {
    replies: VecDeque<Result<ActionSuggestion, AppError>>,
    fallback: Option<ActionSuggestion>,
    calls: Arc<AtomicU32>,
    feedback: Arc<Mutex<Vec<Option<String>>>>,
}

impl ScriptedOracle {
    fn always(suggestion: Option<ActionSuggestion>) -> (Self, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        (
            Self {
                replies: VecDeque::new(),
                fallback: suggestion,
                calls: calls.clone(),
                feedback: Arc::new(Mutex::new(Vec::new())),
            },
            calls,
        )
    }
}

impl DecisionOracle for ScriptedOracle {
    fn suggest_action(&mut self, request: &OracleRequest<'_>) -> Result<ActionSuggestion, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.feedback
            .lock()
            .expect("feedback")
            .push(request.last_action_feedback.map(str::to_string));
        if let Some(reply) = self.replies.pop_front() {
            return reply;
        }
        self.fallback
            .clone()
            .ok_or_else(|| AppError::oracle("model unavailable", "trace-crawl"))
    }
}

fn suggestion(action: ActionKind, target: Option<&str>) -> ActionSuggestion {
    ActionSuggestion {
        action,
        target_identifier: target.map(str::to_string),
        input_text: None,
        target_bounding_box: None,
        reasoning: Some("explore".to_string()),
    }
}

fn screen_png() -> Vec<u8> {
    png_fixture(32, 32, |x, y| [(x * 8) as u8, (y * 8) as u8, 90])
}

fn device() -> FakeDriver {
    let fake = FakeDriver::new();
    {
        let mut state = fake.state();
        state.default_package = TARGET.to_string();
        state.activity = ".MainActivity".to_string();
        state.default_source = HOME_XML.to_string();
        state.default_screenshot = screen_png();
    }
    fake
}

fn session(fake: &FakeDriver) -> SessionClient {
    let mut caps = Capabilities::new();
    caps.set("platformName", "Android")
        .set("automationName", "UiAutomator2")
        .set("udid", "emulator-5554");
    let mut client = SessionClient::new(
        Box::new(fake.clone()),
        SessionTimings::immediate(),
        "/nonexistent/adb",
        "trace-crawl",
    );
    client
        .connect(
            caps,
            "http://127.0.0.1:4723",
            AppContext::new(TARGET, Some(".MainActivity".to_string()), Vec::new(), 3),
        )
        .expect("connect");
    client
}

fn settings() -> CrawlSettings {
    CrawlSettings {
        max_steps: 10,
        max_consecutive_ai_failures: 3,
        max_consecutive_map_failures: 3,
        max_consecutive_exec_failures: 3,
        wait_after_action_ms: 0,
        stability_wait_ms: 0,
        ..CrawlSettings::default()
    }
}

struct Harness {
    crawler: Crawler,
    lines: Arc<Mutex<Vec<String>>>,
    _dir: tempfile::TempDir,
}

impl Harness {
    fn new(fake: &FakeDriver, oracle: ScriptedOracle, settings: CrawlSettings) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let lines = Arc::new(Mutex::new(Vec::new()));
        let captured = lines.clone();
        let sink: LineSink = Arc::new(move |line: String| captured.lock().expect("lines").push(line));
        let flags = CrawlFlags::new(dir.path().join("shutdown.flag"), dir.path().join("pause.flag"));
        let crawler = Crawler::new(session(fake), Box::new(oracle), settings, flags, Reporter::new(sink))
            .with_pause_poll(Duration::from_millis(5));
        Self {
            crawler,
            lines,
            _dir: dir,
        }
    }

    fn lines(&self) -> Vec<String> {
        self.lines.lock().expect("lines").clone()
    }
}

#[test]
fn always_failing_oracle_stops_after_exactly_the_ceiling() {
    let fake = device();
    let (oracle, calls) = ScriptedOracle::always(None);
    let mut harness = Harness::new(&fake, oracle, settings());

    let report = harness.crawler.run();

    assert_eq!(report.status, RunStatus::FailureMaxAiFail);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(report.steps, 3);
    assert_eq!(fake.count_calls("back"), 3);
    assert!(report.outcomes.iter().all(|o| o.reason == StepReason::OracleFailed));
    // Every fallback still leaves an edge behind.
    assert_eq!(report.screens, 1);
    assert_eq!(report.transitions, 3);
    assert_eq!(harness.lines().last().map(String::as_str), Some("UI_END:FAILURE_MAX_AI_FAIL"));
}

#[test]
fn oracle_success_resets_the_failure_counter() {
    let fake = device();
    let (mut oracle, calls) = ScriptedOracle::always(None);
    let fail = || Err(AppError::oracle("timeout", "t"));
    oracle.replies = VecDeque::from(vec![
        fail(),
        fail(),
        Ok(suggestion(ActionKind::ScrollDown, None)),
        fail(),
        fail(),
    ]);
    let mut harness = Harness::new(&fake, oracle, settings());

    let report = harness.crawler.run();

    assert_eq!(report.status, RunStatus::FailureMaxAiFail);
    assert_eq!(calls.load(Ordering::SeqCst), 6);
    assert_eq!(report.steps, 6);
}

#[test]
fn reaching_max_steps_is_a_normal_ending() {
    let fake = device();
    let (oracle, calls) = ScriptedOracle::always(Some(suggestion(ActionKind::ScrollDown, None)));
    let feedback = oracle.feedback.clone();
    let mut harness = Harness::new(&fake, oracle, CrawlSettings { max_steps: 2, ..settings() });

    let report = harness.crawler.run();

    assert_eq!(report.status, RunStatus::CompletedMaxSteps);
    assert!(report.success());
    assert_eq!(report.steps, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(report.transitions, 2);
    assert_eq!(fake.count_calls("perform_actions"), 2);
    assert_eq!(
        *feedback.lock().expect("feedback"),
        vec![None, Some("SCROLL_DOWN succeeded".to_string())]
    );

    let lines = harness.lines();
    assert!(lines.contains(&"UI_STEP:1".to_string()));
    assert!(lines.contains(&"UI_STEP:3".to_string()));
    assert!(lines.contains(&"UI_ACTION:SCROLL_DOWN".to_string()));
    assert!(lines.contains(&format!("UI_FOCUS:{TARGET}/.MainActivity")));
    assert_eq!(lines.last().map(String::as_str), Some("UI_END:COMPLETED_MAX_STEPS"));
    let tracker = harness.crawler.tracker();
    let fingerprint = &tracker.screens()[0].fingerprint;
    assert_eq!(tracker.visit_count(fingerprint), 3);
    assert_eq!(tracker.action_history(fingerprint), ["SCROLL_DOWN"]);
}

#[test]
fn unmappable_suggestions_hit_the_mapping_ceiling() {
    let fake = device();
    let (oracle, _) = ScriptedOracle::always(Some(suggestion(ActionKind::Click, Some("missing_button"))));
    let mut harness = Harness::new(&fake, oracle, settings());

    let report = harness.crawler.run();

    assert_eq!(report.status, RunStatus::FailureMaxMapFail);
    assert_eq!(report.steps, 3);
    assert_eq!(fake.count_calls("back"), 3);
    assert!(report.outcomes.iter().all(|o| o.reason == StepReason::MappingFailed));
    assert_eq!(fake.count_calls("click"), 0);
}

#[test]
fn failed_executions_count_towards_their_own_ceiling() {
    let fake = device();
    fake.add_element(Locator::id("login"), "el-login");
    {
        let mut state = fake.state();
        state.failing_clicks.insert("el-login".to_string());
        state.fail_pointer_actions = true;
        state.fail_mobile_tap = true;
    }
    let (oracle, _) = ScriptedOracle::always(Some(suggestion(ActionKind::Click, Some("login"))));
    let mut harness = Harness::new(&fake, oracle, settings());

    let report = harness.crawler.run();

    assert_eq!(report.status, RunStatus::FailureMaxExecFail);
    assert_eq!(report.steps, 3);
    assert!(report
        .outcomes
        .iter()
        .all(|o| o.reason == StepReason::ExecutionFailed && !o.success));
}

#[test]
fn capture_failure_falls_back_without_an_edge() {
    let fake = device();
    fake.state().screenshots.push_back(Err(WebDriverError::Protocol {
        error: "unknown error".to_string(),
        message: "screen busy".to_string(),
    }));
    let (oracle, calls) = ScriptedOracle::always(Some(suggestion(ActionKind::ScrollUp, None)));
    let mut harness = Harness::new(&fake, oracle, CrawlSettings { max_steps: 2, ..settings() });

    let report = harness.crawler.run();

    assert_eq!(report.status, RunStatus::CompletedMaxSteps);
    assert_eq!(report.outcomes[0].reason, StepReason::CaptureFailed);
    assert_eq!(report.outcomes[0].fingerprint, None);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(report.transitions, 1);
    assert_eq!(fake.count_calls("back"), 1);
}

#[test]
fn undecodable_screenshot_is_a_hash_failure() {
    let fake = device();
    fake.state().default_screenshot = b"\x89PNG\r\n\x1a\ngarbage".to_vec();
    let (oracle, calls) = ScriptedOracle::always(Some(suggestion(ActionKind::ScrollUp, None)));
    let mut harness = Harness::new(&fake, oracle, CrawlSettings { max_steps: 2, ..settings() });

    let report = harness.crawler.run();

    assert_eq!(report.status, RunStatus::CompletedMaxSteps);
    assert_eq!(report.steps, 2);
    assert!(report.outcomes.iter().all(|o| o.reason == StepReason::HashFailed));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(report.screens, 0);
}

#[test]
fn shutdown_flag_stops_before_the_first_step() {
    let fake = device();
    let (oracle, calls) = ScriptedOracle::always(Some(suggestion(ActionKind::Back, None)));
    let mut harness = Harness::new(&fake, oracle, settings());
    std::fs::write(harness._dir.path().join("shutdown.flag"), "1").expect("flag");

    let report = harness.crawler.run();

    assert_eq!(report.status, RunStatus::ShutdownFlagDetected);
    assert_eq!(report.steps, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(harness.lines().last().map(String::as_str), Some("UI_END:SHUTDOWN_FLAG_DETECTED"));
}

#[test]
fn persistent_foreign_app_stops_at_the_context_ceiling() {
    let fake = device();
    fake.state().default_package = "com.android.chrome".to_string();
    let (oracle, calls) = ScriptedOracle::always(Some(suggestion(ActionKind::Back, None)));
    let mut harness = Harness::new(&fake, oracle, settings());

    let report = harness.crawler.run();

    assert_eq!(report.status, RunStatus::FailureMaxContextFail);
    assert!(!report.success());
    assert_eq!(report.steps, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(harness.crawler.session_mut().context_failures(), 3);
    // Recovery gestures only below the ceiling.
    assert_eq!(fake.count_calls("back"), 2);
    assert_eq!(harness.lines().last().map(String::as_str), Some("UI_END:FAILURE_MAX_CONTEXT_FAIL"));
}

#[test]
fn brief_context_loss_retries_the_step_and_goes_on() {
    let fake = device();
    {
        // Two failing checks, each reading the package three times.
        let mut state = fake.state();
        for _ in 0..6 {
            state.packages.push_back(Ok("com.android.chrome".to_string()));
        }
    }
    let (oracle, calls) = ScriptedOracle::always(Some(suggestion(ActionKind::ScrollDown, None)));
    let mut harness = Harness::new(&fake, oracle, CrawlSettings { max_steps: 2, ..settings() });

    let report = harness.crawler.run();

    assert_eq!(report.status, RunStatus::CompletedMaxSteps);
    assert_eq!(report.steps, 2);
    assert_eq!(report.outcomes.len(), 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(harness.crawler.session_mut().context_failures(), 0);
    let lines = harness.lines();
    assert_eq!(lines.iter().filter(|line| *line == "UI_STEP:1").count(), 3);
}

#[test]
fn unrecoverable_session_ends_the_run_as_session_lost() {
    let fake = device();
    {
        let mut state = fake.state();
        state
            .page_sources
            .push_back(Err(WebDriverError::InvalidSession("session deleted".to_string())));
        // Three attempts each for the capture, the fallback back and the next step.
        for _ in 0..9 {
            state
                .create_failures
                .push_back(WebDriverError::Disconnected("refused".to_string()));
        }
    }
    let (oracle, calls) = ScriptedOracle::always(Some(suggestion(ActionKind::ScrollDown, None)));
    let mut harness = Harness::new(&fake, oracle, settings());

    let report = harness.crawler.run();

    assert_eq!(report.status, RunStatus::FailureSessionLost);
    assert!(!report.success());
    assert_eq!(report.steps, 1);
    assert_eq!(report.outcomes[0].reason, StepReason::CaptureFailed);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(fake.count_calls("create_session"), 10);
    assert_eq!(harness.lines().last().map(String::as_str), Some("UI_END:FAILURE_SESSION_LOST"));
}

#[test]
fn persists_graph_and_annotations_under_the_output_dir() {
    let fake = device();
    fake.add_element(Locator::id("login"), "el-login");
    let mut click = suggestion(ActionKind::Click, Some("login"));
    click.target_bounding_box = Some(BoundingBox {
        top_left: (0.25, 0.25),
        bottom_right: (0.75, 0.75),
    });
    let (oracle, _) = ScriptedOracle::always(Some(click));
    let out = tempfile::tempdir().expect("out");
    let output = OutputSettings {
        output_dir: out.path().display().to_string(),
        ..OutputSettings::default()
    };
    let store = CrawlStore::open(&output.database_path(), "trace-crawl").expect("store");
    let harness = Harness::new(&fake, oracle, CrawlSettings { max_steps: 1, ..settings() });
    let lines = harness.lines.clone();
    let mut crawler = harness.crawler.with_output(&output).with_store(store);

    let report = crawler.run();

    assert_eq!(report.status, RunStatus::CompletedMaxSteps);
    assert!(fake.calls().contains(&"click el-login".to_string()));
    let annotated: Vec<_> = std::fs::read_dir(output.annotated_dir())
        .expect("annotated dir")
        .collect();
    assert_eq!(annotated.len(), 1);
    assert_eq!(std::fs::read_dir(output.screenshots_dir()).expect("shots").count(), 1);
    let lines = lines.lock().expect("lines").clone();
    assert!(lines.iter().any(|line| line.starts_with("UI_ANNOTATED_SCREENSHOT:")));
    assert!(lines.iter().any(|line| line.starts_with("UI_SCREENSHOT:")));
    assert!(lines.contains(&"UI_ACTION:CLICK on 'login'".to_string()));

    let run_id = crawler.run_id().to_string();
    drop(crawler);
    let store = CrawlStore::open(&output.database_path(), "trace-crawl").expect("reopen");
    assert_eq!(
        store.run_status(&run_id).expect("status").as_deref(),
        Some("COMPLETED_MAX_STEPS")
    );
    assert_eq!(store.screen_count(&run_id).expect("screens"), 1);
    assert_eq!(store.transition_count(&run_id).expect("transitions"), 1);
}

#[test]
fn records_the_screen_for_the_whole_run_when_enabled() {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    let fake = device();
    fake.state().recorded_video = STANDARD.encode(b"mp4");
    let (oracle, _) = ScriptedOracle::always(Some(suggestion(ActionKind::ScrollDown, None)));
    let out = tempfile::tempdir().expect("out");
    let output = OutputSettings {
        output_dir: out.path().display().to_string(),
        ..OutputSettings::default()
    };
    let settings = CrawlSettings {
        max_steps: 1,
        enable_video_recording: true,
        ..settings()
    };
    let harness = Harness::new(&fake, oracle, settings);
    let lines = harness.lines.clone();
    let mut crawler = harness.crawler.with_output(&output);

    let report = crawler.run();

    assert_eq!(report.status, RunStatus::CompletedMaxSteps);
    let video = output
        .videos_dir()
        .join(format!("com_example_shop_{}.mp4", crawler.run_id()));
    assert_eq!(std::fs::read(&video).expect("video"), b"mp4");
    assert!(!crawler.session_mut().is_recording());
    let calls = fake.calls();
    let started = calls.iter().position(|c| c == "start_recording_screen").expect("start");
    let stopped = calls.iter().position(|c| c == "stop_recording_screen").expect("stop");
    let first_capture = calls.iter().position(|c| c == "screenshot").expect("capture");
    assert!(started < first_capture && first_capture < stopped);
    let lines = lines.lock().expect("lines").clone();
    assert!(lines.iter().any(|line| line.starts_with("UI_STATUS:Video saved:")));
}

#[test]
fn recording_is_off_by_default() {
    let fake = device();
    let (oracle, _) = ScriptedOracle::always(Some(suggestion(ActionKind::ScrollDown, None)));
    let out = tempfile::tempdir().expect("out");
    let output = OutputSettings {
        output_dir: out.path().display().to_string(),
        ..OutputSettings::default()
    };
    let harness = Harness::new(&fake, oracle, CrawlSettings { max_steps: 1, ..settings() });
    let mut crawler = harness.crawler.with_output(&output);

    crawler.run();

    assert_eq!(fake.count_calls("start_recording_screen"), 0);
    assert!(!output.videos_dir().exists());
}

#[test]
fn failure_ceilings_take_precedence_over_limits() {
    let settings = settings();
    let counters = CrawlCounters {
        steps: 10,
        map_failures: 3,
        ..CrawlCounters::default()
    };
    assert_eq!(
        termination_status(&counters, &settings, Duration::ZERO),
        Some(RunStatus::FailureMaxMapFail)
    );
    let counters = CrawlCounters {
        steps: 10,
        ..CrawlCounters::default()
    };
    assert_eq!(
        termination_status(&counters, &settings, Duration::ZERO),
        Some(RunStatus::CompletedMaxSteps)
    );
}

#[test]
fn time_mode_ignores_the_step_limit() {
    let settings = CrawlSettings {
        max_duration_secs: 60,
        ..settings()
    };
    let counters = CrawlCounters {
        steps: 500,
        ..CrawlCounters::default()
    };
    assert_eq!(termination_status(&counters, &settings, Duration::from_secs(59)), None);
    assert_eq!(
        termination_status(&counters, &settings, Duration::from_secs(60)),
        Some(RunStatus::CompletedMaxDuration)
    );
}

#[test]
fn truncates_on_character_boundaries() {
    assert_eq!(truncate_chars("héllo", 2), "hé... (truncated)");
    assert_eq!(truncate_chars("hi", 5), "hi");
}
