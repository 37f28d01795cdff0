use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use app_traverser_lib::app::adb::resolve_adb_program;
use app_traverser_lib::app::capabilities::build_capabilities;
use app_traverser_lib::app::config::{
    ensure_runnable, load_config, load_config_from_path, validate_config, CrawlConfig,
};
use app_traverser_lib::app::control::{CrawlFlags, Reporter};
use app_traverser_lib::app::crawler::oracle::HttpOracle;
use app_traverser_lib::app::crawler::Crawler;
use app_traverser_lib::app::device::{list_devices, select_best_device, ANDROID_PLATFORM};
use app_traverser_lib::app::error::AppError;
use app_traverser_lib::app::logging::init_logging;
use app_traverser_lib::app::models::{RunReport, RunStatus};
use app_traverser_lib::app::session::{AppContext, SessionClient, SessionTimings};
use app_traverser_lib::app::store::CrawlStore;
use app_traverser_lib::app::webdriver::client::HttpWebDriver;
use tracing::{error, info, warn};
use uuid::Uuid;

const USAGE: &str = "Usage: traverser [--config PATH] [--package PKG] [--activity ACT] [--udid SERIAL] \
[--server URL] [--max-steps N] [--duration SECS] [--out DIR] [--json]";

#[derive(Debug, Clone, Default)]
struct Args {
    config: Option<PathBuf>,
    package: Option<String>,
    activity: Option<String>,
    udid: Option<String>,
    server: Option<String>,
    max_steps: Option<u32>,
    duration_secs: Option<u64>,
    out_dir: Option<String>,
    json: bool,
}

fn value(it: &mut impl Iterator<Item = String>, flag: &str) -> Result<String, String> {
    it.next()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| format!("{flag} requires a value"))
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args {
        udid: std::env::var("ANDROID_SERIAL")
            .ok()
            .filter(|s| !s.trim().is_empty()),
        ..Args::default()
    };

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--config" => args.config = Some(PathBuf::from(value(&mut it, "--config")?)),
            "--package" => args.package = Some(value(&mut it, "--package")?),
            "--activity" => args.activity = Some(value(&mut it, "--activity")?),
            "--udid" => args.udid = Some(value(&mut it, "--udid")?),
            "--server" => args.server = Some(value(&mut it, "--server")?),
            "--max-steps" => {
                let raw = value(&mut it, "--max-steps")?;
                args.max_steps = Some(
                    raw.parse()
                        .map_err(|_| format!("--max-steps expects a number, got {raw}"))?,
                );
            }
            "--duration" => {
                let raw = value(&mut it, "--duration")?;
                args.duration_secs = Some(
                    raw.parse()
                        .map_err(|_| format!("--duration expects seconds, got {raw}"))?,
                );
            }
            "--out" => args.out_dir = Some(value(&mut it, "--out")?),
            "--json" => args.json = true,
            "-h" | "--help" => return Err(USAGE.to_string()),
            other => return Err(format!("Unknown arg: {other}\n{USAGE}")),
        }
    }
    Ok(args)
}

fn apply_args(mut config: CrawlConfig, args: &Args) -> CrawlConfig {
    if let Some(package) = &args.package {
        config.target.app_package = package.clone();
    }
    if let Some(activity) = &args.activity {
        config.target.app_activity = activity.clone();
    }
    if let Some(udid) = &args.udid {
        config.device.udid = udid.clone();
    }
    if let Some(server) = &args.server {
        config.server.url = server.clone();
    }
    if let Some(max_steps) = args.max_steps {
        config.crawl.max_steps = max_steps;
    }
    if let Some(duration) = args.duration_secs {
        config.crawl.max_duration_secs = duration;
    }
    if let Some(out_dir) = &args.out_dir {
        config.output.output_dir = out_dir.clone();
    }
    validate_config(config)
}

enum SetupError {
    /// Bad input; no crawl was attempted.
    Invalid(AppError),
    /// The crawl could not start; reported with an end status.
    Aborted(RunStatus, AppError),
}

fn connect(config: &CrawlConfig, trace_id: &str) -> Result<SessionClient, SetupError> {
    let adb_program = resolve_adb_program(&config.device.adb_path);
    let devices = list_devices(&adb_program, trace_id)
        .map_err(|err| SetupError::Aborted(RunStatus::FailedNoDevice, err))?;
    let hint = Some(config.device.udid.as_str())
        .filter(|udid| !udid.trim().is_empty())
        .or(Some(config.device.name_hint.as_str()));
    let device = select_best_device(&devices, hint, Some(ANDROID_PLATFORM), trace_id)
        .map_err(|err| SetupError::Aborted(RunStatus::FailedNoDevice, err))?;
    info!(trace_id = %trace_id, udid = %device.id, name = %device.name, "device selected");

    let driver = HttpWebDriver::new(Duration::from_secs(config.server.request_timeout_secs))
        .map_err(|err| SetupError::Aborted(RunStatus::FailedAppiumConnect, err.into_app_error(trace_id)))?;
    let mut session = SessionClient::new(
        Box::new(driver),
        SessionTimings::from_settings(&config.session),
        adb_program,
        trace_id,
    );
    let context = AppContext::new(
        config.target.app_package.clone(),
        Some(config.target.app_activity.clone()),
        config.target.allowed_external_packages.clone(),
        config.crawl.max_consecutive_context_failures,
    );
    session
        .connect(build_capabilities(device, config), &config.server.url, context)
        .map_err(|err| SetupError::Aborted(RunStatus::FailedAppiumConnect, err))?;
    Ok(session)
}

fn run(config: CrawlConfig, reporter: &Reporter, trace_id: &str) -> Result<RunReport, SetupError> {
    ensure_runnable(&config, trace_id).map_err(SetupError::Invalid)?;
    let oracle = HttpOracle::from_settings(&config.oracle, trace_id).map_err(SetupError::Invalid)?;

    let flags = CrawlFlags::from_output(&config.output);
    if flags.shutdown_requested() {
        warn!(trace_id = %trace_id, "shutdown flag already present; the crawl will stop immediately");
    }

    reporter.status("Connecting to automation server");
    let session = connect(&config, trace_id)?;

    let mut crawler = Crawler::new(session, Box::new(oracle), config.crawl.clone(), flags, reporter.clone())
        .with_output(&config.output);
    match CrawlStore::open(&config.output.database_path(), trace_id) {
        Ok(store) => crawler = crawler.with_store(store),
        Err(err) => warn!(trace_id = %trace_id, error = %err, "crawl database unavailable; graph not persisted"),
    }

    let report = crawler.run();
    crawler.session_mut().close();
    Ok(report)
}

fn main() -> ExitCode {
    init_logging("info");
    let trace_id = Uuid::new_v4().to_string();
    let reporter = Reporter::stdout();

    let args = match parse_args() {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("{msg}");
            return ExitCode::from(2);
        }
    };

    let loaded = match &args.config {
        Some(path) => load_config_from_path(path, &trace_id),
        None => load_config(&trace_id),
    };
    let config = match loaded {
        Ok(config) => apply_args(config, &args),
        Err(err) => {
            error!(trace_id = %trace_id, error = %err, "failed to load config");
            return ExitCode::from(2);
        }
    };

    match run(config, &reporter, &trace_id) {
        Ok(report) => {
            if args.json {
                match serde_json::to_string(&report) {
                    Ok(json) => println!("{json}"),
                    Err(err) => warn!(trace_id = %trace_id, error = %err, "failed to serialize report"),
                }
            }
            if report.success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(1)
            }
        }
        Err(SetupError::Invalid(err)) => {
            error!(trace_id = %trace_id, error = %err, "invalid crawl setup");
            reporter.status(&format!("Setup failed: {}", err.error));
            ExitCode::from(2)
        }
        Err(SetupError::Aborted(status, err)) => {
            error!(trace_id = %trace_id, status = %status, error = %err, "crawl could not start");
            reporter.status(&format!("Setup failed: {}", err.error));
            reporter.end(status);
            ExitCode::from(2)
        }
    }
}
