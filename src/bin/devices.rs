use std::process::ExitCode;

use app_traverser_lib::app::adb::resolve_adb_program;
use app_traverser_lib::app::config::load_config;
use app_traverser_lib::app::device::list_devices;
use app_traverser_lib::app::logging::init_logging;
use app_traverser_lib::app::models::DeviceType;
use uuid::Uuid;

struct Args {
    adb: Option<String>,
    json: bool,
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args { adb: None, json: false };
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--adb" => {
                args.adb = Some(
                    it.next()
                        .filter(|v| !v.trim().is_empty())
                        .ok_or_else(|| "--adb requires a value".to_string())?,
                );
            }
            "--json" => args.json = true,
            "-h" | "--help" => return Err("Usage: devices [--adb PATH] [--json]".to_string()),
            other => return Err(format!("Unknown arg: {other}")),
        }
    }
    Ok(args)
}

fn main() -> ExitCode {
    init_logging("warn");
    let trace_id = Uuid::new_v4().to_string();
    let args = match parse_args() {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("{msg}");
            return ExitCode::from(2);
        }
    };

    let configured = args.adb.unwrap_or_else(|| {
        load_config(&trace_id)
            .map(|config| config.device.adb_path)
            .unwrap_or_default()
    });
    let devices = match list_devices(&resolve_adb_program(&configured), &trace_id) {
        Ok(devices) => devices,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::from(1);
        }
    };

    if args.json {
        match serde_json::to_string_pretty(&devices) {
            Ok(json) => println!("{json}"),
            Err(err) => {
                eprintln!("Failed to serialize devices: {err}");
                return ExitCode::from(1);
            }
        }
        return ExitCode::SUCCESS;
    }

    if devices.is_empty() {
        println!("No ready devices.");
        return ExitCode::SUCCESS;
    }
    for device in &devices {
        let kind = match device.device_type {
            DeviceType::Emulator => "emulator",
            DeviceType::Device => "device",
        };
        println!(
            "{:<24} {:<28} {:<8} Android {} (API {})",
            device.id,
            device.name,
            kind,
            device.os_version.as_deref().unwrap_or("?"),
            device
                .api_level
                .map_or_else(|| "?".to_string(), |level| level.to_string()),
        );
    }
    ExitCode::SUCCESS
}
