use std::collections::HashMap;

use tracing::{debug, warn};

use crate::app::adb::parse::{parse_adb_devices, parse_getprop_map, AdbDeviceLine};
use crate::app::adb::runner::run_adb;
use crate::app::error::AppError;
use crate::app::models::{Device, DeviceType};

pub const ANDROID_PLATFORM: &str = "Android";

/// Enumerates ready devices. Unauthorized and offline entries are skipped; the list is
/// never cached.
pub fn list_devices(adb_program: &str, trace_id: &str) -> Result<Vec<Device>, AppError> {
    let output = run_adb(adb_program, None, &["devices", "-l"], trace_id)?
        .into_stdout("adb devices", trace_id)?;

    let mut devices = Vec::new();
    for row in parse_adb_devices(&output) {
        if !row.is_ready() {
            debug!(trace_id = %trace_id, serial = %row.serial, state = %row.state, "skipping device");
            continue;
        }
        let props = match run_adb(adb_program, Some(&row.serial), &["shell", "getprop"], trace_id)
            .and_then(|out| out.into_stdout("getprop", trace_id))
        {
            Ok(raw) => parse_getprop_map(&raw),
            Err(err) => {
                warn!(trace_id = %trace_id, serial = %row.serial, error = %err, "getprop failed");
                HashMap::new()
            }
        };
        devices.push(device_from_row(&row, &props));
    }
    devices.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(devices)
}

pub fn device_from_row(row: &AdbDeviceLine, props: &HashMap<String, String>) -> Device {
    let device_type = if row.serial.starts_with("emulator-") {
        DeviceType::Emulator
    } else {
        DeviceType::Device
    };
    Device {
        platform: ANDROID_PLATFORM.to_string(),
        id: row.serial.clone(),
        name: row.model.clone().unwrap_or_else(|| row.serial.clone()),
        os_version: props
            .get("ro.build.version.release")
            .filter(|value| !value.is_empty())
            .cloned(),
        api_level: props
            .get("ro.build.version.sdk")
            .and_then(|value| value.parse::<u32>().ok()),
        device_type,
    }
}

/// Name/id hint first, then platform, then whatever comes first.
pub fn select_best_device<'a>(
    devices: &'a [Device],
    name_hint: Option<&str>,
    platform_hint: Option<&str>,
    trace_id: &str,
) -> Result<&'a Device, AppError> {
    if devices.is_empty() {
        return Err(AppError::device_not_found("No connected devices", trace_id));
    }
    if let Some(hint) = name_hint.map(str::trim).filter(|hint| !hint.is_empty()) {
        let hint = hint.to_lowercase();
        if let Some(found) = devices.iter().find(|device| {
            device.id.to_lowercase() == hint || device.name.to_lowercase().contains(&hint)
        }) {
            return Ok(found);
        }
        warn!(trace_id = %trace_id, hint = %hint, "no device matches hint; falling back");
    }
    if let Some(platform) = platform_hint.map(str::trim).filter(|value| !value.is_empty()) {
        if let Some(found) = devices
            .iter()
            .find(|device| device.platform.eq_ignore_ascii_case(platform))
        {
            return Ok(found);
        }
    }
    Ok(&devices[0])
}
