use std::collections::HashMap;

use regex::Regex;

/// One row of `adb devices -l`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdbDeviceLine {
    pub serial: String,
    pub state: String,
    pub model: Option<String>,
    pub product: Option<String>,
    pub transport_id: Option<String>,
}

impl AdbDeviceLine {
    pub fn is_ready(&self) -> bool {
        self.state == "device"
    }
}

pub fn parse_adb_devices(output: &str) -> Vec<AdbDeviceLine> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !line.starts_with('*'))
        .filter(|line| !line.to_lowercase().starts_with("list of devices"))
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            let serial = tokens.next()?.to_string();
            let state = tokens.next()?.to_string();
            let mut row = AdbDeviceLine {
                serial,
                state,
                model: None,
                product: None,
                transport_id: None,
            };
            for token in tokens {
                if let Some(value) = token.strip_prefix("model:") {
                    row.model = Some(value.replace('_', " "));
                } else if let Some(value) = token.strip_prefix("product:") {
                    row.product = Some(value.to_string());
                } else if let Some(value) = token.strip_prefix("transport_id:") {
                    row.transport_id = Some(value.to_string());
                }
            }
            Some(row)
        })
        .collect()
}

/// Parses `adb shell getprop` output (`[key]: [value]` per line).
pub fn parse_getprop_map(output: &str) -> HashMap<String, String> {
    let Ok(line_re) = Regex::new(r"^\[([^\]]+)\]:\s*\[(.*)\]$") else {
        return HashMap::new();
    };
    output
        .lines()
        .filter_map(|line| {
            let caps = line_re.captures(line.trim())?;
            let key = caps[1].trim();
            (!key.is_empty()).then(|| (key.to_string(), caps[2].trim().to_string()))
        })
        .collect()
}

/// Extracts the foreground package from `dumpsys window windows`.
pub fn parse_focused_package(output: &str) -> Option<String> {
    let focus_re = Regex::new(r"mCurrentFocus.*?(\w+\.\w+(?:\.\w+)*)").ok()?;
    output
        .lines()
        .filter(|line| line.contains("mCurrentFocus"))
        .find_map(|line| focus_re.captures(line).map(|caps| caps[1].to_string()))
}

/// Extracts `package/activity` from the same focus line, expanding a leading-dot activity.
pub fn parse_focused_activity(output: &str) -> Option<(String, String)> {
    let focus_re = Regex::new(r"mCurrentFocus.*?\s([\w.]+)/([\w.$]+)").ok()?;
    output.lines().find_map(|line| {
        let caps = focus_re.captures(line)?;
        let package = caps[1].to_string();
        let activity = if caps[2].starts_with('.') {
            format!("{package}{}", &caps[2])
        } else {
            caps[2].to_string()
        };
        Some((package, activity))
    })
}
