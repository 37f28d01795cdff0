use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

use tracing::debug;

use crate::app::adb::runner::run_command_with_timeout;

const LIVENESS_TIMEOUT: Duration = Duration::from_secs(3);

pub fn create_pid_file(path: &Path, pid: u32) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, format!("{pid}\n"))
}

/// `None` when the file is missing or does not hold a single numeric pid.
pub fn read_pid_file(path: &Path) -> Option<u32> {
    let contents = fs::read_to_string(path).ok()?;
    let line = contents.lines().next()?.trim();
    line.parse::<u32>().ok().filter(|pid| *pid > 0)
}

pub fn remove_pid_file(path: &Path) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(err) if err.kind() == ErrorKind::NotFound => false,
        Err(err) => {
            debug!(path = %path.display(), error = %err, "failed to remove pid file");
            false
        }
    }
}

/// Removes the file only when it still names `pid`, so a newer worker's file survives.
pub fn cleanup_pid_file_if_matches(path: &Path, pid: u32) -> bool {
    match read_pid_file(path) {
        Some(recorded) if recorded == pid => remove_pid_file(path),
        _ => false,
    }
}

pub fn process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let (program, args): (&str, Vec<String>) = if cfg!(windows) {
        ("tasklist", vec!["/FI".to_string(), format!("PID eq {pid}"), "/NH".to_string()])
    } else {
        ("kill", vec!["-0".to_string(), pid.to_string()])
    };
    match run_command_with_timeout(program, &args, LIVENESS_TIMEOUT, "pid-check") {
        Ok(output) if cfg!(windows) => output.stdout.contains(&pid.to_string()),
        Ok(output) => output.succeeded(),
        Err(err) => {
            debug!(pid, error = %err, "liveness probe failed");
            false
        }
    }
}

/// Pid recorded in `path` when that process is still alive.
pub fn running_pid(path: &Path) -> Option<u32> {
    read_pid_file(path).filter(|pid| process_alive(*pid))
}
