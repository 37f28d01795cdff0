use std::fs;
use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::{info, warn};

use super::SessionClient;
use crate::app::error::AppError;

/// `<package with underscores>_<run id>.mp4`
pub fn video_file_name(package: &str, run_id: &str) -> String {
    let package = if package.trim().is_empty() { "app" } else { package.trim() };
    format!("{}_{run_id}.mp4", package.replace('.', "_"))
}

impl SessionClient {
    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Starts a server-side screen recording. A second call while recording is a no-op.
    pub fn start_screen_recording(&mut self) -> Result<(), AppError> {
        if self.recording {
            warn!(trace_id = %self.trace_id, "screen recording already running");
            return Ok(());
        }
        let session_id = self.validate_session()?;
        self.transport
            .start_recording_screen(&session_id)
            .map_err(|err| AppError::dependency(format!("Failed to start screen recording: {err}"), &self.trace_id))?;
        self.recording = true;
        info!(trace_id = %self.trace_id, "screen recording started");
        Ok(())
    }

    /// Stops the recording and writes the decoded video to `path`.
    pub fn stop_screen_recording(&mut self, path: &Path) -> Result<u64, AppError> {
        if !self.recording {
            return Err(AppError::validation("No screen recording in progress", &self.trace_id));
        }
        self.recording = false;
        let session_id = self.validate_session()?;
        let encoded = self
            .transport
            .stop_recording_screen(&session_id)
            .map_err(|err| AppError::dependency(format!("Failed to stop screen recording: {err}"), &self.trace_id))?;
        let video = STANDARD
            .decode(encoded.trim())
            .map_err(|err| AppError::dependency(format!("Screen recording is not base64: {err}"), &self.trace_id))?;
        if video.is_empty() {
            return Err(AppError::dependency("Screen recording returned no data", &self.trace_id));
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                AppError::system(format!("Failed to create video dir: {err}"), &self.trace_id)
            })?;
        }
        fs::write(path, &video)
            .map_err(|err| AppError::system(format!("Failed to write video: {err}"), &self.trace_id))?;
        info!(trace_id = %self.trace_id, path = %path.display(), bytes = video.len(), "screen recording saved");
        Ok(video.len() as u64)
    }
}
