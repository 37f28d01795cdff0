//! Marker files used to stop or suspend a running crawl from another process.
//! Only existence matters; the content is a short human-readable note.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use crate::app::config::OutputSettings;

pub const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagFile {
    path: PathBuf,
}

impl FlagFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn raise(&self, note: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let note = if note.is_empty() { "1" } else { note };
        fs::write(&self.path, note)
    }

    /// Returns whether a flag was actually removed.
    pub fn clear(&self) -> std::io::Result<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub fn is_raised(&self) -> bool {
        self.path.is_file()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlFlags {
    pub shutdown: FlagFile,
    pub pause: FlagFile,
}

impl CrawlFlags {
    pub fn new(shutdown: impl Into<PathBuf>, pause: impl Into<PathBuf>) -> Self {
        Self {
            shutdown: FlagFile::new(shutdown),
            pause: FlagFile::new(pause),
        }
    }

    pub fn from_output(output: &OutputSettings) -> Self {
        Self::new(output.shutdown_flag(), output.pause_flag())
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.is_raised()
    }

    pub fn paused(&self) -> bool {
        self.pause.is_raised()
    }

    /// Blocks while the pause flag exists. Returns `true` when a shutdown was
    /// requested, either before or during the pause.
    pub fn wait_while_paused(&self, poll: Duration) -> bool {
        while self.paused() {
            if self.shutdown_requested() {
                return true;
            }
            thread::sleep(poll);
        }
        self.shutdown_requested()
    }
}
