use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::hashing::{composite_fingerprint, hamming_distance, NO_IMAGE_HASH};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Screen {
    pub id: u32,
    pub fingerprint: String,
    pub xml_hash: String,
    pub visual_hash: String,
    pub screenshot_path: Option<PathBuf>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub visit_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Transition {
    pub from: String,
    pub action: String,
    pub to: String,
}

/// Screen graph for one crawl: deduplicated screens plus every observed transition.
#[derive(Debug)]
pub struct ScreenTracker {
    screens: Vec<Screen>,
    by_fingerprint: HashMap<String, usize>,
    transitions: Vec<Transition>,
    action_history: HashMap<String, Vec<String>>,
    similarity_threshold: Option<u32>,
    screenshots_dir: Option<PathBuf>,
}

impl ScreenTracker {
    /// A negative threshold disables visual near-matching.
    pub fn new(similarity_threshold: i64, screenshots_dir: Option<PathBuf>) -> Self {
        Self {
            screens: Vec::new(),
            by_fingerprint: HashMap::new(),
            transitions: Vec::new(),
            action_history: HashMap::new(),
            similarity_threshold: u32::try_from(similarity_threshold).ok(),
            screenshots_dir,
        }
    }

    fn similar_screen(&self, visual_hash: &str) -> Option<(usize, u32)> {
        let threshold = self.similarity_threshold?;
        if visual_hash == NO_IMAGE_HASH {
            return None;
        }
        self.screens
            .iter()
            .enumerate()
            .filter(|(_, screen)| screen.visual_hash != NO_IMAGE_HASH)
            .map(|(index, screen)| (index, hamming_distance(visual_hash, &screen.visual_hash)))
            .filter(|(_, distance)| *distance <= threshold)
            .min_by_key(|(_, distance)| *distance)
    }

    /// Returns the canonical screen for these hashes, creating it on first sight.
    /// A visually similar existing screen wins over the freshly computed fingerprint.
    pub fn add_or_get_screen(&mut self, xml_hash: &str, visual_hash: &str, screenshot: &[u8]) -> Screen {
        let fingerprint = composite_fingerprint(xml_hash, visual_hash);
        let now = Utc::now();

        let existing = match self.by_fingerprint.get(&fingerprint) {
            Some(index) => Some(*index),
            None => self.similar_screen(visual_hash).map(|(index, distance)| {
                info!(
                    screen_id = self.screens[index].id,
                    distance,
                    "visually similar to a known screen; reusing it"
                );
                index
            }),
        };

        if let Some(index) = existing {
            let screen = &mut self.screens[index];
            screen.visit_count += 1;
            screen.last_seen = now;
            debug!(screen_id = screen.id, visits = screen.visit_count, "screen revisited");
            return screen.clone();
        }

        let id = self.screens.len() as u32 + 1;
        let screenshot_path = self.save_screenshot(id, visual_hash, screenshot);
        let screen = Screen {
            id,
            fingerprint: fingerprint.clone(),
            xml_hash: xml_hash.to_string(),
            visual_hash: visual_hash.to_string(),
            screenshot_path,
            first_seen: now,
            last_seen: now,
            visit_count: 1,
        };
        info!(screen_id = id, fingerprint = %fingerprint, "new screen");
        self.by_fingerprint.insert(fingerprint.clone(), self.screens.len());
        self.action_history.entry(fingerprint).or_default();
        self.screens.push(screen.clone());
        screen
    }

    fn save_screenshot(&self, id: u32, visual_hash: &str, bytes: &[u8]) -> Option<PathBuf> {
        let dir = self.screenshots_dir.as_deref()?;
        if bytes.is_empty() {
            return None;
        }
        let path = dir.join(screenshot_file_name(id, visual_hash));
        match fs::create_dir_all(dir).and_then(|_| fs::write(&path, bytes)) {
            Ok(()) => Some(path),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to save screenshot");
                None
            }
        }
    }

    /// Appends an edge; repeated identical edges are all kept.
    pub fn record_transition(&mut self, from: &str, action: &str, to: &str) {
        self.transitions.push(Transition {
            from: from.to_string(),
            action: action.to_string(),
            to: to.to_string(),
        });
        self.record_action(from, action);
    }

    /// Distinct action descriptions tried on a screen, in first-tried order.
    pub fn record_action(&mut self, fingerprint: &str, action: &str) {
        let history = self.action_history.entry(fingerprint.to_string()).or_default();
        if !history.iter().any(|existing| existing == action) {
            history.push(action.to_string());
        }
    }

    pub fn action_history(&self, fingerprint: &str) -> &[String] {
        self.action_history
            .get(fingerprint)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn visit_count(&self, fingerprint: &str) -> u32 {
        self.screen(fingerprint).map_or(0, |screen| screen.visit_count)
    }

    pub fn screen(&self, fingerprint: &str) -> Option<&Screen> {
        self.by_fingerprint
            .get(fingerprint)
            .and_then(|index| self.screens.get(*index))
    }

    pub fn screens(&self) -> &[Screen] {
        &self.screens
    }

    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    pub fn total_screens(&self) -> usize {
        self.screens.len()
    }

    pub fn total_transitions(&self) -> usize {
        self.transitions.len()
    }
}

pub fn screenshot_file_name(id: u32, visual_hash: &str) -> String {
    let prefix: String = visual_hash
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric())
        .take(8)
        .collect();
    format!("screen_{id}_{prefix}.png")
}

pub fn annotated_file_name(step: u32, screenshot: &Path) -> String {
    let stem = screenshot
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("screen");
    format!("step_{step}_{stem}_annotated.png")
}
