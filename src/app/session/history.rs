use std::collections::VecDeque;
use std::time::Instant;

use chrono::Utc;

use crate::app::models::ActionRecord;

/// Last `capacity` executed actions, oldest first.
#[derive(Debug, Clone)]
pub struct ActionHistory {
    records: VecDeque<ActionRecord>,
    capacity: usize,
}

impl ActionHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, record: ActionRecord) {
        while self.records.len() >= self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    pub fn record(
        &mut self,
        action: &str,
        target: Option<&str>,
        started: Instant,
        error: Option<String>,
    ) {
        self.push(ActionRecord {
            action: action.to_string(),
            target: target.map(str::to_string),
            success: error.is_none(),
            timestamp: Utc::now(),
            duration_ms: started.elapsed().as_millis(),
            error,
        });
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn recent(&self) -> impl Iterator<Item = &ActionRecord> {
        self.records.iter()
    }

    pub fn last(&self) -> Option<&ActionRecord> {
        self.records.back()
    }
}
