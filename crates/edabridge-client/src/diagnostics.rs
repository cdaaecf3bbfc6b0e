//! Bounded in-memory event log for post-mortem inspection.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiagnosticEntry {
    pub at: DateTime<Utc>,
    pub event: &'static str,
    pub detail: String,
}

/// Ring of the most recent entries; the oldest is evicted past capacity.
#[derive(Debug)]
pub struct DiagnosticLog {
    capacity: usize,
    entries: VecDeque<DiagnosticEntry>,
}

impl DiagnosticLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    pub fn record(&mut self, event: &'static str, detail: impl Into<String>) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(DiagnosticEntry {
            at: Utc::now(),
            event,
            detail: detail.into(),
        });
    }

    pub fn entries(&self) -> Vec<DiagnosticEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
