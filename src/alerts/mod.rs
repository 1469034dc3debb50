use crate::model::{AlertCommand, AlertLevel};
use serde::Serialize;
use std::collections::HashSet;
use uuid::Uuid;

/// Requested operation whose failure is reported without per-message detail.
pub const CAPACITY_ALLOCATION: &str = "ALLOCATE_CAPACITY";

pub fn is_failure_message(text: &str) -> bool {
    text.contains("error") || text.contains("failed") || text.starts_with("Fail")
}

/// One alert line for a failed long-running request: failing messages only,
/// each distinct text once, in first-seen order.
pub fn summarize(
    request_messages: &[String],
    requested_operations: &[String],
    resolved_name: &str,
    state: &str,
) -> String {
    let operations = requested_operations.join(", ");
    // No name or messages for capacity allocation.
    if requested_operations.iter().any(|op| op == CAPACITY_ALLOCATION) {
        return format!("{operations} {state}");
    }

    let mut seen = HashSet::new();
    let failures: Vec<&str> = request_messages
        .iter()
        .map(String::as_str)
        .filter(|text| is_failure_message(text))
        .filter(|text| seen.insert(*text))
        .collect();

    let summary = format!("{resolved_name} {operations} {state}");
    if failures.is_empty() {
        return summary;
    }
    format!("{summary} {}", failures.join(","))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AlertEntry {
    pub id: Uuid,
    pub level: AlertLevel,
    pub text: String,
    /// Occurrences after the first.
    pub duplicates: u32,
}

/// Pending user-facing alerts. Identical texts collapse into one entry whose
/// duplicate counter drives the badge in the view.
#[derive(Debug, Clone, Default)]
pub struct AggregatedAlert {
    entries: Vec<AlertEntry>,
}

impl AggregatedAlert {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, alert: AlertCommand) -> Uuid {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.text == alert.text) {
            entry.duplicates += 1;
            if alert.level == AlertLevel::Error {
                entry.level = AlertLevel::Error;
            }
            return entry.id;
        }
        let id = Uuid::new_v4();
        self.entries.push(AlertEntry {
            id,
            level: alert.level,
            text: alert.text,
            duplicates: 0,
        });
        id
    }

    pub fn dismiss(&mut self, id: Uuid) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        self.entries.len() != before
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn entries(&self) -> &[AlertEntry] {
        &self.entries
    }
}
