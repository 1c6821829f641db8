//! Core counter types for viewcounter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The shared view tally for one page.
///
/// Records only ever come from a store; a client never constructs the
/// authoritative value itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterRecord {
    /// Identifier of the counted page.
    pub page_id: String,

    /// Number of counted views.
    pub count: u64,

    /// When the count last changed. Advisory only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl CounterRecord {
    /// Create a record with the given count, stamped now.
    #[must_use]
    pub fn new(page_id: impl Into<String>, count: u64) -> Self {
        Self {
            page_id: page_id.into(),
            count,
            updated_at: Some(Utc::now()),
        }
    }

    /// Whether this record belongs to the given page.
    #[must_use]
    pub fn is_for(&self, page_id: &str) -> bool {
        self.page_id == page_id
    }
}

impl std::fmt::Display for CounterRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.page_id, self.count)
    }
}
