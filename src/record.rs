// The unit of work flowing through the pipeline

use chrono::{DateTime, Local};

/// One log record: captured at the call site, staged in the queue, and
/// delivered to every live sink.
///
/// `insertion_index` is assigned by the staging queue at enqueue time and is
/// the total-order key for ordered delivery. Indices restart at zero with
/// each queue generation.
#[derive(Debug, Clone)]
pub struct Record {
    pub insertion_index: u64,
    pub timestamp: DateTime<Local>,
    /// Stable identifier of origin, typically `file::line`. Filter decision
    /// caches and repetition counters key on this value, so it must not vary
    /// for a given call site.
    pub source: &'static str,
    /// Descriptive labels. Assumed constant per source across all records.
    pub tags: Vec<&'static str>,
    pub payload: String,
}

impl Record {
    pub fn new(source: &'static str, tags: Vec<&'static str>, payload: String) -> Self {
        Self {
            insertion_index: 0,
            timestamp: Local::now(),
            source,
            tags,
            payload,
        }
    }
}

// Ordering is by insertion index alone so that a drained batch can be
// restored to enqueue order with a plain sort.

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.insertion_index == other.insertion_index
    }
}

impl Eq for Record {}

impl PartialOrd for Record {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Record {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.insertion_index.cmp(&other.insertion_index)
    }
}
