// Sink contract and the filter/format state shared by every sink kind.

pub mod file;
pub mod udp;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::format::FormatConfig;
use crate::record::Record;

/// A predicate deciding whether a sink accepts a record. Filters that read
/// `timestamp` or `payload` are not source-determined; disable the decision
/// cache before installing one.
pub type Filter = Box<dyn Fn(&Record) -> bool + Send + Sync>;

/// A consumer of drained batches. Registered sinks are observed through weak
/// references; dropping the owning handle deregisters the sink on a later
/// sweep.
pub trait Sink: Send + Sync {
    /// Deliver one drained batch. Called by the dispatcher on every
    /// non-empty drain; errors are reported to stderr and never propagate.
    fn consume(&self, batch: &[Record]);

    fn core(&self) -> &SinkCore;

    /// Accepted by rotating file sinks; a no-op elsewhere.
    fn set_disk_threshold(&self, _fraction: f64) {}

    /// Install the log-line and timestamp templates.
    fn set_configuration(&self, log_format: &str, date_format: &str) {
        self.core().set_configuration(log_format, date_format);
    }

    fn add_filter(&self, filter: Filter) {
        self.core().add_filter(filter);
    }

    /// Install `filter` as the only filter, discarding any existing ones.
    fn add_exclusive_filter(&self, filter: Filter) {
        self.core().add_exclusive_filter(filter);
    }

    fn clear_filters(&self) {
        self.core().clear_filters();
    }

    fn disable_cache(&self) {
        self.core().disable_cache();
    }

    fn enable_cache(&self) {
        self.core().enable_cache();
    }
}

/// Filter list plus the per-source decision cache.
pub(crate) struct FilterState {
    filters: Vec<Filter>,
    decisions: HashMap<&'static str, bool>,
    cache_enabled: bool,
}

impl FilterState {
    fn new() -> Self {
        Self {
            filters: Vec::new(),
            decisions: HashMap::new(),
            cache_enabled: true,
        }
    }

    /// Empty filter list admits everything. Otherwise the cached decision
    /// for the record's source wins; on a miss the filters are evaluated in
    /// order and the outcome is cached if caching is enabled.
    pub(crate) fn meets_criteria(&mut self, record: &Record) -> bool {
        if self.filters.is_empty() {
            return true;
        }
        if let Some(&decision) = self.decisions.get(record.source) {
            return decision;
        }
        let decision = self.filters.iter().any(|filter| filter(record));
        if self.cache_enabled {
            self.decisions.insert(record.source, decision);
        }
        decision
    }
}

/// State common to every sink: filters, decision cache, compiled format,
/// and the sink-local quit flag set when the owning handle drops.
pub struct SinkCore {
    filters: Mutex<FilterState>,
    format: Mutex<FormatConfig>,
    quitting: AtomicBool,
}

impl Default for SinkCore {
    fn default() -> Self {
        Self::new()
    }
}

impl SinkCore {
    pub fn new() -> Self {
        Self {
            filters: Mutex::new(FilterState::new()),
            format: Mutex::new(FormatConfig::default()),
            quitting: AtomicBool::new(false),
        }
    }

    pub(crate) fn quitting(&self) -> bool {
        self.quitting.load(Ordering::Relaxed)
    }

    pub(crate) fn request_quit(&self) {
        self.quitting.store(true, Ordering::Relaxed);
    }

    pub(crate) fn lock_format(&self) -> MutexGuard<'_, FormatConfig> {
        self.format.lock().unwrap()
    }

    pub(crate) fn lock_filters(&self) -> MutexGuard<'_, FilterState> {
        self.filters.lock().unwrap()
    }

    pub fn set_configuration(&self, log_format: &str, date_format: &str) {
        self.format.lock().unwrap().set_format(log_format, date_format);
    }

    // Every filter mutation clears the decision cache; stale entries would
    // answer for filters that no longer exist.

    pub fn add_filter(&self, filter: Filter) {
        let mut state = self.filters.lock().unwrap();
        state.filters.push(filter);
        state.decisions.clear();
    }

    pub fn add_exclusive_filter(&self, filter: Filter) {
        let mut state = self.filters.lock().unwrap();
        state.filters.clear();
        state.filters.push(filter);
        state.decisions.clear();
    }

    pub fn clear_filters(&self) {
        let mut state = self.filters.lock().unwrap();
        state.filters.clear();
        state.decisions.clear();
    }

    /// Stop caching filter decisions and forget the ones already made. Use
    /// when filters reference record fields that vary per record.
    pub fn disable_cache(&self) {
        let mut state = self.filters.lock().unwrap();
        state.decisions.clear();
        state.cache_enabled = false;
    }

    /// Re-enable decision caching. The cache starts empty.
    pub fn enable_cache(&self) {
        let mut state = self.filters.lock().unwrap();
        state.cache_enabled = true;
    }
}

pub(crate) const QUIT_POLL_INTERVAL: Duration = Duration::from_millis(512);

/// Sleep until `deadline`, polling `should_quit` at least every 512 ms so
/// shutdown latency stays bounded. The final second sleeps precisely.
pub(crate) async fn interruptible_sleep_until<F: Fn() -> bool>(
    deadline: tokio::time::Instant,
    should_quit: F,
) {
    loop {
        if should_quit() {
            return;
        }
        let now = tokio::time::Instant::now();
        if deadline <= now {
            return;
        }
        if deadline - now > Duration::from_secs(1) {
            tokio::time::sleep(QUIT_POLL_INTERVAL).await;
        } else {
            tokio::time::sleep_until(deadline).await;
            return;
        }
    }
}

pub(crate) async fn interruptible_sleep<F: Fn() -> bool>(duration: Duration, should_quit: F) {
    interruptible_sleep_until(tokio::time::Instant::now() + duration, should_quit).await;
}
