// Ingress policies: level tags, the process-wide level predicate, and
// per-source repetition counters.

use std::cell::RefCell;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{OnceLock, RwLock};

// Level tags, ordered most to least severe. LOG_FATAL is only a level; it
// never terminates the process.
pub const LOG_FATAL: &str = "LOG_FATAL";
pub const LOG_ERROR: &str = "LOG_ERROR";
pub const LOG_WARNING: &str = "LOG_WARN";
pub const LOG_INFO: &str = "LOG_INFO";
pub const LOG_DEBUG: &str = "LOG_DEBUG";
/// Allows everything to be logged, even records carrying no level tag.
pub const LOG_ALL: &str = "LOG_ALL";

pub(crate) const LOG_LEVELS: [&str; 6] = [
    LOG_FATAL,
    LOG_ERROR,
    LOG_WARNING,
    LOG_INFO,
    LOG_DEBUG,
    LOG_ALL,
];

const LOG_ALL_POSITION: usize = 5;

static LEVEL_POSITION: AtomicUsize = AtomicUsize::new(LOG_ALL_POSITION);

/// Install the process-wide level predicate. Unknown names fall back to
/// `LOG_ALL`.
pub fn set_level(name: &str) {
    let position = LOG_LEVELS
        .iter()
        .position(|level| *level == name)
        .unwrap_or(LOG_ALL_POSITION);
    LEVEL_POSITION.store(position, Ordering::Relaxed);
}

/// True when the installed level admits a record with `tags`: either the
/// level is `LOG_ALL`, or the tag set names a level at least as severe.
pub(crate) fn level_allows(tags: &[&'static str]) -> bool {
    let position = LEVEL_POSITION.load(Ordering::Relaxed);
    if position == LOG_ALL_POSITION {
        return true;
    }
    tags.iter()
        .any(|tag| LOG_LEVELS[..=position].iter().any(|level| level == tag))
}

#[cfg(test)]
pub(crate) fn reset_level_for_tests() {
    LEVEL_POSITION.store(LOG_ALL_POSITION, Ordering::Relaxed);
}

// Counters shared across every producer, keyed by call site. The counter is
// primed at 1 on first sight so the observed sequence is 0, 1, 2, ...

static SOURCE_COUNTERS: OnceLock<RwLock<HashMap<&'static str, AtomicU32>>> = OnceLock::new();

fn source_counters() -> &'static RwLock<HashMap<&'static str, AtomicU32>> {
    SOURCE_COUNTERS.get_or_init(Default::default)
}

/// How many times `source` has been counted before this call. Results are
/// unique across concurrent producers; the count wraps around `u32`.
pub fn count_of(source: &'static str) -> u32 {
    {
        let counters = source_counters().read().unwrap();
        if let Some(counter) = counters.get(source) {
            return counter.fetch_add(1, Ordering::Relaxed);
        }
    }
    let mut counters = source_counters().write().unwrap();
    match counters.entry(source) {
        // Another producer registered the source while we waited.
        Entry::Occupied(entry) => entry.get().fetch_add(1, Ordering::Relaxed),
        Entry::Vacant(entry) => {
            entry.insert(AtomicU32::new(1));
            0
        }
    }
}

thread_local! {
    static ID_COUNTERS: RefCell<HashMap<(u32, &'static str), u32>> = RefCell::new(HashMap::new());
}

/// Per-thread variant of [`count_of`], partitioned by `id`. No locks and no
/// cross-thread visibility.
pub fn count_of_id(id: u32, source: &'static str) -> u32 {
    ID_COUNTERS.with(|counters| {
        let mut counters = counters.borrow_mut();
        let count = counters.entry((id, source)).or_insert(0);
        let seen = *count;
        *count = count.wrapping_add(1);
        seen
    })
}

/// True on every `n`-th sighting of `source`, starting with the first.
pub fn every_n(n: u32, source: &'static str) -> bool {
    count_of(source) % n.max(1) == 0
}

/// Per-thread variant of [`every_n`].
pub fn every_n_id(n: u32, id: u32, source: &'static str) -> bool {
    count_of_id(id, source) % n.max(1) == 0
}
