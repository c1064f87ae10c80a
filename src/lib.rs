// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Asynchronous, tag-oriented logging pipeline.
//!
//! Call sites deposit records into a lock-free staging queue and return
//! immediately; a single background consumer drains the queue (preserving
//! insertion order if asked to) and fans each batch out to every registered
//! sink in parallel. Sinks are rotating files or UDP endpoints.
//!
//! Records carry tags rather than a level. Tags are more descriptive than
//! levels and let a sink filter on anything a record holds, while the six
//! conventional level tags (`LOG_FATAL` through `LOG_ALL`) still give a
//! process-wide severity cutoff via [`set_level`].
//!
//! The pipeline is best-effort: no producer ever observes a failure to log,
//! sink errors go to stderr, and one sink's trouble never affects another.
//!
//! Registration and [`init`] spawn tokio tasks and must run inside a tokio
//! runtime. Tags given on any one call site are assumed constant for the
//! life of the process; several caches rely on it.
//!
//! ```ignore
//! let _log = taglog::register_file("app.log");
//! taglog::set_level(taglog::LOG_INFO);
//! log_async!([taglog::LOG_INFO, "startup"], "pid {}", std::process::id());
//! // ...
//! taglog::shutdown().await;
//! ```

pub mod config;
mod dispatch;
pub mod format;
#[macro_use]
mod macros;
mod policy;
mod queue;
pub mod record;
pub mod sink;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tokio::task::JoinHandle;

pub use dispatch::InitMode;
pub use format::{DEFAULT_DATE_FORMAT, DEFAULT_LOG_FORMAT, ISO_8601_DATE_FORMAT};
pub use policy::{
    count_of, count_of_id, every_n, every_n_id, set_level, LOG_ALL, LOG_DEBUG, LOG_ERROR,
    LOG_FATAL, LOG_INFO, LOG_WARNING,
};
pub use record::Record;
pub use sink::file::RotatingFileSink;
pub use sink::udp::{IpVersion, UdpSink};
pub use sink::{Filter, Sink};

const SHUTDOWN_POLL: Duration = Duration::from_millis(256);

static INITIALIZED: AtomicBool = AtomicBool::new(false);
static QUIT: AtomicBool = AtomicBool::new(false);
/// Sinks currently reporting a disk above threshold; any one of them gates
/// ingestion.
static FULL_SINKS: AtomicUsize = AtomicUsize::new(0);

static QUEUE: OnceLock<queue::StagingQueue> = OnceLock::new();

struct ConsumerHandle {
    stop: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

static CONSUMER: OnceLock<ConsumerHandle> = OnceLock::new();

/// Default used-disk fraction applied to newly registered file sinks.
static DISK_RATIO: Mutex<f64> = Mutex::new(1.0);

fn staging_queue() -> &'static queue::StagingQueue {
    QUEUE.get_or_init(queue::StagingQueue::new)
}

pub(crate) fn note_disk_full_transition(full: bool) {
    if full {
        FULL_SINKS.fetch_add(1, Ordering::Relaxed);
    } else {
        FULL_SINKS.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Start the pipeline in the given mode. The first call wins; later calls
/// are silent no-ops, so the `register_*` functions can call this freely.
/// Must run inside a tokio runtime.
pub fn init(mode: InitMode) {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    let queue = staging_queue();
    queue.set_ordered(mode.is_ordered());

    let stop = Arc::new(AtomicBool::new(false));
    let task = tokio::spawn(dispatch::run_consumer(mode, queue, Arc::clone(&stop)));
    let _ = CONSUMER.set(ConsumerHandle {
        stop,
        task: Mutex::new(Some(task)),
    });
}

/// Stop accepting new records, wait for everything already queued to reach
/// the sinks, then retire the consumer. Optional, but without it records
/// still in flight at process exit are lost.
pub async fn shutdown() {
    if !INITIALIZED.load(Ordering::SeqCst) {
        return;
    }

    QUIT.store(true, Ordering::SeqCst);

    while staging_queue().requests_remaining() > 0 {
        tokio::time::sleep(SHUTDOWN_POLL).await;
    }

    if let Some(consumer) = CONSUMER.get() {
        consumer.stop.store(true, Ordering::SeqCst);
        let task = consumer.task.lock().unwrap().take();
        if let Some(task) = task {
            // The consumer finishes its current iteration, so the final
            // batch lands before this returns.
            let _ = task.await;
        }
    }
}

/// The cheap ingress gate: false once shutdown began, while any sink's disk
/// is above threshold, when nothing is registered, or when the level policy
/// rejects `tags`.
pub fn is_loggable(tags: &[&'static str]) -> bool {
    !QUIT.load(Ordering::Relaxed)
        && FULL_SINKS.load(Ordering::Relaxed) == 0
        && dispatch::have_sinks()
        && policy::level_allows(tags)
}

/// Deposit one record. Non-blocking; safe from any thread or task.
pub fn enqueue(source: &'static str, tags: Vec<&'static str>, payload: String) {
    staging_queue().enqueue(Record::new(source, tags, payload));
}

/// Discard records once the log filesystem is this full, as a percentage:
/// 0 stops logging immediately, 100 logs until the disk is full. Applies to
/// every live file sink and to ones registered later.
pub fn set_disk_space_threshold(percent: f64) {
    let ratio = (percent / 100.0).clamp(0.0, 1.0);
    *DISK_RATIO.lock().unwrap() = ratio;

    let sinks = dispatch::registry().read().unwrap();
    for weak in sinks.iter() {
        if let Some(sink) = weak.upgrade() {
            sink.set_disk_threshold(ratio);
        }
    }
}

fn register<S: Sink + 'static>(sink: Arc<S>) -> Arc<S> {
    init(InitMode::PerfectlyOrdered);
    let as_dyn: Arc<dyn Sink> = Arc::clone(&sink) as Arc<dyn Sink>;
    dispatch::register(Arc::downgrade(&as_dyn));
    sink
}

fn file_sink(path: impl Into<PathBuf>) -> Arc<RotatingFileSink> {
    let sink = RotatingFileSink::new(path);
    sink.set_disk_threshold(*DISK_RATIO.lock().unwrap());
    sink
}

/// Append-only file sink. The handle owns the sink; dropping it
/// deregisters the sink on a later sweep.
pub fn register_file(path: impl Into<PathBuf>) -> Arc<RotatingFileSink> {
    register(file_sink(path))
}

/// File sink rotating at `max_bytes`, retaining `keep_n` files.
pub fn register_size_rotated(
    path: impl Into<PathBuf>,
    max_bytes: u64,
    keep_n: u32,
) -> Arc<RotatingFileSink> {
    let sink = file_sink(path);
    sink.rotate_at_size(max_bytes, keep_n);
    register(sink)
}

/// File sink rotating every `secs` seconds, retaining `keep_n` files.
pub fn register_interval_rotated(
    path: impl Into<PathBuf>,
    secs: u64,
    keep_n: u32,
) -> Arc<RotatingFileSink> {
    let sink = file_sink(path);
    sink.rotate_after(secs, keep_n);
    register(sink)
}

/// File sink switching to a new date-suffixed file at `hour:minute:second`
/// local time each day.
pub fn register_daily(
    path: impl Into<PathBuf>,
    hour: u32,
    minute: u32,
    second: u32,
) -> Arc<RotatingFileSink> {
    let sink = file_sink(path);
    sink.rotate_at_time(hour, minute, second);
    register(sink)
}

/// UDP sink sending each record as one datagram to an IPv4 endpoint.
pub fn register_udp_v4(host: &str, port: u16) -> Arc<UdpSink> {
    register(UdpSink::new(host, port, IpVersion::V4))
}

/// UDP sink sending each record as one datagram to an IPv6 endpoint.
pub fn register_udp_v6(host: &str, port: u16) -> Arc<UdpSink> {
    register(UdpSink::new(host, port, IpVersion::V6))
}
