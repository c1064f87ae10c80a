// Dispatch loop: the single consumer that drains the staging queue, fans
// batches out to every live sink in parallel, and reaps expired sinks.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, RwLock, Weak};
use std::time::Duration;

use crate::queue::StagingQueue;
use crate::record::Record;
use crate::sink::Sink;

/// Expired weak refs are swept in bulk once more than this many accumulate,
/// to amortize the writer lock.
const EXPIRED_SWEEP_THRESHOLD: usize = 4;

const IDLE_SLEEP: Duration = Duration::from_millis(1);

/// Queue-handling mode, chosen once at init.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitMode {
    /// Every batch is delivered in strict insertion order. Slower.
    PerfectlyOrdered,
    /// Batches are delivered as the channel hands them over.
    AllowUnordered,
    /// Drain but do not dispatch; for measuring raw queue throughput.
    NoOp,
    /// Drain with the ordered path but do not dispatch.
    NoOpOrdered,
}

impl InitMode {
    pub(crate) fn is_ordered(self) -> bool {
        matches!(self, InitMode::PerfectlyOrdered | InitMode::NoOpOrdered)
    }

    pub(crate) fn dispatches(self) -> bool {
        matches!(self, InitMode::PerfectlyOrdered | InitMode::AllowUnordered)
    }
}

pub(crate) type SinkRegistry = RwLock<Vec<Weak<dyn Sink>>>;

static REGISTRY: OnceLock<SinkRegistry> = OnceLock::new();
static SINK_COUNT: AtomicUsize = AtomicUsize::new(0);

pub(crate) fn registry() -> &'static SinkRegistry {
    REGISTRY.get_or_init(Default::default)
}

pub(crate) fn register(sink: Weak<dyn Sink>) {
    let mut sinks = registry().write().unwrap();
    sinks.push(sink);
    SINK_COUNT.store(sinks.len(), Ordering::Relaxed);
}

/// True while at least one registration is present, expired or not. Expired
/// entries disappear on the next sweep.
pub(crate) fn have_sinks() -> bool {
    SINK_COUNT.load(Ordering::Relaxed) > 0
}

fn sweep_expired(sinks: &SinkRegistry) {
    let mut guard = sinks.write().unwrap();
    guard.retain(|weak| weak.strong_count() > 0);
    if std::ptr::eq(sinks, registry()) {
        SINK_COUNT.store(guard.len(), Ordering::Relaxed);
    }
}

/// Hand one drained batch to every live sink, each on its own short-lived
/// task, and wait for all of them before returning. `batch` keeps its
/// allocation for the next drain.
pub(crate) async fn dispatch_batch(batch: &mut Vec<Record>, sinks: &'static SinkRegistry) {
    let shared = Arc::new(std::mem::take(batch));
    let mut handles = Vec::new();
    let mut expired = 0usize;

    {
        let registered = sinks.read().unwrap();
        for weak in registered.iter() {
            match weak.upgrade() {
                Some(sink) => {
                    let records = Arc::clone(&shared);
                    handles.push(tokio::spawn(async move {
                        sink.consume(&records);
                    }));
                }
                None => expired += 1,
            }
        }
    }

    for handle in handles {
        let _ = handle.await;
    }

    if expired > EXPIRED_SWEEP_THRESHOLD {
        sweep_expired(sinks);
    }

    *batch = Arc::try_unwrap(shared).unwrap_or_default();
    batch.clear();
}

/// The consumer loop. Runs until the stop flag is set, which shutdown does
/// only after the queue has drained, so the final batch is delivered before
/// the task exits.
pub(crate) async fn run_consumer(
    mode: InitMode,
    queue: &'static StagingQueue,
    stop: Arc<AtomicBool>,
) {
    let mut batch: Vec<Record> = Vec::new();
    let mut processed: u64 = 0;

    while !stop.load(Ordering::Relaxed) {
        queue.drain(&mut batch);
        if batch.is_empty() {
            tokio::time::sleep(IDLE_SLEEP).await;
            continue;
        }
        if mode.dispatches() {
            dispatch_batch(&mut batch, registry()).await;
        } else {
            processed += batch.len() as u64;
            batch.clear();
        }
    }

    if !mode.dispatches() {
        eprintln!("queue consumer exiting after {} records", processed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;
    use crate::sink::SinkCore;
    use std::sync::Mutex;

    struct CapturingSink {
        core: SinkCore,
        seen: Mutex<Vec<String>>,
    }

    impl CapturingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                core: SinkCore::new(),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    impl Sink for CapturingSink {
        fn consume(&self, batch: &[Record]) {
            let mut seen = self.seen.lock().unwrap();
            seen.extend(batch.iter().map(|r| r.payload.clone()));
        }

        fn core(&self) -> &SinkCore {
            &self.core
        }
    }

    fn record(payload: &str) -> Record {
        Record::new("dispatch_test", vec![], payload.to_string())
    }

    fn test_registry() -> &'static SinkRegistry {
        Box::leak(Box::new(RwLock::new(Vec::new())))
    }

    fn register_in(sinks: &SinkRegistry, sink: &Arc<CapturingSink>) {
        let as_dyn: Arc<dyn Sink> = Arc::clone(sink) as Arc<dyn Sink>;
        sinks.write().unwrap().push(Arc::downgrade(&as_dyn));
    }

    #[tokio::test]
    async fn test_batch_reaches_every_live_sink() {
        let sinks = test_registry();
        let a = CapturingSink::new();
        let b = CapturingSink::new();
        register_in(sinks, &a);
        register_in(sinks, &b);

        let mut batch = vec![record("one"), record("two")];
        dispatch_batch(&mut batch, sinks).await;

        assert_eq!(*a.seen.lock().unwrap(), vec!["one", "two"]);
        assert_eq!(*b.seen.lock().unwrap(), vec!["one", "two"]);
        // The batch vector comes back empty, allocation intact.
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_sinks_swept_past_threshold() {
        let sinks = test_registry();
        let keeper = CapturingSink::new();
        register_in(sinks, &keeper);

        for _ in 0..(EXPIRED_SWEEP_THRESHOLD + 1) {
            let transient = CapturingSink::new();
            register_in(sinks, &transient);
            drop(transient);
        }
        assert_eq!(sinks.read().unwrap().len(), EXPIRED_SWEEP_THRESHOLD + 2);

        let mut batch = vec![record("sweep")];
        dispatch_batch(&mut batch, sinks).await;

        assert_eq!(sinks.read().unwrap().len(), 1);
        assert_eq!(*keeper.seen.lock().unwrap(), vec!["sweep"]);
    }

    #[tokio::test]
    async fn test_few_expired_sinks_left_for_later() {
        let sinks = test_registry();
        for _ in 0..EXPIRED_SWEEP_THRESHOLD {
            let transient = CapturingSink::new();
            register_in(sinks, &transient);
            drop(transient);
        }

        let mut batch = vec![record("noop")];
        dispatch_batch(&mut batch, sinks).await;

        // At or below the threshold nothing is swept yet.
        assert_eq!(sinks.read().unwrap().len(), EXPIRED_SWEEP_THRESHOLD);
    }
}
