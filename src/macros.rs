// Call-site macros. These are thin sugar over `is_loggable` + `enqueue`;
// everything interesting happens behind the queue.

/// A stable `file::line` identifier for the current call site. Filter
/// caches and repetition counters key on this value, so keep each logging
/// call on its own line.
#[macro_export]
macro_rules! source_location {
    () => {
        concat!(file!(), "::", line!())
    };
}

/// Format and enqueue a record if the pipeline currently accepts its tags.
///
/// ```ignore
/// log_async!([LOG_INFO, "startup"], "listening on {}", addr);
/// ```
#[macro_export]
macro_rules! log_async {
    ([$($tag:expr),* $(,)?], $($arg:tt)+) => {{
        let tags: &[&'static str] = &[$($tag),*];
        if $crate::is_loggable(tags) {
            $crate::enqueue($crate::source_location!(), tags.to_vec(), format!($($arg)+));
        }
    }};
}

/// Like [`log_async!`], gated on a caller-supplied condition.
#[macro_export]
macro_rules! log_async_if {
    ($cond:expr, [$($tag:expr),* $(,)?], $($arg:tt)+) => {
        if $cond {
            $crate::log_async!([$($tag),*], $($arg)+);
        }
    };
}

/// Log only every `n`-th time this call site is reached, counted across all
/// threads. The counter advances whether or not the record is admitted.
#[macro_export]
macro_rules! log_async_every {
    ($n:expr, [$($tag:expr),* $(,)?], $($arg:tt)+) => {
        if $crate::every_n($n, $crate::source_location!()) {
            $crate::log_async!([$($tag),*], $($arg)+);
        }
    };
}

/// Like [`log_async_every!`], counted per thread and partitioned by `id`.
#[macro_export]
macro_rules! log_async_every_id {
    ($id:expr, $n:expr, [$($tag:expr),* $(,)?], $($arg:tt)+) => {
        if $crate::every_n_id($n, $id, $crate::source_location!()) {
            $crate::log_async!([$($tag),*], $($arg)+);
        }
    };
}
