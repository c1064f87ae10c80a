// Example demonstrating the taglog pipeline
//
// Run with: cargo run --example logging_demo

use taglog::Sink;
use taglog::{log_async, log_async_every, LOG_DEBUG, LOG_INFO, LOG_WARNING};

#[tokio::main]
async fn main() {
    println!("=== taglog demo ===\n");

    // One rotating file capped at 64 KiB keeping three generations, plus an
    // append-only file with a custom line format.
    let _rotated = taglog::register_size_rotated("demo_rotated.log", 64 * 1024, 3);
    let plain = taglog::register_file("demo.log");
    plain.set_configuration("%t [%T] %S - %m", "%H:%M:%S.$3");

    // Only warnings and up from here on.
    taglog::set_level(LOG_WARNING);

    log_async!([LOG_INFO, "startup"], "this line is filtered out");
    log_async!([LOG_WARNING, "startup"], "pid {} came up", std::process::id());

    taglog::set_level(taglog::LOG_ALL);

    for i in 0..100 {
        log_async!([LOG_DEBUG, "worker"], "iteration {}", i);
        // Sampled: every 25th pass of this call site.
        log_async_every!(25, [LOG_INFO, "worker"], "checkpoint at {}", i);
    }

    // Flush everything before the process ends.
    taglog::shutdown().await;

    println!("wrote demo.log and demo_rotated.log");
}
