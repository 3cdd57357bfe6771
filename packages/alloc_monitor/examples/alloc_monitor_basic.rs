//! Watches a handful of worker threads and reports their lifecycle and allocation volume.
//!
//! Diagnostics from the monitor itself are printed when `RUST_LOG` enables them, for example
//! `RUST_LOG=alloc_monitor=debug`.
//!
//! Run with: `cargo run --example alloc_monitor_basic`

use std::hint::black_box;
use std::thread;
use std::time::Duration;

use alloc_monitor::{AllocationMonitor, Allocator};
use tracing_subscriber::EnvFilter;

#[global_allocator]
static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();

const WORKER_COUNT: usize = 3;

fn main() -> Result<(), alloc_monitor::MonitorError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("alloc_monitor=info"));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    println!("=== Allocation Monitor Example ===\n");

    let monitor = AllocationMonitor::builder()
        .poll_interval(Duration::from_millis(100))
        .build()?;

    monitor.on_thread_created(|thread| println!("+ {thread} started"));
    monitor.on_thread_died(|thread| println!("- {thread} exited"));
    monitor.on_byte_watch(1024_u64 * 1024, |thread, bytes| {
        println!("! {thread} has allocated {bytes} bytes");
    });

    let workers: Vec<_> = (1..=WORKER_COUNT)
        .map(|i| {
            thread::spawn(move || {
                // Each worker allocates a bit more than the previous one.
                for _ in 0..10 {
                    black_box(vec![0_u8; i * 64 * 1024]);
                    thread::sleep(Duration::from_millis(50));
                }
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(300));

    println!("\nTracked threads while workers are running:");
    monitor.print_to_stdout();
    println!();

    for worker in workers {
        worker.join().expect("worker thread panicked");
    }

    // Give the monitor time to notice the workers are gone.
    thread::sleep(Duration::from_millis(300));

    monitor.reset_all();
    println!("\nTracked threads after reset:");
    monitor.print_to_stdout();

    monitor.shutdown();
    Ok(())
}
