#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Watches the threads of a process for lifecycle changes and per-thread allocation volume.
//!
//! An [`AllocationMonitor`] periodically compares the set of live threads against the set it
//! already knows and reports the differences through user-supplied callbacks:
//!
//! - [`on_thread_created()`][AllocationMonitor::on_thread_created] - a thread appeared.
//! - [`on_thread_died()`][AllocationMonitor::on_thread_died] - a thread is gone.
//! - [`on_byte_watch()`][AllocationMonitor::on_byte_watch] - a thread has allocated more than a
//!   threshold number of bytes since its baseline.
//!
//! Per-thread allocation volume comes from the tracking [`Allocator`], which must be installed as
//! the global allocator. Threads become visible to the monitor when they first allocate.
//!
//! # Simple usage
//!
//! ```
//! use std::time::Duration;
//!
//! use alloc_monitor::{Allocator, AllocationMonitor};
//!
//! #[global_allocator]
//! static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();
//!
//! fn main() -> Result<(), alloc_monitor::MonitorError> {
//!     let monitor = AllocationMonitor::builder()
//!         .poll_interval(Duration::from_millis(50))
//!         .build()?;
//!
//!     monitor.on_thread_created(|thread| println!("{thread} started"));
//!     monitor.on_thread_died(|thread| println!("{thread} exited"));
//!     monitor.on_byte_watch(1024_u64 * 1024, |thread, bytes| {
//!         println!("{thread} allocated {bytes} bytes");
//!     });
//!
//!     std::thread::spawn(|| {
//!         let data = vec![0_u8; 4 * 1024 * 1024];
//!         std::thread::sleep(Duration::from_millis(200));
//!         drop(data);
//!     })
//!     .join()
//!     .unwrap();
//!
//!     // Summary of every thread the monitor is tracking.
//!     monitor.print_to_stdout();
//!
//!     monitor.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! # Observation model
//!
//! The monitor is a sampler. Events are detected with up to one poll interval of delay, and a
//! thread that starts and exits between two checks may never be reported. Allocation volume is
//! cumulative: deallocations never reduce the delta of a thread.
//!
//! Callbacks run on the background thread of the monitor, one at a time. A callback that blocks
//! delays all further checks.
//!
//! # Custom thread sources
//!
//! Hosts that already track their threads can feed the monitor through their own
//! [`ThreadSource`] implementation via [`MonitorBuilder::source()`], in which case the tracking
//! allocator is not needed.
//!
//! # Logging
//!
//! The package emits diagnostics through [`tracing`](https://docs.rs/tracing). It never installs
//! a subscriber itself.
//!
//! # Miri compatibility
//!
//! Miri replaces the global allocator with its own logic, so the tracking allocator cannot
//! observe anything under Miri. Custom thread sources work normally.

mod allocator;
mod builder;
mod constants;
mod error;
mod monitor;
mod reconcile;
mod scheduler;
mod source;
mod thread_handle;
mod tracker;
mod watch;

pub use allocator::*;
pub use builder::*;
pub use constants::DEFAULT_POLL_INTERVAL;
pub(crate) use constants::{DEFAULT_WORKER_NAME, ERR_POISONED_LOCK};
pub use error::*;
pub use monitor::*;
pub use source::*;
pub use thread_handle::*;
pub use tracker::*;
pub use watch::ByteThreshold;
