use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use arc_swap::ArcSwap;
use foldhash::HashSet;
use tracing::{debug, error, trace, warn};

use crate::reconcile::ThreadSetChanges;
use crate::scheduler::Scheduler;
use crate::watch::{ByteWatch, ThreadCallback};
use crate::{AllocationTracker, ByteThreshold, MonitorBuilder, Result, ThreadHandle, ThreadSource};

/// Observes the threads of the process, reporting threads that appear or disappear and threads
/// that allocate more than a configured number of bytes.
///
/// On creation, the monitor takes a snapshot of the live threads and starts tracking the
/// allocation volume of each from that moment on. A background thread then checks the threads
/// periodically (every 500 ms by default). Each check:
///
/// 1. Lists the live threads and compares them with the tracked ones.
/// 2. Stops tracking every tracked thread that is no longer alive and calls the
///    [`on_thread_died()`][Self::on_thread_died] callback for it.
/// 3. Starts tracking every thread that was not tracked before and calls the
///    [`on_thread_created()`][Self::on_thread_created] callback for it.
/// 4. Calls the [`on_byte_watch()`][Self::on_byte_watch] callback for every tracked thread
///    (including those just discovered) whose allocation since its baseline is over the
///    threshold and has grown since the callback last fired for that thread.
///
/// All died-callbacks of a check are called before any created-callbacks of the same check.
///
/// The background thread of the monitor itself is never reported.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicU64, Ordering};
///
/// use alloc_monitor::{Allocator, AllocationMonitor};
///
/// #[global_allocator]
/// static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();
///
/// let monitor = AllocationMonitor::new()?;
///
/// let heavy_allocators = Arc::new(AtomicU64::new(0));
///
/// monitor.on_thread_created(|thread| println!("{thread} appeared"));
/// monitor.on_thread_died(|thread| println!("{thread} is gone"));
/// monitor.on_byte_watch(10_u64 * 1024 * 1024, {
///     let heavy_allocators = Arc::clone(&heavy_allocators);
///     move |thread, bytes| {
///         heavy_allocators.fetch_add(1, Ordering::Relaxed);
///         println!("{thread} allocated {bytes} bytes");
///     }
/// });
///
/// // ... run the application ...
///
/// monitor.print_to_stdout();
/// monitor.shutdown();
/// # Ok::<(), alloc_monitor::MonitorError>(())
/// ```
///
/// # Thread safety
///
/// All methods take `&self` and can be called from any thread. Wrap the monitor in an `Arc` to
/// share it. Callbacks run on the background thread of the monitor and may call back into the
/// monitor, including [`shutdown()`][Self::shutdown].
///
/// A panic in a callback is caught and logged. The event is considered delivered and the check
/// carries on with the remaining callbacks.
pub struct AllocationMonitor {
    shared: Arc<Shared>,
    scheduler: Scheduler,
}

impl AllocationMonitor {
    /// Starts a monitor with the default settings: the threads known to the tracking
    /// [`Allocator`][crate::Allocator] are checked every 500 ms.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError::SchedulerStart`][crate::MonitorError::SchedulerStart] if the
    /// background thread cannot be started.
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    /// Creates a builder to configure a monitor before starting it.
    pub fn builder() -> MonitorBuilder {
        MonitorBuilder::new()
    }

    pub(crate) fn start(
        source: Arc<dyn ThreadSource>,
        poll_interval: Duration,
        worker_name: String,
    ) -> Result<Self> {
        let shared = Arc::new(Shared::new(source));

        // The worker does not exist yet, so it cannot end up in the initial snapshot.
        shared.track_initial_threads();

        let scheduler = Scheduler::start(
            worker_name,
            poll_interval,
            {
                let shared = Arc::clone(&shared);
                move || shared.exclude_current_thread()
            },
            {
                let shared = Arc::clone(&shared);
                move || shared.check_guarded()
            },
        )?;

        debug!(
            tracked = shared.tracked.len(),
            ?poll_interval,
            "allocation monitor started"
        );

        Ok(Self { shared, scheduler })
    }

    /// Sets the callback to call when a thread that was not tracked before is discovered.
    ///
    /// Replaces any previously set callback. Takes effect from the next check onward; threads
    /// discovered earlier are not reported retroactively.
    pub fn on_thread_created<F>(&self, callback: F)
    where
        F: Fn(ThreadHandle) + Send + Sync + 'static,
    {
        self.shared
            .on_created
            .store(Arc::new(ThreadCallback::new(callback)));
    }

    /// Sets the callback to call when a tracked thread is found to be no longer alive.
    ///
    /// Replaces any previously set callback. Takes effect from the next check onward.
    pub fn on_thread_died<F>(&self, callback: F)
    where
        F: Fn(ThreadHandle) + Send + Sync + 'static,
    {
        self.shared
            .on_died
            .store(Arc::new(ThreadCallback::new(callback)));
    }

    /// Sets the callback to call when a thread has allocated more than `threshold` bytes since
    /// its baseline.
    ///
    /// The callback receives the thread and its allocation delta. It is called when the delta
    /// is strictly greater than the threshold, and then not again for the same thread until the
    /// thread has allocated more.
    ///
    /// Replaces any previously set callback and threshold as one unit: a check uses either the
    /// old pair or the new pair, never a mix of the two. The new watch starts fresh, so it reports
    /// every thread that is over its threshold on the next check, including threads that the
    /// previous watch already reported.
    ///
    /// # Example
    ///
    /// ```
    /// use alloc_monitor::{Allocator, AllocationMonitor, ByteThreshold};
    ///
    /// #[global_allocator]
    /// static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();
    ///
    /// let monitor = AllocationMonitor::new()?;
    ///
    /// // Thresholds coming from a signed source are validated before use.
    /// let threshold = ByteThreshold::try_from(64_i64 * 1024)?;
    ///
    /// monitor.on_byte_watch(threshold, |thread, bytes| {
    ///     eprintln!("{thread} allocated {bytes} bytes");
    /// });
    /// # Ok::<(), alloc_monitor::MonitorError>(())
    /// ```
    pub fn on_byte_watch<F>(&self, threshold: impl Into<ByteThreshold>, callback: F)
    where
        F: Fn(ThreadHandle, u64) + Send + Sync + 'static,
    {
        self.shared
            .byte_watch
            .store(Arc::new(ByteWatch::new(threshold.into(), callback)));
    }

    /// Removes the byte watch, if one is set.
    pub fn clear_byte_watch(&self) {
        self.shared.byte_watch.store(Arc::new(ByteWatch::disabled()));
    }

    /// Calls `f` for every tracked thread.
    ///
    /// The set of trackers is captured when this is called. The monitor may start or stop
    /// tracking threads while `f` runs; `f` may call into the monitor.
    pub fn for_each_tracked(&self, mut f: impl FnMut(&AllocationTracker)) {
        for tracker in self.shared.tracked_snapshot() {
            f(&tracker);
        }
    }

    /// Returns the handles of all tracked threads, in ascending order.
    #[must_use]
    pub fn tracked_threads(&self) -> Vec<ThreadHandle> {
        self.shared
            .tracked_snapshot()
            .iter()
            .map(|tracker| tracker.handle())
            .collect()
    }

    /// Returns the number of tracked threads.
    #[must_use]
    pub fn tracked_count(&self) -> usize {
        self.shared.tracked.len()
    }

    /// Prints the allocation delta of every tracked thread to stdout, one line per thread.
    ///
    /// Prints nothing (not even an empty line) if no threads are tracked.
    #[cfg_attr(test, mutants::skip)] // Too difficult to test stdout output.
    pub fn print_to_stdout(&self) {
        self.for_each_tracked(|tracker| println!("{tracker}"));
    }

    /// Moves the baseline of every tracked thread to its current allocation counter.
    ///
    /// Threads whose counter cannot be read (because they are exiting) keep their baseline.
    pub fn reset_all(&self) {
        self.for_each_tracked(|tracker| {
            if !tracker.reset() {
                trace!(thread = %tracker.handle(), "skipped reset of unreadable thread");
            }
        });
    }

    /// The interval at which the threads are checked.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        self.scheduler.period()
    }

    /// Whether periodic checks are still happening.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.scheduler.is_running()
    }

    /// Stops the periodic checks.
    ///
    /// A check that is in progress is allowed to finish; no check starts after this returns.
    /// Calling this more than once has no further effect. The monitor keeps its last known state,
    /// which remains available via [`for_each_tracked()`][Self::for_each_tracked].
    ///
    /// When called from within a callback, the current check finishes and no new check starts.
    pub fn shutdown(&self) {
        self.scheduler.stop();
    }

    #[cfg(test)]
    pub(crate) fn check_now(&self) {
        self.shared.check();
    }
}

impl fmt::Debug for AllocationMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocationMonitor")
            .field("shared", &self.shared)
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

/// State shared between the monitor handle and its background worker.
struct Shared {
    source: Arc<dyn ThreadSource>,

    // Mutated only by the worker (and the constructor, before the worker exists).
    tracked: scc::HashMap<ThreadHandle, Arc<AllocationTracker>>,

    on_created: ArcSwap<ThreadCallback>,
    on_died: ArcSwap<ThreadCallback>,
    byte_watch: ArcSwap<ByteWatch>,

    // The worker thread, if the source can identify it.
    worker: OnceLock<ThreadHandle>,
}

impl Shared {
    fn new(source: Arc<dyn ThreadSource>) -> Self {
        Self {
            source,
            tracked: scc::HashMap::default(),
            on_created: ArcSwap::from_pointee(ThreadCallback::noop()),
            on_died: ArcSwap::from_pointee(ThreadCallback::noop()),
            byte_watch: ArcSwap::from_pointee(ByteWatch::disabled()),
            worker: OnceLock::new(),
        }
    }

    fn track_initial_threads(&self) {
        let threads = match self.source.live_threads() {
            Ok(threads) => threads,
            Err(e) => {
                warn!(error = %e, "cannot list threads at startup; starting with none tracked");
                return;
            }
        };

        for thread in threads {
            self.start_tracking(thread);
        }
    }

    fn exclude_current_thread(&self) {
        if let Some(worker) = self.source.current_thread() {
            _ = self.worker.set(worker);
            trace!(%worker, "excluding monitor worker thread from observation");
        }
    }

    fn start_tracking(&self, thread: ThreadHandle) -> bool {
        let Some(tracker) = AllocationTracker::new(thread, Arc::clone(&self.source)) else {
            trace!(%thread, "cannot read allocation counter, thread not tracked");
            return false;
        };

        // Already tracked only if the source listed the thread twice; the first tracker stays.
        _ = self.tracked.insert(thread, Arc::new(tracker));
        true
    }

    fn tracked_handles(&self) -> HashSet<ThreadHandle> {
        let mut handles = HashSet::default();
        self.tracked.scan(|thread, _| {
            handles.insert(*thread);
        });
        handles
    }

    fn tracked_snapshot(&self) -> Vec<Arc<AllocationTracker>> {
        let mut trackers = Vec::with_capacity(self.tracked.len());
        self.tracked.scan(|_, tracker| trackers.push(Arc::clone(tracker)));
        trackers.sort_unstable_by_key(|tracker| tracker.handle());
        trackers
    }

    // Callbacks are isolated individually; this only catches panics from the thread source.
    #[cfg_attr(test, mutants::skip)] // Only adds panic isolation around check().
    fn check_guarded(&self) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| self.check())) {
            error!(
                panic = panic_message(payload.as_ref()),
                "allocation monitor check panicked; check abandoned"
            );
        }
    }

    /// One check cycle.
    fn check(&self) {
        let live_threads = match self.source.live_threads() {
            Ok(threads) => threads,
            Err(e) => {
                warn!(error = %e, "cannot list threads; skipping check");
                return;
            }
        };

        let worker = self.worker.get().copied();
        let live: HashSet<ThreadHandle> = live_threads
            .into_iter()
            .filter(|thread| Some(*thread) != worker)
            .collect();

        let changes = ThreadSetChanges::between(&self.tracked_handles(), &live);

        if !changes.is_empty() {
            debug!(
                died = changes.died.len(),
                created = changes.created.len(),
                "thread set changed"
            );
        }

        // Evicted before any died-callback runs.
        for thread in &changes.died {
            _ = self.tracked.remove(thread);
        }

        let on_died = self.on_died.load_full();
        for &thread in &changes.died {
            run_callback("died", thread, || on_died.invoke(thread));
        }

        let on_created = self.on_created.load_full();
        for &thread in &changes.created {
            // Unreadable means it exited right after being listed. If it is somehow still alive,
            // it will be discovered again on the next check.
            if self.start_tracking(thread) {
                run_callback("created", thread, || on_created.invoke(thread));
            }
        }

        self.check_byte_watch();

        trace!(tracked = self.tracked.len(), "check completed");
    }

    fn check_byte_watch(&self) {
        // One load for the whole pass, so every thread is judged by the same watch.
        let watch = self.byte_watch.load_full();

        if watch.is_disabled() {
            return;
        }

        for tracker in self.tracked_snapshot() {
            if let Some(delta) = tracker.check_watch(&watch) {
                let thread = tracker.handle();
                run_callback("byte watch", thread, || watch.notify(thread, delta));
            }
        }
    }
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("source", &"<thread source>")
            .field("tracked", &self.tracked.len())
            .field("on_created", &self.on_created)
            .field("on_died", &self.on_died)
            .field("byte_watch", &self.byte_watch)
            .field("worker", &self.worker)
            .finish()
    }
}

/// Runs one user callback, containing any panic so that the rest of the check still happens.
fn run_callback(kind: &'static str, thread: ThreadHandle, callback: impl FnOnce()) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(callback)) {
        error!(
            callback = kind,
            %thread,
            panic = panic_message(payload.as_ref()),
            "allocation monitor callback panicked"
        );
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic payload>")
}
