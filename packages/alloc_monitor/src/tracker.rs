use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{self, AtomicU64};

use crate::watch::ByteWatch;
use crate::{ThreadHandle, ThreadSource};

/// Measures how many bytes one thread has allocated since a resettable baseline.
///
/// The monitor creates one tracker per thread when it first observes the thread, with the
/// baseline set to the thread's allocation counter at that moment. Trackers are handed out by
/// [`AllocationMonitor::for_each_tracked()`][crate::AllocationMonitor::for_each_tracked].
///
/// All methods take `&self` and may be called from any thread, concurrently with the monitor's
/// background checks.
pub struct AllocationTracker {
    thread: ThreadHandle,
    name: Option<String>,
    source: Arc<dyn ThreadSource>,
    baseline: AtomicU64,

    // Generation of the byte watch that last fired for this thread, and the counter value at
    // that moment. The same watch only fires again once the counter has grown past the value;
    // a different watch is not bound by it. Only the monitor worker writes these.
    reported_generation: AtomicU64,
    last_reported: AtomicU64,
}

impl AllocationTracker {
    /// Starts tracking `thread`, using its current counter value as the baseline.
    ///
    /// Returns `None` if the counter cannot be read (the thread is already gone).
    pub(crate) fn new(thread: ThreadHandle, source: Arc<dyn ThreadSource>) -> Option<Self> {
        let baseline = source.allocated_bytes(thread)?;
        let name = source.thread_name(thread);

        Some(Self {
            thread,
            name,
            source,
            baseline: AtomicU64::new(baseline),
            reported_generation: AtomicU64::new(0),
            last_reported: AtomicU64::new(0),
        })
    }

    /// The thread this tracker measures.
    #[must_use]
    pub fn handle(&self) -> ThreadHandle {
        self.thread
    }

    /// The name the thread had when tracking started, if it has one.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The counter value that deltas are measured against.
    #[must_use]
    pub fn baseline(&self) -> u64 {
        self.baseline.load(atomic::Ordering::Acquire)
    }

    /// Bytes allocated by the thread since the baseline.
    ///
    /// Returns `None` if the allocation counter of the thread cannot be read, which happens once
    /// the thread has exited.
    ///
    /// For a live thread and a fixed baseline, successive calls never return a smaller value.
    #[must_use]
    pub fn delta(&self) -> Option<u64> {
        self.read().map(|reading| reading.delta)
    }

    /// Moves the baseline to the current counter value, so that [`delta()`][Self::delta]
    /// measures from now on.
    ///
    /// Returns `false` and leaves the baseline untouched if the counter cannot be read.
    pub fn reset(&self) -> bool {
        let Some(current) = self.source.allocated_bytes(self.thread) else {
            return false;
        };

        self.baseline.store(current, atomic::Ordering::Release);
        true
    }

    /// Evaluates `watch` for this thread.
    ///
    /// Returns the delta to report if it is over the threshold and the thread has allocated
    /// more since `watch` last reported it. Returns `None` if there is nothing to report or the
    /// counter cannot be read.
    pub(crate) fn check_watch(&self, watch: &ByteWatch) -> Option<u64> {
        let reading = self.read()?;

        if !watch.threshold().is_exceeded_by(reading.delta) {
            return None;
        }

        let same_watch =
            self.reported_generation.load(atomic::Ordering::Relaxed) == watch.generation();

        if same_watch && reading.counter <= self.last_reported.load(atomic::Ordering::Relaxed) {
            return None;
        }

        self.reported_generation
            .store(watch.generation(), atomic::Ordering::Relaxed);
        self.last_reported
            .store(reading.counter, atomic::Ordering::Relaxed);

        Some(reading.delta)
    }

    fn read(&self) -> Option<Reading> {
        // Baseline first: a concurrent reset() can only move it up to a value that the counter
        // has already reached, so the counter read afterwards is never below it.
        let baseline = self.baseline();
        let counter = self.source.allocated_bytes(self.thread)?;

        Some(Reading {
            counter,
            delta: counter.saturating_sub(baseline),
        })
    }
}

impl fmt::Debug for AllocationTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocationTracker")
            .field("thread", &self.thread)
            .field("name", &self.name)
            .field("baseline", &self.baseline)
            .field("reported_generation", &self.reported_generation)
            .field("last_reported", &self.last_reported)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for AllocationTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.thread)?;

        if let Some(name) = &self.name {
            write!(f, " ({name})")?;
        }

        match self.delta() {
            Some(delta) => write!(f, ": {delta} bytes allocated since baseline"),
            None => write!(f, ": <unavailable>"),
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Reading {
    counter: u64,
    delta: u64,
}
