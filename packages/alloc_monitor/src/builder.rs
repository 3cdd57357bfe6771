use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::{
    AllocationMonitor, DEFAULT_POLL_INTERVAL, DEFAULT_WORKER_NAME, MonitorError,
    RegisteredThreads, Result, ThreadSource,
};

/// Creates instances of [`AllocationMonitor`].
///
/// All parameters are optional:
///
/// * `poll_interval` - how often the threads are checked. Defaults to
///   [`DEFAULT_POLL_INTERVAL`] (500 ms).
/// * `source` - where the threads and their allocation counters come from. Defaults to
///   [`RegisteredThreads`], which requires the tracking [`Allocator`][crate::Allocator] to be
///   installed as the global allocator.
/// * `worker_name` - name of the background thread that runs the checks.
///
/// Use `AllocationMonitor::builder()` to create a new instance of this builder.
///
/// # Example
///
/// ```
/// use std::time::Duration;
///
/// use alloc_monitor::{Allocator, AllocationMonitor};
///
/// #[global_allocator]
/// static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();
///
/// let monitor = AllocationMonitor::builder()
///     .poll_interval(Duration::from_millis(100))
///     .worker_name("allocation_watchdog")
///     .build()?;
///
/// assert_eq!(monitor.poll_interval(), Duration::from_millis(100));
/// # Ok::<(), alloc_monitor::MonitorError>(())
/// ```
#[must_use]
pub struct MonitorBuilder {
    poll_interval: Duration,
    source: Arc<dyn ThreadSource>,
    worker_name: String,
}

impl MonitorBuilder {
    pub(crate) fn new() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            source: Arc::new(RegisteredThreads),
            worker_name: DEFAULT_WORKER_NAME.to_string(),
        }
    }

    /// Sets how often the monitor checks the threads of the process.
    ///
    /// Thread lifecycle changes and threshold crossings are detected with up to this much delay.
    /// A thread that starts and exits within one interval may not be observed at all.
    pub fn poll_interval(self, poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            ..self
        }
    }

    /// Sets where the monitor gets the list of live threads and their allocation counters from.
    pub fn source(self, source: impl ThreadSource) -> Self {
        Self {
            source: Arc::new(source),
            ..self
        }
    }

    /// Sets the name of the background thread that runs the periodic checks.
    pub fn worker_name(self, worker_name: impl Into<String>) -> Self {
        Self {
            worker_name: worker_name.into(),
            ..self
        }
    }

    /// Takes the initial snapshot of the threads and starts the periodic checks.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError::InvalidPollInterval`] if the poll interval is zero.
    ///
    /// Returns [`MonitorError::SchedulerStart`] if the background thread cannot be started.
    pub fn build(self) -> Result<AllocationMonitor> {
        if self.poll_interval.is_zero() {
            return Err(MonitorError::InvalidPollInterval);
        }

        AllocationMonitor::start(self.source, self.poll_interval, self.worker_name)
    }
}

impl fmt::Debug for MonitorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitorBuilder")
            .field("poll_interval", &self.poll_interval)
            .field("source", &"<thread source>")
            .field("worker_name", &self.worker_name)
            .finish()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::MockThreadSource;

    fn empty_source() -> MockThreadSource {
        let mut source = MockThreadSource::new();
        source.expect_live_threads().returning(|| Ok(Vec::new()));
        source.expect_current_thread().returning(|| None);
        source
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let result = AllocationMonitor::builder()
            .source(empty_source())
            .poll_interval(Duration::ZERO)
            .build();

        assert!(matches!(result, Err(MonitorError::InvalidPollInterval)));
    }

    #[test]
    fn defaults_to_documented_interval() {
        let monitor = AllocationMonitor::builder()
            .source(empty_source())
            .build()
            .unwrap();

        assert_eq!(monitor.poll_interval(), DEFAULT_POLL_INTERVAL);
        assert!(monitor.is_running());
    }

    #[test]
    fn debug_output_names_settings() {
        let builder = AllocationMonitor::builder().worker_name("watcher");

        let debug = format!("{builder:?}");

        assert!(debug.contains("watcher"));
        assert!(debug.contains("poll_interval"));
    }
}
