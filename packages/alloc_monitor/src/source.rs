use thiserror::Error;

use crate::ThreadHandle;

/// The host runtime as seen by the monitor: something that can list the threads of the
/// process and report how many bytes each of them has allocated so far.
///
/// The package ships [`RegisteredThreads`][crate::RegisteredThreads], which works together with
/// the tracking [`Allocator`][crate::Allocator]. Hosts that already keep their own per-thread
/// accounting (or tests that want full control over what the monitor observes) can implement
/// this trait themselves and pass it to
/// [`MonitorBuilder::source()`][crate::MonitorBuilder::source].
///
/// All methods are called from the monitor's background thread, never concurrently with each
/// other for the same monitor.
#[cfg_attr(test, mockall::automock)]
pub trait ThreadSource: Send + Sync + 'static {
    /// Lists the threads that are alive right now.
    ///
    /// The order is irrelevant and duplicates are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the threads cannot be listed at this time. The monitor skips the
    /// current check and tries again on the next poll.
    fn live_threads(&self) -> Result<Vec<ThreadHandle>, SourceError>;

    /// Returns the number of bytes the thread has allocated since it started.
    ///
    /// The value must never decrease while the thread is alive. Returns `None` if the value
    /// cannot be read, typically because the thread has exited after it was last listed.
    fn allocated_bytes(&self, thread: ThreadHandle) -> Option<u64>;

    /// Returns the handle of the calling thread, if this source knows about it.
    ///
    /// The monitor calls this from its own worker thread to exclude itself from observation.
    /// Sources that never list the worker thread can keep the default implementation.
    fn current_thread(&self) -> Option<ThreadHandle> {
        None
    }

    /// Returns the name of the thread, if it has one.
    ///
    /// Called once when the monitor starts tracking a thread. The name is only used for display.
    fn thread_name(&self, _thread: ThreadHandle) -> Option<String> {
        None
    }
}

/// The live threads of the process could not be listed.
#[derive(Debug, Error)]
#[error("failed to list live threads: {reason}")]
pub struct SourceError {
    reason: String,
}

impl SourceError {
    /// Creates an error with a human-readable description of what went wrong.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// The human-readable description of what went wrong.
    #[must_use]
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(SourceError: Send, Sync);
    assert_impl_all!(MockThreadSource: Send, Sync);

    #[test]
    fn defaults_know_nothing_about_threads() {
        struct Empty;

        impl ThreadSource for Empty {
            fn live_threads(&self) -> Result<Vec<ThreadHandle>, SourceError> {
                Ok(Vec::new())
            }

            fn allocated_bytes(&self, _thread: ThreadHandle) -> Option<u64> {
                None
            }
        }

        assert_eq!(Empty.current_thread(), None);
        assert_eq!(Empty.thread_name(ThreadHandle::from_raw(1)), None);
    }

    #[test]
    fn source_error_keeps_reason() {
        let error = SourceError::new("procfs unavailable");

        assert_eq!(error.reason(), "procfs unavailable");
        assert!(error.to_string().contains("procfs unavailable"));
    }
}
