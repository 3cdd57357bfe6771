use std::io;

use thiserror::Error;

/// Errors that can occur when configuring or starting an [`AllocationMonitor`][crate::AllocationMonitor].
///
/// Nothing that happens inside a check cycle is surfaced through this type. Transient failures
/// there are skipped and retried on the next poll.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MonitorError {
    /// The background thread that drives the periodic checks could not be started.
    ///
    /// No monitor exists when this is returned - there is no partially constructed state.
    #[error("failed to start the monitor worker thread: {source}")]
    SchedulerStart {
        /// The error reported by the operating system when spawning the thread.
        #[source]
        source: io::Error,
    },

    /// A byte-watch threshold was given as a value that cannot represent a number of bytes.
    #[error("invalid byte-watch threshold {value}: a threshold cannot be negative")]
    InvalidThreshold {
        /// The value that was rejected.
        value: i64,
    },

    /// The poll interval was zero, which would make the monitor spin.
    #[error("invalid poll interval: the interval must be greater than zero")]
    InvalidPollInterval,
}

/// A specialized `Result` type for monitor operations, returning the crate's
/// [`MonitorError`] type as the error value.
pub type Result<T> = std::result::Result<T, MonitorError>;
