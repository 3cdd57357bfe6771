use std::time::Duration;

pub(crate) const ERR_POISONED_LOCK: &str =
    "encountered poisoned lock - a panic occurred while monitor state was being updated";

/// How often the monitor checks the threads of the process unless configured otherwise.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Name given to the background thread that runs the periodic checks unless configured otherwise.
pub(crate) const DEFAULT_WORKER_NAME: &str = "alloc_monitor";
