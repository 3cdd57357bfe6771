use std::sync::Mutex;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::{ERR_POISONED_LOCK, MonitorError, Result};

/// Runs a job at a fixed rate on one dedicated background thread.
///
/// Executions never overlap. If one execution takes longer than the period, the next one starts
/// as soon as the previous one has finished and the schedule continues from that point, without
/// trying to catch up on missed executions.
#[derive(Debug)]
pub(crate) struct Scheduler {
    period: Duration,
    running: Mutex<Option<Running>>,
}

#[derive(Debug)]
struct Running {
    // Sending a message or dropping the sender both stop the worker.
    stop_tx: mpsc::Sender<()>,
    join_handle: JoinHandle<()>,
}

impl Scheduler {
    /// Starts the worker thread. `on_start` runs once on the worker thread before the first
    /// execution of `job`, which happens one period after starting.
    pub(crate) fn start<S, J>(name: String, period: Duration, on_start: S, job: J) -> Result<Self>
    where
        S: FnOnce() + Send + 'static,
        J: FnMut() + Send + 'static,
    {
        let (stop_tx, stop_rx) = mpsc::channel();

        let join_handle = thread::Builder::new()
            .name(name)
            .spawn(move || {
                on_start();
                worker_entrypoint(period, &stop_rx, job);
            })
            .map_err(|source| MonitorError::SchedulerStart { source })?;

        Ok(Self {
            period,
            running: Mutex::new(Some(Running {
                stop_tx,
                join_handle,
            })),
        })
    }

    pub(crate) fn period(&self) -> Duration {
        self.period
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.lock().expect(ERR_POISONED_LOCK).is_some()
    }

    /// Stops the worker. Returns once the worker has exited, after finishing any execution that
    /// was in progress. Calling this again after the first call does nothing.
    ///
    /// When called from the worker thread itself, the worker is only told to stop - it exits
    /// once the current execution returns.
    #[cfg_attr(test, mutants::skip)] // Impractical to test that stuff stops happening.
    pub(crate) fn stop(&self) {
        let Some(running) = self.running.lock().expect(ERR_POISONED_LOCK).take() else {
            return;
        };

        // The worker may already be gone if it panicked, in which case there is no one to tell.
        _ = running.stop_tx.send(());

        if running.join_handle.thread().id() == thread::current().id() {
            debug!("scheduler stopped from its own worker thread");
            return;
        }

        if thread::panicking() {
            // Joining could hang or hide the original panic. The worker exits on its own.
            return;
        }

        // A panic on the worker has already been reported by the panic hook.
        _ = running.join_handle.join();

        debug!("scheduler stopped");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_entrypoint(period: Duration, stop_rx: &mpsc::Receiver<()>, mut job: impl FnMut()) {
    let Some(mut next_run) = Instant::now().checked_add(period) else {
        // The period is so long that the first execution would never arrive.
        _ = stop_rx.recv();
        return;
    };

    loop {
        let timeout = next_run.saturating_duration_since(Instant::now());

        match stop_rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
            Err(RecvTimeoutError::Timeout) => {}
        }

        job();

        let now = Instant::now();
        next_run = match next_run.checked_add(period) {
            Some(next) if next >= now => next,
            _ => {
                trace!("execution overran its period, rescheduling from now");
                now
            }
        };
    }
}
