//! End-to-end scenarios for `AllocationMonitor` driven by a scripted thread source.
//!
//! The scripted source stands in for the host runtime, so threads can be created, killed and
//! made to allocate without real threads, while the monitor runs its real background schedule.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use alloc_monitor::{AllocationMonitor, ByteThreshold, SourceError, ThreadHandle, ThreadSource};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const PATIENCE: Duration = Duration::from_secs(10);

const MAIN: ThreadHandle = ThreadHandle::from_raw(1);
const X: ThreadHandle = ThreadHandle::from_raw(2);
const Y: ThreadHandle = ThreadHandle::from_raw(3);

/// The simulated host runtime: live threads with their allocation counters.
#[derive(Debug, Default)]
struct Runtime {
    threads: Mutex<BTreeMap<ThreadHandle, u64>>,
    polls: AtomicU64,

    // Added to every counter read, to make threads allocate continuously.
    growth_per_read: AtomicU64,
}

impl Runtime {
    fn with_threads(threads: &[(ThreadHandle, u64)]) -> Arc<Self> {
        Arc::new(Self {
            threads: Mutex::new(threads.iter().copied().collect()),
            ..Self::default()
        })
    }

    fn spawn(&self, thread: ThreadHandle, counter: u64) {
        self.threads.lock().unwrap().insert(thread, counter);
    }

    fn kill(&self, thread: ThreadHandle) {
        self.threads.lock().unwrap().remove(&thread);
    }

    fn set_counter(&self, thread: ThreadHandle, counter: u64) {
        *self.threads.lock().unwrap().get_mut(&thread).unwrap() = counter;
    }

    /// Blocks until the monitor has completed at least `count` more full checks.
    fn wait_for_checks(&self, count: u64) {
        // A check is complete once the next one has started listing threads.
        let target = self.polls.load(Ordering::SeqCst) + count + 1;
        wait_until(|| self.polls.load(Ordering::SeqCst) >= target);
    }
}

#[derive(Debug)]
struct ScriptedSource(Arc<Runtime>);

impl ThreadSource for ScriptedSource {
    fn live_threads(&self) -> Result<Vec<ThreadHandle>, SourceError> {
        self.0.polls.fetch_add(1, Ordering::SeqCst);
        Ok(self.0.threads.lock().unwrap().keys().copied().collect())
    }

    fn allocated_bytes(&self, thread: ThreadHandle) -> Option<u64> {
        let growth = self.0.growth_per_read.load(Ordering::Relaxed);

        let mut threads = self.0.threads.lock().unwrap();
        let counter = threads.get_mut(&thread)?;
        *counter += growth;
        Some(*counter)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum Event {
    Created(ThreadHandle),
    Died(ThreadHandle),
    Watch(ThreadHandle, u64),
}

#[derive(Debug, Default)]
struct Recorder {
    events: Mutex<Vec<Event>>,
}

impl Recorder {
    fn attach(monitor: &AllocationMonitor, threshold: impl Into<ByteThreshold>) -> Arc<Self> {
        let recorder = Arc::new(Self::default());

        monitor.on_thread_created({
            let recorder = Arc::clone(&recorder);
            move |thread| recorder.push(Event::Created(thread))
        });
        monitor.on_thread_died({
            let recorder = Arc::clone(&recorder);
            move |thread| recorder.push(Event::Died(thread))
        });
        monitor.on_byte_watch(threshold, {
            let recorder = Arc::clone(&recorder);
            move |thread, delta| recorder.push(Event::Watch(thread, delta))
        });

        recorder
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }

    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    fn count(&self, event: &Event) -> usize {
        self.events().iter().filter(|e| *e == event).count()
    }

    fn watch_events(&self, thread: ThreadHandle) -> Vec<u64> {
        self.events()
            .iter()
            .filter_map(|event| match event {
                Event::Watch(t, delta) if *t == thread => Some(*delta),
                _ => None,
            })
            .collect()
    }
}

fn wait_until(condition: impl Fn() -> bool) {
    let deadline = Instant::now() + PATIENCE;

    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(1));
    }
}

fn start_monitor(runtime: &Arc<Runtime>) -> AllocationMonitor {
    AllocationMonitor::builder()
        .source(ScriptedSource(Arc::clone(runtime)))
        .poll_interval(POLL_INTERVAL)
        .build()
        .unwrap()
}

#[test]
fn spawned_thread_is_reported_created_exactly_once() {
    let runtime = Runtime::with_threads(&[(MAIN, 0)]);
    let monitor = start_monitor(&runtime);
    let recorder = Recorder::attach(&monitor, ByteThreshold::MAX);

    assert_eq!(monitor.tracked_threads(), vec![MAIN]);

    runtime.spawn(X, 0);
    wait_until(|| recorder.count(&Event::Created(X)) > 0);

    runtime.wait_for_checks(3);

    assert_eq!(recorder.events(), vec![Event::Created(X)]);
    assert_eq!(monitor.tracked_threads(), vec![MAIN, X]);
}

#[test]
fn terminated_thread_is_reported_died_once_and_never_watched_again() {
    let runtime = Runtime::with_threads(&[(MAIN, 0), (X, 0)]);
    let monitor = start_monitor(&runtime);
    let recorder = Recorder::attach(&monitor, 0_u64);

    runtime.kill(X);
    wait_until(|| recorder.count(&Event::Died(X)) > 0);

    // Main keeps allocating so the watch pass keeps doing work.
    runtime.growth_per_read.store(1, Ordering::Relaxed);
    runtime.wait_for_checks(3);

    let events = recorder.events();
    assert_eq!(recorder.count(&Event::Died(X)), 1);

    let died_at = events
        .iter()
        .position(|event| *event == Event::Died(X))
        .unwrap();
    assert!(
        !events
            .iter()
            .skip(died_at)
            .any(|event| matches!(event, Event::Watch(thread, _) if *thread == X))
    );

    assert_eq!(monitor.tracked_threads(), vec![MAIN]);
}

#[test]
fn watch_fires_once_when_threshold_is_crossed() {
    let runtime = Runtime::with_threads(&[(MAIN, 0), (Y, 0)]);
    let monitor = start_monitor(&runtime);
    let recorder = Recorder::attach(&monitor, 1000_u64);

    runtime.set_counter(Y, 500);
    runtime.wait_for_checks(2);
    assert!(recorder.watch_events(Y).is_empty());

    runtime.set_counter(Y, 1100);
    wait_until(|| !recorder.watch_events(Y).is_empty());

    // No new allocation, so nothing new to report.
    runtime.wait_for_checks(3);
    assert_eq!(recorder.watch_events(Y), vec![1100]);
}

#[test]
fn reset_all_clears_deltas_and_quiets_watch() {
    let runtime = Runtime::with_threads(&[(MAIN, 0), (Y, 0)]);
    let monitor = start_monitor(&runtime);
    let recorder = Recorder::attach(&monitor, 1000_u64);

    runtime.set_counter(Y, 1100);
    wait_until(|| !recorder.watch_events(Y).is_empty());

    monitor.reset_all();
    runtime.wait_for_checks(2);

    let mut delta_of_y = None;
    monitor.for_each_tracked(|tracker| {
        if tracker.handle() == Y {
            delta_of_y = tracker.delta();
        }
    });

    assert_eq!(delta_of_y, Some(0));
    assert_eq!(recorder.watch_events(Y), vec![1100]);
}

#[test]
fn concurrent_watch_replacement_never_mixes_pairs() {
    const LOW: u64 = 100;
    const HIGH: u64 = 10_000;

    let runtime = Runtime::with_threads(&[(Y, 0)]);
    let monitor = Arc::new(start_monitor(&runtime));

    // Y sits between the two thresholds and keeps growing slowly, so the low watch keeps firing.
    runtime.set_counter(Y, 5000);
    runtime.growth_per_read.store(1, Ordering::Relaxed);

    let low_fired = Arc::new(AtomicUsize::new(0));
    let high_fired = Arc::new(AtomicUsize::new(0));
    let stop = Arc::new(AtomicBool::new(false));

    let install_low = {
        let monitor = Arc::clone(&monitor);
        let low_fired = Arc::clone(&low_fired);
        move || {
            let low_fired = Arc::clone(&low_fired);
            monitor.on_byte_watch(LOW, move |_, _| {
                low_fired.fetch_add(1, Ordering::Relaxed);
            });
        }
    };

    let install_high = {
        let monitor = Arc::clone(&monitor);
        let high_fired = Arc::clone(&high_fired);
        move || {
            let high_fired = Arc::clone(&high_fired);
            monitor.on_byte_watch(HIGH, move |_, _| {
                high_fired.fetch_add(1, Ordering::Relaxed);
            });
        }
    };

    let racers = [
        thread::spawn({
            let stop = Arc::clone(&stop);
            let install_low = install_low.clone();
            move || {
                while !stop.load(Ordering::Relaxed) {
                    install_low();
                }
            }
        }),
        thread::spawn({
            let stop = Arc::clone(&stop);
            move || {
                while !stop.load(Ordering::Relaxed) {
                    install_high();
                }
            }
        }),
    ];

    runtime.wait_for_checks(20);
    stop.store(true, Ordering::Relaxed);

    for racer in racers {
        racer.join().unwrap();
    }

    // Leave the low watch in place to prove the watch pass is really being evaluated.
    install_low();
    let fired_before = low_fired.load(Ordering::Relaxed);
    wait_until(|| low_fired.load(Ordering::Relaxed) > fired_before);

    monitor.shutdown();

    // The high callback must only ever be called with the high threshold, which Y never exceeds.
    assert_eq!(high_fired.load(Ordering::Relaxed), 0);
}

#[test]
fn no_callbacks_after_shutdown() {
    let runtime = Runtime::with_threads(&[(MAIN, 0)]);
    let monitor = start_monitor(&runtime);
    let recorder = Recorder::attach(&monitor, 0_u64);

    monitor.shutdown();
    monitor.shutdown();
    assert!(!monitor.is_running());

    let polls_at_shutdown = runtime.polls.load(Ordering::SeqCst);

    runtime.spawn(X, 0);
    runtime.set_counter(MAIN, 5000);
    thread::sleep(POLL_INTERVAL * 10);

    assert_eq!(runtime.polls.load(Ordering::SeqCst), polls_at_shutdown);
    assert!(recorder.events().is_empty());

    // The last known state stays available.
    assert_eq!(monitor.tracked_threads(), vec![MAIN]);
}

#[test]
fn newly_created_thread_is_watched_in_the_same_check() {
    let runtime = Runtime::with_threads(&[(MAIN, 0)]);
    let monitor = start_monitor(&runtime);

    let recorder = Arc::new(Recorder::default());
    monitor.on_thread_created({
        let recorder = Arc::clone(&recorder);
        let runtime = Arc::clone(&runtime);
        move |thread| {
            recorder.push(Event::Created(thread));
            runtime.set_counter(thread, 3000);
        }
    });
    monitor.on_byte_watch(1000_u64, {
        let recorder = Arc::clone(&recorder);
        move |thread, delta| recorder.push(Event::Watch(thread, delta))
    });

    runtime.spawn(X, 0);
    wait_until(|| recorder.events().len() >= 2);
    runtime.wait_for_checks(2);

    assert_eq!(
        recorder.events(),
        vec![Event::Created(X), Event::Watch(X, 3000)]
    );
}
