//! Tracking allocator that gives every allocating thread an identity and a byte counter.

use std::alloc::{GlobalAlloc, Layout};
use std::cell::{Cell, OnceCell};
use std::fmt;
use std::ptr;
use std::sync::atomic::{self, AtomicBool, AtomicU64};
use std::sync::{Arc, LazyLock, Mutex, OnceLock};
use std::thread;

use crate::{ERR_POISONED_LOCK, SourceError, ThreadHandle, ThreadSource};

/// Counters of one thread that has allocated through the tracking allocator.
///
/// Records are kept in the global registry for the lifetime of the process, also after the
/// thread has exited, so a raw pointer to one never dangles.
#[derive(Debug)]
pub(crate) struct ThreadCounters {
    id: u64,
    bytes: AtomicU64,
    alive: AtomicBool,

    // Set by the thread itself via `RegisteredThreads::current_thread()`, never by the allocator.
    name: OnceLock<Option<String>>,
}

impl ThreadCounters {
    #[inline]
    const fn new(id: u64) -> Self {
        Self {
            id,
            bytes: AtomicU64::new(0),
            alive: AtomicBool::new(true),
            name: OnceLock::new(),
        }
    }

    #[inline]
    pub(crate) fn register_allocation(&self, bytes: u64) {
        // Relaxed is sufficient: we only need atomicity, not ordering w.r.t. other memory ops.
        self.bytes.fetch_add(bytes, atomic::Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn bytes(&self) -> u64 {
        self.bytes.load(atomic::Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(atomic::Ordering::Acquire)
    }

    fn mark_exited(&self) {
        self.alive.store(false, atomic::Ordering::Release);
    }

    pub(crate) fn handle(&self) -> ThreadHandle {
        ThreadHandle::from_raw(self.id)
    }

    fn name(&self) -> Option<&str> {
        self.name.get().and_then(Option::as_deref)
    }

    // Never call from the allocator: looking up the current thread may itself allocate.
    fn remember_current_thread_name(&self) {
        self.name
            .get_or_init(|| thread::current().name().map(str::to_owned));
    }
}

// Record with ID `n` lives at index `n - 1`. IDs are assigned under the lock to keep it that way.
static REGISTRY: LazyLock<Mutex<Vec<Arc<ThreadCounters>>>> =
    LazyLock::new(|| Mutex::new(Vec::new()));

/// Clears the `alive` flag of the owning thread's counters when thread-local storage is torn down.
///
/// The drop only performs an atomic store, so it never allocates during thread teardown.
struct ExitMarker {
    counters: Cell<*const ThreadCounters>,
}

impl Drop for ExitMarker {
    fn drop(&mut self) {
        let ptr = self.counters.get();

        if !ptr.is_null() {
            // SAFETY: pointer originates from Arc stored in REGISTRY which retains ownership for program lifetime.
            unsafe { &*ptr }.mark_exited();
        }
    }
}

thread_local! {
    // A raw pointer and not an Arc, so there is no Drop logic that could deallocate (and thereby
    // re-enter the allocator) during thread teardown. The pointee is owned by REGISTRY forever.
    static TLS_COUNTERS_PTR: OnceCell<*const ThreadCounters> = const { OnceCell::new() };

    // Set while this thread is registering itself. Registration allocates (the Arc, the registry
    // Vec, the TLS destructor list) and those allocations must not recurse into registration.
    static TLS_INIT_GUARD: Cell<bool> = const { Cell::new(false) };

    static TLS_EXIT_MARKER: ExitMarker = const {
        ExitMarker {
            counters: Cell::new(ptr::null()),
        }
    };
}

#[inline]
pub(crate) fn get_or_init_thread_counters() -> &'static ThreadCounters {
    TLS_COUNTERS_PTR.with(|cell| {
        if let Some(ptr) = cell.get() {
            // SAFETY: pointer originates from Arc stored in REGISTRY which retains ownership for program lifetime.
            return unsafe { &**ptr };
        }

        TLS_INIT_GUARD.set(true);

        let ptr = {
            let mut registry = REGISTRY.lock().expect(ERR_POISONED_LOCK);

            let id = u64::try_from(registry.len())
                .expect("usize always fits into u64")
                .checked_add(1)
                .expect("more threads than fit in u64 is not a realistic scenario");

            let arc = Arc::new(ThreadCounters::new(id));
            let ptr = Arc::as_ptr(&arc);
            registry.push(arc);
            ptr
        };

        _ = cell.set(ptr);

        // If the thread is already tearing down its TLS, the marker is gone and will never fire,
        // so the thread is considered exited from the start.
        if TLS_EXIT_MARKER
            .try_with(|marker| marker.counters.set(ptr))
            .is_err()
        {
            // SAFETY: pointer obtained from Arc::as_ptr for Arc stored in REGISTRY; lifetime extends for program duration.
            unsafe { &*ptr }.mark_exited();
        }

        TLS_INIT_GUARD.set(false);

        // SAFETY: pointer obtained from Arc::as_ptr for Arc stored in REGISTRY; lifetime extends for program duration.
        unsafe { &*ptr }
    })
}

/// Updates the allocation counter of the current thread.
fn track_allocation(size: usize) {
    let size_u64: u64 = size.try_into().expect("usize always fits into u64");
    TLS_INIT_GUARD.with(|guard| {
        if guard.get() {
            return; // Skip tracking during registration (allocations still occur but are intentionally not recorded).
        }
        let counters = get_or_init_thread_counters();
        counters.register_allocation(size_u64);
    });
}

// Test helper for unit tests where we do not hook the global allocator.
#[cfg(test)]
pub(crate) fn register_fake_allocation(bytes: u64) {
    get_or_init_thread_counters().register_allocation(bytes);
}

/// Returns the number of bytes the calling thread has allocated through the tracking
/// [`Allocator`] since it started.
///
/// Returns zero if the tracking allocator is not installed as the global allocator.
///
/// # Examples
///
/// ```
/// use alloc_monitor::{Allocator, current_thread_allocated_bytes};
///
/// #[global_allocator]
/// static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();
///
/// let before = current_thread_allocated_bytes();
/// let data = vec![0_u8; 1024];
/// assert!(current_thread_allocated_bytes() >= before + 1024);
/// # drop(data);
/// ```
#[must_use]
pub fn current_thread_allocated_bytes() -> u64 {
    get_or_init_thread_counters().bytes()
}

/// Returns the number of threads that have ever registered with the tracking [`Allocator`],
/// including threads that have since exited.
///
/// The registry keeps a small record for every thread that has ever allocated, so this number
/// (and the memory the records use) only grows over the lifetime of the process.
#[must_use]
pub fn registered_thread_count() -> usize {
    REGISTRY.lock().expect(ERR_POISONED_LOCK).len()
}

/// The threads known to the tracking [`Allocator`], exposed as a [`ThreadSource`].
///
/// A thread becomes known on its first allocation and is considered alive until its
/// thread-local storage is torn down. Threads that have never allocated are not listed.
///
/// This is the source used by [`AllocationMonitor::new()`][crate::AllocationMonitor::new].
/// Without the tracking allocator installed via `#[global_allocator]` it sees no threads
/// other than those that called into it directly.
///
/// # Thread names
///
/// The allocator cannot safely look up thread names, so a thread only has a known name once it
/// has called [`current_thread()`][ThreadSource::current_thread] on this type. Threads that want
/// to show up by name in monitor output can do so as their first action.
///
/// # Cost
///
/// Records of exited threads are never freed (the allocator keeps raw pointers to them), and
/// [`live_threads()`][ThreadSource::live_threads] walks every record ever created while holding
/// the registry lock that a new thread's first allocation also takes. In a process that keeps
/// spawning short-lived threads, both the memory and the per-check work grow with the total
/// number of threads ever started. Prefer thread pools in such processes.
///
/// # Examples
///
/// ```
/// use alloc_monitor::{Allocator, RegisteredThreads, ThreadSource};
///
/// #[global_allocator]
/// static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();
///
/// let source = RegisteredThreads;
/// let me = source.current_thread().unwrap();
///
/// assert!(source.live_threads().unwrap().contains(&me));
/// assert!(source.allocated_bytes(me).is_some());
/// ```
#[derive(Clone, Copy, Debug, Default)]
pub struct RegisteredThreads;

impl RegisteredThreads {
    fn with_counters<R>(thread: ThreadHandle, f: impl FnOnce(&ThreadCounters) -> R) -> Option<R> {
        let index = usize::try_from(thread.as_raw().checked_sub(1)?).ok()?;

        let registry = REGISTRY.lock().ok()?;
        registry.get(index).map(|counters| f(counters))
    }
}

impl ThreadSource for RegisteredThreads {
    fn live_threads(&self) -> Result<Vec<ThreadHandle>, SourceError> {
        // Once the calling thread is registered, allocating while holding the registry lock
        // can no longer try to take the lock again for registration.
        get_or_init_thread_counters();

        let registry = REGISTRY
            .lock()
            .map_err(|_poisoned| SourceError::new("thread registry lock is poisoned"))?;

        Ok(registry
            .iter()
            .filter(|counters| counters.is_alive())
            .map(|counters| counters.handle())
            .collect())
    }

    fn allocated_bytes(&self, thread: ThreadHandle) -> Option<u64> {
        Self::with_counters(thread, |counters| {
            counters.is_alive().then(|| counters.bytes())
        })
        .flatten()
    }

    fn current_thread(&self) -> Option<ThreadHandle> {
        let counters = get_or_init_thread_counters();
        counters.remember_current_thread_name();

        Some(counters.handle())
    }

    fn thread_name(&self, thread: ThreadHandle) -> Option<String> {
        // Cloning the name allocates while holding the registry lock, which is only safe once the
        // calling thread is registered.
        get_or_init_thread_counters();

        Self::with_counters(thread, |counters| counters.name().map(str::to_owned)).flatten()
    }
}

/// A memory allocator that counts the bytes allocated by each thread.
///
/// This allocator wraps any [`GlobalAlloc`] implementation and otherwise keeps the same
/// allocation behavior as the underlying allocator. Install it as the global allocator to let
/// [`RegisteredThreads`] (and thereby [`AllocationMonitor`][crate::AllocationMonitor]) observe
/// the threads of the process.
///
/// Only allocations are counted - deallocations do not decrease the counters, so the count for
/// a thread is the cumulative allocation volume since the thread started.
///
/// # Examples
///
/// ```rust
/// use alloc_monitor::Allocator;
///
/// #[global_allocator]
/// static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();
/// ```
pub struct Allocator<A: GlobalAlloc> {
    inner: A,
}

impl<A: GlobalAlloc> fmt::Debug for Allocator<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocator")
            .field("inner", &"<allocator>")
            .finish()
    }
}

impl Allocator<std::alloc::System> {
    /// Creates a new tracking allocator using the system's default allocator.
    #[must_use]
    #[inline]
    pub const fn system() -> Self {
        Self {
            inner: std::alloc::System,
        }
    }
}

impl<A: GlobalAlloc> Allocator<A> {
    /// Creates a new tracking allocator that counts the allocations made through `allocator`.
    #[must_use]
    #[inline]
    pub const fn new(allocator: A) -> Self {
        Self { inner: allocator }
    }
}

// SAFETY: We delegate all allocation operations to the underlying allocator,
// which already implements GlobalAlloc safely, while adding tracking functionality.
unsafe impl<A: GlobalAlloc> GlobalAlloc for Allocator<A> {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        track_allocation(layout.size());

        // SAFETY: We forward the call to the underlying allocator which implements GlobalAlloc.
        unsafe { self.inner.alloc(layout) }
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        // SAFETY: We forward the call to the underlying allocator which implements GlobalAlloc.
        unsafe { self.inner.dealloc(ptr, layout) }
    }

    #[inline]
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        track_allocation(layout.size());

        // SAFETY: We forward the call to the underlying allocator which implements GlobalAlloc.
        unsafe { self.inner.alloc_zeroed(layout) }
    }

    #[inline]
    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        track_allocation(new_size);

        // SAFETY: We forward the call to the underlying allocator which implements GlobalAlloc.
        unsafe { self.inner.realloc(ptr, layout, new_size) }
    }
}
