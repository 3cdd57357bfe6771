use std::fmt;
use std::sync::atomic::{self, AtomicU64};

use crate::{MonitorError, ThreadHandle};

/// The number of bytes a thread may allocate since its baseline before the byte watch fires.
///
/// The watch fires when the allocation delta of a thread is strictly greater than the
/// threshold. A thread that has allocated exactly the threshold amount does not trigger it.
///
/// The default is [`ByteThreshold::MAX`], which no delta can exceed, effectively disabling the
/// watch.
///
/// # Examples
///
/// ```
/// use alloc_monitor::ByteThreshold;
///
/// let threshold = ByteThreshold::from(1000_u64);
///
/// assert!(!threshold.is_exceeded_by(1000));
/// assert!(threshold.is_exceeded_by(1001));
///
/// // Values from signed sources are validated rather than clamped.
/// assert!(ByteThreshold::try_from(-1_i64).is_err());
/// ```
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ByteThreshold(u64);

impl ByteThreshold {
    /// A threshold that can never be exceeded.
    pub const MAX: Self = Self(u64::MAX);

    /// Creates a threshold of `bytes` bytes.
    #[must_use]
    #[inline]
    pub const fn new(bytes: u64) -> Self {
        Self(bytes)
    }

    /// The threshold in bytes.
    #[must_use]
    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Whether an allocation delta of `delta` bytes is over this threshold.
    #[must_use]
    #[inline]
    pub const fn is_exceeded_by(self, delta: u64) -> bool {
        delta > self.0
    }
}

impl Default for ByteThreshold {
    fn default() -> Self {
        Self::MAX
    }
}

impl From<u64> for ByteThreshold {
    fn from(bytes: u64) -> Self {
        Self(bytes)
    }
}

impl TryFrom<i64> for ByteThreshold {
    type Error = MonitorError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        u64::try_from(value)
            .map(Self)
            .map_err(|_negative| MonitorError::InvalidThreshold { value })
    }
}

impl fmt::Display for ByteThreshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::MAX {
            write!(f, "disabled")
        } else {
            write!(f, "{} bytes", self.0)
        }
    }
}

pub(crate) type ThreadCallbackFn = dyn Fn(ThreadHandle) + Send + Sync;
pub(crate) type ByteWatchCallbackFn = dyn Fn(ThreadHandle, u64) + Send + Sync;

/// Contents of one lifecycle callback slot.
pub(crate) struct ThreadCallback {
    callback: Box<ThreadCallbackFn>,
}

impl ThreadCallback {
    pub(crate) fn new(callback: impl Fn(ThreadHandle) + Send + Sync + 'static) -> Self {
        Self {
            callback: Box::new(callback),
        }
    }

    pub(crate) fn noop() -> Self {
        Self::new(|_| {})
    }

    pub(crate) fn invoke(&self, thread: ThreadHandle) {
        (self.callback)(thread);
    }
}

impl fmt::Debug for ThreadCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadCallback")
            .field("callback", &"<callback>")
            .finish()
    }
}

// Zero is never handed out, so trackers can use it to mean "not reported under any watch".
static NEXT_WATCH_GENERATION: AtomicU64 = AtomicU64::new(1);

/// A threshold together with the callback to notify when it is exceeded.
///
/// Immutable once created. Replacing the active watch swaps in a whole new instance, so a check
/// cycle can never pair the callback of one registration with the threshold of another.
///
/// Every instance has its own generation. Trackers remember which generation they last reported
/// to, so a newly registered watch starts with every thread armed.
pub(crate) struct ByteWatch {
    generation: u64,
    threshold: ByteThreshold,
    callback: Box<ByteWatchCallbackFn>,
}

impl ByteWatch {
    pub(crate) fn new(
        threshold: ByteThreshold,
        callback: impl Fn(ThreadHandle, u64) + Send + Sync + 'static,
    ) -> Self {
        Self {
            generation: NEXT_WATCH_GENERATION.fetch_add(1, atomic::Ordering::Relaxed),
            threshold,
            callback: Box::new(callback),
        }
    }

    pub(crate) fn disabled() -> Self {
        Self::new(ByteThreshold::MAX, |_, _| {})
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn threshold(&self) -> ByteThreshold {
        self.threshold
    }

    pub(crate) fn is_disabled(&self) -> bool {
        self.threshold == ByteThreshold::MAX
    }

    pub(crate) fn notify(&self, thread: ThreadHandle, delta: u64) {
        (self.callback)(thread, delta);
    }
}

impl fmt::Debug for ByteWatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteWatch")
            .field("generation", &self.generation)
            .field("threshold", &self.threshold)
            .field("callback", &"<callback>")
            .finish()
    }
}
