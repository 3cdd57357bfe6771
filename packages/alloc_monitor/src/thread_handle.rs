use std::fmt;

/// Identifies one thread of the process, as seen by a [`ThreadSource`][crate::ThreadSource].
///
/// Handles are compared by runtime identity. Two threads with the same name are still different
/// threads and a thread that is renamed keeps its handle. Identities are assigned by the thread
/// source and are never reused within the lifetime of the process, which is what allows the
/// monitor to tell "thread X died and thread Y appeared" apart from "nothing changed".
///
/// The monitor never creates or destroys threads - it only observes handles handed to it.
///
/// # Examples
///
/// ```
/// use alloc_monitor::ThreadHandle;
///
/// let handle = ThreadHandle::from_raw(42);
/// assert_eq!(handle.as_raw(), 42);
/// assert_eq!(handle.to_string(), "thread #42");
/// ```
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ThreadHandle(u64);

impl ThreadHandle {
    /// Creates a handle from an identity minted by a thread source.
    ///
    /// Custom [`ThreadSource`][crate::ThreadSource] implementations use this to hand out
    /// handles. The caller is responsible for never reusing an identity for a different thread.
    #[must_use]
    #[inline]
    pub const fn from_raw(id: u64) -> Self {
        Self(id)
    }

    /// Returns the identity this handle was created from.
    #[must_use]
    #[inline]
    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ThreadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread #{}", self.0)
    }
}
