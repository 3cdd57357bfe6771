use foldhash::HashSet;

use crate::ThreadHandle;

/// The difference between the threads a monitor is tracking and the threads that are alive now.
///
/// A thread present in both sets is neither created nor died, whatever else happened to it in
/// between. Each list is sorted by handle so that dispatch order is reproducible, though no
/// caller may rely on any particular order.
#[derive(Debug, Default, Eq, PartialEq)]
pub(crate) struct ThreadSetChanges {
    pub(crate) died: Vec<ThreadHandle>,
    pub(crate) created: Vec<ThreadHandle>,
}

impl ThreadSetChanges {
    pub(crate) fn between(tracked: &HashSet<ThreadHandle>, live: &HashSet<ThreadHandle>) -> Self {
        let mut died: Vec<_> = tracked.difference(live).copied().collect();
        let mut created: Vec<_> = live.difference(tracked).copied().collect();

        died.sort_unstable();
        created.sort_unstable();

        Self { died, created }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.died.is_empty() && self.created.is_empty()
    }
}
