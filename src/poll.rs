use std::sync::atomic::{AtomicBool, Ordering};

/// Marks a poll cycle as running until dropped, so an aborted cycle cannot
/// leave the flag set.
#[must_use]
pub(crate) struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    /// `None` when another cycle already holds the flag.
    pub(crate) fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        if flag.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
