//! Single-entry guard over an atomic flag.

use std::sync::atomic::{AtomicBool, Ordering};

/// Holds `flag` set for its lifetime.
///
/// `acquire` admits exactly one holder; everyone else gets `None` and is
/// expected to return without doing the guarded work.
pub(crate) struct FlagGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> FlagGuard<'a> {
    pub(crate) fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}
