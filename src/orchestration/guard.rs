use std::sync::atomic::{AtomicBool, Ordering};

/// Serializes scheduling passes without recursion.
///
/// A request that arrives while a pass is running (including one made from
/// inside the pass itself) is recorded and served by the running caller's
/// loop instead of starting a nested pass.
#[derive(Debug, Default)]
pub struct PassGuard {
    active: AtomicBool,
    pending: AtomicBool,
}

impl PassGuard {
    /// Request a pass. Returns `true` if this caller ran it, `false` if it
    /// was handed to the caller already inside the guard.
    pub fn run(&self, mut pass: impl FnMut()) -> bool {
        self.pending.store(true, Ordering::SeqCst);
        let mut ran = false;
        loop {
            if self
                .active
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return ran;
            }
            while self.pending.swap(false, Ordering::SeqCst) {
                pass();
            }
            ran = true;
            self.active.store(false, Ordering::SeqCst);
            // A request may have landed between the last swap and the release.
            if !self.pending.load(Ordering::SeqCst) {
                return ran;
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}
