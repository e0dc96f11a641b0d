//! Barrier bookkeeping.
//!
//! The scheduler counts arrivals per group mask in a [`BarrierCounter`] and
//! releases the group when the count reaches its size. Every member blocks
//! on its own [`BarrierLatch`] until the release reaches it.

use std::sync::Mutex;

use tokio::sync::Notify;

/// Number of distinct group masks.
const GROUP_SLOTS: usize = 8;

/// Scheduler-side arrival counts, one per group mask.
#[derive(Debug, Default)]
pub(crate) struct BarrierCounter {
    counts: Option<[usize; GROUP_SLOTS]>,
}

impl BarrierCounter {
    /// Record one arrival for `group` of `size` members.
    ///
    /// Returns true when this arrival completes the round; the count then
    /// starts over. Returns `None` for a mask outside `0..8`.
    pub(crate) fn arrive(&mut self, group: i32, size: usize) -> Option<bool> {
        let slot = usize::try_from(group).ok().filter(|g| *g < GROUP_SLOTS)?;
        let counts = self.counts.get_or_insert([0; GROUP_SLOTS]);
        counts[slot] += 1;
        if counts[slot] >= size {
            counts[slot] = 0;
            return Some(true);
        }
        Some(false)
    }

    #[cfg(test)]
    fn count(&self, group: usize) -> usize {
        self.counts.map(|c| c[group]).unwrap_or(0)
    }
}

/// Member-side wait for a barrier release.
#[derive(Debug, Default)]
pub(crate) struct BarrierLatch {
    done: Mutex<bool>,
    notify: Notify,
}

impl BarrierLatch {
    fn lock(&self) -> std::sync::MutexGuard<'_, bool> {
        self.done.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Prepare for a new round. Call before sending the request.
    pub(crate) fn arm(&self) {
        *self.lock() = false;
    }

    /// Release the current round.
    pub(crate) fn release(&self) {
        *self.lock() = true;
        self.notify.notify_waiters();
    }

    /// Wait until released.
    pub(crate) async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if *self.lock() {
                return;
            }
            notified.await;
        }
    }
}
