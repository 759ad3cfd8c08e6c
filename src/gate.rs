//! Busy gate: shared "in use" holders versus a single draining disposer

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Notify;

/// High bit of the holder count; set once the gate starts draining.
const CLOSED: usize = 1 << (usize::BITS - 1);

/// Reference count with an exclusive drain.
///
/// Any number of holders may enter while the gate is open. `close` flips the
/// closed bit so no further holders can enter, then waits for the existing ones
/// to leave. Closing is one-way.
#[derive(Default)]
pub struct BusyGate {
    state: AtomicUsize,
    drained: Notify,
}

impl BusyGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// enter shared mode, unless the gate is closed
    pub fn try_enter(&self) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                (state & CLOSED == 0).then_some(state + 1)
            })
            .is_ok()
    }

    /// leave shared mode, waking the drainer if this was the last holder
    pub fn leave(&self) {
        let prev = self.state.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev & !CLOSED > 0, "busy gate left more often than entered");
        if prev == CLOSED | 1 {
            self.drained.notify_waiters();
        }
    }

    pub fn holders(&self) -> usize {
        self.state.load(Ordering::Acquire) & !CLOSED
    }

    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) & CLOSED != 0
    }

    /// Close the gate and wait until every holder has left.
    ///
    /// Returns `true` for the call that actually closed the gate. Every caller,
    /// first or not, returns only once the gate is drained.
    pub async fn close(&self) -> bool {
        let prev = self.state.fetch_or(CLOSED, Ordering::AcqRel);
        loop {
            // register before checking so a concurrent `leave` cannot be missed
            let notified = self.drained.notified();
            if self.holders() == 0 {
                break;
            }
            notified.await;
        }
        prev & CLOSED == 0
    }
}

/// One-shot release of a reservation taken on a pool.
///
/// Releasing happens exactly once: either through [`ReleaseSignal::release`] or
/// when the signal is dropped. Until then the pool cannot finish disposing.
#[must_use = "dropping a release signal releases the reservation immediately"]
pub struct ReleaseSignal {
    gate: Option<Arc<BusyGate>>,
}

impl ReleaseSignal {
    /// Takes a reservation on `gate`, or returns `None` if it is closed.
    pub(crate) fn acquire(gate: &Arc<BusyGate>) -> Option<Self> {
        gate.try_enter().then(|| Self {
            gate: Some(Arc::clone(gate)),
        })
    }

    /// signal that the caller is done with the pool
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(gate) = self.gate.take() {
            gate.leave();
        }
    }
}

impl Drop for ReleaseSignal {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl std::fmt::Debug for ReleaseSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReleaseSignal")
            .field("released", &self.gate.is_none())
            .finish()
    }
}
