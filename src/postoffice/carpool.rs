//! Carpool - single-flight work sharing
//!
//! Many tasks want "someone" to do the next unit of shared work (one read
//! pass over a stream). Exactly one wins the gate with a compare-and-swap and
//! drives; the rest park on a `Notify` until the driver's lap is over, then
//! re-check their own condition and race again if still unsatisfied.
//!
//! ```text
//!   task A ──try_drive──▶ driver ──lap──▶ release ──notify──┐
//!   task B ──try_drive──▶ rider  ──wait_for_lap───────────◀─┘ re-check
//!   task C ──try_drive──▶ rider  ──wait_for_lap───────────◀─┘ re-check
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Notify;

#[derive(Debug, Default)]
pub struct Carpool {
    driving: AtomicBool,
    laps: AtomicU64,
    lap_finished: Notify,
}

/// Held by the task currently driving. Dropping it ends the lap.
#[derive(Debug)]
pub struct Driver<'a> {
    pool: &'a Carpool,
}

impl Drop for Driver<'_> {
    fn drop(&mut self) {
        self.pool.laps.fetch_add(1, Ordering::Relaxed);
        self.pool.driving.store(false, Ordering::Release);
        self.pool.lap_finished.notify_waiters();
    }
}

impl Carpool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Become the driver if nobody else is.
    pub fn try_drive(&self) -> Option<Driver<'_>> {
        self.driving
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Driver { pool: self })
    }

    pub fn is_driving(&self) -> bool {
        self.driving.load(Ordering::Acquire)
    }

    /// Completed laps since creation.
    pub fn laps(&self) -> u64 {
        self.laps.load(Ordering::Relaxed)
    }

    /// Park until the current driver finishes. Returns at once if nobody drives.
    pub async fn wait_for_lap(&self) {
        let notified = self.lap_finished.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if !self.is_driving() {
            return;
        }
        notified.await;
    }
}
