// Single-slot, last-value-wins hand-off between the receiver task and the
// settle detector
use crate::domain::telemetry::TelemetrySample;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Slot {
    pending: Option<TelemetrySample>,
    dropped: u64,
    closed: bool,
}

/// Publishing never blocks: a sample that has not been taken yet is replaced
/// by the newer one. `take` waits for the next sample.
#[derive(Debug, Default)]
pub struct TelemetryChannel {
    slot: Mutex<Slot>,
    notify: Notify,
}

impl TelemetryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `false` if the channel is closed and the sample was discarded.
    pub fn publish(&self, sample: TelemetrySample) -> bool {
        {
            let mut slot = self.slot();
            if slot.closed {
                return false;
            }
            if slot.pending.replace(sample).is_some() {
                slot.dropped += 1;
            }
        }
        self.notify.notify_one();
        true
    }

    /// Wait for the most recent untaken sample. Returns `None` once the channel
    /// is closed and drained.
    pub async fn take(&self) -> Option<TelemetrySample> {
        loop {
            {
                let mut slot = self.slot();
                if let Some(sample) = slot.pending.take() {
                    return Some(sample);
                }
                if slot.closed {
                    return None;
                }
            }
            // notify_one stores a permit, so a publish landing between the
            // check above and this await is not lost.
            self.notify.notified().await;
        }
    }

    /// Non-blocking variant of `take`.
    #[cfg(test)]
    pub fn try_take(&self) -> Option<TelemetrySample> {
        self.slot().pending.take()
    }

    pub fn close(&self) {
        self.slot().closed = true;
        self.notify.notify_one();
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.slot().closed
    }

    /// Samples overwritten before anyone took them.
    pub fn dropped(&self) -> u64 {
        self.slot().dropped
    }
}
