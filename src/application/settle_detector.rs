// Settle detector - blocks until the temperature has settled or the budget is spent
use crate::application::telemetry_channel::TelemetryChannel;
use crate::domain::settle::{SettleConfig, SettleOutcome, SettleStatus, SettleTracker};
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Error, PartialEq)]
pub enum SettleError {
    #[error("telemetry feed closed after {samples} samples")]
    FeedClosed { samples: usize },
}

/// Consume samples from `channel` until the window around `target` holds more
/// than `required_in_band` in-band readings, or `max_samples` readings have
/// been taken.
///
/// Without `max_wait` the only limit is the sample budget: a feed that stops
/// publishing keeps this waiting. With `max_wait`, an expired deadline ends the
/// wait as `TimedOut`.
pub async fn wait_for_settle(
    channel: &TelemetryChannel,
    target: f64,
    config: &SettleConfig,
) -> Result<SettleOutcome, SettleError> {
    let mut tracker = SettleTracker::new(target, *config);
    let deadline = config.max_wait.and_then(|wait| {
        let deadline = Instant::now().checked_add(wait);
        if deadline.is_none() {
            tracing::warn!("max_wait {:?} is out of range, waiting without a deadline", wait);
        }
        deadline
    });

    loop {
        let next = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, channel.take()).await {
                Ok(next) => next,
                Err(_) => {
                    tracing::warn!(
                        "No settle verdict for {:.3} within {:?} ({} samples, {} in band)",
                        target,
                        config.max_wait.unwrap_or_default(),
                        tracker.samples(),
                        tracker.window().count_in_band(target, config)
                    );
                    return Ok(tracker.finish(SettleStatus::TimedOut));
                }
            },
            None => channel.take().await,
        };

        let Some(sample) = next else {
            return Err(SettleError::FeedClosed {
                samples: tracker.samples(),
            });
        };

        tracing::debug!(
            "Sample {} for target {:.3}: {:.4} (drive {:?})",
            sample.seq,
            target,
            sample.temperature,
            sample.drive_current()
        );

        if let Some(outcome) = tracker.observe(sample.temperature) {
            return Ok(outcome);
        }
    }
}
