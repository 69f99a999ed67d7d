// Telemetry receiver - background task feeding decoded samples into a channel
use crate::application::telemetry_channel::TelemetryChannel;
use crate::application::telemetry_feed::TelemetryFeed;
use crate::domain::telemetry::TelemetrySample;
use crate::domain::thermostat::telemetry_topic;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Handle to a running receiver. `stop` cancels the task and waits for it.
pub struct ReceiverHandle {
    topic: String,
    cancel: watch::Sender<bool>,
    task: Option<JoinHandle<u64>>,
}

pub struct TelemetryReceiver;

impl TelemetryReceiver {
    /// Subscribe to `{prefix}/telemetry` and start publishing decoded samples
    /// into `channel`.
    pub async fn start(
        feed: &dyn TelemetryFeed,
        prefix: &str,
        channel: Arc<TelemetryChannel>,
    ) -> anyhow::Result<ReceiverHandle> {
        let topic = telemetry_topic(prefix);
        let mut messages = feed.subscribe(&topic).await?;
        let (cancel, mut cancelled) = watch::channel(false);

        tracing::debug!("Telemetry receiver subscribed to {}", topic);

        let task_topic = topic.clone();
        let task = tokio::spawn(async move {
            let mut seq = 0u64;
            loop {
                tokio::select! {
                    biased;
                    _ = cancelled.changed() => break,
                    message = messages.next() => {
                        let Some(payload) = message else {
                            tracing::warn!("Telemetry feed on {} ended", task_topic);
                            break;
                        };
                        match TelemetrySample::decode(seq, &payload) {
                            Ok(sample) => {
                                seq += 1;
                                channel.publish(sample);
                            }
                            Err(e) => {
                                tracing::warn!("Skipping telemetry message on {}: {}", task_topic, e);
                            }
                        }
                    }
                }
            }
            channel.close();
            seq
        });

        Ok(ReceiverHandle {
            topic,
            cancel,
            task: Some(task),
        })
    }
}

impl ReceiverHandle {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    /// Cancel the receiver and wait until it has stopped publishing. Calling
    /// it again is a no-op.
    pub async fn stop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        let _ = self.cancel.send(true);
        match task.await {
            Ok(decoded) => {
                tracing::debug!("Telemetry receiver on {} stopped after {} samples", self.topic, decoded);
            }
            Err(e) => {
                tracing::error!("Telemetry receiver on {} failed: {}", self.topic, e);
            }
        }
    }
}

impl Drop for ReceiverHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
