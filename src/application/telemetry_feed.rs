// Telemetry feed trait - raw message subscription
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::Stream;
use std::pin::Pin;

/// Raw payloads in arrival order. The stream ends when the feed is gone;
/// dropping it tears the subscription down.
pub type TelemetryStream = Pin<Box<dyn Stream<Item = Bytes> + Send>>;

#[async_trait]
pub trait TelemetryFeed: Send + Sync {
    /// Subscribe to `topic`. Returns once the subscription is in place.
    async fn subscribe(&self, topic: &str) -> anyhow::Result<TelemetryStream>;
}
