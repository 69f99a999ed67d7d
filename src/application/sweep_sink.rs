// Sink trait - consumers of completed sweep records
use crate::domain::sweep::SweepRecord;
use async_trait::async_trait;

#[async_trait]
pub trait SweepSink: Send + Sync {
    fn name(&self) -> &str;

    async fn record(&mut self, record: &SweepRecord) -> anyhow::Result<()>;

    /// Push buffered records to their destination. Called once at the end of a
    /// sweep, including a sweep that ends in error.
    async fn flush(&mut self) -> anyhow::Result<()>;
}
