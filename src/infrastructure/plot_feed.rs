// Live plot feed - keeps the records of the running sweep and fans new ones out
// to connected viewers
use crate::application::sweep_sink::SweepSink;
use crate::domain::sweep::SweepRecord;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast};

const LIVE_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct PlotFeed {
    history: Arc<RwLock<Vec<SweepRecord>>>,
    live: broadcast::Sender<SweepRecord>,
}

impl Default for PlotFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl PlotFeed {
    pub fn new() -> Self {
        let (live, _) = broadcast::channel(LIVE_CAPACITY);
        Self {
            history: Arc::new(RwLock::new(Vec::new())),
            live,
        }
    }

    pub async fn push(&self, record: SweepRecord) {
        // Hold the write lock while sending so a concurrent `subscribe` sees
        // each record exactly once, either in its snapshot or live.
        let mut history = self.history.write().await;
        history.push(record.clone());
        let _ = self.live.send(record);
    }

    pub async fn records(&self) -> Vec<SweepRecord> {
        self.history.read().await.clone()
    }

    /// Records so far plus a receiver for everything after them.
    pub async fn subscribe(&self) -> (Vec<SweepRecord>, broadcast::Receiver<SweepRecord>) {
        let history = self.history.read().await;
        (history.clone(), self.live.subscribe())
    }
}

/// Sink half of the feed, handed to the sweep controller.
pub struct PlotFeedSink {
    feed: PlotFeed,
}

impl PlotFeedSink {
    pub fn new(feed: PlotFeed) -> Self {
        Self { feed }
    }
}

#[async_trait]
impl SweepSink for PlotFeedSink {
    fn name(&self) -> &str {
        "plot-feed"
    }

    async fn record(&mut self, record: &SweepRecord) -> anyhow::Result<()> {
        self.feed.push(record.clone()).await;
        Ok(())
    }

    async fn flush(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::settle::SettleStatus;

    fn record(index: usize) -> SweepRecord {
        SweepRecord {
            index,
            setpoint: 20.0 + index as f64 * 0.5,
            measurement: 0.1,
            outcome: SettleStatus::Settled,
            samples: 16,
            last_temperature: Some(20.0),
            time_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_subscriber_gets_history_then_live() {
        let feed = PlotFeed::new();
        let mut sink = PlotFeedSink::new(feed.clone());

        sink.record(&record(0)).await.unwrap();
        let (snapshot, mut live) = feed.subscribe().await;
        sink.record(&record(1)).await.unwrap();

        assert_eq!(snapshot.iter().map(|r| r.index).collect::<Vec<_>>(), vec![0]);
        assert_eq!(live.recv().await.unwrap().index, 1);
        assert_eq!(feed.records().await.len(), 2);
    }
}
