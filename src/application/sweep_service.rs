// Sweep controller - walks the setpoints, waits for each to settle, records a measurement
use crate::application::analog_input::{AnalogInput, DeviceError};
use crate::application::config_rpc::{ConfigRpc, RpcError};
use crate::application::settle_detector::{SettleError, wait_for_settle};
use crate::application::sweep_sink::SweepSink;
use crate::application::telemetry_channel::TelemetryChannel;
use crate::application::telemetry_feed::TelemetryFeed;
use crate::application::telemetry_receiver::TelemetryReceiver;
use crate::domain::settle::{SettleConfig, SettleOutcome};
use crate::domain::sweep::{SkippedSetpoint, SweepRecord, SweepSpec, SweepSummary};
use crate::domain::thermostat::{TARGET_PATH, ThermostatSettings};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;

/// Failures that abandon a single setpoint. The sweep moves on to the next one.
#[derive(Debug, Error)]
pub enum SetpointError {
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("telemetry subscription failed: {0}")]
    Subscribe(String),
    #[error(transparent)]
    Settle(#[from] SettleError),
}

/// Failures that end the sweep.
#[derive(Debug, Error)]
pub enum SweepError {
    #[error("thermostat setup failed writing {path}: {source}")]
    Setup {
        path: String,
        #[source]
        source: RpcError,
    },
    #[error("analog input failed at setpoint {setpoint:.3}: {source}")]
    Device {
        setpoint: f64,
        #[source]
        source: DeviceError,
    },
    #[error("analog input reset failed: {0}")]
    DeviceReset(#[source] DeviceError),
    #[error("sink {name} failed: {source}")]
    Sink {
        name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

pub struct SweepController {
    settings: ThermostatSettings,
    rpc: Arc<dyn ConfigRpc>,
    feed: Arc<dyn TelemetryFeed>,
    input: Box<dyn AnalogInput>,
    input_channel: usize,
    sinks: Vec<Box<dyn SweepSink>>,
}

impl SweepController {
    pub fn new(
        settings: ThermostatSettings,
        rpc: Arc<dyn ConfigRpc>,
        feed: Arc<dyn TelemetryFeed>,
        input: Box<dyn AnalogInput>,
        input_channel: usize,
    ) -> Self {
        Self {
            settings,
            rpc,
            feed,
            input,
            input_channel,
            sinks: Vec::new(),
        }
    }

    pub fn with_sink(mut self, sink: Box<dyn SweepSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Configure and engage the controller, command the first setpoint and
    /// reset the analog input.
    pub async fn prepare(&mut self, start: f64) -> Result<(), SweepError> {
        tracing::info!("Configuring thermostat {}", self.settings.prefix);

        let mut commands = self.settings.setup_commands();
        commands.push((TARGET_PATH, json!(start)));
        for (path, value) in commands {
            self.rpc
                .set(path, value)
                .await
                .map_err(|source| SweepError::Setup {
                    path: path.to_string(),
                    source,
                })?;
        }

        self.input.reset().await.map_err(SweepError::DeviceReset)?;
        Ok(())
    }

    /// Run the whole sweep. Sinks are flushed whether or not it completes.
    pub async fn run(
        &mut self,
        sweep: &SweepSpec,
        settle: &SettleConfig,
    ) -> Result<SweepSummary, SweepError> {
        let result = self.run_setpoints(sweep, settle).await;
        let flushed = self.flush_sinks().await;

        let summary = result?;
        flushed?;

        tracing::info!(
            "Sweep finished: {} recorded ({} settled, {} timed out), {} skipped",
            summary.recorded(),
            summary.settled,
            summary.timed_out,
            summary.skipped.len()
        );
        Ok(summary)
    }

    async fn run_setpoints(
        &mut self,
        sweep: &SweepSpec,
        settle: &SettleConfig,
    ) -> Result<SweepSummary, SweepError> {
        let total = sweep.len();
        let mut summary = SweepSummary::default();

        for (index, setpoint) in sweep.setpoints().enumerate() {
            tracing::info!("Setpoint {}/{}: {:.3} °C", index + 1, total, setpoint);

            let outcome = match self.settle_at(setpoint, settle).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!("Skipping setpoint {:.3}: {}", setpoint, e);
                    summary.skipped.push(SkippedSetpoint {
                        index,
                        setpoint,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            if outcome.is_settled() {
                tracing::info!("Settled at {:.3} after {} samples", setpoint, outcome.samples);
            } else {
                tracing::warn!(
                    "Settle timed out at {:.3} after {} samples (last reading {:?})",
                    setpoint,
                    outcome.samples,
                    outcome.last_temperature
                );
            }

            let measurement = self.measure(setpoint).await?;
            let record = SweepRecord {
                index,
                setpoint,
                measurement,
                outcome: outcome.status,
                samples: outcome.samples,
                last_temperature: outcome.last_temperature,
                time_ms: chrono::Utc::now().timestamp_millis(),
            };
            tracing::info!("Recorded {:.6} at {:.3}", measurement, setpoint);

            summary.note(&record);
            for sink in &mut self.sinks {
                if let Err(e) = sink.record(&record).await {
                    return Err(SweepError::Sink {
                        name: sink.name().to_string(),
                        source: e.into(),
                    });
                }
            }
        }

        Ok(summary)
    }

    /// Command `setpoint` and wait on a fresh receiver, so no sample from the
    /// previous setpoint can reach this window.
    async fn settle_at(
        &self,
        setpoint: f64,
        settle: &SettleConfig,
    ) -> Result<SettleOutcome, SetpointError> {
        self.rpc.set(TARGET_PATH, json!(setpoint)).await?;

        let channel = Arc::new(TelemetryChannel::new());
        let mut receiver =
            TelemetryReceiver::start(self.feed.as_ref(), &self.settings.prefix, channel.clone())
                .await
                .map_err(|e| SetpointError::Subscribe(format!("{:#}", e)))?;

        tracing::debug!("Waiting for {:.3} on {}", setpoint, receiver.topic());
        let outcome = wait_for_settle(&channel, setpoint, settle).await;
        receiver.stop().await;

        if channel.dropped() > 0 {
            tracing::debug!(
                "{} telemetry samples superseded before they were read",
                channel.dropped()
            );
        }
        Ok(outcome?)
    }

    async fn measure(&mut self, setpoint: f64) -> Result<f64, SweepError> {
        let device_error = |source| SweepError::Device { setpoint, source };
        self.input.status().await.map_err(device_error)?;
        self.input
            .sample(self.input_channel)
            .await
            .map_err(device_error)
    }

    async fn flush_sinks(&mut self) -> Result<(), SweepError> {
        let mut first_error = None;
        for sink in &mut self.sinks {
            if let Err(e) = sink.flush().await {
                tracing::error!("Failed to flush sink {}: {:#}", sink.name(), e);
                if first_error.is_none() {
                    first_error = Some(SweepError::Sink {
                        name: sink.name().to_string(),
                        source: e.into(),
                    });
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::telemetry_feed::TelemetryStream;
    use crate::domain::settle::SettleStatus;
    use async_trait::async_trait;
    use bytes::Bytes;
    use serde_json::Value;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Controller stand-in: telemetry reports the last commanded target, or a
    /// fixed temperature when `stuck_at` is set.
    #[derive(Default)]
    struct FakeThermostat {
        writes: Mutex<Vec<(String, Value)>>,
        target: Arc<Mutex<f64>>,
        reject_targets: Vec<f64>,
        stuck_at: Option<f64>,
        refuse_subscribe: bool,
    }

    #[async_trait]
    impl ConfigRpc for FakeThermostat {
        async fn set(&self, path: &str, value: Value) -> Result<(), RpcError> {
            self.writes.lock().unwrap().push((path.to_string(), value.clone()));
            if path == TARGET_PATH {
                let target = value.as_f64().unwrap();
                if self.reject_targets.contains(&target) {
                    return Err(RpcError::Rejected {
                        path: path.to_string(),
                        code: 1,
                        message: "out of range".to_string(),
                    });
                }
                *self.target.lock().unwrap() = target;
            }
            Ok(())
        }
    }

    #[async_trait]
    impl TelemetryFeed for FakeThermostat {
        async fn subscribe(&self, _topic: &str) -> anyhow::Result<TelemetryStream> {
            if self.refuse_subscribe {
                anyhow::bail!("broker unreachable");
            }
            let target = self.target.clone();
            let stuck_at = self.stuck_at;
            Ok(Box::pin(async_stream::stream! {
                loop {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    let temperature = stuck_at.unwrap_or_else(|| *target.lock().unwrap());
                    yield Bytes::from(format!(r#"{{"adcs":[{}],"dacs":[0.1]}}"#, temperature));
                }
            }))
        }
    }

    struct FakeInput {
        readings: u32,
        fail_on_reading: Option<u32>,
        resets: Arc<Mutex<u32>>,
    }

    impl FakeInput {
        fn new() -> Self {
            Self {
                readings: 0,
                fail_on_reading: None,
                resets: Arc::new(Mutex::new(0)),
            }
        }
    }

    #[async_trait]
    impl AnalogInput for FakeInput {
        async fn reset(&mut self) -> Result<(), DeviceError> {
            *self.resets.lock().unwrap() += 1;
            Ok(())
        }

        async fn status(&mut self) -> Result<(), DeviceError> {
            Ok(())
        }

        async fn sample(&mut self, channel: usize) -> Result<f64, DeviceError> {
            assert_eq!(channel, 0);
            self.readings += 1;
            if self.fail_on_reading == Some(self.readings) {
                return Err(DeviceError::Io(std::io::Error::other("usb disconnected")));
            }
            Ok(self.readings as f64 * 0.1)
        }
    }

    #[derive(Clone, Default)]
    struct CollectingSink {
        records: Arc<Mutex<Vec<SweepRecord>>>,
        flushed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl SweepSink for CollectingSink {
        fn name(&self) -> &str {
            "collect"
        }

        async fn record(&mut self, record: &SweepRecord) -> anyhow::Result<()> {
            self.records.lock().unwrap().push(record.clone());
            Ok(())
        }

        async fn flush(&mut self) -> anyhow::Result<()> {
            self.flushed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn settings() -> ThermostatSettings {
        ThermostatSettings {
            prefix: "dt/test/thermostat".to_string(),
            p_gain: 10.0,
            i_gain: 2.0,
            max_i_pos: 0.3,
            max_i_neg: 0.1,
        }
    }

    fn controller(
        thermostat: Arc<FakeThermostat>,
        input: FakeInput,
        sink: &CollectingSink,
    ) -> SweepController {
        SweepController::new(settings(), thermostat.clone(), thermostat, Box::new(input), 0)
            .with_sink(Box::new(sink.clone()))
    }

    fn settle_config() -> SettleConfig {
        SettleConfig::new(0.01, 3, 50, 10).unwrap()
    }

    #[tokio::test]
    async fn test_sweep_records_every_setpoint() {
        let thermostat = Arc::new(FakeThermostat::default());
        let sink = CollectingSink::default();
        let mut controller = controller(thermostat.clone(), FakeInput::new(), &sink);

        let sweep = SweepSpec::new(20.0, 21.0, 0.5).unwrap();
        let summary = controller.run(&sweep, &settle_config()).await.unwrap();

        assert_eq!(summary.settled, 2);
        assert!(summary.skipped.is_empty());

        let records = sink.records.lock().unwrap();
        assert_eq!(records.iter().map(|r| r.setpoint).collect::<Vec<_>>(), vec![20.0, 20.5]);
        assert_eq!(records.iter().map(|r| r.index).collect::<Vec<_>>(), vec![0, 1]);
        assert!(records.iter().all(|r| r.outcome == SettleStatus::Settled));
        assert!(sink.flushed.load(Ordering::SeqCst));

        let targets: Vec<Value> = thermostat
            .writes
            .lock()
            .unwrap()
            .iter()
            .filter(|(path, _)| path == TARGET_PATH)
            .map(|(_, value)| value.clone())
            .collect();
        assert_eq!(targets, vec![json!(20.0), json!(20.5)]);
    }

    #[tokio::test]
    async fn test_rejected_setpoint_is_skipped_and_sweep_continues() {
        let thermostat = Arc::new(FakeThermostat {
            reject_targets: vec![20.0],
            ..Default::default()
        });
        let sink = CollectingSink::default();
        let mut controller = controller(thermostat, FakeInput::new(), &sink);

        let sweep = SweepSpec::new(20.0, 21.0, 0.5).unwrap();
        let summary = controller.run(&sweep, &settle_config()).await.unwrap();

        assert_eq!(summary.recorded(), 1);
        assert_eq!(summary.skipped.len(), 1);
        assert_eq!(summary.skipped[0].setpoint, 20.0);
        assert!(summary.skipped[0].reason.contains("out of range"));

        let records = sink.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].setpoint, 20.5);
        assert_eq!(records[0].index, 1);
    }

    #[tokio::test]
    async fn test_timeouts_are_recorded_not_fatal() {
        let thermostat = Arc::new(FakeThermostat {
            stuck_at: Some(18.0),
            ..Default::default()
        });
        let sink = CollectingSink::default();
        let mut controller = controller(thermostat, FakeInput::new(), &sink);

        let sweep = SweepSpec::new(20.0, 21.0, 0.5).unwrap();
        let summary = controller.run(&sweep, &settle_config()).await.unwrap();

        assert_eq!(summary.timed_out, 2);
        assert_eq!(summary.settled, 0);

        let records = sink.records.lock().unwrap();
        assert_eq!(records.len(), 2);
        for record in records.iter() {
            assert_eq!(record.outcome, SettleStatus::TimedOut);
            assert_eq!(record.samples, 50);
            assert_eq!(record.last_temperature, Some(18.0));
        }
    }

    #[tokio::test]
    async fn test_device_failure_is_fatal_and_flushes_sinks() {
        let thermostat = Arc::new(FakeThermostat::default());
        let sink = CollectingSink::default();
        let mut input = FakeInput::new();
        input.fail_on_reading = Some(2);
        let mut controller = controller(thermostat, input, &sink);

        let sweep = SweepSpec::new(20.0, 22.0, 0.5).unwrap();
        let err = controller.run(&sweep, &settle_config()).await.unwrap_err();

        assert!(matches!(err, SweepError::Device { setpoint, .. } if setpoint == 20.5));
        assert_eq!(sink.records.lock().unwrap().len(), 1);
        assert!(sink.flushed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_subscription_failure_skips_setpoint() {
        let thermostat = Arc::new(FakeThermostat {
            refuse_subscribe: true,
            ..Default::default()
        });
        let sink = CollectingSink::default();
        let mut controller = controller(thermostat, FakeInput::new(), &sink);

        let sweep = SweepSpec::new(20.0, 21.0, 0.5).unwrap();
        let summary = controller.run(&sweep, &settle_config()).await.unwrap();

        assert_eq!(summary.recorded(), 0);
        assert_eq!(summary.skipped.len(), 2);
        assert!(summary.skipped[0].reason.contains("broker unreachable"));
    }

    #[tokio::test]
    async fn test_prepare_configures_engages_and_commands_start() {
        let thermostat = Arc::new(FakeThermostat::default());
        let sink = CollectingSink::default();
        let input = FakeInput::new();
        let resets = input.resets.clone();
        let mut controller = controller(thermostat.clone(), input, &sink);

        controller.prepare(20.0).await.unwrap();

        let writes = thermostat.writes.lock().unwrap();
        let paths: Vec<&str> = writes.iter().map(|(path, _)| path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "pidsettings/0/max_i_pos",
                "pidsettings/0/max_i_neg",
                "pidsettings/0/pid/0",
                "pidsettings/0/pid/1",
                "engage_iir/0",
                TARGET_PATH,
            ]
        );
        assert_eq!(writes.last().unwrap().1, json!(20.0));
        assert_eq!(*resets.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_prepare_failure_is_fatal() {
        let thermostat = Arc::new(FakeThermostat {
            reject_targets: vec![20.0],
            ..Default::default()
        });
        let sink = CollectingSink::default();
        let mut controller = controller(thermostat, FakeInput::new(), &sink);

        let err = controller.prepare(20.0).await.unwrap_err();
        assert!(matches!(err, SweepError::Setup { ref path, .. } if path == TARGET_PATH));
    }
}
