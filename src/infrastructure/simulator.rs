// Simulated thermostat: first-order thermal model behind the settings,
// telemetry and analog input interfaces
use crate::application::analog_input::{AnalogInput, DeviceError};
use crate::application::config_rpc::{ConfigRpc, RpcError};
use crate::application::telemetry_feed::{TelemetryFeed, TelemetryStream};
use crate::domain::thermostat::{ENGAGE_PATH, TARGET_PATH};
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};

const TUNABLE_PATHS: [&str; 5] = [
    "pidsettings/0/pid/0",
    "pidsettings/0/pid/1",
    "pidsettings/0/pid/2",
    "pidsettings/0/max_i_pos",
    "pidsettings/0/max_i_neg",
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThermalModel {
    pub ambient: f64,
    pub time_constant: Duration,
    pub period: Duration,
    /// Probe output in volts per °C.
    pub probe_gain: f64,
}

impl Default for ThermalModel {
    fn default() -> Self {
        Self {
            ambient: 22.0,
            time_constant: Duration::from_secs(2),
            period: Duration::from_millis(50),
            probe_gain: 0.01,
        }
    }
}

#[derive(Debug)]
struct PlantState {
    temperature: f64,
    target: f64,
    engaged: bool,
    updated_at: Instant,
    tuning: HashMap<String, f64>,
}

impl PlantState {
    /// Exact first-order response over the time since the last update.
    fn advance(&mut self, model: &ThermalModel, now: Instant) {
        let setpoint = if self.engaged { self.target } else { model.ambient };
        let elapsed = now.saturating_duration_since(self.updated_at).as_secs_f64();
        let tau = model.time_constant.as_secs_f64().max(f64::EPSILON);
        self.temperature = setpoint + (self.temperature - setpoint) * (-elapsed / tau).exp();
        self.updated_at = now;
    }

    fn drive_current(&self) -> f64 {
        if !self.engaged {
            return 0.0;
        }
        let max_pos = self.tuning.get("pidsettings/0/max_i_pos").copied().unwrap_or(0.3);
        let max_neg = self.tuning.get("pidsettings/0/max_i_neg").copied().unwrap_or(0.1);
        let gain = self.tuning.get("pidsettings/0/pid/0").copied().unwrap_or(10.0);
        ((self.target - self.temperature) * gain * 0.01).clamp(-max_neg, max_pos)
    }
}

#[derive(Clone)]
pub struct SimulatedThermostat {
    model: ThermalModel,
    state: Arc<Mutex<PlantState>>,
}

impl SimulatedThermostat {
    pub fn new(model: ThermalModel) -> Self {
        let state = PlantState {
            temperature: model.ambient,
            target: model.ambient,
            engaged: false,
            updated_at: Instant::now(),
            tuning: HashMap::new(),
        };
        Self {
            model,
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn state(&self) -> MutexGuard<'_, PlantState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn temperature(&self) -> f64 {
        let mut state = self.state();
        state.advance(&self.model, Instant::now());
        state.temperature
    }

    fn telemetry_payload(&self) -> Bytes {
        let mut state = self.state();
        state.advance(&self.model, Instant::now());
        let report = json!({
            "adcs": [state.temperature, self.model.ambient],
            "dacs": [state.drive_current(), 0.0],
        });
        Bytes::from(report.to_string())
    }

    /// Analog probe reading the plant temperature.
    pub fn probe(&self) -> SimulatedProbe {
        SimulatedProbe {
            plant: self.clone(),
        }
    }
}

fn expect_number(path: &str, value: &Value) -> Result<f64, RpcError> {
    value.as_f64().ok_or_else(|| RpcError::Rejected {
        path: path.to_string(),
        code: 2,
        message: format!("expected a number, got {}", value),
    })
}

#[async_trait]
impl ConfigRpc for SimulatedThermostat {
    async fn set(&self, path: &str, value: Value) -> Result<(), RpcError> {
        let now = Instant::now();
        let mut state = self.state();
        state.advance(&self.model, now);

        match path {
            TARGET_PATH => state.target = expect_number(path, &value)?,
            ENGAGE_PATH => {
                state.engaged = value.as_bool().ok_or_else(|| RpcError::Rejected {
                    path: path.to_string(),
                    code: 2,
                    message: format!("expected a boolean, got {}", value),
                })?;
            }
            p if TUNABLE_PATHS.contains(&p) => {
                let number = expect_number(path, &value)?;
                state.tuning.insert(path.to_string(), number);
            }
            _ => {
                return Err(RpcError::Rejected {
                    path: path.to_string(),
                    code: 1,
                    message: "unknown setting".to_string(),
                });
            }
        }

        tracing::debug!("Simulated thermostat: {} = {}", path, value);
        Ok(())
    }
}

#[async_trait]
impl TelemetryFeed for SimulatedThermostat {
    async fn subscribe(&self, topic: &str) -> anyhow::Result<TelemetryStream> {
        tracing::debug!("Simulated telemetry on {}", topic);
        let plant = self.clone();
        let mut ticker = tokio::time::interval(self.model.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Ok(Box::pin(async_stream::stream! {
            loop {
                ticker.tick().await;
                yield plant.telemetry_payload();
            }
        }))
    }
}

pub struct SimulatedProbe {
    plant: SimulatedThermostat,
}

#[async_trait]
impl AnalogInput for SimulatedProbe {
    async fn reset(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    async fn status(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    async fn sample(&mut self, channel: usize) -> Result<f64, DeviceError> {
        if channel != 0 {
            return Err(DeviceError::NoSuchChannel(channel));
        }
        Ok(self.plant.temperature() * self.plant.model.probe_gain)
    }
}
