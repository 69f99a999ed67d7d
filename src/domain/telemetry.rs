// Telemetry domain model
use serde::Deserialize;
use thiserror::Error;

/// Index of the temperature channel in the `adcs` list.
pub const TEMPERATURE_CHANNEL: usize = 0;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed telemetry payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("telemetry carries no temperature channel (adcs is empty)")]
    MissingTemperature,
    #[error("temperature reading is not finite: {0}")]
    NonFinite(f64),
}

/// Wire shape published on `{prefix}/telemetry`. Unknown fields are ignored.
#[derive(Debug, Deserialize)]
struct RawTelemetry {
    adcs: Vec<f64>,
    #[serde(default)]
    dacs: Vec<f64>,
}

/// One decoded status report.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetrySample {
    pub seq: u64,
    pub temperature: f64,
    pub adcs: Vec<f64>,
    pub dacs: Vec<f64>,
}

impl TelemetrySample {
    pub fn new(seq: u64, adcs: Vec<f64>, dacs: Vec<f64>) -> Result<Self, DecodeError> {
        let temperature = *adcs
            .get(TEMPERATURE_CHANNEL)
            .ok_or(DecodeError::MissingTemperature)?;
        if !temperature.is_finite() {
            return Err(DecodeError::NonFinite(temperature));
        }
        Ok(Self {
            seq,
            temperature,
            adcs,
            dacs,
        })
    }

    /// Decode a raw telemetry message; `seq` is the arrival order.
    pub fn decode(seq: u64, payload: &[u8]) -> Result<Self, DecodeError> {
        let raw: RawTelemetry = serde_json::from_slice(payload)?;
        Self::new(seq, raw.adcs, raw.dacs)
    }

    /// Drive current, when the controller reports one.
    pub fn drive_current(&self) -> Option<f64> {
        self.dacs.first().copied()
    }
}
