// Analog input trait - the device that takes the per-setpoint measurement
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("device returned an unreadable value: {0:?}")]
    Malformed(String),
    #[error("device timed out waiting for {0}")]
    Timeout(String),
    #[error("channel {0} is not available on this device")]
    NoSuchChannel(usize),
}

#[async_trait]
pub trait AnalogInput: Send + Sync {
    /// Return the acquisition to its power-on configuration.
    async fn reset(&mut self) -> Result<(), DeviceError>;

    /// Refresh the acquisition so the next `sample` reflects the present input.
    async fn status(&mut self) -> Result<(), DeviceError>;

    /// Latest reading on `channel`.
    async fn sample(&mut self, channel: usize) -> Result<f64, DeviceError>;
}
