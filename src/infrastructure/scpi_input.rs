// SCPI analog input over a raw TCP socket (LAN voltmeters, port 5025)
use crate::application::analog_input::{AnalogInput, DeviceError};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;

/// Instruments report an overloaded input as 9.9E37.
const OVERLOAD: f64 = 9.9e37;

pub struct ScpiAnalogInput<S = TcpStream> {
    stream: BufStream<S>,
    peer: String,
    timeout: Duration,
}

impl ScpiAnalogInput<TcpStream> {
    pub async fn connect(address: &str, timeout: Duration) -> Result<Self, DeviceError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
            .await
            .map_err(|_| DeviceError::Timeout(format!("connection to {}", address)))??;
        stream.set_nodelay(true)?;
        tracing::info!("Connected to SCPI instrument at {}", address);
        Ok(Self::from_stream(stream, address, timeout))
    }
}

impl<S> ScpiAnalogInput<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Sync,
{
    pub fn from_stream(stream: S, peer: &str, timeout: Duration) -> Self {
        Self {
            stream: BufStream::new(stream),
            peer: peer.to_string(),
            timeout,
        }
    }

    async fn write(&mut self, command: &str) -> Result<(), DeviceError> {
        tracing::debug!("{} <- {}", self.peer, command);
        self.stream.write_all(command.as_bytes()).await?;
        self.stream.write_all(b"\n").await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn query(&mut self, command: &str) -> Result<String, DeviceError> {
        self.write(command).await?;

        let mut line = String::new();
        let read = tokio::time::timeout(self.timeout, self.stream.read_line(&mut line))
            .await
            .map_err(|_| DeviceError::Timeout(format!("reply to {}", command)))??;
        if read == 0 {
            return Err(DeviceError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("{} closed the connection", self.peer),
            )));
        }

        let reply = line.trim().to_string();
        tracing::debug!("{} -> {}", self.peer, reply);
        Ok(reply)
    }

    async fn wait_complete(&mut self) -> Result<(), DeviceError> {
        let reply = self.query("*OPC?").await?;
        if reply == "1" {
            Ok(())
        } else {
            Err(DeviceError::Malformed(reply))
        }
    }
}

/// Parse a numeric SCPI reply such as `+1.23456789E-01`.
pub fn parse_reading(reply: &str) -> Result<f64, DeviceError> {
    let value: f64 = reply
        .trim()
        .parse()
        .map_err(|_| DeviceError::Malformed(reply.to_string()))?;
    if !value.is_finite() || value.abs() >= OVERLOAD {
        return Err(DeviceError::Malformed(reply.to_string()));
    }
    Ok(value)
}

/// Channel 0 is the front input; higher channels address scanner slots.
pub fn measure_command(channel: usize) -> String {
    match channel {
        0 => "MEAS:VOLT:DC?".to_string(),
        n => format!("MEAS:VOLT:DC? (@{})", n),
    }
}

#[async_trait]
impl<S> AnalogInput for ScpiAnalogInput<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Sync,
{
    async fn reset(&mut self) -> Result<(), DeviceError> {
        self.write("*RST").await?;
        self.write("*CLS").await?;
        self.wait_complete().await
    }

    async fn status(&mut self) -> Result<(), DeviceError> {
        self.write("INIT").await?;
        self.wait_complete().await
    }

    async fn sample(&mut self, channel: usize) -> Result<f64, DeviceError> {
        let reply = self.query(&measure_command(channel)).await?;
        parse_reading(&reply)
    }
}
