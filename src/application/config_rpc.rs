// Settings RPC trait - writes a single controller setting
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("setting {path} was not acknowledged within {timeout:?}")]
    Timeout { path: String, timeout: Duration },
    #[error("setting {path} rejected (code {code}): {message}")]
    Rejected {
        path: String,
        code: i64,
        message: String,
    },
    #[error("settings transport failed: {0}")]
    Transport(String),
}

#[async_trait]
pub trait ConfigRpc: Send + Sync {
    /// Write `value` to the setting at `path` and wait for the controller's
    /// acknowledgement. No response payload is returned beyond success.
    async fn set(&self, path: &str, value: Value) -> Result<(), RpcError>;
}
