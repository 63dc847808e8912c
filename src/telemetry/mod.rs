//! Device telemetry: transport traits, frame decoding and the connection supervisor.

mod backoff;
mod decode;
mod supervisor;
mod types;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

pub use backoff::Backoff;
pub use decode::decode_frame;
pub use supervisor::ConnectionSupervisor;
pub use types::{
    BoxTelemetry, LinkState, PrintState, PrintStatus, SlotTelemetry, TelemetrySnapshot,
    TelemetryView,
};

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Connect failed: {0}")]
    Connect(String),

    #[error("Receive failed: {0}")]
    Receive(String),

    #[error("No frame within {0} ms")]
    Timeout(u64),

    #[error("Malformed frame: {0}")]
    Malformed(String),
}

/// Something the supervisor can (re)connect to.
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn TelemetryStream>, TelemetryError>;
}

/// An open telemetry stream yielding raw frames.
#[async_trait]
pub trait TelemetryStream: Send {
    /// Next raw frame. `Ok(None)` means the stream was closed by the peer.
    async fn next_frame(&mut self) -> Result<Option<Value>, TelemetryError>;
}
