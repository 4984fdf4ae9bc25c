//! Error handling for the gateway service
//!
//! Client-facing failures (addressing, capacity, backpressure) are mapped onto
//! Modbus exception codes by [`GwError::exception_code`]. Field-bus and
//! telemetry failures never reach the client that triggered them; they are
//! counted and logged where they happen.

use std::time::Duration;

use thiserror::Error;

use crate::protocol::pdu::ExceptionCode;
use crate::serial::fieldbus::FieldBusError;
use crate::telemetry::TelemetryError;

/// Gateway Service Error Type
#[derive(Error, Debug)]
pub enum GwError {
    /// Unregistered or invalid target address
    #[error("Address error: register {address} (0x{address:04X}) is not registered")]
    Addressing { address: u16 },

    /// Unregistered coil address
    #[error("Address error: coil {address} is not registered")]
    CoilAddressing { address: u16 },

    /// Write command longer than the per-command capacity (or empty)
    #[error("Capacity error: {requested} registers requested, allowed 1..={capacity}")]
    Capacity { requested: usize, capacity: usize },

    /// Command queue stayed full for the whole enqueue timeout
    #[error("Queue backpressure: command queue full for {0:?}")]
    QueueBackpressure(Duration),

    /// Serial forwarder is gone
    #[error("Queue closed: serial forwarder not running")]
    QueueClosed,

    /// Malformed request frame
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Restart counter store failures
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    FieldBus(#[from] FieldBusError),

    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
}

/// Result type alias for the gateway service
pub type Result<T> = std::result::Result<T, GwError>;

impl GwError {
    pub fn config(msg: impl Into<String>) -> Self {
        GwError::Config(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        GwError::Protocol(msg.into())
    }

    /// Exception code reported to the Modbus client for this error
    pub fn exception_code(&self) -> ExceptionCode {
        match self {
            GwError::Addressing { .. } | GwError::CoilAddressing { .. } => {
                ExceptionCode::IllegalDataAddress
            },
            GwError::Capacity { .. } | GwError::Protocol(_) => ExceptionCode::IllegalDataValue,
            GwError::QueueBackpressure(_) => ExceptionCode::ServerDeviceBusy,
            _ => ExceptionCode::ServerDeviceFailure,
        }
    }
}

impl From<common::CommonError> for GwError {
    fn from(err: common::CommonError) -> Self {
        GwError::Config(err.to_string())
    }
}
