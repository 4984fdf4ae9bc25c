//! Serial field-bus client
//!
//! The forwarder only needs `write`; the range poller additionally reads
//! holding registers. Framing and CRC are handled by `tokio-modbus`.

use std::fmt;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::timeout;
use tokio_modbus::client::{rtu, Context, Reader, Writer};
use tokio_modbus::{ExceptionCode as DeviceException, Slave};
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, warn};

use crate::config::SerialConfig;

/// Classification of a failed field-bus transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldBusErrorKind {
    IllegalFunction,
    IllegalAddress,
    IllegalValue,
    DeviceFailure,
    InvalidResponse,
    Timeout,
    InvalidFrame,
    Unknown,
}

impl FieldBusErrorKind {
    pub const ALL: [FieldBusErrorKind; 8] = [
        FieldBusErrorKind::IllegalFunction,
        FieldBusErrorKind::IllegalAddress,
        FieldBusErrorKind::IllegalValue,
        FieldBusErrorKind::DeviceFailure,
        FieldBusErrorKind::InvalidResponse,
        FieldBusErrorKind::Timeout,
        FieldBusErrorKind::InvalidFrame,
        FieldBusErrorKind::Unknown,
    ];

    /// Position in [`Self::ALL`], used for per-kind counters
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FieldBusErrorKind::IllegalFunction => "illegal_function",
            FieldBusErrorKind::IllegalAddress => "illegal_address",
            FieldBusErrorKind::IllegalValue => "illegal_value",
            FieldBusErrorKind::DeviceFailure => "device_failure",
            FieldBusErrorKind::InvalidResponse => "invalid_response",
            FieldBusErrorKind::Timeout => "timeout",
            FieldBusErrorKind::InvalidFrame => "invalid_frame",
            FieldBusErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FieldBusErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failed field-bus transaction
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Field bus error ({kind}): {message}")]
pub struct FieldBusError {
    pub kind: FieldBusErrorKind,
    pub message: String,
}

impl FieldBusError {
    pub fn new(kind: FieldBusErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    fn from_exception(exception: DeviceException) -> Self {
        let kind = match exception {
            DeviceException::IllegalFunction => FieldBusErrorKind::IllegalFunction,
            DeviceException::IllegalDataAddress => FieldBusErrorKind::IllegalAddress,
            DeviceException::IllegalDataValue => FieldBusErrorKind::IllegalValue,
            DeviceException::ServerDeviceFailure => FieldBusErrorKind::DeviceFailure,
            _ => FieldBusErrorKind::Unknown,
        };
        Self::new(kind, format!("device exception {:?}", exception))
    }

    fn from_transport(error: tokio_modbus::Error) -> Self {
        match error {
            tokio_modbus::Error::Protocol(e) => {
                Self::new(FieldBusErrorKind::InvalidResponse, e.to_string())
            },
            tokio_modbus::Error::Transport(e) => Self::from_io(&e),
        }
    }

    fn from_io(error: &io::Error) -> Self {
        let kind = match error.kind() {
            io::ErrorKind::TimedOut => FieldBusErrorKind::Timeout,
            io::ErrorKind::InvalidData => FieldBusErrorKind::InvalidFrame,
            _ => FieldBusErrorKind::Unknown,
        };
        Self::new(kind, error.to_string())
    }
}

/// Request/response primitive against the serial-attached device
#[async_trait]
pub trait FieldBus: Send {
    async fn write(&mut self, address: u16, values: &[u16]) -> Result<(), FieldBusError>;

    async fn read_holding_registers(
        &mut self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, FieldBusError>;
}

/// Modbus RTU master on a serial port
///
/// The port is opened on first use and reopened after a transport failure.
pub struct RtuFieldBus {
    config: SerialConfig,
    context: Option<Context>,
}

impl RtuFieldBus {
    pub fn new(config: SerialConfig) -> Self {
        Self {
            config,
            context: None,
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms)
    }

    fn context(&mut self) -> Result<&mut Context, FieldBusError> {
        if self.context.is_none() {
            let serial = tokio_serial::new(&self.config.port, self.config.baud_rate)
                .data_bits(self.config.data_bits.into())
                .parity(self.config.parity.into())
                .stop_bits(self.config.stop_bits.into())
                .open_native_async()
                .map_err(|e| {
                    FieldBusError::new(
                        FieldBusErrorKind::Unknown,
                        format!("failed to open {}: {}", self.config.port, e),
                    )
                })?;
            info!(
                port = %self.config.port,
                baud_rate = self.config.baud_rate,
                unit_id = self.config.unit_id,
                "Serial port opened"
            );
            self.context = Some(rtu::attach_slave(serial, Slave(self.config.unit_id)));
        }
        self.context
            .as_mut()
            .ok_or_else(|| FieldBusError::new(FieldBusErrorKind::Unknown, "serial port not open"))
    }

    fn on_error(&mut self, error: &FieldBusError) {
        if matches!(
            error.kind,
            FieldBusErrorKind::Unknown | FieldBusErrorKind::InvalidFrame
        ) {
            warn!("Dropping serial context after {}", error);
            self.context = None;
        }
    }
}

#[async_trait]
impl FieldBus for RtuFieldBus {
    async fn write(&mut self, address: u16, values: &[u16]) -> Result<(), FieldBusError> {
        let limit = self.timeout();
        let ctx = self.context()?;
        debug!(address, count = values.len(), "RTU write");

        let result = match values {
            [value] => timeout(limit, ctx.write_single_register(address, *value)).await,
            _ => timeout(limit, ctx.write_multiple_registers(address, values)).await,
        };
        let result = match result {
            Err(_) => Err(FieldBusError::new(
                FieldBusErrorKind::Timeout,
                format!("no response within {:?}", limit),
            )),
            Ok(Err(e)) => Err(FieldBusError::from_transport(e)),
            Ok(Ok(Err(exception))) => Err(FieldBusError::from_exception(exception)),
            Ok(Ok(Ok(()))) => Ok(()),
        };
        if let Err(e) = &result {
            self.on_error(e);
        }
        result
    }

    async fn read_holding_registers(
        &mut self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, FieldBusError> {
        let limit = self.timeout();
        let ctx = self.context()?;

        let result = match timeout(limit, ctx.read_holding_registers(address, count)).await {
            Err(_) => Err(FieldBusError::new(
                FieldBusErrorKind::Timeout,
                format!("no response within {:?}", limit),
            )),
            Ok(Err(e)) => Err(FieldBusError::from_transport(e)),
            Ok(Ok(Err(exception))) => Err(FieldBusError::from_exception(exception)),
            Ok(Ok(Ok(values))) => Ok(values),
        };
        if let Err(e) = &result {
            self.on_error(e);
        }
        result
    }
}
