//! Downstream peer client

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio_modbus::client::{tcp, Context, Writer};
use tokio_modbus::Slave;
use tracing::{debug, info, warn};

use super::TelemetryError;

/// Session to the telemetry peer
#[async_trait]
pub trait TelemetryPeer: Send {
    /// Whether a session is established; never blocks
    fn is_connected(&mut self) -> bool;

    /// Start one connection attempt in the background and return immediately
    fn connect(&mut self);

    /// Write `values` to the peer starting at `start`
    async fn push(&mut self, start: u16, values: &[u16]) -> Result<(), TelemetryError>;
}

/// Modbus TCP peer written with FC16
pub struct ModbusTcpPeer {
    address: SocketAddr,
    unit_id: u8,
    context: Option<Context>,
    connecting: Option<oneshot::Receiver<io::Result<TcpStream>>>,
}

impl ModbusTcpPeer {
    pub fn new(address: SocketAddr, unit_id: u8) -> Self {
        Self {
            address,
            unit_id,
            context: None,
            connecting: None,
        }
    }

    fn poll_connecting(&mut self) {
        let Some(rx) = self.connecting.as_mut() else {
            return;
        };
        match rx.try_recv() {
            Err(TryRecvError::Empty) => {},
            Err(TryRecvError::Closed) => self.connecting = None,
            Ok(Err(e)) => {
                warn!("{}", TelemetryError::Connect(format!("{}: {}", self.address, e)));
                self.connecting = None;
            },
            Ok(Ok(stream)) => {
                info!("Telemetry peer connected: {}", self.address);
                self.context = Some(tcp::attach_slave(stream, Slave(self.unit_id)));
                self.connecting = None;
            },
        }
    }
}

#[async_trait]
impl TelemetryPeer for ModbusTcpPeer {
    fn is_connected(&mut self) -> bool {
        self.poll_connecting();
        self.context.is_some()
    }

    fn connect(&mut self) {
        if self.context.is_some() || self.connecting.is_some() {
            return;
        }
        let (tx, rx) = oneshot::channel();
        let address = self.address;
        debug!("Connecting to telemetry peer {}", address);
        tokio::spawn(async move {
            let _ = tx.send(TcpStream::connect(address).await);
        });
        self.connecting = Some(rx);
    }

    async fn push(&mut self, start: u16, values: &[u16]) -> Result<(), TelemetryError> {
        let ctx = self
            .context
            .as_mut()
            .ok_or_else(|| TelemetryError::Push("not connected".to_string()))?;

        match ctx.write_multiple_registers(start, values).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(exception)) => Err(TelemetryError::Push(format!(
                "peer exception {:?}",
                exception
            ))),
            Err(e) => {
                // Session is unusable after a transport failure
                self.context = None;
                Err(TelemetryError::Push(e.to_string()))
            },
        }
    }
}
