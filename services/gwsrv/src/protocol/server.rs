//! Client-facing Modbus TCP server
//!
//! One task per connection, bounded by `max_connections`. Requests on a
//! connection are handled strictly in order.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::constants::{
    FC_READ_COILS, FC_READ_HOLDING_REGISTERS, MODBUS_MAX_READ_COILS, MODBUS_MAX_READ_REGISTERS,
};
use super::frame::MbapCodec;
use super::pdu::{read_u16, ModbusPdu, PduBuilder};
use crate::core::register_map::RegisterMap;
use crate::error::{GwError, Result};
use crate::interceptor::{Outcome, RequestInterceptor};

pub struct GatewayServer {
    interceptor: RequestInterceptor,
    max_connections: usize,
}

impl GatewayServer {
    pub fn new(interceptor: RequestInterceptor, max_connections: usize) -> Self {
        Self {
            interceptor,
            max_connections,
        }
    }

    fn map(&self) -> &RegisterMap {
        self.interceptor.map()
    }

    /// Accept clients until the token is cancelled
    pub async fn serve(self: Arc<Self>, listener: TcpListener, token: CancellationToken) -> Result<()> {
        let local = listener.local_addr()?;
        info!(
            "Modbus TCP server listening on {} (max {} connections)",
            local, self.max_connections
        );
        let slots = Arc::new(Semaphore::new(self.max_connections));

        loop {
            let permit = tokio::select! {
                _ = token.cancelled() => break,
                permit = slots.clone().acquire_owned() => permit
                    .map_err(|_| GwError::protocol("connection limiter closed"))?,
            };
            let (stream, peer) = tokio::select! {
                _ = token.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        continue;
                    },
                },
            };

            let server = Arc::clone(&self);
            let token = token.child_token();
            tokio::spawn(async move {
                let _permit = permit;
                info!("Client connected: {}", peer);
                match server.handle_connection(stream, peer, token).await {
                    Ok(()) => info!("Client disconnected: {}", peer),
                    Err(e) => warn!("Client {} dropped: {}", peer, e),
                }
            });
        }

        info!("Modbus TCP server stopped");
        Ok(())
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        token: CancellationToken,
    ) -> Result<()> {
        let mut framed = Framed::new(stream, MbapCodec);
        loop {
            let request = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                next = framed.next() => match next {
                    Some(request) => request?,
                    None => return Ok(()),
                },
            };

            debug!(
                %peer,
                tid = request.transaction_id,
                fc = request.pdu.function_code(),
                "Request received"
            );
            let response = self.handle_pdu(request.pdu.as_slice()).await;
            framed.send(request.reply(response)).await?;
        }
    }

    /// Produce the response PDU for one request PDU
    pub async fn handle_pdu(&self, pdu: &[u8]) -> ModbusPdu {
        let fc = pdu.first().copied().unwrap_or_default();
        match self.interceptor.intercept(pdu).await {
            Outcome::Passthrough => self.serve_read(pdu).unwrap_or_else(|e| {
                debug!(fc, "Read rejected: {}", e);
                ModbusPdu::exception(fc, e.exception_code())
            }),
            Outcome::Respond(response) => response,
            Outcome::Exception(code) => ModbusPdu::exception(fc, code),
        }
    }

    fn serve_read(&self, pdu: &[u8]) -> Result<ModbusPdu> {
        let (Some(address), Some(quantity)) = (read_u16(pdu, 1), read_u16(pdu, 3)) else {
            return Err(GwError::protocol("read request too short"));
        };
        let count = usize::from(quantity);

        match pdu[0] {
            FC_READ_HOLDING_REGISTERS => {
                if !(1..=MODBUS_MAX_READ_REGISTERS).contains(&count) {
                    return Err(GwError::protocol(format!("invalid register count {}", count)));
                }
                let values = self.map().get_range(address, count)?;
                Ok(PduBuilder::new()
                    .function_code(FC_READ_HOLDING_REGISTERS)?
                    .byte((count * 2) as u8)?
                    .registers(&values)?
                    .build())
            },
            FC_READ_COILS => {
                if !(1..=MODBUS_MAX_READ_COILS).contains(&count) {
                    return Err(GwError::protocol(format!("invalid coil count {}", count)));
                }
                let states = self.map().coils(address, count)?;
                Ok(PduBuilder::new()
                    .function_code(FC_READ_COILS)?
                    .byte(count.div_ceil(8) as u8)?
                    .coils(&states)?
                    .build())
            },
            fc => Err(GwError::protocol(format!("function 0x{:02X} is not a read", fc))),
        }
    }
}
