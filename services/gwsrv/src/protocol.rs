//! Modbus TCP surface
//!
//! MBAP framing, the fixed-size PDU and the client-facing server.

pub mod constants;
pub mod frame;
pub mod pdu;
pub mod server;

pub use frame::{MbapCodec, MbapFrame};
pub use pdu::{ExceptionCode, ModbusPdu, PduBuilder};
pub use server::GatewayServer;
