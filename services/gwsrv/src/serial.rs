//! Serial side of the gateway
//!
//! The field-bus client, the forwarder consuming the command queue and the
//! range poller refreshing the register map between commands.

pub mod fieldbus;
pub mod forwarder;
pub mod poller;

pub use fieldbus::{FieldBus, FieldBusError, FieldBusErrorKind, RtuFieldBus};
pub use forwarder::SerialForwarder;
pub use poller::RangePoller;
