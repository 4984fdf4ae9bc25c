//! Modbus TCP gateway service (gwsrv)
//!
//! Exposes an inverter/battery controller that is reachable only over a serial
//! Modbus RTU link as a Modbus TCP server, and relays a telemetry block to a
//! second Modbus TCP peer.
//!
//! ```text
//! client ──TCP──► GatewayServer ──► RequestInterceptor ──► RegisterMap (reads)
//!                                          │
//!                                          ▼ WriteCommand
//!                                    CommandQueue ──► SerialForwarder ──RTU──► device
//!                                                          │
//!                        RegisterMap::set ◄────────────────┘ (confirm / poll)
//!                          ├─ StatusMaterializer  (status register → coils)
//!                          └─ TelemetryHook ──► TelemetryPusher ──TCP──► peer
//! ```

pub mod bootstrap;
pub mod config;
pub mod core;
pub mod error;
pub mod gateway;
pub mod interceptor;
pub mod persistence;
pub mod protocol;
pub mod serial;
pub mod telemetry;

pub use config::GatewayConfig;
pub use error::{GwError, Result};
pub use gateway::Gateway;
pub use interceptor::{Outcome, RequestInterceptor};
