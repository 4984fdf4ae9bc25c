//! Gateway core
//!
//! Register map, write commands and the queue carrying them, the status
//! bit-field view and the process-wide counters.

pub mod command;
pub mod materializer;
pub mod metrics;
pub mod queue;
pub mod register_map;

pub use command::{WriteCommand, MAX_WRITE_VALUES};
pub use materializer::StatusMaterializer;
pub use metrics::{GatewayMetrics, MetricsSnapshot, METRICS_BLOCK};
pub use queue::{command_queue, CommandReceiver, CommandSender, CommandSlot};
pub use register_map::{HookContext, RegisterHook, RegisterMap, RegisterRange};
