//! Telemetry relay to the downstream peer
//!
//! A write to the trigger register snapshots the telemetry block inside the
//! register map's write path and hands it to the pusher task. The pusher makes
//! one bounded attempt per snapshot and never retries past its budget.

pub mod peer;
pub mod pusher;

use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::core::register_map::{HookContext, RegisterHook, RegisterRange};

pub use peer::{ModbusTcpPeer, TelemetryPeer};
pub use pusher::TelemetryPusher;

/// Telemetry delivery failures; logged, never reported to Modbus clients
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TelemetryError {
    #[error("Telemetry connect failed: {0}")]
    Connect(String),

    #[error("Telemetry push failed: {0}")]
    Push(String),

    #[error("Telemetry push timed out after {0:?}")]
    Timeout(Duration),
}

/// Register block captured at trigger time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub start: u16,
    pub values: Vec<u16>,
}

/// Hook on the trigger register feeding the pusher task
pub struct TelemetryHook {
    block: RegisterRange,
    sentinel: u16,
    tx: mpsc::Sender<TelemetrySnapshot>,
}

impl TelemetryHook {
    pub fn new(block: RegisterRange, sentinel: u16, tx: mpsc::Sender<TelemetrySnapshot>) -> Self {
        Self {
            block,
            sentinel,
            tx,
        }
    }
}

impl RegisterHook for TelemetryHook {
    fn on_set(&self, ctx: &mut HookContext<'_>, address: u16, value: u16) -> u16 {
        // Unconfirmed data is never relayed
        if value == self.sentinel {
            return value;
        }
        let Some(values) = ctx.registers(self.block.start, self.block.length) else {
            warn!("Telemetry block {} not registered", self.block);
            return value;
        };

        let snapshot = TelemetrySnapshot {
            start: self.block.start,
            values,
        };
        match self.tx.try_send(snapshot) {
            Ok(()) => debug!(address, "Telemetry snapshot queued"),
            Err(TrySendError::Full(_)) => debug!("Telemetry push in flight, snapshot dropped"),
            Err(TrySendError::Closed(_)) => debug!("Telemetry task stopped, snapshot dropped"),
        }
        value
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::core::register_map::RegisterMap;
    use std::sync::Arc;

    fn map_with_hook(tx: mpsc::Sender<TelemetrySnapshot>) -> RegisterMap {
        RegisterMap::builder(0xFFFF)
            .range(RegisterRange::new(768, 4))
            .unwrap()
            .hook(
                771,
                Arc::new(TelemetryHook::new(RegisterRange::new(768, 4), 0xFFFF, tx)),
            )
            .unwrap()
            .build()
    }

    #[test]
    fn test_trigger_snapshots_block() {
        let (tx, mut rx) = mpsc::channel(1);
        let map = map_with_hook(tx);

        map.set_range(768, &[1, 2, 3, 4]).unwrap();
        let snapshot = rx.try_recv().unwrap();
        assert_eq!(snapshot.start, 768);
        assert_eq!(snapshot.values, vec![1, 2, 3, 4]);
        // Trigger value stored unchanged
        assert_eq!(map.get(771).unwrap(), 4);
    }

    #[test]
    fn test_pending_trigger_not_relayed() {
        let (tx, mut rx) = mpsc::channel(1);
        let map = map_with_hook(tx);

        map.mark_pending(771, 1).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_snapshot_dropped_while_busy() {
        let (tx, mut rx) = mpsc::channel(1);
        let map = map_with_hook(tx);

        map.set(771, 1).unwrap();
        map.set(771, 2).unwrap();
        assert_eq!(rx.try_recv().unwrap().values[3], 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_other_addresses_do_not_trigger() {
        let (tx, mut rx) = mpsc::channel(1);
        let map = map_with_hook(tx);

        map.set(768, 9).unwrap();
        assert!(rx.try_recv().is_err());
    }
}
