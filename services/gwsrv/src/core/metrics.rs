//! Process-wide gateway counters and their register block
//!
//! Counters are owned by the gateway and shared as `Arc<GatewayMetrics>`.
//! [`GatewayMetrics::publish`] copies a snapshot into the fixed metrics block
//! of the register map so clients can read them like any other register.

use std::sync::atomic::{AtomicU16, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use tracing::warn;

use super::register_map::{RegisterMap, RegisterRange};
use crate::serial::fieldbus::FieldBusErrorKind;

/// Metrics register addresses
pub mod addr {
    pub const READ_COUNT_H: u16 = 37100;
    pub const READ_COUNT_L: u16 = 37101;
    pub const READ_ERROR: u16 = 37102;
    pub const READ_TIME: u16 = 37103;
    pub const MAX_READ_TIME: u16 = 37104;
    pub const WRITE_COUNT_H: u16 = 37105;
    pub const WRITE_COUNT_L: u16 = 37106;
    pub const WRITE_ERROR: u16 = 37107;
    pub const WRITE_TIME: u16 = 37108;
    pub const MAX_WRITE_TIME: u16 = 37109;
    pub const ROUND_ROBIN_TIME: u16 = 37110;
    pub const MAX_ROUND_ROBIN_TIME: u16 = 37111;
    pub const WRITE_QUEUE_SIZE: u16 = 37120;
    pub const RESTART_COUNTER: u16 = 37121;
}

/// Registered metrics block, 37100..=37121
pub const METRICS_BLOCK: RegisterRange = RegisterRange::new(addr::READ_COUNT_H, 22);

pub fn is_metrics_address(address: u16) -> bool {
    METRICS_BLOCK.contains(address)
}

fn saturate(value: u32) -> u16 {
    value.min(u32::from(u16::MAX)) as u16
}

fn millis(elapsed: Duration) -> u32 {
    elapsed.as_millis().min(u128::from(u32::MAX)) as u32
}

/// Point-in-time copy of every counter
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub read_count: u32,
    pub read_errors: u32,
    pub read_time_ms: u32,
    pub max_read_time_ms: u32,
    pub write_count: u32,
    pub write_errors: u32,
    pub write_time_ms: u32,
    pub max_write_time_ms: u32,
    pub round_robin_ms: u32,
    pub max_round_robin_ms: u32,
    pub queue_depth: usize,
    pub restart_counter: u16,
    pub fieldbus_errors: Vec<(FieldBusErrorKind, u32)>,
}

impl MetricsSnapshot {
    /// Register values for [`METRICS_BLOCK`], in address order
    pub fn to_registers(&self) -> Vec<u16> {
        let mut block = vec![0u16; usize::from(METRICS_BLOCK.length)];
        let mut put = |address: u16, value: u16| {
            block[usize::from(address - METRICS_BLOCK.start)] = value;
        };

        put(addr::READ_COUNT_H, (self.read_count >> 16) as u16);
        put(addr::READ_COUNT_L, self.read_count as u16);
        put(addr::READ_ERROR, saturate(self.read_errors));
        put(addr::READ_TIME, saturate(self.read_time_ms));
        put(addr::MAX_READ_TIME, saturate(self.max_read_time_ms));
        put(addr::WRITE_COUNT_H, (self.write_count >> 16) as u16);
        put(addr::WRITE_COUNT_L, self.write_count as u16);
        put(addr::WRITE_ERROR, saturate(self.write_errors));
        put(addr::WRITE_TIME, saturate(self.write_time_ms));
        put(addr::MAX_WRITE_TIME, saturate(self.max_write_time_ms));
        // Round robin is reported in seconds
        put(addr::ROUND_ROBIN_TIME, saturate(self.round_robin_ms / 1000));
        put(addr::MAX_ROUND_ROBIN_TIME, saturate(self.max_round_robin_ms / 1000));
        put(addr::WRITE_QUEUE_SIZE, self.queue_depth.min(usize::from(u16::MAX)) as u16);
        put(addr::RESTART_COUNTER, self.restart_counter);
        block
    }

    pub fn fieldbus_errors_of(&self, kind: FieldBusErrorKind) -> u32 {
        self.fieldbus_errors
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    }
}

/// Gateway counters
#[derive(Debug, Default)]
pub struct GatewayMetrics {
    read_count: AtomicU32,
    read_errors: AtomicU32,
    read_time_ms: AtomicU32,
    max_read_time_ms: AtomicU32,
    write_count: AtomicU32,
    write_errors: AtomicU32,
    write_time_ms: AtomicU32,
    max_write_time_ms: AtomicU32,
    round_robin_ms: AtomicU32,
    max_round_robin_ms: AtomicU32,
    queue_depth: AtomicUsize,
    restart_counter: AtomicU16,
    fieldbus_errors: [AtomicU32; FieldBusErrorKind::ALL.len()],
}

impl GatewayMetrics {
    pub fn new(restart_counter: u16) -> Self {
        let metrics = Self::default();
        metrics.restart_counter.store(restart_counter, Ordering::Relaxed);
        metrics
    }

    /// Successful field-bus read
    pub fn record_read(&self, elapsed: Duration) {
        let ms = millis(elapsed);
        self.read_count.fetch_add(1, Ordering::Relaxed);
        self.read_time_ms.store(ms, Ordering::Relaxed);
        self.max_read_time_ms.fetch_max(ms, Ordering::Relaxed);
    }

    pub fn record_read_error(&self, kind: FieldBusErrorKind) {
        self.read_count.fetch_add(1, Ordering::Relaxed);
        self.read_errors.fetch_add(1, Ordering::Relaxed);
        self.fieldbus_errors[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Successful field-bus write
    pub fn record_write(&self, elapsed: Duration) {
        let ms = millis(elapsed);
        self.write_count.fetch_add(1, Ordering::Relaxed);
        self.write_time_ms.store(ms, Ordering::Relaxed);
        self.max_write_time_ms.fetch_max(ms, Ordering::Relaxed);
    }

    pub fn record_write_error(&self, kind: FieldBusErrorKind) {
        self.write_count.fetch_add(1, Ordering::Relaxed);
        self.write_errors.fetch_add(1, Ordering::Relaxed);
        self.fieldbus_errors[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_round_robin(&self, elapsed: Duration) {
        let ms = millis(elapsed);
        self.round_robin_ms.store(ms, Ordering::Relaxed);
        self.max_round_robin_ms.fetch_max(ms, Ordering::Relaxed);
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.store(depth, Ordering::Relaxed);
    }

    pub fn restart_counter(&self) -> u16 {
        self.restart_counter.load(Ordering::Relaxed)
    }

    pub fn set_restart_counter(&self, value: u16) {
        self.restart_counter.store(value, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            read_count: self.read_count.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            read_time_ms: self.read_time_ms.load(Ordering::Relaxed),
            max_read_time_ms: self.max_read_time_ms.load(Ordering::Relaxed),
            write_count: self.write_count.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            write_time_ms: self.write_time_ms.load(Ordering::Relaxed),
            max_write_time_ms: self.max_write_time_ms.load(Ordering::Relaxed),
            round_robin_ms: self.round_robin_ms.load(Ordering::Relaxed),
            max_round_robin_ms: self.max_round_robin_ms.load(Ordering::Relaxed),
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            restart_counter: self.restart_counter(),
            fieldbus_errors: FieldBusErrorKind::ALL
                .iter()
                .map(|k| (*k, self.fieldbus_errors[k.index()].load(Ordering::Relaxed)))
                .collect(),
        }
    }

    /// Copy the current snapshot into the metrics block of `map`
    pub fn publish(&self, map: &RegisterMap) {
        let values = self.snapshot().to_registers();
        if let Err(e) = map.set_range(METRICS_BLOCK.start, &values) {
            warn!("Metrics block not registered, cannot publish: {}", e);
        }
    }
}
