//! Round-robin refresh of the register map from the device

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error};

use super::fieldbus::FieldBus;
use crate::core::metrics::GatewayMetrics;
use crate::core::register_map::{RegisterMap, RegisterRange};
use crate::protocol::constants::MODBUS_MAX_READ_REGISTERS;

/// Result of one poll round
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    pub chunks_read: usize,
    pub chunks_failed: usize,
    /// Round cut short because commands were waiting
    pub interrupted: bool,
}

/// Reads every configured range and stores the values through `set`,
/// so hooks fire as for confirmed writes
#[derive(Debug, Clone)]
pub struct RangePoller {
    ranges: Vec<RegisterRange>,
    interval: Duration,
}

impl RangePoller {
    pub fn new(ranges: Vec<RegisterRange>, interval: Duration) -> Self {
        Self { ranges, interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Poll every range once. `yield_now` is checked between chunks; when it
    /// returns true the round stops and the chunk just read is discarded.
    pub async fn poll_round<B: FieldBus + ?Sized>(
        &self,
        bus: &mut B,
        map: &RegisterMap,
        metrics: &GatewayMetrics,
        mut yield_now: impl FnMut() -> bool,
    ) -> PollReport {
        let started = Instant::now();
        let mut report = PollReport::default();

        'ranges: for range in &self.ranges {
            for chunk in chunks(range) {
                if yield_now() {
                    report.interrupted = true;
                    break 'ranges;
                }

                let read_started = Instant::now();
                match bus.read_holding_registers(chunk.start, chunk.length).await {
                    Ok(values) => {
                        metrics.record_read(read_started.elapsed());
                        if yield_now() {
                            // A write went in flight during the read
                            report.interrupted = true;
                            break 'ranges;
                        }
                        if let Err(e) = map.set_range(chunk.start, &values) {
                            error!("Poll result for {} not stored: {}", chunk, e);
                            report.chunks_failed += 1;
                        } else {
                            report.chunks_read += 1;
                        }
                    },
                    Err(e) => {
                        metrics.record_read_error(e.kind);
                        error!(kind = %e.kind, "Poll of {} failed: {}", chunk, e);
                        report.chunks_failed += 1;
                    },
                }
            }
        }

        if !report.interrupted {
            metrics.record_round_robin(started.elapsed());
        }
        debug!(?report, "Poll round finished in {:?}", started.elapsed());
        report
    }
}

/// Split a range into reads of at most 125 registers
fn chunks(range: &RegisterRange) -> impl Iterator<Item = RegisterRange> {
    let range = *range;
    let max = MODBUS_MAX_READ_REGISTERS as u16;
    (0..range.length).step_by(usize::from(max)).map(move |offset| {
        RegisterRange::new(range.start + offset, max.min(range.length - offset))
    })
}
