//! Request interception and translation
//!
//! Every client PDU is classified here. Reads are passed through to the
//! register map; writes become [`WriteCommand`]s on the command queue and are
//! acknowledged as soon as they are enqueued. Serial execution happens later
//! and its failures never reach the client.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::core::command::{WriteCommand, MAX_WRITE_VALUES};
use crate::core::materializer::{coil_bit, command_value};
use crate::core::metrics::{self, addr, GatewayMetrics};
use crate::core::queue::CommandSender;
use crate::core::register_map::{RegisterMap, RegisterRange};
use crate::error::{GwError, Result};
use crate::persistence::RestartCounterStore;
use crate::protocol::constants::{
    FC_READ_COILS, FC_READ_HOLDING_REGISTERS, FC_WRITE_MULTIPLE_REGISTERS, FC_WRITE_SINGLE_COIL,
    FC_WRITE_SINGLE_REGISTER,
};
use crate::protocol::pdu::{read_u16, ExceptionCode, ModbusPdu};

/// Length of the address/value (or address/quantity) echo in write responses
const ECHO_LEN: usize = 5;

/// What the server should do with a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Serve the read from the register map
    Passthrough,
    /// Send this PDU back
    Respond(ModbusPdu),
    /// Send an exception response for the request's function code
    Exception(ExceptionCode),
}

/// Status register layout used by the coil path
#[derive(Debug, Clone, Copy)]
pub struct StatusLayout {
    pub status_register: u16,
    pub coil_base: u16,
}

pub struct RequestInterceptor {
    map: Arc<RegisterMap>,
    queue: CommandSender,
    metrics: Arc<GatewayMetrics>,
    restart_store: Arc<dyn RestartCounterStore>,
    layout: StatusLayout,
}

impl RequestInterceptor {
    pub fn new(
        map: Arc<RegisterMap>,
        queue: CommandSender,
        metrics: Arc<GatewayMetrics>,
        restart_store: Arc<dyn RestartCounterStore>,
        layout: StatusLayout,
    ) -> Self {
        Self {
            map,
            queue,
            metrics,
            restart_store,
            layout,
        }
    }

    pub fn map(&self) -> &Arc<RegisterMap> {
        &self.map
    }

    pub async fn intercept(&self, pdu: &[u8]) -> Outcome {
        let Some(&fc) = pdu.first() else {
            return Outcome::Exception(ExceptionCode::IllegalDataValue);
        };

        let result = match fc {
            FC_READ_COILS | FC_READ_HOLDING_REGISTERS => return Outcome::Passthrough,
            FC_WRITE_SINGLE_COIL => self.write_single_coil(pdu).await,
            FC_WRITE_SINGLE_REGISTER => self.write_single_register(pdu).await,
            FC_WRITE_MULTIPLE_REGISTERS => self.write_multiple_registers(pdu).await,
            _ => {
                warn!(fc, "Unsupported function code");
                return Outcome::Exception(ExceptionCode::IllegalFunction);
            },
        };

        match result {
            Ok(response) => Outcome::Respond(response),
            Err(e) => {
                warn!(fc, "Request rejected: {}", e);
                Outcome::Exception(e.exception_code())
            },
        }
    }

    async fn write_single_coil(&self, pdu: &[u8]) -> Result<ModbusPdu> {
        let (address, _) = header(pdu)?;
        // On iff the high byte of the output value is 0xFF
        let on = pdu[3] == 0xFF;
        let bit = coil_bit(self.layout.coil_base, address)
            .ok_or(GwError::CoilAddressing { address })?;
        let value = command_value(bit, on);

        debug!(coil = address, bit, on, value, "Coil write translated");
        self.submit(self.layout.status_register, &[value]).await?;
        echo(pdu)
    }

    async fn write_single_register(&self, pdu: &[u8]) -> Result<ModbusPdu> {
        let (address, value) = header(pdu)?;
        if metrics::is_metrics_address(address) {
            return self.write_metrics(address, value, pdu).await;
        }

        debug!(address, value, "Single register write");
        self.submit(address, &[value]).await?;
        echo(pdu)
    }

    async fn write_multiple_registers(&self, pdu: &[u8]) -> Result<ModbusPdu> {
        let (address, quantity) = header(pdu)?;
        let quantity = usize::from(quantity);
        if quantity == 0 || quantity > MAX_WRITE_VALUES {
            return Err(GwError::Capacity {
                requested: quantity,
                capacity: MAX_WRITE_VALUES,
            });
        }

        let byte_count = pdu
            .get(5)
            .copied()
            .ok_or_else(|| GwError::protocol("missing byte count"))?;
        if usize::from(byte_count) != quantity * 2 || pdu.len() < 6 + quantity * 2 {
            return Err(GwError::protocol(format!(
                "byte count {} does not match {} registers",
                byte_count, quantity
            )));
        }
        let values: Vec<u16> = (0..quantity)
            .filter_map(|i| read_u16(pdu, 6 + i * 2))
            .collect();

        let target = RegisterRange::new(address, quantity as u16);
        if target.overlaps(&metrics::METRICS_BLOCK) {
            return match values.as_slice() {
                [value] => self.write_metrics(address, *value, pdu).await,
                _ => Err(GwError::Addressing { address }),
            };
        }

        debug!(address, quantity, "Multiple register write");
        self.submit(address, &values).await?;
        echo(pdu)
    }

    /// Reserve a queue slot, then mark the target pending and send.
    ///
    /// A write rejected for addressing or backpressure leaves the map untouched.
    async fn submit(&self, address: u16, values: &[u16]) -> Result<()> {
        let command = WriteCommand::new(address, values)?;
        self.map.check_range(address, command.len())?;

        let slot = self.queue.reserve().await?;
        self.map.mark_pending(address, command.len())?;

        // State unknown until the device confirms; lowered before the
        // forwarder can see the command
        let target = RegisterRange::new(address, command.len() as u16);
        if target.contains(self.layout.status_register) {
            self.map.set_coil(self.layout.coil_base, false)?;
        }

        slot.send(command);
        self.metrics.set_queue_depth(self.queue.depth());
        Ok(())
    }

    /// Writes into the metrics block are answered locally
    async fn write_metrics(&self, address: u16, value: u16, pdu: &[u8]) -> Result<ModbusPdu> {
        if address != addr::RESTART_COUNTER {
            return Err(GwError::Addressing { address });
        }

        if value == 0 {
            let store = Arc::clone(&self.restart_store);
            tokio::task::spawn_blocking(move || store.write_restart_counter(0))
                .await
                .map_err(|e| GwError::Persistence(e.to_string()))??;
            self.metrics.set_restart_counter(0);
            info!("Restart counter reset by client");
        } else {
            debug!(value, "Ignoring nonzero restart counter write");
        }
        self.metrics.publish(&self.map);
        echo(pdu)
    }
}

/// Address and value/quantity fields common to every write request
fn header(pdu: &[u8]) -> Result<(u16, u16)> {
    if pdu.len() < ECHO_LEN {
        return Err(GwError::protocol(format!("PDU too short: {} bytes", pdu.len())));
    }
    match (read_u16(pdu, 1), read_u16(pdu, 3)) {
        (Some(address), Some(value)) => Ok((address, value)),
        _ => Err(GwError::protocol("PDU too short")),
    }
}

fn echo(pdu: &[u8]) -> Result<ModbusPdu> {
    ModbusPdu::from_slice(&pdu[..ECHO_LEN])
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::core::materializer::{StatusMaterializer, STATUS_COIL_COUNT};
    use crate::core::metrics::METRICS_BLOCK;
    use crate::core::queue::{command_queue, CommandReceiver};
    use crate::persistence::MemoryRestartCounter;
    use std::time::Duration;

    const STATUS: u16 = 0x1306;
    const BASE: u16 = 600;

    struct Fixture {
        interceptor: RequestInterceptor,
        rx: CommandReceiver,
        map: Arc<RegisterMap>,
        metrics: Arc<GatewayMetrics>,
        store: Arc<MemoryRestartCounter>,
    }

    fn fixture(capacity: usize) -> Fixture {
        let map = Arc::new(
            RegisterMap::builder(0xFFFF)
                .range(RegisterRange::new(0x300, 4))
                .unwrap()
                .range(RegisterRange::new(0x400, 16))
                .unwrap()
                .range(RegisterRange::new(0x1300, 18))
                .unwrap()
                .range(METRICS_BLOCK)
                .unwrap()
                .coils(BASE, STATUS_COIL_COUNT)
                .hook(STATUS, Arc::new(StatusMaterializer::new(BASE, true)))
                .unwrap()
                .build(),
        );
        let (tx, rx) = command_queue(capacity, Duration::from_millis(20)).unwrap();
        let metrics = Arc::new(GatewayMetrics::new(7));
        let store = Arc::new(MemoryRestartCounter::new(7));
        let interceptor = RequestInterceptor::new(
            map.clone(),
            tx,
            metrics.clone(),
            store.clone(),
            StatusLayout {
                status_register: STATUS,
                coil_base: BASE,
            },
        );
        Fixture {
            interceptor,
            rx,
            map,
            metrics,
            store,
        }
    }

    fn fc16(address: u16, values: &[u16]) -> Vec<u8> {
        let mut pdu = vec![0x10];
        pdu.extend_from_slice(&address.to_be_bytes());
        pdu.extend_from_slice(&(values.len() as u16).to_be_bytes());
        pdu.push((values.len() * 2) as u8);
        for v in values {
            pdu.extend_from_slice(&v.to_be_bytes());
        }
        pdu
    }

    #[tokio::test]
    async fn test_reads_pass_through() {
        let f = fixture(10);
        assert_eq!(
            f.interceptor.intercept(&[0x03, 0x03, 0x00, 0x00, 0x04]).await,
            Outcome::Passthrough
        );
        assert_eq!(
            f.interceptor.intercept(&[0x01, 0x02, 0x58, 0x00, 0x10]).await,
            Outcome::Passthrough
        );
    }

    #[tokio::test]
    async fn test_unsupported_function() {
        let f = fixture(10);
        for fc in [0x02u8, 0x04, 0x0F, 0x17, 0x2B] {
            assert_eq!(
                f.interceptor.intercept(&[fc, 0, 0, 0, 1]).await,
                Outcome::Exception(ExceptionCode::IllegalFunction)
            );
        }
    }

    #[tokio::test]
    async fn test_single_register_write_enqueues_and_marks_pending() {
        let mut f = fixture(10);
        let request = [0x06, 0x03, 0x01, 0x12, 0x34];

        let outcome = f.interceptor.intercept(&request).await;
        assert_eq!(
            outcome,
            Outcome::Respond(ModbusPdu::from_slice(&request).unwrap())
        );
        assert!(f.map.is_pending(0x301).unwrap());

        let cmd = f.rx.try_recv().unwrap();
        assert_eq!(cmd.address(), 0x301);
        assert_eq!(cmd.values(), &[0x1234]);
        assert_eq!(f.metrics.snapshot().queue_depth, 1);
    }

    #[tokio::test]
    async fn test_multiple_register_write_within_capacity() {
        let mut f = fixture(10);
        let values: Vec<u16> = (1..=15).collect();
        let request = fc16(0x400, &values);

        let outcome = f.interceptor.intercept(&request).await;
        assert_eq!(
            outcome,
            Outcome::Respond(ModbusPdu::from_slice(&request[..5]).unwrap())
        );
        for address in 0x400..0x40F {
            assert!(f.map.is_pending(address).unwrap());
        }
        assert!(!f.map.is_pending(0x40F).unwrap());
        assert_eq!(f.rx.try_recv().unwrap().values(), &values[..]);
    }

    #[tokio::test]
    async fn test_write_over_capacity_never_reaches_queue() {
        let mut f = fixture(10);
        let values: Vec<u16> = (1..=16).collect();

        let outcome = f.interceptor.intercept(&fc16(0x400, &values)).await;
        assert_eq!(outcome, Outcome::Exception(ExceptionCode::IllegalDataValue));
        assert!(f.rx.is_empty());
        assert!(!f.map.is_pending(0x400).unwrap());
    }

    #[tokio::test]
    async fn test_byte_count_mismatch() {
        let mut f = fixture(10);
        let mut request = fc16(0x400, &[1, 2]);
        request[5] = 3;
        assert_eq!(
            f.interceptor.intercept(&request).await,
            Outcome::Exception(ExceptionCode::IllegalDataValue)
        );
        assert!(f.rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_write_to_unregistered_address() {
        let mut f = fixture(10);
        assert_eq!(
            f.interceptor.intercept(&[0x06, 0x03, 0x04, 0x00, 0x01]).await,
            Outcome::Exception(ExceptionCode::IllegalDataAddress)
        );
        // Block crossing the end of a range
        assert_eq!(
            f.interceptor.intercept(&fc16(0x302, &[1, 2, 3])).await,
            Outcome::Exception(ExceptionCode::IllegalDataAddress)
        );
        assert!(f.rx.try_recv().is_none());
        assert_eq!(f.map.get(0x302).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_coil_writes_follow_command_table() {
        let mut f = fixture(10);
        for (coil, bit) in (608u16..=615).zip(8u8..=15) {
            let on = [0x05, (coil >> 8) as u8, coil as u8, 0xFF, 0x00];
            assert_eq!(
                f.interceptor.intercept(&on).await,
                Outcome::Respond(ModbusPdu::from_slice(&on).unwrap())
            );
            let cmd = f.rx.try_recv().unwrap();
            assert_eq!(cmd.address(), STATUS);
            assert_eq!(cmd.values(), &[1u16 << bit]);

            let off = [0x05, (coil >> 8) as u8, coil as u8, 0x00, 0x00];
            f.interceptor.intercept(&off).await;
            let cmd = f.rx.try_recv().unwrap();
            assert_eq!(cmd.values(), &[!(1u16 << bit)]);
        }
    }

    #[tokio::test]
    async fn test_lowest_coil_on_is_not_read_modify_write() {
        let mut f = fixture(10);
        f.map.set(STATUS, 0x0300).unwrap();
        f.interceptor.intercept(&[0x05, 0x02, 0x60, 0xFF, 0x00]).await;
        assert_eq!(f.rx.try_recv().unwrap().values(), &[0x0100]);
    }

    #[tokio::test]
    async fn test_coil_write_marks_status_pending_and_clears_state_flag() {
        let f = fixture(10);
        f.map.set(STATUS, 0x0000).unwrap();
        assert!(f.map.coil(BASE).unwrap());

        f.interceptor.intercept(&[0x05, 0x02, 0x67, 0xFF, 0x00]).await;
        assert!(f.map.is_pending(STATUS).unwrap());
        assert!(!f.map.coil(BASE).unwrap());
    }

    #[tokio::test]
    async fn test_unmapped_coil_rejected() {
        let mut f = fixture(10);
        for coil in [600u16, 607, 616, 0, 1000] {
            let request = [0x05, (coil >> 8) as u8, coil as u8, 0xFF, 0x00];
            assert_eq!(
                f.interceptor.intercept(&request).await,
                Outcome::Exception(ExceptionCode::IllegalDataAddress)
            );
        }
        assert!(f.rx.try_recv().is_none());
        assert!(!f.map.is_pending(STATUS).unwrap());
    }

    #[tokio::test]
    async fn test_full_queue_reports_busy_without_touching_map() {
        let f = fixture(1);
        f.map.set(0x300, 11).unwrap();
        f.map.set(0x301, 22).unwrap();

        f.interceptor.intercept(&[0x06, 0x03, 0x00, 0x00, 0x01]).await;
        let outcome = f.interceptor.intercept(&[0x06, 0x03, 0x01, 0x00, 0x02]).await;
        assert_eq!(outcome, Outcome::Exception(ExceptionCode::ServerDeviceBusy));
        assert!(f.map.is_pending(0x300).unwrap());
        assert_eq!(f.map.get(0x301).unwrap(), 22);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_rejected_writes_leave_register_untouched() {
        let f = fixture(1);
        f.map.set(0x300, 11).unwrap();
        f.interceptor.intercept(&[0x06, 0x04, 0x00, 0x00, 0x01]).await;

        let first = f.interceptor.intercept(&[0x06, 0x03, 0x00, 0x00, 0x07]);
        let second = async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            f.interceptor.intercept(&[0x06, 0x03, 0x00, 0x00, 0x09]).await
        };
        let (first, second) = tokio::join!(first, second);

        assert_eq!(first, Outcome::Exception(ExceptionCode::ServerDeviceBusy));
        assert_eq!(second, Outcome::Exception(ExceptionCode::ServerDeviceBusy));
        assert_eq!(f.map.get(0x300).unwrap(), 11);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_coil_write_keeps_state_flag_lowered() {
        let mut f = fixture(1);
        f.map.set(STATUS, 0x0000).unwrap();

        let accepted = f.interceptor.intercept(&[0x05, 0x02, 0x67, 0xFF, 0x00]).await;
        assert!(matches!(accepted, Outcome::Respond(_)));
        assert!(!f.map.coil(BASE).unwrap());

        let rejected = f.interceptor.intercept(&[0x05, 0x02, 0x66, 0xFF, 0x00]).await;
        assert_eq!(rejected, Outcome::Exception(ExceptionCode::ServerDeviceBusy));

        // First status command is still in flight
        assert!(!f.map.coil(BASE).unwrap());
        assert!(f.map.is_pending(STATUS).unwrap());
        assert_eq!(f.rx.try_recv().unwrap().values(), &[0x8000]);
        assert!(f.rx.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregistered_write_rejected_before_waiting_on_queue() {
        let f = fixture(1);
        f.interceptor.intercept(&[0x06, 0x04, 0x00, 0x00, 0x01]).await;

        let started = tokio::time::Instant::now();
        let outcome = f.interceptor.intercept(&[0x06, 0x03, 0x04, 0x00, 0x01]).await;
        assert_eq!(outcome, Outcome::Exception(ExceptionCode::IllegalDataAddress));
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_short_pdu() {
        let f = fixture(10);
        assert_eq!(
            f.interceptor.intercept(&[0x06, 0x03]).await,
            Outcome::Exception(ExceptionCode::IllegalDataValue)
        );
        assert_eq!(
            f.interceptor.intercept(&[]).await,
            Outcome::Exception(ExceptionCode::IllegalDataValue)
        );
    }

    #[tokio::test]
    async fn test_restart_counter_reset() {
        let mut f = fixture(10);
        let reset = [0x06, 0x91, 0x01, 0x00, 0x00]; // 37121 <- 0

        let outcome = f.interceptor.intercept(&reset).await;
        assert_eq!(outcome, Outcome::Respond(ModbusPdu::from_slice(&reset).unwrap()));
        assert_eq!(f.store.read_restart_counter().unwrap(), 0);
        assert_eq!(f.metrics.restart_counter(), 0);
        assert_eq!(f.map.get(addr::RESTART_COUNTER).unwrap(), 0);
        assert!(f.rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_restart_counter_nonzero_write_ignored() {
        let mut f = fixture(10);
        let request = [0x06, 0x91, 0x01, 0x00, 0x05];

        let outcome = f.interceptor.intercept(&request).await;
        assert!(matches!(outcome, Outcome::Respond(_)));
        assert_eq!(f.store.read_restart_counter().unwrap(), 7);
        assert_eq!(f.map.get(addr::RESTART_COUNTER).unwrap(), 7);
        assert!(f.rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_other_metrics_addresses_read_only() {
        let f = fixture(10);
        let request = [0x06, 0x90, 0xEC, 0x00, 0x00]; // 37100
        assert_eq!(
            f.interceptor.intercept(&request).await,
            Outcome::Exception(ExceptionCode::IllegalDataAddress)
        );
        assert_eq!(
            f.interceptor.intercept(&fc16(37120, &[0, 0])).await,
            Outcome::Exception(ExceptionCode::IllegalDataAddress)
        );
    }
}
