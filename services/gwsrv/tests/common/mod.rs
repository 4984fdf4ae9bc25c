//! Test Common Utilities
//!
//! Scripted field bus and telemetry peer plus a raw MBAP client for driving a
//! running gateway over loopback TCP.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use gwsrv::core::register_map::RegisterMap;
use gwsrv::persistence::MemoryRestartCounter;
use gwsrv::serial::{FieldBus, FieldBusError, FieldBusErrorKind};
use gwsrv::telemetry::{TelemetryError, TelemetryPeer};
use gwsrv::{Gateway, GatewayConfig};

pub type Writes = Arc<Mutex<Vec<(u16, Vec<u16>)>>>;

/// Field bus double. Writes can be held back by closing the gate.
#[derive(Clone)]
pub struct MockFieldBus {
    pub writes: Writes,
    gate: Arc<Semaphore>,
    fail: Arc<AtomicBool>,
}

impl MockFieldBus {
    pub fn new() -> Self {
        Self {
            writes: Arc::default(),
            gate: Arc::new(Semaphore::new(Semaphore::MAX_PERMITS)),
            fail: Arc::default(),
        }
    }

    /// Bus whose writes block until [`MockFieldBus::release`]
    pub fn gated() -> Self {
        Self {
            gate: Arc::new(Semaphore::new(0)),
            ..Self::new()
        }
    }

    pub fn release(&self, writes: usize) {
        self.gate.add_permits(writes);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn recorded(&self) -> Vec<(u16, Vec<u16>)> {
        self.writes.lock().clone()
    }
}

#[async_trait]
impl FieldBus for MockFieldBus {
    async fn write(&mut self, address: u16, values: &[u16]) -> Result<(), FieldBusError> {
        if let Ok(permit) = self.gate.acquire().await {
            permit.forget();
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(FieldBusError::new(FieldBusErrorKind::Timeout, "no response"));
        }
        self.writes.lock().push((address, values.to_vec()));
        Ok(())
    }

    async fn read_holding_registers(
        &mut self,
        _address: u16,
        count: u16,
    ) -> Result<Vec<u16>, FieldBusError> {
        Ok(vec![0; usize::from(count)])
    }
}

/// Telemetry peer that is always connected and records every push
#[derive(Clone, Default)]
pub struct MockPeer {
    pub pushes: Writes,
}

#[async_trait]
impl TelemetryPeer for MockPeer {
    fn is_connected(&mut self) -> bool {
        true
    }

    fn connect(&mut self) {}

    async fn push(&mut self, start: u16, values: &[u16]) -> Result<(), TelemetryError> {
        self.pushes.lock().push((start, values.to_vec()));
        Ok(())
    }
}

/// Running gateway on a loopback port
pub struct TestGateway {
    pub addr: SocketAddr,
    pub map: Arc<RegisterMap>,
    pub bus: MockFieldBus,
    pub peer: MockPeer,
    pub store: Arc<MemoryRestartCounter>,
    token: CancellationToken,
    task: JoinHandle<gwsrv::Result<()>>,
}

impl TestGateway {
    pub async fn start(bus: MockFieldBus, restarts: u16) -> Self {
        let mut config = GatewayConfig::default();
        config.poller.enabled = false;

        let peer = MockPeer::default();
        let store = Arc::new(MemoryRestartCounter::new(restarts));
        let gateway = Gateway::build(config, bus.clone(), Some(peer.clone()), store.clone())
            .expect("gateway should build from defaults");
        let map = gateway.map().clone();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let token = CancellationToken::new();
        let task = tokio::spawn(gateway.run(listener, token.clone()));

        Self {
            addr,
            map,
            bus,
            peer,
            store,
            token,
            task,
        }
    }

    pub async fn connect(&self) -> ModbusTestClient {
        ModbusTestClient {
            stream: TcpStream::connect(self.addr).await.unwrap(),
            transaction_id: 0,
        }
    }

    pub async fn shutdown(self) {
        self.token.cancel();
        self.task.await.unwrap().unwrap();
    }
}

/// Minimal Modbus TCP client speaking raw MBAP frames
pub struct ModbusTestClient {
    stream: TcpStream,
    transaction_id: u16,
}

impl ModbusTestClient {
    /// Send one PDU and return the response PDU
    pub async fn request(&mut self, pdu: &[u8]) -> Vec<u8> {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        let mut frame = Vec::with_capacity(7 + pdu.len());
        frame.extend_from_slice(&self.transaction_id.to_be_bytes());
        frame.extend_from_slice(&[0, 0]);
        frame.extend_from_slice(&(pdu.len() as u16 + 1).to_be_bytes());
        frame.push(1);
        frame.extend_from_slice(pdu);
        self.stream.write_all(&frame).await.unwrap();

        let mut header = [0u8; 7];
        self.stream.read_exact(&mut header).await.unwrap();
        assert_eq!(
            u16::from_be_bytes([header[0], header[1]]),
            self.transaction_id,
            "transaction id echoed"
        );
        assert_eq!(header[6], 1, "unit id echoed");
        let length = usize::from(u16::from_be_bytes([header[4], header[5]]));
        let mut response = vec![0u8; length - 1];
        self.stream.read_exact(&mut response).await.unwrap();
        response
    }

    pub async fn read_holding(&mut self, address: u16, count: u16) -> Vec<u16> {
        let mut pdu = vec![0x03];
        pdu.extend_from_slice(&address.to_be_bytes());
        pdu.extend_from_slice(&count.to_be_bytes());
        let response = self.request(&pdu).await;
        assert_eq!(response[0], 0x03, "unexpected response {:02X?}", response);
        response[2..]
            .chunks(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect()
    }

    pub async fn write_single(&mut self, address: u16, value: u16) -> Vec<u8> {
        let mut pdu = vec![0x06];
        pdu.extend_from_slice(&address.to_be_bytes());
        pdu.extend_from_slice(&value.to_be_bytes());
        self.request(&pdu).await
    }

    pub async fn write_multiple(&mut self, address: u16, values: &[u16]) -> Vec<u8> {
        let mut pdu = vec![0x10];
        pdu.extend_from_slice(&address.to_be_bytes());
        pdu.extend_from_slice(&(values.len() as u16).to_be_bytes());
        pdu.push((values.len() * 2) as u8);
        for value in values {
            pdu.extend_from_slice(&value.to_be_bytes());
        }
        self.request(&pdu).await
    }

    pub async fn write_coil(&mut self, address: u16, on: bool) -> Vec<u8> {
        let mut pdu = vec![0x05];
        pdu.extend_from_slice(&address.to_be_bytes());
        pdu.extend_from_slice(if on { &[0xFF, 0x00] } else { &[0x00, 0x00] });
        self.request(&pdu).await
    }
}

/// Poll `condition` until it holds or two seconds pass
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
