//! Gateway service configuration
//!
//! Loaded through `common::load_layered`: built-in defaults, then
//! `config/gwsrv.yaml`, then `GWSRV_*` environment variables
//! (`GWSRV_QUEUE__CAPACITY=20`).

use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::core::materializer::STATUS_COIL_COUNT;
use crate::core::metrics::METRICS_BLOCK;
use crate::core::register_map::RegisterRange;
use crate::error::{GwError, Result};

/// Default configuration file path
pub const DEFAULT_CONFIG_PATH: &str = "config/gwsrv.yaml";
/// Environment variable prefix
pub const ENV_PREFIX: &str = "GWSRV_";

/// Gateway service configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub serial: SerialConfig,
    pub peer: PeerConfig,
    pub registers: RegisterConfig,
    pub queue: QueueConfig,
    pub telemetry: TelemetryConfig,
    pub poller: PollerConfig,
    pub metrics: MetricsConfig,
}

/// Client-facing Modbus TCP server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    None,
    Even,
    Odd,
}

impl From<Parity> for tokio_serial::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataBits {
    Seven,
    Eight,
}

impl From<DataBits> for tokio_serial::DataBits {
    fn from(bits: DataBits) -> Self {
        match bits {
            DataBits::Seven => tokio_serial::DataBits::Seven,
            DataBits::Eight => tokio_serial::DataBits::Eight,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopBits {
    One,
    Two,
}

impl From<StopBits> for tokio_serial::StopBits {
    fn from(bits: StopBits) -> Self {
        match bits {
            StopBits::One => tokio_serial::StopBits::One,
            StopBits::Two => tokio_serial::StopBits::Two,
        }
    }
}

/// Serial link to the device (RTU master side)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialConfig {
    #[serde(default = "default_serial_port")]
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: DataBits,
    #[serde(default = "default_parity")]
    pub parity: Parity,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: StopBits,
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    /// Per-transaction response timeout
    #[serde(default = "default_serial_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: default_serial_port(),
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            parity: default_parity(),
            stop_bits: default_stop_bits(),
            unit_id: default_unit_id(),
            timeout_ms: default_serial_timeout_ms(),
        }
    }
}

/// Downstream telemetry peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_peer_address")]
    pub address: SocketAddr,
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: default_peer_address(),
            unit_id: default_unit_id(),
        }
    }
}

/// Mirrored register space
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterConfig {
    #[serde(default = "default_ranges")]
    pub ranges: Vec<RegisterRange>,
    #[serde(default = "default_status_register")]
    pub status_register: u16,
    #[serde(default = "default_coil_base")]
    pub coil_base: u16,
    #[serde(default = "default_pending_sentinel")]
    pub pending_sentinel: u16,
    /// Raise coil `coil_base` on every materialization
    #[serde(default = "default_true")]
    pub state_flag_enabled: bool,
}

impl Default for RegisterConfig {
    fn default() -> Self {
        Self {
            ranges: default_ranges(),
            status_register: default_status_register(),
            coil_base: default_coil_base(),
            pending_sentinel: default_pending_sentinel(),
            state_flag_enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
    /// How long a write waits for queue space before failing with busy
    #[serde(default = "default_enqueue_timeout_ms")]
    pub enqueue_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
            enqueue_timeout_ms: default_enqueue_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_block_start")]
    pub block_start: u16,
    #[serde(default = "default_block_len")]
    pub block_len: u16,
    /// Register whose write triggers a push
    #[serde(default = "default_trigger_register")]
    pub trigger_register: u16,
    #[serde(default = "default_budget_ms")]
    pub budget_ms: u64,
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            block_start: default_block_start(),
            block_len: default_block_len(),
            trigger_register: default_trigger_register(),
            budget_ms: default_budget_ms(),
            retry_interval_ms: default_retry_interval_ms(),
        }
    }
}

impl TelemetryConfig {
    pub fn block(&self) -> RegisterRange {
        RegisterRange::new(self.block_start, self.block_len)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_poll_interval_ms")]
    pub interval_ms: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_poll_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_restart_counter_path")]
    pub restart_counter_path: PathBuf,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            restart_counter_path: default_restart_counter_path(),
        }
    }
}

impl GatewayConfig {
    /// Check cross-field constraints the type system cannot express
    pub fn validate(&self) -> Result<()> {
        let ranges = &self.registers.ranges;
        if ranges.is_empty() {
            return Err(GwError::config("registers.ranges must not be empty"));
        }
        for (i, range) in ranges.iter().enumerate() {
            if range.length == 0 {
                return Err(GwError::config(format!("register range {} is empty", range)));
            }
            if range.end() > 0x1_0000 {
                return Err(GwError::config(format!(
                    "register range {} exceeds the 16-bit address space",
                    range
                )));
            }
            if range.overlaps(&METRICS_BLOCK) {
                return Err(GwError::config(format!(
                    "register range {} overlaps the metrics block {}",
                    range, METRICS_BLOCK
                )));
            }
            if let Some(other) = ranges[i + 1..].iter().find(|o| o.overlaps(range)) {
                return Err(GwError::config(format!(
                    "register ranges {} and {} overlap",
                    range, other
                )));
            }
        }

        let registered = |address: u16| ranges.iter().any(|r| r.contains(address));
        if !registered(self.registers.status_register) {
            return Err(GwError::config(format!(
                "status register {} is not in any range",
                self.registers.status_register
            )));
        }
        if u32::from(self.registers.coil_base) + u32::from(STATUS_COIL_COUNT) > 0x1_0000 {
            return Err(GwError::config("registers.coil_base leaves no room for 16 coils"));
        }

        let block = self.telemetry.block();
        if block.length == 0 || !block.addresses().all(registered) {
            return Err(GwError::config(format!(
                "telemetry block {} is not fully registered",
                block
            )));
        }
        if !registered(self.telemetry.trigger_register) {
            return Err(GwError::config(format!(
                "telemetry trigger {} is not registered",
                self.telemetry.trigger_register
            )));
        }
        if self.telemetry.budget_ms == 0 {
            return Err(GwError::config("telemetry.budget_ms must be greater than 0"));
        }

        if self.queue.capacity == 0 {
            return Err(GwError::config("queue.capacity must be at least 1"));
        }
        if self.server.max_connections == 0 {
            return Err(GwError::config("server.max_connections must be at least 1"));
        }
        if self.poller.enabled && self.poller.interval_ms == 0 {
            return Err(GwError::config("poller.interval_ms must be greater than 0"));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_bind_address() -> String {
    "0.0.0.0:502".to_string()
}

fn default_max_connections() -> usize {
    8
}

fn default_serial_port() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> DataBits {
    DataBits::Eight
}

fn default_parity() -> Parity {
    Parity::None
}

fn default_stop_bits() -> StopBits {
    StopBits::One
}

fn default_unit_id() -> u8 {
    1
}

fn default_serial_timeout_ms() -> u64 {
    1000
}

fn default_peer_address() -> SocketAddr {
    SocketAddr::from(([192, 168, 1, 100], 502))
}

/// Device register table: (start, length)
fn default_ranges() -> Vec<RegisterRange> {
    [
        (256, 30),
        (512, 22),
        (768, 4),
        (1024, 16),
        (1283, 6),
        (4096, 5),
        (4352, 2),
        (4864, 18),
        (4899, 1),
        (5125, 8),
    ]
    .into_iter()
    .map(|(start, length)| RegisterRange::new(start, length))
    .collect()
}

fn default_status_register() -> u16 {
    0x1306
}

fn default_coil_base() -> u16 {
    600
}

fn default_pending_sentinel() -> u16 {
    0xFFFF
}

fn default_queue_capacity() -> usize {
    10
}

fn default_enqueue_timeout_ms() -> u64 {
    500
}

fn default_block_start() -> u16 {
    768
}

fn default_block_len() -> u16 {
    4
}

fn default_trigger_register() -> u16 {
    771
}

fn default_budget_ms() -> u64 {
    100
}

fn default_retry_interval_ms() -> u64 {
    10
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_restart_counter_path() -> PathBuf {
    PathBuf::from("data/restart_counter")
}
