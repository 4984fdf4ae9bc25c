//! Modbus PDU buffer and response builder
//!
//! Responses live in a fixed 253-byte stack array; nothing is allocated per
//! request.

use std::fmt;

use tracing::trace;

use super::constants::{EXCEPTION_FLAG, MAX_PDU_SIZE};
use crate::error::{GwError, Result};

/// Modbus exception codes returned by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ExceptionCode {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
    ServerDeviceBusy = 0x06,
}

impl ExceptionCode {
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExceptionCode::IllegalFunction => "Illegal Function",
            ExceptionCode::IllegalDataAddress => "Illegal Data Address",
            ExceptionCode::IllegalDataValue => "Illegal Data Value",
            ExceptionCode::ServerDeviceFailure => "Server Device Failure",
            ExceptionCode::ServerDeviceBusy => "Server Device Busy",
        };
        write!(f, "{} (0x{:02X})", name, self.code())
    }
}

/// Function code plus data, at most [`MAX_PDU_SIZE`] bytes
#[derive(Clone)]
pub struct ModbusPdu {
    buf: [u8; MAX_PDU_SIZE],
    len: usize,
}

impl ModbusPdu {
    fn empty() -> Self {
        Self {
            buf: [0; MAX_PDU_SIZE],
            len: 0,
        }
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_PDU_SIZE {
            return Err(GwError::protocol(format!(
                "PDU too large: {} bytes (max {})",
                bytes.len(),
                MAX_PDU_SIZE
            )));
        }
        let mut pdu = Self::empty();
        pdu.buf[..bytes.len()].copy_from_slice(bytes);
        pdu.len = bytes.len();
        Ok(pdu)
    }

    /// Exception response: function code with the high bit set, then the code
    pub fn exception(function_code: u8, code: ExceptionCode) -> Self {
        let mut pdu = Self::empty();
        pdu.buf[0] = function_code | EXCEPTION_FLAG;
        pdu.buf[1] = code.code();
        pdu.len = 2;
        pdu
    }

    fn push(&mut self, byte: u8) -> Result<()> {
        let slot = self
            .buf
            .get_mut(self.len)
            .ok_or_else(|| GwError::protocol("PDU buffer full"))?;
        *slot = byte;
        self.len += 1;
        Ok(())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn function_code(&self) -> Option<u8> {
        self.as_slice().first().copied()
    }
}

impl PartialEq for ModbusPdu {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for ModbusPdu {}

impl fmt::Debug for ModbusPdu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModbusPdu({:02X?})", self.as_slice())
    }
}

/// Big-endian u16 at `offset`
pub fn read_u16(data: &[u8], offset: usize) -> Option<u16> {
    data.get(offset..offset + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
}

/// Builds read responses byte by byte
pub struct PduBuilder {
    pdu: ModbusPdu,
}

impl Default for PduBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PduBuilder {
    pub fn new() -> Self {
        Self {
            pdu: ModbusPdu::empty(),
        }
    }

    pub fn function_code(self, fc: u8) -> Result<Self> {
        self.byte(fc)
    }

    pub fn byte(mut self, b: u8) -> Result<Self> {
        self.pdu.push(b)?;
        Ok(self)
    }

    /// Register values, big-endian
    pub fn registers(mut self, values: &[u16]) -> Result<Self> {
        for byte in values.iter().flat_map(|v| v.to_be_bytes()) {
            self.pdu.push(byte)?;
        }
        Ok(self)
    }

    /// Coil states packed LSB first
    pub fn coils(mut self, states: &[bool]) -> Result<Self> {
        for chunk in states.chunks(8) {
            let byte = chunk
                .iter()
                .enumerate()
                .fold(0u8, |acc, (bit, on)| if *on { acc | (1 << bit) } else { acc });
            self.pdu.push(byte)?;
        }
        Ok(self)
    }

    pub fn build(self) -> ModbusPdu {
        trace!(pdu = ?self.pdu, "Response built");
        self.pdu
    }
}
