//! Modbus framing constants and gateway function codes
//!
//! Frame limits follow the Modbus application protocol:
//! - Maximum PDU size: 253 bytes (RS485 ADU of 256 minus address and CRC)
//! - Read limits are derived so a response PDU fits in 253 bytes

// ============================================================================
// Frame Size Constants
// ============================================================================

/// MBAP header length before the unit id
/// Format: Transaction ID(2) + Protocol ID(2) + Length(2)
pub const MBAP_HEADER_LEN: usize = 6;

/// Maximum PDU (Protocol Data Unit) size
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum MBAP length field value (Unit ID + PDU)
pub const MAX_MBAP_LENGTH: usize = 1 + MAX_PDU_SIZE;

/// Minimum MBAP length field value (Unit ID + function code)
pub const MIN_MBAP_LENGTH: usize = 2;

// ============================================================================
// Function Codes
// ============================================================================

pub const FC_READ_COILS: u8 = 0x01;
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;
pub const FC_WRITE_SINGLE_COIL: u8 = 0x05;
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

/// Bit set on the function code of an exception response
pub const EXCEPTION_FLAG: u8 = 0x80;

// ============================================================================
// Operation Limits
// ============================================================================

/// Maximum number of registers for FC03
///
/// Response PDU: FC(1) + byte count(1) + N × 2 ≤ 253 → N ≤ 125
pub const MODBUS_MAX_READ_REGISTERS: usize = 125;

/// Maximum number of coils for FC01
///
/// Response PDU: FC(1) + byte count(1) + ceil(N / 8) ≤ 253, rounded to 2000
pub const MODBUS_MAX_READ_COILS: usize = 2000;

/// Calculate total Modbus TCP frame size (MBAP header + unit id + PDU)
#[inline]
pub const fn mbap_frame_size(pdu_len: usize) -> usize {
    MBAP_HEADER_LEN + 1 + pdu_len
}
