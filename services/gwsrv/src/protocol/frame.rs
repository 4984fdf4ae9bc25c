//! Modbus TCP (MBAP) framing
//!
//! ```text
//! | transaction id (2) | protocol id (2) | length (2) | unit id (1) | PDU (length - 1) |
//! ```

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, warn};

use super::constants::{MAX_MBAP_LENGTH, MBAP_HEADER_LEN, MIN_MBAP_LENGTH};
use super::pdu::ModbusPdu;
use crate::error::{GwError, Result};

/// One MBAP frame, request or response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MbapFrame {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub unit_id: u8,
    pub pdu: ModbusPdu,
}

impl MbapFrame {
    /// Response frame echoing the request header
    pub fn reply(&self, pdu: ModbusPdu) -> Self {
        Self {
            transaction_id: self.transaction_id,
            protocol_id: self.protocol_id,
            unit_id: self.unit_id,
            pdu,
        }
    }
}

/// Stateless codec for [`MbapFrame`]
#[derive(Debug, Default, Clone, Copy)]
pub struct MbapCodec;

impl Decoder for MbapCodec {
    type Item = MbapFrame;
    type Error = GwError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<MbapFrame>> {
        if src.len() < MBAP_HEADER_LEN {
            return Ok(None);
        }

        let protocol_id = u16::from_be_bytes([src[2], src[3]]);
        let length = u16::from_be_bytes([src[4], src[5]]) as usize;

        if protocol_id != 0 {
            warn!("Rejecting MBAP frame with protocol id {}", protocol_id);
            return Err(GwError::protocol(format!(
                "unsupported protocol id {}",
                protocol_id
            )));
        }
        if !(MIN_MBAP_LENGTH..=MAX_MBAP_LENGTH).contains(&length) {
            warn!("Rejecting MBAP frame with length {}", length);
            return Err(GwError::protocol(format!(
                "invalid MBAP length {} (allowed {}..={})",
                length, MIN_MBAP_LENGTH, MAX_MBAP_LENGTH
            )));
        }

        let total = MBAP_HEADER_LEN + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let transaction_id = src.get_u16();
        let protocol_id = src.get_u16();
        let _length = src.get_u16();
        let unit_id = src.get_u8();
        let body = src.split_to(length - 1);
        let pdu = ModbusPdu::from_slice(&body)?;

        debug!(
            "MBAP frame decoded: tid={}, unit={}, pdu_len={}",
            transaction_id,
            unit_id,
            pdu.len()
        );

        Ok(Some(MbapFrame {
            transaction_id,
            protocol_id,
            unit_id,
            pdu,
        }))
    }
}

impl Encoder<MbapFrame> for MbapCodec {
    type Error = GwError;

    fn encode(&mut self, frame: MbapFrame, dst: &mut BytesMut) -> Result<()> {
        let pdu = frame.pdu.as_slice();
        dst.reserve(MBAP_HEADER_LEN + 1 + pdu.len());
        dst.put_u16(frame.transaction_id);
        dst.put_u16(frame.protocol_id);
        dst.put_u16((pdu.len() + 1) as u16);
        dst.put_u8(frame.unit_id);
        dst.put_slice(pdu);
        Ok(())
    }
}
