//! Write commands handed from the request context to the serial forwarder

use std::fmt;

use crate::error::{GwError, Result};

/// Registers carried by a single write command
pub const MAX_WRITE_VALUES: usize = 15;

/// Register write destined for the serial device
///
/// Values live in a fixed-capacity array; construction fails instead of
/// truncating when more than [`MAX_WRITE_VALUES`] are supplied.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct WriteCommand {
    address: u16,
    len: u8,
    values: [u16; MAX_WRITE_VALUES],
}

impl WriteCommand {
    pub fn new(address: u16, values: &[u16]) -> Result<Self> {
        if values.is_empty() || values.len() > MAX_WRITE_VALUES {
            return Err(GwError::Capacity {
                requested: values.len(),
                capacity: MAX_WRITE_VALUES,
            });
        }
        if u32::from(address) + values.len() as u32 > 0x1_0000 {
            return Err(GwError::Addressing { address });
        }

        let mut buf = [0u16; MAX_WRITE_VALUES];
        buf[..values.len()].copy_from_slice(values);
        Ok(Self {
            address,
            len: values.len() as u8,
            values: buf,
        })
    }

    #[cfg(test)]
    pub(crate) fn single(address: u16, value: u16) -> Self {
        let mut values = [0u16; MAX_WRITE_VALUES];
        values[0] = value;
        Self {
            address,
            len: 1,
            values,
        }
    }

    pub fn address(&self) -> u16 {
        self.address
    }

    pub fn len(&self) -> usize {
        usize::from(self.len)
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn values(&self) -> &[u16] {
        &self.values[..self.len()]
    }
}

impl fmt::Debug for WriteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteCommand")
            .field("address", &self.address)
            .field("values", &self.values())
            .finish()
    }
}
