//! Status register bit-field view
//!
//! Bits 8..=15 of the status register are exposed as coils `coil_base + 8..=15`.
//! Coil `coil_base` is the "state known" flag, raised on every materialization
//! and lowered by the interceptor when a status command goes in flight.
//!
//! The coil-write direction uses a fixed command table rather than a
//! read-modify-write of the live register: switching bit `b` on sends `1 << b`,
//! switching it off sends `!(1 << b)` (for bit 15: 0x8000 / 0x7FFF).

use tracing::trace;

use super::register_map::{HookContext, RegisterHook};

/// First status bit mirrored as a coil
pub const FIRST_STATUS_BIT: u8 = 8;
/// Last status bit mirrored as a coil
pub const LAST_STATUS_BIT: u8 = 15;
/// Coils reserved per status register: state flag, 7 reserved, bits 8..15
pub const STATUS_COIL_COUNT: u16 = 16;

/// Bit position commanded by a coil write, `None` outside the eight mapped coils
pub fn coil_bit(coil_base: u16, coil_address: u16) -> Option<u8> {
    let offset = coil_address.checked_sub(coil_base)?;
    let bit = u8::try_from(offset).ok()?;
    (FIRST_STATUS_BIT..=LAST_STATUS_BIT)
        .contains(&bit)
        .then_some(bit)
}

/// Command value written to the status register for a coil write
pub fn command_value(bit: u8, on: bool) -> u16 {
    let mask = 1u16 << bit;
    if on {
        mask
    } else {
        !mask
    }
}

/// Hook attached to the status register
#[derive(Debug, Clone, Copy)]
pub struct StatusMaterializer {
    coil_base: u16,
    state_flag: bool,
}

impl StatusMaterializer {
    pub fn new(coil_base: u16, state_flag: bool) -> Self {
        Self {
            coil_base,
            state_flag,
        }
    }

    pub fn materialize(&self, ctx: &mut HookContext<'_>, value: u16) {
        for bit in FIRST_STATUS_BIT..=LAST_STATUS_BIT {
            ctx.set_coil(self.coil_base + u16::from(bit), value & (1 << bit) != 0);
        }
        if self.state_flag {
            ctx.set_coil(self.coil_base, true);
        }
    }
}

impl RegisterHook for StatusMaterializer {
    fn on_set(&self, ctx: &mut HookContext<'_>, address: u16, value: u16) -> u16 {
        trace!(address, value, "Materializing status coils");
        self.materialize(ctx, value);
        value
    }
}
