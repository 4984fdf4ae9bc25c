//! Local mirror of the device register space
//!
//! Every address served to clients is registered once at startup (zero
//! initialised). Reads and writes of anything else are addressing errors.
//!
//! Hooks are attached per address and run synchronously inside [`RegisterMap::set`]
//! while the map lock is held. A hook sees the freshly stored value, may update
//! coils through its [`HookContext`], and returns the value that is finally
//! stored. Hooks cannot reach `set` on the map they are attached to.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{GwError, Result};

/// A contiguous block of registers `start..start + length`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRange {
    pub start: u16,
    pub length: u16,
}

impl RegisterRange {
    pub const fn new(start: u16, length: u16) -> Self {
        Self { start, length }
    }

    /// One past the last address, as u32 so `0xFFFF + 1` is representable
    pub fn end(&self) -> u32 {
        u32::from(self.start) + u32::from(self.length)
    }

    pub fn contains(&self, address: u16) -> bool {
        address >= self.start && u32::from(address) < self.end()
    }

    pub fn overlaps(&self, other: &RegisterRange) -> bool {
        u32::from(self.start) < other.end() && u32::from(other.start) < self.end()
    }

    pub fn addresses(&self) -> impl Iterator<Item = u16> {
        let start = self.start;
        (0..self.length).map(move |offset| start.wrapping_add(offset))
    }
}

impl fmt::Display for RegisterRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.start, self.length)
    }
}

/// Observer invoked synchronously when a register is set
pub trait RegisterHook: Send + Sync {
    /// Runs with the map lock held; must stay short and never block.
    /// Returns the value to store at `address`.
    fn on_set(&self, ctx: &mut HookContext<'_>, address: u16, value: u16) -> u16;
}

/// What a hook may touch while the map is locked
pub struct HookContext<'a> {
    registers: &'a BTreeMap<u16, u16>,
    coils: &'a mut BTreeMap<u16, bool>,
}

impl HookContext<'_> {
    pub fn register(&self, address: u16) -> Option<u16> {
        self.registers.get(&address).copied()
    }

    /// Read `count` registers starting at `start`; `None` if any is unregistered
    pub fn registers(&self, start: u16, count: u16) -> Option<Vec<u16>> {
        RegisterRange::new(start, count)
            .addresses()
            .map(|a| self.register(a))
            .collect()
    }

    pub fn coil(&self, address: u16) -> Option<bool> {
        self.coils.get(&address).copied()
    }

    /// Returns `false` when the coil is not registered
    pub fn set_coil(&mut self, address: u16, state: bool) -> bool {
        match self.coils.get_mut(&address) {
            Some(cell) => {
                *cell = state;
                true
            },
            None => false,
        }
    }
}

#[derive(Default)]
struct MapState {
    registers: BTreeMap<u16, u16>,
    coils: BTreeMap<u16, bool>,
}

impl MapState {
    fn check_range(&self, start: u16, count: usize) -> Result<()> {
        if u32::from(start) + count as u32 > 0x1_0000 {
            return Err(GwError::Addressing { address: start });
        }
        for offset in 0..count {
            let address = start + offset as u16;
            if !self.registers.contains_key(&address) {
                return Err(GwError::Addressing { address });
            }
        }
        Ok(())
    }
}

/// Builder for [`RegisterMap`]; hooks are fixed once the map is built
pub struct RegisterMapBuilder {
    state: MapState,
    hooks: HashMap<u16, Vec<Arc<dyn RegisterHook>>>,
    sentinel: u16,
}

impl RegisterMapBuilder {
    /// Register every address of `range` with value zero
    pub fn range(mut self, range: RegisterRange) -> Result<Self> {
        if range.end() > 0x1_0000 {
            return Err(GwError::config(format!(
                "register range {} exceeds the 16-bit address space",
                range
            )));
        }
        for address in range.addresses() {
            self.state.registers.insert(address, 0);
        }
        Ok(self)
    }

    pub fn ranges<'a>(self, ranges: impl IntoIterator<Item = &'a RegisterRange>) -> Result<Self> {
        ranges.into_iter().try_fold(self, |b, r| b.range(*r))
    }

    /// Register `count` coils starting at `base`, all false
    pub fn coils(mut self, base: u16, count: u16) -> Self {
        for address in RegisterRange::new(base, count).addresses() {
            self.state.coils.insert(address, false);
        }
        self
    }

    /// Attach a hook; hooks on the same address run in attachment order
    pub fn hook(mut self, address: u16, hook: Arc<dyn RegisterHook>) -> Result<Self> {
        if !self.state.registers.contains_key(&address) {
            return Err(GwError::config(format!(
                "hook attached to unregistered register {}",
                address
            )));
        }
        self.hooks.entry(address).or_default().push(hook);
        Ok(self)
    }

    pub fn build(self) -> RegisterMap {
        debug!(
            "Register map built: {} registers, {} coils, {} hooked addresses",
            self.state.registers.len(),
            self.state.coils.len(),
            self.hooks.len()
        );
        RegisterMap {
            state: Mutex::new(self.state),
            hooks: self.hooks,
            sentinel: self.sentinel,
        }
    }
}

/// Thread-safe register and coil mirror
pub struct RegisterMap {
    state: Mutex<MapState>,
    hooks: HashMap<u16, Vec<Arc<dyn RegisterHook>>>,
    sentinel: u16,
}

impl RegisterMap {
    pub fn builder(pending_sentinel: u16) -> RegisterMapBuilder {
        RegisterMapBuilder {
            state: MapState::default(),
            hooks: HashMap::new(),
            sentinel: pending_sentinel,
        }
    }

    /// Value marking a register as awaiting confirmation from the device
    pub fn pending_sentinel(&self) -> u16 {
        self.sentinel
    }

    pub fn contains(&self, address: u16) -> bool {
        self.state.lock().registers.contains_key(&address)
    }

    /// Fails with the first unregistered address of the block
    pub fn check_range(&self, start: u16, count: usize) -> Result<()> {
        self.state.lock().check_range(start, count)
    }

    pub fn len(&self) -> usize {
        self.state.lock().registers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, address: u16) -> Result<u16> {
        self.state
            .lock()
            .registers
            .get(&address)
            .copied()
            .ok_or(GwError::Addressing { address })
    }

    /// Read a contiguous block; fails without partial results
    pub fn get_range(&self, start: u16, count: usize) -> Result<Vec<u16>> {
        let state = self.state.lock();
        state.check_range(start, count)?;
        Ok((0..count as u16)
            .map(|offset| state.registers[&(start + offset)])
            .collect())
    }

    pub fn is_pending(&self, address: u16) -> Result<bool> {
        Ok(self.get(address)? == self.sentinel)
    }

    /// Store a value and run the hooks attached to `address`.
    /// Returns the value finally stored.
    pub fn set(&self, address: u16, value: u16) -> Result<u16> {
        let mut state = self.state.lock();
        state.check_range(address, 1)?;
        Ok(self.store(&mut state, address, value))
    }

    /// Store a contiguous block. Every address is validated before anything
    /// is written.
    pub fn set_range(&self, start: u16, values: &[u16]) -> Result<()> {
        let mut state = self.state.lock();
        state.check_range(start, values.len())?;
        for (offset, value) in values.iter().enumerate() {
            self.store(&mut state, start + offset as u16, *value);
        }
        Ok(())
    }

    /// Mark `count` registers as pending, returning their previous values
    pub fn mark_pending(&self, start: u16, count: usize) -> Result<Vec<u16>> {
        let mut state = self.state.lock();
        state.check_range(start, count)?;
        let previous = (0..count as u16)
            .map(|offset| {
                let address = start + offset;
                let old = state.registers[&address];
                self.store(&mut state, address, self.sentinel);
                old
            })
            .collect();
        Ok(previous)
    }

    fn store(&self, state: &mut MapState, address: u16, value: u16) -> u16 {
        state.registers.insert(address, value);
        let Some(hooks) = self.hooks.get(&address) else {
            return value;
        };

        let MapState { registers, coils } = state;
        let mut stored = value;
        for hook in hooks {
            let mut ctx = HookContext {
                registers: &*registers,
                coils: &mut *coils,
            };
            stored = hook.on_set(&mut ctx, address, stored);
            registers.insert(address, stored);
        }
        stored
    }

    pub fn coil(&self, address: u16) -> Result<bool> {
        self.state
            .lock()
            .coils
            .get(&address)
            .copied()
            .ok_or(GwError::CoilAddressing { address })
    }

    pub fn coils(&self, start: u16, count: usize) -> Result<Vec<bool>> {
        let state = self.state.lock();
        (0..count)
            .map(|offset| {
                let address = start.checked_add(offset as u16).ok_or(GwError::CoilAddressing {
                    address: start,
                })?;
                state
                    .coils
                    .get(&address)
                    .copied()
                    .ok_or(GwError::CoilAddressing { address })
            })
            .collect()
    }

    pub fn set_coil(&self, address: u16, state: bool) -> Result<()> {
        match self.state.lock().coils.get_mut(&address) {
            Some(cell) => {
                *cell = state;
                Ok(())
            },
            None => Err(GwError::CoilAddressing { address }),
        }
    }
}

impl fmt::Debug for RegisterMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RegisterMap")
            .field("registers", &state.registers.len())
            .field("coils", &state.coils.len())
            .field("hooked", &self.hooks.len())
            .field("sentinel", &self.sentinel)
            .finish()
    }
}
