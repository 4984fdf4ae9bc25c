//! Restart counter persistence

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU16, Ordering};

use tracing::{debug, info};

use crate::error::{GwError, Result};

/// Storage for the restart counter shown in the metrics block
pub trait RestartCounterStore: Send + Sync {
    fn read_restart_counter(&self) -> Result<u16>;
    fn write_restart_counter(&self, value: u16) -> Result<()>;
}

/// Counter kept as decimal text in a file; a missing file reads as 0
#[derive(Debug, Clone)]
pub struct FileRestartCounter {
    path: PathBuf,
}

impl FileRestartCounter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl RestartCounterStore for FileRestartCounter {
    fn read_restart_counter(&self) -> Result<u16> {
        match fs::read_to_string(&self.path) {
            Ok(text) => text.trim().parse::<u16>().map_err(|e| {
                GwError::Persistence(format!(
                    "invalid restart counter in {}: {}",
                    self.path.display(),
                    e
                ))
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn write_restart_counter(&self, value: u16) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        // Write-then-rename so a crash never leaves a truncated file
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, value.to_string())?;
        fs::rename(&tmp, &self.path)?;
        debug!("Restart counter {} written to {}", value, self.path.display());
        Ok(())
    }
}

/// In-process store for tests and deployments without persistent storage
#[derive(Debug, Default)]
pub struct MemoryRestartCounter {
    value: AtomicU16,
}

impl MemoryRestartCounter {
    pub fn new(value: u16) -> Self {
        Self {
            value: AtomicU16::new(value),
        }
    }
}

impl RestartCounterStore for MemoryRestartCounter {
    fn read_restart_counter(&self) -> Result<u16> {
        Ok(self.value.load(Ordering::Relaxed))
    }

    fn write_restart_counter(&self, value: u16) -> Result<()> {
        self.value.store(value, Ordering::Relaxed);
        Ok(())
    }
}

/// Count this start: read, increment (wrapping) and store the counter
pub fn record_restart(store: &dyn RestartCounterStore) -> Result<u16> {
    let count = store.read_restart_counter()?.wrapping_add(1);
    store.write_restart_counter(count)?;
    info!("Restart counter: {}", count);
    Ok(count)
}
