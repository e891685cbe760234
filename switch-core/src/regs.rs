// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Register-level I/O boundary
//!
//! Everything below the command pipeline (PCIe BAR access, the SerDes
//! management interface, the behavioral model) is reached through the
//! [`RegisterIo`] trait. The driver core never touches memory-mapped
//! hardware directly, which keeps the pipeline testable against an
//! in-memory register file.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// 32-bit register offset within a device's address space
pub type RegAddr = u32;

/// Physical device identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(pub u16);

/// Subdevice identifier, for chip generations built from multiple dies
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubdevId(pub u8);

impl SubdevId {
    /// The primary die; single-die generations only ever use this one.
    pub const PRIMARY: SubdevId = SubdevId(0);
}

/// Synchronous register access supplied by the platform layer.
///
/// Implementations must be callable from multiple threads; the command
/// pipeline issues direct reads from drain-polling callers while the
/// ring-service thread reads completion pointers.
pub trait RegisterIo: Send + Sync {
    /// Read one register on the primary die.
    fn read(&self, dev: DeviceId, addr: RegAddr) -> Result<u32>;

    /// Write one register on the primary die.
    fn write(&self, dev: DeviceId, addr: RegAddr, value: u32) -> Result<()>;

    /// Read one register on a specific die.
    fn read_sub(&self, dev: DeviceId, subdev: SubdevId, addr: RegAddr) -> Result<u32> {
        let _ = subdev;
        self.read(dev, addr)
    }

    /// Write one register on a specific die.
    fn write_sub(&self, dev: DeviceId, subdev: SubdevId, addr: RegAddr, value: u32) -> Result<()> {
        let _ = subdev;
        self.write(dev, addr, value)
    }
}

/// In-memory register file.
///
/// Stands in for the chip when running unit tests or against the behavioral
/// model: reads return the last written value (or a scripted sequence),
/// writes are recorded in order. Unwritten registers read as zero.
#[derive(Default)]
pub struct MockRegs {
    store: Mutex<HashMap<(DeviceId, SubdevId, RegAddr), u32>>,
    scripted: Mutex<HashMap<(DeviceId, SubdevId, RegAddr), Vec<u32>>>,
    writes: Mutex<Vec<(SubdevId, RegAddr, u32)>>,
}

impl MockRegs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a sequence of values to be returned by successive reads of
    /// `addr`, ahead of whatever was last written. Used to script drain
    /// counters that tick down over time.
    pub fn script_reads(&self, dev: DeviceId, addr: RegAddr, values: &[u32]) {
        let mut scripted = self.scripted.lock();
        // Reads pop from the back.
        let seq = scripted.entry((dev, SubdevId::PRIMARY, addr)).or_default();
        seq.extend(values.iter().rev());
    }

    /// Last value written to `addr`, if any.
    pub fn get(&self, dev: DeviceId, addr: RegAddr) -> Option<u32> {
        self.store.lock().get(&(dev, SubdevId::PRIMARY, addr)).copied()
    }

    /// Last value written to `addr` on a specific die, if any.
    pub fn get_sub(&self, dev: DeviceId, subdev: SubdevId, addr: RegAddr) -> Option<u32> {
        self.store.lock().get(&(dev, subdev, addr)).copied()
    }

    /// Every write observed so far, in issue order.
    pub fn write_log(&self) -> Vec<(SubdevId, RegAddr, u32)> {
        self.writes.lock().clone()
    }

    /// Writes to one register, in issue order.
    pub fn writes_to(&self, addr: RegAddr) -> Vec<u32> {
        self.writes
            .lock()
            .iter()
            .filter(|(_, a, _)| *a == addr)
            .map(|(_, _, v)| *v)
            .collect()
    }

    /// Forget the write history (the register contents survive).
    pub fn clear_write_log(&self) {
        self.writes.lock().clear();
    }
}

impl RegisterIo for MockRegs {
    fn read(&self, dev: DeviceId, addr: RegAddr) -> Result<u32> {
        self.read_sub(dev, SubdevId::PRIMARY, addr)
    }

    fn write(&self, dev: DeviceId, addr: RegAddr, value: u32) -> Result<()> {
        self.write_sub(dev, SubdevId::PRIMARY, addr, value)
    }

    fn read_sub(&self, dev: DeviceId, subdev: SubdevId, addr: RegAddr) -> Result<u32> {
        if let Some(seq) = self.scripted.lock().get_mut(&(dev, subdev, addr)) {
            if let Some(value) = seq.pop() {
                return Ok(value);
            }
        }
        Ok(self
            .store
            .lock()
            .get(&(dev, subdev, addr))
            .copied()
            .unwrap_or(0))
    }

    fn write_sub(&self, dev: DeviceId, subdev: SubdevId, addr: RegAddr, value: u32) -> Result<()> {
        self.store.lock().insert((dev, subdev, addr), value);
        self.writes.lock().push((subdev, addr, value));
        Ok(())
    }
}

/// Register I/O that fails every access; used to exercise error paths.
pub struct FailingRegs;

impl RegisterIo for FailingRegs {
    fn read(&self, _dev: DeviceId, _addr: RegAddr) -> Result<u32> {
        Err(Error::CommFail)
    }

    fn write(&self, _dev: DeviceId, _addr: RegAddr, _value: u32) -> Result<()> {
        Err(Error::CommFail)
    }
}
