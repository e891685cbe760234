// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Hardware command pipeline for multi-pipe packet-processing ASICs
//!
//! This crate is the batching layer every reconfiguration of the chip goes
//! through:
//!
//! - Sessions: client contexts, each owning one batch under construction
//! - DMA buffer pools: typed, per-device, with backpressure
//! - Instruction lists: formatted register/memory writes over buffer chains
//! - Descriptor ring: atomic batch dispatch and completion callbacks
//! - Notification channels: learn and idle-time digests delivered to
//!   registered handlers
//! - Statistics: lock-free counters over the whole pipeline
//!
//! The only way down to silicon is the [`RegisterIo`] trait, so the whole
//! pipeline runs unmodified against an in-memory register file.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::info;
use parking_lot::{Mutex, MutexGuard};

pub mod config;
pub mod dma;
pub mod error;
pub mod ilist;
pub mod notify;
pub mod regs;
pub mod ring;
pub mod session;
pub mod stats;

pub use config::{DriverConfig, PoolConfig};
pub use dma::{BufferType, DmaBuffer, PoolStats, Pools};
pub use error::{Error, Result};
pub use ilist::{
    BlockReadFn, BlockRegion, MemWidth, PipeBitmap, MAX_PIPES, MAX_STAGE,
};
pub use notify::{NotifyFn, NotifyKind};
pub use regs::{DeviceId, FailingRegs, MockRegs, RegAddr, RegisterIo, SubdevId};
pub use ring::{CompletionFn, RingStats};
pub use session::{SessionId, MAX_SESSIONS};
pub use stats::{DeviceStats, StatsReport};

use crate::notify::Notifier;
use crate::ring::DescRing;
use crate::session::{Session, SessionTable};

/// Write-through cache of write-only configuration registers (channel
/// enables, parser/deparser metadata options). Owned by the device so
/// lifecycle code read-modify-writes from explicit state instead of
/// module-level globals; registers never written read as zero.
#[derive(Debug, Default)]
pub struct RegShadows {
    values: std::collections::HashMap<RegAddr, u32>,
}

impl RegShadows {
    /// Last value staged for `addr`.
    pub fn get(&self, addr: RegAddr) -> u32 {
        self.values.get(&addr).copied().unwrap_or(0)
    }

    /// Record the value staged for `addr`.
    pub fn set(&mut self, addr: RegAddr, value: u32) {
        self.values.insert(addr, value);
    }

    /// Apply `f` to the cached value, store and return the result.
    pub fn modify(&mut self, addr: RegAddr, f: impl FnOnce(u32) -> u32) -> u32 {
        let value = f(self.get(addr));
        self.set(addr, value);
        value
    }
}

/// One ASIC instance: pools, sessions, and the descriptor ring.
pub struct Device {
    id: DeviceId,
    subdev: SubdevId,
    pub(crate) regs: Arc<dyn RegisterIo>,
    config: DriverConfig,
    pub(crate) pools: Pools,
    pub(crate) sessions: SessionTable,
    pub(crate) ring: DescRing,
    pub(crate) notifier: Notifier,
    pub(crate) stats: DeviceStats,
    shadows: Mutex<RegShadows>,
    next_batch: AtomicU32,
}

impl Device {
    /// Bring a device up: build its pools, program the descriptor ring.
    pub fn new(id: DeviceId, regs: Arc<dyn RegisterIo>, config: DriverConfig) -> Result<Self> {
        if config.ring_depth == 0 {
            return Err(Error::InvalidArg);
        }

        let subdev = SubdevId::PRIMARY;
        let device = Self {
            id,
            subdev,
            pools: Pools::new(id, subdev, &config),
            sessions: SessionTable::new(),
            ring: DescRing::new(config.ring_depth),
            notifier: Notifier::new(),
            stats: DeviceStats::new(),
            shadows: Mutex::new(RegShadows::default()),
            next_batch: AtomicU32::new(1),
            regs,
            config,
        };
        device.init_ring()?;
        info!(
            "dev {} up: ring depth {}, behavioral model {}",
            id.0, device.config.ring_depth, device.config.behavioral_model
        );
        Ok(device)
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// The die this context addresses by default.
    pub fn subdevice(&self) -> SubdevId {
        self.subdev
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Open a session; the handle stays valid until closed.
    pub fn open_session(&self) -> Result<SessionId> {
        self.sessions.open()
    }

    /// Close a session. Fails with [`Error::TryAgain`] while one of its
    /// batches is still in flight; a never-pushed pending batch is aborted.
    pub fn close_session(&self, session: SessionId) -> Result<()> {
        self.sessions.close(session, &self.pools)
    }

    pub(crate) fn session(&self, session: SessionId) -> Result<Arc<Session>> {
        self.sessions.get(session)
    }

    /// Check a buffer out of the typed pool on behalf of `session`, for
    /// block transfers. The session must be open; the buffer is the
    /// caller's to fill and hand back through [`Device::add_block_write`]
    /// or [`Device::free_buffer`].
    pub fn alloc_buffer(
        &self,
        session: SessionId,
        kind: BufferType,
        size: usize,
        wait_ok: bool,
    ) -> Result<DmaBuffer> {
        self.session(session)?;
        self.pools.get(kind).alloc(size, wait_ok)
    }

    /// Return an unused buffer to its pool.
    pub fn free_buffer(&self, buffer: DmaBuffer) -> Result<()> {
        self.pools.put_back(buffer)
    }

    /// The device's buffer pools, for stats and diagnostics.
    pub fn pools(&self) -> &Pools {
        &self.pools
    }

    /// Pipeline counters for this device.
    pub fn stats(&self) -> &DeviceStats {
        &self.stats
    }

    /// Direct register read on the primary die, bypassing the batch path;
    /// drain polling uses this.
    pub fn read_register(&self, addr: RegAddr) -> Result<u32> {
        self.regs.read(self.id, addr)
    }

    /// Direct register write on the primary die, bypassing the batch path.
    pub fn write_register(&self, addr: RegAddr, value: u32) -> Result<()> {
        self.regs.write(self.id, addr, value)
    }

    /// Direct register read on a specific die.
    pub fn read_register_sub(&self, subdev: SubdevId, addr: RegAddr) -> Result<u32> {
        self.regs.read_sub(self.id, subdev, addr)
    }

    /// Direct register write on a specific die.
    pub fn write_register_sub(&self, subdev: SubdevId, addr: RegAddr, value: u32) -> Result<()> {
        self.regs.write_sub(self.id, subdev, addr, value)
    }

    /// The device's cached write-only register shadows.
    pub fn shadows(&self) -> MutexGuard<'_, RegShadows> {
        self.shadows.lock()
    }

    pub(crate) fn next_batch_id(&self) -> u32 {
        self.next_batch.fetch_add(1, Ordering::Relaxed)
    }

    /// Orderly teardown: abandon in-flight batches (their callbacks fire
    /// with the error flag), abort pending batches, cancel blocked
    /// allocations, and stop the DMA engine.
    pub fn shutdown(&self) {
        info!("dev {} shutting down", self.id.0);
        self.drain_ring();
        self.drain_notifications();
        self.sessions.release_all(&self.pools);
        self.pools.teardown();
        let _ = self.regs.write(self.id, ring::map::RING_CTRL, 0);
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        // Buffers held by in-flight batches, pending batches, or posted
        // notification buffers must make it home before the pools assert
        // on leaks.
        self.drain_ring();
        self.drain_notifications();
        self.sessions.release_all(&self.pools);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_slots_recycle() {
        let dev = Device::new(
            DeviceId(0),
            Arc::new(MockRegs::new()),
            DriverConfig::default(),
        )
        .unwrap();

        let first = dev.open_session().unwrap();
        let second = dev.open_session().unwrap();
        assert_ne!(first.0, second.0);

        dev.close_session(first).unwrap();
        let third = dev.open_session().unwrap();
        assert_eq!(third.0, first.0);

        assert_eq!(dev.close_session(first), Ok(()));
        assert_eq!(dev.close_session(first), Err(Error::ObjectNotFound));
    }

    #[test]
    fn session_table_fills_up() {
        let dev = Device::new(
            DeviceId(0),
            Arc::new(MockRegs::new()),
            DriverConfig::default(),
        )
        .unwrap();

        let sessions: Vec<_> = (0..MAX_SESSIONS).map(|_| dev.open_session().unwrap()).collect();
        assert_eq!(dev.open_session(), Err(Error::NoSysResources));
        for session in sessions {
            dev.close_session(session).unwrap();
        }
    }

    #[test]
    fn zero_ring_depth_rejected() {
        let mut config = DriverConfig::default();
        config.ring_depth = 0;
        assert!(Device::new(DeviceId(0), Arc::new(MockRegs::new()), config).is_err());
    }
}
