// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! DMA buffer pools
//!
//! Every operation type that the hardware DMAs (instruction lists, learn
//! notifications, idle-time notifications, block reads/writes) draws
//! fixed-size buffers from its own pool. Pools are the only state shared
//! between sessions, so they carry their own locking: allocation either
//! fails fast with [`Error::TryAgain`] or parks the caller on a condvar
//! until another session or the completion path frees a buffer.
//!
//! Buffers live in an arena indexed by a free stack. A buffer is either on
//! the free stack or checked out to exactly one owner; the arena slot is
//! physically emptied while checked out, so the two states cannot alias.

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::config::DriverConfig;
use crate::error::{Error, Result};
use crate::regs::{DeviceId, SubdevId};

/// Operation type a pool serves; each type is sized independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferType {
    /// Instruction-list batches
    IList,
    /// Learn-filter notifications
    Learn,
    /// Idle-time notifications
    IdleTime,
    /// Block reads from hardware memory
    ReadBlock,
    /// Block writes to hardware memory
    WriteBlock,
}

impl BufferType {
    pub const ALL: [BufferType; 5] = [
        BufferType::IList,
        BufferType::Learn,
        BufferType::IdleTime,
        BufferType::ReadBlock,
        BufferType::WriteBlock,
    ];

    fn phys_base(self) -> u64 {
        // Synthetic, stable physical window per pool; the descriptor ring
        // encodes these addresses and completions map them back.
        0x1000_0000 + ((self as u64) << 28)
    }
}

/// One DMA-capable buffer, checked out of a [`BufferPool`].
pub struct DmaBuffer {
    kind: BufferType,
    index: usize,
    dev: DeviceId,
    subdev: SubdevId,
    data: Box<[u8]>,
    used: usize,
    phys: u64,
    pushed: bool,
    batch_id: u32,
}

impl DmaBuffer {
    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes appended so far.
    pub fn used(&self) -> usize {
        self.used
    }

    /// Capacity still available.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.used
    }

    /// Physical address for descriptor encoding.
    pub fn phys_addr(&self) -> u64 {
        self.phys
    }

    pub fn kind(&self) -> BufferType {
        self.kind
    }

    pub fn device(&self) -> DeviceId {
        self.dev
    }

    pub fn subdevice(&self) -> SubdevId {
        self.subdev
    }

    /// Whether this buffer has been handed to the descriptor ring.
    pub fn is_pushed(&self) -> bool {
        self.pushed
    }

    pub(crate) fn set_pushed(&mut self, pushed: bool) {
        self.pushed = pushed;
    }

    /// Batch this buffer belongs to, once part of a pending list.
    pub fn batch_id(&self) -> u32 {
        self.batch_id
    }

    pub(crate) fn set_batch_id(&mut self, id: u32) {
        self.batch_id = id;
    }

    /// Append raw bytes; fails with [`Error::NoSpace`] when the buffer
    /// cannot hold them.
    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.remaining() {
            return Err(Error::NoSpace);
        }
        self.data[self.used..self.used + bytes.len()].copy_from_slice(bytes);
        self.used += bytes.len();
        debug_assert!(self.used <= self.capacity());
        Ok(())
    }

    /// Truncate back to `len` bytes; used by checkpoint rollback.
    pub(crate) fn truncate(&mut self, len: usize) {
        debug_assert!(len <= self.used);
        self.used = len;
    }

    /// Filled portion of the buffer.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.used]
    }

    /// Whole backing storage, for callers filling a block-write buffer.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Mark `len` bytes of the backing storage as filled by the caller.
    pub fn set_used(&mut self, len: usize) -> Result<()> {
        if len > self.capacity() {
            return Err(Error::InvalidArg);
        }
        self.used = len;
        Ok(())
    }
}

/// Allocation counters for one pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub allocs: u64,
    pub frees: u64,
    /// Non-blocking allocations that found the pool dry
    pub exhaustions: u64,
    /// Most buffers ever checked out at once
    pub high_water: usize,
}

struct PoolState {
    /// `None` while the buffer at that index is checked out
    slots: Vec<Option<DmaBuffer>>,
    free: Vec<usize>,
    outstanding: usize,
    teardown: bool,
    stats: PoolStats,
}

/// Fixed-size pool of DMA buffers for one operation type.
pub struct BufferPool {
    kind: BufferType,
    buf_size: usize,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl BufferPool {
    pub fn new(dev: DeviceId, subdev: SubdevId, kind: BufferType, count: usize, size: usize) -> Self {
        let slots = (0..count)
            .map(|index| {
                Some(DmaBuffer {
                    kind,
                    index,
                    dev,
                    subdev,
                    data: vec![0u8; size].into_boxed_slice(),
                    used: 0,
                    phys: kind.phys_base() + (index * size) as u64,
                    pushed: false,
                    batch_id: 0,
                })
            })
            .collect();
        // Lowest indices allocate first.
        let free = (0..count).rev().collect();

        debug!(
            "pool {:?} on dev {}: {} buffers of {} bytes",
            kind, dev.0, count, size
        );

        Self {
            kind,
            buf_size: size,
            state: Mutex::new(PoolState {
                slots,
                free,
                outstanding: 0,
                teardown: false,
                stats: PoolStats::default(),
            }),
            available: Condvar::new(),
        }
    }

    pub fn kind(&self) -> BufferType {
        self.kind
    }

    /// Configured capacity of each buffer in this pool.
    pub fn buffer_size(&self) -> usize {
        self.buf_size
    }

    /// Check a buffer out of the pool.
    ///
    /// `size` is the number of bytes the caller intends to stage and may not
    /// exceed the pool's configured buffer size. With `wait_ok` the caller
    /// parks until a buffer frees up or the pool tears down; without it a
    /// dry pool returns [`Error::TryAgain`].
    pub fn alloc(&self, size: usize, wait_ok: bool) -> Result<DmaBuffer> {
        if size > self.buf_size {
            return Err(Error::InvalidArg);
        }

        let mut state = self.state.lock();
        loop {
            if state.teardown {
                return Err(Error::NotReady);
            }
            if let Some(index) = state.free.pop() {
                let buffer = state.slots[index].take().ok_or(Error::Unexpected)?;
                state.outstanding += 1;
                state.stats.allocs += 1;
                state.stats.high_water = state.stats.high_water.max(state.outstanding);
                debug_assert!(!buffer.pushed && buffer.used == 0);
                return Ok(buffer);
            }
            if !wait_ok {
                state.stats.exhaustions += 1;
                return Err(Error::TryAgain);
            }
            self.available.wait(&mut state);
        }
    }

    /// Return a buffer to the pool and wake one waiter.
    pub fn free(&self, mut buffer: DmaBuffer) -> Result<()> {
        if buffer.kind != self.kind {
            return Err(Error::InvalidArg);
        }
        buffer.used = 0;
        buffer.pushed = false;
        buffer.batch_id = 0;

        let mut state = self.state.lock();
        let index = buffer.index;
        if index >= state.slots.len() || state.slots[index].is_some() {
            // Double free or a buffer from a stale pool.
            warn!("pool {:?}: rejecting free of buffer {}", self.kind, index);
            return Err(Error::Unexpected);
        }
        state.slots[index] = Some(buffer);
        state.free.push(index);
        state.outstanding -= 1;
        state.stats.frees += 1;
        drop(state);

        self.available.notify_one();
        Ok(())
    }

    /// Wake all blocked allocators with [`Error::NotReady`]; called on
    /// device or session teardown so nobody parks forever.
    pub fn teardown(&self) {
        self.state.lock().teardown = true;
        self.available.notify_all();
    }

    /// Buffers currently checked out.
    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding
    }

    /// Buffers currently on the free stack.
    pub fn free_count(&self) -> usize {
        self.state.lock().free.len()
    }

    pub fn stats(&self) -> PoolStats {
        self.state.lock().stats
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.outstanding != 0 {
            // A session closed without freeing everything it allocated.
            warn!(
                "pool {:?} dropped with {} buffers outstanding",
                self.kind, state.outstanding
            );
            debug_assert_eq!(state.outstanding, 0, "leaked {:?} buffers", self.kind);
        }
    }
}

/// The per-device pool set, one pool per operation type.
pub struct Pools {
    ilist: BufferPool,
    learn: BufferPool,
    idle: BufferPool,
    read_block: BufferPool,
    write_block: BufferPool,
}

impl Pools {
    pub fn new(dev: DeviceId, subdev: SubdevId, config: &DriverConfig) -> Self {
        let make = |kind: BufferType| {
            let sizing = config.pool(kind);
            BufferPool::new(dev, subdev, kind, sizing.count, sizing.size)
        };
        Self {
            ilist: make(BufferType::IList),
            learn: make(BufferType::Learn),
            idle: make(BufferType::IdleTime),
            read_block: make(BufferType::ReadBlock),
            write_block: make(BufferType::WriteBlock),
        }
    }

    pub fn get(&self, kind: BufferType) -> &BufferPool {
        match kind {
            BufferType::IList => &self.ilist,
            BufferType::Learn => &self.learn,
            BufferType::IdleTime => &self.idle,
            BufferType::ReadBlock => &self.read_block,
            BufferType::WriteBlock => &self.write_block,
        }
    }

    /// Return a checked-out buffer to the pool it came from.
    pub fn put_back(&self, buffer: DmaBuffer) -> Result<()> {
        self.get(buffer.kind()).free(buffer)
    }

    pub fn teardown(&self) {
        for kind in BufferType::ALL {
            self.get(kind).teardown();
        }
    }
}
