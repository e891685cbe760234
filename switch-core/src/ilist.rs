// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Instruction-list builder
//!
//! Register and memory writes destined for the chip are not issued one MMIO
//! access at a time; they are staged as formatted instructions in DMA
//! buffers and pushed as one batch, which the hardware applies in append
//! order. This module formats instructions, grows the buffer chain, and
//! enforces the lock/unlock atomicity unit: everything between a lock and
//! the next unlock must land in a single DMA buffer, because one buffer is
//! the largest unit the hardware consumes indivisibly.
//!
//! Instruction encoding (little-endian words):
//!
//! ```text
//! header  [31:28] opcode  [27:20] pipe mask  [19:12] stage  [11:0] param
//! ```
//!
//! A register write is header + register offset + 1..3 data words (12 to 20
//! bytes); lock/unlock markers are bare headers; a memory write is header +
//! word address + a fixed-width payload of 4, 8, or 16 bytes.

use std::sync::Arc;

use log::{debug, trace};
use parking_lot::Mutex;
use static_assertions::const_assert;

use crate::dma::{BufferType, DmaBuffer, Pools};
use crate::error::{Error, Result};
use crate::regs::RegAddr;
use crate::session::{SessionId, SessionState};
use crate::Device;

/// Pipes addressable by one instruction.
pub const MAX_PIPES: usize = 8;

/// Deepest pipeline stage an instruction may target.
pub const MAX_STAGE: u8 = 31;

/// Bare-header instruction size.
pub const INSTR_HEADER_BYTES: usize = 4;

/// Largest register-write instruction: header, offset, three data words.
pub const REG_WRITE_MAX_BYTES: usize = INSTR_HEADER_BYTES + 4 + 12;

// Free space below which a lock span starts on a fresh buffer rather than
// inheriting a nearly-full one.
const LOCK_HEADROOM: usize = 64;

const_assert!(REG_WRITE_MAX_BYTES <= 20);
const_assert!(LOCK_HEADROOM >= REG_WRITE_MAX_BYTES * 2);

/// Set of target pipes for one instruction; multi-pipe sets broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeBitmap(u8);

impl PipeBitmap {
    /// Every pipe the chip has.
    pub fn all() -> Self {
        PipeBitmap(u8::MAX)
    }

    /// A single pipe.
    pub fn single(pipe: u8) -> Result<Self> {
        if (pipe as usize) >= MAX_PIPES {
            return Err(Error::InvalidArg);
        }
        Ok(PipeBitmap(1 << pipe))
    }

    pub fn from_mask(mask: u8) -> Self {
        PipeBitmap(mask)
    }

    pub fn contains(&self, pipe: u8) -> bool {
        (pipe as usize) < MAX_PIPES && self.0 & (1 << pipe) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn mask(&self) -> u8 {
        self.0
    }
}

/// Fixed entry width of a hardware memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemWidth {
    W4,
    W8,
    W16,
}

impl MemWidth {
    pub fn bytes(self) -> usize {
        match self {
            MemWidth::W4 => 4,
            MemWidth::W8 => 8,
            MemWidth::W16 => 16,
        }
    }

    fn param(self) -> u32 {
        match self {
            MemWidth::W4 => 1,
            MemWidth::W8 => 2,
            MemWidth::W16 => 3,
        }
    }
}

/// A contiguous hardware memory region for block transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRegion {
    /// Entry width
    pub width: MemWidth,
    /// Number of entries
    pub entries: u32,
    /// Address increment between entries, in words
    pub addr_step: u32,
    /// Word address of the first entry
    pub start_addr: u32,
}

impl BlockRegion {
    fn validate(&self) -> Result<()> {
        if self.entries == 0 || self.addr_step == 0 {
            return Err(Error::InvalidArg);
        }
        Ok(())
    }

    /// Total payload bytes the region covers.
    pub fn byte_len(&self) -> usize {
        self.entries as usize * self.width.bytes()
    }
}

/// Per-chunk completion for a block read: filled data, entry offset into the
/// region, entry count in this chunk, and an error flag.
pub type BlockReadFn = Box<dyn FnMut(&[u8], usize, usize, bool) + Send>;

pub(crate) type SharedReadFn = Arc<Mutex<BlockReadFn>>;

#[derive(Clone, Copy)]
enum Opcode {
    RegWrite = 0x1,
    MemWrite = 0x2,
    Lock = 0x3,
    Unlock = 0x4,
}

fn header(op: Opcode, pipes: PipeBitmap, stage: u8, param: u32) -> [u8; 4] {
    let word = ((op as u32) << 28)
        | ((pipes.mask() as u32) << 20)
        | ((stage as u32) << 12)
        | (param & 0xfff);
    word.to_le_bytes()
}

fn encode_reg_write(pipes: PipeBitmap, stage: u8, addr: RegAddr, data: &[u8]) -> Vec<u8> {
    let words = (data.len() / 4) as u32;
    let mut instr = Vec::with_capacity(INSTR_HEADER_BYTES + 4 + data.len());
    instr.extend_from_slice(&header(Opcode::RegWrite, pipes, stage, words));
    instr.extend_from_slice(&addr.to_le_bytes());
    instr.extend_from_slice(data);
    instr
}

fn encode_mem_write(pipes: PipeBitmap, stage: u8, addr: u32, width: MemWidth, data: &[u8]) -> Vec<u8> {
    let mut instr = Vec::with_capacity(INSTR_HEADER_BYTES + 4 + data.len());
    instr.extend_from_slice(&header(Opcode::MemWrite, pipes, stage, width.param()));
    instr.extend_from_slice(&addr.to_le_bytes());
    instr.extend_from_slice(data);
    instr
}

/// Walk a buffer of formatted instructions, handing each encoded register
/// write to `apply`. The behavioral model has no DMA engine; when a batch
/// "completes" there, this is how its register writes take effect.
/// Memory writes and span markers decode but apply nothing.
pub(crate) fn decode_apply(
    bytes: &[u8],
    mut apply: impl FnMut(RegAddr, u32) -> Result<()>,
) -> Result<()> {
    let word = |offset: usize| -> Result<u32> {
        let end = offset + 4;
        if end > bytes.len() {
            return Err(Error::Unexpected);
        }
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&bytes[offset..end]);
        Ok(u32::from_le_bytes(raw))
    };

    let mut offset = 0;
    while offset < bytes.len() {
        let head = word(offset)?;
        let opcode = head >> 28;
        let param = head & 0xfff;
        offset += INSTR_HEADER_BYTES;
        match opcode {
            op if op == Opcode::RegWrite as u32 => {
                let addr = word(offset)?;
                offset += 4;
                for i in 0..param {
                    apply(addr + i * 4, word(offset)?)?;
                    offset += 4;
                }
            }
            op if op == Opcode::MemWrite as u32 => {
                let width = match param {
                    1 => MemWidth::W4,
                    2 => MemWidth::W8,
                    3 => MemWidth::W16,
                    _ => return Err(Error::Unexpected),
                };
                offset += 4 + width.bytes();
            }
            op if op == Opcode::Lock as u32 || op == Opcode::Unlock as u32 => {}
            _ => return Err(Error::Unexpected),
        }
    }
    Ok(())
}

/// One element of a pending batch, in hardware application order.
pub(crate) enum BatchEntry {
    /// A buffer of formatted instructions
    IList(DmaBuffer),
    /// A caller-filled buffer written to a memory region
    WriteBlock {
        buffer: DmaBuffer,
        region: BlockRegion,
    },
    /// One chunk of a block read
    ReadBlock {
        buffer: DmaBuffer,
        region: BlockRegion,
        entry_offset: u32,
        entry_count: u32,
        callback: SharedReadFn,
    },
}

impl BatchEntry {
    pub(crate) fn buffer_mut(&mut self) -> &mut DmaBuffer {
        match self {
            BatchEntry::IList(buffer) => buffer,
            BatchEntry::WriteBlock { buffer, .. } => buffer,
            BatchEntry::ReadBlock { buffer, .. } => buffer,
        }
    }

    pub(crate) fn into_buffer(self) -> DmaBuffer {
        match self {
            BatchEntry::IList(buffer) => buffer,
            BatchEntry::WriteBlock { buffer, .. } => buffer,
            BatchEntry::ReadBlock { buffer, .. } => buffer,
        }
    }
}

struct LockSpan {
    /// Index of the entry holding the span
    entry: usize,
}

/// A session's batch under construction.
pub(crate) struct PendingBatch {
    pub batch_id: u32,
    pub entries: Vec<BatchEntry>,
    pub instr_count: usize,
    lock: Option<LockSpan>,
    /// The batch contains at least one block-read chunk
    pub has_read: bool,
}

impl PendingBatch {
    fn new(batch_id: u32) -> Self {
        Self {
            batch_id,
            entries: Vec::new(),
            instr_count: 0,
            lock: None,
            has_read: false,
        }
    }

    pub(crate) fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    /// Free every buffer back to its pool.
    pub(crate) fn release(self, pools: &Pools) {
        for entry in self.entries {
            let _ = pools.put_back(entry.into_buffer());
        }
    }
}

/// Snapshot of a session's pending batch, for speculative appends.
pub(crate) enum Checkpoint {
    /// No batch was pending at checkpoint time
    Empty,
    At {
        entries: usize,
        /// Bytes used in the final entry, when it was an instruction buffer
        last_used: Option<usize>,
        instr_count: usize,
        read_pending: bool,
    },
}

impl Device {
    /// Append one register-write instruction to the session's pending batch.
    ///
    /// `data` must be one to three little-endian words. Starts a batch if
    /// none is pending; chains a new DMA buffer when the current one is
    /// full, except inside a lock span where overflow is a hard
    /// [`Error::NoSpace`]. With `wait_ok` the append may park on buffer
    /// pool exhaustion; otherwise it fails fast with [`Error::TryAgain`]
    /// and the batch is left exactly as it was.
    pub fn ilist_add(
        &self,
        session: SessionId,
        pipes: PipeBitmap,
        stage: u8,
        addr: RegAddr,
        data: &[u8],
        wait_ok: bool,
    ) -> Result<()> {
        if pipes.is_empty() || stage > MAX_STAGE {
            return Err(Error::InvalidArg);
        }
        if data.is_empty() || data.len() % 4 != 0 || data.len() > 12 {
            return Err(Error::InvalidArg);
        }
        let instr = encode_reg_write(pipes, stage, addr, data);
        self.append_instr(session, &instr, wait_ok)
    }

    /// Append one fixed-width memory-write instruction.
    pub fn ilist_add_mem_write(
        &self,
        session: SessionId,
        pipes: PipeBitmap,
        stage: u8,
        addr: u32,
        width: MemWidth,
        data: &[u8],
        wait_ok: bool,
    ) -> Result<()> {
        if pipes.is_empty() || stage > MAX_STAGE {
            return Err(Error::InvalidArg);
        }
        if data.len() != width.bytes() {
            return Err(Error::InvalidArg);
        }
        let instr = encode_mem_write(pipes, stage, addr, width, data);
        self.append_instr(session, &instr, wait_ok)
    }

    /// Open an atomic span: subsequent appends up to [`ilist_unlock`] must
    /// fit one DMA buffer. The span starts on a fresh buffer when the
    /// current one is nearly full, so short spans do not fail spuriously.
    ///
    /// [`ilist_unlock`]: Device::ilist_unlock
    pub fn ilist_lock(&self, session: SessionId) -> Result<()> {
        let handle = self.session(session)?;
        let mut state = handle.state.lock();

        if state
            .pending
            .as_ref()
            .map(|batch| batch.is_locked())
            .unwrap_or(false)
        {
            return Err(Error::InvalidArg);
        }

        // Roll to a fresh buffer first if the current one is nearly full.
        let needs_fresh = match state.pending.as_ref().and_then(|b| b.entries.last()) {
            Some(BatchEntry::IList(buffer)) => buffer.remaining() < LOCK_HEADROOM,
            Some(_) => true,
            None => true,
        };
        if needs_fresh {
            self.chain_instr_buffer(&mut state, false)?;
        }

        let marker = header(Opcode::Lock, PipeBitmap::from_mask(0), 0, 0);
        self.append_instr_locked(&mut state, &marker, false)?;

        let batch = state.pending.as_mut().ok_or(Error::Unexpected)?;
        let entry = batch.entries.len() - 1;
        batch.lock = Some(LockSpan { entry });
        trace!("{}: lock span opened at entry {}", session, entry);
        Ok(())
    }

    /// Close the current atomic span.
    pub fn ilist_unlock(&self, session: SessionId) -> Result<()> {
        let handle = self.session(session)?;
        let mut state = handle.state.lock();

        let locked = state
            .pending
            .as_ref()
            .map(|batch| batch.is_locked())
            .unwrap_or(false);
        if !locked {
            return Err(Error::InvalidArg);
        }

        let marker = header(Opcode::Unlock, PipeBitmap::from_mask(0), 0, 0);
        self.append_instr_locked(&mut state, &marker, false)?;

        if let Some(batch) = state.pending.as_mut() {
            batch.lock = None;
        }
        trace!("{}: lock span closed", session);
        Ok(())
    }

    /// Snapshot the pending batch so later appends can be undone with
    /// [`ilist_rollback`]. Not allowed inside a lock span.
    ///
    /// [`ilist_rollback`]: Device::ilist_rollback
    pub fn ilist_checkpoint(&self, session: SessionId) -> Result<()> {
        let handle = self.session(session)?;
        let mut state = handle.state.lock();

        let checkpoint = match state.pending.as_ref() {
            None => Checkpoint::Empty,
            Some(batch) => {
                if batch.is_locked() {
                    return Err(Error::InvalidArg);
                }
                Checkpoint::At {
                    entries: batch.entries.len(),
                    last_used: match batch.entries.last() {
                        Some(BatchEntry::IList(buffer)) => Some(buffer.used()),
                        _ => None,
                    },
                    instr_count: batch.instr_count,
                    read_pending: state.read_pending,
                }
            }
        };
        state.checkpoint = Some(checkpoint);
        Ok(())
    }

    /// Discard every append made since the last checkpoint. A batch pushed
    /// in the meantime is unaffected; only speculative, un-pushed work is
    /// torn back.
    pub fn ilist_rollback(&self, session: SessionId) -> Result<()> {
        let handle = self.session(session)?;
        let mut state = handle.state.lock();

        let checkpoint = state.checkpoint.take().ok_or(Error::ObjectNotFound)?;
        match checkpoint {
            Checkpoint::Empty => {
                if let Some(batch) = state.pending.take() {
                    batch.release(&self.pools);
                }
                state.read_pending = false;
            }
            Checkpoint::At {
                entries,
                last_used,
                instr_count,
                read_pending,
            } => {
                let batch = state.pending.as_mut().ok_or(Error::Unexpected)?;
                while batch.entries.len() > entries {
                    let entry = batch.entries.pop().ok_or(Error::Unexpected)?;
                    let _ = self.pools.put_back(entry.into_buffer());
                }
                if let (Some(used), Some(BatchEntry::IList(buffer))) =
                    (last_used, batch.entries.last_mut())
                {
                    buffer.truncate(used);
                }
                batch.lock = None;
                batch.instr_count = instr_count;
                batch.has_read = read_pending;
                state.read_pending = read_pending;
            }
        }
        debug!("{}: rolled back to checkpoint", session);
        Ok(())
    }

    /// Discard the pending (never pushed) batch and free its buffers.
    pub fn ilist_abort(&self, session: SessionId) -> Result<()> {
        let handle = self.session(session)?;
        let mut state = handle.state.lock();

        let batch = state.pending.take().ok_or(Error::ObjectNotFound)?;
        let buffers = batch.entries.len();
        batch.release(&self.pools);
        state.read_pending = false;
        state.checkpoint = None;
        debug!("{}: aborted pending batch ({} buffers)", session, buffers);
        Ok(())
    }

    /// Queue a block write: `buffer` (from the write-block pool, filled by
    /// the caller) is DMAed over `region` as part of the pending batch.
    ///
    /// On failure the buffer is returned to its pool; the caller allocates
    /// a fresh one before retrying.
    pub fn add_block_write(
        &self,
        session: SessionId,
        region: BlockRegion,
        buffer: DmaBuffer,
    ) -> Result<()> {
        if let Err(err) = self.try_add_block_write(session, region, &buffer) {
            let _ = self.pools.put_back(buffer);
            return Err(err);
        }

        let handle = self.session(session)?;
        let mut state = handle.state.lock();
        let batch = Self::ensure_batch(self, &mut state)?;
        let mut buffer = buffer;
        buffer.set_batch_id(batch.batch_id);
        batch.entries.push(BatchEntry::WriteBlock { buffer, region });
        Ok(())
    }

    fn try_add_block_write(
        &self,
        session: SessionId,
        region: BlockRegion,
        buffer: &DmaBuffer,
    ) -> Result<()> {
        region.validate()?;
        if buffer.kind() != BufferType::WriteBlock {
            return Err(Error::InvalidArg);
        }
        if buffer.used() != region.byte_len() {
            return Err(Error::InvalidArg);
        }

        let handle = self.session(session)?;
        let state = handle.state.lock();
        if state.pending.as_ref().map(|b| b.is_locked()).unwrap_or(false) {
            // Block transfers cannot join an atomic span.
            return Err(Error::InvalidArg);
        }
        Ok(())
    }

    /// Queue a block read over `region`. The region is split into as many
    /// read-block buffers as it needs; `callback` fires once per chunk at
    /// completion with (data, entry offset, entry count, error flag). One
    /// block read may be outstanding per session.
    pub fn add_block_read(
        &self,
        session: SessionId,
        region: BlockRegion,
        callback: BlockReadFn,
        wait_ok: bool,
    ) -> Result<()> {
        region.validate()?;

        let handle = self.session(session)?;
        let mut state = handle.state.lock();
        if state.read_pending {
            return Err(Error::TryAgain);
        }
        if state.pending.as_ref().map(|b| b.is_locked()).unwrap_or(false) {
            return Err(Error::InvalidArg);
        }

        let pool = self.pools.get(BufferType::ReadBlock);
        let entries_per_buffer = (pool.buffer_size() / region.width.bytes()) as u32;
        if entries_per_buffer == 0 {
            return Err(Error::InvalidArg);
        }

        // Reserve every chunk up front so a half-built read never lands in
        // the batch.
        let mut chunks = Vec::new();
        let mut offset = 0u32;
        while offset < region.entries {
            let count = entries_per_buffer.min(region.entries - offset);
            match pool.alloc((count as usize) * region.width.bytes(), wait_ok) {
                Ok(buffer) => chunks.push((buffer, offset, count)),
                Err(err) => {
                    for (buffer, _, _) in chunks {
                        let _ = self.pools.put_back(buffer);
                    }
                    return Err(err);
                }
            }
            offset += count;
        }

        let shared: SharedReadFn = Arc::new(Mutex::new(callback));
        let batch = Self::ensure_batch(self, &mut state)?;
        for (mut buffer, entry_offset, entry_count) in chunks {
            buffer.set_batch_id(batch.batch_id);
            batch.entries.push(BatchEntry::ReadBlock {
                buffer,
                region,
                entry_offset,
                entry_count,
                callback: Arc::clone(&shared),
            });
        }
        batch.has_read = true;
        state.read_pending = true;
        trace!(
            "{}: block read of {} entries in {} chunks",
            session,
            region.entries,
            (region.entries + entries_per_buffer - 1) / entries_per_buffer
        );
        Ok(())
    }

    fn append_instr(&self, session: SessionId, instr: &[u8], wait_ok: bool) -> Result<()> {
        let handle = self.session(session)?;
        let mut state = handle.state.lock();
        self.append_instr_locked(&mut state, instr, wait_ok)
    }

    fn append_instr_locked(
        &self,
        state: &mut SessionState,
        instr: &[u8],
        wait_ok: bool,
    ) -> Result<()> {
        // Inside a lock span the span's buffer is the only legal target.
        if let Some(batch) = state.pending.as_mut() {
            if let Some(span) = &batch.lock {
                let entry = span.entry;
                let buffer = match batch.entries.get_mut(entry) {
                    Some(BatchEntry::IList(buffer)) => buffer,
                    _ => return Err(Error::Unexpected),
                };
                if instr.len() > buffer.remaining() {
                    return Err(Error::NoSpace);
                }
                buffer.append(instr)?;
                batch.instr_count += 1;
                self.stats.record_append(instr.len());
                return Ok(());
            }
        }

        let fits = match state.pending.as_ref().and_then(|b| b.entries.last()) {
            Some(BatchEntry::IList(buffer)) => instr.len() <= buffer.remaining(),
            _ => false,
        };
        if !fits {
            self.chain_instr_buffer(state, wait_ok)?;
        }

        let batch = state.pending.as_mut().ok_or(Error::Unexpected)?;
        match batch.entries.last_mut() {
            Some(BatchEntry::IList(buffer)) => {
                buffer.append(instr)?;
                batch.instr_count += 1;
                self.stats.record_append(instr.len());
                Ok(())
            }
            _ => Err(Error::Unexpected),
        }
    }

    /// Allocate and append a fresh instruction buffer, starting the batch
    /// itself if nothing is pending yet. On allocation failure the pending
    /// state is left untouched.
    fn chain_instr_buffer(&self, state: &mut SessionState, wait_ok: bool) -> Result<()> {
        let buffer = self.pools.get(BufferType::IList).alloc(0, wait_ok)?;

        let batch = Self::ensure_batch(self, state)?;
        let mut buffer = buffer;
        buffer.set_batch_id(batch.batch_id);
        batch.entries.push(BatchEntry::IList(buffer));
        Ok(())
    }

    fn ensure_batch<'a>(&self, state: &'a mut SessionState) -> Result<&'a mut PendingBatch> {
        if state.pending.is_none() {
            let batch_id = self.next_batch_id();
            trace!("starting batch {}", batch_id);
            state.pending = Some(PendingBatch::new(batch_id));
        }
        state.pending.as_mut().ok_or(Error::Unexpected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DriverConfig, PoolConfig};
    use crate::regs::{DeviceId, MockRegs};

    fn small_device(ilist_count: usize, ilist_size: usize) -> Device {
        let mut config = DriverConfig::default();
        config.ilist_pool = PoolConfig {
            count: ilist_count,
            size: ilist_size,
        };
        config.read_block_pool = PoolConfig { count: 4, size: 64 };
        config.write_block_pool = PoolConfig { count: 4, size: 64 };
        Device::new(DeviceId(0), Arc::new(MockRegs::new()), config).unwrap()
    }

    fn add_one(dev: &Device, session: SessionId) -> Result<()> {
        dev.ilist_add(
            session,
            PipeBitmap::all(),
            0,
            0x100,
            &0u32.to_le_bytes(),
            false,
        )
    }

    #[test]
    fn rejects_malformed_appends() {
        let dev = small_device(2, 256);
        let session = dev.open_session().unwrap();

        let pipes = PipeBitmap::all();
        // Empty pipe set, empty data, ragged data, oversized data.
        assert_eq!(
            dev.ilist_add(session, PipeBitmap::from_mask(0), 0, 0, &[0; 4], false),
            Err(Error::InvalidArg)
        );
        assert_eq!(
            dev.ilist_add(session, pipes, 0, 0, &[], false),
            Err(Error::InvalidArg)
        );
        assert_eq!(
            dev.ilist_add(session, pipes, 0, 0, &[0; 6], false),
            Err(Error::InvalidArg)
        );
        assert_eq!(
            dev.ilist_add(session, pipes, 0, 0, &[0; 16], false),
            Err(Error::InvalidArg)
        );
        assert_eq!(
            dev.ilist_add(session, pipes, MAX_STAGE + 1, 0, &[0; 4], false),
            Err(Error::InvalidArg)
        );
        // Nothing was started.
        assert_eq!(dev.ilist_abort(session), Err(Error::ObjectNotFound));
    }

    #[test]
    fn chains_buffers_when_full() {
        // 32-byte buffers hold two 12-byte register writes plus slack.
        let dev = small_device(4, 32);
        let session = dev.open_session().unwrap();

        for _ in 0..6 {
            add_one(&dev, session).unwrap();
        }
        // 6 instructions * 12 bytes = 72 bytes over 32-byte buffers.
        assert_eq!(dev.pools().get(BufferType::IList).outstanding(), 3);

        dev.ilist_abort(session).unwrap();
        assert_eq!(dev.pools().get(BufferType::IList).outstanding(), 0);
    }

    #[test]
    fn pool_exhaustion_is_try_again() {
        let dev = small_device(1, 32);
        let session = dev.open_session().unwrap();

        for _ in 0..2 {
            add_one(&dev, session).unwrap();
        }
        // Third instruction needs a second buffer; the pool has one.
        assert_eq!(add_one(&dev, session), Err(Error::TryAgain));
        // The batch still pushes fine afterwards.
        dev.ilist_abort(session).unwrap();
    }

    #[test]
    fn lock_span_overflow_is_no_space() {
        let dev = small_device(4, 64);
        let session = dev.open_session().unwrap();

        dev.ilist_lock(session).unwrap();
        // The marker takes 4 bytes, each register write 12: five fill the
        // 64-byte buffer exactly, a sixth cannot chain inside the span.
        for _ in 0..5 {
            add_one(&dev, session).unwrap();
        }
        let before = dev.pools().get(BufferType::IList).outstanding();
        assert_eq!(add_one(&dev, session), Err(Error::NoSpace));
        // The failed append left the chain alone.
        assert_eq!(dev.pools().get(BufferType::IList).outstanding(), before);
        // Even the unlock marker no longer fits; the span must be rebuilt.
        assert_eq!(dev.ilist_unlock(session), Err(Error::NoSpace));

        dev.ilist_abort(session).unwrap();
    }

    #[test]
    fn nested_lock_and_stray_unlock_rejected() {
        let dev = small_device(4, 256);
        let session = dev.open_session().unwrap();

        assert_eq!(dev.ilist_unlock(session), Err(Error::InvalidArg));
        dev.ilist_lock(session).unwrap();
        assert_eq!(dev.ilist_lock(session), Err(Error::InvalidArg));
        dev.ilist_unlock(session).unwrap();
        dev.ilist_abort(session).unwrap();
    }

    #[test]
    fn checkpoint_rollback_discards_speculation() {
        let dev = small_device(4, 32);
        let session = dev.open_session().unwrap();

        add_one(&dev, session).unwrap();
        dev.ilist_checkpoint(session).unwrap();

        for _ in 0..4 {
            add_one(&dev, session).unwrap();
        }
        assert!(dev.pools().get(BufferType::IList).outstanding() > 1);

        dev.ilist_rollback(session).unwrap();
        assert_eq!(dev.pools().get(BufferType::IList).outstanding(), 1);

        // Rollback to an empty checkpoint drops the batch entirely.
        dev.ilist_checkpoint(session).unwrap();
        dev.ilist_abort(session).unwrap();
        dev.ilist_checkpoint(session).unwrap();
        add_one(&dev, session).unwrap();
        dev.ilist_rollback(session).unwrap();
        assert_eq!(dev.pools().get(BufferType::IList).outstanding(), 0);
        assert_eq!(dev.ilist_abort(session), Err(Error::ObjectNotFound));
    }

    #[test]
    fn block_read_chunks_region() {
        let dev = small_device(2, 256);
        let session = dev.open_session().unwrap();

        // 64-byte read buffers, 8-byte entries: 8 entries per chunk.
        let region = BlockRegion {
            width: MemWidth::W8,
            entries: 20,
            addr_step: 2,
            start_addr: 0x4000,
        };
        dev.add_block_read(session, region, Box::new(|_, _, _, _| {}), false)
            .unwrap();
        assert_eq!(dev.pools().get(BufferType::ReadBlock).outstanding(), 3);

        // Only one block read may be outstanding.
        assert_eq!(
            dev.add_block_read(session, region, Box::new(|_, _, _, _| {}), false),
            Err(Error::TryAgain)
        );

        dev.ilist_abort(session).unwrap();
        assert_eq!(dev.pools().get(BufferType::ReadBlock).outstanding(), 0);
    }

    #[test]
    fn block_write_validates_fill() {
        let dev = small_device(2, 256);
        let session = dev.open_session().unwrap();

        let region = BlockRegion {
            width: MemWidth::W4,
            entries: 8,
            addr_step: 1,
            start_addr: 0x2000,
        };

        let mut buffer = dev
            .alloc_buffer(session, BufferType::WriteBlock, region.byte_len(), false)
            .unwrap();
        // Caller forgot to mark the fill.
        let err = dev.add_block_write(session, region, buffer).unwrap_err();
        assert_eq!(err, Error::InvalidArg);

        buffer = dev
            .alloc_buffer(session, BufferType::WriteBlock, region.byte_len(), false)
            .unwrap();
        buffer.as_mut_slice()[..region.byte_len()].fill(0xab);
        buffer.set_used(region.byte_len()).unwrap();
        dev.add_block_write(session, region, buffer).unwrap();

        dev.ilist_abort(session).unwrap();
    }
}
