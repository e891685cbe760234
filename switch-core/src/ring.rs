// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Descriptor ring dispatch and completion notification
//!
//! A pushed batch becomes a run of descriptors on the device's DMA
//! descriptor ring, published with a single producer-index doorbell write.
//! The hardware consumes descriptors in order and advances a consumer
//! index; [`Device::service_rings`] picks completions up from there,
//! fires each batch's callback exactly once, and recycles the buffers.
//!
//! Completion dispatch is single-consumer: harvesting happens under the
//! ring lock, callbacks run after it is dropped, and a batch callback must
//! not push. The push entry points detect that and fail with
//! [`Error::Unexpected`].

use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use bitflags::bitflags;
use crossbeam_queue::ArrayQueue;
use log::{debug, trace, warn};
use spin::Mutex as SpinMutex;

use crate::error::{Error, Result};
use crate::ilist::{BatchEntry, PendingBatch};
use crate::session::SessionId;
use crate::Device;

/// DMA engine register map (offsets within the device address space).
pub mod map {
    use crate::regs::RegAddr;

    pub const DMA_BASE: RegAddr = 0x0001_0000;
    /// Bit 0 enables the engine
    pub const RING_CTRL: RegAddr = DMA_BASE;
    pub const RING_BASE_LO: RegAddr = DMA_BASE + 0x04;
    pub const RING_BASE_HI: RegAddr = DMA_BASE + 0x08;
    /// Ring depth in descriptors
    pub const RING_SIZE: RegAddr = DMA_BASE + 0x0c;
    /// Software producer index; writing it is the doorbell
    pub const RING_PROD: RegAddr = DMA_BASE + 0x10;
    /// Hardware consumer index
    pub const RING_CONS: RegAddr = DMA_BASE + 0x14;
    /// Nonzero when the engine faulted on a consumed descriptor
    pub const RING_STATUS: RegAddr = DMA_BASE + 0x18;
}

// Synthetic physical address of the ring itself, programmed at init.
const RING_PHYS_BASE: u64 = 0x2000_0000;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct DescFlags: u32 {
        /// Final descriptor of its batch
        const LAST = 1 << 0;
        /// Device-to-host transfer
        const READ = 1 << 1;
        /// Block transfer rather than instruction list
        const BLOCK = 1 << 2;
    }
}

/// One descriptor as staged in ring memory.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Descriptor {
    pub src: u64,
    pub dst: u64,
    pub len: u32,
    pub flags: DescFlags,
    pub batch_id: u32,
}

/// Batch completion callback; the flag is true on success.
pub type CompletionFn = Box<dyn FnOnce(bool) + Send>;

struct InFlight {
    session: SessionId,
    end_seq: u32,
    batch: PendingBatch,
    on_complete: Option<CompletionFn>,
    pushed_at: Instant,
}

struct Finished {
    session: SessionId,
    batch: PendingBatch,
    on_complete: Option<CompletionFn>,
    ok: bool,
    pushed_at: Instant,
}

struct RingState {
    slots: Vec<Option<Descriptor>>,
    /// Descriptors handed to hardware, free-running
    produced: u32,
    /// Descriptors known consumed, free-running
    completed: u32,
    in_flight: VecDeque<InFlight>,
}

/// Per-device descriptor ring. Ring state sits behind a spinlock; the
/// critical sections only stage descriptors and move queue entries.
pub(crate) struct DescRing {
    depth: usize,
    state: SpinMutex<RingState>,
    finished: ArrayQueue<Finished>,
    servicing: AtomicBool,
}

/// Counters for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingStats {
    /// Descriptors published to hardware so far
    pub produced: u32,
    /// Descriptors confirmed consumed
    pub completed: u32,
    /// Batches awaiting completion
    pub in_flight: usize,
}

thread_local! {
    // Set while a completion callback runs on this thread.
    static IN_CALLBACK: Cell<bool> = const { Cell::new(false) };
}

impl DescRing {
    pub(crate) fn new(depth: usize) -> Self {
        Self {
            depth,
            state: SpinMutex::new(RingState {
                slots: (0..depth).map(|_| None).collect(),
                produced: 0,
                completed: 0,
                in_flight: VecDeque::new(),
            }),
            finished: ArrayQueue::new(depth.max(1)),
            servicing: AtomicBool::new(false),
        }
    }
}

fn descriptor_for(entry: &BatchEntry, batch_id: u32, last: bool) -> Descriptor {
    let mut flags = if last { DescFlags::LAST } else { DescFlags::empty() };
    match entry {
        BatchEntry::IList(buffer) => Descriptor {
            src: buffer.phys_addr(),
            dst: 0,
            len: buffer.used() as u32,
            flags,
            batch_id,
        },
        BatchEntry::WriteBlock { buffer, region } => {
            flags |= DescFlags::BLOCK;
            Descriptor {
                src: buffer.phys_addr(),
                dst: region.start_addr as u64,
                len: buffer.used() as u32,
                flags,
                batch_id,
            }
        }
        BatchEntry::ReadBlock {
            buffer,
            region,
            entry_offset,
            entry_count,
            ..
        } => {
            flags |= DescFlags::BLOCK | DescFlags::READ;
            Descriptor {
                src: (region.start_addr + entry_offset * region.addr_step) as u64,
                dst: buffer.phys_addr(),
                len: entry_count * region.width.bytes() as u32,
                flags,
                batch_id,
            }
        }
    }
}

// True once `completed` has moved past `end_seq` (free-running indices).
fn seq_reached(end_seq: u32, completed: u32) -> bool {
    completed.wrapping_sub(end_seq) as i32 >= 0
}

impl Device {
    /// Push the session's pending batch onto the descriptor ring.
    ///
    /// All-or-nothing: with too little ring space the batch stays pending
    /// and the caller retries later ([`Error::TryAgain`]); if the doorbell
    /// write itself fails the batch also stays pending ([`Error::CommFail`]).
    /// `on_complete` fires exactly once, from [`Device::service_rings`],
    /// after hardware consumed the whole batch. Calling this from inside a
    /// completion callback is not allowed.
    pub fn push(&self, session: SessionId, on_complete: CompletionFn) -> Result<()> {
        if IN_CALLBACK.with(|flag| flag.get()) {
            return Err(Error::Unexpected);
        }

        let handle = self.session(session)?;
        let mut state = handle.state.lock();
        let batch = state.pending.take().ok_or(Error::ObjectNotFound)?;
        if batch.is_locked() {
            state.pending = Some(batch);
            return Err(Error::InvalidArg);
        }
        if batch.entries.is_empty() {
            state.pending = Some(batch);
            return Err(Error::ObjectNotFound);
        }

        let mut ring = self.ring.state.lock();
        let used = ring.produced.wrapping_sub(ring.completed) as usize;
        let need = batch.entries.len();
        if need > self.ring.depth - used {
            drop(ring);
            state.pending = Some(batch);
            self.stats.record_push_retry();
            return Err(Error::TryAgain);
        }

        let base_seq = ring.produced;
        for (i, entry) in batch.entries.iter().enumerate() {
            let descriptor = descriptor_for(entry, batch.batch_id, i == need - 1);
            trace!("seq {}: {:?}", base_seq.wrapping_add(i as u32), descriptor);
            let slot = base_seq.wrapping_add(i as u32) as usize % self.ring.depth;
            ring.slots[slot] = Some(descriptor);
        }
        let end_seq = base_seq.wrapping_add(need as u32);
        ring.produced = end_seq;

        if let Err(err) = self.regs.write(self.id, map::RING_PROD, end_seq) {
            warn!("doorbell write failed on dev {}: {}", self.id.0, err);
            for i in 0..need {
                let slot = base_seq.wrapping_add(i as u32) as usize % self.ring.depth;
                ring.slots[slot] = None;
            }
            ring.produced = base_seq;
            drop(ring);
            state.pending = Some(batch);
            return Err(Error::CommFail);
        }

        let mut batch = batch;
        for entry in batch.entries.iter_mut() {
            entry.buffer_mut().set_pushed(true);
        }
        trace!(
            "{}: pushed batch {} ({} descriptors, seq {}..{})",
            session,
            batch.batch_id,
            need,
            base_seq,
            end_seq
        );
        ring.in_flight.push_back(InFlight {
            session,
            end_seq,
            batch,
            on_complete: Some(on_complete),
            pushed_at: Instant::now(),
        });
        drop(ring);

        self.stats.record_push(need);
        state.in_flight += 1;
        state.checkpoint = None;
        Ok(())
    }

    /// Service the descriptor ring: detect hardware progress, fire
    /// completion callbacks, recycle buffers. Returns the number of batches
    /// completed on this call.
    ///
    /// Single consumer: a concurrent call fails with [`Error::TryAgain`],
    /// and calling it from inside a completion callback with
    /// [`Error::Unexpected`].
    pub fn service_rings(&self) -> Result<usize> {
        if IN_CALLBACK.with(|flag| flag.get()) {
            return Err(Error::Unexpected);
        }
        if self.ring.servicing.swap(true, Ordering::Acquire) {
            return Err(Error::TryAgain);
        }
        let result = self.service_rings_inner();
        self.ring.servicing.store(false, Ordering::Release);
        result
    }

    fn service_rings_inner(&self) -> Result<usize> {
        // The behavioral model has no DMA engine advancing a consumer
        // index; a pushed batch is consumed as soon as it is serviced.
        let model = self.config().behavioral_model;
        let (consumer, ok) = if model {
            (self.ring.state.lock().produced, true)
        } else {
            let consumer = self.regs.read(self.id, map::RING_CONS)?;
            let status = self.regs.read(self.id, map::RING_STATUS)?;
            (consumer, status == 0)
        };

        {
            let mut ring = self.ring.state.lock();
            let advance = consumer.wrapping_sub(ring.completed);
            let produced_ahead = ring.produced.wrapping_sub(ring.completed);
            let advance = if advance > produced_ahead {
                warn!(
                    "dev {}: consumer index {} ahead of producer {}",
                    self.id.0, consumer, ring.produced
                );
                produced_ahead
            } else {
                advance
            };

            for i in 0..advance {
                let slot = ring.completed.wrapping_add(i) as usize % self.ring.depth;
                ring.slots[slot] = None;
            }
            ring.completed = ring.completed.wrapping_add(advance);

            while let Some(front) = ring.in_flight.front() {
                if !seq_reached(front.end_seq, ring.completed) {
                    break;
                }
                let InFlight {
                    session,
                    batch,
                    on_complete,
                    pushed_at,
                    ..
                } = ring.in_flight.pop_front().ok_or(Error::Unexpected)?;
                if self
                    .ring
                    .finished
                    .push(Finished {
                        session,
                        batch,
                        on_complete,
                        ok,
                        pushed_at,
                    })
                    .is_err()
                {
                    // Sized to the ring depth, so this cannot fill up.
                    return Err(Error::Unexpected);
                }
            }
        }

        let mut count = 0;
        while let Some(finished) = self.ring.finished.pop() {
            self.dispatch_completion(finished)?;
            count += 1;
        }
        if count > 0 {
            debug!("dev {}: {} batches completed", self.id.0, count);
        }
        Ok(count)
    }

    fn dispatch_completion(&self, finished: Finished) -> Result<()> {
        let Finished {
            session,
            mut batch,
            on_complete,
            ok,
            pushed_at,
        } = finished;
        let had_read = batch.has_read;
        self.stats.record_completion(ok, pushed_at.elapsed());

        // On the model, completing the batch is what applies its writes.
        if self.config().behavioral_model {
            for entry in batch.entries.iter() {
                if let BatchEntry::IList(buffer) = entry {
                    crate::ilist::decode_apply(buffer.as_slice(), |addr, value| {
                        self.regs.write(self.id, addr, value)
                    })?;
                }
            }
        }

        IN_CALLBACK.with(|flag| flag.set(true));
        for entry in batch.entries.iter_mut() {
            if let BatchEntry::ReadBlock {
                buffer,
                region,
                entry_offset,
                entry_count,
                callback,
            } = entry
            {
                let len = *entry_count as usize * region.width.bytes();
                buffer.set_used(len)?;
                let mut callback = callback.lock();
                (callback)(
                    buffer.as_slice(),
                    *entry_offset as usize,
                    *entry_count as usize,
                    !ok,
                );
            }
        }
        if let Some(on_complete) = on_complete {
            (on_complete)(ok);
        }
        IN_CALLBACK.with(|flag| flag.set(false));

        for entry in batch.entries.drain(..) {
            self.pools.put_back(entry.into_buffer())?;
        }

        match self.sessions.get(session) {
            Ok(handle) => {
                let mut state = handle.state.lock();
                state.in_flight = state.in_flight.saturating_sub(1);
                if had_read {
                    state.read_pending = false;
                }
            }
            Err(_) => warn!("completion for vanished {}", session),
        }
        Ok(())
    }

    /// Ring counters, for diagnostics.
    pub fn ring_stats(&self) -> RingStats {
        let ring = self.ring.state.lock();
        RingStats {
            produced: ring.produced,
            completed: ring.completed,
            in_flight: ring.in_flight.len(),
        }
    }

    /// Program the engine's ring registers; called once at device bring-up.
    pub(crate) fn init_ring(&self) -> Result<()> {
        self.regs.write(self.id, map::RING_BASE_LO, RING_PHYS_BASE as u32)?;
        self.regs
            .write(self.id, map::RING_BASE_HI, (RING_PHYS_BASE >> 32) as u32)?;
        self.regs
            .write(self.id, map::RING_SIZE, self.ring.depth as u32)?;
        self.regs.write(self.id, map::RING_PROD, 0)?;
        self.regs.write(self.id, map::RING_CTRL, 1)?;
        Ok(())
    }

    /// Abandon every in-flight batch, failing its callback; part of device
    /// teardown.
    pub(crate) fn drain_ring(&self) {
        let abandoned: Vec<InFlight> = {
            let mut ring = self.ring.state.lock();
            ring.in_flight.drain(..).collect()
        };
        for mut in_flight in abandoned {
            self.stats
                .record_completion(false, in_flight.pushed_at.elapsed());
            if let Some(on_complete) = in_flight.on_complete.take() {
                IN_CALLBACK.with(|flag| flag.set(true));
                (on_complete)(false);
                IN_CALLBACK.with(|flag| flag.set(false));
            }
            for entry in in_flight.batch.entries.drain(..) {
                let _ = self.pools.put_back(entry.into_buffer());
            }
            if let Ok(handle) = self.sessions.get(in_flight.session) {
                let mut state = handle.state.lock();
                state.in_flight = state.in_flight.saturating_sub(1);
                state.read_pending = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DriverConfig, PoolConfig};
    use crate::dma::BufferType;
    use crate::ilist::PipeBitmap;
    use crate::regs::{DeviceId, MockRegs, RegisterIo};
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn device_with(ring_depth: usize) -> (Arc<MockRegs>, Device) {
        let regs = Arc::new(MockRegs::new());
        let mut config = DriverConfig::default();
        config.ilist_pool = PoolConfig { count: 8, size: 64 };
        config.ring_depth = ring_depth;
        let dev = Device::new(DeviceId(0), Arc::clone(&regs) as Arc<dyn RegisterIo>, config)
            .unwrap();
        (regs, dev)
    }

    fn stage_writes(dev: &Device, session: SessionId, count: usize) {
        for _ in 0..count {
            dev.ilist_add(
                session,
                PipeBitmap::all(),
                0,
                0x100,
                &0u32.to_le_bytes(),
                false,
            )
            .unwrap();
        }
    }

    fn finish_hardware(regs: &MockRegs, dev: &Device) {
        let produced = dev.ring_stats().produced;
        regs.write(DeviceId(0), map::RING_CONS, produced).unwrap();
    }

    #[test]
    fn push_nothing_pending() {
        let (_regs, dev) = device_with(8);
        let session = dev.open_session().unwrap();
        assert_eq!(
            dev.push(session, Box::new(|_| {})),
            Err(Error::ObjectNotFound)
        );
    }

    #[test]
    fn push_completes_once_and_recycles() {
        let (regs, dev) = device_with(8);
        let session = dev.open_session().unwrap();
        stage_writes(&dev, session, 6); // two 64-byte buffers

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_cb = Arc::clone(&fired);
        dev.push(
            session,
            Box::new(move |ok| {
                assert!(ok);
                fired_cb.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

        assert_eq!(dev.pools().get(BufferType::IList).outstanding(), 2);
        assert_eq!(dev.ring_stats().in_flight, 1);

        // Nothing consumed yet: servicing finds no completions.
        assert_eq!(dev.service_rings().unwrap(), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        finish_hardware(&regs, &dev);
        assert_eq!(dev.service_rings().unwrap(), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(dev.pools().get(BufferType::IList).outstanding(), 0);

        // Further servicing never re-fires.
        assert_eq!(dev.service_rings().unwrap(), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        dev.close_session(session).unwrap();
    }

    #[test]
    fn ring_full_is_try_again_with_batch_intact() {
        let (_regs, dev) = device_with(1);
        let session = dev.open_session().unwrap();
        stage_writes(&dev, session, 6); // needs 2 descriptors, ring holds 1

        assert_eq!(dev.push(session, Box::new(|_| {})), Err(Error::TryAgain));
        // Batch survived the refused push; aborting frees its buffers.
        assert_eq!(dev.ring_stats().produced, 0);
        dev.ilist_abort(session).unwrap();
        assert_eq!(dev.pools().get(BufferType::IList).outstanding(), 0);
    }

    #[test]
    fn push_with_open_lock_rejected() {
        let (_regs, dev) = device_with(8);
        let session = dev.open_session().unwrap();
        dev.ilist_lock(session).unwrap();

        assert_eq!(dev.push(session, Box::new(|_| {})), Err(Error::InvalidArg));
        dev.ilist_unlock(session).unwrap();
        dev.ilist_abort(session).unwrap();
    }

    #[test]
    fn doorbell_failure_keeps_batch() {
        struct FlakyDoorbell {
            inner: MockRegs,
            arm: AtomicBool,
        }
        impl RegisterIo for FlakyDoorbell {
            fn read(&self, dev: DeviceId, addr: u32) -> Result<u32> {
                self.inner.read(dev, addr)
            }
            fn write(&self, dev: DeviceId, addr: u32, value: u32) -> Result<()> {
                if addr == map::RING_PROD && self.arm.load(Ordering::SeqCst) {
                    return Err(Error::CommFail);
                }
                self.inner.write(dev, addr, value)
            }
        }

        let regs = Arc::new(FlakyDoorbell {
            inner: MockRegs::new(),
            arm: AtomicBool::new(false),
        });
        let mut config = DriverConfig::default();
        config.ilist_pool = PoolConfig { count: 8, size: 64 };
        let dev =
            Device::new(DeviceId(0), Arc::clone(&regs) as Arc<dyn RegisterIo>, config).unwrap();
        let session = dev.open_session().unwrap();
        stage_writes(&dev, session, 2);

        regs.arm.store(true, Ordering::SeqCst);
        assert_eq!(dev.push(session, Box::new(|_| {})), Err(Error::CommFail));
        assert_eq!(dev.ring_stats().produced, 0);

        // Transport recovered: the same batch pushes clean.
        regs.arm.store(false, Ordering::SeqCst);
        dev.push(session, Box::new(|_| {})).unwrap();
        assert_eq!(dev.ring_stats().in_flight, 1);
    }

    #[test]
    fn batches_complete_in_push_order() {
        let (regs, dev) = device_with(16);
        let session = dev.open_session().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in [1u32, 2] {
            stage_writes(&dev, session, 2);
            let order = Arc::clone(&order);
            dev.push(session, Box::new(move |_| order.lock().push(tag)))
                .unwrap();
        }

        // Hardware consumed only the first batch (one descriptor).
        regs.write(DeviceId(0), map::RING_CONS, 1).unwrap();
        assert_eq!(dev.service_rings().unwrap(), 1);
        assert_eq!(*order.lock(), vec![1]);

        finish_hardware(&regs, &dev);
        assert_eq!(dev.service_rings().unwrap(), 1);
        assert_eq!(*order.lock(), vec![1, 2]);
    }

    #[test]
    fn block_read_chunks_complete_with_offsets() {
        let regs = Arc::new(MockRegs::new());
        let mut config = DriverConfig::default();
        config.read_block_pool = PoolConfig { count: 4, size: 64 };
        let dev =
            Device::new(DeviceId(0), Arc::clone(&regs) as Arc<dyn RegisterIo>, config).unwrap();
        let session = dev.open_session().unwrap();

        // 20 eight-byte entries over 64-byte buffers: chunks of 8, 8, 4.
        let region = crate::ilist::BlockRegion {
            width: crate::ilist::MemWidth::W8,
            entries: 20,
            addr_step: 2,
            start_addr: 0x4000,
        };
        let chunks = Arc::new(Mutex::new(Vec::new()));
        let chunks_cb = Arc::clone(&chunks);
        dev.add_block_read(
            session,
            region,
            Box::new(move |data, offset, count, err| {
                assert!(!err);
                chunks_cb.lock().push((data.len(), offset, count));
            }),
            false,
        )
        .unwrap();

        dev.push(session, Box::new(|ok| assert!(ok))).unwrap();
        finish_hardware(&regs, &dev);
        assert_eq!(dev.service_rings().unwrap(), 1);

        assert_eq!(*chunks.lock(), vec![(64, 0, 8), (64, 8, 8), (32, 16, 4)]);
        assert_eq!(dev.pools().get(BufferType::ReadBlock).outstanding(), 0);

        // The completed read frees the per-session read slot.
        dev.add_block_read(session, region, Box::new(|_, _, _, _| {}), false)
            .unwrap();
        dev.ilist_abort(session).unwrap();
    }

    #[test]
    fn block_write_rides_the_batch() {
        let regs = Arc::new(MockRegs::new());
        let mut config = DriverConfig::default();
        config.write_block_pool = PoolConfig { count: 2, size: 64 };
        let dev =
            Device::new(DeviceId(0), Arc::clone(&regs) as Arc<dyn RegisterIo>, config).unwrap();
        let session = dev.open_session().unwrap();

        let region = crate::ilist::BlockRegion {
            width: crate::ilist::MemWidth::W4,
            entries: 8,
            addr_step: 1,
            start_addr: 0x2000,
        };
        let mut buffer = dev
            .alloc_buffer(session, BufferType::WriteBlock, region.byte_len(), false)
            .unwrap();
        buffer.as_mut_slice()[..region.byte_len()].fill(0x5a);
        buffer.set_used(region.byte_len()).unwrap();
        dev.add_block_write(session, region, buffer).unwrap();
        stage_writes(&dev, session, 1);

        dev.push(session, Box::new(|ok| assert!(ok))).unwrap();
        // One write-block descriptor plus one instruction buffer.
        assert_eq!(dev.ring_stats().produced, 2);
        finish_hardware(&regs, &dev);
        assert_eq!(dev.service_rings().unwrap(), 1);
        assert_eq!(dev.pools().get(BufferType::WriteBlock).outstanding(), 0);
        assert_eq!(dev.pools().get(BufferType::IList).outstanding(), 0);
    }

    #[test]
    fn hardware_error_flag_reaches_callback() {
        let (regs, dev) = device_with(8);
        let session = dev.open_session().unwrap();
        stage_writes(&dev, session, 1);

        let saw_error = Arc::new(AtomicBool::new(false));
        let saw_error_cb = Arc::clone(&saw_error);
        dev.push(
            session,
            Box::new(move |ok| saw_error_cb.store(!ok, Ordering::SeqCst)),
        )
        .unwrap();

        regs.write(DeviceId(0), map::RING_STATUS, 0xdead).unwrap();
        finish_hardware(&regs, &dev);
        assert_eq!(dev.service_rings().unwrap(), 1);
        assert!(saw_error.load(Ordering::SeqCst));
    }
}
