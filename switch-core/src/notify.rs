// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Learn and idle-time notification delivery
//!
//! The chip pushes two kinds of unsolicited messages at the host: learn
//! digests (new source addresses the pipeline wants installed) and
//! idle-time reports (entries whose activity timers expired). Each kind
//! has its own receive channel: the driver posts buffers from the matching
//! pool, hardware fills them and advances a fill counter, and
//! [`Device::service_notifications`] hands filled buffers to the
//! registered callback before re-posting them.
//!
//! Callbacks run on the servicing thread; like completion callbacks they
//! must be fast and must not block.

use std::collections::VecDeque;

use log::{debug, trace};
use parking_lot::Mutex;

use crate::dma::{BufferType, DmaBuffer};
use crate::error::{Error, Result};
use crate::Device;

/// Notification channel register map.
pub mod map {
    use crate::regs::RegAddr;

    pub const NOTIF_BASE: RegAddr = 0x0002_0000;
    /// Register stride between the learn and idle channels
    pub const CHANNEL_STRIDE: RegAddr = 0x20;

    /// Buffers the driver has posted; write-increment, zero revokes
    pub const CREDIT: RegAddr = 0x00;
    /// Buffers hardware has filled, free-running
    pub const FILLED: RegAddr = 0x04;
    /// Bytes used in the oldest filled buffer
    pub const LEN: RegAddr = 0x08;

    pub fn channel_reg(channel: u32, reg: RegAddr) -> RegAddr {
        NOTIF_BASE + channel * CHANNEL_STRIDE + reg
    }
}

/// Handler for one filled notification buffer.
pub type NotifyFn = Box<dyn FnMut(&[u8]) + Send>;

/// Notification kinds and their channel indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyKind {
    Learn,
    IdleTime,
}

impl NotifyKind {
    pub const ALL: [NotifyKind; 2] = [NotifyKind::Learn, NotifyKind::IdleTime];

    fn channel(self) -> u32 {
        match self {
            NotifyKind::Learn => 0,
            NotifyKind::IdleTime => 1,
        }
    }

    fn pool(self) -> BufferType {
        match self {
            NotifyKind::Learn => BufferType::Learn,
            NotifyKind::IdleTime => BufferType::IdleTime,
        }
    }
}

struct NotifyChannel {
    /// Buffers posted to hardware, oldest first
    posted: VecDeque<DmaBuffer>,
    /// Fill counter last observed
    seen: u32,
    callback: Option<NotifyFn>,
}

/// Receive channels for unsolicited hardware messages.
pub(crate) struct Notifier {
    learn: Mutex<NotifyChannel>,
    idle: Mutex<NotifyChannel>,
}

impl Notifier {
    pub(crate) fn new() -> Self {
        let empty = || NotifyChannel {
            posted: VecDeque::new(),
            seen: 0,
            callback: None,
        };
        Self {
            learn: Mutex::new(empty()),
            idle: Mutex::new(empty()),
        }
    }

    fn channel(&self, kind: NotifyKind) -> &Mutex<NotifyChannel> {
        match kind {
            NotifyKind::Learn => &self.learn,
            NotifyKind::IdleTime => &self.idle,
        }
    }
}

impl Device {
    /// Register the handler for `kind` and post the whole matching pool to
    /// hardware. One handler per kind; re-registering replaces it.
    pub fn register_notify_callback(&self, kind: NotifyKind, callback: NotifyFn) -> Result<()> {
        let mut channel = self.notifier.channel(kind).lock();
        let fresh = channel.callback.is_none();
        channel.callback = Some(callback);
        if !fresh {
            debug!("{:?} notification handler replaced", kind);
            return Ok(());
        }

        // First registration arms the channel with every buffer the pool
        // holds.
        let pool = self.pools.get(kind.pool());
        let mut posted = 0u32;
        loop {
            match pool.alloc(0, false) {
                Ok(buffer) => {
                    channel.posted.push_back(buffer);
                    posted += 1;
                }
                Err(Error::TryAgain) => break,
                Err(err) => return Err(err),
            }
        }
        self.write_register(map::channel_reg(kind.channel(), map::CREDIT), posted)?;
        debug!("{:?} notifications armed with {} buffers", kind, posted);
        Ok(())
    }

    /// Drop the handler for `kind` and return its posted buffers to the
    /// pool.
    pub fn unregister_notify_callback(&self, kind: NotifyKind) -> Result<()> {
        let mut channel = self.notifier.channel(kind).lock();
        if channel.callback.take().is_none() {
            return Err(Error::ObjectNotFound);
        }
        self.write_register(map::channel_reg(kind.channel(), map::CREDIT), 0)?;
        while let Some(buffer) = channel.posted.pop_front() {
            self.pools.put_back(buffer)?;
        }
        Ok(())
    }

    /// Deliver filled notification buffers for every armed channel.
    /// Returns the number of notifications handed to callbacks.
    pub fn service_notifications(&self) -> Result<usize> {
        let mut delivered = 0;
        for kind in NotifyKind::ALL {
            let mut channel = self.notifier.channel(kind).lock();
            if channel.callback.is_none() {
                continue;
            }

            let filled = self.read_register(map::channel_reg(kind.channel(), map::FILLED))?;
            let mut pending = filled.wrapping_sub(channel.seen);
            if pending as usize > channel.posted.len() {
                // Hardware claims more fills than we posted buffers.
                return Err(Error::Unexpected);
            }

            while pending > 0 {
                let len = self.read_register(map::channel_reg(kind.channel(), map::LEN))?;
                let mut buffer = channel.posted.pop_front().ok_or(Error::Unexpected)?;
                let len = (len as usize).min(buffer.capacity());
                buffer.set_used(len)?;

                if let Some(callback) = channel.callback.as_mut() {
                    (callback)(buffer.as_slice());
                }
                self.stats.record_notification();
                delivered += 1;

                // Recycle the buffer to the back of the hardware queue.
                buffer.set_used(0)?;
                channel.posted.push_back(buffer);
                self.write_register(map::channel_reg(kind.channel(), map::CREDIT), 1)?;

                channel.seen = channel.seen.wrapping_add(1);
                pending -= 1;
            }
        }
        if delivered > 0 {
            trace!("{} notifications delivered", delivered);
        }
        Ok(delivered)
    }

    /// Return every posted notification buffer to its pool; part of device
    /// teardown.
    pub(crate) fn drain_notifications(&self) {
        for kind in NotifyKind::ALL {
            let mut channel = self.notifier.channel(kind).lock();
            channel.callback = None;
            while let Some(buffer) = channel.posted.pop_front() {
                let _ = self.pools.put_back(buffer);
            }
        }
    }
}
