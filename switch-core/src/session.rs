// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Session management
//!
//! A session is a client-owned context for one outstanding batch of hardware
//! operations. Sessions hand out small integer handles; callers serialize
//! their own use of a handle, so per-session state sits behind a plain
//! mutex with no further hand-over-hand locking.

use std::fmt;
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::{Mutex, RwLock};

use crate::dma::Pools;
use crate::error::{Error, Result};
use crate::ilist::{Checkpoint, PendingBatch};

/// Most sessions a device will hand out at once.
pub const MAX_SESSIONS: usize = 16;

/// Session handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u8);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session {}", self.0)
    }
}

/// Mutable per-session state, guarded by [`Session::state`].
pub(crate) struct SessionState {
    /// Batch under construction, not yet pushed
    pub pending: Option<PendingBatch>,
    /// A block-read operation is registered and not yet completed
    pub read_pending: bool,
    /// Batches pushed to the ring and not yet completed
    pub in_flight: usize,
    /// Rollback point over the pending batch
    pub checkpoint: Option<Checkpoint>,
}

pub(crate) struct Session {
    pub id: SessionId,
    pub state: Mutex<SessionState>,
}

impl Session {
    fn new(id: SessionId) -> Self {
        Self {
            id,
            state: Mutex::new(SessionState {
                pending: None,
                read_pending: false,
                in_flight: 0,
                checkpoint: None,
            }),
        }
    }
}

/// Slab of session slots for one device.
pub(crate) struct SessionTable {
    slots: RwLock<Vec<Option<Arc<Session>>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new((0..MAX_SESSIONS).map(|_| None).collect()),
        }
    }

    /// Claim the lowest free slot.
    pub fn open(&self) -> Result<SessionId> {
        let mut slots = self.slots.write();
        for (index, slot) in slots.iter_mut().enumerate() {
            if slot.is_none() {
                let id = SessionId(index as u8);
                *slot = Some(Arc::new(Session::new(id)));
                debug!("{} opened", id);
                return Ok(id);
            }
        }
        Err(Error::NoSysResources)
    }

    /// Tear a session down.
    ///
    /// Refused with [`Error::TryAgain`] while a pushed batch is still in
    /// flight; the caller must keep servicing rings until the completion
    /// lands. A pending (never pushed) batch is aborted here so its buffers
    /// cannot leak past the close.
    pub fn close(&self, id: SessionId, pools: &Pools) -> Result<()> {
        let mut slots = self.slots.write();
        let slot = slots
            .get_mut(id.0 as usize)
            .ok_or(Error::InvalidArg)?;
        let session = slot.as_ref().ok_or(Error::ObjectNotFound)?;

        {
            let mut state = session.state.lock();
            if state.in_flight != 0 {
                return Err(Error::TryAgain);
            }
            if let Some(batch) = state.pending.take() {
                warn!("{} closed with a pending batch; aborting it", id);
                batch.release(pools);
            }
            state.read_pending = false;
            state.checkpoint = None;
        }

        *slot = None;
        debug!("{} closed", id);
        Ok(())
    }

    pub fn get(&self, id: SessionId) -> Result<Arc<Session>> {
        self.slots
            .read()
            .get(id.0 as usize)
            .and_then(|slot| slot.clone())
            .ok_or(Error::ObjectNotFound)
    }

    /// Abort every pending batch; used at device teardown.
    pub fn release_all(&self, pools: &Pools) {
        let slots = self.slots.read();
        for session in slots.iter().flatten() {
            let mut state = session.state.lock();
            if let Some(batch) = state.pending.take() {
                batch.release(pools);
            }
            state.read_pending = false;
            state.checkpoint = None;
        }
    }
}
