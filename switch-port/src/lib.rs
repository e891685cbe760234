//! Port lifecycle management for multi-pipe packet ASICs
//!
//! Reconfiguring a port is a sequenced walk over dozens of datapath blocks
//! while the rest of the chip keeps forwarding:
//!
//! ```text
//! port_add / port_remove / port_set_speed
//!         │
//!         ▼
//! ┌──────────────────────────────────────────────────────┐
//! │ PortManager: PortInfo + per-direction state machines │
//! └──────────────┬───────────────────────────────────────┘
//!                │ disable → drain → reprogram → enable
//!                ▼
//! ┌──────────────────────────────────────────────────────┐
//! │ PortLifecycle (per chip generation: Gen1/Gen2/Gen3)  │
//! └──────┬────────────────────────────────┬──────────────┘
//!        │ batched writes                 │ direct occupancy reads
//!        ▼                                ▼
//!   switch-core instruction lists    switch-core register I/O
//! ```
//!
//! Disable, reprogram, and enable stage writes into the caller's session
//! batch; nothing reaches hardware until the caller pushes and services
//! the ring. Drain reads occupancy registers directly and is the only
//! step that can ask to be retried.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::RwLock;

use switch_core::{Device, Error, Result, SessionId};

pub mod gen1;
pub mod gen2;
pub mod gen3;
pub mod info;
pub mod lifecycle;
pub mod speed;

pub use crate::info::{Direction, LifecycleState, PortId, PortInfo, PORTS_PER_PIPE};
pub use crate::lifecycle::{lifecycle_for, PortLifecycle};
pub use crate::speed::{
    channel_count, credit, default_watermark_bytes, rate_code, watermark_cells, ChipGeneration,
    CreditRole, PortSpeed, CELL_BYTES, RATE_NO_PORT, RATE_REMOVAL_RESET,
};

use crate::lifecycle::validate_speed;

struct PortEntry {
    info: PortInfo,
    ingress: Option<LifecycleState>,
    egress: Option<LifecycleState>,
}

impl PortEntry {
    fn new(info: PortInfo) -> Self {
        Self {
            info,
            ingress: None,
            egress: None,
        }
    }

    fn state(&self, dir: Direction) -> Option<LifecycleState> {
        match dir {
            Direction::Ingress => self.ingress,
            Direction::Egress => self.egress,
        }
    }

    fn set_state(&mut self, dir: Direction, state: Option<LifecycleState>) {
        match dir {
            Direction::Ingress => self.ingress = state,
            Direction::Egress => self.egress = state,
        }
    }

    fn reconfiguring(&self) -> bool {
        Direction::BOTH.iter().any(|&dir| {
            matches!(
                self.state(dir),
                Some(
                    LifecycleState::Disabling
                        | LifecycleState::Draining
                        | LifecycleState::Reprogramming
                        | LifecycleState::Removing
                )
            )
        })
    }
}

/// Snapshot of one port for diagnostics.
#[derive(Debug, Clone, Copy)]
pub struct PortStatus {
    pub speed: PortSpeed,
    pub channels: u8,
    pub ingress: Option<LifecycleState>,
    pub egress: Option<LifecycleState>,
    pub admin_enabled: bool,
}

/// Owns every port's [`PortInfo`] and per-direction lifecycle state for
/// one device, and drives the generation's [`PortLifecycle`] through it.
pub struct PortManager {
    device: Arc<Device>,
    lifecycle: Box<dyn PortLifecycle>,
    ports: RwLock<HashMap<PortId, PortEntry>>,
}

impl PortManager {
    pub fn new(device: Arc<Device>, gen: ChipGeneration) -> Self {
        info!("port manager up for {:?} on dev {}", gen, device.id().0);
        Self {
            device,
            lifecycle: lifecycle_for(gen),
            ports: RwLock::new(HashMap::new()),
        }
    }

    pub fn generation(&self) -> ChipGeneration {
        self.lifecycle.generation()
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Bring one direction of a port into service at `speed`: reprogram
    /// the datapath for the new rate, then enable it. The writes land in
    /// `session`'s pending batch; push it to apply them.
    pub fn port_add(
        &self,
        session: SessionId,
        port: PortId,
        speed: PortSpeed,
        dir: Direction,
    ) -> Result<()> {
        let gen = self.generation();
        let channels = validate_speed(gen, speed)?;
        port.validate(gen, channels)?;

        let mut ports = self.ports.write();
        let created = !ports.contains_key(&port);
        let entry = match ports.entry(port) {
            std::collections::hash_map::Entry::Occupied(slot) => slot.into_mut(),
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(PortEntry::new(PortInfo::new(gen, speed)?))
            }
        };

        if entry.info.speed() != speed {
            // The other direction was added at a different rate.
            return Err(Error::InvalidArg);
        }
        if entry.state(dir).is_some() {
            return Err(Error::InvalidArg);
        }

        entry.set_state(dir, Some(LifecycleState::Reprogramming));
        let result = self
            .lifecycle
            .reprogram(&self.device, session, port, dir, &entry.info)
            .and_then(|_| {
                self.lifecycle
                    .enable(&self.device, session, port, dir, &entry.info)
            });

        match result {
            Ok(()) => {
                entry.set_state(dir, Some(LifecycleState::Enabled));
                entry.info.set_admin_enabled(true);
                info!("{} {:?} added at {:?}", port, dir, speed);
                Ok(())
            }
            Err(err) => {
                entry.set_state(dir, None);
                if created {
                    ports.remove(&port);
                }
                warn!("{} {:?} add failed: {}", port, dir, err);
                Err(err)
            }
        }
    }

    /// Take one direction of a port out of service: disable, drain, and
    /// park its channels at the removal reset rate.
    ///
    /// Resumable: a retryable failure (buffer exhaustion, drain bound)
    /// leaves the state machine where it stopped, and calling again picks
    /// up from there. In the drain case the caller must first push the
    /// staged batch and service the ring so the disable reaches hardware.
    pub fn port_remove(&self, session: SessionId, port: PortId, dir: Direction) -> Result<()> {
        let mut ports = self.ports.write();
        let entry = ports.get_mut(&port).ok_or(Error::ObjectNotFound)?;
        let mut state = entry.state(dir).ok_or(Error::ObjectNotFound)?;
        let info = entry.info;

        if !matches!(state, LifecycleState::Draining | LifecycleState::Removing) {
            entry.set_state(dir, Some(LifecycleState::Disabling));
            self.lifecycle
                .disable(&self.device, session, port, dir, &info)?;
            entry.set_state(dir, Some(LifecycleState::Draining));
            state = LifecycleState::Draining;
        }

        if state == LifecycleState::Draining {
            self.lifecycle.drain(&self.device, port, dir, &info)?;
            entry.set_state(dir, Some(LifecycleState::Removing));
        }

        self.lifecycle
            .reset_removed(&self.device, session, port, dir, &info)?;
        entry.set_state(dir, None);
        if entry.ingress.is_none() && entry.egress.is_none() {
            ports.remove(&port);
        }
        info!("{} {:?} removed", port, dir);
        Ok(())
    }

    /// Stop traffic on one direction without removing the port.
    pub fn port_disable(&self, session: SessionId, port: PortId, dir: Direction) -> Result<()> {
        let mut ports = self.ports.write();
        let entry = ports.get_mut(&port).ok_or(Error::ObjectNotFound)?;
        let state = entry.state(dir).ok_or(Error::ObjectNotFound)?;
        let info = entry.info;

        if state != LifecycleState::Draining {
            entry.set_state(dir, Some(LifecycleState::Disabling));
            self.lifecycle
                .disable(&self.device, session, port, dir, &info)?;
            entry.set_state(dir, Some(LifecycleState::Draining));
        }

        self.lifecycle.drain(&self.device, port, dir, &info)?;
        entry.set_state(dir, Some(LifecycleState::Disabled));
        entry.info.set_admin_enabled(false);
        debug!("{} {:?} disabled", port, dir);
        Ok(())
    }

    /// Re-admit traffic on a disabled direction.
    pub fn port_enable(&self, session: SessionId, port: PortId, dir: Direction) -> Result<()> {
        let mut ports = self.ports.write();
        let entry = ports.get_mut(&port).ok_or(Error::ObjectNotFound)?;
        match entry.state(dir) {
            Some(LifecycleState::Disabled) => {}
            Some(_) => return Err(Error::InvalidArg),
            None => return Err(Error::ObjectNotFound),
        }

        self.lifecycle
            .enable(&self.device, session, port, dir, &entry.info)?;
        entry.set_state(dir, Some(LifecycleState::Enabled));
        entry.info.set_admin_enabled(true);
        debug!("{} {:?} enabled", port, dir);
        Ok(())
    }

    /// Enable every direction currently sitting in `Disabled`; used at
    /// the end of a reconfiguration wave.
    pub fn port_enable_all(&self, session: SessionId) -> Result<()> {
        let mut ports = self.ports.write();
        for (&port, entry) in ports.iter_mut() {
            for dir in Direction::BOTH {
                if entry.state(dir) == Some(LifecycleState::Disabled) {
                    self.lifecycle
                        .enable(&self.device, session, port, dir, &entry.info)?;
                    entry.set_state(dir, Some(LifecycleState::Enabled));
                    entry.info.set_admin_enabled(true);
                }
            }
        }
        Ok(())
    }

    /// Change a port's rate: the full disable → drain → reprogram →
    /// enable walk over every direction the port has.
    pub fn port_set_speed(
        &self,
        session: SessionId,
        port: PortId,
        speed: PortSpeed,
    ) -> Result<()> {
        let gen = self.generation();
        let channels = validate_speed(gen, speed)?;
        port.validate(gen, channels)?;

        let mut ports = self.ports.write();
        let entry = ports.get_mut(&port).ok_or(Error::ObjectNotFound)?;
        let dirs: Vec<Direction> = Direction::BOTH
            .into_iter()
            .filter(|&dir| entry.state(dir).is_some())
            .collect();
        if dirs.is_empty() {
            return Err(Error::ObjectNotFound);
        }

        let old_info = entry.info;
        for &dir in &dirs {
            entry.set_state(dir, Some(LifecycleState::Disabling));
            self.lifecycle
                .disable(&self.device, session, port, dir, &old_info)?;
            entry.set_state(dir, Some(LifecycleState::Draining));
            self.lifecycle.drain(&self.device, port, dir, &old_info)?;
        }

        entry.info.set_speed(gen, speed)?;
        for &dir in &dirs {
            entry.set_state(dir, Some(LifecycleState::Reprogramming));
            self.lifecycle
                .reprogram(&self.device, session, port, dir, &entry.info)?;
            self.lifecycle
                .enable(&self.device, session, port, dir, &entry.info)?;
            entry.set_state(dir, Some(LifecycleState::Enabled));
        }
        info!("{} rate changed to {:?}", port, speed);
        Ok(())
    }

    /// Override the buffer credit used at the next reprogram, or `None`
    /// to return to the speed table.
    pub fn set_credit_override(&self, port: PortId, credit: Option<u32>) -> Result<()> {
        let mut ports = self.ports.write();
        let entry = ports.get_mut(&port).ok_or(Error::ObjectNotFound)?;
        if entry.reconfiguring() {
            return Err(Error::TryAgain);
        }
        entry.info.set_credit_override(credit);
        Ok(())
    }

    /// Override the congestion watermark (bytes) used at the next
    /// reprogram, or `None` to return to the default for the speed.
    pub fn set_watermark(&self, port: PortId, bytes: Option<u32>) -> Result<()> {
        let mut ports = self.ports.write();
        let entry = ports.get_mut(&port).ok_or(Error::ObjectNotFound)?;
        if entry.reconfiguring() {
            return Err(Error::TryAgain);
        }
        entry.info.set_watermark_bytes(bytes);
        Ok(())
    }

    /// Snapshot one port.
    pub fn port_status(&self, port: PortId) -> Option<PortStatus> {
        let ports = self.ports.read();
        let entry = ports.get(&port)?;
        Some(PortStatus {
            speed: entry.info.speed(),
            channels: entry.info.channels(),
            ingress: entry.ingress,
            egress: entry.egress,
            admin_enabled: entry.info.admin_enabled(),
        })
    }

    /// Ports currently known to the manager.
    pub fn port_count(&self) -> usize {
        self.ports.read().len()
    }
}
