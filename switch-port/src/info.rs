//! Per-port bookkeeping
//!
//! [`PortInfo`] is the manager's record of one logical port. The lifecycle
//! code only ever reads it; changes go through the setters so a
//! reconfiguration in flight never races a mutation.

use std::fmt;

use switch_core::{Error, Result};

use crate::speed::{channel_count, ChipGeneration, PortSpeed};

/// Logical ports per pipe, across all generations.
pub const PORTS_PER_PIPE: u16 = 64;

/// Logical port identifier: `pipe * 64 + group * channels_per_group +
/// channel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortId(pub u16);

impl PortId {
    /// Pipe this port lives in.
    pub fn pipe(self) -> u8 {
        (self.0 / PORTS_PER_PIPE) as u8
    }

    /// MAC group within the pipe.
    pub fn group(self, gen: ChipGeneration) -> u16 {
        (self.0 % PORTS_PER_PIPE) / gen.channels_per_group() as u16
    }

    /// Base channel within the MAC group.
    pub fn channel(self, gen: ChipGeneration) -> u8 {
        (self.0 % PORTS_PER_PIPE) as u8 % gen.channels_per_group()
    }

    /// Whether this id names a programmable port on `gen`, running a port
    /// of `channels` lanes: the pipe must exist and the lanes must fit the
    /// group, aligned to the port width.
    pub fn validate(self, gen: ChipGeneration, channels: u8) -> Result<()> {
        if self.pipe() >= gen.pipes() {
            return Err(Error::InvalidArg);
        }
        let base = self.channel(gen);
        if base % channels != 0 || base + channels > gen.channels_per_group() {
            return Err(Error::InvalidArg);
        }
        Ok(())
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port {}", self.0)
    }
}

/// Traffic direction; ingress and egress sequence independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Ingress,
    Egress,
}

impl Direction {
    pub const BOTH: [Direction; 2] = [Direction::Ingress, Direction::Egress];
}

/// Where one direction of a port sits in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Disabled,
    Disabling,
    Draining,
    Reprogramming,
    Enabled,
    Removing,
}

/// The manager's record of one logical port.
#[derive(Debug, Clone, Copy)]
pub struct PortInfo {
    speed: PortSpeed,
    channels: u8,
    credit_override: Option<u32>,
    watermark_bytes: Option<u32>,
    admin_enabled: bool,
}

impl PortInfo {
    pub fn new(gen: ChipGeneration, speed: PortSpeed) -> Result<Self> {
        let channels = channel_count(gen, speed).ok_or(Error::InvalidArg)?;
        Ok(Self {
            speed,
            channels,
            credit_override: None,
            watermark_bytes: None,
            admin_enabled: false,
        })
    }

    pub fn speed(&self) -> PortSpeed {
        self.speed
    }

    /// Lanes this port occupies in its MAC group.
    pub fn channels(&self) -> u8 {
        self.channels
    }

    pub fn credit_override(&self) -> Option<u32> {
        self.credit_override
    }

    pub fn watermark_bytes(&self) -> Option<u32> {
        self.watermark_bytes
    }

    pub fn admin_enabled(&self) -> bool {
        self.admin_enabled
    }

    pub(crate) fn set_speed(&mut self, gen: ChipGeneration, speed: PortSpeed) -> Result<()> {
        self.channels = channel_count(gen, speed).ok_or(Error::InvalidArg)?;
        self.speed = speed;
        Ok(())
    }

    pub(crate) fn set_credit_override(&mut self, credit: Option<u32>) {
        self.credit_override = credit;
    }

    pub(crate) fn set_watermark_bytes(&mut self, bytes: Option<u32>) {
        self.watermark_bytes = bytes;
    }

    pub(crate) fn set_admin_enabled(&mut self, enabled: bool) {
        self.admin_enabled = enabled;
    }
}
