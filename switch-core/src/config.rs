// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Driver configuration
//!
//! Sizing and policy knobs for the command pipeline. Defaults are tuned for
//! real silicon; a platform daemon may override them from a TOML fragment or
//! from `SWITCH_*` environment variables, in that order.

use std::time::Duration;

use log::warn;
use serde::Deserialize;

use crate::dma::BufferType;

/// Sizing for one DMA buffer pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of buffers in the pool
    pub count: usize,
    /// Capacity of each buffer in bytes
    pub size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            count: 32,
            size: 16 * 1024,
        }
    }
}

/// Driver configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Instruction-list buffer pool
    pub ilist_pool: PoolConfig,
    /// Learn-filter notification buffer pool
    pub learn_pool: PoolConfig,
    /// Idle-time notification buffer pool
    pub idle_pool: PoolConfig,
    /// Block-read buffer pool
    pub read_block_pool: PoolConfig,
    /// Block-write buffer pool
    pub write_block_pool: PoolConfig,

    /// Descriptor ring depth, in descriptors
    pub ring_depth: usize,

    /// Maximum number of occupancy polls during a drain before the step
    /// fails with a retryable error
    pub drain_retry_bound: u32,
    /// Delay between drain polls, in microseconds
    pub drain_poll_delay_us: u64,

    /// Running against the behavioral model rather than silicon. The model
    /// does not move packets, so drain steps succeed without requiring the
    /// occupancy counters to reach zero.
    pub behavioral_model: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            ilist_pool: PoolConfig::default(),
            learn_pool: PoolConfig {
                count: 16,
                size: 4 * 1024,
            },
            idle_pool: PoolConfig {
                count: 16,
                size: 4 * 1024,
            },
            read_block_pool: PoolConfig::default(),
            write_block_pool: PoolConfig::default(),
            ring_depth: 256,
            drain_retry_bound: 10,
            drain_poll_delay_us: 0,
            behavioral_model: false,
        }
    }
}

impl DriverConfig {
    /// Pool sizing for a buffer type.
    pub fn pool(&self, kind: BufferType) -> PoolConfig {
        match kind {
            BufferType::IList => self.ilist_pool,
            BufferType::Learn => self.learn_pool,
            BufferType::IdleTime => self.idle_pool,
            BufferType::ReadBlock => self.read_block_pool,
            BufferType::WriteBlock => self.write_block_pool,
        }
    }

    /// Delay between drain polls.
    pub fn drain_poll_delay(&self) -> Duration {
        Duration::from_micros(self.drain_poll_delay_us)
    }

    /// Parse a TOML fragment, falling back to defaults for absent keys.
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Apply `SWITCH_*` environment overrides on top of `self`.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("SWITCH_RING_DEPTH") {
            match val.parse() {
                Ok(n) => self.ring_depth = n,
                Err(_) => warn!("ignoring malformed SWITCH_RING_DEPTH={}", val),
            }
        }

        if let Ok(val) = std::env::var("SWITCH_DRAIN_RETRY_BOUND") {
            match val.parse() {
                Ok(n) => self.drain_retry_bound = n,
                Err(_) => warn!("ignoring malformed SWITCH_DRAIN_RETRY_BOUND={}", val),
            }
        }

        if let Ok(val) = std::env::var("SWITCH_DRAIN_POLL_DELAY_US") {
            match val.parse() {
                Ok(n) => self.drain_poll_delay_us = n,
                Err(_) => warn!("ignoring malformed SWITCH_DRAIN_POLL_DELAY_US={}", val),
            }
        }

        if let Ok(val) = std::env::var("SWITCH_BEHAVIORAL_MODEL") {
            self.behavioral_model = val == "1" || val.to_lowercase() == "true";
        }

        if let Ok(val) = std::env::var("SWITCH_ILIST_BUFFERS") {
            match val.parse() {
                Ok(n) => self.ilist_pool.count = n,
                Err(_) => warn!("ignoring malformed SWITCH_ILIST_BUFFERS={}", val),
            }
        }

        if let Ok(val) = std::env::var("SWITCH_ILIST_BUFFER_SIZE") {
            match val.parse() {
                Ok(n) => self.ilist_pool.size = n,
                Err(_) => warn!("ignoring malformed SWITCH_ILIST_BUFFER_SIZE={}", val),
            }
        }

        self
    }
}
