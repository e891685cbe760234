//! Port lifecycle sequencing
//!
//! One [`PortLifecycle`] implementation exists per chip generation; the
//! sequencing logic is shared and parameterized by a per-generation
//! register map and quirk table, because the generations differ only in
//! addresses, datapath constants, and which blocks need the enable toggle.
//!
//! Disable and reprogram steps are staged through the instruction-list
//! builder so they apply atomically with the caller's batch; drain steps
//! read occupancy registers directly and are bounded, so a port that will
//! not quiesce fails with a retryable error instead of hanging the caller.

use std::thread;

use log::{debug, trace, warn};
use switch_core::{Device, Error, PipeBitmap, RegAddr, Result, SessionId, SubdevId};

use crate::info::{Direction, PortId, PortInfo};
use crate::speed::{
    credit, default_watermark_bytes, rate_code, watermark_cells, ChipGeneration, CreditRole,
    PortSpeed, RATE_REMOVAL_RESET,
};

/// Datapath blocks the lifecycle touches, in write order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Block {
    /// Serial-to-parallel receive
    S2p,
    /// Parser
    Prsr,
    /// Ingress buffer
    Ibuf,
    /// Egress buffer
    Ebuf,
    /// Parse-merge
    Pmerge,
    /// Deparser
    Dprsr,
}

const INGRESS_BLOCKS: &[Block] = &[Block::S2p, Block::Prsr, Block::Ibuf];
const EGRESS_BLOCKS: &[Block] = &[Block::Ebuf, Block::Pmerge, Block::Dprsr];

/// Blocks that gate traffic with channel-enable bits, per direction.
const INGRESS_GATES: &[Block] = &[Block::S2p, Block::Ibuf];
const EGRESS_GATES: &[Block] = &[Block::Ebuf, Block::Pmerge];

// Register offsets within one MAC group of any block. Layouts repeat per
// generation; only block base addresses move.
pub const GROUP_STRIDE: u32 = 0x1000;
pub const RATE: u32 = 0x000;
pub const CHAN_EN: u32 = 0x040;
pub const CREDIT: u32 = 0x080;
pub const FIFO_START: u32 = 0x0c0;
pub const FIFO_END: u32 = 0x100;
pub const FIFO_SIZE: u32 = 0x140;
pub const WM_HI: u32 = 0x180;
pub const WM_LO: u32 = 0x1c0;
pub const OCCUPANCY: u32 = 0x200;

// Instruction-list stage used for non-MAU configuration writes.
const STAGE_CFG: u8 = 0;

/// Per-generation register addresses and datapath constants.
pub struct RegMap {
    pub pipe_stride: u32,
    pub s2p_base: u32,
    pub prsr_base: u32,
    pub ibuf_base: u32,
    pub ebuf_base: u32,
    /// Absent on generations without a parse-merge block
    pub pmerge_base: Option<u32>,
    pub dprsr_base: u32,
    /// Ingress buffer FIFO depth shared by one MAC group, in cells
    pub ibuf_fifo_depth: u32,
    /// Egress buffer FIFO depth shared by one MAC group, in cells
    pub ebuf_fifo_depth: u32,
}

impl RegMap {
    pub fn block_base(&self, block: Block) -> Option<u32> {
        match block {
            Block::S2p => Some(self.s2p_base),
            Block::Prsr => Some(self.prsr_base),
            Block::Ibuf => Some(self.ibuf_base),
            Block::Ebuf => Some(self.ebuf_base),
            Block::Pmerge => self.pmerge_base,
            Block::Dprsr => Some(self.dprsr_base),
        }
    }

    /// Base of `block`'s register group for `port`'s pipe and MAC group.
    pub fn group_base(&self, block: Block, gen: ChipGeneration, port: PortId) -> Option<u32> {
        let base = self.block_base(block)?;
        Some(
            base + u32::from(port.pipe()) * self.pipe_stride
                + u32::from(port.group(gen)) * GROUP_STRIDE,
        )
    }

    pub fn chan_reg(&self, block: Block, gen: ChipGeneration, port: PortId, offset: u32, channel: u8) -> Option<RegAddr> {
        Some(self.group_base(block, gen, port)? + offset + u32::from(channel) * 4)
    }

    pub fn group_reg(&self, block: Block, gen: ChipGeneration, port: PortId, offset: u32) -> Option<RegAddr> {
        Some(self.group_base(block, gen, port)? + offset)
    }

    fn fifo_depth(&self, block: Block) -> u32 {
        match block {
            Block::Ibuf => self.ibuf_fifo_depth,
            _ => self.ebuf_fifo_depth,
        }
    }
}

/// Per-generation sequencing quirks.
pub struct GenQuirks {
    /// Blocks whose channel enable must be toggled 0-1-0-1-0 before the
    /// final assert, to force internal pointer and credit reload
    pub toggle_ingress: &'static [Block],
    pub toggle_egress: &'static [Block],
}

impl GenQuirks {
    fn toggles(&self, dir: Direction) -> &'static [Block] {
        match dir {
            Direction::Ingress => self.toggle_ingress,
            Direction::Egress => self.toggle_egress,
        }
    }
}

/// The disable → drain → reprogram → enable sequence for one generation.
///
/// All steps except `drain` stage writes into the caller's session batch;
/// nothing reaches hardware until the caller pushes. `drain` reads
/// occupancy registers directly and must therefore run after the disable
/// batch has completed.
pub trait PortLifecycle: Send + Sync {
    fn generation(&self) -> ChipGeneration;

    /// Stop traffic into the blocks under change.
    fn disable(
        &self,
        dev: &Device,
        session: SessionId,
        port: PortId,
        dir: Direction,
        info: &PortInfo,
    ) -> Result<()>;

    /// Poll until in-flight packets have left the blocks under change.
    fn drain(&self, dev: &Device, port: PortId, dir: Direction, info: &PortInfo) -> Result<()>;

    /// Write speed-dependent rates, credits, FIFO carving, and thresholds.
    fn reprogram(
        &self,
        dev: &Device,
        session: SessionId,
        port: PortId,
        dir: Direction,
        info: &PortInfo,
    ) -> Result<()>;

    /// Re-admit traffic, toggling where the silicon demands it.
    fn enable(
        &self,
        dev: &Device,
        session: SessionId,
        port: PortId,
        dir: Direction,
        info: &PortInfo,
    ) -> Result<()>;

    /// Park a removed port's channels: rates to the single-channel reset
    /// encoding (an observable edge), credits and carving cleared.
    fn reset_removed(
        &self,
        dev: &Device,
        session: SessionId,
        port: PortId,
        dir: Direction,
        info: &PortInfo,
    ) -> Result<()>;
}

/// Lifecycle implementation for a generation.
pub fn lifecycle_for(gen: ChipGeneration) -> Box<dyn PortLifecycle> {
    match gen {
        ChipGeneration::Gen1 => Box::new(crate::gen1::Gen1Lifecycle),
        ChipGeneration::Gen2 => Box::new(crate::gen2::Gen2Lifecycle),
        ChipGeneration::Gen3 => Box::new(crate::gen3::Gen3Lifecycle),
    }
}

/// Stage one 32-bit configuration write into the session batch.
fn stage_write(
    dev: &Device,
    session: SessionId,
    pipes: PipeBitmap,
    addr: RegAddr,
    value: u32,
) -> Result<()> {
    dev.ilist_add(session, pipes, STAGE_CFG, addr, &value.to_le_bytes(), false)
}

/// Read-modify-write a write-only register through the device shadow.
fn shadow_write(
    dev: &Device,
    session: SessionId,
    pipes: PipeBitmap,
    addr: RegAddr,
    f: impl FnOnce(u32) -> u32,
) -> Result<u32> {
    let value = f(dev.shadows().get(addr));
    stage_write(dev, session, pipes, addr, value)?;
    dev.shadows().set(addr, value);
    Ok(value)
}

/// Stage the exact 0-1-0-1-0 enable toggle for `bits` of a channel-enable
/// register. Five discrete batched writes; collapsing them defeats the
/// pointer-reload the silicon performs on each edge.
fn toggle_enable_bits(
    dev: &Device,
    session: SessionId,
    pipes: PipeBitmap,
    addr: RegAddr,
    bits: u32,
) -> Result<()> {
    let base = dev.shadows().get(addr) & !bits;
    for value in [base, base | bits, base, base | bits, base] {
        stage_write(dev, session, pipes, addr, value)?;
    }
    dev.shadows().set(addr, base);
    Ok(())
}

/// Poll `addrs` on `subdev` until all read zero, bounded by the configured
/// retry count. On the behavioral model draining is not physically
/// meaningful and succeeds immediately.
pub(crate) fn poll_drained(
    dev: &Device,
    subdev: SubdevId,
    port: PortId,
    addrs: &[RegAddr],
) -> Result<()> {
    let config = dev.config();
    if config.behavioral_model {
        trace!("{}: drain skipped on behavioral model", port);
        return Ok(());
    }

    let delay = config.drain_poll_delay();
    for attempt in 0..config.drain_retry_bound {
        let mut occupied = false;
        for &addr in addrs {
            occupied |= dev.read_register_sub(subdev, addr)? != 0;
        }
        if !occupied {
            trace!("{}: drained after {} polls", port, attempt + 1);
            return Ok(());
        }
        if !delay.is_zero() {
            thread::sleep(delay);
        }
    }

    warn!(
        "{}: still occupied after {} polls",
        port, config.drain_retry_bound
    );
    Err(Error::HardwareStuck { port: port.0 })
}

fn blocks_for(map: &RegMap, dir: Direction) -> impl Iterator<Item = Block> + '_ {
    let blocks = match dir {
        Direction::Ingress => INGRESS_BLOCKS,
        Direction::Egress => EGRESS_BLOCKS,
    };
    blocks
        .iter()
        .copied()
        .filter(|&block| map.block_base(block).is_some())
}

fn gates_for(map: &RegMap, dir: Direction) -> impl Iterator<Item = Block> + '_ {
    let gates = match dir {
        Direction::Ingress => INGRESS_GATES,
        Direction::Egress => EGRESS_GATES,
    };
    gates
        .iter()
        .copied()
        .filter(|&block| map.block_base(block).is_some())
}

/// The buffering block whose FIFO is carved for this direction.
fn carve_block(dir: Direction) -> Block {
    match dir {
        Direction::Ingress => Block::Ibuf,
        Direction::Egress => Block::Ebuf,
    }
}

fn channel_bits(info: &PortInfo, base: u8) -> u32 {
    ((1u32 << info.channels()) - 1) << base
}

// Shared step implementations; the per-generation types delegate here with
// their own map, quirks, and die selection.

pub(crate) fn seq_disable(
    map: &RegMap,
    gen: ChipGeneration,
    dev: &Device,
    session: SessionId,
    port: PortId,
    dir: Direction,
    info: &PortInfo,
) -> Result<()> {
    let pipes = PipeBitmap::single(port.pipe())?;
    let bits = channel_bits(info, port.channel(gen));

    for block in gates_for(map, dir) {
        let addr = map
            .group_reg(block, gen, port, CHAN_EN)
            .ok_or(Error::Unexpected)?;
        shadow_write(dev, session, pipes, addr, |en| en & !bits)?;
    }
    debug!("{}: {:?} disabled (bits {:#x})", port, dir, bits);
    Ok(())
}

pub(crate) fn seq_drain(
    map: &RegMap,
    gen: ChipGeneration,
    dev: &Device,
    subdev: SubdevId,
    port: PortId,
    dir: Direction,
    info: &PortInfo,
) -> Result<()> {
    let base = port.channel(gen);
    let mut addrs = Vec::new();
    let watch: &[Block] = match dir {
        Direction::Ingress => &[Block::Ibuf],
        Direction::Egress => &[Block::Ebuf, Block::Dprsr],
    };
    for &block in watch {
        for lane in 0..info.channels() {
            addrs.push(
                map.chan_reg(block, gen, port, OCCUPANCY, base + lane)
                    .ok_or(Error::Unexpected)?,
            );
        }
    }
    poll_drained(dev, subdev, port, &addrs)
}

pub(crate) fn seq_reprogram(
    map: &RegMap,
    gen: ChipGeneration,
    dev: &Device,
    session: SessionId,
    port: PortId,
    dir: Direction,
    info: &PortInfo,
) -> Result<()> {
    let pipes = PipeBitmap::single(port.pipe())?;
    let base = port.channel(gen);
    let speed = info.speed();
    let code = u32::from(rate_code(speed));

    // Rate encodings into every block of the direction's datapath. Every
    // lane of the port carries the code so each block sees the change.
    for block in blocks_for(map, dir) {
        for lane in 0..info.channels() {
            let addr = map
                .chan_reg(block, gen, port, RATE, base + lane)
                .ok_or(Error::Unexpected)?;
            stage_write(dev, session, pipes, addr, code)?;
        }
    }

    // Buffer credits: the port's grant lives on its base lane, the other
    // lanes aggregate into it.
    let (buffer_block, role) = match dir {
        Direction::Ingress => (Block::Ibuf, CreditRole::IngressBuffer),
        Direction::Egress => (Block::Ebuf, CreditRole::EgressBuffer),
    };
    let grant = info
        .credit_override()
        .or_else(|| credit(gen, speed, role))
        .ok_or(Error::InvalidArg)?;
    stage_credit_lanes(map, gen, dev, session, pipes, port, buffer_block, grant, info)?;

    if dir == Direction::Egress {
        let fifo = credit(gen, speed, CreditRole::DeparserFifo).ok_or(Error::InvalidArg)?;
        stage_credit_lanes(map, gen, dev, session, pipes, port, Block::Dprsr, fifo, info)?;
    }

    // Proportional FIFO carving: the group's depth split per lane, the
    // port's span owned by its base lane.
    let block = carve_block(dir);
    let slice = map.fifo_depth(block) / u32::from(gen.channels_per_group());
    let start = slice * u32::from(base);
    let size = slice * u32::from(info.channels());
    for lane in 0..info.channels() {
        let (s, e, z) = if lane == 0 {
            (start, start + size - 1, size)
        } else {
            (0, 0, 0)
        };
        let ch = base + lane;
        stage_write(dev, session, pipes, map.chan_reg(block, gen, port, FIFO_START, ch).ok_or(Error::Unexpected)?, s)?;
        stage_write(dev, session, pipes, map.chan_reg(block, gen, port, FIFO_END, ch).ok_or(Error::Unexpected)?, e)?;
        stage_write(dev, session, pipes, map.chan_reg(block, gen, port, FIFO_SIZE, ch).ok_or(Error::Unexpected)?, z)?;
    }

    // Congestion watermarks in cells, high and a half-way low for
    // hysteresis, on the base lane.
    let bytes = info
        .watermark_bytes()
        .unwrap_or_else(|| default_watermark_bytes(speed));
    let cells = watermark_cells(bytes);
    stage_write(dev, session, pipes, map.chan_reg(block, gen, port, WM_HI, base).ok_or(Error::Unexpected)?, cells)?;
    stage_write(dev, session, pipes, map.chan_reg(block, gen, port, WM_LO, base).ok_or(Error::Unexpected)?, cells / 2)?;

    debug!(
        "{}: {:?} reprogrammed for {:?} ({} lanes, credit {}, {} cells)",
        port,
        dir,
        speed,
        info.channels(),
        grant,
        cells
    );
    Ok(())
}

fn stage_credit_lanes(
    map: &RegMap,
    gen: ChipGeneration,
    dev: &Device,
    session: SessionId,
    pipes: PipeBitmap,
    port: PortId,
    block: Block,
    grant: u32,
    info: &PortInfo,
) -> Result<()> {
    let base = port.channel(gen);
    for lane in 0..info.channels() {
        let value = if lane == 0 { grant } else { 0 };
        let addr = map
            .chan_reg(block, gen, port, CREDIT, base + lane)
            .ok_or(Error::Unexpected)?;
        stage_write(dev, session, pipes, addr, value)?;
    }
    Ok(())
}

pub(crate) fn seq_enable(
    map: &RegMap,
    quirks: &GenQuirks,
    gen: ChipGeneration,
    dev: &Device,
    session: SessionId,
    port: PortId,
    dir: Direction,
    info: &PortInfo,
) -> Result<()> {
    let pipes = PipeBitmap::single(port.pipe())?;
    let bits = channel_bits(info, port.channel(gen));

    for &block in quirks.toggles(dir) {
        if map.block_base(block).is_none() {
            continue;
        }
        let addr = map
            .group_reg(block, gen, port, CHAN_EN)
            .ok_or(Error::Unexpected)?;
        toggle_enable_bits(dev, session, pipes, addr, bits)?;
    }

    for block in gates_for(map, dir) {
        let addr = map
            .group_reg(block, gen, port, CHAN_EN)
            .ok_or(Error::Unexpected)?;
        shadow_write(dev, session, pipes, addr, |en| en | bits)?;
    }
    debug!("{}: {:?} enabled (bits {:#x})", port, dir, bits);
    Ok(())
}

pub(crate) fn seq_reset_removed(
    map: &RegMap,
    gen: ChipGeneration,
    dev: &Device,
    session: SessionId,
    port: PortId,
    dir: Direction,
    info: &PortInfo,
) -> Result<()> {
    let pipes = PipeBitmap::single(port.pipe())?;
    let base = port.channel(gen);
    let code = u32::from(RATE_REMOVAL_RESET);

    for block in blocks_for(map, dir) {
        for lane in 0..info.channels() {
            let addr = map
                .chan_reg(block, gen, port, RATE, base + lane)
                .ok_or(Error::Unexpected)?;
            stage_write(dev, session, pipes, addr, code)?;
        }
    }

    // Clear the grant and carving the port held.
    let block = carve_block(dir);
    for lane in 0..info.channels() {
        let ch = base + lane;
        stage_write(dev, session, pipes, map.chan_reg(block, gen, port, CREDIT, ch).ok_or(Error::Unexpected)?, 0)?;
        stage_write(dev, session, pipes, map.chan_reg(block, gen, port, FIFO_START, ch).ok_or(Error::Unexpected)?, 0)?;
        stage_write(dev, session, pipes, map.chan_reg(block, gen, port, FIFO_END, ch).ok_or(Error::Unexpected)?, 0)?;
        stage_write(dev, session, pipes, map.chan_reg(block, gen, port, FIFO_SIZE, ch).ok_or(Error::Unexpected)?, 0)?;
    }
    if dir == Direction::Egress {
        for lane in 0..info.channels() {
            let addr = map
                .chan_reg(Block::Dprsr, gen, port, CREDIT, base + lane)
                .ok_or(Error::Unexpected)?;
            stage_write(dev, session, pipes, addr, 0)?;
        }
    }
    debug!("{}: {:?} reset to removal rate", port, dir);
    Ok(())
}

/// Speed the port info claims, re-validated against the generation; used
/// by the manager before touching hardware.
pub(crate) fn validate_speed(gen: ChipGeneration, speed: PortSpeed) -> Result<u8> {
    crate::speed::channel_count(gen, speed).ok_or(Error::InvalidArg)
}
