//! Third-generation datapath
//!
//! Eight-channel groups across eight pipes split over two dies; pipes four
//! and up live on the second die, which matters only for the direct-read
//! drain path (batched writes carry the pipe in their instruction header).

use switch_core::{Device, Result, SessionId, SubdevId};

use crate::info::{Direction, PortId, PortInfo};
use crate::lifecycle::{
    seq_disable, seq_drain, seq_enable, seq_reprogram, seq_reset_removed, Block, GenQuirks,
    PortLifecycle, RegMap,
};
use crate::speed::ChipGeneration;

pub static MAP: RegMap = RegMap {
    pipe_stride: 0x0200_0000,
    s2p_base: 0x1000_0000,
    prsr_base: 0x1020_0000,
    ibuf_base: 0x1040_0000,
    ebuf_base: 0x1060_0000,
    pmerge_base: Some(0x1080_0000),
    dprsr_base: 0x10a0_0000,
    ibuf_fifo_depth: 4096,
    ebuf_fifo_depth: 3072,
};

static QUIRKS: GenQuirks = GenQuirks {
    toggle_ingress: &[Block::Ibuf],
    toggle_egress: &[Block::Ebuf, Block::Pmerge],
};

// Pipes per die on the dual-die package.
const PIPES_PER_DIE: u8 = 4;

pub(crate) fn die_for(port: PortId) -> SubdevId {
    SubdevId(port.pipe() / PIPES_PER_DIE)
}

pub struct Gen3Lifecycle;

impl PortLifecycle for Gen3Lifecycle {
    fn generation(&self) -> ChipGeneration {
        ChipGeneration::Gen3
    }

    fn disable(
        &self,
        dev: &Device,
        session: SessionId,
        port: PortId,
        dir: Direction,
        info: &PortInfo,
    ) -> Result<()> {
        seq_disable(&MAP, self.generation(), dev, session, port, dir, info)
    }

    fn drain(&self, dev: &Device, port: PortId, dir: Direction, info: &PortInfo) -> Result<()> {
        seq_drain(
            &MAP,
            self.generation(),
            dev,
            die_for(port),
            port,
            dir,
            info,
        )
    }

    fn reprogram(
        &self,
        dev: &Device,
        session: SessionId,
        port: PortId,
        dir: Direction,
        info: &PortInfo,
    ) -> Result<()> {
        seq_reprogram(&MAP, self.generation(), dev, session, port, dir, info)
    }

    fn enable(
        &self,
        dev: &Device,
        session: SessionId,
        port: PortId,
        dir: Direction,
        info: &PortInfo,
    ) -> Result<()> {
        seq_enable(
            &MAP,
            &QUIRKS,
            self.generation(),
            dev,
            session,
            port,
            dir,
            info,
        )
    }

    fn reset_removed(
        &self,
        dev: &Device,
        session: SessionId,
        port: PortId,
        dir: Direction,
        info: &PortInfo,
    ) -> Result<()> {
        seq_reset_removed(&MAP, self.generation(), dev, session, port, dir, info)
    }
}
