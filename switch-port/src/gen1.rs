//! First-generation datapath
//!
//! Four-channel MAC groups, four pipes, no parse-merge block. The egress
//! buffer is the only block needing the enable toggle on this part.

use switch_core::{Device, Result, SessionId};

use crate::info::{Direction, PortId, PortInfo};
use crate::lifecycle::{
    seq_disable, seq_drain, seq_enable, seq_reprogram, seq_reset_removed, Block, GenQuirks,
    PortLifecycle, RegMap,
};
use crate::speed::ChipGeneration;

pub static MAP: RegMap = RegMap {
    pipe_stride: 0x0100_0000,
    s2p_base: 0x0400_0000,
    prsr_base: 0x0410_0000,
    ibuf_base: 0x0420_0000,
    ebuf_base: 0x0430_0000,
    pmerge_base: None,
    dprsr_base: 0x0440_0000,
    ibuf_fifo_depth: 1024,
    ebuf_fifo_depth: 768,
};

static QUIRKS: GenQuirks = GenQuirks {
    toggle_ingress: &[],
    toggle_egress: &[Block::Ebuf],
};

pub struct Gen1Lifecycle;

impl PortLifecycle for Gen1Lifecycle {
    fn generation(&self) -> ChipGeneration {
        ChipGeneration::Gen1
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
            dev.subdevice(),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_parse_merge_block() {
        assert!(MAP.block_base(Block::Pmerge).is_none());
        assert!(MAP.block_base(Block::Dprsr).is_some());
    }
}
