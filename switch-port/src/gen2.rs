//! Second-generation datapath
//!
//! Eight-channel MAC groups, four pipes, parse-merge block between the
//! egress buffer and the deparser. The ingress buffer and parse-merge
//! blocks reload their pointer state only across an enable toggle.

use switch_core::{Device, Result, SessionId};

use crate::info::{Direction, PortId, PortInfo};
use crate::lifecycle::{
    seq_disable, seq_drain, seq_enable, seq_reprogram, seq_reset_removed, Block, GenQuirks,
    PortLifecycle, RegMap,
};
use crate::speed::ChipGeneration;

pub static MAP: RegMap = RegMap {
    pipe_stride: 0x0200_0000,
    s2p_base: 0x0800_0000,
    prsr_base: 0x0820_0000,
    ibuf_base: 0x0840_0000,
    ebuf_base: 0x0860_0000,
    pmerge_base: Some(0x0880_0000),
    dprsr_base: 0x08a0_0000,
    ibuf_fifo_depth: 2048,
    ebuf_fifo_depth: 1536,
};

static QUIRKS: GenQuirks = GenQuirks {
    toggle_ingress: &[Block::Ibuf],
    toggle_egress: &[Block::Pmerge],
};

pub struct Gen2Lifecycle;

impl PortLifecycle for Gen2Lifecycle {
    fn generation(&self) -> ChipGeneration {
        ChipGeneration::Gen2
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
    use crate::info::PORTS_PER_PIPE;
    use crate::lifecycle::{GROUP_STRIDE, RATE};

    #[test]
    fn addresses_stride_by_pipe_and_group() {
        let gen = ChipGeneration::Gen2;
        let port = PortId(3 * PORTS_PER_PIPE + 17); // pipe 3, group 2, channel 1

        let base = MAP.group_base(Block::Ibuf, gen, port).unwrap();
        assert_eq!(base, 0x0840_0000 + 3 * 0x0200_0000 + 2 * GROUP_STRIDE);
        assert_eq!(
            MAP.chan_reg(Block::Ibuf, gen, port, RATE, 1).unwrap(),
            base + 4
        );
    }
}
