//! Speed, channel, and credit tables
//!
//! Pure lookups encoding the one physical rule of the datapath: a faster
//! port spans more channels of its group and is granted proportionally
//! more buffer credit. Values differ per chip generation; everything here
//! is stateless and unit-tested against literal expectations.

/// Chip generations sharing this command pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChipGeneration {
    /// First generation: four-channel groups, tops out at 100G
    Gen1,
    /// Second generation: eight-channel groups, up to 400G
    Gen2,
    /// Third generation: eight-channel groups, dual-die packages
    Gen3,
}

impl ChipGeneration {
    /// Channels sharing one MAC group (and its buffering blocks).
    pub fn channels_per_group(self) -> u8 {
        match self {
            ChipGeneration::Gen1 => 4,
            ChipGeneration::Gen2 | ChipGeneration::Gen3 => 8,
        }
    }

    /// Pipes in the datapath.
    pub fn pipes(self) -> u8 {
        match self {
            ChipGeneration::Gen1 | ChipGeneration::Gen2 => 4,
            ChipGeneration::Gen3 => 8,
        }
    }
}

/// Link speeds the MACs can run at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PortSpeed {
    Speed1G,
    Speed10G,
    Speed25G,
    Speed40G,
    Speed50G,
    Speed100G,
    Speed200G,
    Speed400G,
}

impl PortSpeed {
    pub const ALL: [PortSpeed; 8] = [
        PortSpeed::Speed1G,
        PortSpeed::Speed10G,
        PortSpeed::Speed25G,
        PortSpeed::Speed40G,
        PortSpeed::Speed50G,
        PortSpeed::Speed100G,
        PortSpeed::Speed200G,
        PortSpeed::Speed400G,
    ];

    pub fn gbps(self) -> u32 {
        match self {
            PortSpeed::Speed1G => 1,
            PortSpeed::Speed10G => 10,
            PortSpeed::Speed25G => 25,
            PortSpeed::Speed40G => 40,
            PortSpeed::Speed50G => 50,
            PortSpeed::Speed100G => 100,
            PortSpeed::Speed200G => 200,
            PortSpeed::Speed400G => 400,
        }
    }
}

/// What a credit grant is spent on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditRole {
    /// Ingress buffer grants toward the parser
    IngressBuffer,
    /// Egress buffer grants toward the deparser
    EgressBuffer,
    /// Deparser output FIFO grants toward the MAC
    DeparserFifo,
}

/// Rate encoding for a channel no port occupies.
pub const RATE_NO_PORT: u8 = 0;

/// Rate written to a removed port's channels. Deliberately a live
/// single-channel encoding, not [`RATE_NO_PORT`]: several downstream
/// blocks reload internal pointers only on an observed change of the rate
/// register, so removal must present an edge.
pub const RATE_REMOVAL_RESET: u8 = 2;

/// Bytes per buffer cell; watermarks are programmed in cells.
pub const CELL_BYTES: u32 = 176;

/// Rate-register encoding for a speed; identical across generations.
pub fn rate_code(speed: PortSpeed) -> u8 {
    match speed {
        PortSpeed::Speed1G => 1,
        PortSpeed::Speed10G => 2,
        PortSpeed::Speed25G => 3,
        PortSpeed::Speed40G => 4,
        PortSpeed::Speed50G => 5,
        PortSpeed::Speed100G => 6,
        PortSpeed::Speed200G => 7,
        PortSpeed::Speed400G => 8,
    }
}

/// Channels a port at `speed` occupies, or `None` when the generation
/// cannot run that speed. Gen1 drives 40G as four 10G lanes and has no
/// 50G/200G/400G mode.
pub fn channel_count(gen: ChipGeneration, speed: PortSpeed) -> Option<u8> {
    match gen {
        ChipGeneration::Gen1 => match speed {
            PortSpeed::Speed1G | PortSpeed::Speed10G | PortSpeed::Speed25G => Some(1),
            PortSpeed::Speed40G => Some(4),
            PortSpeed::Speed100G => Some(4),
            PortSpeed::Speed50G | PortSpeed::Speed200G | PortSpeed::Speed400G => None,
        },
        ChipGeneration::Gen2 | ChipGeneration::Gen3 => match speed {
            PortSpeed::Speed1G | PortSpeed::Speed10G | PortSpeed::Speed25G => Some(1),
            PortSpeed::Speed40G | PortSpeed::Speed50G => Some(2),
            PortSpeed::Speed100G | PortSpeed::Speed200G => Some(4),
            PortSpeed::Speed400G => Some(8),
        },
    }
}

/// Buffer credit granted to a port at `speed` in `role`, or `None` when
/// the generation cannot run that speed.
pub fn credit(gen: ChipGeneration, speed: PortSpeed, role: CreditRole) -> Option<u32> {
    let index = speed as usize;

    const GEN1_INGRESS: [u32; 8] = [6, 12, 18, 48, 0, 48, 0, 0];
    const GEN1_EGRESS: [u32; 8] = [4, 8, 12, 32, 0, 32, 0, 0];
    const GEN1_DEPARSER: [u32; 8] = [2, 4, 6, 16, 0, 16, 0, 0];

    const GEN2_INGRESS: [u32; 8] = [8, 16, 24, 32, 40, 64, 128, 256];
    const GEN2_EGRESS: [u32; 8] = [4, 8, 12, 16, 20, 32, 64, 128];
    const GEN2_DEPARSER: [u32; 8] = [2, 4, 6, 8, 10, 16, 32, 64];

    const GEN3_INGRESS: [u32; 8] = [16, 32, 48, 64, 80, 128, 256, 512];
    const GEN3_EGRESS: [u32; 8] = [8, 16, 24, 32, 40, 64, 128, 256];
    const GEN3_DEPARSER: [u32; 8] = [4, 8, 12, 16, 20, 32, 64, 128];

    channel_count(gen, speed)?;
    let table = match (gen, role) {
        (ChipGeneration::Gen1, CreditRole::IngressBuffer) => &GEN1_INGRESS,
        (ChipGeneration::Gen1, CreditRole::EgressBuffer) => &GEN1_EGRESS,
        (ChipGeneration::Gen1, CreditRole::DeparserFifo) => &GEN1_DEPARSER,
        (ChipGeneration::Gen2, CreditRole::IngressBuffer) => &GEN2_INGRESS,
        (ChipGeneration::Gen2, CreditRole::EgressBuffer) => &GEN2_EGRESS,
        (ChipGeneration::Gen2, CreditRole::DeparserFifo) => &GEN2_DEPARSER,
        (ChipGeneration::Gen3, CreditRole::IngressBuffer) => &GEN3_INGRESS,
        (ChipGeneration::Gen3, CreditRole::EgressBuffer) => &GEN3_EGRESS,
        (ChipGeneration::Gen3, CreditRole::DeparserFifo) => &GEN3_DEPARSER,
    };
    Some(table[index])
}

/// Default congestion watermark, in bytes, before any per-port override.
pub fn default_watermark_bytes(speed: PortSpeed) -> u32 {
    const TABLE: [u32; 8] = [
        8 * 1024,
        16 * 1024,
        24 * 1024,
        32 * 1024,
        40 * 1024,
        64 * 1024,
        128 * 1024,
        256 * 1024,
    ];
    TABLE[speed as usize]
}

/// Convert a watermark in bytes to whole cells, rounding up.
pub fn watermark_cells(bytes: u32) -> u32 {
    bytes.div_ceil(CELL_BYTES)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GENS: [ChipGeneration; 3] = [
        ChipGeneration::Gen1,
        ChipGeneration::Gen2,
        ChipGeneration::Gen3,
    ];
    const ROLES: [CreditRole; 3] = [
        CreditRole::IngressBuffer,
        CreditRole::EgressBuffer,
        CreditRole::DeparserFifo,
    ];

    #[test]
    fn literal_expectations() {
        assert_eq!(channel_count(ChipGeneration::Gen2, PortSpeed::Speed100G), Some(4));
        assert_eq!(channel_count(ChipGeneration::Gen2, PortSpeed::Speed400G), Some(8));
        assert_eq!(channel_count(ChipGeneration::Gen1, PortSpeed::Speed40G), Some(4));
        assert_eq!(channel_count(ChipGeneration::Gen1, PortSpeed::Speed400G), None);

        assert_eq!(
            credit(ChipGeneration::Gen2, PortSpeed::Speed100G, CreditRole::IngressBuffer),
            Some(64)
        );
        assert_eq!(
            credit(ChipGeneration::Gen3, PortSpeed::Speed400G, CreditRole::DeparserFifo),
            Some(128)
        );
        assert_eq!(
            credit(ChipGeneration::Gen1, PortSpeed::Speed50G, CreditRole::EgressBuffer),
            None
        );

        assert_eq!(rate_code(PortSpeed::Speed1G), 1);
        assert_eq!(rate_code(PortSpeed::Speed400G), 8);
    }

    #[test]
    fn rate_codes_distinct_and_nonzero() {
        let mut seen = vec![RATE_NO_PORT];
        for speed in PortSpeed::ALL {
            let code = rate_code(speed);
            assert!(!seen.contains(&code), "duplicate rate code {}", code);
            seen.push(code);
        }
        // The removal reset value is a real single-channel encoding.
        assert_eq!(RATE_REMOVAL_RESET, rate_code(PortSpeed::Speed10G));
        assert_ne!(RATE_REMOVAL_RESET, RATE_NO_PORT);
    }

    #[test]
    fn credit_and_channels_monotone_in_speed() {
        for gen in GENS {
            let supported: Vec<PortSpeed> = PortSpeed::ALL
                .into_iter()
                .filter(|&s| channel_count(gen, s).is_some())
                .collect();
            for pair in supported.windows(2) {
                let (slow, fast) = (pair[0], pair[1]);
                assert!(
                    channel_count(gen, slow).unwrap() <= channel_count(gen, fast).unwrap(),
                    "{:?}: channels not monotone at {:?} -> {:?}",
                    gen,
                    slow,
                    fast
                );
                for role in ROLES {
                    assert!(
                        credit(gen, slow, role).unwrap() <= credit(gen, fast, role).unwrap(),
                        "{:?}/{:?}: credit not monotone at {:?} -> {:?}",
                        gen,
                        role,
                        slow,
                        fast
                    );
                }
            }
        }
    }

    #[test]
    fn port_never_outgrows_its_group() {
        for gen in GENS {
            for speed in PortSpeed::ALL {
                if let Some(channels) = channel_count(gen, speed) {
                    assert!(channels <= gen.channels_per_group());
                }
            }
        }
    }

    #[test]
    fn watermark_rounds_up_to_cells() {
        assert_eq!(watermark_cells(0), 0);
        assert_eq!(watermark_cells(1), 1);
        assert_eq!(watermark_cells(CELL_BYTES), 1);
        assert_eq!(watermark_cells(CELL_BYTES + 1), 2);
        assert_eq!(watermark_cells(default_watermark_bytes(PortSpeed::Speed100G)), 373);
    }
}
