//! Platform configuration
//!
//! The vGIC windows and the core count are fixed per chip generation;
//! nothing is discovered at runtime. 36-bit platforms place the emulated
//! distributor at 0xF_0000_0000, 42-bit platforms at 0x50_0000_0000, with
//! the redistributor window following at a fixed offset in both cases.

use crate::{Error, Result};

/// Upper bound for every per-core table in the crate.
pub const MAX_CPUS: usize = 24;

/// Size of the emulated distributor MMIO window.
pub const DIST_WINDOW_SIZE: u64 = 0x10000;

/// Per-core redistributor stride: one RD frame plus one SGI frame.
pub const REDIST_STRIDE: u64 = 0x20000;

const DIST_BASE_36_BIT: u64 = 0xF_0000_0000;
const REDIST_BASE_36_BIT: u64 = 0xF_1000_0000;
const DIST_BASE_42_BIT: u64 = 0x50_0000_0000;
const REDIST_BASE_42_BIT: u64 = 0x51_0000_0000;

/// Chip identity, as reported by early boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ChipId {
    T8103 = 0x8103,
    T8112 = 0x8112,
    T6000 = 0x6000,
    T6001 = 0x6001,
    T6002 = 0x6002,
    T6020 = 0x6020,
    T6021 = 0x6021,
    T6022 = 0x6022,
}

/// Physical addressing class of the SoC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrWidth {
    /// 36-bit physical addresses
    Pa36,
    /// 42-bit physical addresses
    Pa42,
}

/// Per-chip parameters consumed by the vGIC at init.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Platform {
    /// Chip this entry was derived from
    pub chip: ChipId,
    /// Physical addressing class
    pub addr_width: AddrWidth,
    /// Base of the emulated distributor window
    pub dist_base: u64,
    /// Base of the emulated redistributor window
    pub redist_base: u64,
    /// Number of cores presented to the guest
    pub num_cpus: usize,
}

impl Platform {
    /// Look up the fixed parameters for a chip.
    ///
    /// An identity missing from the table is a fatal configuration error,
    /// never a silent mapping at address zero.
    pub fn for_chip(chip: ChipId) -> Result<Self> {
        let (addr_width, num_cpus) = match chip {
            ChipId::T8103 => (AddrWidth::Pa36, 8),
            ChipId::T8112 => (AddrWidth::Pa36, 8),
            // Cannot assume more than 8 cores on the base tier of this
            // generation; the bigger dies report their real counts.
            ChipId::T6000 => (AddrWidth::Pa42, 8),
            ChipId::T6001 => (AddrWidth::Pa42, 10),
            ChipId::T6002 => (AddrWidth::Pa42, 20),
            ChipId::T6020 => (AddrWidth::Pa42, 10),
            ChipId::T6021 => (AddrWidth::Pa42, 12),
            ChipId::T6022 => (AddrWidth::Pa42, 24),
        };
        let (dist_base, redist_base) = match addr_width {
            AddrWidth::Pa36 => (DIST_BASE_36_BIT, REDIST_BASE_36_BIT),
            AddrWidth::Pa42 => (DIST_BASE_42_BIT, REDIST_BASE_42_BIT),
        };
        Ok(Self {
            chip,
            addr_width,
            dist_base,
            redist_base,
            num_cpus,
        })
    }

    /// Try to map a raw identity value onto the table.
    pub fn from_raw_chip_id(raw: u32) -> Result<Self> {
        let chip = match raw {
            0x8103 => ChipId::T8103,
            0x8112 => ChipId::T8112,
            0x6000 => ChipId::T6000,
            0x6001 => ChipId::T6001,
            0x6002 => ChipId::T6002,
            0x6020 => ChipId::T6020,
            0x6021 => ChipId::T6021,
            0x6022 => ChipId::T6022,
            _ => return Err(Error::UnsupportedChip),
        };
        Self::for_chip(chip)
    }

    /// Size of the redistributor window for this platform.
    pub fn redist_window_size(&self) -> u64 {
        REDIST_STRIDE * self.num_cpus as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(ChipId::T8103, 8; "t8103")]
    #[test_case(ChipId::T8112, 8; "t8112")]
    #[test_case(ChipId::T6001, 10; "t6001")]
    #[test_case(ChipId::T6002, 20; "t6002")]
    #[test_case(ChipId::T6022, 24; "t6022")]
    fn test_core_counts(chip: ChipId, cpus: usize) {
        let p = Platform::for_chip(chip).unwrap();
        assert_eq!(p.num_cpus, cpus);
        assert!(p.num_cpus <= MAX_CPUS);
    }

    #[test]
    fn test_window_bases() {
        let p36 = Platform::for_chip(ChipId::T8103).unwrap();
        assert_eq!(p36.dist_base, 0xF_0000_0000);
        assert_eq!(p36.redist_base, 0xF_1000_0000);

        let p42 = Platform::for_chip(ChipId::T6002).unwrap();
        assert_eq!(p42.dist_base, 0x50_0000_0000);
        assert_eq!(p42.redist_base, 0x51_0000_0000);
    }

    #[test]
    fn test_unknown_chip_is_fatal() {
        assert_eq!(Platform::from_raw_chip_id(0xdead), Err(Error::UnsupportedChip));
    }

    #[test]
    fn test_redist_window_size() {
        let p = Platform::for_chip(ChipId::T6001).unwrap();
        assert_eq!(p.redist_window_size(), 0x20000 * 10);
    }
}
