//! Bit-level definitions for the registers the core manipulates.
//!
//! Architectural layouts follow ARM DDI 0487; the vendor performance
//! monitor, IPI and timer-gate layouts follow the implementation-defined
//! register blocks of the supported SoCs.

use crate::utils::{bit, genmask};

bitflags! {
    /// CNTx_CTL layout, shared by the physical and virtual timers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CntCtl: u64 {
        const ENABLE = 1 << 0;
        const IMASK = 1 << 1;
        const ISTATUS = 1 << 2;
    }
}

impl CntCtl {
    /// Timer has fired and its interrupt is unmasked.
    pub fn fired_unmasked(raw: u64) -> bool {
        raw == (CntCtl::ISTATUS | CntCtl::ENABLE).bits()
    }
}

/// HCR_EL2: virtual FIQ pending.
pub const HCR_VF: u64 = bit(6);

/// ISR_EL1: physical FIQ pending at this EL.
pub const ISR_F: u64 = bit(6);
/// ISR_EL1: SError pending at this EL.
pub const ISR_A: u64 = bit(8);

// Vendor PMCR0. One control register covers counter enables, the
// interrupt delivery mode and the latched interrupt-active flag.

/// Counter enable bits (PMC0-7 plus PMC8/9 in the high word).
pub const PMCR0_CNT_MASK: u64 = 0xFF | (0x3 << 32);
/// Cycle counter (PMC0) enable.
pub const PMCR0_CNT_EN_PMC0: u64 = bit(0);
/// Interrupt delivery mode field.
pub const PMCR0_IMODE_MASK: u64 = genmask(10, 8);
pub const PMCR0_IMODE_OFF: u64 = 0 << 8;
pub const PMCR0_IMODE_PMI: u64 = 1 << 8;
pub const PMCR0_IMODE_AIC: u64 = 2 << 8;
pub const PMCR0_IMODE_HALT: u64 = 3 << 8;
pub const PMCR0_IMODE_FIQ: u64 = 4 << 8;
/// Interrupt active (latched until acknowledged).
pub const PMCR0_IACT: u64 = bit(11);
/// Per-counter interrupt enable for PMC0.
pub const PMCR0_PMI_EN_PMC0: u64 = bit(12);
/// Freeze all counters when a counter overflows.
pub const PMCR0_FREEZE_ON_PMI: u64 = bit(20);

// Vendor PMCR1: per-EL count enables, one byte per counter bank.

/// EL0 counting enable for PMC0.
pub const PMCR1_COUNT_EL0_PMC0: u64 = bit(8);
/// EL1 counting enable for PMC0.
pub const PMCR1_COUNT_EL1_PMC0: u64 = bit(16);

// Vendor PMSR: per-counter overflow status.
pub const PMSR_OVERFLOW_MASK: u64 = genmask(9, 0);
pub const PMSR_OVERFLOW_PMC0: u64 = bit(0);

// Vendor uncore PMU.
pub const UPMCR0_IMODE_MASK: u64 = genmask(18, 16);
pub const UPMCR0_IMODE_OFF: u64 = 0 << 16;
pub const UPMCR0_IMODE_FIQ: u64 = 4 << 16;
pub const UPMSR_IACT: u64 = bit(0);

// Vendor IPI block.
pub const IPI_SR_PENDING: u64 = bit(0);
pub const IPI_RR_CPU_MASK: u64 = genmask(7, 0);
pub const IPI_RR_CLUSTER_MASK: u64 = genmask(23, 16);

// Vendor cpuidle override. Writes touching these fields are refused so
// the guest cannot break WFI return or FIQ delivery under the hypervisor.
pub const CYC_OVRD_DISABLE_WFI_RET: u64 = bit(0);
pub const CYC_OVRD_FIQ_MODE_MASK: u64 = genmask(27, 26);

// Vendor guest timer FIQ gate.
pub const VM_TMR_FIQ_ENA_ENA_V: u64 = bit(0);
pub const VM_TMR_FIQ_ENA_ENA_P: u64 = bit(1);

// Architectural PMUv3 register bits presented to the guest.

/// PMCR_EL0: global event counter enable.
pub const PMCR_E: u64 = bit(0);
/// PMCR_EL0: event counter reset.
pub const PMCR_P: u64 = bit(1);
/// PMCR_EL0: cycle counter reset.
pub const PMCR_C: u64 = bit(2);
/// PMCR_EL0: long cycle counter (always on here).
pub const PMCR_LC: u64 = bit(6);
/// PMCR_EL0: long event counters (always on here).
pub const PMCR_LP: u64 = bit(7);
/// PMCR_EL0: freeze on overflow.
pub const PMCR_FZO: u64 = bit(9);

/// PMCCFILTR_EL0: do not count at EL1.
pub const PMCCFILTR_P: u64 = bit(31);
/// PMCCFILTR_EL0: do not count at EL0.
pub const PMCCFILTR_U: u64 = bit(30);
/// PMCCFILTR_EL0: count at EL2 (inverted sense).
pub const PMCCFILTR_NSH: u64 = bit(27);

/// Bit index of the cycle counter in the PMUv3 set/clear registers.
pub const PMU_CYCLE_CTR_BIT: u64 = bit(31);

// ICH_VMCR_EL2 / ICH_HCR_EL2 bring-up bits.

/// ICH_VMCR_EL2: virtual group 1 interrupt enable.
pub const ICH_VMCR_VENG1: u64 = bit(1);
/// ICH_HCR_EL2: virtual CPU interface enable.
pub const ICH_HCR_EN: u64 = bit(0);

/// Number of list registers the virtual CPU interface implements.
pub const NUM_LIST_REGS: u8 = 8;
