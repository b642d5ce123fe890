//! PMUv3 compatibility layer
//!
//! The host CPU implements a vendor performance monitor with one usable
//! cycle counter, not the architectural multi-counter PMUv3. This module
//! presents the subset of the architectural interface guests expect,
//! backed entirely by that one counter:
//!
//! - the architectural global enable maps onto the vendor counter's
//!   interrupt delivery mode (FIQ when enabled, off otherwise); there is
//!   no separate "count without delivering interrupts" state
//! - cycle-counter reset and overflow-clear are synthesized by parking
//!   the counter, zeroing it, and re-arming it, because the vendor part
//!   only latches a counter write while inactive and exposes overflow
//!   solely through its status register
//! - everything finer-grained than "cycle counter only" reads as zero or
//!   discards the write, with a diagnostic marking the narrowing
//!
//! Every emulated read is reconstructed from live vendor state on each
//! access; only the interrupt mode and pending flag are shadowed, in the
//! per-core record, because the hardware cannot represent "armed but not
//! yet fired".

use crate::hal::defs::*;
use crate::hal::{HvHal, SysReg};

use super::sysreg::{self, SysRegAccess};

/// Park the cycle counter, zero it, then bring it back up armed.
///
/// Each step is fenced with an instruction barrier; the vendor counter
/// only latches the write while its enable and interrupt path are down.
fn reset_cycle_counter<H: HvHal>(hal: &H, pmcr0: u64) {
    let quiesced = pmcr0 & !(PMCR0_PMI_EN_PMC0 | PMCR0_CNT_EN_PMC0);
    hal.isb();
    hal.msr(SysReg::AplPmcr0, quiesced);
    hal.isb();
    hal.msr(SysReg::AplPmc(0), 0);
    hal.isb();
    hal.msr(
        SysReg::AplPmcr0,
        pmcr0 | PMCR0_PMI_EN_PMC0 | PMCR0_CNT_EN_PMC0,
    );
    hal.isb();
}

fn read_pmcr<H: HvHal>(hal: &H) -> u64 {
    let pmcr0 = hal.mrs(SysReg::AplPmcr0);
    let mut val = 0;
    // Interrupt delivery armed is the only observable meaning of the
    // architectural enable bit on this hardware.
    if pmcr0 & PMCR0_IMODE_MASK == PMCR0_IMODE_FIQ {
        val |= PMCR_E;
    }
    if pmcr0 & PMCR0_FREEZE_ON_PMI != 0 {
        val |= PMCR_FZO;
    }
    // Long counters are always on.
    val | PMCR_LC | PMCR_LP
}

fn write_pmcr<H: HvHal>(hal: &H, val: u64) {
    let mut pmcr0 = hal.mrs(SysReg::AplPmcr0);

    if val & PMCR_FZO != 0 {
        pmcr0 |= PMCR0_FREEZE_ON_PMI;
    } else {
        pmcr0 &= !PMCR0_FREEZE_ON_PMI;
    }

    // Event-counter enable and reset (bits 0 and 1 of the architectural
    // register beyond the cycle counter) cannot be expressed here; the
    // cycle counter carries everything.
    pmcr0 &= !PMCR0_IMODE_MASK;
    pmcr0 |= if val & PMCR_E != 0 {
        PMCR0_IMODE_FIQ
    } else {
        PMCR0_IMODE_OFF
    };

    if val & PMCR_C != 0 {
        reset_cycle_counter(hal, pmcr0);
    } else {
        hal.isb();
        hal.msr(SysReg::AplPmcr0, pmcr0);
        hal.isb();
    }
}

fn read_pmccfiltr<H: HvHal>(hal: &H) -> u64 {
    let pmcr1 = hal.mrs(SysReg::AplPmcr1);
    let mut val = 0;
    // The architectural filter bits are "do not count", the vendor bits
    // are "do count"; the senses invert.
    if pmcr1 & PMCR1_COUNT_EL0_PMC0 == 0 {
        val |= PMCCFILTR_U;
    }
    if pmcr1 & PMCR1_COUNT_EL1_PMC0 == 0 {
        val |= PMCCFILTR_P;
    }
    // EL2 counting always happens as far as is known.
    val | PMCCFILTR_NSH
}

fn write_pmccfiltr<H: HvHal>(hal: &H, val: u64) {
    let mut pmcr1 = hal.mrs(SysReg::AplPmcr1);
    if val & PMCCFILTR_P == 0 {
        pmcr1 |= PMCR1_COUNT_EL1_PMC0;
    } else {
        pmcr1 &= !PMCR1_COUNT_EL1_PMC0;
    }
    if val & PMCCFILTR_U == 0 {
        pmcr1 |= PMCR1_COUNT_EL0_PMC0;
    } else {
        pmcr1 &= !PMCR1_COUNT_EL0_PMC0;
    }
    hal.isb();
    hal.msr(SysReg::AplPmcr1, pmcr1);
    hal.isb();
}

/// PMCNTENSET and PMCNTENCLR share one readback view: the live vendor
/// enable state of the cycle counter.
fn read_cnten<H: HvHal>(hal: &H) -> u64 {
    if hal.mrs(SysReg::AplPmcr0) & PMCR0_CNT_EN_PMC0 != 0 {
        PMU_CYCLE_CTR_BIT
    } else {
        0
    }
}

fn write_cnten<H: HvHal>(hal: &H, val: u64, enable: bool) {
    if val == 0 {
        return;
    }
    let mut pmcr0 = hal.mrs(SysReg::AplPmcr0);
    if val & PMU_CYCLE_CTR_BIT != 0 {
        if enable {
            pmcr0 |= PMCR0_CNT_EN_PMC0;
        } else {
            pmcr0 &= !PMCR0_CNT_EN_PMC0;
        }
    }
    hal.isb();
    hal.msr(SysReg::AplPmcr0, pmcr0);
    hal.isb();
}

fn read_inten<H: HvHal>(hal: &H) -> u64 {
    if hal.mrs(SysReg::AplPmcr0) & PMCR0_PMI_EN_PMC0 != 0 {
        PMU_CYCLE_CTR_BIT
    } else {
        0
    }
}

fn write_inten<H: HvHal>(hal: &H, val: u64, enable: bool) {
    if val == 0 {
        return;
    }
    let mut pmcr0 = hal.mrs(SysReg::AplPmcr0);
    if val & PMU_CYCLE_CTR_BIT != 0 {
        if enable {
            pmcr0 |= PMCR0_PMI_EN_PMC0;
        } else {
            pmcr0 &= !PMCR0_PMI_EN_PMC0;
        }
    }
    hal.isb();
    hal.msr(SysReg::AplPmcr0, pmcr0);
    hal.isb();
}

/// Overflow status comes straight from the vendor status register.
fn read_ovs<H: HvHal>(hal: &H) -> u64 {
    let pmsr = hal.mrs(SysReg::AplPmsr);
    if pmsr & PMSR_OVERFLOW_MASK != 0 && pmsr & PMSR_OVERFLOW_PMC0 != 0 {
        PMU_CYCLE_CTR_BIT
    } else {
        0
    }
}

fn write_ovsclr<H: HvHal>(hal: &H, val: u64) {
    if val & PMU_CYCLE_CTR_BIT == 0 {
        return;
    }
    // No direct overflow-clear exists; resetting the counter is the only
    // way to drop the status bit.
    let pmcr0 = hal.mrs(SysReg::AplPmcr0);
    reset_cycle_counter(hal, pmcr0);
}

/// Emulate one architectural PMU register access. Returns whether the
/// selector belonged to the shim.
pub fn handle<H: HvHal>(hal: &H, regs: &mut [u64; 32], acc: SysRegAccess) -> bool {
    let rt = acc.rt;
    match acc.id {
        sysreg::SR_PMCR_EL0 => {
            if acc.is_read {
                regs[rt] = read_pmcr(hal);
                log::debug!("pmuv3: mrs x{}, PMCR_EL0 = {:#x}", rt, regs[rt]);
            } else {
                write_pmcr(hal, regs[rt]);
                log::debug!("pmuv3: msr PMCR_EL0, x{} = {:#x}", rt, regs[rt]);
            }
            true
        }

        // The cycle counter is the vendor counter, directly.
        sysreg::SR_PMCCNTR_EL0 => {
            sysreg::access(hal, regs, rt, acc.is_read, SysReg::AplPmc(0));
            true
        }

        // The first event counter maps onto a spare vendor counter so
        // simple single-event users keep working.
        sysreg::SR_PMEVCNTR0_EL0 => {
            sysreg::access(hal, regs, rt, acc.is_read, SysReg::AplPmc(2));
            true
        }

        sysreg::SR_PMCCFILTR_EL0 => {
            if acc.is_read {
                regs[rt] = read_pmccfiltr(hal);
                log::debug!("pmuv3: mrs x{}, PMCCFILTR_EL0 = {:#x}", rt, regs[rt]);
            } else {
                write_pmccfiltr(hal, regs[rt]);
                log::debug!("pmuv3: msr PMCCFILTR_EL0, x{} = {:#x}", rt, regs[rt]);
            }
            true
        }

        sysreg::SR_PMCNTENSET_EL0 => {
            if acc.is_read {
                regs[rt] = read_cnten(hal);
            } else {
                write_cnten(hal, regs[rt], true);
            }
            true
        }

        sysreg::SR_PMCNTENCLR_EL0 => {
            if acc.is_read {
                regs[rt] = read_cnten(hal);
            } else {
                write_cnten(hal, regs[rt], false);
            }
            true
        }

        sysreg::SR_PMINTENSET_EL1 => {
            if acc.is_read {
                regs[rt] = read_inten(hal);
            } else {
                write_inten(hal, regs[rt], true);
            }
            true
        }

        sysreg::SR_PMINTENCLR_EL1 => {
            if acc.is_read {
                regs[rt] = read_inten(hal);
            } else {
                write_inten(hal, regs[rt], false);
            }
            true
        }

        sysreg::SR_PMOVSCLR_EL0 => {
            if acc.is_read {
                regs[rt] = read_ovs(hal);
                log::debug!("pmuv3: mrs x{}, PMOVSCLR_EL0 = {:#x}", rt, regs[rt]);
            } else {
                write_ovsclr(hal, regs[rt]);
                log::debug!("pmuv3: msr PMOVSCLR_EL0, x{} = {:#x}", rt, regs[rt]);
            }
            true
        }

        sysreg::SR_PMOVSSET_EL0 => {
            if acc.is_read {
                regs[rt] = read_ovs(hal);
            } else {
                // Synthesizing an overflow has no users; discard.
                log::warn!("pmuv3: msr PMOVSSET_EL0 unimplemented, write discarded");
            }
            true
        }

        // Counter selection is meaningless with one counter; report the
        // cycle counter selected and ignore attempts to change it.
        sysreg::SR_PMSELR_EL0 => {
            if acc.is_read {
                regs[rt] = 31;
            } else {
                log::warn!("pmuv3: msr PMSELR_EL0 narrowed to cycle counter, write discarded");
            }
            true
        }

        sysreg::SR_PMUSERENR_EL0 | sysreg::SR_PMCEID0_EL0 | sysreg::SR_PMCEID1_EL0
        | sysreg::SR_PMMIR_EL1 => {
            if acc.is_read {
                regs[rt] = 0;
                log::debug!("pmuv3: RAZ read of {:#x}", acc.id.0);
            } else {
                log::warn!("pmuv3: unimplemented register {:#x}, write discarded", acc.id.0);
            }
            true
        }

        _ => false,
    }
}
