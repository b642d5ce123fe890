//! System register trap classifier
//!
//! Decodes a trapped MRS/MSR and either emulates it in place or declares
//! "not handled" so the sequencer can escalate. Two variants exist: the
//! unlocked fast path, safe without the global hypervisor lock, and the
//! locked path for accesses with cross-core side effects.
//!
//! Reference: ARM DDI 0487, D17.2 (ESR_EL2 ISS encoding for MSR/MRS).

use crate::config::MAX_CPUS;
use crate::exc::pcpu::{pcpu, queue_ipi};
use crate::exc::{pmu, ExcContext};
use crate::hal::defs::*;
use crate::hal::{HvHal, SysReg};

/// A system register selector in ISS layout (op0/op1/CRn/CRm/op2 packed
/// into their syndrome positions, Rt and direction masked out).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SysRegId(pub u32);

/// Build a selector from its instruction encoding fields.
pub const fn sysreg(op0: u32, op1: u32, crn: u32, crm: u32, op2: u32) -> SysRegId {
    SysRegId((op0 << 20) | (op2 << 17) | (op1 << 14) | (crn << 10) | (crm << 1))
}

const ISS_DIR_READ: u64 = 1;
const ISS_RT_SHIFT: u64 = 5;
const ISS_RT_MASK: u64 = 0x1F;
const ISS_SYSREG_MASK: u32 = (0x3 << 20) | (0x7 << 17) | (0x7 << 14) | (0xF << 10) | (0xF << 1);

/// One decoded register access.
#[derive(Debug, Clone, Copy)]
pub struct SysRegAccess {
    pub id: SysRegId,
    pub rt: usize,
    pub is_read: bool,
}

impl SysRegAccess {
    /// Decode the MSR/MRS syndrome fields.
    pub fn from_iss(iss: u64) -> Self {
        Self {
            id: SysRegId(iss as u32 & ISS_SYSREG_MASK),
            rt: ((iss >> ISS_RT_SHIFT) & ISS_RT_MASK) as usize,
            is_read: iss & ISS_DIR_READ != 0,
        }
    }
}

// Architectural timer, EL0 views.
pub const SR_CNTP_TVAL_EL0: SysRegId = sysreg(3, 3, 14, 2, 0);
pub const SR_CNTP_CTL_EL0: SysRegId = sysreg(3, 3, 14, 2, 1);
pub const SR_CNTP_CVAL_EL0: SysRegId = sysreg(3, 3, 14, 2, 2);
pub const SR_CNTV_TVAL_EL0: SysRegId = sysreg(3, 3, 14, 3, 0);
pub const SR_CNTV_CTL_EL0: SysRegId = sysreg(3, 3, 14, 3, 1);
pub const SR_CNTV_CVAL_EL0: SysRegId = sysreg(3, 3, 14, 3, 2);

// Architectural PMUv3.
pub const SR_PMCR_EL0: SysRegId = sysreg(3, 3, 9, 12, 0);
pub const SR_PMCNTENSET_EL0: SysRegId = sysreg(3, 3, 9, 12, 1);
pub const SR_PMCNTENCLR_EL0: SysRegId = sysreg(3, 3, 9, 12, 2);
pub const SR_PMOVSCLR_EL0: SysRegId = sysreg(3, 3, 9, 12, 3);
pub const SR_PMSELR_EL0: SysRegId = sysreg(3, 3, 9, 12, 5);
pub const SR_PMCEID0_EL0: SysRegId = sysreg(3, 3, 9, 12, 6);
pub const SR_PMCEID1_EL0: SysRegId = sysreg(3, 3, 9, 12, 7);
pub const SR_PMCCNTR_EL0: SysRegId = sysreg(3, 3, 9, 13, 0);
pub const SR_PMUSERENR_EL0: SysRegId = sysreg(3, 3, 9, 14, 0);
pub const SR_PMINTENSET_EL1: SysRegId = sysreg(3, 0, 9, 14, 1);
pub const SR_PMINTENCLR_EL1: SysRegId = sysreg(3, 0, 9, 14, 2);
pub const SR_PMOVSSET_EL0: SysRegId = sysreg(3, 3, 9, 14, 3);
pub const SR_PMMIR_EL1: SysRegId = sysreg(3, 0, 9, 14, 6);
pub const SR_PMCCFILTR_EL0: SysRegId = sysreg(3, 3, 14, 15, 7);
pub const SR_PMEVCNTR0_EL0: SysRegId = sysreg(3, 3, 14, 8, 0);

// Outer-shareable TLB maintenance.
const SR_TLBI_VMALLE1OS: SysRegId = sysreg(1, 0, 8, 1, 0);
const SR_TLBI_VAE1OS: SysRegId = sysreg(1, 0, 8, 1, 1);
const SR_TLBI_ASIDE1OS: SysRegId = sysreg(1, 0, 8, 1, 2);
const SR_TLBI_RVAE1OS: SysRegId = sysreg(1, 0, 8, 5, 1);

// EL1 auxiliary control.
const SR_ACTLR_EL1: SysRegId = sysreg(3, 0, 1, 0, 1);

// Vendor registers.
const SR_APL_HID4: SysRegId = sysreg(3, 0, 15, 4, 0);
const SR_APL_EHID4: SysRegId = sysreg(3, 0, 15, 4, 1);
pub const SR_APL_PMCR0: SysRegId = sysreg(3, 1, 15, 0, 0);
const SR_APL_PMCR1: SysRegId = sysreg(3, 1, 15, 1, 0);
const SR_APL_PMCR2: SysRegId = sysreg(3, 1, 15, 2, 0);
const SR_APL_PMCR3: SysRegId = sysreg(3, 1, 15, 3, 0);
const SR_APL_PMCR4: SysRegId = sysreg(3, 1, 15, 4, 0);
const SR_APL_PMESR0: SysRegId = sysreg(3, 1, 15, 5, 0);
const SR_APL_PMESR1: SysRegId = sysreg(3, 1, 15, 6, 0);
const SR_APL_PMSR: SysRegId = sysreg(3, 1, 15, 13, 0);
pub const SR_APL_PMC0: SysRegId = sysreg(3, 2, 15, 0, 0);
const SR_APL_PMC1: SysRegId = sysreg(3, 2, 15, 1, 0);
const SR_APL_PMC2: SysRegId = sysreg(3, 2, 15, 2, 0);
const SR_APL_PMC3: SysRegId = sysreg(3, 2, 15, 3, 0);
const SR_APL_PMC4: SysRegId = sysreg(3, 2, 15, 4, 0);
const SR_APL_PMC5: SysRegId = sysreg(3, 2, 15, 5, 0);
const SR_APL_PMC6: SysRegId = sysreg(3, 2, 15, 6, 0);
const SR_APL_PMC7: SysRegId = sysreg(3, 2, 15, 7, 0);
const SR_APL_PMC8: SysRegId = sysreg(3, 2, 15, 9, 0);
const SR_APL_PMC9: SysRegId = sysreg(3, 2, 15, 10, 0);
pub const SR_APL_IPI_RR_LOCAL: SysRegId = sysreg(3, 5, 15, 0, 0);
pub const SR_APL_IPI_RR_GLOBAL: SysRegId = sysreg(3, 5, 15, 0, 1);
pub const SR_APL_IPI_SR: SysRegId = sysreg(3, 5, 15, 1, 1);
const SR_APL_IPI_CR: SysRegId = sysreg(3, 5, 15, 3, 1);
pub const SR_APL_CYC_OVRD: SysRegId = sysreg(3, 5, 15, 5, 0);
const SR_APL_M1RACLES: SysRegId = sysreg(3, 5, 15, 10, 1);
const SR_APL_GXF_STATUS: SysRegId = sysreg(3, 6, 15, 8, 0);
const SR_APL_ACTLR_EL12: SysRegId = sysreg(3, 6, 15, 14, 6);
const SR_APL_CNTVCT_ALIAS: SysRegId = sysreg(3, 4, 15, 10, 6);

/// EL0 timer views transparently redirected to the EL0-at-EL2 shadows.
const TIMER_ALIASES: &[(SysRegId, SysReg)] = &[
    (SR_CNTV_CTL_EL0, SysReg::CntvCtlEl02),
    (SR_CNTV_CVAL_EL0, SysReg::CntvCvalEl02),
    (SR_CNTV_TVAL_EL0, SysReg::CntvTvalEl02),
    (SR_CNTP_CTL_EL0, SysReg::CntpCtlEl02),
    (SR_CNTP_CVAL_EL0, SysReg::CntpCvalEl02),
    (SR_CNTP_TVAL_EL0, SysReg::CntpTvalEl02),
];

/// Selectors passed straight through to the named hardware register.
const PASSTHROUGH: &[(SysRegId, SysReg)] = &[
    // Noisy traps
    (SR_APL_HID4, SysReg::AplHid4),
    (SR_APL_EHID4, SysReg::AplEhid4),
    // We don't normally trap these, but if we do, they're noisy
    (SR_APL_GXF_STATUS, SysReg::AplGxfStatusEl1),
    (SR_APL_CNTVCT_ALIAS, SysReg::AplCntvctAliasEl0),
    // Vendor PMU handling the guest may keep
    (SR_APL_PMCR1, SysReg::AplPmcr1),
    (SR_APL_PMCR2, SysReg::AplPmcr2),
    (SR_APL_PMCR3, SysReg::AplPmcr3),
    (SR_APL_PMCR4, SysReg::AplPmcr4),
    (SR_APL_PMESR0, SysReg::AplPmesr0),
    (SR_APL_PMESR1, SysReg::AplPmesr1),
    (SR_APL_PMSR, SysReg::AplPmsr),
    (SR_APL_PMC1, SysReg::AplPmc(1)),
    (SR_APL_PMC2, SysReg::AplPmc(2)),
    (SR_APL_PMC3, SysReg::AplPmc(3)),
    (SR_APL_PMC4, SysReg::AplPmc(4)),
    (SR_APL_PMC5, SysReg::AplPmc(5)),
    (SR_APL_PMC6, SysReg::AplPmc(6)),
    (SR_APL_PMC7, SysReg::AplPmc(7)),
    (SR_APL_PMC8, SysReg::AplPmc(8)),
    (SR_APL_PMC9, SysReg::AplPmc(9)),
    // IPI control
    (SR_APL_IPI_CR, SysReg::AplIpiCrEl1),
    // Outer-shareable TLB maintenance instructions
    (SR_TLBI_VMALLE1OS, SysReg::TlbiVmalle1Os),
    (SR_TLBI_VAE1OS, SysReg::TlbiVae1Os),
    (SR_TLBI_ASIDE1OS, SysReg::TlbiAside1Os),
    (SR_TLBI_RVAE1OS, SysReg::TlbiRvae1Os),
];

/// Perform the access against a hardware register.
pub(crate) fn access<H: HvHal>(hal: &H, regs: &mut [u64; 32], rt: usize, is_read: bool, reg: SysReg) {
    if is_read {
        regs[rt] = hal.mrs(reg);
    } else {
        hal.msr(reg, regs[rt]);
    }
}

/// Unlocked fast-path classifier.
///
/// Handles everything that is safe without the global hypervisor lock.
/// Returns whether the access was emulated; `false` means escalate.
pub fn handle_sysreg_unlocked<H: HvHal>(hal: &H, ctx: &mut ExcContext, iss: u64) -> bool {
    let acc = SysRegAccess::from_iss(iss);
    // Reads of xzr must stay zero regardless of what a handler stores.
    ctx.regs[31] = 0;

    for &(id, reg) in TIMER_ALIASES.iter().chain(PASSTHROUGH.iter()) {
        if acc.id == id {
            access(hal, &mut ctx.regs, acc.rt, acc.is_read, reg);
            return true;
        }
    }

    // Raw cycle counter: passed through unless the debug build routes it
    // through the locked path for logging.
    if cfg!(not(feature = "pmu-irq-debug")) && acc.id == SR_APL_PMC0 {
        access(hal, &mut ctx.regs, acc.rt, acc.is_read, SysReg::AplPmc(0));
        return true;
    }

    match acc.id {
        SR_ACTLR_EL1 => {
            let reg = if hal.cpufeat_actlr_el2() {
                SysReg::ActlrEl12
            } else {
                SysReg::AplActlrEl12
            };
            access(hal, &mut ctx.regs, acc.rt, acc.is_read, reg);
            true
        }

        SR_APL_IPI_SR => {
            // Shadowed: delivery state lives in the per-core record, not
            // in the hardware register the hypervisor already acked.
            let p = pcpu(ctx.cpu_id);
            if acc.is_read {
                ctx.regs[acc.rt] = if p.ipi_pending.load(core::sync::atomic::Ordering::Acquire) {
                    IPI_SR_PENDING
                } else {
                    0
                };
            } else if ctx.regs[acc.rt] & IPI_SR_PENDING != 0 {
                p.ipi_pending.store(false, core::sync::atomic::Ordering::Release);
            }
            true
        }

        SR_APL_PMCR0 => {
            // Shadow the interrupt mode and state flag; the rest always
            // reflects live hardware.
            let p = pcpu(ctx.cpu_id);
            if acc.is_read {
                let mut val = (hal.mrs(SysReg::AplPmcr0) & !PMCR0_IMODE_MASK)
                    | p.pmc_irq_mode.load(core::sync::atomic::Ordering::Acquire);
                if p.pmc_pending.load(core::sync::atomic::Ordering::Acquire) {
                    val |= PMCR0_IACT;
                }
                ctx.regs[acc.rt] = val;
            } else {
                let val = ctx.regs[acc.rt];
                p.pmc_pending
                    .store(val & PMCR0_IACT != 0, core::sync::atomic::Ordering::Release);
                p.pmc_irq_mode
                    .store(val & PMCR0_IMODE_MASK, core::sync::atomic::Ordering::Release);
                hal.msr(SysReg::AplPmcr0, val);
            }
            true
        }

        SR_APL_CYC_OVRD => {
            // Guests may use this for cpuidle, but must not disable WFI
            // return or retarget FIQs while virtualized.
            if acc.is_read {
                ctx.regs[acc.rt] = hal.mrs(SysReg::AplCycOvrd);
                true
            } else if ctx.regs[acc.rt] & (CYC_OVRD_DISABLE_WFI_RET | CYC_OVRD_FIQ_MODE_MASK) != 0 {
                false
            } else {
                hal.msr(SysReg::AplCycOvrd, ctx.regs[acc.rt]);
                true
            }
        }

        // Covert channel mitigation register: reads as zero since the
        // 12.0 "mitigation" made guests poke it.
        SR_APL_M1RACLES => {
            if acc.is_read {
                ctx.regs[acc.rt] = 0;
            }
            true
        }

        _ => pmu::handle(hal, &mut ctx.regs, acc),
    }
}

/// Locked-path classifier for accesses with cross-core side effects.
///
/// Only reached after the entry sequencer holds the global lock.
pub fn handle_sysreg_locked<H: HvHal>(hal: &H, ctx: &mut ExcContext, iss: u64) -> bool {
    let acc = SysRegAccess::from_iss(iss);
    ctx.regs[31] = 0;

    match acc.id {
        SR_APL_IPI_RR_LOCAL => {
            debug_assert!(!acc.is_read, "IPI send register observed as a read");
            let val = ctx.regs[acc.rt];
            // Target core number in the low byte, cluster taken from the
            // sender's own affinity.
            let mpidr = (val & IPI_RR_CPU_MASK) | (ctx.mpidr & 0xff_ff00);
            for cpu in 0..hal.num_cpus().min(MAX_CPUS) {
                if hal.mpidr_of(cpu) == mpidr {
                    queue_ipi(cpu);
                    hal.msr(SysReg::AplIpiRrLocalEl1, val);
                    return true;
                }
            }
            false
        }

        SR_APL_IPI_RR_GLOBAL => {
            debug_assert!(!acc.is_read, "IPI send register observed as a read");
            let val = ctx.regs[acc.rt];
            let mpidr = (val & IPI_RR_CPU_MASK) | ((val & IPI_RR_CLUSTER_MASK) >> 8);
            for cpu in 0..hal.num_cpus().min(MAX_CPUS) {
                if hal.mpidr_of(cpu) & 0xffff == mpidr {
                    queue_ipi(cpu);
                    hal.msr(SysReg::AplIpiRrGlobalEl1, val);
                    return true;
                }
            }
            false
        }

        #[cfg(feature = "pmu-irq-debug")]
        SR_APL_PMC0 => {
            if acc.is_read {
                ctx.regs[acc.rt] = hal.mrs(SysReg::AplPmc(0));
            } else {
                hal.msr(SysReg::AplPmc(0), ctx.regs[acc.rt]);
                log::debug!("msr PMC0, {:#x}", ctx.regs[acc.rt]);
            }
            true
        }

        _ => false,
    }
}
