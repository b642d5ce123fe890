//! Bare-metal implementation of [`SysRegOps`] for AArch64.
//!
//! Architectural registers with stable mnemonics go through the
//! `aarch64-cpu` register interface; EL02 aliases, the GIC virtual CPU
//! interface and the vendor blocks use explicit `S3_x_Cx_Cx_x` encodings.

use aarch64_cpu::asm::barrier;
use aarch64_cpu::registers::{
    CNTPCT_EL0, CNTP_CTL_EL0, CNTVOFF_EL2, CNTV_CTL_EL0, ELR_EL2, ESR_EL2, FAR_EL2, HCR_EL2,
    MPIDR_EL1, SPSR_EL2, SP_EL0, SP_EL1,
};
use tock_registers::interface::{Readable, Writeable};

use super::{SysReg, SysRegOps};

macro_rules! mrs_raw {
    ($name:expr) => {{
        let v: u64;
        unsafe {
            core::arch::asm!(concat!("mrs {v}, ", $name), v = out(reg) v, options(nomem, nostack));
        }
        v
    }};
}

macro_rules! msr_raw {
    ($name:expr, $val:expr) => {{
        unsafe {
            core::arch::asm!(concat!("msr ", $name, ", {v}"), v = in(reg) $val, options(nomem, nostack));
        }
    }};
}

/// Zero-sized handle over the real system registers.
///
/// The embedding hypervisor wraps this together with its own
/// [`HostOps`](super::HostOps) implementation to form the [`HvHal`]
/// value handed to the exception entry points.
///
/// [`HvHal`]: super::HvHal
#[derive(Debug, Default, Clone, Copy)]
pub struct PhysSysRegs;

impl SysRegOps for PhysSysRegs {
    fn mrs(&self, reg: SysReg) -> u64 {
        match reg {
            SysReg::SpsrEl2 => SPSR_EL2.get(),
            SysReg::ElrEl2 => ELR_EL2.get(),
            SysReg::EsrEl2 => ESR_EL2.get(),
            SysReg::FarEl2 => FAR_EL2.get(),
            SysReg::Afsr1El2 => mrs_raw!("afsr1_el2"),
            SysReg::SpEl0 => SP_EL0.get(),
            SysReg::SpEl1 => SP_EL1.get(),
            SysReg::IsrEl1 => mrs_raw!("isr_el1"),
            SysReg::MpidrEl1 => MPIDR_EL1.get(),

            SysReg::HcrEl2 => HCR_EL2.get(),
            SysReg::CntvoffEl2 => CNTVOFF_EL2.get(),
            SysReg::CntpctEl0 => CNTPCT_EL0.get(),
            SysReg::CntpCtlEl0 => CNTP_CTL_EL0.get(),
            SysReg::CntvCtlEl0 => CNTV_CTL_EL0.get(),
            SysReg::CntpCtlEl02 => mrs_raw!("S3_5_C14_C2_1"),
            SysReg::CntpCvalEl02 => mrs_raw!("S3_5_C14_C2_2"),
            SysReg::CntpTvalEl02 => mrs_raw!("S3_5_C14_C2_0"),
            SysReg::CntvCtlEl02 => mrs_raw!("S3_5_C14_C3_1"),
            SysReg::CntvCvalEl02 => mrs_raw!("S3_5_C14_C3_2"),
            SysReg::CntvTvalEl02 => mrs_raw!("S3_5_C14_C3_0"),

            SysReg::ActlrEl12 => mrs_raw!("S3_5_C1_C0_1"),

            SysReg::IchHcrEl2 => mrs_raw!("S3_4_C12_C11_0"),
            SysReg::IchVmcrEl2 => mrs_raw!("S3_4_C12_C11_7"),
            SysReg::IchLrEl2(n) => read_ich_lr(n),

            // TLB maintenance encodings are write-only operations.
            SysReg::TlbiVmalle1Os
            | SysReg::TlbiVae1Os
            | SysReg::TlbiAside1Os
            | SysReg::TlbiRvae1Os => 0,

            SysReg::AplPmcr0 => mrs_raw!("S3_1_C15_C0_0"),
            SysReg::AplPmcr1 => mrs_raw!("S3_1_C15_C1_0"),
            SysReg::AplPmcr2 => mrs_raw!("S3_1_C15_C2_0"),
            SysReg::AplPmcr3 => mrs_raw!("S3_1_C15_C3_0"),
            SysReg::AplPmcr4 => mrs_raw!("S3_1_C15_C4_0"),
            SysReg::AplPmesr0 => mrs_raw!("S3_1_C15_C5_0"),
            SysReg::AplPmesr1 => mrs_raw!("S3_1_C15_C6_0"),
            SysReg::AplPmsr => mrs_raw!("S3_1_C15_C13_0"),
            SysReg::AplPmc(n) => read_apl_pmc(n),

            SysReg::AplUpmcr0 => mrs_raw!("S3_7_C15_C0_4"),
            SysReg::AplUpmsr => mrs_raw!("S3_7_C15_C6_4"),

            SysReg::AplIpiSrEl1 => mrs_raw!("S3_5_C15_C1_1"),
            SysReg::AplIpiRrLocalEl1 => mrs_raw!("S3_5_C15_C0_0"),
            SysReg::AplIpiRrGlobalEl1 => mrs_raw!("S3_5_C15_C0_1"),
            SysReg::AplIpiCrEl1 => mrs_raw!("S3_5_C15_C3_1"),

            SysReg::AplVmTmrFiqEnaEl2 => mrs_raw!("S3_5_C15_C1_3"),
            SysReg::AplCycOvrd => mrs_raw!("S3_5_C15_C5_0"),
            SysReg::AplActlrEl12 => mrs_raw!("S3_6_C15_C14_6"),

            SysReg::AplHid4 => mrs_raw!("S3_0_C15_C4_0"),
            SysReg::AplEhid4 => mrs_raw!("S3_0_C15_C4_1"),
            SysReg::AplGxfStatusEl1 => mrs_raw!("S3_6_C15_C8_0"),
            SysReg::AplCntvctAliasEl0 => mrs_raw!("S3_4_C15_C10_6"),
        }
    }

    fn msr(&self, reg: SysReg, val: u64) {
        match reg {
            SysReg::SpsrEl2 => SPSR_EL2.set(val),
            SysReg::ElrEl2 => ELR_EL2.set(val),
            SysReg::EsrEl2 => ESR_EL2.set(val),
            SysReg::FarEl2 => FAR_EL2.set(val),
            SysReg::Afsr1El2 => msr_raw!("afsr1_el2", val),
            SysReg::SpEl0 => SP_EL0.set(val),
            SysReg::SpEl1 => SP_EL1.set(val),
            SysReg::IsrEl1 | SysReg::MpidrEl1 | SysReg::CntpctEl0 => {
                // Read-only registers; nothing in the core writes them.
                debug_assert!(false, "write to read-only register {:?}", reg);
            }

            SysReg::HcrEl2 => HCR_EL2.set(val),
            SysReg::CntvoffEl2 => CNTVOFF_EL2.set(val),
            SysReg::CntpCtlEl0 => CNTP_CTL_EL0.set(val),
            SysReg::CntvCtlEl0 => CNTV_CTL_EL0.set(val),
            SysReg::CntpCtlEl02 => msr_raw!("S3_5_C14_C2_1", val),
            SysReg::CntpCvalEl02 => msr_raw!("S3_5_C14_C2_2", val),
            SysReg::CntpTvalEl02 => msr_raw!("S3_5_C14_C2_0", val),
            SysReg::CntvCtlEl02 => msr_raw!("S3_5_C14_C3_1", val),
            SysReg::CntvCvalEl02 => msr_raw!("S3_5_C14_C3_2", val),
            SysReg::CntvTvalEl02 => msr_raw!("S3_5_C14_C3_0", val),

            SysReg::ActlrEl12 => msr_raw!("S3_5_C1_C0_1", val),

            SysReg::IchHcrEl2 => msr_raw!("S3_4_C12_C11_0", val),
            SysReg::IchVmcrEl2 => msr_raw!("S3_4_C12_C11_7", val),
            SysReg::IchLrEl2(n) => write_ich_lr(n, val),

            SysReg::TlbiVmalle1Os => unsafe {
                core::arch::asm!("tlbi vmalle1os", options(nostack));
            },
            SysReg::TlbiVae1Os => unsafe {
                core::arch::asm!("tlbi vae1os, {v}", v = in(reg) val, options(nostack));
            },
            SysReg::TlbiAside1Os => unsafe {
                core::arch::asm!("tlbi aside1os, {v}", v = in(reg) val, options(nostack));
            },
            SysReg::TlbiRvae1Os => unsafe {
                core::arch::asm!("tlbi rvae1os, {v}", v = in(reg) val, options(nostack));
            },

            SysReg::AplPmcr0 => msr_raw!("S3_1_C15_C0_0", val),
            SysReg::AplPmcr1 => msr_raw!("S3_1_C15_C1_0", val),
            SysReg::AplPmcr2 => msr_raw!("S3_1_C15_C2_0", val),
            SysReg::AplPmcr3 => msr_raw!("S3_1_C15_C3_0", val),
            SysReg::AplPmcr4 => msr_raw!("S3_1_C15_C4_0", val),
            SysReg::AplPmesr0 => msr_raw!("S3_1_C15_C5_0", val),
            SysReg::AplPmesr1 => msr_raw!("S3_1_C15_C6_0", val),
            SysReg::AplPmsr => msr_raw!("S3_1_C15_C13_0", val),
            SysReg::AplPmc(n) => write_apl_pmc(n, val),

            SysReg::AplUpmcr0 => msr_raw!("S3_7_C15_C0_4", val),
            SysReg::AplUpmsr => msr_raw!("S3_7_C15_C6_4", val),

            SysReg::AplIpiSrEl1 => msr_raw!("S3_5_C15_C1_1", val),
            SysReg::AplIpiRrLocalEl1 => msr_raw!("S3_5_C15_C0_0", val),
            SysReg::AplIpiRrGlobalEl1 => msr_raw!("S3_5_C15_C0_1", val),
            SysReg::AplIpiCrEl1 => msr_raw!("S3_5_C15_C3_1", val),

            SysReg::AplVmTmrFiqEnaEl2 => msr_raw!("S3_5_C15_C1_3", val),
            SysReg::AplCycOvrd => msr_raw!("S3_5_C15_C5_0", val),
            SysReg::AplActlrEl12 => msr_raw!("S3_6_C15_C14_6", val),

            SysReg::AplHid4 => msr_raw!("S3_0_C15_C4_0", val),
            SysReg::AplEhid4 => msr_raw!("S3_0_C15_C4_1", val),
            SysReg::AplGxfStatusEl1 => msr_raw!("S3_6_C15_C8_0", val),
            SysReg::AplCntvctAliasEl0 => msr_raw!("S3_4_C15_C10_6", val),
        }
    }

    fn isb(&self) {
        barrier::isb(barrier::SY);
    }

    fn dmb_sy(&self) {
        barrier::dmb(barrier::SY);
    }

    fn enable_serrors(&self) {
        unsafe {
            core::arch::asm!("msr daifclr, #4", options(nomem, nostack));
        }
    }
}

fn read_ich_lr(n: u8) -> u64 {
    match n {
        0 => mrs_raw!("S3_4_C12_C12_0"),
        1 => mrs_raw!("S3_4_C12_C12_1"),
        2 => mrs_raw!("S3_4_C12_C12_2"),
        3 => mrs_raw!("S3_4_C12_C12_3"),
        4 => mrs_raw!("S3_4_C12_C12_4"),
        5 => mrs_raw!("S3_4_C12_C12_5"),
        6 => mrs_raw!("S3_4_C12_C12_6"),
        7 => mrs_raw!("S3_4_C12_C12_7"),
        _ => unreachable!("list register index out of range"),
    }
}

fn write_ich_lr(n: u8, val: u64) {
    match n {
        0 => msr_raw!("S3_4_C12_C12_0", val),
        1 => msr_raw!("S3_4_C12_C12_1", val),
        2 => msr_raw!("S3_4_C12_C12_2", val),
        3 => msr_raw!("S3_4_C12_C12_3", val),
        4 => msr_raw!("S3_4_C12_C12_4", val),
        5 => msr_raw!("S3_4_C12_C12_5", val),
        6 => msr_raw!("S3_4_C12_C12_6", val),
        7 => msr_raw!("S3_4_C12_C12_7", val),
        _ => unreachable!("list register index out of range"),
    }
}

fn read_apl_pmc(n: u8) -> u64 {
    match n {
        0 => mrs_raw!("S3_2_C15_C0_0"),
        1 => mrs_raw!("S3_2_C15_C1_0"),
        2 => mrs_raw!("S3_2_C15_C2_0"),
        3 => mrs_raw!("S3_2_C15_C3_0"),
        4 => mrs_raw!("S3_2_C15_C4_0"),
        5 => mrs_raw!("S3_2_C15_C5_0"),
        6 => mrs_raw!("S3_2_C15_C6_0"),
        7 => mrs_raw!("S3_2_C15_C7_0"),
        8 => mrs_raw!("S3_2_C15_C9_0"),
        9 => mrs_raw!("S3_2_C15_C10_0"),
        _ => unreachable!("PMC index out of range"),
    }
}

fn write_apl_pmc(n: u8, val: u64) {
    match n {
        0 => msr_raw!("S3_2_C15_C0_0", val),
        1 => msr_raw!("S3_2_C15_C1_0", val),
        2 => msr_raw!("S3_2_C15_C2_0", val),
        3 => msr_raw!("S3_2_C15_C3_0", val),
        4 => msr_raw!("S3_2_C15_C4_0", val),
        5 => msr_raw!("S3_2_C15_C5_0", val),
        6 => msr_raw!("S3_2_C15_C6_0", val),
        7 => msr_raw!("S3_2_C15_C7_0", val),
        8 => msr_raw!("S3_2_C15_C9_0", val),
        9 => msr_raw!("S3_2_C15_C10_0", val),
        _ => unreachable!("PMC index out of range"),
    }
}
