//! Hardware and host-service seam
//!
//! Everything the exception core needs from the outside world goes through
//! the two traits in this module, so the trap logic itself stays free of
//! inline assembly and linkage to the surrounding hypervisor:
//!
//! - [`SysRegOps`] wraps every architectural and vendor system register the
//!   core reads or writes, keyed by the closed [`SysReg`] enum.
//! - [`HostOps`] collects the external collaborators: SMP identity,
//!   address translation, MMIO hook registration, the PSCI service, the
//!   debug proxy round-trip and the watchdog.
//!
//! The bare-metal implementation of [`SysRegOps`] lives in
//! [`aarch64`]; the embedding hypervisor supplies [`HostOps`] and combines
//! both into one [`HvHal`] value. Tests use the register-map mock in
//! `hal::mock`.

pub mod defs;

#[cfg(target_arch = "aarch64")]
pub mod aarch64;

#[cfg(test)]
pub mod mock;

use crate::exc::proxy::{ProxyStartMsg, ProxyVerdict};
use crate::exc::ExcContext;

/// An MMIO trap handler installed against a physical window.
///
/// Arguments: faulting context, trapped physical address, value in/out,
/// write flag, access width in bytes. Returns whether the access was
/// handled.
pub type MmioHandler = fn(&mut ExcContext, u64, &mut u64, bool, usize) -> bool;

/// Every system register the core touches, architectural and vendor.
///
/// Keeping this closed lets the mock back the whole set with a map and
/// keeps stray register traffic out of the trap path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SysReg {
    // Exception state
    SpsrEl2,
    ElrEl2,
    EsrEl2,
    FarEl2,
    Afsr1El2,
    SpEl0,
    SpEl1,
    IsrEl1,
    MpidrEl1,

    // Hypervisor control and timers
    HcrEl2,
    CntvoffEl2,
    CntpctEl0,
    CntpCtlEl0,
    CntvCtlEl0,
    CntpCtlEl02,
    CntpCvalEl02,
    CntpTvalEl02,
    CntvCtlEl02,
    CntvCvalEl02,
    CntvTvalEl02,

    // EL1 auxiliary control, architectural alias
    ActlrEl12,

    // GIC virtual CPU interface
    IchHcrEl2,
    IchVmcrEl2,
    IchLrEl2(u8),

    // Outer-shareable TLB maintenance, trapped as sysreg writes
    TlbiVmalle1Os,
    TlbiVae1Os,
    TlbiAside1Os,
    TlbiRvae1Os,

    // Vendor performance monitor block
    AplPmcr0,
    AplPmcr1,
    AplPmcr2,
    AplPmcr3,
    AplPmcr4,
    AplPmesr0,
    AplPmesr1,
    AplPmsr,
    AplPmc(u8),

    // Vendor uncore performance monitor
    AplUpmcr0,
    AplUpmsr,

    // Vendor IPI block
    AplIpiSrEl1,
    AplIpiRrLocalEl1,
    AplIpiRrGlobalEl1,
    AplIpiCrEl1,

    // Vendor guest timer FIQ gate
    AplVmTmrFiqEnaEl2,

    // Vendor cpuidle override
    AplCycOvrd,

    // Vendor EL1 auxiliary control alias
    AplActlrEl12,

    // Noisy but harmless vendor registers, passed straight through
    AplHid4,
    AplEhid4,
    AplGxfStatusEl1,
    AplCntvctAliasEl0,
}

/// Raw system register access plus the barriers the vendor PMU sequences
/// depend on.
pub trait SysRegOps {
    /// Read a system register.
    fn mrs(&self, reg: SysReg) -> u64;
    /// Write a system register.
    fn msr(&self, reg: SysReg, val: u64);
    /// Instruction synchronization barrier.
    fn isb(&self);
    /// Full-system data memory barrier.
    fn dmb_sy(&self);
    /// Unmask SError exceptions at this EL (clear PSTATE.A).
    fn enable_serrors(&self);
}

/// Services the embedding hypervisor provides to the exception core.
pub trait HostOps {
    /// Index of the core this is running on.
    fn cpu_id(&self) -> usize;
    /// Index of the boot core, the default interruptible core.
    fn boot_cpu_id(&self) -> usize;
    /// Number of physical cores the platform runs.
    fn num_cpus(&self) -> usize;
    /// Hardware MPIDR of a core, by index.
    fn mpidr_of(&self, cpu: usize) -> u64;
    /// Whether the CPU exposes the architectural ACTLR_EL12 alias.
    fn cpufeat_actlr_el2(&self) -> bool;

    /// Translate a guest virtual address to physical. `None` on failure.
    fn translate(&self, vaddr: u64) -> Option<u64>;
    /// Redirect guest accesses in `[base, base + size)` to `handler`.
    fn map_mmio_hook(&self, base: u64, size: u64, handler: MmioHandler);
    /// Dispatch a lower-EL data abort to the registered MMIO hooks.
    fn mmio_dispatch(&self, ctx: &mut ExcContext) -> bool;

    /// Run a power-state service call. Returns whether it was handled.
    fn psci_call(&self, ctx: &mut ExcContext) -> bool;

    /// Send an exception record to the debug proxy and block for a verdict.
    fn proxy_run(&self, msg: &ProxyStartMsg) -> ProxyVerdict;

    /// Record a single-character watchdog breadcrumb.
    fn wdt_breadcrumb(&self, c: u8);
    /// Suspend the watchdog for a proxy round-trip.
    fn wdt_suspend(&self);
    /// Resume the watchdog after a proxy round-trip.
    fn wdt_resume(&self);

    /// Door-bell the cores in `mask` into the hypervisor.
    fn kick_cpus(&self, mask: u64);

    /// Poll hypervisor events on the interruptible core's tick.
    fn tick(&self, ctx: &mut ExcContext);
    /// Re-arm the hypervisor tick timer.
    fn arm_tick(&self, fast: bool);
}

/// The full seam: everything the entry points are generic over.
pub trait HvHal: SysRegOps + HostOps {}

impl<T: SysRegOps + HostOps> HvHal for T {}
