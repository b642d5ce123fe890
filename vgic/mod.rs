//! Virtual GICv3 distributor/redistributor emulation
//!
//! The CPUs implement the GIC CPU interface in hardware; only the
//! distributor and the per-core redistributors must be emulated for a
//! guest to find the interrupt controller it expects. Both register
//! blocks live behind MMIO trap windows whose bases depend on the chip's
//! physical addressing class.
//!
//! Constraints inherited from the CPU interface: one security state,
//! affinity routing always on, 16 interrupt ID bits, no extended SPI/PPI
//! ranges, eight list registers, no GICv4 direct injection and no NMIs.
//!
//! Reference: ARM IHI 0069 (GIC architecture specification).

pub mod dist;
pub mod redist;
pub mod regs;

pub use dist::Distributor;
pub use redist::Redistributor;

use heapless::Vec;

use crate::config::{ChipId, Platform, DIST_WINDOW_SIZE, MAX_CPUS, REDIST_STRIDE};
use crate::exc::ExcContext;
use crate::hal::defs::{ICH_HCR_EN, ICH_VMCR_VENG1, NUM_LIST_REGS};
use crate::hal::{HvHal, SysReg};
use crate::sync::SpinLock;
use crate::{Error, Result};

/// The whole emulated GIC: one distributor plus one redistributor per
/// configured core.
pub struct VgicState {
    platform: Platform,
    dist: Distributor,
    redists: Vec<Redistributor, MAX_CPUS>,
}

impl VgicState {
    /// Build the register files for a platform, deriving redistributor
    /// identification from each core's hardware MPIDR.
    pub fn new<H: HvHal>(hal: &H, platform: Platform) -> Self {
        let mut redists = Vec::new();
        for cpu in 0..platform.num_cpus {
            let last = cpu + 1 == platform.num_cpus;
            let _ = redists.push(Redistributor::new(cpu, hal.mpidr_of(cpu), last));
        }
        Self {
            platform,
            dist: Distributor::new(),
            redists,
        }
    }

    /// Platform this instance was configured for.
    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    /// Redistributor for a core, if configured.
    pub fn redist(&self, cpu: usize) -> Option<&Redistributor> {
        self.redists.get(cpu)
    }

    /// Trapped access into the distributor window.
    pub fn dist_access(
        &mut self,
        _ctx: &mut ExcContext,
        addr: u64,
        val: &mut u64,
        write: bool,
        width: usize,
    ) -> bool {
        let off = addr - self.platform.dist_base;
        self.dist.access(off, val, write, width)
    }

    /// Trapped access into the redistributor window.
    ///
    /// The instance is the trapping core's own; each core only ever
    /// faults into its private slice of the window.
    pub fn redist_access(
        &mut self,
        ctx: &mut ExcContext,
        addr: u64,
        val: &mut u64,
        write: bool,
        width: usize,
    ) -> bool {
        let off = (addr - self.platform.redist_base) % REDIST_STRIDE;
        match self.redists.get_mut(ctx.cpu_id) {
            Some(r) => r.access(off, val, write, width),
            None => {
                log::error!("vgic redist: access from unconfigured core {}", ctx.cpu_id);
                false
            }
        }
    }
}

/// Global instance. The lock is the explicit mutual exclusion for
/// concurrent window accesses from different cores; the trap path alone
/// does not serialize distributor state.
static VGIC: SpinLock<Option<VgicState>> = SpinLock::new(None);

fn dist_hook(ctx: &mut ExcContext, addr: u64, val: &mut u64, write: bool, width: usize) -> bool {
    match VGIC.lock().as_mut() {
        Some(v) => v.dist_access(ctx, addr, val, write, width),
        None => false,
    }
}

fn redist_hook(ctx: &mut ExcContext, addr: u64, val: &mut u64, write: bool, width: usize) -> bool {
    match VGIC.lock().as_mut() {
        Some(v) => v.redist_access(ctx, addr, val, write, width),
        None => false,
    }
}

/// Whether [`init`] has completed.
pub fn is_initialized() -> bool {
    VGIC.lock().is_some()
}

/// Run a closure against the global instance, if initialized.
pub fn with_state<R>(f: impl FnOnce(&mut VgicState) -> R) -> Result<R> {
    match VGIC.lock().as_mut() {
        Some(v) => Ok(f(v)),
        None => Err(Error::NotInitialized),
    }
}

/// Bring up the emulated GIC and install its MMIO windows.
///
/// Window bases and core count come from the chip identity table; an
/// unknown identity fails here rather than mapping windows at zero.
/// Runs exactly once.
pub fn init<H: HvHal>(hal: &H, chip: ChipId) -> Result<()> {
    let platform = Platform::for_chip(chip)?;

    let mut guard = VGIC.lock();
    if guard.is_some() {
        return Err(Error::AlreadyInitialized);
    }

    log::info!(
        "vgic: distributor at {:#x}, {} redistributors at {:#x}",
        platform.dist_base,
        platform.num_cpus,
        platform.redist_base
    );

    *guard = Some(VgicState::new(hal, platform));
    drop(guard);

    hal.map_mmio_hook(platform.dist_base, DIST_WINDOW_SIZE, dist_hook);
    hal.map_mmio_hook(platform.redist_base, platform.redist_window_size(), redist_hook);

    log::info!("vgic: initialized");
    Ok(())
}

/// Bring up the virtual CPU interface for guest use: clear the list
/// registers, then enable virtual group 1 interrupts and the interface
/// itself. The physical CPU interface routing is assumed configured by
/// earlier boot code.
pub fn enable_virtual_interrupts<H: HvHal>(hal: &H) {
    for n in 0..NUM_LIST_REGS {
        hal.msr(SysReg::IchLrEl2(n), 0);
    }
    hal.msr(SysReg::IchVmcrEl2, 0);
    hal.msr(SysReg::IchVmcrEl2, ICH_VMCR_VENG1);
    hal.msr(SysReg::IchHcrEl2, ICH_HCR_EN);
}
