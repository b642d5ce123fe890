//! Per-core exception state
//!
//! One record per physical core, in a fixed table indexed by core id.
//! A core only ever mutates its own record, with a single exception:
//! the IPI bookkeeping flags are written into the *target* core's record
//! by the locked IPI send path.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::config::MAX_CPUS;

/// Per-core record, cache-line aligned so cores do not false-share.
#[repr(align(64))]
pub struct PcpuState {
    /// An IPI was requested for this core but not yet observed by it.
    pub ipi_queued: AtomicBool,
    /// An IPI was delivered and awaits guest acknowledgment.
    pub ipi_pending: AtomicBool,
    /// A performance monitor interrupt is latched for injection.
    pub pmc_pending: AtomicBool,
    /// Guest-programmed interrupt delivery mode for the cycle counter.
    /// Shadowed because the hardware register is reprogrammed by the
    /// hypervisor and cannot represent "armed but not yet fired".
    pub pmc_irq_mode: AtomicU64,
    /// Counter-enable bits stashed on trap entry, restored on exit.
    pub exc_entry_pmcr0_cnt: AtomicU64,
}

impl PcpuState {
    const fn new() -> Self {
        Self {
            ipi_queued: AtomicBool::new(false),
            ipi_pending: AtomicBool::new(false),
            pmc_pending: AtomicBool::new(false),
            pmc_irq_mode: AtomicU64::new(0),
            exc_entry_pmcr0_cnt: AtomicU64::new(0),
        }
    }
}

const PCPU_INIT: PcpuState = PcpuState::new();

static PCPU: [PcpuState; MAX_CPUS] = [PCPU_INIT; MAX_CPUS];

/// Record of the core currently handling a trap.
///
/// Callers resolve their core id once per trap (it is captured in the
/// exception context) and must not index other cores through this.
pub fn pcpu(cpu_id: usize) -> &'static PcpuState {
    &PCPU[cpu_id]
}

/// Queue an IPI towards another core's record.
///
/// This is the only sanctioned cross-core write into the table, and it
/// happens before the hardware IPI send so the signal can never be
/// observed without its bookkeeping.
pub fn queue_ipi(target: usize) {
    PCPU[target].ipi_queued.store(true, Ordering::Release);
}

/// Reset one core's record. Test scaffolding.
#[cfg(test)]
pub fn reset(cpu_id: usize) {
    let p = &PCPU[cpu_id];
    p.ipi_queued.store(false, Ordering::SeqCst);
    p.ipi_pending.store(false, Ordering::SeqCst);
    p.pmc_pending.store(false, Ordering::SeqCst);
    p.pmc_irq_mode.store(0, Ordering::SeqCst);
    p.exc_entry_pmcr0_cnt.store(0, Ordering::SeqCst);
}
