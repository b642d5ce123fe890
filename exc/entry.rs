//! Exception entry/exit sequencer
//!
//! Every trap taken from the guest passes through one of the four entry
//! points here: Guest-running -> Trap-taken -> Locked-handling ->
//! (Escalated | Locally-resolved) -> Guest-resuming.
//!
//! A fast pre-lock path exists for synchronous traps the unlocked
//! classifier fully resolves; those never touch the global lock and only
//! advance the return address and recompute virtual FIQ state.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::exc::pcpu::pcpu;
use crate::exc::proxy::{ExcCode, ProxyReason};
use crate::exc::rendezvous::{self, HV_LOCK};
use crate::exc::{
    esr_ec, esr_iss, sysreg, ExcContext, TrapOutcome, AFSR1_DISGUISED_SMC, ESR_EC_DABORT_LOWER,
    ESR_EC_IMPDEF, ESR_EC_MSR, ESR_EC_SERROR, ESR_EC_SMC, ESR_ISS_IMPDEF_MSR,
};
use crate::hal::defs::*;
use crate::hal::{HvHal, SysReg};

/// Cycles spent outside the guest's notion of time, applied to the
/// virtual counter offset on every trap exit. Mutated under the global
/// lock (and inside proxy sessions, which hold it).
static STOLEN_TIME: AtomicU64 = AtomicU64::new(0);

/// Timestamp of the most recent locked trap entry.
static EXC_ENTRY_TIME: AtomicU64 = AtomicU64::new(0);

/// Whether proxy round-trips are hidden from guest timers.
static TIME_STEALING: AtomicBool = AtomicBool::new(true);

/// Turn time stealing on or off, optionally zeroing the accumulator.
pub fn set_time_stealing(enabled: bool, reset: bool) {
    TIME_STEALING.store(enabled, Ordering::Release);
    if reset {
        STOLEN_TIME.store(0, Ordering::Release);
    }
}

/// Credit time back to the guest (a negative adjustment of the stolen
/// accumulator), used when the host replays time it owes.
pub fn add_guest_time(time: u64) {
    STOLEN_TIME.fetch_sub(time, Ordering::AcqRel);
}

pub(crate) fn stealing_enabled() -> bool {
    TIME_STEALING.load(Ordering::Acquire)
}

pub(crate) fn add_stolen(lost: u64) {
    STOLEN_TIME.fetch_add(lost, Ordering::AcqRel);
}

/// Current stolen-time accumulator value.
pub fn stolen_time() -> u64 {
    STOLEN_TIME.load(Ordering::Acquire)
}

/// Recompute whether the virtual FIQ line should be asserted.
///
/// The guest sees a FIQ if either EL0-shadowed timer has fired unmasked,
/// or an IPI or PMC interrupt is latched in the per-core shadows. Timer
/// sources are additionally gated at the hardware FIQ-enable register so
/// a delivered timer does not immediately re-trap.
fn update_fiq<H: HvHal>(hal: &H, cpu: usize) {
    let hcr = hal.mrs(SysReg::HcrEl2);
    let mut fiq_pending = false;

    let mut tmr_ena = hal.mrs(SysReg::AplVmTmrFiqEnaEl2);
    if CntCtl::fired_unmasked(hal.mrs(SysReg::CntpCtlEl02)) {
        fiq_pending = true;
        tmr_ena &= !VM_TMR_FIQ_ENA_ENA_P;
    } else {
        tmr_ena |= VM_TMR_FIQ_ENA_ENA_P;
    }
    if CntCtl::fired_unmasked(hal.mrs(SysReg::CntvCtlEl02)) {
        fiq_pending = true;
        tmr_ena &= !VM_TMR_FIQ_ENA_ENA_V;
    } else {
        tmr_ena |= VM_TMR_FIQ_ENA_ENA_V;
    }
    hal.msr(SysReg::AplVmTmrFiqEnaEl2, tmr_ena);

    let p = pcpu(cpu);
    fiq_pending |=
        p.ipi_pending.load(Ordering::Acquire) || p.pmc_pending.load(Ordering::Acquire);

    hal.isb();

    if hcr & HCR_VF != 0 && !fiq_pending {
        hal.msr(SysReg::HcrEl2, hcr & !HCR_VF);
    } else if hcr & HCR_VF == 0 && fiq_pending {
        hal.msr(SysReg::HcrEl2, hcr | HCR_VF);
    }
}

/// Locked entry actions, performed exactly once per trap before any
/// handler that needs the lock runs.
fn exc_entry<H: HvHal>(hal: &H, cpu: usize) {
    // Take SErrors in the hypervisor, but only if not already pending.
    if hal.mrs(SysReg::IsrEl1) & ISR_A == 0 {
        hal.enable_serrors();
    }

    // The in-guest bit must drop before the lock: a core spinning in a
    // rendezvous while holding the lock is watching this mask.
    rendezvous::mark_in_guest(cpu, false);
    HV_LOCK.lock();
    hal.wdt_breadcrumb(b'X');
    EXC_ENTRY_TIME.store(hal.mrs(SysReg::CntpctEl0), Ordering::Release);

    // Guest-visible counting must not advance while the hypervisor runs.
    let pmcr0 = hal.mrs(SysReg::AplPmcr0);
    pcpu(cpu)
        .exc_entry_pmcr0_cnt
        .store(pmcr0 & PMCR0_CNT_MASK, Ordering::Release);
    hal.msr(SysReg::AplPmcr0, pmcr0 & !PMCR0_CNT_MASK);
}

/// Locked exit actions, the mirror image of [`exc_entry`].
fn exc_exit<H: HvHal>(hal: &H, ctx: &ExcContext) {
    hal.wdt_breadcrumb(b'x');
    update_fiq(hal, ctx.cpu_id);

    let saved = pcpu(ctx.cpu_id).exc_entry_pmcr0_cnt.load(Ordering::Acquire);
    hal.msr(SysReg::AplPmcr0, hal.mrs(SysReg::AplPmcr0) | saved);

    hal.msr(SysReg::CntvoffEl2, STOLEN_TIME.load(Ordering::Acquire));
    HV_LOCK.unlock();
    rendezvous::mark_in_guest(ctx.cpu_id, true);

    hal.msr(SysReg::SpsrEl2, ctx.spsr);
    hal.msr(SysReg::ElrEl2, ctx.elr);
    hal.msr(SysReg::SpEl0, ctx.sp[0]);
    hal.msr(SysReg::SpEl1, ctx.sp[1]);
}

/// Synchronous exception from the guest.
pub fn handle_sync<H: HvHal>(hal: &H, ctx: &mut ExcContext) -> TrapOutcome {
    hal.wdt_breadcrumb(b'S');
    ctx.capture(hal);
    let ec = esr_ec(ctx.esr);
    let mut handled = false;

    // Pre-lock fast path.
    match ec {
        ESR_EC_MSR => {
            hal.wdt_breadcrumb(b'm');
            handled = sysreg::handle_sysreg_unlocked(hal, ctx, esr_iss(ctx.esr));
        }
        ESR_EC_SMC => {
            // Newer cores surface secure monitor calls with their own
            // exception class; the power-state handler owns them.
            hal.wdt_breadcrumb(b's');
            handled = hal.psci_call(ctx);
        }
        ESR_EC_IMPDEF => {
            hal.wdt_breadcrumb(b'a');
            if ctx.afsr1 == AFSR1_DISGUISED_SMC {
                // A secure monitor call disguised as an impdef trap; the
                // only reason a guest fires one is a power-state request.
                handled = hal.psci_call(ctx);
            } else if esr_iss(ctx.esr) == ESR_ISS_IMPDEF_MSR {
                handled = sysreg::handle_sysreg_unlocked(hal, ctx, ctx.afsr1);
            }
        }
        _ => {}
    }

    if handled {
        hal.wdt_breadcrumb(b'#');
        ctx.elr = ctx.elr.wrapping_add(4);
        hal.msr(SysReg::ElrEl2, ctx.elr);
        update_fiq(hal, ctx.cpu_id);
        hal.wdt_breadcrumb(b's');
        return TrapOutcome::Resume;
    }

    exc_entry(hal, ctx.cpu_id);

    handled = false;
    match ec {
        ESR_EC_DABORT_LOWER => {
            hal.wdt_breadcrumb(b'D');
            handled = hal.mmio_dispatch(ctx);
        }
        ESR_EC_MSR => {
            hal.wdt_breadcrumb(b'M');
            handled = sysreg::handle_sysreg_locked(hal, ctx, esr_iss(ctx.esr));
        }
        ESR_EC_IMPDEF => {
            hal.wdt_breadcrumb(b'A');
            if esr_iss(ctx.esr) == ESR_ISS_IMPDEF_MSR {
                handled = sysreg::handle_sysreg_locked(hal, ctx, ctx.afsr1);
            }
        }
        _ => {}
    }

    if handled {
        hal.wdt_breadcrumb(b'+');
        ctx.elr = ctx.elr.wrapping_add(4);
    } else {
        hal.wdt_breadcrumb(b'-');
        // Guest code can forward a nested SError exception here; keep
        // the reason distinguishable for the proxy.
        let code = if ec == ESR_EC_SERROR {
            ExcCode::SError
        } else {
            ExcCode::Sync
        };
        let out = rendezvous::exc_proxy(hal, ctx, ProxyReason::ExceptionLower, code);
        if let Some(terminal) = out.terminal() {
            return terminal;
        }
    }

    exc_exit(hal, ctx);
    hal.wdt_breadcrumb(b's');
    TrapOutcome::Resume
}

/// IRQ from the guest. Always escalates.
pub fn handle_irq<H: HvHal>(hal: &H, ctx: &mut ExcContext) -> TrapOutcome {
    hal.wdt_breadcrumb(b'I');
    ctx.capture(hal);
    exc_entry(hal, ctx.cpu_id);
    let out = rendezvous::exc_proxy(hal, ctx, ProxyReason::ExceptionLower, ExcCode::Irq);
    if let Some(terminal) = out.terminal() {
        return terminal;
    }
    exc_exit(hal, ctx);
    hal.wdt_breadcrumb(b'i');
    TrapOutcome::Resume
}

/// FIQ. The hypervisor's own timer tick, the guest timers, the vendor
/// PMU and the IPI block all arrive here.
pub fn handle_fiq<H: HvHal>(hal: &H, ctx: &mut ExcContext) -> TrapOutcome {
    let mut tick = false;

    if CntCtl::fired_unmasked(hal.mrs(SysReg::CntpCtlEl0)) {
        hal.msr(
            SysReg::CntpCtlEl0,
            (CntCtl::ISTATUS | CntCtl::IMASK | CntCtl::ENABLE).bits(),
        );
        tick = true;
    }

    let interruptible_cpu = rendezvous::pinned_cpu().unwrap_or_else(|| hal.boot_cpu_id());

    if hal.cpu_id() != interruptible_cpu
        && hal.mrs(SysReg::IsrEl1) & ISR_F == 0
        && rendezvous::want_cpu().is_none()
    {
        // Non-interruptible CPU and it was just a timer tick (or
        // spurious), so just update FIQ state and re-arm.
        update_fiq(hal, hal.cpu_id());
        hal.arm_tick(true);
        return TrapOutcome::Resume;
    }

    // Slow (single threaded) path.
    hal.wdt_breadcrumb(b'F');
    ctx.capture(hal);
    exc_entry(hal, ctx.cpu_id);

    // Only poll for hypervisor events on the interruptible CPU.
    if tick {
        if hal.cpu_id() == interruptible_cpu {
            hal.tick(ctx);
            hal.arm_tick(false);
        } else {
            hal.arm_tick(true);
        }
    }

    if CntCtl::fired_unmasked(hal.mrs(SysReg::CntvCtlEl0)) {
        hal.msr(
            SysReg::CntvCtlEl0,
            (CntCtl::ISTATUS | CntCtl::IMASK | CntCtl::ENABLE).bits(),
        );
        let out = rendezvous::exc_proxy(hal, ctx, ProxyReason::Hv, ExcCode::VTimer);
        if let Some(terminal) = out.terminal() {
            return terminal;
        }
    }

    let reg = hal.mrs(SysReg::AplPmcr0);
    if reg & (PMCR0_IMODE_MASK | PMCR0_IACT) == (PMCR0_IMODE_FIQ | PMCR0_IACT) {
        #[cfg(feature = "pmu-irq-debug")]
        log::debug!("PMC IRQ, masking and delivering to the guest");
        hal.msr(SysReg::AplPmcr0, reg & !(PMCR0_IACT | PMCR0_IMODE_MASK));
        pcpu(ctx.cpu_id).pmc_pending.store(true, Ordering::Release);
    }

    let reg = hal.mrs(SysReg::AplUpmcr0);
    if reg & UPMCR0_IMODE_MASK == UPMCR0_IMODE_FIQ && hal.mrs(SysReg::AplUpmsr) & UPMSR_IACT != 0 {
        log::warn!("uncore PMC FIQ, masking");
        hal.msr(SysReg::AplUpmcr0, reg & !UPMCR0_IMODE_MASK);
        let out = rendezvous::exc_proxy(hal, ctx, ProxyReason::ExceptionLower, ExcCode::Fiq);
        if let Some(terminal) = out.terminal() {
            return terminal;
        }
    }

    if hal.mrs(SysReg::AplIpiSrEl1) & IPI_SR_PENDING != 0 {
        let p = pcpu(ctx.cpu_id);
        if p.ipi_queued.load(Ordering::Acquire) {
            p.ipi_pending.store(true, Ordering::Release);
            p.ipi_queued.store(false, Ordering::Release);
        }
        hal.msr(SysReg::AplIpiSrEl1, IPI_SR_PENDING);
        hal.isb();
    }

    // The poll for a pending core switch lives in the FIQ tick path so
    // cores that are not expected to trap soon still observe requests.
    let out = rendezvous::maybe_switch_cpu(hal, ctx, ProxyReason::Hv, ExcCode::CpuSwitch);
    if let Some(terminal) = out.terminal() {
        return terminal;
    }

    exc_exit(hal, ctx);
    hal.wdt_breadcrumb(b'f');
    TrapOutcome::Resume
}

/// SError from the guest. Always escalates.
pub fn handle_serror<H: HvHal>(hal: &H, ctx: &mut ExcContext) -> TrapOutcome {
    hal.wdt_breadcrumb(b'E');
    ctx.capture(hal);
    exc_entry(hal, ctx.cpu_id);
    let out = rendezvous::exc_proxy(hal, ctx, ProxyReason::ExceptionLower, ExcCode::SError);
    if let Some(terminal) = out.terminal() {
        return terminal;
    }
    exc_exit(hal, ctx);
    hal.wdt_breadcrumb(b'e');
    TrapOutcome::Resume
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exc::pcpu;
    use crate::exc::proxy::ProxyVerdict;
    use crate::exc::rendezvous::{serial_lock, test_reset};
    use crate::exc::sysreg::{sysreg, SR_CNTV_CTL_EL0};
    use crate::hal::mock::MockHal;
    use crate::hal::{HostOps, SysRegOps};

    fn msr_esr(id: crate::exc::sysreg::SysRegId, rt: u64, is_read: bool) -> u64 {
        (ESR_EC_MSR << 26) | id.0 as u64 | (rt << 5) | if is_read { 1 } else { 0 }
    }

    fn prime_sync(hal: &MockHal, esr: u64, elr: u64) {
        hal.set_reg(SysReg::EsrEl2, esr);
        hal.set_reg(SysReg::ElrEl2, elr);
        hal.set_reg(SysReg::SpsrEl2, 0x3C5);
    }

    #[test]
    fn test_fast_path_skips_lock_and_advances_elr() {
        let _g = serial_lock();
        test_reset();
        pcpu::reset(0);

        let hal = MockHal::new(2);
        prime_sync(&hal, msr_esr(SR_CNTV_CTL_EL0, 3, false), 0x8000);
        let mut ctx = ExcContext::new(0);
        ctx.regs[3] = 5;

        assert_eq!(handle_sync(&hal, &mut ctx), TrapOutcome::Resume);
        assert_eq!(ctx.elr, 0x8004);
        assert_eq!(hal.mrs(SysReg::ElrEl2), 0x8004);
        assert_eq!(hal.mrs(SysReg::CntvCtlEl02), 5);
        // Fast path: no proxy, no lock traffic.
        assert!(hal.proxy_log.borrow().is_empty());
        assert!(!HV_LOCK.is_locked());
        test_reset();
    }

    #[test]
    fn test_unknown_sync_escalates_and_resumes() {
        let _g = serial_lock();
        test_reset();
        pcpu::reset(0);

        let hal = MockHal::new(2);
        // A selector no classifier knows (SCTLR_EL1).
        prime_sync(&hal, msr_esr(sysreg(3, 0, 1, 0, 0), 0, true), 0x9000);
        let mut ctx = ExcContext::new(0);

        assert_eq!(handle_sync(&hal, &mut ctx), TrapOutcome::Resume);
        let log = hal.proxy_log.borrow();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0], (ProxyReason::ExceptionLower, ExcCode::Sync));
        drop(log);
        // Escalated (not locally resolved): return address untouched.
        assert_eq!(ctx.elr, 0x9000);
        assert!(!HV_LOCK.is_locked());
        test_reset();
    }

    #[test]
    fn test_exit_guest_is_terminal_and_unlocks() {
        let _g = serial_lock();
        test_reset();
        pcpu::reset(0);

        let hal = MockHal::new(2);
        hal.proxy_verdicts.borrow_mut().push(ProxyVerdict::ExitGuest);
        prime_sync(&hal, msr_esr(sysreg(3, 0, 1, 0, 0), 0, true), 0x9000);
        let mut ctx = ExcContext::new(0);

        assert_eq!(handle_sync(&hal, &mut ctx), TrapOutcome::ExitGuest);
        assert!(!HV_LOCK.is_locked());
        // The core never marked itself back in-guest.
        assert_eq!(rendezvous::cpus_in_guest() & 1, 0);
        test_reset();
    }

    #[test]
    fn test_unhandled_verdict_is_fatal() {
        let _g = serial_lock();
        test_reset();
        pcpu::reset(0);

        let hal = MockHal::new(2);
        hal.proxy_verdicts.borrow_mut().push(ProxyVerdict::Unhandled);
        prime_sync(&hal, msr_esr(sysreg(3, 0, 1, 0, 0), 0, true), 0x9000);
        let mut ctx = ExcContext::new(0);

        assert_eq!(handle_sync(&hal, &mut ctx), TrapOutcome::FatalReboot);
        test_reset();
    }

    #[test]
    fn test_smc_goes_to_psci_without_lock() {
        let _g = serial_lock();
        test_reset();
        pcpu::reset(0);

        let hal = MockHal::new(2);
        prime_sync(&hal, ESR_EC_SMC << 26, 0xA000);
        let mut ctx = ExcContext::new(0);

        assert_eq!(handle_sync(&hal, &mut ctx), TrapOutcome::Resume);
        assert_eq!(hal.psci_calls.get(), 1);
        assert_eq!(ctx.elr, 0xA004);
        assert!(hal.proxy_log.borrow().is_empty());
        test_reset();
    }

    #[test]
    fn test_disguised_smc_routes_to_psci() {
        let _g = serial_lock();
        test_reset();
        pcpu::reset(0);

        let hal = MockHal::new(2);
        prime_sync(&hal, ESR_EC_IMPDEF << 26, 0xA000);
        hal.set_reg(SysReg::Afsr1El2, AFSR1_DISGUISED_SMC);
        let mut ctx = ExcContext::new(0);

        assert_eq!(handle_sync(&hal, &mut ctx), TrapOutcome::Resume);
        assert_eq!(hal.psci_calls.get(), 1);
        test_reset();
    }

    #[test]
    fn test_dabort_dispatches_to_mmio_hooks() {
        let _g = serial_lock();
        test_reset();
        pcpu::reset(0);

        fn hook(
            _ctx: &mut ExcContext,
            addr: u64,
            val: &mut u64,
            _write: bool,
            _width: usize,
        ) -> bool {
            *val = addr;
            true
        }

        let hal = MockHal::new(2);
        hal.map_mmio_hook(0x9_0000_0000, 0x10000, hook);
        prime_sync(&hal, ESR_EC_DABORT_LOWER << 26, 0xB000);
        hal.set_reg(SysReg::FarEl2, 0x9_0000_0040);
        let mut ctx = ExcContext::new(0);

        assert_eq!(handle_sync(&hal, &mut ctx), TrapOutcome::Resume);
        // Handled by the hook: return address advanced, no escalation.
        assert_eq!(ctx.elr, 0xB004);
        assert!(hal.proxy_log.borrow().is_empty());
        test_reset();
    }

    #[test]
    fn test_irq_always_escalates() {
        let _g = serial_lock();
        test_reset();
        pcpu::reset(0);

        let hal = MockHal::new(2);
        let mut ctx = ExcContext::new(0);
        assert_eq!(handle_irq(&hal, &mut ctx), TrapOutcome::Resume);
        assert_eq!(
            hal.proxy_log.borrow()[0],
            (ProxyReason::ExceptionLower, ExcCode::Irq)
        );
        test_reset();
    }

    #[test]
    fn test_serror_reason_is_distinct() {
        let _g = serial_lock();
        test_reset();
        pcpu::reset(0);

        let hal = MockHal::new(2);
        let mut ctx = ExcContext::new(0);
        assert_eq!(handle_serror(&hal, &mut ctx), TrapOutcome::Resume);
        assert_eq!(
            hal.proxy_log.borrow()[0],
            (ProxyReason::ExceptionLower, ExcCode::SError)
        );
        test_reset();
    }

    #[test]
    fn test_entry_saves_and_exit_restores_pmu_counters() {
        let _g = serial_lock();
        test_reset();
        pcpu::reset(0);

        let hal = MockHal::new(2);
        hal.set_reg(
            SysReg::AplPmcr0,
            PMCR0_CNT_EN_PMC0 | (1 << 5) | PMCR0_IMODE_FIQ,
        );
        prime_sync(&hal, msr_esr(sysreg(3, 0, 1, 0, 0), 0, true), 0x9000);
        let mut ctx = ExcContext::new(0);

        assert_eq!(handle_sync(&hal, &mut ctx), TrapOutcome::Resume);
        // Counter enables survived the trap; the mode field was not
        // clobbered by the save/restore.
        let pmcr0 = hal.mrs(SysReg::AplPmcr0);
        assert_eq!(pmcr0 & PMCR0_CNT_MASK, PMCR0_CNT_EN_PMC0 | (1 << 5));
        test_reset();
    }

    #[test]
    fn test_exit_applies_stolen_time() {
        let _g = serial_lock();
        test_reset();
        pcpu::reset(0);
        set_time_stealing(true, true);

        let hal = MockHal::new(2);
        // Each CNTPCT read advances the mock clock, so the proxy
        // round-trip inside the escalation accumulates stolen time.
        prime_sync(&hal, msr_esr(sysreg(3, 0, 1, 0, 0), 0, true), 0x9000);
        let mut ctx = ExcContext::new(0);

        assert_eq!(handle_sync(&hal, &mut ctx), TrapOutcome::Resume);
        let stolen = stolen_time();
        assert!(stolen > 0);
        assert_eq!(hal.mrs(SysReg::CntvoffEl2), stolen);
        set_time_stealing(true, true);
        test_reset();
    }

    #[test]
    fn test_disabled_time_stealing_accumulates_nothing() {
        let _g = serial_lock();
        test_reset();
        pcpu::reset(0);
        set_time_stealing(false, true);

        let hal = MockHal::new(2);
        prime_sync(&hal, msr_esr(sysreg(3, 0, 1, 0, 0), 0, true), 0x9000);
        let mut ctx = ExcContext::new(0);
        assert_eq!(handle_sync(&hal, &mut ctx), TrapOutcome::Resume);
        assert_eq!(stolen_time(), 0);
        set_time_stealing(true, true);
        test_reset();
    }

    #[test]
    fn test_update_fiq_latches_pending_ipi() {
        let _g = serial_lock();
        test_reset();
        pcpu::reset(1);

        let hal = MockHal::new(2);
        hal.cpu.set(1);
        pcpu::pcpu(1)
            .ipi_pending
            .store(true, Ordering::SeqCst);

        update_fiq(&hal, 1);
        assert!(hal.mrs(SysReg::HcrEl2) & HCR_VF != 0);

        pcpu::pcpu(1).ipi_pending.store(false, Ordering::SeqCst);
        update_fiq(&hal, 1);
        assert!(hal.mrs(SysReg::HcrEl2) & HCR_VF == 0);
        pcpu::reset(1);
        test_reset();
    }

    #[test]
    fn test_update_fiq_gates_fired_timer() {
        let _g = serial_lock();
        test_reset();
        pcpu::reset(0);

        let hal = MockHal::new(2);
        hal.set_reg(
            SysReg::CntvCtlEl02,
            (CntCtl::ISTATUS | CntCtl::ENABLE).bits(),
        );
        hal.set_reg(
            SysReg::AplVmTmrFiqEnaEl2,
            VM_TMR_FIQ_ENA_ENA_P | VM_TMR_FIQ_ENA_ENA_V,
        );

        update_fiq(&hal, 0);
        // Virtual timer fired: its hardware FIQ path is gated off and
        // the virtual line is raised instead.
        assert!(hal.mrs(SysReg::AplVmTmrFiqEnaEl2) & VM_TMR_FIQ_ENA_ENA_V == 0);
        assert!(hal.mrs(SysReg::AplVmTmrFiqEnaEl2) & VM_TMR_FIQ_ENA_ENA_P != 0);
        assert!(hal.mrs(SysReg::HcrEl2) & HCR_VF != 0);
        test_reset();
    }

    #[test]
    fn test_fiq_fast_tick_on_non_interruptible_core() {
        let _g = serial_lock();
        test_reset();
        pcpu::reset(1);

        let hal = MockHal::new(2);
        hal.cpu.set(1); // boot cpu is 0
        hal.set_reg(
            SysReg::CntpCtlEl0,
            (CntCtl::ISTATUS | CntCtl::ENABLE).bits(),
        );
        let mut ctx = ExcContext::new(1);

        assert_eq!(handle_fiq(&hal, &mut ctx), TrapOutcome::Resume);
        // Tick masked, fast re-arm requested, nothing escalated.
        let ctl = CntCtl::from_bits_retain(hal.mrs(SysReg::CntpCtlEl0));
        assert!(ctl.contains(CntCtl::IMASK));
        assert_eq!(hal.arm_ticks.borrow().as_slice(), &[true]);
        assert!(hal.proxy_log.borrow().is_empty());
        test_reset();
    }

    #[test]
    fn test_fiq_guest_vtimer_escalates() {
        let _g = serial_lock();
        test_reset();
        pcpu::reset(0);

        let hal = MockHal::new(2);
        hal.set_reg(
            SysReg::CntvCtlEl0,
            (CntCtl::ISTATUS | CntCtl::ENABLE).bits(),
        );
        let mut ctx = ExcContext::new(0);

        assert_eq!(handle_fiq(&hal, &mut ctx), TrapOutcome::Resume);
        assert_eq!(
            hal.proxy_log.borrow()[0],
            (ProxyReason::Hv, ExcCode::VTimer)
        );
        // The guest timer was masked so it cannot immediately re-fire.
        let ctl = CntCtl::from_bits_retain(hal.mrs(SysReg::CntvCtlEl0));
        assert!(ctl.contains(CntCtl::IMASK));
        test_reset();
    }

    #[test]
    fn test_fiq_latches_pmc_interrupt() {
        let _g = serial_lock();
        test_reset();
        pcpu::reset(0);

        let hal = MockHal::new(2);
        hal.set_reg(SysReg::AplPmcr0, PMCR0_IMODE_FIQ | PMCR0_IACT);
        let mut ctx = ExcContext::new(0);

        assert_eq!(handle_fiq(&hal, &mut ctx), TrapOutcome::Resume);
        assert!(pcpu::pcpu(0).pmc_pending.load(Ordering::SeqCst));
        // Hardware side was masked and acknowledged. The exit path
        // restores the counter-enable bits it saved on entry, which is
        // zero here, so the mode field must be clear.
        assert_eq!(
            hal.mrs(SysReg::AplPmcr0) & (PMCR0_IMODE_MASK | PMCR0_IACT),
            0
        );
        // A latched PMC raises the virtual FIQ line at exit.
        assert!(hal.mrs(SysReg::HcrEl2) & HCR_VF != 0);
        pcpu::reset(0);
        test_reset();
    }

    #[test]
    fn test_fiq_promotes_queued_ipi() {
        let _g = serial_lock();
        test_reset();
        pcpu::reset(0);

        let hal = MockHal::new(2);
        hal.set_reg(SysReg::AplIpiSrEl1, IPI_SR_PENDING);
        pcpu::queue_ipi(0);
        let mut ctx = ExcContext::new(0);

        assert_eq!(handle_fiq(&hal, &mut ctx), TrapOutcome::Resume);
        let p = pcpu::pcpu(0);
        assert!(p.ipi_pending.load(Ordering::SeqCst));
        assert!(!p.ipi_queued.load(Ordering::SeqCst));
        // Hardware IPI acked by writing the pending bit back.
        assert_eq!(hal.mrs(SysReg::AplIpiSrEl1) & IPI_SR_PENDING, 0);
        pcpu::reset(0);
        test_reset();
    }
}
