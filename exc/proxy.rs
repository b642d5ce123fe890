//! Debug-proxy escalation channel
//!
//! The one place where state crosses the host/guest trust boundary during
//! a trap: an exception record is serialized to the external monitor and
//! its verdict decides what the sequencer does next. The stolen-time
//! measurement window opens and closes here, and the watchdog is parked
//! for the duration of the round-trip so a long interactive session does
//! not trip it. A stuck proxy is therefore not caught by the watchdog;
//! that trade is deliberate.

use crate::exc::{entry, rendezvous, spsr_el, ExcContext, TrapOutcome};
use crate::hal::{HvHal, SysReg};

/// Why a record is being sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyReason {
    /// A trap taken from the lesser-privileged guest.
    ExceptionLower,
    /// A hypervisor-internal event (virtual timer, core switch).
    Hv,
}

/// Sub-code qualifying the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExcCode {
    Sync,
    Irq,
    Fiq,
    SError,
    VTimer,
    CpuSwitch,
}

/// Start-of-session message handed to the proxy transport.
#[derive(Debug)]
pub struct ProxyStartMsg<'a> {
    pub reason: ProxyReason,
    pub code: ExcCode,
    pub info: &'a ExcContext,
}

/// The proxy's answer. Anything the transport cannot map onto the first
/// two variants must be reported as `Unhandled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyVerdict {
    /// Resolved; resume the guest.
    Handled,
    /// Tear the guest down and hand the machine back to the host.
    ExitGuest,
    /// Nobody can deal with this trap.
    Unhandled,
}

/// Result of one escalation, for the sequencer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EscalateOutcome {
    /// Verdict was "handled"; continue exit sequencing.
    Resumed,
    /// Guest exit ordered. The global lock has been released.
    ExitGuest,
    /// Unhandled; guest state is dumped, the caller must reboot.
    Fatal,
}

impl EscalateOutcome {
    /// Map a non-resuming outcome onto the terminal trap outcome.
    pub(crate) fn terminal(self) -> Option<TrapOutcome> {
        match self {
            EscalateOutcome::Resumed => None,
            EscalateOutcome::ExitGuest => Some(TrapOutcome::ExitGuest),
            EscalateOutcome::Fatal => Some(TrapOutcome::FatalReboot),
        }
    }
}

/// Run one proxy session for this record and apply the verdict.
///
/// Callers hold the global hypervisor lock. On an exit-guest verdict the
/// lock is released here and never reacquired.
pub(crate) fn run_proxy<H: HvHal>(
    hal: &H,
    ctx: &mut ExcContext,
    reason: ProxyReason,
    code: ExcCode,
) -> EscalateOutcome {
    hal.wdt_breadcrumb(b'P');

    // Get all the CPUs into the hypervisor before running the proxy, so
    // they all exit to the guest with a consistent time offset.
    if entry::stealing_enabled() {
        rendezvous::rendezvous(hal);
    }

    let entry_time = hal.mrs(SysReg::CntpctEl0);

    // The proxy works on physical addresses; translate up front so it
    // does not have to walk guest page tables.
    let from_el = spsr_el(ctx.spsr);
    ctx.elr_phys = hal.translate(ctx.elr).unwrap_or(0);
    ctx.far_phys = hal.translate(ctx.far).unwrap_or(0);
    let sp = if from_el == 0 { ctx.sp[0] } else { ctx.sp[1] };
    ctx.sp_phys = hal.translate(sp).unwrap_or(0);

    hal.wdt_suspend();
    let verdict = hal.proxy_run(&ProxyStartMsg {
        reason,
        code,
        info: ctx,
    });
    hal.wdt_resume();

    match verdict {
        ProxyVerdict::Handled => {
            hal.wdt_breadcrumb(b'p');
            if entry::stealing_enabled() {
                let lost = hal.mrs(SysReg::CntpctEl0).wrapping_sub(entry_time);
                entry::add_stolen(lost);
            }
            EscalateOutcome::Resumed
        }
        ProxyVerdict::ExitGuest => {
            rendezvous::rendezvous(hal);
            rendezvous::HV_LOCK.unlock();
            EscalateOutcome::ExitGuest
        }
        ProxyVerdict::Unhandled => {
            log::error!("Guest exception not handled, rebooting.");
            dump_guest_regs(ctx);
            EscalateOutcome::Fatal
        }
    }
}

fn dump_guest_regs(ctx: &ExcContext) {
    for row in 0..8 {
        let i = row * 4;
        log::error!(
            "x{:<2}={:016x} x{:<2}={:016x} x{:<2}={:016x} x{:<2}={:016x}",
            i,
            ctx.regs[i],
            i + 1,
            ctx.regs[i + 1],
            i + 2,
            ctx.regs[i + 2],
            i + 3,
            ctx.regs[i + 3]
        );
    }
    log::error!(
        "spsr={:#x} elr={:#x} esr={:#x} far={:#x} cpu={}",
        ctx.spsr,
        ctx.elr,
        ctx.esr,
        ctx.far,
        ctx.cpu_id
    );
}
