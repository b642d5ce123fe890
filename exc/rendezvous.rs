//! CPU rendezvous and ownership arbitration
//!
//! One core at a time may drive the external proxy session. Any core can
//! ask for a *specific other* core to be the one that enters the proxy
//! (so an operator can inspect that core's state), and a core can pin
//! itself so no other core reaches the proxy until unpinned.
//!
//! The waiting protocol is deliberately "release, poll, reacquire": a
//! core that must wait for another core's session drops the global lock
//! first, spins with a barrier per iteration, and only then takes the
//! lock back. Spinning while holding the lock would deadlock the very
//! core everyone is waiting for.

use core::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::exc::proxy::{self, EscalateOutcome, ExcCode, ProxyReason};
use crate::exc::ExcContext;
use crate::hal::HvHal;
use crate::sync::RawSpinLock;

/// Sentinel for "no core".
pub const NO_CPU: i64 = -1;

/// The global hypervisor lock. Totally orders all locked-path trap
/// handling across cores.
pub(crate) static HV_LOCK: RawSpinLock = RawSpinLock::new();

/// Bitmask of cores currently executing guest code.
static CPUS_IN_GUEST: AtomicU64 = AtomicU64::new(0);

/// Core holding exclusive proxy access, or [`NO_CPU`].
static PINNED_CPU: AtomicI64 = AtomicI64::new(NO_CPU);

/// Core requested to take over the proxy next, or [`NO_CPU`].
static WANT_CPU: AtomicI64 = AtomicI64::new(NO_CPU);

/// Core currently pinned, if any.
pub fn pinned_cpu() -> Option<usize> {
    match PINNED_CPU.load(Ordering::Acquire) {
        NO_CPU => None,
        cpu => Some(cpu as usize),
    }
}

/// Core a switch has been requested towards, if any.
pub fn want_cpu() -> Option<usize> {
    match WANT_CPU.load(Ordering::Acquire) {
        NO_CPU => None,
        cpu => Some(cpu as usize),
    }
}

/// Pin proxy access to one core, or unpin with `None`.
pub fn set_pinned_cpu(cpu: Option<usize>) {
    PINNED_CPU.store(cpu.map_or(NO_CPU, |c| c as i64), Ordering::Release);
}

/// Request that a specific core be the next to enter the proxy.
///
/// Returns false if another switch request is still outstanding.
pub fn request_cpu_switch(cpu: usize) -> bool {
    WANT_CPU
        .compare_exchange(NO_CPU, cpu as i64, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
}

/// Flip this core's bit in the in-guest mask.
///
/// Clearing happens before the global lock is taken on trap entry, so a
/// core waiting in [`rendezvous`] while holding the lock still observes
/// the transition.
pub(crate) fn mark_in_guest(cpu: usize, in_guest: bool) {
    let bit = 1u64 << cpu;
    if in_guest {
        CPUS_IN_GUEST.fetch_or(bit, Ordering::AcqRel);
    } else {
        CPUS_IN_GUEST.fetch_and(!bit, Ordering::AcqRel);
    }
}

/// Current in-guest mask.
pub fn cpus_in_guest() -> u64 {
    CPUS_IN_GUEST.load(Ordering::Acquire)
}

/// Stop the world: force every core out of the guest and wait until all
/// of them have acknowledged by clearing their in-guest bit.
pub(crate) fn rendezvous<H: HvHal>(hal: &H) {
    let me = 1u64 << hal.cpu_id();
    let others = CPUS_IN_GUEST.load(Ordering::Acquire) & !me;
    if others != 0 {
        hal.kick_cpus(others);
    }
    while CPUS_IN_GUEST.load(Ordering::Acquire) & !me != 0 {
        hal.dmb_sy();
    }
}

fn blocked(me: i64) -> bool {
    let pinned = PINNED_CPU.load(Ordering::Acquire);
    (pinned != NO_CPU && pinned != me) || WANT_CPU.load(Ordering::Acquire) != NO_CPU
}

/// Arbitrated escalation.
///
/// Waits while another core is pinned or being switched to, handles a
/// switch request aimed at this core, then runs the proxy session for
/// the actual exception, and finally re-checks for a switch request that
/// handling the exception may itself have raised.
pub(crate) fn exc_proxy<H: HvHal>(
    hal: &H,
    ctx: &mut ExcContext,
    reason: ProxyReason,
    code: ExcCode,
) -> EscalateOutcome {
    let me = hal.cpu_id() as i64;

    while blocked(me) {
        if WANT_CPU.load(Ordering::Acquire) == me {
            WANT_CPU.store(NO_CPU, Ordering::Release);
            match proxy::run_proxy(hal, ctx, reason, code) {
                EscalateOutcome::Resumed => {}
                other => return other,
            }
        } else {
            // Unlock so the target core can get into the proxy.
            HV_LOCK.unlock();
            while blocked(me) {
                hal.dmb_sy();
            }
            HV_LOCK.lock();
        }
    }

    // Handle the actual exception. We still tell the host the real
    // reason code even if a switch was serviced above.
    match proxy::run_proxy(hal, ctx, reason, code) {
        EscalateOutcome::Resumed => {}
        other => return other,
    }

    maybe_switch_cpu(hal, ctx, reason, code)
}

/// Service a pending core-switch request without returning to the guest.
///
/// Must run after the immediate trap is handled: the act of handling it
/// may be exactly what raised the request.
pub(crate) fn maybe_switch_cpu<H: HvHal>(
    hal: &H,
    ctx: &mut ExcContext,
    reason: ProxyReason,
    code: ExcCode,
) -> EscalateOutcome {
    let me = hal.cpu_id() as i64;
    while WANT_CPU.load(Ordering::Acquire) != NO_CPU {
        if WANT_CPU.load(Ordering::Acquire) == me {
            WANT_CPU.store(NO_CPU, Ordering::Release);
            match proxy::run_proxy(hal, ctx, reason, code) {
                EscalateOutcome::Resumed => {}
                other => return other,
            }
        } else {
            HV_LOCK.unlock();
            while WANT_CPU.load(Ordering::Acquire) != NO_CPU {
                hal.dmb_sy();
            }
            HV_LOCK.lock();
        }
    }
    EscalateOutcome::Resumed
}

/// Serialize tests that touch the process-wide arbitration state.
#[cfg(test)]
pub(crate) fn serial_lock() -> std::sync::MutexGuard<'static, ()> {
    static TEST_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());
    TEST_MUTEX.lock().unwrap_or_else(|e| e.into_inner())
}

/// Reset the arbitration state. Test scaffolding.
#[cfg(test)]
pub(crate) fn test_reset() {
    PINNED_CPU.store(NO_CPU, Ordering::SeqCst);
    WANT_CPU.store(NO_CPU, Ordering::SeqCst);
    CPUS_IN_GUEST.store(0, Ordering::SeqCst);
    if HV_LOCK.is_locked() {
        HV_LOCK.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exc::proxy::ProxyVerdict;
    use crate::hal::mock::MockHal;

    #[test]
    fn test_switch_request_is_exclusive() {
        let _g = serial_lock();
        test_reset();

        // Two rendezvous requests: exactly one wins, the flag moves
        // unset -> set once, and the loser retries after it clears.
        assert!(request_cpu_switch(1));
        assert!(!request_cpu_switch(2));
        assert_eq!(want_cpu(), Some(1));

        WANT_CPU.store(NO_CPU, Ordering::SeqCst);
        assert!(request_cpu_switch(2));
        assert_eq!(want_cpu(), Some(2));
        test_reset();
    }

    #[test]
    fn test_wanted_core_enters_proxy_and_clears_flag() {
        let _g = serial_lock();
        test_reset();

        let hal = MockHal::new(4);
        hal.cpu.set(1);
        let mut ctx = ExcContext::new(1);

        assert!(request_cpu_switch(1));
        HV_LOCK.lock();
        let out = exc_proxy(&hal, &mut ctx, ProxyReason::ExceptionLower, ExcCode::Sync);
        HV_LOCK.unlock();

        assert_eq!(out, EscalateOutcome::Resumed);
        assert_eq!(want_cpu(), None);
        // One session for the switch, one for the exception itself.
        assert_eq!(hal.proxy_log.borrow().len(), 2);
        test_reset();
    }

    #[test]
    fn test_exit_guest_releases_lock() {
        let _g = serial_lock();
        test_reset();

        let hal = MockHal::new(4);
        hal.proxy_verdicts.borrow_mut().push(ProxyVerdict::ExitGuest);
        let mut ctx = ExcContext::new(0);

        HV_LOCK.lock();
        let out = exc_proxy(&hal, &mut ctx, ProxyReason::ExceptionLower, ExcCode::Sync);
        assert_eq!(out, EscalateOutcome::ExitGuest);
        assert!(!HV_LOCK.is_locked());
        test_reset();
    }

    #[test]
    fn test_rendezvous_kicks_guest_cores() {
        let _g = serial_lock();
        test_reset();

        let hal = MockHal::new(4);
        // This core (0) is in the hypervisor; no one else is in guest, so
        // the rendezvous completes immediately without kicking.
        rendezvous(&hal);
        assert_eq!(hal.kicked.get(), 0);

        // With core 2 in the guest, the mock drops the bit when kicked.
        mark_in_guest(2, true);
        rendezvous(&hal);
        assert_eq!(hal.kicked.get(), 1 << 2);
        assert_eq!(cpus_in_guest() & (1 << 2), 0);
        test_reset();
    }

    #[test]
    fn test_in_guest_mask() {
        let _g = serial_lock();
        test_reset();
        mark_in_guest(0, true);
        mark_in_guest(3, true);
        assert_eq!(cpus_in_guest(), 0b1001);
        mark_in_guest(0, false);
        assert_eq!(cpus_in_guest(), 0b1000);
        test_reset();
    }
}
