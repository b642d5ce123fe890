//! Register-map mock of the hardware/host seam, for the test suite.
//!
//! System registers are backed by a map; a few registers get the side
//! effects the emulation logic depends on (the counter write latch, the
//! write-one-to-clear IPI acknowledge, the advancing cycle counter), so
//! the sequences under test are exercised for real.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::vec::Vec;

use crate::exc::proxy::{ExcCode, ProxyReason, ProxyStartMsg, ProxyVerdict};
use crate::exc::{rendezvous, ExcContext};

use super::defs::{IPI_SR_PENDING, PMCR0_CNT_EN_PMC0, PMSR_OVERFLOW_PMC0};
use super::{HostOps, MmioHandler, SysReg, SysRegOps};

/// How far the mock clock advances per CNTPCT read.
const CNTPCT_STEP: u64 = 0x10;

pub struct MockHal {
    pub regs: RefCell<BTreeMap<SysReg, u64>>,
    pub cpu: Cell<usize>,
    pub boot_cpu: usize,
    pub num_cpus: usize,
    pub actlr_el2_feat: Cell<bool>,
    /// Refuse cycle-counter writes while the counter is enabled, like
    /// the vendor hardware.
    pub latch_counter_writes: Cell<bool>,
    pub translations: RefCell<BTreeMap<u64, u64>>,
    pub hooks: RefCell<Vec<(u64, u64, MmioHandler)>>,
    pub proxy_verdicts: RefCell<Vec<ProxyVerdict>>,
    pub proxy_log: RefCell<Vec<(ProxyReason, ExcCode)>>,
    pub breadcrumbs: RefCell<Vec<u8>>,
    pub psci_result: Cell<bool>,
    pub psci_calls: Cell<usize>,
    pub kicked: Cell<u64>,
    pub ticks: Cell<usize>,
    pub arm_ticks: RefCell<Vec<bool>>,
    pub wdt_suspends: Cell<usize>,
    pub wdt_resumes: Cell<usize>,
    pub serror_unmasks: Cell<usize>,
    pub isbs: Cell<usize>,
    now: Cell<u64>,
}

impl MockHal {
    pub fn new(num_cpus: usize) -> Self {
        Self {
            regs: RefCell::new(BTreeMap::new()),
            cpu: Cell::new(0),
            boot_cpu: 0,
            num_cpus,
            actlr_el2_feat: Cell::new(false),
            latch_counter_writes: Cell::new(false),
            translations: RefCell::new(BTreeMap::new()),
            hooks: RefCell::new(Vec::new()),
            proxy_verdicts: RefCell::new(Vec::new()),
            proxy_log: RefCell::new(Vec::new()),
            breadcrumbs: RefCell::new(Vec::new()),
            psci_result: Cell::new(true),
            psci_calls: Cell::new(0),
            kicked: Cell::new(0),
            ticks: Cell::new(0),
            arm_ticks: RefCell::new(Vec::new()),
            wdt_suspends: Cell::new(0),
            wdt_resumes: Cell::new(0),
            serror_unmasks: Cell::new(0),
            isbs: Cell::new(0),
            now: Cell::new(0x1000),
        }
    }

    /// Backdoor register write without side effects.
    pub fn set_reg(&self, reg: SysReg, val: u64) {
        self.regs.borrow_mut().insert(reg, val);
    }

    fn get_reg(&self, reg: SysReg) -> u64 {
        self.regs.borrow().get(&reg).copied().unwrap_or(0)
    }
}

impl SysRegOps for MockHal {
    fn mrs(&self, reg: SysReg) -> u64 {
        match reg {
            SysReg::CntpctEl0 => {
                let t = self.now.get() + CNTPCT_STEP;
                self.now.set(t);
                t
            }
            SysReg::MpidrEl1 => self.mpidr_of(self.cpu.get()),
            _ => self.get_reg(reg),
        }
    }

    fn msr(&self, reg: SysReg, val: u64) {
        match reg {
            SysReg::AplPmc(0) => {
                if self.latch_counter_writes.get()
                    && self.get_reg(SysReg::AplPmcr0) & PMCR0_CNT_EN_PMC0 != 0
                {
                    // Write dropped: counter active.
                    return;
                }
                self.set_reg(SysReg::AplPmc(0), val);
                // Rewriting the counter drops its overflow condition.
                let pmsr = self.get_reg(SysReg::AplPmsr);
                self.set_reg(SysReg::AplPmsr, pmsr & !PMSR_OVERFLOW_PMC0);
            }
            SysReg::AplIpiSrEl1 => {
                // Write-one-to-clear acknowledge.
                let cur = self.get_reg(reg);
                self.set_reg(reg, cur & !(val & IPI_SR_PENDING));
            }
            _ => self.set_reg(reg, val),
        }
    }

    fn isb(&self) {
        self.isbs.set(self.isbs.get() + 1);
    }

    fn dmb_sy(&self) {}

    fn enable_serrors(&self) {
        self.serror_unmasks.set(self.serror_unmasks.get() + 1);
    }
}

impl HostOps for MockHal {
    fn cpu_id(&self) -> usize {
        self.cpu.get()
    }

    fn boot_cpu_id(&self) -> usize {
        self.boot_cpu
    }

    fn num_cpus(&self) -> usize {
        self.num_cpus
    }

    fn mpidr_of(&self, cpu: usize) -> u64 {
        // Four-core clusters; the second and later clusters report the
        // performance-core bit in Aff2.
        let cluster = (cpu / 4) as u64;
        let core = (cpu % 4) as u64;
        let aff2 = if cpu >= 4 { 1u64 << 16 } else { 0 };
        aff2 | (cluster << 8) | core
    }

    fn cpufeat_actlr_el2(&self) -> bool {
        self.actlr_el2_feat.get()
    }

    fn translate(&self, vaddr: u64) -> Option<u64> {
        if let Some(pa) = self.translations.borrow().get(&vaddr) {
            return Some(*pa);
        }
        Some(vaddr)
    }

    fn map_mmio_hook(&self, base: u64, size: u64, handler: MmioHandler) {
        self.hooks.borrow_mut().push((base, size, handler));
    }

    fn mmio_dispatch(&self, ctx: &mut ExcContext) -> bool {
        let addr = ctx.far;
        let hooks = self.hooks.borrow().clone();
        for (base, size, handler) in hooks {
            if addr >= base && addr < base + size {
                let mut val = ctx.regs[0];
                return handler(ctx, addr, &mut val, false, 4);
            }
        }
        false
    }

    fn psci_call(&self, _ctx: &mut ExcContext) -> bool {
        self.psci_calls.set(self.psci_calls.get() + 1);
        self.psci_result.get()
    }

    fn proxy_run(&self, msg: &ProxyStartMsg) -> ProxyVerdict {
        self.proxy_log.borrow_mut().push((msg.reason, msg.code));
        self.proxy_verdicts
            .borrow_mut()
            .pop()
            .unwrap_or(ProxyVerdict::Handled)
    }

    fn wdt_breadcrumb(&self, c: u8) {
        self.breadcrumbs.borrow_mut().push(c);
    }

    fn wdt_suspend(&self) {
        self.wdt_suspends.set(self.wdt_suspends.get() + 1);
    }

    fn wdt_resume(&self) {
        self.wdt_resumes.set(self.wdt_resumes.get() + 1);
    }

    fn kick_cpus(&self, mask: u64) {
        self.kicked.set(self.kicked.get() | mask);
        // Kicked cores take their doorbell FIQ and drop out of the guest.
        for cpu in 0..64 {
            if mask & (1 << cpu) != 0 {
                rendezvous::mark_in_guest(cpu, false);
            }
        }
    }

    fn tick(&self, _ctx: &mut ExcContext) {
        self.ticks.set(self.ticks.get() + 1);
    }

    fn arm_tick(&self, fast: bool) {
        self.arm_ticks.borrow_mut().push(fast);
    }
}
