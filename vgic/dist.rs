//! Virtual GICv3 distributor register file.
//!
//! Backed by plain state, never by real interrupt routing hardware; the
//! physical interrupt controller on this platform has no distributor to
//! program. Accesses are decoded against an offset policy map:
//! fixed identification registers, a filtered control register, a
//! write-one-to-clear status register, mirrored set/clear bit banks, and
//! stored-but-inert priority/configuration state.

use crate::utils::bit32;

use super::regs::*;

/// How an access was classified, for the diagnostic tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    /// Fully emulated register.
    Ok,
    /// Real register the emulation does not wire up yet.
    Unimplemented,
    /// No such register; zero/discard semantics applied.
    Unknown,
}

/// A banked bit array exposed through a set-register/clear-register pair.
///
/// Writing the set half asserts bits in both views; writing the clear
/// half drops them from both, so each register's readback always reports
/// the current state. Word zero covers the core-private interrupts and
/// is owned by the redistributors, so it is reserved here.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MirroredBank<const N: usize> {
    set_view: [u32; N],
    clr_view: [u32; N],
}

impl<const N: usize> MirroredBank<N> {
    pub(crate) const fn new() -> Self {
        Self {
            set_view: [0; N],
            clr_view: [0; N],
        }
    }

    pub(crate) fn write_set(&mut self, word: usize, val: u32) {
        for i in 0..32 {
            let b = bit32(i);
            if val & b != 0 && self.set_view[word] & b == 0 {
                self.set_view[word] |= b;
                self.clr_view[word] |= b;
            }
        }
    }

    pub(crate) fn write_clr(&mut self, word: usize, val: u32) {
        for i in 0..32 {
            let b = bit32(i);
            if val & b != 0 && self.clr_view[word] & b != 0 {
                self.set_view[word] &= !b;
                self.clr_view[word] &= !b;
            }
        }
    }

    pub(crate) fn read_set(&self, word: usize) -> u32 {
        self.set_view[word]
    }

    pub(crate) fn read_clr(&self, word: usize) -> u32 {
        self.clr_view[word]
    }

    /// Both views must agree at all times.
    #[cfg(test)]
    pub(crate) fn views_consistent(&self) -> bool {
        self.set_view == self.clr_view
    }
}

/// Distributor state, one instance per system.
#[derive(Debug)]
pub struct Distributor {
    ctlr: u32,
    typer: u32,
    iidr: u32,
    typer2: u32,
    statusr: u32,
    group: [u32; GICD_BANK_WORDS],
    enable: MirroredBank<GICD_BANK_WORDS>,
    pending: MirroredBank<GICD_BANK_WORDS>,
    active: MirroredBank<GICD_BANK_WORDS>,
    priority: [u32; GICD_PRIORITY_WORDS],
    cfg: [u32; GICD_CFG_WORDS],
}

impl Default for Distributor {
    fn default() -> Self {
        Self::new()
    }
}

impl Distributor {
    /// Fresh distributor with the fixed identification fields populated.
    pub fn new() -> Self {
        Self {
            ctlr: GICD_CTLR_INIT,
            typer: GICD_TYPER_INIT,
            iidr: GIC_IIDR_INIT,
            typer2: 0,
            statusr: 0,
            group: [0; GICD_BANK_WORDS],
            enable: MirroredBank::new(),
            pending: MirroredBank::new(),
            active: MirroredBank::new(),
            priority: [0; GICD_PRIORITY_WORDS],
            cfg: [0; GICD_CFG_WORDS],
        }
    }

    fn write_ctlr(&mut self, val: u32) {
        let mut new_val = val;
        if new_val & GICD_CTLR_RES0 != 0 {
            new_val &= !GICD_CTLR_RES0;
            log::warn!("vgic dist: GICD_CTLR write touched RES0 bits, discarding");
        }
        if new_val & GICD_CTLR_DS == 0 {
            // Only a single security state exists; DS cannot clear.
            new_val |= GICD_CTLR_DS;
            log::warn!("vgic dist: guest attempted to set DS = 0, discarding");
        }
        if new_val & GICD_CTLR_ARE == 0 {
            // Affinity routing is a property of the platform, not a choice.
            new_val |= GICD_CTLR_ARE;
            log::warn!("vgic dist: guest attempted to set ARE = 0, discarding");
        }

        let mut rwp = false;
        if (new_val ^ self.ctlr) & GICD_CTLR_EN1WF != 0 {
            rwp = true;
            log::debug!("vgic dist: guest is changing EN1WF");
        }
        if self.ctlr & GICD_CTLR_ENABLE_GRP1 != 0 && new_val & GICD_CTLR_ENABLE_GRP1 == 0 {
            rwp = true;
            log::debug!("vgic dist: guest is setting EnableGrp1 = 0");
        }
        if self.ctlr & GICD_CTLR_ENABLE_GRP0 != 0 && new_val & GICD_CTLR_ENABLE_GRP0 == 0 {
            rwp = true;
            log::debug!("vgic dist: guest is setting EnableGrp0 = 0");
        }

        // Group/wakeup transitions must be visible through the
        // write-pending bit. All their effects land within this trapped
        // access, so the pending state completes synchronously and the
        // bit reads back clear.
        self.ctlr = new_val & !GICD_CTLR_RWP;
        if rwp {
            log::debug!("vgic dist: GICD_CTLR write-pending completed synchronously");
        }
    }

    fn write_statusr(&mut self, val: u32) {
        let acked = val & !GIC_STATUSR_RES0;
        if val & GIC_STATUSR_RES0 != 0 {
            log::warn!("vgic dist: GICD_STATUSR write touched RES0 bits, discarding");
        }
        // Write one to acknowledge: only set bits clear.
        self.statusr &= !acked;
    }

    fn write(&mut self, off: u64, val: u32) -> Disposition {
        match off {
            GICD_CTLR => {
                self.write_ctlr(val);
                return Disposition::Ok;
            }
            GICD_TYPER | GICD_TYPER2 | GICD_IIDR => {
                log::warn!(
                    "vgic dist: write to read-only register {:#05x}, discarding",
                    off
                );
                return Disposition::Ok;
            }
            GICD_STATUSR => {
                self.write_statusr(val);
                return Disposition::Ok;
            }
            // Message-based SPIs are disabled, so the SPI set/clear
            // registers are reserved. Ditto GICD_SGIR under affinity
            // routing.
            GICD_SETSPI_NSR | GICD_CLRSPI_NSR | GICD_SETSPI_SR | GICD_CLRSPI_SR | GICD_SGIR => {
                return Disposition::Ok;
            }
            _ => {}
        }

        if let Some(word) = bank_word(off, GICD_IGROUPR) {
            self.group[word] = val;
            return Disposition::Ok;
        }
        if let Some(word) = bank_word(off, GICD_ISENABLER) {
            if word != 0 {
                self.enable.write_set(word, val);
            }
            return Disposition::Ok;
        }
        if let Some(word) = bank_word(off, GICD_ICENABLER) {
            if word != 0 {
                self.enable.write_clr(word, val);
            }
            return Disposition::Ok;
        }
        if let Some(word) = bank_word(off, GICD_ISPENDR) {
            if word != 0 {
                self.pending.write_set(word, val);
            }
            return Disposition::Ok;
        }
        if let Some(word) = bank_word(off, GICD_ICPENDR) {
            if word != 0 {
                self.pending.write_clr(word, val);
            }
            return Disposition::Ok;
        }
        if let Some(word) = bank_word(off, GICD_ISACTIVER) {
            if word != 0 {
                self.active.write_set(word, val);
            }
            return Disposition::Ok;
        }
        if let Some(word) = bank_word(off, GICD_ICACTIVER) {
            if word != 0 {
                self.active.write_clr(word, val);
            }
            return Disposition::Ok;
        }
        if let Some(idx) = word_index(off, GICD_IPRIORITYR, GICD_PRIORITY_WORDS) {
            // Stored so readback stays coherent; no routing effect yet.
            self.priority[idx] = val;
            return Disposition::Unimplemented;
        }
        if in_range(off, GICD_ITARGETSR, 256) {
            // Reserved while affinity routing is enabled.
            log::warn!("vgic dist: GICD_ITARGETSR is RES0, discarding write");
            return Disposition::Ok;
        }
        if let Some(idx) = word_index(off, GICD_ICFGR, GICD_CFG_WORDS) {
            self.cfg[idx] = val;
            return Disposition::Unimplemented;
        }

        Disposition::Unknown
    }

    fn read(&self, off: u64, val: &mut u32) -> Disposition {
        match off {
            GICD_CTLR => {
                *val = self.ctlr;
                return Disposition::Ok;
            }
            GICD_TYPER => {
                *val = self.typer;
                return Disposition::Ok;
            }
            GICD_TYPER2 => {
                *val = self.typer2;
                return Disposition::Ok;
            }
            GICD_IIDR => {
                *val = self.iidr;
                return Disposition::Ok;
            }
            GICD_STATUSR => {
                *val = self.statusr;
                return Disposition::Ok;
            }
            // Write-only registers read as zero.
            GICD_SETSPI_NSR | GICD_CLRSPI_NSR | GICD_SETSPI_SR | GICD_CLRSPI_SR | GICD_SGIR => {
                *val = 0;
                return Disposition::Ok;
            }
            _ => {}
        }

        if let Some(word) = bank_word(off, GICD_IGROUPR) {
            *val = self.group[word];
            return Disposition::Ok;
        }
        if let Some(word) = bank_word(off, GICD_ISENABLER) {
            *val = if word == 0 { 0 } else { self.enable.read_set(word) };
            return Disposition::Ok;
        }
        if let Some(word) = bank_word(off, GICD_ICENABLER) {
            *val = if word == 0 { 0 } else { self.enable.read_clr(word) };
            return Disposition::Ok;
        }
        if let Some(word) = bank_word(off, GICD_ISPENDR) {
            *val = if word == 0 { 0 } else { self.pending.read_set(word) };
            return Disposition::Ok;
        }
        if let Some(word) = bank_word(off, GICD_ICPENDR) {
            *val = if word == 0 { 0 } else { self.pending.read_clr(word) };
            return Disposition::Ok;
        }
        if let Some(word) = bank_word(off, GICD_ISACTIVER) {
            *val = if word == 0 { 0 } else { self.active.read_set(word) };
            return Disposition::Ok;
        }
        if let Some(word) = bank_word(off, GICD_ICACTIVER) {
            *val = if word == 0 { 0 } else { self.active.read_clr(word) };
            return Disposition::Ok;
        }
        if let Some(idx) = word_index(off, GICD_IPRIORITYR, GICD_PRIORITY_WORDS) {
            *val = self.priority[idx];
            return Disposition::Unimplemented;
        }
        if in_range(off, GICD_ITARGETSR, 256) {
            *val = 0;
            return Disposition::Ok;
        }
        if let Some(idx) = word_index(off, GICD_ICFGR, GICD_CFG_WORDS) {
            *val = self.cfg[idx];
            return Disposition::Unimplemented;
        }

        *val = 0;
        Disposition::Unknown
    }

    /// Handle one trapped access into the distributor window.
    ///
    /// Returns true even for bad accesses; the guest must never fault on
    /// this window, the diagnostic records the gap instead.
    pub fn access(&mut self, off: u64, val: &mut u64, write: bool, _width: usize) -> bool {
        let disp = if write {
            self.write(off, *val as u32)
        } else {
            let mut v = 0u32;
            let d = self.read(off, &mut v);
            *val = v as u64;
            d
        };

        let rw = if write { "write" } else { "read" };
        match disp {
            Disposition::Ok => {
                log::debug!("vgic dist: {:#05x} = {:#x} [{}]", off, *val, rw)
            }
            Disposition::Unimplemented => log::warn!(
                "vgic dist: {:#05x} = {:#x} [{}] [unimplemented]",
                off,
                *val,
                rw
            ),
            Disposition::Unknown => {
                log::error!("vgic dist: unknown register {:#05x} [{}]", off, rw)
            }
        }
        true
    }

    /// Unknown-offset probe for the window dispatcher's tests.
    #[cfg(test)]
    pub(crate) fn classify(&mut self, off: u64, write: bool) -> Disposition {
        if write {
            self.write(off, 0)
        } else {
            let mut v = 0;
            self.read(off, &mut v)
        }
    }
}

fn in_range(off: u64, base: u64, words: usize) -> bool {
    off >= base && off < base + (words as u64) * 4 && off % 4 == 0
}

fn bank_word(off: u64, base: u64) -> Option<usize> {
    if in_range(off, base, GICD_BANK_WORDS) {
        Some(((off - base) / 4) as usize)
    } else {
        None
    }
}

fn word_index(off: u64, base: u64, words: usize) -> Option<usize> {
    if in_range(off, base, words) {
        Some(((off - base) / 4) as usize)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn write(d: &mut Distributor, off: u64, v: u32) {
        let mut val = v as u64;
        assert!(d.access(off, &mut val, true, 4));
    }

    fn read(d: &mut Distributor, off: u64) -> u32 {
        let mut val = 0u64;
        assert!(d.access(off, &mut val, false, 4));
        val as u32
    }

    #[test]
    fn test_mirrored_bank_set_then_clear() {
        let mut b = MirroredBank::<4>::new();
        for i in 0..32 {
            b.write_set(2, bit32(i));
            assert_eq!(b.read_set(2) & bit32(i), bit32(i));
            assert_eq!(b.read_clr(2) & bit32(i), bit32(i));
            assert!(b.views_consistent());

            b.write_clr(2, bit32(i));
            assert_eq!(b.read_set(2) & bit32(i), 0);
            assert_eq!(b.read_clr(2) & bit32(i), 0);
            assert!(b.views_consistent());
        }
    }

    #[test]
    fn test_mirrored_bank_clear_ignores_unset_bits() {
        let mut b = MirroredBank::<1>::new();
        b.write_clr(0, 0xFFFF_FFFF);
        assert_eq!(b.read_set(0), 0);
        b.write_set(0, 0x5);
        b.write_clr(0, 0x1);
        assert_eq!(b.read_set(0), 0x4);
    }

    #[test_case(GICD_ISENABLER, GICD_ICENABLER; "enable pair")]
    #[test_case(GICD_ISPENDR, GICD_ICPENDR; "pending pair")]
    #[test_case(GICD_ISACTIVER, GICD_ICACTIVER; "active pair")]
    fn test_set_clear_pairs_mirror(set_base: u64, clr_base: u64) {
        let mut d = Distributor::new();
        // Word 1 carries interrupts 32..63; word 0 belongs to the
        // redistributors.
        for i in 0..32 {
            write(&mut d, set_base + 4, bit32(i));
            assert_eq!(read(&mut d, clr_base + 4) & bit32(i), bit32(i));
            assert_eq!(read(&mut d, set_base + 4) & bit32(i), bit32(i));

            write(&mut d, clr_base + 4, bit32(i));
            assert_eq!(read(&mut d, set_base + 4) & bit32(i), 0);
            assert_eq!(read(&mut d, clr_base + 4) & bit32(i), 0);
        }
    }

    #[test]
    fn test_ctlr_reserved_bits_never_stick() {
        let mut d = Distributor::new();
        write(&mut d, GICD_CTLR, GICD_CTLR_INIT | GICD_CTLR_RES0);
        assert_eq!(read(&mut d, GICD_CTLR) & GICD_CTLR_RES0, 0);
    }

    #[test]
    fn test_ctlr_ds_are_forced_on() {
        let mut d = Distributor::new();
        write(&mut d, GICD_CTLR, 0);
        let v = read(&mut d, GICD_CTLR);
        assert!(v & GICD_CTLR_DS != 0);
        assert!(v & GICD_CTLR_ARE != 0);
    }

    #[test]
    fn test_ctlr_group_disable_completes_synchronously() {
        let mut d = Distributor::new();
        write(&mut d, GICD_CTLR, GICD_CTLR_DS | GICD_CTLR_ARE);
        let v = read(&mut d, GICD_CTLR);
        assert_eq!(v & GICD_CTLR_ENABLE_GRP1, 0);
        // Synchronous completion: the write-pending bit reads back clear.
        assert_eq!(v & GICD_CTLR_RWP, 0);
    }

    #[test]
    fn test_statusr_write_one_to_clear() {
        let mut d = Distributor::new();
        d.statusr = 0b1010;
        write(&mut d, GICD_STATUSR, 0b0010);
        assert_eq!(read(&mut d, GICD_STATUSR), 0b1000);
        // Reserved bits in the ack are discarded.
        write(&mut d, GICD_STATUSR, 0xFFFF_FFF0);
        assert_eq!(read(&mut d, GICD_STATUSR), 0b1000);
    }

    #[test]
    fn test_identification_reads_are_idempotent_and_ro() {
        let mut d = Distributor::new();
        let t1 = read(&mut d, GICD_TYPER);
        let t2 = read(&mut d, GICD_TYPER);
        assert_eq!(t1, t2);
        assert_eq!(t1, GICD_TYPER_INIT);

        write(&mut d, GICD_TYPER, 0xFFFF_FFFF);
        assert_eq!(read(&mut d, GICD_TYPER), GICD_TYPER_INIT);
        assert_eq!(read(&mut d, GICD_IIDR), GIC_IIDR_INIT);
    }

    #[test]
    fn test_targets_registers_raz_wi() {
        let mut d = Distributor::new();
        write(&mut d, GICD_ITARGETSR + 8, 0xFFFF_FFFF);
        assert_eq!(read(&mut d, GICD_ITARGETSR + 8), 0);
    }

    #[test]
    fn test_priority_stored_but_flagged_unimplemented() {
        let mut d = Distributor::new();
        assert_eq!(d.classify(GICD_IPRIORITYR + 0x40, true), Disposition::Unimplemented);
        write(&mut d, GICD_IPRIORITYR + 0x40, 0xA0A0_A0A0);
        assert_eq!(read(&mut d, GICD_IPRIORITYR + 0x40), 0xA0A0_A0A0);
    }

    #[test]
    fn test_unknown_offset_handled_with_error_class() {
        let mut d = Distributor::new();
        // Inside the window but matching nothing: handled, reads zero,
        // and classified as an error rather than merely unimplemented.
        assert_eq!(d.classify(0xFFC, false), Disposition::Unknown);
        let mut val = 0xdead_u64;
        assert!(d.access(0xFFC, &mut val, false, 4));
        assert_eq!(val, 0);
        assert!(d.access(0xFFC, &mut val, true, 4));
    }

    #[test]
    fn test_sgi_word_zero_owned_by_redistributor() {
        let mut d = Distributor::new();
        write(&mut d, GICD_ISENABLER, 0xFFFF_FFFF);
        assert_eq!(read(&mut d, GICD_ISENABLER), 0);
        assert_eq!(read(&mut d, GICD_ICENABLER), 0);
    }

    #[test]
    fn test_write_only_registers_read_zero() {
        let mut d = Distributor::new();
        assert_eq!(read(&mut d, GICD_SETSPI_NSR), 0);
        assert_eq!(read(&mut d, GICD_SGIR), 0);
    }
}
