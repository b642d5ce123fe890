//! Virtual GICv3 redistributor, one instance per core.
//!
//! Each core traps only into its own 128 KiB slice of the redistributor
//! window: an RD frame with control/identification/LPI state and an SGI
//! frame carrying the per-core interrupt banks. The instance is selected
//! by the trapping core's id from the exception context; there is no
//! cross-core redistributor access.

use super::dist::{Disposition, MirroredBank};
use super::regs::*;

/// Per-core redistributor state.
#[derive(Debug)]
pub struct Redistributor {
    // RD frame
    ctlr: u32,
    iidr: u32,
    typer: u64,
    statusr: u32,
    waker: u32,
    mpamidr: u32,
    partidr: u32,
    setlpir: u64,
    clrlpir: u64,
    propbaser: u64,
    pendbaser: u64,
    invlpir: u64,

    // SGI frame
    igroupr0: u32,
    enable: MirroredBank<1>,
    pending: MirroredBank<1>,
    active: MirroredBank<1>,
    ipriorityr: [u32; GICR_PRIORITY_WORDS],
    icfgr0: u32,
    icfgr1: u32,
    igrpmodr0: u32,
    nsacr: u32,
}

impl Redistributor {
    /// Build the redistributor for `cpu`, deriving its identification
    /// from the core's hardware MPIDR. Exactly one instance, the highest
    /// core index, carries the "last in sequence" flag.
    pub fn new(cpu: usize, mpidr: u64, last: bool) -> Self {
        Self {
            ctlr: GICR_CTLR_INIT,
            iidr: GIC_IIDR_INIT,
            typer: redist_typer(cpu, mpidr, last),
            statusr: 0,
            waker: GICR_WAKER_INIT,
            mpamidr: 0,
            partidr: 0,
            setlpir: 0,
            clrlpir: 0,
            propbaser: 0,
            pendbaser: 0,
            invlpir: 0,
            igroupr0: 0,
            enable: MirroredBank::new(),
            pending: MirroredBank::new(),
            active: MirroredBank::new(),
            ipriorityr: [0; GICR_PRIORITY_WORDS],
            icfgr0: 0,
            icfgr1: 0,
            igrpmodr0: 0,
            nsacr: 0,
        }
    }

    /// Affinity-derived identification, stable after init.
    pub fn typer(&self) -> u64 {
        self.typer
    }

    /// Whether this is the last redistributor in the sequence.
    pub fn is_last(&self) -> bool {
        self.typer & GICR_TYPER_LAST != 0
    }

    fn write_ctlr(&mut self, val: u32) {
        let mut new_val = val;
        if new_val & GICR_CTLR_RES0 != 0 {
            new_val &= !GICR_CTLR_RES0;
            log::warn!("vgic redist: GICR_CTLR write touched RES0 bits, discarding");
        }
        // Single security state: the secure group-1 wakeup disable is
        // RAZ/WI.
        new_val &= !GICR_CTLR_DPG1S;

        let mut rwp = false;
        if (new_val ^ self.ctlr) & (GICR_CTLR_DPG1NS | GICR_CTLR_DPG0) != 0 {
            rwp = true;
        }
        if new_val & GICR_CTLR_RO != self.ctlr & GICR_CTLR_RO {
            new_val = (new_val & !GICR_CTLR_RO) | (self.ctlr & GICR_CTLR_RO);
            log::warn!("vgic redist: GICR_CTLR write touched read-only bits, discarding");
        }
        if (new_val ^ self.ctlr) & GICR_CTLR_ENABLE_LPIS != 0 {
            rwp = true;
        }

        self.ctlr = new_val & !GICR_CTLR_RWP;
        if rwp {
            log::debug!("vgic redist: GICR_CTLR write-pending completed synchronously");
        }
    }

    fn write_statusr(&mut self, val: u32) {
        let acked = val & !GIC_STATUSR_RES0;
        if val & GIC_STATUSR_RES0 != 0 {
            log::warn!("vgic redist: GICR_STATUSR write touched RES0 bits, discarding");
        }
        self.statusr &= !acked;
    }

    fn write_rd(&mut self, off: u64, val: u64) -> Disposition {
        match off {
            GICR_CTLR => {
                self.write_ctlr(val as u32);
                Disposition::Ok
            }
            GICR_IIDR | GICR_TYPER | GICR_MPAMIDR => {
                log::warn!(
                    "vgic redist: write to read-only register {:#05x}, discarding",
                    off
                );
                Disposition::Ok
            }
            GICR_STATUSR => {
                self.write_statusr(val as u32);
                Disposition::Ok
            }
            GICR_WAKER => {
                self.waker = val as u32;
                Disposition::Ok
            }
            GICR_PARTIDR => {
                self.partidr = val as u32;
                Disposition::Ok
            }
            GICR_SETLPIR => {
                self.setlpir = val;
                log::warn!("vgic redist: GICR_SETLPIR is currently unimplemented");
                Disposition::Unimplemented
            }
            GICR_CLRLPIR => {
                self.clrlpir = val;
                log::warn!("vgic redist: GICR_CLRLPIR is currently unimplemented");
                Disposition::Unimplemented
            }
            GICR_PROPBASER => {
                self.propbaser = val;
                Disposition::Ok
            }
            GICR_PENDBASER => {
                self.pendbaser = val;
                Disposition::Ok
            }
            GICR_INVLPIR => {
                // INTID bits above 16 are unused with 16 ID bits.
                self.invlpir = val;
                log::warn!("vgic redist: GICR_INVLPIR is currently unimplemented");
                Disposition::Unimplemented
            }
            GICR_INVALLR => {
                // Any write invalidates all LPI configuration; the bits
                // themselves are RES0.
                log::warn!("vgic redist: GICR_INVALLR is currently unimplemented");
                Disposition::Unimplemented
            }
            GICR_SYNCR => {
                log::warn!("vgic redist: write to read-only GICR_SYNCR, discarding");
                Disposition::Ok
            }
            _ => Disposition::Unknown,
        }
    }

    fn read_rd(&self, off: u64, val: &mut u64) -> Disposition {
        match off {
            GICR_CTLR => {
                *val = self.ctlr as u64;
                Disposition::Ok
            }
            GICR_IIDR => {
                *val = self.iidr as u64;
                Disposition::Ok
            }
            GICR_TYPER => {
                *val = self.typer;
                Disposition::Ok
            }
            GICR_STATUSR => {
                *val = self.statusr as u64;
                Disposition::Ok
            }
            GICR_WAKER => {
                *val = self.waker as u64;
                Disposition::Ok
            }
            GICR_MPAMIDR => {
                *val = self.mpamidr as u64;
                Disposition::Ok
            }
            GICR_PARTIDR => {
                *val = self.partidr as u64;
                Disposition::Ok
            }
            // Write-only LPI poke registers read as zero.
            GICR_SETLPIR | GICR_CLRLPIR | GICR_INVLPIR | GICR_INVALLR => {
                *val = 0;
                Disposition::Ok
            }
            GICR_PROPBASER => {
                *val = self.propbaser;
                Disposition::Ok
            }
            GICR_PENDBASER => {
                *val = self.pendbaser;
                Disposition::Ok
            }
            // No register write is ever left in flight, so the sync
            // register always reads idle.
            GICR_SYNCR => {
                *val = 0;
                Disposition::Ok
            }
            _ => {
                *val = 0;
                Disposition::Unknown
            }
        }
    }

    fn write_sgi(&mut self, off: u64, val: u64) -> Disposition {
        let v = val as u32;
        match off {
            GICR_IGROUPR0 => {
                self.igroupr0 = v;
                Disposition::Ok
            }
            GICR_ISENABLER0 => {
                self.enable.write_set(0, v);
                Disposition::Ok
            }
            GICR_ICENABLER0 => {
                self.enable.write_clr(0, v);
                Disposition::Ok
            }
            GICR_ISPENDR0 => {
                self.pending.write_set(0, v);
                Disposition::Ok
            }
            GICR_ICPENDR0 => {
                self.pending.write_clr(0, v);
                Disposition::Ok
            }
            GICR_ISACTIVER0 => {
                self.active.write_set(0, v);
                Disposition::Ok
            }
            GICR_ICACTIVER0 => {
                self.active.write_clr(0, v);
                Disposition::Ok
            }
            GICR_ICFGR0 => {
                self.icfgr0 = v;
                Disposition::Unimplemented
            }
            GICR_ICFGR1 => {
                self.icfgr1 = v;
                Disposition::Unimplemented
            }
            GICR_IGRPMODR0 => {
                self.igrpmodr0 = v;
                Disposition::Ok
            }
            GICR_NSACR => {
                self.nsacr = v;
                Disposition::Ok
            }
            _ => {
                if let Some(idx) = priority_index(off) {
                    // Stored for readback; not wired to delivery yet.
                    self.ipriorityr[idx] = v;
                    return Disposition::Unimplemented;
                }
                Disposition::Unknown
            }
        }
    }

    fn read_sgi(&self, off: u64, val: &mut u64) -> Disposition {
        match off {
            GICR_IGROUPR0 => {
                *val = self.igroupr0 as u64;
                Disposition::Ok
            }
            GICR_ISENABLER0 => {
                *val = self.enable.read_set(0) as u64;
                Disposition::Ok
            }
            GICR_ICENABLER0 => {
                *val = self.enable.read_clr(0) as u64;
                Disposition::Ok
            }
            GICR_ISPENDR0 => {
                *val = self.pending.read_set(0) as u64;
                Disposition::Ok
            }
            GICR_ICPENDR0 => {
                *val = self.pending.read_clr(0) as u64;
                Disposition::Ok
            }
            GICR_ISACTIVER0 => {
                *val = self.active.read_set(0) as u64;
                Disposition::Ok
            }
            GICR_ICACTIVER0 => {
                *val = self.active.read_clr(0) as u64;
                Disposition::Ok
            }
            GICR_ICFGR0 => {
                *val = self.icfgr0 as u64;
                Disposition::Unimplemented
            }
            GICR_ICFGR1 => {
                *val = self.icfgr1 as u64;
                Disposition::Unimplemented
            }
            GICR_IGRPMODR0 => {
                *val = self.igrpmodr0 as u64;
                Disposition::Ok
            }
            GICR_NSACR => {
                *val = self.nsacr as u64;
                Disposition::Ok
            }
            _ => {
                if let Some(idx) = priority_index(off) {
                    *val = self.ipriorityr[idx] as u64;
                    return Disposition::Unimplemented;
                }
                *val = 0;
                Disposition::Unknown
            }
        }
    }

    /// Handle one trapped access into this core's redistributor slice.
    ///
    /// `off` is relative to the slice base; the SGI frame starts at
    /// [`GICR_SGI_FRAME`]. Always returns handled; gaps surface as
    /// diagnostics, never as guest faults.
    pub fn access(&mut self, off: u64, val: &mut u64, write: bool, _width: usize) -> bool {
        let (frame, frame_off) = if off < GICR_SGI_FRAME {
            ("rd", off)
        } else {
            ("sgi", off - GICR_SGI_FRAME)
        };

        let disp = if write {
            if off < GICR_SGI_FRAME {
                self.write_rd(frame_off, *val)
            } else {
                self.write_sgi(frame_off, *val)
            }
        } else {
            let mut v = 0u64;
            let d = if off < GICR_SGI_FRAME {
                self.read_rd(frame_off, &mut v)
            } else {
                self.read_sgi(frame_off, &mut v)
            };
            *val = v;
            d
        };

        let rw = if write { "write" } else { "read" };
        match disp {
            Disposition::Ok => log::debug!(
                "vgic redist: {} {:#05x} = {:#x} [{}]",
                frame,
                frame_off,
                *val,
                rw
            ),
            Disposition::Unimplemented => log::warn!(
                "vgic redist: {} {:#05x} = {:#x} [{}] [unimplemented]",
                frame,
                frame_off,
                *val,
                rw
            ),
            Disposition::Unknown => log::error!(
                "vgic redist: unknown register {} {:#05x} [{}]",
                frame,
                frame_off,
                rw
            ),
        }
        true
    }
}

fn priority_index(off: u64) -> Option<usize> {
    if (GICR_IPRIORITYR..GICR_IPRIORITYR + (GICR_PRIORITY_WORDS as u64) * 4).contains(&off)
        && off % 4 == 0
    {
        Some(((off - GICR_IPRIORITYR) / 4) as usize)
    } else {
        None
    }
}
