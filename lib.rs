//! Opalvisor - exception routing and virtual interrupt controller core
//!
//! This library implements the trap-handling heart of a bare-metal type-2
//! hypervisor for ARM64 SoCs whose CPUs carry the GIC CPU interface in
//! hardware but no distributor or redistributor blocks:
//!
//! - classification and in-place emulation of trapped system register
//!   accesses, including a PMUv3 compatibility layer over the vendor
//!   single-counter performance monitor
//! - the exception entry/exit sequencer that brackets every trap taken
//!   from the guest
//! - the cross-core rendezvous and ownership protocol used by the remote
//!   debug front end
//! - a GICv3 distributor/redistributor register file emulated behind two
//!   MMIO trap windows
//!
//! Boot, stage-2 translation setup, the proxy transport and the PSCI
//! service itself live outside this crate and are reached through the
//! [`hal::HvHal`] trait.

#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate bitflags;

// Core modules
pub mod config;
pub mod utils;

// Synchronization primitives
pub mod sync;

// Hardware and host service seam
pub mod hal;

// Exception routing
pub mod exc;

// Virtual GIC distributor/redistributor emulation
pub mod vgic;

/// Opalvisor version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Common error type for Opalvisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Chip identity is not in the platform table
    UnsupportedChip,
    /// Subsystem was initialized twice
    AlreadyInitialized,
    /// Subsystem used before initialization
    NotInitialized,
    /// Core index outside the configured range
    InvalidCpu,
}

/// Result type alias
pub type Result<T> = core::result::Result<T, Error>;

// Panic handler for bare-metal builds. Hosted test builds use std's.
#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {
        #[cfg(target_arch = "aarch64")]
        aarch64_cpu::asm::wfe();

        #[cfg(not(target_arch = "aarch64"))]
        core::hint::spin_loop();
    }
}
