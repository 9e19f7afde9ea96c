// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The bus engine (C1): the three PIO programs, their DMA chains, and the
//! 32-byte register window they serve, plus the reclocking policy that
//! keeps all three state machines in lockstep with the requested PHI2.
//!
//! `clock` is pure arithmetic and host-testable; everything else here
//! (`BusEngine` and the three [`pio_programs`]) only exists on-target,
//! since it owns real PIO/DMA peripherals. `drv/action-loop` is the
//! consumer of the action-event stream this crate produces; this crate
//! has no opinion about what an event *means*, only about getting it off
//! the wire.

#![cfg_attr(not(test), no_std)]

pub mod clock;

#[cfg(target_arch = "arm")]
mod pio_programs;
#[cfg(target_arch = "arm")]
pub mod target;

#[cfg(target_arch = "arm")]
pub use target::{BusEngine, PixTx};

use ria_abi::{Regs, REGS_LEN};

/// Backing storage for the register window. 32-byte aligned so a
/// captured bus address can be turned into a slot offset by masking its
/// low 5 bits, keeping the DMA address fix-up to a five-bit mask —
/// expressed here as an alignment requirement on an allocation, not as
/// a fixed absolute address.
#[repr(align(32))]
struct RegsCell(core::cell::UnsafeCell<[u8; REGS_LEN]>);

// SAFETY: every byte of `regs` is written either by DMA off the 6502 bus
// or by firmware; a single byte is atomic with respect to the 6502's
// bus cycle, so concurrent byte-at-a-time access from both agents is
// sound. Cross-core visibility back to core 0 depends on no field wider
// than one byte being relied upon outside of a quiescent window.
unsafe impl Sync for RegsCell {}

static REGS: RegsCell = RegsCell(core::cell::UnsafeCell::new([0; REGS_LEN]));

/// Typed access to the register window. Safe to call from either core:
/// every read/write is a single aligned byte load/store, atomic with
/// respect to the 6502's bus cycle.
pub fn regs() -> &'static Regs {
    // SAFETY: `Regs` is a `#[repr(C)]` `[u8; REGS_LEN]` newtype with the
    // same layout as the cell's backing array.
    unsafe { &*(REGS.0.get() as *const Regs) }
}

/// Mutable typed access, for firmware writes (e.g. publishing `API_ERRNO`
/// or a vsync tick) that aren't going through a DMA chain.
///
/// # Safety
/// Callers must only ever mutate one byte at a time through [`Regs::set`]
/// except while the 6502 is held in reset or the relevant sub-function is
/// known quiescent.
pub unsafe fn regs_mut() -> &'static mut Regs {
    unsafe { &mut *(REGS.0.get() as *mut Regs) }
}

/// The register window's own address, for the on-target DMA/PIO wiring
/// in `target` that has to point hardware at this exact allocation.
#[cfg(target_arch = "arm")]
pub(crate) fn regs_base_addr() -> u32 {
    REGS.0.get() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regs_window_is_32_byte_aligned() {
        assert_eq!(core::mem::align_of::<RegsCell>(), 32);
    }

    #[test]
    fn byte_writes_are_visible_through_the_typed_accessor() {
        unsafe { regs_mut().set(0x00, 0x42) };
        assert_eq!(regs().get(0x00), 0x42);
    }
}
