// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The 64KB extended-RAM array, shared between both cores the same way
//! `ria_bus_engine::regs`/`regs_mut` share the register window: core 0
//! touches it from `ApiDispatcher::dispatch`'s `ReadXram`/`WriteXram`
//! arms and while staging a fast transfer; core 1 touches it byte-at-a-time
//! servicing `XRAM_RW0`/`XRAM_RW1` and while stepping a staged fast
//! transfer. The two sides never touch overlapping ranges at the same
//! time — API calls and fast transfers are mutually exclusive phases
//! coordinated through `mailbox` — so the single aliasing `&mut` handed
//! out here is sound in practice despite `Sync` being unchecked by the
//! type system.

use ria_abi::XRAM_SIZE;
use ria_action_loop::XramQueue;

#[repr(align(4))]
struct XramCell(core::cell::UnsafeCell<[u8; XRAM_SIZE]>);

unsafe impl Sync for XramCell {}

static XRAM: XramCell = XramCell(core::cell::UnsafeCell::new([0; XRAM_SIZE]));

/// # Safety
/// Callers on the two cores must not hold overlapping slices at the same
/// time; see the module doc comment for the phase discipline that makes
/// this sound.
pub unsafe fn xram() -> &'static mut [u8; XRAM_SIZE] {
    unsafe { &mut *XRAM.0.get() }
}

/// The last-written-page mirror for the subscribed xram page (spec.md
/// §3). Unlike `XRAM` itself, this one is genuinely `Sync` — see
/// [`ria_action_loop::XramQueue`] — so it's shared by plain reference,
/// no `unsafe` accessor needed.
static XRAM_QUEUE: XramQueue = XramQueue::new();

pub fn xram_queue() -> &'static XramQueue {
    &XRAM_QUEUE
}
