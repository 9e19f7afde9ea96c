// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cross-core handoff. Core 1 (`action_core`) owns the bus engine, the
//! action loop, and the fast-transfer state machines; core 0 (`main`'s
//! poll loop) owns the API dispatcher, the filesystem/USB/PIX
//! collaborators, and the CPU run/reset policy. Every field here is a
//! `critical_section`-guarded `Cell`, the same primitive the bus engine
//! and PIX link already assume for state shared across the two cores —
//! there is no Hubris-style kernel IPC boundary underneath this port, so
//! a spinlock-backed critical section stands in for it directly.

use core::cell::Cell;
use critical_section::Mutex;

/// One latched API call, handed from core 1 (which saw the `API_OP`
/// write and the `API_A` shadow byte) to core 0 (which owns the
/// dispatcher).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ApiCall {
    pub opcode: u8,
    pub reg_a: u8,
}

static API_CALL: Mutex<Cell<Option<ApiCall>>> = Mutex::new(Cell::new(None));
static API_DONE: Mutex<Cell<bool>> = Mutex::new(Cell::new(false));
static REQUESTED_PHI2_KHZ: Mutex<Cell<Option<u32>>> = Mutex::new(Cell::new(None));
static CPU_COMMAND: Mutex<Cell<Option<CpuCommand>>> = Mutex::new(Cell::new(None));
static FAST_STORE_REQUEST: Mutex<Cell<Option<FastTransferRequest>>> = Mutex::new(Cell::new(None));
static FAST_LOAD_REQUEST: Mutex<Cell<Option<FastTransferRequest>>> = Mutex::new(Cell::new(None));
static FAST_TRANSFER_DONE: Mutex<Cell<bool>> = Mutex::new(Cell::new(false));
static XRAM_SUBSCRIBED_PAGE: Mutex<Cell<Option<u8>>> = Mutex::new(Cell::new(None));

/// A bulk 6502-memory transfer core 0 asks core 1 to drive: `xram_start`
/// names the already-staged byte range in the shared `xram` array,
/// `cpu_addr` the 6502 address the transfer begins at.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FastTransferRequest {
    pub cpu_addr: u16,
    pub xram_start: u16,
    pub len: u16,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CpuCommand {
    /// Pulses reset and starts (or restarts) the 6502 once the minimum
    /// RESB hold elapses; see `crate::cpu::Cpu::request_run`.
    Run,
    /// Asserts reset and holds it until a `Run` is requested again.
    Stop,
}

/// Called by core 1 when the action loop raises `ApiTrigger`. Overwrites
/// any prior unconsumed call, matching the action loop's own one-call-
/// in-flight invariant.
pub fn post_api_call(call: ApiCall) {
    critical_section::with(|cs| API_CALL.borrow(cs).set(Some(call)));
}

/// Polled by core 0's main loop.
pub fn take_api_call() -> Option<ApiCall> {
    critical_section::with(|cs| API_CALL.borrow(cs).take())
}

/// Core 0 calls this once a dispatched call (including a multi-tick
/// `Busy` one) has fully completed, so core 1 can clear the action
/// loop's busy latch and accept the next `API_OP` write.
pub fn mark_api_done() {
    critical_section::with(|cs| API_DONE.borrow(cs).set(true));
}

/// Polled by core 1 once per loop iteration.
pub fn take_api_done() -> bool {
    critical_section::with(|cs| API_DONE.borrow(cs).take())
}

pub fn request_phi2_khz(khz: u32) {
    critical_section::with(|cs| REQUESTED_PHI2_KHZ.borrow(cs).set(Some(khz)));
}

pub fn take_requested_phi2_khz() -> Option<u32> {
    critical_section::with(|cs| REQUESTED_PHI2_KHZ.borrow(cs).take())
}

pub fn request_cpu_command(cmd: CpuCommand) {
    critical_section::with(|cs| CPU_COMMAND.borrow(cs).set(Some(cmd)));
}

pub fn take_cpu_command() -> Option<CpuCommand> {
    critical_section::with(|cs| CPU_COMMAND.borrow(cs).take())
}

pub fn request_fast_store(req: FastTransferRequest) {
    critical_section::with(|cs| FAST_STORE_REQUEST.borrow(cs).set(Some(req)));
}

pub fn take_fast_store_request() -> Option<FastTransferRequest> {
    critical_section::with(|cs| FAST_STORE_REQUEST.borrow(cs).take())
}

pub fn request_fast_load(req: FastTransferRequest) {
    critical_section::with(|cs| FAST_LOAD_REQUEST.borrow(cs).set(Some(req)));
}

pub fn take_fast_load_request() -> Option<FastTransferRequest> {
    critical_section::with(|cs| FAST_LOAD_REQUEST.borrow(cs).take())
}

pub fn mark_fast_transfer_done() {
    critical_section::with(|cs| FAST_TRANSFER_DONE.borrow(cs).set(true));
}

/// Polled by core 0 when it's waiting on a fast transfer it staged.
pub fn take_fast_transfer_done() -> bool {
    critical_section::with(|cs| FAST_TRANSFER_DONE.borrow(cs).take())
}

/// Sets (or clears, with `None`) the single xram page the audio engine
/// collaborator wants mirrored into `xram::xram_queue()`. Out of scope
/// for this port — nothing currently calls this — but core 1's action
/// loop polls it every `XRAM_RW0`/`XRAM_RW1` touch via `xram_subscribed_page`.
pub fn set_xram_subscribed_page(page: Option<u8>) {
    critical_section::with(|cs| XRAM_SUBSCRIBED_PAGE.borrow(cs).set(page));
}

pub fn xram_subscribed_page() -> Option<u8> {
    critical_section::with(|cs| XRAM_SUBSCRIBED_PAGE.borrow(cs).get())
}
