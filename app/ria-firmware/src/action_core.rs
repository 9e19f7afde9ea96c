// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Core 1's run loop: a tight, non-yielding poll of the action-event
//! FIFO (spec.md's "Core B"). Owns the [`ria_bus_engine::BusEngine`],
//! the [`ria_action_loop::ActionLoop`] dispatch decision, the reset
//! timing policy in [`crate::cpu`], and the two fast-transfer state
//! machines in `ria_fastio`. Never touches the filesystem, USB, or PIX
//! directly — those consequences cross to core 0 through
//! [`crate::mailbox`].

use crate::console::ActionUart;
use crate::cpu::{Cpu, CpuAction};
use crate::mailbox::{self, CpuCommand};
use crate::xram;
use ria_abi::offset;
use ria_action_loop::{ActionEffect, ActionEvent, ActionLoop, XramPageSink};
use ria_bus_engine::clock::{achieved_phi2_khz, compute_phi2_clocks, reset_us};
use ria_bus_engine::BusEngine;
use ria_fastio::{FastLoad, FastStore, TransferPhase};
use rp2040_hal::gpio::PinId;
use rp2040_hal::pac::PIO0;

enum FastTransfer {
    None,
    Store(FastStore<'static>),
    Load(FastLoad<'static>),
}

/// Adapts `mailbox`'s subscribed-page cell to the trait `ria_action_loop`
/// dispatches against, so the action loop never needs to know this port
/// hands the subscription off across cores via a critical section.
struct MailboxXramSink;

impl XramPageSink for MailboxXramSink {
    fn subscribed_page(&self) -> Option<u8> {
        mailbox::xram_subscribed_page()
    }
}

/// Runs forever on core 1. `now_us` is supplied by the caller (a free-
/// running hardware timer) rather than read from a global, so the reset
/// timing policy in [`crate::cpu`] stays host-testable.
pub fn run<ResetPin: PinId>(
    mut engine: BusEngine<PIO0, ResetPin>,
    initial_phi2_khz: u32,
    configured_reset_us: u32,
    mut now_us: impl FnMut() -> u64,
) -> ! {
    let mut action_loop = ActionLoop::new();
    let mut uart = ActionUart;
    let xram_sink = MailboxXramSink;
    let mut cpu = Cpu::new();
    let mut phi2_khz = initial_phi2_khz;
    cpu.reclock(reset_us(achieved_phi2_khz(compute_phi2_clocks(phi2_khz)), configured_reset_us), now_us());
    let mut transfer = FastTransfer::None;

    loop {
        let now = now_us();

        if let Some(cmd) = mailbox::take_cpu_command() {
            let action = match cmd {
                CpuCommand::Run => cpu.request_run(now),
                CpuCommand::Stop => cpu.request_stop(now),
            };
            apply_cpu_action(&mut engine, action);
        }

        if let Some(khz) = mailbox::take_requested_phi2_khz() {
            phi2_khz = khz;
            let clocks = compute_phi2_clocks(phi2_khz);
            engine.reclock(clocks);
            cpu.reclock(reset_us(achieved_phi2_khz(clocks), configured_reset_us), now);
        }

        let action = cpu.poll(now);
        apply_cpu_action(&mut engine, action);

        if mailbox::take_api_done() {
            action_loop.clear_api_busy();
        }

        if matches!(transfer, FastTransfer::None) {
            if let Some(req) = mailbox::take_fast_store_request() {
                let buf = xram_slice(req.xram_start, req.len);
                let (store, stage) = FastStore::begin(req.cpu_addr, buf);
                stage_fastio(&stage);
                transfer = FastTransfer::Store(store);
            } else if let Some(req) = mailbox::take_fast_load_request() {
                let buf = xram_slice_mut(req.xram_start, req.len);
                let (load, stage) = FastLoad::begin(req.cpu_addr, buf);
                stage_fastio(&stage);
                transfer = FastTransfer::Load(load);
            }
        }

        while let Some((addr, data)) = engine.pop_action_event() {
            let event = ActionEvent { addr, data };
            let reset_asserted = engine.reset_asserted();
            let effect = action_loop.dispatch(
                event,
                // SAFETY: core 0 never touches the register window while
                // this core's dispatch is running; the two sides only
                // ever alternate during the mutually exclusive phases
                // `mailbox` coordinates.
                unsafe { ria_bus_engine::regs_mut() },
                xram_full(),
                reset_asserted,
                &mut uart,
                xram::xram_queue(),
                Some(&xram_sink),
            );

            match effect {
                ActionEffect::None | ActionEffect::Halt => {}
                ActionEffect::ApiTrigger(opcode) => {
                    let reg_a = unsafe { ria_bus_engine::regs() }.get(offset::API_A);
                    mailbox::post_api_call(mailbox::ApiCall { opcode, reg_a });
                }
                ActionEffect::FastStoreStep => {
                    if let FastTransfer::Store(store) = &mut transfer {
                        match store.step() {
                            Some(patch) => {
                                let regs = unsafe { ria_bus_engine::regs_mut() };
                                regs.set(ria_fastio::stub::ARG0 as u8 + offset::FASTIO_BASE, patch.imm);
                                regs.set(
                                    ria_fastio::stub::ARG1_LO as u8 + offset::FASTIO_BASE,
                                    patch.addr as u8,
                                );
                                regs.set(
                                    ria_fastio::stub::ARG1_HI as u8 + offset::FASTIO_BASE,
                                    (patch.addr >> 8) as u8,
                                );
                                if patch.terminate {
                                    regs.set(
                                        ria_fastio::stub::OP2_REL as u8 + offset::FASTIO_BASE,
                                        0,
                                    );
                                }
                            }
                            None => {
                                transfer = FastTransfer::None;
                                mailbox::mark_fast_transfer_done();
                            }
                        }
                        if matches!(store.phase(), TransferPhase::Done) {
                            transfer = FastTransfer::None;
                            mailbox::mark_fast_transfer_done();
                        }
                    }
                }
                ActionEffect::FastLoadStep => {
                    if let FastTransfer::Load(load) = &mut transfer {
                        let latched = unsafe { ria_bus_engine::regs() }
                            .get(offset::RESET_VECTOR_LO);
                        match load.step(latched) {
                            Some(patch) => {
                                let regs = unsafe { ria_bus_engine::regs_mut() };
                                regs.set(
                                    ria_fastio::stub::ARG1_LO as u8 + offset::FASTIO_BASE,
                                    patch.addr as u8,
                                );
                                regs.set(
                                    ria_fastio::stub::ARG1_HI as u8 + offset::FASTIO_BASE,
                                    (patch.addr >> 8) as u8,
                                );
                                if patch.terminate {
                                    regs.set(
                                        ria_fastio::stub::OP2_REL as u8 + offset::FASTIO_BASE,
                                        0,
                                    );
                                }
                            }
                            None => {
                                if matches!(load.phase(), TransferPhase::Done) {
                                    transfer = FastTransfer::None;
                                    mailbox::mark_fast_transfer_done();
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}

fn apply_cpu_action<ResetPin: PinId>(engine: &mut BusEngine<PIO0, ResetPin>, action: CpuAction) {
    match action {
        CpuAction::None => {}
        CpuAction::AssertReset => engine.assert_reset(),
        CpuAction::DeassertReset => engine.deassert_reset(),
    }
}

fn stage_fastio(stage: &[u8; ria_abi::offset::FASTIO_LEN]) {
    let regs = unsafe { ria_bus_engine::regs_mut() };
    for (i, byte) in stage.iter().enumerate() {
        regs.set(offset::FASTIO_BASE + i as u8, *byte);
    }
}

fn xram_full() -> &'static mut [u8] {
    // SAFETY: see `xram`'s module doc comment on the phase discipline.
    &mut unsafe { xram::xram() }[..]
}

fn xram_slice(start: u16, len: u16) -> &'static [u8] {
    let full = xram_full();
    &full[start as usize..start as usize + len as usize]
}

fn xram_slice_mut(start: u16, len: u16) -> &'static mut [u8] {
    let full = xram_full();
    &mut full[start as usize..start as usize + len as usize]
}
