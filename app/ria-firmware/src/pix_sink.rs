// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bridges `ria_api`'s abstract [`PixXregSink`] to the real PIX send
//! path: `ria_bus_engine::PixTx` (the PIO/DMA-free nibble-shift state
//! machine on PIO0's fourth state machine) driving `ria_pix::PixLink`'s
//! wire encoding. `ApiDispatcher` only ever calls `begin_xreg`/
//! `xreg_busy`; stepping the actual send takes a staged batch off the
//! 6502's xstack and onto the wire one frame per main-loop tick, so
//! [`PixSink::step`] is called directly from `main`'s poll loop, the
//! same way `vga_link.poll_watchdog` already is.

use ria_api::PixXregSink;
use ria_bus_engine::PixTx;
use ria_pix::{PixFifo, PixLink, XregPoll};
use rp2040_hal::pac::PIO0;

const MAX_XREG_BATCH: usize = 64;

struct TxAdapter<'a>(&'a mut PixTx<PIO0>);

impl PixFifo for TxAdapter<'_> {
    fn ready(&self) -> bool {
        self.0.ready()
    }

    fn push(&mut self, frame: u32) {
        self.0.push(frame);
    }
}

pub struct PixSink {
    link: PixLink,
    tx: PixTx<PIO0>,
    values: [u16; MAX_XREG_BATCH],
}

impl PixSink {
    pub fn new(tx: PixTx<PIO0>) -> Self {
        Self {
            link: PixLink::new(),
            tx,
            values: [0; MAX_XREG_BATCH],
        }
    }

    /// Steps the pending batch, if any, by at most one frame. Called once
    /// per main-loop iteration regardless of whether `ApiDispatcher` has a
    /// call in flight — a batch outlives the `Busy` poll that started it.
    pub fn step(&mut self, now_us: u64) -> XregPoll {
        let values = &self.values;
        self.link
            .poll(&mut TxAdapter(&mut self.tx), now_us, |index| values[index as usize])
    }

    /// The display board ACKed the last canvas/mode write.
    pub fn ack(&mut self) -> bool {
        self.link.ack()
    }

    /// The display board NAKed; abandons the in-flight batch.
    pub fn nak(&mut self) {
        self.link.nak()
    }
}

impl PixXregSink for PixSink {
    fn begin_xreg(&mut self, device: u8, channel: u8, addr: u8, values: &[u16]) -> bool {
        let count = values.len().min(MAX_XREG_BATCH);
        self.values[..count].copy_from_slice(&values[..count]);
        self.link.begin_set_xreg(device, channel, addr, count as u8)
    }

    fn xreg_busy(&self) -> bool {
        self.link.is_busy()
    }
}
