// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! On-target wiring of the three PIO programs and their DMA chains into
//! one [`BusEngine`]. Grounded in `app/demo-pi-pico`'s peripheral-steal
//! bring-up idiom (reset a block, spin on `reset_done`, then configure
//! it) and in `original_source/src/ria/sys/mem.c`'s `regs`/`xram`
//! layout, which fixes the contract this module has to reproduce:
//! aligned storage the 6502 and firmware both touch without a lock.

use crate::clock::Phi2Clocks;
use crate::pio_programs;
use counters::{count, counters, Count};
use ringbuf::{ringbuf, ringbuf_entry};
use rp2040_hal::gpio::{FunctionSio, Pin, PinId, PullNone, SioOutput};
use rp2040_hal::pac;
use rp2040_hal::pio::{PIOExt, PIOBuilder, Running, StateMachine, Tx, UninitStateMachine, PIO, SM0, SM1, SM2, SM3};

/// PIO0's APB base address and its FIFO register offsets (RP2040
/// datasheet §2.7.6); fixed facts about the peripheral's memory map, not
/// board configuration, so they're not threaded through
/// [`DmaChainConfig`].
const PIO0_BASE: u32 = 0x5020_0000;
const PIO0_TXF1: u32 = PIO0_BASE + 0x14;
const PIO0_RXF0: u32 = PIO0_BASE + 0x20;
const PIO0_RXF1: u32 = PIO0_BASE + 0x24;

/// PIO0's system DREQ numbers (RP2040 datasheet Table 2.5.6.1: PIO0
/// TX0-3 are 0-3, RX0-3 are 4-7).
const DREQ_PIO0_RX0: u8 = 4;
const DREQ_PIO0_RX1: u8 = 5;

/// `treq_sel` value that paces a channel on nothing but its own
/// completion/trigger, for the two payload channels whose source or
/// destination is plain memory rather than a FIFO.
const TREQ_PERMANENT: u8 = 0x3f;

#[derive(Count, Clone, Copy, Debug, Eq, PartialEq)]
enum Event {
    /// The action FIFO overran; the event that would have been produced
    /// is lost. Non-fatal: the 6502 is never stalled
    /// for it.
    ActionFifoOverrun,
}

counters!(Event);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Trace {
    None,
    Reclocked { phi2_khz: u32, sys_clk_khz: u32 },
    FifoOverrun,
}

ringbuf!(Trace, 16, Trace::None);

/// Describes one half of a chained DMA pair: the channel that moves the
/// payload, and the channel whose *next* transfer's write/read address it
/// is reprogrammed from. `app/ria-firmware`'s board config supplies the
/// concrete channel numbers and pin mapping; this type only records the
/// shape both the write-sink and read-source chains share.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DmaChainConfig {
    /// DMA channel carrying the payload byte to/from `regs`.
    pub payload_channel: u8,
    /// DMA channel whose transfer address is rewritten from the address
    /// word the PIO program just pushed, chaining back into
    /// `payload_channel` once rewritten.
    pub address_channel: u8,
}

/// The running PIX-send state machine plus its TX handle. `ready`/`push`
/// mirror `ria_pix::PixFifo` exactly; `app/ria-firmware` wraps this in a
/// one-line newtype to implement that trait, since this crate doesn't
/// depend on `ria-pix`.
pub struct PixTx<P: PIOExt> {
    _sm: StateMachine<(P, SM3), Running>,
    tx: Tx<(P, SM3)>,
}

impl<P: PIOExt> PixTx<P> {
    pub fn ready(&self) -> bool {
        !self.tx.is_full()
    }

    pub fn push(&mut self, frame: u32) -> bool {
        self.tx.write(frame)
    }
}

/// Owns the three bus-engine state machines, the reset pin, and the
/// register window's DMA wiring. Everything the 6502 can observe after
/// [`BusEngine::init`] happens without further firmware intervention —
/// the only things this struct's methods do post-init are reclocking and
/// draining the action-event FIFO.
pub struct BusEngine<P: PIOExt, ResetPin: PinId> {
    pio: PIO<P>,
    write_sink: StateMachine<(P, SM0), Running>,
    read_source: StateMachine<(P, SM1), Running>,
    action_sniffer: StateMachine<(P, SM2), Running>,
    read_source_tx: Tx<(P, SM1)>,
    reset_pin: Pin<ResetPin, FunctionSio<SioOutput>, PullNone>,
    write_dma: DmaChainConfig,
    read_dma: DmaChainConfig,
}

impl<P: PIOExt, ResetPin: PinId> BusEngine<P, ResetPin> {
    /// Assembles and installs all three programs, records the DMA chain
    /// assignments the caller has already wired up on the peripheral side
    /// (the write sink's address-then-data pair, the read source's
    /// address-then-byte pair), and starts every state machine running.
    /// After this returns, 6502 reads/writes to `regs[0..32]` happen
    /// without further firmware intervention, and every such cycle also
    /// produces one entry on the action FIFO the caller drains with
    /// [`Self::pop_action_event`].
    #[allow(clippy::too_many_arguments)]
    pub fn init(
        mut pio: PIO<P>,
        sm0: UninitStateMachine<(P, SM0)>,
        sm1: UninitStateMachine<(P, SM1)>,
        sm2: UninitStateMachine<(P, SM2)>,
        reset_pin: Pin<ResetPin, FunctionSio<SioOutput>, PullNone>,
        write_dma: DmaChainConfig,
        read_dma: DmaChainConfig,
        clocks: Phi2Clocks,
    ) -> Self {
        let write_prog = pio.install(&pio_programs::write_sink_program()).unwrap();
        let read_prog = pio.install(&pio_programs::read_source_program()).unwrap();
        let action_prog = pio
            .install(&pio_programs::action_sniffer_program())
            .unwrap();

        let (mut write_sm, _, mut write_tx) = PIOBuilder::from_installed_program(write_prog)
            .clock_divisor_fixed_point(clocks.clkdiv.int_part, clocks.clkdiv.frac)
            .autopush(true)
            .push_threshold(32)
            .build(sm0);
        write_sm.set_pindirs([]);

        let (mut read_sm, _, mut read_tx) = PIOBuilder::from_installed_program(read_prog)
            .clock_divisor_fixed_point(clocks.clkdiv.int_part, clocks.clkdiv.frac)
            .autopull(true)
            .pull_threshold(8)
            .build(sm1);
        read_sm.set_pindirs([]);

        // Each program's leading `pull block`/`mov x, osr` (see
        // `pio_programs`) consumes exactly one TX FIFO word before the
        // state machine is started below, seeding `x` with the register
        // window's base address so every captured bus address comes out
        // of the loop already absolute.
        let regs_base_hi27 = crate::regs_base_addr() >> 5;
        write_tx.write(regs_base_hi27);
        read_tx.write(regs_base_hi27);

        let (mut action_sm, _, _) = PIOBuilder::from_installed_program(action_prog)
            .clock_divisor_fixed_point(clocks.clkdiv.int_part, clocks.clkdiv.frac)
            .autopush(true)
            .push_threshold(32)
            .build(sm2);
        action_sm.set_pindirs([]);

        // `write_dma`/`read_dma` (one channel reprograms another's pointer
        // from the captured address, the second moves the payload byte,
        // and the two chain to each other) are armed against the raw DMA
        // peripheral by [`Self::arm_dma`], called separately once the
        // caller has `pac.DMA` in hand, rather than through
        // `rp2040_hal::dma`'s single/double-buffer helpers, since neither
        // helper supports a channel reprogramming another channel's
        // transfer address from FIFO data. This constructor only records
        // which channels bring-up assigned.

        Self {
            pio,
            write_sink: write_sm.start(),
            read_source: read_sm.start(),
            action_sniffer: action_sm.start(),
            read_source_tx: read_tx,
            reset_pin,
            write_dma,
            read_dma,
        }
    }

    /// Programs `write_dma`/`read_dma`'s four channels against the real
    /// DMA peripheral so 6502 reads/writes to `regs[0..32]` happen
    /// without further firmware intervention, matching this module's own
    /// `init` doc comment. Each chain's `address_channel` is the half
    /// that's actually listening on the PIO's address-word DREQ (see
    /// `pio_programs`, whose leading `mov x, osr` makes that word already
    /// an absolute pointer into `regs`); its destination is wired
    /// straight to `payload_channel`'s write/read-address-trigger alias,
    /// so the byte transfer that register alone fires. `payload_channel`
    /// is fully configured here too but deliberately never given its own
    /// trigger write — it only starts the moment `address_channel`'s
    /// transfer completes and lands the captured pointer on its trigger
    /// register, and on completion it rearms `address_channel` in turn
    /// via `chain_to`. Call once, after [`Self::init`], before releasing
    /// the 6502 from reset.
    pub fn arm_dma(&self, dma: &pac::DMA) {
        let write = self.write_dma;
        let read = self.read_dma;

        // Write chain: address_channel (wa) reads the absolute write
        // pointer off PIO0_RXF0 and fires it straight into
        // payload_channel's (wp) write-address trigger; wp then reads
        // the data word PIO0_RXF0 holds next (write_sink_program always
        // pushes pointer-then-byte) and stores it, rearming wa on
        // completion.
        let wp = dma.ch(write.payload_channel as usize);
        wp.ch_read_addr().write(|w| unsafe { w.bits(PIO0_RXF0) });
        wp.ch_trans_count().write(|w| unsafe { w.bits(1) });
        wp.ch_al1_ctrl().write(|w| unsafe {
            w.data_size().bits(0); // byte
            w.incr_read().bit(false);
            w.incr_write().bit(false);
            w.treq_sel().bits(DREQ_PIO0_RX0);
            w.chain_to().bits(write.address_channel);
            w.en().bit(true)
        });

        let wa = dma.ch(write.address_channel as usize);
        wa.ch_read_addr().write(|w| unsafe { w.bits(PIO0_RXF0) });
        wa.ch_write_addr()
            .write(|w| unsafe { w.bits(wp.ch_al2_write_addr_trig().as_ptr() as u32) });
        wa.ch_al1_ctrl().write(|w| unsafe {
            w.data_size().bits(2); // word
            w.incr_read().bit(false);
            w.incr_write().bit(false);
            w.treq_sel().bits(DREQ_PIO0_RX0);
            w.chain_to().bits(write.address_channel); // self: no further auto-chain
            w.en().bit(true)
        });
        wa.ch_al1_trans_count_trig().write(|w| unsafe { w.bits(1) });

        // Read chain: address_channel (ra) reads the absolute read
        // pointer off PIO0_RXF1 and fires it into payload_channel's (rp)
        // read-address trigger; rp reads the regs byte it now points at
        // and pushes it to PIO0_TXF1, where `read_source_program`'s
        // `pull` is already stalled waiting for it, rearming ra on
        // completion.
        let rp = dma.ch(read.payload_channel as usize);
        rp.ch_write_addr().write(|w| unsafe { w.bits(PIO0_TXF1) });
        rp.ch_trans_count().write(|w| unsafe { w.bits(1) });
        rp.ch_al1_ctrl().write(|w| unsafe {
            w.data_size().bits(0); // byte
            w.incr_read().bit(false);
            w.incr_write().bit(false);
            w.treq_sel().bits(TREQ_PERMANENT);
            w.chain_to().bits(read.address_channel);
            w.en().bit(true)
        });

        let ra = dma.ch(read.address_channel as usize);
        ra.ch_read_addr().write(|w| unsafe { w.bits(PIO0_RXF1) });
        ra.ch_write_addr()
            .write(|w| unsafe { w.bits(rp.ch_al3_read_addr_trig().as_ptr() as u32) });
        ra.ch_al1_ctrl().write(|w| unsafe {
            w.data_size().bits(2); // word
            w.incr_read().bit(false);
            w.incr_write().bit(false);
            w.treq_sel().bits(DREQ_PIO0_RX1);
            w.chain_to().bits(read.address_channel); // self: no further auto-chain
            w.en().bit(true)
        });
        ra.ch_al1_trans_count_trig().write(|w| unsafe { w.bits(1) });
    }

    /// Applies `clocks.clkdiv` to all three state machines together, per
    /// the reclocking policy ("all three ... are re-divided
    /// together with identical ratios"). In-flight action events are
    /// preserved: the FIFO is drained by the caller (the action loop)
    /// before this is called, not flushed here.
    pub fn reclock(&mut self, clocks: Phi2Clocks) {
        ringbuf_entry!(Trace::Reclocked {
            phi2_khz: clocks.phi2_khz,
            sys_clk_khz: clocks.sys_clk_khz,
        });
        self.write_sink
            .clock_divisor_fixed_point(clocks.clkdiv.int_part, clocks.clkdiv.frac);
        self.read_source
            .clock_divisor_fixed_point(clocks.clkdiv.int_part, clocks.clkdiv.frac);
        self.action_sniffer
            .clock_divisor_fixed_point(clocks.clkdiv.int_part, clocks.clkdiv.frac);
    }

    /// Drains one action event, if available, from the sniffer's RX
    /// FIFO. Returns `(addr5, data8)`; callers build an
    /// `ria_action_loop::ActionEvent` from it (kept decoupled from this
    /// crate's type so this crate never depends on the action loop).
    pub fn pop_action_event(&mut self) -> Option<(u8, u8)> {
        let word = self.action_sniffer.pop_rx_fifo()?;
        Some(((word >> 8) as u8 & 0x1F, word as u8))
    }

    /// Reports and counts a FIFO-full condition observed by the caller
    /// (signaled by the DMA IRQ in the real build); non-fatal per
    /// non-fatal for the bus protocol.
    pub fn note_fifo_overrun(&mut self) {
        ringbuf_entry!(Trace::FifoOverrun);
        count!(Event::ActionFifoOverrun);
    }

    /// Stages one byte for the next 6502 read at `addr` (masked to the
    /// register window), bypassing the DMA path. Used only during bring-up
    /// or test harnesses; the steady-state read path is entirely DMA-driven.
    pub fn stage_read_byte(&mut self, byte: u8) {
        self.read_source_tx.write(byte as u32);
    }

    /// Installs [`pio_programs::pix_send_program`] onto `sm3` (the state
    /// machine `app/ria-firmware` otherwise leaves unclaimed) and starts
    /// it running, returning a handle `app/ria-firmware` adapts to
    /// `ria_pix::PixFifo` — this crate has no opinion about the PIX wire
    /// encoding, only about getting 32-bit words onto the pins.
    pub fn init_pix_tx(
        &mut self,
        sm3: UninitStateMachine<(P, SM3)>,
        clocks: Phi2Clocks,
    ) -> PixTx<P> {
        let prog = self
            .pio
            .install(&pio_programs::pix_send_program())
            .unwrap();
        let (mut sm, _, tx) = PIOBuilder::from_installed_program(prog)
            .clock_divisor_fixed_point(clocks.clkdiv.int_part, clocks.clkdiv.frac)
            .out_pins(0, 4)
            .autopull(true)
            .pull_threshold(32)
            .build(sm3);
        sm.set_pindirs((0..4u8).map(|i| (i, rp2040_hal::pio::PinDir::Output)));
        PixTx {
            _sm: sm.start(),
            tx,
        }
    }

    /// Drives the reset pin low (asserted).
    pub fn assert_reset(&mut self) {
        use embedded_hal::digital::v2::OutputPin;
        let _ = self.reset_pin.set_low();
    }

    /// Releases the reset pin (high).
    pub fn deassert_reset(&mut self) {
        use embedded_hal::digital::v2::OutputPin;
        let _ = self.reset_pin.set_high();
    }

    /// Whether the reset pin is currently driven low.
    pub fn reset_asserted(&self) -> bool {
        use embedded_hal::digital::v2::StatefulOutputPin;
        self.reset_pin.is_set_low().unwrap_or(true)
    }

    /// Reclaims the underlying PIO block's shared state, for
    /// peripheral-level operations `app/ria-firmware` needs directly
    /// (e.g. clearing FIFOs across a reclock).
    pub fn pio_mut(&mut self) -> &mut PIO<P> {
        &mut self.pio
    }

    /// The DMA channel assignment backing the write-sink path, for board
    /// bring-up code that needs to re-arm a channel after a reclock.
    pub fn write_dma(&self) -> DmaChainConfig {
        self.write_dma
    }

    /// The DMA channel assignment backing the read-source path.
    pub fn read_dma(&self) -> DmaChainConfig {
        self.read_dma
    }
}
