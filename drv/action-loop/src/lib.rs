// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The action loop (C2): a non-yielding dispatcher over the action-event
//! stream produced by the bus engine's address sniffer.
//!
//! This crate contains only the dispatch *decision* — given one
//! [`ActionEvent`] and the current reset state, what effect should occur,
//! and which bytes of the register window change. It has no PIO or FIFO
//! code of its own (that lives in `drv/bus-engine`); the core-B polling
//! loop that feeds it events lives in `app/ria-firmware`, which is the only
//! place that owns a real [`Uart`] and a real [`ria_abi::Regs`].

#![no_std]

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};

use ria_abi::{offset, Regs};
use ringbuf::{ringbuf, ringbuf_entry};

/// Depth of [`XramQueue`]. Matches spec.md §3's "last 256 writes to the
/// subscribed page" sizing for the extended-RAM mirror.
pub const XRAM_QUEUE_LEN: usize = 256;

/// The last-written-page mirror backing spec.md §3's "Extended RAM"
/// model: a fixed ring of `(addr_low, byte)` pairs, one producer (the
/// action loop, here), one consumer (the audio engine collaborator,
/// out of scope — reached only through [`XramPageSink`]).
///
/// `lib/circq`'s `CircQ` is the usual circular-queue primitive in this
/// workspace, but it's `&mut`-only by design (its own doc comment says
/// so) and so can't back a structure two cores reach through a shared
/// reference. This keeps `CircQ`'s idiom — one fixed backing store, a
/// head and a tail index, wraparound by modulus rather than a division
/// — but gives the head index to the producer and the tail index to
/// the consumer exclusively, so each is a plain atomic store with no
/// read-modify-write: Cortex-M0+ has no atomic RMW instructions, and
/// the fake ones `armv6m-atomic-hack` provides are explicitly unsound
/// for memory two cores actually share, which this is.
pub struct XramQueue {
    entries: UnsafeCell<[(u8, u8); XRAM_QUEUE_LEN]>,
    head: AtomicUsize,
    tail: AtomicUsize,
}

// SAFETY: `head` is written only by the producer, `tail` only by the
// consumer; `entries[head % LEN]` is only written by the producer and
// only read by the consumer after observing the matching `head` via
// `Acquire`, paired with the producer's `Release` store of `head`.
unsafe impl Sync for XramQueue {}

impl XramQueue {
    pub const fn new() -> Self {
        Self {
            entries: UnsafeCell::new([(0, 0); XRAM_QUEUE_LEN]),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    /// Producer side. Once the ring has gone a full lap unread, this
    /// overwrites the oldest unread entry rather than blocking — a slow
    /// consumer loses history, never sync with the current page, which
    /// matches a *mirror*'s contract.
    fn push(&self, addr_low: u8, byte: u8) {
        let head = self.head.load(Ordering::Relaxed);
        let slot = head % XRAM_QUEUE_LEN;
        // SAFETY: sole producer; see the struct's Sync justification.
        unsafe { (*self.entries.get())[slot] = (addr_low, byte) };
        self.head.store(head.wrapping_add(1), Ordering::Release);
    }

    /// Consumer side. Returns the oldest entry not yet popped, or
    /// `None` if the consumer has caught up with the producer. If the
    /// producer has lapped the consumer since the last call, skips
    /// forward to the oldest entry the ring still holds intact rather
    /// than returning data a later write has already overwritten.
    pub fn pop(&self) -> Option<(u8, u8)> {
        let mut tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail == head {
            return None;
        }
        if head.wrapping_sub(tail) > XRAM_QUEUE_LEN {
            tail = head.wrapping_sub(XRAM_QUEUE_LEN);
        }
        let slot = tail % XRAM_QUEUE_LEN;
        // SAFETY: sole consumer, and `head`'s Acquire load above is
        // paired with the producer's Release store, so this entry's
        // write is visible.
        let entry = unsafe { (*self.entries.get())[slot] };
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        Some(entry)
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Relaxed)
    }
}

impl Default for XramQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// The audio engine's only hook into the action loop (spec.md §3's
/// "Extended RAM" subscriber): which single xram page, if any, should
/// have every touch mirrored into an [`XramQueue`]. The audio engine
/// itself is out of scope for this port; `ActionLoop` never reaches
/// into its state beyond this one query.
pub trait XramPageSink {
    fn subscribed_page(&self) -> Option<u8>;
}

/// One action-event FIFO entry: a 5-bit address within the register
/// window, and the byte that was read or written.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ActionEvent {
    pub addr: u8,
    pub data: u8,
}

/// The 6502-visible serial peripheral. Backs `STATUS`/`UART_TX`/`UART_RX`
/// and, via the same wire, the non-blocking `CONSOLE_TX` fast path.
pub trait Uart {
    fn is_writable(&self) -> bool;
    fn is_readable(&self) -> bool;
    fn write(&mut self, byte: u8);
    fn read(&mut self) -> u8;
}

/// What the caller must do in response to one dispatched event. The action
/// loop itself never touches the filesystem, USB, or PIX — those are
/// consequences the caller (running on core A) is responsible for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ActionEffect {
    /// Nothing to do: event was a no-op offset, or reset was asserted and
    /// the event was discarded.
    None,
    /// Halt the 6502. No API call is implied.
    Halt,
    /// Halt the 6502 and dispatch `opcode` as an API call, once the main
    /// thread next polls. Only raised the first time `API_OP` is written
    /// while no call is already in flight.
    ApiTrigger(u8),
    /// Advance the staged fast-store transfer by one byte.
    FastStoreStep,
    /// Advance the staged fast-load transfer by one byte.
    FastLoadStep,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Trace {
    None,
    Dispatch { addr: u8 },
    Discarded,
    ApiLatched(u8),
    ApiIgnoredBusy,
}

ringbuf!(Trace, 32, Trace::None);

/// Bit 0: TX ready; bit 1: RX ready.
const STATUS_TX_READY: u8 = 0b01;
const STATUS_RX_READY: u8 = 0b10;

/// Dispatcher state carried between events: whether an API call is
/// currently in flight. Everything else the action loop touches lives in
/// the register window itself.
#[derive(Default)]
pub struct ActionLoop {
    api_busy: bool,
}

impl ActionLoop {
    pub const fn new() -> Self {
        Self { api_busy: false }
    }

    pub fn is_api_busy(&self) -> bool {
        self.api_busy
    }

    /// Called by the API dispatcher (C4) once a call completes, whether
    /// successfully or via cancellation.
    pub fn clear_api_busy(&mut self) {
        self.api_busy = false;
    }

    /// Dispatches one action event. `reset_asserted` discards the event
    /// without side effects, per the cancellation contract in the bus
    /// engine's reset behavior. `xram` backs the two windowed-access
    /// registers (`XRAM_RW0`/`XRAM_RW1`); every other offset ignores it.
    pub fn dispatch(
        &mut self,
        event: ActionEvent,
        regs: &mut Regs,
        xram: &mut [u8],
        reset_asserted: bool,
        uart: &mut impl Uart,
        xram_queue: &XramQueue,
        audio_sink: Option<&dyn XramPageSink>,
    ) -> ActionEffect {
        if reset_asserted {
            ringbuf_entry!(Trace::Discarded);
            return ActionEffect::None;
        }
        ringbuf_entry!(Trace::Dispatch { addr: event.addr });

        match event.addr {
            offset::STATUS => {
                self.refresh_status(regs, uart);
                ActionEffect::None
            }
            offset::UART_TX => {
                uart.write(event.data);
                self.set_tx_ready(regs, uart.is_writable());
                ActionEffect::None
            }
            offset::UART_RX => {
                if uart.is_readable() {
                    regs.set(offset::UART_RX, uart.read());
                    self.set_rx_ready(regs, true);
                } else {
                    regs.set(offset::UART_RX, 0);
                    self.set_rx_ready(regs, false);
                }
                ActionEffect::None
            }
            offset::CONSOLE_TX => {
                if uart.is_writable() {
                    uart.write(event.data);
                }
                ActionEffect::None
            }
            offset::API_OP => {
                if event.data != 0x00 && event.data != 0xFF && !self.api_busy {
                    self.api_busy = true;
                    ringbuf_entry!(Trace::ApiLatched(event.data));
                    ActionEffect::ApiTrigger(event.data)
                } else {
                    if event.data != 0x00 && event.data != 0xFF {
                        ringbuf_entry!(Trace::ApiIgnoredBusy);
                    }
                    ActionEffect::Halt
                }
            }
            offset::XRAM_RW0 => {
                self.step_xram_window(
                    regs,
                    xram,
                    event.data,
                    offset::XRAM_RW0,
                    offset::XRAM_STEP0,
                    offset::XRAM_ADDR0,
                    xram_queue,
                    audio_sink,
                );
                ActionEffect::None
            }
            offset::XRAM_RW1 => {
                self.step_xram_window(
                    regs,
                    xram,
                    event.data,
                    offset::XRAM_RW1,
                    offset::XRAM_STEP1,
                    offset::XRAM_ADDR1,
                    xram_queue,
                    audio_sink,
                );
                ActionEffect::None
            }
            offset::FASTSTORE_STEP => ActionEffect::FastStoreStep,
            offset::FASTLOAD_STEP => ActionEffect::FastLoadStep,
            _ => ActionEffect::None,
        }
    }

    /// Services one touch of a windowed xram register: latches `data` into
    /// `xram` at the window's current address (a no-op for a read touch,
    /// since `data` is then just the byte the bus already produced), then
    /// advances the address by the signed step and restages the new
    /// location's byte so the next touch — read or write — sees the right
    /// value. The sniffer can't tell a read from a write, so every touch
    /// does both halves; see `DESIGN.md`. If the touched address falls on
    /// the audio engine's subscribed page, the same byte is mirrored into
    /// `xram_queue` for it to pick up.
    fn step_xram_window(
        &self,
        regs: &mut Regs,
        xram: &mut [u8],
        data: u8,
        rw_off: u8,
        step_off: u8,
        addr_off: u8,
        xram_queue: &XramQueue,
        audio_sink: Option<&dyn XramPageSink>,
    ) {
        let addr = regs.get(addr_off) as u16 | ((regs.get(addr_off + 1) as u16) << 8);
        xram[addr as usize] = data;
        if let Some(sink) = audio_sink {
            if sink.subscribed_page() == Some((addr >> 8) as u8) {
                xram_queue.push(addr as u8, data);
            }
        }
        let step = regs.get(step_off) as i8 as i16;
        let next = addr.wrapping_add(step as u16);
        regs.set(addr_off, next as u8);
        regs.set(addr_off + 1, (next >> 8) as u8);
        regs.set(rw_off, xram[next as usize]);
    }

    fn refresh_status(&self, regs: &mut Regs, uart: &mut impl Uart) {
        let mut status = regs.get(offset::STATUS);
        status = Self::with_bit(status, STATUS_TX_READY, uart.is_writable());
        if status & STATUS_RX_READY == 0 && uart.is_readable() {
            regs.set(offset::UART_RX, uart.read());
            status |= STATUS_RX_READY;
        }
        regs.set(offset::STATUS, status);
    }

    fn set_tx_ready(&self, regs: &mut Regs, ready: bool) {
        let status = regs.get(offset::STATUS);
        regs.set(offset::STATUS, Self::with_bit(status, STATUS_TX_READY, ready));
    }

    fn set_rx_ready(&self, regs: &mut Regs, ready: bool) {
        let status = regs.get(offset::STATUS);
        regs.set(offset::STATUS, Self::with_bit(status, STATUS_RX_READY, ready));
    }

    fn with_bit(byte: u8, mask: u8, set: bool) -> u8 {
        if set {
            byte | mask
        } else {
            byte & !mask
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeUart {
        writable: bool,
        rx: Option<u8>,
        written: heapless_written::Written,
    }

    mod heapless_written {
        #[derive(Default)]
        pub struct Written(pub [u8; 8], pub usize);
    }

    impl FakeUart {
        fn new() -> Self {
            Self {
                writable: true,
                rx: None,
                written: Default::default(),
            }
        }
    }

    impl Uart for FakeUart {
        fn is_writable(&self) -> bool {
            self.writable
        }
        fn is_readable(&self) -> bool {
            self.rx.is_some()
        }
        fn write(&mut self, byte: u8) {
            self.written.0[self.written.1] = byte;
            self.written.1 += 1;
        }
        fn read(&mut self) -> u8 {
            self.rx.take().unwrap_or(0)
        }
    }

    #[test]
    fn uart_echo_sets_tx_ready() {
        let mut loop_ = ActionLoop::new();
        let mut regs = Regs::zeroed();
        let mut xram = [0u8; ria_abi::XRAM_SIZE];
        let mut uart = FakeUart::new();
        let queue = XramQueue::new();
        let effect = loop_.dispatch(
            ActionEvent {
                addr: offset::UART_TX,
                data: b'A',
            },
            &mut regs,
            &mut xram,
            false,
            &mut uart,
            &queue,
            None,
        );
        assert_eq!(effect, ActionEffect::None);
        assert_eq!(uart.written.0[0], b'A');
        assert_eq!(regs.get(offset::STATUS) & STATUS_TX_READY, STATUS_TX_READY);
    }

    #[test]
    fn reset_asserted_discards_events() {
        let mut loop_ = ActionLoop::new();
        let mut regs = Regs::zeroed();
        let mut xram = [0u8; ria_abi::XRAM_SIZE];
        let mut uart = FakeUart::new();
        let queue = XramQueue::new();
        let effect = loop_.dispatch(
            ActionEvent {
                addr: offset::UART_TX,
                data: b'A',
            },
            &mut regs,
            &mut xram,
            true,
            &mut uart,
            &queue,
            None,
        );
        assert_eq!(effect, ActionEffect::None);
        assert_eq!(uart.written.1, 0);
    }

    #[test]
    fn api_op_latches_once() {
        let mut loop_ = ActionLoop::new();
        let mut regs = Regs::zeroed();
        let mut xram = [0u8; ria_abi::XRAM_SIZE];
        let mut uart = FakeUart::new();
        let queue = XramQueue::new();
        let first = loop_.dispatch(
            ActionEvent {
                addr: offset::API_OP,
                data: 0x10,
            },
            &mut regs,
            &mut xram,
            false,
            &mut uart,
            &queue,
            None,
        );
        assert_eq!(first, ActionEffect::ApiTrigger(0x10));
        assert!(loop_.is_api_busy());

        // A second opcode write while busy just halts; it is not latched.
        let second = loop_.dispatch(
            ActionEvent {
                addr: offset::API_OP,
                data: 0x11,
            },
            &mut regs,
            &mut xram,
            false,
            &mut uart,
            &queue,
            None,
        );
        assert_eq!(second, ActionEffect::Halt);

        loop_.clear_api_busy();
        let third = loop_.dispatch(
            ActionEvent {
                addr: offset::API_OP,
                data: 0x11,
            },
            &mut regs,
            &mut xram,
            false,
            &mut uart,
            &queue,
            None,
        );
        assert_eq!(third, ActionEffect::ApiTrigger(0x11));
    }

    #[test]
    fn api_op_zero_is_bare_halt() {
        let mut loop_ = ActionLoop::new();
        let mut regs = Regs::zeroed();
        let mut xram = [0u8; ria_abi::XRAM_SIZE];
        let mut uart = FakeUart::new();
        let queue = XramQueue::new();
        let effect = loop_.dispatch(
            ActionEvent {
                addr: offset::API_OP,
                data: 0x00,
            },
            &mut regs,
            &mut xram,
            false,
            &mut uart,
            &queue,
            None,
        );
        assert_eq!(effect, ActionEffect::Halt);
        assert!(!loop_.is_api_busy());
    }

    #[test]
    fn unknown_offset_is_a_no_op() {
        let mut loop_ = ActionLoop::new();
        let mut regs = Regs::zeroed();
        let mut xram = [0u8; ria_abi::XRAM_SIZE];
        let mut uart = FakeUart::new();
        let queue = XramQueue::new();
        let effect = loop_.dispatch(
            ActionEvent { addr: 0x1F, data: 0 },
            &mut regs,
            &mut xram,
            false,
            &mut uart,
            &queue,
            None,
        );
        assert_eq!(effect, ActionEffect::None);
    }

    #[test]
    fn xram_window_writes_and_advances_by_step() {
        let mut loop_ = ActionLoop::new();
        let mut regs = Regs::zeroed();
        let mut xram = [0u8; ria_abi::XRAM_SIZE];
        let mut uart = FakeUart::new();
        let queue = XramQueue::new();
        regs.set(offset::XRAM_ADDR0, 0x00);
        regs.set(offset::XRAM_ADDR0 + 1, 0x10);
        regs.set(offset::XRAM_STEP0, 1);
        xram[0x1001] = 0xAA;

        loop_.dispatch(
            ActionEvent {
                addr: offset::XRAM_RW0,
                data: 0x55,
            },
            &mut regs,
            &mut xram,
            false,
            &mut uart,
            &queue,
            None,
        );

        assert_eq!(xram[0x1000], 0x55);
        assert_eq!(regs.get(offset::XRAM_ADDR0), 0x01);
        assert_eq!(regs.get(offset::XRAM_ADDR0 + 1), 0x10);
        assert_eq!(regs.get(offset::XRAM_RW0), 0xAA);
    }

    #[test]
    fn xram_window_step_is_signed_and_wraps() {
        let mut loop_ = ActionLoop::new();
        let mut regs = Regs::zeroed();
        let mut xram = [0u8; ria_abi::XRAM_SIZE];
        let mut uart = FakeUart::new();
        let queue = XramQueue::new();
        regs.set(offset::XRAM_ADDR1, 0x00);
        regs.set(offset::XRAM_ADDR1 + 1, 0x00);
        regs.set(offset::XRAM_STEP1, 0xFF); // -1

        loop_.dispatch(
            ActionEvent {
                addr: offset::XRAM_RW1,
                data: 0x01,
            },
            &mut regs,
            &mut xram,
            false,
            &mut uart,
            &queue,
            None,
        );

        assert_eq!(xram[0x0000], 0x01);
        assert_eq!(regs.get(offset::XRAM_ADDR1), 0xFF);
        assert_eq!(regs.get(offset::XRAM_ADDR1 + 1), 0xFF);
    }

    struct FixedSink(Option<u8>);

    impl XramPageSink for FixedSink {
        fn subscribed_page(&self) -> Option<u8> {
            self.0
        }
    }

    #[test]
    fn xram_write_on_subscribed_page_is_mirrored() {
        let mut loop_ = ActionLoop::new();
        let mut regs = Regs::zeroed();
        let mut xram = [0u8; ria_abi::XRAM_SIZE];
        let mut uart = FakeUart::new();
        let queue = XramQueue::new();
        let sink = FixedSink(Some(0x10));
        regs.set(offset::XRAM_ADDR0, 0x34);
        regs.set(offset::XRAM_ADDR0 + 1, 0x10);
        regs.set(offset::XRAM_STEP0, 1);

        loop_.dispatch(
            ActionEvent {
                addr: offset::XRAM_RW0,
                data: 0x99,
            },
            &mut regs,
            &mut xram,
            false,
            &mut uart,
            &queue,
            Some(&sink),
        );

        assert_eq!(queue.pop(), Some((0x34, 0x99)));
        assert!(queue.is_empty());
    }

    #[test]
    fn xram_write_off_subscribed_page_is_not_mirrored() {
        let mut loop_ = ActionLoop::new();
        let mut regs = Regs::zeroed();
        let mut xram = [0u8; ria_abi::XRAM_SIZE];
        let mut uart = FakeUart::new();
        let queue = XramQueue::new();
        let sink = FixedSink(Some(0x20));
        regs.set(offset::XRAM_ADDR0, 0x00);
        regs.set(offset::XRAM_ADDR0 + 1, 0x10);
        regs.set(offset::XRAM_STEP0, 1);

        loop_.dispatch(
            ActionEvent {
                addr: offset::XRAM_RW0,
                data: 0x99,
            },
            &mut regs,
            &mut xram,
            false,
            &mut uart,
            &queue,
            Some(&sink),
        );

        assert!(queue.is_empty());
    }

    #[test]
    fn xram_queue_overwrites_oldest_entry_once_full() {
        let queue = XramQueue::new();
        for i in 0..XRAM_QUEUE_LEN + 1 {
            queue.push(i as u8, i as u8);
        }
        // The very first push (addr_low 0) fell off the back; the oldest
        // entry left is the second push.
        assert_eq!(queue.pop(), Some((1, 1)));
    }

    #[test]
    fn xram_queue_pop_on_empty_is_none() {
        let queue = XramQueue::new();
        assert_eq!(queue.pop(), None);
    }
}
