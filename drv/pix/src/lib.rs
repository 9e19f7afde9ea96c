// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The PIX uplink (C5): outbound frame encoding to the companion display
//! board, inbound backchannel decoding, and the VGA presence/vsync state
//! machine.
//!
//! This crate has no PIO code of its own (see `drv/bus-engine` for the send
//! program); it owns the wire encoding, the `pending`/`waiting_for_ack`
//! bookkeeping a `SET_XREG` batch needs, and the backchannel byte decoder.

#![cfg_attr(not(test), no_std)]

use enum_map::Enum;
use multitimer::Multitimer;
use ria_abi::{backchannel, pix_vga_channel, PixDevice};
use ringbuf::{ringbuf, ringbuf_entry};

/// One outbound PIX frame, packed into the 32-bit PIO word the send
/// program shifts out. `addr` is 8 bits wide on the wire (matching every
/// real call site in the upstream firmware, which only ever addresses a
/// byte-sized register within a PIX device/channel) even though the
/// protocol description elsewhere uses a 16-bit address field; the
/// reduction drops the sidechannel bits to fit the frame into one
/// 32-bit FIFO word. See DESIGN.md for the resolved bit layout.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PixFrame {
    pub device: u8,
    pub channel: u8,
    pub addr: u8,
    pub data: u16,
}

impl PixFrame {
    const DEVICE_SHIFT: u32 = 28;
    const CHANNEL_SHIFT: u32 = 24;
    const ADDR_SHIFT: u32 = 16;

    pub fn new(device: u8, channel: u8, addr: u8, data: u16) -> Self {
        Self {
            device: device & 0x7,
            channel: channel & 0xF,
            addr,
            data,
        }
    }

    /// Packs the frame into the 32-bit word the send PIO program consumes.
    pub fn encode(self) -> u32 {
        (u32::from(self.device) << Self::DEVICE_SHIFT)
            | (u32::from(self.channel) << Self::CHANNEL_SHIFT)
            | (u32::from(self.addr) << Self::ADDR_SHIFT)
            | u32::from(self.data)
    }

    /// An idle/resync frame, emitted in pairs on startup.
    pub fn idle() -> Self {
        Self::new(PixDevice::Idle as u8, 0, 0, 0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Trace {
    None,
    Sent { device: u8, channel: u8, addr: u8 },
    AckWaitStarted,
    AckTimedOut,
    BatchInvalid,
}

ringbuf!(Trace, 32, Trace::None);

/// How much room the PIO TX FIFO has; supplied by the caller since this
/// crate has no PIO handle of its own.
pub trait PixFifo {
    fn ready(&self) -> bool;
    fn push(&mut self, frame: u32);
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Enum)]
enum PixTimer {
    Ack,
}

/// One pending `SET_XREG` batch: writes data from a small inline buffer in
/// reverse index order (largest address first), matching
/// `pix_api_set_xreg`'s canvas-before-mode carve-out for the VGA device.
pub struct PixLink {
    device: u8,
    channel: u8,
    base_addr: u8,
    pending: u8,
    /// Set for one step when the canvas/mode carve-out still needs to jump
    /// the queue; cleared once that frame has been sent.
    canvas_first_pending: bool,
    /// Added to `pending` when computing the index into `value_at`/the
    /// wire address, to account for index 0 having already been sent out
    /// of turn by the canvas carve-out.
    index_offset: u8,
    waiting_for_ack: bool,
    timers: Multitimer<PixTimer>,
    send_count: u32,
}

/// Result of polling a pending `SET_XREG` batch.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum XregPoll {
    /// Nothing pending.
    Idle,
    /// Still sending or waiting on an ACK; call again later.
    Busy,
    /// Batch completed normally.
    Done,
    /// The display NAK'd, or the ACK deadline passed without a response.
    Failed,
}

impl PixLink {
    pub fn new() -> Self {
        Self {
            device: 0,
            channel: 0,
            base_addr: 0,
            pending: 0,
            canvas_first_pending: false,
            index_offset: 0,
            waiting_for_ack: false,
            timers: Multitimer::new(),
            send_count: 0,
        }
    }

    pub fn send_count(&self) -> u32 {
        self.send_count
    }

    /// Whether a batch is still draining or waiting on an ACK — what a
    /// `PixXregSink` needs to answer `xreg_busy` without tracking its own
    /// copy of this state.
    pub fn is_busy(&self) -> bool {
        self.pending != 0 || self.waiting_for_ack
    }

    /// Begins a `SET_XREG` batch: `values[0]` lands at `base_addr`,
    /// `values[1]` at `base_addr + 1`, and so on; the wire emits them in
    /// reverse so the largest address goes out first. Fails if the batch
    /// is too large for a `u8` address run or one is already pending.
    pub fn begin_set_xreg(
        &mut self,
        device: u8,
        channel: u8,
        base_addr: u8,
        count: u8,
    ) -> bool {
        if self.pending != 0 || self.waiting_for_ack || count == 0 {
            ringbuf_entry!(Trace::BatchInvalid);
            return false;
        }
        self.device = device & 0x7;
        self.channel = channel & 0xF;
        self.base_addr = base_addr;
        self.pending = count;
        self.index_offset = 0;
        self.canvas_first_pending = self.is_vga_canvas_mode_batch();
        true
    }

    /// Whether the VGA canvas/mode special case applies: writing both the
    /// canvas (channel 0, addr 0) and mode (addr 1) registers in the same
    /// batch. Canvas must go out first since sending mode would otherwise
    /// be clobbered by a canvas write that follows it.
    pub fn is_vga_canvas_mode_batch(&self) -> bool {
        self.device == PixDevice::Vga as u8
            && self.channel == pix_vga_channel::CANVAS
            && self.base_addr == pix_vga_channel::CANVAS
            && self.pending > 1
    }

    /// Drives one step of the pending batch. `reads` supplies the value at
    /// `base_addr + index` for the current step (the 6502 pushed them onto
    /// `xstack` top-down; the caller indexes into that buffer). `now_us` is
    /// used to arm/check the 2 ms ACK deadline.
    pub fn poll(
        &mut self,
        fifo: &mut impl PixFifo,
        now_us: u64,
        value_at: impl Fn(u8) -> u16,
    ) -> XregPoll {
        if self.waiting_for_ack {
            self.timers.poll_now(now_us);
            if self.timers.iter_fired().any(|t| t == PixTimer::Ack) {
                ringbuf_entry!(Trace::AckTimedOut);
                self.clear();
                return XregPoll::Failed;
            }
            return XregPoll::Busy;
        }
        if self.pending == 0 {
            return XregPoll::Idle;
        }
        if !fifo.ready() {
            return XregPoll::Busy;
        }
        self.pending -= 1;
        // Normally the largest remaining index goes out first (reverse
        // order). The VGA canvas/mode carve-out jumps index 0 (canvas) to
        // the front of the queue, ahead of the reverse-order loop, so it
        // can't be clobbered by a canvas write that the loop would
        // otherwise emit after mode; every index sent afterward shifts up
        // by one (`index_offset`) to skip the slot already sent.
        let index = if self.canvas_first_pending {
            self.canvas_first_pending = false;
            self.index_offset = 1;
            0
        } else {
            self.pending + self.index_offset
        };
        let addr = self.base_addr.wrapping_add(index);
        let data = value_at(index);
        let frame = PixFrame::new(self.device, self.channel, addr, data);
        fifo.push(frame.encode());
        ringbuf_entry!(Trace::Sent {
            device: self.device,
            channel: self.channel,
            addr
        });
        self.send_count += 1;

        if self.device == PixDevice::Vga as u8 && self.channel == 0 && addr <= 1 {
            self.waiting_for_ack = true;
            self.timers
                .set_timer(PixTimer::Ack, now_us + ACK_TIMEOUT_US, None);
            ringbuf_entry!(Trace::AckWaitStarted);
            return XregPoll::Busy;
        }
        if self.pending == 0 {
            return XregPoll::Done;
        }
        XregPoll::Busy
    }

    /// The companion display ACKed the pending write.
    pub fn ack(&mut self) -> bool {
        self.waiting_for_ack = false;
        self.timers.clear_timer(PixTimer::Ack);
        self.pending == 0
    }

    /// The companion display NAKed the pending write; the whole batch
    /// fails, matching `pix_nak`'s unconditional abort.
    pub fn nak(&mut self) {
        self.clear();
    }

    /// Cancellation: abandons any in-flight batch (reset/halt/stop).
    pub fn clear(&mut self) {
        self.pending = 0;
        self.canvas_first_pending = false;
        self.index_offset = 0;
        self.waiting_for_ack = false;
        self.timers.clear_timer(PixTimer::Ack);
        self.send_count = 0;
    }
}

/// ACK wait deadline for a batched VGA mode/canvas write.
pub const ACK_TIMEOUT_US: u64 = 2_000;

impl Default for PixLink {
    fn default() -> Self {
        Self::new()
    }
}

/// Decoded backchannel byte. ASCII bytes (bit 7 clear) are version-banner
/// text; command bytes (bit 7 set) are structured.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Backchannel {
    Ascii(u8),
    Vsync { frame_low_nibble: u8 },
    Ack,
    Nak,
}

pub fn decode_backchannel(byte: u8) -> Backchannel {
    if byte & backchannel::VSYNC_MASK == 0 {
        return Backchannel::Ascii(byte);
    }
    match byte & backchannel::TAG_MASK {
        backchannel::ACK_MASK => Backchannel::Ack,
        backchannel::NAK_MASK => Backchannel::Nak,
        _ => Backchannel::Vsync {
            frame_low_nibble: byte & backchannel::FRAME_MASK,
        },
    }
}

/// Extends a vsync frame's 4-bit wire nibble to an 8-bit counter by
/// carrying the high nibble locally whenever the low nibble wraps
/// backwards, matching `vga_backchannel_command`'s `vframe` bookkeeping.
pub fn extend_vsync_frame(prev: u8, low_nibble: u8) -> u8 {
    let mut frame = prev;
    if low_nibble < (frame & 0xF) {
        frame = (frame & 0xF0).wrapping_add(0x10);
    }
    (frame & 0xF0) | low_nibble
}

/// VGA presence/vsync state machine.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VgaState {
    NotFound,
    Testing,
    Found,
    Connected,
    NoVersion,
    ConnectionLost,
}

/// How long to wait for the `VGA1` probe response.
pub const PROBE_TIMEOUT_US: u64 = 2_000;
/// How long to wait for the version banner once the backchannel is live.
pub const VERSION_TIMEOUT_US: u64 = 2_000;
/// Vsync watchdog: connection is declared lost after this long without a
/// vsync frame, a little over two frame intervals at 60 Hz.
pub const VSYNC_WATCHDOG_US: u64 = 35_000;

pub struct VgaLink {
    state: VgaState,
    vsync_deadline_us: Option<u64>,
    frame_counter: u8,
}

impl VgaLink {
    pub const fn new() -> Self {
        Self {
            state: VgaState::NotFound,
            vsync_deadline_us: None,
            frame_counter: 0,
        }
    }

    pub fn state(&self) -> VgaState {
        self.state
    }

    pub fn connected(&self) -> bool {
        matches!(self.state, VgaState::Connected | VgaState::NoVersion)
    }

    /// Begins presence detection; call once the disable+probe frames have
    /// been sent on the wire.
    pub fn begin_probe(&mut self) {
        self.state = VgaState::Testing;
    }

    /// The probe window elapsed; `found` reflects whether a `VGA1` token
    /// token arrived on the backchannel within it.
    pub fn probe_result(&mut self, found: bool) {
        self.state = if found {
            VgaState::Found
        } else {
            VgaState::NotFound
        };
    }

    /// A version-banner byte terminator (CR/LF) arrived, or the version
    /// watchdog expired; `got_banner` distinguishes the two.
    pub fn version_resolved(&mut self, now_us: u64, got_banner: bool) {
        self.state = if got_banner {
            VgaState::Connected
        } else {
            VgaState::NoVersion
        };
        self.vsync_deadline_us = Some(now_us + VSYNC_WATCHDOG_US);
    }

    /// A vsync frame arrived on the backchannel.
    pub fn on_vsync(&mut self, now_us: u64, low_nibble: u8) -> u8 {
        self.frame_counter = extend_vsync_frame(self.frame_counter, low_nibble);
        self.vsync_deadline_us = Some(now_us + VSYNC_WATCHDOG_US);
        self.frame_counter
    }

    /// Call once per main-loop tick while connected; returns `true` the
    /// instant the watchdog trips, moving the state to `ConnectionLost`.
    pub fn poll_watchdog(&mut self, now_us: u64) -> bool {
        if !self.connected() {
            return false;
        }
        if let Some(deadline) = self.vsync_deadline_us {
            if now_us >= deadline {
                self.state = VgaState::ConnectionLost;
                self.vsync_deadline_us = None;
                return true;
            }
        }
        false
    }

    /// A 6502 program is about to run; reconnection is attempted only from
    /// `ConnectionLost`, matching `vga_run`'s "it's normal to lose signal
    /// during development" comment.
    pub fn should_reconnect(&self) -> bool {
        self.state == VgaState::ConnectionLost
    }
}

impl Default for VgaLink {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeFifo {
        room: u32,
        sent: heapless_sent::Sent,
    }

    mod heapless_sent {
        #[derive(Default)]
        pub struct Sent(pub [u32; 16], pub usize);
    }

    impl FakeFifo {
        fn new() -> Self {
            Self {
                room: 100,
                sent: Default::default(),
            }
        }
    }

    impl PixFifo for FakeFifo {
        fn ready(&self) -> bool {
            self.room > 0
        }
        fn push(&mut self, frame: u32) {
            self.sent.0[self.sent.1] = frame;
            self.sent.1 += 1;
            self.room -= 1;
        }
    }

    #[test]
    fn frame_encode_packs_fields() {
        let frame = PixFrame::new(1, 2, 3, 0x1234);
        let encoded = frame.encode();
        assert_eq!((encoded >> 28) & 0x7, 1);
        assert_eq!((encoded >> 24) & 0xF, 2);
        assert_eq!((encoded >> 16) & 0xFF, 3);
        assert_eq!(encoded & 0xFFFF, 0x1234);
    }

    #[test]
    fn set_xreg_sends_in_reverse_operand_order() {
        let mut link = PixLink::new();
        let values = [0x10u16, 0x20, 0x30];
        assert!(link.begin_set_xreg(1, 0, 5, 3));
        let mut fifo = FakeFifo::new();

        // device 1 channel 0 never trips the VGA ack special case.
        assert_eq!(link.poll(&mut fifo, 0, |i| values[i as usize]), XregPoll::Busy);
        assert_eq!(link.poll(&mut fifo, 0, |i| values[i as usize]), XregPoll::Busy);
        assert_eq!(link.poll(&mut fifo, 0, |i| values[i as usize]), XregPoll::Done);

        assert_eq!(fifo.sent.1, 3);
        // Largest address (5+2=7) went out first.
        assert_eq!((fifo.sent.0[0] >> 16) & 0xFF, 7);
        assert_eq!(fifo.sent.0[0] & 0xFFFF, 0x30);
        assert_eq!((fifo.sent.0[2] >> 16) & 0xFF, 5);
        assert_eq!(fifo.sent.0[2] & 0xFFFF, 0x10);
    }

    #[test]
    fn vga_write_waits_for_ack_then_completes() {
        let mut link = PixLink::new();
        assert!(link.begin_set_xreg(PixDevice::Vga as u8, 0, 0, 1));
        let mut fifo = FakeFifo::new();
        assert_eq!(link.poll(&mut fifo, 0, |_| 0xBEEF), XregPoll::Busy);
        assert!(link.waiting_for_ack);
        assert_eq!(link.poll(&mut fifo, 100, |_| 0), XregPoll::Busy);
        assert!(link.ack());
    }

    #[test]
    fn vga_ack_timeout_surfaces_as_failed() {
        let mut link = PixLink::new();
        assert!(link.begin_set_xreg(PixDevice::Vga as u8, 0, 0, 1));
        let mut fifo = FakeFifo::new();
        link.poll(&mut fifo, 0, |_| 1);
        assert_eq!(link.poll(&mut fifo, 3_000, |_| 0), XregPoll::Failed);
        assert_eq!(link.send_count(), 0);
    }

    #[test]
    fn canvas_mode_batch_is_detected() {
        let mut link = PixLink::new();
        link.begin_set_xreg(PixDevice::Vga as u8, 0, 0, 2);
        assert!(link.is_vga_canvas_mode_batch());
    }

    #[test]
    fn vga_canvas_mode_batch_sends_canvas_before_mode() {
        // A plain reverse-order emission would send mode (addr 1) before
        // canvas (addr 0), and the canvas write would then clobber the
        // mode register that was just set. The carve-out must jump canvas
        // to the front of the queue instead.
        let mut link = PixLink::new();
        let values = [0x1111u16, 0x2222u16];
        assert!(link.begin_set_xreg(PixDevice::Vga as u8, 0, 0, 2));
        let mut fifo = FakeFifo::new();

        assert_eq!(
            link.poll(&mut fifo, 0, |i| values[i as usize]),
            XregPoll::Busy
        );
        assert_eq!(fifo.sent.1, 1);
        assert_eq!((fifo.sent.0[0] >> 16) & 0xFF, 0); // canvas addr
        assert_eq!(fifo.sent.0[0] & 0xFFFF, 0x1111);
        assert!(!link.ack()); // mode still pending

        assert_eq!(
            link.poll(&mut fifo, 0, |i| values[i as usize]),
            XregPoll::Busy
        );
        assert_eq!(fifo.sent.1, 2);
        assert_eq!((fifo.sent.0[1] >> 16) & 0xFF, 1); // mode addr, sent second
        assert_eq!(fifo.sent.0[1] & 0xFFFF, 0x2222);
        assert!(link.ack()); // batch complete
    }

    #[test]
    fn backchannel_decodes_ascii_vsync_ack_nak() {
        assert_eq!(decode_backchannel(b'V'), Backchannel::Ascii(b'V'));
        assert_eq!(
            decode_backchannel(0x83),
            Backchannel::Vsync { frame_low_nibble: 3 }
        );
        assert_eq!(decode_backchannel(0x91), Backchannel::Ack);
        assert_eq!(decode_backchannel(0xA5), Backchannel::Nak);
    }

    #[test]
    fn vsync_frame_extension_carries_high_nibble_on_wrap() {
        let f = extend_vsync_frame(0x0F, 0x0);
        assert_eq!(f, 0x10);
        let f2 = extend_vsync_frame(0x12, 0x3);
        assert_eq!(f2, 0x13);
    }

    #[test]
    fn vsync_watchdog_trips_after_35ms() {
        let mut link = VgaLink::new();
        link.begin_probe();
        link.probe_result(true);
        link.version_resolved(0, true);
        assert!(link.connected());
        assert!(!link.poll_watchdog(30_000));
        assert!(link.poll_watchdog(35_000));
        assert_eq!(link.state(), VgaState::ConnectionLost);
        assert!(link.should_reconnect());
    }

    #[test]
    fn vsync_resets_watchdog() {
        let mut link = VgaLink::new();
        link.begin_probe();
        link.probe_result(true);
        link.version_resolved(0, true);
        link.on_vsync(20_000, 1);
        assert!(!link.poll_watchdog(40_000));
        assert!(link.poll_watchdog(55_000));
    }

    #[test]
    fn no_version_still_counts_as_connected() {
        let mut link = VgaLink::new();
        link.begin_probe();
        link.probe_result(true);
        link.version_resolved(0, false);
        assert_eq!(link.state(), VgaState::NoVersion);
        assert!(link.connected());
    }
}
