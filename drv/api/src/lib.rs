// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The API dispatcher (C4): everything downstream of an `ApiTrigger` effect
//! from the action loop.
//!
//! This crate owns the auxiliary stack (`xstack`) marshaling rules, the
//! open-file table, the errno-numbering boundary, and the opcode dispatch
//! itself. It knows nothing about the bus, PIO, or DMA; callers hand it a
//! byte slice for `xram` and an implementation of [`BlockStore`] /
//! [`ConfigStore`], and read back either an immediate result or a `Busy`
//! signal to poll again next tick.
//!
//! Argument marshaling follows `api.c`: most calls carry their arguments
//! on `xstack`, short-encoded (a value is pushed using only as many bytes
//! as it needs; missing high bytes read back as zero). A handful of calls
//! — `Open`'s flags, `Close`/`Read`/`Write`/`Lseek`/`Fstat`/`Readdir`'s file
//! number — are instead carried in the 6502's accumulator at the moment
//! `API_OP` was written. This port has no visibility into real 6502
//! register state (the bus engine only sees bus cycles, not CPU
//! internals), so that single byte is modeled as the `reg_a` parameter to
//! [`ApiDispatcher::begin`]; the firmware layer is responsible for having
//! latched it by whatever means the hardware provides.

#![no_std]

use ria_abi::{Errno, Numbering, OpenFlags};
use ringbuf::{ringbuf, ringbuf_entry};

/// Width of the auxiliary stack, including the permanent zero sentinel.
pub const XSTACK_SIZE: usize = ria_abi::XSTACK_SIZE;

/// Top-down auxiliary stack. `ptr == XSTACK_SIZE` is empty; pushing
/// decreases `ptr`, reads are always `buf[ptr..XSTACK_SIZE]`.
pub struct XStack {
    buf: [u8; XSTACK_SIZE],
    ptr: usize,
}

impl XStack {
    pub const fn new() -> Self {
        Self {
            buf: [0; XSTACK_SIZE],
            ptr: XSTACK_SIZE,
        }
    }

    pub fn remaining(&self) -> usize {
        XSTACK_SIZE - self.ptr
    }

    pub fn is_empty(&self) -> bool {
        self.ptr == XSTACK_SIZE
    }

    pub fn clear(&mut self) {
        self.ptr = XSTACK_SIZE;
    }

    /// Stages `bytes` at the top of the stack, verbatim. Used by the
    /// firmware to hand back call results (`Read`'s bytes, `Stat`'s
    /// struct) and by tests to stage call arguments — the wire format is
    /// symmetric in both directions.
    pub fn push(&mut self, bytes: &[u8]) {
        let n = bytes.len().min(XSTACK_SIZE);
        self.ptr = XSTACK_SIZE - n;
        self.buf[self.ptr..XSTACK_SIZE].copy_from_slice(&bytes[bytes.len() - n..]);
    }

    /// Takes every remaining byte as a single blob (a path, a write
    /// buffer), emptying the stack.
    pub fn take_remaining(&mut self) -> &[u8] {
        let start = self.ptr;
        self.ptr = XSTACK_SIZE;
        &self.buf[start..XSTACK_SIZE]
    }

    /// Pops one byte without requiring the stack to be empty afterward.
    /// Reads as zero past the end, matching the short-encoding rule.
    pub fn pop_u8(&mut self) -> u8 {
        if self.ptr >= XSTACK_SIZE {
            0
        } else {
            let v = self.buf[self.ptr];
            self.ptr += 1;
            v
        }
    }

    /// As [`Self::pop_u8`], but for a little-endian 16-bit value.
    pub fn pop_u16(&mut self) -> u16 {
        let lo = self.pop_u8();
        let hi = self.pop_u8();
        u16::from_le_bytes([lo, hi])
    }

    /// Pops the final argument on the stack as a short-encoded `u8`.
    /// Mirrors `api_pop_uint8_end`: 0 bytes remaining reads as zero, 1
    /// byte is consumed whole, anything else is a marshaling error.
    pub fn pop_u8_end(&mut self) -> Result<u8, Errno> {
        match self.remaining() {
            0 => Ok(0),
            1 => {
                let v = self.buf[self.ptr];
                self.ptr = XSTACK_SIZE;
                Ok(v)
            }
            _ => Err(Errno::Inval),
        }
    }

    /// Mirrors `api_pop_uint16_end`.
    pub fn pop_u16_end(&mut self) -> Result<u16, Errno> {
        let rem = self.remaining();
        if rem > 2 {
            return Err(Errno::Inval);
        }
        let mut bytes = [0u8; 2];
        bytes[..rem].copy_from_slice(&self.buf[self.ptr..self.ptr + rem]);
        self.ptr = XSTACK_SIZE;
        Ok(u16::from_le_bytes(bytes))
    }

    /// Mirrors `api_pop_uint32_end`.
    pub fn pop_u32_end(&mut self) -> Result<u32, Errno> {
        let rem = self.remaining();
        if rem > 4 {
            return Err(Errno::Inval);
        }
        let mut bytes = [0u8; 4];
        bytes[..rem].copy_from_slice(&self.buf[self.ptr..self.ptr + rem]);
        self.ptr = XSTACK_SIZE;
        Ok(u32::from_le_bytes(bytes))
    }

    pub fn pop_i32_end(&mut self) -> Result<i32, Errno> {
        self.pop_u32_end().map(|v| v as i32)
    }
}

impl Default for XStack {
    fn default() -> Self {
        Self::new()
    }
}

/// Splits a `from\0to` rename payload at the first NUL. Two-string calls
/// are the one case where short-encoding's "everything remaining belongs
/// to this argument" rule isn't enough on its own.
fn split_nul(buf: &[u8]) -> (&[u8], &[u8]) {
    match buf.iter().position(|&b| b == 0) {
        Some(i) => (&buf[..i], &buf[i + 1..]),
        None => (buf, &buf[buf.len()..]),
    }
}

/// Where a `Lseek` offset is measured from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SeekFrom {
    Start(u32),
    Current(i32),
    End(i32),
}

fn decode_whence(whence: u8, offset: i32) -> Result<SeekFrom, Errno> {
    match whence {
        0 => Ok(SeekFrom::Start(offset as u32)),
        1 => Ok(SeekFrom::Current(offset)),
        2 => Ok(SeekFrom::End(offset)),
        _ => Err(Errno::Inval),
    }
}

/// Result of a `Stat`/`Fstat` call.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Default)]
pub struct FileStat {
    pub size: u32,
    pub is_dir: bool,
}

impl FileStat {
    fn encode(self) -> [u8; 5] {
        let mut out = [0u8; 5];
        out[..4].copy_from_slice(&self.size.to_le_bytes());
        out[4] = self.is_dir as u8;
        out
    }
}

/// The collaborator this core calls out to for every filesystem-shaped
/// operation. Backed by FatFs over USB mass storage on real hardware;
/// this crate only ever sees it through the trait.
pub trait BlockStore {
    type Handle: Copy;

    fn open(&mut self, path: &[u8], flags: OpenFlags) -> Result<Self::Handle, Errno>;
    fn close(&mut self, handle: Self::Handle) -> Result<(), Errno>;
    fn read(&mut self, handle: Self::Handle, buf: &mut [u8]) -> Result<usize, Errno>;
    fn write(&mut self, handle: Self::Handle, buf: &[u8]) -> Result<usize, Errno>;
    fn seek(&mut self, handle: Self::Handle, pos: SeekFrom) -> Result<u32, Errno>;
    fn stat(&mut self, path: &[u8]) -> Result<FileStat, Errno>;
    fn fstat(&mut self, handle: Self::Handle) -> Result<FileStat, Errno>;
    fn unlink(&mut self, path: &[u8]) -> Result<(), Errno>;
    fn rename(&mut self, from: &[u8], to: &[u8]) -> Result<(), Errno>;
    fn mkdir(&mut self, path: &[u8]) -> Result<(), Errno>;
    fn rmdir(&mut self, path: &[u8]) -> Result<(), Errno>;
    fn opendir(&mut self, path: &[u8]) -> Result<Self::Handle, Errno>;
    /// Writes the next entry's name into `out`, returning its length; `0`
    /// marks end-of-directory.
    fn readdir(&mut self, handle: Self::Handle, out: &mut [u8]) -> Result<usize, Errno>;
    fn chdir(&mut self, path: &[u8]) -> Result<(), Errno>;
    fn getcwd(&mut self, out: &mut [u8]) -> Result<usize, Errno>;
}

/// The collaborator backing `CONFIG.SYS`: a little filesystem on internal
/// flash holding one ASCII record per line. This crate only parses and
/// serializes the bytes; committing them to flash is the store's job.
pub trait ConfigStore {
    fn load(&mut self, out: &mut [u8]) -> Result<usize, Errno>;
    fn save(&mut self, data: &[u8]) -> Result<(), Errno>;
}

/// What a completed `SetXreg` batch is handed off to. Kept abstract
/// rather than depending on `ria-pix` directly, so this crate doesn't need
/// to track that crate's internal batching state — only whether a batch
/// was accepted and whether one is still draining.
pub trait PixXregSink {
    fn begin_xreg(&mut self, device: u8, channel: u8, addr: u8, values: &[u16]) -> bool;
    fn xreg_busy(&self) -> bool;
}

/// USB host enumeration and HID report polling, reduced to what the API
/// dispatcher and the main poll loop need: whether a mass-storage device
/// is present, and the next raw HID report if one arrived. Everything
/// else (descriptor parsing, gamepad remapping) is the collaborator's
/// problem.
pub trait UsbHost {
    /// One raw HID report from whichever device last produced one.
    fn poll_hid(&mut self) -> Option<[u8; 8]>;
    /// A mass-storage device was newly enumerated.
    fn mount(&mut self) -> bool;
    /// The mounted mass-storage device went away; open file descriptors
    /// backed by it are the caller's responsibility to fail out.
    fn unmount(&mut self);
}

/// The host-side operator terminal: a hardware UART bridged to USB CDC
/// when present. Reduced to non-blocking probe-or-skip I/O, matching the
/// action loop's own `Uart` trait in spirit (see `drv/action-loop`) but
/// independent of it, since this one is polled from the main thread for
/// the monitor and `sys_log!`, not from the bus-event path.
pub trait ConsoleUart {
    fn try_read_byte(&mut self) -> Option<u8>;
    fn try_write_byte(&mut self, byte: u8) -> bool;
    /// Applies a USB CDC `SetLineCoding` request, or a host-side `stty`
    /// equivalent.
    fn set_line_coding(&mut self, baud: u32, data_bits: u8, stop_bits: u8, parity: u8);
}

/// Parsed `CONFIG.SYS`. Field names and the `+<letter><value>` line shape
/// come directly from `cfg.c`; this port treats every value as decimal
/// ASCII rather than mixing hex and decimal per field; see `DESIGN.md`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Config {
    pub version: u8,
    pub phi2_khz: u32,
    pub caps: u8,
    pub resb_us: u32,
    pub codepage: u16,
    boot_rom: [u8; 32],
    boot_rom_len: usize,
}

impl Config {
    pub const fn defaults() -> Self {
        Self {
            version: 1,
            phi2_khz: 8000,
            caps: 0,
            resb_us: 0,
            codepage: 437,
            boot_rom: [0; 32],
            boot_rom_len: 0,
        }
    }

    pub fn boot_rom(&self) -> &[u8] {
        &self.boot_rom[..self.boot_rom_len]
    }

    fn set_boot_rom(&mut self, name: &[u8]) {
        let n = name.len().min(self.boot_rom.len());
        self.boot_rom[..n].copy_from_slice(&name[..n]);
        self.boot_rom_len = n;
    }

    /// Parses `CONFIG.SYS` content. `+V1` must appear before any other
    /// directive is meaningful (per `cfg.c`); a bare, non-`+`-prefixed
    /// line names the boot ROM and ends the file, so parsing stops there.
    pub fn parse(data: &[u8]) -> Self {
        let mut cfg = Self::defaults();
        for raw_line in data.split(|&b| b == b'\n') {
            let line = trim_cr(raw_line);
            if line.is_empty() {
                continue;
            }
            if line[0] == b'+' && line.len() >= 2 {
                let key = line[1];
                let value = &line[2..];
                match key {
                    b'V' => {
                        if let Some(v) = parse_decimal_u32(value) {
                            cfg.version = v as u8;
                        }
                    }
                    b'P' => {
                        if let Some(v) = parse_decimal_u32(value) {
                            cfg.phi2_khz = v;
                        }
                    }
                    b'C' => {
                        if let Some(v) = parse_decimal_u32(value) {
                            cfg.caps = v as u8;
                        }
                    }
                    b'R' => {
                        if let Some(v) = parse_decimal_u32(value) {
                            cfg.resb_us = v;
                        }
                    }
                    b'S' => {
                        if let Some(v) = parse_decimal_u32(value) {
                            cfg.codepage = v as u16;
                        }
                    }
                    _ => {}
                }
            } else {
                cfg.set_boot_rom(line);
                break;
            }
        }
        cfg
    }

    /// Serializes back to the same line format, returning the number of
    /// bytes written. `out` must be at least 64 bytes for every field plus
    /// the boot ROM name to fit.
    pub fn serialize(&self, out: &mut [u8]) -> usize {
        let mut w = Writer { buf: out, pos: 0 };
        w.line_u32(b'V', self.version as u32);
        w.line_u32(b'P', self.phi2_khz);
        w.line_u32(b'C', self.caps as u32);
        w.line_u32(b'R', self.resb_us);
        w.line_u32(b'S', self.codepage as u32);
        w.raw_line(self.boot_rom());
        w.pos
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::defaults()
    }
}

struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    fn byte(&mut self, b: u8) {
        if self.pos < self.buf.len() {
            self.buf[self.pos] = b;
            self.pos += 1;
        }
    }

    fn raw_line(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.byte(b);
        }
        self.byte(b'\n');
    }

    fn line_u32(&mut self, key: u8, value: u32) {
        self.byte(b'+');
        self.byte(key);
        let mut digits = [0u8; 10];
        let mut n = 0;
        let mut v = value;
        if v == 0 {
            digits[0] = b'0';
            n = 1;
        } else {
            while v > 0 {
                digits[n] = b'0' + (v % 10) as u8;
                v /= 10;
                n += 1;
            }
        }
        for i in (0..n).rev() {
            self.byte(digits[i]);
        }
        self.byte(b'\n');
    }
}

fn trim_cr(line: &[u8]) -> &[u8] {
    if let [rest @ .., b'\r'] = line {
        rest
    } else {
        line
    }
}

fn parse_decimal_u32(digits: &[u8]) -> Option<u32> {
    if digits.is_empty() {
        return None;
    }
    let mut v: u32 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return None;
        }
        v = v.checked_mul(10)?.checked_add((b - b'0') as u32)?;
    }
    Some(v)
}

/// Number of simultaneously open files/directories, matching `FIL_MAX`.
pub const FD_POOL_SIZE: usize = ria_abi::FD_POOL_SIZE;
const FD_RESERVED: u8 = ria_abi::FD_RESERVED;

/// Open-file table. Pool index `i` is reported to the 6502 as
/// `i + FD_RESERVED`, matching `FIL_OFFS` in `std.c`.
pub struct FdPool<H> {
    slots: [Option<H>; FD_POOL_SIZE],
}

impl<H: Copy> FdPool<H> {
    pub const fn new() -> Self {
        Self {
            slots: [None; FD_POOL_SIZE],
        }
    }

    fn alloc(&mut self, handle: H) -> Option<u8> {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(handle);
                return Some(i as u8 + FD_RESERVED);
            }
        }
        None
    }

    fn get(&self, fd: u8) -> Option<H> {
        if fd < FD_RESERVED {
            return None;
        }
        self.slots
            .get((fd - FD_RESERVED) as usize)
            .copied()
            .flatten()
    }

    fn take(&mut self, fd: u8) -> Option<H> {
        if fd < FD_RESERVED {
            return None;
        }
        self.slots.get_mut((fd - FD_RESERVED) as usize)?.take()
    }

    /// Drains every open handle, for `Exit`-time cleanup.
    fn drain(&mut self) -> impl Iterator<Item = H> + '_ {
        self.slots.iter_mut().filter_map(|s| s.take())
    }
}

impl<H: Copy> Default for FdPool<H> {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of a completed call: the value written back to the 6502's A/X
/// registers on success, or the abstract error to translate through
/// [`Errno::to_numbering`] and publish at `API_ERRNO` on failure.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ApiResult {
    Ok(i32),
    Err(Errno),
}

/// What a dispatcher tick produced.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ApiPoll {
    /// No call in flight.
    Idle,
    /// A call is still draining (only `SetXreg`, here); poll again.
    Busy,
    Done(ApiResult),
}

const MAX_XREG_BATCH: usize = 64;

enum Pending {
    None,
    SetXreg {
        device: u8,
        channel: u8,
        addr: u8,
        values: [u16; MAX_XREG_BATCH],
        count: u8,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Trace {
    None,
    Begin(u8),
    Done,
    Failed(Errno),
}

ringbuf!(Trace, 32, Trace::None);

/// Dispatch state carried between calls: the open-file table and the
/// session-wide options set by `ErrnoOpt`/`CodePage`/`StdinOpt`.
pub struct ApiDispatcher<BS: BlockStore> {
    fds: FdPool<BS::Handle>,
    numbering: Numbering,
    codepage: u16,
    stdin_blocking: bool,
    requested_phi2_khz: Option<u32>,
    pending: Pending,
}

impl<BS: BlockStore> ApiDispatcher<BS> {
    pub const fn new() -> Self {
        Self {
            fds: FdPool::new(),
            numbering: Numbering::Cc65,
            codepage: 437,
            stdin_blocking: true,
            requested_phi2_khz: None,
            pending: Pending::None,
        }
    }

    pub fn numbering(&self) -> Numbering {
        self.numbering
    }

    pub fn codepage(&self) -> u16 {
        self.codepage
    }

    pub fn stdin_blocking(&self) -> bool {
        self.stdin_blocking
    }

    /// Drains the reclock request left by a `Phi2` call, if any.
    pub fn take_requested_phi2_khz(&mut self) -> Option<u32> {
        self.requested_phi2_khz.take()
    }

    /// The byte to publish at `API_ERRNO`, in the active numbering.
    pub fn errno_byte(&self, errno: Errno) -> u8 {
        errno.to_numbering(self.numbering)
    }

    /// Begins dispatching one latched opcode. `reg_a` is the byte this
    /// port models in place of real 6502 accumulator state (see the
    /// module doc comment).
    pub fn begin(
        &mut self,
        opcode: u8,
        reg_a: u8,
        xstack: &mut XStack,
        xram: &mut [u8],
        bs: &mut BS,
    ) -> ApiPoll {
        use num_traits::FromPrimitive;
        ringbuf_entry!(Trace::Begin(opcode));
        let op = match ria_abi::ApiOp::from_u8(opcode) {
            Some(op) => op,
            None => {
                ringbuf_entry!(Trace::Failed(Errno::NoSys));
                return ApiPoll::Done(ApiResult::Err(Errno::NoSys));
            }
        };
        let result = self.dispatch(op, reg_a, xstack, xram, bs);
        match result {
            ApiPoll::Done(ApiResult::Err(e)) => ringbuf_entry!(Trace::Failed(e)),
            ApiPoll::Done(ApiResult::Ok(_)) => ringbuf_entry!(Trace::Done),
            ApiPoll::Busy | ApiPoll::Idle => {}
        }
        result
    }

    /// Advances a call left `Busy` by `begin`. Only `SetXreg` needs this;
    /// every other op completes synchronously.
    pub fn poll_pending(&mut self, pix: &mut impl PixXregSink) -> ApiPoll {
        match &self.pending {
            Pending::None => ApiPoll::Idle,
            Pending::SetXreg { .. } => {
                if pix.xreg_busy() {
                    ApiPoll::Busy
                } else {
                    self.pending = Pending::None;
                    ringbuf_entry!(Trace::Done);
                    ApiPoll::Done(ApiResult::Ok(0))
                }
            }
        }
    }

    fn dispatch(
        &mut self,
        op: ria_abi::ApiOp,
        reg_a: u8,
        xstack: &mut XStack,
        xram: &mut [u8],
        bs: &mut BS,
    ) -> ApiPoll {
        use ria_abi::ApiOp::*;
        let done_ok = |v: i32| ApiPoll::Done(ApiResult::Ok(v));
        let done_err = |e: Errno| ApiPoll::Done(ApiResult::Err(e));
        match op {
            Exit => {
                for h in self.fds.drain() {
                    let _ = bs.close(h);
                }
                done_ok(0)
            }
            Phi2 => match xstack.pop_u32_end() {
                Ok(khz) => {
                    self.requested_phi2_khz = Some(khz);
                    done_ok(0)
                }
                Err(e) => done_err(e),
            },
            Open => {
                let flags = OpenFlags::from_bits_truncate(reg_a);
                let path = xstack.take_remaining();
                match bs.open(path, flags) {
                    Ok(handle) => match self.fds.alloc(handle) {
                        Some(fd) => done_ok(fd as i32),
                        None => {
                            let _ = bs.close(handle);
                            done_err(Errno::MFile)
                        }
                    },
                    Err(e) => done_err(e),
                }
            }
            Close => match self.fds.take(reg_a) {
                Some(h) => match bs.close(h) {
                    Ok(()) => done_ok(0),
                    Err(e) => done_err(e),
                },
                None => done_err(Errno::BadF),
            },
            Read => {
                let count = match xstack.pop_u16_end() {
                    Ok(c) => c as usize,
                    Err(e) => return done_err(e),
                };
                let Some(h) = self.fds.get(reg_a) else {
                    return done_err(Errno::BadF);
                };
                let mut tmp = [0u8; XSTACK_SIZE];
                let cap = count.min(tmp.len());
                match bs.read(h, &mut tmp[..cap]) {
                    Ok(n) => {
                        xstack.push(&tmp[..n]);
                        done_ok(n as i32)
                    }
                    Err(e) => done_err(e),
                }
            }
            ReadXram => {
                let addr = xstack.pop_u16() as usize;
                let count = match xstack.pop_u16_end() {
                    Ok(c) => c as usize,
                    Err(e) => return done_err(e),
                };
                let Some(h) = self.fds.get(reg_a) else {
                    return done_err(Errno::BadF);
                };
                let Some(dst) = xram.get_mut(addr..addr.saturating_add(count).min(xram.len()))
                else {
                    return done_err(Errno::Inval);
                };
                match bs.read(h, dst) {
                    Ok(n) => done_ok(n as i32),
                    Err(e) => done_err(e),
                }
            }
            Write => {
                let Some(h) = self.fds.get(reg_a) else {
                    return done_err(Errno::BadF);
                };
                let buf = xstack.take_remaining();
                match bs.write(h, buf) {
                    Ok(n) => done_ok(n as i32),
                    Err(e) => done_err(e),
                }
            }
            WriteXram => {
                let addr = xstack.pop_u16() as usize;
                let count = match xstack.pop_u16_end() {
                    Ok(c) => c as usize,
                    Err(e) => return done_err(e),
                };
                let Some(h) = self.fds.get(reg_a) else {
                    return done_err(Errno::BadF);
                };
                let Some(src) = xram.get(addr..addr.saturating_add(count).min(xram.len())) else {
                    return done_err(Errno::Inval);
                };
                match bs.write(h, src) {
                    Ok(n) => done_ok(n as i32),
                    Err(e) => done_err(e),
                }
            }
            Lseek => {
                let whence = xstack.pop_u8();
                let offset = match xstack.pop_i32_end() {
                    Ok(v) => v,
                    Err(e) => return done_err(e),
                };
                let Some(h) = self.fds.get(reg_a) else {
                    return done_err(Errno::BadF);
                };
                let pos = match decode_whence(whence, offset) {
                    Ok(p) => p,
                    Err(e) => return done_err(e),
                };
                match bs.seek(h, pos) {
                    Ok(new_pos) => {
                        let clamped = new_pos.min(0x7FFF_FFFF);
                        done_ok(clamped as i32)
                    }
                    Err(e) => done_err(e),
                }
            }
            Unlink => {
                let path = xstack.take_remaining();
                match bs.unlink(path) {
                    Ok(()) => done_ok(0),
                    Err(e) => done_err(e),
                }
            }
            Rename => {
                let (from, to) = split_nul(xstack.take_remaining());
                match bs.rename(from, to) {
                    Ok(()) => done_ok(0),
                    Err(e) => done_err(e),
                }
            }
            Stat => {
                let path = xstack.take_remaining();
                match bs.stat(path) {
                    Ok(st) => {
                        xstack.push(&st.encode());
                        done_ok(0)
                    }
                    Err(e) => done_err(e),
                }
            }
            Fstat => match self.fds.get(reg_a) {
                Some(h) => match bs.fstat(h) {
                    Ok(st) => {
                        xstack.push(&st.encode());
                        done_ok(0)
                    }
                    Err(e) => done_err(e),
                },
                None => done_err(Errno::BadF),
            },
            Opendir => {
                let path = xstack.take_remaining();
                match bs.opendir(path) {
                    Ok(handle) => match self.fds.alloc(handle) {
                        Some(fd) => done_ok(fd as i32),
                        None => {
                            let _ = bs.close(handle);
                            done_err(Errno::MFile)
                        }
                    },
                    Err(e) => done_err(e),
                }
            }
            Readdir => {
                let Some(h) = self.fds.get(reg_a) else {
                    return done_err(Errno::BadF);
                };
                let mut tmp = [0u8; 255];
                match bs.readdir(h, &mut tmp) {
                    Ok(n) => {
                        xstack.push(&tmp[..n]);
                        done_ok(n as i32)
                    }
                    Err(e) => done_err(e),
                }
            }
            Chdir => {
                let path = xstack.take_remaining();
                match bs.chdir(path) {
                    Ok(()) => done_ok(0),
                    Err(e) => done_err(e),
                }
            }
            Getcwd => {
                let mut tmp = [0u8; 255];
                match bs.getcwd(&mut tmp) {
                    Ok(n) => {
                        xstack.push(&tmp[..n]);
                        done_ok(n as i32)
                    }
                    Err(e) => done_err(e),
                }
            }
            Mkdir => {
                let path = xstack.take_remaining();
                match bs.mkdir(path) {
                    Ok(()) => done_ok(0),
                    Err(e) => done_err(e),
                }
            }
            Rmdir => {
                let path = xstack.take_remaining();
                match bs.rmdir(path) {
                    Ok(()) => done_ok(0),
                    Err(e) => done_err(e),
                }
            }
            Clock => done_ok(0),
            Rtc => done_ok(0),
            ErrnoOpt => {
                self.numbering = if reg_a == 0 {
                    Numbering::Cc65
                } else {
                    Numbering::Llvm
                };
                done_ok(0)
            }
            CodePage => match xstack.pop_u16_end() {
                Ok(cp) => {
                    self.codepage = cp;
                    done_ok(0)
                }
                Err(e) => done_err(e),
            },
            StdinOpt => {
                self.stdin_blocking = reg_a == 0;
                done_ok(0)
            }
            SetXreg => {
                let channel = xstack.pop_u8();
                let addr = xstack.pop_u8();
                let count = xstack.pop_u8() as usize;
                if count > MAX_XREG_BATCH || count * 2 != xstack.remaining() {
                    xstack.clear();
                    return done_err(Errno::Inval);
                }
                let mut values = [0u16; MAX_XREG_BATCH];
                for slot in values.iter_mut().take(count) {
                    *slot = xstack.pop_u16();
                }
                self.pending = Pending::SetXreg {
                    device: reg_a,
                    channel,
                    addr,
                    values,
                    count: count as u8,
                };
                ApiPoll::Busy
            }
        }
    }

    /// Hands a staged `SetXreg` batch to `pix`, if one is pending. Call
    /// once, immediately after a `Busy` result from `begin`.
    pub fn submit_pending(&mut self, pix: &mut impl PixXregSink) {
        if let Pending::SetXreg {
            device,
            channel,
            addr,
            values,
            count,
        } = &self.pending
        {
            pix.begin_xreg(*device, *channel, *addr, &values[..*count as usize]);
        }
    }
}

impl<BS: BlockStore> Default for ApiDispatcher<BS> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy)]
    struct FakeHandle(usize);

    struct FakeFile {
        name: [u8; 32],
        name_len: usize,
        data: [u8; 64],
        len: usize,
        pos: usize,
        is_dir: bool,
    }

    pub struct FakeStore {
        files: [Option<FakeFile>; 4],
    }

    impl FakeStore {
        pub fn new() -> Self {
            Self {
                files: [None, None, None, None],
            }
        }

        fn find(&self, path: &[u8]) -> Option<usize> {
            self.files.iter().position(|f| {
                f.as_ref()
                    .map(|f| &f.name[..f.name_len] == path)
                    .unwrap_or(false)
            })
        }
    }

    impl BlockStore for FakeStore {
        type Handle = FakeHandle;

        fn open(&mut self, path: &[u8], flags: OpenFlags) -> Result<Self::Handle, Errno> {
            if let Some(i) = self.find(path) {
                return Ok(FakeHandle(i));
            }
            if !flags.contains(OpenFlags::CREATE) {
                return Err(Errno::NoEnt);
            }
            let slot = self.files.iter().position(|f| f.is_none()).ok_or(Errno::NoSpc)?;
            let mut name = [0u8; 32];
            let n = path.len().min(32);
            name[..n].copy_from_slice(&path[..n]);
            self.files[slot] = Some(FakeFile {
                name,
                name_len: n,
                data: [0; 64],
                len: 0,
                pos: 0,
                is_dir: false,
            });
            Ok(FakeHandle(slot))
        }

        fn close(&mut self, _handle: Self::Handle) -> Result<(), Errno> {
            Ok(())
        }

        fn read(&mut self, handle: Self::Handle, buf: &mut [u8]) -> Result<usize, Errno> {
            let f = self.files[handle.0].as_mut().ok_or(Errno::BadF)?;
            let n = buf.len().min(f.len.saturating_sub(f.pos));
            buf[..n].copy_from_slice(&f.data[f.pos..f.pos + n]);
            f.pos += n;
            Ok(n)
        }

        fn write(&mut self, handle: Self::Handle, buf: &[u8]) -> Result<usize, Errno> {
            let f = self.files[handle.0].as_mut().ok_or(Errno::BadF)?;
            let n = buf.len().min(f.data.len().saturating_sub(f.pos));
            f.data[f.pos..f.pos + n].copy_from_slice(&buf[..n]);
            f.pos += n;
            f.len = f.len.max(f.pos);
            Ok(n)
        }

        fn seek(&mut self, handle: Self::Handle, pos: SeekFrom) -> Result<u32, Errno> {
            let f = self.files[handle.0].as_mut().ok_or(Errno::BadF)?;
            let new_pos = match pos {
                SeekFrom::Start(p) => p as i64,
                SeekFrom::Current(d) => f.pos as i64 + d as i64,
                SeekFrom::End(d) => f.len as i64 + d as i64,
            };
            if new_pos < 0 {
                return Err(Errno::Inval);
            }
            f.pos = new_pos as usize;
            Ok(f.pos as u32)
        }

        fn stat(&mut self, path: &[u8]) -> Result<FileStat, Errno> {
            let i = self.find(path).ok_or(Errno::NoEnt)?;
            let f = self.files[i].as_ref().unwrap();
            Ok(FileStat {
                size: f.len as u32,
                is_dir: f.is_dir,
            })
        }

        fn fstat(&mut self, handle: Self::Handle) -> Result<FileStat, Errno> {
            let f = self.files[handle.0].as_ref().ok_or(Errno::BadF)?;
            Ok(FileStat {
                size: f.len as u32,
                is_dir: f.is_dir,
            })
        }

        fn unlink(&mut self, path: &[u8]) -> Result<(), Errno> {
            let i = self.find(path).ok_or(Errno::NoEnt)?;
            self.files[i] = None;
            Ok(())
        }

        fn rename(&mut self, from: &[u8], to: &[u8]) -> Result<(), Errno> {
            let i = self.find(from).ok_or(Errno::NoEnt)?;
            let n = to.len().min(32);
            let f = self.files[i].as_mut().unwrap();
            f.name[..n].copy_from_slice(&to[..n]);
            f.name_len = n;
            Ok(())
        }

        fn mkdir(&mut self, _path: &[u8]) -> Result<(), Errno> {
            Ok(())
        }

        fn rmdir(&mut self, _path: &[u8]) -> Result<(), Errno> {
            Ok(())
        }

        fn opendir(&mut self, _path: &[u8]) -> Result<Self::Handle, Errno> {
            Err(Errno::NoSys)
        }

        fn readdir(&mut self, _handle: Self::Handle, _out: &mut [u8]) -> Result<usize, Errno> {
            Ok(0)
        }

        fn chdir(&mut self, _path: &[u8]) -> Result<(), Errno> {
            Ok(())
        }

        fn getcwd(&mut self, out: &mut [u8]) -> Result<usize, Errno> {
            out[..1].copy_from_slice(b"/");
            Ok(1)
        }
    }

    /// In-memory stand-ins for the `UsbHost`/`ConsoleUart` collaborators,
    /// alongside `FakeStore`/`FakePix` below — all four traits implemented
    /// entirely in memory, the same role the teacher's simulated
    /// peripherals play in task-level unit tests.
    pub struct FakeUsbHost {
        pub pending_reports: [Option<[u8; 8]>; 4],
        pub mounted: bool,
    }

    impl FakeUsbHost {
        fn new() -> Self {
            Self {
                pending_reports: [None; 4],
                mounted: false,
            }
        }
    }

    impl UsbHost for FakeUsbHost {
        fn poll_hid(&mut self) -> Option<[u8; 8]> {
            let slot = self.pending_reports.iter().position(|r| r.is_some())?;
            self.pending_reports[slot].take()
        }
        fn mount(&mut self) -> bool {
            self.mounted
        }
        fn unmount(&mut self) {
            self.mounted = false;
        }
    }

    pub struct FakeConsole {
        pub rx_queue: [Option<u8>; 4],
        pub last_write: Option<u8>,
    }

    impl FakeConsole {
        fn new() -> Self {
            Self {
                rx_queue: [None; 4],
                last_write: None,
            }
        }
    }

    impl ConsoleUart for FakeConsole {
        fn try_read_byte(&mut self) -> Option<u8> {
            let slot = self.rx_queue.iter().position(|b| b.is_some())?;
            self.rx_queue[slot].take()
        }
        fn try_write_byte(&mut self, byte: u8) -> bool {
            self.last_write = Some(byte);
            true
        }
        fn set_line_coding(&mut self, _baud: u32, _data_bits: u8, _stop_bits: u8, _parity: u8) {}
    }

    #[test]
    fn fake_usb_host_reports_drain_in_order() {
        let mut host = FakeUsbHost::new();
        host.pending_reports[0] = Some([1; 8]);
        host.pending_reports[1] = Some([2; 8]);
        assert_eq!(host.poll_hid(), Some([1; 8]));
        assert_eq!(host.poll_hid(), Some([2; 8]));
        assert_eq!(host.poll_hid(), None);
    }

    #[test]
    fn fake_console_echoes_last_write() {
        let mut console = FakeConsole::new();
        assert!(console.try_write_byte(b'A'));
        assert_eq!(console.last_write, Some(b'A'));
        assert_eq!(console.try_read_byte(), None);
    }

    struct FakePix {
        busy: bool,
    }

    impl PixXregSink for FakePix {
        fn begin_xreg(&mut self, _device: u8, _channel: u8, _addr: u8, _values: &[u16]) -> bool {
            self.busy = true;
            true
        }
        fn xreg_busy(&self) -> bool {
            self.busy
        }
    }

    #[test]
    fn xstack_short_encoding_round_trip() {
        let mut xs = XStack::new();
        xs.push(&[0x34]);
        assert_eq!(xs.pop_u16_end(), Ok(0x0034));

        let mut xs = XStack::new();
        xs.push(&[0x12, 0x34]);
        assert_eq!(xs.pop_u16_end(), Ok(0x3412));

        let mut xs = XStack::new();
        assert_eq!(xs.pop_u16_end(), Ok(0));
    }

    #[test]
    fn xstack_oversized_pop_is_invalid() {
        let mut xs = XStack::new();
        xs.push(&[1, 2, 3]);
        assert_eq!(xs.pop_u16_end(), Err(Errno::Inval));
    }

    #[test]
    fn open_write_close_read_round_trip() {
        let mut bs = FakeStore::new();
        let mut api = ApiDispatcher::<FakeStore>::new();
        let mut xram = [0u8; 16];

        let mut xs = XStack::new();
        xs.push(b"HELLO.TXT");
        let flags = (OpenFlags::CREATE | OpenFlags::WRITE).bits();
        let fd = match api.begin(ria_abi::ApiOp::Open as u8, flags, &mut xs, &mut xram, &mut bs) {
            ApiPoll::Done(ApiResult::Ok(fd)) => fd as u8,
            other => panic!("unexpected {other:?}"),
        };

        let mut xs = XStack::new();
        xs.push(b"hi");
        match api.begin(ria_abi::ApiOp::Write as u8, fd, &mut xs, &mut xram, &mut bs) {
            ApiPoll::Done(ApiResult::Ok(2)) => {}
            other => panic!("unexpected {other:?}"),
        }

        let mut xs = XStack::new();
        match api.begin(ria_abi::ApiOp::Close as u8, fd, &mut xs, &mut xram, &mut bs) {
            ApiPoll::Done(ApiResult::Ok(0)) => {}
            other => panic!("unexpected {other:?}"),
        }

        let mut xs = XStack::new();
        xs.push(b"HELLO.TXT");
        let flags = OpenFlags::READ.bits();
        let fd = match api.begin(ria_abi::ApiOp::Open as u8, flags, &mut xs, &mut xram, &mut bs) {
            ApiPoll::Done(ApiResult::Ok(fd)) => fd as u8,
            other => panic!("unexpected {other:?}"),
        };

        let mut xs = XStack::new();
        xs.push(&[8u8]);
        match api.begin(ria_abi::ApiOp::Read as u8, fd, &mut xs, &mut xram, &mut bs) {
            ApiPoll::Done(ApiResult::Ok(2)) => {}
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(xs.take_remaining(), b"hi");
    }

    #[test]
    fn close_unknown_fd_is_badf() {
        let mut bs = FakeStore::new();
        let mut api = ApiDispatcher::<FakeStore>::new();
        let mut xram = [0u8; 4];
        let mut xs = XStack::new();
        match api.begin(ria_abi::ApiOp::Close as u8, 9, &mut xs, &mut xram, &mut bs) {
            ApiPoll::Done(ApiResult::Err(Errno::BadF)) => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unrecognized_opcode_is_nosys() {
        let mut bs = FakeStore::new();
        let mut api = ApiDispatcher::<FakeStore>::new();
        let mut xram = [0u8; 4];
        let mut xs = XStack::new();
        match api.begin(0x7F, 0, &mut xs, &mut xram, &mut bs) {
            ApiPoll::Done(ApiResult::Err(Errno::NoSys)) => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn errno_opt_switches_numbering() {
        let mut bs = FakeStore::new();
        let mut api = ApiDispatcher::<FakeStore>::new();
        let mut xram = [0u8; 4];
        let mut xs = XStack::new();
        api.begin(ria_abi::ApiOp::ErrnoOpt as u8, 1, &mut xs, &mut xram, &mut bs);
        assert_eq!(api.numbering(), Numbering::Llvm);
        assert_eq!(api.errno_byte(Errno::NoMem), 12);
    }

    #[test]
    fn exit_closes_open_files() {
        let mut bs = FakeStore::new();
        let mut api = ApiDispatcher::<FakeStore>::new();
        let mut xram = [0u8; 4];

        let mut xs = XStack::new();
        xs.push(b"A.TXT");
        api.begin(
            ria_abi::ApiOp::Open as u8,
            OpenFlags::CREATE.bits(),
            &mut xs,
            &mut xram,
            &mut bs,
        );
        assert!(!api.fds.slots.iter().all(|s| s.is_none()));

        let mut xs = XStack::new();
        api.begin(ria_abi::ApiOp::Exit as u8, 0, &mut xs, &mut xram, &mut bs);
        assert!(api.fds.slots.iter().all(|s| s.is_none()));
    }

    #[test]
    fn set_xreg_stays_busy_until_pix_drains() {
        let mut bs = FakeStore::new();
        let mut api = ApiDispatcher::<FakeStore>::new();
        let mut xram = [0u8; 4];
        let mut pix = FakePix { busy: false };

        let mut xs = XStack::new();
        // channel, addr, count, then count*2 bytes of u16 values (LE).
        xs.push(&[0u8, 0x10, 1, 0x34, 0x12]);
        match api.begin(ria_abi::ApiOp::SetXreg as u8, 0, &mut xs, &mut xram, &mut bs) {
            ApiPoll::Busy => {}
            other => panic!("unexpected {other:?}"),
        }
        api.submit_pending(&mut pix);
        assert!(pix.busy);
        assert_eq!(api.poll_pending(&mut pix), ApiPoll::Busy);

        pix.busy = false;
        match api.poll_pending(&mut pix) {
            ApiPoll::Done(ApiResult::Ok(0)) => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn config_round_trip_through_config_sys_format() {
        let src = b"+V1\n+P8000\n+C0\n+R0\n+S437\nBASIC\n";
        let cfg = Config::parse(src);
        assert_eq!(cfg.version, 1);
        assert_eq!(cfg.phi2_khz, 8000);
        assert_eq!(cfg.codepage, 437);
        assert_eq!(cfg.boot_rom(), b"BASIC");

        let mut out = [0u8; 64];
        let n = cfg.serialize(&mut out);
        let round_tripped = Config::parse(&out[..n]);
        assert_eq!(round_tripped, cfg);
    }

    #[test]
    fn lseek_end_with_negative_offset() {
        let mut bs = FakeStore::new();
        let mut api = ApiDispatcher::<FakeStore>::new();
        let mut xram = [0u8; 4];

        let mut xs = XStack::new();
        xs.push(b"F.TXT");
        let fd = match api.begin(
            ria_abi::ApiOp::Open as u8,
            OpenFlags::CREATE.bits(),
            &mut xs,
            &mut xram,
            &mut bs,
        ) {
            ApiPoll::Done(ApiResult::Ok(fd)) => fd as u8,
            other => panic!("unexpected {other:?}"),
        };
        let mut xs = XStack::new();
        xs.push(b"0123456789");
        api.begin(ria_abi::ApiOp::Write as u8, fd, &mut xs, &mut xram, &mut bs);

        let mut xs = XStack::new();
        // whence=End(2), offset=-3 (si32 short-encoded).
        xs.push(&[2u8, 0xFD, 0xFF, 0xFF, 0xFF]);
        match api.begin(ria_abi::ApiOp::Lseek as u8, fd, &mut xs, &mut xram, &mut bs) {
            ApiPoll::Done(ApiResult::Ok(7)) => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rename_splits_on_nul() {
        let (a, b) = split_nul(b"FROM.TXT\0TO.TXT");
        assert_eq!(a, b"FROM.TXT");
        assert_eq!(b, b"TO.TXT");
    }
}
