// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire-level constants and types shared by every crate that touches the
//! 32-byte register window, the action-event dispatch table, or the API
//! protocol's errno boundary.
//!
//! This crate has no hardware dependency and no IPC of its own; it is the
//! analogue of the teacher's `abi` crate, reduced to what a single-binary,
//! two-core firmware needs at its module seams instead of at a task/kernel
//! boundary.

#![no_std]

use bitflags::bitflags;
use num_derive::FromPrimitive;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Width of the register window, `$FFE0..=$FFFF`.
pub const REGS_LEN: usize = 0x20;

/// Base address of the register window in 6502 address space.
pub const REGS_BASE: u16 = 0xFFE0;

/// Size of the auxiliary stack, plus the permanent zero sentinel at
/// `xstack[XSTACK_SIZE]`.
pub const XSTACK_SIZE: usize = 0x200;

/// Size of extended RAM, addressable by both agents.
pub const XRAM_SIZE: usize = 0x10000;

/// Number of simultaneously open files, not counting the reserved
/// stdin/stdout/stderr numbers.
pub const FD_POOL_SIZE: usize = 16;

/// File numbers below this are the reserved standard streams; pool index
/// `i` is reported to the 6502 as `i + FD_RESERVED`.
pub const FD_RESERVED: u8 = 3;

/// Reserved file numbers.
pub const FD_STDIN: u8 = 0;
pub const FD_STDOUT: u8 = 1;
pub const FD_STDERR: u8 = 2;

/// Offsets within the register window, 5 bits wide. Each is both a byte
/// position in [`Regs`] and, where a write from the 6502 is meaningful, a
/// case in the action loop's dispatch (see `drv/action-loop`).
pub mod offset {
    /// Status probe: bit 0 TX ready, bit 1 RX ready.
    pub const STATUS: u8 = 0x00;
    /// Write one byte to the console UART.
    pub const UART_TX: u8 = 0x01;
    /// RX probe: drain the UART into the shadow latch if readable.
    pub const UART_RX: u8 = 0x02;
    /// Frame counter, low nibble increments each vsync.
    pub const VSYNC: u8 = 0x03;
    /// xram window A: data byte (post-increments by STEP0).
    pub const XRAM_RW0: u8 = 0x04;
    pub const XRAM_STEP0: u8 = 0x05;
    pub const XRAM_ADDR0: u8 = 0x06;
    // XRAM_ADDR0 occupies 0x06 and 0x07 (16-bit).
    /// xram window B, symmetric to A.
    pub const XRAM_RW1: u8 = 0x08;
    pub const XRAM_STEP1: u8 = 0x09;
    pub const XRAM_ADDR1: u8 = 0x0A;
    // XRAM_ADDR1 occupies 0x0A and 0x0B.
    /// Shadow of the 6502's accumulator at the moment `API_OP` is
    /// strobed, for the handful of calls that carry a small argument in
    /// `A` rather than on `xstack` (`Open`'s flags, `Close`/`Read`/
    /// `Write`/`Lseek`/`Fstat`/`Readdir`'s file number). Written by the
    /// calling convention's own library code before `API_OP`; ordinary
    /// DMA write already lands it here, so it needs no action dispatch
    /// case of its own.
    pub const API_A: u8 = 0x0C;
    /// Last call's errno in the selected numbering. Read-only from the
    /// 6502's side; never appears in the action dispatch table.
    pub const API_ERRNO: u8 = 0x0D;
    /// Non-blocking fast path to the console UART, bypassing STATUS
    /// bookkeeping. Drops the byte silently if the UART isn't writable.
    pub const CONSOLE_TX: u8 = 0x0E;
    /// Writing the API opcode here both latches it and halts the 6502 so
    /// the main thread can dispatch it. One register does both jobs.
    pub const API_OP: u8 = 0x0F;
    /// Fast-store step trigger.
    pub const FASTSTORE_STEP: u8 = 0x16;
    /// Fast-load step trigger.
    pub const FASTLOAD_STEP: u8 = 0x17;
    /// Start of the fast-load/fast-store staging area, `$FFF0..$FFFA`.
    pub const FASTIO_BASE: u8 = 0x10;
    pub const FASTIO_LEN: usize = 0x0A;
    /// 6502 reset vector, written by firmware before every reset.
    pub const RESET_VECTOR_LO: u8 = 0x1C;
    pub const RESET_VECTOR_HI: u8 = 0x1D;
}

/// The 32-byte register window, `regs[0x00..0x20]`, mapped at
/// `$FFE0..$FFFF`. A single byte is atomic with respect to the 6502 bus
/// cycle; the microcontroller may mutate any byte at any time.
#[repr(C)]
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct Regs(pub [u8; REGS_LEN]);

impl Regs {
    pub const fn zeroed() -> Self {
        Regs([0; REGS_LEN])
    }

    pub fn get(&self, offset: u8) -> u8 {
        self.0[(offset & 0x1F) as usize]
    }

    pub fn set(&mut self, offset: u8, value: u8) {
        self.0[(offset & 0x1F) as usize] = value;
    }
}

impl Default for Regs {
    fn default() -> Self {
        Self::zeroed()
    }
}

bitflags! {
    /// Open-file flags as the 6502 program presents them. CC65's bit
    /// layout is closer to POSIX than FatFs's native flags, so the
    /// dispatcher translates these to whatever `BlockStore` expects.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct OpenFlags: u8 {
        const READ = 0x01;
        const WRITE = 0x02;
        const CREATE = 0x10;
        const TRUNC = 0x20;
        const APPEND = 0x40;
        const EXCL = 0x80;
    }
}

/// System calls the 6502 may invoke by writing the opcode to
/// [`offset::API_OP`]. Not exhaustive of every opcode in the upstream
/// firmware; representative of each family the dispatcher must marshal.
#[derive(Clone, Copy, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u8)]
pub enum ApiOp {
    Exit = 0x00,
    Phi2 = 0x01,
    Open = 0x10,
    Close = 0x11,
    Read = 0x12,
    ReadXram = 0x13,
    Write = 0x14,
    WriteXram = 0x15,
    Lseek = 0x16,
    Unlink = 0x17,
    Rename = 0x18,
    Stat = 0x19,
    Fstat = 0x1A,
    Opendir = 0x1B,
    Readdir = 0x1C,
    Chdir = 0x1D,
    Getcwd = 0x1E,
    Mkdir = 0x1F,
    Rmdir = 0x20,
    Clock = 0x30,
    Rtc = 0x31,
    ErrnoOpt = 0x32,
    CodePage = 0x33,
    StdinOpt = 0x34,
    SetXreg = 0x40,
}

/// Which POSIX errno numbering the active 6502 toolchain expects.
/// Selected at runtime by an `ErrnoOpt` call rather than compiled in.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Default)]
pub enum Numbering {
    #[default]
    Cc65,
    Llvm,
}

/// Abstract error taxonomy at the core level. The dispatcher never hands
/// a raw numeric errno to its callers; it converts at the 6502-facing
/// boundary via [`Errno::to_numbering`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Errno {
    NoEnt,
    NoMem,
    Acces,
    NoDev,
    MFile,
    Busy,
    Inval,
    NoSpc,
    Exist,
    Again,
    Io,
    Intr,
    NoSys,
    SPipe,
    Range,
    BadF,
    NoExec,
    Unknown,
}

impl Errno {
    /// Maps to the numeric value the active 6502 toolchain expects.
    /// Both tables are reproduced exactly from the two `ENO_CC65_*` /
    /// `ENO_LLVM_*` constant sets, including rows with differing
    /// magnitudes for the same condition (e.g. `NoMem` is 2 under CC65
    /// but 12 under LLVM-MOS).
    pub fn to_numbering(self, numbering: Numbering) -> u8 {
        match numbering {
            Numbering::Cc65 => match self {
                Errno::NoEnt => 1,
                Errno::NoMem => 2,
                Errno::Acces => 3,
                Errno::NoDev => 4,
                Errno::MFile => 5,
                Errno::Busy => 6,
                Errno::Inval => 7,
                Errno::NoSpc => 8,
                Errno::Exist => 9,
                Errno::Again => 10,
                Errno::Io => 11,
                Errno::Intr => 12,
                Errno::NoSys => 13,
                Errno::SPipe => 14,
                Errno::Range => 15,
                Errno::BadF => 16,
                Errno::NoExec => 17,
                Errno::Unknown => 18,
            },
            Numbering::Llvm => match self {
                Errno::NoEnt => 2,
                Errno::NoMem => 12,
                Errno::Acces => 13,
                Errno::NoDev => 19,
                Errno::MFile => 24,
                Errno::Busy => 16,
                Errno::Inval => 22,
                Errno::NoSpc => 28,
                Errno::Exist => 17,
                Errno::Again => 11,
                Errno::Io => 5,
                Errno::Intr => 4,
                Errno::NoSys => 38,
                Errno::SPipe => 29,
                Errno::Range => 34,
                Errno::BadF => 9,
                Errno::NoExec => 8,
                Errno::Unknown => 85,
            },
        }
    }
}

/// Device numbers on the PIX outbound link. `Idle` (`0x7`) is emitted in
/// pairs on startup to resync the display and is never a real target.
#[derive(Clone, Copy, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u8)]
pub enum PixDevice {
    Vga = 0,
    Audio = 1,
    Idle = 7,
}

/// Well-known PIX channels on the VGA device, used for backchannel
/// enable/disable requests and the canvas/mode ordering special case.
pub mod pix_vga_channel {
    pub const BACKCHANNEL: u8 = 0xF;
    pub const CANVAS: u8 = 0x00;
    pub const MODE: u8 = 0x01;
}

/// Backchannel frame tags, MSB-framed: ASCII when bit 7 is clear, a
/// command when it's set.
pub mod backchannel {
    pub const VSYNC_MASK: u8 = 0x80;
    pub const ACK_MASK: u8 = 0x90;
    pub const NAK_MASK: u8 = 0xA0;
    pub const TAG_MASK: u8 = 0xF0;
    pub const FRAME_MASK: u8 = 0x0F;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regs_window_masks_to_five_bits() {
        let mut regs = Regs::zeroed();
        regs.set(0xFFE0u16 as u8, 7);
        assert_eq!(regs.get(offset::STATUS), 7);
    }

    #[test]
    fn errno_numbering_diverges_on_shared_condition() {
        assert_eq!(Errno::NoMem.to_numbering(Numbering::Cc65), 2);
        assert_eq!(Errno::NoMem.to_numbering(Numbering::Llvm), 12);
    }

    #[test]
    fn errno_numbering_unknown_catch_all() {
        assert_eq!(Errno::Unknown.to_numbering(Numbering::Cc65), 18);
        assert_eq!(Errno::Unknown.to_numbering(Numbering::Llvm), 85);
    }

    #[test]
    fn open_flags_rdwr_bits_match_cc65() {
        let f = OpenFlags::READ | OpenFlags::WRITE;
        assert_eq!(f.bits(), 0x03);
    }
}
