// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The single physical console UART (`original_source/src/ria.c`'s
//! `RIA_UART`), shared by both the 6502's own serial window
//! (`ria_action_loop::Uart`, polled from core 1's hot path) and the
//! human operator's terminal (`ria_api::ConsoleUart`, polled from core
//! 0's monitor loop and `sys_log!`). On real hardware these are the same
//! wire; this port keeps them the same peripheral guarded by one
//! `critical_section::Mutex`, rather than inventing a second UART the
//! original firmware doesn't have.

use core::cell::RefCell;
use critical_section::Mutex;
use embedded_hal::serial::{Read, Write};
use rp2040_hal::gpio::bank0::{Gpio4, Gpio5};
use rp2040_hal::gpio::{FunctionUart, Pin, PullDown};
use rp2040_hal::pac::UART1;
use rp2040_hal::uart::UartPeripheral;

pub type ConsolePins = (
    Pin<Gpio4, FunctionUart, PullDown>,
    Pin<Gpio5, FunctionUart, PullDown>,
);

type ConsoleUartPeripheral = UartPeripheral<rp2040_hal::uart::Enabled, UART1, ConsolePins>;

static CONSOLE: Mutex<RefCell<Option<ConsoleUartPeripheral>>> = Mutex::new(RefCell::new(None));
static PERIPH_CLOCK_HZ: Mutex<RefCell<u32>> = Mutex::new(RefCell::new(0));

/// Installs the enabled UART peripheral. Called once from `main` after
/// `Pins::new`/clock init; every subsequent access goes through the two
/// zero-sized handles below. `periph_clock_hz` is the frequency
/// `set_line_coding` needs to re-derive a baud-rate divider.
pub fn install(uart: ConsoleUartPeripheral, periph_clock_hz: u32) {
    critical_section::with(|cs| {
        *CONSOLE.borrow(cs).borrow_mut() = Some(uart);
        *PERIPH_CLOCK_HZ.borrow(cs).borrow_mut() = periph_clock_hz;
    });
}

fn with_uart<R>(f: impl FnOnce(&mut ConsoleUartPeripheral) -> R) -> Option<R> {
    critical_section::with(|cs| {
        let mut slot = CONSOLE.borrow(cs).borrow_mut();
        slot.as_mut().map(f)
    })
}

/// Handle used on core 1: backs `UART_TX`/`UART_RX`/`STATUS`/
/// `CONSOLE_TX` via `ria_action_loop::Uart`.
#[derive(Default)]
pub struct ActionUart;

impl ria_action_loop::Uart for ActionUart {
    fn is_writable(&self) -> bool {
        with_uart(|u| u.uart_is_writable()).unwrap_or(false)
    }

    fn is_readable(&self) -> bool {
        with_uart(|u| u.uart_is_readable()).unwrap_or(false)
    }

    fn write(&mut self, byte: u8) {
        let _ = with_uart(|u| nb::block!(u.write(byte)));
    }

    fn read(&mut self) -> u8 {
        with_uart(|u| u.read().ok()).flatten().unwrap_or(0)
    }
}

/// Handle used on core 0: backs the monitor and `sys_log!` via
/// `ria_api::ConsoleUart`.
#[derive(Default)]
pub struct OperatorConsole;

impl ria_api::ConsoleUart for OperatorConsole {
    fn try_read_byte(&mut self) -> Option<u8> {
        with_uart(|u| u.read().ok()).flatten()
    }

    fn try_write_byte(&mut self, byte: u8) -> bool {
        with_uart(|u| u.write(byte).is_ok()).unwrap_or(false)
    }

    /// Re-derives the baud-rate divider for the new rate. `data_bits`/
    /// `stop_bits`/`parity` are accepted but not reapplied: this port
    /// only ever runs 8N1, matching `original_source/src/ria.c`'s own
    /// fixed `stdio_uart_init_full` call.
    fn set_line_coding(&mut self, baud: u32, _data_bits: u8, _stop_bits: u8, _parity: u8) {
        let freq = critical_section::with(|cs| *PERIPH_CLOCK_HZ.borrow(cs).borrow());
        if freq == 0 {
            return;
        }
        let _ = with_uart(|u| {
            u.set_baudrate(
                rp2040_hal::fugit::HertzU32::from_raw(baud),
                rp2040_hal::fugit::HertzU32::from_raw(freq),
            )
        });
    }
}

impl core::fmt::Write for OperatorConsole {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        for byte in s.as_bytes() {
            while !self.try_write_byte(*byte) {}
        }
        Ok(())
    }
}
