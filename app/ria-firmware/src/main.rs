// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

#![no_std]
#![no_main]

#[cfg(not(any(feature = "panic-semihosting", feature = "panic-halt")))]
compile_error!("Must have one of panic-{halt,semihosting} enabled");

#[cfg(feature = "panic-halt")]
extern crate panic_halt;
#[cfg(feature = "panic-semihosting")]
extern crate panic_semihosting;

use rp2040_pac as _;

#[link_section = ".boot2"]
#[used]
pub static BOOT2: [u8; 256] = rp2040_boot2::BOOT_LOADER_GENERIC_03H;

mod action_core;
mod collaborators;
mod console;
mod cpu;
mod log;
mod mailbox;
mod pix_sink;
mod xram;

use cortex_m_rt::entry;
use ria_abi::offset;
use ria_api::{ApiDispatcher, ApiPoll, ApiResult, Config, ConfigStore, PixXregSink, XStack};
use ria_bus_engine::clock::compute_phi2_clocks;
use ria_bus_engine::target::DmaChainConfig;
use ria_bus_engine::BusEngine;
use ria_pix::VgaLink;
use rp2040_hal::clocks::Clock;
use rp2040_hal::gpio::FunctionUart;
use rp2040_hal::multicore::{Multicore, Stack};
use rp2040_hal::pac;
use rp2040_hal::pio::PIOExt;
use rp2040_hal::sio::Sio;
use rp2040_hal::uart::{DataBits, StopBits, UartConfig, UartPeripheral};
use rp2040_hal::{Timer, Watchdog};

const XTAL_FREQ_HZ: u32 = 12_000_000;

static mut CORE1_STACK: Stack<4096> = Stack::new();

#[entry]
fn main() -> ! {
    let mut pac = pac::Peripherals::take().unwrap();

    let mut watchdog = Watchdog::new(pac.WATCHDOG);
    let clocks = rp2040_hal::clocks::init_clocks_and_plls(
        XTAL_FREQ_HZ,
        pac.XOSC,
        pac.CLOCKS,
        pac.PLL_SYS,
        pac.PLL_USB,
        &mut pac.RESETS,
        &mut watchdog,
    )
    .ok()
    .unwrap();

    let mut sio = Sio::new(pac.SIO);
    let pins = rp2040_hal::gpio::Pins::new(
        pac.IO_BANK0,
        pac.PADS_BANK0,
        sio.gpio_bank0,
        &mut pac.RESETS,
    );

    // `original_source/src/ria.c`'s `RIA_RESB_PIN`. Driven open-drain on
    // real hardware via a pulled-up net; modeled here as a plain
    // push-pull output with no internal pull, matching `BusEngine`'s
    // expected pin typestate.
    let reset_pin = pins
        .gpio28
        .into_push_pull_output()
        .into_pull_type::<rp2040_hal::gpio::PullNone>();

    let uart_pins = (
        pins.gpio4.into_function::<FunctionUart>(),
        pins.gpio5.into_function::<FunctionUart>(),
    );
    let uart = UartPeripheral::new(pac.UART1, uart_pins, &mut pac.RESETS)
        .enable(
            UartConfig::new(115_200.into(), DataBits::Eight, None, StopBits::One),
            clocks.peripheral_clock.freq(),
        )
        .unwrap();
    console::install(uart, clocks.peripheral_clock.freq().to_Hz());

    let mut cfg_store = collaborators::RamConfigStore::new();
    let mut cfg_buf = [0u8; 512];
    let config = match cfg_store.load(&mut cfg_buf) {
        Ok(n) if n > 0 => Config::parse(&cfg_buf[..n]),
        _ => Config::defaults(),
    };
    let initial_phi2_khz = config.phi2_khz;
    let clkdiv_clocks = compute_phi2_clocks(initial_phi2_khz);

    // Claims two DMA channel pairs the way `ria.c`'s `ria_write_init`/
    // `ria_read_init` do: one channel moves the payload byte into/out of
    // `regs`, a second reprograms the first's address from the value the
    // PIO program captured off the bus, and the two chain to each other
    // forever. Channel numbers are fixed rather than runtime-claimed,
    // since this port has exactly one consumer of each.
    let write_dma = DmaChainConfig { payload_channel: 0, address_channel: 1 };
    let read_dma = DmaChainConfig { payload_channel: 2, address_channel: 3 };

    let (pio0, sm0, sm1, sm2, sm3) = pac.PIO0.split(&mut pac.RESETS);
    let mut engine = BusEngine::init(
        pio0, sm0, sm1, sm2, reset_pin, write_dma, read_dma, clkdiv_clocks,
    );
    engine.assert_reset();
    engine.arm_dma(&pac.DMA);
    let pix_tx = engine.init_pix_tx(sm3, clkdiv_clocks);

    let timer = Timer::new(pac.TIMER, &mut pac.RESETS, &clocks);
    let configured_reset_us = config.resb_us;

    let mut mc = Multicore::new(&mut pac.PSM, &mut pac.PPB, &mut sio.fifo);
    let cores = mc.cores();
    let core1 = &mut cores[1];
    #[allow(static_mut_refs)]
    core1
        .spawn(unsafe { &mut CORE1_STACK.mem }, move || {
            action_core::run(engine, initial_phi2_khz, configured_reset_us, move || {
                timer.get_counter().ticks()
            })
        })
        .unwrap();

    let mut bs = collaborators::RamBlockStore::new();
    let mut usb = collaborators::NullUsbHost;
    let mut pix_sink = pix_sink::PixSink::new(pix_tx);
    let mut vga_link = VgaLink::default();
    let mut dispatcher = ApiDispatcher::<collaborators::RamBlockStore>::new();

    mailbox::request_cpu_command(mailbox::CpuCommand::Run);

    loop {
        let now_us = timer.get_counter().ticks();

        if let Some(call) = mailbox::take_api_call() {
            let mut xstack = XStack::default();
            let xram = action_core_xram();
            let poll = dispatcher.begin(call.opcode, call.reg_a, &mut xstack, xram, &mut bs);
            finish_api_poll(&mut dispatcher, poll, &mut pix_sink);
        } else {
            let poll = dispatcher.poll_pending(&mut pix_sink);
            if !matches!(poll, ApiPoll::Idle) {
                finish_api_poll(&mut dispatcher, poll, &mut pix_sink);
            }
        }

        if let Some(khz) = dispatcher.take_requested_phi2_khz() {
            mailbox::request_phi2_khz(khz);
        }

        if !vga_link.connected() && vga_link.should_reconnect() {
            vga_link.begin_probe();
        }
        let _ = vga_link.poll_watchdog(now_us);
        let _ = pix_sink.step(now_us);

        if usb.mount() {
            sys_log!("mass storage mounted");
        }
        let _ = usb.poll_hid();
    }
}

fn finish_api_poll(
    dispatcher: &mut ApiDispatcher<collaborators::RamBlockStore>,
    poll: ApiPoll,
    pix: &mut impl PixXregSink,
) {
    match poll {
        ApiPoll::Idle => {}
        ApiPoll::Busy => dispatcher.submit_pending(pix),
        ApiPoll::Done(result) => {
            let errno_byte = match result {
                ApiResult::Ok(_) => 0,
                ApiResult::Err(e) => dispatcher.errno_byte(e),
            };
            let regs = unsafe { ria_bus_engine::regs_mut() };
            regs.set(offset::API_ERRNO, errno_byte);
            mailbox::mark_api_done();
        }
    }
}

fn action_core_xram() -> &'static mut [u8] {
    unsafe { &mut xram::xram()[..] }
}
