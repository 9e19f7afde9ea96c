// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The three PIO programs that make up the bus engine, assembled with
//! `pio_proc::pio_asm!` the way the `xous-pio` reference crate in the
//! example pack wraps the same macro for RP2040 PIO programs.
//!
//! None of these touch firmware state directly; they only gate and shift
//! bits between the 6502 bus pins and the RX/TX FIFOs DMA moves in and
//! out of. The address-to-register-offset reduction (masking the
//! captured address to 5 bits) happens in the `in` instruction's bit
//! count, not in firmware, keeping the address fix-up to a five-bit
//! mask.

/// Drives PHI2 as a sideset pin and, on every 6502 write into the I/O
/// page (chip select low, R/W low), pushes two words in sequence: the
/// absolute register-window pointer the byte landed at, then the byte
/// itself. The pointer is assembled, not just captured — `x` is loaded
/// once at program start (before the first `entry` pass) with
/// `regs_base >> 5` from the TX FIFO, so `in x, 27` followed by
/// `in pins, 5` yields `regs_base | addr5` directly in the ISR, with no
/// firmware involved in forming it per cycle. `BusEngine::init` arms a
/// DMA chain where the first word retriggers the payload channel's
/// write address and the second is the byte that channel moves.
pub fn write_sink_program() -> pio::Program<32> {
    pio_proc::pio_asm!(
        ".side_set 1",
        "pull block side 0",        // once: regs_base >> 5 -> osr
        "mov x, osr side 0",
        "public entry:",
        "    wait 0 gpio 2 side 0",    // CS asserted
        "    wait 0 gpio 3 side 0",    // R/W low: this cycle is a write
        "    in x, 27 side 0",         // fixed high bits of the regs pointer
        "    in pins, 5 side 0",       // + low 5 bits of address -> one absolute pointer
        "    push side 0",             // word 1: absolute write pointer
        "    in pins, 8 side 0",       // data byte -> ISR
        "    push side 0",             // word 2: payload byte (low 8 bits valid)
        "    wait 1 gpio 3 side 1",    // release PHI2 high, wait for CS deassert
        "    wait 1 gpio 2 side 1",
        "    jmp entry side 1",
    )
    .program
}

/// Symmetric to [`write_sink_program`] for 6502 reads: `x` is preloaded
/// the same way, so every CS-asserted/R/W-high cycle pushes one word
/// that is already the absolute register-window pointer being read,
/// then blocks on `pull` for the byte a DMA chain stages into the TX
/// FIFO from that address — the `pull`'s natural stall is what
/// synchronizes the read against the DMA fetch, no separate handshake
/// needed.
pub fn read_source_program() -> pio::Program<32> {
    pio_proc::pio_asm!(
        "pull block",        // once: regs_base >> 5 -> osr
        "mov x, osr",
        "public entry:",
        "    wait 0 gpio 2",      // CS asserted
        "    wait 1 gpio 3",      // R/W high: this cycle is a read
        "    in x, 27",           // fixed high bits of the regs pointer
        "    in pins, 5",         // + low 5 bits of address -> one absolute pointer
        "    push",               // consumed by the DMA chain to retarget the read
        "    pull",               // stalls until that byte lands in the TX FIFO
        "    out pindirs, 8",
        "    out pins, 8",
        "    wait 1 gpio 2",      // CS deasserted: release the bus
        "    out pindirs, 0",
        "    jmp entry",
    )
    .program
}

/// Shifts one 32-bit PIX frame out over 4 parallel output pins, 4 bits
/// (one nibble) per side-set clock pulse, pulling the next frame once
/// the current one is fully sent. Grounded in `original_source/src/
/// ria/sys/pix.c`'s `pix_init` (`sm_config_set_out_pins(&config, 0, 4)`,
/// 32-bit shift register, 4 consecutive output pins) — the exact PIO
/// source it configures isn't in the pack, so the nibble/side-set shift
/// loop below is this port's own encoding of that pin count and word
/// size rather than a transcription.
pub fn pix_send_program() -> pio::Program<32> {
    pio_proc::pio_asm!(
        ".side_set 1",
        "public entry:",
        "    pull block side 0",
        "    set y, 7 side 0",
        "bitloop:",
        "    out pins, 4 side 1",
        "    jmp y-- bitloop side 0",
        "    jmp entry side 0",
    )
    .program
}

/// Mirrors every bus cycle that touches the I/O page onto its own FIFO,
/// independent of the read/write programs above. This is the only input
/// to the action loop (C2); it never drives any pins.
pub fn action_sniffer_program() -> pio::Program<32> {
    pio_proc::pio_asm!(
        "public entry:",
        "    wait 0 gpio 2",
        "    in pins, 5",
        "    in pins, 8",
        "    push",
        "    wait 1 gpio 2",
        "jmp entry",
    )
    .program
}
