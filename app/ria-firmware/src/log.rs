// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `sys_log!`, in the shape used throughout the wider corpus
//! (`sys_log!("fmt", args...)`), reduced for a kernel-less, single-binary
//! port: there is no supervisor task to forward a log record to, so this
//! writes straight through `crate::console::OperatorConsole` with a
//! trailing newline. Every call site looks the same as it would calling
//! through a syscall; only what's behind the macro differs.

/// Formats and writes one line to the operator console. Silently drops
/// bytes once `crate::console::install` hasn't run yet (boot-time
/// `sys_log!` calls before the UART is up), matching the trait's own
/// non-blocking contract.
#[macro_export]
macro_rules! sys_log {
    ($fmt:expr) => {
        $crate::log::write_line(format_args!($fmt))
    };
    ($fmt:expr, $($args:tt)*) => {
        $crate::log::write_line(format_args!($fmt, $($args)*))
    };
}

pub fn write_line(args: core::fmt::Arguments<'_>) {
    use crate::console::OperatorConsole;
    use core::fmt::Write;

    let mut console = OperatorConsole;
    let _ = console.write_fmt(args);
    let _ = console.write_str("\r\n");
}
