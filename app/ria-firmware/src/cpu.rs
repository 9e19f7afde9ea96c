// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! RESB timing policy, grounded in `original_source/src/ria/sys/cpu.c`'s
//! `cpu_run`/`cpu_stop`/`cpu_task`/`cpu_post_reclock`: a run/stop request
//! just flips a latch and (re)arms a timer; the actual GPIO write is
//! deferred until the timer proves the 6502 has seen at least the
//! minimum low pulse `ria_bus_engine::clock::reset_us` requires for the
//! current PHI2 rate. This crate has no GPIO of its own — `action_core`
//! owns the reset pin via `ria_bus_engine::BusEngine` and drives it from
//! the transitions this module reports — so `Cpu` is pure policy, not a
//! driver.

/// What the caller should do to the physical reset pin this tick.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CpuAction {
    /// Nothing to do; `BusEngine::reset_asserted()` already reflects the
    /// wanted state.
    None,
    /// Drive the pin low now.
    AssertReset,
    /// The minimum RESB window has elapsed; release the pin.
    DeassertReset,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    /// No 6502 program has ever been started.
    Halted,
    /// Reset is (or should be) asserted; `until_us` is when it's safe to
    /// release it, set by [`Cpu::request_run`]/[`Cpu::reclock`].
    ResetAsserted { until_us: u64 },
    Running,
    /// Reset is held low indefinitely following an explicit
    /// [`Cpu::request_stop`]; unlike `ResetAsserted`, `poll` never releases
    /// it on its own. Matches `cpu_stop` holding RESB down until the next
    /// `cpu_run`.
    Stopped,
}

/// Tracks whether the 6502 should be running and, if not, how much
/// longer its reset pulse must be held low. Does not touch hardware;
/// see the module doc comment.
#[derive(Clone, Copy, Debug)]
pub struct Cpu {
    state: State,
    reset_us: u32,
}

impl Cpu {
    pub fn new() -> Self {
        Self { state: State::Halted, reset_us: 1_000 }
    }

    /// Whether the 6502 is meant to be running once its reset window
    /// elapses. Mirrors `original_source`'s `cpu_run_requested`.
    pub fn run_requested(&self) -> bool {
        !matches!(self.state, State::Halted | State::Stopped)
    }

    /// Requests the 6502 start running. Arms (or re-arms) the minimum
    /// RESB hold so a rapid stop/run pair still gets a clean pulse.
    pub fn request_run(&mut self, now_us: u64) -> CpuAction {
        self.state = State::ResetAsserted { until_us: now_us.wrapping_add(self.reset_us as u64) };
        CpuAction::AssertReset
    }

    /// Requests the 6502 stop. Matches `cpu_stop`: the pin drops
    /// immediately and stays down indefinitely, until explicitly run
    /// again — unlike a reset pulse, `poll` never releases it on its own.
    pub fn request_stop(&mut self, _now_us: u64) -> CpuAction {
        self.state = State::Stopped;
        CpuAction::AssertReset
    }

    /// Updates the held minimum RESB duration after a PHI2 rate change,
    /// per `ria_bus_engine::clock::reset_us`. If a reset is already in
    /// flight, extends its deadline rather than shortening a pulse the
    /// 6502 is mid-way through, matching `cpu_post_reclock`'s
    /// re-arming behavior. A `Stopped` hold is indefinite already and
    /// isn't affected.
    pub fn reclock(&mut self, reset_us: u32, now_us: u64) {
        self.reset_us = reset_us;
        if let State::ResetAsserted { .. } = self.state {
            self.state = State::ResetAsserted { until_us: now_us.wrapping_add(reset_us as u64) };
        }
    }

    /// Called once per `action_core` iteration. Returns the action the
    /// caller should take against the physical pin this tick.
    pub fn poll(&mut self, now_us: u64) -> CpuAction {
        match self.state {
            State::ResetAsserted { until_us } if now_us.wrapping_sub(until_us) < (u64::MAX / 2) => {
                self.state = State::Running;
                CpuAction::DeassertReset
            }
            _ => CpuAction::None,
        }
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_run_asserts_then_deasserts_after_reset_us() {
        let mut cpu = Cpu::new();
        cpu.reclock(1_000, 0);
        assert_eq!(cpu.request_run(0), CpuAction::AssertReset);
        assert_eq!(cpu.poll(500), CpuAction::None);
        assert_eq!(cpu.poll(1_000), CpuAction::DeassertReset);
        assert!(cpu.run_requested());
    }

    #[test]
    fn request_stop_holds_reset_until_rearmed() {
        let mut cpu = Cpu::new();
        cpu.reclock(2_000, 0);
        cpu.request_run(0);
        cpu.poll(2_000);
        assert_eq!(cpu.request_stop(5_000), CpuAction::AssertReset);
        assert!(!cpu.run_requested());
        // Unlike a reset pulse, a stop holds indefinitely: no amount of
        // polling releases it on its own.
        assert_eq!(cpu.poll(5_500), CpuAction::None);
        assert_eq!(cpu.poll(50_000), CpuAction::None);
        assert_eq!(cpu.poll(1_000_000), CpuAction::None);
        assert!(!cpu.run_requested());

        // Only an explicit run request re-arms the timed release.
        assert_eq!(cpu.request_run(1_000_000), CpuAction::AssertReset);
        assert!(cpu.run_requested());
        assert_eq!(cpu.poll(1_000_000), CpuAction::None);
        assert_eq!(cpu.poll(1_002_000), CpuAction::DeassertReset);
    }

    #[test]
    fn reclock_during_reset_extends_the_deadline() {
        let mut cpu = Cpu::new();
        cpu.request_run(0);
        cpu.reclock(3_000, 100);
        assert_eq!(cpu.poll(1_000), CpuAction::None);
        assert_eq!(cpu.poll(3_100), CpuAction::DeassertReset);
    }

    #[test]
    fn halted_never_reports_an_action() {
        let mut cpu = Cpu::new();
        assert_eq!(cpu.poll(10_000), CpuAction::None);
        assert!(!cpu.run_requested());
    }
}
