// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A timer multiplexer.
//!
//! `Multitimer` lets you wrap a single underlying monotonic clock and treat
//! it as multiple independent deadline timers. The independent timers
//! correspond to variants of an enum type, to make it easy to tell them
//! apart.
//!
//! The expected usage model is:
//!
//! - Create an `enum` type naming your timers, and derive the `Enum` trait
//!   (from the `enum_map` crate) for it.
//!
//! - Create a `Multitimer<YourEnumType>`.
//!
//! - Use its API to configure your timers to your heart's content.
//!
//! - Each main-loop tick, call `poll_now` with the current microsecond
//!   reading from whatever free-running counter the caller owns.
//!
//! - Read out fired timers (destructively) using `iter_fired`.
//!
//! There's no OS timer here to program: this core has no kernel notification
//! path, so `Multitimer` is driven by polling rather than by a
//! syscall-delivered wakeup. Callers already have a free-running counter
//! (the PIO-derived tick, or `SYST`) they read every loop iteration; that
//! reading is the only input this type needs.
//!
//! **Note:** the `Multitimer` assumes no one else needs the earliest
//! deadline it computes; `earliest_deadline()` is exposed for callers that
//! do want to, say, put a core to sleep until the next deadline.

#![no_std]

use enum_map::{EnumArray, EnumMap};

pub struct Multitimer<E: EnumArray<Timer>> {
    timers: EnumMap<E, Timer>,
}

impl<E: EnumArray<Timer> + Copy> Multitimer<E> {
    pub fn new() -> Self {
        Self {
            timers: EnumMap::default(),
        }
    }

    /// Sets the timer chosen by `which` to go off at time `deadline`, with
    /// optional auto-repeat behavior. This replaces any prior setting for
    /// the timer and enables it.
    pub fn set_timer(
        &mut self,
        which: E,
        deadline: u64,
        repeat: Option<Repeat>,
    ) {
        let fired_but_not_observed = self.timers[which].fired_but_not_observed;
        self.timers[which] = Timer {
            deadline: Some((deadline, repeat)),
            fired_but_not_observed,
        };
    }

    pub fn get_timer(&self, which: E) -> Option<(u64, Option<Repeat>)> {
        self.timers[which].deadline
    }

    pub fn clear_timer(&mut self, which: E) -> bool {
        self.timers[which].deadline.take().is_some()
    }

    /// The earliest deadline across all armed timers, if any.
    pub fn earliest_deadline(&self) -> Option<u64> {
        self.timers
            .values()
            .filter_map(|timer| timer.deadline)
            .map(|(dl, _repeat)| dl)
            .min()
    }

    /// Checks all timer states against `now`, marking any whose deadline
    /// has elapsed as fired (applying repeat behavior or disabling them).
    pub fn poll_now(&mut self, now: u64) {
        for timer in self.timers.values_mut() {
            if let Some((d, r)) = timer.deadline {
                if d <= now {
                    if let Some(kind) = r {
                        let next = match kind {
                            Repeat::AfterWake(period) => {
                                now.saturating_add(period)
                            }
                            Repeat::AfterDeadline(period) => {
                                d.saturating_add(period)
                            }
                        };
                        timer.deadline = Some((next, r));
                    } else {
                        timer.deadline = None;
                    }
                    timer.fired_but_not_observed = true;
                }
            }
        }
    }

    /// Returns an iterator over all timers that have fired since the last
    /// time they were observed through this function. A timer may have
    /// fired more than once since the last observation; that information is
    /// lost.
    ///
    /// Timers that have fired will appear in the order given by their
    /// `Enum` implementation, which in practice means declaration order.
    ///
    /// If you drop the iterator before it's exhausted, any timers you
    /// didn't observe will appear next time you call this.
    pub fn iter_fired(&mut self) -> impl Iterator<Item = E> + '_ {
        self.timers.iter_mut().filter_map(move |(e, timer)| {
            if core::mem::replace(&mut timer.fired_but_not_observed, false) {
                Some(e)
            } else {
                None
            }
        })
    }
}

impl<E: EnumArray<Timer> + Copy> Default for Multitimer<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Copy, Clone, Default)]
pub struct Timer {
    deadline: Option<(u64, Option<Repeat>)>,
    fired_but_not_observed: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Repeat {
    AfterWake(u64),
    AfterDeadline(u64),
}

#[cfg(test)]
mod tests {
    use super::*;
    use enum_map::Enum;

    #[derive(Copy, Clone, Debug, Eq, PartialEq, Enum)]
    enum Timers {
        A,
        B,
    }

    #[test]
    fn nothing_fired() {
        let mut uut: Multitimer<Timers> = Multitimer::new();
        assert!(uut.iter_fired().next().is_none());
    }

    #[test]
    fn earlier_timer_is_earliest() {
        let mut uut: Multitimer<Timers> = Multitimer::new();
        uut.set_timer(Timers::A, 1234, None);
        uut.set_timer(Timers::B, 12, None);
        assert_eq!(uut.earliest_deadline(), Some(12));
    }

    #[test]
    fn clear_timer_removes_it_from_earliest() {
        let mut uut: Multitimer<Timers> = Multitimer::new();
        uut.set_timer(Timers::A, 1234, None);
        uut.set_timer(Timers::B, 12, None);
        uut.clear_timer(Timers::B);
        assert_eq!(uut.earliest_deadline(), Some(1234));
    }

    #[test]
    fn basic_firing_behavior() {
        let mut uut: Multitimer<Timers> = Multitimer::new();
        uut.set_timer(Timers::A, 1234, None);
        uut.set_timer(Timers::B, 12, None);

        uut.poll_now(0);
        assert_eq!(uut.iter_fired().next(), None);

        uut.poll_now(11);
        assert_eq!(uut.iter_fired().next(), None);

        uut.poll_now(100);
        assert_eq!(uut.iter_fired().collect::<Vec<_>>(), [Timers::B]);

        uut.poll_now(10_000);
        assert_eq!(uut.iter_fired().collect::<Vec<_>>(), [Timers::A]);

        uut.poll_now(10_000_000);
        assert_eq!(uut.iter_fired().next(), None);
    }

    #[test]
    fn repeat() {
        let mut uut: Multitimer<Timers> = Multitimer::new();

        // Timer A will go off at 1234, 2234, 3234, ...
        uut.set_timer(Timers::A, 1234, Some(Repeat::AfterDeadline(1000)));
        // Timer B will go off at 12, and then every 1000 ticks _after the
        // firing was observed._
        uut.set_timer(Timers::B, 12, Some(Repeat::AfterWake(2000)));

        uut.poll_now(11);
        assert_eq!(uut.iter_fired().next(), None);

        uut.poll_now(100);
        assert_eq!(uut.iter_fired().collect::<Vec<_>>(), [Timers::B]);
        assert_eq!(
            uut.get_timer(Timers::B),
            Some((100 + 2000, Some(Repeat::AfterWake(2000)))),
        );

        uut.poll_now(1300);
        assert_eq!(uut.iter_fired().collect::<Vec<_>>(), [Timers::A]);
        assert_eq!(
            uut.get_timer(Timers::A),
            Some((2234, Some(Repeat::AfterDeadline(1000)))),
        );

        uut.poll_now(2234);
        assert_eq!(
            uut.iter_fired().collect::<Vec<_>>(),
            [Timers::A, Timers::B],
        );
    }

    #[test]
    fn clear_and_reset() {
        let mut uut: Multitimer<Timers> = Multitimer::new();
        uut.set_timer(Timers::A, 10, None);
        uut.set_timer(Timers::B, 20, None);
        assert_eq!(uut.earliest_deadline(), Some(10));

        uut.clear_timer(Timers::A);
        uut.set_timer(Timers::A, 15, None);
        assert_eq!(uut.earliest_deadline(), Some(15));

        uut.poll_now(16);
        assert_eq!(uut.iter_fired().collect::<Vec<_>>(), [Timers::A]);

        uut.set_timer(Timers::A, 18, None);
        assert_eq!(uut.earliest_deadline(), Some(18));
    }
}
