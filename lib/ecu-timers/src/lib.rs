// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A timer multiplexer.
//!
//! `Multitimer` lets a single polling loop own several independent named
//! deadlines, corresponding to variants of an enum type. This is the backing
//! structure for the session FSM's per-session P2/P2*/S3 timers (`§4.2`):
//! one `Multitimer<SessionTimer>` per session, polled every tick against the
//! shared monotonic clock.
//!
//! The expected usage model is:
//!
//! - Create an `enum` type naming your timers and derive `enum_map::Enum`
//!   for it.
//! - Create a `Multitimer<YourEnumType>`.
//! - Call `set_timer`/`clear_timer` to arm and disarm individual timers.
//! - On every tick, call `poll_now(now_ms)`, then drain `iter_fired()`.
//!
//! Unlike the embedded original this is descended from, there is no
//! underlying single-channel OS timer to multiplex onto and no notification
//! bitmask: every `Multitimer` is driven directly by the caller's clock
//! reading, which keeps it trivially host-testable.

use enum_map::{EnumArray, EnumMap};

#[derive(Clone)]
pub struct Multitimer<E: EnumArray<Timer>> {
    timers: EnumMap<E, Timer>,
}

impl<E: EnumArray<Timer> + Copy> Default for Multitimer<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: EnumArray<Timer> + Copy> Multitimer<E> {
    pub fn new() -> Self {
        Self {
            timers: EnumMap::default(),
        }
    }

    /// Arms `which` to fire at `deadline` (in the caller's time unit,
    /// typically milliseconds), with optional auto-repeat. Replaces any
    /// prior setting.
    pub fn set_timer(&mut self, which: E, deadline: u64, repeat: Option<Repeat>) {
        let fired_but_not_observed = self.timers[which].fired_but_not_observed;
        self.timers[which] = Timer {
            deadline: Some((deadline, repeat)),
            fired_but_not_observed,
        };
    }

    pub fn get_timer(&self, which: E) -> Option<(u64, Option<Repeat>)> {
        self.timers[which].deadline
    }

    /// Disarms `which`. Returns whether it had been armed.
    pub fn clear_timer(&mut self, which: E) -> bool {
        self.timers[which].deadline.take().is_some()
    }

    /// Advances every timer against `now`, marking any whose deadline has
    /// elapsed as fired and applying its repeat policy.
    pub fn poll_now(&mut self, now: u64) {
        for timer in self.timers.values_mut() {
            if let Some((d, r)) = timer.deadline {
                if d <= now {
                    timer.deadline = match r {
                        Some(Repeat::AfterWake(period)) => {
                            Some((now.saturating_add(period), r))
                        }
                        Some(Repeat::AfterDeadline(period)) => {
                            Some((d.saturating_add(period), r))
                        }
                        None => None,
                    };
                    timer.fired_but_not_observed = true;
                }
            }
        }
    }

    /// Drains the set of timers that have fired since the last call. A timer
    /// that fired more than once between calls is reported once.
    pub fn iter_fired(&mut self) -> impl Iterator<Item = E> + '_ {
        self.timers.iter_mut().filter_map(move |(e, timer)| {
            if std::mem::replace(&mut timer.fired_but_not_observed, false) {
                Some(e)
            } else {
                None
            }
        })
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
    fn repeat_after_deadline_vs_after_wake() {
        let mut uut: Multitimer<Timers> = Multitimer::new();
        uut.set_timer(Timers::A, 1234, Some(Repeat::AfterDeadline(1000)));
        uut.set_timer(Timers::B, 12, Some(Repeat::AfterWake(2000)));

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
    }

    #[test]
    fn clear_and_reset() {
        let mut uut: Multitimer<Timers> = Multitimer::new();
        uut.set_timer(Timers::A, 10, None);
        uut.set_timer(Timers::B, 20, None);

        uut.clear_timer(Timers::A);
        uut.set_timer(Timers::A, 15, None);

        uut.poll_now(16);
        assert_eq!(uut.iter_fired().collect::<Vec<_>>(), [Timers::A]);
    }
}
