// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ring buffers for recording diagnostic events from the ECU runtime.
//!
//! This is the runtime's only logging mechanism: there is no `log`/`tracing`
//! facade anywhere in this workspace. Each component declares its own
//! fixed-capacity ring buffer of `Copy` event entries with [`ringbuf!`] and
//! records into it with [`ringbuf_entry!`]. Nothing is formatted or allocated
//! on the recording path; a caller wanting human-readable output drains the
//! buffer and `Debug`-prints entries after the fact.
//!
//! Unlike the embedded original this crate is descended from, these buffers
//! are shared across OS threads (one per scheduler task, plus background
//! workers), so the backing storage is behind a [`std::sync::Mutex`] rather
//! than a single-threaded cell.
//!
//! ## Creating a ring buffer
//!
//! ```ignore
//! ringbuf!(SCHED_RINGBUF, SchedulerEvent, 64, SchedulerEvent::Idle);
//! ```
//!
//! ## Recording an entry
//!
//! ```ignore
//! ringbuf_entry!(SCHED_RINGBUF, SchedulerEvent::DeadlineMiss { task: id });
//! ```
//!
//! ### Entry de-duplication
//!
//! When the same `(line, payload)` pair is recorded repeatedly in a row, the
//! count on the existing entry is bumped rather than burning a new slot. This
//! keeps a long quiet period from evicting older, more interesting history.

use std::sync::Mutex;

/// A single ring buffer entry, carrying an arbitrary `Copy` payload.
///
/// When an entry is recorded with the same `line` and `payload` as the most
/// recent entry, `count` is incremented in place instead of allocating a new
/// slot.
#[derive(Debug, Copy, Clone)]
pub struct RingbufEntry<T: Copy> {
    pub line: u32,
    pub generation: u32,
    pub payload: T,
    pub count: u32,
}

/// A fixed-capacity ring buffer of `N` entries of type `T`.
///
/// Instantiating this directly is unusual; see [`ringbuf!`].
#[derive(Debug)]
pub struct Ringbuf<T: Copy, const N: usize> {
    last: Option<usize>,
    buffer: [RingbufEntry<T>; N],
}

impl<T: Copy, const N: usize> Ringbuf<T, N> {
    pub const fn new(init: T) -> Self {
        Ringbuf {
            last: None,
            buffer: [RingbufEntry {
                line: 0,
                generation: 0,
                count: 0,
                payload: init,
            }; N],
        }
    }

    fn do_record(&mut self, line: u32, payload: T) {
        let ndx = match self.last {
            Some(last) if last + 1 < N => last + 1,
            _ => 0,
        };
        let generation = self.buffer[ndx].generation.wrapping_add(1);
        self.buffer[ndx] = RingbufEntry {
            line,
            payload,
            count: 1,
            generation,
        };
        self.last = Some(ndx);
    }

    /// Snapshot the current contents, oldest first, for inspection in tests
    /// or by an external diagnostic reader.
    pub fn snapshot(&self) -> Vec<RingbufEntry<T>> {
        self.buffer.to_vec()
    }

    pub fn last_entry(&self) -> Option<RingbufEntry<T>> {
        self.last.map(|ndx| self.buffer[ndx])
    }
}

/// Thread-safe handle to a declared ring buffer. Created by [`ringbuf!`].
pub struct SharedRingbuf<T: Copy, const N: usize> {
    inner: Mutex<Ringbuf<T, N>>,
}

impl<T: Copy, const N: usize> SharedRingbuf<T, N> {
    pub const fn new(init: T) -> Self {
        SharedRingbuf {
            inner: Mutex::new(Ringbuf::new(init)),
        }
    }

    pub fn snapshot(&self) -> Vec<RingbufEntry<T>> {
        self.inner.lock().unwrap().snapshot()
    }

    pub fn last_entry(&self) -> Option<RingbufEntry<T>> {
        self.inner.lock().unwrap().last_entry()
    }
}

impl<T: Copy + PartialEq, const N: usize> RecordEntry<T> for SharedRingbuf<T, N> {
    fn record_entry(&self, line: u32, payload: T) {
        let mut ring = self.inner.lock().unwrap();
        if let Some(last) = ring.last {
            let ent = &mut ring.buffer[last];
            if ent.line == line && ent.payload == payload {
                ent.count = ent.count.saturating_add(1);
                return;
            }
        }
        ring.do_record(line, payload);
    }
}

/// Abstraction over types in which a ring buffer entry can be recorded.
///
/// Implemented by [`SharedRingbuf`]; exists so [`ringbuf_entry!`] has a
/// single trait method to dispatch through regardless of which declaration
/// macro produced the static.
pub trait RecordEntry<T: Copy> {
    fn record_entry(&self, line: u32, payload: T);
}

/// Declares a named, static ring buffer.
///
/// `ringbuf!(NAME, Type, N, init_expr)` declares `NAME` as a
/// `SharedRingbuf<Type, N>`, with every slot initialized to `init_expr`.
#[macro_export]
macro_rules! ringbuf {
    ($name:ident, $t:ty, $n:expr, $init:expr) => {
        static $name: $crate::SharedRingbuf<$t, $n> =
            $crate::SharedRingbuf::new($init);
    };
}

/// Records `payload` into the named ring buffer, tagging it with the call
/// site's source line.
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {{
        let (p, buf) = ($payload, &$buf);
        $crate::RecordEntry::record_entry(buf, line!(), p);
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Copy, Clone, PartialEq)]
    enum Event {
        Init,
        Tick(u32),
    }

    ringbuf!(TEST_RINGBUF, Event, 4, Event::Init);

    #[test]
    fn records_and_wraps() {
        for i in 0..6 {
            ringbuf_entry!(TEST_RINGBUF, Event::Tick(i));
        }
        let snap = TEST_RINGBUF.snapshot();
        assert_eq!(snap.len(), 4);
        assert_eq!(TEST_RINGBUF.last_entry().unwrap().payload, Event::Tick(5));
    }

    #[test]
    fn dedups_repeated_entries() {
        ringbuf!(DEDUP_RINGBUF, Event, 4, Event::Init);
        for _ in 0..3 {
            ringbuf_entry!(DEDUP_RINGBUF, Event::Tick(7));
        }
        let last = DEDUP_RINGBUF.last_entry().unwrap();
        assert_eq!(last.payload, Event::Tick(7));
        assert_eq!(last.count, 3);
    }
}
