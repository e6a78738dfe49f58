//! Reactor Timers
//!
//! Deadline heap with lazy cancellation. Cleared timers stay in the heap
//! until they surface and are skipped.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use mio::Token;

/// Identifier returned by `Reactor::set_timeout`. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy)]
struct TimerEntry {
    token: Token,
    deadline: Instant,
    interval: Option<Duration>,
}

#[derive(Debug, Default)]
pub(super) struct TimerQueue {
    heap: BinaryHeap<Reverse<(Instant, TimerId)>>,
    entries: HashMap<TimerId, TimerEntry>,
    last_id: u64,
}

impl TimerQueue {
    pub(super) fn new() -> Self {
        Self::default()
    }

    pub(super) fn insert(&mut self, now: Instant, delay: Duration, token: Token, recurring: bool) -> TimerId {
        self.last_id += 1;
        let id = TimerId(self.last_id);
        let deadline = now + delay;
        self.entries.insert(
            id,
            TimerEntry {
                token,
                deadline,
                interval: recurring.then_some(delay),
            },
        );
        self.heap.push(Reverse((deadline, id)));
        id
    }

    /// Returns false if the timer already fired (one-shot) or never existed
    pub(super) fn remove(&mut self, id: TimerId) -> bool {
        self.entries.remove(&id).is_some()
    }

    pub(super) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Earliest live deadline, discarding cancelled heads
    pub(super) fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            match self.entries.get(&id) {
                Some(entry) if entry.deadline == deadline => return Some(deadline),
                _ => {
                    self.heap.pop();
                }
            }
        }
        None
    }

    /// Consume a fired timer before delivery. False once it was cancelled.
    pub(super) fn claim(&mut self, id: TimerId) -> bool {
        match self.entries.get(&id) {
            Some(entry) if entry.interval.is_none() => {
                self.entries.remove(&id);
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Pops every timer due at `now`, re-arming recurring ones. One-shot
    /// entries stay live until `claim`, so they can still be cancelled.
    pub(super) fn expire(&mut self, now: Instant, fired: &mut Vec<(TimerId, Token)>) {
        let mut rearmed = Vec::new();
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if deadline > now {
                break;
            }
            self.heap.pop();

            let Some(entry) = self.entries.get_mut(&id) else {
                continue;
            };
            if entry.deadline != deadline {
                continue;
            }

            fired.push((id, entry.token));
            match entry.interval {
                Some(interval) => {
                    // Re-arm from now so a stalled loop does not replay a burst
                    entry.deadline = now + interval;
                    rearmed.push(Reverse((entry.deadline, id)));
                }
                None => {}
            }
        }
        // At most one firing per timer per call, even with a zero interval
        self.heap.extend(rearmed);
    }
}
