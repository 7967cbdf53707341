// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Event loop implementation
//!
//! Single-threaded, cooperative scheduling for the loader. Three queues are
//! drained in priority order:
//!
//! 1. microtasks (promise reactions)
//! 2. immediates (the loader's "next tick")
//! 3. timers whose deadline has passed
//!
//! Microtasks are drained completely after every immediate and every timer
//! callback. Time is read from `tokio::time`, so a paused tokio clock drives
//! timers deterministically in tests.

use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

/// A unit of scheduled work
pub type Task = Box<dyn FnOnce()>;

/// Unique identifier for a timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub u64);

/// A scheduled timer
pub struct Timer {
    /// Unique timer ID
    pub id: TimerId,
    /// When the timer should fire
    pub deadline: Instant,
    /// Callback to execute
    callback: Task,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}

impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timer {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap (earliest deadline first, then FIFO)
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.0.cmp(&self.id.0))
    }
}

/// The loader's event loop
pub struct EventLoop {
    /// Timer counter for generating unique IDs
    next_timer_id: Cell<u64>,
    /// Pending timers (min-heap by deadline)
    timers: RefCell<BinaryHeap<Timer>>,
    /// Timers cancelled before firing
    cancelled: RefCell<HashSet<TimerId>>,
    /// Pending immediate callbacks
    immediates: RefCell<VecDeque<Task>>,
    /// Microtask queue (promise reactions)
    microtasks: RefCell<VecDeque<Task>>,
}

impl EventLoop {
    /// Create a new event loop
    pub fn new() -> Self {
        Self {
            next_timer_id: Cell::new(1),
            timers: RefCell::new(BinaryHeap::new()),
            cancelled: RefCell::new(HashSet::new()),
            immediates: RefCell::new(VecDeque::new()),
            microtasks: RefCell::new(VecDeque::new()),
        }
    }

    /// Generate a new unique timer ID
    fn next_id(&self) -> TimerId {
        let id = self.next_timer_id.get();
        self.next_timer_id.set(id + 1);
        TimerId(id)
    }

    /// Queue a microtask
    pub fn queue_microtask(&self, task: impl FnOnce() + 'static) {
        self.microtasks.borrow_mut().push_back(Box::new(task));
    }

    /// Queue a callback for the next tick
    pub fn set_immediate(&self, task: impl FnOnce() + 'static) {
        self.immediates.borrow_mut().push_back(Box::new(task));
    }

    /// Schedule a callback after `delay`
    pub fn set_timeout(&self, delay: Duration, task: impl FnOnce() + 'static) -> TimerId {
        let id = self.next_id();
        self.timers.borrow_mut().push(Timer {
            id,
            deadline: Instant::now() + delay,
            callback: Box::new(task),
        });
        id
    }

    /// Cancel a timer
    pub fn clear_timer(&self, id: TimerId) {
        let pending = self.timers.borrow().iter().any(|t| t.id == id);
        if pending {
            self.cancelled.borrow_mut().insert(id);
        }
    }

    /// Run microtasks until the queue is empty
    pub fn run_microtasks(&self) {
        loop {
            // The borrow must end before the task runs: tasks queue more tasks.
            let next = self.microtasks.borrow_mut().pop_front();
            match next {
                Some(task) => task(),
                None => break,
            }
        }
    }

    /// Pop the earliest timer if it is due and not cancelled
    fn pop_due_timer(&self, now: Instant) -> Option<Timer> {
        let mut timers = self.timers.borrow_mut();
        while let Some(timer) = timers.peek() {
            if self.cancelled.borrow_mut().remove(&timer.id) {
                timers.pop();
                continue;
            }
            if timer.deadline <= now {
                return timers.pop();
            }
            break;
        }
        None
    }

    /// Run one round of ready work; returns whether anything ran
    pub fn tick(&self) -> bool {
        let mut progressed = false;

        if !self.microtasks.borrow().is_empty() {
            self.run_microtasks();
            progressed = true;
        }

        // Only immediates queued before this round; new ones wait a tick.
        let batch: Vec<Task> = self.immediates.borrow_mut().drain(..).collect();
        for task in batch {
            task();
            self.run_microtasks();
            progressed = true;
        }

        let now = Instant::now();
        while let Some(timer) = self.pop_due_timer(now) {
            (timer.callback)();
            self.run_microtasks();
            progressed = true;
        }

        progressed
    }

    /// Check if there's pending work of any kind
    pub fn has_pending_work(&self) -> bool {
        !self.microtasks.borrow().is_empty()
            || !self.immediates.borrow().is_empty()
            || self.next_deadline().is_some()
    }

    /// Deadline of the earliest live timer
    pub fn next_deadline(&self) -> Option<Instant> {
        let timers = self.timers.borrow();
        let cancelled = self.cancelled.borrow();
        timers
            .iter()
            .filter(|t| !cancelled.contains(&t.id))
            .map(|t| t.deadline)
            .min()
    }

    /// Drain all work that is ready now, without waiting on timers
    pub fn run_until_idle(&self) {
        while self.tick() {}
    }

    /// Run until no work remains, sleeping between timers
    pub async fn run(&self) {
        self.run_until(None).await;
    }

    /// Run for at most `limit` of (possibly virtual) time
    pub async fn run_for(&self, limit: Duration) {
        self.run_until(Some(Instant::now() + limit)).await;
    }

    async fn run_until(&self, stop_at: Option<Instant>) {
        loop {
            self.run_until_idle();

            let Some(deadline) = self.next_deadline() else {
                break;
            };
            match stop_at {
                Some(stop) if deadline > stop => {
                    tokio::time::sleep_until(stop).await;
                    break;
                }
                _ => tokio::time::sleep_until(deadline).await,
            }
        }
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("microtasks", &self.microtasks.borrow().len())
            .field("immediates", &self.immediates.borrow().len())
            .field("timers", &self.timers.borrow().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    #[test]
    fn test_microtasks_before_immediates() {
        let event_loop = Rc::new(EventLoop::new());
        let log = Rc::new(RefCell::new(Vec::new()));

        let l = Rc::clone(&log);
        event_loop.set_immediate(move || l.borrow_mut().push("immediate"));
        let l = Rc::clone(&log);
        event_loop.queue_microtask(move || l.borrow_mut().push("microtask"));

        event_loop.run_until_idle();
        assert_eq!(*log.borrow(), vec!["microtask", "immediate"]);
    }

    #[test]
    fn test_microtasks_queued_by_tasks_run_in_same_drain() {
        let event_loop = Rc::new(EventLoop::new());
        let log = Rc::new(RefCell::new(Vec::new()));

        let el = Rc::clone(&event_loop);
        let l = Rc::clone(&log);
        event_loop.set_immediate(move || {
            let inner = Rc::clone(&l);
            el.queue_microtask(move || inner.borrow_mut().push(2));
            l.borrow_mut().push(1);
        });

        assert!(event_loop.tick());
        assert_eq!(*log.borrow(), vec![1, 2]);
        assert!(!event_loop.has_pending_work());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timers_fire_in_deadline_order() {
        let event_loop = EventLoop::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        let l = Rc::clone(&log);
        event_loop.set_timeout(Duration::from_millis(20), move || l.borrow_mut().push("late"));
        let l = Rc::clone(&log);
        event_loop.set_timeout(Duration::from_millis(10), move || l.borrow_mut().push("early"));
        let l = Rc::clone(&log);
        let cancelled =
            event_loop.set_timeout(Duration::from_millis(15), move || l.borrow_mut().push("never"));
        event_loop.clear_timer(cancelled);

        event_loop.run().await;
        assert_eq!(*log.borrow(), vec!["early", "late"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_for_stops_at_limit() {
        let event_loop = EventLoop::new();
        let fired = Rc::new(Cell::new(false));

        let f = Rc::clone(&fired);
        event_loop.set_timeout(Duration::from_secs(10), move || f.set(true));

        event_loop.run_for(Duration::from_secs(1)).await;
        assert!(!fired.get());
        assert!(event_loop.has_pending_work());
    }
}
