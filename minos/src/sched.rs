//! The three-level feedback scheduler.
//!
//! Ready threads wait in one of three queues chosen by priority band:
//!
//! - **L1** (priority 100..=149): preemptive shortest-remaining-time
//!   first. Sorted by ascending remaining burst; when two estimates
//!   are both zero, the higher priority goes first.
//! - **L2** (priority 50..=99): non-preemptive priority, sorted
//!   descending.
//! - **L3** (priority 0..=49): round-robin, plain FIFO.
//!
//! Selection is strict between levels: L1 before L2 before L3. Within
//! the sorted queues ties keep insertion order.
//!
//! Aging keeps long waiters from starving: every full 1500 ticks a
//! thread sits in a ready queue buys it 10 points of priority, and a
//! thread pushed over its band boundary moves up a queue. The tick
//! handler asks [`Scheduler::check_preempt`] whether the running
//! thread should give way.
//!
//! These routines assume interrupts are already disabled; on a single
//! simulated CPU that is mutual exclusion enough. Locks cannot provide
//! it here, since the scheduler runs on the blocking path itself: a
//! thread waiting for a scheduler lock would need the scheduler to get
//! off the CPU.

use crate::frame::FrameAllocator;
use crate::thread::{QueueLevel, Thread, ThreadStatus, MAX_PRIORITY};
use log::debug;
use mimic::interrupt::InterruptState;
use std::collections::VecDeque;

/// Ticks of ready-queue waiting that buy one priority boost.
pub const AGING_PERIOD: u64 = 1500;
/// Priority points per boost.
pub const AGING_BOOST: u32 = 10;

// `a` goes in front of `b` in L1: shortest remaining burst first, by
// priority when both estimates are zero.
fn orders_before_l1(a: &Thread, b: &Thread) -> bool {
    if a.remain_burst == 0.0 && b.remain_burst == 0.0 {
        a.priority > b.priority
    } else {
        a.remain_burst < b.remain_burst
    }
}

// `a` goes in front of `b` in L2: higher priority first.
fn orders_before_l2(a: &Thread, b: &Thread) -> bool {
    a.priority > b.priority
}

/// The ready queues plus the deferred-destruction slot.
pub struct Scheduler {
    l1: Vec<Box<Thread>>,
    l2: Vec<Box<Thread>>,
    l3: VecDeque<Box<Thread>>,
    to_be_destroyed: Option<Box<Thread>>,
}

impl Scheduler {
    /// A scheduler with empty queues.
    pub fn new() -> Self {
        Self {
            l1: Vec::new(),
            l2: Vec::new(),
            l3: VecDeque::new(),
            to_be_destroyed: None,
        }
    }

    fn assert_interrupts_off() {
        assert_eq!(
            InterruptState::current(),
            InterruptState::Off,
            "scheduler entered with interrupts on"
        );
    }

    /// Whether any thread is waiting in any queue.
    pub fn has_ready(&self) -> bool {
        !self.l1.is_empty() || !self.l2.is_empty() || !self.l3.is_empty()
    }

    /// Mark `thread` ready and queue it by its priority band. A thread
    /// arriving from the blocked state restarts its burst accounting.
    pub fn put_to_ready(&mut self, mut thread: Box<Thread>, now: u64) {
        Self::assert_interrupts_off();
        debug!(target: "thread", "putting thread on ready list: {}", thread.name);
        if thread.status == ThreadStatus::Blocked {
            thread.resume_burst();
        }
        thread.status = ThreadStatus::Ready;
        thread.start_ready(now);
        self.insert_queue(thread, now);
    }

    // Queue insertion shared by put_to_ready and aging promotion.
    // Sorted queues insert stably: ties land behind their equals.
    fn insert_queue(&mut self, thread: Box<Thread>, now: u64) {
        let level = thread.which_queue();
        debug!(
            target: "scheduler",
            "[A] Tick [{}]: Thread [{}] is inserted into queue L[{}]",
            now, thread.id, level.number()
        );
        match level {
            QueueLevel::L1 => {
                let pos = self
                    .l1
                    .iter()
                    .position(|t| orders_before_l1(&thread, t))
                    .unwrap_or(self.l1.len());
                self.l1.insert(pos, thread);
            }
            QueueLevel::L2 => {
                let pos = self
                    .l2
                    .iter()
                    .position(|t| orders_before_l2(&thread, t))
                    .unwrap_or(self.l2.len());
                self.l2.insert(pos, thread);
            }
            QueueLevel::L3 => self.l3.push_back(thread),
        }
    }

    /// Pop the next thread to dispatch: the front of the highest
    /// non-empty queue, or `None` when everything is empty.
    pub fn schedule_next(&mut self, now: u64) -> Option<Box<Thread>> {
        Self::assert_interrupts_off();
        let next = if !self.l1.is_empty() {
            Some(self.l1.remove(0))
        } else if !self.l2.is_empty() {
            Some(self.l2.remove(0))
        } else {
            self.l3.pop_front()
        };
        if let Some(thread) = &next {
            debug!(
                target: "scheduler",
                "[B] Tick [{}]: Thread [{}] is removed from queue L[{}]",
                now, thread.id, thread.which_queue().number()
            );
        }
        next
    }

    // Apply every full aging period the thread has waited through.
    // Crediting moves insert_ready_time forward so a later pass does
    // not count the same ticks twice.
    fn credit_waiting(thread: &mut Thread, now: u64, capped: bool) {
        thread.total_ready_time = now.saturating_sub(thread.insert_ready_time);
        while now.saturating_sub(thread.insert_ready_time) >= AGING_PERIOD {
            let old = thread.priority;
            thread.priority = if capped {
                (thread.priority + AGING_BOOST).min(MAX_PRIORITY)
            } else {
                thread.priority + AGING_BOOST
            };
            debug!(
                target: "scheduler",
                "[C] Tick [{}]: Thread [{}] changes its priority from [{}] to [{}]",
                now, thread.id, old, thread.priority
            );
            thread.insert_ready_time += AGING_PERIOD;
            thread.total_ready_time -= AGING_PERIOD;
        }
    }

    /// Raise the priority of every thread that has waited a full
    /// aging period, promoting any that cross their band boundary.
    /// Threads that did not cross a period boundary keep their order.
    pub fn aging(&mut self, now: u64) {
        Self::assert_interrupts_off();

        // L1: priorities saturate at the top; no promotion out.
        let mut aged = Vec::new();
        let mut i = 0;
        while i < self.l1.len() {
            if now.saturating_sub(self.l1[i].insert_ready_time) >= AGING_PERIOD {
                let mut thread = self.l1.remove(i);
                Self::credit_waiting(&mut thread, now, true);
                aged.push(thread);
            } else {
                i += 1;
            }
        }
        for thread in aged {
            let pos = self
                .l1
                .iter()
                .position(|t| orders_before_l1(&thread, t))
                .unwrap_or(self.l1.len());
            self.l1.insert(pos, thread);
        }

        // L2: unbounded credit; crossing 100 promotes into L1.
        let mut aged = Vec::new();
        let mut i = 0;
        while i < self.l2.len() {
            if now.saturating_sub(self.l2[i].insert_ready_time) >= AGING_PERIOD {
                let mut thread = self.l2.remove(i);
                Self::credit_waiting(&mut thread, now, false);
                aged.push(thread);
            } else {
                i += 1;
            }
        }
        for thread in aged {
            if thread.which_queue() == QueueLevel::L1 {
                debug!(
                    target: "scheduler",
                    "[B] Tick [{}]: Thread [{}] is removed from queue L[2]",
                    now, thread.id
                );
                self.insert_queue(thread, now);
            } else {
                let pos = self
                    .l2
                    .iter()
                    .position(|t| orders_before_l2(&thread, t))
                    .unwrap_or(self.l2.len());
                self.l2.insert(pos, thread);
            }
        }

        // L3 is FIFO: aged threads that stay keep their position;
        // crossing 50 moves them to L2.
        let mut i = 0;
        while i < self.l3.len() {
            if now.saturating_sub(self.l3[i].insert_ready_time) >= AGING_PERIOD {
                let mut thread = self.l3.remove(i).unwrap();
                Self::credit_waiting(&mut thread, now, false);
                if thread.which_queue() == QueueLevel::L3 {
                    self.l3.insert(i, thread);
                    i += 1;
                } else {
                    debug!(
                        target: "scheduler",
                        "[B] Tick [{}]: Thread [{}] is removed from queue L[3]",
                        now, thread.id
                    );
                    self.insert_queue(thread, now);
                }
            } else {
                i += 1;
            }
        }
    }

    /// Whether the running thread should yield to a queued one.
    ///
    /// An L1 thread gives way to a strictly shorter remaining burst in
    /// L1. An L2 thread gives way whenever L1 is occupied. An L3
    /// thread reports only that a round-robin successor exists; the
    /// tick handler supplies the quantum.
    pub fn check_preempt(&self, current: &Thread) -> bool {
        match current.which_queue() {
            QueueLevel::L1 => self
                .l1
                .first()
                .map_or(false, |front| front.remain_burst < current.remain_burst),
            QueueLevel::L2 => !self.l1.is_empty(),
            QueueLevel::L3 => !self.l3.is_empty(),
        }
    }

    /// Park a finished thread for deferred teardown. The slot must be
    /// empty: only one thread can be dying at a time.
    pub fn defer_destroy(&mut self, thread: Box<Thread>) {
        Self::assert_interrupts_off();
        assert!(
            self.to_be_destroyed.is_none(),
            "a finished thread is already pending destruction"
        );
        self.to_be_destroyed = Some(thread);
    }

    /// Tear down any thread parked in the deferred slot, returning its
    /// address-space frames. Runs after the switch away from the dying
    /// thread has completed.
    pub fn reap(&mut self, frames: &mut FrameAllocator) {
        if let Some(mut thread) = self.to_be_destroyed.take() {
            debug!(target: "thread", "reclaiming finished thread {}", thread.name);
            if let Some(space) = thread.space.take() {
                space.release(frames);
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mimic::interrupt::InterruptGuard;

    fn ready(sched: &mut Scheduler, id: usize, priority: u32, now: u64) {
        sched.put_to_ready(Box::new(Thread::new(id, format!("t{}", id), priority)), now);
    }

    #[test]
    fn levels_dispatch_strictly_in_order() {
        let _g = InterruptGuard::new();
        let mut sched = Scheduler::new();
        ready(&mut sched, 0, 20, 0);
        ready(&mut sched, 1, 120, 0);
        ready(&mut sched, 2, 70, 0);
        assert_eq!(sched.schedule_next(0).unwrap().id, 1);
        assert_eq!(sched.schedule_next(0).unwrap().id, 2);
        assert_eq!(sched.schedule_next(0).unwrap().id, 0);
        assert!(sched.schedule_next(0).is_none());
    }

    #[test]
    fn l1_sorts_by_remaining_burst_then_priority() {
        let _g = InterruptGuard::new();
        let mut sched = Scheduler::new();
        let mut short = Box::new(Thread::new(0, "short", 110));
        short.approx_burst = 25.0;
        short.remain_burst = 25.0;
        let mut long = Box::new(Thread::new(1, "long", 140));
        long.approx_burst = 80.0;
        long.remain_burst = 80.0;
        sched.put_to_ready(long, 0);
        sched.put_to_ready(short, 0);
        // Fresh zero-burst threads tie on burst; priority decides.
        ready(&mut sched, 2, 105, 0);
        ready(&mut sched, 3, 130, 0);

        let order: Vec<usize> = std::iter::from_fn(|| sched.schedule_next(0))
            .map(|t| t.id)
            .collect();
        assert_eq!(order, vec![3, 2, 0, 1]);
    }

    #[test]
    fn l2_ties_keep_insertion_order() {
        let _g = InterruptGuard::new();
        let mut sched = Scheduler::new();
        ready(&mut sched, 0, 70, 0);
        ready(&mut sched, 1, 70, 0);
        ready(&mut sched, 2, 90, 0);
        let order: Vec<usize> = std::iter::from_fn(|| sched.schedule_next(0))
            .map(|t| t.id)
            .collect();
        assert_eq!(order, vec![2, 0, 1]);
    }

    #[test]
    fn l3_is_fifo() {
        let _g = InterruptGuard::new();
        let mut sched = Scheduler::new();
        for id in 0..3 {
            ready(&mut sched, id, 10, 0);
        }
        let order: Vec<usize> = std::iter::from_fn(|| sched.schedule_next(0))
            .map(|t| t.id)
            .collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn aging_boosts_after_a_full_period() {
        let _g = InterruptGuard::new();
        let mut sched = Scheduler::new();
        ready(&mut sched, 0, 20, 0);
        sched.aging(1400);
        assert_eq!(sched.l3[0].priority, 20);
        sched.aging(1500);
        assert_eq!(sched.l3[0].priority, 30);
        // The consumed period no longer counts.
        sched.aging(1600);
        assert_eq!(sched.l3[0].priority, 30);
    }

    #[test]
    fn aging_promotes_across_band_boundaries() {
        let _g = InterruptGuard::new();
        let mut sched = Scheduler::new();
        ready(&mut sched, 0, 45, 0);
        sched.aging(1500);
        assert!(sched.l3.is_empty());
        assert_eq!(sched.l2[0].priority, 55);
        assert_eq!(sched.l2[0].which_queue(), QueueLevel::L2);

        ready(&mut sched, 1, 95, 0);
        sched.aging(3000);
        // t0 aged once more (55 -> 65); t1 was credited two full
        // periods and crossed into L1.
        assert_eq!(sched.l1[0].id, 1);
        assert_eq!(sched.l1[0].priority, 115);
        assert_eq!(sched.l2[0].priority, 65);
    }

    #[test]
    fn aging_credits_every_full_period() {
        let _g = InterruptGuard::new();
        let mut sched = Scheduler::new();
        ready(&mut sched, 0, 0, 0);
        sched.aging(4500);
        // Three periods waited, three boosts, still inside L3.
        assert_eq!(sched.l3[0].priority, 30);
        sched.aging(7500);
        // Two more boosts push it over the band boundary.
        assert!(sched.l3.is_empty());
        assert_eq!(sched.l2[0].priority, 50);
    }

    #[test]
    fn l1_priority_saturates() {
        let _g = InterruptGuard::new();
        let mut sched = Scheduler::new();
        ready(&mut sched, 0, 145, 0);
        sched.aging(1500);
        assert_eq!(sched.l1[0].priority, MAX_PRIORITY);
        sched.aging(3000);
        assert_eq!(sched.l1[0].priority, MAX_PRIORITY);
    }

    #[test]
    fn preemption_rules_per_level() {
        let _g = InterruptGuard::new();
        let mut sched = Scheduler::new();

        let mut current = Thread::new(9, "cur", 120);
        current.remain_burst = 40.0;
        assert!(!sched.check_preempt(&current));

        let mut rival = Box::new(Thread::new(0, "rival", 110));
        rival.approx_burst = 25.0;
        rival.remain_burst = 25.0;
        sched.put_to_ready(rival, 0);
        assert!(sched.check_preempt(&current));

        // Equal burst is not strictly shorter.
        current.remain_burst = 25.0;
        assert!(!sched.check_preempt(&current));

        // Any L1 arrival outranks a running L2 thread.
        let l2_current = Thread::new(8, "l2", 70);
        assert!(sched.check_preempt(&l2_current));

        // L3 preempts only when a round-robin successor waits.
        let l3_current = Thread::new(7, "l3", 10);
        assert!(!sched.check_preempt(&l3_current));
        ready(&mut sched, 1, 10, 0);
        assert!(sched.check_preempt(&l3_current));
    }

    #[test]
    #[should_panic(expected = "pending destruction")]
    fn the_destroy_slot_holds_one_thread() {
        let _g = InterruptGuard::new();
        let mut sched = Scheduler::new();
        sched.defer_destroy(Box::new(Thread::new(0, "a", 0)));
        sched.defer_destroy(Box::new(Thread::new(1, "b", 0)));
    }

    #[test]
    fn reap_clears_the_slot() {
        let _g = InterruptGuard::new();
        let mut sched = Scheduler::new();
        let mut frames = FrameAllocator::new();
        sched.defer_destroy(Box::new(Thread::new(0, "a", 0)));
        sched.reap(&mut frames);
        assert!(sched.to_be_destroyed.is_none());
        // A second reap is a no-op.
        sched.reap(&mut frames);
    }

    #[test]
    #[should_panic(expected = "interrupts on")]
    fn entry_points_assert_interrupts_off() {
        let mut sched = Scheduler::new();
        ready(&mut sched, 0, 10, 0);
    }
}
