//! The kernel context: one struct owning the machine, the frame
//! allocator, the scheduler, and the file system, with the context
//! switch and timer plumbing between them.
//!
//! Everything process-wide is a field here rather than a global, so
//! the entry points thread one `&mut Kernel` instead of reaching
//! through statics; with interrupts disabled across each entry point,
//! the kernel behaves as a single-threaded executor.
//!
//! A context switch saves the outgoing thread's user registers and its
//! address-space state, parks the thread according to why it stopped
//! (yield, block, or finish), dispatches the scheduler's pick, and
//! restores the incoming state. A finishing thread cannot tear itself
//! down while the switch still runs on its behalf, so it parks in the
//! scheduler's deferred slot and is reclaimed once the switch is over.

use crate::addrspace::{AddressSpace, LoadError};
use crate::frame::FrameAllocator;
use crate::fs::KernelDisk;
use crate::sched::Scheduler;
use crate::thread::{Thread, ThreadStatus, Tid};
use index_fs::{Error, FileSystem};
use log::debug;
use mimic::disk::SynchDisk;
use mimic::interrupt::InterruptGuard;
use mimic::machine::Machine;
use mimic::stats::{Stats, TIMER_TICKS};

/// Why the running thread is giving up the CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handoff {
    /// Voluntarily or by preemption; the thread stays runnable.
    Yield,
    /// Waiting for an event; the thread parks until woken.
    Block,
    /// Exiting; the thread is torn down after the switch.
    Finish,
}

/// The kernel: machine, clock, memory, scheduler, and file system.
pub struct Kernel {
    /// The simulated machine.
    pub machine: Machine,
    /// The tick counters.
    pub stats: Stats,
    /// The physical frame allocator.
    pub frames: FrameAllocator,
    /// The ready queues.
    pub scheduler: Scheduler,
    /// The file system over the machine's disk.
    pub fs: FileSystem<KernelDisk>,
    current: Option<Box<Thread>>,
    blocked: Vec<Box<Thread>>,
    next_tid: Tid,
}

impl Kernel {
    /// Boot over a fresh disk, formatting it.
    pub fn format(disk: SynchDisk) -> Result<Self, Error> {
        Self::build(FileSystem::format(KernelDisk::new(disk))?)
    }

    /// Boot over a disk that already holds a file system.
    pub fn mount(disk: SynchDisk) -> Result<Self, Error> {
        Self::build(FileSystem::mount(KernelDisk::new(disk))?)
    }

    fn build(fs: FileSystem<KernelDisk>) -> Result<Self, Error> {
        let mut kernel = Self {
            machine: Machine::new(),
            stats: Stats::new(),
            frames: FrameAllocator::new(),
            scheduler: Scheduler::new(),
            fs,
            current: None,
            blocked: Vec::new(),
            next_tid: 0,
        };
        let tid = kernel.alloc_tid();
        let mut main = Box::new(Thread::new(tid, "main", 0));
        main.status = ThreadStatus::Running;
        kernel.current = Some(main);
        Ok(kernel)
    }

    fn alloc_tid(&mut self) -> Tid {
        let tid = self.next_tid;
        self.next_tid += 1;
        tid
    }

    /// The running thread.
    pub fn current(&self) -> &Thread {
        self.current.as_ref().expect("no running thread")
    }

    /// The running thread, mutably.
    pub fn current_mut(&mut self) -> &mut Thread {
        self.current.as_mut().expect("no running thread")
    }

    /// Create a thread at `priority` and queue it as ready.
    pub fn spawn(&mut self, name: &str, priority: u32) -> Tid {
        let tid = self.alloc_tid();
        let thread = Box::new(Thread::new(tid, name, priority));
        let _guard = InterruptGuard::new();
        let now = self.stats.total_ticks();
        self.scheduler.put_to_ready(thread, now);
        tid
    }

    /// Load the executable at `path` into a fresh address space and
    /// install it on the current thread, registers primed for the
    /// first user instruction.
    pub fn exec(&mut self, path: &str) -> Result<(), LoadError> {
        let executable = self.fs.open_file(path).map_err(LoadError::Fs)?;
        let space = AddressSpace::load(&executable, &mut self.frames, &mut self.machine)?;
        drop(executable);
        space.init_registers(&mut self.machine);
        space.restore_state(&mut self.machine);
        self.current_mut().space = Some(space);
        Ok(())
    }

    /// Give the CPU up but stay runnable.
    pub fn yield_current(&mut self) {
        self.reschedule(Handoff::Yield);
    }

    /// Park the current thread until [`Kernel::wake`].
    pub fn block_current(&mut self) {
        self.reschedule(Handoff::Block);
    }

    /// Finish the current thread; it is reclaimed after the switch.
    pub fn exit_current(&mut self) {
        self.reschedule(Handoff::Finish);
    }

    /// Make the blocked thread `tid` ready again. Returns false if no
    /// such thread is blocked.
    pub fn wake(&mut self, tid: Tid) -> bool {
        match self.blocked.iter().position(|t| t.id == tid) {
            Some(i) => {
                let thread = self.blocked.remove(i);
                let _guard = InterruptGuard::new();
                let now = self.stats.total_ticks();
                self.scheduler.put_to_ready(thread, now);
                true
            }
            None => false,
        }
    }

    // The switch choreography shared by yield, block, and exit.
    fn reschedule(&mut self, handoff: Handoff) {
        let _guard = InterruptGuard::new();
        let now = self.stats.total_ticks();
        'switch: {
            if self.current.is_none() {
                // Idle CPU: just dispatch whatever is ready.
                if let Some(next) = self.scheduler.schedule_next(now) {
                    self.dispatch(next, now);
                }
                break 'switch;
            }
            // A yield with an empty ready set keeps the CPU.
            if handoff == Handoff::Yield && !self.scheduler.has_ready() {
                break 'switch;
            }
            let mut old = self.current.take().unwrap();
            old.save_user_state(&self.machine);
            if let Some(space) = old.space.as_mut() {
                space.save_state(&self.machine);
            }
            let (old_id, old_burst) = (old.id, old.true_burst);
            let next = match handoff {
                Handoff::Yield => {
                    // Pick the successor first: the old thread must not
                    // immediately win its own ready queue back.
                    let next = self.scheduler.schedule_next(now);
                    self.scheduler.put_to_ready(old, now);
                    next
                }
                Handoff::Block => {
                    old.finish_burst();
                    old.status = ThreadStatus::Blocked;
                    debug!(target: "thread", "thread {} sleeping", old.name);
                    self.blocked.push(old);
                    self.scheduler.schedule_next(now)
                }
                Handoff::Finish => {
                    old.status = ThreadStatus::Zombie;
                    self.scheduler.defer_destroy(old);
                    self.scheduler.schedule_next(now)
                }
            };
            if let Some(next) = next {
                debug!(
                    target: "scheduler",
                    "[E] Tick [{}]: Thread [{}] is now selected for execution, \
                     thread [{}] is replaced, and it has executed [{}] ticks",
                    now, next.id, old_id, old_burst
                );
                self.dispatch(next, now);
            }
        }
        // Back on the new thread's footing: reclaim a finished
        // predecessor.
        let Kernel {
            scheduler, frames, ..
        } = self;
        scheduler.reap(frames);
    }

    fn dispatch(&mut self, mut next: Box<Thread>, now: u64) {
        next.start_running(now);
        next.status = ThreadStatus::Running;
        next.restore_user_state(&mut self.machine);
        if let Some(space) = next.space.as_ref() {
            space.restore_state(&mut self.machine);
        }
        self.current = Some(next);
    }

    /// The timer interrupt: advance the clock, charge the running
    /// burst, age the ready queues, and preempt if the scheduler says
    /// so. Fires every [`TIMER_TICKS`] ticks, which is therefore also
    /// the round-robin quantum of L3.
    pub fn handle_timer_tick(&mut self) {
        let _guard = InterruptGuard::new();
        self.stats.advance(TIMER_TICKS);
        let now = self.stats.total_ticks();
        if let Some(current) = self.current.as_mut() {
            current.tick_running(TIMER_TICKS);
        }
        self.scheduler.aging(now);
        let preempt = match self.current.as_ref() {
            Some(current) => self.scheduler.check_preempt(current),
            None => self.scheduler.has_ready(),
        };
        if preempt {
            self.reschedule(Handoff::Yield);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boot() -> Kernel {
        Kernel::format(SynchDisk::scratch()).unwrap()
    }

    #[test]
    fn boot_runs_a_main_thread() {
        let kernel = boot();
        assert_eq!(kernel.current().name, "main");
        assert_eq!(kernel.current().status, ThreadStatus::Running);
    }

    #[test]
    fn highest_band_dispatches_first() {
        let mut kernel = boot();
        let low = kernel.spawn("low", 20);
        let high = kernel.spawn("high", 120);
        let mid = kernel.spawn("mid", 70);

        kernel.yield_current();
        assert_eq!(kernel.current().id, high);
        kernel.exit_current();
        assert_eq!(kernel.current().id, mid);
        kernel.exit_current();
        assert_eq!(kernel.current().id, low);
    }

    #[test]
    fn yield_without_candidates_keeps_running() {
        let mut kernel = boot();
        let before = kernel.current().id;
        kernel.yield_current();
        assert_eq!(kernel.current().id, before);
    }

    #[test]
    fn block_and_wake_round_trip() {
        let mut kernel = boot();
        let other = kernel.spawn("other", 10);
        let main = kernel.current().id;

        kernel.block_current();
        assert_eq!(kernel.current().id, other);
        assert!(kernel.wake(main));
        assert!(!kernel.wake(main));

        // Round-robin brings the woken thread back on the next tick.
        kernel.handle_timer_tick();
        assert_eq!(kernel.current().id, main);
    }

    #[test]
    fn l3_round_robin_rotates_every_quantum() {
        let mut kernel = boot();
        let a = kernel.spawn("a", 10);
        let b = kernel.spawn("b", 10);
        let main = kernel.current().id;

        kernel.handle_timer_tick();
        assert_eq!(kernel.current().id, a);
        kernel.handle_timer_tick();
        assert_eq!(kernel.current().id, b);
        kernel.handle_timer_tick();
        assert_eq!(kernel.current().id, main);
        kernel.handle_timer_tick();
        assert_eq!(kernel.current().id, a);
    }

    #[test]
    fn shorter_burst_preempts_l1() {
        let mut kernel = boot();
        // Put main in L1 with a long remaining burst.
        {
            let current = kernel.current_mut();
            current.priority = 120;
            current.approx_burst = 4000.0;
            current.remain_burst = 4000.0;
        }
        // A fresh L1 rival holds a zero estimate, strictly shorter
        // than main's, so the next tick preempts.
        let rival = kernel.spawn("rival", 110);
        kernel.handle_timer_tick();
        assert_eq!(kernel.current().id, rival);

        // The rival earns a 50-tick estimate by blocking, then wakes
        // ready with remain_burst = 50; still shorter than main's.
        kernel.current_mut().approx_burst = 100.0;
        kernel.block_current();
        assert_eq!(kernel.current().name, "main");
        assert!(kernel.wake(rival));
        kernel.handle_timer_tick();
        assert_eq!(kernel.current().id, rival);
        assert_eq!(kernel.current().remain_burst, 50.0);
    }

    #[test]
    fn exited_threads_are_reaped_after_the_switch() {
        let mut kernel = boot();
        kernel.spawn("next", 10);
        kernel.exit_current();
        // The dead main thread was reclaimed during the switch; the
        // new current keeps running.
        assert_eq!(kernel.current().name, "next");
    }
}
