//! Thread control blocks and CPU-burst accounting.
//!
//! A thread carries its scheduling identity: a priority in `0..=149`,
//! the burst estimate the top queue sorts by, and the tick bookkeeping
//! aging runs on. The priority selects the ready queue: 100 and above
//! is L1, 50 to 99 is L2, the rest is L3.
//!
//! The burst estimate is an exponential average. While a thread runs,
//! its measured burst grows tick by tick; when it blocks, the estimate
//! folds the measurement in at half weight, and when it wakes, the
//! remaining-burst field restarts from the estimate.

use crate::addrspace::AddressSpace;
use mimic::machine::{Machine, NUM_TOTAL_REGS};

/// Thread identifier.
pub type Tid = usize;

/// Highest priority a thread can hold.
pub const MAX_PRIORITY: u32 = 149;

/// A possible state of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    /// Built but never made ready.
    JustCreated,
    /// Waiting in a ready queue.
    Ready,
    /// Holding the CPU.
    Running,
    /// Waiting for an event.
    Blocked,
    /// Finished, awaiting deferred teardown.
    Zombie,
}

/// The three ready-queue levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueLevel {
    /// Preemptive shortest-remaining-time-first.
    L1,
    /// Non-preemptive priority.
    L2,
    /// Round-robin.
    L3,
}

impl QueueLevel {
    /// The level's number, 1 through 3, as the trace lines print it.
    pub fn number(self) -> usize {
        match self {
            QueueLevel::L1 => 1,
            QueueLevel::L2 => 2,
            QueueLevel::L3 => 3,
        }
    }
}

/// A thread control block.
pub struct Thread {
    /// Thread identifier.
    pub id: Tid,
    /// Thread name, for traces.
    pub name: String,
    /// Scheduling state.
    pub status: ThreadStatus,
    /// Priority, `0..=`[`MAX_PRIORITY`].
    pub priority: u32,
    /// Estimated ticks left in the current burst; L1's sort key.
    pub remain_burst: f64,
    /// Exponential average of completed bursts.
    pub approx_burst: f64,
    /// Measured ticks of the burst in progress.
    pub true_burst: f64,
    /// Tick at which the thread last entered a ready queue; aging
    /// advances this as it credits waiting time.
    pub insert_ready_time: u64,
    /// Ready-queue waiting not yet converted into a priority boost.
    pub total_ready_time: u64,
    /// User-mode registers saved across context switches.
    pub user_registers: [i32; NUM_TOTAL_REGS],
    /// The address space, for threads running a user program.
    pub space: Option<AddressSpace>,
    running_since: u64,
}

impl Thread {
    /// A fresh thread at `priority`.
    pub fn new(id: Tid, name: impl Into<String>, priority: u32) -> Self {
        assert!(priority <= MAX_PRIORITY);
        Self {
            id,
            name: name.into(),
            status: ThreadStatus::JustCreated,
            priority,
            remain_burst: 0.0,
            approx_burst: 0.0,
            true_burst: 0.0,
            insert_ready_time: 0,
            total_ready_time: 0,
            user_registers: [0; NUM_TOTAL_REGS],
            space: None,
            running_since: 0,
        }
    }

    /// The ready-queue level the current priority maps to.
    pub fn which_queue(&self) -> QueueLevel {
        if self.priority >= 100 {
            QueueLevel::L1
        } else if self.priority >= 50 {
            QueueLevel::L2
        } else {
            QueueLevel::L3
        }
    }

    /// Record entry into a ready queue at tick `now`.
    pub fn start_ready(&mut self, now: u64) {
        self.insert_ready_time = now;
    }

    /// Record dispatch at tick `now`.
    pub fn start_running(&mut self, now: u64) {
        self.running_since = now;
    }

    /// The tick this thread was last dispatched at.
    pub fn running_since(&self) -> u64 {
        self.running_since
    }

    /// Credit `elapsed` running ticks to the burst in progress. The
    /// remaining estimate shrinks toward zero as the measurement grows.
    pub fn tick_running(&mut self, elapsed: u64) {
        self.true_burst += elapsed as f64;
        self.remain_burst = (self.approx_burst - self.true_burst).max(0.0);
    }

    /// Restart burst accounting on a blocked-to-ready transition.
    pub fn resume_burst(&mut self) {
        self.remain_burst = self.approx_burst;
        self.true_burst = 0.0;
    }

    /// Fold the measured burst into the estimate on blocking:
    /// `approx = 0.5 * measured + 0.5 * approx`.
    pub fn finish_burst(&mut self) {
        self.approx_burst = 0.5 * self.true_burst + 0.5 * self.approx_burst;
    }

    /// Snapshot the machine's user registers into this thread.
    pub fn save_user_state(&mut self, machine: &Machine) {
        for (reg, slot) in self.user_registers.iter_mut().enumerate() {
            *slot = machine.read_register(reg);
        }
    }

    /// Write this thread's saved registers back into the machine.
    pub fn restore_user_state(&self, machine: &mut Machine) {
        for (reg, value) in self.user_registers.iter().enumerate() {
            machine.write_register(reg, *value);
        }
    }
}
