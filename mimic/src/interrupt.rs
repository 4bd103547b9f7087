//! Interrupt enable state.
//!
//! The kernel's only mutual-exclusion primitive is disabling
//! interrupts: on a single simulated CPU, code that runs with
//! interrupts off cannot be preempted, so every scheduler and
//! frame-table critical section takes an [`InterruptGuard`] and every
//! scheduler entry point asserts the state is [`InterruptState::Off`].

use std::cell::Cell;

thread_local! {
    // true = interrupts enabled.
    static ENABLED: Cell<bool> = const { Cell::new(true) };
}

/// Whether interrupts are currently deliverable.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum InterruptState {
    /// Interrupts are on.
    On,
    /// Interrupts are off.
    Off,
}

impl InterruptState {
    /// Read the current interrupt state.
    pub fn current() -> Self {
        if ENABLED.with(|e| e.get()) {
            Self::On
        } else {
            Self::Off
        }
    }
}

/// An RAII implementation of an interrupt disable. When this structure
/// is dropped (falls out of scope), the interrupt state is restored to
/// what it was on creation. Guards must therefore be dropped in reverse
/// order of creation.
pub struct InterruptGuard {
    state: InterruptState,
}

impl InterruptGuard {
    /// Disable interrupts, remembering the previous state.
    pub fn new() -> Self {
        let state = InterruptState::current();
        ENABLED.with(|e| e.set(false));
        Self { state }
    }
}

impl Default for InterruptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        if self.state == InterruptState::On {
            ENABLED.with(|e| e.set(true));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_restores_previous_state() {
        assert_eq!(InterruptState::current(), InterruptState::On);
        {
            let _outer = InterruptGuard::new();
            assert_eq!(InterruptState::current(), InterruptState::Off);
            {
                let _inner = InterruptGuard::new();
                assert_eq!(InterruptState::current(), InterruptState::Off);
            }
            // Inner guard saw interrupts already off; still off here.
            assert_eq!(InterruptState::current(), InterruptState::Off);
        }
        assert_eq!(InterruptState::current(), InterruptState::On);
    }
}
