// Instance Lifecycle State Machine
//
// Tracks whether a prompt log instance may touch the store.
// Transitions are pure; the coordinator decides when to apply them.

use crate::error::LogError;

/// Lifecycle state of a prompt log instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogState {
    /// Constructed, `init` not yet successful.
    Uninitialized,

    /// Accepting appends.
    Running,

    /// Halted for good. No further mutation.
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Initialized,
    Halted,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StateError {
    #[error("illegal state transition: {0}")]
    IllegalTransition(String),
}

#[derive(Debug)]
pub struct Lifecycle {
    state: LogState,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: LogState::Uninitialized,
        }
    }

    pub fn apply(&mut self, event: LifecycleEvent) -> Result<(), StateError> {
        use LifecycleEvent::*;
        use LogState::*;

        self.state = match (self.state, event) {
            (Uninitialized, Initialized) => Running,

            // Halting is allowed from anywhere and is idempotent
            (_, Halted) => Stopped,

            (state, evt) => {
                return Err(StateError::IllegalTransition(format!(
                    "cannot apply {:?} while {:?}",
                    evt, state
                )))
            }
        };

        Ok(())
    }

    pub fn current_state(&self) -> LogState {
        self.state
    }

    /// Gate for every store-touching operation.
    pub fn require_running(&self) -> Result<(), LogError> {
        match self.state {
            LogState::Running => Ok(()),
            LogState::Uninitialized => Err(LogError::NotInitialized),
            LogState::Stopped => Err(LogError::Stopped),
        }
    }
}
