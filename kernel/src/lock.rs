// Advisory Lock
//
// Each process stamps a random token into the index. A later load that
// finds a different token means another writer has claimed the store.
//
// This is detection only: two writers racing between a load and a write
// can both believe they own the store until the next load.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::LogError;

/// Per-process ownership token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    pub fn generate() -> Self {
        let mut id = Uuid::new_v4().simple().to_string();
        id.truncate(13);
        Self(id)
    }

    pub fn from_string(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Compare against the token found in the remote index.
    pub fn verify(&self, remote: &str) -> Result<(), LogError> {
        if remote == self.0 {
            Ok(())
        } else {
            Err(LogError::LockConflict {
                expected: self.0.clone(),
                found: remote.to_string(),
            })
        }
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

type StopCallback = Box<dyn Fn() + Send + Sync>;

/// Fires the owner's stop callback at most once.
#[derive(Default)]
pub struct StopSignal {
    fired: AtomicBool,
    callback: Mutex<Option<StopCallback>>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the callback. A later call replaces an unfired callback.
    pub fn arm<F: Fn() + Send + Sync + 'static>(&self, callback: F) {
        *self.callback.lock() = Some(Box::new(callback));
    }

    /// Invoke the callback if it has not run yet. Returns whether this
    /// call was the one that fired it.
    pub fn fire(&self) -> bool {
        if self.fired.swap(true, Ordering::SeqCst) {
            return false;
        }
        let callback = self.callback.lock().take();
        if let Some(callback) = callback {
            callback();
        }
        true
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for StopSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopSignal")
            .field("fired", &self.has_fired())
            .finish()
    }
}
