//! Per-vault critical section.
//!
//! Every operation on a vault, reads included, runs inside one
//! [`CriticalSection::enter`] call. Other threads queue on the mutex. The
//! thread already inside (typically a strategy calling back into the vault
//! from `invest` or `withdraw`) gets an immediate error instead of a
//! deadlock.

use std::thread::{self, ThreadId};

use parking_lot::Mutex;

use crate::error::VaultError;

pub struct CriticalSection<T> {
    state: Mutex<T>,
    owner: Mutex<Option<ThreadId>>,
}

/// Clears the owner on scope exit, unwinding included.
struct OwnerReset<'a>(&'a Mutex<Option<ThreadId>>);

impl Drop for OwnerReset<'_> {
    fn drop(&mut self) {
        *self.0.lock() = None;
    }
}

impl<T> CriticalSection<T> {
    pub fn new(state: T) -> Self {
        Self {
            state: Mutex::new(state),
            owner: Mutex::new(None),
        }
    }

    /// Runs `f` with exclusive access to the state.
    pub fn enter<R>(
        &self,
        op: &'static str,
        f: impl FnOnce(&mut T) -> Result<R, VaultError>,
    ) -> Result<R, VaultError> {
        let me = thread::current().id();
        if *self.owner.lock() == Some(me) {
            tracing::warn!(op, "re-entrant vault call rejected");
            return Err(VaultError::Reentrancy { op });
        }
        let mut state = self.state.lock();
        *self.owner.lock() = Some(me);
        let _reset = OwnerReset(&self.owner);
        f(&mut state)
    }

    /// Whether some thread is currently inside.
    pub fn is_busy(&self) -> bool {
        self.owner.lock().is_some()
    }

    pub fn into_inner(self) -> T {
        self.state.into_inner()
    }
}
