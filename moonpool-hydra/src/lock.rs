//! Automaton locks.
//!
//! Two counters guard the business automaton:
//!
//! | Lock | Held while | Blocks |
//! |---|---|---|
//! | user | one mutation handler runs | a second handler (no reentrancy) |
//! | system | a structural operation runs (snapshot capture, snapshot load) | new handlers |
//!
//! Neither lock is recursive. The system lock may be requested while the
//! user lock is held: it is granted immediately, blocks every later user
//! acquisition, and [`AutomatonLocks::acquire_system_quiescent`] then waits
//! for the running handler to finish. Acquiring in the other order never
//! happens, so the two cannot deadlock.

use std::cell::Cell;
use std::rc::Rc;

use tokio::sync::Notify;

/// Lock counters of one automaton.
#[derive(Debug, Default)]
pub struct AutomatonLocks {
    user: Cell<u32>,
    system: Cell<u32>,
    released: Notify,
}

impl AutomatonLocks {
    /// Create unlocked counters.
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Whether a mutation handler is running.
    pub fn is_user_locked(&self) -> bool {
        self.user.get() > 0
    }

    /// Whether a structural operation is running.
    pub fn is_system_locked(&self) -> bool {
        self.system.get() > 0
    }

    /// Take the user lock unless either lock is held.
    pub fn try_acquire_user(self: &Rc<Self>) -> Option<UserLockGuard> {
        if self.is_user_locked() || self.is_system_locked() {
            return None;
        }
        self.user.set(1);
        Some(UserLockGuard {
            locks: self.clone(),
        })
    }

    /// Take the user lock, waiting for both locks to be free.
    pub async fn acquire_user(self: &Rc<Self>) -> UserLockGuard {
        loop {
            let released = self.released.notified();
            if let Some(guard) = self.try_acquire_user() {
                return guard;
            }
            released.await;
        }
    }

    /// Take the system lock without waiting for a running handler.
    pub fn acquire_system(self: &Rc<Self>) -> SystemLockGuard {
        self.system.set(self.system.get() + 1);
        SystemLockGuard {
            locks: self.clone(),
        }
    }

    /// Take the system lock and wait until no handler is running.
    pub async fn acquire_system_quiescent(self: &Rc<Self>) -> SystemLockGuard {
        let guard = self.acquire_system();
        loop {
            let released = self.released.notified();
            if !self.is_user_locked() {
                return guard;
            }
            released.await;
        }
    }

    /// Wait until no structural operation is running.
    pub async fn wait_system_released(&self) {
        loop {
            let released = self.released.notified();
            if !self.is_system_locked() {
                return;
            }
            released.await;
        }
    }
}

/// Held while one mutation handler runs.
#[derive(Debug)]
pub struct UserLockGuard {
    locks: Rc<AutomatonLocks>,
}

impl Drop for UserLockGuard {
    fn drop(&mut self) {
        self.locks.user.set(0);
        self.locks.released.notify_waiters();
    }
}

/// Held while a structural operation runs.
#[derive(Debug)]
pub struct SystemLockGuard {
    locks: Rc<AutomatonLocks>,
}

impl Drop for SystemLockGuard {
    fn drop(&mut self) {
        self.locks.system.set(self.locks.system.get().saturating_sub(1));
        self.locks.released.notify_waiters();
    }
}
