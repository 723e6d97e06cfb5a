use std::sync::{Arc, Mutex};

use chrono::{NaiveDateTime, TimeDelta};
use tracing::warn;

use crate::core::Result;

/// One grant of the sync lock. The token tells grants apart after a forced reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grant {
    pub token: u64,
    pub granted_at: NaiveDateTime,
}

#[derive(Debug, Default)]
struct LockState {
    holder: Option<Grant>,
    next_token: u64,
}

/// Single global mutual-exclusion flag of the sync scheduler plus its grant time.
#[derive(Debug, Default)]
pub struct SyncLock {
    state: Mutex<LockState>,
}

impl SyncLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-blocking acquire; `None` while another grant is held.
    pub fn try_acquire(&self, now: NaiveDateTime) -> Result<Option<Grant>> {
        let mut state = self.state.lock()?;
        if state.holder.is_some() {
            return Ok(None);
        }
        state.next_token += 1;
        let grant = Grant { token: state.next_token, granted_at: now };
        state.holder = Some(grant);
        Ok(Some(grant))
    }

    /// Releases the lock if `token` is the current grant. A holder whose grant was
    /// force-reset in the meantime releases nothing.
    pub fn release(&self, token: u64) -> Result<bool> {
        let mut state = self.state.lock()?;
        match state.holder {
            Some(grant) if grant.token == token => {
                state.holder = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Drops the current grant regardless of its holder; returns it.
    pub fn force_reset(&self) -> Result<Option<Grant>> {
        let mut state = self.state.lock()?;
        Ok(state.holder.take())
    }

    pub fn holder(&self) -> Result<Option<Grant>> {
        Ok(self.state.lock()?.holder)
    }

    pub fn is_held(&self) -> bool {
        self.holder().map(|h| h.is_some()).unwrap_or(false)
    }

    /// Grant held for longer than `timeout` at `now`.
    pub fn stale_grant(&self, now: NaiveDateTime, timeout: TimeDelta) -> Result<Option<Grant>> {
        Ok(self.holder()?.filter(|grant| now > grant.granted_at + timeout))
    }
}

/// Releases its grant when dropped, on every exit path of the holder.
#[derive(Debug)]
pub struct LockGuard {
    lock: Arc<SyncLock>,
    grant: Grant,
}

impl LockGuard {
    pub fn new(lock: Arc<SyncLock>, grant: Grant) -> Self {
        Self { lock, grant }
    }

    pub fn grant(&self) -> Grant {
        self.grant
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.lock.release(self.grant.token) {
            warn!(token = self.grant.token, error = %e, "sync lock release failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap().and_hms_opt(10, minute, 0).unwrap()
    }

    #[test]
    fn test_acquire_is_exclusive() {
        let lock = SyncLock::new();
        let grant = lock.try_acquire(at(0)).unwrap().unwrap();
        assert!(lock.try_acquire(at(1)).unwrap().is_none());
        assert!(lock.release(grant.token).unwrap());
        assert!(lock.try_acquire(at(2)).unwrap().is_some());
    }

    #[test]
    fn test_release_after_reset_is_ignored() {
        let lock = SyncLock::new();
        let old = lock.try_acquire(at(0)).unwrap().unwrap();
        assert_eq!(lock.force_reset().unwrap(), Some(old));
        let new = lock.try_acquire(at(5)).unwrap().unwrap();
        assert!(!lock.release(old.token).unwrap());
        assert_eq!(lock.holder().unwrap(), Some(new));
    }

    #[test]
    fn test_stale_only_after_timeout() {
        let lock = SyncLock::new();
        lock.try_acquire(at(0)).unwrap();
        assert!(lock.stale_grant(at(3), TimeDelta::minutes(3)).unwrap().is_none());
        assert!(lock.stale_grant(at(4), TimeDelta::minutes(3)).unwrap().is_some());
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let lock = Arc::new(SyncLock::new());
        let grant = lock.try_acquire(at(0)).unwrap().unwrap();
        drop(LockGuard::new(Arc::clone(&lock), grant));
        assert!(!lock.is_held());
    }
}
