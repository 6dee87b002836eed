//! Dispatch-side record of one lock-then-commit allocation.
//!
//! The attempt is persisted before the remote lock call, so a lock whose
//! outcome is unknown (timeout, crash between lock and local commit) is
//! always visible and can be released by the reconciler.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use supplyline_core::{AttemptId, DomainError, DomainResult, LockKey, RequestId};
use supplyline_stock::LockItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttemptStatus {
    /// Persisted, lock call issued or about to be.
    Requested,
    /// Stock side confirmed the lock; local commit pending.
    Locked,
    /// Task committed. Terminal.
    Committed,
    /// Abandoned; its lock must be released (see `lock_released_at`).
    LockOrphaned,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Requested => "Requested",
            AttemptStatus::Locked => "Locked",
            AttemptStatus::Committed => "Committed",
            AttemptStatus::LockOrphaned => "LockOrphaned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Requested" => Some(AttemptStatus::Requested),
            "Locked" => Some(AttemptStatus::Locked),
            "Committed" => Some(AttemptStatus::Committed),
            "LockOrphaned" => Some(AttemptStatus::LockOrphaned),
            _ => None,
        }
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self, AttemptStatus::Requested | AttemptStatus::Locked)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationAttempt {
    pub id: AttemptId,
    pub request_id: RequestId,
    pub items: Vec<LockItem>,
    pub status: AttemptStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub lock_released_at: Option<DateTime<Utc>>,
}

impl AllocationAttempt {
    pub fn begin(request_id: RequestId, items: Vec<LockItem>, now: DateTime<Utc>) -> Self {
        Self {
            id: AttemptId::new(),
            request_id,
            items,
            status: AttemptStatus::Requested,
            created_at: now,
            updated_at: now,
            lock_released_at: None,
        }
    }

    pub fn lock_key(&self) -> LockKey {
        LockKey::from(self.id)
    }

    pub fn mark_locked(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.advance(AttemptStatus::Requested, AttemptStatus::Locked, now)
    }

    pub fn mark_committed(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.advance(AttemptStatus::Locked, AttemptStatus::Committed, now)
    }

    pub fn mark_orphaned(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if !self.status.is_in_flight() {
            return Err(DomainError::invalid_transition(format!(
                "attempt {} is {}, cannot orphan",
                self.id,
                self.status.as_str()
            )));
        }
        self.status = AttemptStatus::LockOrphaned;
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_lock_released(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status != AttemptStatus::LockOrphaned {
            return Err(DomainError::invalid_transition(format!(
                "attempt {} is {}, only orphaned attempts release their lock",
                self.id,
                self.status.as_str()
            )));
        }
        self.lock_released_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// In flight and untouched for longer than `ttl`.
    pub fn is_stale(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        self.status.is_in_flight() && self.updated_at + ttl < now
    }

    /// Orphaned and the stock side has not confirmed the release yet.
    pub fn needs_release(&self) -> bool {
        self.status == AttemptStatus::LockOrphaned && self.lock_released_at.is_none()
    }

    fn advance(
        &mut self,
        expected: AttemptStatus,
        next: AttemptStatus,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        if self.status != expected {
            return Err(DomainError::invalid_transition(format!(
                "attempt {} is {}, expected {}",
                self.id,
                self.status.as_str(),
                expected.as_str()
            )));
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt() -> AllocationAttempt {
        AllocationAttempt::begin(RequestId::new(), Vec::new(), Utc::now())
    }

    #[test]
    fn happy_path_reaches_committed() {
        let mut a = attempt();
        a.mark_locked(Utc::now()).unwrap();
        a.mark_committed(Utc::now()).unwrap();
        assert_eq!(a.status, AttemptStatus::Committed);
        assert!(a.mark_orphaned(Utc::now()).is_err());
    }

    #[test]
    fn orphaned_attempt_cannot_commit() {
        let mut a = attempt();
        a.mark_locked(Utc::now()).unwrap();
        a.mark_orphaned(Utc::now()).unwrap();
        assert!(a.mark_committed(Utc::now()).is_err());
        assert!(a.needs_release());
        a.mark_lock_released(Utc::now()).unwrap();
        assert!(!a.needs_release());
    }

    #[test]
    fn staleness_uses_last_update() {
        let mut a = attempt();
        let later = a.updated_at + Duration::seconds(31);
        assert!(a.is_stale(later, Duration::seconds(30)));
        assert!(!a.is_stale(later, Duration::seconds(60)));

        a.mark_locked(Utc::now()).unwrap();
        a.mark_committed(Utc::now()).unwrap();
        assert!(!a.is_stale(later + Duration::days(1), Duration::seconds(30)));
    }

    #[test]
    fn lock_key_matches_attempt_id() {
        let a = attempt();
        assert_eq!(a.lock_key().as_uuid(), a.id.as_uuid());
    }
}
