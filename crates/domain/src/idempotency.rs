//! Idempotency keys for conversion requests.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use common::{LeadId, TenantId, UserId};

/// A stored idempotency key.
///
/// The first request to claim a `(tenant_id, key)` pair owns the
/// resource it points at; every later request with the same pair is
/// answered from the recorded resource instead of doing the work
/// again. Keys expire after a TTL, after which the pair may be reused
/// for fresh work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyKey {
    pub key: String,
    pub tenant_id: TenantId,
    /// The saga this key resolved to.
    pub resource_id: Uuid,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl IdempotencyKey {
    pub fn new(
        tenant_id: TenantId,
        key: impl Into<String>,
        resource_id: Uuid,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            key: key.into(),
            tenant_id,
            resource_id,
            expires_at: now + ttl,
            created_at: now,
        }
    }

    /// Returns true once the key's TTL has elapsed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Derives a deterministic conversion key for clients that do not
/// supply their own: one key per lead, user and five-minute window, so
/// an accidental double-click lands on the same key while a deliberate
/// retry hours later starts fresh.
pub fn conversion_key(lead_id: LeadId, user_id: UserId, now: DateTime<Utc>) -> String {
    let window = now.timestamp() / 300;
    format!("convert:{lead_id}:{user_id}:{window}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_expires_after_ttl() {
        let key = IdempotencyKey::new(
            TenantId::new(),
            "convert:abc",
            Uuid::new_v4(),
            Duration::hours(24),
        );
        assert!(!key.is_expired(Utc::now()));
        assert!(key.is_expired(Utc::now() + Duration::hours(25)));
    }

    #[test]
    fn derived_key_is_stable_within_window() {
        let lead = LeadId::new();
        let user = UserId::new();
        let now = Utc::now();
        assert_eq!(
            conversion_key(lead, user, now),
            conversion_key(lead, user, now)
        );
    }

    #[test]
    fn derived_key_changes_across_windows() {
        let lead = LeadId::new();
        let user = UserId::new();
        let now = Utc::now();
        assert_ne!(
            conversion_key(lead, user, now),
            conversion_key(lead, user, now + Duration::minutes(10))
        );
    }
}
