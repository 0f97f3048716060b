use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Persisted handle that lets an external event resume a suspended execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinuationRecord {
    /// Key derived from the context at suspend time
    pub correlation_key: String,
    /// Opaque orchestrator token
    pub resume_token: String,
    /// Suspended execution
    pub flow_execution_id: String,
    /// Waiting step
    pub step_instance_id: String,
    /// When the execution suspended
    pub created_at: DateTime<Utc>,
    /// Lifetime in seconds
    pub ttl_seconds: u64,
}

impl ContinuationRecord {
    /// Expiry instant; `None` when the TTL is beyond the representable range
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let ttl = i64::try_from(self.ttl_seconds).ok()?;
        self.created_at.checked_add_signed(Duration::try_seconds(ttl)?)
    }

    /// Whether the record is past its TTL at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().map(|expiry| now >= expiry).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry() {
        let created = Utc::now();
        let record = ContinuationRecord {
            correlation_key: "order-1".to_string(),
            resume_token: "token".to_string(),
            flow_execution_id: "exec-1".to_string(),
            step_instance_id: "wait".to_string(),
            created_at: created,
            ttl_seconds: 60,
        };
        assert!(!record.is_expired_at(created + Duration::seconds(59)));
        assert!(record.is_expired_at(created + Duration::seconds(60)));
    }

    #[test]
    fn test_huge_ttl_does_not_overflow() {
        let record = ContinuationRecord {
            correlation_key: "k".to_string(),
            resume_token: "t".to_string(),
            flow_execution_id: "e".to_string(),
            step_instance_id: "s".to_string(),
            created_at: Utc::now(),
            ttl_seconds: u64::MAX,
        };
        assert!(!record.is_expired_at(Utc::now()));
    }
}
