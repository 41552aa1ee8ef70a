//! Audit facts: who attempted what, where, and how it ended.
//!
//! Facts carry identifiers only. Payloads never reach an [`AuditSink`].

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    ReadSecret,
    WriteSecret,
    DeleteSecret,
    ListKeys,
    ListFiles,
    ListVersions,
    ReadVersion,
    RestoreSdb,
    CreateSdb,
    ReadSdb,
    ListGrants,
    DeleteSdb,
    SetGrant,
    RevokeGrant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "reason", rename_all = "snake_case")]
pub enum AuditOutcome {
    Denied,
    Succeeded,
    Failed(String),
}

impl fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Denied => f.write_str("denied"),
            Self::Succeeded => f.write_str("succeeded"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditEvent {
    pub principal: String,
    pub action: AuditAction,
    pub sdb_id: Option<String>,
    pub path: Option<String>,
    pub outcome: AuditOutcome,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(principal: &str, action: AuditAction, outcome: AuditOutcome) -> Self {
        Self {
            principal: principal.to_owned(),
            action,
            sdb_id: None,
            path: None,
            outcome,
            timestamp: Utc::now(),
        }
    }

    pub fn sdb(mut self, sdb_id: &str) -> Self {
        self.sdb_id = Some(sdb_id.to_owned());
        self
    }

    pub fn path(mut self, path: &str) -> Self {
        self.path = Some(path.to_owned());
        self
    }
}

/// Destination of audit facts.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent);
}

/// Writes each fact as a structured event on the `audit` tracing target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: AuditEvent) {
        info!(
            target: "audit",
            principal = %event.principal,
            action = ?event.action,
            sdb_id = event.sdb_id.as_deref().unwrap_or(""),
            path = event.path.as_deref().unwrap_or(""),
            outcome = %event.outcome,
            timestamp = %event.timestamp,
            "audit"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_location() {
        let event = AuditEvent::new("alice", AuditAction::ReadSecret, AuditOutcome::Succeeded)
            .sdb("abc")
            .path("db/creds");
        assert_eq!(event.sdb_id.as_deref(), Some("abc"));
        assert_eq!(event.path.as_deref(), Some("db/creds"));
    }

    #[test]
    fn outcome_serialises_with_reason() {
        let json = serde_json::to_value(AuditOutcome::Failed("storage failure".into())).unwrap();
        assert_eq!(json["result"], "failed");
        assert_eq!(json["reason"], "storage failure");
        assert_eq!(AuditOutcome::Denied.to_string(), "denied");
    }

    #[tokio::test]
    async fn tracing_sink_accepts_events() {
        TracingAuditSink
            .record(AuditEvent::new("bob", AuditAction::CreateSdb, AuditOutcome::Denied))
            .await;
    }
}
