use atelier_core::NewAuditEntry;
use atelier_store::Db;
use tracing::{info, warn};

/// Fire-and-forget audit persistence.
///
/// Write failures are logged and swallowed so an audit-store problem can
/// never block the action being audited.
#[derive(Clone)]
pub struct AuditRecorder {
    db: Db,
}

impl AuditRecorder {
    /// Wrap a store handle.
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Record one governed decision.
    pub fn record(&self, entry: NewAuditEntry) {
        info!(
            agent = %entry.agent_name,
            action = %entry.action,
            target = %entry.target,
            decision = entry.decision.as_str(),
            "audit"
        );
        if let Err(e) = self.db.insert_audit(&entry) {
            warn!(error = %e, action = %entry.action, "Audit write failed; entry dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atelier_core::AuditDecision;

    #[test]
    fn test_record_persists() {
        let db = Db::open_in_memory().unwrap();
        let recorder = AuditRecorder::new(db.clone());
        recorder.record(NewAuditEntry::new(
            "executor",
            "write_file",
            "src/a.rs",
            AuditDecision::Executed,
            "approved staging",
        ));
        assert_eq!(db.recent_audit_entries(10).unwrap().len(), 1);
    }

    #[test]
    fn test_record_swallows_store_failure() {
        let db = Db::open_in_memory().unwrap();
        let recorder = AuditRecorder::new(db.clone());
        db.break_table("audit_log").unwrap();
        // Must not panic or error.
        recorder.record(NewAuditEntry::new(
            "executor",
            "write_file",
            "src/a.rs",
            AuditDecision::Executed,
            "approved staging",
        ));
    }
}
