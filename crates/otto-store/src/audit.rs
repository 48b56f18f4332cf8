//! Append-only mutation audit trail.

use otto_core::error::{OttoError, Result};
use otto_core::traits::AuditStore;
use otto_core::types::TaskAuditRecord;

use crate::SqliteStore;

impl AuditStore for SqliteStore {
    fn insert(&self, record: &TaskAuditRecord) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO task_audit
             (id, task_id, action, lane, actor, before_json, after_json, metadata_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![
                record.id,
                record.task_id,
                record.action.as_str(),
                record.lane.as_str(),
                record.actor,
                record.before_json,
                record.after_json,
                record.metadata_json,
                record.created_at,
            ],
        )
        .map_err(|e| OttoError::Storage(format!("Audit insert: {e}")))?;
        Ok(())
    }
}

impl SqliteStore {
    /// Audit rows for one task, oldest first. Operator/debug surface.
    pub fn list_audit_for_task(&self, task_id: &str) -> Result<Vec<TaskAuditRecord>> {
        use otto_core::types::{AuditAction, AuditLane};

        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, task_id, action, lane, actor, before_json, after_json,
                        metadata_json, created_at
                 FROM task_audit WHERE task_id = ?1 ORDER BY created_at ASC",
            )
            .map_err(|e| OttoError::Storage(format!("Audit list: {e}")))?;
        let rows = stmt
            .query_map([task_id], |row| {
                let action: String = row.get(2)?;
                let lane: String = row.get(3)?;
                Ok(TaskAuditRecord {
                    id: row.get(0)?,
                    task_id: row.get(1)?,
                    action: match action.as_str() {
                        "create" => AuditAction::Create,
                        "delete" => AuditAction::Delete,
                        _ => AuditAction::Update,
                    },
                    lane: match lane.as_str() {
                        "scheduled" => AuditLane::Scheduled,
                        _ => AuditLane::Interactive,
                    },
                    actor: row.get(4)?,
                    before_json: row.get(5)?,
                    after_json: row.get(6)?,
                    metadata_json: row.get(7)?,
                    created_at: row.get(8)?,
                })
            })
            .map_err(|e| OttoError::Storage(format!("Audit list: {e}")))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use otto_core::types::{new_id, AuditAction, AuditLane};

    #[test]
    fn test_insert_and_list() {
        let store = SqliteStore::open_in_memory().unwrap();
        let record = TaskAuditRecord {
            id: new_id("audit"),
            task_id: "job-1".into(),
            action: AuditAction::Create,
            lane: AuditLane::Interactive,
            actor: "operator".into(),
            before_json: None,
            after_json: Some("{\"id\":\"job-1\"}".into()),
            metadata_json: None,
            created_at: 1_000,
        };
        store.insert(&record).unwrap();

        let rows = store.list_audit_for_task("job-1").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].action, AuditAction::Create);
        assert_eq!(rows[0].actor, "operator");
    }
}
