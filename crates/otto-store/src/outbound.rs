//! Outbound delivery queue rows. Created by enqueue, mutated only by the three
//! terminal operations of the delivery processor, never re-claimed once
//! sent/failed.

use otto_core::error::{OttoError, Result};
use otto_core::traits::{DedupeOutcome, OutboundStore};
use otto_core::types::{EpochMs, MessagePriority, OutboundMessage, OutboundStatus};
use rusqlite::Row;

use crate::SqliteStore;

const OUTBOUND_COLUMNS: &str = "id, dedupe_key, chat_id, content, priority, status, \
     attempt_count, next_attempt_at, sent_at, failed_at, error_message, created_at, updated_at";

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<OutboundMessage> {
    let priority: String = row.get(4)?;
    let status: String = row.get(5)?;
    Ok(OutboundMessage {
        id: row.get(0)?,
        dedupe_key: row.get(1)?,
        chat_id: row.get(2)?,
        content: row.get(3)?,
        priority: MessagePriority::parse(&priority),
        status: OutboundStatus::parse(&status),
        attempt_count: row.get(6)?,
        next_attempt_at: row.get(7)?,
        sent_at: row.get(8)?,
        failed_at: row.get(9)?,
        error_message: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

impl OutboundStore for SqliteStore {
    fn enqueue_or_ignore_dedupe(&self, msg: &OutboundMessage) -> Result<DedupeOutcome> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "INSERT INTO outbound_messages
                 (id, dedupe_key, chat_id, content, priority, status, attempt_count,
                  next_attempt_at, sent_at, failed_at, error_message, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                 ON CONFLICT(dedupe_key) WHERE dedupe_key IS NOT NULL DO NOTHING",
                rusqlite::params![
                    msg.id,
                    msg.dedupe_key,
                    msg.chat_id,
                    msg.content,
                    msg.priority.as_str(),
                    msg.status.as_str(),
                    msg.attempt_count,
                    msg.next_attempt_at,
                    msg.sent_at,
                    msg.failed_at,
                    msg.error_message,
                    msg.created_at,
                    msg.updated_at,
                ],
            )
            .map_err(|e| OttoError::Storage(format!("Enqueue: {e}")))?;
        Ok(if changed > 0 {
            DedupeOutcome::Enqueued
        } else {
            DedupeOutcome::Duplicate
        })
    }

    fn list_due(&self, now: EpochMs) -> Result<Vec<OutboundMessage>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {OUTBOUND_COLUMNS} FROM outbound_messages
                 WHERE status = 'queued' AND next_attempt_at <= ?1
                 ORDER BY created_at ASC, rowid ASC"
            ))
            .map_err(|e| OttoError::Storage(format!("List due: {e}")))?;
        let rows = stmt
            .query_map(rusqlite::params![now], row_to_message)
            .map_err(|e| OttoError::Storage(format!("List due: {e}")))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    fn mark_sent(&self, id: &str, attempt_count: i64, now: EpochMs) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE outbound_messages SET status = 'sent', attempt_count = ?2,
                 sent_at = ?3, error_message = NULL, updated_at = ?3
             WHERE id = ?1 AND status = 'queued'",
            rusqlite::params![id, attempt_count, now],
        )
        .map_err(|e| OttoError::Storage(format!("Mark sent: {e}")))?;
        Ok(())
    }

    fn mark_retry(
        &self,
        id: &str,
        attempt_count: i64,
        next_attempt_at: EpochMs,
        error_message: &str,
        now: EpochMs,
    ) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE outbound_messages SET attempt_count = ?2, next_attempt_at = ?3,
                 error_message = ?4, updated_at = ?5
             WHERE id = ?1 AND status = 'queued'",
            rusqlite::params![id, attempt_count, next_attempt_at, error_message, now],
        )
        .map_err(|e| OttoError::Storage(format!("Mark retry: {e}")))?;
        Ok(())
    }

    fn mark_failed(
        &self,
        id: &str,
        attempt_count: i64,
        error_message: &str,
        now: EpochMs,
    ) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE outbound_messages SET status = 'failed', attempt_count = ?2,
                 failed_at = ?3, error_message = ?4, updated_at = ?3
             WHERE id = ?1 AND status = 'queued'",
            rusqlite::params![id, attempt_count, now, error_message],
        )
        .map_err(|e| OttoError::Storage(format!("Mark failed: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use otto_core::types::new_id;

    pub(crate) fn queued_message(dedupe_key: Option<&str>, next_attempt_at: EpochMs) -> OutboundMessage {
        OutboundMessage {
            id: new_id("msg"),
            dedupe_key: dedupe_key.map(String::from),
            chat_id: 42,
            content: "hello".into(),
            priority: MessagePriority::Normal,
            status: OutboundStatus::Queued,
            attempt_count: 0,
            next_attempt_at,
            sent_at: None,
            failed_at: None,
            error_message: None,
            created_at: 1_000,
            updated_at: 1_000,
        }
    }

    #[test]
    fn test_dedupe_key_conflict_is_duplicate() {
        let store = SqliteStore::open_in_memory().unwrap();
        let first = queued_message(Some("k"), 1_000);
        let second = queued_message(Some("k"), 1_000);

        assert_eq!(
            store.enqueue_or_ignore_dedupe(&first).unwrap(),
            DedupeOutcome::Enqueued
        );
        assert_eq!(
            store.enqueue_or_ignore_dedupe(&second).unwrap(),
            DedupeOutcome::Duplicate
        );
        assert_eq!(store.list_due(2_000).unwrap().len(), 1);
    }

    #[test]
    fn test_keyed_and_keyless_rows_coexist() {
        // The conflict target must match the partial unique index exactly, or
        // SQLite rejects every insert, keyed or not.
        let store = SqliteStore::open_in_memory().unwrap();
        assert_eq!(
            store.enqueue_or_ignore_dedupe(&queued_message(Some("k"), 1_000)).unwrap(),
            DedupeOutcome::Enqueued
        );
        assert_eq!(
            store.enqueue_or_ignore_dedupe(&queued_message(None, 1_000)).unwrap(),
            DedupeOutcome::Enqueued
        );
        assert_eq!(
            store.enqueue_or_ignore_dedupe(&queued_message(Some("k"), 1_000)).unwrap(),
            DedupeOutcome::Duplicate
        );
        assert_eq!(store.list_due(2_000).unwrap().len(), 2);
    }

    #[test]
    fn test_null_dedupe_keys_never_collide() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert_eq!(
            store.enqueue_or_ignore_dedupe(&queued_message(None, 1_000)).unwrap(),
            DedupeOutcome::Enqueued
        );
        assert_eq!(
            store.enqueue_or_ignore_dedupe(&queued_message(None, 1_000)).unwrap(),
            DedupeOutcome::Enqueued
        );
    }

    #[test]
    fn test_list_due_filters_status_and_time() {
        let store = SqliteStore::open_in_memory().unwrap();
        let due = queued_message(Some("a"), 1_000);
        let later = queued_message(Some("b"), 9_000);
        let sent = queued_message(Some("c"), 1_000);
        store.enqueue_or_ignore_dedupe(&due).unwrap();
        store.enqueue_or_ignore_dedupe(&later).unwrap();
        store.enqueue_or_ignore_dedupe(&sent).unwrap();
        store.mark_sent(&sent.id, 1, 1_500).unwrap();

        let listed = store.list_due(5_000).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, due.id);
    }

    #[test]
    fn test_list_due_ties_follow_insertion_order() {
        // Chunks of one message share created_at; rowid breaks the tie so
        // delivery order matches enqueue order.
        let store = SqliteStore::open_in_memory().unwrap();
        let mut inserted = Vec::new();
        for i in 1..=4 {
            let msg = queued_message(Some(&format!("k:{i}/4")), 1_000);
            store.enqueue_or_ignore_dedupe(&msg).unwrap();
            inserted.push(msg.id);
        }

        let listed: Vec<String> = store
            .list_due(1_000)
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(listed, inserted);
    }

    #[test]
    fn test_terminal_rows_are_not_reclaimed() {
        let store = SqliteStore::open_in_memory().unwrap();
        let msg = queued_message(Some("x"), 1_000);
        store.enqueue_or_ignore_dedupe(&msg).unwrap();
        store.mark_failed(&msg.id, 5, "gave up", 2_000).unwrap();

        // A late mark_sent on a failed row must not resurrect it
        store.mark_sent(&msg.id, 6, 3_000).unwrap();
        assert!(store.list_due(9_000).unwrap().is_empty());
    }

    #[test]
    fn test_mark_retry_keeps_row_queued() {
        let store = SqliteStore::open_in_memory().unwrap();
        let msg = queued_message(Some("r"), 1_000);
        store.enqueue_or_ignore_dedupe(&msg).unwrap();
        store.mark_retry(&msg.id, 1, 6_000, "timeout", 1_100).unwrap();

        assert!(store.list_due(5_999).unwrap().is_empty());
        let due = store.list_due(6_000).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].attempt_count, 1);
        assert_eq!(due[0].error_message.as_deref(), Some("timeout"));
    }
}
