//! Outbound delivery queue: chunked, dedupe-safe enqueue plus a
//! retry-with-backoff delivery processor.
//!
//! Enqueue splits oversized content into ordered chunks, each persisted as its
//! own queued row with a derived dedupe key, so every chunk's delivery is
//! independently retryable and idempotent. The processor drains strictly one
//! message at a time and refuses concurrent drains.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use otto_core::config::QueueConfig;
use otto_core::error::{OttoError, Result};
use otto_core::traits::{DedupeOutcome, MessageTransport, OutboundStore};
use otto_core::types::{
    new_id, EpochMs, MessagePriority, OutboundMessage, OutboundStatus,
};
use tracing::{debug, error, info, warn};

const MAX_DEDUPE_KEY_LEN: usize = 512;

/// Input for `enqueue_message`. Content longer than the transport limit is
/// split; the dedupe key (when given) covers the whole logical message.
#[derive(Debug, Clone)]
pub struct EnqueueInput {
    pub chat_id: i64,
    pub content: String,
    pub dedupe_key: Option<String>,
    pub priority: Option<MessagePriority>,
}

/// Aggregate outcome of one enqueue call across all chunks.
#[derive(Debug, Clone)]
pub struct EnqueueResult {
    /// `Enqueued` if at least one chunk was newly queued.
    pub status: DedupeOutcome,
    pub queued_count: usize,
    pub duplicate_count: usize,
    /// Ids of the newly created rows, in chunk order.
    pub message_ids: Vec<String>,
    /// The original (unsplit) dedupe key.
    pub dedupe_key: Option<String>,
}

/// Dedupe-safe chunked enqueue over the outbound store.
#[derive(Clone)]
pub struct OutboundQueue {
    store: Arc<dyn OutboundStore>,
    config: QueueConfig,
}

impl OutboundQueue {
    pub fn new(store: Arc<dyn OutboundStore>, config: QueueConfig) -> Self {
        Self { store, config }
    }

    /// Validate, chunk, and persist a message. Per-chunk dedupe conflicts are
    /// reported in the aggregate result, never as errors.
    pub fn enqueue_message(&self, input: EnqueueInput, now: EpochMs) -> Result<EnqueueResult> {
        if input.chat_id <= 0 {
            return Err(OttoError::Invalid("chat_id must be a positive integer".into()));
        }
        if input.content.trim().is_empty() {
            return Err(OttoError::Invalid("content must be non-empty".into()));
        }
        if let Some(key) = &input.dedupe_key {
            if key.is_empty() || key.chars().count() > MAX_DEDUPE_KEY_LEN {
                return Err(OttoError::Invalid(format!(
                    "dedupe_key must be 1..={MAX_DEDUPE_KEY_LEN} characters"
                )));
            }
        }

        let chunks = split_chunks(&input.content, self.config.max_message_len);
        let total = chunks.len();
        let priority = input.priority.unwrap_or(MessagePriority::Normal);

        let mut queued_count = 0;
        let mut duplicate_count = 0;
        let mut message_ids = Vec::new();

        for (index, chunk) in chunks.into_iter().enumerate() {
            let msg = OutboundMessage {
                id: new_id("msg"),
                dedupe_key: input
                    .dedupe_key
                    .as_deref()
                    .map(|k| chunk_dedupe_key(k, index + 1, total)),
                chat_id: input.chat_id,
                content: chunk,
                priority,
                status: OutboundStatus::Queued,
                attempt_count: 0,
                next_attempt_at: now,
                sent_at: None,
                failed_at: None,
                error_message: None,
                created_at: now,
                updated_at: now,
            };
            match self.store.enqueue_or_ignore_dedupe(&msg)? {
                DedupeOutcome::Enqueued => {
                    queued_count += 1;
                    message_ids.push(msg.id);
                }
                DedupeOutcome::Duplicate => {
                    debug!("Duplicate outbound chunk ignored: {:?}", msg.dedupe_key);
                    duplicate_count += 1;
                }
            }
        }

        Ok(EnqueueResult {
            status: if queued_count > 0 {
                DedupeOutcome::Enqueued
            } else {
                DedupeOutcome::Duplicate
            },
            queued_count,
            duplicate_count,
            message_ids,
            dedupe_key: input.dedupe_key,
        })
    }
}

/// Dedupe key for chunk `index` of `total` (1-based). A message that did not
/// split keeps the caller's key verbatim.
pub fn chunk_dedupe_key(base: &str, index: usize, total: usize) -> String {
    if total == 1 {
        base.to_string()
    } else {
        format!("{base}:{index}/{total}")
    }
}

/// Split content into ordered chunks of at most `max_len` characters,
/// preferring a newline boundary, then a space; the boundary character itself
/// is swallowed. A hard cut is the last resort for unbreakable runs.
pub fn split_chunks(content: &str, max_len: usize) -> Vec<String> {
    let max_len = max_len.max(1);
    let mut chunks = Vec::new();
    let mut rest: Vec<char> = content.chars().collect();

    while rest.len() > max_len {
        let window = &rest[..=max_len];
        let cut = window
            .iter()
            .rposition(|&c| c == '\n')
            .or_else(|| window.iter().rposition(|&c| c == ' '));
        match cut {
            Some(pos) if pos > 0 => {
                chunks.push(rest[..pos].iter().collect());
                rest.drain(..=pos);
            }
            _ => {
                chunks.push(rest[..max_len].iter().collect());
                rest.drain(..max_len);
            }
        }
    }
    if !rest.is_empty() {
        chunks.push(rest.into_iter().collect());
    }
    if chunks.is_empty() {
        chunks.push(String::new());
    }
    chunks
}

/// Retry delay before attempt `attempt + 1`, given `attempt` failures so far:
/// `min(base * 2^(attempt-1), max)`.
pub fn backoff_delay_ms(config: &QueueConfig, attempt: i64) -> i64 {
    let exp = (attempt - 1).clamp(0, 30) as u32;
    config
        .base_delay_ms
        .saturating_mul(1_i64 << exp)
        .min(config.max_delay_ms)
}

fn truncate_error(message: &str, max_len: usize) -> String {
    if message.chars().count() <= max_len {
        message.to_string()
    } else {
        message.chars().take(max_len).collect()
    }
}

/// Drains due outbound rows through the injected transport, one at a time,
/// with bounded exponential backoff on failure.
pub struct DeliveryProcessor {
    store: Arc<dyn OutboundStore>,
    transport: Arc<dyn MessageTransport>,
    config: QueueConfig,
    /// Only one drain runs at a time; owned by the instance.
    draining: AtomicBool,
}

impl DeliveryProcessor {
    pub fn new(
        store: Arc<dyn OutboundStore>,
        transport: Arc<dyn MessageTransport>,
        config: QueueConfig,
    ) -> Self {
        Self {
            store,
            transport,
            config,
            draining: AtomicBool::new(false),
        }
    }

    /// Process every row with `next_attempt_at <= now`, strictly sequentially.
    /// Returns the number of messages delivered. A concurrent call while a
    /// drain is in flight returns 0 immediately.
    pub async fn drain_due_messages(&self, now: EpochMs) -> Result<usize> {
        if self.draining.swap(true, Ordering::SeqCst) {
            debug!("Drain skipped: previous drain still running");
            return Ok(0);
        }

        let result = self.drain_inner(now).await;
        self.draining.store(false, Ordering::SeqCst);
        result
    }

    async fn drain_inner(&self, now: EpochMs) -> Result<usize> {
        let due = self.store.list_due(now)?;
        if due.is_empty() {
            return Ok(0);
        }
        debug!("Draining {} due outbound message(s)", due.len());

        let mut delivered = 0;
        for msg in due {
            match self.deliver(&msg).await {
                Ok(()) => {
                    self.store.mark_sent(&msg.id, msg.attempt_count + 1, now)?;
                    info!("📤 Delivered message {} to chat {}", msg.id, msg.chat_id);
                    delivered += 1;
                }
                Err(e) => {
                    let attempt = msg.attempt_count + 1;
                    let err = truncate_error(&e.to_string(), self.config.max_error_len);
                    if attempt < self.config.max_attempts {
                        let delay = backoff_delay_ms(&self.config, attempt);
                        warn!(
                            "Delivery of {} failed (attempt {attempt}), retrying in {delay}ms: {err}",
                            msg.id
                        );
                        self.store
                            .mark_retry(&msg.id, attempt, now + delay, &err, now)?;
                    } else {
                        error!(
                            "Delivery of {} failed terminally after {attempt} attempt(s): {err}",
                            msg.id
                        );
                        self.store.mark_failed(&msg.id, attempt, &err, now)?;
                    }
                }
            }
        }
        Ok(delivered)
    }

    async fn deliver(&self, msg: &OutboundMessage) -> Result<()> {
        // Rows written by the queue are already within the limit; re-splitting
        // covers rows enqueued by other writers.
        for chunk in split_chunks(&msg.content, self.config.max_message_len) {
            self.transport.send_message(msg.chat_id, &chunk).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use otto_store::SqliteStore;
    use std::sync::Mutex;

    struct RecordingTransport {
        sent: Mutex<Vec<(i64, String)>>,
        fail: bool,
    }

    impl RecordingTransport {
        fn ok() -> Arc<Self> {
            Arc::new(Self { sent: Mutex::new(Vec::new()), fail: false })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self { sent: Mutex::new(Vec::new()), fail: true })
        }
    }

    #[async_trait]
    impl MessageTransport for RecordingTransport {
        async fn send_message(&self, chat_id: i64, text: &str) -> Result<()> {
            if self.fail {
                return Err(OttoError::Transport("chat unreachable".into()));
            }
            self.sent.lock().unwrap().push((chat_id, text.to_string()));
            Ok(())
        }
    }

    fn queue() -> (OutboundQueue, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        (OutboundQueue::new(store.clone(), QueueConfig::default()), store)
    }

    fn input(content: &str, dedupe_key: Option<&str>) -> EnqueueInput {
        EnqueueInput {
            chat_id: 42,
            content: content.into(),
            dedupe_key: dedupe_key.map(str::to_string),
            priority: None,
        }
    }

    #[test]
    fn test_split_prefers_newline_then_space() {
        let chunks = split_chunks("alpha beta\ngamma delta", 12);
        assert_eq!(chunks, vec!["alpha beta", "gamma delta"]);

        let chunks = split_chunks("alpha beta gamma", 12);
        assert_eq!(chunks, vec!["alpha beta", "gamma"]);
    }

    #[test]
    fn test_split_hard_cuts_unbreakable_runs() {
        let chunks = split_chunks("aaaaaaaaaa", 4);
        assert_eq!(chunks, vec!["aaaa", "aaaa", "aa"]);
    }

    #[test]
    fn test_split_short_content_is_one_chunk() {
        assert_eq!(split_chunks("hi", 4_000), vec!["hi"]);
    }

    #[test]
    fn test_chunk_dedupe_key_naming() {
        assert_eq!(chunk_dedupe_key("k", 1, 1), "k");
        assert_eq!(chunk_dedupe_key("k", 1, 3), "k:1/3");
        assert_eq!(chunk_dedupe_key("k", 3, 3), "k:3/3");
    }

    #[test]
    fn test_backoff_monotone_and_bounded() {
        let config = QueueConfig::default();
        assert_eq!(backoff_delay_ms(&config, 1), config.base_delay_ms);
        assert_eq!(backoff_delay_ms(&config, 2), config.base_delay_ms * 2);
        let mut prev = 0;
        for attempt in 1..=40 {
            let delay = backoff_delay_ms(&config, attempt);
            assert!(delay >= prev, "backoff must be non-decreasing");
            assert!(delay <= config.max_delay_ms);
            prev = delay;
        }
        assert_eq!(backoff_delay_ms(&config, 40), config.max_delay_ms);
    }

    #[test]
    fn test_enqueue_validation() {
        let (queue, _) = queue();
        let mut bad = input("hello", None);
        bad.chat_id = 0;
        assert!(queue.enqueue_message(bad, 1_000).is_err());

        assert!(queue.enqueue_message(input("   ", None), 1_000).is_err());

        let long_key = "k".repeat(513);
        assert!(queue
            .enqueue_message(input("hello", Some(&long_key)), 1_000)
            .is_err());
    }

    #[test]
    fn test_enqueue_single_chunk_keeps_key_verbatim() {
        let (queue, store) = queue();
        let result = queue.enqueue_message(input("hello", Some("k")), 1_000).unwrap();
        assert_eq!(result.status, DedupeOutcome::Enqueued);
        assert_eq!(result.queued_count, 1);
        assert_eq!(result.message_ids.len(), 1);

        let due = store.list_due(1_000).unwrap();
        assert_eq!(due[0].dedupe_key.as_deref(), Some("k"));
    }

    #[test]
    fn test_enqueue_splits_with_derived_chunk_keys() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let config = QueueConfig { max_message_len: 12, ..Default::default() };
        let queue = OutboundQueue::new(store.clone(), config);

        let result = queue
            .enqueue_message(input("alpha beta\ngamma delta", Some("k")), 1_000)
            .unwrap();
        assert_eq!(result.queued_count, 2);

        let keys: Vec<_> = store
            .list_due(1_000)
            .unwrap()
            .into_iter()
            .filter_map(|m| m.dedupe_key)
            .collect();
        assert_eq!(keys, vec!["k:1/2", "k:2/2"]);
    }

    #[test]
    fn test_reenqueue_same_key_is_duplicate() {
        let (queue, _) = queue();
        queue.enqueue_message(input("hello", Some("k")), 1_000).unwrap();

        let second = queue.enqueue_message(input("hello", Some("k")), 2_000).unwrap();
        assert_eq!(second.status, DedupeOutcome::Duplicate);
        assert_eq!(second.queued_count, 0);
        assert_eq!(second.duplicate_count, 1);
        assert!(second.message_ids.is_empty());
        assert_eq!(second.dedupe_key.as_deref(), Some("k"));
    }

    #[tokio::test]
    async fn test_drain_delivers_and_marks_sent() {
        let (queue, store) = queue();
        queue.enqueue_message(input("hello", None), 1_000).unwrap();

        let transport = RecordingTransport::ok();
        let processor =
            DeliveryProcessor::new(store.clone(), transport.clone(), QueueConfig::default());

        assert_eq!(processor.drain_due_messages(1_000).await.unwrap(), 1);
        assert_eq!(transport.sent.lock().unwrap().as_slice(), &[(42, "hello".to_string())]);
        assert!(store.list_due(99_000).unwrap().is_empty());
        // Re-drain finds nothing
        assert_eq!(processor.drain_due_messages(2_000).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_drain_failure_schedules_backoff_retry() {
        let (queue, store) = queue();
        queue.enqueue_message(input("hello", None), 1_000).unwrap();

        let config = QueueConfig::default();
        let processor =
            DeliveryProcessor::new(store.clone(), RecordingTransport::failing(), config.clone());

        assert_eq!(processor.drain_due_messages(1_000).await.unwrap(), 0);

        // Still queued, not due until the first backoff delay elapses
        assert!(store.list_due(1_000 + config.base_delay_ms - 1).unwrap().is_empty());
        let due = store.list_due(1_000 + config.base_delay_ms).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].attempt_count, 1);
        assert!(due[0].error_message.as_deref().unwrap().contains("unreachable"));
    }

    #[tokio::test]
    async fn test_drain_fails_terminally_after_max_attempts() {
        let (queue, store) = queue();
        queue.enqueue_message(input("hello", None), 0).unwrap();

        let config = QueueConfig { max_attempts: 2, ..Default::default() };
        let processor =
            DeliveryProcessor::new(store.clone(), RecordingTransport::failing(), config.clone());

        processor.drain_due_messages(0).await.unwrap();
        processor
            .drain_due_messages(backoff_delay_ms(&config, 1))
            .await
            .unwrap();

        // Terminal: never due again, even far in the future
        assert!(store.list_due(i64::MAX).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_error_message_is_truncated() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let config = QueueConfig { max_error_len: 8, ..Default::default() };
        let queue = OutboundQueue::new(store.clone(), config.clone());
        queue.enqueue_message(input("hello", None), 0).unwrap();

        let processor =
            DeliveryProcessor::new(store.clone(), RecordingTransport::failing(), config.clone());
        processor.drain_due_messages(0).await.unwrap();

        let due = store.list_due(backoff_delay_ms(&config, 1)).unwrap();
        assert_eq!(due[0].error_message.as_deref().unwrap().chars().count(), 8);
    }

    #[tokio::test]
    async fn test_drain_processes_chunks_in_order() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let config = QueueConfig { max_message_len: 12, ..Default::default() };
        let queue = OutboundQueue::new(store.clone(), config.clone());
        queue
            .enqueue_message(input("alpha beta\ngamma delta", Some("k")), 1_000)
            .unwrap();

        let transport = RecordingTransport::ok();
        let processor = DeliveryProcessor::new(store, transport.clone(), config);
        assert_eq!(processor.drain_due_messages(1_000).await.unwrap(), 2);

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent[0].1, "alpha beta");
        assert_eq!(sent[1].1, "gamma delta");
    }
}
