//! SQLite message store.
//!
//! Uses a single SQLite database file with two tables:
//! - `messages` — the append-only log, keyed by `(conversation_id, sequence)`
//! - `checkpoints` — `(conversation_id, sequence, control_state)` snapshots
//!
//! Partial unique indexes enforce at most one `tool_call` and one
//! `tool_result` per `call_id`. The journal runs in WAL mode with
//! `synchronous = FULL`, so a committed append survives power loss.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ratchet_core::error::StoreError;
use ratchet_core::message::{ConversationId, EncodedBody, Message, MessageBody, Role};
use ratchet_core::state::ControlState;
use ratchet_core::store::{Checkpoint, CheckpointId, ConversationSummary, MessageStore};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// A durable SQLite-backed message store.
pub struct SqliteStore {
    pool: SqlitePool,
    /// Serializes sequence assignment and checkpoint validation
    write_lock: Mutex<()>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    ///
    /// Pass `":memory:"` for an ephemeral database (useful for tests).
    pub async fn new(path: &str) -> Result<Self, StoreError> {
        let options = if path == ":memory:" {
            SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| StoreError::Unavailable(format!("Invalid SQLite path: {e}")))?
        } else {
            let file = Path::new(path);
            if let Some(parent) = file.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    StoreError::Unavailable(format!("Cannot create {}: {e}", parent.display()))
                })?;
            }
            SqliteConnectOptions::new().filename(file)
        };

        let options = options
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .pragma("foreign_keys", "ON");

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to open SQLite: {e}")))?;

        let store = Self::from_pool(pool).await?;
        info!("SQLite message store initialized at {path}");
        Ok(store)
    }

    /// Create from an existing pool (useful for testing).
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let store = Self {
            pool,
            write_lock: Mutex::new(()),
        };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Close the pool, flushing the WAL.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Run schema migrations — creates tables and indexes.
    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                conversation_id TEXT    NOT NULL,
                sequence        INTEGER NOT NULL,
                role            TEXT    NOT NULL,
                content         TEXT    NOT NULL,
                tool_name       TEXT,
                call_id         TEXT,
                created_at      TEXT    NOT NULL,
                PRIMARY KEY (conversation_id, sequence)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("messages table: {e}")))?;

        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_tool_call
            ON messages(conversation_id, call_id) WHERE role = 'tool_call'
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("tool_call index: {e}")))?;

        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_tool_result
            ON messages(conversation_id, call_id) WHERE role = 'tool_result'
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("tool_result index: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                conversation_id TEXT    NOT NULL,
                sequence        INTEGER NOT NULL,
                control_state   TEXT    NOT NULL,
                created_at      TEXT    NOT NULL,
                PRIMARY KEY (conversation_id, sequence)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("checkpoints table: {e}")))?;

        debug!("SQLite migrations complete");
        Ok(())
    }

    /// Parse a `Message` from a SQLite row.
    fn row_to_message(row: &SqliteRow) -> Result<Message, StoreError> {
        let sequence: i64 = row
            .try_get("sequence")
            .map_err(|e| StoreError::Corrupt(format!("sequence column: {e}")))?;
        let role: String = row
            .try_get("role")
            .map_err(|e| StoreError::Corrupt(format!("role column: {e}")))?;
        let content: String = row
            .try_get("content")
            .map_err(|e| StoreError::Corrupt(format!("content column: {e}")))?;
        let tool_name: Option<String> = row
            .try_get("tool_name")
            .map_err(|e| StoreError::Corrupt(format!("tool_name column: {e}")))?;
        let call_id: Option<String> = row
            .try_get("call_id")
            .map_err(|e| StoreError::Corrupt(format!("call_id column: {e}")))?;

        let role = Role::from_str(&role).map_err(StoreError::Corrupt)?;
        let body = MessageBody::decode(EncodedBody {
            role,
            content,
            tool_name,
            call_id,
        })
        .map_err(|e| StoreError::Corrupt(format!("message {sequence}: {e}")))?;

        Ok(Message::new(sequence as u64, body))
    }

    async fn messages_through(
        &self,
        conversation_id: &ConversationId,
        sequence: u64,
    ) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT sequence, role, content, tool_name, call_id FROM messages
            WHERE conversation_id = ?1 AND sequence <= ?2
            ORDER BY sequence
            "#,
        )
        .bind(conversation_id.as_str())
        .bind(sequence as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Unavailable(format!("SELECT messages failed: {e}")))?;

        rows.iter().map(Self::row_to_message).collect()
    }

    /// Load the checkpoint selected by `sql` (which must bind the
    /// conversation id as `?1` and may bind a sequence bound as `?2`).
    async fn load_checkpoint(
        &self,
        conversation_id: &ConversationId,
        sql: &str,
        bound: Option<u64>,
    ) -> Result<Option<Checkpoint>, StoreError> {
        let mut query = sqlx::query(sql).bind(conversation_id.as_str());
        if let Some(bound) = bound {
            query = query.bind(bound as i64);
        }
        let row = query
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(format!("SELECT checkpoint failed: {e}")))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let sequence: i64 = row
            .try_get("sequence")
            .map_err(|e| StoreError::Corrupt(format!("checkpoint sequence: {e}")))?;
        let state: String = row
            .try_get("control_state")
            .map_err(|e| StoreError::Corrupt(format!("control_state column: {e}")))?;
        let created_at: String = row
            .try_get("created_at")
            .map_err(|e| StoreError::Corrupt(format!("created_at column: {e}")))?;

        let state = ControlState::from_str(&state).map_err(StoreError::Corrupt)?;
        let created_at = DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| StoreError::Corrupt(format!("checkpoint timestamp: {e}")))?;

        let sequence = sequence as u64;
        let messages = self.messages_through(conversation_id, sequence).await?;
        Ok(Some(Checkpoint {
            conversation_id: conversation_id.clone(),
            sequence,
            state,
            messages,
            created_at,
        }))
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn append(
        &self,
        conversation_id: &ConversationId,
        body: MessageBody,
    ) -> Result<u64, StoreError> {
        let encoded = body
            .encode()
            .map_err(|e| StoreError::Corrupt(format!("Message encoding: {e}")))?;

        let _guard = self.write_lock.lock().await;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Unavailable(format!("BEGIN failed: {e}")))?;

        if encoded.role == Role::ToolResult {
            let call_exists = sqlx::query(
                r#"
                SELECT 1 FROM messages
                WHERE conversation_id = ?1 AND call_id = ?2 AND role = 'tool_call'
                "#,
            )
            .bind(conversation_id.as_str())
            .bind(encoded.call_id.as_deref())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::Unavailable(format!("call lookup failed: {e}")))?
            .is_some();

            if !call_exists {
                return Err(StoreError::UnknownCall {
                    conversation_id: conversation_id.to_string(),
                    call_id: encoded.call_id.unwrap_or_default(),
                });
            }
        }

        let next: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(sequence), 0) + 1 FROM messages WHERE conversation_id = ?1",
        )
        .bind(conversation_id.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| StoreError::Unavailable(format!("sequence lookup failed: {e}")))?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO messages (conversation_id, sequence, role, content, tool_name, call_id, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(conversation_id.as_str())
        .bind(next)
        .bind(encoded.role.as_str())
        .bind(&encoded.content)
        .bind(encoded.tool_name.as_deref())
        .bind(encoded.call_id.as_deref())
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await;

        if let Err(e) = inserted {
            let duplicate = matches!(&e, sqlx::Error::Database(db) if db.is_unique_violation());
            return Err(match (duplicate, encoded.call_id) {
                (true, Some(call_id)) => StoreError::Conflict {
                    conversation_id: conversation_id.to_string(),
                    call_id,
                },
                _ => StoreError::Unavailable(format!("INSERT failed: {e}")),
            });
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Unavailable(format!("COMMIT failed: {e}")))?;

        debug!(conversation_id = %conversation_id, sequence = next, role = %encoded.role, "Appended message");
        Ok(next as u64)
    }

    async fn read_range(
        &self,
        conversation_id: &ConversationId,
        from_sequence: u64,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT sequence, role, content, tool_name, call_id FROM messages
            WHERE conversation_id = ?1 AND sequence >= ?2
            ORDER BY sequence
            LIMIT ?3
            "#,
        )
        .bind(conversation_id.as_str())
        .bind(from_sequence as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Unavailable(format!("SELECT messages failed: {e}")))?;

        rows.iter().map(Self::row_to_message).collect()
    }

    async fn last_sequence(&self, conversation_id: &ConversationId) -> Result<u64, StoreError> {
        let last: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(sequence), 0) FROM messages WHERE conversation_id = ?1",
        )
        .bind(conversation_id.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Unavailable(format!("MAX(sequence) failed: {e}")))?;
        Ok(last as u64)
    }

    async fn checkpoint(
        &self,
        conversation_id: &ConversationId,
        sequence: u64,
        state: ControlState,
    ) -> Result<CheckpointId, StoreError> {
        let _guard = self.write_lock.lock().await;

        let stale = |reason: String| StoreError::StaleCheckpoint {
            conversation_id: conversation_id.to_string(),
            sequence,
            reason,
        };

        let last = self.last_sequence(conversation_id).await?;
        if sequence == 0 || sequence > last {
            return Err(stale(format!("log ends at sequence {last}")));
        }

        let latest: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(sequence) FROM checkpoints WHERE conversation_id = ?1",
        )
        .bind(conversation_id.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Unavailable(format!("checkpoint lookup failed: {e}")))?;

        if let Some(latest) = latest
            && sequence <= latest as u64
        {
            return Err(stale(format!("latest checkpoint is at {latest}")));
        }

        sqlx::query(
            r#"
            INSERT INTO checkpoints (conversation_id, sequence, control_state, created_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(conversation_id.as_str())
        .bind(sequence as i64)
        .bind(state.as_str())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Unavailable(format!("INSERT checkpoint failed: {e}")))?;

        debug!(conversation_id = %conversation_id, sequence, state = %state, "Checkpoint written");
        Ok(CheckpointId {
            conversation_id: conversation_id.clone(),
            sequence,
        })
    }

    async fn latest_checkpoint(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<Checkpoint>, StoreError> {
        self.load_checkpoint(
            conversation_id,
            r#"
            SELECT sequence, control_state, created_at FROM checkpoints
            WHERE conversation_id = ?1
            ORDER BY sequence DESC LIMIT 1
            "#,
            None,
        )
        .await
    }

    async fn checkpoint_at_or_before(
        &self,
        conversation_id: &ConversationId,
        sequence: u64,
    ) -> Result<Option<Checkpoint>, StoreError> {
        self.load_checkpoint(
            conversation_id,
            r#"
            SELECT sequence, control_state, created_at FROM checkpoints
            WHERE conversation_id = ?1 AND sequence <= ?2
            ORDER BY sequence DESC LIMIT 1
            "#,
            Some(sequence),
        )
        .await
    }

    async fn prune_checkpoints(
        &self,
        conversation_id: &ConversationId,
        keep: usize,
    ) -> Result<usize, StoreError> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(
            r#"
            DELETE FROM checkpoints
            WHERE conversation_id = ?1 AND sequence NOT IN (
                SELECT sequence FROM checkpoints
                WHERE conversation_id = ?1
                ORDER BY sequence DESC LIMIT ?2
            )
            "#,
        )
        .bind(conversation_id.as_str())
        .bind(keep.max(1) as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Unavailable(format!("DELETE checkpoints failed: {e}")))?;

        Ok(result.rows_affected() as usize)
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT m.conversation_id AS conversation_id,
                   COUNT(*) AS message_count,
                   MAX(m.sequence) AS last_sequence,
                   (SELECT c.control_state FROM checkpoints c
                    WHERE c.conversation_id = m.conversation_id
                    ORDER BY c.sequence DESC LIMIT 1) AS checkpoint_state
            FROM messages m
            GROUP BY m.conversation_id
            ORDER BY m.conversation_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Unavailable(format!("SELECT conversations failed: {e}")))?;

        rows.iter()
            .map(|row| {
                let id: String = row
                    .try_get("conversation_id")
                    .map_err(|e| StoreError::Corrupt(format!("conversation_id column: {e}")))?;
                let count: i64 = row
                    .try_get("message_count")
                    .map_err(|e| StoreError::Corrupt(format!("message_count column: {e}")))?;
                let last: i64 = row
                    .try_get("last_sequence")
                    .map_err(|e| StoreError::Corrupt(format!("last_sequence column: {e}")))?;
                let state: Option<String> = row
                    .try_get("checkpoint_state")
                    .map_err(|e| StoreError::Corrupt(format!("checkpoint_state column: {e}")))?;
                let checkpoint_state = state
                    .map(|s| ControlState::from_str(&s).map_err(StoreError::Corrupt))
                    .transpose()?;
                Ok(ConversationSummary {
                    conversation_id: ConversationId::from(id),
                    message_count: count as u64,
                    last_sequence: last as u64,
                    checkpoint_state,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ratchet_core::error::ToolFailureKind;
    use ratchet_core::tool::{ToolCallRequest, ToolOutput, ToolResult};

    async fn test_store() -> SqliteStore {
        SqliteStore::new(":memory:").await.unwrap()
    }

    fn call(id: &str) -> ToolCallRequest {
        ToolCallRequest::new(id, "list_dir", serde_json::json!({"path": "/tmp"}))
    }

    #[tokio::test]
    async fn append_and_read_back() {
        let store = test_store().await;
        let id = ConversationId::from("c1");
        let c = call("call_1");
        assert_eq!(store.append(&id, MessageBody::user("list files in /tmp")).await.unwrap(), 1);
        assert_eq!(store.append(&id, MessageBody::tool_call(&c)).await.unwrap(), 2);
        let result = ToolResult::success(
            &c,
            ToolOutput::text(r#"["a.txt","b.txt"]"#)
                .with_data(serde_json::json!(["a.txt", "b.txt"])),
        );
        assert_eq!(store.append(&id, MessageBody::tool_result(result.clone())).await.unwrap(), 3);

        let messages = store.read_all(&id).await.unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].text(), Some("list files in /tmp"));
        assert_eq!(messages[1].call_id(), Some("call_1"));
        assert_eq!(messages[2].body, MessageBody::tool_result(result));
    }

    #[tokio::test]
    async fn duplicate_result_rejected() {
        let store = test_store().await;
        let id = ConversationId::from("c1");
        let c = call("call_1");
        store.append(&id, MessageBody::tool_call(&c)).await.unwrap();
        store
            .append(
                &id,
                MessageBody::tool_result(ToolResult::success(&c, ToolOutput::text("first"))),
            )
            .await
            .unwrap();

        let err = store
            .append(
                &id,
                MessageBody::tool_result(ToolResult::failure(
                    &c,
                    ToolFailureKind::Timeout,
                    "second",
                )),
            )
            .await
            .unwrap_err();
        assert!(err.is_conflict(), "got {err:?}");

        let messages = store.read_all(&id).await.unwrap();
        assert_eq!(messages.len(), 2);
        match &messages[1].body {
            MessageBody::ToolResult { outcome, .. } => {
                assert!(serde_json::to_string(outcome).unwrap().contains("first"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_call_rejected() {
        let store = test_store().await;
        let id = ConversationId::from("c1");
        let err = store
            .append(
                &id,
                MessageBody::tool_result(ToolResult::success(&call("nope"), ToolOutput::text("x"))),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownCall { .. }));
    }

    #[tokio::test]
    async fn same_call_id_in_different_conversations() {
        let store = test_store().await;
        let c = call("call_1");
        store
            .append(&ConversationId::from("a"), MessageBody::tool_call(&c))
            .await
            .unwrap();
        store
            .append(&ConversationId::from("b"), MessageBody::tool_call(&c))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn checkpoint_rules() {
        let store = test_store().await;
        let id = ConversationId::from("c1");
        assert!(store.latest_checkpoint(&id).await.unwrap().is_none());

        store.append(&id, MessageBody::user("hi")).await.unwrap();
        assert!(matches!(
            store.checkpoint(&id, 2, ControlState::AwaitingModelResponse).await,
            Err(StoreError::StaleCheckpoint { .. })
        ));
        let cp = store
            .checkpoint(&id, 1, ControlState::AwaitingModelResponse)
            .await
            .unwrap();
        assert_eq!(cp.sequence, 1);
        assert!(matches!(
            store.checkpoint(&id, 1, ControlState::AwaitingModelResponse).await,
            Err(StoreError::StaleCheckpoint { .. })
        ));

        store.append(&id, MessageBody::assistant("hello")).await.unwrap();
        store
            .checkpoint(&id, 2, ControlState::AwaitingUserInput)
            .await
            .unwrap();

        let latest = store.latest_checkpoint(&id).await.unwrap().unwrap();
        assert_eq!(latest.sequence, 2);
        assert_eq!(latest.state, ControlState::AwaitingUserInput);
        assert_eq!(latest.messages.len(), 2);
        assert_eq!(ControlState::derive(&latest.messages), latest.state);

        let first = store.checkpoint_at_or_before(&id, 1).await.unwrap().unwrap();
        assert_eq!(first.messages.len(), 1);
        assert_eq!(first.state, ControlState::AwaitingModelResponse);
    }

    #[tokio::test]
    async fn prune_checkpoints_keeps_most_recent() {
        let store = test_store().await;
        let id = ConversationId::from("c1");
        for i in 1..=5u64 {
            store.append(&id, MessageBody::user(format!("m{i}"))).await.unwrap();
            store
                .checkpoint(&id, i, ControlState::AwaitingModelResponse)
                .await
                .unwrap();
        }
        assert_eq!(store.prune_checkpoints(&id, 2).await.unwrap(), 3);
        assert!(store.checkpoint_at_or_before(&id, 3).await.unwrap().is_none());
        assert_eq!(
            store.checkpoint_at_or_before(&id, 4).await.unwrap().unwrap().sequence,
            4
        );
        assert_eq!(store.prune_checkpoints(&id, 0).await.unwrap(), 1);
        assert_eq!(store.latest_checkpoint(&id).await.unwrap().unwrap().sequence, 5);
    }

    #[tokio::test]
    async fn list_conversations_reports_state() {
        let store = test_store().await;
        let a = ConversationId::from("a");
        store.append(&a, MessageBody::user("x")).await.unwrap();
        store
            .checkpoint(&a, 1, ControlState::AwaitingModelResponse)
            .await
            .unwrap();
        store
            .append(&ConversationId::from("b"), MessageBody::user("y"))
            .await
            .unwrap();

        let list = store.list_conversations().await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].checkpoint_state, Some(ControlState::AwaitingModelResponse));
        assert_eq!(list[1].conversation_id.as_str(), "b");
        assert!(list[1].checkpoint_state.is_none());
    }

    #[tokio::test]
    async fn reopen_preserves_log_and_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("conversations.db");
        let path = path.to_str().unwrap();
        let id = ConversationId::from("c1");

        {
            let store = SqliteStore::new(path).await.unwrap();
            store.append(&id, MessageBody::user("hi")).await.unwrap();
            store
                .append(&id, MessageBody::tool_call(&call("call_1")))
                .await
                .unwrap();
            store
                .checkpoint(&id, 2, ControlState::DispatchingTools)
                .await
                .unwrap();
            store.close().await;
        }

        let store = SqliteStore::new(path).await.unwrap();
        let latest = store.latest_checkpoint(&id).await.unwrap().unwrap();
        assert_eq!(latest.state, ControlState::DispatchingTools);
        assert_eq!(latest.messages.len(), 2);
        assert_eq!(store.append(&id, MessageBody::user("more")).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn backend_name() {
        let store = test_store().await;
        assert_eq!(store.name(), "sqlite");
    }
}
