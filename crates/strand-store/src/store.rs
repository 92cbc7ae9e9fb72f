use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use futures::future::BoxFuture;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use tracing::debug;

use strand_core::error::{Result, StrandError};
use strand_core::graph::{Graph, WorkflowDefinition, WorkflowTemplate};
use strand_core::traits::{Persistence, Retriever};
use strand_core::types::{DocumentChunk, DocumentScope, MessageId, UsageTotals};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS definitions (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    graph TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS templates (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    body TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    total_tokens INTEGER NOT NULL DEFAULT 0,
    total_cost REAL NOT NULL DEFAULT 0,
    message_count INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    input_tokens INTEGER NOT NULL,
    output_tokens INTEGER NOT NULL,
    cost REAL NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation
    ON messages(conversation_id, created_at);

CREATE TABLE IF NOT EXISTS documents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    document_id TEXT NOT NULL,
    collection TEXT NOT NULL,
    chunk_index INTEGER NOT NULL,
    content TEXT NOT NULL,
    metadata TEXT
);

CREATE INDEX IF NOT EXISTS idx_documents_scope ON documents(collection, document_id);

CREATE VIRTUAL TABLE IF NOT EXISTS documents_fts USING fts5(
    content,
    content='documents',
    content_rowid='id',
    tokenize='porter unicode61'
);

CREATE TRIGGER IF NOT EXISTS documents_ai AFTER INSERT ON documents BEGIN
    INSERT INTO documents_fts(rowid, content) VALUES (new.id, new.content);
END;
";

fn db_err(e: rusqlite::Error) -> StrandError {
    StrandError::Database(e.to_string())
}

/// Aggregates kept per conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationTotals {
    pub total_tokens: u64,
    pub total_cost: f64,
    pub message_count: u64,
}

/// SQLite-backed workflow store with an FTS5 document index.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StrandError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| StrandError::Database(e.to_string()))
    }

    pub fn put_definition(&self, def: &WorkflowDefinition) -> Result<()> {
        let graph = serde_json::to_string(&def.graph)?;
        self.lock()?
            .execute(
                "INSERT INTO definitions (id, name, graph, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name, graph = excluded.graph,
                     updated_at = excluded.updated_at",
                params![def.id, def.name, graph, Utc::now().to_rfc3339()],
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub fn put_template(&self, template: &WorkflowTemplate) -> Result<()> {
        let body = serde_json::to_string(template)?;
        self.lock()?
            .execute(
                "INSERT INTO templates (id, name, body, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name, body = excluded.body,
                     updated_at = excluded.updated_at",
                params![template.id, template.name, body, Utc::now().to_rfc3339()],
            )
            .map_err(db_err)?;
        Ok(())
    }

    /// Index a document. Content is split into paragraph chunks.
    pub fn add_document(
        &self,
        document_id: &str,
        collection: &str,
        content: &str,
        metadata: Option<&serde_json::Value>,
    ) -> Result<usize> {
        let metadata = metadata.map(|m| m.to_string());
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;
        let mut count = 0;
        for (i, chunk) in content
            .split("\n\n")
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .enumerate()
        {
            tx.execute(
                "INSERT INTO documents (document_id, collection, chunk_index, content, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![document_id, collection, i as i64, chunk, metadata],
            )
            .map_err(db_err)?;
            count += 1;
        }
        tx.commit().map_err(db_err)?;
        debug!(document_id, collection, chunks = count, "Indexed document");
        Ok(count)
    }

    pub fn conversation_totals(&self, conversation_id: &str) -> Result<Option<ConversationTotals>> {
        self.lock()?
            .query_row(
                "SELECT total_tokens, total_cost, message_count FROM conversations WHERE id = ?1",
                params![conversation_id],
                |row| {
                    Ok(ConversationTotals {
                        total_tokens: row.get::<_, i64>(0)? as u64,
                        total_cost: row.get(1)?,
                        message_count: row.get::<_, i64>(2)? as u64,
                    })
                },
            )
            .optional()
            .map_err(db_err)
    }

    /// Stored message contents for a conversation, oldest first.
    pub fn messages(&self, conversation_id: &str) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT content FROM messages WHERE conversation_id = ?1
                 ORDER BY created_at ASC, rowid ASC",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![conversation_id], |row| row.get::<_, String>(0))
            .map_err(db_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(db_err)
    }

    fn search_chunks(
        &self,
        query: &str,
        scope: &DocumentScope,
        limit: usize,
    ) -> Result<Vec<DocumentChunk>> {
        let Some(fts_query) = fts_query(query) else {
            return Ok(Vec::new());
        };

        let mut sql = String::from(
            "SELECT d.document_id, d.content, d.metadata, documents_fts.rank
             FROM documents_fts JOIN documents d ON d.id = documents_fts.rowid
             WHERE documents_fts MATCH ?",
        );
        let mut args: Vec<String> = vec![fts_query];
        if let Some(collection) = &scope.collection {
            sql.push_str(" AND d.collection = ?");
            args.push(collection.clone());
        }
        if !scope.document_ids.is_empty() {
            let marks = vec!["?"; scope.document_ids.len()].join(", ");
            sql.push_str(&format!(" AND d.document_id IN ({})", marks));
            args.extend(scope.document_ids.iter().cloned());
        }
        sql.push_str(&format!(" ORDER BY documents_fts.rank LIMIT {}", limit.max(1)));

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), |row| {
                let metadata: Option<String> = row.get(2)?;
                let rank: f64 = row.get(3)?;
                Ok(DocumentChunk {
                    document_id: row.get(0)?,
                    content: row.get(1)?,
                    // FTS5 rank is bm25, lower is better
                    score: -rank,
                    metadata: metadata
                        .and_then(|m| serde_json::from_str(&m).ok())
                        .unwrap_or(serde_json::Value::Null),
                })
            })
            .map_err(db_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(db_err)
    }
}

/// Build an FTS5 OR-query of quoted terms. `None` when the text has no terms.
fn fts_query(text: &str) -> Option<String> {
    let terms: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() > 1)
        .map(|t| format!("\"{}\"", t.to_lowercase()))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

impl Persistence for SqliteStore {
    fn load_definition(&self, id: &str) -> BoxFuture<'_, Result<Option<WorkflowDefinition>>> {
        let id = id.to_string();
        Box::pin(async move {
            let row: Option<(String, String)> = self
                .lock()?
                .query_row(
                    "SELECT name, graph FROM definitions WHERE id = ?1",
                    params![id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(db_err)?;

            match row {
                Some((name, graph)) => {
                    let graph: Graph = serde_json::from_str(&graph)?;
                    Ok(Some(WorkflowDefinition { id, name, graph }))
                }
                None => Ok(None),
            }
        })
    }

    fn load_template(&self, id: &str) -> BoxFuture<'_, Result<Option<WorkflowTemplate>>> {
        let id = id.to_string();
        Box::pin(async move {
            let body: Option<String> = self
                .lock()?
                .query_row(
                    "SELECT body FROM templates WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;
            match body {
                Some(body) => Ok(Some(serde_json::from_str(&body)?)),
                None => Ok(None),
            }
        })
    }

    fn save_message(
        &self,
        conversation_id: &str,
        content: &str,
        usage: &UsageTotals,
    ) -> BoxFuture<'_, Result<MessageId>> {
        let conversation_id = conversation_id.to_string();
        let content = content.to_string();
        let usage = usage.clone();
        Box::pin(async move {
            let id = uuid::Uuid::new_v4().to_string();
            let now = Utc::now().to_rfc3339();
            let conn = self.lock()?;
            conn.execute(
                "INSERT OR IGNORE INTO conversations (id, updated_at) VALUES (?1, ?2)",
                params![conversation_id, now],
            )
            .map_err(db_err)?;
            conn.execute(
                "INSERT INTO messages
                 (id, conversation_id, role, content, input_tokens, output_tokens, cost, created_at)
                 VALUES (?1, ?2, 'assistant', ?3, ?4, ?5, ?6, ?7)",
                params![
                    id,
                    conversation_id,
                    content,
                    usage.input_tokens as i64,
                    usage.output_tokens as i64,
                    usage.cost,
                    now
                ],
            )
            .map_err(db_err)?;
            debug!(conversation_id = %conversation_id, message_id = %id, "Saved message");
            Ok(MessageId(id))
        })
    }

    fn update_conversation_aggregates(
        &self,
        conversation_id: &str,
        token_delta: u64,
        cost_delta: f64,
    ) -> BoxFuture<'_, Result<()>> {
        let conversation_id = conversation_id.to_string();
        Box::pin(async move {
            self.lock()?
                .execute(
                    "INSERT INTO conversations (id, total_tokens, total_cost, message_count, updated_at)
                     VALUES (?1, ?2, ?3, 1, ?4)
                     ON CONFLICT(id) DO UPDATE SET
                         total_tokens = total_tokens + excluded.total_tokens,
                         total_cost = total_cost + excluded.total_cost,
                         message_count = message_count + 1,
                         updated_at = excluded.updated_at",
                    params![
                        conversation_id,
                        token_delta as i64,
                        cost_delta,
                        Utc::now().to_rfc3339()
                    ],
                )
                .map_err(db_err)?;
            Ok(())
        })
    }
}

impl Retriever for SqliteStore {
    fn retrieve(
        &self,
        query: &str,
        scope: &DocumentScope,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<DocumentChunk>>> {
        let query = query.to_string();
        let scope = scope.clone();
        Box::pin(async move { self.search_chunks(&query, &scope, limit) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_core::graph::{Edge, Node, NodeType};

    fn graph() -> Graph {
        Graph::new(
            vec![
                Node::start("start"),
                Node::new("answer", NodeType::Model, serde_json::json!({})),
            ],
            vec![Edge::always("start", "answer")],
        )
    }

    #[tokio::test]
    async fn definitions_round_trip_through_sqlite() {
        let store = SqliteStore::in_memory().unwrap();
        let def = WorkflowDefinition {
            id: "qa".into(),
            name: "Q&A".into(),
            graph: graph(),
        };
        store.put_definition(&def).unwrap();
        assert_eq!(store.load_definition("qa").await.unwrap(), Some(def));
        assert_eq!(store.load_definition("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn templates_round_trip_through_sqlite() {
        let store = SqliteStore::in_memory().unwrap();
        let mut template = WorkflowTemplate {
            id: "toned".into(),
            name: "Toned".into(),
            graph: graph(),
            defaults: serde_json::Map::new(),
            required: vec!["tone".into()],
        };
        store.put_template(&template).unwrap();
        template.name = "Toned answer".into();
        store.put_template(&template).unwrap();
        assert_eq!(store.load_template("toned").await.unwrap(), Some(template));
    }

    #[tokio::test]
    async fn aggregates_accumulate() {
        let store = SqliteStore::in_memory().unwrap();
        let mut usage = UsageTotals::default();
        usage.input_tokens = 10;
        usage.output_tokens = 5;
        usage.cost = 0.5;

        store.save_message("c1", "hello", &usage).await.unwrap();
        store.update_conversation_aggregates("c1", 15, 0.5).await.unwrap();
        store.save_message("c1", "again", &usage).await.unwrap();
        store.update_conversation_aggregates("c1", 15, 0.5).await.unwrap();

        let totals = store.conversation_totals("c1").unwrap().unwrap();
        assert_eq!(totals.total_tokens, 30);
        assert_eq!(totals.message_count, 2);
        assert!((totals.total_cost - 1.0).abs() < 1e-9);
        assert_eq!(store.messages("c1").unwrap(), vec!["hello", "again"]);
    }

    #[tokio::test]
    async fn retrieval_respects_scope() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .add_document("rust-book", "docs", "Ownership rules in Rust.\n\nBorrowing is checked.", None)
            .unwrap();
        store
            .add_document("notes", "private", "Rust ownership notes.", None)
            .unwrap();

        let all = store
            .retrieve("ownership", &DocumentScope::default(), 10)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let docs = store
            .retrieve("ownership", &DocumentScope::collection("docs"), 10)
            .await
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].document_id, "rust-book");
    }

    #[tokio::test]
    async fn retrieval_with_no_documents_is_empty() {
        let store = SqliteStore::in_memory().unwrap();
        let hits = store
            .retrieve("anything", &DocumentScope::default(), 5)
            .await
            .unwrap();
        assert!(hits.is_empty());
        assert!(store.retrieve("?!", &DocumentScope::default(), 5).await.unwrap().is_empty());
    }

    #[test]
    fn open_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("strand.db");
        SqliteStore::open(&path).unwrap();
        assert!(path.exists());
    }
}
