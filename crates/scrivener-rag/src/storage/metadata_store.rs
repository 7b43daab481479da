//! Relational metadata store: documents, programs, conversations,
//! messages, outputs, and the audit sink.
//!
//! SQLite via sqlx with WAL journaling. Writes use short transactions
//! scoped to one document. Program linkage is by program *name* with
//! RESTRICT semantics on delete.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{RagError, Result};
use crate::types::{
    AuditEvent, Conversation, ConversationContext, DocType, DocumentFilters, DocumentRecord,
    DocumentUpdate, Message, MessageRole, Outcome, OutputRecord, Program,
};

#[async_trait]
pub trait MetadataStore: Send + Sync {
    // Documents
    async fn insert_document(&self, doc: &DocumentRecord) -> Result<()>;
    async fn get_document(&self, doc_id: Uuid) -> Result<Option<DocumentRecord>>;
    async fn list_documents(&self, filters: &DocumentFilters, limit: usize) -> Result<Vec<DocumentRecord>>;
    async fn update_document(&self, doc_id: Uuid, update: &DocumentUpdate) -> Result<DocumentRecord>;
    async fn delete_document(&self, doc_id: Uuid) -> Result<bool>;

    // Programs
    async fn list_programs(&self, active_only: bool) -> Result<Vec<Program>>;
    async fn create_program(&self, name: &str, description: Option<&str>, display_order: i64) -> Result<Program>;
    async fn set_program_active(&self, program_id: i64, active: bool) -> Result<Program>;
    async fn delete_program(&self, program_id: i64, force: bool) -> Result<()>;
    async fn program_document_count(&self, name: &str) -> Result<usize>;
    /// Map requested program names onto canonical stored case, rejecting
    /// unknown or inactive names with the structured validation error.
    async fn resolve_program_names(&self, requested: &[String]) -> Result<Vec<String>>;

    // Conversations
    async fn create_conversation(&self, title: &str, created_by: &str, context: &ConversationContext) -> Result<Conversation>;
    async fn get_conversation(&self, conversation_id: Uuid) -> Result<Option<Conversation>>;
    async fn update_conversation_context(&self, conversation_id: Uuid, context: &ConversationContext) -> Result<()>;
    async fn touch_conversation(&self, conversation_id: Uuid) -> Result<()>;
    async fn append_message(&self, message: &Message) -> Result<()>;
    async fn list_messages(&self, conversation_id: Uuid, limit: usize) -> Result<Vec<Message>>;

    // Outputs
    async fn insert_output(&self, output: &OutputRecord) -> Result<()>;
    async fn list_outputs(&self, created_by: Option<&str>, limit: usize) -> Result<Vec<OutputRecord>>;

    // Audit sink
    async fn record_audit(&self, event: &AuditEvent) -> Result<()>;

    async fn health(&self) -> Result<()>;
}

pub struct SqliteMetadataStore {
    pool: SqlitePool,
}

impl SqliteMetadataStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| RagError::dependency("metadata_store", e.to_string()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| RagError::dependency("metadata_store", e.to_string()))?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Ensure the embedded schema. Schema ownership lives outside the
    /// core; this creates the tables the core requires when absent.
    pub async fn migrate(&self) -> Result<()> {
        let statements = [
            r#"CREATE TABLE IF NOT EXISTS documents (
                doc_id TEXT PRIMARY KEY,
                filename TEXT NOT NULL,
                doc_type TEXT NOT NULL,
                year INTEGER CHECK (year IS NULL OR (year >= 2000 AND year <= 2100)),
                tags_json TEXT NOT NULL DEFAULT '[]',
                outcome TEXT CHECK (outcome IS NULL OR outcome IN
                    ('Funded', 'Not Funded', 'Pending', 'Final Report')),
                notes TEXT,
                is_sensitive INTEGER NOT NULL DEFAULT 0,
                sensitivity_confirmed_at TEXT NOT NULL,
                created_by TEXT NOT NULL,
                chunk_count INTEGER NOT NULL DEFAULT 0,
                word_count INTEGER NOT NULL DEFAULT 0,
                file_size INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS programs (
                program_id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE COLLATE NOCASE,
                description TEXT,
                active INTEGER NOT NULL DEFAULT 1,
                display_order INTEGER NOT NULL DEFAULT 0
            )"#,
            r#"CREATE TABLE IF NOT EXISTS document_programs (
                doc_id TEXT NOT NULL REFERENCES documents(doc_id) ON DELETE CASCADE,
                program_name TEXT NOT NULL REFERENCES programs(name) ON DELETE RESTRICT,
                PRIMARY KEY (doc_id, program_name)
            )"#,
            r#"CREATE TABLE IF NOT EXISTS conversations (
                conversation_id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                created_by TEXT NOT NULL,
                context_json TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS messages (
                message_id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL REFERENCES conversations(conversation_id)
                    ON DELETE CASCADE,
                role TEXT NOT NULL CHECK (role IN ('user', 'assistant')),
                content TEXT NOT NULL,
                citations_json TEXT NOT NULL DEFAULT '[]',
                source_chunk_ids_json TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS outputs (
                output_id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                content TEXT NOT NULL,
                funder TEXT,
                amount_requested REAL,
                submitted_at TEXT,
                outcome TEXT,
                created_by TEXT NOT NULL,
                conversation_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                action TEXT NOT NULL,
                principal TEXT NOT NULL,
                resource TEXT NOT NULL,
                detail_json TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            )"#,
            "CREATE INDEX IF NOT EXISTS idx_documents_year ON documents(year)",
            "CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id)",
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    fn row_to_program(row: &sqlx::sqlite::SqliteRow) -> Program {
        Program {
            program_id: row.get("program_id"),
            name: row.get("name"),
            description: row.get("description"),
            active: row.get::<i64, _>("active") != 0,
            display_order: row.get("display_order"),
        }
    }

    async fn document_programs(&self, doc_id: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT program_name FROM document_programs WHERE doc_id = ? ORDER BY program_name",
        )
        .bind(doc_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get("program_name")).collect())
    }

    async fn row_to_document(&self, row: &sqlx::sqlite::SqliteRow) -> Result<DocumentRecord> {
        let doc_id_str: String = row.get("doc_id");
        let doc_type_str: String = row.get("doc_type");
        let outcome_str: Option<String> = row.get("outcome");
        let tags_json: String = row.get("tags_json");

        let doc_id = Uuid::parse_str(&doc_id_str)
            .map_err(|e| RagError::internal(format!("bad doc_id in store: {}", e)))?;
        let programs = self.document_programs(&doc_id_str).await?;

        Ok(DocumentRecord {
            doc_id,
            filename: row.get("filename"),
            doc_type: DocType::parse(&doc_type_str).unwrap_or(DocType::Other),
            year: row.get("year"),
            programs,
            tags: serde_json::from_str(&tags_json).unwrap_or_default(),
            outcome: outcome_str.as_deref().and_then(Outcome::normalize),
            notes: row.get("notes"),
            is_sensitive: row.get::<i64, _>("is_sensitive") != 0,
            sensitivity_confirmed_at: parse_ts_opt(row.get("sensitivity_confirmed_at")),
            created_by: row.get("created_by"),
            chunk_count: row.get::<i64, _>("chunk_count") as u32,
            word_count: row.get::<i64, _>("word_count") as u64,
            file_size: row.get::<i64, _>("file_size") as u64,
            created_at: parse_ts(row.get("created_at")),
            updated_at: parse_ts(row.get("updated_at")),
        })
    }
}

fn parse_ts(raw: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_ts_opt(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    })
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn insert_document(&self, doc: &DocumentRecord) -> Result<()> {
        let confirmed_at = doc.sensitivity_confirmed_at.ok_or_else(|| {
            RagError::validation_field(
                "sensitivity_confirmed_at",
                "Sensitivity review confirmation is required for ingest",
                "Confirm the document has been reviewed for sensitive content",
            )
        })?;

        if let Some(year) = doc.year {
            if !crate::types::year_in_range(year) {
                return Err(RagError::validation_field(
                    "year",
                    format!("Year {} is outside 2000..{}", year, crate::types::max_document_year()),
                    "Correct the document year",
                ));
            }
        }

        let canonical = self.resolve_program_names(&doc.programs).await?;

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"INSERT INTO documents
               (doc_id, filename, doc_type, year, tags_json, outcome, notes,
                is_sensitive, sensitivity_confirmed_at, created_by,
                chunk_count, word_count, file_size, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(doc.doc_id.to_string())
        .bind(&doc.filename)
        .bind(doc.doc_type.as_str())
        .bind(doc.year)
        .bind(serde_json::to_string(&doc.tags).unwrap_or_else(|_| "[]".into()))
        .bind(doc.outcome.map(|o| o.as_str()))
        .bind(&doc.notes)
        .bind(doc.is_sensitive as i64)
        .bind(confirmed_at.to_rfc3339())
        .bind(&doc.created_by)
        .bind(doc.chunk_count as i64)
        .bind(doc.word_count as i64)
        .bind(doc.file_size as i64)
        .bind(doc.created_at.to_rfc3339())
        .bind(doc.updated_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        for program in &canonical {
            sqlx::query("INSERT INTO document_programs (doc_id, program_name) VALUES (?, ?)")
                .bind(doc.doc_id.to_string())
                .bind(program)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_document(&self, doc_id: Uuid) -> Result<Option<DocumentRecord>> {
        let row = sqlx::query("SELECT * FROM documents WHERE doc_id = ?")
            .bind(doc_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(self.row_to_document(&row).await?)),
            None => Ok(None),
        }
    }

    async fn list_documents(
        &self,
        filters: &DocumentFilters,
        limit: usize,
    ) -> Result<Vec<DocumentRecord>> {
        // Filters here are a coarse superset; chunk-level filtering is
        // the retrieval engine's job.
        let rows = sqlx::query("SELECT * FROM documents ORDER BY created_at DESC LIMIT ?")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        let mut docs = Vec::with_capacity(rows.len());
        for row in &rows {
            let doc = self.row_to_document(row).await?;
            let matches_type = filters
                .doc_types
                .as_ref()
                .map_or(true, |ts| ts.contains(&doc.doc_type));
            let matches_year = filters.year.map_or(true, |y| doc.year == Some(y));
            let matches_programs = filters.programs.as_ref().map_or(true, |ps| {
                ps.iter()
                    .any(|p| doc.programs.iter().any(|q| q.eq_ignore_ascii_case(p)))
            });
            let matches_tags = filters.tags.as_ref().map_or(true, |ts| {
                ts.iter()
                    .any(|t| doc.tags.iter().any(|u| u.eq_ignore_ascii_case(t)))
            });
            if matches_type && matches_year && matches_programs && matches_tags {
                docs.push(doc);
            }
        }
        Ok(docs)
    }

    async fn update_document(&self, doc_id: Uuid, update: &DocumentUpdate) -> Result<DocumentRecord> {
        let existing = self
            .get_document(doc_id)
            .await?
            .ok_or_else(|| RagError::NotFound {
                resource: "document",
                id: doc_id.to_string(),
            })?;

        let doc_type = update.doc_type.unwrap_or(existing.doc_type);
        let year = update.year.or(existing.year);
        if let Some(y) = year {
            if !crate::types::year_in_range(y) {
                return Err(RagError::validation_field(
                    "year",
                    format!("Year {} is outside the allowed range", y),
                    "Correct the document year",
                ));
            }
        }
        let tags = update.tags.clone().unwrap_or(existing.tags);
        let outcome = match &update.outcome {
            Some(explicit) => *explicit,
            None => existing.outcome,
        };
        let notes = match &update.notes {
            Some(explicit) => explicit.clone(),
            None => existing.notes,
        };

        let programs = match &update.programs {
            Some(requested) => self.resolve_program_names(requested).await?,
            None => existing.programs.clone(),
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"UPDATE documents SET doc_type = ?, year = ?, tags_json = ?,
               outcome = ?, notes = ?, updated_at = ? WHERE doc_id = ?"#,
        )
        .bind(doc_type.as_str())
        .bind(year)
        .bind(serde_json::to_string(&tags).unwrap_or_else(|_| "[]".into()))
        .bind(outcome.map(|o| o.as_str()))
        .bind(&notes)
        .bind(Utc::now().to_rfc3339())
        .bind(doc_id.to_string())
        .execute(&mut *tx)
        .await?;

        if update.programs.is_some() {
            sqlx::query("DELETE FROM document_programs WHERE doc_id = ?")
                .bind(doc_id.to_string())
                .execute(&mut *tx)
                .await?;
            for program in &programs {
                sqlx::query("INSERT INTO document_programs (doc_id, program_name) VALUES (?, ?)")
                    .bind(doc_id.to_string())
                    .bind(program)
                    .execute(&mut *tx)
                    .await?;
            }
        }
        tx.commit().await?;

        self.get_document(doc_id).await?.ok_or_else(|| {
            RagError::internal("document vanished during update")
        })
    }

    async fn delete_document(&self, doc_id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM documents WHERE doc_id = ?")
            .bind(doc_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_programs(&self, active_only: bool) -> Result<Vec<Program>> {
        let sql = if active_only {
            "SELECT * FROM programs WHERE active = 1 ORDER BY display_order, name"
        } else {
            "SELECT * FROM programs ORDER BY display_order, name"
        };
        let rows = sqlx::query(sql).fetch_all(&self.pool).await?;
        Ok(rows.iter().map(Self::row_to_program).collect())
    }

    async fn create_program(
        &self,
        name: &str,
        description: Option<&str>,
        display_order: i64,
    ) -> Result<Program> {
        let name = name.trim();
        if name.is_empty() {
            return Err(RagError::validation_field(
                "name",
                "Program name cannot be empty",
                "Provide a program name",
            ));
        }

        let result = sqlx::query(
            "INSERT INTO programs (name, description, active, display_order) VALUES (?, ?, 1, ?)",
        )
        .bind(name)
        .bind(description)
        .bind(display_order)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => {
                let row = sqlx::query("SELECT * FROM programs WHERE program_id = ?")
                    .bind(done.last_insert_rowid())
                    .fetch_one(&self.pool)
                    .await?;
                Ok(Self::row_to_program(&row))
            }
            Err(sqlx::Error::Database(db)) if db.message().contains("UNIQUE") => {
                Err(RagError::conflict(format!(
                    "Program '{}' already exists (names are case-insensitive)",
                    name
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn set_program_active(&self, program_id: i64, active: bool) -> Result<Program> {
        let result = sqlx::query("UPDATE programs SET active = ? WHERE program_id = ?")
            .bind(active as i64)
            .bind(program_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(RagError::NotFound {
                resource: "program",
                id: program_id.to_string(),
            });
        }
        let row = sqlx::query("SELECT * FROM programs WHERE program_id = ?")
            .bind(program_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(Self::row_to_program(&row))
    }

    async fn delete_program(&self, program_id: i64, force: bool) -> Result<()> {
        let row = sqlx::query("SELECT name FROM programs WHERE program_id = ?")
            .bind(program_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| RagError::NotFound {
                resource: "program",
                id: program_id.to_string(),
            })?;
        let name: String = row.get("name");

        let references = self.program_document_count(&name).await?;
        if references > 0 && !force {
            return Err(RagError::conflict(format!(
                "Program '{}' is referenced by {} document(s); pass force to detach and delete",
                name, references
            )));
        }

        let mut tx = self.pool.begin().await?;
        if force {
            sqlx::query("DELETE FROM document_programs WHERE program_name = ?")
                .bind(&name)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("DELETE FROM programs WHERE program_id = ?")
            .bind(program_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn program_document_count(&self, name: &str) -> Result<usize> {
        let row = sqlx::query(
            "SELECT COUNT(DISTINCT doc_id) AS n FROM document_programs WHERE program_name = ? COLLATE NOCASE",
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("n") as usize)
    }

    async fn resolve_program_names(&self, requested: &[String]) -> Result<Vec<String>> {
        if requested.is_empty() {
            return Ok(Vec::new());
        }

        let active = self.list_programs(true).await?;
        let mut canonical = Vec::with_capacity(requested.len());
        let mut invalid = Vec::new();

        for name in requested {
            match active
                .iter()
                .find(|p| p.name.eq_ignore_ascii_case(name.trim()))
            {
                Some(program) => {
                    if !canonical.contains(&program.name) {
                        canonical.push(program.name.clone());
                    }
                }
                None => invalid.push(name.clone()),
            }
        }

        if !invalid.is_empty() {
            let valid = active.into_iter().map(|p| p.name).collect();
            return Err(RagError::invalid_programs(invalid, valid));
        }
        Ok(canonical)
    }

    async fn create_conversation(
        &self,
        title: &str,
        created_by: &str,
        context: &ConversationContext,
    ) -> Result<Conversation> {
        let now = Utc::now();
        let conversation = Conversation {
            conversation_id: Uuid::new_v4(),
            title: title.to_string(),
            created_by: created_by.to_string(),
            context: context.clone(),
            created_at: now,
            updated_at: now,
        };
        sqlx::query(
            r#"INSERT INTO conversations
               (conversation_id, title, created_by, context_json, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(conversation.conversation_id.to_string())
        .bind(&conversation.title)
        .bind(&conversation.created_by)
        .bind(serde_json::to_string(context).unwrap_or_else(|_| "{}".into()))
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(conversation)
    }

    async fn get_conversation(&self, conversation_id: Uuid) -> Result<Option<Conversation>> {
        let row = sqlx::query("SELECT * FROM conversations WHERE conversation_id = ?")
            .bind(conversation_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| {
            let context_json: String = row.get("context_json");
            Conversation {
                conversation_id,
                title: row.get("title"),
                created_by: row.get("created_by"),
                context: serde_json::from_str(&context_json).unwrap_or_default(),
                created_at: parse_ts(row.get("created_at")),
                updated_at: parse_ts(row.get("updated_at")),
            }
        }))
    }

    async fn update_conversation_context(
        &self,
        conversation_id: Uuid,
        context: &ConversationContext,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE conversations SET context_json = ?, updated_at = ? WHERE conversation_id = ?",
        )
        .bind(serde_json::to_string(context).unwrap_or_else(|_| "{}".into()))
        .bind(Utc::now().to_rfc3339())
        .bind(conversation_id.to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(RagError::NotFound {
                resource: "conversation",
                id: conversation_id.to_string(),
            });
        }
        Ok(())
    }

    async fn touch_conversation(&self, conversation_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE conversations SET updated_at = ? WHERE conversation_id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(conversation_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn append_message(&self, message: &Message) -> Result<()> {
        let role = match message.role {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        };
        sqlx::query(
            r#"INSERT INTO messages
               (message_id, conversation_id, role, content, citations_json,
                source_chunk_ids_json, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(message.message_id.to_string())
        .bind(message.conversation_id.to_string())
        .bind(role)
        .bind(&message.content)
        .bind(serde_json::to_string(&message.citations).unwrap_or_else(|_| "[]".into()))
        .bind(serde_json::to_string(&message.source_chunk_ids).unwrap_or_else(|_| "[]".into()))
        .bind(message.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_messages(&self, conversation_id: Uuid, limit: usize) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE conversation_id = ? ORDER BY created_at DESC LIMIT ?",
        )
        .bind(conversation_id.to_string())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut messages: Vec<Message> = rows
            .iter()
            .map(|row| {
                let role: String = row.get("role");
                let citations_json: String = row.get("citations_json");
                let sources_json: String = row.get("source_chunk_ids_json");
                let message_id: String = row.get("message_id");
                Message {
                    message_id: Uuid::parse_str(&message_id).unwrap_or_default(),
                    conversation_id,
                    role: if role == "assistant" {
                        MessageRole::Assistant
                    } else {
                        MessageRole::User
                    },
                    content: row.get("content"),
                    citations: serde_json::from_str(&citations_json).unwrap_or_default(),
                    source_chunk_ids: serde_json::from_str(&sources_json).unwrap_or_default(),
                    created_at: parse_ts(row.get("created_at")),
                }
            })
            .collect();
        messages.reverse();
        Ok(messages)
    }

    async fn insert_output(&self, output: &OutputRecord) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO outputs
               (output_id, title, content, funder, amount_requested, submitted_at,
                outcome, created_by, conversation_id, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(output.output_id.to_string())
        .bind(&output.title)
        .bind(&output.content)
        .bind(&output.funder)
        .bind(output.amount_requested)
        .bind(output.submitted_at.map(|dt| dt.to_rfc3339()))
        .bind(output.outcome.map(|o| o.as_str()))
        .bind(&output.created_by)
        .bind(output.conversation_id.map(|id| id.to_string()))
        .bind(output.created_at.to_rfc3339())
        .bind(output.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_outputs(&self, created_by: Option<&str>, limit: usize) -> Result<Vec<OutputRecord>> {
        let rows = match created_by {
            Some(principal) => {
                sqlx::query(
                    "SELECT * FROM outputs WHERE created_by = ? ORDER BY created_at DESC LIMIT ?",
                )
                .bind(principal)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM outputs ORDER BY created_at DESC LIMIT ?")
                    .bind(limit as i64)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        Ok(rows
            .iter()
            .map(|row| {
                let output_id: String = row.get("output_id");
                let conversation_id: Option<String> = row.get("conversation_id");
                let outcome: Option<String> = row.get("outcome");
                OutputRecord {
                    output_id: Uuid::parse_str(&output_id).unwrap_or_default(),
                    title: row.get("title"),
                    content: row.get("content"),
                    funder: row.get("funder"),
                    amount_requested: row.get("amount_requested"),
                    submitted_at: parse_ts_opt(row.get("submitted_at")),
                    outcome: outcome.as_deref().and_then(Outcome::normalize),
                    created_by: row.get("created_by"),
                    conversation_id: conversation_id.and_then(|s| Uuid::parse_str(&s).ok()),
                    created_at: parse_ts(row.get("created_at")),
                    updated_at: parse_ts(row.get("updated_at")),
                }
            })
            .collect())
    }

    async fn record_audit(&self, event: &AuditEvent) -> Result<()> {
        sqlx::query(
            "INSERT INTO audit_log (action, principal, resource, detail_json, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&event.action)
        .bind(&event.principal)
        .bind(&event.resource)
        .bind(event.detail.to_string())
        .bind(event.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn health(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store() -> SqliteMetadataStore {
        SqliteMetadataStore::connect("sqlite::memory:").await.unwrap()
    }

    fn sample_document(programs: Vec<String>) -> DocumentRecord {
        let now = Utc::now();
        DocumentRecord {
            doc_id: Uuid::new_v4(),
            filename: "proposal_2023.pdf".into(),
            doc_type: DocType::GrantProposal,
            year: Some(2023),
            programs,
            tags: vec!["federal".into()],
            outcome: Some(Outcome::Funded),
            notes: None,
            is_sensitive: false,
            sensitivity_confirmed_at: Some(now),
            created_by: "tester".into(),
            chunk_count: 3,
            word_count: 900,
            file_size: 4096,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn insert_and_round_trip_document() {
        let store = memory_store().await;
        store.create_program("Education", None, 0).await.unwrap();

        let doc = sample_document(vec!["Education".into()]);
        store.insert_document(&doc).await.unwrap();

        let loaded = store.get_document(doc.doc_id).await.unwrap().unwrap();
        assert_eq!(loaded.filename, doc.filename);
        assert_eq!(loaded.doc_type, DocType::GrantProposal);
        assert_eq!(loaded.programs, vec!["Education".to_string()]);
        assert_eq!(loaded.outcome, Some(Outcome::Funded));
        assert_eq!(loaded.chunk_count, 3);
    }

    #[tokio::test]
    async fn unknown_program_is_structured_validation_error() {
        let store = memory_store().await;
        store.create_program("Education", None, 0).await.unwrap();

        let doc = sample_document(vec!["NonexistentProgram".into()]);
        let err = store.insert_document(&doc).await.unwrap_err();
        match err {
            RagError::Validation {
                invalid_programs,
                valid_programs,
                ..
            } => {
                assert_eq!(invalid_programs, vec!["NonexistentProgram".to_string()]);
                assert_eq!(valid_programs, vec!["Education".to_string()]);
            }
            other => panic!("expected validation, got {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn inactive_program_rejected_canonical_case_applied() {
        let store = memory_store().await;
        store.create_program("Education", None, 0).await.unwrap();
        let health = store.create_program("Health", None, 1).await.unwrap();
        store.set_program_active(health.program_id, false).await.unwrap();

        // Lowercase input resolves to stored canonical case.
        let resolved = store
            .resolve_program_names(&["education".to_string()])
            .await
            .unwrap();
        assert_eq!(resolved, vec!["Education".to_string()]);

        // Inactive programs are invalid for new documents.
        let err = store
            .resolve_program_names(&["Health".to_string()])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation_error");
    }

    #[tokio::test]
    async fn missing_sensitivity_confirmation_blocks_insert() {
        let store = memory_store().await;
        let mut doc = sample_document(Vec::new());
        doc.sensitivity_confirmed_at = None;
        let err = store.insert_document(&doc).await.unwrap_err();
        assert_eq!(err.kind(), "validation_error");
        assert!(err.to_string().contains("Sensitivity"));
    }

    #[tokio::test]
    async fn duplicate_program_name_is_conflict_case_insensitive() {
        let store = memory_store().await;
        store.create_program("Education", None, 0).await.unwrap();
        let err = store.create_program("EDUCATION", None, 1).await.unwrap_err();
        assert_eq!(err.kind(), "conflict");
    }

    #[tokio::test]
    async fn referenced_program_delete_requires_force() {
        let store = memory_store().await;
        let program = store.create_program("Education", None, 0).await.unwrap();
        let doc = sample_document(vec!["Education".into()]);
        store.insert_document(&doc).await.unwrap();

        let err = store.delete_program(program.program_id, false).await.unwrap_err();
        assert_eq!(err.kind(), "conflict");

        store.delete_program(program.program_id, true).await.unwrap();
        assert_eq!(store.program_document_count("Education").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn conversation_message_round_trip() {
        let store = memory_store().await;
        let context = ConversationContext {
            audience: Some("Federal RFP".into()),
            ..Default::default()
        };
        let conversation = store
            .create_conversation("Draft narrative", "tester", &context)
            .await
            .unwrap();

        let message = Message {
            message_id: Uuid::new_v4(),
            conversation_id: conversation.conversation_id,
            role: MessageRole::Assistant,
            content: "Our programs served 5,000 youth [1].".into(),
            citations: vec![1],
            source_chunk_ids: vec!["doc_0".into()],
            created_at: Utc::now(),
        };
        store.append_message(&message).await.unwrap();

        let history = store
            .list_messages(conversation.conversation_id, 10)
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].citations, vec![1]);
        assert_eq!(history[0].role, MessageRole::Assistant);

        let loaded = store
            .get_conversation(conversation.conversation_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.context.audience.as_deref(), Some("Federal RFP"));
    }

    #[tokio::test]
    async fn document_update_replaces_programs() {
        let store = memory_store().await;
        store.create_program("Education", None, 0).await.unwrap();
        store.create_program("Arts", None, 1).await.unwrap();

        let doc = sample_document(vec!["Education".into()]);
        store.insert_document(&doc).await.unwrap();

        let update = DocumentUpdate {
            programs: Some(vec!["Arts".into()]),
            ..Default::default()
        };
        let updated = store.update_document(doc.doc_id, &update).await.unwrap();
        assert_eq!(updated.programs, vec!["Arts".to_string()]);
    }
}
