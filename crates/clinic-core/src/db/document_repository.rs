//! Document repository implementation

use crate::error::Result;
use crate::models::{Document, Fields};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

/// Trait for local document storage operations
pub trait DocumentRepository {
    /// Get a document by ID, tombstones included
    fn get(&self, id: &str) -> Result<Option<Document>>;

    /// List documents in insertion order, optionally scoped to a collection
    fn list(&self, collection: Option<&str>, include_deleted: bool) -> Result<Vec<Document>>;

    /// Insert or replace a document, keeping its original insertion position
    fn upsert(&self, document: &Document) -> Result<()>;

    /// Highest server revision this device has observed for the document
    fn remote_revision(&self, id: &str) -> Result<Option<i64>>;

    /// Record the server revision of the document's last acknowledged or pulled state
    fn set_remote_revision(&self, id: &str, revision: i64) -> Result<()>;

    /// Highest token number assigned locally for a queue day (0 when none)
    fn max_queue_token(&self, collection: &str, queue_date: &str) -> Result<i64>;
}

/// `SQLite` implementation of `DocumentRepository`
pub struct SqliteDocumentRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteDocumentRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Parse a document from a database row
    fn parse_document(row: &rusqlite::Row<'_>) -> rusqlite::Result<Document> {
        let fields = match row.get::<_, Value>(6)? {
            Value::Object(map) => map,
            _ => Fields::new(),
        };
        Ok(Document {
            id: row.get(0)?,
            collection: row.get(1)?,
            revision: row.get(2)?,
            created_at: row.get(3)?,
            updated_at: row.get(4)?,
            deleted: row.get::<_, i32>(5)? != 0,
            fields,
        })
    }
}

impl DocumentRepository for SqliteDocumentRepository<'_> {
    fn get(&self, id: &str) -> Result<Option<Document>> {
        let document = self
            .conn
            .query_row(
                "SELECT id, collection, revision, created_at, updated_at, is_deleted, payload
                 FROM documents WHERE id = ?",
                params![id],
                Self::parse_document,
            )
            .optional()?;
        Ok(document)
    }

    fn list(&self, collection: Option<&str>, include_deleted: bool) -> Result<Vec<Document>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, collection, revision, created_at, updated_at, is_deleted, payload
             FROM documents
             WHERE (?1 IS NULL OR collection = ?1) AND (?2 OR is_deleted = 0)
             ORDER BY rowid ASC",
        )?;

        let documents = stmt
            .query_map(params![collection, include_deleted], Self::parse_document)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(documents)
    }

    fn upsert(&self, document: &Document) -> Result<()> {
        self.conn.execute(
            "INSERT INTO documents (id, collection, revision, created_at, updated_at, is_deleted, payload)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                collection = excluded.collection,
                revision = excluded.revision,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at,
                is_deleted = excluded.is_deleted,
                payload = excluded.payload",
            params![
                document.id,
                document.collection,
                document.revision,
                document.created_at,
                document.updated_at,
                i32::from(document.deleted),
                Value::Object(document.fields.clone()),
            ],
        )?;
        Ok(())
    }

    fn remote_revision(&self, id: &str) -> Result<Option<i64>> {
        let revision: Option<Option<i64>> = self
            .conn
            .query_row(
                "SELECT remote_revision FROM documents WHERE id = ?",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(revision.flatten())
    }

    fn set_remote_revision(&self, id: &str, revision: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE documents SET remote_revision = MAX(COALESCE(remote_revision, 0), ?) WHERE id = ?",
            params![revision, id],
        )?;
        Ok(())
    }

    fn max_queue_token(&self, collection: &str, queue_date: &str) -> Result<i64> {
        let max = self.conn.query_row(
            "SELECT COALESCE(MAX(CAST(json_extract(payload, '$.tokenNumber') AS INTEGER)), 0)
             FROM documents
             WHERE collection = ? AND json_extract(payload, '$.queueDate') = ?",
            params![collection, queue_date],
            |row| row.get(0),
        )?;
        Ok(max)
    }
}
