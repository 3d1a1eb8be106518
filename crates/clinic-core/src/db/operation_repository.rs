//! Pending operation repository implementation

use crate::error::Result;
use crate::models::{Document, OperationId, OperationState, PendingOperation};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

/// Trait for durable pending-operation storage
pub trait OperationRepository {
    /// Append an operation to the end of the queue
    fn insert(&self, operation: &PendingOperation) -> Result<()>;

    /// Get an operation by ID
    fn get(&self, id: &OperationId) -> Result<Option<PendingOperation>>;

    /// All operations in enqueue order
    fn list(&self) -> Result<Vec<PendingOperation>>;

    /// Operations for a single document in enqueue order
    fn list_for_target(&self, target_id: &str) -> Result<Vec<PendingOperation>>;

    /// Number of queued operations, optionally restricted to a state
    fn count(&self, state: Option<OperationState>) -> Result<usize>;

    /// Remove an acknowledged or discarded operation
    fn delete(&self, id: &OperationId) -> Result<bool>;

    /// Remove every operation for a document
    fn delete_for_target(&self, target_id: &str) -> Result<usize>;

    /// Persist a failed delivery attempt
    fn record_failure(
        &self,
        id: &OperationId,
        attempts: u32,
        state: OperationState,
        error: &str,
    ) -> Result<()>;

    /// Replace the document state an operation will deliver
    fn replace_payload(&self, id: &OperationId, payload: &Document) -> Result<()>;

    /// Move dead-lettered operations back to pending with a fresh retry budget
    fn reset_failed(&self) -> Result<usize>;
}

/// `SQLite` implementation of `OperationRepository`
pub struct SqliteOperationRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteOperationRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Parse an operation from a database row
    fn parse_operation(row: &rusqlite::Row<'_>) -> rusqlite::Result<PendingOperation> {
        let operation_id: String = row.get(0)?;
        let kind: String = row.get(3)?;
        let payload: Value = row.get(4)?;
        let state: String = row.get(7)?;

        Ok(PendingOperation {
            operation_id: operation_id
                .parse()
                .map_err(|e| conversion_error(0, Box::new(e)))?,
            target_id: row.get(1)?,
            collection: row.get(2)?,
            kind: kind.parse().map_err(|e: String| conversion_error(3, e.into()))?,
            payload: serde_json::from_value(payload)
                .map_err(|e| conversion_error(4, Box::new(e)))?,
            created_at: row.get(5)?,
            attempts: row.get(6)?,
            state: state
                .parse()
                .map_err(|e: String| conversion_error(7, e.into()))?,
            last_error: row.get(8)?,
        })
    }
}

fn conversion_error(
    column: usize,
    source: Box<dyn std::error::Error + Send + Sync + 'static>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, source)
}

const SELECT_COLUMNS: &str = "SELECT operation_id, target_id, collection, kind, payload, created_at, attempts, state, last_error
     FROM pending_operations";

impl OperationRepository for SqliteOperationRepository<'_> {
    fn insert(&self, operation: &PendingOperation) -> Result<()> {
        self.conn.execute(
            "INSERT INTO pending_operations
                (operation_id, target_id, collection, kind, payload, created_at, attempts, state, last_error)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                operation.operation_id.as_str(),
                operation.target_id,
                operation.collection,
                operation.kind.as_str(),
                serde_json::to_value(&operation.payload)?,
                operation.created_at,
                operation.attempts,
                operation.state.as_str(),
                operation.last_error,
            ],
        )?;
        Ok(())
    }

    fn get(&self, id: &OperationId) -> Result<Option<PendingOperation>> {
        let operation = self
            .conn
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE operation_id = ?"),
                params![id.as_str()],
                Self::parse_operation,
            )
            .optional()?;
        Ok(operation)
    }

    fn list(&self) -> Result<Vec<PendingOperation>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{SELECT_COLUMNS} ORDER BY seq ASC"))?;
        let operations = stmt
            .query_map([], Self::parse_operation)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(operations)
    }

    fn list_for_target(&self, target_id: &str) -> Result<Vec<PendingOperation>> {
        let mut stmt = self.conn.prepare(&format!(
            "{SELECT_COLUMNS} WHERE target_id = ? ORDER BY seq ASC"
        ))?;
        let operations = stmt
            .query_map(params![target_id], Self::parse_operation)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(operations)
    }

    fn count(&self, state: Option<OperationState>) -> Result<usize> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM pending_operations WHERE ?1 IS NULL OR state = ?1",
            params![state.map(OperationState::as_str)],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn delete(&self, id: &OperationId) -> Result<bool> {
        let rows = self.conn.execute(
            "DELETE FROM pending_operations WHERE operation_id = ?",
            params![id.as_str()],
        )?;
        Ok(rows > 0)
    }

    fn delete_for_target(&self, target_id: &str) -> Result<usize> {
        let rows = self.conn.execute(
            "DELETE FROM pending_operations WHERE target_id = ?",
            params![target_id],
        )?;
        Ok(rows)
    }

    fn record_failure(
        &self,
        id: &OperationId,
        attempts: u32,
        state: OperationState,
        error: &str,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE pending_operations SET attempts = ?, state = ?, last_error = ? WHERE operation_id = ?",
            params![attempts, state.as_str(), error, id.as_str()],
        )?;
        Ok(())
    }

    fn replace_payload(&self, id: &OperationId, payload: &Document) -> Result<()> {
        self.conn.execute(
            "UPDATE pending_operations SET payload = ? WHERE operation_id = ?",
            params![serde_json::to_value(payload)?, id.as_str()],
        )?;
        Ok(())
    }

    fn reset_failed(&self) -> Result<usize> {
        let rows = self.conn.execute(
            "UPDATE pending_operations SET state = 'pending', attempts = 0 WHERE state = 'failed'",
            [],
        )?;
        Ok(rows)
    }
}
