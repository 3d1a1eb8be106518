//! Replication checkpoint and conflict log storage

use crate::error::Result;
use crate::models::SyncConflict;
use rusqlite::{params, Connection, OptionalExtension};

/// Trait for replication bookkeeping
pub trait CheckpointRepository {
    /// Last pull cursor applied for a collection
    fn get(&self, collection: &str) -> Result<Option<String>>;

    /// Advance the pull cursor for a collection
    fn set(&self, collection: &str, cursor: &str) -> Result<()>;

    /// Append a resolved conflict to the audit log
    fn record_conflict(&self, conflict: &SyncConflict) -> Result<i64>;

    /// Most recently resolved conflicts first
    fn list_conflicts(&self, limit: usize) -> Result<Vec<SyncConflict>>;
}

/// `SQLite` implementation of `CheckpointRepository`
pub struct SqliteCheckpointRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteCheckpointRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_conflict(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncConflict> {
        let fields: serde_json::Value = row.get(5)?;
        Ok(SyncConflict {
            id: row.get(0)?,
            document_id: row.get(1)?,
            collection: row.get(2)?,
            local_updated_at: row.get(3)?,
            remote_updated_at: row.get(4)?,
            fields: serde_json::from_value(fields).unwrap_or_default(),
            resolved_at: row.get(6)?,
            strategy: row.get(7)?,
        })
    }
}

impl CheckpointRepository for SqliteCheckpointRepository<'_> {
    fn get(&self, collection: &str) -> Result<Option<String>> {
        let cursor = self
            .conn
            .query_row(
                "SELECT cursor FROM checkpoints WHERE collection = ?",
                params![collection],
                |row| row.get(0),
            )
            .optional()?;
        Ok(cursor)
    }

    fn set(&self, collection: &str, cursor: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        self.conn.execute(
            "INSERT INTO checkpoints (collection, cursor, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(collection) DO UPDATE SET cursor = excluded.cursor, updated_at = excluded.updated_at",
            params![collection, cursor, now],
        )?;
        Ok(())
    }

    fn record_conflict(&self, conflict: &SyncConflict) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO sync_conflicts
                (document_id, collection, local_updated_at, remote_updated_at, fields, resolved_at, strategy)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                conflict.document_id,
                conflict.collection,
                conflict.local_updated_at,
                conflict.remote_updated_at,
                serde_json::to_value(&conflict.fields)?,
                conflict.resolved_at,
                conflict.strategy,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    #[allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT
    fn list_conflicts(&self, limit: usize) -> Result<Vec<SyncConflict>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, document_id, collection, local_updated_at, remote_updated_at, fields, resolved_at, strategy
             FROM sync_conflicts
             ORDER BY resolved_at DESC, id DESC
             LIMIT ?",
        )?;
        let conflicts = stmt
            .query_map(params![limit as i64], Self::parse_conflict)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(conflicts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn setup() -> Database {
        Database::open_in_memory().unwrap()
    }

    #[test]
    fn test_checkpoint_set_and_overwrite() {
        let db = setup();
        let repo = SqliteCheckpointRepository::new(db.connection());

        assert_eq!(repo.get("patients").unwrap(), None);
        repo.set("patients", "5").unwrap();
        repo.set("patients", "9").unwrap();
        assert_eq!(repo.get("patients").unwrap().as_deref(), Some("9"));
        assert_eq!(repo.get("queue").unwrap(), None);
    }

    #[test]
    fn test_conflict_log() {
        let db = setup();
        let repo = SqliteCheckpointRepository::new(db.connection());

        for (doc, at) in [("p1", 10), ("p2", 20)] {
            repo.record_conflict(&SyncConflict {
                id: 0,
                document_id: doc.to_string(),
                collection: "patients".to_string(),
                local_updated_at: Some(1),
                remote_updated_at: Some(2),
                fields: vec!["phone".to_string()],
                resolved_at: at,
                strategy: "merge".to_string(),
            })
            .unwrap();
        }

        let conflicts = repo.list_conflicts(10).unwrap();
        assert_eq!(conflicts.len(), 2);
        assert_eq!(conflicts[0].document_id, "p2");
        assert_eq!(conflicts[1].fields, vec!["phone".to_string()]);
        assert_eq!(repo.list_conflicts(1).unwrap().len(), 1);
    }
}
