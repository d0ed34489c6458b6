use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;

use crate::error::SyncError;
use crate::oplog::json_column;

/// Keyed record storage per table, implemented by the host.
///
/// Every call receives the connection the sync context is working in. During
/// push completion and conflict resolution that is an open transaction, so a
/// store that writes through it commits or rolls back together with the
/// operation log. Stores backed by something else may ignore `conn`, but then
/// lose that atomicity.
pub trait LocalStore {
    fn read(
        &self,
        conn: &Connection,
        table: &str,
        item_id: &str,
    ) -> Result<Option<Value>, SyncError>;
    fn write(
        &self,
        conn: &Connection,
        table: &str,
        item_id: &str,
        record: &Value,
    ) -> Result<(), SyncError>;
    fn delete(&self, conn: &Connection, table: &str, item_id: &str) -> Result<(), SyncError>;
}

/// Schema-agnostic store keeping each record as a JSON document.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteStore;

impl SqliteStore {
    /// Create the backing table. Safe to call multiple times.
    pub fn init_schema(conn: &Connection) -> Result<(), SyncError> {
        conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS local_records (
table_name TEXT NOT NULL,
item_id TEXT NOT NULL,
record TEXT NOT NULL, -- JSON
PRIMARY KEY (table_name, item_id)
);
"#,
        )?;
        Ok(())
    }
}

impl LocalStore for SqliteStore {
    fn read(
        &self,
        conn: &Connection,
        table: &str,
        item_id: &str,
    ) -> Result<Option<Value>, SyncError> {
        let rec = conn
            .query_row(
                "SELECT record FROM local_records WHERE table_name=?1 AND item_id=?2",
                params![table, item_id],
                |r| json_column(r, 0),
            )
            .optional()?;
        Ok(rec.flatten())
    }

    fn write(
        &self,
        conn: &Connection,
        table: &str,
        item_id: &str,
        record: &Value,
    ) -> Result<(), SyncError> {
        conn.execute(
            "INSERT INTO local_records(table_name,item_id,record) VALUES(?1,?2,?3)
ON CONFLICT(table_name,item_id) DO UPDATE SET record=excluded.record",
            params![table, item_id, record.to_string()],
        )?;
        Ok(())
    }

    fn delete(&self, conn: &Connection, table: &str, item_id: &str) -> Result<(), SyncError> {
        conn.execute(
            "DELETE FROM local_records WHERE table_name=?1 AND item_id=?2",
            params![table, item_id],
        )?;
        Ok(())
    }
}
