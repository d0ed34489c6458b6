use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Type, ValueRef};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::error::SyncError;
use crate::merge::{Collapse, collapse};

/// Logical operation type captured in the log.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum OpType {
    Insert,
    Update,
    Delete,
}

impl OpType {
    pub fn as_str(self) -> &'static str {
        match self {
            OpType::Insert => "INSERT",
            OpType::Update => "UPDATE",
            OpType::Delete => "DELETE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "INSERT" => Some(OpType::Insert),
            "UPDATE" => Some(OpType::Update),
            "DELETE" => Some(OpType::Delete),
            _ => None,
        }
    }
}

impl ToSql for OpType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for OpType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        OpType::parse(s).ok_or_else(|| FromSqlError::Other(format!("unknown op_type {s:?}").into()))
    }
}

/// Where an operation sits in its push lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpState {
    /// Waiting to be sent.
    Pending,
    /// Dispatched to the remote service; not mutated by local edits.
    InFlight,
    /// Last push failed and an unresolved error blocks retries.
    Errored,
}

impl OpState {
    pub fn as_str(self) -> &'static str {
        match self {
            OpState::Pending => "pending",
            OpState::InFlight => "in_flight",
            OpState::Errored => "errored",
        }
    }
}

impl ToSql for OpState {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for OpState {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "pending" => Ok(OpState::Pending),
            "in_flight" => Ok(OpState::InFlight),
            "errored" => Ok(OpState::Errored),
            other => Err(FromSqlError::Other(format!("unknown state {other:?}").into())),
        }
    }
}

/// Opaque operation identifier, generated at enqueue time and persisted with the row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(String);

impl OperationId {
    pub fn generate() -> Self {
        OperationId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for OperationId {
    fn from(s: String) -> Self {
        OperationId(s)
    }
}

impl From<&str> for OperationId {
    fn from(s: &str) -> Self {
        OperationId(s.to_string())
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One pending mutation of a record.
#[derive(Debug, Clone, PartialEq)]
pub struct TableOperation {
    /// Durable drain order.
    pub seq: i64,
    pub id: OperationId,
    pub table: String,
    pub item_id: String,
    pub op_type: OpType,
    /// Payload to send (None for deletes without a version payload).
    pub item: Option<Value>,
    pub state: OpState,
    pub enqueued_at: DateTime<Utc>,
}

/// What `enqueue` did with a local mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Enqueued {
    /// A new operation was appended.
    Queued(OperationId),
    /// The mutation was folded into an existing pending operation.
    Collapsed(OperationId),
    /// The mutation cancelled the existing operation; nothing is left to push.
    Cancelled(OperationId),
}

impl Enqueued {
    pub fn operation_id(&self) -> &OperationId {
        match self {
            Enqueued::Queued(id) | Enqueued::Collapsed(id) | Enqueued::Cancelled(id) => id,
        }
    }
}

const SELECT_OP: &str = "SELECT seq, op_id, table_name, item_id, op_type, item, state, enqueued_at
FROM pending_operations";

fn read_op(r: &Row<'_>) -> rusqlite::Result<TableOperation> {
    let op_id: String = r.get(1)?;
    let enqueued_at: String = r.get(7)?;
    let enqueued_at = DateTime::parse_from_rfc3339(&enqueued_at)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(7, Type::Text, Box::new(e)))?;
    Ok(TableOperation {
        seq: r.get(0)?,
        id: OperationId(op_id),
        table: r.get(2)?,
        item_id: r.get(3)?,
        op_type: r.get(4)?,
        item: json_column(r, 5)?,
        state: r.get(6)?,
        enqueued_at,
    })
}

/// Decode a nullable JSON TEXT column.
pub(crate) fn json_column(r: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Value>> {
    let raw: Option<String> = r.get(idx)?;
    raw.map(|s| {
        serde_json::from_str::<Value>(&s)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

/// Run `f` in a transaction, or directly if `conn` is already inside one.
pub(crate) fn atomically<R, F>(conn: &Connection, f: F) -> Result<R, SyncError>
where
    F: FnOnce(&Connection) -> Result<R, SyncError>,
{
    if !conn.is_autocommit() {
        return f(conn);
    }
    let tx = conn.unchecked_transaction()?;
    let result = f(&tx)?;
    tx.commit()?;
    Ok(result)
}

/// Durable, ordered log of pending table operations bound to a SQLite connection.
pub struct OperationLog<'c> {
    conn: &'c Connection,
}

impl<'c> OperationLog<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Create required metadata tables and indexes.
    /// Safe to call multiple times.
    pub fn init_schema(&self) -> Result<(), SyncError> {
        self.conn.execute_batch(
            r#"
PRAGMA journal_mode=WAL;

CREATE TABLE IF NOT EXISTS pending_operations (
seq INTEGER PRIMARY KEY AUTOINCREMENT,
op_id TEXT NOT NULL UNIQUE,
table_name TEXT NOT NULL,
item_id TEXT NOT NULL,
op_type TEXT NOT NULL CHECK(op_type IN ('INSERT','UPDATE','DELETE')),
item TEXT, -- JSON (nullable)
state TEXT NOT NULL DEFAULT 'pending' CHECK(state IN ('pending','in_flight','errored')),
enqueued_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_pending_operations_item
ON pending_operations(table_name, item_id, seq);

CREATE TABLE IF NOT EXISTS operation_errors (
guid TEXT PRIMARY KEY,
op_id TEXT NOT NULL,
properties TEXT NOT NULL, -- serialized TableOperationError
created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_operation_errors_op
ON operation_errors(op_id);

CREATE TABLE IF NOT EXISTS sync_kv (
k TEXT PRIMARY KEY,
v TEXT NOT NULL
);
"#,
        )?;
        self.conn.execute(
            "INSERT INTO sync_kv(k,v) VALUES('schema_version','1')
ON CONFLICT(k) DO NOTHING",
            [],
        )?;
        Ok(())
    }

    /// Put operations a crashed process left `in_flight` back in the queue.
    pub fn recover_in_flight(&self) -> Result<usize, SyncError> {
        let n = self.conn.execute(
            "UPDATE pending_operations SET state='pending' WHERE state='in_flight'",
            [],
        )?;
        if n > 0 {
            debug!(recovered = n, "re-queued operations interrupted mid-push");
        }
        Ok(n)
    }

    /// Record a local mutation, collapsing it into an existing queued operation
    /// for the same record when there is one.
    pub fn enqueue(
        &self,
        table: &str,
        item_id: &str,
        op_type: OpType,
        item: Option<&Value>,
    ) -> Result<Enqueued, SyncError> {
        atomically(self.conn, |conn| {
            let log = OperationLog::new(conn);
            let existing = match log.latest_live(table, item_id)? {
                Some(op) => op,
                None => return log.append(table, item_id, op_type, item).map(Enqueued::Queued),
            };
            let rejected = |reason: &'static str| SyncError::InvalidOperation {
                table: table.to_string(),
                item_id: item_id.to_string(),
                reason,
            };

            if existing.state == OpState::InFlight {
                // Dispatched operations are immutable; queue a follow-up instead.
                if let Collapse::Reject(reason) = collapse(existing.op_type, op_type) {
                    return Err(rejected(reason));
                }
                return log.append(table, item_id, op_type, item).map(Enqueued::Queued);
            }

            match collapse(existing.op_type, op_type) {
                Collapse::Merged { op_type: merged, take_incoming } => {
                    let payload = if take_incoming {
                        item.cloned()
                    } else {
                        existing.item.clone()
                    };
                    conn.execute(
                        "UPDATE pending_operations SET op_type=?1, item=?2, state='pending'
WHERE op_id=?3",
                        params![merged, payload.map(|v| v.to_string()), existing.id.as_str()],
                    )?;
                    debug!(
                        op_id = %existing.id,
                        table,
                        item_id,
                        from = existing.op_type.as_str(),
                        to = merged.as_str(),
                        "collapsed local mutation"
                    );
                    Ok(Enqueued::Collapsed(existing.id))
                }
                Collapse::Cancel => {
                    conn.execute(
                        "DELETE FROM pending_operations WHERE op_id=?1",
                        params![existing.id.as_str()],
                    )?;
                    conn.execute(
                        "DELETE FROM operation_errors WHERE op_id=?1",
                        params![existing.id.as_str()],
                    )?;
                    debug!(
                        op_id = %existing.id,
                        table,
                        item_id,
                        "local mutation cancelled queued operation"
                    );
                    Ok(Enqueued::Cancelled(existing.id))
                }
                Collapse::Reject(reason) => Err(rejected(reason)),
            }
        })
    }

    fn append(
        &self,
        table: &str,
        item_id: &str,
        op_type: OpType,
        item: Option<&Value>,
    ) -> Result<OperationId, SyncError> {
        let id = OperationId::generate();
        self.conn.execute(
            "INSERT INTO pending_operations
(op_id,table_name,item_id,op_type,item,state,enqueued_at)
VALUES (?1,?2,?3,?4,?5,'pending',?6)",
            params![
                id.as_str(),
                table,
                item_id,
                op_type,
                item.map(|v| v.to_string()),
                Utc::now().to_rfc3339(),
            ],
        )?;
        debug!(op_id = %id, table, item_id, op = op_type.as_str(), "queued operation");
        Ok(id)
    }

    fn latest_live(&self, table: &str, item_id: &str) -> Result<Option<TableOperation>, SyncError> {
        let sql =
            format!("{SELECT_OP} WHERE table_name=?1 AND item_id=?2 ORDER BY seq DESC LIMIT 1");
        Ok(self
            .conn
            .query_row(&sql, params![table, item_id], read_op)
            .optional()?)
    }

    /// Next operation eligible for sending, in enqueue order.
    pub fn peek_next(&self) -> Result<Option<TableOperation>, SyncError> {
        let sql = format!("{SELECT_OP} WHERE state='pending' ORDER BY seq ASC LIMIT 1");
        Ok(self.conn.query_row(&sql, [], read_op).optional()?)
    }

    pub fn get(&self, id: &OperationId) -> Result<Option<TableOperation>, SyncError> {
        let sql = format!("{SELECT_OP} WHERE op_id=?1");
        Ok(self.conn.query_row(&sql, params![id.as_str()], read_op).optional()?)
    }

    /// Drop an operation from the log. Returns false if it was already gone.
    pub fn remove(&self, id: &OperationId) -> Result<bool, SyncError> {
        let n = self.conn.execute(
            "DELETE FROM pending_operations WHERE op_id=?1",
            params![id.as_str()],
        )?;
        Ok(n > 0)
    }

    /// All live operations in drain order, optionally for one table.
    pub fn list_pending(&self, table: Option<&str>) -> Result<Vec<TableOperation>, SyncError> {
        let mut out = Vec::new();
        match table {
            Some(t) => {
                let sql = format!("{SELECT_OP} WHERE table_name=?1 ORDER BY seq ASC");
                let mut stmt = self.conn.prepare(&sql)?;
                for op in stmt.query_map(params![t], read_op)? {
                    out.push(op?);
                }
            }
            None => {
                let sql = format!("{SELECT_OP} ORDER BY seq ASC");
                let mut stmt = self.conn.prepare(&sql)?;
                for op in stmt.query_map([], read_op)? {
                    out.push(op?);
                }
            }
        }
        Ok(out)
    }

    /// Up to `limit` pending operations that head their record's queue and are
    /// not in `skip`. At most one operation per record is ever returned.
    pub fn next_wave(
        &self,
        limit: usize,
        skip: &HashSet<OperationId>,
    ) -> Result<Vec<TableOperation>, SyncError> {
        let sql = format!(
            "{SELECT_OP} p WHERE state='pending' AND seq = (
SELECT MIN(seq) FROM pending_operations q
WHERE q.table_name=p.table_name AND q.item_id=p.item_id)
ORDER BY seq ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut out = Vec::new();
        for op in stmt.query_map([], read_op)? {
            let op = op?;
            if skip.contains(&op.id) {
                continue;
            }
            out.push(op);
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    pub fn set_state(&self, id: &OperationId, state: OpState) -> Result<bool, SyncError> {
        let n = self.conn.execute(
            "UPDATE pending_operations SET state=?1 WHERE op_id=?2",
            params![state, id.as_str()],
        )?;
        Ok(n > 0)
    }

    /// True if another operation for the record was queued after `seq`.
    pub fn has_followup(&self, table: &str, item_id: &str, seq: i64) -> Result<bool, SyncError> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM pending_operations
                 WHERE table_name=?1 AND item_id=?2 AND seq>?3 LIMIT 1",
                params![table, item_id, seq],
                |_r| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// True if any operation is queued for the record.
    pub fn has_live(&self, table: &str, item_id: &str) -> Result<bool, SyncError> {
        Ok(self.latest_live(table, item_id)?.is_some())
    }

    /// Drop every operation queued for the record, in flight or not, and
    /// return their ids.
    pub fn remove_for_record(
        &self,
        table: &str,
        item_id: &str,
    ) -> Result<Vec<OperationId>, SyncError> {
        let mut stmt = self.conn.prepare(
            "DELETE FROM pending_operations WHERE table_name=?1 AND item_id=?2 RETURNING op_id",
        )?;
        let mut removed = Vec::new();
        for id in stmt.query_map(params![table, item_id], |r| r.get::<_, String>(0))? {
            removed.push(OperationId(id?));
        }
        Ok(removed)
    }

    /// Get the cursor stored for a pull query.
    pub fn get_cursor(&self, query_id: &str) -> Result<Option<String>, SyncError> {
        let cur: Option<String> = self
            .conn
            .query_row(
                "SELECT v FROM sync_kv WHERE k=?1",
                params![format!("cursor:{query_id}")],
                |r| r.get(0),
            )
            .optional()?;
        Ok(cur)
    }

    pub fn set_cursor(&self, query_id: &str, cursor: &str) -> Result<(), SyncError> {
        self.conn.execute(
            "INSERT INTO sync_kv(k,v) VALUES(?1,?2)
            ON CONFLICT(k) DO UPDATE SET v=excluded.v",
            params![format!("cursor:{query_id}"), cursor],
        )?;
        Ok(())
    }
}
