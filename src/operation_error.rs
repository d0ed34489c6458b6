use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::SyncError;
use crate::oplog::{OpType, OperationId, TableOperation};
use crate::remote::RemoteService;
use crate::store::LocalStore;
use crate::sync::SyncContext;

/// Classification of a failed push.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// The server's version of the record differs from the one the client edited.
    PreconditionFailed,
    /// Update or delete of a record the server no longer has.
    ItemNotFound,
    /// Insert of an id the server already has.
    ItemAlreadyExists,
    /// Any other non-success response.
    ServerError,
    /// No response was obtained.
    NetworkFailure,
    /// The operation could not be sent (missing or malformed payload).
    InvalidItem,
}

impl ErrorCode {
    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16) -> Self {
        match status {
            412 => ErrorCode::PreconditionFailed,
            409 => ErrorCode::ItemAlreadyExists,
            404 => ErrorCode::ItemNotFound,
            _ => ErrorCode::ServerError,
        }
    }

    pub fn is_conflict(self) -> bool {
        self == ErrorCode::PreconditionFailed
    }
}

/// A failed push of one table operation, kept until the application resolves it.
///
/// `server_item` is present exactly when `code` is [`ErrorCode::PreconditionFailed`];
/// the constructor enforces this.
#[derive(Debug, Clone, PartialEq)]
pub struct TableOperationError {
    guid: String,
    operation_id: OperationId,
    table: String,
    item_id: String,
    operation: OpType,
    item: Option<Value>,
    code: ErrorCode,
    status_code: Option<u16>,
    server_item: Option<Value>,
    description: String,
    created_at: DateTime<Utc>,
    handled: bool,
}

impl TableOperationError {
    /// Build an error for `operation`. A conflict without a server item is
    /// recorded as a plain server error.
    pub fn new(
        operation: &TableOperation,
        item: Option<Value>,
        code: ErrorCode,
        status_code: Option<u16>,
        server_item: Option<Value>,
        description: impl Into<String>,
    ) -> Self {
        let (code, server_item) = match (code.is_conflict(), server_item) {
            (true, Some(server)) => (code, Some(server)),
            (true, None) => (ErrorCode::ServerError, None),
            (false, _) => (code, None),
        };
        Self {
            guid: Uuid::new_v4().to_string(),
            operation_id: operation.id.clone(),
            table: operation.table.clone(),
            item_id: operation.item_id.clone(),
            operation: operation.op_type,
            item,
            code,
            status_code,
            server_item,
            description: description.into(),
            created_at: Utc::now(),
            handled: false,
        }
    }

    pub fn guid(&self) -> &str {
        &self.guid
    }

    pub fn operation_id(&self) -> &OperationId {
        &self.operation_id
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn item_id(&self) -> &str {
        &self.item_id
    }

    pub fn operation(&self) -> OpType {
        self.operation
    }

    /// The payload that was attempted, if any.
    pub fn item(&self) -> Option<&Value> {
        self.item.as_ref()
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Response status; None if the request never reached the service.
    pub fn status_code(&self) -> Option<u16> {
        self.status_code
    }

    /// Server's current version of the record, for conflicts only.
    pub fn server_item(&self) -> Option<&Value> {
        self.server_item.as_ref()
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_handled(&self) -> bool {
        self.handled
    }

    pub(crate) fn mark_handled(&mut self) {
        self.handled = true;
    }

    /// Drop the pending operation and store `item` locally (usually the server item).
    pub fn cancel_and_update_item<S, R>(
        &mut self,
        ctx: &SyncContext<S, R>,
        item: Value,
    ) -> Result<(), SyncError>
    where
        S: LocalStore,
        R: RemoteService,
    {
        ctx.cancel_and_update_item(self, item)
    }

    /// Drop the pending operation and remove the record from the local store.
    pub fn cancel_and_discard_item<S, R>(
        &mut self,
        ctx: &SyncContext<S, R>,
    ) -> Result<(), SyncError>
    where
        S: LocalStore,
        R: RemoteService,
    {
        ctx.cancel_and_discard_item(self)
    }

    /// Keyed representation for durable storage.
    pub fn serialize(&self) -> Result<SerializedError, SyncError> {
        let props = Properties {
            operation_id: self.operation_id.clone(),
            table: self.table.clone(),
            item_id: self.item_id.clone(),
            operation: self.operation,
            item: self.item.clone(),
            code: self.code,
            status_code: self.status_code,
            server_item: self.server_item.clone(),
            description: self.description.clone(),
            created_at: self.created_at,
            handled: self.handled,
        };
        let properties = match serde_json::to_value(props)? {
            Value::Object(map) => map,
            other => {
                return Err(SyncError::Corrupt(format!(
                    "error properties serialized as {other}"
                )));
            }
        };
        Ok(SerializedError { id: self.guid.clone(), properties })
    }

    /// Rebuild an outstanding error from [`serialize`](Self::serialize) output.
    pub fn from_serialized(record: &SerializedError) -> Result<Self, SyncError> {
        let props: Properties = serde_json::from_value(Value::Object(record.properties.clone()))?;
        if props.code.is_conflict() != props.server_item.is_some() {
            return Err(SyncError::Corrupt(format!(
                "error {} has code {:?} but server item presence {}",
                record.id,
                props.code,
                props.server_item.is_some()
            )));
        }
        Ok(Self {
            guid: record.id.clone(),
            operation_id: props.operation_id,
            table: props.table,
            item_id: props.item_id,
            operation: props.operation,
            item: props.item,
            code: props.code,
            status_code: props.status_code,
            server_item: props.server_item,
            description: props.description,
            created_at: props.created_at,
            handled: props.handled,
        })
    }
}

/// Generic persisted form: an identifier plus a field map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedError {
    pub id: String,
    pub properties: Map<String, Value>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Properties {
    operation_id: OperationId,
    table: String,
    item_id: String,
    operation: OpType,
    #[serde(default)]
    item: Option<Value>,
    code: ErrorCode,
    #[serde(default)]
    status_code: Option<u16>,
    #[serde(default)]
    server_item: Option<Value>,
    description: String,
    created_at: DateTime<Utc>,
    #[serde(default)]
    handled: bool,
}

/// Outstanding errors persisted next to the operation log.
pub struct ErrorLog<'c> {
    conn: &'c Connection,
}

impl<'c> ErrorLog<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    pub fn save(&self, error: &TableOperationError) -> Result<(), SyncError> {
        let serialized = error.serialize()?;
        self.conn.execute(
            "INSERT INTO operation_errors(guid, op_id, properties, created_at) VALUES(?1,?2,?3,?4)
ON CONFLICT(guid) DO UPDATE SET properties=excluded.properties",
            params![
                serialized.id,
                error.operation_id.as_str(),
                Value::Object(serialized.properties).to_string(),
                error.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Unhandled errors in the order they were recorded.
    pub fn outstanding(&self) -> Result<Vec<TableOperationError>, SyncError> {
        let mut stmt = self
            .conn
            .prepare("SELECT guid, properties FROM operation_errors ORDER BY rowid ASC")?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?;

        let mut out = Vec::new();
        for row in rows {
            let (guid, raw) = row?;
            let properties = match serde_json::from_str::<Value>(&raw)? {
                Value::Object(map) => map,
                _ => {
                    return Err(SyncError::Corrupt(format!(
                        "error {guid} properties are not an object"
                    )));
                }
            };
            let record = SerializedError { id: guid, properties };
            out.push(TableOperationError::from_serialized(&record)?);
        }
        Ok(out)
    }

    pub fn contains(&self, guid: &str) -> Result<bool, SyncError> {
        let found = self
            .conn
            .query_row("SELECT 1 FROM operation_errors WHERE guid=?1", params![guid], |_r| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }

    pub fn evict(&self, guid: &str) -> Result<bool, SyncError> {
        let n = self
            .conn
            .execute("DELETE FROM operation_errors WHERE guid=?1", params![guid])?;
        Ok(n > 0)
    }

    /// Evict every outstanding error recorded for `op_id`.
    pub fn evict_for_operation(&self, op_id: &OperationId) -> Result<usize, SyncError> {
        Ok(self
            .conn
            .execute("DELETE FROM operation_errors WHERE op_id=?1", params![op_id.as_str()])?)
    }

    pub fn count_for_operation(&self, op_id: &OperationId) -> Result<usize, SyncError> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM operation_errors WHERE op_id=?1",
            params![op_id.as_str()],
            |r| r.get(0),
        )?;
        Ok(n as usize)
    }
}
