use serde_json::Value;
use thiserror::Error;

use crate::oplog::OpType;

/// One request to the remote table service.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRequest<'a> {
    pub table: &'a str,
    pub item_id: &'a str,
    pub op_type: OpType,
    pub item: Option<&'a Value>,
}

/// Status and optional body returned by the remote service.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteResponse {
    pub status: u16,
    pub body: Option<Value>,
}

impl RemoteResponse {
    pub fn new(status: u16, body: Option<Value>) -> Self {
        Self { status, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// The request never produced a response.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("transport: {0}")]
    Unreachable(String),
}

/// Request/response transport to the remote table service.
///
/// Implementations must be callable from several threads at once: a push wave
/// issues up to `max_fanout` requests concurrently.
pub trait RemoteService: Sync {
    fn send(&self, request: &RemoteRequest<'_>) -> Result<RemoteResponse, TransportError>;

    /// Current server copy of a record, used when a precondition failure arrives
    /// without a body. The default has no way to look it up.
    fn fetch(&self, _table: &str, _item_id: &str) -> Result<Option<Value>, TransportError> {
        Ok(None)
    }
}

impl<F> RemoteService for F
where
    F: Fn(&RemoteRequest<'_>) -> Result<RemoteResponse, TransportError> + Sync,
{
    fn send(&self, request: &RemoteRequest<'_>) -> Result<RemoteResponse, TransportError> {
        self(request)
    }
}
