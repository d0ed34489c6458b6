pub mod config;
pub mod error;
pub mod merge;
pub mod operation_error;
pub mod oplog;
pub mod push;
pub mod remote;
pub mod store;
pub mod sync;

pub use config::SyncConfig;
pub use error::SyncError;
pub use operation_error::{ErrorCode, SerializedError, TableOperationError};
pub use oplog::{Enqueued, OpState, OpType, OperationId, OperationLog, TableOperation};
pub use push::PushOutcome;
pub use remote::{RemoteRequest, RemoteResponse, RemoteService, TransportError};
pub use store::{LocalStore, SqliteStore};
pub use sync::SyncContext;
