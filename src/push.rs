use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::mpsc::Sender;
use std::thread;

use rusqlite::Connection;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::operation_error::{ErrorCode, ErrorLog, TableOperationError};
use crate::oplog::{OpState, OpType, OperationId, OperationLog, TableOperation, atomically};
use crate::remote::{RemoteRequest, RemoteResponse, RemoteService, TransportError};
use crate::store::LocalStore;

/// Result of one operation's push, delivered to subscribers after it is committed.
#[derive(Debug, Clone, PartialEq)]
pub struct PushOutcome {
    pub operation_id: OperationId,
    pub table: String,
    pub item_id: String,
    pub op_type: OpType,
    /// `None` on success, otherwise the classified failure.
    pub error: Option<ErrorCode>,
}

impl PushOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// What happened on the wire for one operation.
#[derive(Debug)]
pub(crate) enum Attempt {
    /// Rejected before sending.
    Invalid(String),
    Responded {
        response: RemoteResponse,
        /// Server copy fetched separately for a bodiless precondition failure.
        fetched: Option<Value>,
    },
    Failed(TransportError),
}

/// Classified completion of an attempt.
#[derive(Debug)]
pub(crate) enum Completion {
    Success(Option<Value>),
    Failure(TableOperationError),
}

/// Check the payload and send one operation.
pub(crate) fn attempt<R: RemoteService>(remote: &R, op: &TableOperation) -> Attempt {
    if op.op_type != OpType::Delete && !matches!(op.item, Some(Value::Object(_))) {
        return Attempt::Invalid(format!(
            "{} of {}/{} has no record payload",
            op.op_type.as_str(),
            op.table,
            op.item_id
        ));
    }

    let request = RemoteRequest {
        table: &op.table,
        item_id: &op.item_id,
        op_type: op.op_type,
        item: op.item.as_ref(),
    };
    let response = match remote.send(&request) {
        Ok(r) => r,
        Err(e) => return Attempt::Failed(e),
    };

    let mut fetched = None;
    if response.status == 412 && !matches!(response.body, Some(Value::Object(_))) {
        match remote.fetch(&op.table, &op.item_id) {
            Ok(item) => fetched = item,
            Err(e) => warn!(
                table = %op.table,
                item_id = %op.item_id,
                error = %e,
                "could not fetch server item for conflict"
            ),
        }
    }
    Attempt::Responded { response, fetched }
}

/// Turn an attempt into success or a [`TableOperationError`].
pub(crate) fn classify(op: &TableOperation, attempt: Attempt) -> Completion {
    match attempt {
        Attempt::Invalid(reason) => Completion::Failure(TableOperationError::new(
            op,
            None,
            ErrorCode::InvalidItem,
            None,
            None,
            reason,
        )),
        Attempt::Failed(e) => Completion::Failure(TableOperationError::new(
            op,
            op.item.clone(),
            ErrorCode::NetworkFailure,
            None,
            None,
            e.to_string(),
        )),
        Attempt::Responded { response, .. } if response.is_success() => {
            Completion::Success(response.body)
        }
        Attempt::Responded { response, fetched } => {
            let code = ErrorCode::from_status(response.status);
            let description = describe(&response);
            let server_item = if code.is_conflict() {
                match response.body {
                    Some(body @ Value::Object(_)) => Some(body),
                    _ => fetched,
                }
            } else {
                None
            };
            Completion::Failure(TableOperationError::new(
                op,
                op.item.clone(),
                code,
                Some(response.status),
                server_item,
                description,
            ))
        }
    }
}

fn describe(response: &RemoteResponse) -> String {
    let from_body = response.body.as_ref().and_then(|b| {
        ["message", "error"]
            .iter()
            .find_map(|k| b.get(*k).and_then(Value::as_str))
            .map(str::to_string)
    });
    from_body.unwrap_or_else(|| format!("remote service returned status {}", response.status))
}

pub(crate) fn lock(
    conn: &Mutex<Connection>,
) -> Result<std::sync::MutexGuard<'_, Connection>, SyncError> {
    conn.lock()
        .map_err(|_| SyncError::invalid_state("connection mutex poisoned"))
}

/// One drain of the operation log against the remote service.
pub(crate) struct PushPipeline<'a, S, R> {
    pub conn: &'a Mutex<Connection>,
    pub store: &'a S,
    pub remote: &'a R,
    pub config: &'a SyncConfig,
    pub subscribers: &'a Mutex<Vec<Sender<PushOutcome>>>,
}

impl<S: LocalStore, R: RemoteService> PushPipeline<'_, S, R> {
    pub fn run(&self) -> Result<Vec<TableOperationError>, SyncError> {
        let mut attempted: HashSet<OperationId> = HashSet::new();
        let mut errors = Vec::new();
        let mut succeeded = 0usize;

        loop {
            let budget = self.config.max_pass_operations.saturating_sub(attempted.len());
            let limit = self.config.fanout().min(budget);
            if limit == 0 {
                debug!(attempted = attempted.len(), "push pass hit its operation budget");
                break;
            }

            let wave = self.claim_wave(limit, &attempted)?;
            if wave.is_empty() {
                break;
            }
            attempted.extend(wave.iter().map(|op| op.id.clone()));

            let attempts = self.dispatch(&wave);
            let outcomes = self.complete(&wave, attempts, &mut errors)?;
            succeeded += outcomes.iter().filter(|o| o.succeeded()).count();
            self.notify(outcomes);
        }

        info!(
            attempted = attempted.len(),
            succeeded,
            failed = errors.len(),
            "push finished"
        );
        Ok(errors)
    }

    /// Select the next wave and mark it in flight.
    fn claim_wave(
        &self,
        limit: usize,
        attempted: &HashSet<OperationId>,
    ) -> Result<Vec<TableOperation>, SyncError> {
        let conn = lock(self.conn)?;
        atomically(&conn, |c| {
            let log = OperationLog::new(c);
            let wave = log.next_wave(limit, attempted)?;
            for op in &wave {
                log.set_state(&op.id, OpState::InFlight)?;
            }
            Ok(wave)
        })
    }

    /// Send a wave, concurrently when it holds more than one operation.
    fn dispatch(&self, wave: &[TableOperation]) -> Vec<Attempt> {
        if let [op] = wave {
            return vec![attempt(self.remote, op)];
        }
        let remote = self.remote;
        thread::scope(|s| {
            let handles: Vec<_> = wave
                .iter()
                .map(|op| s.spawn(move || attempt(remote, op)))
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join().unwrap_or_else(|_| {
                        let reason = "request thread panicked".to_string();
                        Attempt::Failed(TransportError::Unreachable(reason))
                    })
                })
                .collect()
        })
    }

    /// Apply a wave's results to the log, error set and local store in one transaction.
    fn complete(
        &self,
        wave: &[TableOperation],
        attempts: Vec<Attempt>,
        errors: &mut Vec<TableOperationError>,
    ) -> Result<Vec<PushOutcome>, SyncError> {
        let conn = lock(self.conn)?;
        let mut new_errors = Vec::new();
        let outcomes = atomically(&conn, |c| {
            let log = OperationLog::new(c);
            let error_log = ErrorLog::new(c);
            let mut outcomes = Vec::with_capacity(wave.len());

            for (op, attempt) in wave.iter().zip(attempts) {
                if log.get(&op.id)?.is_none() {
                    debug!(op_id = %op.id, "operation vanished while in flight; dropping result");
                    continue;
                }
                let error = match classify(op, attempt) {
                    Completion::Success(body) => {
                        log.remove(&op.id)?;
                        error_log.evict_for_operation(&op.id)?;
                        if op.op_type != OpType::Delete {
                            if let Some(body @ Value::Object(_)) = body {
                                if !log.has_followup(&op.table, &op.item_id, op.seq)? {
                                    self.store.write(c, &op.table, &op.item_id, &body)?;
                                }
                            }
                        }
                        debug!(op_id = %op.id, table = %op.table, item_id = %op.item_id, "pushed");
                        None
                    }
                    Completion::Failure(err) => {
                        log.set_state(&op.id, OpState::Errored)?;
                        error_log.evict_for_operation(&op.id)?;
                        error_log.save(&err)?;
                        warn!(
                            op_id = %op.id,
                            table = %op.table,
                            item_id = %op.item_id,
                            code = ?err.code(),
                            status = ?err.status_code(),
                            "push failed: {}",
                            err.description()
                        );
                        let code = err.code();
                        new_errors.push(err);
                        Some(code)
                    }
                };
                outcomes.push(PushOutcome {
                    operation_id: op.id.clone(),
                    table: op.table.clone(),
                    item_id: op.item_id.clone(),
                    op_type: op.op_type,
                    error,
                });
            }
            Ok(outcomes)
        });

        match outcomes {
            Ok(outcomes) => {
                errors.extend(new_errors);
                Ok(outcomes)
            }
            Err(e) => {
                // The transaction rolled back; leave the wave queued for the next push.
                let requeue = atomically(&conn, |c| {
                    let log = OperationLog::new(c);
                    for op in wave {
                        log.set_state(&op.id, OpState::Pending)?;
                    }
                    Ok(())
                });
                if let Err(re) = requeue {
                    warn!(error = %re, "could not re-queue wave after failed completion");
                }
                Err(e)
            }
        }
    }

    fn notify(&self, outcomes: Vec<PushOutcome>) {
        if outcomes.is_empty() {
            return;
        }
        let Ok(mut subs) = self.subscribers.lock() else {
            return;
        };
        subs.retain(|tx| outcomes.iter().all(|o| tx.send(o.clone()).is_ok()));
    }
}
