use std::path::Path;
use std::sync::mpsc::{self, Receiver};
use std::sync::{Mutex, TryLockError};

use rusqlite::Connection;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::operation_error::{ErrorLog, TableOperationError};
use crate::oplog::{Enqueued, OpState, OpType, OperationLog, TableOperation, atomically};
use crate::push::{PushOutcome, PushPipeline, lock};
use crate::remote::RemoteService;
use crate::store::{LocalStore, SqliteStore};

enum Resolution<'a> {
    Update(&'a Value),
    Discard,
}

/// Owns the operation log, the local store and the outstanding error set.
///
/// Every log or store mutation goes through one connection mutex. A push pass
/// and conflict resolution additionally hold the push gate, so only one pass
/// runs at a time and a resolution never overlaps a pass that might be
/// sending the same operation. Local mutations only take the connection
/// mutex and can interleave with a running push.
pub struct SyncContext<S, R> {
    conn: Mutex<Connection>,
    push_gate: Mutex<()>,
    store: S,
    remote: R,
    config: SyncConfig,
    subscribers: Mutex<Vec<mpsc::Sender<PushOutcome>>>,
}

impl<R: RemoteService> SyncContext<SqliteStore, R> {
    /// Open (or create) a database file and keep records in it as JSON documents.
    pub fn open(
        path: impl AsRef<Path>,
        remote: R,
        config: SyncConfig,
    ) -> Result<Self, SyncError> {
        let conn = Connection::open(path)?;
        SqliteStore::init_schema(&conn)?;
        Self::new(conn, SqliteStore, remote, config)
    }
}

impl<S: LocalStore, R: RemoteService> SyncContext<S, R> {
    /// Bind to a connection, creating metadata tables and re-queuing
    /// operations a previous process left in flight.
    pub fn new(
        conn: Connection,
        store: S,
        remote: R,
        config: SyncConfig,
    ) -> Result<Self, SyncError> {
        let log = OperationLog::new(&conn);
        log.init_schema()?;
        log.recover_in_flight()?;
        Ok(Self {
            conn: Mutex::new(conn),
            push_gate: Mutex::new(()),
            store,
            remote,
            config,
            subscribers: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    /// Store a new record locally and queue its insert.
    pub fn insert(&self, table: &str, item_id: &str, item: Value) -> Result<Enqueued, SyncError> {
        self.mutate(table, item_id, OpType::Insert, Some(item))
    }

    /// Overwrite a record locally and queue its update.
    pub fn update(&self, table: &str, item_id: &str, item: Value) -> Result<Enqueued, SyncError> {
        self.mutate(table, item_id, OpType::Update, Some(item))
    }

    /// Remove a record locally and queue its delete. The last local copy is
    /// sent along so the server can check its version.
    pub fn delete(&self, table: &str, item_id: &str) -> Result<Enqueued, SyncError> {
        self.mutate(table, item_id, OpType::Delete, None)
    }

    fn mutate(
        &self,
        table: &str,
        item_id: &str,
        op_type: OpType,
        item: Option<Value>,
    ) -> Result<Enqueued, SyncError> {
        let conn = lock(&self.conn)?;
        atomically(&conn, |c| {
            let payload = match op_type {
                OpType::Delete => {
                    let prior = self.store.read(c, table, item_id)?;
                    self.store.delete(c, table, item_id)?;
                    prior
                }
                OpType::Insert | OpType::Update => {
                    let item = item.as_ref().ok_or_else(|| SyncError::InvalidOperation {
                        table: table.to_string(),
                        item_id: item_id.to_string(),
                        reason: "missing record payload",
                    })?;
                    self.store.write(c, table, item_id, item)?;
                    Some(item.clone())
                }
            };
            OperationLog::new(c).enqueue(table, item_id, op_type, payload.as_ref())
        })
    }

    /// Local copy of a record.
    pub fn read(&self, table: &str, item_id: &str) -> Result<Option<Value>, SyncError> {
        let conn = lock(&self.conn)?;
        self.store.read(&conn, table, item_id)
    }

    /// Queued operations in drain order, optionally for one table.
    pub fn pending_operations(
        &self,
        table: Option<&str>,
    ) -> Result<Vec<TableOperation>, SyncError> {
        let conn = lock(&self.conn)?;
        OperationLog::new(&conn).list_pending(table)
    }

    /// Send every eligible queued operation. Failures come back as values;
    /// `Err` means local infrastructure failed or another push is running.
    pub fn push(&self) -> Result<Vec<TableOperationError>, SyncError> {
        let _gate = match self.push_gate.try_lock() {
            Ok(g) => g,
            Err(TryLockError::WouldBlock) => return Err(SyncError::PushInProgress),
            Err(TryLockError::Poisoned(_)) => {
                return Err(SyncError::invalid_state("push gate poisoned"));
            }
        };
        PushPipeline {
            conn: &self.conn,
            store: &self.store,
            remote: &self.remote,
            config: &self.config,
            subscribers: &self.subscribers,
        }
        .run()
    }

    /// Unresolved errors, oldest first. Survives restarts.
    pub fn outstanding_errors(&self) -> Result<Vec<TableOperationError>, SyncError> {
        let conn = lock(&self.conn)?;
        ErrorLog::new(&conn).outstanding()
    }

    /// Receive a [`PushOutcome`] for every operation a push completes.
    pub fn subscribe(&self) -> Receiver<PushOutcome> {
        let (tx, rx) = mpsc::channel();
        match self.subscribers.lock() {
            Ok(mut subs) => subs.push(tx),
            Err(poisoned) => poisoned.into_inner().push(tx),
        }
        rx
    }

    /// Accept `item` as the record's state: drop the operation, write `item`
    /// to the local store, and evict the error.
    pub fn cancel_and_update_item(
        &self,
        error: &mut TableOperationError,
        item: Value,
    ) -> Result<(), SyncError> {
        self.resolve(error, Resolution::Update(&item))
    }

    /// Drop the operation and the local record, and evict the error.
    pub fn cancel_and_discard_item(
        &self,
        error: &mut TableOperationError,
    ) -> Result<(), SyncError> {
        self.resolve(error, Resolution::Discard)
    }

    fn resolve(
        &self,
        error: &mut TableOperationError,
        action: Resolution<'_>,
    ) -> Result<(), SyncError> {
        if error.is_handled() {
            return Err(SyncError::invalid_state(format!(
                "error {} already handled",
                error.guid()
            )));
        }
        let _gate = self
            .push_gate
            .lock()
            .map_err(|_| SyncError::invalid_state("push gate poisoned"))?;
        let conn = lock(&self.conn)?;

        atomically(&conn, |c| {
            let errors = ErrorLog::new(c);
            if !errors.contains(error.guid())? {
                return Err(SyncError::invalid_state(format!(
                    "error {} is no longer outstanding",
                    error.guid()
                )));
            }
            let log = OperationLog::new(c);
            if log.get(error.operation_id())?.is_none() {
                return Err(SyncError::invalid_state(format!(
                    "operation {} is no longer in the log",
                    error.operation_id()
                )));
            }
            // Follow-ups queued behind the failed operation go with it.
            let removed = log.remove_for_record(error.table(), error.item_id())?;
            match action {
                Resolution::Update(item) => {
                    self.store.write(c, error.table(), error.item_id(), item)?
                }
                Resolution::Discard => self.store.delete(c, error.table(), error.item_id())?,
            }
            for op_id in &removed {
                errors.evict_for_operation(op_id)?;
            }
            Ok(())
        })?;

        error.mark_handled();
        info!(
            guid = error.guid(),
            op_id = %error.operation_id(),
            table = error.table(),
            item_id = error.item_id(),
            "resolved operation error"
        );
        Ok(())
    }

    /// Mark an error handled without touching the log or the store. The
    /// operation is retried by the next push.
    pub fn dismiss_error(&self, error: &mut TableOperationError) -> Result<(), SyncError> {
        if error.is_handled() {
            return Err(SyncError::invalid_state(format!(
                "error {} already handled",
                error.guid()
            )));
        }
        let conn = lock(&self.conn)?;
        atomically(&conn, |c| {
            let errors = ErrorLog::new(c);
            if !errors.evict(error.guid())? {
                return Err(SyncError::invalid_state(format!(
                    "error {} is no longer outstanding",
                    error.guid()
                )));
            }
            let log = OperationLog::new(c);
            if let Some(op) = log.get(error.operation_id())? {
                if op.state == OpState::Errored && errors.count_for_operation(&op.id)? == 0 {
                    log.set_state(&op.id, OpState::Pending)?;
                }
            }
            Ok(())
        })?;
        error.mark_handled();
        debug!(guid = error.guid(), "dismissed operation error");
        Ok(())
    }

    /// Page remote records of `table` into the local store. `fetch` receives
    /// the stored cursor and the page size and returns records plus the next
    /// cursor. Records with queued local operations are left alone; records
    /// flagged `"deleted": true` are removed. Returns the number applied.
    pub fn pull<G>(&self, query_id: &str, table: &str, mut fetch: G) -> Result<usize, SyncError>
    where
        G: FnMut(Option<&str>, usize) -> Result<(Vec<Value>, Option<String>), SyncError>,
    {
        let mut applied = 0;
        let mut cursor = {
            let conn = lock(&self.conn)?;
            OperationLog::new(&conn).get_cursor(query_id)?
        };

        loop {
            let (records, next) = fetch(cursor.as_deref(), self.config.pull_page_limit)?;
            let conn = lock(&self.conn)?;
            applied += atomically(&conn, |c| {
                let log = OperationLog::new(c);
                let mut n = 0;
                for record in &records {
                    let Some(item_id) = record.get("id").and_then(Value::as_str) else {
                        warn!(table, "pulled record without a string id; skipping");
                        continue;
                    };
                    if log.has_live(table, item_id)? {
                        debug!(table, item_id, "pending local operation; keeping local copy");
                        continue;
                    }
                    if record.get("deleted").and_then(Value::as_bool) == Some(true) {
                        self.store.delete(c, table, item_id)?;
                    } else {
                        self.store.write(c, table, item_id, record)?;
                    }
                    n += 1;
                }
                if let Some(next) = &next {
                    log.set_cursor(query_id, next)?;
                }
                Ok(n)
            })?;

            if records.is_empty() || next.is_none() || next == cursor {
                break;
            }
            cursor = next;
        }
        debug!(query_id, table, applied, "pull finished");
        Ok(applied)
    }

    /// Run one full sync cycle: push local changes, then pull `table`.
    pub fn sync_cycle<G>(
        &self,
        query_id: &str,
        table: &str,
        fetch: G,
    ) -> Result<Vec<TableOperationError>, SyncError>
    where
        G: FnMut(Option<&str>, usize) -> Result<(Vec<Value>, Option<String>), SyncError>,
    {
        let errors = self.push()?;
        self.pull(query_id, table, fetch)?;
        Ok(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation_error::ErrorCode;
    use crate::remote::{RemoteRequest, RemoteResponse, TransportError};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    type Reply = fn(&RemoteRequest<'_>) -> Result<RemoteResponse, TransportError>;

    fn ctx(reply: Reply) -> SyncContext<SqliteStore, Reply> {
        let conn = Connection::open_in_memory().unwrap();
        SqliteStore::init_schema(&conn).unwrap();
        SyncContext::new(conn, SqliteStore, reply, SyncConfig::default()).unwrap()
    }

    fn ok(_: &RemoteRequest<'_>) -> Result<RemoteResponse, TransportError> {
        Ok(RemoteResponse::new(200, None))
    }

    fn conflict(req: &RemoteRequest<'_>) -> Result<RemoteResponse, TransportError> {
        Ok(RemoteResponse::new(
            412,
            Some(json!({"id": req.item_id, "name": "B", "version": 2})),
        ))
    }

    fn offline(_: &RemoteRequest<'_>) -> Result<RemoteResponse, TransportError> {
        Err(TransportError::Unreachable("no route".into()))
    }

    #[test]
    fn local_mutations_write_store_and_queue() {
        let ctx = ctx(ok);
        ctx.insert("t", "1", json!({"id": "1", "n": 1})).unwrap();
        ctx.update("t", "1", json!({"id": "1", "n": 2})).unwrap();
        assert_eq!(ctx.read("t", "1").unwrap(), Some(json!({"id": "1", "n": 2})));

        let ops = ctx.pending_operations(None).unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].op_type, OpType::Insert);

        ctx.delete("t", "1").unwrap();
        assert_eq!(ctx.read("t", "1").unwrap(), None);
        assert!(ctx.pending_operations(None).unwrap().is_empty());
    }

    #[test]
    fn rejected_mutation_rolls_back_store_write() {
        let ctx = ctx(ok);
        ctx.insert("t", "1", json!({"id": "1", "n": 1})).unwrap();
        let err = ctx.insert("t", "1", json!({"id": "1", "n": 9})).unwrap_err();
        assert!(matches!(err, SyncError::InvalidOperation { .. }));
        assert_eq!(ctx.read("t", "1").unwrap(), Some(json!({"id": "1", "n": 1})));
    }

    #[test]
    fn delete_carries_last_local_copy() {
        let ctx = ctx(ok);
        {
            let conn = lock(&ctx.conn).unwrap();
            SqliteStore.write(&conn, "t", "1", &json!({"id": "1", "version": 3})).unwrap();
        }
        ctx.delete("t", "1").unwrap();
        let ops = ctx.pending_operations(Some("t")).unwrap();
        assert_eq!(ops[0].op_type, OpType::Delete);
        assert_eq!(ops[0].item, Some(json!({"id": "1", "version": 3})));
    }

    #[test]
    fn conflict_then_accept_server_version() {
        let ctx = ctx(conflict);
        ctx.insert("t", "42", json!({"id": "42", "name": "A"})).unwrap();

        let errors = ctx.push().unwrap();
        assert_eq!(errors.len(), 1);
        let mut e = errors.into_iter().next().unwrap();
        assert_eq!(e.code(), ErrorCode::PreconditionFailed);
        assert_eq!(e.status_code(), Some(412));
        let server = e.server_item().cloned().unwrap();
        assert_eq!(server, json!({"id": "42", "name": "B", "version": 2}));

        e.cancel_and_update_item(&ctx, server.clone()).unwrap();
        assert!(e.is_handled());
        assert_eq!(ctx.read("t", "42").unwrap(), Some(server.clone()));
        assert!(ctx.pending_operations(None).unwrap().is_empty());
        assert!(ctx.outstanding_errors().unwrap().is_empty());

        let again = e.cancel_and_discard_item(&ctx).unwrap_err();
        assert!(again.is_invalid_state());
    }

    #[test]
    fn errored_operation_is_skipped_until_resolved() {
        let ctx = ctx(conflict);
        ctx.update("t", "1", json!({"id": "1"})).unwrap();
        assert_eq!(ctx.push().unwrap().len(), 1);
        assert!(ctx.push().unwrap().is_empty());
        assert_eq!(ctx.outstanding_errors().unwrap().len(), 1);

        let mut e = ctx.outstanding_errors().unwrap().remove(0);
        ctx.cancel_and_discard_item(&mut e).unwrap();
        assert_eq!(ctx.read("t", "1").unwrap(), None);
        assert!(ctx.pending_operations(None).unwrap().is_empty());
    }

    #[test]
    fn transient_failure_is_parked_until_dismissed() {
        let ctx = ctx(offline);
        ctx.insert("t", "1", json!({"id": "1"})).unwrap();
        let errors = ctx.push().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code(), ErrorCode::NetworkFailure);
        assert_eq!(errors[0].status_code(), None);

        let ops = ctx.pending_operations(None).unwrap();
        assert_eq!(ops[0].state, OpState::Errored);
        assert!(ctx.push().unwrap().is_empty());

        let mut e = ctx.outstanding_errors().unwrap().remove(0);
        ctx.dismiss_error(&mut e).unwrap();
        // retried once dismissed; the new failure is the only outstanding one
        assert_eq!(ctx.push().unwrap().len(), 1);
        assert_eq!(ctx.outstanding_errors().unwrap().len(), 1);
    }

    /// Store that starts refusing writes once `broken` is set.
    #[derive(Default)]
    struct BreakableStore {
        broken: AtomicBool,
    }

    impl BreakableStore {
        fn check(&self) -> Result<(), SyncError> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(SyncError::Store("disk full".into()));
            }
            Ok(())
        }
    }

    impl LocalStore for BreakableStore {
        fn read(
            &self,
            conn: &Connection,
            table: &str,
            item_id: &str,
        ) -> Result<Option<Value>, SyncError> {
            SqliteStore.read(conn, table, item_id)
        }

        fn write(
            &self,
            conn: &Connection,
            table: &str,
            item_id: &str,
            record: &Value,
        ) -> Result<(), SyncError> {
            self.check()?;
            SqliteStore.write(conn, table, item_id, record)
        }

        fn delete(
            &self,
            conn: &Connection,
            table: &str,
            item_id: &str,
        ) -> Result<(), SyncError> {
            self.check()?;
            SqliteStore.delete(conn, table, item_id)
        }
    }

    #[test]
    fn store_failure_during_resolution_leaves_error_unhandled() {
        let conn = Connection::open_in_memory().unwrap();
        SqliteStore::init_schema(&conn).unwrap();
        let store = BreakableStore::default();
        let ctx = SyncContext::new(conn, store, conflict as Reply, SyncConfig::default()).unwrap();
        ctx.insert("t", "42", json!({"id": "42", "name": "A"})).unwrap();
        let mut e = ctx.push().unwrap().remove(0);
        let server = e.server_item().cloned().unwrap();

        ctx.store.broken.store(true, Ordering::SeqCst);
        let err = ctx.cancel_and_update_item(&mut e, server.clone()).unwrap_err();
        assert!(matches!(err, SyncError::Store(_)));
        assert!(!e.is_handled());
        assert_eq!(ctx.pending_operations(None).unwrap().len(), 1);
        assert_eq!(ctx.outstanding_errors().unwrap()[0].guid(), e.guid());
        assert!(matches!(
            ctx.cancel_and_discard_item(&mut e),
            Err(SyncError::Store(_))
        ));
        assert_eq!(ctx.read("t", "42").unwrap(), Some(json!({"id": "42", "name": "A"})));

        ctx.store.broken.store(false, Ordering::SeqCst);
        ctx.cancel_and_update_item(&mut e, server.clone()).unwrap();
        assert!(e.is_handled());
        assert_eq!(ctx.read("t", "42").unwrap(), Some(server));
    }

    #[test]
    fn dismissed_error_requeues_operation() {
        let ctx = ctx(conflict);
        ctx.update("t", "1", json!({"id": "1"})).unwrap();
        let mut e = ctx.push().unwrap().remove(0);
        ctx.dismiss_error(&mut e).unwrap();
        assert!(e.is_handled());
        assert!(ctx.outstanding_errors().unwrap().is_empty());
        assert_eq!(ctx.pending_operations(None).unwrap()[0].state, OpState::Pending);
        assert!(ctx.dismiss_error(&mut e).unwrap_err().is_invalid_state());
    }

    #[test]
    fn superseded_error_cannot_be_resolved() {
        let ctx = ctx(conflict);
        ctx.update("t", "1", json!({"id": "1", "n": 1})).unwrap();
        let mut old = ctx.push().unwrap().remove(0);
        // a fresh local edit re-queues the errored operation
        ctx.update("t", "1", json!({"id": "1", "n": 2})).unwrap();
        let mut newer = ctx.push().unwrap().remove(0);

        assert!(ctx.cancel_and_discard_item(&mut old).unwrap_err().is_invalid_state());
        assert!(!old.is_handled());
        ctx.cancel_and_discard_item(&mut newer).unwrap();
    }

    #[test]
    fn cancelled_operation_takes_its_error_with_it() {
        let ctx = ctx(conflict);
        ctx.insert("t", "1", json!({"id": "1"})).unwrap();
        let mut e = ctx.push().unwrap().remove(0);
        ctx.delete("t", "1").unwrap();
        assert!(ctx.outstanding_errors().unwrap().is_empty());
        let err = ctx.cancel_and_update_item(&mut e, json!({"id": "1"})).unwrap_err();
        assert!(err.is_invalid_state());
    }

    #[test]
    fn successful_push_stores_server_body() {
        fn created(req: &RemoteRequest<'_>) -> Result<RemoteResponse, TransportError> {
            let mut body = req.item.cloned().unwrap_or_default();
            body["version"] = json!(1);
            Ok(RemoteResponse::new(201, Some(body)))
        }
        let ctx = ctx(created);
        let rx = ctx.subscribe();
        ctx.insert("t", "1", json!({"id": "1"})).unwrap();
        assert!(ctx.push().unwrap().is_empty());
        assert_eq!(ctx.read("t", "1").unwrap(), Some(json!({"id": "1", "version": 1})));

        let outcome = rx.try_recv().unwrap();
        assert!(outcome.succeeded());
        assert_eq!(outcome.item_id, "1");
    }

    #[test]
    fn pull_skips_records_with_pending_operations() {
        let ctx = ctx(ok);
        ctx.update("t", "1", json!({"id": "1", "local": true})).unwrap();

        let mut pages = vec![
            (vec![json!({"id": "1", "local": false}), json!({"id": "2"})], Some("c1".to_string())),
            (
                vec![json!({"id": "3", "deleted": true}), json!({"name": "no id"})],
                Some("c2".to_string()),
            ),
            (vec![], None),
        ]
        .into_iter();
        let mut seen = Vec::new();
        let applied = ctx
            .pull("all-t", "t", |cursor, _| {
                seen.push(cursor.map(str::to_string));
                Ok(pages.next().unwrap_or((vec![], None)))
            })
            .unwrap();

        assert_eq!(applied, 2);
        assert_eq!(seen, vec![None, Some("c1".to_string()), Some("c2".to_string())]);
        assert_eq!(ctx.read("t", "1").unwrap(), Some(json!({"id": "1", "local": true})));
        assert_eq!(ctx.read("t", "2").unwrap(), Some(json!({"id": "2"})));
        assert_eq!(ctx.read("t", "3").unwrap(), None);
    }
}
