use crate::oplog::OpType;

/// Outcome of folding a new local mutation into a pending operation on the same record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collapse {
    /// Keep a single operation of `op_type`; `take_incoming` selects whose payload survives.
    Merged { op_type: OpType, take_incoming: bool },
    /// Both operations disappear (insert never reached the server).
    Cancel,
    /// The mutation is not valid against the pending state of the record.
    Reject(&'static str),
}

/// Merge table for `existing` (queued, not yet dispatched) followed by `incoming`.
pub fn collapse(existing: OpType, incoming: OpType) -> Collapse {
    use OpType::*;
    match (existing, incoming) {
        (Insert, Insert) => Collapse::Reject("an insert for this item is already queued"),
        (Insert, Update) => Collapse::Merged { op_type: Insert, take_incoming: true },
        (Insert, Delete) => Collapse::Cancel,
        (Update, Insert) => Collapse::Reject("item already exists"),
        (Update, Update) => Collapse::Merged { op_type: Update, take_incoming: true },
        (Update, Delete) => Collapse::Merged { op_type: Delete, take_incoming: true },
        (Delete, Insert) => Collapse::Merged { op_type: Update, take_incoming: true },
        (Delete, Update) => Collapse::Reject("item has been deleted"),
        (Delete, Delete) => Collapse::Merged { op_type: Delete, take_incoming: false },
    }
}
