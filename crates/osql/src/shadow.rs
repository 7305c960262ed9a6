//! Shadow buffer: the transaction-local log of row operations.
//!
//! Every operation a session accepts is appended here in issue order. The
//! buffer is the source of truth for replay after a master swing, and for
//! modes that do not stream it is what gets shipped at commit.
//!
//! Operations are stored already rendered for the wire: partial-index
//! filtering and blob "not used" substitution happened when the operation
//! was accepted, so a replay sends exactly what the live path sent.

use bytes::Bytes;
use osql_types::Genid;
use thiserror::Error;

use crate::error::OsqlResult;
use crate::message::{
    BlobPayload, BpfuncCall, KeyMask, OsqlMessage, ReadEntry, ReadKind, SchemaChange, TableTarget,
};

// ============================================================================
// Row operations
// ============================================================================

/// One index key shipped for a row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexKey {
    pub index: u32,
    pub key: Bytes,
}

/// One blob column shipped for a row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobSend {
    pub index: u32,
    pub payload: BlobPayload,
}

/// A buffered row-level operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowOp {
    Insert {
        target: TableTarget,
        genid: Genid,
        ins_keys: KeyMask,
        row: Bytes,
        flags: u32,
    },
    Update {
        target: TableTarget,
        genid: Genid,
        ins_keys: KeyMask,
        del_keys: KeyMask,
        row: Bytes,
        flags: u32,
    },
    Delete {
        target: TableTarget,
        genid: Genid,
        del_keys: KeyMask,
    },
    Index {
        target: TableTarget,
        genid: Genid,
        is_delete: bool,
        keys: Vec<IndexKey>,
    },
    Blobs {
        target: TableTarget,
        genid: Genid,
        blobs: Vec<BlobSend>,
    },
    UpdateCols {
        target: TableTarget,
        genid: Genid,
        columns: Vec<i32>,
    },
    RecordGenid {
        target: TableTarget,
        genid: Genid,
    },
    DbqConsume {
        queue: TableTarget,
        genid: Genid,
    },
    UpdateStat {
        genid: Genid,
        row: Bytes,
        stat_index: i32,
    },
    SchemaChange {
        change: SchemaChange,
        /// Table announced before the change; `None` for a view with no shard.
        target: Option<TableTarget>,
    },
    Bpfunc(BpfuncCall),
}

impl RowOp {
    /// Table the operation must be preceded by a "use database" for.
    pub fn target(&self) -> Option<&TableTarget> {
        match self {
            Self::Insert { target, .. }
            | Self::Update { target, .. }
            | Self::Delete { target, .. }
            | Self::Index { target, .. }
            | Self::Blobs { target, .. }
            | Self::UpdateCols { target, .. }
            | Self::RecordGenid { target, .. } => Some(target),
            Self::DbqConsume { queue, .. } => Some(queue),
            Self::SchemaChange { target, .. } => target.as_ref(),
            Self::UpdateStat { .. } | Self::Bpfunc(_) => None,
        }
    }

    /// Whether this operation was counted by admission control.
    pub fn is_admitted(&self) -> bool {
        matches!(
            self,
            Self::Insert { .. } | Self::Update { .. } | Self::Delete { .. } | Self::Index { .. }
        )
    }

    /// Messages for this operation, excluding the "use database" directive.
    pub fn messages(&self) -> Vec<OsqlMessage> {
        match self {
            Self::Insert {
                genid,
                ins_keys,
                row,
                flags,
                ..
            } => vec![OsqlMessage::Insert {
                genid: *genid,
                ins_keys: *ins_keys,
                row: row.clone(),
                flags: *flags,
            }],
            Self::Update {
                genid,
                ins_keys,
                del_keys,
                row,
                flags,
                ..
            } => vec![OsqlMessage::Update {
                genid: *genid,
                ins_keys: *ins_keys,
                del_keys: *del_keys,
                row: row.clone(),
                flags: *flags,
            }],
            Self::Delete {
                genid, del_keys, ..
            } => vec![OsqlMessage::Delete {
                genid: *genid,
                del_keys: *del_keys,
            }],
            Self::Index {
                genid,
                is_delete,
                keys,
                ..
            } => keys
                .iter()
                .map(|k| OsqlMessage::Index {
                    genid: *genid,
                    is_delete: *is_delete,
                    index: k.index,
                    key: k.key.clone(),
                })
                .collect(),
            Self::Blobs { genid, blobs, .. } => blobs
                .iter()
                .map(|b| OsqlMessage::Blob {
                    genid: *genid,
                    index: b.index,
                    payload: b.payload.clone(),
                })
                .collect(),
            Self::UpdateCols { genid, columns, .. } => vec![OsqlMessage::UpdateCols {
                genid: *genid,
                columns: columns.clone(),
            }],
            Self::RecordGenid { genid, .. } => vec![OsqlMessage::RecordGenid { genid: *genid }],
            Self::DbqConsume { genid, .. } => vec![OsqlMessage::DbqConsume { genid: *genid }],
            Self::UpdateStat {
                genid,
                row,
                stat_index,
            } => vec![OsqlMessage::UpdateStat {
                genid: *genid,
                row: row.clone(),
                stat_index: *stat_index,
            }],
            Self::SchemaChange { change, .. } => vec![OsqlMessage::SchemaChange(change.clone())],
            Self::Bpfunc(call) => vec![OsqlMessage::Bpfunc(call.clone())],
        }
    }
}

// ============================================================================
// Trait
// ============================================================================

/// Errors from the shadow buffer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShadowError {
    #[error("transaction too big: {ops} operations buffered")]
    TooBig { ops: u64 },

    #[error("schema change conflict: {0}")]
    SchemaChange(String),

    #[error("shadow buffer is closed")]
    Closed,

    #[error("shadow storage error: {0}")]
    Storage(String),
}

/// Transaction-local operation log.
///
/// Owned and mutated by the single thread driving the session.
pub trait ShadowBuffer: Send {
    /// Appends an operation after every operation appended so far.
    fn append(&mut self, op: RowOp) -> Result<(), ShadowError>;

    /// Feeds every buffered operation to `sink`, in append order, stopping at
    /// the first error. Returns the number of operations replayed.
    fn replay(&mut self, sink: &mut dyn FnMut(&RowOp) -> OsqlResult<()>) -> OsqlResult<usize>;

    /// Records a row read under the given read kind.
    fn record_read(&mut self, kind: ReadKind, entry: ReadEntry) -> Result<(), ShadowError>;

    /// Recorded read set of the given kind.
    fn read_set(&self, kind: ReadKind) -> Vec<ReadEntry>;

    /// Whether `SELECT ... FOR UPDATE` rows are still outstanding.
    fn has_pending_read_set(&self) -> Result<bool, ShadowError>;

    /// Discards all buffered state. Idempotent.
    fn close(&mut self);

    /// Number of buffered operations.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// In-memory implementation
// ============================================================================

/// Vec-backed [`ShadowBuffer`].
#[derive(Debug, Default)]
pub struct MemoryShadowBuffer {
    ops: Vec<RowOp>,
    serial_reads: Vec<ReadEntry>,
    select_for_update: Vec<ReadEntry>,
    closed: bool,
    replay_failure: Option<ShadowError>,
}

impl MemoryShadowBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffered operations, in append order.
    pub fn ops(&self) -> &[RowOp] {
        &self.ops
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Makes the next replay fail with `err` before sending anything.
    pub fn fail_next_replay(&mut self, err: ShadowError) {
        self.replay_failure = Some(err);
    }
}

impl ShadowBuffer for MemoryShadowBuffer {
    fn append(&mut self, op: RowOp) -> Result<(), ShadowError> {
        // A closed buffer reopens for the next transaction.
        self.closed = false;
        self.ops.push(op);
        Ok(())
    }

    fn replay(&mut self, sink: &mut dyn FnMut(&RowOp) -> OsqlResult<()>) -> OsqlResult<usize> {
        if let Some(err) = self.replay_failure.take() {
            return Err(err.into());
        }
        for (replayed, op) in self.ops.iter().enumerate() {
            if let Err(err) = sink(op) {
                tracing::debug!(replayed, error = %err, "shadow replay stopped");
                return Err(err);
            }
        }
        Ok(self.ops.len())
    }

    fn record_read(&mut self, kind: ReadKind, entry: ReadEntry) -> Result<(), ShadowError> {
        self.closed = false;
        match kind {
            ReadKind::Serial => self.serial_reads.push(entry),
            ReadKind::SelectForUpdate => self.select_for_update.push(entry),
        }
        Ok(())
    }

    fn read_set(&self, kind: ReadKind) -> Vec<ReadEntry> {
        match kind {
            ReadKind::Serial => self.serial_reads.clone(),
            ReadKind::SelectForUpdate => self.select_for_update.clone(),
        }
    }

    fn has_pending_read_set(&self) -> Result<bool, ShadowError> {
        Ok(!self.select_for_update.is_empty())
    }

    fn close(&mut self) {
        self.ops.clear();
        self.serial_reads.clear();
        self.select_for_update.clear();
        self.replay_failure = None;
        self.closed = true;
    }

    fn len(&self) -> usize {
        self.ops.len()
    }
}
