//! Offload-SQL protocol messages.
//!
//! Every message a replicant sends to the master for one session:
//!
//! ## Session control
//! - [`OsqlMessage::StartSession`] - open the session on the master
//! - [`OsqlMessage::Commit`] - commit (or, carrying an error, abort) the session
//! - [`OsqlMessage::DebugLog`] - ask the master to attach its debug log
//!
//! ## Row operations
//! - [`OsqlMessage::UseDb`] - target table for the following operations
//! - insert/update/delete, index keys, blobs, update-columns, record-genid,
//!   queue consume, stat1 updates
//!
//! ## Schema and procedures
//! - [`OsqlMessage::SchemaChange`], [`OsqlMessage::Bpfunc`]
//!
//! Payload encoding is the transport's concern; these are the typed values
//! handed to it.

use std::fmt::{self, Display};

use bytes::Bytes;
use osql_types::{ErrorRecord, Genid, RequestType, SessionKey, TableName};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Building blocks
// ============================================================================

/// Table plus the schema version the replicant executed against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableTarget {
    pub name: TableName,
    pub version: u64,
}

impl TableTarget {
    pub fn new(name: impl Into<TableName>, version: u64) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

/// One bit per index, in index-definition order, set when that index's key
/// changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyMask(u64);

impl KeyMask {
    /// Every index changed; what is sent when partial indexes are disabled.
    pub const ALL: Self = Self(u64::MAX);
    pub const NONE: Self = Self(0);

    pub fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u64 {
        self.0
    }

    /// Indexes past bit 63 are always considered changed.
    pub fn contains(self, index: u32) -> bool {
        index >= 64 || self.0 & (1u64 << index) != 0
    }
}

impl Default for KeyMask {
    fn default() -> Self {
        Self::ALL
    }
}

/// Blob column payload as shipped to the master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlobPayload {
    Data(Bytes),
    /// The update did not touch this column; the master keeps its value.
    NotUsed,
}

impl BlobPayload {
    /// Length field on the wire; "not used" is encoded as -2.
    pub const NOT_USED_LEN: i64 = -2;

    pub fn wire_len(&self) -> i64 {
        match self {
            // Blob lengths are bounded far below i64::MAX.
            #[allow(clippy::cast_possible_wrap)]
            Self::Data(bytes) => bytes.len() as i64,
            Self::NotUsed => Self::NOT_USED_LEN,
        }
    }
}

/// Schema change request forwarded to the master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaChange {
    pub table: TableName,
    /// Opaque, already-serialized change description.
    pub payload: Bytes,
    /// Session the change is bound to; `None` lets a new master resume it.
    pub bound_session: Option<SessionKey>,
}

impl SchemaChange {
    pub fn new(table: impl Into<TableName>, payload: Bytes) -> Self {
        Self {
            table: table.into(),
            payload,
            bound_session: None,
        }
    }
}

/// Stored (bplog) function call forwarded to the master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BpfuncCall {
    pub name: String,
    pub args: Bytes,
}

/// Rows the transaction changed, reported with the continuation token.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Effects {
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
}

/// Continuation token attached to a commit so the master can deduplicate a
/// retried commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub cnonce: Bytes,
    pub uuid: Uuid,
    pub replicant_can_retry: bool,
    pub effects: Effects,
}

/// Which read set is being shipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReadKind {
    /// Rows read under serializable or snapshot isolation.
    Serial,
    /// Rows locked by `SELECT ... FOR UPDATE`.
    SelectForUpdate,
}

/// One row in a read set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadEntry {
    pub table: TableName,
    pub genid: Genid,
}

// ============================================================================
// Messages
// ============================================================================

/// A typed message for the master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OsqlMessage {
    StartSession {
        request_type: RequestType,
        sql: String,
        timezone: Option<String>,
        /// Ask the master to check whether this session deadlocks on itself.
        check_self_lock: bool,
    },
    UseDb {
        table: TableName,
        version: u64,
    },
    Insert {
        genid: Genid,
        ins_keys: KeyMask,
        row: Bytes,
        flags: u32,
    },
    Update {
        genid: Genid,
        ins_keys: KeyMask,
        del_keys: KeyMask,
        row: Bytes,
        flags: u32,
    },
    Delete {
        genid: Genid,
        del_keys: KeyMask,
    },
    Index {
        genid: Genid,
        is_delete: bool,
        index: u32,
        key: Bytes,
    },
    Blob {
        genid: Genid,
        index: u32,
        payload: BlobPayload,
    },
    UpdateCols {
        genid: Genid,
        /// Per column, the new position or -1 when unchanged.
        columns: Vec<i32>,
    },
    RecordGenid {
        genid: Genid,
    },
    DbqConsume {
        genid: Genid,
    },
    UpdateStat {
        genid: Genid,
        row: Bytes,
        stat_index: i32,
    },
    SchemaChange(SchemaChange),
    Bpfunc(BpfuncCall),
    ReadSet {
        kind: ReadKind,
        entries: Vec<ReadEntry>,
    },
    DebugLog {
        cookie: u64,
        query_id: i32,
    },
    /// Commits the session; a non-ok `error` turns it into an abort.
    Commit {
        op_count: u64,
        error: ErrorRecord,
        snapshot: Option<SnapshotInfo>,
    },
}

/// Discriminant of [`OsqlMessage`], for logging and counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    StartSession,
    UseDb,
    Insert,
    Update,
    Delete,
    Index,
    Blob,
    UpdateCols,
    RecordGenid,
    DbqConsume,
    UpdateStat,
    SchemaChange,
    Bpfunc,
    ReadSet,
    DebugLog,
    Commit,
}

impl OsqlMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::StartSession { .. } => MessageKind::StartSession,
            Self::UseDb { .. } => MessageKind::UseDb,
            Self::Insert { .. } => MessageKind::Insert,
            Self::Update { .. } => MessageKind::Update,
            Self::Delete { .. } => MessageKind::Delete,
            Self::Index { .. } => MessageKind::Index,
            Self::Blob { .. } => MessageKind::Blob,
            Self::UpdateCols { .. } => MessageKind::UpdateCols,
            Self::RecordGenid { .. } => MessageKind::RecordGenid,
            Self::DbqConsume { .. } => MessageKind::DbqConsume,
            Self::UpdateStat { .. } => MessageKind::UpdateStat,
            Self::SchemaChange(_) => MessageKind::SchemaChange,
            Self::Bpfunc(_) => MessageKind::Bpfunc,
            Self::ReadSet { .. } => MessageKind::ReadSet,
            Self::DebugLog { .. } => MessageKind::DebugLog,
            Self::Commit { .. } => MessageKind::Commit,
        }
    }

    /// Genid of the row this message touches, if any.
    pub fn genid(&self) -> Option<Genid> {
        match self {
            Self::Insert { genid, .. }
            | Self::Update { genid, .. }
            | Self::Delete { genid, .. }
            | Self::Index { genid, .. }
            | Self::Blob { genid, .. }
            | Self::UpdateCols { genid, .. }
            | Self::RecordGenid { genid }
            | Self::DbqConsume { genid }
            | Self::UpdateStat { genid, .. } => Some(*genid),
            _ => None,
        }
    }
}

impl Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::StartSession => "start",
            Self::UseDb => "usedb",
            Self::Insert => "insrec",
            Self::Update => "updrec",
            Self::Delete => "delrec",
            Self::Index => "index",
            Self::Blob => "qblob",
            Self::UpdateCols => "updcols",
            Self::RecordGenid => "recgenid",
            Self::DbqConsume => "dbq_consume",
            Self::UpdateStat => "updstat",
            Self::SchemaChange => "schemachange",
            Self::Bpfunc => "bpfunc",
            Self::ReadSet => "readset",
            Self::DebugLog => "dbglog",
            Self::Commit => "commit",
        };
        f.write_str(name)
    }
}
