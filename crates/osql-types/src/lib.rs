//! # osql-types: Core types for the offload-SQL protocol
//!
//! This crate contains the value types shared by the session state machine
//! and its collaborators:
//! - Session identity ([`RequestId`], [`SessionKey`])
//! - Cluster addressing ([`HostName`])
//! - Row addressing ([`TableName`], [`Genid`])
//! - Error reporting ([`ErrorRecord`], [`MasterErrorCode`])
//! - Transaction modes and their capabilities ([`TransactionMode`], [`RequestType`])
//! - Commit diagnostics ([`CommitTimings`])

use std::fmt::{self, Display};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Session identity
// ============================================================================

/// 64-bit session identifier handed to the master on session start.
///
/// Zero is never a valid identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(u64);

impl RequestId {
    // ========================================================================
    // Functional Core (pure, testable)
    // ========================================================================

    /// Creates a request id from a raw value.
    ///
    /// Returns `None` for zero.
    pub fn new(id: u64) -> Option<Self> {
        (id != 0).then_some(Self(id))
    }

    /// Returns the raw value.
    pub fn as_u64(self) -> u64 {
        self.0
    }

    // ========================================================================
    // Imperative Shell (IO boundary)
    // ========================================================================

    /// Generates a fresh, non-zero request id from the OS CSPRNG.
    ///
    /// # Panics
    ///
    /// Panics if the OS CSPRNG fails.
    pub fn generate() -> Self {
        loop {
            let mut bytes = [0u8; 8];
            getrandom::fill(&mut bytes).expect("CSPRNG failure is catastrophic");
            if let Some(id) = Self::new(u64::from_le_bytes(bytes)) {
                return id;
            }
        }
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// The key a session is known by across the cluster.
///
/// A session is identified either by a 64-bit request id or, when random
/// identifiers are enabled, by a UUID. The checkboard, the transport and
/// the master all correlate a session's messages and outcome through this key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionKey {
    /// Identified by request id.
    Request(RequestId),
    /// Identified by UUID (the request id is the "use UUID" sentinel).
    Uuid(Uuid),
}

impl SessionKey {
    /// Generates a fresh key, by UUID when `random_identifiers` is set.
    pub fn generate(random_identifiers: bool) -> Self {
        if random_identifiers {
            Self::Uuid(Uuid::new_v4())
        } else {
            Self::Request(RequestId::generate())
        }
    }

    /// Returns true if this key is a UUID.
    pub fn is_uuid(&self) -> bool {
        matches!(self, Self::Uuid(_))
    }

    /// Returns the UUID, if this key is one.
    pub fn uuid(&self) -> Option<Uuid> {
        match self {
            Self::Uuid(uuid) => Some(*uuid),
            Self::Request(_) => None,
        }
    }
}

impl Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request(rqid) => write!(f, "rqid:{rqid}"),
            Self::Uuid(uuid) => write!(f, "uuid:{uuid}"),
        }
    }
}

// ============================================================================
// Addressing
// ============================================================================

/// Name of a cluster node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HostName(String);

impl HostName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for HostName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for HostName {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Name of a table targeted by a row operation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableName(String);

impl TableName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Length of the name as carried on the wire, including the terminator.
    pub fn wire_len(&self) -> usize {
        self.0.len() + 1
    }

    /// Name of the table backing a stored-procedure queue.
    pub fn for_queue(procedure: &str) -> Self {
        Self(format!("__q{procedure}"))
    }
}

impl Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TableName {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Row identifier.
///
/// Genids with the top bit set are synthetic: they name rows that only exist
/// in the local shadow tables and never reach the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Genid(u64);

impl Genid {
    const SYNTHETIC_BIT: u64 = 1 << 63;

    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn is_synthetic(self) -> bool {
        self.0 & Self::SYNTHETIC_BIT != 0
    }
}

impl Display for Genid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

// ============================================================================
// Error reporting
// ============================================================================

/// Raw error code in the master's error space.
///
/// Only the codes the session protocol inspects are named; everything else
/// is carried through opaquely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MasterErrorCode(pub i32);

impl MasterErrorCode {
    pub const OK: Self = Self(0);
    /// Transaction aborted by the replicant.
    pub const ABORTED: Self = Self(4);
    /// Transaction exceeded its operation limit.
    pub const TOO_BIG: Self = Self(18);
    /// Write access denied.
    pub const ACCESS: Self = Self(23);
    /// Block processing failed on a verify conflict.
    pub const VERIFY_FAILED: Self = Self(224);
    /// Schema change failure or hand-off.
    pub const SCHEMA_CHANGE: Self = Self(240);
    /// No master available.
    pub const NO_MASTER: Self = Self(1005);
    /// Commit could not be made durable.
    pub const NOT_DURABLE: Self = Self(1016);
    /// Legacy master-swing marker.
    pub const LEGACY_SWING: Self = Self(999);
    /// Master timed out applying the transaction.
    pub const MASTER_TIMEOUT: Self = Self(-109);

    /// Returns true for codes that indicate the master went away mid-commit.
    pub fn is_master_swing(self) -> bool {
        self == Self::NO_MASTER || self == Self::NOT_DURABLE || self == Self::LEGACY_SWING
    }
}

impl Display for MasterErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Structured error: a code plus a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub code: i32,
    pub message: String,
}

impl ErrorRecord {
    pub fn new(code: MasterErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.0,
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == 0
    }

    pub fn master_code(&self) -> MasterErrorCode {
        MasterErrorCode(self.code)
    }

    pub fn set(&mut self, code: MasterErrorCode, message: impl Into<String>) {
        self.code = code.0;
        self.message = message.into();
    }

    pub fn set_code(&mut self, code: MasterErrorCode) {
        self.code = code.0;
    }

    /// Appends to the message, keeping whatever was already recorded.
    pub fn append(&mut self, text: &str) {
        self.message.push_str(text);
    }

    pub fn clear(&mut self) {
        self.code = 0;
        self.message.clear();
    }
}

impl Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

// ============================================================================
// Transaction modes
// ============================================================================

/// Isolation mode of the client transaction.
///
/// Each mode has a fixed capability profile; callers ask the mode what it
/// does rather than comparing against specific variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransactionMode {
    /// Socket SQL: every row operation is streamed to the master as it happens.
    Sosql,
    /// Read-committed: operations are buffered and shipped at commit.
    Recom,
    /// Serializable: buffered, and the read set is verified on the master.
    Serial,
    /// Snapshot isolation: buffered, read set shipped at commit.
    Snapshot,
}

impl TransactionMode {
    /// Whether row operations are sent to the master as they are issued.
    pub fn streams_to_master(self) -> bool {
        matches!(self, Self::Sosql)
    }

    /// Whether a wrong-master send result triggers a masterswing restart.
    pub fn restarts_on_wrong_master(self) -> bool {
        matches!(self, Self::Sosql | Self::Recom)
    }

    /// Whether the commit ships the recorded read set.
    pub fn ships_read_set(self) -> bool {
        matches!(self, Self::Serial | Self::Snapshot)
    }

    /// The start-session request kind for this mode.
    pub fn request_type(self) -> RequestType {
        match self {
            Self::Sosql => RequestType::Sock,
            Self::Recom => RequestType::Recom,
            Self::Serial => RequestType::Serial,
            Self::Snapshot => RequestType::Snapisol,
        }
    }
}

impl Display for TransactionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Sosql => "sosql",
            Self::Recom => "recom",
            Self::Serial => "serial",
            Self::Snapshot => "snapshot",
        };
        f.write_str(name)
    }
}

/// Kind of session requested from the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestType {
    Sock,
    /// Socket SQL with cost reporting.
    SockCost,
    Recom,
    Serial,
    Snapisol,
}

impl RequestType {
    /// Whether this request kind may ask the master for a self-lock check.
    pub fn is_sock(self) -> bool {
        matches!(self, Self::Sock | Self::SockCost)
    }
}

// ============================================================================
// Timings
// ============================================================================

/// Monotonic commit timestamps, kept for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitTimings {
    pub commit_start: Option<Instant>,
    pub commit_end: Option<Instant>,
}

impl CommitTimings {
    /// Elapsed commit time, if both ends were recorded.
    pub fn commit_duration(&self) -> Option<Duration> {
        match (self.commit_start, self.commit_end) {
            (Some(start), Some(end)) => Some(end.saturating_duration_since(start)),
            _ => None,
        }
    }
}
