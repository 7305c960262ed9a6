//! # osql: Offload-SQL session protocol
//!
//! A replicant executes SQL locally, buffers each row-level effect and ships
//! those effects to the cluster master, which applies and commits them. The
//! master can change at any moment; sessions detect that, move to the new
//! master and replay what they buffered, or abort cleanly.
//!
//! ## Architecture
//!
//! - [`session`]: the state machine (start, per-operation send, restart,
//!   commit, abort)
//! - [`admission`]: operation-count limit per transaction
//! - [`checkboard`]: registry of in-flight sessions and their outcomes
//! - [`shadow`]: transaction-local operation log used for replay
//! - [`transport`], [`env`]: seams to the network, the local engine, access
//!   control and time
//! - [`tunables`]: process-wide limits adjustable at runtime
//!
//! ## Example
//!
//! ```ignore
//! use osql::{ClientOptions, Session, SessionEnv, TableDescriptor, RowChange};
//!
//! let mut session = Session::new(env, ClientOptions::default());
//! let t1 = TableDescriptor::plain("t1", 1);
//! session.insert(&t1, &RowChange::new(genid, row))?;
//! session.commit()?;
//! ```

pub mod admission;
pub mod checkboard;
pub mod env;
pub mod error;
pub mod message;
pub mod session;
pub mod shadow;
pub mod transport;
pub mod tunables;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

#[cfg(test)]
mod tests;

// Re-export commonly used items
pub use checkboard::{Checkboard, CheckboardError, InMemoryCheckboard, Registration};
pub use env::{
    AccessControl, AllowAll, Clock, ClusterView, DistributedCoordinator, LocalEngine, SessionEnv,
    SystemClock, UncontendedEngine,
};
pub use error::{OsqlError, OsqlResult};
pub use message::{
    BlobPayload, BpfuncCall, KeyMask, MessageKind, OsqlMessage, ReadKind, SchemaChange,
    TableTarget,
};
pub use session::{
    ClientOptions, IndexKeys, OsqlState, Outcome, RowChange, Session, TableDescriptor,
};
pub use shadow::{MemoryShadowBuffer, RowOp, ShadowBuffer, ShadowError};
pub use transport::{SendError, Transport};
pub use tunables::Tunables;

pub use osql_config::OsqlConfig;
pub use osql_types::{
    ErrorRecord, Genid, HostName, MasterErrorCode, RequestType, SessionKey, TableName,
    TransactionMode,
};
