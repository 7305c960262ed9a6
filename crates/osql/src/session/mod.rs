//! The offload-SQL session state machine.
//!
//! A [`Session`] is driven by the single thread executing one client's
//! write transaction. It:
//!
//! 1. registers with the [`Checkboard`](crate::checkboard::Checkboard) on
//!    the first send ([`start`](Session::start))
//! 2. streams each row operation to the master, restarting transparently
//!    when the master moves ([`insert`](Session::insert) and friends)
//! 3. replays the shadow buffer against a new master
//!    ([`restart`](Session::restart))
//! 4. commits and waits for the master's verdict, surviving master swings
//!    ([`commit`](Session::commit)), or aborts ([`abort`](Session::abort))
//!
//! Exactly one terminal [`Outcome`] is recorded per session.

use std::collections::HashSet;

use bytes::Bytes;
use osql_types::{
    CommitTimings, ErrorRecord, HostName, RequestType, SessionKey, TableName, TransactionMode,
};

use crate::admission::OpCounters;
use crate::checkboard::Registration;
use crate::env::{DistributedCoordinator, SessionEnv};
use crate::error::{OsqlError, OsqlResult};
use crate::message::Effects;
use crate::shadow::{MemoryShadowBuffer, ShadowBuffer};

mod commit;
mod ops;
mod restart;
mod send;
mod start;

pub use ops::{IndexKeys, RowChange, TableDescriptor};

// ============================================================================
// Client options
// ============================================================================

/// Per-connection settings that shape a session.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub mode: TransactionMode,
    /// Statement text sent with the start request.
    pub sql: String,
    pub timezone: Option<String>,
    pub user: Option<String>,
    /// Overrides the process-wide operation limit.
    pub max_transaction_ops: Option<u64>,
    pub high_availability: bool,
    /// Inside an explicit BEGIN ... COMMIT.
    pub in_client_transaction: bool,
    /// Running inside a stored procedure.
    pub has_stored_procedure: bool,
    /// How many times the client has retried after verify errors.
    pub verify_retries: u32,
    pub replicant_can_retry: bool,
    /// Client continuation token.
    pub cnonce: Option<Bytes>,
}

impl ClientOptions {
    pub fn new(mode: TransactionMode) -> Self {
        Self {
            mode,
            sql: String::new(),
            timezone: None,
            user: None,
            max_transaction_ops: None,
            high_availability: false,
            in_client_transaction: true,
            has_stored_procedure: false,
            verify_retries: 0,
            replicant_can_retry: false,
            cnonce: None,
        }
    }

    pub fn with_sql(mut self, sql: impl Into<String>) -> Self {
        self.sql = sql.into();
        self
    }

    pub fn with_max_transaction_ops(mut self, limit: u64) -> Self {
        self.max_transaction_ops = Some(limit);
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_cnonce(mut self, cnonce: Bytes) -> Self {
        self.cnonce = Some(cnonce);
        self
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::new(TransactionMode::Sosql)
    }
}

// ============================================================================
// State
// ============================================================================

/// Terminal outcome of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Committed,
    CommitFailed,
    Aborted,
}

/// Mutable protocol state of one session.
#[derive(Debug, Default)]
pub struct OsqlState {
    /// Present while, and only while, registered with the checkboard.
    pub registration: Option<Registration>,
    pub master: Option<HostName>,
    pub error: ErrorRecord,
    /// Table of the last acknowledged "use database".
    pub cached_table: Option<TableName>,
    pub counters: OpCounters,
    pub running_ddl: bool,
    pub timings: CommitTimings,
    pub deadlock_recovered: u32,
    /// Set when a higher layer must not blindly retry the transaction.
    pub non_retriable: bool,
    pub debug_cookie: Option<u64>,
    pub effects: Effects,
    pub dml_tables: HashSet<TableName>,
    pub ddl_tables: HashSet<TableName>,
    pub outcome: Option<Outcome>,
}

/// Everything except the shadow buffer, so replay can borrow both.
pub(crate) struct Link {
    pub(crate) env: SessionEnv,
    pub(crate) options: ClientOptions,
    pub(crate) state: OsqlState,
}

// ============================================================================
// Session
// ============================================================================

/// One client write transaction offloaded to the master.
pub struct Session<S: ShadowBuffer = MemoryShadowBuffer> {
    link: Link,
    shadow: S,
    distributed: Option<Box<dyn DistributedCoordinator>>,
}

impl Session<MemoryShadowBuffer> {
    pub fn new(env: SessionEnv, options: ClientOptions) -> Self {
        Self::with_shadow(env, options, MemoryShadowBuffer::new())
    }
}

impl<S: ShadowBuffer> Session<S> {
    pub fn with_shadow(env: SessionEnv, options: ClientOptions, shadow: S) -> Self {
        Self {
            link: Link {
                env,
                options,
                state: OsqlState::default(),
            },
            shadow,
            distributed: None,
        }
    }

    /// Marks the transaction as cross-partition, committed through `coordinator`.
    pub fn with_distributed(mut self, coordinator: Box<dyn DistributedCoordinator>) -> Self {
        self.distributed = Some(coordinator);
        self
    }

    pub fn options(&self) -> &ClientOptions {
        &self.link.options
    }

    pub fn state(&self) -> &OsqlState {
        &self.link.state
    }

    /// Last error recorded locally or reported by the master.
    pub fn error(&self) -> &ErrorRecord {
        &self.link.state.error
    }

    pub fn key(&self) -> Option<SessionKey> {
        self.link.state.registration.map(|reg| reg.key)
    }

    pub fn is_registered(&self) -> bool {
        self.link.state.registration.is_some()
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.link.state.outcome
    }

    pub fn is_non_retriable(&self) -> bool {
        self.link.state.non_retriable
    }

    pub fn shadow(&self) -> &S {
        &self.shadow
    }

    pub fn shadow_mut(&mut self) -> &mut S {
        &mut self.shadow
    }

    /// Operation limit in force: the client override, else the process default.
    pub fn max_transaction_ops(&self) -> u64 {
        self.link.max_transaction_ops()
    }

    /// Opens the session on the current master.
    pub fn start(&mut self, request_type: RequestType, keep_identifier: bool) -> OsqlResult<()> {
        self.link.start(request_type, keep_identifier)
    }

    fn check_active(&self) -> OsqlResult<()> {
        match self.link.state.outcome {
            None => Ok(()),
            Some(outcome) => Err(OsqlError::Internal(format!(
                "session already finished ({outcome:?})"
            ))),
        }
    }

    /// Closes local state. Safe to call any number of times.
    fn teardown(&mut self) {
        self.shadow.close();
        if let Err(reason) = self.link.env.engine.abort_shadow_transaction() {
            tracing::warn!(%reason, "failed to abort local shadow transaction");
        }
        let state = &mut self.link.state;
        state.counters.reset();
        state.cached_table = None;
        state.master = None;
    }
}

impl<S: ShadowBuffer> Drop for Session<S> {
    fn drop(&mut self) {
        if let Some(reg) = self.link.state.registration.take() {
            tracing::warn!(session = %reg.key, "session dropped while registered");
            if let Err(err) = self.link.env.checkboard.unregister(reg.key) {
                tracing::error!(session = %reg.key, error = %err, "failed to unregister dropped session");
            }
        }
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("options", &self.options)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl<S: ShadowBuffer> std::fmt::Debug for Session<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("link", &self.link)
            .field("shadow_len", &self.shadow.len())
            .field("distributed", &self.distributed.is_some())
            .finish()
    }
}
