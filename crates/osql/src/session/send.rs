//! Sending: the "use database" cache, admission, and the restart wrapper
//! every operation sender composes with.

use osql_types::{MasterErrorCode, TableName};
use rand::Rng;

use super::{Link, Session};
use crate::error::{OsqlError, OsqlResult, classify_send_failure};
use crate::message::{OsqlMessage, TableTarget};
use crate::shadow::{RowOp, ShadowBuffer};
use crate::transport::SendError;

/// How the restart wrapper treats an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Retry {
    /// Restart under the same identifier instead of a fresh one.
    pub keep_identifier: bool,
    /// The operation is already in the shadow buffer, so a successful
    /// restart's replay has sent it.
    pub already_buffered: bool,
}

impl Retry {
    pub const OPERATION: Self = Self {
        keep_identifier: false,
        already_buffered: false,
    };
    pub const BUFFERED: Self = Self {
        keep_identifier: false,
        already_buffered: true,
    };
    pub const COMMIT: Self = Self {
        keep_identifier: true,
        already_buffered: false,
    };
}

impl Link {
    pub(crate) fn max_transaction_ops(&self) -> u64 {
        self.options
            .max_transaction_ops
            .unwrap_or_else(|| self.env.tunables.get_max_transfer())
    }

    /// Starts the session if nothing is registered yet.
    pub(crate) fn ensure_started(&mut self) -> OsqlResult<()> {
        if self.state.registration.is_some() {
            return Ok(());
        }
        self.start(self.options.mode.request_type(), false)
    }

    /// Counts one row-level request against the transaction limit.
    pub(crate) fn admit(&mut self) -> OsqlResult<()> {
        let limit = self.max_transaction_ops();
        if let Err(rejected) = self.state.counters.admit(limit) {
            self.state
                .error
                .set(MasterErrorCode::TOO_BIG, "transaction too big");
            tracing::error!(
                ops = rejected.transaction_op_count,
                limit = rejected.limit,
                sql = %self.options.sql,
                "transaction too big"
            );
            return Err(OsqlError::TooBig);
        }
        Ok(())
    }

    /// Records DML against `table`, refusing tables already altered by DDL.
    pub(crate) fn check_dml(&mut self, table: &TableName) -> OsqlResult<()> {
        if self.state.ddl_tables.contains(table) {
            tracing::error!(%table, "data change on a table altered in this transaction");
            return Err(OsqlError::DdlMisuse(table.clone()));
        }
        if !self.state.dml_tables.contains(table) {
            self.state.dml_tables.insert(table.clone());
        }
        Ok(())
    }

    /// Records DDL against `table`, refusing tables already touched.
    pub(crate) fn check_ddl(&mut self, table: &TableName) -> OsqlResult<()> {
        if self.state.dml_tables.contains(table) || self.state.ddl_tables.contains(table) {
            tracing::error!(%table, "schema change on a table already used in this transaction");
            return Err(OsqlError::DdlMisuse(table.clone()));
        }
        self.state.ddl_tables.insert(table.clone());
        Ok(())
    }

    /// Sends one message to the bound master, without restart handling.
    pub(crate) fn send_raw(&self, message: &OsqlMessage) -> Result<(), SendError> {
        let (Some(reg), Some(host)) = (self.state.registration, self.state.master.as_ref()) else {
            return Err(SendError::Transport("session is not started".to_string()));
        };
        tracing::trace!(session = %reg.key, %host, kind = %message.kind(), "send");
        self.env.transport.send(host, reg.key, message)
    }

    /// Sends "use database" for `target` unless it is the cached table.
    pub(crate) fn ensure_usedb(&mut self, target: &TableTarget) -> Result<(), SendError> {
        if self.state.cached_table.as_ref() == Some(&target.name) {
            return Ok(());
        }
        self.state.cached_table = None;
        self.send_raw(&OsqlMessage::UseDb {
            table: target.name.clone(),
            version: target.version,
        })?;
        tracing::debug!(table = %target.name, "use database");
        self.state.cached_table = Some(target.name.clone());
        Ok(())
    }

    /// Sends a buffered operation: its "use database" if needed, then its
    /// messages in order.
    pub(crate) fn send_op(&mut self, op: &RowOp) -> Result<(), SendError> {
        if let RowOp::SchemaChange { change, target } = op {
            // Always announced afresh and never cached.
            self.state.cached_table = None;
            if let Some(target) = target {
                self.send_raw(&OsqlMessage::UseDb {
                    table: target.name.clone(),
                    version: target.version,
                })?;
            }
            let mut change = change.clone();
            if change.bound_session.is_some() {
                change.bound_session = self.state.registration.map(|reg| reg.key);
            }
            return self.send_raw(&OsqlMessage::SchemaChange(change));
        }

        if let Some(target) = op.target() {
            self.ensure_usedb(target)?;
        }
        for message in op.messages() {
            self.send_raw(&message)?;
        }
        Ok(())
    }

    /// Whether a send result calls for a masterswing restart.
    pub(crate) fn should_restart(&self, result: &Result<(), SendError>) -> bool {
        if let Err(err) = result {
            if err.is_wrong_master() && self.options.mode.restarts_on_wrong_master() {
                return true;
            }
        }
        if self.env.config.failover.random_restart && rand::thread_rng().gen_ratio(1, 100) {
            tracing::warn!("forcing random restart");
            return true;
        }
        false
    }

    /// Backs off when another thread wants our local locks.
    pub(crate) fn recover_deadlock_if_needed(&mut self) -> OsqlResult<()> {
        if !self.env.engine.lock_desired() {
            return Ok(());
        }
        let failover = &self.env.config.failover;
        let backoff = failover.deadlock_backoff(self.state.deadlock_recovered);
        tracing::warn!(
            recovered = self.state.deadlock_recovered,
            backoff_ms = backoff.as_millis(),
            "recovering deadlock before contacting master"
        );
        self.env
            .engine
            .recover_deadlock(backoff)
            .map_err(OsqlError::Busy)?;

        self.state.deadlock_recovered += 1;
        if self.state.deadlock_recovered > failover.deadlock_recovery_limit {
            tracing::error!(
                recovered = self.state.deadlock_recovered,
                "too many deadlock recoveries"
            );
            return Err(OsqlError::Busy("too many deadlock recoveries".to_string()));
        }
        Ok(())
    }
}

impl<S: ShadowBuffer> Session<S> {
    /// Runs `op` against the current master, restarting the session and
    /// repeating `op` whenever the master has moved.
    ///
    /// Restart failures keep too-big and schema-change; anything else, and
    /// any non-swing send failure, surfaces as internal.
    pub(crate) fn send_with_restart<F>(&mut self, retry: Retry, mut op: F) -> OsqlResult<()>
    where
        F: FnMut(&mut Link) -> Result<(), SendError>,
    {
        let budget = self.link.env.config.failover.survive_master_swings;
        let mut restarts = 0u32;
        loop {
            let result = op(&mut self.link);
            if !self.link.should_restart(&result) {
                return result.map_err(|err| {
                    tracing::error!(error = %err, sql = %self.link.options.sql, "send failed");
                    OsqlError::Internal(err.to_string())
                });
            }
            if restarts >= budget {
                tracing::error!(restarts, "operation still failing after restarts");
                return Err(OsqlError::Internal(format!(
                    "operation failed after {restarts} restarts"
                )));
            }
            restarts += 1;
            if let Err(err) = &result {
                tracing::info!(error = %err, restarts, "master moved, restarting session");
            }

            self.restart(budget, retry.keep_identifier)
                .map_err(classify_send_failure)?;
            if retry.already_buffered {
                return Ok(());
            }
        }
    }
}
