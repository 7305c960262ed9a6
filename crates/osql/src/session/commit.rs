//! Commit and abort coordination.
//!
//! Commit sends the commit directive, waits on the checkboard for the
//! master's verdict and survives master swings by restarting under the same
//! identifier. Whatever happens, the session ends unregistered with its
//! shadow buffer closed.

use osql_types::{ErrorRecord, MasterErrorCode, TransactionMode};
use rand::Rng;

use super::send::Retry;
use super::{Outcome, Session};
use crate::error::{OsqlError, OsqlResult, map_commit_outcome};
use crate::message::{OsqlMessage, ReadKind, SnapshotInfo};
use crate::shadow::ShadowBuffer;

impl<S: ShadowBuffer> Session<S> {
    /// Commits the transaction on the master.
    pub fn commit(&mut self) -> OsqlResult<()> {
        self.check_active()?;

        if let Some(coordinator) = self.distributed.as_mut() {
            if let Err(reason) = coordinator.commit() {
                tracing::error!(%reason, "distributed commit failed");
                self.link.state.error.set(
                    MasterErrorCode::ABORTED,
                    format!("distributed commit failed: {reason}"),
                );
                if let Err(err) = self.abort() {
                    tracing::error!(error = %err, "abort after distributed commit failure failed");
                }
                return Err(OsqlError::Abort);
            }
        }

        self.link.state.timings.commit_start = Some(self.link.env.clock.now());
        let result = self.drive_commit();
        self.finish_commit(result)
    }

    /// Aborts the transaction, asking the master to drop its copy.
    ///
    /// Never restarts. After a commit this only repeats local cleanup.
    pub fn abort(&mut self) -> OsqlResult<()> {
        if self.link.state.outcome.is_some() {
            self.teardown();
            return Ok(());
        }

        let mut result = Ok(());
        if let Some(reg) = self.link.state.registration {
            let code = if self.link.state.error.master_code() == MasterErrorCode::TOO_BIG {
                MasterErrorCode::TOO_BIG
            } else {
                MasterErrorCode::ABORTED
            };
            let rollback = OsqlMessage::Commit {
                op_count: 0,
                error: ErrorRecord::new(code, format!("sql session {} rollback", reg.key)),
                snapshot: None,
            };
            if let Err(err) = self.link.send_raw(&rollback) {
                tracing::error!(session = %reg.key, error = %err, "failed to send rollback");
                result = Err(OsqlError::Internal(err.to_string()));
            }

            self.link.state.registration = None;
            if let Err(err) = self.link.env.checkboard.unregister(reg.key) {
                tracing::error!(session = %reg.key, error = %err, "failed to unregister");
                result = Err(OsqlError::Internal(err.to_string()));
            }
            tracing::info!(session = %reg.key, rc = code.0, "session aborted");
        }

        self.teardown();
        self.link.state.outcome = Some(Outcome::Aborted);
        result
    }

    // ========================================================================
    // Commit internals
    // ========================================================================

    fn drive_commit(&mut self) -> OsqlResult<()> {
        let prepared = if self.link.options.mode.streams_to_master() {
            self.link.ensure_started()
        } else {
            self.ship_buffered()
        };
        if let Err(err) = prepared {
            tracing::error!(error = %err, "failed to prepare commit");
            return Err(if err.is_fatal_to_restart() {
                err
            } else {
                OsqlError::ChangeNode
            });
        }

        let config = std::sync::Arc::clone(&self.link.env.config);
        let mut retries = 0u32;
        loop {
            self.link.env.engine.release_cursor_locks().map_err(|reason| {
                tracing::error!(%reason, "failed to release cursor locks");
                OsqlError::Internal(reason)
            })?;

            if let Err(err) = self.ship_read_set().and_then(|()| self.send_commit()) {
                tracing::error!(error = %err, "failed to send commit");
                return Err(OsqlError::ChangeNode);
            }
            if !self.link.state.error.is_ok() {
                return Err(OsqlError::Error);
            }

            let Some(registration) = self.link.state.registration else {
                return Err(OsqlError::Internal("commit sent without a session".to_string()));
            };
            let timeout = config.commit.commit_wait(self.link.state.running_ddl);
            match self
                .link
                .env
                .checkboard
                .wait_for_outcome(registration, timeout)
            {
                Ok(outcome) => self.link.state.error = outcome,
                Err(err) => {
                    tracing::error!(session = %registration.key, error = %err, "no commit outcome");
                    return Err(OsqlError::ChangeNode);
                }
            }

            if config.failover.random_commit_replays && rand::thread_rng().gen_ratio(1, 50) {
                tracing::warn!(session = %registration.key, "forcing commit replay");
                self.link
                    .state
                    .error
                    .set_code(MasterErrorCode::NO_MASTER);
            }
            if self.link.state.error.is_ok() {
                return Ok(());
            }

            let code = self.link.state.error.master_code();
            if code.is_master_swing() {
                if config.commit.schema_change_resume_autocommit
                    && !self.link.options.in_client_transaction
                    && self.link.state.running_ddl
                {
                    self.link
                        .state
                        .error
                        .set_code(MasterErrorCode::SCHEMA_CHANGE);
                    self.link.state.error.append(
                        " Master node downgrading - new master will resume schemachange",
                    );
                    tracing::info!(session = %registration.key, rc = code.0, "schema change handed to the new master");
                    return Err(OsqlError::Abort);
                }
                // Partial cross-partition state cannot be replayed.
                if self.distributed.is_none() && retries < config.failover.survive_master_swings {
                    retries += 1;
                    tracing::warn!(session = %registration.key, rc = code.0, retries, "master swing during commit, retrying");
                    self.link.env.clock.sleep(config.failover.master_retry_poll());
                    match self.restart(1, true) {
                        Ok(()) => {}
                        Err(OsqlError::TooBig) => return Err(OsqlError::TooBig),
                        Err(OsqlError::SchemaChange(reason)) => {
                            tracing::error!(session = %registration.key, %reason, "replay before commit retry hit a schema change");
                            self.link
                                .state
                                .error
                                .set(MasterErrorCode::SCHEMA_CHANGE, reason);
                            return Err(map_commit_outcome(MasterErrorCode::SCHEMA_CHANGE));
                        }
                        Err(err) => {
                            tracing::debug!(error = %err, "restart before commit retry failed");
                        }
                    }
                    self.link.state.error.clear();
                    continue;
                }
                tracing::error!(session = %registration.key, rc = code.0, retries, "master swings exhausted during commit");
            }
            return Err(map_commit_outcome(code));
        }
    }

    fn finish_commit(&mut self, mut result: OsqlResult<()>) -> OsqlResult<()> {
        if let Some(reg) = self.link.state.registration.take() {
            if let Err(err) = self.link.env.checkboard.unregister(reg.key) {
                tracing::error!(session = %reg.key, error = %err, "failed to unregister after commit");
                if result.is_ok() {
                    result = Err(OsqlError::Internal(err.to_string()));
                }
            }
        }
        self.link.state.timings.commit_end = Some(self.link.env.clock.now());

        if self.link.state.error.master_code() == MasterErrorCode::VERIFY_FAILED {
            if self.link.options.mode == TransactionMode::Sosql
                && self.distributed.is_none()
                && self.shadow.has_pending_read_set().unwrap_or(true)
            {
                self.mark_non_retriable("verify failed with select-for-update rows outstanding");
            }
            if self.link.state.running_ddl {
                self.mark_non_retriable("verify failed on a schema-change transaction");
            }
        }

        self.teardown();
        self.link.state.outcome = Some(if result.is_ok() {
            Outcome::Committed
        } else {
            Outcome::CommitFailed
        });
        tracing::debug!(
            ok = result.is_ok(),
            elapsed_ms = self.link.state.timings.commit_duration().map(|d| d.as_millis()),
            "commit finished"
        );
        result
    }

    fn mark_non_retriable(&mut self, why: &str) {
        tracing::info!(reason = why, "transaction marked non-retriable");
        self.link.state.non_retriable = true;
    }

    /// Ships the buffer of a mode that does not stream.
    fn ship_buffered(&mut self) -> OsqlResult<()> {
        self.link.ensure_started()?;
        match self.replay_shadow() {
            Ok(()) => Ok(()),
            Err(err) if err.is_fatal_to_restart() => Err(err),
            Err(err) if self.link.options.mode.restarts_on_wrong_master() => {
                tracing::warn!(error = %err, "shipping buffer failed, restarting");
                let budget = self.link.env.config.failover.survive_master_swings;
                self.restart(budget, false)
            }
            Err(err) => Err(err),
        }
    }

    /// Sends the read set the mode calls for, if any rows were recorded.
    fn ship_read_set(&mut self) -> OsqlResult<()> {
        let kind = match self.link.options.mode {
            TransactionMode::Serial | TransactionMode::Snapshot => ReadKind::Serial,
            TransactionMode::Sosql => ReadKind::SelectForUpdate,
            TransactionMode::Recom => return Ok(()),
        };
        let entries = self.shadow.read_set(kind);
        if entries.is_empty() {
            return Ok(());
        }
        tracing::debug!(?kind, rows = entries.len(), "shipping read set");
        let message = OsqlMessage::ReadSet { kind, entries };
        self.send_with_restart(Retry::COMMIT, |link| link.send_raw(&message))
    }

    fn send_commit(&mut self) -> OsqlResult<()> {
        self.link.state.cached_table = None;
        self.link.state.counters.transaction_op_count = 0;
        let snapshot = self.snapshot_info();
        self.send_with_restart(Retry::COMMIT, |link| {
            link.send_raw(&OsqlMessage::Commit {
                op_count: link.state.counters.sent_op_count,
                error: link.state.error.clone(),
                snapshot: snapshot.clone(),
            })
        })
    }

    /// Continuation token, when the session is UUID-keyed and the client
    /// asked for high availability outside a stored procedure.
    fn snapshot_info(&self) -> Option<SnapshotInfo> {
        let options = &self.link.options;
        let wanted = self.link.env.config.commit.always_send_cnonce || options.high_availability;
        if !wanted || options.has_stored_procedure {
            return None;
        }
        let uuid = self.key()?.uuid()?;
        Some(SnapshotInfo {
            cnonce: options.cnonce.clone()?,
            uuid,
            replicant_can_retry: options.replicant_can_retry,
            effects: self.link.state.effects,
        })
    }
}
