//! Masterswing restart: re-register and replay the shadow buffer.

use std::time::Duration;

use osql_types::MasterErrorCode;

use super::Session;
use crate::error::{OsqlError, OsqlResult};
use crate::shadow::ShadowBuffer;

impl<S: ShadowBuffer> Session<S> {
    /// Moves the session to the current master and replays every buffered
    /// operation in its original order.
    ///
    /// Too-big and schema-change failures end the restart at once. Anything
    /// else is retried up to `max_retries` attempts, sleeping `n` seconds
    /// after the `n`th failure from the second on.
    pub fn restart(&mut self, max_retries: u32, keep_identifier: bool) -> OsqlResult<()> {
        let request_type = self.link.options.mode.request_type();
        let mut retries = 0u32;
        loop {
            if let Err(err) = self.link.recover_deadlock_if_needed() {
                if let Some(reg) = self.link.state.registration.take() {
                    if let Err(unreg) = self.link.env.checkboard.unregister(reg.key) {
                        tracing::error!(session = %reg.key, error = %unreg, "failed to unregister");
                    }
                }
                return Err(err);
            }

            self.link.state.cached_table = None;
            if !keep_identifier {
                if let Some(reg) = self.link.state.registration.take() {
                    self.link.state.master = None;
                    self.link
                        .env
                        .checkboard
                        .unregister(reg.key)
                        .map_err(|err| {
                            tracing::error!(session = %reg.key, error = %err, "failed to unregister for restart");
                            OsqlError::Internal(err.to_string())
                        })?;
                }
            }

            let attempt = self
                .link
                .start(request_type, keep_identifier)
                .and_then(|()| self.replay_shadow());
            match attempt {
                Ok(()) => {
                    tracing::info!(
                        session = ?self.key(),
                        retries,
                        replayed = self.shadow.len(),
                        "session restarted"
                    );
                    let pause = self.link.env.config.failover.restart_sleep_secs;
                    if keep_identifier && pause > 0 {
                        self.link.env.clock.sleep(Duration::from_secs(pause));
                    }
                    return Ok(());
                }
                Err(err) if err.is_fatal_to_restart() => {
                    tracing::error!(error = %err, retries, "restart replay failed");
                    return Err(err);
                }
                Err(err) => {
                    retries += 1;
                    if retries >= max_retries {
                        tracing::error!(error = %err, retries, "restart retries exhausted");
                        return Err(OsqlError::RestartFailed { attempts: retries });
                    }
                    tracing::warn!(error = %err, retries, "restart attempt failed");
                    if retries > 1 {
                        self.link
                            .env
                            .clock
                            .sleep(Duration::from_secs(u64::from(retries)));
                    }
                }
            }
        }
    }

    /// Sends every buffered operation to the bound master.
    ///
    /// Operation counters are left alone: every replayed operation was
    /// admitted when it was first issued.
    pub(crate) fn replay_shadow(&mut self) -> OsqlResult<()> {
        let limit = self.link.max_transaction_ops();
        let link = &mut self.link;
        let mut admitted = 0u64;
        let replayed = self.shadow.replay(&mut |op| {
            if op.is_admitted() {
                admitted += 1;
                if limit > 0 && admitted > limit {
                    link.state
                        .error
                        .set(MasterErrorCode::TOO_BIG, "transaction too big");
                    return Err(OsqlError::TooBig);
                }
            }
            link.send_op(op)
                .map_err(|err| OsqlError::Internal(format!("replay failed: {err}")))
        })?;
        tracing::debug!(replayed, admitted, "replayed shadow buffer");
        Ok(())
    }
}
