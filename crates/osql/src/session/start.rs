//! Session start: master discovery, registration and the start request.

use osql_types::{MasterErrorCode, RequestType, SessionKey, TransactionMode};

use super::Link;
use crate::error::{OsqlError, OsqlResult};
use crate::message::OsqlMessage;

impl Link {
    /// Opens the session on the current master.
    ///
    /// With `keep_identifier` the registered key is re-bound to the master
    /// found now; otherwise a fresh key is registered. Any registration made
    /// here is rolled back on failure.
    pub(crate) fn start(
        &mut self,
        request_type: RequestType,
        keep_identifier: bool,
    ) -> OsqlResult<()> {
        let key = match (keep_identifier, self.state.registration) {
            (true, Some(reg)) => reg.key,
            (true, None) => {
                return Err(OsqlError::Internal(
                    "no session identifier to keep".to_string(),
                ));
            }
            (false, Some(reg)) => {
                return Err(OsqlError::Internal(format!(
                    "session {} is still registered",
                    reg.key
                )));
            }
            (false, None) => SessionKey::generate(self.env.config.features.random_identifiers),
        };
        self.state.error.clear();

        let config = std::sync::Arc::clone(&self.env.config);
        let failover = &config.failover;
        let check_self_lock = self.options.mode == TransactionMode::Sosql
            && request_type.is_sock()
            && self.options.verify_retries > config.commit.verify_self_lock_threshold;
        let request = OsqlMessage::StartSession {
            request_type,
            sql: self.options.sql.clone(),
            timezone: self.options.timezone.clone(),
            check_self_lock,
        };

        let mut retries = 0u32;
        loop {
            if let Err(err) = self.recover_deadlock_if_needed() {
                self.rollback_start(keep_identifier);
                return Err(err);
            }

            let Some(host) = self.env.cluster.master() else {
                if retries >= failover.master_discovery_retries {
                    tracing::error!(session = %key, retries, "no master available");
                    self.state
                        .error
                        .set(MasterErrorCode::NO_MASTER, "No master available");
                    self.rollback_start(keep_identifier);
                    return Err(OsqlError::Abort);
                }
                retries += 1;
                tracing::warn!(session = %key, retries, "waiting for a master");
                self.env.clock.sleep(failover.master_discovery_poll());
                continue;
            };

            let bound = match self.state.registration {
                Some(_) => self.env.checkboard.reuse(key, &host),
                None => self.env.checkboard.register(key, &host, request_type),
            };
            match bound {
                Ok(reg) => {
                    self.state.registration = Some(reg);
                    self.state.master = Some(host.clone());
                }
                Err(err) => {
                    tracing::error!(session = %key, %host, error = %err, "failed to register session");
                    self.rollback_start(keep_identifier);
                    return Err(OsqlError::Internal(err.to_string()));
                }
            }

            match self.send_raw(&request) {
                Ok(()) => {
                    tracing::info!(
                        session = %key,
                        %host,
                        ?request_type,
                        check_self_lock,
                        "session started"
                    );
                    return Ok(());
                }
                Err(err) if retries < failover.master_discovery_retries => {
                    retries += 1;
                    tracing::warn!(session = %key, %host, retries, error = %err, "start request failed, retrying");
                }
                Err(err) => {
                    tracing::error!(session = %key, %host, retries, error = %err, "giving up starting session");
                    self.rollback_start(keep_identifier);
                    return Err(OsqlError::Busy(format!(
                        "failed to start session on {host}: {err}"
                    )));
                }
            }
        }
    }

    /// Undoes a fresh registration after a failed start.
    fn rollback_start(&mut self, keep_identifier: bool) {
        if keep_identifier {
            return;
        }
        self.state.master = None;
        if let Some(reg) = self.state.registration.take() {
            if let Err(err) = self.env.checkboard.unregister(reg.key) {
                tracing::error!(session = %reg.key, error = %err, "failed to roll back registration");
            }
        }
    }
}
