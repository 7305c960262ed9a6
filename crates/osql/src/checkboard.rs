//! Checkboard: the process-wide registry of in-flight sessions.
//!
//! Every session registers its [`SessionKey`] together with the master it is
//! bound to. The master's commit verdict is delivered asynchronously (from a
//! different thread than the session's) and the session blocks in
//! [`Checkboard::wait_for_outcome`] until it arrives or the wait times out.
//!
//! # Fencing
//!
//! A session that survives a master swing keeps its key and re-binds it to
//! the new master with [`Checkboard::reuse`]. A verdict from the old master
//! may still be in flight at that point. Each registration therefore carries
//! a generation that increases on every register and reuse:
//!
//! - `reuse` bumps the generation and discards any pending outcome;
//! - outcomes delivered by a host other than the bound master are dropped;
//! - `wait_for_outcome` only accepts an outcome stamped with the caller's
//!   generation.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use osql_types::{ErrorRecord, HostName, RequestType, SessionKey};
use thiserror::Error;

// ============================================================================
// Trait
// ============================================================================

/// A live registration: the key plus the generation it was bound under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Registration {
    pub key: SessionKey,
    pub generation: u64,
}

/// Errors from checkboard operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CheckboardError {
    #[error("session {0} is already registered")]
    AlreadyRegistered(SessionKey),

    #[error("session {0} is not registered")]
    NotRegistered(SessionKey),

    #[error("session {key} was re-bound (generation {current}, waited on {expected})")]
    Fenced {
        key: SessionKey,
        expected: u64,
        current: u64,
    },

    #[error("timed out after {waited:?} waiting for the outcome of session {key}")]
    TimedOut { key: SessionKey, waited: Duration },
}

/// Registry correlating session keys with their eventual outcome.
pub trait Checkboard: Send + Sync {
    /// Registers a new session bound to `host`.
    fn register(
        &self,
        key: SessionKey,
        host: &HostName,
        request_type: RequestType,
    ) -> Result<Registration, CheckboardError>;

    /// Re-binds an existing session to `host`, fencing off the old binding.
    fn reuse(&self, key: SessionKey, host: &HostName) -> Result<Registration, CheckboardError>;

    /// Removes the session.
    fn unregister(&self, key: SessionKey) -> Result<(), CheckboardError>;

    /// Blocks until the master's verdict for `registration` arrives.
    fn wait_for_outcome(
        &self,
        registration: Registration,
        timeout: Duration,
    ) -> Result<ErrorRecord, CheckboardError>;
}

// ============================================================================
// In-memory implementation
// ============================================================================

#[derive(Debug)]
struct Entry {
    host: HostName,
    generation: u64,
    request_type: RequestType,
    outcome: Option<(u64, ErrorRecord)>,
}

#[derive(Debug, Default)]
struct Board {
    entries: HashMap<SessionKey, Entry>,
    next_generation: u64,
}

impl Board {
    fn bump(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }
}

/// Mutex and condvar backed [`Checkboard`].
#[derive(Debug, Default)]
pub struct InMemoryCheckboard {
    board: Mutex<Board>,
    delivered: Condvar,
}

impl InMemoryCheckboard {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Board> {
        self.board.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Delivers the master's verdict for `key`, as reported by `from`.
    ///
    /// Returns false when the verdict was dropped: the session is gone or
    /// `from` is not the master the session is currently bound to.
    pub fn deliver(&self, key: SessionKey, from: &HostName, outcome: ErrorRecord) -> bool {
        let mut board = self.lock();
        let Some(entry) = board.entries.get_mut(&key) else {
            tracing::debug!(session = %key, host = %from, "dropping outcome for unknown session");
            return false;
        };
        if entry.host != *from {
            tracing::debug!(
                session = %key,
                host = %from,
                bound = %entry.host,
                "dropping outcome from stale master"
            );
            return false;
        }
        entry.outcome = Some((entry.generation, outcome));
        drop(board);
        self.delivered.notify_all();
        true
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_registered(&self, key: SessionKey) -> bool {
        self.lock().entries.contains_key(&key)
    }

    /// Master the session is bound to, if registered.
    pub fn bound_host(&self, key: SessionKey) -> Option<HostName> {
        self.lock().entries.get(&key).map(|entry| entry.host.clone())
    }

    /// Request type the session registered with.
    pub fn request_type(&self, key: SessionKey) -> Option<RequestType> {
        self.lock().entries.get(&key).map(|entry| entry.request_type)
    }
}

impl Checkboard for InMemoryCheckboard {
    fn register(
        &self,
        key: SessionKey,
        host: &HostName,
        request_type: RequestType,
    ) -> Result<Registration, CheckboardError> {
        let mut board = self.lock();
        if board.entries.contains_key(&key) {
            return Err(CheckboardError::AlreadyRegistered(key));
        }
        let generation = board.bump();
        board.entries.insert(
            key,
            Entry {
                host: host.clone(),
                generation,
                request_type,
                outcome: None,
            },
        );
        tracing::debug!(session = %key, host = %host, generation, "registered session");
        Ok(Registration { key, generation })
    }

    fn reuse(&self, key: SessionKey, host: &HostName) -> Result<Registration, CheckboardError> {
        let mut board = self.lock();
        let generation = board.bump();
        let entry = board
            .entries
            .get_mut(&key)
            .ok_or(CheckboardError::NotRegistered(key))?;
        entry.host = host.clone();
        entry.generation = generation;
        entry.outcome = None;
        tracing::debug!(session = %key, host = %host, generation, "re-bound session");
        Ok(Registration { key, generation })
    }

    fn unregister(&self, key: SessionKey) -> Result<(), CheckboardError> {
        let removed = self.lock().entries.remove(&key);
        // Wake any waiter so it observes the removal.
        self.delivered.notify_all();
        match removed {
            Some(_) => Ok(()),
            None => Err(CheckboardError::NotRegistered(key)),
        }
    }

    fn wait_for_outcome(
        &self,
        registration: Registration,
        timeout: Duration,
    ) -> Result<ErrorRecord, CheckboardError> {
        let key = registration.key;
        let deadline = Instant::now() + timeout;
        let mut board = self.lock();
        loop {
            let entry = board
                .entries
                .get_mut(&key)
                .ok_or(CheckboardError::NotRegistered(key))?;
            if entry.generation != registration.generation {
                return Err(CheckboardError::Fenced {
                    key,
                    expected: registration.generation,
                    current: entry.generation,
                });
            }
            match entry.outcome.take() {
                Some((generation, outcome)) if generation == registration.generation => {
                    return Ok(outcome);
                }
                // Stamped by an older binding.
                Some(_) | None => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(CheckboardError::TimedOut {
                    key,
                    waited: timeout,
                });
            }
            board = self
                .delivered
                .wait_timeout(board, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}
