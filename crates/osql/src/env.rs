//! Collaborators a session runs against.
//!
//! The session state machine is pure protocol logic; everything it touches
//! outside itself sits behind a trait here:
//! - **Cluster view**: who is master right now
//! - **Local engine**: lock contention, deadlock recovery, cursor locks and
//!   the local write-ahead transaction
//! - **Access control**: write authorization per table
//! - **Clock**: time and blocking sleeps, replaceable in tests
//! - **Distributed coordinator**: cross-partition commit
//!
//! [`SessionEnv`] bundles them with the transport, checkboard, tunables and
//! configuration, and is cheap to clone across sessions.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use osql_config::OsqlConfig;
use osql_types::{HostName, TableName};

use crate::checkboard::Checkboard;
use crate::transport::Transport;
use crate::tunables::Tunables;

// ============================================================================
// Traits
// ============================================================================

/// Process-wide knowledge of the current master.
///
/// The answer may be stale; the master rejects sends it does not own.
pub trait ClusterView: Send + Sync {
    fn master(&self) -> Option<HostName>;
}

/// Local storage engine hooks.
pub trait LocalEngine: Send + Sync {
    /// Whether another thread wants the locks this session holds.
    fn lock_desired(&self) -> bool;

    /// Releases and re-acquires local locks after waiting `backoff`.
    fn recover_deadlock(&self, backoff: Duration) -> Result<(), String>;

    /// Releases row locks held by the transaction's read cursor.
    fn release_cursor_locks(&self) -> Result<(), String>;

    /// Aborts the local write-ahead transaction backing the shadow buffer.
    fn abort_shadow_transaction(&self) -> Result<(), String>;
}

/// Write authorization.
pub trait AccessControl: Send + Sync {
    fn check_write(&self, table: &TableName, user: Option<&str>) -> Result<(), String>;
}

/// Time source for deadlines, timings and backoff.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    /// Blocks the calling thread.
    fn sleep(&self, duration: Duration);
}

/// Cross-partition transaction coordinator.
pub trait DistributedCoordinator: Send {
    fn commit(&mut self) -> Result<(), String>;
}

// ============================================================================
// Default implementations
// ============================================================================

/// Wall-clock time and real sleeps.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            thread::sleep(duration);
        }
    }
}

/// Engine with no lock contention and nothing to release.
#[derive(Debug, Clone, Copy, Default)]
pub struct UncontendedEngine;

impl LocalEngine for UncontendedEngine {
    fn lock_desired(&self) -> bool {
        false
    }

    fn recover_deadlock(&self, _backoff: Duration) -> Result<(), String> {
        Ok(())
    }

    fn release_cursor_locks(&self) -> Result<(), String> {
        Ok(())
    }

    fn abort_shadow_transaction(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Grants every write.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessControl for AllowAll {
    fn check_write(&self, _table: &TableName, _user: Option<&str>) -> Result<(), String> {
        Ok(())
    }
}

// ============================================================================
// Environment
// ============================================================================

/// Shared collaborators and configuration for sessions.
#[derive(Clone)]
pub struct SessionEnv {
    pub transport: Arc<dyn Transport>,
    pub checkboard: Arc<dyn Checkboard>,
    pub cluster: Arc<dyn ClusterView>,
    pub engine: Arc<dyn LocalEngine>,
    pub access: Arc<dyn AccessControl>,
    pub clock: Arc<dyn Clock>,
    pub tunables: Arc<Tunables>,
    pub config: Arc<OsqlConfig>,
}

impl SessionEnv {
    /// Environment with the system clock, an uncontended engine, open
    /// access and tunables taken from `config`.
    pub fn new(
        transport: Arc<dyn Transport>,
        checkboard: Arc<dyn Checkboard>,
        cluster: Arc<dyn ClusterView>,
        config: OsqlConfig,
    ) -> Self {
        Self {
            transport,
            checkboard,
            cluster,
            engine: Arc::new(UncontendedEngine),
            access: Arc::new(AllowAll),
            clock: Arc::new(SystemClock),
            tunables: Arc::new(Tunables::from_config(&config.limits)),
            config: Arc::new(config),
        }
    }

    pub fn with_engine(mut self, engine: Arc<dyn LocalEngine>) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_access(mut self, access: Arc<dyn AccessControl>) -> Self {
        self.access = access;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_tunables(mut self, tunables: Arc<Tunables>) -> Self {
        self.tunables = tunables;
        self
    }
}

impl std::fmt::Debug for SessionEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEnv")
            .field("tunables", &self.tunables)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
