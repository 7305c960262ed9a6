//! Deterministic collaborators for exercising sessions.
//!
//! - [`SimulatedMaster`]: a transport that records what each host received,
//!   fails scripted sends with "wrong master" and delivers scripted commit
//!   outcomes into an [`InMemoryCheckboard`]
//! - [`ManualCluster`]: a settable current master
//! - [`RecordingClock`]: time that only moves when a session sleeps
//! - [`ScriptedEngine`], [`DenyWrites`], [`ScriptedCoordinator`]: local
//!   engine, access control and distributed coordinator stubs
//! - [`StuckCheckboard`]: a checkboard whose unregister always fails
//! - [`Harness`]: all of the above wired into a [`SessionEnv`]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use osql_config::OsqlConfig;
use osql_types::{ErrorRecord, HostName, RequestType, SessionKey, TableName};

use crate::checkboard::{Checkboard, CheckboardError, InMemoryCheckboard, Registration};
use crate::env::{AccessControl, Clock, ClusterView, DistributedCoordinator, LocalEngine, SessionEnv};
use crate::message::{MessageKind, OsqlMessage};
use crate::session::{ClientOptions, Session};
use crate::transport::{SendError, Transport};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Cluster
// ============================================================================

/// Current master, set by the test.
#[derive(Debug, Default)]
pub struct ManualCluster {
    master: Mutex<Option<HostName>>,
    lookups: AtomicUsize,
}

impl ManualCluster {
    pub fn new(master: Option<HostName>) -> Self {
        Self {
            master: Mutex::new(master),
            lookups: AtomicUsize::new(0),
        }
    }

    pub fn set_master(&self, master: Option<HostName>) {
        *lock(&self.master) = master;
    }

    /// Current master, without counting a lookup.
    pub fn current(&self) -> Option<HostName> {
        lock(&self.master).clone()
    }

    /// How many times sessions asked for the master.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::Relaxed)
    }
}

impl ClusterView for ManualCluster {
    fn master(&self) -> Option<HostName> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        lock(&self.master).clone()
    }
}

// ============================================================================
// Simulated master
// ============================================================================

/// A message a host accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    pub host: HostName,
    pub key: SessionKey,
    pub message: OsqlMessage,
}

#[derive(Debug)]
struct Fault {
    kind: MessageKind,
    attempt: usize,
    promote: Option<HostName>,
}

#[derive(Debug, Default)]
struct MasterState {
    delivered: Vec<Delivered>,
    attempts: HashMap<MessageKind, usize>,
    faults: Vec<Fault>,
    always_wrong_master: bool,
    commit_outcomes: VecDeque<ErrorRecord>,
    withhold_outcomes: bool,
}

/// Transport standing in for every master in the cluster.
///
/// A host that is not the cluster's current master rejects sends with
/// "wrong master". Accepted commits get the next scripted outcome (ok when
/// none is scripted) delivered into the checkboard.
#[derive(Debug)]
pub struct SimulatedMaster {
    state: Mutex<MasterState>,
    cluster: Arc<ManualCluster>,
    checkboard: Arc<InMemoryCheckboard>,
}

impl SimulatedMaster {
    pub fn new(cluster: Arc<ManualCluster>, checkboard: Arc<InMemoryCheckboard>) -> Self {
        Self {
            state: Mutex::new(MasterState::default()),
            cluster,
            checkboard,
        }
    }

    /// Fails the `attempt`th send (1-based) of `kind` with "wrong master",
    /// then makes `promote` the master.
    pub fn fail_send(&self, kind: MessageKind, attempt: usize, promote: Option<HostName>) {
        lock(&self.state).faults.push(Fault {
            kind,
            attempt,
            promote,
        });
    }

    /// Rejects every send with "wrong master".
    pub fn set_always_wrong_master(&self, on: bool) {
        lock(&self.state).always_wrong_master = on;
    }

    pub fn push_commit_outcome(&self, outcome: ErrorRecord) {
        lock(&self.state).commit_outcomes.push_back(outcome);
    }

    pub fn repeat_commit_outcome(&self, outcome: &ErrorRecord, times: usize) {
        let mut state = lock(&self.state);
        for _ in 0..times {
            state.commit_outcomes.push_back(outcome.clone());
        }
    }

    /// Accepts commits without ever answering them.
    pub fn withhold_outcomes(&self, on: bool) {
        lock(&self.state).withhold_outcomes = on;
    }

    /// Every accepted message, in order.
    pub fn delivered(&self) -> Vec<Delivered> {
        lock(&self.state).delivered.clone()
    }

    /// Messages `host` accepted, in order.
    pub fn messages_to(&self, host: &HostName) -> Vec<OsqlMessage> {
        lock(&self.state)
            .delivered
            .iter()
            .filter(|d| d.host == *host)
            .map(|d| d.message.clone())
            .collect()
    }

    /// Accepted messages of `kind`, across hosts.
    pub fn count(&self, kind: MessageKind) -> usize {
        lock(&self.state)
            .delivered
            .iter()
            .filter(|d| d.message.kind() == kind)
            .count()
    }

    pub fn count_to(&self, host: &HostName, kind: MessageKind) -> usize {
        lock(&self.state)
            .delivered
            .iter()
            .filter(|d| d.host == *host && d.message.kind() == kind)
            .count()
    }

    /// Send attempts of `kind`, accepted or not.
    pub fn attempts(&self, kind: MessageKind) -> usize {
        lock(&self.state).attempts.get(&kind).copied().unwrap_or(0)
    }
}

impl Transport for SimulatedMaster {
    fn send(
        &self,
        host: &HostName,
        key: SessionKey,
        message: &OsqlMessage,
    ) -> Result<(), SendError> {
        let kind = message.kind();
        let mut state = lock(&self.state);
        let attempt = {
            let counter = state.attempts.entry(kind).or_insert(0);
            *counter += 1;
            *counter
        };

        let wrong_master = || SendError::WrongMaster { host: host.clone() };
        if state.always_wrong_master {
            return Err(wrong_master());
        }
        if let Some(pos) = state
            .faults
            .iter()
            .position(|f| f.kind == kind && f.attempt == attempt)
        {
            let fault = state.faults.remove(pos);
            if let Some(promote) = fault.promote {
                self.cluster.set_master(Some(promote));
            }
            return Err(wrong_master());
        }
        if self.cluster.current().as_ref() != Some(host) {
            return Err(wrong_master());
        }

        state.delivered.push(Delivered {
            host: host.clone(),
            key,
            message: message.clone(),
        });

        if let OsqlMessage::Commit { error, .. } = message {
            if error.is_ok() && !state.withhold_outcomes {
                let outcome = state.commit_outcomes.pop_front().unwrap_or_default();
                drop(state);
                self.checkboard.deliver(key, host, outcome);
            }
        }
        Ok(())
    }
}

// ============================================================================
// Clock
// ============================================================================

/// Clock that advances only by the sleeps it is asked for.
#[derive(Debug)]
pub struct RecordingClock {
    origin: Instant,
    sleeps: Mutex<Vec<Duration>>,
}

impl RecordingClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        lock(&self.sleeps).clone()
    }

    pub fn total_slept(&self) -> Duration {
        lock(&self.sleeps).iter().sum()
    }
}

impl Default for RecordingClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for RecordingClock {
    fn now(&self) -> Instant {
        self.origin + self.total_slept()
    }

    fn sleep(&self, duration: Duration) {
        lock(&self.sleeps).push(duration);
    }
}

// ============================================================================
// Engine, access, coordinator
// ============================================================================

/// Local engine whose lock contention and failures are scripted.
#[derive(Debug, Default)]
pub struct ScriptedEngine {
    contended_checks: AtomicU32,
    recoveries: Mutex<Vec<Duration>>,
    fail_release: AtomicBool,
    releases: AtomicUsize,
    shadow_aborts: AtomicUsize,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports contention on the next `checks` lock checks.
    pub fn contend(&self, checks: u32) {
        self.contended_checks.store(checks, Ordering::Relaxed);
    }

    pub fn fail_release(&self, on: bool) {
        self.fail_release.store(on, Ordering::Relaxed);
    }

    /// Backoffs passed to deadlock recovery.
    pub fn recoveries(&self) -> Vec<Duration> {
        lock(&self.recoveries).clone()
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::Relaxed)
    }

    pub fn shadow_aborts(&self) -> usize {
        self.shadow_aborts.load(Ordering::Relaxed)
    }
}

impl LocalEngine for ScriptedEngine {
    fn lock_desired(&self) -> bool {
        self.contended_checks
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
    }

    fn recover_deadlock(&self, backoff: Duration) -> Result<(), String> {
        lock(&self.recoveries).push(backoff);
        Ok(())
    }

    fn release_cursor_locks(&self) -> Result<(), String> {
        self.releases.fetch_add(1, Ordering::Relaxed);
        if self.fail_release.load(Ordering::Relaxed) {
            return Err("cursor lock release failed".to_string());
        }
        Ok(())
    }

    fn abort_shadow_transaction(&self) -> Result<(), String> {
        self.shadow_aborts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Denies writes to the listed tables.
#[derive(Debug, Default)]
pub struct DenyWrites {
    tables: HashSet<TableName>,
}

impl DenyWrites {
    pub fn new(tables: impl IntoIterator<Item = TableName>) -> Self {
        Self {
            tables: tables.into_iter().collect(),
        }
    }
}

impl AccessControl for DenyWrites {
    fn check_write(&self, table: &TableName, user: Option<&str>) -> Result<(), String> {
        if self.tables.contains(table) {
            return Err(format!("user {} may not write", user.unwrap_or("<anonymous>")));
        }
        Ok(())
    }
}

/// Distributed coordinator that succeeds or fails as told.
#[derive(Debug, Clone, Default)]
pub struct ScriptedCoordinator {
    pub fail: bool,
    pub commits: Arc<AtomicUsize>,
}

impl DistributedCoordinator for ScriptedCoordinator {
    fn commit(&mut self) -> Result<(), String> {
        self.commits.fetch_add(1, Ordering::Relaxed);
        if self.fail {
            return Err("participant refused to commit".to_string());
        }
        Ok(())
    }
}

/// Forwards to an [`InMemoryCheckboard`] but never lets a session go.
///
/// The entry stays on the inner board, so outcomes still reach it.
#[derive(Debug)]
pub struct StuckCheckboard {
    inner: Arc<InMemoryCheckboard>,
    refused: AtomicUsize,
}

impl StuckCheckboard {
    pub fn new(inner: Arc<InMemoryCheckboard>) -> Self {
        Self {
            inner,
            refused: AtomicUsize::new(0),
        }
    }

    /// Unregister calls refused so far.
    pub fn refused(&self) -> usize {
        self.refused.load(Ordering::Relaxed)
    }
}

impl Checkboard for StuckCheckboard {
    fn register(
        &self,
        key: SessionKey,
        host: &HostName,
        request_type: RequestType,
    ) -> Result<Registration, CheckboardError> {
        self.inner.register(key, host, request_type)
    }

    fn reuse(&self, key: SessionKey, host: &HostName) -> Result<Registration, CheckboardError> {
        self.inner.reuse(key, host)
    }

    fn unregister(&self, key: SessionKey) -> Result<(), CheckboardError> {
        self.refused.fetch_add(1, Ordering::Relaxed);
        Err(CheckboardError::NotRegistered(key))
    }

    fn wait_for_outcome(
        &self,
        registration: Registration,
        timeout: Duration,
    ) -> Result<ErrorRecord, CheckboardError> {
        self.inner.wait_for_outcome(registration, timeout)
    }
}

// ============================================================================
// Harness
// ============================================================================

/// A simulated cluster with master "m1" and one environment for sessions.
pub struct Harness {
    pub cluster: Arc<ManualCluster>,
    pub checkboard: Arc<InMemoryCheckboard>,
    pub master: Arc<SimulatedMaster>,
    pub clock: Arc<RecordingClock>,
    pub engine: Arc<ScriptedEngine>,
    pub env: SessionEnv,
}

impl Harness {
    pub fn new(config: OsqlConfig) -> Self {
        let cluster = Arc::new(ManualCluster::new(Some(HostName::new("m1"))));
        let checkboard = Arc::new(InMemoryCheckboard::new());
        let master = Arc::new(SimulatedMaster::new(
            Arc::clone(&cluster),
            Arc::clone(&checkboard),
        ));
        let clock = Arc::new(RecordingClock::new());
        let engine = Arc::new(ScriptedEngine::new());
        let env = SessionEnv::new(
            Arc::clone(&master) as Arc<dyn Transport>,
            Arc::clone(&checkboard) as Arc<dyn Checkboard>,
            Arc::clone(&cluster) as Arc<dyn ClusterView>,
            config,
        )
        .with_clock(Arc::clone(&clock) as Arc<dyn Clock>)
        .with_engine(Arc::clone(&engine) as Arc<dyn LocalEngine>);
        Self {
            cluster,
            checkboard,
            master,
            clock,
            engine,
            env,
        }
    }

    /// Harness with [`OsqlConfig::testing`].
    pub fn testing() -> Self {
        Self::new(OsqlConfig::testing())
    }

    pub fn session(&self, options: ClientOptions) -> Session {
        Session::new(self.env.clone(), options)
    }
}
