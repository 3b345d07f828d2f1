// SPDX-FileCopyrightText: 2025 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Session registry and daemon lifecycle.
//!
//! Every caller owns a [`Session`]. A session is registered on its first
//! operation and gets a connection from, in order: its own live
//! connection, the primary connection if a previous owner reset it, a new
//! connection through the daemon's socket, or a freshly started daemon.
//!
//! The registry lock only guards bookkeeping. Protocol I/O never happens
//! while it is held; a daemon start in progress is tracked with a flag and
//! other acquirers wait on a [`Notify`].
//!
//! Callers may drop an operation at any await point. Guards put the
//! bookkeeping straight again: an abandoned acquire frees the session and
//! the start flag, an abandoned transaction discards its connection.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use cardagent_assuan::BoxedConnection;
use futures::future::BoxFuture;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{Result, ScdError};
use crate::pincache::PinCache;
use crate::supervisor::{self, DaemonExit, Launcher};
use crate::transaction::Transaction;

/// A connection shared between a session and the registry.
pub type SharedConnection = Arc<Mutex<BoxedConnection>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

#[derive(Default)]
struct SessionSlot {
    conn: Option<SharedConnection>,
    in_use: bool,
    /// The daemon behind `conn` died while the session was in use
    invalid: bool,
}

struct Primary {
    conn: SharedConnection,
    pid: u32,
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<SessionId, SessionSlot>,
    primary: Option<Primary>,
    primary_reusable: bool,
    socket_name: Option<PathBuf>,
    starting: bool,
    /// Bumped for every started daemon, so a late reaper cannot clear the
    /// state of its successor
    generation: u64,
}

struct Shared {
    state: Mutex<RegistryState>,
    started: Notify,
    running: AtomicBool,
    next_id: AtomicU64,
    config: Config,
    launcher: Box<dyn Launcher>,
    cache: Arc<dyn PinCache>,
}

impl Shared {
    /// Update the state from a `Drop` impl: right away when the lock is
    /// free, otherwise from a spawned task.
    fn update_detached<F>(self: Arc<Self>, update: F)
    where
        F: FnOnce(&Shared, &mut RegistryState) + Send + 'static,
    {
        if let Ok(mut state) = self.state.try_lock() {
            update(&self, &mut state);
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let mut state = self.state.lock().await;
                    update(&self, &mut state);
                });
            }
            Err(_) => error!("registry state update dropped outside a runtime"),
        }
    }
}

impl RegistryState {
    /// Clear the in-use mark of `id`. A connection whose daemon died is
    /// dropped. Returns false when `id` was not in use.
    fn release_slot(&mut self, id: SessionId) -> bool {
        match self.sessions.get_mut(&id) {
            Some(slot) if slot.in_use => {
                slot.in_use = false;
                if slot.invalid {
                    debug!("{id}: dropping connection to exited daemon");
                    slot.conn = None;
                    slot.invalid = false;
                }
                true
            }
            _ => false,
        }
    }

    /// Free `id` after a transaction on its connection was cut short. The
    /// connection may still carry unread responses, so it is discarded;
    /// when it is the primary one, the next acquirer starts a new daemon.
    fn abandon_slot(&mut self, id: SessionId, running: &AtomicBool) {
        let Some(slot) = self.sessions.get_mut(&id) else {
            return;
        };
        slot.in_use = false;
        slot.invalid = false;
        let Some(conn) = slot.conn.take() else {
            return;
        };
        if self
            .primary
            .as_ref()
            .is_some_and(|primary| Arc::ptr_eq(&primary.conn, &conn))
        {
            warn!("{id}: transaction abandoned, giving up the primary connection");
            self.primary = None;
            self.primary_reusable = false;
            running.store(false, Ordering::Release);
        } else {
            warn!("{id}: transaction abandoned, closing connection");
        }
    }
}

/// Undoes the bookkeeping of an acquire dropped while it connects to or
/// starts the daemon.
struct PendingAcquire {
    shared: Option<Arc<Shared>>,
    id: SessionId,
    starting: bool,
}

impl PendingAcquire {
    fn new(shared: &Arc<Shared>, id: SessionId, starting: bool) -> Self {
        Self {
            shared: Some(Arc::clone(shared)),
            id,
            starting,
        }
    }

    /// The state has been updated with the outcome.
    fn complete(mut self) {
        self.shared = None;
    }
}

impl Drop for PendingAcquire {
    fn drop(&mut self) {
        let Some(shared) = self.shared.take() else {
            return;
        };
        let id = self.id;
        let starting = self.starting;
        debug!("{id}: acquire abandoned");
        shared.update_detached(move |shared, state| {
            if let Some(slot) = state.sessions.get_mut(&id) {
                slot.in_use = false;
            }
            if starting {
                state.starting = false;
                shared.started.notify_waiters();
            }
        });
    }
}

/// Process-wide registry of sessions talking to the card daemon.
#[derive(Clone)]
pub struct Registry {
    shared: Arc<Shared>,
}

/// Registry state for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrySnapshot {
    pub primary_pid: Option<u32>,
    pub primary_reusable: bool,
    pub socket_name: Option<PathBuf>,
    pub sessions: Vec<SessionSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub has_connection: bool,
    pub in_use: bool,
    pub invalid: bool,
}

enum Acquired {
    Ready(SharedConnection),
    Wait,
    Connect { socket: PathBuf, generation: u64 },
    Start,
}

impl Registry {
    pub fn new(config: Config, launcher: Box<dyn Launcher>, cache: Arc<dyn PinCache>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(RegistryState::default()),
                started: Notify::new(),
                running: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                config,
                launcher,
                cache,
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn cache(&self) -> &dyn PinCache {
        self.shared.cache.as_ref()
    }

    /// Create a session for a new caller. It is registered on first use.
    pub fn session(&self) -> Session {
        let id = SessionId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        Session {
            registry: self.clone(),
            id,
            reset_done: false,
        }
    }

    /// Whether a primary daemon connection exists. Lock free, so the answer
    /// may be stale while a daemon is starting or exiting.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    fn log_progress(&self, message: &str) {
        if self.shared.config.verbose {
            info!("{message}");
        } else {
            debug!("{message}");
        }
    }

    /// Mark `id` in use and hand out its connection, starting the daemon
    /// when needed.
    pub(crate) async fn acquire(&self, id: SessionId) -> Result<SharedConnection> {
        if self.shared.config.disable_scdaemon {
            return Err(ScdError::NotSupported);
        }

        loop {
            let notified = self.shared.started.notified();
            let step = {
                let mut state = self.shared.state.lock().await;
                self.next_step(&mut state, id)?
            };

            match step {
                Acquired::Ready(conn) => return Ok(conn),
                Acquired::Wait => {
                    notified.await;
                    continue;
                }
                Acquired::Connect { socket, generation } => {
                    let pending = PendingAcquire::new(&self.shared, id, false);
                    let result =
                        supervisor::connect_secondary(self.shared.launcher.as_ref(), &socket).await;
                    let result = result.map(|conn| Arc::new(Mutex::new(conn)));
                    return self.attach(id, generation, result, pending).await;
                }
                Acquired::Start => {
                    let pending = PendingAcquire::new(&self.shared, id, true);
                    return self.start_daemon(id, pending).await;
                }
            }
        }
    }

    fn next_step(&self, state: &mut RegistryState, id: SessionId) -> Result<Acquired> {
        let RegistryState {
            sessions,
            primary,
            primary_reusable,
            socket_name,
            starting,
            generation,
        } = state;
        let slot = sessions.entry(id).or_default();

        if slot.in_use {
            error!("{id}: acquired while already in use");
            return Err(ScdError::internal("session is already in use"));
        }
        if let Some(conn) = &slot.conn {
            slot.in_use = true;
            return Ok(Acquired::Ready(conn.clone()));
        }

        if *primary_reusable && let Some(primary) = primary.as_ref() {
            self.log_progress("new connection to SCdaemon established (reusing)");
            *primary_reusable = false;
            slot.conn = Some(primary.conn.clone());
            slot.in_use = true;
            slot.invalid = false;
            return Ok(Acquired::Ready(primary.conn.clone()));
        }

        if let Some(socket) = socket_name.as_ref() {
            slot.in_use = true;
            return Ok(Acquired::Connect {
                socket: socket.clone(),
                generation: *generation,
            });
        }

        if primary.is_some() {
            info!("SCdaemon is running but won't accept further connections");
            return Err(ScdError::no_scdaemon(
                "daemon is busy and accepts no further connections",
            ));
        }

        if *starting {
            return Ok(Acquired::Wait);
        }

        *starting = true;
        slot.in_use = true;
        Ok(Acquired::Start)
    }

    /// Finish a secondary connect that ran without the lock.
    async fn attach(
        &self,
        id: SessionId,
        generation: u64,
        result: Result<SharedConnection>,
        pending: PendingAcquire,
    ) -> Result<SharedConnection> {
        let mut state = self.shared.state.lock().await;
        pending.complete();
        // the daemon may have exited while connecting
        let stale = state.generation != generation || state.socket_name.is_none();
        let slot = state.sessions.entry(id).or_default();
        match result {
            Ok(conn) => {
                self.log_progress("new connection to SCdaemon established");
                slot.conn = Some(conn.clone());
                slot.invalid = stale;
                Ok(conn)
            }
            Err(e) => {
                slot.in_use = false;
                Err(e)
            }
        }
    }

    async fn start_daemon(
        &self,
        id: SessionId,
        pending: PendingAcquire,
    ) -> Result<SharedConnection> {
        let shared = &self.shared;
        let result =
            supervisor::start(&shared.config, shared.launcher.as_ref(), shared.cache.as_ref()).await;

        let mut state = shared.state.lock().await;
        pending.complete();
        state.starting = false;
        let outcome = match result {
            Ok(started) => {
                let conn: SharedConnection = Arc::new(Mutex::new(started.connection));
                state.generation += 1;
                let generation = state.generation;
                state.primary = Some(Primary {
                    conn: conn.clone(),
                    pid: started.pid,
                });
                state.primary_reusable = false;
                state.socket_name = started.socket_name;
                let slot = state.sessions.entry(id).or_default();
                slot.conn = Some(conn.clone());
                slot.invalid = false;
                shared.running.store(true, Ordering::Release);
                info!("SCdaemon started (pid {})", started.pid);

                let reaper = Arc::clone(shared);
                tokio::spawn(watch_daemon(reaper, generation, started.pid, started.exit));
                Ok(conn)
            }
            Err(e) => {
                if let Some(slot) = state.sessions.get_mut(&id) {
                    slot.in_use = false;
                }
                Err(e)
            }
        };
        drop(state);
        shared.started.notify_waiters();
        outcome
    }

    /// End the transaction of `id`, passing `result` through.
    ///
    /// A connection whose daemon died meanwhile is dropped here. Releasing a
    /// session that is not in use is a caller bug: it is logged and a
    /// successful `result` becomes [`ScdError::Internal`].
    pub(crate) async fn release<T>(&self, id: SessionId, result: Result<T>) -> Result<T> {
        let mut state = self.shared.state.lock().await;
        if state.release_slot(id) {
            result
        } else {
            error!("{id}: released while not in use");
            result.and(Err(ScdError::internal("session released while not in use")))
        }
    }

    /// Unregister `id`.
    ///
    /// A primary connection is restarted and left for the next acquirer;
    /// any other connection is closed.
    pub async fn reset(&self, id: SessionId) {
        let mut state = self.shared.state.lock().await;
        let Some(slot) = state.sessions.remove(&id) else {
            return;
        };
        let Some(conn) = slot.conn else {
            return;
        };
        let is_primary = state
            .primary
            .as_ref()
            .is_some_and(|primary| Arc::ptr_eq(&primary.conn, &conn));
        if !is_primary {
            debug!("{id}: closing connection");
            return;
        }

        // Take the connection before it is offered again, so the next
        // acquirer only sees it after RESTART went through.
        let guard = conn.clone().try_lock_owned();
        state.primary_reusable = true;
        drop(state);

        let mut guard = match guard {
            Ok(guard) => guard,
            Err(_) => {
                warn!("{id}: primary connection busy during reset");
                conn.lock_owned().await
            }
        };
        if let Err(e) = Transaction::new("RESTART")
            .run(&mut guard, self.shared.cache.as_ref())
            .await
        {
            debug!("{id}: RESTART failed: {e}");
        }
    }

    /// Ask the daemon to terminate and flush the PIN cache.
    pub async fn kill_daemon(&self) {
        let primary = {
            let state = self.shared.state.lock().await;
            state.primary.as_ref().map(|primary| primary.conn.clone())
        };
        if let Some(conn) = primary {
            let mut conn = conn.lock().await;
            if let Err(e) = Transaction::new("KILLSCD")
                .run(&mut conn, self.shared.cache.as_ref())
                .await
            {
                debug!("KILLSCD failed: {e}");
            }
        }
        self.shared.cache.flush_pins();
    }

    pub async fn snapshot(&self) -> RegistrySnapshot {
        let state = self.shared.state.lock().await;
        let mut sessions: Vec<SessionSnapshot> = state
            .sessions
            .iter()
            .map(|(id, slot)| SessionSnapshot {
                id: *id,
                has_connection: slot.conn.is_some(),
                in_use: slot.in_use,
                invalid: slot.invalid,
            })
            .collect();
        sessions.sort_by_key(|session| session.id);
        RegistrySnapshot {
            primary_pid: state.primary.as_ref().map(|primary| primary.pid),
            primary_reusable: state.primary_reusable,
            socket_name: state.socket_name.clone(),
            sessions,
        }
    }

    /// Log the daemon state.
    pub async fn dump_state(&self) {
        let snapshot = self.snapshot().await;
        info!(
            "scd state: primary={} pid={} reusable={}",
            snapshot.primary_pid.is_some(),
            snapshot.primary_pid.map_or(-1, i64::from),
            snapshot.primary_reusable
        );
        if let Some(socket) = &snapshot.socket_name {
            info!("scd state: socket='{}'", socket.display());
        }
    }
}

async fn watch_daemon(
    shared: Arc<Shared>,
    generation: u64,
    pid: u32,
    exit: BoxFuture<'static, DaemonExit>,
) {
    match exit.await {
        DaemonExit::Exited(code) => info!("SCdaemon (pid {pid}) exited with status {code}"),
        DaemonExit::Signaled(signal) => {
            info!("SCdaemon (pid {pid}) terminated by signal {signal}");
        }
        DaemonExit::WaitFailed(e) => {
            error!("waiting for SCdaemon (pid {pid}) failed: {e}");
            return;
        }
    }

    shared.cache.flush_pins();

    let mut state = shared.state.lock().await;
    if state.generation != generation {
        return;
    }
    for slot in state.sessions.values_mut() {
        slot.invalid = true;
        if !slot.in_use {
            slot.conn = None;
        }
    }
    state.primary = None;
    state.primary_reusable = false;
    state.socket_name = None;
    shared.running.store(false, Ordering::Release);
}

/// One caller's handle on the daemon.
///
/// Dropping a session resets it in the background; [`Session::reset`]
/// does the same and waits for it.
pub struct Session {
    registry: Registry,
    id: SessionId,
    reset_done: bool,
}

impl Session {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub(crate) async fn acquire(&self) -> Result<Lease<'_>> {
        let conn = self.registry.acquire(self.id).await?;
        Ok(Lease {
            session: self,
            conn,
            finished: false,
            released: false,
        })
    }

    pub async fn reset(mut self) {
        self.reset_done = true;
        self.registry.reset(self.id).await;
    }
}

/// A session's connection, held for the duration of one operation.
///
/// A lease dropped before its transactions finished leaves the connection
/// out of step with the daemon; the registry discards it.
pub(crate) struct Lease<'a> {
    session: &'a Session,
    conn: SharedConnection,
    finished: bool,
    released: bool,
}

impl Lease<'_> {
    pub(crate) fn conn(&self) -> &SharedConnection {
        &self.conn
    }

    /// Hand the connection back, passing `result` through.
    pub(crate) async fn release<T>(mut self, result: Result<T>) -> Result<T> {
        self.finished = true;
        let result = self.session.registry.release(self.session.id, result).await;
        self.released = true;
        result
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let id = self.session.id;
        let finished = self.finished;
        Arc::clone(&self.session.registry.shared).update_detached(move |shared, state| {
            if finished {
                state.release_slot(id);
            } else {
                state.abandon_slot(id, &shared.running);
            }
        });
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.reset_done {
            return;
        }
        let registry = self.registry.clone();
        let id = self.id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { registry.reset(id).await });
            }
            Err(_) => debug!("{id}: dropped outside a runtime, not reset"),
        }
    }
}
