//! Asynchronous connection pool.
//!
//! All bookkeeping lives behind one mutex that is never held across an
//! `.await`. Connections are opened, closed and handed to waiters outside
//! the lock. The pool spawns background tasks (closing, eviction,
//! replacement connects) and must be used inside a tokio runtime.

use std::collections::{HashMap, VecDeque};
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};

use crate::error::{Error, Result};
use crate::opts::Opts;
use crate::result::QueryResult;
use crate::state::connection::ConnectionState;

use super::Conn;
use super::conn::{Transport, terminate};

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Open connections, idle or checked out.
    pub live: usize,
    /// Connections being opened; they count against `pool_max` too.
    pub connecting: usize,
    /// Connections parked on the idle stack.
    pub idle: usize,
    /// Callers queued for a connection.
    pub waiting: usize,
}

/// Connection pool.
///
/// Cloning is cheap and every clone shares the same connections.
#[derive(Debug, Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    opts: Opts,
    max: usize,
    state: Mutex<PoolState>,
}

#[derive(Debug, Default)]
struct PoolState {
    idle: Vec<IdleConn>,
    /// Open connections by id, with their transports so that shutdown can
    /// close checked-out ones.
    live: HashMap<u64, Transport>,
    connecting: usize,
    waiters: VecDeque<Waiter>,
    next_waiter_id: u64,
    next_idle_epoch: u64,
    ended: bool,
}

#[derive(Debug)]
struct IdleConn {
    conn: Conn,
    /// Identifies this stay on the idle stack; a later stay of the same
    /// connection gets a new epoch.
    epoch: u64,
    evict: Option<JoinHandle<()>>,
}

#[derive(Debug)]
struct Waiter {
    id: u64,
    tx: oneshot::Sender<Result<Conn>>,
}

enum Acquire {
    Idle(Conn),
    Connect(Reservation),
    Wait(QueuedWaiter),
}

impl Pool {
    /// Create an empty pool. No connection is opened until `get`.
    ///
    /// A `pool_max` of 0 is treated as 1.
    pub fn new(opts: Opts) -> Self {
        let max = opts.pool_max.max(1);
        Self {
            inner: Arc::new(PoolInner {
                opts,
                max,
                state: Mutex::new(PoolState::default()),
            }),
        }
    }

    /// Check out a connection.
    ///
    /// Reuses the most recently released idle connection, opens a new one
    /// while below `pool_max`, and otherwise queues the caller.
    pub async fn get(&self) -> Result<PooledConn> {
        match self.inner.acquire()? {
            Acquire::Idle(conn) => {
                tracing::debug!(conn = conn.id(), "reusing idle connection");
                Ok(self.wrap(conn))
            }
            Acquire::Connect(reservation) => {
                let mut conn = Conn::new(self.inner.opts.clone()).await?;
                let ended = {
                    let mut state = self.inner.lock();
                    reservation.disarm(&mut state);
                    if !state.ended {
                        state.live.insert(conn.id(), conn.transport());
                    }
                    state.ended
                };
                if ended {
                    conn.close().await;
                    return Err(Error::PoolClosed);
                }
                tracing::debug!(conn = conn.id(), "opened pooled connection");
                Ok(self.wrap(conn))
            }
            Acquire::Wait(waiter) => self.wait(waiter).await,
        }
    }

    async fn wait(&self, mut waiter: QueuedWaiter) -> Result<PooledConn> {
        let id = waiter.id;
        let received = match self.inner.opts.pool_wait_timeout {
            None => (&mut waiter.rx).await,
            Some(limit) => match tokio::time::timeout(limit, &mut waiter.rx).await {
                Ok(received) => received,
                Err(_) => {
                    let still_queued = {
                        let mut state = self.inner.lock();
                        match state.waiters.iter().position(|w| w.id == id) {
                            Some(pos) => {
                                state.waiters.remove(pos);
                                true
                            }
                            None => false,
                        }
                    };
                    if still_queued {
                        return Err(Error::PoolWaitTimeout);
                    }
                    // Served concurrently with the timeout.
                    match waiter.rx.try_recv() {
                        Ok(received) => Ok(received),
                        Err(oneshot::error::TryRecvError::Empty) => {
                            return Err(Error::PoolWaitTimeout);
                        }
                        Err(oneshot::error::TryRecvError::Closed) => {
                            return Err(Error::PoolClosed);
                        }
                    }
                }
            },
        };

        match received {
            Ok(Ok(conn)) => {
                tracing::debug!(conn = conn.id(), "handed connection to waiter");
                Ok(self.wrap(conn))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::PoolClosed),
        }
    }

    fn wrap(&self, conn: Conn) -> PooledConn {
        PooledConn {
            pool: Arc::clone(&self.inner),
            conn: ManuallyDrop::new(conn),
        }
    }

    /// Run a query on a pooled connection and release it.
    pub async fn query(&self, sql: &str) -> Result<QueryResult> {
        let mut conn = self.get().await?;
        conn.query(sql).await
    }

    /// Current occupancy.
    pub fn status(&self) -> PoolStatus {
        let state = self.inner.lock();
        PoolStatus {
            live: state.live.len(),
            connecting: state.connecting,
            idle: state.idle.len(),
            waiting: state.waiters.len(),
        }
    }

    /// Close the pool.
    ///
    /// Every live connection, idle and checked-out alike, is sent Terminate
    /// and closed concurrently. A checked-out connection running a query is
    /// closed once that query finishes, and later queries on it fail with
    /// [`Error::PoolClosed`]. Queued callers fail with
    /// [`Error::PoolClosed`]. Calling it again is a no-op.
    pub async fn shutdown(&self) {
        let (idle, checked_out, waiters) = {
            let mut state = self.inner.lock();
            if state.ended {
                return;
            }
            state.ended = true;
            let idle = std::mem::take(&mut state.idle);
            for entry in &idle {
                state.live.remove(&entry.conn.id());
            }
            let checked_out: Vec<(u64, Transport)> = state.live.drain().collect();
            (idle, checked_out, std::mem::take(&mut state.waiters))
        };
        tracing::debug!(
            idle = idle.len(),
            checked_out = checked_out.len(),
            waiting = waiters.len(),
            "pool shutting down"
        );
        drop(waiters);

        let mut closing = JoinSet::new();
        for entry in idle {
            if let Some(evict) = entry.evict {
                evict.abort();
            }
            let mut conn = entry.conn;
            closing.spawn(async move { conn.close().await });
        }
        for (id, transport) in checked_out {
            closing.spawn(async move {
                terminate(&transport, id).await;
            });
        }
        while closing.join_next().await.is_some() {}
    }
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn acquire(self: &Arc<Self>) -> Result<Acquire> {
        let mut state = self.lock();
        if state.ended {
            return Err(Error::PoolClosed);
        }

        if let Some(entry) = state.idle.pop() {
            if let Some(evict) = entry.evict {
                evict.abort();
            }
            return Ok(Acquire::Idle(entry.conn));
        }

        if state.live.len() + state.connecting < self.max {
            state.connecting += 1;
            return Ok(Acquire::Connect(Reservation {
                pool: Arc::clone(self),
                armed: true,
            }));
        }

        if !self.opts.pool_wait_for_connections {
            return Err(Error::PoolExhausted);
        }
        state.waiters.retain(|w| !w.tx.is_closed());
        if self.opts.pool_queue_limit > 0 && state.waiters.len() >= self.opts.pool_queue_limit {
            return Err(Error::PoolQueueLimit);
        }

        let id = state.next_waiter_id;
        state.next_waiter_id += 1;
        let (tx, rx) = oneshot::channel();
        state.waiters.push_back(Waiter { id, tx });
        tracing::debug!(waiting = state.waiters.len(), "pool saturated, queueing");
        Ok(Acquire::Wait(QueuedWaiter {
            pool: Arc::clone(self),
            id,
            rx,
        }))
    }

    /// Take back a checked-out connection.
    fn release(self: &Arc<Self>, mut conn: Conn) {
        let mut state = self.lock();

        if state.ended || conn.is_broken() || conn.state() != ConnectionState::Ready {
            state.live.remove(&conn.id());
            let ended = state.ended;
            drop(state);
            if conn.is_broken() {
                tracing::warn!(conn = conn.id(), "discarding broken connection");
            }
            spawn_close(conn);
            if !ended {
                self.slot_freed();
            }
            return;
        }

        while let Some(waiter) = state.waiters.pop_front() {
            match hand_off(waiter.tx, conn) {
                None => return,
                Some(returned) => conn = returned,
            }
        }

        let epoch = state.next_idle_epoch;
        state.next_idle_epoch += 1;
        let evict = match (self.opts.pool_idle_timeout, Handle::try_current()) {
            (Some(delay), Ok(handle)) => {
                Some(handle.spawn(evict_after(Arc::downgrade(self), epoch, delay)))
            }
            (Some(_), Err(_)) => {
                tracing::debug!(
                    conn = conn.id(),
                    "no tokio runtime, idle connection will not be evicted"
                );
                None
            }
            (None, _) => None,
        };
        tracing::debug!(conn = conn.id(), "connection idle");
        state.idle.push(IdleConn { conn, epoch, evict });
    }

    /// A live slot became free: open a replacement for the oldest waiter.
    fn slot_freed(self: &Arc<Self>) {
        let Ok(handle) = Handle::try_current() else {
            tracing::debug!("no tokio runtime, no replacement connection opened");
            return;
        };
        let waiter = {
            let mut state = self.lock();
            if state.ended || state.live.len() + state.connecting >= self.max {
                return;
            }
            let waiter = loop {
                match state.waiters.pop_front() {
                    Some(w) if w.tx.is_closed() => continue,
                    Some(w) => break w,
                    None => return,
                }
            };
            state.connecting += 1;
            waiter
        };

        let pool = Arc::clone(self);
        handle.spawn(async move {
            let reservation = Reservation {
                pool: Arc::clone(&pool),
                armed: true,
            };
            match Conn::new(pool.opts.clone()).await {
                Ok(mut conn) => {
                    let ended = {
                        let mut state = pool.lock();
                        reservation.disarm(&mut state);
                        if !state.ended {
                            state.live.insert(conn.id(), conn.transport());
                        }
                        state.ended
                    };
                    if ended {
                        conn.close().await;
                        return;
                    }
                    if let Some(conn) = hand_off(waiter.tx, conn) {
                        pool.release(conn);
                    }
                }
                Err(e) => {
                    tracing::debug!("replacement connection failed: {}", e);
                    let _ = waiter.tx.send(Err(e));
                    drop(reservation);
                }
            }
        });
    }
}

/// Send `conn` to a waiter, or get it back if the waiter has gone away.
fn hand_off(tx: oneshot::Sender<Result<Conn>>, conn: Conn) -> Option<Conn> {
    tx.send(Ok(conn)).err().and_then(Result::ok)
}

fn spawn_close(mut conn: Conn) {
    match Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move { conn.close().await });
        }
        Err(_) => {
            tracing::debug!(
                conn = conn.id(),
                "no tokio runtime, dropping connection without Terminate"
            );
        }
    }
}

async fn evict_after(pool: Weak<PoolInner>, epoch: u64, delay: Duration) {
    tokio::time::sleep(delay).await;
    let Some(pool) = pool.upgrade() else {
        return;
    };
    let evicted = {
        let mut state = pool.lock();
        match state.idle.iter().position(|entry| entry.epoch == epoch) {
            Some(pos) => {
                let entry = state.idle.remove(pos);
                state.live.remove(&entry.conn.id());
                Some(entry.conn)
            }
            None => None,
        }
    };
    if let Some(mut conn) = evicted {
        tracing::debug!(conn = conn.id(), "evicting idle connection");
        conn.close().await;
    }
}

/// A caller queued in `waiters`. Dropping it, including when the `get`
/// future is cancelled, removes the entry and returns a connection that was
/// handed over but never picked up.
struct QueuedWaiter {
    pool: Arc<PoolInner>,
    id: u64,
    rx: oneshot::Receiver<Result<Conn>>,
}

impl Drop for QueuedWaiter {
    fn drop(&mut self) {
        {
            let mut state = self.pool.lock();
            state.waiters.retain(|w| w.id != self.id);
        }
        self.rx.close();
        if let Ok(Ok(conn)) = self.rx.try_recv() {
            self.pool.release(conn);
        }
    }
}

/// A slot counted in `connecting`. Dropping it while armed gives the slot
/// back, including when the `get` future is cancelled mid-connect.
struct Reservation {
    pool: Arc<PoolInner>,
    armed: bool,
}

impl Reservation {
    fn disarm(mut self, state: &mut PoolState) {
        state.connecting -= 1;
        self.armed = false;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        {
            let mut state = self.pool.lock();
            state.connecting -= 1;
        }
        self.pool.slot_freed();
    }
}

/// A connection checked out of a [`Pool`].
///
/// Goes back to the pool when dropped or [`released`](Self::release).
#[derive(Debug)]
pub struct PooledConn {
    pool: Arc<PoolInner>,
    conn: ManuallyDrop<Conn>,
}

impl PooledConn {
    /// Return the connection to the pool.
    pub fn release(self) {
        drop(self);
    }
}

impl Deref for PooledConn {
    type Target = Conn;
    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl DerefMut for PooledConn {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        // SAFETY: conn is never accessed after this
        let conn = unsafe { ManuallyDrop::take(&mut self.conn) };
        self.pool.release(conn);
    }
}
