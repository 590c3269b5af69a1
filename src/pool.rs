//! Generic bounded connection pool.
//!
//! The pool is parameterized by three hooks supplied at construction
//! (an async factory, a validity predicate, and a close action) instead
//! of subclass overrides. Idle connections are owned by the pool; a
//! consumer holds a [`PooledConn`] guard that returns the connection on
//! drop, refreshing its idle timestamp.
//!
//! Two background tasks run for the pool's lifetime: a producer that
//! creates one connection whenever consumers signal demand and the total
//! is under `max_size`, and a reaper that wakes every `max_idle_time`
//! and closes head-of-queue connections idle at least that long while
//! the total exceeds `init_size`.
//!
//! Invariant: `in_use + idle == count <= max_size`.

use crate::clock::{Clock, MonotonicClock};
use crate::config::PoolConfig;
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Pool failures surfaced to consumers.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// No connection became available within `connectionTimeOut`.
    #[error("connection acquire timed out after {0:?}")]
    AcquireTimeout(Duration),
    /// The factory could not open a new connection.
    #[error("connection factory failed: {0}")]
    Factory(#[source] std::io::Error),
}

/// The three behaviors that make the pool concrete.
pub struct PoolHooks<C> {
    /// Open one new connection.
    pub factory: Arc<dyn Fn() -> BoxFuture<'static, std::io::Result<C>> + Send + Sync>,
    /// Is this connection still usable? Invalid connections are closed
    /// on borrow and never handed out.
    pub validate: Arc<dyn Fn(&C) -> bool + Send + Sync>,
    /// Tear a connection down.
    pub close: Arc<dyn Fn(C) + Send + Sync>,
}

impl<C> Clone for PoolHooks<C> {
    fn clone(&self) -> Self {
        Self {
            factory: self.factory.clone(),
            validate: self.validate.clone(),
            close: self.close.clone(),
        }
    }
}

struct IdleConn<C> {
    conn: C,
    last_used_millis: u64,
}

struct PoolState<C> {
    idle: VecDeque<IdleConn<C>>,
    /// Total live connections, idle + borrowed.
    count: usize,
    in_use: usize,
}

struct Shared<C> {
    config: PoolConfig,
    hooks: PoolHooks<C>,
    state: Mutex<PoolState<C>>,
    /// Signaled when a connection lands in the idle queue.
    available: Notify,
    /// Signaled when a consumer found the queue empty.
    demand: Notify,
    clock: Arc<dyn Clock>,
    shutdown: AtomicBool,
}

/// Cloneable handle to one pool.
pub struct ConnectionPool<C: Send + 'static> {
    shared: Arc<Shared<C>>,
}

impl<C: Send + 'static> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self { shared: self.shared.clone() }
    }
}

impl<C: Send + 'static> std::fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("ConnectionPool")
            .field("idle", &stats.idle)
            .field("in_use", &stats.in_use)
            .field("count", &stats.count)
            .finish()
    }
}

/// Point-in-time pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub in_use: usize,
    pub count: usize,
}

impl<C: Send + 'static> ConnectionPool<C> {
    /// Build the pool: opens `init_size` connections (individual
    /// failures are logged, not fatal) and spawns the producer and
    /// reaper tasks.
    pub async fn new(config: PoolConfig, hooks: PoolHooks<C>) -> Self {
        Self::with_clock(config, hooks, MonotonicClock::default()).await
    }

    pub async fn with_clock(config: PoolConfig, hooks: PoolHooks<C>, clock: impl Clock + 'static) -> Self {
        let shared = Arc::new(Shared {
            config,
            hooks,
            state: Mutex::new(PoolState { idle: VecDeque::new(), count: 0, in_use: 0 }),
            available: Notify::new(),
            demand: Notify::new(),
            clock: Arc::new(clock),
            shutdown: AtomicBool::new(false),
        });

        for _ in 0..shared.config.init_size {
            match (shared.hooks.factory)().await {
                Ok(conn) => {
                    let mut state = shared.state.lock().expect("pool lock");
                    let now = shared.clock.now_millis();
                    state.idle.push_back(IdleConn { conn, last_used_millis: now });
                    state.count += 1;
                }
                Err(e) => tracing::error!(error = %e, "initial pool connection failed"),
            }
        }

        tokio::spawn(producer_task(Arc::downgrade(&shared)));
        tokio::spawn(reaper_task(Arc::downgrade(&shared)));

        Self { shared }
    }

    /// Borrow a connection, waiting up to `connectionTimeOut`.
    pub async fn acquire(&self) -> Result<PooledConn<C>, PoolError> {
        let deadline = Instant::now() + self.shared.config.connection_timeout;
        loop {
            let mut allocate = false;
            {
                let mut state = self.shared.state.lock().expect("pool lock");
                while let Some(idle) = state.idle.pop_front() {
                    if (self.shared.hooks.validate)(&idle.conn) {
                        state.in_use += 1;
                        return Ok(PooledConn {
                            shared: self.shared.clone(),
                            conn: Some(idle.conn),
                        });
                    }
                    state.count -= 1;
                    (self.shared.hooks.close)(idle.conn);
                    tracing::warn!("closed invalid pooled connection");
                }
                if state.count < self.shared.config.max_size {
                    // Reserve a slot before the await below.
                    state.count += 1;
                    allocate = true;
                }
            }

            if allocate {
                match (self.shared.hooks.factory)().await {
                    Ok(conn) => {
                        let mut state = self.shared.state.lock().expect("pool lock");
                        state.in_use += 1;
                        return Ok(PooledConn { shared: self.shared.clone(), conn: Some(conn) });
                    }
                    Err(e) => {
                        self.shared.state.lock().expect("pool lock").count -= 1;
                        return Err(PoolError::Factory(e));
                    }
                }
            }

            // Queue empty and at the cap: wake the producer and wait.
            self.shared.demand.notify_one();
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return Err(PoolError::AcquireTimeout(self.shared.config.connection_timeout));
            };
            if tokio::time::timeout(remaining, self.shared.available.notified()).await.is_err() {
                return Err(PoolError::AcquireTimeout(self.shared.config.connection_timeout));
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock().expect("pool lock");
        PoolStats { idle: state.idle.len(), in_use: state.in_use, count: state.count }
    }

    /// Stop background tasks and close every idle connection.
    pub fn close(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.demand.notify_one();
        let mut state = self.shared.state.lock().expect("pool lock");
        while let Some(idle) = state.idle.pop_front() {
            state.count -= 1;
            (self.shared.hooks.close)(idle.conn);
        }
    }
}

async fn producer_task<C: Send + 'static>(shared: Weak<Shared<C>>) {
    loop {
        let Some(pool) = shared.upgrade() else { return };
        if pool.shutdown.load(Ordering::Acquire) {
            return;
        }
        // Only produce when the queue is empty and there is headroom.
        let should_create = {
            let mut state = pool.state.lock().expect("pool lock");
            if state.idle.is_empty() && state.count < pool.config.max_size {
                state.count += 1;
                true
            } else {
                false
            }
        };
        if should_create {
            match (pool.hooks.factory)().await {
                Ok(conn) => {
                    let now = pool.clock.now_millis();
                    let mut state = pool.state.lock().expect("pool lock");
                    state.idle.push_back(IdleConn { conn, last_used_millis: now });
                    tracing::info!(count = state.count, "pool produced connection");
                    drop(state);
                    pool.available.notify_one();
                }
                Err(e) => {
                    pool.state.lock().expect("pool lock").count -= 1;
                    tracing::error!(error = %e, "pool producer connect failed");
                }
            }
        }
        // `notify_one` stores a permit, so demand raised while producing
        // is not lost.
        pool.demand.notified().await;
    }
}

async fn reaper_task<C: Send + 'static>(shared: Weak<Shared<C>>) {
    let interval = match shared.upgrade() {
        Some(pool) => pool.config.max_idle_time,
        None => return,
    };
    loop {
        tokio::time::sleep(interval).await;
        let Some(pool) = shared.upgrade() else { return };
        if pool.shutdown.load(Ordering::Acquire) {
            return;
        }
        let now = pool.clock.now_millis();
        let max_idle_ms = pool.config.max_idle_time.as_millis() as u64;
        let mut state = pool.state.lock().expect("pool lock");
        while state.count > pool.config.init_size {
            // Head of the queue is the longest-idle connection.
            let head_expired = state
                .idle
                .front()
                .is_some_and(|head| now.saturating_sub(head.last_used_millis) >= max_idle_ms);
            if !head_expired {
                break;
            }
            let idle = state.idle.pop_front().expect("head just observed");
            state.count -= 1;
            (pool.hooks.close)(idle.conn);
            tracing::info!(count = state.count, "reaped idle connection");
        }
    }
}

/// Scoped borrow of a pooled connection. Returns to the idle queue on
/// drop, exactly once.
pub struct PooledConn<C: Send + 'static> {
    shared: Arc<Shared<C>>,
    conn: Option<C>,
}

impl<C: Send + 'static> std::fmt::Debug for PooledConn<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConn").finish_non_exhaustive()
    }
}

impl<C: Send + 'static> Deref for PooledConn<C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl<C: Send + 'static> DerefMut for PooledConn<C> {
    fn deref_mut(&mut self) -> &mut C {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl<C: Send + 'static> Drop for PooledConn<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let now = self.shared.clock.now_millis();
            let mut state = self.shared.state.lock().expect("pool lock");
            state.in_use -= 1;
            state.idle.push_back(IdleConn { conn, last_used_millis: now });
            drop(state);
            self.shared.available.notify_one();
        }
    }
}
