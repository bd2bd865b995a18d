//! Bounded, health-checked session pool.
//!
//! Owns every live session to one backend. Sessions are leased to a single
//! caller as a [`SessionHandle`] for the duration of one logical operation
//! and then released back to the idle set (or discarded if unhealthy).
//!
//! # Acquisition
//!
//! ```text
//! acquire(ctx)
//!   → attempt 1..=max_attempts
//!     → wait for a pool permit (bounded by connect_timeout and ctx)
//!       → idle session available → reuse
//!       → none idle              → connect to next host, run session-init
//!     → run liveness probe
//!       → ok     → Ok(handle)
//!       → failed → discard session, transient error
//!     → transient error → sleep backoff(attempt), retry
//!     → permanent error → return immediately
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Credentials, Endpoint, PoolConfig};
use crate::context::OpContext;
use crate::error::{StoreError, StoreResult};
use crate::retry::RetryPolicy;
use crate::statement::{ResultSet, Statement};

/// A live connection to one backend node.
///
/// Implemented by driver bindings (see the `scylla` feature) and by test
/// doubles. Errors are driver messages; the pool classifies them.
#[async_trait]
pub trait Session: Send + std::fmt::Debug {
    /// Execute one statement and return its rows.
    async fn execute(&mut self, statement: &Statement) -> Result<ResultSet, String>;

    /// Apply several write statements as one logged batch.
    async fn execute_batch(&mut self, statements: &[Statement]) -> Result<(), String> {
        let _ = statements;
        Err("logged batches are not supported by this session".to_string())
    }

    /// Close the underlying transport.
    async fn close(&mut self) {}
}

/// Opens new sessions. Drivers and tests each supply their own.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
    ) -> Result<Box<dyn Session>, String>;
}

/// Where and how sessions are opened and checked.
#[derive(Clone, Debug)]
pub struct Target {
    /// Hosts tried round-robin when opening sessions.
    pub hosts: Vec<Endpoint>,
    pub credentials: Credentials,
    /// Trivial statement run on every acquisition.
    pub probe: Statement,
    /// Statements run once on every newly opened session.
    pub session_init: Vec<Statement>,
}

/// Pool-level statistics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolStats {
    /// Sessions currently leased to callers.
    pub active: usize,
    /// Sessions sitting idle in the pool.
    pub idle: usize,
    /// Total open sessions (active + idle).
    pub total: usize,
    /// Number of acquisitions that timed out waiting for a slot.
    pub wait_count: u64,
}

#[derive(Debug)]
struct IdleSession {
    id: u64,
    endpoint: Endpoint,
    session: Box<dyn Session>,
    created_at: Instant,
    last_used: Instant,
}

/// State shared between the manager and outstanding handles.
#[derive(Debug)]
struct Shared {
    idle: Mutex<VecDeque<IdleSession>>,
    /// Bounds leased sessions to `max_size`.
    semaphore: Arc<Semaphore>,
    total: AtomicUsize,
    wait_count: AtomicU64,
    closed: AtomicBool,
}

impl Shared {
    fn idle(&self) -> MutexGuard<'_, VecDeque<IdleSession>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A session leased to exactly one caller.
///
/// Give it back with [`ConnectionManager::release`]. Dropping a handle
/// without releasing it closes the session and frees its pool slot.
#[derive(Debug)]
pub struct SessionHandle {
    id: u64,
    endpoint: Endpoint,
    session: Option<Box<dyn Session>>,
    created_at: Instant,
    healthy: bool,
    execute_timeout: Duration,
    shared: Arc<Shared>,
    permit: Option<OwnedSemaphorePermit>,
}

impl SessionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    /// Flag the session so that release discards it instead of pooling it.
    pub fn mark_unhealthy(&mut self) {
        self.healthy = false;
    }

    /// Execute a statement within the execute timeout and `ctx`.
    ///
    /// Transient and cancellation failures mark the session unhealthy.
    pub async fn execute(&mut self, ctx: &OpContext, statement: &Statement) -> StoreResult<ResultSet> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| StoreError::Backend("session already released".to_string()))?;
        let result = run_statement(ctx, session.as_mut(), statement, self.execute_timeout).await;
        self.note(&result);
        result
    }

    /// Apply statements as one logged batch.
    pub async fn execute_batch(&mut self, ctx: &OpContext, statements: &[Statement]) -> StoreResult<()> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| StoreError::Backend("session already released".to_string()))?;
        let timeout = self.execute_timeout;
        let result = ctx
            .run(async {
                match tokio::time::timeout(timeout, session.execute_batch(statements)).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(msg)) => Err(StoreError::from_backend(msg)),
                    Err(_) => Err(StoreError::Transient(format!(
                        "batch of {} statements timed out after {timeout:?}",
                        statements.len()
                    ))),
                }
            })
            .await;
        self.note(&result);
        result
    }

    fn note<T>(&mut self, result: &StoreResult<T>) {
        if let Err(e) = result {
            if e.is_transient() || e.is_cancelled() {
                self.healthy = false;
            }
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if self.session.take().is_some() {
            self.shared.total.fetch_sub(1, Ordering::Relaxed);
            debug!(session = self.id, "session dropped without release, discarded");
        }
    }
}

/// Run one statement on a raw session, bounded by `timeout` and `ctx`.
async fn run_statement(
    ctx: &OpContext,
    session: &mut dyn Session,
    statement: &Statement,
    timeout: Duration,
) -> StoreResult<ResultSet> {
    let kind = statement.kind;
    ctx.run(async {
        match tokio::time::timeout(timeout, session.execute(statement)).await {
            Ok(Ok(rows)) => Ok(rows),
            Ok(Err(msg)) => Err(StoreError::from_backend(msg)),
            Err(_) => Err(StoreError::Transient(format!(
                "{kind} statement timed out after {timeout:?}"
            ))),
        }
    })
    .await
}

/// Bounded session pool for one backend target.
pub struct ConnectionManager {
    shared: Arc<Shared>,
    factory: Arc<dyn SessionFactory>,
    target: Target,
    config: PoolConfig,
    retry: RetryPolicy,
    next_host: AtomicUsize,
    next_id: AtomicU64,
}

impl ConnectionManager {
    pub fn new(
        config: PoolConfig,
        retry: RetryPolicy,
        target: Target,
        factory: Arc<dyn SessionFactory>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                idle: Mutex::new(VecDeque::new()),
                semaphore: Arc::new(Semaphore::new(config.max_size)),
                total: AtomicUsize::new(0),
                wait_count: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
            factory,
            target,
            config,
            retry,
            next_host: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Relaxed)
    }

    /// Lease a healthy session, retrying transient failures with backoff.
    pub async fn acquire(&self, ctx: &OpContext) -> StoreResult<SessionHandle> {
        self.with_retry(ctx, "acquire", move || self.try_acquire(ctx)).await
    }

    /// Return a session to the idle set, or discard it if unhealthy.
    pub async fn release(&self, mut handle: SessionHandle) {
        if !handle.healthy || self.is_closed() {
            self.discard(handle).await;
            return;
        }
        let Some(session) = handle.session.take() else {
            return;
        };
        let idle_count = {
            let mut idle = self.shared.idle();
            idle.push_back(IdleSession {
                id: handle.id,
                endpoint: handle.endpoint.clone(),
                session,
                created_at: handle.created_at,
                last_used: Instant::now(),
            });
            idle.len()
        };
        // Slot frees only after the session is visible to other acquirers.
        drop(handle.permit.take());
        debug!(session = handle.id, idle_count, "returned session to pool");
    }

    /// Close a leased session and free its slot.
    pub async fn discard(&self, mut handle: SessionHandle) {
        if let Some(mut session) = handle.session.take() {
            self.shared.total.fetch_sub(1, Ordering::Relaxed);
            session.close().await;
            debug!(
                session = handle.id,
                endpoint = %handle.endpoint,
                "discarded session"
            );
        }
    }

    /// Open `min_size` sessions up front so the first calls don't pay for them.
    pub async fn warm(&self, ctx: &OpContext) -> StoreResult<()> {
        let mut handles = Vec::with_capacity(self.config.min_size);
        let mut outcome = Ok(());
        for _ in 0..self.config.min_size {
            match self.acquire(ctx).await {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }
        for handle in handles {
            self.release(handle).await;
        }
        if outcome.is_ok() {
            info!(sessions = self.config.min_size, "connection pool warmed");
        }
        outcome
    }

    /// Run schema statements on a dedicated session outside the pool.
    ///
    /// Session-init statements are skipped: bootstrap is what creates the
    /// namespace they refer to.
    pub async fn bootstrap(&self, ctx: &OpContext, statements: &[Statement]) -> StoreResult<()> {
        self.with_retry(ctx, "bootstrap", move || async move {
            let endpoint = self.next_endpoint();
            let mut session = self.connect(ctx, &endpoint).await?;
            let mut result = Ok(());
            for statement in statements {
                debug!(kind = %statement.kind, statement = %statement.text, "bootstrap statement");
                if let Err(e) =
                    run_statement(ctx, session.as_mut(), statement, self.config.execute_timeout).await
                {
                    result = Err(e);
                    break;
                }
            }
            session.close().await;
            result
        })
        .await
    }

    /// Close idle sessions unused for longer than `idle_timeout`, keeping at
    /// least `min_size` sessions open. Returns the number closed.
    pub async fn reap_idle(&self) -> usize {
        let idle_timeout = self.config.idle_timeout;
        let reaped: Vec<IdleSession> = {
            let mut idle = self.shared.idle();
            let total = self.shared.total.load(Ordering::Relaxed);
            let mut allowance = total.saturating_sub(self.config.min_size);
            let mut kept = VecDeque::with_capacity(idle.len());
            let mut reaped = Vec::new();
            for conn in idle.drain(..) {
                if allowance > 0 && conn.last_used.elapsed() >= idle_timeout {
                    allowance -= 1;
                    reaped.push(conn);
                } else {
                    kept.push_back(conn);
                }
            }
            *idle = kept;
            reaped
        };

        let count = reaped.len();
        for mut conn in reaped {
            self.shared.total.fetch_sub(1, Ordering::Relaxed);
            conn.session.close().await;
        }
        if count > 0 {
            info!(reaped = count, "reaped idle sessions");
        }
        count
    }

    /// Probe idle sessions and drop the ones that fail. Returns the number removed.
    ///
    /// Each probe holds a pool permit, so checking never pushes the pool
    /// past `max_size`; sessions that can't get a permit are skipped.
    pub async fn health_check_idle(&self, ctx: &OpContext) -> usize {
        let pending = self.shared.idle().len();
        let mut removed = 0;
        for _ in 0..pending {
            let Ok(permit) = Arc::clone(&self.shared.semaphore).try_acquire_owned() else {
                break;
            };
            let Some(mut conn) = self.shared.idle().pop_front() else {
                break;
            };
            let probe = run_statement(
                ctx,
                conn.session.as_mut(),
                &self.target.probe,
                self.config.execute_timeout,
            )
            .await;
            match probe {
                Ok(_) => {
                    self.shared.idle().push_back(conn);
                }
                Err(e) => {
                    info!(
                        session = conn.id,
                        endpoint = %conn.endpoint,
                        error = %e,
                        "removed unhealthy idle session"
                    );
                    self.shared.total.fetch_sub(1, Ordering::Relaxed);
                    conn.session.close().await;
                    removed += 1;
                }
            }
            drop(permit);
        }
        removed
    }

    /// Run health checks and reaping every `health_check_interval` until
    /// `shutdown` fires.
    pub fn spawn_maintenance(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let period = manager.config.health_check_interval.max(Duration::from_millis(10));
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let ctx = OpContext::background().with_token(shutdown.child_token());
                        manager.health_check_idle(&ctx).await;
                        manager.reap_idle().await;
                    }
                }
            }
            debug!("pool maintenance stopped");
        })
    }

    pub fn stats(&self) -> PoolStats {
        let idle = self.shared.idle().len();
        let total = self.shared.total.load(Ordering::Relaxed);
        PoolStats {
            active: total.saturating_sub(idle),
            idle,
            total,
            wait_count: self.shared.wait_count.load(Ordering::Relaxed),
        }
    }

    /// Log pool statistics at `info` level.
    pub fn log_stats(&self) {
        let stats = self.stats();
        info!(
            active = stats.active,
            idle = stats.idle,
            total = stats.total,
            wait_count = stats.wait_count,
            "pool statistics"
        );
    }

    /// Stop handing out sessions and close every idle one. Idempotent.
    ///
    /// Leased sessions are closed as their holders release them.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        self.shared.semaphore.close();
        let drained: Vec<IdleSession> = self.shared.idle().drain(..).collect();
        let closed = drained.len();
        for mut conn in drained {
            self.shared.total.fetch_sub(1, Ordering::Relaxed);
            conn.session.close().await;
        }
        info!(closed, "connection pool closed");
    }

    /// Run `op` until it succeeds, fails permanently, or the retry budget
    /// runs out. Only transient errors are retried; `ctx` is checked before
    /// every attempt and interrupts backoff sleeps.
    pub async fn with_retry<T, F, Fut>(&self, ctx: &OpContext, what: &'static str, mut op: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let max_attempts = self.retry.max_attempts;
        let mut attempt = 0;
        loop {
            attempt += 1;
            ctx.check()?;
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(op = what, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_transient() => {
                    if attempt >= max_attempts {
                        warn!(op = what, attempts = attempt, error = %e, "retry budget exhausted");
                        return Err(StoreError::RetriesExhausted {
                            attempts: attempt,
                            source: Box::new(e),
                        });
                    }
                    let delay = self.retry.backoff.delay(attempt);
                    warn!(
                        op = what,
                        attempt,
                        max_attempts,
                        ?delay,
                        error = %e,
                        "transient failure, backing off"
                    );
                    ctx.sleep(delay).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Single acquisition attempt with no retry.
    pub async fn try_acquire(&self, ctx: &OpContext) -> StoreResult<SessionHandle> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }

        let semaphore = Arc::clone(&self.shared.semaphore);
        let connect_timeout = self.config.connect_timeout;
        let permit = ctx
            .run(async {
                match tokio::time::timeout(connect_timeout, semaphore.acquire_owned()).await {
                    Ok(Ok(permit)) => Ok(permit),
                    Ok(Err(_)) => Err(StoreError::Closed),
                    Err(_) => {
                        self.shared.wait_count.fetch_add(1, Ordering::Relaxed);
                        Err(StoreError::Transient(format!(
                            "connection pool exhausted (max {} sessions, waited {connect_timeout:?})",
                            self.config.max_size
                        )))
                    }
                }
            })
            .await?;

        let reused = self.shared.idle().pop_back();
        let mut handle = match reused {
            Some(conn) => {
                debug!(session = conn.id, endpoint = %conn.endpoint, "reusing idle session");
                SessionHandle {
                    id: conn.id,
                    endpoint: conn.endpoint,
                    session: Some(conn.session),
                    created_at: conn.created_at,
                    healthy: true,
                    execute_timeout: self.config.execute_timeout,
                    shared: Arc::clone(&self.shared),
                    permit: Some(permit),
                }
            }
            None => self.open(ctx, permit).await?,
        };

        match handle.execute(ctx, &self.target.probe).await {
            Ok(_) => Ok(handle),
            Err(e) => {
                let id = handle.id;
                self.discard(handle).await;
                if e.is_cancelled() {
                    return Err(e);
                }
                debug!(session = id, error = %e, "liveness probe failed, session discarded");
                Err(StoreError::Transient(format!("liveness probe failed: {e}")))
            }
        }
    }

    // ── internals ──────────────────────────────────────────────────

    /// Open a new pooled session (session-init included) under `permit`.
    async fn open(&self, ctx: &OpContext, permit: OwnedSemaphorePermit) -> StoreResult<SessionHandle> {
        let endpoint = self.next_endpoint();
        let mut session = self.connect(ctx, &endpoint).await?;
        for statement in &self.target.session_init {
            if let Err(e) =
                run_statement(ctx, session.as_mut(), statement, self.config.execute_timeout).await
            {
                session.close().await;
                return Err(e);
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared.total.fetch_add(1, Ordering::Relaxed);
        debug!(session = id, endpoint = %endpoint, "opened new session");
        Ok(SessionHandle {
            id,
            endpoint,
            session: Some(session),
            created_at: Instant::now(),
            healthy: true,
            execute_timeout: self.config.execute_timeout,
            shared: Arc::clone(&self.shared),
            permit: Some(permit),
        })
    }

    async fn connect(&self, ctx: &OpContext, endpoint: &Endpoint) -> StoreResult<Box<dyn Session>> {
        let connect_timeout = self.config.connect_timeout;
        ctx.run(async {
            match tokio::time::timeout(
                connect_timeout,
                self.factory.connect(endpoint, &self.target.credentials),
            )
            .await
            {
                Ok(Ok(session)) => Ok(session),
                Ok(Err(msg)) => Err(StoreError::from_backend(format!("connect to {endpoint}: {msg}"))),
                Err(_) => Err(StoreError::Transient(format!(
                    "connect to {endpoint} timed out after {connect_timeout:?}"
                ))),
            }
        })
        .await
    }

    fn next_endpoint(&self) -> Endpoint {
        let n = self.next_host.fetch_add(1, Ordering::Relaxed);
        self.target.hosts[n % self.target.hosts.len()].clone()
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("config", &self.config)
            .field("hosts", &self.target.hosts)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
