//! Session pool with exclusive per-task access.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use framecast_common::cancel::CancelSignal;
use framecast_common::error::{FramecastError, FramecastResult};
use framecast_session::{RenderEngine, RenderSession, SessionOptions};

/// Parameters shared by every session the pool opens.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Document each session navigates to.
    pub url: String,

    /// Maximum number of live sessions.
    pub max: usize,

    pub session: SessionOptions,
}

/// Lifecycle state of a pooled session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Available,
    Busy,
    Closed,
}

/// Pool bookkeeping for one session.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: u64,
    pub session: Arc<RenderSession>,
    pub state: SessionState,
}

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub max: usize,
    /// Sessions currently open (available + busy + being opened).
    pub live: usize,
    pub available: usize,
    pub busy: usize,
    /// Sessions opened over the pool's lifetime.
    pub spawned: u64,
    /// Sessions closed because their task failed.
    pub discarded: u64,
    /// Highest simultaneous busy count observed.
    pub peak_busy: usize,
}

#[derive(Debug, Default)]
struct PoolState {
    next_id: u64,
    records: BTreeMap<u64, SessionRecord>,
    opening: usize,
    spawned: u64,
    discarded: u64,
    peak_busy: usize,
    shut_down: bool,
}

impl PoolState {
    fn busy(&self) -> usize {
        self.records
            .values()
            .filter(|r| r.state == SessionState::Busy)
            .count()
    }

    fn mark_busy(&mut self, id: u64) {
        if let Some(record) = self.records.get_mut(&id) {
            record.state = SessionState::Busy;
        }
        self.peak_busy = self.peak_busy.max(self.busy());
    }
}

struct PoolInner {
    engine: Arc<dyn RenderEngine>,
    config: PoolConfig,
    /// One permit per session slot. Holding a permit guarantees either an
    /// available session or room to open one; releasing it wakes exactly
    /// one waiter.
    permits: Arc<Semaphore>,
    state: Mutex<PoolState>,
}

impl PoolInner {
    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Bounded, lazily-growing set of render sessions.
///
/// Sessions are opened only when a task finds none available and fewer than
/// `max` are live. A session whose task fails is closed and never reused.
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPool")
            .field("url", &self.inner.config.url)
            .field("stats", &self.stats())
            .finish()
    }
}

enum Checkout {
    Reuse(SessionLease),
    Open(u64, OwnedSemaphorePermit),
}

impl SessionPool {
    pub fn new(engine: Arc<dyn RenderEngine>, config: PoolConfig) -> FramecastResult<Self> {
        if config.max == 0 {
            return Err(FramecastError::config("pool size must be at least 1"));
        }
        tracing::debug!(max = config.max, engine = engine.name(), "Session pool created");
        Ok(Self {
            inner: Arc::new(PoolInner {
                permits: Arc::new(Semaphore::new(config.max)),
                engine,
                config,
                state: Mutex::new(PoolState::default()),
            }),
        })
    }

    pub fn max(&self) -> usize {
        self.inner.config.max
    }

    /// Take a session without waiting.
    ///
    /// Returns `Ok(None)` when every slot is busy. Opens a new session when
    /// none is available and the pool is below `max`.
    pub async fn obtain(&self) -> FramecastResult<Option<SessionLease>> {
        let permit = match self.inner.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => return Ok(None),
            Err(TryAcquireError::Closed) => return Err(FramecastError::PoolClosed),
        };
        self.checkout(permit, None).await.map(Some)
    }

    /// Run `task` against an exclusively held session.
    ///
    /// Waits for a free slot when the pool is saturated. On success the
    /// session goes back to the available set; on failure it is closed and
    /// discarded and the error is returned unchanged.
    pub async fn submit<T, F, Fut>(&self, description: &str, task: F) -> FramecastResult<T>
    where
        F: FnOnce(Arc<RenderSession>) -> Fut,
        Fut: Future<Output = FramecastResult<T>>,
    {
        let permit = self.acquire().await?;
        self.run(description, permit, None, task).await
    }

    /// Like [`SessionPool::submit`], but refuses to dispatch once `cancel`
    /// is set, including while waiting for a slot. A task that is already
    /// running is left to finish.
    ///
    /// A failure to open a session or a failed task sets `cancel` before
    /// the slot is freed, so no waiter sharing `cancel` is dispatched
    /// after it.
    pub async fn submit_cancellable<T, F, Fut>(
        &self,
        description: &str,
        cancel: &CancelSignal,
        task: F,
    ) -> FramecastResult<T>
    where
        F: FnOnce(Arc<RenderSession>) -> Fut,
        Fut: Future<Output = FramecastResult<T>>,
    {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FramecastError::Cancelled),
            permit = self.acquire() => permit?,
        };
        if cancel.is_cancelled() {
            return Err(FramecastError::Cancelled);
        }
        self.run(description, permit, Some(cancel), task).await
    }

    async fn run<T, F, Fut>(
        &self,
        description: &str,
        permit: OwnedSemaphorePermit,
        on_failure: Option<&CancelSignal>,
        task: F,
    ) -> FramecastResult<T>
    where
        F: FnOnce(Arc<RenderSession>) -> Fut,
        Fut: Future<Output = FramecastResult<T>>,
    {
        let lease = self.checkout(permit, on_failure).await?;
        tracing::debug!(session_id = lease.id(), task = description, "Dispatching task");

        match task(lease.session().clone()).await {
            Ok(value) => {
                lease.release();
                Ok(value)
            }
            Err(e) => {
                tracing::warn!(
                    session_id = lease.id(),
                    task = description,
                    error = %e,
                    "Task failed; discarding session"
                );
                if let Some(cancel) = on_failure {
                    cancel.cancel();
                }
                lease.discard().await;
                Err(e)
            }
        }
    }

    async fn acquire(&self) -> FramecastResult<OwnedSemaphorePermit> {
        self.inner
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| FramecastError::PoolClosed)
    }

    async fn checkout(
        &self,
        permit: OwnedSemaphorePermit,
        on_failure: Option<&CancelSignal>,
    ) -> FramecastResult<SessionLease> {
        let next = {
            let mut state = self.inner.state();
            if state.shut_down {
                return Err(FramecastError::PoolClosed);
            }
            let available = state
                .records
                .values()
                .find(|r| r.state == SessionState::Available)
                .map(|r| (r.id, r.session.clone()));
            match available {
                Some((id, session)) => {
                    state.mark_busy(id);
                    Checkout::Reuse(SessionLease::new(self.inner.clone(), id, session, permit))
                }
                None => {
                    let id = state.next_id;
                    state.next_id += 1;
                    state.opening += 1;
                    Checkout::Open(id, permit)
                }
            }
        };

        let (id, permit) = match next {
            Checkout::Reuse(lease) => return Ok(lease),
            Checkout::Open(id, permit) => (id, permit),
        };

        let opened = RenderSession::open(
            self.inner.engine.as_ref(),
            id,
            &self.inner.config.url,
            &self.inner.config.session,
        )
        .await;

        let session = match opened {
            Ok(session) => Arc::new(session),
            Err(e) => {
                self.inner.state().opening -= 1;
                tracing::warn!(session_id = id, error = %e, "Failed to open session");
                if let Some(cancel) = on_failure {
                    cancel.cancel();
                }
                drop(permit);
                return Err(e);
            }
        };

        let accepted = {
            let mut state = self.inner.state();
            state.opening -= 1;
            if state.shut_down {
                false
            } else {
                state.spawned += 1;
                state.records.insert(
                    id,
                    SessionRecord {
                        id,
                        session: session.clone(),
                        state: SessionState::Busy,
                    },
                );
                state.mark_busy(id);
                true
            }
        };

        if !accepted {
            session.close().await;
            return Err(FramecastError::PoolClosed);
        }

        tracing::info!(session_id = id, live = self.stats().live, "Spawned render session");
        Ok(SessionLease::new(self.inner.clone(), id, session, permit))
    }

    /// Current records, ordered by id.
    pub fn records(&self) -> Vec<SessionRecord> {
        self.inner.state().records.values().cloned().collect()
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state();
        let busy = state.busy();
        PoolStats {
            max: self.inner.config.max,
            live: state.records.len() + state.opening,
            available: state.records.len() - busy,
            busy,
            spawned: state.spawned,
            discarded: state.discarded,
            peak_busy: state.peak_busy,
        }
    }

    /// Close every session, busy ones included, and refuse further work.
    /// Idempotent.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<RenderSession>> = {
            let mut state = self.inner.state();
            if !state.shut_down {
                tracing::info!(
                    spawned = state.spawned,
                    discarded = state.discarded,
                    peak_busy = state.peak_busy,
                    "Shutting down session pool"
                );
            }
            state.shut_down = true;
            std::mem::take(&mut state.records)
                .into_values()
                .map(|r| r.session)
                .collect()
        };
        self.inner.permits.close();

        let mut closing = tokio::task::JoinSet::new();
        for session in sessions {
            closing.spawn(async move { session.close().await });
        }
        while let Some(joined) = closing.join_next().await {
            if let Err(e) = joined {
                tracing::warn!(error = %e, "Session close task panicked");
            }
        }
    }
}

/// Exclusive hold on one pooled session plus its slot permit.
///
/// Dropping a lease without calling [`SessionLease::release`] or
/// [`SessionLease::discard`] discards the session.
pub struct SessionLease {
    inner: Arc<PoolInner>,
    id: u64,
    session: Arc<RenderSession>,
    _permit: OwnedSemaphorePermit,
    settled: bool,
}

impl SessionLease {
    fn new(
        inner: Arc<PoolInner>,
        id: u64,
        session: Arc<RenderSession>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            inner,
            id,
            session,
            _permit: permit,
            settled: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn session(&self) -> &Arc<RenderSession> {
        &self.session
    }

    /// Return the session to the available set and wake one waiter.
    pub fn release(mut self) {
        self.settled = true;
        let mut state = self.inner.state();
        if let Some(record) = state.records.get_mut(&self.id) {
            record.state = SessionState::Available;
        }
        // the permit drops with `self`, after the record is available
    }

    /// Close the session and remove it from the pool.
    pub async fn discard(mut self) {
        self.settled = true;
        self.forget();
        self.session.close().await;
    }

    fn forget(&self) {
        let mut state = self.inner.state();
        if let Some(mut record) = state.records.remove(&self.id) {
            record.state = SessionState::Closed;
            state.discarded += 1;
        }
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        tracing::warn!(session_id = self.id, "Lease dropped mid-task; discarding session");
        self.forget();
        let session = self.session.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { session.close().await });
        }
    }
}
