use crate::pool::{PoolError, WorkerPool};
use fiberkv::RequestContext;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Semaphore, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

pub const DEFAULT_MAX_PENDING: usize = 256;
pub const MIN_WORKERS: usize = 2;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Dedicated worker threads that run blocking calls.
    pub workers: usize,
    /// Calls admitted but not yet finished. Further callers suspend until a
    /// slot frees up.
    pub max_pending: usize,
    /// Upper bound on how long a caller stays suspended on one call.
    #[serde(default)]
    pub call_timeout_ms: Option<u64>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(MIN_WORKERS)
            .max(MIN_WORKERS);
        Self {
            workers,
            max_pending: DEFAULT_MAX_PENDING,
            call_timeout_ms: None,
        }
    }
}

impl BridgeConfig {
    /// Reads `FIBERKV_WORKERS`, `FIBERKV_MAX_PENDING` and
    /// `FIBERKV_CALL_TIMEOUT_MS`, keeping defaults for unset or invalid values.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(workers) = env_number::<usize>("FIBERKV_WORKERS") {
            config.workers = workers.max(1);
        }
        if let Some(max_pending) = env_number::<usize>("FIBERKV_MAX_PENDING") {
            config.max_pending = max_pending.max(1);
        }
        if let Some(timeout_ms) = env_number::<u64>("FIBERKV_CALL_TIMEOUT_MS") {
            config.call_timeout_ms = (timeout_ms > 0).then_some(timeout_ms);
        }
        config
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout_ms = Some(timeout.as_millis().max(1) as u64);
        self
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }
}

fn env_number<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok().filter(|value| !value.trim().is_empty())?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(variable = name, value = %raw, "ignoring invalid numeric setting");
            None
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError<E> {
    /// The blocking call itself failed; the error is passed through untouched.
    #[error("{0}")]
    Call(E),
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
    #[error("call abandoned before it produced a result")]
    Cancelled,
    #[error("blocking call panicked: {0}")]
    Panicked(String),
    #[error("suspension bridge is shut down")]
    Closed,
}

impl<E> BridgeError<E> {
    pub fn into_call_error(self) -> Option<E> {
        match self {
            Self::Call(err) => Some(err),
            _ => None,
        }
    }

    pub fn map_call<F>(self, map: impl FnOnce(E) -> F) -> BridgeError<F> {
        match self {
            Self::Call(err) => BridgeError::Call(map(err)),
            Self::Timeout(limit) => BridgeError::Timeout(limit),
            Self::Cancelled => BridgeError::Cancelled,
            Self::Panicked(message) => BridgeError::Panicked(message),
            Self::Closed => BridgeError::Closed,
        }
    }
}

impl BridgeError<fiberkv::Error> {
    /// Either the bridge or the client gave up waiting.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Call(fiberkv::Error::Timeout)
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Call(fiberkv::Error::Cancelled))
    }

    pub fn is_data_error(&self) -> bool {
        matches!(self, Self::Call(err) if err.is_data_error())
    }
}

/// One outstanding blocking call, owned by the suspended caller.
///
/// Dropping it before `complete` (caller cancelled or timed out) cancels the
/// call's request context so context-aware operations stop early. Operations
/// that ignore the context run to completion and their result is discarded.
struct PendingCall {
    id: u64,
    ctx: RequestContext,
    completed: bool,
}

impl PendingCall {
    fn new(id: u64, ctx: RequestContext) -> Self {
        Self {
            id,
            ctx,
            completed: false,
        }
    }

    fn complete(&mut self) {
        self.completed = true;
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if !self.completed {
            self.ctx.cancel();
            debug!(call_id = self.id, "pending call abandoned; interrupting");
        }
    }
}

type Outcome<T, E> = std::thread::Result<Result<T, E>>;

/// Runs blocking calls on dedicated worker threads on behalf of async tasks.
///
/// The calling task suspends on a one-shot channel while the call runs, so it
/// never occupies an executor thread. Cloning is cheap; clones share the pool.
#[derive(Clone, Debug)]
pub struct SuspensionBridge {
    inner: Arc<BridgeInner>,
}

#[derive(Debug)]
struct BridgeInner {
    pool: WorkerPool,
    permits: Arc<Semaphore>,
    config: BridgeConfig,
    next_call_id: AtomicU64,
}

impl SuspensionBridge {
    pub fn new(config: BridgeConfig) -> Result<Self, PoolError> {
        let pool = WorkerPool::new(config.workers)?;
        let permits = Arc::new(Semaphore::new(config.max_pending.max(1)));
        Ok(Self {
            inner: Arc::new(BridgeInner {
                pool,
                permits,
                config,
                next_call_id: AtomicU64::new(1),
            }),
        })
    }

    pub fn from_env() -> Result<Self, PoolError> {
        Self::new(BridgeConfig::from_env())
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    /// Calls admitted and not yet finished, including abandoned ones whose
    /// blocking operation is still running.
    pub fn in_flight(&self) -> usize {
        self.inner
            .config
            .max_pending
            .max(1)
            .saturating_sub(self.inner.permits.available_permits())
    }

    /// Runs an opaque blocking operation. If the caller goes away first the
    /// operation still runs to completion and its result is dropped.
    pub async fn run<T, E, F>(&self, op: F) -> Result<T, BridgeError<E>>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        self.call(move |_ctx| op()).await
    }

    /// Runs a blocking operation that receives the call's request context.
    /// The context carries the configured call timeout and is cancelled if the
    /// caller is dropped or times out.
    pub async fn call<T, E, F>(&self, op: F) -> Result<T, BridgeError<E>>
    where
        F: FnOnce(&RequestContext) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let inner = &self.inner;
        // One deadline covers both waiting for admission and waiting for the result.
        let deadline = inner
            .config
            .call_timeout()
            .map(|limit| (Instant::now() + limit, limit));

        let admission = inner.permits.clone().acquire_owned();
        let acquired = match deadline {
            Some((at, limit)) => match tokio::time::timeout_at(at, admission).await {
                Ok(acquired) => acquired,
                Err(_) => {
                    debug!(?limit, "call timed out waiting for admission");
                    return Err(BridgeError::Timeout(limit));
                }
            },
            None => admission.await,
        };
        let permit = acquired.map_err(|_| BridgeError::<E>::Closed)?;

        let ctx = match deadline {
            Some((at, _)) => RequestContext::with_deadline(at.into_std()),
            None => RequestContext::background(),
        };
        let call_id = inner.next_call_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel::<Outcome<T, E>>();

        let worker_ctx = ctx.clone();
        inner
            .pool
            .submit(Box::new(move || {
                // Held until the operation returns, even if the caller left.
                let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| op(&worker_ctx)));
                drop(permit);
                if sender.send(outcome).is_err() {
                    debug!(call_id, "caller gone; discarding result");
                }
            }))
            .map_err(|_| BridgeError::<E>::Closed)?;
        debug!(call_id, "call submitted");

        let mut pending = PendingCall::new(call_id, ctx);
        let received = match deadline {
            Some((at, limit)) => match tokio::time::timeout_at(at, receiver).await {
                Ok(received) => received,
                Err(_) => {
                    debug!(call_id, ?limit, "call timed out");
                    return Err(BridgeError::Timeout(limit));
                }
            },
            None => receiver.await,
        };
        pending.complete();

        match received {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(err))) => Err(BridgeError::Call(err)),
            Ok(Err(payload)) => {
                let message = panic_message(payload.as_ref());
                warn!(call_id, %message, "blocking call panicked");
                Err(BridgeError::Panicked(message))
            }
            Err(_) => Err(BridgeError::Cancelled),
        }
    }

    /// Stops admitting calls. Calls already running or queued still finish.
    pub fn shutdown(&self) {
        self.inner.permits.close();
        self.inner.pool.close();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.permits.is_closed()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

static DEFAULT_BRIDGE: OnceCell<SuspensionBridge> = OnceCell::new();

/// The process-wide bridge used by [`run_blocking`], configured from the
/// environment on first use.
pub fn default_bridge() -> Result<&'static SuspensionBridge, PoolError> {
    DEFAULT_BRIDGE.get_or_try_init(SuspensionBridge::from_env)
}

/// Runs a blocking operation on the default bridge and suspends the calling
/// task until it finishes.
pub async fn run_blocking<T, E, F>(op: F) -> Result<T, BridgeError<E>>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    let bridge = default_bridge().map_err(|err| {
        warn!(error = %err, "default bridge unavailable");
        BridgeError::<E>::Closed
    })?;
    bridge.run(op).await
}
