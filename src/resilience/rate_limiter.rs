//! Priority-queued gate in front of every exchange call.
//!
//! A single worker task drains the queue:
//! - Calls are ordered by priority (trading orders first), then FIFO
//! - Identical call signatures (`endpoint_key`) are spaced by at least `min_interval`
//! - Each priority class has its own result timeout; callers that give up get
//!   [`ExchangeError::RateSlotTimeout`] and their queued job is dropped unexecuted

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::{oneshot, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

use crate::error::ExchangeError;

/// Call priority. Lower discriminant is served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Priority {
    TradingOrders = 1,
    PositionMonitoring = 2,
    SignalAnalysis = 3,
    AccountSync = 4,
}

/// Rate limiter configuration.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Minimum spacing between identical call signatures
    pub min_interval: Duration,

    /// Upper bound on a single execution once the slot is granted
    pub execution_timeout: Duration,

    pub trading_timeout: Duration,
    pub position_timeout: Duration,
    pub signal_timeout: Duration,
    pub account_timeout: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(60),      // exchange rule per identical call
            execution_timeout: Duration::from_secs(30),
            trading_timeout: Duration::from_secs(30),
            position_timeout: Duration::from_secs(20),
            signal_timeout: Duration::from_secs(20),
            account_timeout: Duration::from_secs(30),
        }
    }
}

impl RateLimiterConfig {
    /// How long a caller of the given priority waits for its result.
    pub fn timeout_for(&self, priority: Priority) -> Duration {
        match priority {
            Priority::TradingOrders => self.trading_timeout,
            Priority::PositionMonitoring => self.position_timeout,
            Priority::SignalAnalysis => self.signal_timeout,
            Priority::AccountSync => self.account_timeout,
        }
    }
}

/// Counters exposed for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStats {
    pub running: bool,
    pub queued: usize,
    pub executed: u64,
    pub abandoned: u64,
    pub slot_timeouts: u64,
}

type CallFuture<T> = BoxFuture<'static, Result<T, ExchangeError>>;

trait QueuedJob: Send {
    fn is_abandoned(&self) -> bool;
    fn run(self: Box<Self>, key: String, limit: Duration) -> BoxFuture<'static, ()>;
}

struct CallJob<T> {
    make: Box<dyn FnOnce() -> CallFuture<T> + Send>,
    tx: oneshot::Sender<Result<T, ExchangeError>>,
}

impl<T: Send + 'static> QueuedJob for CallJob<T> {
    fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }

    fn run(self: Box<Self>, key: String, limit: Duration) -> BoxFuture<'static, ()> {
        let CallJob { make, tx } = *self;
        Box::pin(async move {
            let result = match timeout(limit, make()).await {
                Ok(result) => result,
                Err(_) => Err(ExchangeError::Timeout {
                    operation: key,
                    after: limit,
                }),
            };
            let _ = tx.send(result);
        })
    }
}

struct QueuedCall {
    priority: Priority,
    seq: u64,
    endpoint_key: String,
    job: Box<dyn QueuedJob>,
}

enum NextCall {
    Ready(QueuedCall),
    WaitUntil(Instant),
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerState {
    Idle,
    Running,
    Stopped,
}

struct Inner {
    config: RateLimiterConfig,
    queue: Mutex<Vec<QueuedCall>>,
    last_calls: Mutex<HashMap<String, Instant>>,
    notify: Notify,
    seq: AtomicU64,
    executed: AtomicU64,
    abandoned: AtomicU64,
    slot_timeouts: AtomicU64,
}

struct Worker {
    state: WorkerState,
    handle: Option<JoinHandle<()>>,
    shutdown: Option<watch::Sender<bool>>,
}

/// Exchange-wide rate limiter. Cheap to share behind an `Arc`.
pub struct ExchangeRateLimiter {
    inner: Arc<Inner>,
    worker: Mutex<Worker>,
}

impl ExchangeRateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                queue: Mutex::new(Vec::new()),
                last_calls: Mutex::new(HashMap::new()),
                notify: Notify::new(),
                seq: AtomicU64::new(0),
                executed: AtomicU64::new(0),
                abandoned: AtomicU64::new(0),
                slot_timeouts: AtomicU64::new(0),
            }),
            worker: Mutex::new(Worker {
                state: WorkerState::Idle,
                handle: None,
                shutdown: None,
            }),
        }
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.inner.config
    }

    /// Start the worker. Also re-arms a limiter that was stopped.
    pub async fn start(&self) {
        let mut worker = self.worker.lock().await;
        if worker.state == WorkerState::Running {
            return;
        }
        Self::spawn_worker(&self.inner, &mut worker);
    }

    fn spawn_worker(inner: &Arc<Inner>, worker: &mut Worker) {
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run_worker(inner.clone(), rx));
        worker.state = WorkerState::Running;
        worker.handle = Some(handle);
        worker.shutdown = Some(tx);
        info!("Rate limiter worker started");
    }

    /// Stop the worker. Queued callers receive [`ExchangeError::LimiterStopped`].
    pub async fn stop(&self) {
        let (handle, shutdown) = {
            let mut worker = self.worker.lock().await;
            if worker.state != WorkerState::Running {
                worker.state = WorkerState::Stopped;
                return;
            }
            worker.state = WorkerState::Stopped;
            (worker.handle.take(), worker.shutdown.take())
        };

        if let Some(tx) = shutdown {
            let _ = tx.send(true);
        }
        if let Some(mut handle) = handle {
            if timeout(Duration::from_secs(5), &mut handle).await.is_err() {
                warn!("Rate limiter worker did not stop in time, aborting");
                handle.abort();
            }
        }

        let dropped = {
            let mut queue = self.inner.queue.lock().await;
            let n = queue.len();
            queue.clear();
            n
        };
        info!(dropped, "Rate limiter worker stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.worker.lock().await.state == WorkerState::Running
    }

    /// Queue `f` and wait for its result.
    ///
    /// Blocks only the calling task. The worker is started on first use; after
    /// an explicit [`stop`](Self::stop) calls fail until [`start`](Self::start).
    pub async fn call<T, F, Fut>(
        &self,
        priority: Priority,
        endpoint_key: impl Into<String>,
        f: F,
    ) -> Result<T, ExchangeError>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, ExchangeError>> + Send + 'static,
    {
        {
            let mut worker = self.worker.lock().await;
            match worker.state {
                WorkerState::Stopped => return Err(ExchangeError::LimiterStopped),
                WorkerState::Idle => Self::spawn_worker(&self.inner, &mut worker),
                WorkerState::Running => {}
            }
        }

        let endpoint_key = endpoint_key.into();
        let (tx, rx) = oneshot::channel();
        let job = CallJob {
            make: Box::new(move || -> CallFuture<T> { Box::pin(f()) }),
            tx,
        };

        {
            let mut queue = self.inner.queue.lock().await;
            queue.push(QueuedCall {
                priority,
                seq: self.inner.seq.fetch_add(1, Ordering::Relaxed),
                endpoint_key: endpoint_key.clone(),
                job: Box::new(job),
            });
        }
        self.inner.notify.notify_one();

        let wait = self.inner.config.timeout_for(priority);
        match timeout(wait, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ExchangeError::LimiterStopped),
            Err(_) => {
                self.inner.slot_timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(
                    endpoint = %endpoint_key,
                    priority = ?priority,
                    waited = ?wait,
                    "Timed out waiting for rate slot"
                );
                Err(ExchangeError::RateSlotTimeout {
                    priority,
                    waited: wait,
                })
            }
        }
    }

    pub async fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            running: self.is_running().await,
            queued: self.inner.queue.lock().await.len(),
            executed: self.inner.executed.load(Ordering::Relaxed),
            abandoned: self.inner.abandoned.load(Ordering::Relaxed),
            slot_timeouts: self.inner.slot_timeouts.load(Ordering::Relaxed),
        }
    }
}

impl Inner {
    /// Pick the highest-priority job whose endpoint is outside its interval.
    async fn next_call(&self) -> NextCall {
        let mut queue = self.queue.lock().await;
        let last_calls = self.last_calls.lock().await;

        let before = queue.len();
        queue.retain(|c| !c.job.is_abandoned());
        let dropped = before - queue.len();
        if dropped > 0 {
            self.abandoned.fetch_add(dropped as u64, Ordering::Relaxed);
            debug!(dropped, "Dropped calls whose callers gave up");
        }
        if queue.is_empty() {
            return NextCall::Empty;
        }

        let now = Instant::now();
        let ready_at = |key: &str| {
            last_calls
                .get(key)
                .map(|last| *last + self.config.min_interval)
                .unwrap_or(now)
        };

        let best = queue
            .iter()
            .enumerate()
            .filter(|(_, c)| ready_at(&c.endpoint_key) <= now)
            .min_by_key(|(_, c)| (c.priority, c.seq))
            .map(|(i, _)| i);

        match best {
            Some(i) => NextCall::Ready(queue.remove(i)),
            None => {
                let earliest = queue
                    .iter()
                    .map(|c| ready_at(&c.endpoint_key))
                    .min()
                    .unwrap_or(now);
                NextCall::WaitUntil(earliest)
            }
        }
    }
}

async fn run_worker(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        match inner.next_call().await {
            NextCall::Ready(call) => {
                let key = call.endpoint_key.clone();
                debug!(endpoint = %key, priority = ?call.priority, "Executing rate-limited call");
                let run = call.job.run(key.clone(), inner.config.execution_timeout);
                tokio::select! {
                    _ = run => {}
                    _ = shutdown.changed() => break,
                }
                inner.last_calls.lock().await.insert(key, Instant::now());
                inner.executed.fetch_add(1, Ordering::Relaxed);
            }
            NextCall::WaitUntil(deadline) => {
                tokio::select! {
                    _ = sleep_until(deadline) => {}
                    _ = inner.notify.notified() => {}
                    _ = shutdown.changed() => break,
                }
            }
            NextCall::Empty => {
                tokio::select! {
                    _ = inner.notify.notified() => {}
                    _ = shutdown.changed() => break,
                }
            }
        }
    }
}
