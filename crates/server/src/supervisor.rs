//! Worker pool that serves `/predict` jobs on dedicated threads.
//!
//! Each worker owns its own detector (loaded when the worker starts) and
//! handles one job at a time. A supervisor thread replaces workers that exit
//! after their request budget and retires workers that stay busy longer than
//! the configured timeout. A retired worker cannot be interrupted; its thread
//! is abandoned and exits once its current call returns.
//!
//! A slot whose replacement cannot load its model stays empty and is retried
//! on later watchdog ticks. While every slot is empty the pool refuses new
//! jobs instead of queueing them.

use crate::config::SupervisorConfig;
use crate::handler::{HandlerError, InferenceResponse, PredictRequest, RequestHandler};
use axum::http::StatusCode;
use inference::Detector;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::oneshot;

const QUEUE_POLL_INTERVAL: Duration = Duration::from_millis(200);
const RESPAWN_ATTEMPTS: u32 = 5;
const RESPAWN_BASE_DELAY: Duration = Duration::from_millis(500);
/// Empty slots are retried every `REFILL_FACTOR * respawn base delay`.
const REFILL_FACTOR: u32 = 10;

type JobResult = Result<InferenceResponse, HandlerError>;
type Factory<D> = dyn Fn() -> anyhow::Result<D> + Send + Sync;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PoolError {
    #[error("job queue is full")]
    Busy,

    #[error("worker pool is shut down")]
    Unavailable,

    #[error("request exceeded the {0:?} timeout")]
    Timeout(Duration),

    #[error("worker exited before replying")]
    WorkerLost,
}

impl PoolError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            PoolError::Busy | PoolError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            PoolError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            PoolError::WorkerLost => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn client_message(&self) -> &'static str {
        match self {
            PoolError::Busy | PoolError::Unavailable => "Server busy",
            PoolError::Timeout(_) => "Request timed out",
            PoolError::WorkerLost => "Internal server error",
        }
    }
}

struct Job {
    request: PredictRequest,
    reply: oneshot::Sender<JobResult>,
}

#[derive(Debug)]
enum ExitReason {
    Recycled { served: u64 },
    QueueClosed,
    Retired,
    Panicked,
}

enum WorkerEvent {
    Exited {
        slot: usize,
        id: u64,
        reason: ExitReason,
    },
}

/// Milliseconds since the pool epoch at which the current job started, 0 when idle.
struct Heartbeat {
    epoch: Instant,
    busy_since: AtomicU64,
}

impl Heartbeat {
    fn new(epoch: Instant) -> Self {
        Self {
            epoch,
            busy_since: AtomicU64::new(0),
        }
    }

    fn begin(&self) {
        let now = self.epoch.elapsed().as_millis() as u64 + 1;
        self.busy_since.store(now, Ordering::Release);
    }

    fn end(&self) {
        self.busy_since.store(0, Ordering::Release);
    }

    fn busy_for(&self) -> Option<Duration> {
        match self.busy_since.load(Ordering::Acquire) {
            0 => None,
            since => {
                let now = self.epoch.elapsed().as_millis() as u64 + 1;
                Some(Duration::from_millis(now.saturating_sub(since)))
            }
        }
    }
}

struct WorkerHandle {
    id: u64,
    heartbeat: Arc<Heartbeat>,
    retired: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// Shared by the supervisor and every worker it spawns.
struct PoolContext<D> {
    config: SupervisorConfig,
    factory: Arc<Factory<D>>,
    jobs: Arc<Mutex<Receiver<Job>>>,
    events: Sender<WorkerEvent>,
    shutdown: Arc<AtomicBool>,
    live_workers: Arc<AtomicUsize>,
    respawn_base_delay: Duration,
    next_id: AtomicU64,
    epoch: Instant,
}

/// Sends the exit event when dropped, including during a panic unwind.
struct ExitNotice {
    slot: usize,
    id: u64,
    reason: ExitReason,
    events: Sender<WorkerEvent>,
}

impl Drop for ExitNotice {
    fn drop(&mut self) {
        let reason = if thread::panicking() {
            ExitReason::Panicked
        } else {
            std::mem::replace(&mut self.reason, ExitReason::Panicked)
        };
        let _ = self.events.send(WorkerEvent::Exited {
            slot: self.slot,
            id: self.id,
            reason,
        });
    }
}

pub struct WorkerPool {
    jobs: Mutex<Option<SyncSender<Job>>>,
    timeout: Duration,
    shutdown: Arc<AtomicBool>,
    live_workers: Arc<AtomicUsize>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Start `config.workers` workers, each loading its own detector through
    /// `factory`. Fails if any initial worker cannot load its model.
    pub fn start<D, F>(config: SupervisorConfig, factory: F) -> anyhow::Result<Self>
    where
        D: Detector + 'static,
        F: Fn() -> anyhow::Result<D> + Send + Sync + 'static,
    {
        Self::start_with_respawn_delay(config, factory, RESPAWN_BASE_DELAY)
    }

    fn start_with_respawn_delay<D, F>(
        config: SupervisorConfig,
        factory: F,
        respawn_base_delay: Duration,
    ) -> anyhow::Result<Self>
    where
        D: Detector + 'static,
        F: Fn() -> anyhow::Result<D> + Send + Sync + 'static,
    {
        let (job_tx, job_rx) = mpsc::sync_channel::<Job>(config.backlog);
        let (event_tx, event_rx) = mpsc::channel();
        let shutdown = Arc::new(AtomicBool::new(false));
        let live_workers = Arc::new(AtomicUsize::new(0));
        let timeout = config.timeout;

        let ctx = Arc::new(PoolContext {
            config,
            factory: Arc::new(factory),
            jobs: Arc::new(Mutex::new(job_rx)),
            events: event_tx,
            shutdown: Arc::clone(&shutdown),
            live_workers: Arc::clone(&live_workers),
            respawn_base_delay,
            next_id: AtomicU64::new(1),
            epoch: Instant::now(),
        });

        tracing::info!(
            workers = ctx.config.workers,
            timeout_seconds = ctx.config.timeout.as_secs_f64(),
            max_requests = ctx.config.max_requests,
            max_requests_jitter = ctx.config.max_requests_jitter,
            "Starting worker pool"
        );

        let mut slots = Vec::with_capacity(ctx.config.workers);
        for slot in 0..ctx.config.workers {
            match spawn_worker(&ctx, slot) {
                Ok(worker) => slots.push(Some(worker)),
                Err(e) => {
                    ctx.shutdown.store(true, Ordering::SeqCst);
                    drop(job_tx);
                    for worker in slots.into_iter().flatten() {
                        let _ = worker.thread.join();
                    }
                    return Err(e.context(format!("worker {} failed to start", slot)));
                }
            }
        }

        ctx.live_workers.store(slots.len(), Ordering::Release);

        let supervisor = thread::Builder::new()
            .name("supervisor".into())
            .spawn(move || supervise(ctx, slots, event_rx))?;

        Ok(Self {
            jobs: Mutex::new(Some(job_tx)),
            timeout,
            shutdown,
            live_workers,
            supervisor: Mutex::new(Some(supervisor)),
        })
    }

    /// Queue a request and wait for its result, bounded by the pool timeout.
    pub async fn submit(&self, request: PredictRequest) -> Result<JobResult, PoolError> {
        if self.live_workers() == 0 {
            return Err(PoolError::Unavailable);
        }

        let sender = self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(PoolError::Unavailable)?;

        let (reply, receiver) = oneshot::channel();
        sender
            .try_send(Job { request, reply })
            .map_err(|e| match e {
                TrySendError::Full(_) => PoolError::Busy,
                TrySendError::Disconnected(_) => PoolError::Unavailable,
            })?;

        match tokio::time::timeout(self.timeout, receiver).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(PoolError::WorkerLost),
            Err(_) => Err(PoolError::Timeout(self.timeout)),
        }
    }

    /// Number of slots that currently hold a loaded worker.
    pub fn live_workers(&self) -> usize {
        self.live_workers.load(Ordering::Acquire)
    }

    /// Stop accepting jobs and wait for idle workers to exit. Idempotent.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let supervisor = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = supervisor {
            if handle.join().is_err() {
                tracing::error!("Supervisor thread panicked");
            }
            tracing::info!("Worker pool stopped");
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn request_budget(config: &SupervisorConfig) -> Option<u64> {
    if config.max_requests == 0 {
        return None;
    }
    Some(config.max_requests + fastrand::u64(0..=config.max_requests_jitter))
}

/// Spawn a worker thread and block until its detector has loaded.
fn spawn_worker<D>(ctx: &Arc<PoolContext<D>>, slot: usize) -> anyhow::Result<WorkerHandle>
where
    D: Detector + 'static,
{
    let id = ctx.next_id.fetch_add(1, Ordering::Relaxed);
    let heartbeat = Arc::new(Heartbeat::new(ctx.epoch));
    let retired = Arc::new(AtomicBool::new(false));
    let (ready_tx, ready_rx) = mpsc::sync_channel::<anyhow::Result<()>>(1);

    let thread = {
        let ctx = Arc::clone(ctx);
        let heartbeat = Arc::clone(&heartbeat);
        let retired = Arc::clone(&retired);
        thread::Builder::new()
            .name(format!("worker-{}", id))
            .spawn(move || {
                let started = Instant::now();
                let detector = match (ctx.factory)() {
                    Ok(detector) => detector,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                tracing::info!(
                    worker = id,
                    slot,
                    load_seconds = started.elapsed().as_secs_f64(),
                    "Worker ready"
                );
                let _ = ready_tx.send(Ok(()));

                let mut notice = ExitNotice {
                    slot,
                    id,
                    reason: ExitReason::QueueClosed,
                    events: ctx.events.clone(),
                };
                let handler = RequestHandler::new(detector);
                notice.reason = run_worker(&ctx, id, handler, &heartbeat, &retired);
            })?
    };

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(WorkerHandle {
            id,
            heartbeat,
            retired,
            thread,
        }),
        Ok(Err(e)) => {
            let _ = thread.join();
            Err(e)
        }
        Err(_) => {
            let _ = thread.join();
            anyhow::bail!("worker {} exited during model load", id)
        }
    }
}

fn run_worker<D: Detector>(
    ctx: &PoolContext<D>,
    id: u64,
    mut handler: RequestHandler<D>,
    heartbeat: &Heartbeat,
    retired: &AtomicBool,
) -> ExitReason {
    let budget = request_budget(&ctx.config);
    let mut served = 0u64;

    loop {
        if retired.load(Ordering::Acquire) {
            return ExitReason::Retired;
        }
        if ctx.shutdown.load(Ordering::Acquire) {
            return ExitReason::QueueClosed;
        }

        let job = {
            let jobs = ctx.jobs.lock().unwrap_or_else(PoisonError::into_inner);
            match jobs.recv_timeout(QUEUE_POLL_INTERVAL) {
                Ok(job) => job,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return ExitReason::QueueClosed,
            }
        };

        if job.reply.is_closed() {
            tracing::debug!(worker = id, "Skipping job whose client stopped waiting");
            continue;
        }

        heartbeat.begin();
        let result = handler.handle(&job.request);
        heartbeat.end();

        if job.reply.send(result).is_err() {
            tracing::debug!(worker = id, "Client stopped waiting for the reply");
        }

        if retired.load(Ordering::Acquire) {
            tracing::warn!(worker = id, "Retired worker finished its last request");
            return ExitReason::Retired;
        }

        served += 1;
        if budget.is_some_and(|limit| served >= limit) {
            return ExitReason::Recycled { served };
        }
    }
}

fn supervise<D>(
    ctx: Arc<PoolContext<D>>,
    initial: Vec<Option<WorkerHandle>>,
    events: Receiver<WorkerEvent>,
) where
    D: Detector + 'static,
{
    let mut slots = initial;
    let mut refill_at: Vec<Option<Instant>> = vec![None; slots.len()];
    let mut retired: HashMap<u64, JoinHandle<()>> = HashMap::new();
    let watchdog_interval =
        (ctx.config.timeout / 4).clamp(Duration::from_millis(10), Duration::from_secs(1));

    while !ctx.shutdown.load(Ordering::Acquire) {
        match events.recv_timeout(watchdog_interval) {
            Ok(WorkerEvent::Exited { slot, id, reason }) => {
                if let Some(handle) = retired.remove(&id) {
                    let _ = handle.join();
                    continue;
                }
                let is_current = slots[slot].as_ref().is_some_and(|w| w.id == id);
                if !is_current || ctx.shutdown.load(Ordering::Acquire) {
                    continue;
                }
                if let Some(worker) = slots[slot].take() {
                    let _ = worker.thread.join();
                }
                match reason {
                    ExitReason::Recycled { served } => {
                        tracing::info!(worker = id, slot, served, "Recycling worker");
                    }
                    other => {
                        tracing::error!(
                            worker = id,
                            slot,
                            reason = ?other,
                            "Worker exited unexpectedly"
                        );
                    }
                }
                fill_slot(&ctx, &mut slots, &mut refill_at, slot);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        for slot in 0..slots.len() {
            let timed_out = slots[slot]
                .as_ref()
                .and_then(|w| w.heartbeat.busy_for())
                .is_some_and(|busy| busy > ctx.config.timeout);
            if !timed_out {
                continue;
            }
            if let Some(worker) = slots[slot].take() {
                tracing::error!(
                    worker = worker.id,
                    slot,
                    timeout_seconds = ctx.config.timeout.as_secs_f64(),
                    "Worker timed out, replacing it"
                );
                worker.retired.store(true, Ordering::Release);
                retired.insert(worker.id, worker.thread);
            }
            fill_slot(&ctx, &mut slots, &mut refill_at, slot);
        }

        let now = Instant::now();
        for slot in 0..slots.len() {
            let due = slots[slot].is_none() && refill_at[slot].is_some_and(|at| at <= now);
            if due && !ctx.shutdown.load(Ordering::Acquire) {
                tracing::info!(slot, "Retrying empty worker slot");
                fill_slot(&ctx, &mut slots, &mut refill_at, slot);
            }
        }
    }

    for worker in slots.into_iter().flatten() {
        let _ = worker.thread.join();
    }
    if !retired.is_empty() {
        tracing::warn!(count = retired.len(), "Abandoning timed-out workers");
    }
}

/// Respawn the worker for `slot`. On failure the slot stays empty and is
/// scheduled for another attempt.
fn fill_slot<D>(
    ctx: &Arc<PoolContext<D>>,
    slots: &mut [Option<WorkerHandle>],
    refill_at: &mut [Option<Instant>],
    slot: usize,
) where
    D: Detector + 'static,
{
    slots[slot] = respawn(ctx, slot);
    refill_at[slot] = match slots[slot] {
        Some(_) => None,
        None => {
            let retry_in = ctx.respawn_base_delay * REFILL_FACTOR;
            tracing::error!(
                slot,
                retry_in_seconds = retry_in.as_secs_f64(),
                "Worker slot left empty, model failed to load"
            );
            Some(Instant::now() + retry_in)
        }
    };

    let live = slots.iter().filter(|s| s.is_some()).count();
    if live == 0 {
        tracing::error!("No workers loaded, refusing new requests");
    }
    ctx.live_workers.store(live, Ordering::Release);
}

fn respawn<D>(ctx: &Arc<PoolContext<D>>, slot: usize) -> Option<WorkerHandle>
where
    D: Detector + 'static,
{
    common::retry_with_backoff(
        || spawn_worker(ctx, slot).map_err(|e| format!("{:#}", e)),
        RESPAWN_ATTEMPTS,
        ctx.respawn_base_delay,
        "worker respawn",
    )
    .ok()
}
