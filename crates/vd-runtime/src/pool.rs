//! WorkerPool - bounded-concurrency dispatch with session affinity
//!
//! - One bounded queue per worker; a full queue rejects immediately
//! - Sticky assignment hashes the session id to a fixed worker, otherwise a
//!   worker is picked at random
//! - Optional rate limiting using governor
//! - Two strategies: tasks on the node's runtime, or isolated workers that
//!   each own an OS thread and a private current-thread runtime

use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::num::NonZeroU32;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use governor::{Quota, RateLimiter, state::{NotKeyed, InMemoryState}, clock::DefaultClock};
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use vd_common::{DispatchMode, PoolStats};
use vd_config::WorkerPoolConfig;

use crate::error::RuntimeError;
use crate::metrics;
use crate::Result;

/// A unit of work handed to a worker
pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

enum Worker {
    Task(JoinHandle<()>),
    Thread(std::thread::JoinHandle<()>),
}

#[derive(Clone)]
struct Counters {
    queued: Arc<AtomicU32>,
    active: Arc<AtomicU32>,
}

pub struct WorkerPool {
    config: WorkerPoolConfig,
    lanes: Vec<mpsc::Sender<Job>>,
    workers: Mutex<Vec<Worker>>,
    shutdown_tx: broadcast::Sender<()>,
    rate_limiter: Option<Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>>,
    running: AtomicBool,
    counters: Counters,
    accepted: AtomicU64,
    rejected: AtomicU64,
    last_rate_limited: AtomicBool,
}

impl WorkerPool {
    /// Build the pool and start its workers. Tasks mode must be called from
    /// within a tokio runtime.
    pub fn start(config: WorkerPoolConfig) -> Result<Self> {
        if config.workers == 0 || config.queue_capacity == 0 {
            return Err(RuntimeError::pool("workers and queue_capacity must be positive"));
        }

        let rate_limiter = config.rate_limit_per_minute.and_then(|rpm| {
            NonZeroU32::new(rpm).map(|nz| Arc::new(RateLimiter::direct(Quota::per_minute(nz))))
        });

        let (shutdown_tx, _) = broadcast::channel(1);
        let counters = Counters {
            queued: Arc::new(AtomicU32::new(0)),
            active: Arc::new(AtomicU32::new(0)),
        };

        let mut lanes = Vec::with_capacity(config.workers as usize);
        let mut workers = Vec::with_capacity(config.workers as usize);
        for index in 0..config.workers {
            let (tx, rx) = mpsc::channel::<Job>(config.queue_capacity as usize);
            let shutdown_rx = shutdown_tx.subscribe();
            let worker = match config.mode {
                DispatchMode::Tasks => Worker::Task(tokio::spawn(Self::run_task_worker(
                    index,
                    rx,
                    shutdown_rx,
                    counters.clone(),
                ))),
                DispatchMode::Isolated => Worker::Thread(Self::spawn_isolated_worker(
                    index,
                    rx,
                    shutdown_rx,
                    counters.clone(),
                )?),
            };
            lanes.push(tx);
            workers.push(worker);
        }

        info!(
            mode = ?config.mode,
            workers = config.workers,
            queue_capacity = config.queue_capacity,
            sticky = config.sticky,
            rate_limit = ?config.rate_limit_per_minute,
            "Started worker pool"
        );

        Ok(Self {
            config,
            lanes,
            workers: Mutex::new(workers),
            shutdown_tx,
            rate_limiter,
            running: AtomicBool::new(true),
            counters,
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            last_rate_limited: AtomicBool::new(false),
        })
    }

    /// Hand a job to a worker. Returns `false` without blocking when the
    /// target lane is full, the pool is rate limited, or shutting down.
    pub fn assign(&self, job: Job, session_id: &str) -> bool {
        if !self.running.load(Ordering::SeqCst) {
            return self.reject(session_id, "pool stopped");
        }

        if let Some(ref rl) = self.rate_limiter {
            let limited = rl.check().is_err();
            self.last_rate_limited.store(limited, Ordering::SeqCst);
            if limited {
                return self.reject(session_id, "rate limited");
            }
        }

        let lane = self.lane_for(session_id);
        // count before sending so the worker's decrement never underflows
        self.counters.queued.fetch_add(1, Ordering::SeqCst);
        match self.lanes[lane].try_send(job) {
            Ok(()) => {
                self.accepted.fetch_add(1, Ordering::SeqCst);
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.counters.queued.fetch_sub(1, Ordering::SeqCst);
                self.reject(session_id, "lane full")
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.counters.queued.fetch_sub(1, Ordering::SeqCst);
                self.reject(session_id, "lane closed")
            }
        }
    }

    fn reject(&self, session_id: &str, reason: &'static str) -> bool {
        self.rejected.fetch_add(1, Ordering::SeqCst);
        metrics::pool_rejected();
        debug!(session_id = %session_id, reason = reason, "Worker pool rejected job");
        false
    }

    fn lane_for(&self, session_id: &str) -> usize {
        let lanes = self.lanes.len();
        if self.config.sticky {
            let mut hasher = DefaultHasher::new();
            session_id.hash(&mut hasher);
            (hasher.finish() % lanes as u64) as usize
        } else {
            rand::thread_rng().gen_range(0..lanes)
        }
    }

    async fn next_job(
        rx: &mut mpsc::Receiver<Job>,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> Option<Job> {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => None,
            job = rx.recv() => job,
        }
    }

    /// Shared-memory worker: a job always runs to completion once started
    async fn run_task_worker(
        index: u32,
        mut rx: mpsc::Receiver<Job>,
        mut shutdown_rx: broadcast::Receiver<()>,
        counters: Counters,
    ) {
        debug!(worker = index, "Task worker started");
        while let Some(job) = Self::next_job(&mut rx, &mut shutdown_rx).await {
            counters.queued.fetch_sub(1, Ordering::SeqCst);
            counters.active.fetch_add(1, Ordering::SeqCst);
            job.await;
            counters.active.fetch_sub(1, Ordering::SeqCst);
        }
        debug!(worker = index, "Task worker exited");
    }

    /// Isolated worker: shutdown interrupts the in-flight job
    fn spawn_isolated_worker(
        index: u32,
        mut rx: mpsc::Receiver<Job>,
        mut shutdown_rx: broadcast::Receiver<()>,
        counters: Counters,
    ) -> Result<std::thread::JoinHandle<()>> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| RuntimeError::pool(format!("worker {} runtime: {}", index, e)))?;

        std::thread::Builder::new()
            .name(format!("vdag-worker-{}", index))
            .spawn(move || {
                runtime.block_on(async move {
                    debug!(worker = index, "Isolated worker started");
                    while let Some(job) = Self::next_job(&mut rx, &mut shutdown_rx).await {
                        counters.queued.fetch_sub(1, Ordering::SeqCst);
                        counters.active.fetch_add(1, Ordering::SeqCst);
                        let interrupted = tokio::select! {
                            _ = job => false,
                            _ = shutdown_rx.recv() => true,
                        };
                        counters.active.fetch_sub(1, Ordering::SeqCst);
                        if interrupted {
                            warn!(worker = index, "Isolated worker terminated mid-job");
                            break;
                        }
                    }
                });
                runtime.shutdown_background();
                debug!(worker = index, "Isolated worker exited");
            })
            .map_err(|e| RuntimeError::pool(format!("worker {} thread: {}", index, e)))
    }

    /// Signal every worker. Task workers get `shutdown_timeout_ms` to finish
    /// their current job before being aborted; isolated workers drop theirs.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(
            queued = self.counters.queued.load(Ordering::SeqCst),
            active = self.counters.active.load(Ordering::SeqCst),
            "Shutting down worker pool"
        );
        let _ = self.shutdown_tx.send(());

        let workers: Vec<Worker> = std::mem::take(&mut *self.workers.lock());
        let deadline = Duration::from_millis(self.config.shutdown_timeout_ms);
        for worker in workers {
            match worker {
                Worker::Task(handle) => {
                    let abort = handle.abort_handle();
                    if tokio::time::timeout(deadline, handle).await.is_err() {
                        warn!("Task worker missed shutdown deadline, aborting");
                        abort.abort();
                    }
                }
                Worker::Thread(handle) => {
                    let joined = tokio::task::spawn_blocking(move || handle.join()).await;
                    if !matches!(joined, Ok(Ok(()))) {
                        error!("Isolated worker thread did not exit cleanly");
                    }
                }
            }
        }
        info!("Worker pool shutdown complete");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn queued(&self) -> u32 {
        self.counters.queued.load(Ordering::SeqCst)
    }

    pub fn active_workers(&self) -> u32 {
        self.counters.active.load(Ordering::SeqCst)
    }

    pub fn get_stats(&self) -> PoolStats {
        PoolStats {
            mode: self.config.mode,
            sticky: self.config.sticky,
            workers: self.config.workers,
            queue_capacity_per_worker: self.config.queue_capacity,
            queued: self.queued(),
            active_workers: self.active_workers(),
            accepted_total: self.accepted.load(Ordering::SeqCst),
            rejected_total: self.rejected.load(Ordering::SeqCst),
            rate_limit_per_minute: self.config.rate_limit_per_minute,
            is_rate_limited: self.last_rate_limited.load(Ordering::SeqCst),
        }
    }
}
