//! Fixed-size worker pool fed by a bounded queue.
//!
//! The acceptor pushes jobs into a bounded `mpsc` channel; `N` worker tasks
//! share the receiving end and each processes one job to completion before
//! taking the next. Every job runs in its own task that the worker awaits,
//! so a panicking job is contained and the worker keeps serving. A worker
//! that dies anyway is replaced by the pool supervisor.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::task::{JoinHandle, JoinSet};

type BoxedJob = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type Handler<T> = Arc<dyn Fn(T) -> BoxedJob + Send + Sync>;
type SharedReceiver<T> = Arc<Mutex<mpsc::Receiver<T>>>;

/// Counters shared between the workers and whoever reports on them.
#[derive(Debug, Default)]
pub struct PoolStats {
    active: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
    restarts: AtomicU64,
}

impl PoolStats {
    /// Jobs currently being processed.
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Jobs finished, successfully or not.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Jobs turned away because the queue stayed full.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    fn begin_job(&self) -> ActiveJob<'_> {
        self.active.fetch_add(1, Ordering::Relaxed);
        ActiveJob { stats: self }
    }
}

struct ActiveJob<'a> {
    stats: &'a PoolStats,
}

impl Drop for ActiveJob<'_> {
    fn drop(&mut self) {
        self.stats.active.fetch_sub(1, Ordering::Relaxed);
        self.stats.completed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Why a job could not be queued. The job is handed back to the caller.
#[derive(Debug)]
pub enum SubmitError<T> {
    /// The queue stayed full for the whole wait.
    Full(T),
    /// The pool is shutting down.
    Closed(T),
}

pub struct WorkerPool<T> {
    sender: mpsc::Sender<T>,
    supervisor: JoinHandle<()>,
    stats: Arc<PoolStats>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Starts `workers` workers reading from a queue holding at most
    /// `capacity` jobs.
    pub fn start<F, Fut>(workers: usize, capacity: usize, stats: Arc<PoolStats>, handler: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let handler: Handler<T> = Arc::new(move |job| -> BoxedJob { Box::pin(handler(job)) });

        let supervisor = tokio::spawn(supervise(
            workers.max(1),
            receiver,
            handler,
            Arc::clone(&stats),
        ));

        tracing::info!(workers, capacity, "Worker pool started");

        Self {
            sender,
            supervisor,
            stats,
        }
    }

    /// Queues a job, waiting up to `wait` for room.
    pub async fn submit(&self, job: T, wait: Duration) -> Result<(), SubmitError<T>> {
        use mpsc::error::SendTimeoutError;

        match self.sender.send_timeout(job, wait).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(job)) => Err(SubmitError::Full(job)),
            Err(SendTimeoutError::Closed(job)) => Err(SubmitError::Closed(job)),
        }
    }

    /// Jobs waiting for a worker.
    pub fn queued(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    pub fn stats(&self) -> &Arc<PoolStats> {
        &self.stats
    }

    /// Closes the queue and waits until every queued job has been processed.
    pub async fn shutdown(self) {
        let Self {
            sender, supervisor, ..
        } = self;
        drop(sender);

        if let Err(e) = supervisor.await {
            tracing::error!(error = %e, "Worker pool supervisor failed");
        }
    }
}

async fn supervise<T: Send + 'static>(
    workers: usize,
    receiver: SharedReceiver<T>,
    handler: Handler<T>,
    stats: Arc<PoolStats>,
) {
    let mut set = JoinSet::new();
    let mut ids = HashMap::new();
    for id in 0..workers {
        let handle = set.spawn(worker_loop(
            id,
            Arc::clone(&receiver),
            Arc::clone(&handler),
            Arc::clone(&stats),
        ));
        ids.insert(handle.id(), id);
    }

    let mut next_id = workers;
    while let Some(result) = set.join_next_with_id().await {
        let (task, failure) = match result {
            Ok((task, Ok(()))) => {
                ids.remove(&task);
                continue;
            }
            Ok((task, Err(e))) => (task, format!("{e:#}")),
            Err(e) => (e.id(), e.to_string()),
        };
        let dead = ids.remove(&task);

        stats.restarts.fetch_add(1, Ordering::Relaxed);
        tracing::error!(
            error = %failure,
            worker = ?dead,
            replacement = next_id,
            "Worker died, starting a replacement"
        );

        let handle = set.spawn(worker_loop(
            next_id,
            Arc::clone(&receiver),
            Arc::clone(&handler),
            Arc::clone(&stats),
        ));
        ids.insert(handle.id(), next_id);
        next_id += 1;
    }

    tracing::info!(
        completed = stats.completed(),
        failed = stats.failed(),
        restarts = stats.restarts(),
        "All workers stopped"
    );
}

async fn worker_loop<T: Send + 'static>(
    id: usize,
    receiver: SharedReceiver<T>,
    handler: Handler<T>,
    stats: Arc<PoolStats>,
) -> anyhow::Result<()> {
    tracing::debug!(worker = id, "Worker started");

    loop {
        let job = {
            let mut rx = receiver.lock().await;
            rx.recv().await
        };

        // Queue closed and drained.
        let Some(job) = job else {
            break;
        };

        let _active = stats.begin_job();
        match tokio::spawn(handler(job)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if is_fatal(&e) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                return Err(e.context(format!("worker {id} hit a fatal error")));
            }
            Ok(Err(e)) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(worker = id, error = %format!("{e:#}"), "Job failed");
            }
            Err(e) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(worker = id, error = %e, "Job panicked");
            }
        }
    }

    tracing::debug!(worker = id, "Worker exiting");
    Ok(())
}

/// Resource exhaustion that the worker should not try to carry on after.
fn is_fatal(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<io::Error>())
        .any(|e| e.kind() == io::ErrorKind::OutOfMemory)
}
