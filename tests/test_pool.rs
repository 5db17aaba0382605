use portico::server::{PoolStats, SubmitError, WorkerPool};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore, mpsc};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_every_job_is_processed() {
    let done = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&done);

    let pool = WorkerPool::start(3, 8, Arc::new(PoolStats::default()), move |n: usize| {
        let counter = Arc::clone(&counter);
        async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            counter.fetch_add(n, Ordering::SeqCst);
            Ok(())
        }
    });

    for _ in 0..20 {
        pool.submit(1, WAIT).await.unwrap();
    }

    let stats = Arc::clone(pool.stats());
    pool.shutdown().await;

    assert_eq!(done.load(Ordering::SeqCst), 20);
    assert_eq!(stats.completed(), 20);
    assert_eq!(stats.active_connections(), 0);
}

#[tokio::test]
async fn test_failing_and_panicking_jobs_do_not_stop_workers() {
    let done = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&done);

    let pool = WorkerPool::start(1, 4, Arc::new(PoolStats::default()), move |job: &'static str| {
        let counter = Arc::clone(&counter);
        async move {
            match job {
                "panic" => panic!("job blew up"),
                "fail" => anyhow::bail!("job failed"),
                _ => {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }
        }
    });

    for job in ["ok", "panic", "ok", "fail", "ok"] {
        pool.submit(job, WAIT).await.unwrap();
    }

    let stats = Arc::clone(pool.stats());
    pool.shutdown().await;

    assert_eq!(done.load(Ordering::SeqCst), 3);
    assert_eq!(stats.completed(), 5);
    assert_eq!(stats.failed(), 2);
    assert_eq!(stats.restarts(), 0);
}

#[tokio::test]
async fn test_worker_dies_on_fatal_error_and_is_replaced() {
    let done = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&done);

    let pool = WorkerPool::start(1, 4, Arc::new(PoolStats::default()), move |fatal: bool| {
        let counter = Arc::clone(&counter);
        async move {
            if fatal {
                let oom = std::io::Error::from(std::io::ErrorKind::OutOfMemory);
                return Err(anyhow::Error::from(oom));
            }
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });

    for fatal in [false, true, false] {
        pool.submit(fatal, WAIT).await.unwrap();
    }

    let stats = Arc::clone(pool.stats());
    pool.shutdown().await;

    assert_eq!(done.load(Ordering::SeqCst), 2);
    assert_eq!(stats.restarts(), 1);
}

#[tokio::test]
async fn test_full_queue_hands_job_back() {
    let release = Arc::new(Notify::new());
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();

    let gate = Arc::clone(&release);
    let pool = WorkerPool::start(1, 1, Arc::new(PoolStats::default()), move |n: u32| {
        let gate = Arc::clone(&gate);
        let started = started_tx.clone();
        async move {
            let _ = started.send(n);
            gate.notified().await;
            Ok(())
        }
    });

    // First job occupies the only worker, second fills the queue.
    pool.submit(1, WAIT).await.unwrap();
    assert_eq!(started_rx.recv().await, Some(1));
    pool.submit(2, WAIT).await.unwrap();
    assert_eq!(pool.queued(), 1);

    match pool.submit(3, Duration::from_millis(50)).await {
        Err(SubmitError::Full(job)) => assert_eq!(job, 3),
        other => panic!("expected a full queue, got {other:?}"),
    }

    // Let the busy job finish; the queued one then runs.
    release.notify_one();
    assert_eq!(started_rx.recv().await, Some(2));
    release.notify_one();

    pool.shutdown().await;
}

#[tokio::test]
async fn test_active_count_tracks_running_jobs() {
    let release = Arc::new(Semaphore::new(0));
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();

    let gate = Arc::clone(&release);
    let pool = WorkerPool::start(2, 2, Arc::new(PoolStats::default()), move |_: ()| {
        let gate = Arc::clone(&gate);
        let started = started_tx.clone();
        async move {
            let _ = started.send(());
            let _permit = gate.acquire().await.unwrap();
            Ok(())
        }
    });

    pool.submit((), WAIT).await.unwrap();
    pool.submit((), WAIT).await.unwrap();
    started_rx.recv().await.unwrap();
    started_rx.recv().await.unwrap();

    assert_eq!(pool.stats().active_connections(), 2);

    release.add_permits(2);
    let stats = Arc::clone(pool.stats());
    pool.shutdown().await;
    assert_eq!(stats.active_connections(), 0);
    assert_eq!(stats.completed(), 2);
    assert_eq!(stats.failed(), 0);
}
