use std::future::Future;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{Instant, Interval, interval_at, timeout};
use tracing::{debug, info, warn};

use crate::config::{Config, OverflowPolicy};
use crate::files::DocumentRoot;
use crate::http::connection::{Connection, ConnectionContext, SERVER_NAME};
use crate::http::response::Response;
use crate::http::writer::ResponseWriter;
use crate::server::pool::{PoolStats, SubmitError, WorkerPool};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);
const BUSY_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// An accepted connection waiting for a worker.
pub struct Job {
    pub stream: TcpStream,
    pub peer: SocketAddr,
}

/// Accept loop in front of the worker pool.
pub struct Server {
    listener: TcpListener,
    pool: WorkerPool<Job>,
    ctx: Arc<ConnectionContext>,
    overflow: OverflowPolicy,
    enqueue_timeout: Duration,
    stats_interval: Option<Duration>,
}

impl Server {
    /// Binds the listening socket and starts the worker pool.
    pub async fn bind(cfg: &Config) -> anyhow::Result<Self> {
        let root = DocumentRoot::new(
            &cfg.static_files.document_root,
            cfg.static_files.index_file.clone(),
        )?;

        let listener = TcpListener::bind(cfg.listen_addr())
            .await
            .with_context(|| format!("binding {}", cfg.listen_addr()))?;
        info!(
            "Listening on {}, serving {} (index: {})",
            listener.local_addr()?,
            root.path().display(),
            root.index_file()
        );

        let stats = Arc::new(PoolStats::default());
        let ctx = Arc::new(ConnectionContext::new(cfg, root, Arc::clone(&stats)));
        let handler_ctx = Arc::clone(&ctx);
        let pool = WorkerPool::start(
            cfg.pool.worker_count,
            cfg.pool.max_connections,
            stats,
            move |job: Job| handle_connection(job, Arc::clone(&handler_ctx)),
        );

        let stats_interval = match cfg.server.stats_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        Ok(Self {
            listener,
            pool,
            ctx,
            overflow: cfg.pool.overflow,
            enqueue_timeout: cfg.enqueue_timeout(),
            stats_interval,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(self.pool.stats())
    }

    /// Accepts connections until `shutdown` resolves, then drains the pool.
    pub async fn run_until<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let mut ticker = self
            .stats_interval
            .map(|period| interval_at(Instant::now() + period, period));

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown signal received, draining connections");
                    break;
                }

                _ = next_tick(&mut ticker) => self.log_stats(),

                accepted = self.listener.accept() => match accepted {
                    // Waiting for queue room must not hold off shutdown.
                    Ok((stream, peer)) => tokio::select! {
                        _ = self.dispatch(stream, peer) => {}
                        _ = &mut shutdown => {
                            info!("Shutdown signal received, draining connections");
                            break;
                        }
                    },
                    Err(e) => accept_failed(e).await,
                },
            }
        }

        let Self {
            listener, pool, ctx, ..
        } = self;
        drop(listener);
        ctx.begin_shutdown();

        let stats = Arc::clone(pool.stats());
        pool.shutdown().await;
        info!(
            completed = stats.completed(),
            rejected = stats.rejected(),
            "Server stopped"
        );

        Ok(())
    }

    async fn dispatch(&self, stream: TcpStream, peer: SocketAddr) {
        debug!(peer = %peer, "Accepted connection");

        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
        }

        match self.pool.submit(Job { stream, peer }, self.enqueue_timeout).await {
            Ok(()) => {}

            Err(SubmitError::Full(job)) => {
                self.pool.stats().record_rejected();
                warn!(
                    peer = %peer,
                    queued = self.pool.queued(),
                    policy = ?self.overflow,
                    "Worker queue full, shedding connection"
                );

                if self.overflow == OverflowPolicy::Reject {
                    tokio::spawn(reject_busy(job.stream, peer));
                }
            }

            Err(SubmitError::Closed(_)) => {
                warn!(peer = %peer, "Worker pool closed, dropping connection");
            }
        }
    }

    fn log_stats(&self) {
        let stats = self.pool.stats();
        info!(
            active = stats.active_connections(),
            queued = self.pool.queued(),
            completed = stats.completed(),
            failed = stats.failed(),
            rejected = stats.rejected(),
            restarts = stats.restarts(),
            "Server statistics"
        );
    }
}

/// Binds according to `cfg` and serves until Ctrl+C.
pub async fn run(cfg: &Config) -> anyhow::Result<()> {
    let server = Server::bind(cfg).await?;

    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        })
        .await
}

async fn handle_connection(job: Job, ctx: Arc<ConnectionContext>) -> anyhow::Result<()> {
    let Job { stream, peer } = job;
    let mut conn = Connection::new(stream, peer, ctx);

    let reason = conn.run().await;

    debug!(
        peer = %peer,
        reason = %reason,
        requests = conn.served(),
        "Connection closed"
    );

    Ok(())
}

async fn reject_busy(mut stream: TcpStream, peer: SocketAddr) {
    let mut response = Response::server_busy();
    response.set_header("Server", SERVER_NAME);
    response.set_header("Connection", "close");

    let mut writer = ResponseWriter::new(response, true);
    match timeout(BUSY_WRITE_TIMEOUT, writer.write_to_stream(&mut stream)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => debug!(peer = %peer, error = %e, "Failed to send busy response"),
        Err(_) => debug!(peer = %peer, "Timed out sending busy response"),
    }

    let _ = stream.shutdown().await;
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn accept_failed(e: std::io::Error) {
    match e.kind() {
        ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset | ErrorKind::Interrupted => {
            debug!(error = %e, "Transient accept error");
        }
        _ => {
            // Typically descriptor exhaustion; give in-flight connections a
            // chance to finish before retrying.
            warn!(error = %e, "Accept failed, backing off");
            tokio::time::sleep(ACCEPT_BACKOFF).await;
        }
    }
}
