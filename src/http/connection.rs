use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::timeout;

use crate::config::Config;
use crate::files::{self, DocumentRoot};
use crate::http::lifecycle::{EndReason, KeepAlivePolicy, Persistence};
use crate::http::parser::{ParseError, ParseLimits, parse_with_limits};
use crate::http::request::{Method, Request};
use crate::http::response::{Response, StatusCode};
use crate::http::writer::{ResponseWriter, WriteStalled};
use crate::server::pool::PoolStats;

/// Value of the `Server` response header.
pub const SERVER_NAME: &str = concat!("portico/", env!("CARGO_PKG_VERSION"));

/// Everything a connection needs besides its socket, shared by all workers.
#[derive(Debug)]
pub struct ConnectionContext {
    pub root: DocumentRoot,
    pub policy: KeepAlivePolicy,
    pub limits: ParseLimits,
    pub stream_threshold: u64,
    pub stats: Arc<PoolStats>,
    shutdown: watch::Sender<bool>,
}

impl ConnectionContext {
    pub fn new(cfg: &Config, root: DocumentRoot, stats: Arc<PoolStats>) -> Self {
        Self {
            root,
            policy: KeepAlivePolicy::from_config(cfg),
            limits: ParseLimits {
                max_line_size: cfg.connection.max_line_size,
                max_header_size: cfg.connection.max_header_size,
                max_body_size: cfg.connection.max_body_size,
            },
            stream_threshold: cfg.static_files.stream_threshold,
            stats,
            shutdown: watch::channel(false).0,
        }
    }

    /// Tells every connection to stop waiting for further requests.
    ///
    /// Connections between keep-alive requests close at once; requests
    /// already read are still answered, with `Connection: close`.
    pub fn begin_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

pub struct Connection<S> {
    stream: S,
    peer: SocketAddr,
    buffer: BytesMut,
    state: ConnectionState,
    ctx: Arc<ConnectionContext>,
    served: usize,
}

pub enum ConnectionState {
    Reading,
    Processing(Request),
    Writing(ResponseWriter, Persistence),
    Closed(EndReason),
}

enum ReadOutcome {
    Request(Request),
    Invalid(ParseError),
    Eof,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, peer: SocketAddr, ctx: Arc<ConnectionContext>) -> Self {
        Self {
            stream,
            peer,
            buffer: BytesMut::with_capacity(4096),
            state: ConnectionState::Reading,
            ctx,
            served: 0,
        }
    }

    /// Number of requests answered so far.
    pub fn served(&self) -> usize {
        self.served
    }

    /// Drives the connection until it closes and returns why it ended.
    ///
    /// Socket failures end the connection like any other reason; nothing is
    /// sent after a failed read or write.
    pub async fn run(&mut self) -> EndReason {
        loop {
            match &mut self.state {
                ConnectionState::Reading => {
                    let idle = self.ctx.policy.idle_timeout;
                    // Draining only cuts idle persistent connections; a fresh
                    // connection still gets its first request answered.
                    let draining = self.served > 0;
                    let stop = self.ctx.shutdown.subscribe();

                    let read = tokio::select! {
                        result = timeout(idle, self.read_request()) => Some(result),
                        _ = shutdown_signal(stop), if draining => None,
                    };

                    self.state = match read {
                        None => ConnectionState::Closed(EndReason::Shutdown),
                        Some(Err(_)) => ConnectionState::Closed(EndReason::IdleTimeout),
                        Some(Ok(Err(e))) => {
                            tracing::debug!(peer = %self.peer, error = %e, "Read failed");
                            ConnectionState::Closed(EndReason::ReadError)
                        }
                        Some(Ok(Ok(ReadOutcome::Request(req)))) => ConnectionState::Processing(req),
                        Some(Ok(Ok(ReadOutcome::Eof))) => {
                            ConnectionState::Closed(EndReason::ClientClosed)
                        }
                        Some(Ok(Ok(ReadOutcome::Invalid(err)))) => {
                            tracing::info!(peer = %self.peer, error = %err, "Rejecting malformed request");
                            let persistence = Persistence::Close(EndReason::BadRequest);
                            let mut response = parse_error_response(&err);
                            self.finish_headers(&mut response, persistence);
                            let writer = ResponseWriter::new(response, true).with_write_timeout(idle);
                            ConnectionState::Writing(writer, persistence)
                        }
                    };
                }

                ConnectionState::Processing(req) => {
                    self.served += 1;

                    let mut response = files::serve(req, &self.ctx.root).await;
                    let persistence = if self.ctx.is_shutting_down() {
                        Persistence::Close(EndReason::Shutdown)
                    } else {
                        self.ctx
                            .policy
                            .decide(req, self.served, self.ctx.stats.active_connections())
                    };

                    tracing::info!(
                        peer = %self.peer,
                        method = req.method.as_str(),
                        path = %req.path,
                        version = req.version.as_str(),
                        status = response.status.as_u16(),
                        request = self.served,
                        "Request served"
                    );

                    let send_body = req.method != Method::HEAD;
                    finish_headers(
                        &mut response,
                        persistence,
                        &self.ctx.policy,
                        self.served,
                    );
                    let writer = ResponseWriter::new(response, send_body)
                        .with_stream_threshold(self.ctx.stream_threshold)
                        .with_write_timeout(self.ctx.policy.idle_timeout);
                    self.state = ConnectionState::Writing(writer, persistence);
                }

                ConnectionState::Writing(writer, persistence) => {
                    let persistence = *persistence;
                    let written = writer.write_to_stream(&mut self.stream).await;

                    self.state = match written {
                        Ok(_) => match persistence {
                            Persistence::KeepAlive => ConnectionState::Reading,
                            Persistence::Close(reason) => ConnectionState::Closed(reason),
                        },
                        Err(e) if e.is::<WriteStalled>() => {
                            tracing::debug!(peer = %self.peer, "Client stopped reading the response");
                            ConnectionState::Closed(EndReason::IdleTimeout)
                        }
                        Err(e) => {
                            tracing::debug!(peer = %self.peer, error = %format!("{e:#}"), "Write failed");
                            ConnectionState::Closed(EndReason::WriteError)
                        }
                    };
                }

                ConnectionState::Closed(reason) => {
                    let reason = *reason;
                    // The peer may already be gone; nothing left to report.
                    let _ = timeout(self.ctx.policy.idle_timeout, self.stream.shutdown()).await;
                    return reason;
                }
            }
        }
    }

    fn finish_headers(&self, response: &mut Response, persistence: Persistence) {
        finish_headers(response, persistence, &self.ctx.policy, self.served);
    }

    async fn read_request(&mut self) -> anyhow::Result<ReadOutcome> {
        loop {
            // Try parsing whatever we already have
            match parse_with_limits(&self.buffer, &self.ctx.limits) {
                Ok((request, consumed)) => {
                    self.buffer.advance(consumed);
                    return Ok(ReadOutcome::Request(request));
                }

                Err(ParseError::Incomplete) => {
                    // Need more data → fall through to read
                }

                Err(e) => return Ok(ReadOutcome::Invalid(e)),
            }

            self.buffer.reserve(4096);
            let n = self.stream.read_buf(&mut self.buffer).await?;

            if n == 0 {
                // Client closed connection, possibly mid-request
                return Ok(ReadOutcome::Eof);
            }
        }
    }
}

async fn shutdown_signal(mut stop: watch::Receiver<bool>) {
    // The sender lives in the context, which outlives every connection.
    let _ = stop.wait_for(|stop| *stop).await;
}

/// Adds the headers every response carries regardless of its status.
fn finish_headers(
    response: &mut Response,
    persistence: Persistence,
    policy: &KeepAlivePolicy,
    served: usize,
) {
    response.set_header("Server", SERVER_NAME);
    response.set_header("Connection", persistence.header_value());
    if persistence.is_keep_alive() {
        response.set_header("Keep-Alive", policy.keep_alive_header(served));
    }
}

/// Maps a parse failure to the response sent before closing.
pub fn parse_error_response(err: &ParseError) -> Response {
    match err {
        ParseError::TooLarge => Response::error_page(
            StatusCode::RequestHeaderFieldsTooLarge,
            "The request line or headers are too large.",
        ),
        ParseError::BadRequest(_) | ParseError::Incomplete => Response::error_page(
            StatusCode::BadRequest,
            "The server could not understand the request.",
        ),
    }
}
