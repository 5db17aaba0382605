//! Keep-alive decisions.
//!
//! After every response the connection asks [`KeepAlivePolicy::decide`]
//! whether to read another request or to close. The idle timeout itself is
//! enforced by the connection around each read.

use std::fmt;
use std::time::Duration;

use crate::config::Config;
use crate::http::request::Request;

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// The client closed its side between requests.
    ClientClosed,
    /// No complete request arrived, or the client stopped reading the
    /// response, within the idle timeout.
    IdleTimeout,
    /// Reading from the socket failed.
    ReadError,
    /// Writing the response failed; the framing is lost, so nothing more is sent.
    WriteError,
    /// The request could not be parsed (400 or 431 was sent).
    BadRequest,
    /// The per-connection request cap was reached.
    MaxRequests,
    /// `Connection: close`, or HTTP/1.0 without `keep-alive`.
    ClientRequestedClose,
    /// Too many active connections to grant keep-alive.
    Overloaded,
    /// The server is draining and no longer waits for further requests.
    Shutdown,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EndReason::ClientClosed => "client_closed",
            EndReason::IdleTimeout => "idle_timeout",
            EndReason::ReadError => "read_error",
            EndReason::WriteError => "write_error",
            EndReason::BadRequest => "bad_request",
            EndReason::MaxRequests => "max_requests",
            EndReason::ClientRequestedClose => "client_requested_close",
            EndReason::Overloaded => "overloaded",
            EndReason::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// Outcome of a keep-alive decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persistence {
    KeepAlive,
    Close(EndReason),
}

impl Persistence {
    pub fn is_keep_alive(&self) -> bool {
        matches!(self, Persistence::KeepAlive)
    }

    /// Value for the `Connection` response header.
    pub fn header_value(&self) -> &'static str {
        match self {
            Persistence::KeepAlive => "keep-alive",
            Persistence::Close(_) => "close",
        }
    }
}

#[derive(Debug, Clone)]
pub struct KeepAlivePolicy {
    pub idle_timeout: Duration,
    pub max_requests: usize,
    pub load_limit: Option<usize>,
}

impl KeepAlivePolicy {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            idle_timeout: cfg.idle_timeout(),
            max_requests: cfg.connection.max_requests_per_connection,
            load_limit: cfg.connection.keep_alive_load_limit,
        }
    }

    /// Decides what happens after the response to `request`.
    ///
    /// `served` counts requests answered on this connection including this
    /// one; `active` is the number of connections currently being handled.
    pub fn decide(&self, request: &Request, served: usize, active: usize) -> Persistence {
        if !request.keep_alive() {
            return Persistence::Close(EndReason::ClientRequestedClose);
        }

        if served >= self.max_requests {
            return Persistence::Close(EndReason::MaxRequests);
        }

        if self.load_limit.is_some_and(|limit| active > limit) {
            return Persistence::Close(EndReason::Overloaded);
        }

        Persistence::KeepAlive
    }

    /// Value for the `Keep-Alive` header sent with persistent responses.
    pub fn keep_alive_header(&self, served: usize) -> String {
        format!(
            "timeout={}, max={}",
            self.idle_timeout.as_secs().max(1),
            self.max_requests.saturating_sub(served)
        )
    }
}
