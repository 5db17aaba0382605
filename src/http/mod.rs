//! HTTP protocol implementation.
//!
//! This module implements the HTTP/1.0 and HTTP/1.1 subset the file server
//! speaks: `GET` and `HEAD`, persistent connections, fixed-length bodies.
//!
//! # Architecture
//!
//! - **`connection`**: The per-connection request-response state machine
//! - **`parser`**: Parses incoming HTTP requests from byte buffers
//! - **`request`**: HTTP request representation
//! - **`response`**: HTTP response representation with builder pattern
//! - **`writer`**: Serializes and writes HTTP responses to the client
//! - **`lifecycle`**: Keep-alive decisions and connection end reasons
//! - **`mime`**: MIME type detection based on file extensions
//!
//! # Connection State Machine
//!
//! Each client connection goes through a state machine:
//!
//! ```text
//!        ┌─────────────┐
//!        │   Reading   │ ← Wait for incoming request data (idle timeout, shutdown)
//!        └──────┬──────┘
//!               │ Request received      (malformed → 400/431, then Closed)
//!               ▼
//!        ┌──────────────────┐
//!        │   Processing     │ ← Resolve file, decide keep-alive
//!        └──────┬───────────┘
//!               │ Response ready
//!               ▼
//!        ┌──────────────────┐
//!        │    Writing       │ ← Send response to client
//!        └──────┬───────────┘
//!               │ Response sent
//!               ├─ Keep-Alive → Reading (same connection)
//!               └─ Close → Closed
//! ```
//!
//! # Example
//!
//! ```ignore
//! use portico::config::Config;
//! use portico::server::Server;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let server = Server::bind(&Config::load()?).await?;
//!     server.run_until(async { tokio::signal::ctrl_c().await.ok(); }).await
//! }
//! ```

pub mod connection;
pub mod lifecycle;
pub mod mime;
pub mod parser;
pub mod request;
pub mod response;
pub mod writer;
