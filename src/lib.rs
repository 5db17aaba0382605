//! Portico - multithreaded static file server
//!
//! Core library: HTTP/1.x handling, static file resolution and the
//! acceptor/worker-pool server.

pub mod config;
pub mod files;
pub mod http;
pub mod server;
