use portico::http::lifecycle::{EndReason, KeepAlivePolicy, Persistence};
use portico::http::request::{Method, Request, RequestBuilder, Version};
use std::time::Duration;

fn policy(max_requests: usize, load_limit: Option<usize>) -> KeepAlivePolicy {
    KeepAlivePolicy {
        idle_timeout: Duration::from_secs(5),
        max_requests,
        load_limit,
    }
}

fn get(version: Version, connection: Option<&str>) -> Request {
    let mut builder = RequestBuilder::new()
        .method(Method::GET)
        .path("/")
        .version(version);
    if let Some(value) = connection {
        builder = builder.header("Connection", value);
    }
    builder.build().unwrap()
}

#[test]
fn test_http11_keeps_alive_by_default() {
    let decision = policy(10, None).decide(&get(Version::Http11, None), 1, 1);
    assert_eq!(decision, Persistence::KeepAlive);
    assert_eq!(decision.header_value(), "keep-alive");
}

#[test]
fn test_http11_connection_close() {
    let decision = policy(10, None).decide(&get(Version::Http11, Some("close")), 1, 1);
    assert_eq!(
        decision,
        Persistence::Close(EndReason::ClientRequestedClose)
    );
    assert_eq!(decision.header_value(), "close");
}

#[test]
fn test_http10_closes_unless_keep_alive() {
    let p = policy(10, None);

    assert_eq!(
        p.decide(&get(Version::Http10, None), 1, 1),
        Persistence::Close(EndReason::ClientRequestedClose)
    );
    assert_eq!(
        p.decide(&get(Version::Http10, Some("keep-alive")), 1, 1),
        Persistence::KeepAlive
    );
}

#[test]
fn test_max_requests_forces_close_on_last_response() {
    let p = policy(3, None);
    let req = get(Version::Http11, None);

    assert!(p.decide(&req, 1, 1).is_keep_alive());
    assert!(p.decide(&req, 2, 1).is_keep_alive());
    assert_eq!(
        p.decide(&req, 3, 1),
        Persistence::Close(EndReason::MaxRequests)
    );
}

#[test]
fn test_load_limit_refuses_keep_alive() {
    let p = policy(10, Some(2));
    let req = get(Version::Http11, None);

    assert!(p.decide(&req, 1, 2).is_keep_alive());
    assert_eq!(
        p.decide(&req, 1, 3),
        Persistence::Close(EndReason::Overloaded)
    );
}

#[test]
fn test_keep_alive_header_counts_down() {
    let p = policy(5, None);

    assert_eq!(p.keep_alive_header(1), "timeout=5, max=4");
    assert_eq!(p.keep_alive_header(4), "timeout=5, max=1");
}

#[test]
fn test_end_reason_display() {
    assert_eq!(EndReason::IdleTimeout.to_string(), "idle_timeout");
    assert_eq!(EndReason::MaxRequests.to_string(), "max_requests");
    assert_eq!(EndReason::ReadError.to_string(), "read_error");
    assert_eq!(EndReason::WriteError.to_string(), "write_error");
    assert_eq!(EndReason::Shutdown.to_string(), "shutdown");
}
