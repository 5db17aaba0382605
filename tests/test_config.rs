use portico::config::{Config, OverflowPolicy};
use std::collections::HashMap;
use std::path::PathBuf;

fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key: &str| vars.get(key).cloned()
}

#[test]
fn test_config_default_address() {
    let cfg = Config::default();
    assert_eq!(cfg.listen_addr(), "127.0.0.1:8080");
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_config_defaults() {
    let cfg = Config::default();

    assert_eq!(cfg.static_files.document_root, PathBuf::from("./public"));
    assert_eq!(cfg.static_files.index_file, "index.html");
    assert!(cfg.pool.worker_count >= 1);
    assert_eq!(cfg.pool.max_connections, 64);
    assert_eq!(cfg.pool.overflow, OverflowPolicy::Reject);
    assert_eq!(cfg.connection.keep_alive_load_limit, None);
}

#[test]
fn test_config_custom_address_from_env() {
    let mut cfg = Config::default();
    cfg.apply_overrides(lookup(&[("LISTEN", "0.0.0.0:3000")]))
        .unwrap();

    assert_eq!(cfg.listen_addr(), "0.0.0.0:3000");
    assert_eq!(cfg.server.port, 3000);
}

#[test]
fn test_config_document_root_and_workers_from_env() {
    let mut cfg = Config::default();
    cfg.apply_overrides(lookup(&[("DOCUMENT_ROOT", "/srv/www"), ("WORKERS", "3")]))
        .unwrap();

    assert_eq!(cfg.static_files.document_root, PathBuf::from("/srv/www"));
    assert_eq!(cfg.pool.worker_count, 3);
}

#[test]
fn test_config_invalid_env_values() {
    let mut cfg = Config::default();
    assert!(cfg.apply_overrides(lookup(&[("LISTEN", "no-port")])).is_err());
    assert!(cfg.apply_overrides(lookup(&[("LISTEN", "host:http")])).is_err());
    assert!(cfg.apply_overrides(lookup(&[("WORKERS", "many")])).is_err());
}

#[test]
fn test_config_from_yaml() {
    let yaml = r#"
server:
  port: 9090
  log_level: debug
static_files:
  document_root: ./site
pool:
  worker_count: 2
  max_connections: 4
  overflow: drop
connection:
  idle_timeout_ms: 250
  max_requests_per_connection: 3
  keep_alive_load_limit: 10
"#;
    let cfg = Config::from_yaml(yaml).unwrap();

    assert_eq!(cfg.listen_addr(), "127.0.0.1:9090");
    assert_eq!(cfg.server.log_level, "debug");
    assert_eq!(cfg.static_files.document_root, PathBuf::from("./site"));
    // Unspecified fields keep their defaults.
    assert_eq!(cfg.static_files.index_file, "index.html");
    assert_eq!(cfg.pool.worker_count, 2);
    assert_eq!(cfg.pool.overflow, OverflowPolicy::Drop);
    assert_eq!(cfg.idle_timeout().as_millis(), 250);
    assert_eq!(cfg.connection.max_requests_per_connection, 3);
    assert_eq!(cfg.connection.keep_alive_load_limit, Some(10));
}

#[test]
fn test_config_empty_yaml_is_default() {
    let cfg = Config::from_yaml("").unwrap();
    assert_eq!(cfg.listen_addr(), "127.0.0.1:8080");
}

#[test]
fn test_config_unknown_overflow_policy_is_error() {
    assert!(Config::from_yaml("pool:\n  overflow: explode\n").is_err());
}

#[test]
fn test_config_validation() {
    let mut cfg = Config::default();
    cfg.pool.worker_count = 0;
    assert!(cfg.validate().is_err());

    let mut cfg = Config::default();
    cfg.pool.max_connections = 0;
    assert!(cfg.validate().is_err());

    let mut cfg = Config::default();
    cfg.connection.max_requests_per_connection = 0;
    assert!(cfg.validate().is_err());

    let mut cfg = Config::default();
    cfg.connection.idle_timeout_ms = 0;
    assert!(cfg.validate().is_err());
}

#[test]
fn test_config_clone() {
    let cfg1 = Config::default();
    let cfg2 = cfg1.clone();
    assert_eq!(cfg1.listen_addr(), cfg2.listen_addr());
}
