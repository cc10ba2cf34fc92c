use std::env;
use std::fs;
use std::time::Duration;

use serial_test::serial;
use tempfile::TempDir;

use super::settings::Settings;
use super::{load_config, parse_duration};

const CLEARED: [&str; 8] = [
    "HTTP_PORT",
    "BROKER_URL",
    "LOG_LEVEL",
    "INSTANCE_ID",
    "THINGS_AUTH_GRPC_URL",
    "AUTH_GRPC_URL",
    "THINGS_AUTH_GRPC_TIMEOUT",
    "CLIENT_TLS",
];

fn with_env<F: FnOnce()>(vars: &[(&str, &str)], f: F) {
    let mut all: Vec<(&str, Option<&str>)> = CLEARED
        .iter()
        .filter(|k| !vars.iter().any(|(set, _)| set == *k))
        .map(|k| (*k, None))
        .collect();
    all.extend(vars.iter().map(|(k, v)| (*k, Some(*v))));
    temp_env::with_vars(all, f);
}

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.http.port, 8008);
    assert_eq!(settings.http.max_body_bytes, 1024 * 1024);
    assert_eq!(settings.ws.port, 8186);
    assert_eq!(settings.coap.port, 5683);
    assert_eq!(settings.coap.keepalive_secs, 30);
    assert_eq!(settings.coap.ack_timeout_ms, 2000);
    assert_eq!(settings.mqtt.port, 1883);
    assert_eq!(settings.broker.url, "memory://");
    assert_eq!(settings.auth.timeout_ms, 1000);
    assert_eq!(settings.session.egress_queue_depth, 64);
    assert_eq!(settings.shutdown.drain_secs, 30);
}

#[test]
#[serial]
fn test_load_config_generates_instance_id() {
    with_env(&[], || {
        let cfg = load_config().unwrap();
        assert!(uuid::Uuid::parse_str(&cfg.instance_id).is_ok());
        assert_eq!(cfg.log_level, "info");
    });
}

#[test]
#[serial]
fn test_flat_env_overrides() {
    with_env(
        &[
            ("HTTP_PORT", "9100"),
            ("INSTANCE_ID", "edge-1"),
            ("LOG_LEVEL", "debug"),
            ("AUTH_GRPC_URL", "http://fallback:1"),
            ("THINGS_AUTH_GRPC_URL", "http://things:7000"),
            ("THINGS_AUTH_GRPC_TIMEOUT", "250ms"),
            ("CLIENT_TLS", "true"),
        ],
        || {
            let cfg = load_config().unwrap();
            assert_eq!(cfg.http.port, 9100);
            assert_eq!(cfg.instance_id, "edge-1");
            assert_eq!(cfg.log_level, "debug");
            assert_eq!(cfg.auth.url, "http://things:7000");
            assert_eq!(cfg.auth.timeout_ms, 250);
            assert!(cfg.auth.client_tls);
        },
    );
}

#[test]
#[serial]
fn test_auth_url_alias() {
    with_env(&[("AUTH_GRPC_URL", "http://fallback:1")], || {
        assert_eq!(load_config().unwrap().auth.url, "http://fallback:1");
    });
}

#[test]
#[serial]
fn test_invalid_values_are_startup_errors() {
    with_env(&[("LOG_LEVEL", "chatty")], || {
        assert!(load_config().is_err());
    });
    with_env(&[("BROKER_URL", "nats://localhost:4222")], || {
        assert!(load_config().is_err());
    });
    with_env(&[("THINGS_AUTH_GRPC_TIMEOUT", "soon")], || {
        assert!(load_config().is_err());
    });
}

#[test]
#[serial]
fn test_load_config_from_file_overrides_defaults() {
    let tmp = TempDir::new().expect("create tempdir");
    let orig = env::current_dir().expect("current_dir");
    env::set_current_dir(tmp.path()).expect("set current dir");

    fs::create_dir_all("config").expect("create config dir");
    let toml = r#"
        [ws]
        port = 9001

        [broker]
        spill_capacity = 32

        [events]
        max_len = 10
    "#;
    fs::write("config/default.toml", toml).expect("write config file");

    with_env(&[("HTTP_PORT", "9002")], || {
        let cfg = load_config().expect("load_config failed");
        assert_eq!(cfg.ws.port, 9001);
        assert_eq!(cfg.ws.host, "0.0.0.0");
        assert_eq!(cfg.broker.spill_capacity, 32);
        assert_eq!(cfg.events.max_len, 10);
        assert_eq!(cfg.http.port, 9002);
    });

    env::set_current_dir(orig).expect("restore cwd");
}

#[test]
fn test_parse_duration() {
    assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
    assert_eq!(parse_duration("1s").unwrap(), Duration::from_secs(1));
    assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
    assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
    assert!(parse_duration("1d").is_err());
    assert!(parse_duration("ms").is_err());
    assert!(parse_duration(&format!("{}h", u64::MAX / 1000)).is_err());
    assert!(parse_duration(&format!("{}m", u64::MAX)).is_err());
    assert_eq!(
        parse_duration(&format!("{}s", u64::MAX)).unwrap(),
        Duration::from_secs(u64::MAX)
    );
}
