use std::{path::PathBuf, time::Duration};

use vmbridge_config::{BridgeConfig, ConfigError, LaunchConfig, ServerConfig};

#[test]
fn empty_file_yields_defaults() {
    let config = BridgeConfig::load_from_str("").unwrap();
    assert_eq!(config, BridgeConfig::default());
    assert_eq!(config.launch.debug_address(), "127.0.0.1:8000");
    assert_eq!(config.launch.attach_attempts, 10);
    assert_eq!(config.launch.attach_backoff(), Duration::from_millis(500));
    assert_eq!(config.rendezvous.wait_slice(), Duration::from_millis(50));
    assert_eq!(config.rendezvous.timeout(), None);
    assert_eq!(config.server.suspend_method, "vmSuspend");
    assert!(config.logging.stderr);
}

#[test]
fn partial_tables_keep_remaining_defaults() {
    let config = BridgeConfig::load_from_str(
        r#"
[launch]
java = "/opt/jdk/bin/java"
classpath = ["lib/runtime.jar"]
debug_port = 8123

[server]
worker_thread = "exec-worker"

[rendezvous]
timeout_ms = 2500

[logging]
level = "vmbridge.gateway=trace"
json = true
"#,
    )
    .unwrap();

    assert_eq!(
        config.launch,
        LaunchConfig {
            java: PathBuf::from("/opt/jdk/bin/java"),
            classpath: vec![PathBuf::from("lib/runtime.jar")],
            debug_port: 8123,
            ..LaunchConfig::default()
        }
    );
    assert_eq!(
        config.server,
        ServerConfig {
            worker_thread: "exec-worker".to_string(),
            ..ServerConfig::default()
        }
    );
    assert_eq!(config.rendezvous.timeout(), Some(Duration::from_millis(2500)));
    assert!(config.logging.json);
    assert_eq!(config.logging.level, "vmbridge.gateway=trace");
}

#[test]
fn unknown_keys_are_rejected() {
    let err = BridgeConfig::load_from_str("[launch]\ndebug_prot = 9000\n").unwrap_err();
    match err {
        ConfigError::Toml(message) => assert!(message.contains("unknown field"), "{message}"),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn loads_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vmbridge.toml");
    std::fs::write(&path, "[jdwp]\nreply_timeout_ms = 250\n").unwrap();

    let config = BridgeConfig::load_from_path(&path).unwrap();
    assert_eq!(config.jdwp.reply_timeout(), Duration::from_millis(250));
    assert_eq!(config.jdwp.handshake_timeout(), Duration::from_secs(5));
}

#[test]
fn missing_file_reports_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.toml");
    let err = BridgeConfig::load_from_path(&path).unwrap_err();
    assert!(matches!(err, ConfigError::Io { .. }));
    assert!(err.to_string().contains("absent.toml"));
}
