//! Tests for configuration validation

use team_kernel::config::{
    KernelConfig, ListenerConfig, ManagedObjectConfig, TeamConfig, TeamStrategy,
};

#[test]
fn test_team_config_validation() {
    assert!(TeamConfig::fixed_pool("cpu", 4).validate().is_ok());
    assert!(TeamConfig::caller_runs("inline").validate().is_ok());
    assert!(TeamConfig::fixed_pool("cpu", 0).validate().is_err());
    assert!(TeamConfig::single_thread("").validate().is_err());
    assert!(TeamConfig::single_thread("io")
        .with_queue_capacity(0)
        .validate()
        .is_err());
    assert!(TeamConfig::single_thread("io")
        .with_thread_stack_size(1024)
        .validate()
        .is_err());
}

#[test]
fn test_kernel_config_parses_all_sections() {
    let config = KernelConfig::from_json_str(
        r#"{
            "teams": [{ "name": "io", "strategy": { "kind": "fixed_pool", "workers": 2 },
                        "queue_capacity": 64 }],
            "managed_objects": { "db": { "max_size": 4 } },
            "listeners": { "web": { "bind": "127.0.0.1:0", "selector_loops": 1 } },
            "shutdown_timeout_ms": 500
        }"#,
    )
    .unwrap();
    assert_eq!(config.teams[0].strategy, TeamStrategy::FixedPool { workers: 2 });
    assert_eq!(config.teams[0].queue_capacity, Some(64));
    assert_eq!(config.managed_objects["db"], ManagedObjectConfig::pooled(Some(4)));
    assert_eq!(config.listeners["web"].selector_loops, 1);
    assert_eq!(config.shutdown_timeout().as_millis(), 500);
}

#[test]
fn test_managed_object_config_validation() {
    assert!(ManagedObjectConfig::default().validate().is_ok());
    assert!(ManagedObjectConfig::eager().validate().is_ok());
    assert!(ManagedObjectConfig::pooled(Some(0)).validate().is_err());
}

#[test]
fn test_listener_config_validation() {
    assert!(ListenerConfig::new("127.0.0.1:0").validate().is_ok());
    assert!(ListenerConfig::new("not an address").validate().is_err());
    assert!(ListenerConfig::new("127.0.0.1:0")
        .with_selector_loops(0)
        .validate()
        .is_err());
    assert!(ListenerConfig::new("127.0.0.1:0")
        .with_backpressure_threshold(0)
        .validate()
        .is_err());
    assert!(ListenerConfig::new("127.0.0.1:0")
        .with_idle_timeout_ms(0)
        .validate()
        .is_err());
}

#[test]
fn test_kernel_config_rejects_duplicate_teams() {
    let err = KernelConfig::from_json_str(
        r#"{ "teams": [
            { "name": "io", "strategy": { "kind": "single_thread" } },
            { "name": "io", "strategy": { "kind": "caller_runs" } }
        ] }"#,
    )
    .unwrap_err();
    assert!(err.contains("duplicate team"));
}

#[test]
fn test_kernel_config_defaults() {
    let config = KernelConfig::from_json_str("{}").unwrap();
    assert!(config.teams.is_empty());
    assert_eq!(config.shutdown_timeout_ms, 30_000);

    let err = KernelConfig::from_json_str(r#"{ "shutdown_timeout_ms": 0 }"#).unwrap_err();
    assert!(err.contains("shutdown_timeout_ms"));
}

#[test]
fn test_listener_config_serde_defaults() {
    let config: ListenerConfig = serde_json::from_str(r#"{ "bind": "0.0.0.0:8080" }"#).unwrap();
    assert_eq!(config.read_buffer_size, 8 * 1024);
    assert_eq!(config.idle_timeout_ms, 60_000);
    assert!(config.selector_loops >= 1);
    assert!(config.tls.is_none());
}
