//! Integration tests for simbatch-config

use simbatch_config::*;
use std::io::Write;
use std::time::Duration;
use temp_env::with_vars;

#[test]
fn test_default_config_validation() {
    let config = SimbatchConfig::default();
    assert!(config.validate_all().is_ok());
}

#[test]
fn test_config_loader_from_env() {
    let vars = vec![
        ("SIMBATCH_COORDINATOR_PORT", Some("12000")),
        ("SIMBATCH_COORDINATOR_NB_CLIENT", Some("3")),
        ("SIMBATCH_COORDINATOR_BATCH_SIZE", Some("7")),
        ("SIMBATCH_COORDINATOR_RECEIVE_TIMEOUT", Some("0")),
        ("SIMBATCH_COORDINATOR_CONCURRENCY", Some("threads")),
        ("SIMBATCH_WORKER_INSTANCE_ID", Some("4")),
        ("SIMBATCH_LOG_LEVEL", Some("debug")),
        ("SIMBATCH_MAX_FRAME_BYTES", Some("4096")),
    ];

    with_vars(vars, || {
        let loader = ConfigLoader::new();
        let config = loader.from_env().unwrap();

        assert_eq!(config.coordinator.port, 12000);
        assert_eq!(config.coordinator.nb_client, 3);
        assert_eq!(config.coordinator.batch_size, 7);
        assert_eq!(config.coordinator.receive_timeout, None);
        assert_eq!(config.coordinator.concurrency, ConcurrencyModel::Threads);
        assert_eq!(config.worker.instance_id, Some(4));
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(config.protocol.max_frame_bytes, 4096);
    });
}

#[test]
fn test_invalid_env_value_is_reported() {
    with_vars(vec![("SIMBATCH_COORDINATOR_BATCH_SIZE", Some("many"))], || {
        let err = ConfigLoader::new().from_env().unwrap_err();
        assert!(matches!(err, ConfigError::EnvError(_)));
        assert!(err.to_string().contains("COORDINATOR_BATCH_SIZE"));
    });
}

#[test]
fn test_env_override_still_validated() {
    with_vars(vec![("SIMBATCH_COORDINATOR_NB_CLIENT", Some("0"))], || {
        let err = ConfigLoader::new().from_env().unwrap_err();
        assert!(matches!(err, ConfigError::DomainError { .. }));
    });
}

#[test]
fn test_custom_prefix() {
    with_vars(vec![("SIMTEST_WORKER_PORT", Some("15000"))], || {
        let config = ConfigLoader::with_prefix("SIMTEST").from_env().unwrap();
        assert_eq!(config.worker.port, 15000);
    });
}

#[test]
fn test_yaml_config_serialization() {
    let yaml = SimbatchConfig::generate_sample().unwrap();
    let parsed: SimbatchConfig = serde_yaml::from_str(&yaml).unwrap();
    assert!(parsed.validate_all().is_ok());
    assert_eq!(parsed.coordinator.batch_size, 10);
}

#[test]
fn test_comprehensive_config_file() {
    let yaml = r#"
coordinator:
  bind_address: "0.0.0.0"
  port: 0
  nb_client: 2
  batch_size: 5
  simulations_per_step: 3
  allow_prediction_requests: true
  store_location: "/tmp/samples"
  receive_timeout: 30
  round_failure_policy: skip
  environment_parameters:
    gravity: -9.81
    mesh:
      path: "beam.obj"

worker:
  coordinator_address: "10.0.0.2"
  instance_id: 2

logging:
  level: warn
  format: json
"#;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(yaml.as_bytes()).unwrap();

    with_vars(vec![("SIMBATCH_LOG_FORMAT", Some("compact"))], || {
        let config = ConfigLoader::new().load(Some(file.path())).unwrap();

        assert_eq!(config.coordinator.listen_address(), "0.0.0.0:0");
        assert_eq!(config.coordinator.simulations_per_step, 3);
        assert!(config.coordinator.allow_prediction_requests);
        assert_eq!(config.coordinator.receive_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.coordinator.round_failure_policy, RoundFailurePolicy::Skip);
        assert_eq!(
            config.coordinator.environment_parameters["mesh"]["path"],
            serde_json::json!("beam.obj")
        );
        assert_eq!(config.worker.coordinator_endpoint(), "10.0.0.2:10000");
        assert_eq!(config.logging.level, LogLevel::Warn);
        // Environment wins over the file
        assert_eq!(config.logging.format, LogFormat::Compact);
    });
}

#[test]
fn test_missing_file() {
    let err = ConfigLoader::new()
        .load(Some("/nonexistent/simbatch.yaml"))
        .unwrap_err();
    assert!(matches!(err, ConfigError::FileReadError(_)));
}
