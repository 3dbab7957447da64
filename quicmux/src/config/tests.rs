//! Tests for the configuration module.
//!
//! Tests cover:
//! - Default values
//! - Section validation and error aggregation
//! - File, environment and CLI precedence

mod global_config_tests {
    use crate::config::global::{
        GlobalConfig, LogLevel, LoggingConfig, NetworkConfig, RuntimeConfig, TlsConfig,
    };

    #[test]
    fn test_network_config_default() {
        let config = NetworkConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 4433);
        assert_eq!(config.socket_addr().unwrap().port(), 4433);
    }

    #[test]
    fn test_network_config_valid_ipv6() {
        let config = NetworkConfig {
            host: "::".to_string(),
            port: 443,
        };
        assert!(config.validate().is_ok());
        assert!(config.socket_addr().unwrap().is_ipv6());
    }

    #[test]
    fn test_network_config_invalid_host() {
        let config = NetworkConfig {
            host: "not-an-ip-address".to_string(),
            port: 443,
        };
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("Invalid host address")));
        assert!(config.socket_addr().is_err());
    }

    #[test]
    fn test_runtime_config_zero_workers() {
        let config = RuntimeConfig {
            worker_threads: 0,
            ..RuntimeConfig::default()
        };
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("worker_threads must be > 0")));
    }

    #[test]
    fn test_runtime_config_stack_bounds() {
        let small = RuntimeConfig {
            thread_stack_size: 64 * 1024,
            ..RuntimeConfig::default()
        };
        assert!(small.validate().unwrap_err()[0].contains("too small"));

        let large = RuntimeConfig {
            thread_stack_size: 128 * 1024 * 1024,
            ..RuntimeConfig::default()
        };
        assert!(large.validate().unwrap_err()[0].contains("too large"));
    }

    #[test]
    fn test_log_level_parsing() {
        assert_eq!("trace".parse::<LogLevel>().unwrap(), LogLevel::Trace);
        assert_eq!("warning".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!("DEBUG".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert!("loud".parse::<LogLevel>().is_err());
        assert_eq!(LogLevel::Error.to_string(), "error");
    }

    #[test]
    fn test_logging_config_default() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, LogLevel::Info);
        assert!(!config.json_format);
        assert!(config.enable_colors);
    }

    #[test]
    fn test_tls_key_is_optional() {
        assert!(TlsConfig::default().validate().is_ok());
    }

    #[test]
    fn test_tls_missing_key_file() {
        let config = TlsConfig {
            key_path: Some("/nonexistent/quicmux/key.pem".into()),
        };
        let errors = config.validate().unwrap_err();
        assert!(errors[0].contains("Private key file not found"));
    }

    #[test]
    fn test_global_config_default_is_valid() {
        assert!(GlobalConfig::default().validate().is_ok());
    }

    #[test]
    fn test_scheduler_idle_timer_bounds() {
        use crate::scheduler::{SchedulerConfig, TaskRunner, MAX_IDLE_TIMER_SECS};

        let at_cap = SchedulerConfig {
            idle_timer_secs: MAX_IDLE_TIMER_SECS,
            ..SchedulerConfig::default()
        };
        assert!(at_cap.validate().is_ok());

        let huge = SchedulerConfig {
            idle_timer_secs: u64::MAX,
            ..SchedulerConfig::default()
        };
        let errors = huge.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("idle_timer_secs must be <=")));

        // A runner built from it anyway parks the timer at the cap.
        let mut runner = TaskRunner::new(&huge, crate::clock::Timestamp::ZERO);
        runner.finish_tasks(crate::clock::Timestamp::ZERO);
        assert_eq!(
            runner.timer().deadline.as_micros(),
            (MAX_IDLE_TIMER_SECS * 1_000_000) as i64
        );
    }

    #[test]
    fn test_global_config_collects_every_section() {
        let mut config = GlobalConfig::default();
        config.network.host = "nope".to_string();
        config.runtime.worker_threads = 0;
        config.netio.shards = 0;
        config.scheduler.idle_timer_secs = 0;
        config.channels.proof_capacity = 0;

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 5, "{:?}", errors);
    }
}

mod loader_tests {
    use crate::config::loader::{resolve_config, CliArgs};
    use crate::config::{LogLevel, ServerConfig};
    use config::Environment;
    use std::io::Write;

    fn env(vars: &[(&str, &str)]) -> Environment {
        let mut map = config::Map::new();
        for (k, v) in vars {
            map.insert(k.to_string(), v.to_string());
        }
        Environment::with_prefix("QUICMUX")
            .prefix_separator("_")
            .separator("__")
            .source(Some(map))
    }

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn cli_for(file: &tempfile::NamedTempFile) -> CliArgs {
        CliArgs {
            config: file.path().display().to_string(),
            ..CliArgs::default()
        }
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let cli = CliArgs {
            config: "/nonexistent/quicmux.toml".to_string(),
            ..CliArgs::default()
        };
        let config = resolve_config(&cli, env(&[])).unwrap();
        assert_eq!(config.global.network.port, 4433);
        assert_eq!(config.loopback.idle_timeout_ms, 30_000);
    }

    #[test]
    fn test_file_values_are_loaded() {
        let file = write_config(
            r#"
            [global.network]
            host = "127.0.0.1"
            port = 9443

            [global.netio]
            shards = 2

            [global.scheduler]
            max_premature_rearms = 5

            [loopback]
            idle_timeout_ms = 500
            "#,
        );
        let config = resolve_config(&cli_for(&file), env(&[])).unwrap();
        assert_eq!(config.global.network.host, "127.0.0.1");
        assert_eq!(config.global.network.port, 9443);
        assert_eq!(config.global.netio.shards, 2);
        assert_eq!(config.global.scheduler.max_premature_rearms, 5);
        assert_eq!(config.global.scheduler.idle_timer_secs, 3600);
        assert_eq!(config.loopback.idle_timeout_ms, 500);
    }

    #[test]
    fn test_env_overrides_file_and_cli_overrides_env() {
        let file = write_config(
            r#"
            [global.network]
            port = 9443

            [global.logging]
            level = "warn"
            "#,
        );
        let vars = env(&[
            ("QUICMUX_GLOBAL__NETWORK__PORT", "7000"),
            ("QUICMUX_GLOBAL__LOGGING__LEVEL", "debug"),
            ("QUICMUX_LOOPBACK__IDLE_TIMEOUT_MS", "250"),
        ]);
        let cli = CliArgs {
            port: Some(8000),
            shards: Some(1),
            ..cli_for(&file)
        };

        let config = resolve_config(&cli, vars).unwrap();
        assert_eq!(config.global.network.port, 8000);
        assert_eq!(config.global.logging.level, LogLevel::Debug);
        assert_eq!(config.global.netio.shards, 1);
        assert_eq!(config.loopback.idle_timeout_ms, 250);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let file = write_config("[global.network\nport = ");
        let err = resolve_config(&cli_for(&file), env(&[])).unwrap_err();
        assert!(err.to_string().contains("Failed to parse TOML config"));
    }

    #[test]
    fn test_validation_failure_lists_problems() {
        let file = write_config(
            r#"
            [loopback]
            idle_timeout_ms = 0
            "#,
        );
        let err = resolve_config(&cli_for(&file), env(&[])).unwrap_err();
        assert!(err.to_string().contains("idle_timeout_ms"));
    }

    #[test]
    fn test_oversized_idle_timer_rejected_from_file() {
        let file = write_config(
            r#"
            [global.scheduler]
            idle_timer_secs = 10000000
            "#,
        );
        let err = resolve_config(&cli_for(&file), env(&[])).unwrap_err();
        assert!(err.to_string().contains("idle_timer_secs"));
    }

    #[test]
    fn test_default_config_serializes() {
        let text = toml::to_string_pretty(&ServerConfig::default()).unwrap();
        let parsed: ServerConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.global.network.port, 4433);
        assert_eq!(parsed.global.channels.proof_capacity, 256);
    }

    #[test]
    fn test_shard_set_carries_subsystems() {
        let mut config = ServerConfig::default();
        config.global.netio.shards = 3;
        config.global.scheduler.coalesce_window_us = 10;
        let set = config.shard_set();
        assert_eq!(set.netio.shards, 3);
        assert_eq!(set.scheduler.coalesce_window_us, 10);
    }
}
