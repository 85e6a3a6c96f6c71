//! Integration test: configuration loading and error taxonomy.
//!
//! Run with: cargo test -p gpuexec-core --test config_test

use gpuexec_core::config::default_config_path;
use gpuexec_core::{BackendKind, ConfigError, DriverError, GpuexecConfig, StatusCode};

#[test]
fn test_empty_config_uses_defaults() {
    let config = GpuexecConfig::parse("inline", "").expect("empty config parses");
    let flags = config.driver.flags();
    assert!(!flags.inject_init_error);
    assert!(!flags.sync_around_driver_calls);
    assert!(!flags.device_0_only);
    assert_eq!(config.driver.backend, BackendKind::Auto);
    assert_eq!(config.driver.emulated_devices, 2);
}

#[test]
fn test_driver_table_overrides_flags() {
    let text = r#"
[driver]
inject_init_error = true
device_0_only = true
backend = "emulated"
emulated_devices = 4
"#;
    let config = GpuexecConfig::parse("inline", text).expect("config parses");
    let flags = config.driver.flags();
    assert!(flags.inject_init_error);
    assert!(flags.device_0_only);
    assert!(!flags.sync_around_driver_calls);
    assert_eq!(config.driver.backend, BackendKind::Emulated);
    assert_eq!(config.driver.emulated_devices, 4);
}

#[test]
fn test_unknown_backend_is_parse_error() {
    let text = "[driver]\nbackend = \"opencl\"\n";
    match GpuexecConfig::parse("inline", text) {
        Err(ConfigError::Parse { path, .. }) => assert_eq!(path, "inline"),
        other => panic!("expected parse error, got {:?}", other),
    }
}

#[test]
fn test_missing_file_falls_back_to_defaults() {
    let config = GpuexecConfig::load_or_default("/nonexistent/gpuexec/gpuexec.toml");
    assert_eq!(config.driver.backend, BackendKind::Auto);
    assert!(matches!(
        GpuexecConfig::load("/nonexistent/gpuexec/gpuexec.toml"),
        Err(ConfigError::Io { .. })
    ));
}

#[test]
fn test_default_config_path_names_gpuexec_toml() {
    assert!(default_config_path().ends_with("gpuexec.toml"));
}

#[test]
fn test_backend_from_str() {
    assert_eq!("cuda".parse::<BackendKind>(), Ok(BackendKind::Cuda));
    assert!("vulkan".parse::<BackendKind>().is_err());
}

#[test]
fn test_error_code_round_trips_through_constructor() {
    let codes = [
        StatusCode::ResourceExhausted,
        StatusCode::InvalidArgument,
        StatusCode::NotFound,
        StatusCode::FailedPrecondition,
        StatusCode::Internal,
        StatusCode::Unavailable,
        StatusCode::Aborted,
    ];
    for code in codes {
        let err = DriverError::with_code(code, "boom");
        assert_eq!(err.code(), code);
        assert_eq!(err.message(), "boom");
    }
    assert_eq!(
        DriverError::NotFound("not a device pointer".into()).to_string(),
        "not found: not a device pointer"
    );
}
