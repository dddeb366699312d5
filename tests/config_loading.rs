//! Configuration files and the environment overlay.

use labctl::config::{DriverConfig, ServerConfig};
use serial_test::serial;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

const MINIMAL: &str = r#"
[server]
port = 9999
log_level = "info"

[[channels]]
id = "rs232"
transport = { kind = "mock" }

[[devices]]
name = "mfc-n2-1"
channel = "rs232"
driver = "sierra"
fs_range = 50.0
"#;

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
#[serial]
fn test_environment_overrides_file() {
    let file = write_config(MINIMAL);
    std::env::set_var("LABCTL_SERVER__PORT", "10000");
    std::env::set_var("LABCTL_SERVER__LOG_LEVEL", "debug");

    let result = ServerConfig::load_from(file.path());

    std::env::remove_var("LABCTL_SERVER__PORT");
    std::env::remove_var("LABCTL_SERVER__LOG_LEVEL");

    let config = result.unwrap();
    assert_eq!(config.server.port, 10000);
    assert_eq!(config.server.log_level, "debug");
    assert_eq!(config.devices.len(), 1);
    config.validate().unwrap();
}

#[test]
#[serial]
fn test_file_values_without_environment() {
    let file = write_config(MINIMAL);
    let config = ServerConfig::load_from(file.path()).unwrap();
    assert_eq!(config.server.port, 9999);
    assert_eq!(config.channels[0].id, "rs232");
}

#[test]
#[serial]
fn test_invalid_environment_level_is_rejected() {
    let file = write_config(MINIMAL);
    std::env::set_var("LABCTL_SERVER__LOG_LEVEL", "chatty");
    let result = ServerConfig::load_from(file.path());
    std::env::remove_var("LABCTL_SERVER__LOG_LEVEL");

    let err = result.unwrap().validate().unwrap_err();
    assert!(err.to_string().contains("Invalid log_level 'chatty'"));
}

#[test]
#[serial]
fn test_shipped_configuration_is_valid() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/labctl.toml");
    let config = ServerConfig::load_from(&path).unwrap();
    config.validate().unwrap();

    assert_eq!(config.channels.len(), 3);
    let names: Vec<&str> = config.devices.iter().map(|d| d.name.as_str()).collect();
    assert_eq!(names[0], "tvc");
    assert!(names.contains(&"mfc-n2-1"));

    let count = |pred: fn(&DriverConfig) -> bool| {
        config.devices.iter().filter(|d| pred(&d.driver)).count()
    };
    assert_eq!(count(|d| matches!(d, DriverConfig::Switch { .. })), 10);
    assert_eq!(count(|d| matches!(d, DriverConfig::Brooks { .. })), 2);
    assert_eq!(count(|d| matches!(d, DriverConfig::AnalogMfc { .. })), 2);
    assert_eq!(count(|d| matches!(d, DriverConfig::T3bi { .. })), 1);
}

#[test]
fn test_broken_file_reports_config_error() {
    let file = write_config("[[devices]]\nname = 3\n");
    let err = ServerConfig::load_from(file.path()).unwrap_err();
    assert!(err.to_string().starts_with("Configuration error"));
}
