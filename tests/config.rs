mod common;

use common::capture_logs;
use serial_test::serial;
use tempfile::tempdir;
use update_lock::settings::{resolve_config_path, AppConfig, CONFIG_FILE_NAME, CONFIG_PATH_ENV};

#[test]
#[serial]
fn environment_overrides_config_location() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("custom.json");
    std::env::set_var(CONFIG_PATH_ENV, &path);
    let resolved = resolve_config_path().unwrap();
    std::env::remove_var(CONFIG_PATH_ENV);
    assert_eq!(resolved, path);
}

#[test]
#[serial]
fn default_location_is_next_to_the_executable() {
    std::env::remove_var(CONFIG_PATH_ENV);
    let resolved = resolve_config_path().unwrap();
    let exe = std::env::current_exe().unwrap();
    assert_eq!(resolved, exe.parent().unwrap().join(CONFIG_FILE_NAME));
}

#[test]
fn saved_config_loads_back() {
    let dir = tempdir().unwrap();
    let path = dir.path().join(CONFIG_FILE_NAME);
    let mut config = AppConfig::default();
    config.services = vec!["wuauserv".into(), "UsoSvc".into()];
    config.post_unlock_hooks = vec!["defender".into()];
    config.supervision.enabled = false;
    config.save(&path).unwrap();

    let (loaded, fixes) = AppConfig::load(&path).unwrap();
    assert!(fixes.is_empty());
    assert_eq!(loaded.services, config.services);
    assert_eq!(loaded.post_unlock_hooks, vec!["defender".to_string()]);
    assert!(!loaded.supervision.enabled);
    assert_eq!(loaded.check_interval_secs, 15);
}

#[test]
fn replaced_values_are_returned_for_logging_later() {
    let dir = tempdir().unwrap();
    let path = dir.path().join(CONFIG_FILE_NAME);
    std::fs::write(&path, r#"{ "check_interval_secs": 0, "hook_timeout_secs": 18446744073709551615 }"#).unwrap();

    let (result, logs) = capture_logs(|| AppConfig::load(&path));
    let (config, fixes) = result.unwrap();

    assert!(logs.is_empty(), "{logs}");
    assert_eq!(config.check_interval_secs, 15);
    assert_eq!(fixes.len(), 2);
    assert!(fixes.iter().any(|f| f.starts_with("check_interval_secs")), "{fixes:?}");
    assert!(fixes.iter().any(|f| f.starts_with("hook_timeout_secs")), "{fixes:?}");
}
