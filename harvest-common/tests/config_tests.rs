//! Tests for bootstrap configuration and root folder resolution
//!
//! Uses serial_test to prevent environment variable races: tests that touch
//! HARVEST_ROOT_FOLDER or HARVEST_CONFIG are marked #[serial].

use harvest_common::config::{
    default_config_path, get_default_root_folder, load_toml_file, RootFolderResolver, TomlConfig,
    CONFIG_PATH_ENV, ROOT_FOLDER_ENV,
};
use serial_test::serial;
use std::env;
use std::path::PathBuf;
use tempfile::TempDir;

#[test]
#[serial]
fn test_resolver_with_no_overrides_uses_default() {
    env::remove_var(ROOT_FOLDER_ENV);

    let root_folder = RootFolderResolver::new("test-module").resolve();
    assert_eq!(root_folder, get_default_root_folder());
}

#[test]
#[serial]
fn test_resolver_env_beats_toml() {
    env::set_var(ROOT_FOLDER_ENV, "/tmp/harvest-test-env-folder");

    let toml = TomlConfig {
        root_folder: Some(PathBuf::from("/tmp/harvest-test-toml-folder")),
        ..TomlConfig::default()
    };
    let root_folder = RootFolderResolver::new("test-module").with_toml(&toml).resolve();
    assert_eq!(root_folder, PathBuf::from("/tmp/harvest-test-env-folder"));

    env::remove_var(ROOT_FOLDER_ENV);
}

#[test]
#[serial]
fn test_resolver_cli_beats_env() {
    env::set_var(ROOT_FOLDER_ENV, "/tmp/harvest-test-env-folder");

    let root_folder = RootFolderResolver::new("test-module")
        .with_cli_arg(Some(PathBuf::from("/tmp/harvest-test-cli-folder")))
        .resolve();
    assert_eq!(root_folder, PathBuf::from("/tmp/harvest-test-cli-folder"));

    env::remove_var(ROOT_FOLDER_ENV);
}

#[test]
#[serial]
fn test_resolver_uses_toml_when_env_unset() {
    env::remove_var(ROOT_FOLDER_ENV);

    let toml = TomlConfig {
        root_folder: Some(PathBuf::from("/tmp/harvest-test-toml-folder")),
        ..TomlConfig::default()
    };
    let root_folder = RootFolderResolver::new("test-module").with_toml(&toml).resolve();
    assert_eq!(root_folder, PathBuf::from("/tmp/harvest-test-toml-folder"));
}

#[test]
#[serial]
fn test_config_path_env_override() {
    env::set_var(CONFIG_PATH_ENV, "/tmp/harvest-test.toml");
    assert_eq!(default_config_path(), PathBuf::from("/tmp/harvest-test.toml"));
    env::remove_var(CONFIG_PATH_ENV);

    assert!(default_config_path().ends_with("config.toml") || default_config_path().ends_with("harvest.toml"));
}

#[test]
fn test_missing_config_file_uses_defaults() {
    let temp_dir = TempDir::new().unwrap();
    let config: TomlConfig = load_toml_file(&temp_dir.path().join("absent.toml")).unwrap();

    assert!(config.root_folder.is_none());
    assert_eq!(config.logging.level, "info");
}

#[test]
fn test_malformed_config_file_is_an_error() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("broken.toml");
    std::fs::write(&path, "root_folder = [unterminated").unwrap();

    let result: harvest_common::Result<TomlConfig> = load_toml_file(&path);
    let err = result.unwrap_err().to_string();
    assert!(err.contains("Configuration error"), "unexpected error: {}", err);
    assert!(err.contains("broken.toml"));
}

#[test]
fn test_config_file_is_parsed() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("harvest.toml");
    std::fs::write(
        &path,
        r#"
        root_folder = "/srv/harvest"

        [logging]
        level = "debug"
        "#,
    )
    .unwrap();

    let config: TomlConfig = load_toml_file(&path).unwrap();
    assert_eq!(config.root_folder, Some(PathBuf::from("/srv/harvest")));
    assert_eq!(config.logging.level, "debug");
}
