//! `.env` loading.
//!
//! These tests mutate the process environment, so they live in their own
//! test binary.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use lifespan_server::{Settings, SettingsError, load_dotenv_from};

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("lifespan-{name}-{}", std::process::id()));
    fs::create_dir_all(&dir).unwrap();
    dir
}

#[test]
fn test_dotenv_feeds_settings_without_overriding_environment() {
    let dir = scratch_dir("dotenv");
    let path = dir.join(".env");
    fs::write(
        &path,
        "# local overrides\n\
         REDIS_SOCKET_CONNECT_TIMEOUT=11\n\
         POSTGRES_POOL_PRE_PING=false\n\
         PATH=/nowhere\n",
    )
    .unwrap();
    let path_before = std::env::var_os("PATH");

    let loaded = load_dotenv_from(&path).unwrap();
    assert_eq!(loaded.as_deref(), Some(path.as_path()));

    let settings = Settings::from_env().unwrap();
    assert_eq!(settings.redis_socket_connect_timeout, Duration::from_secs(11));
    assert!(!settings.postgres_pool_pre_ping);
    assert_eq!(
        std::env::var_os("PATH"),
        path_before,
        "variables already set keep their values"
    );

    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_missing_dotenv_is_not_an_error() {
    let dir = scratch_dir("no-dotenv");
    let loaded = load_dotenv_from(&dir.join(".env")).unwrap();
    assert!(loaded.is_none());
    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_malformed_dotenv_is_reported() {
    let dir = scratch_dir("bad-dotenv");
    let path = dir.join(".env");
    fs::write(&path, "NOT A VALID LINE\n").unwrap();

    let err = load_dotenv_from(&path).unwrap_err();
    assert!(matches!(err, SettingsError::DotEnv(_)));
    assert!(err.to_string().contains(".env"));

    fs::remove_dir_all(&dir).unwrap();
}
