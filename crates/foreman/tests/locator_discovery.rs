#![cfg(unix)]

mod support;

use std::{
    env,
    path::{Path, PathBuf},
    sync::{Mutex, OnceLock, PoisonError},
};

use foreman::{
    events::EventBus,
    locator::{BinaryLocator, DiscoveryMethod},
    ErrorCode, ServerConfig,
};

use support::write_executable;

/// Serializes tests that rewrite PATH; the variable is process-global.
fn path_guard() -> std::sync::MutexGuard<'static, ()> {
    static GUARD: OnceLock<Mutex<()>> = OnceLock::new();
    GUARD
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

struct PathOverride {
    previous: Option<std::ffi::OsString>,
}

impl PathOverride {
    fn set(dirs: &[&Path]) -> Self {
        let previous = env::var_os("PATH");
        let joined = env::join_paths(dirs.iter().map(|dir| dir.to_path_buf()))
            .expect("test paths are joinable");
        env::set_var("PATH", joined);
        Self { previous }
    }
}

impl Drop for PathOverride {
    fn drop(&mut self) {
        match &self.previous {
            Some(previous) => env::set_var("PATH", previous),
            None => env::remove_var("PATH"),
        }
    }
}

fn write_versioned_agent(dir: &Path, name: &str, version: &str) -> PathBuf {
    write_executable(
        dir,
        name,
        &format!("#!/bin/sh\necho \"{name} {version}\"\nexit 0\n"),
    )
}

fn config(name: &str, min_version: Option<&str>) -> ServerConfig {
    ServerConfig {
        agent_binary_name: name.to_string(),
        min_binary_version: min_version.map(|raw| raw.parse().unwrap()),
        binary_override: None,
        ..ServerConfig::default()
    }
}

#[tokio::test]
async fn path_lookup_finds_and_validates_a_binary() {
    let _guard = path_guard();
    let dir = tempfile::tempdir().unwrap();
    let bin_dir = dir.path().join("bin");
    std::fs::create_dir_all(&bin_dir).unwrap();
    let expected = write_versioned_agent(&bin_dir, "fm-agent", "3.4.5");
    let _path = PathOverride::set(&[&bin_dir]);

    let locator = BinaryLocator::new(
        &config("fm-agent", Some(">=3")),
        dir.path().join("binaries.db"),
        EventBus::new(),
    );
    let record = locator.resolve(false).await.unwrap();
    assert_eq!(record.path, expected);
    assert_eq!(record.method, DiscoveryMethod::PathLookup);
    assert_eq!(record.version.as_ref().unwrap().to_string(), "3.4.5");
    assert!(record.valid);
}

#[tokio::test]
async fn version_constraint_skips_stale_candidates() {
    let _guard = path_guard();
    let dir = tempfile::tempdir().unwrap();
    let old_dir = dir.path().join("old");
    let new_dir = dir.path().join("new");
    std::fs::create_dir_all(&old_dir).unwrap();
    std::fs::create_dir_all(&new_dir).unwrap();
    write_versioned_agent(&old_dir, "fm-agent", "0.9.0");
    let wanted = write_versioned_agent(&new_dir, "fm-agent", "2.0.0");
    // The stale binary shadows the good one on PATH.
    let _path = PathOverride::set(&[&old_dir, &new_dir]);

    let locator = BinaryLocator::new(
        &config("fm-agent", Some(">=1.5")),
        dir.path().join("binaries.db"),
        EventBus::new(),
    );
    let record = locator.resolve(false).await.unwrap();
    assert_eq!(record.path, wanted);
}

#[tokio::test]
async fn exhausted_chain_is_not_found() {
    let _guard = path_guard();
    let dir = tempfile::tempdir().unwrap();
    let empty = dir.path().join("empty");
    std::fs::create_dir_all(&empty).unwrap();
    let _path = PathOverride::set(&[&empty]);

    let locator = BinaryLocator::new(
        &config("fm-agent-that-does-not-exist", None),
        dir.path().join("binaries.db"),
        EventBus::new(),
    );
    let err = locator.resolve(false).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);
}

#[tokio::test]
async fn override_wins_over_path_lookup() {
    let _guard = path_guard();
    let dir = tempfile::tempdir().unwrap();
    let bin_dir = dir.path().join("bin");
    std::fs::create_dir_all(&bin_dir).unwrap();
    write_versioned_agent(&bin_dir, "fm-agent", "1.0.0");
    let pinned = write_versioned_agent(dir.path(), "pinned-agent", "9.9.9");
    let _path = PathOverride::set(&[&bin_dir]);

    let mut config = config("fm-agent", None);
    config.binary_override = Some(pinned.clone());
    let locator = BinaryLocator::new(
        &config,
        dir.path().join("binaries.db"),
        EventBus::new(),
    );
    let record = locator.resolve(false).await.unwrap();
    assert_eq!(record.path, pinned);
    assert_eq!(record.method, DiscoveryMethod::Override);
}

#[tokio::test]
async fn cache_is_reused_across_locator_instances() {
    let _guard = path_guard();
    let dir = tempfile::tempdir().unwrap();
    let bin_dir = dir.path().join("bin");
    std::fs::create_dir_all(&bin_dir).unwrap();
    write_versioned_agent(&bin_dir, "fm-agent", "1.2.3");
    let _path = PathOverride::set(&[&bin_dir]);
    let cache = dir.path().join("binaries.db");

    let first = BinaryLocator::new(&config("fm-agent", None), cache.clone(), EventBus::new());
    let record = first.resolve(false).await.unwrap();
    assert_eq!(record.version_raw, "fm-agent 1.2.3");

    // Change what the probe would report; a fresh cached record short
    // circuits discovery, so the old version string survives.
    write_versioned_agent(&bin_dir, "fm-agent", "9.0.0");
    let second = BinaryLocator::new(&config("fm-agent", None), cache, EventBus::new());
    let cached = second.resolve(false).await.unwrap();
    assert_eq!(cached.version_raw, "fm-agent 1.2.3");

    // force = true bypasses the cache and re-probes.
    let reprobed = second.resolve(true).await.unwrap();
    assert_eq!(reprobed.version_raw, "fm-agent 9.0.0");
}

#[tokio::test]
async fn invalidate_forces_rediscovery() {
    let _guard = path_guard();
    let dir = tempfile::tempdir().unwrap();
    let bin_dir = dir.path().join("bin");
    std::fs::create_dir_all(&bin_dir).unwrap();
    write_versioned_agent(&bin_dir, "fm-agent", "1.0.0");
    let _path = PathOverride::set(&[&bin_dir]);

    let locator = BinaryLocator::new(
        &config("fm-agent", None),
        dir.path().join("binaries.db"),
        EventBus::new(),
    );
    locator.resolve(false).await.unwrap();

    write_versioned_agent(&bin_dir, "fm-agent", "2.0.0");
    locator.invalidate().await;
    let record = locator.resolve(false).await.unwrap();
    assert_eq!(record.version_raw, "fm-agent 2.0.0");
}
