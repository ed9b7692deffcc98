#![cfg(unix)]

mod support;

use std::{path::Path, process::Command};

use foreman::{events::EventBus, registry::{ProcessRegistry, ProcessState}};

fn open_registry(path: &Path) -> ProcessRegistry {
    ProcessRegistry::open(path, 8, EventBus::new()).unwrap()
}

#[test]
fn crash_restart_orphans_dead_children_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("processes.db");

    // A child that outlives the "crash" and one that dies before restart.
    let mut survivor = Command::new("sleep").arg("30").spawn().unwrap();
    let mut casualty = Command::new("sleep").arg("30").spawn().unwrap();

    {
        let registry = open_registry(&db);
        registry
            .register("survivor", survivor.id(), Path::new("/bin/sleep"), "s".into())
            .unwrap();
        registry
            .register("casualty", casualty.id(), Path::new("/bin/sleep"), "c".into())
            .unwrap();
        // Simulated crash: the registry is dropped without unregistering.
    }

    casualty.kill().unwrap();
    casualty.wait().unwrap();

    // Restart: reopen from disk and reconcile.
    let registry = open_registry(&db);
    let orphaned = registry.reconcile().unwrap();
    assert_eq!(orphaned.len(), 1);
    assert_eq!(orphaned[0].session_id, "casualty");
    assert_eq!(orphaned[0].state, ProcessState::Orphaned);

    let running = registry.list(Some(ProcessState::Running));
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].session_id, "survivor");

    // Reconcile is idempotent: an orphaned record is never reported twice
    // and never resurrected.
    assert!(registry.reconcile().unwrap().is_empty());
    assert_eq!(registry.list(Some(ProcessState::Orphaned)).len(), 1);

    survivor.kill().unwrap();
    survivor.wait().unwrap();
}

#[test]
fn pid_reuse_is_defeated_by_start_time_signature() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("processes.db");

    let mut child = Command::new("sleep").arg("30").spawn().unwrap();
    let pid = child.id();

    {
        let registry = open_registry(&db);
        registry
            .register("reused", pid, Path::new("/bin/sleep"), "r".into())
            .unwrap();
    }

    child.kill().unwrap();
    child.wait().unwrap();

    // Forge the record's start-time signature to mimic a pid that was
    // recycled by a different process.
    let raw = std::fs::read_to_string(&db).unwrap();
    let mut records: serde_json::Value = serde_json::from_str(&raw).unwrap();
    records[0]["start_time_ticks"] = serde_json::json!(1u64);
    // Give the pid of this very test process so a process with that pid
    // exists, but with a mismatched signature.
    records[0]["pid"] = serde_json::json!(std::process::id());
    std::fs::write(&db, serde_json::to_vec(&records).unwrap()).unwrap();

    let registry = open_registry(&db);
    let orphaned = registry.reconcile().unwrap();
    assert_eq!(orphaned.len(), 1, "signature mismatch must orphan the record");
}

#[test]
fn orphan_events_are_published() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("processes.db");
    let events = EventBus::new();
    let mut rx = events.subscribe();

    let registry = ProcessRegistry::open(&db, 8, events).unwrap();
    registry
        .register("ghost", u32::MAX - 13, Path::new("/bin/true"), "g".into())
        .unwrap();
    let orphaned = registry.reconcile().unwrap();
    assert_eq!(orphaned.len(), 1);

    match rx.try_recv().unwrap() {
        foreman::ServerEvent::SessionOrphaned { session, .. } => {
            assert_eq!(session, "ghost");
        }
        other => panic!("unexpected event {other:?}"),
    }
}
