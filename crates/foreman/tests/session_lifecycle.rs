#![cfg(unix)]

mod support;

use std::time::Duration;

use serde_json::json;
use stream_events::{MetaRecord, RecordPayload, StreamRecord, TerminalReason};
use foreman::{
    registry::ProcessState,
    session::{CreateSessionRequest, SessionState},
    ErrorCode, ServerError,
};

use support::{build_stack, wait_terminal, write_fake_agent};

fn prompt(text: &str) -> CreateSessionRequest {
    CreateSessionRequest {
        prompt: text.to_string(),
        ..CreateSessionRequest::default()
    }
}

async fn collect(mut rx: tokio::sync::mpsc::Receiver<StreamRecord>) -> Vec<StreamRecord> {
    let mut records = Vec::new();
    while let Some(record) = rx.recv().await {
        records.push(record);
    }
    records
}

fn assert_gap_free(records: &[StreamRecord]) {
    for (idx, record) in records.iter().enumerate() {
        assert_eq!(record.seq, idx as u64 + 1, "sequence must be gap-free");
    }
}

#[tokio::test]
async fn normal_lifecycle_streams_in_order_and_completes() {
    let dir = tempfile::tempdir().unwrap();
    let agent = write_fake_agent(
        dir.path(),
        "printf '{\"i\":1}\\n{\"i\":2}\\n{\"i\":3}\\n'\nexit 0",
    );
    let stack = build_stack(&dir.path().join("state"), agent);

    let (snapshot, rx) = stack
        .supervisor
        .create_session(prompt("hello"))
        .await
        .unwrap();
    assert_eq!(snapshot.state, SessionState::Running);

    let records = collect(rx).await;
    assert_eq!(records.len(), 4);
    assert_gap_free(&records);
    for (record, i) in records[..3].iter().zip(1..) {
        assert_eq!(record.payload, RecordPayload::Stdout(json!({ "i": i })));
    }
    assert_eq!(
        records[3].payload,
        RecordPayload::Meta(MetaRecord::Terminal(TerminalReason::ChildExited(0)))
    );

    let terminal = wait_terminal(&stack.supervisor, &snapshot.id, Duration::from_secs(5)).await;
    assert_eq!(terminal.state, SessionState::Completed);
    assert_eq!(terminal.exit_code, Some(0));
    assert_eq!(terminal.records_dropped, 0);

    // The registry record went terminal with the session.
    let records = stack.registry.list(None);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].state, ProcessState::Exited);
}

#[tokio::test]
async fn malformed_line_is_a_decode_error_record() {
    let dir = tempfile::tempdir().unwrap();
    let agent = write_fake_agent(
        dir.path(),
        "printf '{\"ok\":true}\\nnot json\\n{\"ok\":false}\\n'\nexit 0",
    );
    let stack = build_stack(&dir.path().join("state"), agent);

    let (snapshot, rx) = stack
        .supervisor
        .create_session(prompt("tolerate me"))
        .await
        .unwrap();

    let records = collect(rx).await;
    assert_eq!(records.len(), 4);
    assert_gap_free(&records);
    assert_eq!(records[0].payload, RecordPayload::Stdout(json!({"ok": true})));
    assert!(matches!(
        &records[1].payload,
        RecordPayload::Meta(MetaRecord::DecodeError { .. })
    ));
    assert_eq!(records[2].payload, RecordPayload::Stdout(json!({"ok": false})));
    assert_eq!(
        records[3].payload,
        RecordPayload::Meta(MetaRecord::Terminal(TerminalReason::ChildExited(0)))
    );

    let terminal = wait_terminal(&stack.supervisor, &snapshot.id, Duration::from_secs(5)).await;
    assert_eq!(terminal.state, SessionState::Completed);
}

#[tokio::test]
async fn fast_producer_delivers_everything_in_order() {
    let dir = tempfile::tempdir().unwrap();
    // Emits far more lines than the queue capacity without pausing.
    let agent = write_fake_agent(
        dir.path(),
        "i=1\nwhile [ $i -le 300 ]; do\n  printf '{\"i\":%d}\\n' $i\n  i=$((i+1))\ndone\nexit 0",
    );
    let stack = build_stack(&dir.path().join("state"), agent);

    let (snapshot, mut rx) = stack
        .supervisor
        .create_session(prompt("flood"))
        .await
        .unwrap();

    // Drain slowly enough that the queue must fill at least once.
    let mut records = Vec::new();
    while let Some(record) = rx.recv().await {
        if records.len() % 50 == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        records.push(record);
    }

    assert_eq!(records.len(), 301);
    assert_gap_free(&records);
    for (record, i) in records[..300].iter().zip(1..) {
        assert_eq!(record.payload, RecordPayload::Stdout(json!({ "i": i })));
    }
    assert!(records[300].is_terminal());

    let terminal = wait_terminal(&stack.supervisor, &snapshot.id, Duration::from_secs(5)).await;
    assert_eq!(terminal.records_dropped, 0);
    assert_eq!(terminal.records_emitted, 301);
}

#[tokio::test]
async fn cancellation_reaches_cancelled_with_terminal_meta() {
    let dir = tempfile::tempdir().unwrap();
    let agent = write_fake_agent(
        dir.path(),
        "printf '{\"started\":true}\\n'\nsleep 30\nexit 0",
    );
    let stack = build_stack(&dir.path().join("state"), agent);

    let (snapshot, mut rx) = stack
        .supervisor
        .create_session(prompt("cancel me"))
        .await
        .unwrap();

    // Wait for the first record so the child is demonstrably running.
    let first = rx.recv().await.unwrap();
    assert_eq!(first.payload, RecordPayload::Stdout(json!({"started": true})));

    let state = stack.supervisor.cancel_session(&snapshot.id).unwrap();
    assert!(!state.is_terminal());

    let rest = collect(rx).await;
    let terminal = rest.last().expect("terminal record");
    assert_eq!(
        terminal.payload,
        RecordPayload::Meta(MetaRecord::Terminal(TerminalReason::Cancelled))
    );

    // kill_grace + zombie_timeout bounds the transition.
    let terminal_snapshot =
        wait_terminal(&stack.supervisor, &snapshot.id, Duration::from_secs(5)).await;
    assert_eq!(terminal_snapshot.state, SessionState::Cancelled);

    let registry_records = stack.registry.list(None);
    assert!(registry_records[0].state.is_terminal());

    // Cancel again: idempotent no-op success on a terminal session.
    let state = stack.supervisor.cancel_session(&snapshot.id).unwrap();
    assert_eq!(state, SessionState::Cancelled);
}

#[tokio::test]
async fn nonzero_exit_fails_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let agent = write_fake_agent(dir.path(), "printf '{\"oops\":1}\\n'\nexit 7");
    let stack = build_stack(&dir.path().join("state"), agent);

    let (snapshot, rx) = stack
        .supervisor
        .create_session(prompt("fail"))
        .await
        .unwrap();

    let records = collect(rx).await;
    assert_eq!(
        records.last().unwrap().payload,
        RecordPayload::Meta(MetaRecord::Terminal(TerminalReason::ChildExited(7)))
    );

    let terminal = wait_terminal(&stack.supervisor, &snapshot.id, Duration::from_secs(5)).await;
    assert_eq!(terminal.state, SessionState::Failed);
    assert_eq!(terminal.exit_code, Some(7));
}

#[tokio::test]
async fn idle_timeout_times_the_session_out() {
    let dir = tempfile::tempdir().unwrap();
    let agent = write_fake_agent(
        dir.path(),
        "printf '{\"started\":true}\\n'\nsleep 30\nexit 0",
    );
    let stack = support::build_stack_with(foreman::ServerConfig {
        state_root: dir.path().join("state"),
        binary_override: Some(agent),
        agent_binary_name: "stub-agent".to_string(),
        idle_timeout: Duration::from_millis(400),
        kill_grace: Duration::from_millis(300),
        zombie_timeout: Duration::from_secs(3),
        ..foreman::ServerConfig::default()
    });

    let (snapshot, rx) = stack
        .supervisor
        .create_session(prompt("stall"))
        .await
        .unwrap();

    let records = collect(rx).await;
    assert_eq!(
        records.last().unwrap().payload,
        RecordPayload::Meta(MetaRecord::Terminal(TerminalReason::TimedOut))
    );

    let terminal = wait_terminal(&stack.supervisor, &snapshot.id, Duration::from_secs(10)).await;
    assert_eq!(terminal.state, SessionState::TimedOut);
}

#[tokio::test]
async fn session_limit_is_enforced() {
    let dir = tempfile::tempdir().unwrap();
    let agent = write_fake_agent(dir.path(), "sleep 30\nexit 0");
    let stack = support::build_stack_with(foreman::ServerConfig {
        state_root: dir.path().join("state"),
        binary_override: Some(agent),
        agent_binary_name: "stub-agent".to_string(),
        max_sessions: 1,
        kill_grace: Duration::from_millis(300),
        ..foreman::ServerConfig::default()
    });

    let (first, _rx) = stack
        .supervisor
        .create_session(prompt("occupy"))
        .await
        .unwrap();

    let err = stack
        .supervisor
        .create_session(prompt("rejected"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Busy);

    stack.supervisor.cancel_session(&first.id).unwrap();
    wait_terminal(&stack.supervisor, &first.id, Duration::from_secs(5)).await;
}

#[tokio::test]
async fn send_message_round_trips_through_child_stdin() {
    let dir = tempfile::tempdir().unwrap();
    // Echoes its first two stdin lines (the prompt message, then ours).
    let agent = write_fake_agent(
        dir.path(),
        "read first\nprintf '%s\\n' \"$first\"\nread second\nprintf '%s\\n' \"$second\"\nexit 0",
    );
    let stack = build_stack(&dir.path().join("state"), agent);

    let (snapshot, mut rx) = stack
        .supervisor
        .create_session(prompt("ping"))
        .await
        .unwrap();

    // First record: the child echoing the framed prompt message.
    let first = rx.recv().await.unwrap();
    match &first.payload {
        RecordPayload::Stdout(value) => {
            assert_eq!(value["type"], "prompt");
            assert_eq!(value["prompt"], "ping");
        }
        other => panic!("expected prompt echo, got {other:?}"),
    }

    stack
        .supervisor
        .send_message(&snapshot.id, json!({"answer": 42}), None)
        .await
        .unwrap();

    let second = rx.recv().await.unwrap();
    assert_eq!(second.payload, RecordPayload::Stdout(json!({"answer": 42})));

    let terminal = wait_terminal(&stack.supervisor, &snapshot.id, Duration::from_secs(5)).await;
    assert_eq!(terminal.state, SessionState::Completed);
    assert!(terminal.input_bytes > 0);

    // Writes to a terminal session are rejected.
    let err = stack
        .supervisor
        .send_message(&snapshot.id, json!({"late": true}), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::SessionNotRunning { .. }));
}

#[tokio::test]
async fn failed_spawn_leaves_no_registry_entry() {
    let dir = tempfile::tempdir().unwrap();
    // Passes the version probe, then disappears before the session spawn.
    let agent = write_fake_agent(dir.path(), "exit 0");
    let stack = build_stack(&dir.path().join("state"), agent.clone());

    // Warm the locator cache, then break the binary.
    let (warm, rx) = stack
        .supervisor
        .create_session(prompt("warm"))
        .await
        .unwrap();
    drop(rx);
    wait_terminal(&stack.supervisor, &warm.id, Duration::from_secs(5)).await;
    std::fs::remove_file(&agent).unwrap();

    let err = stack
        .supervisor
        .create_session(prompt("doomed"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ServerError::Spawn { .. } | ServerError::BinaryNotFound { .. }
    ));
    assert_eq!(stack.registry.running_count(), 0);
}
