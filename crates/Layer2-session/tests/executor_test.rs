//! Out-of-band 실행 통합 테스트 (HostEngine)

mod common;

use common::*;
use labterm_foundation::{streams, EngineConfig, Error, ServerEvent, SessionMode};
use labterm_session::{ClientMessage, ExecRequest, JobState, Probe};

#[tokio::test]
async fn test_dangerous_command_rejected_without_job() {
    let (engine, host) = engine();
    let mut rx = engine.bus().stream(&streams::owner("alice"));

    let err = engine
        .executor()
        .execute("alice", ExecRequest::new("rm -rf /"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ValidationRejected { .. }), "{:?}", err);

    let event = next_matching(&mut rx, |e| matches!(e, ServerEvent::Error { .. })).await;
    assert!(matches!(event.payload, ServerEvent::Error { ref kind, .. } if kind == "validation_rejected"));
    assert_eq!(host.created_total(), 0);
}

#[tokio::test]
async fn test_transient_echo_result() {
    let (engine, host) = engine();
    let mut rx = engine.bus().stream(&streams::owner("alice"));

    let id = engine
        .executor()
        .execute("alice", ExecRequest::new("echo out-of-band"))
        .await
        .expect("enqueue");

    let ack = next_matching(&mut rx, |e| matches!(e, ServerEvent::CommandAcknowledged { .. })).await;
    match ack.payload {
        ServerEvent::CommandAcknowledged { job_id, command, .. } => {
            assert_eq!(job_id, id.to_string());
            assert_eq!(command, "echo out-of-band");
        }
        other => panic!("unexpected {:?}", other),
    }

    let done = next_matching(&mut rx, |e| matches!(e, ServerEvent::ExecutionCompleted { .. })).await;
    match done.payload {
        ServerEvent::ExecutionCompleted { result, .. } => {
            assert_eq!(result.stdout.trim(), "out-of-band");
            assert_eq!(result.exit_status, 0);
            assert!(!result.timed_out);
        }
        other => panic!("unexpected {:?}", other),
    }

    // transient context is gone once the job is done
    assert_eq!(host.created_total(), 1);
    eventually(|| {
        let host = host.clone();
        async move { host.is_empty() }
    })
    .await;
    assert!(engine.manager().registry().is_empty().await);

    let executor = engine.executor().clone();
    eventually(|| {
        let executor = executor.clone();
        async move {
            matches!(executor.status(id).await, Some(record) if record.state == JobState::Completed)
        }
    })
    .await;
}

#[tokio::test]
async fn test_timeout_kills_command() {
    let (engine, _host) = engine();
    let mut rx = engine.bus().stream(&streams::owner("alice"));

    engine
        .executor()
        .execute("alice", ExecRequest::new("sleep 5").with_timeout(1))
        .await
        .expect("enqueue");

    let started = std::time::Instant::now();
    let done = next_matching(&mut rx, |e| matches!(e, ServerEvent::ExecutionCompleted { .. })).await;
    match done.payload {
        ServerEvent::ExecutionCompleted { result, .. } => {
            assert!(result.timed_out);
            assert_eq!(result.exit_status, 124);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(started.elapsed() < std::time::Duration::from_secs(4));
}

#[tokio::test]
async fn test_exec_reuses_live_session() {
    let (engine, host) = engine();
    let mut term = engine.bus().stream(&streams::terminal("live"));
    let mut owner = engine.bus().stream(&streams::owner("alice"));
    let mut channel = engine.channel(Some("alice".into()));

    channel
        .handle(ClientMessage::Subscribe {
            session_id: Some("live".into()),
            image: None,
            mode: SessionMode::IsolatedReadonly,
        })
        .await;
    wait_for_status(&mut term, "attached").await;

    // session id defaults to the channel's own session
    channel.handle_text(r#"{"action":"execute","command":"pwd"}"#).await;
    let done = next_matching(&mut owner, |e| matches!(e, ServerEvent::ExecutionCompleted { .. })).await;
    assert!(matches!(done.payload, ServerEvent::ExecutionCompleted { ref result, .. } if result.success()));
    assert_eq!(host.created_total(), 1, "no transient container for a live session");

    // another owner cannot target it
    let err = engine
        .executor()
        .execute("mallory", ExecRequest::new("ls").in_session("live"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Unauthorized(_)));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_probes() {
    let (engine, _host) = engine();
    let mut term = engine.bus().stream(&streams::terminal("probed"));
    let mut channel = engine.channel(Some("alice".into()));

    channel
        .handle(ClientMessage::Subscribe {
            session_id: Some("probed".into()),
            image: None,
            mode: SessionMode::IsolatedReadonly,
        })
        .await;
    wait_for_status(&mut term, "attached").await;

    let executor = engine.executor();
    let running = executor
        .probe("alice", "probed", Probe::ContainerRunning)
        .await
        .expect("probe");
    assert!(running.passed);

    let missing = executor
        .probe(
            "alice",
            "probed",
            Probe::FileExists {
                path: "/definitely/not here".into(),
            },
        )
        .await
        .expect("probe");
    assert!(!missing.passed);

    let output = executor
        .probe(
            "alice",
            "probed",
            Probe::CommandOutput {
                command: "echo ready".into(),
                expect: "ready".into(),
            },
        )
        .await
        .expect("probe");
    assert!(output.passed, "{}", output.detail);

    let denied = executor
        .probe(
            "alice",
            "probed",
            Probe::CommandOutput {
                command: "curl example.com".into(),
                expect: "".into(),
            },
        )
        .await;
    assert!(matches!(denied, Err(Error::ValidationRejected { .. })));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_full_queue_reports_every_refusal() {
    let mut config = EngineConfig::default();
    config.executor.workers = 1;
    config.executor.queue_capacity = 1;
    let (engine, _host) = engine_with(config);
    let mut channel = engine.channel(Some("alice".into()));

    for _ in 0..4 {
        let reply = channel
            .handle_text(r#"{"action":"execute","command":"sleep 2"}"#)
            .await;
        assert!(reply.events.is_empty());
    }

    // each request shows up on the owner stream as an ack or a typed error
    let mut acks = 0;
    let mut refusals = 0;
    while acks + refusals < 4 {
        let event = tokio::time::timeout(WAIT, channel.next_event())
            .await
            .expect("timed out waiting for event")
            .expect("event bus closed");
        match event.payload {
            ServerEvent::CommandAcknowledged { .. } => acks += 1,
            ServerEvent::Error { kind, .. } => {
                assert_eq!(kind, "job");
                refusals += 1;
            }
            _ => {}
        }
    }
    assert!(acks >= 1);
    assert!(refusals >= 2, "capacity 1 with one worker cannot hold 4 jobs");

    engine.shutdown().await;
}

#[tokio::test]
async fn test_execution_failure_is_reported_and_retried() {
    let (engine, host) = engine();
    let mut rx = engine.bus().stream(&streams::owner("alice"));

    // queued fine, but no context can be provisioned
    host.set_available(false);
    let id = engine
        .executor()
        .execute("alice", ExecRequest::new("echo never"))
        .await
        .expect("enqueue");

    let failed = next_matching(&mut rx, |e| matches!(e, ServerEvent::ExecutionError { .. })).await;
    match failed.payload {
        ServerEvent::ExecutionError { job_id, error } => {
            assert_eq!(job_id, id.to_string());
            assert!(error.contains("not running"), "{}", error);
        }
        other => panic!("unexpected {:?}", other),
    }

    let executor = engine.executor().clone();
    eventually(|| {
        let executor = executor.clone();
        async move {
            matches!(executor.status(id).await, Some(record) if record.state == JobState::Failed)
        }
    })
    .await;
    let record = engine.executor().status(id).await.expect("record");
    assert_eq!(record.attempts, engine.config().executor.retry.max_retries + 1);
    assert!(record.attempts > 1);
    assert_eq!(host.created_total(), 0);
}

#[tokio::test]
async fn test_exec_context_cannot_be_subscribed() {
    let (engine, _host) = engine();
    let mut rx = engine.bus().stream(&streams::owner("alice"));

    let id = engine
        .executor()
        .execute("alice", ExecRequest::new("sleep 2"))
        .await
        .expect("enqueue");

    let manager = engine.manager().clone();
    eventually(|| {
        let manager = manager.clone();
        async move { !manager.registry().is_empty().await }
    })
    .await;
    let slot = engine.manager().registry().list().await.remove(0);
    assert!(slot.session_id.starts_with("exec-"));
    assert!(!slot.is_interactive());

    let mut channel = engine.channel(Some("alice".into()));
    let reply = channel
        .handle(ClientMessage::Subscribe {
            session_id: Some(slot.session_id.clone()),
            image: None,
            mode: SessionMode::IsolatedReadonly,
        })
        .await;
    match reply.events.as_slice() {
        [ServerEvent::Error { kind, .. }] => assert_eq!(kind, "session_exists"),
        other => panic!("expected session_exists, got {:?}", other),
    }

    // the command still runs to completion in its own context
    let done = next_matching(&mut rx, |e| matches!(e, ServerEvent::ExecutionCompleted { .. })).await;
    match done.payload {
        ServerEvent::ExecutionCompleted { job_id, result } => {
            assert_eq!(job_id, id.to_string());
            assert_eq!(result.exit_status, 0);
        }
        other => panic!("unexpected {:?}", other),
    }
    eventually(|| {
        let manager = manager.clone();
        async move { manager.registry().is_empty().await }
    })
    .await;

    engine.shutdown().await;
}
