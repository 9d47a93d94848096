use anyhow::{Context, Result, anyhow};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;

use librexec::{
    AgentSessionManager, AgentStartOptions, BroadcastHub, ManagerConfig, PtySessionManager,
    PtyStartOptions, RexecError,
};
use rexec_protocol::{Event, ExitInfo, OutputStream, SessionStatus};

const WAIT: Duration = Duration::from_secs(10);

fn config() -> ManagerConfig {
    ManagerConfig {
        grace_period: Duration::from_millis(300),
        ..ManagerConfig::default()
    }
}

fn managers() -> (PtySessionManager, AgentSessionManager) {
    let hub = Arc::new(BroadcastHub::new(1024));
    (
        PtySessionManager::new(config(), hub.clone()),
        AgentSessionManager::new(config(), hub),
    )
}

fn shell(id: &str) -> PtyStartOptions {
    PtyStartOptions {
        id: id.to_string(),
        shell: Some("/bin/sh".to_string()),
        ..PtyStartOptions::default()
    }
}

fn agent(name: &str, script: &str) -> AgentStartOptions {
    AgentStartOptions {
        agent: name.to_string(),
        workspace_id: "ws-1".to_string(),
        command: "/bin/sh".to_string(),
        args: vec!["-c".to_string(), script.to_string()],
        ..AgentStartOptions::default()
    }
}

/// Read events until output containing `needle` shows up.
async fn wait_for_output(rx: &mut broadcast::Receiver<Event>, needle: &str) -> Result<()> {
    let mut seen = Vec::new();
    timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(Event::Output { data, .. }) => {
                    seen.extend_from_slice(&data);
                    if String::from_utf8_lossy(&seen).contains(needle) {
                        return Ok(());
                    }
                }
                Ok(Event::Exit { .. }) => return Err(anyhow!("session exited before {needle}")),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => return Err(anyhow!("event stream ended: {e}")),
            }
        }
    })
    .await
    .context("timed out waiting for output")?
}

async fn wait_for_exit(rx: &mut broadcast::Receiver<Event>) -> Result<ExitInfo> {
    timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(Event::Exit { exit, .. }) => return Ok(exit),
                Ok(Event::Output { .. }) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => return Err(anyhow!("event stream ended: {e}")),
            }
        }
    })
    .await
    .context("timed out waiting for exit")?
}

#[tokio::test]
async fn pty_echo_then_kill() -> Result<()> {
    let (pty, _) = managers();
    pty.start(shell("term-1")).await?;
    let mut rx = pty.subscribe("term-1")?;

    pty.write("term-1", b"echo MARK123\n")?;
    wait_for_output(&mut rx, "MARK123").await?;

    pty.kill("term-1").await?;
    let exit = wait_for_exit(&mut rx).await?;
    assert_eq!(exit.code, Some(-1));
    // An interactive sh ignores SIGTERM, so the kill escalates.
    assert_eq!(exit.signal.as_deref(), Some("SIGKILL"), "{exit:?}");

    // Exit is the last event and is delivered once.
    assert!(rx.try_recv().is_err());

    assert!(matches!(
        pty.write("term-1", b"ls\n"),
        Err(RexecError::FailedPrecondition(_))
    ));
    assert!(matches!(
        pty.resize("term-1", 100, 30),
        Err(RexecError::FailedPrecondition(_))
    ));
    pty.kill("term-1").await.context("second kill is a no-op")?;

    let status = pty.status("term-1")?;
    assert_eq!(status.status, SessionStatus::Error);
    Ok(())
}

#[tokio::test]
async fn concurrent_starts_with_same_id() -> Result<()> {
    let (pty, _) = managers();
    let mut handles = Vec::new();
    for _ in 0..8 {
        let pty = pty.clone();
        handles.push(tokio::spawn(async move { pty.start(shell("dup")).await }));
    }

    let mut ok = 0;
    let mut already_exists = 0;
    for handle in handles {
        match handle.await? {
            Ok(_) => ok += 1,
            Err(RexecError::AlreadyExists(_)) => already_exists += 1,
            Err(e) => return Err(anyhow!("unexpected error: {e}")),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(already_exists, 7);
    assert_eq!(pty.list().len(), 1);

    pty.kill("dup").await?;
    assert!(pty.list().is_empty());
    Ok(())
}

#[tokio::test]
async fn output_queue_closes_after_exit() -> Result<()> {
    let (pty, _) = managers();
    pty.start(shell("q")).await?;
    let mut output = pty.take_output("q")?;
    assert!(matches!(
        pty.take_output("q"),
        Err(RexecError::FailedPrecondition(_))
    ));

    pty.write("q", b"echo QUEUED; exit 3\n")?;
    let exit = timeout(WAIT, pty.wait_exit("q")).await??;
    assert_eq!(exit.code, Some(3));
    assert_eq!(exit.status(), SessionStatus::Error);

    let mut collected = Vec::new();
    timeout(WAIT, async {
        while let Some(chunk) = output.recv().await {
            assert_eq!(chunk.stream, OutputStream::Pty);
            collected.extend_from_slice(&chunk.data);
        }
    })
    .await
    .context("queue never closed")?;
    assert!(String::from_utf8_lossy(&collected).contains("QUEUED"));

    // A restart under the same id clears the closed record.
    pty.start(shell("q")).await?;
    pty.write("q", b"true\n")?;
    pty.kill("q").await?;
    Ok(())
}

#[tokio::test]
async fn agent_message_roundtrip_and_stop() -> Result<()> {
    let (_, agents) = managers();
    let id = agents.start(agent("cat", "exec cat")).await?;
    assert_eq!(id, "cat:ws-1");
    let mut rx = agents.subscribe(&id)?;

    agents.send_message(&id, "hello agent").await?;
    wait_for_output(&mut rx, "hello agent\n").await?;

    let running = agents.status(&id)?;
    assert_eq!(running.status, SessionStatus::Running);
    assert!(running.pid.is_some());

    let stopped = agents.stop(&id).await?;
    assert!(stopped.status.is_terminal());
    wait_for_exit(&mut rx).await?;

    assert!(matches!(
        agents.send_message(&id, "too late").await,
        Err(RexecError::FailedPrecondition(_))
    ));
    agents.stop(&id).await.context("second stop is a no-op")?;

    // The terminal snapshot is stable across calls.
    let first = agents.status(&id)?;
    let second = agents.status(&id)?;
    assert_eq!(first, second);
    assert_eq!(first, stopped);
    Ok(())
}

#[tokio::test]
async fn agent_ignoring_sigterm_is_force_killed() -> Result<()> {
    let (_, agents) = managers();
    let id = agents
        .start(agent(
            "stubborn",
            "trap '' TERM; echo ready; while true; do sleep 0.1; done",
        ))
        .await?;
    let mut rx = agents.subscribe(&id)?;
    wait_for_output(&mut rx, "ready").await?;

    let snapshot = timeout(WAIT, agents.stop(&id)).await??;
    assert_eq!(snapshot.status, SessionStatus::Error);
    let exit = snapshot.exit.context("exit recorded")?;
    assert_eq!(exit.signal.as_deref(), Some("SIGKILL"));
    Ok(())
}

#[tokio::test]
async fn agent_failure_is_retained() -> Result<()> {
    let (_, agents) = managers();
    let id = agents
        .start(agent("failing", "sleep 0.3; echo oops >&2; exit 4"))
        .await?;
    let mut rx = agents.subscribe(&id)?;

    let mut stderr = Vec::new();
    let exit = timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(Event::Output {
                    stream: OutputStream::Stderr,
                    data,
                    ..
                }) => stderr.extend_from_slice(&data),
                Ok(Event::Output { .. }) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Ok(Event::Exit { exit, .. }) => return Ok(exit),
                Err(e) => return Err(anyhow!("stream ended: {e}")),
            }
        }
    })
    .await??;

    assert_eq!(exit.code, Some(4));
    assert!(exit.error.is_some());
    assert_eq!(String::from_utf8_lossy(&stderr).trim(), "oops");

    for _ in 0..3 {
        let status = agents.status(&id)?;
        assert_eq!(status.status, SessionStatus::Error);
        assert_eq!(status.exit.as_ref().and_then(|e| e.code), Some(4));
    }
    assert!(agents.list().is_empty());
    Ok(())
}

#[tokio::test]
async fn duplicate_agent_key_is_rejected() -> Result<()> {
    let (_, agents) = managers();
    agents.start(agent("dup", "exec cat")).await?;
    let err = agents
        .start(agent("dup", "exec cat"))
        .await
        .expect_err("same agent and workspace");
    assert!(matches!(err, RexecError::AlreadyExists(_)));
    agents.stop("dup:ws-1").await?;
    Ok(())
}

#[tokio::test]
async fn shutdown_all_leaves_nothing_running() -> Result<()> {
    let (pty, agents) = managers();
    pty.start(shell("a")).await?;
    pty.start(shell("b")).await?;
    agents.start(agent("idle", "exec cat")).await?;

    timeout(WAIT, async {
        pty.shutdown_all().await;
        agents.shutdown_all().await;
    })
    .await?;

    assert!(pty.list().is_empty());
    assert!(agents.list().is_empty());
    for id in ["a", "b"] {
        assert!(pty.status(id)?.status.is_terminal());
    }
    assert!(agents.status("idle:ws-1")?.status.is_terminal());
    Ok(())
}

#[tokio::test]
async fn starts_are_refused_once_shutdown_begins() -> Result<()> {
    let (pty, agents) = managers();
    pty.start(shell("before")).await?;

    timeout(WAIT, async {
        pty.shutdown_all().await;
        agents.shutdown_all().await;
    })
    .await?;

    let err = pty.start(shell("after")).await.expect_err("pty after shutdown");
    assert!(matches!(err, RexecError::FailedPrecondition(_)));
    let err = agents
        .start(agent("late", "exec cat"))
        .await
        .expect_err("agent after shutdown");
    assert!(matches!(err, RexecError::FailedPrecondition(_)));

    assert!(pty.list().is_empty());
    assert!(agents.list().is_empty());
    assert!(matches!(pty.status("after"), Err(RexecError::NotFound(_))));
    Ok(())
}
