use anyhow::{Context, Result, anyhow, bail};
use git2::{Repository, Signature};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tonic::Code;

use rexec_client::{ClientError, RexecClient, SessionStream, StreamItem};
use rexec_proto::v1 as pb;
use rexec_protocol::{
    ClientFrame, ErrorCode, RemoteServer, ServerFrame, SessionKind, SessionStatus,
};
use rexec_server::audit::actions;
use rexec_server::config::{Cli, FileConfig};
use rexec_server::{
    AuditLog, MemoryAuditSink, ServerConfig, ServerHandle, Supervisor, issue_token,
};

const SECRET: &str = "e2e-secret";
const WAIT: Duration = Duration::from_secs(10);

struct TestServer {
    handle: ServerHandle,
    audit: Arc<MemoryAuditSink>,
}

impl TestServer {
    async fn start() -> Result<Self> {
        let cli = Cli {
            rpc_listen: Some("127.0.0.1:0".parse()?),
            stream_listen: Some("127.0.0.1:0".parse()?),
            auth_secret: Some(SECRET.to_string()),
            grace_period_ms: Some(300),
            ..Cli::default()
        };
        let config = ServerConfig::resolve(&cli, FileConfig::default())?;
        let audit = Arc::new(MemoryAuditSink::default());
        let handle = Supervisor::start(&config, AuditLog::new().with_sink(audit.clone())).await?;
        Ok(Self { handle, audit })
    }

    fn remote(&self, credential: String) -> RemoteServer {
        RemoteServer {
            name: "test".to_string(),
            rpc_addr: format!("http://{}", self.handle.rpc_addr),
            stream_addr: format!("ws://{}", self.handle.stream_addr),
            credential,
        }
    }

    async fn client(&self) -> Result<RexecClient> {
        let token = issue_token(SECRET, "alice", Duration::from_secs(300))?;
        Ok(RexecClient::connect(self.remote(token)).await?)
    }
}

/// Collect output until `needle` shows up.
async fn read_until(stream: &mut SessionStream, needle: &str) -> Result<()> {
    let mut seen = Vec::new();
    timeout(WAIT, async {
        loop {
            match stream.next().await {
                Some(Ok(StreamItem::Output(data))) => {
                    seen.extend_from_slice(&data);
                    if String::from_utf8_lossy(&seen).contains(needle) {
                        return Ok(());
                    }
                }
                Some(Ok(StreamItem::Frame(frame))) => bail!("unexpected frame {frame:?}"),
                Some(Err(e)) => return Err(e.into()),
                None => bail!("stream closed before {needle}"),
            }
        }
    })
    .await
    .context("timed out waiting for output")?
}

async fn next_frame(stream: &mut SessionStream) -> Result<ServerFrame> {
    timeout(WAIT, async {
        loop {
            match stream.next().await {
                Some(Ok(StreamItem::Output(_))) => continue,
                Some(Ok(StreamItem::Frame(frame))) => return Ok(frame),
                Some(Err(e)) => return Err(e.into()),
                None => return Err(anyhow!("stream closed")),
            }
        }
    })
    .await
    .context("timed out waiting for a frame")?
}

fn init_project(dir: &Path) -> Result<std::path::PathBuf> {
    let project = dir.join("project");
    std::fs::create_dir(&project)?;
    let repo = Repository::init(&project)?;
    std::fs::write(project.join("README.md"), "hello")?;
    let mut index = repo.index()?;
    index.add_path(Path::new("README.md"))?;
    index.write()?;
    let tree = repo.find_tree(index.write_tree()?)?;
    let sig = Signature::now("rexec", "rexec@example.com")?;
    repo.commit(Some("HEAD"), &sig, &sig, "init", &tree, &[])?;
    Ok(project)
}

#[tokio::test]
async fn pty_session_over_both_channels() -> Result<()> {
    let server = TestServer::start().await?;
    let mut client = server.client().await?;

    let id = client
        .start_pty("term-1", Some("/bin/sh"), HashMap::new())
        .await?;
    assert_eq!(id, "term-1");

    let mut stream = client.open_stream(SessionKind::Pty, "term-1").await?;
    stream.resize(120, 40).await?;
    stream.send_input(b"echo MARK123\n").await?;
    read_until(&mut stream, "MARK123").await?;

    stream.kill().await?;
    match next_frame(&mut stream).await? {
        ServerFrame::Exit { code, signal, .. } => {
            assert_eq!(code, Some(-1));
            assert!(signal.is_some());
        }
        other => bail!("expected exit, got {other:?}"),
    }
    let after = timeout(WAIT, stream.next()).await?;
    assert!(after.is_none(), "stream should close after exit: {after:?}");

    let err = client
        .write_pty("term-1", b"ls\n")
        .await
        .expect_err("closed session");
    assert_eq!(err.code(), Code::FailedPrecondition);
    client.kill_pty("term-1").await.context("second kill")?;

    let starts = server.audit.by_action(actions::SESSION_START);
    assert_eq!(starts.len(), 1);
    assert!(starts[0].success);
    assert_eq!(starts[0].actor, "alice");
    assert_eq!(starts[0].resource, "pty/term-1");
    let stops = server.audit.by_action(actions::SESSION_STOP);
    assert!(stops.iter().any(|e| e.metadata.get("transport").map(String::as_str) == Some("stream")));

    server.handle.shutdown().await
}

#[tokio::test]
async fn wrong_secret_is_rejected_and_audited() -> Result<()> {
    let server = TestServer::start().await?;
    let forged = issue_token("not-the-secret", "mallory", Duration::from_secs(300))?;
    let mut client = RexecClient::connect(server.remote(forged)).await?;

    let err = client
        .start_pty("x", None, HashMap::new())
        .await
        .expect_err("forged credential");
    assert_eq!(err.code(), Code::Unauthenticated);

    let failures = server.audit.by_action(actions::AUTH_FAILURE);
    assert_eq!(failures.len(), 1);
    assert!(!failures[0].success);
    assert_eq!(failures[0].actor, "unknown");
    assert_eq!(failures[0].resource, "StartPty");
    assert!(server.audit.by_action(actions::SESSION_START).is_empty());

    match client.open_stream(SessionKind::Pty, "x").await {
        Err(ClientError::Rejected(401)) => {}
        Err(other) => bail!("expected 401, got {other}"),
        Ok(_) => bail!("stream accepted a forged credential"),
    }
    assert_eq!(server.audit.by_action(actions::AUTH_FAILURE).len(), 2);

    server.handle.shutdown().await
}

#[tokio::test]
async fn unknown_stream_session_is_not_found() -> Result<()> {
    let server = TestServer::start().await?;
    let client = server.client().await?;
    match client.open_stream(SessionKind::Pty, "missing").await {
        Err(ClientError::Rejected(404)) => {}
        Err(other) => bail!("expected 404, got {other}"),
        Ok(_) => bail!("stream opened for an unknown session"),
    }
    server.handle.shutdown().await
}

#[tokio::test]
async fn agent_session_lifecycle() -> Result<()> {
    let server = TestServer::start().await?;
    let mut client = server.client().await?;

    let id = client
        .start_agent(pb::StartAgentRequest {
            agent: "echo-agent".to_string(),
            workspace_id: "ws-9".to_string(),
            command: "/bin/cat".to_string(),
            ..pb::StartAgentRequest::default()
        })
        .await?;
    assert_eq!(id, "echo-agent:ws-9");

    let mut stream = client.open_stream(SessionKind::Agent, &id).await?;
    client.send_agent_message(&id, "hello agent").await?;
    read_until(&mut stream, "hello agent\n").await?;

    stream.send_frame(&ClientFrame::Resize { cols: 80, rows: 24 }).await?;
    match next_frame(&mut stream).await? {
        ServerFrame::Error { code, .. } => assert_eq!(code, ErrorCode::FailedPrecondition),
        other => bail!("expected error frame, got {other:?}"),
    }

    let running = client.agent_status(&id).await?;
    assert_eq!(running.status, SessionStatus::Running);

    let stopped = client.stop_agent(&id).await?;
    assert!(stopped.status.is_terminal());
    assert!(matches!(next_frame(&mut stream).await?, ServerFrame::Exit { .. }));

    let first = client.agent_status(&id).await?;
    let second = client.agent_status(&id).await?;
    assert_eq!(first, second);
    assert_eq!(first.status, stopped.status);

    let err = client
        .send_agent_message(&id, "late")
        .await
        .expect_err("closed agent");
    assert_eq!(err.code(), Code::FailedPrecondition);

    let err = client
        .start_agent(pb::StartAgentRequest {
            agent: "echo-agent".to_string(),
            ..pb::StartAgentRequest::default()
        })
        .await
        .expect_err("missing fields");
    assert_eq!(err.code(), Code::InvalidArgument);

    server.handle.shutdown().await
}

#[tokio::test]
async fn worktrees_over_rpc() -> Result<()> {
    let server = TestServer::start().await?;
    let mut client = server.client().await?;
    let dir = tempfile::tempdir()?;
    let project = init_project(dir.path())?;
    let project_path = project.to_str().context("utf-8 path")?;

    let created = client
        .create_worktree(project_path, "Feature One!!", "proj")
        .await?;
    assert_eq!(created.branch, "feature-one");
    assert_eq!(created.name, "Feature One!!");

    let err = client
        .create_worktree(project_path, "feature one", "proj")
        .await
        .expect_err("duplicate");
    assert_eq!(err.code(), Code::AlreadyExists);

    let listed = client.list_worktrees(project_path, "proj").await?;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, created.id);

    std::fs::write(created.path.join("new.txt"), "x")?;
    let changes = client
        .worktree_status(created.path.to_str().context("utf-8 path")?)
        .await?;
    assert!(changes.has_changes);
    assert_eq!(changes.untracked, vec!["new.txt".to_string()]);

    let err = client
        .worktree_status(project_path)
        .await
        .expect_err("project is not a worktree");
    assert_eq!(err.code(), Code::InvalidArgument);

    let err = client
        .remove_worktree(pb::RemoveWorktreeRequest {
            project_path: project_path.to_string(),
            worktree_path: "/etc".to_string(),
            ..pb::RemoveWorktreeRequest::default()
        })
        .await
        .expect_err("outside root");
    assert_eq!(err.code(), Code::InvalidArgument);

    let removed = client
        .remove_worktree(pb::RemoveWorktreeRequest {
            project_path: project_path.to_string(),
            worktree_id: created.id.clone(),
            ..pb::RemoveWorktreeRequest::default()
        })
        .await?;
    assert_eq!(removed.path, created.path);
    assert!(client.list_worktrees(project_path, "proj").await?.is_empty());

    let creates = server.audit.by_action(actions::WORKTREE_CREATE);
    assert_eq!(creates.len(), 2);
    assert_eq!(creates.iter().filter(|e| e.success).count(), 1);
    let removes = server.audit.by_action(actions::WORKTREE_REMOVE);
    assert_eq!(removes.len(), 2);
    assert_eq!(removes.iter().filter(|e| e.success).count(), 1);

    server.handle.shutdown().await
}

#[tokio::test]
async fn shutdown_terminates_every_session() -> Result<()> {
    let server = TestServer::start().await?;
    let mut client = server.client().await?;
    client.start_pty("a", Some("/bin/sh"), HashMap::new()).await?;
    let agent = client
        .start_agent(pb::StartAgentRequest {
            agent: "idle".to_string(),
            workspace_id: "ws".to_string(),
            command: "/bin/cat".to_string(),
            ..pb::StartAgentRequest::default()
        })
        .await?;

    let state = server.handle.state().clone();
    timeout(WAIT, server.handle.shutdown()).await??;

    assert!(state.pty.list().is_empty());
    assert!(state.agents.list().is_empty());
    assert!(state.pty.status("a")?.status.is_terminal());
    assert!(state.agents.status(&agent)?.status.is_terminal());
    Ok(())
}

#[tokio::test]
async fn starts_racing_shutdown_leave_nothing_running() -> Result<()> {
    let server = TestServer::start().await?;
    let mut client = server.client().await?;
    for i in 0..4 {
        client
            .start_pty(&format!("early{i}"), Some("/bin/sh"), HashMap::new())
            .await?;
    }

    let state = server.handle.state().clone();
    let shutdown = tokio::spawn(server.handle.shutdown());

    let mut accepted = Vec::new();
    let mut refused = false;
    for i in 0..200 {
        let id = format!("late{i}");
        match client.start_pty(&id, Some("/bin/sh"), HashMap::new()).await {
            Ok(id) => accepted.push(id),
            Err(_) => {
                refused = true;
                break;
            }
        }
    }
    timeout(WAIT, shutdown).await???;

    assert!(refused, "starts kept succeeding while shutting down");
    assert!(state.pty.list().is_empty());
    for id in (0..4).map(|i| format!("early{i}")).chain(accepted) {
        assert!(state.pty.status(&id)?.status.is_terminal(), "{id} still running");
    }
    let err = state
        .pty
        .start(librexec::PtyStartOptions {
            id: "after".to_string(),
            shell: Some("/bin/sh".to_string()),
            ..librexec::PtyStartOptions::default()
        })
        .await
        .expect_err("start after shutdown");
    assert!(matches!(err, librexec::RexecError::FailedPrecondition(_)));
    Ok(())
}
