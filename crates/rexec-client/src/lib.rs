//! Connects to a rexec server described by a [`RemoteServer`] record.
//!
//! The request/response channel is a bearer-authenticated gRPC client; the
//! push channel is one websocket per session.

use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tonic::service::Interceptor;
use tonic::service::interceptor::InterceptedService;
use tonic::transport::Channel;
use tonic::{Request, Status};

use rexec_proto::v1 as pb;
use rexec_proto::v1::exec_client::ExecClient;
use rexec_protocol::{
    ClientFrame, ExitInfo, RemoteServer, ServerFrame, SessionKind, SessionSnapshot, SessionStatus,
    WorktreeChanges, WorktreeInfo, WorktreeStatus,
};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("credential is not a valid header value")]
    InvalidCredential,

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// The push endpoint answered the upgrade with an HTTP status.
    #[error("stream rejected with HTTP {0}")]
    Rejected(u16),

    #[error("protocol error: {0}")]
    Protocol(String),
}

pub type Result<T, E = ClientError> = std::result::Result<T, E>;

/// Adds `authorization: Bearer <credential>` to every call.
#[derive(Clone)]
pub struct BearerAuth {
    token: String,
}

impl Interceptor for BearerAuth {
    fn call(&mut self, mut req: Request<()>) -> std::result::Result<Request<()>, Status> {
        let value = format!("Bearer {}", self.token)
            .parse()
            .map_err(|_| Status::internal("invalid token format"))?;
        req.metadata_mut().insert("authorization", value);
        Ok(req)
    }
}

pub type RpcClient = ExecClient<InterceptedService<Channel, BearerAuth>>;

pub struct RexecClient {
    server: RemoteServer,
    rpc: RpcClient,
}

impl RexecClient {
    pub async fn connect(server: RemoteServer) -> Result<Self> {
        let channel = Channel::from_shared(server.rpc_addr.clone())
            .map_err(|e| ClientError::InvalidAddress(e.to_string()))?
            .connect()
            .await?;
        let rpc = ExecClient::with_interceptor(
            channel,
            BearerAuth {
                token: server.credential.clone(),
            },
        );
        Ok(Self { server, rpc })
    }

    pub fn server(&self) -> &RemoteServer {
        &self.server
    }

    /// Raw generated client, for calls the helpers below don't cover.
    pub fn rpc(&mut self) -> &mut RpcClient {
        &mut self.rpc
    }

    pub async fn create_worktree(
        &mut self,
        project_path: &str,
        name: &str,
        project_id: &str,
    ) -> Result<WorktreeInfo, Status> {
        let resp = self
            .rpc
            .create_worktree(pb::CreateWorktreeRequest {
                project_path: project_path.to_string(),
                name: name.to_string(),
                project_id: project_id.to_string(),
            })
            .await?
            .into_inner();
        worktree_from_pb(resp.worktree)
    }

    pub async fn create_worktree_from_branch(
        &mut self,
        project_path: &str,
        name: &str,
        project_id: &str,
        branch: &str,
    ) -> Result<WorktreeInfo, Status> {
        let resp = self
            .rpc
            .create_worktree_from_branch(pb::CreateWorktreeFromBranchRequest {
                project_path: project_path.to_string(),
                name: name.to_string(),
                project_id: project_id.to_string(),
                branch: branch.to_string(),
            })
            .await?
            .into_inner();
        worktree_from_pb(resp.worktree)
    }

    pub async fn list_worktrees(
        &mut self,
        project_path: &str,
        project_id: &str,
    ) -> Result<Vec<WorktreeInfo>, Status> {
        let resp = self
            .rpc
            .list_worktrees(pb::ListWorktreesRequest {
                project_path: project_path.to_string(),
                project_id: project_id.to_string(),
            })
            .await?
            .into_inner();
        resp.worktrees
            .into_iter()
            .map(|w| worktree_from_pb(Some(w)))
            .collect()
    }

    pub async fn remove_worktree(
        &mut self,
        request: pb::RemoveWorktreeRequest,
    ) -> Result<WorktreeInfo, Status> {
        let resp = self.rpc.remove_worktree(request).await?.into_inner();
        worktree_from_pb(resp.worktree)
    }

    pub async fn worktree_status(&mut self, worktree_path: &str) -> Result<WorktreeChanges, Status> {
        let resp = self
            .rpc
            .get_worktree_status(pb::GetWorktreeStatusRequest {
                worktree_path: worktree_path.to_string(),
            })
            .await?
            .into_inner();
        Ok(WorktreeChanges {
            staged: resp.staged,
            unstaged: resp.unstaged,
            untracked: resp.untracked,
            has_changes: resp.has_changes,
        })
    }

    pub async fn start_agent(&mut self, request: pb::StartAgentRequest) -> Result<String, Status> {
        Ok(self.rpc.start_agent(request).await?.into_inner().session_id)
    }

    pub async fn send_agent_message(&mut self, session_id: &str, text: &str) -> Result<(), Status> {
        self.rpc
            .send_agent_message(pb::SendAgentMessageRequest {
                session_id: session_id.to_string(),
                text: text.to_string(),
            })
            .await?;
        Ok(())
    }

    pub async fn stop_agent(&mut self, session_id: &str) -> Result<SessionSnapshot, Status> {
        let resp = self.rpc.stop_agent(session_request(session_id)).await?;
        snapshot_from_pb(resp.into_inner())
    }

    pub async fn agent_status(&mut self, session_id: &str) -> Result<SessionSnapshot, Status> {
        let resp = self.rpc.get_agent_status(session_request(session_id)).await?;
        snapshot_from_pb(resp.into_inner())
    }

    pub async fn start_pty(
        &mut self,
        session_id: &str,
        shell: Option<&str>,
        env: HashMap<String, String>,
    ) -> Result<String, Status> {
        let resp = self
            .rpc
            .start_pty(pb::StartPtyRequest {
                session_id: session_id.to_string(),
                shell: shell.unwrap_or_default().to_string(),
                env,
                ..pb::StartPtyRequest::default()
            })
            .await?;
        Ok(resp.into_inner().session_id)
    }

    pub async fn write_pty(&mut self, session_id: &str, data: &[u8]) -> Result<(), Status> {
        self.rpc
            .write_pty(pb::WritePtyRequest {
                session_id: session_id.to_string(),
                data: data.to_vec(),
            })
            .await?;
        Ok(())
    }

    pub async fn resize_pty(&mut self, session_id: &str, cols: u16, rows: u16) -> Result<(), Status> {
        self.rpc
            .resize_pty(pb::ResizePtyRequest {
                session_id: session_id.to_string(),
                cols: cols.into(),
                rows: rows.into(),
            })
            .await?;
        Ok(())
    }

    pub async fn kill_pty(&mut self, session_id: &str) -> Result<(), Status> {
        self.rpc.kill_pty(session_request(session_id)).await?;
        Ok(())
    }

    /// Open the push channel for one session.
    pub async fn open_stream(&self, kind: SessionKind, session_id: &str) -> Result<SessionStream> {
        let url = format!(
            "{}/v1/stream/{}/{}",
            self.server.stream_addr.trim_end_matches('/'),
            kind.as_str(),
            session_id
        );
        let mut request = url.as_str().into_client_request()?;
        let value = HeaderValue::from_str(&format!("Bearer {}", self.server.credential))
            .map_err(|_| ClientError::InvalidCredential)?;
        request.headers_mut().insert(header::AUTHORIZATION, value);

        match tokio_tungstenite::connect_async(request).await {
            Ok((ws, _)) => Ok(SessionStream { ws }),
            Err(tungstenite::Error::Http(response)) => {
                Err(ClientError::Rejected(response.status().as_u16()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn session_request(session_id: &str) -> pb::SessionRequest {
    pb::SessionRequest {
        session_id: session_id.to_string(),
    }
}

fn worktree_from_pb(worktree: Option<pb::Worktree>) -> Result<WorktreeInfo, Status> {
    let w = worktree.ok_or_else(|| Status::internal("response carried no worktree"))?;
    let status = match w.status.as_str() {
        "active" => WorktreeStatus::Active,
        "paused" => WorktreeStatus::Paused,
        "completed" => WorktreeStatus::Completed,
        "error" => WorktreeStatus::Error,
        other => return Err(Status::internal(format!("unknown worktree status {other}"))),
    };
    Ok(WorktreeInfo {
        id: w.id,
        name: w.name,
        branch: w.branch,
        path: w.path.into(),
        project_id: w.project_id,
        status,
        created_at_ms: w.created_at_ms,
    })
}

fn snapshot_from_pb(resp: pb::SessionStatusResponse) -> Result<SessionSnapshot, Status> {
    let kind = match resp.kind.as_str() {
        "pty" => SessionKind::Pty,
        "agent" => SessionKind::Agent,
        other => return Err(Status::internal(format!("unknown session kind {other}"))),
    };
    let status = match resp.status.as_str() {
        "starting" => SessionStatus::Starting,
        "running" => SessionStatus::Running,
        "stopped" => SessionStatus::Stopped,
        "error" => SessionStatus::Error,
        other => return Err(Status::internal(format!("unknown session status {other}"))),
    };
    let exit = (status.is_terminal()).then(|| ExitInfo {
        code: resp.exit_code,
        signal: resp.signal,
        error: resp.error,
    });
    Ok(SessionSnapshot {
        id: resp.session_id,
        kind,
        status,
        pid: resp.pid,
        exit,
    })
}

/// Something received on a session's push channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamItem {
    Output(Vec<u8>),
    Frame(ServerFrame),
}

pub struct SessionStream {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl SessionStream {
    /// Raw input bytes, sent as a binary message.
    pub async fn send_input(&mut self, data: &[u8]) -> Result<()> {
        self.ws.send(Message::binary(data.to_vec())).await?;
        Ok(())
    }

    pub async fn send_frame(&mut self, frame: &ClientFrame) -> Result<()> {
        let text = serde_json::to_string(frame).map_err(|e| ClientError::Protocol(e.to_string()))?;
        self.ws.send(Message::text(text)).await?;
        Ok(())
    }

    pub async fn resize(&mut self, cols: u16, rows: u16) -> Result<()> {
        self.send_frame(&ClientFrame::Resize { cols, rows }).await
    }

    pub async fn kill(&mut self) -> Result<()> {
        self.send_frame(&ClientFrame::Kill).await
    }

    /// Next output chunk or control frame; `None` once the server hangs up.
    pub async fn next(&mut self) -> Option<Result<StreamItem>> {
        loop {
            let msg = match self.ws.next().await? {
                Ok(msg) => msg,
                Err(e) => return Some(Err(e.into())),
            };
            match msg {
                Message::Binary(data) => return Some(Ok(StreamItem::Output(data.to_vec()))),
                Message::Text(text) => {
                    return Some(
                        serde_json::from_str::<ServerFrame>(text.as_str())
                            .map(StreamItem::Frame)
                            .map_err(|e| ClientError::Protocol(e.to_string())),
                    );
                }
                Message::Close(_) => return None,
                _ => continue,
            }
        }
    }

    pub async fn close(mut self) -> Result<()> {
        self.ws.close(None).await?;
        Ok(())
    }
}
