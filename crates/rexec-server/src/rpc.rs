//! gRPC request/response endpoints. Each method authenticates, validates
//! required fields, delegates to a manager and maps the outcome onto the
//! transport error taxonomy. Mutating calls record one audit event.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rexec_git::RemoveTarget;
use rexec_git::paths::normalize;
use rexec_proto::v1 as pb;
use rexec_proto::v1::exec_server::{Exec, ExecServer};
use rexec_protocol::{SessionKind, SessionSnapshot, WorktreeChanges, WorktreeInfo};
use tonic::{Request, Response, Status};

use librexec::{AgentStartOptions, PtyStartOptions};

use crate::audit::{AuditEvent, actions};
use crate::auth::Identity;
use crate::error::ApiError;
use crate::state::AppState;

const TRANSPORT: &str = "rpc";

#[derive(Clone)]
pub struct ExecService {
    state: Arc<AppState>,
}

impl ExecService {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    pub fn into_server(self) -> ExecServer<Self> {
        ExecServer::new(self)
    }

    fn authorize<T>(&self, request: &Request<T>, method: &str) -> Result<Identity, Status> {
        let header = request
            .metadata()
            .get("authorization")
            .and_then(|v| v.to_str().ok());
        self.state
            .authenticate(header, method, TRANSPORT)
            .map_err(|e| ApiError::from(e).into_status())
    }

    /// Record the audit event for a mutating call, then surface its result.
    fn finish<T>(&self, mut event: AuditEvent, result: Result<T, ApiError>) -> Result<T, Status> {
        event.success = result.is_ok();
        if let Err(err) = &result {
            event = event.with("error", err.code().as_str());
        }
        self.state.audit.record(event.with("transport", TRANSPORT));
        result.map_err(ApiError::into_status)
    }
}

fn required<'a>(value: &'a str, field: &str) -> Result<&'a str, ApiError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ApiError::missing(field));
    }
    Ok(value)
}

fn optional_path(value: &str) -> Option<PathBuf> {
    let value = value.trim();
    (!value.is_empty()).then(|| PathBuf::from(value))
}

/// `0` means "use the default".
fn dimension(value: u32, field: &str) -> Result<Option<u16>, ApiError> {
    match value {
        0 => Ok(None),
        v => u16::try_from(v)
            .map(Some)
            .map_err(|_| ApiError::InvalidArgument(format!("{field} out of range: {v}"))),
    }
}

fn display(path: &Path) -> String {
    normalize(path).display().to_string()
}

fn worktree_to_pb(info: WorktreeInfo) -> pb::Worktree {
    pb::Worktree {
        id: info.id,
        name: info.name,
        branch: info.branch,
        path: info.path.display().to_string(),
        project_id: info.project_id,
        status: info.status.as_str().to_string(),
        created_at_ms: info.created_at_ms,
    }
}

fn changes_to_pb(changes: WorktreeChanges) -> pb::WorktreeStatusResponse {
    pb::WorktreeStatusResponse {
        staged: changes.staged,
        unstaged: changes.unstaged,
        untracked: changes.untracked,
        has_changes: changes.has_changes,
    }
}

fn snapshot_to_pb(snapshot: SessionSnapshot) -> pb::SessionStatusResponse {
    let exit = snapshot.exit.unwrap_or_default();
    pb::SessionStatusResponse {
        session_id: snapshot.id,
        kind: snapshot.kind.as_str().to_string(),
        status: snapshot.status.as_str().to_string(),
        pid: snapshot.pid,
        exit_code: exit.code,
        signal: exit.signal,
        error: exit.error,
    }
}

#[tonic::async_trait]
impl Exec for ExecService {
    async fn create_worktree(
        &self,
        request: Request<pb::CreateWorktreeRequest>,
    ) -> Result<Response<pb::WorktreeResponse>, Status> {
        let identity = self.authorize(&request, "CreateWorktree")?;
        let req = request.into_inner();
        let event = AuditEvent::new(
            &identity.subject,
            actions::WORKTREE_CREATE,
            display(Path::new(&req.project_path)),
            true,
        )
        .with("name", &req.name)
        .with("project_id", &req.project_id);

        let result: Result<_, ApiError> = async {
            let project = required(&req.project_path, "project_path")?;
            let name = required(&req.name, "name")?;
            Ok(self
                .state
                .worktrees
                .create(Path::new(project), name, &req.project_id)
                .await?)
        }
        .await;

        let event = match &result {
            Ok(info) => event.with("path", info.path.display().to_string()),
            Err(_) => event,
        };
        let info = self.finish(event, result)?;
        Ok(Response::new(pb::WorktreeResponse {
            worktree: Some(worktree_to_pb(info)),
        }))
    }

    async fn create_worktree_from_branch(
        &self,
        request: Request<pb::CreateWorktreeFromBranchRequest>,
    ) -> Result<Response<pb::WorktreeResponse>, Status> {
        let identity = self.authorize(&request, "CreateWorktreeFromBranch")?;
        let req = request.into_inner();
        let event = AuditEvent::new(
            &identity.subject,
            actions::WORKTREE_CREATE,
            display(Path::new(&req.project_path)),
            true,
        )
        .with("branch", &req.branch)
        .with("project_id", &req.project_id);

        let result: Result<_, ApiError> = async {
            let project = required(&req.project_path, "project_path")?;
            let branch = required(&req.branch, "branch")?;
            Ok(self
                .state
                .worktrees
                .create_from_branch(Path::new(project), &req.name, &req.project_id, branch)
                .await?)
        }
        .await;

        let event = match &result {
            Ok(info) => event.with("path", info.path.display().to_string()),
            Err(_) => event,
        };
        let info = self.finish(event, result)?;
        Ok(Response::new(pb::WorktreeResponse {
            worktree: Some(worktree_to_pb(info)),
        }))
    }

    async fn list_worktrees(
        &self,
        request: Request<pb::ListWorktreesRequest>,
    ) -> Result<Response<pb::ListWorktreesResponse>, Status> {
        self.authorize(&request, "ListWorktrees")?;
        let req = request.into_inner();
        let project = required(&req.project_path, "project_path")?;
        let worktrees = self
            .state
            .worktrees
            .list(Path::new(project), &req.project_id)
            .await
            .map_err(|e| ApiError::from(e).into_status())?;
        Ok(Response::new(pb::ListWorktreesResponse {
            worktrees: worktrees.into_iter().map(worktree_to_pb).collect(),
        }))
    }

    async fn remove_worktree(
        &self,
        request: Request<pb::RemoveWorktreeRequest>,
    ) -> Result<Response<pb::WorktreeResponse>, Status> {
        let identity = self.authorize(&request, "RemoveWorktree")?;
        let req = request.into_inner();
        let resource = match optional_path(&req.worktree_path) {
            Some(path) => display(&path),
            None if !req.worktree_id.is_empty() => req.worktree_id.clone(),
            None => req.branch.clone(),
        };
        let event = AuditEvent::new(&identity.subject, actions::WORKTREE_REMOVE, resource, true)
            .with("project", display(Path::new(&req.project_path)));

        let result: Result<_, ApiError> = async {
            let project = required(&req.project_path, "project_path")?;
            let target = RemoveTarget {
                path: optional_path(&req.worktree_path),
                id: Some(req.worktree_id.trim().to_string()).filter(|s| !s.is_empty()),
                branch: Some(req.branch.trim().to_string()).filter(|s| !s.is_empty()),
            };
            if target.path.is_none() && target.id.is_none() && target.branch.is_none() {
                return Err(ApiError::InvalidArgument(
                    "one of worktree_path, worktree_id or branch is required".to_string(),
                ));
            }
            Ok(self.state.worktrees.remove(Path::new(project), target).await?)
        }
        .await;

        let info = self.finish(event, result)?;
        Ok(Response::new(pb::WorktreeResponse {
            worktree: Some(worktree_to_pb(info)),
        }))
    }

    async fn get_worktree_status(
        &self,
        request: Request<pb::GetWorktreeStatusRequest>,
    ) -> Result<Response<pb::WorktreeStatusResponse>, Status> {
        self.authorize(&request, "GetWorktreeStatus")?;
        let req = request.into_inner();
        let path = PathBuf::from(required(&req.worktree_path, "worktree_path")?);
        let worktrees = self.state.worktrees.clone();
        let changes = tokio::task::spawn_blocking(move || worktrees.get_status(&path))
            .await
            .map_err(|e| ApiError::Internal(format!("status task failed: {e}")).into_status())?
            .map_err(|e| ApiError::from(e).into_status())?;
        Ok(Response::new(changes_to_pb(changes)))
    }

    async fn start_agent(
        &self,
        request: Request<pb::StartAgentRequest>,
    ) -> Result<Response<pb::StartSessionResponse>, Status> {
        let identity = self.authorize(&request, "StartAgent")?;
        let req = request.into_inner();
        let key = librexec::agent_key(req.agent.trim(), req.workspace_id.trim());
        let event = AuditEvent::new(
            &identity.subject,
            actions::SESSION_START,
            SessionKind::Agent.topic(&key),
            true,
        )
        .with("command", &req.command);

        let result: Result<_, ApiError> = async {
            let options = AgentStartOptions {
                agent: required(&req.agent, "agent")?.to_string(),
                workspace_id: required(&req.workspace_id, "workspace_id")?.to_string(),
                command: required(&req.command, "command")?.to_string(),
                args: req.args.clone(),
                cwd: optional_path(&req.cwd),
                env: req.env.clone(),
            };
            Ok(self.state.agents.start(options).await?)
        }
        .await;

        let session_id = self.finish(event, result)?;
        Ok(Response::new(pb::StartSessionResponse { session_id }))
    }

    async fn send_agent_message(
        &self,
        request: Request<pb::SendAgentMessageRequest>,
    ) -> Result<Response<pb::Ack>, Status> {
        let identity = self.authorize(&request, "SendAgentMessage")?;
        let req = request.into_inner();
        let event = AuditEvent::new(
            &identity.subject,
            actions::SESSION_INPUT,
            SessionKind::Agent.topic(req.session_id.trim()),
            true,
        )
        .with("bytes", req.text.len().to_string());

        let result: Result<_, ApiError> = async {
            let id = required(&req.session_id, "session_id")?;
            Ok(self.state.agents.send_message(id, &req.text).await?)
        }
        .await;

        self.finish(event, result)?;
        Ok(Response::new(pb::Ack {}))
    }

    async fn stop_agent(
        &self,
        request: Request<pb::SessionRequest>,
    ) -> Result<Response<pb::SessionStatusResponse>, Status> {
        let identity = self.authorize(&request, "StopAgent")?;
        let req = request.into_inner();
        let event = AuditEvent::new(
            &identity.subject,
            actions::SESSION_STOP,
            SessionKind::Agent.topic(req.session_id.trim()),
            true,
        );

        let result: Result<_, ApiError> = async {
            let id = required(&req.session_id, "session_id")?;
            Ok(self.state.agents.stop(id).await?)
        }
        .await;

        let snapshot = self.finish(event, result)?;
        Ok(Response::new(snapshot_to_pb(snapshot)))
    }

    async fn get_agent_status(
        &self,
        request: Request<pb::SessionRequest>,
    ) -> Result<Response<pb::SessionStatusResponse>, Status> {
        self.authorize(&request, "GetAgentStatus")?;
        let req = request.into_inner();
        let id = required(&req.session_id, "session_id")?;
        let snapshot = self
            .state
            .agents
            .status(id)
            .map_err(|e| ApiError::from(e).into_status())?;
        Ok(Response::new(snapshot_to_pb(snapshot)))
    }

    async fn start_pty(
        &self,
        request: Request<pb::StartPtyRequest>,
    ) -> Result<Response<pb::StartSessionResponse>, Status> {
        let identity = self.authorize(&request, "StartPty")?;
        let req = request.into_inner();
        let event = AuditEvent::new(
            &identity.subject,
            actions::SESSION_START,
            SessionKind::Pty.topic(req.session_id.trim()),
            true,
        )
        .with("shell", &req.shell);

        let result: Result<_, ApiError> = async {
            let options = PtyStartOptions {
                id: required(&req.session_id, "session_id")?.to_string(),
                cwd: optional_path(&req.cwd),
                shell: Some(req.shell.trim().to_string()).filter(|s| !s.is_empty()),
                env: req.env.clone(),
                cols: dimension(req.cols, "cols")?,
                rows: dimension(req.rows, "rows")?,
            };
            Ok(self.state.pty.start(options).await?)
        }
        .await;

        let session_id = self.finish(event, result)?;
        Ok(Response::new(pb::StartSessionResponse { session_id }))
    }

    async fn write_pty(
        &self,
        request: Request<pb::WritePtyRequest>,
    ) -> Result<Response<pb::Ack>, Status> {
        let identity = self.authorize(&request, "WritePty")?;
        let req = request.into_inner();
        let event = AuditEvent::new(
            &identity.subject,
            actions::SESSION_INPUT,
            SessionKind::Pty.topic(req.session_id.trim()),
            true,
        )
        .with("bytes", req.data.len().to_string());

        let result = required(&req.session_id, "session_id")
            .and_then(|id| Ok(self.state.pty.write(id, &req.data)?));

        self.finish(event, result)?;
        Ok(Response::new(pb::Ack {}))
    }

    async fn resize_pty(
        &self,
        request: Request<pb::ResizePtyRequest>,
    ) -> Result<Response<pb::Ack>, Status> {
        let identity = self.authorize(&request, "ResizePty")?;
        let req = request.into_inner();
        let event = AuditEvent::new(
            &identity.subject,
            actions::SESSION_RESIZE,
            SessionKind::Pty.topic(req.session_id.trim()),
            true,
        )
        .with("cols", req.cols.to_string())
        .with("rows", req.rows.to_string());

        let result = required(&req.session_id, "session_id").and_then(|id| {
            let cols = u16::try_from(req.cols)
                .map_err(|_| ApiError::InvalidArgument(format!("cols out of range: {}", req.cols)))?;
            let rows = u16::try_from(req.rows)
                .map_err(|_| ApiError::InvalidArgument(format!("rows out of range: {}", req.rows)))?;
            Ok(self.state.pty.resize(id, cols, rows)?)
        });

        self.finish(event, result)?;
        Ok(Response::new(pb::Ack {}))
    }

    async fn kill_pty(
        &self,
        request: Request<pb::SessionRequest>,
    ) -> Result<Response<pb::Ack>, Status> {
        let identity = self.authorize(&request, "KillPty")?;
        let req = request.into_inner();
        let event = AuditEvent::new(
            &identity.subject,
            actions::SESSION_STOP,
            SessionKind::Pty.topic(req.session_id.trim()),
            true,
        );

        let result: Result<_, ApiError> = async {
            let id = required(&req.session_id, "session_id")?;
            Ok(self.state.pty.kill(id).await?)
        }
        .await;

        self.finish(event, result)?;
        Ok(Response::new(pb::Ack {}))
    }
}
