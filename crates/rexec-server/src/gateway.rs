//! Push channel: one websocket per session. Output leaves as binary
//! messages, exit and errors as JSON text; input, resize and kill come back
//! in. Closing the socket never kills the session.

use anyhow::Result;
use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use futures_util::{Sink, SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use rexec_protocol::{
    ClientFrame, Event, ExitInfo, ServerFrame, SessionKind, SessionSnapshot, SessionStatus,
};

use crate::audit::{AuditEvent, actions};
use crate::auth::Identity;
use crate::error::ApiError;
use crate::state::AppState;

const TRANSPORT: &str = "stream";

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/stream/{kind}/{id}", get(stream_session))
        .with_state(state)
}

fn parse_kind(kind: &str) -> Option<SessionKind> {
    match kind {
        "pty" => Some(SessionKind::Pty),
        "agent" => Some(SessionKind::Agent),
        _ => None,
    }
}

/// The session the connection is bound to.
struct Target {
    kind: SessionKind,
    id: String,
    identity: Identity,
}

impl Target {
    fn resource(&self) -> String {
        self.kind.topic(&self.id)
    }
}

async fn stream_session(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path((kind, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let Some(kind) = parse_kind(&kind) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let identity = match state.authenticate(header, &kind.topic(&id), TRANSPORT) {
        Ok(identity) => identity,
        Err(_) => return StatusCode::UNAUTHORIZED.into_response(),
    };

    let snapshot = match kind {
        SessionKind::Pty => state.pty.status(&id),
        SessionKind::Agent => state.agents.status(&id),
    };
    if let Err(status) = admit(snapshot.ok()) {
        return status.into_response();
    }
    // Subscribe before upgrading so nothing published in between is lost.
    let events = match kind {
        SessionKind::Pty => state.pty.subscribe(&id).ok(),
        SessionKind::Agent => state.agents.subscribe(&id).ok(),
    };

    let target = Target { kind, id, identity };
    ws.on_upgrade(move |socket| stream_task(socket, state, target, events))
}

/// Sessions still spawning have no topic yet; the caller retries.
fn admit(snapshot: Option<SessionSnapshot>) -> Result<(), StatusCode> {
    match snapshot {
        None => Err(StatusCode::NOT_FOUND),
        Some(s) if s.status == SessionStatus::Starting => Err(StatusCode::CONFLICT),
        Some(_) => Ok(()),
    }
}

async fn stream_task(
    socket: WebSocket,
    state: Arc<AppState>,
    target: Target,
    events: Option<broadcast::Receiver<Event>>,
) {
    info!(session = %target.resource(), actor = %target.identity.subject, "stream attached");
    if let Err(err) = stream_inner(socket, &state, &target, events).await {
        warn!(session = %target.resource(), "stream closed with error: {err}");
    }
    debug!(session = %target.resource(), "stream detached");
}

async fn stream_inner(
    socket: WebSocket,
    state: &AppState,
    target: &Target,
    events: Option<broadcast::Receiver<Event>>,
) -> Result<()> {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Already finished: replay the recorded exit and hang up.
    let Some(mut events) = events else {
        send_exit(&mut ws_tx, &retained_exit(state, target)).await?;
        return Ok(());
    };

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(Event::Output { data, .. }) => {
                    ws_tx.send(Message::Binary(data.into())).await?;
                }
                Ok(Event::Exit { exit, .. }) => {
                    send_exit(&mut ws_tx, &exit).await?;
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(session = %target.resource(), skipped, "stream subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    send_exit(&mut ws_tx, &retained_exit(state, target)).await?;
                    break;
                }
            },
            msg = ws_rx.next() => {
                let Some(msg) = msg else {
                    break;
                };
                match msg? {
                    Message::Binary(bytes) => {
                        let outcome = dispatch(state, target, ClientFrame::Input { data_b64: bytes.to_vec() }).await;
                        report(&mut ws_tx, outcome).await?;
                    }
                    Message::Text(text) => {
                        let outcome = match serde_json::from_str::<ClientFrame>(text.as_str()) {
                            Ok(frame) => dispatch(state, target, frame).await,
                            Err(e) => Err(ApiError::InvalidArgument(format!("invalid frame: {e}"))),
                        };
                        report(&mut ws_tx, outcome).await?;
                    }
                    Message::Ping(v) => ws_tx.send(Message::Pong(v)).await?,
                    Message::Pong(_) => {}
                    Message::Close(_) => break,
                }
            }
        }
    }

    let _ = ws_tx.close().await;
    Ok(())
}

/// Apply one inbound frame to the bound session.
async fn dispatch(state: &AppState, target: &Target, frame: ClientFrame) -> Result<(), ApiError> {
    let id = target.id.as_str();
    match (target.kind, frame) {
        (SessionKind::Pty, ClientFrame::Input { data_b64 }) => Ok(state.pty.write(id, &data_b64)?),
        (SessionKind::Agent, ClientFrame::Input { data_b64 }) => {
            Ok(state.agents.write_input(id, &data_b64).await?)
        }
        (SessionKind::Pty, ClientFrame::Resize { cols, rows }) => {
            Ok(state.pty.resize(id, cols, rows)?)
        }
        (SessionKind::Agent, ClientFrame::Resize { .. }) => Err(ApiError::Session(
            librexec::RexecError::FailedPrecondition(
                "agent sessions have no terminal to resize".to_string(),
            ),
        )),
        (kind, ClientFrame::Kill) => {
            let result: Result<(), ApiError> = match kind {
                SessionKind::Pty => state.pty.kill(id).await.map_err(Into::into),
                SessionKind::Agent => state.agents.stop(id).await.map(|_| ()).map_err(Into::into),
            };
            let mut event = AuditEvent::new(
                &target.identity.subject,
                actions::SESSION_STOP,
                target.resource(),
                result.is_ok(),
            )
            .with("transport", TRANSPORT);
            if let Err(err) = &result {
                event = event.with("error", err.code().as_str());
            }
            state.audit.record(event);
            result
        }
    }
}

/// Turn a rejected frame into an `error` frame; the connection stays open.
async fn report<S>(ws_tx: &mut S, outcome: Result<(), ApiError>) -> Result<()>
where
    S: Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let Err(err) = outcome else {
        return Ok(());
    };
    let (code, message) = err.to_error_code();
    let frame = ServerFrame::Error { code, message };
    ws_tx
        .send(Message::Text(serde_json::to_string(&frame)?.into()))
        .await?;
    Ok(())
}

async fn send_exit<S>(ws_tx: &mut S, exit: &ExitInfo) -> Result<()>
where
    S: Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let frame = ServerFrame::from(exit);
    ws_tx
        .send(Message::Text(serde_json::to_string(&frame)?.into()))
        .await?;
    Ok(())
}

fn retained_exit(state: &AppState, target: &Target) -> ExitInfo {
    let snapshot: Option<SessionSnapshot> = match target.kind {
        SessionKind::Pty => state.pty.status(&target.id).ok(),
        SessionKind::Agent => state.agents.status(&target.id).ok(),
    };
    snapshot.and_then(|s| s.exit).unwrap_or_default()
}
