//! WebSocket endpoints: the `/ws/app` broadcast channel and the per-worker
//! stream at `/ws/session/{sid}/worker/{wid}`.
//!
//! The app channel sends three sync messages on connect and only then joins
//! the broadcast, so a client can never see a delete for a session it never
//! learned about. The worker channel restores hibernated workers on attach,
//! replays history, and coalesces PTY output into 50 ms batches per
//! connection; exit/activity/history/error messages bypass the batch.

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::StreamExt;
use futures_util::SinkExt;
use serde_json::json;

use common::error::ErrorCode;
use common::lifecycle::RestoreOutcome;
use common::session::AppEvent;
use common::worker::{WorkerEvent, WorkerKind};

use crate::web_server::AppState;

/// Client → server messages on the worker channel.
#[derive(Debug, serde::Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum ClientMessage {
    Input { data: String },
    Resize { cols: u16, rows: u16 },
    RequestHistory,
    SetBaseCommit { commit: String },
}

fn app_event_json(event: &AppEvent) -> serde_json::Value {
    match event {
        AppEvent::SessionCreated(s) => json!({"type": "session-created", "session": s}),
        AppEvent::SessionUpdated(s) => json!({"type": "session-updated", "session": s}),
        AppEvent::SessionDeleted { session_id } => {
            json!({"type": "session-deleted", "sessionId": session_id})
        }
        AppEvent::WorkerActivated {
            session_id,
            worker_id,
        } => json!({"type": "worker-activated", "sessionId": session_id, "workerId": worker_id}),
        AppEvent::WorkerActivity {
            session_id,
            worker_id,
            activity_state,
        } => json!({
            "type": "worker-activity",
            "sessionId": session_id,
            "workerId": worker_id,
            "activityState": activity_state,
        }),
        AppEvent::AgentCreated(a) => json!({"type": "agent-created", "agent": a}),
        AppEvent::AgentUpdated(a) => json!({"type": "agent-updated", "agent": a}),
        AppEvent::AgentDeleted { agent_id } => {
            json!({"type": "agent-deleted", "agentId": agent_id})
        }
        AppEvent::RepositoryCreated(r) => json!({"type": "repository-created", "repository": r}),
        AppEvent::RepositoryUpdated(r) => json!({"type": "repository-updated", "repository": r}),
        AppEvent::RepositoryDeleted { repository_id } => {
            json!({"type": "repository-deleted", "repositoryId": repository_id})
        }
    }
}

async fn send_json(socket: &mut WebSocket, value: serde_json::Value) -> bool {
    socket
        .send(Message::Text(value.to_string().into()))
        .await
        .is_ok()
}

/// `/ws/app`: sync snapshots, then the live broadcast until the socket dies.
pub async fn handle_app_socket(mut socket: WebSocket, state: AppState) {
    let sessions = state.sessions.list_public();
    if !send_json(&mut socket, json!({"type": "sessions-sync", "sessions": sessions})).await {
        return;
    }
    let agents = state.agents.list();
    if !send_json(&mut socket, json!({"type": "agents-sync", "agents": agents})).await {
        return;
    }
    let repositories = state
        .db
        .with(common::db::list_repositories)
        .unwrap_or_default();
    if !send_json(
        &mut socket,
        json!({"type": "repositories-sync", "repositories": repositories}),
    )
    .await
    {
        return;
    }

    let mut events = state.sessions.subscribe_events();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(ev) => {
                    if !send_json(&mut socket, app_event_json(&ev)).await {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(missed = n, "app channel client lagged behind broadcasts");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            msg = socket.recv() => match msg {
                // Broadcast-only sink: inbound frames are ignored, closure ends us.
                Some(Ok(_)) => {}
                _ => break,
            },
        }
    }
}

async fn send_error(socket: &mut WebSocket, code: ErrorCode, message: &str) {
    let _ = send_json(
        socket,
        json!({"type": "error", "code": code, "message": message}),
    )
    .await;
}

/// Build the history message for a worker: the scrollback tail under a
/// deadline, the in-memory ring on timeout or read failure, and a
/// `HISTORY_LOAD_FAILED` error message when both are gone.
async fn history_message(
    state: &AppState,
    session_id: &str,
    worker_id: &str,
    timeout: std::time::Duration,
) -> serde_json::Value {
    let load = state.lifecycle.get_worker_output_history(
        session_id,
        worker_id,
        Some(0),
        Some(state.config.initial_history_lines),
    );
    match tokio::time::timeout(timeout, load).await {
        Ok(Ok(Some(history))) => {
            let data = String::from_utf8_lossy(&history.data).into_owned();
            json!({"type": "history", "data": data, "offset": history.offset})
        }
        other => {
            match &other {
                Ok(Err(e)) => {
                    tracing::warn!(session_id, worker_id, error = %e, "history load failed")
                }
                Err(_) => tracing::warn!(session_id, worker_id, "history load timed out"),
                Ok(Ok(_)) => {}
            }
            match state.lifecycle.get_worker_ring_buffer(session_id, worker_id) {
                Some(ring) => {
                    let data = String::from_utf8_lossy(&ring).into_owned();
                    json!({"type": "history", "data": data})
                }
                None => json!({
                    "type": "error",
                    "code": ErrorCode::HistoryLoadFailed,
                    "message": "could not load worker history",
                }),
            }
        }
    }
}

/// `/ws/session/{sid}/worker/{wid}`: restore, attach, replay, stream.
pub async fn handle_worker_socket(
    mut socket: WebSocket,
    state: AppState,
    session_id: String,
    worker_id: String,
) {
    let Some(worker) = state.lifecycle.get_worker(&session_id, &worker_id) else {
        send_error(&mut socket, ErrorCode::WorkerNotFound, "worker not found").await;
        let _ = send_json(
            &mut socket,
            json!({"type": "exit", "exitCode": 1, "signal": null}),
        )
        .await;
        return;
    };

    // Git-diff workers have no PTY stream; only the base commit is mutable.
    if matches!(worker.kind, WorkerKind::GitDiff(_)) {
        handle_git_diff_socket(socket, worker).await;
        return;
    }
    drop(worker);

    match state.lifecycle.restore_worker(&session_id, &worker_id).await {
        Ok(RestoreOutcome::Ready { .. }) => {}
        Ok(RestoreOutcome::Failed(code)) => {
            send_error(&mut socket, code, "could not attach worker").await;
            let _ = send_json(
                &mut socket,
                json!({"type": "exit", "exitCode": 1, "signal": null}),
            )
            .await;
            return;
        }
        Err(e) => {
            tracing::error!(session_id, worker_id, error = %e, "restore failed");
            send_error(&mut socket, ErrorCode::ActivationFailed, "could not attach worker").await;
            return;
        }
    }

    let Some((connection_id, mut events)) =
        state.lifecycle.attach_worker_callbacks(&session_id, &worker_id)
    else {
        send_error(&mut socket, ErrorCode::WorkerNotFound, "worker not found").await;
        return;
    };

    let initial = history_message(
        &state,
        &session_id,
        &worker_id,
        state.config.initial_history_timeout,
    )
    .await;
    if !send_json(&mut socket, initial).await {
        state
            .lifecycle
            .detach_worker_callbacks(&session_id, &worker_id, &connection_id);
        return;
    }
    if let Some(activity) = state.lifecycle.get_activity_state(&session_id, &worker_id) {
        if activity != common::activity::ActivityState::Unknown {
            let _ = send_json(&mut socket, json!({"type": "activity", "state": activity})).await;
        }
    }

    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut out_buf: Vec<u8> = Vec::new();
    let mut flush = tokio::time::interval(state.config.ws_output_flush_interval);
    flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    'pump: loop {
        tokio::select! {
            _ = flush.tick() => {
                if !out_buf.is_empty() {
                    let data = String::from_utf8_lossy(&out_buf).into_owned();
                    out_buf.clear();
                    let msg = json!({"type": "output", "data": data}).to_string();
                    if ws_tx.send(Message::Text(msg.into())).await.is_err() {
                        break 'pump;
                    }
                }
            }
            event = events.recv() => match event {
                Some(WorkerEvent::Output(bytes)) => {
                    out_buf.extend_from_slice(&bytes);
                    if out_buf.len() >= state.config.ws_output_flush_threshold {
                        let data = String::from_utf8_lossy(&out_buf).into_owned();
                        out_buf.clear();
                        let msg = json!({"type": "output", "data": data}).to_string();
                        if ws_tx.send(Message::Text(msg.into())).await.is_err() {
                            break 'pump;
                        }
                    }
                }
                Some(WorkerEvent::Exit { exit_code, signal }) => {
                    if !out_buf.is_empty() {
                        let data = String::from_utf8_lossy(&out_buf).into_owned();
                        out_buf.clear();
                        let msg = json!({"type": "output", "data": data}).to_string();
                        let _ = ws_tx.send(Message::Text(msg.into())).await;
                    }
                    let msg = json!({"type": "exit", "exitCode": exit_code, "signal": signal}).to_string();
                    let _ = ws_tx.send(Message::Text(msg.into())).await;
                }
                Some(WorkerEvent::Activity(activity)) => {
                    let msg = json!({"type": "activity", "state": activity}).to_string();
                    if ws_tx.send(Message::Text(msg.into())).await.is_err() {
                        break 'pump;
                    }
                }
                None => break 'pump,
            },
            msg = ws_rx.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(t))) => t,
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break 'pump,
                    Some(Ok(_)) => continue,
                };
                let parsed: ClientMessage = match serde_json::from_str(&text) {
                    Ok(m) => m,
                    Err(e) => {
                        tracing::debug!(session_id, worker_id, error = %e, "ignoring malformed worker message");
                        continue;
                    }
                };
                match parsed {
                    ClientMessage::Input { data } => {
                        state
                            .lifecycle
                            .write_worker_input(&session_id, &worker_id, data.into_bytes())
                            .await;
                    }
                    ClientMessage::Resize { cols, rows } => {
                        state.lifecycle.resize_worker(&session_id, &worker_id, cols, rows);
                    }
                    ClientMessage::RequestHistory => {
                        let reply = history_message(
                            &state,
                            &session_id,
                            &worker_id,
                            state.config.request_history_timeout,
                        )
                        .await;
                        if ws_tx.send(Message::Text(reply.to_string().into())).await.is_err() {
                            break 'pump;
                        }
                    }
                    ClientMessage::SetBaseCommit { .. } => {
                        // Only meaningful for git-diff workers.
                    }
                }
            }
        }
    }

    // Detach this connection only; other tabs stay attached.
    state
        .lifecycle
        .detach_worker_callbacks(&session_id, &worker_id, &connection_id);
}

/// Minimal loop for git-diff workers: accept `set-base-commit`, ignore the rest.
async fn handle_git_diff_socket(mut socket: WebSocket, worker: std::sync::Arc<common::worker::Worker>) {
    while let Some(Ok(msg)) = socket.recv().await {
        let Message::Text(text) = msg else { continue };
        let Ok(parsed) = serde_json::from_str::<ClientMessage>(&text) else {
            continue;
        };
        if let ClientMessage::SetBaseCommit { commit } = parsed {
            if let WorkerKind::GitDiff(g) = &worker.kind {
                g.set_base_commit(commit);
            }
        }
    }
}
