/// Session Orchestrator - the WebSocket endpoint driving one execution
///
/// Per-connection state machine:
///
/// ```text
///  AWAIT_FIRST ──(execute + valid token)──► VALIDATING ──► VALIDATED
///    │ (bad msg | 5s timeout → 1008)              (rejected → 1003)
///    ▼
///  RUNNING ──(terminal event on bus)──► CLOSING (1000)
///    └──(socket closed early)──► CANCELLING: flag the executor, await
///       the terminal event for a bounded deadline, then return
/// ```
///
/// The orchestrator subscribes to both job topics before the executor
/// launches, forwards every bus message to the socket verbatim, and feeds
/// `input` frames through a bounded bridge into the PTY loop's queue.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crucible_common::types::{validate_code, BusMessage, Language};

use crate::bus::MessageBus;
use crate::execution::{self, retry_bus, retry_store};
use crate::store::JobStore;
use crate::AppState;

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_UNSUPPORTED: u16 = 1003;
pub const CLOSE_POLICY: u16 = 1008;
pub const CLOSE_INTERNAL: u16 = 1011;

/// Wait for the execute frame; prevents connection camping.
const FIRST_MESSAGE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a cancelled session waits for the executor's terminal event.
const CANCEL_DEADLINE: Duration = Duration::from_secs(3);

/// Bounded capacity of the client → executor input bridge.
const INPUT_QUEUE_CAPACITY: usize = 64;

/// Frames the client may send.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ClientFrame {
    Execute {
        #[serde(rename = "jobId")]
        job_id: String,
        #[serde(rename = "jobToken")]
        job_token: String,
        code: String,
        language: String,
    },
    Input {
        data: String,
    },
}

/// GET /ws/execute
pub async fn ws_execute(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_session(socket, state))
}

async fn handle_session(mut socket: WebSocket, state: Arc<AppState>) {
    debug!("WebSocket connection accepted, waiting for execute message");

    // AWAIT_FIRST: exactly one execute frame within the deadline.
    let first = match timeout(FIRST_MESSAGE_TIMEOUT, socket.recv()).await {
        Ok(Some(Ok(Message::Text(text)))) => text,
        Ok(Some(Ok(Message::Close(_)))) | Ok(None) | Ok(Some(Err(_))) => return,
        Ok(Some(Ok(_))) => {
            close_with(&mut socket, CLOSE_POLICY, "expected a text frame").await;
            return;
        }
        Err(_) => {
            close_with(&mut socket, CLOSE_POLICY, "timed out waiting for execute message").await;
            return;
        }
    };

    let Ok(ClientFrame::Execute {
        job_id,
        job_token,
        code,
        language,
    }) = serde_json::from_str::<ClientFrame>(&first)
    else {
        close_with(&mut socket, CLOSE_POLICY, "first message must be an execute frame").await;
        return;
    };

    let Ok(job_id) = Uuid::parse_str(&job_id) else {
        close_with(&mut socket, CLOSE_POLICY, "malformed job id").await;
        return;
    };

    // Token consumption is single-shot: a replayed token dies here.
    match retry_store(|| state.store.consume_token(&job_token)).await {
        Ok(Some(bound)) if bound == job_id => {}
        Ok(_) => {
            send_error(&mut socket, "invalid or already used job token").await;
            close_with(&mut socket, CLOSE_POLICY, "authentication failed").await;
            return;
        }
        Err(e) => {
            warn!(job_id = %job_id, error = %e, "Token consumption failed");
            send_error(&mut socket, "internal error").await;
            close_with(&mut socket, CLOSE_INTERNAL, "store unavailable").await;
            return;
        }
    }
    info!(job_id = %job_id, "Session authenticated");

    // VALIDATING: language tag, size bound, then the syntax-tree screen.
    let Some(language) = Language::from_str(&language) else {
        reject(&mut socket, &state, job_id, "unsupported language").await;
        return;
    };
    if let Err(e) = validate_code(&code, state.settings.max_code_bytes) {
        reject(&mut socket, &state, job_id, &e.to_string()).await;
        return;
    }
    if let Err(rejection) = crate::validator::validate(language, &code) {
        info!(job_id = %job_id, reason = %rejection, "Submission rejected");
        reject(
            &mut socket,
            &state,
            job_id,
            &format!("code validation failed: {}", rejection),
        )
        .await;
        return;
    }

    // The record is authoritative for the on-disk filename.
    let filename = match retry_store(|| state.store.get(job_id)).await {
        Ok(Some(job)) => job.filename,
        Ok(None) => {
            close_with(&mut socket, CLOSE_POLICY, "unknown or expired job").await;
            return;
        }
        Err(e) => {
            warn!(job_id = %job_id, error = %e, "Job lookup failed");
            send_error(&mut socket, "internal error").await;
            close_with(&mut socket, CLOSE_INTERNAL, "store unavailable").await;
            return;
        }
    };

    // Subscribe before the executor can publish anything.
    let mut subscription = match retry_bus(|| state.bus.subscribe(job_id)).await {
        Ok(subscription) => subscription,
        Err(e) => {
            warn!(job_id = %job_id, error = %e, "Bus subscription failed");
            send_error(&mut socket, "internal error").await;
            close_with(&mut socket, CLOSE_INTERNAL, "bus unavailable").await;
            return;
        }
    };

    // RUNNING: input bridge, cancel flag, executor on a background worker.
    let (input_tx, mut input_rx) = mpsc::channel::<String>(INPUT_QUEUE_CAPACITY);
    let (sync_tx, sync_rx) = std::sync::mpsc::channel::<Vec<u8>>();
    let bridge = tokio::spawn(async move {
        while let Some(line) = input_rx.recv().await {
            if sync_tx.send(line.into_bytes()).is_err() {
                break;
            }
        }
    });
    let cancel = Arc::new(AtomicBool::new(false));

    tokio::spawn(execution::run_job(
        state.store.clone(),
        state.bus.clone(),
        state.settings.clone(),
        job_id,
        code,
        language,
        filename,
        sync_rx,
        cancel.clone(),
    ));

    let mut client_gone = false;
    let mut failed = false;
    loop {
        tokio::select! {
            message = subscription.recv() => match message {
                Some(message) => {
                    let terminal = message.is_terminal();
                    failed = matches!(message, BusMessage::Error { .. });
                    let payload = match serde_json::to_string(&message) {
                        Ok(payload) => payload,
                        Err(e) => {
                            warn!(job_id = %job_id, error = %e, "Unserializable bus message");
                            continue;
                        }
                    };
                    if socket.send(Message::Text(payload.into())).await.is_err() {
                        client_gone = true;
                        break;
                    }
                    if terminal {
                        break;
                    }
                }
                None => {
                    // Publisher vanished without a terminal event.
                    send_error(&mut socket, "execution stream interrupted").await;
                    close_with(&mut socket, CLOSE_INTERNAL, "stream interrupted").await;
                    client_gone = true;
                    break;
                }
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ClientFrame>(&text) {
                        Ok(ClientFrame::Input { data }) => {
                            if data.len() > state.settings.max_code_bytes {
                                send_error(&mut socket, "input frame too large").await;
                                continue;
                            }
                            debug!(job_id = %job_id, bytes = data.len(), "Queueing input");
                            // A send error means the executor already
                            // finished; the terminal event is on its way.
                            let _ = input_tx.send(data).await;
                        }
                        _ => {
                            close_with(
                                &mut socket,
                                CLOSE_POLICY,
                                "only input frames are accepted after execute",
                            )
                            .await;
                            client_gone = true;
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => {
                    client_gone = true;
                    break;
                }
                Some(Ok(_)) => {} // ping/pong noise
            },
        }
    }

    if client_gone {
        // CANCELLING: stop the executor, then give its terminal event a
        // bounded window so the job record still resolves.
        info!(job_id = %job_id, "Client gone, cancelling execution");
        cancel.store(true, Ordering::Relaxed);
        let _ = timeout(CANCEL_DEADLINE, async {
            while let Some(message) = subscription.recv().await {
                if message.is_terminal() {
                    break;
                }
            }
        })
        .await;
    } else if failed {
        info!(job_id = %job_id, "Execution failed, closing session");
        close_with(&mut socket, CLOSE_INTERNAL, "execution failed").await;
    } else {
        info!(job_id = %job_id, "Execution finished, closing session");
        close_with(&mut socket, CLOSE_NORMAL, "execution finished").await;
    }

    drop(input_tx);
    let _ = bridge.await;
}

/// Validation rejection: error frame, `failed` record, close 1003.
async fn reject(socket: &mut WebSocket, state: &AppState, job_id: Uuid, reason: &str) {
    if let Err(e) = retry_store(|| state.store.mark_failed(job_id, reason, None)).await {
        warn!(job_id = %job_id, error = %e, "Could not record rejection");
    }
    send_error(socket, reason).await;
    close_with(socket, CLOSE_UNSUPPORTED, "validation rejected").await;
}

async fn send_error(socket: &mut WebSocket, message: &str) {
    let frame = BusMessage::Error {
        message: message.to_string(),
    };
    if let Ok(payload) = serde_json::to_string(&frame) {
        if let Err(e) = socket.send(Message::Text(payload.into())).await {
            debug!(error = %e, "Error frame not delivered");
        }
    }
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: &str) {
    let frame = CloseFrame {
        code,
        reason: reason.to_string().into(),
    };
    if let Err(e) = socket.send(Message::Close(Some(frame))).await {
        debug!(error = %e, "Close frame not delivered");
    }
}
