//! Session handler: binds one WebSocket to one persistent session.
//!
//! Lifecycle of a connection:
//!
//! 1. `create_or_get` the session for the path's logical key.
//! 2. Bind (evicting any earlier connection), send `attached`, then the
//!    replay buffer as `output` frames.
//! 3. Race three tasks: session events → socket, socket → process input,
//!    and a ping heartbeat. The first to finish ends the connection.
//! 4. Release the binding. The session itself is never closed here; it
//!    lives on in the registry until closed explicitly or swept as idle.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::{IntoResponse, Response},
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tb_core::types::CloseReason;
use tb_session::registry::validate_logical_key;
use tb_session::session::{Binding, Session, SessionEvent};
use tb_telemetry::tracing_setup::{connection_span, generate_connection_id};
use tracing::{debug, info, warn, Instrument};

use crate::api_error::ApiError;
use crate::http_api::BridgeState;
use crate::protocol::{decode_client, max_frame_bytes, ClientMessage, ErrorCode, ServerMessage};

/// Largest `output` frame used when replaying history.
const REPLAY_FRAME_BYTES: usize = 16 * 1024;

type WsSender = Arc<tokio::sync::Mutex<SplitSink<WebSocket, Message>>>;

/// How a bound connection came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ended {
    /// The client closed the socket or the socket failed.
    ClientGone,
    /// The process exited and `exit` was delivered.
    ProcessExited,
    /// The session cut this binding.
    Detached(CloseReason),
}

/// GET /ws/sessions/{key}
pub async fn session_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<BridgeState>>,
    Path(logical_key): Path<String>,
) -> Response {
    if let Err(e) = validate_logical_key(&logical_key) {
        return ApiError::from(e).into_response();
    }
    let frame_limit = max_frame_bytes(state.validator.max_bytes());
    ws.max_message_size(frame_limit)
        .max_frame_size(frame_limit)
        .on_upgrade(move |socket| handle_session_ws(socket, state, logical_key))
        .into_response()
}

/// Run one connection to completion.
pub async fn handle_session_ws(socket: WebSocket, state: Arc<BridgeState>, logical_key: String) {
    let connection_id = generate_connection_id();
    let span = connection_span(&logical_key, &connection_id);
    run_connection(socket, state, logical_key)
        .instrument(span)
        .await
}

async fn run_connection(socket: WebSocket, state: Arc<BridgeState>, logical_key: String) {
    let (ws_sender, ws_receiver) = socket.split();
    let sender: WsSender = Arc::new(tokio::sync::Mutex::new(ws_sender));

    let session = match state
        .registry
        .create_or_get(&logical_key, state.resolver.as_ref())
        .await
    {
        Ok(session) => session,
        Err(e) => {
            warn!("could not start session: {e}");
            let _ = send(&sender, &ServerMessage::error(ErrorCode::SpawnFailed, e.to_string())).await;
            close_socket(&sender).await;
            return;
        }
    };
    tracing::Span::current().record("session_id", tracing::field::display(session.id()));

    let mut binding = session.bind(state.client_queue_depth);
    let binding_id = binding.id();
    let replay = std::mem::take(&mut binding.replay);
    info!(resumed = binding.resumed, replay_bytes = replay.len(), "connection attached");

    let attached = ServerMessage::Attached {
        session_id: session.id(),
        logical_key: logical_key.clone(),
        resumed: binding.resumed,
        replay_bytes: replay.len(),
    };
    if send_replay(&sender, attached, &replay).await.is_err() {
        debug!("client went away during replay");
        session.unbind(binding_id);
        return;
    }

    let span = tracing::Span::current();
    let mut output_task = tokio::spawn(
        forward_events(binding, Arc::clone(&sender)).instrument(span.clone()),
    );
    let mut input_task = tokio::spawn(
        forward_input(ws_receiver, Arc::clone(&session), Arc::clone(&state), Arc::clone(&sender))
            .instrument(span.clone()),
    );
    let mut heartbeat_task =
        tokio::spawn(heartbeat(Arc::clone(&sender), state.heartbeat_interval).instrument(span));

    let ended = tokio::select! {
        r = &mut output_task => r.unwrap_or(Ended::ClientGone),
        r = &mut input_task => r.unwrap_or(Ended::ClientGone),
        r = &mut heartbeat_task => r.unwrap_or(Ended::ClientGone),
    };

    output_task.abort();
    input_task.abort();
    heartbeat_task.abort();

    session.unbind(binding_id);
    match ended {
        Ended::ClientGone => info!("connection closed by client, session kept"),
        Ended::ProcessExited => {
            info!(exit_code = ?session.exit_code(), "process exited, closing connection");
            close_socket(&sender).await;
        }
        Ended::Detached(reason) => {
            info!(%reason, "connection detached by session");
            close_socket(&sender).await;
        }
    }
}

/// Session events → socket.
async fn forward_events(binding: Binding, sender: WsSender) -> Ended {
    loop {
        let (msg, ended) = match binding.recv().await {
            SessionEvent::Output(data) => (ServerMessage::output(data), None),
            SessionEvent::Exited { code } => (ServerMessage::Exit { code }, Some(Ended::ProcessExited)),
            SessionEvent::Detached(reason) => {
                (ServerMessage::Closed { reason }, Some(Ended::Detached(reason)))
            }
        };
        let sent = send(&sender, &msg).await;
        if let Some(ended) = ended {
            return ended;
        }
        if sent.is_err() {
            return Ended::ClientGone;
        }
    }
}

/// Socket → process input. Frames are handled strictly in arrival order.
async fn forward_input(
    mut receiver: futures_util::stream::SplitStream<WebSocket>,
    session: Arc<Session>,
    state: Arc<BridgeState>,
    sender: WsSender,
) -> Ended {
    while let Some(frame) = receiver.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                debug!("websocket receive failed: {e}");
                break;
            }
        };
        // Any client frame, pongs included, counts as activity.
        session.touch();

        let reply = match frame {
            Message::Text(text) => match decode_client(text.as_str()) {
                Ok(msg) => apply(&session, &state, msg).await,
                Err(e) => {
                    debug!("undecodable frame: {e}");
                    Some(e.to_message())
                }
            },
            Message::Binary(data) => {
                apply(&session, &state, ClientMessage::Input { data: data.to_vec() }).await
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => None,
        };

        if let Some(reply) = reply {
            if send(&sender, &reply).await.is_err() {
                break;
            }
        }
    }
    Ended::ClientGone
}

/// Apply one client message. Returns an `error` reply on rejection.
async fn apply(session: &Session, state: &BridgeState, msg: ClientMessage) -> Option<ServerMessage> {
    let result = match msg {
        ClientMessage::Input { data } => {
            if let Err(e) = state.validator.validate(&data) {
                return Some(ServerMessage::from(&e));
            }
            session.write_input(&data).await
        }
        ClientMessage::Resize { rows, cols } => {
            if !session.resize(rows, cols) {
                debug!(rows, cols, "resize not applied");
            }
            Ok(())
        }
        ClientMessage::Signal { name } => session.send_signal(name),
        ClientMessage::Eof => session.send_eof().await,
    };
    match result {
        Ok(()) => None,
        Err(e) => {
            warn!("input not delivered: {e}");
            Some(ServerMessage::from(&e))
        }
    }
}

/// Ping the client periodically; ends when the socket stops accepting frames.
async fn heartbeat(sender: WsSender, interval: std::time::Duration) -> Ended {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    loop {
        ticker.tick().await;
        if sender
            .lock()
            .await
            .send(Message::Ping(Vec::new().into()))
            .await
            .is_err()
        {
            debug!("heartbeat ping failed, connection lost");
            return Ended::ClientGone;
        }
    }
}

async fn send_replay(sender: &WsSender, attached: ServerMessage, replay: &[u8]) -> Result<(), axum::Error> {
    send(sender, &attached).await?;
    for chunk in replay.chunks(REPLAY_FRAME_BYTES) {
        send(sender, &ServerMessage::output(chunk)).await?;
    }
    Ok(())
}

async fn send(sender: &WsSender, msg: &ServerMessage) -> Result<(), axum::Error> {
    let text = match msg.encode() {
        Ok(text) => text,
        Err(e) => {
            warn!("failed to encode server message: {e}");
            return Ok(());
        }
    };
    sender.lock().await.send(Message::Text(text.into())).await
}

async fn close_socket(sender: &WsSender) {
    let mut sink = sender.lock().await;
    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
}
