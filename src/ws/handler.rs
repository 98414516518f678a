//! WebSocket upgrade handler and the per-connection bridge pumps

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::game::lobby::CHANNEL_CAPACITY;
use crate::game::{Connection, LobbyHandle, LobbyMsg, RegisterKind};
use crate::util::rate_limit::ConnectionRateLimiter;
use crate::ws::protocol::{ClientMsg, ServerMsg};

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Bridge one upgraded connection: a writer pump draining the connection's
/// private outbound sink, and a reader loop routing typed client messages to
/// the registry or the joined lobby.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let conn_id = Uuid::new_v4();
    info!(conn_id = %conn_id, "New WebSocket connection");

    let (ws_sink, mut ws_stream) = socket.split();
    let (out_tx, out_rx) = mpsc::channel::<ServerMsg>(CHANNEL_CAPACITY);

    let writer = tokio::spawn(write_pump(conn_id, ws_sink, out_rx));
    let mut bridge = Bridge::new(conn_id, out_tx);

    while let Some(result) = ws_stream.next().await {
        match result {
            Ok(Message::Text(text)) => {
                let msg = match serde_json::from_str::<ClientMsg>(&text) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!(conn_id = %conn_id, error = %e, "Failed to parse client message, dropping frame");
                        continue;
                    }
                };

                bridge.handle_msg(&state, msg).await;
            }
            Ok(Message::Binary(_)) => {
                warn!(conn_id = %conn_id, "Received binary message, ignoring");
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                info!(conn_id = %conn_id, "Client initiated close");
                break;
            }
            Err(e) => {
                error!(conn_id = %conn_id, error = %e, "WebSocket error");
                break;
            }
        }
    }

    // Transport gone: release the slot and let the writer wind down
    bridge.disconnect().await;
    drop(bridge);

    let _ = writer.await;
    info!(conn_id = %conn_id, "WebSocket connection closed");
}

/// Per-connection routing state between the reader loop and the lobbies.
///
/// Sink ownership is the teardown mechanism: before registration the bridge
/// holds the sole strong sender to the writer pump, afterwards the lobby
/// roster does. Whoever drops the last sender (lobby eviction, unregister,
/// or an unregistered bridge winding down) closes the sink and ends the
/// writer with a close frame.
struct Bridge {
    conn_id: Uuid,
    strong: Option<mpsc::Sender<ServerMsg>>,
    weak: mpsc::WeakSender<ServerMsg>,
    lobby: Option<LobbyHandle>,
    rate_limiter: ConnectionRateLimiter,
}

impl Bridge {
    fn new(conn_id: Uuid, tx: mpsc::Sender<ServerMsg>) -> Self {
        Self {
            conn_id,
            weak: tx.downgrade(),
            strong: Some(tx),
            lobby: None,
            rate_limiter: ConnectionRateLimiter::new(),
        }
    }

    /// Route one well-formed client message to the registry or the joined lobby
    async fn handle_msg(&mut self, state: &AppState, msg: ClientMsg) {
        match msg {
            ClientMsg::CreateLobby => {
                if self.lobby.is_some() {
                    self.reply_error("Already in a lobby.");
                    return;
                }

                let handle = state.lobbies.create();
                self.register(handle, RegisterKind::Creator).await;
            }
            ClientMsg::JoinLobby { lobby_id } => {
                if self.lobby.is_some() {
                    self.reply_error("Already in a lobby.");
                    return;
                }

                match state.lobbies.join(&lobby_id) {
                    Ok(handle) => self.register(handle, RegisterKind::Joiner).await,
                    Err(e) => {
                        debug!(conn_id = %self.conn_id, lobby_id = %lobby_id, error = %e, "Join rejected");
                        self.reply_error(&e.to_string());
                    }
                }
            }
            ClientMsg::PlayerInput {
                action, direction, ..
            } => {
                if !self.rate_limiter.check_input() {
                    warn!(conn_id = %self.conn_id, "Rate limited input message");
                    return;
                }

                let Some(handle) = &self.lobby else {
                    warn!(conn_id = %self.conn_id, "Input before joining a lobby, dropping");
                    return;
                };

                let sent = handle
                    .inbox
                    .send(LobbyMsg::Input {
                        conn_id: self.conn_id,
                        action,
                        direction,
                    })
                    .await;

                if sent.is_err() {
                    // Lobby torn down underneath us
                    warn!(conn_id = %self.conn_id, lobby_id = %handle.id, "Lobby gone, dropping input");
                    self.lobby = None;
                }
            }
        }
    }

    async fn register(&mut self, handle: LobbyHandle, kind: RegisterKind) {
        let Some(tx) = self.sender() else {
            return;
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        let sent = handle
            .inbox
            .send(LobbyMsg::Register {
                conn: Connection {
                    id: self.conn_id,
                    tx,
                },
                kind,
                ack: ack_tx,
            })
            .await;

        if sent.is_err() {
            // Teardown raced the lookup; from the client's view the lobby is gone
            self.reply_error("Lobby does not exist.");
            return;
        }

        match ack_rx.await {
            Ok(true) => {
                // Admitted. The roster now holds the connection's only strong
                // sender, so evicting it there closes the sink.
                self.strong = None;
                self.lobby = Some(handle);
            }
            // Rejected (the benign full-lobby race); the actor already sent
            // the lobby_error, and this connection is free to try elsewhere
            Ok(false) => {}
            Err(_) => self.reply_error("Lobby does not exist."),
        }
    }

    async fn disconnect(&mut self) {
        if let Some(handle) = self.lobby.take() {
            let _ = handle
                .inbox
                .send(LobbyMsg::Unregister {
                    conn_id: self.conn_id,
                })
                .await;
        }
    }

    fn sender(&self) -> Option<mpsc::Sender<ServerMsg>> {
        match &self.strong {
            Some(tx) => Some(tx.clone()),
            None => self.weak.upgrade(),
        }
    }

    fn reply_error(&self, message: &str) {
        if let Some(tx) = self.sender() {
            let _ = tx.try_send(ServerMsg::LobbyError {
                message: message.to_string(),
            });
        }
    }
}

/// Drain the outbound sink into the transport in arrival order. Ends with a
/// close frame once every sender to the sink is gone; a write failure ends
/// immediately and lets the reader's failure drive cleanup.
async fn write_pump(
    conn_id: Uuid,
    mut ws_sink: futures::stream::SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::Receiver<ServerMsg>,
) {
    while let Some(msg) = out_rx.recv().await {
        let json = match serde_json::to_string(&msg) {
            Ok(json) => json,
            Err(e) => {
                error!(conn_id = %conn_id, error = %e, "Failed to serialize message, skipping");
                continue;
            }
        };

        if let Err(e) = ws_sink.send(Message::Text(json)).await {
            debug!(conn_id = %conn_id, error = %e, "WebSocket send failed");
            return;
        }
    }

    let _ = ws_sink.send(Message::Close(None)).await;
}
