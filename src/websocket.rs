//! WebSocket endpoint: one socket per participant, JSON messages both ways.
//!
//! The socket task owns nothing but its connection id; all shared state
//! lives in [`AppState`]. Teardown runs on every exit path and is
//! idempotent, because explicit `leave` requests race with socket closes.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::matchmaker::{Matchmaker, PairedSession, SearchOutcome, Teardown};
use crate::protocol::{generate_connection_id, ClientMessage, ServerMessage};
use crate::registry::{ConnectionHandle, ConnectionRegistry};
use crate::transports::{TransportError, TransportManager};

/// Shared state handed to every socket task and HTTP handler.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub matchmaker: Arc<Matchmaker>,
    pub transports: Arc<TransportManager>,
    pub config: Arc<Config>,
    /// Present when a media engine is attached; drives graceful shutdown.
    pub engine_events: Option<tokio::sync::watch::Receiver<crate::media::EngineEvent>>,
}

/// WebSocket upgrade handler
pub async fn websocket_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle one WebSocket connection from accept to teardown.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let connection_id = generate_connection_id();
    let (mut sender, mut receiver) = socket.split();

    // Channel feeding this peer's socket; everything the server says goes
    // through here so sends never block event handling.
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let forward_id = connection_id.clone();
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Ok(json) = serde_json::to_string(&msg) {
                if sender.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
        }
        debug!(connection_id = %forward_id, "message sender task ended");
    });

    state
        .registry
        .register(ConnectionHandle::new(connection_id.clone(), tx.clone()));
    debug!(connection_id = %connection_id, "websocket connected");

    while let Some(msg_result) = receiver.next().await {
        let msg = match msg_result {
            Ok(m) => m,
            Err(e) => {
                debug!(connection_id = %connection_id, error = %e, "websocket error");
                break;
            }
        };

        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(client_msg) => {
                    handle_client_message(client_msg, &connection_id, &state, &tx).await;
                }
                Err(e) => {
                    warn!(connection_id = %connection_id, error = %e, "unparseable client message");
                    let _ = tx.send(ServerMessage::Error {
                        message: format!("invalid message format: {e}"),
                    });
                }
            },
            Message::Close(_) => break,
            // Control frames and binary payloads are not part of the protocol.
            _ => {}
        }
    }

    disconnect_cleanup(&state, &connection_id).await;
    debug!(connection_id = %connection_id, "websocket disconnected");
}

/// Full teardown for a connection that is gone (socket closed or replaced):
/// registry entry out first so no new pairing can select it, then session
/// teardown with partner notification, then transport closure.
pub(crate) async fn disconnect_cleanup(state: &AppState, connection_id: &str) {
    state.registry.remove(connection_id);
    if let Some(teardown) = state.matchmaker.leave(connection_id) {
        notify_partner_left(state, &teardown);
        info!(
            connection_id = %connection_id,
            room_id = %teardown.room_id,
            "session ended by disconnect"
        );
        state.transports.close_all(&teardown.partner_id).await;
    }
    state.transports.close_all(connection_id).await;
}

/// Dissolve the leaver's session (if any): tell the partner once and close
/// both sides' transports. The connection itself stays registered.
async fn teardown_session(state: &AppState, connection_id: &str) -> Option<Teardown> {
    let teardown = state.matchmaker.leave(connection_id)?;
    notify_partner_left(state, &teardown);
    state.transports.close_all(connection_id).await;
    state.transports.close_all(&teardown.partner_id).await;
    Some(teardown)
}

fn notify_partner_left(state: &AppState, teardown: &Teardown) {
    if !state
        .registry
        .send(&teardown.partner_id, ServerMessage::PartnerLeft)
    {
        debug!(partner_id = %teardown.partner_id, "partner already unreachable during teardown");
    }
}

/// Deliver both `paired` notifications for a committed match.
fn deliver_pairing(state: &AppState, paired: &PairedSession) {
    let initiator_public = state
        .registry
        .public_id(&paired.initiator)
        .unwrap_or_else(|| paired.initiator.clone());
    let responder_public = state
        .registry
        .public_id(&paired.responder)
        .unwrap_or_else(|| paired.responder.clone());

    info!(
        room_id = %paired.room_id,
        mode = %paired.mode,
        initiator = %paired.initiator,
        responder = %paired.responder,
        "paired"
    );

    state.registry.send(
        &paired.initiator,
        ServerMessage::Paired {
            room_id: paired.room_id.clone(),
            partner_id: responder_public,
            mode: paired.mode,
            initiator: true,
        },
    );
    if !state.registry.send(
        &paired.responder,
        ServerMessage::Paired {
            room_id: paired.room_id.clone(),
            partner_id: initiator_public,
            mode: paired.mode,
            initiator: false,
        },
    ) {
        // The responder vanished between selection and delivery; its
        // disconnect path owns the symmetric teardown.
        warn!(room_id = %paired.room_id, "paired notification undeliverable");
    }
}

async fn handle_client_message(
    message: ClientMessage,
    connection_id: &str,
    state: &AppState,
    tx: &mpsc::UnboundedSender<ServerMessage>,
) {
    match message {
        ClientMessage::Register { peer_ref } => {
            if let Some(peer_ref) = peer_ref {
                if let Some(old) = state.registry.claim_peer_ref(connection_id, peer_ref) {
                    // The previous owner of this identity is gone as far as
                    // the rest of the system is concerned.
                    disconnect_cleanup(state, &old.connection_id).await;
                }
            }
            let public_id = state
                .registry
                .public_id(connection_id)
                .unwrap_or_else(|| connection_id.to_string());
            let _ = tx.send(ServerMessage::Registered {
                connection_id: public_id,
            });
        }

        ClientMessage::Search { mode } => {
            // "Search again" semantics: drop any current partner and any
            // previous queue position before enqueueing.
            teardown_session(state, connection_id).await;

            match state.matchmaker.enqueue(connection_id, mode) {
                Ok(SearchOutcome::Waiting) => {
                    debug!(connection_id = %connection_id, %mode, "waiting for a partner");
                    let _ = tx.send(ServerMessage::Waiting);
                }
                Ok(SearchOutcome::Paired(paired)) => deliver_pairing(state, &paired),
                Err(e) => {
                    // Cannot happen after the teardown above; tolerate it
                    // rather than corrupting state.
                    error!(connection_id = %connection_id, error = %e, "search hit inconsistent matchmaker state");
                    let _ = tx.send(ServerMessage::Error {
                        message: e.to_string(),
                    });
                }
            }
        }

        ClientMessage::CancelSearch => {
            if state.matchmaker.dequeue(connection_id) {
                let _ = tx.send(ServerMessage::SearchCancelled);
            }
        }

        ClientMessage::Signal { payload } => {
            // The session table is the sole authority on who may receive
            // this; late signals after teardown are dropped silently.
            match state.matchmaker.session_of(connection_id) {
                Some(membership) => {
                    let from = state
                        .registry
                        .public_id(connection_id)
                        .unwrap_or_else(|| connection_id.to_string());
                    state
                        .registry
                        .send(&membership.partner_id, ServerMessage::Signal { payload, from });
                }
                None => {
                    debug!(connection_id = %connection_id, "dropping signal without an active session");
                }
            }
        }

        ClientMessage::RequestNext => {
            let (teardown, outcome) = state.matchmaker.request_next(connection_id);
            if let Some(teardown) = &teardown {
                notify_partner_left(state, teardown);
                state.transports.close_all(connection_id).await;
                state.transports.close_all(&teardown.partner_id).await;
            }
            match outcome {
                Some(SearchOutcome::Waiting) => {
                    let _ = tx.send(ServerMessage::Waiting);
                }
                Some(SearchOutcome::Paired(paired)) => deliver_pairing(state, &paired),
                None => {
                    debug!(connection_id = %connection_id, "request_next with nothing to resume");
                }
            }
        }

        ClientMessage::Leave => {
            teardown_session(state, connection_id).await;
        }

        ClientMessage::GetRouterCapabilities => match state.transports.router_capabilities() {
            Ok(rtp_capabilities) => {
                let _ = tx.send(ServerMessage::RouterCapabilities { rtp_capabilities });
            }
            Err(e) => {
                let _ = tx.send(ServerMessage::Error {
                    message: e.to_string(),
                });
            }
        },

        ClientMessage::CreateTransport { direction } => {
            match state.transports.create_transport(connection_id, direction).await {
                Ok(transport) => {
                    let _ = tx.send(ServerMessage::TransportCreated { direction, transport });
                }
                Err(e) => {
                    warn!(connection_id = %connection_id, %direction, error = %e, "transport create failed");
                    let _ = tx.send(ServerMessage::Error {
                        message: e.to_string(),
                    });
                }
            }
        }

        ClientMessage::ConnectTransport {
            direction,
            remote_parameters,
        } => {
            match state
                .transports
                .connect_transport(connection_id, direction, remote_parameters)
                .await
            {
                Ok(()) => {
                    let _ = tx.send(ServerMessage::TransportConnected { direction });
                }
                // A connect that raced a teardown is expected, not an error.
                Err(TransportError::NotFound(_)) => {
                    debug!(connection_id = %connection_id, %direction, "connect for a transport that no longer exists");
                }
                Err(e) => {
                    let _ = tx.send(ServerMessage::Error {
                        message: e.to_string(),
                    });
                }
            }
        }

        ClientMessage::Produce {
            kind,
            rtp_parameters,
        } => {
            match state
                .transports
                .produce(connection_id, kind, rtp_parameters)
                .await
            {
                Ok(producer) => {
                    let _ = tx.send(ServerMessage::Produced {
                        producer_id: producer.id.clone(),
                    });
                    // Tell the partner there is new media to consume, via the
                    // same authorization path as signaling.
                    if let Some(membership) = state.matchmaker.session_of(connection_id) {
                        state.registry.send(
                            &membership.partner_id,
                            ServerMessage::NewProducer {
                                producer_id: producer.id,
                                kind: producer.kind,
                            },
                        );
                    }
                }
                Err(TransportError::NotFound(direction)) => {
                    debug!(connection_id = %connection_id, %direction, "produce without a transport");
                }
                Err(e) => {
                    let _ = tx.send(ServerMessage::Error {
                        message: e.to_string(),
                    });
                }
            }
        }

        ClientMessage::Consume {
            producer_id,
            rtp_capabilities,
        } => {
            match state
                .transports
                .consume(connection_id, &producer_id, rtp_capabilities)
                .await
            {
                Ok(consumer) => match serde_json::to_value(&consumer) {
                    Ok(consumer) => {
                        let _ = tx.send(ServerMessage::Consumed { consumer });
                    }
                    Err(e) => {
                        error!(connection_id = %connection_id, error = %e, "consumer descriptor serialization failed");
                        let _ = tx.send(ServerMessage::Error {
                            message: "internal error".to_string(),
                        });
                    }
                },
                Err(TransportError::NotFound(direction)) => {
                    debug!(connection_id = %connection_id, %direction, "consume without a transport");
                }
                Err(e) => {
                    let _ = tx.send(ServerMessage::Error {
                        message: e.to_string(),
                    });
                }
            }
        }

        ClientMessage::Ping => {
            let _ = tx.send(ServerMessage::Pong);
        }
    }
}
