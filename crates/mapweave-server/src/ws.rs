//! WebSocket connection handling.

use crate::config::{PolicyKind, ServerConfig};
use crate::relay::RelayHub;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use mapweave_core::audit::AuditLog;
use mapweave_core::delta::Delta;
use mapweave_core::id::SpaceId;
use mapweave_core::model::{Permission, Space};
use mapweave_core::persist::{MemoryPersistence, PersistError, Persistence};
use mapweave_core::policy::{AllowAll, EditorsOnly, Policy};
use mapweave_core::service::{Actor, MutationError, SpaceService};
use mapweave_core::sync::{ClientMessage, ServerMessage};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Shared application state
pub struct AppState {
    pub config: ServerConfig,
    pub persistence: Arc<MemoryPersistence>,
    pub hub: Arc<RelayHub>,
    pub service: Arc<SpaceService>,
}

impl AppState {
    pub fn new(config: ServerConfig, audit: Arc<dyn AuditLog>) -> Self {
        let persistence = Arc::new(MemoryPersistence::new());
        let hub = Arc::new(RelayHub::new(audit.clone(), config.channel_capacity));
        let policy: Arc<dyn Policy> = match config.policy {
            PolicyKind::AllowAll => Arc::new(AllowAll),
            PolicyKind::EditorsOnly => Arc::new(EditorsOnly),
        };
        let service = Arc::new(SpaceService::new(persistence.clone(), hub.clone(), policy, audit));
        Self {
            config,
            persistence,
            hub,
            service,
        }
    }

    /// Make sure `space` exists before anyone subscribes to it.
    async fn open_space(&self, space: SpaceId) -> Result<(), MutationError> {
        match self.persistence.space(space).await {
            Ok(_) => Ok(()),
            Err(PersistError::NotFound(_)) if self.config.auto_create_spaces => {
                info!("creating space {}", space);
                self.persistence
                    .insert_space(Space::new(space, format!("space {}", space), Permission::Commons));
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// What a connection is joined to.
struct Membership {
    actor: Actor,
    space: SpaceId,
    rx: broadcast::Receiver<Delta>,
}

type Sender = SplitSink<WebSocket, Message>;

/// Serialize and send; false once the peer is gone.
async fn send(sender: &mut Sender, msg: &ServerMessage) -> bool {
    let json = match serde_json::to_string(msg) {
        Ok(json) => json,
        Err(e) => {
            warn!("cannot serialize {:?}: {}", msg, e);
            return true;
        }
    };
    sender.send(Message::Text(json.into())).await.is_ok()
}

fn leave(state: &AppState, peer_id: &str, membership: Option<Membership>) {
    if let Some(membership) = membership {
        state.hub.leave(membership.space);
        info!("peer {} left space {}", peer_id, membership.space);
    }
}

/// Handle a WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let peer_id = Uuid::new_v4().to_string();
    info!("new connection: {}", peer_id);

    let (mut sender, mut receiver) = socket.split();
    let mut membership: Option<Membership> = None;

    loop {
        tokio::select! {
            msg = receiver.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!("websocket error for {}: {}", peer_id, e);
                        break;
                    }
                };
                let client_msg = match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(client_msg) => client_msg,
                    Err(e) => {
                        warn!("invalid message from {}: {}", peer_id, e);
                        let reply = ServerMessage::error(None, MutationError::Other(format!("invalid message: {}", e)));
                        if !send(&mut sender, &reply).await {
                            break;
                        }
                        continue;
                    }
                };
                let reply = match client_msg {
                    ClientMessage::Join { space, user, session } => {
                        leave(&state, &peer_id, membership.take());
                        match state.open_space(space).await {
                            Ok(()) => {
                                let (rx, peer_count) = state.hub.join(space);
                                membership = Some(Membership { actor: Actor { user, session }, space, rx });
                                info!("peer {} (user {}) joined space {}", peer_id, user, space);
                                ServerMessage::Joined { space, peer_count }
                            }
                            Err(err) => ServerMessage::error(None, err),
                        }
                    }
                    ClientMessage::Leave => {
                        leave(&state, &peer_id, membership.take());
                        continue;
                    }
                    ClientMessage::Fetch { request_id } => match membership.as_ref().map(|joined| joined.space) {
                        Some(space) => match state.service.load(space).await {
                            Ok(contents) => ServerMessage::Contents { request_id, contents },
                            Err(err) => ServerMessage::error(Some(request_id), err),
                        },
                        None => ServerMessage::error(Some(request_id), not_joined()),
                    },
                    ClientMessage::Request { request_id, mutation } => match membership.as_ref().map(|joined| joined.actor) {
                        Some(actor) => {
                            debug!("peer {} request {}: {}", peer_id, request_id, mutation.name());
                            match state.service.apply(actor, mutation).await {
                                Ok(ack) => ServerMessage::Ack { request_id, ack },
                                Err(err) => {
                                    debug!("request {} from {} failed: {}", request_id, peer_id, err);
                                    ServerMessage::error(Some(request_id), err)
                                }
                            }
                        }
                        None => ServerMessage::error(Some(request_id), not_joined()),
                    },
                };
                if !send(&mut sender, &reply).await {
                    break;
                }
            }

            msg = async {
                match &mut membership {
                    Some(joined) => Some((joined.space, joined.rx.recv().await)),
                    None => std::future::pending::<Option<(SpaceId, Result<Delta, RecvError>)>>().await,
                }
            } => {
                let Some((space, received)) = msg else { continue };
                let reply = match received {
                    Ok(delta) => ServerMessage::Delta { space, delta },
                    Err(RecvError::Lagged(missed)) => {
                        warn!("peer {} lagged by {} deltas on space {}", peer_id, missed, space);
                        ServerMessage::error(
                            None,
                            MutationError::Network(format!("missed {} updates, reload the space", missed)),
                        )
                    }
                    Err(RecvError::Closed) => {
                        membership = None;
                        continue;
                    }
                };
                if !send(&mut sender, &reply).await {
                    break;
                }
            }
        }
    }

    leave(&state, &peer_id, membership.take());
    info!("connection closed: {}", peer_id);
}

fn not_joined() -> MutationError {
    MutationError::PolicyDenied("join a space first".to_string())
}
