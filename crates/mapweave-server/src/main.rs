//! MapWeave WebSocket Server
//!
//! Accepts mutations for shared spaces, persists them, and relays the
//! resulting deltas to every peer joined to the same space.
//!
//! ## Protocol
//!
//! Messages are JSON tagged by `type`:
//! ```json
//! { "type": "join", "space": 1, "user": 7, "session": "<uuid>" }
//! { "type": "fetch", "request_id": 1 }
//! { "type": "request", "request_id": 2, "mutation": { "op": "move_node", "placement_id": 4, "x": 10.0, "y": 20.0 } }
//! ```
//! Replies are `joined`, `ack`, `contents` and `error`; other peers' changes
//! arrive as `delta`.

mod config;
mod relay;
mod ws;

use axum::{Router, routing::get};
use config::ServerConfig;
use relay::TracingAuditLog;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use ws::{AppState, ws_handler};

fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mapweave_server=info,tower_http=info".into()),
        )
        .init();

    let config = match ServerConfig::load() {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {}", e);
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()));
        }
    };
    let addr = config.addr;
    let state = Arc::new(AppState::new(config, Arc::new(TracingAuditLog)));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("MapWeave server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}/ws", addr);
    axum::serve(listener, app(state)).await
}

/// Index page
async fn index() -> &'static str {
    "MapWeave Server - Connect via WebSocket at /ws"
}

/// Health check
async fn health() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;
    use mapweave_core::audit::MemoryAuditLog;
    use mapweave_core::delta::Delta;
    use mapweave_core::hub::DeltaSource;
    use mapweave_core::id::{EntityId, SessionId, SpaceId, UserId};
    use mapweave_core::model::Node;
    use mapweave_core::service::{Ack, Actor, Mutation, MutationError, Remote};
    use mapweave_core::sync::ChannelRemote;
    use std::net::SocketAddr;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(5);

    async fn spawn_server(config: ServerConfig) -> (SocketAddr, Arc<AppState>) {
        let state = Arc::new(AppState::new(config, Arc::new(MemoryAuditLog::new())));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = app(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (addr, state)
    }

    fn actor(user: i64) -> Actor {
        Actor { user: UserId(user), session: SessionId::new() }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_create_reaches_other_peer() {
        let (addr, state) = spawn_server(ServerConfig::default()).await;
        let url = format!("ws://{}/ws", addr);

        let observed = tokio::task::spawn_blocking(move || {
            let handle = tokio::runtime::Handle::current();
            let alice = actor(1);
            let bob = actor(2);
            let alice_remote = ChannelRemote::connect(&url, alice, SpaceId(1), TIMEOUT).unwrap();
            let bob_remote = ChannelRemote::connect(&url, bob, SpaceId(1), TIMEOUT).unwrap();
            // A fetch round trip guarantees both joins were processed.
            handle.block_on(alice_remote.fetch_space(SpaceId(1))).unwrap();
            handle.block_on(bob_remote.fetch_space(SpaceId(1))).unwrap();

            let node = Node::new(EntityId::local(), "Shared", alice.user);
            let local = node.id;
            let ack = handle
                .block_on(alice_remote.submit(alice, Mutation::CreateNode { space: SpaceId(1), node, x: 1.0, y: 2.0 }))
                .unwrap();
            let (local_id, node) = match ack {
                Ack::NodeCreated { local_id, node, .. } => (local_id, node),
                other => panic!("unexpected ack {:?}", other),
            };
            assert_eq!(local_id, local);

            // Pull until the delta shows up.
            let mut deltas = bob_remote.deltas();
            let deadline = std::time::Instant::now() + TIMEOUT;
            loop {
                let received = deltas.drain();
                if let Some(delta) = received.into_iter().next() {
                    return (node.id, delta);
                }
                assert!(std::time::Instant::now() < deadline, "no delta received");
                std::thread::sleep(Duration::from_millis(20));
            }
        })
        .await
        .unwrap();

        let (id, delta) = observed;
        match delta {
            Delta::NodeAdded { node, x, y, origin, .. } => {
                assert_eq!(node.id, id);
                assert_eq!((x, y), (1.0, 2.0));
                assert!(origin.is_some());
            }
            other => panic!("expected nodeAdded, got {:?}", other),
        }
        assert_eq!(state.persistence.node_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_invalid_request_gets_error_reply() {
        let (addr, _state) = spawn_server(ServerConfig::default()).await;
        let url = format!("ws://{}/ws", addr);

        let result = tokio::task::spawn_blocking(move || {
            let handle = tokio::runtime::Handle::current();
            let alice = actor(1);
            let remote = ChannelRemote::connect(&url, alice, SpaceId(1), TIMEOUT).unwrap();
            let node = Node::new(EntityId::local(), "   ", alice.user);
            handle.block_on(remote.submit(alice, Mutation::CreateNode { space: SpaceId(1), node, x: 0.0, y: 0.0 }))
        })
        .await
        .unwrap();

        assert!(matches!(result, Err(MutationError::Validation(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_last_peer_leaving_drops_space() {
        let (addr, state) = spawn_server(ServerConfig::default()).await;
        let url = format!("ws://{}/ws", addr);

        let state_for_client = state.clone();
        tokio::task::spawn_blocking(move || {
            let handle = tokio::runtime::Handle::current();
            let remote = ChannelRemote::connect(&url, actor(1), SpaceId(9), TIMEOUT).unwrap();
            handle.block_on(remote.fetch_space(SpaceId(9))).unwrap();
            assert_eq!(state_for_client.hub.space_count(), 1);
        })
        .await
        .unwrap();

        // The remote was dropped with the blocking task; give the server a
        // moment to see the close frame.
        for _ in 0..50 {
            if state.hub.space_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(state.hub.space_count(), 0);
    }
}
