//! Per-space broadcast channels for connected peers.

use dashmap::DashMap;
use mapweave_core::audit::{AuditEvent, AuditLog};
use mapweave_core::delta::Delta;
use mapweave_core::hub::BroadcastHub;
use mapweave_core::id::SpaceId;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, info};

struct SpaceChannel {
    tx: broadcast::Sender<Delta>,
    peers: usize,
    /// Serializes audit append plus send for this space.
    publish: Arc<Mutex<()>>,
}

impl SpaceChannel {
    fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            peers: 0,
            publish: Arc::new(Mutex::new(())),
        }
    }
}

/// [`BroadcastHub`] backed by one tokio broadcast channel per space.
pub struct RelayHub {
    audit: Arc<dyn AuditLog>,
    spaces: DashMap<SpaceId, SpaceChannel>,
    capacity: usize,
}

impl RelayHub {
    pub fn new(audit: Arc<dyn AuditLog>, capacity: usize) -> Self {
        Self {
            audit,
            spaces: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Add a peer to `space`. Returns its receiver and the new peer count.
    pub fn join(&self, space: SpaceId) -> (broadcast::Receiver<Delta>, usize) {
        let mut channel = self
            .spaces
            .entry(space)
            .or_insert_with(|| SpaceChannel::new(self.capacity));
        channel.peers += 1;
        (channel.tx.subscribe(), channel.peers)
    }

    /// Remove a peer; the space is dropped with its last peer.
    pub fn leave(&self, space: SpaceId) {
        if let Some(mut channel) = self.spaces.get_mut(&space) {
            channel.peers = channel.peers.saturating_sub(1);
        }
        if self.spaces.remove_if(&space, |_, channel| channel.peers == 0).is_some() {
            info!("space {} is empty, dropping its channel", space);
        }
    }

    pub fn space_count(&self) -> usize {
        self.spaces.len()
    }

    fn sender(&self, space: SpaceId) -> Option<(broadcast::Sender<Delta>, Arc<Mutex<()>>)> {
        self.spaces
            .get(&space)
            .map(|channel| (channel.tx.clone(), channel.publish.clone()))
    }

    fn send(space: SpaceId, tx: &broadcast::Sender<Delta>, delta: Delta) {
        let kind = delta.kind_name();
        match tx.send(delta) {
            Ok(receivers) => debug!("{} on space {} sent to {} peers", kind, space, receivers),
            Err(_) => debug!("{} on space {} has no receivers", kind, space),
        }
    }
}

impl BroadcastHub for RelayHub {
    fn publish(&self, space: SpaceId, delta: Delta, event: AuditEvent) {
        let Some((tx, lock)) = self.sender(space) else {
            self.audit.append(event);
            debug!("{} on space {} has no subscribers", delta.kind_name(), space);
            return;
        };
        let _guard = match lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        self.audit.append(event);
        Self::send(space, &tx, delta);
    }

    fn relay(&self, space: SpaceId, delta: Delta) {
        let Some((tx, lock)) = self.sender(space) else {
            return;
        };
        let _guard = match lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Self::send(space, &tx, delta);
    }

    fn subscriber_count(&self, space: SpaceId) -> usize {
        self.spaces.get(&space).map_or(0, |channel| channel.peers)
    }
}

/// Audit sink that writes each event to the tracing log.
pub struct TracingAuditLog;

impl AuditLog for TracingAuditLog {
    fn append(&self, event: AuditEvent) {
        info!(
            target: "mapweave_server::audit",
            kind = ?event.kind,
            subject = ?event.subject,
            space = ?event.space_id,
            actor = %event.actor_id,
            meta = %event.meta,
            "audit"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mapweave_core::audit::{AuditKind, MemoryAuditLog};
    use mapweave_core::id::{EntityId, PlacementId, UserId};
    use mapweave_core::model::Placeable;

    fn moved(x: f64) -> (Delta, AuditEvent) {
        let delta = Delta::NodeMoved {
            id: EntityId::Durable(1),
            placement_id: PlacementId(2),
            x,
            y: 0.0,
        };
        let event = AuditEvent::new(
            AuditKind::NodeMovedOnSpace,
            Placeable::Node(EntityId::Durable(1)),
            Some(SpaceId(1)),
            UserId(1),
            serde_json::json!({ "x": x }),
        );
        (delta, event)
    }

    #[tokio::test]
    async fn test_publish_reaches_every_peer_in_order() {
        let audit = Arc::new(MemoryAuditLog::new());
        let hub = RelayHub::new(audit.clone(), 16);
        let (mut first, _) = hub.join(SpaceId(1));
        let (mut second, peers) = hub.join(SpaceId(1));
        assert_eq!(peers, 2);

        for x in [1.0, 2.0] {
            let (delta, event) = moved(x);
            hub.publish(SpaceId(1), delta, event);
        }
        for rx in [&mut first, &mut second] {
            assert_eq!(rx.recv().await.unwrap(), moved(1.0).0);
            assert_eq!(rx.recv().await.unwrap(), moved(2.0).0);
        }
        assert_eq!(audit.len(), 2);
    }

    #[tokio::test]
    async fn test_spaces_are_isolated() {
        let hub = RelayHub::new(Arc::new(MemoryAuditLog::new()), 16);
        let (mut other, _) = hub.join(SpaceId(2));
        let (delta, event) = moved(1.0);
        hub.publish(SpaceId(1), delta, event);
        assert!(matches!(other.try_recv(), Err(broadcast::error::TryRecvError::Empty)));
    }

    #[test]
    fn test_last_leave_drops_space() {
        let audit = Arc::new(MemoryAuditLog::new());
        let hub = RelayHub::new(audit.clone(), 16);
        let _a = hub.join(SpaceId(1));
        let _b = hub.join(SpaceId(1));
        hub.leave(SpaceId(1));
        assert_eq!(hub.subscriber_count(SpaceId(1)), 1);
        hub.leave(SpaceId(1));
        assert_eq!(hub.space_count(), 0);

        // Still audited with nobody listening.
        let (delta, event) = moved(3.0);
        hub.publish(SpaceId(1), delta, event);
        assert_eq!(audit.len(), 1);
    }

    #[test]
    fn test_relay_is_not_audited() {
        let audit = Arc::new(MemoryAuditLog::new());
        let hub = RelayHub::new(audit.clone(), 16);
        let (mut rx, _) = hub.join(SpaceId(1));
        hub.relay(SpaceId(1), moved(1.0).0);
        assert!(rx.try_recv().is_ok());
        assert!(audit.is_empty());
    }
}
