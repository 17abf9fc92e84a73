//! Per-space publish/subscribe of deltas.
//!
//! The mutation path only sees the [`BroadcastHub`] trait; the server plugs
//! in a tokio-backed relay, tests and single-process setups use
//! [`LocalHub`].

use crate::audit::{AuditEvent, AuditLog};
use crate::delta::Delta;
use crate::id::SpaceId;
use std::collections::HashMap;
use std::sync::mpsc::{Receiver, Sender, TryRecvError, channel};
use std::sync::{Arc, Mutex};

/// Fan-out of deltas to the sessions subscribed to a space.
pub trait BroadcastHub: Send + Sync {
    /// Append `event` to the audit log, then deliver `delta` to every
    /// current subscriber of `space`, preserving publish order per space.
    fn publish(&self, space: SpaceId, delta: Delta, event: AuditEvent);

    /// Deliver `delta` to the subscribers of `space` without recording an
    /// audit event. Used when one recorded mutation concerns several spaces.
    fn relay(&self, space: SpaceId, delta: Delta);

    /// Number of sessions currently subscribed to `space`.
    fn subscriber_count(&self, space: SpaceId) -> usize;
}

/// Anything a session can pull deltas from, in delivery order.
pub trait DeltaSource {
    fn drain(&mut self) -> Vec<Delta>;
}

/// Receiving end of a space subscription. Dropping it unsubscribes.
pub struct Subscription {
    space: SpaceId,
    rx: Receiver<Delta>,
}

impl Subscription {
    pub fn space(&self) -> SpaceId {
        self.space
    }

    /// Drain every delta delivered so far, in publish order.
    pub fn drain(&self) -> Vec<Delta> {
        let mut deltas = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(delta) => deltas.push(delta),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    log::debug!("hub dropped subscription to space {}", self.space);
                    break;
                }
            }
        }
        deltas
    }

    /// Block until the next delta arrives; `None` once the hub is gone.
    pub fn recv(&self) -> Option<Delta> {
        self.rx.recv().ok()
    }
}

impl DeltaSource for Subscription {
    fn drain(&mut self) -> Vec<Delta> {
        Subscription::drain(self)
    }
}

/// In-process hub backed by one channel per subscriber.
pub struct LocalHub {
    audit: Arc<dyn AuditLog>,
    /// Held for the whole fan-out so deliveries never interleave.
    spaces: Mutex<HashMap<SpaceId, Vec<Sender<Delta>>>>,
}

impl LocalHub {
    pub fn new(audit: Arc<dyn AuditLog>) -> Self {
        Self {
            audit,
            spaces: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self, space: SpaceId) -> Subscription {
        let (tx, rx) = channel();
        let mut spaces = match self.spaces.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        spaces.entry(space).or_default().push(tx);
        log::debug!("new subscriber on space {}", space);
        Subscription { space, rx }
    }

    fn deliver(spaces: &mut HashMap<SpaceId, Vec<Sender<Delta>>>, space: SpaceId, delta: Delta) {
        let Some(subscribers) = spaces.get_mut(&space) else {
            log::debug!("{} on space {} has no subscribers", delta.kind_name(), space);
            return;
        };
        // Delivery is not retried: a closed receiver is simply dropped.
        subscribers.retain(|tx| tx.send(delta.clone()).is_ok());
        if subscribers.is_empty() {
            spaces.remove(&space);
        }
    }
}

impl BroadcastHub for LocalHub {
    fn publish(&self, space: SpaceId, delta: Delta, event: AuditEvent) {
        let mut spaces = match self.spaces.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        self.audit.append(event);
        Self::deliver(&mut spaces, space, delta);
    }

    fn relay(&self, space: SpaceId, delta: Delta) {
        let mut spaces = match self.spaces.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        Self::deliver(&mut spaces, space, delta);
    }

    fn subscriber_count(&self, space: SpaceId) -> usize {
        match self.spaces.lock() {
            Ok(s) => s.get(&space).map_or(0, Vec::len),
            Err(poisoned) => poisoned.into_inner().get(&space).map_or(0, Vec::len),
        }
    }
}
