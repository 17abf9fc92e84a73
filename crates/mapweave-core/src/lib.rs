//! Mapweave Core Library
//!
//! Shared-space graph model, mutation service, broadcast hub and the client
//! session that keeps a local graph in step with everyone else in a space.

pub mod audit;
pub mod camera;
pub mod delta;
pub mod geometry;
pub mod gesture;
pub mod hit;
pub mod hub;
pub mod id;
pub mod input;
pub mod model;
pub mod persist;
pub mod policy;
pub mod reconcile;
pub mod service;
pub mod session;
pub mod store;
pub mod sync;
pub mod watch;

pub use audit::{AuditEvent, AuditKind, AuditLog, MemoryAuditLog};
pub use camera::Camera;
pub use delta::{Delta, Origin};
pub use gesture::{GestureConfig, GestureState, GestureStateMachine, Intent, Scene};
pub use hit::{HitConfig, Target};
pub use hub::{BroadcastHub, DeltaSource, LocalHub, Subscription};
pub use id::{EntityId, PlacementId, SessionId, SpaceId, UserId};
pub use input::{InputEvent, InputState, KeyEvent, Modifiers, MouseButton, PointerEvent};
pub use model::{Edge, EdgeCategory, Node, Permission, Placeable, Placement, Space, ValidationError};
pub use persist::{MemoryPersistence, PersistError, Persistence};
pub use policy::{AllowAll, EditorsOnly, Policy};
pub use reconcile::{Applied, SyncReconciler};
pub use service::{Ack, Actor, Mutation, MutationError, MutationResult, Remote, SpaceContents, SpaceService};
pub use session::{Session, SessionConfig};
pub use store::{GraphStore, StoreError};
pub use sync::{ClientMessage, ConnectionState, ServerMessage, SyncEvent};
pub use watch::{WatchReason, WatchRegistry};
