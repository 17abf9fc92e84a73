//! Authorization collaborator consulted before every mutation.

use crate::id::UserId;
use crate::model::{Permission, Placeable, Space};

/// What the actor is about to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Create,
    Update,
    Destroy,
}

/// Decides whether `actor` may perform `action` on `subject` in `space`.
///
/// `subject` is `None` for creations, before the entity has an id.
pub trait Policy: Send + Sync {
    fn allows(&self, actor: UserId, action: Action, space: &Space, subject: Option<Placeable>) -> bool;

    fn can_create(&self, actor: UserId, space: &Space) -> bool {
        self.allows(actor, Action::Create, space, None)
    }

    fn can_update(&self, actor: UserId, space: &Space, subject: Placeable) -> bool {
        self.allows(actor, Action::Update, space, Some(subject))
    }

    fn can_destroy(&self, actor: UserId, space: &Space, subject: Placeable) -> bool {
        self.allows(actor, Action::Destroy, space, Some(subject))
    }
}

/// Permits everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Policy for AllowAll {
    fn allows(&self, _: UserId, _: Action, _: &Space, _: Option<Placeable>) -> bool {
        true
    }
}

/// Commons spaces are open to everyone; other spaces only to their editors.
#[derive(Debug, Clone, Copy, Default)]
pub struct EditorsOnly;

impl Policy for EditorsOnly {
    fn allows(&self, actor: UserId, _: Action, space: &Space, _: Option<Placeable>) -> bool {
        space.permission == Permission::Commons || space.editors.contains(&actor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{EntityId, SpaceId};

    #[test]
    fn test_editors_only() {
        let mut space = Space::new(SpaceId(1), "private map", Permission::Private);
        space.editors.push(UserId(2));
        let subject = Placeable::Node(EntityId::Durable(1));

        assert!(!EditorsOnly.can_create(UserId(1), &space));
        assert!(EditorsOnly.can_create(UserId(2), &space));
        assert!(EditorsOnly.can_destroy(UserId(2), &space, subject));

        space.permission = Permission::Commons;
        assert!(EditorsOnly.can_update(UserId(1), &space, subject));
    }
}
