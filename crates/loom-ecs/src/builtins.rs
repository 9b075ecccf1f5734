//! Builtin entities.
//!
//! Every world creates these at fixed indices during bootstrap, so they are
//! usable as constants without a world handle. User entities are allocated
//! from [`crate::entity::FIRST_USER_INDEX`] onwards.

use crate::entity::{Entity, Generation};

const fn builtin(index: u32) -> Entity {
    Entity::new(index, Generation::new())
}

/// Matches any id (or any half of a pair), once per match.
pub const WILDCARD: Entity = builtin(1);
/// Matches any id (or any half of a pair), at most once per table.
pub const ANY: Entity = builtin(2);
/// The implicit `$this` variable of a query.
pub const THIS: Entity = builtin(3);

/// Hierarchy relationship. Exclusive, acyclic, traversable; children are
/// deleted with their parent.
pub const CHILD_OF: Entity = builtin(4);
/// Inheritance relationship. Transitive, reflexive and traversable.
pub const IS_A: Entity = builtin(5);

/// `R(a, b), R(b, c) => R(a, c)`.
pub const TRANSITIVE: Entity = builtin(6);
/// `R(a, a)` holds for every `a`.
pub const REFLEXIVE: Entity = builtin(7);
/// The entity can not be used as an `IsA` base.
pub const FINAL: Entity = builtin(8);
/// An entity can have at most one `(R, *)` pair.
pub const EXCLUSIVE: Entity = builtin(9);
/// The relationship graph has no cycles.
pub const ACYCLIC: Entity = builtin(10);
/// The component is not inherited through `IsA`.
pub const DONT_INHERIT: Entity = builtin(11);
/// Queries and observers may walk up the relationship.
pub const TRAVERSABLE: Entity = builtin(12);
/// `R(a, b) => R(b, a)`.
pub const SYMMETRIC: Entity = builtin(13);
/// Pairs of the relationship never carry data.
pub const TAG: Entity = builtin(14);

/// Cleanup policy applied when the entity itself is deleted.
pub const ON_DELETE: Entity = builtin(15);
/// Cleanup policy applied when a target of the relationship is deleted.
pub const ON_DELETE_TARGET: Entity = builtin(16);
/// Cleanup action: remove the id from holders.
pub const REMOVE: Entity = builtin(17);
/// Cleanup action: delete holders.
pub const DELETE: Entity = builtin(18);
/// Cleanup action: refuse the delete (fatal).
pub const PANIC: Entity = builtin(19);

/// Emitted after an id is added to an entity.
pub const ON_ADD: Entity = builtin(20);
/// Emitted before an id is removed from an entity.
pub const ON_REMOVE: Entity = builtin(21);
/// Emitted after a component value is assigned.
pub const ON_SET: Entity = builtin(22);
/// Observer event that fires only when an entity starts or stops matching.
pub const MONITOR: Entity = builtin(23);

/// Entities with this tag are skipped by queries and observers.
pub const DISABLED: Entity = builtin(24);
/// Template entities, skipped by queries unless requested.
pub const PREFAB: Entity = builtin(25);
/// Tag on observer entities.
pub const OBSERVER: Entity = builtin(26);
/// Tag on entities that have registered type info.
pub const COMPONENT: Entity = builtin(27);

/// Names given to builtins during bootstrap.
pub(crate) const NAMES: &[(Entity, &str)] = &[
    (WILDCARD, "*"),
    (ANY, "_"),
    (THIS, "This"),
    (CHILD_OF, "ChildOf"),
    (IS_A, "IsA"),
    (TRANSITIVE, "Transitive"),
    (REFLEXIVE, "Reflexive"),
    (FINAL, "Final"),
    (EXCLUSIVE, "Exclusive"),
    (ACYCLIC, "Acyclic"),
    (DONT_INHERIT, "DontInherit"),
    (TRAVERSABLE, "Traversable"),
    (SYMMETRIC, "Symmetric"),
    (TAG, "Tag"),
    (ON_DELETE, "OnDelete"),
    (ON_DELETE_TARGET, "OnDeleteTarget"),
    (REMOVE, "Remove"),
    (DELETE, "Delete"),
    (PANIC, "Panic"),
    (ON_ADD, "OnAdd"),
    (ON_REMOVE, "OnRemove"),
    (ON_SET, "OnSet"),
    (MONITOR, "Monitor"),
    (DISABLED, "Disabled"),
    (PREFAB, "Prefab"),
    (OBSERVER, "Observer"),
    (COMPONENT, "Component"),
];

/// Whether the entity is one of the trait tags handled by the world.
#[must_use]
pub const fn is_trait(entity: Entity) -> bool {
    let index = entity.id();
    index >= TRANSITIVE.id() && index <= TAG.id()
}
