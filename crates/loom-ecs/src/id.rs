//! Component ids, relationship pairs and id flags.
//!
//! An [`Id`] is what a table's type is made of. It is either a plain entity
//! (used as a component or tag), a pair `(relationship, target)` or one of
//! those carrying flag bits in the top byte.
//!
//! Ids never carry generations: a plain id stores only the entity index, and a
//! pair stores the indices of both halves. The world resolves an index back to
//! the live entity through [`crate::EntityIndex::get_alive`]. Deleting an
//! entity removes every id that mentions it, so stale ids never survive.

use std::fmt;

use crate::{
    builtins,
    entity::{Entity, EntityId},
};

/// Number of bits available to the relationship half of a pair.
const PAIR_FIRST_BITS: u32 = 24;
const PAIR_FIRST_MASK: u64 = (1 << PAIR_FIRST_BITS) - 1;

/// Identifier of a component, tag or relationship pair.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Id(u64);

impl Id {
    /// Marks an id as a `(relationship, target)` pair.
    pub const PAIR: u64 = 1 << 63;
    /// When present on a base (prefab) entity, instances get their own copy
    /// of the component when they add `(IsA, base)`.
    pub const AUTO_OVERRIDE: u64 = 1 << 62;
    /// The component can be enabled/disabled per entity without a table move.
    pub const TOGGLE: u64 = 1 << 61;
    /// All bits that may carry flags.
    pub const FLAGS_MASK: u64 = 0xFF << 56;

    /// The null id. Never stored in a table.
    pub const NULL: Id = Id(0);

    /// Plain id for an entity used as a component or tag.
    #[must_use]
    pub const fn of(entity: Entity) -> Self {
        Self(entity.id() as u64)
    }

    /// Pair id `(relationship, target)`.
    ///
    /// Use [`builtins::WILDCARD`] or [`builtins::ANY`] for either half to
    /// build a pattern usable only for matching. The relationship index must
    /// fit the pair range; see [`Id::try_pair`].
    #[must_use]
    pub const fn pair(relationship: Entity, target: Entity) -> Self {
        debug_assert!(
            relationship.id() as u64 <= PAIR_FIRST_MASK,
            "relationship index outside the pair range"
        );
        Self::pair_from_indices(relationship.id(), target.id())
    }

    /// Pair id `(relationship, target)`, or `None` when the relationship
    /// index does not fit the 24 bits a pair reserves for it.
    #[must_use]
    pub const fn try_pair(relationship: Entity, target: Entity) -> Option<Self> {
        if relationship.id() as u64 > PAIR_FIRST_MASK {
            return None;
        }
        Some(Self::pair_from_indices(relationship.id(), target.id()))
    }

    /// Pair id from raw entity indices.
    #[must_use]
    pub const fn pair_from_indices(first: EntityId, second: EntityId) -> Self {
        Self(Self::PAIR | (((first as u64) & PAIR_FIRST_MASK) << 32) | second as u64)
    }

    /// Reconstruct an id from its raw bits.
    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Raw bits of this id.
    #[must_use]
    pub const fn to_bits(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Whether this id is a pair.
    #[must_use]
    pub const fn is_pair(self) -> bool {
        self.0 & Self::PAIR != 0
    }

    /// Flag bits other than the pair marker.
    #[must_use]
    pub const fn flags(self) -> u64 {
        self.0 & Self::FLAGS_MASK & !Self::PAIR
    }

    /// Whether this id carries the auto-override flag.
    #[must_use]
    pub const fn is_auto_override(self) -> bool {
        self.0 & Self::AUTO_OVERRIDE != 0
    }

    /// Whether this id carries the toggle flag.
    #[must_use]
    pub const fn is_toggle(self) -> bool {
        self.0 & Self::TOGGLE != 0
    }

    /// This id with the auto-override flag set.
    #[must_use]
    pub const fn auto_override(self) -> Self {
        Self(self.0 | Self::AUTO_OVERRIDE)
    }

    /// This id with the toggle flag set.
    #[must_use]
    pub const fn toggle(self) -> Self {
        Self(self.0 | Self::TOGGLE)
    }

    /// This id with all flag bits except the pair marker cleared.
    #[must_use]
    pub const fn strip_flags(self) -> Self {
        Self(self.0 & !(Self::FLAGS_MASK & !Self::PAIR))
    }

    /// Entity index of a plain id, or the relationship index of a pair.
    #[must_use]
    pub const fn first(self) -> EntityId {
        if self.is_pair() {
            ((self.0 >> 32) & PAIR_FIRST_MASK) as EntityId
        } else {
            self.0 as EntityId
        }
    }

    /// Target index of a pair, `0` for plain ids.
    #[must_use]
    pub const fn second(self) -> EntityId {
        if self.is_pair() {
            self.0 as EntityId
        } else {
            0
        }
    }

    /// Whether this id is a wildcard pattern (`*`, `_`, or a pair with a
    /// wildcard half). Wildcards never resolve to stored data.
    #[must_use]
    pub const fn is_wildcard(self) -> bool {
        let first = self.first();
        if is_wildcard_index(first) {
            return true;
        }
        self.is_pair() && is_wildcard_index(self.second())
    }

    /// Whether `self` (a concrete id) matches `pattern`.
    ///
    /// `*` and `_` halves in the pattern match anything. A plain `*` pattern
    /// matches every plain id; `(*, *)` matches every pair.
    #[must_use]
    pub const fn matches(self, pattern: Id) -> bool {
        if self.0 == pattern.0 {
            return true;
        }
        if self.flags() != pattern.flags() {
            return false;
        }
        if self.is_pair() != pattern.is_pair() {
            return false;
        }
        let first_ok =
            is_wildcard_index(pattern.first()) || pattern.first() == self.first();
        if !self.is_pair() {
            return first_ok;
        }
        first_ok && (is_wildcard_index(pattern.second()) || pattern.second() == self.second())
    }

    /// The wildcard patterns a concrete id is registered under.
    ///
    /// Pairs map to `(R, *)`, `(*, T)` and `(*, *)`; plain ids map to `*`.
    #[must_use]
    pub fn wildcard_parents(self) -> smallvec::SmallVec<[Id; 3]> {
        let wildcard = builtins::WILDCARD.id();
        let mut parents = smallvec::SmallVec::new();
        if self.is_wildcard() {
            return parents;
        }
        let flags = self.flags();
        if self.is_pair() {
            parents.push(Id(Id::pair_from_indices(self.first(), wildcard).0 | flags));
            parents.push(Id(Id::pair_from_indices(wildcard, self.second()).0 | flags));
            parents.push(Id(Id::pair_from_indices(wildcard, wildcard).0 | flags));
        } else if flags == 0 {
            parents.push(Id::of(builtins::WILDCARD));
        }
        parents
    }
}

const fn is_wildcard_index(index: EntityId) -> bool {
    index == builtins::WILDCARD.id() || index == builtins::ANY.id()
}

impl From<Entity> for Id {
    fn from(entity: Entity) -> Self {
        Self::of(entity)
    }
}

/// Anything that names an id: an entity used as a component or tag, or a
/// built [`Id`].
///
/// Entities keep their generation until the world has checked that the
/// handle is still alive, so a stale handle can not alias the entity that
/// recycled its index.
pub trait IntoId: Copy {
    fn into_id(self) -> Id;

    /// Handle the id was named by, if it still carries a generation.
    fn handle(self) -> Option<Entity> {
        None
    }
}

impl IntoId for Id {
    fn into_id(self) -> Id {
        self
    }
}

impl IntoId for Entity {
    fn into_id(self) -> Id {
        Id::of(self)
    }

    fn handle(self) -> Option<Entity> {
        Some(self)
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_auto_override() {
            f.write_str("AUTO_OVERRIDE|")?;
        }
        if self.is_toggle() {
            f.write_str("TOGGLE|")?;
        }
        if self.is_pair() {
            write!(f, "({}, {})", half_name(self.first()), half_name(self.second()))
        } else {
            write!(f, "Id({})", half_name(self.first()))
        }
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

fn half_name(index: EntityId) -> String {
    match index {
        i if i == builtins::WILDCARD.id() => "*".to_owned(),
        i if i == builtins::ANY.id() => "_".to_owned(),
        i => i.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Generation;

    fn e(index: u32) -> Entity {
        Entity::new(index, Generation::new())
    }

    #[test]
    fn test_try_pair_rejects_wide_relationship() {
        let target = e(0x41);
        assert_eq!(Id::try_pair(e(0x41), target), Some(Id::pair(e(0x41), target)));
        assert_eq!(Id::try_pair(e(0x100_0041), target), None);
        assert!(Id::try_pair(e(0xFF_FFFF), target).is_some());
    }

    #[test]
    fn test_pair_halves() {
        let likes = e(100);
        let bob = e(200);
        let pair = Id::pair(likes, bob);

        assert!(pair.is_pair());
        assert_eq!(pair.first(), 100);
        assert_eq!(pair.second(), 200);
        assert!(!pair.is_wildcard());
    }

    #[test]
    fn test_generation_not_part_of_id() {
        let a = Entity::new(70, Generation::new());
        let b = Entity::new(70, Generation::new().next());
        assert_eq!(Id::of(a), Id::of(b));
    }

    #[test]
    fn test_wildcard_matching() {
        let likes = e(100);
        let bob = e(200);
        let alice = e(201);

        let concrete = Id::pair(likes, bob);
        assert!(concrete.matches(Id::pair(likes, builtins::WILDCARD)));
        assert!(concrete.matches(Id::pair(builtins::WILDCARD, bob)));
        assert!(concrete.matches(Id::pair(builtins::ANY, builtins::ANY)));
        assert!(!concrete.matches(Id::pair(likes, alice)));
        assert!(!concrete.matches(Id::of(likes)));

        assert!(Id::of(bob).matches(Id::of(builtins::WILDCARD)));
        assert!(!concrete.matches(Id::of(builtins::WILDCARD)));
    }

    #[test]
    fn test_flags_sort_after_plain_ids() {
        let plain = Id::of(e(500));
        let toggled = Id::of(e(3)).toggle();
        let pair = Id::pair(e(3), e(4));

        assert!(plain < toggled);
        assert!(toggled < pair);
        assert_eq!(toggled.strip_flags(), Id::of(e(3)));
        assert!(pair.strip_flags().is_pair());
    }

    #[test]
    fn test_wildcard_parents() {
        let pair = Id::pair(e(100), e(200));
        let parents = pair.wildcard_parents();
        assert_eq!(parents.len(), 3);
        assert!(parents.iter().all(|p| pair.matches(*p)));
        assert!(Id::pair(e(100), builtins::WILDCARD).wildcard_parents().is_empty());
    }
}
