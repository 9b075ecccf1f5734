//! Entity identifiers with generational indices, and the entity index.
//!
//! Entities use a generational index pattern to safely reuse IDs
//! while detecting use-after-free scenarios. The [`EntityIndex`] maps every
//! live entity to its current table and row.

use std::fmt;

use bitflags::bitflags;

use crate::table::TableId;

/// Only the low 16 bits of a generation are significant. The remaining high
/// bits of a 64-bit id are reserved for id flags (see [`crate::id`]).
pub const GENERATION_MASK: u32 = 0xFFFF;

/// Entity indices below this value are reserved for builtin entities.
pub const FIRST_USER_INDEX: u32 = 64;

/// Generation counter to detect stale entity references.
/// Incremented each time an entity slot is recycled.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Generation(u32);

impl Generation {
    /// Create a new generation (starts at 0).
    #[must_use]
    pub const fn new() -> Self {
        Self(0)
    }

    /// Increment the generation counter, wrapping at 16 bits.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1) & GENERATION_MASK)
    }

    /// Get the raw generation value.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen{}", self.0)
    }
}

/// Raw entity index into the entity storage.
pub type EntityId = u32;

/// A unique identifier for an entity in the world.
///
/// Entities are represented as a combination of:
/// - `id`: Index into the entity array (low 32 bits)
/// - `generation`: Version counter to detect stale references (high 32 bits)
///
/// This allows safe entity ID reuse while detecting dangling references.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Entity {
    /// Index into the entity array.
    id: EntityId,
    /// Generation counter for this slot.
    generation: Generation,
}

impl Entity {
    /// The null entity. Index 0 is never handed out.
    pub const NULL: Entity = Entity {
        id: 0,
        generation: Generation(0),
    };
}

impl Entity {
    /// Create a new entity with the given ID and generation.
    #[must_use]
    pub const fn new(id: EntityId, generation: Generation) -> Self {
        Self {
            id,
            generation: Generation(generation.0 & GENERATION_MASK),
        }
    }

    /// Get the entity's index.
    #[must_use]
    pub const fn id(self) -> EntityId {
        self.id
    }

    /// Get the entity's generation.
    #[must_use]
    pub const fn generation(self) -> Generation {
        self.generation
    }

    /// Whether this is [`Entity::NULL`].
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.id == 0
    }

    /// Pack entity into a single u64 for efficient storage/transmission.
    #[must_use]
    pub const fn to_bits(self) -> u64 {
        ((self.generation.0 as u64) << 32) | (self.id as u64)
    }

    /// Unpack entity from a u64.
    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self {
            id: bits as u32,
            generation: Generation(((bits >> 32) as u32) & GENERATION_MASK),
        }
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity({}v{})", self.id, self.generation.0)
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.id, self.generation.0)
    }
}

bitflags! {
    /// Per-entity bookkeeping flags kept in the entity index.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct EntityFlags: u32 {
        /// The entity is the target of at least one traversable pair.
        const TRAVERSABLE_TARGET = 1 << 0;
        /// A delete of this entity is in progress.
        const DELETING = 1 << 2;
        /// The entity represents an observer.
        const OBSERVER = 1 << 3;
    }
}

/// Location of an entity within the table storage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntityLocation {
    /// The table containing this entity.
    pub table: TableId,
    /// Row index within the table.
    pub row: usize,
}

#[derive(Clone, Copy, Debug)]
struct Slot {
    generation: Generation,
    alive: bool,
    location: EntityLocation,
    flags: EntityFlags,
}

impl Slot {
    const fn dead() -> Self {
        Self {
            generation: Generation::new(),
            alive: false,
            location: EntityLocation {
                table: TableId::ROOT,
                row: 0,
            },
            flags: EntityFlags::empty(),
        }
    }
}

/// Bidirectional mapping between entities and their `(table, row)`.
///
/// Owns entity liveness: maintains a free list of recycled entity slots and
/// tracks the current generation for each slot.
pub struct EntityIndex {
    /// One slot per entity index.
    slots: Vec<Slot>,
    /// Free list of available entity IDs.
    free_list: Vec<EntityId>,
    /// Number of currently alive entities.
    alive_count: u32,
}

impl Default for EntityIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityIndex {
    /// Create a new entity index with the builtin range reserved.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Create an index with pre-allocated capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let reserved = FIRST_USER_INDEX as usize;
        let mut slots = Vec::with_capacity(capacity.max(reserved));
        slots.resize(reserved, Slot::dead());
        Self {
            slots,
            free_list: Vec::with_capacity(capacity / 4),
            alive_count: 0,
        }
    }

    /// Bring a reserved builtin index to life with generation 0.
    pub(crate) fn make_alive(&mut self, id: EntityId, table: TableId, row: usize) -> Entity {
        let slot = &mut self.slots[id as usize];
        debug_assert!(!slot.alive, "builtin index {id} already alive");
        slot.alive = true;
        slot.location = EntityLocation { table, row };
        self.alive_count += 1;
        Entity::new(id, slot.generation)
    }

    /// Allocate a new entity, reusing a freed slot when possible.
    pub fn create(&mut self, table: TableId, row: usize) -> Entity {
        self.alive_count += 1;

        if let Some(id) = self.free_list.pop() {
            // Reuse a recycled slot
            let slot = &mut self.slots[id as usize];
            slot.alive = true;
            slot.location = EntityLocation { table, row };
            slot.flags = EntityFlags::empty();
            Entity::new(id, slot.generation)
        } else {
            // Allocate a new slot
            let id = self.slots.len() as EntityId;
            let mut slot = Slot::dead();
            slot.alive = true;
            slot.location = EntityLocation { table, row };
            self.slots.push(slot);
            Entity::new(id, Generation::new())
        }
    }

    /// Release an entity, making its slot available for reuse.
    ///
    /// Returns `true` if the entity was alive.
    pub fn delete(&mut self, entity: Entity) -> bool {
        if !self.is_alive(entity) {
            return false;
        }

        let slot = &mut self.slots[entity.id() as usize];
        // Increment generation to invalidate existing references
        slot.generation = slot.generation.next();
        slot.alive = false;
        slot.flags = EntityFlags::empty();
        if entity.id() >= FIRST_USER_INDEX {
            self.free_list.push(entity.id());
        }
        self.alive_count -= 1;
        true
    }

    /// Check if an entity is currently alive.
    #[must_use]
    pub fn is_alive(&self, entity: Entity) -> bool {
        self.slots
            .get(entity.id() as usize)
            .is_some_and(|slot| slot.alive && slot.generation == entity.generation())
    }

    /// Resolve the alive entity currently occupying an index.
    #[must_use]
    pub fn get_alive(&self, id: EntityId) -> Option<Entity> {
        let slot = self.slots.get(id as usize)?;
        slot.alive.then(|| Entity::new(id, slot.generation))
    }

    /// Current location of an alive entity.
    #[must_use]
    pub fn location(&self, entity: Entity) -> Option<EntityLocation> {
        if !self.is_alive(entity) {
            return None;
        }
        Some(self.slots[entity.id() as usize].location)
    }

    /// Update the location of an alive entity.
    pub(crate) fn set_location(&mut self, entity: Entity, table: TableId, row: usize) {
        let slot = &mut self.slots[entity.id() as usize];
        debug_assert!(slot.alive && slot.generation == entity.generation());
        slot.location = EntityLocation { table, row };
    }

    /// Update only the row of an entity (after a swap-remove).
    pub(crate) fn set_row(&mut self, entity: Entity, row: usize) {
        let slot = &mut self.slots[entity.id() as usize];
        debug_assert!(slot.alive && slot.generation == entity.generation());
        slot.location.row = row;
    }

    /// Flags of an alive entity (empty for dead entities).
    #[must_use]
    pub fn flags(&self, entity: Entity) -> EntityFlags {
        if self.is_alive(entity) {
            self.slots[entity.id() as usize].flags
        } else {
            EntityFlags::empty()
        }
    }

    /// Flags by raw index, ignoring the generation.
    #[must_use]
    pub fn flags_by_index(&self, id: EntityId) -> EntityFlags {
        self.slots
            .get(id as usize)
            .filter(|slot| slot.alive)
            .map_or(EntityFlags::empty(), |slot| slot.flags)
    }

    pub(crate) fn add_flags(&mut self, entity: Entity, flags: EntityFlags) {
        if self.is_alive(entity) {
            self.slots[entity.id() as usize].flags |= flags;
        }
    }

    pub(crate) fn remove_flags(&mut self, entity: Entity, flags: EntityFlags) {
        if self.is_alive(entity) {
            self.slots[entity.id() as usize].flags -= flags;
        }
    }

    /// Get the number of currently alive entities.
    #[must_use]
    pub const fn alive_count(&self) -> u32 {
        self.alive_count
    }

    /// Get the total capacity (including recycled and reserved slots).
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

impl fmt::Debug for EntityIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityIndex")
            .field("alive", &self.alive_count)
            .field("slots", &self.slots.len())
            .field("free", &self.free_list.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_allocation() {
        let mut index = EntityIndex::new();

        let e1 = index.create(TableId::ROOT, 0);
        let e2 = index.create(TableId::ROOT, 1);

        assert_eq!(e1.id(), FIRST_USER_INDEX);
        assert_eq!(e2.id(), FIRST_USER_INDEX + 1);
        assert!(index.is_alive(e1));
        assert!(index.is_alive(e2));
        assert_eq!(index.alive_count(), 2);
    }

    #[test]
    fn test_entity_deallocation() {
        let mut index = EntityIndex::new();

        let e1 = index.create(TableId::ROOT, 0);
        assert!(index.delete(e1));
        assert!(!index.is_alive(e1));
        assert!(!index.delete(e1));
        assert_eq!(index.alive_count(), 0);

        // New allocation reuses the slot but with incremented generation
        let e2 = index.create(TableId::ROOT, 0);
        assert_eq!(e2.id(), e1.id());
        assert_ne!(e2.generation(), e1.generation());
        assert_ne!(e2.to_bits(), e1.to_bits());
        assert!(!index.is_alive(e1));
        assert!(index.is_alive(e2));
    }

    #[test]
    fn test_reserved_range_not_allocated() {
        let mut index = EntityIndex::new();
        assert!(index.get_alive(1).is_none());
        let builtin = index.make_alive(1, TableId::ROOT, 0);
        assert_eq!(builtin, Entity::new(1, Generation::new()));
        assert_eq!(index.get_alive(1), Some(builtin));
        assert!(index.create(TableId::ROOT, 1).id() >= FIRST_USER_INDEX);
    }

    #[test]
    fn test_generation_wraps_at_16_bits() {
        let generation = Generation(GENERATION_MASK);
        assert_eq!(generation.next(), Generation::new());
    }

    #[test]
    fn test_entity_bits_roundtrip() {
        let entity = Entity::new(12345, Generation(678));
        let bits = entity.to_bits();
        assert_eq!(bits >> 32, 678);
        assert_eq!(Entity::from_bits(bits), entity);
    }

    #[test]
    fn test_location_tracking() {
        let mut index = EntityIndex::new();
        let e = index.create(TableId::ROOT, 0);
        index.set_location(e, TableId::from_raw(3), 7);
        assert_eq!(
            index.location(e),
            Some(EntityLocation {
                table: TableId::from_raw(3),
                row: 7
            })
        );
        index.delete(e);
        assert_eq!(index.location(e), None);
    }
}
