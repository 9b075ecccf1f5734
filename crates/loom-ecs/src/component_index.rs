//! Component records - the per-id side index.
//!
//! For every id in use (including the wildcard forms of pairs) a
//! [`ComponentRecord`] lists the tables containing it, in registration order.
//! Relationship traits are cached as [`IdFlags`] on the plain record of the
//! relationship entity.

use std::sync::Arc;

use bitflags::bitflags;
use smallvec::SmallVec;

use crate::{
    FxHashMap, builtins,
    component::{TypeInfo, TypeInfoRegistry},
    entity::{Entity, EntityId},
    error::invariant,
    id::Id,
    table::{TableId, Type},
};

bitflags! {
    /// Relationship and component traits.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct IdFlags: u32 {
        const EXCLUSIVE = 1 << 0;
        const TRANSITIVE = 1 << 1;
        const REFLEXIVE = 1 << 2;
        const ACYCLIC = 1 << 3;
        const DONT_INHERIT = 1 << 4;
        const TRAVERSABLE = 1 << 5;
        const FINAL = 1 << 6;
        const SYMMETRIC = 1 << 7;
        const TAG = 1 << 8;

        const ON_DELETE_REMOVE = 1 << 10;
        const ON_DELETE_DELETE = 1 << 11;
        const ON_DELETE_PANIC = 1 << 12;
        const ON_DELETE_TARGET_REMOVE = 1 << 13;
        const ON_DELETE_TARGET_DELETE = 1 << 14;
        const ON_DELETE_TARGET_PANIC = 1 << 15;

        const ON_DELETE_MASK = Self::ON_DELETE_REMOVE.bits()
            | Self::ON_DELETE_DELETE.bits()
            | Self::ON_DELETE_PANIC.bits();
        const ON_DELETE_TARGET_MASK = Self::ON_DELETE_TARGET_REMOVE.bits()
            | Self::ON_DELETE_TARGET_DELETE.bits()
            | Self::ON_DELETE_TARGET_PANIC.bits();
    }
}

impl IdFlags {
    /// Flag set by adding a trait tag to a relationship entity.
    #[must_use]
    pub fn for_trait(tag: Entity) -> Self {
        match tag {
            t if t == builtins::EXCLUSIVE => Self::EXCLUSIVE,
            t if t == builtins::TRANSITIVE => Self::TRANSITIVE,
            t if t == builtins::REFLEXIVE => Self::REFLEXIVE,
            t if t == builtins::ACYCLIC => Self::ACYCLIC,
            t if t == builtins::DONT_INHERIT => Self::DONT_INHERIT,
            t if t == builtins::TRAVERSABLE => Self::TRAVERSABLE,
            t if t == builtins::FINAL => Self::FINAL,
            t if t == builtins::SYMMETRIC => Self::SYMMETRIC,
            t if t == builtins::TAG => Self::TAG,
            _ => Self::empty(),
        }
    }

    /// Flag set by a `(OnDelete, action)` or `(OnDeleteTarget, action)` pair.
    #[must_use]
    pub fn for_policy(kind: u32, action: u32) -> Self {
        let on_target = kind == builtins::ON_DELETE_TARGET.id();
        if kind != builtins::ON_DELETE.id() && !on_target {
            return Self::empty();
        }
        match (action, on_target) {
            (a, false) if a == builtins::REMOVE.id() => Self::ON_DELETE_REMOVE,
            (a, false) if a == builtins::DELETE.id() => Self::ON_DELETE_DELETE,
            (a, false) if a == builtins::PANIC.id() => Self::ON_DELETE_PANIC,
            (a, true) if a == builtins::REMOVE.id() => Self::ON_DELETE_TARGET_REMOVE,
            (a, true) if a == builtins::DELETE.id() => Self::ON_DELETE_TARGET_DELETE,
            (a, true) if a == builtins::PANIC.id() => Self::ON_DELETE_TARGET_PANIC,
            _ => Self::empty(),
        }
    }
}

/// What to do with holders of an id when the id's entity is deleted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CleanupAction {
    Remove,
    Delete,
    Panic,
}

impl CleanupAction {
    pub(crate) fn on_delete(flags: IdFlags) -> Self {
        if flags.contains(IdFlags::ON_DELETE_PANIC) {
            Self::Panic
        } else if flags.contains(IdFlags::ON_DELETE_DELETE) {
            Self::Delete
        } else {
            Self::Remove
        }
    }

    pub(crate) fn on_delete_target(flags: IdFlags) -> Self {
        if flags.contains(IdFlags::ON_DELETE_TARGET_PANIC) {
            Self::Panic
        } else if flags.contains(IdFlags::ON_DELETE_TARGET_DELETE) {
            Self::Delete
        } else {
            Self::Remove
        }
    }
}

/// A table's registration with a component record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TableRecord {
    pub table: TableId,
    /// Index of the first matching id in the table's type.
    pub index: u16,
    /// Number of ids in the type matching the record's id.
    pub count: u16,
    /// Column of the first match, if it carries data.
    pub column: Option<u16>,
}

/// Per-id side index.
#[derive(Debug)]
pub struct ComponentRecord {
    id: Id,
    flags: IdFlags,
    /// Table registrations in registration order.
    tables: Vec<TableRecord>,
    table_map: FxHashMap<TableId, usize>,
    type_info: Option<Arc<TypeInfo>>,
    /// For `(ChildOf, parent)` records: depth of the parent's children.
    depth: u32,
    /// Number of observers registered for this id.
    observers: u32,
}

impl ComponentRecord {
    fn new(id: Id, type_info: Option<Arc<TypeInfo>>) -> Self {
        Self {
            id,
            flags: IdFlags::empty(),
            tables: Vec::new(),
            table_map: FxHashMap::default(),
            type_info,
            depth: 0,
            observers: 0,
        }
    }

    #[must_use]
    pub const fn id(&self) -> Id {
        self.id
    }

    /// Traits of this id. For pairs, use [`ComponentIndex::flags`] which
    /// reads the relationship's record.
    #[must_use]
    pub const fn flags(&self) -> IdFlags {
        self.flags
    }

    pub(crate) fn set_flags(&mut self, flags: IdFlags) {
        self.flags = flags;
    }

    #[must_use]
    pub fn type_info(&self) -> Option<&Arc<TypeInfo>> {
        self.type_info.as_ref()
    }

    pub(crate) fn set_type_info(&mut self, info: Option<Arc<TypeInfo>>) {
        self.type_info = info;
    }

    /// Tables containing this id, in registration order.
    #[must_use]
    pub fn tables(&self) -> &[TableRecord] {
        &self.tables
    }

    #[must_use]
    pub fn table(&self, table: TableId) -> Option<&TableRecord> {
        self.table_map.get(&table).map(|&i| &self.tables[i])
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Hierarchy depth for `(ChildOf, parent)` records.
    #[must_use]
    pub const fn childof_depth(&self) -> u32 {
        self.depth
    }

    pub(crate) fn set_childof_depth(&mut self, depth: u32) {
        self.depth = depth;
    }

    #[must_use]
    pub const fn observer_count(&self) -> u32 {
        self.observers
    }

    pub(crate) fn register_table(&mut self, record: TableRecord) {
        invariant!(
            !self.table_map.contains_key(&record.table),
            "table {:?} registered twice for {:?}",
            record.table,
            self.id
        );
        self.table_map.insert(record.table, self.tables.len());
        self.tables.push(record);
    }

    pub(crate) fn unregister_table(&mut self, table: TableId) -> bool {
        let Some(pos) = self.table_map.remove(&table) else {
            return false;
        };
        self.tables.remove(pos);
        for slot in self.table_map.values_mut() {
            if *slot > pos {
                *slot -= 1;
            }
        }
        true
    }
}

/// All component records of a world.
#[derive(Debug, Default)]
pub struct ComponentIndex {
    records: FxHashMap<Id, ComponentRecord>,
    /// Record ids mentioning each entity index, in either half.
    mentions: FxHashMap<EntityId, SmallVec<[Id; 4]>>,
}

impl ComponentIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the record for an id. `None` means "no tables", not an error.
    #[must_use]
    pub fn get(&self, id: Id) -> Option<&ComponentRecord> {
        self.records.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: Id) -> Option<&mut ComponentRecord> {
        self.records.get_mut(&id)
    }

    /// Get or create the record for `id`.
    ///
    /// For concrete pairs the `(R, *)`, `(*, T)` and `(*, *)` parents are
    /// created too, so wildcard terms can enumerate their tables.
    pub fn ensure(&mut self, id: Id, types: &TypeInfoRegistry) -> &mut ComponentRecord {
        if !self.records.contains_key(&id) {
            for parent in id.wildcard_parents() {
                if !self.records.contains_key(&parent) {
                    self.insert(parent, ComponentRecord::new(parent, None));
                }
            }
            let info = self.resolve_type_info(id, types);
            self.insert(id, ComponentRecord::new(id, info));
        }
        match self.records.get_mut(&id) {
            Some(record) => record,
            None => crate::error::fatal!("component record for {:?} vanished", id),
        }
    }

    fn insert(&mut self, id: Id, record: ComponentRecord) {
        for index in mentioned(id) {
            self.mentions.entry(index).or_default().push(id);
        }
        self.records.insert(id, record);
    }

    /// Type info for the data stored under `id`.
    ///
    /// A pair uses the relationship's info if it carries data and is not a
    /// tag, else the target's. Wildcards, flagged ids and tags carry none.
    pub(crate) fn resolve_type_info(&self, id: Id, types: &TypeInfoRegistry) -> Option<Arc<TypeInfo>> {
        if id.is_wildcard() || id.flags() != 0 {
            return None;
        }
        if !id.is_pair() {
            return types.get(id).cloned();
        }
        let rel = Id::from_bits(u64::from(id.first()));
        if self.flags(rel).contains(IdFlags::TAG) {
            return None;
        }
        types
            .get(rel)
            .filter(|info| info.size() > 0)
            .or_else(|| types.get(Id::from_bits(u64::from(id.second()))))
            .cloned()
    }

    /// Traits for an id; pairs read the flags of their relationship.
    #[must_use]
    pub fn flags(&self, id: Id) -> IdFlags {
        let key = if id.is_pair() {
            Id::from_bits(u64::from(id.first()))
        } else {
            id.strip_flags()
        };
        self.records.get(&key).map_or(IdFlags::empty(), |r| r.flags)
    }

    /// Register a table under every record its type matches.
    pub(crate) fn register_table(
        &mut self,
        table: TableId,
        ty: &Type,
        column_of: impl Fn(usize) -> Option<usize>,
        types: &TypeInfoRegistry,
    ) {
        for (index, id) in ty.iter().enumerate() {
            self.ensure(id, types).register_table(TableRecord {
                table,
                index: index as u16,
                count: 1,
                column: column_of(index).map(|c| c as u16),
            });
            for parent in id.wildcard_parents() {
                let record = self.ensure(parent, types);
                match record.table_map.get(&table) {
                    Some(&slot) => record.tables[slot].count += 1,
                    None => record.register_table(TableRecord {
                        table,
                        index: index as u16,
                        count: 1,
                        column: column_of(index).map(|c| c as u16),
                    }),
                }
            }
        }
    }

    /// Remove a table from every record its type matches.
    pub(crate) fn unregister_table(&mut self, table: TableId, ty: &Type) {
        for id in ty.iter() {
            let parents = id.wildcard_parents();
            for key in std::iter::once(id).chain(parents) {
                if let Some(record) = self.records.get_mut(&key) {
                    record.unregister_table(table);
                }
            }
        }
    }

    /// Drop records that mention `entity` in any position and have no tables.
    pub(crate) fn remove_for_entity(&mut self, entity: Entity) -> usize {
        let index = entity.id();
        let Some(ids) = self.mentions.remove(&index) else {
            return 0;
        };
        let mut kept: SmallVec<[Id; 4]> = SmallVec::new();
        let mut removed = 0;
        for id in ids {
            match self.records.get(&id).map(|record| record.tables.is_empty()) {
                Some(true) => {
                    self.records.remove(&id);
                    removed += 1;
                    for other in mentioned(id).filter(|&other| other != index) {
                        if let Some(list) = self.mentions.get_mut(&other) {
                            list.retain(|m| *m != id);
                        }
                    }
                }
                Some(false) => kept.push(id),
                None => {}
            }
        }
        if !kept.is_empty() {
            self.mentions.insert(index, kept);
        }
        removed
    }

    pub(crate) fn add_observer(&mut self, id: Id, types: &TypeInfoRegistry) {
        self.ensure(id, types).observers += 1;
    }

    pub(crate) fn remove_observer(&mut self, id: Id) {
        if let Some(record) = self.records.get_mut(&id) {
            record.observers = record.observers.saturating_sub(1);
        }
    }

    /// Whether any observer listens to `id` or one of its wildcard forms.
    #[must_use]
    pub fn has_observers(&self, id: Id) -> bool {
        let observed = |key: Id| self.records.get(&key).is_some_and(|r| r.observers > 0);
        observed(id) || id.wildcard_parents().into_iter().any(observed)
    }

    /// Depth recorded for `(ChildOf, parent)`, 0 when unknown.
    #[must_use]
    pub fn childof_depth(&self, parent: Entity) -> u32 {
        self.records
            .get(&Id::pair(builtins::CHILD_OF, parent))
            .map_or(0, ComponentRecord::childof_depth)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Non-wildcard entity indices an id is built from.
fn mentioned(id: Id) -> impl Iterator<Item = EntityId> {
    let first = id.first();
    let second = id.is_pair().then(|| id.second());
    std::iter::once(first)
        .chain(second.filter(|&s| s != first))
        .filter(|&index| index != builtins::WILDCARD.id() && index != builtins::ANY.id())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Generation;

    fn e(index: u32) -> Entity {
        Entity::new(index, Generation::new())
    }

    #[test]
    fn test_ensure_pair_creates_wildcard_parents() {
        let types = TypeInfoRegistry::new();
        let mut index = ComponentIndex::new();
        let likes = e(100);
        let bob = e(101);

        index.ensure(Id::pair(likes, bob), &types);

        assert!(index.get(Id::pair(likes, builtins::WILDCARD)).is_some());
        assert!(index.get(Id::pair(builtins::WILDCARD, bob)).is_some());
        assert!(index.get(Id::pair(builtins::WILDCARD, builtins::WILDCARD)).is_some());
        assert!(index.get(Id::of(likes)).is_none());
    }

    #[test]
    fn test_register_counts_wildcard_matches() {
        let types = TypeInfoRegistry::new();
        let mut index = ComponentIndex::new();
        let likes = e(100);
        let ty = Type::new([Id::pair(likes, e(101)), Id::pair(likes, e(102))]);
        let table = TableId::from_raw(4);

        index.register_table(table, &ty, |_| None, &types);

        let wildcard = index.get(Id::pair(likes, builtins::WILDCARD)).unwrap();
        let record = wildcard.table(table).unwrap();
        assert_eq!(record.index, 0);
        assert_eq!(record.count, 2);

        index.unregister_table(table, &ty);
        assert!(index.get(Id::pair(likes, builtins::WILDCARD)).unwrap().is_empty());
        assert!(index.get(Id::pair(likes, e(101))).unwrap().is_empty());
    }

    #[test]
    fn test_registration_order_preserved_on_unregister() {
        let types = TypeInfoRegistry::new();
        let mut index = ComponentIndex::new();
        let tag = Id::of(e(100));
        let ty = Type::new([tag]);
        for raw in 1..=3 {
            index.register_table(TableId::from_raw(raw), &ty, |_| None, &types);
        }
        index.unregister_table(TableId::from_raw(2), &ty);

        let tables: Vec<_> = index.get(tag).unwrap().tables().iter().map(|r| r.table).collect();
        assert_eq!(tables, vec![TableId::from_raw(1), TableId::from_raw(3)]);
        assert!(index.get(tag).unwrap().table(TableId::from_raw(3)).is_some());
    }

    #[test]
    fn test_pair_flags_come_from_relationship() {
        let types = TypeInfoRegistry::new();
        let mut index = ComponentIndex::new();
        let rel = e(100);
        index.ensure(Id::of(rel), &types).set_flags(IdFlags::EXCLUSIVE);

        assert!(index.flags(Id::pair(rel, e(101))).contains(IdFlags::EXCLUSIVE));
        assert!(index.flags(Id::of(e(101))).is_empty());
    }

    #[test]
    fn test_policy_flags() {
        assert_eq!(
            IdFlags::for_policy(builtins::ON_DELETE.id(), builtins::DELETE.id()),
            IdFlags::ON_DELETE_DELETE
        );
        assert_eq!(
            IdFlags::for_policy(builtins::ON_DELETE_TARGET.id(), builtins::PANIC.id()),
            IdFlags::ON_DELETE_TARGET_PANIC
        );
        assert_eq!(CleanupAction::on_delete(IdFlags::empty()), CleanupAction::Remove);
    }

    #[test]
    fn test_remove_for_entity_only_touches_mentions() {
        let types = TypeInfoRegistry::new();
        let mut index = ComponentIndex::new();
        let likes = e(100);
        let bob = e(101);
        let alice = e(102);
        index.ensure(Id::pair(likes, bob), &types);
        index.ensure(Id::pair(likes, alice), &types);
        index.ensure(Id::of(alice), &types);

        // (likes, bob) and (*, bob)
        assert_eq!(index.remove_for_entity(bob), 2);
        assert!(index.get(Id::pair(likes, bob)).is_none());
        assert!(index.get(Id::pair(likes, alice)).is_some());
        assert!(index.get(Id::pair(likes, builtins::WILDCARD)).is_some());
        assert_eq!(index.remove_for_entity(bob), 0);

        // (likes, *) and (likes, alice)
        assert_eq!(index.remove_for_entity(likes), 2);
        assert!(index.get(Id::of(alice)).is_some());
        assert!(index.get(Id::pair(builtins::WILDCARD, alice)).is_some());
    }
}
