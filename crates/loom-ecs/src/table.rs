//! Archetype tables - entities with identical composition.
//!
//! A table owns a sorted [`Type`], one [`Column`] per data-carrying id, the
//! entity array, per-row enable bits for toggle ids and the add/remove edges
//! to neighboring tables.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

use bitflags::bitflags;
use smallvec::SmallVec;

use crate::{
    FxHashMap, builtins,
    component::TypeInfo,
    entity::Entity,
    error::invariant,
    id::Id,
    storage::{BitSet, Column},
};

/// Unique identifier for a table.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableId(u32);

impl TableId {
    /// The root table (empty type). Never deleted.
    pub const ROOT: Self = Self(0);

    /// Create a table ID from a raw value.
    #[must_use]
    pub const fn from_raw(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw ID value.
    #[must_use]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    #[must_use]
    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TableId({})", self.0)
    }
}

/// Sorted, duplicate-free list of ids describing a table's composition.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct Type(SmallVec<[Id; 8]>);

impl Type {
    /// The empty type.
    #[must_use]
    pub fn empty() -> Self {
        Self(SmallVec::new())
    }

    /// Build a type from ids in any order.
    #[must_use]
    pub fn new(ids: impl IntoIterator<Item = Id>) -> Self {
        let mut ids: SmallVec<[Id; 8]> = ids.into_iter().collect();
        ids.sort_unstable();
        ids.dedup();
        Self(ids)
    }

    #[must_use]
    pub fn as_slice(&self) -> &[Id] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Id> + '_ {
        self.0.iter().copied()
    }

    #[must_use]
    pub fn contains(&self, id: Id) -> bool {
        self.0.binary_search(&id).is_ok()
    }

    /// Position of `id` within the type.
    #[must_use]
    pub fn index_of(&self, id: Id) -> Option<usize> {
        self.0.binary_search(&id).ok()
    }

    /// This type plus `id`, or `None` when already present.
    #[must_use]
    pub fn with(&self, id: Id) -> Option<Self> {
        let pos = self.0.binary_search(&id).err()?;
        let mut ids = self.0.clone();
        ids.insert(pos, id);
        Some(Self(ids))
    }

    /// This type minus `id`, or `None` when not present.
    #[must_use]
    pub fn without(&self, id: Id) -> Option<Self> {
        let pos = self.0.binary_search(&id).ok()?;
        let mut ids = self.0.clone();
        ids.remove(pos);
        Some(Self(ids))
    }

    /// First id matching a (possibly wildcard) pattern, at or after `start`.
    #[must_use]
    pub fn find_match(&self, pattern: Id, start: usize) -> Option<(usize, Id)> {
        self.0
            .iter()
            .enumerate()
            .skip(start)
            .find(|(_, id)| id.matches(pattern))
            .map(|(i, id)| (i, *id))
    }
}

impl fmt::Debug for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.0.iter()).finish()
    }
}

bitflags! {
    /// Cached facts about a table's type.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct TableFlags: u32 {
        const HAS_CHILD_OF = 1 << 0;
        const HAS_IS_A = 1 << 1;
        const DISABLED = 1 << 2;
        const PREFAB = 1 << 3;
        const HAS_TOGGLE = 1 << 4;
        const HAS_PAIRS = 1 << 5;
    }
}

impl TableFlags {
    fn for_type(ty: &Type) -> Self {
        let mut flags = Self::empty();
        for id in ty.iter() {
            if id.is_toggle() {
                flags |= Self::HAS_TOGGLE;
            }
            if id.is_pair() {
                flags |= Self::HAS_PAIRS;
                if id.first() == builtins::CHILD_OF.id() {
                    flags |= Self::HAS_CHILD_OF;
                } else if id.first() == builtins::IS_A.id() {
                    flags |= Self::HAS_IS_A;
                }
            } else if id == Id::of(builtins::DISABLED) {
                flags |= Self::DISABLED;
            } else if id == Id::of(builtins::PREFAB) {
                flags |= Self::PREFAB;
            }
        }
        flags
    }
}

/// Cached transitions to neighboring tables, keyed by the id added/removed.
///
/// Edges are weak: they name tables by id and are dropped when either end
/// is deleted.
#[derive(Default, Debug)]
pub struct Edges {
    add: FxHashMap<Id, TableId>,
    remove: FxHashMap<Id, TableId>,
}

impl Edges {
    #[must_use]
    pub fn get_add(&self, id: Id) -> Option<TableId> {
        self.add.get(&id).copied()
    }

    #[must_use]
    pub fn get_remove(&self, id: Id) -> Option<TableId> {
        self.remove.get(&id).copied()
    }

    pub(crate) fn insert_add(&mut self, id: Id, table: TableId) {
        self.add.insert(id, table);
    }

    pub(crate) fn insert_remove(&mut self, id: Id, table: TableId) {
        self.remove.insert(id, table);
    }

    /// Drop every edge that leads to `table`.
    pub(crate) fn forget(&mut self, table: TableId) {
        self.add.retain(|_, t| *t != table);
        self.remove.retain(|_, t| *t != table);
    }

    /// All tables this table has edges to.
    pub(crate) fn neighbors(&self) -> impl Iterator<Item = TableId> + '_ {
        self.add.values().chain(self.remove.values()).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.add.len() + self.remove.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }
}

/// An archetype table.
pub struct Table {
    id: TableId,
    ty: Type,
    flags: TableFlags,
    entities: Vec<Entity>,
    /// Data columns, in type order.
    columns: Vec<Column>,
    /// Type index of each column.
    column_to_type: SmallVec<[u16; 8]>,
    /// Column index per type index (`None` for tags).
    type_to_column: SmallVec<[Option<u16>; 8]>,
    /// Enable bits per toggle id (keyed by the id without the toggle flag).
    toggles: SmallVec<[(Id, BitSet); 1]>,
    edges: Edges,
    /// Number of active iterators over this table.
    lock: AtomicU32,
}

impl Table {
    /// Create a table for `ty`.
    ///
    /// `infos` holds the type info for every id in `ty` (same order); ids
    /// without info, or with zero size, get no column.
    pub(crate) fn new(id: TableId, ty: Type, infos: &[Option<Arc<TypeInfo>>]) -> Self {
        invariant!(
            infos.len() == ty.len(),
            "table {:?}: {} type infos for {} ids",
            id,
            infos.len(),
            ty.len()
        );
        let mut columns = Vec::new();
        let mut column_to_type = SmallVec::new();
        let mut type_to_column = SmallVec::with_capacity(ty.len());
        let mut toggles = SmallVec::new();

        for (index, (id, info)) in ty.iter().zip(infos).enumerate() {
            match info {
                Some(info) if info.size() > 0 && !id.is_toggle() => {
                    type_to_column.push(Some(columns.len() as u16));
                    column_to_type.push(index as u16);
                    columns.push(Column::new(Arc::clone(info)));
                }
                _ => type_to_column.push(None),
            }
            if id.is_toggle() {
                toggles.push((id.strip_flags(), BitSet::new()));
            }
        }

        Self {
            id,
            flags: TableFlags::for_type(&ty),
            ty,
            entities: Vec::new(),
            columns,
            column_to_type,
            type_to_column,
            toggles,
            edges: Edges::default(),
            lock: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub const fn id(&self) -> TableId {
        self.id
    }

    /// The table's type (sorted id list).
    #[must_use]
    pub const fn ty(&self) -> &Type {
        &self.ty
    }

    #[must_use]
    pub const fn flags(&self) -> TableFlags {
        self.flags
    }

    /// Get the number of entities in this table.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Check if the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Get the entities in this table.
    #[must_use]
    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    #[must_use]
    pub fn contains(&self, id: Id) -> bool {
        self.ty.contains(id)
    }

    /// Column index for a data-carrying id.
    #[must_use]
    pub fn column_index(&self, id: Id) -> Option<usize> {
        let index = self.ty.index_of(id)?;
        self.type_to_column[index].map(usize::from)
    }

    /// Column index for the id at a type index.
    #[must_use]
    pub fn column_for_type_index(&self, index: usize) -> Option<usize> {
        self.type_to_column.get(index).copied().flatten().map(usize::from)
    }

    /// Get a column by component ID.
    #[must_use]
    pub fn column(&self, id: Id) -> Option<&Column> {
        self.column_index(id).map(|idx| &self.columns[idx])
    }

    #[must_use]
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Id stored in a column.
    #[must_use]
    pub fn column_id(&self, column: usize) -> Id {
        self.ty.as_slice()[usize::from(self.column_to_type[column])]
    }

    /// Raw pointer to the value of `id` at `row`.
    #[must_use]
    pub fn get_ptr(&self, id: Id, row: usize) -> Option<*mut u8> {
        self.column(id)?.get_raw(row)
    }

    /// Append an entity, default-constructing all columns.
    /// Toggle ids start enabled.
    pub fn append(&mut self, entity: Entity) -> usize {
        let row = self.entities.len();
        self.entities.push(entity);
        for column in &mut self.columns {
            column.push_default();
        }
        for (_, bits) in &mut self.toggles {
            bits.push(true);
        }
        row
    }

    /// Drop all values of `row` and swap-remove it.
    ///
    /// Returns the entity that was moved into `row`, if any.
    pub fn delete_row(&mut self, row: usize) -> Option<Entity> {
        invariant!(
            row < self.entities.len(),
            "table {:?}: delete of row {} out of bounds ({} rows)",
            self.id,
            row,
            self.entities.len()
        );
        for column in &mut self.columns {
            // SAFETY: row is in bounds (checked above; columns match entities)
            unsafe { column.swap_remove_drop(row) };
        }
        for (_, bits) in &mut self.toggles {
            bits.swap_remove(row);
        }
        self.swap_remove_entity(row)
    }

    /// Swap-remove only the entity slot; columns are handled by the caller.
    pub(crate) fn swap_remove_entity(&mut self, row: usize) -> Option<Entity> {
        self.entities.swap_remove(row);
        (row < self.entities.len()).then(|| self.entities[row])
    }

    pub(crate) fn push_entity(&mut self, entity: Entity) -> usize {
        self.entities.push(entity);
        self.entities.len() - 1
    }

    pub(crate) fn columns_mut(&mut self) -> &mut [Column] {
        &mut self.columns
    }

    pub(crate) fn toggles_mut(&mut self) -> &mut SmallVec<[(Id, BitSet); 1]> {
        &mut self.toggles
    }

    /// Enable bits for a toggle id, keyed by the id without the flag.
    #[must_use]
    pub fn toggle_bits(&self, id: Id) -> Option<&BitSet> {
        let id = id.strip_flags();
        self.toggles.iter().find(|(t, _)| *t == id).map(|(_, bits)| bits)
    }

    /// Whether `id` is enabled for `row`. Ids without a toggle are always
    /// enabled.
    #[must_use]
    pub fn is_enabled(&self, id: Id, row: usize) -> bool {
        self.toggle_bits(id).is_none_or(|bits| bits.get(row))
    }

    /// Flip the enable bit of a toggle id. Returns `false` if the table has
    /// no toggle for `id`.
    pub fn set_enabled(&mut self, id: Id, row: usize, enabled: bool) -> bool {
        let id = id.strip_flags();
        match self.toggles.iter_mut().find(|(t, _)| *t == id) {
            Some((_, bits)) if row < bits.len() => {
                bits.set(row, enabled);
                true
            }
            _ => false,
        }
    }

    #[must_use]
    pub fn has_toggles(&self) -> bool {
        !self.toggles.is_empty()
    }

    pub fn toggles(&self) -> impl Iterator<Item = (Id, &BitSet)> {
        self.toggles.iter().map(|(id, bits)| (*id, bits))
    }

    #[must_use]
    pub const fn edges(&self) -> &Edges {
        &self.edges
    }

    pub(crate) fn edges_mut(&mut self) -> &mut Edges {
        &mut self.edges
    }

    /// Mark the table as being iterated.
    pub fn lock(&self) {
        self.lock.fetch_add(1, Ordering::AcqRel);
    }

    pub fn unlock(&self) {
        let prev = self.lock.fetch_sub(1, Ordering::AcqRel);
        invariant!(prev > 0, "table {:?} unlocked more often than locked", self.id);
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.lock.load(Ordering::Acquire) > 0
    }

    /// Reserve capacity in all columns.
    pub fn reserve(&mut self, additional: usize) {
        self.entities.reserve(additional);
        for column in &mut self.columns {
            column.reserve(additional);
        }
    }
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("id", &self.id)
            .field("type", &self.ty)
            .field("entity_count", &self.entities.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Generation;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Position {
        x: f32,
        y: f32,
    }

    fn e(index: u32) -> Entity {
        Entity::new(index, Generation::new())
    }

    fn table_with_position() -> (Table, Id, Id) {
        let pos = Id::of(e(100));
        let tag = Id::of(e(101));
        let ty = Type::new([tag, pos]);
        let infos = vec![Some(Arc::new(TypeInfo::of::<Position>())), None];
        (Table::new(TableId::from_raw(1), ty, &infos), pos, tag)
    }

    #[test]
    fn test_type_sorted_and_deduped() {
        let a = Id::of(e(80));
        let b = Id::of(e(70));
        let ty = Type::new([a, b, a]);
        assert_eq!(ty.as_slice(), &[b, a]);
        assert!(ty.with(a).is_none());
        assert_eq!(ty.without(a).map(|t| t.len()), Some(1));
        assert_eq!(Type::new([b]).with(a), Some(ty));
    }

    #[test]
    fn test_tags_have_no_column() {
        let (table, pos, tag) = table_with_position();
        assert_eq!(table.columns().len(), 1);
        assert!(table.column(pos).is_some());
        assert!(table.column(tag).is_none());
        assert_eq!(table.column_id(0), pos);
    }

    #[test]
    fn test_append_and_delete_row() {
        let (mut table, pos, _) = table_with_position();
        let a = e(70);
        let b = e(71);
        let c = e(72);
        table.append(a);
        table.append(b);
        table.append(c);

        let ptr = table.get_ptr(pos, 2).unwrap();
        unsafe { (*ptr.cast::<Position>()).x = 3.0 };

        let moved = table.delete_row(0);
        assert_eq!(moved, Some(c));
        assert_eq!(table.entities(), &[c, b]);
        let ptr = table.get_ptr(pos, 0).unwrap();
        assert_eq!(unsafe { &*ptr.cast::<Position>() }.x, 3.0);

        assert_eq!(table.delete_row(1), None);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_flags_from_type() {
        let ty = Type::new([
            Id::pair(builtins::CHILD_OF, e(70)),
            Id::of(builtins::PREFAB),
        ]);
        let table = Table::new(TableId::from_raw(2), ty, &[None, None]);
        assert!(table.flags().contains(TableFlags::HAS_CHILD_OF));
        assert!(table.flags().contains(TableFlags::PREFAB));
        assert!(table.flags().contains(TableFlags::HAS_PAIRS));
        assert!(!table.flags().contains(TableFlags::DISABLED));
    }

    #[test]
    fn test_toggle_bits() {
        let health = Id::of(e(100));
        let ty = Type::new([health.toggle()]);
        let mut table = Table::new(TableId::from_raw(3), ty, &[None]);
        table.append(e(70));
        table.append(e(71));

        assert!(table.is_enabled(health, 1));
        assert!(table.set_enabled(health, 1, false));
        assert!(!table.is_enabled(health, 1));
        assert!(table.is_enabled(health, 0));
        assert!(!table.set_enabled(Id::of(e(101)), 0, false));
    }

    #[test]
    fn test_lock_counting() {
        let (table, _, _) = table_with_position();
        assert!(!table.is_locked());
        table.lock();
        table.lock();
        table.unlock();
        assert!(table.is_locked());
        table.unlock();
        assert!(!table.is_locked());
    }
}
