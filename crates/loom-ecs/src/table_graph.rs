//! Table graph - the de-duplicating registry of archetype tables.
//!
//! Tables live in an arena indexed by [`TableId`]; each [`Type`] maps to
//! exactly one table. Single-id transitions are cached as edges on both ends
//! so repeated add/remove of the same id costs one map lookup.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::{
    FxHashMap,
    component::{TypeInfo, TypeInfoRegistry},
    component_index::ComponentIndex,
    entity::Entity,
    error::{fatal, invariant},
    id::Id,
    table::{Table, TableId, Type},
};

/// Result of moving a row between tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MovedRow {
    /// Row of the entity in the destination table.
    pub dst_row: usize,
    /// Entity swapped into the vacated source row, if any.
    pub swapped: Option<Entity>,
}

/// Storage for all tables in a world.
pub struct TableGraph {
    tables: Vec<Option<Table>>,
    free: Vec<u32>,
    by_type: FxHashMap<Type, TableId>,
}

impl Default for TableGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl TableGraph {
    /// Create a graph containing only the root table.
    #[must_use]
    pub fn new() -> Self {
        let root = Table::new(TableId::ROOT, Type::empty(), &[]);
        let mut by_type = FxHashMap::default();
        by_type.insert(Type::empty(), TableId::ROOT);
        Self {
            tables: vec![Some(root)],
            free: Vec::new(),
            by_type,
        }
    }

    #[must_use]
    pub fn get(&self, id: TableId) -> Option<&Table> {
        self.tables.get(id.index()).and_then(Option::as_ref)
    }

    pub(crate) fn get_mut(&mut self, id: TableId) -> Option<&mut Table> {
        self.tables.get_mut(id.index()).and_then(Option::as_mut)
    }

    /// Table that must exist; a missing table is a bookkeeping bug.
    #[must_use]
    pub(crate) fn table(&self, id: TableId) -> &Table {
        match self.get(id) {
            Some(table) => table,
            None => fatal!("stale table id {:?}", id),
        }
    }

    pub(crate) fn table_mut(&mut self, id: TableId) -> &mut Table {
        match self.get_mut(id) {
            Some(table) => table,
            None => fatal!("stale table id {:?}", id),
        }
    }

    /// The table for an exact type, if it exists.
    #[must_use]
    pub fn find(&self, ty: &Type) -> Option<TableId> {
        self.by_type.get(ty).copied()
    }

    /// Return the unique table for `ty`, creating and registering it with
    /// the component index on first use.
    pub fn find_or_create(
        &mut self,
        ty: &Type,
        records: &mut ComponentIndex,
        types: &TypeInfoRegistry,
    ) -> TableId {
        if let Some(id) = self.find(ty) {
            return id;
        }

        let infos: SmallVec<[Option<Arc<TypeInfo>>; 8]> = ty
            .iter()
            .map(|id| records.ensure(id, types).type_info().cloned())
            .collect();

        let id = match self.free.pop() {
            Some(raw) => TableId::from_raw(raw),
            None => TableId::from_raw(self.tables.len() as u32),
        };
        let table = Table::new(id, ty.clone(), &infos);
        records.register_table(id, ty, |i| table.column_for_type_index(i), types);

        if id.index() == self.tables.len() {
            self.tables.push(Some(table));
        } else {
            self.tables[id.index()] = Some(table);
        }
        self.by_type.insert(ty.clone(), id);
        tracing::debug!(table = id.as_raw(), ty = ?ty, "created table");
        id
    }

    /// Table for `table.type ∪ {id}`, following or caching the add edge.
    pub fn add_id(
        &mut self,
        table: TableId,
        id: Id,
        records: &mut ComponentIndex,
        types: &TypeInfoRegistry,
    ) -> TableId {
        let src = self.table(table);
        if let Some(dst) = src.edges().get_add(id) {
            return dst;
        }
        let Some(ty) = src.ty().with(id) else {
            return table;
        };
        let dst = self.find_or_create(&ty, records, types);
        self.link(table, id, dst);
        dst
    }

    /// Table for `table.type \ {id}`, following or caching the remove edge.
    pub fn remove_id(
        &mut self,
        table: TableId,
        id: Id,
        records: &mut ComponentIndex,
        types: &TypeInfoRegistry,
    ) -> TableId {
        let src = self.table(table);
        if let Some(dst) = src.edges().get_remove(id) {
            return dst;
        }
        let Some(ty) = src.ty().without(id) else {
            return table;
        };
        let dst = self.find_or_create(&ty, records, types);
        self.link(dst, id, table);
        dst
    }

    /// Cache `from + id = to` in both directions.
    fn link(&mut self, from: TableId, id: Id, to: TableId) {
        self.table_mut(from).edges_mut().insert_add(id, to);
        self.table_mut(to).edges_mut().insert_remove(id, from);
    }

    fn pair_mut(&mut self, a: TableId, b: TableId) -> (&mut Table, &mut Table) {
        invariant!(a != b, "pair_mut on the same table {:?}", a);
        let (lo, hi, swapped) = if a.index() < b.index() {
            (a.index(), b.index(), false)
        } else {
            (b.index(), a.index(), true)
        };
        let (left, right) = self.tables.split_at_mut(hi);
        let (Some(first), Some(second)) = (left[lo].as_mut(), right[0].as_mut()) else {
            fatal!("stale table id in move between {:?} and {:?}", a, b);
        };
        if swapped { (second, first) } else { (first, second) }
    }

    /// Move the entity at `row` of `src` into `dst` as one operation.
    ///
    /// Values of ids in both types are moved, ids only in `dst` are
    /// default-constructed and ids only in `src` are destroyed. The source
    /// row is swap-removed.
    pub fn move_row(&mut self, src: TableId, row: usize, dst: TableId) -> MovedRow {
        let (src_table, dst_table) = self.pair_mut(src, dst);
        invariant!(
            row < src_table.len(),
            "move of row {} out of bounds in {:?} ({} rows)",
            row,
            src,
            src_table.len()
        );

        let entity = src_table.entities()[row];
        let dst_row = dst_table.push_entity(entity);

        let dst_ids: SmallVec<[Id; 8]> = (0..dst_table.columns().len())
            .map(|c| dst_table.column_id(c))
            .collect();
        let mut moved: SmallVec<[bool; 8]> = SmallVec::from_elem(false, src_table.columns().len());

        for (c, id) in dst_ids.iter().enumerate() {
            let dst_column = &mut dst_table.columns_mut()[c];
            match src_table.column_index(*id) {
                Some(s) => {
                    // SAFETY: row is in bounds and both columns store `id`
                    unsafe { src_table.columns_mut()[s].move_row_into(row, dst_column) };
                    moved[s] = true;
                }
                None => dst_column.push_default(),
            }
        }
        for (s, was_moved) in moved.iter().enumerate() {
            if !was_moved {
                // SAFETY: row is in bounds
                unsafe { src_table.columns_mut()[s].swap_remove_drop(row) };
            }
        }

        let carried: SmallVec<[bool; 2]> = dst_table
            .toggles()
            .map(|(id, _)| src_table.toggle_bits(id).is_none_or(|bits| bits.get(row)))
            .collect();
        for ((_, bits), enabled) in dst_table.toggles_mut().iter_mut().zip(carried) {
            bits.push(enabled);
        }
        for (_, bits) in src_table.toggles_mut().iter_mut() {
            bits.swap_remove(row);
        }

        let swapped = src_table.swap_remove_entity(row);
        tracing::trace!(?entity, ?src, ?dst, dst_row, "moved row");
        MovedRow { dst_row, swapped }
    }

    /// Remove a table from the graph. It must be empty and unlocked.
    pub fn delete_table(&mut self, id: TableId, records: &mut ComponentIndex) {
        invariant!(id != TableId::ROOT, "attempt to delete the root table");
        let Some(table) = self.tables.get_mut(id.index()).and_then(Option::take) else {
            fatal!("delete of stale table {:?}", id);
        };
        invariant!(
            table.is_empty() && !table.is_locked(),
            "delete of non-empty or locked table {:?}",
            id
        );

        records.unregister_table(id, table.ty());
        self.by_type.remove(table.ty());
        let neighbors: SmallVec<[TableId; 8]> = table.edges().neighbors().collect();
        for neighbor in neighbors {
            if let Some(other) = self.get_mut(neighbor) {
                other.edges_mut().forget(id);
            }
        }
        self.free.push(id.as_raw());
        tracing::debug!(table = id.as_raw(), ty = ?table.ty(), "deleted table");
    }

    /// Delete every empty, unlocked table except the root.
    pub fn delete_empty_tables(&mut self, records: &mut ComponentIndex) -> usize {
        let empty: Vec<TableId> = self
            .iter()
            .filter(|t| t.id() != TableId::ROOT && t.is_empty() && !t.is_locked())
            .map(Table::id)
            .collect();
        for id in &empty {
            self.delete_table(*id, records);
        }
        empty.len()
    }

    /// Iterate over all live tables in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Table> {
        self.tables.iter().filter_map(Option::as_ref)
    }

    /// Number of live tables (including the root).
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.len() - self.free.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for TableGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableGraph")
            .field("tables", &self.len())
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

    struct Fixture {
        graph: TableGraph,
        records: ComponentIndex,
        types: TypeInfoRegistry,
        pos: Id,
        tag: Id,
    }

    fn fixture() -> Fixture {
        let mut types = TypeInfoRegistry::new();
        let pos = Id::of(Entity::new(100, Generation::new()));
        let tag = Id::of(Entity::new(101, Generation::new()));
        types.register(pos, TypeInfo::of::<Position>());
        Fixture {
            graph: TableGraph::new(),
            records: ComponentIndex::new(),
            types,
            pos,
            tag,
        }
    }

    #[test]
    fn test_find_or_create_is_unique() {
        let mut f = fixture();
        let ty = Type::new([f.pos, f.tag]);
        let a = f.graph.find_or_create(&ty, &mut f.records, &f.types);
        let b = f
            .graph
            .find_or_create(&Type::new([f.tag, f.pos]), &mut f.records, &f.types);
        assert_eq!(a, b);
        assert_eq!(f.graph.len(), 2);
        assert!(f.records.get(f.pos).unwrap().table(a).is_some());
    }

    #[test]
    fn test_edges_are_bidirectional() {
        let mut f = fixture();
        let with_pos = f.graph.add_id(TableId::ROOT, f.pos, &mut f.records, &f.types);
        assert_eq!(f.graph.table(TableId::ROOT).edges().get_add(f.pos), Some(with_pos));
        assert_eq!(f.graph.table(with_pos).edges().get_remove(f.pos), Some(TableId::ROOT));

        let back = f.graph.remove_id(with_pos, f.pos, &mut f.records, &f.types);
        assert_eq!(back, TableId::ROOT);
        // No-op transitions
        assert_eq!(f.graph.add_id(with_pos, f.pos, &mut f.records, &f.types), with_pos);
        assert_eq!(
            f.graph.remove_id(TableId::ROOT, f.tag, &mut f.records, &f.types),
            TableId::ROOT
        );
    }

    #[test]
    fn test_move_row_keeps_values() {
        let mut f = fixture();
        let with_pos = f.graph.add_id(TableId::ROOT, f.pos, &mut f.records, &f.types);
        let with_both = f.graph.add_id(with_pos, f.tag, &mut f.records, &f.types);

        let a = Entity::new(70, Generation::new());
        let b = Entity::new(71, Generation::new());
        let table = f.graph.table_mut(with_pos);
        table.append(a);
        table.append(b);
        let ptr = table.get_ptr(f.pos, 0).unwrap();
        unsafe { ptr.cast::<Position>().write(Position { x: 1.0, y: 2.0 }) };

        let moved = f.graph.move_row(with_pos, 0, with_both);
        assert_eq!(moved.dst_row, 0);
        assert_eq!(moved.swapped, Some(b));

        let dst = f.graph.table(with_both);
        let value = unsafe { &*dst.get_ptr(f.pos, 0).unwrap().cast::<Position>() };
        assert_eq!(value, &Position { x: 1.0, y: 2.0 });
        assert_eq!(f.graph.table(with_pos).entities(), &[b]);
    }

    #[test]
    fn test_delete_empty_tables_invalidates_edges() {
        let mut f = fixture();
        let with_tag = f.graph.add_id(TableId::ROOT, f.tag, &mut f.records, &f.types);

        assert_eq!(f.graph.delete_empty_tables(&mut f.records), 1);
        assert!(f.graph.get(with_tag).is_none());
        assert_eq!(f.graph.table(TableId::ROOT).edges().get_add(f.tag), None);
        assert!(f.records.get(f.tag).unwrap().is_empty());

        // Recreated on demand, reusing the freed slot
        let again = f.graph.add_id(TableId::ROOT, f.tag, &mut f.records, &f.types);
        assert_eq!(again, with_tag);
    }
}
