//! Immediate structural operations.
//!
//! Everything here runs with the world in a deferred region (depth > 0), so
//! commands issued by hooks and observers are queued instead of nesting.

use smallvec::SmallVec;

use crate::{
    World, builtins,
    component::{LifecycleHook, TypeInfo},
    entity::Entity,
    error::invariant,
    id::Id,
    table::TableId,
};

type IdList = SmallVec<[Id; 8]>;

impl World {
    pub(crate) fn op_add(&mut self, entity: Entity, id: Id) -> bool {
        if !self.check_add(entity, id) {
            return false;
        }
        let Some(loc) = self.entities.location(entity) else {
            return false;
        };
        let dst = self.dst_for_add(loc.table, id);
        self.commit(entity, dst);
        true
    }

    pub(crate) fn op_remove(&mut self, entity: Entity, id: Id) -> bool {
        if !self.check_remove(entity, id) {
            return false;
        }
        let Some(loc) = self.entities.location(entity) else {
            return false;
        };
        let dst = self.dst_for_remove(loc.table, id);
        self.commit(entity, dst);
        true
    }

    pub(crate) fn clear_now(&mut self, entity: Entity) {
        if self.entities.is_alive(entity) {
            self.commit(entity, TableId::ROOT);
        }
    }

    pub(crate) fn op_enable(&mut self, entity: Entity, id: Id, enabled: bool) -> bool {
        let id = id.strip_flags();
        if !self.op_add(entity, id.toggle()) {
            return false;
        }
        let Some(loc) = self.entities.location(entity) else {
            return false;
        };
        self.tables
            .table_mut(loc.table)
            .set_enabled(id, loc.row, enabled)
    }

    /// Move an entity to `dst`, running hooks and observers for every id
    /// that is added or removed.
    ///
    /// `OnRemove` fires while the values are still in the source table,
    /// `OnAdd` after they have been constructed in the destination.
    pub(crate) fn commit(&mut self, entity: Entity, dst: TableId) {
        let Some(loc) = self.entities.location(entity) else {
            return;
        };
        let src = loc.table;
        if src == dst {
            return;
        }
        let (src_table, dst_table) = (self.tables.table(src), self.tables.table(dst));
        invariant!(
            !src_table.is_locked() && !dst_table.is_locked(),
            "structural change of {:?} while {:?} or {:?} is being iterated",
            entity,
            src,
            dst
        );
        let removed: IdList = src_table.ty().iter().filter(|id| !dst_table.ty().contains(*id)).collect();
        let added: IdList = dst_table.ty().iter().filter(|id| !src_table.ty().contains(*id)).collect();

        let move_stamp = self.next_event_id();
        if !removed.is_empty() {
            self.run_hooks(entity, &removed, src, loc.row, |info| info.hooks().on_remove.clone());
            self.notify_move(builtins::ON_REMOVE, &removed, entity, src, loc.row, dst, move_stamp);
        }

        let moved = self.tables.move_row(src, loc.row, dst);
        self.entities.set_location(entity, dst, moved.dst_row);
        if let Some(swapped) = moved.swapped {
            self.entities.set_row(swapped, loc.row);
        }

        if !added.is_empty() {
            self.run_hooks(entity, &added, dst, moved.dst_row, |info| info.hooks().on_add.clone());
        }
        self.after_remove(entity, &removed);
        self.after_add(entity, &added);
        if !added.is_empty() {
            self.notify_move(builtins::ON_ADD, &added, entity, dst, moved.dst_row, src, move_stamp);
        }
    }

    fn run_hooks(
        &self,
        entity: Entity,
        ids: &[Id],
        table: TableId,
        row: usize,
        hook: impl Fn(&TypeInfo) -> Option<LifecycleHook>,
    ) {
        let table = self.tables.table(table);
        for &id in ids {
            let Some(column) = table.column(id) else {
                continue;
            };
            if let (Some(hook), Some(ptr)) = (hook(column.info()), column.get_raw(row)) {
                hook(entity, id, ptr);
            }
        }
    }

    /// Add `id` if needed and write a value into its slot.
    ///
    /// With `take` the value is moved out of `src`, otherwise it is copied.
    /// Returns `false` (leaving `src` untouched) when the entity ends up
    /// without a slot for `id`.
    ///
    /// # Safety
    ///
    /// `src` must point to an initialized value of `info`'s type.
    pub(crate) unsafe fn set_now(
        &mut self,
        entity: Entity,
        id: Id,
        src: *mut u8,
        info: &TypeInfo,
        take: bool,
    ) -> bool {
        if !self.op_add(entity, id) {
            return false;
        }
        if info.size() == 0 {
            if take {
                // SAFETY: forwarded from the caller
                unsafe { info.destruct(src) };
            }
            return true;
        }
        let Some(loc) = self.entities.location(entity) else {
            return false;
        };
        let Some(dst) = self.tables.table(loc.table).get_ptr(id, loc.row) else {
            return false;
        };
        // SAFETY: dst holds an initialized value of the same type, which is
        // replaced; src is valid per the caller
        unsafe {
            info.destruct(dst);
            if take {
                info.move_to(dst, src);
            } else {
                info.copy_to(dst, src);
            }
        }
        self.emit_set(entity, id, loc.table, loc.row);
        true
    }

    /// Run the `on_set` hook and `OnSet` observers for a written value.
    pub(crate) fn emit_set(&self, entity: Entity, id: Id, table: TableId, row: usize) {
        self.run_hooks(entity, &[id], table, row, |info| info.hooks().on_set.clone());
        self.notify(builtins::ON_SET, &[id], entity, table, row, table);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use crate::{World, component::{TypeHooks, TypeInfo}};

    #[derive(Default, Clone)]
    struct Counter(u32);

    #[test]
    fn test_hooks_run_on_add_set_remove() {
        let mut world = World::new();
        let adds = Arc::new(AtomicUsize::new(0));
        let sets = Arc::new(AtomicUsize::new(0));
        let removes = Arc::new(AtomicUsize::new(0));
        let (a, s, r) = (Arc::clone(&adds), Arc::clone(&sets), Arc::clone(&removes));
        let hooks = TypeHooks::of::<Counter>()
            .with_on_add(move |_, _: &mut Counter| {
                a.fetch_add(1, Ordering::Relaxed);
            })
            .with_on_set(move |_, c: &mut Counter| {
                s.fetch_add(c.0 as usize, Ordering::Relaxed);
            })
            .with_on_remove(move |_, _: &mut Counter| {
                r.fetch_add(1, Ordering::Relaxed);
            });
        let counter = world.component::<Counter>();
        assert!(world.register_type_info(counter, TypeInfo::of::<Counter>().with_hooks(hooks)));

        let e = world.create();
        world.set(e, Counter(5));
        world.set(e, Counter(2));
        world.remove(e, counter);
        assert_eq!(adds.load(Ordering::Relaxed), 1);
        assert_eq!(sets.load(Ordering::Relaxed), 7);
        assert_eq!(removes.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_swapped_row_location_updated() {
        let mut world = World::new();
        let tag = world.create();
        let a = world.create();
        let b = world.create();
        world.add(a, tag);
        world.add(b, tag);
        world.set(a, Counter(1));
        world.set(b, Counter(2));
        world.remove(a, tag);
        let loc = world.location(b);
        assert_eq!(loc.map(|l| l.row), Some(0));
        assert_eq!(world.get::<Counter>(b).map(|c| c.0), Some(2));
        assert_eq!(world.get::<Counter>(a).map(|c| c.0), Some(1));
    }
}
