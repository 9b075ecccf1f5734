//! Deferred mode and stage replay.

use smallvec::SmallVec;

use crate::{
    FxHashMap, World,
    entity::Entity,
    error::invariant,
    id::Id,
    stage::{CommandKind, StageBatch, StagedValue},
};

/// Net effect of one entity's commands between two clears.
#[derive(Default)]
struct Pending {
    /// `(id, true)` for adds, `(id, false)` for removes, in issue order.
    ops: SmallVec<[(Id, bool); 8]>,
    /// Latest value per id.
    values: SmallVec<[(Id, StagedValue); 4]>,
    enables: SmallVec<[(Id, bool); 2]>,
}

impl Pending {
    fn is_empty(&self) -> bool {
        self.ops.is_empty() && self.values.is_empty() && self.enables.is_empty()
    }
}

impl World {
    /// Enter deferred mode. Calls nest; returns `true` for the outermost.
    pub fn defer_begin(&mut self) -> bool {
        self.defer_depth += 1;
        self.defer_depth == 1
    }

    /// Leave deferred mode. When the outermost region ends the main stage
    /// is replayed. Returns `true` if a flush happened.
    pub fn defer_end(&mut self) -> bool {
        invariant!(self.defer_depth > 0, "defer_end without matching defer_begin");
        self.defer_depth -= 1;
        if self.defer_depth > 0 {
            return false;
        }
        self.flush();
        true
    }

    /// Whether mutations are currently queued instead of applied.
    #[must_use]
    pub fn is_deferred(&self) -> bool {
        self.defer_depth > 0 && self.defer_suspended == 0
    }

    /// Apply mutations immediately inside a deferred region until
    /// [`World::defer_resume`].
    pub fn defer_suspend(&mut self) {
        invariant!(self.defer_depth > 0, "defer_suspend outside of a deferred region");
        self.defer_suspended += 1;
    }

    pub fn defer_resume(&mut self) {
        invariant!(self.defer_suspended > 0, "defer_resume without matching defer_suspend");
        self.defer_suspended -= 1;
    }

    /// Run `f` with the world deferred.
    ///
    /// ```ignore
    /// world.deferred(|w| {
    ///     w.add(e, tag);
    ///     assert!(w.has(e, tag));
    /// });
    /// ```
    pub fn deferred<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.defer_begin();
        let result = f(self);
        self.defer_end();
        result
    }

    /// Replay the main stage until no new commands are produced.
    fn flush(&mut self) {
        // Commands issued by hooks and observers during replay are queued
        // and picked up by the next round.
        self.defer_depth = 1;
        let mut rounds = 0u32;
        loop {
            let batch = self.stage.get_mut().take();
            if batch.is_empty() {
                break;
            }
            rounds += 1;
            tracing::debug!(commands = batch.commands.len(), round = rounds, "flushing stage");
            self.replay(batch);
        }
        self.defer_depth = 0;
    }

    /// Merge worker stages into the world, in stage order.
    pub(crate) fn merge_workers(&mut self) {
        for index in 0..self.workers.len() {
            let batch = self.workers[index].get_mut().take();
            if batch.is_empty() {
                continue;
            }
            tracing::debug!(stage = index, commands = batch.commands.len(), "merging worker stage");
            self.defer_begin();
            self.replay(batch);
            self.defer_end();
        }
    }

    /// Apply a batch of commands.
    ///
    /// Commands are grouped per entity and each group is folded, in
    /// submission order, into a single table transition. Groups replay in the
    /// order of each entity's first command, so observers see all of one
    /// entity's changes before those of the next entity.
    pub(crate) fn replay(&mut self, mut batch: StageBatch) {
        let commands = std::mem::take(&mut batch.commands);
        let mut order: FxHashMap<Entity, usize> = FxHashMap::default();
        let mut groups: Vec<(Entity, Vec<CommandKind>)> = Vec::new();
        for command in commands {
            let slot = *order.entry(command.entity).or_insert_with(|| {
                groups.push((command.entity, Vec::new()));
                groups.len() - 1
            });
            groups[slot].1.push(command.kind);
        }

        for (entity, kinds) in groups {
            let mut pending = Pending::default();
            for kind in kinds {
                match kind {
                    CommandKind::Add(id) => pending.ops.push((id, true)),
                    CommandKind::Remove(id) => {
                        pending.values.retain(|(staged, _)| !staged.matches(id));
                        pending.ops.push((id, false));
                    }
                    CommandKind::Set(id, value) => {
                        pending.values.retain(|(staged, _)| *staged != id);
                        pending.ops.push((id, true));
                        pending.values.push((id, value));
                    }
                    CommandKind::Enable { id, enabled } => pending.enables.push((id, enabled)),
                    CommandKind::Clear => {
                        drop(std::mem::take(&mut pending));
                        self.clear_now(entity);
                    }
                    CommandKind::Delete => {
                        drop(std::mem::take(&mut pending));
                        self.delete_now(entity);
                    }
                }
            }
            if !pending.is_empty() {
                self.apply_pending(entity, pending);
            }
        }
        // Staged values were consumed or dropped above; the arena goes last.
        drop(batch);
    }

    fn apply_pending(&mut self, entity: Entity, pending: Pending) {
        if !self.entities.is_alive(entity) {
            tracing::trace!(?entity, "dropping commands for dead entity");
            return;
        }
        let Some(loc) = self.entities.location(entity) else {
            return;
        };

        // Fold every op into the final type so only that table is created
        let start = self.tables.table(loc.table).ty().clone();
        let mut ty = start.clone();
        for &(id, add) in &pending.ops {
            let next = if add {
                if self.check_add(entity, id) { self.type_with(&ty, id) } else { None }
            } else if self.check_remove(entity, id) {
                Self::type_without(&ty, id)
            } else {
                None
            };
            if let Some(next) = next {
                ty = next;
            }
        }
        for &(id, _) in &pending.enables {
            let toggle = id.strip_flags().toggle();
            if self.check_add(entity, toggle) {
                if let Some(next) = self.type_with(&ty, toggle) {
                    ty = next;
                }
            }
        }
        let dst = if ty == start {
            loc.table
        } else {
            self.tables.find_or_create(&ty, &mut self.records, &self.types)
        };
        self.commit(entity, dst);

        for (id, value) in pending.values {
            self.assign(entity, id, value);
        }
        for (id, enabled) in pending.enables {
            if let Some(loc) = self.entities.location(entity) {
                self.tables
                    .table_mut(loc.table)
                    .set_enabled(id.strip_flags(), loc.row, enabled);
            }
        }
    }

    /// Move a staged value into the entity's slot for `id`. The value is
    /// dropped if the entity has no matching slot.
    fn assign(&mut self, entity: Entity, id: Id, value: StagedValue) {
        let Some(loc) = self.entities.location(entity) else {
            return;
        };
        let table = self.tables.table(loc.table);
        let Some(column) = table.column(id) else {
            return;
        };
        if column.info().layout() != value.info().layout() {
            return;
        }
        let Some(dst) = column.get_raw(loc.row) else {
            return;
        };
        let (src, info) = value.into_raw();
        // SAFETY: dst holds an initialized value of the column type, which
        // the staged value shares; src is initialized and not used again
        unsafe {
            info.destruct(dst);
            info.move_to(dst, src);
        }
        self.emit_set(entity, id, loc.table, loc.row);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use crate::{TermBuilder, World, builtins};

    #[derive(Default, Clone, Debug, PartialEq)]
    struct Position(i32);

    #[derive(Default, Clone, Debug, PartialEq)]
    struct Velocity(i32);

    #[test]
    fn test_deferred_set_visible_through_stage() {
        let mut world = World::new();
        let e = world.create();
        world.component::<Position>();
        world.defer_begin();
        world.set(e, Position(3));
        assert_eq!(world.get::<Position>(e), Some(Position(3)));
        assert!(world.get_ref::<Position>(e).is_none());
        world.defer_end();
        assert_eq!(world.get_ref::<Position>(e), Some(&Position(3)));
    }

    #[test]
    fn test_commands_coalesce_into_one_transition() {
        let mut world = World::new();
        world.component::<Position>();
        world.component::<Velocity>();
        let e = world.create();
        let before = world.table_count();
        world.deferred(|w| {
            w.set(e, Position(1));
            w.set(e, Velocity(2));
            w.set(e, Position(5));
        });
        assert_eq!(world.table_count(), before + 1);
        let position = world.component_id::<Position>().unwrap();
        let velocity = world.component_id::<Velocity>().unwrap();
        let both = world.location(e).map(|loc| loc.table);
        let only_position = crate::Type::new([crate::Id::of(position)]);
        assert!(world.tables.find(&only_position).is_none());
        assert!(
            both.and_then(|t| world.table(t))
                .is_some_and(|t| t.ty().contains(crate::Id::of(velocity)))
        );
        assert_eq!(world.get::<Position>(e), Some(Position(5)));
        assert_eq!(world.get::<Velocity>(e), Some(Velocity(2)));
    }

    #[test]
    fn test_replay_orders_entities_by_first_command() {
        let mut world = World::new();
        let tag = world.create();
        let other = world.create();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        world
            .observer()
            .with_ref(tag)
            .event(builtins::ON_ADD)
            .each(move |it| sink.lock().extend_from_slice(it.entities()))
            .build()
            .ok();
        let a = world.create();
        let b = world.create();

        world.deferred(|w| {
            w.add(b, other);
            w.add(a, tag);
            w.add(b, tag);
        });

        assert_eq!(*seen.lock(), vec![b, a]);
        assert!(world.owns(b, other));
    }

    #[test]
    fn test_commands_for_deleted_entity_are_dropped() {
        let mut world = World::new();
        let counter = Arc::new(());
        let e = world.create();
        let tag = world.create();
        world.defer_begin();
        world.add(e, tag);
        world.delete(e);
        world.set(e, Arc::clone(&counter));
        assert!(world.is_alive(e));
        world.defer_end();
        assert!(!world.is_alive(e));
        assert_eq!(Arc::strong_count(&counter), 1);
    }

    #[test]
    fn test_remove_discards_staged_value() {
        let mut world = World::new();
        let counter = Arc::new(());
        let component = world.component::<Arc<()>>();
        let e = world.create();
        world.deferred(|w| {
            w.set(e, Arc::clone(&counter));
            w.remove(e, component);
        });
        assert!(!world.has(e, component));
        assert_eq!(Arc::strong_count(&counter), 1);
    }

    #[test]
    fn test_suspend_applies_immediately() {
        let mut world = World::new();
        let e = world.create();
        let tag = world.create();
        world.defer_begin();
        world.defer_suspend();
        world.add(e, tag);
        assert!(world.owns(e, tag));
        world.defer_resume();
        world.defer_end();
        assert!(world.owns(e, tag));
    }
}
