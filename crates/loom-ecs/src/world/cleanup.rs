//! Entity deletion and cleanup policies.

use smallvec::SmallVec;

use crate::{
    World, builtins,
    component_index::CleanupAction,
    entity::{Entity, EntityFlags, FIRST_USER_INDEX},
    error::{EcsError, fatal, report},
    id::Id,
    table::TableId,
};

impl World {
    /// Delete an entity right away.
    ///
    /// Holders of the entity as a component or relationship follow its
    /// `OnDelete` policy; holders of `(R, entity)` follow the `OnDeleteTarget`
    /// policy of `R`. Afterwards the entity is removed from its table and
    /// every empty table that mentions it is dropped.
    #[track_caller]
    pub(crate) fn delete_now(&mut self, entity: Entity) {
        if !self.entities.is_alive(entity) {
            return;
        }
        if entity.id() < FIRST_USER_INDEX {
            report(&EcsError::InvalidOperation(format!(
                "builtin entity {entity} can not be deleted"
            )));
            return;
        }
        if self.entities.flags(entity).contains(EntityFlags::DELETING) {
            return;
        }
        self.entities.add_flags(entity, EntityFlags::DELETING);
        tracing::trace!(?entity, "deleting entity");

        let action = CleanupAction::on_delete(self.records.flags(Id::of(entity)));
        self.cleanup_holders(entity, Id::of(entity), action);
        self.cleanup_holders(entity, Id::pair(entity, builtins::WILDCARD), action);

        for id in self.ids_targeting(entity) {
            let action = CleanupAction::on_delete_target(self.records.flags(id));
            self.cleanup_holders(entity, id, action);
        }

        self.commit(entity, TableId::ROOT);
        if let Some(loc) = self.entities.location(entity) {
            if let Some(swapped) = self.tables.table_mut(loc.table).delete_row(loc.row) {
                self.entities.set_row(swapped, loc.row);
            }
        }

        self.delete_tables_mentioning(entity);
        self.records.remove_for_entity(entity);
        self.types.unregister(Id::of(entity));
        if self.entities.flags(entity).contains(EntityFlags::OBSERVER) {
            self.remove_observer_now(entity);
        }
        self.forget_name(entity);
        self.entities.delete(entity);
    }

    /// Concrete `(R, entity)` ids present in any table.
    fn ids_targeting(&self, entity: Entity) -> SmallVec<[Id; 4]> {
        let pattern = Id::pair(builtins::WILDCARD, entity);
        let mut ids = SmallVec::new();
        let Some(record) = self.records.get(pattern) else {
            return ids;
        };
        for tr in record.tables() {
            let Some(table) = self.tables.get(tr.table) else {
                continue;
            };
            let mut start = 0;
            while let Some((i, id)) = table.ty().find_match(pattern, start) {
                start = i + 1;
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
        }
        ids
    }

    /// Apply a cleanup action to every entity holding `id`.
    fn cleanup_holders(&mut self, deleting: Entity, id: Id, action: CleanupAction) {
        for holder in self.holders(id) {
            if holder == deleting || !self.entities.is_alive(holder) {
                continue;
            }
            match action {
                CleanupAction::Panic => {
                    fatal!("can not delete {} while {} has {} (OnDelete: Panic)", deleting, holder, id)
                }
                CleanupAction::Delete => self.delete_now(holder),
                CleanupAction::Remove => {
                    if let Some(loc) = self.entities.location(holder) {
                        let dst = self.dst_for_remove(loc.table, id);
                        self.commit(holder, dst);
                    }
                }
            }
        }
    }

    fn delete_tables_mentioning(&mut self, entity: Entity) {
        let patterns = [
            Id::of(entity),
            Id::pair(entity, builtins::WILDCARD),
            Id::pair(builtins::WILDCARD, entity),
        ];
        let mut doomed: SmallVec<[TableId; 8]> = SmallVec::new();
        for pattern in patterns {
            let Some(record) = self.records.get(pattern) else {
                continue;
            };
            for tr in record.tables() {
                let empty = self
                    .tables
                    .get(tr.table)
                    .is_some_and(|t| t.is_empty() && !t.is_locked());
                if empty && tr.table != TableId::ROOT && !doomed.contains(&tr.table) {
                    doomed.push(tr.table);
                }
            }
        }
        for table in doomed {
            self.tables.delete_table(table, &mut self.records);
        }
    }
}
