//! Relationship traits and their enforcement.
//!
//! Trait tags (`Exclusive`, `Acyclic`, ...) and cleanup policy pairs added to
//! a relationship entity are cached as [`IdFlags`] on its component record.
//! The world consults those flags when ids are added and removed.

use crate::{
    World, builtins,
    component_index::IdFlags,
    config::PolicyMode,
    entity::{Entity, EntityFlags},
    error::{EcsError, fatal, report},
    id::Id,
    stage::CommandKind,
    table::{TableId, Type},
};

/// Traits that can not change while the relationship has instances.
const STRUCTURAL_TRAITS: IdFlags = IdFlags::EXCLUSIVE
    .union(IdFlags::ACYCLIC)
    .union(IdFlags::TRAVERSABLE)
    .union(IdFlags::TAG)
    .union(IdFlags::SYMMETRIC)
    .union(IdFlags::TRANSITIVE)
    .union(IdFlags::REFLEXIVE);

impl World {
    /// Validate an add before any table state is touched.
    #[track_caller]
    pub(crate) fn check_add(&self, entity: Entity, id: Id) -> bool {
        match self.validate_add(entity, id) {
            Ok(()) => true,
            Err(error) => {
                report(&error);
                false
            }
        }
    }

    #[track_caller]
    fn validate_add(&self, entity: Entity, id: Id) -> Result<(), EcsError> {
        if id.is_null() || id.is_wildcard() {
            return Err(EcsError::InvalidId(id));
        }
        let first = self.entities.get_alive(id.first()).ok_or(EcsError::InvalidId(id))?;
        if !id.is_pair() {
            if builtins::is_trait(first) {
                self.check_trait_change(entity, IdFlags::for_trait(first))?;
            }
            return Ok(());
        }
        let target = self.entities.get_alive(id.second()).ok_or(EcsError::InvalidId(id))?;
        let flags = self.records.flags(id);

        if first == builtins::IS_A && self.records.flags(Id::of(target)).contains(IdFlags::FINAL) {
            return Err(EcsError::ConstraintViolated(format!(
                "{target} is final and can not be inherited from"
            )));
        }
        if (flags.contains(IdFlags::ACYCLIC) || first == builtins::IS_A)
            && (target == entity || self.reaches(target, first, entity))
        {
            return Err(EcsError::ConstraintViolated(format!(
                "adding ({first}, {target}) to {entity} creates a cycle"
            )));
        }
        Ok(())
    }

    /// Validate a remove. Only trait removal can be refused.
    #[track_caller]
    pub(crate) fn check_remove(&self, entity: Entity, id: Id) -> bool {
        if id.is_pair() || id.is_wildcard() {
            return true;
        }
        let Some(first) = self.entities.get_alive(id.first()) else {
            return true;
        };
        if !builtins::is_trait(first) || !self.owns(entity, id) {
            return true;
        }
        match self.check_trait_change(entity, IdFlags::for_trait(first)) {
            Ok(()) => true,
            Err(error) => {
                report(&error);
                false
            }
        }
    }

    /// Changing a structural trait of a relationship with live instances
    /// is a policy violation.
    #[track_caller]
    fn check_trait_change(&self, rel: Entity, flag: IdFlags) -> Result<(), EcsError> {
        if !STRUCTURAL_TRAITS.intersects(flag) {
            return Ok(());
        }
        let in_use = self
            .records
            .get(Id::pair(rel, builtins::WILDCARD))
            .is_some_and(|r| !r.is_empty());
        if !in_use {
            return Ok(());
        }
        let message = format!("can not change trait {flag:?} of {rel}: relationship is in use");
        match self.config().policy {
            PolicyMode::Fatal => fatal!("{}", message),
            PolicyMode::Recover => Err(EcsError::ConstraintViolated(message)),
        }
    }

    /// Whether `to` is reachable from `from` by following `rel` pairs.
    fn reaches(&self, from: Entity, rel: Entity, to: Entity) -> bool {
        let pattern = Id::pair(rel, builtins::WILDCARD);
        let mut stack = vec![from];
        let mut visited = vec![from];
        while let Some(current) = stack.pop() {
            let Some(ty) = self.type_of(current) else {
                continue;
            };
            let mut start = 0;
            while let Some((i, id)) = ty.find_match(pattern, start) {
                start = i + 1;
                let Some(next) = self.entities.get_alive(id.second()) else {
                    continue;
                };
                if next == to {
                    return true;
                }
                if !visited.contains(&next) {
                    visited.push(next);
                    stack.push(next);
                }
            }
        }
        false
    }

    /// `ty` plus `id`, or `None` when nothing changes. An exclusive pair
    /// replaces the existing pair of its relationship.
    pub(crate) fn type_with(&self, ty: &Type, id: Id) -> Option<Type> {
        if id.is_pair() && self.records.flags(id).contains(IdFlags::EXCLUSIVE) {
            let pattern = Id::from_bits(
                Id::pair_from_indices(id.first(), builtins::WILDCARD.id()).to_bits() | id.flags(),
            );
            if let Some((_, existing)) = ty.find_match(pattern, 0) {
                if existing == id {
                    return None;
                }
                return ty.without(existing).and_then(|t| t.with(id));
            }
        }
        ty.with(id)
    }

    /// `ty` minus `id`, or `None` when nothing changes. Wildcards remove
    /// every match.
    pub(crate) fn type_without(ty: &Type, id: Id) -> Option<Type> {
        if !id.is_wildcard() {
            return ty.without(id);
        }
        ty.iter()
            .any(|i| i.matches(id))
            .then(|| Type::new(ty.iter().filter(|i| !i.matches(id))))
    }

    /// Destination table when adding `id`.
    pub(crate) fn dst_for_add(&mut self, table: TableId, id: Id) -> TableId {
        if id.is_pair() && self.records.flags(id).contains(IdFlags::EXCLUSIVE) {
            return match self.type_with(self.tables.table(table).ty(), id) {
                Some(ty) => self.tables.find_or_create(&ty, &mut self.records, &self.types),
                None => table,
            };
        }
        self.tables.add_id(table, id, &mut self.records, &self.types)
    }

    /// Destination table when removing `id`.
    pub(crate) fn dst_for_remove(&mut self, table: TableId, id: Id) -> TableId {
        if !id.is_wildcard() {
            return self.tables.remove_id(table, id, &mut self.records, &self.types);
        }
        match Self::type_without(self.tables.table(table).ty(), id) {
            Some(ty) => self.tables.find_or_create(&ty, &mut self.records, &self.types),
            None => table,
        }
    }

    /// Trait bookkeeping after ids were added to `entity`.
    pub(crate) fn after_add(&mut self, entity: Entity, added: &[Id]) {
        for &id in added.iter().filter(|id| id.flags() == 0) {
            if !id.is_pair() {
                if let Some(tag) = self.entities.get_alive(id.first()) {
                    let flag = IdFlags::for_trait(tag);
                    if !flag.is_empty() {
                        self.update_flags(entity, |flags| flags | flag);
                    }
                }
                continue;
            }
            let (rel, target) = (id.first(), id.second());
            let policy = IdFlags::for_policy(rel, target);
            if !policy.is_empty() {
                let mask = if rel == builtins::ON_DELETE.id() {
                    IdFlags::ON_DELETE_MASK
                } else {
                    IdFlags::ON_DELETE_TARGET_MASK
                };
                self.update_flags(entity, |flags| (flags - mask) | policy);
            }
            let Some(target) = self.entities.get_alive(target) else {
                continue;
            };
            let flags = self.records.flags(id);
            if flags.contains(IdFlags::TRAVERSABLE) {
                self.entities.add_flags(target, EntityFlags::TRAVERSABLE_TARGET);
            }
            if rel == builtins::CHILD_OF.id() {
                self.update_depth(target);
                self.update_depth(entity);
            }
            if let Some(rel) = self.entities.get_alive(rel) {
                if flags.contains(IdFlags::SYMMETRIC) && target != entity {
                    let reverse = Id::pair(rel, entity);
                    if !self.owns(target, reverse) {
                        self.stage.get_mut().push(target, CommandKind::Add(reverse));
                    }
                }
                if rel == builtins::IS_A {
                    self.copy_overrides(entity, target);
                }
            }
        }
    }

    /// Trait bookkeeping after ids were removed from `entity`.
    pub(crate) fn after_remove(&mut self, entity: Entity, removed: &[Id]) {
        for &id in removed.iter().filter(|id| id.flags() == 0) {
            if !id.is_pair() {
                if let Some(tag) = self.entities.get_alive(id.first()) {
                    let flag = IdFlags::for_trait(tag);
                    if !flag.is_empty() {
                        self.update_flags(entity, |flags| flags - flag);
                    }
                }
                continue;
            }
            let (rel, target) = (id.first(), id.second());
            let policy = IdFlags::for_policy(rel, target);
            if !policy.is_empty() {
                self.update_flags(entity, |flags| flags - policy);
            }
            if rel == builtins::CHILD_OF.id() {
                self.update_depth(entity);
            }
            let flags = self.records.flags(id);
            if flags.contains(IdFlags::SYMMETRIC) {
                if let (Some(rel), Some(target)) =
                    (self.entities.get_alive(rel), self.entities.get_alive(target))
                {
                    let reverse = Id::pair(rel, entity);
                    if target != entity && self.owns(target, reverse) {
                        self.stage.get_mut().push(target, CommandKind::Remove(reverse));
                    }
                }
            }
        }
    }

    fn update_flags(&mut self, entity: Entity, f: impl FnOnce(IdFlags) -> IdFlags) {
        let record = self.records.ensure(Id::of(entity), &self.types);
        let flags = f(record.flags());
        record.set_flags(flags);
    }

    /// Recompute the depth stored on `(ChildOf, parent)` and propagate it to
    /// the parent's descendants.
    fn update_depth(&mut self, parent: Entity) {
        let depth = 1 + self
            .parent(parent)
            .map_or(0, |grandparent| self.records.childof_depth(grandparent));
        let Some(record) = self.records.get_mut(Id::pair(builtins::CHILD_OF, parent)) else {
            return;
        };
        if record.childof_depth() == depth {
            return;
        }
        record.set_childof_depth(depth);
        for child in self.children(parent) {
            self.update_depth(child);
        }
    }

    /// Queue copies of the base's auto-override ids onto a new instance.
    fn copy_overrides(&mut self, instance: Entity, base: Entity) {
        let Some(loc) = self.entities.location(base) else {
            return;
        };
        let table = self.tables.table(loc.table);
        let overrides: Vec<Id> = table
            .ty()
            .iter()
            .filter(|id| id.is_auto_override())
            .map(Id::strip_flags)
            .collect();
        let stage = self.stage.get_mut();
        for id in overrides {
            match table.column(id) {
                Some(column) => {
                    if let Some(ptr) = column.get_raw(loc.row) {
                        // SAFETY: ptr is an initialized value of the column type
                        unsafe { stage.push_copy(instance, id, ptr, std::sync::Arc::clone(column.info())) };
                    }
                }
                None => stage.push(instance, CommandKind::Add(id)),
            }
        }
    }
}
