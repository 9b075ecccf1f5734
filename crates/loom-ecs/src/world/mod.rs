//! World - the main container for all ECS data.
//!
//! The world owns the entity index, the table graph, the component records,
//! the type info registry, the observers and the command stages. Every
//! structural operation goes through it.
//!
//! Mutations either apply immediately or, while the world is deferred (see
//! [`World::defer_begin`]), are queued on the main stage and replayed when
//! the outermost deferred region ends.

mod cleanup;
mod commit;
mod deferred;
mod names;
mod traits;

use std::{
    mem::ManuallyDrop,
    sync::{Arc, atomic::AtomicU64},
};

use parking_lot::Mutex;

use crate::{
    builtins,
    component::{Component, TypeInfo, TypeInfoRegistry},
    component_index::{ComponentIndex, ComponentRecord, IdFlags},
    config::WorldConfig,
    entity::{Entity, EntityIndex, EntityLocation},
    error::{EcsError, EcsResult, report},
    id::{Id, IntoId},
    observer::{ObserverBuilder, ObserverRegistry},
    query::QueryBuilder,
    stage::{CommandKind, Commands, Stage},
    table::{Table, TableId, Type},
    table_graph::TableGraph,
};

pub(crate) use names::Names;

/// Depth limit for `IsA` inheritance lookups.
const MAX_INHERIT_DEPTH: u32 = 64;

/// The ECS world - container for all entities, tables and observers.
pub struct World {
    pub(crate) entities: EntityIndex,
    pub(crate) tables: TableGraph,
    pub(crate) records: ComponentIndex,
    pub(crate) types: TypeInfoRegistry,
    pub(crate) observers: ObserverRegistry,
    names: Names,
    /// Main stage.
    pub(crate) stage: Mutex<Stage>,
    /// One stage per worker used by parallel passes.
    pub(crate) workers: Vec<Mutex<Stage>>,
    defer_depth: u32,
    defer_suspended: u32,
    /// Stamp of the most recent notification.
    pub(crate) event_id: AtomicU64,
    config: WorldConfig,
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

impl World {
    /// Create a new world with the builtin entities bootstrapped.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(WorldConfig::default())
    }

    /// Create a world with pre-allocated entity capacity.
    #[must_use]
    pub fn with_capacity(entity_capacity: usize) -> Self {
        Self::with_config(WorldConfig::new().entity_capacity(entity_capacity))
    }

    #[must_use]
    pub fn with_config(config: WorldConfig) -> Self {
        let mut world = Self {
            entities: EntityIndex::with_capacity(config.entity_capacity),
            tables: TableGraph::new(),
            records: ComponentIndex::new(),
            types: TypeInfoRegistry::new(),
            observers: ObserverRegistry::default(),
            names: Names::default(),
            stage: Mutex::new(Stage::new()),
            workers: (0..config.stage_count).map(|_| Mutex::new(Stage::new())).collect(),
            defer_depth: 0,
            defer_suspended: 0,
            event_id: AtomicU64::new(0),
            config,
        };
        world.bootstrap();
        world
    }

    fn bootstrap(&mut self) {
        for &(entity, name) in builtins::NAMES {
            let row = self.tables.table_mut(TableId::ROOT).append(entity);
            self.entities.make_alive(entity.id(), TableId::ROOT, row);
            self.names.insert(entity, name);
        }

        let traits = [
            (builtins::CHILD_OF, builtins::EXCLUSIVE),
            (builtins::CHILD_OF, builtins::ACYCLIC),
            (builtins::CHILD_OF, builtins::TRAVERSABLE),
            (builtins::CHILD_OF, builtins::TAG),
            (builtins::IS_A, builtins::TRANSITIVE),
            (builtins::IS_A, builtins::REFLEXIVE),
            (builtins::IS_A, builtins::TRAVERSABLE),
            (builtins::IS_A, builtins::TAG),
            (builtins::PREFAB, builtins::DONT_INHERIT),
            (builtins::DISABLED, builtins::DONT_INHERIT),
        ];
        self.defer_begin();
        for (entity, tag) in traits {
            self.op_add(entity, Id::of(tag));
        }
        self.op_add(
            builtins::CHILD_OF,
            Id::pair(builtins::ON_DELETE_TARGET, builtins::DELETE),
        );
        self.defer_end();
        tracing::debug!(tables = self.tables.len(), "bootstrapped world");
    }

    #[must_use]
    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    // ==================== Entity Operations ====================

    /// Create a new empty entity.
    ///
    /// Entities are created immediately, also while the world is deferred.
    pub fn create(&mut self) -> Entity {
        let root = self.tables.table_mut(TableId::ROOT);
        let entity = self.entities.create(TableId::ROOT, root.len());
        root.append(entity);
        entity
    }

    /// Create an entity with one component value.
    pub fn create_with<T: Component>(&mut self, value: T) -> Entity {
        let entity = self.create();
        self.set(entity, value);
        entity
    }

    /// Delete an entity and apply the cleanup policies of the ids it is
    /// used in. Deleting a dead entity is a no-op.
    ///
    /// Returns `true` if the entity was alive.
    pub fn delete(&mut self, entity: Entity) -> bool {
        if !self.entities.is_alive(entity) {
            return false;
        }
        if self.is_deferred() {
            self.stage.get_mut().push(entity, CommandKind::Delete);
            return true;
        }
        self.defer_begin();
        self.delete_now(entity);
        self.defer_end();
        true
    }

    /// Remove all ids from an entity, keeping it alive.
    #[track_caller]
    pub fn clear(&mut self, entity: Entity) -> bool {
        if !self.check_alive(entity) {
            return false;
        }
        if self.is_deferred() {
            self.stage.get_mut().push(entity, CommandKind::Clear);
            return true;
        }
        self.defer_begin();
        self.clear_now(entity);
        self.defer_end();
        true
    }

    #[must_use]
    pub fn is_alive(&self, entity: Entity) -> bool {
        self.entities.is_alive(entity)
    }

    /// Current alive entity for an index, if any.
    #[must_use]
    pub fn get_alive(&self, index: u32) -> Option<Entity> {
        self.entities.get_alive(index)
    }

    #[must_use]
    pub fn entity_count(&self) -> u32 {
        self.entities.alive_count()
    }

    #[must_use]
    pub fn location(&self, entity: Entity) -> Option<EntityLocation> {
        self.entities.location(entity)
    }

    /// Type of the table the entity lives in.
    #[must_use]
    pub fn type_of(&self, entity: Entity) -> Option<&Type> {
        let loc = self.entities.location(entity)?;
        self.tables.get(loc.table).map(Table::ty)
    }

    #[must_use]
    pub fn table(&self, table: TableId) -> Option<&Table> {
        self.tables.get(table)
    }

    #[must_use]
    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    /// Delete all empty tables except the root. Returns how many were
    /// deleted.
    pub fn delete_empty_tables(&mut self) -> usize {
        let deleted = self.tables.delete_empty_tables(&mut self.records);
        tracing::debug!(deleted, "deleted empty tables");
        deleted
    }

    /// Hierarchy depth of a table: the depth of its `ChildOf` target plus
    /// one, or 0 for tables without a parent.
    #[must_use]
    pub fn table_depth(&self, table: TableId) -> u32 {
        let Some(table) = self.tables.get(table) else {
            return 0;
        };
        match table.ty().find_match(Id::pair(builtins::CHILD_OF, builtins::WILDCARD), 0) {
            Some((_, id)) => self
                .entities
                .get_alive(id.second())
                .map_or(0, |parent| self.records.childof_depth(parent)),
            None => 0,
        }
    }

    /// Component record of an id.
    #[must_use]
    pub fn record(&self, id: impl IntoId) -> Option<&ComponentRecord> {
        self.records.get(self.live_id(id)?)
    }

    /// Traits of an id; pairs report their relationship's traits.
    #[must_use]
    pub fn id_flags(&self, id: impl IntoId) -> IdFlags {
        self.live_id(id)
            .map_or(IdFlags::empty(), |id| self.records.flags(id))
    }

    #[track_caller]
    fn check_alive(&self, entity: Entity) -> bool {
        let alive = self.entities.is_alive(entity);
        if !alive {
            report(&EcsError::DeadEntity(entity));
        }
        alive
    }

    /// Resolve `id`, refusing one named by a dead entity handle.
    #[track_caller]
    pub(crate) fn resolve_id(&self, id: impl IntoId) -> Option<Id> {
        match id.handle() {
            Some(handle) if !self.entities.is_alive(handle) => {
                report(&EcsError::InvalidId(id.into_id()));
                None
            }
            _ => Some(id.into_id()),
        }
    }

    /// Id of `id` if it does not name a dead entity, without reporting.
    fn live_id(&self, id: impl IntoId) -> Option<Id> {
        id.handle()
            .is_none_or(|handle| self.entities.is_alive(handle))
            .then(|| id.into_id())
    }

    /// Pair id from two handles, both of which must be alive.
    #[track_caller]
    pub(crate) fn resolve_pair(&self, rel: Entity, target: Entity) -> Option<Id> {
        if let Some(dead) = [rel, target].into_iter().find(|&half| !self.entities.is_alive(half)) {
            report(&EcsError::DeadEntity(dead));
            return None;
        }
        let pair = Id::try_pair(rel, target);
        if pair.is_none() {
            report(&EcsError::InvalidParameter(format!(
                "relationship {rel} is outside the pair id range"
            )));
        }
        pair
    }

    // ==================== Composition ====================

    /// Add an id (component, tag or pair) to an entity.
    ///
    /// Returns `false` if the entity is dead or the id is rejected.
    #[track_caller]
    pub fn add(&mut self, entity: Entity, id: impl IntoId) -> bool {
        if !self.check_alive(entity) {
            return false;
        }
        let Some(id) = self.resolve_id(id) else {
            return false;
        };
        if self.is_deferred() {
            self.stage.get_mut().push(entity, CommandKind::Add(id));
            return true;
        }
        self.defer_begin();
        let added = self.op_add(entity, id);
        self.defer_end();
        added
    }

    /// Add the pair `(rel, target)`.
    #[track_caller]
    pub fn add_pair(&mut self, entity: Entity, rel: Entity, target: Entity) -> bool {
        self.resolve_pair(rel, target)
            .is_some_and(|pair| self.add(entity, pair))
    }

    /// Remove an id. Wildcard ids remove every matching id.
    #[track_caller]
    pub fn remove(&mut self, entity: Entity, id: impl IntoId) -> bool {
        if !self.check_alive(entity) {
            return false;
        }
        let Some(id) = self.resolve_id(id) else {
            return false;
        };
        if self.is_deferred() {
            self.stage.get_mut().push(entity, CommandKind::Remove(id));
            return true;
        }
        self.defer_begin();
        let removed = self.op_remove(entity, id);
        self.defer_end();
        removed
    }

    #[track_caller]
    pub fn remove_pair(&mut self, entity: Entity, rel: Entity, target: Entity) -> bool {
        self.resolve_pair(rel, target)
            .is_some_and(|pair| self.remove(entity, pair))
    }

    /// Whether the entity has `id`, directly or inherited through `IsA`.
    ///
    /// While deferred, ids added or removed by queued commands are taken
    /// into account.
    #[must_use]
    pub fn has(&self, entity: Entity, id: impl IntoId) -> bool {
        let Some(id) = self.live_id(id) else {
            return false;
        };
        if !self.entities.is_alive(entity) {
            return false;
        }
        if let Some(present) = self.stage.lock().staged_has(entity, id) {
            return present;
        }
        self.has_inherited(entity, id, 0)
    }

    /// Whether the entity itself has `id` (no inheritance).
    #[must_use]
    pub fn owns(&self, entity: Entity, id: impl IntoId) -> bool {
        let Some(id) = self.live_id(id) else {
            return false;
        };
        self.type_of(entity)
            .is_some_and(|ty| ty.find_match(id, 0).is_some())
    }

    fn has_inherited(&self, entity: Entity, id: Id, depth: u32) -> bool {
        let Some(ty) = self.type_of(entity) else {
            return false;
        };
        if ty.find_match(id, 0).is_some() {
            return true;
        }
        if depth >= MAX_INHERIT_DEPTH || self.records.flags(id).contains(IdFlags::DONT_INHERIT) {
            return false;
        }
        self.bases(ty)
            .any(|base| self.has_inherited(base, id, depth + 1))
    }

    /// `IsA` bases listed in a type.
    fn bases<'a>(&'a self, ty: &'a Type) -> impl Iterator<Item = Entity> + 'a {
        let pattern = Id::pair(builtins::IS_A, builtins::WILDCARD);
        let mut start = 0;
        std::iter::from_fn(move || {
            let (i, id) = ty.find_match(pattern, start)?;
            start = i + 1;
            Some(id)
        })
        .filter_map(|id| self.entities.get_alive(id.second()))
    }

    /// The `index`-th target of `rel` on the entity.
    #[must_use]
    pub fn target(&self, entity: Entity, rel: Entity, index: usize) -> Option<Entity> {
        let ty = self.type_of(entity)?;
        let pattern = Id::pair(rel, builtins::WILDCARD);
        let mut start = 0;
        let mut n = 0;
        while let Some((i, id)) = ty.find_match(pattern, start) {
            if n == index {
                return self.entities.get_alive(id.second());
            }
            n += 1;
            start = i + 1;
        }
        None
    }

    /// `ChildOf` target of the entity.
    #[must_use]
    pub fn parent(&self, entity: Entity) -> Option<Entity> {
        self.target(entity, builtins::CHILD_OF, 0)
    }

    /// Entities with `(ChildOf, parent)`.
    #[must_use]
    pub fn children(&self, parent: Entity) -> Vec<Entity> {
        self.holders(Id::pair(builtins::CHILD_OF, parent))
    }

    /// Entities whose table matches `id`, in table registration order.
    pub(crate) fn holders(&self, id: Id) -> Vec<Entity> {
        let Some(record) = self.records.get(id) else {
            return Vec::new();
        };
        record
            .tables()
            .iter()
            .filter_map(|tr| self.tables.get(tr.table))
            .flat_map(|table| table.entities().iter().copied())
            .collect()
    }

    // ==================== Components ====================

    /// Register a Rust type as a component, returning its entity.
    ///
    /// Repeated calls return the same entity.
    pub fn component<T: Component>(&mut self) -> Entity {
        if let Some(entity) = self.component_id::<T>() {
            return entity;
        }
        let entity = self.create();
        self.names.insert(entity, std::any::type_name::<T>());
        let info = self.types.register(Id::of(entity), TypeInfo::of::<T>());
        self.types.bind_type::<T>(entity);
        self.records
            .ensure(Id::of(entity), &self.types)
            .set_type_info(Some(info));
        self.add(entity, builtins::COMPONENT);
        tracing::debug!(?entity, name = std::any::type_name::<T>(), "registered component");
        entity
    }

    /// Component entity of a Rust type, without registering it.
    #[must_use]
    pub fn component_id<T: Component>(&self) -> Option<Entity> {
        self.types
            .entity_of::<T>()
            .filter(|e| self.entities.is_alive(*e))
    }

    /// Register type info (layout and hooks) for an id.
    ///
    /// Fails when the id is a wildcard or already stored in tables.
    #[track_caller]
    pub fn register_type_info(&mut self, id: impl IntoId, info: TypeInfo) -> bool {
        let Some(id) = self.resolve_id(id) else {
            return false;
        };
        let result = if id.is_wildcard() || id.is_null() {
            Err(EcsError::InvalidId(id))
        } else if self.records.get(id).is_some_and(|r| !r.is_empty()) {
            Err(EcsError::InvalidOperation(format!(
                "can not change type info of {id}: id is in use"
            )))
        } else {
            Ok(())
        };
        if let Err(error) = result {
            report(&error);
            return false;
        }
        let info = self.types.register(id, info);
        if let Some(record) = self.records.get_mut(id) {
            record.set_type_info(Some(info));
        }
        if !id.is_pair() {
            if let Some(entity) = self.entities.get_alive(id.first()) {
                self.add(entity, builtins::COMPONENT);
            }
        }
        true
    }

    /// Type info for the data stored under `id`, checked against `T`.
    pub(crate) fn type_info_for<T: Component>(&self, id: Id) -> EcsResult<Arc<TypeInfo>> {
        match self.records.resolve_type_info(id, &self.types) {
            Some(info) if info.is::<T>() => Ok(info),
            Some(info) => Err(EcsError::TypeMismatch {
                id,
                actual: info.name().to_owned(),
            }),
            None => Err(EcsError::InvalidParameter(format!("{id} carries no data"))),
        }
    }

    // ==================== Values ====================

    /// Set component `T`, registering it on first use.
    ///
    /// The id is added first if missing. Emits `OnSet`.
    #[track_caller]
    pub fn set<T: Component>(&mut self, entity: Entity, value: T) -> bool {
        let component = self.component::<T>();
        self.set_id(entity, Id::of(component), value)
    }

    /// Set the value of `id`, whose data type must be `T`. Used for pairs
    /// that carry data.
    #[track_caller]
    pub fn set_id<T: Component>(&mut self, entity: Entity, id: Id, value: T) -> bool {
        if !self.check_alive(entity) {
            return false;
        }
        let info = match self.type_info_for::<T>(id) {
            Ok(info) => info,
            Err(error) => {
                report(&error);
                return false;
            }
        };
        if self.is_deferred() {
            self.stage.get_mut().push_value(entity, id, value, info);
            return true;
        }
        self.defer_begin();
        let mut value = ManuallyDrop::new(value);
        let src = std::ptr::from_mut::<T>(&mut *value).cast::<u8>();
        // SAFETY: src points to an initialized T matching `info`
        let written = unsafe { self.set_now(entity, id, src, &info, true) };
        if !written {
            // SAFETY: the value was not moved out
            unsafe { ManuallyDrop::drop(&mut value) };
        }
        self.defer_end();
        written
    }

    /// Copy a raw value into the slot of `id`.
    ///
    /// # Safety
    ///
    /// `src` must point to an initialized value of the type registered for
    /// `id`.
    #[track_caller]
    pub unsafe fn set_raw(&mut self, entity: Entity, id: Id, src: *const u8) -> bool {
        if !self.check_alive(entity) {
            return false;
        }
        let Some(info) = self.records.resolve_type_info(id, &self.types) else {
            report(&EcsError::InvalidParameter(format!("{id} carries no data")));
            return false;
        };
        if self.is_deferred() {
            // SAFETY: forwarded from the caller
            unsafe { self.stage.get_mut().push_copy(entity, id, src, info) };
            return true;
        }
        self.defer_begin();
        // SAFETY: forwarded from the caller; the value is copied, not moved
        let written = unsafe { self.set_now(entity, id, src.cast_mut(), &info, false) };
        self.defer_end();
        written
    }

    /// Clone of component `T`, own or inherited.
    ///
    /// While deferred, a value staged with `set` is returned instead of the
    /// stored one.
    #[must_use]
    pub fn get<T: Component>(&self, entity: Entity) -> Option<T> {
        let component = self.component_id::<T>()?;
        self.get_id(entity, Id::of(component))
    }

    /// Clone of the value stored under `id`.
    #[must_use]
    pub fn get_id<T: Component>(&self, entity: Entity, id: Id) -> Option<T> {
        if !self.entities.is_alive(entity) {
            return None;
        }
        {
            let stage = self.stage.lock();
            if let Some(ptr) = stage.staged_value(entity, id) {
                // SAFETY: staged values for `id` were checked against T when
                // queued, and the stage is locked while the value is cloned
                return Some(unsafe { (*ptr.cast::<T>()).clone() });
            }
            if stage.staged_has(entity, id) == Some(false) {
                return None;
            }
        }
        self.get_ref_id(entity, id).cloned()
    }

    /// Reference to component `T`, own or inherited.
    #[must_use]
    pub fn get_ref<T: Component>(&self, entity: Entity) -> Option<&T> {
        let component = self.component_id::<T>()?;
        self.get_ref_id(entity, Id::of(component))
    }

    #[must_use]
    pub fn get_ref_id<T: Component>(&self, entity: Entity, id: Id) -> Option<&T> {
        let (ptr, info) = self.find_value(entity, id, 0)?;
        // SAFETY: the column stores values of `info`'s type, which is T
        info.is::<T>().then(|| unsafe { &*ptr.cast::<T>() })
    }

    /// Mutable reference to an owned component value.
    ///
    /// Does not emit `OnSet`; call [`World::modified`] after writing.
    pub fn get_mut<T: Component>(&mut self, entity: Entity) -> Option<&mut T> {
        let component = self.component_id::<T>()?;
        let loc = self.entities.location(entity)?;
        let table = self.tables.get(loc.table)?;
        let column = table.column(Id::of(component))?;
        if !column.info().is::<T>() {
            return None;
        }
        let ptr = column.get_raw(loc.row)?;
        // SAFETY: &mut self guarantees exclusive access to the column
        Some(unsafe { &mut *ptr.cast::<T>() })
    }

    /// Pointer to the value of `id` (own or inherited).
    #[must_use]
    pub fn get_raw(&self, entity: Entity, id: Id) -> Option<*const u8> {
        self.find_value(entity, id, 0).map(|(ptr, _)| ptr.cast_const())
    }

    fn find_value(&self, entity: Entity, id: Id, depth: u32) -> Option<(*mut u8, &Arc<TypeInfo>)> {
        let loc = self.entities.location(entity)?;
        let table = self.tables.get(loc.table)?;
        if let Some(column) = table.column(id) {
            return column.get_raw(loc.row).map(|ptr| (ptr, column.info()));
        }
        if depth >= MAX_INHERIT_DEPTH || self.records.flags(id).contains(IdFlags::DONT_INHERIT) {
            return None;
        }
        let bases: Vec<Entity> = self.bases(table.ty()).collect();
        bases
            .into_iter()
            .find_map(|base| self.find_value(base, id, depth + 1))
    }

    /// Run `OnSet` hooks and observers for a value written in place.
    #[track_caller]
    pub fn modified(&mut self, entity: Entity, id: impl IntoId) -> bool {
        let Some(id) = self.resolve_id(id) else {
            return false;
        };
        let Some(loc) = self.entities.location(entity) else {
            return false;
        };
        self.defer_begin();
        self.emit_set(entity, id, loc.table, loc.row);
        self.defer_end();
        true
    }

    /// Enable a toggle id on the entity (adds `TOGGLE | id` if missing).
    #[track_caller]
    pub fn enable(&mut self, entity: Entity, id: impl IntoId) -> bool {
        self.resolve_id(id)
            .is_some_and(|id| self.set_enabled(entity, id, true))
    }

    /// Disable a toggle id on the entity. Queries skip rows where a matched
    /// id is disabled.
    #[track_caller]
    pub fn disable(&mut self, entity: Entity, id: impl IntoId) -> bool {
        self.resolve_id(id)
            .is_some_and(|id| self.set_enabled(entity, id, false))
    }

    #[track_caller]
    fn set_enabled(&mut self, entity: Entity, id: Id, enabled: bool) -> bool {
        if !self.check_alive(entity) {
            return false;
        }
        if self.is_deferred() {
            self.stage
                .get_mut()
                .push(entity, CommandKind::Enable { id, enabled });
            return true;
        }
        self.defer_begin();
        let done = self.op_enable(entity, id, enabled);
        self.defer_end();
        done
    }

    /// Whether a toggle id is enabled. Ids without a toggle are enabled if
    /// present.
    #[must_use]
    pub fn is_enabled(&self, entity: Entity, id: impl IntoId) -> bool {
        let Some(id) = self.live_id(id) else {
            return false;
        };
        let Some(loc) = self.entities.location(entity) else {
            return false;
        };
        self.tables
            .get(loc.table)
            .is_some_and(|t| t.is_enabled(id, loc.row))
    }

    // ==================== Queries & observers ====================

    /// Start building a query.
    pub fn query(&self) -> QueryBuilder<'_> {
        QueryBuilder::new(self)
    }

    /// Start building an observer.
    pub fn observer(&mut self) -> ObserverBuilder<'_> {
        ObserverBuilder::new(self)
    }

    /// Command handle for the main stage.
    pub fn commands(&self) -> Commands<'_> {
        Commands::new(self, &self.stage)
    }

    /// Number of worker stages used by parallel passes.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.workers.len()
    }

    pub fn set_stage_count(&mut self, count: usize) {
        self.workers.resize_with(count, || Mutex::new(Stage::new()));
        self.config.stage_count = count;
    }
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("entities", &self.entities)
            .field("tables", &self.tables)
            .field("records", &self.records.len())
            .field("defer_depth", &self.defer_depth)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default, Clone, Debug, PartialEq)]
    struct Position {
        x: f32,
        y: f32,
    }

    #[derive(Default, Clone, Debug, PartialEq)]
    struct Health(u32);

    #[test]
    fn test_builtins_bootstrapped() {
        let world = World::new();
        assert!(world.is_alive(builtins::CHILD_OF));
        assert_eq!(world.lookup("ChildOf"), Some(builtins::CHILD_OF));
        let flags = world.id_flags(builtins::CHILD_OF);
        assert!(flags.contains(IdFlags::EXCLUSIVE | IdFlags::ACYCLIC | IdFlags::TRAVERSABLE));
        assert!(world.id_flags(builtins::IS_A).contains(IdFlags::TRANSITIVE | IdFlags::REFLEXIVE));
    }

    #[test]
    fn test_set_get_round_trip() {
        let mut world = World::new();
        let e = world.create();
        assert!(world.set(e, Position { x: 1.0, y: 2.0 }));
        assert_eq!(world.get::<Position>(e), Some(Position { x: 1.0, y: 2.0 }));
        assert_eq!(world.get::<Health>(e), None);

        world.set(e, Health(10));
        if let Some(health) = world.get_mut::<Health>(e) {
            health.0 -= 3;
        }
        assert_eq!(world.get_ref::<Health>(e), Some(&Health(7)));
        assert_eq!(world.get::<Position>(e), Some(Position { x: 1.0, y: 2.0 }));
    }

    #[test]
    fn test_dead_entity_rejected() {
        let mut world = World::new();
        let e = world.create();
        let tag = world.create();
        world.delete(e);
        assert!(!world.add(e, tag));
        assert!(!world.set(e, Health(1)));
        assert!(!world.has(e, tag));
        assert!(!world.delete(e));
    }

    #[test]
    fn test_target_and_parent() {
        let mut world = World::new();
        let parent = world.create();
        let child = world.create();
        world.add_pair(child, builtins::CHILD_OF, parent);
        assert_eq!(world.parent(child), Some(parent));
        assert_eq!(world.children(parent), vec![child]);
        assert_eq!(world.target(child, builtins::CHILD_OF, 1), None);
    }

    #[test]
    fn test_isa_inheritance() {
        let mut world = World::new();
        let base = world.create();
        world.set(base, Health(50));
        let inst = world.create();
        world.add_pair(inst, builtins::IS_A, base);

        let health = world.component::<Health>();
        assert!(world.has(inst, health));
        assert!(!world.owns(inst, health));
        assert_eq!(world.get::<Health>(inst), Some(Health(50)));

        world.set(inst, Health(20));
        assert_eq!(world.get::<Health>(inst), Some(Health(20)));
        assert_eq!(world.get::<Health>(base), Some(Health(50)));
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let mut world = World::new();
        let e = world.create();
        let position = world.component::<Position>();
        assert!(!world.set_id(e, Id::of(position), Health(1)));
        assert!(!world.has(e, position));
    }

    #[test]
    fn test_register_type_info_rejected_in_use() {
        let mut world = World::new();
        let e = world.create();
        let tag = world.create();
        world.add(e, tag);
        assert!(!world.register_type_info(tag, TypeInfo::of::<Health>()));
        assert!(!world.register_type_info(builtins::WILDCARD, TypeInfo::of::<Health>()));
    }
}
