//! Deferred command stages.
//!
//! While the world is deferred, mutations are recorded in a [`Stage`]
//! instead of being applied. Component values are moved into the stage's
//! bump arena. A stage also keeps a small overlay of the latest staged value
//! and presence per `(entity, id)` so reads during deferral see the
//! entity's pending state.

use std::{
    mem::ManuallyDrop,
    ptr::NonNull,
    sync::Arc,
};

use bumpalo::Bump;
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::{
    FxHashMap, FxHashSet, World,
    builtins,
    component::{Component, TypeInfo},
    entity::Entity,
    error::{EcsError, report},
    id::{Id, IntoId},
};

/// A component value owned by a stage arena.
///
/// Dropping it runs the type's destructor; [`StagedValue::into_raw`] hands
/// ownership of the bytes to the caller instead.
pub(crate) struct StagedValue {
    ptr: NonNull<u8>,
    info: Arc<TypeInfo>,
}

impl StagedValue {
    pub(crate) fn ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub(crate) fn info(&self) -> &Arc<TypeInfo> {
        &self.info
    }

    /// Take the value out. The caller becomes responsible for moving from
    /// or destructing the returned pointer before the arena is dropped.
    pub(crate) fn into_raw(self) -> (*mut u8, Arc<TypeInfo>) {
        let this = ManuallyDrop::new(self);
        // SAFETY: `this` is never dropped, so the Arc is read exactly once
        (this.ptr.as_ptr(), unsafe { std::ptr::read(&this.info) })
    }
}

impl Drop for StagedValue {
    fn drop(&mut self) {
        // SAFETY: the value was initialized when staged and has not been
        // moved out (into_raw skips this drop)
        unsafe { self.info.destruct(self.ptr.as_ptr()) };
    }
}

pub(crate) enum CommandKind {
    Add(Id),
    Remove(Id),
    Set(Id, StagedValue),
    Enable { id: Id, enabled: bool },
    Clear,
    Delete,
}

pub(crate) struct Command {
    pub entity: Entity,
    pub kind: CommandKind,
}

/// Commands taken out of a stage, together with the arena holding their
/// values.
pub(crate) struct StageBatch {
    // Declared before the arena: values are destructed before their memory
    // is released.
    pub commands: Vec<Command>,
    _arena: Bump,
}

impl StageBatch {
    pub(crate) fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Queue of deferred commands for one thread of execution.
#[derive(Default)]
pub struct Stage {
    commands: Vec<Command>,
    arena: Bump,
    staged: FxHashMap<(Entity, Id), NonNull<u8>>,
    /// Latest staged `(id, present, seq)` per entity. Wildcard removes are
    /// kept as entries too.
    presence: FxHashMap<Entity, SmallVec<[(Id, bool, u64); 4]>>,
    cleared: FxHashSet<Entity>,
    seq: u64,
}

// SAFETY: staged pointers refer into the stage's own arena and are only
// dereferenced while the stage is locked.
unsafe impl Send for Stage {}

impl Stage {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub(crate) fn push(&mut self, entity: Entity, kind: CommandKind) {
        match &kind {
            CommandKind::Add(id) => self.mark(entity, *id, true),
            CommandKind::Remove(id) => {
                self.mark(entity, *id, false);
                if id.is_wildcard() {
                    self.staged.retain(|(e, staged), _| *e != entity || !staged.matches(*id));
                } else {
                    self.staged.remove(&(entity, *id));
                }
            }
            CommandKind::Set(id, value) => {
                self.mark(entity, *id, true);
                self.staged.insert((entity, *id), value.ptr);
            }
            CommandKind::Clear | CommandKind::Delete => {
                self.presence.remove(&entity);
                self.staged.retain(|(e, _), _| *e != entity);
                self.cleared.insert(entity);
            }
            CommandKind::Enable { .. } => {}
        }
        self.commands.push(Command { entity, kind });
    }

    fn mark(&mut self, entity: Entity, id: Id, present: bool) {
        self.seq += 1;
        let entry = (id, present, self.seq);
        let marks = self.presence.entry(entity).or_default();
        match marks.iter_mut().find(|(marked, ..)| *marked == id) {
            Some(slot) => *slot = entry,
            None => marks.push(entry),
        }
    }

    /// Move `value` into the arena and stage a set command.
    pub(crate) fn push_value<T: Component>(&mut self, entity: Entity, id: Id, value: T, info: Arc<TypeInfo>) {
        let ptr = self.arena.alloc_layout(info.layout());
        // SAFETY: the allocation has T's layout (info was resolved for T)
        unsafe { ptr.cast::<T>().as_ptr().write(value) };
        self.push(entity, CommandKind::Set(id, StagedValue { ptr, info }));
    }

    /// Copy a value into the arena and stage a set command.
    ///
    /// # Safety
    ///
    /// `src` must point to an initialized value of `info`'s type.
    pub(crate) unsafe fn push_copy(&mut self, entity: Entity, id: Id, src: *const u8, info: Arc<TypeInfo>) {
        let ptr = self.arena.alloc_layout(info.layout());
        // SAFETY: forwarded from the caller
        unsafe { info.copy_to(ptr.as_ptr(), src) };
        self.push(entity, CommandKind::Set(id, StagedValue { ptr, info }));
    }

    /// Latest staged value for `(entity, id)`.
    pub(crate) fn staged_value(&self, entity: Entity, id: Id) -> Option<*const u8> {
        self.staged.get(&(entity, id)).map(|p| p.as_ptr().cast_const())
    }

    /// Staged presence of `id` on `entity`: `Some(false)` when removed or
    /// cleared, `Some(true)` when added, `None` when untouched.
    ///
    /// A wildcard remove hides every matching id staged before it. A
    /// wildcard `id` is present if a matching id was staged after the last
    /// wildcard remove covering it.
    pub(crate) fn staged_has(&self, entity: Entity, id: Id) -> Option<bool> {
        let cleared = self.cleared.contains(&entity).then_some(false);
        let Some(marks) = self.presence.get(&entity) else {
            return cleared;
        };
        let removed = marks
            .iter()
            .filter(|&&(marked, present, _)| !present && marked.is_wildcard() && id.matches(marked))
            .map(|&(.., seq)| seq)
            .max();
        let after = |seq: u64| removed.is_none_or(|r| seq > r);
        let latest = if id.is_wildcard() {
            marks
                .iter()
                .any(|&(marked, present, seq)| present && marked.matches(id) && after(seq))
                .then_some(true)
        } else {
            marks
                .iter()
                .find(|&&(marked, ..)| marked == id)
                .filter(|&&(.., seq)| after(seq))
                .map(|&(_, present, _)| present)
        };
        latest
            .or(removed.map(|_| false))
            .or(cleared)
    }

    /// Take all queued commands, leaving the stage empty.
    pub(crate) fn take(&mut self) -> StageBatch {
        self.staged.clear();
        self.presence.clear();
        self.cleared.clear();
        self.seq = 0;
        StageBatch {
            commands: std::mem::take(&mut self.commands),
            _arena: std::mem::take(&mut self.arena),
        }
    }
}

impl Drop for Stage {
    fn drop(&mut self) {
        // Values must be destructed while the arena is alive
        self.commands.clear();
    }
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("commands", &self.commands.len())
            .field("arena_bytes", &self.arena.allocated_bytes())
            .finish()
    }
}

// ============================================================================
// Commands
// ============================================================================

/// Handle for queueing mutations on a stage.
///
/// Obtained from [`crate::Iter::commands`] inside query runs and observer
/// callbacks, or from [`World::commands`]. Commands are applied in the order
/// they were issued when the stage is merged.
#[derive(Clone, Copy)]
pub struct Commands<'a> {
    world: &'a World,
    stage: &'a Mutex<Stage>,
}

impl<'a> Commands<'a> {
    pub(crate) fn new(world: &'a World, stage: &'a Mutex<Stage>) -> Self {
        Self { world, stage }
    }

    fn push(&self, entity: Entity, kind: CommandKind) -> &Self {
        self.stage.lock().push(entity, kind);
        self
    }

    #[track_caller]
    pub fn add(&self, entity: Entity, id: impl IntoId) -> &Self {
        match self.world.resolve_id(id) {
            Some(id) => self.push(entity, CommandKind::Add(id)),
            None => self,
        }
    }

    #[track_caller]
    pub fn add_pair(&self, entity: Entity, rel: Entity, target: Entity) -> &Self {
        match self.world.resolve_pair(rel, target) {
            Some(pair) => self.push(entity, CommandKind::Add(pair)),
            None => self,
        }
    }

    #[track_caller]
    pub fn remove(&self, entity: Entity, id: impl IntoId) -> &Self {
        match self.world.resolve_id(id) {
            Some(id) => self.push(entity, CommandKind::Remove(id)),
            None => self,
        }
    }

    #[track_caller]
    pub fn remove_pair(&self, entity: Entity, rel: Entity, target: Entity) -> &Self {
        match self.world.resolve_pair(rel, target) {
            Some(pair) => self.push(entity, CommandKind::Remove(pair)),
            None => self,
        }
    }

    /// Queue a value for component `T`. `T` must be registered.
    #[track_caller]
    pub fn set<T: Component>(&self, entity: Entity, value: T) -> &Self {
        match self.world.component_id::<T>() {
            Some(component) => self.set_id(entity, Id::of(component), value),
            None => {
                report(&EcsError::InvalidParameter(format!(
                    "component {} is not registered",
                    std::any::type_name::<T>()
                )));
                self
            }
        }
    }

    /// Queue a value for `id`, whose type must be `T`.
    #[track_caller]
    pub fn set_id<T: Component>(&self, entity: Entity, id: Id, value: T) -> &Self {
        match self.world.type_info_for::<T>(id) {
            Ok(info) => self.stage.lock().push_value(entity, id, value, info),
            Err(error) => report(&error),
        }
        self
    }

    #[track_caller]
    pub fn enable(&self, entity: Entity, id: impl IntoId) -> &Self {
        self.set_enabled(entity, id, true)
    }

    #[track_caller]
    pub fn disable(&self, entity: Entity, id: impl IntoId) -> &Self {
        self.set_enabled(entity, id, false)
    }

    #[track_caller]
    fn set_enabled(&self, entity: Entity, id: impl IntoId, enabled: bool) -> &Self {
        match self.world.resolve_id(id) {
            Some(id) => self.push(entity, CommandKind::Enable { id, enabled }),
            None => self,
        }
    }

    /// Mark the entity disabled, hiding it from queries.
    pub fn disable_entity(&self, entity: Entity) -> &Self {
        self.add(entity, builtins::DISABLED)
    }

    pub fn clear(&self, entity: Entity) -> &Self {
        self.push(entity, CommandKind::Clear)
    }

    pub fn delete(&self, entity: Entity) -> &Self {
        self.push(entity, CommandKind::Delete)
    }
}

impl std::fmt::Debug for Commands<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Commands").finish_non_exhaustive()
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
    fn test_presence_overlay() {
        let mut stage = Stage::new();
        let id = Id::of(e(80));
        stage.push(e(70), CommandKind::Add(id));
        assert_eq!(stage.staged_has(e(70), id), Some(true));
        stage.push(e(70), CommandKind::Remove(id));
        assert_eq!(stage.staged_has(e(70), id), Some(false));
        assert_eq!(stage.staged_has(e(71), id), None);

        stage.push(e(71), CommandKind::Clear);
        assert_eq!(stage.staged_has(e(71), id), Some(false));
        stage.push(e(71), CommandKind::Add(id));
        assert_eq!(stage.staged_has(e(71), id), Some(true));
    }

    #[test]
    fn test_wildcard_remove_hides_matching_pairs() {
        let mut stage = Stage::new();
        let (likes, bob, alice) = (e(80), e(81), e(82));
        let all = Id::pair(likes, builtins::WILDCARD);
        stage.push(e(70), CommandKind::Add(Id::pair(likes, bob)));
        stage.push(e(70), CommandKind::Remove(all));

        assert_eq!(stage.staged_has(e(70), Id::pair(likes, bob)), Some(false));
        assert_eq!(stage.staged_has(e(70), Id::pair(likes, alice)), Some(false));
        assert_eq!(stage.staged_has(e(70), all), Some(false));
        assert_eq!(stage.staged_has(e(70), Id::pair(e(83), bob)), None);

        stage.push(e(70), CommandKind::Add(Id::pair(likes, alice)));
        assert_eq!(stage.staged_has(e(70), Id::pair(likes, alice)), Some(true));
        assert_eq!(stage.staged_has(e(70), Id::pair(likes, bob)), Some(false));
        assert_eq!(stage.staged_has(e(70), all), Some(true));
    }

    #[test]
    fn test_latest_value_wins_and_values_drop() {
        let counter = Arc::new(());
        let info = Arc::new(TypeInfo::of::<Arc<()>>());
        let id = Id::of(e(80));
        let mut stage = Stage::new();
        stage.push_value(e(70), id, Arc::clone(&counter), Arc::clone(&info));
        stage.push_value(e(70), id, Arc::clone(&counter), Arc::clone(&info));
        assert_eq!(Arc::strong_count(&counter), 3);

        let ptr = stage.staged_value(e(70), id).map(|p| p as usize);
        let last = stage.commands.last().map(|c| match &c.kind {
            CommandKind::Set(_, v) => v.ptr() as usize,
            _ => 0,
        });
        assert_eq!(ptr, last);

        let batch = stage.take();
        assert!(stage.is_empty());
        assert_eq!(stage.staged_has(e(70), id), None);
        drop(batch);
        assert_eq!(Arc::strong_count(&counter), 1);
    }
}
