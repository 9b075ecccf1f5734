//! Event dispatch.

use smallvec::{SmallVec, smallvec};

use crate::{
    FxHashMap, World, builtins,
    component_index::IdFlags,
    entity::{Entity, EntityFlags},
    error::fatal,
    id::Id,
    observer::{Bucket, Listener, Observer, ObserverKind},
    query::{
        CompiledQuery, Iter, QueryIter,
        engine::{Binding, FieldMatch, table_visible},
    },
    table::TableId,
};

/// Depth limit when walking traversable relationships.
const MAX_UP_DEPTH: usize = 64;

/// An event as seen by one entity.
#[derive(Clone, Copy, Debug)]
struct Event {
    event: Entity,
    entity: Entity,
    /// Table the entity is in while the event is delivered.
    table: TableId,
    row: usize,
    /// Table on the other side of the move: the destination for `OnRemove`,
    /// the source for `OnAdd`. Equal to `table` when nothing moved.
    other: TableId,
    stamp: u64,
    /// Shared by both halves of one table move.
    move_stamp: u64,
}

/// Record keys an id is dispatched under: the id and its wildcard forms.
fn lookup_keys(id: Id) -> SmallVec<[Id; 4]> {
    let mut keys = smallvec![id];
    keys.extend(id.wildcard_parents());
    keys
}

impl World {
    /// Notify observers that `ids` were added to, removed from or set on
    /// `entity`.
    pub(crate) fn notify(
        &self,
        event: Entity,
        ids: &[Id],
        entity: Entity,
        table: TableId,
        row: usize,
        other: TableId,
    ) {
        if self.observers.is_empty() {
            return;
        }
        let stamp = self.next_event_id();
        self.notify_move(event, ids, entity, table, row, other, stamp);
    }

    /// Like [`World::notify`], for one half of a table move identified by
    /// `move_stamp`. Monitors fire at most once per move.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn notify_move(
        &self,
        event: Entity,
        ids: &[Id],
        entity: Entity,
        table: TableId,
        row: usize,
        other: TableId,
        move_stamp: u64,
    ) {
        if self.observers.is_empty() || ids.is_empty() {
            return;
        }
        let ev = Event {
            event,
            entity,
            table,
            row,
            other,
            stamp: self.next_event_id(),
            move_stamp,
        };
        let traversable = self
            .entities
            .flags(entity)
            .contains(EntityFlags::TRAVERSABLE_TARGET);
        let mut stamps: FxHashMap<Entity, u64> = FxHashMap::default();

        for &id in ids {
            for key in lookup_keys(id) {
                for bucket in [Bucket::SelfOnly, Bucket::SelfUp] {
                    for listener in self.observers.listeners(bucket, event, key) {
                        self.invoke(&ev, listener, id, Entity::NULL);
                    }
                }
                if traversable {
                    for bucket in [Bucket::SelfUp, Bucket::Up] {
                        for listener in self.observers.listeners(bucket, event, key) {
                            self.propagate(&ev, listener, id, &mut stamps);
                        }
                    }
                }
            }
            let structural = event == builtins::ON_ADD || event == builtins::ON_REMOVE;
            if structural && id.is_pair() {
                self.notify_inherited(&ev, id);
            }
        }
    }

    /// Deliver an event on `ev.entity` to entities that inherit `id` from
    /// it through the listener's traversal relationship.
    fn propagate(&self, ev: &Event, listener: &Listener, id: Id, stamps: &mut FxHashMap<Entity, u64>) {
        let mut stack: SmallVec<[(Entity, usize); 8]> = smallvec![(ev.entity, 0)];
        while let Some((parent, depth)) = stack.pop() {
            if depth >= MAX_UP_DEPTH
                || !self.entities.flags(parent).contains(EntityFlags::TRAVERSABLE_TARGET)
            {
                continue;
            }
            for child in self.holders(Id::pair(listener.trav_rel, parent)) {
                // The child's own id shadows the inherited one for its subtree
                if self.owns(child, id) {
                    continue;
                }
                let Some(loc) = self.entities.location(child) else {
                    continue;
                };
                let stamp = *stamps.entry(child).or_insert_with(|| self.next_event_id());
                let child_ev = Event {
                    entity: child,
                    table: loc.table,
                    row: loc.row,
                    other: loc.table,
                    stamp,
                    move_stamp: stamp,
                    ..*ev
                };
                self.invoke(&child_ev, listener, id, ev.entity);
                stack.push((child, depth + 1));
            }
        }
    }

    /// Report ids reachable through a newly added (or removed) traversable
    /// pair to `up` listeners of the entity.
    fn notify_inherited(&self, ev: &Event, pair: Id) {
        if !self.records.flags(pair).contains(IdFlags::TRAVERSABLE) {
            return;
        }
        let (Some(rel), Some(mut current)) = (
            self.entities.get_alive(pair.first()),
            self.entities.get_alive(pair.second()),
        ) else {
            return;
        };
        let mut seen: SmallVec<[Id; 16]> = SmallVec::new();
        for _ in 0..MAX_UP_DEPTH {
            let Some(ty) = self.type_of(current) else {
                break;
            };
            for id in ty.iter() {
                if seen.contains(&id) {
                    continue;
                }
                seen.push(id);
                for key in lookup_keys(id) {
                    for bucket in [Bucket::SelfUp, Bucket::Up] {
                        for listener in self.observers.listeners(bucket, ev.event, key) {
                            if listener.trav_rel != rel {
                                continue;
                            }
                            if bucket == Bucket::SelfUp && self.owns(ev.entity, id) {
                                continue;
                            }
                            self.invoke(ev, listener, id, current);
                        }
                    }
                }
            }
            match self.target(current, rel, 0) {
                Some(next) => current = next,
                None => break,
            }
        }
    }

    fn invoke(&self, ev: &Event, listener: &Listener, id: Id, src: Entity) {
        let Some(observer) = self.observers.get(listener.observer) else {
            fatal!("listener refers to missing observer {}", listener.observer);
        };
        if self.owns(observer.entity, builtins::DISABLED) {
            return;
        }
        match observer.kind {
            ObserverKind::Uni => {
                let visible = self
                    .tables
                    .get(ev.table)
                    .is_some_and(|t| table_visible(t, &observer.query));
                if !visible {
                    return;
                }
                let fields = [FieldMatch { id, src, set: true }];
                let vars = this_bindings(&observer.query, ev);
                self.deliver(observer, &observer.query, listener.report, id, ev, &fields, &vars);
            }
            ObserverKind::Multi => {
                let query = if listener.negated {
                    observer.not_query.as_ref()
                } else {
                    Some(&observer.query)
                };
                let Some(query) = query else {
                    return;
                };
                let Some(engine) = query.match_in(self, ev.table, ev.row, ev.entity) else {
                    return;
                };
                if !observer.claim(ev.stamp) {
                    return;
                }
                self.deliver(observer, query, listener.report, id, ev, &engine.fields, &engine.vars);
            }
            ObserverKind::Monitor => self.invoke_monitor(observer, id, ev),
        }
    }

    /// Fire a monitor if the move changes whether the entity matches.
    fn invoke_monitor(&self, observer: &Observer, id: Id, ev: &Event) {
        let matches = |table: TableId| {
            observer
                .query
                .match_in(self, table, ev.row, ev.entity)
                .is_some()
        };
        let (before, after) = if ev.table == ev.other {
            let now = matches(ev.table);
            if ev.event == builtins::ON_REMOVE {
                (now, false)
            } else {
                (false, now)
            }
        } else if ev.event == builtins::ON_REMOVE {
            (matches(ev.table), matches(ev.other))
        } else {
            (matches(ev.other), matches(ev.table))
        };
        let report = match (before, after) {
            (false, true) => builtins::ON_ADD,
            (true, false) => builtins::ON_REMOVE,
            _ => return,
        };
        if !observer.claim(ev.move_stamp) {
            return;
        }

        // Field data comes from the table the entity is in right now
        let engine = observer
            .query
            .match_in(self, ev.table, ev.row, ev.entity)
            .map(|e| (&observer.query, e))
            .or_else(|| {
                let not_query = observer.not_query.as_ref()?;
                not_query
                    .match_in(self, ev.table, ev.row, ev.entity)
                    .map(|e| (not_query, e))
            });
        match engine {
            Some((query, engine)) => {
                self.deliver(observer, query, report, id, ev, &engine.fields, &engine.vars);
            }
            None => {
                let unset = FieldMatch {
                    id: Id::NULL,
                    src: Entity::NULL,
                    set: false,
                };
                let fields: SmallVec<[FieldMatch; 8]> = smallvec![unset; observer.query.field_count()];
                let vars = this_bindings(&observer.query, ev);
                self.deliver(observer, &observer.query, report, id, ev, &fields, &vars);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn deliver(
        &self,
        observer: &Observer,
        query: &CompiledQuery,
        report: Entity,
        id: Id,
        ev: &Event,
        fields: &[FieldMatch],
        vars: &[Binding],
    ) {
        tracing::trace!(observer = ?observer.entity, event = ?report, entity = ?ev.entity, %id, "observer fired");
        let mut it = Iter::new(self, &self.stage, query, Some(ev.table), ev.row, 1, fields, vars)
            .with_event(report, id);
        call(observer, &mut it);
    }

    /// Invoke a new observer for everything its query already matches.
    pub(crate) fn yield_existing(&mut self, observer: Entity) {
        self.defer_begin();
        {
            let world: &World = self;
            if let Some(observer) = world.observers.get(observer) {
                for &event in observer.events.iter().filter(|e| **e != builtins::ON_REMOVE) {
                    for it in QueryIter::new(world, &observer.query) {
                        let id = it.field_id(0);
                        let mut it = it.with_event(event, id);
                        call(observer, &mut it);
                    }
                }
            }
        }
        self.defer_end();
    }
}

fn call(observer: &Observer, it: &mut Iter<'_>) {
    if let Some(run) = &observer.run {
        run(it);
    }
    if let Some(callback) = &observer.callback {
        callback(it);
    }
}

/// Variable bindings with `$this` set to the event's entity.
fn this_bindings(query: &CompiledQuery, ev: &Event) -> SmallVec<[Binding; 4]> {
    let mut vars: SmallVec<[Binding; 4]> = smallvec![Binding::Unbound; query.vars.len()];
    if let Some(this) = vars.first_mut() {
        *this = Binding::Table {
            table: ev.table,
            offset: ev.row,
            count: 1,
            entity: ev.entity,
        };
    }
    vars
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use parking_lot::Mutex;

    use crate::{World, builtins, entity::Entity, id::Id, query::TermBuilder};

    #[derive(Default, Clone, Debug, PartialEq)]
    struct Position(i32);

    #[derive(Default, Clone, Debug, PartialEq)]
    struct Velocity(i32);

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&mut crate::Iter<'_>) + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&count);
        (count, move |_: &mut crate::Iter<'_>| {
            inner.fetch_add(1, Ordering::Relaxed);
        })
    }

    #[test]
    fn test_uni_observer_sees_value() {
        let mut world = World::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        world
            .observer()
            .with::<Position>()
            .event(builtins::ON_SET)
            .each(move |it| {
                if let Some(field) = it.field::<Position>(0) {
                    sink.lock().extend(field.iter().cloned());
                }
            })
            .build()
            .ok();
        let e = world.create();
        world.set(e, Position(4));
        world.set(e, Position(6));
        assert_eq!(*seen.lock(), vec![Position(4), Position(6)]);
    }

    #[test]
    fn test_multi_term_fires_once_per_event() {
        let mut world = World::new();
        let (count, callback) = counter();
        world
            .observer()
            .with::<Position>()
            .with::<Velocity>()
            .event(builtins::ON_ADD)
            .each(callback)
            .build()
            .ok();
        let e = world.create();
        world.deferred(|w| {
            w.set(e, Position(1));
            w.set(e, Velocity(1));
        });
        assert_eq!(count.load(Ordering::Relaxed), 1);

        let f = world.create();
        world.set(f, Position(1));
        assert_eq!(count.load(Ordering::Relaxed), 1);
        world.set(f, Velocity(1));
        assert_eq!(count.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_not_term_fires_on_removal() {
        let mut world = World::new();
        let frozen = world.create();
        let (count, callback) = counter();
        world
            .observer()
            .with::<Position>()
            .without_id(Id::of(frozen))
            .event(builtins::ON_ADD)
            .each(callback)
            .build()
            .ok();
        let e = world.create();
        world.add(e, frozen);
        world.set(e, Position(0));
        assert_eq!(count.load(Ordering::Relaxed), 0);
        world.remove(e, frozen);
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_monitor_fires_on_transitions() {
        let mut world = World::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        world
            .observer()
            .with::<Position>()
            .with::<Velocity>()
            .monitor()
            .each(move |it| sink.lock().push(it.event()))
            .build()
            .ok();
        let e = world.create();
        world.set(e, Position(0));
        world.set(e, Velocity(0));
        world.set(e, Velocity(1));
        let tag = world.create();
        world.add(e, tag);
        let velocity = world.component::<Velocity>();
        world.remove(e, velocity);
        assert_eq!(*events.lock(), vec![builtins::ON_ADD, builtins::ON_REMOVE]);
    }

    #[test]
    fn test_yield_existing() {
        let mut world = World::new();
        for i in 0..3 {
            world.create_with(Position(i));
        }
        let (count, callback) = counter();
        world
            .observer()
            .with::<Position>()
            .event(builtins::ON_ADD)
            .yield_existing()
            .each(callback)
            .build()
            .ok();
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_from_list_observer_ignores_builtin_ids() {
        let mut world = World::new();
        let tag = world.create();
        let list = world.create();
        world.add(list, tag);
        world.add(list, builtins::FINAL);
        let (count, callback) = counter();
        world
            .observer()
            .and_from(list)
            .event(builtins::ON_ADD)
            .each(callback)
            .build()
            .ok();

        let e = world.create();
        world.add(e, tag);
        assert_eq!(count.load(Ordering::Relaxed), 1);
        world.add(e, builtins::FINAL);
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_disabled_and_unregistered_observer() {
        let mut world = World::new();
        let tag = world.create();
        let (count, callback) = counter();
        let observer = world
            .observer()
            .with_ref(tag)
            .event(builtins::ON_ADD)
            .each(callback)
            .build()
            .unwrap_or(Entity::NULL);
        world.add(observer, builtins::DISABLED);
        let a = world.create();
        world.add(a, tag);
        assert_eq!(count.load(Ordering::Relaxed), 0);

        world.remove(observer, builtins::DISABLED);
        let b = world.create();
        world.add(b, tag);
        assert_eq!(count.load(Ordering::Relaxed), 1);

        assert!(world.unregister_observer(observer));
        assert!(!world.is_observer(observer));
        let c = world.create();
        world.add(c, tag);
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_up_observer_sees_parent_changes() {
        let mut world = World::new();
        let position = world.component::<Position>();
        let sources = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&sources);
        world
            .observer()
            .with_ref(position)
            .up(builtins::CHILD_OF)
            .event(builtins::ON_ADD)
            .each(move |it| sink.lock().push((it.entities().to_vec(), it.field_src(0))))
            .build()
            .ok();
        let parent = world.create();
        let child = world.create();
        world.add_pair(child, builtins::CHILD_OF, parent);
        world.set(parent, Position(1));
        let late = world.create();
        world.add_pair(late, builtins::CHILD_OF, parent);
        assert_eq!(
            *sources.lock(),
            vec![(vec![child], parent), (vec![late], parent)]
        );
    }

    #[test]
    fn test_wildcard_observer_reports_concrete_id() {
        let mut world = World::new();
        let likes = world.create();
        let bob = world.create();
        let ids = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&ids);
        world
            .observer()
            .with_pair(likes, builtins::WILDCARD)
            .event(builtins::ON_ADD)
            .each(move |it| sink.lock().push(it.event_id()))
            .build()
            .ok();
        let e = world.create();
        world.add_pair(e, likes, bob);
        assert_eq!(*ids.lock(), vec![Id::pair(likes, bob)]);
    }

    #[test]
    fn test_custom_event() {
        let mut world = World::new();
        let clicked = world.create();
        let button = world.create();
        let (count, callback) = counter();
        world
            .observer()
            .with_ref(button)
            .event(clicked)
            .each(callback)
            .build()
            .ok();
        let e = world.create();
        world.add(e, button);
        assert!(world.emit(clicked, button, e));
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }
}
