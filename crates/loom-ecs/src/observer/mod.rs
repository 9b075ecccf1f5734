//! Observers: callbacks fired by structural events.
//!
//! An observer is an entity with a query and a set of events. Observers
//! whose query is a single plain term are dispatched directly from the
//! `(event, id)` buckets. Any other query is re-evaluated for the affected
//! entity, once per event no matter how many of its terms were triggered.
//!
//! Listeners live in one map per traversal mode: `self`, `self|up` and `up`.

mod builder;
mod dispatch;

use std::sync::atomic::{AtomicU64, Ordering};

use smallvec::SmallVec;

pub use builder::ObserverBuilder;

use crate::{
    FxHashMap, World, builtins,
    entity::Entity,
    id::{Id, IntoId},
    query::{CompiledQuery, Iter},
};

/// Observer callback.
pub type Callback = Box<dyn Fn(&mut Iter<'_>) + Send + Sync>;

/// Traversal bucket a listener is registered in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Bucket {
    SelfOnly = 0,
    SelfUp = 1,
    Up = 2,
}

impl Bucket {
    pub(crate) const ALL: [Self; 3] = [Self::SelfOnly, Self::SelfUp, Self::Up];
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ObserverKind {
    /// Single plain term, dispatched without evaluating the query.
    Uni,
    /// Query re-evaluated per event.
    Multi,
    /// Fires when an entity starts or stops matching.
    Monitor,
}

/// One `(event, id)` registration of an observer term.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Listener {
    pub observer: Entity,
    /// Event reported to the callback.
    pub report: Entity,
    /// Triggered by a `Not` term: the event is the inverse of the reported
    /// one.
    pub negated: bool,
    /// Relationship walked for up traversal.
    pub trav_rel: Entity,
}

pub(crate) struct Observer {
    pub entity: Entity,
    pub query: CompiledQuery,
    /// The query with `Not` terms made optional.
    pub not_query: Option<CompiledQuery>,
    pub events: SmallVec<[Entity; 2]>,
    pub kind: ObserverKind,
    pub callback: Option<Callback>,
    pub run: Option<Callback>,
    /// Stamp of the last event this observer fired for.
    pub last_event_id: AtomicU64,
    /// Registrations, for removal.
    pub keys: Vec<(Bucket, Entity, Id)>,
}

impl Observer {
    /// Record that the observer fires for event `stamp`. Returns `false` if
    /// it already did.
    pub(crate) fn claim(&self, stamp: u64) -> bool {
        self.last_event_id.swap(stamp, Ordering::Relaxed) != stamp
    }
}

impl std::fmt::Debug for Observer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observer")
            .field("entity", &self.entity)
            .field("events", &self.events)
            .field("kind", &self.kind)
            .field("terms", &self.query.terms())
            .finish_non_exhaustive()
    }
}

/// All observers of a world, indexed for dispatch.
#[derive(Default)]
pub(crate) struct ObserverRegistry {
    observers: FxHashMap<Entity, Observer>,
    buckets: [FxHashMap<(Entity, Id), SmallVec<[Listener; 2]>>; 3],
}

impl ObserverRegistry {
    pub(crate) fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.observers.len()
    }

    pub(crate) fn get(&self, observer: Entity) -> Option<&Observer> {
        self.observers.get(&observer)
    }

    pub(crate) fn listeners(&self, bucket: Bucket, event: Entity, id: Id) -> &[Listener] {
        self.buckets[bucket as usize]
            .get(&(event, id))
            .map(|list| list.as_slice())
            .unwrap_or(&[])
    }

    fn insert(&mut self, observer: Observer, listeners: Vec<(Bucket, Entity, Id, Listener)>) {
        for (bucket, event, id, listener) in listeners {
            self.buckets[bucket as usize]
                .entry((event, id))
                .or_default()
                .push(listener);
        }
        self.observers.insert(observer.entity, observer);
    }

    fn remove(&mut self, entity: Entity) -> Option<Observer> {
        let observer = self.observers.remove(&entity)?;
        for &(bucket, event, id) in &observer.keys {
            let map = &mut self.buckets[bucket as usize];
            if let Some(list) = map.get_mut(&(event, id)) {
                list.retain(|l| l.observer != entity);
                if list.is_empty() {
                    map.remove(&(event, id));
                }
            }
        }
        Some(observer)
    }
}

impl std::fmt::Debug for ObserverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverRegistry")
            .field("observers", &self.observers.len())
            .finish_non_exhaustive()
    }
}

impl World {
    /// Remove an observer by deleting its entity.
    ///
    /// Returns `false` if `observer` is not an observer.
    #[track_caller]
    pub fn unregister_observer(&mut self, observer: Entity) -> bool {
        if self.observers.get(observer).is_none() {
            return false;
        }
        self.delete(observer)
    }

    /// Number of registered observers.
    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Whether `observer` is a registered observer.
    #[must_use]
    pub fn is_observer(&self, observer: Entity) -> bool {
        self.observers.get(observer).is_some()
    }

    /// Deliver a custom event for `id` on `entity` to matching observers.
    #[track_caller]
    pub fn emit(&mut self, event: Entity, id: impl IntoId, entity: Entity) -> bool {
        let Some(id) = self.resolve_id(id) else {
            return false;
        };
        let Some(loc) = self.entities.location(entity) else {
            crate::error::report(&crate::error::EcsError::DeadEntity(entity));
            return false;
        };
        self.defer_begin();
        self.notify(event, &[id], entity, loc.table, loc.row, loc.table);
        self.defer_end();
        true
    }

    /// Drop the dispatch entries of a deleted observer entity.
    pub(crate) fn remove_observer_now(&mut self, entity: Entity) {
        let Some(observer) = self.observers.remove(entity) else {
            return;
        };
        for &(_, _, id) in &observer.keys {
            self.records.remove_observer(id);
        }
        tracing::debug!(observer = ?entity, "unregistered observer");
    }

    pub(crate) fn next_event_id(&self) -> u64 {
        self.event_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Events whose listeners are inverted for `Not` terms.
pub(crate) fn inverse_event(event: Entity) -> Option<Entity> {
    match event {
        e if e == builtins::ON_ADD => Some(builtins::ON_REMOVE),
        e if e == builtins::ON_REMOVE => Some(builtins::ON_ADD),
        _ => None,
    }
}
