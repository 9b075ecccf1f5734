//! Observer construction.

use std::sync::atomic::AtomicU64;

use smallvec::{SmallVec, smallvec};

use crate::{
    World, builtins,
    component::Component,
    entity::{Entity, EntityFlags},
    error::{EcsError, EcsResult, report},
    id::Id,
    observer::{Bucket, Callback, Listener, Observer, ObserverKind, inverse_event},
    query::{
        CompiledQuery, Iter, Oper, Term, TermBuilder, THIS_VAR, Traversal,
        compile::{QueryTerm, Ref},
        engine::from_list_ids,
    },
};

/// Builder for observers.
///
/// ```ignore
/// let observer = world
///     .observer()
///     .with::<Position>()
///     .with::<Velocity>()
///     .event(builtins::ON_ADD)
///     .each(|it| println!("{:?} gained motion", it.entities()))
///     .build()?;
/// ```
pub struct ObserverBuilder<'w> {
    world: &'w mut World,
    terms: Vec<Term>,
    events: SmallVec<[Entity; 2]>,
    callback: Option<Callback>,
    run: Option<Callback>,
    yield_existing: bool,
    monitor: bool,
    name: Option<String>,
    error: Option<EcsError>,
}

/// A planned `(bucket, event, id)` registration.
struct Registration {
    bucket: Bucket,
    event: Entity,
    id: Id,
    listener: Listener,
}

impl<'w> ObserverBuilder<'w> {
    pub(crate) fn new(world: &'w mut World) -> Self {
        Self {
            world,
            terms: Vec::new(),
            events: SmallVec::new(),
            callback: None,
            run: None,
            yield_existing: false,
            monitor: false,
            name: None,
            error: None,
        }
    }

    /// Listen for `event` (`OnAdd`, `OnRemove`, `OnSet` or a custom event).
    #[must_use]
    pub fn event(mut self, event: Entity) -> Self {
        if !self.events.contains(&event) {
            self.events.push(event);
        }
        self
    }

    /// Fire only when an entity starts (`OnAdd`) or stops (`OnRemove`)
    /// matching the query.
    #[must_use]
    pub fn monitor(mut self) -> Self {
        self.monitor = true;
        self
    }

    /// Invoke the observer for entities that already match when it is
    /// created.
    #[must_use]
    pub fn yield_existing(mut self) -> Self {
        self.yield_existing = true;
        self
    }

    /// Name the observer entity.
    #[must_use]
    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_owned());
        self
    }

    /// Callback invoked with every matched batch.
    #[must_use]
    pub fn each(mut self, f: impl Fn(&mut Iter<'_>) + Send + Sync + 'static) -> Self {
        self.callback = Some(Box::new(f));
        self
    }

    /// Hook invoked before the callback for every matched batch. An
    /// observer may have a run hook and no callback.
    #[must_use]
    pub fn run(mut self, f: impl Fn(&mut Iter<'_>) + Send + Sync + 'static) -> Self {
        self.run = Some(Box::new(f));
        self
    }

    /// Register the observer and return its entity.
    ///
    /// Nothing is registered when construction fails.
    #[track_caller]
    pub fn build(self) -> EcsResult<Entity> {
        let result = self.try_build();
        if let Err(error) = &result {
            report(error);
        }
        result
    }

    fn try_build(self) -> EcsResult<Entity> {
        let Self {
            world,
            terms,
            events,
            callback,
            run,
            yield_existing,
            monitor,
            name,
            error,
        } = self;

        if let Some(error) = error {
            return Err(error);
        }
        if callback.is_none() && run.is_none() {
            return Err(EcsError::InvalidOperation(
                "observer has neither a callback nor a run hook".to_owned(),
            ));
        }
        let events: SmallVec<[Entity; 2]> = if monitor {
            smallvec![builtins::ON_ADD, builtins::ON_REMOVE]
        } else {
            events
        };
        if events.is_empty() {
            return Err(EcsError::InvalidParameter("observer has no events".to_owned()));
        }
        if let Some(&dead) = events.iter().find(|e| !world.is_alive(**e)) {
            return Err(EcsError::DeadEntity(dead));
        }
        if let Some(name) = &name {
            if world.lookup(name).is_some() {
                return Err(EcsError::InvalidParameter(format!("name {name} is taken")));
            }
        }

        let query = CompiledQuery::compile(world, terms.clone())?;
        let not_query = if terms.iter().any(|t| t.oper == Oper::Not) {
            let relaxed = terms
                .into_iter()
                .map(|t| if t.oper == Oper::Not { t.oper(Oper::Optional) } else { t })
                .collect();
            Some(CompiledQuery::compile(world, relaxed)?)
        } else {
            None
        };
        let kind = if monitor {
            ObserverKind::Monitor
        } else if is_uni(&query) {
            ObserverKind::Uni
        } else {
            ObserverKind::Multi
        };

        let plan = plan_listeners(world, &query, &events);
        if plan.is_empty() {
            return Err(EcsError::InvalidParameter(
                "observer has no term on $this that can trigger it".to_owned(),
            ));
        }

        let entity = world.create();
        world.entities.add_flags(entity, EntityFlags::OBSERVER);
        if let Some(name) = &name {
            world.set_name(entity, name);
        }
        world.add(entity, builtins::OBSERVER);

        let mut keys = Vec::with_capacity(plan.len());
        let mut listeners = Vec::with_capacity(plan.len());
        for registration in plan {
            world.records.add_observer(registration.id, &world.types);
            keys.push((registration.bucket, registration.event, registration.id));
            listeners.push((
                registration.bucket,
                registration.event,
                registration.id,
                Listener {
                    observer: entity,
                    ..registration.listener
                },
            ));
        }
        tracing::debug!(observer = ?entity, ?kind, ?events, "registered observer");
        world.observers.insert(
            Observer {
                entity,
                query,
                not_query,
                events,
                kind,
                callback,
                run,
                last_event_id: AtomicU64::new(0),
                keys,
            },
            listeners,
        );

        if yield_existing {
            world.yield_existing(entity);
        }
        Ok(entity)
    }
}

/// A single plain term on `$this` can be dispatched without evaluating
/// the query.
fn is_uni(query: &CompiledQuery) -> bool {
    let [term] = query.terms.as_slice() else {
        return false;
    };
    let plain = |r: Ref| !matches!(r, Ref::Var(_));
    term.oper == Oper::And
        && term.src == Ref::Var(THIS_VAR)
        && plain(term.first)
        && term.second.is_none_or(plain)
        && !term.transitive
}

/// Dispatch key of a term: variables become wildcards.
fn term_key(term: &QueryTerm) -> Id {
    let index = |r: Ref| match r {
        Ref::Entity(e) => e.id(),
        _ => builtins::WILDCARD.id(),
    };
    let id = match term.second {
        Some(second) => Id::pair_from_indices(index(term.first), index(second)),
        None => Id::from_bits(u64::from(index(term.first))),
    };
    Id::from_bits(id.to_bits() | term.id_flags)
}

fn plan_listeners(world: &World, query: &CompiledQuery, events: &[Entity]) -> Vec<Registration> {
    let mut plan = Vec::new();
    for term in &query.terms {
        if term.src != Ref::Var(THIS_VAR) || term.oper == Oper::Optional {
            continue;
        }
        let bucket = match term.trav {
            Traversal::SelfOnly => Bucket::SelfOnly,
            Traversal::Up => Bucket::Up,
            Traversal::SelfUp | Traversal::Cascade => Bucket::SelfUp,
        };
        let (ids, negated): (SmallVec<[Id; 4]>, bool) = match (term.oper, term.first) {
            (oper, Ref::Entity(list)) if oper.is_from() => {
                let ids = world
                    .type_of(list)
                    .map(|ty| from_list_ids(world, ty).collect())
                    .unwrap_or_default();
                (ids, oper == Oper::NotFrom)
            }
            (Oper::Not, _) => (smallvec![term_key(term)], true),
            _ => (smallvec![term_key(term)], false),
        };
        for &event in events {
            let listen = if negated {
                match inverse_event(event) {
                    Some(inverse) => inverse,
                    None => continue,
                }
            } else {
                event
            };
            for &id in &ids {
                plan.push(Registration {
                    bucket,
                    event: listen,
                    id,
                    listener: Listener {
                        observer: Entity::NULL,
                        report: event,
                        negated,
                        trav_rel: term.trav_rel,
                    },
                });
            }
        }
    }
    plan
}

impl TermBuilder for ObserverBuilder<'_> {
    fn terms_mut(&mut self) -> &mut Vec<Term> {
        &mut self.terms
    }

    fn component_entity<T: Component>(&mut self) -> Option<Entity> {
        Some(self.world.component::<T>())
    }

    fn alive_at(&self, index: u32) -> Option<Entity> {
        self.world.entities.get_alive(index)
    }

    fn set_error(&mut self, error: EcsError) {
        self.error.get_or_insert(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default, Clone)]
    struct Position;

    #[test]
    fn test_observer_without_callback_fails() {
        let mut world = World::new();
        let result = world
            .observer()
            .with::<Position>()
            .event(builtins::ON_ADD)
            .build();
        assert!(matches!(result, Err(EcsError::InvalidOperation(_))));
        assert_eq!(world.observer_count(), 0);
    }

    #[test]
    fn test_failed_build_registers_nothing() {
        let mut world = World::new();
        let before = world.entity_count();
        let result = world
            .observer()
            .event(builtins::ON_ADD)
            .each(|_| {})
            .build();
        assert!(matches!(result, Err(EcsError::EmptyQuery)));
        assert_eq!(world.entity_count(), before);
    }

    #[test]
    fn test_single_term_is_uni() {
        let mut world = World::new();
        let observer = world
            .observer()
            .with::<Position>()
            .event(builtins::ON_ADD)
            .each(|_| {})
            .build();
        let kind = observer
            .ok()
            .and_then(|o| world.observers.get(o))
            .map(|o| o.kind);
        assert_eq!(kind, Some(ObserverKind::Uni));
    }

    #[test]
    fn test_not_term_listens_on_inverse_event() {
        let mut world = World::new();
        let frozen = world.create();
        let observer = world
            .observer()
            .with::<Position>()
            .without_id(Id::of(frozen))
            .event(builtins::ON_ADD)
            .each(|_| {})
            .build();
        let keys = observer
            .ok()
            .and_then(|o| world.observers.get(o))
            .map(|o| o.keys.clone())
            .unwrap_or_default();
        assert!(keys.contains(&(Bucket::SelfOnly, builtins::ON_REMOVE, Id::of(frozen))));
    }
}
