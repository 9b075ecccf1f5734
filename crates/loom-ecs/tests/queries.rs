//! Integration tests for query evaluation and observers

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use loom_ecs::{EcsError, TermRef, prelude::*};

#[derive(Default, Clone, Debug, PartialEq)]
struct Position(i32);

#[derive(Default, Clone, Debug, PartialEq)]
struct Velocity(i32);

fn pairs(world: &World, query: &CompiledQuery) -> Vec<(Entity, Entity)> {
    query
        .iter(world)
        .filter_map(|it| Some((it.var("X")?, it.var("Y")?)))
        .collect()
}

// ============================================================================
// Transitive relationships
// ============================================================================

#[test]
fn test_self_referential_transitive_term_needs_reflexive() {
    let mut world = World::new();
    let located_in = world.create();
    world.add(located_in, builtins::TRANSITIVE);

    let result = world
        .query()
        .with_pair(located_in, TermRef::var("X"))
        .src(TermRef::var("X"))
        .build();
    assert!(matches!(result, Err(EcsError::InvalidTerm { .. })));

    world.add(located_in, builtins::REFLEXIVE);
    let earth = world.create();
    let us = world.create();
    world.add_pair(us, located_in, earth);

    let Ok(query) = world
        .query()
        .with_pair(located_in, TermRef::var("X"))
        .src(TermRef::var("X"))
        .build()
    else {
        panic!("reflexive query failed to build");
    };
    let bound: Vec<Entity> = query.iter(&world).filter_map(|it| it.var("X")).collect();
    assert_eq!(bound, vec![us, earth]);
}

#[test]
fn test_transitive_chain_expansion() {
    let mut world = World::new();
    let located_in = world.create();
    world.add(located_in, builtins::TRANSITIVE);
    world.add(located_in, builtins::REFLEXIVE);
    world.add(located_in, builtins::FINAL);

    let earth = world.create();
    let us = world.create();
    let sf = world.create();
    world.add_pair(us, located_in, earth);
    world.add_pair(sf, located_in, us);

    let Ok(query) = world
        .query()
        .with_pair(located_in, TermRef::var("Y"))
        .src(TermRef::var("X"))
        .build()
    else {
        panic!("query failed to build");
    };
    assert_eq!(
        pairs(&world, &query),
        vec![(us, us), (us, earth), (sf, sf), (sf, us), (sf, earth)]
    );
}

#[test]
fn test_transitive_closure_from_fixed_source() {
    let mut world = World::new();
    let located_in = world.create();
    world.add(located_in, builtins::TRANSITIVE);
    let earth = world.create();
    let us = world.create();
    let sf = world.create();
    world.add_pair(us, located_in, earth);
    world.add_pair(sf, located_in, us);

    let Ok(query) = world
        .query()
        .with_pair(located_in, TermRef::var("Y"))
        .src(sf)
        .build()
    else {
        panic!("query failed to build");
    };
    let targets: Vec<Entity> = query.iter(&world).filter_map(|it| it.var("Y")).collect();
    assert_eq!(targets, vec![us, earth]);
}

// ============================================================================
// Operators
// ============================================================================

#[test]
fn test_not_and_optional_terms() {
    let mut world = World::new();
    let frozen = world.create();
    let moving = world.create_with(Position(1));
    world.set(moving, Velocity(2));
    let still = world.create_with(Position(3));
    let stuck = world.create_with(Position(4));
    world.add(stuck, frozen);

    let Ok(query) = world
        .query()
        .with::<Position>()
        .optional::<Velocity>()
        .without_id(Id::of(frozen))
        .build()
    else {
        panic!("query failed to build");
    };

    let mut seen = Vec::new();
    for it in query.iter(&world) {
        let has_velocity = it.is_set(1);
        seen.extend(it.entities().iter().map(|&e| (e, has_velocity)));
    }
    seen.sort_by_key(|(e, _)| e.to_bits());
    assert_eq!(seen, vec![(moving, true), (still, false)]);
}

#[test]
fn test_or_group_matches_either() {
    let mut world = World::new();
    let red = world.create();
    let blue = world.create();
    let a = world.create();
    world.add(a, red);
    let b = world.create();
    world.add(b, blue);
    let c = world.create();
    world.add(c, red);
    world.add(c, blue);
    world.create();

    let Ok(query) = world.query().with_ref(red).or().with_ref(blue).or().build() else {
        panic!("query failed to build");
    };
    let mut matched = query.entities(&world);
    matched.sort_by_key(|e| e.to_bits());
    assert_eq!(matched, vec![a, b, c]);
}

#[test]
fn test_disabled_toggle_hides_rows() {
    let mut world = World::new();
    let position = world.component::<Position>();
    let entities: Vec<Entity> = (0..3).map(|i| world.create_with(Position(i))).collect();
    for &e in &entities {
        world.enable(e, position);
    }
    world.disable(entities[1], position);

    let Ok(query) = world.query().with::<Position>().build() else {
        panic!("query failed to build");
    };
    assert_eq!(query.count(&world), 2);
    assert!(!world.is_enabled(entities[1], position));
    assert!(!query.is_match(&world, entities[1]));
}

#[test]
fn test_prefab_and_disabled_entities_skipped() {
    let mut world = World::new();
    let visible = world.create_with(Position(0));
    let prefab = world.create_with(Position(1));
    world.add(prefab, builtins::PREFAB);
    let disabled = world.create_with(Position(2));
    world.add(disabled, builtins::DISABLED);

    let Ok(query) = world.query().with::<Position>().build() else {
        panic!("query failed to build");
    };
    assert_eq!(query.entities(&world), vec![visible]);
}

// ============================================================================
// Traversal
// ============================================================================

#[test]
fn test_up_traversal_reads_parent_value() {
    let mut world = World::new();
    let parent = world.create_with(Position(7));
    let child = world.create();
    world.add_pair(child, builtins::CHILD_OF, parent);

    let Ok(query) = world
        .query()
        .with::<Position>()
        .up(builtins::CHILD_OF)
        .build()
    else {
        panic!("query failed to build");
    };
    let mut results = Vec::new();
    for it in query.iter(&world) {
        let value = it.field::<Position>(0).and_then(|f| f.get(0).cloned());
        results.push((it.entities().to_vec(), it.field_src(0), value));
    }
    assert_eq!(results, vec![(vec![child], parent, Some(Position(7)))]);
}

#[test]
fn test_cascade_orders_by_depth() {
    let mut world = World::new();
    let tag = world.create();
    let root = world.create();
    let mid = world.create();
    let leaf = world.create();

    world.add(leaf, tag);
    world.add_pair(leaf, builtins::CHILD_OF, mid);
    world.add(mid, tag);
    world.add_pair(mid, builtins::CHILD_OF, root);
    world.add(root, tag);

    let Ok(query) = world.query().with_ref(tag).cascade().build() else {
        panic!("query failed to build");
    };
    assert_eq!(query.entities(&world), vec![root, mid, leaf]);
}

#[test]
fn test_abandoned_iterator_releases_tables() {
    let mut world = World::new();
    let e = world.create_with(Position(1));
    let Ok(query) = world.query().with::<Position>().build() else {
        panic!("query failed to build");
    };
    let mut iter = query.iter(&world);
    assert!(iter.next().is_some());
    iter.finish();

    let tag = world.create();
    assert!(world.add(e, tag));
}

// ============================================================================
// Observers
// ============================================================================

#[test]
fn test_multi_term_observer_fires_once_per_event() {
    let mut world = World::new();
    world.component::<Position>();
    world.component::<Velocity>();
    let count = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&count);
    let observer = world
        .observer()
        .with::<Position>()
        .with::<Velocity>()
        .event(builtins::ON_ADD)
        .each(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        })
        .build();
    assert!(observer.is_ok());

    let e = world.create();
    world.deferred(|w| {
        w.set(e, Position(0));
        w.set(e, Velocity(0));
    });
    assert_eq!(count.load(Ordering::Relaxed), 1);
}

#[test]
fn test_observer_commands_applied() {
    let mut world = World::new();
    let seen = world.create();
    world
        .observer()
        .with::<Position>()
        .event(builtins::ON_SET)
        .each(move |it| {
            for &e in it.entities() {
                it.commands().add(e, seen);
            }
        })
        .build()
        .ok();

    let e = world.create_with(Position(5));
    assert!(world.owns(e, seen));
}
