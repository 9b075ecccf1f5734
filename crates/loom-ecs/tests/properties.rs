//! Integration tests for world bookkeeping and deferred mutation

use loom_ecs::{IdFlags, PolicyMode, WorldConfig, prelude::*};

// ============================================================================
// Test Components
// ============================================================================

#[derive(Default, Clone, Debug, PartialEq)]
struct Position {
    x: f32,
    y: f32,
}

#[derive(Default, Clone, Debug, PartialEq)]
struct Health(u32);

fn table_of(world: &World, entity: Entity) -> Option<loom_ecs::TableId> {
    world.location(entity).map(|loc| loc.table)
}

// ============================================================================
// Tables
// ============================================================================

#[test]
fn test_same_type_shares_table() {
    let mut world = World::new();
    let a = world.create();
    let b = world.create();

    let e1 = world.create();
    world.add(e1, a);
    world.add(e1, b);

    let e2 = world.create();
    world.add(e2, b);
    world.set(e2, Health(1));
    world.add(e2, a);
    let health = world.component::<Health>();
    world.remove(e2, health);

    assert!(table_of(&world, e1).is_some());
    assert_eq!(table_of(&world, e1), table_of(&world, e2));
}

#[test]
fn test_add_remove_returns_to_original_table() {
    let mut world = World::new();
    let tag = world.create();
    let extra = world.create();
    let e = world.create();
    world.add(e, tag);
    let before = table_of(&world, e);

    world.add(e, extra);
    assert_ne!(table_of(&world, e), before);
    world.remove(e, extra);

    assert!(!world.has(e, extra));
    assert_eq!(table_of(&world, e), before);
}

#[test]
fn test_swap_remove_keeps_values() {
    let mut world = World::new();
    let entities: Vec<Entity> = (0..5u32).map(|i| world.create_with(Health(i))).collect();
    let table = table_of(&world, entities[0]);

    world.delete(entities[1]);

    let len = table.and_then(|t| world.table(t)).map(loom_ecs::Table::len);
    assert_eq!(len, Some(4));
    for (i, &e) in entities.iter().enumerate().filter(|(i, _)| *i != 1) {
        assert_eq!(world.get::<Health>(e), Some(Health(i as u32)));
    }
}

#[test]
fn test_stale_handle_not_alive_after_recycle() {
    let mut world = World::new();
    let e = world.create();
    world.delete(e);
    let recycled = world.create();

    assert_eq!(recycled.id(), e.id());
    assert!(!world.is_alive(e));
    assert!(world.is_alive(recycled));
    assert_ne!(e, recycled);
    assert_ne!(e.to_bits(), recycled.to_bits());
}

#[test]
fn test_stale_handle_rejected_as_id() {
    let mut world = World::new();
    let e = world.create();
    let c = world.create();
    world.delete(c);
    let c2 = world.create();
    assert_eq!(c2.id(), c.id());

    assert!(!world.add(e, c));
    assert!(!world.has(e, c));
    assert!(!world.has(e, c2));

    let likes = world.create();
    let bob = world.create();
    world.delete(bob);
    let alice = world.create();
    assert_eq!(alice.id(), bob.id());

    assert!(!world.add_pair(e, likes, bob));
    assert!(!world.has(e, Id::pair(likes, alice)));

    world.deferred(|w| {
        w.commands().add(e, c).add_pair(e, likes, bob);
    });
    assert!(world.type_of(e).is_some_and(|ty| ty.is_empty()));
}

#[test]
fn test_operations_on_dead_entity_fail() {
    let mut world = World::new();
    let tag = world.create();
    let e = world.create();
    world.delete(e);

    assert!(!world.add(e, tag));
    assert!(!world.set(e, Health(3)));
    assert!(!world.has(e, tag));
    assert_eq!(world.get::<Health>(e), None);
}

// ============================================================================
// Cleanup
// ============================================================================

#[test]
fn test_deleting_component_removes_it_by_default() {
    let mut world = World::new();
    let c = world.create();
    let e = world.create();
    world.add(e, c);

    world.delete(c);

    assert!(world.is_alive(e));
    assert!(world.type_of(e).is_some_and(|ty| ty.is_empty()));
}

#[test]
fn test_on_delete_delete_cascades() {
    let mut world = World::new();
    let c = world.create();
    world.add_pair(c, builtins::ON_DELETE, builtins::DELETE);
    let e = world.create();
    world.add(e, c);

    world.delete(c);

    assert!(!world.is_alive(e));
}

#[test]
fn test_clear_keeps_entity_alive() {
    let mut world = World::new();
    let e = world.create_with(Position { x: 1.0, y: 2.0 });
    world.set(e, Health(9));

    assert!(world.clear(e));

    assert!(world.is_alive(e));
    assert_eq!(world.get::<Position>(e), None);
    assert!(world.type_of(e).is_some_and(|ty| ty.is_empty()));
}

// ============================================================================
// Deferred mutation
// ============================================================================

#[test]
fn test_staged_value_visible_before_merge() {
    let mut world = World::new();
    world.component::<Position>();
    let e = world.create();

    world.defer_begin();
    world.set(e, Position { x: 1.0, y: 2.0 });
    assert_eq!(world.get::<Position>(e), Some(Position { x: 1.0, y: 2.0 }));
    assert!(world.has(e, world.component_id::<Position>().unwrap_or(Entity::NULL)));
    world.defer_end();

    assert_eq!(world.get::<Position>(e), Some(Position { x: 1.0, y: 2.0 }));
    let position = world.component_id::<Position>().unwrap_or(Entity::NULL);
    let in_table = table_of(&world, e)
        .and_then(|t| world.table(t))
        .is_some_and(|t| t.ty().contains(Id::of(position)));
    assert!(in_table);
}

#[test]
fn test_nested_defer_flushes_once() {
    let mut world = World::new();
    let tag = world.create();
    let e = world.create();

    assert!(world.defer_begin());
    assert!(!world.defer_begin());
    world.add(e, tag);
    assert!(!world.defer_end());
    assert!(!world.owns(e, tag));
    assert!(world.defer_end());
    assert!(world.owns(e, tag));
}

#[test]
fn test_deferred_wildcard_remove_visible_before_merge() {
    let mut world = World::new();
    let likes = world.create();
    let (alice, bob) = (world.create(), world.create());
    let e = world.create();
    world.add_pair(e, likes, alice);
    world.add_pair(e, likes, bob);

    world.defer_begin();
    world.remove(e, Id::pair(likes, builtins::WILDCARD));
    assert!(!world.has(e, Id::pair(likes, alice)));
    assert!(!world.has(e, Id::pair(likes, builtins::WILDCARD)));
    world.defer_end();

    assert!(!world.owns(e, Id::pair(likes, bob)));
}

#[test]
fn test_commands_from_query_run_applied_after() {
    let mut world = World::new();
    let marked = world.create();
    for i in 0..4 {
        world.create_with(Health(i));
    }
    let Ok(query) = world.query().with::<Health>().build() else {
        panic!("query failed to build");
    };

    query.run(&mut world, |it| {
        for &e in it.entities() {
            it.commands().add(e, marked);
        }
    });

    let holders = world.query().with_ref(marked).build().map(|q| q.count(&world));
    assert_eq!(holders, Ok(4));
}

// ============================================================================
// Relationships
// ============================================================================

#[test]
fn test_exclusive_childof_moves_entity() {
    let mut world = World::new();
    let a = world.create();
    let b = world.create();
    let child = world.create();
    world.add_pair(child, builtins::CHILD_OF, a);
    world.add_pair(child, builtins::CHILD_OF, b);

    assert_eq!(world.parent(child), Some(b));
    assert_eq!(world.children(a), Vec::<Entity>::new());
    assert_eq!(world.children(b), vec![child]);
}

#[test]
fn test_symmetric_relationship() {
    let mut world = World::new();
    let married_to = world.create();
    world.add(married_to, builtins::SYMMETRIC);
    let alice = world.create();
    let bob = world.create();

    world.add_pair(alice, married_to, bob);

    assert!(world.has(bob, Id::pair(married_to, alice)));
}

#[test]
fn test_isa_shares_and_overrides() {
    let mut world = World::new();
    let base = world.create_with(Health(100));
    let instance = world.create();
    world.add_pair(instance, builtins::IS_A, base);

    let health = world.component::<Health>();
    assert_eq!(world.get::<Health>(instance), Some(Health(100)));
    assert!(world.has(instance, health));
    assert!(!world.owns(instance, health));

    world.set(instance, Health(50));
    assert_eq!(world.get::<Health>(instance), Some(Health(50)));
    assert_eq!(world.get::<Health>(base), Some(Health(100)));
}

#[test]
fn test_recover_policy_downgrades_trait_change() {
    let mut world = World::with_config(WorldConfig::new().policy(PolicyMode::Recover));
    let rel = world.create();
    let (a, b) = (world.create(), world.create());
    world.add_pair(a, rel, b);

    assert!(!world.add(rel, builtins::EXCLUSIVE));
    assert!(!world.id_flags(rel).contains(IdFlags::EXCLUSIVE));
}
