//! Queries: term construction, compilation and evaluation.
//!
//! A query is a list of [`Term`]s built with [`QueryBuilder`] and compiled
//! into a [`CompiledQuery`]. Compiled queries are evaluated lazily by
//! [`QueryIter`], which yields one [`Iter`] batch per matched table range
//! (or per result for queries that do not match on `$this`).
//!
//! ```ignore
//! let query = world.query().with::<Position>().with::<Velocity>().build()?;
//! query.run(&mut world, |it| {
//!     let vel = it.field::<Velocity>(1).unwrap();
//!     let mut pos = it.field_mut::<Position>(0).unwrap();
//!     for (p, v) in pos.iter_mut().zip(vel.iter()) {
//!         p.x += v.x;
//!     }
//! });
//! ```

mod builder;
pub(crate) mod compile;
pub(crate) mod engine;
mod iter;
mod term;

pub use builder::{QueryBuilder, TermBuilder};
pub use compile::CompiledQuery;
pub(crate) use compile::THIS_VAR;
pub(crate) use iter::DetachedBatch;
pub use iter::{Field, FieldMut, Iter, QueryIter};
pub use term::{InOut, Oper, Term, TermRef, Traversal};

use crate::{
    World,
    entity::Entity,
    query::engine::{Binding, Engine},
    table::TableId,
};

impl CompiledQuery {
    /// Lazily iterate the match batches. Field data is read-only.
    pub fn iter<'a>(&'a self, world: &'a World) -> QueryIter<'a> {
        QueryIter::new(world, self)
    }

    /// Run `f` for every batch with write access to self fields.
    ///
    /// The world is deferred for the duration of the run; commands issued
    /// through [`Iter::commands`] are applied when it returns.
    pub fn run(&self, world: &mut World, mut f: impl FnMut(&mut Iter<'_>)) {
        world.defer_begin();
        {
            let world: &World = world;
            let mut batches = QueryIter::new(world, self);
            batches.set_writable(true);
            for mut it in batches {
                f(&mut it);
            }
        }
        world.defer_end();
    }

    /// Number of matched rows; results without `$this` rows count once.
    #[must_use]
    pub fn count(&self, world: &World) -> usize {
        self.iter(world)
            .map(|it| if it.table().is_some() { it.count() } else { 1 })
            .sum()
    }

    /// Matched `$this` entities, in iteration order.
    #[must_use]
    pub fn entities(&self, world: &World) -> Vec<Entity> {
        self.iter(world).flat_map(|it| it.entities().iter().copied()).collect()
    }

    /// Whether `entity` currently matches.
    #[must_use]
    pub fn is_match(&self, world: &World, entity: Entity) -> bool {
        world
            .entities
            .location(entity)
            .is_some_and(|loc| self.match_in(world, loc.table, loc.row, entity).is_some())
    }

    /// Evaluate the query for one entity as if it were stored at `row` of
    /// `table`. The returned engine holds the first result.
    pub(crate) fn match_in(
        &self,
        world: &World,
        table: TableId,
        row: usize,
        entity: Entity,
    ) -> Option<Engine> {
        let mut engine = Engine::new(self);
        let binding = if self.this_entity_mode {
            Binding::Entity(entity)
        } else {
            Binding::Table {
                table,
                offset: row,
                count: 1,
                entity,
            }
        };
        engine.bind(usize::from(THIS_VAR), binding);
        engine.next(world, self).then_some(engine)
    }
}
