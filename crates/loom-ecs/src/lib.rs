// Column storage and staged values work on type-erased pointers
#![allow(unsafe_code)]
#![allow(missing_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_safety_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::ptr_as_ptr)]
#![allow(clippy::ref_as_ptr)]
#![allow(clippy::cast_ptr_alignment)]

//! Loom ECS - table-based Entity Component System with relationships
//!
//! # Key Concepts
//!
//! - **Entity**: A 64-bit handle with a recycled index and a generation
//! - **Id**: What an entity can have: a component, a tag or a pair
//!   `(Relationship, Target)`
//! - **Table**: Storage for all entities with the same set of ids
//! - **Query**: A list of terms matched against tables, with variables,
//!   traversal and `Or`/`Not`/`Optional` operators
//! - **Observer**: A callback fired when entities gain, lose or set ids
//!
//! Relationship behavior (exclusive, transitive, symmetric, cleanup on
//! delete) is configured by adding builtin trait tags to the relationship
//! entity:
//!
//! ```ignore
//! let mut world = World::new();
//! let located_in = world.create();
//! world.add(located_in, builtins::TRANSITIVE);
//!
//! let earth = world.create();
//! let us = world.create();
//! world.add_pair(us, located_in, earth);
//! ```
//!
//! # Deferred mode
//!
//! Query runs and observer callbacks see the world read-only and queue
//! mutations on a stage. Queued commands are folded per entity and applied
//! when the outermost deferred region ends. Parallel passes
//! ([`CompiledQuery::par_run`]) give each thread its own stage and merge
//! them in stage order.

pub mod builtins;
mod component;
mod component_index;
mod config;
mod entity;
mod error;
mod id;
mod observer;
mod parallel;
mod query;
mod stage;
mod storage;
mod table;
mod table_graph;
mod world;

pub use component::{Component, LifecycleHook, TypeHooks, TypeInfo};
pub use component_index::{CleanupAction, ComponentRecord, IdFlags, TableRecord};
pub use config::{PolicyMode, WorldConfig};
pub use entity::{Entity, EntityId, EntityLocation, Generation};
pub use error::{EcsError, EcsResult};
pub use id::{Id, IntoId};
pub use observer::{Callback, ObserverBuilder};
pub use query::{
    CompiledQuery, Field, FieldMut, InOut, Iter, Oper, QueryBuilder, QueryIter, Term, TermBuilder,
    TermRef, Traversal,
};
pub use stage::{Commands, Stage};
pub use table::{Table, TableId, Type};
pub use world::World;

pub(crate) type FxHashMap<K, V> = hashbrown::HashMap<K, V, rustc_hash::FxBuildHasher>;
pub(crate) type FxHashSet<T> = hashbrown::HashSet<T, rustc_hash::FxBuildHasher>;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        Commands, CompiledQuery, Component, EcsError, EcsResult, Entity, Id, IntoId, Iter, Oper,
        TermBuilder, World, builtins,
    };
}
