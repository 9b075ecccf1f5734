//! Runtime query builders.
//!
//! Terms are appended with method chaining; modifiers such as [`TermBuilder::src`]
//! or [`TermBuilder::up`] apply to the most recently added term.

use crate::{
    World, builtins,
    component::Component,
    entity::Entity,
    error::{EcsError, EcsResult, report},
    id::Id,
    query::{
        CompiledQuery,
        term::{InOut, Oper, Term, TermRef},
    },
};

// ============================================================================
// TermBuilder - shared by query and observer builders
// ============================================================================

/// Term list construction shared by [`QueryBuilder`] and
/// [`crate::ObserverBuilder`].
pub trait TermBuilder: Sized {
    /// The terms added so far.
    fn terms_mut(&mut self) -> &mut Vec<Term>;

    /// Component entity for a Rust type, if it can be resolved.
    fn component_entity<T: Component>(&mut self) -> Option<Entity>;

    /// Entity currently alive at `index`.
    fn alive_at(&self, index: u32) -> Option<Entity>;

    /// Remember the first construction error; `build` returns it.
    fn set_error(&mut self, error: EcsError);

    /// Append a fully described term.
    #[must_use]
    fn term(mut self, term: Term) -> Self {
        self.terms_mut().push(term);
        self
    }

    /// Require component `T` and fetch its data.
    #[must_use]
    fn with<T: Component>(mut self) -> Self {
        match self.component_entity::<T>() {
            Some(component) => self.term(Term::new(component)),
            None => {
                self.set_error(unregistered::<T>());
                self
            }
        }
    }

    /// Require an id. Pair halves and wildcards are resolved to term refs.
    #[must_use]
    fn with_id(mut self, id: Id) -> Self {
        match self.term_for_id(id) {
            Some(term) => self.term(term),
            None => {
                self.set_error(EcsError::InvalidId(id));
                self
            }
        }
    }

    /// Require a plain id given as an entity or variable.
    #[must_use]
    fn with_ref(self, first: impl Into<TermRef>) -> Self {
        self.term(Term::new(first))
    }

    /// Require a pair; either half may be an entity, variable or wildcard.
    #[must_use]
    fn with_pair(self, first: impl Into<TermRef>, second: impl Into<TermRef>) -> Self {
        self.term(Term::pair(first, second))
    }

    /// Fetch `T` if present, never excluding entities.
    #[must_use]
    fn optional<T: Component>(self) -> Self {
        self.with::<T>().oper(Oper::Optional)
    }

    /// Require `T` without fetching its data.
    #[must_use]
    fn filter<T: Component>(self) -> Self {
        self.with::<T>().inout(InOut::Filter)
    }

    /// Exclude entities that have `T`.
    #[must_use]
    fn without<T: Component>(self) -> Self {
        self.with::<T>().oper(Oper::Not)
    }

    /// Exclude entities that have `id`.
    #[must_use]
    fn without_id(self, id: Id) -> Self {
        self.with_id(id).oper(Oper::Not)
    }

    /// The entity must have every id of `list`'s type.
    #[must_use]
    fn and_from(self, list: Entity) -> Self {
        self.with_ref(list).oper(Oper::AndFrom)
    }

    /// The entity must have at least one id of `list`'s type.
    #[must_use]
    fn or_from(self, list: Entity) -> Self {
        self.with_ref(list).oper(Oper::OrFrom)
    }

    /// The entity must have none of the ids of `list`'s type.
    #[must_use]
    fn not_from(self, list: Entity) -> Self {
        self.with_ref(list).oper(Oper::NotFrom)
    }

    /// Set the operator of the last term.
    #[must_use]
    fn oper(self, oper: Oper) -> Self {
        self.modify(|term| term.oper(oper))
    }

    /// Make the last term part of an Or group with its Or neighbors.
    #[must_use]
    fn or(self) -> Self {
        self.oper(Oper::Or)
    }

    /// Negate the last term.
    #[must_use]
    fn not(self) -> Self {
        self.oper(Oper::Not)
    }

    /// Set the source of the last term.
    #[must_use]
    fn src(self, src: impl Into<TermRef>) -> Self {
        let src = src.into();
        self.modify(|term| term.src(src))
    }

    /// Set the data access of the last term.
    #[must_use]
    fn inout(self, inout: InOut) -> Self {
        self.modify(|term| term.inout(inout))
    }

    /// Match the last term on ancestors through `rel` only.
    #[must_use]
    fn up(self, rel: Entity) -> Self {
        self.modify(|term| term.up(rel))
    }

    /// Match the last term on the source, then on ancestors through `rel`.
    #[must_use]
    fn self_up(self, rel: Entity) -> Self {
        self.modify(|term| term.self_up(rel))
    }

    /// Self|up through `ChildOf`, yielding parents before children.
    #[must_use]
    fn cascade(self) -> Self {
        self.modify(|term| term.cascade(builtins::CHILD_OF))
    }

    #[doc(hidden)]
    fn modify(mut self, f: impl FnOnce(Term) -> Term) -> Self {
        match self.terms_mut().pop() {
            Some(term) => self.terms_mut().push(f(term)),
            None => self.set_error(EcsError::InvalidParameter(
                "term modifier used before any term was added".to_owned(),
            )),
        }
        self
    }

    #[doc(hidden)]
    fn term_for_id(&self, id: Id) -> Option<Term> {
        let half = |index: u32| -> Option<TermRef> {
            match index {
                i if i == builtins::WILDCARD.id() => Some(TermRef::Wildcard),
                i if i == builtins::ANY.id() => Some(TermRef::Any),
                i => self.alive_at(i).map(TermRef::from),
            }
        };
        let term = if id.is_pair() {
            Term::pair(half(id.first())?, half(id.second())?)
        } else {
            Term::new(half(id.first())?)
        };
        Some(term.id_flags(id.flags()))
    }
}

fn unregistered<T>() -> EcsError {
    EcsError::InvalidParameter(format!(
        "component {} is not registered",
        std::any::type_name::<T>()
    ))
}

// ============================================================================
// QueryBuilder
// ============================================================================

/// Builder for [`CompiledQuery`].
///
/// Typed terms require the component to be registered already (see
/// [`World::component`]).
///
/// ```ignore
/// let query = world.query()
///     .with::<Position>()
///     .with::<Velocity>()
///     .without::<Frozen>()
///     .build()?;
/// ```
pub struct QueryBuilder<'w> {
    world: &'w World,
    terms: Vec<Term>,
    error: Option<EcsError>,
}

impl<'w> QueryBuilder<'w> {
    pub fn new(world: &'w World) -> Self {
        Self {
            world,
            terms: Vec::new(),
            error: None,
        }
    }

    /// The terms added so far.
    #[must_use]
    pub fn terms(&self) -> &[Term] {
        &self.terms
    }

    /// Compile the query.
    ///
    /// Fails without side effects on an empty term list or an illegal term.
    #[track_caller]
    pub fn build(self) -> EcsResult<CompiledQuery> {
        let result = match self.error {
            Some(error) => Err(error),
            None => CompiledQuery::compile(self.world, self.terms),
        };
        if let Err(error) = &result {
            report(error);
        }
        result
    }
}

impl TermBuilder for QueryBuilder<'_> {
    fn terms_mut(&mut self) -> &mut Vec<Term> {
        &mut self.terms
    }

    fn component_entity<T: Component>(&mut self) -> Option<Entity> {
        self.world.component_id::<T>()
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
    fn test_unregistered_component_fails_build() {
        let world = World::new();
        let result = world.query().with::<Position>().build();
        assert!(matches!(result, Err(EcsError::InvalidParameter(_))));
    }

    #[test]
    fn test_modifier_without_term_fails() {
        let world = World::new();
        let result = world.query().src(builtins::THIS).build();
        assert!(matches!(result, Err(EcsError::InvalidParameter(_))));
    }

    #[test]
    fn test_with_id_resolves_pair_halves() {
        let mut world = World::new();
        let likes = world.create();
        let builder = world
            .query()
            .with_id(Id::pair(likes, builtins::WILDCARD))
            .with_id(Id::of(likes).toggle());
        let terms = builder.terms();
        assert_eq!(terms[0].first, TermRef::Entity(likes));
        assert_eq!(terms[0].second, Some(TermRef::Wildcard));
        assert_eq!(terms[1].id_flags, Id::TOGGLE);
    }
}
