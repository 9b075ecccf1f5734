//! Query compilation: term validation, variable allocation, field
//! assignment and evaluation order.

use smallvec::SmallVec;

use crate::{
    World, builtins,
    component_index::IdFlags,
    entity::Entity,
    error::{EcsError, EcsResult},
    id::Id,
    query::term::{InOut, Oper, Term, TermRef, Traversal},
};

/// Variable index of `$this`.
pub(crate) const THIS_VAR: u8 = 0;

/// A resolved term position.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Ref {
    Entity(Entity),
    Var(u8),
    Wildcard,
    Any,
}

impl Ref {
    pub(crate) const fn var(self) -> Option<u8> {
        match self {
            Self::Var(v) => Some(v),
            _ => None,
        }
    }
}

/// A validated term.
#[derive(Clone, Debug)]
pub(crate) struct QueryTerm {
    pub index: usize,
    pub field: usize,
    pub first: Ref,
    pub second: Option<Ref>,
    pub src: Ref,
    pub trav: Traversal,
    pub trav_rel: Entity,
    pub oper: Oper,
    pub inout: InOut,
    pub id_flags: u64,
    /// Matched through the closure of a transitive relationship.
    pub transitive: bool,
    pub reflexive: bool,
}

impl QueryTerm {
    fn refs(&self) -> impl Iterator<Item = Ref> + '_ {
        std::iter::once(self.first)
            .chain(self.second)
            .chain(std::iter::once(self.src))
    }

    pub(crate) const fn is_positive(&self) -> bool {
        matches!(self.oper, Oper::And | Oper::Or)
    }
}

/// One step of the backtracking search.
#[derive(Clone, Debug)]
pub(crate) enum Op {
    Term(usize),
    Or(SmallVec<[usize; 4]>),
    Not(usize),
    Optional(usize),
    From(usize),
    /// Bind `$this` to every table (or entity) for queries that only
    /// constrain it negatively.
    AllThis,
}

/// A compiled, reusable query.
///
/// Holds no borrows of the world; iterate it with [`CompiledQuery::iter`].
#[derive(Clone, Debug)]
pub struct CompiledQuery {
    pub(crate) source: Vec<Term>,
    pub(crate) terms: Vec<QueryTerm>,
    pub(crate) ops: Vec<Op>,
    pub(crate) field_count: usize,
    /// First term of each field.
    pub(crate) field_terms: Vec<usize>,
    pub(crate) vars: Vec<String>,
    /// `$this` binds single entities instead of whole tables.
    pub(crate) this_entity_mode: bool,
    pub(crate) uses_this: bool,
    pub(crate) match_disabled: bool,
    pub(crate) match_prefab: bool,
}

fn invalid(index: usize, reason: impl Into<String>) -> EcsError {
    EcsError::InvalidTerm {
        index,
        reason: reason.into(),
    }
}

impl CompiledQuery {
    /// Validate `terms` and produce an evaluation plan.
    pub fn compile(world: &World, terms: Vec<Term>) -> EcsResult<Self> {
        if terms.is_empty() {
            return Err(EcsError::EmptyQuery);
        }

        let mut vars = vec!["this".to_owned()];
        let mut compiled = Vec::with_capacity(terms.len());
        for (index, term) in terms.iter().enumerate() {
            compiled.push(compile_term(world, index, term, &mut vars)?);
        }

        let field_terms = assign_fields(&mut compiled)?;

        let mentions_this = |t: &QueryTerm| t.refs().any(|r| r == Ref::Var(THIS_VAR));
        let this_in_id = |t: &QueryTerm| {
            t.first == Ref::Var(THIS_VAR) || t.second == Some(Ref::Var(THIS_VAR))
        };
        let uses_this = compiled.iter().any(mentions_this);
        let this_entity_mode = compiled
            .iter()
            .any(|t| this_in_id(t) || (t.transitive && t.src == Ref::Var(THIS_VAR)));

        let mut bound: SmallVec<[u8; 8]> = SmallVec::new();
        for term in compiled.iter().filter(|t| t.is_positive()) {
            bound.extend(term.refs().filter_map(Ref::var));
        }
        let needs_all_this = uses_this && !bound.contains(&THIS_VAR);
        for term in compiled.iter().filter(|t| !t.is_positive()) {
            if let Some(var) = term.src.var() {
                if var != THIS_VAR && !bound.contains(&var) {
                    return Err(invalid(
                        term.index,
                        format!(
                            "source variable ${} is not bound by a positive term",
                            vars[usize::from(var)]
                        ),
                    ));
                }
            }
        }

        let mentions = |e: Entity| {
            compiled
                .iter()
                .any(|t| t.first == Ref::Entity(e) || t.second == Some(Ref::Entity(e)))
        };
        let match_disabled = mentions(builtins::DISABLED);
        let match_prefab = mentions(builtins::PREFAB);

        let ops = plan(&compiled, needs_all_this);

        Ok(Self {
            source: terms,
            terms: compiled,
            ops,
            field_count: field_terms.len(),
            field_terms,
            vars,
            this_entity_mode,
            uses_this,
            match_disabled,
            match_prefab,
        })
    }

    /// The terms the query was built from.
    #[must_use]
    pub fn terms(&self) -> &[Term] {
        &self.source
    }

    /// Number of fields exposed per result.
    #[must_use]
    pub fn field_count(&self) -> usize {
        self.field_count
    }

    /// Names of the query variables; index 0 is `this`.
    #[must_use]
    pub fn var_names(&self) -> &[String] {
        &self.vars
    }

    /// Index of a named variable.
    #[must_use]
    pub fn find_var(&self, name: &str) -> Option<usize> {
        self.vars.iter().position(|v| v.eq_ignore_ascii_case(name))
    }

    pub(crate) fn field_term(&self, field: usize) -> &QueryTerm {
        &self.terms[self.field_terms[field]]
    }
}

fn resolve(
    world: &World,
    index: usize,
    r: &TermRef,
    vars: &mut Vec<String>,
) -> EcsResult<Ref> {
    match r {
        TermRef::Entity(e) if world.is_alive(*e) => Ok(Ref::Entity(*e)),
        TermRef::Entity(e) => Err(invalid(index, format!("entity {e} is not alive"))),
        TermRef::Var(name) => {
            let position = match vars.iter().position(|v| v == name) {
                Some(position) => position,
                None => {
                    vars.push(name.clone());
                    vars.len() - 1
                }
            };
            u8::try_from(position)
                .map(Ref::Var)
                .map_err(|_| invalid(index, "too many query variables"))
        }
        TermRef::Wildcard => Ok(Ref::Wildcard),
        TermRef::Any => Ok(Ref::Any),
        TermRef::This => Ok(Ref::Var(THIS_VAR)),
    }
}

fn compile_term(
    world: &World,
    index: usize,
    term: &Term,
    vars: &mut Vec<String>,
) -> EcsResult<QueryTerm> {
    if let Some(reason) = term.conflict {
        return Err(invalid(index, reason));
    }

    let first = resolve(world, index, &term.first, vars)?;
    let second = match &term.second {
        Some(second) => Some(resolve(world, index, second, vars)?),
        None => None,
    };
    let src = resolve(world, index, &term.src, vars)?;

    if matches!(src, Ref::Wildcard | Ref::Any) {
        return Err(invalid(index, "a wildcard can not be used as term source"));
    }
    if first.var().is_some() && second.is_none() {
        return Err(invalid(index, "a variable id requires a pair"));
    }
    if term.oper.is_from() {
        let fixed = matches!(first, Ref::Entity(_)) && second.is_none();
        if !fixed || term.trav != Traversal::SelfOnly {
            return Err(invalid(index, "From operators take a single fixed entity"));
        }
    }

    if term.trav.has_up() {
        let rel = term.trav_rel;
        if !world.is_alive(rel) {
            return Err(invalid(index, format!("traversal relationship {rel} is not alive")));
        }
        if !world.records.flags(Id::of(rel)).contains(IdFlags::TRAVERSABLE) {
            return Err(invalid(index, format!("relationship {rel} is not traversable")));
        }
    }

    let rel_flags = match first {
        Ref::Entity(rel) if second.is_some() => world.records.flags(Id::of(rel)),
        _ => IdFlags::empty(),
    };
    let transitive = rel_flags.contains(IdFlags::TRANSITIVE)
        && term.trav == Traversal::SelfOnly
        && matches!(second, Some(Ref::Entity(_) | Ref::Var(_)));
    let reflexive = rel_flags.contains(IdFlags::REFLEXIVE);
    if transitive && !reflexive && second == Some(src) {
        return Err(invalid(
            index,
            "self-referential transitive term requires a reflexive relationship",
        ));
    }

    Ok(QueryTerm {
        index,
        field: 0,
        first,
        second,
        src,
        trav: term.trav,
        trav_rel: term.trav_rel,
        oper: term.oper,
        inout: term.inout,
        id_flags: term.id_flags,
        transitive,
        reflexive,
    })
}

/// Give every term a field; consecutive Or terms share one.
fn assign_fields(terms: &mut [QueryTerm]) -> EcsResult<Vec<usize>> {
    let mut field_terms = Vec::new();
    let mut i = 0;
    while i < terms.len() {
        let field = field_terms.len();
        field_terms.push(i);
        if terms[i].oper != Oper::Or {
            terms[i].field = field;
            i += 1;
            continue;
        }
        let start = i;
        while i < terms.len() && terms[i].oper == Oper::Or {
            if terms[i].src != terms[start].src {
                return Err(invalid(i, "terms of an Or group must share a source"));
            }
            terms[i].field = field;
            i += 1;
        }
        if i - start < 2 {
            return Err(invalid(start, "an Or group needs at least two terms"));
        }
    }
    Ok(field_terms)
}

/// Order the ops: fixed sources, the pivot, remaining positives, then
/// negative and optional terms.
fn plan(terms: &[QueryTerm], needs_all_this: bool) -> Vec<Op> {
    let and_terms = || terms.iter().filter(|t| t.oper == Oper::And);
    let pivot = and_terms()
        .find(|t| t.src == Ref::Var(THIS_VAR) && t.trav == Traversal::Cascade)
        .or_else(|| {
            and_terms().find(|t| t.src == Ref::Var(THIS_VAR) && t.trav == Traversal::SelfOnly)
        })
        .map(|t| t.index);

    let mut ops = Vec::with_capacity(terms.len() + 1);
    for term in and_terms().filter(|t| matches!(t.src, Ref::Entity(_))) {
        ops.push(Op::Term(term.index));
    }
    if let Some(pivot) = pivot {
        ops.push(Op::Term(pivot));
    }

    let mut i = 0;
    while i < terms.len() {
        let term = &terms[i];
        match term.oper {
            Oper::And if Some(i) != pivot && !matches!(term.src, Ref::Entity(_)) => {
                ops.push(Op::Term(i));
            }
            Oper::Or => {
                let group: SmallVec<[usize; 4]> = (i..terms.len())
                    .take_while(|&j| terms[j].oper == Oper::Or)
                    .collect();
                i += group.len();
                ops.push(Op::Or(group));
                continue;
            }
            _ => {}
        }
        i += 1;
    }

    if needs_all_this {
        ops.push(Op::AllThis);
    }
    for term in terms {
        match term.oper {
            Oper::Optional => ops.push(Op::Optional(term.index)),
            Oper::Not => ops.push(Op::Not(term.index)),
            o if o.is_from() => ops.push(Op::From(term.index)),
            _ => {}
        }
    }
    ops
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(world: &World, terms: Vec<Term>) -> EcsResult<CompiledQuery> {
        CompiledQuery::compile(world, terms)
    }

    #[test]
    fn test_empty_query_rejected() {
        let world = World::new();
        assert_eq!(compile(&world, Vec::new()).unwrap_err(), EcsError::EmptyQuery);
    }

    #[test]
    fn test_single_or_rejected() {
        let mut world = World::new();
        let a = world.create();
        let b = world.create();
        let err = compile(&world, vec![Term::new(a).oper(Oper::Or), Term::new(b)]).unwrap_err();
        assert!(matches!(err, EcsError::InvalidTerm { index: 0, .. }));

        let ok = compile(
            &world,
            vec![Term::new(a).oper(Oper::Or), Term::new(b).oper(Oper::Or)],
        )
        .unwrap();
        assert_eq!(ok.field_count(), 1);
    }

    #[test]
    fn test_not_only_query_gets_all_this() {
        let mut world = World::new();
        let a = world.create();
        let query = compile(&world, vec![Term::new(a).oper(Oper::Not)]).unwrap();
        assert!(matches!(query.ops.as_slice(), [Op::AllThis, Op::Not(0)]));
    }

    #[test]
    fn test_pivot_comes_first_for_this() {
        let mut world = World::new();
        let a = world.create();
        let b = world.create();
        let fixed = world.create();
        let query = compile(
            &world,
            vec![
                Term::new(a).oper(Oper::Optional),
                Term::new(b),
                Term::new(a).src(fixed),
            ],
        )
        .unwrap();
        assert!(matches!(
            query.ops.as_slice(),
            [Op::Term(2), Op::Term(1), Op::Optional(0)]
        ));
    }

    #[test]
    fn test_unbound_source_var_rejected() {
        let mut world = World::new();
        let a = world.create();
        let err = compile(
            &world,
            vec![Term::new(a), Term::new(a).src(TermRef::var("X")).oper(Oper::Not)],
        )
        .unwrap_err();
        assert!(matches!(err, EcsError::InvalidTerm { index: 1, .. }));
    }

    #[test]
    fn test_up_requires_traversable() {
        let mut world = World::new();
        let a = world.create();
        let rel = world.create();
        assert!(compile(&world, vec![Term::new(a).up(rel)]).is_err());
        assert!(compile(&world, vec![Term::new(a).up(builtins::CHILD_OF)]).is_ok());
    }

    #[test]
    fn test_dead_entity_rejected() {
        let mut world = World::new();
        let a = world.create();
        world.delete(a);
        assert!(matches!(
            compile(&world, vec![Term::new(a)]),
            Err(EcsError::InvalidTerm { index: 0, .. })
        ));
    }
}
