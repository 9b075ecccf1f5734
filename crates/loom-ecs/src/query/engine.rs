//! Backtracking evaluation of compiled queries.
//!
//! Each op produces the alternatives that are consistent with the variables
//! bound so far. The engine walks the ops depth-first, restoring variable
//! bindings when it backs out of a frame, and reports one result per
//! complete path.

use std::collections::VecDeque;

use smallvec::{SmallVec, smallvec};

use crate::{
    World, builtins,
    component_index::IdFlags,
    entity::{Entity, FIRST_USER_INDEX},
    id::Id,
    query::{
        CompiledQuery,
        compile::{Op, QueryTerm, Ref, THIS_VAR},
        term::{Oper, Traversal},
    },
    table::{Table, TableFlags, TableId, Type},
};

/// Value of a query variable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Binding {
    Unbound,
    Entity(Entity),
    /// A row range of a table. `entity` is set when the range stands for a
    /// single known entity.
    Table {
        table: TableId,
        offset: usize,
        count: usize,
        entity: Entity,
    },
}

impl Binding {
    fn same_value(self, other: Self) -> bool {
        match (self, other) {
            (Self::Table { table: a, .. }, Self::Table { table: b, .. }) => a == b,
            (a, b) => a == b,
        }
    }
}

/// What a field matched for the current result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct FieldMatch {
    pub id: Id,
    /// Entity the id was found on; `NULL` means the `$this` rows.
    pub src: Entity,
    pub set: bool,
}

impl FieldMatch {
    const fn unset(id: Id) -> Self {
        Self {
            id,
            src: Entity::NULL,
            set: false,
        }
    }
}

type Binds = SmallVec<[(u8, Binding); 2]>;

#[derive(Clone, Debug)]
struct Alt {
    binds: Binds,
    field: Option<(usize, FieldMatch)>,
}

struct Frame {
    alts: Vec<Alt>,
    pos: usize,
    saved: SmallVec<[Binding; 4]>,
}

/// Resumable search state for one query evaluation.
pub(crate) struct Engine {
    frames: Vec<Frame>,
    pub(crate) vars: SmallVec<[Binding; 4]>,
    pub(crate) fields: SmallVec<[FieldMatch; 8]>,
    started: bool,
    done: bool,
}

impl Engine {
    pub(crate) fn new(query: &CompiledQuery) -> Self {
        Self {
            frames: Vec::new(),
            vars: smallvec![Binding::Unbound; query.vars.len()],
            fields: smallvec![FieldMatch::unset(Id::NULL); query.field_count],
            started: false,
            done: false,
        }
    }

    /// Pre-bind a variable before the first result is requested.
    pub(crate) fn bind(&mut self, var: usize, binding: Binding) {
        if let Some(slot) = self.vars.get_mut(var) {
            *slot = binding;
        }
    }

    /// Advance to the next result. Returns `false` once exhausted.
    pub(crate) fn next(&mut self, world: &World, query: &CompiledQuery) -> bool {
        if self.done {
            return false;
        }
        let eval = |vars: &[Binding], op: &Op| Eval { world, query, vars }.op(op);

        if !self.started {
            self.started = true;
            if !self.prebound_table_visible(world, query) {
                self.done = true;
                return false;
            }
            match query.ops.first() {
                Some(op) => {
                    let alts = eval(&self.vars, op);
                    self.frames.push(Frame {
                        alts,
                        pos: 0,
                        saved: self.vars.clone(),
                    });
                }
                None => return true,
            }
        }

        while let Some(frame) = self.frames.last_mut() {
            if frame.pos >= frame.alts.len() {
                self.frames.pop();
                continue;
            }
            let alt = &frame.alts[frame.pos];
            frame.pos += 1;
            self.vars.clone_from(&frame.saved);
            for &(var, binding) in &alt.binds {
                self.vars[usize::from(var)] = binding;
            }
            if let Some((field, matched)) = alt.field {
                self.fields[field] = matched;
            }

            let depth = self.frames.len();
            let Some(op) = query.ops.get(depth) else {
                return true;
            };
            let alts = eval(&self.vars, op);
            self.frames.push(Frame {
                alts,
                pos: 0,
                saved: self.vars.clone(),
            });
        }
        self.done = true;
        false
    }

    fn prebound_table_visible(&self, world: &World, query: &CompiledQuery) -> bool {
        match self.vars.first() {
            Some(Binding::Table { table, .. }) => world
                .tables
                .get(*table)
                .is_some_and(|t| table_visible(t, query)),
            _ => true,
        }
    }
}

/// Whether a table may appear in results of `query` (ignoring emptiness).
pub(crate) fn table_visible(table: &Table, query: &CompiledQuery) -> bool {
    let flags = table.flags();
    (!flags.contains(TableFlags::DISABLED) || query.match_disabled)
        && (!flags.contains(TableFlags::PREFAB) || query.match_prefab)
}

/// A term position after substituting bound variables.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Slot {
    Fixed(Entity),
    Free(u8),
    Wildcard,
    Any,
}

impl Slot {
    fn index(self) -> u32 {
        match self {
            Self::Fixed(e) => e.id(),
            Self::Free(_) | Self::Wildcard => builtins::WILDCARD.id(),
            Self::Any => builtins::ANY.id(),
        }
    }
}

/// A table matched during enumeration.
struct TableHit {
    table: TableId,
    id: Id,
    src: Entity,
    binds: Binds,
}

struct Eval<'a> {
    world: &'a World,
    query: &'a CompiledQuery,
    vars: &'a [Binding],
}

impl Eval<'_> {
    fn op(&self, op: &Op) -> Vec<Alt> {
        match op {
            Op::Term(t) => self.term(&self.query.terms[*t]),
            Op::Or(group) => self.or(group),
            Op::Not(t) => {
                let term = &self.query.terms[*t];
                if self.term(term).is_empty() {
                    vec![self.unset(term)]
                } else {
                    Vec::new()
                }
            }
            Op::Optional(t) => {
                let term = &self.query.terms[*t];
                let alts = self.term(term);
                if alts.is_empty() { vec![self.unset(term)] } else { alts }
            }
            Op::From(t) => self.from(&self.query.terms[*t]),
            Op::AllThis => self.all_this(),
        }
    }

    fn unset(&self, term: &QueryTerm) -> Alt {
        Alt {
            binds: Binds::new(),
            field: Some((term.field, FieldMatch::unset(self.pattern(term, false)))),
        }
    }

    fn slot(&self, r: Ref) -> Slot {
        match r {
            Ref::Entity(e) => Slot::Fixed(e),
            Ref::Wildcard => Slot::Wildcard,
            Ref::Any => Slot::Any,
            Ref::Var(v) => match self.vars[usize::from(v)] {
                Binding::Unbound => Slot::Free(v),
                Binding::Entity(e) | Binding::Table { entity: e, .. } => Slot::Fixed(e),
            },
        }
    }

    /// Id pattern of a term; free variables become wildcards. Record keys
    /// use `*` in place of `_`.
    fn pattern(&self, term: &QueryTerm, record_key: bool) -> Id {
        let index = |slot: Slot| match slot {
            Slot::Any if record_key => builtins::WILDCARD.id(),
            slot => slot.index(),
        };
        let first = index(self.slot(term.first));
        let id = match term.second {
            Some(second) => Id::pair_from_indices(first, index(self.slot(second))),
            None => Id::from_bits(u64::from(first)),
        };
        Id::from_bits(id.to_bits() | term.id_flags)
    }

    fn term(&self, term: &QueryTerm) -> Vec<Alt> {
        if term.transitive {
            return self.transitive(term);
        }
        match term.src {
            Ref::Entity(e) => self.on_entity(term, e, e),
            Ref::Var(v) => match self.vars[usize::from(v)] {
                Binding::Entity(e) => {
                    let src = if v == THIS_VAR { Entity::NULL } else { e };
                    self.on_entity(term, e, src)
                }
                Binding::Table { table, .. } => self.on_table(term, table),
                Binding::Unbound => self.enumerate(term, v),
            },
            Ref::Wildcard | Ref::Any => Vec::new(),
        }
    }

    /// Ids of `ty` matching the term, with the bindings they imply.
    fn match_type(&self, term: &QueryTerm, ty: &Type) -> SmallVec<[(Id, Binds); 4]> {
        let first = self.slot(term.first);
        let second = term.second.map(|s| self.slot(s));
        let pattern = self.pattern(term, false);
        let free = matches!(first, Slot::Free(_)) || matches!(second, Some(Slot::Free(_)));
        let once = !free && (first == Slot::Any || second == Some(Slot::Any));

        let mut out = SmallVec::new();
        let mut start = 0;
        while let Some((i, id)) = ty.find_match(pattern, start) {
            start = i + 1;
            let mut binds = Binds::new();
            if let Slot::Free(v) = first {
                match self.world.entities.get_alive(id.first()) {
                    Some(e) => binds.push((v, Binding::Entity(e))),
                    None => continue,
                }
            }
            if let Some(Slot::Free(v)) = second {
                match self.world.entities.get_alive(id.second()) {
                    Some(e) => binds.push((v, Binding::Entity(e))),
                    None => continue,
                }
            }
            let Some(binds) = consistent(binds) else {
                continue;
            };
            out.push((id, binds));
            if once {
                break;
            }
        }
        out
    }

    /// First match of the term on an ancestor reached through the term's
    /// traversal relationship.
    fn search_up(
        &self,
        term: &QueryTerm,
        ty: &Type,
        visited: &mut SmallVec<[Entity; 8]>,
    ) -> Option<(Id, Entity, Binds)> {
        let pattern = self.pattern(term, false);
        if term.trav_rel == builtins::IS_A
            && !pattern.is_wildcard()
            && self.world.records.flags(pattern).contains(IdFlags::DONT_INHERIT)
        {
            return None;
        }
        let rel_pattern = Id::pair(term.trav_rel, builtins::WILDCARD);
        let mut start = 0;
        while let Some((i, rel_id)) = ty.find_match(rel_pattern, start) {
            start = i + 1;
            let Some(parent) = self.world.entities.get_alive(rel_id.second()) else {
                continue;
            };
            if visited.contains(&parent) {
                continue;
            }
            visited.push(parent);
            let Some(parent_ty) = self.world.type_of(parent) else {
                continue;
            };
            if let Some((id, binds)) = self.match_type(term, parent_ty).into_iter().next() {
                return Some((id, parent, binds));
            }
            if let Some(found) = self.search_up(term, parent_ty, visited) {
                return Some(found);
            }
        }
        None
    }

    /// Matches on a type with traversal applied. `self_src` is the field
    /// source reported for matches on the type itself.
    fn match_traversal(&self, term: &QueryTerm, ty: &Type, self_src: Entity) -> Vec<Alt> {
        let mut alts: Vec<Alt> = Vec::new();
        if term.trav.has_self() {
            for (id, binds) in self.match_type(term, ty) {
                alts.push(Alt {
                    binds,
                    field: Some((term.field, set_field(id, self_src))),
                });
            }
        }
        if term.trav.has_up() && alts.is_empty() {
            if let Some((id, src, binds)) = self.search_up(term, ty, &mut SmallVec::new()) {
                alts.push(Alt {
                    binds,
                    field: Some((term.field, set_field(id, src))),
                });
            }
        }
        alts
    }

    fn on_entity(&self, term: &QueryTerm, entity: Entity, src: Entity) -> Vec<Alt> {
        match self.world.type_of(entity) {
            Some(ty) => self.match_traversal(term, ty, src),
            None => Vec::new(),
        }
    }

    fn on_table(&self, term: &QueryTerm, table: TableId) -> Vec<Alt> {
        match self.world.tables.get(table) {
            Some(table) => self.match_traversal(term, table.ty(), Entity::NULL),
            None => Vec::new(),
        }
    }

    fn skip(&self, table: &Table) -> bool {
        table.is_empty() || !table_visible(table, self.query)
    }

    /// Tables matching the term when its source is unbound.
    fn table_hits(&self, term: &QueryTerm) -> Vec<TableHit> {
        let world = self.world;
        let mut hits = Vec::new();
        if term.trav.has_self() {
            if let Some(record) = world.records.get(self.pattern(term, true)) {
                for tr in record.tables() {
                    let table = world.tables.table(tr.table);
                    if self.skip(table) {
                        continue;
                    }
                    for (id, binds) in self.match_type(term, table.ty()) {
                        hits.push(TableHit {
                            table: tr.table,
                            id,
                            src: Entity::NULL,
                            binds,
                        });
                    }
                }
            }
        }
        if term.trav.has_up() {
            let rel_key = Id::pair(term.trav_rel, builtins::WILDCARD);
            if let Some(record) = world.records.get(rel_key) {
                for tr in record.tables() {
                    let table = world.tables.table(tr.table);
                    if self.skip(table) {
                        continue;
                    }
                    if term.trav.has_self() && !self.match_type(term, table.ty()).is_empty() {
                        continue;
                    }
                    let mut visited = SmallVec::new();
                    if let Some((id, src, binds)) = self.search_up(term, table.ty(), &mut visited) {
                        hits.push(TableHit {
                            table: tr.table,
                            id,
                            src,
                            binds,
                        });
                    }
                }
            }
        }
        if term.trav == Traversal::Cascade {
            hits.sort_by_key(|hit| world.table_depth(hit.table));
        }
        hits
    }

    /// Bind the unbound source variable `var` to each matching table (or
    /// entity).
    fn enumerate(&self, term: &QueryTerm, var: u8) -> Vec<Alt> {
        let hits = self.table_hits(term);
        let mut alts = Vec::new();
        let per_table = var == THIS_VAR && !self.query.this_entity_mode;
        for hit in hits {
            let table = self.world.tables.table(hit.table);
            if per_table {
                let mut binds = hit.binds;
                binds.insert(0, (var, table_binding(table)));
                if let Some(binds) = consistent(binds) {
                    alts.push(Alt {
                        binds,
                        field: Some((term.field, set_field(hit.id, hit.src))),
                    });
                }
                continue;
            }
            for &entity in table.entities() {
                let mut binds = hit.binds.clone();
                binds.insert(0, (var, Binding::Entity(entity)));
                let src = match (hit.src.is_null(), var == THIS_VAR) {
                    (false, _) => hit.src,
                    (true, true) => Entity::NULL,
                    (true, false) => entity,
                };
                if let Some(binds) = consistent(binds) {
                    alts.push(Alt {
                        binds,
                        field: Some((term.field, set_field(hit.id, src))),
                    });
                }
            }
        }
        alts
    }

    fn or(&self, group: &[usize]) -> Vec<Alt> {
        let terms = &self.query.terms;
        let Some(&head) = group.first() else {
            return Vec::new();
        };
        let src_var = match terms[head].src {
            Ref::Var(v) if self.vars[usize::from(v)] == Binding::Unbound => Some(v),
            _ => None,
        };
        let Some(src_var) = src_var else {
            return group
                .iter()
                .map(|&t| self.term(&terms[t]))
                .find(|alts| !alts.is_empty())
                .unwrap_or_default();
        };

        let mut seen: Vec<Binding> = Vec::new();
        let mut out = Vec::new();
        for &t in group {
            for alt in self.term(&terms[t]) {
                let bound = alt
                    .binds
                    .iter()
                    .find(|(v, _)| *v == src_var)
                    .map(|(_, b)| *b);
                if let Some(bound) = bound {
                    if seen.iter().any(|s| s.same_value(bound)) {
                        continue;
                    }
                    seen.push(bound);
                }
                out.push(alt);
            }
        }
        out
    }

    fn source_type(&self, term: &QueryTerm) -> Option<&Type> {
        match term.src {
            Ref::Entity(e) => self.world.type_of(e),
            Ref::Var(v) => match self.vars[usize::from(v)] {
                Binding::Entity(e) => self.world.type_of(e),
                Binding::Table { table, .. } => self.world.tables.get(table).map(Table::ty),
                Binding::Unbound => None,
            },
            _ => None,
        }
    }

    fn from(&self, term: &QueryTerm) -> Vec<Alt> {
        let Ref::Entity(list) = term.first else {
            return Vec::new();
        };
        let (Some(ty), Some(list_ty)) = (self.source_type(term), self.world.type_of(list)) else {
            return Vec::new();
        };
        let mut ids = from_list_ids(self.world, list_ty);
        let pass = match term.oper {
            Oper::AndFrom => ids.all(|id| ty.contains(id)),
            Oper::OrFrom => ids.any(|id| ty.contains(id)),
            _ => !ids.any(|id| ty.contains(id)),
        };
        if pass {
            vec![Alt {
                binds: Binds::new(),
                field: Some((term.field, FieldMatch::unset(Id::of(list)))),
            }]
        } else {
            Vec::new()
        }
    }

    fn all_this(&self) -> Vec<Alt> {
        let mut alts = Vec::new();
        for table in self.world.tables.iter() {
            if self.skip(table) {
                continue;
            }
            if self.query.this_entity_mode {
                alts.extend(table.entities().iter().map(|&e| Alt {
                    binds: smallvec![(THIS_VAR, Binding::Entity(e))],
                    field: None,
                }));
            } else {
                alts.push(Alt {
                    binds: smallvec![(THIS_VAR, table_binding(table))],
                    field: None,
                });
            }
        }
        alts
    }

    // ==================== Transitive closure ====================

    fn transitive(&self, term: &QueryTerm) -> Vec<Alt> {
        let Ref::Entity(rel) = term.first else {
            return Vec::new();
        };
        let Some(second) = term.second else {
            return Vec::new();
        };
        let field_src = |src: Entity| {
            if term.src == Ref::Var(THIS_VAR) { Entity::NULL } else { src }
        };
        let alt = |binds: Binds, src: Entity, target: Entity| Alt {
            binds,
            field: Some((term.field, set_field(Id::pair(rel, target), field_src(src)))),
        };

        let mut alts = Vec::new();
        match (self.slot(term.src), self.slot(second)) {
            (Slot::Fixed(src), Slot::Fixed(target)) => {
                if self.closure_up(rel, src, term.reflexive).contains(&target) {
                    alts.push(alt(Binds::new(), src, target));
                }
            }
            (Slot::Fixed(src), Slot::Free(v)) => {
                for target in self.closure_up(rel, src, term.reflexive) {
                    alts.push(alt(smallvec![(v, Binding::Entity(target))], src, target));
                }
            }
            (Slot::Free(v), Slot::Fixed(target)) => {
                for src in self.closure_down(rel, target, term.reflexive) {
                    alts.push(alt(smallvec![(v, Binding::Entity(src))], src, target));
                }
            }
            (Slot::Free(a), Slot::Free(b)) if a == b => {
                for x in self.universe(rel) {
                    alts.push(alt(smallvec![(a, Binding::Entity(x))], x, x));
                }
            }
            (Slot::Free(a), Slot::Free(b)) => {
                for src in self.sources(rel) {
                    for target in self.closure_up(rel, src, term.reflexive) {
                        let binds = smallvec![(a, Binding::Entity(src)), (b, Binding::Entity(target))];
                        alts.push(alt(binds, src, target));
                    }
                }
            }
            _ => {}
        }
        alts
    }

    /// Targets reachable from `src`, closest first.
    fn closure_up(&self, rel: Entity, src: Entity, reflexive: bool) -> SmallVec<[Entity; 8]> {
        let mut out = SmallVec::new();
        if reflexive {
            out.push(src);
        }
        let mut visited: SmallVec<[Entity; 8]> = smallvec![src];
        let mut queue = VecDeque::from([src]);
        let pattern = Id::pair(rel, builtins::WILDCARD);
        while let Some(current) = queue.pop_front() {
            let Some(ty) = self.world.type_of(current) else {
                continue;
            };
            let mut start = 0;
            while let Some((i, id)) = ty.find_match(pattern, start) {
                start = i + 1;
                let Some(target) = self.world.entities.get_alive(id.second()) else {
                    continue;
                };
                if !visited.contains(&target) {
                    visited.push(target);
                    out.push(target);
                    queue.push_back(target);
                }
            }
        }
        out
    }

    /// Sources that reach `target`, closest first.
    fn closure_down(&self, rel: Entity, target: Entity, reflexive: bool) -> SmallVec<[Entity; 8]> {
        let mut out = SmallVec::new();
        if reflexive {
            out.push(target);
        }
        let mut visited: SmallVec<[Entity; 8]> = smallvec![target];
        let mut queue = VecDeque::from([target]);
        while let Some(current) = queue.pop_front() {
            let Some(record) = self.world.records.get(Id::pair(rel, current)) else {
                continue;
            };
            for tr in record.tables() {
                let table = self.world.tables.table(tr.table);
                if !table_visible(table, self.query) {
                    continue;
                }
                for &src in table.entities() {
                    if !visited.contains(&src) {
                        visited.push(src);
                        out.push(src);
                        queue.push_back(src);
                    }
                }
            }
        }
        out
    }

    /// Entities holding any `(rel, *)` pair, in table order.
    fn sources(&self, rel: Entity) -> Vec<Entity> {
        let mut out = Vec::new();
        if let Some(record) = self.world.records.get(Id::pair(rel, builtins::WILDCARD)) {
            for tr in record.tables() {
                let table = self.world.tables.table(tr.table);
                if self.skip(table) {
                    continue;
                }
                for &e in table.entities() {
                    if !out.contains(&e) {
                        out.push(e);
                    }
                }
            }
        }
        out
    }

    /// Sources of `rel` followed by targets that are not sources.
    fn universe(&self, rel: Entity) -> Vec<Entity> {
        let mut out = self.sources(rel);
        let pattern = Id::pair(rel, builtins::WILDCARD);
        for src in out.clone() {
            let Some(ty) = self.world.type_of(src) else {
                continue;
            };
            let mut start = 0;
            while let Some((i, id)) = ty.find_match(pattern, start) {
                start = i + 1;
                if let Some(target) = self.world.entities.get_alive(id.second()) {
                    if !out.contains(&target) {
                        out.push(target);
                    }
                }
            }
        }
        out
    }
}

const fn set_field(id: Id, src: Entity) -> FieldMatch {
    FieldMatch { id, src, set: true }
}

fn table_binding(table: &Table) -> Binding {
    Binding::Table {
        table: table.id(),
        offset: 0,
        count: table.len(),
        entity: Entity::NULL,
    }
}

/// Drop duplicate bindings; `None` if a variable got two different values.
fn consistent(binds: Binds) -> Option<Binds> {
    let mut out = Binds::new();
    for (var, binding) in binds {
        match out.iter().find(|(v, _)| *v == var) {
            Some((_, existing)) if !existing.same_value(binding) => return None,
            Some(_) => {}
            None => out.push((var, binding)),
        }
    }
    Some(out)
}

/// Ids of a list entity's type tested by `AndFrom`, `OrFrom` and `NotFrom`
/// terms. Builtin and `DontInherit` ids are skipped.
pub(crate) fn from_list_ids<'a>(world: &'a World, list: &'a Type) -> impl Iterator<Item = Id> + 'a {
    list.iter().filter(move |id| {
        id.first() >= FIRST_USER_INDEX && !world.records.flags(*id).contains(IdFlags::DONT_INHERIT)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Generation;

    fn e(index: u32) -> Entity {
        Entity::new(index, Generation::new())
    }

    #[test]
    fn test_consistent_bindings() {
        let a = Binding::Entity(e(70));
        let b = Binding::Entity(e(71));
        assert!(consistent(smallvec![(1, a), (1, a)]).is_some_and(|binds| binds.len() == 1));
        assert!(consistent(smallvec![(1, a), (1, b)]).is_none());
        assert!(consistent(smallvec![(1, a), (2, b)]).is_some_and(|binds| binds.len() == 2));
    }

    #[test]
    fn test_table_bindings_compare_by_table() {
        let a = Binding::Table {
            table: TableId::from_raw(3),
            offset: 0,
            count: 4,
            entity: Entity::NULL,
        };
        let b = Binding::Table {
            table: TableId::from_raw(3),
            offset: 2,
            count: 1,
            entity: e(70),
        };
        assert!(a.same_value(b));
        assert!(!a.same_value(Binding::Entity(e(70))));
    }
}
