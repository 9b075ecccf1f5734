//! Match batches and the lazy query iterator.

use std::{
    cell::Cell,
    fmt,
    marker::PhantomData,
    ops::{Deref, DerefMut, Index},
    sync::Arc,
};

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::{
    World,
    component::TypeInfo,
    entity::Entity,
    error::fatal,
    id::Id,
    query::{
        CompiledQuery,
        engine::{Binding, Engine, FieldMatch},
        term::InOut,
    },
    stage::{Commands, Stage},
    table::{Table, TableId},
};

struct IterField {
    id: Id,
    src: Entity,
    set: bool,
    ptr: *mut u8,
    info: Option<Arc<TypeInfo>>,
}

/// One match batch: a row range of a table plus the data of every field.
///
/// Handed to query loops and observer callbacks. Field data is borrowed
/// through [`Iter::field`] and [`Iter::field_mut`], which are checked at
/// runtime so that one field can not be read and written at the same time.
pub struct Iter<'a> {
    world: &'a World,
    stage: &'a Mutex<Stage>,
    table: Option<&'a Table>,
    offset: usize,
    count: usize,
    fields: SmallVec<[IterField; 8]>,
    borrows: SmallVec<[Cell<isize>; 8]>,
    vars: SmallVec<[Entity; 4]>,
    var_names: &'a [String],
    event: Entity,
    event_id: Id,
    writable: bool,
}

impl<'a> Iter<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        world: &'a World,
        stage: &'a Mutex<Stage>,
        query: &'a CompiledQuery,
        table: Option<TableId>,
        offset: usize,
        count: usize,
        matches: &[FieldMatch],
        bindings: &[Binding],
    ) -> Self {
        let table = table.and_then(|t| world.tables.get(t));
        let fields = matches
            .iter()
            .enumerate()
            .map(|(f, m)| {
                let filter = query.field_term(f).inout == InOut::Filter;
                let (ptr, info) = if m.set && !filter {
                    field_data(world, table, offset, m)
                } else {
                    (std::ptr::null_mut(), None)
                };
                IterField {
                    id: m.id,
                    src: m.src,
                    set: m.set,
                    ptr,
                    info,
                }
            })
            .collect();
        let vars = bindings
            .iter()
            .map(|b| match *b {
                Binding::Unbound => Entity::NULL,
                Binding::Entity(e) => e,
                Binding::Table { entity, .. } if !entity.is_null() => entity,
                Binding::Table { table: t, .. } => match (table, count) {
                    (Some(table), 1) if table.id() == t => table.entities()[offset],
                    _ => Entity::NULL,
                },
            })
            .collect();
        Self {
            world,
            stage,
            table,
            offset,
            count,
            borrows: matches.iter().map(|_| Cell::new(0)).collect(),
            fields,
            vars,
            var_names: &query.vars,
            event: Entity::NULL,
            event_id: Id::NULL,
            writable: false,
        }
    }

    pub(crate) fn with_event(mut self, event: Entity, id: Id) -> Self {
        self.event = event;
        self.event_id = id;
        self
    }

    pub(crate) fn writable(mut self, writable: bool) -> Self {
        self.writable = writable;
        self
    }

    /// The world being iterated. Mutate it through [`Iter::commands`].
    #[must_use]
    pub fn world(&self) -> &'a World {
        self.world
    }

    /// Command buffer of the stage this batch runs on.
    #[must_use]
    pub fn commands(&self) -> Commands<'a> {
        Commands::new(self.world, self.stage)
    }

    /// Number of rows in the batch.
    #[must_use]
    pub fn count(&self) -> usize {
        self.count
    }

    /// Entities of the batch, in row order.
    #[must_use]
    pub fn entities(&self) -> &'a [Entity] {
        match self.table {
            Some(table) => &table.entities()[self.offset..self.offset + self.count],
            None => &[],
        }
    }

    #[must_use]
    pub fn entity(&self, row: usize) -> Option<Entity> {
        self.entities().get(row).copied()
    }

    /// Table the batch rows belong to.
    #[must_use]
    pub fn table(&self) -> Option<&'a Table> {
        self.table
    }

    /// First row of the batch within its table.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Event being delivered, `NULL` for query iteration.
    #[must_use]
    pub fn event(&self) -> Entity {
        self.event
    }

    /// Id that triggered the event.
    #[must_use]
    pub fn event_id(&self) -> Id {
        self.event_id
    }

    #[must_use]
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Concrete id matched by a field (wildcards resolved).
    #[must_use]
    pub fn field_id(&self, index: usize) -> Id {
        self.fields.get(index).map_or(Id::NULL, |f| f.id)
    }

    /// Entity a field was matched on; `NULL` when matched on the batch rows.
    #[must_use]
    pub fn field_src(&self, index: usize) -> Entity {
        self.fields.get(index).map_or(Entity::NULL, |f| f.src)
    }

    /// Whether the field was matched on the batch rows themselves.
    #[must_use]
    pub fn is_self(&self, index: usize) -> bool {
        self.fields.get(index).is_some_and(|f| f.set && f.src.is_null())
    }

    /// Whether an optional, negated or Or field matched.
    #[must_use]
    pub fn is_set(&self, index: usize) -> bool {
        self.fields.get(index).is_some_and(|f| f.set)
    }

    /// Value of a query variable for this batch.
    #[must_use]
    pub fn var(&self, name: &str) -> Option<Entity> {
        let index = self.var_names.iter().position(|v| v.eq_ignore_ascii_case(name))?;
        self.vars.get(index).copied().filter(|e| !e.is_null())
    }

    /// Raw pointer to the first value of a field, null for tags and unset
    /// fields.
    #[must_use]
    pub fn field_raw(&self, index: usize) -> *mut u8 {
        self.fields.get(index).map_or(std::ptr::null_mut(), |f| f.ptr)
    }

    fn typed<T: 'static>(&self, index: usize) -> Option<&IterField> {
        let field = self.fields.get(index)?;
        let typed = field.info.as_ref().is_some_and(|info| info.is::<T>());
        (typed && !field.ptr.is_null()).then_some(field)
    }

    /// Read access to a field's values.
    ///
    /// A field matched on another entity (fixed source or up traversal) is
    /// shared: every row sees the same value.
    ///
    /// # Panics
    ///
    /// If the field is currently borrowed through [`Iter::field_mut`].
    pub fn field<T: 'static>(&self, index: usize) -> Option<Field<'_, T>> {
        let field = self.typed::<T>(index)?;
        let borrow = &self.borrows[index];
        if borrow.get() < 0 {
            fatal!("field {} is already borrowed mutably", index);
        }
        borrow.set(borrow.get() + 1);
        let shared = !field.src.is_null();
        Some(Field {
            data: field.ptr.cast::<T>().cast_const(),
            len: if shared { self.count.max(1) } else { self.count },
            shared,
            borrow,
            _marker: PhantomData,
        })
    }

    /// Write access to a field matched on the batch rows.
    ///
    /// Returns `None` for shared fields and when the batch is read-only
    /// (plain [`CompiledQuery::iter`]).
    ///
    /// # Panics
    ///
    /// If the field is currently borrowed.
    pub fn field_mut<T: 'static>(&self, index: usize) -> Option<FieldMut<'_, T>> {
        if !self.writable {
            return None;
        }
        let field = self.typed::<T>(index)?;
        if !field.src.is_null() {
            return None;
        }
        let borrow = &self.borrows[index];
        if borrow.get() != 0 {
            fatal!("field {} is already borrowed", index);
        }
        borrow.set(-1);
        Some(FieldMut {
            data: field.ptr.cast::<T>(),
            len: self.count,
            borrow,
            _marker: PhantomData,
        })
    }
}

fn field_data(
    world: &World,
    table: Option<&Table>,
    offset: usize,
    matched: &FieldMatch,
) -> (*mut u8, Option<Arc<TypeInfo>>) {
    let (table, row) = if matched.src.is_null() {
        (table, offset)
    } else {
        match world.entities.location(matched.src) {
            Some(loc) => (world.tables.get(loc.table), loc.row),
            None => (None, 0),
        }
    };
    let Some(column) = table.and_then(|t| t.column(matched.id)) else {
        return (std::ptr::null_mut(), None);
    };
    match column.get_raw(row) {
        Some(ptr) => (ptr, Some(Arc::clone(column.info()))),
        // An empty row range still carries the column type
        None => (column.as_ptr(), Some(Arc::clone(column.info()))),
    }
}

impl fmt::Debug for Iter<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Iter")
            .field("table", &self.table.map(Table::id))
            .field("offset", &self.offset)
            .field("count", &self.count)
            .field("event", &self.event)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Field access guards
// ============================================================================

/// Shared borrow of a field's values.
pub struct Field<'i, T> {
    data: *const T,
    len: usize,
    shared: bool,
    borrow: &'i Cell<isize>,
    _marker: PhantomData<&'i T>,
}

impl<'i, T> Field<'i, T> {
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether all rows share one value from another entity.
    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.shared
    }

    #[must_use]
    pub fn get(&self, row: usize) -> Option<&T> {
        if row >= self.len {
            return None;
        }
        let index = if self.shared { 0 } else { row };
        // SAFETY: index is within the batch (or 0 for a shared value) and
        // the column outlives the iterator
        Some(unsafe { &*self.data.add(index) })
    }

    /// The values as a slice, `None` for shared fields.
    #[must_use]
    pub fn as_slice(&self) -> Option<&[T]> {
        // SAFETY: len values starting at data belong to the batch
        (!self.shared).then(|| unsafe { std::slice::from_raw_parts(self.data, self.len) })
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        (0..self.len).filter_map(|row| self.get(row))
    }
}

impl<T> Index<usize> for Field<'_, T> {
    type Output = T;

    fn index(&self, row: usize) -> &T {
        match self.get(row) {
            Some(value) => value,
            None => fatal!("field row {} out of bounds ({} rows)", row, self.len),
        }
    }
}

impl<T> Drop for Field<'_, T> {
    fn drop(&mut self) {
        self.borrow.set(self.borrow.get() - 1);
    }
}

/// Exclusive borrow of a field's values.
pub struct FieldMut<'i, T> {
    data: *mut T,
    len: usize,
    borrow: &'i Cell<isize>,
    _marker: PhantomData<&'i mut T>,
}

impl<T> Deref for FieldMut<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        // SAFETY: len values starting at data belong to the batch and are
        // exclusively borrowed by this guard
        unsafe { std::slice::from_raw_parts(self.data, self.len) }
    }
}

impl<T> DerefMut for FieldMut<'_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        // SAFETY: as for deref
        unsafe { std::slice::from_raw_parts_mut(self.data, self.len) }
    }
}

impl<T> Drop for FieldMut<'_, T> {
    fn drop(&mut self) {
        self.borrow.set(0);
    }
}

// ============================================================================
// QueryIter
// ============================================================================

/// A match batch detached from the iterator that produced it.
pub(crate) struct DetachedBatch {
    pub table: Option<TableId>,
    pub offset: usize,
    pub count: usize,
    pub fields: SmallVec<[FieldMatch; 8]>,
    pub vars: SmallVec<[Binding; 4]>,
}

/// Lazy iterator over the match batches of a query.
///
/// Tables are locked while their batches are handed out. Locks are released
/// when the iterator advances, on [`QueryIter::finish`] and on drop.
pub struct QueryIter<'a> {
    world: &'a World,
    query: &'a CompiledQuery,
    stage: &'a Mutex<Stage>,
    engine: Engine,
    /// Row runs of the current result, last run first.
    runs: SmallVec<[(usize, usize); 4]>,
    table: Option<TableId>,
    locked: Option<TableId>,
    writable: bool,
}

impl<'a> QueryIter<'a> {
    pub(crate) fn new(world: &'a World, query: &'a CompiledQuery) -> Self {
        Self::with_stage(world, query, &world.stage)
    }

    pub(crate) fn with_stage(
        world: &'a World,
        query: &'a CompiledQuery,
        stage: &'a Mutex<Stage>,
    ) -> Self {
        Self {
            world,
            query,
            stage,
            engine: Engine::new(query),
            runs: SmallVec::new(),
            table: None,
            locked: None,
            writable: false,
        }
    }

    pub(crate) fn set_writable(&mut self, writable: bool) {
        self.writable = writable;
    }

    /// Fix a variable before iterating.
    ///
    /// Binding `this` restricts results to that entity.
    #[must_use]
    pub fn with_var(mut self, name: &str, entity: Entity) -> Self {
        let Some(var) = self.query.find_var(name) else {
            return self;
        };
        let binding = match (var, self.world.entities.location(entity)) {
            (0, Some(loc)) if !self.query.this_entity_mode => Binding::Table {
                table: loc.table,
                offset: loc.row,
                count: 1,
                entity,
            },
            _ => Binding::Entity(entity),
        };
        self.engine.bind(var, binding);
        self
    }

    /// Next batch as plain data that can be handed to another thread.
    pub(crate) fn next_detached(&mut self) -> Option<DetachedBatch> {
        loop {
            if let Some((offset, count)) = self.runs.pop() {
                return Some(DetachedBatch {
                    table: self.table,
                    offset,
                    count,
                    fields: self.engine.fields.clone(),
                    vars: self.engine.vars.clone(),
                });
            }
            if !self.advance() {
                return None;
            }
        }
    }

    /// Release held resources without iterating further.
    pub fn finish(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(table) = self.locked.take().and_then(|t| self.world.tables.get(t)) {
            table.unlock();
        }
    }

    /// Split a result's rows into runs where every toggled field is enabled.
    fn split_runs(&self, table: &Table, offset: usize, count: usize) -> SmallVec<[(usize, usize); 4]> {
        let mut runs = SmallVec::new();
        let toggles: SmallVec<[_; 4]> = if table.has_toggles() {
            self.engine
                .fields
                .iter()
                .enumerate()
                .filter(|(f, m)| m.set && m.src.is_null() && self.query.field_term(*f).is_positive())
                .filter_map(|(_, m)| table.toggle_bits(m.id))
                .collect()
        } else {
            SmallVec::new()
        };
        if toggles.is_empty() {
            runs.push((offset, count));
            return runs;
        }
        let mut start = None;
        for row in offset..offset + count {
            let enabled = toggles.iter().all(|bits| bits.get(row));
            match (enabled, start) {
                (true, None) => start = Some(row),
                (false, Some(s)) => {
                    runs.push((s, row - s));
                    start = None;
                }
                _ => {}
            }
        }
        if let Some(s) = start {
            runs.push((s, offset + count - s));
        }
        runs.reverse();
        runs
    }

    fn advance(&mut self) -> bool {
        self.release();
        if !self.engine.next(self.world, self.query) {
            return false;
        }
        let (table, offset, count) = match self.engine.vars.first().copied() {
            Some(Binding::Table {
                table,
                offset,
                count,
                ..
            }) => (Some(table), offset, count),
            Some(Binding::Entity(e)) => match self.world.entities.location(e) {
                Some(loc) => (Some(loc.table), loc.row, 1),
                None => (None, 0, 0),
            },
            _ => (None, 0, 0),
        };
        self.table = table;
        self.runs = match table.and_then(|t| self.world.tables.get(t)) {
            Some(t) => {
                t.lock();
                self.locked = Some(t.id());
                self.split_runs(t, offset, count)
            }
            None => SmallVec::from_elem((0, 0), 1),
        };
        true
    }
}

impl<'a> Iterator for QueryIter<'a> {
    type Item = Iter<'a>;

    fn next(&mut self) -> Option<Iter<'a>> {
        loop {
            if let Some((offset, count)) = self.runs.pop() {
                let iter = Iter::new(
                    self.world,
                    self.stage,
                    self.query,
                    self.table,
                    offset,
                    count,
                    &self.engine.fields,
                    &self.engine.vars,
                );
                return Some(iter.writable(self.writable));
            }
            if !self.advance() {
                return None;
            }
        }
    }
}

impl Drop for QueryIter<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for QueryIter<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryIter")
            .field("table", &self.table)
            .field("locked", &self.locked)
            .finish_non_exhaustive()
    }
}
