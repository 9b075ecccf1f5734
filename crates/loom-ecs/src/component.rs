//! Component type metadata and lifecycle hooks.
//!
//! Every id that carries data has a [`TypeInfo`]: its layout plus the hooks
//! tables use to construct, destroy, copy and move column slots. Rust types
//! get their hooks generated by [`TypeInfo::of`]; foreign or dynamically
//! described types register raw hooks through [`TypeInfo::raw`].

use std::{
    alloc::Layout,
    any::TypeId,
    fmt,
    sync::Arc,
};

use crate::{FxHashMap, entity::Entity, id::Id};

/// Marker trait for types that can be used as components.
///
/// Components must be default-constructible (new columns are filled with
/// the default value when an id is added without a value) and cloneable
/// (values are copied from `IsA` bases and returned by [`crate::World::get`]).
pub trait Component: Default + Clone + Send + Sync + 'static {}

// Blanket implementation for all suitable types
impl<T: Default + Clone + Send + Sync + 'static> Component for T {}

/// Construct a default value in uninitialized memory.
pub type CtorFn = unsafe fn(dst: *mut u8);
/// Destroy an initialized value in place.
pub type DtorFn = unsafe fn(ptr: *mut u8);
/// Clone `src` into uninitialized memory at `dst`.
pub type CopyFn = unsafe fn(dst: *mut u8, src: *const u8);
/// Move `src` into uninitialized memory at `dst`; `src` is left uninitialized.
pub type MoveFn = unsafe fn(dst: *mut u8, src: *mut u8);

/// Callback invoked when a value is added, assigned or removed.
///
/// Receives the entity, the concrete id and a pointer to the value.
pub type LifecycleHook = Arc<dyn Fn(Entity, Id, *mut u8) + Send + Sync>;

/// Hooks used by tables to manage column slots.
#[derive(Clone, Default)]
pub struct TypeHooks {
    pub ctor: Option<CtorFn>,
    pub dtor: Option<DtorFn>,
    pub copy: Option<CopyFn>,
    pub move_ctor: Option<MoveFn>,
    pub on_add: Option<LifecycleHook>,
    pub on_set: Option<LifecycleHook>,
    pub on_remove: Option<LifecycleHook>,
}

impl TypeHooks {
    /// Hooks generated for a Rust type.
    #[must_use]
    pub fn of<T: Component>() -> Self {
        Self {
            ctor: Some(|dst| unsafe { dst.cast::<T>().write(T::default()) }),
            dtor: if std::mem::needs_drop::<T>() {
                Some(|ptr| unsafe { std::ptr::drop_in_place(ptr.cast::<T>()) })
            } else {
                None
            },
            copy: Some(|dst, src| unsafe {
                dst.cast::<T>().write((*src.cast::<T>()).clone());
            }),
            move_ctor: None,
            on_add: None,
            on_set: None,
            on_remove: None,
        }
    }

    /// Attach a typed `on_add` hook.
    #[must_use]
    pub fn with_on_add<T: Component>(
        mut self,
        hook: impl Fn(Entity, &mut T) + Send + Sync + 'static,
    ) -> Self {
        self.on_add = Some(typed_hook(hook));
        self
    }

    /// Attach a typed `on_set` hook.
    #[must_use]
    pub fn with_on_set<T: Component>(
        mut self,
        hook: impl Fn(Entity, &mut T) + Send + Sync + 'static,
    ) -> Self {
        self.on_set = Some(typed_hook(hook));
        self
    }

    /// Attach a typed `on_remove` hook.
    #[must_use]
    pub fn with_on_remove<T: Component>(
        mut self,
        hook: impl Fn(Entity, &mut T) + Send + Sync + 'static,
    ) -> Self {
        self.on_remove = Some(typed_hook(hook));
        self
    }
}

fn typed_hook<T: Component>(hook: impl Fn(Entity, &mut T) + Send + Sync + 'static) -> LifecycleHook {
    Arc::new(move |entity, _id, ptr| {
        if !ptr.is_null() {
            // SAFETY: the hook is only registered on type info built for `T`
            hook(entity, unsafe { &mut *ptr.cast::<T>() });
        }
    })
}

/// Runtime information about a component type.
pub struct TypeInfo {
    /// Type name for debugging.
    name: String,
    /// Memory layout of the component.
    layout: Layout,
    /// Rust TypeId when registered from a Rust type.
    type_id: Option<TypeId>,
    hooks: TypeHooks,
}

impl TypeInfo {
    /// Create type info for a concrete type.
    #[must_use]
    pub fn of<T: Component>() -> Self {
        Self {
            name: std::any::type_name::<T>().to_owned(),
            layout: Layout::new::<T>(),
            type_id: Some(TypeId::of::<T>()),
            hooks: TypeHooks::of::<T>(),
        }
    }

    /// Create type info for a type described only by its layout and hooks.
    ///
    /// Without a `ctor` new slots are zero-filled; without `copy`/`move_ctor`
    /// values are moved as raw bytes.
    #[must_use]
    pub fn raw(name: impl Into<String>, layout: Layout, hooks: TypeHooks) -> Self {
        Self {
            name: name.into(),
            layout,
            type_id: None,
            hooks,
        }
    }

    /// Replace the lifecycle hooks, keeping the layout.
    #[must_use]
    pub fn with_hooks(mut self, hooks: TypeHooks) -> Self {
        self.hooks = hooks;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn layout(&self) -> Layout {
        self.layout
    }

    #[must_use]
    pub const fn size(&self) -> usize {
        self.layout.size()
    }

    #[must_use]
    pub const fn align(&self) -> usize {
        self.layout.align()
    }

    #[must_use]
    pub const fn hooks(&self) -> &TypeHooks {
        &self.hooks
    }

    /// Check if this info is for the given type.
    #[must_use]
    pub fn is<T: 'static>(&self) -> bool {
        self.type_id == Some(TypeId::of::<T>())
    }

    /// Default-construct a value.
    ///
    /// # Safety
    ///
    /// `dst` must be valid for writes of this type's layout and uninitialized.
    pub unsafe fn construct(&self, dst: *mut u8) {
        match self.hooks.ctor {
            Some(ctor) => unsafe { ctor(dst) },
            None => unsafe { std::ptr::write_bytes(dst, 0, self.size()) },
        }
    }

    /// Destroy a value in place.
    ///
    /// # Safety
    ///
    /// `ptr` must point to an initialized value of this type, which must not
    /// be used afterwards.
    pub unsafe fn destruct(&self, ptr: *mut u8) {
        if let Some(dtor) = self.hooks.dtor {
            unsafe { dtor(ptr) };
        }
    }

    /// Move a value from `src` into uninitialized `dst`.
    ///
    /// Prefers the move hook, falls back to copy followed by destruct, then
    /// to a raw byte copy.
    ///
    /// # Safety
    ///
    /// `src` must be initialized, `dst` uninitialized, and they must not
    /// overlap. `src` is uninitialized afterwards.
    pub unsafe fn move_to(&self, dst: *mut u8, src: *mut u8) {
        if let Some(move_ctor) = self.hooks.move_ctor {
            unsafe { move_ctor(dst, src) };
        } else if let Some(copy) = self.hooks.copy.filter(|_| self.type_id.is_none()) {
            // Rust types skip this branch: they are always bitwise movable.
            unsafe {
                copy(dst, src);
                self.destruct(src);
            }
        } else {
            unsafe { std::ptr::copy_nonoverlapping(src, dst, self.size()) };
        }
    }

    /// Clone a value from `src` into uninitialized `dst`.
    ///
    /// # Safety
    ///
    /// `src` must be initialized, `dst` uninitialized, and they must not
    /// overlap.
    pub unsafe fn copy_to(&self, dst: *mut u8, src: *const u8) {
        match self.hooks.copy {
            Some(copy) => unsafe { copy(dst, src) },
            None => unsafe { std::ptr::copy_nonoverlapping(src, dst, self.size()) },
        }
    }
}

impl fmt::Debug for TypeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeInfo")
            .field("name", &self.name)
            .field("size", &self.layout.size())
            .field("align", &self.layout.align())
            .finish()
    }
}

/// Per-world registry of type info, keyed by component id.
///
/// Also maps Rust types to the component entity created for them.
#[derive(Default)]
pub struct TypeInfoRegistry {
    infos: FxHashMap<Id, Arc<TypeInfo>>,
    by_type: FxHashMap<TypeId, Entity>,
}

impl TypeInfoRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register type info for an id, replacing any previous info.
    pub fn register(&mut self, id: Id, info: TypeInfo) -> Arc<TypeInfo> {
        let info = Arc::new(info);
        self.infos.insert(id, Arc::clone(&info));
        info
    }

    /// Associate a Rust type with its component entity.
    pub fn bind_type<T: 'static>(&mut self, entity: Entity) {
        self.by_type.insert(TypeId::of::<T>(), entity);
    }

    /// Component entity registered for a Rust type.
    #[must_use]
    pub fn entity_of<T: 'static>(&self) -> Option<Entity> {
        self.by_type.get(&TypeId::of::<T>()).copied()
    }

    #[must_use]
    pub fn get(&self, id: Id) -> Option<&Arc<TypeInfo>> {
        self.infos.get(&id)
    }

    /// Drop the info for an id (and any Rust type bound to it).
    pub fn unregister(&mut self, id: Id) -> Option<Arc<TypeInfo>> {
        let removed = self.infos.remove(&id);
        if removed.is_some() {
            self.by_type.retain(|_, entity| Id::of(*entity) != id);
        }
        removed
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.infos.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }
}

impl fmt::Debug for TypeInfoRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeInfoRegistry")
            .field("count", &self.infos.len())
            .finish()
    }
}
