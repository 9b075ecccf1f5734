//! Named entities.

use crate::{FxHashMap, World, entity::Entity};

/// Two-way name index.
#[derive(Debug, Default)]
pub(crate) struct Names {
    by_name: FxHashMap<Box<str>, Entity>,
    by_entity: FxHashMap<Entity, Box<str>>,
}

impl Names {
    /// Name an entity, replacing its previous name.
    pub(crate) fn insert(&mut self, entity: Entity, name: &str) {
        self.remove(entity);
        if let Some(previous) = self.by_name.insert(name.into(), entity) {
            self.by_entity.remove(&previous);
        }
        self.by_entity.insert(entity, name.into());
    }

    pub(crate) fn remove(&mut self, entity: Entity) {
        if let Some(name) = self.by_entity.remove(&entity) {
            self.by_name.remove(&name);
        }
    }

    fn get(&self, name: &str) -> Option<Entity> {
        self.by_name.get(name).copied()
    }

    fn name(&self, entity: Entity) -> Option<&str> {
        self.by_entity.get(&entity).map(AsRef::as_ref)
    }
}

impl World {
    /// Get or create the entity with this name.
    ///
    /// ```ignore
    /// let earth = world.entity_named("Earth");
    /// assert_eq!(world.lookup("Earth"), Some(earth));
    /// ```
    pub fn entity_named(&mut self, name: &str) -> Entity {
        if let Some(entity) = self.lookup(name) {
            return entity;
        }
        let entity = self.create();
        self.names.insert(entity, name);
        entity
    }

    /// Entity with this name, without creating it.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<Entity> {
        self.names.get(name).filter(|e| self.is_alive(*e))
    }

    /// Name of an entity, if it has one.
    #[must_use]
    pub fn name(&self, entity: Entity) -> Option<&str> {
        if !self.is_alive(entity) {
            return None;
        }
        self.names.name(entity)
    }

    /// Set or replace the name of an entity.
    ///
    /// Returns `false` if the entity is dead or another alive entity has the
    /// name.
    pub fn set_name(&mut self, entity: Entity, name: &str) -> bool {
        if !self.is_alive(entity) {
            return false;
        }
        if self.lookup(name).is_some_and(|existing| existing != entity) {
            return false;
        }
        self.names.insert(entity, name);
        true
    }

    pub(crate) fn forget_name(&mut self, entity: Entity) {
        self.names.remove(entity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_named_is_stable() {
        let mut world = World::new();
        let earth = world.entity_named("Earth");
        assert_eq!(world.entity_named("Earth"), earth);
        assert_eq!(world.name(earth), Some("Earth"));
    }

    #[test]
    fn test_set_name_rejects_taken_name() {
        let mut world = World::new();
        let a = world.entity_named("a");
        let b = world.create();
        assert!(!world.set_name(b, "a"));
        assert!(world.set_name(b, "b"));
        assert!(world.set_name(a, "c"));
        assert_eq!(world.lookup("a"), None);
        assert_eq!(world.lookup("c"), Some(a));
    }

    #[test]
    fn test_name_released_on_delete() {
        let mut world = World::new();
        let a = world.entity_named("gone");
        world.delete(a);
        assert_eq!(world.lookup("gone"), None);
        let b = world.entity_named("gone");
        assert_ne!(a, b);
    }
}
