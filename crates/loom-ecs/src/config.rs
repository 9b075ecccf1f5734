//! World configuration.

/// How relationship policy violations are handled.
///
/// A policy violation is an attempt to change a trait (e.g. `Exclusive`)
/// of a relationship that already has live instances.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PolicyMode {
    /// Log the violation and abort.
    #[default]
    Fatal,
    /// Log the violation and reject the change.
    Recover,
}

/// Configuration used when creating a [`crate::World`].
#[derive(Clone, Debug)]
pub struct WorldConfig {
    /// Number of entity slots to pre-allocate.
    pub entity_capacity: usize,
    /// Number of worker stages used by parallel query passes.
    pub stage_count: usize,
    /// Handling of relationship policy violations.
    pub policy: PolicyMode,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            entity_capacity: 0,
            stage_count: 0,
            policy: PolicyMode::Fatal,
        }
    }
}

impl WorldConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn entity_capacity(mut self, capacity: usize) -> Self {
        self.entity_capacity = capacity;
        self
    }

    #[must_use]
    pub const fn stage_count(mut self, count: usize) -> Self {
        self.stage_count = count;
        self
    }

    #[must_use]
    pub const fn policy(mut self, policy: PolicyMode) -> Self {
        self.policy = policy;
        self
    }
}
