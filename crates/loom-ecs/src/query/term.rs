//! Query terms.

use std::fmt;

use crate::{builtins, entity::Entity};

/// One position of a term: the component/relationship, the pair target or
/// the source.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum TermRef {
    /// A fixed entity.
    Entity(Entity),
    /// A named variable (`$X`). `"this"` names the implicit `$this`.
    Var(String),
    /// `*`: matches anything, once per match.
    Wildcard,
    /// `_`: matches anything, once per table or entity.
    Any,
    /// The implicit `$this` variable.
    This,
}

impl TermRef {
    /// A named variable.
    #[must_use]
    pub fn var(name: impl Into<String>) -> Self {
        let name = name.into();
        if name.eq_ignore_ascii_case("this") {
            Self::This
        } else {
            Self::Var(name)
        }
    }
}

impl From<Entity> for TermRef {
    fn from(entity: Entity) -> Self {
        match entity {
            e if e == builtins::WILDCARD => Self::Wildcard,
            e if e == builtins::ANY => Self::Any,
            e if e == builtins::THIS => Self::This,
            e => Self::Entity(e),
        }
    }
}

impl fmt::Debug for TermRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Entity(e) => write!(f, "{e}"),
            Self::Var(name) => write!(f, "${name}"),
            Self::Wildcard => f.write_str("*"),
            Self::Any => f.write_str("_"),
            Self::This => f.write_str("$this"),
        }
    }
}

/// How a term's id is searched for on the source.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Traversal {
    /// The source itself must have the id.
    #[default]
    SelfOnly,
    /// The id is searched on ancestors reached through the traversal
    /// relationship, not on the source.
    Up,
    /// The source first, then its ancestors.
    SelfUp,
    /// Like [`Traversal::SelfUp`], with results ordered breadth-first by
    /// hierarchy depth.
    Cascade,
}

impl Traversal {
    #[must_use]
    pub const fn has_self(self) -> bool {
        !matches!(self, Self::Up)
    }

    #[must_use]
    pub const fn has_up(self) -> bool {
        !matches!(self, Self::SelfOnly)
    }
}

/// Term operator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Oper {
    #[default]
    And,
    /// Consecutive `Or` terms form one group; at least one must match.
    Or,
    Not,
    Optional,
    /// The source must have every id of the term entity's type.
    AndFrom,
    /// The source must have at least one id of the term entity's type.
    OrFrom,
    /// The source must have none of the ids of the term entity's type.
    NotFrom,
}

impl Oper {
    #[must_use]
    pub const fn is_from(self) -> bool {
        matches!(self, Self::AndFrom | Self::OrFrom | Self::NotFrom)
    }
}

/// Data access of a term.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum InOut {
    #[default]
    InOut,
    In,
    Out,
    /// Match only; the field exposes no data.
    Filter,
}

/// A single constraint of a query.
#[derive(Clone, PartialEq, Eq)]
pub struct Term {
    /// Component, tag or relationship.
    pub first: TermRef,
    /// Pair target, if the term matches a pair.
    pub second: Option<TermRef>,
    /// Entity the id is matched on.
    pub src: TermRef,
    pub trav: Traversal,
    /// Relationship walked by up traversal.
    pub trav_rel: Entity,
    pub oper: Oper,
    pub inout: InOut,
    /// Id flag bits (e.g. [`crate::Id::TOGGLE`]) the matched id must carry.
    pub id_flags: u64,
    /// Set when conflicting modifiers were applied.
    pub(crate) conflict: Option<&'static str>,
}

impl Term {
    /// Term matching a plain id on `$this`.
    #[must_use]
    pub fn new(first: impl Into<TermRef>) -> Self {
        Self {
            first: first.into(),
            second: None,
            src: TermRef::This,
            trav: Traversal::SelfOnly,
            trav_rel: builtins::CHILD_OF,
            oper: Oper::And,
            inout: InOut::InOut,
            id_flags: 0,
            conflict: None,
        }
    }

    /// Term matching a pair on `$this`.
    #[must_use]
    pub fn pair(first: impl Into<TermRef>, second: impl Into<TermRef>) -> Self {
        Self {
            second: Some(second.into()),
            ..Self::new(first)
        }
    }

    #[must_use]
    pub fn src(mut self, src: impl Into<TermRef>) -> Self {
        self.src = src.into();
        self
    }

    #[must_use]
    pub fn oper(mut self, oper: Oper) -> Self {
        let from_then_not = self.oper.is_from() && oper == Oper::Not;
        let not_then_from = self.oper == Oper::Not && oper.is_from();
        if from_then_not || not_then_from {
            self.conflict = Some("Not can not be combined with a From operator, use NotFrom");
        }
        self.oper = oper;
        self
    }

    #[must_use]
    pub fn inout(mut self, inout: InOut) -> Self {
        self.inout = inout;
        self
    }

    /// Search up through `rel` only.
    #[must_use]
    pub fn up(mut self, rel: Entity) -> Self {
        self.trav = Traversal::Up;
        self.trav_rel = rel;
        self
    }

    /// Search the source, then up through `rel`.
    #[must_use]
    pub fn self_up(mut self, rel: Entity) -> Self {
        self.trav = Traversal::SelfUp;
        self.trav_rel = rel;
        self
    }

    /// Self|up through `rel`, ordered by hierarchy depth.
    #[must_use]
    pub fn cascade(mut self, rel: Entity) -> Self {
        self.trav = Traversal::Cascade;
        self.trav_rel = rel;
        self
    }

    /// Match only ids carrying these flag bits.
    #[must_use]
    pub fn id_flags(mut self, flags: u64) -> Self {
        self.id_flags = flags;
        self
    }

    #[must_use]
    pub fn is_pair(&self) -> bool {
        self.second.is_some()
    }
}

impl fmt::Debug for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.oper)?;
        match &self.second {
            Some(second) => write!(f, " ({:?}, {:?})", self.first, second)?,
            None => write!(f, " {:?}", self.first)?,
        }
        write!(f, "({:?})", self.src)?;
        if self.trav != Traversal::SelfOnly {
            write!(f, " {:?} {}", self.trav, self.trav_rel)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_refs() {
        assert_eq!(TermRef::from(builtins::WILDCARD), TermRef::Wildcard);
        assert_eq!(TermRef::from(builtins::ANY), TermRef::Any);
        assert_eq!(TermRef::var("This"), TermRef::This);
        assert_eq!(TermRef::var("X"), TermRef::Var("X".into()));
    }

    #[test]
    fn test_not_with_from_conflicts() {
        let term = Term::new(builtins::PREFAB).oper(Oper::AndFrom).oper(Oper::Not);
        assert!(term.conflict.is_some());
        let term = Term::new(builtins::PREFAB).oper(Oper::NotFrom);
        assert!(term.conflict.is_none());
    }

    #[test]
    fn test_traversal_modes() {
        let term = Term::new(builtins::PREFAB).up(builtins::IS_A);
        assert_eq!(term.trav, Traversal::Up);
        assert!(!term.trav.has_self());
        assert!(Traversal::Cascade.has_self() && Traversal::Cascade.has_up());
    }
}
