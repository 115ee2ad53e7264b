//! Constraint/affinity operand set (§4.2).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ConstraintOperand {
    #[strum(serialize = "=")]
    Equal,
    #[strum(serialize = "!=")]
    NotEqual,
    #[strum(serialize = "<")]
    Less,
    #[strum(serialize = "<=")]
    LessEqual,
    #[strum(serialize = ">")]
    Greater,
    #[strum(serialize = ">=")]
    GreaterEqual,
    Version,
    Semver,
    Regexp,
    Is,
    IsNot,
    SetContainsAny,
    SetContainsAll,
    DistinctHosts,
    DistinctProperty,
}

/// A hard-filter requirement evaluated against a node (§4.2). `ltarget` and
/// `rtarget` are pre-interpolation template strings; `${node.*}`,
/// `${meta.*}` and `${attr.*}` are resolved against a node by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Constraint {
    pub ltarget: String,
    pub operand: ConstraintOperand,
    pub rtarget: String,
}

impl Constraint {
    /// A constraint "escapes" the computed-class cache (§4.2 step 3) when
    /// its `ltarget` cannot be answered purely from the node's class: it
    /// references `${node.unique.*}` or a `unique.`-prefixed meta key.
    pub fn escapes_computed_class(&self) -> bool {
        self.ltarget.contains("${node.unique.")
            || self.ltarget.contains("${meta.unique.")
            || self.ltarget.starts_with("unique.")
    }
}

/// A soft-preference affinity; matching adds `weight` to the node's
/// affinity score component (§4.3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Affinity {
    pub ltarget: String,
    pub operand: ConstraintOperand,
    pub rtarget: String,
    pub weight: i32,
}
