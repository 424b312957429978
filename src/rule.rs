//! Scheduling rules: conflict predicates over resource descriptors.
//!
//! A rule names the resources a job touches. The scheduler consults
//! [`ScheduleRule::is_conflicting`] before starting a job: any job whose rule
//! conflicts with a running (or already-chained) job is parked on that job's
//! blocking chain instead of running. `contains` expresses hierarchical
//! containment and gates nested `begin_rule` reentry.
//!
//! # Invariants
//!
//! - `is_conflicting` is reflexive: a rule conflicts with an equal rule.
//! - Conflict checks for one scheduling decision all happen under the
//!   scheduler's mutex, so implementations must be pure (no interior
//!   mutability visible to the predicate).
//! - A compound rule answers conflict/containment for all of its children;
//!   when exactly one side of a pair is compound, the compound side decides.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Conflict predicate identifying the resources a job touches.
///
/// Implementations are plain value types. `as_any` enables compound rules to
/// recognize their own kind when delegating.
pub trait ScheduleRule: fmt::Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;

    /// Hierarchical containment: does this rule's resource set include
    /// `other`'s entirely?
    fn contains(&self, other: &dyn ScheduleRule) -> bool;

    /// Overlap test. Must be reflexive; symmetric in practice.
    fn is_conflicting(&self, other: &dyn ScheduleRule) -> bool;

    /// Compound rules get delegation priority in pairwise checks.
    fn is_compound(&self) -> bool {
        false
    }
}

/// Pairwise conflict with compound delegation.
///
/// When one side is compound it must decide, otherwise a leaf rule would
/// answer `false` for a compound it knows nothing about.
pub(crate) fn conflicting(a: &Arc<dyn ScheduleRule>, b: &Arc<dyn ScheduleRule>) -> bool {
    if b.is_compound() && !a.is_compound() {
        b.is_conflicting(a.as_ref())
    } else {
        a.is_conflicting(b.as_ref())
    }
}

/// Leaf rule over a path-like resource key.
///
/// `a/b` is contained by `a`; two rules conflict when either contains the
/// other. Useful as-is for tree-shaped resources and in tests.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct NamedRule {
    key: Arc<str>,
}

impl NamedRule {
    pub fn new(key: impl AsRef<str>) -> Arc<dyn ScheduleRule> {
        Arc::new(Self {
            key: Arc::from(key.as_ref()),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn covers(&self, other: &NamedRule) -> bool {
        other.key.as_ref() == self.key.as_ref()
            || (other.key.len() > self.key.len()
                && other.key.starts_with(self.key.as_ref())
                && other.key.as_bytes()[self.key.len()] == b'/')
    }
}

impl fmt::Debug for NamedRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NamedRule({})", self.key)
    }
}

impl ScheduleRule for NamedRule {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn contains(&self, other: &dyn ScheduleRule) -> bool {
        match other.as_any().downcast_ref::<NamedRule>() {
            Some(o) => self.covers(o),
            None => false,
        }
    }

    fn is_conflicting(&self, other: &dyn ScheduleRule) -> bool {
        match other.as_any().downcast_ref::<NamedRule>() {
            Some(o) => self.covers(o) || o.covers(self),
            None => false,
        }
    }
}

/// Compound rule combining several child rules.
///
/// Conflicts when any child conflicts; contains `other` when every piece of
/// `other` is contained by some child.
#[derive(Clone)]
pub struct MultiRule {
    children: Vec<Arc<dyn ScheduleRule>>,
}

impl MultiRule {
    pub fn new(children: Vec<Arc<dyn ScheduleRule>>) -> Arc<dyn ScheduleRule> {
        Arc::new(Self { children })
    }

    /// Flattening combine: nested `MultiRule`s are merged rather than stacked.
    pub fn combine(a: Arc<dyn ScheduleRule>, b: Arc<dyn ScheduleRule>) -> Arc<dyn ScheduleRule> {
        let mut children = Vec::new();
        for r in [a, b] {
            match r.as_any().downcast_ref::<MultiRule>() {
                Some(m) => children.extend(m.children.iter().cloned()),
                None => children.push(r),
            }
        }
        Arc::new(Self { children })
    }

    pub fn children(&self) -> &[Arc<dyn ScheduleRule>] {
        &self.children
    }
}

impl fmt::Debug for MultiRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MultiRule").field(&self.children).finish()
    }
}

impl ScheduleRule for MultiRule {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn contains(&self, other: &dyn ScheduleRule) -> bool {
        match other.as_any().downcast_ref::<MultiRule>() {
            Some(m) => m
                .children
                .iter()
                .all(|oc| self.children.iter().any(|c| c.contains(oc.as_ref()))),
            None => self.children.iter().any(|c| c.contains(other)),
        }
    }

    fn is_conflicting(&self, other: &dyn ScheduleRule) -> bool {
        match other.as_any().downcast_ref::<MultiRule>() {
            Some(m) => self
                .children
                .iter()
                .any(|c| m.children.iter().any(|oc| c.is_conflicting(oc.as_ref()))),
            None => self.children.iter().any(|c| c.is_conflicting(other)),
        }
    }

    fn is_compound(&self) -> bool {
        true
    }
}
