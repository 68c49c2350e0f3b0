//! Generic reconciliation unit.
//!
//! A resource node computes its observed `state` and desired `plan`,
//! diffs them and converges by creating or deleting its backend object.
//! Nodes form a tree: each one owns its dependent sibling nodes by value and
//! hands them only resolved scalars (names, addresses, endpoints).
//!
//! Concrete node types implement [`Reconcile`]; the tree-wide operations
//! live on the object-safe [`Node`] trait, implemented for every
//! `Reconcile` type.

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use crate::diff::Diff;
use crate::error::Result;
use crate::report::{Action, Inspection, Outcome, View};

// =============================================================================
// Memo
// =============================================================================

/// Explicit memoization cell.
///
/// `Empty` means "not computed yet"; a cached empty value (for example
/// `Cached(None)` for an absent backend object) is a valid result.
#[derive(Debug, Clone)]
pub enum Memo<T> {
    Empty,
    Cached(T),
}

impl<T> Default for Memo<T> {
    fn default() -> Self {
        Memo::Empty
    }
}

impl<T> Memo<T> {
    pub fn get(&self) -> Option<&T> {
        match self {
            Memo::Empty => None,
            Memo::Cached(value) => Some(value),
        }
    }

    pub fn set(&mut self, value: T) {
        *self = Memo::Cached(value);
    }

    /// Move the cached value out, leaving the cell empty.
    pub fn take(&mut self) -> Option<T> {
        match std::mem::take(self) {
            Memo::Empty => None,
            Memo::Cached(value) => Some(value),
        }
    }

    pub fn invalidate(&mut self) {
        *self = Memo::Empty;
    }

    pub fn is_cached(&self) -> bool {
        matches!(self, Memo::Cached(_))
    }
}

/// Dependent children of a node, in apply order.
pub type Siblings = Vec<(String, Box<dyn Node>)>;

/// Per-instance caches of a node.
pub struct Cells<M> {
    pub(crate) state: Memo<Option<M>>,
    pub(crate) plan: Memo<M>,
    pub(crate) diff: Memo<Diff>,
    pub(crate) siblings: Memo<Siblings>,
}

impl<M> Default for Cells<M> {
    fn default() -> Self {
        Self {
            state: Memo::Empty,
            plan: Memo::Empty,
            diff: Memo::Empty,
            siblings: Memo::Empty,
        }
    }
}

/// How a node's backend object depends on its siblings' objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiblingOrder {
    /// The parent owns its children: patch the parent, then the children if
    /// it converged; delete the children, then the parent.
    ParentFirst,
    /// The parent's object points at its children's objects: patch the
    /// children, then the parent if all of them converged; delete the parent,
    /// then the children if it went away.
    ChildrenFirst,
}

// =============================================================================
// Reconcile
// =============================================================================

/// A concrete resource type.
#[async_trait]
pub trait Reconcile: Send + Sync {
    /// Shape shared by plan and state so they can be diffed.
    type Model: Serialize + Clone + PartialEq + fmt::Debug + Send + Sync;

    /// Type name used in reports.
    fn kind(&self) -> &'static str;

    fn name(&self) -> &str;

    fn order(&self) -> SiblingOrder {
        SiblingOrder::ParentFirst
    }

    fn cells(&mut self) -> &mut Cells<Self::Model>;

    /// Fetch the current model; `None` when the object is absent.
    async fn observe(&mut self) -> Result<Option<Self::Model>>;

    /// Compute the desired model.
    async fn desire(&mut self) -> Result<Self::Model>;

    fn validate_plan(&self, plan: &Self::Model) -> bool;

    fn validate_state(&self, _state: Option<&Self::Model>) -> bool {
        true
    }

    async fn create(&mut self) -> Result<bool>;

    async fn delete(&mut self) -> Result<bool>;

    async fn build_siblings(&mut self) -> Result<Siblings> {
        Ok(Vec::new())
    }

    async fn state(&mut self) -> Result<Option<Self::Model>> {
        if let Some(state) = self.cells().state.get() {
            return Ok(state.clone());
        }
        let state = self.observe().await?;
        self.cells().state.set(state.clone());
        Ok(state)
    }

    async fn plan(&mut self) -> Result<Self::Model> {
        if let Some(plan) = self.cells().plan.get() {
            return Ok(plan.clone());
        }
        let plan = self.desire().await?;
        self.cells().plan.set(plan.clone());
        Ok(plan)
    }

    async fn diff(&mut self) -> Result<Diff> {
        if let Some(diff) = self.cells().diff.get() {
            return Ok(diff.clone());
        }
        let state = self.state().await?;
        let plan = self.plan().await?;
        let diff = Diff::between(&state, &plan)?;
        self.cells().diff.set(diff.clone());
        Ok(diff)
    }

    /// Plan and state both validate.
    async fn is_good(&mut self) -> Result<bool> {
        let plan = self.plan().await?;
        let state = self.state().await?;
        Ok(self.validate_plan(&plan) && self.validate_state(state.as_ref()))
    }

    /// Drop cached state after a backend mutation.
    fn forget_state(&mut self) {
        let cells = self.cells();
        cells.state.invalidate();
        cells.diff.invalidate();
    }

    /// Re-read the object after a name collision and accept it when it
    /// already matches the plan.
    async fn accept_existing(&mut self) -> Result<bool> {
        self.forget_state();
        let state = self.state().await?;
        let plan = self.plan().await?;
        if state.as_ref() == Some(&plan) {
            info!(kind = self.kind(), name = self.name(), "already exists as planned");
            Ok(true)
        } else {
            warn!(
                kind = self.kind(),
                name = self.name(),
                state = ?state,
                "already exists with different attributes"
            );
            Ok(false)
        }
    }

    /// Converge this node alone: no-op without a diff, otherwise replace the
    /// current object (if any) with the planned one.
    async fn patch(&mut self) -> Result<bool> {
        if !self.is_good().await? {
            return Ok(false);
        }

        let diff = self.diff().await?;
        if diff.is_empty() {
            info!(kind = self.kind(), name = self.name(), "no diff");
            return Ok(true);
        }

        if self.state().await?.is_some() {
            info!(kind = self.kind(), name = self.name(), changes = %diff, "replacing");
            if !self.delete().await? {
                warn!(kind = self.kind(), name = self.name(), "delete failed, not recreating");
                return Ok(false);
            }
        }
        self.create().await
    }
}

// =============================================================================
// Node
// =============================================================================

/// Tree-wide operations on a node and everything below it.
#[async_trait]
pub trait Node: Send + Sync {
    async fn global_patch(&mut self) -> Result<Outcome>;

    async fn global_delete(&mut self) -> Result<Outcome>;

    async fn global_plan(&mut self) -> Result<Inspection>;

    async fn global_state(&mut self) -> Result<Inspection>;

    async fn global_diff(&mut self) -> Result<Inspection>;
}

#[async_trait]
impl<T: Reconcile> Node for T {
    async fn global_patch(&mut self) -> Result<Outcome> {
        let kind = Reconcile::kind(self);
        let (patched, siblings) = match self.order() {
            SiblingOrder::ParentFirst => {
                let patched = self.patch().await?;
                let siblings = if patched {
                    apply_siblings(self, Action::Patch).await?
                } else {
                    Vec::new()
                };
                (patched, siblings)
            }
            SiblingOrder::ChildrenFirst => {
                let siblings = apply_siblings(self, Action::Patch).await?;
                let patched = if siblings.iter().all(|(_, s)| s.is_success()) {
                    self.patch().await?
                } else {
                    warn!(kind, name = Reconcile::name(self), "siblings did not converge, skipping");
                    false
                };
                (patched, siblings)
            }
        };
        Ok(Outcome::patched(kind, patched, siblings))
    }

    async fn global_delete(&mut self) -> Result<Outcome> {
        let kind = Reconcile::kind(self);
        let (deleted, siblings) = match self.order() {
            SiblingOrder::ParentFirst => {
                let siblings = apply_siblings(self, Action::Delete).await?;
                let deleted = self.delete().await?;
                (deleted, siblings)
            }
            SiblingOrder::ChildrenFirst => {
                let deleted = self.delete().await?;
                let siblings = if deleted {
                    apply_siblings(self, Action::Delete).await?
                } else {
                    Vec::new()
                };
                (deleted, siblings)
            }
        };
        Ok(Outcome::deleted(kind, deleted, siblings))
    }

    async fn global_plan(&mut self) -> Result<Inspection> {
        let plan = self.plan().await?;
        let is_valid = self.validate_plan(&plan);
        let siblings = inspect_siblings(self, View::Plan).await?;
        Ok(Inspection {
            kind: Reconcile::kind(self),
            view: View::Plan,
            body: serde_json::to_value(&plan)?,
            is_valid: Some(is_valid),
            siblings,
        })
    }

    async fn global_state(&mut self) -> Result<Inspection> {
        let state = self.state().await?;
        let is_valid = self.validate_state(state.as_ref());
        let siblings = inspect_siblings(self, View::State).await?;
        Ok(Inspection {
            kind: Reconcile::kind(self),
            view: View::State,
            body: serde_json::to_value(&state)?,
            is_valid: Some(is_valid),
            siblings,
        })
    }

    async fn global_diff(&mut self) -> Result<Inspection> {
        let diff = self.diff().await?;
        let siblings = inspect_siblings(self, View::Diff).await?;
        Ok(Inspection {
            kind: Reconcile::kind(self),
            view: View::Diff,
            body: serde_json::to_value(&diff)?,
            is_valid: None,
            siblings,
        })
    }
}

async fn take_siblings<T: Reconcile>(node: &mut T) -> Result<Siblings> {
    match node.cells().siblings.take() {
        Some(siblings) => Ok(siblings),
        None => node.build_siblings().await,
    }
}

/// Run a tree operation on every sibling in order. Siblings go back into
/// the node's cache even when one of them fails.
async fn apply_siblings<T: Reconcile>(node: &mut T, action: Action) -> Result<Vec<(String, Outcome)>> {
    let mut siblings = take_siblings(node).await?;
    let mut outcomes = Vec::with_capacity(siblings.len());
    let mut failure = None;

    for (name, sibling) in siblings.iter_mut() {
        let result = match action {
            Action::Patch => sibling.global_patch().await,
            Action::Delete => sibling.global_delete().await,
        };
        match result {
            Ok(outcome) => outcomes.push((name.clone(), outcome)),
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }

    node.cells().siblings.set(siblings);
    match failure {
        Some(e) => Err(e),
        None => Ok(outcomes),
    }
}

async fn inspect_siblings<T: Reconcile>(node: &mut T, view: View) -> Result<Vec<(String, Inspection)>> {
    let mut siblings = take_siblings(node).await?;
    let mut inspections = Vec::with_capacity(siblings.len());
    let mut failure = None;

    for (name, sibling) in siblings.iter_mut() {
        let result = match view {
            View::Plan => sibling.global_plan().await,
            View::State => sibling.global_state().await,
            View::Diff => sibling.global_diff().await,
        };
        match result {
            Ok(inspection) => inspections.push((name.clone(), inspection)),
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }

    node.cells().siblings.set(siblings);
    match failure {
        Some(e) => Err(e),
        None => Ok(inspections),
    }
}
