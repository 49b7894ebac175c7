//! Reconciliation loop primitives.
//!
//! This library provides helpers for implementing reconciliation passes
//! that converge observed state to desired state. Key concepts:
//!
//! - **Desired state**: Which keys should be running (from the version catalog).
//! - **Observed state**: What the instance pool actually holds.
//! - **Plan**: The ordered list of actions that moves observed toward desired.
//!
//! # Invariants
//!
//! - Planning is pure and deterministic given the same inputs
//! - A converged input produces only `NoOp` actions
//! - `Create` actions are always ordered before `Destroy` actions

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

/// Lifecycle state of a supervised instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// Source is being materialized; no process yet.
    Pulling,

    /// Run commands are executing.
    Running,

    /// Terminal.
    Stopped,
}

impl LifecycleState {
    /// Returns true for states that will (or already do) serve traffic.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Pulling | Self::Running)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pulling => "pulling",
            Self::Running => "running",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// What a reconciliation pass wants for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DesiredState {
    Running,
    Stopped,
}

impl fmt::Display for DesiredState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => f.write_str("running"),
            Self::Stopped => f.write_str("stopped"),
        }
    }
}

/// Corrective action for a single key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Action {
    /// Start a new instance.
    Create,

    /// Nothing to do.
    NoOp,

    /// Stop the instance and remove it.
    Destroy,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::NoOp => "noop",
            Self::Destroy => "destroy",
        };
        f.write_str(s)
    }
}

/// One entry of a reconciliation plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedAction<K> {
    pub key: K,
    pub desired: DesiredState,
    /// `None` when no instance exists for the key.
    pub current: Option<LifecycleState>,
    pub action: Action,
}

/// Decide the action for one key.
///
/// An absent or `Stopped` instance counts as not running, so a desired
/// `Running` key with a dead instance is re-created.
pub fn decide(desired: DesiredState, current: Option<LifecycleState>) -> Action {
    match (desired, current) {
        (DesiredState::Running, Some(state)) if state.is_live() => Action::NoOp,
        (DesiredState::Running, _) => Action::Create,
        (DesiredState::Stopped, Some(_)) => Action::Destroy,
        (DesiredState::Stopped, None) => Action::NoOp,
    }
}

/// Diff desired against observed state.
///
/// Keys missing from `desired` are treated as `Stopped`. The result covers
/// the union of both key sets, creates first, then no-ops, then destroys,
/// each group in key order.
pub fn plan<K>(
    desired: &BTreeMap<K, DesiredState>,
    observed: &BTreeMap<K, LifecycleState>,
) -> Vec<PlannedAction<K>>
where
    K: Ord + Clone,
{
    let keys: BTreeSet<&K> = desired.keys().chain(observed.keys()).collect();

    let mut actions: Vec<PlannedAction<K>> = keys
        .into_iter()
        .map(|key| {
            let want = desired.get(key).copied().unwrap_or(DesiredState::Stopped);
            let current = observed.get(key).copied();
            PlannedAction {
                key: key.clone(),
                desired: want,
                current,
                action: decide(want, current),
            }
        })
        .collect();

    // Stable sort keeps key order inside each action group.
    actions.sort_by_key(|a| a.action);
    actions
}

/// Returns true if a plan has nothing left to do.
pub fn is_converged<K>(actions: &[PlannedAction<K>]) -> bool {
    actions.iter().all(|a| a.action == Action::NoOp)
}

/// Default interval between periodic catalog refresh + reconcile passes.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(60);
