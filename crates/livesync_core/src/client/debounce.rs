//! Debounce state machine for client refreshes.
//!
//! # Responsibility
//! - Accumulate prop names from inbound markers into one pending batch.
//! - Decide when the batch is due.
//!
//! # Invariants
//! - At most one pending batch exists per state value.
//! - Every marker pushes the deadline to `now + window` (trailing edge).
//! - Transitions are pure: no clocks, timers or callbacks in here.

use std::collections::BTreeSet;

/// Default coalescing window.
pub const DEFAULT_DEBOUNCE_WINDOW_MS: u64 = 300;

/// Runtime knobs of the client reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilerConfig {
    pub debounce_window_ms: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            debounce_window_ms: DEFAULT_DEBOUNCE_WINDOW_MS,
        }
    }
}

/// `Idle` or one pending batch with its flush deadline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DebounceState {
    #[default]
    Idle,
    Pending {
        props: BTreeSet<String>,
        deadline_ms: u64,
    },
}

impl DebounceState {
    /// Adds `props` to the batch and restarts the window at `now_ms`.
    pub fn on_marker<I>(self, props: I, now_ms: u64, window_ms: u64) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let mut accumulated = match self {
            Self::Idle => BTreeSet::new(),
            Self::Pending { props, .. } => props,
        };
        accumulated.extend(props);
        if accumulated.is_empty() {
            return Self::Idle;
        }
        Self::Pending {
            props: accumulated,
            deadline_ms: now_ms.saturating_add(window_ms),
        }
    }

    /// Fires the timer at `now_ms`.
    ///
    /// Returns the batch to flush when the deadline has passed; otherwise the
    /// state is returned unchanged with `None`.
    pub fn on_timer(self, now_ms: u64) -> (Self, Option<BTreeSet<String>>) {
        match self {
            Self::Pending { props, deadline_ms } if now_ms >= deadline_ms => {
                (Self::Idle, Some(props))
            }
            other => (other, None),
        }
    }

    pub fn deadline_ms(&self) -> Option<u64> {
        match self {
            Self::Idle => None,
            Self::Pending { deadline_ms, .. } => Some(*deadline_ms),
        }
    }

    pub fn pending_props(&self) -> Option<&BTreeSet<String>> {
        match self {
            Self::Idle => None,
            Self::Pending { props, .. } => Some(props),
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }
}
