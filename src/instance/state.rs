//! Per-instance lifecycle bookkeeping.
//!
//! [`InstanceRuntime`] is an immutable snapshot: every transition borrows the
//! current value and returns a new one, so a failed transition leaves the
//! caller's snapshot untouched and a successful one is committed whole.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::{InstanceAction, InstanceState, StateTable};
use crate::error::{AppError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRuntime {
    state: InstanceState,
    #[serde(default)]
    pending_action: Option<InstanceAction>,
    #[serde(default)]
    current_action: Option<InstanceAction>,
    #[serde(default)]
    action_started_at: Option<DateTime<Utc>>,
    /// Prompts the process is currently asking, by menu index.
    #[serde(default)]
    pending_options: BTreeMap<u32, String>,
    /// Prompts that have been answered, by menu index.
    #[serde(default)]
    options: BTreeMap<u32, String>,
}

impl Default for InstanceRuntime {
    fn default() -> Self {
        Self::new(InstanceState::idle())
    }
}

impl InstanceRuntime {
    pub fn new(state: InstanceState) -> Self {
        Self {
            state,
            pending_action: None,
            current_action: None,
            action_started_at: None,
            pending_options: BTreeMap::new(),
            options: BTreeMap::new(),
        }
    }

    pub fn state(&self) -> &InstanceState {
        &self.state
    }

    pub fn pending_action(&self) -> Option<&InstanceAction> {
        self.pending_action.as_ref()
    }

    pub fn current_action(&self) -> Option<&InstanceAction> {
        self.current_action.as_ref()
    }

    pub fn action_started_at(&self) -> Option<DateTime<Utc>> {
        self.action_started_at
    }

    pub fn pending_options(&self) -> &BTreeMap<u32, String> {
        &self.pending_options
    }

    pub fn options(&self) -> &BTreeMap<u32, String> {
        &self.options
    }

    /// Move to `state`. Entering an inactive state drops every prompt and
    /// answer; re-entering the current state changes nothing.
    pub fn with_state(&self, state: InstanceState, table: &StateTable) -> Result<Self> {
        if state == self.state {
            return Ok(self.clone());
        }
        let inactive = table.is_inactive(&state)?;

        let mut next = self.clone();
        next.state = state;
        if inactive {
            next.pending_options.clear();
            next.options.clear();
        }
        Ok(next)
    }

    /// Queue `action`, replacing any action queued earlier.
    pub fn with_pending_action(&self, action: InstanceAction) -> Self {
        let mut next = self.clone();
        next.pending_action = Some(action);
        next
    }

    /// Promote the pending action to the current one.
    pub fn start_action(&self, now: DateTime<Utc>) -> Result<Self> {
        let Some(action) = self.pending_action.clone() else {
            return Err(AppError::illegal_state("No pending action to start"));
        };

        let mut next = self.clone();
        next.pending_action = None;
        next.current_action = Some(action);
        next.action_started_at = Some(now);
        Ok(next)
    }

    pub fn complete_action(&self) -> Self {
        let mut next = self.clone();
        next.current_action = None;
        next.action_started_at = None;
        next
    }

    /// Record a prompt the process emitted under menu `index`.
    pub fn acknowledge_menu_option(&self, index: u32, text: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.pending_options.insert(index, text.into());
        next
    }

    /// Answer the prompt under `index`, moving it from the pending prompts to
    /// the answered ones.
    pub fn answer_option(&self, index: u32) -> Result<Self> {
        let mut next = self.clone();
        let text = next
            .pending_options
            .remove(&index)
            .ok_or_else(|| AppError::option_not_pending(index))?;
        next.options.insert(index, text);
        Ok(next)
    }
}
