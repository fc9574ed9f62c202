//! Instance-related type definitions.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::state::InstanceRuntime;
use crate::error::{AppError, Result};

/// Name of a lifecycle state, e.g. `IDLE` or `BOOTING_UP`.
///
/// Which names exist, and whether each is active or inactive, is decided by
/// the [`StateTable`] in the config rather than by this type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InstanceState(String);

impl InstanceState {
    pub const IDLE: &'static str = "IDLE";
    pub const CRASHED: &'static str = "CRASHED";
    pub const BOOTING_UP: &'static str = "BOOTING_UP";
    pub const RUNNING: &'static str = "RUNNING";
    pub const SHUTTING_DOWN: &'static str = "SHUTTING_DOWN";

    pub fn new(name: &str) -> Result<Self> {
        let is_valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_');
        if !is_valid {
            return Err(AppError::unknown_state(name));
        }
        Ok(Self(name.to_string()))
    }

    /// Build one of the well-known names above.
    pub(crate) fn known(name: &'static str) -> Self {
        Self(name.to_string())
    }

    pub fn idle() -> Self {
        Self::known(Self::IDLE)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for InstanceState {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(&value)
    }
}

impl From<InstanceState> for String {
    fn from(state: InstanceState) -> Self {
        state.0
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Explicit classification of every known lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTable {
    pub active: Vec<InstanceState>,
    pub inactive: Vec<InstanceState>,
}

impl Default for StateTable {
    fn default() -> Self {
        Self {
            active: vec![
                InstanceState::known(InstanceState::BOOTING_UP),
                InstanceState::known(InstanceState::RUNNING),
                InstanceState::known(InstanceState::SHUTTING_DOWN),
            ],
            inactive: vec![
                InstanceState::known(InstanceState::IDLE),
                InstanceState::known(InstanceState::CRASHED),
            ],
        }
    }
}

impl StateTable {
    /// Whether `state` is inactive. Unlisted states are an error.
    pub fn is_inactive(&self, state: &InstanceState) -> Result<bool> {
        if self.inactive.contains(state) {
            Ok(true)
        } else if self.active.contains(state) {
            Ok(false)
        } else {
            Err(AppError::unknown_state(state.as_str()))
        }
    }

    pub fn is_active(&self, state: &InstanceState) -> Result<bool> {
        self.is_inactive(state).map(|inactive| !inactive)
    }

    /// Reject tables that list a state twice or that lack the states the
    /// orchestrator itself moves instances through.
    pub fn check(&self) -> Result<()> {
        if let Some(both) = self.active.iter().find(|s| self.inactive.contains(s)) {
            return Err(AppError::config(format!(
                "State {both} is listed as both active and inactive"
            )));
        }

        let required = [
            (InstanceState::IDLE, false),
            (InstanceState::CRASHED, false),
            (InstanceState::BOOTING_UP, true),
            (InstanceState::RUNNING, true),
            (InstanceState::SHUTTING_DOWN, true),
        ];
        for (name, active) in required {
            let state = InstanceState::known(name);
            let listed = if active {
                self.active.contains(&state)
            } else {
                self.inactive.contains(&state)
            };
            if !listed {
                return Err(AppError::config(format!(
                    "State table must list {name} as {}",
                    if active { "active" } else { "inactive" }
                )));
            }
        }
        Ok(())
    }
}

/// An action an instance can be asked to perform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "arg", rename_all = "snake_case")]
pub enum InstanceAction {
    Boot,
    Shutdown,
    Kill,
    SendCommand(String),
    ScanWorlds,
}

impl fmt::Display for InstanceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Boot => f.write_str("boot"),
            Self::Shutdown => f.write_str("shutdown"),
            Self::Kill => f.write_str("kill"),
            Self::SendCommand(text) => write!(f, "send_command({text:?})"),
            Self::ScanWorlds => f.write_str("scan_worlds"),
        }
    }
}

/// One managed server definition and its run state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub host_id: String,
    pub name: String,
    pub location: PathBuf,
    pub version: String,
    pub runtime: InstanceRuntime,
}

impl Instance {
    /// Multiplexer session the instance runs in. Derived from the identity so
    /// concurrently running loops never share a session.
    pub fn session_name(&self) -> String {
        session_name(&self.id)
    }
}

pub fn session_name(instance_id: &str) -> String {
    format!("fk-{instance_id}")
}

/// Status information for an instance.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatus {
    pub id: String,
    pub name: String,
    pub state: InstanceState,
    pub active: bool,
    pub pending_action: Option<InstanceAction>,
    pub current_action: Option<InstanceAction>,
    pub version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(name: &str) -> InstanceState {
        InstanceState::new(name).unwrap()
    }

    #[test]
    fn state_names_are_upper_snake_case() {
        assert!(InstanceState::new("BOOTING_UP").is_ok());
        assert!(InstanceState::new("booting").is_err());
        assert!(InstanceState::new("").is_err());
        assert!(serde_json::from_str::<InstanceState>("\"idle\"").is_err());
    }

    #[test]
    fn default_table_classifies_known_states() {
        let table = StateTable::default();
        assert!(table.check().is_ok());
        assert!(table.is_inactive(&state("IDLE")).unwrap());
        assert!(table.is_active(&state("BOOTING_UP")).unwrap());
        assert!(table.is_inactive(&state("CRASHED")).unwrap());
    }

    #[test]
    fn unlisted_state_is_an_error() {
        let err = StateTable::default()
            .is_inactive(&state("SAVING"))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::UnknownState);
    }

    #[test]
    fn check_rejects_overlap_and_missing_states() {
        let mut table = StateTable::default();
        table.active.push(state("IDLE"));
        assert!(table.check().is_err());

        let mut table = StateTable::default();
        table.active.retain(|s| s.as_str() != "RUNNING");
        assert!(table.check().is_err());
    }

    #[test]
    fn actions_serialize_with_tag() {
        let json = serde_json::to_string(&InstanceAction::SendCommand("save".into())).unwrap();
        assert_eq!(json, r#"{"type":"send_command","arg":"save"}"#);
        let boot: InstanceAction = serde_json::from_str(r#"{"type":"boot"}"#).unwrap();
        assert_eq!(boot, InstanceAction::Boot);
    }

    #[test]
    fn session_name_derives_from_id() {
        assert_eq!(session_name("abc"), "fk-abc");
    }
}
