//! Game server instances.
//!
//! - `types`: state names, the state table, actions and the instance record
//! - `state`: the immutable per-instance runtime snapshot and its transitions
//! - `console`: incremental reading of the live output file
//! - `crud` / `lifecycle`: operator requests and session-driving operations

mod console;
mod crud;
mod lifecycle;
mod state;
mod types;

// Re-export types
pub use state::InstanceRuntime;
pub use types::{session_name, Instance, InstanceAction, InstanceState, InstanceStatus, StateTable};

pub use console::{latest_archive, parse_menu_option, OutputCursor};

// Re-export CRUD operations
pub use crud::{answer_prompt, create_instance, delete_instance, list_instances, request_action};

// Re-export lifecycle
pub use lifecycle::{boot_instance, kill_instance, send_command, shutdown_instance};
