//! Command-line surface: the `serve` daemon and one-shot operator commands.
//!
//! Operator commands talk to the same store file as a running daemon; the
//! daemon picks their changes up on its next tick.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::{json, Value};

use crate::config::{load_config, AppConfig};
use crate::error::{AppError, Result};
use crate::host::list_hosts;
use crate::instance::{
    answer_prompt, create_instance, delete_instance, list_instances, request_action,
    InstanceAction,
};
use crate::paths;
use crate::store::{FleetStore, JsonStore};

#[derive(Debug, Parser)]
#[command(name = "fleetkeeper", about = "Orchestrates dedicated game-server instances")]
pub struct Cli {
    /// Data directory (defaults to ~/.fleetkeeper).
    #[arg(long = "home", value_name = "DIR", global = true)]
    pub home: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the orchestrator for the local host (the default).
    Serve,
    /// List registered hosts and their liveness.
    Hosts,
    /// List the instances of a host.
    List {
        /// Host id; the local host when omitted.
        #[arg(long = "host", value_name = "ID")]
        host: Option<String>,
    },
    /// Create an idle instance.
    Create {
        name: String,
        version: String,
        #[arg(long = "host", value_name = "ID")]
        host: Option<String>,
    },
    /// Delete an instance that is not running.
    Delete { id: String },
    /// Queue an action for the orchestrator.
    Request {
        id: String,
        #[command(subcommand)]
        action: ActionArg,
    },
    /// Answer the prompt shown under a menu index.
    Answer { id: String, index: u32 },
}

#[derive(Debug, Subcommand)]
pub enum ActionArg {
    Boot,
    Shutdown,
    Kill,
    /// Type a console command into the server.
    Send { text: String },
    ScanWorlds,
}

impl From<ActionArg> for InstanceAction {
    fn from(action: ActionArg) -> Self {
        match action {
            ActionArg::Boot => Self::Boot,
            ActionArg::Shutdown => Self::Shutdown,
            ActionArg::Kill => Self::Kill,
            ActionArg::Send { text } => Self::SendCommand(text),
            ActionArg::ScanWorlds => Self::ScanWorlds,
        }
    }
}

/// Run one operator command against the store in the data directory and
/// print its result as JSON.
pub fn run_operator_command(command: Command) -> Result<()> {
    paths::ensure_data_dirs()?;
    let config = load_config()?;
    let store = JsonStore::open(paths::store_path())?;
    let output = execute(&store, &config, command)?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

pub fn execute(store: &dyn FleetStore, config: &AppConfig, command: Command) -> Result<Value> {
    let value = match command {
        Command::Serve => {
            return Err(AppError::illegal_state("serve is not an operator command"));
        }
        Command::Hosts => serde_json::to_value(list_hosts(store)?)?,
        Command::List { host } => {
            let host_id = resolve_host(config, host)?;
            serde_json::to_value(list_instances(store, &config.state_table, &host_id)?)?
        }
        Command::Create {
            name,
            version,
            host,
        } => {
            let host_id = resolve_host(config, host)?;
            serde_json::to_value(create_instance(store, config, &host_id, &name, &version)?)?
        }
        Command::Delete { id } => {
            delete_instance(store, &config.state_table, &id)?;
            json!({ "deleted": id })
        }
        Command::Request { id, action } => {
            let instance = request_action(store, &id, action.into())?;
            json!({
                "id": instance.id,
                "pending_action": instance.runtime.pending_action(),
            })
        }
        Command::Answer { id, index } => {
            let text = answer_prompt(store, &id, index)?;
            json!({ "id": id, "index": index, "answer": text })
        }
    };
    Ok(value)
}

fn resolve_host(config: &AppConfig, host: Option<String>) -> Result<String> {
    host.or_else(|| config.host_id.clone()).ok_or_else(|| {
        AppError::config("No local host registered yet; run `fleetkeeper serve` or pass --host")
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::ErrorKind;
    use crate::host::register_host;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: JsonStore,
        config: AppConfig,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path().join("fleet.json")).unwrap();
        let host = register_host(
            &store,
            "node",
            "127.0.0.1",
            dir.path().join("host"),
            Duration::from_secs(30),
        )
        .unwrap();
        let config = AppConfig {
            host_id: Some(host.id),
            installed_versions: vec!["v1.4.4.9".to_string()],
            ..AppConfig::default()
        };
        Fixture {
            _dir: dir,
            store,
            config,
        }
    }

    fn parse(args: &[&str]) -> Command {
        let cli = Cli::try_parse_from(std::iter::once("fleetkeeper").chain(args.iter().copied()))
            .unwrap();
        cli.command.unwrap()
    }

    #[test]
    fn serve_is_the_default() {
        let cli = Cli::try_parse_from(["fleetkeeper", "--home", "/tmp/fk"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.home, Some(PathBuf::from("/tmp/fk")));
    }

    #[test]
    fn request_parses_action_with_argument() {
        match parse(&["request", "abc", "send", "say hi"]) {
            Command::Request { id, action } => {
                assert_eq!(id, "abc");
                assert_eq!(
                    InstanceAction::from(action),
                    InstanceAction::SendCommand("say hi".to_string())
                );
            }
            other => unreachable!("parsed {other:?}"),
        }
        assert!(Cli::try_parse_from(["fleetkeeper", "request", "abc", "reboot"]).is_err());
    }

    #[test]
    fn operator_flow_reaches_the_store() {
        let f = fixture();
        let created = execute(&f.store, &f.config, parse(&["create", "survival", "v1.4.4.9"]))
            .unwrap();
        let id = created["id"].as_str().unwrap().to_string();

        let queued = execute(&f.store, &f.config, parse(&["request", id.as_str(), "boot"])).unwrap();
        assert_eq!(queued["pending_action"]["type"], "boot");

        let listed = execute(&f.store, &f.config, parse(&["list"])).unwrap();
        assert_eq!(listed.as_array().unwrap().len(), 1);
        assert_eq!(listed[0]["name"], "survival");

        f.store
            .update_instance(&id, &mut |current| {
                let mut next = current.clone();
                next.runtime = current.runtime.acknowledge_menu_option(1, "World A");
                Ok(next)
            })
            .unwrap();
        let answered = execute(&f.store, &f.config, parse(&["answer", id.as_str(), "1"])).unwrap();
        assert_eq!(answered["answer"], "World A");

        let hosts = execute(&f.store, &f.config, parse(&["hosts"])).unwrap();
        assert_eq!(hosts[0]["host"]["name"], "node");

        execute(&f.store, &f.config, parse(&["delete", id.as_str()])).unwrap();
        let listed = execute(&f.store, &f.config, parse(&["list"])).unwrap();
        assert!(listed.as_array().unwrap().is_empty());
    }

    #[test]
    fn commands_without_local_host_need_explicit_host() {
        let f = fixture();
        let config = AppConfig {
            host_id: None,
            ..f.config.clone()
        };
        let err = execute(&f.store, &config, parse(&["list"])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);

        let err = execute(&f.store, &f.config, parse(&["serve"])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalState);
    }
}
