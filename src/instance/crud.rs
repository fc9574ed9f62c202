//! Instance CRUD operations and operator requests.

use super::types::{Instance, InstanceAction, InstanceStatus, StateTable};
use super::InstanceRuntime;
use crate::config::AppConfig;
use crate::error::{AppError, Result};
use crate::paths::get_instance_dir;
use crate::store::FleetStore;
use crate::validation::{validate_host_id, validate_instance_id, validate_version_tag};

/// Create a new instance on `host_id`. It starts out idle.
pub fn create_instance(
    store: &dyn FleetStore,
    config: &AppConfig,
    host_id: &str,
    name: &str,
    version: &str,
) -> Result<Instance> {
    validate_host_id(host_id)?;
    validate_version_tag(version)?;
    config.ensure_version_installed(version)?;
    let host = store.host(host_id)?;

    let id = uuid::Uuid::new_v4().to_string();
    let location = get_instance_dir(&host.base_dir, &id);
    std::fs::create_dir_all(&location)
        .map_err(|e| AppError::io(format!("Failed to create instance dir: {}", e)))?;

    let instance = Instance {
        id,
        host_id: host.id,
        name: name.to_string(),
        location,
        version: version.to_string(),
        runtime: InstanceRuntime::default(),
    };
    store.upsert_instance(instance.clone())?;
    log::info!("Created instance {} ({})", instance.name, instance.id);
    Ok(instance)
}

/// Delete an instance that is not running.
pub fn delete_instance(store: &dyn FleetStore, table: &StateTable, instance_id: &str) -> Result<()> {
    validate_instance_id(instance_id)?;

    let instance = store.instance(instance_id)?;
    if table.is_active(instance.runtime.state())? {
        return Err(AppError::illegal_state(format!(
            "Instance {} is {}",
            instance_id,
            instance.runtime.state()
        )));
    }

    let instance = store.remove_instance(instance_id)?;
    if instance.location.exists() {
        if let Err(e) = std::fs::remove_dir_all(&instance.location) {
            log::warn!(
                "Failed to remove instance directory {:?}: {}",
                instance.location,
                e
            );
        }
    }
    log::info!("Deleted instance {} ({})", instance.name, instance.id);
    Ok(())
}

pub fn list_instances(
    store: &dyn FleetStore,
    table: &StateTable,
    host_id: &str,
) -> Result<Vec<InstanceStatus>> {
    store
        .instances_for_host(host_id)?
        .into_iter()
        .map(|instance| {
            let state = instance.runtime.state().clone();
            Ok(InstanceStatus {
                active: table.is_active(&state)?,
                id: instance.id,
                name: instance.name,
                state,
                pending_action: instance.runtime.pending_action().cloned(),
                current_action: instance.runtime.current_action().cloned(),
                version: instance.version,
            })
        })
        .collect()
}

/// Queue `action` for the orchestrator, replacing any action not yet started.
pub fn request_action(
    store: &dyn FleetStore,
    instance_id: &str,
    action: InstanceAction,
) -> Result<Instance> {
    validate_instance_id(instance_id)?;
    let instance = store.update_instance(instance_id, &mut |current| {
        let mut next = current.clone();
        next.runtime = current.runtime.with_pending_action(action.clone());
        Ok(next)
    })?;
    log::info!("Queued {} for instance {}", action, instance.name);
    Ok(instance)
}

/// Answer the prompt shown under `index`. Returns the prompt text.
pub fn answer_prompt(store: &dyn FleetStore, instance_id: &str, index: u32) -> Result<String> {
    validate_instance_id(instance_id)?;
    let instance = store.update_instance(instance_id, &mut |current| {
        let mut next = current.clone();
        next.runtime = current.runtime.answer_option(index)?;
        Ok(next)
    })?;
    instance
        .runtime
        .options()
        .get(&index)
        .cloned()
        .ok_or_else(|| AppError::option_not_pending(index))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::ErrorKind;
    use crate::host::register_host;
    use crate::instance::InstanceState;
    use crate::store::JsonStore;

    struct Fixture {
        dir: tempfile::TempDir,
        store: JsonStore,
        config: AppConfig,
        host_id: String,
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
            installed_versions: vec!["v1.4.4.9".to_string()],
            ..AppConfig::default()
        };
        Fixture {
            dir,
            store,
            config,
            host_id: host.id,
        }
    }

    fn set_state(store: &JsonStore, id: &str, state: &str) {
        store
            .update_instance(id, &mut |current| {
                let mut next = current.clone();
                next.runtime = current
                    .runtime
                    .with_state(InstanceState::new(state)?, &StateTable::default())?;
                Ok(next)
            })
            .unwrap();
    }

    #[test]
    fn create_places_instance_under_host_dir() {
        let f = fixture();
        let instance =
            create_instance(&f.store, &f.config, &f.host_id, "survival", "v1.4.4.9").unwrap();
        assert_eq!(
            instance.location,
            f.dir.path().join("host").join("instances").join(&instance.id)
        );
        assert!(instance.location.is_dir());
        assert_eq!(instance.runtime.state().as_str(), "IDLE");
        assert_eq!(f.store.instance(&instance.id).unwrap(), instance);
    }

    #[test]
    fn create_checks_version_and_host() {
        let f = fixture();
        let err = create_instance(&f.store, &f.config, &f.host_id, "x", "v9").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::VersionNotFound);

        let unknown = uuid::Uuid::new_v4().to_string();
        let err = create_instance(&f.store, &f.config, &unknown, "x", "v1.4.4.9").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HostNotFound);

        let err = create_instance(&f.store, &f.config, "nope", "x", "v1.4.4.9").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Other);
    }

    #[test]
    fn delete_refuses_active_instance() {
        let f = fixture();
        let instance =
            create_instance(&f.store, &f.config, &f.host_id, "survival", "v1.4.4.9").unwrap();
        let table = StateTable::default();

        set_state(&f.store, &instance.id, "RUNNING");
        let err = delete_instance(&f.store, &table, &instance.id).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalState);

        set_state(&f.store, &instance.id, "CRASHED");
        delete_instance(&f.store, &table, &instance.id).unwrap();
        assert!(!instance.location.exists());
        assert!(list_instances(&f.store, &table, &f.host_id).unwrap().is_empty());
    }

    #[test]
    fn request_replaces_pending_action() {
        let f = fixture();
        let instance =
            create_instance(&f.store, &f.config, &f.host_id, "survival", "v1.4.4.9").unwrap();
        request_action(&f.store, &instance.id, InstanceAction::Boot).unwrap();
        request_action(&f.store, &instance.id, InstanceAction::Kill).unwrap();

        let statuses = list_instances(&f.store, &StateTable::default(), &f.host_id).unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].pending_action, Some(InstanceAction::Kill));
        assert!(!statuses[0].active);
    }

    #[test]
    fn answer_prompt_returns_text_once() {
        let f = fixture();
        let instance =
            create_instance(&f.store, &f.config, &f.host_id, "survival", "v1.4.4.9").unwrap();
        f.store
            .update_instance(&instance.id, &mut |current| {
                let mut next = current.clone();
                next.runtime = current.runtime.acknowledge_menu_option(2, "World B");
                Ok(next)
            })
            .unwrap();

        assert_eq!(answer_prompt(&f.store, &instance.id, 2).unwrap(), "World B");
        let err = answer_prompt(&f.store, &instance.id, 2).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OptionNotPending);
    }
}
