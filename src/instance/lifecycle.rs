//! Instance lifecycle management (boot/shutdown/kill).
//!
//! Each operation drives the instance's terminal session and returns the
//! state the instance should move to; persisting it is up to the caller.

use super::types::{Instance, InstanceState};
use crate::config::AppConfig;
use crate::error::{AppError, Result};
use crate::paths::get_output_file;
use crate::process::SessionController;

/// Start the instance's boot program in a fresh session.
pub async fn boot_instance(
    sessions: &SessionController,
    config: &AppConfig,
    instance: &Instance,
) -> Result<InstanceState> {
    let session = instance.session_name();
    if sessions.has_session(&session).await? {
        return Err(AppError::illegal_state(format!(
            "Session {} is already running",
            session
        )));
    }

    let program = instance.location.join(&config.boot_program);
    if !program.exists() {
        return Err(AppError::io(format!(
            "Boot program not found: {}",
            program.display()
        )));
    }

    let output = get_output_file(&instance.location);
    sessions.dispatch(&session, &program, &output).await?;
    log::info!("Instance {} booting in session {}", instance.name, session);
    Ok(InstanceState::known(InstanceState::BOOTING_UP))
}

/// Ask the server to exit on its own. Without a session there is nothing to
/// stop and the instance is simply idle.
pub async fn shutdown_instance(
    sessions: &SessionController,
    instance: &Instance,
) -> Result<InstanceState> {
    let session = instance.session_name();
    if !sessions.has_session(&session).await? {
        log::info!("Instance {} has no session, marking idle", instance.name);
        return Ok(InstanceState::idle());
    }

    sessions.send_input(&session, "exit\n").await?;
    log::info!("Instance {} shutting down", instance.name);
    Ok(InstanceState::known(InstanceState::SHUTTING_DOWN))
}

/// Tear the session down without waiting for the server.
pub async fn kill_instance(
    sessions: &SessionController,
    instance: &Instance,
) -> Result<InstanceState> {
    let session = instance.session_name();
    if sessions.has_session(&session).await? {
        sessions.kill(&session).await?;
        log::info!("Killed session {} of instance {}", session, instance.name);
    }
    Ok(InstanceState::idle())
}

/// Type one console command into the running server.
pub async fn send_command(
    sessions: &SessionController,
    instance: &Instance,
    command: &str,
) -> Result<()> {
    let session = instance.session_name();
    sessions.send_input(&session, &format!("{command}\n")).await
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::error::ErrorKind;
    use crate::instance::InstanceRuntime;

    fn instance(location: PathBuf) -> Instance {
        Instance {
            id: "3f2c1c1e-6d7a-4a57-9d61-2b8f1d1c0a11".to_string(),
            host_id: "host".to_string(),
            name: "survival".to_string(),
            location,
            version: "v1.4.4.9".to_string(),
            runtime: InstanceRuntime::default(),
        }
    }

    #[tokio::test]
    async fn boot_refuses_existing_session() {
        let dir = tempfile::tempdir().unwrap();
        let sessions = SessionController::new("sh", "true");
        let err = boot_instance(&sessions, &AppConfig::default(), &instance(dir.path().into()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalState);
    }

    #[tokio::test]
    async fn boot_requires_boot_program() {
        let dir = tempfile::tempdir().unwrap();
        let sessions = SessionController::new("sh", "false");
        let err = boot_instance(&sessions, &AppConfig::default(), &instance(dir.path().into()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[tokio::test]
    async fn shutdown_and_kill_without_session_go_idle() {
        let dir = tempfile::tempdir().unwrap();
        let sessions = SessionController::new("sh", "false");
        let instance = instance(dir.path().into());

        let state = shutdown_instance(&sessions, &instance).await.unwrap();
        assert_eq!(state.as_str(), InstanceState::IDLE);
        let state = kill_instance(&sessions, &instance).await.unwrap();
        assert_eq!(state.as_str(), InstanceState::IDLE);
    }

    #[tokio::test]
    async fn shutdown_with_session_is_graceful() {
        let dir = tempfile::tempdir().unwrap();
        let sessions = SessionController::new("sh", "true");
        let state = shutdown_instance(&sessions, &instance(dir.path().into()))
            .await
            .unwrap();
        assert_eq!(state.as_str(), InstanceState::SHUTTING_DOWN);
    }
}
