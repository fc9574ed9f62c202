use crate::error::{AppError, Result};

pub fn validate_instance_id(instance_id: &str) -> Result<()> {
    if uuid::Uuid::parse_str(instance_id).is_err() {
        return Err(AppError::other("Invalid instance id"));
    }
    Ok(())
}

pub fn validate_host_id(host_id: &str) -> Result<()> {
    if uuid::Uuid::parse_str(host_id).is_err() {
        return Err(AppError::other("Invalid host id"));
    }
    Ok(())
}

/// Session names are passed to the multiplexer as targets, where `:` and `.`
/// select windows and panes.
pub fn validate_session_name(session: &str) -> Result<()> {
    let is_safe = !session.is_empty()
        && session
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'));

    if !is_safe {
        return Err(AppError::illegal_state(format!(
            "Unsafe session name: {session:?}"
        )));
    }
    Ok(())
}

pub fn validate_version_tag(version: &str) -> Result<()> {
    let is_safe = !version.is_empty()
        && version
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '+'));

    if !is_safe {
        return Err(AppError::version_not_found(version));
    }

    Ok(())
}
