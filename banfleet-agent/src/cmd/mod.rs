//! Subcommand implementations.

pub mod join;
pub mod server;

use std::path::Path;

use crate::error::{AgentError, AgentResult};

pub(crate) fn write_pem(path: &Path, pem: &str) -> AgentResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
        set_mode(parent, 0o770)?;
    }
    std::fs::write(path, pem)?;
    set_mode(path, 0o600)
}

pub(crate) fn read_pem(path: &Path) -> AgentResult<String> {
    std::fs::read_to_string(path).map_err(|e| {
        AgentError::Cert(format!("read {}: {e} (did you run join?)", path.display()))
    })
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> AgentResult<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> AgentResult<()> {
    Ok(())
}
