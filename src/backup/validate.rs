//! Validation functions for settings values.
//!
//! Everything here runs before any server job is dispatched and before any logon; a
//! failure is a configuration error for the whole run. Nothing here touches the disk
//! beyond reading metadata.

use validator::ValidationError;

use std::path::Path;

/// The sanitizer keeps a two character drive/root prefix, so shorter roots are rejected.
const MIN_BACKUP_ROOT_CHARS: usize = 2;

pub fn validate_backup_root<P: AsRef<Path>>(root: P) -> Result<(), ValidationError> {
    let root = root.as_ref();
    let chars = root.to_string_lossy().chars().count();
    if chars == 0 {
        return Err(ValidationError::new("MissingBackupRoot")
            .with_message("No backup folder was specified.".into()));
    }
    if chars < MIN_BACKUP_ROOT_CHARS {
        return Err(ValidationError::new("InvalidBackupRoot").with_message(
            format!("backup folder {:?} must be at least {MIN_BACKUP_ROOT_CHARS} characters", root)
                .into(),
        ));
    }

    validate_writable_dir_if_exists(root)
}

// validator hands custom functions a reference to the field itself.
#[allow(clippy::ptr_arg)]
pub fn validate_server_names(servers: &Vec<String>) -> Result<(), ValidationError> {
    if servers.is_empty() {
        return Err(ValidationError::new("MissingServers")
            .with_message("No server names were specified.".into()));
    }
    if servers.iter().any(|s| s.trim().is_empty()) {
        return Err(ValidationError::new("InvalidServerName")
            .with_message(format!("Empty server name in {:?}", servers).into()));
    }

    Ok(())
}

/// An existing path must be a writable directory; a missing one is left for the run to create.
pub fn validate_writable_dir_if_exists<P: AsRef<Path>>(dir: P) -> Result<(), ValidationError> {
    let dir = dir.as_ref();
    if !dir.exists() {
        return Ok(());
    }
    if !dir.is_dir() {
        return Err(ValidationError::new("InvalidDirectory")
            .with_message(format!("{:?} is not a directory", dir).into()));
    }
    let md = std::fs::metadata(dir).map_err(|e| {
        ValidationError::new("InvalidDirectory")
            .with_message(format!("cannot access metadata for {:?}: {}", dir, e).into())
    })?;
    if md.permissions().readonly() {
        Err(ValidationError::new("InvalidDirectory")
            .with_message(format!("cannot write to dir {:?}", dir).into()))
    } else {
        Ok(())
    }
}
