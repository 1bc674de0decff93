//! Demo broker - Per-session credential file handoff (spec §4.4 step 5, §9)
//!
//! Secrets are handed to the sandboxed terminal process by file path, never
//! by argv or environment. The file is mode 0600, owner-only, written
//! before the terminal process is spawned, and unlinked exactly once when
//! the session ends (or immediately, if spawning itself fails).

use std::io::Write;
use std::path::{Path, PathBuf};

use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Credentials {
    pub issue_tracker_token: String,
    pub issue_tracker_email: String,
    pub issue_tracker_site_url: String,
    pub model_provider_token: String,
}

impl Credentials {
    fn to_key_value_lines(&self) -> String {
        format!(
            "ISSUE_TRACKER_API_TOKEN={}\nISSUE_TRACKER_ACCOUNT_EMAIL={}\nISSUE_TRACKER_SITE_URL={}\nMODEL_PROVIDER_TOKEN={}\n",
            self.issue_tracker_token, self.issue_tracker_email, self.issue_tracker_site_url, self.model_provider_token
        )
    }
}

#[derive(Debug, Clone)]
pub enum CredentialError {
    DirectoryNotWritable(String),
    WriteFailed(String),
}

impl std::fmt::Display for CredentialError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DirectoryNotWritable(dir) => write!(f, "credential directory not writable: {dir}"),
            Self::WriteFailed(msg) => write!(f, "failed to write credential file: {msg}"),
        }
    }
}

impl std::error::Error for CredentialError {}

/// A written credential file and the closure-equivalent cleanup handle.
///
/// `CredentialHandle::cleanup` is idempotent: calling it twice (once on a
/// spawn failure, once more defensively on session end) is harmless.
pub struct CredentialHandle {
    path: PathBuf,
}

impl CredentialHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unlink the credential file. Safe to call more than once; a missing
    /// file is not an error here since the session may already be torn down.
    pub fn cleanup(&self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "credential cleanup failed");
            }
        }
    }
}

/// Write `credentials` for `session_id` under `credential_dir`, mode 0600.
///
/// The directory is created if absent. Any I/O failure here must prevent
/// the terminal process from spawning at all.
pub fn write_credential_file(
    credential_dir: &str,
    session_id: Uuid,
    credentials: &Credentials,
) -> Result<CredentialHandle, CredentialError> {
    std::fs::create_dir_all(credential_dir)
        .map_err(|e| CredentialError::DirectoryNotWritable(format!("{credential_dir}: {e}")))?;

    let path = PathBuf::from(credential_dir).join(format!("session-{session_id}.env"));
    let body = credentials.to_key_value_lines();

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)
            .map_err(|e| CredentialError::WriteFailed(e.to_string()))?;
        file.write_all(body.as_bytes()).map_err(|e| CredentialError::WriteFailed(e.to_string()))?;
    }
    #[cfg(not(unix))]
    {
        let mut file = std::fs::File::create(&path).map_err(|e| CredentialError::WriteFailed(e.to_string()))?;
        file.write_all(body.as_bytes()).map_err(|e| CredentialError::WriteFailed(e.to_string()))?;
    }

    Ok(CredentialHandle { path })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> Credentials {
        Credentials {
            issue_tracker_token: "tok-123".into(),
            issue_tracker_email: "demo@example.com".into(),
            issue_tracker_site_url: "https://issues.example.com".into(),
            model_provider_token: "sk-demo".into(),
        }
    }

    #[test]
    fn writes_file_with_key_value_lines() {
        let dir = tempdir().unwrap();
        let handle = write_credential_file(dir.path().to_str().unwrap(), Uuid::new_v4(), &sample()).unwrap();
        let contents = std::fs::read_to_string(handle.path()).unwrap();
        assert!(contents.contains("ISSUE_TRACKER_API_TOKEN=tok-123"));
        assert!(contents.contains("MODEL_PROVIDER_TOKEN=sk-demo"));
    }

    #[cfg(unix)]
    #[test]
    fn file_permissions_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let handle = write_credential_file(dir.path().to_str().unwrap(), Uuid::new_v4(), &sample()).unwrap();
        let mode = std::fs::metadata(handle.path()).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn cleanup_is_idempotent() {
        let dir = tempdir().unwrap();
        let handle = write_credential_file(dir.path().to_str().unwrap(), Uuid::new_v4(), &sample()).unwrap();
        handle.cleanup();
        assert!(!handle.path().exists());
        handle.cleanup();
    }

    #[test]
    fn creates_missing_directory() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("nested/creds");
        let handle = write_credential_file(nested.to_str().unwrap(), Uuid::new_v4(), &sample()).unwrap();
        assert!(handle.path().exists());
    }
}
