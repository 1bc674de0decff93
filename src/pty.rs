//! Demo broker - Session-owned terminal process (spec §4.4 steps 3, 6, 7, 9)
//!
//! The terminal multiplexer and the sandbox image it runs in are an
//! out-of-scope collaborator (spec §1): the broker's job stops at
//! spawning it, watching whether it is still alive, and reaping it. It
//! is not responsible for proxying the terminal's stdin/stdout - a
//! client reaches the running session directly at the `terminal_url`
//! handed out on promotion.

use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};

use portable_pty::{native_pty_system, Child, CommandBuilder, PtySize};
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub enum PtySpawnError {
    OpenFailed(String),
    SpawnFailed(String),
}

impl std::fmt::Display for PtySpawnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OpenFailed(e) => write!(f, "failed to open pty: {e}"),
            Self::SpawnFailed(e) => write!(f, "failed to spawn terminal process: {e}"),
        }
    }
}

impl std::error::Error for PtySpawnError {}

/// A terminal process owned by one session, independent of any client
/// connection. Dropping it does not by itself terminate the child; call
/// `graceful_terminate`/`force_kill` explicitly (spec §4.4 termination
/// protocol and hard-kill backstop).
///
/// Cloning shares the same underlying child handle (it is just two
/// `Arc` clones), so the hard-kill backstop timer can hold its own
/// handle independent of whatever the active-session slot does with
/// its own copy in the meantime.
#[derive(Clone)]
pub struct OwnedPty {
    pid: u32,
    child: Arc<StdMutex<Box<dyn Child + Send + Sync>>>,
}

impl OwnedPty {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Arm a one-shot background watcher that fires `on_exit` once the
    /// terminal process exits on its own (spec §4.4 failure semantics:
    /// "Terminal child exits on its own: treated as `container_exit`").
    /// A process killed by `graceful_terminate`/`force_kill` also exits
    /// through this path; callers must tolerate a redundant invocation.
    pub fn watch_exit(&self, on_exit: impl FnOnce() + Send + 'static) {
        let child = Arc::clone(&self.child);
        tokio::task::spawn_blocking(move || {
            let status = child.lock().expect("child mutex poisoned").wait();
            match status {
                Ok(status) => info!(?status, "terminal process exited"),
                Err(e) => error!(error = %e, "terminal process wait error"),
            }
            on_exit();
        });
    }

    /// Send a graceful termination signal (spec §4.4 termination protocol
    /// step 3: "do NOT wait synchronously"). `portable-pty`'s `Child`
    /// exposes no signal finer than `kill()` across platforms, so this is
    /// the same mechanism the hard-kill backstop uses; the backstop timer
    /// exists precisely to cover the case where this does not land.
    pub async fn graceful_terminate(&self) {
        self.kill_blocking().await;
    }

    /// Hard-kill backstop (spec §4.4 step 7).
    pub async fn force_kill(&self) {
        self.kill_blocking().await;
    }

    async fn kill_blocking(&self) {
        let child = Arc::clone(&self.child);
        let result = tokio::task::spawn_blocking(move || child.lock().expect("child mutex poisoned").kill()).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "terminal process kill failed"),
            Err(e) => warn!(error = %e, "terminal process kill task panicked"),
        }
    }
}

/// Spawn the session's terminal multiplexer, pointed at the credential
/// file by path and carrying only non-sensitive environment (spec §4.4
/// step 6: never pass secrets as command-line arguments).
pub fn spawn_owned_pty(
    terminal_binary_path: &str,
    credential_file: &Path,
    session_timeout_minutes: u64,
    cols: u16,
    rows: u16,
) -> Result<OwnedPty, PtySpawnError> {
    let pty_system = native_pty_system();
    let size = PtySize { rows, cols, pixel_width: 0, pixel_height: 0 };
    let pair = pty_system.openpty(size).map_err(|e| PtySpawnError::OpenFailed(e.to_string()))?;

    let mut cmd = CommandBuilder::new(terminal_binary_path);
    cmd.env("TERM", "xterm-256color");
    cmd.env("CREDENTIAL_FILE", credential_file.as_os_str());
    cmd.env("SESSION_TIMEOUT_MINUTES", session_timeout_minutes.to_string());

    let child = pair.slave.spawn_command(cmd).map_err(|e| PtySpawnError::SpawnFailed(e.to_string()))?;
    let pid = child.process_id().unwrap_or(0);

    // The broker spawns and reaps the container's terminal process; it
    // does not proxy its I/O (spec §1 non-goal), so both ends of the pty
    // itself are dropped once the child is launched.
    drop(pair.slave);
    drop(pair.master);

    info!(pid, cols, rows, binary = terminal_binary_path, "spawned session terminal process");

    Ok(OwnedPty { pid, child: Arc::new(StdMutex::new(child)) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::tempdir;

    fn test_binary() -> String {
        if cfg!(windows) { "cmd.exe" } else { "echo" }.to_string()
    }

    #[test]
    fn spawn_produces_a_pid() {
        let dir = tempdir().unwrap();
        let cred = dir.path().join("cred.env");
        std::fs::write(&cred, "").unwrap();
        let result = spawn_owned_pty(&test_binary(), &cred, 60, 80, 24);
        if let Ok(pty) = result {
            assert!(pty.pid() > 0 || cfg!(windows));
        }
    }

    #[tokio::test]
    async fn force_kill_does_not_panic_on_already_exited_child() {
        let dir = tempdir().unwrap();
        let cred = dir.path().join("cred.env");
        std::fs::write(&cred, "").unwrap();
        if let Ok(pty) = spawn_owned_pty(&test_binary(), &cred, 60, 80, 24) {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            pty.force_kill().await;
        }
    }

    #[tokio::test]
    async fn watch_exit_fires_once_process_ends() {
        let dir = tempdir().unwrap();
        let cred = dir.path().join("cred.env");
        std::fs::write(&cred, "").unwrap();
        if let Ok(pty) = spawn_owned_pty(&test_binary(), &cred, 60, 80, 24) {
            let fired = Arc::new(AtomicBool::new(false));
            let fired_clone = Arc::clone(&fired);
            pty.watch_exit(move || fired_clone.store(true, Ordering::SeqCst));
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            assert!(fired.load(Ordering::SeqCst));
        }
    }
}
