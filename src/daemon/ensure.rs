//! "Ensure running" bootstrap used by the `boring` CLI before sending any
//! request (§6): try to connect, and if nothing is listening, spawn the
//! daemon and retry with exponential backoff until it answers or a deadline
//! expires.

use std::path::PathBuf;
use std::time::Duration;

use tokio::net::UnixStream;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::daemon::paths;
use crate::error::ManagerError;

const INITIAL_BACKOFF: Duration = Duration::from_millis(2);
const MAX_ATTEMPTS: u32 = 12;

/// Locate the daemon binary to spawn: `boringd` next to this executable,
/// unless `BORING_DAEMON_BIN` names one explicitly (used in tests and
/// non-standard install layouts).
fn daemon_binary_path() -> Result<PathBuf, ManagerError> {
    if let Ok(explicit) = std::env::var("BORING_DAEMON_BIN") {
        return Ok(PathBuf::from(explicit));
    }

    let current = std::env::current_exe()
        .map_err(|e| ManagerError::Network(format!("failed to resolve current executable: {e}")))?;
    let dir = current
        .parent()
        .ok_or_else(|| ManagerError::Network("current executable has no parent directory".into()))?;

    let name = if cfg!(windows) { "boringd.exe" } else { "boringd" };
    Ok(dir.join(name))
}

fn spawn_daemon() -> Result<(), ManagerError> {
    let binary = daemon_binary_path()?;
    info!("no daemon listening on {:?}; spawning {}", paths::socket_path(), binary.display());

    std::process::Command::new(&binary)
        .spawn()
        .map_err(|e| ManagerError::Network(format!("failed to spawn {}: {e}", binary.display())))?;

    Ok(())
}

/// Connect to the control socket, spawning the daemon first if nothing is
/// listening yet. Retries with backoff doubling from 2ms so a just-spawned
/// daemon has time to bind before the caller gives up.
pub async fn connect() -> Result<UnixStream, ManagerError> {
    let socket_path = paths::socket_path();

    if let Ok(stream) = UnixStream::connect(&socket_path).await {
        return Ok(stream);
    }

    spawn_daemon()?;

    let mut backoff = INITIAL_BACKOFF;
    for attempt in 1..=MAX_ATTEMPTS {
        sleep(backoff).await;
        match UnixStream::connect(&socket_path).await {
            Ok(stream) => return Ok(stream),
            Err(e) if attempt == MAX_ATTEMPTS => {
                warn!("daemon never came up on {socket_path:?}: {e}");
                return Err(ManagerError::Network(format!(
                    "daemon did not start within {} attempts: {e}",
                    MAX_ATTEMPTS
                )));
            }
            Err(_) => backoff *= 2,
        }
    }

    unreachable!("loop always returns by its last iteration")
}
