//! Sidecar discovery file (portfile) and liveness inspection.
//!
//! The portfile `.agrafes_sidecar.json` lives next to the database and
//! advertises the running sidecar's endpoint. Its presence plus a live PID
//! plus a passing `/health` probe is the coordination primitive for
//! "already running": both gates must pass, otherwise the file is stale
//! and gets removed before a new listener binds. A file (rather than an OS
//! lock) is used because other processes must be able to read the endpoint
//! from it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Name of the discovery file, written into the database's directory.
pub const PORTFILE_NAME: &str = ".agrafes_sidecar.json";

/// Contents of the discovery file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Portfile {
    pub host: String,
    pub port: u16,
    pub pid: u32,
    pub started_at: String,
    pub db_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Portfile path for a given database path.
pub fn portfile_path(db_path: &Path) -> PathBuf {
    let dir = db_path.parent().unwrap_or_else(|| Path::new("."));
    dir.join(PORTFILE_NAME)
}

/// Write the discovery file (pretty-printed, trailing newline).
pub fn write_portfile(path: &Path, portfile: &Portfile) -> std::io::Result<()> {
    let mut body = serde_json::to_string_pretty(portfile)?;
    body.push('\n');
    std::fs::write(path, body)
}

/// Remove the discovery file if present; a failure only logs.
pub fn remove_portfile(path: &Path) {
    if path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove sidecar portfile");
        }
    }
}

/// Whether a process with this PID is alive. Signal 0 probes without
/// touching the target.
pub fn pid_is_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    #[cfg(unix)]
    {
        let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
        if result == 0 {
            return true;
        }
        // EPERM means the process exists but belongs to someone else
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
    #[cfg(not(unix))]
    {
        // No cheap probe; rely on the health gate alone.
        true
    }
}

/// Probe `GET /health` on the recorded endpoint with a sub-second client
/// deadline. Passes only for a well-formed `{ok: true, status: "ok"}`
/// envelope.
pub async fn health_check(host: &str, port: u16, timeout: Duration) -> bool {
    let client = match reqwest::Client::builder().timeout(timeout).build() {
        Ok(client) => client,
        Err(_) => return false,
    };
    let url = format!("http://{}:{}/health", host, port);
    let response = match client.get(&url).send().await {
        Ok(response) => response,
        Err(_) => return false,
    };
    if !response.status().is_success() {
        return false;
    }
    match response.json::<serde_json::Value>().await {
        Ok(payload) => {
            payload.get("ok") == Some(&serde_json::Value::Bool(true))
                && payload.get("status").and_then(|s| s.as_str()) == Some("ok")
        }
        Err(_) => false,
    }
}

/// Lifecycle state of the sidecar for a given database.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SidecarState {
    /// No portfile.
    Missing { portfile: String },
    /// Portfile exists but the recorded process is dead or unreachable.
    Stale {
        portfile: String,
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        host: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
    },
    /// PID alive and `/health` answered.
    Running {
        portfile: String,
        host: String,
        port: u16,
        pid: u32,
        started_at: String,
        token_required: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
}

/// Inspect sidecar state for a database: portfile → PID gate → health gate.
pub async fn inspect_state(db_path: &Path, probe_timeout: Duration) -> SidecarState {
    let path = portfile_path(db_path);
    let path_display = path.display().to_string();

    if !path.exists() {
        return SidecarState::Missing {
            portfile: path_display,
        };
    }

    let portfile: Portfile = match std::fs::read_to_string(&path)
        .map_err(|e| e.to_string())
        .and_then(|text| serde_json::from_str(&text).map_err(|e| e.to_string()))
    {
        Ok(portfile) => portfile,
        Err(e) => {
            return SidecarState::Stale {
                portfile: path_display,
                reason: format!("invalid_portfile_json: {}", e),
                host: None,
                port: None,
                pid: None,
            }
        }
    };

    if portfile.port == 0 {
        return SidecarState::Stale {
            portfile: path_display,
            reason: "invalid_port".to_string(),
            host: Some(portfile.host),
            port: Some(portfile.port),
            pid: Some(portfile.pid),
        };
    }

    let pid_alive = pid_is_alive(portfile.pid);
    let health_ok = health_check(&portfile.host, portfile.port, probe_timeout).await;

    if pid_alive && health_ok {
        let token_required = portfile.token.as_deref().map_or(false, |t| !t.is_empty());
        SidecarState::Running {
            portfile: path_display,
            host: portfile.host,
            port: portfile.port,
            pid: portfile.pid,
            started_at: portfile.started_at,
            token_required,
            token: portfile.token.filter(|t| !t.is_empty()),
        }
    } else {
        SidecarState::Stale {
            portfile: path_display,
            reason: "unreachable_or_dead".to_string(),
            host: Some(portfile.host),
            port: Some(portfile.port),
            pid: Some(portfile.pid),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn portfile_path_is_sibling_of_db() {
        let path = portfile_path(Path::new("/data/corpus.db"));
        assert_eq!(path, Path::new("/data/.agrafes_sidecar.json"));
    }

    #[test]
    fn own_pid_is_alive() {
        assert!(pid_is_alive(std::process::id()));
        assert!(!pid_is_alive(0));
    }

    #[test]
    fn portfile_round_trip_omits_absent_token() {
        let portfile = Portfile {
            host: "127.0.0.1".to_string(),
            port: 8765,
            pid: 42,
            started_at: "2026-01-01T00:00:00Z".to_string(),
            db_path: "/data/corpus.db".to_string(),
            token: None,
        };
        let json = serde_json::to_string(&portfile).unwrap();
        assert!(!json.contains("token"));
        let parsed: Portfile = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.port, 8765);
    }
}
