// SPDX-License-Identifier: MIT

use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration for the inspector.
///
/// Built once at startup (from CLI flags in standalone mode, or from
/// [`InspectorConfig::from_env`] when co-embedded in a host process) and
/// shared behind an `Arc` for the process lifetime.
#[derive(Debug, Clone)]
pub struct InspectorConfig {
    /// Port the HTTP gateway binds to. Default 7800.
    pub port: u16,
    /// Bind address. Localhost only unless explicitly overridden.
    pub host: String,
    /// Directory holding per-session trace files.
    pub traces_dir: PathBuf,
    /// Interval between per-session `Heartbeat` data events.
    pub heartbeat_interval: Duration,
    /// Interval between SSE `:` keep-alive comments.
    pub sse_keepalive: Duration,
    /// Days to retain rotated chunk files before pruning.
    pub retention_days: u32,
    /// Base URL of the external durable-workflow service, if configured.
    pub external_workflow_url: Option<String>,
    /// Verbose logging requested via `INSPECTOR_DEBUG`.
    pub debug: bool,
}

pub const DEFAULT_PORT: u16 = 7800;

impl InspectorConfig {
    pub fn new(
        port: Option<u16>,
        traces_dir: Option<PathBuf>,
        external_workflow_url: Option<String>,
    ) -> Self {
        Self {
            port: port.unwrap_or(DEFAULT_PORT),
            host: "127.0.0.1".to_string(),
            traces_dir: traces_dir.unwrap_or_else(default_traces_dir),
            heartbeat_interval: Duration::from_secs(10),
            sse_keepalive: Duration::from_secs(15),
            retention_days: 7,
            external_workflow_url,
            debug: std::env::var("INSPECTOR_DEBUG").is_ok_and(|v| !v.is_empty()),
        }
    }

    /// Resolve configuration purely from environment variables.
    ///
    /// Used by the co-embedded path where no CLI is available:
    /// `INSPECTOR_PORT`, `TRACES_DIR`, `INSPECTOR_DEBUG`.
    /// (`INSPECTOR_ENABLE_PATCH` is reserved for a legacy fallback and is
    /// deliberately ignored.)
    pub fn from_env() -> Self {
        let port = std::env::var("INSPECTOR_PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok());
        let traces_dir = std::env::var("TRACES_DIR").ok().map(PathBuf::from);
        Self::new(port, traces_dir, None)
    }
}

impl Default for InspectorConfig {
    fn default() -> Self {
        Self::new(None, None, None)
    }
}

/// Default trace directory: `~/.mcp_traces`, falling back to a temp
/// directory when no home directory can be resolved.
pub fn default_traces_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        if !home.is_empty() {
            return PathBuf::from(home).join(".mcp_traces");
        }
    }
    #[cfg(target_os = "windows")]
    {
        if let Ok(profile) = std::env::var("USERPROFILE") {
            return PathBuf::from(profile).join(".mcp_traces");
        }
    }
    std::env::temp_dir().join("mcp_traces")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_localhost_7800() {
        let config = InspectorConfig::new(None, None, None);
        assert_eq!(config.port, 7800);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.retention_days, 7);
    }

    #[test]
    fn explicit_port_wins() {
        let config = InspectorConfig::new(Some(7911), None, None);
        assert_eq!(config.port, 7911);
    }

    #[test]
    fn traces_dir_override() {
        let dir = PathBuf::from("/tmp/custom_traces");
        let config = InspectorConfig::new(None, Some(dir.clone()), None);
        assert_eq!(config.traces_dir, dir);
    }
}
