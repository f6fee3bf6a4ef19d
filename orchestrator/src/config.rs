use std::path::PathBuf;
use std::time::Duration;

/// Orchestration layer configuration.
///
/// Every timeout is explicit and independently overridable; nothing in
/// the layer relies on a library default deadline.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the worker binary the supervisor spawns.
    pub worker_binary: String,
    /// Loopback port the worker is told to listen on.
    pub worker_port: u16,
    /// Working directory for the worker process.
    pub worker_dir: Option<PathBuf>,
    /// Overall deadline for `start()` to reach Running.
    pub start_timeout: Duration,
    /// Cadence of readiness probes during Starting.
    pub start_probe_interval: Duration,
    /// Per-request deadline for a single health probe.
    pub health_timeout: Duration,
    /// Cadence of the background health monitor while Running.
    pub monitor_interval: Duration,
    /// Consecutive probe failures before the monitor declares Error.
    pub monitor_failure_threshold: u32,
    /// Cadence of the child exit watcher.
    pub exit_watch_interval: Duration,
    /// Grace period between the shutdown request and a force kill.
    pub stop_grace: Duration,
    /// Deadline for a single request/response worker call.
    pub request_timeout: Duration,
    /// A stream with no event for this long is treated as Failed.
    pub stream_idle_timeout: Duration,
    /// Default per-tool execution deadline.
    pub tool_timeout: Duration,
    /// How long Closed sessions stay inspectable before eviction.
    pub closed_session_retention: Duration,
    /// Cadence of the closed-session eviction task.
    pub session_cleanup_interval: Duration,
    /// Path to the JSON credentials file, when the file-backed store is
    /// used.
    pub credentials_path: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            worker_binary: {
                // Default: workspace root /target/debug/worker-stub (resolved
                // at compile time). The host may be launched from any
                // directory, so use an absolute path. Override with
                // WORKER_BINARY.
                if let Ok(v) = std::env::var("WORKER_BINARY") {
                    v
                } else {
                    let workspace_root = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
                        .parent()
                        .map(|p| p.to_path_buf())
                        .unwrap_or_else(|| PathBuf::from("."));
                    workspace_root
                        .join("target/debug/worker-stub")
                        .to_string_lossy()
                        .to_string()
                }
            },
            worker_port: env_parse("WORKER_PORT", 7700)?,
            worker_dir: std::env::var("WORKER_DIR").ok().map(PathBuf::from),
            start_timeout: Duration::from_millis(env_parse("WORKER_START_TIMEOUT_MS", 10_000)?),
            start_probe_interval: Duration::from_millis(env_parse(
                "WORKER_START_PROBE_INTERVAL_MS",
                300,
            )?),
            health_timeout: Duration::from_millis(env_parse("WORKER_HEALTH_TIMEOUT_MS", 2_000)?),
            monitor_interval: Duration::from_millis(env_parse(
                "WORKER_MONITOR_INTERVAL_MS",
                1_000,
            )?),
            monitor_failure_threshold: env_parse("WORKER_MONITOR_FAILURE_THRESHOLD", 3)?,
            exit_watch_interval: Duration::from_millis(env_parse(
                "WORKER_EXIT_WATCH_INTERVAL_MS",
                200,
            )?),
            stop_grace: Duration::from_millis(env_parse("WORKER_STOP_GRACE_MS", 2_000)?),
            request_timeout: Duration::from_millis(env_parse("WORKER_REQUEST_TIMEOUT_MS", 30_000)?),
            stream_idle_timeout: Duration::from_millis(env_parse(
                "STREAM_IDLE_TIMEOUT_MS",
                30_000,
            )?),
            tool_timeout: Duration::from_millis(env_parse("TOOL_TIMEOUT_MS", 30_000)?),
            closed_session_retention: Duration::from_secs(env_parse(
                "CLOSED_SESSION_RETENTION_SECS",
                900,
            )?),
            session_cleanup_interval: Duration::from_secs(env_parse(
                "SESSION_CLEANUP_INTERVAL_SECS",
                60,
            )?),
            credentials_path: std::env::var("CREDENTIALS_PATH").ok().map(PathBuf::from),
        })
    }

    /// Config pointing at a specific worker binary and port, with the
    /// stock timeouts. Used by tests and embedders that manage their own
    /// settings.
    pub fn for_worker(binary: impl Into<String>, port: u16) -> Self {
        Self {
            worker_binary: binary.into(),
            worker_port: port,
            worker_dir: None,
            start_timeout: Duration::from_secs(10),
            start_probe_interval: Duration::from_millis(300),
            health_timeout: Duration::from_secs(2),
            monitor_interval: Duration::from_secs(1),
            monitor_failure_threshold: 3,
            exit_watch_interval: Duration::from_millis(200),
            stop_grace: Duration::from_secs(2),
            request_timeout: Duration::from_secs(30),
            stream_idle_timeout: Duration::from_secs(30),
            tool_timeout: Duration::from_secs(30),
            closed_session_retention: Duration::from_secs(900),
            session_cleanup_interval: Duration::from_secs(60),
            credentials_path: None,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(val) => val
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Failed to parse env var {key}={val}: {e}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn for_worker_uses_stock_timeouts() {
        let config = Config::for_worker("/tmp/worker", 7701);
        assert_eq!(config.start_timeout, Duration::from_secs(10));
        assert_eq!(config.start_probe_interval, Duration::from_millis(300));
        assert_eq!(config.stop_grace, Duration::from_secs(2));
        assert_eq!(config.monitor_failure_threshold, 3);
    }
}
