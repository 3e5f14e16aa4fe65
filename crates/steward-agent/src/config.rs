use std::{
    path::{Path, PathBuf},
    time::Duration,
};

const DEFAULT_RECONCILE_INTERVAL_MS: u64 = 1000;
const DEFAULT_KILL_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_HTTP_TIMEOUT_SEC: u64 = 15 * 60;
const DEFAULT_CONSOLE_MAX_LINES: usize = 1000;
const DEFAULT_CONSOLE_LOG_MAX_BYTES: u64 = 10 * 1024 * 1024; // 10 MiB
const DEFAULT_CONSOLE_LOG_MAX_FILES: usize = 3;

pub(crate) fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
}

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
}

fn data_root_from_env() -> PathBuf {
    let raw = std::env::var("STEWARD_DATA_ROOT")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "./data".to_string());
    let p = PathBuf::from(raw);
    if p.is_absolute() {
        p
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(p)
    }
}

/// Runtime knobs for the engine, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub data_root: PathBuf,
    pub reconcile_interval: Duration,
    pub kill_timeout: Duration,
    pub http_timeout: Duration,
    pub console_max_lines: usize,
    pub console_log_max_bytes: u64,
    pub console_log_max_files: usize,
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            data_root: data_root_from_env(),
            reconcile_interval: Duration::from_millis(
                env_u64("STEWARD_RECONCILE_INTERVAL_MS")
                    .map(|v| v.clamp(50, 60_000))
                    .unwrap_or(DEFAULT_RECONCILE_INTERVAL_MS),
            ),
            kill_timeout: Duration::from_millis(
                env_u64("STEWARD_KILL_TIMEOUT_MS")
                    .map(|v| v.clamp(500, 5 * 60 * 1000))
                    .unwrap_or(DEFAULT_KILL_TIMEOUT_MS),
            ),
            http_timeout: Duration::from_secs(
                env_u64("STEWARD_HTTP_TIMEOUT_SEC")
                    .map(|v| v.clamp(10, 60 * 60))
                    .unwrap_or(DEFAULT_HTTP_TIMEOUT_SEC),
            ),
            console_max_lines: env_usize("STEWARD_CONSOLE_MAX_LINES")
                .map(|v| v.clamp(100, 50_000))
                .unwrap_or(DEFAULT_CONSOLE_MAX_LINES),
            console_log_max_bytes: env_u64("STEWARD_CONSOLE_LOG_MAX_BYTES")
                .map(|v| v.clamp(256 * 1024, 1024 * 1024 * 1024))
                .unwrap_or(DEFAULT_CONSOLE_LOG_MAX_BYTES),
            console_log_max_files: env_usize("STEWARD_CONSOLE_LOG_MAX_FILES")
                .map(|v| v.clamp(1, 20))
                .unwrap_or(DEFAULT_CONSOLE_LOG_MAX_FILES),
        }
    }

    /// Defaults rooted at `data_root`; used by tests and embedders that skip the environment.
    pub fn with_data_root(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            reconcile_interval: Duration::from_millis(DEFAULT_RECONCILE_INTERVAL_MS),
            kill_timeout: Duration::from_millis(DEFAULT_KILL_TIMEOUT_MS),
            http_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SEC),
            console_max_lines: DEFAULT_CONSOLE_MAX_LINES,
            console_log_max_bytes: DEFAULT_CONSOLE_LOG_MAX_BYTES,
            console_log_max_files: DEFAULT_CONSOLE_LOG_MAX_FILES,
        }
    }

    pub fn definitions_dir(&self) -> PathBuf {
        self.data_root.join("definitions")
    }

    pub fn servers_dir(&self) -> PathBuf {
        self.data_root.join("servers")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_root.join("logs")
    }

    pub fn home_dir(&self) -> &Path {
        &self.data_root
    }
}
