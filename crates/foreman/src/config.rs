use std::{env, fs, path::{Path, PathBuf}, time::Duration};

use semver::VersionReq;
use serde::Deserialize;

use crate::error::ServerError;

pub const STATE_ROOT_ENV: &str = "FOREMAN_STATE_ROOT";
pub const DISK_QUOTA_ENV: &str = "FOREMAN_DISK_QUOTA";
pub const MAX_SESSIONS_ENV: &str = "FOREMAN_MAX_SESSIONS";
pub const AGENT_BINARY_ENV: &str = "FOREMAN_AGENT_BINARY";
pub const DISABLE_GC_ENV: &str = "FOREMAN_DISABLE_GC";
pub const LOG_ENV: &str = "FOREMAN_LOG";

const CONFIG_FILE: &str = "config.toml";

/// Typed server configuration. One record, enumerated options; no dynamic
/// keys.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub state_root: PathBuf,
    /// Compressed-byte ceiling for the content store.
    pub disk_quota: Option<u64>,
    pub max_sessions: usize,
    /// Hard wall-clock cap per session.
    pub session_deadline: Duration,
    /// Terminate a session that produced no record for this long.
    pub idle_timeout: Duration,
    /// Capacity of each per-session record queue.
    pub queue_capacity: usize,
    pub max_line_bytes: usize,
    pub stderr_ring_bytes: usize,
    pub zstd_level: i32,
    /// Name of the agent CLI resolved by the locator.
    pub agent_binary_name: String,
    /// Explicit executable path; short-circuits discovery when set.
    pub binary_override: Option<PathBuf>,
    /// Version constraint the probed binary must satisfy.
    pub min_binary_version: Option<VersionReq>,
    /// Time between the polite termination signal and the forced kill.
    pub kill_grace: Duration,
    /// Extra time a killed child gets to reach a terminal state before the
    /// supervisor reports a suspected zombie.
    pub zombie_timeout: Duration,
    /// Periodic GC cadence; `None` disables the background pass.
    pub gc_interval: Option<Duration>,
    /// Environment variables forwarded to children.
    pub env_allowlist: Vec<String>,
    /// Extra ignore globs applied when walking project trees.
    pub checkpoint_ignore: Vec<String>,
    /// Default timeout for `send_message` calls without a deadline.
    pub write_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            state_root: default_state_root(),
            disk_quota: None,
            max_sessions: 8,
            session_deadline: Duration::from_secs(30 * 60),
            idle_timeout: Duration::from_secs(120),
            queue_capacity: 256,
            max_line_bytes: 1024 * 1024,
            stderr_ring_bytes: 64 * 1024,
            zstd_level: 7,
            agent_binary_name: "claude".to_string(),
            binary_override: None,
            min_binary_version: None,
            kill_grace: Duration::from_secs(5),
            zombie_timeout: Duration::from_secs(10),
            gc_interval: Some(Duration::from_secs(3600)),
            env_allowlist: ["PATH", "HOME", "LANG", "TERM"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            checkpoint_ignore: vec!["node_modules".to_string(), "target".to_string()],
            write_timeout: Duration::from_secs(10),
        }
    }
}

/// Optional keys of `<state-root>/config.toml`. Environment variables win
/// over file values.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    disk_quota: Option<u64>,
    max_sessions: Option<usize>,
    session_deadline_secs: Option<u64>,
    idle_timeout_secs: Option<u64>,
    queue_capacity: Option<usize>,
    max_line_bytes: Option<usize>,
    stderr_ring_bytes: Option<usize>,
    zstd_level: Option<i32>,
    agent_binary_name: Option<String>,
    binary_override: Option<PathBuf>,
    min_binary_version: Option<String>,
    kill_grace_secs: Option<u64>,
    zombie_timeout_secs: Option<u64>,
    gc_interval_secs: Option<u64>,
    env_allowlist: Option<Vec<String>>,
    checkpoint_ignore: Option<Vec<String>>,
    write_timeout_secs: Option<u64>,
}

impl ServerConfig {
    /// Defaults, then `config.toml` under the state root, then environment
    /// overrides.
    pub fn load() -> Result<Self, ServerError> {
        let mut config = Self::default();
        if let Some(root) = env::var_os(STATE_ROOT_ENV) {
            config.state_root = PathBuf::from(root);
        }
        config.merge_file(&config.state_root.join(CONFIG_FILE))?;
        config.apply_env()?;
        Ok(config)
    }

    fn merge_file(&mut self, path: &Path) -> Result<(), ServerError> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(source) => return Err(ServerError::io("read", path, source)),
        };
        let file: ConfigFile = toml::from_str(&contents).map_err(|err| {
            ServerError::InvalidConfig {
                message: format!("{}: {err}", path.display()),
            }
        })?;

        if let Some(value) = file.disk_quota {
            self.disk_quota = Some(value);
        }
        if let Some(value) = file.max_sessions {
            self.max_sessions = value;
        }
        if let Some(secs) = file.session_deadline_secs {
            self.session_deadline = Duration::from_secs(secs);
        }
        if let Some(secs) = file.idle_timeout_secs {
            self.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(value) = file.queue_capacity {
            self.queue_capacity = value;
        }
        if let Some(value) = file.max_line_bytes {
            self.max_line_bytes = value;
        }
        if let Some(value) = file.stderr_ring_bytes {
            self.stderr_ring_bytes = value;
        }
        if let Some(value) = file.zstd_level {
            self.zstd_level = value;
        }
        if let Some(value) = file.agent_binary_name {
            self.agent_binary_name = value;
        }
        if let Some(value) = file.binary_override {
            self.binary_override = Some(value);
        }
        if let Some(raw) = file.min_binary_version {
            self.min_binary_version = Some(parse_version_req(&raw)?);
        }
        if let Some(secs) = file.kill_grace_secs {
            self.kill_grace = Duration::from_secs(secs);
        }
        if let Some(secs) = file.zombie_timeout_secs {
            self.zombie_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = file.gc_interval_secs {
            self.gc_interval = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(value) = file.env_allowlist {
            self.env_allowlist = value;
        }
        if let Some(value) = file.checkpoint_ignore {
            self.checkpoint_ignore = value;
        }
        if let Some(secs) = file.write_timeout_secs {
            self.write_timeout = Duration::from_secs(secs);
        }
        Ok(())
    }

    fn apply_env(&mut self) -> Result<(), ServerError> {
        if let Some(raw) = env_string(DISK_QUOTA_ENV) {
            let quota = raw.parse::<u64>().map_err(|_| ServerError::InvalidConfig {
                message: format!("{DISK_QUOTA_ENV} must be a byte count, got `{raw}`"),
            })?;
            self.disk_quota = Some(quota);
        }
        if let Some(raw) = env_string(MAX_SESSIONS_ENV) {
            let max = raw.parse::<usize>().map_err(|_| ServerError::InvalidConfig {
                message: format!("{MAX_SESSIONS_ENV} must be an integer, got `{raw}`"),
            })?;
            if max == 0 {
                return Err(ServerError::InvalidConfig {
                    message: format!("{MAX_SESSIONS_ENV} must be at least 1"),
                });
            }
            self.max_sessions = max;
        }
        if let Some(raw) = env_string(AGENT_BINARY_ENV) {
            self.binary_override = Some(PathBuf::from(raw));
        }
        if env_string(DISABLE_GC_ENV).is_some_and(|raw| raw != "0" && !raw.is_empty()) {
            self.gc_interval = None;
        }
        Ok(())
    }
}

fn parse_version_req(raw: &str) -> Result<VersionReq, ServerError> {
    VersionReq::parse(raw).map_err(|err| ServerError::InvalidConfig {
        message: format!("invalid version requirement `{raw}`: {err}"),
    })
}

fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.is_empty())
}

fn default_state_root() -> PathBuf {
    if let Some(home) = env::var_os("HOME") {
        return PathBuf::from(home).join(".foreman");
    }
    PathBuf::from(".foreman")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_limits() {
        let config = ServerConfig::default();
        assert_eq!(config.max_sessions, 8);
        assert_eq!(config.queue_capacity, 256);
        assert_eq!(config.max_line_bytes, 1024 * 1024);
        assert_eq!(config.kill_grace, Duration::from_secs(5));
        assert!(config.gc_interval.is_some());
    }

    #[test]
    fn file_values_are_merged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "max_sessions = 3\nidle_timeout_secs = 7\nmin_binary_version = \">=1.2\"\n",
        )
        .unwrap();

        let mut config = ServerConfig::default();
        config.merge_file(&path).unwrap();
        assert_eq!(config.max_sessions, 3);
        assert_eq!(config.idle_timeout, Duration::from_secs(7));
        assert!(config
            .min_binary_version
            .unwrap()
            .matches(&semver::Version::new(1, 3, 0)));
    }

    #[test]
    fn unknown_file_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "definitely_not_a_key = true\n").unwrap();

        let mut config = ServerConfig::default();
        assert!(matches!(
            config.merge_file(&path),
            Err(ServerError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn zero_gc_interval_disables_gc() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "gc_interval_secs = 0\n").unwrap();

        let mut config = ServerConfig::default();
        config.merge_file(&path).unwrap();
        assert!(config.gc_interval.is_none());
    }
}
