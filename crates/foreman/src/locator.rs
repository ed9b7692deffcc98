use std::{
    env, fs, io,
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use tokio::{process::Command, sync::Mutex, time};
use tracing::{debug, info, warn};

use crate::{
    config::ServerConfig,
    error::ServerError,
    events::{EventBus, ServerEvent},
};

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_TTL: Duration = Duration::from_secs(3600);

/// How a binary candidate was found.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiscoveryMethod {
    Override,
    PathLookup,
    VersionManager,
    StandardPrefix,
}

/// A validated (or rejected) agent binary candidate.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BinaryRecord {
    pub path: PathBuf,
    pub version_raw: String,
    pub version: Option<Version>,
    pub method: DiscoveryMethod,
    pub discovered_at_unix_ms: u64,
    pub last_verified_at_unix_ms: u64,
    pub valid: bool,
}

/// Discovers the external agent CLI and caches the result.
///
/// The discovery chain runs in a fixed order (explicit override, PATH,
/// version-manager directories, standard install prefixes) and each
/// candidate must pass a `--version` probe against the configured
/// constraint before it wins. The winning record persists in
/// `registry/binaries.db` so restarts inside the TTL skip the probe.
pub struct BinaryLocator {
    binary_name: String,
    override_path: Option<PathBuf>,
    version_req: Option<VersionReq>,
    ttl: Duration,
    cache_path: PathBuf,
    cached: Mutex<Option<BinaryRecord>>,
    /// Directory patterns with at most one `*` path segment, expanded
    /// against the filesystem (e.g. `~/.nvm/versions/node/*/bin`).
    version_manager_dirs: Vec<PathBuf>,
    standard_prefixes: Vec<PathBuf>,
    events: EventBus,
}

impl BinaryLocator {
    pub fn new(config: &ServerConfig, cache_path: PathBuf, events: EventBus) -> Self {
        let cached = load_cache(&cache_path);
        Self {
            binary_name: config.agent_binary_name.clone(),
            override_path: config.binary_override.clone(),
            version_req: config.min_binary_version.clone(),
            ttl: DEFAULT_TTL,
            cache_path,
            cached: Mutex::new(cached),
            version_manager_dirs: default_version_manager_dirs(),
            standard_prefixes: default_standard_prefixes(),
            events,
        }
    }

    /// Returns a fresh valid record, re-running discovery when the cache is
    /// stale, invalid, or `force` is set.
    pub async fn resolve(&self, force: bool) -> Result<BinaryRecord, ServerError> {
        let mut cached = self.cached.lock().await;
        if !force {
            if let Some(record) = cached.as_ref() {
                if record.valid && self.is_fresh(record) && record.path.is_file() {
                    debug!(path = %record.path.display(), "locator cache hit");
                    return Ok(record.clone());
                }
            }
        }

        let mut attempts = 0usize;
        for (method, candidate) in self.candidates() {
            attempts += 1;
            match self.probe(&candidate).await {
                Ok((raw, version)) => {
                    let record = BinaryRecord {
                        path: candidate,
                        version_raw: raw,
                        version: version.clone(),
                        method,
                        discovered_at_unix_ms: unix_ms(),
                        last_verified_at_unix_ms: unix_ms(),
                        valid: true,
                    };
                    info!(
                        path = %record.path.display(),
                        version = %record.version_raw,
                        method = ?method,
                        "agent binary resolved"
                    );
                    self.events.publish(ServerEvent::BinaryResolved {
                        path: record.path.display().to_string(),
                        version: version.map(|v| v.to_string()),
                    });
                    self.persist(&record);
                    *cached = Some(record.clone());
                    return Ok(record);
                }
                Err(reason) => {
                    debug!(candidate = %candidate.display(), %reason, "candidate rejected");
                }
            }
        }

        *cached = None;
        Err(ServerError::BinaryNotFound { attempts })
    }

    /// Forces the next [`Self::resolve`] to rediscover.
    pub async fn invalidate(&self) {
        let mut cached = self.cached.lock().await;
        if let Some(record) = cached.as_mut() {
            record.valid = false;
            self.persist(record);
        }
    }

    fn is_fresh(&self, record: &BinaryRecord) -> bool {
        let age_ms = unix_ms().saturating_sub(record.last_verified_at_unix_ms);
        Duration::from_millis(age_ms) < self.ttl
    }

    /// The discovery chain, in order.
    fn candidates(&self) -> Vec<(DiscoveryMethod, PathBuf)> {
        let mut out = Vec::new();
        if let Some(path) = &self.override_path {
            out.push((DiscoveryMethod::Override, path.clone()));
        }
        for dir in path_entries() {
            let candidate = dir.join(&self.binary_name);
            if candidate.is_file() {
                out.push((DiscoveryMethod::PathLookup, candidate));
            }
        }
        for pattern in &self.version_manager_dirs {
            for dir in expand_wildcard_dir(pattern) {
                let candidate = dir.join(&self.binary_name);
                if candidate.is_file() {
                    out.push((DiscoveryMethod::VersionManager, candidate));
                }
            }
        }
        for prefix in &self.standard_prefixes {
            let candidate = prefix.join(&self.binary_name);
            if candidate.is_file() {
                out.push((DiscoveryMethod::StandardPrefix, candidate));
            }
        }
        out
    }

    /// Runs the version probe and checks the configured constraint.
    async fn probe(&self, candidate: &Path) -> Result<(String, Option<Version>), String> {
        let mut command = Command::new(candidate);
        command
            .arg("--version")
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let output = match time::timeout(PROBE_TIMEOUT, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => return Err(format!("probe failed to run: {err}")),
            Err(_) => return Err("probe timed out".to_string()),
        };
        if !output.status.success() {
            return Err(format!("probe exited with {:?}", output.status));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let first_line = stdout
            .lines()
            .chain(stderr.lines())
            .find(|line| !line.trim().is_empty())
            .unwrap_or("")
            .trim()
            .to_string();
        if first_line.is_empty() {
            return Err("probe produced no output".to_string());
        }

        let version = parse_semver_token(&first_line);
        if let Some(req) = &self.version_req {
            match &version {
                Some(version) if req.matches(version) => {}
                Some(version) => {
                    return Err(format!("version {version} does not satisfy {req}"));
                }
                None => {
                    return Err(format!("no parseable version in `{first_line}`"));
                }
            }
        }
        Ok((first_line, version))
    }

    fn persist(&self, record: &BinaryRecord) {
        let bytes = match serde_json::to_vec_pretty(record) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(%err, "failed to encode locator cache");
                return;
            }
        };
        if let Err(err) = atomic_write(&self.cache_path, &bytes) {
            warn!(%err, path = %self.cache_path.display(), "failed to persist locator cache");
        }
    }
}

/// Scans a version string for the first token that parses as semver,
/// tolerating decorations like `v1.2.3`, `(1.2.3)`, or trailing commas.
pub(crate) fn parse_semver_token(raw: &str) -> Option<Version> {
    for token in raw.split_whitespace() {
        let candidate = token
            .trim_matches(|c: char| matches!(c, '(' | ')' | ',' | ';'))
            .trim_start_matches('v');
        if let Ok(version) = Version::parse(candidate) {
            return Some(version);
        }
    }
    None
}

fn load_cache(path: &Path) -> Option<BinaryRecord> {
    let bytes = fs::read(path).ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(record) => Some(record),
        Err(err) => {
            warn!(%err, path = %path.display(), "discarding unreadable locator cache");
            None
        }
    }
}

fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    io::Write::write_all(&mut tmp, bytes)?;
    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

fn path_entries() -> Vec<PathBuf> {
    env::var_os("PATH")
        .map(|raw| env::split_paths(&raw).collect())
        .unwrap_or_default()
}

fn home_dir() -> Option<PathBuf> {
    env::var_os("HOME").map(PathBuf::from)
}

fn default_version_manager_dirs() -> Vec<PathBuf> {
    let Some(home) = home_dir() else {
        return Vec::new();
    };
    vec![
        home.join(".nvm/versions/node/*/bin"),
        home.join(".volta/bin"),
        home.join(".asdf/shims"),
        home.join(".fnm/node-versions/*/installation/bin"),
    ]
}

fn default_standard_prefixes() -> Vec<PathBuf> {
    let mut prefixes = vec![
        PathBuf::from("/usr/local/bin"),
        PathBuf::from("/opt/homebrew/bin"),
        PathBuf::from("/usr/bin"),
    ];
    if let Some(home) = home_dir() {
        prefixes.push(home.join(".local/bin"));
        prefixes.push(home.join("bin"));
    }
    prefixes
}

/// Expands a path with at most one `*` segment against the filesystem.
fn expand_wildcard_dir(pattern: &Path) -> Vec<PathBuf> {
    let mut components = Vec::new();
    let mut wildcard_at = None;
    for (idx, component) in pattern.components().enumerate() {
        if component.as_os_str() == "*" {
            wildcard_at = Some(idx);
        }
        components.push(PathBuf::from(component.as_os_str()));
    }

    let Some(star) = wildcard_at else {
        return if pattern.is_dir() {
            vec![pattern.to_path_buf()]
        } else {
            Vec::new()
        };
    };

    let base: PathBuf = components[..star].iter().collect();
    let suffix: PathBuf = components[star + 1..].iter().collect();
    let Ok(entries) = fs::read_dir(&base) else {
        return Vec::new();
    };
    let mut out: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path().join(&suffix))
        .filter(|dir| dir.is_dir())
        .collect();
    // Prefer the newest toolchain directory first.
    out.sort();
    out.reverse();
    out
}

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn semver_tokens_are_extracted_from_noise() {
        assert_eq!(
            parse_semver_token("claude 1.2.3 (build abc)"),
            Some(Version::new(1, 2, 3))
        );
        assert_eq!(
            parse_semver_token("v0.10.1-beta.2 nightly").map(|v| v.to_string()),
            Some("0.10.1-beta.2".to_string())
        );
        assert_eq!(parse_semver_token("no version here"), None);
    }

    #[test]
    fn wildcard_expansion_finds_nested_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("versions/1.0.0/bin");
        let b = dir.path().join("versions/2.0.0/bin");
        fs::create_dir_all(&a).unwrap();
        fs::create_dir_all(&b).unwrap();

        let pattern = dir.path().join("versions/*/bin");
        let expanded = expand_wildcard_dir(&pattern);
        assert_eq!(expanded.len(), 2);
        // Newest first.
        assert!(expanded[0].ends_with("2.0.0/bin"));
    }

    #[test]
    fn wildcard_free_pattern_requires_existing_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(expand_wildcard_dir(&dir.path().join("missing")).is_empty());
        assert_eq!(
            expand_wildcard_dir(dir.path()),
            vec![dir.path().to_path_buf()]
        );
    }
}
