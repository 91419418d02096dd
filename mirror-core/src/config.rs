//! Engine configuration.
//!
//! Loaded from a single YAML document. `validate()` never stops at the
//! first problem: it returns every violation so startup can fail fast with
//! the complete list.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::{TargetId, TargetKind};

/// Configuration for one mirror target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfig {
    pub id: TargetId,
    pub kind: TargetKind,
    /// Directory path for `local_dir`, endpoint URL/host for the rest.
    pub address: String,
}

/// Snapshot retention for the version store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Versions kept per resource (latest always survives).
    pub max_versions: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self { max_versions: 32 }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// Root of the content-addressed store and index.
    pub root: PathBuf,
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
    /// Seconds a session may sit idle (no output) before force-cancel.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    /// Seconds to wait for a heartbeat reply before counting a failure.
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,
    /// Seconds between heartbeat rounds.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Seconds a cooperative cancel may run before the forced path.
    #[serde(default = "default_cancel_grace")]
    pub cancel_grace_secs: u64,
    /// Seconds `stop()` waits for in-flight sync events to drain.
    #[serde(default = "default_drain_grace")]
    pub drain_grace_secs: u64,
    /// Seconds a disconnected viewer's queue is retained before drop.
    #[serde(default = "default_viewer_grace")]
    pub viewer_grace_secs: u64,
    /// Capture ring buffer capacity, in chunks, per session.
    #[serde(default = "default_ring_buffer_chunks")]
    pub ring_buffer_chunks: usize,
    #[serde(default)]
    pub retention: RetentionConfig,
}

fn default_command_timeout() -> u64 {
    300
}
fn default_heartbeat_timeout() -> u64 {
    5
}
fn default_heartbeat_interval() -> u64 {
    10
}
fn default_cancel_grace() -> u64 {
    5
}
fn default_drain_grace() -> u64 {
    10
}
fn default_viewer_grace() -> u64 {
    60
}
fn default_ring_buffer_chunks() -> usize {
    1024
}

impl MirrorConfig {
    /// Minimal config rooted at `root`, no targets. Useful for tests and
    /// embedding.
    pub fn rooted_at(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            targets: Vec::new(),
            command_timeout_secs: default_command_timeout(),
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            cancel_grace_secs: default_cancel_grace(),
            drain_grace_secs: default_drain_grace(),
            viewer_grace_secs: default_viewer_grace(),
            ring_buffer_chunks: default_ring_buffer_chunks(),
            retention: RetentionConfig::default(),
        }
    }

    /// Default store root: `<home>/.mirrorcode`.
    pub fn default_root() -> Result<PathBuf, ConfigError> {
        dirs::home_dir()
            .map(|home| home.join(".mirrorcode"))
            .ok_or(ConfigError::HomeNotFound)
    }

    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Collect every violation in this configuration.
    ///
    /// Empty result means the config is usable. Callers wrap non-empty
    /// results into their fatal startup error.
    pub fn validate(&self) -> Vec<String> {
        let mut violations = Vec::new();

        if self.root.as_os_str().is_empty() {
            violations.push("store root must not be empty".to_string());
        }

        if self.ring_buffer_chunks == 0 {
            violations.push("ring_buffer_chunks must be at least 1".to_string());
        }
        if self.retention.max_versions == 0 {
            violations.push("retention.max_versions must be at least 1".to_string());
        }
        for (field, value) in [
            ("command_timeout_secs", self.command_timeout_secs),
            ("heartbeat_timeout_secs", self.heartbeat_timeout_secs),
            ("heartbeat_interval_secs", self.heartbeat_interval_secs),
        ] {
            if value == 0 {
                violations.push(format!("{field} must be at least 1"));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for target in &self.targets {
            if target.id.0.is_empty() {
                violations.push("target with empty id".to_string());
            }
            if !seen.insert(target.id.clone()) {
                violations.push(format!("duplicate target id '{}'", target.id));
            }
            if target.address.is_empty() {
                violations.push(format!("target '{}' has an empty address", target.id));
                continue;
            }
            if target.kind == TargetKind::LocalDir {
                let dir = Path::new(&target.address);
                match std::fs::metadata(dir) {
                    Ok(meta) if meta.is_dir() => {}
                    Ok(_) => violations.push(format!(
                        "target '{}' address is not a directory: {}",
                        target.id, target.address
                    )),
                    Err(_) => violations.push(format!(
                        "target '{}' directory does not exist: {}",
                        target.id, target.address
                    )),
                }
            }
        }

        violations
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }
    pub fn drain_grace(&self) -> Duration {
        Duration::from_secs(self.drain_grace_secs)
    }
    pub fn viewer_grace(&self) -> Duration {
        Duration::from_secs(self.viewer_grace_secs)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn rooted_config_validates_clean() {
        let tmp = TempDir::new().expect("tempdir");
        let config = MirrorConfig::rooted_at(tmp.path());
        assert!(config.validate().is_empty());
    }

    #[test]
    fn validate_collects_every_violation() {
        let tmp = TempDir::new().expect("tempdir");
        let mut config = MirrorConfig::rooted_at(tmp.path());
        config.ring_buffer_chunks = 0;
        config.command_timeout_secs = 0;
        config.targets.push(TargetConfig {
            id: TargetId::from("gone"),
            kind: TargetKind::LocalDir,
            address: tmp.path().join("missing").display().to_string(),
        });
        config.targets.push(TargetConfig {
            id: TargetId::from("blank"),
            kind: TargetKind::RemoteSsh,
            address: String::new(),
        });

        let violations = config.validate();
        assert_eq!(violations.len(), 4, "all violations listed: {violations:?}");
        assert!(violations.iter().any(|v| v.contains("ring_buffer_chunks")));
        assert!(violations.iter().any(|v| v.contains("command_timeout_secs")));
        assert!(violations.iter().any(|v| v.contains("does not exist")));
        assert!(violations.iter().any(|v| v.contains("empty address")));
    }

    #[test]
    fn duplicate_target_ids_are_flagged() {
        let tmp = TempDir::new().expect("tempdir");
        let mut config = MirrorConfig::rooted_at(tmp.path());
        for _ in 0..2 {
            config.targets.push(TargetConfig {
                id: TargetId::from("twin"),
                kind: TargetKind::LocalDir,
                address: tmp.path().display().to_string(),
            });
        }
        let violations = config.validate();
        assert!(violations.iter().any(|v| v.contains("duplicate target id")));
    }

    #[test]
    fn load_parses_yaml() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("mirror.yaml");
        let yaml = format!(
            "root: {}\ntargets:\n  - id: main\n    kind: local_dir\n    address: {}\n",
            tmp.path().display(),
            tmp.path().display(),
        );
        std::fs::write(&path, yaml).expect("write");

        let config = MirrorConfig::load(&path).expect("load");
        assert_eq!(config.targets.len(), 1);
        assert_eq!(config.targets[0].kind, TargetKind::LocalDir);
        assert_eq!(config.command_timeout_secs, 300, "defaults applied");
        assert!(config.validate().is_empty());
    }

    #[test]
    fn default_root_lives_under_home() {
        if let Ok(root) = MirrorConfig::default_root() {
            assert!(root.ends_with(".mirrorcode"));
        }
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let tmp = TempDir::new().expect("tempdir");
        let err = MirrorConfig::load(&tmp.path().join("absent.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn load_malformed_yaml_is_parse_error() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("bad.yaml");
        std::fs::write(&path, "root: [unclosed").expect("write");
        let err = MirrorConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
