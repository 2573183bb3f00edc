//! Harness configuration
//!
//! Everything the orchestrator would otherwise pick up from the process
//! environment (working directory, where to drop the registry file, which
//! namespaces it owns) is carried explicitly in a `HarnessConfig`.

use crate::TestbenchError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Working directory of role processes; relative log paths resolve here
    pub work_dir: PathBuf,
    /// Directory for the endpoint registry file, the work dir when unset
    pub registry_dir: Option<PathBuf>,
    /// Prefix of every namespace the netns substrate creates or purges
    pub netns_prefix: String,
    /// Grace period between SIGTERM and SIGKILL
    pub terminate_grace_ms: u64,
    /// Replaces the proxy command of every scenario when set
    pub proxy_program: Option<String>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("."),
            registry_dir: None,
            netns_prefix: "abr-".to_string(),
            terminate_grace_ms: 2000,
            proxy_program: None,
        }
    }
}

impl HarnessConfig {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            ..Self::default()
        }
    }

    pub fn from_json_file(path: &Path) -> Result<Self, TestbenchError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TestbenchError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|e| {
            TestbenchError::Config(format!("invalid config {}: {}", path.display(), e))
        })?;
        config.finalize()
    }

    /// Validate, and anchor relative directories to the current directory.
    ///
    /// Role processes run inside `work_dir`, so every path handed to them
    /// must be absolute or it would be resolved a second time.
    pub fn finalize(mut self) -> Result<Self, TestbenchError> {
        self.validate()?;
        let cwd = || {
            std::env::current_dir().map_err(|e| {
                TestbenchError::Config(format!("cannot determine current directory: {}", e))
            })
        };
        if self.work_dir.is_relative() {
            self.work_dir = cwd()?.join(&self.work_dir);
        }
        if let Some(dir) = self.registry_dir.take() {
            self.registry_dir = Some(if dir.is_relative() { cwd()?.join(dir) } else { dir });
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), TestbenchError> {
        let prefix_ok = !self.netns_prefix.is_empty()
            && self
                .netns_prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !prefix_ok {
            return Err(TestbenchError::Config(format!(
                "namespace prefix '{}' must be non-empty and alphanumeric",
                self.netns_prefix
            )));
        }
        if let Some(program) = &self.proxy_program {
            if program.trim().is_empty() {
                return Err(TestbenchError::Config(
                    "proxy_program must not be blank".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn registry_dir(&self) -> &Path {
        self.registry_dir.as_deref().unwrap_or(&self.work_dir)
    }

    /// Resolve `path` against the work dir unless it is already absolute
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.work_dir.join(path)
        }
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_and_resolution() {
        let config = HarnessConfig::new("/srv/bench");
        assert_eq!(config.registry_dir(), Path::new("/srv/bench"));
        assert_eq!(
            config.resolve(Path::new("log1.log")),
            PathBuf::from("/srv/bench/log1.log")
        );
        assert_eq!(config.resolve(Path::new("/tmp/x.log")), PathBuf::from("/tmp/x.log"));
        assert_eq!(config.terminate_grace(), Duration::from_secs(2));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: HarnessConfig =
            serde_json::from_str(r#"{ "netns_prefix": "ci-", "terminate_grace_ms": 100 }"#)
                .unwrap();
        assert_eq!(config.netns_prefix, "ci-");
        assert_eq!(config.work_dir, PathBuf::from("."));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_prefix() {
        let mut config = HarnessConfig::default();
        config.netns_prefix = String::new();
        assert!(config.validate().is_err());
        config.netns_prefix = "a b".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_finalize_anchors_relative_dirs() {
        let cwd = std::env::current_dir().unwrap();
        let config = HarnessConfig {
            registry_dir: Some(PathBuf::from("reg")),
            ..HarnessConfig::new("out")
        }
        .finalize()
        .unwrap();

        assert_eq!(config.work_dir, cwd.join("out"));
        assert_eq!(config.registry_dir(), cwd.join("reg"));
        assert_eq!(config.resolve(Path::new("log1.log")), cwd.join("out/log1.log"));

        let absolute = HarnessConfig::new("/srv/bench").finalize().unwrap();
        assert_eq!(absolute.work_dir, PathBuf::from("/srv/bench"));
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harness.json");
        std::fs::write(&path, r#"{ "work_dir": "/tmp", "proxy_program": "./miProxy" }"#).unwrap();
        let config = HarnessConfig::from_json_file(&path).unwrap();
        assert_eq!(config.proxy_program.as_deref(), Some("./miProxy"));

        std::fs::write(&path, r#"{ "work_dir": "rel" }"#).unwrap();
        let config = HarnessConfig::from_json_file(&path).unwrap();
        assert!(config.work_dir.is_absolute());

        assert!(HarnessConfig::from_json_file(&dir.path().join("missing.json")).is_err());
    }
}
