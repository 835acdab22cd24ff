//! Configuration loading (`cfg.yaml`)

use crate::error::{Result, TransmitError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const HOME: &str = "data";

/// One configured registry endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Repo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub registry: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    /// Optional destination repository prefix.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repository: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub pathname: String,
    #[serde(default)]
    pub keepdays: u64,
    /// GiB cap for the cache directory.
    #[serde(default)]
    pub keepsize: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DingTalkAccess {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub secret: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransmitConfig {
    #[serde(default, rename = "source")]
    pub src_repos: Vec<Repo>,
    #[serde(default, rename = "target")]
    pub dst_repos: Vec<Repo>,
    #[serde(default)]
    pub maxconn: usize,
    #[serde(default)]
    pub retries: usize,
    #[serde(default)]
    pub singlefile: bool,
    #[serde(default)]
    pub dockerfile: bool,
    #[serde(default)]
    pub compressor: String,
    /// Squashfs mode flags: `stream`, `nocmd`.
    #[serde(default)]
    pub squashfs: String,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub keeptemp: bool,
    #[serde(default)]
    pub outprefix: String,
    /// Watch-mode poll seconds.
    #[serde(default)]
    pub interval: u64,
    #[serde(default)]
    pub skiptlsverify: bool,
    #[serde(default)]
    pub dingtalk: Vec<DingTalkAccess>,
    #[serde(default)]
    pub lang: String,
}

impl TransmitConfig {
    /// Read `cfg.yaml` from the working directory, falling back to
    /// `data/cfg.yaml`, and apply defaults.
    pub fn load() -> Result<TransmitConfig> {
        let candidates = [PathBuf::from("cfg.yaml"), Path::new(HOME).join("cfg.yaml")];
        let path = candidates
            .iter()
            .find(|p| p.exists())
            .ok_or_else(|| TransmitError::Config("cfg.yaml not found".to_string()))?;
        Self::load_from(path)
    }

    pub fn load_from(path: &Path) -> Result<TransmitConfig> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| TransmitError::Config(format!("read {} failed: {}", path.display(), e)))?;
        let mut cfg: TransmitConfig = serde_yaml::from_str(&text)
            .map_err(|e| TransmitError::Config(format!("parse {} failed: {}", path.display(), e)))?;
        cfg.apply_defaults();
        Ok(cfg)
    }

    pub fn apply_defaults(&mut self) {
        if self.maxconn == 0 {
            self.maxconn = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
        }
        if self.retries == 0 {
            self.retries = 2;
        }
        if self.interval == 0 {
            self.interval = 60;
        }
    }

    pub fn find_src_repo(&self, name: &str) -> Option<&Repo> {
        self.src_repos.iter().find(|r| r.name == name)
    }

    pub fn find_dst_repo(&self, name: &str) -> Option<&Repo> {
        self.dst_repos.iter().find(|r| r.name == name)
    }

    pub fn squashfs_flag(&self, flag: &str) -> bool {
        self.squashfs.contains(flag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_defaults() {
        let text = r#"
source:
- name: nj
  registry: hub.x.io
  user: u
  password: p
target:
- name: gz
  registry: hub.y.io
  user: u
  password: p
  repository: mirror
compressor: tar
singlefile: true
cache:
  pathname: cache
  keepdays: 7
  keepsize: 10
"#;
        let mut cfg: TransmitConfig = serde_yaml::from_str(text).unwrap();
        cfg.apply_defaults();
        assert_eq!(cfg.src_repos.len(), 1);
        assert_eq!(cfg.find_dst_repo("gz").unwrap().repository, "mirror");
        assert!(cfg.find_dst_repo("nope").is_none());
        assert_eq!(cfg.retries, 2);
        assert_eq!(cfg.interval, 60);
        assert!(cfg.maxconn >= 1);
        assert!(cfg.singlefile);
        assert_eq!(cfg.cache.keepsize, 10);
    }

    #[test]
    fn test_squashfs_flags() {
        let cfg = TransmitConfig {
            squashfs: "stream,nocmd".to_string(),
            ..Default::default()
        };
        assert!(cfg.squashfs_flag("stream"));
        assert!(cfg.squashfs_flag("nocmd"));
        assert!(!cfg.squashfs_flag("other"));
    }
}
