use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, IoResultExt, Result};
use crate::hash::{Hash, HASH_LEN};
use crate::types::ParentCommits;

/// snapshot file header: "eden" + three zero bytes + format version 1
const SNAPSHOT_MAGIC: &[u8; 8] = b"eden\x00\x00\x00\x01";
const SNAPSHOT_ONE_PARENT: usize = 8 + HASH_LEN;
const SNAPSHOT_TWO_PARENTS: usize = 8 + 2 * HASH_LEN;

/// a directory from outside the virtual filesystem reflected at a
/// secondary path inside the mount
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BindMount {
    pub name: String,
    /// source directory inside the client data directory
    pub path_in_client_dir: PathBuf,
}

/// persistent per-mount configuration, stored in the client directory
///
/// on-disk layout:
/// ```text
/// <client_dir>/config.toml    this record
/// <client_dir>/SNAPSHOT       working-copy parents
/// <client_dir>/overlay/       materialized state
/// <client_dir>/local-store/   local key-value cache (when per-mount)
/// ```
#[derive(Clone, Debug)]
pub struct CheckoutConfig {
    mount_path: PathBuf,
    client_dir: PathBuf,
    repo_type: String,
    repo_source: String,
    bind_mounts: Vec<BindMount>,
}

#[derive(Serialize, Deserialize)]
struct ConfigFile {
    repository: RepositorySection,
    #[serde(rename = "bind-mounts", default, skip_serializing_if = "BTreeMap::is_empty")]
    bind_mounts: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize)]
struct RepositorySection {
    #[serde(rename = "type")]
    repo_type: String,
    source: String,
}

impl CheckoutConfig {
    pub fn new(
        mount_path: impl Into<PathBuf>,
        client_dir: impl Into<PathBuf>,
        repo_type: impl Into<String>,
        repo_source: impl Into<String>,
    ) -> Self {
        Self {
            mount_path: mount_path.into(),
            client_dir: client_dir.into(),
            repo_type: repo_type.into(),
            repo_source: repo_source.into(),
            bind_mounts: Vec::new(),
        }
    }

    /// load the config.toml found in an existing client directory
    pub fn load_from_client_dir(
        mount_path: impl Into<PathBuf>,
        client_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        let client_dir = client_dir.into();
        let config_path = client_dir.join("config.toml");
        if !config_path.exists() {
            return Err(Error::NoCheckout(client_dir));
        }
        let contents = fs::read_to_string(&config_path).with_path(&config_path)?;
        let parsed: ConfigFile = toml::from_str(&contents)?;

        let bind_mounts = parsed
            .bind_mounts
            .into_iter()
            .map(|(name, path)| BindMount {
                path_in_client_dir: client_dir.join(path),
                name,
            })
            .collect();

        Ok(Self {
            mount_path: mount_path.into(),
            client_dir,
            repo_type: parsed.repository.repo_type,
            repo_source: parsed.repository.source,
            bind_mounts,
        })
    }

    /// write config.toml, creating the client directory if needed
    pub fn save(&self) -> Result<()> {
        fs::create_dir_all(&self.client_dir).with_path(&self.client_dir)?;
        let file = ConfigFile {
            repository: RepositorySection {
                repo_type: self.repo_type.clone(),
                source: self.repo_source.clone(),
            },
            bind_mounts: self
                .bind_mounts
                .iter()
                .map(|b| {
                    let relative = b
                        .path_in_client_dir
                        .strip_prefix(&self.client_dir)
                        .unwrap_or(&b.path_in_client_dir);
                    (b.name.clone(), relative.display().to_string())
                })
                .collect(),
        };
        let contents = toml::to_string_pretty(&file)?;
        let path = self.config_file_path();
        fs::write(&path, contents).with_path(&path)?;
        Ok(())
    }

    pub fn add_bind_mount(&mut self, name: impl Into<String>, path_in_client_dir: impl Into<PathBuf>) {
        self.bind_mounts.push(BindMount {
            name: name.into(),
            path_in_client_dir: path_in_client_dir.into(),
        });
    }

    pub fn mount_path(&self) -> &Path {
        &self.mount_path
    }

    pub fn client_dir(&self) -> &Path {
        &self.client_dir
    }

    pub fn repo_type(&self) -> &str {
        &self.repo_type
    }

    pub fn repo_source(&self) -> &str {
        &self.repo_source
    }

    pub fn bind_mounts(&self) -> &[BindMount] {
        &self.bind_mounts
    }

    pub fn config_file_path(&self) -> PathBuf {
        self.client_dir.join("config.toml")
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.client_dir.join("SNAPSHOT")
    }

    pub fn overlay_path(&self) -> PathBuf {
        self.client_dir.join("overlay")
    }

    pub fn local_store_path(&self) -> PathBuf {
        self.client_dir.join("local-store")
    }

    /// read the working-copy parents from the SNAPSHOT file
    ///
    /// only the 28-byte (one parent) and 48-byte (merge) forms are
    /// valid; anything else is corruption.
    pub fn read_snapshot(&self) -> Result<ParentCommits> {
        let path = self.snapshot_path();
        let bytes = fs::read(&path).with_path(&path)?;

        if bytes.len() != SNAPSHOT_ONE_PARENT && bytes.len() != SNAPSHOT_TWO_PARENTS {
            return Err(Error::CorruptSnapshot {
                path,
                reason: format!("unexpected length {}", bytes.len()),
            });
        }
        if &bytes[..8] != SNAPSHOT_MAGIC {
            return Err(Error::CorruptSnapshot {
                path,
                reason: "bad magic".to_string(),
            });
        }

        let parent1 = Hash::from_slice(&bytes[8..8 + HASH_LEN])?;
        let parent2 = if bytes.len() == SNAPSHOT_TWO_PARENTS {
            Some(Hash::from_slice(&bytes[8 + HASH_LEN..])?)
        } else {
            None
        };
        Ok(ParentCommits { parent1, parent2 })
    }

    /// replace the SNAPSHOT file atomically
    pub fn write_snapshot(&self, parents: &ParentCommits) -> Result<()> {
        let mut bytes = Vec::with_capacity(SNAPSHOT_TWO_PARENTS);
        bytes.extend_from_slice(SNAPSHOT_MAGIC);
        bytes.extend_from_slice(parents.parent1.as_bytes());
        if let Some(parent2) = &parents.parent2 {
            bytes.extend_from_slice(parent2.as_bytes());
        }

        let path = self.snapshot_path();
        let tmp = self.client_dir.join("SNAPSHOT.tmp");
        fs::create_dir_all(&self.client_dir).with_path(&self.client_dir)?;
        fs::write(&tmp, &bytes).with_path(&tmp)?;
        fs::rename(&tmp, &path).with_path(&path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::sha1_of;
    use tempfile::tempdir;

    fn test_config(client_dir: &Path) -> CheckoutConfig {
        CheckoutConfig::new("/mnt/checkout", client_dir, "hg", "ssh://server/big-repo")
    }

    #[test]
    fn test_config_toml_roundtrip() {
        let dir = tempdir().unwrap();
        let client_dir = dir.path().join("client");

        let mut config = test_config(&client_dir);
        config.add_bind_mount("buck-out", client_dir.join("buck-out"));
        config.save().unwrap();

        let loaded =
            CheckoutConfig::load_from_client_dir("/mnt/checkout", &client_dir).unwrap();
        assert_eq!(loaded.repo_type(), "hg");
        assert_eq!(loaded.repo_source(), "ssh://server/big-repo");
        assert_eq!(loaded.mount_path(), Path::new("/mnt/checkout"));
        assert_eq!(loaded.bind_mounts().len(), 1);
        assert_eq!(loaded.bind_mounts()[0].name, "buck-out");
        assert_eq!(
            loaded.bind_mounts()[0].path_in_client_dir,
            client_dir.join("buck-out")
        );
    }

    #[test]
    fn test_load_missing_client_dir() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(matches!(
            CheckoutConfig::load_from_client_dir("/mnt/x", &missing),
            Err(Error::NoCheckout(_))
        ));
    }

    #[test]
    fn test_snapshot_single_parent_roundtrip() {
        let dir = tempdir().unwrap();
        let config = test_config(&dir.path().join("client"));

        let parents = ParentCommits::single(sha1_of(b"parent-one"));
        config.write_snapshot(&parents).unwrap();

        let read = config.read_snapshot().unwrap();
        assert_eq!(read.parent1, parents.parent1);
        assert_eq!(read.parent2, None);

        // 28 bytes on disk
        assert_eq!(
            std::fs::metadata(config.snapshot_path()).unwrap().len(),
            28
        );
    }

    #[test]
    fn test_snapshot_merge_roundtrip() {
        let dir = tempdir().unwrap();
        let config = test_config(&dir.path().join("client"));

        let parents = ParentCommits::new(sha1_of(b"p1"), Some(sha1_of(b"p2")));
        config.write_snapshot(&parents).unwrap();

        let read = config.read_snapshot().unwrap();
        assert_eq!(read.parent1, parents.parent1);
        assert_eq!(read.parent2, parents.parent2);
        assert_eq!(
            std::fs::metadata(config.snapshot_path()).unwrap().len(),
            48
        );
    }

    #[test]
    fn test_snapshot_rejects_bad_lengths() {
        let dir = tempdir().unwrap();
        let config = test_config(&dir.path().join("client"));
        std::fs::create_dir_all(config.client_dir()).unwrap();

        std::fs::write(config.snapshot_path(), vec![0u8; 30]).unwrap();
        assert!(matches!(
            config.read_snapshot(),
            Err(Error::CorruptSnapshot { .. })
        ));

        std::fs::write(config.snapshot_path(), vec![0u8; 27]).unwrap();
        assert!(config.read_snapshot().is_err());
    }

    #[test]
    fn test_snapshot_rejects_bad_magic() {
        let dir = tempdir().unwrap();
        let config = test_config(&dir.path().join("client"));
        std::fs::create_dir_all(config.client_dir()).unwrap();

        let mut bytes = vec![0u8; 28];
        bytes[..8].copy_from_slice(b"noteden\x01");
        std::fs::write(config.snapshot_path(), bytes).unwrap();
        assert!(matches!(
            config.read_snapshot(),
            Err(Error::CorruptSnapshot { .. })
        ));
    }
}
