use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, serde_as};

const MIB: u64 = 1024 * 1024;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct S3Options {
    pub region: Option<String>,
    pub endpoint_url: Option<String>,
    pub anonymous: bool,
    pub allow_http: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum StorageConfig {
    #[default]
    InMemory,
    /// Buckets are directories under this root.
    LocalFileSystem(PathBuf),
    S3(S3Options),
}

#[serde_as]
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChunkStoreConfig {
    /// Memory budget for cached chunk arrays, dirty ones included
    pub max_cache_bytes: u64,
    /// How long a reader waits on another task's fetch of the same chunk before fetching itself
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub fetch_wait: Duration,
    /// How long admission waits for dirty chunks to be flushed before failing
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub backpressure_wait: Duration,
    /// Fail reads whose payload cannot be decompressed instead of using the stored bytes
    pub strict_decompression: bool,
    /// Bucket used when callers do not name one
    pub default_bucket: Option<String>,
}

impl Default for ChunkStoreConfig {
    fn default() -> Self {
        Self {
            max_cache_bytes: 128 * MIB,
            fetch_wait: Duration::from_secs(2),
            backpressure_wait: Duration::from_secs(10),
            strict_decompression: false,
            default_bucket: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LayoutConfig {
    pub min_chunk_bytes: u64,
    pub max_chunk_bytes: u64,
    /// Extent assumed for unlimited dimensions when guessing a chunk shape
    pub unlimited_extent_guess: u64,
    pub contiguous_min_bytes: u64,
    pub contiguous_max_bytes: u64,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            min_chunk_bytes: MIB,
            max_chunk_bytes: 4 * MIB,
            unlimited_extent_guess: 1024,
            contiguous_min_bytes: 1000 * 1000,
            contiguous_max_bytes: 4 * 1000 * 1000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct HsdsConfig {
    pub chunk_store: ChunkStoreConfig,
    pub layout: LayoutConfig,
    pub storage: StorageConfig,
}

impl HsdsConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, serde_yaml_ng::Error> {
        serde_yaml_ng::from_str(yaml)
    }

    pub fn from_yaml_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let file = std::fs::File::open(path)?;
        Ok(serde_yaml_ng::from_reader(file)?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid configuration: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::Write;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config = HsdsConfig::from_yaml_str(
            r#"
chunk_store:
  max_cache_bytes: 1048576
  fetch_wait: 500
  default_bucket: hsdstest
layout:
  min_chunk_bytes: 16384
storage: !LocalFileSystem /tmp/hsds
"#,
        )
        .unwrap();
        assert_eq!(config.chunk_store.max_cache_bytes, MIB);
        assert_eq!(config.chunk_store.fetch_wait, Duration::from_millis(500));
        assert_eq!(config.chunk_store.backpressure_wait, Duration::from_secs(10));
        assert_eq!(config.chunk_store.default_bucket.as_deref(), Some("hsdstest"));
        assert_eq!(config.layout.min_chunk_bytes, 16384);
        assert_eq!(config.layout.max_chunk_bytes, 4 * MIB);
        assert_eq!(config.storage, StorageConfig::LocalFileSystem("/tmp/hsds".into()));
    }

    #[test]
    fn test_yaml_file_roundtrip() {
        let config = HsdsConfig {
            storage: StorageConfig::S3(S3Options {
                region: Some("us-east-1".to_string()),
                endpoint_url: Some("http://localhost:9000".to_string()),
                anonymous: false,
                allow_http: true,
            }),
            ..HsdsConfig::default()
        };
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(serde_yaml_ng::to_string(&config).unwrap().as_bytes()).unwrap();
        assert_eq!(HsdsConfig::from_yaml_file(file.path()).unwrap(), config);
    }
}
