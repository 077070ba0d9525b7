use crate::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Outcome of reading a persisted JSON record.
///
/// A record that exists but cannot be decoded is reported as `Corrupt` instead of an error so
/// callers can fall back to a full recompute.
#[derive(Debug, Clone, PartialEq)]
pub enum Loaded<T> {
    Missing,
    Corrupt(String),
    Present(T),
}

impl<T> Loaded<T> {
    pub fn into_option(self) -> Option<T> {
        match self {
            Self::Present(value) => Some(value),
            Self::Missing | Self::Corrupt(_) => None,
        }
    }

    pub fn is_corrupt(&self) -> bool {
        matches!(self, Self::Corrupt(_))
    }

    pub fn present(&self) -> Option<&T> {
        match self {
            Self::Present(value) => Some(value),
            Self::Missing | Self::Corrupt(_) => None,
        }
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Serialize `value` next to `path` and rename it into place.
pub async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_bytes_atomic(path, &bytes).await
}

pub async fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = tmp_path_for(path);
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

pub async fn read_json_lenient<T: DeserializeOwned>(path: &Path) -> Result<Loaded<T>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Loaded::Missing),
        Err(err) => return Err(err.into()),
    };
    match serde_json::from_slice(&bytes) {
        Ok(value) => Ok(Loaded::Present(value)),
        Err(err) => {
            log::warn!("Corrupt state file {}: {err}", path.display());
            Ok(Loaded::Corrupt(err.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Sample {
        n: u32,
    }

    #[tokio::test]
    async fn roundtrip_leaves_no_tmp_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("sample.json");
        write_json_atomic(&path, &Sample { n: 7 }).await.unwrap();

        let loaded: Loaded<Sample> = read_json_lenient(&path).await.unwrap();
        assert_eq!(loaded, Loaded::Present(Sample { n: 7 }));
        assert!(!tmp_path_for(&path).exists());
    }

    #[tokio::test]
    async fn rewrite_replaces_the_whole_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("record.json");
        write_bytes_atomic(&path, b"a much longer first version").await.unwrap();
        write_bytes_atomic(&path, b"short").await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"short");
        assert!(!tmp_path_for(&path).exists());
    }

    #[tokio::test]
    async fn truncated_file_reads_as_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sample.json");
        tokio::fs::write(&path, b"{\"n\": 7").await.unwrap();

        let loaded: Loaded<Sample> = read_json_lenient(&path).await.unwrap();
        assert!(loaded.is_corrupt());
        assert_eq!(loaded.into_option(), None);
    }

    #[tokio::test]
    async fn missing_file_reads_as_missing() {
        let dir = tempdir().unwrap();
        let loaded: Loaded<Sample> = read_json_lenient(&dir.path().join("nope.json"))
            .await
            .unwrap();
        assert_eq!(loaded, Loaded::Missing);
    }
}
