use crate::Result;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Identity of one tracked file as seen by the content hash.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
pub struct FileFingerprint {
    /// Project-relative, `/`-separated path
    pub path: String,
    pub size: u64,
    pub mtime_ns: u64,
}

impl FileFingerprint {
    /// Per-item hash used to decide whether a single file needs reprocessing.
    #[must_use]
    pub fn item_hash(&self) -> String {
        let mut hasher = Sha256::new();
        self.feed(&mut hasher);
        hex_digest(hasher)
    }

    fn feed(&self, hasher: &mut Sha256) {
        hasher.update(self.path.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.size.to_be_bytes());
        hasher.update(self.mtime_ns.to_be_bytes());
    }
}

/// Snapshot of the tracked file set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectFingerprint {
    pub files: Vec<FileFingerprint>,
    pub content_hash: String,
}

impl ProjectFingerprint {
    #[must_use]
    pub fn from_files(mut files: Vec<FileFingerprint>) -> Self {
        files.sort();
        files.dedup_by(|a, b| a.path == b.path);
        let content_hash = content_hash(&files);
        Self {
            files,
            content_hash,
        }
    }

    #[must_use]
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn get(&self, path: &str) -> Option<&FileFingerprint> {
        self.files
            .binary_search_by(|fp| fp.path.as_str().cmp(path))
            .ok()
            .map(|idx| &self.files[idx])
    }
}

/// Hash over `(path, size, mtime)` tuples.
///
/// The input is sorted by path first, so the result depends only on the file set and not on
/// enumeration order.
#[must_use]
pub fn content_hash(files: &[FileFingerprint]) -> String {
    let mut sorted: Vec<&FileFingerprint> = files.iter().collect();
    sorted.sort();
    let mut hasher = Sha256::new();
    hasher.update((sorted.len() as u64).to_be_bytes());
    for fp in sorted {
        fp.feed(&mut hasher);
    }
    hex_digest(hasher)
}

/// Hash of arbitrary named documents (used for seed/knowledge inputs).
#[must_use]
pub fn documents_hash<'a>(docs: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    let mut entries: Vec<(&str, &str)> = docs.into_iter().collect();
    entries.sort();
    let mut hasher = Sha256::new();
    for (name, body) in entries {
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        hasher.update((body.len() as u64).to_be_bytes());
        hasher.update(body.as_bytes());
    }
    hex_digest(hasher)
}

/// Stat every listed file. Files that vanished between listing and stat are skipped.
pub async fn fingerprint_files(root: &Path, files: &[PathBuf]) -> Result<ProjectFingerprint> {
    let mut out = Vec::with_capacity(files.len());
    for rel in files {
        let meta = match tokio::fs::metadata(root.join(rel)).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("Skipping vanished file {}", rel.display());
                continue;
            }
            Err(err) => return Err(err.into()),
        };
        let mtime_ns = meta
            .modified()
            .ok()
            .map(system_time_ns)
            .unwrap_or(0);
        out.push(FileFingerprint {
            path: rel.to_string_lossy().replace('\\', "/"),
            size: meta.len(),
            mtime_ns,
        });
    }
    Ok(ProjectFingerprint::from_files(out))
}

fn system_time_ns(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

fn hex_digest(hasher: Sha256) -> String {
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::fs;
    use std::time::Duration;
    use tempfile::tempdir;

    fn fp(path: &str, size: u64, mtime_ns: u64) -> FileFingerprint {
        FileFingerprint {
            path: path.to_string(),
            size,
            mtime_ns,
        }
    }

    #[test]
    fn hash_ignores_enumeration_order() {
        let a = vec![fp("a.rs", 1, 10), fp("b.rs", 2, 20)];
        let b = vec![fp("b.rs", 2, 20), fp("a.rs", 1, 10)];
        assert_eq!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn hash_changes_when_file_added() {
        let a = vec![fp("a.rs", 1, 10)];
        let b = vec![fp("a.rs", 1, 10), fp("b.rs", 0, 0)];
        assert_ne!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn project_fingerprint_lookup() {
        let project = ProjectFingerprint::from_files(vec![fp("z.rs", 1, 1), fp("a.rs", 2, 2)]);
        assert_eq!(project.get("a.rs").map(|f| f.size), Some(2));
        assert!(project.get("missing.rs").is_none());
        assert_eq!(project.file_count(), 2);
    }

    #[tokio::test]
    async fn touching_a_file_changes_the_hash() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("lib.rs");
        fs::write(&path, b"pub fn a() {}").unwrap();
        let files = vec![PathBuf::from("lib.rs")];

        let before = fingerprint_files(temp.path(), &files).await.unwrap();
        let file = fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(60))
            .unwrap();
        drop(file);
        let after = fingerprint_files(temp.path(), &files).await.unwrap();

        assert_ne!(before.content_hash, after.content_hash);
        assert_eq!(before.files[0].size, after.files[0].size);
    }

    #[tokio::test]
    async fn vanished_files_are_skipped() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join("kept.rs"), b"x").unwrap();
        let files = vec![PathBuf::from("kept.rs"), PathBuf::from("gone.rs")];

        let project = fingerprint_files(temp.path(), &files).await.unwrap();

        assert_eq!(project.file_count(), 1);
        assert_eq!(project.files[0].path, "kept.rs");
    }

    proptest! {
        #[test]
        fn proptest_any_mtime_change_changes_hash(
            sizes in proptest::collection::vec(0u64..10_000, 1..12),
            target in any::<prop::sample::Index>(),
            delta in 1u64..1_000_000_000,
        ) {
            let files: Vec<FileFingerprint> = sizes
                .iter()
                .enumerate()
                .map(|(i, size)| fp(&format!("src/f{i}.rs"), *size, 1_000_000 + i as u64))
                .collect();
            let mut changed = files.clone();
            let idx = target.index(changed.len());
            changed[idx].mtime_ns += delta;
            prop_assert_ne!(content_hash(&files), content_hash(&changed));
        }

        #[test]
        fn proptest_any_size_change_changes_item_hash(size in 0u64..u64::MAX - 1) {
            let a = fp("a.rs", size, 5);
            let b = fp("a.rs", size + 1, 5);
            prop_assert_ne!(a.item_hash(), b.item_hash());
        }
    }
}
