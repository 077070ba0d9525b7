use crate::{AnalysisError, Result};
use lore_indexer::{fingerprint_files, FileLister, ProjectFingerprint};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const README_CANDIDATES: &[&str] = &["README.md", "README", "readme.md", "README.rst", "README.txt"];
const README_EXCERPT_CHARS: usize = 2_000;
const LISTING_MAX_FILES: usize = 200;

/// What the engine knows about a project before any model call.
#[derive(Debug, Clone)]
pub struct ProjectContext {
    pub root: PathBuf,
    pub fingerprint: ProjectFingerprint,
    pub readme_excerpt: Option<String>,
}

impl ProjectContext {
    pub async fn collect(root: &Path, lister: &dyn FileLister) -> Result<Self> {
        let files = lister.list(root).await?;
        let fingerprint = fingerprint_files(root, &files).await?;
        let readme_excerpt = read_readme(root).await;
        log::debug!(
            "Collected {} files for {} (hash {})",
            fingerprint.file_count(),
            root.display(),
            &fingerprint.content_hash[..12.min(fingerprint.content_hash.len())]
        );
        Ok(Self {
            root: root.to_path_buf(),
            fingerprint,
            readme_excerpt,
        })
    }

    #[must_use]
    pub fn file_count(&self) -> usize {
        self.fingerprint.file_count()
    }

    /// Compact listing for prompts: extension histogram plus the first paths.
    #[must_use]
    pub fn listing(&self) -> String {
        let mut by_ext: BTreeMap<String, usize> = BTreeMap::new();
        for file in &self.fingerprint.files {
            let ext = Path::new(&file.path)
                .extension()
                .and_then(|e| e.to_str())
                .map(str::to_ascii_lowercase)
                .unwrap_or_else(|| "(none)".to_string());
            *by_ext.entry(ext).or_default() += 1;
        }
        let mut histogram: Vec<(String, usize)> = by_ext.into_iter().collect();
        histogram.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let mut out = format!("{} files\n", self.file_count());
        out.push_str("extensions: ");
        out.push_str(
            &histogram
                .iter()
                .map(|(ext, count)| format!("{ext}={count}"))
                .collect::<Vec<_>>()
                .join(", "),
        );
        out.push('\n');
        for file in self.fingerprint.files.iter().take(LISTING_MAX_FILES) {
            out.push_str(&file.path);
            out.push('\n');
        }
        if self.file_count() > LISTING_MAX_FILES {
            out.push_str(&format!(
                "... and {} more\n",
                self.file_count() - LISTING_MAX_FILES
            ));
        }
        out
    }

    /// File contents truncated to `max_chars`; `None` when unreadable.
    pub async fn read_excerpt(&self, rel: &str, max_chars: usize) -> Option<String> {
        let bytes = tokio::fs::read(self.root.join(rel)).await.ok()?;
        Some(truncate_chars(&String::from_utf8_lossy(&bytes), max_chars))
    }
}

/// Canonical form of a project path; it must name an existing directory.
pub(crate) async fn canonical_root(project: &Path) -> Result<PathBuf> {
    let root = tokio::fs::canonicalize(project).await.map_err(|err| {
        AnalysisError::Config(format!("Cannot open project {}: {err}", project.display()))
    })?;
    if !tokio::fs::metadata(&root).await?.is_dir() {
        return Err(AnalysisError::Config(format!(
            "Project path {} is not a directory",
            root.display()
        )));
    }
    Ok(root)
}

async fn read_readme(root: &Path) -> Option<String> {
    for name in README_CANDIDATES {
        if let Ok(text) = tokio::fs::read_to_string(root.join(name)).await {
            return Some(truncate_chars(&text, README_EXCERPT_CHARS));
        }
    }
    None
}

pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}\n[truncated]", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lore_indexer::ProjectFileLister;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[tokio::test]
    async fn collects_listing_and_readme() {
        let temp = tempdir().unwrap();
        std::fs::create_dir_all(temp.path().join("src")).unwrap();
        std::fs::write(temp.path().join("src/main.rs"), "fn main() {}").unwrap();
        std::fs::write(temp.path().join("src/cli.rs"), "pub fn run() {}").unwrap();
        std::fs::write(temp.path().join("README.md"), "# Tool\nDoes things.").unwrap();

        let ctx = ProjectContext::collect(temp.path(), &ProjectFileLister)
            .await
            .unwrap();

        assert_eq!(ctx.file_count(), 3);
        assert_eq!(ctx.readme_excerpt.as_deref(), Some("# Tool\nDoes things."));
        let listing = ctx.listing();
        assert!(listing.starts_with("3 files\nextensions: rs=2, md=1\n"));
        assert!(listing.contains("src/main.rs\n"));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé\n[truncated]");
        assert_eq!(truncate_chars("abc", 3), "abc");
    }
}
