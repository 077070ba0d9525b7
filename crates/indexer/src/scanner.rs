use crate::paths::is_state_dir_name;
use async_trait::async_trait;
use ignore::WalkBuilder;
use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use tokio::time::{timeout, Duration};

// `git ls-files` is normally instant; repos with huge untracked trees can make it crawl, in which
// case the directory walk is the cheaper answer.
const GIT_LS_FILES_TIMEOUT: Duration = Duration::from_millis(3_000);

/// Enumerates the tracked, indexable files of a project.
///
/// Paths are returned relative to the project root, `/`-separated and sorted.
#[async_trait]
pub trait FileLister: Send + Sync {
    async fn list(&self, root: &Path) -> crate::Result<Vec<PathBuf>>;
}

/// Default lister: version-control view first, directory walk as fallback.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProjectFileLister;

#[async_trait]
impl FileLister for ProjectFileLister {
    async fn list(&self, root: &Path) -> crate::Result<Vec<PathBuf>> {
        if !root.is_dir() {
            return Err(crate::IndexerError::InvalidPath(format!(
                "Path is not a directory: {}",
                root.display()
            )));
        }

        if let Some(files) = list_git_files(root).await {
            if !files.is_empty() {
                log::debug!("Listed {} files via git in {}", files.len(), root.display());
                return Ok(files);
            }
        }

        let walk_root = root.to_path_buf();
        let files = tokio::task::spawn_blocking(move || {
            let scanner = FileScanner::new(&walk_root);
            scanner
                .scan()
                .into_iter()
                .filter_map(|path| relative_to(&walk_root, &path))
                .collect::<BTreeSet<_>>()
        })
        .await
        .map_err(|e| crate::IndexerError::Other(format!("file walk task failed: {e}")))?;

        Ok(files.into_iter().collect())
    }
}

async fn list_git_files(root: &Path) -> Option<Vec<PathBuf>> {
    let output = timeout(
        GIT_LS_FILES_TIMEOUT,
        tokio::process::Command::new("git")
            .arg("-C")
            .arg(root)
            .arg("ls-files")
            .arg("-z")
            .arg("--cached")
            .arg("--others")
            .arg("--exclude-standard")
            .output(),
    )
    .await
    .ok()?
    .ok()?;
    if !output.status.success() {
        return None;
    }

    let mut files = BTreeSet::new();
    for raw in output.stdout.split(|b| *b == 0).filter(|s| !s.is_empty()) {
        let rel = PathBuf::from(String::from_utf8_lossy(raw).as_ref());
        if FileScanner::is_hidden_or_ignored(&rel) || !FileScanner::is_indexable(&rel) {
            continue;
        }
        // Tracked-but-deleted entries still show up in the index.
        let Ok(meta) = tokio::fs::metadata(root.join(&rel)).await else {
            continue;
        };
        if !meta.is_file() || meta.len() > MAX_FILE_SIZE_BYTES {
            continue;
        }
        files.insert(normalize_rel(&rel));
    }
    Some(files.into_iter().collect())
}

fn relative_to(root: &Path, path: &Path) -> Option<PathBuf> {
    path.strip_prefix(root).ok().map(normalize_rel)
}

fn normalize_rel(path: &Path) -> PathBuf {
    let text = path.to_string_lossy();
    if text.contains('\\') {
        PathBuf::from(text.replace('\\', "/"))
    } else {
        path.to_path_buf()
    }
}

/// Scanner for finding indexable files in a project directory
pub struct FileScanner {
    root: PathBuf,
}

impl FileScanner {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Walk the directory (.gitignore aware), returning absolute paths
    pub fn scan(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();

        let root = self.root.clone();
        let mut builder = WalkBuilder::new(&self.root);
        builder
            .hidden(true)
            .git_ignore(true)
            .git_global(true)
            .git_exclude(true)
            .require_git(false);
        builder.filter_entry(move |entry| {
            entry
                .path()
                .strip_prefix(&root)
                .map(|rel| !Self::is_hidden_or_ignored(rel))
                .unwrap_or(true)
        });

        for result in builder.build() {
            match result {
                Ok(entry) => {
                    let Some(file_type) = entry.file_type() else {
                        continue;
                    };
                    if !file_type.is_file() {
                        continue;
                    }

                    let path = entry.path();
                    if let Ok(meta) = entry.metadata() {
                        if meta.len() > MAX_FILE_SIZE_BYTES {
                            log::debug!(
                                "Skipping large file {} ({} bytes > {})",
                                path.display(),
                                meta.len(),
                                MAX_FILE_SIZE_BYTES
                            );
                            continue;
                        }
                    }

                    if !Self::is_indexable(path) {
                        continue;
                    }

                    files.push(path.to_path_buf());
                }
                Err(e) => log::warn!("Failed to read entry: {e}"),
            }
        }

        log::debug!("Found {} indexable files", files.len());
        files
    }

    /// Check if file has an indexable name or extension
    pub fn is_indexable(path: &Path) -> bool {
        if let Some(file_name) = path.file_name().and_then(|name| name.to_str()) {
            if NOISE_FILE_NAMES
                .iter()
                .any(|candidate| file_name.eq_ignore_ascii_case(candidate))
            {
                return false;
            }
            if INDEXABLE_FILE_NAMES.contains(&file_name) {
                return true;
            }
        }

        if let Some(ext) = path.extension().and_then(|ext| ext.to_str()) {
            let ext = ext.to_lowercase();
            return INDEXABLE_EXTENSIONS
                .iter()
                .any(|candidate| candidate == &ext);
        }

        false
    }

    /// Relative path check: hidden components, state dir and build/vendor scopes.
    fn is_hidden_or_ignored(relative: &Path) -> bool {
        for component in relative.components() {
            if let Component::Normal(name) = component {
                let name = name.to_string_lossy();
                if name.starts_with('.') || is_state_dir_name(&name) {
                    return true;
                }
                let lowered = name.to_lowercase();
                if IGNORED_SCOPES.iter().any(|ignored| ignored == &lowered) {
                    return true;
                }
            }
        }
        false
    }
}

const IGNORED_SCOPES: &[&str] = &[
    "node_modules",
    "build",
    "dist",
    "coverage",
    "target",
    "vendor",
    "third_party",
    "third-party",
    "__pycache__",
    "venv",
];

const NOISE_FILE_NAMES: &[&str] = &[
    "package-lock.json",
    "pnpm-lock.yaml",
    "yarn.lock",
    "Cargo.lock",
    "go.sum",
];

const INDEXABLE_FILE_NAMES: &[&str] = &["Dockerfile", "Makefile", "makefile", "Justfile", "Gemfile"];

const MAX_FILE_SIZE_BYTES: u64 = 1_048_576; // 1 MB

const INDEXABLE_EXTENSIONS: &[&str] = &[
    // General purpose languages
    "rs", "py", "js", "mjs", "cjs", "ts", "tsx", "jsx", "java", "kt", "kts", "go", "c", "h", "cpp",
    "cc", "cxx", "hpp", "hh", "cs", "rb", "swift", "php", "scala", "dart", "zig", "lua", "ex",
    "exs", "clj", "hs", "ml", "el", // Scripts
    "sh", "bash", "zsh", "fish", "ps1", // Docs
    "md", "rst", "adoc", "txt", // Config / infra
    "yaml", "yml", "json", "toml", "ini", "cfg", "xml", "html", "css", "scss", "sql", "tf", "proto",
    "gradle",
];
