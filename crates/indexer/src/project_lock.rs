use crate::paths::lock_file_path;
use crate::{IndexerError, Result};
use fs2::FileExt;
use std::path::Path;
use std::time::Instant;

/// Exclusive cross-process lock on a project's state directory.
///
/// Released on drop.
pub struct ProjectLock {
    file: std::fs::File,
    waited_ms: u64,
}

impl ProjectLock {
    /// How long acquisition blocked behind another holder.
    #[must_use]
    pub fn waited_ms(&self) -> u64 {
        self.waited_ms
    }
}

impl Drop for ProjectLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

impl std::fmt::Debug for ProjectLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectLock")
            .field("waited_ms", &self.waited_ms)
            .finish()
    }
}

pub async fn acquire_project_lock(root: &Path) -> Result<ProjectLock> {
    let path = lock_file_path(root);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let lock = tokio::task::spawn_blocking(move || -> Result<ProjectLock> {
        use std::fs::OpenOptions;

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|err| {
                IndexerError::Other(format!("open project lock {}: {err}", path.display()))
            })?;

        let start = Instant::now();
        file.lock_exclusive().map_err(|err| {
            IndexerError::Other(format!("acquire project lock {}: {err}", path.display()))
        })?;
        let waited_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        if waited_ms > 0 {
            log::debug!("Waited {waited_ms}ms for project lock {}", path.display());
        }

        Ok(ProjectLock { file, waited_ms })
    })
    .await
    .map_err(|err| IndexerError::Other(format!("join project lock task: {err}")))??;

    Ok(lock)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    #[tokio::test]
    async fn second_holder_waits_for_release() {
        let temp = tempdir().unwrap();
        let root = temp.path().to_path_buf();

        let first = acquire_project_lock(&root).await.unwrap();
        let contender = tokio::spawn({
            let root = root.clone();
            async move { acquire_project_lock(&root).await.map(|lock| lock.waited_ms()) }
        });

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!contender.is_finished());
        drop(first);

        let waited = contender.await.unwrap().unwrap();
        assert!(waited >= 50, "expected contention, waited {waited}ms");
    }
}
