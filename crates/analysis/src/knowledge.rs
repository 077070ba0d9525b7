use crate::Result;
use lore_indexer::{file_stem_for, knowledge_dir_for_project_root, write_bytes_atomic};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const OVERVIEW: &str = "overview.md";
pub const ARCHITECTURE: &str = "architecture.md";
pub const DEEP_DIVE: &str = "deep-dive.md";
pub const SUMMARY: &str = "summary.md";

pub const ALL_DOCUMENTS: [&str; 4] = [OVERVIEW, ARCHITECTURE, DEEP_DIVE, SUMMARY];

/// Knowledge documents by file name.
pub type KnowledgeFiles = BTreeMap<String, String>;

#[must_use]
pub fn knowledge_path(root: &Path, name: &str) -> PathBuf {
    knowledge_dir_for_project_root(root).join(file_stem_for(name))
}

/// Reads the named documents; missing or unreadable ones are skipped.
pub async fn read_knowledge(root: &Path, names: &[&str]) -> KnowledgeFiles {
    let mut docs = KnowledgeFiles::new();
    for name in names {
        match tokio::fs::read_to_string(knowledge_path(root, name)).await {
            Ok(body) => {
                docs.insert((*name).to_string(), body);
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => log::warn!("Skipping unreadable knowledge file {name}: {err}"),
        }
    }
    docs
}

pub async fn read_all_knowledge(root: &Path) -> KnowledgeFiles {
    read_knowledge(root, &ALL_DOCUMENTS).await
}

/// Each document is replaced atomically; a failure leaves earlier files already written.
pub async fn write_knowledge(root: &Path, docs: &KnowledgeFiles) -> Result<()> {
    for (name, body) in docs {
        write_bytes_atomic(&knowledge_path(root, name), body.as_bytes()).await?;
    }
    log::debug!(
        "Wrote {} knowledge files under {}",
        docs.len(),
        knowledge_dir_for_project_root(root).display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[tokio::test]
    async fn written_documents_read_back() {
        let temp = tempdir().unwrap();
        let mut docs = KnowledgeFiles::new();
        docs.insert(OVERVIEW.to_string(), "# Overview\n".to_string());
        write_knowledge(temp.path(), &docs).await.unwrap();

        let read = read_knowledge(temp.path(), &[OVERVIEW, ARCHITECTURE]).await;
        assert_eq!(read, docs);
        assert!(temp.path().join(".lore/knowledge/overview.md").is_file());
    }
}
