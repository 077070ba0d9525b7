use std::path::{Path, PathBuf};

pub const STATE_DIR_NAME: &str = ".lore";

const TIERS_DIR_NAME: &str = "tiers";
const KNOWLEDGE_DIR_NAME: &str = "knowledge";
const SCAN_RECORD_FILE_NAME: &str = "scan.json";
const HEALTH_FILE_NAME: &str = "health.json";
const LOCK_FILE_NAME: &str = "project.lock";
const CONFIG_FILE_NAMES: &[&str] = &["config.toml", "config.json"];

/// Project-local state directory (`<root>/.lore`).
#[must_use]
pub fn state_dir_for_project_root(root: &Path) -> PathBuf {
    root.join(STATE_DIR_NAME)
}

#[must_use]
pub fn tier_record_path(root: &Path, tier_name: &str) -> PathBuf {
    state_dir_for_project_root(root)
        .join(TIERS_DIR_NAME)
        .join(format!("{}.json", file_stem_for(tier_name)))
}

#[must_use]
pub fn knowledge_dir_for_project_root(root: &Path) -> PathBuf {
    state_dir_for_project_root(root).join(KNOWLEDGE_DIR_NAME)
}

#[must_use]
pub fn scan_record_path(root: &Path) -> PathBuf {
    state_dir_for_project_root(root).join(SCAN_RECORD_FILE_NAME)
}

#[must_use]
pub fn health_file_path(root: &Path) -> PathBuf {
    state_dir_for_project_root(root).join(HEALTH_FILE_NAME)
}

#[must_use]
pub fn lock_file_path(root: &Path) -> PathBuf {
    state_dir_for_project_root(root).join(LOCK_FILE_NAME)
}

/// First existing project config file, if any.
#[must_use]
pub fn project_config_path(root: &Path) -> Option<PathBuf> {
    let dir = state_dir_for_project_root(root);
    CONFIG_FILE_NAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|candidate| candidate.is_file())
}

#[must_use]
pub fn is_state_dir_name(name: &str) -> bool {
    name == STATE_DIR_NAME
}

/// Restrict persisted file names to a conservative character set.
#[must_use]
pub fn file_stem_for(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn tier_records_live_under_state_dir() {
        let root = Path::new("/work/project");
        assert_eq!(
            tier_record_path(root, "detailed"),
            PathBuf::from("/work/project/.lore/tiers/detailed.json")
        );
        assert_eq!(
            knowledge_dir_for_project_root(root),
            PathBuf::from("/work/project/.lore/knowledge")
        );
    }

    #[test]
    fn file_stems_are_sanitized() {
        assert_eq!(file_stem_for("deep dive/v2"), "deep_dive_v2");
        assert_eq!(file_stem_for("quick"), "quick");
    }
}
