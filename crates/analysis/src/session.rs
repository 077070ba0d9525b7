use crate::model::Tier;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// In-process state of one project.
#[derive(Debug, Default)]
pub struct ProjectSession {
    /// Serializes scans and cascades on this project within the process.
    pub(crate) analysis: tokio::sync::Mutex<()>,
    scans: AtomicU64,
    tier_runs: AtomicU64,
    last_tier: Mutex<Option<Tier>>,
}

impl ProjectSession {
    pub fn scans(&self) -> u64 {
        self.scans.load(Ordering::SeqCst)
    }

    pub fn tier_runs(&self) -> u64 {
        self.tier_runs.load(Ordering::SeqCst)
    }

    pub fn last_tier(&self) -> Option<Tier> {
        self.last_tier.lock().ok().and_then(|tier| *tier)
    }

    pub(crate) fn record_scan(&self) {
        self.scans.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_tier(&self, tier: Tier) {
        self.tier_runs.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut last) = self.last_tier.lock() {
            *last = Some(tier);
        }
    }
}

/// Sessions keyed by canonical project path.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<PathBuf, Arc<ProjectSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Session for `root`, created on first use. `root` should already be canonical.
    pub fn session(&self, root: &Path) -> Arc<ProjectSession> {
        match self.sessions.lock() {
            Ok(mut sessions) => Arc::clone(sessions.entry(root.to_path_buf()).or_default()),
            Err(poisoned) => {
                let mut sessions = poisoned.into_inner();
                Arc::clone(sessions.entry(root.to_path_buf()).or_default())
            }
        }
    }

    pub fn get(&self, root: &Path) -> Option<Arc<ProjectSession>> {
        self.sessions
            .lock()
            .ok()
            .and_then(|sessions| sessions.get(root).cloned())
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn same_root_shares_one_session() {
        let registry = SessionRegistry::new();
        let a = registry.session(Path::new("/p"));
        let b = registry.session(Path::new("/p"));
        registry.session(Path::new("/q"));

        a.record_tier(Tier::Deep);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.tier_runs(), 1);
        assert_eq!(b.last_tier(), Some(Tier::Deep));
        assert_eq!(registry.len(), 2);
    }
}
