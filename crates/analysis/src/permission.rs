//! Consent gate for user-initiated analysis.
//!
//! [`PermissionService`] publishes each request on a broadcast bus and parks the caller on a
//! oneshot until someone answers through [`PermissionGate::grant`] or [`PermissionGate::deny`].

use crate::{AnalysisError, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::{broadcast, oneshot};

const EVENT_CAPACITY: usize = 32;

/// Who started a run. Only user-initiated runs go through the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Initiator {
    #[default]
    User,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermissionRequest {
    pub id: u64,
    pub action: String,
    pub project: PathBuf,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionEvent {
    Requested(PermissionRequest),
    Resolved { id: u64, granted: bool },
}

#[async_trait]
pub trait PermissionGate: Send + Sync {
    /// Blocks until the request is answered. `false` means denied.
    async fn request(&self, action: &str, project: PathBuf, detail: String) -> bool;

    /// Answers a pending request; `false` when no such request is pending.
    fn grant(&self, id: u64) -> bool;

    fn deny(&self, id: u64) -> bool;
}

#[derive(Debug)]
pub struct PermissionService {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<bool>>>,
    events: broadcast::Sender<PermissionEvent>,
    session_approved: AtomicBool,
}

impl Default for PermissionService {
    fn default() -> Self {
        Self::new()
    }
}

impl PermissionService {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            events,
            session_approved: AtomicBool::new(false),
        }
    }

    /// Service that approves every request without publishing it.
    pub fn always_allow() -> Self {
        let service = Self::new();
        service.grant_for_session();
        service
    }

    /// Approve this and every later request of the session.
    pub fn grant_for_session(&self) {
        self.session_approved.store(true, Ordering::SeqCst);
    }

    pub fn is_session_approved(&self) -> bool {
        self.session_approved.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PermissionEvent> {
        self.events.subscribe()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|pending| pending.len()).unwrap_or(0)
    }

    fn resolve(&self, id: u64, granted: bool) -> bool {
        let responder = self
            .pending
            .lock()
            .ok()
            .and_then(|mut pending| pending.remove(&id));
        let Some(responder) = responder else {
            return false;
        };
        let _ = responder.send(granted);
        let _ = self.events.send(PermissionEvent::Resolved { id, granted });
        true
    }
}

#[async_trait]
impl PermissionGate for PermissionService {
    async fn request(&self, action: &str, project: PathBuf, detail: String) -> bool {
        if self.is_session_approved() {
            log::debug!("Permission for '{action}' granted by session approval");
            return true;
        }
        if self.events.receiver_count() == 0 {
            log::warn!("Permission for '{action}' denied: nobody is listening for requests");
            return false;
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        match self.pending.lock() {
            Ok(mut pending) => {
                pending.insert(id, tx);
            }
            Err(_) => return false,
        }
        let request = PermissionRequest {
            id,
            action: action.to_string(),
            project,
            detail,
        };
        if self.events.send(PermissionEvent::Requested(request)).is_err() {
            self.resolve(id, false);
        }

        match rx.await {
            Ok(granted) => {
                log::info!(
                    "Permission for '{action}' {}",
                    if granted { "granted" } else { "denied" }
                );
                granted
            }
            Err(_) => {
                log::warn!("Permission request {id} dropped without an answer; denying");
                false
            }
        }
    }

    fn grant(&self, id: u64) -> bool {
        self.resolve(id, true)
    }

    fn deny(&self, id: u64) -> bool {
        self.resolve(id, false)
    }
}

/// Ask `gate` once for a user-initiated run; system runs pass straight through.
pub(crate) async fn ensure_permitted(
    gate: &dyn PermissionGate,
    initiator: Initiator,
    action: &str,
    project: &Path,
    detail: String,
) -> Result<()> {
    if initiator == Initiator::System {
        return Ok(());
    }
    if gate.request(action, project.to_path_buf(), detail).await {
        Ok(())
    } else {
        Err(AnalysisError::PermissionDenied {
            action: format!("{action} {}", project.display()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    async fn answer_next(service: Arc<PermissionService>, grant: bool) {
        let mut events = service.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if let PermissionEvent::Requested(request) = event {
                    if grant {
                        service.grant(request.id);
                    } else {
                        service.deny(request.id);
                    }
                    break;
                }
            }
        });
    }

    #[tokio::test]
    async fn request_waits_for_grant() {
        let service = Arc::new(PermissionService::new());
        answer_next(Arc::clone(&service), true).await;
        let granted = service
            .request("analyze", PathBuf::from("/p"), "quick".to_string())
            .await;
        assert!(granted);
        assert_eq!(service.pending_count(), 0);
    }

    #[tokio::test]
    async fn request_can_be_denied() {
        let service = Arc::new(PermissionService::new());
        answer_next(Arc::clone(&service), false).await;
        assert!(!service.request("analyze", PathBuf::from("/p"), String::new()).await);
    }

    #[tokio::test]
    async fn no_listener_means_denied() {
        let service = PermissionService::new();
        assert!(!service.request("scan", PathBuf::from("/p"), String::new()).await);
        assert!(!service.grant(1));
    }

    #[tokio::test]
    async fn system_runs_bypass_the_gate() {
        let service = PermissionService::new();
        let project = Path::new("/p");
        assert!(
            ensure_permitted(&service, Initiator::System, "analyze", project, String::new())
                .await
                .is_ok()
        );
        let err = ensure_permitted(&service, Initiator::User, "analyze", project, String::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AnalysisError::PermissionDenied { action } if action == "analyze /p"));
    }

    #[tokio::test]
    async fn session_approval_skips_the_bus() {
        let service = PermissionService::always_allow();
        let mut events = service.subscribe();
        assert!(service.request("analyze", PathBuf::from("/p"), String::new()).await);
        assert!(events.try_recv().is_err());
    }
}
