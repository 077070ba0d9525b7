//! Terminal answers for the permission gate.

use dialoguer::Confirm;
use lore_analysis::{PermissionEvent, PermissionGate, PermissionRequest, PermissionService};
use std::io::IsTerminal;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};

/// `--yes` approves the whole session. Otherwise requests are asked on the terminal; without one
/// nobody listens and user-initiated runs are denied.
pub(crate) fn gate(assume_yes: bool) -> Arc<dyn PermissionGate> {
    if assume_yes {
        return Arc::new(PermissionService::always_allow());
    }
    let service = Arc::new(PermissionService::new());
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        let events = service.subscribe();
        tokio::spawn(answer_requests(Arc::clone(&service), events));
    } else {
        log::debug!("No terminal to ask on; runs need --yes");
    }
    service
}

async fn answer_requests(
    service: Arc<PermissionService>,
    mut events: broadcast::Receiver<PermissionEvent>,
) {
    loop {
        match events.recv().await {
            Ok(PermissionEvent::Requested(request)) => {
                let id = request.id;
                let granted = tokio::task::spawn_blocking(move || confirm(&request))
                    .await
                    .unwrap_or(false);
                let answered = if granted {
                    service.grant(id)
                } else {
                    service.deny(id)
                };
                if !answered {
                    log::debug!("Permission request {id} was no longer pending");
                }
            }
            Ok(PermissionEvent::Resolved { .. }) => {}
            Err(RecvError::Lagged(skipped)) => {
                log::warn!("Skipped {skipped} permission events");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

fn confirm(request: &PermissionRequest) -> bool {
    let mut prompt = format!("Allow {} of {}?", request.action, request.project.display());
    if !request.detail.is_empty() {
        prompt.push_str(&format!(" ({})", request.detail));
    }
    match Confirm::new().with_prompt(prompt).default(false).interact() {
        Ok(answer) => answer,
        Err(err) => {
            log::warn!("Could not read an answer: {err}");
            false
        }
    }
}
