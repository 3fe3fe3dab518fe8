//! Process-wide index of active sessions.
//!
//! Uses lock-free DashMap for concurrent access. The index serves discovery
//! only — notably the external HTTP order surface finding a session by
//! credential; all session state stays confined to the owning session.

use crate::session::SessionShared;
use common::LinkStateHandle;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

/// Unique session identifier.
pub type SessionId = Uuid;

/// What the external order-submission surface needs from a session before
/// handing a request to the order builder.
#[derive(Debug, Clone)]
pub struct OrderAccess {
    pub upstream_ready: bool,
    pub user_balance_id: Option<Value>,
    pub current_active: Option<u32>,
}

#[derive(Clone)]
struct Entry {
    shared: Arc<SessionShared>,
    link_state: Arc<LinkStateHandle>,
}

impl Entry {
    fn order_access(&self) -> OrderAccess {
        OrderAccess {
            upstream_ready: self.link_state.is_ready(),
            user_balance_id: self.shared.balance_id(),
            current_active: self.shared.current_active().map(|(id, _)| id),
        }
    }
}

/// Registry of live sessions, keyed by session id and by credential.
#[derive(Default)]
pub struct SessionIndex {
    by_id: DashMap<SessionId, Entry>,
    by_credential: DashMap<String, SessionId>,
}

impl SessionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, shared: Arc<SessionShared>, link_state: Arc<LinkStateHandle>) {
        self.by_credential
            .insert(shared.credential.clone(), shared.id);
        self.by_id.insert(shared.id, Entry { shared, link_state });
    }

    pub fn remove(&self, id: SessionId) {
        if let Some((_, entry)) = self.by_id.remove(&id) {
            // A newer session may have reused the credential; only unmap it
            // while it still points here.
            self.by_credential
                .remove_if(&entry.shared.credential, |_, mapped| *mapped == id);
        }
    }

    pub fn order_access(&self, id: SessionId) -> Option<OrderAccess> {
        self.by_id.get(&id).map(|entry| entry.order_access())
    }

    pub fn order_access_by_credential(&self, credential: &str) -> Option<OrderAccess> {
        let id = *self.by_credential.get(credential)?;
        self.order_access(id)
    }

    pub fn count(&self) -> usize {
        self.by_id.len()
    }
}
