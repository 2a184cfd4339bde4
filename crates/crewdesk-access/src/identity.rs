//! ---
//! cd_section: "06-security-access-control"
//! cd_subsection: "module"
//! cd_type: "source"
//! cd_scope: "code"
//! cd_description: "Entitlement engine, role matrix, and tier catalog."
//! cd_version: "v0.0.0-prealpha"
//! cd_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::AccessError;
use crate::model::Principal;

/// Source of principal snapshots for a session.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Resolve the principal behind a session token.
    async fn principal(&self, session_token: &str) -> Result<Principal, AccessError>;
}

/// In-memory identity provider keyed by session token, for development and tests.
#[derive(Debug, Default, Clone)]
pub struct StaticIdentityProvider {
    sessions: Arc<RwLock<HashMap<String, Principal>>>,
    unavailable: Arc<AtomicBool>,
}

impl StaticIdentityProvider {
    /// Create an empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a session token to a principal, replacing any previous binding.
    pub fn insert_session(&self, token: impl Into<String>, principal: Principal) {
        self.sessions.write().insert(token.into(), principal);
    }

    /// Drop a session. Returns whether it existed.
    pub fn revoke_session(&self, token: &str) -> bool {
        self.sessions.write().remove(token).is_some()
    }

    /// Simulate an identity backend outage.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentityProvider {
    async fn principal(&self, session_token: &str) -> Result<Principal, AccessError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AccessError::UpstreamUnavailable(
                "identity provider offline".into(),
            ));
        }
        self.sessions
            .read()
            .get(session_token)
            .cloned()
            .ok_or(AccessError::NotAuthenticated)
    }
}
