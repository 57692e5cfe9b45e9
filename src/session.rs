// [src/session.rs]
//! Session Issuer contract (component C8).
//!
//! The core never mints a token itself — it hands a fully-decided
//! [`AuthzDecision`] to an injected collaborator and returns whatever handle
//! that collaborator produces, the same external-sink discipline
//! `libs/infra/db-turso/src/repositories/notification.rs` uses for its
//! delivery step.

use async_trait::async_trait;

use crate::authz::AuthzDecision;
use crate::error::CoreError;

/// Opaque handle returned by a [`SessionIssuer`]; the core does not
/// interpret its contents beyond passing it back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub token: String,
    pub lease_id: String,
}

/// External collaborator that turns a granted [`AuthzDecision`] into an
/// actual session/token. Left entirely to the host — this core only
/// decides *whether* and *what*, never *how* a session is represented on
/// the wire.
#[async_trait]
pub trait SessionIssuer: Send + Sync {
    async fn issue(&self, decision: &AuthzDecision) -> Result<SessionHandle, CoreError>;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records how many times it was called; used by rotation/authz tests
    /// that need a `SessionIssuer` without asserting on token contents.
    pub(crate) struct CountingIssuer {
        pub(crate) calls: AtomicUsize,
    }

    impl CountingIssuer {
        pub(crate) fn new() -> Self {
            Self { calls: AtomicUsize::new(0) }
        }
    }

    #[async_trait]
    impl SessionIssuer for CountingIssuer {
        async fn issue(&self, decision: &AuthzDecision) -> Result<SessionHandle, CoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(SessionHandle {
                token: format!("token-for-{}", decision.principal),
                lease_id: format!("lease-{}", decision.role),
            })
        }
    }

    #[tokio::test]
    async fn counting_issuer_tracks_calls_and_echoes_principal() {
        let issuer = CountingIssuer::new();
        let decision = AuthzDecision {
            principal: "svc-account@LOCAL.LAB".into(),
            display_name: "gmsa-svc-account@LOCAL.LAB".into(),
            role: "vault-agent".into(),
            realm: "LOCAL.LAB".into(),
            token_type: crate::role::TokenType::Service,
            policies: Default::default(),
            group_sids: Default::default(),
            period: 3600,
            max_ttl: 7200,
            metadata: Default::default(),
        };
        let handle = issuer.issue(&decision).await.unwrap();
        assert_eq!(handle.token, "token-for-svc-account@LOCAL.LAB");
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 1);
    }
}
