// [src/lib.rs]
//! Core Kerberos/SPNEGO validator, authorization engine and keytab
//! rotation controller for gMSA-based service authentication.
//!
//! This crate has no transport, no CLI and no storage backend of its own —
//! those are injected collaborators (see [`storage::Storage`],
//! [`rotation::collaborators`], [`session::SessionIssuer`]). A host binary
//! wires a concrete [`context::CoreContext`] together and drives it.

pub mod authz;
pub mod config;
pub mod context;
pub mod der;
pub mod error;
pub mod keytab;
pub mod normalize;
pub mod observability;
pub mod pac;
pub mod role;
pub mod rotation;
pub mod session;
pub mod spnego;
pub mod storage;

/// Convenience re-exports of the types most callers need, the way
/// `libs/core/client-vault-rs` exposes a `prelude` module.
pub mod prelude {
    pub use crate::authz::{authorize, AuthzDecision};
    pub use crate::config::{ConfigStore, ConfigView, Configuration};
    pub use crate::context::CoreContext;
    pub use crate::error::{CoreError, CoreResult};
    pub use crate::keytab::{EncType, Keytab, KeytabEntry};
    pub use crate::normalize::NormalizationRules;
    pub use crate::observability::{HealthSnapshot, ObservabilityRegistry};
    pub use crate::role::{MergeStrategy, RoleRecord, RoleStore, TokenType};
    pub use crate::rotation::collaborators::{DomainInspector, KeytabGenerator, NotificationSink};
    pub use crate::rotation::{RotationConfig, RotationController, RotationState, RotationStatus};
    pub use crate::session::{SessionHandle, SessionIssuer};
    pub use crate::spnego::{SpnegoValidator, ValidatedIdentity};
    pub use crate::storage::Storage;
}
