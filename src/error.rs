// [src/error.rs]
//! Error taxonomy (component C11).
//!
//! One bracketed stratum tag per fault family, following the
//! `libs/infra/db-turso` error-catalog convention: a screaming-snake-case
//! code after the tag, and `#[from]` conversions from the lower strata so
//! callers only ever match on `CoreError`.

use thiserror::Error;

/// Top-level error surfaced across every public operation of the core.
///
/// `Display` carries full diagnostic detail (safe to write to the
/// structured log alongside a correlation id); [`CoreError::safe_message`]
/// returns the opaque, user-facing string defined by the §7 error taxonomy.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("[CONFIG_FAULT]: CONFIG_MISSING")]
    ConfigMissing,

    #[error("[CONFIG_FAULT]: CONFIG_INVALID -> {0}")]
    ConfigInvalid(String),

    #[error("[ROLE_FAULT]: ROLE_NOT_FOUND -> {0}")]
    RoleNotFound(String),

    #[error("[INPUT_FAULT]: INVALID_INPUT -> {0}")]
    InvalidInput(String),

    #[error("[SPNEGO_FAULT]: INVALID_SPNEGO -> {0}")]
    InvalidSpnego(String),

    #[error("[KERBEROS_FAULT]: TICKET_VALIDATION_FAILED -> {0}")]
    KerberosFailed(String),

    #[error("[SPNEGO_FAULT]: CLOCK_SKEW_EXCEEDED -> authenticator offset {offset_sec}s exceeds tolerance {tolerance_sec}s")]
    ClockSkew { offset_sec: i64, tolerance_sec: i64 },

    #[error("[SPNEGO_FAULT]: REPLAY_DETECTED")]
    Replay,

    #[error("[SPNEGO_FAULT]: CHANNEL_BINDING_MISMATCH")]
    ChannelBinding,

    #[error("[PAC_FAULT]: PAC_MISSING")]
    PacMissing,

    #[error("[PAC_FAULT]: PAC_INVALID -> {0}")]
    PacInvalid(String),

    #[error("[AUTHZ_FAULT]: NOT_AUTHORIZED -> {0}")]
    NotAuthorized(String),

    #[error("[AUTHZ_FAULT]: DENIED -> matched deny rule {0}")]
    Denied(String),

    #[error("[STORAGE_FAULT]: STORAGE_IO -> {0}")]
    Storage(String),

    #[error("[ROTATION_FAULT]: ROTATION_BUSY")]
    Busy,

    #[error("[ROTATION_FAULT]: ROTATION_GENERATE -> {0}")]
    RotationGenerate(String),

    #[error("[ROTATION_FAULT]: ROTATION_VALIDATE -> {0}")]
    RotationValidate(String),

    #[error("[ROTATION_FAULT]: ROTATION_PERSIST -> {0}")]
    RotationPersist(String),
}

impl CoreError {
    /// The machine-readable code named in §7, stable across revisions.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::ConfigMissing => "ErrConfigMissing",
            CoreError::ConfigInvalid(_) => "ErrConfigInvalid",
            CoreError::RoleNotFound(_) => "ErrRoleNotFound",
            CoreError::InvalidInput(_) => "ErrInvalidInput",
            CoreError::InvalidSpnego(_) => "ErrInvalidSPNEGO",
            CoreError::KerberosFailed(_) => "ErrKerberosFailed",
            CoreError::ClockSkew { .. } => "ErrClockSkew",
            CoreError::Replay => "ErrReplay",
            CoreError::ChannelBinding => "ErrChannelBinding",
            CoreError::PacMissing => "ErrPACMissing",
            CoreError::PacInvalid(_) => "ErrPACInvalid",
            CoreError::NotAuthorized(_) => "ErrNotAuthorized",
            CoreError::Denied(_) => "ErrDenied",
            CoreError::Storage(_) => "ErrStorage",
            CoreError::Busy => "ErrBusy",
            CoreError::RotationGenerate(_) => "ErrRotationGenerate",
            CoreError::RotationValidate(_) => "ErrRotationValidate",
            CoreError::RotationPersist(_) => "ErrRotationPersist",
        }
    }

    /// Short opaque message safe to return in an HTTP/RPC response body.
    /// No keytab bytes, principal, or stack detail ever appear here.
    pub fn safe_message(&self) -> &'static str {
        match self {
            CoreError::ConfigMissing => "authentication backend is not configured",
            CoreError::ConfigInvalid(_) => "configuration rejected",
            CoreError::RoleNotFound(_) => "role not found",
            CoreError::InvalidInput(_) => "invalid request",
            CoreError::InvalidSpnego(_) => "malformed security token",
            CoreError::KerberosFailed(_) => "ticket validation failed",
            CoreError::ClockSkew { .. } => "authenticator outside allowed clock skew",
            CoreError::Replay => "ticket already used",
            CoreError::ChannelBinding => "channel binding verification failed",
            CoreError::PacMissing => "authorization data missing",
            CoreError::PacInvalid(_) => "authorization data invalid",
            CoreError::NotAuthorized(_) => "not authorized for this role",
            CoreError::Denied(_) => "access denied",
            CoreError::Storage(_) => "storage unavailable",
            CoreError::Busy => "rotation already in progress",
            CoreError::RotationGenerate(_) => "keytab generation failed",
            CoreError::RotationValidate(_) => "keytab validation failed",
            CoreError::RotationPersist(_) => "keytab persistence failed",
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
