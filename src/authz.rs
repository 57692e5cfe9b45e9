// [src/authz.rs]
//! Authorization Engine (component C7).
//!
//! Takes a [`ValidatedIdentity`] recovered by the SPNEGO validator plus the
//! [`RoleRecord`] it was asked to authenticate against, and produces an
//! accept/deny decision per §4.7: realm gate, SPN gate, deny-list
//! short-circuit, then bound-group matching under the role's merge
//! strategy. A PAC-less identity is only refused once it reaches a role
//! that actually requires group membership — [`crate::spnego`] never makes
//! that call itself.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::CoreError;
use crate::normalize::{self, NormalizationRules};
use crate::role::{MergeStrategy, RoleRecord, TokenType};
use crate::spnego::ValidatedIdentity;

/// The accepted outcome of an authorization decision, ready to be handed to
/// a [`crate::session::SessionIssuer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthzDecision {
    pub principal: String,
    pub display_name: String,
    pub role: String,
    pub realm: String,
    pub token_type: TokenType,
    pub policies: BTreeSet<String>,
    pub group_sids: BTreeSet<String>,
    pub period: u32,
    pub max_ttl: u32,
    pub metadata: BTreeMap<String, String>,
}

/// Evaluates `identity` against `role`, returning the resulting decision or
/// the specific [`CoreError`] variant naming why access was refused.
/// `config_spn` and `norm` come from the backend's [`crate::config::Configuration`]
/// so the SPN gate can fall back to it when a role carries no
/// `allowed_spns` of its own.
#[tracing::instrument(skip(identity, role, norm), fields(role = %role.name, principal = %identity.principal))]
pub fn authorize(
    identity: &ValidatedIdentity,
    role: &RoleRecord,
    config_spn: &str,
    norm: &NormalizationRules,
) -> Result<AuthzDecision, CoreError> {
    let realm = normalize::normalize_realm(&identity.realm, norm)?;
    let spn = normalize::normalize_spn(&identity.spn, norm)?;
    let expected_spn = normalize::normalize_spn(config_spn, norm)?;

    if !role.allowed_realms.is_empty() && !role.allowed_realms.contains(&realm) {
        return Err(CoreError::NotAuthorized(format!(
            "realm {realm} not in role {}'s allowed_realms",
            role.name
        )));
    }

    if role.allowed_spns.is_empty() {
        if spn != expected_spn {
            return Err(CoreError::NotAuthorized(format!(
                "ticket service principal {spn} does not match configured spn {expected_spn}"
            )));
        }
    } else if !role.allowed_spns.contains(&spn) {
        return Err(CoreError::NotAuthorized(format!(
            "service principal {spn} not in role {}'s allowed_spns",
            role.name
        )));
    }

    if let Some(denied) = identity.group_sids.intersection(&role.deny_group_sids).next() {
        return Err(CoreError::Denied(denied.clone()));
    }

    if !role.bound_group_sids.is_empty() {
        if !identity.has_pac {
            return Err(CoreError::PacMissing);
        }
        let matched = match role.merge_strategy {
            MergeStrategy::Union => !identity.group_sids.is_disjoint(&role.bound_group_sids),
            MergeStrategy::Intersection => role.bound_group_sids.is_subset(&identity.group_sids),
        };
        if !matched {
            return Err(CoreError::NotAuthorized(format!(
                "identity's group membership does not satisfy role {}'s bound_group_sids under {:?} merge",
                role.name, role.merge_strategy
            )));
        }
    }

    let policies: BTreeSet<String> = role.token_policies.difference(&role.deny_policies).cloned().collect();

    let mut metadata = BTreeMap::new();
    metadata.insert("spn".to_string(), spn.clone());

    tracing::info!(policies = policies.len(), "authorization granted");

    Ok(AuthzDecision {
        principal: identity.principal.clone(),
        display_name: format!("gmsa-{}", identity.principal),
        role: role.name.clone(),
        realm,
        token_type: role.token_type,
        policies,
        group_sids: identity.group_sids.clone(),
        period: role.period,
        max_ttl: role.max_ttl,
        metadata,
    })
}
