// [src/pac.rs]
//! PAC Extractor (component C6).
//!
//! Parses the Privilege Attribute Certificate buffer carried in the AP-REQ
//! authorization data: domain SID, primary RID, group RIDs/attributes and
//! extra SIDs, reconstructing full SIDs as `<domain_sid>-<rid>`. The server
//! and KDC signatures are verified against the same key used to decrypt the
//! AP-REQ; a mismatch yields `ErrPACInvalid`. This module never panics on
//! malformed input.

use std::collections::BTreeSet;

use hmac::{Hmac, Mac};
use sha1::Sha1;
use thiserror::Error;

use crate::der::{self, TAG_OCTET_STRING, TAG_SEQUENCE};

type HmacSha1 = Hmac<Sha1>;
const SIGNATURE_LEN: usize = 12; // truncated HMAC-SHA1-96, matching the Kerberos checksum convention.

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacError {
    #[error("PAC buffer malformed: {0}")]
    Malformed(String),
    #[error("PAC server signature verification failed")]
    ServerSignatureMismatch,
    #[error("PAC KDC signature verification failed")]
    KdcSignatureMismatch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogonInfo {
    pub domain_sid: String,
    pub user_rid: u32,
    /// (rid, attributes) pairs, matching MS-PAC's `GROUP_MEMBERSHIP` array.
    pub groups: Vec<(u32, u32)>,
    pub extra_sids: Vec<String>,
}

impl LogonInfo {
    /// Reconstructs every group SID the identity carries, including the
    /// primary RID and any extra SIDs, as `<domain_sid>-<rid>` strings.
    pub fn group_sids(&self) -> BTreeSet<String> {
        let mut sids = BTreeSet::new();
        sids.insert(format!("{}-{}", self.domain_sid, self.user_rid));
        for (rid, _attrs) in &self.groups {
            sids.insert(format!("{}-{}", self.domain_sid, rid));
        }
        for extra in &self.extra_sids {
            sids.insert(extra.clone());
        }
        sids
    }
}

/// Encodes the logon-info portion only (the part that gets signed).
fn encode_logon_info(info: &LogonInfo) -> Vec<u8> {
    let mut children = vec![der::encode_tlv(TAG_OCTET_STRING, info.domain_sid.as_bytes())];
    children.push(der::encode_u32(der::TAG_INTEGER, info.user_rid));
    for (rid, attrs) in &info.groups {
        children.push(der::encode_u32(der::TAG_INTEGER, *rid));
        children.push(der::encode_u32(der::TAG_INTEGER, *attrs));
    }
    for sid in &info.extra_sids {
        children.push(der::encode_tlv(TAG_OCTET_STRING, sid.as_bytes()));
    }
    der::encode_sequence(&children)
}

fn sign(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes()[..SIGNATURE_LEN].to_vec()
}

/// Builds a complete, signed PAC buffer. Used both by a real issuer-facing
/// KDC (out of scope here) and by this crate's test fixtures to mint
/// synthetic tickets, mirroring how this crate's end-to-end tests mint
/// SPNEGO blobs for fixed test identities.
pub fn encode_pac(info: &LogonInfo, verification_key: &[u8]) -> Vec<u8> {
    let logon_info_bytes = encode_logon_info(info);
    let server_sig = sign(verification_key, &logon_info_bytes);
    let kdc_sig = sign(verification_key, &server_sig);

    der::encode_sequence(&[
        der::encode_tlv(TAG_SEQUENCE, &logon_info_bytes),
        der::encode_tlv(TAG_OCTET_STRING, &server_sig),
        der::encode_tlv(TAG_OCTET_STRING, &kdc_sig),
    ])
}

/// Parses and signature-verifies a PAC buffer, returning the extracted
/// [`LogonInfo`] on success.
pub fn parse_and_verify(buf: &[u8], verification_key: &[u8]) -> Result<LogonInfo, PacError> {
    let outer = der::expect_tag(buf, TAG_SEQUENCE).map_err(|e| PacError::Malformed(e.to_string()))?;

    let logon_info_wrapper =
        der::expect_tag(outer.value, TAG_SEQUENCE).map_err(|e| PacError::Malformed(e.to_string()))?;
    let logon_info_bytes = logon_info_wrapper.value;

    let server_sig_tlv =
        der::expect_tag(logon_info_wrapper.rest, TAG_OCTET_STRING).map_err(|e| PacError::Malformed(e.to_string()))?;
    let kdc_sig_tlv =
        der::expect_tag(server_sig_tlv.rest, TAG_OCTET_STRING).map_err(|e| PacError::Malformed(e.to_string()))?;

    let expected_server_sig = sign(verification_key, logon_info_bytes);
    if expected_server_sig != server_sig_tlv.value {
        return Err(PacError::ServerSignatureMismatch);
    }
    let expected_kdc_sig = sign(verification_key, server_sig_tlv.value);
    if expected_kdc_sig != kdc_sig_tlv.value {
        return Err(PacError::KdcSignatureMismatch);
    }

    decode_logon_info(logon_info_bytes)
}

fn decode_logon_info(buf: &[u8]) -> Result<LogonInfo, PacError> {
    let domain_sid_tlv = der::expect_tag(buf, TAG_OCTET_STRING).map_err(|e| PacError::Malformed(e.to_string()))?;
    let domain_sid = String::from_utf8(domain_sid_tlv.value.to_vec())
        .map_err(|e| PacError::Malformed(format!("domain SID not UTF-8: {e}")))?;

    let user_rid_tlv =
        der::expect_tag(domain_sid_tlv.rest, der::TAG_INTEGER).map_err(|e| PacError::Malformed(e.to_string()))?;
    let user_rid = der::decode_u32(user_rid_tlv.value);

    let mut groups = Vec::new();
    let mut extra_sids = Vec::new();
    let mut rest = user_rid_tlv.rest;

    while !rest.is_empty() {
        let tlv = der::decode_tlv(rest).map_err(|e| PacError::Malformed(e.to_string()))?;
        match tlv.tag {
            der::TAG_INTEGER => {
                let rid = der::decode_u32(tlv.value);
                let attrs_tlv = der::expect_tag(tlv.rest, der::TAG_INTEGER).map_err(|e| PacError::Malformed(e.to_string()))?;
                groups.push((rid, der::decode_u32(attrs_tlv.value)));
                rest = attrs_tlv.rest;
            }
            TAG_OCTET_STRING => {
                let sid = String::from_utf8(tlv.value.to_vec())
                    .map_err(|e| PacError::Malformed(format!("extra SID not UTF-8: {e}")))?;
                extra_sids.push(sid);
                rest = tlv.rest;
            }
            other => return Err(PacError::Malformed(format!("unexpected tag {other:#04x} in LOGON_INFO"))),
        }
    }

    Ok(LogonInfo {
        domain_sid,
        user_rid,
        groups,
        extra_sids,
    })
}
