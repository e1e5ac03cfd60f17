// Copyright (C) 2025 The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # Access Rule Parser
//!
//! Turns the response of the ARA applets into [`AccessRule`]s.
//!
//! Rules format (GlobalPlatform Secure Element Access Control):
//!
//! ```text
//! ALL_REF_AR_DO        = FF40 + len + REF_AR_DO*
//! REF_AR_DO            = E2 + len + REF_DO + AR_DO
//! REF_DO               = E1 + len + (optional) AID_REF_DO + DEVICE_APP_ID_REF_DO
//!                        + (optional) PKG_REF_DO
//! AR_DO                = E3 + len + (other DOs)* + PERM_AR_DO
//!
//! AID_REF_DO           = 4F + 06 + FFFFFFFFFFFF
//! DEVICE_APP_ID_REF_DO = C1 + len + certificate hash
//! PKG_REF_DO           = CA + len + package name
//! PERM_AR_DO           = DB + len + permission bits (8 bytes expected)
//! ```
//!
//! A REF_AR_DO that is well formed but doesn't describe a carrier privilege rule is
//! skipped. Anything that breaks the structure above fails the whole batch.

use crate::access_rule::AccessRule;
use crate::tlv::{self, TlvError};
use log::{debug, warn};
use thiserror::Error;

pub const TAG_ALL_REF_AR_DO: &[u8] = &[0xFF, 0x40];
pub const TAG_REF_AR_DO: &[u8] = &[0xE2];
pub const TAG_REF_DO: &[u8] = &[0xE1];
pub const TAG_DEVICE_APP_ID_REF_DO: &[u8] = &[0xC1];
pub const TAG_PKG_REF_DO: &[u8] = &[0xCA];
pub const TAG_AR_DO: &[u8] = &[0xE3];
pub const TAG_PERM_AR_DO: &[u8] = &[0xDB];
pub const TAG_AID_REF_DO: &[u8] = &[0x4F];

/// AID_REF_DO value marking a rule as a carrier privilege rule. Devices with a GP access
/// control enforcer may send it; other values belong to other enforcers.
pub const CARRIER_PRIVILEGE_AID: &[u8] = &[0xFF; 6];

const PERM_AR_DO_LENGTH: usize = 8;

/// Fatal errors. The rules batch they come from can't be trusted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleParseError {
    /// A data object couldn't be decoded.
    #[error(transparent)]
    Tlv(#[from] TlvError),
    /// A REF_AR_DO holds something other than one REF_DO followed by one AR_DO.
    #[error("invalid rule type {tag} in REF_AR_DO")]
    SchemaViolation { tag: String },
}

/// Why a REF_AR_DO was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// AID_REF_DO present with a value other than the carrier privilege AID.
    NotCarrierPrivilegeAid,
    /// REF_DO without a DEVICE_APP_ID_REF_DO where one is expected.
    MissingDeviceAppId,
    /// Something other than PKG_REF_DO follows the DEVICE_APP_ID_REF_DO.
    UnexpectedRefDoContent,
    /// AR_DO without a PERM_AR_DO.
    MissingPermission,
    /// REF_AR_DO without a REF_DO.
    MissingRefDo,
}

/// Outcome for a single REF_AR_DO.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleOutcome {
    /// A carrier privilege rule.
    Accepted(AccessRule),
    /// Not a carrier privilege rule. The rest of the batch is unaffected.
    Skipped(SkipReason),
}

/// Rules parsed from one ALL_REF_AR_DO.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedRules {
    /// Accepted rules in the order they appear.
    pub rules: Vec<AccessRule>,
    /// Number of REF_AR_DOs skipped.
    pub skipped: usize,
}

/// Checks whether `data` holds the whole ALL_REF_AR_DO announced by its length field.
///
/// Returns `Ok(false)` while more response fragments are needed.
pub fn is_data_complete(data: &[u8]) -> Result<bool, RuleParseError> {
    if !data.starts_with(TAG_ALL_REF_AR_DO) {
        // Also covers a first fragment shorter than the tag.
        return Err(TlvError::TagMismatch {
            expected: hex::encode_upper(TAG_ALL_REF_AR_DO),
            found: hex::encode_upper(&data[..data.len().min(TAG_ALL_REF_AR_DO.len())]),
        }
        .into());
    }
    let (length, length_field_width) = match tlv::parse_length(data, TAG_ALL_REF_AR_DO.len()) {
        Ok(length) => length,
        Err(TlvError::TruncatedLength { .. }) => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    let header = TAG_ALL_REF_AR_DO.len() + length_field_width;
    let Some(expected) = header.checked_add(length) else {
        return Err(TlvError::UnsupportedLength {
            tag: hex::encode_upper(TAG_ALL_REF_AR_DO),
            first_byte: data[TAG_ALL_REF_AR_DO.len()],
        }
        .into());
    };
    debug!("isDataComplete expected={} received={}", expected, data.len());
    if data.len() > expected {
        return Err(TlvError::TrailingData {
            tag: hex::encode_upper(TAG_ALL_REF_AR_DO),
            remaining: data.len() - expected,
        }
        .into());
    }
    Ok(data.len() == expected)
}

/// Parses a complete ALL_REF_AR_DO.
pub fn parse_rules(data: &[u8]) -> Result<ParsedRules, RuleParseError> {
    debug!("Got rules: {}", hex::encode_upper(data));
    let (all_ref_ar_do, _) = tlv::parse(data, TAG_ALL_REF_AR_DO, true)?;

    let mut parsed = ParsedRules::default();
    let mut ar_dos = all_ref_ar_do.value;
    while !ar_dos.is_empty() {
        let (ref_ar_do, rest) = tlv::parse(ar_dos, TAG_REF_AR_DO, false)?;
        ar_dos = rest;
        match parse_ref_ar_do(ref_ar_do.value)? {
            RuleOutcome::Accepted(rule) => parsed.rules.push(rule),
            RuleOutcome::Skipped(reason) => {
                warn!(
                    "Skip unrecognized rule ({:?}): {}",
                    reason,
                    hex::encode_upper(ref_ar_do.value)
                );
                parsed.skipped += 1;
            }
        }
    }
    Ok(parsed)
}

/// Parses the content of a single REF_AR_DO.
pub fn parse_ref_ar_do(mut rule: &[u8]) -> Result<RuleOutcome, RuleParseError> {
    let mut reference: Option<(Vec<u8>, Option<String>)> = None;
    let mut access_type: Option<u64> = None;

    while !rule.is_empty() {
        if rule.starts_with(TAG_REF_DO) && reference.is_none() && access_type.is_none() {
            let (ref_do, rest) = tlv::parse(rule, TAG_REF_DO, false)?;
            rule = rest;
            match parse_ref_do(ref_do.value)? {
                Ok(parsed) => reference = Some(parsed),
                Err(reason) => return Ok(RuleOutcome::Skipped(reason)),
            }
        } else if rule.starts_with(TAG_AR_DO) && reference.is_some() && access_type.is_none() {
            let (ar_do, rest) = tlv::parse(rule, TAG_AR_DO, false)?;
            rule = rest;
            match parse_ar_do(ar_do.value)? {
                Ok(bits) => access_type = Some(bits),
                Err(reason) => return Ok(RuleOutcome::Skipped(reason)),
            }
        } else {
            return Err(RuleParseError::SchemaViolation { tag: hex::encode_upper(&rule[..1]) });
        }
    }

    match reference {
        Some((certificate_hash, package_name)) => Ok(RuleOutcome::Accepted(AccessRule::new(
            certificate_hash,
            package_name,
            access_type.unwrap_or(0),
        ))),
        None => Ok(RuleOutcome::Skipped(SkipReason::MissingRefDo)),
    }
}

/// Parses a REF_DO into the certificate hash and optional package name.
fn parse_ref_do(
    ref_do: &[u8],
) -> Result<Result<(Vec<u8>, Option<String>), SkipReason>, RuleParseError> {
    // No AID_REF_DO, or one with the carrier privilege AID, is a carrier privilege rule.
    // Any other AID_REF_DO is meant for a different enforcer.
    let device_app_id = if ref_do.starts_with(TAG_AID_REF_DO) {
        let (aid_ref_do, rest) = tlv::parse(ref_do, TAG_AID_REF_DO, false)?;
        if aid_ref_do.length_field_width != 1 || aid_ref_do.value != CARRIER_PRIVILEGE_AID {
            return Ok(Err(SkipReason::NotCarrierPrivilegeAid));
        }
        if !rest.starts_with(TAG_DEVICE_APP_ID_REF_DO) {
            return Ok(Err(SkipReason::MissingDeviceAppId));
        }
        rest
    } else if ref_do.starts_with(TAG_DEVICE_APP_ID_REF_DO) {
        ref_do
    } else {
        return Ok(Err(SkipReason::MissingDeviceAppId));
    };

    let (device_do, rest) = tlv::parse(device_app_id, TAG_DEVICE_APP_ID_REF_DO, false)?;
    let certificate_hash = device_do.value.to_vec();
    if rest.is_empty() {
        return Ok(Ok((certificate_hash, None)));
    }
    if !rest.starts_with(TAG_PKG_REF_DO) {
        return Ok(Err(SkipReason::UnexpectedRefDoContent));
    }
    let (pkg_do, _) = tlv::parse(rest, TAG_PKG_REF_DO, true)?;
    let package_name = String::from_utf8_lossy(pkg_do.value).into_owned();
    Ok(Ok((certificate_hash, Some(package_name))))
}

/// Parses an AR_DO into its permission bits.
fn parse_ar_do(ar_do: &[u8]) -> Result<Result<u64, SkipReason>, RuleParseError> {
    // Other DOs in an AR_DO are optional and carry single-byte tags; skip them.
    let mut remain = ar_do;
    while !remain.is_empty() && !remain.starts_with(TAG_PERM_AR_DO) {
        let (_, rest) = tlv::parse(remain, &remain[..1], false)?;
        remain = rest;
    }
    if remain.is_empty() {
        return Ok(Err(SkipReason::MissingPermission));
    }
    let (perm_do, _) = tlv::parse(remain, TAG_PERM_AR_DO, true)?;
    // A DB that isn't eight bytes still grants the rule, with no permission bits.
    let bits = <[u8; PERM_AR_DO_LENGTH]>::try_from(perm_do.value)
        .map(u64::from_be_bytes)
        .unwrap_or(0);
    Ok(Ok(bits))
}
