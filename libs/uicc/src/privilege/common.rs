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

//! # Common
//!
//! This module contains shared data structures and traits used across the crate.

use std::fmt;
use std::time::Duration;

/// AID of the ARA-D applet.
pub const ARAD_AID: &str = "A00000015144414300";
/// AID of the ARA-M applet.
pub const ARAM_AID: &str = "A00000015141434C00";

/// Loading state of the carrier privilege rules.
///
/// Only ever moves from `Loading` to one of the two terminal states.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum LoadState {
    /// Rules are still being read from the card.
    Loading = 0,
    /// Rules were read. There may be none.
    Loaded = 1,
    /// Rules could not be read.
    Error = 2,
}

impl LoadState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => LoadState::Loading,
            1 => LoadState::Loaded,
            _ => LoadState::Error,
        }
    }

    /// True for `Loaded` and `Error`.
    pub fn is_terminal(self) -> bool {
        self != LoadState::Loading
    }
}

/// Where access rules are read from, in the order they are tried.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum RuleSource {
    /// The ARA-D applet.
    AraD,
    /// The ARA-M applet.
    AraM,
    /// The PKCS#15 access rule files, used when neither applet has rules.
    ArfFallback,
}

impl RuleSource {
    /// The applet AID for this source. The ARF isn't reached through an applet.
    pub fn aid(self) -> Option<&'static str> {
        match self {
            RuleSource::AraD => Some(ARAD_AID),
            RuleSource::AraM => Some(ARAM_AID),
            RuleSource::ArfFallback => None,
        }
    }
}

impl fmt::Display for RuleSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RuleSource::AraD => "ARA-D",
            RuleSource::AraM => "ARA-M",
            RuleSource::ArfFallback => "ARF",
        };
        f.write_str(name)
    }
}

/// Result of a carrier privilege check.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum CarrierPrivilegeStatus {
    /// The rules haven't finished loading.
    RulesNotLoaded,
    /// The rules failed to load.
    ErrorLoadingRules,
    /// No rule grants privileges.
    NoAccess,
    /// A rule grants carrier privileges.
    HasAccess,
}

impl CarrierPrivilegeStatus {
    /// Status reported for `state` before any rule is consulted, if the state alone
    /// decides it.
    pub(crate) fn for_pending_state(state: LoadState) -> Option<Self> {
        match state {
            LoadState::Loading => Some(CarrierPrivilegeStatus::RulesNotLoaded),
            LoadState::Error => Some(CarrierPrivilegeStatus::ErrorLoadingRules),
            LoadState::Loaded => None,
        }
    }
}

/// An installed package as seen by a privilege check.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PackageIdentity {
    /// Package name.
    pub name: String,
    /// Hashes of every certificate the package is signed with.
    pub signing_certificate_hashes: Vec<Vec<u8>>,
}

impl PackageIdentity {
    /// Creates a package identity.
    pub fn new(name: impl Into<String>, signing_certificate_hashes: Vec<Vec<u8>>) -> Self {
        Self { name: name.into(), signing_certificate_hashes }
    }
}

/// Tunables for the rule loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderConfig {
    /// Retries allowed per source for transient channel errors.
    pub max_retries: u32,
    /// Delay before reopening the channel after a transient error.
    pub retry_interval: Duration,
}

impl LoaderConfig {
    /// Creates a `LoaderConfig` with the values used on devices: two retries, five
    /// seconds apart.
    pub fn new() -> Self {
        Self { max_retries: 2, retry_interval: Duration::from_millis(5000) }
    }

    /// Overrides the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Overrides the retry delay.
    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// The public API for querying carrier privileges.
///
/// Every method may be called from any thread at any time, including while the rules
/// are still loading.
pub trait CarrierPrivilegeQuery {
    /// Current loading state.
    fn load_state(&self) -> LoadState;

    /// True once loading finished, successfully or not.
    fn is_loaded(&self) -> bool {
        self.load_state().is_terminal()
    }

    /// True once loading finished and at least one rule was found.
    fn has_rules(&self) -> bool;

    /// Status for an application signed with `certificate_hash` named `package_name`.
    fn status_for(&self, certificate_hash: &[u8], package_name: &str) -> CarrierPrivilegeStatus;

    /// Status for a package, matching any of its signing certificates.
    fn status_for_package(&self, package: &PackageIdentity) -> CarrierPrivilegeStatus;

    /// Status for a UID given the packages that share it. The first package with a status
    /// other than `NoAccess` decides.
    fn status_for_uid(&self, packages: &[PackageIdentity]) -> CarrierPrivilegeStatus {
        packages
            .iter()
            .map(|package| self.status_for_package(package))
            .find(|status| *status != CarrierPrivilegeStatus::NoAccess)
            .unwrap_or(CarrierPrivilegeStatus::NoAccess)
    }

    /// Non-empty package names named by the rules, in rule order.
    fn package_names(&self) -> Vec<String>;
}
