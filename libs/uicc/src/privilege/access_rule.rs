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

use crate::common::{CarrierPrivilegeStatus, PackageIdentity};
use std::fmt;

/// A single carrier privilege rule read from the UICC.
///
/// A rule grants privileges to applications signed with `certificate_hash`. If the rule
/// names a package, only that package is covered.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AccessRule {
    certificate_hash: Vec<u8>,
    package_name: Option<String>,
    access_type: u64,
}

impl AccessRule {
    /// Creates a rule. An empty `package_name` is treated as no package constraint.
    pub fn new(certificate_hash: Vec<u8>, package_name: Option<String>, access_type: u64) -> Self {
        let package_name = package_name.filter(|name| !name.is_empty());
        Self { certificate_hash, package_name, access_type }
    }

    /// Hash of the signing certificate this rule covers.
    pub fn certificate_hash(&self) -> &[u8] {
        &self.certificate_hash
    }

    /// `certificate_hash` as an upper-case hex string.
    pub fn certificate_hex_string(&self) -> String {
        hex::encode_upper(&self.certificate_hash)
    }

    /// Package the rule is restricted to, if any.
    pub fn package_name(&self) -> Option<&str> {
        self.package_name.as_deref()
    }

    /// The permission bits from the rule's PERM-AR-DO.
    pub fn access_type(&self) -> u64 {
        self.access_type
    }

    /// True if an application signed with `certificate_hash` named `package_name` is
    /// covered by this rule.
    pub fn matches(&self, certificate_hash: &[u8], package_name: &str) -> bool {
        self.certificate_hash == certificate_hash
            && self.package_name.as_deref().map_or(true, |name| name == package_name)
    }

    pub fn privilege_status(
        &self,
        certificate_hash: &[u8],
        package_name: &str,
    ) -> CarrierPrivilegeStatus {
        if self.matches(certificate_hash, package_name) {
            CarrierPrivilegeStatus::HasAccess
        } else {
            CarrierPrivilegeStatus::NoAccess
        }
    }

    /// Status for a package signed with possibly several certificates.
    pub fn privilege_status_for_package(
        &self,
        package: &PackageIdentity,
    ) -> CarrierPrivilegeStatus {
        package
            .signing_certificate_hashes
            .iter()
            .map(|hash| self.privilege_status(hash, &package.name))
            .find(|status| *status != CarrierPrivilegeStatus::NoAccess)
            .unwrap_or(CarrierPrivilegeStatus::NoAccess)
    }
}

impl fmt::Display for AccessRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cert: {} pkg: {} access: {}",
            self.certificate_hex_string(),
            self.package_name.as_deref().unwrap_or("null"),
            self.access_type
        )
    }
}
