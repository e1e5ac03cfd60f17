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

//! # Privilege Engine
//!
//! This module provides the entry point for callers that don't run their own Tokio
//! runtime.
//!
//! The `PrivilegeEngine` struct owns a runtime and the `UiccCarrierPrivilegeRules`
//! loading on it.

use crate::carrier_privilege_rules::UiccCarrierPrivilegeRules;
use crate::common::{
    CarrierPrivilegeQuery, CarrierPrivilegeStatus, LoadState, LoaderConfig, PackageIdentity,
};
use anyhow::{Context, Result};
use log::warn;
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio::sync::oneshot;
use uicc_channel::{AsyncLogicalChannel, AsyncPkcs15Reader};

/// Carrier privilege rules together with the runtime that loads them.
pub struct PrivilegeEngine {
    /// The embedded rules that answer the queries.
    pub rules: UiccCarrierPrivilegeRules,
    loaded_receiver: Option<oneshot::Receiver<LoadState>>,
    /// The Tokio runtime for the loader's async tasks.
    _runtime: Runtime,
}

impl PrivilegeEngine {
    /// Create a new PrivilegeEngine and start loading the rules.
    pub fn new(
        channel: Arc<dyn AsyncLogicalChannel>,
        arf_reader: Arc<dyn AsyncPkcs15Reader>,
    ) -> Result<Self> {
        Self::with_config(channel, arf_reader, LoaderConfig::default())
    }

    /// Same as [`PrivilegeEngine::new`] with custom retry settings.
    pub fn with_config(
        channel: Arc<dyn AsyncLogicalChannel>,
        arf_reader: Arc<dyn AsyncPkcs15Reader>,
        config: LoaderConfig,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("Failed to create Tokio runtime for PrivilegeEngine")?;
        let (tx, rx) = oneshot::channel();
        let rules = runtime.block_on(async {
            UiccCarrierPrivilegeRules::with_config(channel, arf_reader, Some(tx), config)
        });

        Ok(Self { rules, loaded_receiver: Some(rx), _runtime: runtime })
    }

    /// Blocks until loading finishes and returns the final state.
    ///
    /// Must not be called from within an async context.
    pub fn wait_until_loaded(&mut self) -> LoadState {
        if let Some(receiver) = self.loaded_receiver.take() {
            match receiver.blocking_recv() {
                Ok(state) => return state,
                Err(_) => warn!("Rule loader stopped without reporting a state."),
            }
        }
        self.rules.load_state()
    }
}

impl CarrierPrivilegeQuery for PrivilegeEngine {
    fn load_state(&self) -> LoadState {
        self.rules.load_state()
    }

    fn has_rules(&self) -> bool {
        self.rules.has_rules()
    }

    fn status_for(&self, certificate_hash: &[u8], package_name: &str) -> CarrierPrivilegeStatus {
        self.rules.status_for(certificate_hash, package_name)
    }

    fn status_for_package(&self, package: &PackageIdentity) -> CarrierPrivilegeStatus {
        self.rules.status_for_package(package)
    }

    fn package_names(&self) -> Vec<String> {
        self.rules.package_names()
    }
}
