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

//! # Carrier Privilege Rules
//!
//! `UiccCarrierPrivilegeRules` owns the rules read from one UICC and answers privilege
//! queries against them.
//!
//! Construction starts the rule loader in the background. Until the loader finishes,
//! queries report `RulesNotLoaded`; afterwards the rule list never changes.

use crate::access_rule::AccessRule;
use crate::common::{
    CarrierPrivilegeQuery, CarrierPrivilegeStatus, LoadState, LoaderConfig, PackageIdentity,
};
use crate::rule_loader::spawn_rule_loader;
use log::{debug, error, info};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uicc_channel::{AsyncLogicalChannel, AsyncPkcs15Reader};

/// Rules shared between the loader, which writes them once, and any number of readers.
///
/// The rule list is set before the terminal state is stored, so a reader that observes
/// `Loaded` or `Error` always sees the complete list.
#[derive(Debug, Default)]
pub(crate) struct RuleStore {
    state: AtomicU8,
    rules: OnceLock<Vec<AccessRule>>,
}

impl RuleStore {
    /// Publishes the final rules and `state`. Only the first call has an effect.
    pub(crate) fn publish(&self, rules: Vec<AccessRule>, state: LoadState) {
        if self.rules.set(rules).is_err() {
            error!("Carrier privilege rules already published, ignoring {:?}", state);
            return;
        }
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn load_state(&self) -> LoadState {
        LoadState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// The published rules, empty while loading.
    pub(crate) fn rules(&self) -> &[AccessRule] {
        if !self.load_state().is_terminal() {
            return &[];
        }
        self.rules.get().map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Carrier privilege rules of one UICC.
pub struct UiccCarrierPrivilegeRules {
    store: Arc<RuleStore>,
    loader_task_handle: Option<JoinHandle<()>>,
}

impl UiccCarrierPrivilegeRules {
    /// Starts loading the rules through `channel`, falling back to `arf_reader`.
    ///
    /// `loaded_callback` receives the final state once loading finishes. Must be called
    /// within a Tokio runtime.
    pub fn new(
        channel: Arc<dyn AsyncLogicalChannel>,
        arf_reader: Arc<dyn AsyncPkcs15Reader>,
        loaded_callback: Option<oneshot::Sender<LoadState>>,
    ) -> Self {
        Self::with_config(channel, arf_reader, loaded_callback, LoaderConfig::default())
    }

    /// Same as [`UiccCarrierPrivilegeRules::new`] with custom retry settings.
    pub fn with_config(
        channel: Arc<dyn AsyncLogicalChannel>,
        arf_reader: Arc<dyn AsyncPkcs15Reader>,
        loaded_callback: Option<oneshot::Sender<LoadState>>,
        config: LoaderConfig,
    ) -> Self {
        let store = Arc::new(RuleStore::default());
        let handle =
            spawn_rule_loader(channel, arf_reader, config, store.clone(), loaded_callback);
        Self { store, loader_task_handle: Some(handle) }
    }

    /// Creates an already loaded instance holding `rules`. Nothing is read from a card.
    pub fn from_rules(rules: Vec<AccessRule>) -> Self {
        let store = Arc::new(RuleStore::default());
        store.publish(rules, LoadState::Loaded);
        Self { store, loader_task_handle: None }
    }

    /// All rules, in the order they were read. Empty until loading finishes.
    pub fn access_rules(&self) -> &[AccessRule] {
        self.store.rules()
    }

    /// Certificate hashes of all rules as upper-case hex strings.
    pub fn certificate_hex_strings(&self) -> Vec<String> {
        self.access_rules().iter().map(AccessRule::certificate_hex_string).collect()
    }

    fn first_granted<F>(&self, status_of: F) -> CarrierPrivilegeStatus
    where
        F: Fn(&AccessRule) -> CarrierPrivilegeStatus,
    {
        if let Some(status) = CarrierPrivilegeStatus::for_pending_state(self.load_state()) {
            return status;
        }
        self.access_rules()
            .iter()
            .map(status_of)
            .find(|status| *status != CarrierPrivilegeStatus::NoAccess)
            .unwrap_or(CarrierPrivilegeStatus::NoAccess)
    }
}

impl CarrierPrivilegeQuery for UiccCarrierPrivilegeRules {
    fn load_state(&self) -> LoadState {
        self.store.load_state()
    }

    fn has_rules(&self) -> bool {
        self.load_state() == LoadState::Loaded && !self.access_rules().is_empty()
    }

    fn status_for(&self, certificate_hash: &[u8], package_name: &str) -> CarrierPrivilegeStatus {
        self.first_granted(|rule| rule.privilege_status(certificate_hash, package_name))
    }

    fn status_for_package(&self, package: &PackageIdentity) -> CarrierPrivilegeStatus {
        self.first_granted(|rule| rule.privilege_status_for_package(package))
    }

    fn package_names(&self) -> Vec<String> {
        self.access_rules()
            .iter()
            .filter_map(AccessRule::package_name)
            .map(str::to_string)
            .collect()
    }
}

impl Drop for UiccCarrierPrivilegeRules {
    fn drop(&mut self) {
        let Some(handle) = self.loader_task_handle.take() else {
            return;
        };
        if handle.is_finished() {
            debug!("UiccCarrierPrivilegeRules dropping. RuleLoaderTask already finished.");
        } else {
            info!(
                "UiccCarrierPrivilegeRules dropping while RuleLoaderTask is running. \
                The task will be managed by the Tokio runtime."
            );
        }
    }
}
