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

//! # UICC Carrier Privileges
//!
//! This crate loads the carrier privilege access rules stored on a UICC and answers
//! whether an application holds carrier privileges.
//!
//! Rules are read in the background from the ARA-D applet, then the ARA-M applet, and
//! from the PKCS#15 access rule files when neither applet has any. Queries can be made
//! at any time and report `RulesNotLoaded` until loading finishes.
//!
//! `UiccCarrierPrivilegeRules` is the entry point for callers inside a Tokio runtime;
//! `PrivilegeEngine` brings its own.

/// Shared data structures and the query trait.
pub mod common;
/// BER-TLV decoding.
pub mod tlv;
/// A single access rule.
pub mod access_rule;
/// Decoding of the rule data returned by the ARA applets.
pub mod access_rule_parser;
/// Background loading of the rules from the card.
mod rule_loader;
/// The rules of one UICC and the queries against them.
pub mod carrier_privilege_rules;
/// Entry point that owns its runtime.
pub mod privilege_engine;
