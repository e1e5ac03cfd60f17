// Copyright (C) 2025 The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Talk to UICC applets over logical channels
//!

use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

/// Status word returned by the card when a command completes normally.
pub const SW_SUCCESS: u16 = 0x9000;

/// A command APDU sent over a logical channel.
///
/// `data` carries the command body as a hex string, the same form the modem interface
/// expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduCommand {
    /// Class byte.
    pub cla: u8,
    /// Instruction byte.
    pub ins: u8,
    /// Parameter 1.
    pub p1: u8,
    /// Parameter 2.
    pub p2: u8,
    /// Parameter 3 (Lc/Le).
    pub p3: u8,
    /// Command data, hex encoded.
    pub data: String,
}

/// Response to a transmitted APDU.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IccIoResult {
    /// First status byte.
    pub sw1: u8,
    /// Second status byte.
    pub sw2: u8,
    /// Response body.
    pub payload: Vec<u8>,
}

impl IccIoResult {
    /// Creates a response from its status bytes and payload.
    pub fn new(sw1: u8, sw2: u8, payload: Vec<u8>) -> Self {
        Self { sw1, sw2, payload }
    }

    /// Combines `sw1` and `sw2` into a single status word.
    pub fn status_word(&self) -> u16 {
        u16::from_be_bytes([self.sw1, self.sw2])
    }

    /// True if the card answered `90 00`.
    pub fn is_success(&self) -> bool {
        self.status_word() == SW_SUCCESS
    }
}

/// Error categories reported by the modem for a channel operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandErrorKind {
    /// No free logical channel or other resource on the modem.
    MissingResource,
    /// The requested applet or element doesn't exist.
    NoSuchElement,
    /// The modem failed internally.
    InternalErr,
    /// The radio is off or unavailable.
    RadioNotAvailable,
    /// The request was rejected as malformed.
    InvalidArguments,
    /// Anything else.
    GenericFailure,
}

impl fmt::Display for CommandErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandErrorKind::MissingResource => "MISSING_RESOURCE",
            CommandErrorKind::NoSuchElement => "NO_SUCH_ELEMENT",
            CommandErrorKind::InternalErr => "INTERNAL_ERR",
            CommandErrorKind::RadioNotAvailable => "RADIO_NOT_AVAILABLE",
            CommandErrorKind::InvalidArguments => "INVALID_ARGUMENTS",
            CommandErrorKind::GenericFailure => "GENERIC_FAILURE",
        };
        f.write_str(name)
    }
}

/// A failed channel operation.
///
/// Some failures come back with the status word the card produced while handling the
/// request, which is needed to tell transient conditions apart from missing applets.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}{}", status_suffix(.status_word))]
pub struct CommandError {
    /// What went wrong.
    pub kind: CommandErrorKind,
    /// Status word reported alongside the error, if any.
    pub status_word: Option<u16>,
}

impl CommandError {
    /// Creates an error without a status word.
    pub fn new(kind: CommandErrorKind) -> Self {
        Self { kind, status_word: None }
    }

    /// Creates an error carrying the card's status word.
    pub fn with_status_word(kind: CommandErrorKind, status_word: u16) -> Self {
        Self { kind, status_word: Some(status_word) }
    }
}

fn status_suffix(status_word: &Option<u16>) -> String {
    match status_word {
        Some(sw) => format!(" (sw={:04X})", sw),
        None => String::new(),
    }
}

/// Asynchronous logical channel operations on a UICC.
///
/// At most one operation is issued at a time by a single client; implementations are
/// still required to be `Send + Sync` so the client can run on any runtime worker.
#[async_trait]
pub trait AsyncLogicalChannel: Send + Sync {
    /// Opens a logical channel to the applet named by `aid` (hex string). Returns the
    /// channel id.
    async fn open_logical_channel(&self, aid: &str, p2: u8) -> Result<i32, CommandError>;

    /// Sends `apdu` over an open channel.
    async fn transmit_apdu_logical_channel(
        &self,
        channel: i32,
        apdu: &ApduCommand,
    ) -> Result<IccIoResult, CommandError>;

    /// Closes a channel previously returned by `open_logical_channel`.
    async fn close_logical_channel(&self, channel: i32) -> Result<(), CommandError>;
}

/// Reads carrier certificate hashes from the PKCS#15 access rule files (ARF).
#[async_trait]
pub trait AsyncPkcs15Reader: Send + Sync {
    /// Returns the certificate hashes found, or `None` if the card has no usable ARF.
    async fn read_certificate_hashes(&self) -> Result<Option<Vec<Vec<u8>>>>;
}
