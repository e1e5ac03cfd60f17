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

use crate::access_rule::AccessRule;
use crate::access_rule_parser;
use crate::carrier_privilege_rules::RuleStore;
use crate::common::{LoadState, LoaderConfig, RuleSource};
use log::{debug, error, info, warn};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uicc_channel::{
    ApduCommand, AsyncLogicalChannel, AsyncPkcs15Reader, CommandError, CommandErrorKind,
    IccIoResult,
};

/// Message queue size.
const MESSAGE_QUEUE_SIZE: usize = 10;

// GET DATA [all] command sent to the ARA applets.
const CLA: u8 = 0x80;
const COMMAND: u8 = 0xCA;
const P1: u8 = 0xFF;
const P2: u8 = 0x40;
const P2_EXTENDED_DATA: u8 = 0x60;
const P3: u8 = 0x00;

/// P2 for opening the logical channel.
const OPEN_CHANNEL_P2: u8 = 0x00;

const STATUS_CODE_CONDITION_NOT_SATISFIED: u16 = 0x6985;
const STATUS_CODE_APPLET_SELECT_FAILED: u16 = 0x6999;

/// Completion events fed back into the loader's event loop.
#[derive(Debug)]
enum LoaderEvent {
    OpenDone { source: RuleSource, result: Result<i32, CommandError> },
    TransmitDone { source: RuleSource, channel: i32, result: Result<IccIoResult, CommandError> },
    CloseDone { source: RuleSource, result: Result<(), CommandError> },
    RetryTimerFired { source: RuleSource },
    ArfReadDone { result: anyhow::Result<Option<Vec<Vec<u8>>>> },
}

/// What to do once the channel of the current attempt is closed.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum AfterClose {
    NextSource,
    RetryOpen,
    Finish(LoadState),
}

/// Where the loader is in reading the rules.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum Phase {
    Idle,
    Opening(RuleSource),
    Transmitting(RuleSource),
    Closing { source: RuleSource, then: AfterClose },
    WaitingRetry(RuleSource),
    ReadingArf,
    Done(LoadState),
}

/// State of the attempt on the current source.
#[derive(Debug)]
struct Attempt {
    source: RuleSource,
    channel: Option<i32>,
    buffer: Vec<u8>,
    retry_count: u32,
}

impl Attempt {
    fn new(source: RuleSource) -> Self {
        Self { source, channel: None, buffer: Vec::new(), retry_count: 0 }
    }
}

/// True for the channel errors that may go away if the open is retried, e.g. while
/// another client holds all logical channels.
fn is_transient(error: &CommandError) -> bool {
    match error.kind {
        CommandErrorKind::MissingResource => true,
        CommandErrorKind::NoSuchElement => {
            error.status_word == Some(STATUS_CODE_CONDITION_NOT_SATISFIED)
        }
        CommandErrorKind::InternalErr => {
            error.status_word == Some(STATUS_CODE_APPLET_SELECT_FAILED)
        }
        _ => false,
    }
}

/// Internal task that reads the access rules from the UICC, one source at a time.
struct RuleLoaderTask {
    channel: Arc<dyn AsyncLogicalChannel>,
    arf_reader: Arc<dyn AsyncPkcs15Reader>,
    config: LoaderConfig,
    event_sender: mpsc::Sender<LoaderEvent>,
    event_receiver: mpsc::Receiver<LoaderEvent>,
    phase: Phase,
    attempt: Attempt,
    retry_timer: Option<JoinHandle<()>>,
    rules: Vec<AccessRule>,
    /// Set once an applet returned a complete rule set, even an empty one.
    checked_rules: bool,
    store: Arc<RuleStore>,
    loaded_callback: Option<oneshot::Sender<LoadState>>,
}

impl RuleLoaderTask {
    /// Runs `operation` on its own task and posts the resulting event back to the loop.
    fn post<F>(&self, operation: F) -> JoinHandle<()>
    where
        F: Future<Output = LoaderEvent> + Send + 'static,
    {
        let sender = self.event_sender.clone();
        tokio::spawn(async move {
            let event = operation.await;
            if sender.send(event).await.is_err() {
                debug!("Event channel closed. Loader already finished.");
            }
        })
    }

    fn set_phase(&mut self, phase: Phase) {
        debug!("State transition: {:?} -> {:?}", self.phase, phase);
        self.phase = phase;
    }

    /// Starts reading from `source` with a fresh buffer and retry budget.
    fn start_source(&mut self, source: RuleSource) {
        self.attempt = Attempt::new(source);
        self.start_attempt();
    }

    fn start_attempt(&mut self) {
        let source = self.attempt.source;
        match source.aid() {
            Some(aid) => {
                info!("Opening logical channel to {} ({})", source, aid);
                self.set_phase(Phase::Opening(source));
                let channel = self.channel.clone();
                self.post(async move {
                    let result = channel.open_logical_channel(aid, OPEN_CHANNEL_P2).await;
                    LoaderEvent::OpenDone { source, result }
                });
            }
            None => {
                info!("No ARA, try ARF next.");
                self.set_phase(Phase::ReadingArf);
                let arf_reader = self.arf_reader.clone();
                self.post(async move {
                    let result = arf_reader.read_certificate_hashes().await;
                    LoaderEvent::ArfReadDone { result }
                });
            }
        }
    }

    fn transmit(&mut self, channel_id: i32, p2: u8) {
        let source = self.attempt.source;
        self.set_phase(Phase::Transmitting(source));
        let apdu = ApduCommand { cla: CLA, ins: COMMAND, p1: P1, p2, p3: P3, data: String::new() };
        let channel = self.channel.clone();
        self.post(async move {
            let result = channel.transmit_apdu_logical_channel(channel_id, &apdu).await;
            LoaderEvent::TransmitDone { source, channel: channel_id, result }
        });
    }

    /// Closes the current channel, if any, and continues with `then`.
    fn close_channel(&mut self, then: AfterClose) {
        let source = self.attempt.source;
        match self.attempt.channel.take() {
            Some(channel_id) => {
                self.set_phase(Phase::Closing { source, then });
                let channel = self.channel.clone();
                self.post(async move {
                    let result = channel.close_logical_channel(channel_id).await;
                    LoaderEvent::CloseDone { source, result }
                });
            }
            None => self.continue_with(then),
        }
    }

    fn continue_with(&mut self, then: AfterClose) {
        match then {
            AfterClose::NextSource => self.advance(),
            AfterClose::RetryOpen => self.schedule_retry(),
            AfterClose::Finish(state) => self.finish(state),
        }
    }

    fn should_retry(&self, error: &CommandError) -> bool {
        self.attempt.retry_count < self.config.max_retries && is_transient(error)
    }

    fn schedule_retry(&mut self) {
        self.attempt.retry_count += 1;
        self.attempt.buffer.clear();
        let source = self.attempt.source;
        info!(
            "Retrying {} in {:?} ({}/{})",
            source, self.config.retry_interval, self.attempt.retry_count, self.config.max_retries
        );
        if let Some(timer) = self.retry_timer.take() {
            timer.abort();
        }
        self.set_phase(Phase::WaitingRetry(source));
        let delay = self.config.retry_interval;
        self.retry_timer = Some(self.post(async move {
            tokio::time::sleep(delay).await;
            LoaderEvent::RetryTimerFired { source }
        }));
    }

    /// Moves on from the current source once it's done with, successfully or not.
    fn advance(&mut self) {
        match self.attempt.source {
            RuleSource::AraD => self.start_source(RuleSource::AraM),
            RuleSource::AraM if self.checked_rules => self.finish(LoadState::Loaded),
            RuleSource::AraM => self.start_source(RuleSource::ArfFallback),
            RuleSource::ArfFallback => self.finish(LoadState::Error),
        }
    }

    /// Publishes the rules and notifies the owner. Nothing runs after this.
    fn finish(&mut self, state: LoadState) {
        if let Some(timer) = self.retry_timer.take() {
            timer.abort();
        }
        self.set_phase(Phase::Done(state));
        info!("Carrier privilege rules {:?} with {} rule(s)", state, self.rules.len());
        self.store.publish(std::mem::take(&mut self.rules), state);
        if let Some(loaded_callback) = self.loaded_callback.take() {
            if loaded_callback.send(state).is_err() {
                debug!("Nobody is waiting for the rules to load.");
            }
        }
    }

    fn handle_open_done(&mut self, source: RuleSource, result: Result<i32, CommandError>) {
        match result {
            Ok(channel_id) => {
                debug!("Logical channel {} open to {}", channel_id, source);
                self.attempt.channel = Some(channel_id);
                self.transmit(channel_id, P2);
            }
            Err(e) if self.should_retry(&e) => {
                warn!("Failed to open logical channel to {}: {}", source, e);
                self.schedule_retry();
            }
            Err(e) => {
                if e.kind != CommandErrorKind::NoSuchElement {
                    info!("No {} due to {}", source, e);
                }
                self.advance();
            }
        }
    }

    fn handle_transmit_done(
        &mut self,
        source: RuleSource,
        channel_id: i32,
        result: Result<IccIoResult, CommandError>,
    ) {
        let then = match result {
            Ok(response) if response.is_success() && !response.payload.is_empty() => {
                debug!("{} payload: {}", source, hex::encode_upper(&response.payload));
                self.attempt.buffer.extend_from_slice(&response.payload);
                match access_rule_parser::is_data_complete(&self.attempt.buffer) {
                    Ok(false) => {
                        self.transmit(channel_id, P2_EXTENDED_DATA);
                        return;
                    }
                    Ok(true) => self.accept_rules(),
                    Err(e) => {
                        error!("Error parsing rules from {}: {}", source, e);
                        AfterClose::Finish(LoadState::Error)
                    }
                }
            }
            Ok(response) => {
                warn!(
                    "Invalid response from {}: payload={} sw={:04X}",
                    source,
                    hex::encode_upper(&response.payload),
                    response.status_word()
                );
                AfterClose::NextSource
            }
            Err(e) if self.should_retry(&e) => {
                warn!("Error reading value from SIM via {} due to error code: {}", source, e);
                AfterClose::RetryOpen
            }
            Err(e) => {
                warn!("Error reading value from SIM via {} due to error code: {}", source, e);
                AfterClose::NextSource
            }
        };
        self.close_channel(then);
    }

    /// Parses the complete buffer of the current attempt.
    fn accept_rules(&mut self) -> AfterClose {
        let source = self.attempt.source;
        match access_rule_parser::parse_rules(&self.attempt.buffer) {
            Ok(parsed) => {
                info!(
                    "Read {} rule(s) from {}, skipped {}",
                    parsed.rules.len(),
                    source,
                    parsed.skipped
                );
                self.rules.extend(parsed.rules);
                self.checked_rules = true;
                AfterClose::NextSource
            }
            Err(e) => {
                error!("Error parsing rules from {}: {}", source, e);
                AfterClose::Finish(LoadState::Error)
            }
        }
    }

    fn handle_arf_read_done(&mut self, result: anyhow::Result<Option<Vec<Vec<u8>>>>) {
        match result {
            Ok(Some(hashes)) if !hashes.is_empty() => {
                info!("Read {} certificate(s) from ARF", hashes.len());
                self.rules.extend(hashes.into_iter().map(|hash| AccessRule::new(hash, None, 0)));
                self.finish(LoadState::Loaded);
            }
            Ok(_) => {
                info!("No ARA or ARF.");
                self.finish(LoadState::Error);
            }
            Err(e) => {
                error!("Failed to read ARF: {:#}", e);
                self.finish(LoadState::Error);
            }
        }
    }

    /// Dispatches one event. Events that don't belong to the current phase are dropped.
    fn handle_event(&mut self, event: LoaderEvent) {
        match (self.phase, event) {
            (Phase::Opening(expected), LoaderEvent::OpenDone { source, result })
                if expected == source =>
            {
                self.handle_open_done(source, result)
            }
            (
                Phase::Transmitting(expected),
                LoaderEvent::TransmitDone { source, channel, result },
            ) if expected == source => self.handle_transmit_done(source, channel, result),
            (Phase::Closing { source: expected, then }, LoaderEvent::CloseDone { source, result })
                if expected == source =>
            {
                if let Err(e) = result {
                    error!("Failed to close logical channel to {}: {}", source, e);
                }
                self.continue_with(then);
            }
            (Phase::WaitingRetry(expected), LoaderEvent::RetryTimerFired { source })
                if expected == source =>
            {
                self.retry_timer = None;
                self.start_attempt();
            }
            (Phase::ReadingArf, LoaderEvent::ArfReadDone { result }) => {
                self.handle_arf_read_done(result)
            }
            (phase, event) => {
                warn!("Dropping {:?} received in {:?}", event, phase);
            }
        }
    }

    /// Runs the event loop until the rules reach a terminal state.
    async fn run(mut self) {
        info!("RuleLoaderTask started.");
        self.start_source(RuleSource::AraD);
        while !matches!(self.phase, Phase::Done(_)) {
            match self.event_receiver.recv().await {
                Some(event) => self.handle_event(event),
                None => {
                    error!("Event channel closed. Shutting down.");
                    break;
                }
            }
        }
        info!("RuleLoaderTask finished.");
    }
}

/// Spawns the loader on the current Tokio runtime.
///
/// The loader runs until the rules are published to `store`, then sends the final state
/// to `loaded_callback`.
pub(crate) fn spawn_rule_loader(
    channel: Arc<dyn AsyncLogicalChannel>,
    arf_reader: Arc<dyn AsyncPkcs15Reader>,
    config: LoaderConfig,
    store: Arc<RuleStore>,
    loaded_callback: Option<oneshot::Sender<LoadState>>,
) -> JoinHandle<()> {
    let (tx, rx) = mpsc::channel(MESSAGE_QUEUE_SIZE);
    let task = RuleLoaderTask {
        channel,
        arf_reader,
        config,
        event_sender: tx,
        event_receiver: rx,
        phase: Phase::Idle,
        attempt: Attempt::new(RuleSource::AraD),
        retry_timer: None,
        rules: Vec::new(),
        checked_rules: false,
        store,
        loaded_callback,
    };
    tokio::spawn(task.run())
}
