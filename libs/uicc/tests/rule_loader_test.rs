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

#[cfg(test)]
mod rule_loader_tests {
    use async_trait::async_trait;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::sync::oneshot;
    use tokio::time::{sleep, timeout, Duration, Instant};
    use uicc_carrier_privileges::access_rule::AccessRule;
    use uicc_carrier_privileges::carrier_privilege_rules::UiccCarrierPrivilegeRules;
    use uicc_carrier_privileges::common::{
        CarrierPrivilegeQuery, CarrierPrivilegeStatus, LoadState, LoaderConfig, PackageIdentity,
        ARAD_AID, ARAM_AID,
    };
    use uicc_carrier_privileges::privilege_engine::PrivilegeEngine;
    use uicc_channel::{
        ApduCommand, AsyncLogicalChannel, AsyncPkcs15Reader, CommandError, CommandErrorKind,
        IccIoResult,
    };

    /// One rule for ABCD92CB with no package and access type 1.
    const RULE_A: &str = "FF4016E214E106C104ABCD92CBE30ADB080000000000000001";
    /// One rule for 01020304 restricted to com.example.
    const RULE_B: &str =
        "FF4023E221E113C10401020304CA0B636F6D2E6578616D706C65E30ADB080000000000000000";
    /// Two rules: 0A0B0C0D for com.example.carrier, and 0E0F for any package.
    const TWO_RULES: &str = "FF403FE229E11BC1040A0B0C0DCA13636F6D2E6578616D706C652E63617272696572\
                             E30ADB080000000000000000E212E104C1020E0FE30ADB080000000000000003";
    /// A REF_AR_DO holding a bare C1, which is malformed.
    const MALFORMED_RULE: &str = "FF4006E204C102ABCD";

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Open(String),
        Transmit { channel: i32, p2: u8 },
        Close(i32),
    }

    /// Scripted result of an open. `None` never completes.
    type OpenScript = Option<Result<i32, CommandError>>;

    #[derive(Default)]
    struct FakeLogicalChannel {
        opens: Mutex<HashMap<String, VecDeque<OpenScript>>>,
        transmits: Mutex<HashMap<i32, VecDeque<Result<IccIoResult, CommandError>>>>,
        calls: Mutex<Vec<Call>>,
    }

    impl FakeLogicalChannel {
        fn on_open(&self, aid: &str, result: Result<i32, CommandError>) -> &Self {
            self.opens.lock().unwrap().entry(aid.to_string()).or_default().push_back(Some(result));
            self
        }

        fn hang_on_open(&self, aid: &str) -> &Self {
            self.opens.lock().unwrap().entry(aid.to_string()).or_default().push_back(None);
            self
        }

        fn on_transmit(&self, channel: i32, result: Result<IccIoResult, CommandError>) -> &Self {
            self.transmits.lock().unwrap().entry(channel).or_default().push_back(result);
            self
        }

        fn respond(&self, channel: i32, payload_hex: &str) -> &Self {
            self.on_transmit(channel, Ok(success(&hex::decode(payload_hex).unwrap())))
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn opened_aids(&self) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter_map(|call| match call {
                    Call::Open(aid) => Some(aid),
                    _ => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl AsyncLogicalChannel for FakeLogicalChannel {
        async fn open_logical_channel(&self, aid: &str, p2: u8) -> Result<i32, CommandError> {
            assert_eq!(p2, 0x00);
            self.calls.lock().unwrap().push(Call::Open(aid.to_string()));
            let script = self.opens.lock().unwrap().get_mut(aid).and_then(VecDeque::pop_front);
            match script {
                Some(Some(result)) => result,
                Some(None) => std::future::pending().await,
                None => Err(CommandError::new(CommandErrorKind::NoSuchElement)),
            }
        }

        async fn transmit_apdu_logical_channel(
            &self,
            channel: i32,
            apdu: &ApduCommand,
        ) -> Result<IccIoResult, CommandError> {
            assert_eq!((apdu.cla, apdu.ins, apdu.p1, apdu.p3), (0x80, 0xCA, 0xFF, 0x00));
            assert!(apdu.data.is_empty());
            self.calls.lock().unwrap().push(Call::Transmit { channel, p2: apdu.p2 });
            let script =
                self.transmits.lock().unwrap().get_mut(&channel).and_then(VecDeque::pop_front);
            script.unwrap_or_else(|| Ok(IccIoResult::new(0x6A, 0x88, Vec::new())))
        }

        async fn close_logical_channel(&self, channel: i32) -> Result<(), CommandError> {
            self.calls.lock().unwrap().push(Call::Close(channel));
            Ok(())
        }
    }

    struct FakeArfReader {
        hashes: Option<Vec<Vec<u8>>>,
        reads: AtomicUsize,
    }

    impl FakeArfReader {
        fn new(hashes: Option<Vec<Vec<u8>>>) -> Arc<Self> {
            Arc::new(Self { hashes, reads: AtomicUsize::new(0) })
        }
    }

    #[async_trait]
    impl AsyncPkcs15Reader for FakeArfReader {
        async fn read_certificate_hashes(&self) -> anyhow::Result<Option<Vec<Vec<u8>>>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok(self.hashes.clone())
        }
    }

    struct FailingArfReader;

    #[async_trait]
    impl AsyncPkcs15Reader for FailingArfReader {
        async fn read_certificate_hashes(&self) -> anyhow::Result<Option<Vec<Vec<u8>>>> {
            anyhow::bail!("EF_DIR unreadable")
        }
    }

    fn success(payload: &[u8]) -> IccIoResult {
        IccIoResult::new(0x90, 0x00, payload.to_vec())
    }

    fn missing_resource() -> CommandError {
        CommandError::new(CommandErrorKind::MissingResource)
    }

    async fn load(
        channel: Arc<FakeLogicalChannel>,
        arf: Arc<dyn AsyncPkcs15Reader>,
    ) -> (UiccCarrierPrivilegeRules, LoadState) {
        let _ = env_logger::try_init();
        let (tx, rx) = oneshot::channel();
        let rules = UiccCarrierPrivilegeRules::new(channel, arf, Some(tx));
        let state = rx.await.expect("loader should report a state");
        (rules, state)
    }

    #[tokio::test(start_paused = true)]
    async fn test_rules_from_ara_m_after_ara_d_miss() {
        let channel = Arc::new(FakeLogicalChannel::default());
        channel
            .on_open(ARAD_AID, Ok(1))
            .on_transmit(1, Ok(IccIoResult::new(0x6A, 0x88, Vec::new())))
            .on_open(ARAM_AID, Ok(2))
            .respond(2, "FF4006E204E102C100");
        let arf = FakeArfReader::new(None);

        let (rules, state) = load(channel.clone(), arf.clone()).await;

        assert_eq!(state, LoadState::Loaded);
        assert_eq!(rules.load_state(), LoadState::Loaded);
        assert_eq!(rules.access_rules(), &[AccessRule::new(Vec::new(), None, 0)]);
        assert_eq!(arf.reads.load(Ordering::SeqCst), 0);
        assert_eq!(
            channel.calls(),
            vec![
                Call::Open(ARAD_AID.to_string()),
                Call::Transmit { channel: 1, p2: 0x40 },
                Call::Close(1),
                Call::Open(ARAM_AID.to_string()),
                Call::Transmit { channel: 2, p2: 0x40 },
                Call::Close(2),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_ara_d_rules_precede_ara_m_rules() {
        let channel = Arc::new(FakeLogicalChannel::default());
        channel
            .on_open(ARAD_AID, Ok(1))
            .respond(1, RULE_A)
            .on_open(ARAM_AID, Ok(2))
            .respond(2, RULE_B);

        let (rules, state) = load(channel, FakeArfReader::new(None)).await;

        assert_eq!(state, LoadState::Loaded);
        assert_eq!(rules.certificate_hex_strings(), vec!["ABCD92CB", "01020304"]);
        assert_eq!(rules.access_rules()[0].access_type(), 1);
        assert_eq!(rules.package_names(), vec!["com.example".to_string()]);
        assert_eq!(
            rules.status_for(&[0x01, 0x02, 0x03, 0x04], "com.example"),
            CarrierPrivilegeStatus::HasAccess
        );
        assert_eq!(
            rules.status_for(&[0x01, 0x02, 0x03, 0x04], "com.other"),
            CarrierPrivilegeStatus::NoAccess
        );
        assert_eq!(
            rules.status_for(&[0xAB, 0xCD, 0x92, 0xCB], "com.other"),
            CarrierPrivilegeStatus::HasAccess
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_ara_d_rules_kept_when_ara_m_missing() {
        let channel = Arc::new(FakeLogicalChannel::default());
        channel.on_open(ARAD_AID, Ok(1)).respond(1, RULE_A);
        let arf = FakeArfReader::new(Some(vec![vec![0x11]]));

        let (rules, state) = load(channel.clone(), arf.clone()).await;

        assert_eq!(state, LoadState::Loaded);
        assert_eq!(rules.certificate_hex_strings(), vec!["ABCD92CB"]);
        assert_eq!(arf.reads.load(Ordering::SeqCst), 0);
        assert_eq!(channel.opened_aids(), vec![ARAD_AID, ARAM_AID]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_multi_fragment_response() {
        let data = hex::decode(TWO_RULES).unwrap();
        let (first, second) = data.split_at(20);
        let channel = Arc::new(FakeLogicalChannel::default());
        channel
            .on_open(ARAD_AID, Ok(3))
            .on_transmit(3, Ok(success(first)))
            .on_transmit(3, Ok(success(second)));

        let (rules, state) = load(channel.clone(), FakeArfReader::new(None)).await;

        assert_eq!(state, LoadState::Loaded);
        assert_eq!(
            rules.access_rules(),
            &[
                AccessRule::new(
                    vec![0x0A, 0x0B, 0x0C, 0x0D],
                    Some("com.example.carrier".to_string()),
                    0
                ),
                AccessRule::new(vec![0x0E, 0x0F], None, 3),
            ]
        );
        assert_eq!(
            channel.calls()[..4],
            [
                Call::Open(ARAD_AID.to_string()),
                Call::Transmit { channel: 3, p2: 0x40 },
                Call::Transmit { channel: 3, p2: 0x60 },
                Call::Close(3),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_retried_at_most_twice() {
        let channel = Arc::new(FakeLogicalChannel::default());
        channel
            .on_open(ARAD_AID, Err(missing_resource()))
            .on_open(ARAD_AID, Err(missing_resource()))
            .on_open(ARAD_AID, Err(missing_resource()));
        let start = Instant::now();

        let (rules, state) = load(channel.clone(), FakeArfReader::new(None)).await;

        assert_eq!(channel.opened_aids(), vec![ARAD_AID, ARAD_AID, ARAD_AID, ARAM_AID]);
        assert!(start.elapsed() >= Duration::from_secs(10));
        assert_eq!(state, LoadState::Error);
        assert_eq!(
            rules.status_for(&[0x01], "com.example"),
            CarrierPrivilegeStatus::ErrorLoadingRules
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_applet_retried() {
        let channel = Arc::new(FakeLogicalChannel::default());
        channel
            .on_open(
                ARAD_AID,
                Err(CommandError::with_status_word(CommandErrorKind::NoSuchElement, 0x6985)),
            )
            .on_open(ARAD_AID, Ok(4))
            .respond(4, RULE_A);

        let (rules, state) = load(channel.clone(), FakeArfReader::new(None)).await;

        assert_eq!(state, LoadState::Loaded);
        assert_eq!(rules.access_rules().len(), 1);
        assert_eq!(channel.opened_aids(), vec![ARAD_AID, ARAD_AID, ARAM_AID]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_transmit_error_reopens_channel() {
        let channel = Arc::new(FakeLogicalChannel::default());
        channel
            .on_open(ARAD_AID, Ok(1))
            .on_transmit(1, Err(missing_resource()))
            .on_open(ARAD_AID, Ok(2))
            .respond(2, RULE_A);

        let (rules, state) = load(channel.clone(), FakeArfReader::new(None)).await;

        assert_eq!(state, LoadState::Loaded);
        assert_eq!(rules.certificate_hex_strings(), vec!["ABCD92CB"]);
        assert_eq!(
            channel.calls()[..6],
            [
                Call::Open(ARAD_AID.to_string()),
                Call::Transmit { channel: 1, p2: 0x40 },
                Call::Close(1),
                Call::Open(ARAD_AID.to_string()),
                Call::Transmit { channel: 2, p2: 0x40 },
                Call::Close(2),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_ara_d_rules_stop_loading() {
        let channel = Arc::new(FakeLogicalChannel::default());
        channel
            .on_open(ARAD_AID, Ok(1))
            .respond(1, MALFORMED_RULE)
            .on_open(ARAM_AID, Ok(2))
            .respond(2, RULE_A);
        let arf = FakeArfReader::new(Some(vec![vec![0x11]]));

        let (rules, state) = load(channel.clone(), arf.clone()).await;

        assert_eq!(state, LoadState::Error);
        assert!(rules.is_loaded());
        assert!(!rules.has_rules());
        assert_eq!(channel.opened_aids(), vec![ARAD_AID]);
        assert_eq!(channel.calls().last(), Some(&Call::Close(1)));
        assert_eq!(arf.reads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_undecodable_lengths_end_in_error() {
        // An eight byte length that overflows, and an E2 longer than its container.
        for payload in ["FF4088FFFFFFFFFFFFFFFF", "FF4004E205E100"] {
            let channel = Arc::new(FakeLogicalChannel::default());
            channel.on_open(ARAD_AID, Ok(1)).respond(1, payload).on_open(ARAM_AID, Ok(2));
            let arf = FakeArfReader::new(Some(vec![vec![0x11]]));

            let (rules, state) = load(channel.clone(), arf.clone()).await;

            assert_eq!(state, LoadState::Error, "payload {}", payload);
            assert_eq!(rules.load_state(), LoadState::Error);
            assert_eq!(
                rules.status_for(&[0x11], "com.example"),
                CarrierPrivilegeStatus::ErrorLoadingRules
            );
            assert_eq!(channel.opened_aids(), vec![ARAD_AID]);
            assert_eq!(channel.calls().last(), Some(&Call::Close(1)));
            assert_eq!(arf.reads.load(Ordering::SeqCst), 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rules_from_arf_when_no_applet() {
        let channel = Arc::new(FakeLogicalChannel::default());
        let arf = FakeArfReader::new(Some(vec![vec![0xAA, 0xBB], vec![0xCC, 0xDD]]));

        let (rules, state) = load(channel.clone(), arf.clone()).await;

        assert_eq!(state, LoadState::Loaded);
        assert_eq!(
            rules.access_rules(),
            &[
                AccessRule::new(vec![0xAA, 0xBB], None, 0),
                AccessRule::new(vec![0xCC, 0xDD], None, 0),
            ]
        );
        assert_eq!(arf.reads.load(Ordering::SeqCst), 1);
        assert_eq!(channel.opened_aids(), vec![ARAD_AID, ARAM_AID]);
        assert!(rules.package_names().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_rules_anywhere() {
        let (rules, state) =
            load(Arc::new(FakeLogicalChannel::default()), FakeArfReader::new(Some(Vec::new())))
                .await;
        assert_eq!(state, LoadState::Error);
        assert!(!rules.has_rules());

        let (rules, state) =
            load(Arc::new(FakeLogicalChannel::default()), Arc::new(FailingArfReader)).await;
        assert_eq!(state, LoadState::Error);
        assert_eq!(rules.load_state(), LoadState::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_rule_set_counts_as_loaded() {
        let channel = Arc::new(FakeLogicalChannel::default());
        channel.on_open(ARAM_AID, Ok(5)).respond(5, "FF4000");
        let arf = FakeArfReader::new(Some(vec![vec![0x11]]));

        let (rules, state) = load(channel, arf.clone()).await;

        assert_eq!(state, LoadState::Loaded);
        assert!(!rules.has_rules());
        assert_eq!(rules.status_for(&[0x11], "com.example"), CarrierPrivilegeStatus::NoAccess);
        assert_eq!(arf.reads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queries_while_loading() {
        let _ = env_logger::try_init();
        let channel = Arc::new(FakeLogicalChannel::default());
        channel.hang_on_open(ARAD_AID);
        let (tx, mut rx) = oneshot::channel();
        let rules = UiccCarrierPrivilegeRules::new(channel, FakeArfReader::new(None), Some(tx));

        assert!(timeout(Duration::from_secs(60), &mut rx).await.is_err());

        assert_eq!(rules.load_state(), LoadState::Loading);
        assert!(!rules.is_loaded());
        assert!(!rules.has_rules());
        assert!(rules.access_rules().is_empty());
        assert_eq!(
            rules.status_for(&[0x01], "com.example"),
            CarrierPrivilegeStatus::RulesNotLoaded
        );
        let package = PackageIdentity::new("com.example", vec![vec![0x01]]);
        assert_eq!(rules.status_for_package(&package), CarrierPrivilegeStatus::RulesNotLoaded);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_queries_while_loading() {
        let _ = env_logger::try_init();
        let channel = Arc::new(FakeLogicalChannel::default());
        channel.hang_on_open(ARAD_AID);
        let rules =
            Arc::new(UiccCarrierPrivilegeRules::new(channel, FakeArfReader::new(None), None));

        let readers: Vec<_> = (0..8)
            .map(|_| {
                let rules = rules.clone();
                tokio::spawn(async move {
                    let package = PackageIdentity::new("com.example", vec![vec![0x01]]);
                    for _ in 0..100 {
                        assert_eq!(
                            rules.status_for(&[0x01], "com.example"),
                            CarrierPrivilegeStatus::RulesNotLoaded
                        );
                        assert_eq!(
                            rules.status_for_package(&package),
                            CarrierPrivilegeStatus::RulesNotLoaded
                        );
                        assert!(!rules.is_loaded());
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();
        for reader in readers {
            reader.await.expect("reader task panicked");
        }
        assert_eq!(rules.load_state(), LoadState::Loading);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_rules_does_not_stop_loader() {
        let _ = env_logger::try_init();
        let channel = Arc::new(FakeLogicalChannel::default());
        channel
            .on_open(ARAD_AID, Err(missing_resource()))
            .on_open(ARAD_AID, Ok(1))
            .respond(1, RULE_A);
        let (tx, rx) = oneshot::channel();
        let rules =
            UiccCarrierPrivilegeRules::new(channel.clone(), FakeArfReader::new(None), Some(tx));
        drop(rules);

        assert_eq!(rx.await.unwrap(), LoadState::Loaded);
        assert_eq!(channel.opened_aids(), vec![ARAD_AID, ARAD_AID, ARAM_AID]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loads_without_listener() {
        let _ = env_logger::try_init();
        let channel = Arc::new(FakeLogicalChannel::default());
        channel.on_open(ARAD_AID, Ok(1)).respond(1, RULE_A);
        let (tx, rx) = oneshot::channel();
        drop(rx);
        let rules = UiccCarrierPrivilegeRules::new(channel, FakeArfReader::new(None), Some(tx));

        while !rules.is_loaded() {
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(rules.load_state(), LoadState::Loaded);
        assert_eq!(rules.access_rules().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_retry_config() {
        let _ = env_logger::try_init();
        let channel = Arc::new(FakeLogicalChannel::default());
        channel.on_open(ARAD_AID, Err(missing_resource()));
        let (tx, rx) = oneshot::channel();
        let config = LoaderConfig::new().with_max_retries(0);
        let _rules = UiccCarrierPrivilegeRules::with_config(
            channel.clone(),
            FakeArfReader::new(None),
            Some(tx),
            config,
        );

        assert_eq!(rx.await.unwrap(), LoadState::Error);
        assert_eq!(channel.opened_aids(), vec![ARAD_AID, ARAM_AID]);
    }

    #[test]
    fn test_privilege_engine_waits_for_rules() {
        let _ = env_logger::try_init();
        let channel = Arc::new(FakeLogicalChannel::default());
        channel.on_open(ARAM_AID, Ok(1)).respond(1, RULE_B);

        let mut engine =
            PrivilegeEngine::new(channel, FakeArfReader::new(None)).expect("engine should start");

        assert_eq!(engine.wait_until_loaded(), LoadState::Loaded);
        assert_eq!(engine.wait_until_loaded(), LoadState::Loaded);
        assert!(engine.has_rules());
        let packages = vec![
            PackageIdentity::new("com.other", vec![vec![0x01, 0x02, 0x03, 0x04]]),
            PackageIdentity::new("com.example", vec![vec![0x01, 0x02, 0x03, 0x04]]),
        ];
        assert_eq!(engine.status_for_uid(&packages), CarrierPrivilegeStatus::HasAccess);
        assert_eq!(engine.package_names(), vec!["com.example".to_string()]);
    }
}
