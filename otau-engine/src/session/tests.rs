use super::*;
use otau_image::{BuiltinKeyDatabase, ImageBuilder};
use otau_proto::TargetError;
use test_case::test_case;

type C = Characteristic;

const ADDRESS_WORDS: [u8; 6] = [0x02, 0x00, 0x00, 0x5b, 0xa5, 0xa5];
const ADDRESS_LSB_FIRST: [u8; 6] = [0xa5, 0xa5, 0x00, 0x5b, 0x02, 0x00];

fn image() -> ImageFile {
    let text = ImageBuilder::new()
        .with_comments()
        .cs_block(vec![0xffff; 20])
        .block(0x0000, (0..30).collect())
        .build();
    ImageFile::parse(&text).unwrap()
}

fn caps(list: &[Characteristic]) -> Capabilities {
    list.iter().copied().collect()
}

fn bootloader() -> Capabilities {
    caps(&[C::Version, C::CurrentApp, C::DataTransfer, C::TransferControl, C::CsBlock])
}

fn application() -> Capabilities {
    caps(&[C::Version, C::CurrentApp, C::CsKey, C::BatteryLevel, C::ServiceChanged])
}

fn start_with(capabilities: Capabilities) -> (Session, Vec<Action>) {
    Session::start(
        capabilities,
        image(),
        OtauConfig::default(),
        Box::new(BuiltinKeyDatabase),
        None,
    )
    .unwrap()
}

fn read(c: Characteristic, value: &[u8]) -> Event {
    Event::ReadDone { characteristic: c, result: Ok(value.to_vec()) }
}

fn wrote(c: Characteristic) -> Event {
    Event::WriteDone { characteristic: c, result: Ok(()) }
}

fn notify(c: Characteristic, value: &[u8]) -> Event {
    Event::Notified { characteristic: c, value: value.to_vec() }
}

fn write(c: Characteristic, value: &[u8]) -> Action {
    Action::Write { characteristic: c, value: value.to_vec(), mode: WriteMode::WithResponse }
}

fn failed(reason: FailureReason) -> Action {
    Action::Finished(Outcome::Failed(reason))
}

/// Bootloader session waiting for the address CS block write
fn bootloader_at_keys() -> Session {
    bootloader_at_keys_after(|_| {})
}

/// Bootloader session at the first key read, with `before_app` run while the
/// current-app read is outstanding
fn bootloader_at_keys_after(before_app: impl FnOnce(&mut Session)) -> Session {
    let (mut s, _) = start_with(bootloader());
    s.handle(read(C::Version, &[6]));
    s.handle(wrote(C::DataTransfer));
    assert_eq!(s.handle(wrote(C::TransferControl)), vec![Action::Read(C::CurrentApp)]);
    before_app(&mut s);
    assert_eq!(s.handle(read(C::CurrentApp, &[1])), vec![write(C::CsBlock, &[0, 0, 6, 0])]);
    s
}

/// Bootloader session with the first chunk in flight
fn transferring() -> Session {
    let mut s = bootloader_at_keys();
    let values: [&[u8]; 4] = [&ADDRESS_WORDS, &[0x27, 0x00], &[0x11; 16], &[0x22; 16]];
    for value in values {
        s.handle(wrote(C::CsBlock));
        s.handle(notify(C::DataTransfer, value));
    }
    s.handle(wrote(C::CurrentApp));
    s.handle(wrote(C::TransferControl));
    assert_eq!(s.state(), State::DataTransfer);
    s
}

/// Application session that has asked the target to reboot
fn switched() -> Session {
    let (mut s, out) = start_with(application());
    assert_eq!(out, vec![Action::Read(C::Version)]);
    assert_eq!(s.handle(read(C::Version, &[5])), vec![Action::Read(C::BatteryLevel)]);
    assert_eq!(
        s.handle(read(C::BatteryLevel, &[90])),
        vec![Action::Subscribe(C::ServiceChanged)]
    );
    assert_eq!(s.handle(wrote(C::ServiceChanged)), vec![Action::Read(C::CurrentApp)]);
    assert_eq!(s.handle(read(C::CurrentApp, &[1])), vec![write(C::CsKey, &[1])]);
    exchange_keys(&mut s);
    s
}

/// Read every key by id, then ask the target to reboot
fn exchange_keys(s: &mut Session) {
    assert_eq!(s.state(), State::ReadBtAddress);

    let values: [(&[u8], u8); 4] = [
        (&ADDRESS_LSB_FIRST, 2),
        (&[0x27, 0x00], 17),
        (&[0x11; 16], 18),
        (&[0x22; 16], 0),
    ];
    for (value, next_id) in values {
        assert_eq!(s.handle(wrote(C::CsKey)), vec![Action::Read(C::CsKey)]);
        let out = s.handle(read(C::CsKey, value));
        if next_id == 0 {
            assert_eq!(out, vec![write(C::CurrentApp, &[APP_BOOTLOADER])]);
        } else {
            assert_eq!(out, vec![write(C::CsKey, &[next_id])]);
        }
    }
    assert!(s.keys().all_valid());

    assert!(s.handle(wrote(C::CurrentApp)).is_empty());
    assert_eq!(s.state(), State::AwaitReconnect);
}

#[test]
fn bootloader_flow_merges_and_streams() {
    let (mut s, out) = start_with(bootloader());
    assert_eq!(out, vec![Action::Read(C::Version)]);
    assert_eq!(s.mode(), DeviceMode::Bootloader);
    assert_eq!(s.key_protocol(), KeyProtocol::ByCsBlock);

    assert_eq!(s.handle(read(C::Version, &[6])), vec![Action::Subscribe(C::DataTransfer)]);
    assert_eq!(s.handle(wrote(C::DataTransfer)), vec![Action::Subscribe(C::TransferControl)]);
    assert_eq!(s.handle(wrote(C::TransferControl)), vec![Action::Read(C::CurrentApp)]);
    assert_eq!(s.handle(read(C::CurrentApp, &[1])), vec![write(C::CsBlock, &[0, 0, 6, 0])]);
    assert_eq!(s.state(), State::ReadCsBlock);

    let steps: [(&[u8], State, Action); 4] = [
        (&ADDRESS_WORDS, State::ReadCrystalTrim, write(C::CsBlock, &[3, 0, 2, 0])),
        (&[0x27, 0x00], State::ReadIdentityRoot, write(C::CsBlock, &[4, 0, 16, 0])),
        (&[0x11; 16], State::ReadEncryptionRoot, write(C::CsBlock, &[12, 0, 16, 0])),
        (&[0x22; 16], State::SetCurrentApp, write(C::CurrentApp, &[1])),
    ];
    for (value, state, action) in steps {
        assert!(s.handle(wrote(C::CsBlock)).is_empty());
        assert_eq!(s.handle(notify(C::DataTransfer, value)), vec![action]);
        assert_eq!(s.state(), state);
    }
    assert_eq!(s.keys().get(KeyKind::BtAddress), Some(&ADDRESS_LSB_FIRST[..]));

    assert_eq!(
        s.handle(wrote(C::CurrentApp)),
        vec![
            Action::UpdateConnectionParameters(OtauConfig::default().fast_connection),
            write(C::TransferControl, &[2, 0]),
        ]
    );

    let mut streamed = Vec::new();
    let mut progress = Vec::new();
    let mut out = s.handle(wrote(C::TransferControl));
    while s.state() == State::DataTransfer {
        for action in out {
            match action {
                Action::Write { characteristic: C::DataTransfer, value, mode } => {
                    assert_eq!(mode, WriteMode::WithoutResponse);
                    assert!(value.len() <= 20);
                    streamed.extend(value);
                }
                Action::Progress(p) => progress.push(p),
                other => panic!("unexpected action {other:?}"),
            }
        }
        out = s.handle(wrote(C::DataTransfer));
    }
    assert_eq!(out, vec![write(C::TransferControl, &[4, 0])]);
    assert_eq!(progress, vec![16, 33, 50, 67, 84, 100]);

    let image = s.image();
    let expected: Vec<u8> = (0..image.word_count())
        .flat_map(|i| image.word(i).unwrap().to_le_bytes())
        .collect();
    assert_eq!(streamed, expected);

    image.validate().unwrap();
    let kb = image.locate_key_block_and_compute_size().unwrap();
    assert_eq!(image.word(kb.data_index).unwrap(), 0x0002);
    assert_eq!(image.word(kb.data_index + 2).unwrap(), 0xa5a5);
    assert_eq!(image.word(kb.data_index + 3).unwrap(), 0x0027);
    assert_eq!(image.word(kb.data_index + 4).unwrap(), 0x1111);

    assert_eq!(s.handle(wrote(C::TransferControl)), vec![Action::Finished(Outcome::Completed)]);
    assert_eq!(s.outcome(), Some(&Outcome::Completed));
    assert_eq!(s.state(), State::Idle);
    assert!(s.handle(wrote(C::DataTransfer)).is_empty());
}

#[test_case(5, write(C::CurrentApp, &[1]) ; "older bootloader keeps cached keys")]
#[test_case(6, write(C::CsBlock, &[0, 0, 6, 0]) ; "newer bootloader re-reads the cs block")]
fn reconnect_into_bootloader(version: u8, first_write: Action) {
    let mut s = switched();
    assert_eq!(s.handle(Event::Disconnected), vec![Action::Reconnect]);
    assert_eq!(s.state(), State::AwaitReconnect);

    assert_eq!(
        s.handle(Event::Connected { capabilities: bootloader() }),
        vec![Action::Read(C::Version)]
    );
    assert_eq!(s.mode(), DeviceMode::Bootloader);
    assert_eq!(s.key_protocol(), KeyProtocol::ByCsBlock);

    s.handle(read(C::Version, &[version]));
    s.handle(wrote(C::DataTransfer));
    s.handle(wrote(C::TransferControl));
    assert_eq!(s.handle(read(C::CurrentApp, &[1])), vec![first_write]);
    assert_eq!(s.keys().all_valid(), version < CS_BLOCK_REREAD_VERSION);
}

#[test]
fn link_drop_while_switching_is_the_reboot() {
    let (mut s, _) = start_with(application());
    s.state = State::SetCurrentApp;
    assert_eq!(s.handle(Event::Disconnected), vec![Action::Reconnect]);
    assert_eq!(s.state(), State::AwaitReconnect);
}

#[test]
fn target_still_in_application_after_reboot() {
    let mut s = switched();
    s.handle(Event::Disconnected);
    assert_eq!(
        s.handle(Event::Connected { capabilities: application() }),
        vec![Action::Disconnect, failed(FailureReason::BootloaderNotEntered)]
    );
}

#[test]
fn empty_battery_stops_before_key_exchange() {
    let (mut s, _) = start_with(application());
    s.handle(read(C::Version, &[5]));
    assert_eq!(
        s.handle(read(C::BatteryLevel, &[0])),
        vec![Action::Disconnect, failed(FailureReason::BatteryLow)]
    );
    assert_eq!(s.state(), State::Idle);
    assert_eq!(s.battery_level(), Some(0));
    assert!(!s.keys().is_valid(KeyKind::BtAddress));
    assert!(s.handle(read(C::CsKey, &ADDRESS_LSB_FIRST)).is_empty());
}

#[test]
fn encryption_is_requested_once_and_the_read_retried() {
    let (mut s, _) = start_with(bootloader());
    let denied = Event::ReadDone {
        characteristic: C::Version,
        result: Err(GattError::InsufficientAuthentication),
    };
    assert_eq!(s.handle(denied), vec![Action::RequestEncryption]);
    assert_eq!(
        s.handle(Event::SecurityChanged { result: Ok(()) }),
        vec![Action::Read(C::Version)]
    );
    assert!(s.handle(Event::SecurityChanged { result: Ok(()) }).is_empty());

    let denied_again = Event::ReadDone {
        characteristic: C::Version,
        result: Err(GattError::InsufficientEncryption),
    };
    assert_eq!(
        s.handle(denied_again),
        vec![
            Action::Disconnect,
            failed(FailureReason::Gatt {
                characteristic: C::Version,
                error: GattError::InsufficientEncryption,
            }),
        ]
    );
}

#[test]
fn encryption_retry_succeeds() {
    let (mut s, _) = start_with(bootloader());
    s.handle(Event::ReadDone {
        characteristic: C::Version,
        result: Err(GattError::InsufficientEncryption),
    });
    s.handle(Event::SecurityChanged { result: Ok(()) });
    assert_eq!(s.handle(read(C::Version, &[6])), vec![Action::Subscribe(C::DataTransfer)]);
    assert_eq!(s.protocol_version(), 6);
}

#[test]
fn failed_encryption_ends_the_operation() {
    let (mut s, _) = start_with(bootloader());
    s.handle(Event::ReadDone {
        characteristic: C::Version,
        result: Err(GattError::InsufficientAuthorization),
    });
    let rejected = GattError::Other("pairing rejected".into());
    assert_eq!(
        s.handle(Event::SecurityChanged { result: Err(rejected.clone()) }),
        vec![
            Action::Disconnect,
            failed(FailureReason::Gatt { characteristic: C::Version, error: rejected }),
        ]
    );
}

#[test]
fn current_app_read_is_retried_once_after_encryption() {
    let mut s = bootloader_at_keys_after(|s| {
        let denied = Event::ReadDone {
            characteristic: C::CurrentApp,
            result: Err(GattError::InsufficientAuthentication),
        };
        assert_eq!(s.handle(denied), vec![Action::RequestEncryption]);
        assert_eq!(
            s.handle(Event::SecurityChanged { result: Ok(()) }),
            vec![Action::Read(C::CurrentApp)]
        );
    });

    let denied_again = Event::WriteDone {
        characteristic: C::CsBlock,
        result: Err(GattError::InsufficientEncryption),
    };
    let out = s.handle(denied_again);
    assert!(!out.contains(&Action::RequestEncryption));
    assert_eq!(
        out,
        vec![Action::Disconnect, failed(FailureReason::KeyRead(KeyKind::BtAddress))]
    );
}

#[test]
fn bootloader_link_gets_its_own_encryption_request() {
    let (mut s, _) = start_with(application());
    s.handle(read(C::Version, &[5]));
    s.handle(read(C::BatteryLevel, &[90]));
    assert_eq!(s.handle(wrote(C::ServiceChanged)), vec![Action::Read(C::CurrentApp)]);
    let denied = Event::ReadDone {
        characteristic: C::CurrentApp,
        result: Err(GattError::InsufficientAuthentication),
    };
    assert_eq!(s.handle(denied), vec![Action::RequestEncryption]);
    assert_eq!(
        s.handle(Event::SecurityChanged { result: Ok(()) }),
        vec![Action::Read(C::CurrentApp)]
    );
    assert_eq!(s.handle(read(C::CurrentApp, &[1])), vec![write(C::CsKey, &[1])]);
    exchange_keys(&mut s);

    assert_eq!(s.handle(Event::Disconnected), vec![Action::Reconnect]);
    assert_eq!(
        s.handle(Event::Connected { capabilities: bootloader() }),
        vec![Action::Read(C::Version)]
    );
    let denied = Event::ReadDone {
        characteristic: C::Version,
        result: Err(GattError::InsufficientEncryption),
    };
    assert_eq!(s.handle(denied), vec![Action::RequestEncryption]);
    assert_eq!(
        s.handle(Event::SecurityChanged { result: Ok(()) }),
        vec![Action::Read(C::Version)]
    );
    assert_eq!(s.handle(read(C::Version, &[6])), vec![Action::Subscribe(C::DataTransfer)]);
}

#[test]
fn optional_key_failure_keeps_going() {
    let mut s = bootloader_at_keys();
    s.handle(wrote(C::CsBlock));
    s.handle(notify(C::DataTransfer, &ADDRESS_WORDS));
    assert_eq!(s.state(), State::ReadCrystalTrim);

    let refused = Event::WriteDone {
        characteristic: C::CsBlock,
        result: Err(GattError::Other("unlikely error".into())),
    };
    assert_eq!(s.handle(refused), vec![write(C::CsBlock, &[4, 0, 16, 0])]);
    assert_eq!(s.state(), State::ReadIdentityRoot);

    s.handle(wrote(C::CsBlock));
    assert_eq!(
        s.handle(notify(C::DataTransfer, &[0x11; 4])),
        vec![write(C::CsBlock, &[12, 0, 16, 0])],
        "short value leaves the identity root unread"
    );
    assert!(!s.keys().is_valid(KeyKind::CrystalTrim));
    assert!(!s.keys().is_valid(KeyKind::IdentityRoot));
}

#[test]
fn address_failure_is_fatal() {
    let mut s = bootloader_at_keys();
    let refused = Event::WriteDone {
        characteristic: C::CsBlock,
        result: Err(GattError::Application(0x80)),
    };
    assert_eq!(
        s.handle(refused),
        vec![Action::Disconnect, failed(FailureReason::KeyRead(KeyKind::BtAddress))]
    );
}

#[test_case(Event::Pause, &[3, 0], Outcome::Paused, State::PauseDataTransfer ; "pause")]
#[test_case(Event::Abort, &[6, 0], Outcome::Aborted, State::AbortDataTransfer ; "abort")]
fn stop_waits_for_the_chunk_in_flight(
    request: Event,
    control: &[u8],
    outcome: Outcome,
    waiting: State,
) {
    let mut s = transferring();
    assert!(s.handle(request).is_empty());
    assert_eq!(s.state(), waiting);
    assert_eq!(s.handle(wrote(C::DataTransfer)), vec![write(C::TransferControl, control)]);
    assert_eq!(s.state(), State::ResetTransferControl);
    assert!(s.handle(Event::Pause).is_empty());
    assert_eq!(s.handle(wrote(C::TransferControl)), vec![Action::Finished(outcome)]);
    assert_eq!(s.image().transfer_position(), 0);
    assert_eq!(s.image().packets_sent(), 0);
}

#[test]
fn abort_overrides_a_pending_pause() {
    let mut s = transferring();
    s.handle(Event::Pause);
    s.handle(Event::Abort);
    assert_eq!(s.handle(wrote(C::DataTransfer)), vec![write(C::TransferControl, &[6, 0])]);
}

#[test]
fn abort_before_transfer_disconnects() {
    let mut s = bootloader_at_keys();
    assert_eq!(
        s.handle(Event::Abort),
        vec![Action::Disconnect, Action::Finished(Outcome::Aborted)]
    );
    let mut s = bootloader_at_keys();
    assert!(s.handle(Event::Pause).is_empty());
    assert_eq!(s.state(), State::ReadCsBlock);
}

#[test_case(0x81 ; "image too big")]
#[test_case(0x82 ; "image corrupt")]
#[test_case(0x83 ; "battery low")]
fn target_error_during_transfer(code: u8) {
    let mut s = transferring();
    let rejected = Event::WriteDone {
        characteristic: C::DataTransfer,
        result: Err(GattError::Application(code)),
    };
    let target = TargetError::from_code(code).unwrap();
    assert_eq!(s.handle(rejected), vec![failed(FailureReason::Target(target))]);
    assert_eq!(s.image().transfer_position(), 0);
    assert_eq!(s.state(), State::Idle);
}

#[test]
fn transfer_control_failure_notification() {
    let mut s = transferring();
    assert!(s.handle(notify(C::TransferControl, &[3, 0])).is_empty());
    assert_eq!(
        s.handle(notify(C::TransferControl, &[5, 0])),
        vec![failed(FailureReason::TransferFailed)]
    );
}

#[test]
fn link_loss_fails_the_session() {
    let mut s = bootloader_at_keys();
    assert_eq!(s.handle(Event::Disconnected), vec![failed(FailureReason::LinkLost)]);
    assert!(s.handle(Event::Disconnected).is_empty());
}

#[test]
fn service_changed_refreshes() {
    let (mut s, _) = start_with(application());
    assert_eq!(
        s.handle(notify(C::ServiceChanged, &[])),
        vec![Action::RefreshServices]
    );
}

struct Xor;

impl ChallengeResponder for Xor {
    fn encrypt(
        &self,
        challenge: &[u8],
    ) -> Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>> {
        Ok(challenge.iter().map(|b| b ^ 0x5a).collect())
    }
}

struct NoKey;

impl ChallengeResponder for NoKey {
    fn encrypt(&self, _: &[u8]) -> Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>> {
        Err("no key".into())
    }
}

fn start_with_responder(responder: Box<dyn ChallengeResponder + Send>) -> (Session, Vec<Action>) {
    Session::start(
        bootloader().with(C::Challenge),
        image(),
        OtauConfig::default(),
        Box::new(BuiltinKeyDatabase),
        Some(responder),
    )
    .unwrap()
}

#[test]
fn challenge_is_answered_before_version() {
    let (mut s, out) = start_with_responder(Box::new(Xor));
    assert_eq!(out, vec![Action::Read(C::Challenge)]);
    assert_eq!(
        s.handle(read(C::Challenge, &[1, 2])),
        vec![write(C::Challenge, &[0x5b, 0x58])]
    );
    assert_eq!(s.handle(wrote(C::Challenge)), vec![Action::Read(C::Version)]);

    let (mut s, _) = start_with_responder(Box::new(NoKey));
    assert_eq!(
        s.handle(read(C::Challenge, &[1, 2])),
        vec![Action::Disconnect, failed(FailureReason::Challenge("no key".into()))]
    );
}

#[test]
fn challenge_skipped_without_responder() {
    let (_, out) = start_with(bootloader().with(C::Challenge));
    assert_eq!(out, vec![Action::Read(C::Version)]);
}

#[test]
fn start_refusals() {
    let err = Session::start(
        Capabilities::new(),
        image(),
        OtauConfig::default(),
        Box::new(BuiltinKeyDatabase),
        None,
    )
    .err()
    .unwrap();
    assert!(matches!(err, SessionError::NotSupporting));

    let mut corrupt = image();
    let block = corrupt.block_descriptor(0).unwrap();
    corrupt.set_word(block.offset as usize + 1, 0xbeef).unwrap();
    let err = Session::start(
        bootloader(),
        corrupt,
        OtauConfig::default(),
        Box::new(BuiltinKeyDatabase),
        None,
    )
    .err()
    .unwrap();
    assert!(matches!(err, SessionError::InvalidImage(_)));
}

fn every_event() -> Vec<Event> {
    let mut events = vec![
        Event::Connected { capabilities: Characteristic::ALL.into_iter().collect() },
        Event::SecurityChanged { result: Ok(()) },
        Event::SecurityChanged { result: Err(GattError::InsufficientAuthentication) },
        Event::Disconnected,
        Event::Pause,
        Event::Abort,
    ];
    for c in Characteristic::ALL {
        events.push(read(c, &[5, 0]));
        events.push(Event::ReadDone { characteristic: c, result: Err(GattError::InsufficientEncryption) });
        events.push(wrote(c));
        events.push(Event::WriteDone { characteristic: c, result: Err(GattError::Application(0x82)) });
        events.push(notify(c, &[5, 0]));
    }
    events
}

fn outstanding_for(event: &Event) -> Option<GattOp> {
    match event {
        Event::ReadDone { characteristic, .. } => Some(GattOp::Read(*characteristic)),
        Event::WriteDone { characteristic, .. } => Some(GattOp::write(*characteristic, vec![0])),
        _ => None,
    }
}

#[test]
fn every_state_handles_every_event() {
    for state in State::ALL {
        for event in every_event() {
            let (mut s, _) = start_with(Characteristic::ALL.into_iter().collect());
            s.queue.clear();
            if let Some(op) = outstanding_for(&event) {
                s.queue.submit(op);
                s.queue.issue_next();
            }
            s.state = state;

            let out = s.handle(event.clone());
            if state == State::Idle {
                assert!(out.is_empty(), "{event:?} acted in Idle");
            }
            let finished = out.iter().filter(|a| matches!(a, Action::Finished(_))).count();
            assert!(finished <= 1, "{state:?} + {event:?} finished twice");
            if finished == 1 {
                assert_eq!(s.state(), State::Idle, "{state:?} + {event:?}");
                assert!(s.is_finished());
            }
            let reads = out.iter().filter(|a| matches!(a, Action::Read(_))).count();
            assert!(reads <= 1, "{state:?} + {event:?} issued {reads} reads");
        }
    }
}
