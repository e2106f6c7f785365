//! OTA update session: one transition function from events to actions
//!
//! A `Session` is created once the target is connected and its characteristics
//! are known. It survives the application-to-bootloader reboot and nothing else.
//! Every other disconnect, and every outcome, leaves it in `Idle` where all
//! further events are ignored.

use log::{debug, info, warn};

use otau_image::{ImageError, ImageFile, KeyDatabase, KeyKind, ProvisioningKeys, merge_keys};
use otau_proto::{APP_BOOTLOADER, CS_BLOCK_REREAD_VERSION, CsBlockRequest, TransferControl};

use crate::config::OtauConfig;
use crate::event::{Action, Event, FailureReason, Outcome};
use crate::gatt::{Capabilities, Characteristic, GattError, WriteMode};
use crate::queue::{GattOp, GattQueue, Lane};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Idle,
    ReadChallenge,
    ReadVersion,
    ReadBatteryLevel,
    ConfigureNotifications,
    ReadCurrentApp,
    ReadBtAddress,
    ReadCsBlock,
    ReadCrystalTrim,
    ReadIdentityRoot,
    ReadEncryptionRoot,
    SetCurrentApp,
    AwaitReconnect,
    SetTransferControl,
    DataTransfer,
    PauseDataTransfer,
    AbortDataTransfer,
    ResetTransferControl,
}

impl State {
    pub const ALL: [State; 18] = [
        State::Idle,
        State::ReadChallenge,
        State::ReadVersion,
        State::ReadBatteryLevel,
        State::ConfigureNotifications,
        State::ReadCurrentApp,
        State::ReadBtAddress,
        State::ReadCsBlock,
        State::ReadCrystalTrim,
        State::ReadIdentityRoot,
        State::ReadEncryptionRoot,
        State::SetCurrentApp,
        State::AwaitReconnect,
        State::SetTransferControl,
        State::DataTransfer,
        State::PauseDataTransfer,
        State::AbortDataTransfer,
        State::ResetTransferControl,
    ];

    fn is_key_read(self) -> bool {
        matches!(
            self,
            State::ReadBtAddress
                | State::ReadCsBlock
                | State::ReadCrystalTrim
                | State::ReadIdentityRoot
                | State::ReadEncryptionRoot
        )
    }

    fn is_transfer(self) -> bool {
        matches!(
            self,
            State::SetTransferControl
                | State::DataTransfer
                | State::PauseDataTransfer
                | State::AbortDataTransfer
                | State::ResetTransferControl
        )
    }
}

/// Which firmware the target is running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceMode {
    NotSupporting,
    Bootloader,
    Application,
}

impl DeviceMode {
    pub fn detect(caps: &Capabilities) -> Self {
        if caps.contains(Characteristic::TransferControl)
            && caps.contains(Characteristic::DataTransfer)
        {
            DeviceMode::Bootloader
        } else if caps.contains(Characteristic::Version)
            && caps.contains(Characteristic::CurrentApp)
        {
            DeviceMode::Application
        } else {
            DeviceMode::NotSupporting
        }
    }
}

/// How provisioning keys are read from the target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyProtocol {
    None,
    /// Write a key id, then read it back
    ById,
    /// Request a CS block range; the value is notified on data transfer
    ByCsBlock,
}

impl KeyProtocol {
    pub fn detect(caps: &Capabilities) -> Self {
        if caps.contains(Characteristic::CsBlock) {
            KeyProtocol::ByCsBlock
        } else if caps.contains(Characteristic::CsKey) {
            KeyProtocol::ById
        } else {
            KeyProtocol::None
        }
    }
}

/// Answers the target's challenge; usually AES over the challenge bytes
pub trait ChallengeResponder {
    fn encrypt(&self, challenge: &[u8])
    -> Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>>;
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("image failed validation: {0}")]
    InvalidImage(#[from] ImageError),
    #[error("target exposes no OTA update characteristics")]
    NotSupporting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Completed,
    Paused,
    Aborted,
}

impl Stop {
    fn control(self) -> TransferControl {
        match self {
            Stop::Completed => TransferControl::Completed,
            Stop::Paused => TransferControl::Paused,
            Stop::Aborted => TransferControl::Abort,
        }
    }

    fn outcome(self) -> Outcome {
        match self {
            Stop::Completed => Outcome::Completed,
            Stop::Paused => Outcome::Paused,
            Stop::Aborted => Outcome::Aborted,
        }
    }
}

pub struct Session {
    state: State,
    mode: DeviceMode,
    key_protocol: KeyProtocol,
    capabilities: Capabilities,
    protocol_version: u8,
    battery_level: Option<u8>,
    current_app: Option<u8>,
    image: ImageFile,
    keys: ProvisioningKeys,
    /// Optional keys the target would not give us
    skipped_keys: Vec<KeyKind>,
    key_in_flight: Option<KeyKind>,
    config: OtauConfig,
    db: Box<dyn KeyDatabase + Send>,
    responder: Option<Box<dyn ChallengeResponder + Send>>,
    queue: GattQueue,
    encryption_requested: bool,
    /// Operation waiting for the link to become encrypted
    retry: Option<GattOp>,
    subscriptions: usize,
    switched_to_bootloader: bool,
    stop: Option<Stop>,
    progress_due: Option<u8>,
    outcome: Option<Outcome>,
}

impl Session {
    /// Validate the image and issue the first requests
    ///
    /// Nothing is sent to the target when the image is invalid or the target
    /// offers neither the application nor the bootloader characteristics.
    pub fn start(
        capabilities: Capabilities,
        image: ImageFile,
        config: OtauConfig,
        db: Box<dyn KeyDatabase + Send>,
        responder: Option<Box<dyn ChallengeResponder + Send>>,
    ) -> Result<(Self, Vec<Action>), SessionError> {
        image.validate()?;
        let mode = DeviceMode::detect(&capabilities);
        if mode == DeviceMode::NotSupporting {
            return Err(SessionError::NotSupporting);
        }
        let key_protocol = KeyProtocol::detect(&capabilities);
        info!("starting update: {mode:?} mode, keys {key_protocol:?}");

        let mut session = Self {
            state: State::Idle,
            mode,
            key_protocol,
            capabilities,
            protocol_version: 0,
            battery_level: None,
            current_app: None,
            image,
            keys: ProvisioningKeys::new(),
            skipped_keys: Vec::new(),
            key_in_flight: None,
            config,
            db,
            responder,
            queue: GattQueue::new(),
            encryption_requested: false,
            retry: None,
            subscriptions: 0,
            switched_to_bootloader: false,
            stop: None,
            progress_due: None,
            outcome: None,
        };

        let mut out = Vec::new();
        session.begin(&mut out);
        out.extend(session.queue.issue_next());
        Ok((session, out))
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn mode(&self) -> DeviceMode {
        self.mode
    }

    pub fn key_protocol(&self) -> KeyProtocol {
        self.key_protocol
    }

    pub fn protocol_version(&self) -> u8 {
        self.protocol_version
    }

    pub fn battery_level(&self) -> Option<u8> {
        self.battery_level
    }

    pub fn keys(&self) -> &ProvisioningKeys {
        &self.keys
    }

    /// The working copy, with keys merged once the bootloader is reached
    pub fn image(&self) -> &ImageFile {
        &self.image
    }

    pub fn outcome(&self) -> Option<&Outcome> {
        self.outcome.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }

    /// Percent of the image sent, from the fixed 20-byte packet size
    pub fn progress(&self) -> u8 {
        let size = self.image.file_size() as u64;
        if size == 0 {
            return 100;
        }
        let sent = self.image.packets_sent() as u64 * 20 * 100 / size;
        sent.min(100) as u8
    }

    pub fn handle(&mut self, event: Event) -> Vec<Action> {
        let mut out = Vec::new();
        if self.state == State::Idle {
            debug!("session idle, ignoring {event:?}");
            return out;
        }

        match event {
            Event::Connected { capabilities } => self.on_connected(capabilities, &mut out),
            Event::ReadDone { characteristic, result } => {
                match self.queue.complete(Lane::Read, characteristic) {
                    Some(op) => match result {
                        Ok(value) => self.on_read(characteristic, value, &mut out),
                        Err(e) => self.on_failure(op, e, &mut out),
                    },
                    None => debug!("ignoring read of {characteristic}: none outstanding"),
                }
            }
            Event::WriteDone { characteristic, result } => {
                match self.queue.complete(Lane::Write, characteristic) {
                    Some(op) => match result {
                        Ok(()) => self.on_written(op, &mut out),
                        Err(e) => self.on_failure(op, e, &mut out),
                    },
                    None => debug!("ignoring write to {characteristic}: none outstanding"),
                }
            }
            Event::Notified { characteristic, value } => {
                self.on_notified(characteristic, value, &mut out)
            }
            Event::SecurityChanged { result } => self.on_security_changed(result, &mut out),
            Event::Disconnected => self.on_disconnected(&mut out),
            Event::Pause => self.on_stop_request(Stop::Paused, &mut out),
            Event::Abort => self.on_stop_request(Stop::Aborted, &mut out),
        }

        if self.state != State::Idle && self.retry.is_none() {
            out.extend(self.queue.issue_next());
        }
        if let Some(percent) = self.progress_due.take() {
            out.push(Action::Progress(percent));
        }
        out
    }

    fn enter(&mut self, state: State) {
        debug!("{:?} -> {:?}", self.state, state);
        self.state = state;
    }

    fn has(&self, c: Characteristic) -> bool {
        self.capabilities.contains(c)
    }

    fn begin(&mut self, out: &mut Vec<Action>) {
        if self.responder.is_some() && self.has(Characteristic::Challenge) {
            self.enter(State::ReadChallenge);
            self.queue.submit(GattOp::Read(Characteristic::Challenge));
        } else {
            self.begin_version(out);
        }
    }

    fn begin_version(&mut self, out: &mut Vec<Action>) {
        if self.has(Characteristic::Version) {
            self.enter(State::ReadVersion);
            self.queue.submit(GattOp::Read(Characteristic::Version));
        } else {
            self.begin_battery(out);
        }
    }

    fn begin_battery(&mut self, out: &mut Vec<Action>) {
        if self.has(Characteristic::BatteryLevel) {
            self.enter(State::ReadBatteryLevel);
            self.queue.submit(GattOp::Read(Characteristic::BatteryLevel));
        } else {
            self.begin_notifications(out);
        }
    }

    fn begin_notifications(&mut self, out: &mut Vec<Action>) {
        self.enter(State::ConfigureNotifications);
        let mut wanted = Vec::new();
        if self.mode == DeviceMode::Application {
            wanted.push(Characteristic::ServiceChanged);
        }
        wanted.push(Characteristic::DataTransfer);
        if self.mode == DeviceMode::Bootloader {
            wanted.push(Characteristic::TransferControl);
        }

        self.subscriptions = 0;
        for c in wanted.into_iter().filter(|c| self.capabilities.contains(*c)) {
            self.queue.submit(GattOp::Subscribe(c));
            self.subscriptions += 1;
        }
        if self.subscriptions == 0 {
            self.begin_current_app(out);
        }
    }

    fn begin_current_app(&mut self, out: &mut Vec<Action>) {
        if self.has(Characteristic::CurrentApp) {
            self.enter(State::ReadCurrentApp);
            self.queue.submit(GattOp::Read(Characteristic::CurrentApp));
        } else {
            self.begin_keys(out);
        }
    }

    fn begin_keys(&mut self, out: &mut Vec<Action>) {
        if self.switched_to_bootloader
            && self.key_protocol == KeyProtocol::ByCsBlock
            && self.protocol_version >= CS_BLOCK_REREAD_VERSION
        {
            info!("bootloader v{} serves the CS block, re-reading keys", self.protocol_version);
            self.keys.invalidate_all();
            self.skipped_keys.clear();
        }
        if self.key_protocol == KeyProtocol::None {
            debug!("target offers no key characteristic");
            self.begin_set_current_app(out);
        } else {
            self.next_key(out);
        }
    }

    fn key_state(&self, kind: KeyKind) -> State {
        match kind {
            KeyKind::BtAddress if self.key_protocol == KeyProtocol::ByCsBlock => State::ReadCsBlock,
            KeyKind::BtAddress => State::ReadBtAddress,
            KeyKind::CrystalTrim => State::ReadCrystalTrim,
            KeyKind::IdentityRoot => State::ReadIdentityRoot,
            KeyKind::EncryptionRoot => State::ReadEncryptionRoot,
        }
    }

    fn next_key(&mut self, out: &mut Vec<Action>) {
        let next = KeyKind::ALL
            .into_iter()
            .find(|k| !self.keys.is_valid(*k) && !self.skipped_keys.contains(k));
        let Some(kind) = next else {
            return self.begin_set_current_app(out);
        };

        self.key_in_flight = Some(kind);
        self.enter(self.key_state(kind));
        match self.key_protocol {
            KeyProtocol::ById => {
                self.queue.submit(GattOp::write(Characteristic::CsKey, vec![kind.cs_key_id()]));
            }
            KeyProtocol::ByCsBlock => match self.db.key(self.config.cs_version, kind) {
                Some(desc) => {
                    let request = CsBlockRequest {
                        offset: desc.offset,
                        length: desc.length.saturating_mul(2),
                    };
                    self.queue.submit(GattOp::write(Characteristic::CsBlock, request.to_bytes()));
                }
                None => {
                    warn!("no CS version {} entry for {kind}", self.config.cs_version);
                    self.key_read_failed(kind, out);
                }
            },
            KeyProtocol::None => self.begin_set_current_app(out),
        }
    }

    fn key_value(&mut self, value: Vec<u8>, out: &mut Vec<Action>) {
        let Some(kind) = self.key_in_flight.take() else {
            debug!("key value with no key outstanding");
            return;
        };
        let stored = match self.key_protocol {
            KeyProtocol::ByCsBlock => self.keys.set_from_cs_block(kind, &value),
            _ => self.keys.set(kind, &value),
        };
        match stored {
            Ok(()) => {
                debug!("read {kind}");
                self.next_key(out);
            }
            Err(e) => {
                warn!("{e}");
                self.key_read_failed(kind, out);
            }
        }
    }

    fn key_read_failed(&mut self, kind: KeyKind, out: &mut Vec<Action>) {
        self.key_in_flight = None;
        if kind == KeyKind::BtAddress {
            return self.fail_session(FailureReason::KeyRead(kind), out);
        }
        warn!("{kind} unavailable, keeping the image placeholder");
        self.keys.invalidate(kind);
        self.skipped_keys.push(kind);
        self.next_key(out);
    }

    fn begin_set_current_app(&mut self, out: &mut Vec<Action>) {
        match self.mode {
            DeviceMode::Application => {
                info!("switching target to the bootloader");
                self.enter(State::SetCurrentApp);
                self.queue.submit(GattOp::write(Characteristic::CurrentApp, vec![APP_BOOTLOADER]));
            }
            DeviceMode::Bootloader => {
                match merge_keys(&mut self.image, &self.keys, self.db.as_ref(), self.config.cs_version) {
                    Ok(report) => info!("merged keys {:?}", report.merged),
                    Err(e) => return self.fail_session(FailureReason::Merge(e.to_string()), out),
                }
                match self.config.target_app.or(self.current_app) {
                    Some(app) if self.has(Characteristic::CurrentApp) => {
                        info!("flashing application slot {app}");
                        self.enter(State::SetCurrentApp);
                        self.queue.submit(GattOp::write(Characteristic::CurrentApp, vec![app]));
                    }
                    _ => self.begin_transfer_control(out),
                }
            }
            DeviceMode::NotSupporting => self.fail_session(FailureReason::NotSupporting, out),
        }
    }

    fn begin_transfer_control(&mut self, out: &mut Vec<Action>) {
        self.enter(State::SetTransferControl);
        out.push(Action::UpdateConnectionParameters(self.config.fast_connection));
        self.queue.submit(GattOp::write(
            Characteristic::TransferControl,
            TransferControl::Start.to_bytes(),
        ));
    }

    fn send_chunk(&mut self) {
        let chunk = self.image.get_next_chunk(self.config.effective_chunk_size());
        if chunk.is_empty() {
            info!("image sent in {} packets", self.image.packets_sent());
            return self.write_stop(Stop::Completed);
        }
        self.queue.submit(GattOp::Write {
            characteristic: Characteristic::DataTransfer,
            value: chunk,
            mode: WriteMode::WithoutResponse,
        });
        self.progress_due = Some(self.progress());
    }

    fn write_stop(&mut self, stop: Stop) {
        self.stop = Some(stop);
        self.enter(State::ResetTransferControl);
        self.queue.submit(GattOp::write(Characteristic::TransferControl, stop.control().to_bytes()));
    }

    fn finish_stop(&mut self, out: &mut Vec<Action>) {
        let Some(stop) = self.stop.take() else {
            debug!("transfer control written with no stop pending");
            return;
        };
        if stop != Stop::Completed {
            self.image.reset_transfer();
        }
        self.finish(stop.outcome(), out);
    }

    fn finish(&mut self, outcome: Outcome, out: &mut Vec<Action>) {
        info!("update finished: {outcome:?}");
        self.queue.clear();
        self.retry = None;
        self.key_in_flight = None;
        self.enter(State::Idle);
        self.outcome = Some(outcome.clone());
        out.push(Action::Finished(outcome));
    }

    /// Give up on the target entirely
    fn fail_session(&mut self, reason: FailureReason, out: &mut Vec<Action>) {
        warn!("{reason}");
        out.push(Action::Disconnect);
        self.image.reset_transfer();
        self.finish(Outcome::Failed(reason), out);
    }

    /// Give up on this transfer; the link stays up
    fn fail_transfer(&mut self, reason: FailureReason, out: &mut Vec<Action>) {
        warn!("{reason}");
        self.image.reset_transfer();
        self.finish(Outcome::Failed(reason), out);
    }

    fn answer_challenge(&mut self, challenge: Vec<u8>, out: &mut Vec<Action>) {
        let response = match &self.responder {
            Some(responder) => responder.encrypt(&challenge),
            None => return self.begin_version(out),
        };
        match response {
            Ok(response) => self.queue.submit(GattOp::write(Characteristic::Challenge, response)),
            Err(e) => self.fail_session(FailureReason::Challenge(e.to_string()), out),
        }
    }

    fn on_connected(&mut self, capabilities: Capabilities, out: &mut Vec<Action>) {
        if self.state != State::AwaitReconnect {
            debug!("already connected, ignoring");
            return;
        }
        self.capabilities = capabilities;
        self.mode = DeviceMode::detect(&capabilities);
        self.key_protocol = KeyProtocol::detect(&capabilities);
        self.queue.clear();
        // the new link starts unencrypted
        self.encryption_requested = false;
        self.retry = None;
        info!("reconnected: {:?} mode, keys {:?}", self.mode, self.key_protocol);
        match self.mode {
            DeviceMode::Bootloader => self.begin(out),
            DeviceMode::Application => self.fail_session(FailureReason::BootloaderNotEntered, out),
            DeviceMode::NotSupporting => self.fail_session(FailureReason::NotSupporting, out),
        }
    }

    fn on_read(&mut self, c: Characteristic, value: Vec<u8>, out: &mut Vec<Action>) {
        match (self.state, c) {
            (State::ReadChallenge, Characteristic::Challenge) => self.answer_challenge(value, out),
            (State::ReadVersion, Characteristic::Version) => {
                self.protocol_version = value.first().copied().unwrap_or_default();
                info!("target protocol version {}", self.protocol_version);
                self.begin_battery(out);
            }
            (State::ReadBatteryLevel, Characteristic::BatteryLevel) => {
                self.battery_level = value.first().copied();
                match self.battery_level {
                    Some(0) => self.fail_session(FailureReason::BatteryLow, out),
                    level => {
                        debug!("battery level {level:?}");
                        self.begin_notifications(out);
                    }
                }
            }
            (State::ReadCurrentApp, Characteristic::CurrentApp) => {
                self.current_app = value.first().copied();
                debug!("current app {:?}", self.current_app);
                self.begin_keys(out);
            }
            (state, Characteristic::CsKey) if state.is_key_read() => self.key_value(value, out),
            (state, c) => debug!("unexpected read of {c} in {state:?}"),
        }
    }

    fn on_written(&mut self, op: GattOp, out: &mut Vec<Action>) {
        let c = op.characteristic();
        match (self.state, c) {
            (State::ReadChallenge, Characteristic::Challenge) => self.begin_version(out),
            (State::ConfigureNotifications, _) if matches!(op, GattOp::Subscribe(_)) => {
                self.subscriptions = self.subscriptions.saturating_sub(1);
                if self.subscriptions == 0 {
                    self.begin_current_app(out);
                }
            }
            (state, Characteristic::CsKey) if state.is_key_read() => {
                self.queue.submit(GattOp::Read(Characteristic::CsKey));
            }
            (state, Characteristic::CsBlock) if state.is_key_read() => {
                debug!("CS block requested, waiting for its notification");
            }
            (State::SetCurrentApp, Characteristic::CurrentApp) => match self.mode {
                DeviceMode::Application => {
                    self.switched_to_bootloader = true;
                    self.enter(State::AwaitReconnect);
                }
                _ => self.begin_transfer_control(out),
            },
            (State::SetTransferControl, Characteristic::TransferControl) => {
                self.image.reset_transfer();
                self.enter(State::DataTransfer);
                self.send_chunk();
            }
            (State::DataTransfer, Characteristic::DataTransfer) => self.send_chunk(),
            (State::PauseDataTransfer, Characteristic::DataTransfer) => self.write_stop(Stop::Paused),
            (State::AbortDataTransfer, Characteristic::DataTransfer) => self.write_stop(Stop::Aborted),
            (State::ResetTransferControl, Characteristic::TransferControl) => self.finish_stop(out),
            (state, c) => debug!("unexpected write to {c} in {state:?}"),
        }
    }

    fn on_notified(&mut self, c: Characteristic, value: Vec<u8>, out: &mut Vec<Action>) {
        match c {
            Characteristic::DataTransfer
                if self.state.is_key_read() && self.key_protocol == KeyProtocol::ByCsBlock =>
            {
                self.key_value(value, out)
            }
            Characteristic::TransferControl if self.state.is_transfer() => {
                match TransferControl::from_bytes(&value) {
                    Ok(TransferControl::Failed) => {
                        self.fail_transfer(FailureReason::TransferFailed, out)
                    }
                    Ok(other) => debug!("transfer control notified {other:?}"),
                    Err(e) => debug!("{e}"),
                }
            }
            Characteristic::ServiceChanged => {
                info!("target services changed");
                out.push(Action::RefreshServices);
            }
            c => debug!("ignoring notification on {c} in {:?}", self.state),
        }
    }

    fn on_failure(&mut self, op: GattOp, error: GattError, out: &mut Vec<Action>) {
        if error.is_security() && !self.encryption_requested {
            info!("{}: {error}, requesting encryption", op.characteristic());
            self.encryption_requested = true;
            self.retry = Some(op);
            out.push(Action::RequestEncryption);
            return;
        }
        self.operation_failed(op.characteristic(), error, out);
    }

    fn operation_failed(&mut self, c: Characteristic, error: GattError, out: &mut Vec<Action>) {
        let key = self.key_in_flight.filter(|_| self.state.is_key_read());
        match (key, c) {
            (Some(kind), Characteristic::CsKey | Characteristic::CsBlock) => {
                warn!("reading {kind} failed: {error}");
                self.key_read_failed(kind, out);
            }
            _ if self.state == State::ReadBatteryLevel && c == Characteristic::BatteryLevel => {
                warn!("battery level unavailable: {error}");
                self.begin_notifications(out);
            }
            _ => {
                let reason = match error.target_error() {
                    Some(target) => FailureReason::Target(target),
                    None => FailureReason::Gatt { characteristic: c, error },
                };
                if self.state.is_transfer() {
                    self.fail_transfer(reason, out);
                } else {
                    self.fail_session(reason, out);
                }
            }
        }
    }

    fn on_security_changed(&mut self, result: Result<(), GattError>, out: &mut Vec<Action>) {
        let Some(op) = self.retry.take() else {
            debug!("security changed with nothing to retry");
            return;
        };
        match result {
            Ok(()) => {
                info!("link encrypted, retrying {}", op.characteristic());
                self.queue.resubmit(op);
            }
            Err(e) => self.operation_failed(op.characteristic(), e, out),
        }
    }

    fn on_disconnected(&mut self, out: &mut Vec<Action>) {
        let rebooting = self.state == State::AwaitReconnect
            || (self.state == State::SetCurrentApp && self.mode == DeviceMode::Application);
        if rebooting {
            info!("target rebooting into the bootloader, reconnecting");
            self.queue.clear();
            self.retry = None;
            self.switched_to_bootloader = true;
            self.enter(State::AwaitReconnect);
            out.push(Action::Reconnect);
            return;
        }
        self.image.reset_transfer();
        self.finish(Outcome::Failed(FailureReason::LinkLost), out);
    }

    fn on_stop_request(&mut self, stop: Stop, out: &mut Vec<Action>) {
        match (self.state, stop) {
            (State::DataTransfer, _) => {
                if self.queue.outstanding(Lane::Write).is_some() {
                    self.enter(match stop {
                        Stop::Aborted => State::AbortDataTransfer,
                        _ => State::PauseDataTransfer,
                    });
                } else {
                    self.write_stop(stop);
                }
            }
            (State::PauseDataTransfer, Stop::Aborted) => self.enter(State::AbortDataTransfer),
            (State::AbortDataTransfer | State::ResetTransferControl, _) => {
                debug!("transfer already stopping, ignoring {stop:?}");
            }
            (_, Stop::Aborted) => {
                info!("aborted before the transfer started");
                out.push(Action::Disconnect);
                self.finish(Outcome::Aborted, out);
            }
            (state, _) => debug!("nothing to pause in {state:?}"),
        }
    }
}

#[cfg(test)]
mod tests;
