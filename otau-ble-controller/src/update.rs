//! Run an update session against a real peripheral
//!
//! Actions are executed strictly in order. Each GATT read, write or
//! subscription is awaited and its completion fed back before the next action
//! runs. Notifications, adapter disconnects and user requests that arrived in
//! the meantime are fed first; when no action is pending they are awaited with
//! `tokio::select!`.

use std::collections::VecDeque;
use std::time::Duration;

use btleplug::api::{Central, CentralEvent, Peripheral as _, WriteType};
use btleplug::platform::{Adapter, Peripheral};
use futures::future::ready;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use log::{debug, info, warn};
use tokio::sync::mpsc;

use otau_engine::{
    Action, ChallengeResponder, Characteristic, Event, GattError, ImageFile, OtauConfig, Outcome,
    Session, SessionError, WriteMode,
};
use otau_image::KeyDatabase;

use crate::ble::{DriverError, connect, find_characteristic, gatt_error};

const RECONNECT_ATTEMPTS: u32 = 5;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Everything an update needs besides the link
pub struct UpdateRequest {
    pub image: ImageFile,
    pub config: OtauConfig,
    pub db: Box<dyn KeyDatabase + Send>,
    pub responder: Option<Box<dyn ChallengeResponder + Send>>,
}

impl UpdateRequest {
    /// Reject a corrupt image before touching the radio
    pub fn validate(&self) -> Result<(), DriverError> {
        self.image.validate().map_err(SessionError::from)?;
        Ok(())
    }
}

fn missing(c: Characteristic) -> GattError {
    GattError::Other(format!("{c} not present"))
}

/// Run one GATT action and describe its completion
async fn perform(peripheral: &Peripheral, action: Action) -> Result<Option<Event>, DriverError> {
    let event = match action {
        Action::Read(c) => {
            let result = match find_characteristic(peripheral, c) {
                Some(ch) => peripheral.read(&ch).await.map_err(gatt_error),
                None => Err(missing(c)),
            };
            Event::ReadDone { characteristic: c, result }
        }
        Action::Write { characteristic: c, value, mode } => {
            let write_type = match mode {
                WriteMode::WithResponse => WriteType::WithResponse,
                WriteMode::WithoutResponse => WriteType::WithoutResponse,
            };
            let result = match find_characteristic(peripheral, c) {
                Some(ch) => peripheral.write(&ch, &value, write_type).await.map_err(gatt_error),
                None => Err(missing(c)),
            };
            Event::WriteDone { characteristic: c, result }
        }
        Action::Subscribe(c) => {
            let result = match find_characteristic(peripheral, c) {
                Some(ch) => peripheral.subscribe(&ch).await.map_err(gatt_error),
                None => Err(missing(c)),
            };
            Event::WriteDone { characteristic: c, result }
        }
        Action::RequestEncryption => {
            // the OS pairs on demand; btleplug has no explicit request
            info!("encryption requested, relying on OS pairing");
            Event::SecurityChanged { result: Ok(()) }
        }
        Action::UpdateConnectionParameters(params) => {
            debug!("connection parameter update not supported by btleplug: {params:?}");
            return Ok(None);
        }
        Action::RefreshServices => {
            peripheral.discover_services().await?;
            return Ok(None);
        }
        Action::Disconnect => {
            let _ = peripheral.disconnect().await;
            return Ok(None);
        }
        Action::Reconnect | Action::Progress(_) | Action::Finished(_) => return Ok(None),
    };

    // a failed operation on a dropped link is a disconnect, not a GATT error
    let failed = matches!(
        &event,
        Event::ReadDone { result: Err(_), .. } | Event::WriteDone { result: Err(_), .. }
    );
    if failed && !peripheral.is_connected().await.unwrap_or(false) {
        return Ok(Some(Event::Disconnected));
    }
    Ok(Some(event))
}

async fn reconnect(peripheral: &Peripheral, config: &OtauConfig) -> Result<Event, DriverError> {
    for attempt in 1..=RECONNECT_ATTEMPTS {
        tokio::time::sleep(RECONNECT_DELAY).await;
        match connect(peripheral, config.connect_timeout_secs).await {
            Ok(capabilities) => return Ok(Event::Connected { capabilities }),
            Err(e) => warn!("reconnect attempt {attempt} failed: {e}"),
        }
    }
    Err(DriverError::ReconnectFailed)
}

/// Notifications from the target, as session events
async fn notification_events(peripheral: &Peripheral) -> Result<BoxStream<'static, Event>, DriverError> {
    let stream = peripheral.notifications().await?;
    Ok(stream
        .filter_map(|n| {
            let event = match Characteristic::from_uuid(n.uuid.as_u128()) {
                Some(characteristic) => Some(Event::Notified { characteristic, value: n.value }),
                None => {
                    debug!("notification from unknown {}", n.uuid);
                    None
                }
            };
            ready(event)
        })
        .boxed())
}

/// Adapter disconnects of `peripheral`, as session events
///
/// A fresh stream starts empty, so disconnects from an earlier link are not
/// replayed.
async fn link_events(adapter: &Adapter, peripheral: &Peripheral) -> Result<BoxStream<'static, Event>, DriverError> {
    let id = peripheral.id();
    let stream = adapter.events().await?;
    Ok(stream
        .filter_map(move |event| {
            ready(match event {
                CentralEvent::DeviceDisconnected(gone) if gone == id => Some(Event::Disconnected),
                _ => None,
            })
        })
        .boxed())
}

/// A session together with the actions it asked for and the driver has not
/// performed yet
struct Link {
    session: Session,
    pending: VecDeque<Action>,
    up: bool,
}

impl Link {
    fn new(session: Session, actions: Vec<Action>) -> Self {
        Self { session, pending: actions.into(), up: true }
    }

    fn feed(&mut self, event: Event) {
        if matches!(event, Event::Disconnected) {
            if !self.up {
                debug!("link already down, ignoring disconnect");
                return;
            }
            self.up = false;
            self.pending.clear();
        }
        self.pending.extend(self.session.handle(event));
    }

    /// Feed every event `source` already holds, without waiting
    fn drain<S: futures::Stream<Item = Event> + Unpin>(&mut self, source: &mut S) {
        while let Some(Some(event)) = source.next().now_or_never() {
            self.feed(event);
        }
    }

    /// Next action to perform, after feeding whatever arrived while the last
    /// one ran
    fn next_action<N, L>(
        &mut self,
        notifications: &mut N,
        links: &mut L,
        requests: &mut mpsc::Receiver<Event>,
    ) -> Option<Action>
    where
        N: futures::Stream<Item = Event> + Unpin,
        L: futures::Stream<Item = Event> + Unpin,
    {
        while let Ok(event) = requests.try_recv() {
            self.feed(event);
        }
        self.drain(notifications);
        self.drain(links);
        self.pending.pop_front()
    }

    fn reconnected(&mut self, event: Event) {
        self.up = true;
        self.feed(event);
    }
}

/// Update a connected target
///
/// `requests` carries user `Pause`/`Abort` events. `on_progress` receives the
/// transfer percentage.
pub async fn update(
    adapter: &Adapter,
    peripheral: &Peripheral,
    request: UpdateRequest,
    mut requests: mpsc::Receiver<Event>,
    mut on_progress: impl FnMut(u8),
) -> Result<Outcome, DriverError> {
    request.validate()?;
    let config = request.config.clone();
    let capabilities = connect(peripheral, config.connect_timeout_secs).await?;
    let (session, actions) = Session::start(
        capabilities,
        request.image,
        request.config,
        request.db,
        request.responder,
    )?;

    let mut link = Link::new(session, actions);
    let mut notifications = notification_events(peripheral).await?;
    let mut links = link_events(adapter, peripheral).await?;

    loop {
        while let Some(action) = link.next_action(&mut notifications, &mut links, &mut requests) {
            match action {
                Action::Finished(outcome) => {
                    if outcome == Outcome::Completed {
                        let _ = peripheral.disconnect().await;
                    }
                    return Ok(outcome);
                }
                Action::Progress(percent) => on_progress(percent),
                Action::Reconnect => {
                    let event = reconnect(peripheral, &config).await?;
                    notifications = notification_events(peripheral).await?;
                    links = link_events(adapter, peripheral).await?;
                    link.reconnected(event);
                }
                Action::Disconnect => {
                    link.up = false;
                    let _ = peripheral.disconnect().await;
                }
                action => {
                    if let Some(event) = perform(peripheral, action).await? {
                        link.feed(event);
                    }
                }
            }
        }

        tokio::select! {
            Some(event) = notifications.next() => link.feed(event),
            event = links.next() => match event {
                Some(event) => link.feed(event),
                None => return Err(DriverError::StreamClosed),
            },
            Some(event) = requests.recv() => link.feed(event),
        }
    }
}
