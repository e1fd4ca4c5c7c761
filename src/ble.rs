use btleplug::{
    api::{BDAddr, Characteristic, Descriptor, Peripheral as _, ValueNotification, WriteType},
    platform::Peripheral,
};
use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use parking_lot::Mutex;
use std::{future::Future, pin::Pin, sync::Arc, time::Duration};
use tokio::{
    runtime::Handle,
    sync::mpsc,
    task::JoinHandle,
    time::{interval, timeout, MissedTickBehavior},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{GadgetError, Result},
    forced::force_operation,
    link::{GattLink, GattTransport},
    listener::{GadgetListener, ListenerId},
    registry::ServiceRegistry,
    session::GadgetSession,
    types::{
        CompletionEvent, ConnectionConfig, DownloadStatus, ForceConfig, GattTarget, Operation,
        TransportEvent,
    },
};

/// Status reported when the peripheral rejects or fails an operation
pub const GATT_ERROR: u8 = 0x85;

/// Status reported when the target does not exist on the peripheral
pub const ATTRIBUTE_NOT_FOUND: u8 = 0x0A;

type NotificationStream = Pin<Box<dyn Stream<Item = ValueNotification> + Send>>;

/// [`GattTransport`] over a btleplug peripheral
///
/// Every accepted submission runs on its own tokio task and reports back
/// through the event channel as a [`TransportEvent::Completed`].
pub struct BtleTransport {
    peripheral: Peripheral,
    characteristics: Vec<Characteristic>,
    events: mpsc::UnboundedSender<TransportEvent>,
    runtime: Handle,
}

impl BtleTransport {
    /// Create a transport over a connected peripheral with discovered services
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime.
    #[must_use]
    pub fn new(
        peripheral: Peripheral,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        let characteristics = peripheral.characteristics().into_iter().collect();
        Self {
            peripheral,
            characteristics,
            events,
            runtime: Handle::current(),
        }
    }

    fn run<F>(&self, target: GattTarget, operation: F)
    where
        F: Future<Output = btleplug::Result<Vec<u8>>> + Send + 'static,
    {
        let events = self.events.clone();
        self.runtime.spawn(async move {
            let event = match operation.await {
                Ok(payload) => CompletionEvent::success(target, payload),
                Err(e) => {
                    warn!("GATT operation on {} failed: {}", target, e);
                    CompletionEvent::failure(target, GATT_ERROR)
                }
            };
            if events.send(TransportEvent::Completed(event)).is_err() {
                debug!("Session gone, dropping completion for {}", target);
            }
        });
    }

    fn not_found(&self, target: &GattTarget) -> Result<bool> {
        warn!(
            "{}, failing {}",
            GadgetError::CharacteristicNotFound(target.characteristic),
            target
        );
        let event = CompletionEvent::failure(*target, ATTRIBUTE_NOT_FOUND);
        if self.events.send(TransportEvent::Completed(event)).is_err() {
            return Err(GadgetError::Disconnected);
        }
        Ok(true)
    }
}

impl GattTransport for BtleTransport {
    fn submit_read(&self, target: &GattTarget) -> Result<bool> {
        let Some(characteristic) = find_characteristic(&self.characteristics, target).cloned()
        else {
            return self.not_found(target);
        };
        let peripheral = self.peripheral.clone();
        self.run(*target, async move { peripheral.read(&characteristic).await });
        Ok(true)
    }

    fn submit_write(&self, target: &GattTarget, value: &[u8]) -> Result<bool> {
        let Some(characteristic) = find_characteristic(&self.characteristics, target).cloned()
        else {
            return self.not_found(target);
        };
        let peripheral = self.peripheral.clone();
        let value = value.to_vec();
        self.run(*target, async move {
            peripheral
                .write(&characteristic, &value, WriteType::WithResponse)
                .await
                .map(|()| value)
        });
        Ok(true)
    }

    fn submit_descriptor_op(&self, target: &GattTarget, value: Option<&[u8]>) -> Result<bool> {
        let Some(descriptor) = find_descriptor(&self.characteristics, target).cloned() else {
            return self.not_found(target);
        };
        let peripheral = self.peripheral.clone();
        match value {
            None => self.run(*target, async move {
                peripheral.read_descriptor(&descriptor).await
            }),
            Some(value) => {
                let value = value.to_vec();
                self.run(*target, async move {
                    peripheral
                        .write_descriptor(&descriptor, &value)
                        .await
                        .map(|()| value)
                });
            }
        }
        Ok(true)
    }

    fn submit_set_notification(&self, target: &GattTarget, enable: bool) -> Result<bool> {
        let Some(characteristic) = find_characteristic(&self.characteristics, target).cloned()
        else {
            return self.not_found(target);
        };
        let peripheral = self.peripheral.clone();
        self.run(*target, async move {
            if enable {
                peripheral.subscribe(&characteristic).await?;
            } else {
                peripheral.unsubscribe(&characteristic).await?;
            }
            Ok::<_, btleplug::Error>(Vec::new())
        });
        Ok(true)
    }
}

/// Characteristic addressed by `target`
///
/// Instances sharing a UUID are numbered by ascending service UUID. btleplug
/// reports characteristics as a sorted set, so discovery order is not
/// available.
#[must_use]
pub fn find_characteristic<'a>(
    characteristics: &'a [Characteristic],
    target: &GattTarget,
) -> Option<&'a Characteristic> {
    let mut instances: Vec<&Characteristic> = characteristics
        .iter()
        .filter(|characteristic| characteristic.uuid == target.characteristic)
        .collect();
    instances.sort_by_key(|characteristic| characteristic.service_uuid);
    instances.get(usize::from(target.instance)).copied()
}

/// Descriptor addressed by `target`
#[must_use]
pub fn find_descriptor<'a>(
    characteristics: &'a [Characteristic],
    target: &GattTarget,
) -> Option<&'a Descriptor> {
    let uuid = target.descriptor?;
    find_characteristic(characteristics, target)?
        .descriptors
        .iter()
        .find(|descriptor| descriptor.uuid == uuid)
}

/// Session event for a notification from characteristic `uuid`
#[must_use]
pub fn notification_event(uuid: Uuid, value: Vec<u8>) -> TransportEvent {
    TransportEvent::Notification {
        target: GattTarget::characteristic(uuid),
        payload: Bytes::from(value),
    }
}

/// Connected gadget with its services
///
/// A driver task owns the event side: it feeds completions, notifications and
/// periodic ticks into the [`GadgetSession`] one at a time, and reports the
/// disconnect when the peripheral goes away.
pub struct GadgetConnection {
    peripheral: Peripheral,
    link: Arc<GattLink>,
    session: Arc<Mutex<GadgetSession>>,
    force: ForceConfig,
    driver: JoinHandle<()>,
}

impl GadgetConnection {
    /// Connect to `peripheral` and attach every service `registry` knows
    ///
    /// # Errors
    ///
    /// Returns [`GadgetError::Timeout`] if the connection is not established in
    /// time, [`GadgetError::ConnectionFailed`] if it fails,
    /// [`GadgetError::ServiceNotAvailable`] if the peripheral exposes no known
    /// service, or [`GadgetError::Ble`] for other Bluetooth errors.
    pub async fn open(
        peripheral: Peripheral,
        registry: &ServiceRegistry,
        config: ConnectionConfig,
    ) -> Result<Self> {
        info!("Connecting to gadget {}", peripheral.address());

        if !peripheral.is_connected().await? {
            timeout(
                Duration::from_millis(config.connect_timeout_ms),
                peripheral.connect(),
            )
            .await
            .map_err(|_| GadgetError::Timeout {
                timeout_ms: config.connect_timeout_ms,
            })?
            .map_err(|e| GadgetError::ConnectionFailed(e.to_string()))?;
        }
        peripheral.discover_services().await?;

        let notifications = peripheral.notifications().await?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(BtleTransport::new(peripheral.clone(), events_tx));
        let link = Arc::new(GattLink::new(transport, &config.queue));

        let mut session = GadgetSession::new(link.clone());
        for service in peripheral.services() {
            let Some(service_session) = registry.resolve(&service.uuid) else {
                debug!("Ignoring service {}", service.uuid);
                continue;
            };
            if let Err(e) = session.attach(service_session) {
                warn!("Could not set up service {}: {}", service.uuid, e);
            }
        }

        if session.services().is_empty() {
            if let Err(e) = peripheral.disconnect().await {
                debug!("Disconnect after failed discovery: {}", e);
            }
            return Err(GadgetError::ServiceNotAvailable(
                "no known gadget service".to_string(),
            ));
        }

        info!(
            "Connected to {} with {} service(s)",
            peripheral.address(),
            session.services().len()
        );

        let session = Arc::new(Mutex::new(session));
        let driver = tokio::spawn(drive(
            peripheral.clone(),
            session.clone(),
            events_rx,
            notifications,
            Duration::from_millis(config.tick_interval_ms),
        ));

        Ok(Self {
            peripheral,
            link,
            session,
            force: config.force,
            driver,
        })
    }

    /// Start downloading the device log
    ///
    /// # Errors
    ///
    /// See [`GadgetSession::start_download`].
    pub fn start_download(&self) -> Result<()> {
        self.session.lock().start_download()
    }

    /// Abort a running download
    pub fn cancel_download(&self) -> bool {
        self.session.lock().cancel_download()
    }

    /// State of the logger service
    #[must_use]
    pub fn download_status(&self) -> Option<DownloadStatus> {
        self.session.lock().download_status()
    }

    /// Register a listener
    pub fn subscribe(&self, listener: Arc<dyn GadgetListener>) -> ListenerId {
        self.session.lock().subscribe(listener)
    }

    /// Remove a listener
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.session.lock().unsubscribe(id)
    }

    /// Read a characteristic, bypassing whatever is queued
    ///
    /// # Errors
    ///
    /// See [`force_operation`].
    pub async fn force_read(&self, target: GattTarget) -> Result<Bytes> {
        force_operation(&self.link, Operation::read(target), &self.force).await
    }

    /// Write a characteristic, bypassing whatever is queued
    ///
    /// # Errors
    ///
    /// See [`force_operation`].
    pub async fn force_write(&self, target: GattTarget, value: impl Into<Bytes>) -> Result<()> {
        force_operation(&self.link, Operation::write(target, value), &self.force).await?;
        Ok(())
    }

    /// Session shared with the driver task
    #[must_use]
    pub const fn session(&self) -> &Arc<Mutex<GadgetSession>> {
        &self.session
    }

    /// Check if the gadget is still connected
    pub async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    /// Get device address
    #[must_use]
    pub fn address(&self) -> BDAddr {
        self.peripheral.address()
    }

    /// Disconnect from the gadget
    ///
    /// # Errors
    ///
    /// Returns [`GadgetError::Ble`] if disconnection fails.
    pub async fn disconnect(&self) -> Result<()> {
        self.driver.abort();
        self.session
            .lock()
            .handle_event(TransportEvent::ConnectionChanged(false));
        self.peripheral.disconnect().await?;
        Ok(())
    }
}

impl Drop for GadgetConnection {
    fn drop(&mut self) {
        self.driver.abort();

        let Ok(runtime) = Handle::try_current() else {
            return;
        };
        let peripheral = self.peripheral.clone();
        runtime.spawn(async move {
            if let Err(e) = peripheral.disconnect().await {
                debug!("Disconnect on drop failed: {}", e);
            }
        });
    }
}

async fn drive(
    peripheral: Peripheral,
    session: Arc<Mutex<GadgetSession>>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    mut notifications: NotificationStream,
    tick_interval: Duration,
) {
    let mut ticker = interval(tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            Some(event) = events.recv() => {
                session.lock().handle_event(event);
            }
            notification = notifications.next() => {
                let Some(notification) = notification else {
                    info!("Notification stream closed");
                    break;
                };
                let event = notification_event(notification.uuid, notification.value);
                session.lock().handle_event(event);
            }
            _ = ticker.tick() => {
                if !peripheral.is_connected().await.unwrap_or(false) {
                    warn!("Connection to {} lost", peripheral.address());
                    break;
                }
                session.lock().tick();
            }
        }
    }

    session
        .lock()
        .handle_event(TransportEvent::ConnectionChanged(false));
}
