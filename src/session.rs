use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{GadgetError, Result},
    history::HistoryService,
    link::GattLink,
    listener::{GadgetListener, ListenerId, ListenerSet},
    live::LiveService,
    types::{CompletionEvent, DownloadStatus, GattTarget, TransportEvent},
};

/// What a service may touch while handling an event
#[derive(Debug, Clone, Copy)]
pub struct ServiceContext<'a> {
    /// Operation queue of the connection
    pub link: &'a GattLink,
    /// Listeners of the connection
    pub listeners: &'a ListenerSet,
}

/// A service bound to a connection
#[derive(Debug)]
pub enum ServiceSession {
    /// Logger service
    History(HistoryService),
    /// Live readings service
    Live(LiveService),
}

impl ServiceSession {
    /// UUID of the GATT service
    #[must_use]
    pub const fn service_uuid(&self) -> Uuid {
        match self {
            Self::History(history) => history.service_uuid(),
            Self::Live(live) => live.service_uuid(),
        }
    }

    /// The history service, if this is one
    #[must_use]
    pub const fn as_history(&self) -> Option<&HistoryService> {
        match self {
            Self::History(history) => Some(history),
            Self::Live(_) => None,
        }
    }

    fn as_history_mut(&mut self) -> Option<&mut HistoryService> {
        match self {
            Self::History(history) => Some(history),
            Self::Live(_) => None,
        }
    }

    fn is_running_history(&self) -> bool {
        self.as_history().is_some_and(HistoryService::is_running)
    }

    /// Whether `target` belongs to this service
    #[must_use]
    pub fn handles(&self, target: &GattTarget) -> bool {
        match self {
            Self::History(history) => history.handles(target),
            Self::Live(live) => live.handles(target),
        }
    }

    /// Set the service up once it is attached to a connection
    ///
    /// # Errors
    ///
    /// Returns an error if a setup operation could not be queued.
    pub fn on_attached(&mut self, ctx: &ServiceContext<'_>) -> Result<()> {
        match self {
            Self::History(_) => Ok(()),
            Self::Live(live) => live.attach(ctx),
        }
    }

    /// Offer a completion; returns `true` if the service consumed it
    pub fn on_operation_complete(
        &mut self,
        ctx: &ServiceContext<'_>,
        event: &CompletionEvent,
    ) -> bool {
        match self {
            Self::History(history) => history.on_operation_complete(ctx, event),
            Self::Live(live) => live.on_operation_complete(event),
        }
    }

    /// Offer a notification; returns `true` if the service consumed it
    pub fn on_notification(
        &mut self,
        ctx: &ServiceContext<'_>,
        target: &GattTarget,
        payload: &Bytes,
    ) -> bool {
        match self {
            Self::History(history) => history.on_notification(ctx, target, payload),
            Self::Live(live) => live.on_notification(ctx, target, payload),
        }
    }

    /// Periodic housekeeping
    pub fn tick(&mut self, ctx: &ServiceContext<'_>) {
        if let Self::History(history) = self {
            history.tick(ctx);
        }
    }

    /// The connection went away
    pub fn on_disconnected(&mut self, ctx: &ServiceContext<'_>) {
        if let Self::History(history) = self {
            history.on_disconnected(ctx);
        }
    }
}

/// Everything attached to one connected gadget
///
/// Transport events are fed through [`GadgetSession::handle_event`]: the
/// link sees completions first so the next queued operation goes out, then
/// the services get a chance to consume the event. A running history
/// download is offered every event before the other services.
#[derive(Debug)]
pub struct GadgetSession {
    link: Arc<GattLink>,
    listeners: ListenerSet,
    services: Vec<ServiceSession>,
}

impl GadgetSession {
    /// Create a session without services
    #[must_use]
    pub fn new(link: Arc<GattLink>) -> Self {
        Self {
            link,
            listeners: ListenerSet::new(),
            services: Vec::new(),
        }
    }

    /// Operation queue of this session
    #[must_use]
    pub const fn link(&self) -> &Arc<GattLink> {
        &self.link
    }

    /// Services attached so far
    #[must_use]
    pub fn services(&self) -> &[ServiceSession] {
        &self.services
    }

    /// First history service, if any
    #[must_use]
    pub fn history(&self) -> Option<&HistoryService> {
        self.services.iter().find_map(ServiceSession::as_history)
    }

    /// Attach a service and let it subscribe to what it needs
    ///
    /// # Errors
    ///
    /// Returns an error if the service setup could not be queued; the service
    /// stays attached.
    pub fn attach(&mut self, mut service: ServiceSession) -> Result<()> {
        info!("Attaching service {}", service.service_uuid());
        let ctx = ServiceContext {
            link: self.link.as_ref(),
            listeners: &self.listeners,
        };
        let result = service.on_attached(&ctx);
        self.services.push(service);
        result
    }

    /// Register a listener
    pub fn subscribe(&mut self, listener: Arc<dyn GadgetListener>) -> ListenerId {
        self.listeners.subscribe(listener)
    }

    /// Remove a listener
    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        self.listeners.unsubscribe(id)
    }

    /// Start downloading the history of the first logger service
    ///
    /// # Errors
    ///
    /// Returns [`GadgetError::ServiceNotAvailable`] without a logger service,
    /// otherwise whatever [`HistoryService::start_download`] reports.
    pub fn start_download(&mut self) -> Result<()> {
        let ctx = ServiceContext {
            link: self.link.as_ref(),
            listeners: &self.listeners,
        };
        let history = self
            .services
            .iter_mut()
            .find_map(ServiceSession::as_history_mut)
            .ok_or_else(|| GadgetError::ServiceNotAvailable("logger".to_string()))?;
        history.start_download(&ctx)
    }

    /// Abort a running download
    pub fn cancel_download(&mut self) -> bool {
        let ctx = ServiceContext {
            link: self.link.as_ref(),
            listeners: &self.listeners,
        };
        self.services
            .iter_mut()
            .filter_map(ServiceSession::as_history_mut)
            .any(|history| history.cancel_download(&ctx))
    }

    /// State of the first logger service
    #[must_use]
    pub fn download_status(&self) -> Option<DownloadStatus> {
        self.history().map(HistoryService::status)
    }

    /// Route one transport event
    pub fn handle_event(&mut self, event: TransportEvent) {
        let ctx = ServiceContext {
            link: self.link.as_ref(),
            listeners: &self.listeners,
        };

        match event {
            TransportEvent::Completed(completion) => {
                let report = self.link.on_operation_complete(&completion);
                if report.purged > 0 {
                    warn!("Transport failure purged {} operation(s)", report.purged);
                }
                let consumed = route(&mut self.services, |service| {
                    service.on_operation_complete(&ctx, &completion)
                });
                if !consumed {
                    debug!("Completion for {} not claimed by any service", completion.target);
                }
            }
            TransportEvent::Notification { target, payload } => {
                let consumed = route(&mut self.services, |service| {
                    service.on_notification(&ctx, &target, &payload)
                });
                if !consumed {
                    debug!("Notification from {} not claimed by any service", target);
                }
            }
            TransportEvent::ConnectionChanged(true) => self.link.on_connected(),
            TransportEvent::ConnectionChanged(false) => {
                let dropped = self.link.on_disconnected();
                if dropped > 0 {
                    debug!("Dropped {} queued operation(s) on disconnect", dropped);
                }
                for service in &mut self.services {
                    service.on_disconnected(&ctx);
                }
            }
        }
    }

    /// Drive stall detection and download watchdogs
    pub fn tick(&mut self) {
        let report = self.link.tick();
        if let Some(stalled) = report.stalled {
            warn!("Dropped stalled operation {}", stalled);
        }

        let ctx = ServiceContext {
            link: self.link.as_ref(),
            listeners: &self.listeners,
        };
        for service in &mut self.services {
            service.tick(&ctx);
        }
    }
}

/// Offer an event to running downloads first, then to every service in
/// attach order until one claims it
fn route(
    services: &mut [ServiceSession],
    mut deliver: impl FnMut(&mut ServiceSession) -> bool,
) -> bool {
    for service in services.iter_mut() {
        if service.is_running_history() && deliver(service) {
            return true;
        }
    }
    services.iter_mut().any(deliver)
}
