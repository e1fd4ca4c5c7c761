use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

use crate::{
    history::{DeviceDialect, HistoryService},
    live::LiveService,
    session::ServiceSession,
    types::DownloadConfig,
    SHT3X_HUMIDITY_SERVICE_UUID, SHT3X_LOGGER_SERVICE_UUID, SHT3X_TEMPERATURE_SERVICE_UUID,
    SHTC1_LOGGER_SERVICE_UUID, SHTC1_RHT_SERVICE_UUID,
};

/// Known gadget services
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    /// SHT3x timestamped logger
    Sht3xLogger,
    /// SHT3x live humidity
    Sht3xHumidity,
    /// SHT3x live temperature
    Sht3xTemperature,
    /// SHTC1 ring buffer logger
    Shtc1Logger,
    /// SHTC1 live humidity and temperature
    Shtc1Rht,
}

impl ServiceKind {
    /// Every known kind
    pub const ALL: [Self; 5] = [
        Self::Sht3xLogger,
        Self::Sht3xHumidity,
        Self::Sht3xTemperature,
        Self::Shtc1Logger,
        Self::Shtc1Rht,
    ];

    /// GATT service UUID of this kind
    #[must_use]
    pub const fn service_uuid(self) -> Uuid {
        match self {
            Self::Sht3xLogger => SHT3X_LOGGER_SERVICE_UUID,
            Self::Sht3xHumidity => SHT3X_HUMIDITY_SERVICE_UUID,
            Self::Sht3xTemperature => SHT3X_TEMPERATURE_SERVICE_UUID,
            Self::Shtc1Logger => SHTC1_LOGGER_SERVICE_UUID,
            Self::Shtc1Rht => SHTC1_RHT_SERVICE_UUID,
        }
    }

    /// Kind for a service UUID
    #[must_use]
    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.service_uuid() == uuid)
    }

    /// Build a fresh service of this kind
    #[must_use]
    pub fn create(self, download: &DownloadConfig) -> ServiceSession {
        match self {
            Self::Sht3xLogger => ServiceSession::History(HistoryService::new(
                DeviceDialect::timestamped(),
                download.clone(),
            )),
            Self::Shtc1Logger => ServiceSession::History(HistoryService::new(
                DeviceDialect::ring_buffer(),
                download.clone(),
            )),
            Self::Sht3xHumidity => ServiceSession::Live(LiveService::sht3x_humidity()),
            Self::Sht3xTemperature => ServiceSession::Live(LiveService::sht3x_temperature()),
            Self::Shtc1Rht => ServiceSession::Live(LiveService::shtc1_rht()),
        }
    }
}

/// Maps discovered service UUIDs to service implementations
///
/// A registry is built by the caller and handed to
/// [`GadgetConnection::open`](crate::ble::GadgetConnection::open); there is
/// no process wide instance.
#[derive(Debug, Clone)]
pub struct ServiceRegistry {
    kinds: HashMap<Uuid, ServiceKind>,
    download: DownloadConfig,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::with_download_config(DownloadConfig::default())
    }
}

impl ServiceRegistry {
    /// Registry without any service
    #[must_use]
    pub fn empty(download: DownloadConfig) -> Self {
        Self {
            kinds: HashMap::new(),
            download,
        }
    }

    /// Registry of every known service using `download` for loggers
    #[must_use]
    pub fn with_download_config(download: DownloadConfig) -> Self {
        let mut registry = Self::empty(download);
        for kind in ServiceKind::ALL {
            registry.register(kind);
        }
        registry
    }

    /// Add a service kind
    pub fn register(&mut self, kind: ServiceKind) -> &mut Self {
        self.kinds.insert(kind.service_uuid(), kind);
        self
    }

    /// Whether a service UUID is known
    #[must_use]
    pub fn contains(&self, uuid: &Uuid) -> bool {
        self.kinds.contains_key(uuid)
    }

    /// Create the service for a discovered UUID
    #[must_use]
    pub fn resolve(&self, uuid: &Uuid) -> Option<ServiceSession> {
        let kind = self.kinds.get(uuid)?;
        debug!("Service {} resolved as {:?}", uuid, kind);
        Some(kind.create(&self.download))
    }
}
