#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # smartgadget
//!
//! A Rust library for reading Sensirion Smart Gadget sensors over Bluetooth Low
//! Energy: live temperature and humidity readings and the download of the
//! gadget's logged history.
//!
//! Two gadget generations are supported:
//!
//! - **SHT3x Smart Gadget**: the log is addressed by absolute timestamps. The
//!   host writes its clock, reads the oldest and newest sample timestamps and
//!   receives sequence numbered humidity and temperature payloads.
//! - **SHTC1 Smart Humigadget**: the log is a ring buffer addressed by
//!   pointers. Logging is paused during the download and sample timestamps are
//!   derived from the time logging was enabled.
//!
//! ## GATT access
//!
//! A BLE link only tolerates one outstanding GATT request. Every request goes
//! through a [`GattLink`], which queues operations, dispatches one at a time,
//! advances on completion callbacks and drops operations that stall.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use smartgadget::{
//!     ConnectionConfig, GadgetConnection, GadgetListener, Sample, ServiceRegistry,
//! };
//!
//! struct Printer;
//!
//! impl GadgetListener for Printer {
//!     fn on_sample_received(&self, sample: &Sample) {
//!         println!("{sample}");
//!     }
//! }
//!
//! # async fn run(peripheral: btleplug::platform::Peripheral) -> smartgadget::Result<()> {
//! let registry = ServiceRegistry::default();
//! let gadget = GadgetConnection::open(peripheral, &registry, ConnectionConfig::default()).await?;
//!
//! gadget.subscribe(Arc::new(Printer));
//! gadget.start_download()?;
//! # Ok(())
//! # }
//! ```

use uuid::{uuid, Uuid};

/// btleplug transport and connection driver
pub mod ble;
/// Little-endian value codec
///
/// Every value exchanged with a Smart Gadget is least-significant byte first.
/// Decoders take the full payload plus an offset and fail with
/// [`GadgetError::BufferTooShort`] instead of panicking.
pub mod codec;
/// Error types and handling
pub mod error;
/// Forced GATT round trips
pub mod forced;
/// Logged history download
///
/// [`HistoryService`] runs the handshake and streaming for either gadget
/// generation; the generation specific parts live in
/// [`history::dialect`](crate::history::dialect).
pub mod history;
/// Link between services and the GATT transport
pub mod link;
/// Listener registration and fan-out
pub mod listener;
/// Live sensor readings
pub mod live;
/// Single in-flight operation queue
///
/// The queue keeps at most one [`Operation`] in flight, advances on completion
/// callbacks and drops operations whose completion never arrives so the link
/// keeps moving.
pub mod queue;
/// Service lookup by UUID
pub mod registry;
/// Per-connection service routing
pub mod session;
/// Type definitions and data structures
pub mod types;

#[cfg(test)]
mod testing;

// Re-export the main types for convenient usage
pub use ble::{BtleTransport, GadgetConnection};
pub use error::{GadgetError, Result};
pub use forced::force_operation;
pub use history::{DeviceDialect, HistoryService};
pub use link::{GattLink, GattTransport};
pub use listener::{GadgetListener, ListenerId, ListenerSet};
pub use live::LiveService;
pub use queue::OperationQueue;
pub use registry::{ServiceKind, ServiceRegistry};
pub use session::{GadgetSession, ServiceContext, ServiceSession};
pub use types::{
    ClockFields, CompletionEvent, ConnectionConfig, DownloadConfig, DownloadOutcome,
    DownloadPhase, DownloadStatus, ForceConfig, GattStatus, GattTarget, Operation, OperationKind,
    QueueConfig, Sample, SensorUnit, TransportEvent,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Number of records the SHTC1 ring buffer holds
pub const RING_BUFFER_CAPACITY: u32 = 16_384;

/// SHT3x logger service
pub const SHT3X_LOGGER_SERVICE_UUID: Uuid = uuid!("0000f234-b38d-4985-720e-0f993a68ee41");

/// SHT3x host clock, epoch milliseconds as u64 (write)
pub const SHT3X_SYNC_TIME_UUID: Uuid = uuid!("0000f235-b38d-4985-720e-0f993a68ee41");

/// SHT3x timestamp of the oldest logged sample, epoch milliseconds as u64
pub const SHT3X_OLDEST_TIMESTAMP_UUID: Uuid = uuid!("0000f236-b38d-4985-720e-0f993a68ee41");

/// SHT3x timestamp of the newest logged sample, epoch milliseconds as u64
pub const SHT3X_NEWEST_TIMESTAMP_UUID: Uuid = uuid!("0000f237-b38d-4985-720e-0f993a68ee41");

/// SHT3x download trigger; writing `0x01` starts streaming the log
pub const SHT3X_START_LOGGER_DOWNLOAD_UUID: Uuid = uuid!("0000f238-b38d-4985-720e-0f993a68ee41");

/// SHT3x logger interval in milliseconds as u32
pub const SHT3X_LOGGER_INTERVAL_UUID: Uuid = uuid!("0000f239-b38d-4985-720e-0f993a68ee41");

/// SHT3x humidity service
pub const SHT3X_HUMIDITY_SERVICE_UUID: Uuid = uuid!("00001234-b38d-4985-720e-0f993a68ee41");

/// SHT3x humidity characteristic
///
/// Notifies a single float32 while idle and sequence numbered records during a
/// history download.
pub const SHT3X_HUMIDITY_UUID: Uuid = uuid!("00001235-b38d-4985-720e-0f993a68ee41");

/// SHT3x temperature service
pub const SHT3X_TEMPERATURE_SERVICE_UUID: Uuid = uuid!("00002234-b38d-4985-720e-0f993a68ee41");

/// SHT3x temperature characteristic, same payload rules as humidity
pub const SHT3X_TEMPERATURE_UUID: Uuid = uuid!("00002235-b38d-4985-720e-0f993a68ee41");

/// SHTC1 live humidity and temperature service
pub const SHTC1_RHT_SERVICE_UUID: Uuid = uuid!("0000aa20-0000-1000-8000-00805f9b34fb");

/// SHTC1 live reading: i16 temperature and i16 humidity in hundredths
pub const SHTC1_RHT_UUID: Uuid = uuid!("0000aa21-0000-1000-8000-00805f9b34fb");

/// SHTC1 logger service
pub const SHTC1_LOGGER_SERVICE_UUID: Uuid = uuid!("0000fa10-0000-1000-8000-00805f9b34fb");

/// SHTC1 logger interval in seconds as u16
pub const SHTC1_LOGGER_INTERVAL_UUID: Uuid = uuid!("0000fa11-0000-1000-8000-00805f9b34fb");

/// SHTC1 current pointer; writing an index starts streaming from it
pub const SHTC1_CURRENT_POINTER_UUID: Uuid = uuid!("0000fa12-0000-1000-8000-00805f9b34fb");

/// SHTC1 first valid ring buffer index as u32
pub const SHTC1_START_POINTER_UUID: Uuid = uuid!("0000fa13-0000-1000-8000-00805f9b34fb");

/// SHTC1 one past the last valid ring buffer index as u32
pub const SHTC1_END_POINTER_UUID: Uuid = uuid!("0000fa14-0000-1000-8000-00805f9b34fb");

/// SHTC1 streamed log records
pub const SHTC1_LOGGED_DATA_UUID: Uuid = uuid!("0000fa15-0000-1000-8000-00805f9b34fb");

/// SHTC1 user data: epoch seconds at which logging was enabled, as u32
pub const SHTC1_USER_DATA_UUID: Uuid = uuid!("0000fa16-0000-1000-8000-00805f9b34fb");

/// SHTC1 logging on/off flag as u8
pub const SHTC1_LOGGING_ENABLED_UUID: Uuid = uuid!("0000fa17-0000-1000-8000-00805f9b34fb");
