use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use uuid::Uuid;

/// Address of a characteristic (or one of its descriptors) on the peripheral
///
/// `instance` disambiguates characteristics that share a UUID; it is the
/// zero-based position among the characteristics with that UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GattTarget {
    /// Characteristic UUID
    pub characteristic: Uuid,
    /// Descriptor UUID for descriptor operations
    pub descriptor: Option<Uuid>,
    /// Instance index among same-UUID characteristics
    pub instance: u16,
}

impl GattTarget {
    /// Target the first characteristic with this UUID
    #[must_use]
    pub const fn characteristic(uuid: Uuid) -> Self {
        Self {
            characteristic: uuid,
            descriptor: None,
            instance: 0,
        }
    }

    /// Target a descriptor of this characteristic
    #[must_use]
    pub const fn descriptor(self, uuid: Uuid) -> Self {
        Self {
            descriptor: Some(uuid),
            ..self
        }
    }

    /// Select another instance of the characteristic
    #[must_use]
    pub const fn with_instance(self, instance: u16) -> Self {
        Self { instance, ..self }
    }

    /// The characteristic this target lives on, without descriptor
    #[must_use]
    pub const fn owning_characteristic(&self) -> Self {
        Self {
            descriptor: None,
            ..*self
        }
    }
}

impl fmt::Display for GattTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.characteristic)?;
        if self.instance > 0 {
            write!(f, "#{}", self.instance)?;
        }
        if let Some(descriptor) = self.descriptor {
            write!(f, "/{descriptor}")?;
        }
        Ok(())
    }
}

/// What an [`Operation`] does to its target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationKind {
    /// Read a characteristic value
    ReadCharacteristic,
    /// Write a characteristic value (with response)
    WriteCharacteristic(Bytes),
    /// Read a descriptor value
    ReadDescriptor,
    /// Write a descriptor value
    WriteDescriptor(Bytes),
    /// Enable or disable notifications on a characteristic
    SetNotification(bool),
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadCharacteristic => write!(f, "read"),
            Self::WriteCharacteristic(value) => write!(f, "write[{}]", value.len()),
            Self::ReadDescriptor => write!(f, "read-descriptor"),
            Self::WriteDescriptor(value) => write!(f, "write-descriptor[{}]", value.len()),
            Self::SetNotification(true) => write!(f, "notify-on"),
            Self::SetNotification(false) => write!(f, "notify-off"),
        }
    }
}

/// A queued GATT request, immutable once built
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    kind: OperationKind,
    target: GattTarget,
}

impl Operation {
    /// Read the characteristic at `target`
    #[must_use]
    pub const fn read(target: GattTarget) -> Self {
        Self {
            kind: OperationKind::ReadCharacteristic,
            target,
        }
    }

    /// Write `value` to the characteristic at `target`
    #[must_use]
    pub fn write(target: GattTarget, value: impl Into<Bytes>) -> Self {
        Self {
            kind: OperationKind::WriteCharacteristic(value.into()),
            target,
        }
    }

    /// Read the descriptor at `target`
    #[must_use]
    pub const fn read_descriptor(target: GattTarget) -> Self {
        Self {
            kind: OperationKind::ReadDescriptor,
            target,
        }
    }

    /// Write `value` to the descriptor at `target`
    #[must_use]
    pub fn write_descriptor(target: GattTarget, value: impl Into<Bytes>) -> Self {
        Self {
            kind: OperationKind::WriteDescriptor(value.into()),
            target,
        }
    }

    /// Enable or disable notifications for `target`
    #[must_use]
    pub const fn set_notification(target: GattTarget, enable: bool) -> Self {
        Self {
            kind: OperationKind::SetNotification(enable),
            target,
        }
    }

    /// Operation kind
    #[must_use]
    pub const fn kind(&self) -> &OperationKind {
        &self.kind
    }

    /// Operation target
    #[must_use]
    pub const fn target(&self) -> &GattTarget {
        &self.target
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.target)
    }
}

/// Outcome reported by the transport for a completed operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattStatus {
    /// Operation succeeded
    Success,
    /// Operation failed with a stack specific status code
    Failure(u8),
}

impl GattStatus {
    /// Check for success
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Completion callback payload delivered by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionEvent {
    /// Target of the completed operation
    pub target: GattTarget,
    /// Completion status
    pub status: GattStatus,
    /// Value read, or the value written for writes
    pub payload: Bytes,
}

impl CompletionEvent {
    /// Successful completion carrying `payload`
    #[must_use]
    pub fn success(target: GattTarget, payload: impl Into<Bytes>) -> Self {
        Self {
            target,
            status: GattStatus::Success,
            payload: payload.into(),
        }
    }

    /// Failed completion
    #[must_use]
    pub const fn failure(target: GattTarget, code: u8) -> Self {
        Self {
            target,
            status: GattStatus::Failure(code),
            payload: Bytes::new(),
        }
    }
}

/// Everything the transport callback can deliver to a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A submitted operation finished
    Completed(CompletionEvent),
    /// The peripheral pushed a notification
    Notification {
        /// Characteristic that notified
        target: GattTarget,
        /// Notified value
        payload: Bytes,
    },
    /// Connection state changed
    ConnectionChanged(bool),
}

/// Physical unit of a [`Sample`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SensorUnit {
    /// Degrees Celsius
    Celsius,
    /// Percent relative humidity
    RelativeHumidity,
}

impl fmt::Display for SensorUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Celsius => write!(f, "°C"),
            Self::RelativeHumidity => write!(f, "%RH"),
        }
    }
}

/// A decoded sensor reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Reading value
    pub value: f32,
    /// Unit of `value`
    pub unit: SensorUnit,
    /// Absolute time in milliseconds since the Unix epoch
    pub timestamp_ms: u64,
    /// Sensor channel name
    pub channel: String,
}

impl Sample {
    /// Build a sample
    #[must_use]
    pub fn new(value: f32, unit: SensorUnit, timestamp_ms: u64, channel: impl Into<String>) -> Self {
        Self {
            value,
            unit,
            timestamp_ms,
            channel: channel.into(),
        }
    }

    /// Timestamp as [`SystemTime`]
    #[must_use]
    pub fn system_time(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.timestamp_ms)
    }
}

impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:.2}{} @{}",
            self.channel, self.value, self.unit, self.timestamp_ms
        )
    }
}

/// Current wall clock in milliseconds since the Unix epoch
#[must_use]
pub fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| {
            u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
        })
}

/// Phase of a history download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DownloadPhase {
    /// No download running
    Idle,
    /// Download accepted, handshake not yet issued
    Init,
    /// Reading whether device-side logging is enabled
    ReadLoggingState,
    /// Turning device-side logging off for the download
    DisableLogging,
    /// Writing the host clock to the device
    SyncClock,
    /// Reading the epoch at which logging was enabled
    ReadUserData,
    /// Reading the logger interval
    ReadInterval,
    /// Reading the oldest sample timestamp
    ReadOldest,
    /// Reading the newest sample timestamp
    ReadNewest,
    /// Reading the ring buffer start pointer
    ReadStartPointer,
    /// Reading the ring buffer end pointer
    ReadEndPointer,
    /// Enabling notifications on a streamed channel
    Subscribe(u8),
    /// Asking the device to start streaming
    TriggerDownload,
    /// Receiving streamed samples
    Running,
}

impl fmt::Display for DownloadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Subscribe(channel) => write!(f, "Subscribe({channel})"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// Terminal result of a history download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadOutcome {
    /// All expected samples (or enough of them) were received
    Complete,
    /// Download aborted
    Failed,
    /// Device has no logged samples
    NoData,
}

impl fmt::Display for DownloadOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Complete => write!(f, "Complete"),
            Self::Failed => write!(f, "Failed"),
            Self::NoData => write!(f, "No Data"),
        }
    }
}

/// Session clock fields, each unknown until read from the device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockFields {
    /// Oldest logged sample, milliseconds since the Unix epoch
    pub oldest_timestamp_ms: Option<u64>,
    /// Newest logged sample, milliseconds since the Unix epoch
    pub newest_timestamp_ms: Option<u64>,
    /// Logger interval in milliseconds
    pub logger_interval_ms: Option<u64>,
    /// Epoch seconds at which logging was enabled (ring buffer devices)
    pub logging_enabled_epoch_s: Option<u64>,
    /// First ring buffer index to download (ring buffer devices)
    pub start_pointer: Option<u32>,
    /// One past the last ring buffer index (ring buffer devices)
    pub end_pointer: Option<u32>,
}

/// Snapshot of the history download state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadStatus {
    /// Current phase
    pub phase: DownloadPhase,
    /// Samples received so far
    pub samples_downloaded: u32,
    /// Samples the device announced
    pub samples_expected: u32,
    /// Last reported progress in percent
    pub progress: u8,
    /// Payloads rejected as malformed
    pub malformed_payloads: u32,
    /// Outcome of the most recent finished download
    pub last_outcome: Option<DownloadOutcome>,
}

/// Operation queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Time an operation may stay in flight before it is dropped
    pub stall_threshold_ms: u64,
}

impl QueueConfig {
    /// Stall threshold as a [`Duration`]
    #[must_use]
    pub const fn stall_threshold(&self) -> Duration {
        Duration::from_millis(self.stall_threshold_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            stall_threshold_ms: 1_500,
        }
    }
}

/// History download configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Maximum silence while streaming before the download is ended
    pub watchdog_ms: u64,
    /// Maximum wait for a single handshake step
    pub handshake_timeout_ms: u64,
    /// Fraction of expected samples that counts as a complete download
    pub completion_threshold: f32,
}

impl DownloadConfig {
    /// Streaming watchdog as a [`Duration`]
    #[must_use]
    pub const fn watchdog(&self) -> Duration {
        Duration::from_millis(self.watchdog_ms)
    }

    /// Handshake timeout as a [`Duration`]
    #[must_use]
    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            watchdog_ms: 3_000,
            handshake_timeout_ms: 5_000,
            completion_threshold: 0.95,
        }
    }
}

/// Forced round trip configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForceConfig {
    /// Time to wait for confirmation of one attempt
    pub per_attempt_timeout_ms: u64,
    /// Number of submissions before giving up
    pub max_attempts: u32,
    /// Completion marker polling interval
    pub poll_interval_ms: u64,
}

impl ForceConfig {
    /// Per attempt timeout as a [`Duration`]
    #[must_use]
    pub const fn per_attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.per_attempt_timeout_ms)
    }

    /// Poll interval as a [`Duration`]
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for ForceConfig {
    fn default() -> Self {
        Self {
            per_attempt_timeout_ms: 1_000,
            max_attempts: 3,
            poll_interval_ms: 10,
        }
    }
}

/// Connection parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Interval of the stall / watchdog tick in milliseconds
    pub tick_interval_ms: u64,
    /// Operation queue settings
    pub queue: QueueConfig,
    /// Forced round trip settings
    pub force: ForceConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 30_000,
            tick_interval_ms: 250,
            queue: QueueConfig::default(),
            force: ForceConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HUMIDITY: Uuid = Uuid::from_u128(0x0000_1235_b38d_4985_720e_0f99_3a68_ee41);

    #[test]
    fn test_target_builders() {
        let cccd = Uuid::from_u128(0x0000_2902_0000_1000_8000_0080_5f9b_34fb);
        let target = GattTarget::characteristic(HUMIDITY)
            .with_instance(1)
            .descriptor(cccd);

        assert_eq!(target.instance, 1);
        assert_eq!(target.descriptor, Some(cccd));
        assert_eq!(
            target.owning_characteristic(),
            GattTarget::characteristic(HUMIDITY).with_instance(1)
        );
        assert!(target.to_string().contains("#1/"));
    }

    #[test]
    fn test_operation_accessors() {
        let target = GattTarget::characteristic(HUMIDITY);
        let op = Operation::write(target, vec![0x01_u8]);

        assert_eq!(op.target(), &target);
        assert_eq!(
            op.kind(),
            &OperationKind::WriteCharacteristic(Bytes::from_static(&[0x01]))
        );
        assert_eq!(Operation::read(target).kind(), &OperationKind::ReadCharacteristic);
    }

    #[test]
    fn test_sample_system_time() {
        let sample = Sample::new(21.5, SensorUnit::Celsius, 1_014_000, "temperature");
        assert_eq!(
            sample.system_time(),
            UNIX_EPOCH + Duration::from_millis(1_014_000)
        );
        assert_eq!(sample.to_string(), "temperature 21.50°C @1014000");
    }

    #[test]
    fn test_config_defaults() {
        let config = ConnectionConfig::default();

        assert_eq!(config.connect_timeout_ms, 30_000);
        assert_eq!(config.tick_interval_ms, 250);
        assert_eq!(config.queue.stall_threshold(), Duration::from_millis(1_500));
        let download = DownloadConfig::default();
        assert_eq!(download.watchdog(), Duration::from_secs(3));
        assert_eq!(download.handshake_timeout(), Duration::from_secs(5));
        assert!((download.completion_threshold - 0.95).abs() < f32::EPSILON);
        assert_eq!(config.force.max_attempts, 3);
        assert_eq!(config.force.per_attempt_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(DownloadPhase::Running.to_string(), "Running");
        assert_eq!(DownloadPhase::Subscribe(1).to_string(), "Subscribe(1)");
    }
}
