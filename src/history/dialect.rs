use bytes::Bytes;
use uuid::Uuid;

use crate::{
    codec,
    error::{GadgetError, Result},
    types::{ClockFields, DownloadPhase, GattTarget, Operation, Sample, SensorUnit},
    RING_BUFFER_CAPACITY, SHT3X_HUMIDITY_UUID, SHT3X_LOGGER_INTERVAL_UUID,
    SHT3X_LOGGER_SERVICE_UUID, SHT3X_NEWEST_TIMESTAMP_UUID, SHT3X_OLDEST_TIMESTAMP_UUID,
    SHT3X_START_LOGGER_DOWNLOAD_UUID, SHT3X_SYNC_TIME_UUID, SHT3X_TEMPERATURE_UUID,
    SHTC1_CURRENT_POINTER_UUID, SHTC1_END_POINTER_UUID, SHTC1_LOGGED_DATA_UUID,
    SHTC1_LOGGER_INTERVAL_UUID, SHTC1_LOGGER_SERVICE_UUID, SHTC1_LOGGING_ENABLED_UUID,
    SHTC1_START_POINTER_UUID, SHTC1_USER_DATA_UUID,
};

/// Size of one streamed record in bytes
pub const RECORD_SIZE: usize = 4;

/// Size of the sequence number header of timestamped payloads
pub const SEQUENCE_HEADER_SIZE: usize = 4;

/// How the logger interval characteristic is encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalFormat {
    /// Unsigned 16-bit seconds
    U16Seconds,
    /// Unsigned 32-bit milliseconds
    U32Millis,
}

/// How samples are addressed on the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Addressing {
    /// Samples live in a circular buffer addressed by pointers
    RingBuffer {
        /// Logging on/off flag (u8)
        logging_enabled: GattTarget,
        /// Epoch seconds at which logging was enabled (u32)
        user_data: GattTarget,
        /// First valid index (u32)
        start_pointer: GattTarget,
        /// One past the last valid index (u32)
        end_pointer: GattTarget,
        /// Writing an index here starts streaming from it (u32)
        current_pointer: GattTarget,
        /// Number of records the buffer holds
        capacity: u32,
    },
    /// Samples are addressed by absolute timestamps
    Timestamped {
        /// Host clock in epoch milliseconds (u64, write)
        sync_time: GattTarget,
        /// Oldest sample timestamp (u64)
        oldest: GattTarget,
        /// Newest sample timestamp (u64)
        newest: GattTarget,
        /// Writing `0x01` starts streaming
        start_download: GattTarget,
    },
}

/// Payload format of a streamed channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordLayout {
    /// Records of i16 temperature and i16 humidity in hundredths
    FixedPointPair,
    /// u32 sequence number followed by float32 values of `unit`
    SequencedFloat(SensorUnit),
}

/// A characteristic that carries history records
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamChannel {
    /// Notifying characteristic
    pub target: GattTarget,
    /// Channel name used for produced samples
    pub name: &'static str,
    /// Payload format
    pub layout: RecordLayout,
}

/// Parameters of one gadget generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDialect {
    /// Human readable family name
    pub name: &'static str,
    /// Logger service UUID
    pub service_uuid: Uuid,
    /// Logger interval characteristic
    pub interval: GattTarget,
    /// Logger interval encoding
    pub interval_format: IntervalFormat,
    /// Sample addressing scheme
    pub addressing: Addressing,
    /// Streamed channels
    pub channels: Vec<StreamChannel>,
}

/// Records decoded from one payload
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPayload {
    /// Number of records in the payload
    pub records: u32,
    /// Samples produced, in payload order
    pub samples: Vec<Sample>,
}

impl DeviceDialect {
    /// SHTC1 Smart Humigadget: pointer addressed ring buffer
    #[must_use]
    pub fn ring_buffer() -> Self {
        Self {
            name: "SHTC1 Smart Humigadget",
            service_uuid: SHTC1_LOGGER_SERVICE_UUID,
            interval: GattTarget::characteristic(SHTC1_LOGGER_INTERVAL_UUID),
            interval_format: IntervalFormat::U16Seconds,
            addressing: Addressing::RingBuffer {
                logging_enabled: GattTarget::characteristic(SHTC1_LOGGING_ENABLED_UUID),
                user_data: GattTarget::characteristic(SHTC1_USER_DATA_UUID),
                start_pointer: GattTarget::characteristic(SHTC1_START_POINTER_UUID),
                end_pointer: GattTarget::characteristic(SHTC1_END_POINTER_UUID),
                current_pointer: GattTarget::characteristic(SHTC1_CURRENT_POINTER_UUID),
                capacity: RING_BUFFER_CAPACITY,
            },
            channels: vec![StreamChannel {
                target: GattTarget::characteristic(SHTC1_LOGGED_DATA_UUID),
                name: "rht",
                layout: RecordLayout::FixedPointPair,
            }],
        }
    }

    /// SHT3x Smart Gadget: timestamp addressed log
    #[must_use]
    pub fn timestamped() -> Self {
        Self {
            name: "SHT3x Smart Gadget",
            service_uuid: SHT3X_LOGGER_SERVICE_UUID,
            interval: GattTarget::characteristic(SHT3X_LOGGER_INTERVAL_UUID),
            interval_format: IntervalFormat::U32Millis,
            addressing: Addressing::Timestamped {
                sync_time: GattTarget::characteristic(SHT3X_SYNC_TIME_UUID),
                oldest: GattTarget::characteristic(SHT3X_OLDEST_TIMESTAMP_UUID),
                newest: GattTarget::characteristic(SHT3X_NEWEST_TIMESTAMP_UUID),
                start_download: GattTarget::characteristic(SHT3X_START_LOGGER_DOWNLOAD_UUID),
            },
            channels: vec![
                StreamChannel {
                    target: GattTarget::characteristic(SHT3X_HUMIDITY_UUID),
                    name: "humidity",
                    layout: RecordLayout::SequencedFloat(SensorUnit::RelativeHumidity),
                },
                StreamChannel {
                    target: GattTarget::characteristic(SHT3X_TEMPERATURE_UUID),
                    name: "temperature",
                    layout: RecordLayout::SequencedFloat(SensorUnit::Celsius),
                },
            ],
        }
    }

    /// Handshake phases in issue order, `Running` excluded
    #[must_use]
    pub fn handshake(&self) -> Vec<DownloadPhase> {
        let mut phases = match self.addressing {
            Addressing::RingBuffer { .. } => vec![
                DownloadPhase::ReadLoggingState,
                DownloadPhase::DisableLogging,
                DownloadPhase::ReadUserData,
                DownloadPhase::ReadInterval,
                DownloadPhase::ReadStartPointer,
                DownloadPhase::ReadEndPointer,
            ],
            Addressing::Timestamped { .. } => vec![
                DownloadPhase::SyncClock,
                DownloadPhase::ReadInterval,
                DownloadPhase::ReadOldest,
                DownloadPhase::ReadNewest,
            ],
        };
        phases.extend((0..self.channels.len()).filter_map(|index| {
            u8::try_from(index).ok().map(DownloadPhase::Subscribe)
        }));
        phases.push(DownloadPhase::TriggerDownload);
        phases
    }

    /// Whether `target` is one of this dialect's characteristics
    #[must_use]
    pub fn owns(&self, target: &GattTarget) -> bool {
        let target = target.owning_characteristic();
        if target == self.interval || self.channel_index(&target).is_some() {
            return true;
        }
        match &self.addressing {
            Addressing::RingBuffer {
                logging_enabled,
                user_data,
                start_pointer,
                end_pointer,
                current_pointer,
                ..
            } => [
                logging_enabled,
                user_data,
                start_pointer,
                end_pointer,
                current_pointer,
            ]
            .contains(&&target),
            Addressing::Timestamped {
                sync_time,
                oldest,
                newest,
                start_download,
            } => [sync_time, oldest, newest, start_download].contains(&&target),
        }
    }

    /// Index of the streamed channel notifying on `target`
    #[must_use]
    pub fn channel_index(&self, target: &GattTarget) -> Option<usize> {
        self.channels
            .iter()
            .position(|channel| channel.target == *target)
    }

    /// Operation to issue for a handshake phase
    ///
    /// # Errors
    ///
    /// Returns [`GadgetError::Protocol`] when the phase does not exist in this
    /// dialect or depends on a clock field that has not been read yet.
    pub fn operation_for(
        &self,
        phase: DownloadPhase,
        clock: &ClockFields,
        now_ms: u64,
    ) -> Result<Operation> {
        let unsupported = || {
            GadgetError::Protocol(format!("{} has no {} phase", self.name, phase))
        };

        match (phase, &self.addressing) {
            (DownloadPhase::ReadInterval, _) => Ok(Operation::read(self.interval)),
            (DownloadPhase::Subscribe(index), _) => self
                .channels
                .get(usize::from(index))
                .map(|channel| Operation::set_notification(channel.target, true))
                .ok_or_else(unsupported),
            (DownloadPhase::ReadLoggingState, Addressing::RingBuffer { logging_enabled, .. }) => {
                Ok(Operation::read(*logging_enabled))
            }
            (DownloadPhase::DisableLogging, Addressing::RingBuffer { logging_enabled, .. }) => {
                Ok(Operation::write(*logging_enabled, Bytes::from_static(&[0x00])))
            }
            (DownloadPhase::ReadUserData, Addressing::RingBuffer { user_data, .. }) => {
                Ok(Operation::read(*user_data))
            }
            (DownloadPhase::ReadStartPointer, Addressing::RingBuffer { start_pointer, .. }) => {
                Ok(Operation::read(*start_pointer))
            }
            (DownloadPhase::ReadEndPointer, Addressing::RingBuffer { end_pointer, .. }) => {
                Ok(Operation::read(*end_pointer))
            }
            (DownloadPhase::TriggerDownload, Addressing::RingBuffer { current_pointer, .. }) => {
                let start = clock.start_pointer.ok_or_else(|| {
                    GadgetError::Protocol("start pointer unknown".to_string())
                })?;
                Ok(Operation::write(*current_pointer, codec::encode_u32_le(start)))
            }
            (DownloadPhase::SyncClock, Addressing::Timestamped { sync_time, .. }) => {
                Ok(Operation::write(*sync_time, codec::encode_u64_le(now_ms)))
            }
            (DownloadPhase::ReadOldest, Addressing::Timestamped { oldest, .. }) => {
                Ok(Operation::read(*oldest))
            }
            (DownloadPhase::ReadNewest, Addressing::Timestamped { newest, .. }) => {
                Ok(Operation::read(*newest))
            }
            (DownloadPhase::TriggerDownload, Addressing::Timestamped { start_download, .. }) => {
                Ok(Operation::write(*start_download, Bytes::from_static(&[0x01])))
            }
            _ => Err(unsupported()),
        }
    }

    /// Write restoring device-side logging after a download
    #[must_use]
    pub fn restore_logging(&self) -> Option<Operation> {
        match &self.addressing {
            Addressing::RingBuffer {
                logging_enabled, ..
            } => Some(Operation::write(
                *logging_enabled,
                Bytes::from_static(&[0x01]),
            )),
            Addressing::Timestamped { .. } => None,
        }
    }

    /// Store the value read during `phase` into the clock fields
    ///
    /// Returns the logging state for [`DownloadPhase::ReadLoggingState`].
    ///
    /// # Errors
    ///
    /// Returns [`GadgetError::BufferTooShort`] if the value is truncated.
    pub fn apply_read(
        &self,
        phase: DownloadPhase,
        payload: &[u8],
        clock: &mut ClockFields,
    ) -> Result<Option<bool>> {
        match phase {
            DownloadPhase::ReadLoggingState => {
                let enabled = payload.first().ok_or(GadgetError::BufferTooShort {
                    needed: 1,
                    offset: 0,
                    available: 0,
                })?;
                return Ok(Some(*enabled != 0));
            }
            DownloadPhase::ReadUserData => {
                clock.logging_enabled_epoch_s = Some(u64::from(codec::u32_le(payload, 0)?));
            }
            DownloadPhase::ReadInterval => {
                clock.logger_interval_ms = Some(match self.interval_format {
                    IntervalFormat::U16Seconds => u64::from(codec::u16_le(payload, 0)?) * 1000,
                    IntervalFormat::U32Millis => u64::from(codec::u32_le(payload, 0)?),
                });
            }
            DownloadPhase::ReadOldest => clock.oldest_timestamp_ms = Some(codec::u64_le(payload, 0)?),
            DownloadPhase::ReadNewest => clock.newest_timestamp_ms = Some(codec::u64_le(payload, 0)?),
            DownloadPhase::ReadStartPointer => clock.start_pointer = Some(codec::u32_le(payload, 0)?),
            DownloadPhase::ReadEndPointer => clock.end_pointer = Some(codec::u32_le(payload, 0)?),
            _ => {}
        }
        Ok(None)
    }

    /// Resolve the download bounds and return the number of expected samples
    ///
    /// For ring buffer devices the oldest and newest timestamps are derived from
    /// the pointers, and the start pointer is moved forward when the span
    /// exceeds the buffer capacity.
    ///
    /// # Errors
    ///
    /// Returns [`GadgetError::Protocol`] when a required clock field is unknown.
    pub fn resolve_bounds(&self, clock: &mut ClockFields) -> Result<u32> {
        let interval = required(clock.logger_interval_ms, "logger interval")?;

        match self.addressing {
            Addressing::RingBuffer { capacity, .. } => {
                let epoch_s = required(clock.logging_enabled_epoch_s, "logging enable time")?;
                let end = required(clock.end_pointer, "end pointer")?;
                let mut start = required(clock.start_pointer, "start pointer")?.min(end);
                if end - start > capacity {
                    start = end - capacity;
                    clock.start_pointer = Some(start);
                }
                clock.oldest_timestamp_ms = Some(
                    ring_buffer_timestamp(epoch_s, start, 0, interval)
                        .ok_or_else(timestamp_out_of_range)?,
                );
                clock.newest_timestamp_ms = Some(
                    ring_buffer_timestamp(epoch_s, end, 0, interval)
                        .ok_or_else(timestamp_out_of_range)?,
                );
                Ok(expected_samples(
                    required(clock.oldest_timestamp_ms, "oldest timestamp")?,
                    required(clock.newest_timestamp_ms, "newest timestamp")?,
                    interval,
                    Some(capacity),
                ))
            }
            Addressing::Timestamped { .. } => Ok(expected_samples(
                required(clock.oldest_timestamp_ms, "oldest timestamp")?,
                required(clock.newest_timestamp_ms, "newest timestamp")?,
                interval,
                None,
            )),
        }
    }

    /// Decode one streamed payload
    ///
    /// `already_downloaded` is the number of records of this channel received
    /// before this payload; at most `limit` records are turned into samples.
    ///
    /// # Errors
    ///
    /// Returns [`GadgetError::ParseError`] when the payload length is not a
    /// whole number of records, or a clock field is missing.
    pub fn decode(
        &self,
        channel: &StreamChannel,
        payload: &[u8],
        clock: &ClockFields,
        already_downloaded: u32,
        limit: u32,
    ) -> Result<DecodedPayload> {
        let interval = required(clock.logger_interval_ms, "logger interval")?;

        match channel.layout {
            RecordLayout::FixedPointPair => {
                if payload.is_empty() || payload.len() % RECORD_SIZE != 0 {
                    return Err(GadgetError::ParseError(format!(
                        "{} byte payload is not a multiple of {RECORD_SIZE}",
                        payload.len()
                    )));
                }
                let epoch_s = required(clock.logging_enabled_epoch_s, "logging enable time")?;
                let start = required(clock.start_pointer, "start pointer")?;

                let records = count(payload.len() / RECORD_SIZE);
                let mut samples = Vec::new();
                for record in 0..records.min(limit) {
                    let offset = record as usize * RECORD_SIZE;
                    let timestamp = ring_buffer_timestamp(
                        epoch_s,
                        start,
                        already_downloaded + record,
                        interval,
                    )
                    .ok_or_else(timestamp_out_of_range)?;
                    let temperature = f32::from(codec::i16_le(payload, offset)?) / 100.0;
                    let humidity = f32::from(codec::i16_le(payload, offset + 2)?) / 100.0;
                    samples.push(Sample::new(
                        temperature,
                        SensorUnit::Celsius,
                        timestamp,
                        "temperature",
                    ));
                    samples.push(Sample::new(
                        humidity,
                        SensorUnit::RelativeHumidity,
                        timestamp,
                        "humidity",
                    ));
                }
                Ok(DecodedPayload { records, samples })
            }
            RecordLayout::SequencedFloat(unit) => {
                if payload.len() < SEQUENCE_HEADER_SIZE + RECORD_SIZE
                    || (payload.len() - SEQUENCE_HEADER_SIZE) % RECORD_SIZE != 0
                {
                    return Err(GadgetError::ParseError(format!(
                        "{} byte payload is not a sequence number plus whole records",
                        payload.len()
                    )));
                }
                let newest = required(clock.newest_timestamp_ms, "newest timestamp")?;
                let sequence = codec::u32_le(payload, 0)?;

                let records = count((payload.len() - SEQUENCE_HEADER_SIZE) / RECORD_SIZE);
                let mut samples = Vec::new();
                for record in 0..records.min(limit) {
                    let offset = SEQUENCE_HEADER_SIZE + record as usize * RECORD_SIZE;
                    let timestamp = sequenced_timestamp(newest, interval, sequence, record)
                        .ok_or_else(timestamp_out_of_range)?;
                    samples.push(Sample::new(
                        codec::f32_le(payload, offset)?,
                        unit,
                        timestamp,
                        channel.name,
                    ));
                }
                Ok(DecodedPayload { records, samples })
            }
        }
    }
}

fn required<T>(value: Option<T>, what: &str) -> Result<T> {
    value.ok_or_else(|| GadgetError::Protocol(format!("{what} unknown")))
}

fn timestamp_out_of_range() -> GadgetError {
    GadgetError::ParseError("record timestamp out of range".to_string())
}

fn count(records: usize) -> u32 {
    u32::try_from(records).unwrap_or(u32::MAX)
}

/// Number of samples between two timestamps, clamped to `capacity`
#[must_use]
pub fn expected_samples(
    oldest_ms: u64,
    newest_ms: u64,
    interval_ms: u64,
    capacity: Option<u32>,
) -> u32 {
    if interval_ms == 0 {
        return 0;
    }
    let samples = newest_ms.saturating_sub(oldest_ms) / interval_ms;
    let samples = u32::try_from(samples).unwrap_or(u32::MAX);
    capacity.map_or(samples, |capacity| samples.min(capacity))
}

/// Timestamp of a ring buffer record, `None` if it does not fit in a `u64`
///
/// `index` is the zero-based position of the record in the download.
#[must_use]
pub fn ring_buffer_timestamp(
    logging_enabled_epoch_s: u64,
    start_pointer: u32,
    index: u32,
    interval_ms: u64,
) -> Option<u64> {
    let since_enabled =
        (u64::from(start_pointer) + u64::from(index)).checked_mul(interval_ms)?;
    logging_enabled_epoch_s
        .checked_mul(1000)?
        .checked_add(since_enabled)
}

/// Timestamp of a record in a sequence numbered payload
///
/// `offset` is the record's position within its payload. Records older than
/// the epoch clamp to 0; `None` when the distance from `newest_ms` overflows.
#[must_use]
pub fn sequenced_timestamp(
    newest_ms: u64,
    interval_ms: u64,
    sequence: u32,
    offset: u32,
) -> Option<u64> {
    let back = interval_ms.checked_mul(u64::from(offset) + u64::from(sequence))?;
    Some(newest_ms.saturating_sub(back))
}
