use bytes::Bytes;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    codec,
    error::{GadgetError, Result},
    session::ServiceContext,
    types::{now_epoch_ms, CompletionEvent, GattTarget, Operation, Sample, SensorUnit},
    SHT3X_HUMIDITY_SERVICE_UUID, SHT3X_HUMIDITY_UUID, SHT3X_TEMPERATURE_SERVICE_UUID,
    SHT3X_TEMPERATURE_UUID, SHTC1_RHT_SERVICE_UUID, SHTC1_RHT_UUID,
};

/// Encoding of a live reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveLayout {
    /// One float32 value of the given unit
    Float(SensorUnit),
    /// i16 temperature and i16 humidity in hundredths
    FixedPointPair,
}

/// Notifying sensor service producing live samples
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveService {
    service_uuid: Uuid,
    target: GattTarget,
    channel: &'static str,
    layout: LiveLayout,
    subscribed: bool,
}

impl LiveService {
    /// SHT3x humidity service
    #[must_use]
    pub const fn sht3x_humidity() -> Self {
        Self::new(
            SHT3X_HUMIDITY_SERVICE_UUID,
            SHT3X_HUMIDITY_UUID,
            "humidity",
            LiveLayout::Float(SensorUnit::RelativeHumidity),
        )
    }

    /// SHT3x temperature service
    #[must_use]
    pub const fn sht3x_temperature() -> Self {
        Self::new(
            SHT3X_TEMPERATURE_SERVICE_UUID,
            SHT3X_TEMPERATURE_UUID,
            "temperature",
            LiveLayout::Float(SensorUnit::Celsius),
        )
    }

    /// SHTC1 combined humidity and temperature service
    #[must_use]
    pub const fn shtc1_rht() -> Self {
        Self::new(
            SHTC1_RHT_SERVICE_UUID,
            SHTC1_RHT_UUID,
            "rht",
            LiveLayout::FixedPointPair,
        )
    }

    const fn new(
        service_uuid: Uuid,
        characteristic: Uuid,
        channel: &'static str,
        layout: LiveLayout,
    ) -> Self {
        Self {
            service_uuid,
            target: GattTarget::characteristic(characteristic),
            channel,
            layout,
            subscribed: false,
        }
    }

    /// Service UUID
    #[must_use]
    pub const fn service_uuid(&self) -> Uuid {
        self.service_uuid
    }

    /// Notifying characteristic
    #[must_use]
    pub const fn target(&self) -> &GattTarget {
        &self.target
    }

    /// Whether the notification subscription was confirmed
    #[must_use]
    pub const fn is_subscribed(&self) -> bool {
        self.subscribed
    }

    /// Whether `target` belongs to this service
    #[must_use]
    pub fn handles(&self, target: &GattTarget) -> bool {
        target.owning_characteristic() == self.target
    }

    /// Enable notifications for live readings
    ///
    /// # Errors
    ///
    /// Returns an error if the link refused the subscription.
    pub fn attach(&self, ctx: &ServiceContext<'_>) -> Result<()> {
        debug!("Subscribing to live {} readings", self.channel);
        ctx.link
            .submit(Operation::set_notification(self.target, true))
    }

    /// Handle a completion; returns `true` if it was for this service
    pub fn on_operation_complete(&mut self, event: &CompletionEvent) -> bool {
        if !self.handles(&event.target) {
            return false;
        }
        if event.status.is_success() {
            self.subscribed = true;
        } else {
            warn!(
                "Live {} subscription failed with {:?}",
                self.channel, event.status
            );
        }
        true
    }

    /// Decode a notification and deliver its samples
    pub fn on_notification(
        &mut self,
        ctx: &ServiceContext<'_>,
        target: &GattTarget,
        payload: &Bytes,
    ) -> bool {
        if !self.handles(target) {
            return false;
        }
        match self.decode(payload, now_epoch_ms()) {
            Ok(samples) => {
                for sample in &samples {
                    ctx.listeners
                        .notify("sample", |listener| listener.on_sample_received(sample));
                }
            }
            Err(e) => warn!("Ignoring live {} payload: {}", self.channel, e),
        }
        true
    }

    /// Decode one live payload stamped with `timestamp_ms`
    ///
    /// # Errors
    ///
    /// Returns [`GadgetError::BufferTooShort`] for truncated payloads.
    pub fn decode(&self, payload: &[u8], timestamp_ms: u64) -> Result<Vec<Sample>> {
        match self.layout {
            LiveLayout::Float(unit) => Ok(vec![Sample::new(
                codec::f32_le(payload, 0)?,
                unit,
                timestamp_ms,
                self.channel,
            )]),
            LiveLayout::FixedPointPair => {
                if payload.len() < 4 {
                    return Err(GadgetError::BufferTooShort {
                        needed: 4,
                        offset: 0,
                        available: payload.len(),
                    });
                }
                Ok(vec![
                    Sample::new(
                        f32::from(codec::i16_le(payload, 0)?) / 100.0,
                        SensorUnit::Celsius,
                        timestamp_ms,
                        "temperature",
                    ),
                    Sample::new(
                        f32::from(codec::i16_le(payload, 2)?) / 100.0,
                        SensorUnit::RelativeHumidity,
                        timestamp_ms,
                        "humidity",
                    ),
                ])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_float_reading() {
        let service = LiveService::sht3x_temperature();
        let samples = service
            .decode(&codec::encode_f32_le(23.25), 42)
            .unwrap();

        assert_eq!(
            samples,
            vec![Sample::new(23.25, SensorUnit::Celsius, 42, "temperature")]
        );
    }

    #[test]
    fn test_decode_fixed_point_pair() {
        let service = LiveService::shtc1_rht();
        let samples = service.decode(&[0x34, 0x08, 0x88, 0x13], 7).unwrap();

        assert_eq!(samples.len(), 2);
        assert!((samples[0].value - 21.0).abs() < 0.001);
        assert_eq!(samples[1].unit, SensorUnit::RelativeHumidity);
        assert!((samples[1].value - 50.0).abs() < 0.001);
    }

    #[test]
    fn test_decode_truncated() {
        assert!(LiveService::shtc1_rht().decode(&[0x01, 0x02], 0).is_err());
        assert!(LiveService::sht3x_humidity().decode(&[0x01], 0).is_err());
    }

    #[test]
    fn test_subscription_confirmation() {
        let mut service = LiveService::sht3x_humidity();
        let other = GattTarget::characteristic(SHT3X_TEMPERATURE_UUID);

        assert!(!service.on_operation_complete(&CompletionEvent::success(other, Bytes::new())));
        assert!(!service.is_subscribed());

        let target = *service.target();
        assert!(service.on_operation_complete(&CompletionEvent::success(target, Bytes::new())));
        assert!(service.is_subscribed());
    }
}
