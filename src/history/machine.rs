use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::dialect::DeviceDialect;
use crate::{
    error::{GadgetError, Result},
    session::ServiceContext,
    types::{
        now_epoch_ms, ClockFields, CompletionEvent, DownloadConfig, DownloadOutcome,
        DownloadPhase, DownloadStatus, GattTarget,
    },
};

/// Per-download state, dropped when the download ends
#[derive(Debug)]
struct DownloadSession {
    phase: DownloadPhase,
    handshake: Vec<DownloadPhase>,
    step: usize,
    awaiting: Option<GattTarget>,
    samples_downloaded: u32,
    samples_expected: u32,
    channel_counts: Vec<u32>,
    bounds_resolved: bool,
    last_progress: Instant,
    prior_logging_enabled: Option<bool>,
    logging_disabled: bool,
    progress: u8,
    malformed: u32,
}

impl DownloadSession {
    fn new(dialect: &DeviceDialect) -> Self {
        Self {
            phase: DownloadPhase::Init,
            handshake: dialect.handshake(),
            step: 0,
            awaiting: None,
            samples_downloaded: 0,
            samples_expected: 0,
            channel_counts: vec![0; dialect.channels.len()],
            bounds_resolved: false,
            last_progress: Instant::now(),
            prior_logging_enabled: None,
            logging_disabled: false,
            progress: 0,
            malformed: 0,
        }
    }
}

/// History download state machine for one logger service
///
/// Every handshake phase issues exactly one operation through the link and
/// waits for its completion before moving on. Streamed payloads are decoded
/// by the [`DeviceDialect`] and fanned out to the listeners.
#[derive(Debug)]
pub struct HistoryService {
    dialect: DeviceDialect,
    config: DownloadConfig,
    clock: ClockFields,
    download: Option<DownloadSession>,
    last_outcome: Option<DownloadOutcome>,
    last_progress: u8,
}

impl HistoryService {
    /// Create an idle history service
    #[must_use]
    pub fn new(dialect: DeviceDialect, config: DownloadConfig) -> Self {
        Self {
            dialect,
            config,
            clock: ClockFields::default(),
            download: None,
            last_outcome: None,
            last_progress: 0,
        }
    }

    /// Logger service UUID
    #[must_use]
    pub const fn service_uuid(&self) -> Uuid {
        self.dialect.service_uuid
    }

    /// Device dialect in use
    #[must_use]
    pub const fn dialect(&self) -> &DeviceDialect {
        &self.dialect
    }

    /// Clock fields read during the last handshake
    #[must_use]
    pub const fn clock_fields(&self) -> &ClockFields {
        &self.clock
    }

    /// Whether a download is in progress
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.download.is_some()
    }

    /// Current download state
    #[must_use]
    pub fn status(&self) -> DownloadStatus {
        self.download.as_ref().map_or(
            DownloadStatus {
                phase: DownloadPhase::Idle,
                samples_downloaded: 0,
                samples_expected: 0,
                progress: self.last_progress,
                malformed_payloads: 0,
                last_outcome: self.last_outcome,
            },
            |download| DownloadStatus {
                phase: download.phase,
                samples_downloaded: download.samples_downloaded,
                samples_expected: download.samples_expected,
                progress: download.progress,
                malformed_payloads: download.malformed,
                last_outcome: self.last_outcome,
            },
        )
    }

    /// Whether `target` belongs to this service
    #[must_use]
    pub fn handles(&self, target: &GattTarget) -> bool {
        self.dialect.owns(target)
    }

    /// Start downloading the device log
    ///
    /// # Errors
    ///
    /// Returns [`GadgetError::DownloadInProgress`] if a download is running,
    /// [`GadgetError::NoListeners`] if nobody would receive the samples and
    /// [`GadgetError::NotConnected`] if the link is down.
    pub fn start_download(&mut self, ctx: &ServiceContext<'_>) -> Result<()> {
        if self.download.is_some() {
            return Err(GadgetError::DownloadInProgress);
        }
        if ctx.listeners.is_empty() {
            return Err(GadgetError::NoListeners);
        }
        if !ctx.link.is_connected() {
            return Err(GadgetError::NotConnected);
        }

        info!("Starting history download from {}", self.dialect.name);
        self.clock = ClockFields::default();
        self.last_progress = 0;
        self.download = Some(DownloadSession::new(&self.dialect));
        ctx.listeners.notify("phase", |listener| {
            listener.on_phase_changed(DownloadPhase::Init);
        });

        self.advance(ctx);
        Ok(())
    }

    /// Abort a running download, reported as failed
    pub fn cancel_download(&mut self, ctx: &ServiceContext<'_>) -> bool {
        if self.download.is_none() {
            return false;
        }
        info!("History download cancelled");
        self.finish(ctx, DownloadOutcome::Failed);
        true
    }

    /// Handle a completion for one of this service's characteristics
    ///
    /// Returns `true` when the completion answered the pending handshake step.
    pub fn on_operation_complete(
        &mut self,
        ctx: &ServiceContext<'_>,
        event: &CompletionEvent,
    ) -> bool {
        let Some(download) = self.download.as_mut() else {
            return false;
        };
        if download.awaiting != Some(event.target) {
            return false;
        }

        let phase = download.phase;
        download.awaiting = None;
        if !event.status.is_success() {
            warn!("{} failed with {:?}", phase, event.status);
            self.finish(ctx, DownloadOutcome::Failed);
            return true;
        }

        match self.dialect.apply_read(phase, &event.payload, &mut self.clock) {
            Ok(Some(enabled)) => download.prior_logging_enabled = Some(enabled),
            Ok(None) => {}
            Err(e) => {
                warn!("Invalid value during {}: {}", phase, e);
                self.finish(ctx, DownloadOutcome::Failed);
                return true;
            }
        }

        if phase == DownloadPhase::TriggerDownload {
            self.enter_running(ctx);
        } else {
            self.advance(ctx);
        }
        true
    }

    /// Handle a notification; returns `true` if it was a history payload
    pub fn on_notification(
        &mut self,
        ctx: &ServiceContext<'_>,
        target: &GattTarget,
        payload: &Bytes,
    ) -> bool {
        let Some(channel_index) = self.dialect.channel_index(target) else {
            return false;
        };
        let Some(phase) = self.download.as_ref().map(|download| download.phase) else {
            return false;
        };
        match phase {
            DownloadPhase::Running => {}
            // streaming may start before the trigger write is confirmed
            DownloadPhase::TriggerDownload => self.enter_running(ctx),
            _ => return false,
        }

        if payload.is_empty() {
            info!("End of history stream");
            self.finish(ctx, DownloadOutcome::Complete);
            return true;
        }

        self.on_stream_payload(ctx, channel_index, payload);
        true
    }

    /// Drive the watchdogs
    pub fn tick(&mut self, ctx: &ServiceContext<'_>) {
        let Some(download) = self.download.as_ref() else {
            return;
        };
        let waited = download.last_progress.elapsed();

        if download.phase == DownloadPhase::Running {
            if waited < self.config.watchdog() {
                return;
            }
            let ratio = if download.samples_expected == 0 {
                1.0
            } else {
                f64::from(download.samples_downloaded) / f64::from(download.samples_expected)
            };
            let outcome = if ratio >= f64::from(self.config.completion_threshold) {
                DownloadOutcome::Complete
            } else {
                DownloadOutcome::Failed
            };
            warn!(
                "History stream silent for {}ms at {}/{} samples, ending as {}",
                waited.as_millis(),
                download.samples_downloaded,
                download.samples_expected,
                outcome
            );
            self.finish(ctx, outcome);
        } else if waited >= self.config.handshake_timeout() {
            warn!(
                "No answer during {} for {}ms, giving up",
                download.phase,
                waited.as_millis()
            );
            self.finish(ctx, DownloadOutcome::Failed);
        }
    }

    /// Abort after the link went down
    pub fn on_disconnected(&mut self, ctx: &ServiceContext<'_>) {
        if self.download.is_some() {
            warn!("Disconnected during history download");
            self.finish(ctx, DownloadOutcome::Failed);
        }
    }

    fn advance(&mut self, ctx: &ServiceContext<'_>) {
        let Some(download) = self.download.as_mut() else {
            return;
        };

        let phase = loop {
            let Some(phase) = download.handshake.get(download.step).copied() else {
                break None;
            };
            download.step += 1;
            if phase == DownloadPhase::DisableLogging
                && download.prior_logging_enabled != Some(true)
            {
                continue;
            }
            break Some(phase);
        };

        let Some(phase) = phase else {
            self.enter_running(ctx);
            return;
        };

        if matches!(
            phase,
            DownloadPhase::Subscribe(_) | DownloadPhase::TriggerDownload
        ) && !download.bounds_resolved
        {
            match self.dialect.resolve_bounds(&mut self.clock) {
                Ok(expected) => {
                    download.bounds_resolved = true;
                    download.samples_expected = expected;
                    info!("Device holds {} logged sample(s)", expected);
                    if expected == 0 {
                        self.finish(ctx, DownloadOutcome::NoData);
                        return;
                    }
                }
                Err(e) => {
                    warn!("Cannot size history download: {}", e);
                    self.finish(ctx, DownloadOutcome::Failed);
                    return;
                }
            }
        }

        let operation = match self.dialect.operation_for(phase, &self.clock, now_epoch_ms()) {
            Ok(operation) => operation,
            Err(e) => {
                warn!("Cannot build {} request: {}", phase, e);
                self.finish(ctx, DownloadOutcome::Failed);
                return;
            }
        };

        if phase == DownloadPhase::DisableLogging {
            download.logging_disabled = true;
        }
        download.phase = phase;
        download.awaiting = Some(*operation.target());
        download.last_progress = Instant::now();
        debug!("History phase {} -> {}", phase, operation);
        ctx.listeners
            .notify("phase", |listener| listener.on_phase_changed(phase));

        if let Err(e) = ctx.link.submit(operation) {
            warn!("Could not submit {} request: {}", phase, e);
            self.finish(ctx, DownloadOutcome::Failed);
        }
    }

    fn enter_running(&mut self, ctx: &ServiceContext<'_>) {
        let Some(download) = self.download.as_mut() else {
            return;
        };
        if download.phase == DownloadPhase::Running {
            return;
        }
        download.phase = DownloadPhase::Running;
        download.awaiting = None;
        download.last_progress = Instant::now();
        info!(
            "Streaming {} sample(s) from {}",
            download.samples_expected, self.dialect.name
        );
        ctx.listeners.notify("phase", |listener| {
            listener.on_phase_changed(DownloadPhase::Running);
        });
    }

    fn on_stream_payload(&mut self, ctx: &ServiceContext<'_>, channel_index: usize, payload: &[u8]) {
        let Some(download) = self.download.as_mut() else {
            return;
        };
        let channel = &self.dialect.channels[channel_index];
        let already = download.channel_counts[channel_index];
        let limit = download.samples_expected.saturating_sub(already);

        let decoded = match self.dialect.decode(channel, payload, &self.clock, already, limit) {
            Ok(decoded) => decoded,
            Err(e) => {
                download.malformed += 1;
                warn!("Ignoring malformed history payload on {}: {}", channel.name, e);
                return;
            }
        };

        download.channel_counts[channel_index] = already.saturating_add(decoded.records);
        download.samples_downloaded = download
            .channel_counts
            .iter()
            .copied()
            .min()
            .unwrap_or(0)
            .min(download.samples_expected);
        download.last_progress = Instant::now();

        for sample in &decoded.samples {
            ctx.listeners
                .notify("sample", |listener| listener.on_sample_received(sample));
        }

        let progress = progress_percent(download.samples_downloaded, download.samples_expected);
        if progress != download.progress {
            download.progress = progress;
            ctx.listeners
                .notify("progress", |listener| listener.on_download_progress(progress));
        }

        if download.samples_downloaded >= download.samples_expected {
            self.finish(ctx, DownloadOutcome::Complete);
        }
    }

    fn finish(&mut self, ctx: &ServiceContext<'_>, outcome: DownloadOutcome) {
        let Some(download) = self.download.take() else {
            return;
        };

        if download.logging_disabled {
            if let Some(restore) = self.dialect.restore_logging() {
                // the link may already be gone, nothing to report to then
                if let Err(e) = ctx.link.submit(restore) {
                    debug!("Could not re-enable logging: {}", e);
                }
            }
        }

        info!(
            "History download ended: {} ({}/{} samples)",
            outcome, download.samples_downloaded, download.samples_expected
        );
        self.last_outcome = Some(outcome);
        self.last_progress = download.progress;

        ctx.listeners.notify("outcome", |listener| match outcome {
            DownloadOutcome::Complete => listener.on_download_complete(),
            DownloadOutcome::Failed => listener.on_download_failed(),
            DownloadOutcome::NoData => listener.on_download_no_data(),
        });
        ctx.listeners.notify("phase", |listener| {
            listener.on_phase_changed(DownloadPhase::Idle);
        });
    }
}

/// Download progress in percent, rounded up and clamped to 100
#[must_use]
pub fn progress_percent(downloaded: u32, expected: u32) -> u8 {
    if expected == 0 || downloaded >= expected {
        return 100;
    }
    let percent = (u64::from(downloaded) * 100).div_ceil(u64::from(expected));
    u8::try_from(percent.min(100)).unwrap_or(100)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        codec,
        link::GattLink,
        listener::{recording::RecordingListener, ListenerSet},
        testing::{init_tracing, ScriptedTransport},
        types::{Operation, OperationKind, QueueConfig},
        SHTC1_CURRENT_POINTER_UUID, SHTC1_LOGGED_DATA_UUID, SHTC1_LOGGING_ENABLED_UUID,
        SHT3X_HUMIDITY_UUID, SHT3X_TEMPERATURE_UUID,
    };
    use std::{sync::Arc, time::Duration};
    use tokio::time::advance;

    struct Harness {
        transport: Arc<ScriptedTransport>,
        link: GattLink,
        listeners: ListenerSet,
        recorder: Arc<RecordingListener>,
    }

    impl Harness {
        fn new() -> Self {
            init_tracing();
            let transport = Arc::new(ScriptedTransport::new());
            let link = GattLink::new(transport.clone(), &QueueConfig::default());
            let recorder = Arc::new(RecordingListener::default());
            let mut listeners = ListenerSet::new();
            listeners.subscribe(recorder.clone());
            Self {
                transport,
                link,
                listeners,
                recorder,
            }
        }

        fn ctx(&self) -> ServiceContext<'_> {
            ServiceContext {
                link: &self.link,
                listeners: &self.listeners,
            }
        }

        fn last(&self) -> Operation {
            self.transport.last().unwrap()
        }

        fn complete(&self, service: &mut HistoryService, payload: impl Into<Bytes>) -> bool {
            let event = CompletionEvent::success(*self.last().target(), payload);
            self.link.on_operation_complete(&event);
            service.on_operation_complete(&self.ctx(), &event)
        }

        fn notify(&self, service: &mut HistoryService, target: GattTarget, payload: impl Into<Bytes>) {
            assert!(service.on_notification(&self.ctx(), &target, &payload.into()));
        }

        fn assert_single_flight(&self) {
            assert!(self.link.is_busy());
            assert_eq!(self.link.pending_len(), 0);
        }
    }

    fn ring() -> HistoryService {
        HistoryService::new(DeviceDialect::ring_buffer(), DownloadConfig::default())
    }

    fn timestamped() -> HistoryService {
        HistoryService::new(DeviceDialect::timestamped(), DownloadConfig::default())
    }

    fn ring_records(count: usize) -> Vec<u8> {
        let mut payload = Vec::new();
        for _ in 0..count {
            payload.extend_from_slice(&codec::encode_i16_le(2_100));
            payload.extend_from_slice(&codec::encode_i16_le(5_000));
        }
        payload
    }

    fn sequenced(sequence: u32, values: &[f32]) -> Vec<u8> {
        let mut payload = codec::encode_u32_le(sequence).to_vec();
        for value in values {
            payload.extend_from_slice(&codec::encode_f32_le(*value));
        }
        payload
    }

    fn logged_data() -> GattTarget {
        GattTarget::characteristic(SHTC1_LOGGED_DATA_UUID)
    }

    /// Runs the ring buffer handshake up to `Running`
    fn ring_handshake(h: &Harness, service: &mut HistoryService, epoch_s: u32, start: u32, end: u32) {
        service.start_download(&h.ctx()).unwrap();
        assert!(h.complete(service, vec![0x01_u8]));
        assert!(h.complete(service, Bytes::new()));
        assert!(h.complete(service, codec::encode_u32_le(epoch_s)));
        assert!(h.complete(service, codec::encode_u16_le(2)));
        assert!(h.complete(service, codec::encode_u32_le(start)));
        assert!(h.complete(service, codec::encode_u32_le(end)));
        assert!(h.complete(service, Bytes::new()));
        assert!(h.complete(service, Bytes::new()));
        assert_eq!(service.status().phase, DownloadPhase::Running);
    }

    /// Runs the timestamped handshake up to `Running`
    fn timestamped_handshake(h: &Harness, service: &mut HistoryService, oldest: u64, newest: u64) {
        service.start_download(&h.ctx()).unwrap();
        assert!(h.complete(service, Bytes::new()));
        assert!(h.complete(service, codec::encode_u32_le(1_000)));
        assert!(h.complete(service, codec::encode_u64_le(oldest)));
        assert!(h.complete(service, codec::encode_u64_le(newest)));
        assert!(h.complete(service, Bytes::new()));
        assert!(h.complete(service, Bytes::new()));
        assert!(h.complete(service, Bytes::new()));
        assert_eq!(service.status().phase, DownloadPhase::Running);
    }

    #[tokio::test]
    async fn test_ring_buffer_phases_issue_one_operation_each() {
        use DownloadPhase::*;

        let h = Harness::new();
        let mut service = ring();
        service.start_download(&h.ctx()).unwrap();

        let answers: Vec<Bytes> = vec![
            Bytes::from_static(&[0x01]),
            Bytes::new(),
            codec::encode_u32_le(1_000),
            codec::encode_u16_le(2),
            codec::encode_u32_le(5),
            codec::encode_u32_le(15),
            Bytes::new(),
        ];
        for answer in answers {
            h.assert_single_flight();
            assert!(h.complete(&mut service, answer));
        }

        h.assert_single_flight();
        let trigger = h.last();
        assert_eq!(
            trigger.target(),
            &GattTarget::characteristic(SHTC1_CURRENT_POINTER_UUID)
        );
        assert_eq!(
            trigger.kind(),
            &OperationKind::WriteCharacteristic(codec::encode_u32_le(5))
        );
        assert!(h.complete(&mut service, Bytes::new()));

        assert_eq!(
            h.recorder.phases(),
            vec![
                Init,
                ReadLoggingState,
                DisableLogging,
                ReadUserData,
                ReadInterval,
                ReadStartPointer,
                ReadEndPointer,
                Subscribe(0),
                TriggerDownload,
                Running,
            ]
        );
        assert_eq!(service.status().samples_expected, 10);
        assert_eq!(service.clock_fields().oldest_timestamp_ms, Some(1_010_000));
    }

    #[tokio::test]
    async fn test_ring_buffer_download_completes() {
        let h = Harness::new();
        let mut service = ring();
        ring_handshake(&h, &mut service, 1_000, 5, 15);

        h.notify(&mut service, logged_data(), ring_records(5));
        assert_eq!(service.status().progress, 50);
        h.notify(&mut service, logged_data(), ring_records(5));

        assert_eq!(h.recorder.progress(), vec![50, 100]);
        assert_eq!(h.recorder.outcomes(), vec![DownloadOutcome::Complete]);
        assert_eq!(h.recorder.phases().last(), Some(&DownloadPhase::Idle));

        let samples = h.recorder.samples();
        assert_eq!(samples.len(), 20);
        assert_eq!(samples[0].timestamp_ms, 1_010_000);
        assert_eq!(samples[4].timestamp_ms, 1_014_000);
        assert!((samples[1].value - 50.0).abs() < 0.001);

        // logging was on before the download, so it is switched back on
        assert_eq!(
            h.last(),
            Operation::write(
                GattTarget::characteristic(SHTC1_LOGGING_ENABLED_UUID),
                vec![0x01_u8]
            )
        );
        assert!(!service.is_running());
        assert_eq!(
            service.status().last_outcome,
            Some(DownloadOutcome::Complete)
        );
    }

    #[tokio::test]
    async fn test_logging_left_alone_when_disabled() {
        let h = Harness::new();
        let mut service = ring();
        service.start_download(&h.ctx()).unwrap();

        assert!(h.complete(&mut service, vec![0x00_u8]));
        assert_eq!(service.status().phase, DownloadPhase::ReadUserData);

        assert!(service.cancel_download(&h.ctx()));
        let writes = h
            .transport
            .submitted()
            .into_iter()
            .filter(|op| matches!(op.kind(), OperationKind::WriteCharacteristic(_)))
            .count();
        assert_eq!(writes, 0);
    }

    #[tokio::test]
    async fn test_timestamped_phases_and_per_channel_progress() {
        use DownloadPhase::*;

        let h = Harness::new();
        let mut service = timestamped();
        timestamped_handshake(&h, &mut service, 0, 2_000);

        assert_eq!(
            h.recorder.phases(),
            vec![
                Init,
                SyncClock,
                ReadInterval,
                ReadOldest,
                ReadNewest,
                Subscribe(0),
                Subscribe(1),
                TriggerDownload,
                Running,
            ]
        );

        let humidity = GattTarget::characteristic(SHT3X_HUMIDITY_UUID);
        let temperature = GattTarget::characteristic(SHT3X_TEMPERATURE_UUID);
        h.notify(&mut service, humidity, sequenced(0, &[40.0, 41.0]));
        assert_eq!(service.status().samples_downloaded, 0);
        assert!(h.recorder.outcomes().is_empty());

        h.notify(&mut service, temperature, sequenced(0, &[20.0, 21.0]));
        assert_eq!(h.recorder.outcomes(), vec![DownloadOutcome::Complete]);

        let samples = h.recorder.samples();
        assert_eq!(samples.len(), 4);
        assert_eq!(samples[2].channel, "temperature");
        assert_eq!(samples[2].timestamp_ms, 2_000);
        assert_eq!(samples[3].timestamp_ms, 1_000);
    }

    #[tokio::test]
    async fn test_stream_may_start_before_trigger_is_confirmed() {
        use DownloadPhase::*;

        let h = Harness::new();
        let mut service = timestamped();
        service.start_download(&h.ctx()).unwrap();
        assert!(h.complete(&mut service, Bytes::new()));
        assert!(h.complete(&mut service, codec::encode_u32_le(1_000)));
        assert!(h.complete(&mut service, codec::encode_u64_le(0)));
        assert!(h.complete(&mut service, codec::encode_u64_le(2_000)));
        assert!(h.complete(&mut service, Bytes::new()));
        assert!(h.complete(&mut service, Bytes::new()));
        assert_eq!(service.status().phase, TriggerDownload);

        let trigger = h.last();
        h.notify(
            &mut service,
            GattTarget::characteristic(SHT3X_HUMIDITY_UUID),
            sequenced(0, &[40.0, 41.0]),
        );
        assert_eq!(service.status().phase, Running);
        h.notify(
            &mut service,
            GattTarget::characteristic(SHT3X_TEMPERATURE_UUID),
            sequenced(0, &[20.0, 21.0]),
        );
        assert_eq!(h.recorder.outcomes(), vec![DownloadOutcome::Complete]);

        // the trigger write is answered after the download already ended
        let late = CompletionEvent::success(*trigger.target(), Bytes::new());
        h.link.on_operation_complete(&late);
        assert!(!service.on_operation_complete(&h.ctx(), &late));

        assert_eq!(
            &h.recorder.phases()[7..],
            &[TriggerDownload, Running, Idle]
        );
        assert!(!h.link.is_busy());
        assert_eq!(h.link.pending_len(), 0);
        assert_eq!(h.transport.submitted().len(), 7);
    }

    #[tokio::test]
    async fn test_no_data_skips_streaming() {
        let h = Harness::new();
        let mut service = timestamped();
        service.start_download(&h.ctx()).unwrap();

        assert!(h.complete(&mut service, Bytes::new()));
        assert!(h.complete(&mut service, codec::encode_u32_le(1_000)));
        assert!(h.complete(&mut service, codec::encode_u64_le(5_000)));
        assert!(h.complete(&mut service, codec::encode_u64_le(5_000)));

        assert_eq!(h.recorder.outcomes(), vec![DownloadOutcome::NoData]);
        assert_eq!(h.transport.submitted().len(), 4);
        assert!(!service.is_running());
    }

    #[tokio::test]
    async fn test_empty_payload_ends_download() {
        let h = Harness::new();
        let mut service = ring();
        ring_handshake(&h, &mut service, 0, 0, 10);

        h.notify(&mut service, logged_data(), ring_records(3));
        h.notify(&mut service, logged_data(), Bytes::new());

        assert_eq!(h.recorder.outcomes(), vec![DownloadOutcome::Complete]);
        assert_eq!(h.recorder.samples().len(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_payload_does_not_feed_watchdog() {
        let h = Harness::new();
        let mut service = ring();
        ring_handshake(&h, &mut service, 0, 0, 10);

        advance(Duration::from_secs(2)).await;
        h.notify(&mut service, logged_data(), vec![0x01_u8, 0x02, 0x03]);
        assert_eq!(service.status().malformed_payloads, 1);
        assert!(h.recorder.samples().is_empty());

        advance(Duration::from_millis(1_100)).await;
        service.tick(&h.ctx());
        assert_eq!(h.recorder.outcomes(), vec![DownloadOutcome::Failed]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_accepts_nearly_complete_download() {
        let h = Harness::new();
        let mut service = ring();
        // 2 s interval over 40 s span: 20 samples expected
        ring_handshake(&h, &mut service, 0, 0, 20);
        assert_eq!(service.status().samples_expected, 20);

        h.notify(&mut service, logged_data(), ring_records(19));
        assert_eq!(service.status().progress, 95);

        advance(Duration::from_millis(2_900)).await;
        service.tick(&h.ctx());
        assert!(service.is_running());

        advance(Duration::from_millis(200)).await;
        service.tick(&h.ctx());
        assert_eq!(h.recorder.outcomes(), vec![DownloadOutcome::Complete]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_fails_incomplete_download() {
        let h = Harness::new();
        let mut service = ring();
        ring_handshake(&h, &mut service, 0, 0, 20);

        h.notify(&mut service, logged_data(), ring_records(18));
        advance(Duration::from_secs(3)).await;
        service.tick(&h.ctx());

        assert_eq!(h.recorder.outcomes(), vec![DownloadOutcome::Failed]);
        assert_eq!(service.status().progress, 90);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout() {
        let h = Harness::new();
        let mut service = timestamped();
        service.start_download(&h.ctx()).unwrap();

        advance(Duration::from_millis(4_900)).await;
        service.tick(&h.ctx());
        assert!(service.is_running());

        advance(Duration::from_millis(200)).await;
        service.tick(&h.ctx());
        assert_eq!(h.recorder.outcomes(), vec![DownloadOutcome::Failed]);
    }

    #[tokio::test]
    async fn test_failed_step_fails_download() {
        let h = Harness::new();
        let mut service = timestamped();
        service.start_download(&h.ctx()).unwrap();

        let event = CompletionEvent::failure(*h.last().target(), 0x0E);
        h.link.on_operation_complete(&event);
        assert!(service.on_operation_complete(&h.ctx(), &event));

        assert_eq!(h.recorder.outcomes(), vec![DownloadOutcome::Failed]);
    }

    #[tokio::test]
    async fn test_unrelated_completion_is_ignored() {
        let h = Harness::new();
        let mut service = timestamped();
        service.start_download(&h.ctx()).unwrap();

        let stray = CompletionEvent::success(GattTarget::characteristic(SHT3X_HUMIDITY_UUID), Bytes::new());
        assert!(!service.on_operation_complete(&h.ctx(), &stray));
        assert_eq!(service.status().phase, DownloadPhase::SyncClock);
    }

    #[tokio::test]
    async fn test_start_download_preconditions() {
        let h = Harness::new();
        let mut service = timestamped();

        let lonely = ListenerSet::new();
        let err = service
            .start_download(&ServiceContext {
                link: &h.link,
                listeners: &lonely,
            })
            .unwrap_err();
        assert!(matches!(err, GadgetError::NoListeners));

        service.start_download(&h.ctx()).unwrap();
        let err = service.start_download(&h.ctx()).unwrap_err();
        assert!(matches!(err, GadgetError::DownloadInProgress));

        service.on_disconnected(&h.ctx());
        h.link.on_disconnected();
        let err = service.start_download(&h.ctx()).unwrap_err();
        assert!(matches!(err, GadgetError::NotConnected));
    }

    #[tokio::test]
    async fn test_rejected_step_is_retried_by_the_queue() {
        let h = Harness::new();
        h.transport.reject_next(1);
        let mut service = timestamped();
        service.start_download(&h.ctx()).unwrap();

        assert!(h.transport.submitted().is_empty());
        assert_eq!(h.link.pending_len(), 1);

        h.link.tick();
        assert_eq!(h.transport.submitted().len(), 1);
        assert!(h.complete(&mut service, Bytes::new()));
        assert_eq!(service.status().phase, DownloadPhase::ReadInterval);
    }

    #[test]
    fn test_progress_percent() {
        assert_eq!(progress_percent(0, 10), 0);
        assert_eq!(progress_percent(1, 3), 34);
        assert_eq!(progress_percent(19, 20), 95);
        assert_eq!(progress_percent(12, 10), 100);
        assert_eq!(progress_percent(0, 0), 100);
    }
}
