use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Manager, Peripheral};
use smartgadget::{
    ConnectionConfig, DownloadOutcome, GadgetConnection, GadgetError, GadgetListener, Result,
    Sample, ServiceRegistry,
};
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tracing::{error, info};

const SCAN_TIME: Duration = Duration::from_secs(5);

struct Printer {
    outcome: mpsc::UnboundedSender<DownloadOutcome>,
}

impl GadgetListener for Printer {
    fn on_sample_received(&self, sample: &Sample) {
        println!("{sample}");
    }

    fn on_download_progress(&self, percent: u8) {
        info!("Download {}%", percent);
    }

    fn on_download_complete(&self) {
        let _ = self.outcome.send(DownloadOutcome::Complete);
    }

    fn on_download_failed(&self) {
        let _ = self.outcome.send(DownloadOutcome::Failed);
    }

    fn on_download_no_data(&self) {
        let _ = self.outcome.send(DownloadOutcome::NoData);
    }
}

async fn find_gadget() -> Result<Peripheral> {
    let manager = Manager::new().await?;
    let central = manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| GadgetError::ConnectionFailed("no Bluetooth adapter".to_string()))?;

    central.start_scan(ScanFilter::default()).await?;
    tokio::time::sleep(SCAN_TIME).await;
    central.stop_scan().await?;

    for peripheral in central.peripherals().await? {
        let name = peripheral
            .properties()
            .await?
            .and_then(|properties| properties.local_name)
            .unwrap_or_default();
        if name.contains("Smart Humigadget") || name.contains("Smart Gadget") {
            info!("Found {} ({})", name, peripheral.address());
            return Ok(peripheral);
        }
    }
    Err(GadgetError::ConnectionFailed(
        "no Smart Gadget in range".to_string(),
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let peripheral = find_gadget().await?;
    let registry = ServiceRegistry::default();
    let gadget = GadgetConnection::open(peripheral, &registry, ConnectionConfig::default()).await?;

    let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();
    gadget.subscribe(Arc::new(Printer {
        outcome: outcome_tx,
    }));
    gadget.start_download()?;

    match outcome_rx.recv().await {
        Some(outcome) => info!("History download finished: {}", outcome),
        None => error!("Gadget session closed before the download ended"),
    }
    if let Some(status) = gadget.download_status() {
        info!(
            "{} of {} samples received",
            status.samples_downloaded, status.samples_expected
        );
    }

    gadget.disconnect().await
}
