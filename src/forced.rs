use bytes::Bytes;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, warn};

use crate::{
    error::{GadgetError, Result},
    link::GattLink,
    types::{ForceConfig, Operation},
};

/// Push one operation through the link and wait for its completion
///
/// The queue is purged first so the operation goes out immediately, and purged
/// again on every exit so nothing queued behind it survives. Each attempt waits
/// up to `config.per_attempt_timeout()` for a completion of the operation's
/// target, polling the link's completion log; a failed or missing completion
/// leads to another submission until `config.max_attempts` is reached.
///
/// Must not be awaited from the task that delivers transport events, since the
/// completion it waits for is fed by that task.
///
/// # Errors
///
/// Returns [`GadgetError::Disconnected`] when the link drops,
/// [`GadgetError::RetriesExhausted`] after the last attempt and
/// [`GadgetError::InvalidParameters`] when `max_attempts` is zero.
pub async fn force_operation(
    link: &GattLink,
    operation: Operation,
    config: &ForceConfig,
) -> Result<Bytes> {
    if config.max_attempts == 0 {
        return Err(GadgetError::InvalidParameters(
            "max_attempts must be at least 1".to_string(),
        ));
    }

    link.purge();
    let result = attempt_all(link, &operation, config).await;
    link.purge();
    result
}

async fn attempt_all(link: &GattLink, operation: &Operation, config: &ForceConfig) -> Result<Bytes> {
    let target = *operation.target();

    for attempt in 1..=config.max_attempts {
        if !link.is_connected() {
            return Err(GadgetError::Disconnected);
        }

        let baseline = link.completion_sequence();
        match link.submit(operation.clone()) {
            Ok(()) => debug!(
                "Forced {} attempt {}/{}",
                operation, attempt, config.max_attempts
            ),
            Err(GadgetError::NotConnected) => return Err(GadgetError::Disconnected),
            Err(e) => warn!(
                "Forced {} attempt {}/{} not submitted: {}",
                operation, attempt, config.max_attempts, e
            ),
        }

        let deadline = Instant::now() + config.per_attempt_timeout();
        loop {
            if let Some(record) = link.completion_after(&target, baseline) {
                if record.status.is_success() {
                    return Ok(record.payload);
                }
                warn!(
                    "Forced {} attempt {}/{} completed with {:?}",
                    operation, attempt, config.max_attempts, record.status
                );
                break;
            }
            if !link.is_connected() {
                return Err(GadgetError::Disconnected);
            }
            if Instant::now() >= deadline {
                warn!(
                    "Forced {} attempt {}/{} timed out after {}ms",
                    operation,
                    attempt,
                    config.max_attempts,
                    config.per_attempt_timeout_ms
                );
                break;
            }
            sleep(config.poll_interval()).await;
        }

        link.purge();
    }

    error!(
        "Forced {} failed after {} attempts",
        operation, config.max_attempts
    );
    Err(GadgetError::RetriesExhausted {
        attempts: config.max_attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        testing::{target, ScriptedTransport},
        types::{CompletionEvent, QueueConfig},
    };
    use std::{sync::Arc, time::Duration};

    fn link() -> (Arc<ScriptedTransport>, Arc<GattLink>) {
        let transport = Arc::new(ScriptedTransport::new());
        let link = Arc::new(GattLink::new(transport.clone(), &QueueConfig::default()));
        (transport, link)
    }

    fn complete_later(link: &Arc<GattLink>, after_ms: u64, event: CompletionEvent) {
        let link = link.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(after_ms)).await;
            link.on_operation_complete(&event);
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_purges_and_returns_payload() {
        let (transport, link) = link();
        link.submit(Operation::read(target(2))).unwrap();
        link.submit(Operation::read(target(3))).unwrap();

        complete_later(&link, 50, CompletionEvent::success(target(1), vec![0x2A_u8]));
        let payload = force_operation(&link, Operation::read(target(1)), &ForceConfig::default())
            .await
            .unwrap();

        assert_eq!(&payload[..], &[0x2A]);
        assert_eq!(
            transport.submitted(),
            vec![Operation::read(target(2)), Operation::read(target(1))]
        );
        assert_eq!(link.pending_len(), 0);
        assert!(!link.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_gives_up_after_max_attempts() {
        let (transport, link) = link();

        let err = force_operation(&link, Operation::read(target(1)), &ForceConfig::default())
            .await
            .unwrap_err();

        assert!(matches!(err, GadgetError::RetriesExhausted { attempts: 3 }));
        assert_eq!(transport.submitted().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_retries_after_failed_completion() {
        let (transport, link) = link();
        complete_later(&link, 20, CompletionEvent::failure(target(1), 0x85));
        complete_later(&link, 60, CompletionEvent::success(target(1), vec![0x07_u8]));

        let payload = force_operation(&link, Operation::read(target(1)), &ForceConfig::default())
            .await
            .unwrap();

        assert_eq!(&payload[..], &[0x07]);
        assert_eq!(transport.submitted().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_stops_on_disconnect() {
        let (_transport, link) = link();
        let dropper = link.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            dropper.on_disconnected();
        });

        let err = force_operation(&link, Operation::read(target(1)), &ForceConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GadgetError::Disconnected));
    }

    #[tokio::test]
    async fn test_force_rejects_zero_attempts() {
        let (_transport, link) = link();
        let config = ForceConfig {
            max_attempts: 0,
            ..ForceConfig::default()
        };

        let err = force_operation(&link, Operation::read(target(1)), &config)
            .await
            .unwrap_err();
        assert!(matches!(err, GadgetError::InvalidParameters(_)));
    }
}
