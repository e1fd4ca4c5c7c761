use std::{collections::VecDeque, time::Duration};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::{
    error::Result,
    link::GattTransport,
    types::{GattTarget, Operation, OperationKind, QueueConfig},
};

/// What a call to [`OperationQueue::pump`] did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PumpReport {
    /// Target of the operation handed to the transport
    pub dispatched: Option<GattTarget>,
    /// Operation dropped because it exceeded the stall threshold
    pub stalled: Option<Operation>,
    /// The transport refused the head operation; it stays queued
    pub rejected: bool,
    /// Operations discarded after a transport error
    pub purged: usize,
}

/// FIFO of pending operations with a single in-flight slot
#[derive(Debug)]
pub struct OperationQueue {
    pending: VecDeque<Operation>,
    in_flight: Option<Operation>,
    last_progress: Option<Instant>,
    stall_threshold: Duration,
    stalls: u64,
}

impl OperationQueue {
    /// Create an empty queue
    #[must_use]
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            pending: VecDeque::new(),
            in_flight: None,
            last_progress: None,
            stall_threshold: config.stall_threshold(),
            stalls: 0,
        }
    }

    /// Append an operation to the tail
    pub fn enqueue(&mut self, operation: Operation) {
        debug!("Queueing {} ({} pending)", operation, self.pending.len());
        self.pending.push_back(operation);
    }

    /// Dispatch the head of the queue if nothing is in flight
    ///
    /// When an operation is in flight for longer than the stall threshold it is
    /// dropped, and the next pending operation is dispatched in the same call.
    /// A transport error while submitting purges the whole queue.
    pub fn pump(&mut self, transport: &dyn GattTransport) -> PumpReport {
        let mut report = PumpReport::default();

        if self.in_flight.is_some() {
            let waited = self
                .last_progress
                .map_or(Duration::ZERO, |since| since.elapsed());
            if waited < self.stall_threshold {
                return report;
            }

            let stuck = self.in_flight.take();
            self.stalls += 1;
            if let Some(operation) = &stuck {
                warn!(
                    "GATT stack stalled on {} for {}ms, dropping it",
                    operation,
                    waited.as_millis()
                );
            }
            report.stalled = stuck;
        }

        let Some(operation) = self.pending.pop_front() else {
            return report;
        };

        match submit(transport, &operation) {
            Ok(true) => {
                debug!("Submitted {}", operation);
                self.last_progress = Some(Instant::now());
                report.dispatched = Some(*operation.target());
                self.in_flight = Some(operation);
            }
            Ok(false) => {
                debug!("Transport rejected {}, holding queue", operation);
                self.pending.push_front(operation);
                report.rejected = true;
            }
            Err(e) => {
                error!("Transport failed submitting {}: {}", operation, e);
                report.purged = self.purge() + 1;
            }
        }

        report
    }

    /// Handle a completion callback and move on to the next operation
    ///
    /// A completion that does not match the in-flight operation (for example a
    /// late answer to an operation already dropped as stalled) leaves the
    /// in-flight slot untouched.
    pub fn on_operation_complete(
        &mut self,
        transport: &dyn GattTransport,
        target: &GattTarget,
    ) -> PumpReport {
        match &self.in_flight {
            Some(current) if current.target() == target => {
                self.in_flight = None;
                self.last_progress = Some(Instant::now());
            }
            Some(current) => {
                debug!("Completion for {} while {} is in flight", target, current);
            }
            None => debug!("Completion for {} with nothing in flight", target),
        }

        self.pump(transport)
    }

    /// Forget every pending and in-flight operation after a disconnect
    pub fn on_disconnected(&mut self) -> usize {
        let dropped = self.clear();
        if dropped > 0 {
            debug!("Link down, discarded {} operation(s)", dropped);
        }
        dropped
    }

    /// Discard every pending and in-flight operation
    pub fn purge(&mut self) -> usize {
        let dropped = self.clear();
        warn!("Purged operation queue ({} operation(s) discarded)", dropped);
        dropped
    }

    fn clear(&mut self) -> usize {
        let dropped = self.pending.len() + usize::from(self.in_flight.is_some());
        self.pending.clear();
        self.in_flight = None;
        self.last_progress = None;
        dropped
    }

    /// Number of operations waiting to be dispatched
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// True when nothing is pending or in flight
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_none()
    }

    /// True while an operation is in flight
    #[must_use]
    pub const fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    /// The operation currently in flight
    #[must_use]
    pub const fn in_flight(&self) -> Option<&Operation> {
        self.in_flight.as_ref()
    }

    /// Number of operations dropped as stalled since creation
    #[must_use]
    pub const fn stall_count(&self) -> u64 {
        self.stalls
    }
}

fn submit(transport: &dyn GattTransport, operation: &Operation) -> Result<bool> {
    let target = operation.target();
    match operation.kind() {
        OperationKind::ReadCharacteristic => transport.submit_read(target),
        OperationKind::WriteCharacteristic(value) => transport.submit_write(target, value),
        OperationKind::ReadDescriptor => transport.submit_descriptor_op(target, None),
        OperationKind::WriteDescriptor(value) => {
            transport.submit_descriptor_op(target, Some(value))
        }
        OperationKind::SetNotification(enable) => {
            transport.submit_set_notification(target, *enable)
        }
    }
}
