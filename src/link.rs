use bytes::Bytes;
use parking_lot::Mutex;
use std::{collections::HashMap, fmt, sync::Arc};
use tracing::{debug, info};

use crate::{
    error::{GadgetError, Result},
    queue::{OperationQueue, PumpReport},
    types::{CompletionEvent, GattStatus, GattTarget, Operation, QueueConfig},
};

/// Submission side of a BLE binding
///
/// Each call hands one request to the radio stack and returns immediately;
/// the outcome arrives later as a [`CompletionEvent`]. `Ok(false)` means the
/// stack refused the request right now, `Err` means the stack itself is in a
/// bad state.
pub trait GattTransport: Send + Sync {
    /// Request a characteristic read
    ///
    /// # Errors
    ///
    /// Returns an error when the underlying stack failed.
    fn submit_read(&self, target: &GattTarget) -> Result<bool>;

    /// Request a characteristic write
    ///
    /// # Errors
    ///
    /// Returns an error when the underlying stack failed.
    fn submit_write(&self, target: &GattTarget, value: &[u8]) -> Result<bool>;

    /// Request a descriptor read (`value == None`) or write
    ///
    /// # Errors
    ///
    /// Returns an error when the underlying stack failed.
    fn submit_descriptor_op(&self, target: &GattTarget, value: Option<&[u8]>) -> Result<bool>;

    /// Enable or disable notifications on a characteristic
    ///
    /// # Errors
    ///
    /// Returns an error when the underlying stack failed.
    fn submit_set_notification(&self, target: &GattTarget, enable: bool) -> Result<bool>;
}

/// Last completion observed for a target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRecord {
    /// Link-wide completion counter value when this completion arrived
    pub sequence: u64,
    /// Reported status
    pub status: GattStatus,
    /// Reported payload
    pub payload: Bytes,
}

struct LinkState {
    queue: OperationQueue,
    connected: bool,
    sequence: u64,
    completions: HashMap<GattTarget, CompletionRecord>,
}

/// Thread-safe handle on the operation queue of one connection
///
/// The transport callback task and caller tasks share a `GattLink` through
/// [`Arc`]; every access to the queue, the connection flag and the completion
/// log goes through one lock.
pub struct GattLink {
    transport: Arc<dyn GattTransport>,
    state: Mutex<LinkState>,
}

impl GattLink {
    /// Create a link over a connected transport
    #[must_use]
    pub fn new(transport: Arc<dyn GattTransport>, config: &QueueConfig) -> Self {
        Self {
            transport,
            state: Mutex::new(LinkState {
                queue: OperationQueue::new(config),
                connected: true,
                sequence: 0,
                completions: HashMap::new(),
            }),
        }
    }

    /// Queue an operation and dispatch it if the link is idle
    ///
    /// # Errors
    ///
    /// Returns [`GadgetError::NotConnected`] while the link is down, or
    /// [`GadgetError::Transport`] when the submission made the transport fail
    /// and the queue was purged.
    pub fn submit(&self, operation: Operation) -> Result<()> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(GadgetError::NotConnected);
        }

        let description = operation.to_string();
        state.queue.enqueue(operation);
        let report = state.queue.pump(self.transport.as_ref());
        if report.purged > 0 {
            return Err(GadgetError::Transport(format!(
                "queue purged while submitting {description}"
            )));
        }
        Ok(())
    }

    /// Feed a completion callback into the queue
    pub fn on_operation_complete(&self, event: &CompletionEvent) -> PumpReport {
        let mut state = self.state.lock();
        state.sequence += 1;
        let record = CompletionRecord {
            sequence: state.sequence,
            status: event.status,
            payload: event.payload.clone(),
        };
        state.completions.insert(event.target, record);
        state
            .queue
            .on_operation_complete(self.transport.as_ref(), &event.target)
    }

    /// Mark the link as connected again
    pub fn on_connected(&self) {
        let mut state = self.state.lock();
        if !state.connected {
            info!("Link connected");
        }
        state.connected = true;
    }

    /// Mark the link as down and drop every queued operation
    pub fn on_disconnected(&self) -> usize {
        let mut state = self.state.lock();
        if state.connected {
            info!("Link disconnected");
        }
        state.connected = false;
        state.queue.on_disconnected()
    }

    /// Periodic pump used to detect stalled operations
    pub fn tick(&self) -> PumpReport {
        let mut state = self.state.lock();
        if !state.connected {
            return PumpReport::default();
        }
        state.queue.pump(self.transport.as_ref())
    }

    /// Discard all queued operations
    pub fn purge(&self) -> usize {
        self.state.lock().queue.purge()
    }

    /// Whether the link is up
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    /// Operations waiting behind the in-flight one
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Whether an operation is in flight
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.state.lock().queue.is_busy()
    }

    /// Number of operations dropped as stalled
    #[must_use]
    pub fn stall_count(&self) -> u64 {
        self.state.lock().queue.stall_count()
    }

    /// Current value of the completion counter
    #[must_use]
    pub fn completion_sequence(&self) -> u64 {
        self.state.lock().sequence
    }

    /// Latest completion for `target` newer than `after`
    #[must_use]
    pub fn completion_after(&self, target: &GattTarget, after: u64) -> Option<CompletionRecord> {
        let state = self.state.lock();
        let record = state.completions.get(target)?;
        if record.sequence > after {
            debug!("Observed completion #{} for {}", record.sequence, target);
            Some(record.clone())
        } else {
            None
        }
    }
}

impl fmt::Debug for GattLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("GattLink")
            .field("connected", &state.connected)
            .field("pending", &state.queue.len())
            .field("busy", &state.queue.is_busy())
            .finish_non_exhaustive()
    }
}
