use std::{
    collections::BTreeMap,
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};
use tracing::error;

use crate::types::{DownloadPhase, Sample};

/// Receives readings and history download events
///
/// All methods default to doing nothing. They are called from the transport
/// callback task while the session is locked, so implementations must not call
/// back into the session.
pub trait GadgetListener: Send + Sync {
    /// A live or historical sample was decoded
    fn on_sample_received(&self, _sample: &Sample) {}

    /// Download progress changed, in percent
    fn on_download_progress(&self, _percent: u8) {}

    /// Download finished with all (or nearly all) samples
    fn on_download_complete(&self) {}

    /// Download aborted
    fn on_download_failed(&self) {}

    /// Device had nothing logged
    fn on_download_no_data(&self) {}

    /// Download moved to another phase
    fn on_phase_changed(&self, _phase: DownloadPhase) {}
}

/// Handle returned by [`ListenerSet::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(u64);

/// Registered listeners, in subscription order
#[derive(Default)]
pub struct ListenerSet {
    next_id: u64,
    listeners: BTreeMap<ListenerId, Arc<dyn GadgetListener>>,
}

impl ListenerSet {
    /// Create an empty set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener
    pub fn subscribe(&mut self, listener: Arc<dyn GadgetListener>) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.listeners.insert(id, listener);
        id
    }

    /// Remove a listener, returning whether it was registered
    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        self.listeners.remove(&id).is_some()
    }

    /// Number of registered listeners
    #[must_use]
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    /// True when nobody listens
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Call `deliver` on every listener
    ///
    /// A listener that panics is logged and skipped; it stays registered and
    /// the remaining listeners still receive the event.
    pub fn notify(&self, event: &str, deliver: impl Fn(&dyn GadgetListener)) {
        for (id, listener) in &self.listeners {
            let outcome = catch_unwind(AssertUnwindSafe(|| deliver(listener.as_ref())));
            if outcome.is_err() {
                error!("Listener {:?} panicked while handling {}", id, event);
            }
        }
    }
}

impl fmt::Debug for ListenerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerSet")
            .field("listeners", &self.listeners.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}


#[cfg(test)]
mod tests {
    use super::recording::RecordingListener;
    use super::*;
    use crate::types::SensorUnit;

    struct Panicking;

    impl GadgetListener for Panicking {
        fn on_sample_received(&self, _sample: &Sample) {
            panic!("listener bug");
        }
    }

    #[test]
    fn test_subscribe_and_unsubscribe() {
        let mut set = ListenerSet::new();
        let first = set.subscribe(Arc::new(RecordingListener::default()));
        let second = set.subscribe(Arc::new(RecordingListener::default()));

        assert_ne!(first, second);
        assert_eq!(set.len(), 2);
        assert!(set.unsubscribe(first));
        assert!(!set.unsubscribe(first));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_panicking_listener_does_not_stop_delivery() {
        let mut set = ListenerSet::new();
        let recorder = Arc::new(RecordingListener::default());
        set.subscribe(Arc::new(Panicking));
        set.subscribe(recorder.clone());

        let sample = Sample::new(50.0, SensorUnit::RelativeHumidity, 0, "humidity");
        set.notify("sample", |listener| listener.on_sample_received(&sample));

        assert_eq!(recorder.samples(), vec![sample]);
        assert_eq!(set.len(), 2);
    }
}
