use parking_lot::Mutex;
use std::collections::VecDeque;
use uuid::Uuid;

use crate::{
    error::{GadgetError, Result},
    link::GattTransport,
    types::{GattTarget, Operation},
};

/// Route `tracing` output through the test harness, once per process
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub(crate) fn target(n: u16) -> GattTarget {
    GattTarget::characteristic(Uuid::from_u128(u128::from(n)))
}

#[derive(Debug, Clone, Copy)]
enum Scripted {
    Reject,
    Fail,
}

/// Records every submission and accepts it unless told otherwise
#[derive(Debug, Default)]
pub(crate) struct ScriptedTransport {
    submitted: Mutex<Vec<Operation>>,
    script: Mutex<VecDeque<Scripted>>,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn reject_next(&self, count: usize) {
        let mut script = self.script.lock();
        script.extend(std::iter::repeat_n(Scripted::Reject, count));
    }

    pub(crate) fn fail_next(&self) {
        self.script.lock().push_back(Scripted::Fail);
    }

    pub(crate) fn submitted(&self) -> Vec<Operation> {
        self.submitted.lock().clone()
    }

    pub(crate) fn last(&self) -> Option<Operation> {
        self.submitted.lock().last().cloned()
    }

    fn record(&self, operation: Operation) -> Result<bool> {
        match self.script.lock().pop_front() {
            Some(Scripted::Reject) => Ok(false),
            Some(Scripted::Fail) => Err(GadgetError::Transport("scripted failure".to_string())),
            None => {
                self.submitted.lock().push(operation);
                Ok(true)
            }
        }
    }
}

impl GattTransport for ScriptedTransport {
    fn submit_read(&self, target: &GattTarget) -> Result<bool> {
        self.record(Operation::read(*target))
    }

    fn submit_write(&self, target: &GattTarget, value: &[u8]) -> Result<bool> {
        self.record(Operation::write(*target, value.to_vec()))
    }

    fn submit_descriptor_op(&self, target: &GattTarget, value: Option<&[u8]>) -> Result<bool> {
        self.record(value.map_or_else(
            || Operation::read_descriptor(*target),
            |value| Operation::write_descriptor(*target, value.to_vec()),
        ))
    }

    fn submit_set_notification(&self, target: &GattTarget, enable: bool) -> Result<bool> {
        self.record(Operation::set_notification(*target, enable))
    }
}
