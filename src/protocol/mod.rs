pub mod ports;
pub mod process;
pub mod registration;
pub mod serial;

use flume::Sender;

/// A collaborator event tagged with the attempt it was started under, so the
/// workflow can drop late events from a run that has since been reset.
#[derive(Debug, Clone, PartialEq)]
pub struct Stamped<E> {
    pub attempt: u64,
    pub event: E,
}

impl<E> Stamped<E> {
    pub fn new(attempt: u64, event: E) -> Self {
        Self { attempt, event }
    }
}

/// Sending half handed to a worker context for one attempt.
#[derive(Debug)]
pub(crate) struct Emitter<E> {
    tx: Sender<Stamped<E>>,
    attempt: u64,
}

impl<E> Clone for Emitter<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            attempt: self.attempt,
        }
    }
}

impl<E> Emitter<E> {
    pub(crate) fn new(tx: Sender<Stamped<E>>, attempt: u64) -> Self {
        Self { tx, attempt }
    }

    pub(crate) fn emit(&self, event: E) {
        if self.tx.send(Stamped::new(self.attempt, event)).is_err() {
            log::debug!("Event receiver dropped (attempt {})", self.attempt);
        }
    }
}
