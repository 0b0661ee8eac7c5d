//! Change-event fan-out, generalized from the teacher's `CompositeMutationObserver`
//! (a storage-layer hook fanning out to every registered observer) into a
//! per-document hook owned by the [`DocumentStore`](super::DocumentStore).

use std::sync::Arc;

use sync_core::model::Origin;

use super::ChangeEvent;

/// Receives every committed change to a document, local or remote.
pub trait ChangeObserver: Send + Sync {
    fn on_change(&self, event: &ChangeEvent, origin: Origin);
}

/// Fans a single change out to every registered observer, in registration order.
#[derive(Default)]
pub struct CompositeChangeObserver {
    observers: Vec<Arc<dyn ChangeObserver>>,
}

impl CompositeChangeObserver {
    #[must_use]
    pub fn new() -> Self {
        Self { observers: Vec::new() }
    }

    pub fn add(&mut self, observer: Arc<dyn ChangeObserver>) {
        self.observers.push(observer);
    }

    pub fn notify(&self, event: &ChangeEvent, origin: Origin) {
        for observer in &self.observers {
            observer.on_change(event, origin);
        }
    }
}
