use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;

use crate::service::Service;

/// Changements du cache de services remontés à l'application.
///
/// Le [`Service`] porté est une copie prise au moment de l'événement. Une
/// ré-annonce identique repousse seulement l'expiration dans le cache sans
/// événement : l'expiration courante se lit avec
/// [`Client::service`](crate::Client::service).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    ServiceAdded(Service),
    ServiceUpdated(Service),
    /// USN du service retiré (byebye ou expiration)
    ServiceRemoved(String),
}

impl ClientEvent {
    pub fn usn(&self) -> &str {
        match self {
            ClientEvent::ServiceAdded(s) | ClientEvent::ServiceUpdated(s) => &s.usn,
            ClientEvent::ServiceRemoved(usn) => usn,
        }
    }
}

#[derive(Clone, Default)]
pub(crate) struct ClientEventBus {
    subscribers: Arc<Mutex<Vec<Sender<ClientEvent>>>>,
}

impl ClientEventBus {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn subscribe(&self) -> Receiver<ClientEvent> {
        let (tx, rx) = unbounded::<ClientEvent>();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Never blocks; the cache calls it while holding its own lock.
    pub(crate) fn broadcast(&self, event: ClientEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub(crate) fn clear(&self) {
        self.subscribers.lock().clear();
    }
}
