//! Cache des services découverts, indexé par USN
//!
//! Chaque mutation produit un [`ClientEvent`], diffusé sous le verrou du
//! cache : deux threads de réception ne peuvent pas publier dans le
//! désordre. La diffusion ne bloque jamais (canaux non bornés).

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, info};

use crate::events::{ClientEvent, ClientEventBus};
use crate::service::Service;

/// Effet d'une insertion dans le cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheChange {
    /// Nouvel USN
    Added,
    /// USN connu dont l'annonce a changé (type, adresses, SERVER)
    Updated,
    /// USN connu, seule l'expiration a été repoussée
    Refreshed,
    /// Retiré sur byebye
    Removed,
}

pub struct ServiceCache {
    services: Mutex<HashMap<String, Service>>,
    events: ClientEventBus,
}

impl ServiceCache {
    pub(crate) fn new(events: ClientEventBus) -> Self {
        Self {
            services: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Ajoute ou met à jour un service
    pub fn upsert(&self, service: Service) -> CacheChange {
        let mut services = self.services.lock();
        let (change, event) = match services.get_mut(&service.usn) {
            Some(existing) if existing.same_advertisement(&service) => {
                existing.expiration = service.expiration;
                (CacheChange::Refreshed, None)
            }
            Some(existing) => {
                *existing = service.clone();
                (CacheChange::Updated, Some(ClientEvent::ServiceUpdated(service)))
            }
            None => {
                services.insert(service.usn.clone(), service.clone());
                (CacheChange::Added, Some(ClientEvent::ServiceAdded(service)))
            }
        };

        if let Some(event) = event {
            match change {
                CacheChange::Added => info!(usn = %event.usn(), "✅ Service added"),
                _ => debug!(usn = %event.usn(), "🔄 Service updated"),
            }
            self.events.broadcast(event);
        }
        change
    }

    /// Retire un service (byebye). Un USN inconnu est ignoré.
    pub fn remove(&self, usn: &str) -> Option<Service> {
        let mut services = self.services.lock();
        let removed = services.remove(usn);
        if removed.is_some() {
            info!(usn = %usn, "👋 Service removed");
            self.events
                .broadcast(ClientEvent::ServiceRemoved(usn.to_string()));
        }
        removed
    }

    /// Retire les services expirés à `now`, renvoie leurs USN
    pub fn expire(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut services = self.services.lock();
        let expired: Vec<String> = services
            .values()
            .filter(|s| s.is_expired(now))
            .map(|s| s.usn.clone())
            .collect();

        for usn in &expired {
            services.remove(usn);
            debug!(usn = %usn, "⌛ Service expired");
            self.events
                .broadcast(ClientEvent::ServiceRemoved(usn.clone()));
        }
        expired
    }

    /// Service non expiré pour `usn`
    pub fn get(&self, usn: &str, now: DateTime<Utc>) -> Option<Service> {
        self.services
            .lock()
            .get(usn)
            .filter(|s| !s.is_expired(now))
            .cloned()
    }

    pub fn services(&self, now: DateTime<Utc>) -> Vec<Service> {
        self.services
            .lock()
            .values()
            .filter(|s| !s.is_expired(now))
            .cloned()
            .collect()
    }

    pub fn services_of_type(&self, service_type: &str, now: DateTime<Utc>) -> Vec<Service> {
        self.services
            .lock()
            .values()
            .filter(|s| !s.is_expired(now) && s.service_type == service_type)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.services.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.lock().is_empty()
    }

    /// Vide le cache sans émettre d'événement
    pub(crate) fn clear(&self) {
        self.services.lock().clear();
    }
}
