//! Client SSDP (control point)
//!
//! Le [`Client`] regroupe :
//!
//! * les [`Browser`]s, un par type de service recherché;
//! * un listener passif sur le port 1900 pour les `NOTIFY` alive / byebye
//!   spontanés, indépendant de toute recherche;
//! * le cache des services découverts et un balayage périodique de
//!   leurs expirations;
//! * la diffusion des [`ClientEvent`]s aux abonnés.
//!
//! ```no_run
//! use pmossdp::{Client, ClientEvent, SsdpConfig};
//!
//! let client = Client::new(SsdpConfig::default())?;
//! let events = client.subscribe();
//! client.browse("ssdp:all")?.start()?;
//!
//! for event in events.iter() {
//!     if let ClientEvent::ServiceAdded(service) = event {
//!         println!("{} at {}", service.usn, service.location());
//!     }
//! }
//! # Ok::<(), pmossdp::SsdpError>(())
//! ```

use chrono::Utc;
use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use crate::browser::{BrowseOptions, Browser};
use crate::cache::{CacheChange, ServiceCache};
use crate::config::SsdpConfig;
use crate::dispatcher::{Rearm, TimeoutDispatcher, TimeoutHandle};
use crate::error::{Result, SsdpError, ValidationError};
use crate::events::{ClientEvent, ClientEventBus};
use crate::listener::Listener;
use crate::message::{HttpuMessage, MessageKind, NotifySubtype};
use crate::service::Service;
use crate::socket::{TransportFactory, UdpTransportFactory};

#[derive(Default)]
struct ClientState {
    started: bool,
    disposed: bool,
    browsers: HashMap<String, Arc<Browser>>,
    notify_listener: Option<Listener>,
    sweep_timer: Option<TimeoutHandle>,
}

pub(crate) struct ClientInner {
    config: SsdpConfig,
    factory: Arc<dyn TransportFactory>,
    dispatcher: TimeoutDispatcher,
    cache: ServiceCache,
    events: ClientEventBus,
    state: Mutex<ClientState>,
}

impl ClientInner {
    pub(crate) fn config(&self) -> &SsdpConfig {
        &self.config
    }

    pub(crate) fn factory(&self) -> &Arc<dyn TransportFactory> {
        &self.factory
    }

    pub(crate) fn dispatcher(&self) -> &TimeoutDispatcher {
        &self.dispatcher
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    /// Ouvre le listener de notifications et arme le balayage du cache
    pub(crate) fn ensure_started(self: &Arc<Self>) -> Result<()> {
        let mut state = self.state.lock();
        if state.disposed {
            return Err(SsdpError::disposed("SSDP client"));
        }
        if state.started {
            return Ok(());
        }

        let weak = Arc::downgrade(self);
        let notify_listener = self
            .factory
            .listener()
            .map_err(SsdpError::from)
            .and_then(|transport| {
                Listener::start("notify", transport, move |message, from| {
                    if let Some(client) = weak.upgrade() {
                        client.handle_received(&message, from);
                    }
                })
            });
        match notify_listener {
            Ok(listener) => state.notify_listener = Some(listener),
            // searching still works without passive notifications
            Err(e) => warn!("❌ SSDP notify listener unavailable: {}", e),
        }

        let weak = Arc::downgrade(self);
        let sweep = self
            .dispatcher
            .add(self.config.cache_sweep_interval(), move |interval| {
                match weak.upgrade() {
                    Some(client) => {
                        let expired = client.cache.expire(Utc::now());
                        if !expired.is_empty() {
                            debug!(count = expired.len(), "⌛ Expired services swept");
                        }
                        Rearm::After(interval)
                    }
                    None => Rearm::Cancel,
                }
            });
        match sweep {
            Ok(timer) => state.sweep_timer = Some(timer),
            Err(e) => {
                if let Some(listener) = state.notify_listener.take() {
                    listener.close();
                }
                return Err(e);
            }
        }

        state.started = true;
        info!("✅ SSDP client started");
        Ok(())
    }

    /// Datagramme reçu par un browser ou le listener de notifications.
    /// Les erreurs sont journalisées, jamais propagées à la boucle de réception.
    pub(crate) fn handle_received(&self, message: &HttpuMessage, from: SocketAddr) {
        match self.handle_message(message) {
            Ok(Some(change)) => trace!(%from, ?change, "Service cache updated"),
            Ok(None) => {}
            Err(e @ SsdpError::StrictProtocol(_)) => warn!(%from, "❌ {}", e),
            Err(e) if e.is_protocol_error() => debug!(%from, "Dropping datagram: {}", e),
            Err(e) => warn!(%from, "❌ Failed to handle datagram: {}", e),
        }
    }

    fn handle_message(&self, message: &HttpuMessage) -> Result<Option<CacheChange>> {
        if self.is_disposed() {
            return Ok(None);
        }
        match message.kind() {
            MessageKind::Notify(NotifySubtype::ByeBye) => {
                let usn = message
                    .headers
                    .get_non_empty("USN")
                    .ok_or(ValidationError::MissingHeader("USN"))?;
                Ok(self.cache.remove(usn).map(|_| CacheChange::Removed))
            }
            MessageKind::Notify(NotifySubtype::Alive) | MessageKind::SearchResponse => {
                let service = Service::from_message(message, &self.config, Utc::now())?;
                Ok(Some(self.cache.upsert(service)))
            }
            // other control points searching, ssdp:update, error responses
            _ => Ok(None),
        }
    }

    pub(crate) fn forget_browser(&self, browser: &Arc<Browser>) {
        let mut state = self.state.lock();
        if state
            .browsers
            .get(browser.service_type())
            .is_some_and(|b| Arc::ptr_eq(b, browser))
        {
            state.browsers.remove(browser.service_type());
        }
    }

    fn browsers(&self) -> Vec<Arc<Browser>> {
        self.state.lock().browsers.values().cloned().collect()
    }

    fn stop(&self) {
        for browser in self.browsers() {
            browser.stop();
        }

        let (listener, timer) = {
            let mut state = self.state.lock();
            state.started = false;
            (state.notify_listener.take(), state.sweep_timer.take())
        };
        if let Some(timer) = timer {
            self.dispatcher.remove(timer);
        }
        if let Some(listener) = listener {
            listener.close();
            info!("SSDP client stopped");
        }
    }
}

/// Client SSDP : recherches, écoute passive et cache des services
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Client sur de vrais sockets UDP
    pub fn new(config: SsdpConfig) -> Result<Self> {
        let config = config.checked()?;
        let factory = Arc::new(UdpTransportFactory::new(config.clone()));
        Self::with_factory(config, factory)
    }

    pub fn with_factory(config: SsdpConfig, factory: Arc<dyn TransportFactory>) -> Result<Self> {
        let config = config.checked()?;
        let events = ClientEventBus::new();
        Ok(Self {
            inner: Arc::new(ClientInner {
                dispatcher: TimeoutDispatcher::new("ssdp-client")?,
                cache: ServiceCache::new(events.clone()),
                events,
                config,
                factory,
                state: Mutex::new(ClientState::default()),
            }),
        })
    }

    pub fn config(&self) -> &SsdpConfig {
        &self.inner.config
    }

    /// Browser pour `service_type` avec les options par défaut.
    ///
    /// Un type déjà demandé renvoie le browser existant. Le browser n'est
    /// pas démarré.
    pub fn browse(&self, service_type: &str) -> Result<Arc<Browser>> {
        self.browse_with(service_type, BrowseOptions::default())
    }

    /// Comme [`browse`](Self::browse); les options ne s'appliquent qu'à la
    /// création du browser
    pub fn browse_with(&self, service_type: &str, options: BrowseOptions) -> Result<Arc<Browser>> {
        if service_type.trim().is_empty() {
            return Err(SsdpError::invalid_argument("service type must not be empty"));
        }

        let mut state = self.inner.state.lock();
        if state.disposed {
            return Err(SsdpError::disposed("SSDP client"));
        }
        if let Some(existing) = state.browsers.get(service_type) {
            return Ok(Arc::clone(existing));
        }

        let config = &self.inner.config;
        let mx = config.clamp_mx(options.mx.unwrap_or(config.default_mx));
        let browser = Arc::new(Browser::new(
            service_type,
            mx,
            options.auto_stop,
            Arc::downgrade(&self.inner),
        ));
        state
            .browsers
            .insert(service_type.to_string(), Arc::clone(&browser));
        debug!(st = service_type, mx, auto_stop = options.auto_stop, "Browser created");
        Ok(browser)
    }

    pub fn browser(&self, service_type: &str) -> Option<Arc<Browser>> {
        self.inner.state.lock().browsers.get(service_type).cloned()
    }

    pub fn browsers(&self) -> Vec<Arc<Browser>> {
        self.inner.browsers()
    }

    /// Démarre l'écoute passive des notifications; sans effet si déjà démarré
    pub fn start(&self) -> Result<()> {
        self.inner.ensure_started()
    }

    /// Arrête les browsers et l'écoute passive; le cache est conservé
    pub fn stop(&self) {
        self.inner.stop();
    }

    pub fn is_started(&self) -> bool {
        self.inner.state.lock().started
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    /// Arrête et libère browsers, cache et abonnements
    pub fn dispose(&self) {
        if self.inner.is_disposed() {
            return;
        }
        self.inner.stop();

        let browsers = {
            let mut state = self.inner.state.lock();
            state.disposed = true;
            std::mem::take(&mut state.browsers)
        };
        for browser in browsers.values() {
            browser.dispose();
        }

        self.inner.cache.clear();
        self.inner.events.clear();
        self.inner.dispatcher.dispose();
        info!("SSDP client disposed");
    }

    /// Nouveau flux d'événements; chaque abonné reçoit tous les événements
    pub fn subscribe(&self) -> Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.events.subscriber_count()
    }

    /// Services non expirés
    pub fn services(&self) -> Vec<Service> {
        self.inner.cache.services(Utc::now())
    }

    pub fn service(&self, usn: &str) -> Option<Service> {
        self.inner.cache.get(usn, Utc::now())
    }

    pub fn services_of_type(&self, service_type: &str) -> Vec<Service> {
        self.inner.cache.services_of_type(service_type, Utc::now())
    }

    /// Traite un datagramme brut comme s'il avait été reçu du réseau
    pub fn handle_datagram(&self, data: &[u8]) -> Result<Option<CacheChange>> {
        let message = HttpuMessage::parse(data)?;
        self.inner.handle_message(&message)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.dispose();
    }
}
