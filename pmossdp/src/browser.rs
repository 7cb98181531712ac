//! Recherche active d'un type de service
//!
//! Un [`Browser`] ouvre son propre socket multicast (port éphémère), émet un
//! `M-SEARCH` puis reçoit les réponses unicast jusqu'à son arrêt. Chaque
//! réponse valide alimente le cache du [`Client`](crate::Client)
//! propriétaire.

use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::client::ClientInner;
use crate::dispatcher::{Rearm, TimeoutHandle};
use crate::error::{Result, SsdpError};
use crate::listener::Listener;
use crate::message::search_request;
use crate::multicast_endpoint;

/// Attente avant arrêt automatique : trois fois le MX
pub fn auto_stop_delay(mx: u32) -> Duration {
    Duration::from_secs(u64::from(mx) * 3)
}

/// Options d'un [`Browser`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrowseOptions {
    /// MX annoncé; `default_mx` de la configuration si absent
    pub mx: Option<u32>,
    /// Arrêt automatique après `3 * mx` secondes
    pub auto_stop: bool,
}

#[derive(Default)]
struct BrowserState {
    listener: Option<Listener>,
    auto_stop_timer: Option<TimeoutHandle>,
    disposed: bool,
}

/// Recherche en cours pour un type de service
pub struct Browser {
    service_type: String,
    mx: u32,
    auto_stop: bool,
    state: Mutex<BrowserState>,
    client: Weak<ClientInner>,
}

impl fmt::Debug for Browser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Browser")
            .field("service_type", &self.service_type)
            .field("mx", &self.mx)
            .field("auto_stop", &self.auto_stop)
            .field("started", &self.is_started())
            .finish()
    }
}

impl Browser {
    /// `mx` doit déjà être plafonné
    pub(crate) fn new(
        service_type: &str,
        mx: u32,
        auto_stop: bool,
        client: Weak<ClientInner>,
    ) -> Self {
        Self {
            service_type: service_type.to_string(),
            mx,
            auto_stop,
            state: Mutex::new(BrowserState::default()),
            client,
        }
    }

    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    pub fn mx(&self) -> u32 {
        self.mx
    }

    pub fn auto_stop(&self) -> bool {
        self.auto_stop
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().listener.is_some()
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    fn client(&self) -> Result<Arc<ClientInner>> {
        let what = || format!("browser {}", self.service_type);
        if self.is_disposed() {
            return Err(SsdpError::disposed(what()));
        }
        match self.client.upgrade() {
            Some(client) if !client.is_disposed() => Ok(client),
            _ => Err(SsdpError::disposed(what())),
        }
    }

    /// Ouvre le socket, émet le M-SEARCH et commence à recevoir.
    ///
    /// Démarre le client propriétaire si besoin.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.service_type.trim().is_empty() {
            return Err(SsdpError::invalid_argument("service type must not be empty"));
        }
        let client = self.client()?;
        if self.is_started() {
            return Err(SsdpError::already_started(format!("browser {}", self.service_type)));
        }
        client.ensure_started()?;

        let mut state = self.state.lock();
        if state.listener.is_some() {
            return Err(SsdpError::already_started(format!("browser {}", self.service_type)));
        }

        let weak_client = Arc::downgrade(&client);
        let transport = client.factory().multicast()?;
        let listener = Listener::start("browser", transport, move |message, from| {
            if let Some(client) = weak_client.upgrade() {
                client.handle_received(&message, from);
            }
        })?;

        let search = search_request(&self.service_type, self.mx, &client.config().server_header);
        match listener.transport().send_to(&search.to_bytes(), multicast_endpoint()) {
            Ok(()) => debug!(st = %self.service_type, mx = self.mx, "📤 M-SEARCH sent"),
            Err(e) => warn!(st = %self.service_type, "❌ Failed to send M-SEARCH: {}", e),
        }

        if self.auto_stop {
            let weak = Arc::downgrade(self);
            let timer = client.dispatcher().add(auto_stop_delay(self.mx), move |_| {
                if let Some(browser) = weak.upgrade() {
                    debug!(st = %browser.service_type, "Browser auto-stop");
                    browser.stop();
                }
                Rearm::Cancel
            });
            match timer {
                Ok(timer) => state.auto_stop_timer = Some(timer),
                Err(e) => {
                    listener.close();
                    return Err(e);
                }
            }
        }

        state.listener = Some(listener);
        info!(st = %self.service_type, "🔍 Browser started");
        Ok(())
    }

    /// Annule l'arrêt automatique et ferme le socket. Sans effet si arrêté.
    pub fn stop(&self) {
        let (listener, timer) = {
            let mut state = self.state.lock();
            (state.listener.take(), state.auto_stop_timer.take())
        };

        if let Some(timer) = timer {
            if let Some(client) = self.client.upgrade() {
                client.dispatcher().remove(timer);
            }
        }
        if let Some(listener) = listener {
            listener.close();
            info!(st = %self.service_type, "Browser stopped");
        }
    }

    /// Arrête le browser et le retire de son client
    pub fn dispose(self: &Arc<Self>) {
        self.stop();
        self.state.lock().disposed = true;
        if let Some(client) = self.client.upgrade() {
            client.forget_browser(self);
        }
    }
}
