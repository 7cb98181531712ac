//! Serveur SSDP
//!
//! Le [`Server`] possède les announcers (indexés par nom), le dispatcher de
//! timeouts qu'ils partagent et deux sockets communs :
//!
//! * un socket multicast pour les `NOTIFY` alive / byebye;
//! * un socket lié au port 1900 qui reçoit les `M-SEARCH` et sert à
//!   répondre en unicast.
//!
//! Le verrou du serveur n'est jamais tenu pendant un appel vers un
//! announcer : les announcers, eux, peuvent appeler le serveur en tenant
//! leur propre verrou.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use crate::announcer::Announcer;
use crate::config::SsdpConfig;
use crate::dispatcher::TimeoutDispatcher;
use crate::error::{Result, SsdpError};
use crate::listener::Listener;
use crate::message::{HttpuMessage, MessageKind, SSDP_ALL, strip_uuid};
use crate::multicast_endpoint;
use crate::socket::{Transport, TransportFactory, UdpTransportFactory, closed_error};

#[derive(Default)]
struct ServerState {
    announcers: BTreeMap<String, Arc<Announcer>>,
    announce_socket: Option<Arc<dyn Transport>>,
    search_listener: Option<Listener>,
    disposed: bool,
}

pub(crate) struct ServerInner {
    config: SsdpConfig,
    factory: Arc<dyn TransportFactory>,
    dispatcher: TimeoutDispatcher,
    state: Mutex<ServerState>,
}

impl ServerInner {
    pub(crate) fn config(&self) -> &SsdpConfig {
        &self.config
    }

    pub(crate) fn dispatcher(&self) -> &TimeoutDispatcher {
        &self.dispatcher
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    fn is_started(&self) -> bool {
        self.state.lock().announce_socket.is_some()
    }

    /// Ouvre les sockets communs s'ils ne le sont pas déjà
    pub(crate) fn ensure_started(self: &Arc<Self>) -> Result<()> {
        let mut state = self.state.lock();
        if state.disposed {
            return Err(SsdpError::disposed("SSDP server"));
        }
        if state.announce_socket.is_some() {
            return Ok(());
        }

        let announce_socket = self.factory.multicast()?;
        let weak = Arc::downgrade(self);
        let search_listener = Listener::start(
            "server",
            self.factory.listener()?,
            move |message, from| {
                if let Some(server) = weak.upgrade() {
                    server.handle_message(&message, from);
                }
            },
        );
        let search_listener = match search_listener {
            Ok(listener) => listener,
            Err(e) => {
                announce_socket.close();
                return Err(e);
            }
        };

        state.announce_socket = Some(announce_socket);
        state.search_listener = Some(search_listener);
        info!("✅ SSDP server started on {}", multicast_endpoint());
        Ok(())
    }

    /// Ferme les sockets communs
    fn release_sockets(&self) {
        let (announce_socket, search_listener) = {
            let mut state = self.state.lock();
            (state.announce_socket.take(), state.search_listener.take())
        };
        if let Some(socket) = announce_socket {
            socket.close();
        }
        if let Some(listener) = search_listener {
            listener.close();
            info!("SSDP server sockets released");
        }
    }

    pub(crate) fn send_multicast(&self, message: &HttpuMessage) -> io::Result<()> {
        let socket = self.state.lock().announce_socket.clone();
        match socket {
            Some(socket) => socket.send_to(&message.to_bytes(), multicast_endpoint()),
            None => Err(closed_error()),
        }
    }

    pub(crate) fn send_unicast(&self, message: &HttpuMessage, dest: SocketAddr) -> io::Result<()> {
        let socket = self
            .state
            .lock()
            .search_listener
            .as_ref()
            .map(|l| Arc::clone(l.transport()));
        match socket {
            Some(socket) => socket.send_to(&message.to_bytes(), dest),
            None => Err(closed_error()),
        }
    }

    fn announcers(&self) -> Vec<Arc<Announcer>> {
        self.state.lock().announcers.values().cloned().collect()
    }

    fn handle_message(&self, message: &HttpuMessage, from: SocketAddr) {
        if message.kind() == MessageKind::Search {
            self.handle_search(message, from);
        }
    }

    /// Sélectionne les announcers concernés par un M-SEARCH et programme
    /// leurs réponses
    fn handle_search(&self, message: &HttpuMessage, from: SocketAddr) {
        let headers = &message.headers;

        let man = headers.get("MAN").unwrap_or_default();
        if !man.trim().trim_matches('"').eq_ignore_ascii_case("ssdp:discover") {
            trace!(%from, man, "Ignoring M-SEARCH with unexpected MAN");
            return;
        }
        let Some(st) = headers.get_non_empty("ST") else {
            trace!(%from, "Ignoring M-SEARCH without ST");
            return;
        };
        let mx = match headers.get_non_empty("MX").map(str::parse::<u32>) {
            Some(Ok(mx)) => mx,
            _ if self.config.strict_protocol => {
                warn!(%from, st, "❌ Rejecting M-SEARCH without a valid MX");
                return;
            }
            _ => self.config.default_mx,
        };

        let matches = self.matching_announcers(st);
        debug!(%from, st, mx, matches = matches.len(), "M-SEARCH received");

        for announcer in matches {
            if let Err(e) = announcer.respond(from, mx) {
                debug!(usn = %announcer.usn(), "M-SEARCH response not scheduled: {}", e);
            }
        }
    }

    /// `ssdp:all` → tous; `uuid:<prefix>` → noms commençant par le préfixe;
    /// sinon type exact. Seuls les announcers démarrés répondent.
    fn matching_announcers(&self, st: &str) -> Vec<Arc<Announcer>> {
        let st = st.trim();
        let uuid_prefix = match st.get(..5) {
            Some(prefix) if prefix.eq_ignore_ascii_case("uuid:") => {
                Some(strip_uuid(st).to_ascii_lowercase())
            }
            _ => None,
        };

        self.announcers()
            .into_iter()
            .filter(|a| a.is_started())
            .filter(|a| {
                if st == SSDP_ALL {
                    true
                } else if let Some(prefix) = &uuid_prefix {
                    strip_uuid(a.name()).to_ascii_lowercase().starts_with(prefix.as_str())
                } else {
                    a.service_type() == st
                }
            })
            .collect()
    }
}

/// Serveur SSDP gérant les annonces et les réponses aux recherches
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Serveur sur de vrais sockets UDP
    pub fn new(config: SsdpConfig) -> Result<Self> {
        let config = config.checked()?;
        let factory = Arc::new(UdpTransportFactory::new(config.clone()));
        Self::with_factory(config, factory)
    }

    pub fn with_factory(config: SsdpConfig, factory: Arc<dyn TransportFactory>) -> Result<Self> {
        let config = config.checked()?;
        Ok(Self {
            inner: Arc::new(ServerInner {
                dispatcher: TimeoutDispatcher::new("ssdp-server")?,
                config,
                factory,
                state: Mutex::new(ServerState::default()),
            }),
        })
    }

    pub fn config(&self) -> &SsdpConfig {
        &self.inner.config
    }

    /// Enregistre un service à annoncer.
    ///
    /// Un nom déjà enregistré renvoie l'announcer existant, inchangé : les
    /// autres arguments sont alors ignorés. `max_age` est ramené au moins à
    /// `default_max_age`.
    pub fn announce(
        &self,
        service_type: &str,
        name: &str,
        location: &str,
        max_age: u32,
    ) -> Result<Arc<Announcer>> {
        if service_type.trim().is_empty() {
            return Err(SsdpError::invalid_argument("service type must not be empty"));
        }
        if name.trim().is_empty() {
            return Err(SsdpError::invalid_argument("announcer name must not be empty"));
        }
        if location.trim().is_empty() {
            return Err(SsdpError::invalid_argument("location must not be empty"));
        }

        let mut state = self.inner.state.lock();
        if state.disposed {
            return Err(SsdpError::disposed("SSDP server"));
        }
        if let Some(existing) = state.announcers.get(name) {
            return Ok(Arc::clone(existing));
        }

        let announcer = Arc::new(Announcer::new(
            service_type,
            name,
            location,
            max_age.max(self.inner.config.default_max_age).max(1),
            Arc::downgrade(&self.inner),
        ));
        state
            .announcers
            .insert(name.to_string(), Arc::clone(&announcer));
        debug!(usn = %announcer.usn(), location, "Announcer registered");
        Ok(announcer)
    }

    pub fn announcer(&self, name: &str) -> Option<Arc<Announcer>> {
        self.inner.state.lock().announcers.get(name).cloned()
    }

    /// Announcers triés par nom
    pub fn announcers(&self) -> Vec<Arc<Announcer>> {
        self.inner.announcers()
    }

    /// Arrête (byebye) puis oublie un announcer
    pub fn remove(&self, name: &str) -> Result<Option<Arc<Announcer>>> {
        let Some(announcer) = self.announcer(name) else {
            return Ok(None);
        };
        announcer.stop()?;
        let removed = self.inner.state.lock().announcers.remove(name);
        if let Some(removed) = &removed {
            removed.detach();
        }
        Ok(removed)
    }

    /// Ouvre les sockets partagés; démarre aussi les announcers qui ne le
    /// sont pas si `start_announcers` est vrai.
    pub fn start(&self, start_announcers: bool) -> Result<()> {
        self.inner.ensure_started()?;
        if !start_announcers {
            return Ok(());
        }
        for announcer in self.inner.announcers() {
            match announcer.start() {
                Ok(()) | Err(SsdpError::AlreadyStarted(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Libère les sockets; arrête d'abord les announcers si demandé.
    ///
    /// Les byebye sont émis en parallèle puis attendus tous ensemble.
    /// Des announcers laissés démarrés reprennent leurs envois au prochain
    /// `start`.
    pub fn stop(&self, stop_announcers: bool) -> Result<()> {
        if self.inner.is_disposed() {
            return Err(SsdpError::disposed("SSDP server"));
        }

        if stop_announcers {
            let mut pending = Vec::new();
            for announcer in self.inner.announcers() {
                match announcer.stop_async() {
                    Ok(handle) => pending.push(handle),
                    Err(e) => warn!(usn = %announcer.usn(), "❌ Failed to stop announcer: {}", e),
                }
            }
            for handle in pending {
                handle.wait();
            }
        }

        self.inner.release_sockets();
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.inner.is_started()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    /// Arrête tout, oublie les announcers et arrête le dispatcher.
    /// Toute opération ultérieure échoue avec [`SsdpError::Disposed`].
    pub fn dispose(&self) {
        if self.inner.is_disposed() {
            return;
        }
        if let Err(e) = self.stop(true) {
            debug!("SSDP server stop during dispose: {}", e);
        }

        let announcers = {
            let mut state = self.inner.state.lock();
            state.disposed = true;
            std::mem::take(&mut state.announcers)
        };
        for announcer in announcers.values() {
            announcer.detach();
        }
        self.inner.dispatcher.dispose();
        info!("SSDP server disposed");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.dispose();
    }
}
