//! Annonce d'un service
//!
//! Un [`Announcer`] publie un service sur le réseau :
//!
//! * `NOTIFY ssdp:alive` au démarrage puis à intervalle aléatoire dans
//!   `[0, max_age / 2]` (chaque cycle tire un nouvel intervalle);
//! * réponse unicast différée aux `M-SEARCH` qui le concernent;
//! * `NOTIFY ssdp:byebye` à l'arrêt.
//!
//! Cycle de vie : `Created → Started → Stopping → Stopped`, un announcer
//! arrêté peut être redémarré.

use chrono::Utc;
use crossbeam_channel::{Receiver, bounded};
use parking_lot::Mutex;
use rand::Rng;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::dispatcher::{Rearm, TimeoutHandle};
use crate::error::{Result, SsdpError};
use crate::message::{HttpuMessage, format_usn, notify_alive, notify_byebye, search_response};
use crate::server::ServerInner;
use crate::socket::is_cancellation;

/// État d'un [`Announcer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnouncerPhase {
    Created,
    Started,
    /// Timer annulé, byebye en cours d'émission
    Stopping,
    Stopped,
}

struct AnnouncerState {
    phase: AnnouncerPhase,
    location: String,
    timer: Option<TimeoutHandle>,
    /// Complétion du byebye en cours; se déconnecte une fois envoyé
    stopping: Option<Receiver<()>>,
    /// Retiré de son serveur
    detached: bool,
}

/// Service annoncé, possédé par un [`Server`](crate::Server)
pub struct Announcer {
    name: String,
    service_type: String,
    usn: String,
    max_age: u32,
    state: Mutex<AnnouncerState>,
    server: Weak<ServerInner>,
}

impl fmt::Debug for Announcer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Announcer")
            .field("usn", &self.usn)
            .field("max_age", &self.max_age)
            .field("phase", &self.phase())
            .finish()
    }
}

/// Intervalle de ré-annonce : uniforme dans `[0, max_age * 1000 / 2]` ms
pub fn reannounce_interval(max_age: u32) -> Duration {
    let upper = u64::from(max_age) * 1000 / 2;
    Duration::from_millis(rand::rng().random_range(0..=upper))
}

/// Délai de réponse à un M-SEARCH : uniforme dans `[0, min(mx, max_mx)]` s,
/// à la milliseconde près
pub fn response_delay(mx: u32, max_mx: u32) -> Duration {
    let upper = u64::from(mx.min(max_mx)) * 1000;
    Duration::from_millis(rand::rng().random_range(0..=upper))
}

/// Attente de la fin d'un arrêt asynchrone
#[derive(Debug)]
pub struct StopHandle {
    done: Option<Receiver<()>>,
}

impl StopHandle {
    fn completed() -> Self {
        Self { done: None }
    }

    /// Bloque jusqu'à l'émission du byebye
    pub fn wait(self) {
        if let Some(done) = self.done {
            // the sender is dropped, never used: disconnection means done
            let _ = done.recv();
        }
    }

    pub fn is_done(&self) -> bool {
        match &self.done {
            None => true,
            Some(done) => matches!(
                done.try_recv(),
                Err(crossbeam_channel::TryRecvError::Disconnected)
            ),
        }
    }
}

impl Announcer {
    pub(crate) fn new(
        service_type: &str,
        name: &str,
        location: &str,
        max_age: u32,
        server: Weak<ServerInner>,
    ) -> Self {
        Self {
            name: name.to_string(),
            service_type: service_type.to_string(),
            usn: format_usn(name, service_type),
            max_age,
            state: Mutex::new(AnnouncerState {
                phase: AnnouncerPhase::Created,
                location: location.to_string(),
                timer: None,
                stopping: None,
                detached: false,
            }),
            server,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    pub fn usn(&self) -> &str {
        &self.usn
    }

    pub fn max_age(&self) -> u32 {
        self.max_age
    }

    pub fn location(&self) -> String {
        self.state.lock().location.clone()
    }

    pub fn phase(&self) -> AnnouncerPhase {
        self.state.lock().phase
    }

    pub fn is_started(&self) -> bool {
        self.phase() == AnnouncerPhase::Started
    }

    /// Serveur propriétaire, s'il n'a pas été disposé
    fn server(&self) -> Result<Arc<ServerInner>> {
        let what = || format!("announcer {}", self.usn);
        if self.state.lock().detached {
            return Err(SsdpError::disposed(what()));
        }
        match self.server.upgrade() {
            Some(server) if !server.is_disposed() => Ok(server),
            _ => Err(SsdpError::disposed(what())),
        }
    }

    /// Démarre l'annonce : alive immédiat puis ré-annonces périodiques.
    ///
    /// Démarre le serveur propriétaire si besoin.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let server = self.server()?;

        let previous = {
            let mut state = self.state.lock();
            match state.phase {
                AnnouncerPhase::Started | AnnouncerPhase::Stopping => {
                    return Err(SsdpError::already_started(format!("announcer {}", self.usn)));
                }
                previous => {
                    state.phase = AnnouncerPhase::Started;
                    previous
                }
            }
        };

        if let Err(e) = server.ensure_started() {
            self.state.lock().phase = previous;
            return Err(e);
        }

        {
            let state = self.state.lock();
            if state.phase != AnnouncerPhase::Started {
                // stopped concurrently
                return Ok(());
            }
            self.send_alive(&server, &state.location);
        }

        let weak = Arc::downgrade(self);
        let timer = server
            .dispatcher()
            .add(reannounce_interval(self.max_age), move |_| {
                match weak.upgrade() {
                    Some(announcer) => announcer.reannounce(),
                    None => Rearm::Cancel,
                }
            });
        let timer = match timer {
            Ok(timer) => timer,
            Err(e) => {
                let mut state = self.state.lock();
                if state.phase == AnnouncerPhase::Started {
                    state.phase = previous;
                }
                return Err(e);
            }
        };

        let mut state = self.state.lock();
        if state.phase == AnnouncerPhase::Started && state.timer.is_none() {
            state.timer = Some(timer);
        } else {
            drop(state);
            server.dispatcher().remove(timer);
        }

        info!(usn = %self.usn, "✅ Announcer started");
        Ok(())
    }

    /// Firing of the recurring timer
    fn reannounce(&self) -> Rearm {
        let Ok(server) = self.server() else {
            return Rearm::Cancel;
        };
        let state = self.state.lock();
        if state.phase != AnnouncerPhase::Started {
            return Rearm::Cancel;
        }
        self.send_alive(&server, &state.location);
        let next = reannounce_interval(self.max_age);
        trace!(usn = %self.usn, ?next, "next re-announcement");
        Rearm::After(next)
    }

    /// Arrête l'annonce sans attendre l'émission du byebye.
    ///
    /// Sans effet (handle déjà complété) si l'announcer n'est pas démarré;
    /// pendant un arrêt en cours, renvoie l'attente de celui-ci.
    pub fn stop_async(self: &Arc<Self>) -> Result<StopHandle> {
        let server = self.server()?;

        let (timer, done) = {
            let mut state = self.state.lock();
            match state.phase {
                AnnouncerPhase::Started => {}
                AnnouncerPhase::Stopping => {
                    return Ok(StopHandle {
                        done: state.stopping.clone(),
                    });
                }
                AnnouncerPhase::Created | AnnouncerPhase::Stopped => {
                    return Ok(StopHandle::completed());
                }
            }
            state.phase = AnnouncerPhase::Stopping;
            let (tx, rx) = bounded::<()>(0);
            state.stopping = Some(rx.clone());
            (state.timer.take(), (tx, rx))
        };

        if let Some(timer) = timer {
            server.dispatcher().remove(timer);
        }

        let (tx, rx) = done;
        let announcer = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("ssdp-byebye".to_string())
            .spawn(move || {
                announcer.send_byebye(&server);
                let mut state = announcer.state.lock();
                state.phase = AnnouncerPhase::Stopped;
                state.stopping = None;
                drop(state);
                info!(usn = %announcer.usn, "👋 Announcer stopped");
                drop(tx);
            });

        if let Err(e) = spawned {
            let mut state = self.state.lock();
            state.phase = AnnouncerPhase::Stopped;
            state.stopping = None;
            return Err(e.into());
        }

        Ok(StopHandle { done: Some(rx) })
    }

    /// Arrête l'annonce et attend l'émission du byebye
    pub fn stop(self: &Arc<Self>) -> Result<()> {
        self.stop_async()?.wait();
        Ok(())
    }

    /// Programme une réponse unicast à un M-SEARCH reçu de `endpoint`.
    ///
    /// La réponse est abandonnée si l'announcer est arrêté avant l'échéance.
    pub fn respond(self: &Arc<Self>, endpoint: SocketAddr, mx: u32) -> Result<()> {
        let server = self.server()?;
        let delay = response_delay(mx, server.config().max_mx);

        let weak = Arc::downgrade(self);
        server.dispatcher().add(delay, move |_| {
            if let Some(announcer) = weak.upgrade() {
                announcer.send_response(endpoint);
            }
            Rearm::Cancel
        })?;

        trace!(usn = %self.usn, %endpoint, ?delay, "M-SEARCH response scheduled");
        Ok(())
    }

    /// Change l'adresse annoncée; un announcer démarré ré-annonce aussitôt
    pub fn set_location(&self, location: &str) -> Result<()> {
        if location.trim().is_empty() {
            return Err(SsdpError::invalid_argument("location must not be empty"));
        }
        let server = self.server()?;

        let mut state = self.state.lock();
        if state.location == location {
            return Ok(());
        }
        state.location = location.to_string();
        debug!(usn = %self.usn, location, "Announcer location changed");
        if state.phase == AnnouncerPhase::Started {
            self.send_alive(&server, &state.location);
        }
        Ok(())
    }

    pub(crate) fn detach(&self) {
        self.state.lock().detached = true;
    }

    fn send_alive(&self, server: &ServerInner, location: &str) {
        let message = notify_alive(
            &self.service_type,
            &self.usn,
            location,
            self.max_age,
            &server.config().server_header,
        );
        match server.send_multicast(&message) {
            Ok(()) => debug!(usn = %self.usn, nt = %self.service_type, "📤 NOTIFY alive"),
            Err(e) => self.log_send_error("NOTIFY alive", &e),
        }
    }

    fn send_byebye(&self, server: &ServerInner) {
        let message = notify_byebye(&self.service_type, &self.usn);
        match server.send_multicast(&message) {
            Ok(()) => debug!(usn = %self.usn, nt = %self.service_type, "👋 NOTIFY byebye"),
            Err(e) => self.log_send_error("NOTIFY byebye", &e),
        }
    }

    fn send_response(&self, endpoint: SocketAddr) {
        let Ok(server) = self.server() else {
            return;
        };
        let state = self.state.lock();
        if state.phase != AnnouncerPhase::Started {
            trace!(usn = %self.usn, %endpoint, "Announcer stopped, response suppressed");
            return;
        }
        let message: HttpuMessage = search_response(
            &self.service_type,
            &self.usn,
            &state.location,
            self.max_age,
            &server.config().server_header,
            Utc::now(),
        );
        match server.send_unicast(&message, endpoint) {
            Ok(()) => debug!(usn = %self.usn, %endpoint, "📡 M-SEARCH response sent"),
            Err(e) => self.log_send_error("M-SEARCH response", &e),
        }
    }

    fn log_send_error(&self, what: &str, e: &io::Error) {
        if is_cancellation(e) {
            debug!(usn = %self.usn, "{} not sent, socket closed", what);
        } else {
            warn!(usn = %self.usn, "❌ Failed to send {}: {}", what, e);
        }
    }
}
