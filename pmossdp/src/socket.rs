//! Couche socket SSDP
//!
//! Deux rôles de socket :
//!
//! * **multicast** : port éphémère, membre du groupe 239.255.255.250;
//!   sert à émettre les M-SEARCH / NOTIFY et à recevoir les réponses unicast.
//! * **listener** : lié au port 1900 (SO_REUSEADDR / SO_REUSEPORT), membre
//!   du groupe; reçoit les M-SEARCH des autres control points et les NOTIFY
//!   spontanés, et sert à répondre en unicast.
//!
//! Un client ne doit jamais se contenter d'un socket lié au port 1900 pour
//! ses recherches : si plusieurs sockets partagent ce port, le noyau répartit
//! les datagrammes unicast entre eux et les réponses se perdent.
//!
//! La fermeture d'un socket pendant une réception en cours est une
//! annulation normale (un `stop()` sur un autre thread) : la boucle de
//! réception se termine sans erreur.

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::config::SsdpConfig;
use crate::net::local_ipv4_addrs;
use crate::{SSDP_MULTICAST_IPV4, SSDP_PORT};

const RECEIVE_BUFFER_SIZE: usize = 8192;

/// Réponse d'un gestionnaire de réception
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveAction {
    Continue,
    Stop,
}

pub type ReceiveHandler = Box<dyn FnMut(&[u8], SocketAddr) -> ReceiveAction + Send>;

/// Socket UDP vu par le cœur SSDP
pub trait Transport: Send + Sync {
    /// Émet un datagramme. Échoue avec `NotConnected` une fois fermé.
    fn send_to(&self, datagram: &[u8], dest: SocketAddr) -> io::Result<()>;

    /// Lance la boucle de réception continue. Le gestionnaire est rappelé
    /// pour chaque datagramme jusqu'à ce qu'il renvoie `Stop` ou que le
    /// socket soit fermé.
    fn start_receiving(&self, handler: ReceiveHandler) -> io::Result<()>;

    /// Ferme le socket; idempotent
    fn close(&self);

    fn is_closed(&self) -> bool;

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Fabrique des deux rôles de socket
pub trait TransportFactory: Send + Sync {
    fn multicast(&self) -> io::Result<Arc<dyn Transport>>;

    fn listener(&self) -> io::Result<Arc<dyn Transport>>;
}

pub(crate) fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "socket closed")
}

/// True when `err` only reflects a concurrent close
pub(crate) fn is_cancellation(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotConnected | io::ErrorKind::Interrupted
    )
}

/// Implémentation UDP réelle
pub struct UdpTransport {
    label: &'static str,
    socket: Arc<UdpSocket>,
    closed: Arc<AtomicBool>,
    receiving: AtomicBool,
}

impl UdpTransport {
    fn new(label: &'static str, socket: UdpSocket) -> Self {
        Self {
            label,
            socket: Arc::new(socket),
            closed: Arc::new(AtomicBool::new(false)),
            receiving: AtomicBool::new(false),
        }
    }
}

impl Transport for UdpTransport {
    fn send_to(&self, datagram: &[u8], dest: SocketAddr) -> io::Result<()> {
        if self.is_closed() {
            return Err(closed_error());
        }
        self.socket.send_to(datagram, dest).map(|_| ())
    }

    fn start_receiving(&self, mut handler: ReceiveHandler) -> io::Result<()> {
        if self.is_closed() {
            return Err(closed_error());
        }
        if self.receiving.swap(true, Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "receive loop already running",
            ));
        }

        let socket = Arc::clone(&self.socket);
        let closed = Arc::clone(&self.closed);
        let label = self.label;

        thread::Builder::new()
            .name(format!("ssdp-{}-recv", label))
            .spawn(move || {
                let mut buf = [0u8; RECEIVE_BUFFER_SIZE];
                loop {
                    if closed.load(Ordering::SeqCst) {
                        break;
                    }
                    match socket.recv_from(&mut buf) {
                        Ok((n, from)) => {
                            if closed.load(Ordering::SeqCst) {
                                break;
                            }
                            if handler(&buf[..n], from) == ReceiveAction::Stop {
                                break;
                            }
                        }
                        Err(e)
                            if matches!(
                                e.kind(),
                                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                            ) =>
                        {
                            // read timeout, check for close and go on
                            continue;
                        }
                        Err(e) => {
                            if closed.load(Ordering::SeqCst) {
                                break;
                            }
                            warn!("❌ SSDP {} read error: {}", label, e);
                            thread::sleep(Duration::from_millis(50));
                        }
                    }
                }
                trace!("SSDP {} receive loop ended", label);
            })?;

        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("SSDP {} socket closed", self.label);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Fabrique de sockets UDP configurés selon [`SsdpConfig`]
#[derive(Debug, Clone)]
pub struct UdpTransportFactory {
    config: SsdpConfig,
}

impl UdpTransportFactory {
    pub fn new(config: SsdpConfig) -> Self {
        Self { config }
    }

    fn open(&self, port: u16) -> io::Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
        socket.set_reuse_port(true)?;

        let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        socket.bind(&bind_addr.into())?;

        socket.set_multicast_ttl_v4(self.config.multicast_ttl)?;
        socket.set_multicast_loop_v4(self.config.multicast_loop)?;
        if let Some(iface) = self.config.interface {
            socket.set_multicast_if_v4(&iface)?;
        }

        let socket: UdpSocket = socket.into();
        socket.set_read_timeout(Some(self.config.receive_timeout()))?;
        Ok(socket)
    }

    /// Rejoint le groupe SSDP sur chaque interface; renvoie le nombre de succès
    fn join_group(&self, socket: &UdpSocket) -> usize {
        let interfaces = match self.config.interface {
            Some(iface) => vec![iface],
            None => {
                let mut all = local_ipv4_addrs();
                if all.is_empty() {
                    all.push(Ipv4Addr::UNSPECIFIED);
                }
                all
            }
        };

        let mut joined = 0;
        for ipv4 in interfaces {
            match socket.join_multicast_v4(&SSDP_MULTICAST_IPV4, &ipv4) {
                Ok(()) => {
                    debug!("SSDP: joined {} on {}", SSDP_MULTICAST_IPV4, ipv4);
                    joined += 1;
                }
                Err(e) => {
                    warn!(
                        "SSDP: failed to join {} on {}: {}",
                        SSDP_MULTICAST_IPV4, ipv4, e
                    );
                }
            }
        }
        joined
    }
}

impl TransportFactory for UdpTransportFactory {
    fn multicast(&self) -> io::Result<Arc<dyn Transport>> {
        let socket = self.open(0)?;
        // reception here is unicast replies; membership is best effort
        self.join_group(&socket);
        debug!("✅ SSDP multicast socket ready on {:?}", socket.local_addr().ok());
        Ok(Arc::new(UdpTransport::new("multicast", socket)))
    }

    fn listener(&self) -> io::Result<Arc<dyn Transport>> {
        let socket = self.open(SSDP_PORT)?;
        if self.join_group(&socket) == 0 {
            return Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("could not join {} on any interface", SSDP_MULTICAST_IPV4),
            ));
        }
        debug!("✅ SSDP listener socket ready on port {}", SSDP_PORT);
        Ok(Arc::new(UdpTransport::new("listener", socket)))
    }
}
