//! In-memory transports for network-free tests

use parking_lot::Mutex;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};

use crate::message::{HttpuMessage, MessageKind, NotifySubtype};
use crate::socket::{ReceiveAction, ReceiveHandler, Transport, TransportFactory, closed_error};

/// One datagram handed to a [`MemoryTransport`]
#[derive(Debug, Clone)]
pub(crate) struct SentDatagram {
    pub role: &'static str,
    pub data: Vec<u8>,
    pub dest: SocketAddr,
}

impl SentDatagram {
    pub fn message(&self) -> HttpuMessage {
        HttpuMessage::parse(&self.data).unwrap()
    }

    pub fn is_alive(&self) -> bool {
        self.message().kind() == MessageKind::Notify(NotifySubtype::Alive)
    }

    pub fn is_byebye(&self) -> bool {
        self.message().kind() == MessageKind::Notify(NotifySubtype::ByeBye)
    }

    pub fn is_response(&self) -> bool {
        self.message().kind() == MessageKind::SearchResponse
    }

    pub fn is_search(&self) -> bool {
        self.message().kind() == MessageKind::Search
    }
}

type SentLog = Arc<Mutex<Vec<SentDatagram>>>;

pub(crate) struct MemoryTransport {
    role: &'static str,
    local: SocketAddr,
    log: SentLog,
    handler: Mutex<Option<ReceiveHandler>>,
    closed: AtomicBool,
}

impl MemoryTransport {
    /// Feeds one inbound datagram to the receive handler.
    /// Returns false when nothing is receiving.
    pub fn inject(&self, data: &[u8], from: SocketAddr) -> bool {
        if self.is_closed() {
            return false;
        }
        let Some(mut handler) = self.handler.lock().take() else {
            return false;
        };
        let action = handler(data, from);
        if action == ReceiveAction::Continue && !self.is_closed() {
            *self.handler.lock() = Some(handler);
        }
        true
    }

    pub fn is_receiving(&self) -> bool {
        self.handler.lock().is_some()
    }
}

impl Transport for MemoryTransport {
    fn send_to(&self, datagram: &[u8], dest: SocketAddr) -> io::Result<()> {
        if self.is_closed() {
            return Err(closed_error());
        }
        self.log.lock().push(SentDatagram {
            role: self.role,
            data: datagram.to_vec(),
            dest,
        });
        Ok(())
    }

    fn start_receiving(&self, handler: ReceiveHandler) -> io::Result<()> {
        if self.is_closed() {
            return Err(closed_error());
        }
        let mut slot = self.handler.lock();
        if slot.is_some() {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, "already receiving"));
        }
        *slot = Some(handler);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.handler.lock().take();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local)
    }
}

/// Hands out [`MemoryTransport`]s sharing one outbound log
#[derive(Default)]
pub(crate) struct MemoryTransportFactory {
    log: SentLog,
    next_port: AtomicU16,
    multicast: Mutex<Vec<Arc<MemoryTransport>>>,
    listeners: Mutex<Vec<Arc<MemoryTransport>>>,
}

impl MemoryTransportFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_port: AtomicU16::new(50000),
            ..Self::default()
        })
    }

    fn make(&self, role: &'static str, port: u16) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            role,
            local: SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
            log: Arc::clone(&self.log),
            handler: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// Every datagram sent so far, in order
    pub fn sent(&self) -> Vec<SentDatagram> {
        self.log.lock().clone()
    }

    pub fn clear_sent(&self) {
        self.log.lock().clear();
    }

    pub fn last_multicast(&self) -> Option<Arc<MemoryTransport>> {
        self.multicast.lock().last().cloned()
    }

    pub fn last_listener(&self) -> Option<Arc<MemoryTransport>> {
        self.listeners.lock().last().cloned()
    }
}

impl TransportFactory for MemoryTransportFactory {
    fn multicast(&self) -> io::Result<Arc<dyn Transport>> {
        let port = self.next_port.fetch_add(1, Ordering::SeqCst);
        let transport = self.make("multicast", port);
        self.multicast.lock().push(Arc::clone(&transport));
        Ok(transport)
    }

    fn listener(&self) -> io::Result<Arc<dyn Transport>> {
        let transport = self.make("listener", crate::SSDP_PORT);
        self.listeners.lock().push(Arc::clone(&transport));
        Ok(transport)
    }
}

pub(crate) fn peer(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::new(192, 168, 1, 50), port))
}
