//! Server and client wired together through an in-process datagram bus

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use parking_lot::Mutex;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use pmossdp::socket::ReceiveHandler;
use pmossdp::{
    BrowseOptions, Client, ClientEvent, ReceiveAction, Server, SsdpConfig, Transport,
    TransportFactory, multicast_endpoint,
};

const TYPE: &str = "urn:schemas-upnp-org:device:MediaServer:1";

#[derive(Default)]
struct Bus {
    sockets: Mutex<Vec<Arc<BusSocket>>>,
    next_port: AtomicU16,
    next_host: AtomicU8,
}

type Datagram = (Vec<u8>, SocketAddr);

/// Each socket drains its inbox on its own thread, like a real receive loop
struct BusSocket {
    addr: SocketAddr,
    bus: Weak<Bus>,
    inbox: Sender<Datagram>,
    inbox_rx: Mutex<Option<Receiver<Datagram>>>,
    closed: Arc<AtomicBool>,
}

impl Transport for BusSocket {
    fn send_to(&self, datagram: &[u8], dest: SocketAddr) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "closed"));
        }
        let Some(bus) = self.bus.upgrade() else {
            return Ok(());
        };
        let targets: Vec<Arc<BusSocket>> = bus
            .sockets
            .lock()
            .iter()
            .filter(|s| !s.is_closed() && s.addr != self.addr)
            .filter(|s| {
                if dest == multicast_endpoint() {
                    s.addr.port() == pmossdp::SSDP_PORT
                } else {
                    s.addr == dest
                }
            })
            .cloned()
            .collect();
        for target in targets {
            let _ = target.inbox.send((datagram.to_vec(), self.addr));
        }
        Ok(())
    }

    fn start_receiving(&self, mut handler: ReceiveHandler) -> io::Result<()> {
        let Some(inbox) = self.inbox_rx.lock().take() else {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, "already receiving"));
        };
        let closed = Arc::clone(&self.closed);
        thread::spawn(move || {
            loop {
                if closed.load(Ordering::SeqCst) {
                    break;
                }
                match inbox.recv_timeout(Duration::from_millis(20)) {
                    Ok((data, from)) => {
                        if closed.load(Ordering::SeqCst) {
                            break;
                        }
                        if handler(&data, from) == ReceiveAction::Stop {
                            break;
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        });
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.addr)
    }
}

struct BusFactory(Arc<Bus>);

impl BusFactory {
    fn open(&self, port: u16) -> Arc<dyn Transport> {
        let host = self.0.next_host.fetch_add(1, Ordering::SeqCst);
        let (inbox, inbox_rx) = unbounded();
        let socket = Arc::new(BusSocket {
            addr: SocketAddr::from((Ipv4Addr::new(10, 0, 0, host.wrapping_add(1)), port)),
            bus: Arc::downgrade(&self.0),
            inbox,
            inbox_rx: Mutex::new(Some(inbox_rx)),
            closed: Arc::new(AtomicBool::new(false)),
        });
        self.0.sockets.lock().push(Arc::clone(&socket));
        socket
    }
}

impl TransportFactory for BusFactory {
    fn multicast(&self) -> io::Result<Arc<dyn Transport>> {
        let port = 50000 + self.0.next_port.fetch_add(1, Ordering::SeqCst);
        Ok(self.open(port))
    }

    fn listener(&self) -> io::Result<Arc<dyn Transport>> {
        Ok(self.open(pmossdp::SSDP_PORT))
    }
}

fn network() -> (Server, Client) {
    let bus = Arc::new(Bus::default());
    let server = Server::with_factory(
        SsdpConfig::default(),
        Arc::new(BusFactory(Arc::clone(&bus))),
    )
    .unwrap();
    let client = Client::with_factory(SsdpConfig::default(), Arc::new(BusFactory(bus))).unwrap();
    (server, client)
}

#[test]
fn client_sees_alive_then_byebye() {
    let (server, client) = network();
    let events = client.subscribe();
    client.start().unwrap();

    let announcer = server
        .announce(TYPE, "uuid:1234", "http://10.0.0.1:8080/desc.xml", 1800)
        .unwrap();
    announcer.start().unwrap();

    match events.recv_timeout(Duration::from_secs(1)).unwrap() {
        ClientEvent::ServiceAdded(service) => {
            assert_eq!(service.usn, format!("uuid:1234::{}", TYPE));
            assert_eq!(service.service_type, TYPE);
            assert_eq!(service.location(), "http://10.0.0.1:8080/desc.xml");
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(client.services_of_type(TYPE).len(), 1);

    announcer.stop().unwrap();
    assert_eq!(
        events.recv_timeout(Duration::from_secs(1)).unwrap(),
        ClientEvent::ServiceRemoved(format!("uuid:1234::{}", TYPE))
    );
    assert!(client.services().is_empty());
}

#[test]
fn browser_collects_delayed_search_responses() {
    let (server, client) = network();
    // a long max-age keeps periodic alives out of the observation window
    for name in ["uuid:a", "uuid:b"] {
        server
            .announce(TYPE, name, &format!("http://10.0.0.1/{}.xml", name), 86400)
            .unwrap();
    }
    server
        .announce("urn:other:device:1", "uuid:c", "http://10.0.0.1/c.xml", 86400)
        .unwrap();
    server.start(true).unwrap();

    let events = client.subscribe();
    let browser = client
        .browse_with(TYPE, BrowseOptions { mx: Some(1), auto_stop: false })
        .unwrap();
    browser.start().unwrap();

    let mut usns = Vec::new();
    while usns.len() < 2 {
        match events.recv_timeout(Duration::from_secs(3)) {
            Ok(ClientEvent::ServiceAdded(service)) => usns.push(service.usn),
            Ok(other) => panic!("unexpected event {:?}", other),
            Err(e) => panic!("missing responses: {}", e),
        }
    }
    usns.sort();
    assert_eq!(usns, vec![format!("uuid:a::{}", TYPE), format!("uuid:b::{}", TYPE)]);

    // the other device type never answers a typed search
    assert!(events.recv_timeout(Duration::from_millis(1500)).is_err());

    browser.stop();
    server.dispose();
    client.dispose();
}
