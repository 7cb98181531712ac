//! Boucle de réception HTTPU
//!
//! Un [`Listener`] possède un transport, analyse chaque datagramme reçu et
//! transmet les messages valides à un gestionnaire. Les datagrammes
//! illisibles sont journalisés puis ignorés : la boucle n'est jamais
//! interrompue par le bruit du segment multicast.

use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::error::Result;
use crate::message::HttpuMessage;
use crate::socket::{ReceiveAction, Transport};

pub(crate) struct Listener {
    name: &'static str,
    transport: Arc<dyn Transport>,
}

impl Listener {
    /// Démarre la réception sur `transport`
    pub(crate) fn start<F>(
        name: &'static str,
        transport: Arc<dyn Transport>,
        mut on_message: F,
    ) -> Result<Self>
    where
        F: FnMut(HttpuMessage, SocketAddr) + Send + 'static,
    {
        transport.start_receiving(Box::new(move |data, from| {
            match HttpuMessage::parse(data) {
                Ok(message) => on_message(message, from),
                Err(e) => trace!(%from, listener = name, "Dropping malformed datagram: {}", e),
            }
            ReceiveAction::Continue
        }))?;

        debug!(listener = name, "👂 Listening for SSDP datagrams");
        Ok(Self { name, transport })
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub(crate) fn close(&self) {
        if !self.transport.is_closed() {
            self.transport.close();
            debug!(listener = self.name, "Listener closed");
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.close();
    }
}
