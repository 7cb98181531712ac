//! # pmossdp - Simple Service Discovery Protocol
//!
//! Cœur SSDP pour UPnP : annonce de services et découverte sur le réseau.
//!
//! ## Fonctionnalités
//!
//! - ✅ NOTIFY alive / byebye en multicast
//! - ✅ Ré-annonces périodiques avec intervalle aléatoire (anti-tempête)
//! - ✅ Réponses unicast différées aux M-SEARCH
//! - ✅ Recherche active (M-SEARCH) et écoute passive des notifications
//! - ✅ Cache des services découverts avec expiration et événements
//!
//! ## Architecture
//!
//! - [`Server`] : possède les [`Announcer`]s et les sockets d'annonce
//! - [`Client`] : possède les [`Browser`]s, le cache et les abonnements
//! - [`TimeoutDispatcher`] : thread de temporisation partagé par les
//!   announcers / browsers d'un même propriétaire
//! - [`message`] : codec HTTPU, sans état
//! - [`socket`] : transports UDP ([`Transport`] / [`TransportFactory`])
//!
//! ## Constantes SSDP
//!
//! - **Multicast Address**: 239.255.255.250:1900
//! - **Max-Age**: 1800 secondes par défaut
//! - **MX**: 3 secondes par défaut, plafonné à 5

pub mod announcer;
pub mod browser;
pub mod cache;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
mod listener;
pub mod message;
pub mod net;
pub mod server;
pub mod service;
pub mod socket;

#[cfg(test)]
mod test_util;

use std::net::{Ipv4Addr, SocketAddr};

pub use announcer::{Announcer, AnnouncerPhase, StopHandle};
pub use browser::{BrowseOptions, Browser};
pub use cache::{CacheChange, ServiceCache};
pub use client::Client;
pub use config::SsdpConfig;
pub use dispatcher::{Rearm, TimeoutDispatcher, TimeoutHandle};
pub use error::{ParseError, Result, SsdpError, ValidationError};
pub use events::ClientEvent;
pub use message::HttpuMessage;
pub use server::Server;
pub use service::Service;
pub use socket::{ReceiveAction, Transport, TransportFactory, UdpTransportFactory};

/// Adresse multicast SSDP
pub const SSDP_MULTICAST_ADDR: &str = "239.255.255.250";

pub const SSDP_MULTICAST_IPV4: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);

/// Port SSDP
pub const SSDP_PORT: u16 = 1900;

/// Durée de validité des annonces par défaut (en secondes)
pub const DEFAULT_MAX_AGE: u32 = 1800;

/// MX par défaut des recherches (en secondes)
pub const DEFAULT_MX: u32 = 3;

/// Plafond du MX, à l'émission comme à la réponse (en secondes)
pub const MAX_MX: u32 = 5;

/// `239.255.255.250:1900`
pub fn multicast_endpoint() -> SocketAddr {
    SocketAddr::from((SSDP_MULTICAST_IPV4, SSDP_PORT))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multicast_endpoint_matches_address() {
        assert_eq!(
            multicast_endpoint().to_string(),
            format!("{}:{}", SSDP_MULTICAST_ADDR, SSDP_PORT)
        );
        assert!(SSDP_MULTICAST_IPV4.is_multicast());
    }
}
