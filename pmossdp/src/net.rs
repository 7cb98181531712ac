//! Adresses locales
//!
//! Le cœur SSDP n'a besoin que des interfaces IPv4 pour joindre le groupe
//! multicast. Les appelants qui construisent l'URL `LOCATION` de leurs
//! annonces peuvent s'appuyer sur [`guess_local_ip`].

use get_if_addrs::get_if_addrs;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use tracing::warn;

/// Devine l'adresse IPv4 locale utilisée pour sortir du réseau.
///
/// Un socket UDP est "connecté" vers une adresse publique (aucun paquet
/// n'est émis) puis son adresse locale est lue. Retourne `127.0.0.1` en
/// cas d'échec.
pub fn guess_local_ip() -> Ipv4Addr {
    let guess = UdpSocket::bind("0.0.0.0:0").and_then(|socket| {
        socket.connect("8.8.8.8:80")?;
        socket.local_addr()
    });

    match guess {
        Ok(addr) => match addr.ip() {
            IpAddr::V4(ip) if !ip.is_unspecified() => ip,
            _ => Ipv4Addr::LOCALHOST,
        },
        Err(_) => local_ipv4_addrs()
            .into_iter()
            .next()
            .unwrap_or(Ipv4Addr::LOCALHOST),
    }
}

/// Adresses IPv4 non-loopback de toutes les interfaces, sans doublon
pub fn local_ipv4_addrs() -> Vec<Ipv4Addr> {
    let mut result = Vec::new();

    match get_if_addrs() {
        Ok(interfaces) => {
            for iface in interfaces {
                if let IpAddr::V4(ip) = iface.ip() {
                    if !ip.is_loopback() && !result.contains(&ip) {
                        result.push(ip);
                    }
                }
            }
        }
        Err(e) => warn!("❌ Failed to list network interfaces: {}", e),
    }

    result
}

/// URL de base `http://<ip>:<port>` pour construire une `LOCATION`
pub fn base_url(port: u16) -> String {
    format!("http://{}:{}", guess_local_ip(), port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guess_local_ip_is_usable() {
        let ip = guess_local_ip();
        assert!(!ip.is_unspecified());
        assert!(!ip.is_multicast());
    }

    #[test]
    fn test_local_ipv4_addrs_filters_loopback_and_duplicates() {
        let addrs = local_ipv4_addrs();
        assert!(addrs.iter().all(|ip| !ip.is_loopback()));

        let unique: std::collections::HashSet<_> = addrs.iter().collect();
        assert_eq!(unique.len(), addrs.len());
    }

    #[test]
    fn test_base_url_format() {
        let url = base_url(8080);
        assert!(url.starts_with("http://"));
        assert!(url.ends_with(":8080"));
    }
}
