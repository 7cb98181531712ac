use std::env;
use std::time::Duration;

use pmossdp::{BrowseOptions, Client, ClientEvent, SsdpConfig};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = SsdpConfig::load("ssdp.yaml")?;
    let client = Client::new(config)?;
    let events = client.subscribe();

    // Cibles en argument, ssdp:all sinon
    let mut targets: Vec<String> = env::args().skip(1).collect();
    if targets.is_empty() {
        targets.push("ssdp:all".to_string());
    }
    for st in &targets {
        client
            .browse_with(st, BrowseOptions { mx: Some(3), auto_stop: true })?
            .start()?;
    }

    println!("Listening for SSDP events for 30s...");

    while let Ok(event) = events.recv_timeout(Duration::from_secs(30)) {
        match event {
            ClientEvent::ServiceAdded(service) => println!(
                "[ADDED] usn={} st={} location={} server={} expires={}",
                service.usn,
                service.service_type,
                service.location(),
                service.server.as_deref().unwrap_or("-"),
                service.expiration
            ),
            ClientEvent::ServiceUpdated(service) => println!(
                "[UPDATED] usn={} location={}",
                service.usn,
                service.location()
            ),
            ClientEvent::ServiceRemoved(usn) => println!("[REMOVED] usn={}", usn),
        }
    }

    println!("{} services in cache", client.services().len());
    client.dispose();
    Ok(())
}
