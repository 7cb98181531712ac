use std::env;
use std::thread;
use std::time::Duration;

use pmossdp::net::base_url;
use pmossdp::{Server, SsdpConfig};
use tracing_subscriber::EnvFilter;

const SERVICE_TYPE: &str = "urn:schemas-upnp-org:device:MediaServer:1";

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .init();

    let seconds: u64 = env::args()
        .nth(1)
        .map(|s| s.parse())
        .transpose()?
        .unwrap_or(60);

    let config = SsdpConfig::load("ssdp.yaml")?;
    let server = Server::new(config)?;

    let location = format!("{}/description.xml", base_url(8080));
    let name = "uuid:7f1c3e52-6b2a-4c1e-9d47-2a6c0e5b9f10";
    let announcer = server.announce(SERVICE_TYPE, name, &location, 1800)?;
    server.start(true)?;

    println!("Announcing {} at {} for {}s...", announcer.usn(), location, seconds);
    thread::sleep(Duration::from_secs(seconds));

    server.stop(true)?;
    server.dispose();
    Ok(())
}
