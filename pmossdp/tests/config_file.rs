use std::fs;
use std::net::Ipv4Addr;

use pmossdp::SsdpConfig;

#[test]
fn missing_file_gives_defaults() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = SsdpConfig::load(dir.path().join("absent.yaml"))?;
    assert_eq!(config, SsdpConfig::default());
    Ok(())
}

#[test]
fn yaml_file_is_loaded_and_validated() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("ssdp.yaml");
    fs::write(
        &path,
        "strict_protocol: true\ndefault_mx: 9\nmax_mx: 4\ninterface: 192.168.1.42\n",
    )?;

    let config = SsdpConfig::load(&path)?;
    assert!(config.strict_protocol);
    assert_eq!(config.max_mx, 4);
    assert_eq!(config.default_mx, 4);
    assert_eq!(config.interface, Some(Ipv4Addr::new(192, 168, 1, 42)));
    assert_eq!(config.default_max_age, pmossdp::DEFAULT_MAX_AGE);
    Ok(())
}

#[test]
fn invalid_yaml_is_an_error() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("ssdp.yaml");
    fs::write(&path, "max_mx: [not, a, number]\n")?;
    assert!(SsdpConfig::load(&path).is_err());

    fs::write(&path, "max_mx: 0\n")?;
    assert!(SsdpConfig::load(&path).is_err());
    Ok(())
}
