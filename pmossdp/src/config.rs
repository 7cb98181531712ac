//! Configuration SSDP
//!
//! `SsdpConfig` est une valeur explicite passée à [`Server`](crate::Server)
//! et [`Client`](crate::Client) à la construction. Elle peut être chargée
//! depuis un fichier YAML puis surchargée par des variables d'environnement
//! préfixées par `PMOSSDP_` (ex: `PMOSSDP_STRICT_PROTOCOL=true`).
//!
//! ```yaml
//! strict_protocol: false
//! default_max_age: 1800
//! default_mx: 3
//! max_mx: 5
//! multicast_ttl: 4
//! interface: 192.168.1.42
//! ```

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use std::{env, fs};
use tracing::{debug, info, warn};

use crate::{DEFAULT_MAX_AGE, DEFAULT_MX, MAX_MX, SsdpError};

const ENV_PREFIX: &str = "PMOSSDP_";

const DEFAULT_MULTICAST_TTL: u32 = 4;
const DEFAULT_RECEIVE_TIMEOUT_MS: u64 = 250;
const DEFAULT_CACHE_SWEEP_SECS: u64 = 30;

/// Paramètres du cœur SSDP
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SsdpConfig {
    /// Rejette les datagrammes auxquels il manque des en-têtes recommandés
    /// (`EXT`/`HOST`, `SERVER`) au lieu de les tolérer.
    pub strict_protocol: bool,

    /// Durée de vie annoncée / supposée par défaut (secondes)
    pub default_max_age: u32,

    /// MX utilisé par les browsers quand l'appelant n'en précise pas
    pub default_mx: u32,

    /// Plafond de MX, appliqué à l'envoi comme à la réponse
    pub max_mx: u32,

    /// Valeur de l'en-tête SERVER / USER-AGENT
    pub server_header: String,

    pub multicast_ttl: u32,

    pub multicast_loop: bool,

    /// Interface IPv4 à utiliser. Toutes les interfaces non-loopback si absent.
    pub interface: Option<Ipv4Addr>,

    /// Timeout de lecture des sockets; borne le délai de prise en compte d'une fermeture
    pub receive_timeout_ms: u64,

    /// Période du balayage d'expiration du cache client
    pub cache_sweep_secs: u64,
}

impl Default for SsdpConfig {
    fn default() -> Self {
        Self {
            strict_protocol: false,
            default_max_age: DEFAULT_MAX_AGE,
            default_mx: DEFAULT_MX,
            max_mx: MAX_MX,
            server_header: default_server_header(),
            multicast_ttl: DEFAULT_MULTICAST_TTL,
            multicast_loop: true,
            interface: None,
            receive_timeout_ms: DEFAULT_RECEIVE_TIMEOUT_MS,
            cache_sweep_secs: DEFAULT_CACHE_SWEEP_SECS,
        }
    }
}

/// `<os>/<version> UPnP/1.1 pmossdp/<version>`
pub fn default_server_header() -> String {
    format!(
        "{}/1.0 UPnP/1.1 pmossdp/{}",
        capitalize(env::consts::OS),
        env!("CARGO_PKG_VERSION")
    )
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

impl SsdpConfig {
    /// Charge la configuration depuis un fichier YAML
    ///
    /// Un fichier absent n'est pas une erreur : les valeurs par défaut sont
    /// utilisées. Les variables d'environnement sont appliquées ensuite, puis
    /// la configuration est validée.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let mut config = match fs::read_to_string(path) {
            Ok(data) => {
                info!(config_file=%path.display(), "Loaded SSDP config file");
                Self::from_yaml(&data)
                    .with_context(|| format!("Invalid SSDP config file {}", path.display()))?
            }
            Err(_) => {
                info!(config_file=%path.display(), "SSDP config file not found, using defaults");
                Self::default()
            }
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(data: &str) -> Result<Self> {
        let config: SsdpConfig = serde_yaml::from_str(data)?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Applique les variables `PMOSSDP_<CHAMP>` présentes dans l'environnement
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        override_from_env("STRICT_PROTOCOL", &mut self.strict_protocol)?;
        override_from_env("DEFAULT_MAX_AGE", &mut self.default_max_age)?;
        override_from_env("DEFAULT_MX", &mut self.default_mx)?;
        override_from_env("MAX_MX", &mut self.max_mx)?;
        override_from_env("SERVER_HEADER", &mut self.server_header)?;
        override_from_env("MULTICAST_TTL", &mut self.multicast_ttl)?;
        override_from_env("MULTICAST_LOOP", &mut self.multicast_loop)?;
        override_from_env("RECEIVE_TIMEOUT_MS", &mut self.receive_timeout_ms)?;
        override_from_env("CACHE_SWEEP_SECS", &mut self.cache_sweep_secs)?;

        if let Ok(raw) = env::var(format!("{ENV_PREFIX}INTERFACE")) {
            self.interface = if raw.trim().is_empty() {
                None
            } else {
                Some(raw.trim().parse().map_err(|e| {
                    anyhow!("{ENV_PREFIX}INTERFACE: invalid IPv4 address '{raw}': {e}")
                })?)
            };
        }
        Ok(())
    }

    /// Vérifie la cohérence des valeurs; un MX par défaut trop grand est ramené au plafond.
    pub fn validate(&mut self) -> Result<()> {
        if self.max_mx == 0 {
            return Err(anyhow!("max_mx must be at least 1"));
        }
        if self.default_max_age == 0 {
            return Err(anyhow!("default_max_age must be at least 1 second"));
        }
        if self.cache_sweep_secs == 0 {
            return Err(anyhow!("cache_sweep_secs must be at least 1 second"));
        }
        if self.default_mx > self.max_mx {
            warn!(
                default_mx = self.default_mx,
                max_mx = self.max_mx,
                "default_mx above max_mx, clamping"
            );
            self.default_mx = self.max_mx;
        }
        if self.default_mx == 0 {
            self.default_mx = 1;
        }
        Ok(())
    }

    /// Valide une configuration construite à la main, pour `Server` / `Client`
    pub fn checked(mut self) -> crate::Result<Self> {
        self.validate()
            .map_err(|e| SsdpError::invalid_argument(format!("SSDP config: {e}")))?;
        Ok(self)
    }

    /// Plafonne un MX demandé dans `[1, max_mx]`
    pub fn clamp_mx(&self, mx: u32) -> u32 {
        mx.max(1).min(self.max_mx.max(1))
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms.max(1))
    }

    pub fn cache_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.cache_sweep_secs.max(1))
    }
}

fn override_from_env<T>(field: &str, target: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let key = format!("{ENV_PREFIX}{field}");
    if let Ok(raw) = env::var(&key) {
        *target = raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("{key}: invalid value '{raw}': {e}"))?;
        debug!(env_var = %key, value = %raw, "SSDP config override from env");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_follow_protocol() {
        let config = SsdpConfig::default();
        assert_eq!(config.default_max_age, 1800);
        assert!(!config.strict_protocol);
        assert!(config.default_mx <= config.max_mx);
        assert!(config.server_header.contains("UPnP/1.1"));
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = SsdpConfig::from_yaml("strict_protocol: true\nmax_mx: 3\n").unwrap();
        assert!(config.strict_protocol);
        assert_eq!(config.max_mx, 3);
        assert_eq!(config.default_max_age, DEFAULT_MAX_AGE);
        assert_eq!(config.interface, None);
    }

    #[test]
    fn test_validate_clamps_default_mx() {
        let mut config = SsdpConfig {
            default_mx: 10,
            max_mx: 4,
            ..SsdpConfig::default()
        };
        config.validate().unwrap();
        assert_eq!(config.default_mx, 4);
    }

    #[test]
    fn test_validate_rejects_zero_max_mx() {
        let mut config = SsdpConfig {
            max_mx: 0,
            ..SsdpConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_checked_maps_to_invalid_argument() {
        let config = SsdpConfig {
            default_max_age: 0,
            ..SsdpConfig::default()
        };
        assert!(matches!(config.checked(), Err(SsdpError::InvalidArgument(_))));

        let config = SsdpConfig {
            default_mx: 9,
            ..SsdpConfig::default()
        }
        .checked()
        .unwrap();
        assert_eq!(config.default_mx, config.max_mx);
    }

    #[test]
    fn test_clamp_mx() {
        let config = SsdpConfig::default();
        assert_eq!(config.clamp_mx(0), 1);
        assert_eq!(config.clamp_mx(2), 2);
        assert_eq!(config.clamp_mx(120), config.max_mx);

        let unchecked = SsdpConfig {
            max_mx: 0,
            ..SsdpConfig::default()
        };
        assert_eq!(unchecked.clamp_mx(0), 1);
        assert_eq!(unchecked.clamp_mx(7), 1);
    }

    #[test]
    fn test_yaml_roundtrip_keeps_interface() {
        let config = SsdpConfig {
            interface: Some(Ipv4Addr::new(10, 0, 0, 7)),
            ..SsdpConfig::default()
        };
        let yaml = config.to_yaml().unwrap();
        assert_eq!(SsdpConfig::from_yaml(&yaml).unwrap(), config);
    }
}
