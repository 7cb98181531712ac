//! Services découverts
//!
//! Un [`Service`] est construit à partir d'une réponse `200 OK` ou d'un
//! `NOTIFY ssdp:alive`. Il lui faut au minimum un type (`ST` / `NT`), un
//! `USN` et au moins une adresse (`LOCATION` ou `AL`); sinon le datagramme
//! est rejeté.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::config::SsdpConfig;
use crate::error::{Result, SsdpError, ValidationError};
use crate::message::{Headers, HttpuMessage, MessageKind, NotifySubtype};

static MAX_AGE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)max-age\s*=\s*(\d+)").expect("max-age pattern is valid")
});

/// Upper bound accepted for an `Expires` date
const EXPIRES_SANITY_DAYS: i64 = 365;

/// Service découvert sur le réseau
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    /// `ST` (réponse) ou `NT` (notification)
    pub service_type: String,
    /// Identité du service
    pub usn: String,
    /// URLs de description, dans l'ordre reçu, sans doublon
    pub locations: Vec<String>,
    /// Instant absolu d'expiration de l'annonce
    pub expiration: DateTime<Utc>,
    /// En-tête SERVER s'il est présent
    pub server: Option<String>,
}

impl Service {
    /// Construit un service depuis un datagramme analysé.
    ///
    /// En mode strict, l'absence d'`EXT` (réponse) / `HOST` (notification)
    /// ou de `SERVER` donne [`SsdpError::StrictProtocol`].
    pub fn from_message(
        message: &HttpuMessage,
        config: &SsdpConfig,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let (type_header, strict_header) = match message.kind() {
            MessageKind::SearchResponse => ("ST", "EXT"),
            MessageKind::Notify(NotifySubtype::Alive) => ("NT", "HOST"),
            other => {
                return Err(ValidationError::Unsupported(format!("{:?}", other)).into());
            }
        };
        let headers = &message.headers;

        let service_type = headers
            .get_non_empty(type_header)
            .ok_or(ValidationError::MissingHeader(type_header))?;
        let usn = headers
            .get_non_empty("USN")
            .ok_or(ValidationError::MissingHeader("USN"))?;
        let locations = parse_locations(headers);
        if locations.is_empty() {
            return Err(ValidationError::MissingLocation.into());
        }

        let server = headers.get_non_empty("SERVER").map(str::to_string);

        if config.strict_protocol {
            if !headers.contains(strict_header) {
                return Err(SsdpError::StrictProtocol(format!(
                    "missing {} header (USN={})",
                    strict_header, usn
                )));
            }
            if server.is_none() {
                return Err(SsdpError::StrictProtocol(format!(
                    "missing SERVER header (USN={})",
                    usn
                )));
            }
        }

        Ok(Self {
            service_type: service_type.to_string(),
            usn: usn.to_string(),
            locations,
            expiration: parse_expiration(headers, now, config.default_max_age),
            server,
        })
    }

    pub fn location(&self) -> &str {
        self.locations.first().map(String::as_str).unwrap_or_default()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration <= now
    }

    /// Même annonce, hors date d'expiration
    pub fn same_advertisement(&self, other: &Service) -> bool {
        self.usn == other.usn
            && self.service_type == other.service_type
            && self.locations == other.locations
            && self.server == other.server
    }
}

/// Extrait `N` de `max-age=N` (insensible à la casse)
pub fn parse_max_age(cache_control: &str) -> Option<u32> {
    MAX_AGE_RE
        .captures(cache_control)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Calcule l'expiration d'une annonce.
///
/// Ordre de priorité :
/// 1. `CACHE-CONTROL: max-age=N` → `now + N`
/// 2. `EXPIRES` (date HTTP) si elle est dans le futur et à moins d'un an
/// 3. `now + default_max_age`
pub fn parse_expiration(
    headers: &Headers,
    now: DateTime<Utc>,
    default_max_age: u32,
) -> DateTime<Utc> {
    if let Some(max_age) = headers.get_all("CACHE-CONTROL").find_map(parse_max_age) {
        return now + ChronoDuration::seconds(i64::from(max_age));
    }

    if let Some(raw) = headers.get_non_empty("EXPIRES") {
        match DateTime::parse_from_rfc2822(raw) {
            Ok(date) => {
                let date = date.with_timezone(&Utc);
                if date > now && date <= now + ChronoDuration::days(EXPIRES_SANITY_DAYS) {
                    return date;
                }
                trace!(
                    expires = %raw,
                    "EXPIRES outside of the accepted window, using default max-age"
                );
            }
            Err(e) => trace!(expires = %raw, "Unparseable EXPIRES header: {}", e),
        }
    }

    now + ChronoDuration::seconds(i64::from(default_max_age))
}

/// `LOCATION` puis chaque URL des en-têtes `AL` (`<url1><url2>` ou valeur nue)
pub fn parse_locations(headers: &Headers) -> Vec<String> {
    let mut locations: Vec<String> = Vec::new();
    let mut push = |url: &str| {
        let url = url.trim();
        if !url.is_empty() && !locations.iter().any(|l| l == url) {
            locations.push(url.to_string());
        }
    };

    for value in headers.get_all("LOCATION") {
        push(value);
    }

    for value in headers.get_all("AL") {
        if value.contains('<') {
            for chunk in value.split('<').skip(1) {
                if let Some((url, _)) = chunk.split_once('>') {
                    push(url);
                }
            }
        } else {
            push(value);
        }
    }

    locations
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn response(extra: &str) -> HttpuMessage {
        let raw = format!(
            "HTTP/1.1 200 OK\r\nST: urn:test:service:1\r\nUSN: uuid:abc::urn:test:service:1\r\n{}\r\n",
            extra
        );
        HttpuMessage::parse(raw.as_bytes()).unwrap()
    }

    #[test]
    fn test_parse_max_age_variants() {
        assert_eq!(parse_max_age("max-age=60"), Some(60));
        assert_eq!(parse_max_age("no-cache, MAX-AGE = 120"), Some(120));
        assert_eq!(parse_max_age("max-age=abc"), None);
        assert_eq!(parse_max_age("no-cache"), None);
    }

    #[test]
    fn test_max_age_wins_over_expires() {
        let msg = response(
            "LOCATION: http://h/d.xml\r\nCACHE-CONTROL: max-age=60\r\nEXPIRES: Mon, 02 Jun 2025 12:00:00 GMT\r\n",
        );
        let exp = parse_expiration(&msg.headers, now(), 1800);
        assert_eq!(exp, now() + ChronoDuration::seconds(60));
    }

    #[test]
    fn test_future_expires_within_a_year_is_accepted() {
        let msg = response("EXPIRES: Mon, 02 Jun 2025 12:00:00 GMT\r\n");
        let exp = parse_expiration(&msg.headers, now(), 1800);
        assert_eq!(exp, Utc.with_ymd_and_hms(2025, 6, 2, 12, 0, 0).unwrap());
    }

    #[test]
    fn test_past_or_far_expires_falls_back_to_default() {
        for expires in [
            "Sat, 01 Jan 2000 00:00:00 GMT",
            "Fri, 01 Jan 2100 00:00:00 GMT",
            "not a date",
        ] {
            let msg = response(&format!("EXPIRES: {}\r\n", expires));
            let exp = parse_expiration(&msg.headers, now(), 1800);
            assert_eq!(exp, now() + ChronoDuration::seconds(1800), "{}", expires);
        }
    }

    #[test]
    fn test_locations_merge_location_and_al() {
        let msg = response(
            "LOCATION: http://a/1\r\nAL: <http://a/1><http://b/2>\r\nAL: http://c/3\r\n",
        );
        assert_eq!(
            parse_locations(&msg.headers),
            vec!["http://a/1", "http://b/2", "http://c/3"]
        );
    }

    #[test]
    fn test_service_from_search_response() {
        let msg = response(
            "LOCATION: http://h/d.xml\r\nCACHE-CONTROL: max-age=60\r\nEXT:\r\nSERVER: x\r\n",
        );
        let service = Service::from_message(&msg, &SsdpConfig::default(), now()).unwrap();
        assert_eq!(service.service_type, "urn:test:service:1");
        assert_eq!(service.usn, "uuid:abc::urn:test:service:1");
        assert_eq!(service.location(), "http://h/d.xml");
        assert_eq!(service.expiration, now() + ChronoDuration::seconds(60));
        assert_eq!(service.server.as_deref(), Some("x"));
    }

    #[test]
    fn test_service_requires_usn_type_and_location() {
        let config = SsdpConfig::default();

        let no_location = response("CACHE-CONTROL: max-age=60\r\n");
        assert!(matches!(
            Service::from_message(&no_location, &config, now()),
            Err(SsdpError::Validation(ValidationError::MissingLocation))
        ));

        let raw = b"HTTP/1.1 200 OK\r\nST: urn:x\r\nLOCATION: http://h\r\n\r\n";
        let no_usn = HttpuMessage::parse(raw).unwrap();
        assert!(matches!(
            Service::from_message(&no_usn, &config, now()),
            Err(SsdpError::Validation(ValidationError::MissingHeader("USN")))
        ));

        let raw = b"NOTIFY * HTTP/1.1\r\nNTS: ssdp:alive\r\nUSN: uuid:x\r\nLOCATION: http://h\r\n\r\n";
        let no_nt = HttpuMessage::parse(raw).unwrap();
        assert!(matches!(
            Service::from_message(&no_nt, &config, now()),
            Err(SsdpError::Validation(ValidationError::MissingHeader("NT")))
        ));
    }

    #[test]
    fn test_strict_mode_requires_recommended_headers() {
        let lax = SsdpConfig::default();
        let strict = SsdpConfig {
            strict_protocol: true,
            ..SsdpConfig::default()
        };

        let msg = response("LOCATION: http://h/d.xml\r\n");
        assert!(Service::from_message(&msg, &lax, now()).is_ok());
        assert!(matches!(
            Service::from_message(&msg, &strict, now()),
            Err(SsdpError::StrictProtocol(_))
        ));

        let msg = response("LOCATION: http://h/d.xml\r\nEXT:\r\nSERVER: s\r\n");
        assert!(Service::from_message(&msg, &strict, now()).is_ok());

        let raw = b"NOTIFY * HTTP/1.1\r\nNT: urn:x\r\nNTS: ssdp:alive\r\nUSN: uuid:x\r\nLOCATION: http://h\r\nSERVER: s\r\n\r\n";
        let no_host = HttpuMessage::parse(raw).unwrap();
        assert!(matches!(
            Service::from_message(&no_host, &strict, now()),
            Err(SsdpError::StrictProtocol(_))
        ));
    }

    #[test]
    fn test_byebye_is_not_a_service() {
        let raw = b"NOTIFY * HTTP/1.1\r\nNT: urn:x\r\nNTS: ssdp:byebye\r\nUSN: uuid:x\r\n\r\n";
        let msg = HttpuMessage::parse(raw).unwrap();
        assert!(matches!(
            Service::from_message(&msg, &SsdpConfig::default(), now()),
            Err(SsdpError::Validation(ValidationError::Unsupported(_)))
        ));
    }
}
