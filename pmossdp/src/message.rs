//! Codec HTTPU : construction et analyse des datagrammes SSDP
//!
//! Quatre types de datagrammes sont construits :
//!
//! | Datagramme     | Première ligne          |
//! |----------------|-------------------------|
//! | Recherche      | `M-SEARCH * HTTP/1.1`   |
//! | Réponse        | `HTTP/1.1 200 OK`       |
//! | Alive          | `NOTIFY * HTTP/1.1`     |
//! | Byebye         | `NOTIFY * HTTP/1.1`     |
//!
//! L'analyse est volontairement tolérante sur la forme (fins de ligne `\n`
//! seules, casse des en-têtes, lignes repliées) mais exige une ligne de
//! départ valide et un bloc d'en-têtes terminé par une ligne vide.

use chrono::{DateTime, Utc};
use std::fmt;

use crate::error::ParseError;
use crate::{SSDP_MULTICAST_ADDR, SSDP_PORT};

pub const SSDP_ALL: &str = "ssdp:all";
pub const SSDP_DISCOVER: &str = "\"ssdp:discover\"";
pub const NTS_ALIVE: &str = "ssdp:alive";
pub const NTS_BYEBYE: &str = "ssdp:byebye";

const HTTP_VERSION: &str = "HTTP/1.1";

/// Première ligne d'un message HTTPU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Request {
        method: String,
        target: String,
        version: String,
    },
    Response {
        version: String,
        status: u16,
        reason: String,
    },
}

impl fmt::Display for StartLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartLine::Request {
                method,
                target,
                version,
            } => write!(f, "{} {} {}", method, target, version),
            StartLine::Response {
                version,
                status,
                reason,
            } => write!(f, "{} {} {}", version, status, reason),
        }
    }
}

/// En-têtes HTTPU : insensibles à la casse, ordonnés, multi-valués
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Ajoute une valeur sans remplacer les précédentes
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// Première valeur pour `name`
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Toutes les valeurs pour `name`, dans l'ordre du datagramme
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Première valeur non vide pour `name`
    pub fn get_non_empty(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.trim())
            .find(|v| !v.is_empty())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Sous-type d'une notification (`NTS`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifySubtype {
    Alive,
    ByeBye,
    Other(String),
}

impl NotifySubtype {
    fn parse(nts: &str) -> Self {
        let nts = nts.trim();
        if nts.eq_ignore_ascii_case(NTS_ALIVE) {
            NotifySubtype::Alive
        } else if nts.eq_ignore_ascii_case(NTS_BYEBYE) {
            NotifySubtype::ByeBye
        } else {
            NotifySubtype::Other(nts.to_string())
        }
    }
}

/// Classification d'un datagramme reçu
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Search,
    Notify(NotifySubtype),
    SearchResponse,
    Other,
}

/// Message HTTPU (requête ou réponse) sans corps
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpuMessage {
    pub start_line: StartLine,
    pub headers: Headers,
}

impl HttpuMessage {
    pub fn request(method: &str) -> Self {
        Self {
            start_line: StartLine::Request {
                method: method.to_string(),
                target: "*".to_string(),
                version: HTTP_VERSION.to_string(),
            },
            headers: Headers::new(),
        }
    }

    pub fn ok_response() -> Self {
        Self {
            start_line: StartLine::Response {
                version: HTTP_VERSION.to_string(),
                status: 200,
                reason: "OK".to_string(),
            },
            headers: Headers::new(),
        }
    }

    fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Analyse un datagramme brut
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        if data.is_empty() {
            return Err(ParseError::Empty);
        }
        let text = std::str::from_utf8(data).map_err(|_| ParseError::NotUtf8)?;

        let head = match (text.find("\r\n\r\n"), text.find("\n\n")) {
            (Some(a), Some(b)) => &text[..a.min(b)],
            (Some(a), None) => &text[..a],
            (None, Some(b)) => &text[..b],
            (None, None) => return Err(ParseError::MissingTerminator),
        };

        let mut lines = head.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l));
        let first = lines.next().unwrap_or_default().trim();
        if first.is_empty() {
            return Err(ParseError::Empty);
        }
        let start_line = parse_start_line(first)?;

        let mut headers: Vec<(String, String)> = Vec::new();
        for line in lines {
            if line.starts_with(' ') || line.starts_with('\t') {
                // obsolete line folding: continuation of the previous value
                match headers.last_mut() {
                    Some((_, value)) => {
                        value.push(' ');
                        value.push_str(line.trim());
                        continue;
                    }
                    None => return Err(ParseError::InvalidHeader(line.to_string())),
                }
            }

            let Some((name, value)) = line.split_once(':') else {
                return Err(ParseError::InvalidHeader(line.to_string()));
            };
            let name = name.trim();
            if name.is_empty() || name.contains(char::is_whitespace) {
                return Err(ParseError::InvalidHeader(line.to_string()));
            }
            headers.push((name.to_string(), value.trim().to_string()));
        }

        Ok(Self {
            start_line,
            headers: Headers(headers),
        })
    }

    pub fn method(&self) -> Option<&str> {
        match &self.start_line {
            StartLine::Request { method, .. } => Some(method),
            StartLine::Response { .. } => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match &self.start_line {
            StartLine::Response { status, .. } => Some(*status),
            StartLine::Request { .. } => None,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match &self.start_line {
            StartLine::Request { method, .. } if method.eq_ignore_ascii_case("M-SEARCH") => {
                MessageKind::Search
            }
            StartLine::Request { method, .. } if method.eq_ignore_ascii_case("NOTIFY") => {
                MessageKind::Notify(NotifySubtype::parse(
                    self.headers.get("NTS").unwrap_or_default(),
                ))
            }
            StartLine::Response { status: 200, .. } => MessageKind::SearchResponse,
            _ => MessageKind::Other,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl fmt::Display for HttpuMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\r\n", self.start_line)?;
        for (name, value) in self.headers.iter() {
            if value.is_empty() {
                write!(f, "{}:\r\n", name)?;
            } else {
                write!(f, "{}: {}\r\n", name, value)?;
            }
        }
        f.write_str("\r\n")
    }
}

fn parse_start_line(line: &str) -> Result<StartLine, ParseError> {
    let invalid = || ParseError::InvalidStartLine(line.to_string());

    if line.get(..5).is_some_and(|p| p.eq_ignore_ascii_case("HTTP/")) {
        let mut parts = line.splitn(3, ' ');
        let version = parts.next().ok_or_else(invalid)?;
        let status = parts
            .next()
            .and_then(|s| s.trim().parse::<u16>().ok())
            .ok_or_else(invalid)?;
        let reason = parts.next().unwrap_or_default().trim();
        return Ok(StartLine::Response {
            version: version.to_string(),
            status,
            reason: reason.to_string(),
        });
    }

    let parts: Vec<&str> = line.split_whitespace().collect();
    match parts.as_slice() {
        [method, target, version] if version.to_ascii_uppercase().starts_with("HTTP/") => {
            Ok(StartLine::Request {
                method: method.to_string(),
                target: target.to_string(),
                version: version.to_string(),
            })
        }
        _ => Err(invalid()),
    }
}

fn host_header() -> String {
    format!("{}:{}", SSDP_MULTICAST_ADDR, SSDP_PORT)
}

/// USN d'une annonce : `uuid:<name>::<type>`, ou `uuid:<name>` si le type est le nom
pub fn format_usn(name: &str, service_type: &str) -> String {
    let bare = strip_uuid(name);
    if bare == strip_uuid(service_type) {
        format!("uuid:{}", bare)
    } else {
        format!("uuid:{}::{}", bare, service_type)
    }
}

/// Retire le préfixe `uuid:` (insensible à la casse)
pub fn strip_uuid(s: &str) -> &str {
    let s = s.trim();
    match s.get(..5) {
        Some(prefix) if prefix.eq_ignore_ascii_case("uuid:") => &s[5..],
        _ => s,
    }
}

/// `M-SEARCH` multicast
pub fn search_request(st: &str, mx: u32, user_agent: &str) -> HttpuMessage {
    HttpuMessage::request("M-SEARCH")
        .with("HOST", host_header())
        .with("MAN", SSDP_DISCOVER)
        .with("MX", mx.to_string())
        .with("ST", st)
        .with("USER-AGENT", user_agent)
}

/// `NOTIFY ssdp:alive`
pub fn notify_alive(
    nt: &str,
    usn: &str,
    location: &str,
    max_age: u32,
    server: &str,
) -> HttpuMessage {
    HttpuMessage::request("NOTIFY")
        .with("HOST", host_header())
        .with("CACHE-CONTROL", format!("max-age={}", max_age))
        .with("LOCATION", location)
        .with("NT", nt)
        .with("NTS", NTS_ALIVE)
        .with("SERVER", server)
        .with("USN", usn)
}

/// `NOTIFY ssdp:byebye`
pub fn notify_byebye(nt: &str, usn: &str) -> HttpuMessage {
    HttpuMessage::request("NOTIFY")
        .with("HOST", host_header())
        .with("NT", nt)
        .with("NTS", NTS_BYEBYE)
        .with("USN", usn)
}

/// `HTTP/1.1 200 OK` en réponse unicast à un `M-SEARCH`
pub fn search_response(
    st: &str,
    usn: &str,
    location: &str,
    max_age: u32,
    server: &str,
    date: DateTime<Utc>,
) -> HttpuMessage {
    HttpuMessage::ok_response()
        .with("CACHE-CONTROL", format!("max-age={}", max_age))
        .with("DATE", date.format("%a, %d %b %Y %H:%M:%S GMT").to_string())
        .with("EXT", "")
        .with("LOCATION", location)
        .with("SERVER", server)
        .with("ST", st)
        .with("USN", usn)
}
