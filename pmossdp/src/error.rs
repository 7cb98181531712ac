//! Error types for the SSDP core

/// Result type alias for SSDP operations
pub type Result<T> = std::result::Result<T, SsdpError>;

/// Errors surfaced by the public SSDP API.
///
/// Usage errors (`AlreadyStarted`, `Disposed`, `InvalidArgument`) are
/// programmer errors and are returned synchronously. Network noise never
/// reaches this type: malformed datagrams are logged and dropped inside the
/// receive loops.
#[derive(Debug, thiserror::Error)]
pub enum SsdpError {
    /// `start()` called on something already running
    #[error("{0} is already started")]
    AlreadyStarted(String),

    /// The owning server or client has been disposed
    #[error("{0} has been disposed")]
    Disposed(String),

    /// Null / empty / out of range argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Socket level failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTPU framing failure
    #[error("Malformed datagram: {0}")]
    Parse(#[from] ParseError),

    /// Datagram parsed but cannot describe a service
    #[error("Invalid service record: {0}")]
    Validation(#[from] ValidationError),

    /// Recommended header missing while strict protocol checking is on
    #[error("Strict protocol violation: {0}")]
    StrictProtocol(String),
}

impl SsdpError {
    pub fn already_started(what: impl Into<String>) -> Self {
        Self::AlreadyStarted(what.into())
    }

    pub fn disposed(what: impl Into<String>) -> Self {
        Self::Disposed(what.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// True for errors produced by remote peers rather than by the caller.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::Parse(_) | Self::Validation(_) | Self::StrictProtocol(_)
        )
    }
}

/// HTTPU framing errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty datagram")]
    Empty,

    #[error("datagram is not valid UTF-8")]
    NotUtf8,

    #[error("invalid start line: '{0}'")]
    InvalidStartLine(String),

    #[error("invalid header line: '{0}'")]
    InvalidHeader(String),

    #[error("header block is not terminated by an empty line")]
    MissingTerminator,
}

/// Missing or unusable headers when turning a datagram into a service record
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("missing {0} header")]
    MissingHeader(&'static str),

    #[error("no LOCATION or AL header")]
    MissingLocation,

    #[error("unsupported message: {0}")]
    Unsupported(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_errors_are_told_apart_from_usage_errors() {
        assert!(SsdpError::from(ParseError::Empty).is_protocol_error());
        assert!(SsdpError::from(ValidationError::MissingLocation).is_protocol_error());
        assert!(SsdpError::StrictProtocol("missing EXT".into()).is_protocol_error());
        assert!(!SsdpError::already_started("announcer").is_protocol_error());
        assert!(!SsdpError::from(std::io::Error::from(std::io::ErrorKind::NotConnected))
            .is_protocol_error());
    }
}
