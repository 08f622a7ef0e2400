use std::fmt;
use std::io;
use std::net;

pub type NetResult<T> = Result<T, NetError>;

/// Transport-level plumbing result. `Wait` means the operation would block
/// and should be retried on the next readiness event; `Closed` is a
/// recoverable peer loss (reset, refusal, EOF); `Fatal` is everything else.
#[derive(Debug, PartialEq, Eq)]
pub enum NetError {
    Wait,
    Closed,
    Fatal(ErrorKind),
}

#[derive(Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Overrun,
    WriteZero,
    AddrParse,
    Tls,
    Io(io::ErrorKind),
}

impl From<io::Error> for NetError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => NetError::Wait,
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::TimedOut
            | io::ErrorKind::UnexpectedEof => NetError::Closed,
            kind => NetError::Fatal(ErrorKind::Io(kind)),
        }
    }
}

impl From<net::AddrParseError> for NetError {
    #[inline]
    fn from(_: net::AddrParseError) -> Self {
        NetError::Fatal(ErrorKind::AddrParse)
    }
}

pub trait ErrorUtils {
    /// True when the result is neither success nor a retryable wait.
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(NetError::Wait) => false,
            _ => true,
        }
    }
}

/// Session-level errors. Each kind carries a stable numeric code and a
/// human-readable message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionErrorKind {
    InvalidMessage,
    LoginFailed,
    Disconnected,
    InvalidLogin,
    HeartbeatTimeout,
    LoginTimeout,
    Version,
    SequenceMismatch,
    InvalidMsgType,
    NotConnected,
    NoUpstream,
    NoDownstream,
    TransportTimeout,
    NotInSession,
    Store,
}

impl SessionErrorKind {
    pub fn code(self) -> u32 {
        match self {
            SessionErrorKind::InvalidMessage => 1001,
            SessionErrorKind::LoginFailed => 1002,
            SessionErrorKind::Disconnected => 1003,
            SessionErrorKind::InvalidLogin => 1004,
            SessionErrorKind::HeartbeatTimeout => 1005,
            SessionErrorKind::LoginTimeout => 1006,
            SessionErrorKind::Version => 1007,
            SessionErrorKind::SequenceMismatch => 1008,
            SessionErrorKind::InvalidMsgType => 1009,
            SessionErrorKind::NotConnected => 1010,
            SessionErrorKind::NoUpstream => 1011,
            SessionErrorKind::NoDownstream => 1012,
            SessionErrorKind::TransportTimeout => 1015,
            SessionErrorKind::NotInSession => 1016,
            SessionErrorKind::Store => 1017,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            SessionErrorKind::InvalidMessage => "Invalid value or message",
            SessionErrorKind::LoginFailed => "Login failed",
            SessionErrorKind::Disconnected => "Disconnected",
            SessionErrorKind::InvalidLogin => "Invalid or malformed login message",
            SessionErrorKind::HeartbeatTimeout => "Too many missing heartbeats",
            SessionErrorKind::LoginTimeout => "Login time exceeded",
            SessionErrorKind::Version => "Incorrect version",
            SessionErrorKind::SequenceMismatch => "Sequence number mismatch",
            SessionErrorKind::InvalidMsgType => "Invalid message type",
            SessionErrorKind::NotConnected => "Session not connected",
            SessionErrorKind::NoUpstream => "No upstream module configured",
            SessionErrorKind::NoDownstream => "No downstream module configured",
            SessionErrorKind::TransportTimeout => "Transport timeout occured",
            SessionErrorKind::NotInSession => "Session not logged in",
            SessionErrorKind::Store => "Message store failure",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionError {
    pub kind: SessionErrorKind,
    pub detail: Option<String>,
}

impl SessionError {
    #[inline]
    pub fn new(kind: SessionErrorKind) -> SessionError {
        SessionError { kind, detail: None }
    }

    #[inline]
    pub fn with_detail(kind: SessionErrorKind, detail: String) -> SessionError {
        SessionError {
            kind,
            detail: Some(detail),
        }
    }

    #[inline]
    pub fn code(&self) -> u32 {
        self.kind.code()
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "[{}] {}: {}", self.code(), self.kind.message(), detail),
            None => write!(f, "[{}] {}", self.code(), self.kind.message()),
        }
    }
}

/// Wiring-time configuration errors.
#[derive(Debug, PartialEq, Eq)]
pub enum ConfigError {
    Missing(&'static str),
    Invalid { key: String, value: String },
    BadUrl(String),
    UnknownVersion(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::Missing(key) => write!(f, "Missing required setting '{}'", key),
            ConfigError::Invalid { key, value } => {
                write!(f, "Invalid value '{}' for setting '{}'", value, key)
            }
            ConfigError::BadUrl(url) => {
                write!(f, "Illegal address '{}', must be [tls:]//<host>:<port>", url)
            }
            ConfigError::UnknownVersion(version) => {
                write!(f, "No dictionary for FIX version '{}'", version)
            }
        }
    }
}

/// Anything that can surface out of a reactor dispatch.
#[derive(Debug)]
pub enum EngineError {
    Net(NetError),
    Session(SessionError),
    Config(ConfigError),
    Io(io::Error),
}

impl From<NetError> for EngineError {
    #[inline]
    fn from(err: NetError) -> Self {
        EngineError::Net(err)
    }
}

impl From<SessionError> for EngineError {
    #[inline]
    fn from(err: SessionError) -> Self {
        EngineError::Session(err)
    }
}

impl From<ConfigError> for EngineError {
    #[inline]
    fn from(err: ConfigError) -> Self {
        EngineError::Config(err)
    }
}

impl From<io::Error> for EngineError {
    #[inline]
    fn from(err: io::Error) -> Self {
        EngineError::Io(err)
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EngineError::Net(err) => write!(f, "Transport error: {:?}", err),
            EngineError::Session(err) => write!(f, "Session error: {}", err),
            EngineError::Config(err) => write!(f, "Config error: {}", err),
            EngineError::Io(err) => write!(f, "I/O error: {}", err),
        }
    }
}
