//! Session-core error type.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Categorised error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FtpError {
    pub kind: FtpErrorKind,
    pub message: String,
    /// FTP reply code that triggered the error, if any.
    pub code: Option<u16>,
    pub host: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FtpErrorKind {
    /// Connect or login failure; fatal to session creation.
    Connection,
    /// Network failure or timeout in the middle of an operation.
    Transport,
    /// The server rejected the operation (not found, permission denied, ...).
    Protocol,
    /// Enqueue attempted on a session that has been torn down.
    QueueClosed,
    /// A transfer was unwound after a cancellation request.
    Cancelled,
    /// Reading or writing the caller-supplied stream failed.
    LocalIo,
    /// Config / parameter validation error.
    InvalidConfig,
}

pub type FtpResult<T> = Result<T, FtpError>;

// ── Construction helpers ─────────────────────────────────────────────

impl FtpError {
    pub fn new(kind: FtpErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            code: None,
            host: None,
        }
    }

    pub fn with_code(mut self, code: u16) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Connection, msg)
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Transport, msg)
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Protocol, msg)
    }

    pub fn queue_closed(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::QueueClosed, msg)
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Cancelled, msg)
    }

    pub fn local_io(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::LocalIo, msg)
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::InvalidConfig, msg)
    }

    pub fn timeout(what: impl Into<String>) -> Self {
        Self::transport(format!("{} timed out", what.into()))
    }

    /// Classify an FTP reply code.
    pub fn from_reply(code: u16, text: &str) -> Self {
        let kind = match code {
            421 | 425 | 426 => FtpErrorKind::Transport,
            430 | 530 => FtpErrorKind::Connection,
            _ => FtpErrorKind::Protocol,
        };
        Self {
            kind,
            message: text.to_string(),
            code: Some(code),
            host: None,
        }
    }

    /// Whether an idempotent operation may be retried after this error.
    pub fn is_transient(&self) -> bool {
        match self.code {
            Some(421) | Some(425) => true,
            Some(_) => false,
            None => self.kind == FtpErrorKind::Transport,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == FtpErrorKind::Cancelled
    }
}

impl fmt::Display for FtpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = self.code {
            write!(f, "[FTP {:?} {}] {}", self.kind, code, self.message)
        } else {
            write!(f, "[FTP {:?}] {}", self.kind, self.message)
        }
    }
}

impl std::error::Error for FtpError {}

impl From<std::io::Error> for FtpError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::TimedOut {
            Self::timeout(format!("I/O ({})", e))
        } else {
            Self::transport(e.to_string())
        }
    }
}

impl From<FtpError> for String {
    fn from(e: FtpError) -> String {
        e.message
    }
}
