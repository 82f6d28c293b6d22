use std::{fmt, io};

#[cfg(feature = "quic")]
use quinn::{ConnectError, ConnectionError, ReadExactError, WriteError};

use crate::Rank;

/// An application-level failure raised by a registered method. Surfaces on
/// the controller as [`Error::User`] when the status channel is enabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserError(String);

impl UserError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for UserError {}

impl From<String> for UserError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for UserError {
    fn from(message: &str) -> Self {
        Self(message.to_owned())
    }
}

/// The outcome of applying one command's effect on a single rank, before it
/// is turned into a status report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    User(String),
    Internal(String),
    NotRegistered(String),
}

impl From<UserError> for Failure {
    fn from(e: UserError) -> Self {
        Failure::User(e.0)
    }
}

#[derive(Debug)]
pub enum Error {
    /// A class or method name has no registry entry on some rank.
    NotRegistered { rank: Rank, name: String },
    /// A method reported an application-level failure.
    User { rank: Rank, message: String },
    /// A protocol invariant was violated; the run is corrupted.
    Internal { rank: Rank, message: String },
    /// The controller was asked to do something after `end_all`.
    WorkersTerminated,
    /// A fatal error happened earlier in the run.
    Aborted(String),
    Encode,
    Decode,
    MalformedCommand(String),
    Disconnected { rank: Rank },
    Config(String),
    Io(io::Error),
    #[cfg(feature = "quic")]
    Connect(ConnectError),
    #[cfg(feature = "quic")]
    Connection(ConnectionError),
    #[cfg(feature = "quic")]
    Write(WriteError),
    #[cfg(feature = "quic")]
    ReadExact(ReadExactError),
    #[cfg(feature = "quic")]
    Tls(rustls::Error),
    #[cfg(feature = "quic")]
    Certificate(rcgen::RcgenError),
}

impl Error {
    /// Fatal errors mean the ranks can no longer be trusted to agree on
    /// their state and the host should terminate the process.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::User { .. } | Error::WorkersTerminated | Error::Encode | Error::Config(_)
        )
    }

    pub(crate) fn from_failure(rank: Rank, failure: Failure) -> Self {
        match failure {
            Failure::User(message) => Error::User { rank, message },
            Failure::Internal(message) => Error::Internal { rank, message },
            Failure::NotRegistered(name) => Error::NotRegistered { rank, name },
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotRegistered { rank, name } => {
                write!(f, "rank {rank} has not registered \"{name}\"")
            }
            Error::User { rank, message } => write!(f, "rank {rank}: {message}"),
            Error::Internal { rank, message } => {
                write!(f, "internal error on rank {rank}: {message}")
            }
            Error::WorkersTerminated => f.write_str("the workers have been terminated"),
            Error::Aborted(reason) => write!(f, "run aborted: {reason}"),
            Error::Encode => f.write_str("could not encode payload"),
            Error::Decode => f.write_str("could not decode payload"),
            Error::MalformedCommand(why) => write!(f, "malformed command: {why}"),
            Error::Disconnected { rank } => write!(f, "rank {rank} disconnected"),
            Error::Config(why) => write!(f, "invalid configuration: {why}"),
            Error::Io(e) => write!(f, "io error: {e}"),
            #[cfg(feature = "quic")]
            Error::Connect(e) => write!(f, "connect error: {e}"),
            #[cfg(feature = "quic")]
            Error::Connection(e) => write!(f, "connection error: {e}"),
            #[cfg(feature = "quic")]
            Error::Write(e) => write!(f, "write error: {e}"),
            #[cfg(feature = "quic")]
            Error::ReadExact(e) => write!(f, "read error: {e}"),
            #[cfg(feature = "quic")]
            Error::Tls(e) => write!(f, "tls error: {e}"),
            #[cfg(feature = "quic")]
            Error::Certificate(e) => write!(f, "certificate error: {e}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

#[cfg(feature = "quic")]
impl From<ConnectError> for Error {
    fn from(error: ConnectError) -> Self {
        Self::Connect(error)
    }
}

#[cfg(feature = "quic")]
impl From<ConnectionError> for Error {
    fn from(error: ConnectionError) -> Self {
        Self::Connection(error)
    }
}

#[cfg(feature = "quic")]
impl From<WriteError> for Error {
    fn from(e: WriteError) -> Self {
        Self::Write(e)
    }
}

#[cfg(feature = "quic")]
impl From<ReadExactError> for Error {
    fn from(e: ReadExactError) -> Self {
        Self::ReadExact(e)
    }
}

#[cfg(feature = "quic")]
impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Self::Tls(e)
    }
}

#[cfg(feature = "quic")]
impl From<rcgen::RcgenError> for Error {
    fn from(e: rcgen::RcgenError) -> Self {
        Self::Certificate(e)
    }
}
