//! Error and Result types for the worker pool engine.

use std::error::Error as StdError;
use std::fmt;
use std::io;

/// A `Result` alias where the `Err` case is this crate's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// An opaque error produced by the worker pool engine.
///
/// The concrete cause is not part of the public API; use the `is_*`
/// predicates to branch on what kind of failure occurred, and
/// [`Error::source`] to log the underlying cause.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

#[derive(Debug)]
pub(crate) enum Kind {
    /// The configuration file did not exist when the `Worker` was constructed.
    ConfigMissing,
    /// The worker executable could not be found via command-search.
    WorkerProgramMissing,
    /// A FIFO create, pipe open, or process spawn call failed.
    SpawnIo,
    /// A frame failed to parse, or the netstring framing was malformed.
    ProtocolMalformed,
    /// The socket closed before the exchange reached `end`.
    ConnectionLost,
    /// The child process exited while the worker was not `quitting`.
    ChildCrash,
    /// A caller dropped the receiving half before a pending op completed.
    Canceled,
    /// An internal channel closed unexpectedly.
    ChannelClosed,
    /// The worker was not in a state that permits the requested operation.
    InvalidState,
}

impl Error {
    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(crate) fn with_cause<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn new_config_missing() -> Error {
        Error::new(Kind::ConfigMissing)
    }

    pub(crate) fn new_worker_program_missing() -> Error {
        Error::new(Kind::WorkerProgramMissing)
    }

    pub(crate) fn new_spawn_io(cause: io::Error) -> Error {
        Error::new(Kind::SpawnIo).with_cause(cause)
    }

    pub(crate) fn new_protocol(msg: impl Into<String>) -> Error {
        Error::new(Kind::ProtocolMalformed).with_cause(ProtocolMessage(msg.into()))
    }

    pub(crate) fn new_connection_lost() -> Error {
        Error::new(Kind::ConnectionLost)
    }

    pub(crate) fn new_child_crash() -> Error {
        Error::new(Kind::ChildCrash)
    }

    /// A child crash whose cause carries the process's own stderr output
    /// (spec §8 scenario 4: "the `worker:error` event carries the thrown
    /// message verbatim").
    pub(crate) fn new_child_crash_message(msg: impl Into<String>) -> Error {
        Error::new(Kind::ChildCrash).with_cause(CrashMessage(msg.into()))
    }

    pub(crate) fn new_canceled() -> Error {
        Error::new(Kind::Canceled)
    }

    pub(crate) fn new_channel_closed() -> Error {
        Error::new(Kind::ChannelClosed)
    }

    pub(crate) fn new_invalid_state() -> Error {
        Error::new(Kind::InvalidState)
    }

    pub(crate) fn kind(&self) -> &Kind {
        &self.inner.kind
    }

    /// The configuration file did not exist.
    pub fn is_config_missing(&self) -> bool {
        matches!(self.inner.kind, Kind::ConfigMissing)
    }

    /// The worker executable could not be located.
    pub fn is_worker_program_missing(&self) -> bool {
        matches!(self.inner.kind, Kind::WorkerProgramMissing)
    }

    /// Spawning the child process, or one of its handshake primitives, failed.
    pub fn is_spawn_io(&self) -> bool {
        matches!(self.inner.kind, Kind::SpawnIo)
    }

    /// A frame on the wire could not be parsed.
    pub fn is_protocol_malformed(&self) -> bool {
        matches!(self.inner.kind, Kind::ProtocolMalformed)
    }

    /// The connection was lost before the exchange completed.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self.inner.kind, Kind::ConnectionLost)
    }

    /// The child exited unexpectedly (not during a graceful/forceful quit).
    pub fn is_child_crash(&self) -> bool {
        matches!(self.inner.kind, Kind::ChildCrash)
    }

    /// The operation targeted a worker in a state that does not permit it.
    pub fn is_invalid_state(&self) -> bool {
        matches!(self.inner.kind, Kind::InvalidState)
    }
}

#[derive(Debug)]
struct ProtocolMessage(String);

impl fmt::Display for ProtocolMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl StdError for ProtocolMessage {}

#[derive(Debug)]
struct CrashMessage(String);

impl fmt::Display for CrashMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl StdError for CrashMessage {}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Error")
            .field("kind", &self.inner.kind)
            .field("cause", &self.inner.cause)
            .finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self.inner.kind {
            Kind::ConfigMissing => "configuration file does not exist",
            Kind::WorkerProgramMissing => "worker program not found",
            Kind::SpawnIo => "spawning the worker failed",
            Kind::ProtocolMalformed => "malformed frame on worker socket",
            Kind::ConnectionLost => "connection to worker closed before end",
            Kind::ChildCrash => "worker child process exited unexpectedly",
            Kind::Canceled => "operation was canceled",
            Kind::ChannelClosed => "internal channel closed",
            Kind::InvalidState => "worker is not in a state that permits this operation",
        };
        f.write_str(text)
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.cause.as_ref().map(|c| &**c as _)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::new_spawn_io(err)
    }
}
