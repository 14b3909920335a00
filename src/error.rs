//! Error values shared across the crate.
//!
//! Failures fall into a small number of kinds with different retry and
//! caching behavior: input errors are reported without any network I/O,
//! transient network errors are retried per policy, authoritative negative
//! answers are cached and never retried, protocol errors move on to the
//! next server, and policy errors are final. The raw-query interface maps
//! each kind to a negative errno value; the high-level lookup interface
//! maps to the classic `EAI_*` family.

use std::fmt;
use std::io;
use std::sync::Arc;

use domain::base::iana::Rcode;

//------------ QueryError ----------------------------------------------------

/// An error produced while dispatching a single question.
#[derive(Clone, Debug)]
pub enum QueryError {
    /// The question could not be parsed as a DNS message.
    Malformed,

    /// The question was well-formed but unacceptable, e.g. no question
    /// section or an unsupported opcode.
    InvalidArgument,

    /// No configured server produced an answer before the retry budget
    /// ran out.
    Timeout,

    /// Policy refused to send the query, e.g. the calling uid is blocked
    /// or the network is unknown.
    Refused,

    /// The answer did not fit the caller's buffer.
    MessageSize,

    /// The owning network was torn down while the query was in flight.
    NetworkGone,

    /// The network has no usable servers configured.
    NoServers,

    /// All servers answered with a non-recoverable error code. The best
    /// rcode seen is kept for the caller.
    ServerFailed(Rcode),

    /// Private DNS is in strict mode and no server has been validated.
    NoValidatedServers,

    /// A socket-level failure on the last attempted server.
    Io(Arc<io::Error>),
}

impl QueryError {
    /// Returns the negative errno value delivered on the raw interface.
    pub fn errno(&self) -> i32 {
        match self {
            QueryError::Malformed => -libc::EILSEQ,
            QueryError::InvalidArgument => -libc::EINVAL,
            QueryError::Timeout => -libc::ETIMEDOUT,
            QueryError::Refused => -libc::ECONNREFUSED,
            QueryError::MessageSize => -libc::EMSGSIZE,
            QueryError::NetworkGone => -libc::ENONET,
            QueryError::NoServers => -libc::ENONET,
            QueryError::ServerFailed(_) => -libc::EIO,
            QueryError::NoValidatedServers => -libc::ETIMEDOUT,
            QueryError::Io(_) => -libc::ECONNREFUSED,
        }
    }

    /// Returns whether the failure may succeed if simply tried again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            QueryError::Timeout
                | QueryError::NetworkGone
                | QueryError::Io(_)
                | QueryError::NoValidatedServers
        )
    }
}

impl From<io::Error> for QueryError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut => QueryError::Timeout,
            _ => QueryError::Io(Arc::new(err)),
        }
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryError::Malformed => write!(f, "malformed DNS message"),
            QueryError::InvalidArgument => write!(f, "invalid query"),
            QueryError::Timeout => write!(f, "query timed out"),
            QueryError::Refused => write!(f, "query refused by policy"),
            QueryError::MessageSize => write!(f, "answer too large"),
            QueryError::NetworkGone => write!(f, "network destroyed"),
            QueryError::NoServers => write!(f, "no servers configured"),
            QueryError::ServerFailed(rcode) => {
                write!(f, "servers failed with {}", rcode)
            }
            QueryError::NoValidatedServers => {
                write!(f, "no validated private DNS server")
            }
            QueryError::Io(err) => write!(f, "transport error: {}", err),
        }
    }
}

impl std::error::Error for QueryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            QueryError::Io(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

//------------ LookupError ---------------------------------------------------

/// An error produced by the high-level lookup interface.
///
/// The variants mirror the classic name-resolution error values so that
/// embedders can translate without a lookup table of their own.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LookupError {
    /// The name exists but has no records of the requested type.
    NoData,

    /// The name does not exist.
    HostNotFound,

    /// A transient failure; trying again later may succeed.
    Again,

    /// A non-recoverable failure in resolution itself.
    Fail,

    /// A failure outside resolution, carrying the underlying errno.
    System(i32),
}

impl LookupError {
    /// Returns the matching `EAI_*` value.
    pub fn eai(&self) -> i32 {
        match self {
            LookupError::NoData => libc::EAI_NODATA,
            LookupError::HostNotFound => libc::EAI_NONAME,
            LookupError::Again => libc::EAI_AGAIN,
            LookupError::Fail => libc::EAI_FAIL,
            LookupError::System(_) => libc::EAI_SYSTEM,
        }
    }
}

impl From<QueryError> for LookupError {
    fn from(err: QueryError) -> Self {
        match err {
            QueryError::Malformed | QueryError::InvalidArgument => {
                LookupError::Fail
            }
            QueryError::Timeout
            | QueryError::NetworkGone
            | QueryError::Io(_) => LookupError::Again,
            QueryError::Refused => LookupError::System(libc::ECONNREFUSED),
            QueryError::MessageSize => LookupError::System(libc::EMSGSIZE),
            QueryError::NoServers => LookupError::Again,
            QueryError::ServerFailed(_) => LookupError::Fail,
            QueryError::NoValidatedServers => LookupError::Fail,
        }
    }
}

impl fmt::Display for LookupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LookupError::NoData => write!(f, "no data of requested type"),
            LookupError::HostNotFound => write!(f, "host not found"),
            LookupError::Again => write!(f, "temporary resolution failure"),
            LookupError::Fail => write!(f, "non-recoverable failure"),
            LookupError::System(errno) => {
                write!(f, "system error (errno {})", errno)
            }
        }
    }
}

impl std::error::Error for LookupError {}

//------------ ConfigError ---------------------------------------------------

/// An error from the network-configuration interface.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ConfigError {
    /// The target already exists or conflicts with active state.
    Exists,

    /// The target network or value is unknown.
    NotFound,

    /// The supplied value is unusable.
    Invalid(&'static str),
}

impl ConfigError {
    /// Returns the matching errno value.
    pub fn errno(&self) -> i32 {
        match self {
            ConfigError::Exists => libc::EEXIST,
            ConfigError::NotFound => libc::ENOENT,
            ConfigError::Invalid(_) => libc::EINVAL,
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Exists => write!(f, "already exists"),
            ConfigError::NotFound => write!(f, "not found"),
            ConfigError::Invalid(what) => write!(f, "invalid {}", what),
        }
    }
}

impl std::error::Error for ConfigError {}

//============ Tests =========================================================
