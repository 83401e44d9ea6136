//! Error types and the collective status code.
//!
//! Every public operation ends with all participating ranks agreeing on one
//! [`Status`]. Backend failures are folded into that status and returned
//! normally; transport failures are fatal and abort the whole group.

use std::fmt;

use crate::transport::Rank;

/// The integer status every rank of an operation's group observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Status(i32);

impl Status {
    pub const OK: Status = Status(0);
    pub const BAD_ID: Status = Status(-33);
    pub const INVALID: Status = Status(-36);
    pub const PERMISSION: Status = Status(-37);
    pub const EDGE: Status = Status(-40);
    pub const BAD_TYPE: Status = Status(-45);
    pub const NO_MEMORY: Status = Status(-61);
    pub const IO: Status = Status(-68);
    pub const BAD_IO_TYPE: Status = Status(-255);

    pub const fn from_code(code: i32) -> Self {
        Status(code)
    }

    pub const fn code(self) -> i32 {
        self.0
    }

    pub const fn is_ok(self) -> bool {
        self.0 == 0
    }

    /// Keeps the first failure: `self` if it already failed, `other` otherwise.
    pub fn first_error(self, other: Status) -> Status {
        if self.is_ok() {
            other
        } else {
            self
        }
    }

    pub fn into_result(self) -> Result<()> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(Error::Failed(self))
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Status::OK => "ok",
            Status::BAD_ID => "bad id",
            Status::INVALID => "invalid argument",
            Status::PERMISSION => "permission denied",
            Status::EDGE => "index exceeds dimension bound",
            Status::BAD_TYPE => "bad type",
            Status::NO_MEMORY => "out of memory",
            Status::IO => "i/o failure",
            Status::BAD_IO_TYPE => "bad backend type",
            _ => "unknown status",
        };
        write!(f, "{} ({})", name, self.0)
    }
}

/// Failure of the group-messaging substrate.
///
/// A partial collective leaves every rank in an inconsistent state, so
/// these are never recovered from: the group is aborted.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("rank {0} is not part of the fabric")]
    UnknownRank(Rank),

    #[error("peer {0} disconnected")]
    Disconnected(Rank),

    #[error("group aborted: {0}")]
    Aborted(String),

    #[error("malformed message: {0}")]
    Malformed(&'static str),
}

/// Failure reported by a backend driver.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("no dataset named {0:?}")]
    UnknownDataset(String),

    #[error("unknown variable {0}")]
    UnknownVariable(u32),

    #[error("region exceeds the bound of dimension {dim} ({start} + {count} > {len})")]
    EdgeExceeded {
        dim: usize,
        start: u64,
        count: u64,
        len: u64,
    },

    #[error("expected {expected} dimensions, got {actual}")]
    RankMismatch { expected: usize, actual: usize },

    #[error("buffer holds {actual} bytes, region needs {expected}")]
    BufferSize { expected: usize, actual: usize },

    #[error("unknown request {0}")]
    UnknownRequest(u64),

    #[error("{0} is not supported by this backend")]
    Unsupported(&'static str),

    #[error("serial backend called from i/o rank {0}")]
    NotLeader(usize),

    #[error("dataset is read-only")]
    ReadOnly,
}

impl BackendError {
    pub fn status(&self) -> Status {
        match self {
            BackendError::UnknownDataset(_) => Status::IO,
            BackendError::UnknownVariable(_) | BackendError::UnknownRequest(_) => Status::BAD_ID,
            BackendError::EdgeExceeded { .. } => Status::EDGE,
            BackendError::RankMismatch { .. } | BackendError::BufferSize { .. } => {
                Status::INVALID
            }
            BackendError::Unsupported(_) | BackendError::NotLeader(_) => Status::BAD_IO_TYPE,
            BackendError::ReadOnly => Status::PERMISSION,
        }
    }
}

/// Error returned by the public collective operations.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("operation failed: {0}")]
    Failed(Status),
}

impl Error {
    /// The status a caller would observe as an integer return code.
    pub fn status(&self) -> Status {
        match self {
            Error::Transport(_) => Status::IO,
            Error::Failed(status) => *status,
        }
    }
}

impl From<BackendError> for Error {
    fn from(err: BackendError) -> Self {
        Error::Failed(err.status())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
