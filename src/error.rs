//! Error type shared by every setup/teardown path in the crate.
//!
//! Hot-path operations (enqueue, dequeue, push, pop, quiescent, lock) never
//! produce one of these; they report shortfalls through their return counts.

use std::fmt;
use std::io;

pub type Result<T> = std::result::Result<T, Error>;

/// Setup, lookup and contract errors.
#[derive(Debug)]
pub enum Error {
    /// Requested element count is not usable (not a power of two, zero, or
    /// above the ring/stack limit).
    InvalidSize { requested: u64, max: u64 },
    /// Object name does not fit the name table.
    NameTooLong { name: String, max: usize },
    /// A ring, stack or zone with this name already exists.
    AlreadyExists(String),
    /// No object registered (or attachable) under this name.
    NotFound(String),
    /// Thread id outside `[0, max_threads)`.
    InvalidThreadId { thread_id: u32, max_threads: u32 },
    /// Any other caller contract violation.
    InvalidArgument(&'static str),
    /// A named object exists but holds a different element type or kind.
    ElementMismatch { name: String, expected: &'static str },
    /// The backing memory could not be reserved or mapped.
    Io(io::Error),
}

impl Error {
    /// Negative errno for this error class.
    pub fn errno(&self) -> i32 {
        match self {
            Error::InvalidSize { .. }
            | Error::InvalidThreadId { .. }
            | Error::InvalidArgument(_)
            | Error::ElementMismatch { .. } => -libc::EINVAL,
            Error::NameTooLong { .. } => -libc::ENAMETOOLONG,
            Error::AlreadyExists(_) => -libc::EEXIST,
            Error::NotFound(_) => -libc::ENOENT,
            Error::Io(e) => -e.raw_os_error().unwrap_or(libc::ENOMEM),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidSize { requested, max } => write!(
                f,
                "requested size {requested} is invalid, must be a power of 2 and not exceed {max}"
            ),
            Error::NameTooLong { name, max } => {
                write!(f, "name '{name}' is longer than {max} bytes")
            }
            Error::AlreadyExists(name) => write!(f, "'{name}' already exists"),
            Error::NotFound(name) => write!(f, "'{name}' not found"),
            Error::InvalidThreadId {
                thread_id,
                max_threads,
            } => write!(f, "thread id {thread_id} out of range (max {max_threads})"),
            Error::InvalidArgument(what) => write!(f, "invalid argument: {what}"),
            Error::ElementMismatch { name, expected } => {
                write!(f, "'{name}' does not hold {expected}")
            }
            Error::Io(e) => write!(f, "backing memory error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}
