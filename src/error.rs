//! Module `error` define enumeration of all errors returned by this package.

use std::{error, fmt, result};

/// Short form to compose Error values.
///
/// Here are few possible ways:
///
/// ```ignore
/// use crate::Error;
/// err_at!(InvalidInput, msg: "bad argument");
/// ```
///
/// ```ignore
/// use crate::Error;
/// err_at!(IPCFail, tx.send(msg));
/// ```
///
/// ```ignore
/// use crate::Error;
/// err_at!(ThreadFail, thread.join(), "background-worker");
/// ```
///
#[macro_export]
macro_rules! err_at {
    ($v:ident, msg: $($arg:expr),+) => {{
        let prefix = format!("at {{{}:{}}}", file!(), line!());
        Err(Error::$v(prefix, format!($($arg),+)))
    }};
    ($v:ident, $e:expr) => {{
        match $e {
            Ok(val) => Ok(val),
            Err(err) => {
                let prefix = format!("at {{{}:{}}}", file!(), line!());
                Err(Error::$v(prefix, format!("{}", err)))
            }
        }
    }};
    ($v:ident, $e:expr, $($arg:expr),+) => {{
        match $e {
            Ok(val) => Ok(val),
            Err(err) => {
                let prefix = format!("at {{{}:{}}}", file!(), line!());
                let msg = format!($($arg),+);
                Err(Error::$v(prefix, format!("{} {}", err, msg)))
            }
        }
    }};
}

/// Error variants that are returned by this package's API.
///
/// Each variant carries a prefix, mostly a static string and a general
/// purpose message in [String] format.
#[derive(Clone, PartialEq)]
pub enum Error {
    /// Un-recoverable breakage, bugs like an empty fanout partition or a
    /// bitmap inconsistency end up here.
    Fatal(String, String),
    /// API user error, like bulk loading into a non-empty index.
    InvalidInput(String, String),
    /// Lookup found no entry for the requested key.
    KeyNotFound(String, String),
    /// Insert rejected because an entry exists and duplicates are disallowed.
    DuplicateKey(String, String),
    /// A concurrent restructure holds the target leaf, caller shall retry.
    /// Subsequent attempts resume below the superroot using a cached parent.
    RetryLater(String, String),
    /// Key lies outside the configured key-domain, applicable to key types
    /// whose domain is fixed at construction.
    DomainViolation(String, String),
    /// Failure from std threading APIs.
    ThreadFail(String, String),
    /// Inter-process-communication failures mostly from std channels.
    IPCFail(String, String),
    /// Conversion failure from std numeric conversions.
    FailConvert(String, String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        use Error::*;

        match self {
            Fatal(p, msg) => write!(f, "{} Fatal: {}", p, msg),
            InvalidInput(p, msg) => write!(f, "{} InvalidInput: {}", p, msg),
            KeyNotFound(p, msg) => write!(f, "{} KeyNotFound: {}", p, msg),
            DuplicateKey(p, msg) => write!(f, "{} DuplicateKey: {}", p, msg),
            RetryLater(p, msg) => write!(f, "{} RetryLater: {}", p, msg),
            DomainViolation(p, msg) => write!(f, "{} DomainViolation: {}", p, msg),
            ThreadFail(p, msg) => write!(f, "{} ThreadFail: {}", p, msg),
            IPCFail(p, msg) => write!(f, "{} IPCFail: {}", p, msg),
            FailConvert(p, msg) => write!(f, "{} FailConvert: {}", p, msg),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(f, "{}", self)
    }
}

impl error::Error for Error {}

impl Error {
    /// Return whether this error is the cooperative backpressure signal,
    /// and not an actual failure.
    pub fn is_retry(&self) -> bool {
        matches!(self, Error::RetryLater(_, _))
    }
}
