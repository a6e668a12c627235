//! Define 9P error representations.
//!
//! In 9P2000, errors travel on the wire as strings: the server answers
//! a failed request with `Rerror ename`. This module carries the ename
//! alongside ordinary I/O failures so that any error a handler returns
//! can be rendered into an `Rerror`.

use std::{error as stderror, fmt, io};

/// 9P error type which is convertible to an ename.
///
/// The value of `Error::ename()` will be used for Rerror.
#[derive(Debug)]
pub enum Error {
    /// Protocol-level error carrying the string sent to the client
    Ename(String),
    /// I/O error
    Io(io::Error),
}

impl Error {
    /// Get the string representation used for Rerror
    pub fn ename(&self) -> String {
        match *self {
            Error::Ename(ref e) => e.clone(),
            Error::Io(ref e) => e.to_string(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::Ename(ref e) => write!(f, "{}", e),
            Error::Io(ref e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl stderror::Error for Error {
    fn source(&self) -> Option<&(dyn stderror::Error + 'static)> {
        match *self {
            Error::Ename(_) => None,
            Error::Io(ref e) => Some(e),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<String> for Error {
    fn from(e: String) -> Self {
        Error::Ename(e)
    }
}

impl<'a> From<&'a str> for Error {
    fn from(e: &'a str) -> Self {
        Error::Ename(e.to_owned())
    }
}

/// Canonical error strings
///
/// The enames the core produces itself; leaves are free to surface
/// their own strings verbatim.
pub mod string {
    pub const UNKNOWN_FID: &str = "unknown fid";
    pub const FID_IN_USE: &str = "fid in use";
    pub const FID_OPEN: &str = "fid already open";
    pub const FID_NOT_OPEN: &str = "fid not open for i/o";
    pub const WALK_OPEN_FID: &str = "cannot walk from open fid";
    pub const NOT_DIR: &str = "not a directory";
    pub const IS_DIR: &str = "is a directory";
    pub const PERM: &str = "permission denied";
    pub const CREATE_PROHIBITED: &str = "create prohibited";
    pub const REMOVE_PROHIBITED: &str = "remove prohibited";
    pub const BAD_DIR_OFFSET: &str = "bad offset in directory read";
    pub const INTERRUPTED: &str = "interrupted";
    pub const NO_AUTH: &str = "authentication not required";
    pub const FILE_EXISTS: &str = "file already exists";
}
