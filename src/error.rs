//! Kernel error kinds shared by the file system and virtual memory surfaces.
//!
//! A single closed enum rather than a boxed/dynamic error type, with a
//! conversion into the negative-errno convention expected at the
//! system-call boundary.

/// Errors produced by the file system and virtual memory subsystems.
///
/// Deliberately small and closed: every caller in this crate is expected to
/// match on it exhaustively rather than threading a boxed/dynamic error type
/// through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Path, fd, or sector lookup miss.
    NotFound,
    /// Malformed name, bad argument, or illegal fd.
    Invalid,
    /// Free-map or swap bitmap exhaustion.
    NoSpace,
    /// Directory removal blocked by open handles, non-emptiness, or root.
    Busy,
    /// On-disk magic mismatch; the file system has no recovery path.
    Corrupt,
    /// Block device I/O failure.
    Io,
    /// No free frame even after a full eviction pass, or no swap device.
    Fatal,
}

impl Error {
    /// Converts the error into a negative-errno-style `isize`, matching the
    /// convention a syscall return value uses.
    pub fn into_errno(self) -> isize {
        let code = match self {
            Error::NotFound => 1,
            Error::Invalid => 2,
            Error::NoSpace => 3,
            Error::Busy => 4,
            Error::Corrupt => 5,
            Error::Io => 6,
            Error::Fatal => 7,
        };
        -code
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            Error::NotFound => "not found",
            Error::Invalid => "invalid argument",
            Error::NoSpace => "no space left",
            Error::Busy => "resource busy",
            Error::Corrupt => "corrupt file system",
            Error::Io => "i/o error",
            Error::Fatal => "fatal kernel error",
        };
        f.write_str(msg)
    }
}
