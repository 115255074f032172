//! Error taxonomy and identifier newtypes shared across the dimmon crates.
//!
//! The kernel never panics on a recoverable condition; every fallible entry
//! point returns one of the closed set of [`DmmError`] kinds below, mirrored
//! directly off the `errno` values the original C runtime returned.

use std::fmt;

/// The closed error taxonomy the kernel reports. Every variant corresponds to
/// one POSIX errno the reference implementation used; callers that need the
/// raw code can go through [`DmmError::as_errno`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DmmError {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("out of memory")]
    OutOfMemory,
    #[error("operation not supported")]
    NotSupported,
    #[error("exists with conflicting attributes")]
    ExistsWithConflict,
    #[error("not connected")]
    NotConnected,
    #[error("interrupted")]
    Interrupted,
}

impl DmmError {
    /// The POSIX errno this kind was modeled on, for wire/log compatibility
    /// with the reference implementation.
    pub const fn as_errno(self) -> i32 {
        match self {
            DmmError::InvalidArgument => libc_errno::EINVAL,
            DmmError::NotFound => libc_errno::ENOENT,
            DmmError::AlreadyExists => libc_errno::EEXIST,
            DmmError::OutOfMemory => libc_errno::ENOMEM,
            DmmError::NotSupported => libc_errno::ENOTSUP,
            DmmError::ExistsWithConflict => libc_errno::EADDRINUSE,
            DmmError::NotConnected => libc_errno::ENOTCONN,
            DmmError::Interrupted => libc_errno::EINTR,
        }
    }
}

/// Small local stand-in for the handful of errno constants we reference, so
/// this crate does not need to pull in a libc dependency just for logging
/// parity with the original implementation.
mod libc_errno {
    pub const EINVAL: i32 = 22;
    pub const ENOENT: i32 = 2;
    pub const EEXIST: i32 = 17;
    pub const ENOMEM: i32 = 12;
    pub const ENOTSUP: i32 = 95;
    pub const EADDRINUSE: i32 = 98;
    pub const ENOTCONN: i32 = 107;
    pub const EINTR: i32 = 4;
}

pub type DmmResult<T> = Result<T, DmmError>;

/// Maximum byte length of a node name or hook name, *including* the implicit
/// terminator the C original reserved space for. A name may therefore use at
/// most `NAME_LIMIT - 1` bytes.
pub const NAME_LIMIT: usize = 32;

/// Validates a node or hook name: non-empty, free of the `[`/`]` bracket
/// characters reserved for `[id]` address syntax, and within [`NAME_LIMIT`].
pub fn validate_name(name: &str) -> DmmResult<()> {
    if name.is_empty() || name.len() >= NAME_LIMIT {
        return Err(DmmError::InvalidArgument);
    }
    if name.bytes().any(|b| b == b'[' || b == b']') {
        return Err(DmmError::InvalidArgument);
    }
    Ok(())
}

/// Validates a registry type name under the same length limit as node/hook
/// names, but without the bracket restriction (type names never appear in
/// `[id]` addressing).
pub fn validate_type_name(name: &str) -> DmmResult<()> {
    if name.is_empty() || name.len() >= NAME_LIMIT {
        return Err(DmmError::InvalidArgument);
    }
    Ok(())
}

macro_rules! id_newtype {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(u64);

        impl $name {
            pub const fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

/// Direction of a hook attachment point. Shared between the registry (whose
/// `NodeType` callbacks are told which direction a hook is) and the graph
/// (which enforces the per-(node, direction) name uniqueness).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookDirection {
    In,
    Out,
}

id_newtype!(NodeId, "Unique, monotonically allocated, nonzero node identifier.");
id_newtype!(HookId, "Unique, process-global hook identifier (not part of the wire protocol).");
id_newtype!(EventId, "Unique identifier shared by all concrete event kinds (timer, sockevent, wavefinish).");

/// Monotonic id allocator. Ids are never reused within a run (invariant 2).
#[derive(Debug, Default)]
pub struct IdAllocator {
    next: u64,
}

impl IdAllocator {
    pub const fn new() -> Self {
        Self { next: 0 }
    }

    /// Returns the next id, starting at 1 (0 is reserved to mean "system" / "no id").
    pub fn alloc(&mut self) -> u64 {
        self.next += 1;
        self.next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_at_limit_minus_one_accepted() {
        let name = "a".repeat(NAME_LIMIT - 1);
        assert!(validate_name(&name).is_ok());
    }

    #[test]
    fn name_at_limit_rejected() {
        let name = "a".repeat(NAME_LIMIT);
        assert_eq!(validate_name(&name), Err(DmmError::InvalidArgument));
    }

    #[test]
    fn name_with_brackets_rejected() {
        assert_eq!(validate_name("foo[bar]"), Err(DmmError::InvalidArgument));
    }

    #[test]
    fn empty_name_rejected() {
        assert_eq!(validate_name(""), Err(DmmError::InvalidArgument));
    }

    #[test]
    fn id_allocator_is_monotonic_and_nonzero() {
        let mut alloc = IdAllocator::new();
        let a = alloc.alloc();
        let b = alloc.alloc();
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_ne!(a, b);
    }
}
