#![forbid(unsafe_code)]
//! Error types for jext.
//!
//! # Error Taxonomy
//!
//! jext uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `jext-types` | On-disk format violations detected during byte parsing |
//! | Runtime | `JextError` | `jext-error` (this crate) | User-facing errors for the VFS boundary, CLI, and API consumers |
//!
//! ## Mapping Policy: ParseError → JextError
//!
//! `jext-error` is intentionally independent of `jext-types` and `jext-ondisk`
//! to avoid cyclic dependencies. Conversions happen at the crate boundary that
//! owns the context:
//!
//! | ParseError Variant | JextError Variant | Rationale |
//! |--------------------|-------------------|-----------|
//! | `InsufficientData` | `Corruption { block, detail }` | Truncated metadata indicates corruption or a truncated image |
//! | `InvalidMagic` | `Format(detail)` | Wrong magic means wrong filesystem type, not corruption |
//! | `InvalidField` | `Format` / `InvalidGeometry` / `UnsupportedFeature` | Mount validation adds context from field+reason |
//! | `IntegerConversion` | `Corruption { block, detail }` | Arithmetic overflow in parsed values suggests corruption |
//!
//! During mount-time validation (before the filesystem is live) prefer
//! `Format`; while reading live metadata prefer `Corruption` with the block
//! number so a repair tool can triage.
//!
//! ## Severity Classes
//!
//! Three classes matter to the error-state machinery in `jext-core`:
//!
//! | Class | Variants | Effect |
//! |-------|----------|--------|
//! | Benign | `NoSpace`, `Busy`, `NotFound`, `Exists`, `NotDirectory`, `IsDirectory`, `NotEmpty`, `NameTooLong`, `ReadOnly` | Reported to the caller; filesystem state untouched |
//! | Damage | `Io`, `Corruption`, `Journal` | Recorded in the superblock error state; mount-configured policy applies |
//! | Fatal | `Halted` | Instance poisoned by the halt policy; every call fails |
//!
//! ## errno Mapping
//!
//! Every variant maps to exactly one POSIX errno via [`JextError::to_errno`].
//! The mapping is exhaustive (no wildcard arms) so adding a new variant is a
//! compile error until its errno is assigned.
//!
//! | Variant | errno | Constant |
//! |---------|-------|----------|
//! | `Io` | `EIO` | 5 |
//! | `Corruption` | `EIO` | 5 |
//! | `Journal` | `EIO` | 5 |
//! | `Halted` | `EIO` | 5 |
//! | `Format` | `EINVAL` | 22 |
//! | `Parse` | `EINVAL` | 22 |
//! | `InvalidGeometry` | `EINVAL` | 22 |
//! | `UnsupportedFeature` | `EOPNOTSUPP` | 95 |
//! | `IncompatibleFeature` | `EOPNOTSUPP` | 95 |
//! | `Busy` | `EAGAIN` | 11 |
//! | `NoSpace` | `ENOSPC` | 28 |
//! | `NotFound` | `ENOENT` | 2 |
//! | `ReadOnly` | `EROFS` | 30 |
//! | `NotDirectory` | `ENOTDIR` | 20 |
//! | `IsDirectory` | `EISDIR` | 21 |
//! | `NotEmpty` | `ENOTEMPTY` | 39 |
//! | `NameTooLong` | `ENAMETOOLONG` | 36 |
//! | `Exists` | `EEXIST` | 17 |

use thiserror::Error;

/// Unified error type for all jext operations.
///
/// This is the canonical error returned by the VFS-facing API, CLI commands,
/// and public surfaces. Crate-internal errors (e.g. `ParseError` from
/// `jext-types`) convert into `JextError` at their crate boundaries.
#[derive(Debug, Error)]
pub enum JextError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk metadata corruption detected at a known block.
    ///
    /// Used when live metadata reads produce invalid data (bad checksum,
    /// out-of-range field values, structural violations). The `block` field
    /// enables repair triage.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// Invalid on-disk format (wrong filesystem type, bad superblock).
    ///
    /// Used during mount-time validation when the image structure is
    /// fundamentally wrong.
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Parse-layer error surfaced to the user.
    ///
    /// Carries the string representation of a `ParseError`. Prefer
    /// `Corruption` or `Format` when the block number or mount context is
    /// known.
    #[error("parse error: {0}")]
    Parse(String),

    /// The image uses a feature this build does not support.
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    /// Unknown incompatible feature bits, or a required compatibility
    /// contract that cannot be satisfied. Refuses the mount.
    #[error("incompatible feature set: {0}")]
    IncompatibleFeature(String),

    /// On-disk geometry is invalid or out of the supported range.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// Journaling protocol failure: access declared out of order, credits
    /// exhausted without a successful extend, or an engine-side fault.
    #[error("journal: {detail}")]
    Journal { detail: String },

    /// Transient contention; the operation may succeed if retried.
    ///
    /// Surfaced only after the allocator's internal retry budget is spent.
    #[error("resource busy, retry")]
    Busy,

    /// No free blocks or inodes available.
    #[error("no space left on device")]
    NoSpace,

    /// File, directory, or other named object not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Filesystem is read-only (mounted so, or demoted by the error policy)
    /// and a write was attempted.
    #[error("read-only filesystem")]
    ReadOnly,

    /// Instance halted by the errors=halt policy after a metadata failure.
    #[error("filesystem halted after error")]
    Halted,

    /// A path component is not a directory.
    #[error("not a directory")]
    NotDirectory,

    /// Attempted a file operation on a directory.
    #[error("is a directory")]
    IsDirectory,

    /// rmdir on a non-empty directory.
    #[error("directory not empty")]
    NotEmpty,

    /// Filename exceeds the 255-byte name limit.
    #[error("name too long")]
    NameTooLong,

    /// Target already exists.
    #[error("file exists")]
    Exists,
}

impl JextError {
    /// Convert this error into a POSIX errno for the VFS boundary.
    ///
    /// The mapping is exhaustive: every variant has an explicit arm. Adding
    /// a new variant without updating this function is a compile error.
    ///
    /// Policy notes:
    /// - `Busy` → `EAGAIN`: the caller may retry at a higher layer.
    /// - `Journal` → `EIO`: a journaling failure is indistinguishable from a
    ///   device fault to the caller, and triggers the same error policy.
    /// - `Halted` → `EIO`: the instance is poisoned; only unmount helps.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } | Self::Journal { .. } | Self::Halted => libc::EIO,
            Self::Format(_) | Self::Parse(_) | Self::InvalidGeometry(_) => libc::EINVAL,
            Self::UnsupportedFeature(_) | Self::IncompatibleFeature(_) => libc::EOPNOTSUPP,
            Self::Busy => libc::EAGAIN,
            Self::NoSpace => libc::ENOSPC,
            Self::NotFound(_) => libc::ENOENT,
            Self::ReadOnly => libc::EROFS,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::Exists => libc::EEXIST,
        }
    }

    /// Whether this error reflects transient contention worth retrying.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Busy)
    }

    /// Whether this error must trip the superblock error state
    /// (metadata damage, as opposed to a benign per-call failure).
    #[must_use]
    pub fn is_damage(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Corruption { .. } | Self::Journal { .. }
        )
    }
}

/// Result alias using `JextError`.
pub type Result<T> = std::result::Result<T, JextError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(JextError, libc::c_int)> = vec![
            (JextError::Io(std::io::Error::other("test")), libc::EIO),
            (
                JextError::Corruption {
                    block: 0,
                    detail: "test".into(),
                },
                libc::EIO,
            ),
            (JextError::Format("test".into()), libc::EINVAL),
            (JextError::Parse("test".into()), libc::EINVAL),
            (
                JextError::UnsupportedFeature("COMPRESSION".into()),
                libc::EOPNOTSUPP,
            ),
            (
                JextError::IncompatibleFeature("unknown incompat bits 0x80".into()),
                libc::EOPNOTSUPP,
            ),
            (
                JextError::InvalidGeometry("blocks_per_group=0".into()),
                libc::EINVAL,
            ),
            (
                JextError::Journal {
                    detail: "credits exhausted".into(),
                },
                libc::EIO,
            ),
            (JextError::Busy, libc::EAGAIN),
            (JextError::NoSpace, libc::ENOSPC),
            (JextError::NotFound("test".into()), libc::ENOENT),
            (JextError::ReadOnly, libc::EROFS),
            (JextError::Halted, libc::EIO),
            (JextError::NotDirectory, libc::ENOTDIR),
            (JextError::IsDirectory, libc::EISDIR),
            (JextError::NotEmpty, libc::ENOTEMPTY),
            (JextError::NameTooLong, libc::ENAMETOOLONG),
            (JextError::Exists, libc::EEXIST),
        ];

        for (error, expected_errno) in &cases {
            assert_eq!(
                error.to_errno(),
                *expected_errno,
                "wrong errno for {error:?}",
            );
        }
    }

    #[test]
    fn io_error_preserves_raw_os_error() {
        let raw = std::io::Error::from_raw_os_error(libc::EPERM);
        let err = JextError::Io(raw);
        assert_eq!(err.to_errno(), libc::EPERM);
    }

    #[test]
    fn display_formatting() {
        let err = JextError::Corruption {
            block: 42,
            detail: "bad orphan table checksum".into(),
        };
        assert_eq!(
            err.to_string(),
            "corrupt metadata at block 42: bad orphan table checksum"
        );

        assert_eq!(JextError::ReadOnly.to_string(), "read-only filesystem");
        assert_eq!(JextError::Busy.to_string(), "resource busy, retry");
        assert_eq!(
            JextError::Journal {
                detail: "mark_dirty without write access".into()
            }
            .to_string(),
            "journal: mark_dirty without write access"
        );
    }

    #[test]
    fn severity_classes() {
        assert!(JextError::Busy.is_transient());
        assert!(!JextError::NoSpace.is_transient());

        assert!(JextError::Io(std::io::Error::other("disk gone")).is_damage());
        assert!(
            JextError::Corruption {
                block: 7,
                detail: "x".into()
            }
            .is_damage()
        );
        assert!(
            JextError::Journal {
                detail: "x".into()
            }
            .is_damage()
        );
        // Space exhaustion and contention never trip the error state.
        assert!(!JextError::NoSpace.is_damage());
        assert!(!JextError::Busy.is_damage());
        assert!(!JextError::NotFound("x".into()).is_damage());
    }

    #[test]
    fn mount_validation_errnos_are_distinct() {
        let unsup = JextError::UnsupportedFeature("COMPRESSION".into());
        let incompat = JextError::IncompatibleFeature("unknown incompat bits".into());
        let geom = JextError::InvalidGeometry("bad block size".into());
        let fmt = JextError::Format("bad magic".into());

        assert_eq!(unsup.to_errno(), libc::EOPNOTSUPP);
        assert_eq!(incompat.to_errno(), libc::EOPNOTSUPP);
        assert_eq!(geom.to_errno(), libc::EINVAL);
        assert_eq!(fmt.to_errno(), libc::EINVAL);
        assert_ne!(unsup.to_errno(), geom.to_errno());
    }
}
