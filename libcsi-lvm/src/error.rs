//! CSI error types.
//!
//! All errors surfaced by the driver are represented by the [`CsiError`] enum,
//! which derives [`thiserror::Error`] for ergonomic error handling and also
//! implements [`Serialize`]/[`Deserialize`] so errors can travel back to the
//! caller inside a response envelope.
//!
//! Every variant belongs to exactly one RPC status category, see
//! [`CsiError::code`].

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// RPC status categories, numbered like the gRPC status codes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Code {
    /// Client specified an invalid argument.
    InvalidArgument = 3,
    /// Some requested entity was not found.
    NotFound = 5,
    /// An entity with the same key but incompatible attributes exists.
    AlreadyExists = 6,
    /// Some resource has been exhausted.
    ResourceExhausted = 8,
    /// The system is not in a state required for the operation's execution.
    FailedPrecondition = 9,
    /// The operation was aborted; the caller should retry.
    Aborted = 10,
    /// Internal error.
    Internal = 13,
    /// The service is currently unavailable.
    Unavailable = 14,
}

impl Code {
    /// Human-readable description of this code.
    #[must_use]
    pub const fn description(&self) -> &'static str {
        match self {
            Code::InvalidArgument => "Client specified an invalid argument",
            Code::NotFound => "Some requested entity was not found",
            Code::AlreadyExists => "Some entity that we attempted to create already exists",
            Code::ResourceExhausted => "Some resource has been exhausted",
            Code::FailedPrecondition => {
                "The system is not in a state required for the operation's execution"
            }
            Code::Aborted => "The operation was aborted",
            Code::Internal => "Internal error",
            Code::Unavailable => "The service is currently unavailable",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Unified error type for CSI operations.
#[derive(Debug, Error, Serialize, Deserialize, Clone)]
pub enum CsiError {
    /// A volume with the same name but incompatible attributes exists.
    #[error("volume {0} already exists with incompatible attributes")]
    VolumeAlreadyExists(String),

    /// A snapshot with the same name and source exists with a different id.
    #[error("snapshot {0} already exists with incompatible attributes")]
    SnapshotAlreadyExists(String),

    /// The requested volume was not found.
    #[error("volume {0} not found")]
    VolumeNotFound(String),

    /// The requested snapshot was not found.
    #[error("snapshot {0} not found")]
    SnapshotNotFound(String),

    /// The volume group cannot satisfy the requested size.
    #[error("volume group {volume_group} has {available} bytes free, {requested} requested")]
    ResourceExhausted {
        /// Volume group that ran out of space.
        volume_group: String,
        /// Bytes requested (after rounding to the extent size).
        requested: u64,
        /// Bytes the backend reported as free.
        available: u64,
    },

    /// The operation conflicts with the current state of the volume or node.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// A mount operation failed.
    #[error("mount failed at {path}: {reason}")]
    MountFailed {
        /// Filesystem path where the mount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// An unmount operation failed.
    #[error("unmount failed at {path}: {reason}")]
    UnmountFailed {
        /// Filesystem path where the unmount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// The LVM backend returned an error.
    #[error("backend error: {0}")]
    BackendError(String),

    /// A socket / transport-level error.
    #[error("transport error: {0}")]
    TransportError(String),

    /// The caller supplied an invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A timeout or lock contention; retry with the same idempotency key.
    #[error("aborted: {0}")]
    Aborted(String),

    /// An unclassified internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CsiError {
    /// Create a [`CsiError::BackendError`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn backend<E: std::fmt::Display>(e: E) -> Self {
        Self::BackendError(e.to_string())
    }

    /// Create a [`CsiError::TransportError`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn transport<E: std::fmt::Display>(e: E) -> Self {
        Self::TransportError(e.to_string())
    }

    /// Create a [`CsiError::Internal`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    /// The RPC status category this error is reported under.
    #[must_use]
    pub fn code(&self) -> Code {
        match self {
            Self::VolumeAlreadyExists(_) | Self::SnapshotAlreadyExists(_) => Code::AlreadyExists,
            Self::VolumeNotFound(_) | Self::SnapshotNotFound(_) => Code::NotFound,
            Self::ResourceExhausted { .. } => Code::ResourceExhausted,
            Self::FailedPrecondition(_) => Code::FailedPrecondition,
            Self::InvalidArgument(_) => Code::InvalidArgument,
            Self::Aborted(_) => Code::Aborted,
            Self::TransportError(_) => Code::Unavailable,
            Self::MountFailed { .. }
            | Self::UnmountFailed { .. }
            | Self::BackendError(_)
            | Self::Internal(_) => Code::Internal,
        }
    }

    /// Whether the caller should retry the same request unchanged.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self.code(), Code::Aborted | Code::Unavailable)
    }
}
