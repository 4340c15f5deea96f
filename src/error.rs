/*!
 * Error Handling for the protkey Library
 *
 * Provides the crate-wide error type with stable numeric result codes,
 * mirroring the result-code surface of the accelerator's client protocol.
 */

use thiserror::Error;

/// Comprehensive error type for all key-management and cipher operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid argument at position {position}")]
    InvalidArgument { position: usize },

    #[error("operation requires key material that is not set")]
    KeyNotSet,

    #[error("operation requires an IV that is not set")]
    IvNotSet,

    #[error("operation requires a key size that is not set")]
    SizeNotSet,

    #[error("operation requires a key type that is not set")]
    TypeNotSet,

    #[error("memory allocation failed")]
    OutOfMemory,

    #[error("adapter directory query failed")]
    AdapterQueryFailed,

    #[error("no adapter matches the given master key verification pattern")]
    ApqnNotFound,

    #[error("malformed secure key token")]
    MalformedToken,

    #[error("protected key cannot be re-derived: no secure token backs it")]
    ProtectedKeyOnly,

    #[error("paired keys have unequal sizes")]
    SizeMismatch,

    #[error("unsupported key size: {0} bits")]
    UnsupportedSize(u32),

    #[error("unsupported key type for this operation")]
    UnsupportedType,

    #[error("key material is too weak to import")]
    WeakMaterial,

    #[error("message length outside the supported range")]
    InvalidMessageLength,

    #[error("accelerator operation '{op}' failed: {cause}")]
    Accelerator { op: &'static str, cause: String },
}

/// Stable numeric result codes, one per error variant.
///
/// The code space deliberately leaves room between groups: argument and
/// state errors below 20, resource and query errors in the 20s, token and
/// key-material errors in the 30s, accelerator failures at 90.
pub mod codes {
    pub const INVALID_ARGUMENT: u32 = 1;
    pub const KEY_NOT_SET: u32 = 10;
    pub const IV_NOT_SET: u32 = 11;
    pub const SIZE_NOT_SET: u32 = 12;
    pub const TYPE_NOT_SET: u32 = 13;
    pub const OUT_OF_MEMORY: u32 = 20;
    pub const ADAPTER_QUERY_FAILED: u32 = 21;
    pub const APQN_NOT_FOUND: u32 = 22;
    pub const MALFORMED_TOKEN: u32 = 30;
    pub const PROTECTED_KEY_ONLY: u32 = 31;
    pub const SIZE_MISMATCH: u32 = 32;
    pub const UNSUPPORTED_SIZE: u32 = 33;
    pub const UNSUPPORTED_TYPE: u32 = 34;
    pub const WEAK_MATERIAL: u32 = 35;
    pub const INVALID_MESSAGE_LENGTH: u32 = 36;
    pub const ACCELERATOR_FAILURE: u32 = 90;
}

impl Error {
    /// Get the stable numeric code for this error
    pub fn code(&self) -> u32 {
        match self {
            Error::InvalidArgument { .. } => codes::INVALID_ARGUMENT,
            Error::KeyNotSet => codes::KEY_NOT_SET,
            Error::IvNotSet => codes::IV_NOT_SET,
            Error::SizeNotSet => codes::SIZE_NOT_SET,
            Error::TypeNotSet => codes::TYPE_NOT_SET,
            Error::OutOfMemory => codes::OUT_OF_MEMORY,
            Error::AdapterQueryFailed => codes::ADAPTER_QUERY_FAILED,
            Error::ApqnNotFound => codes::APQN_NOT_FOUND,
            Error::MalformedToken => codes::MALFORMED_TOKEN,
            Error::ProtectedKeyOnly => codes::PROTECTED_KEY_ONLY,
            Error::SizeMismatch => codes::SIZE_MISMATCH,
            Error::UnsupportedSize(_) => codes::UNSUPPORTED_SIZE,
            Error::UnsupportedType => codes::UNSUPPORTED_TYPE,
            Error::WeakMaterial => codes::WEAK_MATERIAL,
            Error::InvalidMessageLength => codes::INVALID_MESSAGE_LENGTH,
            Error::Accelerator { .. } => codes::ACCELERATOR_FAILURE,
        }
    }

    /// Build an `InvalidArgument` error for the given 1-based argument position
    pub fn invalid_argument(position: usize) -> Self {
        Error::InvalidArgument { position }
    }

    /// Build an `Accelerator` error for a failed primitive invocation
    pub fn accelerator(op: &'static str, cause: impl Into<String>) -> Self {
        Error::Accelerator {
            op,
            cause: cause.into(),
        }
    }
}

/// Result type alias for all library operations
pub type Result<T> = std::result::Result<T, Error>;
