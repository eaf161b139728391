//! Error types for the native call bridge
//!
//! Only locally detectable failures are reported here. Memory corruption from
//! stale addresses, signature mismatches the size checks cannot see, or use of
//! freed stable buffers is undefined behavior and never surfaces as an error.

use thiserror::Error;

/// FFI bridge errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FfiError {
    /// Argument count disagrees with the type list length
    #[error("Expected {expected} arguments, got {got}")]
    ArityMismatch { expected: usize, got: usize },

    /// Argument byte length disagrees with the ABI size of its declared type
    #[error("Argument {index} is {got} bytes but its type `{ty}` is {expected} bytes")]
    TypeSizeMismatch {
        index: usize,
        ty: String,
        expected: usize,
        got: usize,
    },

    /// Variadic split index outside `0..=len(types)`
    #[error("Fixed parameter count {fixed_count} exceeds {total} argument types")]
    FixedCountOutOfRange { fixed_count: usize, total: usize },

    /// Type cannot be passed through the ABI adapter in this position
    #[error("Unsupported type `{ty}` in {position}: {reason}")]
    UnsupportedType {
        ty: String,
        position: String,
        reason: &'static str,
    },

    /// Call target is the null address
    #[error("Cannot call the null address")]
    NullAddress,

    /// The ABI adapter refused to prepare the call interface
    #[error("Failed to prepare call interface: {0}")]
    CifPreparation(&'static str),

    /// Native symbol lookup failed
    #[error("Symbol '{0}' not found in any loaded module")]
    SymbolNotFound(String),

    /// Library file not found in search paths
    #[error("Library not found: {0}")]
    LibraryNotFound(String),

    /// Library exists but could not be loaded
    #[error("Failed to load library: {0}")]
    LibraryLoadFailed(String),

    /// Allocation alignment is not a nonzero power of two
    #[error("Alignment {0} is not a power of two")]
    InvalidAlignment(usize),

    /// Allocation key already names a live allocation
    #[error("Allocation key {0} is already live")]
    DuplicateKey(String),

    /// Host allocator refused the request or the layout overflowed
    #[error("Failed to allocate {size} bytes aligned to {alignment}")]
    AllocationFailed { size: usize, alignment: usize },

    /// Live-bytes budget would be exceeded
    #[error("Arena budget exceeded: {requested} bytes requested, {live} of {limit} in use")]
    ArenaExhausted {
        requested: usize,
        live: usize,
        limit: usize,
    },

    /// Access past the end of a buffer
    #[error("Access of {len} bytes at offset {offset} exceeds buffer of {capacity} bytes")]
    OutOfBounds {
        offset: usize,
        len: usize,
        capacity: usize,
    },

    /// Type descriptor text does not follow the surface grammar
    #[error("Invalid type syntax at offset {offset}: {reason}")]
    InvalidTypeSyntax { offset: usize, reason: String },

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),

    /// Logging subscriber could not be installed
    #[error("Failed to initialize logging: {0}")]
    Logging(String),
}

impl From<atlas_ffi_config::ConfigError> for FfiError {
    fn from(e: atlas_ffi_config::ConfigError) -> Self {
        FfiError::Config(e.to_string())
    }
}

/// Result type for FFI operations
pub type FfiResult<T> = Result<T, FfiError>;
