//! Error types for collector configuration and fatal invariant violations.
//!
//! Most GC error paths are recoverable and modeled as state transitions
//! (degraded mode, pinning-on-OOM, skipped threads) rather than `Result`s —
//! see the module docs on `minor` and `stw`. Only configuration errors and
//! structural invariant violations are fatal.

use thiserror::Error;

/// Fatal errors raised during collector configuration or initialization.
#[derive(Debug, Error)]
pub enum GcError {
    /// A `key=value` configuration pair could not be parsed.
    #[error("invalid GC configuration `{key}`: {reason}")]
    Config {
        /// The offending key.
        key: String,
        /// Why it was rejected.
        reason: String,
    },

    /// `max-heap-size` was configured smaller than `4 * nursery-size`.
    #[error(
        "max-heap-size ({max_heap_size}) must be at least 4x nursery-size ({nursery_size})"
    )]
    HeapTooSmall {
        /// Configured max heap size.
        max_heap_size: usize,
        /// Configured nursery size.
        nursery_size: usize,
    },

    /// An unknown value was given for a `major=` or `wbarrier=` style enum key.
    #[error("unknown value `{value}` for GC option `{key}`")]
    UnknownVariant {
        /// The option key.
        key: String,
        /// The rejected value.
        value: String,
    },
}

/// Result alias for configuration/init paths.
pub type GcResult<T> = Result<T, GcError>;
