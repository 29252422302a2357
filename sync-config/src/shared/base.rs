use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// Maximum processing workers cannot be zero.
    #[error("`max_processing_workers` cannot be zero")]
    MaxProcessingWorkersZero,
    /// Maximum typing workers cannot be zero.
    #[error("`typing.max_workers` cannot be zero")]
    MaxTypingWorkersZero,
    /// A field holds a value outside of its allowed range.
    #[error("invalid value for `{field}`: {constraint}")]
    InvalidFieldValue { field: String, constraint: String },
}
