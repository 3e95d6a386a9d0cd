use thiserror::Error;

/// Why an allocator operation failed.
///
/// Every failure is reported by the call that caused it; nothing is retried
/// except the single pool growth inside an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PoolError {
    /// `init` was called on an allocator that is already initialized.
    #[error("allocator is already initialized")]
    AlreadyInitialized,

    /// The allocator was used, or shut down, before `init`.
    #[error("allocator is not initialized")]
    NotInitialized,

    /// The pool size given to `init` cannot hold even one minimum block.
    #[error("a pool of {requested} bytes is too small to hold any block")]
    PoolTooSmall { requested: usize },

    /// The request is larger than any block a pool can hold. Nothing changed.
    #[error("request of {requested} bytes exceeds the maximum of {max}")]
    OversizeRequest { requested: usize, max: usize },

    /// No free block is large enough, and no new pool could be added.
    #[error("out of memory for a request of {requested} bytes")]
    OutOfMemory { requested: usize },

    /// `free` was given a null pointer.
    #[error("attempted to free a null pointer")]
    NullFree,

    /// Aligned allocation is not supported.
    #[error("aligned allocation is not implemented")]
    Unimplemented,
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_env_log::test;

    #[test]
    fn test_messages() {
        let err = PoolError::OversizeRequest {
            requested: 2000,
            max: 984,
        };
        assert_eq!(
            err.to_string(),
            "request of 2000 bytes exceeds the maximum of 984"
        );
        assert_eq!(
            PoolError::NullFree.to_string(),
            "attempted to free a null pointer"
        );
    }
}
