//! Error types for the shuffle server.

/// Errors that can occur while receiving or persisting shuffle data.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The reception buffers cannot take the request.
    #[error("no buffer: need {requested} bytes, only {available} available")]
    NoBuffer {
        /// Bytes the request carries.
        requested: u64,
        /// Bytes left before the buffer capacity.
        available: u64,
    },

    /// No configured tier accepted a flush.
    #[error("every storage tier rejected the flush of {partition}: {reason}")]
    AllTiersFailed {
        /// Partition whose buffer was being flushed.
        partition: String,
        /// Error of the last tier tried.
        reason: String,
    },

    /// A storage tier failed.
    #[error("store error: {0}")]
    Store(#[from] eddy_store::StoreError),

    /// Nothing was ever committed or reported for this shuffle.
    #[error("unknown shuffle {app_id}/{shuffle_id}")]
    UnknownShuffle {
        app_id: String,
        shuffle_id: u32,
    },

    /// A commit could not drain the buffers of a shuffle.
    #[error("commit of {app_id}/{shuffle_id} left {remaining} bytes unflushed")]
    CommitIncomplete {
        app_id: String,
        shuffle_id: u32,
        remaining: u64,
    },

    /// The server was configured without storage tiers.
    #[error("no storage tiers configured")]
    NoTiers,
}
