use crate::record::RecordId;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Distinct error kinds the core can raise. Per the propagation policy,
/// `normalize`/`materialize` never return these for data-shape problems —
/// only the compiler, planner, and canonical connection engine can fail.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("malformed document: {message}")]
    MalformedDocument { message: String },

    #[error("unknown fragment name {name:?}")]
    UnknownFragmentName { name: String },

    #[error("invalid page for connection {connection_key:?}: {message}")]
    InvalidPage {
        connection_key: String,
        message: String,
    },

    /// Surfaced by callers that choose to convert a `source: None` read into
    /// an error; the core itself only ever returns `source: None`.
    #[error("cache miss for {dependencies:?}")]
    CacheMiss { dependencies: Vec<RecordId> },

    /// Reserved for the operations layer: a response arrived after a newer
    /// request for the same signature and was ignored. The core never
    /// constructs this variant itself.
    #[error("stale response for signature {signature:?}")]
    StaleResponse { signature: String },
}
