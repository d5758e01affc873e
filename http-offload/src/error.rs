use thiserror::Error;

/// A `Result` typedef to use with the [`CacheError`] type
pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors surfaced by cache lookups and stores.
#[derive(Error, Debug)]
pub enum CacheError {
    /// The per-lookup deadline elapsed before the engine could answer,
    /// usually because the cache lock is contended.
    #[error("cache lookup timed out")]
    LookupTimeout,
    /// A general error used as a catch all for other errors via anyhow
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
    /// Error from the Redis backend
    #[cfg(feature = "backend-redis")]
    #[error(transparent)]
    Redis(#[from] redis::RedisError),
    /// A stored record could not be encoded or decoded
    #[cfg(feature = "backend-redis")]
    #[error(transparent)]
    Encoding(#[from] postcard::Error),
    /// A stored record carried an invalid status code
    #[cfg(feature = "backend-redis")]
    #[error(transparent)]
    InvalidStatusCode(#[from] http::status::InvalidStatusCode),
    /// A stored record carried an invalid header name
    #[cfg(feature = "backend-redis")]
    #[error(transparent)]
    InvalidHeaderName(#[from] http::header::InvalidHeaderName),
    /// A stored record carried an invalid header value
    #[cfg(feature = "backend-redis")]
    #[error(transparent)]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),
}
