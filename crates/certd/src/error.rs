//! Error types for the certificate lifecycle engine.

use std::time::Duration;

use thiserror::Error;

/// Result type for certificate operations.
pub type CertResult<T> = Result<T, CertError>;

/// Certificate store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// No entry under this key. Expected on first use.
    #[error("cache miss: {0}")]
    NotFound(String),

    /// Key cannot be mapped onto the backend
    #[error("invalid cache key '{0}'")]
    InvalidKey(String),

    /// Local I/O failure
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Remote backend failure
    #[error("store backend error: {0}")]
    Backend(String),
}

impl Clone for StoreError {
    fn clone(&self) -> Self {
        match self {
            Self::NotFound(key) => Self::NotFound(key.clone()),
            Self::InvalidKey(key) => Self::InvalidKey(key.clone()),
            Self::Io(e) => Self::Io(std::io::Error::new(e.kind(), e.to_string())),
            Self::Backend(msg) => Self::Backend(msg.clone()),
        }
    }
}

impl StoreError {
    /// Whether this is a plain cache miss
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Failure reported by the certificate authority client.
///
/// Recoverable: background renewal retries after a short backoff.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct IssuanceError(String);

impl IssuanceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Failure fetching an OCSP response. The previous staple stays in place.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct OcspError(String);

impl OcspError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Errors from certificate acquisition, renewal and stapling
#[derive(Debug, Error)]
pub enum CertError {
    /// Certificate store failure (a miss is reported separately by the store)
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Key or certificate construction failed
    #[error("certificate generation failed: {0}")]
    Generation(String),

    /// The certificate authority refused or failed the request
    #[error("certificate issuance failed: {0}")]
    Issuance(#[from] IssuanceError),

    /// OCSP responder failure
    #[error("OCSP fetch failed: {0}")]
    Ocsp(#[from] OcspError),

    /// Stored or issued material could not be decoded
    #[error("invalid certificate data: {0}")]
    Parse(String),

    /// Policy does not allow any certificate for this name
    #[error("no certificate allowed for domain '{0}'")]
    NotAllowed(String),

    /// Domain routes to the certificate authority but none is configured
    #[error("no certificate issuer configured for domain '{0}'")]
    NoIssuer(String),

    /// A blocking call exceeded its deadline
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The owning manager has been dropped
    #[error("certificate manager has shut down")]
    Shutdown,

    /// Metric registration failed
    #[error("metrics error: {0}")]
    Metrics(String),
}

impl From<prometheus::Error> for CertError {
    fn from(e: prometheus::Error) -> Self {
        Self::Metrics(e.to_string())
    }
}

/// Waiters on a shared acquisition each receive a copy of its error
impl Clone for CertError {
    fn clone(&self) -> Self {
        match self {
            Self::Store(e) => Self::Store(e.clone()),
            Self::Generation(msg) => Self::Generation(msg.clone()),
            Self::Issuance(e) => Self::Issuance(e.clone()),
            Self::Ocsp(e) => Self::Ocsp(e.clone()),
            Self::Parse(msg) => Self::Parse(msg.clone()),
            Self::NotAllowed(domain) => Self::NotAllowed(domain.clone()),
            Self::NoIssuer(domain) => Self::NoIssuer(domain.clone()),
            Self::Timeout(after) => Self::Timeout(*after),
            Self::Shutdown => Self::Shutdown,
            Self::Metrics(msg) => Self::Metrics(msg.clone()),
        }
    }
}

impl CertError {
    /// Whether the underlying cause is a cache miss
    pub fn is_not_found(&self) -> bool {
        matches!(self, CertError::Store(e) if e.is_not_found())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clone_keeps_variant_and_message() {
        let err = CertError::Store(StoreError::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "permission denied",
        )));
        let copy = err.clone();
        assert!(matches!(&copy, CertError::Store(StoreError::Io(e)) if e.kind() == std::io::ErrorKind::PermissionDenied));
        assert_eq!(copy.to_string(), err.to_string());

        let err = CertError::Issuance(IssuanceError::new("rate limited"));
        assert!(matches!(err.clone(), CertError::Issuance(_)));
        assert!(CertError::Store(StoreError::NotFound("a".into())).clone().is_not_found());
    }
}
