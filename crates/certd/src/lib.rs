//! Certd: certificate lifecycle engine
//!
//! Supplies TLS certificates on demand from one of three sources:
//!
//! - **Certificate store**: a pluggable key-value backend (directory, memory,
//!   Redis) holding PEM bundles
//! - **Certificate authority**: issuance through a [`CertificateIssuer`], then
//!   background renewal and optional OCSP stapling per domain
//! - **Self-signed fallback**: one lazily generated, persisted certificate
//!   shared by every domain allowed to use it
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use certd::{CertManager, MemoryStore};
//!
//! let manager = CertManager::builder(Arc::new(MemoryStore::new()))
//!     .self_signed(true, false)
//!     .build()?;
//! let cert = manager.get_certificate("test.local").await?;
//! ```

// ============================================================================
// Module Declarations
// ============================================================================

pub mod cert;
pub mod error;
pub mod issuer;
pub mod manager;
pub mod metrics;
pub mod ocsp;
pub mod policy;
pub mod renewal;
pub mod resolver;
pub mod self_signed;
pub mod state;
pub mod store;
pub mod timer;

// ============================================================================
// Public API Re-exports
// ============================================================================

// Certificate model
pub use cert::{decode_bundle, encode_bundle, Certificate, KeyMaterial, LeafInfo};

// Errors
pub use error::{CertError, CertResult, IssuanceError, OcspError, StoreError};

// Collaborator boundaries
pub use issuer::CertificateIssuer;
pub use ocsp::{OcspFetcher, OcspUpdater};

// Storage
pub use store::{CertStore, DirStore, MemoryStore};
#[cfg(feature = "redis-store")]
pub use store::RedisStore;

// Policy
pub use policy::{CertSource, ConfigPolicy, DnsNameValidator, DomainPolicy, HostValidator};

// Lifecycle
pub use manager::{CertManager, CertManagerBuilder};
pub use metrics::CertMetrics;
pub use renewal::RenewalScheduler;
pub use resolver::CertResolver;
pub use self_signed::{generate_self_signed, SelfSignedProvisioner, SelfSignedSettings};
pub use state::{CertificateState, OcspStaple};
pub use timer::Timing;
