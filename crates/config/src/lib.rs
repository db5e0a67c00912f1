//! Configuration for the certd certificate daemon.
//!
//! Configuration is read from a KDL document, or from TOML when the file
//! extension is `.toml`. Every field has a default so an empty document is a
//! valid (if not very useful) configuration.
//!
//! # Example
//!
//! ```kdl
//! storage {
//!     backend "directory"
//!     path "/var/lib/certd"
//! }
//!
//! renewal {
//!     renew-before-days 30
//! }
//!
//! self-signed {
//!     enable #true
//!     check-sni #false
//!     valid-days 3650
//!     organization "Example Org"
//!     cert-key "self-signed"
//! }
//!
//! domains {
//!     domain "example.com" {
//!         ocsp-stapling #true
//!     }
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use validator::Validate;

mod kdl;
mod validate;

pub use validate::is_valid_domain;

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file
    #[error("failed to read configuration {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The document could not be parsed
    #[error("failed to parse configuration: {0}")]
    Parse(String),

    /// The configuration parsed but is not usable
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// Root
// ============================================================================

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// Certificate store backend
    #[validate(nested)]
    pub storage: StorageConfig,

    /// Renewal and OCSP timing
    #[validate(nested)]
    pub renewal: RenewalConfig,

    /// Self-signed fallback certificate
    #[validate(nested)]
    pub self_signed: SelfSignedConfig,

    /// Domains served with certificates from the ACME authority
    #[validate(nested)]
    pub domains: Vec<DomainConfig>,
}

impl Config {
    /// Load configuration from a file.
    ///
    /// `.toml` files are parsed as TOML, anything else as KDL. The result is
    /// validated before it is returned.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let config = match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml_str(&content)?,
            _ => Self::from_kdl_str(&content)?,
        };

        info!(
            path = %path.display(),
            domain_count = config.domains.len(),
            self_signed = config.self_signed.enable,
            "Loaded configuration"
        );

        Ok(config)
    }

    /// Parse and validate a KDL document
    pub fn from_kdl_str(content: &str) -> Result<Self, ConfigError> {
        let config = kdl::parse_document(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate field ranges and cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        Validate::validate(self).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        validate::validate_config(self)?;
        debug!("Configuration validated");
        Ok(())
    }

    /// Look up a configured ACME domain
    pub fn domain(&self, name: &str) -> Option<&DomainConfig> {
        self.domains
            .iter()
            .find(|d| d.name.eq_ignore_ascii_case(name))
    }
}

// ============================================================================
// Storage
// ============================================================================

/// Certificate store backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// One file per cache key in a local directory
    #[default]
    Directory,
    /// Process-local memory, lost on restart
    Memory,
    /// Remote Redis key-value store
    Redis,
}

impl StorageBackend {
    /// Parse a backend name
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "directory" | "dir" => Some(Self::Directory),
            "memory" => Some(Self::Memory),
            "redis" => Some(Self::Redis),
            _ => None,
        }
    }
}

/// Certificate store configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default, rename_all = "kebab-case")]
pub struct StorageConfig {
    /// Backend kind
    pub backend: StorageBackend,

    /// Base directory for the directory backend
    pub path: Option<PathBuf>,

    /// Connection URL for the redis backend
    pub url: Option<String>,

    /// Key prefix for the redis backend
    pub prefix: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Directory,
            path: Some(PathBuf::from("/var/lib/certd")),
            url: None,
            prefix: default_redis_prefix(),
        }
    }
}

fn default_redis_prefix() -> String {
    "certd:".to_string()
}

// ============================================================================
// Renewal
// ============================================================================

/// Renewal and OCSP stapling timing
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default, rename_all = "kebab-case")]
pub struct RenewalConfig {
    /// Renew this many days before the certificate expires
    #[validate(range(min = 1, max = 3650))]
    pub renew_before_days: u32,

    /// Maximum random deviation subtracted from every deadline
    pub jitter_secs: u64,

    /// Deadline for one issuance attempt
    #[validate(range(min = 1))]
    pub attempt_timeout_secs: u64,

    /// Refresh the OCSP staple this many hours before its next update
    #[validate(range(max = 8760))]
    pub ocsp_window_hours: u64,

    /// Deadline for one OCSP fetch
    #[validate(range(min = 1))]
    pub ocsp_timeout_secs: u64,
}

impl Default for RenewalConfig {
    fn default() -> Self {
        Self {
            renew_before_days: 30,
            jitter_secs: 3600,
            attempt_timeout_secs: 600,
            ocsp_window_hours: 48,
            ocsp_timeout_secs: 300,
        }
    }
}

impl RenewalConfig {
    /// Renew-before window
    pub fn renew_before(&self) -> Duration {
        Duration::from_secs(u64::from(self.renew_before_days) * 86_400)
    }

    /// Jitter ceiling
    pub fn jitter(&self) -> Duration {
        Duration::from_secs(self.jitter_secs)
    }

    /// Issuance attempt deadline
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    /// OCSP safety window
    pub fn ocsp_window(&self) -> Duration {
        Duration::from_secs(self.ocsp_window_hours.saturating_mul(3600))
    }

    /// OCSP fetch deadline
    pub fn ocsp_timeout(&self) -> Duration {
        Duration::from_secs(self.ocsp_timeout_secs)
    }
}

// ============================================================================
// Self-signed fallback
// ============================================================================

/// Self-signed fallback certificate settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default, rename_all = "kebab-case")]
pub struct SelfSignedConfig {
    /// Allow serving a self-signed certificate
    pub enable: bool,

    /// Only self-sign for names that pass the host validity check
    pub check_sni: bool,

    /// Validity period of a generated certificate
    #[validate(range(min = 1, max = 36500))]
    pub valid_days: u32,

    /// Subject organization names
    #[validate(length(min = 1))]
    pub organization: Vec<String>,

    /// Cache key the generated key and certificate are stored under
    #[validate(length(min = 1))]
    pub cert_key: String,
}

impl Default for SelfSignedConfig {
    fn default() -> Self {
        Self {
            enable: false,
            check_sni: false,
            valid_days: 3650,
            organization: vec!["certd".to_string()],
            cert_key: "self-signed".to_string(),
        }
    }
}

// ============================================================================
// Domains
// ============================================================================

/// A domain whose certificate comes from the ACME authority
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "kebab-case")]
pub struct DomainConfig {
    /// DNS name
    #[validate(length(min = 1, max = 253))]
    pub name: String,

    /// Keep an OCSP staple fresh for this domain
    #[serde(default)]
    pub ocsp_stapling: bool,
}

impl DomainConfig {
    /// Create a domain entry without OCSP stapling
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ocsp_stapling: false,
        }
    }
}
