//! Cross-field configuration checks.
//!
//! Field ranges are declared with `validator` attributes on the config types;
//! this module covers the constraints that span several fields.

use std::collections::HashSet;
use std::net::IpAddr;

use rustls::pki_types::DnsName;
use tracing::trace;

use crate::{Config, ConfigError, StorageBackend};

/// Whether `name` is a syntactically valid DNS host name.
///
/// IP literals and wildcards are rejected.
pub fn is_valid_domain(name: &str) -> bool {
    if name.is_empty() || name.contains('*') || name.parse::<IpAddr>().is_ok() {
        return false;
    }
    DnsName::try_from(name).is_ok()
}

pub(crate) fn validate_config(config: &Config) -> Result<(), ConfigError> {
    match config.storage.backend {
        StorageBackend::Directory if config.storage.path.is_none() => {
            return Err(ConfigError::Invalid(
                "storage backend 'directory' requires a 'path'".to_string(),
            ));
        }
        StorageBackend::Redis if config.storage.url.as_deref().unwrap_or("").is_empty() => {
            return Err(ConfigError::Invalid(
                "storage backend 'redis' requires a 'url'".to_string(),
            ));
        }
        _ => {}
    }

    if config.renewal.jitter() >= config.renewal.renew_before() {
        return Err(ConfigError::Invalid(format!(
            "renewal jitter ({}s) must be shorter than the renew-before window ({} days)",
            config.renewal.jitter_secs, config.renewal.renew_before_days
        )));
    }

    if config.self_signed.organization.iter().any(|o| o.trim().is_empty()) {
        return Err(ConfigError::Invalid(
            "self-signed organization names must not be empty".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for domain in &config.domains {
        if !is_valid_domain(&domain.name) {
            return Err(ConfigError::Invalid(format!(
                "invalid domain name '{}'",
                domain.name
            )));
        }
        if !seen.insert(domain.name.to_ascii_lowercase()) {
            return Err(ConfigError::Invalid(format!(
                "domain '{}' is configured more than once",
                domain.name
            )));
        }
        trace!(domain = %domain.name, "Validated domain entry");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DomainConfig;

    #[test]
    fn test_valid_domains() {
        assert!(is_valid_domain("example.com"));
        assert!(is_valid_domain("test.local"));
        assert!(is_valid_domain("a-b.example.co.uk"));
    }

    #[test]
    fn test_invalid_domains() {
        assert!(!is_valid_domain(""));
        assert!(!is_valid_domain("127.0.0.1"));
        assert!(!is_valid_domain("::1"));
        assert!(!is_valid_domain("*.example.com"));
        assert!(!is_valid_domain("bad domain.com"));
    }

    #[test]
    fn test_duplicate_domains_rejected() {
        let config = Config {
            domains: vec![
                DomainConfig::new("example.com"),
                DomainConfig::new("Example.com"),
            ],
            ..Default::default()
        };

        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_directory_backend_requires_path() {
        let mut config = Config::default();
        config.storage.path = None;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_redis_backend_requires_url() {
        let mut config = Config::default();
        config.storage.backend = StorageBackend::Redis;
        assert!(validate_config(&config).is_err());

        config.storage.url = Some("redis://127.0.0.1".to_string());
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_jitter_must_fit_in_window() {
        let mut config = Config::default();
        config.renewal.renew_before_days = 1;
        config.renewal.jitter_secs = 86_400;
        assert!(validate_config(&config).is_err());
    }
}
