//! Domain policy: which certificate source serves a requested name.

use std::collections::HashMap;
use std::sync::Arc;

use certd_config::Config;
use tracing::trace;

/// Where the certificate for a domain comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertSource {
    /// Issued by the certificate authority and renewed in the background
    Acme { ocsp_stapling: bool },
    /// The shared self-signed fallback certificate
    SelfSigned,
    /// No certificate may be served
    Reject,
}

/// Decides the certificate source for a requested domain
pub trait DomainPolicy: Send + Sync {
    fn source(&self, domain: &str) -> CertSource;
}

/// Hostname check applied before self-signing for an SNI name
pub trait HostValidator: Send + Sync {
    fn check(&self, domain: &str) -> Result<(), String>;
}

/// Accepts syntactically valid DNS names, rejects IP literals and wildcards
#[derive(Debug, Default, Clone, Copy)]
pub struct DnsNameValidator;

impl HostValidator for DnsNameValidator {
    fn check(&self, domain: &str) -> Result<(), String> {
        if certd_config::is_valid_domain(domain) {
            Ok(())
        } else {
            Err(format!("'{domain}' is not a valid host name"))
        }
    }
}

/// Self-signing eligibility: the enable flag plus the optional SNI check
#[derive(Clone)]
pub struct SelfSignedGate {
    enabled: bool,
    check_sni: bool,
    validator: Arc<dyn HostValidator>,
}

impl SelfSignedGate {
    pub fn new(enabled: bool, check_sni: bool, validator: Arc<dyn HostValidator>) -> Self {
        Self {
            enabled,
            check_sni,
            validator,
        }
    }

    pub fn disabled() -> Self {
        Self::new(false, false, Arc::new(DnsNameValidator))
    }

    /// Whether a self-signed certificate may be served for `domain`
    pub fn is_allowed(&self, domain: &str) -> bool {
        if !self.enabled {
            return false;
        }
        if self.check_sni {
            if let Err(reason) = self.validator.check(domain) {
                trace!(domain = %domain, reason = %reason, "SNI check rejected self-signing");
                return false;
            }
        }
        true
    }
}

impl std::fmt::Debug for SelfSignedGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelfSignedGate")
            .field("enabled", &self.enabled)
            .field("check_sni", &self.check_sni)
            .finish()
    }
}

/// Policy built from the configured domain list.
///
/// Configured domains go to the certificate authority. Every other name is
/// self-signed when the gate allows it and rejected otherwise.
#[derive(Debug, Clone)]
pub struct ConfigPolicy {
    domains: HashMap<String, bool>,
    gate: SelfSignedGate,
}

impl ConfigPolicy {
    pub fn new(
        domains: impl IntoIterator<Item = (String, bool)>,
        gate: SelfSignedGate,
    ) -> Self {
        Self {
            domains: domains
                .into_iter()
                .map(|(name, stapling)| (normalize_domain(&name), stapling))
                .collect(),
            gate,
        }
    }

    pub fn from_config(config: &Config, validator: Arc<dyn HostValidator>) -> Self {
        let gate = SelfSignedGate::new(
            config.self_signed.enable,
            config.self_signed.check_sni,
            validator,
        );
        Self::new(
            config
                .domains
                .iter()
                .map(|d| (d.name.clone(), d.ocsp_stapling)),
            gate,
        )
    }

    pub fn gate(&self) -> &SelfSignedGate {
        &self.gate
    }
}

impl DomainPolicy for ConfigPolicy {
    fn source(&self, domain: &str) -> CertSource {
        if let Some(&ocsp_stapling) = self.domains.get(&normalize_domain(domain)) {
            return CertSource::Acme { ocsp_stapling };
        }
        if self.gate.is_allowed(domain) {
            CertSource::SelfSigned
        } else {
            CertSource::Reject
        }
    }
}

/// Lowercase and strip a trailing root dot
pub fn normalize_domain(domain: &str) -> String {
    domain.trim_end_matches('.').to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RejectAll;

    impl HostValidator for RejectAll {
        fn check(&self, _domain: &str) -> Result<(), String> {
            Err("rejected".to_string())
        }
    }

    #[test]
    fn test_dns_name_validator() {
        let v = DnsNameValidator;
        assert!(v.check("example.com").is_ok());
        assert!(v.check("test.local").is_ok());
        assert!(v.check("").is_err());
        assert!(v.check("192.168.1.1").is_err());
        assert!(v.check("bad name").is_err());
    }

    #[test]
    fn test_gate_disabled() {
        let gate = SelfSignedGate::new(false, false, Arc::new(DnsNameValidator));
        assert!(!gate.is_allowed("test.local"));
    }

    #[test]
    fn test_gate_without_sni_check() {
        let gate = SelfSignedGate::new(true, false, Arc::new(RejectAll));
        assert!(gate.is_allowed("anything"));
    }

    #[test]
    fn test_gate_with_sni_check() {
        let gate = SelfSignedGate::new(true, true, Arc::new(DnsNameValidator));
        assert!(gate.is_allowed("test.local"));
        assert!(!gate.is_allowed("10.0.0.1"));

        let gate = SelfSignedGate::new(true, true, Arc::new(RejectAll));
        assert!(!gate.is_allowed("test.local"));
    }

    #[test]
    fn test_config_policy_routing() {
        let policy = ConfigPolicy::new(
            [
                ("Example.com".to_string(), true),
                ("plain.example.com".to_string(), false),
            ],
            SelfSignedGate::new(true, true, Arc::new(DnsNameValidator)),
        );

        assert_eq!(
            policy.source("example.com."),
            CertSource::Acme { ocsp_stapling: true }
        );
        assert_eq!(
            policy.source("PLAIN.example.com"),
            CertSource::Acme { ocsp_stapling: false }
        );
        assert_eq!(policy.source("other.local"), CertSource::SelfSigned);
        assert_eq!(policy.source("127.0.0.1"), CertSource::Reject);
    }

    #[test]
    fn test_config_policy_rejects_without_self_signed() {
        let policy = ConfigPolicy::new(Vec::new(), SelfSignedGate::disabled());
        assert_eq!(policy.source("test.local"), CertSource::Reject);
    }

    #[test]
    fn test_from_config() {
        let config = Config::from_toml_str(
            r#"
            [self-signed]
            enable = true

            [[domains]]
            name = "example.com"
            ocsp-stapling = true
            "#,
        )
        .unwrap();
        let policy = ConfigPolicy::from_config(&config, Arc::new(DnsNameValidator));
        assert_eq!(
            policy.source("example.com"),
            CertSource::Acme { ocsp_stapling: true }
        );
        assert_eq!(policy.source("fallback.local"), CertSource::SelfSigned);
    }
}
