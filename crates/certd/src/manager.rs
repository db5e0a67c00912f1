//! Certificate manager: the domain map and everything that feeds it.
//!
//! The manager answers "which certificate for this domain" from memory when it
//! can. On a miss it asks the [`DomainPolicy`] where the certificate comes
//! from and acquires it once:
//!
//! - `Acme`: reuse a fresh cached bundle or issue a new certificate, persist
//!   it, then hand the domain to its renewal scheduler (and OCSP updater when
//!   stapling is enabled).
//! - `SelfSigned`: the process-wide self-signed certificate.
//! - `Reject`: [`CertError::NotAllowed`].
//!
//! Background timers hold only a `Weak` reference back to the manager, so
//! dropping the last `Arc<CertManager>` tears everything down.

use std::sync::{Arc, Weak};

use certd_config::Config;
use chrono::Utc;
use dashmap::DashMap;
use rustls::sign::CertifiedKey;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::cert::{Certificate, KeyMaterial};
use crate::error::{CertError, CertResult};
use crate::issuer::CertificateIssuer;
use crate::metrics::CertMetrics;
use crate::ocsp::{OcspFetcher, OcspUpdater};
use crate::policy::{
    normalize_domain, CertSource, ConfigPolicy, DnsNameValidator, DomainPolicy, HostValidator,
    SelfSignedGate,
};
use crate::renewal::RenewalScheduler;
use crate::self_signed::{SelfSignedProvisioner, SelfSignedSettings};
use crate::state::{CertificateState, OcspStaple};
use crate::store::CertStore;
use crate::timer::Timing;

/// Shared outcome of one acquisition attempt
type Flight = OnceCell<CertResult<Arc<Certificate>>>;

/// Everything the manager tracks for one managed domain
struct ManagedDomain {
    state: Arc<CertificateState>,
    renewal: Arc<RenewalScheduler>,
    ocsp: Option<Arc<OcspUpdater>>,
}

impl ManagedDomain {
    fn stop(&self) {
        self.renewal.stop();
        if let Some(ocsp) = &self.ocsp {
            ocsp.stop();
        }
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`CertManager`]
pub struct CertManagerBuilder {
    store: Arc<dyn CertStore>,
    issuer: Option<Arc<dyn CertificateIssuer>>,
    ocsp_fetcher: Option<Arc<dyn OcspFetcher>>,
    policy: Option<Arc<dyn DomainPolicy>>,
    domains: Vec<(String, bool)>,
    self_signed_enabled: bool,
    check_sni: bool,
    host_validator: Arc<dyn HostValidator>,
    self_signed: SelfSignedSettings,
    timing: Timing,
    metrics: Option<Arc<CertMetrics>>,
}

impl CertManagerBuilder {
    fn new(store: Arc<dyn CertStore>) -> Self {
        Self {
            store,
            issuer: None,
            ocsp_fetcher: None,
            policy: None,
            domains: Vec::new(),
            self_signed_enabled: false,
            check_sni: false,
            host_validator: Arc::new(DnsNameValidator),
            self_signed: SelfSignedSettings::default(),
            timing: Timing::default(),
            metrics: None,
        }
    }

    /// Take domains, self-signed settings and timing from configuration
    pub fn from_config(config: &Config, store: Arc<dyn CertStore>) -> Self {
        let mut builder = Self::new(store);
        builder.domains = config
            .domains
            .iter()
            .map(|d| (d.name.clone(), d.ocsp_stapling))
            .collect();
        builder.self_signed_enabled = config.self_signed.enable;
        builder.check_sni = config.self_signed.check_sni;
        builder.self_signed = SelfSignedSettings::from(&config.self_signed);
        builder.timing = Timing::from_config(&config.renewal);
        builder
    }

    pub fn issuer(mut self, issuer: Arc<dyn CertificateIssuer>) -> Self {
        self.issuer = Some(issuer);
        self
    }

    pub fn ocsp_fetcher(mut self, fetcher: Arc<dyn OcspFetcher>) -> Self {
        self.ocsp_fetcher = Some(fetcher);
        self
    }

    /// Route a domain to the certificate authority
    pub fn domain(mut self, name: impl Into<String>, ocsp_stapling: bool) -> Self {
        self.domains.push((name.into(), ocsp_stapling));
        self
    }

    /// Replace the configuration-derived routing policy
    pub fn policy(mut self, policy: Arc<dyn DomainPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn self_signed(mut self, enabled: bool, check_sni: bool) -> Self {
        self.self_signed_enabled = enabled;
        self.check_sni = check_sni;
        self
    }

    pub fn self_signed_settings(mut self, settings: SelfSignedSettings) -> Self {
        self.self_signed = settings;
        self
    }

    pub fn host_validator(mut self, validator: Arc<dyn HostValidator>) -> Self {
        self.host_validator = validator;
        self
    }

    pub fn timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    pub fn metrics(mut self, metrics: Arc<CertMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> CertResult<Arc<CertManager>> {
        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => Arc::new(CertMetrics::new()?),
        };

        let gate = SelfSignedGate::new(
            self.self_signed_enabled,
            self.check_sni,
            self.host_validator,
        );
        let policy = self
            .policy
            .unwrap_or_else(|| Arc::new(ConfigPolicy::new(self.domains, gate.clone())));

        let self_signed = SelfSignedProvisioner::new(
            Arc::clone(&self.store),
            self.self_signed,
            Arc::clone(&metrics),
        );

        info!(
            has_issuer = self.issuer.is_some(),
            has_ocsp_fetcher = self.ocsp_fetcher.is_some(),
            self_signed = self.self_signed_enabled,
            renew_before_days = self.timing.renew_before.as_secs() / 86_400,
            "Certificate manager initialized"
        );

        Ok(Arc::new_cyclic(|this| CertManager {
            store: self.store,
            issuer: self.issuer,
            ocsp_fetcher: self.ocsp_fetcher,
            policy,
            gate,
            self_signed,
            timing: self.timing,
            metrics,
            domains: DashMap::new(),
            inflight: DashMap::new(),
            this: this.clone(),
        }))
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Owner of the domain map, its timers and the self-signed singleton
pub struct CertManager {
    store: Arc<dyn CertStore>,
    issuer: Option<Arc<dyn CertificateIssuer>>,
    ocsp_fetcher: Option<Arc<dyn OcspFetcher>>,
    policy: Arc<dyn DomainPolicy>,
    gate: SelfSignedGate,
    self_signed: SelfSignedProvisioner,
    timing: Timing,
    metrics: Arc<CertMetrics>,
    domains: DashMap<String, ManagedDomain>,
    /// In-flight first acquisitions, one per domain
    inflight: DashMap<String, Arc<Flight>>,
    this: Weak<CertManager>,
}

impl CertManager {
    pub fn builder(store: Arc<dyn CertStore>) -> CertManagerBuilder {
        CertManagerBuilder::new(store)
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    pub fn metrics(&self) -> &Arc<CertMetrics> {
        &self.metrics
    }

    pub fn store(&self) -> &Arc<dyn CertStore> {
        &self.store
    }

    /// Certificate for `domain`, acquiring it on first use.
    ///
    /// A fresh in-memory certificate is returned without touching the store
    /// or the issuer.
    pub async fn get_certificate(&self, domain: &str) -> CertResult<Arc<Certificate>> {
        let domain = normalize_domain(domain);

        if let Some(cert) = self.managed_certificate(&domain) {
            return Ok(cert);
        }

        match self.policy.source(&domain) {
            CertSource::Acme { ocsp_stapling } => self.acquire(&domain, ocsp_stapling).await,
            CertSource::SelfSigned => self.self_signed.get(&domain).await,
            CertSource::Reject => {
                debug!(domain = %domain, "No certificate source for domain");
                Err(CertError::NotAllowed(domain))
            }
        }
    }

    /// Whether the self-signed fallback may be served for `domain`
    pub fn is_self_signed_allowed(&self, domain: &str) -> bool {
        self.gate.is_allowed(domain)
    }

    /// Where the certificate for `domain` comes from
    pub fn certificate_source(&self, domain: &str) -> CertSource {
        self.policy.source(&normalize_domain(domain))
    }

    /// The self-signed certificate, loading or generating it if needed
    pub async fn self_signed_certificate(&self, domain: &str) -> CertResult<Arc<Certificate>> {
        self.self_signed.get(&normalize_domain(domain)).await
    }

    /// Handshake-ready key for `domain` from memory only.
    ///
    /// Falls back to the already loaded self-signed certificate when the
    /// domain is allowed to use it. Never performs I/O.
    pub fn certified_key(&self, domain: &str) -> Option<Arc<CertifiedKey>> {
        let domain = normalize_domain(domain);

        if let Some(state) = self.state(&domain) {
            if !state.is_expired() {
                return Some(Arc::new(state.certified_key()));
            }
        }

        if matches!(self.policy.source(&domain), CertSource::SelfSigned) {
            return self
                .self_signed
                .loaded()
                .map(|cert| Arc::new(cert.certified_key(None)));
        }

        None
    }

    /// Current OCSP staple for a managed domain
    pub fn ocsp_staple(&self, domain: &str) -> Option<OcspStaple> {
        self.state(&normalize_domain(domain))?.ocsp_staple()
    }

    /// Sorted names of every managed domain
    pub fn managed_domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self.domains.iter().map(|e| e.key().clone()).collect();
        domains.sort();
        domains
    }

    pub fn state(&self, domain: &str) -> Option<Arc<CertificateState>> {
        self.domains
            .get(domain)
            .map(|entry| Arc::clone(&entry.state))
    }

    pub fn renewal_scheduler(&self, domain: &str) -> Option<Arc<RenewalScheduler>> {
        self.domains
            .get(&normalize_domain(domain))
            .map(|entry| Arc::clone(&entry.renewal))
    }

    pub fn ocsp_updater(&self, domain: &str) -> Option<Arc<OcspUpdater>> {
        self.domains
            .get(&normalize_domain(domain))
            .and_then(|entry| entry.ocsp.clone())
    }

    /// Stop a domain's timers and forget its state
    pub fn unmanage(&self, domain: &str) -> bool {
        let domain = normalize_domain(domain);
        match self.domains.remove(&domain) {
            Some((_, managed)) => {
                managed.stop();
                info!(domain = %domain, "Domain no longer managed");
                true
            }
            None => false,
        }
    }

    /// Stop every renewal and OCSP timer.
    ///
    /// Does not wait for attempts already in progress; they finish without
    /// rescheduling. In-memory certificates keep being served.
    pub fn shutdown(&self) {
        let mut stopped = 0usize;
        for entry in self.domains.iter() {
            entry.value().stop();
            stopped += 1;
        }
        info!(domains = stopped, "Certificate manager timers stopped");
    }

    // ------------------------------------------------------------------------
    // Store access
    // ------------------------------------------------------------------------

    /// Load and decode the cached bundle for `domain`
    pub async fn cache_get(&self, domain: &str) -> CertResult<Certificate> {
        let data = self.store.get(domain).await?;
        Certificate::from_pem_bundle(&data)
    }

    /// Persist `cert` as the cached bundle for `domain`
    pub async fn cache_put(&self, domain: &str, cert: &Certificate) -> CertResult<()> {
        self.store.put(domain, &cert.to_pem_bundle()).await?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Acquisition
    // ------------------------------------------------------------------------

    fn managed_certificate(&self, domain: &str) -> Option<Arc<Certificate>> {
        let entry = self.domains.get(domain)?;
        let cert = entry.state.certificate();
        if cert.is_expired() {
            return None;
        }
        Some(Arc::clone(cert))
    }

    /// Acquire `domain` once for every concurrent caller.
    ///
    /// Callers arriving while an attempt is in flight wait for it and receive
    /// its result, success or failure. The flight is dropped once it settles
    /// so a failed acquisition is retried by the next request, not by the
    /// callers that were already waiting.
    async fn acquire(&self, domain: &str, ocsp_stapling: bool) -> CertResult<Arc<Certificate>> {
        let flight = Arc::clone(
            self.inflight
                .entry(domain.to_string())
                .or_default()
                .value(),
        );

        let result = flight
            .get_or_init(|| self.acquire_once(domain, ocsp_stapling))
            .await
            .clone();

        self.inflight
            .remove_if(domain, |_, current| Arc::ptr_eq(current, &flight));
        result
    }

    async fn acquire_once(
        &self,
        domain: &str,
        ocsp_stapling: bool,
    ) -> CertResult<Arc<Certificate>> {
        // A previous flight may have finished just before this one started
        if let Some(cert) = self.managed_certificate(domain) {
            return Ok(cert);
        }

        let cert = match self.cache_get(domain).await {
            Ok(cached) if !cached.is_expired() => {
                info!(
                    domain = %domain,
                    serial = %cached.serial(),
                    not_after = %cached.not_after(),
                    "Loaded certificate from store"
                );
                Arc::new(cached)
            }
            Ok(expired) => {
                info!(
                    domain = %domain,
                    not_after = %expired.not_after(),
                    "Stored certificate expired, issuing a new one"
                );
                self.issue(domain).await?
            }
            Err(e) if e.is_not_found() => self.issue(domain).await?,
            Err(e) => return Err(e),
        };

        self.manage(domain, Arc::clone(&cert), ocsp_stapling);
        Ok(cert)
    }

    async fn issue(&self, domain: &str) -> CertResult<Arc<Certificate>> {
        let key = KeyMaterial::generate()?;
        let timeout = self.timing.attempt_timeout;

        let cert = match tokio::time::timeout(timeout, self.obtain(domain, &key)).await {
            Ok(result) => result?,
            Err(_) => {
                self.metrics.record_issuance_failure(domain);
                return Err(CertError::Timeout(timeout));
            }
        };

        self.cache_put(domain, &cert).await?;
        info!(
            domain = %domain,
            serial = %cert.serial(),
            not_after = %cert.not_after(),
            "Issued certificate"
        );
        Ok(Arc::new(cert))
    }

    /// Ask the issuer for a certificate for `key`
    pub(crate) async fn obtain(&self, domain: &str, key: &KeyMaterial) -> CertResult<Certificate> {
        let issuer = self
            .issuer
            .as_ref()
            .ok_or_else(|| CertError::NoIssuer(domain.to_string()))?;

        self.metrics.record_issuance_attempt(domain);
        let result = match issuer.obtain(domain, key).await {
            Ok(chain) => Certificate::new(key.clone(), chain),
            Err(e) => Err(e.into()),
        };
        if result.is_err() {
            self.metrics.record_issuance_failure(domain);
        }
        result
    }

    /// Start managing `domain` with `cert`, or replace its certificate if it
    /// is already managed
    fn manage(&self, domain: &str, cert: Arc<Certificate>, ocsp_stapling: bool) {
        if self.domains.contains_key(domain) {
            self.install(domain, cert);
            return;
        }

        let state = Arc::new(CertificateState::new(domain, Arc::clone(&cert)));
        let renewal = RenewalScheduler::new(
            domain,
            cert.key().clone(),
            self.this.clone(),
            self.timing,
        );
        let ocsp = match (ocsp_stapling, &self.ocsp_fetcher) {
            (true, Some(fetcher)) => Some(OcspUpdater::new(
                domain,
                self.this.clone(),
                Arc::clone(fetcher),
                self.timing,
            )),
            (true, None) => {
                warn!(domain = %domain, "OCSP stapling requested but no OCSP fetcher configured");
                None
            }
            (false, _) => None,
        };

        self.domains.insert(
            domain.to_string(),
            ManagedDomain {
                state,
                renewal: Arc::clone(&renewal),
                ocsp: ocsp.clone(),
            },
        );

        renewal.start(cert.not_after());
        if let Some(ocsp) = ocsp {
            ocsp.start(Utc::now());
        }

        info!(
            domain = %domain,
            not_after = %cert.not_after(),
            ocsp_stapling,
            "Managing domain"
        );
    }

    /// Swap in a new certificate for a managed domain and refresh its staple.
    ///
    /// Ignored when the domain was unmanaged in the meantime.
    pub(crate) fn install(&self, domain: &str, cert: Arc<Certificate>) {
        let ocsp = match self.domains.get_mut(domain) {
            Some(mut entry) => {
                entry.state = Arc::new(CertificateState::new(domain, cert));
                entry.ocsp.clone()
            }
            None => {
                debug!(domain = %domain, "Domain no longer managed, discarding certificate");
                return;
            }
        };

        if let Some(updater) = ocsp {
            updater.restart();
        }
    }

    /// Install a cached certificate another instance renewed, if it differs
    /// from the one in memory
    pub(crate) fn adopt(&self, domain: &str, cached: Certificate) {
        let current = self.state(domain);
        if current.is_some_and(|state| state.certificate().serial() != cached.serial()) {
            info!(
                domain = %domain,
                serial = %cached.serial(),
                not_after = %cached.not_after(),
                "Adopting certificate renewed elsewhere"
            );
            self.install(domain, Arc::new(cached));
        }
    }
}

impl Drop for CertManager {
    fn drop(&mut self) {
        for entry in self.domains.iter() {
            entry.value().stop();
        }
    }
}

impl std::fmt::Debug for CertManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertManager")
            .field("managed_domains", &self.domains.len())
            .field("timing", &self.timing)
            .field("self_signed", &self.self_signed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn manager(store: Arc<MemoryStore>) -> Arc<CertManager> {
        CertManager::builder(store)
            .domain("acme.example.com", false)
            .self_signed(true, true)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_rejected_domain() {
        let manager = manager(Arc::new(MemoryStore::new()));
        let err = manager.get_certificate("10.0.0.1").await.unwrap_err();
        assert!(matches!(err, CertError::NotAllowed(_)));
    }

    #[tokio::test]
    async fn test_acme_domain_without_issuer() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager(Arc::clone(&store));

        let err = manager.get_certificate("acme.example.com").await.unwrap_err();
        assert!(matches!(err, CertError::NoIssuer(_)));
        assert!(manager.managed_domains().is_empty());
    }

    #[tokio::test]
    async fn test_self_signed_not_managed() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager(Arc::clone(&store));

        let cert = manager.get_certificate("Test.Local").await.unwrap();
        assert!(!cert.is_expired());
        assert!(manager.managed_domains().is_empty());
        assert!(manager.renewal_scheduler("test.local").is_none());
        assert!(manager.certified_key("test.local").is_some());
        assert!(manager.certified_key("10.0.0.1").is_none());
    }

    #[tokio::test]
    async fn test_certified_key_before_load() {
        let manager = manager(Arc::new(MemoryStore::new()));
        assert!(manager.certified_key("test.local").is_none());
    }

    #[test]
    fn test_is_self_signed_allowed() {
        let store: Arc<dyn CertStore> = Arc::new(MemoryStore::new());
        let manager = CertManager::builder(Arc::clone(&store))
            .self_signed(true, true)
            .build()
            .unwrap();
        assert!(manager.is_self_signed_allowed("test.local"));
        assert!(!manager.is_self_signed_allowed("127.0.0.1"));

        let manager = CertManager::builder(store).build().unwrap();
        assert!(!manager.is_self_signed_allowed("test.local"));
    }
}
