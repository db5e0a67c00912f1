//! Prometheus counters for certificate lifecycle events.

use prometheus::{IntCounter, IntCounterVec, Opts, Registry};

/// Lifecycle counters.
///
/// Created unregistered; call [`CertMetrics::register`] to expose them.
#[derive(Clone)]
pub struct CertMetrics {
    issuance_attempts: IntCounterVec,
    issuance_failures: IntCounterVec,
    renewal_skipped: IntCounterVec,
    ocsp_refreshes: IntCounterVec,
    ocsp_failures: IntCounterVec,
    self_signed_generated: IntCounter,
    self_signed_reused: IntCounter,
}

impl CertMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        Ok(Self {
            issuance_attempts: IntCounterVec::new(
                Opts::new(
                    "certd_issuance_attempts_total",
                    "Certificate issuance requests sent to the authority",
                ),
                &["domain"],
            )?,
            issuance_failures: IntCounterVec::new(
                Opts::new(
                    "certd_issuance_failures_total",
                    "Certificate issuance requests that failed or timed out",
                ),
                &["domain"],
            )?,
            renewal_skipped: IntCounterVec::new(
                Opts::new(
                    "certd_renewal_skipped_total",
                    "Renewal attempts answered by a fresher cached certificate",
                ),
                &["domain"],
            )?,
            ocsp_refreshes: IntCounterVec::new(
                Opts::new("certd_ocsp_refreshes_total", "Successful OCSP staple refreshes"),
                &["domain"],
            )?,
            ocsp_failures: IntCounterVec::new(
                Opts::new("certd_ocsp_failures_total", "Failed OCSP staple refreshes"),
                &["domain"],
            )?,
            self_signed_generated: IntCounter::new(
                "certd_self_signed_generated_total",
                "Self-signed certificates generated",
            )?,
            self_signed_reused: IntCounter::new(
                "certd_self_signed_reused_total",
                "Self-signed certificates loaded from the store",
            )?,
        })
    }

    /// Register every counter with `registry`
    pub fn register(&self, registry: &Registry) -> Result<(), prometheus::Error> {
        registry.register(Box::new(self.issuance_attempts.clone()))?;
        registry.register(Box::new(self.issuance_failures.clone()))?;
        registry.register(Box::new(self.renewal_skipped.clone()))?;
        registry.register(Box::new(self.ocsp_refreshes.clone()))?;
        registry.register(Box::new(self.ocsp_failures.clone()))?;
        registry.register(Box::new(self.self_signed_generated.clone()))?;
        registry.register(Box::new(self.self_signed_reused.clone()))?;
        Ok(())
    }

    pub fn record_issuance_attempt(&self, domain: &str) {
        self.issuance_attempts.with_label_values(&[domain]).inc();
    }

    pub fn record_issuance_failure(&self, domain: &str) {
        self.issuance_failures.with_label_values(&[domain]).inc();
    }

    pub fn record_renewal_skipped(&self, domain: &str) {
        self.renewal_skipped.with_label_values(&[domain]).inc();
    }

    pub fn record_ocsp_refresh(&self, domain: &str) {
        self.ocsp_refreshes.with_label_values(&[domain]).inc();
    }

    pub fn record_ocsp_failure(&self, domain: &str) {
        self.ocsp_failures.with_label_values(&[domain]).inc();
    }

    pub fn record_self_signed_generated(&self) {
        self.self_signed_generated.inc();
    }

    pub fn record_self_signed_reused(&self) {
        self.self_signed_reused.inc();
    }

    pub fn issuance_attempts(&self, domain: &str) -> u64 {
        self.issuance_attempts.with_label_values(&[domain]).get()
    }

    pub fn issuance_failures(&self, domain: &str) -> u64 {
        self.issuance_failures.with_label_values(&[domain]).get()
    }

    pub fn renewal_skipped(&self, domain: &str) -> u64 {
        self.renewal_skipped.with_label_values(&[domain]).get()
    }

    pub fn ocsp_refreshes(&self, domain: &str) -> u64 {
        self.ocsp_refreshes.with_label_values(&[domain]).get()
    }

    pub fn ocsp_failures(&self, domain: &str) -> u64 {
        self.ocsp_failures.with_label_values(&[domain]).get()
    }

    pub fn self_signed_generated(&self) -> u64 {
        self.self_signed_generated.get()
    }
}

impl std::fmt::Debug for CertMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertMetrics").finish_non_exhaustive()
    }
}
