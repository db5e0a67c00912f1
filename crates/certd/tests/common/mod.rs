//! Shared fixtures: an in-process CA, a fake issuer and a fake OCSP responder.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use certd::{
    CertStore, Certificate, CertificateIssuer, IssuanceError, KeyMaterial, OcspError,
    OcspFetcher, OcspStaple, StoreError,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
    KeyUsagePurpose,
};
use rustls::pki_types::CertificateDer;

// ============================================================================
// Test CA
// ============================================================================

pub struct TestCa {
    issuer: Issuer<'static, KeyPair>,
    ca_der: CertificateDer<'static>,
}

impl TestCa {
    pub fn new() -> Self {
        let ca_key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
        ];
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "certd Test CA");
        params.distinguished_name = dn;

        let ca_cert = params.self_signed(&ca_key).unwrap();
        let ca_der = ca_cert.der().clone();

        Self {
            issuer: Issuer::new(params, ca_key),
            ca_der,
        }
    }

    /// Chain (leaf, CA) for `key` valid between the given instants
    pub fn issue_window(
        &self,
        domain: &str,
        key: &KeyMaterial,
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
    ) -> Vec<CertificateDer<'static>> {
        let leaf_key = KeyPair::try_from(key.der().secret_der()).unwrap();

        let mut params = CertificateParams::new(vec![domain.to_string()]).unwrap();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, domain);
        params.distinguished_name = dn;
        params.not_before = to_offset(not_before);
        params.not_after = to_offset(not_after);

        let leaf = params.signed_by(&leaf_key, &self.issuer).unwrap();
        vec![leaf.der().clone(), self.ca_der.clone()]
    }

    /// Chain for `key` valid from a day ago for `valid_for`
    pub fn issue(
        &self,
        domain: &str,
        key: &KeyMaterial,
        valid_for: chrono::Duration,
    ) -> Vec<CertificateDer<'static>> {
        let now = Utc::now();
        self.issue_window(domain, key, now - chrono::Duration::days(1), now + valid_for)
    }

    /// A complete certificate with a fresh key
    pub fn certificate(&self, domain: &str, valid_for: chrono::Duration) -> Certificate {
        let key = KeyMaterial::generate().unwrap();
        let chain = self.issue(domain, &key, valid_for);
        Certificate::new(key, chain).unwrap()
    }

    /// A certificate that has already expired
    pub fn expired_certificate(&self, domain: &str) -> Certificate {
        let key = KeyMaterial::generate().unwrap();
        let now = Utc::now();
        let chain = self.issue_window(
            domain,
            &key,
            now - chrono::Duration::days(90),
            now - chrono::Duration::days(1),
        );
        Certificate::new(key, chain).unwrap()
    }
}

fn to_offset(at: DateTime<Utc>) -> time::OffsetDateTime {
    time::OffsetDateTime::from_unix_timestamp(at.timestamp()).unwrap()
}

// ============================================================================
// Fake issuer
// ============================================================================

pub struct FakeIssuer {
    ca: TestCa,
    valid_for: chrono::Duration,
    delay: Duration,
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl FakeIssuer {
    pub fn new() -> Arc<Self> {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            ca: TestCa::new(),
            valid_for: chrono::Duration::days(90),
            delay,
            failing: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn ca(&self) -> &TestCa {
        &self.ca
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl CertificateIssuer for FakeIssuer {
    async fn obtain(
        &self,
        domain: &str,
        key: &KeyMaterial,
    ) -> Result<Vec<CertificateDer<'static>>, IssuanceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(IssuanceError::new("rate limited"));
        }
        Ok(self.ca.issue(domain, key, self.valid_for))
    }
}

// ============================================================================
// Fake OCSP responder
// ============================================================================

#[derive(Default)]
pub struct FakeOcsp {
    calls: AtomicUsize,
    failing: AtomicBool,
    last_leaf: Mutex<Option<CertificateDer<'static>>>,
}

impl FakeOcsp {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_leaf(&self) -> Option<CertificateDer<'static>> {
        self.last_leaf.lock().clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl OcspFetcher for FakeOcsp {
    async fn fetch(
        &self,
        leaf: &CertificateDer<'static>,
        _issuer: &CertificateDer<'static>,
    ) -> Result<OcspStaple, OcspError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        *self.last_leaf.lock() = Some(leaf.clone());
        if self.failing.load(Ordering::SeqCst) {
            return Err(OcspError::new("responder unavailable"));
        }
        Ok(OcspStaple {
            der: vec![0x30, n as u8],
            next_update: Utc::now() + chrono::Duration::days(4),
        })
    }
}

// ============================================================================
// Failing store
// ============================================================================

/// Store whose every read fails with an I/O error
#[derive(Default)]
pub struct BrokenStore {
    puts: AtomicUsize,
}

impl BrokenStore {
    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CertStore for BrokenStore {
    async fn get(&self, _key: &str) -> Result<Vec<u8>, StoreError> {
        Err(StoreError::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "permission denied",
        )))
    }

    async fn put(&self, _key: &str, _data: &[u8]) -> Result<(), StoreError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, _key: &str) -> Result<(), StoreError> {
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Poll `check` until it holds or two seconds pass
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
