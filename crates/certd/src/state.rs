//! In-memory state of one managed domain.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rustls::sign::CertifiedKey;

use crate::cert::Certificate;

/// A fetched OCSP response and the time it stops being current
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OcspStaple {
    pub der: Vec<u8>,
    pub next_update: DateTime<Utc>,
}

impl OcspStaple {
    pub fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.next_update
    }
}

/// Key, leaf and staple for one managed domain.
///
/// The certificate is replaced by installing a new state in the manager's map;
/// the staple changes in place under its own lock because it is refreshed on a
/// different cadence.
#[derive(Debug)]
pub struct CertificateState {
    domain: String,
    cert: Arc<Certificate>,
    ocsp: RwLock<Option<OcspStaple>>,
}

impl CertificateState {
    pub fn new(domain: impl Into<String>, cert: Arc<Certificate>) -> Self {
        Self {
            domain: domain.into(),
            cert,
            ocsp: RwLock::new(None),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn certificate(&self) -> &Arc<Certificate> {
        &self.cert
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.cert.not_after()
    }

    pub fn is_expired(&self) -> bool {
        self.cert.is_expired()
    }

    /// Current staple, if one has been fetched and is still current
    pub fn ocsp_staple(&self) -> Option<OcspStaple> {
        let now = Utc::now();
        self.ocsp
            .read()
            .as_ref()
            .filter(|staple| !staple.is_stale_at(now))
            .cloned()
    }

    pub fn set_ocsp_staple(&self, staple: OcspStaple) {
        *self.ocsp.write() = Some(staple);
    }

    /// Handshake-ready key with the current staple attached
    pub fn certified_key(&self) -> CertifiedKey {
        self.cert
            .certified_key(self.ocsp_staple().map(|staple| staple.der))
    }
}
