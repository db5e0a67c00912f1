//! Certificate authority client boundary.

use async_trait::async_trait;
use rustls::pki_types::CertificateDer;

use crate::cert::KeyMaterial;
use crate::error::IssuanceError;

/// Obtains a certificate for a domain from a certificate authority.
///
/// Account handling, challenge solving and the order exchange all live behind
/// this call. The returned chain is leaf first and must certify `key`.
#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    async fn obtain(
        &self,
        domain: &str,
        key: &KeyMaterial,
    ) -> Result<Vec<CertificateDer<'static>>, IssuanceError>;
}
