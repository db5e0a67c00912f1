//! Self-signed fallback certificate.
//!
//! One certificate serves every domain routed to the self-signed path. It is
//! created lazily by the first caller that needs it, persisted through the
//! certificate store so a restarted process keeps the same key and identity,
//! and held in memory for the lifetime of the [`SelfSignedProvisioner`].

use std::sync::Arc;

use certd_common::SingleFlightCell;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, SerialNumber,
};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::cert::{Certificate, KeyMaterial};
use crate::error::{CertError, CertResult};
use crate::metrics::CertMetrics;
use crate::store::CertStore;

/// Operator-facing self-signed certificate attributes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelfSignedSettings {
    /// Validity period of a generated certificate
    pub valid_days: u32,
    /// Subject organization names
    pub organization: Vec<String>,
    /// Cache key the key + certificate are stored under
    pub cache_key: String,
}

impl Default for SelfSignedSettings {
    fn default() -> Self {
        let config = certd_config::SelfSignedConfig::default();
        Self::from(&config)
    }
}

impl From<&certd_config::SelfSignedConfig> for SelfSignedSettings {
    fn from(config: &certd_config::SelfSignedConfig) -> Self {
        Self {
            valid_days: config.valid_days,
            organization: config.organization.clone(),
            cache_key: config.cert_key.clone(),
        }
    }
}

/// Generate an ECDSA P-256 self-signed certificate.
///
/// The certificate is valid for server and client authentication, carries a
/// random 128-bit serial number and is valid from now for `valid_days`.
///
/// The subject holds a single organization attribute; several configured
/// names are joined with `", "`.
pub fn generate_self_signed(valid_days: u32, organization: &[String]) -> CertResult<Certificate> {
    let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
        .map_err(|e| CertError::Generation(format!("failed to generate private key: {e}")))?;

    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    if !organization.is_empty() {
        dn.push(DnType::OrganizationName, organization.join(", "));
    }
    params.distinguished_name = dn;

    params.serial_number = Some(SerialNumber::from_slice(
        &rand::random::<u128>().to_be_bytes(),
    ));

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(i64::from(valid_days));

    // Issuer == subject, so the certificate authorizes its own signature
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
        KeyUsagePurpose::KeyCertSign,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    params.is_ca = IsCa::ExplicitNoCa;

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| CertError::Generation(format!("failed to create certificate: {e}")))?;

    Certificate::new(KeyMaterial::from_key_pair(&key_pair), vec![cert.der().clone()])
        .map_err(|e| CertError::Generation(e.to_string()))
}

/// Owner of the process-wide self-signed certificate
pub struct SelfSignedProvisioner {
    store: Arc<dyn CertStore>,
    settings: SelfSignedSettings,
    cell: SingleFlightCell<Certificate>,
    metrics: Arc<CertMetrics>,
}

impl SelfSignedProvisioner {
    pub fn new(
        store: Arc<dyn CertStore>,
        settings: SelfSignedSettings,
        metrics: Arc<CertMetrics>,
    ) -> Self {
        Self {
            store,
            settings,
            cell: SingleFlightCell::new(),
            metrics,
        }
    }

    pub fn settings(&self) -> &SelfSignedSettings {
        &self.settings
    }

    /// The certificate if it has already been loaded or generated
    pub fn loaded(&self) -> Option<Arc<Certificate>> {
        self.cell.get().filter(|cert| !cert.is_expired())
    }

    /// Get the self-signed certificate, loading or generating it on first use.
    ///
    /// Concurrent first callers collapse into one store lookup and at most one
    /// generation. A store failure other than a miss is returned as-is and
    /// nothing is generated.
    pub async fn get(&self, domain: &str) -> CertResult<Arc<Certificate>> {
        if let Some(cert) = self.cell.get() {
            if !cert.is_expired() {
                return Ok(cert);
            }
            if self.cell.clear_if(&cert) {
                warn!(serial = %cert.serial(), "Self-signed certificate expired, replacing");
            }
        }

        self.cell
            .get_or_try_init(|| self.load_or_generate(domain))
            .await
    }

    async fn load_or_generate(&self, domain: &str) -> CertResult<Certificate> {
        let key = &self.settings.cache_key;

        match self.store.get(key).await {
            Ok(data) => {
                let cert = Certificate::from_pem_bundle(&data)?;
                if !cert.is_expired() {
                    info!(
                        domain = %domain,
                        serial = %cert.serial(),
                        not_after = %cert.not_after(),
                        "Reusing stored self-signed certificate"
                    );
                    self.metrics.record_self_signed_reused();
                    return Ok(cert);
                }
                warn!(
                    serial = %cert.serial(),
                    not_after = %cert.not_after(),
                    "Stored self-signed certificate expired, generating a new one"
                );
            }
            Err(e) if e.is_not_found() => {
                debug!(cache_key = %key, "No stored self-signed certificate");
            }
            Err(e) => return Err(e.into()),
        }

        let generated =
            generate_self_signed(self.settings.valid_days, &self.settings.organization)?;
        let bundle = generated.to_pem_bundle();
        self.store.put(key, &bundle).await?;

        let cert = Certificate::from_pem_bundle(&bundle)?;
        info!(
            domain = %domain,
            serial = %cert.serial(),
            valid_days = self.settings.valid_days,
            "Generated self-signed certificate"
        );
        self.metrics.record_self_signed_generated();
        Ok(cert)
    }
}

impl std::fmt::Debug for SelfSignedProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelfSignedProvisioner")
            .field("settings", &self.settings)
            .field("loaded", &self.cell.is_initialized())
            .finish()
    }
}
