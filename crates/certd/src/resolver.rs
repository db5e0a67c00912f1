//! rustls certificate resolver backed by a [`CertManager`].

use std::sync::Arc;

use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tokio::runtime::Handle;
use tracing::{debug, trace};

use crate::manager::CertManager;
use crate::policy::CertSource;

/// Serves certificates to TLS handshakes from memory only.
///
/// On a miss the handshake fails fast and acquisition runs in the background,
/// so a later handshake for the same name finds the certificate ready.
pub struct CertResolver {
    manager: Arc<CertManager>,
    runtime: Handle,
}

impl CertResolver {
    pub fn new(manager: Arc<CertManager>, runtime: Handle) -> Self {
        Self { manager, runtime }
    }

    /// Resolver bound to the runtime of the calling task
    pub fn current(manager: Arc<CertManager>) -> Self {
        Self::new(manager, Handle::current())
    }

    pub fn manager(&self) -> &Arc<CertManager> {
        &self.manager
    }

    /// Key for `server_name` if one is ready; starts acquisition otherwise
    pub fn resolve_name(&self, server_name: &str) -> Option<Arc<CertifiedKey>> {
        if let Some(key) = self.manager.certified_key(server_name) {
            trace!(domain = %server_name, "Resolved certificate from memory");
            return Some(key);
        }

        if self.manager.certificate_source(server_name) == CertSource::Reject {
            trace!(domain = %server_name, "No certificate source for name");
            return None;
        }

        let manager = Arc::clone(&self.manager);
        let domain = server_name.to_string();
        self.runtime.spawn(async move {
            if let Err(e) = manager.get_certificate(&domain).await {
                debug!(domain = %domain, error = %e, "Background certificate acquisition failed");
            }
        });
        None
    }
}

impl ResolvesServerCert for CertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let Some(server_name) = client_hello.server_name() else {
            trace!("Client hello without SNI, no certificate");
            return None;
        };
        self.resolve_name(server_name)
    }
}

impl std::fmt::Debug for CertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertResolver")
            .field("manager", &self.manager)
            .finish()
    }
}
