//! TLS termination from a PKCS#12 bundle.
//!
//! The client TLS and app-service TLS roles terminate TLS with the server
//! certificate from the configured `.pfx` bundle. TLS here provides
//! transport confidentiality only; identity binding happens at the
//! protocol layer through the Ed25519 conversation handshake.

use std::path::Path;

use tokio_native_tls::TlsAcceptor;

use crate::{Result, ServerError};

/// Load the PKCS#12 bundle and build a TLS acceptor.
pub fn acceptor_from_pkcs12(path: &Path, password: &str) -> Result<TlsAcceptor> {
    let der = std::fs::read(path).map_err(|e| {
        ServerError::Tls(format!(
            "cannot read TLS certificate {}: {e}",
            path.display()
        ))
    })?;
    let identity = native_tls::Identity::from_pkcs12(&der, password)
        .map_err(|e| ServerError::Tls(format!("invalid PKCS#12 bundle: {e}")))?;
    let acceptor = native_tls::TlsAcceptor::builder(identity)
        .build()
        .map_err(|e| ServerError::Tls(format!("TLS acceptor: {e}")))?;
    Ok(TlsAcceptor::from(acceptor))
}
