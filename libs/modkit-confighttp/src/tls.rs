//! TLS material loading for clients and servers.
//!
//! System root certificates are loaded once per process and cached.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use serde::{Deserialize, Serialize};

use crate::error::TlsError;

static NATIVE_ROOTS_CACHE: OnceLock<Vec<CertificateDer<'static>>> = OnceLock::new();

/// TLS settings of an outbound client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct TlsClientSettings {
    /// PEM bundle of CAs used to verify servers instead of the system pool.
    pub ca_file: Option<PathBuf>,
    /// Client certificate presented for mutual TLS.
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    /// Also trust the system pool when `ca_file` is set.
    pub include_system_ca_certs_pool: bool,
}

/// TLS settings of an inbound server. Presence of this block switches the
/// listener to TLS.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct TlsServerSettings {
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    /// Enables mutual TLS: clients must present a certificate issued by one
    /// of these CAs.
    pub client_ca_file: Option<PathBuf>,
}

impl TlsClientSettings {
    /// Builds the rustls client context.
    ///
    /// # Errors
    /// Returns [`TlsError`] when files cannot be read, hold no usable
    /// material, or only one of certificate and key is configured.
    pub fn load_client_config(&self) -> Result<ClientConfig, TlsError> {
        let key_pair = load_key_pair(self.cert_file.as_deref(), self.key_file.as_deref())?;

        let roots = match &self.ca_file {
            Some(path) => {
                let mut roots = load_root_store(path)?;
                if self.include_system_ca_certs_pool {
                    roots.add_parsable_certificates(native_root_certs().iter().cloned());
                }
                roots
            }
            None => system_root_store(),
        };

        let builder = ClientConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots);

        let config = match key_pair {
            Some((certs, key)) => builder.with_client_auth_cert(certs, key)?,
            None => builder.with_no_client_auth(),
        };
        Ok(config)
    }
}

impl TlsServerSettings {
    /// Builds the rustls server context, advertising `h2` and `http/1.1`.
    ///
    /// # Errors
    /// Returns [`TlsError`] when the certificate or key is missing or
    /// unreadable, or the client CA pool is empty.
    pub fn load_server_config(&self) -> Result<ServerConfig, TlsError> {
        let (certs, key) = load_key_pair(self.cert_file.as_deref(), self.key_file.as_deref())?
            .ok_or(TlsError::MissingServerCertificate)?;

        let provider = crypto_provider();
        let builder = ServerConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()?;

        let builder = match &self.client_ca_file {
            Some(path) => {
                let roots = load_root_store(path)?;
                let verifier =
                    WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider).build()?;
                builder.with_client_cert_verifier(verifier)
            }
            None => builder.with_no_client_auth(),
        };

        let mut config = builder.with_single_cert(certs, key)?;
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        Ok(config)
    }
}

type KeyPair = (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>);

fn load_key_pair(cert: Option<&Path>, key: Option<&Path>) -> Result<Option<KeyPair>, TlsError> {
    match (cert, key) {
        (Some(cert), Some(key)) => {
            let certs = load_certs(cert)?;
            let key = PrivateKeyDer::from_pem_file(key).map_err(|source| TlsError::PrivateKey {
                path: key.to_path_buf(),
                source,
            })?;
            Ok(Some((certs, key)))
        }
        (None, None) => Ok(None),
        _ => Err(TlsError::CertKeyMismatch),
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let wrap = |source| TlsError::Certificates {
        path: path.to_path_buf(),
        source,
    };
    CertificateDer::pem_file_iter(path)
        .map_err(wrap)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(wrap)
}

fn load_root_store(path: &Path) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(load_certs(path)?);
    if ignored > 0 {
        tracing::warn!(path = %path.display(), ignored, "some CA certificates could not be parsed");
    }
    if added == 0 {
        return Err(TlsError::EmptyCaPool(path.to_path_buf()));
    }
    Ok(roots)
}

/// System roots, or the bundled webpki roots when the OS store is empty.
fn system_root_store() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    let (added, _) = roots.add_parsable_certificates(native_root_certs().iter().cloned());
    if added == 0 {
        tracing::debug!("no usable system roots, falling back to bundled webpki roots");
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }
    roots
}

fn native_root_certs() -> &'static [CertificateDer<'static>] {
    NATIVE_ROOTS_CACHE.get_or_init(|| {
        let result = rustls_native_certs::load_native_certs();
        for err in &result.errors {
            tracing::warn!(error = %err, "error loading native root certificate");
        }
        tracing::debug!(count = result.certs.len(), "loaded native root certificates");
        result.certs
    })
}

/// Process default provider if one is installed, aws-lc-rs otherwise.
fn crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    rustls::crypto::CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}
