use std::fmt;
use std::path::Path;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use rustls::{InconsistentKeys, RootCertStore};
use tracing::{info, warn};

use crate::error::ConfigError;

/// Loaded and checked TLS material for mutual authentication. The PEM text is
/// kept as-is since librdkafka takes it inline.
#[derive(Clone)]
pub struct TlsContext {
    certificate_pem: String,
    key_pem: String,
    ca_pem: String,
    chain_len: usize,
    trust_anchors: usize,
    skip_server_verification: bool,
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsContext")
            .field("chain_len", &self.chain_len)
            .field("trust_anchors", &self.trust_anchors)
            .field("skip_server_verification", &self.skip_server_verification)
            .finish_non_exhaustive()
    }
}

impl TlsContext {
    pub fn certificate_pem(&self) -> &str {
        &self.certificate_pem
    }

    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    pub fn ca_pem(&self) -> &str {
        &self.ca_pem
    }

    /// Number of certificates presented to the broker.
    pub fn chain_len(&self) -> usize {
        self.chain_len
    }

    /// Number of usable certificates in the trust bundle.
    pub fn trust_anchors(&self) -> usize {
        self.trust_anchors
    }

    pub fn skip_server_verification(&self) -> bool {
        self.skip_server_verification
    }
}

/// Load the client certificate chain, the trust bundle and the client key
/// from PEM files and check that the key belongs to the leaf certificate.
///
/// With `skip_server_verification` the broker certificate is not checked
/// against the bundle. The bundle is still loaded and must be usable.
pub fn configure_transport(
    cert_path: &Path,
    ca_path: &Path,
    key_path: &Path,
    skip_server_verification: bool,
) -> Result<TlsContext, ConfigError> {
    let certificate_pem = read_pem("client certificate", cert_path)?;
    let chain = parse_certs("client certificate", cert_path, &certificate_pem)?;

    let ca_pem = read_pem("CA bundle", ca_path)?;
    let anchors = parse_certs("CA bundle", ca_path, &ca_pem)?;
    let mut roots = RootCertStore::empty();
    let (trust_anchors, ignored) = roots.add_parsable_certificates(anchors);
    if ignored > 0 {
        warn!(
            path = %ca_path.display(),
            ignored, "skipped unparsable certificates in CA bundle"
        );
    }
    if trust_anchors == 0 {
        return Err(ConfigError::Malformed {
            kind: "CA bundle",
            path: ca_path.to_path_buf(),
            reason: "no usable trust anchors".to_string(),
        });
    }

    let key_pem = read_pem("client key", key_path)?;
    let key = parse_key(key_path, &key_pem)?;

    let chain_len = chain.len();
    check_key_pair(chain, key, key_path)?;

    if skip_server_verification {
        warn!("broker certificate verification is disabled");
    }
    info!(
        chain_len,
        trust_anchors,
        skip_server_verification,
        "TLS transport configured"
    );

    Ok(TlsContext {
        certificate_pem,
        key_pem,
        ca_pem,
        chain_len,
        trust_anchors,
        skip_server_verification,
    })
}

fn read_pem(kind: &'static str, path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
        kind,
        path: path.to_path_buf(),
        source,
    })
}

fn parse_certs(
    kind: &'static str,
    path: &Path,
    pem: &str,
) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let certs = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConfigError::Malformed {
            kind,
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    if certs.is_empty() {
        return Err(ConfigError::Empty {
            kind,
            path: path.to_path_buf(),
        });
    }
    Ok(certs)
}

fn parse_key(path: &Path, pem: &str) -> Result<PrivateKeyDer<'static>, ConfigError> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(|e| ConfigError::Malformed {
            kind: "client key",
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?
        .ok_or_else(|| ConfigError::Empty {
            kind: "client key",
            path: path.to_path_buf(),
        })
}

fn check_key_pair(
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    key_path: &Path,
) -> Result<(), ConfigError> {
    let provider = rustls::crypto::ring::default_provider();
    let signing_key =
        provider
            .key_provider
            .load_private_key(key)
            .map_err(|e| ConfigError::Malformed {
                kind: "client key",
                path: key_path.to_path_buf(),
                reason: e.to_string(),
            })?;

    match CertifiedKey::new(chain, signing_key).keys_match() {
        Ok(()) => Ok(()),
        Err(rustls::Error::InconsistentKeys(InconsistentKeys::Unknown)) => {
            warn!("could not compare client key with certificate, continuing");
            Ok(())
        }
        Err(e) => Err(ConfigError::KeyMismatch(e.to_string())),
    }
}
