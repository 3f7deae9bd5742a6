//! TLS configuration for authenticated links.
//!
//! Both sides of a link authenticate: the server presents a certificate
//! chaining to the configured CA and requires a client certificate chaining
//! to the same CA. Certificate material is loaded either from PEM files or
//! from in-memory DER buffers. TLS below 1.2 is impossible by construction
//! and session resumption (tickets and server-side caches) is disabled.

use std::sync::Arc;

use anyhow::Context;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use serde::{Deserialize, Serialize};

/// Cipher suites offered when the configuration does not name any.
pub const DEFAULT_CIPHER_LIST: &str =
    "ECDHE-RSA-AES256-GCM-SHA384:ECDHE-ECDSA-AES256-GCM-SHA384:TLS13-AES-256-GCM-SHA384";

/// Source of one piece of certificate material.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Material {
    /// PEM file on disk.
    File(std::path::PathBuf),
    /// DER-encoded bytes already in memory.
    Buffer(Vec<u8>),
}

/// TLS settings of one link endpoint.
#[derive(Clone, Debug)]
pub struct TlsParams {
    pub ca: Material,
    pub cert: Material,
    pub key: Material,
    pub cipher_list: String,
}

impl TlsParams {
    pub fn new(ca: Material, cert: Material, key: Material) -> Self {
        Self {
            ca,
            cert,
            key,
            cipher_list: DEFAULT_CIPHER_LIST.to_string(),
        }
    }

    pub fn with_cipher_list(mut self, cipher_list: &str) -> Self {
        cipher_list.clone_into(&mut self.cipher_list);
        self
    }

    /// Builds params from a TLS endpoint layer: `ca_src`/`cert_src`/`key_src`
    /// select `file` (default) or `buffer` (hex-encoded DER) per field.
    pub fn from_layer(layer: &crate::endpoint::LayerParameters) -> anyhow::Result<Self> {
        let material = |field: &str| -> anyhow::Result<Material> {
            let src = layer
                .get(&format!("{field}_src"))
                .map(String::as_str)
                .unwrap_or("file");
            match src {
                "file" => {
                    let path = layer
                        .get(&format!("{field}_file"))
                        .with_context(|| format!("missing {field}_file parameter"))?;
                    Ok(Material::File(path.into()))
                }
                "buffer" => {
                    let hex_der = layer
                        .get(&format!("{field}_buffer"))
                        .with_context(|| format!("missing {field}_buffer parameter"))?;
                    let der = hex::decode(hex_der)
                        .with_context(|| format!("{field}_buffer is not valid hex"))?;
                    Ok(Material::Buffer(der))
                }
                other => anyhow::bail!("unknown {field}_src {other:?}"),
            }
        };
        let mut params = Self::new(material("ca")?, material("cert")?, material("key")?);
        if let Some(cipher_list) = layer.get("cipher_suites") {
            params.cipher_list.clone_from(cipher_list);
        }
        Ok(params)
    }
}

/// Endpoint TLS layer referencing PEM files, as the CLIs configure it.
pub fn layer_from_files(
    ca: &std::path::Path,
    cert: &std::path::Path,
    key: &std::path::Path,
    cipher_suites: Option<&str>,
) -> crate::endpoint::LayerParameters {
    let mut layer = crate::endpoint::LayerParameters::new();
    layer.insert("ca_file".into(), ca.display().to_string());
    layer.insert("cert_file".into(), cert.display().to_string());
    layer.insert("key_file".into(), key.display().to_string());
    if let Some(cipher_suites) = cipher_suites {
        layer.insert("cipher_suites".into(), cipher_suites.to_string());
    }
    layer
}

fn load_certs(material: &Material) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    match material {
        Material::File(path) => {
            let pem = std::fs::read(path).with_context(|| format!("cannot read {path:?}"))?;
            let certs = rustls_pemfile::certs(&mut pem.as_slice())
                .collect::<Result<Vec<_>, _>>()
                .with_context(|| format!("invalid PEM in {path:?}"))?;
            if certs.is_empty() {
                anyhow::bail!("no certificate found in {path:?}");
            }
            Ok(certs)
        }
        Material::Buffer(der) => Ok(vec![CertificateDer::from(der.clone())]),
    }
}

fn load_key(material: &Material) -> anyhow::Result<PrivateKeyDer<'static>> {
    match material {
        Material::File(path) => {
            let pem = std::fs::read(path).with_context(|| format!("cannot read {path:?}"))?;
            rustls_pemfile::private_key(&mut pem.as_slice())
                .with_context(|| format!("invalid PEM in {path:?}"))?
                .with_context(|| format!("no private key found in {path:?}"))
        }
        Material::Buffer(der) => PrivateKeyDer::try_from(der.clone())
            .map_err(|e| anyhow::anyhow!("invalid private key buffer: {e}")),
    }
}

fn root_store(ca: &Material) -> anyhow::Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(ca)? {
        roots.add(cert).context("cannot add CA certificate")?;
    }
    Ok(roots)
}

/// Uppercases a suite name and strips separators and the `TLS`/`WITH`
/// noise words, so `ECDHE-RSA-AES256-GCM-SHA384` matches
/// `TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384`.
fn normalize_suite_name(name: &str) -> String {
    let mut norm: String = name
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .collect::<String>()
        .to_ascii_uppercase();
    if let Some(stripped) = norm.strip_prefix("TLS") {
        norm = stripped.to_string();
    }
    norm.replace("WITH", "")
}

/// Crypto provider restricted to the configured cipher list. Unknown names
/// are skipped with a warning; an empty selection is an error.
fn selected_provider(cipher_list: &str) -> anyhow::Result<CryptoProvider> {
    let provider = rustls::crypto::ring::default_provider();
    let mut selected = Vec::new();
    for token in cipher_list.split([':', ',']).filter(|t| !t.is_empty()) {
        let wanted = normalize_suite_name(token);
        let found = rustls::crypto::ring::ALL_CIPHER_SUITES
            .iter()
            .find(|suite| normalize_suite_name(&format!("{:?}", suite.suite())) == wanted);
        match found {
            Some(suite) => {
                let already = selected
                    .iter()
                    .any(|s: &rustls::SupportedCipherSuite| s.suite() == suite.suite());
                if !already {
                    selected.push(*suite);
                }
            }
            None => tracing::warn!("unknown cipher suite {:?}, skipping", token),
        }
    }
    if selected.is_empty() {
        anyhow::bail!("cipher list {cipher_list:?} selects no supported suite");
    }
    Ok(CryptoProvider {
        cipher_suites: selected,
        ..provider
    })
}

/// Client configuration: verifies the server against the CA and presents the
/// local certificate.
pub fn create_client_config(params: &TlsParams) -> anyhow::Result<Arc<ClientConfig>> {
    let provider = Arc::new(selected_provider(&params.cipher_list)?);
    let roots = root_store(&params.ca)?;
    let certs = load_certs(&params.cert)?;
    let key = load_key(&params.key)?;
    let mut config = ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
        .context("no usable protocol version")?
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .context("invalid client certificate or key")?;
    config.resumption = rustls::client::Resumption::disabled();
    Ok(Arc::new(config))
}

/// Server configuration: presents the local certificate and requires a
/// client certificate chaining to the CA.
pub fn create_server_config(params: &TlsParams) -> anyhow::Result<Arc<ServerConfig>> {
    let provider = Arc::new(selected_provider(&params.cipher_list)?);
    let roots = Arc::new(root_store(&params.ca)?);
    let certs = load_certs(&params.cert)?;
    let key = load_key(&params.key)?;
    let client_verifier =
        rustls::server::WebPkiClientVerifier::builder_with_provider(roots, provider.clone())
            .build()
            .context("cannot build client certificate verifier")?;
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
        .context("no usable protocol version")?
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(certs, key)
        .context("invalid server certificate or key")?;
    config.session_storage = Arc::new(rustls::server::NoServerSessionStorage {});
    config.send_tls13_tickets = 0;
    Ok(Arc::new(config))
}
