#![allow(dead_code)]

use network::endpoint::{EndpointStack, LayerParameters};
use network::tls::{Material, TlsParams};

/// Ephemeral PKI for link tests: one CA issuing server and client leaves.
pub struct TestPki {
    pub ca_der: Vec<u8>,
    issuer: rcgen::Issuer<'static, rcgen::KeyPair>,
}

impl Default for TestPki {
    fn default() -> Self {
        Self::new()
    }
}

impl TestPki {
    pub fn new() -> Self {
        let ca_key = rcgen::KeyPair::generate().unwrap();
        let mut ca_params = rcgen::CertificateParams::new(Vec::new()).unwrap();
        ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        ca_params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "ssf test ca");
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();
        let ca_der = ca_cert.der().to_vec();
        let issuer = rcgen::Issuer::new(ca_params, ca_key);
        Self { ca_der, issuer }
    }

    /// Issues a leaf for `san` and returns `(cert_der, key_der)`.
    pub fn issue(&self, san: &str) -> (Vec<u8>, Vec<u8>) {
        let key = rcgen::KeyPair::generate().unwrap();
        let params = rcgen::CertificateParams::new(vec![san.to_string()]).unwrap();
        let cert = params.signed_by(&key, &self.issuer).unwrap();
        (cert.der().to_vec(), key.serialize_der())
    }

    /// TLS params for one side, all material as in-memory DER buffers.
    pub fn tls_params(&self, san: &str) -> TlsParams {
        let (cert, key) = self.issue(san);
        TlsParams::new(
            Material::Buffer(self.ca_der.clone()),
            Material::Buffer(cert),
            Material::Buffer(key),
        )
    }

    /// TLS endpoint layer with hex-encoded buffer material.
    pub fn tls_layer(&self, san: &str) -> LayerParameters {
        let (cert, key) = self.issue(san);
        let mut layer = LayerParameters::new();
        layer.insert("ca_src".into(), "buffer".into());
        layer.insert("ca_buffer".into(), hex::encode(&self.ca_der));
        layer.insert("cert_src".into(), "buffer".into());
        layer.insert("cert_buffer".into(), hex::encode(cert));
        layer.insert("key_src".into(), "buffer".into());
        layer.insert("key_buffer".into(), hex::encode(key));
        layer
    }

    /// Endpoint stack (TCP + TLS layers) targeting `addr:port`.
    pub fn endpoint(&self, addr: &str, port: u16) -> EndpointStack {
        EndpointStack::tcp(addr, port).with_layer(self.tls_layer(addr))
    }
}
