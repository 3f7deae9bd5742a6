//! Layered endpoint addresses.
//!
//! An endpoint is an ordered stack of per-layer parameter maps, lower indices
//! being lower layers, e.g. `[{addr: "host", port: "8011"}, {ca_file: ...}]`.
//! Equality is structural. A stack with placeholder values can be completed
//! from a `default_parameters` stack, which lets a client express "relay with
//! the same TLS settings as the previous hop" compactly.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One layer's parameters.
pub type LayerParameters = BTreeMap<String, String>;

/// Ordered stack of layer parameters describing one endpoint.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointStack {
    pub layers: Vec<LayerParameters>,
}

impl EndpointStack {
    pub fn new(layers: Vec<LayerParameters>) -> Self {
        Self { layers }
    }

    /// Plain TCP endpoint (single transport layer).
    pub fn tcp(addr: &str, port: u16) -> Self {
        let mut layer = LayerParameters::new();
        layer.insert("addr".into(), addr.into());
        layer.insert("port".into(), port.to_string());
        Self {
            layers: vec![layer],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Pushes a layer on top of the stack and returns self.
    pub fn with_layer(mut self, layer: LayerParameters) -> Self {
        self.layers.push(layer);
        self
    }

    /// Looks a key up in the given layer.
    pub fn get(&self, layer: usize, key: &str) -> Option<&str> {
        self.layers.get(layer)?.get(key).map(String::as_str)
    }

    /// Looks a key up in any layer, lowest first.
    pub fn find(&self, key: &str) -> Option<&str> {
        self.layers
            .iter()
            .find_map(|layer| layer.get(key))
            .map(String::as_str)
    }

    /// `addr:port` of the transport layer, if present.
    pub fn socket_addr(&self) -> Option<String> {
        let addr = self.find("addr")?;
        let port = self.find("port")?;
        Some(format!("{addr}:{port}"))
    }

    /// Fills missing or empty parameters from `defaults`, layer by layer.
    /// Layers present in `defaults` but absent here are appended.
    pub fn fill_defaults(&mut self, defaults: &EndpointStack) {
        for (idx, default_layer) in defaults.layers.iter().enumerate() {
            if let Some(layer) = self.layers.get_mut(idx) {
                for (key, value) in default_layer {
                    let slot = layer.entry(key.clone()).or_default();
                    if slot.is_empty() {
                        slot.clone_from(value);
                    }
                }
            } else {
                self.layers.push(default_layer.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structural_equality() {
        let a = EndpointStack::tcp("host", 8011);
        let b = EndpointStack::tcp("host", 8011);
        let c = EndpointStack::tcp("host", 8012);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_socket_addr() {
        let ep = EndpointStack::tcp("127.0.0.1", 9000);
        assert_eq!(ep.socket_addr().unwrap(), "127.0.0.1:9000");
        assert_eq!(EndpointStack::default().socket_addr(), None);
    }

    #[test]
    fn test_fill_defaults_completes_placeholders() {
        let mut tls_layer = LayerParameters::new();
        tls_layer.insert("ca_file".into(), String::new());
        let mut ep = EndpointStack::tcp("relay", 8011).with_layer(tls_layer);

        let mut default_tls = LayerParameters::new();
        default_tls.insert("ca_file".into(), "/etc/ssf/ca.pem".into());
        default_tls.insert("cert_file".into(), "/etc/ssf/cert.pem".into());
        let defaults = EndpointStack::new(vec![LayerParameters::new(), default_tls]);

        ep.fill_defaults(&defaults);
        assert_eq!(ep.get(1, "ca_file"), Some("/etc/ssf/ca.pem"));
        assert_eq!(ep.get(1, "cert_file"), Some("/etc/ssf/cert.pem"));
        // existing values stay untouched
        assert_eq!(ep.get(0, "addr"), Some("relay"));
    }

    #[test]
    fn test_fill_defaults_appends_missing_layers() {
        let mut ep = EndpointStack::tcp("relay", 8011);
        let mut tls = LayerParameters::new();
        tls.insert("ca_file".into(), "ca.pem".into());
        let defaults = EndpointStack::new(vec![LayerParameters::new(), tls]);
        ep.fill_defaults(&defaults);
        assert_eq!(ep.layers.len(), 2);
        assert_eq!(ep.get(1, "ca_file"), Some("ca.pem"));
    }

    #[test]
    fn test_json_roundtrip() {
        let ep = EndpointStack::tcp("host", 8011);
        let json = serde_json::to_string(&ep).unwrap();
        let back: EndpointStack = serde_json::from_str(&json).unwrap();
        assert_eq!(ep, back);
    }
}
