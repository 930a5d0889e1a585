//! Evaluation context: which server/host authorization is being checked for.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// A server certificate used for applicability matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    der: Vec<u8>,
    fingerprint: String,
}

impl Certificate {
    /// Wrap DER-encoded certificate bytes.
    pub fn from_der(der: impl Into<Vec<u8>>) -> Self {
        let der = der.into();
        let fingerprint = hex::encode(Sha256::digest(&der));
        Self { der, fingerprint }
    }

    /// Raw DER bytes.
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Lowercase hex SHA-256 fingerprint of the DER bytes.
    pub fn sha256_fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

/// Immutable context an authorization query is evaluated against.
///
/// Built fresh per query with the builder methods; an empty environment
/// matches only entitlements without an applicability rule.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Environment {
    /// Environment identifier.
    pub identifier: Option<String>,

    /// Bookmark (account/connection) identity.
    pub bookmark_id: Option<String>,

    /// Server hostname.
    pub hostname: Option<String>,

    /// Server certificate.
    pub certificate: Option<Certificate>,

    /// Provider-specific extension data.
    pub attributes: BTreeMap<String, Value>,
}

impl Environment {
    /// An empty environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the identifier.
    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    /// Set the bookmark identity.
    pub fn with_bookmark(mut self, bookmark_id: impl Into<String>) -> Self {
        self.bookmark_id = Some(bookmark_id.into());
        self
    }

    /// Set the hostname. Hostnames compare case-insensitively, so it is lowercased.
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into().to_ascii_lowercase());
        self
    }

    /// Set the certificate.
    pub fn with_certificate(mut self, certificate: Certificate) -> Self {
        self.certificate = Some(certificate);
        self
    }

    /// Add an attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Look up an attribute.
    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }
}
