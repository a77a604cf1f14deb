//! # Validation
//!
//! Checks that must pass before any cluster object is touched.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("exactly one of server.distribution.name or server.distribution.image must be set")]
    AmbiguousDistribution,
    #[error("unknown distribution {name:?}; available: {available}")]
    UnknownDistribution { name: String, available: String },
    #[error("userConfig must set either configMapName or inline, not both")]
    ConflictingUserConfig,
    #[error("inline userConfig is not valid YAML: {reason}")]
    InvalidInlineConfig { reason: String },
    #[error("ConfigMap {namespace}/{name} not found")]
    ConfigMapNotFound { namespace: String, name: String },
    #[error("ConfigMap {namespace}/{name} has no key {key:?}")]
    MissingConfigMapKey {
        namespace: String,
        name: String,
        key: String,
    },
    #[error("ConfigMap {namespace}/{name} key {key:?} is not a valid PEM certificate bundle: {reason}")]
    InvalidCertificate {
        namespace: String,
        name: String,
        key: String,
        reason: String,
    },
}

/// Validate a PEM bundle, returning the number of certificates found.
///
/// Every CERTIFICATE section must decode and parse as a complete X.509
/// certificate. One bad section fails the whole bundle.
pub fn validate_pem_bundle(content: &str) -> Result<usize, String> {
    let mut reader = content.as_bytes();
    let mut count = 0;
    for (index, section) in rustls_pemfile::certs(&mut reader).enumerate() {
        let position = index + 1;
        let der = section.map_err(|e| format!("certificate {position} is not valid PEM: {e}"))?;
        let (rest, _) = x509_parser::parse_x509_certificate(der.as_ref())
            .map_err(|e| format!("certificate {position} is not a valid X.509 certificate: {e}"))?;
        if !rest.is_empty() {
            return Err(format!(
                "certificate {position} has {} trailing bytes",
                rest.len()
            ));
        }
        count += 1;
    }
    if count == 0 {
        return Err("no CERTIFICATE block found".to_string());
    }
    Ok(count)
}
