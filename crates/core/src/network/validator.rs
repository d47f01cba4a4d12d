//! Validation of administrative endpoint edits and peer trust material.

use crate::network::{NetworkEndpoint, NetworkEndpointDraft};
use crate::{LeafError, LeafResult};
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use leaf_types::NonEmptyText;
use reqwest::Url;
use std::time::Duration;
use uuid::Uuid;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::*;

/// What this node relies on from a peer certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    pub subject: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// `leaf://{issuer}/{key id}` URIs from the subject alternative names.
    pub node_uris: Vec<String>,
}

impl CertificateInfo {
    pub fn is_current(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now && now <= self.not_after
    }

    /// True when a `leaf://` URI in the certificate names `issuer`/`key_id`.
    ///
    /// A certificate carrying no such URI names no node and never matches.
    pub fn names_node(&self, issuer: &str, key_id: &str) -> bool {
        let expected = format!("leaf://{}/{}", issuer, key_id);
        self.node_uris.iter().any(|uri| *uri == expected)
    }
}

/// Parse an X.509 certificate given as PEM or as base64 DER.
///
/// # Errors
///
/// Returns `LeafError::Certificate` if the text is neither.
pub fn parse_certificate(raw: &str) -> LeafResult<CertificateInfo> {
    let raw = raw.trim();
    let der: Vec<u8> = if raw.contains("-----BEGIN CERTIFICATE-----") {
        let (_, pem) = x509_parser::pem::parse_x509_pem(raw.as_bytes())
            .map_err(|e| LeafError::Certificate(e.to_string()))?;
        pem.contents
    } else {
        let compact: String = raw.split_whitespace().collect();
        general_purpose::STANDARD
            .decode(compact)
            .map_err(|e| LeafError::Certificate(format!("not PEM or base64 DER: {}", e)))?
    };

    let (_, cert) =
        X509Certificate::from_der(&der).map_err(|e| LeafError::Certificate(e.to_string()))?;

    let validity = cert.validity();
    let not_before = DateTime::from_timestamp(validity.not_before.timestamp(), 0)
        .ok_or_else(|| LeafError::Certificate("not-before out of range".into()))?;
    let not_after = DateTime::from_timestamp(validity.not_after.timestamp(), 0)
        .ok_or_else(|| LeafError::Certificate("not-after out of range".into()))?;

    let node_uris = cert
        .subject_alternative_name()
        .map_err(|e| LeafError::Certificate(e.to_string()))?
        .map(|san| {
            san.value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    GeneralName::URI(uri) if uri.starts_with("leaf://") => Some(uri.to_string()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(CertificateInfo {
        subject: cert.subject().to_string(),
        not_before,
        not_after,
        node_uris,
    })
}

/// Checks endpoint records before they reach persistence.
#[derive(Debug, Clone, Copy)]
pub struct NetworkValidator {
    ensure_https: bool,
}

impl NetworkValidator {
    pub fn new(ensure_https: bool) -> Self {
        Self { ensure_https }
    }

    /// Validate a draft into an endpoint record.
    ///
    /// # Arguments
    ///
    /// * `id` - Id of the record being created or updated
    /// * `draft` - Submitted fields
    /// * `created` - Creation time to keep (or now, for new records)
    ///
    /// # Errors
    ///
    /// Returns `LeafError::Text` for blank required fields, `LeafError::InvalidInput` for a
    /// bad address and `LeafError::Certificate` for unparseable trust material.
    pub fn validate(
        &self,
        id: Uuid,
        draft: &NetworkEndpointDraft,
        created: DateTime<Utc>,
    ) -> LeafResult<NetworkEndpoint> {
        let name = NonEmptyText::new(&draft.name)?;
        let issuer = NonEmptyText::new(&draft.issuer)?;
        let key_id = NonEmptyText::new(&draft.key_id)?;
        let certificate = NonEmptyText::new(&draft.certificate)?;
        let address = self.validate_address(&draft.address)?;
        parse_certificate(certificate.as_str())?;

        Ok(NetworkEndpoint {
            id,
            name,
            address,
            issuer,
            key_id,
            certificate,
            is_responder: draft.is_responder,
            is_interrogator: draft.is_interrogator,
            timeout: draft.timeout_secs.map(Duration::from_secs),
            created,
            updated: Utc::now(),
        })
    }

    /// Re-check a stored record, as when loading the cache.
    pub fn check(&self, endpoint: &NetworkEndpoint) -> LeafResult<()> {
        self.validate_address(endpoint.address.as_str())?;
        parse_certificate(endpoint.certificate.as_str())?;
        Ok(())
    }

    fn validate_address(&self, raw: &str) -> LeafResult<Url> {
        let address = Url::parse(raw.trim())
            .map_err(|e| LeafError::InvalidInput(format!("address '{}': {}", raw, e)))?;
        if address.host_str().is_none() {
            return Err(LeafError::InvalidInput(format!(
                "address '{}' has no host",
                raw
            )));
        }
        if self.ensure_https && address.scheme() != "https" {
            return Err(LeafError::InvalidInput(format!(
                "address '{}' must use https",
                raw
            )));
        }
        Ok(address)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use leaf_certificates::NodeCertificate;

    pub(crate) fn draft(name: &str, issuer: &str) -> NetworkEndpointDraft {
        let (certificate, _) = NodeCertificate::create(name, issuer, "key-1", 30)
            .expect("should create certificate");
        NetworkEndpointDraft {
            name: name.into(),
            address: format!("https://{}.example.org", name.to_lowercase()),
            issuer: issuer.into(),
            key_id: "key-1".into(),
            certificate,
            is_responder: true,
            is_interrogator: true,
            timeout_secs: Some(5),
        }
    }

    #[test]
    fn test_valid_draft_passes() {
        let validator = NetworkValidator::new(true);
        let endpoint = validator
            .validate(Uuid::new_v4(), &draft("Alpha", "leaf.alpha.org"), Utc::now())
            .expect("draft should validate");
        assert_eq!(endpoint.issuer.as_str(), "leaf.alpha.org");
        assert_eq!(endpoint.timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_blank_required_fields_rejected() {
        let validator = NetworkValidator::new(true);
        for field in ["name", "issuer", "key_id", "certificate"] {
            let mut d = draft("Alpha", "leaf.alpha.org");
            match field {
                "name" => d.name = "  ".into(),
                "issuer" => d.issuer = String::new(),
                "key_id" => d.key_id = "\t".into(),
                _ => d.certificate = String::new(),
            }
            let result = validator.validate(Uuid::new_v4(), &d, Utc::now());
            assert!(matches!(result, Err(LeafError::Text(_))), "{} should be required", field);
        }
    }

    #[test]
    fn test_https_required_unless_disabled() {
        let mut d = draft("Alpha", "leaf.alpha.org");
        d.address = "http://alpha.example.org".into();
        assert!(matches!(
            NetworkValidator::new(true).validate(Uuid::new_v4(), &d, Utc::now()),
            Err(LeafError::InvalidInput(msg)) if msg.contains("https")
        ));
        assert!(NetworkValidator::new(false)
            .validate(Uuid::new_v4(), &d, Utc::now())
            .is_ok());
    }

    #[test]
    fn test_certificate_accepts_base64_der_and_rejects_garbage() {
        let d = draft("Alpha", "leaf.alpha.org");
        let (_, pem) = x509_parser::pem::parse_x509_pem(d.certificate.as_bytes())
            .expect("should parse pem");
        let der_b64 = general_purpose::STANDARD.encode(&pem.contents);
        let info = parse_certificate(&der_b64).expect("base64 DER should parse");
        assert!(info.is_current(Utc::now()));
        assert!(info.names_node("leaf.alpha.org", "key-1"));
        assert!(!info.names_node("leaf.beta.org", "key-1"));

        let mut bad = d.clone();
        bad.certificate = "not a certificate".into();
        assert!(matches!(
            NetworkValidator::new(true).validate(Uuid::new_v4(), &bad, Utc::now()),
            Err(LeafError::Certificate(_))
        ));
    }

    #[test]
    fn test_certificate_without_node_uri_names_no_node() {
        let d = draft("Alpha", "leaf.alpha.org");
        let mut info = parse_certificate(&d.certificate).expect("should parse");
        info.node_uris.clear();
        assert!(!info.names_node("leaf.alpha.org", "key-1"));

        info.node_uris = vec!["leaf://leaf.alpha.org/key-2".into()];
        assert!(!info.names_node("leaf.alpha.org", "key-1"));
        assert!(info.names_node("leaf.alpha.org", "key-2"));
    }
}
