use rcgen::{
    CertificateParams, DistinguishedName, DnType, Ia5String, IsCa, KeyPair, KeyUsagePurpose,
    SanType, SerialNumber,
};
use thiserror::Error;

/// Errors that can occur during certificate creation.
#[derive(Error, Debug)]
pub enum CertificateError {
    #[error("Failed to generate certificate: {0}")]
    GenerationError(String),
    #[error("validity must be at least one day")]
    InvalidValidity,
}

/// Trust material for a Leaf node taking part in a federated network.
///
/// Peers record the PEM certificate against the node's issuer and key id, and verify the
/// node's signed requests with it.
pub struct NodeCertificate;

impl NodeCertificate {
    /// Creates a new self-signed X.509 certificate for a Leaf node.
    ///
    /// # Arguments
    ///
    /// * `node_name` - Display name of the node (used as Common Name in Subject).
    /// * `issuer` - The token issuer URL the node signs with (e.g. "urn:leaf:iss:leaf.example.org").
    /// * `key_id` - The key identifier peers use to look the certificate up.
    /// * `valid_days` - Validity period from now.
    ///
    /// # Returns
    ///
    /// A tuple of (X.509 certificate PEM, private key PEM).
    ///
    /// # Errors
    ///
    /// Returns `CertificateError::GenerationError` if certificate generation fails.
    pub fn create(
        node_name: &str,
        issuer: &str,
        key_id: &str,
        valid_days: i64,
    ) -> Result<(String, String), CertificateError> {
        if valid_days < 1 {
            return Err(CertificateError::InvalidValidity);
        }

        let mut params = CertificateParams::default();

        let mut subject = DistinguishedName::new();
        subject.push(DnType::CommonName, node_name);
        subject.push(DnType::OrganizationName, issuer);
        params.distinguished_name = subject;

        params.is_ca = IsCa::NoCa;

        // Issuer and key id travel as a URI so peers can match them against registry records
        let uri = format!("leaf://{}/{}", issuer, key_id);
        let uri = Ia5String::try_from(uri)
            .map_err(|e| CertificateError::GenerationError(e.to_string()))?;
        params.subject_alt_names.push(SanType::URI(uri));

        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];

        let now = time::OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + time::Duration::days(valid_days);

        params.serial_number = Some(SerialNumber::from(
            now.unix_timestamp().to_be_bytes().to_vec(),
        ));

        let key_pair =
            KeyPair::generate().map_err(|e| CertificateError::GenerationError(e.to_string()))?;

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| CertificateError::GenerationError(e.to_string()))?;

        Ok((cert.pem(), key_pair.serialize_pem()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_node_certificate() {
        let (cert_pem, key_pem) =
            NodeCertificate::create("Leaf UW", "urn:leaf:iss:leaf.uw.edu", "UW-1", 365)
                .expect("should create certificate");

        assert!(cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(cert_pem.contains("END CERTIFICATE"));
        assert!(key_pem.contains("BEGIN PRIVATE KEY"));
        assert!(key_pem.contains("END PRIVATE KEY"));
    }

    #[test]
    fn test_certificate_carries_issuer_uri() {
        let (cert_pem, _) = NodeCertificate::create("Leaf A", "leaf.a.org", "A-1", 30)
            .expect("should create certificate");

        let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes())
            .expect("should parse pem");
        let cert = pem.parse_x509().expect("should parse x509");
        let san = cert
            .subject_alternative_name()
            .expect("should read extension")
            .expect("should have san");
        let uris: Vec<String> = san
            .value
            .general_names
            .iter()
            .filter_map(|name| match name {
                x509_parser::extensions::GeneralName::URI(uri) => Some(uri.to_string()),
                _ => None,
            })
            .collect();
        assert_eq!(uris, vec!["leaf://leaf.a.org/A-1".to_string()]);
    }

    #[test]
    fn test_rejects_zero_validity() {
        let result = NodeCertificate::create("Leaf B", "leaf.b.org", "B-1", 0);
        assert!(matches!(result, Err(CertificateError::InvalidValidity)));
    }
}
