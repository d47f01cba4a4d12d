//! YAML seed catalog.
//!
//! One file carries everything the in-memory stores start from: concepts, global panel
//! filters, this node's identity, known peers and revoked sessions.
//!
//! ```yaml
//! identity:
//!   name: Leaf North
//! concepts:
//!   - id: 6f1c...
//!     urn: urn:leaf:concept:visit:ed
//!     display_name: ED visit
//!     is_encounter_based: true
//!     sql_set_from: Encounter
//!     sql_set_where: "@.Type = 'ED'"
//!     sql_field_date: "@.AdmitDate"
//! global_filters:
//!   - id: 0d2e...
//!     session_type: research
//!     is_inclusion: false
//!     concept: urn:leaf:concept:demographics:vip
//! ```

use crate::blacklist::{BlacklistedToken, InMemoryBlacklistSource};
use crate::model::{Concept, GlobalPanelFilter, ResourceRef};
use crate::network::{
    InMemoryNetworkStore, NetworkEndpoint, NetworkEndpointDraft, NetworkIdentity, NetworkValidator,
};
use crate::resolver::InMemoryConceptStore;
use crate::user::SessionType;
use crate::{LeafError, LeafResult};
use chrono::{DateTime, Utc};
use leaf_types::{LeafUrn, NonEmptyText};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

// ==== File format ====

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogFile {
    pub identity: IdentityEntry,
    #[serde(default)]
    pub concepts: Vec<ConceptEntry>,
    #[serde(default)]
    pub global_filters: Vec<GlobalFilterEntry>,
    #[serde(default)]
    pub endpoints: Vec<EndpointEntry>,
    #[serde(default)]
    pub blacklist: Vec<BlacklistEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityEntry {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abbreviation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_patients: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_color: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConceptEntry {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urn: Option<LeafUrn>,
    pub display_name: String,
    #[serde(default)]
    pub is_encounter_based: bool,
    pub sql_set_from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_set_where: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_field_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_field_numeric: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub numeric_unit: Option<String>,
    #[serde(default)]
    pub allowed_roles: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionTypeEntry {
    Research,
    QualityImprovement,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalFilterEntry {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_type: Option<SessionTypeEntry>,
    pub is_inclusion: bool,
    /// Concept id or URN.
    pub concept: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    pub name: String,
    pub address: String,
    pub issuer: String,
    pub key_id: String,
    pub certificate: String,
    #[serde(default)]
    pub is_responder: bool,
    #[serde(default)]
    pub is_interrogator: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BlacklistEntry {
    pub id: Uuid,
    pub expires: DateTime<Utc>,
}

impl From<SessionTypeEntry> for SessionType {
    fn from(entry: SessionTypeEntry) -> Self {
        match entry {
            SessionTypeEntry::Research => SessionType::Research,
            SessionTypeEntry::QualityImprovement => SessionType::QualityImprovement,
        }
    }
}

impl From<ConceptEntry> for Concept {
    fn from(entry: ConceptEntry) -> Self {
        Concept {
            id: entry.id,
            urn: entry.urn,
            display_name: entry.display_name,
            is_encounter_based: entry.is_encounter_based,
            sql_set_from: entry.sql_set_from,
            sql_set_where: entry.sql_set_where,
            sql_field_date: entry.sql_field_date,
            sql_field_numeric: entry.sql_field_numeric,
            numeric_unit: entry.numeric_unit,
            allowed_roles: entry.allowed_roles,
        }
    }
}

impl From<EndpointEntry> for NetworkEndpointDraft {
    fn from(entry: EndpointEntry) -> Self {
        NetworkEndpointDraft {
            name: entry.name,
            address: entry.address,
            issuer: entry.issuer,
            key_id: entry.key_id,
            certificate: entry.certificate,
            is_responder: entry.is_responder,
            is_interrogator: entry.is_interrogator,
            timeout_secs: entry.timeout_secs,
        }
    }
}

// ==== Loaded catalog ====

/// Seed data, validated and converted into domain types.
#[derive(Debug, Clone)]
pub struct Catalog {
    pub identity: NetworkIdentity,
    pub concepts: Vec<Concept>,
    pub global_filters: Vec<GlobalPanelFilter>,
    pub endpoints: Vec<(Uuid, NetworkEndpointDraft)>,
    pub blacklist: Vec<BlacklistedToken>,
}

impl Catalog {
    /// Read and convert a catalog file.
    ///
    /// # Errors
    ///
    /// Returns `LeafError::FileRead` if the file cannot be read and
    /// `LeafError::YamlDeserialization` if it is not a valid catalog.
    pub fn load(path: &Path) -> LeafResult<Self> {
        let text = std::fs::read_to_string(path).map_err(LeafError::FileRead)?;
        let catalog = Self::from_yaml(&text)?;
        tracing::info!(
            path = %path.display(),
            concepts = catalog.concepts.len(),
            global_filters = catalog.global_filters.len(),
            endpoints = catalog.endpoints.len(),
            "loaded catalog"
        );
        Ok(catalog)
    }

    pub fn from_yaml(text: &str) -> LeafResult<Self> {
        let file: CatalogFile =
            serde_yaml::from_str(text).map_err(LeafError::YamlDeserialization)?;
        Self::try_from(file)
    }

    pub fn concept_store(&self) -> InMemoryConceptStore {
        InMemoryConceptStore::new(self.concepts.clone(), self.global_filters.clone())
    }

    /// Validate seeded endpoints into a network store. Invalid entries are logged and skipped.
    pub fn network_store(&self, validator: &NetworkValidator) -> InMemoryNetworkStore {
        let now = Utc::now();
        let endpoints: Vec<NetworkEndpoint> = self
            .endpoints
            .iter()
            .filter_map(|(id, draft)| match validator.validate(*id, draft, now) {
                Ok(endpoint) => Some(endpoint),
                Err(e) => {
                    tracing::error!(
                        endpoint = %id,
                        name = %draft.name,
                        "skipping catalog endpoint: {}",
                        e
                    );
                    None
                }
            })
            .collect();
        InMemoryNetworkStore::new(self.identity.clone(), endpoints)
    }

    pub fn blacklist_source(&self) -> InMemoryBlacklistSource {
        InMemoryBlacklistSource::new(self.blacklist.clone())
    }
}

impl TryFrom<CatalogFile> for Catalog {
    type Error = LeafError;

    fn try_from(file: CatalogFile) -> LeafResult<Self> {
        let identity = NetworkIdentity {
            name: NonEmptyText::new(&file.identity.name)?,
            abbreviation: file.identity.abbreviation,
            description: file.identity.description,
            total_patients: file.identity.total_patients,
            latitude: file.identity.latitude,
            longitude: file.identity.longitude,
            primary_color: file.identity.primary_color,
            secondary_color: file.identity.secondary_color,
        };

        let concepts: Vec<Concept> = file.concepts.into_iter().map(Concept::from).collect();

        let global_filters = file
            .global_filters
            .into_iter()
            .map(|entry| {
                let reference = ResourceRef::parse(&entry.concept).map_err(|e| {
                    LeafError::InvalidInput(format!("global filter {}: {}", entry.id, e))
                })?;
                let concept = concepts
                    .iter()
                    .find(|c| match (&reference.urn, reference.id) {
                        (Some(urn), _) => c.urn.as_ref() == Some(urn),
                        (None, Some(id)) => c.id == id,
                        (None, None) => false,
                    })
                    .ok_or_else(|| {
                        LeafError::InvalidInput(format!(
                            "global filter {} references unknown concept {}",
                            entry.id, reference
                        ))
                    })?;
                Ok(GlobalPanelFilter {
                    id: entry.id,
                    session_type: entry.session_type.map(SessionType::from),
                    is_inclusion: entry.is_inclusion,
                    concept: Arc::new(concept.clone()),
                })
            })
            .collect::<LeafResult<Vec<_>>>()?;

        let endpoints = file
            .endpoints
            .into_iter()
            .map(|entry| (entry.id.unwrap_or_else(Uuid::new_v4), entry.into()))
            .collect();

        let blacklist = file
            .blacklist
            .into_iter()
            .map(|entry| BlacklistedToken {
                id: entry.id,
                expires: entry.expires,
            })
            .collect();

        Ok(Self {
            identity,
            concepts,
            global_filters,
            endpoints,
            blacklist,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::ConceptStore;
    use std::io::Write;

    const CATALOG: &str = r#"
identity:
  name: Leaf North
  abbreviation: LN
  total_patients: 12
concepts:
  - id: 5c8d5e2e-3f5b-4f55-9f0b-6a8f1d0f4a11
    urn: urn:leaf:concept:visit:ed
    display_name: ED visit
    is_encounter_based: true
    sql_set_from: Encounter
    sql_set_where: "@.Type = 'ED'"
    sql_field_date: "@.AdmitDate"
  - id: 0b7e1c7c-5a40-4bf1-a7f3-2f4b51d3c2a2
    urn: urn:leaf:concept:demographics:vip
    display_name: VIP
    sql_set_from: Person
    sql_set_where: "@.IsVip = 1"
global_filters:
  - id: 7f6c6d5e-1111-4b7a-8f0e-9a9a9a9a9a9a
    session_type: research
    is_inclusion: false
    concept: urn:leaf:concept:demographics:vip
blacklist:
  - id: 2a2a2a2a-2222-4222-8222-222222222222
    expires: 2099-01-01T00:00:00Z
"#;

    #[tokio::test]
    async fn test_load_catalog_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("should create temp file");
        file.write_all(CATALOG.as_bytes()).expect("should write catalog");

        let catalog = Catalog::load(file.path()).expect("should load catalog");
        assert_eq!(catalog.identity.name.as_str(), "Leaf North");
        assert_eq!(catalog.concepts.len(), 2);
        assert_eq!(catalog.global_filters.len(), 1);
        assert_eq!(
            catalog.global_filters[0].session_type,
            Some(SessionType::Research)
        );
        assert_eq!(catalog.global_filters[0].concept.display_name, "VIP");
        assert_eq!(catalog.blacklist.len(), 1);

        let store = catalog.concept_store();
        let urn = LeafUrn::parse("urn:leaf:concept:visit:ed").expect("should parse");
        let found = store
            .concepts_by_urn(&[urn])
            .await
            .expect("store should answer");
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn test_unknown_global_filter_concept_is_rejected() {
        let yaml = CATALOG.replace(
            "concept: urn:leaf:concept:demographics:vip",
            "concept: urn:leaf:concept:demographics:missing",
        );
        assert!(matches!(
            Catalog::from_yaml(&yaml),
            Err(LeafError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_missing_file_and_bad_yaml() {
        assert!(matches!(
            Catalog::load(Path::new("/nonexistent/leaf-catalog.yaml")),
            Err(LeafError::FileRead(_))
        ));
        assert!(matches!(
            Catalog::from_yaml("identity: [unclosed"),
            Err(LeafError::YamlDeserialization(_))
        ));
    }

    #[tokio::test]
    async fn test_seeded_endpoints_are_validated() {
        use crate::network::NetworkStore;

        let good = crate::network::test_draft("South", "urn:leaf:iss:south");
        let mut file = CatalogFile {
            identity: IdentityEntry {
                name: "Leaf North".into(),
                ..IdentityEntry::default()
            },
            ..CatalogFile::default()
        };
        let plain = "http://plain.example.org".to_string();
        for (name, address) in [("South", good.address.clone()), ("Plain", plain)] {
            file.endpoints.push(EndpointEntry {
                id: None,
                name: name.into(),
                address,
                issuer: good.issuer.clone(),
                key_id: good.key_id.clone(),
                certificate: good.certificate.clone(),
                is_responder: true,
                is_interrogator: false,
                timeout_secs: Some(5),
            });
        }
        let yaml = serde_yaml::to_string(&file).expect("should serialise catalog");
        let catalog = Catalog::from_yaml(&yaml).expect("should parse catalog");
        assert_eq!(catalog.endpoints.len(), 2);

        let store = catalog.network_store(&NetworkValidator::new(true));
        let endpoints = store.endpoints().await.expect("should list");
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].name.as_str(), "South");
    }
}
