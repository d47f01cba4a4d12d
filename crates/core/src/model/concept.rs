use crate::user::UserContext;
use leaf_types::{LeafUrn, TextError};
use uuid::Uuid;

/// A resolved clinical data source with its bound SQL fragments.
///
/// Fragments are administrator-authored and may contain the alias marker (`@` by default),
/// which the compiler replaces with the alias of the source set it generates.
#[derive(Debug, Clone, PartialEq)]
pub struct Concept {
    pub id: Uuid,
    pub urn: Option<LeafUrn>,
    pub display_name: String,
    pub is_encounter_based: bool,
    pub sql_set_from: String,
    pub sql_set_where: Option<String>,
    pub sql_field_date: Option<String>,
    pub sql_field_numeric: Option<String>,
    pub numeric_unit: Option<String>,
    /// Roles allowed to use the concept. Empty means unrestricted.
    pub allowed_roles: Vec<String>,
}

impl Concept {
    /// True when matched rows carry dates usable for sequences, recency and count filters.
    pub fn has_dates(&self) -> bool {
        self.is_encounter_based && self.sql_field_date.is_some()
    }

    pub fn is_authorized_for(&self, user: &UserContext) -> bool {
        self.allowed_roles.is_empty()
            || self
                .allowed_roles
                .iter()
                .any(|role| user.roles().contains(role.as_str()))
    }

    /// Reference to this concept, preferring the portable URN.
    pub fn reference(&self) -> ResourceRef {
        ResourceRef {
            id: Some(self.id),
            urn: self.urn.clone(),
        }
    }
}

/// A reference to a concept by local id and/or universal URN.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceRef {
    pub id: Option<Uuid>,
    pub urn: Option<LeafUrn>,
}

impl ResourceRef {
    pub fn by_id(id: Uuid) -> Self {
        Self {
            id: Some(id),
            urn: None,
        }
    }

    pub fn by_urn(urn: LeafUrn) -> Self {
        Self {
            id: None,
            urn: Some(urn),
        }
    }

    /// Parse either a bare UUID or a `urn:leaf:...` string.
    pub fn parse(input: &str) -> Result<Self, TextError> {
        let trimmed = input.trim();
        if let Ok(id) = Uuid::parse_str(trimmed) {
            return Ok(Self::by_id(id));
        }
        LeafUrn::parse(trimmed).map(Self::by_urn)
    }

    pub fn is_empty(&self) -> bool {
        self.id.is_none() && self.urn.is_none()
    }
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.urn, &self.id) {
            (Some(urn), _) => write!(f, "{}", urn),
            (None, Some(id)) => write!(f, "{}", id),
            (None, None) => write!(f, "<empty>"),
        }
    }
}
