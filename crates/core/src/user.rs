//! The requesting user as supplied by the identity provider.

use std::collections::BTreeSet;

/// Purpose of the session, used to select global panel filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionType {
    Research,
    QualityImprovement,
}

#[derive(Debug, Clone)]
pub struct UserContext {
    name: String,
    issuer: String,
    roles: BTreeSet<String>,
    is_admin: bool,
    is_federated: bool,
    identified: bool,
    phi_eligible: bool,
    session_type: SessionType,
}

impl UserContext {
    pub fn builder(name: impl Into<String>, issuer: impl Into<String>) -> UserContextBuilder {
        UserContextBuilder {
            inner: UserContext {
                name: name.into(),
                issuer: issuer.into(),
                roles: BTreeSet::new(),
                is_admin: false,
                is_federated: false,
                identified: false,
                phi_eligible: false,
                session_type: SessionType::Research,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn roles(&self) -> &BTreeSet<String> {
        &self.roles
    }

    pub fn is_admin(&self) -> bool {
        self.is_admin
    }

    /// The request was relayed by a peer node rather than made by a local user.
    pub fn is_federated(&self) -> bool {
        self.is_federated
    }

    pub fn session_type(&self) -> SessionType {
        self.session_type
    }

    /// Identified, PHI-eligible sessions see counts without display noise.
    ///
    /// Low-cell masking applies to everyone regardless.
    pub fn sees_exact_counts(&self) -> bool {
        self.identified && self.phi_eligible
    }
}

pub struct UserContextBuilder {
    inner: UserContext,
}

impl UserContextBuilder {
    pub fn role(mut self, role: impl Into<String>) -> Self {
        self.inner.roles.insert(role.into());
        self
    }

    pub fn admin(mut self, is_admin: bool) -> Self {
        self.inner.is_admin = is_admin;
        self
    }

    pub fn federated(mut self, is_federated: bool) -> Self {
        self.inner.is_federated = is_federated;
        self
    }

    pub fn identified(mut self, identified: bool, phi_eligible: bool) -> Self {
        self.inner.identified = identified;
        self.inner.phi_eligible = phi_eligible;
        self
    }

    pub fn session_type(mut self, session_type: SessionType) -> Self {
        self.inner.session_type = session_type;
        self
    }

    pub fn build(self) -> UserContext {
        self.inner
    }
}
