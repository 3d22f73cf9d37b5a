//! Stable document identity: tenant + document.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Errors produced when parsing or building a [`DocumentId`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    #[error("tenant must be non-empty and must not contain '/': {0:?}")]
    InvalidTenant(String),
    #[error("document name must be non-empty: {0:?}")]
    InvalidDocument(String),
    #[error("expected `<tenant>/<document>`, got {0:?}")]
    MissingSeparator(String),
}

/// Identifies one collaborative document inside one tenant.
///
/// The textual form is `<tenant>/<document>`. The tenant never contains a
/// slash; the document part may (e.g. `acme/deals/q3-memo`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentId {
    tenant: String,
    document: String,
}

impl DocumentId {
    pub fn new(tenant: impl Into<String>, document: impl Into<String>) -> Result<Self, IdError> {
        let tenant = tenant.into();
        let document = document.into();
        if tenant.is_empty() || tenant.contains('/') {
            return Err(IdError::InvalidTenant(tenant));
        }
        if document.is_empty() {
            return Err(IdError::InvalidDocument(document));
        }
        Ok(Self { tenant, document })
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn document(&self) -> &str {
        &self.document
    }

    /// Key used by persistence adapters (`<tenant>/<document>` as UTF-8).
    pub fn storage_key(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant, self.document)
    }
}

impl FromStr for DocumentId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (tenant, document) = s
            .split_once('/')
            .ok_or_else(|| IdError::MissingSeparator(s.to_string()))?;
        Self::new(tenant, document)
    }
}
