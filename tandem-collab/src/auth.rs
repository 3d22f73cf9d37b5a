//! Auth collaborator boundary.
//!
//! Token verification belongs to the surrounding platform; the sync layer
//! only needs `verify_token(token) -> {user_id, permissions}`.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tandem_core::DocumentId;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("auth backend unavailable: {0}")]
    Unavailable(String),
}

/// Which documents a grant opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DocumentScope {
    All,
    Tenant { tenant: String },
    Documents { ids: Vec<DocumentId> },
}

impl DocumentScope {
    pub fn allows(&self, document_id: &DocumentId) -> bool {
        match self {
            DocumentScope::All => true,
            DocumentScope::Tenant { tenant } => document_id.tenant() == tenant,
            DocumentScope::Documents { ids } => ids.contains(document_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    pub scope: DocumentScope,
    #[serde(default)]
    pub read_only: bool,
}

impl Permissions {
    pub fn read_write(scope: DocumentScope) -> Self {
        Self {
            scope,
            read_only: false,
        }
    }

    pub fn read_only(scope: DocumentScope) -> Self {
        Self {
            scope,
            read_only: true,
        }
    }
}

/// Result of a successful token verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessGrant {
    pub user_id: String,
    /// Shown to other collaborators; falls back to `user_id`.
    #[serde(default)]
    pub display_name: Option<String>,
    pub permissions: Permissions,
}

impl AccessGrant {
    pub fn new(user_id: impl Into<String>, permissions: Permissions) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: None,
            permissions,
        }
    }

    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.user_id)
    }
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn verify_token(&self, token: &str) -> Result<AccessGrant, AuthError>;
}

/// Fixed token table, loaded from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, AccessGrant>,
}

impl StaticTokenAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, grant: AccessGrant) -> Self {
        self.tokens.insert(token.into(), grant);
        self
    }

    /// Parse a JSON object mapping token -> grant.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let tokens = serde_json::from_str(json)?;
        Ok(Self { tokens })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let json = std::fs::read_to_string(path)?;
        Ok(Self::from_json(&json)?)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn verify_token(&self, token: &str) -> Result<AccessGrant, AuthError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| AuthError::Unauthorized("unknown token".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(s: &str) -> DocumentId {
        s.parse().unwrap()
    }

    #[test]
    fn test_scope_allows() {
        assert!(DocumentScope::All.allows(&doc("acme/a")));

        let tenant = DocumentScope::Tenant {
            tenant: "acme".into(),
        };
        assert!(tenant.allows(&doc("acme/a")));
        assert!(!tenant.allows(&doc("globex/a")));

        let docs = DocumentScope::Documents {
            ids: vec![doc("acme/a")],
        };
        assert!(docs.allows(&doc("acme/a")));
        assert!(!docs.allows(&doc("acme/b")));
    }

    #[tokio::test]
    async fn test_static_tokens() {
        let auth = StaticTokenAuthenticator::new().with_token(
            "t-alice",
            AccessGrant::new("alice", Permissions::read_write(DocumentScope::All)),
        );

        let grant = auth.verify_token("t-alice").await.unwrap();
        assert_eq!(grant.user_id, "alice");
        assert_eq!(grant.display_name(), "alice");
        assert!(matches!(
            auth.verify_token("nope").await,
            Err(AuthError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_token_file_format() {
        let json = r#"{
            "t-alice": {
                "user_id": "alice",
                "display_name": "Alice",
                "permissions": { "scope": { "kind": "tenant", "tenant": "acme" } }
            },
            "t-viewer": {
                "user_id": "vic",
                "permissions": {
                    "scope": { "kind": "documents", "ids": [{ "tenant": "acme", "document": "doc1" }] },
                    "read_only": true
                }
            }
        }"#;
        let auth = StaticTokenAuthenticator::from_json(json).unwrap();
        assert_eq!(auth.len(), 2);

        let viewer = &auth.tokens["t-viewer"];
        assert!(viewer.permissions.read_only);
        assert!(viewer.permissions.scope.allows(&doc("acme/doc1")));
        assert_eq!(auth.tokens["t-alice"].display_name(), "Alice");
    }

    #[test]
    fn test_token_file_rejects_garbage() {
        assert!(StaticTokenAuthenticator::from_json("[1, 2]").is_err());
    }
}
