//! Authentication context for request-scoped identity.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::SubjectId;

/// Claim key used to carry the correlation GUID attached for tracing.
pub const CORRELATION_CLAIM: &str = "correlation_guid";

/// Identity resolved for a single request.
///
/// This struct is threaded through the call chain to provide caller identity
/// for all operations. It is built fresh per request, never persisted, and
/// immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticationContext {
    /// Token subject, or the registered GUID in Disabled mode.
    subject_id: SubjectId,
    /// Optional display name for audit logging.
    display_name: Option<String>,
    /// Whether a credential (or a registered GUID) backed this identity.
    is_authenticated: bool,
    /// Roles granted to the caller.
    roles: BTreeSet<String>,
    /// Additional claims; multi-valued per key.
    claims: BTreeMap<String, Vec<String>>,
}

impl AuthenticationContext {
    /// Create an authenticated context.
    pub fn authenticated(subject_id: SubjectId, display_name: Option<String>) -> Self {
        Self {
            subject_id,
            display_name,
            is_authenticated: true,
            roles: BTreeSet::new(),
            claims: BTreeMap::new(),
        }
    }

    /// Create an unauthenticated context for anonymous-allowed operations.
    pub fn anonymous() -> Self {
        Self {
            subject_id: SubjectId::new("anonymous"),
            display_name: None,
            is_authenticated: false,
            roles: BTreeSet::new(),
            claims: BTreeMap::new(),
        }
    }

    /// Attach roles.
    pub fn with_roles(mut self, roles: impl IntoIterator<Item = String>) -> Self {
        self.roles.extend(roles);
        self
    }

    /// Append a claim value. Claims are multi-valued; repeated keys accumulate.
    pub fn with_claim(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.claims.entry(key.into()).or_default().push(value.into());
        self
    }

    /// Attach a correlation GUID for tracing. Never affects authorization.
    pub fn with_correlation_guid(self, guid: Uuid) -> Self {
        self.with_claim(CORRELATION_CLAIM, guid.to_string())
    }

    /// Get the subject identity.
    pub fn subject_id(&self) -> &SubjectId {
        &self.subject_id
    }

    /// Get the display name if available.
    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    /// Whether this context is backed by a validated credential.
    pub fn is_authenticated(&self) -> bool {
        self.is_authenticated
    }

    /// Granted roles.
    pub fn roles(&self) -> &BTreeSet<String> {
        &self.roles
    }

    /// Whether the caller holds a specific role.
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    /// Whether the caller holds any one of the given roles.
    pub fn has_any_role<'a>(&self, roles: impl IntoIterator<Item = &'a str>) -> bool {
        roles.into_iter().any(|r| self.roles.contains(r))
    }

    /// All values recorded for a claim key.
    pub fn claim_values(&self, key: &str) -> &[String] {
        self.claims.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// First value recorded for a claim key.
    pub fn claim(&self, key: &str) -> Option<&str> {
        self.claims.get(key).and_then(|v| v.first()).map(String::as_str)
    }

    /// The correlation GUID, when one was attached.
    pub fn correlation_guid(&self) -> Option<Uuid> {
        self.claim(CORRELATION_CLAIM)
            .and_then(|s| Uuid::parse_str(s).ok())
    }

    /// Get a display-friendly name for this caller.
    pub fn display(&self) -> String {
        if let Some(name) = &self.display_name {
            name.clone()
        } else if !self.is_authenticated {
            "Anonymous".to_string()
        } else {
            self.subject_id.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authenticated_context() {
        let ctx = AuthenticationContext::authenticated(
            SubjectId::new("user-1"),
            Some("Ada".to_string()),
        )
        .with_roles(["sales".to_string(), "support".to_string()]);

        assert!(ctx.is_authenticated());
        assert_eq!(ctx.subject_id().as_str(), "user-1");
        assert_eq!(ctx.display(), "Ada");
        assert!(ctx.has_role("sales"));
        assert!(!ctx.has_role("admin"));
        assert!(ctx.has_any_role(["admin", "support"]));
        assert!(!ctx.has_any_role(["admin", "auditor"]));
    }

    #[test]
    fn test_anonymous_context() {
        let ctx = AuthenticationContext::anonymous();
        assert!(!ctx.is_authenticated());
        assert_eq!(ctx.display(), "Anonymous");
        assert!(ctx.roles().is_empty());
    }

    #[test]
    fn test_claims_are_multi_valued() {
        let ctx = AuthenticationContext::authenticated(SubjectId::new("u"), None)
            .with_claim("scope", "orders")
            .with_claim("scope", "customers");

        assert_eq!(ctx.claim_values("scope"), ["orders", "customers"]);
        assert_eq!(ctx.claim("scope"), Some("orders"));
        assert_eq!(ctx.claim("missing"), None);
        assert!(ctx.claim_values("missing").is_empty());
    }

    #[test]
    fn test_correlation_guid_round_trip() {
        let guid = Uuid::new_v4();
        let ctx = AuthenticationContext::authenticated(SubjectId::new("u"), None)
            .with_correlation_guid(guid);

        assert_eq!(ctx.correlation_guid(), Some(guid));
        assert_eq!(ctx.claim(CORRELATION_CLAIM), Some(guid.to_string().as_str()));
    }

    #[test]
    fn test_display_falls_back_to_subject() {
        let ctx = AuthenticationContext::authenticated(SubjectId::new("sub-9"), None);
        assert_eq!(ctx.display(), "sub-9");
    }
}
