//! Per-operation authorization gate.
//!
//! Every protected operation consults the gate before running. A request
//! moves Unauthenticated → Authenticated → Authorized; any failed transition
//! terminates in Denied with a reason code. Authorization rules live in a
//! declarative policy table resolved at dispatch time, and the caller
//! identity is resolved exactly once and returned with the decision.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use http::HeaderMap;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::context::AuthenticationContext;
use crate::auth::jwks::DelegationVerifier;
use crate::auth::registry::UserRegistry;
use crate::auth::token_issuer::UserTokenIssuer;
use crate::settings::{
    AuthSettings, AuthenticationMode, ConfigurationError, GuidValidationSettings,
};
use crate::types::SubjectId;

/// Authorization rule for a single operation.
#[derive(Debug, Clone, Default)]
pub struct OperationPolicy {
    /// Anonymous-allowed operations skip authentication entirely.
    pub allow_anonymous: bool,
    /// The caller must hold any one of these roles (logical OR). Empty means
    /// authentication alone suffices.
    pub required_roles: Vec<String>,
}

impl OperationPolicy {
    /// Require authentication, no specific roles.
    pub fn authenticated() -> Self {
        Self::default()
    }

    /// Skip authentication entirely.
    pub fn anonymous() -> Self {
        Self {
            allow_anonymous: true,
            required_roles: Vec::new(),
        }
    }

    /// Require authentication plus any one of the given roles.
    pub fn any_role(roles: &[&str]) -> Self {
        Self {
            allow_anonymous: false,
            required_roles: roles.iter().map(|r| r.to_string()).collect(),
        }
    }
}

/// Declarative table of operation policies.
///
/// Operations without an explicit entry fall back to requiring
/// authentication with no role constraint.
#[derive(Debug, Clone, Default)]
pub struct PolicyTable {
    policies: HashMap<String, OperationPolicy>,
    fallback: OperationPolicy,
}

impl PolicyTable {
    /// Empty table: every operation requires authentication.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the policy for an operation.
    pub fn operation(mut self, name: impl Into<String>, policy: OperationPolicy) -> Self {
        self.policies.insert(name.into(), policy);
        self
    }

    /// Mark an operation anonymous-allowed.
    pub fn allow_anonymous(self, name: impl Into<String>) -> Self {
        self.operation(name, OperationPolicy::anonymous())
    }

    /// Require any one of the given roles for an operation.
    pub fn require_any_role(self, name: impl Into<String>, roles: &[&str]) -> Self {
        self.operation(name, OperationPolicy::any_role(roles))
    }

    /// Resolve the policy for an operation.
    pub fn policy_for(&self, operation: &str) -> &OperationPolicy {
        self.policies.get(operation).unwrap_or(&self.fallback)
    }
}

/// Why a request was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DenialReason {
    /// No credential (or correlation GUID) was presented.
    NoCredential,
    /// A credential was presented but failed validation.
    InvalidCredential,
    /// Authenticated, but holding none of the required roles.
    InsufficientRole,
}

/// Terminal denied outcome, serializable for the caller-facing payload.
#[derive(Debug, Clone)]
pub struct Denial {
    pub reason: DenialReason,
    pub message: String,
    pub operation: String,
    pub timestamp: DateTime<Utc>,
    /// Display name resolved before the denial, when authentication
    /// succeeded. Carried for audit logging; never part of the payload.
    pub caller: Option<String>,
    /// Roles resolved before the denial.
    pub roles: BTreeSet<String>,
}

impl Denial {
    /// Record the identity that was resolved before this denial.
    fn attributed(mut self, ctx: &AuthenticationContext) -> Self {
        self.caller = Some(ctx.display());
        self.roles = ctx.roles().clone();
        self
    }

    /// 401 for unauthenticated, 403 for authenticated-but-unauthorized.
    pub fn status_code(&self) -> u16 {
        match self.reason {
            DenialReason::InsufficientRole => 403,
            DenialReason::NoCredential | DenialReason::InvalidCredential => 401,
        }
    }

    /// Caller-visible denial payload.
    pub fn payload(&self) -> serde_json::Value {
        serde_json::json!({
            "error": {
                "code": self.status_code(),
                "message": self.message,
                "operation": self.operation,
                "timestamp": self.timestamp.to_rfc3339(),
            }
        })
    }
}

/// Outcome of a gate evaluation.
#[derive(Debug)]
pub enum AccessDecision {
    Authorized(AuthenticationContext),
    Denied(Denial),
}

impl AccessDecision {
    /// Whether the operation may proceed.
    pub fn is_authorized(&self) -> bool {
        matches!(self, Self::Authorized(_))
    }

    /// The resolved caller context, when authorized.
    pub fn context(&self) -> Option<&AuthenticationContext> {
        match self {
            Self::Authorized(ctx) => Some(ctx),
            Self::Denied(_) => None,
        }
    }

    /// The denial, when denied.
    pub fn denial(&self) -> Option<&Denial> {
        match self {
            Self::Authorized(_) => None,
            Self::Denied(denial) => Some(denial),
        }
    }
}

/// Credential material extracted from one inbound request.
///
/// The GUID channels are ordered: an explicit parameter wins over the
/// configured header, which wins over the query-string parameter.
#[derive(Debug, Default)]
pub struct GateRequest<'a> {
    bearer_token: Option<&'a str>,
    user_guid: Option<Uuid>,
    headers: Option<&'a HeaderMap>,
    query: Option<&'a str>,
}

impl<'a> GateRequest<'a> {
    /// An empty request carrying no credential material.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a bearer token (already stripped of the `Bearer ` prefix).
    pub fn with_bearer_token(mut self, token: &'a str) -> Self {
        self.bearer_token = Some(token);
        self
    }

    /// Attach an explicitly passed user GUID.
    pub fn with_user_guid(mut self, guid: Uuid) -> Self {
        self.user_guid = Some(guid);
        self
    }

    /// Attach the request headers (for `Authorization` and the GUID header).
    pub fn with_headers(mut self, headers: &'a HeaderMap) -> Self {
        self.headers = Some(headers);
        self
    }

    /// Attach the raw query string (for the GUID query-parameter fallback).
    pub fn with_query(mut self, query: &'a str) -> Self {
        self.query = Some(query);
        self
    }
}

/// The per-operation decision function combining authentication state, role
/// requirements, and (in Disabled mode) GUID presence and format.
pub struct AuthorizationGate {
    mode: AuthenticationMode,
    guid_settings: GuidValidationSettings,
    guid_pattern: Option<Regex>,
    user_tokens: Arc<dyn UserTokenIssuer>,
    registry: Arc<UserRegistry>,
    delegation: Option<DelegationVerifier>,
    policies: PolicyTable,
}

impl AuthorizationGate {
    /// Build the gate from validated settings and the shared components.
    ///
    /// `delegation` must be supplied when the mode is
    /// ExternalIdentityDelegation; the settings validation guarantees the
    /// sub-settings needed to construct one.
    pub fn new(
        settings: &AuthSettings,
        user_tokens: Arc<dyn UserTokenIssuer>,
        registry: Arc<UserRegistry>,
        delegation: Option<DelegationVerifier>,
        policies: PolicyTable,
    ) -> Result<Self, ConfigurationError> {
        let guid_pattern = if settings.guid_validation.enabled {
            Some(Regex::new(&settings.guid_validation.pattern).map_err(|e| {
                ConfigurationError::InvalidPattern {
                    field: "guidValidation.pattern",
                    message: e.to_string(),
                }
            })?)
        } else {
            None
        };

        Ok(Self {
            mode: settings.mode,
            guid_settings: settings.guid_validation.clone(),
            guid_pattern,
            user_tokens,
            registry,
            delegation,
            policies,
        })
    }

    /// Evaluate one operation invocation.
    ///
    /// Never panics and never returns an error: every failure collapses into
    /// a structured denial. Every decision, allow or deny, is logged.
    pub async fn authorize(&self, operation: &str, request: &GateRequest<'_>) -> AccessDecision {
        let policy = self.policies.policy_for(operation);
        let raw_guid = self.resolve_raw_guid(request);

        let outcome = if policy.allow_anonymous {
            let mut ctx = AuthenticationContext::anonymous();
            if let Some(guid) = raw_guid.as_deref().and_then(|s| Uuid::parse_str(s).ok()) {
                ctx = ctx.with_correlation_guid(guid);
            }
            Ok(ctx)
        } else {
            match self.authenticate(operation, request, raw_guid.as_deref()).await {
                Ok(ctx) => self.check_roles(operation, policy, ctx),
                Err(denial) => Err(denial),
            }
        };

        match outcome {
            Ok(ctx) => {
                info!(
                    operation,
                    caller = %ctx.display(),
                    roles = ?ctx.roles(),
                    outcome = "authorized",
                    "authorization decision"
                );
                AccessDecision::Authorized(ctx)
            }
            Err(denial) => {
                info!(
                    operation,
                    caller = denial.caller.as_deref().unwrap_or("-"),
                    roles = ?denial.roles,
                    reason = ?denial.reason,
                    outcome = "denied",
                    "authorization decision"
                );
                AccessDecision::Denied(denial)
            }
        }
    }

    /// Resolve identity for the active mode. Exactly one credential path is
    /// consulted; there is no fallback chaining between modes.
    async fn authenticate(
        &self,
        operation: &str,
        request: &GateRequest<'_>,
        raw_guid: Option<&str>,
    ) -> Result<AuthenticationContext, Denial> {
        match self.mode {
            AuthenticationMode::Disabled => self.authenticate_by_guid(operation, raw_guid),
            AuthenticationMode::BearerToken => {
                let token = self.resolve_bearer(request).ok_or_else(|| {
                    self.deny(operation, DenialReason::NoCredential, "authentication required")
                })?;
                let ctx = self.user_tokens.validate(token).map_err(|e| {
                    debug!(cause = %e, "bearer token rejected at gate");
                    self.deny(
                        operation,
                        DenialReason::InvalidCredential,
                        "invalid or expired credentials",
                    )
                })?;
                Ok(self.attach_correlation(ctx, raw_guid))
            }
            AuthenticationMode::ExternalIdentityDelegation => {
                let token = self.resolve_bearer(request).ok_or_else(|| {
                    self.deny(operation, DenialReason::NoCredential, "authentication required")
                })?;
                let verifier = self.delegation.as_ref().ok_or_else(|| {
                    warn!("delegation mode active but no verifier configured");
                    self.deny(
                        operation,
                        DenialReason::InvalidCredential,
                        "invalid or expired credentials",
                    )
                })?;
                let ctx = verifier.verify(token).await.map_err(|e| {
                    debug!(cause = %e, "delegated token rejected at gate");
                    self.deny(
                        operation,
                        DenialReason::InvalidCredential,
                        "invalid or expired credentials",
                    )
                })?;
                Ok(self.attach_correlation(ctx, raw_guid))
            }
        }
    }

    /// Disabled-mode path: the correlation GUID is mandatory and must name a
    /// registered pseudo-identity. Unlike the credentialed paths, failure
    /// messages here are specific and name the remediation.
    fn authenticate_by_guid(
        &self,
        operation: &str,
        raw_guid: Option<&str>,
    ) -> Result<AuthenticationContext, Denial> {
        let raw = raw_guid.ok_or_else(|| {
            self.deny(
                operation,
                DenialReason::NoCredential,
                self.guid_remediation("a user GUID is required in Disabled mode"),
            )
        })?;

        if let Some(pattern) = &self.guid_pattern
            && !pattern.is_match(raw)
        {
            return Err(self.deny(
                operation,
                DenialReason::InvalidCredential,
                self.guid_remediation("the supplied user GUID is malformed"),
            ));
        }

        let guid = Uuid::parse_str(raw).map_err(|_| {
            self.deny(
                operation,
                DenialReason::InvalidCredential,
                self.guid_remediation("the supplied user GUID is malformed"),
            )
        })?;

        let user = self.registry.get(guid).ok_or_else(|| {
            self.deny(
                operation,
                DenialReason::InvalidCredential,
                "the supplied user GUID is not registered",
            )
        })?;

        Ok(
            AuthenticationContext::authenticated(
                SubjectId::new(guid.to_string()),
                user.display_name,
            )
            .with_correlation_guid(guid),
        )
    }

    /// Any-of role check; an empty requirement list passes.
    fn check_roles(
        &self,
        operation: &str,
        policy: &OperationPolicy,
        ctx: AuthenticationContext,
    ) -> Result<AuthenticationContext, Denial> {
        if policy.required_roles.is_empty()
            || ctx.has_any_role(policy.required_roles.iter().map(String::as_str))
        {
            Ok(ctx)
        } else {
            // The caller was fully resolved before this point; keep that
            // attribution on the denial for the decision log.
            Err(self
                .deny(
                    operation,
                    DenialReason::InsufficientRole,
                    "insufficient role for this operation",
                )
                .attributed(&ctx))
        }
    }

    /// Bearer token: explicit field first, then the `Authorization` header.
    fn resolve_bearer<'r>(&self, request: &GateRequest<'r>) -> Option<&'r str> {
        if let Some(token) = request.bearer_token {
            return Some(token);
        }
        request
            .headers
            .and_then(|headers| headers.get(http::header::AUTHORIZATION))
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
    }

    /// Correlation GUID: explicit parameter, then the configured header,
    /// then the query-string parameter.
    fn resolve_raw_guid(&self, request: &GateRequest<'_>) -> Option<String> {
        if let Some(guid) = request.user_guid {
            return Some(guid.to_string());
        }

        if let Some(headers) = request.headers
            && let Some(value) = headers.get(self.guid_settings.header_name.as_str())
            && let Ok(value) = value.to_str()
        {
            return Some(value.to_string());
        }

        if let Some(query) = request.query {
            for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
                if key == self.guid_settings.query_parameter.as_str() {
                    return Some(value.into_owned());
                }
            }
        }

        None
    }

    /// In credentialed modes the GUID is attached for tracing only and never
    /// grants or denies access.
    fn attach_correlation(
        &self,
        ctx: AuthenticationContext,
        raw_guid: Option<&str>,
    ) -> AuthenticationContext {
        match raw_guid.and_then(|raw| Uuid::parse_str(raw).ok()) {
            Some(guid) => ctx.with_correlation_guid(guid),
            None => ctx,
        }
    }

    fn deny(
        &self,
        operation: &str,
        reason: DenialReason,
        message: impl Into<String>,
    ) -> Denial {
        Denial {
            reason,
            message: message.into(),
            operation: operation.to_string(),
            timestamp: Utc::now(),
            caller: None,
            roles: BTreeSet::new(),
        }
    }

    fn guid_remediation(&self, prefix: &str) -> String {
        format!(
            "{}: supply it as an explicit parameter, the '{}' header, or the '{}' query \
             parameter, formatted as a GUID (e.g. 123e4567-e89b-12d3-a456-426614174000)",
            prefix, self.guid_settings.header_name, self.guid_settings.query_parameter
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::token_issuer::{JwtTokenIssuer, user_token_issuer};
    use crate::settings::{ServiceTokenSettings, UserTokenSettings};
    use http::HeaderValue;

    fn user_settings() -> UserTokenSettings {
        UserTokenSettings {
            secret_key: "user-secret-0123456789abcdef0123456789abcdef".to_string(),
            ..Default::default()
        }
    }

    fn settings_for(mode: AuthenticationMode) -> AuthSettings {
        AuthSettings {
            mode,
            user_tokens: user_settings(),
            service_tokens: ServiceTokenSettings {
                secret_key: "svc-secret-0123456789abcdef0123456789abcdef".to_string(),
                ..Default::default()
            },
            guid_validation: GuidValidationSettings::default(),
            delegation: None,
        }
    }

    fn gate_for(
        mode: AuthenticationMode,
        registry: Arc<UserRegistry>,
        policies: PolicyTable,
    ) -> AuthorizationGate {
        let settings = settings_for(mode);
        let user_tokens = user_token_issuer(&settings);
        AuthorizationGate::new(&settings, user_tokens, registry, None, policies).unwrap()
    }

    fn registered(registry: &UserRegistry) -> Uuid {
        let guid = Uuid::new_v4();
        registry.register(guid, Some("Dev User"), None, AuthenticationMode::Disabled);
        guid
    }

    #[tokio::test]
    async fn test_anonymous_operation_skips_authentication() {
        let gate = gate_for(
            AuthenticationMode::BearerToken,
            Arc::new(UserRegistry::new()),
            PolicyTable::new().allow_anonymous("health"),
        );

        let decision = gate.authorize("health", &GateRequest::new()).await;
        let ctx = decision.context().unwrap();
        assert!(!ctx.is_authenticated());
    }

    #[tokio::test]
    async fn test_bearer_mode_requires_token() {
        let gate = gate_for(
            AuthenticationMode::BearerToken,
            Arc::new(UserRegistry::new()),
            PolicyTable::new(),
        );

        let decision = gate.authorize("orders.read", &GateRequest::new()).await;
        let denial = decision.denial().unwrap();
        assert_eq!(denial.reason, DenialReason::NoCredential);
        assert_eq!(denial.status_code(), 401);
        assert_eq!(denial.operation, "orders.read");
    }

    #[tokio::test]
    async fn test_bearer_mode_valid_token_authorizes() {
        let issuer = JwtTokenIssuer::new(user_settings());
        let token = issuer
            .issue_access_token(
                &SubjectId::new("user-1"),
                Some("Ada"),
                &["sales".to_string()],
                &Default::default(),
            )
            .unwrap();

        let gate = gate_for(
            AuthenticationMode::BearerToken,
            Arc::new(UserRegistry::new()),
            PolicyTable::new().require_any_role("orders.read", &["sales", "admin"]),
        );

        let request = GateRequest::new().with_bearer_token(&token);
        let decision = gate.authorize("orders.read", &request).await;
        let ctx = decision.context().unwrap();
        assert_eq!(ctx.subject_id().as_str(), "user-1");
        assert!(ctx.has_role("sales"));
    }

    #[tokio::test]
    async fn test_bearer_token_from_authorization_header() {
        let issuer = JwtTokenIssuer::new(user_settings());
        let token = issuer
            .issue_access_token(&SubjectId::new("user-1"), None, &[], &Default::default())
            .unwrap();

        let gate = gate_for(
            AuthenticationMode::BearerToken,
            Arc::new(UserRegistry::new()),
            PolicyTable::new(),
        );

        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
        );
        let request = GateRequest::new().with_headers(&headers);
        assert!(gate.authorize("orders.read", &request).await.is_authorized());
    }

    #[tokio::test]
    async fn test_invalid_token_denied_with_generic_message() {
        let gate = gate_for(
            AuthenticationMode::BearerToken,
            Arc::new(UserRegistry::new()),
            PolicyTable::new(),
        );

        let request = GateRequest::new().with_bearer_token("forged.token.value");
        let decision = gate.authorize("orders.read", &request).await;
        let denial = decision.denial().unwrap();
        assert_eq!(denial.reason, DenialReason::InvalidCredential);
        // Non-disclosure: the message never says why the credential failed.
        assert_eq!(denial.message, "invalid or expired credentials");
    }

    #[tokio::test]
    async fn test_insufficient_role_is_403() {
        let issuer = JwtTokenIssuer::new(user_settings());
        let token = issuer
            .issue_access_token(
                &SubjectId::new("user-1"),
                None,
                &["support".to_string()],
                &Default::default(),
            )
            .unwrap();

        let gate = gate_for(
            AuthenticationMode::BearerToken,
            Arc::new(UserRegistry::new()),
            PolicyTable::new().require_any_role("admin.reset", &["admin"]),
        );

        let request = GateRequest::new().with_bearer_token(&token);
        let decision = gate.authorize("admin.reset", &request).await;
        let denial = decision.denial().unwrap();
        assert_eq!(denial.reason, DenialReason::InsufficientRole);
        assert_eq!(denial.status_code(), 403);
    }

    #[tokio::test]
    async fn test_denied_decision_keeps_resolved_attribution() {
        let issuer = JwtTokenIssuer::new(user_settings());
        let token = issuer
            .issue_access_token(
                &SubjectId::new("user-1"),
                Some("Ada"),
                &["support".to_string()],
                &Default::default(),
            )
            .unwrap();

        let gate = gate_for(
            AuthenticationMode::BearerToken,
            Arc::new(UserRegistry::new()),
            PolicyTable::new().require_any_role("admin.reset", &["admin"]),
        );

        // The identity resolved before the role check stays on the denial,
        // so the decision log carries the caller and role set.
        let request = GateRequest::new().with_bearer_token(&token);
        let decision = gate.authorize("admin.reset", &request).await;
        let denial = decision.denial().unwrap();
        assert_eq!(denial.caller.as_deref(), Some("Ada"));
        assert!(denial.roles.contains("support"));

        // Unauthenticated denials have no attribution to carry.
        let decision = gate.authorize("admin.reset", &GateRequest::new()).await;
        let denial = decision.denial().unwrap();
        assert!(denial.caller.is_none());
        assert!(denial.roles.is_empty());
    }

    #[tokio::test]
    async fn test_any_one_role_suffices() {
        let issuer = JwtTokenIssuer::new(user_settings());
        let token = issuer
            .issue_access_token(
                &SubjectId::new("user-1"),
                None,
                &["support".to_string()],
                &Default::default(),
            )
            .unwrap();

        let gate = gate_for(
            AuthenticationMode::BearerToken,
            Arc::new(UserRegistry::new()),
            PolicyTable::new().require_any_role("tickets.read", &["admin", "support"]),
        );

        let request = GateRequest::new().with_bearer_token(&token);
        assert!(gate.authorize("tickets.read", &request).await.is_authorized());
    }

    #[tokio::test]
    async fn test_disabled_mode_missing_guid() {
        let gate = gate_for(
            AuthenticationMode::Disabled,
            Arc::new(UserRegistry::new()),
            PolicyTable::new(),
        );

        let decision = gate.authorize("orders.read", &GateRequest::new()).await;
        let denial = decision.denial().unwrap();
        assert_eq!(denial.reason, DenialReason::NoCredential);
        // Remediation names both side channels and the expected format.
        assert!(denial.message.contains("X-User-Guid"));
        assert!(denial.message.contains("userGuid"));
        assert!(denial.message.contains("formatted as a GUID"));
    }

    #[tokio::test]
    async fn test_disabled_mode_malformed_guid() {
        let gate = gate_for(
            AuthenticationMode::Disabled,
            Arc::new(UserRegistry::new()),
            PolicyTable::new(),
        );

        let mut headers = HeaderMap::new();
        headers.insert("X-User-Guid", HeaderValue::from_static("not-a-guid"));
        let request = GateRequest::new().with_headers(&headers);
        let decision = gate.authorize("orders.read", &request).await;
        let denial = decision.denial().unwrap();
        assert_eq!(denial.reason, DenialReason::InvalidCredential);
        assert!(denial.message.contains("malformed"));
        assert!(denial.message.contains("formatted as a GUID"));
    }

    #[tokio::test]
    async fn test_disabled_mode_unregistered_guid_denied() {
        // Well-formed but unregistered: denied even though the role check
        // alone would have passed.
        let gate = gate_for(
            AuthenticationMode::Disabled,
            Arc::new(UserRegistry::new()),
            PolicyTable::new(),
        );

        let request = GateRequest::new().with_user_guid(Uuid::new_v4());
        let decision = gate.authorize("orders.read", &request).await;
        let denial = decision.denial().unwrap();
        assert_eq!(denial.reason, DenialReason::InvalidCredential);
        assert!(denial.message.contains("not registered"));
    }

    #[tokio::test]
    async fn test_disabled_mode_registered_guid_authorizes() {
        let registry = Arc::new(UserRegistry::new());
        let guid = registered(&registry);
        let gate = gate_for(AuthenticationMode::Disabled, registry, PolicyTable::new());

        let request = GateRequest::new().with_user_guid(guid);
        let decision = gate.authorize("orders.read", &request).await;
        let ctx = decision.context().unwrap();
        assert!(ctx.is_authenticated());
        assert_eq!(ctx.subject_id().as_str(), guid.to_string());
        assert_eq!(ctx.display_name(), Some("Dev User"));
        assert_eq!(ctx.correlation_guid(), Some(guid));
    }

    #[tokio::test]
    async fn test_disabled_mode_guid_channel_order() {
        let registry = Arc::new(UserRegistry::new());
        let header_guid = registered(&registry);
        let query_guid = registered(&registry);
        let gate = gate_for(AuthenticationMode::Disabled, registry, PolicyTable::new());

        // Header wins over query.
        let mut headers = HeaderMap::new();
        headers.insert(
            "X-User-Guid",
            HeaderValue::from_str(&header_guid.to_string()).unwrap(),
        );
        let query = format!("userGuid={}", query_guid);
        let request = GateRequest::new().with_headers(&headers).with_query(&query);
        let decision = gate.authorize("orders.read", &request).await;
        assert_eq!(
            decision.context().unwrap().subject_id().as_str(),
            header_guid.to_string()
        );

        // Query alone works as the fallback channel.
        let request = GateRequest::new().with_query(&query);
        let decision = gate.authorize("orders.read", &request).await;
        assert_eq!(
            decision.context().unwrap().subject_id().as_str(),
            query_guid.to_string()
        );
    }

    #[tokio::test]
    async fn test_correlation_guid_optional_in_bearer_mode() {
        let issuer = JwtTokenIssuer::new(user_settings());
        let token = issuer
            .issue_access_token(&SubjectId::new("user-1"), None, &[], &Default::default())
            .unwrap();

        let gate = gate_for(
            AuthenticationMode::BearerToken,
            Arc::new(UserRegistry::new()),
            PolicyTable::new(),
        );

        // Unregistered, even malformed-channel GUIDs never deny here.
        let guid = Uuid::new_v4();
        let request = GateRequest::new()
            .with_bearer_token(&token)
            .with_user_guid(guid);
        let decision = gate.authorize("orders.read", &request).await;
        let ctx = decision.context().unwrap();
        assert_eq!(ctx.correlation_guid(), Some(guid));

        let request = GateRequest::new().with_bearer_token(&token);
        assert!(gate.authorize("orders.read", &request).await.is_authorized());
    }

    #[tokio::test]
    async fn test_denial_payload_shape() {
        let gate = gate_for(
            AuthenticationMode::BearerToken,
            Arc::new(UserRegistry::new()),
            PolicyTable::new(),
        );

        let decision = gate.authorize("orders.read", &GateRequest::new()).await;
        let payload = decision.denial().unwrap().payload();
        let error = &payload["error"];
        assert_eq!(error["code"], 401);
        assert_eq!(error["operation"], "orders.read");
        assert!(error["message"].is_string());
        assert!(error["timestamp"].is_string());
    }

    #[test]
    fn test_policy_table_fallback_requires_auth() {
        let table = PolicyTable::new().allow_anonymous("health");
        assert!(table.policy_for("health").allow_anonymous);

        let fallback = table.policy_for("anything.else");
        assert!(!fallback.allow_anonymous);
        assert!(fallback.required_roles.is_empty());
    }
}
