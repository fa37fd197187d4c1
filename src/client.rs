//! Outbound credential decoration for downstream business-data calls.
//!
//! Whatever user authentication mode is active, downstream calls carry a
//! service token. The decorator resolves a cached token for the delegated
//! user and attaches it; it performs no I/O of its own beyond what the
//! issuer's cache refresh requires.

use std::sync::Arc;

use uuid::Uuid;

use crate::auth::{CredentialError, ServiceTokenIssuer};
use crate::settings::{AuthSettings, AuthenticationMode};
use crate::types::SessionId;

/// Attaches service credentials to outbound requests.
pub struct CredentialDecorator {
    issuer: Arc<ServiceTokenIssuer>,
    mode: AuthenticationMode,
    guid_header: String,
}

impl CredentialDecorator {
    pub fn new(issuer: Arc<ServiceTokenIssuer>, settings: &AuthSettings) -> Self {
        Self {
            issuer,
            mode: settings.mode,
            guid_header: settings.guid_validation.header_name.clone(),
        }
    }

    /// Attach a service token for the delegated user as a bearer credential.
    ///
    /// In Disabled mode the user GUID is additionally forwarded in the
    /// correlation header so the downstream service can attribute the call
    /// without parsing the token.
    pub async fn decorate(
        &self,
        request: reqwest::RequestBuilder,
        user_guid: Uuid,
        session_id: Option<&SessionId>,
    ) -> Result<reqwest::RequestBuilder, CredentialError> {
        let token = self
            .issuer
            .current_token_for(user_guid, self.mode, session_id)
            .await?;

        let mut request = request.bearer_auth(token);
        if self.mode == AuthenticationMode::Disabled {
            request = request.header(self.guid_header.as_str(), user_guid.to_string());
        }
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::UserRegistry;
    use crate::settings::{GuidValidationSettings, ServiceTokenSettings, UserTokenSettings};

    fn settings_for(mode: AuthenticationMode) -> AuthSettings {
        AuthSettings {
            mode,
            user_tokens: UserTokenSettings::default(),
            service_tokens: ServiceTokenSettings {
                secret_key: "svc-secret-0123456789abcdef0123456789abcdef".to_string(),
                ..Default::default()
            },
            guid_validation: GuidValidationSettings::default(),
            delegation: None,
        }
    }

    fn decorator_for(mode: AuthenticationMode) -> (CredentialDecorator, Uuid) {
        let settings = settings_for(mode);
        let registry = Arc::new(UserRegistry::new());
        let guid = Uuid::new_v4();
        registry.register(guid, Some("Dev User"), None, mode);
        let issuer = Arc::new(ServiceTokenIssuer::new(
            settings.service_tokens.clone(),
            registry,
        ));
        (CredentialDecorator::new(issuer, &settings), guid)
    }

    #[tokio::test]
    async fn test_attaches_bearer_service_token() {
        let (decorator, guid) = decorator_for(AuthenticationMode::BearerToken);
        let client = reqwest::Client::new();

        let request = decorator
            .decorate(client.get("http://localhost/api/orders"), guid, None)
            .await
            .unwrap()
            .build()
            .unwrap();

        let auth = request
            .headers()
            .get(http::header::AUTHORIZATION)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(auth.starts_with("Bearer "));
        // No correlation header outside Disabled mode.
        assert!(request.headers().get("X-User-Guid").is_none());
    }

    #[tokio::test]
    async fn test_disabled_mode_forwards_correlation_header() {
        let (decorator, guid) = decorator_for(AuthenticationMode::Disabled);
        let client = reqwest::Client::new();

        let request = decorator
            .decorate(client.get("http://localhost/api/orders"), guid, None)
            .await
            .unwrap()
            .build()
            .unwrap();

        assert_eq!(
            request.headers().get("X-User-Guid").unwrap().to_str().unwrap(),
            guid.to_string()
        );
    }

    #[tokio::test]
    async fn test_unregistered_user_fails() {
        let (decorator, _) = decorator_for(AuthenticationMode::BearerToken);
        let client = reqwest::Client::new();

        let err = decorator
            .decorate(client.get("http://localhost/api/orders"), Uuid::new_v4(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CredentialError::UnregisteredGuid(_)));
    }
}
