//! Service-to-service tokens carrying a delegated end-user identity.
//!
//! The service token family is signed with a key, issuer, and audience
//! independent from the user token family: compromising one family does not
//! grant forgery rights over the other. Every issued token names a real
//! registered end user, so downstream audit trails always have an
//! attributable identity even when the calling channel itself was not
//! credentialed.

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, error};
use uuid::Uuid;

use crate::auth::context::AuthenticationContext;
use crate::auth::registry::UserRegistry;
use crate::auth::CredentialError;
use crate::settings::{AuthenticationMode, MAX_SERVICE_TOKEN_MINUTES, ServiceTokenSettings};
use crate::types::{SessionId, SubjectId};

/// Value of the `token_use` marker claim on every service token.
pub const SERVICE_TOKEN_MARKER: &str = "service";

/// Claims embedded in a service token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceClaims {
    /// Delegated end-user GUID.
    pub sub: String,
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
    /// Marker identifying this as a service token.
    pub token_use: String,
    /// The authentication mode active on the calling channel at issuance, so
    /// downstream consumers can tell whether that channel was credentialed.
    pub auth_mode: String,
    /// The identity of the service acting on the user's behalf.
    pub svc: String,
    /// Optional session-correlation id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
}

/// A validated token kept for reuse until its remaining lifetime drops below
/// the configured refresh threshold.
#[derive(Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Issues and validates delegated-identity service tokens.
pub struct ServiceTokenIssuer {
    settings: ServiceTokenSettings,
    registry: Arc<UserRegistry>,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    /// Per-GUID cache of current tokens, proactively refreshed.
    cache: RwLock<HashMap<Uuid, CachedToken>>,
}

impl ServiceTokenIssuer {
    /// Build an issuer from validated settings and the shared registry.
    pub fn new(settings: ServiceTokenSettings, registry: Arc<UserRegistry>) -> Self {
        let encoding_key = EncodingKey::from_secret(settings.secret_key.as_bytes());
        let decoding_key = DecodingKey::from_secret(settings.secret_key.as_bytes());
        Self {
            settings,
            registry,
            encoding_key,
            decoding_key,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Mint a service token delegating `user_guid`.
    ///
    /// Fails if the GUID is nil, if the active mode is not allowed to mint
    /// service tokens, or if the GUID is not registered; delegated identity
    /// is never minted for unregistered principals. Expiration is bounded to
    /// at most one week regardless of configuration.
    pub fn issue_service_token(
        &self,
        user_guid: Uuid,
        mode: AuthenticationMode,
        session_id: Option<&SessionId>,
    ) -> Result<String, CredentialError> {
        if user_guid.is_nil() {
            return Err(CredentialError::InvalidUserGuid);
        }
        if !self.settings.allowed_modes.contains(&mode) {
            return Err(CredentialError::DisallowedMode { mode });
        }
        if !self.registry.is_registered(user_guid) {
            return Err(CredentialError::UnregisteredGuid(user_guid));
        }

        let minutes = self
            .settings
            .expiration_minutes
            .min(MAX_SERVICE_TOKEN_MINUTES);
        let now = Utc::now();
        let claims = ServiceClaims {
            sub: user_guid.to_string(),
            iss: self.settings.issuer.clone(),
            aud: self.settings.audience.clone(),
            iat: now.timestamp(),
            exp: (now + Duration::minutes(minutes)).timestamp(),
            token_use: SERVICE_TOKEN_MARKER.to_string(),
            auth_mode: mode.as_str().to_string(),
            svc: self.settings.service_identity.clone(),
            sid: session_id.map(|s| s.as_str().to_string()),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| CredentialError::Unexpected(e.to_string()))
    }

    /// Validate a service token. Returns `None` on any failure; nothing
    /// propagates across the trust boundary.
    ///
    /// After the signature/issuer/audience/lifetime checks pass, the embedded
    /// GUID is re-checked against the registry: deregistering a GUID
    /// invalidates all its outstanding tokens immediately, independent of
    /// their remaining lifetime.
    pub fn validate_service_token(&self, token: &str) -> Option<AuthenticationContext> {
        let claims = match self.decode_claims(token) {
            Ok(claims) => claims,
            Err(e) => {
                debug!(cause = %e, "service token rejected");
                return None;
            }
        };

        if claims.token_use != SERVICE_TOKEN_MARKER {
            debug!("token missing service marker claim");
            return None;
        }

        let user_guid = match Uuid::parse_str(&claims.sub) {
            Ok(guid) => guid,
            Err(e) => {
                error!(cause = %e, "service token subject is not a GUID");
                return None;
            }
        };

        let user = match self.registry.get(user_guid) {
            Some(user) => user,
            None => {
                debug!(user_guid = %user_guid, "delegated GUID no longer registered");
                return None;
            }
        };

        let mut ctx = AuthenticationContext::authenticated(
            SubjectId::new(claims.sub),
            user.display_name,
        )
        .with_claim("token_use", claims.token_use)
        .with_claim("auth_mode", claims.auth_mode)
        .with_claim("svc", claims.svc);

        if let Some(sid) = claims.sid {
            ctx = ctx.with_claim("sid", sid);
        }

        Some(ctx)
    }

    /// Payload-only read of the delegated subject, for audit logging.
    ///
    /// Performs no signature or registry checks and must never be used to
    /// authorize anything.
    pub fn extract_user_guid(&self, token: &str) -> Option<Uuid> {
        decode_payload_unverified(token).and_then(|claims| Uuid::parse_str(&claims.sub).ok())
    }

    /// Current token for a GUID, minting or proactively re-minting as needed.
    ///
    /// A cached token is reused until its remaining lifetime drops below the
    /// configured refresh threshold, trading a safety margin for amortized
    /// signing cost.
    pub async fn current_token_for(
        &self,
        user_guid: Uuid,
        mode: AuthenticationMode,
        session_id: Option<&SessionId>,
    ) -> Result<String, CredentialError> {
        let threshold = Duration::minutes(self.settings.cache_refresh_threshold_minutes);

        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(&user_guid)
                && entry.expires_at - Utc::now() > threshold
            {
                return Ok(entry.token.clone());
            }
        }

        let mut cache = self.cache.write().await;
        // Another task may have refreshed while we waited for the write lock.
        if let Some(entry) = cache.get(&user_guid)
            && entry.expires_at - Utc::now() > threshold
        {
            return Ok(entry.token.clone());
        }

        let token = self.issue_service_token(user_guid, mode, session_id)?;
        let minutes = self
            .settings
            .expiration_minutes
            .min(MAX_SERVICE_TOKEN_MINUTES);
        cache.insert(
            user_guid,
            CachedToken {
                token: token.clone(),
                expires_at: Utc::now() + Duration::minutes(minutes),
            },
        );

        Ok(token)
    }

    fn decode_claims(&self, token: &str) -> Result<ServiceClaims, jsonwebtoken::errors::Error> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&self.settings.issuer]);
        validation.set_audience(&[&self.settings.audience]);
        decode::<ServiceClaims>(token, &self.decoding_key, &validation).map(|data| data.claims)
    }
}

/// Read claims straight from the payload segment, skipping all verification.
/// Audit use only.
fn decode_payload_unverified(token: &str) -> Option<ServiceClaims> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload).ok()?;
    serde_json::from_slice(&bytes).ok()
}
