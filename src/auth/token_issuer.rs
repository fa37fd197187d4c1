//! User-facing token issuance and validation.
//!
//! Two implementations of [`UserTokenIssuer`] exist and exactly one is
//! selected at startup from the authentication mode: [`JwtTokenIssuer`] for
//! credentialed modes, and [`DisabledTokenIssuer`] for Disabled mode. The
//! stub fails loudly on every operation so code paths expecting a real token
//! can never silently succeed with no credential.

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{Duration, Utc};
use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::auth::context::AuthenticationContext;
use crate::auth::CredentialError;
use crate::settings::{AuthSettings, AuthenticationMode, UserTokenSettings};
use crate::types::SubjectId;

/// Entropy carried by a refresh token, in bytes.
pub const REFRESH_TOKEN_BYTES: usize = 32;

/// Claims embedded in a user access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserClaims {
    pub sub: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
    /// Arbitrary extra claims supplied at issuance.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Mints and validates user-facing access and refresh tokens.
pub trait UserTokenIssuer: Send + Sync {
    /// Produce a signed, time-bounded access token embedding subject, roles,
    /// and arbitrary extra claims.
    fn issue_access_token(
        &self,
        subject: &SubjectId,
        display_name: Option<&str>,
        roles: &[String],
        extra: &BTreeMap<String, serde_json::Value>,
    ) -> Result<String, CredentialError>;

    /// Produce a cryptographically random opaque rotation secret. Carries no
    /// introspectable payload.
    fn issue_refresh_token(&self) -> Result<String, CredentialError>;

    /// Validate signature, issuer, audience, and lifetime per the enabled
    /// validate-flags. Any failure surfaces as the uniform
    /// [`CredentialError::InvalidCredential`]; the specific cause is logged
    /// internally only.
    fn validate(&self, token: &str) -> Result<AuthenticationContext, CredentialError>;

    /// Validate everything except lifetime. Used exclusively by refresh-token
    /// exchange so an access token can be renewed after expiry while forged
    /// or tampered tokens are still rejected.
    fn principal_from_expired_token(
        &self,
        token: &str,
    ) -> Result<AuthenticationContext, CredentialError>;
}

/// Select the issuer implementation for the active mode, once, at startup.
pub fn user_token_issuer(settings: &AuthSettings) -> Arc<dyn UserTokenIssuer> {
    match settings.mode {
        AuthenticationMode::Disabled => Arc::new(DisabledTokenIssuer::new(settings.mode)),
        AuthenticationMode::BearerToken | AuthenticationMode::ExternalIdentityDelegation => {
            Arc::new(JwtTokenIssuer::new(settings.user_tokens.clone()))
        }
    }
}

/// HS256 issuer for the user token family.
pub struct JwtTokenIssuer {
    settings: UserTokenSettings,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl JwtTokenIssuer {
    /// Build an issuer from validated settings.
    pub fn new(settings: UserTokenSettings) -> Self {
        let encoding_key = EncodingKey::from_secret(settings.secret_key.as_bytes());
        let decoding_key = DecodingKey::from_secret(settings.secret_key.as_bytes());
        Self {
            settings,
            encoding_key,
            decoding_key,
        }
    }

    fn validation(&self, check_lifetime: bool) -> Validation {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = (self.settings.clock_skew_minutes * 60).max(0) as u64;

        validation.validate_exp = check_lifetime && self.settings.validate_lifetime;
        if !validation.validate_exp {
            validation.required_spec_claims.remove("exp");
        }

        if self.settings.validate_issuer {
            validation.set_issuer(&[&self.settings.issuer]);
        }
        if self.settings.validate_audience {
            validation.set_audience(&[&self.settings.audience]);
        } else {
            validation.validate_aud = false;
        }
        if !self.settings.validate_key {
            validation.insecure_disable_signature_validation();
        }

        validation
    }

    fn decode_claims(
        &self,
        token: &str,
        check_lifetime: bool,
    ) -> Result<UserClaims, CredentialError> {
        decode::<UserClaims>(token, &self.decoding_key, &self.validation(check_lifetime))
            .map(|data| data.claims)
            .map_err(|e| {
                // The cause (expired vs. malformed vs. signature mismatch)
                // stays in internal logs; callers see a uniform outcome.
                debug!(cause = %e, "user token rejected");
                CredentialError::InvalidCredential
            })
    }
}

/// Build a request context from validated claims.
fn context_from_claims(claims: UserClaims) -> AuthenticationContext {
    let mut ctx =
        AuthenticationContext::authenticated(SubjectId::new(claims.sub), claims.name)
            .with_roles(claims.roles);

    for (key, value) in claims.extra {
        match value {
            serde_json::Value::String(s) => ctx = ctx.with_claim(&key, s),
            serde_json::Value::Array(items) => {
                for item in items {
                    let rendered = match item {
                        serde_json::Value::String(s) => s,
                        other => other.to_string(),
                    };
                    ctx = ctx.with_claim(&key, rendered);
                }
            }
            other => ctx = ctx.with_claim(&key, other.to_string()),
        }
    }

    ctx
}

impl UserTokenIssuer for JwtTokenIssuer {
    fn issue_access_token(
        &self,
        subject: &SubjectId,
        display_name: Option<&str>,
        roles: &[String],
        extra: &BTreeMap<String, serde_json::Value>,
    ) -> Result<String, CredentialError> {
        let now = Utc::now();
        let claims = UserClaims {
            sub: subject.as_str().to_string(),
            name: display_name.map(str::to_string),
            iss: self.settings.issuer.clone(),
            aud: self.settings.audience.clone(),
            iat: now.timestamp(),
            exp: (now + Duration::minutes(self.settings.expiration_minutes)).timestamp(),
            roles: roles.to_vec(),
            extra: extra.clone(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| CredentialError::Unexpected(e.to_string()))
    }

    fn issue_refresh_token(&self) -> Result<String, CredentialError> {
        let mut bytes = [0u8; REFRESH_TOKEN_BYTES];
        getrandom::fill(&mut bytes)
            .map_err(|e| CredentialError::Unexpected(format!("entropy source failed: {}", e)))?;
        Ok(URL_SAFE_NO_PAD.encode(bytes))
    }

    fn validate(&self, token: &str) -> Result<AuthenticationContext, CredentialError> {
        self.decode_claims(token, true).map(context_from_claims)
    }

    fn principal_from_expired_token(
        &self,
        token: &str,
    ) -> Result<AuthenticationContext, CredentialError> {
        self.decode_claims(token, false).map(context_from_claims)
    }
}

/// Fail-loud substitute installed when user authentication is disabled.
///
/// Every operation raises an explicit "not available in this mode" failure.
pub struct DisabledTokenIssuer {
    mode: AuthenticationMode,
}

impl DisabledTokenIssuer {
    /// Create the stub, recording the mode for error reporting.
    pub fn new(mode: AuthenticationMode) -> Self {
        Self { mode }
    }

    fn unavailable<T>(&self) -> Result<T, CredentialError> {
        Err(CredentialError::TokensUnavailable { mode: self.mode })
    }
}

impl UserTokenIssuer for DisabledTokenIssuer {
    fn issue_access_token(
        &self,
        _subject: &SubjectId,
        _display_name: Option<&str>,
        _roles: &[String],
        _extra: &BTreeMap<String, serde_json::Value>,
    ) -> Result<String, CredentialError> {
        self.unavailable()
    }

    fn issue_refresh_token(&self) -> Result<String, CredentialError> {
        self.unavailable()
    }

    fn validate(&self, _token: &str) -> Result<AuthenticationContext, CredentialError> {
        self.unavailable()
    }

    fn principal_from_expired_token(
        &self,
        _token: &str,
    ) -> Result<AuthenticationContext, CredentialError> {
        self.unavailable()
    }
}
