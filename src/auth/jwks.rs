//! External identity provider key material and bearer verification.
//!
//! In ExternalIdentityDelegation mode the provider's protocol is out of
//! scope; this core only verifies RS256 bearer tokens it is handed, against
//! the signing keys published at the provider's JWKS endpoint. Keys are
//! cached by `kid` with a TTL, with an optional stale-cache fallback when a
//! refresh fails.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::auth::context::AuthenticationContext;
use crate::settings::DelegationSettings;
use crate::types::SubjectId;

/// Default key cache TTL in seconds (1 hour).
pub const DEFAULT_CACHE_TTL_SECONDS: u64 = 3600;

/// Oldest cache a stale-fallback read will accept, in seconds (24 hours).
pub const MAX_STALE_SECONDS: u64 = 86400;

/// One RSA signing key as published in a JWKS document.
#[derive(Debug, Clone, Deserialize)]
struct PublishedKey {
    kty: String,
    kid: Option<String>,
    #[serde(rename = "use")]
    key_use: Option<String>,
    /// RSA modulus, base64url.
    n: Option<String>,
    /// RSA exponent, base64url.
    e: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct KeySetDocument {
    keys: Vec<PublishedKey>,
}

struct FetchedKeys {
    by_kid: HashMap<String, DecodingKey>,
    fetched_at: Instant,
}

/// TTL-cached view of an identity provider's published signing keys.
pub struct RemoteKeySet {
    jwks_url: String,
    cache_ttl: Duration,
    allow_stale: bool,
    state: RwLock<Option<FetchedKeys>>,
    client: reqwest::Client,
}

impl RemoteKeySet {
    /// Create a key set for the given delegation settings.
    pub fn new(settings: &DelegationSettings) -> Result<Self, KeySetError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| KeySetError::Fetch(e.to_string()))?;

        Ok(Self {
            jwks_url: settings.jwks_url.clone(),
            cache_ttl: Duration::from_secs(settings.jwks_cache_seconds),
            allow_stale: settings.allow_stale_jwks,
            state: RwLock::new(None),
            client,
        })
    }

    /// Decoding key for a `kid`, refreshing the cache when it is stale or the
    /// key is unknown. With no `kid`, the first published key is returned.
    pub async fn decoding_key(&self, kid: Option<&str>) -> Result<DecodingKey, KeySetError> {
        {
            let state = self.state.read().await;
            if let Some(fetched) = state.as_ref()
                && fetched.fetched_at.elapsed() <= self.cache_ttl
                && let Some(key) = Self::pick(&fetched.by_kid, kid)
            {
                return Ok(key);
            }
        }

        match self.refresh().await {
            Ok(()) => {
                let state = self.state.read().await;
                let fetched = state.as_ref().ok_or(KeySetError::NoKeys)?;
                Self::pick(&fetched.by_kid, kid).ok_or_else(|| match kid {
                    Some(k) => KeySetError::UnknownKeyId(k.to_string()),
                    None => KeySetError::NoKeys,
                })
            }
            Err(e) => {
                if self.allow_stale {
                    let state = self.state.read().await;
                    if let Some(fetched) = state.as_ref()
                        && fetched.fetched_at.elapsed() < Duration::from_secs(MAX_STALE_SECONDS)
                        && let Some(key) = Self::pick(&fetched.by_kid, kid)
                    {
                        warn!(cause = %e, "JWKS refresh failed, serving stale key");
                        return Ok(key);
                    }
                }
                Err(e)
            }
        }
    }

    fn pick(by_kid: &HashMap<String, DecodingKey>, kid: Option<&str>) -> Option<DecodingKey> {
        match kid {
            Some(k) => by_kid.get(k).cloned(),
            None => by_kid.values().next().cloned(),
        }
    }

    /// Fetch the JWKS document and replace the cached keys.
    pub async fn refresh(&self) -> Result<(), KeySetError> {
        debug!(url = %self.jwks_url, "refreshing identity provider keys");

        let response = self
            .client
            .get(&self.jwks_url)
            .send()
            .await
            .map_err(|e| KeySetError::Fetch(e.to_string()))?;

        if !response.status().is_success() {
            return Err(KeySetError::Fetch(format!(
                "HTTP {} from JWKS endpoint",
                response.status()
            )));
        }

        let document: KeySetDocument = response
            .json()
            .await
            .map_err(|e| KeySetError::Parse(e.to_string()))?;

        let mut by_kid = HashMap::new();
        for key in document.keys {
            if key.kty != "RSA" || key.key_use.as_deref() == Some("enc") {
                continue;
            }
            let (Some(n), Some(e)) = (&key.n, &key.e) else {
                warn!(kid = ?key.kid, "published RSA key missing n/e components");
                continue;
            };
            match DecodingKey::from_rsa_components(n, e) {
                Ok(decoding_key) => {
                    let kid = key.kid.unwrap_or_else(|| "default".to_string());
                    by_kid.insert(kid, decoding_key);
                }
                Err(err) => warn!(kid = ?key.kid, cause = %err, "unusable published key"),
            }
        }

        if by_kid.is_empty() {
            return Err(KeySetError::NoKeys);
        }

        debug!(count = by_kid.len(), "cached identity provider keys");
        let mut state = self.state.write().await;
        *state = Some(FetchedKeys {
            by_kid,
            fetched_at: Instant::now(),
        });
        Ok(())
    }

    /// Whether any keys are currently cached.
    pub async fn has_keys(&self) -> bool {
        self.state.read().await.is_some()
    }
}

/// Claims this core reads from an externally issued bearer token.
#[derive(Debug, Clone, Deserialize)]
pub struct DelegatedClaims {
    pub sub: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Verifies externally issued RS256 bearer tokens against the authority's
/// published keys.
pub struct DelegationVerifier {
    keys: RemoteKeySet,
    authority: String,
    audience: String,
}

impl DelegationVerifier {
    /// Build a verifier for the configured authority.
    pub fn new(settings: &DelegationSettings) -> Result<Self, KeySetError> {
        Ok(Self {
            keys: RemoteKeySet::new(settings)?,
            authority: settings.authority.clone(),
            audience: settings.audience.clone(),
        })
    }

    /// Verify a bearer token and build a request context from its claims.
    pub async fn verify(&self, token: &str) -> Result<AuthenticationContext, KeySetError> {
        let header =
            decode_header(token).map_err(|e| KeySetError::Rejected(e.to_string()))?;
        let key = self.keys.decoding_key(header.kid.as_deref()).await?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[&self.authority]);
        validation.set_audience(&[&self.audience]);

        let claims = decode::<DelegatedClaims>(token, &key, &validation)
            .map_err(|e| KeySetError::Rejected(e.to_string()))?
            .claims;

        let mut ctx =
            AuthenticationContext::authenticated(SubjectId::new(claims.sub), claims.name)
                .with_roles(claims.roles);
        for (key, value) in claims.extra {
            let rendered = match value {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            ctx = ctx.with_claim(&key, rendered);
        }
        Ok(ctx)
    }
}

/// Failures while working with identity provider key material.
#[derive(Debug, Clone)]
pub enum KeySetError {
    /// Could not reach or read the JWKS endpoint.
    Fetch(String),
    /// The JWKS response was not a usable document.
    Parse(String),
    /// The document carried no usable signing keys.
    NoKeys,
    /// The token names a `kid` the provider does not publish.
    UnknownKeyId(String),
    /// The bearer token failed verification.
    Rejected(String),
}

impl std::fmt::Display for KeySetError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fetch(msg) => write!(f, "failed to fetch provider keys: {}", msg),
            Self::Parse(msg) => write!(f, "failed to parse provider keys: {}", msg),
            Self::NoKeys => write!(f, "identity provider published no usable keys"),
            Self::UnknownKeyId(kid) => write!(f, "unknown signing key id: {}", kid),
            Self::Rejected(msg) => write!(f, "delegated token rejected: {}", msg),
        }
    }
}

impl std::error::Error for KeySetError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> DelegationSettings {
        DelegationSettings {
            authority: "https://idp.example.com".to_string(),
            audience: "bizgate".to_string(),
            jwks_url: "https://idp.example.com/.well-known/jwks.json".to_string(),
            jwks_cache_seconds: 3600,
            allow_stale_jwks: true,
        }
    }

    #[tokio::test]
    async fn test_key_set_starts_empty() {
        let keys = RemoteKeySet::new(&settings()).unwrap();
        assert!(!keys.has_keys().await);
    }

    #[test]
    fn test_key_set_document_parsing() {
        let json = r#"{
            "keys": [
                { "kty": "RSA", "kid": "k1", "use": "sig", "n": "abc", "e": "AQAB" },
                { "kty": "EC", "kid": "k2" },
                { "kty": "RSA", "kid": "k3", "use": "enc", "n": "def", "e": "AQAB" }
            ]
        }"#;

        let document: KeySetDocument = serde_json::from_str(json).unwrap();
        assert_eq!(document.keys.len(), 3);
        assert_eq!(document.keys[0].kid.as_deref(), Some("k1"));
        assert_eq!(document.keys[2].key_use.as_deref(), Some("enc"));
    }

    #[test]
    fn test_delegated_claims_tolerate_missing_optionals() {
        let claims: DelegatedClaims =
            serde_json::from_str(r#"{ "sub": "ext-user-1" }"#).unwrap();
        assert_eq!(claims.sub, "ext-user-1");
        assert!(claims.name.is_none());
        assert!(claims.roles.is_empty());
    }

    #[tokio::test]
    async fn test_verify_rejects_malformed_token() {
        let verifier = DelegationVerifier::new(&settings()).unwrap();
        let err = verifier.verify("not-a-token").await.unwrap_err();
        assert!(matches!(err, KeySetError::Rejected(_)));
    }

    #[test]
    fn test_key_set_error_display() {
        assert_eq!(
            KeySetError::UnknownKeyId("k9".to_string()).to_string(),
            "unknown signing key id: k9"
        );
        assert_eq!(
            KeySetError::NoKeys.to_string(),
            "identity provider published no usable keys"
        );
    }
}
