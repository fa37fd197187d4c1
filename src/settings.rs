//! Authentication settings: mode selection and fail-fast validation.
//!
//! Settings are constructed once at process start and validated eagerly; any
//! violation is fatal and prevents startup. The default mode is derived from
//! the hosting environment name, which is resolved through an injected lookup
//! so tests can supply values without mutating process state.

use std::{env, fmt, fs, path::PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::types::EnvironmentName;

/// Minimum length for any token signing secret.
pub const MIN_SECRET_LENGTH: usize = 32;

/// Upper bound for user token lifetime (one day, in minutes).
pub const MAX_USER_TOKEN_MINUTES: i64 = 1440;

/// Upper bound for service token lifetime (one week, in minutes).
pub const MAX_SERVICE_TOKEN_MINUTES: i64 = 10080;

/// Canonical GUID form accepted on the correlation side channels.
pub const DEFAULT_GUID_PATTERN: &str =
    "^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$";

/// Primary environment variable consulted for the hosting environment name.
pub const PRIMARY_ENVIRONMENT_VAR: &str = "BIZGATE_ENVIRONMENT";

/// Fallback environment variable when the primary is unset.
pub const FALLBACK_ENVIRONMENT_VAR: &str = "ENVIRONMENT";

/// Which trust model is active. Exactly one user-credential path is live at
/// a time; there is no fallback chaining between modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthenticationMode {
    /// No user credentials; callers are attributed via registered GUIDs.
    Disabled,
    /// Locally issued HS256 bearer tokens.
    BearerToken,
    /// Bearer tokens issued by an external identity provider.
    ExternalIdentityDelegation,
}

impl AuthenticationMode {
    /// Stable string form, embedded in service token claims.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disabled => "Disabled",
            Self::BearerToken => "BearerToken",
            Self::ExternalIdentityDelegation => "ExternalIdentityDelegation",
        }
    }
}

impl fmt::Display for AuthenticationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for AuthenticationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "disabled" => Ok(Self::Disabled),
            "bearertoken" | "bearer" => Ok(Self::BearerToken),
            "externalidentitydelegation" | "delegation" => Ok(Self::ExternalIdentityDelegation),
            other => Err(format!("unknown authentication mode: {}", other)),
        }
    }
}

/// Resolve the hosting environment name through an injected lookup.
///
/// Checks [`PRIMARY_ENVIRONMENT_VAR`] first, then [`FALLBACK_ENVIRONMENT_VAR`].
pub fn resolve_environment(
    lookup: impl Fn(&str) -> Option<String>,
) -> Option<EnvironmentName> {
    lookup(PRIMARY_ENVIRONMENT_VAR)
        .or_else(|| lookup(FALLBACK_ENVIRONMENT_VAR))
        .filter(|name| !name.trim().is_empty())
        .map(EnvironmentName::new)
}

/// Environment-aware default mode.
///
/// Unset or empty names default to [`AuthenticationMode::BearerToken`]; any
/// name containing "test" case-insensitively (e.g. "Test", "Testing",
/// "integration-tests") defaults to [`AuthenticationMode::Disabled`].
pub fn default_mode(environment: Option<&EnvironmentName>) -> AuthenticationMode {
    match environment {
        Some(name) if !name.as_str().trim().is_empty() => {
            if name.as_str().to_ascii_lowercase().contains("test") {
                AuthenticationMode::Disabled
            } else {
                AuthenticationMode::BearerToken
            }
        }
        _ => AuthenticationMode::BearerToken,
    }
}

/// Settings for the user-facing token family.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserTokenSettings {
    pub secret_key: String,
    pub issuer: String,
    pub audience: String,
    pub expiration_minutes: i64,
    pub clock_skew_minutes: i64,
    pub validate_issuer: bool,
    pub validate_audience: bool,
    pub validate_lifetime: bool,
    pub validate_key: bool,
}

impl Default for UserTokenSettings {
    fn default() -> Self {
        Self {
            secret_key: String::new(),
            issuer: "bizgate".to_string(),
            audience: "bizgate-clients".to_string(),
            expiration_minutes: 60,
            clock_skew_minutes: 5,
            validate_issuer: true,
            validate_audience: true,
            validate_lifetime: true,
            validate_key: true,
        }
    }
}

/// Settings for the machine-to-machine token family.
///
/// The signing key is independent from [`UserTokenSettings`]: compromising one
/// token family must not grant forgery rights over the other.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceTokenSettings {
    pub secret_key: String,
    pub issuer: String,
    pub audience: String,
    pub service_identity: String,
    pub expiration_minutes: i64,
    pub cache_refresh_threshold_minutes: i64,
    pub allowed_modes: Vec<AuthenticationMode>,
}

impl Default for ServiceTokenSettings {
    fn default() -> Self {
        Self {
            secret_key: String::new(),
            issuer: "bizgate-services".to_string(),
            audience: "business-data-api".to_string(),
            service_identity: "bizgate".to_string(),
            expiration_minutes: 60,
            cache_refresh_threshold_minutes: 5,
            allowed_modes: vec![
                AuthenticationMode::Disabled,
                AuthenticationMode::BearerToken,
                AuthenticationMode::ExternalIdentityDelegation,
            ],
        }
    }
}

/// Settings for the Disabled-mode correlation GUID side channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GuidValidationSettings {
    pub enabled: bool,
    pub header_name: String,
    pub query_parameter: String,
    pub pattern: String,
}

impl Default for GuidValidationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            header_name: "X-User-Guid".to_string(),
            query_parameter: "userGuid".to_string(),
            pattern: DEFAULT_GUID_PATTERN.to_string(),
        }
    }
}

/// Opaque settings for the external identity provider used in
/// [`AuthenticationMode::ExternalIdentityDelegation`]. Only RS256 bearer
/// validation against the authority's JWKS endpoint is implemented here;
/// the provider's own protocol is out of scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegationSettings {
    pub authority: String,
    pub audience: String,
    pub jwks_url: String,
    #[serde(default = "default_jwks_cache_seconds")]
    pub jwks_cache_seconds: u64,
    #[serde(default = "default_allow_stale_jwks")]
    pub allow_stale_jwks: bool,
}

fn default_jwks_cache_seconds() -> u64 {
    crate::auth::jwks::DEFAULT_CACHE_TTL_SECONDS
}

fn default_allow_stale_jwks() -> bool {
    true
}

/// The validated, immutable configuration for the authentication core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSettings {
    pub mode: AuthenticationMode,
    #[serde(default)]
    pub user_tokens: UserTokenSettings,
    #[serde(default)]
    pub service_tokens: ServiceTokenSettings,
    #[serde(default)]
    pub guid_validation: GuidValidationSettings,
    #[serde(default)]
    pub delegation: Option<DelegationSettings>,
}

/// Raw settings document as read from disk; `mode` may be omitted, in which
/// case the environment-aware default applies.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsDocument {
    #[serde(default)]
    pub mode: Option<AuthenticationMode>,
    #[serde(default)]
    pub user_tokens: UserTokenSettings,
    #[serde(default)]
    pub service_tokens: ServiceTokenSettings,
    #[serde(default)]
    pub guid_validation: GuidValidationSettings,
    #[serde(default)]
    pub delegation: Option<DelegationSettings>,
}

impl SettingsDocument {
    /// Apply the environment-aware default mode when none is explicit.
    pub fn into_settings(self, environment: Option<&EnvironmentName>) -> AuthSettings {
        AuthSettings {
            mode: self.mode.unwrap_or_else(|| default_mode(environment)),
            user_tokens: self.user_tokens,
            service_tokens: self.service_tokens,
            guid_validation: self.guid_validation,
            delegation: self.delegation,
        }
    }
}

impl AuthSettings {
    /// Whether the active mode requires a real user credential.
    pub fn require_user_authentication(&self) -> bool {
        !matches!(self.mode, AuthenticationMode::Disabled)
    }

    /// Service authentication is never optional, in any mode.
    pub fn require_service_authentication(&self) -> bool {
        true
    }

    /// Fail-fast validation. A single violation fails the whole validation
    /// with the offending field name; there is no partial recovery.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.validate_service_tokens()?;
        self.validate_user_tokens()?;

        match self.mode {
            AuthenticationMode::BearerToken => {
                if self.user_tokens.secret_key.is_empty() {
                    return Err(ConfigurationError::ModeRequirement {
                        mode: self.mode,
                        field: "userTokens.secretKey",
                        requirement: "secret key required",
                    });
                }
            }
            AuthenticationMode::ExternalIdentityDelegation => {
                let delegation = self.delegation.as_ref().ok_or(
                    ConfigurationError::ModeRequirement {
                        mode: self.mode,
                        field: "delegation",
                        requirement: "delegation settings required",
                    },
                )?;
                if delegation.authority.is_empty() {
                    return Err(ConfigurationError::MissingField {
                        field: "delegation.authority",
                    });
                }
                if delegation.audience.is_empty() {
                    return Err(ConfigurationError::MissingField {
                        field: "delegation.audience",
                    });
                }
                if delegation.jwks_url.is_empty() {
                    return Err(ConfigurationError::MissingField {
                        field: "delegation.jwksUrl",
                    });
                }
            }
            AuthenticationMode::Disabled => {}
        }

        if self.guid_validation.enabled {
            Regex::new(&self.guid_validation.pattern).map_err(|e| {
                ConfigurationError::InvalidPattern {
                    field: "guidValidation.pattern",
                    message: e.to_string(),
                }
            })?;
        }

        Ok(())
    }

    /// Service token settings are validated regardless of mode.
    fn validate_service_tokens(&self) -> Result<(), ConfigurationError> {
        let st = &self.service_tokens;

        if st.secret_key.is_empty() {
            return Err(ConfigurationError::MissingField {
                field: "serviceTokens.secretKey",
            });
        }
        if st.secret_key.len() < MIN_SECRET_LENGTH {
            return Err(ConfigurationError::SecretTooShort {
                field: "serviceTokens.secretKey",
                minimum: MIN_SECRET_LENGTH,
            });
        }
        if st.issuer.is_empty() {
            return Err(ConfigurationError::MissingField {
                field: "serviceTokens.issuer",
            });
        }
        if st.audience.is_empty() {
            return Err(ConfigurationError::MissingField {
                field: "serviceTokens.audience",
            });
        }
        if st.service_identity.is_empty() {
            return Err(ConfigurationError::MissingField {
                field: "serviceTokens.serviceIdentity",
            });
        }
        if !(1..=MAX_SERVICE_TOKEN_MINUTES).contains(&st.expiration_minutes) {
            return Err(ConfigurationError::OutOfRange {
                field: "serviceTokens.expirationMinutes",
                minimum: 1,
                maximum: MAX_SERVICE_TOKEN_MINUTES,
                actual: st.expiration_minutes,
            });
        }
        if !(1..=MAX_SERVICE_TOKEN_MINUTES).contains(&st.cache_refresh_threshold_minutes) {
            return Err(ConfigurationError::OutOfRange {
                field: "serviceTokens.cacheRefreshThresholdMinutes",
                minimum: 1,
                maximum: MAX_SERVICE_TOKEN_MINUTES,
                actual: st.cache_refresh_threshold_minutes,
            });
        }
        if st.allowed_modes.is_empty() {
            return Err(ConfigurationError::MissingField {
                field: "serviceTokens.allowedModes",
            });
        }
        if !self.user_tokens.secret_key.is_empty()
            && st.secret_key == self.user_tokens.secret_key
        {
            return Err(ConfigurationError::SharedSecret {
                field: "serviceTokens.secretKey",
            });
        }

        Ok(())
    }

    /// User token numeric bounds and secret strength are checked in every
    /// mode; a short secret is always rejected even if the mode never uses it.
    fn validate_user_tokens(&self) -> Result<(), ConfigurationError> {
        let ut = &self.user_tokens;

        if !ut.secret_key.is_empty() && ut.secret_key.len() < MIN_SECRET_LENGTH {
            return Err(ConfigurationError::SecretTooShort {
                field: "userTokens.secretKey",
                minimum: MIN_SECRET_LENGTH,
            });
        }
        if ut.issuer.is_empty() {
            return Err(ConfigurationError::MissingField {
                field: "userTokens.issuer",
            });
        }
        if ut.audience.is_empty() {
            return Err(ConfigurationError::MissingField {
                field: "userTokens.audience",
            });
        }
        if !(1..=MAX_USER_TOKEN_MINUTES).contains(&ut.expiration_minutes) {
            return Err(ConfigurationError::OutOfRange {
                field: "userTokens.expirationMinutes",
                minimum: 1,
                maximum: MAX_USER_TOKEN_MINUTES,
                actual: ut.expiration_minutes,
            });
        }
        if !(0..=60).contains(&ut.clock_skew_minutes) {
            return Err(ConfigurationError::OutOfRange {
                field: "userTokens.clockSkewMinutes",
                minimum: 0,
                maximum: 60,
                actual: ut.clock_skew_minutes,
            });
        }

        Ok(())
    }
}

/// Resolve the settings file path: `BIZGATE_CONFIG`, then
/// `$XDG_CONFIG_HOME/bizgate/bizgate.json`, then `./bizgate.json`.
pub fn resolve_settings_path() -> Result<PathBuf, ConfigurationError> {
    if let Ok(p) = env::var("BIZGATE_CONFIG") {
        return Ok(PathBuf::from(p));
    }

    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        let candidate = PathBuf::from(xdg).join("bizgate").join("bizgate.json");
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    let candidate = PathBuf::from("bizgate.json");
    if candidate.exists() {
        return Ok(candidate);
    }

    Err(ConfigurationError::FileNotFound {
        searched: "BIZGATE_CONFIG, $XDG_CONFIG_HOME/bizgate/bizgate.json, ./bizgate.json"
            .to_string(),
    })
}

/// Load and validate settings from a specific file.
///
/// The environment name (for the default-mode heuristic) is injected rather
/// than read ambiently.
pub fn load_settings_from(
    path: &std::path::Path,
    environment: Option<&EnvironmentName>,
) -> Result<AuthSettings, ConfigurationError> {
    let raw = fs::read_to_string(path).map_err(|e| ConfigurationError::Unreadable {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    let document: SettingsDocument =
        serde_json::from_str(&raw).map_err(|e| ConfigurationError::Malformed {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

    let settings = document.into_settings(environment);
    settings.validate()?;
    Ok(settings)
}

/// Startup configuration violations. Fatal; the process must not start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    /// A required field is missing or empty.
    MissingField { field: &'static str },
    /// A signing secret is shorter than the minimum length.
    SecretTooShort { field: &'static str, minimum: usize },
    /// A numeric setting falls outside its allowed range.
    OutOfRange {
        field: &'static str,
        minimum: i64,
        maximum: i64,
        actual: i64,
    },
    /// A field required by the active mode is missing.
    ModeRequirement {
        mode: AuthenticationMode,
        field: &'static str,
        requirement: &'static str,
    },
    /// The service token secret reuses the user token secret.
    SharedSecret { field: &'static str },
    /// The GUID validation pattern does not compile.
    InvalidPattern {
        field: &'static str,
        message: String,
    },
    /// No settings file could be located.
    FileNotFound { searched: String },
    /// The settings file exists but could not be read.
    Unreadable { path: String, message: String },
    /// The settings file is not valid JSON.
    Malformed { path: String, message: String },
}

impl ConfigurationError {
    /// The offending configuration field, when one can be named.
    pub fn field(&self) -> Option<&'static str> {
        match self {
            Self::MissingField { field }
            | Self::SecretTooShort { field, .. }
            | Self::OutOfRange { field, .. }
            | Self::ModeRequirement { field, .. }
            | Self::SharedSecret { field }
            | Self::InvalidPattern { field, .. } => Some(field),
            _ => None,
        }
    }
}

impl fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingField { field } => write!(f, "{}: value is required", field),
            Self::SecretTooShort { field, minimum } => write!(
                f,
                "{}: secret key must be at least {} characters",
                field, minimum
            ),
            Self::OutOfRange {
                field,
                minimum,
                maximum,
                actual,
            } => write!(
                f,
                "{}: value {} outside allowed range [{}, {}]",
                field, actual, minimum, maximum
            ),
            Self::ModeRequirement {
                mode,
                field,
                requirement,
            } => write!(f, "{}: {} for {} mode", field, requirement, mode),
            Self::SharedSecret { field } => write!(
                f,
                "{}: must not reuse the user token secret key",
                field
            ),
            Self::InvalidPattern { field, message } => {
                write!(f, "{}: invalid pattern: {}", field, message)
            }
            Self::FileNotFound { searched } => {
                write!(f, "no settings file found (searched: {})", searched)
            }
            Self::Unreadable { path, message } => {
                write!(f, "could not read settings file {}: {}", path, message)
            }
            Self::Malformed { path, message } => {
                write!(f, "could not parse settings file {}: {}", path, message)
            }
        }
    }
}

impl std::error::Error for ConfigurationError {}
