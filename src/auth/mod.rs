//! Multi-mode authentication and token issuance.
//!
//! This module implements the trust boundary of the system across three
//! structurally different trust models, selected once at startup:
//!
//! - **Disabled**: no user credentials; callers are attributed via GUIDs
//!   registered in [`UserRegistry`]
//! - **BearerToken**: locally issued HS256 access/refresh tokens
//! - **ExternalIdentityDelegation**: RS256 bearer tokens from an external
//!   identity provider, verified against its JWKS endpoint
//!
//! Independent of the user mode, [`ServiceTokenIssuer`] mints
//! machine-to-machine tokens that carry a delegated end-user GUID, signed
//! with a key separate from the user token family. [`AuthorizationGate`] is
//! the per-operation decision function consumed by every protected operation.
//!
//! ## Security model
//!
//! - Exactly one user-credential path is active per mode; no fallback chaining
//! - Misconfiguration fails at startup, never silently degrades
//! - Credential failures are recovered into structured denials; nothing
//!   panics or propagates across the trust boundary
//! - Caller-visible failure messages are generic; internal logs carry the
//!   specific cause

mod context;
mod gate;
pub mod jwks;
mod registry;
mod service_token;
mod token_issuer;

pub use context::{AuthenticationContext, CORRELATION_CLAIM};
pub use gate::{
    AccessDecision, AuthorizationGate, Denial, DenialReason, GateRequest, OperationPolicy,
    PolicyTable,
};
pub use jwks::{DEFAULT_CACHE_TTL_SECONDS, DelegationVerifier, KeySetError, RemoteKeySet};
pub use registry::{PseudoUser, UserRegistry};
pub use service_token::{SERVICE_TOKEN_MARKER, ServiceClaims, ServiceTokenIssuer};
pub use token_issuer::{
    DisabledTokenIssuer, JwtTokenIssuer, UserClaims, UserTokenIssuer, user_token_issuer,
};

use std::fmt;

use uuid::Uuid;

use crate::settings::AuthenticationMode;

/// Request-time credential failures.
///
/// These are always recovered locally into a structured denied outcome;
/// they never cross the trust boundary as a panic or an unhandled error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    /// Missing, malformed, expired, or signature-invalid credential.
    ///
    /// Deliberately uniform: the external contract never leaks which check
    /// failed. Internal logs carry the specific cause.
    InvalidCredential,
    /// User token operations are not available in the active mode.
    TokensUnavailable { mode: AuthenticationMode },
    /// An empty or unset GUID was supplied for delegation.
    InvalidUserGuid,
    /// The GUID is well-formed but not present in the registry.
    UnregisteredGuid(Uuid),
    /// Service tokens may not be minted in the active mode.
    DisallowedMode { mode: AuthenticationMode },
    /// Entropy or encoding failure during issuance.
    Unexpected(String),
}

impl fmt::Display for CredentialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidCredential => write!(f, "invalid or expired credentials"),
            Self::TokensUnavailable { mode } => {
                write!(f, "user tokens are not available in {} mode", mode)
            }
            Self::InvalidUserGuid => write!(f, "valid user GUID required"),
            Self::UnregisteredGuid(guid) => {
                write!(f, "user GUID {} is not registered", guid)
            }
            Self::DisallowedMode { mode } => {
                write!(f, "service tokens may not be issued in {} mode", mode)
            }
            Self::Unexpected(msg) => write!(f, "unexpected credential failure: {}", msg),
        }
    }
}

impl std::error::Error for CredentialError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_error_display() {
        assert_eq!(
            CredentialError::InvalidCredential.to_string(),
            "invalid or expired credentials"
        );
        assert_eq!(
            CredentialError::TokensUnavailable {
                mode: AuthenticationMode::Disabled
            }
            .to_string(),
            "user tokens are not available in Disabled mode"
        );
        assert_eq!(
            CredentialError::InvalidUserGuid.to_string(),
            "valid user GUID required"
        );
    }
}
