// Core modules
mod types;
pub mod auth;
pub mod client;
pub mod settings;

// Re-export key types and functions
pub use auth::{
    AccessDecision, AuthenticationContext, AuthorizationGate, CredentialError, DelegationVerifier,
    GateRequest, OperationPolicy, PolicyTable, PseudoUser, ServiceTokenIssuer, UserRegistry,
    UserTokenIssuer, user_token_issuer,
};
pub use client::CredentialDecorator;
pub use settings::{
    AuthSettings, AuthenticationMode, ConfigurationError, default_mode, load_settings_from,
    resolve_environment, resolve_settings_path,
};
pub use types::{EnvironmentName, SessionId, SubjectId};

use std::sync::Arc;

use anyhow::Result;

/// The fully assembled authentication subsystem for one process.
///
/// All components share one registry and are configured for the same mode;
/// the stack is built once at startup and shared behind `Arc`s thereafter.
pub struct AuthStack {
    pub settings: AuthSettings,
    pub registry: Arc<UserRegistry>,
    pub user_tokens: Arc<dyn UserTokenIssuer>,
    pub service_tokens: Arc<ServiceTokenIssuer>,
    pub gate: AuthorizationGate,
    pub decorator: CredentialDecorator,
}

/// Convenience function to validate settings and assemble the subsystem.
///
/// Validation runs first so a misconfigured process refuses to start instead
/// of degrading at request time.
pub fn build_auth_stack(settings: AuthSettings, policies: PolicyTable) -> Result<AuthStack> {
    settings.validate()?;

    let registry = Arc::new(UserRegistry::new());
    let user_tokens = user_token_issuer(&settings);
    let service_tokens = Arc::new(ServiceTokenIssuer::new(
        settings.service_tokens.clone(),
        registry.clone(),
    ));

    let delegation = match (&settings.mode, &settings.delegation) {
        (AuthenticationMode::ExternalIdentityDelegation, Some(delegation)) => {
            Some(DelegationVerifier::new(delegation)?)
        }
        _ => None,
    };

    let gate = AuthorizationGate::new(
        &settings,
        user_tokens.clone(),
        registry.clone(),
        delegation,
        policies,
    )?;
    let decorator = CredentialDecorator::new(service_tokens.clone(), &settings);

    Ok(AuthStack {
        settings,
        registry,
        user_tokens,
        service_tokens,
        gate,
        decorator,
    })
}
