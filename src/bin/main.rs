use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use bizgate::{
    AuthSettings, AuthenticationMode, PolicyTable, SessionId, SubjectId, build_auth_stack,
    default_mode, load_settings_from, resolve_environment, resolve_settings_path,
};
use clap::{Parser, Subcommand};
use tracing::{Level, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "bizgate")]
#[command(about = "Multi-mode authentication and token issuance")]
struct Cli {
    /// Settings file path (overrides the search order)
    #[arg(long, global = true, env = "BIZGATE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the settings file and report the effective mode
    CheckConfig,
    /// Print the mode the current environment name would select
    DefaultMode,
    /// Register a pseudo-user GUID for Disabled-mode attribution
    RegisterUser {
        /// GUID to register (a fresh one is minted when omitted)
        guid: Option<Uuid>,
        #[arg(long)]
        display_name: Option<String>,
        #[arg(long)]
        email: Option<String>,
    },
    /// Issue a user access token and a paired refresh token
    IssueToken {
        /// Subject identifier for the token
        subject: String,
        #[arg(long)]
        display_name: Option<String>,
        /// Comma-separated list of roles to embed
        #[arg(long)]
        roles: Option<String>,
    },
    /// Issue a service token delegated to a user GUID
    IssueServiceToken {
        user_guid: Uuid,
        /// Session identifier to embed alongside the delegated GUID
        #[arg(long)]
        session: Option<String>,
    },
    /// Decode a token without verifying it and print its claims
    InspectToken { token: String },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("bizgate=info".parse()?))
        .with_max_level(Level::INFO)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::CheckConfig => {
            let settings = load_settings(cli.config)?;
            settings.validate()?;
            println!("Configuration OK");
            println!("  Mode:                  {}", settings.mode);
            println!("  User token issuer:     {}", settings.user_tokens.issuer);
            println!("  User token audience:   {}", settings.user_tokens.audience);
            println!("  Service token issuer:  {}", settings.service_tokens.issuer);
            println!(
                "  Service token modes:   {}",
                settings
                    .service_tokens
                    .allowed_modes
                    .iter()
                    .map(|m| m.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        Commands::DefaultMode => {
            let environment = resolve_environment(|name| std::env::var(name).ok());
            let mode = default_mode(environment.as_ref());
            match &environment {
                Some(name) => println!("Environment '{}' defaults to {} mode", name, mode),
                None => println!("No environment set; defaulting to {} mode", mode),
            }
        }
        Commands::RegisterUser {
            guid,
            display_name,
            email,
        } => {
            let settings = load_settings(cli.config)?;
            let stack = build_auth_stack(settings, PolicyTable::new())?;

            let guid = guid.unwrap_or_else(Uuid::new_v4);
            let user = stack.registry.register(
                guid,
                display_name.as_deref(),
                email.as_deref(),
                stack.settings.mode,
            );

            println!("Registered pseudo-user");
            println!("  GUID:       {}", user.id);
            println!("  Audit GUID: {}", user.audit_guid);
            if let Some(name) = &user.display_name {
                println!("  Name:       {}", name);
            }
        }
        Commands::IssueToken {
            subject,
            display_name,
            roles,
        } => {
            let settings = load_settings(cli.config)?;
            if settings.mode == AuthenticationMode::Disabled {
                anyhow::bail!("user tokens are not available in Disabled mode");
            }
            let stack = build_auth_stack(settings, PolicyTable::new())?;

            let roles = roles
                .map(|s| {
                    s.split(',')
                        .map(|role| role.trim().to_string())
                        .filter(|role| !role.is_empty())
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();

            let access = stack.user_tokens.issue_access_token(
                &SubjectId::new(subject),
                display_name.as_deref(),
                &roles,
                &BTreeMap::new(),
            )?;
            let refresh = stack.user_tokens.issue_refresh_token()?;

            println!("Access token:");
            println!("{}", access);
            println!();
            println!("Refresh token:");
            println!("{}", refresh);
        }
        Commands::IssueServiceToken { user_guid, session } => {
            let settings = load_settings(cli.config)?;
            let stack = build_auth_stack(settings, PolicyTable::new())?;

            // The registry is process-local, so the delegated GUID is
            // registered here before minting.
            stack
                .registry
                .register(user_guid, None, None, stack.settings.mode);

            let session = session.map(SessionId::new);
            let token = stack.service_tokens.issue_service_token(
                user_guid,
                stack.settings.mode,
                session.as_ref(),
            )?;

            info!(user_guid = %user_guid, "service token issued");
            println!("{}", token);
        }
        Commands::InspectToken { token } => {
            let claims = decode_unverified(&token)?;
            println!("{}", serde_json::to_string_pretty(&claims)?);
        }
    }

    Ok(())
}

fn load_settings(config: Option<PathBuf>) -> Result<AuthSettings> {
    let environment = resolve_environment(|name| std::env::var(name).ok());
    let path = match config {
        Some(path) => path,
        None => resolve_settings_path()?,
    };
    load_settings_from(&path, environment.as_ref())
        .with_context(|| format!("loading settings from {}", path.display()))
}

/// Decode a token's claims without verifying signature or lifetime.
///
/// Inspection only; nothing decoded here is trusted.
fn decode_unverified(token: &str) -> Result<serde_json::Value> {
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    let header = jsonwebtoken::decode_header(token).context("token header is not valid JWT")?;

    let payload = token
        .split('.')
        .nth(1)
        .context("token is not in compact JWT form")?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .context("token payload is not valid base64url")?;
    let claims: serde_json::Value =
        serde_json::from_slice(&bytes).context("token payload is not valid JSON")?;

    Ok(serde_json::json!({
        "header": {
            "alg": format!("{:?}", header.alg),
            "kid": header.kid,
        },
        "claims": claims,
    }))
}
