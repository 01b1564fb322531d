// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{pin::Pin, sync::Arc, time::Duration};

use anyhow::{Result, anyhow};
use serde::Deserialize;

use crate::{
    auth::cache::CredentialCache,
    cfg::{
        config::{AuthConfig, ServerAddress},
        enums::AuthMechanism,
    },
    error::{ConfigurationError, SecurityError},
};

/// Budget granted to a user-supplied OIDC callback.
pub const OIDC_CALLBACK_TIMEOUT: Duration = Duration::from_secs(5 * 60);

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Identity-provider facts delivered by the server during the OIDC
/// two-step.
#[derive(Debug, Clone, Deserialize)]
pub struct IdpServerInfo {
    pub issuer: String,
    #[serde(default, rename = "clientId")]
    pub client_id: Option<String>,
    #[serde(default, rename = "requestScopes")]
    pub request_scopes: Vec<String>,
}

/// What a callback receives: its budget, the cached refresh token if one
/// exists, and the identity-provider info when already known.
#[derive(Debug, Clone)]
pub struct OidcCallbackContext {
    pub timeout: Duration,
    pub refresh_token: Option<String>,
    pub idp_info: Option<IdpServerInfo>,
}

/// What a callback returns.
#[derive(Debug, Clone)]
pub struct OidcCallbackResult {
    pub access_token: String,
    pub expires_in: Option<Duration>,
    pub refresh_token: Option<String>,
}

pub type OidcCallback =
    Arc<dyn Fn(OidcCallbackContext) -> BoxFuture<Result<OidcCallbackResult>> + Send + Sync>;

/// An immutable credential plus its per-credential cache. Secrets never
/// appear in `Debug` output or error values.
#[derive(Clone)]
pub struct Credential {
    pub mechanism: Option<AuthMechanism>,
    pub source: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub allowed_hosts: Option<Vec<String>>,
    /// Environment variable naming a web-identity token file; configures
    /// the automatic OIDC provider.
    pub token_file_env: Option<String>,
    pub oidc_request_callback: Option<OidcCallback>,
    pub oidc_refresh_callback: Option<OidcCallback>,
    pub cache: Arc<CredentialCache>,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("mechanism", &self.mechanism)
            .field("source", &self.source)
            .field("username", &self.username)
            .finish()
    }
}

impl Credential {
    pub fn from_config(cfg: &AuthConfig) -> Self {
        Self {
            mechanism: cfg.mechanism,
            source: cfg.source.clone(),
            username: cfg.username.clone(),
            password: cfg.password.clone(),
            allowed_hosts: cfg.allowed_hosts.clone(),
            token_file_env: cfg.token_file_env.clone(),
            oidc_request_callback: None,
            oidc_refresh_callback: None,
            cache: Arc::new(CredentialCache::new()),
        }
    }

    pub fn with_oidc_request_callback(mut self, cb: OidcCallback) -> Self {
        self.oidc_request_callback = Some(cb);
        self
    }

    pub fn with_oidc_refresh_callback(mut self, cb: OidcCallback) -> Self {
        self.oidc_refresh_callback = Some(cb);
        self
    }

    pub fn username_or_err(&self) -> Result<&str> {
        self.username.as_deref().ok_or_else(|| {
            anyhow!(SecurityError::PrincipalLookup {
                user: String::new(),
                message: "credential has no username".to_string(),
            })
        })
    }

    pub fn password_or_err(&self) -> Result<&str> {
        self.password.as_deref().ok_or_else(|| {
            anyhow!(SecurityError::PrincipalLookup {
                user: self.username.clone().unwrap_or_default(),
                message: "credential has no password".to_string(),
            })
        })
    }

    /// `"<source>.<user>"`, the shape `saslSupportedMechs` wants.
    pub fn user_source_key(&self) -> Option<String> {
        self.username
            .as_ref()
            .map(|u| format!("{}.{}", self.source, u))
    }

    /// Verifies the server host against the allowed-hosts patterns before
    /// any OIDC callback may run. An absent list allows every host; a
    /// wildcard anywhere but the very front is a configuration error.
    pub fn check_host_allowed(&self, address: &ServerAddress) -> Result<()> {
        let Some(patterns) = &self.allowed_hosts else {
            return Ok(());
        };
        for pattern in patterns {
            if let Some(suffix) = pattern.strip_prefix("*.") {
                if suffix.contains('*') {
                    return Err(anyhow!(ConfigurationError::AllowedHostWildcard {
                        pattern: pattern.clone(),
                    }));
                }
                if address.host.ends_with(&format!(".{suffix}")) {
                    return Ok(());
                }
            } else if pattern.contains('*') {
                return Err(anyhow!(ConfigurationError::AllowedHostWildcard {
                    pattern: pattern.clone(),
                }));
            } else if address.host == *pattern {
                return Ok(());
            }
        }
        Err(anyhow!(SecurityError::AllowedHostDenied {
            host: address.host.clone(),
        }))
    }
}
