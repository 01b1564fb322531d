// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::HashMap,
    sync::Mutex as StdMutex,
    time::Duration,
};

use tokio::{sync::RwLock, time::Instant};

use crate::auth::credential::{IdpServerInfo, OidcCallbackResult};

/// Safety margin subtracted from server-supplied token lifetimes, so a
/// token is refreshed before it actually lapses.
pub const ACCESS_TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(5 * 60);

/// Derived-key cache key: the password material is hashed together with
/// the salt, so the cache never stores a recoverable password.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScramCacheKey {
    pub password_and_salt_digest: Vec<u8>,
    pub salt: Vec<u8>,
    pub iterations: u32,
}

/// The expensive PBKDF2 products worth caching.
#[derive(Debug, Clone)]
pub struct ScramKeys {
    pub client_key: Vec<u8>,
    pub server_key: Vec<u8>,
}

/// Volatile OIDC state for one credential. Valid access token means both
/// token and expiry are present and the expiry has not been reached.
#[derive(Debug, Default)]
pub struct OidcCacheEntry {
    pub access_token: Option<String>,
    pub access_token_expiry: Option<Instant>,
    pub refresh_token: Option<String>,
    pub idp_info: Option<IdpServerInfo>,
}

impl OidcCacheEntry {
    pub fn valid_access_token(&self) -> Option<String> {
        match (&self.access_token, self.access_token_expiry) {
            (Some(token), Some(expiry)) if Instant::now() < expiry => Some(token.clone()),
            _ => None,
        }
    }

    /// Caches a callback result, applying the expiry safety margin.
    pub fn store(&mut self, result: &OidcCallbackResult) {
        self.access_token = Some(result.access_token.clone());
        self.access_token_expiry = result.expires_in.map(|lifetime| {
            Instant::now() + lifetime.saturating_sub(ACCESS_TOKEN_EXPIRY_MARGIN)
        });
        if let Some(refresh) = &result.refresh_token {
            self.refresh_token = Some(refresh.clone());
        }
    }

    pub fn clear_access_token(&mut self) {
        self.access_token = None;
        self.access_token_expiry = None;
    }

    pub fn clear_refresh_token(&mut self) {
        self.refresh_token = None;
    }
}

/// Per-credential cache with its two locks: a plain mutex for general
/// key/value caching (SCRAM derived keys) and a reader-writer lock for the
/// OIDC entry, whose read path dominates during speculative-auth storms.
#[derive(Debug, Default)]
pub struct CredentialCache {
    scram: StdMutex<HashMap<ScramCacheKey, ScramKeys>>,
    pub oidc: RwLock<OidcCacheEntry>,
}

impl CredentialCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scram_keys(&self, key: &ScramCacheKey) -> Option<ScramKeys> {
        self.scram
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .cloned()
    }

    pub fn store_scram_keys(&self, key: ScramCacheKey, keys: ScramKeys) {
        self.scram
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key, keys);
    }
}
