// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! SCRAM-SHA-1 / SCRAM-SHA-256 (RFC 5802) client side.
//!
//! SHA-1 derives its password from the legacy `user:mongo:password` MD5
//! digest; SHA-256 runs the raw password through SASLprep. The expensive
//! PBKDF2 products are cached per (password digest, salt, iterations) so
//! reconnect storms do not redo the key stretching.

use std::{collections::HashMap, fmt::Write as _, sync::Arc};

use anyhow::{Context, Result, anyhow, bail};
use base64::{Engine, engine::general_purpose::STANDARD as B64};
use bson::{Document, doc};
use hmac::{Hmac, Mac};
use md5::{Digest as _, Md5};
use rand::RngExt;
use sha1::Sha1;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::{
    auth::{
        cache::{CredentialCache, ScramCacheKey, ScramKeys},
        credential::Credential,
        sasl::SaslClient,
    },
    cfg::enums::AuthMechanism,
    error::{ProtocolError, SecurityError},
};

/// Iteration counts below this are rejected outright.
pub const MIN_ITERATION_COUNT: u32 = 4096;

const CLIENT_KEY_INPUT: &[u8] = b"Client Key";
const SERVER_KEY_INPUT: &[u8] = b"Server Key";
const GS2_HEADER: &str = "n,,";
const CHANNEL_BINDING: &str = "c=biws";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScramVariant {
    Sha1,
    Sha256,
}

impl ScramVariant {
    pub fn mechanism(&self) -> AuthMechanism {
        match self {
            ScramVariant::Sha1 => AuthMechanism::ScramSha1,
            ScramVariant::Sha256 => AuthMechanism::ScramSha256,
        }
    }

    fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            ScramVariant::Sha1 => Sha1::digest(data).to_vec(),
            ScramVariant::Sha256 => Sha256::digest(data).to_vec(),
        }
    }

    fn hmac(&self, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        Ok(match self {
            ScramVariant::Sha1 => {
                let mut mac = Hmac::<Sha1>::new_from_slice(key)
                    .map_err(|e| anyhow!("hmac key: {e}"))?;
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            },
            ScramVariant::Sha256 => {
                let mut mac = Hmac::<Sha256>::new_from_slice(key)
                    .map_err(|e| anyhow!("hmac key: {e}"))?;
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            },
        })
    }

    fn salted_password(
        &self,
        password: &[u8],
        salt: &[u8],
        iterations: u32,
    ) -> Result<Vec<u8>> {
        Ok(match self {
            ScramVariant::Sha1 => {
                let mut out = [0u8; 20];
                pbkdf2::pbkdf2::<Hmac<Sha1>>(password, salt, iterations, &mut out)
                    .map_err(|e| anyhow!("pbkdf2: {e}"))?;
                out.to_vec()
            },
            ScramVariant::Sha256 => {
                let mut out = [0u8; 32];
                pbkdf2::pbkdf2::<Hmac<Sha256>>(password, salt, iterations, &mut out)
                    .map_err(|e| anyhow!("pbkdf2: {e}"))?;
                out.to_vec()
            },
        })
    }
}

/// Escape `=` and `,` in the SCRAM username per RFC 5802.
fn escape_username(username: &str) -> String {
    username.replace('=', "=3D").replace(',', "=2C")
}

fn md5_hex(input: &[u8]) -> String {
    let digest = Md5::digest(input);
    let mut s = String::with_capacity(digest.len() * 2);
    for b in digest {
        let _ = write!(&mut s, "{b:02x}");
    }
    s
}

fn parse_scram_fields(message: &str) -> HashMap<&str, &str> {
    message
        .split(',')
        .filter_map(|kv| kv.split_once('='))
        .collect()
}

fn generate_nonce() -> String {
    let mut bytes = [0u8; 24];
    rand::rng().fill(&mut bytes);
    B64.encode(bytes)
}

fn xor(a: &[u8], b: &[u8]) -> Vec<u8> {
    a.iter().zip(b.iter()).map(|(x, y)| x ^ y).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScramState {
    Initial,
    FirstSent,
    ProofSent,
    Done,
}

pub struct ScramClient {
    variant: ScramVariant,
    username: String,
    password: String,
    client_nonce: String,
    cache: Arc<CredentialCache>,
    state: ScramState,
    client_first_bare: String,
    server_signature_b64: String,
    source: String,
}

impl ScramClient {
    pub fn new(variant: ScramVariant, credential: &Credential) -> Result<Self> {
        let username = credential.username_or_err()?.to_string();
        let password = credential.password_or_err()?.to_string();
        Ok(Self {
            variant,
            client_nonce: generate_nonce(),
            cache: Arc::clone(&credential.cache),
            state: ScramState::Initial,
            client_first_bare: String::new(),
            server_signature_b64: String::new(),
            source: credential.source.clone(),
            username,
            password,
        })
    }

    /// Mechanism-processed password: the legacy MD5 digest for SHA-1, the
    /// SASLprep normalization for SHA-256.
    fn prepared_password(&self) -> Result<Vec<u8>> {
        match self.variant {
            ScramVariant::Sha1 => {
                let input = format!("{}:mongo:{}", self.username, self.password);
                Ok(md5_hex(input.as_bytes()).into_bytes())
            },
            ScramVariant::Sha256 => {
                let prepped = stringprep::saslprep(&self.password)
                    .map_err(|e| self.security_error(format!("saslprep: {e}")))?;
                Ok(prepped.as_bytes().to_vec())
            },
        }
    }

    fn security_error(&self, message: impl Into<String>) -> anyhow::Error {
        anyhow!(SecurityError::SaslConversation {
            user: self.username.clone(),
            source_db: self.source.clone(),
            message: message.into(),
        })
    }

    fn derive_keys(&self, salt: &[u8], iterations: u32) -> Result<ScramKeys> {
        let password = self.prepared_password()?;

        let mut digest_input = password.clone();
        digest_input.extend_from_slice(salt);
        let cache_key = ScramCacheKey {
            password_and_salt_digest: self.variant.digest(&digest_input),
            salt: salt.to_vec(),
            iterations,
        };

        if let Some(keys) = self.cache.scram_keys(&cache_key) {
            return Ok(keys);
        }

        let salted = self.variant.salted_password(&password, salt, iterations)?;
        let keys = ScramKeys {
            client_key: self.variant.hmac(&salted, CLIENT_KEY_INPUT)?,
            server_key: self.variant.hmac(&salted, SERVER_KEY_INPUT)?,
        };
        self.cache.store_scram_keys(cache_key, keys.clone());
        Ok(keys)
    }

    fn handle_server_first(&mut self, challenge: &[u8]) -> Result<Vec<u8>> {
        let server_first = std::str::from_utf8(challenge)
            .context("server-first message is not UTF-8")?
            .to_string();
        let fields = parse_scram_fields(&server_first);

        let server_nonce = fields
            .get("r")
            .ok_or_else(|| self.security_error("server-first message lacks a nonce"))?
            .to_string();
        if !server_nonce.starts_with(&self.client_nonce) {
            return Err(
                self.security_error("server nonce does not begin with the client nonce")
            );
        }

        let iterations: u32 = fields
            .get("i")
            .ok_or_else(|| self.security_error("server-first message lacks an iteration count"))?
            .parse()
            .map_err(|_| self.security_error("iteration count is not a number"))?;
        if iterations < MIN_ITERATION_COUNT {
            return Err(self.security_error(format!(
                "iteration count {iterations} below the {MIN_ITERATION_COUNT} minimum"
            )));
        }

        let salt = B64
            .decode(
                fields
                    .get("s")
                    .ok_or_else(|| self.security_error("server-first message lacks a salt"))?,
            )
            .map_err(|e| self.security_error(format!("salt is not base64: {e}")))?;

        let keys = self.derive_keys(&salt, iterations)?;

        let client_final_without_proof = format!("{CHANNEL_BINDING},r={server_nonce}");
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare, server_first, client_final_without_proof
        );

        let stored_key = self.variant.digest(&keys.client_key);
        let client_signature = self.variant.hmac(&stored_key, auth_message.as_bytes())?;
        let client_proof = xor(&keys.client_key, &client_signature);

        self.server_signature_b64 =
            B64.encode(self.variant.hmac(&keys.server_key, auth_message.as_bytes())?);

        let payload = format!(
            "{client_final_without_proof},p={}",
            B64.encode(client_proof)
        );
        self.state = ScramState::ProofSent;
        Ok(payload.into_bytes())
    }

    fn handle_server_final(&mut self, challenge: &[u8]) -> Result<()> {
        let server_final =
            std::str::from_utf8(challenge).context("server-final message is not UTF-8")?;
        let fields = parse_scram_fields(server_final);

        if let Some(e) = fields.get("e") {
            return Err(self.security_error(format!("server rejected the proof: {e}")));
        }

        let v = fields
            .get("v")
            .ok_or_else(|| self.security_error("server-final message lacks a signature"))?;
        let theirs = B64
            .decode(v)
            .map_err(|e| self.security_error(format!("signature is not base64: {e}")))?;
        let ours = B64
            .decode(&self.server_signature_b64)
            .map_err(|e| self.security_error(format!("stored signature corrupt: {e}")))?;

        if !bool::from(theirs.ct_eq(&ours)) {
            return Err(self.security_error("server signature mismatch"));
        }
        self.state = ScramState::Done;
        Ok(())
    }
}

impl SaslClient for ScramClient {
    fn mechanism(&self) -> AuthMechanism {
        self.variant.mechanism()
    }

    fn initial_payload(&mut self) -> Result<Vec<u8>> {
        let bare = format!(
            "n={},r={}",
            escape_username(&self.username),
            self.client_nonce
        );
        self.client_first_bare = bare.clone();
        self.state = ScramState::FirstSent;
        Ok(format!("{GS2_HEADER}{bare}").into_bytes())
    }

    fn step(&mut self, challenge: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.state {
            ScramState::FirstSent => Ok(Some(self.handle_server_first(challenge)?)),
            ScramState::ProofSent => {
                self.handle_server_final(challenge)?;
                // Empty client-final for servers that run the full
                // exchange instead of skipping it.
                Ok(Some(Vec::new()))
            },
            ScramState::Initial | ScramState::Done => {
                bail!(ProtocolError::Sasl(format!(
                    "challenge in unexpected state {:?}",
                    self.state
                )))
            },
        }
    }

    fn is_complete(&self) -> bool {
        self.state == ScramState::Done
    }

    fn decorate_start(&self, command: &mut Document) {
        command.insert("options", doc! { "skipEmptyExchange": true });
    }

    fn dispose(&mut self) {
        self.password.clear();
        self.server_signature_b64.clear();
    }
}
