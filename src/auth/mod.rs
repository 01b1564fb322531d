// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod cache;
pub mod credential;
pub mod native;
pub mod oidc;
pub mod plain;
pub mod sasl;
pub mod scram;

use std::sync::Mutex as StdMutex;

use anyhow::{Result, anyhow};
use bson::Document;

use crate::{
    auth::{
        credential::Credential,
        plain::PlainClient,
        sasl::{SaslClient, SaslMechanismClient, run_sasl_conversation, sasl_start_command},
        scram::{ScramClient, ScramVariant},
    },
    cfg::enums::AuthMechanism,
    client::client::ClientConnection,
    context::operation::OperationContext,
    error::SecurityError,
    sdam::description::HelloReply,
};

#[derive(Default)]
struct SpeculativeState {
    /// The mechanism client that produced the speculative payload; kept so
    /// the conversation continues with the same nonce.
    client: Option<SaslMechanismClient>,
    /// The server's speculative response. Consumed exactly once.
    response: Option<Document>,
}

/// Ties a credential to the mechanism flows. One authenticator lives per
/// connection handshake; the credential and its cache are shared.
pub struct Authenticator {
    credential: Credential,
    speculative: StdMutex<SpeculativeState>,
}

impl Authenticator {
    pub fn new(credential: Credential) -> Self {
        Self {
            credential,
            speculative: StdMutex::new(SpeculativeState::default()),
        }
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    /// The mechanism-auto-selecting default advertises
    /// `saslSupportedMechs` in the greeting.
    pub fn wants_sasl_supported_mechs(&self) -> bool {
        self.credential.mechanism.is_none() && self.credential.username.is_some()
    }

    /// Builds the speculative-authenticate payload for the greeting, when
    /// the mechanism offers one, and parks the mechanism state until the
    /// response comes back.
    pub fn speculative_command(&self) -> Option<Document> {
        let variant = match self.credential.mechanism {
            // The auto-selecting default speculates with its preferred
            // mechanism; a mismatch after negotiation falls back cleanly.
            None | Some(AuthMechanism::ScramSha256) => ScramVariant::Sha256,
            Some(AuthMechanism::ScramSha1) => ScramVariant::Sha1,
            Some(AuthMechanism::Oidc) => {
                return oidc::speculative_command(&self.credential);
            },
            Some(AuthMechanism::Plain) | Some(AuthMechanism::NativeCr) => return None,
        };

        let mut client = ScramClient::new(variant, &self.credential).ok()?;
        let payload = client.initial_payload().ok()?;
        let mut command = sasl_start_command(&client, payload);
        command.insert("db", self.credential.source.clone());

        let mut state = lock(&self.speculative);
        state.client = Some(SaslMechanismClient::Scram(client));
        state.response = None;
        Some(command)
    }

    /// Hands over the `speculativeAuthenticate` subdocument of the
    /// greeting response, if the server produced one.
    pub fn consume_speculative_response(&self, response: Option<Document>) {
        lock(&self.speculative).response = response;
    }

    fn take_speculative(&self) -> SpeculativeState {
        std::mem::take(&mut *lock(&self.speculative))
    }

    fn negotiate_mechanism(&self, hello: &HelloReply) -> AuthMechanism {
        if let Some(m) = self.credential.mechanism {
            return m;
        }
        let listed = |name: &str| hello.sasl_supported_mechs.iter().any(|m| m == name);
        if hello.sasl_supported_mechs.is_empty()
            || listed(AuthMechanism::ScramSha256.as_str())
        {
            AuthMechanism::ScramSha256
        } else {
            AuthMechanism::ScramSha1
        }
    }

    /// Runs the selected mechanism to completion on a freshly-greeted
    /// connection.
    pub async fn authenticate(
        &self,
        conn: &ClientConnection,
        ctx: &OperationContext,
        hello: &HelloReply,
    ) -> Result<()> {
        let mechanism = self.negotiate_mechanism(hello);
        let speculative = self.take_speculative();

        // The parked client only survives if negotiation kept its
        // mechanism; otherwise the normal flow starts from scratch.
        let (parked_client, speculative_response) = match speculative.client {
            Some(client) if client.mechanism() == mechanism => {
                (Some(client), speculative.response)
            },
            _ if mechanism == AuthMechanism::Oidc => (None, speculative.response),
            _ => (None, None),
        };

        match mechanism {
            AuthMechanism::Plain => {
                let mut client =
                    SaslMechanismClient::Plain(PlainClient::new(&self.credential)?);
                run_sasl_conversation(conn, ctx, &self.credential, &mut client, None).await
            },
            AuthMechanism::ScramSha1 | AuthMechanism::ScramSha256 => {
                let variant = if mechanism == AuthMechanism::ScramSha1 {
                    ScramVariant::Sha1
                } else {
                    ScramVariant::Sha256
                };
                let mut client = match parked_client {
                    Some(client) => client,
                    None => SaslMechanismClient::Scram(ScramClient::new(
                        variant,
                        &self.credential,
                    )?),
                };
                run_sasl_conversation(
                    conn,
                    ctx,
                    &self.credential,
                    &mut client,
                    speculative_response,
                )
                .await
            },
            AuthMechanism::NativeCr => native::authenticate(conn, ctx, &self.credential).await,
            AuthMechanism::Oidc => {
                oidc::authenticate(conn, ctx, &self.credential, speculative_response, false)
                    .await
            },
        }
    }

    /// Re-authentication on an opened connection. Only OIDC supports it;
    /// it always resets the fallback state.
    pub async fn reauthenticate(
        &self,
        conn: &ClientConnection,
        ctx: &OperationContext,
    ) -> Result<()> {
        match self.credential.mechanism {
            Some(AuthMechanism::Oidc) => {
                oidc::reauthenticate(conn, ctx, &self.credential).await
            },
            other => Err(anyhow!(SecurityError::MechanismUnsupported {
                mechanism: format!(
                    "reauthentication is not supported for {}",
                    other.map(|m| m.to_string()).unwrap_or_else(|| "default".to_string())
                ),
            })),
        }
    }
}

fn lock<T>(m: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
