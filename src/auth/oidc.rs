// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! MONGODB-OIDC: token-based authentication with a three-phase fallback.
//!
//! Phase 1 replays a cached, unexpired access token. Phase 2 trades a
//! cached refresh token for a new one via the refresh callback. Phase 3
//! obtains the identity-provider info (from cache, a speculative round, or
//! a principal-name request) and runs the request callback. A server-side
//! authentication failure (code 18) on an earlier phase invalidates that
//! phase's cache and falls through; the state machine never loops back.
//!
//! The whole attempt holds the credential cache's OIDC writer lock, which
//! serializes concurrent attempts that may mutate the cache.

use anyhow::{Result, anyhow, bail};
use bson::{Binary, Bson, Document, doc, spec::BinarySubtype};
use tokio::time::timeout;
use tracing::debug;

use crate::{
    auth::{
        credential::{
            Credential, IdpServerInfo, OIDC_CALLBACK_TIMEOUT, OidcCallback,
            OidcCallbackContext, OidcCallbackResult,
        },
        sasl::SaslReply,
    },
    cfg::enums::AuthMechanism,
    client::client::ClientConnection,
    context::operation::OperationContext,
    error::{Cancellation, ConfigurationError, ErrorKindExt, ProtocolError, SecurityError},
    models::msg::request::CommandMessage,
};

fn binary(bytes: Vec<u8>) -> Bson {
    Bson::Binary(Binary {
        subtype: BinarySubtype::Generic,
        bytes,
    })
}

fn jwt_payload(token: &str) -> Result<Vec<u8>> {
    Ok(bson::to_vec(&doc! { "jwt": token })?)
}

fn principal_payload(username: &str) -> Result<Vec<u8>> {
    Ok(bson::to_vec(&doc! { "n": username })?)
}

fn start_command(payload: Vec<u8>) -> Document {
    doc! {
        "saslStart": 1,
        "mechanism": AuthMechanism::Oidc.as_str(),
        "payload": binary(payload),
    }
}

fn is_auth_failure(e: &anyhow::Error) -> bool {
    e.command().is_some_and(|c| c.is_auth_failure())
}

async fn send_round(
    conn: &ClientConnection,
    ctx: &OperationContext,
    credential: &Credential,
    command: Document,
) -> Result<SaslReply> {
    let round = ctx.with_fresh_maintenance(conn.io_timeout());
    let reply = conn
        .run_command(&round, CommandMessage::new(&credential.source, command))
        .await?;
    SaslReply::from_document(&reply)
}

/// Sends an access token as a JWT `saslStart` and requires the server to
/// finish in that single round.
async fn send_jwt(
    conn: &ClientConnection,
    ctx: &OperationContext,
    credential: &Credential,
    token: &str,
) -> Result<()> {
    let reply = send_round(conn, ctx, credential, start_command(jwt_payload(token)?)).await?;
    if !reply.done {
        bail!(ProtocolError::Sasl(
            "server did not complete the JWT exchange".to_string()
        ));
    }
    Ok(())
}

async fn invoke_callback(
    callback: &OidcCallback,
    context: OidcCallbackContext,
    what: &'static str,
) -> Result<OidcCallbackResult> {
    match timeout(OIDC_CALLBACK_TIMEOUT, callback(context)).await {
        Ok(result) => result,
        Err(_) => Err(anyhow!(Cancellation::deadline_with(format!(
            "{what} callback exceeded its budget"
        )))),
    }
}

/// The speculative payload embedded into the greeting, when the cache
/// permits one: a valid token rides as a JWT; with nothing cached and no
/// automatic provider, a principal-name request saves the 3a round.
pub fn speculative_command(credential: &Credential) -> Option<Document> {
    let entry = credential.cache.oidc.try_read().ok()?;
    if let Some(token) = entry.valid_access_token() {
        let payload = jwt_payload(&token).ok()?;
        let mut cmd = start_command(payload);
        cmd.insert("db", credential.source.clone());
        return Some(cmd);
    }
    if entry.idp_info.is_none() && credential.token_file_env.is_none() {
        let username = credential.username.clone()?;
        let payload = principal_payload(&username).ok()?;
        let mut cmd = start_command(payload);
        cmd.insert("db", credential.source.clone());
        return Some(cmd);
    }
    None
}

/// Re-authentication on an already-opened connection: identical to
/// authentication except the fallback state is always reset first.
pub async fn reauthenticate(
    conn: &ClientConnection,
    ctx: &OperationContext,
    credential: &Credential,
) -> Result<()> {
    authenticate(conn, ctx, credential, None, true).await
}

pub async fn authenticate(
    conn: &ClientConnection,
    ctx: &OperationContext,
    credential: &Credential,
    speculative_response: Option<Document>,
    reset_fallback: bool,
) -> Result<()> {
    let address = conn.address().clone();
    let mut entry = credential.cache.oidc.write().await;

    if reset_fallback {
        entry.clear_access_token();
    }

    // A finished speculative round means the greeting already
    // authenticated us.
    let mut continuation: Option<Bson> = None;
    if let Some(response) = speculative_response {
        let reply = SaslReply::from_document(&response)?;
        if reply.done {
            return Ok(());
        }
        if entry.idp_info.is_none()
            && !reply.payload.is_empty()
            && let Ok(info) = bson::from_slice::<IdpServerInfo>(&reply.payload)
        {
            entry.idp_info = Some(info);
        }
        continuation = Some(reply.conversation_id);
    }

    // Phase 1: cached access token.
    if let Some(token) = entry.valid_access_token() {
        match send_jwt(conn, ctx, credential, &token).await {
            Ok(()) => return Ok(()),
            Err(e) if is_auth_failure(&e) => {
                debug!("cached OIDC access token rejected, invalidating");
                entry.clear_access_token();
            },
            Err(e) => return Err(e),
        }
    }

    // Phase 2: refresh.
    if let (Some(refresh_cb), Some(refresh_token)) = (
        credential.oidc_refresh_callback.clone(),
        entry.refresh_token.clone(),
    ) {
        credential.check_host_allowed(&address)?;
        let result = invoke_callback(
            &refresh_cb,
            OidcCallbackContext {
                timeout: OIDC_CALLBACK_TIMEOUT,
                refresh_token: Some(refresh_token),
                idp_info: entry.idp_info.clone(),
            },
            "OIDC refresh",
        )
        .await?;
        entry.store(&result);

        match send_jwt(conn, ctx, credential, &result.access_token).await {
            Ok(()) => return Ok(()),
            Err(e) if is_auth_failure(&e) => {
                debug!("refreshed OIDC access token rejected, invalidating");
                entry.clear_access_token();
                entry.clear_refresh_token();
            },
            Err(e) => return Err(e),
        }
    }

    // Phase 3: automatic providers bypass callbacks and read the token
    // from an environment-named file.
    if let Some(env) = &credential.token_file_env {
        let path = std::env::var(env).map_err(|_| {
            anyhow!(ConfigurationError::Other(format!(
                "automatic OIDC provider: environment variable {env} is unset"
            )))
        })?;
        let token = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| {
                anyhow!(ConfigurationError::Other(format!(
                    "automatic OIDC provider: cannot read token file {path}: {e}"
                )))
            })?;
        return send_jwt(conn, ctx, credential, token.trim())
            .await
            .map_err(|e| wrap_auth_failure(credential, e));
    }

    let request_cb = credential.oidc_request_callback.clone().ok_or_else(|| {
        anyhow!(ConfigurationError::Other(
            "MONGODB-OIDC requires a request callback or an automatic provider".to_string()
        ))
    })?;

    // Phase 3a: obtain the identity-provider info if it is not yet known.
    let idp_info = match entry.idp_info.clone() {
        Some(info) => info,
        None => {
            let username = credential.username_or_err()?.to_string();
            let reply = send_round(
                conn,
                ctx,
                credential,
                start_command(principal_payload(&username)?),
            )
            .await?;
            let info: IdpServerInfo = bson::from_slice(&reply.payload).map_err(|e| {
                anyhow!(ProtocolError::Sasl(format!(
                    "identity-provider info does not parse: {e}"
                )))
            })?;
            entry.idp_info = Some(info.clone());
            continuation = (!reply.done).then_some(reply.conversation_id);
            info
        },
    };

    // Phase 3b: run the request callback and submit its token. A done 3a
    // conversation starts over with saslStart; an open one continues.
    credential.check_host_allowed(&address)?;
    let result = invoke_callback(
        &request_cb,
        OidcCallbackContext {
            timeout: OIDC_CALLBACK_TIMEOUT,
            refresh_token: entry.refresh_token.clone(),
            idp_info: Some(idp_info),
        },
        "OIDC request",
    )
    .await?;
    entry.store(&result);

    let reply = match continuation {
        Some(conversation_id) => {
            send_round(
                conn,
                ctx,
                credential,
                doc! {
                    "saslContinue": 1,
                    "conversationId": conversation_id,
                    "payload": binary(jwt_payload(&result.access_token)?),
                },
            )
            .await
        },
        None => {
            send_round(
                conn,
                ctx,
                credential,
                start_command(jwt_payload(&result.access_token)?),
            )
            .await
        },
    }
    .map_err(|e| wrap_auth_failure(credential, e))?;

    if !reply.done {
        bail!(ProtocolError::Sasl(
            "server did not complete the OIDC exchange".to_string()
        ));
    }
    Ok(())
}

fn wrap_auth_failure(credential: &Credential, e: anyhow::Error) -> anyhow::Error {
    if is_auth_failure(&e) {
        anyhow!(SecurityError::AuthenticationFailed {
            user: credential.username.clone().unwrap_or_default(),
            source_db: credential.source.clone(),
            message: e.to_string(),
        })
    } else {
        e
    }
}
