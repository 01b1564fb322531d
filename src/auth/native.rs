// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Legacy non-SASL nonce authentication: request a nonce, then submit the
//! MD5 digest of nonce, username, and the password digest.

use std::fmt::Write as _;

use anyhow::{Result, anyhow};
use bson::doc;
use md5::{Digest as _, Md5};

use crate::{
    auth::credential::Credential,
    client::client::ClientConnection,
    context::operation::OperationContext,
    error::{ErrorKindExt, SecurityError},
    models::msg::request::CommandMessage,
};

fn md5_hex(input: &[u8]) -> String {
    let digest = Md5::digest(input);
    let mut s = String::with_capacity(digest.len() * 2);
    for b in digest {
        let _ = write!(&mut s, "{b:02x}");
    }
    s
}

/// `key = MD5(nonce + user + MD5(user + ":mongo:" + password))`, hex.
fn authentication_key(nonce: &str, username: &str, password: &str) -> String {
    let password_digest = md5_hex(format!("{username}:mongo:{password}").as_bytes());
    md5_hex(format!("{nonce}{username}{password_digest}").as_bytes())
}

pub async fn authenticate(
    conn: &ClientConnection,
    ctx: &OperationContext,
    credential: &Credential,
) -> Result<()> {
    let username = credential.username_or_err()?.to_string();
    let password = credential.password_or_err()?.to_string();

    let round = ctx.with_fresh_maintenance(conn.io_timeout());
    let nonce_reply = conn
        .run_command(&round, CommandMessage::new(&credential.source, doc! { "getnonce": 1 }))
        .await?;
    let nonce = nonce_reply
        .get_str("nonce")
        .map_err(|_| {
            anyhow!(SecurityError::SaslConversation {
                user: username.clone(),
                source_db: credential.source.clone(),
                message: "getnonce reply lacks a nonce".to_string(),
            })
        })?
        .to_string();

    let key = authentication_key(&nonce, &username, &password);
    let command = doc! {
        "authenticate": 1,
        "user": username.clone(),
        "nonce": nonce,
        "key": key,
    };

    let round = ctx.with_fresh_maintenance(conn.io_timeout());
    conn.run_command(&round, CommandMessage::new(&credential.source, command))
        .await
        .map_err(|e| {
            if e.command().is_some_and(|c| c.is_auth_failure()) {
                anyhow!(SecurityError::AuthenticationFailed {
                    user: username.clone(),
                    source_db: credential.source.clone(),
                    message: e.to_string(),
                })
            } else {
                e
            }
        })?;
    Ok(())
}
