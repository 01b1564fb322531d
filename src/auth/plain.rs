// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Result, bail};

use crate::{
    auth::{credential::Credential, sasl::SaslClient},
    cfg::enums::AuthMechanism,
    error::ProtocolError,
};

/// RFC 4616 PLAIN: a single `\0user\0password` message, no server
/// challenges.
pub struct PlainClient {
    username: String,
    password: String,
    complete: bool,
}

impl PlainClient {
    pub fn new(credential: &Credential) -> Result<Self> {
        Ok(Self {
            username: credential.username_or_err()?.to_string(),
            password: credential.password_or_err()?.to_string(),
            complete: false,
        })
    }
}

impl SaslClient for PlainClient {
    fn mechanism(&self) -> AuthMechanism {
        AuthMechanism::Plain
    }

    fn initial_payload(&mut self) -> Result<Vec<u8>> {
        let mut payload = Vec::with_capacity(self.username.len() + self.password.len() + 2);
        payload.push(0);
        payload.extend_from_slice(self.username.as_bytes());
        payload.push(0);
        payload.extend_from_slice(self.password.as_bytes());
        self.complete = true;
        Ok(payload)
    }

    fn step(&mut self, _challenge: &[u8]) -> Result<Option<Vec<u8>>> {
        bail!(ProtocolError::Sasl(
            "PLAIN exchanges have no continuation".to_string()
        ))
    }

    fn is_complete(&self) -> bool {
        self.complete
    }

    fn dispose(&mut self) {
        self.password.clear();
    }
}
