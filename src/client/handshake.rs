// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Connection bring-up: the greeting command, description synthesis, and
//! the authentication rounds.
//!
//! The handshake is split into `start` (greeting) and `finish`
//! (authentication) so parallel pool warming can interleave the two
//! phases across connections.

use std::{sync::Arc, time::Duration};

use anyhow::{Result, anyhow};
use bson::{Document, doc};
use tokio::time::Instant;

use crate::{
    auth::Authenticator,
    cfg::{
        config::{ClientMetadataConfig, Config, ServerApiConfig},
        enums::CompressorName,
    },
    client::client::ClientConnection,
    context::operation::OperationContext,
    error::{ErrorKindExt, SecurityError, USER_NOT_FOUND_CODE},
    models::{compressed::Compressor, msg::request::CommandMessage},
    sdam::description::{ConnectionDescription, HelloReply, ServerDescription},
};

/// Ceiling on the serialized client metadata document.
const MAX_CLIENT_METADATA_SIZE: usize = 512;

const DRIVER_NAME: &str = "docdb-client-rs";

/// Everything the greeting + auth rounds need, assembled once per client.
pub struct HandshakeInitializer {
    client_metadata: Document,
    compressors: Vec<CompressorName>,
    zlib_level: Option<u32>,
    load_balanced: bool,
    server_api: Option<ServerApiConfig>,
    authenticator: Option<Arc<Authenticator>>,
}

/// What one completed greeting yields.
#[derive(Debug)]
pub struct HandshakeResult {
    pub connection_description: ConnectionDescription,
    pub server_description: ServerDescription,
    pub hello: HelloReply,
    pub round_trip: Duration,
}

impl HandshakeInitializer {
    pub fn from_config(cfg: &Config, authenticator: Option<Arc<Authenticator>>) -> Self {
        Self {
            client_metadata: build_client_metadata(&cfg.client),
            compressors: cfg.compression.compressors.clone(),
            zlib_level: cfg.compression.zlib_level,
            load_balanced: cfg.connection.load_balanced,
            server_api: cfg.server_api.clone(),
            authenticator,
        }
    }

    /// The modern command name requires an explicit server api; otherwise
    /// the legacy greeting keeps pre-hello servers happy.
    fn greeting_name(&self) -> &'static str {
        if self.server_api.is_some() {
            "hello"
        } else {
            "isMaster"
        }
    }

    fn build_greeting(&self) -> Document {
        let mut greeting = Document::new();
        greeting.insert(self.greeting_name(), 1);
        greeting.insert("helloOk", true);
        if !self.client_metadata.is_empty() {
            greeting.insert("client", self.client_metadata.clone());
        }
        if self.load_balanced {
            greeting.insert("loadBalanced", true);
        }
        if !self.compressors.is_empty() {
            let names: Vec<String> =
                self.compressors.iter().map(|c| c.to_string()).collect();
            greeting.insert("compression", names);
        }
        if let Some(auth) = &self.authenticator {
            if auth.wants_sasl_supported_mechs()
                && let Some(key) = auth.credential().user_source_key()
            {
                greeting.insert("saslSupportedMechs", key);
            }
            if let Some(speculative) = auth.speculative_command() {
                greeting.insert("speculativeAuthenticate", speculative);
            }
        }
        greeting
    }

    /// Phase one: run the greeting, synthesize both descriptions, install
    /// them on the connection, and negotiate compression.
    pub async fn start(
        &self,
        conn: &ClientConnection,
        ctx: &OperationContext,
    ) -> Result<HandshakeResult> {
        let greeting = self.build_greeting();
        let asked_sasl_supported = greeting.contains_key("saslSupportedMechs");

        let started = Instant::now();
        let reply_doc = conn
            .run_command(ctx, CommandMessage::new("admin", greeting))
            .await
            .map_err(|e| self.remap_user_not_found(asked_sasl_supported, e))?;
        let round_trip = started.elapsed();

        let hello: HelloReply = bson::from_document(reply_doc)?;

        if let Some(auth) = &self.authenticator {
            auth.consume_speculative_response(hello.speculative_authenticate.clone());
        }

        let connection_id = conn.description().connection_id;
        let connection_description = ConnectionDescription::from_hello(connection_id, &hello);
        conn.install_description(connection_description.clone());
        conn.set_compressor(self.negotiate_compressor(&hello));

        // Initial minimum round trip is zero until the sampler has seen
        // enough data.
        let server_description = ServerDescription::from_hello(conn.address().clone(), &hello);

        Ok(HandshakeResult {
            connection_description,
            server_description,
            hello,
            round_trip,
        })
    }

    /// Phase two: authentication, when a credential is configured.
    pub async fn finish(
        &self,
        conn: &ClientConnection,
        ctx: &OperationContext,
        hello: &HelloReply,
    ) -> Result<()> {
        match &self.authenticator {
            Some(auth) => auth.authenticate(conn, ctx, hello).await,
            None => Ok(()),
        }
    }

    /// The whole handshake in one call, for callers without warm-up
    /// parallelism.
    pub async fn initialize(
        &self,
        conn: &ClientConnection,
        ctx: &OperationContext,
    ) -> Result<HandshakeResult> {
        let result = self.start(conn, ctx).await?;
        self.finish(conn, ctx, &result.hello).await?;
        Ok(result)
    }

    /// First client-ordered compressor the server also speaks.
    fn negotiate_compressor(&self, hello: &HelloReply) -> Option<Compressor> {
        self.compressors
            .iter()
            .find(|c| hello.compression.iter().any(|s| s == c.as_str()))
            .and_then(|name| Compressor::from_name(*name, self.zlib_level))
    }

    /// An unknown-user error on a greeting that asked for supported
    /// mechanisms is an authentication problem, not a server problem.
    fn remap_user_not_found(&self, asked: bool, e: anyhow::Error) -> anyhow::Error {
        if !asked {
            return e;
        }
        let Some(command_error) = e.command() else {
            return e;
        };
        if command_error.code != USER_NOT_FOUND_CODE {
            return e;
        }
        let user = self
            .authenticator
            .as_ref()
            .and_then(|a| a.credential().username.clone())
            .unwrap_or_default();
        anyhow!(SecurityError::PrincipalLookup {
            user,
            message: e.to_string(),
        })
    }
}

/// The `client` document reported with the greeting. Oversized metadata
/// sheds optional fields (platform first, then os detail, then the
/// application name) until it fits the handshake budget.
fn build_client_metadata(cfg: &ClientMetadataConfig) -> Document {
    let mut metadata = doc! {
        "driver": {
            "name": DRIVER_NAME,
            "version": env!("CARGO_PKG_VERSION"),
        },
        "os": {
            "type": std::env::consts::OS,
            "architecture": std::env::consts::ARCH,
        },
        "platform": "rust (edition 2024)",
    };
    if let Some(app) = &cfg.app_name {
        metadata.insert("application", doc! { "name": app.clone() });
    }

    let fits = |d: &Document| {
        bson::to_vec(d).map(|b| b.len() <= MAX_CLIENT_METADATA_SIZE).unwrap_or(false)
    };
    if fits(&metadata) {
        return metadata;
    }
    metadata.remove("platform");
    if fits(&metadata) {
        return metadata;
    }
    metadata.insert("os", doc! { "type": std::env::consts::OS });
    if fits(&metadata) {
        return metadata;
    }
    metadata.remove("application");
    metadata
}
