// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use bson::doc;
use docdb_client_rs::{
    auth::{Authenticator, credential::Credential},
    cfg::{
        config::{
            AuthConfig, ClientMetadataConfig, CompressionConfig, Config,
            ConnectionConfig, ServerAddress, ServerApiConfig,
        },
        enums::{AuthMechanism, CompressorName},
    },
    client::handshake::HandshakeInitializer,
    context::operation::{Deadline, OperationContext},
    error::{ErrorKindExt, SecurityError},
    sdam::description::{ServerState, ServerType},
};

use crate::unit_tests::{connect_to, spawn_responder};

fn base_config() -> Config {
    Config {
        connection: ConnectionConfig {
            hosts: vec![ServerAddress::new("lb.example", 27017)],
            srv_host: None,
            load_balanced: true,
            connect_timeout: Duration::from_secs(2),
            io_timeout: Duration::from_secs(2),
            max_pool_size: 2,
        },
        auth: AuthConfig::default(),
        compression: CompressionConfig {
            compressors: vec![CompressorName::Zlib],
            zlib_level: Some(6),
        },
        client: ClientMetadataConfig {
            app_name: Some("unit-tests".to_string()),
        },
        proxy: None,
        server_api: None,
    }
}

fn hello_reply() -> bson::Document {
    doc! {
        "ok": 1,
        "isWritablePrimary": true,
        "helloOk": true,
        "maxBsonObjectSize": 16 * 1024 * 1024,
        "maxMessageSizeBytes": 48_000_000,
        "maxWriteBatchSize": 100_000,
        "maxWireVersion": 21,
        "minWireVersion": 0,
        "logicalSessionTimeoutMinutes": 30_i64,
        "connectionId": 4242_i64,
        "compression": ["zlib"],
        "serviceId": bson::oid::ObjectId::new(),
    }
}

#[tokio::test]
async fn greeting_builds_descriptions_and_negotiates_compression() -> Result<()> {
    let addr = spawn_responder(|command| {
        // Without a server api the greeting uses the legacy name.
        assert!(command.contains_key("isMaster"));
        assert_eq!(command.get_bool("helloOk").expect("helloOk"), true);
        assert_eq!(command.get_bool("loadBalanced").expect("lb"), true);

        let client = command.get_document("client").expect("client metadata");
        assert_eq!(
            client
                .get_document("application")
                .expect("application")
                .get_str("name")
                .expect("name"),
            "unit-tests"
        );
        assert!(client.get_document("driver").expect("driver").contains_key("version"));

        let compression = command.get_array("compression").expect("compression");
        assert_eq!(compression.len(), 1);

        hello_reply()
    })
    .await;

    let initializer = HandshakeInitializer::from_config(&base_config(), None);
    let conn = connect_to(addr).await?;
    let ctx = OperationContext::new(Deadline::after(Duration::from_secs(5)));

    let result = initializer.initialize(&conn, &ctx).await?;

    let cd = &result.connection_description;
    assert_eq!(cd.max_wire_version, 21);
    assert_eq!(cd.connection_id.server_assigned, Some(4242));
    assert!(cd.service_id.is_some());
    assert_eq!(cd.session_timeout_minutes, Some(30));
    assert_eq!(cd.limits().max_message_size, 48_000_000);

    let sd = &result.server_description;
    assert_eq!(sd.server_type, ServerType::Standalone);
    assert_eq!(sd.state, ServerState::Connected);
    assert_eq!(sd.min_rtt, Duration::ZERO);
    assert!(sd.supports_sessions);
    assert!(result.round_trip > Duration::ZERO);
    Ok(())
}

#[tokio::test]
async fn explicit_server_api_uses_the_modern_greeting() -> Result<()> {
    let addr = spawn_responder(|command| {
        assert!(command.contains_key("hello"));
        assert!(!command.contains_key("isMaster"));
        hello_reply()
    })
    .await;

    let mut cfg = base_config();
    cfg.server_api = Some(ServerApiConfig {
        version: "1".to_string(),
        strict: false,
        deprecation_errors: false,
    });

    let initializer = HandshakeInitializer::from_config(&cfg, None);
    let conn = connect_to(addr).await?;
    let ctx = OperationContext::new(Deadline::after(Duration::from_secs(5)));
    initializer.start(&conn, &ctx).await?;
    Ok(())
}

#[tokio::test]
async fn default_authenticator_advertises_supported_mechs() -> Result<()> {
    let addr = spawn_responder(|command| {
        assert_eq!(
            command.get_str("saslSupportedMechs").expect("mechs key"),
            "admin.alice"
        );
        // The default authenticator also speculates with SCRAM.
        let speculative = command
            .get_document("speculativeAuthenticate")
            .expect("speculative");
        assert_eq!(speculative.get_i32("saslStart").expect("saslStart"), 1);
        assert_eq!(
            speculative.get_str("mechanism").expect("mechanism"),
            "SCRAM-SHA-256"
        );
        assert_eq!(speculative.get_str("db").expect("db"), "admin");
        hello_reply()
    })
    .await;

    let credential = Credential::from_config(&AuthConfig {
        mechanism: None,
        source: "admin".to_string(),
        username: Some("alice".to_string()),
        password: Some("pencil".to_string()),
        allowed_hosts: None,
        token_file_env: None,
    });
    let initializer = HandshakeInitializer::from_config(
        &base_config(),
        Some(Arc::new(Authenticator::new(credential))),
    );

    let conn = connect_to(addr).await?;
    let ctx = OperationContext::new(Deadline::after(Duration::from_secs(5)));
    // Only the greeting phase; authentication is exercised elsewhere.
    initializer.start(&conn, &ctx).await?;
    Ok(())
}

#[tokio::test]
async fn unknown_user_remaps_to_a_security_error() -> Result<()> {
    let addr = spawn_responder(|_command| {
        doc! {
            "ok": 0,
            "code": 11,
            "codeName": "UserNotFound",
            "errmsg": "User \"admin.ghost\" not found",
        }
    })
    .await;

    let credential = Credential::from_config(&AuthConfig {
        mechanism: None,
        source: "admin".to_string(),
        username: Some("ghost".to_string()),
        password: Some("pw".to_string()),
        allowed_hosts: None,
        token_file_env: None,
    });
    let initializer = HandshakeInitializer::from_config(
        &base_config(),
        Some(Arc::new(Authenticator::new(credential))),
    );

    let conn = connect_to(addr).await?;
    let ctx = OperationContext::new(Deadline::after(Duration::from_secs(5)));
    let err = initializer.start(&conn, &ctx).await.expect_err("no such user");
    match err.security() {
        Some(SecurityError::PrincipalLookup { user, .. }) => assert_eq!(user, "ghost"),
        other => panic!("expected a principal-lookup error, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn explicit_mechanism_omits_sasl_supported_mechs() -> Result<()> {
    let addr = spawn_responder(|command| {
        assert!(!command.contains_key("saslSupportedMechs"));
        hello_reply()
    })
    .await;

    let credential = Credential::from_config(&AuthConfig {
        mechanism: Some(AuthMechanism::ScramSha256),
        source: "admin".to_string(),
        username: Some("alice".to_string()),
        password: Some("pencil".to_string()),
        allowed_hosts: None,
        token_file_env: None,
    });
    let initializer = HandshakeInitializer::from_config(
        &base_config(),
        Some(Arc::new(Authenticator::new(credential))),
    );

    let conn = connect_to(addr).await?;
    let ctx = OperationContext::new(Deadline::after(Duration::from_secs(5)));
    initializer.start(&conn, &ctx).await?;
    Ok(())
}
