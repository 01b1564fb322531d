// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::{Context, Result};
use docdb_client_rs::cfg::{
    config::{Config, ServerAddress, resolve_config_path},
    enums::{AuthMechanism, CompressorName},
};

#[test]
fn config_loads_and_validates() -> Result<()> {
    let cfg = resolve_config_path("tests/config.yaml")
        .and_then(Config::load_from_file)
        .context("failed to resolve or load config")?;

    assert_eq!(
        cfg.connection.hosts,
        vec![ServerAddress::new("localhost", 27017)]
    );
    assert_eq!(cfg.connection.connect_timeout, Duration::from_secs(5));
    assert_eq!(cfg.connection.io_timeout, Duration::from_secs(10));
    assert_eq!(cfg.connection.max_pool_size, 4);

    assert_eq!(cfg.auth.mechanism, Some(AuthMechanism::ScramSha256));
    assert_eq!(cfg.auth.source, "admin");
    assert_eq!(cfg.auth.username.as_deref(), Some("alice"));

    assert_eq!(cfg.compression.compressors, vec![CompressorName::Zlib]);
    assert_eq!(cfg.compression.zlib_level, Some(6));

    let proxy = cfg.proxy.as_ref().expect("proxy block");
    assert_eq!(proxy.address(), ServerAddress::new("127.0.0.1", 1080));
    assert_eq!(proxy.credentials(), Some(("scout", "hunter2")));
    Ok(())
}

fn parse(yaml: &str) -> Result<Config> {
    let mut cfg: Config = serde_yaml::from_str(yaml)?;
    cfg.validate_and_normalize()?;
    Ok(cfg)
}

const MINIMAL: &str = r#"
connection:
  Hosts: ["db0:27017"]
  ConnectTimeout: 5
  IoTimeout: 10
"#;

#[test]
fn minimal_config_gets_defaults() -> Result<()> {
    let cfg = parse(MINIMAL)?;
    assert_eq!(cfg.connection.max_pool_size, 10);
    assert!(cfg.compression.compressors.is_empty());
    assert!(cfg.proxy.is_none());
    assert!(!cfg.auth.is_configured());
    Ok(())
}

#[test]
fn hosts_and_srv_are_mutually_exclusive() {
    let yaml = r#"
connection:
  Hosts: ["db0:27017"]
  SrvHost: "cluster0.example"
  ConnectTimeout: 5
  IoTimeout: 10
"#;
    assert!(parse(yaml).is_err());
}

#[test]
fn either_hosts_or_srv_is_required() {
    let yaml = r#"
connection:
  ConnectTimeout: 5
  IoTimeout: 10
"#;
    assert!(parse(yaml).is_err());
}

#[test]
fn unsupported_compressors_are_rejected() {
    let yaml = r#"
connection:
  Hosts: ["db0:27017"]
  ConnectTimeout: 5
  IoTimeout: 10
compression:
  Compressors: [snappy]
"#;
    assert!(parse(yaml).is_err());
}

#[test]
fn scram_requires_credentials() {
    let yaml = r#"
connection:
  Hosts: ["db0:27017"]
  ConnectTimeout: 5
  IoTimeout: 10
auth:
  Mechanism: SCRAM-SHA-1
  Username: alice
"#;
    assert!(parse(yaml).is_err(), "password is mandatory for SCRAM");
}

#[test]
fn oidc_rejects_a_password() {
    let yaml = r#"
connection:
  Hosts: ["db0:27017"]
  ConnectTimeout: 5
  IoTimeout: 10
auth:
  Mechanism: MONGODB-OIDC
  Username: svc
  Password: nope
"#;
    assert!(parse(yaml).is_err());
}

#[test]
fn non_leading_wildcards_are_rejected_up_front() {
    let yaml = r#"
connection:
  Hosts: ["db0:27017"]
  ConnectTimeout: 5
  IoTimeout: 10
auth:
  Mechanism: MONGODB-OIDC
  Username: svc
  AllowedHosts: ["db.*.example"]
"#;
    assert!(parse(yaml).is_err());
}

#[test]
fn addresses_parse_with_a_default_port() -> Result<()> {
    let plain: ServerAddress = "db7.example".parse()?;
    assert_eq!(plain, ServerAddress::new("db7.example", 27017));

    let explicit: ServerAddress = "db7.example:9999".parse()?;
    assert_eq!(explicit.port, 9999);

    assert!("".parse::<ServerAddress>().is_err());
    assert!(":27017".parse::<ServerAddress>().is_err());
    assert!("db:notaport".parse::<ServerAddress>().is_err());
    Ok(())
}
