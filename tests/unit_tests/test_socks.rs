// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use docdb_client_rs::{
    cfg::config::ServerAddress,
    context::operation::Deadline,
    error::{ErrorKindExt, TransportKind},
    transport::socks5,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio_util::sync::CancellationToken;

fn target() -> ServerAddress {
    ServerAddress::new("db0.internal", 27017)
}

async fn read_greeting(proxy: &mut DuplexStream) -> Vec<u8> {
    let mut head = [0u8; 2];
    proxy.read_exact(&mut head).await.expect("greeting head");
    assert_eq!(head[0], 0x05);
    let mut methods = vec![0u8; head[1] as usize];
    proxy.read_exact(&mut methods).await.expect("methods");
    methods
}

async fn read_connect(proxy: &mut DuplexStream) -> (String, u16) {
    let mut head = [0u8; 4];
    proxy.read_exact(&mut head).await.expect("connect head");
    assert_eq!(head, [0x05, 0x01, 0x00, 0x03], "domain-name CONNECT");
    let mut len = [0u8; 1];
    proxy.read_exact(&mut len).await.expect("host len");
    let mut host = vec![0u8; len[0] as usize];
    proxy.read_exact(&mut host).await.expect("host");
    let mut port = [0u8; 2];
    proxy.read_exact(&mut port).await.expect("port");
    (
        String::from_utf8(host).expect("utf8 host"),
        u16::from_be_bytes(port),
    )
}

#[tokio::test]
async fn connect_without_auth_succeeds() -> Result<()> {
    let (mut client, mut proxy) = tokio::io::duplex(1024);

    let server = tokio::spawn(async move {
        let methods = read_greeting(&mut proxy).await;
        assert_eq!(methods, vec![0x00]);
        proxy.write_all(&[0x05, 0x00]).await.expect("choice");

        let (host, port) = read_connect(&mut proxy).await;
        assert_eq!(host, "db0.internal");
        assert_eq!(port, 27017);

        // Reply with an IPv4 bound address.
        proxy
            .write_all(&[0x05, 0x00, 0x00, 0x01, 10, 0, 0, 1, 0x1F, 0x90])
            .await
            .expect("reply");
        proxy
    });

    socks5::establish(
        &mut client,
        &target(),
        None,
        Deadline::after(Duration::from_secs(1)),
        &CancellationToken::new(),
    )
    .await?;
    drop(server.await.expect("proxy task"));
    Ok(())
}

#[tokio::test]
async fn username_password_subnegotiation_runs_when_chosen() -> Result<()> {
    let (mut client, mut proxy) = tokio::io::duplex(1024);

    tokio::spawn(async move {
        let methods = read_greeting(&mut proxy).await;
        assert_eq!(methods, vec![0x00, 0x02], "both methods offered");
        proxy.write_all(&[0x05, 0x02]).await.expect("choice");

        // RFC 1929 sub-negotiation.
        let mut ver = [0u8; 2];
        proxy.read_exact(&mut ver).await.expect("auth head");
        assert_eq!(ver[0], 0x01);
        let mut user = vec![0u8; ver[1] as usize];
        proxy.read_exact(&mut user).await.expect("user");
        assert_eq!(user, b"scout");
        let mut plen = [0u8; 1];
        proxy.read_exact(&mut plen).await.expect("plen");
        let mut pass = vec![0u8; plen[0] as usize];
        proxy.read_exact(&mut pass).await.expect("pass");
        assert_eq!(pass, b"hunter2");
        proxy.write_all(&[0x01, 0x00]).await.expect("auth ok");

        let _ = read_connect(&mut proxy).await;
        // Domain-name bound address this time.
        proxy
            .write_all(&[0x05, 0x00, 0x00, 0x03, 4, b'l', b'b', b'0', b'1', 0x1F, 0x90])
            .await
            .expect("reply");
        // Keep the stream open until the client is done.
        let mut buf = [0u8; 1];
        let _ = proxy.read(&mut buf).await;
    });

    socks5::establish(
        &mut client,
        &target(),
        Some(("scout", "hunter2")),
        Deadline::after(Duration::from_secs(1)),
        &CancellationToken::new(),
    )
    .await?;
    Ok(())
}

#[tokio::test]
async fn rejected_credentials_fail() {
    let (mut client, mut proxy) = tokio::io::duplex(1024);

    tokio::spawn(async move {
        let _ = read_greeting(&mut proxy).await;
        proxy.write_all(&[0x05, 0x02]).await.expect("choice");
        let mut junk = [0u8; 64];
        let _ = proxy.read(&mut junk).await;
        proxy.write_all(&[0x01, 0x01]).await.expect("auth denied");
        let mut buf = [0u8; 1];
        let _ = proxy.read(&mut buf).await;
    });

    let err = socks5::establish(
        &mut client,
        &target(),
        Some(("scout", "wrong")),
        Deadline::after(Duration::from_secs(1)),
        &CancellationToken::new(),
    )
    .await
    .expect_err("credentials rejected");
    let transport = err.transport().expect("transport error");
    assert_eq!(transport.kind, TransportKind::SocksProtocolViolation);
}

#[tokio::test]
async fn no_acceptable_method_fails() {
    let (mut client, mut proxy) = tokio::io::duplex(1024);

    tokio::spawn(async move {
        let _ = read_greeting(&mut proxy).await;
        proxy.write_all(&[0x05, 0xFF]).await.expect("choice");
    });

    let err = socks5::establish(
        &mut client,
        &target(),
        None,
        Deadline::after(Duration::from_secs(1)),
        &CancellationToken::new(),
    )
    .await
    .expect_err("no method");
    assert_eq!(
        err.transport().expect("transport").kind,
        TransportKind::SocksProtocolViolation
    );
}

#[tokio::test]
async fn connect_refusal_maps_the_status_code() {
    let (mut client, mut proxy) = tokio::io::duplex(1024);

    tokio::spawn(async move {
        let _ = read_greeting(&mut proxy).await;
        proxy.write_all(&[0x05, 0x00]).await.expect("choice");
        let _ = read_connect(&mut proxy).await;
        // Status 5: connection refused.
        proxy
            .write_all(&[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await
            .expect("reply");
    });

    let err = socks5::establish(
        &mut client,
        &target(),
        None,
        Deadline::after(Duration::from_secs(1)),
        &CancellationToken::new(),
    )
    .await
    .expect_err("refused");
    assert!(err.to_string().contains("connection refused"));
    assert!(err.to_string().contains("status 5"));
}

#[tokio::test]
async fn silent_proxy_times_out_against_the_deadline() {
    let (mut client, _proxy) = tokio::io::duplex(1024);

    let err = socks5::establish(
        &mut client,
        &target(),
        None,
        Deadline::after(Duration::from_millis(50)),
        &CancellationToken::new(),
    )
    .await
    .expect_err("nobody answers");
    assert_eq!(
        err.transport().expect("transport").kind,
        TransportKind::ReadTimeout
    );
}
