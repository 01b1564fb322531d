// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! SOCKS5 CONNECT (RFC 1928) with optional username/password
//! sub-negotiation (RFC 1929).
//!
//! The destination is always sent as a domain-name address so the proxy
//! performs the DNS lookup; the client never resolves the target itself.
//! Generic over the stream type so tests drive it with in-memory duplexes.

use anyhow::{Result, anyhow, bail};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::{
    cfg::config::ServerAddress,
    context::operation::Deadline,
    error::{TransportError, TransportKind},
    transport::{IoOp, io_with_deadline},
};

const VERSION: u8 = 0x05;
const AUTH_VERSION: u8 = 0x01;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

fn violation(target: &ServerAddress, message: impl Into<String>) -> anyhow::Error {
    anyhow!(TransportError::new(
        TransportKind::SocksProtocolViolation,
        target.clone(),
        message,
    ))
}

fn connect_failure_reason(status: u8) -> &'static str {
    match status {
        1 => "general SOCKS server failure",
        2 => "connection not allowed by ruleset",
        3 => "network unreachable",
        4 => "host unreachable",
        5 => "connection refused",
        6 => "TTL expired",
        7 => "command not supported",
        8 => "address type not supported",
        _ => "unknown reply status",
    }
}

/// Runs the full SOCKS5 bring-up on an already-open stream: method
/// negotiation, optional RFC 1929 authentication, CONNECT, reply parse.
/// Every read shares the caller's deadline via remaining-time accounting.
pub async fn establish<S>(
    stream: &mut S,
    target: &ServerAddress,
    credentials: Option<(&str, &str)>,
    deadline: Deadline,
    cancel: &CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    negotiate_method(stream, target, credentials, deadline, cancel).await?;
    send_connect(stream, target, deadline, cancel).await?;
    read_connect_reply(stream, target, deadline, cancel).await
}

async fn negotiate_method<S>(
    stream: &mut S,
    target: &ServerAddress,
    credentials: Option<(&str, &str)>,
    deadline: Deadline,
    cancel: &CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let methods: &[u8] = if credentials.is_some() {
        &[METHOD_NO_AUTH, METHOD_USER_PASS]
    } else {
        &[METHOD_NO_AUTH]
    };

    let mut greeting = Vec::with_capacity(2 + methods.len());
    greeting.push(VERSION);
    greeting.push(methods.len() as u8);
    greeting.extend_from_slice(methods);

    io_with_deadline(
        "socks greeting",
        IoOp::Write,
        target,
        stream.write_all(&greeting),
        deadline,
        cancel,
    )
    .await?;

    let mut choice = [0u8; 2];
    io_with_deadline(
        "socks method choice",
        IoOp::Read,
        target,
        stream.read_exact(&mut choice),
        deadline,
        cancel,
    )
    .await?;

    if choice[0] != VERSION {
        bail!(violation(
            target,
            format!("proxy speaks version {:#04x}", choice[0])
        ));
    }
    match choice[1] {
        METHOD_NO_AUTH => Ok(()),
        METHOD_USER_PASS => match credentials {
            Some((user, pass)) => {
                authenticate(stream, target, user, pass, deadline, cancel).await
            },
            None => bail!(violation(target, "proxy chose an unoffered auth method")),
        },
        METHOD_NO_ACCEPTABLE => {
            bail!(violation(target, "proxy accepts none of the offered methods"))
        },
        other => bail!(violation(
            target,
            format!("proxy chose unknown method {other:#04x}")
        )),
    }
}

async fn authenticate<S>(
    stream: &mut S,
    target: &ServerAddress,
    username: &str,
    password: &str,
    deadline: Deadline,
    cancel: &CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if username.len() > 255 || password.len() > 255 {
        bail!(violation(target, "proxy credentials exceed 255 bytes"));
    }

    let mut req = Vec::with_capacity(3 + username.len() + password.len());
    req.push(AUTH_VERSION);
    req.push(username.len() as u8);
    req.extend_from_slice(username.as_bytes());
    req.push(password.len() as u8);
    req.extend_from_slice(password.as_bytes());

    io_with_deadline(
        "socks auth request",
        IoOp::Write,
        target,
        stream.write_all(&req),
        deadline,
        cancel,
    )
    .await?;

    let mut reply = [0u8; 2];
    io_with_deadline(
        "socks auth reply",
        IoOp::Read,
        target,
        stream.read_exact(&mut reply),
        deadline,
        cancel,
    )
    .await?;

    if reply[1] != 0 {
        // RFC 1929 requires the connection be torn down on failure.
        let _ = stream.shutdown().await;
        bail!(violation(
            target,
            format!("proxy rejected the credentials (status {})", reply[1])
        ));
    }
    Ok(())
}

async fn send_connect<S>(
    stream: &mut S,
    target: &ServerAddress,
    deadline: Deadline,
    cancel: &CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let host = target.host.as_bytes();
    if host.len() > 255 {
        bail!(violation(target, "destination host exceeds 255 bytes"));
    }

    let mut req = Vec::with_capacity(7 + host.len());
    req.push(VERSION);
    req.push(CMD_CONNECT);
    req.push(0); // reserved
    req.push(ATYP_DOMAIN);
    req.push(host.len() as u8);
    req.extend_from_slice(host);
    req.extend_from_slice(&target.port.to_be_bytes());

    io_with_deadline(
        "socks connect request",
        IoOp::Write,
        target,
        stream.write_all(&req),
        deadline,
        cancel,
    )
    .await
}

async fn read_connect_reply<S>(
    stream: &mut S,
    target: &ServerAddress,
    deadline: Deadline,
    cancel: &CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 4];
    io_with_deadline(
        "socks connect reply",
        IoOp::Read,
        target,
        stream.read_exact(&mut head),
        deadline,
        cancel,
    )
    .await?;

    if head[0] != VERSION {
        bail!(violation(
            target,
            format!("proxy replied with version {:#04x}", head[0])
        ));
    }
    if head[1] != 0 {
        bail!(violation(
            target,
            format!(
                "proxy refused CONNECT: {} (status {})",
                connect_failure_reason(head[1]),
                head[1]
            )
        ));
    }

    // Skip the bound address: its length depends on the address type.
    let skip = match head[3] {
        ATYP_IPV4 => 4usize,
        ATYP_IPV6 => 16usize,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            io_with_deadline(
                "socks bound host length",
                IoOp::Read,
                target,
                stream.read_exact(&mut len),
                deadline,
                cancel,
            )
            .await?;
            len[0] as usize
        },
        other => bail!(violation(
            target,
            format!("proxy replied with unknown address type {other:#04x}")
        )),
    };

    let mut rest = vec![0u8; skip + 2];
    io_with_deadline(
        "socks bound address",
        IoOp::Read,
        target,
        stream.read_exact(&mut rest),
        deadline,
        cancel,
    )
    .await?;
    Ok(())
}
