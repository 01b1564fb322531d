// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod socks5;

use anyhow::{Result, anyhow};
use tokio::{net::TcpStream, time::timeout_at};
use tokio_util::sync::CancellationToken;

use crate::{
    cfg::config::{ProxyConfig, ServerAddress},
    context::operation::Deadline,
    error::{Cancellation, TransportError, TransportKind},
};

/// What the raced future is doing; picks the transport kind used for
/// timeouts and I/O failures.
#[derive(Debug, Clone, Copy)]
pub enum IoOp {
    Connect,
    Read,
    Write,
}

impl IoOp {
    fn timeout_kind(self) -> TransportKind {
        match self {
            IoOp::Connect => TransportKind::OpenFailure,
            IoOp::Read => TransportKind::ReadTimeout,
            IoOp::Write => TransportKind::WriteFailure,
        }
    }

    fn error_kind(self, e: &std::io::Error) -> TransportKind {
        match self {
            IoOp::Connect => match e.kind() {
                std::io::ErrorKind::ConnectionRefused => TransportKind::ConnectRefused,
                _ => TransportKind::OpenFailure,
            },
            IoOp::Read => TransportKind::PrematureEof,
            IoOp::Write => TransportKind::WriteFailure,
        }
    }
}

/// Races an I/O future against the operation deadline and the cancellation
/// token, mapping each exit onto the transport error taxonomy. The deadline
/// is re-derived from remaining time on every call, so multi-step exchanges
/// naturally share one budget.
pub async fn io_with_deadline<F, T>(
    label: &'static str,
    op: IoOp,
    address: &ServerAddress,
    fut: F,
    deadline: Deadline,
    cancel: &CancellationToken,
) -> Result<T>
where
    F: Future<Output = std::io::Result<T>>,
{
    let io = async {
        match deadline {
            Deadline::Infinite => Ok(fut.await),
            Deadline::At(at) => timeout_at(at, fut).await,
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => Err(anyhow!(Cancellation::Interrupted)),
        res = io => match res {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(anyhow!(TransportError::new(
                op.error_kind(&e),
                address.clone(),
                format!("{label}: {e}"),
            ))),
            Err(_) => Err(anyhow!(TransportError::new(
                op.timeout_kind(),
                address.clone(),
                format!("{label} timed out"),
            ))),
        },
    }
}

/// Opens a TCP stream to `target`, optionally tunnelling through a SOCKS5
/// proxy so the proxy resolves the (possibly unresolved) target host.
pub async fn open_stream(
    target: &ServerAddress,
    proxy: Option<&ProxyConfig>,
    deadline: Deadline,
    cancel: &CancellationToken,
) -> Result<TcpStream> {
    let connect_to = proxy.map(|p| p.address()).unwrap_or_else(|| target.clone());

    let stream = io_with_deadline(
        "tcp connect",
        IoOp::Connect,
        &connect_to,
        TcpStream::connect((connect_to.host.clone(), connect_to.port)),
        deadline,
        cancel,
    )
    .await?;
    stream.set_linger(None)?;
    stream.set_nodelay(true)?;

    let mut stream = stream;
    if let Some(p) = proxy {
        socks5::establish(&mut stream, target, p.credentials(), deadline, cancel).await?;
    }

    Ok(stream)
}
