// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use anyhow::{Result, anyhow, bail};
use bson::{Document, doc};
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{Mutex, mpsc},
    time::{Instant, timeout_at},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    cfg::config::{ConnectionConfig, ProxyConfig, ServerAddress},
    client::common::{RawReply, check_command_reply},
    context::operation::{Deadline, OperationContext},
    error::{Cancellation, EXCEEDED_TIME_LIMIT_CODE, ErrorKindExt},
    events::command::{CommandEventEmitter, redact_error},
    models::{
        common::{HEADER_LEN, next_request_id},
        compressed::{Compressor, compress_message},
        header::MessageHeader,
        msg::{flags::MessageFlags, request::CommandMessage},
        opcode::OpCode,
        parse::ServerMessage,
    },
    sdam::description::{ConnectionDescription, ConnectionId, ServerId},
    transport::{IoOp, io_with_deadline, open_stream},
};

/// Commands that are never wrapped in OP_COMPRESSED: the greeting must be
/// readable before negotiation, and credential exchanges stay uncompressed
/// so a proxy cannot be tricked into caching them.
const UNCOMPRESSIBLE_COMMANDS: &[&str] = &[
    "hello",
    "isMaster",
    "ismaster",
    "saslStart",
    "saslContinue",
    "getnonce",
    "authenticate",
    "createUser",
    "updateUser",
    "copydbgetnonce",
    "copydbsaslstart",
    "copydb",
];

/// A single connection to one server: owns the TCP stream halves, frames
/// outgoing messages, and correlates replies to callers by request id.
#[derive(Debug)]
pub struct ClientConnection {
    /// TCP read half, owned by the read loop.
    pub reader: Mutex<OwnedReadHalf>,
    /// TCP write half protected for concurrent senders.
    pub writer: Mutex<OwnedWriteHalf>,
    address: ServerAddress,
    /// Pool generation this connection was created under.
    generation: u32,
    io_timeout: Duration,

    description: StdMutex<ConnectionDescription>,
    compressor: StdMutex<Option<Compressor>>,

    /// Request id -> sender the read loop delivers matching replies to.
    sending: DashMap<i32, mpsc::Sender<RawReply>>,
    /// Request id -> receiver the requesting task reads from.
    reciver: DashMap<i32, mpsc::Receiver<RawReply>>,

    emitter: Arc<CommandEventEmitter>,
    cancel: CancellationToken,
}

impl ClientConnection {
    /// Establishes the TCP (optionally SOCKS5-tunnelled) stream and starts
    /// the read loop. The returned connection has not run its handshake yet.
    #[allow(clippy::too_many_arguments)]
    pub async fn connect(
        address: ServerAddress,
        proxy: Option<&ProxyConfig>,
        server_id: ServerId,
        local_id: u32,
        generation: u32,
        cfg: &ConnectionConfig,
        emitter: Arc<CommandEventEmitter>,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>> {
        let deadline = Deadline::after(cfg.connect_timeout);
        let stream = open_stream(&address, proxy, deadline, &cancel).await?;
        Ok(Self::from_stream(
            stream, address, server_id, local_id, generation, cfg, emitter, cancel,
        ))
    }

    /// Builds a connection from an established stream and spawns its read
    /// loop.
    #[allow(clippy::too_many_arguments)]
    pub fn from_stream(
        stream: TcpStream,
        address: ServerAddress,
        server_id: ServerId,
        local_id: u32,
        generation: u32,
        cfg: &ConnectionConfig,
        emitter: Arc<CommandEventEmitter>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (r, w) = stream.into_split();
        let connection_id = ConnectionId::new(server_id, local_id);
        let conn = Arc::new(Self {
            reader: Mutex::new(r),
            writer: Mutex::new(w),
            description: StdMutex::new(ConnectionDescription::preliminary(
                connection_id,
                address.clone(),
            )),
            compressor: StdMutex::new(None),
            address,
            generation,
            io_timeout: cfg.io_timeout,
            sending: DashMap::new(),
            reciver: DashMap::new(),
            emitter,
            cancel,
        });

        let reader = Arc::clone(&conn);
        tokio::spawn(async move {
            if let Err(e) = Arc::clone(&reader).read_loop().await {
                debug!("read loop exited: {e}");
            }
            // Dropping the senders wakes every waiter with a closed channel.
            reader.sending.clear();
        });

        conn
    }

    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn io_timeout(&self) -> Duration {
        self.io_timeout
    }

    pub fn description(&self) -> ConnectionDescription {
        lock(&self.description).clone()
    }

    /// Installs the post-handshake description. Called exactly once, by the
    /// handshake; afterwards only the server-assigned counter may change.
    pub fn install_description(&self, description: ConnectionDescription) {
        *lock(&self.description) = description;
    }

    pub fn set_compressor(&self, compressor: Option<Compressor>) {
        *lock(&self.compressor) = compressor;
    }

    pub fn service_id(&self) -> Option<bson::oid::ObjectId> {
        lock(&self.description).service_id
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Idempotent hard close: cancels both I/O directions.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    fn deadline_for_io(&self, ctx: &OperationContext) -> Deadline {
        ctx.deadline().min(Deadline::after(self.io_timeout))
    }

    /// Runs one command round-trip on this connection: enrich, encode,
    /// emit `started`, send, receive, decode, emit the terminal event.
    pub async fn run_command(
        &self,
        ctx: &OperationContext,
        mut msg: CommandMessage,
    ) -> Result<Document> {
        let started_at = Instant::now();
        self.enrich(ctx, &mut msg)?;

        let command_name = msg.command_name().to_string();
        let redacted = self.emitter.is_sensitive(&command_name, &msg.body);
        let expects_reply = msg.expects_reply();

        let desc = self.description();
        let request_id = next_request_id();
        let encoded = msg.encode(request_id, &desc.limits())?;

        self.emitter.started(
            ctx.id(),
            request_id,
            &desc,
            &msg.db,
            &command_name,
            &msg.body,
        );

        let result = self
            .round_trip(ctx, request_id, &command_name, encoded, expects_reply)
            .await;

        let duration = started_at.elapsed();
        match result {
            Ok(reply) => {
                self.emitter.succeeded(
                    ctx.id(),
                    request_id,
                    &desc,
                    &command_name,
                    redacted,
                    duration,
                    &reply,
                );
                Ok(reply)
            },
            Err(e) if e.write_concern().is_some() => {
                // The command itself succeeded; the carrier travels up to
                // the protocol boundary where it is unwrapped.
                let response = e
                    .write_concern()
                    .map(|c| c.response.clone())
                    .unwrap_or_default();
                self.emitter.succeeded(
                    ctx.id(),
                    request_id,
                    &desc,
                    &command_name,
                    redacted,
                    duration,
                    &response,
                );
                if redacted { Err(redact_error(e)) } else { Err(e) }
            },
            Err(e) => {
                let e = self.remap_execution_timeout(ctx, e);
                self.emitter.failed(
                    ctx.id(),
                    request_id,
                    &desc,
                    &command_name,
                    duration,
                    &e,
                );
                if redacted { Err(redact_error(e)) } else { Err(e) }
            },
        }
    }

    async fn round_trip(
        &self,
        ctx: &OperationContext,
        request_id: i32,
        command_name: &str,
        encoded: Bytes,
        expects_reply: bool,
    ) -> Result<Document> {
        let wire = self.maybe_compress(command_name, &encoded)?;

        self.send_frame(ctx, request_id, wire, expects_reply).await?;
        if !expects_reply {
            return Ok(doc! { "ok": 1 });
        }

        let raw = self.receive_frame(ctx, request_id).await?;
        let message = ServerMessage::decode(&raw.header, &raw.body)?;
        if let ServerMessage::Reply(r) = &message
            && r.query_failure()
        {
            debug!("legacy reply flagged query failure");
        }
        let raw_doc = message.into_document()?;
        let doc: Document = bson::from_slice(raw_doc.as_bytes())?;
        check_command_reply(doc)
    }

    fn maybe_compress(&self, command_name: &str, encoded: &Bytes) -> Result<Bytes> {
        let compressor = *lock(&self.compressor);
        match compressor {
            Some(c) if !UNCOMPRESSIBLE_COMMANDS.contains(&command_name) => {
                compress_message(encoded, c)
            },
            _ => Ok(encoded.clone()),
        }
    }

    /// Adds the ambient fields every outgoing command carries: server-api
    /// marker, session read-concern and cluster-time fragments, and the
    /// remaining client budget as a server-side time limit.
    fn enrich(&self, ctx: &OperationContext, msg: &mut CommandMessage) -> Result<()> {
        if let Some(api) = ctx.server_api()
            && !msg.body.contains_key("apiVersion")
        {
            msg.body.insert("apiVersion", api.version.clone());
            if api.strict {
                msg.body.insert("apiStrict", true);
            }
            if api.deprecation_errors {
                msg.body.insert("apiDeprecationErrors", true);
            }
        }

        if let Some(session) = ctx.session() {
            let wire_version = lock(&self.description).max_wire_version;
            if !msg.body.contains_key("readConcern")
                && let Some(rc) = session.read_concern_fragment(wire_version)?
            {
                msg.body.insert("readConcern", rc);
            }
            if !msg.body.contains_key("$clusterTime")
                && let Some(ct) = session.cluster_time()
            {
                msg.body.insert("$clusterTime", ct.clone());
            }
        }

        if !msg.body.contains_key("maxTimeMS")
            && let Some(remaining) = ctx.remaining_minus_rtt()?
        {
            msg.body
                .insert("maxTimeMS", (remaining.as_millis().max(1)) as i64);
        }

        Ok(())
    }

    /// Server-side execution timeouts become client-side timeouts whenever
    /// a client budget was actually in force.
    fn remap_execution_timeout(
        &self,
        ctx: &OperationContext,
        e: anyhow::Error,
    ) -> anyhow::Error {
        let has_budget = ctx.deadline() != Deadline::Infinite;
        match e.command() {
            Some(c) if c.code == EXCEEDED_TIME_LIMIT_CODE && has_budget => {
                anyhow!(Cancellation::deadline_with(c.message.clone()))
            },
            _ => e,
        }
    }

    async fn send_frame(
        &self,
        ctx: &OperationContext,
        request_id: i32,
        frame: Bytes,
        expects_reply: bool,
    ) -> Result<()> {
        if self.cancel.is_cancelled() {
            bail!(Cancellation::ShutdownInProgress);
        }

        if expects_reply && !self.sending.contains_key(&request_id) {
            let (tx, rx) = mpsc::channel::<RawReply>(8);
            self.sending.insert(request_id, tx);
            self.reciver.insert(request_id, rx);
        }

        let deadline = self.deadline_for_io(ctx);
        let mut w = self.writer.lock().await;
        let res = io_with_deadline(
            "write message",
            IoOp::Write,
            &self.address,
            w.write_all(&frame),
            deadline,
            &self.cancel,
        )
        .await;
        drop(w);

        if let Err(e) = res {
            if expects_reply {
                self.sending.remove(&request_id);
                self.reciver.remove(&request_id);
            }
            return Err(e);
        }
        Ok(())
    }

    async fn receive_frame(
        &self,
        ctx: &OperationContext,
        request_id: i32,
    ) -> Result<RawReply> {
        let mut rx = self
            .reciver
            .remove(&request_id)
            .map(|(_, rx)| rx)
            .ok_or_else(|| anyhow!("no pending request with id={request_id}"))?;

        let io_deadline = Deadline::after(self.io_timeout);
        let op_deadline = ctx.deadline();
        let effective = op_deadline.min(io_deadline);

        let reply = {
            let recv = async {
                match effective {
                    Deadline::Infinite => Ok(rx.recv().await),
                    Deadline::At(at) => timeout_at(at, rx.recv()).await,
                }
            };
            tokio::select! {
                _ = self.cancel.cancelled() => Err(anyhow!(Cancellation::ShutdownInProgress)),
                _ = ctx.cancel_token().cancelled() => Err(anyhow!(Cancellation::Interrupted)),
                res = recv => match res {
                    Ok(Some(reply)) => Ok(reply),
                    Ok(None) => Err(anyhow!(crate::error::TransportError::new(
                        crate::error::TransportKind::PrematureEof,
                        self.address.clone(),
                        "connection closed before the reply arrived",
                    ))),
                    Err(_) if op_deadline.expired() => Err(anyhow!(Cancellation::deadline())),
                    Err(_) => Err(anyhow!(crate::error::TransportError::new(
                        crate::error::TransportKind::ReadTimeout,
                        self.address.clone(),
                        "timed out waiting for the reply",
                    ))),
                },
            }
        }?;

        if reply_announces_more(&reply) {
            self.reciver.insert(request_id, rx);
        }
        Ok(reply)
    }

    async fn read_loop(self: Arc<Self>) -> Result<()> {
        let mut scratch = BytesMut::with_capacity(16 * 1024);

        loop {
            if self.cancel.is_cancelled() {
                bail!(Cancellation::ShutdownInProgress);
            }

            scratch.clear();
            scratch.resize(HEADER_LEN, 0);
            {
                let mut r = self.reader.lock().await;
                // The header read has no timeout: an idle connection simply
                // has nothing inbound. Cancellation still applies.
                io_with_deadline(
                    "read header",
                    IoOp::Read,
                    &self.address,
                    r.read_exact(&mut scratch[..HEADER_LEN]),
                    Deadline::Infinite,
                    &self.cancel,
                )
                .await?;
            }

            let max_message_size = lock(&self.description).max_message_size;
            let header = MessageHeader::read_from_buf(&scratch, max_message_size)?;
            let body_len = header.body_len();

            if body_len > 0 {
                scratch.resize(HEADER_LEN + body_len, 0);
                let mut r = self.reader.lock().await;
                io_with_deadline(
                    "read body",
                    IoOp::Read,
                    &self.address,
                    r.read_exact(&mut scratch[HEADER_LEN..HEADER_LEN + body_len]),
                    Deadline::after(self.io_timeout),
                    &self.cancel,
                )
                .await?;
            }

            let combined: Bytes = scratch.split().freeze();
            let body = combined.slice(HEADER_LEN..);
            let response_to = header.response_to.get();
            let reply = RawReply { header, body };

            let more = reply_announces_more(&reply);
            if let Some((id, tx)) = self.sending.remove(&response_to) {
                let _ = tx.send(reply).await;
                if more {
                    self.sending.insert(id, tx);
                }
            } else {
                warn!("dropping reply for unknown request id {response_to}");
            }
        }
    }
}

/// Peeks at an undecoded reply to see whether the server flagged a
/// follow-up on the same request id. Compressed replies are treated as
/// final; exhaust streams are never compressed by the servers we speak to.
fn reply_announces_more(reply: &RawReply) -> bool {
    if reply.header.opcode().ok() != Some(OpCode::Msg) {
        return false;
    }
    let Some(bytes) = reply.body.get(..4) else {
        return false;
    };
    let Ok(flag_bytes) = TryInto::<[u8; 4]>::try_into(bytes) else {
        return false;
    };
    let flags = MessageFlags::from_bits_truncate(u32::from_le_bytes(flag_bytes));
    flags.contains(MessageFlags::MORE_TO_COME)
}

fn lock<T>(m: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
