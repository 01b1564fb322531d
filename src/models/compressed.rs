// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! OP_COMPRESSED envelope. Any message may be wrapped; the envelope keeps
//! the outer header's request/response ids intact and records the original
//! opcode so decode can re-enter the framing logic.

use std::io::Read;

use anyhow::{Result, anyhow, bail};
use bytes::Bytes;
use flate2::{Compression, read::ZlibDecoder, read::ZlibEncoder};
use zerocopy::{
    FromBytes as ZFromBytes, I32, Immutable, IntoBytes, KnownLayout, LittleEndian,
};

use crate::{
    cfg::enums::CompressorName,
    error::ProtocolError,
    models::{common::HEADER_LEN, header::MessageHeader, opcode::OpCode},
};

/// Fixed part of an OP_COMPRESSED body.
pub const COMPRESSED_HEADER_LEN: usize = 9;

/// Wire-safe, zero-copy envelope header.
#[repr(C)]
#[derive(Debug, Clone, Default, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct CompressedHeader {
    pub original_opcode: I32<LittleEndian>,
    pub uncompressed_size: I32<LittleEndian>,
    pub compressor_id: u8,
}

/// A compressor negotiated for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compressor {
    /// Id 0: pass-through, kept for tests and debugging proxies.
    Noop,
    /// Id 2: zlib with an optional level override.
    Zlib { level: Option<u32> },
}

impl Compressor {
    pub fn id(&self) -> u8 {
        match self {
            Compressor::Noop => 0,
            Compressor::Zlib { .. } => 2,
        }
    }

    pub fn name(&self) -> CompressorName {
        match self {
            Compressor::Noop => CompressorName::Noop,
            Compressor::Zlib { .. } => CompressorName::Zlib,
        }
    }

    /// Maps a negotiated name onto a runnable compressor; names this build
    /// cannot encode return `None`.
    pub fn from_name(name: CompressorName, zlib_level: Option<u32>) -> Option<Self> {
        match name {
            CompressorName::Noop => Some(Compressor::Noop),
            CompressorName::Zlib => Some(Compressor::Zlib { level: zlib_level }),
            CompressorName::Snappy | CompressorName::Zstd => None,
        }
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Compressor::Noop => Ok(data.to_vec()),
            Compressor::Zlib { level } => {
                let level = Compression::new(level.unwrap_or(6));
                let mut out = Vec::with_capacity(data.len() / 2);
                ZlibEncoder::new(data, level).read_to_end(&mut out)?;
                Ok(out)
            },
        }
    }
}

fn decompress(compressor_id: u8, data: &[u8]) -> Result<Vec<u8>> {
    match compressor_id {
        0 => Ok(data.to_vec()),
        2 => {
            let mut out = Vec::with_capacity(data.len() * 2);
            ZlibDecoder::new(data).read_to_end(&mut out)?;
            Ok(out)
        },
        other => Err(anyhow!(ProtocolError::UnsupportedCompressor(other))),
    }
}

/// Wraps a fully-encoded message (header included) into OP_COMPRESSED,
/// preserving its request and response-to ids.
pub fn compress_message(message: &[u8], compressor: Compressor) -> Result<Bytes> {
    let header = MessageHeader::ref_from_bytes(
        message
            .get(..HEADER_LEN)
            .ok_or_else(|| anyhow!("message shorter than its header"))?,
    )
    .map_err(|e| anyhow!("{e}"))?;
    let body = &message[HEADER_LEN..];

    let compressed = compressor.compress(body)?;
    let total = (HEADER_LEN + COMPRESSED_HEADER_LEN + compressed.len()) as i32;

    let mut out = Vec::with_capacity(total as usize);
    let outer = MessageHeader::new(
        total,
        header.request_id.get(),
        header.response_to.get(),
        OpCode::Compressed,
    );
    out.extend_from_slice(outer.as_bytes());
    let envelope = CompressedHeader {
        original_opcode: header.op_code,
        uncompressed_size: I32::new(body.len() as i32),
        compressor_id: compressor.id(),
    };
    out.extend_from_slice(envelope.as_bytes());
    out.extend_from_slice(&compressed);
    Ok(Bytes::from(out))
}

/// Unwraps one OP_COMPRESSED body, returning the original opcode and the
/// decompressed message body.
pub fn decode_envelope(body: &[u8]) -> Result<(i32, Vec<u8>)> {
    let envelope = CompressedHeader::ref_from_bytes(
        body.get(..COMPRESSED_HEADER_LEN).ok_or_else(|| {
            anyhow!(ProtocolError::ReplyDecode(
                "compressed body shorter than its envelope".to_string()
            ))
        })?,
    )
    .map_err(|e| anyhow!("{e}"))?;

    let data = decompress(envelope.compressor_id, &body[COMPRESSED_HEADER_LEN..])?;
    let expected = envelope.uncompressed_size.get();
    if data.len() as i32 != expected {
        bail!(ProtocolError::ReplyDecode(format!(
            "decompressed to {} bytes, envelope promised {expected}",
            data.len()
        )));
    }
    Ok((envelope.original_opcode.get(), data))
}
