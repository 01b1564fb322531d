// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use docdb_client_rs::{
    error::{ErrorKindExt, ProtocolError},
    models::{
        common::{DEFAULT_MAX_MESSAGE_SIZE, HEADER_LEN},
        compressed::{Compressor, compress_message},
        header::MessageHeader,
        opcode::OpCode,
        parse::ServerMessage,
    },
};
use hex_literal::hex;

use crate::unit_tests::encode_msg;

#[test]
fn header_round_trips_little_endian() -> Result<()> {
    let header = MessageHeader::new(16, 42, 7, OpCode::Msg);
    let mut buf = [0u8; HEADER_LEN];
    header.write_to_buf(&mut buf)?;

    // 16 = 0x10, 42 = 0x2a, 7 = 0x07, 2013 = 0x07dd, all little-endian.
    assert_eq!(buf, hex!("10000000 2a000000 07000000 dd070000"));

    let parsed = MessageHeader::read_from_buf(&buf, DEFAULT_MAX_MESSAGE_SIZE)?;
    assert_eq!(parsed, header);
    assert_eq!(parsed.opcode()?, OpCode::Msg);
    Ok(())
}

#[test]
fn oversized_header_is_a_framing_error() {
    let header = MessageHeader::new(1024, 1, 0, OpCode::Msg);
    let mut buf = [0u8; HEADER_LEN];
    header.write_to_buf(&mut buf).expect("write");

    let err = MessageHeader::read_from_buf(&buf, 512).expect_err("must reject");
    assert!(matches!(err.protocol(), Some(ProtocolError::Framing(_))));
}

#[test]
fn undersized_header_is_a_framing_error() {
    let header = MessageHeader::new(8, 1, 0, OpCode::Msg);
    let mut buf = [0u8; HEADER_LEN];
    header.write_to_buf(&mut buf).expect("write");

    assert!(MessageHeader::read_from_buf(&buf, 512).is_err());
}

#[test]
fn correlation_survives_nested_compression() -> Result<()> {
    // (request id, response-to) must round-trip through any sequence of
    // OP_COMPRESSED wrappings.
    let doc = bson::doc! { "ok": 1, "n": 3 };
    let mut frame = encode_msg(77, 55, &doc);

    for compressor in [Compressor::Zlib { level: Some(4) }, Compressor::Noop, Compressor::Zlib { level: None }] {
        frame = compress_message(&frame, compressor)?.to_vec();
        let header = MessageHeader::read_from_buf(&frame, DEFAULT_MAX_MESSAGE_SIZE)?;
        assert_eq!(header.request_id.get(), 77);
        assert_eq!(header.response_to.get(), 55);
        assert_eq!(header.opcode()?, OpCode::Compressed);
    }

    let header = MessageHeader::read_from_buf(&frame, DEFAULT_MAX_MESSAGE_SIZE)?;
    let message = ServerMessage::decode(&header, &frame[HEADER_LEN..])?;
    let decoded: bson::Document = bson::from_slice(message.document()?.as_bytes())?;
    assert_eq!(decoded, doc);
    Ok(())
}

#[test]
fn unknown_compressor_id_is_rejected() -> Result<()> {
    let doc = bson::doc! { "ok": 1 };
    let frame = encode_msg(5, 0, &doc);
    let mut compressed = compress_message(&frame, Compressor::Noop)?.to_vec();
    // Compressor id lives right after the 8-byte envelope prefix.
    compressed[HEADER_LEN + 8] = 42;

    let header = MessageHeader::read_from_buf(&compressed, DEFAULT_MAX_MESSAGE_SIZE)?;
    let err = ServerMessage::decode(&header, &compressed[HEADER_LEN..])
        .expect_err("unknown compressor");
    assert!(matches!(
        err.protocol(),
        Some(ProtocolError::UnsupportedCompressor(42))
    ));
    Ok(())
}
