// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use bson::doc;
use docdb_client_rs::models::{
    common::{HEADER_LEN, MessageLimits},
    msg::request::CommandMessage,
    msg::response::MsgResponse,
    nesting::NestingMeter,
    payload::{FieldNameValidator, PayloadKind, SplittablePayload, validate_document},
};

fn limits(max_message_size: i32, max_batch_count: i32) -> MessageLimits {
    MessageLimits {
        max_document_size: 16 * 1024 * 1024,
        max_message_size,
        max_batch_count,
    }
}

fn insert_docs(n: usize) -> Vec<bson::Document> {
    (0..n)
        .map(|i| doc! { "_id": i as i32, "filler": "x".repeat(64) })
        .collect()
}

/// Encode-and-advance must partition the payload: every item appears in
/// exactly one sub-payload, in order.
#[test]
fn repeated_splits_partition_the_batch() -> Result<()> {
    let total = 40;
    let mut msg = CommandMessage::new("db1", doc! { "insert": "c" })
        .with_payload(SplittablePayload::inserts(true, insert_docs(total))?);

    // Small message budget: forces several splits.
    let limits = limits(600, 1000);

    let mut seen = Vec::new();
    let mut messages = 0;
    loop {
        messages += 1;
        let frame = msg.encode(messages, &limits)?;
        let decoded = MsgResponse::decode(&frame[HEADER_LEN..])?;
        for raw in &decoded.sequences()[0].documents {
            let doc: bson::Document = bson::from_slice(raw.as_bytes())?;
            seen.push(doc.get_i32("_id")?);
        }
        if !msg.has_another_split() {
            break;
        }
        msg = msg.next_split()?;
    }

    assert!(messages > 1, "budget should force more than one message");
    let expected: Vec<i32> = (0..total as i32).collect();
    assert_eq!(seen, expected, "no item duplicated, dropped, or reordered");
    Ok(())
}

#[test]
fn batch_count_limit_bounds_each_split() -> Result<()> {
    let mut msg = CommandMessage::new("db1", doc! { "insert": "c" })
        .with_payload(SplittablePayload::inserts(true, insert_docs(10))?);

    let frame = msg.encode(1, &limits(48_000_000, 4))?;
    let decoded = MsgResponse::decode(&frame[HEADER_LEN..])?;
    assert_eq!(decoded.sequences()[0].documents.len(), 4);
    assert!(msg.has_another_split());
    Ok(())
}

#[test]
fn zero_fitting_items_is_a_framing_overflow() -> Result<()> {
    let big = doc! { "_id": 1, "filler": "y".repeat(4096) };
    let mut msg = CommandMessage::new("db1", doc! { "insert": "c" })
        .with_payload(SplittablePayload::inserts(true, vec![big])?);

    assert!(msg.encode(1, &limits(512, 1000)).is_err());
    Ok(())
}

#[test]
fn inserts_get_generated_ids() -> Result<()> {
    let payload =
        SplittablePayload::inserts(true, vec![doc! { "x": 1 }, doc! { "_id": 9, "x": 2 }])?;
    assert_eq!(payload.len(), 2);
    // Only the document without an _id gets a generated one.
    assert!(payload.inserted_ids().contains_key(&0));
    assert!(!payload.inserted_ids().contains_key(&1));

    let first: bson::Document = bson::from_slice(payload.items()[0].document.as_bytes())?;
    assert!(first.contains_key("_id"));
    Ok(())
}

#[test]
fn split_preserves_original_indexes_and_ids() -> Result<()> {
    let mut msg = CommandMessage::new("db1", doc! { "insert": "c" })
        .with_payload(SplittablePayload::inserts(true, vec![
            doc! { "x": "a".repeat(600) },
            doc! { "x": "b".repeat(600) },
            doc! { "x": "c".repeat(600) },
        ])?);
    // Budget fits the command plus one 600-byte document, not two.
    let _ = msg.encode(1, &limits(800, 1000))?;
    assert!(msg.has_another_split());

    let rest = msg.next_split()?;
    let payload = rest.payload.as_ref().expect("payload");
    assert!(payload.items()[0].original_index > 0);
    // The generated-id map travels with the suffix.
    assert_eq!(payload.inserted_ids().len(), 3);
    Ok(())
}

#[test]
fn insert_documents_reject_operator_field_names() {
    let res = SplittablePayload::inserts(true, vec![doc! { "$set": { "a": 1 } }]);
    assert!(res.is_err());

    // Update statements may carry operators.
    let res = SplittablePayload::writes(
        PayloadKind::Update,
        true,
        vec![doc! { "q": {}, "u": { "$set": { "a": 1 } } }],
    );
    assert!(res.is_ok());
}

#[test]
fn nesting_meter_bounds_document_depth() -> Result<()> {
    let mut nested = doc! { "leaf": 1 };
    for _ in 0..40 {
        nested = doc! { "inner": nested };
    }
    let raw = bson::RawDocumentBuf::from_document(&doc! { "d": nested })?;

    let mut shallow_budget = NestingMeter::with_initial_depth(70);
    assert!(
        validate_document(&raw, FieldNameValidator::Passthrough, &mut shallow_budget)
            .is_err()
    );

    let mut fresh = NestingMeter::default();
    validate_document(&raw, FieldNameValidator::Passthrough, &mut fresh)?;
    assert_eq!(fresh.depth(), 0);
    Ok(())
}
