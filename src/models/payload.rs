// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Splittable write-batch payloads.
//!
//! A bulk write arrives as one logical batch but may not fit a single wire
//! message. The payload keeps an encoding position: each encode consumes a
//! prefix that honours the size/count limits, and `has_another_split()`
//! tells the sender whether a follow-up message must carry the suffix.

use std::collections::HashMap;

use anyhow::{Context, Result, anyhow, bail};
use bson::{Bson, Document, RawBsonRef, RawDocument, RawDocumentBuf, oid::ObjectId};

use crate::{
    error::ProtocolError,
    models::{common::MessageLimits, nesting::NestingMeter},
};

/// What the batch writes. Picks the wire identifier of the payload section
/// and the field-name validator applied to every document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Insert,
    Update,
    Replace,
    Delete,
}

impl PayloadKind {
    /// Identifier emitted at the head of the payload-type-1 section.
    pub fn identifier(&self) -> &'static str {
        match self {
            PayloadKind::Insert => "documents",
            PayloadKind::Update | PayloadKind::Replace => "updates",
            PayloadKind::Delete => "deletes",
        }
    }

    fn validator(&self) -> FieldNameValidator {
        match self {
            // Stored documents must not smuggle operator keys.
            PayloadKind::Insert | PayloadKind::Replace => FieldNameValidator::Collectible,
            PayloadKind::Update | PayloadKind::Delete => FieldNameValidator::Passthrough,
        }
    }
}

/// Top-level field-name policy applied while walking a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldNameValidator {
    /// Reject `$`-prefixed keys at the top level (stored documents).
    Collectible,
    /// Accept anything (update statements, delete filters).
    Passthrough,
}

impl FieldNameValidator {
    fn check_top_level(&self, key: &str) -> Result<()> {
        if matches!(self, FieldNameValidator::Collectible) && key.starts_with('$') {
            bail!(ProtocolError::Framing(format!(
                "field name '{key}' must not start with '$'"
            )));
        }
        Ok(())
    }
}

/// Walks a raw document, enforcing the nesting budget on every start/end
/// pair and the field-name policy at the top level. `meter` may start at a
/// non-zero depth when the document is embedded in an outer one.
pub fn validate_document(
    doc: &RawDocument,
    validator: FieldNameValidator,
    meter: &mut NestingMeter,
) -> Result<()> {
    walk_document(doc, Some(validator), meter)
}

fn walk_document(
    doc: &RawDocument,
    validator: Option<FieldNameValidator>,
    meter: &mut NestingMeter,
) -> Result<()> {
    meter.enter()?;
    for entry in doc.iter() {
        let (key, value) = entry.context("malformed document in payload")?;
        if let Some(v) = validator {
            v.check_top_level(key)?;
        }
        walk_value(value, meter)?;
    }
    meter.exit();
    Ok(())
}

fn walk_value(value: RawBsonRef<'_>, meter: &mut NestingMeter) -> Result<()> {
    match value {
        RawBsonRef::Document(d) => walk_document(d, None, meter),
        RawBsonRef::Array(a) => {
            meter.enter()?;
            for item in a {
                walk_value(item.context("malformed array in payload")?, meter)?;
            }
            meter.exit();
            Ok(())
        },
        _ => Ok(()),
    }
}

/// One write request, tagged with its index in the caller's original batch
/// so server-side errors can be mapped back.
#[derive(Debug, Clone)]
pub struct WriteItem {
    pub original_index: usize,
    pub document: RawDocumentBuf,
}

/// An ordered sequence of write requests with an encoding position.
#[derive(Debug, Clone)]
pub struct SplittablePayload {
    kind: PayloadKind,
    ordered: bool,
    items: Vec<WriteItem>,
    position: usize,
    inserted_ids: HashMap<usize, Bson>,
}

impl SplittablePayload {
    /// Builds an insert payload. Documents without an `_id` get one
    /// generated here; the mapping original-index -> generated id is kept
    /// for the caller's result assembly.
    pub fn inserts(ordered: bool, docs: Vec<Document>) -> Result<Self> {
        let mut inserted_ids = HashMap::new();
        let mut items = Vec::with_capacity(docs.len());
        for (index, mut doc) in docs.into_iter().enumerate() {
            if !doc.contains_key("_id") {
                let id = ObjectId::new();
                // _id leads the document so the server need not reorder.
                let mut with_id = Document::new();
                with_id.insert("_id", id);
                with_id.extend(doc);
                doc = with_id;
                inserted_ids.insert(index, Bson::ObjectId(id));
            }
            items.push(WriteItem {
                original_index: index,
                document: RawDocumentBuf::from_document(&doc)?,
            });
        }
        Self::build(PayloadKind::Insert, ordered, items, inserted_ids)
    }

    /// Builds an update/replace/delete payload from ready statements.
    pub fn writes(kind: PayloadKind, ordered: bool, docs: Vec<Document>) -> Result<Self> {
        let items = docs
            .into_iter()
            .enumerate()
            .map(|(index, doc)| {
                Ok(WriteItem {
                    original_index: index,
                    document: RawDocumentBuf::from_document(&doc)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Self::build(kind, ordered, items, HashMap::new())
    }

    fn build(
        kind: PayloadKind,
        ordered: bool,
        items: Vec<WriteItem>,
        inserted_ids: HashMap<usize, Bson>,
    ) -> Result<Self> {
        let validator = kind.validator();
        for item in &items {
            let mut meter = NestingMeter::default();
            validate_document(&item.document, validator, &mut meter)?;
        }
        Ok(Self {
            kind,
            ordered,
            items,
            position: 0,
            inserted_ids,
        })
    }

    pub fn kind(&self) -> PayloadKind {
        self.kind
    }

    pub fn ordered(&self) -> bool {
        self.ordered
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[WriteItem] {
        &self.items
    }

    /// Position reached by the last encode; items `[0, position)` have been
    /// put on the wire.
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn inserted_ids(&self) -> &HashMap<usize, Bson> {
        &self.inserted_ids
    }

    /// Whether items remain after the last encode. Only meaningful once an
    /// encode has advanced the position.
    pub fn has_another_split(&self) -> bool {
        debug_assert!(self.position > 0, "queried before any encode");
        self.position < self.items.len()
    }

    /// Consumes the encoded prefix and yields the suffix as a new payload
    /// with a reset position. The generated-id map travels with it so the
    /// final batch result can always be assembled from the last payload.
    pub fn next_split(self) -> Result<Self> {
        if self.position >= self.items.len() {
            bail!("payload is exhausted, no further split");
        }
        let Self {
            kind,
            ordered,
            mut items,
            position,
            inserted_ids,
        } = self;
        let rest = items.split_off(position);
        Ok(Self {
            kind,
            ordered,
            items: rest,
            position: 0,
            inserted_ids,
        })
    }

    /// Appends a payload-type-1 section to `out`, streaming documents from
    /// the current position until the message-size or batch-count limit
    /// would be crossed, and records the new position. `already_used` is
    /// the number of message bytes already committed (header + flags +
    /// command section).
    pub fn encode_section(
        &mut self,
        out: &mut Vec<u8>,
        limits: &MessageLimits,
        already_used: usize,
    ) -> Result<usize> {
        let identifier = self.kind.identifier();
        // 1 byte section kind + i32 size + identifier cstring.
        let section_overhead = 1 + 4 + identifier.len() + 1;

        let mut taken = 0usize;
        let mut section_docs_len = 0usize;
        let max_message = limits.max_message_size as usize;
        let max_count = limits.max_batch_count as usize;

        for item in &self.items[self.position..] {
            let doc_len = item.document.as_bytes().len();
            let projected = already_used + section_overhead + section_docs_len + doc_len;
            if taken > 0 && (projected > max_message || taken >= max_count) {
                break;
            }
            if taken == 0 && projected > max_message {
                return Err(anyhow!(ProtocolError::Framing(format!(
                    "single write of {doc_len} bytes cannot fit a {max_message} byte message"
                ))));
            }
            section_docs_len += doc_len;
            taken += 1;
            if taken >= max_count {
                break;
            }
        }

        if taken == 0 {
            return Err(anyhow!(ProtocolError::Framing(
                "no payload item fits the remaining message budget".to_string()
            )));
        }

        out.push(1u8);
        let size = (4 + identifier.len() + 1 + section_docs_len) as i32;
        out.extend_from_slice(&size.to_le_bytes());
        out.extend_from_slice(identifier.as_bytes());
        out.push(0);
        for item in &self.items[self.position..self.position + taken] {
            out.extend_from_slice(item.document.as_bytes());
        }

        self.position += taken;
        Ok(taken)
    }
}
