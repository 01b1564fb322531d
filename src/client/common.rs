// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Result, anyhow};
use bson::{Bson, Document};
use bytes::Bytes;

use crate::{
    error::{CommandError, WriteConcernCarrier},
    models::header::MessageHeader,
    sdam::description::TopologyVersion,
};

/// One inbound frame as it came off the socket: validated header plus the
/// undecoded body.
#[derive(Debug, Clone)]
pub struct RawReply {
    pub header: MessageHeader,
    pub body: Bytes,
}

fn numeric(v: &Bson) -> Option<f64> {
    match v {
        Bson::Double(d) => Some(*d),
        Bson::Int32(i) => Some(f64::from(*i)),
        Bson::Int64(i) => Some(*i as f64),
        _ => None,
    }
}

fn int32(v: &Bson) -> Option<i32> {
    match v {
        Bson::Int32(i) => Some(*i),
        Bson::Int64(i) => i32::try_from(*i).ok(),
        Bson::Double(d) => Some(*d as i32),
        _ => None,
    }
}

/// Turns a server reply document into either the document itself or the
/// typed command error it describes. A reply that succeeded but carries a
/// `writeConcernError` comes back as the carrier error wrapping the full
/// response, to be unwrapped at the protocol boundary.
pub fn check_command_reply(doc: Document) -> Result<Document> {
    let ok = doc.get("ok").and_then(numeric).unwrap_or(0.0) == 1.0;

    if !ok {
        let code = doc.get("code").and_then(int32).unwrap_or(8);
        let code_name = doc
            .get_str("codeName")
            .unwrap_or_default()
            .to_string();
        let message = doc
            .get_str("errmsg")
            .or_else(|_| doc.get_str("$err"))
            .unwrap_or("command failed")
            .to_string();
        let labels = doc
            .get_array("errorLabels")
            .map(|arr| {
                arr.iter()
                    .filter_map(|b| b.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        let topology_version = doc
            .get_document("topologyVersion")
            .ok()
            .and_then(|tv| bson::from_document::<TopologyVersion>(tv.clone()).ok());

        return Err(anyhow!(CommandError {
            code,
            code_name,
            message,
            labels,
            topology_version,
        }));
    }

    if let Ok(wce) = doc.get_document("writeConcernError") {
        let code = wce.get("code").and_then(int32).unwrap_or(8);
        let message = wce.get_str("errmsg").unwrap_or_default().to_string();
        return Err(anyhow!(WriteConcernCarrier {
            code,
            message,
            response: doc,
        }));
    }

    Ok(doc)
}
