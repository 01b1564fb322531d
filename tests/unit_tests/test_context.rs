// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use bson::{Timestamp, doc};
use docdb_client_rs::{
    cfg::config::ServerAddress,
    context::{
        operation::{Deadline, OperationContext},
        session::{SNAPSHOT_MIN_WIRE_VERSION, SessionContext},
    },
    error::{ConfigurationError, ErrorKindExt},
};

#[test]
fn derived_contexts_share_id_and_deprioritization() {
    let ctx = OperationContext::new(Deadline::after(Duration::from_secs(10)));
    let derived = ctx.with_timeout(Duration::from_secs(1));

    assert_eq!(ctx.id(), derived.id());

    // Deprioritization recorded through one context is visible through
    // the other.
    derived.with_deprioritization(|d| d.on_attempt(ServerAddress::new("a", 1)));
    derived.with_deprioritization(|d| {
        d.on_attempt_failure(&anyhow::anyhow!("some failure"))
    });
    let shared = ctx.with_deprioritization(|d| d.deprioritized().len());
    assert_eq!(shared, 1);
}

#[test]
fn operation_ids_are_unique_and_increasing() {
    let a = OperationContext::new(Deadline::Infinite);
    let b = OperationContext::new(Deadline::Infinite);
    assert!(b.id() > a.id());
}

#[test]
fn fresh_maintenance_deadline_preserves_the_overall_budget() {
    let ctx = OperationContext::new(Deadline::after(Duration::from_millis(50)));
    let round = ctx.with_fresh_maintenance(Duration::from_secs(3600));

    assert_eq!(ctx.id(), round.id());
    // The effective deadline is still the tight overall one.
    let remaining = round.remaining().expect("not yet expired").expect("finite");
    assert!(remaining <= Duration::from_millis(50));
}

#[test]
fn expired_deadline_reports_a_cancellation() {
    let ctx = OperationContext::new(Deadline::At(tokio::time::Instant::now()));
    let err = ctx.remaining().expect_err("already expired");
    assert!(err.cancellation().is_some());
}

#[test]
fn infinite_deadline_never_expires() {
    let ctx = OperationContext::new(Deadline::Infinite);
    assert!(ctx.remaining().expect("ok").is_none());
    assert!(!ctx.deadline().expired());
}

#[test]
fn min_rtt_shrinks_the_server_budget() {
    let ctx = OperationContext::new(Deadline::after(Duration::from_millis(100)))
        .with_min_rtt(Duration::from_millis(40));
    let adjusted = ctx
        .remaining_minus_rtt()
        .expect("not expired")
        .expect("finite");
    assert!(adjusted <= Duration::from_millis(60));
}

#[test]
fn causal_sessions_project_after_cluster_time() -> Result<()> {
    let mut session = SessionContext::causally_consistent();
    assert_eq!(session.read_concern_fragment(17)?, None);

    let ts = Timestamp {
        time: 100,
        increment: 3,
    };
    session.advance_operation_time(ts);
    // Older times never move the watermark back.
    session.advance_operation_time(Timestamp {
        time: 50,
        increment: 1,
    });

    let fragment = session.read_concern_fragment(17)?.expect("fragment");
    assert_eq!(fragment.get_timestamp("afterClusterTime")?, ts);
    assert!(!fragment.contains_key("atClusterTime"));
    Ok(())
}

#[test]
fn snapshot_sessions_project_at_cluster_time() -> Result<()> {
    let mut session = SessionContext::snapshot().with_read_concern_level("snapshot");
    let ts = Timestamp {
        time: 7,
        increment: 1,
    };
    session.set_snapshot_time(ts);

    let fragment = session
        .read_concern_fragment(SNAPSHOT_MIN_WIRE_VERSION)?
        .expect("fragment");
    assert_eq!(fragment.get_str("level")?, "snapshot");
    assert_eq!(fragment.get_timestamp("atClusterTime")?, ts);
    assert!(!fragment.contains_key("afterClusterTime"));
    Ok(())
}

#[test]
fn snapshot_on_old_servers_is_a_configuration_error() {
    let mut session = SessionContext::snapshot();
    session.set_snapshot_time(Timestamp {
        time: 7,
        increment: 1,
    });

    let err = session
        .read_concern_fragment(SNAPSHOT_MIN_WIRE_VERSION - 1)
        .expect_err("too old");
    assert!(matches!(
        err.configuration(),
        Some(ConfigurationError::SnapshotWireVersion { .. })
    ));
}

#[test]
fn cluster_time_only_advances_forward() {
    let mut session = SessionContext::default();
    assert!(session.cluster_time_fragment().is_none());

    let newer = doc! {
        "clusterTime": Timestamp { time: 10, increment: 1 },
        "signature": { "keyId": 1_i64 },
    };
    let older = doc! {
        "clusterTime": Timestamp { time: 5, increment: 9 },
        "signature": { "keyId": 1_i64 },
    };

    session.advance_cluster_time(newer.clone());
    session.advance_cluster_time(older);
    assert_eq!(session.cluster_time(), Some(&newer));

    let fragment = session.cluster_time_fragment().expect("fragment");
    assert_eq!(fragment.get_document("$clusterTime").expect("doc"), &newer);
}
