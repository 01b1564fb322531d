// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use docdb_client_rs::{
    cfg::config::{
        AuthConfig, ClientMetadataConfig, CompressionConfig, Config, ConnectionConfig,
        ServerAddress,
    },
    context::operation::{Deadline, OperationContext},
    error::{Cancellation, ConfigurationError, ErrorKindExt},
    sdam::description::{ClusterType, ServerState, ServerType},
    topology::{
        events::{TopologyEvent, TopologyEventListener, TopologyEventSink},
        load_balanced::LoadBalancedController,
    },
};
use tokio::time::{Instant, sleep};

#[derive(Default)]
struct EventCounter {
    opening: AtomicUsize,
    changed: AtomicUsize,
    closed: AtomicUsize,
}

impl TopologyEventListener for EventCounter {
    fn on_event(&self, event: &TopologyEvent) {
        match event {
            TopologyEvent::Opening { .. } => self.opening.fetch_add(1, Ordering::SeqCst),
            TopologyEvent::DescriptionChanged { .. } => {
                self.changed.fetch_add(1, Ordering::SeqCst)
            },
            TopologyEvent::Closed { .. } => self.closed.fetch_add(1, Ordering::SeqCst),
        };
    }
}

fn lb_config(srv: Option<&str>, host: Option<&str>) -> Config {
    Config {
        connection: ConnectionConfig {
            hosts: host
                .map(|h| h.parse::<ServerAddress>().expect("host"))
                .into_iter()
                .collect(),
            srv_host: srv.map(String::from),
            load_balanced: true,
            connect_timeout: Duration::from_secs(1),
            io_timeout: Duration::from_secs(1),
            max_pool_size: 2,
        },
        auth: AuthConfig::default(),
        compression: CompressionConfig::default(),
        client: ClientMetadataConfig::default(),
        proxy: None,
        server_api: None,
    }
}

fn ctx_with_timeout(t: Duration) -> OperationContext {
    OperationContext::new(Deadline::after(t))
}

#[tokio::test]
async fn srv_single_host_selection_completes_after_resolution() -> Result<()> {
    let counter = Arc::new(EventCounter::default());
    let sink = TopologyEventSink::new(vec![counter.clone() as Arc<dyn TopologyEventListener>]);
    let controller = LoadBalancedController::new(&lb_config(Some("srv.example"), None), sink);

    {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move {
            sleep(Duration::from_millis(40)).await;
            let _ = controller
                .on_srv_resolution(Ok(vec![ServerAddress::new("node-7", 27017)]))
                .await;
        });
    }

    let started = Instant::now();
    let server = controller
        .select_server(&ctx_with_timeout(Duration::from_millis(1000)))
        .await?;
    let waited = started.elapsed();

    assert_eq!(server.id().address, ServerAddress::new("node-7", 27017));
    assert!(waited >= Duration::from_millis(30), "returned before resolution");
    assert!(waited < Duration::from_millis(900), "nearly hit the deadline");

    let description = controller.description().await;
    assert_eq!(description.cluster_type, ClusterType::LoadBalanced);
    let published = &description.servers[0];
    assert_eq!(published.server_type, ServerType::LoadBalancer);
    assert_eq!(published.state, ServerState::Connected);

    assert_eq!(counter.opening.load(Ordering::SeqCst), 1);
    assert_eq!(counter.changed.load(Ordering::SeqCst), 2);
    assert_eq!(counter.closed.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test]
async fn srv_timeout_names_the_hostname_and_last_error() -> Result<()> {
    let controller = LoadBalancedController::new(
        &lb_config(Some("srv.timeout"), None),
        TopologyEventSink::default(),
    );

    let err = controller
        .select_server(&ctx_with_timeout(Duration::from_millis(20)))
        .await
        .expect_err("no resolution ever arrives");
    assert!(matches!(
        err.cancellation(),
        Some(Cancellation::DeadlineExpired { .. })
    ));
    assert!(err.to_string().contains("srv.timeout"));

    // With a recorded resolution error, the message carries it, quoted.
    controller
        .on_srv_resolution(Err("boom".to_string()))
        .await?;
    let err = controller
        .select_server(&ctx_with_timeout(Duration::from_millis(20)))
        .await
        .expect_err("still unresolved");
    assert!(err.to_string().contains("srv.timeout"));
    assert!(err.to_string().contains("'boom'"));
    Ok(())
}

#[tokio::test]
async fn srv_multiple_hosts_poisons_every_selection() -> Result<()> {
    let controller = LoadBalancedController::new(
        &lb_config(Some("srv.multi"), None),
        TopologyEventSink::default(),
    );

    // A waiter enqueued before initialization must get the same outcome.
    let queued = Arc::new(Mutex::new(None));
    {
        let queued = Arc::clone(&queued);
        controller
            .select_server_with_callback(
                &ctx_with_timeout(Duration::from_secs(5)),
                Box::new(move |result| {
                    *queued.lock().expect("lock") = Some(result);
                }),
            )
            .await;
    }

    controller
        .on_srv_resolution(Ok(vec![
            ServerAddress::new("a", 1),
            ServerAddress::new("b", 2),
        ]))
        .await?;

    for _ in 0..2 {
        let err = controller
            .select_server(&ctx_with_timeout(Duration::from_millis(100)))
            .await
            .expect_err("poisoned");
        assert!(matches!(
            err.configuration(),
            Some(ConfigurationError::MultipleSrvHosts { count: 2 })
        ));
    }

    sleep(Duration::from_millis(20)).await;
    let queued_outcome = queued.lock().expect("lock").take().expect("resolved");
    let err = queued_outcome.expect_err("queued waiter poisoned too");
    assert!(matches!(
        err.configuration(),
        Some(ConfigurationError::MultipleSrvHosts { count: 2 })
    ));
    Ok(())
}

#[tokio::test]
async fn static_host_initializes_immediately() -> Result<()> {
    let controller = LoadBalancedController::new(
        &lb_config(None, Some("lb.example:27017")),
        TopologyEventSink::default(),
    );

    let server = controller
        .select_server(&ctx_with_timeout(Duration::from_secs(1)))
        .await?;
    assert_eq!(server.id().address, ServerAddress::new("lb.example", 27017));
    Ok(())
}

#[tokio::test]
async fn queued_waiters_resolve_in_arrival_order() -> Result<()> {
    let controller = LoadBalancedController::new(
        &lb_config(Some("srv.fifo"), None),
        TopologyEventSink::default(),
    );

    let order = Arc::new(Mutex::new(Vec::new()));
    for i in 0..3 {
        let order = Arc::clone(&order);
        controller
            .select_server_with_callback(
                &ctx_with_timeout(Duration::from_secs(5)),
                Box::new(move |result| {
                    assert!(result.is_ok());
                    order.lock().expect("lock").push(i);
                }),
            )
            .await;
    }

    controller
        .on_srv_resolution(Ok(vec![ServerAddress::new("only", 27017)]))
        .await?;

    sleep(Duration::from_millis(20)).await;
    assert_eq!(*order.lock().expect("lock"), vec![0, 1, 2]);
    Ok(())
}

#[tokio::test]
async fn expired_queue_entries_get_exactly_one_timeout() -> Result<()> {
    let controller = LoadBalancedController::new(
        &lb_config(Some("srv.expire"), None),
        TopologyEventSink::default(),
    );

    let outcomes = Arc::new(Mutex::new(Vec::new()));
    {
        let outcomes = Arc::clone(&outcomes);
        controller
            .select_server_with_callback(
                &ctx_with_timeout(Duration::from_millis(30)),
                Box::new(move |result| {
                    outcomes
                        .lock()
                        .expect("lock")
                        .push(result.map(|_| "server").map_err(|e| e.to_string()));
                }),
            )
            .await;
    }

    sleep(Duration::from_millis(120)).await;
    {
        let outcomes = outcomes.lock().expect("lock");
        assert_eq!(outcomes.len(), 1, "exactly one outcome per waiter");
        let err = outcomes[0].as_ref().expect_err("timed out");
        assert!(err.contains("srv.expire"));
    }

    // A late resolution must not double-resolve the expired entry.
    controller
        .on_srv_resolution(Ok(vec![ServerAddress::new("late", 27017)]))
        .await?;
    sleep(Duration::from_millis(20)).await;
    assert_eq!(outcomes.lock().expect("lock").len(), 1);
    Ok(())
}

#[tokio::test]
async fn close_drains_the_queue_and_is_idempotent() -> Result<()> {
    let counter = Arc::new(EventCounter::default());
    let controller = LoadBalancedController::new(
        &lb_config(Some("srv.close"), None),
        TopologyEventSink::new(vec![counter.clone() as Arc<dyn TopologyEventListener>]),
    );

    let outcome = Arc::new(Mutex::new(None));
    {
        let outcome = Arc::clone(&outcome);
        controller
            .select_server_with_callback(
                &ctx_with_timeout(Duration::from_secs(5)),
                Box::new(move |result| {
                    *outcome.lock().expect("lock") = Some(result);
                }),
            )
            .await;
    }

    controller.close().await;
    controller.close().await;

    let drained = outcome.lock().expect("lock").take().expect("resolved");
    let err = drained.expect_err("shutdown");
    assert!(matches!(
        err.cancellation(),
        Some(Cancellation::ShutdownInProgress)
    ));

    let err = controller
        .select_server(&ctx_with_timeout(Duration::from_millis(50)))
        .await
        .expect_err("closed");
    assert!(matches!(
        err.cancellation(),
        Some(Cancellation::ShutdownInProgress)
    ));

    assert_eq!(counter.closed.load(Ordering::SeqCst), 1);
    Ok(())
}
