// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Topology controller for a single server behind an external load
//! balancer.
//!
//! With a static host the controller is born initialized. With an SRV name
//! it stays *pre-initialized*, queueing selections, until the first
//! successful resolution delivers exactly one host. More than one
//! host poisons the controller: initialization completes but every
//! selection fails with the same configuration error.

use std::{
    collections::VecDeque,
    sync::{Arc, Weak},
};

use anyhow::{Result, anyhow};
use bson::oid::ObjectId;
use once_cell::sync::OnceCell;
use tokio::{
    sync::{Mutex, Notify, watch},
    time::{Instant, sleep_until, timeout_at},
};
use tracing::{debug, warn};

use crate::{
    cfg::{config::Config, enums::ConnectionMode},
    client::pool::ConnectionPool,
    context::operation::{Deadline, OperationContext},
    error::{Cancellation, ConfigurationError},
    sdam::{
        description::{ClusterDescription, ClusterType, ServerDescription, ServerId},
        issue::Server,
    },
    topology::{
        events::{TopologyEvent, TopologyEventSink},
        srv::{SrvMonitor, SrvOutcome},
    },
};

/// A selection outcome consumer. Runs inline in the caller when the
/// controller is already initialized, on the wait-queue handler otherwise.
pub type SelectionCallback = Box<dyn FnOnce(Result<Arc<Server>>) + Send>;

/// One queued selection request.
struct WaitQueueEntry {
    operation_id: i64,
    deadline: Deadline,
    callback: SelectionCallback,
    enqueued_at: Instant,
}

enum Phase {
    PreInitialized {
        last_srv_error: Option<String>,
        queue: VecDeque<WaitQueueEntry>,
    },
    Initialized {
        server: Arc<Server>,
    },
    /// Initialization completed, but in a state that fails every
    /// selection with the same stable configuration error.
    Poisoned {
        error: ConfigurationError,
    },
    Closed,
}

struct State {
    phase: Phase,
    description: ClusterDescription,
    srv: Option<SrvMonitor>,
    worker_started: bool,
}

pub struct LoadBalancedController {
    cluster_id: ObjectId,
    srv_hostname: Option<String>,
    max_pool_size: u32,
    /// The controller lock. Tokio mutexes grant waiters in FIFO order,
    /// which is what keeps wait-queue insertion fair.
    inner: Mutex<State>,
    /// Condition variable: bumped on every phase change.
    epoch: watch::Sender<u64>,
    /// Wakes the wait-queue handler on enqueue, close, and init.
    worker_wakeup: Notify,
    events: TopologyEventSink,
    /// Back-reference for spawning the wait-queue handler task.
    self_weak: OnceCell<Weak<Self>>,
}

impl LoadBalancedController {
    pub fn new(cfg: &Config, events: TopologyEventSink) -> Arc<Self> {
        let cluster_id = ObjectId::new();
        let srv_hostname = cfg.connection.srv_host.clone();
        let (epoch, _) = watch::channel(0u64);

        events.emit(TopologyEvent::Opening { cluster_id });

        let initial_description = ClusterDescription::new(
            ConnectionMode::LoadBalanced,
            ClusterType::LoadBalanced,
            Vec::new(),
        );
        events.emit(TopologyEvent::DescriptionChanged {
            cluster_id,
            previous: ClusterDescription::new(
                ConnectionMode::LoadBalanced,
                ClusterType::Unknown,
                Vec::new(),
            ),
            current: initial_description.clone(),
        });

        let controller = Arc::new(Self {
            cluster_id,
            srv_hostname: srv_hostname.clone(),
            max_pool_size: cfg.connection.max_pool_size,
            inner: Mutex::new(State {
                phase: Phase::PreInitialized {
                    last_srv_error: None,
                    queue: VecDeque::new(),
                },
                description: initial_description,
                srv: srv_hostname.map(SrvMonitor::new),
                worker_started: false,
            }),
            epoch,
            worker_wakeup: Notify::new(),
            events,
            self_weak: OnceCell::new(),
        });
        let _ = controller.self_weak.set(Arc::downgrade(&controller));

        if let Some(host) = cfg.connection.hosts.first() {
            // No SRV indirection: synthesize the connected server at once.
            let host = host.clone();
            let this = Arc::clone(&controller);
            tokio::spawn(async move {
                let _ = this.on_srv_resolution(Ok(vec![host])).await;
            });
        }

        controller
    }

    pub fn cluster_id(&self) -> ObjectId {
        self.cluster_id
    }

    pub async fn description(&self) -> ClusterDescription {
        self.inner.lock().await.description.clone()
    }

    pub async fn srv_cancel_token(&self) -> Option<tokio_util::sync::CancellationToken> {
        self.inner
            .lock()
            .await
            .srv
            .as_ref()
            .map(|m| m.cancel_token().clone())
    }

    fn make_server(&self, address: crate::cfg::config::ServerAddress) -> Arc<Server> {
        let id = ServerId::new(self.cluster_id, address);
        let pool = ConnectionPool::new(id.clone(), self.max_pool_size);
        Arc::new(Server::new_connected_load_balancer(id, pool))
    }

    fn bump_epoch(&self) {
        self.epoch.send_modify(|e| *e += 1);
        self.worker_wakeup.notify_waiters();
    }

    fn publish(&self, state: &mut State, servers: Vec<ServerDescription>) -> TopologyEvent {
        let previous = state.description.clone();
        state.description = ClusterDescription::new(
            ConnectionMode::LoadBalanced,
            ClusterType::LoadBalanced,
            servers,
        );
        TopologyEvent::DescriptionChanged {
            cluster_id: self.cluster_id,
            previous,
            current: state.description.clone(),
        }
    }

    /// Entry point of the SRV callback contract. The first successful
    /// resolution initializes the controller; failures before that only
    /// record the latest error for timeout messages.
    pub async fn on_srv_resolution(&self, outcome: SrvOutcome) -> Result<()> {
        let mut drained: Vec<(WaitQueueEntry, Result<Arc<Server>>)> = Vec::new();
        let mut event = None;

        {
            let mut state = self.inner.lock().await;
            let Phase::PreInitialized {
                last_srv_error,
                queue,
            } = &mut state.phase
            else {
                // Already initialized or closed; late resolutions are noise.
                return Ok(());
            };

            match outcome {
                Err(e) => {
                    debug!(error = %e, "SRV resolution failed before initialization");
                    *last_srv_error = Some(e);
                },
                Ok(hosts) => {
                    match hosts.as_slice() {
                        [address] => {
                            let server = self.make_server(address.clone());
                            for entry in std::mem::take(queue) {
                                drained.push((entry, Ok(Arc::clone(&server))));
                            }
                            event = Some(self.publish(
                                &mut state,
                                vec![server.description().as_ref().clone()],
                            ));
                            state.phase = Phase::Initialized { server };
                        },
                        many => {
                            let poison =
                                ConfigurationError::MultipleSrvHosts { count: many.len() };
                            for entry in std::mem::take(queue) {
                                drained.push((entry, Err(anyhow!(poison.clone()))));
                            }
                            event = Some(self.publish(&mut state, Vec::new()));
                            state.phase = Phase::Poisoned { error: poison };
                        },
                    }
                    if let Some(srv) = &state.srv {
                        srv.close();
                    }
                },
            }
        }

        // Waiters resolve outside the lock, in arrival order.
        for (entry, result) in drained {
            debug!(
                operation = entry.operation_id,
                waited_ms = entry.enqueued_at.elapsed().as_millis() as u64,
                "resolving queued selection"
            );
            (entry.callback)(result);
        }
        if let Some(event) = event {
            self.events.emit(event);
        }
        self.bump_epoch();
        Ok(())
    }

    fn timeout_error(&self, last_srv_error: Option<String>) -> anyhow::Error {
        let host = self.srv_hostname.clone().unwrap_or_default();
        let mut message = format!("timed out selecting a server for '{host}'");
        if let Some(e) = last_srv_error {
            message.push_str(&format!("; last SRV resolution error: '{e}'"));
        }
        anyhow!(Cancellation::deadline_with(message))
    }

    /// Suspending selection: waits on the controller condition with the
    /// operation deadline.
    pub async fn select_server(&self, ctx: &OperationContext) -> Result<Arc<Server>> {
        let mut epoch_rx = self.epoch.subscribe();
        loop {
            {
                let state = self.inner.lock().await;
                match &state.phase {
                    Phase::Initialized { server } => return Ok(Arc::clone(server)),
                    Phase::Poisoned { error } => return Err(anyhow!(error.clone())),
                    Phase::Closed => return Err(anyhow!(Cancellation::ShutdownInProgress)),
                    Phase::PreInitialized { .. } => {},
                }
            }

            let wait = epoch_rx.changed();
            let outcome = tokio::select! {
                _ = ctx.cancel_token().cancelled() => Err(anyhow!(Cancellation::Interrupted)),
                changed = async {
                    match ctx.deadline() {
                        Deadline::Infinite => Ok(wait.await),
                        Deadline::At(at) => timeout_at(at, wait).await,
                    }
                } => match changed {
                    Ok(_) => Ok(()),
                    Err(_) => {
                        let last = self.last_srv_error().await;
                        Err(self.timeout_error(last))
                    },
                },
            };
            outcome?;
        }
    }

    async fn last_srv_error(&self) -> Option<String> {
        match &self.inner.lock().await.phase {
            Phase::PreInitialized { last_srv_error, .. } => last_srv_error.clone(),
            _ => None,
        }
    }

    /// Callback selection: dispatches inline when initialized, otherwise
    /// enqueues and lazily starts the single wait-queue handler.
    pub async fn select_server_with_callback(
        &self,
        ctx: &OperationContext,
        callback: SelectionCallback,
    ) {
        let inline: Option<(SelectionCallback, Result<Arc<Server>>)> = {
            let mut state = self.inner.lock().await;
            match &mut state.phase {
                Phase::Initialized { server } => Some((callback, Ok(Arc::clone(server)))),
                Phase::Poisoned { error } => Some((callback, Err(anyhow!(error.clone())))),
                Phase::Closed => {
                    Some((callback, Err(anyhow!(Cancellation::ShutdownInProgress))))
                },
                Phase::PreInitialized { queue, .. } => {
                    queue.push_back(WaitQueueEntry {
                        operation_id: ctx.id(),
                        deadline: ctx.deadline(),
                        callback,
                        enqueued_at: Instant::now(),
                    });
                    if !state.worker_started {
                        match self.self_weak.get().and_then(Weak::upgrade) {
                            Some(this) => {
                                state.worker_started = true;
                                tokio::spawn(async move { this.worker_loop().await });
                            },
                            None => warn!("controller is not Arc-backed; queue untended"),
                        }
                    }
                    None
                },
            }
        };

        if let Some((callback, result)) = inline {
            callback(result);
        } else {
            self.worker_wakeup.notify_waiters();
        }
    }

    /// The wait-queue handler: expires overdue entries (their callbacks
    /// run outside the lock) and parks until the next earliest deadline or
    /// a phase change. Exits once the controller leaves pre-initialization;
    /// the transition itself drains the queue.
    async fn worker_loop(self: Arc<Self>) {
        loop {
            let (expired, next_wakeup, finished) = {
                let mut state = self.inner.lock().await;
                match &mut state.phase {
                    Phase::PreInitialized { queue, .. } => {
                        let mut expired = Vec::new();
                        let mut remaining = VecDeque::with_capacity(queue.len());
                        let mut next: Option<Instant> = None;
                        for entry in std::mem::take(queue) {
                            match entry.deadline {
                                Deadline::At(at) if Instant::now() >= at => {
                                    expired.push(entry);
                                },
                                Deadline::At(at) => {
                                    next = Some(next.map_or(at, |n| n.min(at)));
                                    remaining.push_back(entry);
                                },
                                Deadline::Infinite => remaining.push_back(entry),
                            }
                        }
                        *queue = remaining;
                        (expired, next, false)
                    },
                    _ => (Vec::new(), None, true),
                }
            };

            if !expired.is_empty() {
                let last = self.last_srv_error().await;
                for entry in expired {
                    debug!(operation = entry.operation_id, "queued selection timed out");
                    (entry.callback)(Err(self.timeout_error(last.clone())));
                }
            }
            if finished {
                return;
            }

            match next_wakeup {
                Some(at) => {
                    tokio::select! {
                        _ = self.worker_wakeup.notified() => {},
                        _ = sleep_until(at) => {},
                    }
                },
                None => self.worker_wakeup.notified().await,
            }
        }
    }

    /// Idempotent close: signals the condition, shuts the SRV monitor and
    /// the server, drains the queue with shutdown errors, and fires the
    /// closed event.
    pub async fn close(&self) {
        let (drained, server) = {
            let mut state = self.inner.lock().await;
            if matches!(state.phase, Phase::Closed) {
                return;
            }
            if let Some(srv) = &state.srv {
                srv.close();
            }
            let mut drained = VecDeque::new();
            let mut server = None;
            match std::mem::replace(&mut state.phase, Phase::Closed) {
                Phase::PreInitialized { queue, .. } => drained = queue,
                Phase::Initialized { server: s } => server = Some(s),
                Phase::Poisoned { .. } | Phase::Closed => {},
            }
            (drained, server)
        };

        for entry in drained {
            (entry.callback)(Err(anyhow!(Cancellation::ShutdownInProgress)));
        }
        if let Some(server) = server {
            server.close().await;
        }
        self.bump_epoch();
        self.events.emit(TopologyEvent::Closed {
            cluster_id: self.cluster_id,
        });
    }
}
