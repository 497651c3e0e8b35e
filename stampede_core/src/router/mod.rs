//! Per-process message router.
//!
//! Every coordinator, agent and worker process owns one [`Router`]. It
//! holds a link to its parent and one per child, decodes every inbound
//! frame and either dispatches it to the local [`OperationHandler`],
//! resolves a pending [`Promise`], or forwards the original bytes one hop
//! toward the destination.
//!
//! ```text
//!                    C
//!          ┌─────────┴─────────┐
//!          A1                  A2        down: destination below local and
//!      ┌───┴───┐           ┌───┴───┐           reaching it (fan-out to every
//!    A1_W1   A1_W2       A2_W1   A2_W2         child it reaches)
//!                                        up:   anything else, toward C
//! ```
//!
//! Requests are handled on spawned tasks so a slow handler never blocks
//! the dispatch loop. Fire-and-forget notifications are handled one at a
//! time, in arrival order, on a dedicated task.

mod promise;
mod upstream;

pub use promise::{Promise, PromiseTable};
pub use upstream::Upstream;

use crate::error::{CodecError, TransportError};
use crate::failure::{FailureCause, FailureReporter};
use crate::protocol::{
    EnvelopeCodec, EnvelopeHeader, JsonCodec, MessageEnvelope, MessageKind, Operation, Reply,
    ReplyStatus,
};
use async_trait::async_trait;
use stampede_env::{
    inbox, AddressLevel, Frame, InboxReceiver, InboxSender, Link, RuntimeContext,
    SimulatorAddress, DEFAULT_INBOX_CAPACITY,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Local dispatch callback.
#[async_trait]
pub trait OperationHandler: Send + Sync + 'static {
    /// Handles an envelope addressed to this endpoint.
    ///
    /// The reply is sent back for requests and discarded for
    /// fire-and-forget notifications.
    async fn handle(&self, envelope: MessageEnvelope) -> Reply;
}

/// Configuration for a [`Router`].
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Timeout applied by [`Router::send`] (default: 30s)
    pub request_timeout: Duration,
    /// How often abandoned promises are expired (default: 1s)
    pub sweep_interval: Duration,
    /// Frames buffered per inbox (default: 4096). The dispatch loop
    /// forwards into child inboxes, so a full child inbox makes it wait.
    pub inbox_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(1),
            inbox_capacity: DEFAULT_INBOX_CAPACITY,
        }
    }
}

impl RouterConfig {
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

enum Route {
    Local,
    Links(Vec<Arc<dyn Link>>),
    Nowhere,
}

/// Message router of one endpoint.
pub struct Router<Ctx: RuntimeContext> {
    ctx: Arc<Ctx>,
    local: SimulatorAddress,
    config: RouterConfig,
    codec: Arc<dyn EnvelopeCodec>,
    inbox_tx: InboxSender,
    inbox_rx: Mutex<Option<InboxReceiver>>,
    parent: RwLock<Option<Arc<dyn Link>>>,
    children: RwLock<BTreeMap<SimulatorAddress, Arc<dyn Link>>>,
    promises: Arc<PromiseTable>,
    next_correlation_id: AtomicU64,
    handler: RwLock<Option<Arc<dyn OperationHandler>>>,
    reporter: RwLock<Option<Arc<FailureReporter>>>,
    shutdown: watch::Sender<bool>,
}

impl<Ctx: RuntimeContext> Router<Ctx> {
    /// Creates a router speaking JSON.
    pub fn new(ctx: Arc<Ctx>, local: SimulatorAddress, config: RouterConfig) -> Arc<Self> {
        Self::with_codec(ctx, local, config, Arc::new(JsonCodec))
    }

    pub fn with_codec(
        ctx: Arc<Ctx>,
        local: SimulatorAddress,
        config: RouterConfig,
        codec: Arc<dyn EnvelopeCodec>,
    ) -> Arc<Self> {
        let (inbox_tx, inbox_rx) = inbox(config.inbox_capacity);
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            ctx,
            local,
            config,
            codec,
            inbox_tx,
            inbox_rx: Mutex::new(Some(inbox_rx)),
            parent: RwLock::new(None),
            children: RwLock::new(BTreeMap::new()),
            promises: PromiseTable::new(),
            next_correlation_id: AtomicU64::new(0),
            handler: RwLock::new(None),
            reporter: RwLock::new(None),
            shutdown,
        })
    }

    pub fn local(&self) -> SimulatorAddress {
        self.local
    }

    pub fn context(&self) -> &Arc<Ctx> {
        &self.ctx
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Sender that links use to deliver frames to this router.
    pub fn inbox_sender(&self) -> InboxSender {
        self.inbox_tx.clone()
    }

    pub fn set_parent(&self, link: Arc<dyn Link>) {
        tracing::debug!(local = %self.local, parent = %link.remote(), "parent link set");
        *self.parent.write().unwrap_or_else(PoisonError::into_inner) = Some(link);
    }

    pub fn parent_address(&self) -> Option<SimulatorAddress> {
        self.parent
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|link| link.remote())
    }

    pub fn add_child(&self, link: Arc<dyn Link>) {
        let remote = link.remote();
        tracing::debug!(local = %self.local, child = %remote, "child link added");
        self.children
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(remote, link);
    }

    pub fn remove_child(&self, address: &SimulatorAddress) -> bool {
        self.children
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(address)
            .is_some()
    }

    /// Addresses of the direct children, in address order.
    pub fn children(&self) -> Vec<SimulatorAddress> {
        self.children
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    pub fn set_handler(&self, handler: Arc<dyn OperationHandler>) {
        *self.handler.write().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    /// Reporter receiving decode failures and other local protocol faults.
    pub fn set_reporter(&self, reporter: Arc<FailureReporter>) {
        *self.reporter.write().unwrap_or_else(PoisonError::into_inner) = Some(reporter);
    }

    /// Number of requests awaiting a response.
    pub fn in_flight(&self) -> usize {
        self.promises.len()
    }

    /// Starts the dispatch, notification and sweeper tasks. Later calls are no-ops.
    pub fn start(self: &Arc<Self>) {
        let inbox = self
            .inbox_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(inbox) = inbox else {
            tracing::debug!(local = %self.local, "router already started");
            return;
        };

        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        self.ctx.spawn(
            "router-dispatch",
            Arc::clone(self).dispatch_loop(inbox, notify_tx),
        );
        self.ctx
            .spawn("router-notify", Arc::clone(self).notification_loop(notify_rx));
        self.ctx
            .spawn("router-sweep", Self::sweep_loop(Arc::downgrade(self)));
        tracing::info!(local = %self.local, "router started");
    }

    /// Stops the dispatch loop and fails every outstanding promise.
    pub fn shutdown(&self) {
        self.shutdown.send_modify(|stopped| *stopped = true);
        let failed = self.promises.fail_all();
        tracing::info!(local = %self.local, failed, "router shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Sends a request with the default timeout.
    pub async fn send(
        &self,
        destination: SimulatorAddress,
        operation: Operation,
    ) -> Result<Promise, TransportError> {
        self.send_with_timeout(destination, operation, self.config.request_timeout)
            .await
    }

    /// Sends a request; the returned promise fails after `timeout`.
    pub async fn send_with_timeout(
        &self,
        destination: SimulatorAddress,
        operation: Operation,
        timeout: Duration,
    ) -> Result<Promise, TransportError> {
        let correlation_id = self.next_correlation_id();
        let envelope = MessageEnvelope::request(self.local, destination, correlation_id, operation);

        // registered before transmitting so a fast answer finds it
        let promise = self.promises.register(correlation_id, destination, timeout);
        if let Err(e) = self.send_envelope(&envelope).await {
            self.promises.remove(correlation_id);
            return Err(e);
        }
        Ok(promise)
    }

    /// Sends a request and waits for its reply.
    pub async fn request(
        &self,
        destination: SimulatorAddress,
        operation: Operation,
    ) -> Result<Reply, TransportError> {
        self.send(destination, operation).await?.wait().await
    }

    /// Sends a notification; no response is expected.
    pub async fn fire_and_forget(
        &self,
        destination: SimulatorAddress,
        operation: Operation,
    ) -> Result<(), TransportError> {
        let envelope = MessageEnvelope::fire_and_forget(
            self.local,
            destination,
            self.next_correlation_id(),
            operation,
        );
        self.send_envelope(&envelope).await
    }

    fn next_correlation_id(&self) -> u64 {
        self.next_correlation_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn handler(&self) -> Option<Arc<dyn OperationHandler>> {
        self.handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn report_fault(&self, cause: FailureCause) {
        let reporter = self
            .reporter
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(reporter) = reporter {
            reporter.report(cause, None);
        }
    }

    /// True if the destination designates this endpoint. Workers also
    /// accept test-level destinations under them.
    fn is_local(&self, destination: &SimulatorAddress) -> bool {
        destination.covers(&self.local)
            || (self.local.level() == AddressLevel::Worker
                && destination.level() == AddressLevel::Test
                && destination.reaches(&self.local))
    }

    fn route(&self, destination: &SimulatorAddress) -> Route {
        if self.is_local(destination) {
            return Route::Local;
        }

        if destination.level() > self.local.level() && destination.reaches(&self.local) {
            let links: Vec<Arc<dyn Link>> = self
                .children
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .filter(|(child, _)| destination.reaches(child))
                .map(|(_, link)| Arc::clone(link))
                .collect();
            return if links.is_empty() {
                Route::Nowhere
            } else {
                Route::Links(links)
            };
        }

        match self
            .parent
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            Some(link) => Route::Links(vec![Arc::clone(link)]),
            None => Route::Nowhere,
        }
    }

    async fn send_envelope(&self, envelope: &MessageEnvelope) -> Result<(), TransportError> {
        let frame = self.codec.encode(envelope)?;
        self.transmit(envelope.destination, frame).await
    }

    /// Delivers a frame one hop toward `destination`.
    async fn transmit(
        &self,
        destination: SimulatorAddress,
        frame: Frame,
    ) -> Result<(), TransportError> {
        match self.route(&destination) {
            Route::Local => self
                .inbox_tx
                .send(frame)
                .await
                .map_err(|_| TransportError::Closed),
            Route::Links(links) => {
                let mut delivered = 0;
                let mut last_error = None;
                for link in links {
                    match link.send(frame.clone()).await {
                        Ok(()) => delivered += 1,
                        Err(e) => {
                            tracing::warn!(
                                local = %self.local,
                                remote = %link.remote(),
                                error = %e,
                                "link send failed"
                            );
                            last_error = Some(e);
                        }
                    }
                }
                match (delivered, last_error) {
                    (0, Some(e)) => Err(TransportError::Env(e)),
                    (0, None) => Err(TransportError::Unreachable(destination)),
                    _ => Ok(()),
                }
            }
            Route::Nowhere => Err(TransportError::Unreachable(destination)),
        }
    }

    async fn respond(&self, header: &EnvelopeHeader, reply: Reply) {
        let envelope = MessageEnvelope::response(header, self.local, Operation::Reply(reply));
        if let Err(e) = self.send_envelope(&envelope).await {
            tracing::warn!(
                local = %self.local,
                destination = %header.source,
                correlation_id = header.correlation_id,
                error = %e,
                "response undeliverable"
            );
        }
    }

    async fn dispatch_loop(
        self: Arc<Self>,
        mut inbox: InboxReceiver,
        notify: mpsc::UnboundedSender<MessageEnvelope>,
    ) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                frame = inbox.recv() => match frame {
                    Some(frame) => self.on_frame(frame, &notify).await,
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        tracing::debug!(local = %self.local, "dispatch loop stopped");
    }

    async fn on_frame(self: &Arc<Self>, frame: Frame, notify: &mpsc::UnboundedSender<MessageEnvelope>) {
        let envelope = match self.codec.decode(&frame) {
            Ok(envelope) => envelope,
            Err(CodecError::UnsupportedOperation {
                tag,
                header: Some(header),
            }) => {
                if !self.is_local(&header.destination) {
                    // a hop closer to the destination may understand it
                    if let Err(e) = self.transmit(header.destination, frame).await {
                        self.undeliverable(&header, e).await;
                    }
                    return;
                }
                tracing::warn!(
                    local = %self.local,
                    source = %header.source,
                    tag = %tag,
                    "unsupported operation"
                );
                self.report_fault(FailureCause::Protocol(format!(
                    "unsupported operation '{}' from {}",
                    tag, header.source
                )));
                if header.kind == MessageKind::Request {
                    self.respond(&header, Reply::error(ReplyStatus::UnsupportedOperation, tag))
                        .await;
                }
                return;
            }
            Err(e) => {
                tracing::warn!(local = %self.local, error = %e, "dropping undecodable frame");
                self.report_fault(FailureCause::Protocol(e.to_string()));
                return;
            }
        };

        let header = envelope.header();
        if self.is_local(&header.destination) {
            self.deliver_local(envelope, notify);
        } else if let Err(e) = self.transmit(header.destination, frame).await {
            self.undeliverable(&header, e).await;
        }
    }

    fn deliver_local(self: &Arc<Self>, envelope: MessageEnvelope, notify: &mpsc::UnboundedSender<MessageEnvelope>) {
        match envelope.kind {
            MessageKind::Response => {
                let correlation_id = envelope.correlation_id;
                let source = envelope.source;
                let outcome = match envelope.payload {
                    Operation::Reply(reply) => Ok(reply),
                    other => Err(TransportError::Codec(CodecError::Malformed(format!(
                        "response carried {}",
                        other.tag()
                    )))),
                };
                if !self.promises.complete(correlation_id, outcome) {
                    tracing::warn!(
                        local = %self.local,
                        %source,
                        correlation_id,
                        "late or duplicate response dropped"
                    );
                }
            }
            MessageKind::FireAndForget => {
                if notify.send(envelope).is_err() {
                    tracing::debug!(local = %self.local, "notification loop closed");
                }
            }
            MessageKind::Request => {
                let router = Arc::clone(self);
                self.ctx.spawn("router-request", async move {
                    let header = envelope.header();
                    let reply = match router.handler() {
                        Some(handler) => handler.handle(envelope).await,
                        None => Reply::error(
                            ReplyStatus::UnsupportedOperation,
                            "no handler registered",
                        ),
                    };
                    router.respond(&header, reply).await;
                });
            }
        }
    }

    async fn undeliverable(&self, header: &EnvelopeHeader, error: TransportError) {
        tracing::warn!(
            local = %self.local,
            source = %header.source,
            destination = %header.destination,
            kind = ?header.kind,
            error = %error,
            "envelope undeliverable"
        );
        if header.kind == MessageKind::Request {
            let status = not_found_status(&header.destination);
            self.respond(header, Reply::error(status, header.destination.to_string()))
                .await;
        }
    }

    async fn notification_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<MessageEnvelope>) {
        while let Some(envelope) = rx.recv().await {
            let Some(handler) = self.handler() else {
                tracing::warn!(local = %self.local, op = envelope.payload.tag(), "no handler for notification");
                continue;
            };
            let tag = envelope.payload.tag();
            let reply = handler.handle(envelope).await;
            if !reply.is_success() {
                tracing::debug!(local = %self.local, op = tag, status = %reply.status, "notification rejected");
            }
        }
    }

    async fn sweep_loop(router: Weak<Self>) {
        let Some((ctx, interval, mut shutdown)) = router.upgrade().map(|r| {
            (Arc::clone(&r.ctx), r.config.sweep_interval, r.shutdown.subscribe())
        }) else {
            return;
        };
        loop {
            tokio::select! {
                _ = ctx.sleep(interval) => {}
                _ = shutdown.changed() => break,
            }
            let Some(router) = router.upgrade() else {
                break;
            };
            let expired = router.promises.expire(tokio::time::Instant::now());
            if expired > 0 {
                tracing::debug!(local = %router.local, expired, "expired abandoned promises");
            }
        }
    }
}

fn not_found_status(destination: &SimulatorAddress) -> ReplyStatus {
    match destination.level() {
        AddressLevel::Agent => ReplyStatus::AgentNotFound,
        AddressLevel::Worker => ReplyStatus::WorkerNotFound,
        AddressLevel::Test => ReplyStatus::TestNotFound,
        AddressLevel::Coordinator => ReplyStatus::Exception,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::FailureType;
    use stampede_env::{ChannelLink, LinkController, TokioContext};
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;

    struct EchoHandler {
        local: SimulatorAddress,
        notifications: AtomicUsize,
    }

    #[async_trait]
    impl OperationHandler for EchoHandler {
        async fn handle(&self, envelope: MessageEnvelope) -> Reply {
            if envelope.kind == MessageKind::FireAndForget {
                self.notifications.fetch_add(1, Ordering::SeqCst);
            }
            match envelope.payload {
                Operation::ExecuteScript { script, .. } if script == "hang" => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Reply::success()
                }
                Operation::ExecuteScript { script, .. } if script == "slow" => {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    Reply::success_with("slow")
                }
                op => Reply::success_with(format!("{} {}", self.local, op.tag())),
            }
        }
    }

    struct Node {
        router: Arc<Router<TokioContext>>,
        handler: Arc<EchoHandler>,
    }

    fn node(local: SimulatorAddress) -> Node {
        let router = Router::new(
            Arc::new(TokioContext::seeded(1)),
            local,
            RouterConfig::default()
                .with_request_timeout(Duration::from_secs(2))
                .with_sweep_interval(Duration::from_millis(50)),
        );
        let handler = Arc::new(EchoHandler {
            local,
            notifications: AtomicUsize::new(0),
        });
        router.set_handler(handler.clone());
        router.start();
        Node { router, handler }
    }

    fn connect(parent: &Node, child: &Node) -> Arc<ChannelLink> {
        let down = ChannelLink::new(child.router.local(), child.router.inbox_sender());
        let up = ChannelLink::new(parent.router.local(), parent.router.inbox_sender());
        parent.router.add_child(down.clone());
        child.router.set_parent(up);
        down
    }

    /// Coordinator with `agents` agents of `workers` workers each.
    fn cluster(agents: u32, workers: u32) -> (Node, Vec<Node>, Vec<Node>) {
        let coordinator = node(SimulatorAddress::coordinator());
        let mut agent_nodes = Vec::new();
        let mut worker_nodes = Vec::new();
        for a in 1..=agents {
            let agent = node(SimulatorAddress::agent(a));
            connect(&coordinator, &agent);
            for w in 1..=workers {
                let worker = node(SimulatorAddress::worker(a, w));
                connect(&agent, &worker);
                worker_nodes.push(worker);
            }
            agent_nodes.push(agent);
        }
        (coordinator, agent_nodes, worker_nodes)
    }

    #[tokio::test]
    async fn test_request_down_and_up() {
        let (coordinator, _agents, workers) = cluster(2, 2);

        let reply = coordinator
            .router
            .request(SimulatorAddress::worker(2, 1), Operation::Ping)
            .await
            .unwrap();
        assert_eq!(reply.payload.as_deref(), Some("A2_W1 PING"));

        let reply = workers[0]
            .router
            .request(SimulatorAddress::coordinator(), Operation::Ping)
            .await
            .unwrap();
        assert_eq!(reply.payload.as_deref(), Some("C PING"));
    }

    #[tokio::test]
    async fn test_worker_to_sibling_agent_worker() {
        let (_coordinator, _agents, workers) = cluster(2, 1);
        let reply = workers[0]
            .router
            .request(SimulatorAddress::worker(2, 1), Operation::Ping)
            .await
            .unwrap();
        assert_eq!(reply.payload.as_deref(), Some("A2_W1 PING"));
    }

    #[tokio::test]
    async fn test_test_address_is_handled_by_worker() {
        let (coordinator, _agents, _workers) = cluster(1, 1);
        let reply = coordinator
            .router
            .request(SimulatorAddress::test(1, 1, 3), Operation::Ping)
            .await
            .unwrap();
        assert_eq!(reply.payload.as_deref(), Some("A1_W1 PING"));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_worker() {
        let (coordinator, agents, workers) = cluster(2, 2);
        coordinator
            .router
            .fire_and_forget(SimulatorAddress::all_workers(), Operation::Ping)
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while workers
                .iter()
                .map(|w| w.handler.notifications.load(Ordering::SeqCst))
                .sum::<usize>()
                < 4
            {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        for agent in &agents {
            assert_eq!(agent.handler.notifications.load(Ordering::SeqCst), 0);
        }
    }

    #[tokio::test]
    async fn test_scoped_broadcast_stays_in_subtree() {
        let (coordinator, _agents, workers) = cluster(2, 2);
        coordinator
            .router
            .fire_and_forget(SimulatorAddress::worker(2, stampede_env::ALL), Operation::Ping)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let counts: Vec<usize> = workers
            .iter()
            .map(|w| w.handler.notifications.load(Ordering::SeqCst))
            .collect();
        assert_eq!(counts, vec![0, 0, 1, 1]);
    }

    #[tokio::test]
    async fn test_unroutable_requests_get_not_found() {
        let (coordinator, _agents, _workers) = cluster(1, 1);

        let reply = coordinator
            .router
            .request(SimulatorAddress::worker(1, 9), Operation::Ping)
            .await
            .unwrap();
        assert_eq!(reply.status, ReplyStatus::WorkerNotFound);

        let err = coordinator
            .router
            .send(SimulatorAddress::agent(5), Operation::Ping)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_timeout_and_no_head_of_line_blocking() {
        let (coordinator, _agents, _workers) = cluster(1, 1);
        let worker = SimulatorAddress::worker(1, 1);

        let hanging = coordinator
            .router
            .send_with_timeout(
                worker,
                Operation::ExecuteScript {
                    script: "hang".into(),
                    fire_and_forget: false,
                },
                Duration::from_millis(200),
            )
            .await
            .unwrap();
        let slow = coordinator
            .router
            .send(
                worker,
                Operation::ExecuteScript {
                    script: "slow".into(),
                    fire_and_forget: false,
                },
            )
            .await
            .unwrap();

        let ping = coordinator.router.request(worker, Operation::Ping).await.unwrap();
        assert!(ping.is_success());

        assert!(matches!(
            hanging.wait().await,
            Err(TransportError::Timeout { .. })
        ));
        assert_eq!(slow.wait().await.unwrap().payload.as_deref(), Some("slow"));
        assert_eq!(coordinator.router.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_requests_resolve_once_each() {
        let (coordinator, _agents, _workers) = cluster(1, 2);
        let router = coordinator.router.clone();

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..50u32 {
            let router = router.clone();
            tasks.spawn(async move {
                let target = SimulatorAddress::worker(1, 1 + i % 2);
                let promise = router.send(target, Operation::Ping).await.unwrap();
                let id = promise.correlation_id();
                let reply = promise.wait().await.unwrap();
                (id, target, reply)
            });
        }

        let mut ids = HashSet::new();
        while let Some(result) = tasks.join_next().await {
            let (id, target, reply) = result.unwrap();
            assert!(ids.insert(id));
            assert_eq!(reply.payload, Some(format!("{} PING", target)));
        }
        assert_eq!(ids.len(), 50);
        assert_eq!(router.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_unknown_operation_answered_and_reported() {
        let agent = node(SimulatorAddress::agent(1));
        let reporter = FailureReporter::shared(SimulatorAddress::agent(1));
        agent.router.set_reporter(reporter.clone());

        // stand-in parent that records what the agent sends upward
        let (parent_tx, mut parent_rx) = inbox(8);
        agent
            .router
            .set_parent(ChannelLink::new(SimulatorAddress::coordinator(), parent_tx));

        let frame = br#"{"source":"C","destination":"A1","correlation_id":77,"kind":"REQUEST","payload":{"op":"REBALANCE","weight":3}}"#;
        agent.router.inbox_sender().send(frame.to_vec()).await.unwrap();

        let response = tokio::time::timeout(Duration::from_secs(2), parent_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let envelope = JsonCodec.decode(&response).unwrap();
        assert_eq!(envelope.kind, MessageKind::Response);
        assert_eq!(envelope.correlation_id, 77);
        match envelope.payload {
            Operation::Reply(reply) => assert_eq!(reply.status, ReplyStatus::UnsupportedOperation),
            other => panic!("unexpected payload {:?}", other),
        }

        let records = reporter.drain();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].failure_type, FailureType::ProtocolError);

        // garbage is dropped, the router keeps serving
        agent.router.inbox_sender().send(b"\x00\x01".to_vec()).await.unwrap();
        let reply = agent
            .router
            .request(SimulatorAddress::agent(1), Operation::Ping)
            .await
            .unwrap();
        assert!(reply.is_success());
    }

    #[tokio::test]
    async fn test_severed_child_fails_send() {
        let coordinator = node(SimulatorAddress::coordinator());
        let agent = node(SimulatorAddress::agent(1));
        let link = connect(&coordinator, &agent);
        link.sever();

        let err = coordinator
            .router
            .send(SimulatorAddress::agent(1), Operation::Ping)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::Env(_)));
        assert_eq!(coordinator.router.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_fails_pending() {
        let (coordinator, _agents, _workers) = cluster(1, 1);
        let promise = coordinator
            .router
            .send(
                SimulatorAddress::worker(1, 1),
                Operation::ExecuteScript {
                    script: "hang".into(),
                    fire_and_forget: false,
                },
            )
            .await
            .unwrap();
        coordinator.router.shutdown();
        assert!(matches!(promise.wait().await, Err(TransportError::Closed)));
        assert!(coordinator.router.is_shut_down());
    }
}
