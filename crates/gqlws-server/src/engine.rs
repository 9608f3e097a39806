//! Server side of the `graphql-ws` subprotocol for one connection.
//!
//! [`ServerEngine`] owns the connection's state machine and operation
//! registry. Inbound frames are handled one at a time through `&mut self`;
//! each `start` spawns an operation task that talks back only through the
//! [`TransportHandle`] and its cancellation token.
//!
//! Per operation id the peer sees `data*` followed by exactly one
//! `complete` or `error`, unless the operation is stopped, in which case
//! nothing follows the stop.

use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use gqlws_core::auth::{AllowAll, Authorizer};
use gqlws_core::errors::{ErrorNotice, ProtocolError};
use gqlws_core::execution::{ExecutionError, Executor};
use gqlws_core::graphql::{GraphQLRequest, Payload};
use gqlws_core::messages::{ClientMessage, ServerMessage};
use gqlws_core::transport::{InboundFrame, TransportHandle};
use metrics::counter;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use crate::config::{OneShotPolicy, ServerConfig};
use crate::keepalive::{KeepAliveResult, run_keep_alive};
use crate::metrics::{OPERATIONS_STARTED_TOTAL, PROTOCOL_ERRORS_TOTAL};
use crate::registry::{OperationTicket, SubscriptionRegistry};
use crate::state::{ConnectionState, StateMachine};

/// Bound on waiting for operation tasks that already left the registry.
const TASK_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Observer of every inbound text frame, called before decoding.
pub type MessageHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Called once when the connection terminates.
pub type ExitHook = Box<dyn FnOnce() + Send + Sync>;

/// Per-connection behavior knobs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EngineOptions {
    /// Interval of `ka` frames after `connection_ack`; `None` disables them.
    pub keep_alive_interval: Option<Duration>,
    /// Connection handling after a query or mutation.
    pub one_shot_policy: OneShotPolicy,
}

impl From<&ServerConfig> for EngineOptions {
    fn from(config: &ServerConfig) -> Self {
        Self {
            keep_alive_interval: config.keep_alive_interval(),
            one_shot_policy: config.one_shot_policy,
        }
    }
}

struct KeepAlive {
    cancel: CancellationToken,
    task: JoinHandle<KeepAliveResult>,
}

/// Protocol engine for one server-side connection.
pub struct ServerEngine {
    connection_id: String,
    state: StateMachine,
    registry: Arc<SubscriptionRegistry>,
    tasks: TaskTracker,
    transport: TransportHandle,
    executor: Arc<dyn Executor>,
    authorizer: Arc<dyn Authorizer>,
    options: EngineOptions,
    keep_alive: Option<KeepAlive>,
    on_message: Option<MessageHook>,
    on_exit: Option<ExitHook>,
}

impl ServerEngine {
    /// Engine accepting every `connection_init`, with default options.
    pub fn new(transport: TransportHandle, executor: Arc<dyn Executor>) -> Self {
        Self {
            connection_id: uuid::Uuid::now_v7().to_string(),
            state: StateMachine::new(),
            registry: Arc::new(SubscriptionRegistry::new()),
            tasks: TaskTracker::new(),
            transport,
            executor,
            authorizer: Arc::new(AllowAll),
            options: EngineOptions::default(),
            keep_alive: None,
            on_message: None,
            on_exit: None,
        }
    }

    /// Use `authorizer` to check `connection_init` payloads.
    #[must_use]
    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    /// Replace the per-connection options.
    #[must_use]
    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    /// Override the generated connection id used in logs.
    #[must_use]
    pub fn with_connection_id(mut self, connection_id: impl Into<String>) -> Self {
        self.connection_id = connection_id.into();
        self
    }

    /// Observe every inbound text frame.
    #[must_use]
    pub fn on_message(mut self, hook: MessageHook) -> Self {
        self.on_message = Some(hook);
        self
    }

    /// Run `hook` once when the connection terminates.
    #[must_use]
    pub fn on_exit(mut self, hook: impl FnOnce() + Send + Sync + 'static) -> Self {
        self.on_exit = Some(Box::new(hook));
        self
    }

    /// Connection id used in logs.
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state.state()
    }

    /// Ids of running operations (sorted).
    pub fn active_operations(&self) -> Vec<String> {
        self.registry.ids()
    }

    // ── Receive loop ────────────────────────────────────────────────

    /// Drive the engine from `inbound` until it ends or the client terminates.
    ///
    /// The end of `inbound` counts as the transport closing.
    #[instrument(skip_all, fields(connection_id = %self.connection_id))]
    pub async fn run<S>(&mut self, inbound: S)
    where
        S: Stream<Item = InboundFrame> + Send,
    {
        let mut inbound = std::pin::pin!(inbound);
        while let Some(frame) = inbound.next().await {
            self.handle_frame(frame).await;
            if self.state.is_terminated() {
                break;
            }
        }
        self.transport_closed().await;
    }

    /// Handle one inbound frame.
    pub async fn handle_frame(&mut self, frame: InboundFrame) {
        match frame.into_text() {
            Ok(text) => self.handle_text(&text).await,
            Err(e) => {
                if !self.state.is_terminated() {
                    self.signal(e).await;
                }
            }
        }
    }

    /// Handle one inbound text frame.
    pub async fn handle_text(&mut self, text: &str) {
        if self.state.is_terminated() {
            debug!(connection_id = %self.connection_id, "frame after termination ignored");
            return;
        }
        if let Some(hook) = &self.on_message {
            hook(text);
        }
        if ErrorNotice::is_notice(text) {
            warn!(connection_id = %self.connection_id, notice = text, "peer reported a protocol error");
            return;
        }

        let message = match ClientMessage::peek_type(text)
            .and_then(|kind| ClientMessage::decode_as(text, kind))
        {
            Ok(message) => message,
            Err(e) => {
                self.signal(e).await;
                return;
            }
        };
        debug!(
            connection_id = %self.connection_id,
            kind = %message.message_type(),
            id = message.id(),
            "dispatching message"
        );

        match message {
            ClientMessage::ConnectionInit { payload } => self.on_connection_init(payload).await,
            ClientMessage::Start { id, payload } => self.on_start(id, payload).await,
            ClientMessage::Stop { id } => self.on_stop(&id).await,
            ClientMessage::ConnectionTerminate => self.on_connection_terminate().await,
        }
    }

    /// Tear the connection down after the transport went away.
    ///
    /// Cancels every operation and runs the exit hook. No-op once terminated.
    pub async fn transport_closed(&mut self) {
        if self.teardown().await {
            info!(connection_id = %self.connection_id, "transport closed");
        }
    }

    // ── Handlers ────────────────────────────────────────────────────

    async fn on_connection_init(&mut self, payload: Option<Payload>) {
        if let Err(e) = self.state.check_init() {
            self.signal(e).await;
            return;
        }
        if let Err(e) = self.authorizer.authorize(payload.as_ref()).await {
            warn!(connection_id = %self.connection_id, reason = %e, "connection_init rejected");
            self.signal(ProtocolError::Unauthorized).await;
            return;
        }
        if let Err(e) = self.state.complete_init() {
            self.signal(e).await;
            return;
        }

        let _ = self.transport.send(&ServerMessage::connection_ack()).await;
        info!(connection_id = %self.connection_id, "connection initialized");

        if let Some(interval) = self.options.keep_alive_interval {
            let cancel = CancellationToken::new();
            let task = tokio::spawn(run_keep_alive(
                self.transport.clone(),
                interval,
                cancel.clone(),
            ));
            self.keep_alive = Some(KeepAlive { cancel, task });
        }
    }

    async fn on_start(&mut self, id: String, request: GraphQLRequest) {
        if let Err(e) = self.state.require_initialized() {
            self.signal(e).await;
            return;
        }
        let ticket = match self.registry.register(&id) {
            Ok(ticket) => ticket,
            Err(e) => {
                self.signal(e).await;
                return;
            }
        };

        let subscription = self.executor.is_subscription(&request);
        let kind = if subscription { "subscription" } else { "single" };
        counter!(OPERATIONS_STARTED_TOTAL, "kind" => kind).increment(1);
        debug!(connection_id = %self.connection_id, id, kind, "operation started");

        let operation = Operation {
            ticket: ticket.clone(),
            registry: Arc::clone(&self.registry),
            transport: self.transport.clone(),
            executor: Arc::clone(&self.executor),
        };
        let task = if subscription {
            self.tasks.spawn(operation.run_subscription(request))
        } else {
            self.tasks
                .spawn(operation.run_single(request, self.options.one_shot_policy))
        };
        self.registry.attach(&ticket, task);
    }

    async fn on_stop(&mut self, id: &str) {
        if let Err(e) = self.state.require_initialized() {
            self.signal(e).await;
            return;
        }
        if self.registry.cancel(id).await {
            debug!(connection_id = %self.connection_id, id, "operation stopped");
        }
    }

    async fn on_connection_terminate(&mut self) {
        if self.teardown().await {
            info!(connection_id = %self.connection_id, "client terminated connection");
        }
        self.transport.close().await;
    }

    // ── Helpers ─────────────────────────────────────────────────────

    /// Move to `Terminated`, stop every task and run the exit hook.
    ///
    /// The hook runs only after every operation task has exited, so no
    /// frame for any operation follows it.
    async fn teardown(&mut self) -> bool {
        if !self.state.terminate() {
            return false;
        }
        if let Some(keep_alive) = self.keep_alive.take() {
            keep_alive.cancel.cancel();
            let _ = keep_alive.task.await;
        }
        let cancelled = self.registry.cancel_all().await;
        if cancelled > 0 {
            debug!(connection_id = %self.connection_id, cancelled, "cancelled active operations");
        }
        // Finished operations may still be writing their terminal frames.
        let _ = self.tasks.close();
        if tokio::time::timeout(TASK_DRAIN_TIMEOUT, self.tasks.wait())
            .await
            .is_err()
        {
            warn!(
                connection_id = %self.connection_id,
                pending = self.tasks.len(),
                "operation tasks still running after teardown"
            );
        }
        if let Some(hook) = self.on_exit.take() {
            hook();
        }
        true
    }

    async fn signal(&self, error: ProtocolError) {
        let code = error.code();
        warn!(connection_id = %self.connection_id, code = %code, error = %error, "protocol error");
        counter!(PROTOCOL_ERRORS_TOTAL, "code" => code.to_string()).increment(1);
        self.transport.signal_error(&error).await;
    }
}

impl std::fmt::Debug for ServerEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerEngine")
            .field("connection_id", &self.connection_id)
            .field("state", &self.state.state())
            .field("operations", &self.registry.len())
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Operation tasks
// ─────────────────────────────────────────────────────────────────────────────

/// Everything a spawned operation task needs.
struct Operation {
    ticket: OperationTicket,
    registry: Arc<SubscriptionRegistry>,
    transport: TransportHandle,
    executor: Arc<dyn Executor>,
}

impl Operation {
    /// Query or mutation: one result, then `complete`.
    async fn run_single(self, request: GraphQLRequest, policy: OneShotPolicy) {
        let outcome = tokio::select! {
            biased;
            () = self.ticket.token().cancelled() => return,
            outcome = self.executor.execute(request) => outcome,
        };
        if !self.registry.finish(&self.ticket) {
            return;
        }

        let id = self.ticket.id();
        match outcome {
            Ok(result) => {
                let _ = self.transport.send(&ServerMessage::data(id, result)).await;
                let _ = self.transport.send(&ServerMessage::complete(id)).await;
            }
            Err(e) => self.send_error(&e).await,
        }

        if policy == OneShotPolicy::Close {
            debug!(id, "closing connection after single result");
            self.transport.close().await;
        }
    }

    /// Subscription: `data` per stream item, then `complete` or `error`.
    async fn run_subscription(self, request: GraphQLRequest) {
        let token = self.ticket.token().clone();
        let subscribed = tokio::select! {
            biased;
            () = token.cancelled() => return,
            subscribed = self.executor.subscribe(request) => subscribed,
        };
        let mut stream = match subscribed {
            Ok(stream) => stream,
            Err(e) => {
                if self.registry.finish(&self.ticket) {
                    self.send_error(&e).await;
                }
                return;
            }
        };

        let id = self.ticket.id();
        loop {
            let item = tokio::select! {
                biased;
                () = token.cancelled() => {
                    debug!(id, "subscription cancelled");
                    return;
                }
                item = stream.next() => item,
            };
            match item {
                Some(Ok(result)) => {
                    if token.is_cancelled() {
                        return;
                    }
                    let _ = self.transport.send(&ServerMessage::data(id, result)).await;
                }
                Some(Err(e)) => {
                    if self.registry.finish(&self.ticket) {
                        self.send_error(&e).await;
                    }
                    return;
                }
                None => {
                    if self.registry.finish(&self.ticket) {
                        let _ = self.transport.send(&ServerMessage::complete(id)).await;
                        debug!(id, "subscription completed");
                    }
                    return;
                }
            }
        }
    }

    async fn send_error(&self, error: &ExecutionError) {
        let id = self.ticket.id();
        let protocol = error.to_protocol_error();
        warn!(id, code = %protocol.code(), error = %error, "operation failed");
        let message = ServerMessage::error(id, vec![error.to_graphql_error()]);
        let _ = self.transport.send(&message).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use gqlws_core::auth::{AuthError, authorize_with};
    use gqlws_core::execution::ResultStream;
    use gqlws_core::graphql::{GraphQLError, GraphQLResult};
    use gqlws_core::messages::ResponseType;
    use gqlws_core::testing::{MemoryPeer, MemoryTransport, Outbound};
    use gqlws_core::transport::{Transport, TransportError};
    use serde_json::json;

    // ── Fixtures ────────────────────────────────────────────────────

    /// Executor keyed on the query text.
    struct FakeExecutor;

    fn count_to(n: u64) -> ResultStream {
        Box::pin(async_stream::stream! {
            for i in 1..=n {
                yield Ok(GraphQLResult::data(json!({ "count": i })));
            }
        })
    }

    #[async_trait]
    impl Executor for FakeExecutor {
        fn is_subscription(&self, request: &GraphQLRequest) -> bool {
            request.query.trim_start().starts_with("subscription")
        }

        async fn execute(&self, request: GraphQLRequest) -> Result<GraphQLResult, ExecutionError> {
            match request.query.as_str() {
                "query { hello }" => Ok(GraphQLResult::data(json!({ "hello": "world" }))),
                "query { slow }" => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(GraphQLResult::data(json!({ "slow": true })))
                }
                "mutation { fail }" => Err(ExecutionError::GraphQL(GraphQLError::new("denied"))),
                other => Err(ExecutionError::Engine(format!("unknown query: {other}"))),
            }
        }

        async fn subscribe(&self, request: GraphQLRequest) -> Result<ResultStream, ExecutionError> {
            match request.query.as_str() {
                "subscription { three }" => Ok(count_to(3)),
                "subscription { empty }" => Ok(count_to(0)),
                "subscription { flaky }" => Ok(Box::pin(async_stream::stream! {
                    yield Ok(GraphQLResult::data(json!({ "n": 1 })));
                    yield Err(ExecutionError::Engine("stream broke".into()));
                    yield Ok(GraphQLResult::data(json!({ "n": 2 })));
                })),
                "subscription { forever }" => Ok(Box::pin(async_stream::stream! {
                    let mut i = 0_u64;
                    loop {
                        i += 1;
                        yield Ok(GraphQLResult::data(json!({ "tick": i })));
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                })),
                "subscription { single }" => Err(ExecutionError::NotAStream),
                other => Err(ExecutionError::Engine(format!("unknown subscription: {other}"))),
            }
        }
    }

    fn engine() -> (ServerEngine, Arc<MemoryTransport>, MemoryPeer) {
        let (transport, peer) = MemoryTransport::pair();
        let engine = ServerEngine::new(TransportHandle::new(&transport), Arc::new(FakeExecutor))
            .with_connection_id("test");
        (engine, transport, peer)
    }

    fn start(id: &str, query: &str) -> String {
        ClientMessage::start(id, GraphQLRequest::new(query)).encode()
    }

    async fn init(engine: &mut ServerEngine, peer: &mut MemoryPeer) {
        engine
            .handle_text(&ClientMessage::connection_init(None).encode())
            .await;
        let ack = peer.next_server_message().await.unwrap();
        assert_eq!(ack, ServerMessage::connection_ack());
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // ── Initialization ──────────────────────────────────────────────

    #[tokio::test]
    async fn init_emits_ack() {
        let (mut engine, _t, mut peer) = engine();
        engine.handle_text(r#"{"type":"connection_init","payload":{}}"#).await;
        assert_eq!(
            peer.next().await,
            Some(Outbound::Text(r#"{"type":"connection_ack"}"#.into()))
        );
        assert_eq!(engine.state(), ConnectionState::Initialized);
    }

    #[tokio::test]
    async fn start_before_init_is_not_initialized() {
        let (mut engine, _t, mut peer) = engine();
        engine.handle_text(&start("2", "query { hello }")).await;
        let event = peer.next().await.unwrap();
        assert_eq!(event.notice().as_deref(), Some("4431: Connection not initialized"));
        settle().await;
        assert!(peer.drain().is_empty());
        assert_eq!(engine.state(), ConnectionState::Uninitialized);
        assert!(engine.active_operations().is_empty());
    }

    #[tokio::test]
    async fn stop_before_init_is_not_initialized() {
        let (mut engine, _t, mut peer) = engine();
        engine.handle_text(&ClientMessage::stop("1").encode()).await;
        let event = peer.next().await.unwrap();
        assert_eq!(event.notice().as_deref(), Some("4431: Connection not initialized"));
    }

    #[tokio::test]
    async fn second_init_is_rejected() {
        let (mut engine, _t, mut peer) = engine();
        init(&mut engine, &mut peer).await;
        engine
            .handle_text(&ClientMessage::connection_init(None).encode())
            .await;
        let event = peer.next().await.unwrap();
        assert_eq!(event.notice().as_deref(), Some("4432: Too many initialization requests"));
        assert!(peer.drain().is_empty());
        assert_eq!(engine.state(), ConnectionState::Initialized);
    }

    #[tokio::test]
    async fn failed_auth_signals_unauthorized_once() {
        let (engine, _t, mut peer) = engine();
        let mut engine = engine.with_authorizer(Arc::new(authorize_with(|payload| {
            match payload.and_then(|p| p.get("token")) {
                Some(token) if token == "letmein" => Ok(()),
                _ => Err(AuthError::new("missing token")),
            }
        })));

        engine
            .handle_text(&ClientMessage::connection_init(None).encode())
            .await;
        let event = peer.next().await.unwrap();
        assert_eq!(event.notice().as_deref(), Some("4430: Unauthorized"));
        assert!(peer.drain().is_empty());
        assert_eq!(engine.state(), ConnectionState::Uninitialized);

        engine
            .handle_text(r#"{"type":"connection_init","payload":{"token":"letmein"}}"#)
            .await;
        assert_eq!(peer.next_server_message().await, Some(ServerMessage::connection_ack()));
        assert_eq!(engine.state(), ConnectionState::Initialized);
    }

    // ── Decoding failures ───────────────────────────────────────────

    #[tokio::test]
    async fn decode_failures_are_signaled_and_connection_stays_open() {
        let (mut engine, transport, mut peer) = engine();
        let cases = [
            ("not json", "4411: Message has no 'type' field"),
            (r#"{"id":"1"}"#, "4411: Message has no 'type' field"),
            (r#"{"type":"subscribe"}"#, "4412: Message 'type' is not a valid message type"),
            (
                r#"{"type":"start","id":"1"}"#,
                "4413: Request message doesn't match 'start' JSON format",
            ),
            (
                r#"{"type":"stop"}"#,
                "4413: Request message doesn't match 'stop' JSON format",
            ),
        ];
        for (frame, expected) in cases {
            engine.handle_text(frame).await;
            let event = peer.next().await.unwrap();
            assert_eq!(event.notice().as_deref(), Some(expected), "frame: {frame}");
        }
        assert!(!transport.is_closed());
        assert_eq!(engine.state(), ConnectionState::Uninitialized);
    }

    #[tokio::test]
    async fn non_utf8_binary_is_invalid_encoding() {
        let (mut engine, _t, mut peer) = engine();
        engine.handle_frame(InboundFrame::Binary(vec![0xc3, 0x28])).await;
        let event = peer.next().await.unwrap();
        assert_eq!(event.notice().as_deref(), Some("4410: Message was not encoded in UTF8"));
    }

    #[tokio::test]
    async fn utf8_binary_is_dispatched() {
        let (mut engine, _t, mut peer) = engine();
        let frame = ClientMessage::connection_init(None).encode().into_bytes();
        engine.handle_frame(InboundFrame::Binary(frame)).await;
        assert_eq!(peer.next_server_message().await, Some(ServerMessage::connection_ack()));
    }

    #[tokio::test]
    async fn error_notice_from_peer_is_ignored() {
        let (mut engine, _t, mut peer) = engine();
        engine.handle_text("4414: Response message doesn't match 'data' JSON format").await;
        settle().await;
        assert!(peer.drain().is_empty());
    }

    #[tokio::test]
    async fn message_hook_sees_every_text_frame() {
        let (engine, _t, _peer) = engine();
        let seen = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = Arc::clone(&seen);
        let mut engine = engine.on_message(Arc::new(move |text| {
            sink.lock().unwrap().push(text.to_owned());
        }));

        engine.handle_text("garbage").await;
        engine
            .handle_text(&ClientMessage::connection_init(None).encode())
            .await;
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["garbage".to_owned(), r#"{"type":"connection_init"}"#.to_owned()]
        );
    }

    // ── Single-result operations ────────────────────────────────────

    #[tokio::test]
    async fn query_emits_data_then_complete() {
        let (mut engine, transport, mut peer) = engine();
        init(&mut engine, &mut peer).await;
        engine.handle_text(&start("1", "query { hello }")).await;

        let data = peer.next().await.unwrap();
        assert_eq!(
            data,
            Outbound::Text(r#"{"type":"data","id":"1","payload":{"data":{"hello":"world"}}}"#.into())
        );
        assert_eq!(peer.next_server_message().await, Some(ServerMessage::complete("1")));
        settle().await;
        assert!(peer.drain().is_empty());
        assert!(!transport.is_closed());
        assert!(engine.active_operations().is_empty());
    }

    #[tokio::test]
    async fn failed_mutation_emits_only_error() {
        let (mut engine, _t, mut peer) = engine();
        init(&mut engine, &mut peer).await;
        engine.handle_text(&start("m", "mutation { fail }")).await;

        let message = peer.next_server_message().await.unwrap();
        assert_matches!(message, ServerMessage::Error { ref id, ref payload } => {
            assert_eq!(id, "m");
            assert_eq!(payload[0].message, "denied");
        });
        settle().await;
        assert!(peer.drain().is_empty());
    }

    #[tokio::test]
    async fn close_policy_closes_after_single_result() {
        let (engine, transport, mut peer) = engine();
        let mut engine = engine.with_options(EngineOptions {
            one_shot_policy: OneShotPolicy::Close,
            ..EngineOptions::default()
        });
        init(&mut engine, &mut peer).await;
        engine.handle_text(&start("1", "query { hello }")).await;

        assert_eq!(
            peer.next_server_message().await.map(|m| m.message_type()),
            Some(ResponseType::Data)
        );
        assert_eq!(peer.next_server_message().await, Some(ServerMessage::complete("1")));
        assert_eq!(peer.next().await, Some(Outbound::Closed));
        assert!(transport.is_closed());
    }

    #[tokio::test]
    async fn stopping_pending_query_emits_nothing() {
        let (mut engine, _t, mut peer) = engine();
        init(&mut engine, &mut peer).await;
        engine.handle_text(&start("q", "query { slow }")).await;
        assert_eq!(engine.active_operations(), vec!["q"]);

        engine.handle_text(&ClientMessage::stop("q").encode()).await;
        settle().await;
        assert!(peer.drain().is_empty());
        assert!(engine.active_operations().is_empty());
    }

    // ── Subscriptions ───────────────────────────────────────────────

    #[tokio::test]
    async fn three_item_subscription_yields_five_messages() {
        let (mut engine, _t, mut peer) = engine();
        init(&mut engine, &mut peer).await;
        engine.handle_text(&start("s", "subscription { three }")).await;

        for i in 1..=3 {
            let message = peer.next_server_message().await.unwrap();
            assert_eq!(
                message,
                ServerMessage::data("s", GraphQLResult::data(json!({ "count": i })))
            );
        }
        assert_eq!(peer.next_server_message().await, Some(ServerMessage::complete("s")));
        settle().await;
        assert!(peer.drain().is_empty());
        assert!(engine.active_operations().is_empty());
    }

    #[tokio::test]
    async fn empty_subscription_only_completes() {
        let (mut engine, _t, mut peer) = engine();
        init(&mut engine, &mut peer).await;
        engine.handle_text(&start("e", "subscription { empty }")).await;
        assert_eq!(peer.next_server_message().await, Some(ServerMessage::complete("e")));
    }

    #[tokio::test]
    async fn stream_error_is_terminal() {
        let (mut engine, _t, mut peer) = engine();
        init(&mut engine, &mut peer).await;
        engine.handle_text(&start("f", "subscription { flaky }")).await;

        assert_eq!(
            peer.next_server_message().await.map(|m| m.message_type()),
            Some(ResponseType::Data)
        );
        let error = peer.next_server_message().await.unwrap();
        assert_matches!(error, ServerMessage::Error { ref payload, .. } => {
            assert_eq!(payload[0].message, "stream broke");
        });
        settle().await;
        assert!(peer.drain().is_empty(), "nothing may follow a terminal error");
        assert!(engine.active_operations().is_empty());
    }

    #[tokio::test]
    async fn subscribe_failure_emits_error() {
        let (mut engine, _t, mut peer) = engine();
        init(&mut engine, &mut peer).await;
        engine.handle_text(&start("x", "subscription { single }")).await;

        let error = peer.next_server_message().await.unwrap();
        assert_matches!(error, ServerMessage::Error { ref id, ref payload } => {
            assert_eq!(id, "x");
            assert_eq!(
                payload[0].message,
                "Expected a subscription stream but received a single result"
            );
        });
        settle().await;
        assert!(peer.drain().is_empty());
    }

    #[tokio::test]
    async fn duplicate_start_keeps_existing_operation() {
        let (mut engine, _t, mut peer) = engine();
        init(&mut engine, &mut peer).await;
        engine.handle_text(&start("dup", "subscription { forever }")).await;
        assert!(peer.next_server_message().await.is_some());

        engine.handle_text(&start("dup", "query { hello }")).await;
        let notice = loop {
            let event = peer.next().await.unwrap();
            if let Some(notice) = event.notice() {
                break notice;
            }
        };
        assert_eq!(notice, "4433: Subscriber for dup already exists");
        assert_eq!(engine.active_operations(), vec!["dup"]);

        engine.handle_text(&ClientMessage::stop("dup").encode()).await;
    }

    #[tokio::test]
    async fn stop_ends_subscription_without_complete() {
        let (mut engine, _t, mut peer) = engine();
        init(&mut engine, &mut peer).await;
        engine.handle_text(&start("live", "subscription { forever }")).await;
        assert_eq!(
            peer.next_server_message().await.map(|m| m.message_type()),
            Some(ResponseType::Data)
        );

        engine.handle_text(&ClientMessage::stop("live").encode()).await;
        let _ = peer.drain();
        settle().await;
        assert!(peer.drain().is_empty(), "no frames after stop returned");
        assert!(engine.active_operations().is_empty());
    }

    #[tokio::test]
    async fn stop_for_unknown_id_is_silent() {
        let (mut engine, _t, mut peer) = engine();
        init(&mut engine, &mut peer).await;
        engine.handle_text(&ClientMessage::stop("nope").encode()).await;
        settle().await;
        assert!(peer.drain().is_empty());
    }

    #[tokio::test]
    async fn id_can_be_reused_after_completion() {
        let (mut engine, _t, mut peer) = engine();
        init(&mut engine, &mut peer).await;
        for _ in 0..2 {
            engine.handle_text(&start("1", "query { hello }")).await;
            assert_eq!(
                peer.next_server_message().await.map(|m| m.message_type()),
                Some(ResponseType::Data)
            );
            assert_eq!(peer.next_server_message().await, Some(ServerMessage::complete("1")));
        }
    }

    // ── Termination ─────────────────────────────────────────────────

    #[tokio::test]
    async fn terminate_cancels_everything_and_closes() {
        let (engine, transport, mut peer) = engine();
        let exits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&exits);
        let mut engine = engine.on_exit(move || {
            let _ = counter.fetch_add(1, Ordering::SeqCst);
        });
        init(&mut engine, &mut peer).await;
        engine.handle_text(&start("a", "subscription { forever }")).await;
        engine.handle_text(&start("b", "query { slow }")).await;
        assert!(peer.next_server_message().await.is_some());

        engine
            .handle_text(&ClientMessage::ConnectionTerminate.encode())
            .await;
        assert_eq!(engine.state(), ConnectionState::Terminated);
        assert!(engine.active_operations().is_empty());
        assert!(transport.is_closed());
        assert_eq!(exits.load(Ordering::SeqCst), 1);

        let events = peer.drain();
        let closed_at = events.iter().position(|e| *e == Outbound::Closed).unwrap();
        assert!(
            events[closed_at + 1..].is_empty(),
            "nothing may follow the close: {events:?}"
        );
        settle().await;
        assert!(peer.drain().is_empty());
    }

    #[tokio::test]
    async fn frames_after_terminate_are_ignored() {
        let (mut engine, _t, mut peer) = engine();
        init(&mut engine, &mut peer).await;
        engine
            .handle_text(&ClientMessage::ConnectionTerminate.encode())
            .await;
        let _ = peer.drain();

        engine.handle_text(&start("late", "query { hello }")).await;
        engine.handle_text("garbage").await;
        engine.handle_frame(InboundFrame::Binary(vec![0xff])).await;
        settle().await;
        assert!(peer.drain().is_empty());
    }

    #[tokio::test]
    async fn transport_close_cancels_operations_and_runs_exit_hook() {
        let (engine, transport, mut peer) = engine();
        let exits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&exits);
        let mut engine = engine.on_exit(move || {
            let _ = counter.fetch_add(1, Ordering::SeqCst);
        });
        init(&mut engine, &mut peer).await;
        engine.handle_text(&start("s", "subscription { forever }")).await;
        assert!(peer.next_server_message().await.is_some());

        engine.transport_closed().await;
        engine.transport_closed().await;
        assert_eq!(engine.state(), ConnectionState::Terminated);
        assert!(engine.active_operations().is_empty());
        assert_eq!(exits.load(Ordering::SeqCst), 1);
        assert!(!transport.is_closed());

        let _ = peer.drain();
        settle().await;
        assert!(peer.drain().is_empty());
    }

    /// Records frames, taking a while to accept each one.
    #[derive(Default)]
    struct SlowTransport {
        frames: Mutex<Vec<String>>,
    }

    impl SlowTransport {
        fn frames(&self) -> Vec<String> {
            self.frames.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for SlowTransport {
        async fn send(&self, text: String) -> Result<(), TransportError> {
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.frames.lock().unwrap().push(text);
            Ok(())
        }

        async fn close(&self) {}

        async fn signal_error(&self, _error: &ProtocolError) {}
    }

    #[tokio::test(start_paused = true)]
    async fn exit_hook_waits_for_operations_still_sending() {
        let transport = Arc::new(SlowTransport::default());
        let seen_at_exit = Arc::new(Mutex::new(None));
        let hook_transport = Arc::clone(&transport);
        let hook_seen = Arc::clone(&seen_at_exit);
        let mut engine =
            ServerEngine::new(TransportHandle::new(&transport), Arc::new(FakeExecutor))
                .on_exit(move || {
                    *hook_seen.lock().unwrap() = Some(hook_transport.frames().len());
                });

        engine
            .handle_text(&ClientMessage::connection_init(None).encode())
            .await;
        engine.handle_text(&start("1", "query { hello }")).await;
        // The query has resolved and its task is inside the first send.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(engine.active_operations().is_empty());

        engine.transport_closed().await;
        assert_eq!(*seen_at_exit.lock().unwrap(), Some(3));

        tokio::time::sleep(Duration::from_secs(1)).await;
        let kinds: Vec<_> = transport
            .frames()
            .iter()
            .map(|text| ServerMessage::decode(text).unwrap().message_type())
            .collect();
        assert_eq!(
            kinds,
            vec![ResponseType::ConnectionAck, ResponseType::Data, ResponseType::Complete]
        );
    }

    #[tokio::test]
    async fn dropped_transport_makes_sends_noops() {
        let (mut engine, transport, mut peer) = engine();
        init(&mut engine, &mut peer).await;
        drop(transport);
        engine.handle_text(&start("1", "query { hello }")).await;
        engine.handle_text("garbage").await;
        settle().await;
        assert!(peer.drain().is_empty());
    }

    // ── Receive loop ────────────────────────────────────────────────

    #[tokio::test]
    async fn run_processes_frames_until_terminate() {
        let (mut engine, transport, mut peer) = engine();
        let frames = futures::stream::iter(vec![
            InboundFrame::from(ClientMessage::connection_init(None).encode()),
            InboundFrame::from(start("1", "query { hello }")),
            InboundFrame::from(ClientMessage::ConnectionTerminate.encode()),
            InboundFrame::from(start("2", "query { hello }")),
        ]);
        engine.run(frames).await;

        assert_eq!(engine.state(), ConnectionState::Terminated);
        assert!(transport.is_closed());
        let events = peer.drain();
        assert_eq!(events.first(), Some(&Outbound::Text(r#"{"type":"connection_ack"}"#.into())));
        assert_eq!(events.last(), Some(&Outbound::Closed));
        assert!(!events.iter().any(|e| {
            e.server_message().and_then(|m| m.id().map(str::to_owned)).as_deref() == Some("2")
        }));
    }

    #[tokio::test]
    async fn run_tears_down_when_inbound_ends() {
        let (mut engine, transport, _peer) = engine();
        let frames = futures::stream::iter(vec![
            InboundFrame::from(ClientMessage::connection_init(None).encode()),
            InboundFrame::from(start("s", "subscription { forever }")),
        ]);
        engine.run(frames).await;
        assert_eq!(engine.state(), ConnectionState::Terminated);
        assert!(engine.active_operations().is_empty());
        assert!(!transport.is_closed());
    }

    // ── Keep-alive ──────────────────────────────────────────────────

    #[tokio::test]
    async fn keep_alive_follows_ack() {
        let (engine, _t, mut peer) = engine();
        let mut engine = engine.with_options(EngineOptions {
            keep_alive_interval: Some(Duration::from_millis(20)),
            ..EngineOptions::default()
        });
        init(&mut engine, &mut peer).await;
        for _ in 0..2 {
            assert_eq!(peer.next_server_message().await, Some(ServerMessage::keep_alive()));
        }

        engine
            .handle_text(&ClientMessage::ConnectionTerminate.encode())
            .await;
        let _ = peer.drain();
        settle().await;
        assert!(peer.drain().is_empty());
    }

    #[test]
    fn options_follow_config() {
        let config = ServerConfig {
            keep_alive_interval_secs: Some(30),
            one_shot_policy: OneShotPolicy::Close,
            ..ServerConfig::default()
        };
        let options = EngineOptions::from(&config);
        assert_eq!(options.keep_alive_interval, Some(Duration::from_secs(30)));
        assert_eq!(options.one_shot_policy, OneShotPolicy::Close);
    }
}
