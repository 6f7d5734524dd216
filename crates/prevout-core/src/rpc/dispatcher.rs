//! Request/response multiplexing over one [`Connection`].
//!
//! Each call gets a fresh id and a pending entry holding a oneshot sender.
//! A single routing task reads frames and completes the matching entry;
//! frames without an id are notifications and go to the subscriber
//! registered for their method. The state lock is only held to mutate the
//! maps, never across an `.await`.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{RpcError, TransportError};
use crate::transport::{Connection, FrameSink, FrameStream};

use super::context::{CallContext, Interrupt};
use super::protocol::{decode_message, encode_request, Message};

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    /// Deadline applied to every call in addition to the caller's context.
    pub request_timeout: Option<Duration>,
    pub requests_per_second: Option<NonZeroU32>,
    /// Queue capacity per notification subscriber.
    pub notification_buffer: usize,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            request_timeout: None,
            requests_per_second: None,
            notification_buffer: 32,
        }
    }
}

pub struct Dispatcher {
    sink: FrameSink,
    shared: Arc<Shared>,
    next_id: AtomicU64,
    request_timeout: Option<Duration>,
    limiter: Option<DirectRateLimiter>,
    notification_buffer: usize,
    router: JoinHandle<()>,
}

impl Dispatcher {
    /// Take ownership of `connection` and start routing its frames.
    pub fn start(connection: Connection, options: DispatcherOptions) -> Self {
        let (sink, frames) = connection.into_parts();
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
        });
        let router = tokio::spawn(route_frames(frames, shared.clone(), sink.peer().to_owned()));

        Self {
            sink,
            shared,
            next_id: AtomicU64::new(0),
            request_timeout: options.request_timeout,
            limiter: options
                .requests_per_second
                .map(|limit| RateLimiter::direct(Quota::per_second(limit))),
            notification_buffer: options.notification_buffer.max(1),
            router,
        }
    }

    /// Issue `method(params)` and wait for its result.
    pub async fn call(
        &self,
        ctx: &CallContext,
        method: &str,
        params: Vec<Value>,
    ) -> Result<Value, RpcError> {
        let ctx = match self.request_timeout {
            Some(timeout) => ctx.clone().with_timeout(timeout),
            None => ctx.clone(),
        };

        if let Some(limiter) = &self.limiter {
            tokio::select! {
                _ = limiter.until_ready() => {}
                interrupt = ctx.done() => return Err(interrupted(method, interrupt)),
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = encode_request(id, method, &params)?;
        let (result_tx, result_rx) = oneshot::channel();
        {
            let mut state = self.shared.lock();
            if let Some(reason) = &state.dead {
                return Err(RpcError::ConnectionLost(reason.clone()));
            }
            state.pending.insert(
                id,
                PendingCall {
                    method: method.to_owned(),
                    issued_at: Instant::now(),
                    result: result_tx,
                },
            );
        }
        // Removes the pending entry however this call ends.
        let _pending = PendingGuard {
            id,
            shared: &self.shared,
        };

        debug!(
            rpc.id = id,
            rpc.method = method,
            rpc.params = params.len(),
            "rpc call"
        );

        tokio::select! {
            sent = self.sink.send(frame) => {
                sent.map_err(|err| RpcError::ConnectionLost(err.to_string()))?;
            }
            interrupt = ctx.done() => return Err(interrupted(method, interrupt)),
        }

        tokio::select! {
            outcome = result_rx => outcome.unwrap_or_else(|_| {
                Err(RpcError::ConnectionLost("dispatcher stopped".into()))
            }),
            interrupt = ctx.done() => Err(interrupted(method, interrupt)),
        }
    }

    /// [`Dispatcher::call`], decoding the result into `T`.
    pub async fn call_typed<T: DeserializeOwned>(
        &self,
        ctx: &CallContext,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, RpcError> {
        let value = self.call(ctx, method, params).await?;
        serde_json::from_value(value)
            .map_err(|e| RpcError::InvalidResponse(format!("decode `{method}` result: {e}")))
    }

    /// Receive the `params` of every notification for `method`.
    ///
    /// Delivery is best-effort: when the queue is full, new notifications
    /// are dropped rather than stalling the connection. Registering again
    /// for the same method replaces the previous subscriber. The receiver
    /// ends when the connection is lost.
    pub fn notifications(&self, method: &str) -> mpsc::Receiver<Value> {
        let (tx, rx) = mpsc::channel(self.notification_buffer);
        let mut state = self.shared.lock();
        if state.dead.is_none() {
            state.subscribers.insert(method.to_owned(), tx);
        }
        rx
    }

    pub fn is_alive(&self) -> bool {
        self.shared.lock().dead.is_none()
    }

    pub fn pending_calls(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Stop routing and fail every pending call.
    pub fn close(&self) {
        self.router.abort();
        self.shared.fail_all("dispatcher closed");
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.router.abort();
    }
}

fn interrupted(method: &str, interrupt: Interrupt) -> RpcError {
    let method = method.to_owned();
    match interrupt {
        Interrupt::Cancelled => RpcError::Cancelled { method },
        Interrupt::DeadlineExceeded => RpcError::Timeout { method },
    }
}

// ==============================================================================
// Shared State
// ==============================================================================

struct PendingCall {
    method: String,
    issued_at: Instant,
    result: oneshot::Sender<Result<Value, RpcError>>,
}

#[derive(Default)]
struct State {
    pending: HashMap<u64, PendingCall>,
    subscribers: HashMap<String, mpsc::Sender<Value>>,
    /// Set once the connection is gone; no call can succeed afterwards.
    dead: Option<String>,
}

struct Shared {
    state: Mutex<State>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch(&self, frame: &[u8]) {
        if frame.iter().all(u8::is_ascii_whitespace) {
            return;
        }

        match decode_message(frame) {
            Ok(Message::Response { id, outcome }) => {
                let pending = self.lock().pending.remove(&id);
                match pending {
                    Some(call) => {
                        debug!(
                            rpc.id = id,
                            rpc.method = %call.method,
                            elapsed_ms = call.issued_at.elapsed().as_millis() as u64,
                            ok = outcome.is_ok(),
                            "rpc response"
                        );
                        let _ = call.result.send(outcome);
                    }
                    None => debug!(rpc.id = id, "response for unknown or abandoned call"),
                }
            }
            Ok(Message::Notification { method, params }) => self.notify(method, params),
            Err(err) => warn!(error = %err, "dropping undecodable frame"),
        }
    }

    fn notify(&self, method: String, params: Value) {
        let mut state = self.lock();
        let Some(subscriber) = state.subscribers.get(&method) else {
            debug!(%method, "notification without subscriber");
            return;
        };
        match subscriber.try_send(params) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(%method, "subscriber queue full; dropping notification");
            }
            Err(TrySendError::Closed(_)) => {
                debug!(%method, "subscriber gone; unregistering");
                state.subscribers.remove(&method);
            }
        }
    }

    fn fail_all(&self, reason: &str) {
        let failed: Vec<PendingCall> = {
            let mut state = self.lock();
            if state.dead.is_none() {
                state.dead = Some(reason.to_owned());
            }
            state.subscribers.clear();
            state.pending.drain().map(|(_, call)| call).collect()
        };

        if !failed.is_empty() {
            warn!(reason, pending = failed.len(), "failing pending calls");
        }
        for call in failed {
            let _ = call
                .result
                .send(Err(RpcError::ConnectionLost(reason.to_owned())));
        }
    }
}

struct PendingGuard<'a> {
    id: u64,
    shared: &'a Shared,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.lock().pending.remove(&self.id);
    }
}

async fn route_frames(mut frames: FrameStream, shared: Arc<Shared>, peer: String) {
    let reason = loop {
        match frames.next().await {
            Some(Ok(frame)) => shared.dispatch(&frame),
            Some(Err(err)) => break err.to_string(),
            None => break TransportError::Closed.to_string(),
        }
    };
    debug!(%peer, %reason, "frame routing stopped");
    shared.fail_all(&reason);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{
        duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf,
    };

    use crate::transport::DialOptions;

    struct FakeServer {
        reader: BufReader<ReadHalf<DuplexStream>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl FakeServer {
        async fn request(&mut self) -> Value {
            let mut line = String::new();
            self.reader.read_line(&mut line).await.expect("read request");
            serde_json::from_str(&line).expect("request is json")
        }

        async fn send(&mut self, value: Value) {
            self.send_raw(&value.to_string()).await;
        }

        async fn send_raw(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).await.unwrap();
            self.writer.write_all(b"\n").await.unwrap();
        }
    }

    fn setup(options: DispatcherOptions) -> (Dispatcher, FakeServer) {
        let (client, server) = duplex(64 * 1024);
        let conn = Connection::from_stream(client, "fake", &DialOptions::default());
        let (reader, writer) = tokio::io::split(server);
        (
            Dispatcher::start(conn, options),
            FakeServer {
                reader: BufReader::new(reader),
                writer,
            },
        )
    }

    #[tokio::test]
    async fn responses_are_correlated_by_id_not_order() {
        let (dispatcher, mut server) = setup(DispatcherOptions::default());
        let dispatcher = Arc::new(dispatcher);
        let ctx = CallContext::new();

        let first = {
            let (d, ctx) = (dispatcher.clone(), ctx.clone());
            tokio::spawn(async move { d.call(&ctx, "first", vec![]).await })
        };
        let req_a = server.request().await;
        let second = {
            let (d, ctx) = (dispatcher.clone(), ctx.clone());
            tokio::spawn(async move { d.call(&ctx, "second", vec![json!(1)]).await })
        };
        let req_b = server.request().await;
        assert_ne!(req_a["id"], req_b["id"]);

        server.send(json!({"id": req_b["id"], "result": "b"})).await;
        server.send(json!({"id": req_a["id"], "result": "a"})).await;

        assert_eq!(first.await.unwrap().unwrap(), json!("a"));
        assert_eq!(second.await.unwrap().unwrap(), json!("b"));
        assert_eq!(dispatcher.pending_calls(), 0);
    }

    #[tokio::test]
    async fn server_error_is_returned_verbatim() {
        let (dispatcher, mut server) = setup(DispatcherOptions::default());
        let ctx = CallContext::new();

        let call = dispatcher.call(&ctx, "blockchain.transaction.get", vec![json!("00")]);
        let respond = async {
            let req = server.request().await;
            server
                .send(json!({"id": req["id"], "error": {"code": 2, "message": "daemon error"}}))
                .await;
        };
        let (result, ()) = tokio::join!(call, respond);

        match result {
            Err(RpcError::Server { code, message }) => {
                assert_eq!(code, 2);
                assert_eq!(message, "daemon error");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_frames_are_dropped_and_connection_continues() {
        let (dispatcher, mut server) = setup(DispatcherOptions::default());
        let ctx = CallContext::new();

        let call = dispatcher.call(&ctx, "server.ping", vec![]);
        let respond = async {
            let req = server.request().await;
            server.send_raw("{ this is not json").await;
            server.send_raw("").await;
            server.send(json!({"id": req["id"], "result": null})).await;
        };
        let (result, ()) = tokio::join!(call, respond);

        assert_eq!(result.expect("call must succeed"), Value::Null);
        assert!(dispatcher.is_alive());
    }

    #[tokio::test]
    async fn notifications_reach_their_subscriber() {
        let (dispatcher, mut server) = setup(DispatcherOptions::default());
        let mut headers = dispatcher.notifications("blockchain.headers.subscribe");

        server
            .send(json!({"method": "blockchain.scripthash.subscribe", "params": ["aa", "bb"]}))
            .await;
        server
            .send(json!({"method": "blockchain.headers.subscribe", "params": [{"height": 10, "hex": "00"}]}))
            .await;

        let params = headers.recv().await.expect("notification");
        assert_eq!(params[0]["height"], 10);
    }

    #[tokio::test]
    async fn full_subscriber_queue_does_not_stall_calls() {
        let (dispatcher, mut server) = setup(DispatcherOptions {
            notification_buffer: 1,
            ..Default::default()
        });
        let mut headers = dispatcher.notifications("blockchain.headers.subscribe");
        let ctx = CallContext::new();

        let call = dispatcher.call(&ctx, "server.ping", vec![]);
        let respond = async {
            let req = server.request().await;
            for height in 1..=3 {
                server
                    .send(json!({"method": "blockchain.headers.subscribe", "params": [{"height": height, "hex": "00"}]}))
                    .await;
            }
            server.send(json!({"id": req["id"], "result": null})).await;
        };
        let (result, ()) = tokio::join!(call, respond);
        result.expect("call completes even though nobody drains notifications");

        assert_eq!(headers.recv().await.expect("first kept")[0]["height"], 1);
        assert!(headers.try_recv().is_err(), "later notifications were dropped");
    }

    #[tokio::test]
    async fn connection_loss_fails_every_pending_call() {
        let (dispatcher, mut server) = setup(DispatcherOptions::default());
        let dispatcher = Arc::new(dispatcher);
        let ctx = CallContext::new();

        let mut calls = Vec::new();
        for i in 0..3 {
            let (d, ctx) = (dispatcher.clone(), ctx.clone());
            calls.push(tokio::spawn(async move {
                d.call(&ctx, "blockchain.transaction.get", vec![json!(i)]).await
            }));
        }
        for _ in 0..3 {
            server.request().await;
        }
        drop(server);

        for call in calls {
            let result = call.await.unwrap();
            assert!(matches!(result, Err(RpcError::ConnectionLost(_))), "got {result:?}");
        }
        assert!(!dispatcher.is_alive());
        assert_eq!(dispatcher.pending_calls(), 0);

        let later = dispatcher.call(&ctx, "server.ping", vec![]).await;
        assert!(matches!(later, Err(RpcError::ConnectionLost(_))));
    }

    #[tokio::test]
    async fn cancellation_removes_pending_call() {
        let (dispatcher, mut server) = setup(DispatcherOptions::default());
        let ctx = CallContext::new();

        let call = dispatcher.call(&ctx, "blockchain.scripthash.get_history", vec![]);
        let cancel = async {
            server.request().await;
            assert_eq!(dispatcher.pending_calls(), 1);
            ctx.cancel();
        };
        let (result, ()) = tokio::join!(call, cancel);

        assert!(matches!(result, Err(RpcError::Cancelled { .. })), "got {result:?}");
        assert_eq!(dispatcher.pending_calls(), 0);
        assert!(dispatcher.is_alive(), "cancelling one call keeps the connection");
    }

    #[tokio::test]
    async fn request_timeout_applies_without_caller_deadline() {
        let (dispatcher, mut server) = setup(DispatcherOptions {
            request_timeout: Some(Duration::from_millis(50)),
            ..Default::default()
        });
        let ctx = CallContext::new();

        let call = dispatcher.call(&ctx, "server.ping", vec![]);
        let (result, _) = tokio::join!(call, server.request());

        assert!(matches!(result, Err(RpcError::Timeout { .. })), "got {result:?}");
        assert_eq!(dispatcher.pending_calls(), 0);
    }

    #[tokio::test]
    async fn call_typed_reports_shape_mismatch() {
        let (dispatcher, mut server) = setup(DispatcherOptions::default());
        let ctx = CallContext::new();

        let call = dispatcher.call_typed::<Vec<String>>(&ctx, "server.banner", vec![]);
        let respond = async {
            let req = server.request().await;
            server.send(json!({"id": req["id"], "result": 42})).await;
        };
        let (result, ()) = tokio::join!(call, respond);

        assert!(matches!(result, Err(RpcError::InvalidResponse(_))));
    }
}
