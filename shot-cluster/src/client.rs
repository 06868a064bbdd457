//! A token client multiplexing requests over one connection.
//!
//! Each request gets a fresh id and a one-shot slot in the pending map; a
//! writer task owns the socket's send half and a reader task hands responses
//! back to their slots by id. A background task keeps the connection alive,
//! reconnecting with a linear backoff.

use std::sync::Arc;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::Ordering;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use futures::FutureExt;
use futures::SinkExt;
use futures::StreamExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use parking_lot::RwLock;
use serde::Deserialize;
use serde::Serialize;
use shot_guard::ClusterTokenResult;
use shot_guard::GuardError;
use shot_guard::ParamValue;
use shot_guard::TokenService;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::ClusterError;
use crate::codec;
use crate::codec::FrameStatus;
use crate::codec::Request;
use crate::codec::RequestBody;
use crate::codec::Response;
use crate::codec::ResponseBody;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_addr: String,
    /// How long a caller waits for its response.
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    /// Delay after the first failed attempt; each further failure adds one
    /// more, up to `max_reconnect_delay`.
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    /// Frames queued for the writer task.
    pub write_queue: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:18730".to_string(),
            request_timeout: Duration::from_millis(20),
            connect_timeout: Duration::from_secs(1),
            reconnect_delay: Duration::from_secs(2),
            max_reconnect_delay: Duration::from_secs(30),
            write_queue: 1024,
        }
    }
}

impl ClientConfig {
    pub fn new(server_addr: impl Into<String>) -> Self {
        Self {
            server_addr: server_addr.into(),
            ..Self::default()
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration, max: Duration) -> Self {
        self.reconnect_delay = delay;
        self.max_reconnect_delay = max;
        self
    }

    pub fn with_write_queue(mut self, write_queue: usize) -> Self {
        self.write_queue = write_queue;
        self
    }

    /// Delay before the next attempt after `failures` consecutive failures.
    pub fn backoff(&self, failures: u32) -> Duration {
        self.reconnect_delay
            .saturating_mul(failures.max(1))
            .min(self.max_reconnect_delay)
    }
}

#[derive(Debug)]
struct ClientInner {
    config: ClientConfig,
    next_id: AtomicI32,
    pending: DashMap<i32, oneshot::Sender<Response>>,
    /// Sender to the writer task of the live connection.
    outbound: RwLock<Option<mpsc::Sender<Bytes>>>,
    ready: watch::Sender<bool>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Talks to a remote token server.
///
/// Cheap to clone; clones share the connection. Install it on an engine with
/// [`Engine::set_token_service`](shot_guard::Engine::set_token_service).
#[derive(Debug, Clone)]
pub struct ClusterTokenClient {
    inner: Arc<ClientInner>,
}

impl ClusterTokenClient {
    pub fn new(config: ClientConfig) -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            inner: Arc::new(ClientInner {
                config,
                next_id: AtomicI32::new(1),
                pending: DashMap::new(),
                outbound: RwLock::new(None),
                ready,
                shutdown: CancellationToken::new(),
                task: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Starts connecting in the background. Calling it again is a no-op.
    pub fn start(&self) {
        let mut task = self.inner.task.lock();
        if task.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *task = Some(tokio::spawn(inner.maintain_connection()));
    }

    /// Closes the connection for good. A stopped client cannot be restarted.
    pub fn stop(&self) {
        self.inner.shutdown.cancel();
    }

    pub fn is_ready(&self) -> bool {
        *self.inner.ready.borrow()
    }

    /// Waits until the client is connected. Returns `false` on timeout.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        let mut ready = self.inner.ready.subscribe();
        matches!(
            tokio::time::timeout(timeout, ready.wait_for(|ready| *ready)).await,
            Ok(Ok(_))
        )
    }

    pub async fn ping(&self) -> Result<(), GuardError> {
        self.call(RequestBody::Ping).await.map(|_| ())
    }

    /// Checks one token against each flow in a single round trip.
    pub async fn request_batch_tokens(
        &self,
        flow_ids: Vec<i64>,
        acquire: u32,
    ) -> Result<Vec<(i64, ClusterTokenResult)>, GuardError> {
        let response = self
            .call(RequestBody::BatchFlow {
                flow_ids,
                count: acquire,
            })
            .await?;
        match response.body {
            ResponseBody::Batch(results) => Ok(results),
            other => Err(unexpected(other)),
        }
    }

    async fn request(&self, body: RequestBody) -> Result<ClusterTokenResult, GuardError> {
        let response = self.call(body).await?;
        match response.body {
            ResponseBody::Token(result) => Ok(result),
            other => Err(unexpected(other)),
        }
    }

    async fn call(&self, body: RequestBody) -> Result<Response, GuardError> {
        let outbound = self.inner.outbound.read().clone();
        let Some(outbound) = outbound else {
            return Err(GuardError::ClusterClientNotReady);
        };

        let id = self.inner.next_id();
        let frame = Request::new(id, body)
            .to_bytes()
            .map_err(|err| GuardError::Internal(err.to_string()))?;
        let (slot, reply) = oneshot::channel();
        self.inner.pending.insert(id, slot);
        let _slot = PendingSlot {
            pending: &self.inner.pending,
            id,
        };

        let timeout = self.inner.config.request_timeout;
        let exchange = async {
            outbound
                .send(frame)
                .await
                .map_err(|_| GuardError::ClusterClientNotReady)?;
            // A dropped slot means the connection went away; the caller sees
            // it like any other unanswered request.
            reply
                .await
                .map_err(|_| GuardError::ClusterRequestTimeout { timeout })
        };
        let response = match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result?,
            Err(_) => return Err(GuardError::ClusterRequestTimeout { timeout }),
        };
        match response.status {
            FrameStatus::Ok => Ok(response),
            FrameStatus::Bad => Err(GuardError::ClusterServerBadRequest),
        }
    }
}

/// Takes a request's slot out of the pending map once its caller stops
/// waiting, answered or not.
struct PendingSlot<'a> {
    pending: &'a DashMap<i32, oneshot::Sender<Response>>,
    id: i32,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

impl ClientInner {
    fn next_id(&self) -> i32 {
        let next = |id: i32| Some(if id == i32::MAX { 1 } else { id + 1 });
        match self
            .next_id
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, next)
        {
            Ok(id) | Err(id) => id,
        }
    }

    async fn maintain_connection(self: Arc<Self>) {
        let addr = self.config.server_addr.clone();
        let mut failures: u32 = 0;

        while !self.shutdown.is_cancelled() {
            let connect = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(&addr));
            match connect.await {
                Ok(Ok(stream)) => {
                    failures = 0;
                    info!(%addr, "connected to token server");
                    match self.serve(stream).await {
                        Ok(()) => info!(%addr, "token server connection closed"),
                        Err(error) => warn!(%addr, %error, "token server connection lost"),
                    }
                }
                Ok(Err(error)) => warn!(%addr, %error, "cannot connect to token server"),
                Err(_) => warn!(
                    %addr,
                    timeout = ?self.config.connect_timeout,
                    "connecting to token server timed out"
                ),
            }

            failures = failures.saturating_add(1);
            let delay = self.config.backoff(failures);
            debug!(%addr, ?delay, failures, "reconnecting to token server");
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        debug!(%addr, "token client stopped");
    }

    async fn serve(&self, stream: TcpStream) -> Result<(), ClusterError> {
        stream.set_nodelay(true)?;
        let (mut sink, mut frames) = codec::framed(stream).split();
        let (tx, mut rx) = mpsc::channel::<Bytes>(self.config.write_queue.max(1));
        *self.outbound.write() = Some(tx);
        self.ready.send_replace(true);

        let writer = async {
            while let Some(frame) = rx.recv().await {
                sink.send(frame).await?;
            }
            Ok::<(), ClusterError>(())
        };
        let reader = async {
            while let Some(frame) = frames.next().await {
                self.dispatch(frame?.freeze());
            }
            Ok::<(), ClusterError>(())
        };
        let result = tokio::select! {
            _ = self.shutdown.cancelled() => Ok(()),
            result = writer => result,
            result = reader => result,
        };

        *self.outbound.write() = None;
        self.ready.send_replace(false);
        // Waiters on this connection can no longer be answered.
        self.pending.clear();
        result
    }

    fn dispatch(&self, frame: Bytes) {
        match Response::decode(frame) {
            Ok(response) => match self.pending.remove(&response.id) {
                Some((_, slot)) => {
                    let _ = slot.send(response);
                }
                None => debug!(id = response.id, "dropping response to unknown request"),
            },
            Err(error) => warn!(%error, "dropping undecodable response"),
        }
    }
}

fn unexpected(body: ResponseBody) -> GuardError {
    GuardError::Internal(format!("unexpected response body {body:?}"))
}

impl TokenService for ClusterTokenClient {
    fn request_token(
        &self,
        flow_id: i64,
        acquire: u32,
        prioritized: bool,
    ) -> BoxFuture<'_, Result<ClusterTokenResult, GuardError>> {
        self.request(RequestBody::Flow {
            flow_id,
            count: acquire,
            prioritized,
        })
        .boxed()
    }

    fn request_param_token(
        &self,
        flow_id: i64,
        acquire: u32,
        params: Vec<ParamValue>,
    ) -> BoxFuture<'_, Result<ClusterTokenResult, GuardError>> {
        self.request(RequestBody::ParamFlow {
            flow_id,
            count: acquire,
            params,
        })
        .boxed()
    }

    fn acquire_concurrent_token(
        &self,
        flow_id: i64,
        acquire: u32,
        prioritized: bool,
    ) -> BoxFuture<'_, Result<ClusterTokenResult, GuardError>> {
        self.request(RequestBody::ConcurrentAcquire {
            flow_id,
            count: acquire,
            prioritized,
        })
        .boxed()
    }

    fn release_concurrent_token(
        &self,
        token_id: u64,
    ) -> BoxFuture<'_, Result<ClusterTokenResult, GuardError>> {
        self.request(RequestBody::ConcurrentRelease { token_id })
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_backs_off_linearly_up_to_the_cap() {
        let config = ClientConfig::default();
        assert_eq!(config.backoff(1), Duration::from_secs(2));
        assert_eq!(config.backoff(3), Duration::from_secs(6));
        assert_eq!(config.backoff(15), Duration::from_secs(30));
        assert_eq!(config.backoff(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn it_wraps_request_ids_to_positive_values() {
        let client = ClusterTokenClient::new(ClientConfig::default());
        client.inner.next_id.store(i32::MAX, Ordering::Relaxed);
        assert_eq!(client.inner.next_id(), i32::MAX);
        assert_eq!(client.inner.next_id(), 1);
        assert_eq!(client.inner.next_id(), 2);
    }

    #[tokio::test]
    async fn test_unconnected_client_is_not_ready() {
        let client = ClusterTokenClient::new(ClientConfig::default());
        assert!(!client.is_ready());
        assert_eq!(
            client.request_token(1, 1, false).await,
            Err(GuardError::ClusterClientNotReady)
        );
    }

    #[tokio::test]
    async fn test_abandoned_calls_leave_no_pending_slot() {
        let client = ClusterTokenClient::new(ClientConfig::default());
        let (tx, mut rx) = mpsc::channel(4);
        *client.inner.outbound.write() = Some(tx);

        let mut call = Box::pin(client.ping());
        assert!(futures::poll!(&mut call).is_pending());
        assert!(rx.recv().await.is_some());
        assert_eq!(client.inner.pending.len(), 1);

        drop(call);
        assert!(client.inner.pending.is_empty());
    }

    #[test]
    fn it_reads_config_from_json() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"server_addr": "10.0.0.1:18730"}"#).unwrap();
        assert_eq!(config.server_addr, "10.0.0.1:18730");
        assert_eq!(config.request_timeout, Duration::from_millis(20));
    }
}
