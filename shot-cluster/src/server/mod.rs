//! The token server.
//!
//! Accepts any number of clients, each on its own task, and answers every
//! frame with a response carrying the request's id. Frames that cannot be
//! decoded get a `BAD` response; frames too short to carry an id are
//! dropped.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures::SinkExt;
use futures::StreamExt;
use serde::Deserialize;
use serde::Serialize;
use shot_guard::GuardError;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

mod concurrency;
mod service;

pub use service::DefaultTokenService;

use crate::ClusterError;
use crate::codec;
use crate::codec::Request;
use crate::codec::RequestBody;
use crate::codec::Response;
use crate::codec::ResponseBody;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Requests per second the server answers before replying
    /// `TooManyRequest`.
    pub max_allowed_qps: f64,
    /// Multiplier applied to every global threshold.
    pub exceed_count: f64,
    /// Share of a flow's threshold that prioritized requests may reserve in
    /// future windows.
    pub max_occupy_ratio: f64,
    pub occupy_timeout_ms: u64,
    pub sample_count: u32,
    pub interval_ms: u32,
    /// Distinct values tracked per hot-parameter flow.
    pub max_param_values: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:18730".to_string(),
            max_allowed_qps: 30_000.0,
            exceed_count: 1.0,
            max_occupy_ratio: 1.0,
            occupy_timeout_ms: 500,
            sample_count: 10,
            interval_ms: 1_000,
            max_param_values: 4_000,
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            ..Self::default()
        }
    }

    pub fn with_max_allowed_qps(mut self, max_allowed_qps: f64) -> Self {
        self.max_allowed_qps = max_allowed_qps;
        self
    }

    pub fn with_exceed_count(mut self, exceed_count: f64) -> Self {
        self.exceed_count = exceed_count;
        self
    }

    pub fn with_max_occupy_ratio(mut self, max_occupy_ratio: f64) -> Self {
        self.max_occupy_ratio = max_occupy_ratio;
        self
    }

    pub fn with_occupy_timeout_ms(mut self, occupy_timeout_ms: u64) -> Self {
        self.occupy_timeout_ms = occupy_timeout_ms;
        self
    }

    pub fn with_window(mut self, sample_count: u32, interval_ms: u32) -> Self {
        self.sample_count = sample_count;
        self.interval_ms = interval_ms;
        self
    }

    pub fn with_max_param_values(mut self, max_param_values: usize) -> Self {
        self.max_param_values = max_param_values;
        self
    }

    pub fn validate(&self) -> Result<(), GuardError> {
        let invalid = |msg: &str| Err(GuardError::ConfigInvalid(msg.to_string()));
        if !(self.max_allowed_qps > 0.0) {
            return invalid("max_allowed_qps must be positive");
        }
        if !(self.exceed_count > 0.0) {
            return invalid("exceed_count must be positive");
        }
        if !(self.max_occupy_ratio >= 0.0) {
            return invalid("max_occupy_ratio must not be negative");
        }
        if self.sample_count == 0 || self.interval_ms == 0 {
            return invalid("sample_count and interval_ms must be positive");
        }
        if self.interval_ms % self.sample_count != 0 {
            return invalid("interval_ms must be a multiple of sample_count");
        }
        if self.max_param_values == 0 {
            return invalid("max_param_values must be positive");
        }
        Ok(())
    }
}

/// Serves a [`DefaultTokenService`] over TCP.
///
/// ```rust,no_run
/// use std::sync::Arc;
///
/// use shot_cluster::DefaultTokenService;
/// use shot_cluster::ServerConfig;
/// use shot_cluster::TokenServer;
///
/// # async fn serve() -> Result<(), shot_cluster::ClusterError> {
/// let service = Arc::new(DefaultTokenService::new(ServerConfig::new("0.0.0.0:18730"))?);
/// let server = TokenServer::bind(service).await?;
/// server.run().await
/// # }
/// ```
#[derive(Debug)]
pub struct TokenServer {
    service: Arc<DefaultTokenService>,
    listener: TcpListener,
    shutdown: CancellationToken,
}

impl TokenServer {
    /// Binds to the service's configured address.
    pub async fn bind(service: Arc<DefaultTokenService>) -> Result<Self, ClusterError> {
        let listener = TcpListener::bind(&service.config().bind_addr).await?;
        Ok(Self {
            service,
            listener,
            shutdown: CancellationToken::new(),
        })
    }

    /// The bound address; useful after binding port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn service(&self) -> &Arc<DefaultTokenService> {
        &self.service
    }

    /// Cancelling the token stops the accept loop and closes every client
    /// connection.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn run(self) -> Result<(), ClusterError> {
        let addr = self.listener.local_addr()?;
        info!(%addr, "token server listening");

        loop {
            let (stream, peer) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(error) => {
                        error!(%error, "failed to accept token client");
                        continue;
                    }
                },
            };

            info!(%peer, "token client connected");
            let service = Arc::clone(&self.service);
            let shutdown = self.shutdown.child_token();
            tokio::spawn(async move {
                service.client_connected();
                let result = serve_client(stream, &service, shutdown).await;
                service.client_disconnected();
                match result {
                    Ok(()) => info!(%peer, "token client disconnected"),
                    Err(error) => warn!(%peer, %error, "token client connection failed"),
                }
            });
        }

        info!(%addr, "token server stopped");
        Ok(())
    }
}

async fn serve_client(
    stream: TcpStream,
    service: &DefaultTokenService,
    shutdown: CancellationToken,
) -> Result<(), ClusterError> {
    stream.set_nodelay(true)?;
    let mut framed = codec::framed(stream);

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            frame = framed.next() => match frame {
                Some(frame) => frame?.freeze(),
                None => return Ok(()),
            },
        };
        if let Some(response) = handle_frame(service, frame) {
            framed.send(response.to_bytes()?).await?;
        }
    }
}

fn handle_frame(service: &DefaultTokenService, frame: Bytes) -> Option<Response> {
    let Some((id, kind)) = Request::peek_header(&frame) else {
        warn!(len = frame.len(), "dropping frame without a header");
        return None;
    };
    match Request::decode(frame) {
        Ok(request) => Some(handle(service, request)),
        Err(error) => {
            debug!(id, kind, %error, "malformed request");
            Some(Response::bad(id, kind))
        }
    }
}

fn handle(service: &DefaultTokenService, request: Request) -> Response {
    let kind = request.body.message_type();
    let body = match request.body {
        RequestBody::Ping => ResponseBody::Empty,
        RequestBody::Flow {
            flow_id,
            count,
            prioritized,
        } => ResponseBody::Token(service.acquire_flow(flow_id, count, prioritized)),
        RequestBody::BatchFlow { flow_ids, count } => {
            ResponseBody::Batch(service.acquire_batch(&flow_ids, count))
        }
        RequestBody::ParamFlow {
            flow_id,
            count,
            params,
        } => ResponseBody::Token(service.acquire_param(flow_id, count, &params)),
        RequestBody::ConcurrentAcquire { flow_id, count, .. } => {
            ResponseBody::Token(service.acquire_concurrent(flow_id, count))
        }
        RequestBody::ConcurrentRelease { token_id } => {
            ResponseBody::Token(service.release_concurrent(token_id))
        }
    };
    Response::ok(request.id, kind, body)
}

#[cfg(test)]
mod tests {
    use shot_guard::ClusterFlowConfig;
    use shot_guard::FlowRule;
    use shot_guard::TokenStatus;

    use super::*;
    use crate::codec::FrameStatus;

    #[tokio::test]
    async fn test_frames_are_answered_with_their_id() {
        let service = DefaultTokenService::new(ServerConfig::default()).unwrap();
        service
            .load_flow_rules(vec![
                FlowRule::qps("orders", 1.0).with_cluster(ClusterFlowConfig::new(3)),
            ])
            .unwrap();

        let request = Request::new(
            42,
            RequestBody::Flow {
                flow_id: 3,
                count: 1,
                prioritized: false,
            },
        );
        let response = handle_frame(&service, request.to_bytes().unwrap()).unwrap();
        assert_eq!(response.id, 42);
        assert_eq!(response.status, FrameStatus::Ok);
        assert!(matches!(
            response.body,
            ResponseBody::Token(result) if result.status == TokenStatus::Ok
        ));
    }

    #[tokio::test]
    async fn test_malformed_frames_get_bad_responses() {
        let service = DefaultTokenService::new(ServerConfig::default()).unwrap();

        let unknown = handle_frame(&service, Bytes::from_static(&[0, 0, 0, 9, 42])).unwrap();
        assert_eq!(unknown, Response::bad(9, 42));

        let truncated =
            handle_frame(&service, Bytes::from_static(&[0, 0, 0, 10, 1, 0, 0])).unwrap();
        assert_eq!(truncated, Response::bad(10, 1));

        assert!(handle_frame(&service, Bytes::from_static(&[0, 0])).is_none());
    }

    #[test]
    fn it_validates_config() {
        assert!(ServerConfig::default().validate().is_ok());
        assert!(ServerConfig::default().with_window(3, 1_000).validate().is_err());
        assert!(
            ServerConfig::default()
                .with_max_allowed_qps(f64::NAN)
                .validate()
                .is_err()
        );
        let config: ServerConfig = serde_json::from_str(r#"{"exceed_count": 1.5}"#).unwrap();
        assert_eq!(config.exceed_count, 1.5);
        assert_eq!(config.sample_count, 10);
    }
}
