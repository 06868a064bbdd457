use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::SinkExt;
use futures::StreamExt;
use more_asserts::assert_gt;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use shot_cluster::ClientConfig;
use shot_cluster::ClusterTokenClient;
use shot_cluster::DefaultTokenService;
use shot_cluster::ServerConfig;
use shot_cluster::TokenServer;
use shot_cluster::codec;
use shot_cluster::codec::FrameStatus;
use shot_cluster::codec::MessageType;
use shot_cluster::codec::Request;
use shot_cluster::codec::RequestBody;
use shot_cluster::codec::Response;
use shot_cluster::codec::ResponseBody;
use shot_guard::ClusterFallback;
use shot_guard::ClusterFlowConfig;
use shot_guard::Engine;
use shot_guard::EngineConfig;
use shot_guard::EntryRequest;
use shot_guard::FlowRule;
use shot_guard::GuardError;
use shot_guard::ParamFlowRule;
use shot_guard::ParamValue;
use shot_guard::TokenService;
use shot_guard::TokenStatus;

const READY: Duration = Duration::from_secs(5);

async fn start_server(
    flows: Vec<FlowRule>,
) -> (SocketAddr, Arc<DefaultTokenService>, CancellationToken) {
    let service = Arc::new(DefaultTokenService::new(ServerConfig::new("127.0.0.1:0")).unwrap());
    service.load_flow_rules(flows).unwrap();
    let server = TokenServer::bind(Arc::clone(&service)).await.unwrap();
    let addr = server.local_addr().unwrap();
    let shutdown = server.shutdown_token();
    tokio::spawn(server.run());
    (addr, service, shutdown)
}

async fn connect(addr: SocketAddr, timeout: Duration) -> ClusterTokenClient {
    let client = ClusterTokenClient::new(
        ClientConfig::new(addr.to_string())
            .with_request_timeout(timeout)
            .with_reconnect_delay(Duration::from_millis(50), Duration::from_millis(200)),
    );
    client.start();
    assert!(client.wait_ready(READY).await, "client never connected");
    client
}

/// A server that reads requests and never answers them.
async fn silent_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut framed = codec::framed(stream);
                while let Some(Ok(_)) = framed.next().await {}
            });
        }
    });
    addr
}

#[tokio::test]
async fn test_ping_and_flow_tokens() {
    let (addr, service, _shutdown) =
        start_server(vec![FlowRule::qps("orders", 2.0).with_cluster(ClusterFlowConfig::new(1))])
            .await;
    let client = connect(addr, Duration::from_secs(1)).await;

    client.ping().await.unwrap();
    assert_eq!(service.connected_clients(), 1);

    for _ in 0..2 {
        let result = client.request_token(1, 1, false).await.unwrap();
        assert_eq!(result.status, TokenStatus::Ok);
    }
    let blocked = client.request_token(1, 1, false).await.unwrap();
    assert_eq!(blocked.status, TokenStatus::Blocked);

    let missing = client.request_token(99, 1, false).await.unwrap();
    assert_eq!(missing.status, TokenStatus::NoRuleExists);
}

#[tokio::test]
async fn test_batch_and_param_tokens() {
    let (addr, service, _shutdown) = start_server(vec![
        FlowRule::qps("orders", 1.0).with_cluster(ClusterFlowConfig::new(1)),
        FlowRule::qps("users", 5.0).with_cluster(ClusterFlowConfig::new(2)),
    ])
    .await;
    service
        .load_param_rules(vec![
            ParamFlowRule::new("search", 0, 1.0).with_cluster(ClusterFlowConfig::new(3)),
        ])
        .unwrap();
    let client = connect(addr, Duration::from_secs(1)).await;

    let results = client.request_batch_tokens(vec![1, 2, 1], 1).await.unwrap();
    let statuses: Vec<_> = results.iter().map(|(id, r)| (*id, r.status)).collect();
    assert_eq!(
        statuses,
        vec![
            (1, TokenStatus::Ok),
            (2, TokenStatus::Ok),
            (1, TokenStatus::Blocked)
        ]
    );

    let rust = vec![ParamValue::from("rust")];
    let first = client.request_param_token(3, 1, rust.clone()).await.unwrap();
    assert_eq!(first.status, TokenStatus::Ok);
    let second = client.request_param_token(3, 1, rust).await.unwrap();
    assert_eq!(second.status, TokenStatus::Blocked);
    let other = client
        .request_param_token(3, 1, vec![ParamValue::from("go")])
        .await
        .unwrap();
    assert_eq!(other.status, TokenStatus::Ok);
}

#[tokio::test]
async fn test_responses_carry_the_request_id() {
    let (addr, _service, _shutdown) = start_server(Vec::new()).await;
    let mut framed = codec::framed(TcpStream::connect(addr).await.unwrap());

    let ping = Request::new(42, RequestBody::Ping).to_bytes().unwrap();
    framed.send(ping).await.unwrap();
    let frame = framed.next().await.unwrap().unwrap().freeze();
    let response = Response::decode(frame).unwrap();
    assert_eq!(response, Response::ok(42, MessageType::Ping, ResponseBody::Empty));

    framed
        .send(Bytes::from_static(&[0, 0, 0, 7, 99]))
        .await
        .unwrap();
    let frame = framed.next().await.unwrap().unwrap().freeze();
    let response = Response::decode(frame).unwrap();
    assert_eq!(response.id, 7);
    assert_eq!(response.kind, 99);
    assert_eq!(response.status, FrameStatus::Bad);
}

#[tokio::test]
async fn test_stale_responses_are_dropped() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut framed = codec::framed(stream);
        while let Some(Ok(frame)) = framed.next().await {
            let (id, _) = Request::peek_header(&frame).unwrap();
            for reply in [id.wrapping_add(1_000), id] {
                let response = Response::ok(reply, MessageType::Ping, ResponseBody::Empty);
                framed.send(response.to_bytes().unwrap()).await.unwrap();
            }
        }
    });

    let client = connect(addr, Duration::from_secs(1)).await;
    client.ping().await.unwrap();
    client.ping().await.unwrap();
}

#[tokio::test]
async fn test_silent_server_times_out() {
    let addr = silent_server().await;
    let client = connect(addr, Duration::from_millis(50)).await;

    let err = client.request_token(1, 1, false).await.unwrap_err();
    assert_eq!(
        err,
        GuardError::ClusterRequestTimeout {
            timeout: Duration::from_millis(50)
        }
    );
    assert!(client.is_ready());
}

#[tokio::test]
async fn test_engine_falls_back_when_the_server_is_silent() {
    let addr = silent_server().await;
    let client = connect(addr, Duration::from_millis(20)).await;

    let engine = Engine::new(EngineConfig::default()).unwrap();
    engine
        .load_rules(vec![
            FlowRule::qps("open", 1.0)
                .with_cluster(ClusterFlowConfig::new(1))
                .into(),
            FlowRule::qps("local", 1.0)
                .with_cluster(ClusterFlowConfig::new(2).with_fallback(ClusterFallback::Local))
                .into(),
        ])
        .unwrap();
    engine.set_token_service(Arc::new(client));

    for _ in 0..3 {
        assert!(engine.entry(EntryRequest::new("open")).await.is_allowed());
    }
    assert!(engine.entry(EntryRequest::new("local")).await.is_allowed());
    assert!(!engine.entry(EntryRequest::new("local")).await.is_allowed());
}

#[tokio::test]
async fn test_engine_shares_the_server_budget() {
    let (addr, _service, _shutdown) =
        start_server(vec![FlowRule::qps("orders", 3.0).with_cluster(ClusterFlowConfig::new(4))])
            .await;
    let rule = FlowRule::qps("orders", 3.0).with_cluster(ClusterFlowConfig::new(4));

    let first = Engine::new(EngineConfig::default()).unwrap();
    let second = Engine::new(EngineConfig::default()).unwrap();
    for engine in [&first, &second] {
        engine.load_rules(vec![rule.clone().into()]).unwrap();
        let client = connect(addr, Duration::from_secs(1)).await;
        engine.set_token_service(Arc::new(client));
    }

    let mut allowed = 0;
    for engine in [&first, &second, &first, &second] {
        if engine.entry(EntryRequest::new("orders")).await.is_allowed() {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 3);
}

#[tokio::test]
async fn test_concurrency_tokens_over_tcp() {
    let (addr, service, _shutdown) = start_server(vec![
        FlowRule::concurrency("jobs", 1.0).with_cluster(ClusterFlowConfig::new(9)),
        FlowRule::concurrency("short", 1.0)
            .with_cluster(ClusterFlowConfig::new(10).with_resource_timeout_ms(100)),
    ])
    .await;
    let client = connect(addr, Duration::from_secs(1)).await;

    let token = client.acquire_concurrent_token(9, 1, false).await.unwrap();
    assert_eq!(token.status, TokenStatus::Ok);
    assert_gt!(token.token_id, 0);
    let blocked = client.acquire_concurrent_token(9, 1, false).await.unwrap();
    assert_eq!(blocked.status, TokenStatus::Blocked);

    let released = client.release_concurrent_token(token.token_id).await.unwrap();
    assert_eq!(released.status, TokenStatus::ReleaseOk);
    let again = client.release_concurrent_token(token.token_id).await.unwrap();
    assert_eq!(again.status, TokenStatus::AlreadyReleased);
    assert_eq!(service.in_flight(9), 0);

    let leased = client.acquire_concurrent_token(10, 1, false).await.unwrap();
    assert_eq!(leased.status, TokenStatus::Ok);
    assert_eq!(service.in_flight(10), 1);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(service.in_flight(10), 0);
    let late = client.release_concurrent_token(leased.token_id).await.unwrap();
    assert_eq!(late.status, TokenStatus::AlreadyReleased);
}

#[tokio::test]
async fn test_shutdown_disconnects_clients() {
    let (addr, service, shutdown) = start_server(Vec::new()).await;
    let client = connect(addr, Duration::from_secs(1)).await;
    client.ping().await.unwrap();

    shutdown.cancel();
    let deadline = tokio::time::Instant::now() + READY;
    while client.is_ready() || service.connected_clients() > 0 {
        assert!(tokio::time::Instant::now() < deadline, "client stayed connected");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(
        client.ping().await.unwrap_err(),
        GuardError::ClusterClientNotReady
    );
    client.stop();
}
