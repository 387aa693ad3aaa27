//! 令牌服务端与客户端的端到端测试。
//!
//! # 教案式说明
//! - **意图 (Why)**：验证线上行为而不是内部结构：同一连接上的多个请求按编号关联、
//!   非法请求只影响自身、租约能完整往返、服务端自我保护生效；
//! - **约束 (What)**：每个用例启动独立的服务端（监听 `127.0.0.1:0`），互不共享配额；
//!   阻塞式客户端调用一律放进 `spawn_blocking`，避免占住运行时工作线程。

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use spark_guard_cluster::protocol::codec::read_frame;
use spark_guard_cluster::protocol::{
    ClusterRequest, ClusterResponse, RequestData, ResponseData, decode_response_frame,
    encode_request, msg_type,
};
use spark_guard_cluster::server::NamespacedFlowRule;
use spark_guard_cluster::{
    ClientConfig, ClusterTokenClient, DefaultTokenService, ServerConfig, TokenServer,
};
use spark_guard_core::rule::{ClusterFlowConfig, ClusterThresholdType, FlowGrade, FlowRule};
use spark_guard_core::{TokenResultStatus, TokenService};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::watch;

const QPS_FLOW: i64 = 1;
const LEASE_FLOW: i64 = 2;

fn cluster_rule(resource: &str, flow_id: i64, count: f64) -> FlowRule {
    FlowRule::new(resource, count).with_cluster(ClusterFlowConfig {
        flow_id,
        threshold_type: ClusterThresholdType::Global,
        ..ClusterFlowConfig::default()
    })
}

fn config(max_allowed_qps: u32) -> ServerConfig {
    ServerConfig {
        bind: "127.0.0.1:0".into(),
        max_allowed_qps,
        flow_rules: vec![
            NamespacedFlowRule::new("orders", cluster_rule("create-order", QPS_FLOW, 5.0)),
            NamespacedFlowRule::new(
                "orders",
                cluster_rule("pay-order", LEASE_FLOW, 1.0).with_grade(FlowGrade::Thread),
            ),
        ],
        ..ServerConfig::default()
    }
}

struct Running {
    addr: SocketAddr,
    service: Arc<DefaultTokenService>,
    _shutdown: watch::Sender<bool>,
}

async fn start(config: ServerConfig) -> Running {
    let service = Arc::new(DefaultTokenService::from_config(&config).expect("valid rules"));
    let server = TokenServer::bind(&config, service.clone()).await.expect("bind");
    let addr = server.local_addr();
    let (shutdown, signal) = watch::channel(false);
    tokio::spawn(server.run(signal));
    Running {
        addr,
        service,
        _shutdown: shutdown,
    }
}

async fn connect(addr: SocketAddr) -> ClusterTokenClient {
    let handle = Handle::current();
    tokio::task::spawn_blocking(move || {
        let config = ClientConfig::new(addr.to_string()).with_namespace("orders");
        ClusterTokenClient::connect(config, &handle)
    })
    .await
    .unwrap()
    .expect("connect")
}

async fn write_requests(stream: &mut TcpStream, requests: &[ClusterRequest<RequestData>]) {
    let mut buf = BytesMut::new();
    for request in requests {
        encode_request(request, &mut buf).unwrap();
    }
    stream.write_all(&buf).await.unwrap();
}

async fn read_response(stream: &mut TcpStream, buf: &mut BytesMut) -> ClusterResponse<Bytes> {
    tokio::time::timeout(
        Duration::from_secs(5),
        read_frame(stream, buf, decode_response_frame),
    )
    .await
    .expect("response in time")
    .unwrap()
    .expect("connection open")
}

fn flow(id: i64, count: i32) -> ClusterRequest<RequestData> {
    ClusterRequest::new(
        id,
        RequestData::Flow {
            flow_id: QPS_FLOW,
            count,
            prioritized: false,
        },
    )
}

/// 流水线发送的请求，响应各自回显编号与消息类型。
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pipelined_requests_are_correlated_by_id() {
    let server = start(config(10_000)).await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    write_requests(
        &mut stream,
        &[
            ClusterRequest::new(
                100,
                RequestData::Ping {
                    namespace: "orders".into(),
                },
            ),
            flow(101, 1),
            ClusterRequest::new(
                102,
                RequestData::ConcurrentRelease { token_id: 999 },
            ),
        ],
    )
    .await;

    let mut buf = BytesMut::new();
    let mut seen = HashSet::new();
    for _ in 0..3 {
        let response = read_response(&mut stream, &mut buf).await;
        let expected_type = match response.id {
            100 => msg_type::PING,
            101 => msg_type::FLOW,
            102 => msg_type::CONCURRENT_FLOW_RELEASE,
            other => panic!("unexpected id {other}"),
        };
        assert_eq!(response.msg_type, expected_type);
        if response.id == 102 {
            assert_eq!(response.status, TokenResultStatus::AlreadyRelease);
        }
        seen.insert(response.id);
    }
    assert_eq!(seen, HashSet::from([100, 101, 102]));
}

/// 非法请求只得到 `BAD_REQUEST`，连接保持可用且配额不受影响。
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bad_request_keeps_connection_usable() {
    let server = start(config(10_000)).await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();

    let mut raw = BytesMut::new();
    raw.put_u32(1 + 8);
    raw.put_u8(42);
    raw.put_i64(7);
    raw.put_u32(1 + 8 + 2);
    raw.put_u8(msg_type::FLOW);
    raw.put_i64(8);
    raw.put_u16(0);
    stream.write_all(&raw).await.unwrap();

    let mut buf = BytesMut::new();
    let mut statuses = Vec::new();
    for _ in 0..2 {
        let response = read_response(&mut stream, &mut buf).await;
        statuses.push((response.id, response.status));
    }
    statuses.sort_by_key(|(id, _)| *id);
    assert_eq!(
        statuses,
        vec![
            (7, TokenResultStatus::BadRequest),
            (8, TokenResultStatus::BadRequest)
        ]
    );

    write_requests(&mut stream, &[flow(9, 5)]).await;
    let response = read_response(&mut stream, &mut buf).await;
    assert_eq!(response.id, 9);
    assert_eq!(response.status, TokenResultStatus::Ok, "非法请求未消耗配额");
    assert_eq!(
        ResponseData::decode(response.msg_type, response.data).unwrap(),
        ResponseData::Flow {
            remaining: 0,
            wait_in_ms: 0
        }
    );
}

/// 多线程并发经同一连接申请令牌，结果互不串扰且总量不超过阈值。
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_callers_share_one_connection() {
    let server = start(config(10_000)).await;
    let client = Arc::new(connect(server.addr).await);
    assert_eq!(server.service.connections().connected_count("orders"), 1);

    let granted = tokio::task::spawn_blocking(move || {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let client = client.clone();
                std::thread::spawn(move || {
                    (0..4)
                        .map(|_| client.request_token(QPS_FLOW, 1, false))
                        .filter(|result| {
                            assert!(
                                matches!(
                                    result.status,
                                    TokenResultStatus::Ok | TokenResultStatus::Blocked
                                ),
                                "unexpected status {}",
                                result.status
                            );
                            result.is_ok()
                        })
                        .count()
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .sum::<usize>()
    })
    .await
    .unwrap();
    assert_eq!(granted, 5);
}

/// 并发租约：申请、超限阻断、归还、重复归还、再次申请。
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_lease_round_trip() {
    let server = start(config(10_000)).await;
    let client = connect(server.addr).await;
    let service = server.service.clone();

    tokio::task::spawn_blocking(move || {
        let lease = client.request_concurrent_token("ignored", LEASE_FLOW, 1);
        assert_eq!(lease.status, TokenResultStatus::Ok);
        assert!(lease.token_id > 0);
        assert_eq!(service.leases().in_flight(LEASE_FLOW), 1);

        let second = client.request_concurrent_token("ignored", LEASE_FLOW, 1);
        assert_eq!(second.status, TokenResultStatus::Blocked, "不得重复发放");

        assert_eq!(
            client.release_concurrent_token(lease.token_id).status,
            TokenResultStatus::ReleaseOk
        );
        assert_eq!(
            client.release_concurrent_token(lease.token_id).status,
            TokenResultStatus::AlreadyRelease
        );

        let again = client.request_concurrent_token("ignored", LEASE_FLOW, 1);
        assert!(again.is_ok());
        assert_eq!(
            client.request_token(404, 1, false).status,
            TokenResultStatus::NoRuleExists
        );
    })
    .await
    .unwrap();
}

/// 客户端断开后，其持有的租约被释放。
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disconnect_releases_client_leases() {
    let server = start(config(10_000)).await;
    let client = connect(server.addr).await;
    let client = tokio::task::spawn_blocking(move || {
        assert!(
            client
                .request_concurrent_token("ignored", LEASE_FLOW, 1)
                .is_ok()
        );
        client
    })
    .await
    .unwrap();
    assert_eq!(server.service.leases().len(), 1);
    drop(client);

    let deadline = Instant::now() + Duration::from_secs(5);
    while !server.service.leases().is_empty() {
        assert!(Instant::now() < deadline, "断开后租约应被释放");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(server.service.connections().connected_count("orders"), 0);
}

/// 超过服务端处理能力的请求收到 `TOO_MANY_REQUEST`。
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_rejects_requests_beyond_its_own_capacity() {
    let server = start(config(1)).await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    write_requests(&mut stream, &[flow(1, 1), flow(2, 1), flow(3, 1)]).await;

    let mut buf = BytesMut::new();
    let mut too_many = 0;
    for _ in 0..3 {
        if read_response(&mut stream, &mut buf).await.status == TokenResultStatus::TooManyRequest {
            too_many += 1;
        }
    }
    assert_eq!(too_many, 2);
}

/// 服务端不应答时，客户端在超时后失败而不是无限等待。
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_server_times_out() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let _silent = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        drop(stream);
    });

    let handle = Handle::current();
    let err = tokio::task::spawn_blocking(move || {
        let config = ClientConfig::new(addr.to_string())
            .with_request_timeout(Duration::from_millis(100));
        ClusterTokenClient::connect(config, &handle)
    })
    .await
    .unwrap()
    .unwrap_err();
    assert_eq!(err.code(), "spark.guard.client.timeout");
}

/// 安装为进程级令牌服务后，核心 crate 的集群流控规则经服务端判定。
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn installed_client_drives_cluster_flow_rules() {
    let server = start(config(10_000)).await;
    let client = Arc::new(connect(server.addr).await);

    tokio::task::spawn_blocking(move || {
        spark_guard_core::rule::flow::load_rules(vec![
            FlowRule::new("create-order", 0.0).with_cluster(ClusterFlowConfig {
                flow_id: QPS_FLOW,
                ..ClusterFlowConfig::default()
            }),
        ])
        .unwrap();
        spark_guard_core::token::install(client);

        let passed = (0..7)
            .filter(|_| match spark_guard_core::global().entry("create-order") {
                Ok(entry) => {
                    entry.exit().unwrap();
                    true
                }
                Err(_) => false,
            })
            .count();
        spark_guard_core::token::uninstall();
        assert_eq!(passed, 5, "全局阈值为 5");
    })
    .await
    .unwrap();
}

/// 仓库自带的示例配置可以直接启动服务端。
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bundled_demo_config_starts_a_server() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../demos/token-server.toml");
    let mut config = ServerConfig::from_path(path).unwrap();
    config.bind = "127.0.0.1:0".into();
    assert_eq!(config.flow_rules.len(), 3);
    assert_eq!(config.param_rules.len(), 1);

    let server = start(config).await;
    assert_eq!(server.service.rules().flow_ids().len(), 3);
    assert!(server.service.connections().namespaces().contains(&"orders".to_owned()));
}

/// 批量申请经线上往返后保留失败规则编号，先前已通过的规则不回退。
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn batch_failure_reports_block_id_over_the_wire() {
    let server = start(config(10_000)).await;
    let client = connect(server.addr).await;

    tokio::task::spawn_blocking(move || {
        let failed = client.batch_request_token(&[QPS_FLOW, 404], 1, false);
        assert_eq!(failed.status, TokenResultStatus::NoRuleExists);
        assert_eq!(
            failed
                .attachments
                .get(spark_guard_core::token::ATTACHMENT_BLOCK_ID)
                .map(String::as_str),
            Some("404")
        );

        let rest = client.batch_request_token(&[QPS_FLOW], 4, false);
        assert_eq!(rest.status, TokenResultStatus::Ok);
        assert_eq!(rest.remaining, 0, "首个批次已消耗 1 个配额");
        assert!(rest.attachments.is_empty());
    })
    .await
    .unwrap();
}
