//! # client 模块说明
//!
//! ## 定位（Why）
//! - 业务进程通过 [`ClusterTokenClient`] 把集群规则的判定委托给令牌服务端；
//!   客户端实现核心 crate 的 [`TokenService`]，安装后流控槽位无需感知网络细节。
//!
//! ## 逻辑（How）
//! - 一条 `TcpStream` 拆成读写两半，各由一个 tokio 任务驱动：
//!   写任务从无界通道取出已编码的帧写出；读任务逐帧解码响应，按编号找到等待者并投递；
//! - 调用方线程在 `std::sync::mpsc::SyncSender` 上阻塞等待，上限为 `request_timeout_ms`；
//!   超时后移除等待登记，迟到的响应被丢弃；
//! - 连接建立后立即发送 PING，声明本客户端所属的命名空间。
//!
//! ## 契约（What）
//! - 判定接口（[`TokenService`] 的各方法）不返回错误：超时、断连、编解码失败一律映射为
//!   `FAIL`，由规则的 `fallback_to_local_when_fail` 决定回退到本地判定还是直接放行；
//! - 阻塞等待发生在调用线程上，必须在多线程运行时之外或 `spawn_blocking` 中调用，
//!   否则可能占住驱动读任务的工作线程。
//!
//! ## 风险（Trade-offs）
//! - 连接断开后客户端不自动重连，`is_connected` 变为 `false`，后续请求直接返回 `FAIL`；
//!   需要重连时由上层重新 `connect` 并替换已安装的令牌服务。

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::mpsc::{RecvTimeoutError, SyncSender, sync_channel};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use spark_guard_core::{ParamValue, TokenResult, TokenService};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ClientError;
use crate::protocol::codec::read_frame;
use crate::protocol::{
    ClusterRequest, ClusterResponse, RequestData, ResponseData, decode_response_frame,
    encode_request,
};
use crate::server::config::{DEFAULT_NAMESPACE, DEFAULT_PORT};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// 令牌服务端地址，`host:port`。
    pub server: String,
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub namespace: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: format!("127.0.0.1:{DEFAULT_PORT}"),
            request_timeout_ms: 200,
            connect_timeout_ms: 3000,
            namespace: DEFAULT_NAMESPACE.to_owned(),
        }
    }
}

impl ClientConfig {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            ..Self::default()
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

type Waiter = SyncSender<ClusterResponse<Bytes>>;

#[derive(Debug)]
struct Inner {
    next_id: AtomicI64,
    pending: DashMap<i64, Waiter>,
    outbound: mpsc::UnboundedSender<Bytes>,
    connected: AtomicBool,
}

impl Inner {
    fn close(&self) {
        self.connected.store(false, Ordering::Release);
        // 丢弃等待者即唤醒它们，等待方得到 `Closed`。
        self.pending.clear();
    }
}

/// 基于单条 TCP 长连接的令牌客户端。
#[derive(Debug)]
pub struct ClusterTokenClient {
    config: ClientConfig,
    local_addr: SocketAddr,
    inner: Arc<Inner>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl ClusterTokenClient {
    /// 建立连接，在 `runtime` 上启动读写任务，并发送 PING 声明命名空间。
    pub fn connect(config: ClientConfig, runtime: &Handle) -> Result<Self, ClientError> {
        let addr = config
            .server
            .to_socket_addrs()?
            .next()
            .ok_or(ClientError::NotConnected)?;
        let stream = std::net::TcpStream::connect_timeout(&addr, config.connect_timeout())?;
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;
        let local_addr = stream.local_addr()?;
        let stream = {
            let _guard = runtime.enter();
            TcpStream::from_std(stream)?
        };
        let (read_half, write_half) = stream.into_split();
        let (outbound, queue) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            next_id: AtomicI64::new(1),
            pending: DashMap::new(),
            outbound,
            connected: AtomicBool::new(true),
        });
        let writer = runtime.spawn(write_loop(write_half, queue, inner.clone()));
        let reader = runtime.spawn(read_loop(read_half, inner.clone()));
        let client = Self {
            config,
            local_addr,
            inner,
            reader,
            writer,
        };

        let connected = client.ping()?;
        info!(
            target: "spark.guard.cluster.client",
            server = %addr,
            namespace = %client.config.namespace,
            connected,
            "connected to token server"
        );
        Ok(client)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// 发送 PING，返回服务端报告的命名空间连接数。
    pub fn ping(&self) -> Result<i32, ClientError> {
        let response = self.call(RequestData::Ping {
            namespace: self.config.namespace.clone(),
        })?;
        match ResponseData::decode(response.msg_type, response.data)? {
            ResponseData::Ping { connected } => Ok(connected),
            _ => Ok(0),
        }
    }

    /// 发送一次请求并阻塞等待结果。
    pub fn request(&self, data: RequestData) -> Result<TokenResult, ClientError> {
        let response = self.call(data)?;
        let data = ResponseData::decode(response.msg_type, response.data)?;
        Ok(data.into_token_result(response.status))
    }

    fn call(&self, data: RequestData) -> Result<ClusterResponse<Bytes>, ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut frame = BytesMut::new();
        encode_request(&ClusterRequest::new(id, data), &mut frame)?;

        let (waiter, response) = sync_channel(1);
        self.inner.pending.insert(id, waiter);
        if self.inner.outbound.send(frame.freeze()).is_err() {
            self.inner.pending.remove(&id);
            return Err(ClientError::NotConnected);
        }
        match response.recv_timeout(self.config.request_timeout()) {
            Ok(response) => Ok(response),
            Err(RecvTimeoutError::Timeout) => {
                self.inner.pending.remove(&id);
                Err(ClientError::Timeout {
                    id,
                    timeout_ms: self.config.request_timeout_ms,
                })
            }
            Err(RecvTimeoutError::Disconnected) => Err(ClientError::Closed { id }),
        }
    }

    fn outcome(&self, op: &'static str, result: Result<TokenResult, ClientError>) -> TokenResult {
        result.unwrap_or_else(|err| {
            debug!(
                target: "spark.guard.cluster.client",
                op,
                code = err.code(),
                error = %err,
                "token request failed, caller applies fallback"
            );
            TokenResult::fail()
        })
    }
}

impl Drop for ClusterTokenClient {
    fn drop(&mut self) {
        self.inner.close();
        self.reader.abort();
        self.writer.abort();
    }
}

fn wire_count(count: u32) -> i32 {
    i32::try_from(count).unwrap_or(i32::MAX)
}

impl TokenService for ClusterTokenClient {
    fn request_token(&self, flow_id: i64, acquire_count: u32, prioritized: bool) -> TokenResult {
        let result = self.request(RequestData::Flow {
            flow_id,
            count: wire_count(acquire_count),
            prioritized,
        });
        self.outcome("flow", result)
    }

    fn batch_request_token(
        &self,
        flow_ids: &[i64],
        acquire_count: u32,
        prioritized: bool,
    ) -> TokenResult {
        let result = self.request(RequestData::BatchFlow {
            flow_ids: flow_ids.to_vec(),
            count: wire_count(acquire_count),
            prioritized,
        });
        self.outcome("batch_flow", result)
    }

    fn request_param_token(
        &self,
        flow_id: i64,
        acquire_count: u32,
        params: &[ParamValue],
    ) -> TokenResult {
        let result = self.request(RequestData::ParamFlow {
            flow_id,
            count: wire_count(acquire_count),
            params: params.to_vec(),
        });
        self.outcome("param_flow", result)
    }

    /// 服务端以连接的对端地址登记租约，`client_address` 仅用于本地日志。
    fn request_concurrent_token(
        &self,
        client_address: &str,
        flow_id: i64,
        acquire_count: u32,
    ) -> TokenResult {
        let result = self.request(RequestData::ConcurrentAcquire {
            flow_id,
            count: wire_count(acquire_count),
        });
        if let Err(err) = &result {
            debug!(
                target: "spark.guard.cluster.client",
                client_address,
                flow_id,
                code = err.code(),
                "concurrent token request failed"
            );
        }
        self.outcome("concurrent_acquire", result)
    }

    fn release_concurrent_token(&self, token_id: i64) -> TokenResult {
        let result = self.request(RequestData::ConcurrentRelease { token_id });
        self.outcome("concurrent_release", result)
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut queue: mpsc::UnboundedReceiver<Bytes>,
    inner: Arc<Inner>,
) {
    while let Some(frame) = queue.recv().await {
        if let Err(err) = writer.write_all(&frame).await {
            warn!(
                target: "spark.guard.cluster.client",
                error = %err,
                "write to token server failed"
            );
            break;
        }
    }
    inner.close();
}

async fn read_loop(mut reader: OwnedReadHalf, inner: Arc<Inner>) {
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        match read_frame(&mut reader, &mut buf, decode_response_frame).await {
            Ok(Some(response)) => match inner.pending.remove(&response.id) {
                Some((_, waiter)) => {
                    let _ = waiter.try_send(response);
                }
                None => debug!(
                    target: "spark.guard.cluster.client",
                    id = response.id,
                    "late response discarded"
                ),
            },
            Ok(None) => {
                info!(target: "spark.guard.cluster.client", "token server closed the connection");
                break;
            }
            Err(err) => {
                warn!(
                    target: "spark.guard.cluster.client",
                    error = %err,
                    "read from token server failed"
                );
                break;
            }
        }
    }
    inner.close();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_point_at_local_server() {
        let config = ClientConfig::default();
        assert_eq!(config.server, "127.0.0.1:18730");
        assert_eq!(config.namespace, "default");
        let parsed: ClientConfig = toml::from_str("server = \"10.0.0.1:9000\"\n").unwrap();
        assert_eq!(parsed.request_timeout_ms, 200);
        assert_eq!(parsed.server, "10.0.0.1:9000");
    }

    #[test]
    fn unreachable_server_fails_to_connect() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = ClientConfig {
            connect_timeout_ms: 200,
            ..ClientConfig::new(addr.to_string())
        };
        let err = ClusterTokenClient::connect(config, runtime.handle()).unwrap_err();
        assert_eq!(err.code(), "spark.guard.client.io");
    }
}
