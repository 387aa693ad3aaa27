//! 令牌服务端的 TCP 接入层。
//!
//! # 教案式注释
//!
//! ## 意图 (Why)
//! - 一个客户端进程只维持一条长连接，连接上的请求彼此独立，慢请求不应阻塞后续请求；
//! - 服务端需要可控的退出：收到停机信号后停止接入、结束连接读循环、停止租约回收。
//!
//! ## 逻辑 (How)
//! - 接入循环对每个连接派生一个任务；连接拆分为读半部与写半部：
//!   - 读循环逐帧解码，先过服务端限流，再为每个请求派生任务执行 [`dispatch`]；
//!   - 写任务从 `mpsc` 通道取出响应依次写出，因此响应顺序取决于请求完成顺序；
//! - 读循环以 `idle_seconds` 为单帧等待上限，超时即关闭空闲连接；
//! - 连接结束时注销命名空间成员并释放该客户端持有的全部租约。
//!
//! ## 契约 (What)
//! - 帧损坏（超长、头部截断）会关闭连接；载荷非法只回复 `BAD_REQUEST`；
//! - [`TokenServer::run`] 在 `shutdown` 变为 `true`（或发送端被丢弃）后返回。
//!
//! ## 风险 (Trade-offs)
//! - 每个请求一个任务，换取乱序完成能力；判定本身是纯内存计算，任务开销可以接受。

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use spark_guard_core::TokenResultStatus;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::config::ServerConfig;
use super::limiter::RequestLimiter;
use super::processor::{RequestContext, dispatch};
use super::token_service::DefaultTokenService;
use crate::protocol::codec::read_frame;
use crate::protocol::{ClusterResponse, ResponseData, decode_request_frame, encode_response};

const RESPONSE_QUEUE_DEPTH: usize = 1024;

#[derive(Debug)]
struct Shared {
    service: Arc<DefaultTokenService>,
    limiter: RequestLimiter,
    idle_timeout: Duration,
}

#[derive(Debug)]
pub struct TokenServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    reap_interval: Duration,
    shared: Arc<Shared>,
}

impl TokenServer {
    /// 绑定监听地址；规则与命名空间已由 `service` 持有。
    pub async fn bind(config: &ServerConfig, service: Arc<DefaultTokenService>) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind.as_str()).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            reap_interval: config.reap_interval(),
            shared: Arc::new(Shared {
                service,
                limiter: RequestLimiter::new(config.max_allowed_qps()),
                idle_timeout: config.idle_timeout(),
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn service(&self) -> &Arc<DefaultTokenService> {
        &self.shared.service
    }

    /// 运行接入循环直到收到停机信号。
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
        info!(
            target: "spark.guard.cluster.server",
            addr = %self.local_addr,
            max_qps = self.shared.limiter.max_qps().get(),
            "token server started"
        );
        let reaper = self
            .shared
            .service
            .leases()
            .clone()
            .spawn_reaper(self.reap_interval, shutdown.clone());

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let shared = self.shared.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(serve_connection(stream, peer, shared, shutdown));
                    }
                    Err(err) => {
                        warn!(
                            target: "spark.guard.cluster.server",
                            error = %err,
                            "failed to accept connection"
                        );
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        reaper.abort();
        info!(target: "spark.guard.cluster.server", addr = %self.local_addr, "token server stopped");
        Ok(())
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    let peer_label: Arc<str> = Arc::from(peer.to_string());
    info!(target: "spark.guard.cluster.server", peer = %peer_label, "client connected");
    if let Err(err) = stream.set_nodelay(true) {
        debug!(target: "spark.guard.cluster.server", error = %err, "set_nodelay failed");
    }
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<ClusterResponse<ResponseData>>(RESPONSE_QUEUE_DEPTH);

    let writer_peer = peer_label.clone();
    let writer_task = tokio::spawn(async move {
        let mut buf = BytesMut::with_capacity(256);
        while let Some(response) = rx.recv().await {
            buf.clear();
            if let Err(err) = encode_response(&response, &mut buf) {
                warn!(
                    target: "spark.guard.cluster.server",
                    peer = %writer_peer,
                    id = response.id,
                    code = err.code(),
                    "dropping response that cannot be encoded"
                );
                continue;
            }
            if let Err(err) = writer.write_all(&buf).await {
                debug!(
                    target: "spark.guard.cluster.server",
                    peer = %writer_peer,
                    error = %err,
                    "write failed, closing connection"
                );
                break;
            }
        }
    });

    let mut buf = BytesMut::with_capacity(4096);
    loop {
        let frame = tokio::select! {
            frame = tokio::time::timeout(
                shared.idle_timeout,
                read_frame(&mut reader, &mut buf, decode_request_frame),
            ) => frame,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };
        let request = match frame {
            Ok(Ok(Some(request))) => request,
            Ok(Ok(None)) => break,
            Ok(Err(err)) => {
                warn!(
                    target: "spark.guard.cluster.server",
                    peer = %peer_label,
                    error = %err,
                    "closing connection after read error"
                );
                break;
            }
            Err(_) => {
                info!(
                    target: "spark.guard.cluster.server",
                    peer = %peer_label,
                    idle_secs = shared.idle_timeout.as_secs(),
                    "closing idle connection"
                );
                break;
            }
        };

        if !shared.limiter.try_acquire() {
            let response = ClusterResponse::status_only(
                request.id,
                request.msg_type,
                TokenResultStatus::TooManyRequest,
            );
            if tx.send(response).await.is_err() {
                break;
            }
            continue;
        }

        let tx = tx.clone();
        let shared = shared.clone();
        let peer = peer_label.clone();
        tokio::spawn(async move {
            let ctx = RequestContext {
                service: &shared.service,
                peer: &peer,
            };
            let response = dispatch(&ctx, request);
            let _ = tx.send(response).await;
        });
    }

    drop(tx);
    let _ = writer_task.await;
    shared.service.disconnect(&peer_label);
    info!(target: "spark.guard.cluster.server", peer = %peer_label, "client disconnected");
}
