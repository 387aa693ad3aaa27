//! 独立部署的集群令牌服务端。
//!
//! ```text
//! spark-guard-token-server --config token-server.toml
//! ```
//!
//! 日志级别由 `RUST_LOG` 控制，缺省为 `info`；Ctrl-C 触发优雅停机。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use spark_guard_cluster::{DefaultTokenService, ServerConfig, TokenServer};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "spark-guard-token-server", version, about = "spark-guard 集群令牌服务端")]
struct Args {
    /// TOML 配置文件路径；缺省时使用内置默认配置（无规则）。
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 覆盖配置中的监听地址。
    #[arg(long)]
    bind: Option<String>,
}

fn build_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(build_env_filter())
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .context("failed to install tracing subscriber")?;

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => ServerConfig::from_path(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => ServerConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.bind = bind;
    }

    let service = Arc::new(
        DefaultTokenService::from_config(&config).context("invalid cluster rules in config")?,
    );
    let server = TokenServer::bind(&config, service)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;

    let (shutdown, signal) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!(target: "spark.guard.cluster.server", "shutdown signal received"),
            Err(err) => warn!(
                target: "spark.guard.cluster.server",
                error = %err,
                "cannot listen for shutdown signal, stopping"
            ),
        }
        let _ = shutdown.send(true);
    });

    server.run(signal).await.context("token server failed")?;
    Ok(())
}
