use crate::hub::Hub;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// WebSocket 与状态接口服务器
pub struct HttpServer {
    addr: SocketAddr,
    hub: Hub,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, hub: Hub) -> Self {
        Self { addr, hub }
    }

    /// 运行直到 `shutdown` 被取消；已建立的 WebSocket 随 Hub 关闭而结束
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let app = super::routes::create_router(self.hub);

        let listener = tokio::net::TcpListener::bind(self.addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.addr))?;
        info!("HTTP server running on {}", self.addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("HTTP server stopped");
        Ok(())
    }
}
