mod catalog;
mod config;
mod encoder;
mod http;
mod hub;
mod latency;
mod streaming;

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // 日志级别要从配置里取，先加载配置
    let config = config::Config::load()?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    info!("Gateway server starting...");
    info!("✓ Configuration loaded");

    // 探测编码器
    let runner: Arc<dyn encoder::ProbeRunner> = Arc::new(encoder::CommandProbeRunner);
    let caps = encoder::CapabilityProbe::new(runner.clone(), config.probe_timeout())
        .run()
        .await;
    info!("✓ Encoder probe finished");

    // 摄像头
    let cameras = catalog::camera::load_cameras(
        &config.cameras_file,
        config.discover_v4l2,
        runner.as_ref(),
        config.probe_timeout(),
    )
    .await;
    let catalog = catalog::SourceCatalog::new(catalog::camera::assign_keys(cameras));

    let bus: Arc<dyn catalog::TopicBus> = Arc::new(catalog::NullTopicBus);
    let (hub, hub_task) = hub::Hub::start(
        hub::HubSettings::from_config(&config),
        Arc::new(caps),
        Arc::new(streaming::CommandSpawner),
        bus.clone(),
        catalog,
    );
    info!("✓ Hub started");

    let cancel = CancellationToken::new();
    let ping_task = hub.spawn_ping_loop(config.ping_interval(), cancel.clone());
    let reconcile_task = hub.spawn_reconcile_loop(bus, config.reconcile_interval(), cancel.clone());

    let addr: SocketAddr = config
        .bind_addr()
        .parse()
        .with_context(|| format!("Invalid listen address {}", config.bind_addr()))?;
    let server = http::HttpServer::new(addr, hub.clone());
    let mut server_task = tokio::spawn(server.run(cancel.clone()));

    info!("✅ Gateway server ready on {}", addr);

    let finished = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received");
            None
        }
        // 监听失败等情况下服务器提前退出
        result = &mut server_task => Some(result),
    };

    cancel.cancel();
    // 先停会话（子进程），WebSocket 连接随出站队列关闭而结束
    hub.shutdown().await;
    let _ = tokio::join!(ping_task, reconcile_task, hub_task);
    let result = match finished {
        Some(result) => result,
        None => server_task.await,
    };
    match result {
        Ok(Err(e)) => error!("HTTP server error: {:#}", e),
        Err(e) => error!("HTTP server task failed: {}", e),
        Ok(Ok(())) => {}
    }

    info!("Gateway server stopped");
    Ok(())
}
