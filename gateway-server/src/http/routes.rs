use crate::hub::Hub;
use axum::{routing::get, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub fn create_router(hub: Hub) -> Router {
    Router::new()
        // 浏览器连接
        .route("/ws", get(super::handlers::ws_upgrade))
        // 运行状态
        .route("/api/v1/sources", get(super::handlers::get_sources))
        // 健康检查
        .route("/health", get(super::handlers::health_check))
        .with_state(hub)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
