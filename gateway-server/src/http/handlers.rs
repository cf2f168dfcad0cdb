use crate::hub::{ClientConnection, Hub, HubSnapshot};
use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Serialize;

#[derive(Serialize)]
pub struct ApiResponse<T> {
    status: String,
    data: Option<T>,
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn success(data: T) -> Self {
        Self {
            status: "success".to_string(),
            data: Some(data),
            error: None,
        }
    }
}

/// 健康检查
pub async fn health_check() -> Json<ApiResponse<String>> {
    Json(ApiResponse::success("OK".to_string()))
}

/// 数据源、客户端和会话状态
pub async fn get_sources(
    State(hub): State<Hub>,
) -> Result<Json<ApiResponse<HubSnapshot>>, StatusCode> {
    match hub.snapshot().await {
        Some(snapshot) => Ok(Json(ApiResponse::success(snapshot))),
        None => Err(StatusCode::SERVICE_UNAVAILABLE),
    }
}

/// 升级为 WebSocket，连接交给 Hub
pub async fn ws_upgrade(ws: WebSocketUpgrade, State(hub): State<Hub>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ClientConnection::serve(socket, hub))
}
