// 客户端连接
//
// 每个 WebSocket 一个任务：读取控制消息转成 HubCommand，把出站队列
// 里的消息写回 socket。订阅快照由连接自己维护，Hub 对账时读取。

use crate::hub::{self, ClientSubscriptions, Hub, HubCommand, Outbound, SubscriptionParams};
use crate::latency::LatencyTracker;
use crate::streaming;
use axum::extract::ws::{Message, WebSocket};
use common::{ClientId, ClientMessage, ServerMessage};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct ClientConnection {
    id: ClientId,
    hub: Hub,
    latency: LatencyTracker,
    subscriptions: watch::Sender<ClientSubscriptions>,
}

impl ClientConnection {
    /// 向 Hub 注册，返回连接和它的出站队列
    pub fn register(hub: Hub) -> Option<(Self, mpsc::Receiver<Outbound>)> {
        let id = Uuid::new_v4();
        let (outbound_tx, outbound_rx) = mpsc::channel(hub.client_queue_depth().max(1));
        let (subscriptions_tx, subscriptions_rx) = watch::channel(ClientSubscriptions::new());
        let registered = hub.send(HubCommand::Connect {
            client: id,
            outbound: outbound_tx,
            subscriptions: subscriptions_rx,
        });
        if !registered {
            warn!("Hub is not running, rejecting client");
            return None;
        }
        let connection = Self {
            id,
            hub,
            latency: LatencyTracker::new(),
            subscriptions: subscriptions_tx,
        };
        Some((connection, outbound_rx))
    }

    /// 处理一个 WebSocket 直到任一方关闭
    pub async fn serve(mut socket: WebSocket, hub: Hub) {
        let Some((mut connection, mut outbound)) = Self::register(hub) else {
            return;
        };
        info!("WebSocket client {} connected", connection.id);

        loop {
            tokio::select! {
                message = outbound.recv() => {
                    // Hub 已关闭
                    let Some(message) = message else { break };
                    let Some(message) = connection.render(message) else { continue };
                    if socket.send(message).await.is_err() {
                        break;
                    }
                }
                incoming = socket.recv() => match incoming {
                    Some(Ok(Message::Text(text))) => connection.on_text(&text),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("WebSocket client {} error: {}", connection.id, e);
                        break;
                    }
                },
            }
        }

        connection.hub.send(HubCommand::Disconnect {
            client: connection.id,
        });
        info!(
            "WebSocket client {} closed (latency: {:?})",
            connection.id,
            connection.latency.stats().average_rtt_ms()
        );
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// 出站消息转换为 WebSocket 帧
    fn render(&mut self, message: Outbound) -> Option<Message> {
        match message {
            Outbound::Text(text) => Some(Message::Text(text.to_string())),
            Outbound::Binary(frame) => Some(Message::Binary(frame.to_vec())),
            Outbound::Ping => self.ping_text().map(Message::Text),
        }
    }

    fn ping_text(&mut self) -> Option<String> {
        let token = self.latency.next_ping(hub::now());
        let ping = ServerMessage::Ping {
            token,
            latency_ms: self.latency.one_way_ms(),
        };
        match ping.to_text() {
            Ok(text) => Some(text),
            Err(e) => {
                warn!("Failed to encode ping: {}", e);
                None
            }
        }
    }

    /// 处理一条文本消息；格式错误只丢弃这一条
    pub fn on_text(&mut self, text: &str) {
        let message = match ClientMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping malformed message from {}: {}", self.id, e);
                return;
            }
        };

        match message {
            ClientMessage::Pong { token } => {
                if let Some(rtt) = self.latency.on_pong(token, hub::now()) {
                    self.hub.send(HubCommand::Latency {
                        client: self.id,
                        rtt,
                    });
                }
            }
            ClientMessage::Subscribe {
                source,
                max_update_rate,
            } => {
                let params = SubscriptionParams { max_update_rate };
                self.subscriptions.send_modify(|subscriptions| {
                    subscriptions.insert(source.clone(), params);
                });
                self.hub.send(HubCommand::Subscribe {
                    client: self.id,
                    source,
                    params,
                });
            }
            ClientMessage::Unsubscribe { source } => {
                self.subscriptions.send_modify(|subscriptions| {
                    subscriptions.remove(&source);
                });
                self.hub.send(HubCommand::Unsubscribe {
                    client: self.id,
                    source,
                });
            }
            ClientMessage::StreamSettings {
                source,
                fps,
                quality,
            } => {
                self.hub.send(HubCommand::StreamSettings {
                    client: self.id,
                    source,
                    settings: streaming::StreamSettings { fps, quality },
                });
            }
        }
    }

    pub fn subscriptions(&self) -> ClientSubscriptions {
        self.subscriptions.borrow().clone()
    }
}
