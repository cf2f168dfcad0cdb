// 路由表
//
// 生产者上下文（中间件回调、编码输出读取任务）直接查表投递，不经过
// Hub 任务。每个数据源一条路由：订阅者的发送队列、会话入口、最近
// 一次 stream-meta。路由只由 Hub 任务增删和更新订阅者列表。
//
// 编码数据不经过节流：中途丢掉 H.264 数据会破坏解码状态，输出速率由
// 编码器的目标帧率决定。会话的发布带上会话 id，只有当前持有路由的会话
// 能投递，退出中的旧会话的残余输出直接丢弃。

use crate::hub::throttle::ThrottleGate;
use crate::hub::{self, FrameDisposition, Outbound};
use crate::streaming::session::SessionId;
use crate::streaming::SessionFeed;
use bytes::Bytes;
use common::{binary_frame_header, encode_binary_frame, ClientId, RawFormat, ServerMessage, SourceKey, StreamMeta};
use dashmap::try_result::TryResult;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{trace, warn};

/// 待投递的消息
#[derive(Debug, Clone)]
pub enum Payload {
    /// 普通数据（已序列化的文本帧）
    Data(Arc<str>),
    /// stream-meta（已序列化的文本帧），不节流
    Meta(Arc<str>),
}

impl Payload {
    pub fn data(value: Value) -> common::Result<Self> {
        Ok(Self::Data(ServerMessage::Data(value).to_text()?.into()))
    }

    pub fn meta(meta: &StreamMeta) -> common::Result<Self> {
        Ok(Self::Meta(ServerMessage::StreamMeta(meta.clone()).to_text()?.into()))
    }
}

pub type Subscriber = (ClientId, mpsc::Sender<Outbound>);

struct Route {
    /// 二进制帧头，创建路由时构造一次
    header: Bytes,
    subscribers: Vec<Subscriber>,
    feed: Option<SessionFeed>,
    /// 当前持有路由的会话
    session: Option<SessionId>,
    last_meta: Option<Arc<str>>,
}

impl Route {
    fn owned_by(&self, session: SessionId) -> bool {
        self.session == Some(session)
    }
}

/// 数据源路由表
#[derive(Clone)]
pub struct Router {
    routes: Arc<DashMap<SourceKey, Route>>,
    gate: Arc<ThrottleGate>,
}

impl Router {
    pub fn new(gate: Arc<ThrottleGate>) -> Self {
        Self {
            routes: Arc::new(DashMap::new()),
            gate,
        }
    }

    pub fn gate(&self) -> &ThrottleGate {
        &self.gate
    }

    /// 创建路由；键不能编码进二进制帧头时返回 false
    pub fn open(&self, key: &SourceKey) -> bool {
        if self.routes.contains_key(key) {
            return true;
        }
        match binary_frame_header(key) {
            Ok(header) => {
                self.routes.insert(
                    key.clone(),
                    Route {
                        header,
                        subscribers: Vec::new(),
                        feed: None,
                        session: None,
                        last_meta: None,
                    },
                );
                true
            }
            Err(e) => {
                warn!("Cannot route source {}: {}", key, e);
                false
            }
        }
    }

    /// 删除路由，之后不再投递任何数据
    pub fn close(&self, key: &str) {
        self.routes.remove(key);
    }

    pub fn is_open(&self, key: &str) -> bool {
        self.routes.contains_key(key)
    }

    /// 替换订阅者列表；新加入的订阅者立即收到最近的 stream-meta
    pub fn set_subscribers(&self, key: &str, subscribers: Vec<Subscriber>) {
        let Some(mut route) = self.routes.get_mut(key) else {
            return;
        };
        if let Some(meta) = route.last_meta.clone() {
            for (client, sender) in &subscribers {
                let known = route.subscribers.iter().any(|(c, _)| c == client);
                if !known {
                    let _ = sender.try_send(Outbound::Text(meta.clone()));
                }
            }
        }
        route.subscribers = subscribers;
    }

    /// 会话接管路由，之前会话的发布和 stream-meta 全部作废
    pub fn claim(&self, key: &str, session: SessionId) -> bool {
        match self.routes.get_mut(key) {
            Some(mut route) => {
                route.session = Some(session);
                route.last_meta = None;
                true
            }
            None => false,
        }
    }

    pub fn attach_feed(&self, key: &str, feed: SessionFeed) {
        if let Some(mut route) = self.routes.get_mut(key) {
            route.feed = Some(feed);
        }
    }

    /// 生产者送来一帧
    ///
    /// 路由正被 Hub 修改时不等待，直接丢弃；没有订阅者时不复制数据。
    pub fn offer_frame(&self, key: &str, now: Instant, format: Option<RawFormat>, data: &[u8]) -> FrameDisposition {
        match self.routes.try_get_mut(key) {
            TryResult::Present(mut route) => {
                if route.subscribers.is_empty() {
                    return FrameDisposition::NoSubscribers;
                }
                match route.feed.as_mut() {
                    Some(feed) => feed.offer(now, format, data),
                    None => FrameDisposition::NoSubscribers,
                }
            }
            TryResult::Absent => FrameDisposition::NoSubscribers,
            TryResult::Locked => FrameDisposition::Busy,
        }
    }

    /// 向数据源的订阅者投递，返回实际入队的客户端数
    pub fn publish(&self, key: &str, payload: Payload) -> usize {
        self.dispatch(key, None, payload)
    }

    /// 会话发布；该会话已不持有路由时丢弃
    pub fn publish_from(&self, key: &str, session: SessionId, payload: Payload) -> usize {
        self.dispatch(key, Some(session), payload)
    }

    fn dispatch(&self, key: &str, session: Option<SessionId>, payload: Payload) -> usize {
        match payload {
            Payload::Meta(text) => {
                let Some(mut route) = self.routes.get_mut(key) else {
                    return 0;
                };
                if session.is_some_and(|s| !route.owned_by(s)) {
                    return 0;
                }
                route.last_meta = Some(text.clone());
                route
                    .subscribers
                    .iter()
                    .filter(|(_, sender)| sender.try_send(Outbound::Text(text.clone())).is_ok())
                    .count()
            }
            Payload::Data(text) => {
                let Some(route) = self.routes.get(key) else {
                    return 0;
                };
                if session.is_some_and(|s| !route.owned_by(s)) {
                    return 0;
                }
                let now = hub::now();
                route
                    .subscribers
                    .iter()
                    .filter(|(client, _)| self.gate.admit(*client, key, now))
                    .filter(|(client, sender)| deliver(key, *client, sender, Outbound::Text(text.clone())))
                    .count()
            }
        }
    }

    /// 投递一段编码数据，不节流；帧只拼接一次，所有订阅者共享
    pub fn publish_codec(&self, key: &str, session: SessionId, chunk: &[u8]) -> usize {
        let Some(route) = self.routes.get(key) else {
            return 0;
        };
        if !route.owned_by(session) || route.subscribers.is_empty() {
            return 0;
        }
        let frame = encode_binary_frame(&route.header, chunk);
        route
            .subscribers
            .iter()
            .filter(|(client, sender)| deliver(key, *client, sender, Outbound::Binary(frame.clone())))
            .count()
    }

    /// 当前订阅者数；路由正被修改时按 0 处理
    pub fn client_count(&self, key: &str) -> usize {
        match self.routes.try_get(key) {
            TryResult::Present(route) => route.subscribers.len(),
            _ => 0,
        }
    }

    pub fn last_meta(&self, key: &str) -> Option<Arc<str>> {
        self.routes.get(key).and_then(|route| route.last_meta.clone())
    }
}

/// 非阻塞入队；队列满时丢弃
fn deliver(key: &str, client: ClientId, sender: &mpsc::Sender<Outbound>, message: Outbound) -> bool {
    match sender.try_send(message) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            trace!("Client {} queue full, dropping {} payload", client, key);
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}
