// 广播中心
//
// 单写者 actor：订阅注册表、数据源目录、客户端列表和活跃会话只由
// Hub 任务修改，其他上下文一律发送 HubCommand。数据本身不经过 Hub
// 任务，由生产者直接查 Router 投递。
//
// 周期任务：
// - ping：每个连接发一次 ping，用于测量延迟
// - 对账：从各连接的订阅快照重建注册表，刷新话题列表，修正会话状态

pub mod connection;
pub mod registry;
pub mod router;
pub mod throttle;

pub use connection::ClientConnection;
pub use registry::{ClientSubscriptions, ReconcileReport, SubscriptionParams, SubscriptionRegistry, Transition};
pub use router::{Payload, Router};
pub use throttle::ThrottleGate;

use crate::catalog::topic::match_publishers;
use crate::catalog::{SourceCatalog, SourceKind, SourceSink, TopicBus, TopicClass, UpstreamSubscription};
use crate::config::Config;
use crate::encoder::EncoderCapabilities;
use crate::streaming::session::SessionStatsSnapshot;
use crate::streaming::{
    ErrorRecoveryPolicy, ProcessSpawner, SessionConfig, SessionContext, SessionEvent, SessionHandle,
    SessionKind, SessionState, StreamSession, StreamSettings,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use common::{ClientId, ServerMessage, SourceInfo, SourceKey};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 当前时间
///
/// 经由 tokio 时钟取得，测试中暂停时间后节流和帧率检测同样受控。
pub fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// 发往单个客户端连接的消息
#[derive(Debug, Clone)]
pub enum Outbound {
    /// 已序列化的文本帧
    Text(Arc<str>),
    /// 已加帧头的二进制帧
    Binary(Bytes),
    /// 由连接自己生成 token 并发送 ping
    Ping,
}

/// 生产者送入一帧后的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameDisposition {
    /// 已入队，会话会处理
    Accepted,
    /// 没有订阅者（未复制）
    NoSubscribers,
    /// 路由正被修改（未复制）
    Busy,
    /// 超出目标帧率（未复制）
    Throttled,
    /// 会话队列已满（未复制）
    QueueFull,
    /// 会话已结束
    Closed,
}

#[derive(Debug)]
pub enum HubCommand {
    Connect {
        client: ClientId,
        outbound: mpsc::Sender<Outbound>,
        /// 连接维护的订阅快照，对账时作为权威来源
        subscriptions: watch::Receiver<ClientSubscriptions>,
    },
    Disconnect {
        client: ClientId,
    },
    Subscribe {
        client: ClientId,
        source: SourceKey,
        params: SubscriptionParams,
    },
    Unsubscribe {
        client: ClientId,
        source: SourceKey,
    },
    StreamSettings {
        client: ClientId,
        source: SourceKey,
        settings: StreamSettings,
    },
    Latency {
        client: ClientId,
        rtt: Duration,
    },
    Ping,
    /// `topics` 为最新话题列表；None 表示本轮没有取到
    Reconcile {
        topics: Option<BTreeMap<String, String>>,
    },
    Snapshot(oneshot::Sender<HubSnapshot>),
    Shutdown(oneshot::Sender<()>),
}

/// Hub 运行参数
#[derive(Debug, Clone)]
pub struct HubSettings {
    /// system 消息中的 hostname
    pub title: String,
    pub version: String,
    pub default_max_update_rate: f64,
    pub client_queue_depth: usize,
    pub session: SessionConfig,
    /// 关闭时等待会话退出的时间
    pub shutdown_timeout: Duration,
}

impl HubSettings {
    pub fn from_config(config: &Config) -> Self {
        let grace = config.termination_grace();
        Self {
            title: config.title.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            default_max_update_rate: config.default_max_update_rate,
            client_queue_depth: config.client_queue_depth,
            session: SessionConfig {
                default_fps: config.default_fps,
                termination_grace: grace,
                recovery: ErrorRecoveryPolicy::for_restarts(
                    config.max_restart_attempts,
                    config.restart_cooldown(),
                ),
                ..SessionConfig::default()
            },
            shutdown_timeout: grace + Duration::from_secs(1),
        }
    }
}

impl Default for HubSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// 运行状态快照（HTTP 接口使用）
#[derive(Debug, Clone, Serialize)]
pub struct HubSnapshot {
    pub clients: Vec<ClientStatus>,
    pub sources: Vec<SourceStatus>,
    pub draining_sessions: usize,
    pub encoders: EncoderCapabilities,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientStatus {
    pub id: ClientId,
    pub connected_at: DateTime<Utc>,
    pub subscriptions: Vec<SourceKey>,
    pub rtt_ms: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub key: SourceKey,
    pub info: SourceInfo,
    pub available: bool,
    pub client_count: usize,
    pub failure: Option<String>,
    pub session: Option<SessionState>,
    pub stats: Option<SessionStatsSnapshot>,
}

/// Hub 句柄，可任意克隆
#[derive(Clone)]
pub struct Hub {
    commands: mpsc::UnboundedSender<HubCommand>,
    router: Router,
    sources: watch::Receiver<Arc<BTreeMap<SourceKey, SourceInfo>>>,
    client_queue_depth: usize,
}

impl Hub {
    /// 启动 Hub 任务
    pub fn start(
        settings: HubSettings,
        caps: Arc<EncoderCapabilities>,
        spawner: Arc<dyn ProcessSpawner>,
        bus: Arc<dyn TopicBus>,
        catalog: SourceCatalog,
    ) -> (Self, JoinHandle<()>) {
        let gate = Arc::new(ThrottleGate::new(settings.default_max_update_rate));
        let router = Router::new(gate);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (sources_tx, sources_rx) = watch::channel(Arc::new(catalog.source_list()));

        let ctx = SessionContext {
            caps,
            spawner,
            router: router.clone(),
            events: events_tx,
            config: settings.session.clone(),
        };
        let hub = Hub {
            commands: commands_tx,
            router: router.clone(),
            sources: sources_rx,
            client_queue_depth: settings.client_queue_depth,
        };
        let actor = HubActor {
            settings,
            catalog,
            registry: SubscriptionRegistry::new(),
            router,
            bus,
            ctx,
            clients: HashMap::new(),
            active: HashMap::new(),
            draining: Vec::new(),
            stream_settings: HashMap::new(),
            sources: sources_tx,
        };
        let task = tokio::spawn(actor.run(commands_rx, events_rx));
        (hub, task)
    }

    /// 发送命令；Hub 已停止时返回 false
    pub fn send(&self, command: HubCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn client_queue_depth(&self) -> usize {
        self.client_queue_depth
    }

    /// 数据源当前是否出现在 source-list 中
    pub fn source_available(&self, key: &str) -> bool {
        self.sources.borrow().contains_key(key)
    }

    /// 外部送入已编码的数据
    pub fn source_data(&self, key: &str, data: &[u8]) -> FrameDisposition {
        self.router.offer_frame(key, now(), None, data)
    }

    pub fn client_count(&self, key: &str) -> usize {
        self.router.client_count(key)
    }

    pub fn source_list(&self) -> Arc<BTreeMap<SourceKey, SourceInfo>> {
        self.sources.borrow().clone()
    }

    pub async fn snapshot(&self) -> Option<HubSnapshot> {
        let (tx, rx) = oneshot::channel();
        if !self.send(HubCommand::Snapshot(tx)) {
            return None;
        }
        rx.await.ok()
    }

    /// 停止所有会话并结束 Hub 任务
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.send(HubCommand::Shutdown(tx)) {
            let _ = rx.await;
        }
    }

    pub fn spawn_ping_loop(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if !hub.send(HubCommand::Ping) {
                            break;
                        }
                    }
                }
            }
            debug!("Ping loop stopped");
        })
    }

    /// 周期对账；话题列表在阻塞线程中获取
    pub fn spawn_reconcile_loop(
        &self,
        bus: Arc<dyn TopicBus>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let bus = bus.clone();
                        let topics = match tokio::task::spawn_blocking(move || bus.topics()).await {
                            Ok(topics) => Some(topics),
                            Err(e) => {
                                warn!("Topic discovery failed: {}", e);
                                None
                            }
                        };
                        if !hub.send(HubCommand::Reconcile { topics }) {
                            break;
                        }
                    }
                }
            }
            debug!("Reconcile loop stopped");
        })
    }
}

struct ClientEntry {
    outbound: mpsc::Sender<Outbound>,
    subscriptions: watch::Receiver<ClientSubscriptions>,
    rtt: Option<Duration>,
    connected_at: DateTime<Utc>,
}

/// 有订阅者的数据源
struct ActiveSource {
    session: Option<SessionHandle>,
    upstream: Option<Box<dyn UpstreamSubscription>>,
}

struct HubActor {
    settings: HubSettings,
    catalog: SourceCatalog,
    registry: SubscriptionRegistry,
    router: Router,
    bus: Arc<dyn TopicBus>,
    ctx: SessionContext,
    clients: HashMap<ClientId, ClientEntry>,
    active: HashMap<SourceKey, ActiveSource>,
    /// 已请求停止、子进程可能仍在退出的会话
    draining: Vec<SessionHandle>,
    /// 每个数据源最后一次收到的编码参数
    stream_settings: HashMap<SourceKey, StreamSettings>,
    sources: watch::Sender<Arc<BTreeMap<SourceKey, SourceInfo>>>,
}

impl HubActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<HubCommand>,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        info!("Hub started with {} sources", self.catalog.source_list().len());
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(HubCommand::Shutdown(done)) => {
                        self.shutdown().await;
                        let _ = done.send(());
                        break;
                    }
                    Some(command) => self.handle(command),
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(event) = events.recv() => self.on_session_event(event),
            }
        }
        info!("Hub stopped");
    }

    fn handle(&mut self, command: HubCommand) {
        match command {
            HubCommand::Connect {
                client,
                outbound,
                subscriptions,
            } => self.on_connect(client, outbound, subscriptions),
            HubCommand::Disconnect { client } => self.on_disconnect(client),
            HubCommand::Subscribe {
                client,
                source,
                params,
            } => self.on_subscribe(client, source, params),
            HubCommand::Unsubscribe { client, source } => self.on_unsubscribe(client, &source),
            HubCommand::StreamSettings {
                client,
                source,
                settings,
            } => self.on_stream_settings(client, source, settings),
            HubCommand::Latency { client, rtt } => {
                if let Some(entry) = self.clients.get_mut(&client) {
                    entry.rtt = Some(rtt);
                }
            }
            HubCommand::Ping => {
                for entry in self.clients.values() {
                    let _ = entry.outbound.try_send(Outbound::Ping);
                }
            }
            HubCommand::Reconcile { topics } => self.reconcile(topics),
            HubCommand::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            // 在 run 中处理
            HubCommand::Shutdown(_) => {}
        }
    }

    fn on_connect(
        &mut self,
        client: ClientId,
        outbound: mpsc::Sender<Outbound>,
        subscriptions: watch::Receiver<ClientSubscriptions>,
    ) {
        let hello = ServerMessage::System {
            hostname: self.settings.title.clone(),
            version: self.settings.version.clone(),
        };
        send_message(&outbound, &hello);
        send_message(&outbound, &ServerMessage::SourceList(self.catalog.source_list()));

        self.clients.insert(
            client,
            ClientEntry {
                outbound,
                subscriptions,
                rtt: None,
                connected_at: Utc::now(),
            },
        );
        info!("Client {} connected ({} total)", client, self.clients.len());
    }

    fn on_disconnect(&mut self, client: ClientId) {
        let known = self.clients.remove(&client).is_some();

        let touched: Vec<SourceKey> = self
            .registry
            .entries_for(client)
            .map(|subscriptions| subscriptions.keys().cloned().collect())
            .unwrap_or_default();
        let deactivated = self.registry.on_client_disconnect(client);
        for key in &deactivated {
            self.deactivate(key);
        }
        for key in touched.iter().filter(|key| !deactivated.contains(key)) {
            self.sync_route(key);
        }
        // 路由里已没有该客户端，之后不会再有发布触及它的节流记录
        self.router.gate().remove_client(client);

        if known {
            info!("Client {} disconnected ({} remaining)", client, self.clients.len());
        }
    }

    fn on_subscribe(&mut self, client: ClientId, source: SourceKey, params: SubscriptionParams) {
        if !self.clients.contains_key(&client) {
            return;
        }
        if !self.catalog.contains(&source) {
            debug!("Client {} subscribed to unknown source {}", client, source);
            return;
        }

        self.registry.subscribe(client, source.clone(), params);
        self.router
            .gate()
            .set_rate(client, &source, params.max_update_rate);

        if !self.active.contains_key(&source) {
            let was_failed = self.catalog.is_failed(&source);
            if !self.catalog.allow_retry(&source) {
                debug!("Source {} is permanently unavailable", source);
                return;
            }
            if was_failed {
                self.publish_source_list();
            }
            self.activate(&source);
        }
        self.sync_route(&source);
        debug!(
            "Client {} subscribed to {} at {} Hz",
            client, source, params.max_update_rate
        );
    }

    fn on_unsubscribe(&mut self, client: ClientId, source: &SourceKey) {
        match self.registry.unsubscribe(client, source) {
            Transition::Deactivated => self.deactivate(source),
            _ => self.sync_route(source),
        }
        self.router.gate().remove(client, source);
        debug!("Client {} unsubscribed from {}", client, source);
    }

    /// 同一数据源只有一个编码器，后到的设置覆盖之前的
    fn on_stream_settings(&mut self, client: ClientId, source: SourceKey, settings: StreamSettings) {
        if self.registry.params(client, &source).is_none() {
            debug!("Ignoring stream settings for {} from non-subscriber {}", source, client);
            return;
        }
        if let Some(session) = self
            .active
            .get(&source)
            .and_then(|active| active.session.as_ref())
        {
            session.update_settings(settings);
        }
        self.stream_settings.insert(source, settings);
    }

    fn on_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Failed {
                source,
                session,
                error,
            } => {
                let current = self
                    .active
                    .get(&source)
                    .and_then(|active| active.session.as_ref())
                    .map(SessionHandle::id);
                if current != Some(session) {
                    debug!("Ignoring failure of stale session {} for {}", session, source);
                    return;
                }
                self.catalog.mark_failed(&source, &error);
                self.deactivate(&source);
                self.publish_source_list();
            }
        }
    }

    /// 创建路由、会话和上游订阅
    fn activate(&mut self, key: &SourceKey) {
        let Some(descriptor) = self.catalog.descriptor(key) else {
            return;
        };
        if !self.router.open(key) {
            return;
        }

        let session_kind = match &descriptor.kind {
            SourceKind::Topic {
                class: TopicClass::RawVideo,
                ..
            } => Some(SessionKind::RawFrames),
            SourceKind::Topic {
                class: TopicClass::EncodedVideo,
                ..
            } => Some(SessionKind::Relay),
            SourceKind::Topic {
                class: TopicClass::Data,
                ..
            } => None,
            SourceKind::Camera(camera) => Some(SessionKind::Camera(camera.clone())),
        };

        let mut session = None;
        if let Some(kind) = session_kind {
            if let Err(error) = kind.check_capabilities(&self.ctx.caps) {
                self.router.close(key);
                self.catalog.mark_failed(key, &error);
                self.publish_source_list();
                return;
            }
            // 同一数据源的旧会话退出后新会话才会启动子进程
            let predecessor = self
                .draining
                .iter()
                .rev()
                .find(|handle| handle.source() == key && !handle.state().is_terminal())
                .map(SessionHandle::watch_state);
            let settings = self.stream_settings.get(key).copied().unwrap_or_default();
            let (handle, feed) =
                StreamSession::spawn(key.clone(), kind, settings, self.ctx.clone(), predecessor);
            self.router.attach_feed(key, feed);
            info!("Started stream session {} for {}", handle.id(), key);
            session = Some(handle);
        }

        let upstream = match &descriptor.kind {
            SourceKind::Topic { type_name, .. } => {
                let qos = match_publishers(&self.bus.publisher_qos(key));
                let sink = SourceSink::new(key.clone(), type_name.clone(), self.router.clone());
                match self.bus.subscribe(key, type_name, qos, sink) {
                    Ok(subscription) => Some(subscription),
                    Err(e) => {
                        warn!("Failed to subscribe to topic {}: {}", key, e);
                        None
                    }
                }
            }
            SourceKind::Camera(_) => None,
        };

        self.active
            .insert(key.clone(), ActiveSource { session, upstream });
    }

    /// 立即停止路由，会话异步退出
    fn deactivate(&mut self, key: &str) {
        self.router.close(key);
        let Some(active) = self.active.remove(key) else {
            return;
        };
        if let Some(upstream) = active.upstream {
            upstream.cancel();
        }
        if let Some(session) = active.session {
            session.stop();
            info!("Draining stream session {} for {}", session.id(), key);
            self.draining.push(session);
        }
    }

    fn sync_route(&self, key: &str) {
        if !self.router.is_open(key) {
            return;
        }
        let subscribers = self
            .registry
            .interested(key)
            .into_iter()
            .filter_map(|client| {
                self.clients
                    .get(&client)
                    .map(|entry| (client, entry.outbound.clone()))
            })
            .collect();
        self.router.set_subscribers(key, subscribers);
    }

    fn reconcile(&mut self, topics: Option<BTreeMap<String, String>>) {
        // 连接任务已经退出但 Disconnect 丢失
        let closed: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|(_, entry)| entry.outbound.is_closed())
            .map(|(client, _)| *client)
            .collect();
        for client in closed {
            debug!("Removing closed client {}", client);
            self.on_disconnect(client);
        }

        if let Some(topics) = topics {
            self.catalog.update_topics(topics);
        }

        let desired: HashMap<ClientId, ClientSubscriptions> = self
            .clients
            .iter()
            .map(|(client, entry)| {
                let subscriptions: ClientSubscriptions = entry
                    .subscriptions
                    .borrow()
                    .iter()
                    .filter(|(key, _)| self.catalog.contains(key))
                    .map(|(key, params)| (key.clone(), *params))
                    .collect();
                (*client, subscriptions)
            })
            .collect();
        let report = self.registry.reconcile(&desired);
        if !report.is_clean() {
            debug!(
                "Reconciliation corrected drift: {} added, {} removed, {} updated",
                report.added, report.removed, report.updated
            );
        }
        for (client, subscriptions) in &desired {
            for (source, params) in subscriptions {
                self.router
                    .gate()
                    .set_rate(*client, source, params.max_update_rate);
            }
        }

        // 会话任务结束但没有上报失败（失败由事件处理）
        let ended: Vec<SourceKey> = self
            .active
            .iter()
            .filter(|(_, active)| {
                active
                    .session
                    .as_ref()
                    .is_some_and(|s| s.is_finished() && s.state() != SessionState::Failed)
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in &ended {
            warn!("Stream session for {} ended unexpectedly", key);
            self.deactivate(key);
        }

        let wanted: Vec<SourceKey> = self
            .registry
            .active_sources()
            .filter(|key| self.catalog.is_available(key))
            .cloned()
            .collect();
        for key in &wanted {
            if !self.active.contains_key(key) {
                self.activate(key);
            }
        }
        let stale: Vec<SourceKey> = self
            .active
            .keys()
            .filter(|key| !wanted.contains(key))
            .cloned()
            .collect();
        for key in &stale {
            debug!("Stopping unreferenced source {}", key);
            self.deactivate(key);
        }

        let keys: Vec<SourceKey> = self.active.keys().cloned().collect();
        for key in &keys {
            self.sync_route(key);
        }
        self.draining.retain(|session| !session.is_finished());
        self.publish_source_list();
    }

    fn publish_source_list(&self) {
        let list = self.catalog.source_list();
        match ServerMessage::SourceList(list.clone()).to_text() {
            Ok(text) => {
                let text: Arc<str> = text.into();
                for entry in self.clients.values() {
                    let _ = entry.outbound.try_send(Outbound::Text(text.clone()));
                }
            }
            Err(e) => warn!("Failed to encode source list: {}", e),
        }
        self.sources.send_replace(Arc::new(list));
    }

    fn snapshot(&self) -> HubSnapshot {
        let clients = self
            .clients
            .iter()
            .map(|(id, entry)| {
                let mut subscriptions: Vec<SourceKey> = self
                    .registry
                    .entries_for(*id)
                    .map(|s| s.keys().cloned().collect())
                    .unwrap_or_default();
                subscriptions.sort();
                ClientStatus {
                    id: *id,
                    connected_at: entry.connected_at,
                    subscriptions,
                    rtt_ms: entry.rtt.map(|rtt| rtt.as_secs_f64() * 1000.0),
                }
            })
            .collect();

        let sources = self
            .catalog
            .keys()
            .filter_map(|key| self.catalog.descriptor(key))
            .map(|descriptor| {
                let session = self
                    .active
                    .get(&descriptor.key)
                    .and_then(|active| active.session.as_ref());
                SourceStatus {
                    info: descriptor.info(),
                    available: self.catalog.is_available(&descriptor.key),
                    client_count: self.registry.client_count(&descriptor.key),
                    failure: self
                        .catalog
                        .failure_reason(&descriptor.key)
                        .map(str::to_string),
                    session: session.map(SessionHandle::state),
                    stats: session.map(SessionHandle::stats),
                    key: descriptor.key,
                }
            })
            .collect();

        HubSnapshot {
            clients,
            sources,
            draining_sessions: self.draining.len(),
            encoders: (*self.ctx.caps).clone(),
        }
    }

    async fn shutdown(&mut self) {
        info!("Stopping {} active sources", self.active.len());
        let keys: Vec<SourceKey> = self.active.keys().cloned().collect();
        for key in &keys {
            self.deactivate(key);
        }
        let timeout = self.settings.shutdown_timeout;
        let sessions = std::mem::take(&mut self.draining);
        futures::future::join_all(sessions.into_iter().map(|session| session.wait(timeout))).await;
        // 关闭出站队列，连接任务随之退出
        self.clients.clear();
    }
}

fn send_message(outbound: &mpsc::Sender<Outbound>, message: &ServerMessage) {
    match message.to_text() {
        Ok(text) => {
            let _ = outbound.try_send(Outbound::Text(text.into()));
        }
        Err(e) => warn!("Failed to encode {} message: {}", message.tag(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::camera::{assign_keys, parse_cameras};
    use crate::catalog::topic::{COMPRESSED_VIDEO_TOPIC_TYPE, IMAGE_TOPIC_TYPE};
    use crate::catalog::QosProfile;
    use crate::encoder::EncoderId;
    use crate::streaming::process::fake::FakeSpawner;
    use crate::streaming::StreamError;
    use serde_json::{json, Value};
    use std::sync::Mutex;

    const FRONT_CAMERA: &str = "[[cameras]]\nname = \"front\"\nsource = \"test\"";

    type Sinks = Arc<Mutex<HashMap<String, SourceSink>>>;

    /// 内存中的中间件：订阅后保存 sink，测试代替生产者调用
    #[derive(Default)]
    struct FakeBus {
        topics: BTreeMap<String, String>,
        sinks: Sinks,
    }

    impl FakeBus {
        fn with_topics(topics: &[(&str, &str)]) -> Arc<Self> {
            Arc::new(Self {
                topics: topics
                    .iter()
                    .map(|(name, type_name)| (name.to_string(), type_name.to_string()))
                    .collect(),
                sinks: Sinks::default(),
            })
        }

        fn sink(&self, topic: &str) -> Option<SourceSink> {
            self.sinks.lock().unwrap().get(topic).cloned()
        }
    }

    struct FakeSubscription {
        topic: String,
        sinks: Sinks,
    }

    impl UpstreamSubscription for FakeSubscription {
        fn cancel(self: Box<Self>) {
            self.sinks.lock().unwrap().remove(&self.topic);
        }
    }

    impl TopicBus for FakeBus {
        fn topics(&self) -> BTreeMap<String, String> {
            self.topics.clone()
        }

        fn publisher_qos(&self, _topic: &str) -> Vec<QosProfile> {
            Vec::new()
        }

        fn subscribe(
            &self,
            topic: &str,
            _type_name: &str,
            _qos: QosProfile,
            sink: SourceSink,
        ) -> Result<Box<dyn UpstreamSubscription>, StreamError> {
            self.sinks.lock().unwrap().insert(topic.to_string(), sink);
            Ok(Box::new(FakeSubscription {
                topic: topic.to_string(),
                sinks: self.sinks.clone(),
            }))
        }
    }

    fn hardware() -> EncoderCapabilities {
        EncoderCapabilities {
            ffmpeg: Some(EncoderId::FfmpegNvenc),
            gstreamer: Some(EncoderId::GstNvh264),
            cuda_colorspace: false,
        }
    }

    fn start_hub(
        settings: HubSettings,
        caps: EncoderCapabilities,
        bus: Arc<FakeBus>,
        cameras: &str,
    ) -> (Hub, FakeSpawner) {
        let mut catalog = SourceCatalog::new(assign_keys(parse_cameras(cameras).unwrap()));
        catalog.update_topics(bus.topics());
        let spawner = FakeSpawner::new();
        let (hub, _task) = Hub::start(settings, Arc::new(caps), Arc::new(spawner.clone()), bus, catalog);
        (hub, spawner)
    }

    fn subscribe(key: &str, rate: f64) -> String {
        json!(["s", {"sourceKey": key, "maxUpdateRate": rate}]).to_string()
    }

    fn unsubscribe(key: &str) -> String {
        json!(["u", {"sourceKey": key}]).to_string()
    }

    async fn next_tagged(outbound: &mut mpsc::Receiver<Outbound>, tag: &str) -> Value {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), outbound.recv())
                .await
                .expect("timed out waiting for message")
                .expect("outbound closed");
            if let Outbound::Text(text) = message {
                let value: Value = serde_json::from_str(&text).unwrap();
                if value[0] == tag {
                    return value[1].clone();
                }
            }
        }
    }

    async fn next_binary(outbound: &mut mpsc::Receiver<Outbound>) -> Bytes {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), outbound.recv())
                .await
                .expect("timed out waiting for binary frame")
                .expect("outbound closed");
            if let Outbound::Binary(frame) = message {
                return frame;
            }
        }
    }

    async fn wait_until(what: &str, condition: impl Fn() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_stream_unsubscribe_end_to_end() {
        let bus = FakeBus::with_topics(&[("cam1", IMAGE_TOPIC_TYPE)]);
        let (hub, spawner) = start_hub(HubSettings::default(), hardware(), bus.clone(), "");
        let (mut client, mut outbound) = ClientConnection::register(hub.clone()).unwrap();

        let system = next_tagged(&mut outbound, "y").await;
        assert_eq!(system["version"], env!("CARGO_PKG_VERSION"));
        let list = next_tagged(&mut outbound, "t").await;
        assert_eq!(list["cam1"], IMAGE_TOPIC_TYPE);

        // 中间件以 30Hz 推送 4x4 rgb8 帧
        let producer = tokio::spawn({
            let bus = bus.clone();
            async move {
                let frame = vec![0u8; 4 * 4 * 3];
                let mut ticker = tokio::time::interval(Duration::from_millis(33));
                loop {
                    ticker.tick().await;
                    if let Some(sink) = bus.sink("cam1") {
                        let _ = sink.frame("rgb8", 4, 4, &frame);
                    }
                }
            }
        });

        let subscribed_at = tokio::time::Instant::now();
        client.on_text(&subscribe("cam1", 10.0));
        let meta = next_tagged(&mut outbound, "v").await;
        assert!(subscribed_at.elapsed() <= Duration::from_millis(1500));
        assert_eq!(meta["fps"], 30);
        assert_eq!(meta["source"], "cam1");

        let mut arrivals = Vec::new();
        while arrivals.len() < 8 {
            next_binary(&mut outbound).await;
            arrivals.push(tokio::time::Instant::now());
        }
        // 编码数据不受 maxUpdateRate 限制，按编码帧率持续到达
        for pair in arrivals.windows(2) {
            assert!(pair[1] - pair[0] <= Duration::from_millis(200));
        }
        assert!(arrivals[7] - arrivals[0] < Duration::from_millis(700));
        assert_eq!(hub.client_count("cam1"), 1);
        assert_eq!(spawner.live(), 1);

        client.on_text(&unsubscribe("cam1"));
        let unsubscribed_at = tokio::time::Instant::now();
        wait_until("encoder terminated", || spawner.live() == 0).await;
        assert!(unsubscribed_at.elapsed() <= Duration::from_secs(1));
        assert_eq!(hub.client_count("cam1"), 0);
        assert_eq!(spawner.spawned(), 1);
        producer.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_lives_while_any_client_subscribed() {
        let (hub, spawner) = start_hub(
            HubSettings::default(),
            hardware(),
            FakeBus::with_topics(&[]),
            FRONT_CAMERA,
        );
        let (mut a, _a_out) = ClientConnection::register(hub.clone()).unwrap();
        let (mut b, _b_out) = ClientConnection::register(hub.clone()).unwrap();

        a.on_text(&subscribe("camera:front", 24.0));
        b.on_text(&subscribe("camera:front", 24.0));
        wait_until("camera started", || spawner.live() == 1).await;
        wait_until("both routed", || hub.client_count("camera:front") == 2).await;

        hub.send(HubCommand::Disconnect { client: a.id() });
        wait_until("a removed", || hub.client_count("camera:front") == 1).await;
        assert_eq!(spawner.live(), 1);

        b.on_text(&unsubscribe("camera:front"));
        wait_until("camera stopped", || spawner.live() == 0).await;
        assert_eq!(spawner.spawned(), 1);

        let snapshot = hub.snapshot().await.unwrap();
        assert_eq!(snapshot.clients.len(), 1);
        let front = &snapshot.sources[0];
        assert_eq!(front.client_count, 0);
        assert!(front.session.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_corrects_lost_commands() {
        let (hub, spawner) = start_hub(
            HubSettings::default(),
            hardware(),
            FakeBus::with_topics(&[]),
            FRONT_CAMERA,
        );
        let client = uuid::Uuid::new_v4();
        let (outbound_tx, _outbound_rx) = mpsc::channel(64);
        let (subscriptions_tx, subscriptions_rx) = watch::channel(ClientSubscriptions::new());
        hub.send(HubCommand::Connect {
            client,
            outbound: outbound_tx,
            subscriptions: subscriptions_rx,
        });

        // 订阅命令丢失，只有快照
        subscriptions_tx.send_modify(|s| {
            s.insert(
                SourceKey::camera("front"),
                SubscriptionParams { max_update_rate: 5.0 },
            );
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(spawner.spawned(), 0);

        hub.send(HubCommand::Reconcile { topics: None });
        wait_until("camera started", || spawner.live() == 1).await;
        assert_eq!(hub.client_count("camera:front"), 1);

        subscriptions_tx.send_modify(|s| s.clear());
        hub.send(HubCommand::Reconcile { topics: None });
        wait_until("camera stopped", || spawner.live() == 0).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_drops_vanished_clients() {
        let (hub, spawner) = start_hub(
            HubSettings::default(),
            hardware(),
            FakeBus::with_topics(&[]),
            FRONT_CAMERA,
        );
        let (mut client, outbound) = ClientConnection::register(hub.clone()).unwrap();
        client.on_text(&subscribe("camera:front", 24.0));
        wait_until("camera started", || spawner.live() == 1).await;

        // 连接任务消失且没有发送 Disconnect
        drop(outbound);
        hub.send(HubCommand::Reconcile { topics: None });
        wait_until("camera stopped", || spawner.live() == 0).await;
        let snapshot = hub.snapshot().await.unwrap();
        assert!(snapshot.clients.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_encoder_hides_source() {
        let (hub, spawner) = start_hub(
            HubSettings::default(),
            EncoderCapabilities::none(),
            FakeBus::with_topics(&[]),
            FRONT_CAMERA,
        );
        let (mut client, mut outbound) = ClientConnection::register(hub.clone()).unwrap();
        assert!(hub.source_available("camera:front"));
        assert!(next_tagged(&mut outbound, "t").await.get("camera:front").is_some());

        client.on_text(&subscribe("camera:front", 24.0));
        let list = next_tagged(&mut outbound, "t").await;
        assert!(list.get("camera:front").is_none());
        assert!(!hub.source_available("camera:front"));

        // 能力错误是永久的
        client.on_text(&unsubscribe("camera:front"));
        client.on_text(&subscribe("camera:front", 24.0));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!hub.source_available("camera:front"));
        assert_eq!(spawner.spawned(), 0);

        let snapshot = hub.snapshot().await.unwrap();
        assert!(snapshot.sources[0].failure.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_source_retried_on_next_subscribe() {
        let mut settings = HubSettings::default();
        settings.session.recovery = ErrorRecoveryPolicy::for_restarts(0, Duration::from_millis(100));
        let (hub, spawner) = start_hub(settings, hardware(), FakeBus::with_topics(&[]), FRONT_CAMERA);
        spawner.crash_next(1);

        let (mut client, _outbound) = ClientConnection::register(hub.clone()).unwrap();
        client.on_text(&subscribe("camera:front", 24.0));
        wait_until("source failed", || !hub.source_available("camera:front")).await;

        client.on_text(&subscribe("camera:front", 24.0));
        wait_until("source restored", || hub.source_available("camera:front")).await;
        wait_until("camera running", || spawner.live() == 1).await;
        assert_eq!(spawner.spawned(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_passthrough_topic_relays_identical_bytes() {
        let bus = FakeBus::with_topics(&[("/camera/h264", COMPRESSED_VIDEO_TOPIC_TYPE)]);
        let (hub, spawner) = start_hub(
            HubSettings::default(),
            EncoderCapabilities::none(),
            bus.clone(),
            "",
        );
        let (mut client, mut outbound) = ClientConnection::register(hub.clone()).unwrap();
        client.on_text(&subscribe("/camera/h264", 100.0));

        let meta = next_tagged(&mut outbound, "v").await;
        assert_eq!(meta["passthrough"], true);

        let payload = [0u8, 0, 0, 1, 0x65, 0x88, 0x84, 0x00];
        for _ in 0..3 {
            let sink = bus.sink("/camera/h264").unwrap();
            assert_eq!(sink.encoded(&payload), FrameDisposition::Accepted);
            let frame = next_binary(&mut outbound).await;
            let (source, relayed) = common::decode_binary_frame(&frame).unwrap();
            assert_eq!(source, "/camera/h264");
            assert_eq!(relayed, payload);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(spawner.spawned(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_passthrough_faster_than_update_rate_keeps_every_chunk() {
        let bus = FakeBus::with_topics(&[("/camera/h264", COMPRESSED_VIDEO_TOPIC_TYPE)]);
        let (hub, _spawner) = start_hub(
            HubSettings::default(),
            EncoderCapabilities::none(),
            bus.clone(),
            "",
        );
        let (mut client, mut outbound) = ClientConnection::register(hub.clone()).unwrap();
        client.on_text(&subscribe("/camera/h264", 10.0));
        next_tagged(&mut outbound, "v").await;

        // 约 30Hz 送入，是订阅速率的三倍
        let sink = bus.sink("/camera/h264").unwrap();
        for i in 0..30u8 {
            let payload = [0u8, 0, 0, 1, 0x41, i];
            assert_eq!(sink.encoded(&payload), FrameDisposition::Accepted);
            tokio::time::sleep(Duration::from_millis(33)).await;
        }
        for i in 0..30u8 {
            let frame = next_binary(&mut outbound).await;
            let (_, relayed) = common::decode_binary_frame(&frame).unwrap();
            assert_eq!(relayed, [0u8, 0, 0, 1, 0x41, i]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_while_publishing_leaves_no_throttle_slot() {
        let bus = FakeBus::with_topics(&[("/gps", "sensor_msgs/msg/NavSatFix")]);
        let (hub, _spawner) = start_hub(HubSettings::default(), hardware(), bus.clone(), "");
        let (mut stays, _stays_outbound) = ClientConnection::register(hub.clone()).unwrap();
        let (mut leaves, _leaves_outbound) = ClientConnection::register(hub.clone()).unwrap();
        stays.on_text(&subscribe("/gps", 50.0));
        leaves.on_text(&subscribe("/gps", 50.0));
        wait_until("routed", || hub.client_count("/gps") == 2).await;

        let sink = bus.sink("/gps").unwrap();
        let publisher = tokio::spawn(async move {
            loop {
                sink.message(json!({"latitude": 1.0}));
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        leaves.on_text(&unsubscribe("/gps"));
        wait_until("unsubscribed", || hub.client_count("/gps") == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let gate = hub.router().gate();
        assert_eq!(gate.interval(leaves.id(), "/gps"), None);
        assert_eq!(
            gate.interval(stays.id(), "/gps"),
            Some(Duration::from_millis(20))
        );
        publisher.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_data_topic_messages() {
        let bus = FakeBus::with_topics(&[("/gps", "sensor_msgs/msg/NavSatFix")]);
        let (hub, _spawner) = start_hub(HubSettings::default(), hardware(), bus.clone(), "");
        let (mut client, mut outbound) = ClientConnection::register(hub.clone()).unwrap();
        client.on_text(&subscribe("/gps", 5.0));
        wait_until("upstream subscribed", || bus.sink("/gps").is_some()).await;
        wait_until("routed", || hub.client_count("/gps") == 1).await;

        let sink = bus.sink("/gps").unwrap();
        assert_eq!(sink.message(json!({"latitude": 1.0})), 1);
        // 5Hz：紧接着的第二条被节流
        assert_eq!(sink.message(json!({"latitude": 2.0})), 0);

        let data = next_tagged(&mut outbound, "m").await;
        assert_eq!(data["latitude"], 1.0);
        assert_eq!(data["_topic_name"], "/gps");

        client.on_text(&unsubscribe("/gps"));
        wait_until("upstream cancelled", || bus.sink("/gps").is_none()).await;
        assert_eq!(sink.message(json!({"latitude": 3.0})), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_source_is_ignored() {
        let (hub, spawner) = start_hub(
            HubSettings::default(),
            hardware(),
            FakeBus::with_topics(&[]),
            FRONT_CAMERA,
        );
        let (mut client, _outbound) = ClientConnection::register(hub.clone()).unwrap();
        client.on_text(&subscribe("/does/not/exist", 24.0));
        client.on_text(&subscribe("camera:front", 24.0));
        wait_until("camera started", || spawner.live() == 1).await;

        let snapshot = hub.snapshot().await.unwrap();
        assert_eq!(snapshot.clients[0].subscriptions, vec![SourceKey::camera("front")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_all_sessions() {
        let (hub, spawner) = start_hub(
            HubSettings::default(),
            hardware(),
            FakeBus::with_topics(&[]),
            FRONT_CAMERA,
        );
        let (mut client, mut outbound) = ClientConnection::register(hub.clone()).unwrap();
        client.on_text(&subscribe("camera:front", 24.0));
        wait_until("camera started", || spawner.live() == 1).await;

        hub.shutdown().await;
        assert_eq!(spawner.live(), 0);
        // 出站队列随 Hub 关闭
        while outbound.recv().await.is_some() {}
        wait_until("hub stopped", || !hub.send(HubCommand::Ping)).await;
    }
}
