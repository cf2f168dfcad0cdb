// 中间件话题接口
//
// 网关本身不链接任何中间件：话题发现、QoS 查询和上游订阅都通过
// TopicBus 注入，数据经由 SourceSink 送进路由表。

use crate::hub::{self, FrameDisposition, Payload, Router};
use crate::streaming::StreamError;
use common::{PixelFormat, RawFormat, SourceKey};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::debug;

/// 原始图像话题类型
pub const IMAGE_TOPIC_TYPE: &str = "sensor_msgs/msg/Image";
/// 已编码视频话题类型（H.264 字节流，透传）
pub const COMPRESSED_VIDEO_TOPIC_TYPE: &str = "foxglove_msgs/msg/CompressedVideo";

/// 未知历史策略时使用的默认队列深度
pub const DEFAULT_QOS_DEPTH: u32 = 10;

/// 话题分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicClass {
    /// 普通消息，以 JSON 转发
    Data,
    /// 原始图像，需要编码
    RawVideo,
    /// 已编码视频，直接透传
    EncodedVideo,
}

impl TopicClass {
    pub fn of(type_name: &str) -> Self {
        match type_name {
            IMAGE_TOPIC_TYPE => Self::RawVideo,
            COMPRESSED_VIDEO_TOPIC_TYPE => Self::EncodedVideo,
            _ => Self::Data,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reliability {
    Reliable,
    BestEffort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    Volatile,
    TransientLocal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum History {
    KeepLast,
    KeepAll,
    /// 发布者未声明
    Unknown,
}

/// 投递保证配置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QosProfile {
    pub reliability: Reliability,
    pub durability: Durability,
    pub history: History,
    pub depth: u32,
}

impl Default for QosProfile {
    fn default() -> Self {
        Self {
            reliability: Reliability::BestEffort,
            durability: Durability::Volatile,
            history: History::KeepLast,
            depth: DEFAULT_QOS_DEPTH,
        }
    }
}

/// 按已有发布者的配置订阅，没有发布者时使用默认配置
pub fn match_publishers(publishers: &[QosProfile]) -> QosProfile {
    let Some(first) = publishers.first() else {
        return QosProfile::default();
    };
    let mut profile = *first;
    if profile.history == History::Unknown {
        profile.history = History::KeepLast;
    }
    if profile.history == History::KeepLast && profile.depth == 0 {
        profile.depth = DEFAULT_QOS_DEPTH;
    }
    profile
}

/// 上游订阅句柄，cancel 后不再回调
pub trait UpstreamSubscription: Send {
    fn cancel(self: Box<Self>);
}

/// 中间件适配接口
pub trait TopicBus: Send + Sync {
    /// 当前话题列表（名称 → 类型）
    fn topics(&self) -> BTreeMap<String, String>;

    /// 已有发布者的 QoS
    fn publisher_qos(&self, topic: &str) -> Vec<QosProfile>;

    /// 创建上游订阅，数据通过 sink 送入网关
    fn subscribe(
        &self,
        topic: &str,
        type_name: &str,
        qos: QosProfile,
        sink: SourceSink,
    ) -> Result<Box<dyn UpstreamSubscription>, StreamError>;
}

/// 未接入中间件时使用：没有话题
#[derive(Debug, Default)]
pub struct NullTopicBus;

impl TopicBus for NullTopicBus {
    fn topics(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    fn publisher_qos(&self, _topic: &str) -> Vec<QosProfile> {
        Vec::new()
    }

    fn subscribe(
        &self,
        topic: &str,
        _type_name: &str,
        _qos: QosProfile,
        _sink: SourceSink,
    ) -> Result<Box<dyn UpstreamSubscription>, StreamError> {
        Err(StreamError::SourceNotFound(topic.to_string()))
    }
}

/// 上游回调的入口
///
/// 生产者线程直接调用，从不阻塞：拿不到路由状态或队列已满时丢弃数据。
#[derive(Clone)]
pub struct SourceSink {
    key: SourceKey,
    type_name: String,
    router: Router,
}

impl SourceSink {
    pub fn new(key: SourceKey, type_name: impl Into<String>, router: Router) -> Self {
        Self {
            key,
            type_name: type_name.into(),
            router,
        }
    }

    /// 原始图像帧，`encoding` 为中间件图像编码名
    pub fn frame(
        &self,
        encoding: &str,
        width: u32,
        height: u32,
        data: &[u8],
    ) -> Result<FrameDisposition, StreamError> {
        let pixel_format = PixelFormat::from_encoding(encoding)
            .ok_or_else(|| StreamError::UnsupportedFormat(encoding.to_string()))?;
        let format = RawFormat {
            width,
            height,
            pixel_format,
        };
        Ok(self
            .router
            .offer_frame(&self.key, hub::now(), Some(format), data))
    }

    /// 已编码的 H.264 字节
    pub fn encoded(&self, data: &[u8]) -> FrameDisposition {
        self.router.offer_frame(&self.key, hub::now(), None, data)
    }

    /// 普通消息（已转换为 JSON）
    pub fn message(&self, message: Value) -> usize {
        // 没有订阅者时不做序列化
        if self.router.client_count(&self.key) == 0 {
            return 0;
        }
        let now_ms = chrono::Utc::now().timestamp_millis();
        let envelope = data_envelope(&self.key, &self.type_name, message, now_ms);
        match Payload::data(envelope) {
            Ok(payload) => self.router.publish(&self.key, payload),
            Err(e) => {
                debug!("Dropping unserializable message on {}: {}", self.key, e);
                0
            }
        }
    }
}

/// 给消息加上来源话题和时间戳字段
pub fn data_envelope(key: &SourceKey, type_name: &str, message: Value, time_ms: i64) -> Value {
    let mut fields = match message {
        Value::Object(fields) => fields,
        other => {
            let mut fields = Map::new();
            fields.insert("data".to_string(), other);
            fields
        }
    };
    fields.insert("_topic_name".to_string(), Value::from(key.as_str()));
    fields.insert("_topic_type".to_string(), Value::from(type_name));
    fields.insert("_time".to_string(), Value::from(time_ms));
    Value::Object(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_topic_class() {
        assert_eq!(TopicClass::of("sensor_msgs/msg/Image"), TopicClass::RawVideo);
        assert_eq!(
            TopicClass::of("foxglove_msgs/msg/CompressedVideo"),
            TopicClass::EncodedVideo
        );
        assert_eq!(TopicClass::of("sensor_msgs/msg/NavSatFix"), TopicClass::Data);
    }

    #[test]
    fn test_qos_matches_first_publisher() {
        let reliable = QosProfile {
            reliability: Reliability::Reliable,
            durability: Durability::TransientLocal,
            history: History::Unknown,
            depth: 1,
        };
        let other = QosProfile::default();

        let matched = match_publishers(&[reliable, other]);
        assert_eq!(matched.reliability, Reliability::Reliable);
        assert_eq!(matched.durability, Durability::TransientLocal);
        assert_eq!(matched.history, History::KeepLast);
        assert_eq!(matched.depth, 1);
    }

    #[test]
    fn test_qos_default_without_publishers() {
        let matched = match_publishers(&[]);
        assert_eq!(matched.reliability, Reliability::BestEffort);
        assert_eq!(matched.durability, Durability::Volatile);
        assert_eq!(matched.depth, 10);
    }

    #[test]
    fn test_data_envelope() {
        let key = SourceKey::from("/gps/fix");
        let value = data_envelope(
            &key,
            "sensor_msgs/msg/NavSatFix",
            json!({"latitude": 1.5}),
            1_700_000_000_000,
        );
        assert_eq!(value["latitude"], 1.5);
        assert_eq!(value["_topic_name"], "/gps/fix");
        assert_eq!(value["_topic_type"], "sensor_msgs/msg/NavSatFix");
        assert_eq!(value["_time"], 1_700_000_000_000i64);

        let wrapped = data_envelope(&key, "std_msgs/msg/Float64", json!(3.0), 0);
        assert_eq!(wrapped["data"], 3.0);
    }
}
