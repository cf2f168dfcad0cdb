// 数据源目录
//
// 记录所有已知数据源（话题 + 摄像头）及其可用性，生成发给浏览器的
// source-list。只由 Hub 任务持有和修改。

pub mod camera;
pub mod topic;

pub use camera::{CameraConfig, CameraSource};
pub use topic::{NullTopicBus, QosProfile, SourceSink, TopicBus, TopicClass, UpstreamSubscription};

use crate::streaming::StreamError;
use common::{SourceInfo, SourceKey, MAX_SOURCE_KEY_LEN};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tracing::{info, warn};

/// 目录错误
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Failed to read {path}: {message}")]
    Io { path: String, message: String },

    #[error("Invalid camera config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// 数据源种类
#[derive(Debug, Clone, PartialEq)]
pub enum SourceKind {
    Topic { type_name: String, class: TopicClass },
    Camera(CameraConfig),
}

/// 数据源描述
#[derive(Debug, Clone, PartialEq)]
pub struct SourceDescriptor {
    pub key: SourceKey,
    pub kind: SourceKind,
}

impl SourceDescriptor {
    pub fn info(&self) -> SourceInfo {
        match &self.kind {
            SourceKind::Topic { type_name, .. } => SourceInfo::Topic(type_name.clone()),
            SourceKind::Camera(camera) => SourceInfo::Camera(camera.info()),
        }
    }
}

#[derive(Debug, Clone)]
struct Failure {
    permanent: bool,
    reason: String,
}

/// 数据源目录
#[derive(Debug, Default)]
pub struct SourceCatalog {
    topics: BTreeMap<SourceKey, String>,
    cameras: BTreeMap<SourceKey, CameraConfig>,
    failed: HashMap<SourceKey, Failure>,
}

impl SourceCatalog {
    pub fn new(cameras: BTreeMap<SourceKey, CameraConfig>) -> Self {
        Self {
            topics: BTreeMap::new(),
            cameras,
            failed: HashMap::new(),
        }
    }

    /// 用最新的话题列表替换旧列表，返回是否有变化
    pub fn update_topics(&mut self, topics: BTreeMap<String, String>) -> bool {
        let topics: BTreeMap<SourceKey, String> = topics
            .into_iter()
            .filter(|(name, _)| {
                let key = SourceKey::from(name.as_str());
                if key.is_camera() || name.is_empty() || name.len() > MAX_SOURCE_KEY_LEN {
                    warn!("Ignoring topic with unusable name: {}", name);
                    return false;
                }
                true
            })
            .map(|(name, type_name)| (SourceKey::new(name), type_name))
            .collect();

        if topics == self.topics {
            return false;
        }
        info!("Topic list changed: {} topics", topics.len());
        self.topics = topics;
        true
    }

    pub fn contains(&self, key: &str) -> bool {
        self.topics.contains_key(key) || self.cameras.contains_key(key)
    }

    pub fn descriptor(&self, key: &str) -> Option<SourceDescriptor> {
        if let Some((key, type_name)) = self.topics.get_key_value(key) {
            return Some(SourceDescriptor {
                key: key.clone(),
                kind: SourceKind::Topic {
                    type_name: type_name.clone(),
                    class: TopicClass::of(type_name),
                },
            });
        }
        self.cameras
            .get_key_value(key)
            .map(|(key, camera)| SourceDescriptor {
                key: key.clone(),
                kind: SourceKind::Camera(camera.clone()),
            })
    }

    /// 标记数据源失败；能力错误是永久的
    pub fn mark_failed(&mut self, key: &SourceKey, error: &StreamError) {
        warn!("Source {} marked unavailable: {}", key, error);
        self.failed.insert(
            key.clone(),
            Failure {
                permanent: error.is_capability(),
                reason: error.to_string(),
            },
        );
    }

    pub fn is_failed(&self, key: &str) -> bool {
        self.failed.contains_key(key)
    }

    pub fn failure_reason(&self, key: &str) -> Option<&str> {
        self.failed.get(key).map(|f| f.reason.as_str())
    }

    /// 新的订阅请求到来时清除临时失败；返回是否允许重新启动
    pub fn allow_retry(&mut self, key: &str) -> bool {
        match self.failed.get(key) {
            Some(failure) if failure.permanent => false,
            Some(_) => {
                self.failed.remove(key);
                true
            }
            None => true,
        }
    }

    /// 可用（已知且未失败）
    pub fn is_available(&self, key: &str) -> bool {
        self.contains(key) && !self.is_failed(key)
    }

    /// 发给浏览器的数据源列表，不含失败的数据源
    pub fn source_list(&self) -> BTreeMap<SourceKey, SourceInfo> {
        let topics = self
            .topics
            .iter()
            .map(|(key, type_name)| (key.clone(), SourceInfo::Topic(type_name.clone())));
        let cameras = self
            .cameras
            .iter()
            .map(|(key, camera)| (key.clone(), SourceInfo::Camera(camera.info())));
        topics
            .chain(cameras)
            .filter(|(key, _)| !self.is_failed(key.as_str()))
            .collect()
    }

    pub fn keys(&self) -> impl Iterator<Item = &SourceKey> {
        self.topics.keys().chain(self.cameras.keys())
    }
}
