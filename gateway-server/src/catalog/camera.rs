// 摄像头配置加载与 V4L2 自动发现

use crate::catalog::CatalogError;
use crate::encoder::pipeline::{v4l2_info_invocation, v4l2_probe_invocation};
use crate::encoder::ProbeRunner;
use common::{CameraInfo, SourceKey, MAX_SOURCE_KEY_LEN};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::{error, info, warn};
use walkdir::WalkDir;

const V4L2_DEVICE_PREFIX: &str = "video";
const DEFAULT_V4L2_DEVICE: &str = "/dev/video0";

/// 摄像头采集方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraSource {
    V4l2,
    Rtsp,
    Libcamera,
    /// Jetson CSI 摄像头，输出 NVMM 缓冲区
    Nvargus,
    #[default]
    Test,
}

impl CameraSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::V4l2 => "v4l2",
            Self::Rtsp => "rtsp",
            Self::Libcamera => "libcamera",
            Self::Nvargus => "nvargus",
            Self::Test => "test",
        }
    }
}

/// 单个摄像头配置（cameras.toml 中的 `[[cameras]]` 表）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    pub name: String,
    #[serde(default)]
    pub source: CameraSource,
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_fps")]
    pub fps: u32,
    /// 源本身输出 H.264，只解包不编码（仅 rtsp 有效）
    #[serde(default)]
    pub passthrough: bool,
    #[serde(default)]
    pub sensor_id: u32,
    /// videotestsrc 图案
    #[serde(default)]
    pub pattern: Option<String>,
}

fn default_width() -> u32 {
    640
}

fn default_height() -> u32 {
    480
}

fn default_fps() -> u32 {
    30
}

impl CameraConfig {
    pub fn device_or_default(&self) -> &str {
        self.device.as_deref().unwrap_or(DEFAULT_V4L2_DEVICE)
    }

    /// 是否透传（不经过编码器）
    pub fn is_passthrough(&self) -> bool {
        self.passthrough && self.source == CameraSource::Rtsp
    }

    /// 发送给浏览器的描述
    pub fn info(&self) -> CameraInfo {
        CameraInfo {
            name: self.name.clone(),
            source: self.source.as_str().to_string(),
            width: self.width,
            height: self.height,
            fps: self.fps,
            passthrough: self.is_passthrough(),
        }
    }

    fn location(&self) -> &str {
        self.device
            .as_deref()
            .or(self.url.as_deref())
            .unwrap_or_default()
    }
}

#[derive(Debug, Default, Deserialize)]
struct CamerasFile {
    #[serde(default)]
    cameras: Vec<CameraConfig>,
}

/// 解析 cameras.toml 内容
pub fn parse_cameras(content: &str) -> Result<Vec<CameraConfig>, CatalogError> {
    let file: CamerasFile = toml::from_str(content)?;
    Ok(file.cameras)
}

/// 从文件读取摄像头配置
pub fn load_cameras_file(path: &Path) -> Result<Vec<CameraConfig>, CatalogError> {
    let content = std::fs::read_to_string(path).map_err(|e| CatalogError::Io {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    let cameras = parse_cameras(&content)?;
    info!("Loaded {} camera(s) from {}", cameras.len(), path.display());
    Ok(cameras)
}

/// 加载摄像头：优先读配置文件，文件不存在或解析失败时自动发现 V4L2 设备
pub async fn load_cameras(
    path: &Path,
    discover: bool,
    runner: &dyn ProbeRunner,
    timeout: Duration,
) -> Vec<CameraConfig> {
    if path.is_file() {
        match load_cameras_file(path) {
            Ok(cameras) => return cameras,
            Err(e) => error!("{}; falling back to auto-discovery", e),
        }
    }

    if !discover {
        return Vec::new();
    }
    discover_v4l2_cameras(Path::new("/dev"), runner, timeout).await
}

/// 扫描 `dev_dir` 下的 video* 设备，逐个用 gst 采集一帧确认可用
pub async fn discover_v4l2_cameras(
    dev_dir: &Path,
    runner: &dyn ProbeRunner,
    timeout: Duration,
) -> Vec<CameraConfig> {
    if !dev_dir.exists() {
        return Vec::new();
    }

    let mut devices: Vec<String> = WalkDir::new(dev_dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(V4L2_DEVICE_PREFIX))
        })
        .map(|entry| entry.path().display().to_string())
        .collect();
    devices.sort();

    let mut cameras = Vec::new();
    for device in devices {
        let probe = runner
            .run(&v4l2_probe_invocation(&device), None, timeout)
            .await;
        if !probe.success {
            continue;
        }

        let name = v4l2_device_name(&device, runner, timeout).await;
        info!("Discovered V4L2 camera: {} ({})", name, device);
        cameras.push(CameraConfig {
            name,
            source: CameraSource::V4l2,
            device: Some(device),
            url: None,
            width: default_width(),
            height: default_height(),
            fps: default_fps(),
            passthrough: false,
            sensor_id: 0,
            pattern: None,
        });
    }

    if cameras.is_empty() {
        info!("No usable V4L2 cameras found");
    }
    cameras
}

/// 通过 v4l2-ctl 查询设备名称，失败时使用设备文件名
async fn v4l2_device_name(device: &str, runner: &dyn ProbeRunner, timeout: Duration) -> String {
    let fallback = Path::new(device)
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| device.to_string());

    let output = runner.run(&v4l2_info_invocation(device), None, timeout).await;
    if !output.success {
        return fallback;
    }
    parse_card_type(&String::from_utf8_lossy(&output.stdout)).unwrap_or(fallback)
}

/// 从 `v4l2-ctl --info` 输出中取出 "Card type" 字段
fn parse_card_type(info: &str) -> Option<String> {
    info.lines()
        .map(str::trim)
        .filter(|line| line.starts_with("Card type"))
        .filter_map(|line| line.split_once(':'))
        .map(|(_, name)| name.trim().to_string())
        .find(|name| !name.is_empty())
}

/// 为摄像头分配唯一的数据源键
///
/// 重名时追加 ` (<设备或地址>)`，仍然冲突则再追加序号。
pub fn assign_keys(cameras: Vec<CameraConfig>) -> BTreeMap<SourceKey, CameraConfig> {
    let mut assigned = BTreeMap::new();
    for camera in cameras {
        let mut key = SourceKey::camera(&camera.name);
        if assigned.contains_key(&key) {
            key = SourceKey::camera(&format!("{} ({})", camera.name, camera.location()));
        }
        let base = key.clone();
        let mut index = 2;
        while assigned.contains_key(&key) {
            key = SourceKey::new(format!("{} #{}", base, index));
            index += 1;
        }

        if key.as_str().len() > MAX_SOURCE_KEY_LEN {
            warn!("Camera key too long, skipping: {}", key);
            continue;
        }
        assigned.insert(key, camera);
    }
    assigned
}
