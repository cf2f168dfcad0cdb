use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::ops::Deref;
use uuid::Uuid;

/// 摄像头数据源键前缀，保证与中间件话题名不冲突
pub const CAMERA_KEY_PREFIX: &str = "camera:";

/// 二进制帧头中数据源键的最大字节数（长度字段只有1字节）
pub const MAX_SOURCE_KEY_LEN: usize = 255;

/// 客户端连接ID
pub type ClientId = Uuid;

/// 数据源键
///
/// 话题名（如 `/camera/image_raw`）或带 `camera:` 前缀的摄像头键。
/// 进程生命周期内不可变。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceKey(String);

impl SourceKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// 根据摄像头名称构造键
    pub fn camera(name: &str) -> Self {
        Self(format!("{}{}", CAMERA_KEY_PREFIX, name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_camera(&self) -> bool {
        self.0.starts_with(CAMERA_KEY_PREFIX)
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Deref for SourceKey {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for SourceKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SourceKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for SourceKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// 原始帧像素格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Bgr24,
    Rgb24,
    Gray,
    Bgra,
    Rgba,
    Yuv420p,
}

impl PixelFormat {
    /// 中间件图像编码名 → 像素格式
    pub fn from_encoding(encoding: &str) -> Option<Self> {
        match encoding {
            "bgr8" | "8UC3" => Some(Self::Bgr24),
            "rgb8" => Some(Self::Rgb24),
            "mono8" | "8UC1" => Some(Self::Gray),
            "bgra8" | "8UC4" => Some(Self::Bgra),
            "rgba8" => Some(Self::Rgba),
            _ => None,
        }
    }

    /// 编码器命令行使用的像素格式名
    pub fn ffmpeg_name(&self) -> &'static str {
        match self {
            Self::Bgr24 => "bgr24",
            Self::Rgb24 => "rgb24",
            Self::Gray => "gray",
            Self::Bgra => "bgra",
            Self::Rgba => "rgba",
            Self::Yuv420p => "yuv420p",
        }
    }

    /// 单帧字节数
    pub fn frame_size(&self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            Self::Gray => pixels,
            Self::Bgr24 | Self::Rgb24 => pixels * 3,
            Self::Bgra | Self::Rgba => pixels * 4,
            Self::Yuv420p => pixels * 3 / 2,
        }
    }
}

/// 原始帧格式（分辨率 + 像素格式）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFormat {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
}

/// 编码质量档位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Low,
    #[default]
    Medium,
    High,
}

impl Quality {
    /// 宽松解析：未知值一律按 medium 处理
    pub fn parse_lossy(value: Option<&str>) -> Self {
        match value {
            Some("low") => Self::Low,
            Some("high") => Self::High,
            _ => Self::Medium,
        }
    }

    /// 软件编码器 CRF
    pub fn crf(&self) -> u8 {
        match self {
            Self::Low => 35,
            Self::Medium => 26,
            Self::High => 18,
        }
    }

    /// 硬件编码器 QP
    pub fn qp(&self) -> u8 {
        match self {
            Self::Low => 32,
            Self::Medium => 23,
            Self::High => 15,
        }
    }
}

/// 视频流元数据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamMeta {
    pub source: SourceKey,
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    pub encoder: String,
    pub passthrough: bool,
}

/// 摄像头描述（发送给浏览器）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraInfo {
    pub name: String,
    pub source: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub passthrough: bool,
}

/// source-list 中每个数据源的值：话题为类型名，摄像头为描述对象
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SourceInfo {
    Topic(String),
    Camera(CameraInfo),
}
