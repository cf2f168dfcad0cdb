// 编码器模块
//
// 启动时探测可用编码器，并为每个数据源构造外部编码进程的命令行。

pub mod pipeline;
pub mod probe;

pub use pipeline::{build, Invocation, PipelineSpec};
pub use probe::{CapabilityProbe, CommandProbeRunner, EncoderCapabilities, ProbeOutput, ProbeRunner};

use serde::Serialize;
use std::fmt;

/// 编码后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// ffmpeg：原始帧从 stdin 输入
    Ffmpeg,
    /// gst-launch-1.0：直连摄像头
    GStreamer,
}

/// 具体的 H.264 编码器实现，序列化为元素名
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncoderId {
    FfmpegNvenc,
    FfmpegQsv,
    FfmpegX264,
    GstNvh264,
    GstNvv4l2,
    GstVaapi,
    GstQsv,
    GstX264,
}

/// 软件编码器的帧率上限
pub const SOFTWARE_MAX_FPS: u32 = 10;
/// 硬件编码器的帧率上限
pub const HARDWARE_MAX_FPS: u32 = 60;

impl EncoderId {
    /// ffmpeg 候选顺序：厂商硬件优先，软件编码器最后
    pub const FFMPEG_CANDIDATES: [EncoderId; 3] = [Self::FfmpegNvenc, Self::FfmpegQsv, Self::FfmpegX264];

    /// GStreamer 候选顺序
    pub const GST_CANDIDATES: [EncoderId; 5] = [
        Self::GstNvh264,
        Self::GstNvv4l2,
        Self::GstVaapi,
        Self::GstQsv,
        Self::GstX264,
    ];

    /// 外部工具中的编码器名称
    pub fn name(&self) -> &'static str {
        match self {
            Self::FfmpegNvenc => "h264_nvenc",
            Self::FfmpegQsv => "h264_qsv",
            Self::FfmpegX264 => "libx264",
            Self::GstNvh264 => "nvh264enc",
            Self::GstNvv4l2 => "nvv4l2h264enc",
            Self::GstVaapi => "vaapih264enc",
            Self::GstQsv => "qsvh264enc",
            Self::GstX264 => "x264enc",
        }
    }

    pub fn backend(&self) -> Backend {
        match self {
            Self::FfmpegNvenc | Self::FfmpegQsv | Self::FfmpegX264 => Backend::Ffmpeg,
            _ => Backend::GStreamer,
        }
    }

    pub fn is_hardware(&self) -> bool {
        !matches!(self, Self::FfmpegX264 | Self::GstX264)
    }

    /// 该编码器能实时跟上的最高帧率
    pub fn max_fps(&self) -> u32 {
        if self.is_hardware() {
            HARDWARE_MAX_FPS
        } else {
            SOFTWARE_MAX_FPS
        }
    }
}

impl fmt::Display for EncoderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for EncoderId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}
