// 编码管道构造
//
// 纯函数：根据数据源、编码器、分辨率、帧率和质量生成外部进程的命令行。
// 固定策略：
// - GOP 等于目标帧率（每秒一个关键帧）
// - 每个关键帧前重复 SPS/PPS，新加入的客户端无需额外握手即可解码
// - 软件路径使用 baseline profile

use crate::catalog::camera::{CameraConfig, CameraSource};
use crate::encoder::{Backend, EncoderId};
use crate::streaming::StreamError;
use common::{PixelFormat, Quality, RawFormat};
use std::fmt;

pub const FFMPEG: &str = "ffmpeg";
pub const GST_LAUNCH: &str = "gst-launch-1.0";

/// GPU 色彩空间转换滤镜（需要较新的 ffmpeg）
pub const CUDA_COLORSPACE_FILTER: &str = "hwupload_cuda,scale_cuda=format=nv12";

/// 探测时使用的合成帧尺寸
pub const PROBE_FRAME_SIZE: u32 = 256;

/// 外部进程调用描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    /// 原始帧从 stdin 写入
    pub stdin_frames: bool,
    /// 编码数据从 stdout 读出
    pub stdout_stream: bool,
}

impl Invocation {
    fn new(program: &str, args: Vec<String>, stdin_frames: bool) -> Self {
        Self {
            program: program.to_string(),
            args,
            stdin_frames,
            stdout_stream: true,
        }
    }

    pub fn has_arg(&self, arg: &str) -> bool {
        self.args.iter().any(|a| a == arg)
    }

    /// 紧跟在 `flag` 之后的参数值
    pub fn arg_value(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.program, self.args.join(" "))
    }
}

/// 管道请求，按数据源种类区分
#[derive(Debug, Clone, Copy)]
pub enum PipelineSpec<'a> {
    /// 话题原始帧：ffmpeg 从 stdin 读取 rawvideo
    RawFrames {
        format: RawFormat,
        encoder: EncoderId,
        fps: u32,
        quality: Quality,
        cuda_colorspace: bool,
    },
    /// 直连摄像头：gst-launch 负责采集和编码；透传时 encoder 可以为空
    Camera {
        camera: &'a CameraConfig,
        encoder: Option<EncoderId>,
        fps: u32,
        quality: Quality,
    },
}

/// 构造外部进程调用
pub fn build(spec: &PipelineSpec<'_>) -> Result<Invocation, StreamError> {
    match *spec {
        PipelineSpec::RawFrames {
            format,
            encoder,
            fps,
            quality,
            cuda_colorspace,
        } => raw_frame_pipeline(&format, encoder, fps, quality, cuda_colorspace),
        PipelineSpec::Camera {
            camera,
            encoder,
            fps,
            quality,
        } => camera_pipeline(camera, encoder, fps, quality),
    }
}

fn raw_frame_pipeline(
    format: &RawFormat,
    encoder: EncoderId,
    fps: u32,
    quality: Quality,
    cuda_colorspace: bool,
) -> Result<Invocation, StreamError> {
    if encoder.backend() != Backend::Ffmpeg {
        return Err(StreamError::UnsupportedFormat(format!(
            "{} cannot encode raw frames",
            encoder
        )));
    }
    let fps = fps.max(1);

    let mut args = strings(&["-hide_banner", "-loglevel", "error", "-f", "rawvideo"]);
    args.extend([
        "-pix_fmt".to_string(),
        format.pixel_format.ffmpeg_name().to_string(),
        "-s".to_string(),
        format!("{}x{}", format.width, format.height),
        "-r".to_string(),
        fps.to_string(),
        "-i".to_string(),
        "pipe:0".to_string(),
    ]);
    args.extend(ffmpeg_encoder_args(encoder, fps, quality, cuda_colorspace));
    args.extend(strings(&["-bsf:v", "dump_extra", "-f", "h264", "pipe:1"]));

    Ok(Invocation::new(FFMPEG, args, true))
}

fn ffmpeg_encoder_args(
    encoder: EncoderId,
    fps: u32,
    quality: Quality,
    cuda_colorspace: bool,
) -> Vec<String> {
    let gop = fps.to_string();
    let mut args = Vec::new();
    match encoder {
        EncoderId::FfmpegNvenc => {
            if cuda_colorspace {
                args.extend(strings(&["-vf", CUDA_COLORSPACE_FILTER]));
            } else {
                args.extend(strings(&["-pix_fmt", "yuv420p"]));
            }
            args.extend(strings(&[
                "-c:v", "h264_nvenc", "-preset", "p1", "-tune", "ull", "-profile:v", "baseline",
                "-level", "auto", "-rc", "constqp", "-qp",
            ]));
            args.push(quality.qp().to_string());
            args.extend(["-g".to_string(), gop]);
        }
        EncoderId::FfmpegQsv => {
            args.extend(strings(&[
                "-pix_fmt", "yuv420p", "-c:v", "h264_qsv", "-preset", "veryfast", "-profile:v",
                "baseline", "-global_quality",
            ]));
            args.push(quality.qp().to_string());
            args.extend(["-g".to_string(), gop]);
        }
        // gst 编码器不会走到这里，统一退回软件编码参数
        _ => {
            args.extend(strings(&[
                "-pix_fmt", "yuv420p", "-c:v", "libx264", "-preset", "ultrafast", "-tune",
                "zerolatency", "-profile:v", "baseline", "-crf",
            ]));
            args.push(quality.crf().to_string());
            args.extend(["-g".to_string(), gop.clone(), "-keyint_min".to_string(), gop]);
        }
    }
    args
}

fn camera_pipeline(
    camera: &CameraConfig,
    encoder: Option<EncoderId>,
    fps: u32,
    quality: Quality,
) -> Result<Invocation, StreamError> {
    let fps = fps.max(1);
    let (w, h) = (camera.width, camera.height);
    let raw_caps = format!("video/x-raw,width={},height={},framerate={}/1", w, h, fps);

    let mut elements: Vec<String> = vec!["-q".to_string(), "-e".to_string()];

    let source: Vec<String> = match camera.source {
        CameraSource::V4l2 => vec![
            "v4l2src".to_string(),
            format!("device={}", camera.device_or_default()),
            "!".to_string(),
            raw_caps,
        ],
        CameraSource::Rtsp if camera.passthrough => {
            // 透传：只做解包，不经过编码器
            elements.extend(rtsp_depay(camera));
            elements.extend(byte_stream_tail());
            return Ok(Invocation::new(GST_LAUNCH, elements, false));
        }
        CameraSource::Rtsp => {
            let mut source = rtsp_depay(camera);
            source.extend([
                "!".to_string(),
                "avdec_h264".to_string(),
                "!".to_string(),
                format!("video/x-raw,width={},height={}", w, h),
            ]);
            source
        }
        CameraSource::Libcamera => vec!["libcamerasrc".to_string(), "!".to_string(), raw_caps],
        CameraSource::Nvargus => vec![
            "nvarguscamerasrc".to_string(),
            format!("sensor-id={}", camera.sensor_id),
            "!".to_string(),
            format!(
                "video/x-raw(memory:NVMM),width={},height={},framerate={}/1",
                w, h, fps
            ),
        ],
        CameraSource::Test => vec![
            "videotestsrc".to_string(),
            format!("pattern={}", camera.pattern.as_deref().unwrap_or("ball")),
            "is-live=true".to_string(),
            "!".to_string(),
            raw_caps,
        ],
    };
    elements.extend(source);
    elements.push("!".to_string());

    // NVMM 缓冲区直接送入 Jetson 编码器，不做 videoconvert
    if camera.source == CameraSource::Nvargus {
        elements.extend(gst_encoder_args(EncoderId::GstNvv4l2, fps, quality));
    } else {
        let encoder = encoder.ok_or(StreamError::NoEncoderAvailable)?;
        if encoder.backend() != Backend::GStreamer {
            return Err(StreamError::UnsupportedFormat(format!(
                "{} cannot encode camera {}",
                encoder, camera.name
            )));
        }
        elements.extend(strings(&["videoconvert", "!"]));
        elements.extend(gst_encoder_args(encoder, fps, quality));
    }
    elements.extend(byte_stream_tail());

    Ok(Invocation::new(GST_LAUNCH, elements, false))
}

fn rtsp_depay(camera: &CameraConfig) -> Vec<String> {
    vec![
        "rtspsrc".to_string(),
        format!("location={}", camera.url.as_deref().unwrap_or_default()),
        "latency=200".to_string(),
        "!".to_string(),
        "rtph264depay".to_string(),
    ]
}

/// h264parse 在每个关键帧前插入参数集，输出 Annex-B 字节流到 stdout
fn byte_stream_tail() -> Vec<String> {
    strings(&[
        "!",
        "h264parse",
        "config-interval=-1",
        "!",
        "video/x-h264,stream-format=byte-stream",
        "!",
        "fdsink",
        "fd=1",
    ])
}

fn gst_encoder_args(encoder: EncoderId, fps: u32, quality: Quality) -> Vec<String> {
    let qp = quality.qp();
    match encoder {
        EncoderId::GstNvh264 => vec![
            "nvh264enc".to_string(),
            "preset=low-latency-hq".to_string(),
            "rc-mode=constqp".to_string(),
            format!("qp-const={}", qp),
            format!("gop-size={}", fps),
        ],
        EncoderId::GstNvv4l2 => vec![
            "nvv4l2h264enc".to_string(),
            "preset-level=1".to_string(),
            format!("iframeinterval={}", fps),
            format!("bitrate={}", bitrate_kbps(quality) * 2000),
        ],
        EncoderId::GstVaapi => vec![
            "vaapih264enc".to_string(),
            "rate-control=cqp".to_string(),
            format!("init-qp={}", qp),
            format!("keyframe-period={}", fps),
        ],
        EncoderId::GstQsv => vec![
            "qsvh264enc".to_string(),
            "target-usage=7".to_string(),
            format!("gop-size={}", fps),
        ],
        // ffmpeg 编码器不会走到这里，统一退回软件编码参数
        _ => vec![
            "x264enc".to_string(),
            "tune=zerolatency".to_string(),
            "speed-preset=ultrafast".to_string(),
            format!("key-int-max={}", fps),
            format!("bitrate={}", bitrate_kbps(quality)),
            "!".to_string(),
            "video/x-h264,profile=baseline".to_string(),
        ],
    }
}

/// 软件编码码率（kbps）
fn bitrate_kbps(quality: Quality) -> u32 {
    match quality {
        Quality::Low => 1000,
        Quality::Medium => 2000,
        Quality::High => 4000,
    }
}

/// 探测调用：编码一帧 256x256 合成图像到 stdout
///
/// ffmpeg 探测需要向 stdin 写入一帧数据，格式见 [`probe_input_format`]。
pub fn probe_invocation(encoder: EncoderId, cuda_colorspace: bool) -> Invocation {
    match encoder.backend() {
        Backend::Ffmpeg => {
            let mut args = strings(&["-hide_banner", "-loglevel", "error", "-f", "rawvideo", "-pix_fmt"]);
            args.push(probe_input_format(cuda_colorspace).ffmpeg_name().to_string());
            args.push("-s".to_string());
            args.push(format!("{}x{}", PROBE_FRAME_SIZE, PROBE_FRAME_SIZE));
            args.extend(strings(&["-r", "1", "-i", "pipe:0"]));
            if cuda_colorspace {
                args.extend(strings(&["-vf", CUDA_COLORSPACE_FILTER]));
            }
            args.extend(strings(&["-c:v", encoder.name()]));
            match encoder {
                EncoderId::FfmpegNvenc => args.extend(strings(&["-preset", "p1"])),
                EncoderId::FfmpegX264 => args.extend(strings(&["-preset", "ultrafast"])),
                _ => {}
            }
            args.extend(strings(&["-frames:v", "1", "-f", "h264", "pipe:1"]));
            Invocation::new(FFMPEG, args, true)
        }
        Backend::GStreamer => {
            let mut args = strings(&[
                "-q",
                "videotestsrc",
                "num-buffers=1",
                "!",
            ]);
            args.push(format!(
                "video/x-raw,width={},height={},framerate=1/1",
                PROBE_FRAME_SIZE, PROBE_FRAME_SIZE
            ));
            args.extend(strings(&["!", "videoconvert", "!"]));
            args.extend(gst_encoder_args(encoder, 1, Quality::Medium));
            args.extend(strings(&["!", "fdsink", "fd=1"]));
            Invocation::new(GST_LAUNCH, args, false)
        }
    }
}

/// 探测输入的像素格式
///
/// 色彩空间滤镜探测使用原始帧管道实际送入的 bgr24。
pub fn probe_input_format(cuda_colorspace: bool) -> PixelFormat {
    if cuda_colorspace {
        PixelFormat::Bgr24
    } else {
        PixelFormat::Yuv420p
    }
}

/// 探测用的一帧图像
pub fn probe_frame(format: PixelFormat) -> Vec<u8> {
    let size = format.frame_size(PROBE_FRAME_SIZE, PROBE_FRAME_SIZE);
    match format {
        PixelFormat::Yuv420p => {
            // 黑色
            let mut frame = vec![16u8; (PROBE_FRAME_SIZE * PROBE_FRAME_SIZE) as usize];
            frame.resize(size, 128);
            frame
        }
        _ => vec![0x80; size],
    }
}

/// V4L2 设备可用性探测
pub fn v4l2_probe_invocation(device: &str) -> Invocation {
    let mut invocation = Invocation::new(
        GST_LAUNCH,
        vec![
            "-q".to_string(),
            "v4l2src".to_string(),
            format!("device={}", device),
            "num-buffers=1".to_string(),
            "!".to_string(),
            "fakesink".to_string(),
        ],
        false,
    );
    invocation.stdout_stream = false;
    invocation
}

/// V4L2 设备名称查询
pub fn v4l2_info_invocation(device: &str) -> Invocation {
    Invocation::new(
        "v4l2-ctl",
        vec!["-d".to_string(), device.to_string(), "--info".to_string()],
        false,
    )
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
