// 编码器能力探测
//
// 启动时对每个后端按优先级逐个做一次真实的单帧编码，第一个成功
// 并产生输出的候选者即为本次运行的默认编码器。结果是不可变值，
// 构造会话时显式传入。

use crate::encoder::pipeline::{probe_frame, probe_input_format, probe_invocation, Invocation};
use crate::encoder::{Backend, EncoderId};
use crate::streaming::StreamError;
use async_trait::async_trait;
use serde::Serialize;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// 探测结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EncoderCapabilities {
    /// ffmpeg 后端选中的编码器
    pub ffmpeg: Option<EncoderId>,
    /// GStreamer 后端选中的编码器
    pub gstreamer: Option<EncoderId>,
    /// NVENC 路径是否可以使用 GPU 色彩空间转换
    pub cuda_colorspace: bool,
}

impl EncoderCapabilities {
    /// 没有任何可用编码器
    pub fn none() -> Self {
        Self::default()
    }

    /// 只有软件编码器
    pub fn software_only() -> Self {
        Self {
            ffmpeg: Some(EncoderId::FfmpegX264),
            gstreamer: Some(EncoderId::GstX264),
            cuda_colorspace: false,
        }
    }

    pub fn encoder_for(&self, backend: Backend) -> Result<EncoderId, StreamError> {
        match backend {
            Backend::Ffmpeg => self.ffmpeg,
            Backend::GStreamer => self.gstreamer,
        }
        .ok_or(StreamError::NoEncoderAvailable)
    }
}

/// 探测进程的输出
#[derive(Debug, Clone, Default)]
pub struct ProbeOutput {
    pub success: bool,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl ProbeOutput {
    /// 进程成功退出并产生了输出
    pub fn produced_output(&self) -> bool {
        self.success && !self.stdout.is_empty()
    }
}

/// 运行一次性探测命令
#[async_trait]
pub trait ProbeRunner: Send + Sync {
    async fn run(&self, invocation: &Invocation, input: Option<Vec<u8>>, timeout: Duration) -> ProbeOutput;
}

/// 基于 tokio::process 的实现
#[derive(Debug, Default, Clone)]
pub struct CommandProbeRunner;

#[async_trait]
impl ProbeRunner for CommandProbeRunner {
    async fn run(&self, invocation: &Invocation, input: Option<Vec<u8>>, timeout: Duration) -> ProbeOutput {
        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                debug!("Probe {} could not start: {}", invocation.program, e);
                return ProbeOutput {
                    stderr: e.to_string(),
                    ..ProbeOutput::default()
                };
            }
        };

        if let (Some(data), Some(mut stdin)) = (input, child.stdin.take()) {
            tokio::spawn(async move {
                // 进程可能在读完之前就退出，写入失败不影响判断
                let _ = stdin.write_all(&data).await;
                let _ = stdin.shutdown().await;
            });
        }

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => ProbeOutput {
                success: output.status.success(),
                stdout: output.stdout,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            },
            Ok(Err(e)) => ProbeOutput {
                stderr: e.to_string(),
                ..ProbeOutput::default()
            },
            Err(_) => {
                warn!("Probe timed out after {:?}: {}", timeout, invocation);
                ProbeOutput {
                    stderr: "timed out".to_string(),
                    ..ProbeOutput::default()
                }
            }
        }
    }
}

/// 编码器能力探测器
pub struct CapabilityProbe {
    runner: Arc<dyn ProbeRunner>,
    timeout: Duration,
}

impl CapabilityProbe {
    pub fn new(runner: Arc<dyn ProbeRunner>, timeout: Duration) -> Self {
        Self { runner, timeout }
    }

    /// 探测所有后端
    pub async fn run(&self) -> EncoderCapabilities {
        let ffmpeg = self.select(&EncoderId::FFMPEG_CANDIDATES).await;
        let gstreamer = self.select(&EncoderId::GST_CANDIDATES).await;

        let cuda_colorspace = if ffmpeg == Some(EncoderId::FfmpegNvenc) {
            let supported = self.try_encode(EncoderId::FfmpegNvenc, true).await;
            if supported {
                info!("GPU colorspace conversion available");
            } else {
                info!("GPU colorspace conversion unavailable, using CPU conversion");
            }
            supported
        } else {
            false
        };

        let capabilities = EncoderCapabilities {
            ffmpeg,
            gstreamer,
            cuda_colorspace,
        };
        info!(
            "Encoder capabilities: ffmpeg={:?}, gstreamer={:?}, cuda_colorspace={}",
            capabilities.ffmpeg, capabilities.gstreamer, capabilities.cuda_colorspace
        );
        capabilities
    }

    async fn select(&self, candidates: &[EncoderId]) -> Option<EncoderId> {
        for &encoder in candidates {
            if self.try_encode(encoder, false).await {
                info!("Encoder probe: {} is available", encoder);
                return Some(encoder);
            }
        }
        error!(
            "No working H.264 encoder found among {:?}; video sources on this backend will fail",
            candidates
        );
        None
    }

    async fn try_encode(&self, encoder: EncoderId, cuda_colorspace: bool) -> bool {
        let invocation = probe_invocation(encoder, cuda_colorspace);
        let input = invocation
            .stdin_frames
            .then(|| probe_frame(probe_input_format(cuda_colorspace)));
        let output = self.runner.run(&invocation, input, self.timeout).await;
        if output.produced_output() {
            return true;
        }
        let stderr: String = output.stderr.chars().take(200).collect();
        debug!(
            "Probe {} (cuda={}) failed: {}",
            encoder, cuda_colorspace, stderr
        );
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// 只有指定编码器能成功的假探测器
    struct FakeRunner {
        working: Vec<&'static str>,
        cuda: bool,
        calls: Mutex<Vec<String>>,
    }

    impl FakeRunner {
        fn new(working: &[&'static str], cuda: bool) -> Arc<Self> {
            Arc::new(Self {
                working: working.to_vec(),
                cuda,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ProbeRunner for FakeRunner {
        async fn run(&self, invocation: &Invocation, input: Option<Vec<u8>>, _timeout: Duration) -> ProbeOutput {
            let line = invocation.to_string();
            self.calls.lock().unwrap().push(line.clone());

            if invocation.stdin_frames {
                let expected = match invocation.arg_value("-pix_fmt") {
                    Some("bgr24") => 256 * 256 * 3,
                    _ => 98_304,
                };
                assert_eq!(input.map(|i| i.len()), Some(expected));
            }
            let uses_cuda = line.contains("hwupload_cuda");
            let works = self.working.iter().any(|name| {
                line.split_whitespace().any(|arg| arg == *name)
            }) && (!uses_cuda || self.cuda);

            ProbeOutput {
                success: works,
                stdout: if works { vec![0, 0, 0, 1, 0x67] } else { Vec::new() },
                stderr: String::new(),
            }
        }
    }

    #[tokio::test]
    async fn test_prefers_hardware() {
        let runner = FakeRunner::new(&["h264_qsv", "libx264", "vaapih264enc", "x264enc"], false);
        let probe = CapabilityProbe::new(runner.clone(), Duration::from_secs(1));
        let caps = probe.run().await;

        assert_eq!(caps.ffmpeg, Some(EncoderId::FfmpegQsv));
        assert_eq!(caps.gstreamer, Some(EncoderId::GstVaapi));
        assert!(!caps.cuda_colorspace);
        // nvenc 没选中，不做色彩空间探测
        assert!(!runner.calls().iter().any(|c| c.contains("hwupload_cuda")));
    }

    #[tokio::test]
    async fn test_software_fallback() {
        let runner = FakeRunner::new(&["libx264", "x264enc"], false);
        let caps = CapabilityProbe::new(runner, Duration::from_secs(1)).run().await;

        assert_eq!(caps.ffmpeg, Some(EncoderId::FfmpegX264));
        assert_eq!(caps.gstreamer, Some(EncoderId::GstX264));
        assert_eq!(caps.encoder_for(Backend::Ffmpeg).unwrap().max_fps(), 10);
    }

    #[tokio::test]
    async fn test_cuda_colorspace_probe() {
        let runner = FakeRunner::new(&["h264_nvenc", "nvh264enc"], true);
        let caps = CapabilityProbe::new(runner.clone(), Duration::from_secs(1)).run().await;
        assert_eq!(caps.ffmpeg, Some(EncoderId::FfmpegNvenc));
        assert!(caps.cuda_colorspace);
        // 滤镜探测送入 bgr24，与原始帧管道一致
        let filter_call = runner
            .calls()
            .into_iter()
            .find(|c| c.contains("hwupload_cuda"))
            .unwrap();
        assert!(filter_call.contains("-pix_fmt bgr24"));

        let runner = FakeRunner::new(&["h264_nvenc", "nvh264enc"], false);
        let caps = CapabilityProbe::new(runner, Duration::from_secs(1)).run().await;
        assert_eq!(caps.ffmpeg, Some(EncoderId::FfmpegNvenc));
        assert!(!caps.cuda_colorspace);
    }

    #[tokio::test]
    async fn test_nothing_works() {
        let runner = FakeRunner::new(&[], false);
        let caps = CapabilityProbe::new(runner.clone(), Duration::from_secs(1)).run().await;

        assert_eq!(caps, EncoderCapabilities::none());
        assert!(matches!(
            caps.encoder_for(Backend::Ffmpeg),
            Err(StreamError::NoEncoderAvailable)
        ));
        // 每个候选都试过一次
        assert_eq!(runner.calls().len(), 8);
    }
}
