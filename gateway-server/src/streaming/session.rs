// 流会话
//
// 每个视频数据源一个会话任务，独占它的编码子进程：
// - 话题原始帧经 ffmpeg 编码，格式从第一帧得知
// - 直连摄像头由 gst-launch 采集编码
// - 已编码的数据原样转发，不启动子进程
//
// 状态：Starting → Running → Restarting → Stopped，外加终态 Failed。
// 分辨率、帧率、编码参数的任何变化都会完整重建子进程。

use crate::catalog::CameraConfig;
use crate::encoder::{self, Backend, EncoderCapabilities, Invocation, PipelineSpec};
use crate::hub::{FrameDisposition, Payload, Router};
use crate::streaming::error::{ErrorRecoveryPolicy, StreamError};
use crate::streaming::framerate::{FrameRateDetector, RateChange};
use crate::streaming::process::{spawn_stderr_logger, BoxedReader, BoxedWriter, ProcessControl, ProcessSpawner};
use bytes::Bytes;
use common::{Quality, RawFormat, SourceKey, StreamMeta};
use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// 子进程连续运行超过这个时间后，崩溃重试计数清零
const STABLE_RUN: Duration = Duration::from_secs(30);

/// 读取子进程输出的缓冲区大小
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// 编码器停止后等待读取任务结束的时间
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// 透传源在 stream-meta 中使用的编码器名
pub const PASSTHROUGH_ENCODER: &str = "passthrough";

pub type SessionId = Uuid;

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Starting,
    Running,
    Restarting,
    Stopped,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

/// 会话种类
#[derive(Debug, Clone, PartialEq)]
pub enum SessionKind {
    /// 话题原始帧，经 ffmpeg 编码
    RawFrames,
    /// 直连摄像头
    Camera(CameraConfig),
    /// 已编码字节，原样转发
    Relay,
}

impl SessionKind {
    pub fn is_passthrough(&self) -> bool {
        match self {
            Self::RawFrames => false,
            Self::Camera(camera) => camera.is_passthrough(),
            Self::Relay => true,
        }
    }

    /// 非透传源在没有编码器时立即失败
    pub fn check_capabilities(&self, caps: &EncoderCapabilities) -> Result<(), StreamError> {
        match self {
            Self::RawFrames => caps.encoder_for(Backend::Ffmpeg).map(|_| ()),
            Self::Camera(camera) if !camera.is_passthrough() => {
                caps.encoder_for(Backend::GStreamer).map(|_| ())
            }
            Self::Camera(_) | Self::Relay => Ok(()),
        }
    }
}

/// 客户端可调的编码参数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamSettings {
    /// 0 表示跟随检测到的源帧率
    pub fps: u32,
    pub quality: Quality,
}

/// 会话运行参数
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// 帧率检测出结果之前假定的源帧率
    pub default_fps: u32,
    pub termination_grace: Duration,
    pub recovery: ErrorRecoveryPolicy,
    /// 生产者到会话之间的帧队列深度
    pub frame_queue_depth: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_fps: 30,
            termination_grace: Duration::from_secs(2),
            recovery: ErrorRecoveryPolicy::default(),
            frame_queue_depth: 2,
        }
    }
}

/// 会话依赖，由 Hub 创建一次后克隆给每个会话
#[derive(Clone)]
pub struct SessionContext {
    pub caps: Arc<EncoderCapabilities>,
    pub spawner: Arc<dyn ProcessSpawner>,
    pub router: Router,
    pub events: mpsc::UnboundedSender<SessionEvent>,
    pub config: SessionConfig,
}

/// 会话上报给 Hub 的事件
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Failed {
        source: SourceKey,
        session: SessionId,
        error: StreamError,
    },
}

#[derive(Debug)]
pub enum SessionCommand {
    Settings(StreamSettings),
    RateChanged(RateChange),
    Stop,
}

/// 生产者送来的一帧（原始帧或已编码数据）
#[derive(Debug, Clone)]
pub struct SourceFrame {
    pub format: Option<RawFormat>,
    pub data: Bytes,
    pub arrival: Instant,
}

/// 会话计数器
#[derive(Debug, Default)]
pub struct SessionStats {
    frames_in: AtomicU64,
    frames_dropped: AtomicU64,
    chunks_out: AtomicU64,
    bytes_out: AtomicU64,
    keyframes: AtomicU64,
    restarts: AtomicU64,
    fps: AtomicU32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStatsSnapshot {
    pub frames_in: u64,
    pub frames_dropped: u64,
    pub chunks_out: u64,
    pub bytes_out: u64,
    pub keyframes: u64,
    pub restarts: u64,
    pub fps: u32,
}

impl SessionStats {
    fn record_chunk(&self, chunk: &[u8]) {
        self.chunks_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        self.keyframes.fetch_add(count_idr_units(chunk), Ordering::Relaxed);
    }

    fn record_drop(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SessionStatsSnapshot {
        SessionStatsSnapshot {
            frames_in: self.frames_in.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            chunks_out: self.chunks_out.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            keyframes: self.keyframes.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
            fps: self.fps.load(Ordering::Relaxed),
        }
    }
}

/// 统计 Annex-B 数据中的 IDR NAL 单元
///
/// 跨数据块边界的起始码会漏计，只用于统计。
fn count_idr_units(chunk: &[u8]) -> u64 {
    chunk
        .windows(4)
        .filter(|w| w[0] == 0 && w[1] == 0 && w[2] == 1 && (w[3] & 0x1f) == 5)
        .count() as u64
}

/// Hub 持有的会话句柄
pub struct SessionHandle {
    id: SessionId,
    source: SourceKey,
    commands: mpsc::UnboundedSender<SessionCommand>,
    state: watch::Receiver<SessionState>,
    stats: Arc<SessionStats>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn source(&self) -> &SourceKey {
        &self.source
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// 状态订阅，用于等待会话结束
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    pub fn stats(&self) -> SessionStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn update_settings(&self, settings: StreamSettings) {
        let _ = self.commands.send(SessionCommand::Settings(settings));
    }

    /// 请求停止；子进程异步终止
    pub fn stop(&self) {
        let _ = self.commands.send(SessionCommand::Stop);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// 等待会话结束，超时后直接中止任务（子进程随之被杀死）
    pub async fn wait(self, timeout: Duration) {
        let mut state = self.state.clone();
        let finished = tokio::time::timeout(timeout, state.wait_for(|s| s.is_terminal()))
            .await
            .is_ok_and(|r| r.is_ok());
        if !finished {
            warn!("Session for {} did not stop within {:?}, aborting", self.source, timeout);
            self.task.abort();
        }
    }
}

/// 会话的生产者一侧，存放在路由表中
///
/// 在生产者上下文中调用：先计数和节流判断，确定要用这一帧后才复制数据。
pub struct SessionFeed {
    frames: mpsc::Sender<SourceFrame>,
    commands: mpsc::UnboundedSender<SessionCommand>,
    detector: FrameRateDetector,
    target_fps: Arc<AtomicU32>,
    pace_to_target: bool,
    last_fed: Option<Instant>,
}

impl SessionFeed {
    pub fn offer(&mut self, now: Instant, format: Option<RawFormat>, data: &[u8]) -> FrameDisposition {
        if let Some(change) = self.detector.observe(now) {
            let _ = self.commands.send(SessionCommand::RateChanged(change));
        }

        if self.pace_to_target {
            let fps = self.target_fps.load(Ordering::Relaxed).max(1);
            // 允许 10% 抖动，否则源帧率等于目标帧率时会隔帧丢弃
            let min_gap = Duration::from_secs_f64(0.9 / fps as f64);
            if let Some(last) = self.last_fed {
                if now.saturating_duration_since(last) < min_gap {
                    return FrameDisposition::Throttled;
                }
            }
        }

        match self.frames.try_reserve() {
            Ok(permit) => {
                permit.send(SourceFrame {
                    format,
                    data: Bytes::copy_from_slice(data),
                    arrival: now,
                });
                self.last_fed = Some(now);
                FrameDisposition::Accepted
            }
            Err(TrySendError::Full(())) => FrameDisposition::QueueFull,
            Err(TrySendError::Closed(())) => FrameDisposition::Closed,
        }
    }
}

/// 一次子进程运行
struct RunningProcess {
    control: Box<dyn ProcessControl>,
    writer: Option<mpsc::Sender<Bytes>>,
    reader: JoinHandle<()>,
    started: tokio::time::Instant,
}

impl RunningProcess {
    fn launch(
        session: SessionId,
        source: &SourceKey,
        stdin: Option<BoxedWriter>,
        stdout: BoxedReader,
        stderr: Option<BoxedReader>,
        control: Box<dyn ProcessControl>,
        router: Router,
        stats: Arc<SessionStats>,
    ) -> Self {
        if let Some(stderr) = stderr {
            spawn_stderr_logger(source.clone(), stderr);
        }

        // 容量为1：编码器跟不上时新帧直接丢弃，不排队
        let writer = stdin.map(|stdin| {
            let (tx, rx) = mpsc::channel(1);
            tokio::spawn(write_frames(source.clone(), stdin, rx));
            tx
        });
        let reader = tokio::spawn(read_output(session, source.clone(), stdout, router, stats));

        Self {
            control,
            writer,
            reader,
            started: tokio::time::Instant::now(),
        }
    }

    fn write(&self, data: Bytes) -> bool {
        match &self.writer {
            Some(writer) => writer.try_send(data).is_ok(),
            None => false,
        }
    }

    async fn shutdown(mut self, grace: Duration) -> Option<i32> {
        // 关闭 stdin，编码器读到 EOF 后自行退出
        self.writer.take();
        let code = self.control.terminate(grace).await;
        if !self.reader.is_finished()
            && tokio::time::timeout(READER_DRAIN_TIMEOUT, &mut self.reader)
                .await
                .is_err()
        {
            self.reader.abort();
        }
        code
    }
}

async fn write_frames(source: SourceKey, mut stdin: BoxedWriter, mut frames: mpsc::Receiver<Bytes>) {
    while let Some(frame) = frames.recv().await {
        if let Err(e) = stdin.write_all(&frame).await {
            debug!("[{}] encoder stdin closed: {}", source, e);
            return;
        }
    }
    let _ = stdin.shutdown().await;
}

async fn read_output(
    session: SessionId,
    source: SourceKey,
    mut stdout: BoxedReader,
    router: Router,
    stats: Arc<SessionStats>,
) {
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match stdout.read(&mut buffer).await {
            Ok(0) => {
                debug!("[{}] encoder output ended (EOF)", source);
                break;
            }
            Ok(n) => {
                let chunk = &buffer[..n];
                stats.record_chunk(chunk);
                router.publish_codec(&source, session, chunk);
            }
            Err(e) => {
                warn!("[{}] failed to read encoder output: {}", source, e);
                break;
            }
        }
    }
}

/// 本次启动使用的参数
struct LaunchPlan {
    invocation: Option<Invocation>,
    meta: StreamMeta,
}

/// 会话任务
pub struct StreamSession {
    id: SessionId,
    source: SourceKey,
    kind: SessionKind,
    ctx: SessionContext,
    settings: StreamSettings,
    /// 原始帧格式，第一帧到达后确定
    format: Option<RawFormat>,
    detected_fps: Option<u32>,
    current_fps: u32,
    target_fps: Arc<AtomicU32>,
    process: Option<RunningProcess>,
    retry_at: Option<tokio::time::Instant>,
    attempt: u32,
    frames: mpsc::Receiver<SourceFrame>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    state: watch::Sender<SessionState>,
    stats: Arc<SessionStats>,
}

impl StreamSession {
    /// 创建并启动会话任务
    ///
    /// `predecessor` 是同一数据源上一个仍在退出中的会话；新会话等它结束后
    /// 才启动子进程，保证每个数据源同时最多一个子进程。
    pub fn spawn(
        source: SourceKey,
        kind: SessionKind,
        settings: StreamSettings,
        ctx: SessionContext,
        predecessor: Option<watch::Receiver<SessionState>>,
    ) -> (SessionHandle, SessionFeed) {
        let id = Uuid::new_v4();
        let (frames_tx, frames_rx) = mpsc::channel(ctx.config.frame_queue_depth.max(1));
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Starting);
        let stats = Arc::new(SessionStats::default());
        let initial_fps = ctx.config.default_fps.max(1);
        let target_fps = Arc::new(AtomicU32::new(initial_fps));
        let pace_to_target = kind == SessionKind::RawFrames;

        let session = StreamSession {
            id,
            source: source.clone(),
            kind,
            ctx,
            settings,
            format: None,
            detected_fps: None,
            current_fps: initial_fps,
            target_fps: target_fps.clone(),
            process: None,
            retry_at: None,
            attempt: 0,
            frames: frames_rx,
            commands: commands_rx,
            state: state_tx,
            stats: stats.clone(),
        };
        // 任务开始前接管路由，旧会话之后的输出都不再投递
        session.ctx.router.claim(&source, id);
        let task = tokio::spawn(session.run(predecessor));

        let handle = SessionHandle {
            id,
            source,
            commands: commands_tx.clone(),
            state: state_rx,
            stats,
            task,
        };
        let feed = SessionFeed {
            frames: frames_tx,
            commands: commands_tx,
            detector: FrameRateDetector::new(),
            target_fps,
            pace_to_target,
            last_fed: None,
        };
        (handle, feed)
    }

    async fn run(mut self, predecessor: Option<watch::Receiver<SessionState>>) {
        if let Some(mut previous) = predecessor {
            debug!("[{}] waiting for previous session to exit", self.source);
            let _ = previous.wait_for(|s| s.is_terminal()).await;
        }

        let outcome = self.supervise().await;
        if let Some(process) = self.process.take() {
            process.shutdown(self.ctx.config.termination_grace).await;
        }

        match outcome {
            Ok(()) => {
                self.set_state(SessionState::Stopped);
                info!("Stream session for {} stopped", self.source);
            }
            Err(error) => {
                self.set_state(SessionState::Failed);
                error!("Stream session for {} failed: {}", self.source, error);
                let _ = self.ctx.events.send(SessionEvent::Failed {
                    source: self.source.clone(),
                    session: self.id,
                    error,
                });
            }
        }
    }

    async fn supervise(&mut self) -> Result<(), StreamError> {
        // 原始帧会话要等第一帧才知道分辨率
        if self.kind != SessionKind::RawFrames {
            self.start()?;
        }

        loop {
            let retry_at = self.retry_at;
            tokio::select! {
                command = self.commands.recv() => match command {
                    None | Some(SessionCommand::Stop) => return Ok(()),
                    Some(SessionCommand::Settings(settings)) => self.apply_settings(settings).await?,
                    Some(SessionCommand::RateChanged(change)) => self.apply_rate(change).await?,
                },
                frame = self.frames.recv() => match frame {
                    // 路由已移除
                    None => return Ok(()),
                    Some(frame) => self.handle_frame(frame).await?,
                },
                _ = output_ended(&mut self.process) => self.handle_exit().await?,
                _ = sleep_until(retry_at), if retry_at.is_some() => {
                    self.retry_at = None;
                    if let Err(error) = self.start() {
                        self.schedule_retry(error)?;
                    }
                }
            }
        }
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("[{}] {:?} -> {:?}", self.source, previous, state);
        }
    }

    /// 按当前参数生成启动计划
    fn plan(&self) -> Result<LaunchPlan, StreamError> {
        let caps = &self.ctx.caps;
        match &self.kind {
            SessionKind::RawFrames => {
                let format = self
                    .format
                    .ok_or_else(|| StreamError::UnsupportedFormat("frame format unknown".to_string()))?;
                let encoder = caps.encoder_for(Backend::Ffmpeg)?;
                let requested = if self.settings.fps > 0 {
                    self.settings.fps
                } else {
                    self.detected_fps.unwrap_or(self.ctx.config.default_fps)
                };
                let fps = requested.clamp(1, encoder.max_fps());
                let invocation = encoder::build(&PipelineSpec::RawFrames {
                    format,
                    encoder,
                    fps,
                    quality: self.settings.quality,
                    cuda_colorspace: caps.cuda_colorspace,
                })?;
                Ok(LaunchPlan {
                    invocation: Some(invocation),
                    meta: self.meta(fps, format.width, format.height, encoder.name(), false),
                })
            }
            SessionKind::Camera(camera) if camera.is_passthrough() => {
                let invocation = encoder::build(&PipelineSpec::Camera {
                    camera,
                    encoder: None,
                    fps: camera.fps,
                    quality: Quality::default(),
                })?;
                Ok(LaunchPlan {
                    invocation: Some(invocation),
                    meta: self.meta(camera.fps, camera.width, camera.height, PASSTHROUGH_ENCODER, true),
                })
            }
            SessionKind::Camera(camera) => {
                let encoder = caps.encoder_for(Backend::GStreamer)?;
                let fps = if self.settings.fps > 0 {
                    self.settings.fps
                } else {
                    camera.fps
                };
                let invocation = encoder::build(&PipelineSpec::Camera {
                    camera,
                    encoder: Some(encoder),
                    fps,
                    quality: self.settings.quality,
                })?;
                Ok(LaunchPlan {
                    invocation: Some(invocation),
                    meta: self.meta(fps, camera.width, camera.height, encoder.name(), false),
                })
            }
            SessionKind::Relay => {
                let fps = self.detected_fps.unwrap_or(self.ctx.config.default_fps);
                Ok(LaunchPlan {
                    invocation: None,
                    meta: self.meta(fps, 0, 0, PASSTHROUGH_ENCODER, true),
                })
            }
        }
    }

    fn meta(&self, fps: u32, width: u32, height: u32, encoder: &str, passthrough: bool) -> StreamMeta {
        StreamMeta {
            source: self.source.clone(),
            fps,
            width,
            height,
            encoder: encoder.to_string(),
            passthrough,
        }
    }

    /// 启动子进程（透传源只发布 stream-meta）
    fn start(&mut self) -> Result<(), StreamError> {
        self.set_state(SessionState::Starting);
        let plan = self.plan()?;

        let spawned = match &plan.invocation {
            Some(invocation) => {
                info!("[{}] starting {}", self.source, invocation);
                Some(self.ctx.spawner.spawn(invocation)?)
            }
            None => None,
        };

        self.current_fps = plan.meta.fps;
        self.target_fps.store(plan.meta.fps, Ordering::Relaxed);
        self.stats.fps.store(plan.meta.fps, Ordering::Relaxed);

        // stream-meta 必须先于任何编码数据发出
        match Payload::meta(&plan.meta) {
            Ok(payload) => {
                self.ctx.router.publish_from(&self.source, self.id, payload);
            }
            Err(e) => warn!("[{}] failed to encode stream-meta: {}", self.source, e),
        }

        if let Some(spawned) = spawned {
            self.process = Some(RunningProcess::launch(
                self.id,
                &self.source,
                spawned.stdin,
                spawned.stdout,
                spawned.stderr,
                spawned.control,
                self.ctx.router.clone(),
                self.stats.clone(),
            ));
        }
        self.set_state(SessionState::Running);
        Ok(())
    }

    /// 完整重建子进程
    async fn restart(&mut self, reason: &str) -> Result<(), StreamError> {
        let Some(process) = self.process.take() else {
            // 没有运行中的进程（等待首帧或等待重试），下次启动自然使用新参数
            return Ok(());
        };
        info!("[{}] restarting encoder: {}", self.source, reason);
        self.set_state(SessionState::Restarting);
        process.shutdown(self.ctx.config.termination_grace).await;
        self.stats.restarts.fetch_add(1, Ordering::Relaxed);

        // 重启期间到达的帧直接丢弃
        while self.frames.try_recv().is_ok() {
            self.stats.record_drop();
        }
        self.start()
    }

    async fn apply_settings(&mut self, settings: StreamSettings) -> Result<(), StreamError> {
        if self.kind.is_passthrough() {
            debug!("[{}] ignoring stream settings for passthrough source", self.source);
            return Ok(());
        }
        if settings == self.settings {
            return Ok(());
        }
        self.settings = settings;
        self.restart("stream settings changed").await
    }

    async fn apply_rate(&mut self, change: RateChange) -> Result<(), StreamError> {
        self.detected_fps = Some(change.current);
        match &self.kind {
            SessionKind::RawFrames => {
                if self.process.is_none() || self.settings.fps > 0 {
                    return Ok(());
                }
                let encoder = self.ctx.caps.encoder_for(Backend::Ffmpeg)?;
                let fps = change.current.clamp(1, encoder.max_fps());
                if fps != self.current_fps {
                    self.restart(&format!("source rate {} fps", change.current)).await?;
                }
                Ok(())
            }
            SessionKind::Relay => {
                let plan = self.plan()?;
                self.current_fps = plan.meta.fps;
                self.stats.fps.store(plan.meta.fps, Ordering::Relaxed);
                if let Ok(payload) = Payload::meta(&plan.meta) {
                    self.ctx.router.publish_from(&self.source, self.id, payload);
                }
                Ok(())
            }
            SessionKind::Camera(_) => Ok(()),
        }
    }

    async fn handle_frame(&mut self, frame: SourceFrame) -> Result<(), StreamError> {
        self.stats.frames_in.fetch_add(1, Ordering::Relaxed);
        match &self.kind {
            SessionKind::Relay => {
                self.stats.record_chunk(&frame.data);
                self.ctx.router.publish_codec(&self.source, self.id, &frame.data);
                Ok(())
            }
            SessionKind::Camera(_) => {
                self.stats.record_drop();
                Ok(())
            }
            SessionKind::RawFrames => self.handle_raw_frame(frame).await,
        }
    }

    async fn handle_raw_frame(&mut self, frame: SourceFrame) -> Result<(), StreamError> {
        let Some(format) = frame.format else {
            self.stats.record_drop();
            return Ok(());
        };
        let expected = format.pixel_format.frame_size(format.width, format.height);
        if frame.data.len() != expected || expected == 0 {
            debug!(
                "[{}] dropping frame of {} bytes, expected {} for {}x{}",
                self.source,
                frame.data.len(),
                expected,
                format.width,
                format.height
            );
            self.stats.record_drop();
            return Ok(());
        }

        if self.format != Some(format) {
            let first = self.format.is_none();
            self.format = Some(format);
            if first {
                info!(
                    "[{}] resolved format {}x{} {}",
                    self.source,
                    format.width,
                    format.height,
                    format.pixel_format.ffmpeg_name()
                );
                if self.retry_at.is_none() {
                    self.start()?;
                }
            } else {
                self.restart(&format!("format changed to {}x{}", format.width, format.height))
                    .await?;
            }
        }

        let written = self
            .process
            .as_ref()
            .is_some_and(|process| process.write(frame.data));
        if !written {
            self.stats.record_drop();
        }
        Ok(())
    }

    /// 子进程输出意外结束
    async fn handle_exit(&mut self) -> Result<(), StreamError> {
        let Some(process) = self.process.take() else {
            return Ok(());
        };
        let ran_for = process.started.elapsed();
        let code = process.shutdown(self.ctx.config.termination_grace).await;
        if ran_for >= STABLE_RUN {
            self.attempt = 0;
        }
        self.schedule_retry(StreamError::PipelineExited(code))
    }

    /// 按退避策略安排下一次启动；重试次数用完或错误不可重试时返回错误
    fn schedule_retry(&mut self, error: StreamError) -> Result<(), StreamError> {
        let policy = &self.ctx.config.recovery;
        if !policy.should_retry(&error, self.attempt) {
            if self.attempt < policy.max_retries {
                return Err(error);
            }
            warn!("[{}] {}; giving up", self.source, error);
            return Err(StreamError::RetriesExhausted(self.attempt));
        }

        let delay = policy.calculate_delay(self.attempt);
        self.attempt += 1;
        self.stats.restarts.fetch_add(1, Ordering::Relaxed);
        warn!(
            "[{}] {}; restarting in {:?} (attempt {}/{})",
            self.source, error, delay, self.attempt, policy.max_retries
        );
        self.set_state(SessionState::Starting);
        self.retry_at = Some(tokio::time::Instant::now() + delay);
        Ok(())
    }
}

/// 子进程输出结束时完成；没有子进程时永不完成
async fn output_ended(process: &mut Option<RunningProcess>) {
    match process {
        Some(process) => {
            let _ = (&mut process.reader).await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
