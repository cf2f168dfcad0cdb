// 编码子进程管理
//
// 会话只通过 ProcessSpawner 启动外部进程，测试中可以替换成内存实现。
// 终止流程：先发 SIGTERM，宽限期内没退出再强制杀死。

use crate::encoder::Invocation;
use crate::streaming::StreamError;
use async_trait::async_trait;
use common::SourceKey;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// 已启动的子进程
pub struct SpawnedProcess {
    /// 原始帧输入（只有 ffmpeg 管道有）
    pub stdin: Option<BoxedWriter>,
    /// 编码数据输出
    pub stdout: BoxedReader,
    pub stderr: Option<BoxedReader>,
    pub control: Box<dyn ProcessControl>,
}

/// 子进程生命周期控制
#[async_trait]
pub trait ProcessControl: Send {
    fn id(&self) -> Option<u32>;

    /// 优雅终止，超过宽限期后强制杀死；返回退出码
    async fn terminate(&mut self, grace: Duration) -> Option<i32>;
}

/// 子进程启动器
pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, invocation: &Invocation) -> Result<SpawnedProcess, StreamError>;
}

/// 基于 tokio::process 的启动器
#[derive(Debug, Default, Clone)]
pub struct CommandSpawner;

impl ProcessSpawner for CommandSpawner {
    fn spawn(&self, invocation: &Invocation) -> Result<SpawnedProcess, StreamError> {
        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(if invocation.stdin_frames {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| StreamError::SpawnFailed(format!("{}: {}", invocation.program, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| StreamError::SpawnFailed("stdout not captured".to_string()))?;
        let stdin = child
            .stdin
            .take()
            .map(|stdin| Box::new(stdin) as BoxedWriter);
        let stderr = child
            .stderr
            .take()
            .map(|stderr| Box::new(stderr) as BoxedReader);

        debug!("Spawned {} (pid {:?})", invocation.program, child.id());
        Ok(SpawnedProcess {
            stdin,
            stdout: Box::new(stdout),
            stderr,
            control: Box::new(ChildControl { child }),
        })
    }
}

struct ChildControl {
    child: Child,
}

#[async_trait]
impl ProcessControl for ChildControl {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn terminate(&mut self, grace: Duration) -> Option<i32> {
        if let Ok(Some(status)) = self.child.try_wait() {
            return status.code();
        }

        let pid = self.child.id();
        send_terminate(&mut self.child);
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!("Process {:?} exited with {}", pid, status);
                status.code()
            }
            Ok(Err(e)) => {
                warn!("Failed to wait for process {:?}: {}", pid, e);
                None
            }
            Err(_) => {
                warn!(
                    "Process {:?} ignored SIGTERM for {:?}, killing",
                    pid, grace
                );
                if let Err(e) = self.child.kill().await {
                    warn!("Failed to kill process {:?}: {}", pid, e);
                }
                None
            }
        }
    }
}

#[cfg(unix)]
fn send_terminate(child: &mut Child) {
    let delivered = child.id().is_some_and(sigterm);
    if !delivered {
        let _ = child.start_kill();
    }
}

/// 发送 SIGTERM，成功返回 true
#[cfg(unix)]
fn sigterm(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: kill(2) 不访问内存；pid 来自尚未回收的子进程，不会指向其他进程
    unsafe { libc::kill(pid, libc::SIGTERM) == 0 }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) {
    let _ = child.start_kill();
}

/// 逐行读取子进程 stderr 并记录日志
pub fn spawn_stderr_logger(source: SourceKey, stderr: BoxedReader) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if !line.is_empty() {
                        warn!("[{}] {}", source, line);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!("[{}] stderr closed: {}", source, e);
                    break;
                }
            }
        }
        info!("[{}] encoder stderr closed", source);
    })
}

/// 内存中的假进程，测试用
#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_util::sync::CancellationToken;

    /// 摄像头假进程输出的数据块
    pub const CAMERA_CHUNK: &[u8] = &[0, 0, 0, 1, 0x65, 0xaa, 0xbb];

    #[derive(Default)]
    struct FakeState {
        live: AtomicUsize,
        spawned: AtomicUsize,
        crash_next: AtomicUsize,
        fail_next: AtomicUsize,
        invocations: Mutex<Vec<Invocation>>,
    }

    /// stdin 管道原样回显到 stdout；无 stdin 的管道按帧率持续输出固定数据块
    #[derive(Clone, Default)]
    pub struct FakeSpawner {
        state: Arc<FakeState>,
    }

    impl FakeSpawner {
        pub fn new() -> Self {
            Self::default()
        }

        /// 当前存活的进程数
        pub fn live(&self) -> usize {
            self.state.live.load(Ordering::SeqCst)
        }

        pub fn spawned(&self) -> usize {
            self.state.spawned.load(Ordering::SeqCst)
        }

        /// 接下来 n 个进程启动后立即退出
        pub fn crash_next(&self, n: usize) {
            self.state.crash_next.store(n, Ordering::SeqCst);
        }

        /// 接下来 n 次启动直接失败
        pub fn fail_next(&self, n: usize) {
            self.state.fail_next.store(n, Ordering::SeqCst);
        }

        pub fn invocations(&self) -> Vec<Invocation> {
            self.state.invocations.lock().unwrap().clone()
        }
    }

    impl ProcessSpawner for FakeSpawner {
        fn spawn(&self, invocation: &Invocation) -> Result<SpawnedProcess, StreamError> {
            self.state.invocations.lock().unwrap().push(invocation.clone());
            let fail = self
                .state
                .fail_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if fail {
                return Err(StreamError::SpawnFailed(format!(
                    "{}: device busy",
                    invocation.program
                )));
            }
            self.state.spawned.fetch_add(1, Ordering::SeqCst);
            self.state.live.fetch_add(1, Ordering::SeqCst);

            let crash = self
                .state
                .crash_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();

            let (mut stdout_tx, stdout_rx) = tokio::io::duplex(64 * 1024);
            let (stdin, mut stdin_rx) = if invocation.stdin_frames {
                let (tx, rx) = tokio::io::duplex(64 * 1024);
                (Some(Box::new(tx) as BoxedWriter), Some(rx))
            } else {
                (None, None)
            };
            let fps: u64 = invocation
                .args
                .iter()
                .find_map(|arg| {
                    arg.split(',')
                        .find_map(|part| part.strip_prefix("framerate="))
                        .and_then(|rate| rate.trim_end_matches("/1").parse().ok())
                })
                .unwrap_or(30);

            let cancel = CancellationToken::new();
            let token = cancel.clone();
            let state = self.state.clone();
            let task = tokio::spawn(async move {
                if !crash {
                    tokio::select! {
                        _ = token.cancelled() => {}
                        _ = async {
                            match stdin_rx.as_mut() {
                                Some(rx) => {
                                    let mut buf = vec![0u8; 64 * 1024];
                                    loop {
                                        match rx.read(&mut buf).await {
                                            Ok(0) | Err(_) => break,
                                            Ok(n) => {
                                                if stdout_tx.write_all(&buf[..n]).await.is_err() {
                                                    break;
                                                }
                                            }
                                        }
                                    }
                                }
                                None => {
                                    let mut tick = tokio::time::interval(Duration::from_millis(1000 / fps.max(1)));
                                    loop {
                                        tick.tick().await;
                                        if stdout_tx.write_all(CAMERA_CHUNK).await.is_err() {
                                            break;
                                        }
                                    }
                                }
                            }
                        } => {}
                    }
                }
                drop(stdout_tx);
                state.live.fetch_sub(1, Ordering::SeqCst);
            });

            Ok(SpawnedProcess {
                stdin,
                stdout: Box::new(stdout_rx),
                stderr: None,
                control: Box::new(FakeControl {
                    cancel,
                    task: Some(task),
                }),
            })
        }
    }

    struct FakeControl {
        cancel: CancellationToken,
        task: Option<tokio::task::JoinHandle<()>>,
    }

    #[async_trait]
    impl ProcessControl for FakeControl {
        fn id(&self) -> Option<u32> {
            None
        }

        async fn terminate(&mut self, _grace: Duration) -> Option<i32> {
            self.cancel.cancel();
            if let Some(task) = self.task.take() {
                let _ = task.await;
            }
            Some(0)
        }
    }

    impl Drop for FakeControl {
        fn drop(&mut self) {
            self.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::*;
    use super::*;
    use crate::encoder::pipeline::v4l2_info_invocation;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn echo_invocation() -> Invocation {
        Invocation {
            program: "ffmpeg".to_string(),
            args: vec!["-i".to_string(), "pipe:0".to_string()],
            stdin_frames: true,
            stdout_stream: true,
        }
    }

    #[tokio::test]
    async fn test_fake_echo_and_terminate() {
        let spawner = FakeSpawner::new();
        let mut process = spawner.spawn(&echo_invocation()).unwrap();
        assert_eq!(spawner.live(), 1);

        let mut stdin = process.stdin.take().unwrap();
        stdin.write_all(b"frame").await.unwrap();
        let mut buf = [0u8; 5];
        process.stdout.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"frame");

        process.control.terminate(Duration::from_millis(100)).await;
        assert_eq!(spawner.live(), 0);
    }

    #[tokio::test]
    async fn test_fake_crash_closes_stdout() {
        let spawner = FakeSpawner::new();
        spawner.crash_next(1);
        let mut process = spawner.spawn(&echo_invocation()).unwrap();

        let mut buf = Vec::new();
        let n = process.stdout.read_to_end(&mut buf).await.unwrap();
        assert_eq!(n, 0);
        assert_eq!(spawner.live(), 0);
    }

    #[tokio::test]
    async fn test_fake_spawn_failure_is_not_counted() {
        let spawner = FakeSpawner::new();
        spawner.fail_next(1);
        assert!(matches!(
            spawner.spawn(&echo_invocation()),
            Err(StreamError::SpawnFailed(_))
        ));
        assert_eq!(spawner.spawned(), 0);
        assert_eq!(spawner.live(), 0);

        assert!(spawner.spawn(&echo_invocation()).is_ok());
        assert_eq!(spawner.spawned(), 1);
        assert_eq!(spawner.invocations().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_program_fails_to_spawn() {
        let mut invocation = v4l2_info_invocation("/dev/video0");
        invocation.program = "/nonexistent/encoder-binary".to_string();
        let result = CommandSpawner.spawn(&invocation);
        assert!(matches!(result, Err(StreamError::SpawnFailed(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_real_process() {
        let invocation = Invocation {
            program: "sleep".to_string(),
            args: vec!["30".to_string()],
            stdin_frames: false,
            stdout_stream: true,
        };
        let Ok(mut process) = CommandSpawner.spawn(&invocation) else {
            return;
        };
        assert!(process.control.id().is_some());
        let started = std::time::Instant::now();
        process.control.terminate(Duration::from_secs(2)).await;
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[cfg(unix)]
    #[test]
    fn test_sigterm_rejects_out_of_range_pid() {
        assert!(!sigterm(u32::MAX));
    }
}
