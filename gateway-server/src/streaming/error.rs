// 实时视频网关 - 错误类型定义
//
// 本模块定义了流会话生命周期中可能出现的错误类型，
// 以及子进程崩溃后的重试退避策略。

use std::io;
use std::time::Duration;
use thiserror::Error;

/// 流错误类型
#[derive(Debug, Clone, Error)]
pub enum StreamError {
    // ========== 能力错误 ==========
    /// 没有可用的编码器（软件编码器探测也失败）
    #[error("No usable encoder available")]
    NoEncoderAvailable,

    // ========== 资源错误 ==========
    /// 数据源不存在
    #[error("Source not found: {0}")]
    SourceNotFound(String),

    /// 不支持的像素格式
    #[error("Unsupported pixel encoding: {0}")]
    UnsupportedFormat(String),

    // ========== 管道错误 ==========
    /// 子进程启动失败
    #[error("Failed to spawn encoder process: {0}")]
    SpawnFailed(String),

    /// 子进程意外退出
    #[error("Encoder process exited unexpectedly (code: {0:?})")]
    PipelineExited(Option<i32>),

    /// 重试次数耗尽
    #[error("Restart budget exhausted after {0} attempts")]
    RetriesExhausted(u32),

    // ========== 其他错误 ==========
    /// IO错误
    #[error("IO error: {0}")]
    Io(String),
}

impl StreamError {
    /// 能力错误：对该数据源永久致命
    pub fn is_capability(&self) -> bool {
        matches!(self, StreamError::NoEncoderAvailable)
    }
}

/// 重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    /// 立即重试
    Immediate,
    /// 指数退避
    ExponentialBackoff,
    /// 线性退避
    LinearBackoff,
}

/// 错误恢复策略配置
#[derive(Debug, Clone)]
pub struct ErrorRecoveryPolicy {
    /// 最大重试次数
    pub max_retries: u32,
    /// 重试策略
    pub retry_strategy: RetryStrategy,
    /// 基础退避时间
    pub backoff_base: Duration,
    /// 最大退避时间
    pub backoff_max: Duration,
}

impl Default for ErrorRecoveryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_strategy: RetryStrategy::ExponentialBackoff,
            backoff_base: Duration::from_secs(2),
            backoff_max: Duration::from_secs(30),
        }
    }
}

impl ErrorRecoveryPolicy {
    /// 子进程崩溃重启使用的策略
    pub fn for_restarts(max_retries: u32, cooldown: Duration) -> Self {
        Self {
            max_retries,
            retry_strategy: RetryStrategy::ExponentialBackoff,
            backoff_base: cooldown,
            backoff_max: cooldown.saturating_mul(8).max(Duration::from_secs(1)),
        }
    }

    /// 计算重试延迟
    ///
    /// # 参数
    ///
    /// - `attempt`: 当前重试次数（从0开始）
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        match self.retry_strategy {
            RetryStrategy::Immediate => Duration::from_millis(0),

            RetryStrategy::LinearBackoff => {
                let delay = self.backoff_base.saturating_mul(attempt + 1);
                delay.min(self.backoff_max)
            }

            RetryStrategy::ExponentialBackoff => {
                let multiplier = 2u32.saturating_pow(attempt);
                let delay = self.backoff_base.saturating_mul(multiplier);
                delay.min(self.backoff_max)
            }
        }
    }

    /// 判断是否应该重试
    ///
    /// 只有瞬时管道错误可以重试（包括重试时启动失败，如设备忙）；
    /// 能力错误和资源错误直接失败。
    pub fn should_retry(&self, error: &StreamError, attempt: u32) -> bool {
        if attempt >= self.max_retries {
            return false;
        }

        matches!(
            error,
            StreamError::PipelineExited(_) | StreamError::SpawnFailed(_) | StreamError::Io(_)
        )
    }
}

/// 错误转换：从 std::io::Error
impl From<io::Error> for StreamError {
    fn from(error: io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::NotFound => StreamError::SpawnFailed(error.to_string()),
            io::ErrorKind::BrokenPipe => StreamError::PipelineExited(None),
            _ => StreamError::Io(error.to_string()),
        }
    }
}
