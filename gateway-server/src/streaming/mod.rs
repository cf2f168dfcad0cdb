// 实时视频网关 - Streaming模块
//
// 视频数据源的流会话：管理编码子进程、按订阅者需求节流、
// 子进程崩溃后按退避策略重启。
//
// # 核心组件
//
// - `StreamSession`: 单个数据源的会话任务
// - `SessionFeed`: 生产者一侧的入口，负责节流和入队
// - `ProcessSpawner`: 外部编码进程的启动接口
// - `FrameRateDetector`: 源帧率检测

pub mod error;
pub mod framerate;
pub mod process;
pub mod session;

// 重新导出核心类型
pub use error::{ErrorRecoveryPolicy, RetryStrategy, StreamError};
pub use framerate::{FrameRateDetector, RateChange};
pub use process::{CommandSpawner, ProcessSpawner};
pub use session::{
    SessionConfig, SessionContext, SessionEvent, SessionFeed, SessionHandle, SessionKind,
    SessionState, SessionStatsSnapshot, StreamSession, StreamSettings,
};
