// 帧率自适应 - 帧率检测模块
//
// 源帧率未知且可能变化（中间件话题、摄像头驱动都不保证），
// 检测器根据帧到达时间估算真实帧率，吸附到标准值并带滞回，
// 锁定值变化时由流会话负责重启编码子进程。

pub mod detector;

pub use detector::{snap_to_canonical, FrameRateDetector, RateChange, CANONICAL_RATES};
