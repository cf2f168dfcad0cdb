// 帧率检测器实现
//
// 根据帧到达时间估算源的真实帧率，并吸附到一组常用帧率上。
// 每帧只做一次计数，至少积累1秒数据后才计算一次，开销很小。

use std::time::{Duration, Instant};
use tracing::{debug, info};

/// 常用帧率集合，检测结果会吸附到其中最近的一个
pub const CANONICAL_RATES: [u32; 10] = [10, 15, 20, 24, 25, 30, 50, 60, 90, 120];

/// 默认滞回比例：新值的相对距离必须比旧值近20%以上才切换
pub const DEFAULT_HYSTERESIS: f64 = 0.20;

/// 两次计算之间的最短测量窗口
const MEASUREMENT_WINDOW: Duration = Duration::from_secs(1);

/// 锁定帧率变化事件
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateChange {
    /// 变化前锁定的帧率（首次锁定时为 None）
    pub previous: Option<u32>,
    /// 新锁定的帧率
    pub current: u32,
    /// 本次测量的原始帧率
    pub raw_fps: f64,
}

/// 帧率检测器
#[derive(Debug, Clone)]
pub struct FrameRateDetector {
    /// 当前窗口内收到的帧数（窗口起点那一帧计为1）
    count: u64,
    /// 窗口起点
    checkpoint: Option<Instant>,
    /// 当前锁定的标准帧率
    locked: Option<u32>,
    /// 最近一次原始测量值
    last_raw_fps: Option<f64>,
    hysteresis: f64,
}

impl FrameRateDetector {
    /// 创建新的帧率检测器
    pub fn new() -> Self {
        Self::with_hysteresis(DEFAULT_HYSTERESIS)
    }

    pub fn with_hysteresis(hysteresis: f64) -> Self {
        Self {
            count: 0,
            checkpoint: None,
            locked: None,
            last_raw_fps: None,
            hysteresis,
        }
    }

    /// 当前锁定的帧率
    pub fn locked_fps(&self) -> Option<u32> {
        self.locked
    }

    /// 最近一次原始测量值
    pub fn last_raw_fps(&self) -> Option<f64> {
        self.last_raw_fps
    }

    /// 重置检测器状态
    pub fn reset(&mut self) {
        self.count = 0;
        self.checkpoint = None;
        self.locked = None;
        self.last_raw_fps = None;
    }

    /// 记录一帧到达
    ///
    /// 只有锁定的帧率真正发生变化时才返回事件。
    pub fn observe(&mut self, now: Instant) -> Option<RateChange> {
        self.count += 1;

        let checkpoint = match self.checkpoint {
            Some(checkpoint) => checkpoint,
            None => {
                self.checkpoint = Some(now);
                self.count = 1;
                return None;
            }
        };

        let elapsed = now.saturating_duration_since(checkpoint);
        if elapsed < MEASUREMENT_WINDOW {
            return None;
        }

        // 窗口起点那一帧之后共有 count-1 个帧间隔
        let raw_fps = (self.count - 1) as f64 / elapsed.as_secs_f64();
        self.checkpoint = Some(now);
        self.count = 1;
        self.last_raw_fps = Some(raw_fps);

        let candidate = snap_to_canonical(raw_fps);
        let next = match self.locked {
            Some(current) if current == candidate => current,
            Some(current) => {
                let to_new = relative_distance(raw_fps, candidate);
                let to_old = relative_distance(raw_fps, current);
                if to_new < to_old * (1.0 - self.hysteresis) {
                    candidate
                } else {
                    debug!(
                        "Holding {} fps (raw {:.1}, candidate {})",
                        current, raw_fps, candidate
                    );
                    current
                }
            }
            None => candidate,
        };

        if self.locked == Some(next) {
            return None;
        }

        let change = RateChange {
            previous: self.locked,
            current: next,
            raw_fps,
        };
        info!(
            "Detected source frame rate: {:?} -> {} fps (raw: {:.1})",
            change.previous, next, raw_fps
        );
        self.locked = Some(next);
        Some(change)
    }
}

impl Default for FrameRateDetector {
    fn default() -> Self {
        Self::new()
    }
}

fn relative_distance(raw_fps: f64, canonical: u32) -> f64 {
    (raw_fps - canonical as f64).abs() / canonical as f64
}

/// 按相对距离吸附到最近的标准帧率
pub fn snap_to_canonical(raw_fps: f64) -> u32 {
    CANONICAL_RATES
        .iter()
        .copied()
        .min_by(|a, b| {
            relative_distance(raw_fps, *a)
                .partial_cmp(&relative_distance(raw_fps, *b))
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .unwrap_or(CANONICAL_RATES[0])
}
