use serde::Serialize;
use std::time::{Duration, Instant};

/// 未应答 ping 的环形缓冲区大小
pub const PING_RING_SIZE: usize = 1024;

/// 单个客户端连接的往返延迟跟踪
///
/// 每次 ping 分配一个递增 token，发送时间记在 `token % 1024` 槽位；
/// pong 带回 token 后计算 RTT。过期太久的 token 会被新 ping 覆盖。
#[derive(Debug)]
pub struct LatencyTracker {
    sent: Vec<Option<(u64, Instant)>>,
    next_token: u64,
    stats: LatencyStats,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencyStats {
    pub samples: u64,
    pub last_rtt_ms: Option<f64>,
    pub min_rtt_ms: Option<f64>,
    pub max_rtt_ms: Option<f64>,
    total_rtt_ms: f64,
}

impl LatencyStats {
    pub fn average_rtt_ms(&self) -> Option<f64> {
        (self.samples > 0).then(|| self.total_rtt_ms / self.samples as f64)
    }

    fn record(&mut self, rtt_ms: f64) {
        self.samples += 1;
        self.total_rtt_ms += rtt_ms;
        self.last_rtt_ms = Some(rtt_ms);
        self.min_rtt_ms = Some(self.min_rtt_ms.map_or(rtt_ms, |m| m.min(rtt_ms)));
        self.max_rtt_ms = Some(self.max_rtt_ms.map_or(rtt_ms, |m| m.max(rtt_ms)));
    }
}

impl LatencyTracker {
    pub fn new() -> Self {
        Self {
            sent: vec![None; PING_RING_SIZE],
            next_token: 0,
            stats: LatencyStats::default(),
        }
    }

    /// 记录一次 ping 的发送，返回 token
    pub fn next_ping(&mut self, now: Instant) -> u64 {
        let token = self.next_token;
        self.next_token = self.next_token.wrapping_add(1);
        self.sent[slot(token)] = Some((token, now));
        token
    }

    /// 处理 pong；token 未知或已被覆盖时返回 None
    pub fn on_pong(&mut self, token: u64, now: Instant) -> Option<Duration> {
        let entry = self.sent.get_mut(slot(token))?;
        match *entry {
            Some((sent_token, sent_at)) if sent_token == token => {
                *entry = None;
                let rtt = now.saturating_duration_since(sent_at);
                self.stats.record(rtt.as_secs_f64() * 1000.0);
                Some(rtt)
            }
            _ => None,
        }
    }

    /// 单程延迟估计（RTT 的一半），尚无测量时为 0
    pub fn one_way_ms(&self) -> f64 {
        self.stats.last_rtt_ms.map_or(0.0, |rtt| rtt / 2.0)
    }

    pub fn stats(&self) -> LatencyStats {
        self.stats
    }
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn slot(token: u64) -> usize {
    (token % PING_RING_SIZE as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let mut tracker = LatencyTracker::new();
        let start = Instant::now();

        let token = tracker.next_ping(start);
        assert_eq!(tracker.one_way_ms(), 0.0);

        let rtt = tracker.on_pong(token, start + Duration::from_millis(40)).unwrap();
        assert_eq!(rtt, Duration::from_millis(40));
        assert!((tracker.one_way_ms() - 20.0).abs() < 1e-6);

        // 同一个 token 只能应答一次
        assert!(tracker.on_pong(token, start + Duration::from_millis(50)).is_none());
    }

    #[test]
    fn test_unknown_and_overwritten_tokens() {
        let mut tracker = LatencyTracker::new();
        let start = Instant::now();
        assert!(tracker.on_pong(99, start).is_none());

        let first = tracker.next_ping(start);
        for _ in 0..PING_RING_SIZE {
            tracker.next_ping(start);
        }
        // 第一个 token 的槽位已被覆盖
        assert!(tracker.on_pong(first, start).is_none());
        assert!(tracker.on_pong(PING_RING_SIZE as u64, start).is_some());
    }

    #[test]
    fn test_stats() {
        let mut tracker = LatencyTracker::new();
        let start = Instant::now();
        for rtt in [10u64, 30, 20] {
            let token = tracker.next_ping(start);
            tracker.on_pong(token, start + Duration::from_millis(rtt));
        }
        let stats = tracker.stats();
        assert_eq!(stats.samples, 3);
        assert_eq!(stats.min_rtt_ms, Some(10.0));
        assert_eq!(stats.max_rtt_ms, Some(30.0));
        assert_eq!(stats.last_rtt_ms, Some(20.0));
        assert!((stats.average_rtt_ms().unwrap() - 20.0).abs() < 1e-6);
    }
}
