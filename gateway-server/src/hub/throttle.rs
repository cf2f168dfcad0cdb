use common::{ClientId, SourceKey};
use dashmap::DashMap;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct Slot {
    interval: Duration,
    last_sent: Option<Instant>,
}

/// 按（客户端, 数据源）限制发送速率
///
/// 每个客户端对每个数据源有自己的最小发送间隔，超出速率的消息直接丢弃。
/// 由生产者上下文并发调用。
#[derive(Debug)]
pub struct ThrottleGate {
    slots: DashMap<ClientId, HashMap<SourceKey, Slot>>,
    default_interval: Duration,
}

impl ThrottleGate {
    pub fn new(default_rate: f64) -> Self {
        Self {
            slots: DashMap::new(),
            default_interval: interval_for_rate(default_rate),
        }
    }

    /// 设置客户端对某数据源的最大速率，保留上次发送时间
    ///
    /// 速率无效（非正数或非有限值）时使用默认速率。
    pub fn set_rate(&self, client: ClientId, source: &SourceKey, rate: f64) {
        let interval = if rate.is_finite() && rate > 0.0 {
            interval_for_rate(rate)
        } else {
            self.default_interval
        };
        let mut sources = self.slots.entry(client).or_default();
        sources
            .entry(source.clone())
            .and_modify(|slot| slot.interval = interval)
            .or_insert(Slot {
                interval,
                last_sent: None,
            });
    }

    /// 判断现在是否可以向该客户端发送；允许时记录发送时间
    ///
    /// 只有 `set_rate` 会创建记录，未知的（客户端, 数据源）直接放行。
    pub fn admit(&self, client: ClientId, source: &str, now: Instant) -> bool {
        let Some(mut sources) = self.slots.get_mut(&client) else {
            return true;
        };
        let Some(slot) = sources.get_mut(source) else {
            return true;
        };
        match slot.last_sent {
            Some(last) if now.saturating_duration_since(last) < slot.interval => false,
            _ => {
                slot.last_sent = Some(now);
                true
            }
        }
    }

    pub fn remove(&self, client: ClientId, source: &str) {
        if let Some(mut sources) = self.slots.get_mut(&client) {
            sources.remove(source);
        }
    }

    pub fn remove_client(&self, client: ClientId) {
        self.slots.remove(&client);
    }

    pub fn interval(&self, client: ClientId, source: &str) -> Option<Duration> {
        self.slots
            .get(&client)
            .and_then(|sources| sources.get(source).map(|slot| slot.interval))
    }
}

/// 速率（次/秒）转换为最小间隔；非正数视为不限速
pub fn interval_for_rate(rate: f64) -> Duration {
    if rate.is_finite() && rate > 0.0 {
        Duration::from_secs_f64(1.0 / rate)
    } else {
        Duration::ZERO
    }
}
