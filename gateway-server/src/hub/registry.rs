// 订阅注册表
//
// 记录每个数据源被哪些客户端订阅（引用计数即兴趣集合大小）。
// 纯数据结构，只由 Hub 任务持有；启动、停止会话由调用方根据
// 返回的 Transition 决定。

use common::{ClientId, SourceKey};
use std::collections::{BTreeSet, HashMap, HashSet};

/// 单个订阅的参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubscriptionParams {
    pub max_update_rate: f64,
}

/// 单个客户端的订阅快照，由连接任务维护
pub type ClientSubscriptions = HashMap<SourceKey, SubscriptionParams>;

/// 数据源兴趣集合的变化
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// 第一个订阅者出现
    Activated,
    Unchanged,
    /// 最后一个订阅者离开
    Deactivated,
}

/// 对账结果
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReconcileReport {
    pub added: usize,
    pub removed: usize,
    pub updated: usize,
    pub activated: Vec<SourceKey>,
    pub deactivated: Vec<SourceKey>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.added == 0 && self.removed == 0 && self.updated == 0
    }
}

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    /// 数据源 → 订阅者
    interest: HashMap<SourceKey, HashSet<ClientId>>,
    /// 客户端 → 订阅
    entries: HashMap<ClientId, ClientSubscriptions>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加或更新订阅
    pub fn subscribe(&mut self, client: ClientId, source: SourceKey, params: SubscriptionParams) -> Transition {
        self.entries
            .entry(client)
            .or_default()
            .insert(source.clone(), params);
        let clients = self.interest.entry(source).or_default();
        let first = clients.is_empty();
        if clients.insert(client) && first {
            Transition::Activated
        } else {
            Transition::Unchanged
        }
    }

    pub fn unsubscribe(&mut self, client: ClientId, source: &str) -> Transition {
        if let Some(subscriptions) = self.entries.get_mut(&client) {
            subscriptions.remove(source);
            if subscriptions.is_empty() {
                self.entries.remove(&client);
            }
        }
        let Some(clients) = self.interest.get_mut(source) else {
            return Transition::Unchanged;
        };
        if !clients.remove(&client) {
            return Transition::Unchanged;
        }
        if clients.is_empty() {
            self.interest.remove(source);
            Transition::Deactivated
        } else {
            Transition::Unchanged
        }
    }

    /// 一次性移除客户端的全部订阅，返回失去最后订阅者的数据源
    pub fn on_client_disconnect(&mut self, client: ClientId) -> Vec<SourceKey> {
        let Some(subscriptions) = self.entries.remove(&client) else {
            return Vec::new();
        };
        let mut deactivated = Vec::new();
        for source in subscriptions.into_keys() {
            if let Some(clients) = self.interest.get_mut(&source) {
                clients.remove(&client);
                if clients.is_empty() {
                    self.interest.remove(&source);
                    deactivated.push(source);
                }
            }
        }
        deactivated.sort();
        deactivated
    }

    /// 用各连接的权威快照重建注册表，修正增量路径遗漏的变化
    pub fn reconcile(&mut self, desired: &HashMap<ClientId, ClientSubscriptions>) -> ReconcileReport {
        let before: BTreeSet<SourceKey> = self.interest.keys().cloned().collect();
        let mut report = ReconcileReport::default();

        for (client, current) in &self.entries {
            let wanted = desired.get(client);
            for (source, params) in current {
                match wanted.and_then(|w| w.get(source)) {
                    None => report.removed += 1,
                    Some(p) if p != params => report.updated += 1,
                    Some(_) => {}
                }
            }
        }
        for (client, wanted) in desired {
            let current = self.entries.get(client);
            report.added += wanted
                .keys()
                .filter(|source| current.map_or(true, |c| !c.contains_key(*source)))
                .count();
        }

        self.entries = desired
            .iter()
            .filter(|(_, subscriptions)| !subscriptions.is_empty())
            .map(|(client, subscriptions)| (*client, subscriptions.clone()))
            .collect();
        self.interest.clear();
        for (client, subscriptions) in &self.entries {
            for source in subscriptions.keys() {
                self.interest.entry(source.clone()).or_default().insert(*client);
            }
        }

        let after: BTreeSet<SourceKey> = self.interest.keys().cloned().collect();
        report.activated = after.difference(&before).cloned().collect();
        report.deactivated = before.difference(&after).cloned().collect();
        report
    }

    /// 订阅该数据源的客户端（排序后返回）
    pub fn interested(&self, source: &str) -> Vec<ClientId> {
        let mut clients: Vec<ClientId> = self
            .interest
            .get(source)
            .map(|clients| clients.iter().copied().collect())
            .unwrap_or_default();
        clients.sort();
        clients
    }

    pub fn client_count(&self, source: &str) -> usize {
        self.interest.get(source).map_or(0, HashSet::len)
    }

    pub fn active_sources(&self) -> impl Iterator<Item = &SourceKey> {
        self.interest.keys()
    }

    pub fn is_active(&self, source: &str) -> bool {
        self.interest.contains_key(source)
    }

    pub fn entries_for(&self, client: ClientId) -> Option<&ClientSubscriptions> {
        self.entries.get(&client)
    }

    pub fn params(&self, client: ClientId, source: &str) -> Option<SubscriptionParams> {
        self.entries.get(&client).and_then(|s| s.get(source)).copied()
    }

    /// 两个索引互相一致，且没有空集合
    pub fn is_consistent(&self) -> bool {
        let forward = self.entries.iter().all(|(client, subscriptions)| {
            !subscriptions.is_empty()
                && subscriptions
                    .keys()
                    .all(|source| self.interest.get(source).is_some_and(|c| c.contains(client)))
        });
        let backward = self.interest.iter().all(|(source, clients)| {
            !clients.is_empty()
                && clients
                    .iter()
                    .all(|client| self.entries.get(client).is_some_and(|s| s.contains_key(source)))
        });
        forward && backward
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn params(rate: f64) -> SubscriptionParams {
        SubscriptionParams { max_update_rate: rate }
    }

    fn key(name: &str) -> SourceKey {
        SourceKey::from(name)
    }

    #[test]
    fn test_refcount_transitions() {
        let mut registry = SubscriptionRegistry::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        assert_eq!(registry.subscribe(a, key("cam1"), params(10.0)), Transition::Activated);
        assert_eq!(registry.subscribe(b, key("cam1"), params(5.0)), Transition::Unchanged);
        // 重复订阅只更新参数
        assert_eq!(registry.subscribe(a, key("cam1"), params(20.0)), Transition::Unchanged);
        assert_eq!(registry.client_count("cam1"), 2);
        assert_eq!(registry.params(a, "cam1"), Some(params(20.0)));

        assert_eq!(registry.unsubscribe(a, "cam1"), Transition::Unchanged);
        assert_eq!(registry.unsubscribe(a, "cam1"), Transition::Unchanged);
        assert_eq!(registry.unsubscribe(b, "cam1"), Transition::Deactivated);
        assert!(!registry.is_active("cam1"));
        assert!(registry.is_consistent());
    }

    #[test]
    fn test_disconnect_removes_everything() {
        let mut registry = SubscriptionRegistry::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        registry.subscribe(a, key("/gps"), params(1.0));
        registry.subscribe(a, key("/imu"), params(1.0));
        registry.subscribe(b, key("/imu"), params(1.0));

        let deactivated = registry.on_client_disconnect(a);
        assert_eq!(deactivated, vec![key("/gps")]);
        assert!(registry.entries_for(a).is_none());
        assert_eq!(registry.interested("/imu"), vec![b]);
        assert!(registry.is_consistent());

        // 断开后立即对账不会发现残留
        let desired = HashMap::from([(b, ClientSubscriptions::from([(key("/imu"), params(1.0))]))]);
        let report = registry.reconcile(&desired);
        assert!(report.is_clean());
        assert!(report.activated.is_empty() && report.deactivated.is_empty());
    }

    #[test]
    fn test_reconcile_corrects_drift() {
        let mut registry = SubscriptionRegistry::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        registry.subscribe(a, key("/stale"), params(1.0));
        registry.subscribe(a, key("/kept"), params(1.0));

        let desired = HashMap::from([
            (
                a,
                ClientSubscriptions::from([(key("/kept"), params(2.0)), (key("/new"), params(1.0))]),
            ),
            (b, ClientSubscriptions::new()),
        ]);
        let report = registry.reconcile(&desired);

        assert_eq!(report.added, 1);
        assert_eq!(report.removed, 1);
        assert_eq!(report.updated, 1);
        assert_eq!(report.activated, vec![key("/new")]);
        assert_eq!(report.deactivated, vec![key("/stale")]);
        assert!(registry.entries_for(b).is_none());
        assert!(registry.is_consistent());
    }

    #[test]
    fn test_interest_matches_union_for_random_sequences() {
        let clients: Vec<ClientId> = (0..4).map(|_| Uuid::new_v4()).collect();
        let mut registry = SubscriptionRegistry::new();
        let mut model: HashMap<ClientId, HashSet<&str>> = HashMap::new();

        // 固定种子的线性同余序列
        let mut seed: u64 = 0x5eed;
        for _ in 0..500 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let client = clients[(seed >> 33) as usize % clients.len()];
            let op = (seed >> 40) % 5;
            let before = model.values().any(|s| s.contains("cam1"));
            let transition = match op {
                0 | 1 => {
                    model.entry(client).or_default().insert("cam1");
                    registry.subscribe(client, key("cam1"), params(10.0))
                }
                2 | 3 => {
                    if let Some(s) = model.get_mut(&client) {
                        s.remove("cam1");
                    }
                    registry.unsubscribe(client, "cam1")
                }
                _ => {
                    let had = model.remove(&client).is_some_and(|s| s.contains("cam1"));
                    let deactivated = registry.on_client_disconnect(client);
                    if had && !model.values().any(|s| s.contains("cam1")) {
                        Transition::Deactivated
                    } else {
                        assert!(deactivated.is_empty());
                        Transition::Unchanged
                    }
                }
            };
            let after = model.values().any(|s| s.contains("cam1"));

            assert_eq!(registry.is_active("cam1"), after);
            let expected = match (before, after) {
                (false, true) => Transition::Activated,
                (true, false) => Transition::Deactivated,
                _ => Transition::Unchanged,
            };
            assert_eq!(transition, expected);
            assert!(registry.is_consistent());
        }
    }
}
