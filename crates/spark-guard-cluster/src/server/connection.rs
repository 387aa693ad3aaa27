//! 命名空间与已连接客户端的对应关系。
//!
//! `AVG_LOCAL` 阈值依赖“命名空间内当前连接的客户端数”，连接在 PING 时登记，
//! 断开时注销。一个客户端地址同一时刻只属于一个命名空间，重复 PING 以最后一次为准。

use std::collections::HashSet;

use dashmap::DashMap;
use tracing::debug;

#[derive(Debug, Default)]
pub struct ConnectionManager {
    groups: DashMap<String, HashSet<String>>,
    by_address: DashMap<String, String>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 预先登记命名空间，使其在没有客户端时也可被查询。
    pub fn register_namespace(&self, namespace: &str) {
        self.groups.entry(namespace.to_owned()).or_default();
    }

    /// 把客户端归入命名空间，返回该命名空间当前的连接数。
    pub fn add(&self, namespace: &str, address: &str) -> usize {
        if let Some(previous) = self
            .by_address
            .insert(address.to_owned(), namespace.to_owned())
            .filter(|previous| previous != namespace)
        {
            if let Some(mut members) = self.groups.get_mut(&previous) {
                members.remove(address);
            }
        }
        let mut members = self.groups.entry(namespace.to_owned()).or_default();
        if members.insert(address.to_owned()) {
            debug!(
                target: "spark.guard.cluster.server",
                namespace,
                address,
                "client joined namespace"
            );
        }
        members.len()
    }

    /// 注销客户端，返回它原先所属的命名空间。
    pub fn remove(&self, address: &str) -> Option<String> {
        let (_, namespace) = self.by_address.remove(address)?;
        if let Some(mut members) = self.groups.get_mut(&namespace) {
            members.remove(address);
        }
        Some(namespace)
    }

    pub fn connected_count(&self, namespace: &str) -> usize {
        self.groups
            .get(namespace)
            .map_or(0, |members| members.len())
    }

    pub fn namespace_of(&self, address: &str) -> Option<String> {
        self.by_address.get(address).map(|ns| ns.clone())
    }

    pub fn namespaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self.groups.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_ping_moves_client_between_namespaces() {
        let manager = ConnectionManager::new();
        assert_eq!(manager.add("orders", "10.0.0.1:5000"), 1);
        assert_eq!(manager.add("orders", "10.0.0.2:5000"), 2);
        assert_eq!(manager.add("orders", "10.0.0.2:5000"), 2, "重复 PING 不重复计数");

        assert_eq!(manager.add("billing", "10.0.0.2:5000"), 1);
        assert_eq!(manager.connected_count("orders"), 1);

        assert_eq!(manager.remove("10.0.0.2:5000").as_deref(), Some("billing"));
        assert_eq!(manager.connected_count("billing"), 0);
        assert!(manager.remove("10.0.0.2:5000").is_none());
    }
}
